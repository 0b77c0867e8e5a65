//! Read/write behaviour through the engine: round trips, holes and truncation.

mod common;

use std::sync::Arc;

use common::{PAGE, bridge, pattern};
use droidfs::remote::memory::{MemoryDevice, RemoteOp};

#[tokio::test]
async fn round_trip_across_page_boundaries() {
    let dev = Arc::new(MemoryDevice::new());
    let b = bridge(&dev);

    for (i, len) in [100, PAGE, 3 * PAGE + 17].into_iter().enumerate() {
        let path = format!("/f{i}");
        let data = pattern(len);
        let (id, attr) = b.create(&path, 0o644).await.unwrap();
        assert_eq!(attr.size, 0);
        assert_eq!(b.write(id, 0, &data).await.unwrap(), len);
        assert_eq!(b.read(id, 0, len).await.unwrap(), &data[..]);
        assert_eq!(b.getattr(id).await.unwrap().size, len as u64);

        b.release(id).await.unwrap();
        assert_eq!(dev.contents(&path).unwrap(), data);
    }

    // served again from the device after dropping every page
    b.invalidate_cache().await.unwrap();
    let (id, _) = b.lookup("/f2").await.unwrap();
    b.open(id).await.unwrap();
    let before = dev.calls(RemoteOp::Read);
    assert_eq!(b.read(id, 0, 3 * PAGE + 17).await.unwrap(), &pattern(3 * PAGE + 17)[..]);
    assert_eq!(dev.calls(RemoteOp::Read) - before, 4);
}

#[tokio::test]
async fn writes_past_the_end_leave_zero_filled_holes() {
    let dev = Arc::new(MemoryDevice::new());
    let b = bridge(&dev);
    let (id, _) = b.create("/h", 0o644).await.unwrap();

    b.write(id, 1, b"foobar\n").await.unwrap();
    b.write(id, 4, b"com").await.unwrap();
    assert_eq!(b.read(id, 0, 100).await.unwrap(), &b"\0foocom\n"[..]);

    b.flush(id).await.unwrap();
    assert_eq!(dev.contents("/h").unwrap(), b"\0foocom\n");
}

#[tokio::test]
async fn hole_spanning_whole_pages_is_never_fetched() {
    let dev = Arc::new(MemoryDevice::new());
    let b = bridge(&dev);
    let (id, _) = b.create("/sparse", 0o644).await.unwrap();

    b.write(id, 5 * PAGE as u64, b"tail").await.unwrap();
    let all = b.read(id, 0, 6 * PAGE).await.unwrap();
    assert_eq!(all.len(), 5 * PAGE + 4);
    assert!(all[..5 * PAGE].iter().all(|&c| c == 0));
    assert_eq!(&all[5 * PAGE..], b"tail");
    assert_eq!(dev.calls(RemoteOp::Read), 0);
}

#[tokio::test]
async fn truncate_grows_with_zeros_and_shrinks_to_prefix() {
    let dev = Arc::new(MemoryDevice::new());
    let size = 2 * PAGE + 1500;
    let data = pattern(size);
    dev.put_file("/t", &data);
    let b = bridge(&dev);
    let (id, _) = b.lookup("/t").await.unwrap();
    b.open(id).await.unwrap();

    let grown = size + 1024;
    b.truncate(id, grown as u64).await.unwrap();
    assert_eq!(b.getattr(id).await.unwrap().size, grown as u64);
    let read = b.read(id, 0, grown).await.unwrap();
    assert_eq!(&read[..size], &data[..]);
    assert!(read[size..].iter().all(|&c| c == 0));

    let shrunk = size - 1024;
    b.truncate(id, shrunk as u64).await.unwrap();
    assert_eq!(b.getattr(id).await.unwrap().size, shrunk as u64);
    assert_eq!(b.read(id, 0, grown).await.unwrap(), &data[..shrunk]);

    b.release(id).await.unwrap();
    assert_eq!(dev.contents("/t").unwrap(), &data[..shrunk]);
}

#[tokio::test]
async fn shrink_then_grow_does_not_resurrect_old_bytes() {
    let dev = Arc::new(MemoryDevice::new());
    dev.put_file("/r", b"abcdefgh");
    let b = bridge(&dev);
    let (id, _) = b.lookup("/r").await.unwrap();
    b.open(id).await.unwrap();

    b.truncate(id, 2).await.unwrap();
    b.truncate(id, 8).await.unwrap();
    assert_eq!(b.read(id, 0, 8).await.unwrap(), &b"ab\0\0\0\0\0\0"[..]);
    b.release(id).await.unwrap();
    assert_eq!(dev.contents("/r").unwrap(), b"ab\0\0\0\0\0\0");
}
