//! Rename and unlink of files that are still open.

mod common;

use std::sync::Arc;

use common::{bridge, names};
use droidfs::BridgeError;
use droidfs::node::NodeId;
use droidfs::remote::memory::MemoryDevice;

#[tokio::test]
async fn rename_keeps_the_open_handle() {
    let dev = Arc::new(MemoryDevice::new());
    dev.put_dir("/sdcard");
    let b = bridge(&dev);

    let (id, _) = b.create("/sdcard/old.txt", 0o644).await.unwrap();
    b.write(id, 0, b"foo").await.unwrap();
    b.rename("/sdcard/old.txt", "/sdcard/new.txt").await.unwrap();
    b.write(id, 3, b"bar").await.unwrap();
    assert_eq!(b.read(id, 0, 64).await.unwrap(), &b"foobar"[..]);

    let listed = names(&b, "/sdcard").await;
    assert!(listed.contains(&"new.txt".to_string()));
    assert!(!listed.contains(&"old.txt".to_string()));

    b.release(id).await.unwrap();
    assert_eq!(dev.contents("/sdcard/new.txt").unwrap(), b"foobar");
    assert!(!dev.exists("/sdcard/old.txt"));
}

#[tokio::test]
async fn rename_over_an_open_file_keeps_its_contents_readable() {
    let dev = Arc::new(MemoryDevice::new());
    dev.put_file("/victim", b"still here");
    dev.put_file("/src", b"replacement");
    let b = bridge(&dev);

    let (victim, _) = b.lookup("/victim").await.unwrap();
    b.open(victim).await.unwrap();
    b.rename("/src", "/victim").await.unwrap();

    assert_eq!(b.read(victim, 0, 64).await.unwrap(), &b"still here"[..]);
    let (now, _) = b.lookup("/victim").await.unwrap();
    assert_ne!(now, victim);
    assert_eq!(dev.contents("/victim").unwrap(), b"replacement");
    b.release(victim).await.unwrap();
}

#[tokio::test]
async fn unlink_while_open() {
    let dev = Arc::new(MemoryDevice::new());
    let b = bridge(&dev);

    let (id, _) = b.create("/doomed", 0o644).await.unwrap();
    b.write(id, 0, b"written before unlink").await.unwrap();
    b.unlink("/doomed").await.unwrap();

    assert!(matches!(
        b.lookup("/doomed").await,
        Err(BridgeError::NotFound { .. })
    ));
    assert!(!dev.exists("/doomed"));
    assert_eq!(
        b.read(id, 0, 64).await.unwrap(),
        &b"written before unlink"[..]
    );
    // writes keep working on the orphan and never reach the device
    b.write(id, 0, b"W").await.unwrap();
    assert_eq!(b.read(id, 0, 1).await.unwrap(), &b"W"[..]);

    b.release(id).await.unwrap();
    b.forget(id, 1);
    assert!(b.nodes().get(id).is_none());
    assert!(!dev.exists("/doomed"));
    assert!(!names(&b, "/").await.contains(&"doomed".to_string()));
}

#[tokio::test]
async fn directory_mutations_refresh_listings() {
    let dev = Arc::new(MemoryDevice::new());
    let b = bridge(&dev);
    b.mkdir("/d", 0o755).await.unwrap();
    let (f, _) = b.create("/d/x", 0o644).await.unwrap();
    b.release(f).await.unwrap();
    assert_eq!(names(&b, "/d").await, vec!["x".to_string()]);

    assert!(matches!(
        b.rmdir("/d").await,
        Err(BridgeError::DirectoryNotEmpty { .. })
    ));
    b.unlink("/d/x").await.unwrap();
    assert!(names(&b, "/d").await.is_empty());
    b.rmdir("/d").await.unwrap();
    assert!(!names(&b, "/").await.contains(&"d".to_string()));
    assert_eq!(b.readdir(NodeId::ROOT).await.unwrap().len(), 0);
}

#[tokio::test]
async fn forgotten_children_stay_listed_and_resolvable() {
    let dev = Arc::new(MemoryDevice::new());
    dev.put_dir("/sdcard");
    dev.put_file("/sdcard/a", b"one");
    dev.put_file("/sdcard/b", b"two!");
    let b = bridge(&dev);
    assert_eq!(names(&b, "/sdcard").await, vec!["a", "b"]);

    let (a, _) = b.lookup("/sdcard/a").await.unwrap();
    b.open(a).await.unwrap();
    b.write(a, 0, b"longer").await.unwrap();
    b.release(a).await.unwrap();
    b.forget(a, 1);
    b.invalidate_cache().await.unwrap();
    assert!(!b.nodes().contains(a));

    assert_eq!(names(&b, "/sdcard").await, vec!["a", "b"]);
    let (again, attr) = b.lookup("/sdcard/a").await.unwrap();
    assert_eq!(attr.size, 6);
    assert_eq!(b.read(again, 0, 16).await.unwrap(), &b"longer"[..]);
}
