//! Cache invalidation and retry behaviour seen from the engine.

mod common;

use std::sync::Arc;

use common::{PAGE, bridge, pattern, retrying_bridge};
use droidfs::BridgeError;
use droidfs::remote::memory::{MemoryDevice, RemoteOp};

#[tokio::test]
async fn invalidate_reclaims_and_refetches() {
    let dev = Arc::new(MemoryDevice::new());
    let data = pattern(3 * PAGE);
    dev.put_file("/big", &data);
    let b = bridge(&dev);
    let (id, _) = b.lookup("/big").await.unwrap();
    b.open(id).await.unwrap();

    b.read(id, 0, data.len()).await.unwrap();
    assert_eq!(dev.calls(RemoteOp::Read), 3);
    let cached = b.info().cache_used;
    assert!(cached >= data.len() as u64);

    let reclaimed = b.invalidate_cache().await.unwrap();
    assert!(reclaimed >= data.len() as u64);
    assert_eq!(b.info().cache_used, 0);

    assert_eq!(b.read(id, 0, data.len()).await.unwrap(), &data[..]);
    assert!(dev.calls(RemoteOp::Read) > 3);
}

#[tokio::test]
async fn invalidate_writes_back_dirty_pages_first() {
    let dev = Arc::new(MemoryDevice::new());
    let b = bridge(&dev);
    let (id, _) = b.create("/w", 0o644).await.unwrap();
    b.write(id, 0, b"keep me").await.unwrap();
    b.invalidate_cache().await.unwrap();
    assert_eq!(dev.contents("/w").unwrap(), b"keep me");
    assert_eq!(b.read(id, 0, 7).await.unwrap(), &b"keep me"[..]);
}

#[tokio::test]
async fn timed_out_read_is_retried_transparently() {
    let dev = Arc::new(MemoryDevice::new());
    let data = pattern(PAGE + 10);
    dev.put_file("/flaky", &data);
    dev.put_file("/steady", &data);
    let b = retrying_bridge(&dev);

    let (steady, _) = b.lookup("/steady").await.unwrap();
    b.open(steady).await.unwrap();
    let expected = b.read(steady, 0, data.len()).await.unwrap();
    let clean_reads = dev.calls(RemoteOp::Read);

    let (flaky, _) = b.lookup("/flaky").await.unwrap();
    b.open(flaky).await.unwrap();
    dev.inject(RemoteOp::Read, BridgeError::Timeout);
    let got = b.read(flaky, 0, data.len()).await.unwrap();
    assert_eq!(got, expected);
    // one extra attempt for the page that timed out
    assert_eq!(dev.calls(RemoteOp::Read), 2 * clean_reads + 1);
}

#[tokio::test]
async fn failed_write_back_is_not_retried() {
    let dev = Arc::new(MemoryDevice::new());
    let b = retrying_bridge(&dev);
    let (id, _) = b.create("/out", 0o644).await.unwrap();
    b.write(id, 0, b"payload").await.unwrap();

    dev.inject(RemoteOp::Write, BridgeError::Timeout);
    assert_eq!(b.flush(id).await.unwrap_err(), BridgeError::Timeout);
    assert_eq!(dev.calls(RemoteOp::Write), 1);
    assert_ne!(dev.contents("/out").unwrap(), b"payload");

    // still dirty, so the next flush writes it
    b.flush(id).await.unwrap();
    assert_eq!(dev.calls(RemoteOp::Write), 2);
    assert_eq!(dev.contents("/out").unwrap(), b"payload");

    b.flush(id).await.unwrap();
    assert_eq!(dev.calls(RemoteOp::Write), 2);
}

#[tokio::test]
async fn failed_release_reports_the_error() {
    let dev = Arc::new(MemoryDevice::new());
    let b = bridge(&dev);
    let (id, _) = b.create("/full", 0o644).await.unwrap();
    b.write(id, 0, b"x").await.unwrap();
    dev.inject(RemoteOp::Write, BridgeError::remote(libc::ENOSPC, "no space"));
    assert_eq!(b.release(id).await.unwrap_err().errno(), libc::ENOSPC);
}
