#![allow(dead_code)]

use std::sync::Arc;

use droidfs::config::{Config, ConfigRegistry};
use droidfs::engine::Bridge;
use droidfs::remote::Transport;
use droidfs::remote::memory::MemoryDevice;
use droidfs::remote::retry::Retrying;

pub const PAGE: usize = 4096;

pub fn config() -> Arc<ConfigRegistry> {
    Arc::new(ConfigRegistry::new(
        Config::default()
            .with_page_size(PAGE)
            .with_cache_budget(128 * PAGE as u64),
    ))
}

/// Engine straight over an in-memory device.
pub fn bridge(dev: &Arc<MemoryDevice>) -> Arc<Bridge> {
    Bridge::new(config(), dev.clone())
}

/// Engine with the retry layer in front of the device, as a real mount has.
pub fn retrying_bridge(dev: &Arc<MemoryDevice>) -> Arc<Bridge> {
    let config = config();
    let transport: Arc<dyn Transport> = Arc::new(Retrying::new(dev.clone(), config.clone()));
    Bridge::new(config, transport)
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

pub async fn names(b: &Bridge, dir: &str) -> Vec<String> {
    let (id, _) = b.lookup(dir).await.unwrap();
    b.readdir(id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect()
}
