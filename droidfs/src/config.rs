use parking_lot::RwLock;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BridgeError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

pub const DEFAULT_PAGE_SIZE: usize = 128 * KIB as usize; // 128KB
pub const DEFAULT_CACHE_BUDGET: u64 = 256 * MIB; // 256MB
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PORT: u16 = 12345;

pub const MIN_PAGE_SIZE: usize = 64 * KIB as usize;
pub const MAX_PAGE_SIZE: usize = 4 * MIB as usize;
/// The cache budget never drops below this many pages.
pub const MIN_CACHE_PAGES: u64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Pipelined RPC session with the companion process on the device.
    Channel,
    /// One bridge-tool invocation per operation.
    Command,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Channel => f.write_str("channel"),
            TransportMode::Command => f.write_str("command"),
        }
    }
}

impl FromStr for TransportMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "channel" | "server" => Ok(TransportMode::Channel),
            "command" | "adb" => Ok(TransportMode::Command),
            other => Err(BridgeError::InvalidArgument(format!(
                "unknown transport mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub page_size: usize,
    /// Soft limit on resident page bytes. Dirty pages may push past it.
    pub cache_budget: u64,
    /// Freshness window for clean pages and attribute snapshots. Zero disables reuse.
    pub ttl: Duration,
    /// Per-request deadline on the channel transport. Zero disables the deadline.
    pub rpc_timeout: Duration,
    pub log_level: String,
    pub transport_mode: TransportMode,
    pub max_retries: u32,
    pub timeout_reset_threshold: u32,
    pub max_reconnects: u32,
    pub version: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_budget: DEFAULT_CACHE_BUDGET,
            ttl: DEFAULT_TTL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            log_level: "warn".to_string(),
            transport_mode: TransportMode::Channel,
            max_retries: 3,
            timeout_reset_threshold: 3,
            max_reconnects: 5,
            version: 0,
        }
    }
}

impl Config {
    pub fn with_page_size(self, page_size: usize) -> Self {
        Self { page_size, ..self }
    }

    pub fn with_cache_budget(self, cache_budget: u64) -> Self {
        Self {
            cache_budget,
            ..self
        }
    }

    pub fn with_ttl(self, ttl: Duration) -> Self {
        Self { ttl, ..self }
    }

    pub fn with_rpc_timeout(self, rpc_timeout: Duration) -> Self {
        Self {
            rpc_timeout,
            ..self
        }
    }

    pub fn with_log_level(self, log_level: impl Into<String>) -> Self {
        Self {
            log_level: log_level.into(),
            ..self
        }
    }

    pub fn with_transport_mode(self, transport_mode: TransportMode) -> Self {
        Self {
            transport_mode,
            ..self
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn with_timeout_reset_threshold(self, timeout_reset_threshold: u32) -> Self {
        Self {
            timeout_reset_threshold,
            ..self
        }
    }

    pub fn with_max_reconnects(self, max_reconnects: u32) -> Self {
        Self {
            max_reconnects,
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.page_size == 0 {
            return Err(BridgeError::InvalidArgument(
                "page size must be non-zero".into(),
            ));
        }
        if self.cache_budget < self.page_size as u64 {
            return Err(BridgeError::InvalidArgument(format!(
                "cache budget {} is smaller than one page ({})",
                self.cache_budget, self.page_size
            )));
        }
        Ok(())
    }
}

/// Round a requested page size up to a power of two within the supported range.
pub fn normalize_page_size(bytes: u64) -> usize {
    let clamped = bytes.clamp(MIN_PAGE_SIZE as u64, MAX_PAGE_SIZE as u64);
    clamped.next_power_of_two().min(MAX_PAGE_SIZE as u64) as usize
}

/// Cache budget actually applied for a page size: at least [`MIN_CACHE_PAGES`] pages.
pub fn normalize_cache_budget(bytes: u64, page_size: usize) -> u64 {
    bytes.max(MIN_CACHE_PAGES * page_size as u64)
}

/// Process-wide configuration. Readers take an immutable snapshot; writers are
/// serialized and every update bumps the version.
pub struct ConfigRegistry {
    current: RwLock<Arc<Config>>,
}

impl ConfigRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current.read().clone()
    }

    /// Apply `f` to a copy of the current config and publish it if it is valid.
    /// Returns the previous and the new snapshot; on error nothing changes.
    pub fn update<F>(&self, f: F) -> Result<(Arc<Config>, Arc<Config>), BridgeError>
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self.current.write();
        let old = guard.clone();
        let mut next = (*old).clone();
        f(&mut next);
        next.validate()?;
        next.version = old.version + 1;
        let next = Arc::new(next);
        *guard = next.clone();
        Ok((old, next))
    }
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_are_immutable_across_updates() {
        let reg = ConfigRegistry::default();
        let before = reg.snapshot();
        let (old, new) = reg.update(|c| c.ttl = Duration::from_secs(5)).unwrap();
        assert_eq!(before.ttl, DEFAULT_TTL);
        assert_eq!(old.version, 0);
        assert_eq!(new.version, 1);
        assert_eq!(reg.snapshot().ttl, Duration::from_secs(5));
    }

    #[test]
    fn page_size_is_rounded_and_clamped() {
        assert_eq!(normalize_page_size(1), MIN_PAGE_SIZE);
        assert_eq!(normalize_page_size(100 * KIB), 128 * KIB as usize);
        assert_eq!(normalize_page_size(128 * KIB), 128 * KIB as usize);
        assert_eq!(normalize_page_size(64 * MIB), MAX_PAGE_SIZE);
    }

    #[test]
    fn cache_budget_keeps_minimum_page_count() {
        let ps = 128 * KIB as usize;
        assert_eq!(normalize_cache_budget(1, ps), 128 * 128 * KIB);
        assert_eq!(normalize_cache_budget(512 * MIB, ps), 512 * MIB);
    }

    #[test]
    fn transport_mode_parses_aliases() {
        assert_eq!("server".parse::<TransportMode>().unwrap(), TransportMode::Channel);
        assert_eq!("adb".parse::<TransportMode>().unwrap(), TransportMode::Command);
        assert!("carrier-pigeon".parse::<TransportMode>().is_err());
    }

    #[test]
    fn validate_rejects_tiny_budget() {
        let cfg = Config::default().with_page_size(4096).with_cache_budget(100);
        assert!(cfg.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn invalid_update_is_not_published() {
        let reg = ConfigRegistry::default();
        assert!(matches!(
            reg.update(|c| c.cache_budget = 1),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(reg.update(|c| c.page_size = 0).is_err());
        let cfg = reg.snapshot();
        assert_eq!(cfg.version, 0);
        assert_eq!(cfg.cache_budget, DEFAULT_CACHE_BUDGET);
        assert_eq!(cfg.page_size, DEFAULT_PAGE_SIZE);
    }
}
