//! Tracing subscriber setup with a level that can be changed at runtime.

use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::error::{BridgeError, Result};

/// Runtime control over the active log filter.
pub trait LogControl: Send + Sync {
    fn current(&self) -> String;

    /// Replace the filter. Returns the previous one.
    fn set_level(&self, level: &str) -> Result<String>;
}

pub struct ReloadHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    current: Mutex<String>,
}

impl LogControl for ReloadHandle {
    fn current(&self) -> String {
        self.current.lock().clone()
    }

    fn set_level(&self, level: &str) -> Result<String> {
        let filter = EnvFilter::try_new(level)
            .map_err(|e| BridgeError::InvalidArgument(format!("bad log level '{level}': {e}")))?;
        self.handle
            .reload(filter)
            .map_err(|e| BridgeError::InvalidState(format!("cannot reload log filter: {e}")))?;
        Ok(std::mem::replace(&mut *self.current.lock(), level.to_string()))
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `level` when set.
/// With `file`, output is appended there instead of stderr.
pub fn init(level: &str, file: Option<&Path>) -> anyhow::Result<Arc<ReloadHandle>> {
    let (filter, initial) = match EnvFilter::try_from_default_env() {
        Ok(f) => {
            let s = f.to_string();
            (f, s)
        }
        Err(_) => (EnvFilter::try_new(level)?, level.to_string()),
    };
    let (filter, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter);
    match file {
        Some(path) => {
            let out = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(
                    fmt::layer()
                        .with_writer(std::sync::Mutex::new(out))
                        .with_ansi(false),
                )
                .try_init()?;
        }
        None => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(Arc::new(ReloadHandle {
        handle,
        current: Mutex::new(initial),
    }))
}
