// Library crate for droidfs: the bridge engine plus its transports, control
// channel and (with the `fuse` feature) the kernel glue.

pub mod admin;
pub mod cache;
pub mod companion;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod logging;
pub mod node;
pub mod path;
pub mod remote;

pub use config::{Config, ConfigRegistry, TransportMode};
pub use engine::Bridge;
pub use error::{BridgeError, Result};
pub use node::{Attr, NodeId, NodeKind};
