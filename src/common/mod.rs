//! Common utilities and types shared across trinode

pub mod config;
pub mod error;
pub mod tracing_middleware;
pub mod utils;

pub use config::{
    Config, ForwardingConfig, HealthConfig, NodeId, NodeMode, PeerUrls, RecoveryConfig,
    StorageBackend, StorageConfig,
};
pub use error::{Error, Result};
pub use utils::{parse_duration, timestamp_now_millis, validate_tconst};
