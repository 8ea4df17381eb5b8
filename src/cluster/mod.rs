//! Cluster awareness: health tracking, target selection and forwarding

pub mod forwarder;
pub mod health;
pub mod peer;
pub mod router;
pub mod state;

pub use forwarder::{
    forwarding_middleware, BufferedRequest, Diagnostics, Forwarder, Outcome,
    FORWARDED_TO_HEADER, LOCAL_FAILURE_HEADER, VIA_HEADER,
};
pub use health::{HealthMonitor, NodeStatus, STATUS_PATH};
pub use peer::PeerClient;
pub use router::{route, ProxyTarget, RequestKind};
pub use state::{ClusterState, HealthRecord, HealthTable};
