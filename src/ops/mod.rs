//! Ops commands for cluster management

pub mod recover;
pub mod status;

pub use recover::{fetch_transactions, run_recovery};
pub use status::{cluster_status, force_health_check, ClusterReport, NodeReport};
