//! # trinode
//!
//! A three-node replicated title database tier with:
//! - Health-driven request routing with a single failover retry
//! - Partitioned replication from MAIN to two workers
//! - A RocksDB-backed transaction log of every write
//! - Log replay and digest-based sync to repair peers after outages
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!                ┌──────────────────────────┐
//!                │          MAIN            │
//!                │  all titles, coordinator │
//!                └─────┬──────────────┬─────┘
//!          replicate   │              │   replicate
//!     (startYear<2010) │              │ (startYear>=2010)
//!                ┌─────▼─────┐  ┌─────▼─────┐
//!                │  NODE_A   │  │  NODE_B   │
//!                │ vice/acting│ │ read only │
//!                └───────────┘  └───────────┘
//! ```
//!
//! Every node serves the same API. A request that cannot be handled locally
//! is relayed to the best available peer.
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! trinode-node serve --node main --bind 0.0.0.0:5000
//! trinode-node serve --node node-a --bind 0.0.0.0:5001 --config ./node-a.toml
//! ```
//!
//! ### Use the CLI
//! ```bash
//! trinode status --url http://localhost:5000
//! trinode recover --url http://localhost:5000
//! trinode log --limit 20
//! ```

pub mod api;
pub mod cluster;
pub mod common;
pub mod ops;
pub mod recovery;
pub mod server;
pub mod storage;
pub mod txlog;

// Re-export commonly used types
pub use common::{Config, Error, NodeId, Result};
pub use server::NodeServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
