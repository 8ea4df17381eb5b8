//! Proxy target selection
//!
//! Decides whether a request is served locally or relayed to a peer. The
//! decision is a pure function of the current node, the health table and
//! the nodes that must not be picked again.

use super::state::HealthTable;
use crate::common::{NodeId, PeerUrls};
use axum::http::Method;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

impl RequestKind {
    pub fn from_method(method: &Method) -> Self {
        if method == Method::GET || method == Method::HEAD || method == Method::OPTIONS {
            RequestKind::Read
        } else {
            RequestKind::Write
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyTarget {
    pub node: NodeId,
    pub url: String,
    pub display_name: &'static str,
}

impl ProxyTarget {
    pub fn new(node: NodeId, peers: &PeerUrls) -> Self {
        Self {
            node,
            url: peers.url_of(node).to_string(),
            display_name: node.display_name(),
        }
    }
}

/// Pick the node that should serve a request arriving at `current`.
///
/// `None` means serve locally. `exclude` holds nodes already on the request's
/// path and targets already attempted.
pub fn route(
    current: NodeId,
    table: &HealthTable,
    peers: &PeerUrls,
    kind: RequestKind,
    exclude: &[NodeId],
) -> Option<ProxyTarget> {
    let candidates: &[NodeId] = match current {
        NodeId::Main if table.is_available(NodeId::Main) => &[],
        NodeId::Main => &[NodeId::NodeA, NodeId::NodeB],
        NodeId::NodeA => &[NodeId::Main],
        NodeId::NodeB => &[NodeId::Main, NodeId::NodeA],
    };

    candidates
        .iter()
        .copied()
        .filter(|n| *n != current && !exclude.contains(n))
        .filter(|n| table.is_available(*n))
        .find(|n| kind == RequestKind::Read || table.can_write(*n))
        .map(|n| ProxyTarget::new(n, peers))
}
