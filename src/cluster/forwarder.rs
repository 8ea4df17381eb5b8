//! Request forwarding with failover
//!
//! Wraps every forwarded route. A request is either handled locally or
//! relayed to the peer the router picks; a failed relay marks the peer
//! unavailable and is retried once against a different node.

use super::health::HealthMonitor;
use super::router::{route, ProxyTarget, RequestKind};
use super::state::ClusterState;
use crate::common::tracing_middleware::REQUEST_ID_HEADER;
use crate::common::{NodeId, Result};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Nodes a request already passed through, comma separated
pub const VIA_HEADER: &str = "X-Trinode-Via";

/// Set by local handlers when the local database could not be reached
pub const LOCAL_FAILURE_HEADER: &str = "X-Trinode-Local-Failure";

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Why no node could serve a request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub node: NodeId,
    pub attempted: Vec<NodeId>,
    pub last_error: String,
}

pub enum Outcome {
    Local(Response),
    Forwarded {
        target: ProxyTarget,
        response: Response,
    },
    Unavailable(Diagnostics),
}

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        match self {
            Outcome::Local(response) | Outcome::Forwarded { response, .. } => response,
            Outcome::Unavailable(diag) => {
                let err = crate::Error::NoTargetAvailable {
                    node: diag.node,
                    attempted: diag.attempted.clone(),
                    last_error: diag.last_error.clone(),
                };
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({
                        "error": err.code(),
                        "message": format!("{} cannot serve the request and no peer is reachable", diag.node.display_name()),
                        "node": diag.node,
                        "attempted": diag.attempted,
                        "lastError": diag.last_error,
                    })),
                )
                    .into_response()
            }
        }
    }
}

/// A request whose body has been read so it can be replayed
pub struct BufferedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BufferedRequest {
    pub async fn from_request(request: Request) -> Result<Self> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| crate::Error::InvalidRequest(format!("unreadable body: {}", e)))?;
        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        })
    }

    fn to_request(&self) -> Request {
        let mut request = Request::new(Body::from(self.body.clone()));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();
        request
    }

    /// Nodes listed in the via header
    pub fn via(&self) -> Vec<NodeId> {
        self.headers
            .get(VIA_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').filter_map(|n| n.parse().ok()).collect())
            .unwrap_or_default()
    }

    fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

pub fn is_local_connectivity_failure(response: &Response) -> bool {
    response.headers().contains_key(LOCAL_FAILURE_HEADER)
}

fn strip_local_failure(mut response: Response) -> Response {
    response.headers_mut().remove(LOCAL_FAILURE_HEADER);
    response
}

pub struct Forwarder {
    state: Arc<ClusterState>,
    monitor: Arc<HealthMonitor>,
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(monitor: Arc<HealthMonitor>, relay_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(relay_timeout).build()?;
        Ok(Self {
            state: monitor.state().clone(),
            monitor,
            client,
        })
    }

    fn decide(&self, kind: RequestKind, via: &[NodeId], attempted: &[NodeId]) -> Option<ProxyTarget> {
        let exclude: Vec<NodeId> = via.iter().chain(attempted).copied().collect();
        route(
            self.state.node(),
            &self.state.snapshot(),
            self.state.peers(),
            kind,
            &exclude,
        )
    }

    /// Serve `request` locally or through a peer.
    ///
    /// `local` runs at most once.
    pub async fn forward<F, Fut>(&self, request: BufferedRequest, local: F) -> Outcome
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let node = self.state.node();
        let kind = RequestKind::from_method(&request.method);
        let via = request.via();
        let mut attempted: Vec<NodeId> = Vec::new();
        let mut local = Some(local);
        let mut last_error = String::new();

        self.monitor.check_local_health().await;
        let mut target = self.decide(kind, &via, &attempted);

        if target.is_none() {
            let Some(handler) = local.take() else {
                return self.unavailable(attempted, last_error);
            };
            let response = handler(request.to_request()).await;
            if !is_local_connectivity_failure(&response) {
                return Outcome::Local(response);
            }

            self.monitor.mark_unavailable(node);
            target = self.decide(kind, &via, &attempted);
            if target.is_none() {
                return Outcome::Local(strip_local_failure(response));
            }
            last_error = "local database unreachable".to_string();
        }

        // First attempt plus one retry against a different node
        for _ in 0..2 {
            let Some(current) = target.take() else {
                break;
            };
            attempted.push(current.node);
            match self.relay(&current, &request, &via).await {
                Ok(response) => {
                    info!(
                        target_node = %current.node,
                        status = response.status().as_u16(),
                        "Forwarded to {}",
                        current.display_name
                    );
                    return Outcome::Forwarded {
                        target: current,
                        response,
                    };
                }
                Err(e) => {
                    warn!(target_node = %current.node, error = %e, "Relay failed");
                    self.monitor.mark_unavailable(current.node);
                    last_error = e.to_string();
                    target = self.decide(kind, &via, &attempted);
                }
            }
        }

        if let Some(handler) = local.take() {
            if self.monitor.check_local_health_now().await {
                debug!("Falling back to local handling");
                let response = handler(request.to_request()).await;
                return Outcome::Local(strip_local_failure(response));
            }
        }

        self.unavailable(attempted, last_error)
    }

    fn unavailable(&self, attempted: Vec<NodeId>, last_error: String) -> Outcome {
        let node = self.state.node();
        warn!(%node, ?attempted, %last_error, "No node can serve the request");
        Outcome::Unavailable(Diagnostics {
            node,
            attempted,
            last_error,
        })
    }

    /// Send the buffered request to `target`; 503 counts as failure
    async fn relay(
        &self,
        target: &ProxyTarget,
        request: &BufferedRequest,
        via: &[NodeId],
    ) -> Result<Response> {
        let url = format!("{}{}", target.url, request.path_and_query());
        let mut path: Vec<String> = via.iter().map(|n| n.to_string()).collect();
        path.push(self.state.node().to_string());

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(VIA_HEADER, path.join(","))
            .body(request.body.clone());
        for name in [header::CONTENT_TYPE, header::ACCEPT] {
            if let Some(value) = request.headers.get(&name) {
                builder = builder.header(name, value.clone());
            }
        }
        if let Some(value) = request.headers.get(REQUEST_ID_HEADER) {
            builder = builder.header(REQUEST_ID_HEADER, value.clone());
        }

        let upstream = builder.send().await?;
        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream.bytes().await?;

        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(crate::Error::Connectivity(format!(
                "{} answered 503: {}",
                target.node,
                String::from_utf8_lossy(&body)
            )));
        }

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        for (name, value) in headers.iter() {
            if name == header::CONTENT_LENGTH
                || name == header::TRANSFER_ENCODING
                || name == header::CONNECTION
            {
                continue;
            }
            response.headers_mut().append(name.clone(), value.clone());
        }
        if let Ok(value) = HeaderValue::from_str(target.node.as_str()) {
            response.headers_mut().insert(FORWARDED_TO_HEADER, value);
        }
        Ok(response)
    }
}

/// Node a response was relayed from
pub const FORWARDED_TO_HEADER: &str = "X-Trinode-Forwarded-To";

/// Middleware running every wrapped route through the forwarder
pub async fn forwarding_middleware(
    State(forwarder): State<Arc<Forwarder>>,
    request: Request,
    next: Next,
) -> Response {
    let buffered = match BufferedRequest::from_request(request).await {
        Ok(b) => b,
        Err(e) => {
            return (
                e.to_http_status(),
                Json(json!({ "error": e.code(), "message": e.to_string() })),
            )
                .into_response()
        }
    };
    forwarder
        .forward(buffered, |req| next.run(req))
        .await
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{HealthConfig, PeerUrls};
    use crate::storage::MemoryExecutor;

    fn forwarder(node: NodeId, exec: Arc<MemoryExecutor>, peers: PeerUrls) -> Forwarder {
        let state = Arc::new(ClusterState::new(node, peers));
        let monitor =
            Arc::new(HealthMonitor::new(state, exec, HealthConfig::default(), NodeId::Main).unwrap());
        Forwarder::new(monitor, Duration::from_secs(2)).unwrap()
    }

    fn dead_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    fn get(uri: &str) -> BufferedRequest {
        BufferedRequest {
            method: Method::GET,
            uri: uri.parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn test_via_header_parsing() {
        let mut req = get("/api/aggregation");
        req.headers
            .insert(VIA_HEADER, HeaderValue::from_static("NODE_B,MAIN,bogus"));
        assert_eq!(req.via(), vec![NodeId::NodeB, NodeId::Main]);
    }

    #[tokio::test]
    async fn test_healthy_main_serves_locally() {
        let fwd = forwarder(NodeId::Main, Arc::new(MemoryExecutor::new()), PeerUrls::default());
        let outcome = fwd
            .forward(get("/api/aggregation"), |_req| async {
                (StatusCode::OK, "local").into_response()
            })
            .await;
        assert!(matches!(outcome, Outcome::Local(_)));
    }

    #[tokio::test]
    async fn test_everything_down_is_unavailable() {
        let exec = Arc::new(MemoryExecutor::new());
        exec.set_available(false);
        let mut peers = PeerUrls::default();
        peers.set(NodeId::NodeA, dead_url());
        peers.set(NodeId::NodeB, dead_url());
        let fwd = forwarder(NodeId::Main, exec, peers);

        let outcome = fwd
            .forward(get("/api/aggregation"), |_req| async {
                (StatusCode::OK, "should not run").into_response()
            })
            .await;
        match outcome {
            Outcome::Unavailable(diag) => {
                assert_eq!(diag.node, NodeId::Main);
                assert_eq!(diag.attempted, vec![NodeId::NodeA, NodeId::NodeB]);
                assert!(!diag.last_error.is_empty());
            }
            _ => panic!("expected Unavailable"),
        }
        assert!(!fwd.state.is_available(NodeId::NodeA));
        assert!(!fwd.state.is_available(NodeId::NodeB));
    }

    #[tokio::test]
    async fn test_local_failure_reroutes() {
        let exec = Arc::new(MemoryExecutor::new());
        let mut peers = PeerUrls::default();
        peers.set(NodeId::NodeA, dead_url());
        peers.set(NodeId::NodeB, dead_url());
        let fwd = forwarder(NodeId::Main, exec, peers);

        // Ping succeeds but the handler's query hits a dead connection
        let outcome = fwd
            .forward(get("/api/aggregation"), |_req| async {
                let mut response = (StatusCode::SERVICE_UNAVAILABLE, "db down").into_response();
                response
                    .headers_mut()
                    .insert(LOCAL_FAILURE_HEADER, HeaderValue::from_static("connectivity"));
                response
            })
            .await;
        match outcome {
            Outcome::Unavailable(diag) => {
                assert_eq!(diag.attempted, vec![NodeId::NodeA, NodeId::NodeB])
            }
            _ => panic!("expected Unavailable"),
        }
        assert!(!fwd.state.is_available(NodeId::Main));
    }
}
