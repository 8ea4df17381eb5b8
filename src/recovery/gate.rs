//! Startup readiness gate
//!
//! Closed while the startup recovery pass runs; gated routes wait on it
//! instead of failing.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct ReadinessGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ReadinessGate {
    pub fn new(open: bool) -> Self {
        let (tx, _rx) = watch::channel(open);
        Self { tx: Arc::new(tx) }
    }

    pub fn close(&self) {
        self.tx.send_replace(false);
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the gate is open
    pub async fn wait_ready(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|open| *open).await;
    }
}

pub async fn readiness_middleware(
    State(gate): State<ReadinessGate>,
    request: Request,
    next: Next,
) -> Response {
    if !gate.is_open() {
        tracing::debug!(path = %request.uri().path(), "Waiting for startup recovery");
        gate.wait_ready().await;
    }
    next.run(request).await
}
