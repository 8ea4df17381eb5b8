//! Node server

use crate::api::{create_router, AppState};
use crate::cluster::{ClusterState, Forwarder, HealthMonitor, PeerClient};
use crate::common::{Config, Result, StorageBackend};
use crate::recovery::{ReadinessGate, RecoveryCoordinator};
use crate::storage::{MemoryExecutor, QueryExecutor, SqliteExecutor};
use crate::txlog::TransactionLog;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct NodeServer {
    config: Config,
    executor: Option<Arc<dyn QueryExecutor>>,
}

impl NodeServer {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            executor: None,
        }
    }

    /// Use an already opened title database instead of the configured one
    pub fn with_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    fn open_executor(&self) -> Result<Arc<dyn QueryExecutor>> {
        if let Some(executor) = &self.executor {
            return Ok(executor.clone());
        }
        Ok(match self.config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryExecutor::new()),
            StorageBackend::Sqlite => Arc::new(SqliteExecutor::open(
                &self.config.storage.path,
                self.config.storage.pool_size,
            )?),
        })
    }

    /// Wire every component together without starting anything
    pub fn build(&self) -> Result<AppState> {
        let config = Arc::new(self.config.clone());
        let executor = self.open_executor()?;
        let cluster = Arc::new(ClusterState::new(config.node, config.peers.clone()));
        let monitor = Arc::new(HealthMonitor::new(
            cluster.clone(),
            executor.clone(),
            config.health.clone(),
            config.preferred_read_node,
        )?);
        let forwarder = Arc::new(Forwarder::new(
            monitor.clone(),
            config.forwarding.relay_timeout(),
        )?);
        let peers = Arc::new(PeerClient::new(
            config.peers.clone(),
            config.forwarding.relay_timeout(),
        )?);
        let txlog = Arc::new(TransactionLog::open(&config.txlog_path)?);
        let recovery = Arc::new(RecoveryCoordinator::new(
            monitor.clone(),
            executor.clone(),
            txlog.clone(),
            peers.clone(),
            config.recovery.clone(),
            config.partition_split_year,
        ));

        Ok(AppState {
            config,
            cluster,
            monitor,
            executor,
            txlog,
            peers,
            recovery,
            forwarder,
            gate: ReadinessGate::new(true),
        })
    }

    /// Bind the configured address and serve until Ctrl-C
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_on(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve_on(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let node = self.config.node;
        tracing::info!("Starting {} ({})", node.display_name(), node);
        tracing::info!("  HTTP API: {} ({})", listener.local_addr()?, self.config.self_url());
        tracing::info!("  Storage: {:?}", self.config.storage.backend);
        tracing::info!("  Transaction log: {}", self.config.txlog_path.display());

        let state = self.build()?;
        tracing::info!("  Title database: {}", state.executor.backend_name());

        let mut tasks = state.monitor.clone().spawn();
        if self.config.recovery.on_startup {
            // Closed before the listener accepts anything
            state.gate.close();
            let recovery = state.recovery.clone();
            let gate = state.gate.clone();
            tasks.push(tokio::spawn(async move {
                recovery.run_startup(&gate).await;
            }));
        }
        tasks.push(state.recovery.clone().spawn_periodic());

        let txlog = state.txlog.clone();
        let router = create_router(state);
        tracing::info!("{} ready", node.display_name());

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        for task in tasks {
            task.abort();
        }
        if let Err(e) = txlog.flush() {
            tracing::warn!("Could not flush transaction log: {}", e);
        }
        served?;
        tracing::info!("{} stopped", node.display_name());
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Could not listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeId;
    use tempfile::tempdir;

    #[test]
    fn test_build_wires_configured_node() {
        let dir = tempdir().unwrap();
        let mut config = Config::for_node(NodeId::NodeB);
        config.storage.backend = StorageBackend::Memory;
        config.txlog_path = dir.path().join("txlog");

        let state = NodeServer::new(config).build().unwrap();
        assert_eq!(state.cluster.node(), NodeId::NodeB);
        assert_eq!(state.executor.backend_name(), "memory");
        assert!(state.gate.is_open());
        assert_eq!(state.txlog.list(10).unwrap().len(), 0);
    }

    #[test]
    fn test_build_opens_sqlite_backend() {
        let dir = tempdir().unwrap();
        let mut config = Config::for_node(NodeId::Main);
        config.storage.path = dir.path().join("titles.db");
        config.storage.pool_size = 2;
        config.txlog_path = dir.path().join("txlog");

        let state = NodeServer::new(config).build().unwrap();
        assert_eq!(state.executor.backend_name(), "sqlite");
    }
}
