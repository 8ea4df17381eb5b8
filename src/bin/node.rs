//! Node binary

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trinode::{Config, NodeId, NodeServer};

#[derive(Parser)]
#[command(name = "trinode-node")]
#[command(about = "trinode database tier node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node server
    Serve {
        /// Which node this is (main, node-a, node-b)
        #[arg(long)]
        node: NodeId,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address for HTTP (overrides the configuration)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// SQLite database file (overrides the configuration)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Transaction log directory (overrides the configuration)
        #[arg(long)]
        txlog: Option<PathBuf>,

        /// Skip the blocking startup recovery pass
        #[arg(long)]
        no_startup_recovery: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            node,
            config,
            bind,
            db,
            txlog,
            no_startup_recovery,
        } => {
            // File and environment first, command line wins
            let mut config = Config::load(config.as_deref(), node)?;
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(db) = db {
                config.storage.path = db;
            }
            if let Some(txlog) = txlog {
                config.txlog_path = txlog;
            }
            if no_startup_recovery {
                config.recovery.on_startup = false;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.as_str().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            NodeServer::new(config).serve().await?;
        }
    }

    Ok(())
}
