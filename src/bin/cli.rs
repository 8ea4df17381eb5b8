//! CLI for cluster operations

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use trinode::common::{parse_duration, NodeId};
use trinode::ops::{cluster_status, fetch_transactions, force_health_check, run_recovery};
use trinode::recovery::RecoveryOutcome;
use trinode::Config;

#[derive(Parser)]
#[command(name = "trinode")]
#[command(about = "trinode cluster operations CLI")]
#[command(version)]
struct Cli {
    /// Node URL (defaults to MAIN from the configuration)
    #[arg(long)]
    url: Option<String>,

    /// Configuration file listing the node URLs
    #[arg(long)]
    config: Option<PathBuf>,

    /// Request timeout (e.g. "10s", "2m")
    #[arg(long, default_value = "10s")]
    timeout: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the status of all three nodes
    Status,

    /// Force a node to re-check itself and its peers
    Check,

    /// Run a recovery pass on a node
    Recover,

    /// Show recent transaction log entries of a node
    Log {
        /// Number of entries
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref(), NodeId::Main)?;
    let timeout = parse_duration(&cli.timeout)?;
    let url = cli
        .url
        .clone()
        .unwrap_or_else(|| config.peers.url_of(NodeId::Main).to_string());

    match cli.command {
        Commands::Status => {
            let report = cluster_status(&config.peers, timeout).await?;
            println!("Cluster status:");
            for node in &report.nodes {
                match &node.status {
                    Ok(s) => println!(
                        "  {:<7} {:<24} db={} actingMaster={} recovering={}",
                        node.node.as_str(),
                        node.url,
                        if s.database_healthy { "up" } else { "down" },
                        s.is_acting_master,
                        s.recovering
                    ),
                    Err(e) => println!(
                        "  {:<7} {:<24} unreachable ({})",
                        node.node.as_str(),
                        node.url,
                        e
                    ),
                }
            }
            println!("  Healthy: {}/{}", report.healthy(), report.nodes.len());
            if let Some(node) = report.acting_master() {
                println!("  Acting master: {}", node.display_name());
            }
        }

        Commands::Check => {
            let client = reqwest::Client::builder().timeout(timeout).build()?;
            let view = force_health_check(&client, &url).await?;
            println!("Health table of {}:", view.current_node);
            for node in &view.nodes {
                println!(
                    "  {:<7} {:<5} actingMaster={} lastChecked={}",
                    node.node.as_str(),
                    if node.available { "up" } else { "down" },
                    node.is_acting_master,
                    node.last_checked
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".into())
                );
            }
            let show = |n: Option<NodeId>| n.map(|n| n.as_str()).unwrap_or("none");
            println!("  Best read node: {}", show(view.best_read_node));
            println!("  Best write node: {}", show(view.best_write_node));
            println!("  Ready: {}", view.ready);
        }

        Commands::Recover => {
            let client = reqwest::Client::builder().timeout(timeout).build()?;
            let pass = run_recovery(&client, &url).await?;
            println!("Recovery report ({}):", pass.node);
            for report in &pass.reports {
                match &report.outcome {
                    RecoveryOutcome::Skipped { reason } => {
                        println!("  {}: skipped ({})", report.node, reason)
                    }
                    RecoveryOutcome::Completed {
                        replayed,
                        replay_failed,
                        inserted,
                        updated,
                        removed,
                        ..
                    } => println!(
                        "  {}: replayed {} (failed {}), synced +{} ~{} -{}",
                        report.node, replayed, replay_failed, inserted, updated, removed
                    ),
                    RecoveryOutcome::Error { message } => {
                        println!("  {}: error ({})", report.node, message)
                    }
                }
            }
            println!("  Pending at start: {}", pass.outstanding_local);
        }

        Commands::Log { limit } => {
            let client = reqwest::Client::builder().timeout(timeout).build()?;
            let entries = fetch_transactions(&client, &url, limit).await?;
            println!("Transaction log ({} entries):", entries.len());
            for entry in entries {
                println!(
                    "  #{:<6} {:<9} {:<6} -> {:<6} {}{}",
                    entry.seq,
                    entry.status.as_str(),
                    entry.kind.to_string(),
                    entry.target.as_str(),
                    entry.id,
                    entry
                        .error
                        .as_deref()
                        .map(|e| format!(" ({})", e))
                        .unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
