//! `lattice-master` binary: parse args, initialize logging, run the master.
//!
//! This binary wires the in-process coordination service and connector for
//! single-process/embedded deployments; a clustered deployment supplies its
//! lock-service and RPC transport implementations through the same traits.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use lattice_master::connection::MemoryCluster;
use lattice_master::coordination::MemoryCoordinator;
use lattice_master::master::{Master, MasterConfig};
use lattice_master::registry::RegistryConfig;
use lattice_master::storage::LocalFsStorage;

#[derive(Debug, Parser)]
#[command(name = "lattice-master", about = "Lattice table-store master node")]
pub struct MasterArgs {
    /// Address published to the coordination service on election.
    #[arg(long, env = "LATTICE_MASTER_ADDR", default_value = "127.0.0.1:6000")]
    listen: String,

    /// Base directory for table storage.
    #[arg(long, env = "LATTICE_DATA_DIR")]
    data_dir: PathBuf,

    /// Periodic catalog rescan interval (ms).
    #[arg(long, env = "LATTICE_RESCAN_INTERVAL_MS", default_value_t = 60_000)]
    rescan_interval_ms: u64,

    /// Drain-loop wake interval when idle (ms).
    #[arg(long, env = "LATTICE_WAKE_INTERVAL_MS", default_value_t = 1_000)]
    wake_interval_ms: u64,

    /// Delay before a parked operation is retried (ms).
    #[arg(long, env = "LATTICE_REQUEUE_DELAY_MS", default_value_t = 2_000)]
    requeue_delay_ms: u64,

    /// Catalog RPC retry bound.
    #[arg(long, env = "LATTICE_RPC_RETRIES", default_value_t = 3)]
    rpc_retries: u32,

    /// Sleep between catalog RPC attempts (ms).
    #[arg(long, env = "LATTICE_RPC_RETRY_SLEEP_MS", default_value_t = 2_000)]
    rpc_retry_sleep_ms: u64,

    /// Minimum live region servers before user-table operations run.
    #[arg(long, env = "LATTICE_MIN_SERVERS", default_value_t = 1)]
    min_servers: usize,

    /// Retired logs deleted per cleaner pass.
    #[arg(long, env = "LATTICE_MAX_LOG_CLEANUP", default_value_t = 10)]
    max_log_cleanup: usize,

    /// Reclaim an unacknowledged region assignment after this long (ms).
    #[arg(long, env = "LATTICE_ASSIGNMENT_TIMEOUT_MS", default_value_t = 30_000)]
    assignment_timeout_ms: u64,

    /// Skip new assignments to a server with this many opens in flight.
    #[arg(long, env = "LATTICE_OPENING_THRESHOLD", default_value_t = 8)]
    opening_threshold: usize,

    /// User-region assignments handed out per heartbeat.
    #[arg(long, env = "LATTICE_ASSIGNMENTS_PER_REPORT", default_value_t = 4)]
    assignments_per_report: usize,

    /// Heartbeat interval handed to region servers (ms).
    #[arg(long, env = "LATTICE_REPORT_INTERVAL_MS", default_value_t = 3_000)]
    report_interval_ms: u64,
}

impl MasterArgs {
    fn to_config(&self) -> MasterConfig {
        MasterConfig {
            identity: self.listen.clone(),
            rescan_interval: Duration::from_millis(self.rescan_interval_ms),
            wake_interval: Duration::from_millis(self.wake_interval_ms),
            requeue_delay: Duration::from_millis(self.requeue_delay_ms),
            retry_count: self.rpc_retries,
            retry_sleep: Duration::from_millis(self.rpc_retry_sleep_ms),
            min_live_servers: self.min_servers,
            max_logs_per_cleanup: self.max_log_cleanup,
            assignment_timeout: Duration::from_millis(self.assignment_timeout_ms),
            registry: RegistryConfig {
                opening_backlog_threshold: self.opening_threshold,
                max_assignments_per_report: self.assignments_per_report,
                report_interval: Duration::from_millis(self.report_interval_ms),
                ..RegistryConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = MasterArgs::parse();
    let storage = Arc::new(LocalFsStorage::new(args.data_dir.clone())?);
    let coordinator = Arc::new(MemoryCoordinator::new());
    let connector = MemoryCluster::new();
    let master = Master::new(args.to_config(), coordinator, connector, storage);

    {
        let master = master.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                master.shutdown_cluster().await;
            }
        });
    }

    master.run().await
}
