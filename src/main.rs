use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use portero::{Config, ReplicaSet};

#[derive(Parser)]
#[command(name = "portero")]
#[command(about = "A transparent MongoDB wire-protocol proxy for replica sets")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Comma-separated seed addresses of the replica set
    #[arg(long, default_value = "localhost:27017")]
    addrs: String,

    /// Expected replica set name; seeds reporting another set are ignored
    #[arg(long, default_value = "")]
    replica_name: String,

    /// First port of the proxy listener range
    #[arg(long, default_value_t = 6000)]
    port_start: u16,

    /// Last port of the proxy listener range
    #[arg(long, default_value_t = 6010)]
    port_end: u16,

    /// Timeout for one message to be proxied, in seconds
    #[arg(long, default_value_t = 120)]
    message_timeout_secs: u64,

    /// Idle timeout for client connections, in seconds
    #[arg(long, default_value_t = 3600)]
    client_idle_timeout_secs: u64,

    /// How long to pin an upstream awaiting getLastError, in seconds
    #[arg(long, default_value_t = 60)]
    get_last_error_timeout_secs: u64,

    /// Maximum number of connections per mongo node
    #[arg(long, default_value_t = 100)]
    max_connections: usize,

    /// Idle server connections kept around per mongo node
    #[arg(long, default_value_t = 5)]
    min_idle_connections: usize,

    /// Idle timeout for server connections, in seconds
    #[arg(long, default_value_t = 300)]
    server_idle_timeout_secs: u64,

    /// Concurrency for closing server connections
    #[arg(long, default_value_t = 5)]
    server_close_pool_size: usize,

    /// Drop in-flight clients when a topology change forces a restart
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    hard_restart: bool,

    /// Inspect every query, not just commands
    #[arg(long)]
    proxy_all_queries: bool,

    /// Arm a topology restart when an upstream dial exhausts its retries
    #[arg(long)]
    restart_on_dial_failure: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            addrs: self.addrs,
            replica_name: self.replica_name,
            port_start: self.port_start,
            port_end: self.port_end,
            message_timeout: Duration::from_secs(self.message_timeout_secs),
            client_idle_timeout: Duration::from_secs(self.client_idle_timeout_secs),
            get_last_error_timeout: Duration::from_secs(self.get_last_error_timeout_secs),
            max_connections: self.max_connections,
            min_idle_connections: self.min_idle_connections,
            server_idle_timeout: Duration::from_secs(self.server_idle_timeout_secs),
            server_close_pool_size: self.server_close_pool_size,
            hard_restart: self.hard_restart,
            proxy_all_queries: self.proxy_all_queries,
            restart_on_dial_failure: self.restart_on_dial_failure,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = Cli::parse().into_config();
    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!("starting portero v{}", env!("CARGO_PKG_VERSION"));
    info!("seed addresses: {}", config.addrs);

    let replica_set = ReplicaSet::new(config);
    replica_set.spawn_restart_task();
    if let Err(e) = replica_set.start().await {
        error!("startup failed: {}", e);
        return ExitCode::FAILURE;
    }

    for member in replica_set.proxy_members().await {
        info!("serving clients on {}", member);
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    replica_set.stop(false).await;
    info!("clean shutdown complete");
    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("installing SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
