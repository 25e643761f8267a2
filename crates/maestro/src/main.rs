//! GeBR maestro server.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use maestro::Config;

/// Runs flows across a fleet of GeBR daemons.
#[derive(Parser, Debug)]
#[command(name = "maestro", about = "GeBR maestro: runs flows across a fleet of daemons")]
struct Args {
    /// Client listener address
    #[arg(long, default_value = "127.0.0.1:2125")]
    listen: String,

    /// Admin HTTP address (health, metrics, snapshots)
    #[arg(long, default_value = "127.0.0.1:2126")]
    http_addr: String,

    /// Key-file holding the known daemons
    #[arg(long, default_value = "maestro-servers.toml")]
    store: PathBuf,

    /// Port appended to daemon addresses that carry none
    #[arg(long, default_value = "2127")]
    daemon_port: u16,

    /// Connect-all watchdog per daemon, in seconds
    #[arg(long, default_value = "30")]
    connect_timeout_secs: u64,

    /// Delay before reconnecting a daemon whose transport dropped, in seconds
    #[arg(long, default_value = "5")]
    reconnect_delay_secs: u64,

    /// Daemon to add at start-up (repeatable)
    #[arg(long = "daemon")]
    daemons: Vec<String>,

    /// Do not connect the known daemons at start-up
    #[arg(long)]
    no_autoconnect: bool,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            listen_addr: args.listen,
            http_addr: args.http_addr,
            store_path: args.store,
            daemon_port: args.daemon_port,
            connect_timeout_secs: args.connect_timeout_secs,
            reconnect_delay_secs: args.reconnect_delay_secs,
            seed_daemons: args.daemons,
            autoconnect_on_start: !args.no_autoconnect,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("maestro=info".parse()?))
        .init();

    let config = Config::from(args);
    info!(store = %config.store_path.display(), "GeBR maestro starting");

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            on_signal.cancel();
        }
    });

    maestro::server::run(config, shutdown).await?;
    info!("GeBR maestro stopped");
    Ok(())
}
