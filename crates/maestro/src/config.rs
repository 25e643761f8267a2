//! Maestro configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Maestro configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Client listener bind address.
    pub listen_addr: String,

    /// Admin HTTP bind address (health, metrics, snapshots).
    pub http_addr: String,

    /// Key-file holding the known daemons.
    pub store_path: PathBuf,

    /// Port appended to daemon addresses that carry none.
    pub daemon_port: u16,

    /// How long connect-all waits on one daemon before moving on (seconds).
    pub connect_timeout_secs: u64,

    /// Delay before reconnecting a daemon whose transport dropped (seconds).
    pub reconnect_delay_secs: u64,

    /// Daemons added at start-up on top of the key-file.
    pub seed_daemons: Vec<String>,

    /// Run connect-all once at start-up.
    pub autoconnect_on_start: bool,

    /// Name the maestro announces to daemons.
    pub hostname: String,
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:2125".to_string(),
            http_addr: "127.0.0.1:2126".to_string(),
            store_path: PathBuf::from("maestro-servers.toml"),
            daemon_port: 2127,
            connect_timeout_secs: 30,
            reconnect_delay_secs: 5,
            seed_daemons: Vec::new(),
            autoconnect_on_start: true,
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "maestro".to_string()),
        }
    }
}
