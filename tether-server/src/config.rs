use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::mux::Delivery;
use crate::user::SessionOptions;

/// Always-on IRC bouncer.
#[derive(Parser, Debug, Clone)]
#[command(name = "tether", version, about)]
pub struct ServerConfig {
    /// HTTP/WebSocket listener address.
    #[arg(long, env = "TETHER_WEB_ADDR", default_value = "127.0.0.1:8080")]
    pub web_addr: String,

    /// Path to SQLite database file. If not set, history is kept in memory only.
    #[arg(long, env = "TETHER_DB_PATH")]
    pub db_path: Option<String>,

    /// Accounts file (TOML). Read at startup, rewritten on shutdown.
    #[arg(long, env = "TETHER_ACCOUNTS", default_value = "accounts.toml")]
    pub accounts: PathBuf,

    /// Directory holding script files. Scripts are not persisted without it.
    #[arg(long, env = "TETHER_SCRIPTS_DIR")]
    pub scripts_dir: Option<PathBuf>,

    /// Capacity of each per-network and per-account outbound queue.
    #[arg(long, env = "TETHER_QUEUE_CAPACITY", default_value = "256")]
    pub queue_capacity: usize,

    /// Seconds of client idle time before a keep-alive ping.
    #[arg(long, env = "TETHER_KEEPALIVE_SECS", default_value = "25")]
    pub keepalive_secs: u64,

    /// Timeout for fetching a link preview.
    #[arg(long, env = "TETHER_PREVIEW_TIMEOUT_SECS", default_value = "5")]
    pub preview_timeout_secs: u64,

    /// Disable link previews.
    #[arg(long, env = "TETHER_NO_PREVIEWS")]
    pub no_previews: bool,

    /// QUIT message used on disconnect and shutdown.
    #[arg(long, env = "TETHER_QUIT_MESSAGE", default_value = "tether shutting down")]
    pub quit_message: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            web_addr: "127.0.0.1:8080".to_string(),
            db_path: None,
            accounts: PathBuf::from("accounts.toml"),
            scripts_dir: None,
            queue_capacity: 256,
            keepalive_secs: 25,
            preview_timeout_secs: 5,
            no_previews: false,
            quit_message: "tether shutting down".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            queue_capacity: self.queue_capacity.max(1),
            quit_message: self.quit_message.clone(),
            scripts_dir: self.scripts_dir.clone(),
        }
    }

    pub fn delivery(&self) -> Delivery {
        Delivery {
            keepalive: Duration::from_secs(self.keepalive_secs.max(1)),
            capacity: self.queue_capacity.max(1),
        }
    }

    pub fn preview_timeout(&self) -> Duration {
        Duration::from_secs(self.preview_timeout_secs)
    }
}
