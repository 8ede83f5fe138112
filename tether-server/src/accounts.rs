//! The accounts file.
//!
//! ```toml
//! [[user]]
//! email = "alice@example.com"
//! token_sha256 = "9f86d08..."
//! settings = { theme = "dark" }
//!
//! [[user.network]]
//! name = "libera"
//! nick = "alice"
//! ip = "irc.libera.chat"
//! port = 6697
//! ssl = true
//! channels = ["#rust"]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::network::NetworkConfig;
use crate::user::UserSession;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountsFile {
    #[serde(default, rename = "user")]
    pub users: Vec<AccountConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub email: String,
    /// Hex SHA-256 of the websocket access token.
    #[serde(default)]
    pub token_sha256: String,
    #[serde(default = "empty_settings")]
    pub settings: toml::Table,
    #[serde(default, rename = "network")]
    pub networks: Vec<NetworkConfig>,
}

fn empty_settings() -> toml::Table {
    toml::Table::new()
}

impl AccountsFile {
    /// Read `path`. A missing file is an empty account list.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "No accounts file, starting empty");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        // Replaced atomically.
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

impl AccountConfig {
    /// Snapshot of a live session, with each network's current channels.
    pub fn from_session(user: &UserSession) -> Self {
        let settings = match serde_json::from_value(user.settings()) {
            Ok(settings) => settings,
            Err(_) if user.settings().is_null() => toml::Table::new(),
            Err(e) => {
                tracing::warn!(user = %user.email(), error = %e, "Settings are not a table, dropping them");
                toml::Table::new()
            }
        };
        Self {
            email: user.email().to_string(),
            token_sha256: user.token_hash().to_string(),
            settings,
            networks: user.networks().iter().map(|n| n.config()).collect(),
        }
    }

    pub fn settings_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.settings).unwrap_or(serde_json::Value::Null)
    }
}
