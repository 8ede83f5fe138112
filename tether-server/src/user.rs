//! User sessions.
//!
//! A [`UserSession`] is the account-level root: it owns every network
//! session of one user, the user's global script chain, an account-level
//! outbox for replies that belong to no network, and the settings blob.
//! Networks find each other through it by name when a script redirects a
//! message; they hold only a weak reference back.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::db::MessageStore;
use crate::network::{self, NetworkConfig, NetworkHandle, SessionClosed};
use crate::outbox::Outbox;
use crate::preview::PreviewFetcher;
use crate::protocol::{ClearHistory, ClientCommand, CommandResponse, History, Payload};
use crate::script::{self, Script, store as script_store};

/// History entries returned when a client does not ask for a count.
const DEFAULT_HISTORY: usize = 100;
const MAX_HISTORY: usize = 1000;

/// Knobs shared by every session of the process.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Capacity of each outbound queue.
    pub queue_capacity: usize,
    /// Sent with QUIT on disconnect and shutdown.
    pub quit_message: String,
    /// Root of the script files; scripts are not persisted without one.
    pub scripts_dir: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            quit_message: "tether shutting down".to_string(),
            scripts_dir: None,
        }
    }
}

/// Collaborators every session talks to.
pub struct Services {
    pub store: Arc<dyn MessageStore>,
    pub previewer: Arc<dyn PreviewFetcher>,
    pub options: SessionOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("network {0} already exists")]
    DuplicateNetwork(String),
    #[error("no network named {0}")]
    UnknownNetwork(String),
}

pub struct UserSession {
    email: String,
    token_hash: String,
    networks: RwLock<Vec<NetworkHandle>>,
    global_scripts: RwLock<Vec<Arc<dyn Script>>>,
    account: Outbox,
    settings: RwLock<serde_json::Value>,
    services: Arc<Services>,
}

impl UserSession {
    /// `token_hash` is the hex SHA-256 of the user's access token.
    pub fn new(
        email: &str,
        token_hash: &str,
        settings: serde_json::Value,
        services: Arc<Services>,
    ) -> Arc<Self> {
        Arc::new(Self {
            email: email.to_string(),
            token_hash: token_hash.to_ascii_lowercase(),
            networks: RwLock::new(Vec::new()),
            global_scripts: RwLock::new(Vec::new()),
            account: Outbox::new(services.options.queue_capacity),
            settings: RwLock::new(settings),
            services,
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn token_hash(&self) -> &str {
        &self.token_hash
    }

    /// Whether `token` hashes to the stored digest.
    pub fn check_token(&self, token: &str) -> bool {
        !self.token_hash.is_empty() && hex::encode(Sha256::digest(token.as_bytes())) == self.token_hash
    }

    /// Look up a network by name, ignoring case.
    pub fn network(&self, name: &str) -> Option<NetworkHandle> {
        self.networks
            .read()
            .iter()
            .find(|n| n.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn networks(&self) -> Vec<NetworkHandle> {
        self.networks.read().clone()
    }

    /// Start a session for `config`. The name is stored lower-cased.
    pub fn add_network(
        self: &Arc<Self>,
        mut config: NetworkConfig,
        connect: bool,
    ) -> Result<NetworkHandle, UserError> {
        config.name = config.name.to_lowercase();
        let mut networks = self.networks.write();
        if networks.iter().any(|n| n.name() == config.name) {
            return Err(UserError::DuplicateNetwork(config.name));
        }
        tracing::info!(user = %self.email, network = %config.name, connect, "Adding network");
        let handle = network::spawn(
            config,
            &self.email,
            Arc::downgrade(self),
            self.services.clone(),
            connect,
        );
        networks.push(handle.clone());
        Ok(handle)
    }

    /// Stop and forget a network.
    pub async fn remove_network(&self, name: &str) -> Result<(), UserError> {
        let handle = {
            let mut networks = self.networks.write();
            let index = networks
                .iter()
                .position(|n| n.name().eq_ignore_ascii_case(name))
                .ok_or_else(|| UserError::UnknownNetwork(name.to_string()))?;
            networks.remove(index)
        };
        if let Err(e) = handle.shutdown().await {
            tracing::debug!(user = %self.email, error = %e, "Network already stopped");
        }
        Ok(())
    }

    pub fn rename_network(&self, old: &str, new: &str) -> Result<(), UserError> {
        let new = new.to_lowercase();
        let networks = self.networks.read();
        if networks.iter().any(|n| n.name() == new) {
            return Err(UserError::DuplicateNetwork(new));
        }
        let handle = networks
            .iter()
            .find(|n| n.name().eq_ignore_ascii_case(old))
            .ok_or_else(|| UserError::UnknownNetwork(old.to_string()))?;
        handle.set_name(&new);
        Ok(())
    }

    pub fn global_scripts(&self) -> Vec<Arc<dyn Script>> {
        self.global_scripts.read().clone()
    }

    /// Returns `true` if the name was new.
    pub fn add_global_script(&self, script: Arc<dyn Script>) -> bool {
        script::upsert(&mut self.global_scripts.write(), script)
    }

    pub fn remove_global_script(&self, name: &str) -> bool {
        script::remove(&mut self.global_scripts.write(), name)
    }

    pub fn settings(&self) -> serde_json::Value {
        self.settings.read().clone()
    }

    pub fn set_settings(&self, settings: serde_json::Value) {
        *self.settings.write() = settings;
    }

    /// Queue for replies that belong to no particular network.
    pub fn account_outbox(&self) -> Outbox {
        self.account.clone()
    }

    /// Act on a request from a connected client.
    pub async fn handle_command(&self, cmd: ClientCommand) {
        let result = match cmd {
            ClientCommand::Raw { network, message } => match self.target(&network).await {
                Some(net) => net.raw(&message).await,
                None => return,
            },
            ClientCommand::Message {
                network,
                channel,
                command,
                message,
            } => match self.target(&network).await {
                Some(net) => net.send(&channel, &command, &message).await,
                None => return,
            },
            ClientCommand::Kick {
                network,
                channel,
                user,
                message,
            } => match self.target(&network).await {
                Some(net) => net.kick(&channel, &user, &message).await,
                None => return,
            },
            ClientCommand::Mode {
                network,
                channel,
                message,
            } => match self.target(&network).await {
                Some(net) => net.mode(&channel, &message).await,
                None => return,
            },
            ClientCommand::Open { network, channel } => match self.target(&network).await {
                Some(net) => net.open_channel(&channel).await,
                None => return,
            },
            ClientCommand::Close { network, channel } => match self.target(&network).await {
                Some(net) => net.close_channel(&channel).await,
                None => return,
            },
            ClientCommand::Clear { network, channel } => {
                self.clear(network, channel).await;
                return;
            }
            ClientCommand::Delete { id } => {
                self.delete(id).await;
                return;
            }
            ClientCommand::History {
                network,
                channel,
                limit,
            } => {
                self.history(network, channel, limit).await;
                return;
            }
        };
        if let Err(SessionClosed(name)) = result {
            tracing::warn!(user = %self.email, network = %name, "Command for stopped network dropped");
        }
    }

    /// The network a command names, or a failure reply to the client.
    async fn target(&self, name: &str) -> Option<NetworkHandle> {
        let found = self.network(name);
        if found.is_none() {
            self.respond(false, format!("no network named {name}")).await;
        }
        found
    }

    async fn respond(&self, success: bool, message: String) {
        self.account
            .push(Payload::CommandResponse(CommandResponse { success, message }))
            .await;
    }

    /// The stored spelling of a network name the client sent.
    fn canonical(&self, name: String) -> String {
        self.network(&name).map(|n| n.name()).unwrap_or(name)
    }

    async fn clear(&self, network: String, channel: String) {
        let network = self.canonical(network);
        match self.services.store.clear_channel(&self.email, &network, &channel) {
            Ok(removed) => {
                tracing::debug!(user = %self.email, network = %network, channel = %channel, removed, "History cleared");
                self.account
                    .push(Payload::Clear(ClearHistory { network, channel }))
                    .await;
            }
            Err(e) => {
                tracing::warn!(user = %self.email, error = %e, "Failed to clear history");
                self.respond(false, "failed to clear history".to_string()).await;
            }
        }
    }

    async fn delete(&self, id: i64) {
        match self.services.store.delete_message(&self.email, id) {
            Ok(true) => self.account.push(Payload::Delete(id)).await,
            Ok(false) => self.respond(false, format!("no message with id {id}")).await,
            Err(e) => {
                tracing::warn!(user = %self.email, id, error = %e, "Failed to delete message");
                self.respond(false, "failed to delete message".to_string()).await;
            }
        }
    }

    async fn history(&self, network: Option<String>, channel: Option<String>, limit: Option<usize>) {
        let limit = limit.unwrap_or(DEFAULT_HISTORY).clamp(1, MAX_HISTORY);
        let network = network.map(|n| self.canonical(n));
        let found = self.services.store.history(
            &self.email,
            network.as_deref(),
            channel.as_deref(),
            limit,
        );
        match found {
            Ok(messages) => {
                self.account
                    .push(Payload::History(History {
                        network,
                        channel,
                        messages,
                    }))
                    .await
            }
            Err(e) => {
                tracing::warn!(user = %self.email, error = %e, "Failed to read history");
                self.respond(false, "failed to read history".to_string()).await;
            }
        }
    }

    /// Load script files for the global chain and every network.
    /// Returns the number of scripts loaded.
    pub fn load_scripts(&self) -> std::io::Result<usize> {
        let Some(root) = self.services.options.scripts_dir.as_deref() else {
            return Ok(0);
        };
        let mut loaded = 0;
        for script in script_store::load_dir(&script_store::global_dir(root, &self.email))? {
            self.add_global_script(script);
            loaded += 1;
        }
        for net in self.networks() {
            for script in script_store::load_dir(&script_store::network_dir(root, &self.email, &net.name()))? {
                net.add_script(script);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Write every persistable script back to disk. Returns the number of
    /// files written.
    pub fn save_scripts(&self) -> std::io::Result<usize> {
        let Some(root) = self.services.options.scripts_dir.as_deref() else {
            return Ok(0);
        };
        let mut written = script_store::save_dir(&script_store::global_dir(root, &self.email), &self.global_scripts())?;
        for net in self.networks() {
            written += script_store::save_dir(&script_store::network_dir(root, &self.email, &net.name()), &net.scripts())?;
        }
        Ok(written)
    }

    /// Quit every network and stop its session.
    pub async fn shutdown(&self) {
        for net in self.networks() {
            if let Err(e) = net.shutdown().await {
                tracing::debug!(user = %self.email, error = %e, "Network already stopped");
            }
        }
    }
}
