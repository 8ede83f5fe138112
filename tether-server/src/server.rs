//! Process wiring: storage, previews, accounts, and the web listener.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::accounts::{AccountConfig, AccountsFile};
use crate::config::ServerConfig;
use crate::db::{Db, MessageStore};
use crate::preview::{HttpPreviewer, NoPreview, PreviewFetcher};
use crate::user::{Services, UserSession};
use crate::web::{self, WebState};

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    fn build_services(&self) -> Result<Arc<Services>> {
        let db = match &self.config.db_path {
            Some(path) => {
                tracing::info!("Message history in {path}");
                Db::open(path).with_context(|| format!("opening database {path}"))?
            }
            None => {
                tracing::info!("No --db-path, message history is in memory only");
                Db::open_memory()?
            }
        };
        let store: Arc<dyn MessageStore> = Arc::new(db);
        let previewer: Arc<dyn PreviewFetcher> = if self.config.no_previews {
            Arc::new(NoPreview)
        } else {
            Arc::new(HttpPreviewer::new(self.config.preview_timeout())?)
        };
        Ok(Arc::new(Services {
            store,
            previewer,
            options: self.config.session_options(),
        }))
    }

    /// Build a session per account and start its networks.
    pub fn start_users(accounts: &AccountsFile, services: &Arc<Services>) -> Vec<Arc<UserSession>> {
        let mut users = Vec::with_capacity(accounts.users.len());
        for account in &accounts.users {
            if users.iter().any(|u: &Arc<UserSession>| u.email() == account.email) {
                tracing::warn!(user = %account.email, "Duplicate account, skipped");
                continue;
            }
            let user = UserSession::new(
                &account.email,
                &account.token_sha256,
                account.settings_json(),
                services.clone(),
            );
            for net in &account.networks {
                if let Err(e) = user.add_network(net.clone(), true) {
                    tracing::warn!(user = %account.email, error = %e, "Skipping network");
                }
            }
            match user.load_scripts() {
                Ok(0) => {}
                Ok(n) => tracing::info!(user = %account.email, scripts = n, "Loaded scripts"),
                Err(e) => tracing::warn!(user = %account.email, error = %e, "Failed to load scripts"),
            }
            users.push(user);
        }
        users
    }

    pub async fn run(self) -> Result<()> {
        let services = self.build_services()?;
        let accounts = AccountsFile::load(&self.config.accounts)?;
        let users = Self::start_users(&accounts, &services);
        tracing::info!("{} account(s) loaded", users.len());

        let state = WebState {
            users: Arc::new(users.clone()),
            delivery: self.config.delivery(),
        };
        let listener = TcpListener::bind(&self.config.web_addr)
            .await
            .with_context(|| format!("binding {}", self.config.web_addr))?;
        tracing::info!("HTTP/WebSocket listening on {}", self.config.web_addr);
        axum::serve(listener, web::router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.shutdown(&users).await
    }

    /// Quit every network, then write accounts and scripts back to disk.
    async fn shutdown(&self, users: &[Arc<UserSession>]) -> Result<()> {
        tracing::info!("Shutting down {} account(s)", users.len());
        for user in users {
            user.shutdown().await;
            if let Err(e) = user.save_scripts() {
                tracing::warn!(user = %user.email(), error = %e, "Failed to save scripts");
            }
        }
        let file = AccountsFile {
            users: users.iter().map(|u| AccountConfig::from_session(u)).collect(),
        };
        file.save(&self.config.accounts)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
