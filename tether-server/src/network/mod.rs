//! Network sessions.
//!
//! One [`NetworkSession`] per IRC network a user is on. The session is owned
//! by a single spawned task that processes, strictly one at a time, the
//! protocol events of its connection and the commands sent to it through a
//! [`NetworkHandle`]. Channel state, the WHOIS cache and the outbound message
//! path are only ever mutated from that task.
//!
//! Read-mostly state (identity, channel table, LIST result, scripts) is
//! mirrored in [`NetworkShared`] so the API layer and the delivery
//! multiplexer can take a snapshot without waiting on the task, which may be
//! blocked on a full outbox.

pub mod handlers;
pub mod whois;

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use tether_sdk::client::{self, ClientHandle, ConnectConfig};
use tether_sdk::event::Event;

use crate::channel::{ChannelState, ChannelTable};
use crate::message::Message;
use crate::outbox::Outbox;
use crate::protocol::{CommandResponse, NetData, Payload};
use crate::script::{self, Direction, Disposition, Script, ScriptEvent};
use crate::split;
use crate::user::{Services, UserSession};
use whois::WhoisCache;

/// Commands a session may queue before its task picks them up.
const MAILBOX_CAPACITY: usize = 64;

/// Verbs `send` knows how to put on the wire.
const WIRE_COMMANDS: &[&str] = &[
    "privmsg", "action", "notice", "topic", "join", "part", "nick", "whois", "invite",
];

/// Persisted identity of one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub nick: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub realname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    /// Channels that were open when the configuration was saved.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl NetworkConfig {
    fn connect_config(&self) -> ConnectConfig {
        let user = if self.user.is_empty() { &self.nick } else { &self.user };
        let realname = if self.realname.is_empty() { &self.nick } else { &self.realname };
        ConnectConfig {
            server_addr: format!("{}:{}", self.ip, self.port),
            nick: self.nick.clone(),
            user: user.clone(),
            realname: realname.clone(),
            password: Some(self.password.clone()).filter(|p| !p.is_empty()),
            tls: self.ssl,
        }
    }
}

#[derive(Debug, Clone)]
struct NetworkInfo {
    config: NetworkConfig,
    /// Nick confirmed by the server; the configured one until registration.
    nick: String,
    connected: bool,
}

pub(crate) struct NetworkShared {
    info: RwLock<NetworkInfo>,
    channels: RwLock<ChannelTable>,
    channel_list: RwLock<Vec<String>>,
    scripts: RwLock<Vec<Arc<dyn Script>>>,
    outbox: Outbox,
}

#[derive(Debug, thiserror::Error)]
#[error("network session {0} has shut down")]
pub struct SessionClosed(pub String);

pub(crate) enum NetworkCommand {
    Connect,
    Disconnect,
    ForceDisconnect,
    Shutdown(oneshot::Sender<()>),
    Send {
        channel: String,
        command: String,
        body: String,
    },
    Redirect {
        message: Message,
        direction: Direction,
    },
    Raw(String),
    Kick {
        channel: String,
        nick: String,
        reason: String,
    },
    Mode {
        channel: String,
        modes: String,
    },
    OpenChannel(String),
    CloseChannel(String),
    SetNick(String),
}

/// Cloneable handle to a running network session.
#[derive(Clone)]
pub struct NetworkHandle {
    shared: Arc<NetworkShared>,
    mailbox: mpsc::Sender<NetworkCommand>,
}

impl NetworkHandle {
    pub fn name(&self) -> String {
        self.shared.info.read().config.name.clone()
    }

    pub fn nick(&self) -> String {
        self.shared.info.read().nick.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.info.read().connected
    }

    pub fn net_data(&self) -> NetData {
        net_data(&self.shared.info.read())
    }

    /// Snapshot of every tracked channel.
    pub fn active_channels(&self) -> Vec<ChannelState> {
        self.shared.channels.read().iter().cloned().collect()
    }

    /// Channel names from the last LIST reply.
    pub fn all_channels(&self) -> Vec<String> {
        self.shared.channel_list.read().clone()
    }

    pub fn scripts(&self) -> Vec<Arc<dyn Script>> {
        self.shared.scripts.read().clone()
    }

    /// Add a script, replacing one with the same name. Returns `true` if the
    /// name was new.
    pub fn add_script(&self, script: Arc<dyn Script>) -> bool {
        script::upsert(&mut self.shared.scripts.write(), script)
    }

    pub fn remove_script(&self, name: &str) -> bool {
        script::remove(&mut self.shared.scripts.write(), name)
    }

    /// Configuration to persist, with the currently tracked channel set.
    pub fn config(&self) -> NetworkConfig {
        let mut config = self.shared.info.read().config.clone();
        config.channels = self.shared.channels.read().names();
        config
    }

    pub fn outbox(&self) -> Outbox {
        self.shared.outbox.clone()
    }

    // Identity setters take effect on the next connect.

    pub fn set_realname(&self, realname: &str) {
        self.shared.info.write().config.realname = realname.to_string();
    }

    pub fn set_user(&self, user: &str) {
        self.shared.info.write().config.user = user.to_string();
    }

    pub fn set_ip(&self, ip: &str) {
        self.shared.info.write().config.ip = ip.to_string();
    }

    pub fn set_port(&self, port: u16) {
        self.shared.info.write().config.port = port;
    }

    pub fn set_ssl(&self, ssl: bool) {
        self.shared.info.write().config.ssl = ssl;
    }

    pub fn set_password(&self, password: &str) {
        self.shared.info.write().config.password = password.to_string();
    }

    pub(crate) fn set_name(&self, name: &str) {
        self.shared.info.write().config.name = name.to_string();
    }

    /// Change the configured nick and, when connected, ask the server for it.
    pub async fn set_nick(&self, nick: &str) -> Result<(), SessionClosed> {
        self.command(NetworkCommand::SetNick(nick.to_string())).await
    }

    pub async fn connect(&self) -> Result<(), SessionClosed> {
        self.command(NetworkCommand::Connect).await
    }

    /// Send QUIT. Only has an effect while connected.
    pub async fn disconnect(&self) -> Result<(), SessionClosed> {
        self.command(NetworkCommand::Disconnect).await
    }

    /// Drop the connection without a QUIT.
    pub async fn force_disconnect(&self) -> Result<(), SessionClosed> {
        self.command(NetworkCommand::ForceDisconnect).await
    }

    /// Send a message as the user, through the script pipeline.
    pub async fn send(&self, channel: &str, command: &str, body: &str) -> Result<(), SessionClosed> {
        self.command(NetworkCommand::Send {
            channel: channel.to_string(),
            command: command.to_string(),
            body: body.to_string(),
        })
        .await
    }

    pub async fn raw(&self, line: &str) -> Result<(), SessionClosed> {
        self.command(NetworkCommand::Raw(line.to_string())).await
    }

    pub async fn kick(&self, channel: &str, nick: &str, reason: &str) -> Result<(), SessionClosed> {
        self.command(NetworkCommand::Kick {
            channel: channel.to_string(),
            nick: nick.to_string(),
            reason: reason.to_string(),
        })
        .await
    }

    pub async fn mode(&self, channel: &str, modes: &str) -> Result<(), SessionClosed> {
        self.command(NetworkCommand::Mode {
            channel: channel.to_string(),
            modes: modes.to_string(),
        })
        .await
    }

    /// Start tracking `channel` without joining it.
    pub async fn open_channel(&self, channel: &str) -> Result<(), SessionClosed> {
        self.command(NetworkCommand::OpenChannel(channel.to_string())).await
    }

    /// Stop tracking `channel`.
    pub async fn close_channel(&self, channel: &str) -> Result<(), SessionClosed> {
        self.command(NetworkCommand::CloseChannel(channel.to_string())).await
    }

    /// Quit, stop the session task and wait for it to finish.
    pub async fn shutdown(&self) -> Result<(), SessionClosed> {
        // Frees a task stuck pushing into a full outbox nobody reads.
        self.shared.outbox.close();
        let (tx, rx) = oneshot::channel();
        self.command(NetworkCommand::Shutdown(tx)).await?;
        rx.await.map_err(|_| SessionClosed(self.name()))
    }

    /// Hand a message another network's scripts moved here.
    ///
    /// Never waits: a full mailbox defers the hand-off to a task so two
    /// sessions redirecting into each other cannot block one another.
    pub(crate) fn redirect(&self, message: Message, direction: Direction) {
        let cmd = NetworkCommand::Redirect { message, direction };
        match self.mailbox.try_send(cmd) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                let mailbox = self.mailbox.clone();
                tokio::spawn(async move {
                    let _ = mailbox.send(cmd).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(network = %self.name(), "Redirect to stopped network dropped");
            }
        }
    }

    fn is(&self, shared: &Arc<NetworkShared>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    async fn command(&self, cmd: NetworkCommand) -> Result<(), SessionClosed> {
        self.mailbox.send(cmd).await.map_err(|_| SessionClosed(self.name()))
    }
}

fn net_data(info: &NetworkInfo) -> NetData {
    NetData {
        name: info.config.name.clone(),
        user: info.config.user.clone(),
        realname: info.config.realname.clone(),
        nick: info.nick.clone(),
        ip: info.config.ip.clone(),
        port: info.config.port,
        ssl: info.config.ssl,
        connected: info.connected,
    }
}

/// Start a session task for `config` and return its handle.
pub(crate) fn spawn(
    config: NetworkConfig,
    email: &str,
    owner: Weak<UserSession>,
    services: Arc<Services>,
    connect: bool,
) -> NetworkHandle {
    let session = NetworkSession::new(config, email, owner, services);
    let (mailbox, commands) = mpsc::channel(MAILBOX_CAPACITY);
    if connect {
        let _ = mailbox.try_send(NetworkCommand::Connect);
    }
    let handle = NetworkHandle {
        shared: session.shared.clone(),
        mailbox,
    };
    tokio::spawn(session.run(commands));
    handle
}

pub(crate) struct NetworkSession {
    shared: Arc<NetworkShared>,
    link: Option<ClientHandle>,
    events: Option<mpsc::Receiver<Event>>,
    whois: WhoisCache,
    owner: Weak<UserSession>,
    services: Arc<Services>,
    email: String,
}

impl NetworkSession {
    pub(crate) fn new(
        config: NetworkConfig,
        email: &str,
        owner: Weak<UserSession>,
        services: Arc<Services>,
    ) -> Self {
        let mut channels = ChannelTable::new();
        for name in &config.channels {
            channels.ensure(name, &config.name);
        }
        let shared = NetworkShared {
            info: RwLock::new(NetworkInfo {
                nick: config.nick.clone(),
                config,
                connected: false,
            }),
            channels: RwLock::new(channels),
            channel_list: RwLock::new(Vec::new()),
            scripts: RwLock::new(Vec::new()),
            outbox: Outbox::new(services.options.queue_capacity),
        };
        Self {
            shared: Arc::new(shared),
            link: None,
            events: None,
            whois: WhoisCache::default(),
            owner,
            services,
            email: email.to_string(),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<NetworkCommand>) {
        loop {
            tokio::select! {
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.dispatch(event).await,
                    None => self.link_lost("connection closed").await,
                },
                cmd = commands.recv() => match cmd {
                    Some(NetworkCommand::Shutdown(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(cmd) => self.execute(cmd).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
        tracing::debug!(network = %self.name(), "Network session stopped");
    }

    async fn execute(&mut self, cmd: NetworkCommand) {
        match cmd {
            NetworkCommand::Connect => self.connect().await,
            NetworkCommand::Disconnect => self.disconnect().await,
            NetworkCommand::ForceDisconnect => self.force_disconnect().await,
            NetworkCommand::Shutdown(ack) => {
                self.shutdown().await;
                let _ = ack.send(());
            }
            NetworkCommand::Send { channel, command, body } => {
                self.send(&channel, &command, &body).await
            }
            NetworkCommand::Redirect { message, direction } => match direction {
                Direction::Receive => {
                    self.receive(&message.channel, &message.sender, &message.command, &message.body)
                        .await
                }
                Direction::Send => self.send(&message.channel, &message.command, &message.body).await,
            },
            NetworkCommand::Raw(line) => {
                if let Some(link) = self.require_link().await {
                    if let Err(e) = link.raw(&line).await {
                        tracing::warn!(network = %self.name(), error = %e, "Raw write failed");
                    }
                }
            }
            NetworkCommand::Kick { channel, nick, reason } => {
                if let Some(link) = self.require_link().await {
                    if let Err(e) = link.kick(&channel, &nick, &reason).await {
                        tracing::warn!(network = %self.name(), error = %e, "Kick write failed");
                    }
                }
            }
            NetworkCommand::Mode { channel, modes } => {
                if let Some(link) = self.require_link().await {
                    if let Err(e) = link.mode(&channel, &modes).await {
                        tracing::warn!(network = %self.name(), error = %e, "Mode write failed");
                    }
                }
            }
            NetworkCommand::OpenChannel(name) => {
                let state = {
                    let network = self.name();
                    let mut channels = self.shared.channels.write();
                    channels.ensure(&name, &network).clone()
                };
                self.emit(Payload::ChanData(state)).await;
            }
            NetworkCommand::CloseChannel(name) => {
                self.shared.channels.write().remove(&name);
            }
            NetworkCommand::SetNick(nick) => {
                {
                    let mut info = self.shared.info.write();
                    info.config.nick = nick.clone();
                    if !info.connected {
                        info.nick = nick.clone();
                    }
                }
                if self.link.is_some() {
                    self.send("", "nick", &nick).await;
                } else {
                    self.emit_net_data().await;
                }
            }
        }
    }

    fn name(&self) -> String {
        self.shared.info.read().config.name.clone()
    }

    /// Network name and current nick.
    fn identity(&self) -> (String, String) {
        let info = self.shared.info.read();
        (info.config.name.clone(), info.nick.clone())
    }

    async fn emit(&self, payload: Payload) {
        self.shared.outbox.push(payload).await;
    }

    async fn emit_net_data(&self) {
        let data = net_data(&self.shared.info.read());
        self.emit(Payload::NetData(data)).await;
    }

    /// Tell the user a request of theirs could not be carried out.
    async fn reject(&self, message: String) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        owner
            .account_outbox()
            .push(Payload::CommandResponse(CommandResponse {
                success: false,
                message,
            }))
            .await;
    }

    async fn require_link(&self) -> Option<ClientHandle> {
        match &self.link {
            Some(link) => Some(link.clone()),
            None => {
                self.reject(format!("{} is not connected", self.name())).await;
                None
            }
        }
    }

    async fn connect(&mut self) {
        if self.link.is_some() {
            tracing::debug!(network = %self.name(), "Already connected");
            return;
        }
        let config = self.shared.info.read().config.connect_config();
        tracing::info!(network = %self.name(), addr = %config.server_addr, tls = config.tls, "Connecting");
        match client::connect(config).await {
            Ok((link, events)) => {
                self.link = Some(link);
                self.events = Some(events);
            }
            Err(e) => tracing::warn!(network = %self.name(), error = %e, "Connect failed"),
        }
    }

    async fn disconnect(&mut self) {
        let Some(link) = self.link.clone().filter(|_| self.shared.info.read().connected) else {
            tracing::debug!(network = %self.name(), "Disconnect while not connected ignored");
            return;
        };
        if let Err(e) = link.quit(Some(&self.services.options.quit_message)).await {
            tracing::warn!(network = %self.name(), error = %e, "Quit failed");
            self.link_lost("quit failed").await;
        }
    }

    async fn force_disconnect(&mut self) {
        if self.link.is_some() || self.events.is_some() {
            tracing::info!(network = %self.name(), "Force disconnect");
        }
        self.link_lost("forced").await;
    }

    async fn shutdown(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.quit(Some(&self.services.options.quit_message)).await;
        }
        self.events = None;
        self.shared.info.write().connected = false;
        self.shared.outbox.close();
    }

    /// Forget the connection. Emits a connection-status update if we were
    /// registered.
    async fn link_lost(&mut self, reason: &str) {
        self.link = None;
        self.events = None;
        let was_connected = std::mem::replace(&mut self.shared.info.write().connected, false);
        if was_connected {
            tracing::info!(network = %self.name(), reason, "Disconnected");
            self.emit_net_data().await;
        }
    }

    /// An incoming chat-visible event.
    pub(crate) async fn receive(&mut self, channel: &str, sender: &str, command: &str, body: &str) {
        if channel == "AUTH" || channel == "*" {
            return;
        }
        let (network, nick) = self.identity();
        let mut msg = Message::new(&network, channel, sender, command, body);
        msg.own = sender == nick || (command == "nick" && body == nick);

        if channel.eq_ignore_ascii_case(&nick) && !sender.is_empty() {
            msg.channel = sender.to_string();
            let created = {
                let mut channels = self.shared.channels.write();
                let created = !channels.contains(sender);
                created.then(|| channels.ensure(sender, &network).clone())
            };
            if let Some(state) = created {
                self.emit(Payload::ChanData(state)).await;
            }
        }

        if let Some(msg) = self.pipeline(msg, Direction::Receive) {
            self.insert_and_send(msg).await;
        }
    }

    /// An outgoing message from the user.
    ///
    /// Long bodies are split and every piece goes through the whole send
    /// path again, in order.
    pub(crate) async fn send(&mut self, channel: &str, command: &str, body: &str) {
        let mut queue = VecDeque::from([(channel.to_string(), command.to_string(), body.to_string())]);
        while let Some((channel, command, body)) = queue.pop_front() {
            let (network, nick) = self.identity();
            let mut msg = Message::new(&network, &channel, &nick, &command, &body);
            msg.own = true;
            let Some(msg) = self.pipeline(msg, Direction::Send) else {
                continue;
            };

            let pieces = split::all(&msg.body);
            if pieces.len() > 1 {
                for piece in pieces.into_iter().rev().filter(|p| !p.is_empty()) {
                    queue.push_front((msg.channel.clone(), msg.command.clone(), piece));
                }
                continue;
            }

            if self.write_wire(&msg).await {
                self.insert_and_send(msg).await;
            }
        }
    }

    /// Write `msg` to the server. Returns whether it should be stored
    /// locally.
    ///
    /// Chat lines are stored once written. Topic, membership, nick, whois and
    /// invite requests are only written; the server's echo is what gets
    /// recorded. Anything else never reaches the wire but is still stored.
    async fn write_wire(&mut self, msg: &Message) -> bool {
        let command = msg.command.as_str();
        if msg.channel.starts_with('*') || !WIRE_COMMANDS.contains(&command) {
            return !command.is_empty();
        }
        let Some(link) = self.link.clone() else {
            self.reject(format!("{} is not connected", msg.network)).await;
            return false;
        };

        let (target, body) = (msg.channel.as_str(), msg.body.as_str());
        let written = match command {
            "privmsg" => link.privmsg(target, body).await.map(|_| true),
            "action" => link.action(target, body).await.map(|_| true),
            "notice" => link.notice(target, body).await.map(|_| true),
            "topic" => link.topic(target, body).await.map(|_| false),
            "join" => link.join(target).await.map(|_| false),
            "part" => link.part(target, body).await.map(|_| false),
            "nick" => link.nick(body).await.map(|_| false),
            "whois" => link.whois(target).await.map(|_| false),
            "invite" => link.invite(body, target).await.map(|_| false),
            _ => Ok(false),
        };
        written.unwrap_or_else(|e| {
            tracing::warn!(network = %msg.network, command, error = %e, "Write failed");
            false
        })
    }

    /// Run the script chain. Returns the message to deliver locally, or
    /// `None` when it was cancelled or handed to another network.
    fn pipeline(&self, message: Message, direction: Direction) -> Option<Message> {
        let (network, nick) = self.identity();
        let mut event = ScriptEvent::new(&network, &nick, direction, message);

        let own = self.shared.scripts.read().clone();
        let owner = self.owner.upgrade();
        let global = owner.as_ref().map(|u| u.global_scripts()).unwrap_or_default();
        let lookup = |target: &str| {
            owner
                .as_ref()?
                .network(target)
                .filter(|handle| !handle.is(&self.shared))
        };

        match script::run_chain(&mut event, own.iter().chain(global.iter()), lookup) {
            Disposition::Deliver => Some(event.message),
            Disposition::Cancelled => {
                tracing::debug!(network = %network, %direction, channel = %event.message.channel, "Message cancelled by script");
                None
            }
            Disposition::Redirect(target) => {
                tracing::debug!(network = %network, target = %event.message.network, %direction, "Message redirected by script");
                target.redirect(event.message, direction);
                None
            }
        }
    }

    /// Persist `msg` and queue it for the user.
    async fn insert_and_send(&self, mut msg: Message) {
        if msg.command.is_empty() {
            return;
        }
        msg.preview = self.services.previewer.preview(&msg.body).await;
        match self.services.store.insert(&self.email, &msg) {
            Ok(id) => msg.id = Some(id),
            Err(e) => tracing::warn!(network = %msg.network, channel = %msg.channel, error = %e, "Failed to store message"),
        }
        self.emit(Payload::Message(msg)).await;
    }

    #[cfg(test)]
    fn attach_link(&mut self, link: ClientHandle) {
        self.link = Some(link);
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<Event>>) -> Option<Event> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Db, MessageStore};
    use crate::outbox::OutboxReader;
    use crate::preview::NoPreview;
    use crate::script::NativeScript;
    use crate::user::SessionOptions;
    use tether_sdk::client::Command;

    fn services(store: Arc<Db>) -> Arc<Services> {
        Arc::new(Services {
            store,
            previewer: Arc::new(NoPreview),
            options: SessionOptions::default(),
        })
    }

    fn config(name: &str) -> NetworkConfig {
        NetworkConfig {
            name: name.into(),
            nick: "me".into(),
            user: "me".into(),
            realname: "Me".into(),
            password: String::new(),
            ip: "127.0.0.1".into(),
            port: 6667,
            ssl: false,
            channels: vec!["#rust".into()],
        }
    }

    struct Fixture {
        session: NetworkSession,
        store: Arc<Db>,
        wire: mpsc::Receiver<Command>,
        outbox: OutboxReader,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(Db::open_memory().unwrap());
        let mut session = NetworkSession::new(config("libera"), "a@x", Weak::new(), services(store.clone()));
        let (link, wire) = ClientHandle::channel(16);
        session.attach_link(link);
        let outbox = session.shared.outbox.take().await;
        Fixture {
            session,
            store,
            wire,
            outbox,
        }
    }

    fn stored(store: &Db) -> Vec<Message> {
        let mut all = store.history("a@x", None, None, 100).unwrap();
        all.reverse();
        all
    }

    #[tokio::test]
    async fn receive_persists_and_queues() {
        let mut f = fixture().await;
        f.session.receive("#rust", "bob", "privmsg", "hello").await;

        let Some(Payload::Message(msg)) = f.outbox.recv().await else {
            panic!("expected a message");
        };
        assert_eq!(msg.channel, "#rust");
        assert!(!msg.own);
        assert!(msg.id.is_some());
        assert_eq!(stored(&f.store).len(), 1);
    }

    #[tokio::test]
    async fn pseudo_channels_are_dropped() {
        let mut f = fixture().await;
        f.session.receive("AUTH", "srv", "privmsg", "*** Looking up").await;
        f.session.receive("*", "srv", "privmsg", "hi").await;
        assert!(stored(&f.store).is_empty());
        assert!(f.session.shared.outbox.is_empty());
    }

    #[tokio::test]
    async fn direct_message_uses_sender_as_channel() {
        let mut f = fixture().await;
        f.session.receive("me", "bob", "privmsg", "psst").await;

        let Some(Payload::ChanData(state)) = f.outbox.recv().await else {
            panic!("expected channel data for the new query");
        };
        assert_eq!(state.name, "bob");
        let Some(Payload::Message(msg)) = f.outbox.recv().await else {
            panic!("expected a message");
        };
        assert_eq!(msg.channel, "bob");
        assert!(f.session.shared.channels.read().contains("bob"));
    }

    #[tokio::test]
    async fn cancelling_script_prevents_persistence() {
        let mut f = fixture().await;
        f.session.shared.scripts.write().push(Arc::new(NativeScript::new("mute", |e| {
            e.cancel();
            Ok(())
        })));
        f.session.receive("#rust", "bob", "privmsg", "spam").await;
        f.session.send("#rust", "privmsg", "reply").await;
        assert!(stored(&f.store).is_empty());
        assert!(f.session.shared.outbox.is_empty());
        assert!(f.wire.try_recv().is_err());
    }

    #[tokio::test]
    async fn redirect_to_unknown_network_stays_local() {
        let mut f = fixture().await;
        f.session.shared.scripts.write().push(Arc::new(NativeScript::new("move", |e| {
            e.message.network = "nowhere".into();
            Ok(())
        })));
        f.session.receive("#rust", "bob", "privmsg", "hi").await;
        let msgs = stored(&f.store);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].network, "libera");
    }

    #[tokio::test]
    async fn long_send_is_split_and_each_piece_stored() {
        let mut f = fixture().await;
        let body = "x".repeat(600);
        f.session.send("#rust", "privmsg", &body).await;

        let mut lengths = Vec::new();
        while let Ok(Command::Privmsg { target, text }) = f.wire.try_recv() {
            assert_eq!(target, "#rust");
            lengths.push(text.len());
        }
        assert_eq!(lengths, vec![250, 250, 100]);

        let msgs = stored(&f.store);
        let stored_lengths: Vec<usize> = msgs.iter().map(|m| m.body.len()).collect();
        assert_eq!(stored_lengths, vec![250, 250, 100]);
        assert!(msgs.iter().all(|m| m.own && m.sender == "me"));
    }

    #[tokio::test]
    async fn multiline_send_goes_out_line_by_line() {
        let mut f = fixture().await;
        f.session.send("#rust", "action", "one\n\ntwo").await;
        assert_eq!(
            f.wire.try_recv().unwrap(),
            Command::Action {
                target: "#rust".into(),
                text: "one".into()
            }
        );
        assert_eq!(
            f.wire.try_recv().unwrap(),
            Command::Action {
                target: "#rust".into(),
                text: "two".into()
            }
        );
        assert_eq!(stored(&f.store).len(), 2);
    }

    #[tokio::test]
    async fn membership_requests_are_written_but_not_stored() {
        let mut f = fixture().await;
        f.session.send("#go", "join", "").await;
        f.session.send("#go", "topic", "new topic").await;
        assert_eq!(f.wire.try_recv().unwrap(), Command::Join("#go".into()));
        assert!(matches!(f.wire.try_recv().unwrap(), Command::Topic { .. }));
        assert!(stored(&f.store).is_empty());
    }

    #[tokio::test]
    async fn unknown_commands_are_stored_without_writing() {
        let mut f = fixture().await;
        f.session.send("#rust", "note", "remember this").await;
        f.session.send("*status", "privmsg", "local only").await;
        f.session.send("#rust", "", "nothing").await;
        assert!(f.wire.try_recv().is_err());
        let commands: Vec<String> = stored(&f.store).into_iter().map(|m| m.command).collect();
        assert_eq!(commands, vec!["note", "privmsg"]);
    }

    #[tokio::test]
    async fn send_without_link_is_not_stored() {
        let mut f = fixture().await;
        f.session.link = None;
        f.session.send("#rust", "privmsg", "hello?").await;
        assert!(stored(&f.store).is_empty());
    }

    #[tokio::test]
    async fn force_disconnect_is_idempotent() {
        let mut f = fixture().await;
        f.session.shared.info.write().connected = true;
        f.session.force_disconnect().await;
        f.session.force_disconnect().await;
        assert!(f.session.link.is_none());
        let Some(Payload::NetData(data)) = f.outbox.recv().await else {
            panic!("expected a status update");
        };
        assert!(!data.connected);
        assert!(f.session.shared.outbox.is_empty());
    }

    #[tokio::test]
    async fn nick_change_asks_server_when_linked() {
        let mut f = fixture().await;
        f.session.execute(NetworkCommand::SetNick("me2".into())).await;
        assert_eq!(f.wire.try_recv().unwrap(), Command::Nick("me2".into()));
        assert_eq!(f.session.shared.info.read().config.nick, "me2");

        f.session.link = None;
        f.session.execute(NetworkCommand::SetNick("me3".into())).await;
        let Some(Payload::NetData(data)) = f.outbox.recv().await else {
            panic!("expected a status update");
        };
        assert_eq!(data.nick, "me3");
    }

    #[tokio::test]
    async fn saved_config_carries_current_channels() {
        let f = fixture().await;
        f.session.shared.channels.write().ensure("#go", "libera");
        let handle = NetworkHandle {
            shared: f.session.shared.clone(),
            mailbox: mpsc::channel(1).0,
        };
        assert_eq!(handle.config().channels, vec!["#go", "#rust"]);
        handle.set_port(6697);
        handle.set_ssl(true);
        let data = handle.net_data();
        assert_eq!((data.port, data.ssl, data.connected), (6697, true, false));
    }
}
