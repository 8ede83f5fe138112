//! IRC client connection.
//!
//! Manages the TCP (optionally TLS) socket, registration, and keep-alive for
//! one network, and emits [`Event`]s. The bouncer drives it through a
//! [`ClientHandle`].
//!
//! ## Reconnection
//!
//! There is no automatic reconnection. When the connection drops the task
//! sends [`Event::Disconnected`] and closes the event channel; reconnecting
//! is always the caller's decision.
//!
//! ## Teardown
//!
//! Dropping every clone of the [`ClientHandle`] closes the command channel,
//! which ends the connection task without a QUIT.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use crate::event::Event;
use crate::irc::Message;

/// Configuration for connecting to an IRC server.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Server address (host:port).
    pub server_addr: String,
    /// Desired nickname.
    pub nick: String,
    /// Username (ident).
    pub user: String,
    /// Real name.
    pub realname: String,
    /// Server password sent with PASS, if any.
    pub password: Option<String>,
    /// Use TLS.
    pub tls: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:6667".to_string(),
            nick: "tether".to_string(),
            user: "tether".to_string(),
            realname: "tether bouncer".to_string(),
            password: None,
            tls: false,
        }
    }
}

/// Commands the consumer can send to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Privmsg { target: String, text: String },
    Action { target: String, text: String },
    Notice { target: String, text: String },
    Topic { channel: String, topic: String },
    Join(String),
    Part { channel: String, reason: String },
    Nick(String),
    Whois(String),
    Invite { nick: String, channel: String },
    Kick { channel: String, nick: String, reason: String },
    Mode { target: String, modes: String },
    List,
    Raw(String),
    Quit(Option<String>),
}

impl Command {
    /// The wire line for this command, without CRLF.
    pub fn to_line(&self) -> String {
        match self {
            Command::Privmsg { target, text } => format!("PRIVMSG {target} :{text}"),
            Command::Action { target, text } => format!("PRIVMSG {target} :\u{1}ACTION {text}\u{1}"),
            Command::Notice { target, text } => format!("NOTICE {target} :{text}"),
            Command::Topic { channel, topic } => format!("TOPIC {channel} :{topic}"),
            Command::Join(channel) => format!("JOIN {channel}"),
            Command::Part { channel, reason } if reason.is_empty() => format!("PART {channel}"),
            Command::Part { channel, reason } => format!("PART {channel} :{reason}"),
            Command::Nick(nick) => format!("NICK {nick}"),
            Command::Whois(nick) => format!("WHOIS {nick}"),
            Command::Invite { nick, channel } => format!("INVITE {nick} {channel}"),
            Command::Kick { channel, nick, reason } if reason.is_empty() => {
                format!("KICK {channel} {nick}")
            }
            Command::Kick { channel, nick, reason } => format!("KICK {channel} {nick} :{reason}"),
            Command::Mode { target, modes } if modes.is_empty() => format!("MODE {target}"),
            Command::Mode { target, modes } => format!("MODE {target} {modes}"),
            Command::List => "LIST".to_string(),
            Command::Raw(line) => line.trim_end_matches(['\r', '\n']).to_string(),
            Command::Quit(Some(reason)) => format!("QUIT :{reason}"),
            Command::Quit(None) => "QUIT".to_string(),
        }
    }
}

/// A handle to a running IRC client connection.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    /// A handle wired to a plain command channel instead of a socket.
    ///
    /// Whatever is sent through the handle shows up on the receiver.
    pub fn channel(capacity: usize) -> (ClientHandle, mpsc::Receiver<Command>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        (ClientHandle { cmd_tx }, cmd_rx)
    }

    /// Queue a command. Fails once the connection task has exited.
    pub async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }

    pub async fn privmsg(&self, target: &str, text: &str) -> Result<()> {
        self.send(Command::Privmsg {
            target: target.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn action(&self, target: &str, text: &str) -> Result<()> {
        self.send(Command::Action {
            target: target.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn notice(&self, target: &str, text: &str) -> Result<()> {
        self.send(Command::Notice {
            target: target.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn topic(&self, channel: &str, topic: &str) -> Result<()> {
        self.send(Command::Topic {
            channel: channel.to_string(),
            topic: topic.to_string(),
        })
        .await
    }

    pub async fn join(&self, channel: &str) -> Result<()> {
        self.send(Command::Join(channel.to_string())).await
    }

    pub async fn part(&self, channel: &str, reason: &str) -> Result<()> {
        self.send(Command::Part {
            channel: channel.to_string(),
            reason: reason.to_string(),
        })
        .await
    }

    pub async fn nick(&self, nick: &str) -> Result<()> {
        self.send(Command::Nick(nick.to_string())).await
    }

    pub async fn whois(&self, nick: &str) -> Result<()> {
        self.send(Command::Whois(nick.to_string())).await
    }

    pub async fn invite(&self, nick: &str, channel: &str) -> Result<()> {
        self.send(Command::Invite {
            nick: nick.to_string(),
            channel: channel.to_string(),
        })
        .await
    }

    pub async fn kick(&self, channel: &str, nick: &str, reason: &str) -> Result<()> {
        self.send(Command::Kick {
            channel: channel.to_string(),
            nick: nick.to_string(),
            reason: reason.to_string(),
        })
        .await
    }

    pub async fn mode(&self, target: &str, modes: &str) -> Result<()> {
        self.send(Command::Mode {
            target: target.to_string(),
            modes: modes.to_string(),
        })
        .await
    }

    pub async fn list(&self) -> Result<()> {
        self.send(Command::List).await
    }

    pub async fn raw(&self, line: &str) -> Result<()> {
        self.send(Command::Raw(line.to_string())).await
    }

    pub async fn quit(&self, message: Option<&str>) -> Result<()> {
        self.send(Command::Quit(message.map(str::to_string))).await
    }
}

/// A connection that has completed TCP (and optionally TLS) but hasn't
/// started IRC registration yet.
pub enum EstablishedConnection {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

/// Establish TCP (and optionally TLS) connection to the server.
pub async fn establish_connection(config: &ConnectConfig) -> Result<EstablishedConnection> {
    let mode = if config.tls { "TLS" } else { "plain" };

    tracing::debug!(addr = %config.server_addr, "Resolving");
    let tcp = TcpStream::connect(&config.server_addr)
        .await
        .map_err(|e| anyhow::anyhow!("TCP connect to {} failed: {e}", config.server_addr))?;
    tracing::debug!(addr = %config.server_addr, "TCP connected ({mode})");

    if !config.tls {
        return Ok(EstablishedConnection::Plain(tcp));
    }

    let connector = TlsConnector::from(Arc::new(rustls_default_config()));
    let host = config
        .server_addr
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(&config.server_addr);
    let dns_name = rustls::pki_types::ServerName::try_from(host.to_string())?;
    let tls_stream = connector
        .connect(dns_name, tcp)
        .await
        .map_err(|e| anyhow::anyhow!("TLS handshake with {} failed: {e}", config.server_addr))?;
    tracing::debug!(addr = %config.server_addr, "TLS handshake complete");
    Ok(EstablishedConnection::Tls(tls_stream))
}

/// Connect using an already-established connection.
///
/// Returns a handle for sending commands and a receiver for events.
/// The IRC protocol runs in a spawned task.
pub fn connect_with_stream(
    conn: EstablishedConnection,
    config: ConnectConfig,
) -> (ClientHandle, mpsc::Receiver<Event>) {
    let (event_tx, event_rx) = mpsc::channel(4096);
    let (cmd_tx, cmd_rx) = mpsc::channel(256);

    tokio::spawn(async move {
        let _ = event_tx.send(Event::Connected).await;
        let result = match conn {
            EstablishedConnection::Plain(tcp) => {
                let (reader, writer) = tokio::io::split(tcp);
                run_irc(BufReader::new(reader), writer, &config, event_tx.clone(), cmd_rx).await
            }
            EstablishedConnection::Tls(tls) => {
                let (reader, writer) = tokio::io::split(tls);
                run_irc(BufReader::new(reader), writer, &config, event_tx.clone(), cmd_rx).await
            }
        };
        if let Err(e) = result {
            let _ = event_tx
                .send(Event::Disconnected {
                    reason: e.to_string(),
                })
                .await;
        }
    });

    (ClientHandle { cmd_tx }, event_rx)
}

/// Establish the connection and start the protocol task.
pub async fn connect(config: ConnectConfig) -> Result<(ClientHandle, mpsc::Receiver<Event>)> {
    let conn = establish_connection(&config).await?;
    Ok(connect_with_stream(conn, config))
}

fn install_crypto_provider() {
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    install_crypto_provider();

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

async fn run_irc<R, W>(
    mut reader: R,
    mut writer: W,
    config: &ConnectConfig,
    event_tx: mpsc::Sender<Event>,
    mut cmd_rx: mpsc::Receiver<Command>,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
        write_line(&mut writer, &format!("PASS {password}")).await?;
    }
    write_line(&mut writer, &format!("NICK {}", config.nick)).await?;
    write_line(
        &mut writer,
        &format!("USER {} 0 * :{}", config.user, config.realname),
    )
    .await?;

    let mut registered = false;
    let mut nick_tries: u32 = 0;
    let mut pending_commands: Vec<Command> = Vec::new();
    let mut line_buf: Vec<u8> = Vec::new();
    let mut last_activity = tokio::time::Instant::now();
    let ping_interval = tokio::time::Duration::from_secs(60);
    let ping_timeout = tokio::time::Duration::from_secs(120);

    loop {
        tokio::select! {
            // Invalid UTF-8 is replaced, never fatal.
            result = reader.read_until(b'\n', &mut line_buf) => {
                let n = result?;
                if n == 0 {
                    let _ = event_tx.send(Event::Disconnected { reason: "EOF".to_string() }).await;
                    break;
                }
                last_activity = tokio::time::Instant::now();

                let line = String::from_utf8_lossy(&line_buf).into_owned();
                line_buf.clear();
                if let Some(msg) = Message::parse(&line) {
                    match msg.command.as_str() {
                        "PING" => {
                            write_line(&mut writer, &format!("PONG :{}", msg.param(0))).await?;
                        }
                        // ERR_NICKNAMEINUSE before registration: try a suffixed variant.
                        "433" if !registered => {
                            nick_tries = nick_tries.saturating_add(1);
                            if nick_tries <= 5 {
                                let alt = format!("{}{}", config.nick, "_".repeat(nick_tries as usize));
                                tracing::debug!(nick = %alt, "Nick in use, retrying");
                                write_line(&mut writer, &format!("NICK {alt}")).await?;
                            }
                        }
                        "ERROR" => {
                            let reason = msg.param(0).to_string();
                            let _ = event_tx.send(Event::Disconnected { reason }).await;
                            break;
                        }
                        "001" => {
                            registered = true;
                            for cmd in pending_commands.drain(..) {
                                write_line(&mut writer, &cmd.to_line()).await?;
                            }
                        }
                        _ => {}
                    }
                    if let Some(event) = Event::from_message(&msg) {
                        // Receiver gone means the session dropped us.
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!(addr = %config.server_addr, "Handle dropped, closing connection");
                    break;
                };
                let quitting = matches!(cmd, Command::Quit(_));
                if registered || quitting || matches!(cmd, Command::Nick(_) | Command::Raw(_)) {
                    write_line(&mut writer, &cmd.to_line()).await?;
                    if quitting && !registered {
                        break;
                    }
                } else {
                    pending_commands.push(cmd);
                }
            }
            // Periodic client-to-server PING and timeout detection
            _ = tokio::time::sleep_until(last_activity + ping_interval) => {
                if last_activity.elapsed() > ping_timeout {
                    let _ = event_tx.send(Event::Disconnected { reason: "Ping timeout".to_string() }).await;
                    break;
                }
                write_line(&mut writer, "PING :keepalive").await?;
            }
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(format!("{line}\r\n").as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
