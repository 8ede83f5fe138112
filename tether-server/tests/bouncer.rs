//! End-to-end session tests against a scripted IRC server on loopback.
//!
//! Tests cover:
//! - Registration, automatic LIST and JOIN of configured channels
//! - Incoming channel traffic reaching an attached client in order
//! - Client commands written to the wire and persisted to history
//! - Events produced while no client is attached delivered on attach

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_server::db::Db;
use tether_server::mux::{ClientTransport, Delivery};
use tether_server::network::NetworkConfig;
use tether_server::preview::NoPreview;
use tether_server::protocol::{ClientCommand, Payload};
use tether_server::user::{Services, SessionOptions, UserSession};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};

struct Recorder(mpsc::UnboundedSender<Payload>);

#[async_trait]
impl ClientTransport for Recorder {
    async fn send(&mut self, payload: &Payload) -> anyhow::Result<()> {
        let _ = self.0.send(payload.clone());
        Ok(())
    }

    async fn keepalive(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One accepted connection: lines the bouncer wrote, and a way to answer.
struct FakeIrc {
    lines: mpsc::UnboundedReceiver<String>,
    writer: OwnedWriteHalf,
}

impl FakeIrc {
    async fn accept(listener: TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, writer) = stream.into_split();
        let (tx, lines) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut read = BufReader::new(read).lines();
            while let Ok(Some(line)) = read.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self { lines, writer }
    }

    async fn say(&mut self, line: &str) {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
    }

    /// Wait for the bouncer to write `expected`, skipping anything else.
    async fn expect(&mut self, expected: &str) {
        let wait = async {
            while let Some(line) = self.lines.recv().await {
                if line == expected {
                    return;
                }
            }
            panic!("connection closed before {expected:?}");
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}"));
    }
}

fn services() -> Arc<Services> {
    Arc::new(Services {
        store: Arc::new(Db::open_memory().unwrap()),
        previewer: Arc::new(NoPreview),
        options: SessionOptions::default(),
    })
}

fn network(port: u16) -> NetworkConfig {
    NetworkConfig {
        name: "Local".into(),
        nick: "me".into(),
        user: "me".into(),
        realname: "Me".into(),
        password: String::new(),
        ip: "127.0.0.1".into(),
        port,
        ssl: false,
        channels: vec!["#rust".into()],
    }
}

async fn registered(user: &Arc<UserSession>) -> FakeIrc {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    user.add_network(network(port), true).unwrap();

    let mut irc = FakeIrc::accept(listener).await;
    irc.expect("NICK me").await;
    irc.expect("USER me 0 * :Me").await;
    irc.say(":srv 001 me :Welcome").await;
    irc.expect("LIST").await;
    irc.expect("JOIN #rust").await;
    irc.say(":me!me@host JOIN #rust").await;
    irc.say(":srv 353 me = #rust :@me bob").await;
    irc.say(":srv 366 me #rust :End of /NAMES list.").await;
    irc
}

fn attach(
    user: &Arc<UserSession>,
) -> (
    mpsc::UnboundedReceiver<Payload>,
    watch::Sender<bool>,
    tokio::task::JoinHandle<anyhow::Result<()>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (detach, detached) = watch::channel(false);
    let user = user.clone();
    let task = tokio::spawn(async move {
        Delivery::default()
            .run(&user, &mut Recorder(tx), detached)
            .await
    });
    (rx, detach, task)
}

/// Next payload matching `pred`, skipping others.
async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<Payload>,
    pred: impl Fn(&Payload) -> bool,
) -> Payload {
    let wait = async {
        loop {
            let payload = rx.recv().await.expect("delivery stopped");
            if pred(&payload) {
                return payload;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("payload in time")
}

fn chat(payload: &Payload, body: &str) -> bool {
    matches!(payload, Payload::Message(m) if m.command == "privmsg" && m.body == body)
}

#[tokio::test]
async fn channel_traffic_reaches_attached_client() {
    let user = UserSession::new("alice@example.com", "", serde_json::Value::Null, services());
    let mut irc = registered(&user).await;
    let (mut rx, detach, task) = attach(&user);

    let names = wait_for(&mut rx, |p| {
        matches!(p, Payload::ChanData(c) if c.name == "#rust" && c.userlist.as_slice().len() == 2)
    })
    .await;
    let Payload::ChanData(state) = names else { unreachable!() };
    assert_eq!(state.network, "local");

    irc.say(":bob!b@host PRIVMSG #rust :hello there").await;
    let Payload::Message(msg) = wait_for(&mut rx, |p| chat(p, "hello there")).await else {
        unreachable!()
    };
    assert_eq!((msg.channel.as_str(), msg.sender.as_str()), ("#rust", "bob"));
    assert!(!msg.own);
    assert!(msg.id.is_some());

    detach.send(true).unwrap();
    task.await.unwrap().unwrap();
    user.shutdown().await;
}

#[tokio::test]
async fn client_message_is_written_and_kept_in_history() {
    let user = UserSession::new("alice@example.com", "", serde_json::Value::Null, services());
    let mut irc = registered(&user).await;
    let net = user.network("local").unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !net.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    user.handle_command(ClientCommand::Message {
        network: "LOCAL".into(),
        channel: "#rust".into(),
        command: "privmsg".into(),
        message: "hi bob".into(),
    })
    .await;
    irc.expect("PRIVMSG #rust :hi bob").await;

    let (mut rx, detach, task) = attach(&user);
    let Payload::Message(own) = wait_for(&mut rx, |p| chat(p, "hi bob")).await else {
        unreachable!()
    };
    assert!(own.own);

    user.handle_command(ClientCommand::History {
        network: Some("local".into()),
        channel: Some("#rust".into()),
        limit: None,
    })
    .await;
    let Payload::History(history) = wait_for(&mut rx, |p| matches!(p, Payload::History(_))).await
    else {
        unreachable!()
    };
    assert!(history.messages.iter().any(|m| m.body == "hi bob" && m.own));

    detach.send(true).unwrap();
    task.await.unwrap().unwrap();
    user.shutdown().await;
    irc.expect("QUIT :tether shutting down").await;
}

#[tokio::test]
async fn events_while_detached_are_delivered_on_attach() {
    let user = UserSession::new("alice@example.com", "", serde_json::Value::Null, services());
    let mut irc = registered(&user).await;

    let (mut rx, detach, task) = attach(&user);
    wait_for(&mut rx, |p| matches!(p, Payload::ChanData(c) if c.userlist.as_slice().len() == 2)).await;
    detach.send(true).unwrap();
    task.await.unwrap().unwrap();

    irc.say(":bob!b@host PRIVMSG #rust :missed you").await;
    irc.say(":bob!b@host PRIVMSG me :psst").await;

    let (mut rx, detach, task) = attach(&user);
    wait_for(&mut rx, |p| chat(p, "missed you")).await;
    let Payload::Message(dm) = wait_for(&mut rx, |p| chat(p, "psst")).await else {
        unreachable!()
    };
    assert_eq!(dm.channel, "bob");

    detach.send(true).unwrap();
    task.await.unwrap().unwrap();
    user.shutdown().await;
}
