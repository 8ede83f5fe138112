//! Protocol event handlers.
//!
//! [`NetworkSession::dispatch`] maps each [`Event`] kind to one handler.
//! Handlers update channel state or the WHOIS cache first and then route
//! whatever is chat-visible through `receive`.

use tether_sdk::event::Event;

use crate::channel::{ChannelState, parse_mode_changes};
use crate::message::Message;
use crate::protocol::{ChanList, Invite, NickChange, Payload, RawMessage};

use super::NetworkSession;

impl NetworkSession {
    pub(crate) async fn dispatch(&mut self, event: Event) {
        match event {
            Event::Connected => {
                tracing::debug!(network = %self.name(), "Transport up, registering");
            }
            Event::Registered { nick } => self.on_registered(nick).await,
            Event::Message { from, target, text, .. } => {
                self.receive(&target, &from, "privmsg", &text).await
            }
            Event::Action { from, target, text } => self.receive(&target, &from, "action", &text).await,
            Event::Joined { channel, nick } => self.on_join(&channel, &nick).await,
            Event::Parted { channel, nick, reason } => self.on_part(&channel, &nick, &reason).await,
            Event::Kicked {
                channel,
                nick,
                by,
                reason,
            } => self.on_kick(&channel, &nick, &by, &reason).await,
            Event::UserQuit { nick, reason } => self.on_quit(&nick, &reason).await,
            Event::NickChanged { old_nick, new_nick } => self.on_nick(&old_nick, &new_nick).await,
            Event::ModeChanged {
                target,
                modes,
                args,
                set_by,
            } => self.on_mode(&target, &modes, &args, &set_by).await,
            Event::TopicChanged { channel, topic, set_by } => {
                let now = chrono::Utc::now().timestamp();
                self.update_channel(&channel, |c| c.set_topic(&topic, &set_by, now)).await;
                self.receive(&channel, &set_by, "topic", &topic).await;
            }
            Event::Topic { channel, topic } => {
                self.update_channel(&channel, |c| c.topic = topic).await;
            }
            Event::TopicWhoTime { channel, set_by, set_at } => {
                self.update_channel(&channel, |c| {
                    c.topic_set_by = set_by;
                    c.topic_set_at = set_at;
                })
                .await;
            }
            Event::Names { channel, nicks } => {
                let network = self.name();
                self.shared.channels.write().ensure(&channel, &network).names(&nicks);
            }
            Event::NamesEnd { channel } => {
                self.update_channel(&channel, |c| c.names_end()).await;
            }
            Event::ListStart => self.shared.channel_list.write().clear(),
            Event::ListEntry { channel, .. } => self.shared.channel_list.write().push(channel),
            Event::ListEnd => {
                let list = self.shared.channel_list.read().clone();
                let network = self.name();
                self.emit(Payload::ChanList(ChanList { network, list })).await;
            }
            Event::Invited { channel, by } => {
                let network = self.name();
                self.emit(Payload::Invite(Invite {
                    network,
                    channel,
                    sender: by,
                }))
                .await;
            }
            Event::Away { nick, message } => {
                if let Some(record) = self.whois.get_mut(&nick) {
                    record.away = message;
                }
            }
            Event::WhoisUser {
                nick,
                user,
                host,
                realname,
            } => {
                let network = self.name();
                let record = self.whois.entry(&network, &nick);
                record.user = user;
                record.host = host;
                record.realname = realname;
            }
            Event::WhoisServer { nick, server, info } => {
                let network = self.name();
                let record = self.whois.entry(&network, &nick);
                record.server = server;
                record.server_info = info;
            }
            Event::WhoisOperator { nick } => {
                let network = self.name();
                self.whois.entry(&network, &nick).operator = true;
            }
            Event::WhoisIdle { nick, idle_secs } => {
                let network = self.name();
                self.whois.entry(&network, &nick).idle = idle_secs;
            }
            Event::WhoisChannels { nick, channels } => {
                let network = self.name();
                self.whois.entry(&network, &nick).add_channels(&channels);
            }
            Event::WhoisSecure { nick } => {
                let network = self.name();
                self.whois.entry(&network, &nick).secure = true;
            }
            Event::EndOfWhois { nick } => {
                if let Some(record) = self.whois.finish(&nick) {
                    self.emit(Payload::Whois(record)).await;
                }
            }
            Event::NoPrivileges { channel, text } => {
                // Shown to the user, never stored.
                let network = self.name();
                let sender = format!("[{network}]");
                let msg = Message::new(&network, &channel, &sender, "privmsg", &text);
                self.emit(Payload::Message(msg)).await;
            }
            Event::Disconnected { reason } => self.link_lost(&reason).await,
            Event::Unhandled(line) => {
                let network = self.name();
                self.emit(Payload::Raw(RawMessage {
                    network,
                    message: line.to_string(),
                }))
                .await;
            }
        }
    }

    /// Mutate a channel, tracking it first if it is new, and publish its
    /// new state.
    async fn update_channel(&self, name: &str, apply: impl FnOnce(&mut ChannelState)) {
        let network = self.name();
        let state = {
            let mut channels = self.shared.channels.write();
            let state = channels.ensure(name, &network);
            apply(state);
            state.clone()
        };
        self.emit(Payload::ChanData(state)).await;
    }

    async fn on_registered(&mut self, nick: String) {
        let channels = {
            let mut info = self.shared.info.write();
            info.connected = true;
            info.nick = nick;
            self.shared.channels.read().names()
        };
        tracing::info!(network = %self.name(), nick = %self.identity().1, "Registered");
        self.shared.channel_list.write().clear();

        if let Some(link) = self.link.clone() {
            let mut result = link.list().await;
            for channel in channels.iter().filter(|c| c.starts_with('#')) {
                if result.is_err() {
                    break;
                }
                result = link.join(channel).await;
            }
            if let Err(e) = result {
                tracing::warn!(network = %self.name(), error = %e, "Failed to rejoin channels");
            }
        }
        self.emit_net_data().await;
    }

    fn is_me(&self, nick: &str) -> bool {
        self.shared.info.read().nick.eq_ignore_ascii_case(nick)
    }

    async fn on_join(&mut self, channel: &str, nick: &str) {
        self.receive(channel, nick, "join", "").await;
        if self.is_me(nick) {
            self.update_channel(channel, |_| {}).await;
        } else {
            self.update_channel(channel, |state| state.join(nick)).await;
        }
    }

    async fn on_part(&mut self, channel: &str, nick: &str, reason: &str) {
        self.receive(channel, nick, "part", reason).await;
        self.leave(channel, nick).await;
    }

    async fn on_kick(&mut self, channel: &str, nick: &str, by: &str, reason: &str) {
        self.receive(channel, by, "kick", &format!("{nick}:{reason}")).await;
        self.leave(channel, nick).await;
    }

    /// `nick` is no longer on `channel`. For ourselves that means dropping
    /// the channel entirely.
    async fn leave(&mut self, channel: &str, nick: &str) {
        if self.is_me(nick) {
            self.shared.channels.write().remove(channel);
            return;
        }
        let state = {
            let mut channels = self.shared.channels.write();
            channels.get_mut(channel).and_then(|state| state.leave(nick).then(|| state.clone()))
        };
        if let Some(state) = state {
            self.emit(Payload::ChanData(state)).await;
        }
    }

    async fn on_quit(&mut self, nick: &str, reason: &str) {
        let affected: Vec<_> = {
            let mut channels = self.shared.channels.write();
            channels
                .iter_mut()
                .filter_map(|state| state.leave(nick).then(|| state.clone()))
                .collect()
        };
        for state in affected {
            self.receive(&state.name, nick, "quit", reason).await;
            self.emit(Payload::ChanData(state)).await;
        }
    }

    async fn on_nick(&mut self, old: &str, new: &str) {
        // Compared before the rename so our own echo is marked as ours.
        let mine = self.is_me(old);
        if mine {
            let mut info = self.shared.info.write();
            info.nick = new.to_string();
            info.config.nick = new.to_string();
        }

        let affected: Vec<_> = {
            let mut channels = self.shared.channels.write();
            channels
                .iter_mut()
                .filter_map(|state| state.rename(old, new).then(|| state.clone()))
                .collect()
        };
        for state in affected {
            self.receive(&state.name, old, "nick", new).await;
            self.emit(Payload::ChanData(state)).await;
        }

        if mine {
            let network = self.name();
            self.emit(Payload::NickChange(NickChange {
                network,
                nick: new.to_string(),
            }))
            .await;
        }
    }

    async fn on_mode(&mut self, target: &str, modes: &str, args: &[String], set_by: &str) {
        if !target.starts_with(['#', '&']) {
            tracing::debug!(network = %self.name(), target, modes, "User mode change");
            return;
        }
        let network = self.name();
        let state = {
            let mut channels = self.shared.channels.write();
            let state = channels.ensure(target, &network);
            for change in parse_mode_changes(modes, args) {
                state.apply_mode(&change);
            }
            state.clone()
        };
        let body = std::iter::once(modes.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.receive(target, set_by, "mode", &body).await;
        self.emit(Payload::ChanData(state)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use tether_sdk::client::{ClientHandle, Command};
    use tokio::sync::mpsc;

    use super::*;
    use crate::db::{Db, MessageStore};
    use crate::network::NetworkConfig;
    use crate::outbox::OutboxReader;
    use crate::preview::NoPreview;
    use crate::user::{Services, SessionOptions};

    struct Fixture {
        session: NetworkSession,
        store: Arc<Db>,
        wire: mpsc::Receiver<Command>,
        outbox: OutboxReader,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(Db::open_memory().unwrap());
        let services = Arc::new(Services {
            store: store.clone(),
            previewer: Arc::new(NoPreview),
            options: SessionOptions::default(),
        });
        let config = NetworkConfig {
            name: "libera".into(),
            nick: "me".into(),
            user: "me".into(),
            realname: "Me".into(),
            password: String::new(),
            ip: "127.0.0.1".into(),
            port: 6667,
            ssl: false,
            channels: vec!["#rust".into(), "bob".into()],
        };
        let mut session = NetworkSession::new(config, "a@x", Weak::new(), services);
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

    impl Fixture {
        fn drain(&mut self) -> Vec<Payload> {
            let mut out = Vec::new();
            while let Ok(p) = self.outbox.try_recv() {
                out.push(p);
            }
            out
        }

        fn members(&self, channel: &str) -> Vec<String> {
            let channels = self.session.shared.channels.read();
            channels.get(channel).unwrap().userlist.as_slice().to_vec()
        }

        async fn names(&mut self, channel: &str, nicks: &[&str]) {
            self.session
                .dispatch(Event::Names {
                    channel: channel.into(),
                    nicks: nicks.iter().map(|n| n.to_string()).collect(),
                })
                .await;
            self.session.dispatch(Event::NamesEnd { channel: channel.into() }).await;
            self.drain();
        }
    }

    #[tokio::test]
    async fn welcome_lists_and_rejoins_channels() {
        let mut f = fixture().await;
        f.session
            .dispatch(Event::Registered { nick: "me_".into() })
            .await;
        assert_eq!(f.wire.try_recv().unwrap(), Command::List);
        assert_eq!(f.wire.try_recv().unwrap(), Command::Join("#rust".into()));
        assert!(f.wire.try_recv().is_err());

        let payloads = f.drain();
        let [Payload::NetData(data)] = payloads.as_slice() else {
            panic!("unexpected {payloads:?}");
        };
        assert!(data.connected);
        assert_eq!(data.nick, "me_");
    }

    #[tokio::test]
    async fn join_and_part_of_others_track_members() {
        let mut f = fixture().await;
        f.names("#rust", &["@alice"]).await;
        f.session
            .dispatch(Event::Joined {
                channel: "#rust".into(),
                nick: "bob".into(),
            })
            .await;
        f.session
            .dispatch(Event::Joined {
                channel: "#rust".into(),
                nick: "bob".into(),
            })
            .await;
        assert_eq!(f.members("#rust"), vec!["@alice", "bob"]);

        f.session
            .dispatch(Event::Parted {
                channel: "#rust".into(),
                nick: "bob".into(),
                reason: "bye".into(),
            })
            .await;
        assert_eq!(f.members("#rust"), vec!["@alice"]);

        let commands: Vec<String> = f
            .store
            .history("a@x", None, Some("#rust"), 10)
            .unwrap()
            .into_iter()
            .map(|m| m.command)
            .collect();
        assert_eq!(commands, vec!["part", "join", "join"]);
    }

    #[tokio::test]
    async fn own_join_and_part_manage_channel_table() {
        let mut f = fixture().await;
        f.session
            .dispatch(Event::Joined {
                channel: "#go".into(),
                nick: "me".into(),
            })
            .await;
        assert!(f.session.shared.channels.read().contains("#go"));
        f.session
            .dispatch(Event::Parted {
                channel: "#go".into(),
                nick: "me".into(),
                reason: String::new(),
            })
            .await;
        assert!(!f.session.shared.channels.read().contains("#go"));
        let own: Vec<bool> = f
            .store
            .history("a@x", None, Some("#go"), 10)
            .unwrap()
            .into_iter()
            .map(|m| m.own)
            .collect();
        assert_eq!(own, vec![true, true]);
    }

    #[tokio::test]
    async fn kick_removes_the_kicked_user() {
        let mut f = fixture().await;
        f.names("#rust", &["@op", "bob", "carol"]).await;
        f.session
            .dispatch(Event::Kicked {
                channel: "#rust".into(),
                nick: "bob".into(),
                by: "op".into(),
                reason: "spam".into(),
            })
            .await;
        assert_eq!(f.members("#rust"), vec!["@op", "carol"]);
        let last = &f.store.history("a@x", None, None, 1).unwrap()[0];
        assert_eq!((last.sender.as_str(), last.body.as_str()), ("op", "bob:spam"));

        f.session
            .dispatch(Event::Kicked {
                channel: "#rust".into(),
                nick: "me".into(),
                by: "op".into(),
                reason: String::new(),
            })
            .await;
        assert!(!f.session.shared.channels.read().contains("#rust"));
    }

    #[tokio::test]
    async fn quit_touches_every_channel_the_user_was_on() {
        let mut f = fixture().await;
        f.session.shared.channels.write().ensure("#go", "libera");
        f.names("#rust", &["dave", "erin"]).await;
        f.names("#go", &["dave"]).await;
        f.session
            .dispatch(Event::UserQuit {
                nick: "dave".into(),
                reason: "gone".into(),
            })
            .await;
        assert_eq!(f.members("#rust"), vec!["erin"]);
        assert!(f.members("#go").is_empty());
        let quits = f.store.history("a@x", None, None, 10).unwrap();
        assert_eq!(quits.len(), 2);
        assert!(quits.iter().all(|m| m.command == "quit" && m.body == "gone"));
    }

    #[tokio::test]
    async fn nick_change_renames_and_announces_own_nick() {
        let mut f = fixture().await;
        f.names("#rust", &["me", "zed"]).await;
        f.session
            .dispatch(Event::NickChanged {
                old_nick: "me".into(),
                new_nick: "aaa".into(),
            })
            .await;
        assert_eq!(f.members("#rust"), vec!["aaa", "zed"]);
        assert_eq!(f.session.identity().1, "aaa");

        let payloads = f.drain();
        assert!(matches!(
            payloads.last(),
            Some(Payload::NickChange(NickChange { nick, .. })) if nick == "aaa"
        ));
        let Some(Payload::Message(msg)) = payloads.first() else {
            panic!("unexpected {payloads:?}");
        };
        assert!(msg.own);
        assert_eq!((msg.command.as_str(), msg.body.as_str()), ("nick", "aaa"));
    }

    #[tokio::test]
    async fn mode_change_reprefixes_and_resorts() {
        let mut f = fixture().await;
        f.names("#rust", &["@alice", "bob"]).await;
        f.session
            .dispatch(Event::ModeChanged {
                target: "#rust".into(),
                modes: "-o".into(),
                args: vec!["alice".into()],
                set_by: "srv".into(),
            })
            .await;
        assert_eq!(f.members("#rust"), vec!["alice", "bob"]);

        f.session
            .dispatch(Event::ModeChanged {
                target: "#rust".into(),
                modes: "+v".into(),
                args: vec!["bob".into()],
                set_by: "srv".into(),
            })
            .await;
        assert_eq!(f.members("#rust"), vec!["+bob", "alice"]);
        let last = &f.store.history("a@x", None, None, 1).unwrap()[0];
        assert_eq!(last.body, "+v bob");

        f.session
            .dispatch(Event::ModeChanged {
                target: "me".into(),
                modes: "+i".into(),
                args: vec![],
                set_by: "me".into(),
            })
            .await;
        assert_eq!(f.store.history("a@x", None, None, 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn topic_replies_update_state() {
        let mut f = fixture().await;
        f.session
            .dispatch(Event::Topic {
                channel: "#rust".into(),
                topic: "Rust".into(),
            })
            .await;
        f.session
            .dispatch(Event::TopicWhoTime {
                channel: "#rust".into(),
                set_by: "alice".into(),
                set_at: 1_700_000_000,
            })
            .await;
        let state = f.session.shared.channels.read().get("#rust").cloned().unwrap();
        assert_eq!(
            (state.topic.as_str(), state.topic_set_by.as_str(), state.topic_set_at),
            ("Rust", "alice", 1_700_000_000)
        );
        assert_eq!(f.drain().len(), 2);
        assert!(f.store.history("a@x", None, None, 10).unwrap().is_empty());

        f.session
            .dispatch(Event::TopicChanged {
                channel: "#rust".into(),
                topic: "New".into(),
                set_by: "bob".into(),
            })
            .await;
        let state = f.session.shared.channels.read().get("#rust").cloned().unwrap();
        assert_eq!(state.topic_set_by, "bob");
        assert!(state.topic_set_at > 1_700_000_000);
        assert_eq!(f.store.history("a@x", None, None, 10).unwrap()[0].command, "topic");
    }

    #[tokio::test]
    async fn topic_for_unseen_channel_starts_tracking_it() {
        let mut f = fixture().await;
        f.session
            .dispatch(Event::Topic {
                channel: "#new".into(),
                topic: "Fresh".into(),
            })
            .await;
        f.session
            .dispatch(Event::TopicChanged {
                channel: "#other".into(),
                topic: "Moved".into(),
                set_by: "bob".into(),
            })
            .await;

        let channels = f.session.shared.channels.read();
        assert_eq!(channels.get("#new").unwrap().topic, "Fresh");
        let other = channels.get("#other").unwrap();
        assert_eq!((other.topic.as_str(), other.network.as_str()), ("Moved", "libera"));
        drop(channels);
        let published = f.drain();
        assert!(published.iter().any(|p| matches!(p, Payload::ChanData(c) if c.name == "#new")));
    }

    #[tokio::test]
    async fn join_by_others_in_unseen_channel_is_tracked() {
        let mut f = fixture().await;
        f.session
            .dispatch(Event::Joined {
                channel: "#elsewhere".into(),
                nick: "bob".into(),
            })
            .await;
        assert_eq!(f.members("#elsewhere"), vec!["bob"]);
    }

    #[tokio::test]
    async fn whois_is_emitted_once_at_the_end() {
        let mut f = fixture().await;
        f.session
            .dispatch(Event::WhoisUser {
                nick: "bob".into(),
                user: "~bob".into(),
                host: "example.org".into(),
                realname: "Bob".into(),
            })
            .await;
        f.session
            .dispatch(Event::Away {
                nick: "bob".into(),
                message: "lunch".into(),
            })
            .await;
        f.session
            .dispatch(Event::WhoisChannels {
                nick: "bob".into(),
                channels: vec!["@#rust".into()],
            })
            .await;
        f.session.dispatch(Event::WhoisSecure { nick: "bob".into() }).await;
        assert!(f.drain().is_empty());

        f.session.dispatch(Event::EndOfWhois { nick: "bob".into() }).await;
        let payloads = f.drain();
        let [Payload::Whois(record)] = payloads.as_slice() else {
            panic!("unexpected {payloads:?}");
        };
        assert_eq!(record.host, "example.org");
        assert_eq!(record.away, "lunch");
        assert!(record.secure);
        assert!(f.session.whois.is_empty());

        f.session.dispatch(Event::EndOfWhois { nick: "bob".into() }).await;
        assert!(f.drain().is_empty());
    }

    #[tokio::test]
    async fn list_replies_build_the_channel_list() {
        let mut f = fixture().await;
        f.session.dispatch(Event::ListStart).await;
        for name in ["#a", "#b"] {
            f.session
                .dispatch(Event::ListEntry {
                    channel: name.into(),
                    users: 3,
                    topic: String::new(),
                })
                .await;
        }
        f.session.dispatch(Event::ListEnd).await;
        let payloads = f.drain();
        let [Payload::ChanList(list)] = payloads.as_slice() else {
            panic!("unexpected {payloads:?}");
        };
        assert_eq!(list.list, vec!["#a", "#b"]);
    }

    #[tokio::test]
    async fn no_privileges_is_shown_not_stored() {
        let mut f = fixture().await;
        f.session
            .dispatch(Event::NoPrivileges {
                channel: "#rust".into(),
                text: "You're not channel operator".into(),
            })
            .await;
        let payloads = f.drain();
        let [Payload::Message(msg)] = payloads.as_slice() else {
            panic!("unexpected {payloads:?}");
        };
        assert_eq!(msg.sender, "[libera]");
        assert!(msg.id.is_none());
        assert!(f.store.history("a@x", None, None, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_notice_and_unhandled_lines() {
        let mut f = fixture().await;
        f.session.dispatch(Event::Registered { nick: "me".into() }).await;
        f.drain();
        f.session
            .dispatch(Event::Disconnected {
                reason: "EOF".into(),
            })
            .await;
        let payloads = f.drain();
        assert!(matches!(payloads.as_slice(), [Payload::NetData(d)] if !d.connected));
        assert!(f.session.link.is_none());

        let line = tether_sdk::irc::Message::parse(":srv 372 me :- motd").unwrap();
        f.session.dispatch(Event::Unhandled(line)).await;
        let payloads = f.drain();
        let [Payload::Raw(raw)] = payloads.as_slice() else {
            panic!("unexpected {payloads:?}");
        };
        assert_eq!(raw.message, ":srv 372 me :- motd");
    }
}
