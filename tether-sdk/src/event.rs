//! Events emitted by the IRC client for the session layer to consume.

use crate::irc::Message;

/// Events that the SDK emits to the consumer.
///
/// One variant per protocol event kind the bouncer reacts to. Anything else
/// arrives as [`Event::Unhandled`] with the parsed line attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// TCP (and TLS) is up, registration has been sent.
    Connected,

    /// IRC registration complete (001). `nick` is our confirmed nick.
    Registered { nick: String },

    /// PRIVMSG or NOTICE.
    Message {
        from: String,
        target: String,
        text: String,
        notice: bool,
    },

    /// CTCP ACTION (`/me`).
    Action {
        from: String,
        target: String,
        text: String,
    },

    /// Someone (possibly us) joined a channel.
    Joined { channel: String, nick: String },

    /// Someone (possibly us) left a channel.
    Parted {
        channel: String,
        nick: String,
        reason: String,
    },

    /// `nick` was kicked from `channel` by `by`.
    Kicked {
        channel: String,
        nick: String,
        by: String,
        reason: String,
    },

    /// A user quit the network.
    UserQuit { nick: String, reason: String },

    NickChanged { old_nick: String, new_nick: String },

    /// MODE on a channel or a user. `modes` is the compact `+o-v` string,
    /// `args` the targets in order.
    ModeChanged {
        target: String,
        modes: String,
        args: Vec<String>,
        set_by: String,
    },

    /// Live TOPIC change.
    TopicChanged {
        channel: String,
        topic: String,
        set_by: String,
    },

    /// RPL_TOPIC (332).
    Topic { channel: String, topic: String },

    /// RPL_TOPICWHOTIME (333).
    TopicWhoTime {
        channel: String,
        set_by: String,
        set_at: i64,
    },

    /// RPL_NAMREPLY (353). Nicks keep their status prefixes.
    Names { channel: String, nicks: Vec<String> },

    /// RPL_ENDOFNAMES (366).
    NamesEnd { channel: String },

    /// RPL_LISTSTART (321).
    ListStart,
    /// RPL_LIST (322).
    ListEntry {
        channel: String,
        users: u32,
        topic: String,
    },
    /// RPL_LISTEND (323).
    ListEnd,

    /// We were invited to `channel`.
    Invited { channel: String, by: String },

    /// RPL_AWAY (301).
    Away { nick: String, message: String },

    // WHOIS reply fragments.
    WhoisUser {
        nick: String,
        user: String,
        host: String,
        realname: String,
    },
    WhoisServer {
        nick: String,
        server: String,
        info: String,
    },
    WhoisOperator { nick: String },
    WhoisIdle { nick: String, idle_secs: i64 },
    WhoisChannels { nick: String, channels: Vec<String> },
    WhoisSecure { nick: String },
    EndOfWhois { nick: String },

    /// ERR_CHANOPRIVSNEEDED (482).
    NoPrivileges { channel: String, text: String },

    /// Connection lost.
    Disconnected { reason: String },

    /// A line without a dedicated variant.
    Unhandled(Message),
}

impl Event {
    /// Translate a parsed line into an event.
    ///
    /// Returns `None` for lines the transport consumes itself (PING, PONG,
    /// capability chatter).
    pub fn from_message(msg: &Message) -> Option<Event> {
        let from = msg.source_nick().to_string();
        let event = match msg.command.as_str() {
            "PING" | "PONG" | "CAP" => return None,
            "001" => Event::Registered {
                nick: msg.param(0).to_string(),
            },
            "PRIVMSG" | "NOTICE" => {
                let target = msg.param(0).to_string();
                let text = msg.param(1);
                if let Some(action) = ctcp_action(text) {
                    Event::Action {
                        from,
                        target,
                        text: action.to_string(),
                    }
                } else {
                    Event::Message {
                        from,
                        target,
                        text: text.to_string(),
                        notice: msg.command == "NOTICE",
                    }
                }
            }
            "JOIN" => Event::Joined {
                channel: msg.param(0).to_string(),
                nick: from,
            },
            "PART" => Event::Parted {
                channel: msg.param(0).to_string(),
                nick: from,
                reason: msg.param(1).to_string(),
            },
            "KICK" => Event::Kicked {
                channel: msg.param(0).to_string(),
                nick: msg.param(1).to_string(),
                by: from,
                reason: msg.param(2).to_string(),
            },
            "QUIT" => Event::UserQuit {
                nick: from,
                reason: msg.param(0).to_string(),
            },
            "NICK" => Event::NickChanged {
                old_nick: from,
                new_nick: msg.param(0).to_string(),
            },
            "MODE" => Event::ModeChanged {
                target: msg.param(0).to_string(),
                modes: msg.param(1).to_string(),
                args: msg.params.iter().skip(2).cloned().collect(),
                set_by: from,
            },
            "TOPIC" => Event::TopicChanged {
                channel: msg.param(0).to_string(),
                topic: msg.param(1).to_string(),
                set_by: from,
            },
            "INVITE" => Event::Invited {
                channel: msg.param(1).to_string(),
                by: from,
            },
            "332" => Event::Topic {
                channel: msg.param(1).to_string(),
                topic: msg.param(2).to_string(),
            },
            "333" => Event::TopicWhoTime {
                channel: msg.param(1).to_string(),
                set_by: msg.param(2).split('!').next().unwrap_or("").to_string(),
                set_at: msg.param(3).parse().unwrap_or(0),
            },
            // 353: <me> <symbol> <channel> :<nicks>
            "353" => Event::Names {
                channel: msg.param(2).to_string(),
                nicks: msg.param(3).split_whitespace().map(str::to_string).collect(),
            },
            "366" => Event::NamesEnd {
                channel: msg.param(1).to_string(),
            },
            "321" => Event::ListStart,
            "322" => Event::ListEntry {
                channel: msg.param(1).to_string(),
                users: msg.param(2).parse().unwrap_or(0),
                topic: msg.param(3).to_string(),
            },
            "323" => Event::ListEnd,
            "301" => Event::Away {
                nick: msg.param(1).to_string(),
                message: msg.param(2).to_string(),
            },
            "311" => Event::WhoisUser {
                nick: msg.param(1).to_string(),
                user: msg.param(2).to_string(),
                host: msg.param(3).to_string(),
                realname: msg.param(5).to_string(),
            },
            "312" => Event::WhoisServer {
                nick: msg.param(1).to_string(),
                server: msg.param(2).to_string(),
                info: msg.param(3).to_string(),
            },
            "313" => Event::WhoisOperator {
                nick: msg.param(1).to_string(),
            },
            "317" => Event::WhoisIdle {
                nick: msg.param(1).to_string(),
                idle_secs: msg.param(2).parse().unwrap_or(0),
            },
            "319" => Event::WhoisChannels {
                nick: msg.param(1).to_string(),
                channels: msg.param(2).split_whitespace().map(str::to_string).collect(),
            },
            "671" => Event::WhoisSecure {
                nick: msg.param(1).to_string(),
            },
            "318" => Event::EndOfWhois {
                nick: msg.param(1).to_string(),
            },
            "482" => Event::NoPrivileges {
                channel: msg.param(1).to_string(),
                text: msg.param(2).to_string(),
            },
            _ => Event::Unhandled(msg.clone()),
        };
        Some(event)
    }
}

/// Body of a `\x01ACTION ...\x01` CTCP, if `text` is one.
fn ctcp_action(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('\u{1}')?;
    let inner = inner.strip_suffix('\u{1}').unwrap_or(inner);
    inner.strip_prefix("ACTION ").or_else(|| (inner == "ACTION").then_some(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line: &str) -> Event {
        Event::from_message(&Message::parse(line).unwrap()).unwrap()
    }

    #[test]
    fn privmsg_and_notice() {
        assert_eq!(
            event(":bob!b@h PRIVMSG #rust :hi"),
            Event::Message {
                from: "bob".into(),
                target: "#rust".into(),
                text: "hi".into(),
                notice: false,
            }
        );
        assert!(matches!(
            event(":irc.example.net NOTICE * :*** Looking up your hostname"),
            Event::Message { notice: true, .. }
        ));
    }

    #[test]
    fn ctcp_action_is_split_out() {
        assert_eq!(
            event(":bob!b@h PRIVMSG #rust :\u{1}ACTION waves\u{1}"),
            Event::Action {
                from: "bob".into(),
                target: "#rust".into(),
                text: "waves".into(),
            }
        );
    }

    #[test]
    fn kick_carries_victim_and_kicker() {
        assert_eq!(
            event(":op!o@h KICK #rust bob :bye"),
            Event::Kicked {
                channel: "#rust".into(),
                nick: "bob".into(),
                by: "op".into(),
                reason: "bye".into(),
            }
        );
    }

    #[test]
    fn mode_collects_args() {
        assert_eq!(
            event(":op!o@h MODE #rust +ov-v alice alice bob"),
            Event::ModeChanged {
                target: "#rust".into(),
                modes: "+ov-v".into(),
                args: vec!["alice".into(), "alice".into(), "bob".into()],
                set_by: "op".into(),
            }
        );
    }

    #[test]
    fn names_and_whois_numerics() {
        assert_eq!(
            event(":srv 353 me = #rust :@alice +bob carol"),
            Event::Names {
                channel: "#rust".into(),
                nicks: vec!["@alice".into(), "+bob".into(), "carol".into()],
            }
        );
        assert_eq!(
            event(":srv 311 me bob b host.example * :Bob Builder"),
            Event::WhoisUser {
                nick: "bob".into(),
                user: "b".into(),
                host: "host.example".into(),
                realname: "Bob Builder".into(),
            }
        );
        assert_eq!(
            event(":srv 333 me #rust alice!a@h 1700000000"),
            Event::TopicWhoTime {
                channel: "#rust".into(),
                set_by: "alice".into(),
                set_at: 1_700_000_000,
            }
        );
    }

    #[test]
    fn ping_is_consumed_and_unknown_passes_through() {
        let ping = Message::parse("PING :abc").unwrap();
        assert_eq!(Event::from_message(&ping), None);
        assert!(matches!(event(":srv 372 me :- motd line"), Event::Unhandled(_)));
    }
}
