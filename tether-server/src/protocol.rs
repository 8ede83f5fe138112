//! Client-facing envelopes.
//!
//! Everything a client sees or sends is a `{"type": ..., "object": ...}`
//! envelope. [`Payload`] is the outbound side, [`ClientCommand`] the inbound.

use serde::{Deserialize, Deserializer, Serialize};

use crate::channel::ChannelState;
use crate::message::Message;
use crate::network::whois::WhoisRecord;

/// Typed item on an outbound queue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "object", rename_all = "lowercase")]
pub enum Payload {
    Message(Message),
    ChanData(ChannelState),
    NetData(NetData),
    NickChange(NickChange),
    ChanList(ChanList),
    Whois(WhoisRecord),
    Invite(Invite),
    Raw(RawMessage),
    Clear(ClearHistory),
    /// Id of a deleted message.
    Delete(i64),
    #[serde(rename = "cmdresponse")]
    CommandResponse(CommandResponse),
    History(History),
}

/// Connection facts about one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetData {
    pub name: String,
    pub user: String,
    pub realname: String,
    pub nick: String,
    pub ip: String,
    pub port: u16,
    pub ssl: bool,
    pub connected: bool,
}

/// Our own nick changed on `network`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NickChange {
    pub network: String,
    pub nick: String,
}

/// Result of a LIST request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChanList {
    pub network: String,
    pub list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invite {
    pub network: String,
    pub channel: String,
    pub sender: String,
}

/// A protocol line nothing else consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawMessage {
    pub network: String,
    pub message: String,
}

/// Tells clients to drop their copy of a channel's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearHistory {
    pub network: String,
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct History {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub messages: Vec<Message>,
}

/// A request coming in from a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "lowercase")]
pub enum ClientCommand {
    Raw {
        network: String,
        message: String,
    },
    Message {
        network: String,
        channel: String,
        command: String,
        message: String,
    },
    Kick {
        network: String,
        channel: String,
        user: String,
        #[serde(default)]
        message: String,
    },
    Mode {
        network: String,
        channel: String,
        message: String,
    },
    Clear {
        network: String,
        channel: String,
    },
    Close {
        network: String,
        channel: String,
    },
    Open {
        network: String,
        channel: String,
    },
    Delete {
        #[serde(deserialize_with = "id_from_number_or_string")]
        id: i64,
    },
    History {
        #[serde(default)]
        network: Option<String>,
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl ClientCommand {
    /// Decode a text frame. Anything malformed or with an empty required
    /// field yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let cmd: ClientCommand = serde_json::from_str(text).ok()?;
        cmd.is_complete().then_some(cmd)
    }

    fn is_complete(&self) -> bool {
        let filled = |fields: &[&String]| fields.iter().all(|f| !f.is_empty());
        match self {
            ClientCommand::Raw { network, message } => filled(&[network, message]),
            ClientCommand::Message {
                network,
                channel,
                command,
                message,
            } => {
                let needs_body = ["privmsg", "action", "notice"]
                    .iter()
                    .any(|c| command.eq_ignore_ascii_case(c));
                filled(&[network, channel, command]) && !(needs_body && message.is_empty())
            }
            ClientCommand::Kick {
                network,
                channel,
                user,
                ..
            } => filled(&[network, channel, user]),
            ClientCommand::Mode {
                network,
                channel,
                message,
            } => filled(&[network, channel, message]),
            ClientCommand::Clear { network, channel }
            | ClientCommand::Close { network, channel }
            | ClientCommand::Open { network, channel } => filled(&[network, channel]),
            ClientCommand::Delete { id } => *id > 0,
            ClientCommand::History { .. } => true,
        }
    }
}

fn id_from_number_or_string<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Number(i64),
        Text(String),
    }
    match Id::deserialize(de)? {
        Id::Number(n) => Ok(n),
        Id::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
