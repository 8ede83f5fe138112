//! The internal chat message and its optional link preview.

use serde::{Deserialize, Serialize};

/// One chat-visible event, as stored and as delivered to clients.
///
/// Mutable while it travels through the script pipeline; never touched again
/// once it has been persisted and queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the message store; absent before persistence or when the
    /// insert failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub network: String,
    pub channel: String,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub sender: String,
    /// Lower-case verb: privmsg, action, join, part, kick, quit, nick, topic, mode, ...
    pub command: String,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(rename = "ownmsg", default)]
    pub own: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<Preview>,
}

impl Message {
    /// A fresh, unpersisted message stamped with the current time.
    pub fn new(network: &str, channel: &str, sender: &str, command: &str, body: &str) -> Self {
        Self {
            id: None,
            network: network.to_string(),
            channel: channel.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            sender: sender.to_string(),
            command: command.to_string(),
            body: body.to_string(),
            own: false,
            preview: None,
        }
    }
}

/// Link metadata attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<PreviewText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PreviewImage>,
}

impl Preview {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.image.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewText {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "sitename", default, skip_serializing_if = "String::is_empty")]
    pub site_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewImage {
    pub url: String,
    #[serde(rename = "type", default)]
    pub mime: String,
    #[serde(default)]
    pub width: u64,
    #[serde(default)]
    pub height: u64,
}
