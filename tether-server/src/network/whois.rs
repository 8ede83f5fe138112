//! In-flight WHOIS lookups.
//!
//! A WHOIS reply arrives as several numerics. Each fragment is folded into a
//! record keyed by the nick text exactly as the server sent it; the record is
//! published once, on end-of-WHOIS, and then forgotten.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::channel::split_prefix;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WhoisRecord {
    pub network: String,
    pub nick: String,
    pub user: String,
    pub host: String,
    pub realname: String,
    pub away: String,
    pub server: String,
    #[serde(rename = "server-info")]
    pub server_info: String,
    /// Seconds idle.
    pub idle: i64,
    #[serde(rename = "secure-connection")]
    pub secure: bool,
    pub operator: bool,
    /// Channel name to the role prefix the user holds there (empty for none).
    pub channels: BTreeMap<String, String>,
}

impl WhoisRecord {
    /// Record the channels of an RPL_WHOISCHANNELS fragment.
    pub fn add_channels(&mut self, entries: &[String]) {
        for entry in entries {
            let (prefix, name) = split_prefix(entry);
            if name.is_empty() {
                continue;
            }
            let role = prefix.map(String::from).unwrap_or_default();
            self.channels.insert(name.to_string(), role);
        }
    }
}

/// Accumulating records of one network.
#[derive(Debug, Default)]
pub struct WhoisCache {
    records: HashMap<String, WhoisRecord>,
}

impl WhoisCache {
    /// The record for `nick`, created on first reference.
    pub fn entry(&mut self, network: &str, nick: &str) -> &mut WhoisRecord {
        self.records.entry(nick.to_string()).or_insert_with(|| WhoisRecord {
            network: network.to_string(),
            nick: nick.to_string(),
            ..Default::default()
        })
    }

    /// The record for `nick` if a lookup is already in flight.
    pub fn get_mut(&mut self, nick: &str) -> Option<&mut WhoisRecord> {
        self.records.get_mut(nick)
    }

    pub fn finish(&mut self, nick: &str) -> Option<WhoisRecord> {
        self.records.remove(nick)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
