//! Per-channel state: topic, member list and mode list.
//!
//! A [`ChannelState`] belongs to exactly one network session and is only
//! mutated from that session's task. The member list is kept sorted by
//! power level (descending) and then by case-insensitive name.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;

/// Status modes, highest rank first: (mode letter, display prefix).
const STATUS_MODES: [(char, char); 5] = [('q', '~'), ('a', '&'), ('o', '@'), ('h', '%'), ('v', '+')];

/// Rank of a display prefix character (`~` = 5 down to `+` = 1), 0 if none.
pub fn level_of_prefix(prefix: char) -> u8 {
    STATUS_MODES
        .iter()
        .position(|&(_, p)| p == prefix)
        .map(|i| (STATUS_MODES.len() - i) as u8)
        .unwrap_or(0)
}

/// Rank of a status mode letter (`q` = 5 down to `v` = 1), 0 if none.
pub fn level_of_mode(mode: char) -> u8 {
    STATUS_MODES
        .iter()
        .position(|&(m, _)| m == mode)
        .map(|i| (STATUS_MODES.len() - i) as u8)
        .unwrap_or(0)
}

fn prefix_for_mode(mode: char) -> Option<char> {
    STATUS_MODES.iter().find(|&&(m, _)| m == mode).map(|&(_, p)| p)
}

fn mode_for_prefix(prefix: char) -> Option<char> {
    STATUS_MODES.iter().find(|&&(_, p)| p == prefix).map(|&(m, _)| m)
}

/// Split `@alice` into (`Some('@')`, `alice`). Only the first character is
/// treated as a prefix.
pub fn split_prefix(entry: &str) -> (Option<char>, &str) {
    match entry.chars().next() {
        Some(c) if level_of_prefix(c) > 0 => (Some(c), &entry[c.len_utf8()..]),
        _ => (None, entry),
    }
}

/// Ordered channel membership. Entries carry their display prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MemberList(Vec<String>);

impl MemberList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of the entry whose bare name matches `nick`.
    pub fn position(&self, nick: &str) -> Option<usize> {
        let (_, bare) = split_prefix(nick);
        self.0
            .iter()
            .position(|entry| split_prefix(entry).1.eq_ignore_ascii_case(bare))
    }

    pub fn contains(&self, nick: &str) -> bool {
        self.position(nick).is_some()
    }

    /// Insert or update `entry`, keyed by its bare name.
    pub fn add(&mut self, entry: &str) {
        self.insert_unsorted(entry);
        self.sort();
    }

    /// Add many entries, then sort once.
    pub fn extend<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for entry in entries {
            self.insert_unsorted(entry.as_ref());
        }
        self.sort();
    }

    /// Drop every entry and load `entries` instead.
    pub fn replace<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.0.clear();
        self.extend(entries);
    }

    pub fn remove(&mut self, nick: &str) -> bool {
        match self.position(nick) {
            Some(i) => {
                self.0.remove(i);
                true
            }
            None => false,
        }
    }

    /// Rename `old` to `new`, keeping its prefix.
    pub fn rename(&mut self, old: &str, new: &str) -> bool {
        let Some(i) = self.position(old) else {
            return false;
        };
        let prefix = split_prefix(&self.0[i]).0;
        self.0.remove(i);
        // A stale entry under the new name would otherwise duplicate.
        self.remove(new);
        self.0.push(with_prefix(prefix, new));
        self.sort();
        true
    }

    /// Replace the display prefix of `nick`.
    pub fn set_prefix(&mut self, nick: &str, prefix: Option<char>) -> bool {
        let Some(i) = self.position(nick) else {
            return false;
        };
        let bare = split_prefix(&self.0[i]).1.to_string();
        self.0[i] = with_prefix(prefix, &bare);
        self.sort();
        true
    }

    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| member_order(a, b));
    }

    fn insert_unsorted(&mut self, entry: &str) {
        if split_prefix(entry).1.is_empty() {
            return;
        }
        match self.position(entry) {
            Some(i) => self.0[i] = entry.to_string(),
            None => self.0.push(entry.to_string()),
        }
    }
}

fn with_prefix(prefix: Option<char>, bare: &str) -> String {
    match prefix {
        Some(p) => format!("{p}{bare}"),
        None => bare.to_string(),
    }
}

fn member_order(a: &str, b: &str) -> Ordering {
    let (pa, na) = split_prefix(a);
    let (pb, nb) = split_prefix(b);
    let la = pa.map(level_of_prefix).unwrap_or(0);
    let lb = pb.map(level_of_prefix).unwrap_or(0);
    lb.cmp(&la)
        .then_with(|| na.to_lowercase().cmp(&nb.to_lowercase()))
        .then_with(|| na.cmp(nb))
}

/// One (mode letter, target) pair. Channel-wide modes have an empty target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mode {
    pub mode: char,
    pub target: String,
}

/// Set of mode pairs applied to a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ModeList(Vec<Mode>);

impl ModeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[Mode] {
        &self.0
    }

    pub fn has_mode(&self, mode: char, target: &str) -> bool {
        self.0
            .iter()
            .any(|m| m.mode == mode && m.target.eq_ignore_ascii_case(target))
    }

    /// Idempotent. Returns whether the pair was new.
    pub fn add_mode(&mut self, mode: char, target: &str) -> bool {
        if self.has_mode(mode, target) {
            return false;
        }
        self.0.push(Mode {
            mode,
            target: target.to_string(),
        });
        true
    }

    /// Removes every matching pair. Returns whether anything was removed.
    pub fn remove_mode(&mut self, mode: char, target: &str) -> bool {
        let before = self.0.len();
        self.0
            .retain(|m| !(m.mode == mode && m.target.eq_ignore_ascii_case(target)));
        self.0.len() != before
    }

    /// Display prefix for the highest status mode targeting `user`.
    pub fn prefix_of(&self, user: &str) -> Option<char> {
        self.0
            .iter()
            .filter(|m| m.target.eq_ignore_ascii_case(user))
            .max_by_key(|m| level_of_mode(m.mode))
            .and_then(|m| prefix_for_mode(m.mode))
    }

    /// Drop every status pair targeting `user`.
    pub fn forget_user(&mut self, user: &str) {
        self.0
            .retain(|m| !(level_of_mode(m.mode) > 0 && m.target.eq_ignore_ascii_case(user)));
    }

    pub fn rename_target(&mut self, old: &str, new: &str) {
        for m in self.0.iter_mut().filter(|m| level_of_mode(m.mode) > 0) {
            if m.target.eq_ignore_ascii_case(old) {
                m.target = new.to_string();
            }
        }
    }

    fn clear_status(&mut self) {
        self.0.retain(|m| level_of_mode(m.mode) == 0);
    }
}

/// One `+x target` / `-x` step of a MODE line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub adding: bool,
    pub mode: char,
    pub target: Option<String>,
}

/// Parse `+ov-b alice bob *!*@spam` into individual changes.
///
/// Status modes, list modes (`b`, `e`, `I`) and `k` always take an
/// argument; `l` takes one only when set.
pub fn parse_mode_changes(modes: &str, args: &[String]) -> Vec<ModeChange> {
    let mut args = args.iter();
    let mut adding = true;
    let mut changes = Vec::new();
    for c in modes.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            mode => {
                let takes_arg =
                    level_of_mode(mode) > 0 || matches!(mode, 'b' | 'e' | 'I' | 'k') || (mode == 'l' && adding);
                let target = if takes_arg { args.next().cloned() } else { None };
                changes.push(ModeChange { adding, mode, target });
            }
        }
    }
    changes
}

/// Live state of one channel on one network.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelState {
    pub name: String,
    pub network: String,
    pub topic: String,
    pub topic_set_by: String,
    /// Unix seconds; 0 when unknown.
    pub topic_set_at: i64,
    pub userlist: MemberList,
    pub modes: ModeList,
    /// Set between the first NAMES fragment and end-of-NAMES.
    #[serde(skip)]
    pub receiving_userlist: bool,
}

impl ChannelState {
    pub fn new(name: &str, network: &str) -> Self {
        Self {
            name: name.to_string(),
            network: network.to_string(),
            topic: String::new(),
            topic_set_by: String::new(),
            topic_set_at: 0,
            userlist: MemberList::new(),
            modes: ModeList::new(),
            receiving_userlist: false,
        }
    }

    /// Apply one mode change. Status modes also recompute the target's
    /// member prefix. Returns whether the member list changed.
    pub fn apply_mode(&mut self, change: &ModeChange) -> bool {
        let target = change.target.as_deref().unwrap_or("");
        if change.adding {
            self.modes.add_mode(change.mode, target);
        } else {
            self.modes.remove_mode(change.mode, target);
        }
        if level_of_mode(change.mode) == 0 || target.is_empty() {
            return false;
        }
        let prefix = self.modes.prefix_of(target);
        self.userlist.set_prefix(target, prefix)
    }

    /// One RPL_NAMREPLY fragment. The first fragment of a listing replaces
    /// the member list, later ones merge into it.
    pub fn names(&mut self, nicks: &[String]) {
        if !self.receiving_userlist {
            self.userlist.replace(std::iter::empty::<&str>());
            self.modes.clear_status();
            self.receiving_userlist = true;
        }
        for entry in nicks {
            // multi-prefix servers may send several prefix characters
            let bare = entry.trim_start_matches(|c| level_of_prefix(c) > 0);
            if bare.is_empty() {
                continue;
            }
            for prefix in entry[..entry.len() - bare.len()].chars() {
                if let Some(mode) = mode_for_prefix(prefix) {
                    self.modes.add_mode(mode, bare);
                }
            }
            let prefix = self.modes.prefix_of(bare);
            self.userlist.insert_unsorted(&with_prefix(prefix, bare));
        }
        self.userlist.sort();
    }

    pub fn names_end(&mut self) {
        self.receiving_userlist = false;
        self.userlist.sort();
    }

    pub fn join(&mut self, nick: &str) {
        if !self.userlist.contains(nick) {
            self.userlist.add(nick);
        }
    }

    pub fn leave(&mut self, nick: &str) -> bool {
        self.modes.forget_user(nick);
        self.userlist.remove(nick)
    }

    pub fn rename(&mut self, old: &str, new: &str) -> bool {
        self.modes.rename_target(old, new);
        self.userlist.rename(old, new)
    }

    pub fn set_topic(&mut self, topic: &str, set_by: &str, set_at: i64) {
        self.topic = topic.to_string();
        self.topic_set_by = set_by.to_string();
        self.topic_set_at = set_at;
    }
}

/// Channel states of one network, keyed by lower-cased name.
#[derive(Debug, Clone, Default)]
pub struct ChannelTable {
    channels: BTreeMap<String, ChannelState>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ChannelState> {
        self.channels.get(&name.to_lowercase())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ChannelState> {
        self.channels.get_mut(&name.to_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(&name.to_lowercase())
    }

    /// The state for `name`, created empty on first reference.
    pub fn ensure(&mut self, name: &str, network: &str) -> &mut ChannelState {
        self.channels
            .entry(name.to_lowercase())
            .or_insert_with(|| ChannelState::new(name, network))
    }

    pub fn remove(&mut self, name: &str) -> Option<ChannelState> {
        self.channels.remove(&name.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelState> {
        self.channels.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChannelState> {
        self.channels.values_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.values().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> MemberList {
        let mut l = MemberList::new();
        l.extend(entries);
        l
    }

    #[test]
    fn removing_op_resorts_alphabetically() {
        let mut chan = ChannelState::new("#rust", "libera");
        chan.names(&["@alice".to_string(), "bob".to_string()]);
        chan.names_end();
        assert_eq!(chan.userlist.as_slice(), ["@alice", "bob"]);

        let change = ModeChange {
            adding: false,
            mode: 'o',
            target: Some("alice".into()),
        };
        assert!(chan.apply_mode(&change));
        assert_eq!(chan.userlist.as_slice(), ["alice", "bob"]);
    }

    #[test]
    fn sorted_by_level_then_name() {
        let l = list(&["zed", "+Bob", "@carol", "alice", "~owner", "%half"]);
        assert_eq!(l.as_slice(), ["~owner", "@carol", "%half", "+Bob", "alice", "zed"]);
    }

    #[test]
    fn join_part_sequence_leaves_exact_set() {
        let mut chan = ChannelState::new("#c", "n");
        for nick in ["dave", "alice", "bob", "alice", "carol"] {
            chan.join(nick);
        }
        chan.leave("bob");
        chan.leave("nobody");
        chan.join("Erin");
        chan.leave("dave");
        assert_eq!(chan.userlist.as_slice(), ["alice", "carol", "Erin"]);
    }

    #[test]
    fn add_is_keyed_by_bare_name() {
        let mut l = list(&["alice"]);
        l.add("@alice");
        assert_eq!(l.as_slice(), ["@alice"]);
        assert!(l.contains("ALICE"));
    }

    #[test]
    fn has_mode_tracks_net_effect() {
        let mut modes = ModeList::new();
        assert!(!modes.remove_mode('o', "alice"));
        assert!(modes.add_mode('o', "alice"));
        assert!(!modes.add_mode('o', "alice"));
        modes.add_mode('v', "alice");
        assert!(modes.has_mode('o', "alice"));
        assert_eq!(modes.prefix_of("alice"), Some('@'));
        modes.remove_mode('o', "alice");
        assert!(!modes.has_mode('o', "alice"));
        assert_eq!(modes.prefix_of("alice"), Some('+'));
        assert_eq!(modes.as_slice().len(), 1);
    }

    #[test]
    fn voice_on_op_keeps_op_prefix() {
        let mut chan = ChannelState::new("#c", "n");
        chan.names(&["@alice".to_string()]);
        chan.names_end();
        for change in parse_mode_changes("+v", &["alice".to_string()]) {
            chan.apply_mode(&change);
        }
        assert_eq!(chan.userlist.as_slice(), ["@alice"]);
    }

    #[test]
    fn mode_string_consumes_args() {
        let args: Vec<String> = ["alice", "*!*@spam", "10", "bob"].iter().map(|s| s.to_string()).collect();
        let changes = parse_mode_changes("+obl-vn", &args);
        let targets: Vec<_> = changes.iter().map(|c| (c.adding, c.mode, c.target.as_deref())).collect();
        assert_eq!(
            targets,
            vec![
                (true, 'o', Some("alice")),
                (true, 'b', Some("*!*@spam")),
                (true, 'l', Some("10")),
                (false, 'v', Some("bob")),
                (false, 'n', None),
            ]
        );
    }

    #[test]
    fn names_replace_then_merge() {
        let mut chan = ChannelState::new("#c", "n");
        chan.join("stale");
        chan.names(&["@alice".to_string(), "bob".to_string()]);
        chan.names(&["+carol".to_string()]);
        chan.names_end();
        assert_eq!(chan.userlist.as_slice(), ["@alice", "+carol", "bob"]);
        assert!(chan.modes.has_mode('v', "carol"));
    }

    #[test]
    fn rename_keeps_prefix_and_modes() {
        let mut chan = ChannelState::new("#c", "n");
        chan.names(&["@alice".to_string(), "bob".to_string()]);
        chan.names_end();
        assert!(chan.rename("alice", "zoe"));
        assert_eq!(chan.userlist.as_slice(), ["@zoe", "bob"]);
        assert!(chan.modes.has_mode('o', "zoe"));
    }

    #[test]
    fn table_is_case_insensitive() {
        let mut table = ChannelTable::new();
        table.ensure("#Rust", "libera").topic = "hi".into();
        assert_eq!(table.get("#rust").map(|c| c.topic.as_str()), Some("hi"));
        assert_eq!(table.names(), vec!["#Rust".to_string()]);
        assert!(table.remove("#RUST").is_some());
        assert!(table.is_empty());
    }
}
