//! IRC line codec.
//!
//! Parses `@tags :prefix COMMAND params :trailing` into a [`Message`] and
//! formats a [`Message`] back into a wire line (without the CRLF).

use std::collections::HashMap;
use std::fmt;

/// One protocol line, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags, unescaped.
    pub tags: HashMap<String, String>,
    /// `nick!user@host` or a server name.
    pub prefix: Option<String>,
    /// Upper-cased command or three-digit numeric.
    pub command: String,
    /// Middle params followed by the trailing param, if any.
    pub params: Vec<String>,
}

impl Message {
    /// Parse a raw line. Returns `None` for blank or truncated input.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return None;
        }

        let mut tags = HashMap::new();
        if let Some(tagged) = rest.strip_prefix('@') {
            let (raw, after) = tagged.split_once(' ')?;
            for pair in raw.split(';').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((key, value)) => tags.insert(key.to_string(), unescape_tag(value)),
                    None => tags.insert(pair.to_string(), String::new()),
                };
            }
            rest = after.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(prefixed) = rest.strip_prefix(':') {
            let (source, after) = prefixed.split_once(' ')?;
            prefix = Some(source.to_string());
            rest = after.trim_start_matches(' ');
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, after)) => (command, after),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, after)) => {
                    params.push(param.to_string());
                    rest = after;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Message {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    pub fn new(command: &str, params: &[&str]) -> Self {
        Self {
            tags: HashMap::new(),
            prefix: None,
            command: command.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Nick part of the prefix, or the whole prefix for server sources.
    pub fn source_nick(&self) -> &str {
        self.prefix
            .as_deref()
            .map(|p| p.split('!').next().unwrap_or(p))
            .unwrap_or("")
    }

    /// Whether the prefix names a user rather than a server.
    pub fn from_user(&self) -> bool {
        self.prefix.as_deref().is_some_and(|p| p.contains('!'))
    }

    /// Param `index`, or the empty string.
    pub fn param(&self, index: usize) -> &str {
        self.params.get(index).map(String::as_str).unwrap_or("")
    }

    /// Last param, which is the trailing text for most commands.
    pub fn trailing(&self) -> &str {
        self.params.last().map(String::as_str).unwrap_or("")
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            let mut keys: Vec<&String> = self.tags.keys().collect();
            keys.sort();
            f.write_str("@")?;
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                let value = &self.tags[key];
                if value.is_empty() {
                    write!(f, "{key}")?;
                } else {
                    write!(f, "{key}={}", escape_tag(value))?;
                }
            }
            f.write_str(" ")?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            let needs_colon = param.is_empty() || param.contains(' ') || param.starts_with(':');
            if i == last && needs_colon {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefix_and_trailing() {
        let msg = Message::parse(":alice!a@host PRIVMSG #rust :hello there\r\n").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("alice!a@host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#rust", "hello there"]);
        assert_eq!(msg.source_nick(), "alice");
        assert!(msg.from_user());
    }

    #[test]
    fn parses_numeric_without_trailing() {
        let msg = Message::parse(":irc.example.net 366 me #rust :End of /NAMES list.").unwrap();
        assert_eq!(msg.command, "366");
        assert_eq!(msg.param(1), "#rust");
        assert_eq!(msg.source_nick(), "irc.example.net");
        assert!(!msg.from_user());
    }

    #[test]
    fn parses_tags() {
        let msg = Message::parse("@time=2024-01-01T00:00:00Z;note=a\\sb :n!u@h PRIVMSG #c :x").unwrap();
        assert_eq!(msg.tags["time"], "2024-01-01T00:00:00Z");
        assert_eq!(msg.tags["note"], "a b");
        assert_eq!(msg.param(0), "#c");
    }

    #[test]
    fn command_is_uppercased() {
        let msg = Message::parse("ping :token").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.trailing(), "token");
    }

    #[test]
    fn rejects_blank_and_truncated() {
        assert!(Message::parse("\r\n").is_none());
        assert!(Message::parse(":prefix-only").is_none());
    }

    #[test]
    fn formats_trailing_with_colon() {
        let msg = Message::new("PRIVMSG", &["#rust", "two words"]);
        assert_eq!(msg.to_string(), "PRIVMSG #rust :two words");
        let msg = Message::new("JOIN", &["#rust"]);
        assert_eq!(msg.to_string(), "JOIN #rust");
    }
}
