//! Declarative rule scripts.
//!
//! A rule script is a TOML document of `[[rule]]` tables. Every matcher is
//! an optional regex; a rule fires when all of its matchers match. Actions
//! run in a fixed order: `rewrite`, then `set`, then `cancel`.
//!
//! ```toml
//! [[rule]]
//! direction = "receive"
//! sender = "(?i)^spambot$"
//! cancel = true
//!
//! [[rule]]
//! channel = "^#relay$"
//! set = { network = "oftc", channel = "#relay-{network}" }
//! stop = true
//! ```
//!
//! `set` values may reference the message as it was before the rule fired
//! through `{network}`, `{channel}`, `{sender}`, `{command}`, `{body}` and
//! `{nick}`.

use regex::Regex;
use serde::Deserialize;

use super::{Direction, Script, ScriptError, ScriptEvent};

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid rule file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("rule {index}: bad `{field}` pattern: {source}")]
    Pattern {
        index: usize,
        field: &'static str,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSpec {
    direction: Option<Direction>,
    network: Option<String>,
    channel: Option<String>,
    sender: Option<String>,
    command: Option<String>,
    body: Option<String>,
    rewrite: Option<Rewrite>,
    #[serde(default)]
    set: Assignments,
    #[serde(default)]
    cancel: bool,
    #[serde(default)]
    stop: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Rewrite {
    pattern: String,
    with: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Assignments {
    network: Option<String>,
    channel: Option<String>,
    sender: Option<String>,
    command: Option<String>,
    body: Option<String>,
}

#[derive(Debug)]
struct Rule {
    direction: Option<Direction>,
    network: Option<Regex>,
    channel: Option<Regex>,
    sender: Option<Regex>,
    command: Option<Regex>,
    body: Option<Regex>,
    rewrite: Option<(Regex, String)>,
    set: Assignments,
    cancel: bool,
    stop: bool,
}

impl Rule {
    fn matches(&self, event: &ScriptEvent) -> bool {
        let msg = &event.message;
        let test = |re: &Option<Regex>, value: &str| re.as_ref().is_none_or(|re| re.is_match(value));
        self.direction.is_none_or(|d| d == event.direction)
            && test(&self.network, &msg.network)
            && test(&self.channel, &msg.channel)
            && test(&self.sender, &msg.sender)
            && test(&self.command, &msg.command)
            && test(&self.body, &msg.body)
    }

    fn apply(&self, event: &mut ScriptEvent) -> Result<(), ScriptError> {
        if let Some((pattern, with)) = &self.rewrite {
            event.message.body = pattern.replace_all(&event.message.body, with.as_str()).into_owned();
        }

        let before = event.clone();
        let fill = |template: &str| expand(template, &before);
        if let Some(network) = &self.set.network {
            let value = fill(network);
            if value.is_empty() {
                return Err(ScriptError::EmptyField("network"));
            }
            event.message.network = value;
        }
        if let Some(channel) = &self.set.channel {
            let value = fill(channel);
            if value.is_empty() {
                return Err(ScriptError::EmptyField("channel"));
            }
            event.message.channel = value;
        }
        if let Some(sender) = &self.set.sender {
            event.message.sender = fill(sender);
        }
        if let Some(command) = &self.set.command {
            event.message.command = fill(command);
        }
        if let Some(body) = &self.set.body {
            event.message.body = fill(body);
        }

        if self.cancel {
            event.cancel();
        }
        Ok(())
    }
}

fn expand(template: &str, event: &ScriptEvent) -> String {
    let msg = &event.message;
    template
        .replace("{network}", &msg.network)
        .replace("{channel}", &msg.channel)
        .replace("{sender}", &msg.sender)
        .replace("{command}", &msg.command)
        .replace("{body}", &msg.body)
        .replace("{nick}", &event.nick)
}

/// A script made of TOML rules.
#[derive(Debug)]
pub struct RuleScript {
    name: String,
    source: String,
    rules: Vec<Rule>,
}

impl RuleScript {
    pub fn parse(name: &str, source: &str) -> Result<Self, RuleError> {
        let file: RuleFile = toml::from_str(source)?;
        let rules = file
            .rules
            .into_iter()
            .enumerate()
            .map(|(index, spec)| compile(index, spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.to_string(),
            source: source.to_string(),
            rules,
        })
    }
}

fn compile(index: usize, spec: RuleSpec) -> Result<Rule, RuleError> {
    let pattern = |field: &'static str, value: Option<String>| {
        value
            .map(|p| Regex::new(&p))
            .transpose()
            .map_err(|source| RuleError::Pattern { index, field, source })
    };
    let rewrite = spec
        .rewrite
        .map(|r| {
            Regex::new(&r.pattern)
                .map(|re| (re, r.with))
                .map_err(|source| RuleError::Pattern {
                    index,
                    field: "rewrite",
                    source,
                })
        })
        .transpose()?;
    Ok(Rule {
        direction: spec.direction,
        network: pattern("network", spec.network)?,
        channel: pattern("channel", spec.channel)?,
        sender: pattern("sender", spec.sender)?,
        command: pattern("command", spec.command)?,
        body: pattern("body", spec.body)?,
        rewrite,
        set: spec.set,
        cancel: spec.cancel,
        stop: spec.stop,
    })
}

impl Script for RuleScript {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> Option<&str> {
        Some(&self.source)
    }

    fn run(&self, event: &mut ScriptEvent) -> Result<(), ScriptError> {
        for rule in &self.rules {
            if !rule.matches(event) {
                continue;
            }
            rule.apply(event)?;
            if rule.stop || event.cancelled {
                break;
            }
        }
        Ok(())
    }
}
