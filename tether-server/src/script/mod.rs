//! Script pipeline.
//!
//! A script is a named transformation unit that may rewrite a message,
//! cancel it, or move it to another network. Scripts run in a chain: the
//! network's own scripts first, then the account's global ones, each in
//! registration order.
//!
//! Two kinds ship:
//! - [`NativeScript`]: a Rust closure.
//! - [`rules::RuleScript`]: declarative TOML rules, loaded from disk.

pub mod rules;
pub mod store;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Which way a message is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// From the IRC server towards the user.
    Receive,
    /// From the user towards the IRC server.
    Send,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Receive => f.write_str("receive"),
            Direction::Send => f.write_str("send"),
        }
    }
}

/// The mutable carrier handed to each script.
#[derive(Debug, Clone)]
pub struct ScriptEvent {
    /// Name of the network the event originated on.
    pub network: String,
    /// Our nick on that network.
    pub nick: String,
    pub direction: Direction,
    pub message: Message,
    pub cancelled: bool,
}

impl ScriptEvent {
    pub fn new(network: &str, nick: &str, direction: Direction, message: Message) -> Self {
        Self {
            network: network.to_string(),
            nick: nick.to_string(),
            direction,
            message,
            cancelled: false,
        }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("{0}")]
    Failed(String),
}

/// One transformation unit.
pub trait Script: Send + Sync {
    fn name(&self) -> &str;

    /// Source text, for scripts that can be written back to disk.
    fn source(&self) -> Option<&str> {
        None
    }

    /// Inspect and mutate `event`. An error abandons the rest of this
    /// script's work; changes made before it stay.
    fn run(&self, event: &mut ScriptEvent) -> Result<(), ScriptError>;
}

type ScriptFn = dyn Fn(&mut ScriptEvent) -> Result<(), ScriptError> + Send + Sync;

/// A script implemented in Rust.
pub struct NativeScript {
    name: String,
    run: Box<ScriptFn>,
}

impl NativeScript {
    pub fn new<F>(name: &str, run: F) -> Self
    where
        F: Fn(&mut ScriptEvent) -> Result<(), ScriptError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            run: Box::new(run),
        }
    }
}

impl Script for NativeScript {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, event: &mut ScriptEvent) -> Result<(), ScriptError> {
        (self.run)(event)
    }
}

/// Insert `script`, replacing one with the same name in place.
///
/// Returns `true` if the name was new.
pub fn upsert(scripts: &mut Vec<Arc<dyn Script>>, script: Arc<dyn Script>) -> bool {
    match scripts.iter_mut().find(|s| s.name() == script.name()) {
        Some(slot) => {
            *slot = script;
            false
        }
        None => {
            scripts.push(script);
            true
        }
    }
}

/// Remove the script called `name`. Returns whether one was removed.
pub fn remove(scripts: &mut Vec<Arc<dyn Script>>, name: &str) -> bool {
    let before = scripts.len();
    scripts.retain(|s| s.name() != name);
    scripts.len() != before
}

/// What the network should do with the message after the chain ran.
#[derive(Debug)]
pub enum Disposition<H> {
    /// Carry on locally with the (possibly rewritten) message.
    Deliver,
    /// A script cancelled it.
    Cancelled,
    /// A script moved it to the network behind `H`.
    Redirect(H),
}

/// Run `chain` over `event`.
///
/// Stops at the first script that cancels the event or points the message
/// at a different network. A network `lookup` cannot resolve is reset to
/// the originating one and the chain carries on. Script errors are logged
/// and skipped.
pub fn run_chain<'a, H>(
    event: &mut ScriptEvent,
    chain: impl IntoIterator<Item = &'a Arc<dyn Script>>,
    lookup: impl Fn(&str) -> Option<H>,
) -> Disposition<H> {
    for script in chain {
        if let Err(e) = script.run(event) {
            tracing::warn!(
                script = script.name(),
                network = %event.network,
                direction = %event.direction,
                error = %e,
                "Script failed"
            );
        }
        if event.cancelled {
            return Disposition::Cancelled;
        }
        if event.message.network != event.network {
            match lookup(&event.message.network) {
                Some(target) => return Disposition::Redirect(target),
                None => {
                    tracing::debug!(
                        script = script.name(),
                        target = %event.message.network,
                        "Redirect to unknown network ignored"
                    );
                    event.message.network = event.network.clone();
                }
            }
        }
    }
    Disposition::Deliver
}
