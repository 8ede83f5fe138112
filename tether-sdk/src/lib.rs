//! IRC transport for the tether bouncer.
//!
//! Owns the socket side of one network connection: registration, keep-alive,
//! and translation of protocol lines into [`event::Event`] values. Higher
//! layers only ever see events and send [`client::Command`]s.

pub mod client;
pub mod event;
pub mod irc;
