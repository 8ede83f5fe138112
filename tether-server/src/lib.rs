pub mod accounts;
pub mod channel;
pub mod config;
pub mod db;
pub mod message;
pub mod mux;
pub mod network;
pub mod outbox;
pub mod preview;
pub mod protocol;
pub mod script;
pub mod server;
pub mod split;
pub mod user;
pub mod web;
