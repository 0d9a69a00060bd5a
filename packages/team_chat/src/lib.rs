//! Terminal client for team chat channels.
//!
//! Wires the HTTP history/send API and the WebSocket push feed into a
//! [`message_stream::ChannelSession`].

pub mod api;
pub mod cli;
pub mod config;
pub mod push;
