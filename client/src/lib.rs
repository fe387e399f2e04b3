//! # Routing Client Library
//!
//! Interactive client for the message-routing server. One connection is
//! shared by two tasks:
//!
//! - the **command loop** ([`network::Client::run`]) parses user input into
//!   wire frames and enforces the strict one-outstanding-request protocol:
//!   after each request it blocks until the server's REPLY has arrived.
//!   The wire format has no request ids, so pipelining is structurally
//!   unsupported.
//! - the **receiver** runs in the background, decoding every complete
//!   frame per read, displaying routed messages, and waking the command
//!   loop when a REPLY lands. A message the client routed to itself is
//!   suppressed from display.
//!
//! ## Module Organization
//!
//! - [`commands`] — tokenizing and parsing of interactive commands
//!   (`send`, `join`, `leave`, `connect`, `disconnect`, `exit`)
//! - [`network`] — the connection, reply rendezvous, and receiver loop

pub mod commands;
pub mod network;
