//! # Message Routing Server Library
//!
//! This library implements the server side of the routing protocol:
//! clients connect over TCP, register a numeric identifier, join and leave
//! rooms, and exchange point-to-point or room-broadcast messages.
//!
//! ## Architecture
//!
//! One task runs per accepted connection. Handlers share exactly two
//! pieces of state:
//!
//! - the [`registry::Registry`] — identifier and room tables behind one
//!   coarse lock; critical sections are map operations only, never I/O
//! - per-connection write locks, carried by [`registry::Endpoint`], so
//!   concurrent handlers forwarding to the same destination never
//!   interleave bytes mid-frame
//!
//! Locks nest in one fixed order: the registry lock is released before any
//! endpoint lock is taken, which keeps two handlers forwarding to each
//! other's endpoints deadlock-free.
//!
//! Reads poll with a bounded timeout so every handler observes the
//! shutdown flag within a tick even when its connection is idle; the
//! accept loop tracks handler tasks and joins them during shutdown.
//!
//! ## Delivery guarantees
//!
//! Frames from one sender are routed in the order they were framed (a
//! single reader per connection processes them sequentially). There is no
//! ordering across different senders, and a room broadcast is not atomic
//! relative to other traffic.
//!
//! ## Module Organization
//!
//! - [`registry`] — identifier/room tables and per-connection endpoints
//! - [`network`] — accept loop, session handlers, dispatch, shutdown

pub mod network;
pub mod registry;
