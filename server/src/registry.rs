//! Connection registry for the routing server
//!
//! This module owns the server's shared mutable state:
//! - `clients`: registered identifiers and the connection each belongs to
//! - `rooms`: named member sets used for broadcast delivery
//! - per-connection exclusive write locks (carried by [`Endpoint`])
//!
//! One coarse lock guards both maps. Mutation rate is low compared to the
//! routing rate, and critical sections only touch the maps, so the simple
//! locking scheme holds up. No I/O happens while the registry lock is held;
//! routing paths resolve endpoints first, release the lock, then write.

use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Boxed write half of a connection. Boxing keeps the registry independent
/// of the concrete transport, so tests can use in-memory streams.
pub type WriteSink = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// One live connection on the server side.
///
/// Couples a stable connection id, the peer address, and the exclusive
/// write lock that every frame destined for this connection must pass
/// through. The lock is held only around the write itself and is never
/// taken while holding the registry lock.
pub struct Endpoint {
    id: u64,
    peer: SocketAddr,
    writer: tokio::sync::Mutex<WriteSink>,
}

impl Endpoint {
    /// Wraps the write half of an accepted connection.
    pub fn new(peer: SocketAddr, writer: WriteSink) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            writer: tokio::sync::Mutex::new(writer),
        })
    }

    /// Stable id of this connection, unique for the server's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address of the connected peer.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Writes one encoded frame under this connection's write lock.
    ///
    /// Concurrent session handlers routing to the same destination all pass
    /// through here, so frames land on the wire whole, never interleaved.
    pub async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await
    }
}

/// Failure mode of [`Registry::register_client`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// The identifier is already registered to a live connection.
    #[error("identifier already registered")]
    DuplicateId,
}

/// Failure modes of [`Registry::leave_room`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LeaveError {
    /// The room has never been created (or is already gone).
    #[error("room not found")]
    RoomNotFound,
    /// The identifier is not a member of the room.
    #[error("not a member of the room")]
    NotInRoom,
}

#[derive(Default)]
struct Inner {
    clients: HashMap<u32, Arc<Endpoint>>,
    rooms: HashMap<u32, HashSet<u32>>,
}

/// Maps identifiers to connections and rooms to member sets.
///
/// Room membership stores identifiers, not endpoints: delivery resolves
/// each member through `clients` at send time, so a member that dropped
/// its connection is skipped and one that reconnected is rerouted without
/// the room table ever being touched.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `ident` as belonging to `endpoint`.
    ///
    /// An identifier may belong to at most one connection at a time; a
    /// second registration is rejected and the first mapping is retained.
    pub fn register_client(
        &self,
        ident: u32,
        endpoint: Arc<Endpoint>,
    ) -> Result<(), RegisterError> {
        let mut inner = self.lock();
        if inner.clients.contains_key(&ident) {
            return Err(RegisterError::DuplicateId);
        }
        info!("client {} registered from {}", ident, endpoint.peer());
        inner.clients.insert(ident, endpoint);
        Ok(())
    }

    /// Removes `ident` from the registry. Idempotent; unknown identifiers
    /// are silently ignored.
    pub fn unregister_client(&self, ident: u32) {
        if self.lock().clients.remove(&ident).is_some() {
            info!("client {} unregistered", ident);
        }
    }

    /// Resolves `ident` to its live connection, if registered.
    pub fn lookup_client(&self, ident: u32) -> Option<Arc<Endpoint>> {
        self.lock().clients.get(&ident).cloned()
    }

    /// Adds `ident` to `room`, creating the room on first join. Idempotent.
    pub fn join_room(&self, room: u32, ident: u32) {
        let mut inner = self.lock();
        if inner.rooms.entry(room).or_default().insert(ident) {
            info!("client {} joined room {}", ident, room);
        }
    }

    /// Removes `ident` from `room`. A room whose member set becomes empty
    /// is dropped, so long-running servers do not accumulate dead rooms.
    pub fn leave_room(&self, room: u32, ident: u32) -> Result<(), LeaveError> {
        let mut inner = self.lock();
        let members = inner.rooms.get_mut(&room).ok_or(LeaveError::RoomNotFound)?;
        if !members.remove(&ident) {
            return Err(LeaveError::NotInRoom);
        }
        info!("client {} left room {}", ident, room);
        if members.is_empty() {
            inner.rooms.remove(&room);
        }
        Ok(())
    }

    /// Snapshot of a room's member identifiers, or `None` for an unknown
    /// room. Members are identifiers, not connections; resolve each through
    /// [`Registry::lookup_client`] at delivery time.
    pub fn room_members(&self, room: u32) -> Option<Vec<u32>> {
        self.lock()
            .rooms
            .get(&room)
            .map(|members| members.iter().copied().collect())
    }

    /// Drops every client entry belonging to a torn-down connection.
    ///
    /// Room membership is deliberately left alone: it is keyed by
    /// identifier and a stale member simply fails the `clients` lookup at
    /// delivery time until an explicit LEAVE or re-registration.
    pub fn unregister_endpoint(&self, endpoint_id: u64) {
        let mut inner = self.lock();
        let before = inner.clients.len();
        inner.clients.retain(|_, endpoint| endpoint.id() != endpoint_id);
        let removed = before - inner.clients.len();
        if removed > 0 {
            debug!(
                "endpoint {} torn down, {} identifier(s) dropped",
                endpoint_id, removed
            );
        }
    }

    /// Number of currently registered identifiers.
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8888".parse().unwrap()
    }

    fn test_endpoint() -> Arc<Endpoint> {
        let (_, writer) = duplex(1024);
        Endpoint::new(test_addr(), Box::new(writer))
    }

    #[test]
    fn test_endpoint_ids_are_unique() {
        let a = test_endpoint();
        let b = test_endpoint();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_register_client() {
        let registry = Registry::new();
        let endpoint = test_endpoint();

        assert!(registry.register_client(5, endpoint.clone()).is_ok());
        assert_eq!(registry.client_count(), 1);
        assert_eq!(registry.lookup_client(5).unwrap().id(), endpoint.id());
    }

    #[test]
    fn test_register_duplicate_keeps_first_mapping() {
        let registry = Registry::new();
        let first = test_endpoint();
        let second = test_endpoint();

        assert!(registry.register_client(5, first.clone()).is_ok());
        assert_eq!(
            registry.register_client(5, second),
            Err(RegisterError::DuplicateId)
        );
        assert_eq!(registry.lookup_client(5).unwrap().id(), first.id());
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn test_unregister_client_is_idempotent() {
        let registry = Registry::new();
        registry.register_client(5, test_endpoint()).unwrap();

        registry.unregister_client(5);
        assert!(registry.lookup_client(5).is_none());

        // A second unregister of the same ident must not panic or error.
        registry.unregister_client(5);
        registry.unregister_client(999);
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn test_lookup_unknown_client() {
        let registry = Registry::new();
        assert!(registry.lookup_client(42).is_none());
    }

    #[test]
    fn test_join_room_creates_lazily_and_is_idempotent() {
        let registry = Registry::new();

        registry.join_room(50, 1);
        registry.join_room(50, 1);
        registry.join_room(50, 2);

        let mut members = registry.room_members(50).unwrap();
        members.sort_unstable();
        assert_eq!(members, vec![1, 2]);
    }

    #[test]
    fn test_room_members_unknown_room() {
        let registry = Registry::new();
        assert!(registry.room_members(50).is_none());
    }

    #[test]
    fn test_leave_room() {
        let registry = Registry::new();
        registry.join_room(50, 1);
        registry.join_room(50, 2);

        assert!(registry.leave_room(50, 1).is_ok());
        assert_eq!(registry.room_members(50).unwrap(), vec![2]);
    }

    #[test]
    fn test_leave_room_not_a_member() {
        let registry = Registry::new();
        registry.join_room(50, 2);

        assert_eq!(registry.leave_room(50, 1), Err(LeaveError::NotInRoom));
    }

    #[test]
    fn test_leave_unknown_room() {
        let registry = Registry::new();
        assert_eq!(registry.leave_room(50, 1), Err(LeaveError::RoomNotFound));
    }

    #[test]
    fn test_empty_room_is_dropped() {
        let registry = Registry::new();
        registry.join_room(50, 1);

        assert!(registry.leave_room(50, 1).is_ok());
        assert!(registry.room_members(50).is_none());
        assert_eq!(registry.leave_room(50, 1), Err(LeaveError::RoomNotFound));
    }

    #[test]
    fn test_unregister_endpoint_scrubs_all_its_idents() {
        let registry = Registry::new();
        let gone = test_endpoint();
        let stays = test_endpoint();

        registry.register_client(1, gone.clone()).unwrap();
        registry.register_client(2, gone.clone()).unwrap();
        registry.register_client(3, stays.clone()).unwrap();

        registry.unregister_endpoint(gone.id());

        assert!(registry.lookup_client(1).is_none());
        assert!(registry.lookup_client(2).is_none());
        assert_eq!(registry.lookup_client(3).unwrap().id(), stays.id());
    }

    #[test]
    fn test_room_membership_survives_endpoint_teardown() {
        // Membership is by identifier; a dropped connection leaves a stale
        // member that delivery skips via the failed clients lookup.
        let registry = Registry::new();
        let endpoint = test_endpoint();

        registry.register_client(1, endpoint.clone()).unwrap();
        registry.join_room(50, 1);
        registry.unregister_endpoint(endpoint.id());

        assert!(registry.lookup_client(1).is_none());
        assert_eq!(registry.room_members(50).unwrap(), vec![1]);
    }

    #[test]
    fn test_write_frame_reaches_the_sink() {
        let (mut read_half, writer) = duplex(1024);
        let endpoint = Endpoint::new(test_addr(), Box::new(writer));

        tokio_test::block_on(async {
            endpoint
                .write_frame(&shared::encode_connect(5))
                .await
                .unwrap();

            let mut buf = [0u8; 64];
            let n = tokio::io::AsyncReadExt::read(&mut read_half, &mut buf)
                .await
                .unwrap();
            assert_eq!(&buf[..n], shared::encode_connect(5).as_slice());
        });
    }
}
