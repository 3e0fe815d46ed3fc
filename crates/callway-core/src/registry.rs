//! Connection registry.
//!
//! Maps each online user to the single connection currently allowed to act
//! for them. The last connection to register wins.

use callway_protocol::ServerFrame;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A user identifier, as supplied by the authentication layer.
pub type UserId = String;

/// Outbound queue of a connection.
pub type Outbound = mpsc::UnboundedSender<Arc<ServerFrame>>;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection, never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection ID.
    #[must_use]
    pub fn next() -> Self {
        Self(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Handle to a live connection: who it belongs to and where to send frames.
///
/// The handle owns the connection's only outbound sender, so dropping it
/// (on replacement or unregister) closes the connection's queue.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user: UserId,
    outbound: Outbound,
}

impl ConnectionHandle {
    /// Create a handle with a freshly allocated connection ID.
    #[must_use]
    pub fn new(user: impl Into<UserId>, outbound: Outbound) -> Self {
        Self {
            id: ConnectionId::next(),
            user: user.into(),
            outbound,
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the user this connection is authenticated as.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Queue a frame for the connection.
    ///
    /// Returns `false` if the connection's writer has gone away.
    pub fn send(&self, frame: Arc<ServerFrame>) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// The user → connection map.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<UserId, ConnectionHandle>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate the handle's user with the handle, replacing any prior
    /// association.
    ///
    /// Returns the displaced handle, if any.
    pub fn register(&mut self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let user = handle.user.clone();
        let id = handle.id;
        let previous = self.entries.insert(user.clone(), handle);

        match &previous {
            Some(old) => debug!(
                user = %user,
                connection = %id,
                replaced = %old.id,
                "Registry: connection replaced"
            ),
            None => debug!(user = %user, connection = %id, "Registry: user online"),
        }

        previous
    }

    /// Remove the user's entry, but only if it still belongs to `connection`.
    ///
    /// A connection that was already replaced by a newer one for the same
    /// user leaves the newer entry untouched.
    pub fn unregister(
        &mut self,
        user: &str,
        connection: ConnectionId,
    ) -> Option<ConnectionHandle> {
        match self.entries.get(user) {
            Some(current) if current.id == connection => {
                debug!(user = %user, connection = %connection, "Registry: user offline");
                self.entries.remove(user)
            }
            Some(current) => {
                debug!(
                    user = %user,
                    connection = %connection,
                    current = %current.id,
                    "Registry: ignoring unregister of replaced connection"
                );
                None
            }
            None => {
                trace!(user = %user, connection = %connection, "Registry: unregister of unknown user");
                None
            }
        }
    }

    /// Get the connection registered for a user.
    #[must_use]
    pub fn lookup(&self, user: &str) -> Option<&ConnectionHandle> {
        self.entries.get(user)
    }

    /// Check whether `connection` is the one currently registered for `user`.
    #[must_use]
    pub fn is_current(&self, user: &str, connection: ConnectionId) -> bool {
        self.entries
            .get(user)
            .is_some_and(|handle| handle.id == connection)
    }

    /// The online set: every registered user, sorted.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.entries.keys().cloned().collect();
        users.sort_unstable();
        users
    }

    /// Iterate over all registered connections.
    pub fn handles(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.entries.values()
    }

    /// Number of online users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nobody is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn handle(user: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<Arc<ServerFrame>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(user, tx), rx)
    }

    #[test]
    fn test_register_lookup() {
        let mut registry = ConnectionRegistry::new();
        let (alice, _rx) = handle("alice");
        let id = alice.id();

        assert!(registry.register(alice).is_none());
        assert_eq!(registry.lookup("alice").map(|h| h.id()), Some(id));
        assert!(registry.lookup("bob").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_second_registration_wins() {
        let mut registry = ConnectionRegistry::new();
        let (first, _rx1) = handle("alice");
        let (second, _rx2) = handle("alice");
        let first_id = first.id();
        let second_id = second.id();

        registry.register(first);
        let displaced = registry.register(second).unwrap();

        assert_eq!(displaced.id(), first_id);
        assert_eq!(registry.lookup("alice").map(|h| h.id()), Some(second_id));
        assert_eq!(registry.online_users(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_stale_unregister_keeps_newer_connection() {
        let mut registry = ConnectionRegistry::new();
        let (first, _rx1) = handle("alice");
        let (second, _rx2) = handle("alice");
        let first_id = first.id();
        let second_id = second.id();

        registry.register(first);
        registry.register(second);

        assert!(registry.unregister("alice", first_id).is_none());
        assert!(registry.is_current("alice", second_id));

        assert!(registry.unregister("alice", second_id).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_online_set_tracks_registrations() {
        let mut registry = ConnectionRegistry::new();
        let mut expected = BTreeSet::new();
        let mut ids = Vec::new();
        let mut receivers = Vec::new();

        // Interleave registrations, re-registrations and removals.
        for (step, user) in ["a", "b", "c", "a", "d", "b"].iter().enumerate() {
            let (h, rx) = handle(user);
            ids.push((user.to_string(), h.id()));
            receivers.push(rx);
            registry.register(h);
            expected.insert(user.to_string());

            if step % 2 == 1 {
                let (victim, id) = ids[step / 2].clone();
                if registry.unregister(&victim, id).is_some() {
                    expected.remove(&victim);
                }
            }

            let online: BTreeSet<String> = registry.online_users().into_iter().collect();
            assert_eq!(online, expected);
            assert_eq!(registry.online_users().len(), expected.len());
        }
    }

    #[test]
    fn test_send_to_closed_connection() {
        let (alice, rx) = handle("alice");
        drop(rx);
        assert!(!alice.send(Arc::new(ServerFrame::pong(None))));
    }
}
