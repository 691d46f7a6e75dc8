//! Connection registry for the Beacon relay.
//!
//! Maps each registered user identity to its currently active connection.
//! At most one connection per user: a second `setup` for the same user
//! supersedes the previous mapping (last writer wins). Entries are removed
//! exactly when the owning connection disconnects.

use beacon_protocol::events::{ConnectionId, UserId};
use dashmap::DashMap;
use tracing::debug;

/// Mapping from user identity to live connection.
///
/// Backed by a concurrent map, so every operation is atomic with respect to
/// all others; concurrent setups and disconnects resolve deterministically.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<UserId, ConnectionId>,
}

impl ConnectionRegistry {
    /// Create a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user on a connection, superseding any previous mapping.
    ///
    /// Returns the superseded connection id, if any. The superseded
    /// connection is not closed; only its mapping is replaced.
    pub fn register(
        &self,
        user_id: impl Into<UserId>,
        connection_id: impl Into<ConnectionId>,
    ) -> Option<ConnectionId> {
        let user_id = user_id.into();
        let connection_id = connection_id.into();
        debug!(user = %user_id, connection = %connection_id, "Registry: user registered");
        self.entries.insert(user_id, connection_id)
    }

    /// Remove the mapping owned by a connection.
    ///
    /// Keyed by connection id, not user id: a disconnect racing a fresh
    /// `setup` for the same user must not remove the newer mapping. No-op
    /// when the connection owns no mapping (e.g. it disconnected before
    /// completing setup, or was already superseded).
    ///
    /// Returns the unregistered user id, if any.
    pub fn unregister(&self, connection_id: &str) -> Option<UserId> {
        let user_id = self
            .entries
            .iter()
            .find(|entry| entry.value() == connection_id)
            .map(|entry| entry.key().clone())?;

        // Conditional removal: only if the mapping still points at this
        // connection by the time we take the entry lock.
        let removed = self
            .entries
            .remove_if(&user_id, |_, conn| conn == connection_id)
            .map(|(user_id, _)| user_id);

        if let Some(ref user_id) = removed {
            debug!(user = %user_id, connection = %connection_id, "Registry: user unregistered");
        }
        removed
    }

    /// Look up the connection currently registered for a user.
    ///
    /// An absent result is an expected condition (the user disconnected or
    /// never connected), not a fault.
    #[must_use]
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        self.entries.get(user_id).map(|entry| entry.value().clone())
    }

    /// Snapshot of all currently registered user ids.
    #[must_use]
    pub fn user_ids(&self) -> Vec<UserId> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no users are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
