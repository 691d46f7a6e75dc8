//! Presence status store for the Beacon relay.
//!
//! Maps user identity to an opaque status value chosen by the client. The
//! status is independent of online/offline state and survives disconnect;
//! it lives until explicitly cleared or the process restarts. Nothing here
//! is persisted.

use beacon_protocol::events::UserId;
use beacon_protocol::StatusEntry;
use dashmap::DashMap;
use tracing::debug;

/// Per-user status store.
#[derive(Debug, Default)]
pub struct PresenceStore {
    statuses: DashMap<UserId, String>,
}

impl PresenceStore {
    /// Create a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear a user's status.
    ///
    /// A non-empty value inserts or overwrites; an absent or empty value
    /// deletes the entry. Status values are opaque and intentionally not
    /// validated beyond the emptiness check.
    pub fn set_status(&self, user_id: impl Into<UserId>, status: Option<&str>) {
        let user_id = user_id.into();
        match status {
            Some(status) if !status.is_empty() => {
                debug!(user = %user_id, status = %status, "Presence: status set");
                self.statuses.insert(user_id, status.to_string());
            }
            _ => {
                if self.statuses.remove(&user_id).is_some() {
                    debug!(user = %user_id, "Presence: status cleared");
                }
            }
        }
    }

    /// Get a user's stored status.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<String> {
        self.statuses.get(user_id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every stored (user, status) pair, used to seed a client
    /// completing setup. Order is not meaningful.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StatusEntry> {
        self.statuses
            .iter()
            .map(|entry| StatusEntry {
                user_id: entry.key().clone(),
                status: entry.value().clone(),
            })
            .collect()
    }

    /// Number of stored statuses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}
