//! Stateless signal routing.
//!
//! Call negotiation messages are addressed in one of two ways: `call-user`
//! and `end-call` name a user and resolve through the registry, while
//! `answer-call` and `ice-candidate` name a connection directly, because at
//! that point in the handshake the answering side already learned the
//! caller's connection id from the forwarded `incoming-call`. The asymmetry
//! is part of the protocol the clients speak and is kept as-is.
//!
//! A target that does not resolve means the peer vanished or never
//! connected; the message is dropped silently. That is a normal race under
//! connection churn, not a fault, so nothing is surfaced to the sender.

use crate::registry::ConnectionRegistry;
use beacon_protocol::events::{ConnectionId, UserId};
use tracing::trace;

/// Where a negotiation message should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingTarget {
    /// Route by user identity through the registry.
    User(UserId),
    /// Route directly to a connection, no lookup.
    Connection(ConnectionId),
}

/// Resolve a routing target to a destination connection.
///
/// Returns `None` when the target user is not registered; the caller drops
/// the message. Connection targets pass through untouched - whether that
/// connection is still alive is discovered at delivery time.
#[must_use]
pub fn resolve(registry: &ConnectionRegistry, target: &RoutingTarget) -> Option<ConnectionId> {
    match target {
        RoutingTarget::User(user_id) => {
            let resolved = registry.lookup(user_id);
            if resolved.is_none() {
                trace!(user = %user_id, "Relay: target not registered, dropping");
            }
            resolved
        }
        RoutingTarget::Connection(connection_id) => Some(connection_id.clone()),
    }
}
