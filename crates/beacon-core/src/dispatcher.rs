//! Event dispatcher for the Beacon relay.
//!
//! The dispatcher is the composition root: it owns the connection registry,
//! the presence store, and the table of live connections, and it is the only
//! place shared state is touched. Transport handlers attach a connection,
//! feed decoded inbound events through [`Dispatcher::handle`], drain the
//! returned outbound queue, and detach on disconnect.
//!
//! Every routing failure degrades to a silent drop; no inbound event ever
//! produces an error response to its sender.

use crate::presence::PresenceStore;
use crate::registry::ConnectionRegistry;
use crate::relay::{self, RoutingTarget};
use beacon_protocol::events::{ClientEvent, ConnectionId, ServerEvent, UserId};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A live connection's dispatcher-side state.
struct ConnectionEntry {
    /// Outbound event queue, drained by the transport handler.
    sender: mpsc::UnboundedSender<ServerEvent>,
    /// Identity bound by `setup`; `None` until setup completes.
    user_id: Option<UserId>,
}

/// The central event dispatcher.
///
/// All operations are fire-and-forget: sends never block and never wait for
/// acknowledgment, and a send into a queue whose connection is gone is
/// ignored.
#[derive(Default)]
pub struct Dispatcher {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    registry: ConnectionRegistry,
    presence: PresenceStore,
}

impl Dispatcher {
    /// Create a new dispatcher with no connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher statistics.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            connections: self.connections.len(),
            online_users: self.registry.len(),
            stored_statuses: self.presence.len(),
        }
    }

    /// Attach a new connection.
    ///
    /// Returns the connection's outbound event queue. The connection is not
    /// part of the online roster until it completes `setup`.
    pub fn attach(&self, connection_id: impl Into<ConnectionId>) -> mpsc::UnboundedReceiver<ServerEvent> {
        let connection_id = connection_id.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        debug!(connection = %connection_id, "Dispatcher: connection attached");
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                sender,
                user_id: None,
            },
        );
        receiver
    }

    /// Detach a disconnecting connection.
    ///
    /// If the connection had completed setup, its registry mapping is
    /// removed (keyed by connection id, so a superseded connection never
    /// evicts its successor) and the updated roster is broadcast to the
    /// remaining connections. Stored statuses are untouched: status
    /// persists across reconnection.
    ///
    /// Disconnect never synthesizes `call-ended`; a peer mid-negotiation
    /// simply stops hearing from the other side.
    pub fn detach(&self, connection_id: &str) {
        let had_setup = self
            .connections
            .remove(connection_id)
            .map(|(_, entry)| entry.user_id.is_some())
            .unwrap_or(false);

        debug!(connection = %connection_id, "Dispatcher: connection detached");

        if had_setup {
            self.registry.unregister(connection_id);
            self.broadcast(ServerEvent::OnlineUsers {
                users: self.registry.user_ids(),
            });
        }
    }

    /// Dispatch one inbound event from a connection.
    pub fn handle(&self, connection_id: &str, event: ClientEvent) {
        match event {
            ClientEvent::Setup { user_id } => {
                // Bind the identity to this connection before touching the
                // registry so a concurrent disconnect sees it.
                if let Some(mut entry) = self.connections.get_mut(connection_id) {
                    entry.user_id = Some(user_id.clone());
                }
                self.registry.register(user_id, connection_id);

                self.broadcast(ServerEvent::OnlineUsers {
                    users: self.registry.user_ids(),
                });
                self.emit_to(
                    connection_id,
                    ServerEvent::AllStatus {
                        statuses: self.presence.snapshot(),
                    },
                );
            }

            ClientEvent::SetStatus { user_id, status } => {
                self.presence.set_status(user_id.clone(), status.as_deref());
                // The update is broadcast as received, clearing value
                // included, and never de-duplicated.
                self.broadcast(ServerEvent::StatusUpdated { user_id, status });
            }

            ClientEvent::CallUser { to, offer } => {
                let from_user_id = self
                    .connections
                    .get(connection_id)
                    .and_then(|entry| entry.user_id.clone());

                if let Some(target) = relay::resolve(&self.registry, &RoutingTarget::User(to)) {
                    self.emit_to(
                        &target,
                        ServerEvent::IncomingCall {
                            from_user_id,
                            from_socket_id: connection_id.to_string(),
                            offer,
                        },
                    );
                }
            }

            ClientEvent::AnswerCall {
                to_socket_id,
                answer,
            } => {
                if let Some(target) =
                    relay::resolve(&self.registry, &RoutingTarget::Connection(to_socket_id))
                {
                    self.emit_to(&target, ServerEvent::CallAccepted { answer });
                }
            }

            ClientEvent::IceCandidate {
                to_socket_id,
                candidate,
            } => {
                if let Some(target) =
                    relay::resolve(&self.registry, &RoutingTarget::Connection(to_socket_id))
                {
                    self.emit_to(&target, ServerEvent::IceCandidate { candidate });
                }
            }

            ClientEvent::EndCall { to_user_id } => {
                if let Some(target) =
                    relay::resolve(&self.registry, &RoutingTarget::User(to_user_id))
                {
                    self.emit_to(&target, ServerEvent::CallEnded);
                }
            }

            ClientEvent::Ping { timestamp } => {
                self.emit_to(connection_id, ServerEvent::Pong { timestamp });
            }
        }
    }

    /// Queue an event for one connection.
    ///
    /// Returns `true` if the connection was live. A missing or closed
    /// connection is a silent drop - expected under churn.
    pub fn emit_to(&self, connection_id: &str, event: ServerEvent) -> bool {
        match self.connections.get(connection_id) {
            Some(entry) => entry.sender.send(event).is_ok(),
            None => {
                trace!(connection = %connection_id, "Dispatcher: emit to dead connection dropped");
                false
            }
        }
    }

    /// Queue an event for every live connection.
    ///
    /// Iterates a snapshot of the connection table; a recipient
    /// disconnecting mid-broadcast does not affect delivery to the rest.
    /// Returns the number of connections that received the event.
    pub fn broadcast(&self, event: ServerEvent) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            if entry.value().sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        trace!(recipients = delivered, "Dispatcher: broadcast");
        delivered
    }
}

/// Dispatcher statistics.
#[derive(Debug, Clone)]
pub struct DispatcherStats {
    /// Number of attached connections.
    pub connections: usize,
    /// Number of registered (online) users.
    pub online_users: usize,
    /// Number of stored status entries.
    pub stored_statuses: usize,
}
