//! Event types for the Beacon protocol.
//!
//! Events are the unit of communication between clients and the relay.
//! Each event is a tagged MessagePack document; field names are camelCase
//! because that is what the browser clients put on the wire, and identities
//! and status values must round-trip byte-for-byte.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identity of a logical user, supplied by the authentication layer.
pub type UserId = String;

/// Relay-assigned identifier for one live connection, stable only for that
/// connection's lifetime.
pub type ConnectionId = String;

/// A user's stored status, as carried in `all-status` snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    /// User the status belongs to.
    pub user_id: UserId,
    /// Opaque, client-chosen status value.
    pub status: String,
}

/// An inbound event from a client.
///
/// The relay validates required fields at the decode boundary; a document
/// that does not match any variant is a malformed payload and is dropped
/// without affecting the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Bind this connection to a user identity.
    #[serde(rename = "setup", rename_all = "camelCase")]
    Setup {
        /// Identity to register for this connection.
        user_id: UserId,
    },

    /// Set or clear a user's status. An absent or empty status clears it.
    #[serde(rename = "set-status", rename_all = "camelCase")]
    SetStatus {
        /// User the status applies to.
        user_id: UserId,
        /// New status value; absent/empty clears the stored entry.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },

    /// Open a call: forward an offer to a user.
    #[serde(rename = "call-user")]
    CallUser {
        /// Callee user id.
        to: UserId,
        /// Opaque session description; the relay never inspects it.
        offer: Value,
    },

    /// Answer a call: forward an answer straight to a connection.
    ///
    /// Addressed by connection id because the answerer learned the caller's
    /// connection id from the forwarded `incoming-call`.
    #[serde(rename = "answer-call", rename_all = "camelCase")]
    AnswerCall {
        /// Caller's connection id.
        to_socket_id: ConnectionId,
        /// Opaque session description.
        answer: Value,
    },

    /// Forward a connectivity candidate straight to a connection.
    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        /// Peer's connection id.
        to_socket_id: ConnectionId,
        /// Opaque candidate payload.
        candidate: Value,
    },

    /// Hang up: notify a user that the call ended.
    #[serde(rename = "end-call", rename_all = "camelCase")]
    EndCall {
        /// Peer user id.
        to_user_id: UserId,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp, echoed back in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

/// An outbound event from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Connection established: the relay's handshake.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        /// Relay-assigned connection identifier.
        connection_id: ConnectionId,
        /// Protocol major version.
        version: u8,
        /// Recommended keepalive interval in milliseconds.
        heartbeat: u32,
    },

    /// Full roster of currently registered users, broadcast on every
    /// setup and disconnect.
    #[serde(rename = "online-users")]
    OnlineUsers {
        /// Registered user ids; order is not meaningful.
        users: Vec<UserId>,
    },

    /// Full status snapshot, sent to a client completing setup.
    #[serde(rename = "all-status")]
    AllStatus {
        /// Every stored (user, status) pair.
        statuses: Vec<StatusEntry>,
    },

    /// A single user's status changed, broadcast to everyone.
    #[serde(rename = "status-updated", rename_all = "camelCase")]
    StatusUpdated {
        /// User the update applies to.
        user_id: UserId,
        /// The value as received; absent/empty means the status was cleared.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },

    /// A forwarded call offer.
    #[serde(rename = "incoming-call", rename_all = "camelCase")]
    IncomingCall {
        /// Caller's user id; absent when the caller never completed setup.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<UserId>,
        /// Caller's connection id, used to address the answer.
        from_socket_id: ConnectionId,
        /// The offer, forwarded unmodified.
        offer: Value,
    },

    /// A forwarded call answer.
    #[serde(rename = "call-accepted")]
    CallAccepted {
        /// The answer, forwarded unmodified.
        answer: Value,
    },

    /// A forwarded connectivity candidate. The inbound routing envelope is
    /// stripped; only the candidate value is delivered.
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        /// The candidate, forwarded unmodified.
        candidate: Value,
    },

    /// The peer hung up.
    #[serde(rename = "call-ended")]
    CallEnded,

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientEvent {
    /// Create a new `setup` event.
    #[must_use]
    pub fn setup(user_id: impl Into<UserId>) -> Self {
        ClientEvent::Setup {
            user_id: user_id.into(),
        }
    }

    /// Create a new `set-status` event. Pass `None` to clear.
    #[must_use]
    pub fn set_status(user_id: impl Into<UserId>, status: Option<String>) -> Self {
        ClientEvent::SetStatus {
            user_id: user_id.into(),
            status,
        }
    }

    /// Create a new `call-user` event.
    #[must_use]
    pub fn call_user(to: impl Into<UserId>, offer: Value) -> Self {
        ClientEvent::CallUser {
            to: to.into(),
            offer,
        }
    }

    /// Create a new `answer-call` event.
    #[must_use]
    pub fn answer_call(to_socket_id: impl Into<ConnectionId>, answer: Value) -> Self {
        ClientEvent::AnswerCall {
            to_socket_id: to_socket_id.into(),
            answer,
        }
    }

    /// Create a new `ice-candidate` event.
    #[must_use]
    pub fn ice_candidate(to_socket_id: impl Into<ConnectionId>, candidate: Value) -> Self {
        ClientEvent::IceCandidate {
            to_socket_id: to_socket_id.into(),
            candidate,
        }
    }

    /// Create a new `end-call` event.
    #[must_use]
    pub fn end_call(to_user_id: impl Into<UserId>) -> Self {
        ClientEvent::EndCall {
            to_user_id: to_user_id.into(),
        }
    }

    /// Create a new `ping` event.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        ClientEvent::Ping { timestamp }
    }
}

impl ServerEvent {
    /// Create a new `connected` handshake event.
    #[must_use]
    pub fn connected(connection_id: impl Into<ConnectionId>, version: u8, heartbeat: u32) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new `online-users` roster event.
    #[must_use]
    pub fn online_users(users: Vec<UserId>) -> Self {
        ServerEvent::OnlineUsers { users }
    }

    /// Create a new `all-status` snapshot event.
    #[must_use]
    pub fn all_status(statuses: Vec<StatusEntry>) -> Self {
        ServerEvent::AllStatus { statuses }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_tags() {
        let value = serde_json::to_value(ClientEvent::setup("alice")).unwrap();
        assert_eq!(value["type"], "setup");
        assert_eq!(value["userId"], "alice");

        let value = serde_json::to_value(ClientEvent::call_user("bob", json!({"sdp": "x"}))).unwrap();
        assert_eq!(value["type"], "call-user");
        assert_eq!(value["to"], "bob");
        assert_eq!(value["offer"]["sdp"], "x");
    }

    #[test]
    fn test_camel_case_fields() {
        let value = serde_json::to_value(ClientEvent::answer_call("conn_1", json!("a"))).unwrap();
        assert_eq!(value["toSocketId"], "conn_1");

        let value = serde_json::to_value(ServerEvent::IncomingCall {
            from_user_id: Some("alice".into()),
            from_socket_id: "conn_1".into(),
            offer: json!("o"),
        })
        .unwrap();
        assert_eq!(value["fromUserId"], "alice");
        assert_eq!(value["fromSocketId"], "conn_1");
    }

    #[test]
    fn test_optional_status_absent() {
        let value = serde_json::to_value(ClientEvent::set_status("alice", None)).unwrap();
        assert!(value.get("status").is_none());

        // A document without the field decodes to None
        let event: ClientEvent =
            serde_json::from_value(json!({"type": "set-status", "userId": "alice"})).unwrap();
        assert_eq!(event, ClientEvent::set_status("alice", None));
    }

    #[test]
    fn test_call_ended_has_no_payload() {
        let value = serde_json::to_value(ServerEvent::CallEnded).unwrap();
        assert_eq!(value, json!({"type": "call-ended"}));
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let result: Result<ClientEvent, _> =
            serde_json::from_value(json!({"type": "call-user", "to": "bob"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_opaque_payload_round_trips() {
        let candidate = json!({
            "candidate": "candidate:0 1 UDP 2122252543 192.0.2.1 54321 typ host",
            "sdpMLineIndex": 0,
        });
        let event = ClientEvent::ice_candidate("conn_9", candidate.clone());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["candidate"], candidate);
    }
}
