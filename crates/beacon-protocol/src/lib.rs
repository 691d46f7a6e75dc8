//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon signaling relay.
//!
//! This crate defines the events exchanged between clients and the relay,
//! the framing codec, and protocol versioning.
//!
//! ## Events
//!
//! - `ClientEvent` - inbound: `setup`, `set-status`, call negotiation, `ping`
//! - `ServerEvent` - outbound: roster/status broadcasts, forwarded
//!   negotiation messages, `connected`/`pong`
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::setup("alice");
//!
//! // Encode and decode
//! let encoded = codec::encode(&event).unwrap();
//! let decoded: ClientEvent = codec::decode(&encoded).unwrap();
//! ```

pub mod codec;
pub mod events;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use events::{ClientEvent, ServerEvent, StatusEntry};
pub use version::{Version, PROTOCOL_VERSION};
