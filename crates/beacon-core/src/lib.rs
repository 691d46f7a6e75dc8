//! # beacon-core
//!
//! Presence tracking and signal routing for the Beacon relay.
//!
//! This crate provides the relay engine:
//!
//! - **Registry** - who is online: user identity to live connection
//! - **Presence** - opaque per-user status values
//! - **Relay** - stateless routing of negotiation messages
//! - **Dispatcher** - the per-connection event switch and composition root
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  Connection │────▶│  Dispatcher  │────▶│  Registry   │
//! └─────────────┘     └──────────────┘     └─────────────┘
//!                        │         │
//!                        ▼         ▼
//!                 ┌──────────┐ ┌──────────┐
//!                 │  Relay   │ │ Presence │
//!                 └──────────┘ └──────────┘
//! ```
//!
//! All shared mutable state lives inside the [`Dispatcher`]; per-connection
//! transport handlers only ever call into it.

pub mod dispatcher;
pub mod presence;
pub mod registry;
pub mod relay;

pub use dispatcher::{Dispatcher, DispatcherStats};
pub use presence::PresenceStore;
pub use registry::ConnectionRegistry;
pub use relay::RoutingTarget;
