//! # Sync Module
//!
//! The real-time half of the client: one WebSocket connection whose frames are
//! parsed and fanned out to per-resource listeners.
//!
//! ## Core Components:
//!
//! - **`message`**: The inbound frame envelope and the mapping from message
//!   type to resource name.
//!
//! - **`registry`**: Resource-keyed listener table. Registrations are reference
//!   counted and released through RAII [`Subscription`] handles.
//!
//! - **`router`**: Parses frames and delivers the payload to a snapshot of the
//!   listeners for the mapped resource, isolating panicking listeners.
//!
//! - **`connection`**: The `ConnectionManager` state machine: connect,
//!   disconnect, fixed-delay reconnects with an attempt budget.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Inbound frame types and resource names.
pub mod message;
/// Reference-counted listener table keyed by resource.
pub mod registry;
/// Frame parsing and fan-out.
pub mod router;
/// WebSocket lifecycle and reconnect policy.
pub mod connection;

// --- Public API Re-exports ---
pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use message::{InboundMessage, MessageType};
pub use registry::{Listener, Registry, Subscription};
pub use router::{MessageRouter, RouteOutcome};
