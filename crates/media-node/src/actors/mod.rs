//! Actor model implementation for the media node.
//!
//! ```text
//! MediaNodeControllerActor (singleton per node)
//! ├── owns the publisher and client registries
//! ├── supervises N ConnectionActors
//! │   └── ConnectionActor (one per transport connection)
//! │       ├── owns the negotiation state machine
//! │       └── serializes engine access for its streams
//! ├── drives the stats scheduler
//! └── feeds the uptime watchdog
//! ```
//!
//! # Key Design Decisions
//!
//! - **Registry mutations are synchronous**: controller handlers mutate
//!   the registries before any await point, so two operations on the same
//!   stream can never observe a half-applied state.
//! - **Engine work is driven off-actor**: lazy engine futures are spawned
//!   onto dedicated tasks and report back through `completed` channels,
//!   keeping actor mailboxes responsive.
//! - **CancellationToken propagation**: the node lifecycle token fans out
//!   through the controller to every connection actor for shutdown.
//!
//! # Modules
//!
//! - [`controller`] - `MediaNodeControllerActor` and its control handle
//! - [`connection`] - `ConnectionActor` per transport connection
//! - [`messages`] - Message types for actor communication

pub mod connection;
pub mod controller;
pub mod messages;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionHandle, ConnectionSettings};
pub use controller::{MediaNodeControllerActor, MediaNodeControllerHandle};
pub use messages::*;
