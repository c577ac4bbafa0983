//! Signaling Controller Library
//!
//! This library provides the signaling tier of a Patchbay deployment -
//! the room and session layer between connected clients and the media
//! nodes:
//!
//! - Rooms with a stream directory, membership, and recording ledger
//! - Per-client sessions enforcing role-based permissions
//! - Publish/subscribe orchestration over the media-node RPC seam,
//!   including external inputs and data-only streams
//! - Selector-driven auto-subscription with batched media setup
//! - Data-channel relay and stream attribute fan-out
//! - Recording control addressed by recording id
//!
//! # Architecture
//!
//! State lives in plain shared structs: a [`room::Room`] holds the
//! directory behind a mutex that is never held across an await, and each
//! [`session::SignalingSession`] translates client requests into calls
//! on the `MediaNodeControl` seam, forwarding negotiation events back
//! through its [`channel::SignalingChannel`] on spawned forwarder tasks.
//!
//! # Modules
//!
//! - [`channel`] - Client notification types and transport seam
//! - [`config`] - Controller configuration from environment
//! - [`errors`] - Error types with appropriate error codes
//! - [`permissions`] - Actions, grants, and role defaults
//! - [`room`] - Shared room state and fan-out
//! - [`session`] - Per-client session operations
//! - [`stream`] - Stream directory entries and selector matching

pub mod channel;
pub mod config;
pub mod errors;
pub mod permissions;
pub mod room;
pub mod session;
pub mod stream;
