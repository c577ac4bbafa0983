//! Media Node Service Library
//!
//! This library provides the control plane of a Patchbay media node - the
//! per-node registry and negotiation orchestrator sitting between the
//! signaling tier and the media engine:
//!
//! - Publisher/subscriber registry with per-client connection pooling
//! - ICE/SDP negotiation orchestration with multi-stream multiplexing
//! - Batched auto-subscription setup emitting one combined offer
//! - External inputs (URL sources) and outputs (recorders) on the same
//!   registry records
//! - Periodic stats collection with quota-bounded subscriptions
//! - Uptime watchdog driving voluntary node retirement
//!
//! # Architecture
//!
//! The node uses an actor model: one controller actor owns the registries
//! and supervises one connection actor per transport connection. Engine
//! operations return lazy futures that are driven on dedicated tasks, so
//! neither actor mailbox ever waits on the engine. See [`actors`] for the
//! hierarchy.
//!
//! The engine itself sits behind the [`engine::MediaEngine`] trait; the
//! scriptable mock in [`engine::mock`] backs the test suites.
//!
//! # Modules
//!
//! - [`actors`] - Controller and connection actors
//! - [`client`] - Per-client connection pooling
//! - [`config`] - Node configuration from environment
//! - [`engine`] - Media engine trait seam and its mock
//! - [`errors`] - Error types with appropriate error codes
//! - [`lifecycle`] - Node-wide shutdown coordination
//! - [`metrics`] - Registry gauges and negotiation counters
//! - [`publisher`] - Publisher and subscriber records
//! - [`stats`] - Periodic stats subscription scheduler
//! - [`uptime`] - Uptime watchdog

pub mod actors;
pub mod client;
pub mod config;
pub mod engine;
pub mod errors;
pub mod lifecycle;
pub mod metrics;
pub mod publisher;
pub mod stats;
pub mod uptime;
