//! Shared control-plane vocabulary for Patchbay.
//!
//! This crate defines the types exchanged between the signaling tier and
//! the media-node tier: negotiation messages and events, publish/subscribe
//! options, stats reports, and the [`MediaNodeControl`] trait that forms
//! the RPC seam between the two tiers. Transport bindings (in-process,
//! message queue, gRPC) implement the trait; the signaling tier only ever
//! talks to `dyn MediaNodeControl`.

#![warn(clippy::pedantic)]

pub mod control;
pub mod messages;
pub mod options;

pub use control::{mock, ControlError, MediaNodeControl, StatsSink, StreamAddress};
pub use messages::{
    BatchContext, ErrorReason, IceCandidate, NegotiationEvent, NegotiationMessage, SdpKind,
    StreamStatsReport, UnreachableScope,
};
pub use options::{
    ExternalOutputOptions, OfferConstraints, PublishOptions, StreamCapabilities, SubscribeOptions,
};
