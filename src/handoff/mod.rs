//! Code-based session handoff between devices.
//!
//! One state machine serves both device pairing (the waiting device gets a
//! session for whoever confirms) and delegated propagation (the confirming
//! device gets a copy of the source session). [`HandoffStrategy`] selects
//! between them.

pub mod store;
pub mod strategy;

pub use store::{
    HandoffCredentials, HandoffGrant, HandoffRequest, HandoffSession, HandoffStatus,
    HandoffStatusView, HandoffStore, HandoffTicket,
};
pub use strategy::{Confirmer, HandoffStrategy};
