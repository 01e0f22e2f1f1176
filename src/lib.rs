//! Proxy-authenticated backend session broker.
//!
//! Each logged-in actor gets its own backend session opened by a service
//! principal on the actor's behalf. The crate keeps those sessions in a
//! registry keyed by (identity, platform, session id), probes them before
//! use, tears each one down exactly once, and lets a session be handed to
//! another device with a short-lived code.
//!
//! The core ([`session`], [`handoff`]) is synchronous. [`gateway`] puts an
//! axum HTTP surface in front of it.

pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handoff;
pub mod notify;
pub mod service;
pub mod session;
pub mod token;

pub use config::Config;
pub use error::{Result, SessionError};
pub use service::SessionService;
