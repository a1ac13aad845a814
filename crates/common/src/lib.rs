//! Common types shared across the SFU signaling components.

#![warn(clippy::pedantic)]

/// Module for identifier types
pub mod types;

pub use types::{ClientId, ConsumerId, ProducerId, SessionId, TransportId};
