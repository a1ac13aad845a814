//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU coordinator.
//!
//! ## Modules
//!
//! - `mock_engine` - Scriptable media engine (failures, gated calls, events)
//! - `fixtures` - In-memory signaling client and message payload builders
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let engine = MockEngine::accepting();
//!     let coordinator = Coordinator::new(engine.clone(), SessionLimits::default());
//!
//!     let mut alice = TestClient::connect(&coordinator);
//!     let (client_id, producers) = alice.join("room-1", "alice").await;
//!     assert!(producers.is_empty());
//!
//!     let send = alice.create_transport(TransportDirection::Send).await;
//!     alice.produce(send, MediaKind::Audio).await;
//! }
//! ```
//!
//! ## Interleaving Tests
//!
//! ```rust,ignore
//! let engine = MockEngine::builder().gate(EngineCall::Produce).build();
//! let gate = engine.gate(EngineCall::Produce).unwrap();
//!
//! alice.send(&produce).await;
//! gate.entered().await;   // produce is now suspended in the engine
//! alice_handle.disconnect().await;
//! gate.release();
//! ```

pub mod fixtures;
pub mod mock_engine;

pub use fixtures::*;
pub use mock_engine::*;
