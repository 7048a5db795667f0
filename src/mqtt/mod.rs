//! # MQTT Integration Module
//!
//! Owns everything that touches the broker: endpoint and credential types, the outgoing
//! message type, the typestate session and the background network loop that keeps it alive.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Endpoint, credentials and client-side session options
//! ├── message.rs       - Outgoing message and delivery guarantee
//! ├── network_loop.rs  - Background task polling the rumqttc event loop
//! └── session.rs       - Connection state machine and acknowledged publishing
//! ```
//!
//! ## Design Notes
//!
//! - **Two activities**: the network loop runs on its own tokio task from `connect()` until
//!   shutdown, so keep-alives and acknowledgements are serviced while the publisher sleeps.
//! - **Observed, not called back**: connection progress is published on a watch channel
//!   instead of an `on_connect` callback.
//! - **No reconnect**: a refused handshake fails the session, a dropped connection ends it.
//!   Retry policy is left to the caller.

pub mod config;
pub mod message;
pub mod network_loop;
pub mod session;
