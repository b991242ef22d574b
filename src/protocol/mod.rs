//! # Protocol Layer
//!
//! Session negotiation and the server's status vocabulary.
//!
//! ## Components
//! - **Key exchange**: P-256 key pairs and ECDH shared secrets
//! - **Handshake**: the dual-ECDH handshake state machine and its HTTP driver
//! - **Status**: short error frames and return-code classification
//! - **Dispatcher**: routing of server-pushed long-link events
//!
//! ## Handshake Flow
//! ```text
//! Idle -> KeysGenerated -> RequestSent -> TrustReceived -> SessionEstablished
//!   (any step may move to Failed; a failed attempt is discarded)
//! ```

pub mod dispatcher;
pub mod handshake;
pub mod key_exchange;
pub mod status;
