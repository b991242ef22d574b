//! # Utility Modules
//!
//! Supporting utilities used throughout the transport core.
//!
//! ## Components
//! - **Crypto**: AES-CBC, AES-GCM, HKDF and HMAC helpers
//! - **Compression**: zlib with an output size limit
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Async timeout wrappers
//! - **Metrics**: Thread-safe observability counters

pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;
