//! # Error Types
//!
//! Error handling for the mmtls client transport.
//!
//! This module defines every error variant that can surface from the transport
//! core, from low-level I/O failures up to the server's own status vocabulary.
//!
//! ## Error Categories
//! - **Cryptographic**: malformed key material, failed shared-secret derivation
//! - **Handshake**: rejected or unparsable handshake responses
//! - **Framing**: checksum or length mismatches on decode
//! - **Remote status**: status codes embedded in short error frames, with the
//!   session-timeout and logged-out codes translated to dedicated variants
//! - **Store**: missing account records
//!
//! Decode is all-or-nothing: none of these variants ever carries a partially
//! decoded payload.
//!
//! ## Example Usage
//! ```rust
//! use mmtls_client::error::{ProtocolError, Result};
//!
//! fn classify(result: Result<Vec<u8>>) -> &'static str {
//!     match result {
//!         Ok(_) => "ok",
//!         Err(ProtocolError::SessionExpired { .. }) => "re-handshake and resend",
//!         Err(e) if e.is_transport_fault() => "network",
//!         Err(_) => "fatal",
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on event dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on event dispatcher";

    /// Framing errors
    pub const ERR_BAD_SIGNATURE: &str = "Frame signature mismatch";
    pub const ERR_CHECKSUM_MISMATCH: &str = "Frame checksum mismatch";
    pub const ERR_TRUNCATED_HEADER: &str = "Frame too short for header";
    pub const ERR_HEADER_LENGTH: &str = "Declared header length does not match layout";
    pub const ERR_BODY_LENGTH: &str = "Declared body length does not match buffer";
    pub const ERR_UNCOMPRESSED_LENGTH: &str = "Decompressed length does not match header";
    pub const ERR_ROUTE_VARIANT: &str = "Encode type does not match route decode variant";
    pub const ERR_EMPTY_ERROR_FRAME: &str = "Short frame carries no status";
    pub const ERR_COOKIE_TOO_LONG: &str = "Cookie exceeds 15 bytes";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_NOT_CONNECTED: &str = "No long-link connection for account";
    pub const ERR_BAD_RECORD: &str = "Malformed long-link record";
    pub const ERR_TIMEOUT: &str = "Operation timed out";

    /// Cryptographic errors
    pub const ERR_INVALID_PUBLIC_KEY: &str = "Public key is malformed or not on curve";
    pub const ERR_INVALID_PRIVATE_KEY: &str = "Private key is malformed";
    pub const ERR_KEY_LENGTH: &str = "Symmetric key has wrong length";
    pub const ERR_KDF_FAILED: &str = "Key derivation failed";
    pub const ERR_MISSING_HYBRID_KEY: &str = "Session has no hybrid key pair";

    /// Handshake errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
    pub const ERR_EMPTY_RESPONSE: &str = "Handshake response is empty";
    pub const ERR_MALFORMED_RESPONSE: &str = "Handshake response could not be parsed";
    pub const ERR_TRUST_MISMATCH: &str = "Server trust MAC does not verify";
    pub const ERR_UNEXPECTED_STATE: &str = "Handshake step called in wrong state";
    pub const ERR_KEYS_NOT_GENERATED: &str = "Handshake key pairs not generated";
    pub const ERR_RESPONSE_NOT_RECEIVED: &str = "Handshake response not received";
    pub const ERR_COOKIE_OVERSIZED: &str = "Server cookie exceeds 15 bytes";

    /// Store errors
    pub const ERR_STORE_LOCK: &str = "Session store lock poisoned";
    pub const ERR_NO_SESSION: &str = "Account record has no session";
}

/// ProtocolError is the primary error type for all transport operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Frame corrupt: {0}")]
    FrameCorrupt(String),

    #[error("Remote status {code}: {message}")]
    RemoteStatus { code: i32, message: String },

    #[error("Session expired (remote status {code})")]
    SessionExpired { code: i32 },

    #[error("Account logged out (remote status {code})")]
    AccountLoggedOut { code: i32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown encode type: {0}")]
    UnknownEncodeType(u8),

    #[error("Unknown compress type: {0}")]
    UnknownCompressType(u8),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// True when the server reported the session as timed out.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ProtocolError::SessionExpired { .. })
    }

    /// True for the single condition callers are expected to recover from by
    /// renegotiating and resubmitting.
    pub fn is_retryable_with_new_session(&self) -> bool {
        self.is_session_expired()
    }

    /// Network-level failures as opposed to protocol or remote-status failures.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::Http(_)
                | ProtocolError::TransportError(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::Timeout
                | ProtocolError::FrameCorrupt(_)
        )
    }

    /// The numeric server status carried by this error, if any.
    pub fn remote_code(&self) -> Option<i32> {
        match self {
            ProtocolError::RemoteStatus { code, .. }
            | ProtocolError::SessionExpired { code }
            | ProtocolError::AccountLoggedOut { code } => Some(*code),
            _ => None,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_codes_are_exposed() {
        assert_eq!(ProtocolError::SessionExpired { code: -13 }.remote_code(), Some(-13));
        assert_eq!(
            ProtocolError::RemoteStatus {
                code: -1,
                message: "MM_ERR_SYS".into()
            }
            .remote_code(),
            Some(-1)
        );
        assert_eq!(ProtocolError::Timeout.remote_code(), None);
    }

    #[test]
    fn only_session_expiry_is_recoverable() {
        assert!(ProtocolError::SessionExpired { code: -13 }.is_retryable_with_new_session());
        assert!(!ProtocolError::AccountLoggedOut { code: -100 }.is_retryable_with_new_session());
        assert!(!ProtocolError::Timeout.is_retryable_with_new_session());
    }
}
