//! # Session and Account Record
//!
//! A [`Session`] is the live cryptographic state for one account, produced by a
//! successful handshake. An [`AccountRecord`] is the persisted superset that owns
//! it, alongside durable device and profile fields. There is exactly one shared
//! model; feature code never defines its own copy.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::key_exchange::KeyPair;
use serde::{Deserialize, Serialize};
use std::fmt;

/// SOCKS5 proxy used for both the short-link and the long-link
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// `host:port` of the proxy
    pub address: String,
    /// Optional `(username, password)`
    pub auth: Option<(String, String)>,
}

impl ProxyConfig {
    /// Proxy without authentication
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            auth: None,
        }
    }

    /// Proxy with username/password authentication
    pub fn with_auth(
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            auth: Some((username.into(), password.into())),
        }
    }

    /// `socks5://` URL understood by reqwest
    pub fn url(&self) -> String {
        match &self.auth {
            Some((user, pass)) => format!("socks5://{user}:{pass}@{}", self.address),
            None => format!("socks5://{}", self.address),
        }
    }
}

/// Live transport state for one account on one endpoint.
///
/// Only constructed by the handshake engine. Mutated by the request dispatcher
/// (sequence counter, cookie rotation) and persisted after each change.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub account_id: String,
    pub uin: u32,
    /// 16-byte AES-CBC key for legacy routes
    pub session_key: Vec<u8>,
    /// 32-byte AEAD key for requests
    pub client_session_key: Vec<u8>,
    /// 32-byte AEAD key for responses on AEAD routes
    pub server_session_key: Vec<u8>,
    /// Server-issued routing cookie, at most 15 bytes
    pub cookie: Vec<u8>,
    /// Host the handshake was negotiated with
    pub endpoint: String,
    /// Long-term hybrid private scalar
    pub hybrid_private_key: Vec<u8>,
    /// Long-term hybrid public key
    pub hybrid_public_key: Vec<u8>,
    pub hybrid_key_version: u8,
    pub device_id: Vec<u8>,
    pub client_version: u32,
    /// Last assigned request sequence id
    pub sequence: u32,
    /// Unix seconds at which the handshake completed
    pub established_at: u64,
}

impl Session {
    /// Assign the next request sequence id. Never yields 0.
    pub fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        if self.sequence == 0 {
            self.sequence = 1;
        }
        self.sequence
    }

    /// Hybrid key pair restored from the persisted scalar
    pub fn hybrid_key_pair(&self) -> Result<KeyPair> {
        if self.hybrid_private_key.is_empty() {
            return Err(ProtocolError::Crypto(constants::ERR_MISSING_HYBRID_KEY.into()));
        }
        KeyPair::from_private_bytes(&self.hybrid_private_key)
    }

    /// Replace the cookie if the server rotated it. Returns true on change.
    pub fn rotate_cookie(&mut self, cookie: &[u8]) -> bool {
        if cookie.is_empty() || cookie == self.cookie.as_slice() {
            return false;
        }
        self.cookie = cookie.to_vec();
        true
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("account_id", &self.account_id)
            .field("uin", &self.uin)
            .field("cookie", &hex::encode(&self.cookie))
            .field("endpoint", &self.endpoint)
            .field("client_version", &format_args!("{:#x}", self.client_version))
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Persisted account state. Keyed by `account_id` in the session store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Logical account identifier (wxid)
    pub account_id: String,
    pub uin: u32,
    pub device_id: Vec<u8>,
    pub device_type: String,
    pub device_name: String,
    /// Overrides the configured client version when non-zero
    #[serde(default)]
    pub client_version: u32,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Overrides the configured short-link host
    #[serde(default)]
    pub short_host: Option<String>,
    /// Overrides the configured long-link `host:port`
    #[serde(default)]
    pub long_host: Option<String>,
    #[serde(default)]
    pub rsa_public_key: Vec<u8>,
    #[serde(default)]
    pub rsa_private_key: Vec<u8>,
    #[serde(default)]
    pub ec_public_key: Vec<u8>,
    #[serde(default)]
    pub ec_private_key: Vec<u8>,
    /// Synchronization cursor
    #[serde(default)]
    pub sync_key: Vec<u8>,
    #[serde(default)]
    pub auth_key: Vec<u8>,
    /// Unix seconds of the last login
    #[serde(default)]
    pub login_date: u64,
    #[serde(default)]
    pub session: Option<Session>,
}

impl AccountRecord {
    /// Fresh record with device identity and no session
    pub fn new(account_id: impl Into<String>, device_id: Vec<u8>) -> Self {
        Self {
            account_id: account_id.into(),
            device_id,
            ..Self::default()
        }
    }

    /// The live session, if one has been negotiated
    pub fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| ProtocolError::NotFound(constants::ERR_NO_SESSION.into()))
    }

    /// Mutable access to the live session
    pub fn session_mut(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| ProtocolError::NotFound(constants::ERR_NO_SESSION.into()))
    }

    /// Drop the session so the next request renegotiates
    pub fn clear_session(&mut self) -> Option<Session> {
        self.session.take()
    }

    /// Replace the auth key, e.g. after a password change
    pub fn rotate_auth_key(&mut self, auth_key: Vec<u8>) {
        self.auth_key = auth_key;
    }

    /// Client version to advertise for this account
    pub fn effective_client_version(&self, configured: u32) -> u32 {
        if self.client_version != 0 {
            self.client_version
        } else {
            configured
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            account_id: "wxid_a".into(),
            uin: 1,
            session_key: vec![1; 16],
            client_session_key: vec![2; 32],
            server_session_key: vec![3; 32],
            cookie: vec![9; 15],
            endpoint: "short.example".into(),
            hybrid_private_key: Vec::new(),
            hybrid_public_key: Vec::new(),
            hybrid_key_version: 1,
            device_id: vec![0xAA; 16],
            client_version: 0x1800_3727,
            sequence: u32::MAX - 1,
            established_at: 0,
        }
    }

    #[test]
    fn sequence_skips_zero_on_wrap() {
        let mut s = session();
        assert_eq!(s.next_sequence(), u32::MAX);
        assert_eq!(s.next_sequence(), 1);
    }

    #[test]
    fn cookie_rotation_ignores_empty_and_equal() {
        let mut s = session();
        assert!(!s.rotate_cookie(&[]));
        assert!(!s.rotate_cookie(&[9; 15]));
        assert!(s.rotate_cookie(&[7; 4]));
        assert_eq!(s.cookie, vec![7; 4]);
    }

    #[test]
    fn debug_hides_keys() {
        let rendered = format!("{:?}", session());
        assert!(!rendered.contains("session_key"));
        assert!(rendered.contains("wxid_a"));
    }

    #[test]
    fn missing_hybrid_key_is_crypto_error() {
        assert!(matches!(
            session().hybrid_key_pair(),
            Err(ProtocolError::Crypto(_))
        ));
    }

    #[test]
    fn auth_key_rotation_keeps_the_session() {
        let mut record = AccountRecord::new("wxid_a", vec![1]);
        record.session = Some(session());
        record.auth_key = vec![1; 8];
        record.rotate_auth_key(vec![2; 8]);
        assert_eq!(record.auth_key, vec![2; 8]);
        assert!(record.session().is_ok());
    }

    #[test]
    fn record_overrides_client_version() {
        let mut record = AccountRecord::new("wxid_a", vec![1]);
        assert_eq!(record.effective_client_version(5), 5);
        record.client_version = 9;
        assert_eq!(record.effective_client_version(5), 9);
        assert!(record.session().is_err());
    }
}
