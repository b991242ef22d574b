//! Handshake engine.
//!
//! The client draws two ephemeral P-256 pairs (V1, V2), posts both public keys
//! with its device metadata, and receives the server's two public keys, a nonce,
//! a cookie and a trust blob authenticated by a MAC. The key schedule combines
//! both shared secrets:
//!
//! ```text
//! s1 = SHA256(ECDH(v1)), s2 = SHA256(ECDH(v2))
//! okm = HKDF-SHA256(salt = server_nonce, ikm = s1 || s2, "handshake key expansion")
//!     = session_key(16) || client_session_key(32) || server_session_key(32) || finished_key(32)
//! trust_mac = HMAC-SHA256(finished_key, "server finished" || SHA256(transcript))
//! ```
//!
//! [`ClientHandshake`] is a sans-IO state machine, one method per transition.
//! [`HandshakeEngine`] drives it over an [`HttpTransport`]. [`ServerHandshake`]
//! is the peer half used by mock servers.

use crate::config::ClientConfig;
use crate::core::packet::MAX_COOKIE_LEN;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::key_exchange::{HandshakeKeyPairs, KeyPair};
use crate::service::http::HttpTransport;
use crate::session::{AccountRecord, Session};
use crate::utils::crypto::{self, sha256};
use crate::utils::metrics::{global_metrics, Timer};
use crate::utils::timeout::with_timeout_error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const KEY_EXPANSION_INFO: &[u8] = b"handshake key expansion";
const TRUST_LABEL: &[u8] = b"server finished";
const OKM_LEN: usize = 16 + 32 + 32 + 32;

/// Client hello posted to the handshake endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub client_version: u32,
    pub device_type: u8,
    pub device_id: Vec<u8>,
    pub account_id: String,
    pub uin: u32,
    pub timestamp: u64,
    pub v1_public: Vec<u8>,
    pub v2_public: Vec<u8>,
    pub hybrid_public: Vec<u8>,
}

/// Server trust response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub status: i32,
    pub server_nonce: [u8; 32],
    pub v1_server_public: Vec<u8>,
    pub v2_server_public: Vec<u8>,
    pub cookie: Vec<u8>,
    pub uin: u32,
    pub trust_blob: Vec<u8>,
    pub trust_mac: Vec<u8>,
}

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    KeysGenerated,
    RequestSent,
    TrustReceived,
    SessionEstablished,
    Failed,
}

/// Symmetric material derived by the key schedule
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub session_key: [u8; 16],
    pub client_session_key: [u8; 32],
    pub server_session_key: [u8; 32],
    finished_key: [u8; 32],
}

impl SessionKeys {
    fn derive(s1: &[u8; 32], s2: &[u8; 32], server_nonce: &[u8; 32]) -> Result<Self> {
        let mut ikm = Zeroizing::new([0u8; 64]);
        ikm[..32].copy_from_slice(s1);
        ikm[32..].copy_from_slice(s2);

        let mut okm = Zeroizing::new([0u8; OKM_LEN]);
        crypto::hkdf_expand(server_nonce, ikm.as_slice(), KEY_EXPANSION_INFO, okm.as_mut_slice())?;

        let mut keys = SessionKeys {
            session_key: [0u8; 16],
            client_session_key: [0u8; 32],
            server_session_key: [0u8; 32],
            finished_key: [0u8; 32],
        };
        keys.session_key.copy_from_slice(&okm[..16]);
        keys.client_session_key.copy_from_slice(&okm[16..48]);
        keys.server_session_key.copy_from_slice(&okm[48..80]);
        keys.finished_key.copy_from_slice(&okm[80..]);
        Ok(keys)
    }

    fn trust_mac(&self, transcript: &[u8; 32]) -> Result<[u8; 32]> {
        crypto::hmac_sha256(&self.finished_key, &[TRUST_LABEL, transcript])
    }

    fn verify_trust(&self, transcript: &[u8; 32], mac: &[u8]) -> Result<bool> {
        crypto::hmac_verify(&self.finished_key, &[TRUST_LABEL, transcript], mac)
    }
}

fn transcript_hash(request: &HandshakeRequest, response: &HandshakeResponse) -> [u8; 32] {
    sha256(&[
        &request.v1_public,
        &request.v2_public,
        &request.hybrid_public,
        &response.v1_server_public,
        &response.v2_server_public,
        &response.server_nonce,
        &response.cookie,
        &response.uin.to_be_bytes(),
        &response.trust_blob,
    ])
}

/// Get the current timestamp in seconds
fn current_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

fn handshake_error(msg: &str) -> ProtocolError {
    ProtocolError::HandshakeError(msg.into())
}

/// Client-side handshake state machine for one attempt
pub struct ClientHandshake {
    state: HandshakeState,
    keys: Option<HandshakeKeyPairs>,
    hybrid: Option<KeyPair>,
    request: Option<HandshakeRequest>,
    response: Option<HandshakeResponse>,
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHandshake {
    /// Create a handshake in the `Idle` state
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
            keys: None,
            hybrid: None,
            request: None,
            response: None,
        }
    }

    /// Start from caller-supplied key pairs, already in `KeysGenerated`
    pub fn with_key_pairs(keys: HandshakeKeyPairs) -> Self {
        Self {
            state: HandshakeState::KeysGenerated,
            keys: Some(keys),
            ..Self::new()
        }
    }

    /// Reuse an existing long-term hybrid key pair instead of drawing one
    pub fn with_hybrid_key(mut self, hybrid: KeyPair) -> Self {
        self.hybrid = Some(hybrid);
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn expect(&mut self, expected: HandshakeState) -> Result<()> {
        if self.state != expected {
            warn!(state = ?self.state, ?expected, "Handshake step out of order");
            self.state = HandshakeState::Failed;
            return Err(handshake_error(constants::ERR_UNEXPECTED_STATE));
        }
        Ok(())
    }

    fn advance<T>(&mut self, next: HandshakeState, result: Result<T>) -> Result<T> {
        self.state = if result.is_ok() {
            next
        } else {
            HandshakeState::Failed
        };
        result
    }

    /// `Idle -> KeysGenerated`
    pub fn generate_keys(&mut self) -> Result<()> {
        self.expect(HandshakeState::Idle)?;
        self.keys = Some(HandshakeKeyPairs::generate());
        self.state = HandshakeState::KeysGenerated;
        Ok(())
    }

    /// `KeysGenerated -> RequestSent`: serialize the client hello
    pub fn build_request(
        &mut self,
        account: &AccountRecord,
        client_version: u32,
        device_type: u8,
    ) -> Result<Vec<u8>> {
        self.expect(HandshakeState::KeysGenerated)?;
        let result = self.build_request_inner(account, client_version, device_type);
        self.advance(HandshakeState::RequestSent, result)
    }

    fn build_request_inner(
        &mut self,
        account: &AccountRecord,
        client_version: u32,
        device_type: u8,
    ) -> Result<Vec<u8>> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| handshake_error(constants::ERR_KEYS_NOT_GENERATED))?;
        let hybrid = self.hybrid.get_or_insert_with(KeyPair::generate);

        let request = HandshakeRequest {
            client_version,
            device_type,
            device_id: account.device_id.clone(),
            account_id: account.account_id.clone(),
            uin: account.uin,
            timestamp: current_timestamp()?,
            v1_public: keys.v1.public_key().to_vec(),
            v2_public: keys.v2.public_key().to_vec(),
            hybrid_public: hybrid.public_key().to_vec(),
        };
        let body = bincode::serialize(&request)?;
        self.request = Some(request);
        Ok(body)
    }

    /// `RequestSent -> TrustReceived`: parse and sanity-check the server response
    pub fn receive_response(&mut self, body: &[u8]) -> Result<()> {
        self.expect(HandshakeState::RequestSent)?;
        let result = Self::parse_response(body).map(|response| {
            self.response = Some(response);
        });
        self.advance(HandshakeState::TrustReceived, result)
    }

    fn parse_response(body: &[u8]) -> Result<HandshakeResponse> {
        if body.is_empty() {
            return Err(handshake_error(constants::ERR_EMPTY_RESPONSE));
        }
        let response: HandshakeResponse = bincode::deserialize(body)
            .map_err(|_| handshake_error(constants::ERR_MALFORMED_RESPONSE))?;
        if response.status != 0 {
            return Err(ProtocolError::HandshakeError(format!(
                "server rejected handshake with status {}",
                response.status
            )));
        }
        if response.cookie.len() > MAX_COOKIE_LEN {
            return Err(handshake_error(constants::ERR_COOKIE_OVERSIZED));
        }
        Ok(response)
    }

    /// `TrustReceived -> SessionEstablished`: run the key schedule, verify the
    /// trust MAC and build the session
    pub fn establish(&mut self, account: &AccountRecord, endpoint: &str) -> Result<Session> {
        self.expect(HandshakeState::TrustReceived)?;
        let result = self.establish_inner(account, endpoint);
        self.advance(HandshakeState::SessionEstablished, result)
    }

    fn establish_inner(&mut self, account: &AccountRecord, endpoint: &str) -> Result<Session> {
        let keys = self
            .keys
            .take()
            .ok_or_else(|| handshake_error(constants::ERR_KEYS_NOT_GENERATED))?;
        let request = self
            .request
            .take()
            .ok_or_else(|| handshake_error(constants::ERR_RESPONSE_NOT_RECEIVED))?;
        let response = self
            .response
            .take()
            .ok_or_else(|| handshake_error(constants::ERR_RESPONSE_NOT_RECEIVED))?;
        let hybrid = self
            .hybrid
            .take()
            .ok_or_else(|| handshake_error(constants::ERR_KEYS_NOT_GENERATED))?;

        let s1 = keys.v1.shared_secret(&response.v1_server_public)?;
        let s2 = keys.v2.shared_secret(&response.v2_server_public)?;
        let derived = SessionKeys::derive(&s1, &s2, &response.server_nonce)?;

        let transcript = transcript_hash(&request, &response);
        if !derived.verify_trust(&transcript, &response.trust_mac)? {
            return Err(handshake_error(constants::ERR_TRUST_MISMATCH));
        }

        debug!(account = %account.account_id, uin = response.uin, "Client derived session keys");

        Ok(Session {
            account_id: account.account_id.clone(),
            uin: if response.uin != 0 { response.uin } else { account.uin },
            session_key: derived.session_key.to_vec(),
            client_session_key: derived.client_session_key.to_vec(),
            server_session_key: derived.server_session_key.to_vec(),
            cookie: response.cookie,
            endpoint: endpoint.to_string(),
            hybrid_private_key: hybrid.private_bytes().to_vec(),
            hybrid_public_key: hybrid.public_key().to_vec(),
            hybrid_key_version: 0,
            device_id: request.device_id,
            client_version: request.client_version,
            sequence: 0,
            established_at: request.timestamp,
        })
    }
}

/// Drives [`ClientHandshake`] against the handshake endpoint
pub struct HandshakeEngine {
    config: Arc<ClientConfig>,
    transport: Arc<dyn HttpTransport>,
}

impl HandshakeEngine {
    pub fn new(config: Arc<ClientConfig>, transport: Arc<dyn HttpTransport>) -> Self {
        Self { config, transport }
    }

    /// Run one complete handshake attempt for `account`.
    ///
    /// Not retried. Bounded by the configured handshake timeout.
    #[instrument(skip(self, account), fields(account = %account.account_id))]
    pub async fn establish(&self, account: &AccountRecord) -> Result<Session> {
        let _timer = Timer::start("handshake");
        let metrics = global_metrics();
        metrics.handshake_attempt();

        let result = with_timeout_error(self.run(account), self.config.transport.handshake_timeout).await;
        match &result {
            Ok(_) => metrics.handshake_success(),
            Err(e) => {
                metrics.handshake_failed();
                warn!(error = %e, "Handshake failed");
            }
        }
        result
    }

    async fn run(&self, account: &AccountRecord) -> Result<Session> {
        let mut handshake = ClientHandshake::new();
        if let Some(previous) = account.session.as_ref() {
            if let Ok(hybrid) = previous.hybrid_key_pair() {
                handshake = handshake.with_hybrid_key(hybrid);
            }
        }

        handshake.generate_keys()?;
        let client_version = account.effective_client_version(self.config.protocol.client_version);
        let body = handshake.build_request(account, client_version, self.config.protocol.device_type)?;

        let host = account
            .short_host
            .as_deref()
            .unwrap_or(&self.config.endpoints.short_host);
        debug!(host, body_len = body.len(), "Posting handshake request");

        let response = self
            .transport
            .post(host, &self.config.endpoints.handshake_path, body, account.proxy.as_ref())
            .await?;

        handshake.receive_response(&response)?;
        let mut session = handshake.establish(account, host)?;
        session.hybrid_key_version = self.config.protocol.hybrid_key_version;
        Ok(session)
    }
}

/// Per-account exclusion so at most one handshake is in flight per account
#[derive(Default)]
pub struct HandshakeGate {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HandshakeGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive handshake rights on `account_id`
    pub async fn lock(&self, account_id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Slots nobody holds or waits on are only referenced by the map.
            locks.retain(|_, slot| Arc::strong_count(slot) > 1);
            locks.entry(account_id.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }
}

/// Peer half of the handshake, used by mock servers and tests
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    pub cookie: Vec<u8>,
    pub uin: u32,
    pub trust_blob: Vec<u8>,
}

impl ServerHandshake {
    pub fn new(cookie: Vec<u8>, uin: u32, trust_blob: Vec<u8>) -> Self {
        Self {
            cookie,
            uin,
            trust_blob,
        }
    }

    /// Answer a serialized client hello with fresh server keys and nonce.
    /// Returns the response body and the peer's copy of the session.
    pub fn respond(&self, request_body: &[u8]) -> Result<(Vec<u8>, Session)> {
        let request: HandshakeRequest = bincode::deserialize(request_body)?;
        let pairs = HandshakeKeyPairs::generate();
        let (response, session) =
            self.respond_with(&request, &pairs, crypto::random_bytes::<32>())?;
        Ok((bincode::serialize(&response)?, session))
    }

    /// Deterministic variant of [`respond`](Self::respond)
    pub fn respond_with(
        &self,
        request: &HandshakeRequest,
        pairs: &HandshakeKeyPairs,
        server_nonce: [u8; 32],
    ) -> Result<(HandshakeResponse, Session)> {
        let s1 = pairs.v1.shared_secret(&request.v1_public)?;
        let s2 = pairs.v2.shared_secret(&request.v2_public)?;
        let derived = SessionKeys::derive(&s1, &s2, &server_nonce)?;

        let mut response = HandshakeResponse {
            status: 0,
            server_nonce,
            v1_server_public: pairs.v1.public_key().to_vec(),
            v2_server_public: pairs.v2.public_key().to_vec(),
            cookie: self.cookie.clone(),
            uin: self.uin,
            trust_blob: self.trust_blob.clone(),
            trust_mac: Vec::new(),
        };
        let transcript = transcript_hash(request, &response);
        response.trust_mac = derived.trust_mac(&transcript)?.to_vec();

        debug!(account = %request.account_id, "Server finalized handshake");

        let session = Session {
            account_id: request.account_id.clone(),
            uin: self.uin,
            session_key: derived.session_key.to_vec(),
            client_session_key: derived.client_session_key.to_vec(),
            server_session_key: derived.server_session_key.to_vec(),
            cookie: self.cookie.clone(),
            endpoint: String::new(),
            hybrid_private_key: Vec::new(),
            hybrid_public_key: request.hybrid_public.clone(),
            hybrid_key_version: 0,
            device_id: request.device_id.clone(),
            client_version: request.client_version,
            sequence: 0,
            established_at: request.timestamp,
        };
        Ok((response, session))
    }

    /// A serialized rejection carrying `status`
    pub fn reject(status: i32) -> Result<Vec<u8>> {
        let response = HandshakeResponse {
            status,
            server_nonce: [0u8; 32],
            v1_server_public: Vec::new(),
            v2_server_public: Vec::new(),
            cookie: Vec::new(),
            uin: 0,
            trust_blob: Vec::new(),
            trust_mac: Vec::new(),
        };
        Ok(bincode::serialize(&response)?)
    }
}
