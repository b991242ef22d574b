//! In-process mock of the short-link servers, shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use futures::future::BoxFuture;
use mmtls_client::config::ClientConfig;
use mmtls_client::core::codec::PacketCodec;
use mmtls_client::core::packet::CompressType;
use mmtls_client::error::{ProtocolError, Result};
use mmtls_client::protocol::handshake::{ClientHandshake, ServerHandshake};
use mmtls_client::protocol::key_exchange::KeyPair;
use mmtls_client::protocol::status::encode_error_frame;
use mmtls_client::service::http::HttpTransport;
use mmtls_client::session::{AccountRecord, ProxyConfig, Session};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed scalar of the mock server's hybrid key
pub const HYBRID_SERVER_SCALAR: [u8; 32] = [0x5A; 32];

/// Client config whose hybrid server key matches [`HYBRID_SERVER_SCALAR`]
pub fn test_config() -> ClientConfig {
    let hybrid = KeyPair::from_private_bytes(&HYBRID_SERVER_SCALAR).unwrap();
    ClientConfig::default_with_overrides(|config| {
        config.endpoints.short_host = "short.mock".into();
        config.protocol.hybrid_server_public_key = hex::encode(hybrid.public_key());
        config.transport.request_timeout = Duration::from_secs(5);
        config.transport.handshake_timeout = Duration::from_secs(5);
    })
}

pub fn account(id: &str) -> AccountRecord {
    let mut record = AccountRecord::new(id, vec![0xD1; 16]);
    record.device_type = "ios".into();
    record.device_name = "mock-phone".into();
    record
}

/// Run a handshake locally and return the client and server halves
pub fn negotiate(record: &AccountRecord, cookie: &[u8]) -> (Session, Session) {
    let mut client = ClientHandshake::new();
    client.generate_keys().unwrap();
    let body = client.build_request(record, 0x1800_3727, 0x0d).unwrap();
    let (response, server_session) = ServerHandshake::new(cookie.to_vec(), 4242, b"trust".to_vec())
        .respond(&body)
        .unwrap();
    client.receive_response(&response).unwrap();
    let session = client.establish(record, "short.mock").unwrap();
    (session, server_session)
}

/// Handshake server plus an echo business server
pub struct MockServer {
    codec: PacketCodec,
    handshake_path: String,
    session_timeout: i32,
    hybrid: KeyPair,
    sessions: Mutex<HashMap<Vec<u8>, Session>>,
    next_uin: AtomicU32,
    pub handshakes: AtomicUsize,
    pub requests: AtomicUsize,
    expire_next: AtomicBool,
    status_next: Mutex<Option<i32>>,
    rotate_next: Mutex<Option<Vec<u8>>>,
    handshake_delay: Mutex<Duration>,
    pub last_host: Mutex<Option<String>>,
}

impl MockServer {
    pub fn new(config: &ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            codec: PacketCodec::new(config).unwrap(),
            handshake_path: config.endpoints.handshake_path.clone(),
            session_timeout: config.return_codes.session_timeout,
            hybrid: KeyPair::from_private_bytes(&HYBRID_SERVER_SCALAR).unwrap(),
            sessions: Mutex::new(HashMap::new()),
            next_uin: AtomicU32::new(1000),
            handshakes: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            expire_next: AtomicBool::new(false),
            status_next: Mutex::new(None),
            rotate_next: Mutex::new(None),
            handshake_delay: Mutex::new(Duration::ZERO),
            last_host: Mutex::new(None),
        })
    }

    /// Answer the next business request with the session-timeout status
    pub fn expire_next_request(&self) {
        self.expire_next.store(true, Ordering::SeqCst);
    }

    /// Answer the next business request with an error frame carrying `code`
    pub fn fail_next_request(&self, code: i32) {
        *self.status_next.lock().unwrap() = Some(code);
    }

    /// Issue `cookie` on the next business response
    pub fn rotate_cookie_next(&self, cookie: &[u8]) {
        *self.rotate_next.lock().unwrap() = Some(cookie.to_vec());
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.handshake_delay.lock().unwrap() = delay;
    }

    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn session_for(&self, cookie: &[u8]) -> Option<Session> {
        self.sessions.lock().unwrap().get(cookie).cloned()
    }

    async fn handle(&self, host: &str, path: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        *self.last_host.lock().unwrap() = Some(host.to_string());
        if path == self.handshake_path {
            return self.handshake(body).await;
        }
        self.business(&body)
    }

    async fn handshake(&self, body: Vec<u8>) -> Result<Vec<u8>> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.handshake_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let uin = self.next_uin.fetch_add(1, Ordering::SeqCst);
        let cookie = format!("ck{uin}").into_bytes();
        let (response, session) = ServerHandshake::new(cookie.clone(), uin, b"trust".to_vec()).respond(&body)?;
        self.sessions.lock().unwrap().insert(cookie, session);
        Ok(response)
    }

    fn business(&self, frame: &[u8]) -> Result<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let header = PacketCodec::parse_header(frame)?;

        if self.expire_next.swap(false, Ordering::SeqCst) {
            self.sessions.lock().unwrap().remove(&header.cookie);
            return Ok(encode_error_frame(self.session_timeout));
        }
        if let Some(code) = self.status_next.lock().unwrap().take() {
            return Ok(encode_error_frame(code));
        }

        let Some(mut session) = self.session_for(&header.cookie) else {
            return Ok(encode_error_frame(self.session_timeout));
        };
        let request = self.codec.decode_request(frame, &session, Some(&self.hybrid))?;

        if let Some(cookie) = self.rotate_next.lock().unwrap().take() {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.remove(&session.cookie);
            session.cookie = cookie.clone();
            sessions.insert(cookie, session.clone());
        }

        let compress = request.header.compress_type == CompressType::Zlib;
        self.codec
            .encode_response(&request.payload, &session, header.route, header.sequence, compress)
    }

    /// Server-side decode of a long-link request frame followed by an echo
    pub fn echo_frame(&self, frame: &[u8]) -> Result<Vec<u8>> {
        self.business(frame)
    }
}

impl HttpTransport for MockServer {
    fn post<'a>(
        &'a self,
        host: &'a str,
        path: &'a str,
        body: Vec<u8>,
        _proxy: Option<&'a ProxyConfig>,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { self.handle(host, path, body).await })
    }
}

/// Transport that always fails at the network level
pub struct DeadTransport;

impl HttpTransport for DeadTransport {
    fn post<'a>(
        &'a self,
        _host: &'a str,
        _path: &'a str,
        _body: Vec<u8>,
        _proxy: Option<&'a ProxyConfig>,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async { Err(ProtocolError::Http("connection refused".into())) })
    }
}
