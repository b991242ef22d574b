//! # Request Dispatcher
//!
//! The `send` contract feature builders depend on: resolve (or negotiate) the
//! account's session, frame the payload, perform exactly one network exchange,
//! and decode the reply.
//!
//! ## Flow
//! ```text
//! store.get ──► session? ──no──► gate.lock ──► handshake ──► store.update
//!                  │yes
//!                  ▼
//!            codec.encode ──► store.update (sequence)
//!                  ▼
//!      HTTP POST  or  long-link request
//!                  ▼
//!            codec.decode ──► cookie rotated? ──► store.update
//! ```
//!
//! Nothing is retried. A `SessionExpired` result clears the stored session
//! first, so the caller's resubmission renegotiates.

use crate::config::ClientConfig;
use crate::core::codec::{PacketCodec, RequestMeta};
use crate::core::packet::EncryptType;
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::{HandshakeEngine, HandshakeGate};
use crate::service::http::HttpTransport;
use crate::session::AccountRecord;
use crate::store::{SessionStore, TtlPolicy};
use crate::transport::manager::ConnectionManager;
use crate::utils::metrics::{global_metrics, Timer};
use crate::utils::timeout::with_timeout_error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Business endpoint: CGI id plus URL path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub cgi: u32,
    pub path: String,
}

impl Route {
    pub fn new(cgi: u32, path: impl Into<String>) -> Self {
        Self {
            cgi,
            path: path.into(),
        }
    }
}

/// Which connection carries the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Http,
    LongLink,
}

/// Per-call encode and delivery options
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub route: Route,
    /// Overrides the route table's encrypt type
    pub encrypt_type: Option<EncryptType>,
    pub compress: bool,
    pub transport: TransportKind,
    /// Bound on the whole call, handshake included
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            encrypt_type: None,
            compress: false,
            transport: TransportKind::Http,
            timeout: None,
        }
    }

    pub fn with_encrypt_type(mut self, encrypt_type: EncryptType) -> Self {
        self.encrypt_type = Some(encrypt_type);
        self
    }

    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    pub fn over_long_link(mut self) -> Self {
        self.transport = TransportKind::LongLink;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Typed view of a route's response payload.
///
/// Each route maps its payload explicitly; there is no generic reshaping.
pub trait RouteResponse: Sized {
    fn from_payload(payload: Vec<u8>) -> Result<Self>;
}

impl RouteResponse for Vec<u8> {
    fn from_payload(payload: Vec<u8>) -> Result<Self> {
        Ok(payload)
    }
}

/// Sends framed requests on behalf of stored accounts
pub struct RequestDispatcher {
    config: Arc<ClientConfig>,
    codec: PacketCodec,
    store: SessionStore,
    transport: Arc<dyn HttpTransport>,
    handshake: HandshakeEngine,
    gate: HandshakeGate,
    links: Option<Arc<ConnectionManager>>,
}

impl RequestDispatcher {
    pub fn new(
        config: Arc<ClientConfig>,
        store: SessionStore,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        let codec = PacketCodec::new(&config)?;
        let handshake = HandshakeEngine::new(config.clone(), transport.clone());
        Ok(Self {
            config,
            codec,
            store,
            transport,
            handshake,
            gate: HandshakeGate::new(),
            links: None,
        })
    }

    /// Enable [`TransportKind::LongLink`] delivery
    pub fn with_connection_manager(mut self, links: Arc<ConnectionManager>) -> Self {
        self.links = Some(links);
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    /// Register a new account with the configured default TTL
    pub fn register_account(&self, record: &AccountRecord) -> Result<()> {
        let policy = TtlPolicy::from_seconds(self.config.store.default_ttl_seconds);
        self.store.put(record, &record.account_id, policy)
    }

    /// Send `payload` for `account_id` and return the decoded response payload
    #[instrument(skip(self, payload, options), fields(cgi = options.route.cgi, payload_len = payload.len()))]
    pub async fn send(&self, account_id: &str, payload: &[u8], options: &SendOptions) -> Result<Vec<u8>> {
        let _timer = Timer::start("send");
        let timeout = options.timeout.unwrap_or(self.config.transport.request_timeout);
        with_timeout_error(self.send_inner(account_id, payload, options), timeout).await
    }

    /// [`send`](Self::send), then map the payload through `R`
    pub async fn send_typed<R: RouteResponse>(
        &self,
        account_id: &str,
        payload: &[u8],
        options: &SendOptions,
    ) -> Result<R> {
        R::from_payload(self.send(account_id, payload, options).await?)
    }

    /// Load the account, negotiating and persisting a session if it has none.
    ///
    /// Handshakes are serialized per account; a caller that waited on the gate
    /// reuses the session the winner stored.
    pub async fn ensure_session(&self, account_id: &str) -> Result<AccountRecord> {
        let record = self.store.get(account_id)?;
        if record.session.is_some() {
            return Ok(record);
        }

        let _guard = self.gate.lock(account_id).await;
        let mut record = self.store.get(account_id)?;
        if record.session.is_some() {
            debug!(account = account_id, "Session negotiated by a concurrent caller");
            return Ok(record);
        }

        let session = self.handshake.establish(&record).await?;
        if record.uin == 0 {
            record.uin = session.uin;
        }
        record.session = Some(session);
        self.store.update(account_id, &record)?;
        debug!(account = account_id, "Session established and stored");
        Ok(record)
    }

    async fn send_inner(&self, account_id: &str, payload: &[u8], options: &SendOptions) -> Result<Vec<u8>> {
        let metrics = global_metrics();
        let cgi = options.route.cgi;
        let mut record = self.ensure_session(account_id).await?;

        let meta = RequestMeta {
            route: cgi,
            encrypt_type: options
                .encrypt_type
                .unwrap_or_else(|| self.codec.default_encrypt_type(cgi)),
            compress: options.compress,
        };
        let frame = self.codec.encode(payload, record.session_mut()?, &meta)?;
        self.store.update(account_id, &record)?;
        metrics.request_sent(frame.bytes.len() as u64);
        debug!(account = account_id, cgi, seq = frame.sequence, frame_len = frame.bytes.len(), "Request framed");

        let exchanged = match options.transport {
            TransportKind::Http => {
                let host = self.endpoint_for(&record)?;
                self.transport
                    .post(&host, &options.route.path, frame.bytes, record.proxy.as_ref())
                    .await
            }
            TransportKind::LongLink => match self.links.as_ref() {
                Some(links) => links.request(account_id, cgi, frame.bytes).await,
                None => Err(ProtocolError::TransportError(
                    "long-link delivery requested without a connection manager".into(),
                )),
            },
        };

        let decoded = exchanged.and_then(|response| {
            metrics.response_received(response.len() as u64);
            self.codec.decode(&response, record.session()?, cgi)
        });

        match decoded {
            Ok(decoded) => {
                if record.session_mut()?.rotate_cookie(decoded.cookie()) {
                    debug!(account = account_id, "Server rotated session cookie");
                    self.store.update(account_id, &record)?;
                }
                Ok(decoded.payload)
            }
            Err(err) => {
                if let Err(store_err) = self.record_failure(account_id, &mut record, &err) {
                    warn!(account = account_id, error = %store_err, "Failed to persist request failure");
                }
                Err(err)
            }
        }
    }

    fn record_failure(&self, account_id: &str, record: &mut AccountRecord, err: &ProtocolError) -> Result<()> {
        let metrics = global_metrics();
        match err {
            ProtocolError::SessionExpired { code } => {
                metrics.session_expired();
                warn!(account = account_id, code, "Session expired; discarding stored session");
                record.clear_session();
                self.store.update(account_id, record)?;
            }
            ProtocolError::RemoteStatus { .. } | ProtocolError::AccountLoggedOut { .. } => {
                metrics.remote_status();
            }
            ProtocolError::FrameCorrupt(_) => metrics.frame_corrupt(),
            _ => {}
        }
        Ok(())
    }

    /// Session endpoint, then the account override, then the configured host
    fn endpoint_for(&self, record: &AccountRecord) -> Result<String> {
        let session = record.session()?;
        if !session.endpoint.is_empty() {
            return Ok(session.endpoint.clone());
        }
        Ok(record
            .short_host
            .clone()
            .unwrap_or_else(|| self.config.endpoints.short_host.clone()))
    }

    /// Drop the stored session so the next send renegotiates
    pub fn invalidate_session(&self, account_id: &str) -> Result<()> {
        self.store.modify(account_id, |record| {
            record.clear_session();
            Ok(())
        })
    }

    /// Forget the account: close its long-link and delete its record
    pub async fn logout(&self, account_id: &str) -> Result<()> {
        if let Some(links) = self.links.as_ref() {
            links.close(account_id).await?;
        }
        self.store.delete(account_id)?;
        debug!(account = account_id, "Account logged out locally");
        Ok(())
    }
}
