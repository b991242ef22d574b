//! # Connection Manager
//!
//! Owns the long-link connections of a process, at most one per account.
//!
//! ## Tasks
//! - one reader task per connection: record intake, heartbeats, response
//!   matching, push classification
//! - one event-loop task per manager: drains pushed events into the
//!   [`EventDispatcher`], so slow handlers never stall a socket
//!
//! ## States
//! ```text
//! Disconnected ──connect──► Connecting ──hello ok──► Connected
//!      ▲                        │                        │
//!      └─ dial/hello error, ────┘◄── I/O error, alert, close
//!         close, dropped connect
//! ```
//! A `Connecting` slot belongs to one connect attempt. It is released when
//! that attempt fails, is cancelled by [`ConnectionManager::close`], or its
//! future is dropped (for example by a caller-side timeout).
//! There is no reconnect loop. Every drop is broadcast as
//! [`LinkEvent::Disconnected`] and the caller decides what to do.

use crate::config::{ClientConfig, ReturnCodeTable};
use crate::core::codec::PacketCodec;
use crate::core::record::{LinkCodec, LinkMessage, Record, RecordType, CMD_HEARTBEAT, CMD_SYNC_NOTIFY};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::{EventDispatcher, PushEvent};
use crate::protocol::status::{self, ERROR_FRAME_LIMIT};
use crate::store::SessionStore;
use crate::transport::long_link::{self, link_ciphers, LinkHello, LinkKeys, LinkOpener, LinkSealer, Role};
use crate::transport::proxy;
use crate::utils::crypto;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout_error;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Sequence number carried by heartbeats; never used for requests
const HEARTBEAT_SEQ: u32 = u32::MAX;

const LINK_EVENT_CAPACITY: usize = 64;

/// Per-account connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle notifications broadcast by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { account_id: String },
    Disconnected { account_id: String, reason: String },
}

type PendingMap = Arc<StdMutex<HashMap<u32, oneshot::Sender<Bytes>>>>;

struct LinkWriter {
    sink: FramedWrite<OwnedWriteHalf, LinkCodec>,
    sealer: LinkSealer,
}

impl LinkWriter {
    async fn send(&mut self, message: &LinkMessage) -> Result<()> {
        let record = self.sealer.seal(message)?;
        self.sink.send(record).await
    }
}

struct LinkHandle {
    id: u64,
    writer: Mutex<LinkWriter>,
    pending: PendingMap,
    next_sequence: AtomicU32,
    cancel: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl LinkHandle {
    fn allocate_sequence(&self) -> u32 {
        loop {
            let seq = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            if seq != 0 && seq != HEARTBEAT_SEQ {
                return seq;
            }
        }
    }
}

enum LinkSlot {
    Connecting { id: u64, cancel: CancellationToken },
    Connected(Arc<LinkHandle>),
}

struct Shared {
    slots: StdMutex<HashMap<String, LinkSlot>>,
    link_events: broadcast::Sender<LinkEvent>,
    push_tx: mpsc::UnboundedSender<PushEvent>,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, LinkSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the slot only if it still belongs to link `id`
    fn release(&self, account_id: &str, id: u64) {
        let mut slots = self.slots();
        if matches!(slots.get(account_id), Some(LinkSlot::Connected(handle)) if handle.id == id) {
            slots.remove(account_id);
        }
    }

    /// Remove the slot only if connect attempt `id` still holds it unfinished
    fn abandon_connect(&self, account_id: &str, id: u64) {
        let mut slots = self.slots();
        if matches!(slots.get(account_id), Some(LinkSlot::Connecting { id: slot_id, .. }) if *slot_id == id) {
            slots.remove(account_id);
        }
    }
}

/// Frees a `Connecting` slot when its connect future ends without installing a link
struct ConnectGuard<'a> {
    shared: &'a Shared,
    account_id: &'a str,
    id: u64,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.shared.abandon_connect(self.account_id, self.id);
    }
}

/// Long-link connection owner. Create with [`ConnectionManager::start`].
pub struct ConnectionManager {
    config: Arc<ClientConfig>,
    store: SessionStore,
    shared: Arc<Shared>,
    dispatcher: Arc<EventDispatcher>,
    next_link_id: AtomicU64,
    shutdown: CancellationToken,
    event_loop: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create the manager and spawn its event loop. Requires a tokio runtime.
    pub fn start(config: Arc<ClientConfig>, store: SessionStore) -> Arc<Self> {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (link_events, _) = broadcast::channel(LINK_EVENT_CAPACITY);
        let dispatcher = Arc::new(EventDispatcher::new());
        let shutdown = CancellationToken::new();

        let event_loop = tokio::spawn(run_event_loop(push_rx, dispatcher.clone(), shutdown.clone()));

        Arc::new(Self {
            config,
            store,
            shared: Arc::new(Shared {
                slots: StdMutex::new(HashMap::new()),
                link_events,
                push_tx,
            }),
            dispatcher,
            next_link_id: AtomicU64::new(1),
            shutdown,
            event_loop: StdMutex::new(Some(event_loop)),
        })
    }

    /// Handler registry for pushed events
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Receive connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.link_events.subscribe()
    }

    pub fn state(&self, account_id: &str) -> ConnectionState {
        match self.shared.slots().get(account_id) {
            None => ConnectionState::Disconnected,
            Some(LinkSlot::Connecting { .. }) => ConnectionState::Connecting,
            Some(LinkSlot::Connected(_)) => ConnectionState::Connected,
        }
    }

    /// Open the long-link for `account_id`.
    ///
    /// The account must already hold a session; link keys are derived from it.
    /// A no-op if the account is already connecting or connected. A connect
    /// cancelled by [`close`](Self::close) returns `ConnectionClosed`.
    #[instrument(skip(self))]
    pub async fn connect(&self, account_id: &str) -> Result<()> {
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        {
            let mut slots = self.shared.slots();
            if slots.contains_key(account_id) {
                debug!("Long-link already open or opening");
                return Ok(());
            }
            slots.insert(
                account_id.to_string(),
                LinkSlot::Connecting {
                    id,
                    cancel: cancel.clone(),
                },
            );
        }
        let _guard = ConnectGuard {
            shared: &self.shared,
            account_id,
            id,
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = self.open(account_id, id, cancel.clone()) => result,
        };
        if let Err(e) = &result {
            warn!(error = %e, "Long-link connect failed");
        }
        result
    }

    async fn open(&self, account_id: &str, id: u64, cancel: CancellationToken) -> Result<()> {
        let link = &self.config.long_link;
        let record = self.store.get(account_id)?;
        let session = record.session()?.clone();
        let target = record
            .long_host
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.config.endpoints.long_host, self.config.endpoints.long_port));

        let stream = with_timeout_error(proxy::dial(&target, record.proxy.as_ref()), link.connect_timeout).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LinkCodec::new(link.max_record_size));
        let mut sink = FramedWrite::new(write_half, LinkCodec::new(link.max_record_size));

        let hello = LinkHello {
            account_id: account_id.to_string(),
            uin: session.uin,
            cookie: session.cookie.clone(),
            client_random: crypto::random_bytes::<32>(),
        };
        let ack = with_timeout_error(
            long_link::client_hello(&mut reader, &mut sink, &hello),
            link.connect_timeout,
        )
        .await?;
        if ack.status != 0 {
            return Err(status::classify_status(&self.config.return_codes, ack.status));
        }

        let keys = LinkKeys::derive(&session, &hello.client_random, &ack.server_random)?;
        let (sealer, opener) = link_ciphers(&keys, Role::Client);
        let sealer = sealer.with_record_limit(link.max_record_size);

        let handle = Arc::new(LinkHandle {
            id,
            writer: Mutex::new(LinkWriter { sink, sealer }),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            next_sequence: AtomicU32::new(1),
            cancel,
            task: StdMutex::new(None),
        });

        {
            let mut slots = self.shared.slots();
            if !matches!(slots.get(account_id), Some(LinkSlot::Connecting { id: slot_id, .. }) if *slot_id == id) {
                return Err(ProtocolError::ConnectionClosed);
            }
            slots.insert(account_id.to_string(), LinkSlot::Connected(handle.clone()));
        }

        let task = tokio::spawn(run_link(LinkTask {
            account_id: account_id.to_string(),
            reader,
            opener,
            handle: handle.clone(),
            shared: self.shared.clone(),
            heartbeat_interval: link.heartbeat_interval,
        }));
        *handle.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        global_metrics().link_opened();
        let _ = self.shared.link_events.send(LinkEvent::Connected {
            account_id: account_id.to_string(),
        });
        info!(addr = %target, "Long-link connected");
        Ok(())
    }

    fn handle(&self, account_id: &str) -> Result<Arc<LinkHandle>> {
        match self.shared.slots().get(account_id) {
            Some(LinkSlot::Connected(handle)) => Ok(handle.clone()),
            _ => Err(ProtocolError::TransportError(constants::ERR_NOT_CONNECTED.into())),
        }
    }

    /// Send `body` as command `cmd_id` and wait for the matching response body.
    ///
    /// Bounded by the configured long-link request timeout. A response body
    /// shorter than an error-frame limit is classified as a status. A body too
    /// large for one record is refused before anything is written.
    #[instrument(skip(self, body), fields(body_len = body.len()))]
    pub async fn request(&self, account_id: &str, cmd_id: u32, body: Vec<u8>) -> Result<Vec<u8>> {
        let record_len = long_link::sealed_len(body.len());
        if record_len > self.config.long_link.max_record_size.min(u16::MAX as usize) {
            return Err(ProtocolError::OversizedPacket(record_len));
        }
        let handle = self.handle(account_id)?;
        let seq = handle.allocate_sequence();
        let (tx, rx) = oneshot::channel();
        lock_pending(&handle.pending).insert(seq, tx);

        let exchange = async {
            handle
                .writer
                .lock()
                .await
                .send(&LinkMessage::new(cmd_id, seq, body))
                .await?;
            rx.await.map_err(|_| ProtocolError::ConnectionClosed)
        };
        let response = match with_timeout_error(exchange, self.config.long_link.request_timeout).await {
            Ok(response) => response,
            Err(e) => {
                lock_pending(&handle.pending).remove(&seq);
                return Err(e);
            }
        };

        trace!(seq, response_len = response.len(), "Long-link response matched");
        if response.len() < ERROR_FRAME_LIMIT {
            return Err(classify_short_body(&self.config.return_codes, &response));
        }
        Ok(response.to_vec())
    }

    /// Close the account's long-link and wait for its reader task to exit.
    ///
    /// An in-flight connect is cancelled; it can no longer install a link once
    /// this returns.
    #[instrument(skip(self))]
    pub async fn close(&self, account_id: &str) -> Result<()> {
        let handle = {
            let mut slots = self.shared.slots();
            match slots.remove(account_id) {
                Some(LinkSlot::Connected(handle)) => handle,
                Some(LinkSlot::Connecting { cancel, .. }) => {
                    cancel.cancel();
                    debug!("In-flight long-link connect cancelled");
                    return Ok(());
                }
                None => return Ok(()),
            }
        };
        handle.cancel.cancel();
        let task = handle.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.await
                .map_err(|e| ProtocolError::Custom(format!("link task failed: {e}")))?;
        }
        Ok(())
    }

    /// Close every link and stop the event loop
    pub async fn shutdown(&self) -> Result<()> {
        let accounts: Vec<String> = self.shared.slots().keys().cloned().collect();
        for account_id in accounts {
            self.close(&account_id).await?;
        }
        self.shutdown.cancel();
        global_metrics().log_metrics();
        let event_loop = self.event_loop.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(event_loop) = event_loop {
            event_loop
                .await
                .map_err(|e| ProtocolError::Custom(format!("event loop failed: {e}")))?;
        }
        info!("Connection manager stopped");
        Ok(())
    }
}

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u32, oneshot::Sender<Bytes>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn classify_short_body(table: &ReturnCodeTable, body: &[u8]) -> ProtocolError {
    status::classify_error_frame(table, body)
}

async fn run_event_loop(
    mut push_rx: mpsc::UnboundedReceiver<PushEvent>,
    dispatcher: Arc<EventDispatcher>,
    shutdown: CancellationToken,
) {
    let metrics = global_metrics();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = push_rx.recv() => {
                let Some(event) = event else { break };
                metrics.push_event();
                if let Err(e) = dispatcher.dispatch(&event) {
                    debug!(account = event.account_id(), cmd = event.cmd_id(), error = %e, "Push event not handled");
                }
            }
        }
    }
    debug!("Push event loop stopped");
}

struct LinkTask {
    account_id: String,
    reader: FramedRead<OwnedReadHalf, LinkCodec>,
    opener: LinkOpener,
    handle: Arc<LinkHandle>,
    shared: Arc<Shared>,
    heartbeat_interval: Duration,
}

async fn run_link(mut task: LinkTask) {
    let metrics = global_metrics();
    let cancel = task.handle.cancel.clone();
    let mut heartbeat = interval_at(Instant::now() + task.heartbeat_interval, task.heartbeat_interval);

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "closed".to_string(),
            _ = heartbeat.tick() => {
                let beat = LinkMessage::new(CMD_HEARTBEAT, HEARTBEAT_SEQ, Bytes::new());
                if let Err(e) = task.handle.writer.lock().await.send(&beat).await {
                    break format!("heartbeat failed: {e}");
                }
                metrics.heartbeat();
                trace!(account = %task.account_id, "Heartbeat sent");
            }
            next = task.reader.next() => match next {
                None => break constants::ERR_CONNECTION_CLOSED.to_string(),
                Some(Err(e)) => break e.to_string(),
                Some(Ok(record)) => {
                    if let Err(reason) = handle_record(&mut task, record) {
                        break reason;
                    }
                }
            },
        }
    };

    // Waiters see their oneshot dropped and report ConnectionClosed.
    lock_pending(&task.handle.pending).clear();
    task.shared.release(&task.account_id, task.handle.id);
    {
        let mut writer = task.handle.writer.lock().await;
        let _ = writer.sink.close().await;
    }
    metrics.link_closed();
    info!(account = %task.account_id, %reason, "Long-link disconnected");
    let _ = task.shared.link_events.send(LinkEvent::Disconnected {
        account_id: task.account_id.clone(),
        reason,
    });
}

/// Route one inbound record. An `Err` ends the connection with that reason.
fn handle_record(task: &mut LinkTask, record: Record) -> std::result::Result<(), String> {
    match record.record_type {
        RecordType::Alert => return Err("alert received".to_string()),
        RecordType::Handshake => {
            warn!(account = %task.account_id, "Unexpected handshake record after hello");
            return Ok(());
        }
        RecordType::ApplicationData => {}
    }

    let message = task.opener.open(&record).map_err(|e| e.to_string())?;

    if message.is_response() {
        match lock_pending(&task.handle.pending).remove(&message.sequence) {
            Some(waiter) => {
                let _ = waiter.send(message.body);
            }
            None if message.sequence == HEARTBEAT_SEQ => trace!("Heartbeat acknowledged"),
            None => debug!(seq = message.sequence, "Response with no waiter dropped"),
        }
        return Ok(());
    }

    let event = if message.cmd_id == CMD_SYNC_NOTIFY {
        PushEvent::SyncNotify {
            account_id: task.account_id.clone(),
            body: message.body,
        }
    } else {
        match PacketCodec::parse_header(&message.body) {
            Ok(header) => PushEvent::Frame {
                account_id: task.account_id.clone(),
                cmd_id: message.cmd_id,
                header,
                frame: message.body,
            },
            Err(e) => {
                global_metrics().frame_corrupt();
                warn!(account = %task.account_id, cmd = message.cmd_id, error = %e, "Dropping invalid pushed frame");
                return Ok(());
            }
        }
    };

    task.shared
        .push_tx
        .send(event)
        .map_err(|_| "event loop stopped".to_string())
}
