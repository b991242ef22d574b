//! Long-link behavior against a loopback TCP mock server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use bytes::Bytes;
use common::{account, test_config, MockServer};
use futures::{SinkExt, StreamExt};
use mmtls_client::config::ClientConfig;
use mmtls_client::core::codec::PacketCodec;
use mmtls_client::core::record::{
    LinkCodec, LinkMessage, Record, RecordType, CMD_HEARTBEAT, CMD_SYNC_NOTIFY, RESPONSE_CMD_OFFSET,
};
use mmtls_client::error::ProtocolError;
use mmtls_client::protocol::dispatcher::PushEvent;
use mmtls_client::protocol::status::encode_error_frame;
use mmtls_client::service::request::{RequestDispatcher, Route, SendOptions};
use mmtls_client::session::Session;
use mmtls_client::store::SessionStore;
use mmtls_client::transport::long_link;
use mmtls_client::transport::manager::{ConnectionManager, ConnectionState, LinkEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

const SILENT_CMD: u32 = 999;
const LOGGED_OUT_CMD: u32 = 777;
const WAIT: Duration = Duration::from_secs(3);

enum Command {
    Push(LinkMessage),
    Alert,
    Hangup,
}

struct LinkServer {
    addr: String,
    commands: mpsc::UnboundedSender<Command>,
    heartbeats: Arc<AtomicUsize>,
}

impl LinkServer {
    fn push(&self, message: LinkMessage) {
        self.commands.send(Command::Push(message)).unwrap();
    }
}

async fn spawn_link_server(session: Session, backend: Arc<MockServer>) -> LinkServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (commands, mut rx) = mpsc::unbounded_channel();
    let heartbeats = Arc::new(AtomicUsize::new(0));
    let beats = heartbeats.clone();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LinkCodec::default());
        let mut writer = FramedWrite::new(write_half, LinkCodec::default());

        let hello = long_link::read_hello(&mut reader).await.unwrap();
        if hello.cookie != session.cookie {
            long_link::reject_hello(&mut writer, -13).await.unwrap();
            return;
        }
        let (mut sealer, mut opener) = long_link::accept_hello(&mut writer, &hello, &session).await.unwrap();

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Push(message)) => {
                        writer.send(sealer.seal(&message).unwrap()).await.unwrap();
                    }
                    Some(Command::Alert) => {
                        let _ = writer.send(Record::new(RecordType::Alert, vec![2, 0])).await;
                        break;
                    }
                    Some(Command::Hangup) | None => break,
                },
                record = reader.next() => {
                    let Some(Ok(record)) = record else { break };
                    let message = opener.open(&record).unwrap();
                    let reply: Option<Bytes> = match message.cmd_id {
                        CMD_HEARTBEAT => {
                            beats.fetch_add(1, Ordering::SeqCst);
                            Some(Bytes::new())
                        }
                        SILENT_CMD => None,
                        LOGGED_OUT_CMD => Some(encode_error_frame(-100).into()),
                        _ => Some(backend.echo_frame(&message.body).unwrap().into()),
                    };
                    if let Some(body) = reply {
                        let response = LinkMessage::new(message.cmd_id + RESPONSE_CMD_OFFSET, message.sequence, body);
                        if writer.send(sealer.seal(&response).unwrap()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    LinkServer {
        addr,
        commands,
        heartbeats,
    }
}

/// Accepts connections and never answers the hello
async fn spawn_mute_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

fn link_config() -> ClientConfig {
    let mut config = test_config();
    config.long_link.request_timeout = Duration::from_millis(300);
    config.long_link.heartbeat_interval = Duration::from_secs(60);
    config
}

struct Fixture {
    config: Arc<ClientConfig>,
    backend: Arc<MockServer>,
    dispatcher: RequestDispatcher,
    manager: Arc<ConnectionManager>,
    server_session: Session,
}

async fn fixture(id: &str, config: ClientConfig) -> Fixture {
    let config = Arc::new(config);
    let backend = MockServer::new(&config);
    let store = SessionStore::memory();
    let manager = ConnectionManager::start(config.clone(), store.clone());
    let dispatcher = RequestDispatcher::new(config.clone(), store, backend.clone())
        .unwrap()
        .with_connection_manager(manager.clone());

    dispatcher.register_account(&account(id)).unwrap();
    let record = dispatcher.ensure_session(id).await.unwrap();
    let cookie = record.session.unwrap().cookie;
    let server_session = backend.session_for(&cookie).unwrap();

    Fixture {
        config,
        backend,
        dispatcher,
        manager,
        server_session,
    }
}

impl Fixture {
    async fn connect(&self, id: &str, session: Session) -> LinkServer {
        let server = spawn_link_server(session, self.backend.clone()).await;
        self.point_at(id, server.addr.clone());
        server
    }

    fn point_at(&self, id: &str, addr: String) {
        self.dispatcher
            .store()
            .modify(id, |record| {
                record.long_host = Some(addr);
                Ok(())
            })
            .unwrap();
    }

    async fn wait_for_state(&self, id: &str, state: ConnectionState) {
        tokio::time::timeout(WAIT, async {
            while self.manager.state(id) != state {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn pushes_are_dispatched_and_requests_are_answered() {
    let fx = fixture("wxid_ll", link_config()).await;
    let server = fx.connect("wxid_ll", fx.server_session.clone()).await;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    {
        let tx = events_tx.clone();
        fx.manager
            .dispatcher()
            .register(CMD_SYNC_NOTIFY, move |event| {
                let _ = tx.send(event.clone());
                Ok(())
            })
            .unwrap();
    }
    fx.manager
        .dispatcher()
        .set_fallback(move |event| {
            let _ = events_tx.send(event.clone());
            Ok(())
        })
        .unwrap();

    let mut lifecycle = fx.manager.subscribe();
    fx.manager.connect("wxid_ll").await.unwrap();
    assert_eq!(fx.manager.state("wxid_ll"), ConnectionState::Connected);
    assert!(matches!(
        tokio::time::timeout(WAIT, lifecycle.recv()).await.unwrap().unwrap(),
        LinkEvent::Connected { .. }
    ));

    server.push(LinkMessage::new(CMD_SYNC_NOTIFY, 0, b"new data".to_vec()));
    match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
        PushEvent::SyncNotify { account_id, body } => {
            assert_eq!(account_id, "wxid_ll");
            assert_eq!(&body[..], b"new data");
        }
        other => panic!("unexpected event {other:?}"),
    }

    // An invalid frame is dropped; the next valid push still arrives.
    server.push(LinkMessage::new(10002, 0, vec![0xAB; 64]));
    let codec = PacketCodec::new(&fx.config).unwrap();
    let frame = codec
        .encode_response(b"pushed message", &fx.server_session, 10001, 1, false)
        .unwrap();
    server.push(LinkMessage::new(10001, 0, frame.clone()));
    match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
        PushEvent::Frame { cmd_id, header, frame: pushed, .. } => {
            assert_eq!(cmd_id, 10001);
            assert_eq!(header.route, 10001);
            assert_eq!(&pushed[..], &frame[..]);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let options = SendOptions::new(Route::new(522, "/cgi-bin/micromsg-bin/echo")).over_long_link();
    let reply = fx.dispatcher.send("wxid_ll", b"over the link", &options).await.unwrap();
    assert_eq!(reply, b"over the link");

    fx.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn close_disconnects_deterministically() {
    let fx = fixture("wxid_close", link_config()).await;
    let _server = fx.connect("wxid_close", fx.server_session.clone()).await;
    fx.manager.connect("wxid_close").await.unwrap();
    let mut lifecycle = fx.manager.subscribe();

    fx.manager.close("wxid_close").await.unwrap();
    assert_eq!(fx.manager.state("wxid_close"), ConnectionState::Disconnected);
    match tokio::time::timeout(WAIT, lifecycle.recv()).await.unwrap().unwrap() {
        LinkEvent::Disconnected { account_id, reason } => {
            assert_eq!(account_id, "wxid_close");
            assert_eq!(reason, "closed");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let err = fx.manager.request("wxid_close", 522, vec![1]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::TransportError(_)));
}

#[tokio::test]
async fn server_alert_and_hangup_are_reported() {
    let fx = fixture("wxid_alert", link_config()).await;
    let server = fx.connect("wxid_alert", fx.server_session.clone()).await;
    fx.manager.connect("wxid_alert").await.unwrap();
    let mut lifecycle = fx.manager.subscribe();

    server.commands.send(Command::Alert).unwrap();
    match tokio::time::timeout(WAIT, lifecycle.recv()).await.unwrap().unwrap() {
        LinkEvent::Disconnected { reason, .. } => assert!(!reason.is_empty()),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(fx.manager.state("wxid_alert"), ConnectionState::Disconnected);

    // No reconnect happens on its own; a fresh connect is the caller's call.
    let server = fx.connect("wxid_alert", fx.server_session.clone()).await;
    fx.manager.connect("wxid_alert").await.unwrap();
    server.commands.send(Command::Hangup).unwrap();
    assert!(matches!(
        tokio::time::timeout(WAIT, lifecycle.recv()).await.unwrap().unwrap(),
        LinkEvent::Connected { .. }
    ));
    assert!(matches!(
        tokio::time::timeout(WAIT, lifecycle.recv()).await.unwrap().unwrap(),
        LinkEvent::Disconnected { .. }
    ));
}

#[tokio::test]
async fn rejected_hello_fails_connect() {
    let fx = fixture("wxid_rej", link_config()).await;
    let mut stale = fx.server_session.clone();
    stale.cookie = b"other-cookie".to_vec();
    let _server = fx.connect("wxid_rej", stale).await;

    let err = fx.manager.connect("wxid_rej").await.unwrap_err();
    assert!(matches!(err, ProtocolError::SessionExpired { code: -13 }));
    assert_eq!(fx.manager.state("wxid_rej"), ConnectionState::Disconnected);
}

#[tokio::test]
async fn short_response_bodies_and_silence() {
    let fx = fixture("wxid_short", link_config()).await;
    let _server = fx.connect("wxid_short", fx.server_session.clone()).await;
    fx.manager.connect("wxid_short").await.unwrap();

    let err = fx.manager.request("wxid_short", LOGGED_OUT_CMD, vec![1]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::AccountLoggedOut { code: -100 }));

    let err = fx.manager.request("wxid_short", SILENT_CMD, vec![1]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout));

    // The link survives both.
    assert_eq!(fx.manager.state("wxid_short"), ConnectionState::Connected);
}

#[tokio::test]
async fn heartbeats_are_sent_on_the_interval() {
    let mut config = link_config();
    config.long_link.heartbeat_interval = Duration::from_millis(100);
    let fx = fixture("wxid_hb", config).await;
    let server = fx.connect("wxid_hb", fx.server_session.clone()).await;
    fx.manager.connect("wxid_hb").await.unwrap();

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(server.heartbeats.load(Ordering::SeqCst) >= 2);
    assert_eq!(fx.manager.state("wxid_hb"), ConnectionState::Connected);
}

#[tokio::test]
async fn connect_without_session_is_not_found() {
    let config = Arc::new(link_config());
    let store = SessionStore::memory();
    store
        .put(&account("wxid_nosess"), "wxid_nosess", mmtls_client::store::TtlPolicy::Permanent)
        .unwrap();
    let manager = ConnectionManager::start(config, store);
    assert!(matches!(
        manager.connect("wxid_nosess").await,
        Err(ProtocolError::NotFound(_))
    ));
    assert_eq!(manager.state("wxid_nosess"), ConnectionState::Disconnected);
}

#[tokio::test]
async fn dropped_connect_releases_the_account() {
    let fx = fixture("wxid_drop", link_config()).await;
    fx.point_at("wxid_drop", spawn_mute_server().await);

    let attempt = tokio::time::timeout(Duration::from_millis(100), fx.manager.connect("wxid_drop")).await;
    assert!(attempt.is_err());
    assert_eq!(fx.manager.state("wxid_drop"), ConnectionState::Disconnected);

    let _server = fx.connect("wxid_drop", fx.server_session.clone()).await;
    fx.manager.connect("wxid_drop").await.unwrap();
    assert_eq!(fx.manager.state("wxid_drop"), ConnectionState::Connected);

    let options = SendOptions::new(Route::new(522, "/cgi-bin/micromsg-bin/echo")).over_long_link();
    let reply = fx.dispatcher.send("wxid_drop", b"after timeout", &options).await.unwrap();
    assert_eq!(reply, b"after timeout");
}

#[tokio::test]
async fn close_cancels_an_in_flight_connect() {
    let fx = fixture("wxid_cancel", link_config()).await;
    fx.point_at("wxid_cancel", spawn_mute_server().await);

    let manager = fx.manager.clone();
    let attempt = tokio::spawn(async move { manager.connect("wxid_cancel").await });
    fx.wait_for_state("wxid_cancel", ConnectionState::Connecting).await;

    fx.manager.close("wxid_cancel").await.unwrap();
    assert_eq!(fx.manager.state("wxid_cancel"), ConnectionState::Disconnected);

    let result = tokio::time::timeout(WAIT, attempt).await.unwrap().unwrap();
    assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    assert_eq!(fx.manager.state("wxid_cancel"), ConnectionState::Disconnected);
}

#[tokio::test]
async fn logout_during_connect_leaves_no_link() {
    let fx = fixture("wxid_logout", link_config()).await;
    fx.point_at("wxid_logout", spawn_mute_server().await);

    let manager = fx.manager.clone();
    let attempt = tokio::spawn(async move { manager.connect("wxid_logout").await });
    fx.wait_for_state("wxid_logout", ConnectionState::Connecting).await;

    fx.dispatcher.logout("wxid_logout").await.unwrap();
    assert!(tokio::time::timeout(WAIT, attempt).await.unwrap().unwrap().is_err());
    assert_eq!(fx.manager.state("wxid_logout"), ConnectionState::Disconnected);
}

#[tokio::test]
async fn oversized_request_leaves_the_link_usable() {
    let fx = fixture("wxid_big", link_config()).await;
    let _server = fx.connect("wxid_big", fx.server_session.clone()).await;
    fx.manager.connect("wxid_big").await.unwrap();

    let options = SendOptions::new(Route::new(522, "/cgi-bin/micromsg-bin/echo")).over_long_link();
    assert_eq!(fx.dispatcher.send("wxid_big", b"before", &options).await.unwrap(), b"before");

    let err = fx.manager.request("wxid_big", 522, vec![0u8; 70_000]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::OversizedPacket(len) if len > 70_000));

    assert_eq!(fx.dispatcher.send("wxid_big", b"after", &options).await.unwrap(), b"after");
    assert_eq!(fx.manager.state("wxid_big"), ConnectionState::Connected);
}
