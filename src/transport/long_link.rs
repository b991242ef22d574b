//! # Long-Link Records
//!
//! Record protection and the hello exchange for the persistent TCP channel.
//!
//! ## Hello
//! ```text
//! client ── Handshake record: LinkHello { account, uin, cookie, client_random } ──► server
//! client ◄── Handshake record: LinkHelloAck { status, server_random } ──────────── server
//! ```
//! Both sides then derive [`LinkKeys`] from the account's session keys and the
//! two randoms. Every later record is application data sealed with AES-128-GCM.
//!
//! ## Record protection
//! - nonce: direction IV with its last 4 bytes XORed with the record sequence
//! - AAD: sequence (u64 BE) followed by the 5-byte record header
//! - sequence: per direction, starting at 0

use crate::core::record::{LinkMessage, Record, RecordType, RECORD_HEADER_LEN, WRAPPER_HEADER_LEN};
use crate::error::{constants, ProtocolError, Result};
use crate::session::Session;
use crate::utils::crypto::{self, GCM_NONCE_LEN, GCM_TAG_LEN};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const LINK_KEY_INFO: &[u8] = b"long link key expansion";
const LINK_KEY_LEN: usize = 16;
const LINK_OKM_LEN: usize = 2 * LINK_KEY_LEN + 2 * GCM_NONCE_LEN;

/// First record sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHello {
    pub account_id: String,
    pub uin: u32,
    pub cookie: Vec<u8>,
    pub client_random: [u8; 32],
}

/// Server answer to [`LinkHello`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHelloAck {
    /// Zero on acceptance, otherwise a return code
    pub status: i32,
    pub server_random: [u8; 32],
}

/// Per-direction record keys
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct LinkKeys {
    client_key: [u8; LINK_KEY_LEN],
    server_key: [u8; LINK_KEY_LEN],
    client_iv: [u8; GCM_NONCE_LEN],
    server_iv: [u8; GCM_NONCE_LEN],
}

impl LinkKeys {
    /// HKDF over the session's AEAD keys, salted with both hello randoms
    pub fn derive(session: &Session, client_random: &[u8; 32], server_random: &[u8; 32]) -> Result<Self> {
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(client_random);
        salt[32..].copy_from_slice(server_random);

        let mut ikm = Zeroizing::new(Vec::with_capacity(64));
        ikm.extend_from_slice(&session.client_session_key);
        ikm.extend_from_slice(&session.server_session_key);

        let mut okm = Zeroizing::new([0u8; LINK_OKM_LEN]);
        crypto::hkdf_expand(&salt, &ikm, LINK_KEY_INFO, okm.as_mut_slice())?;

        let mut keys = LinkKeys {
            client_key: [0u8; LINK_KEY_LEN],
            server_key: [0u8; LINK_KEY_LEN],
            client_iv: [0u8; GCM_NONCE_LEN],
            server_iv: [0u8; GCM_NONCE_LEN],
        };
        keys.client_key.copy_from_slice(&okm[..16]);
        keys.server_key.copy_from_slice(&okm[16..32]);
        keys.client_iv.copy_from_slice(&okm[32..44]);
        keys.server_iv.copy_from_slice(&okm[44..]);
        Ok(keys)
    }
}

/// Which end of the link a cipher serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct DirectionState {
    key: [u8; LINK_KEY_LEN],
    iv: [u8; GCM_NONCE_LEN],
    sequence: u64,
}

impl DirectionState {
    fn new(key: &[u8; LINK_KEY_LEN], iv: &[u8; GCM_NONCE_LEN]) -> Self {
        Self {
            key: *key,
            iv: *iv,
            sequence: 0,
        }
    }

    fn nonce(&self) -> [u8; GCM_NONCE_LEN] {
        let mut nonce = self.iv;
        let seq = (self.sequence as u32).to_be_bytes();
        for (byte, s) in nonce[GCM_NONCE_LEN - 4..].iter_mut().zip(seq) {
            *byte ^= s;
        }
        nonce
    }

    fn aad(&self, sealed_len: usize) -> Result<[u8; 8 + RECORD_HEADER_LEN]> {
        let mut aad = [0u8; 8 + RECORD_HEADER_LEN];
        aad[..8].copy_from_slice(&self.sequence.to_be_bytes());
        aad[8..].copy_from_slice(&Record::header_bytes(RecordType::ApplicationData, sealed_len)?);
        Ok(aad)
    }
}

/// Record payload length once a message with `body_len` body bytes is sealed
pub fn sealed_len(body_len: usize) -> usize {
    WRAPPER_HEADER_LEN + body_len + GCM_TAG_LEN
}

/// Seals outgoing application records
pub struct LinkSealer {
    state: DirectionState,
    max_record_size: usize,
}

/// Opens incoming application records
pub struct LinkOpener {
    state: DirectionState,
}

/// Build both halves of the record cipher for `role`
pub fn link_ciphers(keys: &LinkKeys, role: Role) -> (LinkSealer, LinkOpener) {
    let client = DirectionState::new(&keys.client_key, &keys.client_iv);
    let server = DirectionState::new(&keys.server_key, &keys.server_iv);
    match role {
        Role::Client => (LinkSealer::new(client), LinkOpener { state: server }),
        Role::Server => (LinkSealer::new(server), LinkOpener { state: client }),
    }
}

impl LinkSealer {
    fn new(state: DirectionState) -> Self {
        Self {
            state,
            max_record_size: u16::MAX as usize,
        }
    }

    /// Refuse records larger than `max_record_size` (capped at the 2-byte length field)
    pub fn with_record_limit(mut self, max_record_size: usize) -> Self {
        self.max_record_size = max_record_size.min(u16::MAX as usize);
        self
    }

    /// Seal `message` as the next record in this direction.
    ///
    /// An oversized message is refused before the sequence advances, so the
    /// peer's opener stays in step.
    pub fn seal(&mut self, message: &LinkMessage) -> Result<Record> {
        let len = sealed_len(message.body.len());
        if len > self.max_record_size {
            return Err(ProtocolError::OversizedPacket(len));
        }
        let plain = Zeroizing::new(message.to_bytes());
        let aad = self.state.aad(len)?;
        let sealed = crypto::record_seal(&self.state.key, &self.state.nonce(), &aad, &plain)?;
        trace!(seq = self.state.sequence, cmd = message.cmd_id, "Sealed link record");
        self.state.sequence += 1;
        Ok(Record::new(RecordType::ApplicationData, sealed))
    }
}

impl LinkOpener {
    pub fn open(&mut self, record: &Record) -> Result<LinkMessage> {
        if record.record_type != RecordType::ApplicationData {
            return Err(ProtocolError::TransportError(constants::ERR_BAD_RECORD.into()));
        }
        let aad = self.state.aad(record.payload.len())?;
        let plain = crypto::record_open(&self.state.key, &self.state.nonce(), &aad, &record.payload)?;
        self.state.sequence += 1;
        LinkMessage::from_bytes(&plain)
    }
}

async fn next_handshake_record<R>(reader: &mut R) -> Result<Record>
where
    R: Stream<Item = Result<Record>> + Unpin,
{
    let record = reader.next().await.ok_or(ProtocolError::ConnectionClosed)??;
    match record.record_type {
        RecordType::Handshake => Ok(record),
        RecordType::Alert => Err(ProtocolError::ConnectionClosed),
        RecordType::ApplicationData => {
            Err(ProtocolError::TransportError(constants::ERR_BAD_RECORD.into()))
        }
    }
}

/// Client side: send `hello` and wait for the server's answer
pub async fn client_hello<R, W>(reader: &mut R, writer: &mut W, hello: &LinkHello) -> Result<LinkHelloAck>
where
    R: Stream<Item = Result<Record>> + Unpin,
    W: Sink<Record, Error = ProtocolError> + Unpin,
{
    writer
        .send(Record::new(RecordType::Handshake, bincode::serialize(hello)?))
        .await?;
    let record = next_handshake_record(reader).await?;
    let ack: LinkHelloAck = bincode::deserialize(&record.payload)?;
    debug!(account = %hello.account_id, status = ack.status, "Link hello answered");
    Ok(ack)
}

/// Server side: read the client's hello
pub async fn read_hello<R>(reader: &mut R) -> Result<LinkHello>
where
    R: Stream<Item = Result<Record>> + Unpin,
{
    let record = next_handshake_record(reader).await?;
    Ok(bincode::deserialize(&record.payload)?)
}

/// Server side: accept `hello` for `session` and return the server's ciphers
pub async fn accept_hello<W>(writer: &mut W, hello: &LinkHello, session: &Session) -> Result<(LinkSealer, LinkOpener)>
where
    W: Sink<Record, Error = ProtocolError> + Unpin,
{
    let ack = LinkHelloAck {
        status: 0,
        server_random: crypto::random_bytes::<32>(),
    };
    writer
        .send(Record::new(RecordType::Handshake, bincode::serialize(&ack)?))
        .await?;
    let keys = LinkKeys::derive(session, &hello.client_random, &ack.server_random)?;
    Ok(link_ciphers(&keys, Role::Server))
}

/// Server side: refuse the hello with `status`
pub async fn reject_hello<W>(writer: &mut W, status: i32) -> Result<()>
where
    W: Sink<Record, Error = ProtocolError> + Unpin,
{
    let ack = LinkHelloAck {
        status,
        server_random: [0u8; 32],
    };
    writer
        .send(Record::new(RecordType::Handshake, bincode::serialize(&ack)?))
        .await
}
