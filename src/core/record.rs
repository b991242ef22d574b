//! Long-link record framing.
//!
//! ```text
//! [type(1)] [0xF1 0x03] [length(2, BE)] [payload(length)]
//! ```
//!
//! Application records carry an encrypted [`LinkMessage`]:
//!
//! ```text
//! [total_len(4)] [header_len(2)=16] [version(2)=1] [cmd_id(4)] [seq(4)] [body]
//! ```

use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Record header length
pub const RECORD_HEADER_LEN: usize = 5;

/// Version bytes following the record type
pub const RECORD_VERSION: [u8; 2] = [0xF1, 0x03];

/// Inner wrapper header length
pub const WRAPPER_HEADER_LEN: usize = 16;

/// Inner wrapper version
pub const WRAPPER_VERSION: u16 = 1;

/// Heartbeat command
pub const CMD_HEARTBEAT: u32 = 6;

/// Server notification that new sync data is available
pub const CMD_SYNC_NOTIFY: u32 = 24;

/// Responses carry the request command plus this offset
pub const RESPONSE_CMD_OFFSET: u32 = 1_000_000_000;

/// Record content type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Alert = 0x15,
    Handshake = 0x16,
    ApplicationData = 0x17,
}

impl TryFrom<u8> for RecordType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x15 => Ok(RecordType::Alert),
            0x16 => Ok(RecordType::Handshake),
            0x17 => Ok(RecordType::ApplicationData),
            _ => Err(ProtocolError::TransportError(constants::ERR_BAD_RECORD.into())),
        }
    }
}

/// One framed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_type: RecordType,
    pub payload: Bytes,
}

impl Record {
    pub fn new(record_type: RecordType, payload: impl Into<Bytes>) -> Self {
        Self {
            record_type,
            payload: payload.into(),
        }
    }

    /// Header bytes for a record of `len` payload bytes. Used as AEAD associated data.
    ///
    /// A length that does not fit the 2-byte field is `OversizedPacket`.
    pub fn header_bytes(record_type: RecordType, len: usize) -> Result<[u8; RECORD_HEADER_LEN]> {
        let len = u16::try_from(len)
            .map_err(|_| ProtocolError::OversizedPacket(len))?
            .to_be_bytes();
        Ok([
            record_type as u8,
            RECORD_VERSION[0],
            RECORD_VERSION[1],
            len[0],
            len[1],
        ])
    }
}

/// tokio-util codec for long-link records
#[derive(Debug, Clone, Copy)]
pub struct LinkCodec {
    max_record_size: usize,
}

impl LinkCodec {
    pub fn new(max_record_size: usize) -> Self {
        Self {
            max_record_size: max_record_size.min(u16::MAX as usize),
        }
    }
}

impl Default for LinkCodec {
    fn default() -> Self {
        Self::new(u16::MAX as usize)
    }
}

impl Decoder for LinkCodec {
    type Item = Record;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Record>> {
        if src.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }

        let record_type = RecordType::try_from(src[0])?;
        if src[1..3] != RECORD_VERSION {
            warn!(version = ?&src[1..3], "Unexpected record version");
            return Err(ProtocolError::TransportError(constants::ERR_BAD_RECORD.into()));
        }

        let len = u16::from_be_bytes([src[3], src[4]]) as usize;
        if len > self.max_record_size {
            return Err(ProtocolError::OversizedPacket(len));
        }

        if src.len() < RECORD_HEADER_LEN + len {
            src.reserve(RECORD_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(RECORD_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Record {
            record_type,
            payload,
        }))
    }
}

impl Encoder<Record> for LinkCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Record, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > self.max_record_size {
            return Err(ProtocolError::OversizedPacket(item.payload.len()));
        }
        let header = Record::header_bytes(item.record_type, item.payload.len())?;
        dst.reserve(RECORD_HEADER_LEN + item.payload.len());
        dst.put_slice(&header);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// Command-addressed message inside an application record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMessage {
    pub cmd_id: u32,
    pub sequence: u32,
    pub body: Bytes,
}

impl LinkMessage {
    pub fn new(cmd_id: u32, sequence: u32, body: impl Into<Bytes>) -> Self {
        Self {
            cmd_id,
            sequence,
            body: body.into(),
        }
    }

    /// True for a server response to a client request
    pub fn is_response(&self) -> bool {
        self.cmd_id >= RESPONSE_CMD_OFFSET
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let total = WRAPPER_HEADER_LEN + self.body.len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(total as u32);
        buf.put_u16(WRAPPER_HEADER_LEN as u16);
        buf.put_u16(WRAPPER_VERSION);
        buf.put_u32(self.cmd_id);
        buf.put_u32(self.sequence);
        buf.put_slice(&self.body);
        buf.to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < WRAPPER_HEADER_LEN {
            return Err(ProtocolError::TransportError(constants::ERR_BAD_RECORD.into()));
        }
        let mut cur = data;
        let total = cur.get_u32() as usize;
        let header_len = cur.get_u16() as usize;
        let _version = cur.get_u16();
        let cmd_id = cur.get_u32();
        let sequence = cur.get_u32();

        if total != data.len() || header_len != WRAPPER_HEADER_LEN {
            return Err(ProtocolError::TransportError(constants::ERR_BAD_RECORD.into()));
        }

        Ok(Self {
            cmd_id,
            sequence,
            body: Bytes::copy_from_slice(cur),
        })
    }
}
