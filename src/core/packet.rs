//! Packet header layout.
//!
//! All integers are big-endian. `n` is the cookie length, carried in the low
//! nibble of the encode byte.
//!
//! ```text
//! off   size  field
//! 0     1     signature 0xBF
//! 1     1     header length (44 + n)
//! 2     1     compress type (1 zlib, 2 none)
//! 3     1     encrypt type << 4 | n
//! 4     4     server version
//! 8     4     uin
//! 12    n     cookie
//! 12+n  4     sequence id
//! 16+n  4     route id
//! 20+n  4     uncompressed length
//! 24+n  4     compressed length
//! 28+n  4     encode version
//! 32+n  1     device type
//! 33+n  4     checksum (CRC-32 of the frame with this field zeroed)
//! 37+n  1     run state 0xFF
//! 38+n  4     request code
//! 42+n  1     end flag
//! 43+n  1     hybrid key version
//! 44+n  ...   body
//! ```

use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{cbc_padded_len, GCM_OVERHEAD};
use crate::protocol::key_exchange::PUBLIC_KEY_LEN;
use bytes::{Buf, BufMut, BytesMut};

/// First byte of every frame
pub const SIGNATURE: u8 = 0xBF;

/// Header length without the cookie
pub const FIXED_HEADER_LEN: usize = 44;

/// Cookie length is a 4-bit field
pub const MAX_COOKIE_LEN: usize = 15;

/// Run-state byte written by the client
pub const RUN_STATE: u8 = 0xFF;

/// End-flag byte
pub const END_FLAG: u8 = 0x00;

const CHECKSUM_BASE: usize = 33;

/// Payload compression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressType {
    Zlib = 1,
    Uncompressed = 2,
}

impl TryFrom<u8> for CompressType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(CompressType::Zlib),
            2 => Ok(CompressType::Uncompressed),
            other => Err(ProtocolError::UnknownCompressType(other)),
        }
    }
}

/// Body encryption mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncryptType {
    /// No encryption
    Plain = 0,
    /// AES-128-CBC under the session key
    SessionCbc = 5,
    /// AES-256-GCM keyed by ECDH with the server's hybrid key
    Hybrid = 12,
    /// AES-256-GCM under a session AEAD key
    SessionAead = 13,
}

impl TryFrom<u8> for EncryptType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EncryptType::Plain),
            5 => Ok(EncryptType::SessionCbc),
            12 => Ok(EncryptType::Hybrid),
            13 => Ok(EncryptType::SessionAead),
            other => Err(ProtocolError::UnknownEncodeType(other)),
        }
    }
}

impl EncryptType {
    /// Body length produced for `compressed_len` bytes of plaintext
    pub fn body_len(self, compressed_len: usize) -> usize {
        match self {
            EncryptType::Plain => compressed_len,
            EncryptType::SessionCbc => cbc_padded_len(compressed_len),
            EncryptType::SessionAead => compressed_len + GCM_OVERHEAD,
            EncryptType::Hybrid => PUBLIC_KEY_LEN + compressed_len + GCM_OVERHEAD,
        }
    }
}

/// Per-message envelope metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub header_len: u8,
    pub compress_type: CompressType,
    pub encrypt_type: EncryptType,
    pub server_version: u32,
    pub uin: u32,
    pub cookie: Vec<u8>,
    pub sequence: u32,
    pub route: u32,
    pub uncompressed_len: u32,
    pub compressed_len: u32,
    pub encode_version: u32,
    pub device_type: u8,
    pub checksum: u32,
    pub run_state: u8,
    pub request_code: u32,
    pub end_flag: u8,
    pub hybrid_key_version: u8,
}

impl PacketHeader {
    /// Encoded header length including the cookie
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.cookie.len()
    }

    /// Write the header with a zero checksum; [`seal_checksum`] fills it in.
    pub fn write(&self, buf: &mut BytesMut) -> Result<()> {
        if self.cookie.len() > MAX_COOKIE_LEN {
            return Err(ProtocolError::FrameCorrupt(constants::ERR_COOKIE_TOO_LONG.into()));
        }
        buf.reserve(self.encoded_len());
        buf.put_u8(SIGNATURE);
        buf.put_u8(self.encoded_len() as u8);
        buf.put_u8(self.compress_type as u8);
        buf.put_u8(((self.encrypt_type as u8) << 4) | self.cookie.len() as u8);
        buf.put_u32(self.server_version);
        buf.put_u32(self.uin);
        buf.put_slice(&self.cookie);
        buf.put_u32(self.sequence);
        buf.put_u32(self.route);
        buf.put_u32(self.uncompressed_len);
        buf.put_u32(self.compressed_len);
        buf.put_u32(self.encode_version);
        buf.put_u8(self.device_type);
        buf.put_u32(0);
        buf.put_u8(self.run_state);
        buf.put_u32(self.request_code);
        buf.put_u8(self.end_flag);
        buf.put_u8(self.hybrid_key_version);
        Ok(())
    }
}

fn corrupt(msg: &str) -> ProtocolError {
    ProtocolError::FrameCorrupt(msg.into())
}

fn checksum_offset(cookie_len: usize) -> usize {
    CHECKSUM_BASE + cookie_len
}

/// CRC-32 of `frame` with the 4 checksum bytes treated as zero
fn frame_checksum(frame: &[u8], offset: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame[..offset]);
    hasher.update(&[0u8; 4]);
    hasher.update(&frame[offset + 4..]);
    hasher.finalize()
}

/// Compute and store the checksum of a fully assembled frame
pub fn seal_checksum(frame: &mut [u8]) -> Result<()> {
    if frame.len() < FIXED_HEADER_LEN {
        return Err(corrupt(constants::ERR_TRUNCATED_HEADER));
    }
    let cookie_len = (frame[3] & 0x0f) as usize;
    let offset = checksum_offset(cookie_len);
    if frame.len() < FIXED_HEADER_LEN + cookie_len {
        return Err(corrupt(constants::ERR_TRUNCATED_HEADER));
    }
    let crc = frame_checksum(frame, offset);
    frame[offset..offset + 4].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Header-only parse.
///
/// Checks, in order: minimum length, signature, checksum, declared header
/// length, compress and encrypt types, and that the body length matches what
/// the header declares. No key material is needed.
pub fn parse_header(frame: &[u8]) -> Result<PacketHeader> {
    if frame.len() < FIXED_HEADER_LEN {
        return Err(corrupt(constants::ERR_TRUNCATED_HEADER));
    }
    if frame[0] != SIGNATURE {
        return Err(corrupt(constants::ERR_BAD_SIGNATURE));
    }

    let cookie_len = (frame[3] & 0x0f) as usize;
    let header_len = FIXED_HEADER_LEN + cookie_len;
    if frame.len() < header_len {
        return Err(corrupt(constants::ERR_TRUNCATED_HEADER));
    }

    let offset = checksum_offset(cookie_len);
    let stored = u32::from_be_bytes([
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    ]);
    if stored != frame_checksum(frame, offset) {
        return Err(corrupt(constants::ERR_CHECKSUM_MISMATCH));
    }

    if frame[1] as usize != header_len {
        return Err(corrupt(constants::ERR_HEADER_LENGTH));
    }

    let mut cur = &frame[2..header_len];
    let compress_type = CompressType::try_from(cur.get_u8())?;
    let encrypt_type = EncryptType::try_from(cur.get_u8() >> 4)?;
    let server_version = cur.get_u32();
    let uin = cur.get_u32();
    let cookie = cur[..cookie_len].to_vec();
    cur.advance(cookie_len);

    let header = PacketHeader {
        header_len: header_len as u8,
        compress_type,
        encrypt_type,
        server_version,
        uin,
        cookie,
        sequence: cur.get_u32(),
        route: cur.get_u32(),
        uncompressed_len: cur.get_u32(),
        compressed_len: cur.get_u32(),
        encode_version: cur.get_u32(),
        device_type: cur.get_u8(),
        checksum: cur.get_u32(),
        run_state: cur.get_u8(),
        request_code: cur.get_u32(),
        end_flag: cur.get_u8(),
        hybrid_key_version: cur.get_u8(),
    };

    let body_len = frame.len() - header_len;
    if body_len != encrypt_type.body_len(header.compressed_len as usize) {
        return Err(corrupt(constants::ERR_BODY_LENGTH));
    }
    if compress_type == CompressType::Uncompressed
        && header.compressed_len != header.uncompressed_len
    {
        return Err(corrupt(constants::ERR_UNCOMPRESSED_LENGTH));
    }

    Ok(header)
}
