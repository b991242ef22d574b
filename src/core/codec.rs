//! PacketCodec: frames, compresses, encrypts and checksums application payloads.
//!
//! Client direction:
//! - [`PacketCodec::encode`] builds a request under the encrypt type the caller picks.
//! - [`PacketCodec::decode`] opens a response with the key schedule chosen by the
//!   route table, never by a flag on the wire.
//!
//! Peer direction ([`PacketCodec::decode_request`], [`PacketCodec::encode_response`])
//! exists for mock servers and tests.

use crate::config::{ClientConfig, DecodeVariant, ReturnCodeTable, RouteEntry};
use crate::core::packet::{
    parse_header, seal_checksum, CompressType, EncryptType, PacketHeader, END_FLAG, RUN_STATE,
};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::key_exchange::{KeyPair, PUBLIC_KEY_LEN};
use crate::protocol::status;
use crate::session::Session;
use crate::utils::compression;
use crate::utils::crypto::{self, sha256};
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

const HYBRID_INFO: &[u8] = b"hybrid ecdh key expansion";

/// Per-request encode parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestMeta {
    /// CGI id written into the route field
    pub route: u32,
    pub encrypt_type: EncryptType,
    /// zlib-compress the payload before encryption
    pub compress: bool,
}

impl RequestMeta {
    pub fn new(route: u32, encrypt_type: EncryptType) -> Self {
        Self {
            route,
            encrypt_type,
            compress: false,
        }
    }

    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }
}

/// Output of [`PacketCodec::encode`]
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    /// Sequence id assigned to this request
    pub sequence: u32,
}

/// Output of a successful decode
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl DecodedFrame {
    /// Cookie carried by the frame, possibly rotated by the server
    pub fn cookie(&self) -> &[u8] {
        &self.header.cookie
    }
}

/// Stateless codec configured from [`ClientConfig`]
#[derive(Debug, Clone)]
pub struct PacketCodec {
    client_version: u32,
    device_type: u8,
    encode_version: u32,
    hybrid_key_version: u8,
    hybrid_server_public: Vec<u8>,
    routes: Vec<RouteEntry>,
    return_codes: ReturnCodeTable,
    max_payload_size: usize,
    compression_level: u32,
}

impl PacketCodec {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            client_version: config.protocol.client_version,
            device_type: config.protocol.device_type,
            encode_version: config.protocol.encode_version,
            hybrid_key_version: config.protocol.hybrid_key_version,
            hybrid_server_public: config.protocol.hybrid_server_public_key()?,
            routes: config.routes.clone(),
            return_codes: config.return_codes.clone(),
            max_payload_size: config.transport.max_payload_size,
            compression_level: config.transport.compression_level,
        })
    }

    /// Decode variant for `route`; unlisted routes are legacy
    pub fn route_variant(&self, route: u32) -> DecodeVariant {
        self.routes
            .iter()
            .find(|entry| entry.cgi == route)
            .map(|entry| entry.variant)
            .unwrap_or(DecodeVariant::Legacy)
    }

    /// Encrypt type a request on `route` uses unless the caller overrides it
    pub fn default_encrypt_type(&self, route: u32) -> EncryptType {
        match self.route_variant(route) {
            DecodeVariant::Aead => EncryptType::SessionAead,
            DecodeVariant::Legacy => EncryptType::SessionCbc,
        }
    }

    /// Return-code table used to classify error frames
    pub fn return_codes(&self) -> &ReturnCodeTable {
        &self.return_codes
    }

    /// Validate framing without key material
    pub fn parse_header(frame: &[u8]) -> Result<PacketHeader> {
        parse_header(frame)
    }

    /// Frame one request. Advances the session's sequence counter.
    pub fn encode(
        &self,
        payload: &[u8],
        session: &mut Session,
        meta: &RequestMeta,
    ) -> Result<EncodedFrame> {
        let sequence = session.next_sequence();
        let (plain, compress_type) = self.compress_payload(payload, meta.compress)?;

        let body = match meta.encrypt_type {
            EncryptType::Plain => plain.to_vec(),
            EncryptType::SessionCbc => crypto::cbc_encrypt(&session.session_key, &plain)?,
            EncryptType::SessionAead => crypto::gcm_seal(&session.client_session_key, &plain)?,
            EncryptType::Hybrid => {
                let local = session.hybrid_key_pair()?;
                let key = hybrid_key(&local, &self.hybrid_server_public)?;
                let mut body = local.public_key().to_vec();
                body.extend(crypto::gcm_seal(key.as_slice(), &plain)?);
                body
            }
        };

        let header = PacketHeader {
            header_len: 0,
            compress_type,
            encrypt_type: meta.encrypt_type,
            server_version: session.client_version,
            uin: session.uin,
            cookie: session.cookie.clone(),
            sequence,
            route: meta.route,
            uncompressed_len: payload.len() as u32,
            compressed_len: plain.len() as u32,
            encode_version: self.encode_version,
            device_type: self.device_type,
            checksum: 0,
            run_state: RUN_STATE,
            request_code: request_code(payload),
            end_flag: END_FLAG,
            hybrid_key_version: session.hybrid_key_version,
        };

        let bytes = assemble(&header, &body)?;
        trace!(
            route = meta.route,
            seq = sequence,
            encrypt = ?meta.encrypt_type,
            payload_len = payload.len(),
            frame_len = bytes.len(),
            "Encoded request frame"
        );
        Ok(EncodedFrame { bytes, sequence })
    }

    /// Decode a response for `route`.
    ///
    /// Short frames are error frames and are classified through the return-code
    /// table. Error frames carry no checksum, so this check runs first.
    pub fn decode(&self, frame: &[u8], session: &Session, route: u32) -> Result<DecodedFrame> {
        if status::is_error_frame(frame) {
            let err = status::classify_error_frame(&self.return_codes, frame);
            debug!(route, frame_len = frame.len(), error = %err, "Error frame received");
            return Err(err);
        }

        let header = parse_header(frame)?;
        let expected = self.default_encrypt_type(route);
        if header.encrypt_type != expected {
            warn!(route, got = ?header.encrypt_type, ?expected, "Response encrypt type mismatch");
            return Err(ProtocolError::FrameCorrupt(constants::ERR_ROUTE_VARIANT.into()));
        }

        let body = &frame[header.header_len as usize..];
        let plain = match expected {
            EncryptType::SessionAead => crypto::gcm_open(&session.server_session_key, body)?,
            _ => crypto::cbc_decrypt(&session.session_key, body)?,
        };
        let payload = self.finish_decode(&header, plain)?;

        trace!(route, seq = header.sequence, payload_len = payload.len(), "Decoded response frame");
        Ok(DecodedFrame { header, payload })
    }

    /// Peer side: decode a client request using the peer's copy of the session.
    /// `hybrid_server` is the peer's long-term key for hybrid requests.
    pub fn decode_request(
        &self,
        frame: &[u8],
        session: &Session,
        hybrid_server: Option<&KeyPair>,
    ) -> Result<DecodedFrame> {
        let header = parse_header(frame)?;
        let body = &frame[header.header_len as usize..];

        let plain = match header.encrypt_type {
            EncryptType::Plain => body.to_vec(),
            EncryptType::SessionCbc => crypto::cbc_decrypt(&session.session_key, body)?,
            EncryptType::SessionAead => crypto::gcm_open(&session.client_session_key, body)?,
            EncryptType::Hybrid => {
                let server = hybrid_server.ok_or_else(|| {
                    ProtocolError::Crypto(constants::ERR_MISSING_HYBRID_KEY.into())
                })?;
                let (client_public, sealed) = body.split_at(PUBLIC_KEY_LEN);
                let key = hybrid_key(server, client_public)?;
                crypto::gcm_open(key.as_slice(), sealed)?
            }
        };
        let payload = self.finish_decode(&header, plain)?;
        Ok(DecodedFrame { header, payload })
    }

    /// Peer side: frame a response to the request with `sequence` on `route`
    pub fn encode_response(
        &self,
        payload: &[u8],
        session: &Session,
        route: u32,
        sequence: u32,
        compress: bool,
    ) -> Result<Vec<u8>> {
        let (plain, compress_type) = self.compress_payload(payload, compress)?;
        let encrypt_type = self.default_encrypt_type(route);
        let body = match encrypt_type {
            EncryptType::SessionAead => crypto::gcm_seal(&session.server_session_key, &plain)?,
            _ => crypto::cbc_encrypt(&session.session_key, &plain)?,
        };

        let header = PacketHeader {
            header_len: 0,
            compress_type,
            encrypt_type,
            server_version: self.client_version,
            uin: session.uin,
            cookie: session.cookie.clone(),
            sequence,
            route,
            uncompressed_len: payload.len() as u32,
            compressed_len: plain.len() as u32,
            encode_version: self.encode_version,
            device_type: self.device_type,
            checksum: 0,
            run_state: RUN_STATE,
            request_code: request_code(payload),
            end_flag: END_FLAG,
            hybrid_key_version: self.hybrid_key_version,
        };
        assemble(&header, &body)
    }

    fn compress_payload(&self, payload: &[u8], compress: bool) -> Result<(Vec<u8>, CompressType)> {
        if payload.len() > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(payload.len()));
        }
        let (plain, applied) =
            compression::maybe_compress(payload, compress, self.compression_level)?;
        let compress_type = if applied {
            CompressType::Zlib
        } else {
            CompressType::Uncompressed
        };
        Ok((plain, compress_type))
    }

    fn finish_decode(&self, header: &PacketHeader, plain: Vec<u8>) -> Result<Vec<u8>> {
        if plain.len() != header.compressed_len as usize {
            return Err(ProtocolError::FrameCorrupt(constants::ERR_BODY_LENGTH.into()));
        }
        let declared = header.uncompressed_len as usize;
        if declared > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(declared));
        }
        let payload = compression::maybe_decompress(
            &plain,
            header.compress_type == CompressType::Zlib,
            declared,
        )?;
        if payload.len() != declared {
            return Err(ProtocolError::FrameCorrupt(
                constants::ERR_UNCOMPRESSED_LENGTH.into(),
            ));
        }
        Ok(payload)
    }
}

/// First four bytes of SHA-256 over the plaintext payload
fn request_code(payload: &[u8]) -> u32 {
    let digest = sha256(&[payload]);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn hybrid_key(local: &KeyPair, remote_public: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let shared = local.shared_secret(remote_public)?;
    let mut key = Zeroizing::new([0u8; 32]);
    crypto::hkdf_expand(&[], shared.as_slice(), HYBRID_INFO, key.as_mut_slice())?;
    Ok(key)
}

fn assemble(header: &PacketHeader, body: &[u8]) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(header.encoded_len() + body.len());
    header.write(&mut buf)?;
    buf.put_slice(body);
    let mut frame = buf.to_vec();
    seal_checksum(&mut frame)?;
    Ok(frame)
}
