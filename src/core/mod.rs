//! # Core Protocol Components
//!
//! Wire formats for both transports.
//!
//! ## Components
//! - **Packet**: business packet header layout, checksum, header-only parse
//! - **Codec**: `PacketCodec`, which frames, compresses, encrypts and decodes payloads
//! - **Record**: long-link record framing as a tokio codec, plus the inner wrapper
//!
//! ## Security
//! - Checksum is validated before any field is trusted
//! - Declared lengths must match the buffer exactly
//! - Unknown compress, encrypt and record types are rejected

pub mod codec;
pub mod packet;
pub mod record;
