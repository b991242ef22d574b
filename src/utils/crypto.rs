//! Symmetric primitives used by the packet codec and the long-link record layer.
//!
//! - AES-128-CBC with PKCS#7 padding (legacy mode, IV equals key)
//! - AES-256-GCM bodies laid out as `ciphertext || nonce || tag`
//! - AES-128-GCM records with caller-supplied nonce and associated data
//! - HKDF-SHA256 and HMAC-SHA256

use crate::error::{constants, ProtocolError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// AES-GCM nonce length
pub const GCM_NONCE_LEN: usize = 12;

/// AES-GCM tag length
pub const GCM_TAG_LEN: usize = 16;

/// Bytes an AEAD body adds on top of its plaintext
pub const GCM_OVERHEAD: usize = GCM_NONCE_LEN + GCM_TAG_LEN;

/// AES block size
pub const AES_BLOCK: usize = 16;

/// Fill a fixed-size array from the OS RNG
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// SHA-256 over the concatenation of `parts`
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Length of a PKCS#7 padded CBC ciphertext for `len` plaintext bytes
pub fn cbc_padded_len(len: usize) -> usize {
    (len / AES_BLOCK + 1) * AES_BLOCK
}

/// AES-128-CBC encrypt with the key doubling as IV
pub fn cbc_encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128CbcEnc::new_from_slices(key, key)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_KEY_LENGTH.into()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// AES-128-CBC decrypt with the key doubling as IV
pub fn cbc_decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128CbcDec::new_from_slices(key, key)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_KEY_LENGTH.into()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ProtocolError::DecryptionFailure)
}

/// AES-256-GCM seal with a random nonce. Output is `ciphertext || nonce || tag`.
pub fn gcm_seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_KEY_LENGTH.into()))?;
    let nonce = random_bytes::<GCM_NONCE_LEN>();

    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| ProtocolError::EncryptionFailure)?;

    // aes-gcm appends the tag; move the nonce in front of it.
    let tag = sealed.split_off(sealed.len() - GCM_TAG_LEN);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&tag);
    Ok(sealed)
}

/// Inverse of [`gcm_seal`]
pub fn gcm_open(key: &[u8], body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < GCM_OVERHEAD {
        return Err(ProtocolError::DecryptionFailure);
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_KEY_LENGTH.into()))?;

    let ct_len = body.len() - GCM_OVERHEAD;
    let (ciphertext, rest) = body.split_at(ct_len);
    let (nonce, tag) = rest.split_at(GCM_NONCE_LEN);

    let mut joined = Vec::with_capacity(ct_len + GCM_TAG_LEN);
    joined.extend_from_slice(ciphertext);
    joined.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::from_slice(nonce), joined.as_slice())
        .map_err(|_| ProtocolError::DecryptionFailure)
}

/// AES-128-GCM seal of one long-link record
pub fn record_seal(key: &[u8], nonce: &[u8; GCM_NONCE_LEN], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new_from_slice(key)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_KEY_LENGTH.into()))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| ProtocolError::EncryptionFailure)
}

/// AES-128-GCM open of one long-link record
pub fn record_open(key: &[u8], nonce: &[u8; GCM_NONCE_LEN], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new_from_slice(key)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_KEY_LENGTH.into()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| ProtocolError::DecryptionFailure)
}

/// HKDF-SHA256 extract-and-expand into `out`
pub fn hkdf_expand(salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) -> Result<()> {
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, out)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_KDF_FAILED.into()))
}

/// HMAC-SHA256 over the concatenation of `parts`
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_KEY_LENGTH.into()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time HMAC-SHA256 verification
pub fn hmac_verify(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<bool> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_KEY_LENGTH.into()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.verify_slice(tag).is_ok())
}
