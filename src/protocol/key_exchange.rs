//! Elliptic-curve key exchange on NIST P-256.
//!
//! Each handshake attempt draws two independent ephemeral key pairs (V1 and V2).
//! Shared secrets are the SHA-256 digest of the ECDH x-coordinate.

use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::sha256;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand_core::OsRng;
use std::fmt;
use zeroize::Zeroizing;

/// Length of a SEC1 uncompressed public key
pub const PUBLIC_KEY_LEN: usize = 65;

/// Length of a serialized private scalar
pub const PRIVATE_KEY_LEN: usize = 32;

/// A P-256 key pair. The secret scalar is zeroized on drop.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: [u8; PUBLIC_KEY_LEN],
}

impl KeyPair {
    /// Draw a fresh key pair from the OS RNG
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    /// Rebuild a key pair from a persisted private scalar
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PRIVATE_KEY_LEN {
            return Err(ProtocolError::Crypto(constants::ERR_INVALID_PRIVATE_KEY.into()));
        }
        let secret = SecretKey::from_slice(bytes)
            .map_err(|_| ProtocolError::Crypto(constants::ERR_INVALID_PRIVATE_KEY.into()))?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let point = secret.public_key().to_encoded_point(false);
        let mut public = [0u8; PUBLIC_KEY_LEN];
        public.copy_from_slice(point.as_bytes());
        Self { secret, public }
    }

    /// SEC1 uncompressed public key
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public
    }

    /// Private scalar, for persistence
    pub fn private_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// Shared secret with a remote public key
    pub fn shared_secret(&self, remote_public: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        derive_shared_secret(self, remote_public)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Generate one key pair on the fixed curve
pub fn generate_key_pair() -> KeyPair {
    KeyPair::generate()
}

/// Validate a remote SEC1 public key without using it
pub fn validate_public_key(remote_public: &[u8]) -> Result<()> {
    PublicKey::from_sec1_bytes(remote_public)
        .map(|_| ())
        .map_err(|_| ProtocolError::Crypto(constants::ERR_INVALID_PUBLIC_KEY.into()))
}

/// ECDH between `local` and `remote_public`, hashed with SHA-256.
///
/// # Errors
/// Returns `ProtocolError::Crypto` if the remote key is malformed or not on the curve.
pub fn derive_shared_secret(local: &KeyPair, remote_public: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let remote = PublicKey::from_sec1_bytes(remote_public)
        .map_err(|_| ProtocolError::Crypto(constants::ERR_INVALID_PUBLIC_KEY.into()))?;
    let shared = diffie_hellman(local.secret.to_nonzero_scalar(), remote.as_affine());
    Ok(Zeroizing::new(sha256(&[shared.raw_secret_bytes().as_slice()])))
}

/// The two independent ephemeral pairs drawn for one handshake attempt
#[derive(Debug)]
pub struct HandshakeKeyPairs {
    pub v1: KeyPair,
    pub v2: KeyPair,
}

impl HandshakeKeyPairs {
    /// Draw both pairs
    pub fn generate() -> Self {
        Self {
            v1: KeyPair::generate(),
            v2: KeyPair::generate(),
        }
    }
}
