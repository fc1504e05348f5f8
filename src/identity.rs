//! # Identity and Keys
//!
//! - [`Keypair`]: Ed25519 signing keypair, the source of a node's identity
//! - [`Identity`]: 32-byte public key serving as the peer's unique identifier
//!
//! ## Identity Model
//!
//! The overlay treats identities as opaque: it only compares, hashes and
//! forwards them. The transport is responsible for binding every inbound frame
//! to the identity of its sender (see [`crate::memory`] for a transport that
//! signs and verifies frames with these keys).
//!
//! Peer hashes ([`Identity::peer_hash`]) are short blake3 digests used when a
//! channel member list is reported without exposing full identities.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns current time as milliseconds since Unix epoch.
/// Used for data origin timestamps.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    pub const LEN: usize = 32;

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != Self::LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First 8 bytes in hex, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// 16-hex-char blake3 digest of the identity.
    pub fn peer_hash(&self) -> String {
        let digest = blake3::hash(&self.0);
        hex::encode(&digest.as_bytes()[..8])
    }

    /// Verify `signature` over `message` with this identity as the public key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::try_from(self.0.as_slice()) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        key.verify_strict(message, &Signature::from_bytes(&sig_bytes)).is_ok()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; 32] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_generation_is_unique() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.identity(), kp2.identity());
    }

    #[test]
    fn sign_and_verify_through_identity() {
        let kp = Keypair::generate();
        let message = b"frame bytes";

        let signature = kp.sign(message);
        assert!(kp.identity().verify(message, &signature.to_bytes()));
        assert!(!kp.identity().verify(b"other bytes", &signature.to_bytes()));
        assert!(!kp.identity().verify(message, &[0u8; 12]));
    }

    #[test]
    fn hex_round_trip_and_length_check() {
        let id = Keypair::from_secret_key_bytes(&[7u8; 32]).identity();
        assert_eq!(Identity::from_hex(&id.to_hex()).unwrap(), id);
        assert!(Identity::from_hex("abcd").is_err());
    }

    #[test]
    fn peer_hash_is_stable_and_short() {
        let id = Identity::from_bytes([3u8; 32]);
        assert_eq!(id.peer_hash(), id.peer_hash());
        assert_eq!(id.peer_hash().len(), 16);
        assert_ne!(id.peer_hash(), Identity::from_bytes([4u8; 32]).peer_hash());
    }
}
