//! Ed25519 request signatures.
//!
//! Clients sign the canonical bytes of their requests; nodes verify the
//! signature against the key registered for the client identifier. The
//! wrappers keep `ed25519-dalek` out of every other crate's signature.

use ed25519_dalek::{Signer as _, Verifier as _};
use thiserror::Error;

/// Length of a detached Ed25519 signature.
pub const SIGNATURE_LENGTH: usize = 64;

/// Length of a public verifying key.
pub const PUBLIC_KEY_LENGTH: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignError {
    #[error("signature verification failed")]
    BadSignature,

    #[error("malformed signature: expected {SIGNATURE_LENGTH} bytes, got {0}")]
    MalformedSignature(usize),

    #[error("malformed public key")]
    MalformedKey,
}

/// A detached Ed25519 signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LENGTH]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignError> {
        let arr: [u8; SIGNATURE_LENGTH] = bytes
            .try_into()
            .map_err(|_| SignError::MalformedSignature(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

/// A client's private signing key.
pub struct SigningKey(ed25519_dalek::SigningKey);

impl SigningKey {
    /// Generates a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&bytes))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key())
    }

    /// Signs `message`, returning a detached signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print private key material
        write!(f, "SigningKey(..)")
    }
}

/// A client's public verifying key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyingKey(ed25519_dalek::VerifyingKey);

impl VerifyingKey {
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self, SignError> {
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| SignError::MalformedKey)
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.0.to_bytes()
    }

    /// Verifies a detached signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignError> {
        let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
        self.0
            .verify(message, &sig)
            .map_err(|_| SignError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let key = SigningKey::generate();
        let sig = key.sign(b"request bytes");
        assert_eq!(key.verifying_key().verify(b"request bytes", &sig), Ok(()));
    }

    #[test]
    fn tampered_message_fails() {
        let key = SigningKey::generate();
        let sig = key.sign(b"request bytes");
        assert_eq!(
            key.verifying_key().verify(b"tampered bytes", &sig),
            Err(SignError::BadSignature)
        );
    }

    #[test]
    fn wrong_key_fails() {
        let alice = SigningKey::generate();
        let mallory = SigningKey::generate();
        let sig = mallory.sign(b"request bytes");
        assert_eq!(
            alice.verifying_key().verify(b"request bytes", &sig),
            Err(SignError::BadSignature)
        );
    }

    #[test]
    fn signature_slice_round_trip() {
        let key = SigningKey::generate();
        let sig = key.sign(b"x");
        let restored = Signature::from_slice(&sig.to_bytes()).unwrap();
        assert_eq!(restored, sig);

        assert_eq!(
            Signature::from_slice(&[0u8; 10]),
            Err(SignError::MalformedSignature(10))
        );
    }

    #[test]
    fn verifying_key_bytes_round_trip() {
        let key = SigningKey::generate().verifying_key();
        let restored = VerifyingKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(restored, key);
    }
}
