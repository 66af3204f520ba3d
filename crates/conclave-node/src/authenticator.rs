//! Client request authentication and operation validation.

use std::collections::HashMap;

use conclave_consensus::{Operation, Request};
use conclave_crypto::{Signature, SigningKey, VerifyingKey};
use conclave_types::ClientId;

use crate::error::ValidationError;

/// Pluggable validator run over the operation of every client request
/// before it is accepted for ordering.
pub trait OpValidator {
    fn validate(&self, operation: &Operation) -> Result<(), String>;
}

/// Authenticates client requests against registered Ed25519 keys.
///
/// A request from an unregistered client, an unsigned request, or a
/// signature that does not verify are all the same failure: the node
/// must not order it.
#[derive(Debug, Default)]
pub struct ClientAuthenticator {
    keys: HashMap<ClientId, VerifyingKey>,
}

impl ClientAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client_id: ClientId, key: VerifyingKey) {
        self.keys.insert(client_id, key);
    }

    pub fn is_registered(&self, client_id: &ClientId) -> bool {
        self.keys.contains_key(client_id)
    }

    /// Verifies the request's client signature.
    pub fn authenticate(&self, request: &Request) -> Result<(), ValidationError> {
        let sig_bytes = request
            .signature
            .as_ref()
            .ok_or(ValidationError::InvalidSignature)?;
        let signature =
            Signature::from_slice(sig_bytes).map_err(|_| ValidationError::InvalidSignature)?;
        let key = self
            .keys
            .get(&request.client_id)
            .ok_or(ValidationError::InvalidSignature)?;
        key.verify(&request.signable_bytes(), &signature)
            .map_err(|_| ValidationError::InvalidSignature)
    }
}

/// Signs a request in place with the client's key.
pub fn sign_request(key: &SigningKey, request: &mut Request) {
    let signature = key.sign(&request.signable_bytes());
    request.signature = Some(signature.to_bytes().to_vec());
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::ReqId;

    fn request() -> Request {
        Request::new(ClientId::from("Alice"), ReqId::new(1), Operation::new("T"))
    }

    #[test]
    fn registered_client_with_valid_signature_passes() {
        let key = SigningKey::generate();
        let mut auth = ClientAuthenticator::new();
        auth.register(ClientId::from("Alice"), key.verifying_key());

        let mut req = request();
        sign_request(&key, &mut req);
        assert_eq!(auth.authenticate(&req), Ok(()));
    }

    #[test]
    fn unsigned_request_fails() {
        let key = SigningKey::generate();
        let mut auth = ClientAuthenticator::new();
        auth.register(ClientId::from("Alice"), key.verifying_key());
        assert_eq!(
            auth.authenticate(&request()),
            Err(ValidationError::InvalidSignature)
        );
    }

    #[test]
    fn unregistered_client_fails() {
        let key = SigningKey::generate();
        let auth = ClientAuthenticator::new();
        let mut req = request();
        sign_request(&key, &mut req);
        assert_eq!(
            auth.authenticate(&req),
            Err(ValidationError::InvalidSignature)
        );
    }

    #[test]
    fn tampered_operation_fails() {
        let key = SigningKey::generate();
        let mut auth = ClientAuthenticator::new();
        auth.register(ClientId::from("Alice"), key.verifying_key());

        let mut req = request();
        sign_request(&key, &mut req);
        req.operation = Operation::new("FORGED");
        assert_eq!(
            auth.authenticate(&req),
            Err(ValidationError::InvalidSignature)
        );
    }
}
