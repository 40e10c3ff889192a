use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};

use crate::crypto::{CryptoError, CryptoManager};

pub(super) const ALGORITHM: &str = "Ed25519";

/// Base64 encoded Ed25519 keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

/// Ed25519 signatures, with keys and signatures exchanged as standard base64.
///
/// The private key is the 32 byte seed. A 64 byte `seed || public key` encoding is accepted too.
pub struct Ed25519;

impl Ed25519 {
    pub fn key_pair_from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> KeyPair {
        let signing_key = SigningKey::from_bytes(seed);
        KeyPair {
            public_key: STANDARD.encode(signing_key.verifying_key().as_bytes()),
            private_key: STANDARD.encode(signing_key.to_bytes()),
        }
    }

    fn signing_key(private_key: &str) -> Result<SigningKey, CryptoError> {
        let bytes: Vec<u8> = STANDARD.decode(private_key)?;
        let seed: [u8; SECRET_KEY_LENGTH] = bytes
            .get(..SECRET_KEY_LENGTH)
            .filter(|_| bytes.len() == SECRET_KEY_LENGTH || bytes.len() == 2 * SECRET_KEY_LENGTH)
            .and_then(|seed| seed.try_into().ok())
            .ok_or_else(|| CryptoError::InvalidKey(format!("private key has {} bytes", bytes.len())))?;
        Ok(SigningKey::from_bytes(&seed))
    }

    fn verifying_key(public_key: &str) -> Result<VerifyingKey, CryptoError> {
        let bytes: Vec<u8> = STANDARD.decode(public_key)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("public key has {} bytes", bytes.len())))?;
        VerifyingKey::from_bytes(&bytes).map_err(|error| CryptoError::InvalidKey(error.to_string()))
    }
}

impl CryptoManager for Ed25519 {
    fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    fn sign(&self, message: &str, private_key: &str) -> Result<String, CryptoError> {
        let signature: Signature = Self::signing_key(private_key)?.sign(message.as_bytes());
        Ok(STANDARD.encode(signature.to_bytes()))
    }

    fn verify(&self, message: &str, signature: &str, public_key: &str) -> Result<bool, CryptoError> {
        let key: VerifyingKey = Self::verifying_key(public_key)?;
        let signature: Signature = Signature::from_slice(&STANDARD.decode(signature)?)
            .map_err(|error| CryptoError::MalformedSignature(error.to_string()))?;
        Ok(key.verify(message.as_bytes(), &signature).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 32] = [7; 32];

    #[test]
    fn sign_and_verify_test() {
        let keys = Ed25519::key_pair_from_seed(&SEED);
        let signature = Ed25519.sign("A{}nonce", &keys.private_key).unwrap();

        assert!(Ed25519.verify("A{}nonce", &signature, &keys.public_key).unwrap());
        assert!(!Ed25519.verify("A{}other", &signature, &keys.public_key).unwrap());

        let stranger = Ed25519::key_pair_from_seed(&[9; 32]);
        assert!(!Ed25519.verify("A{}nonce", &signature, &stranger.public_key).unwrap());
    }

    #[test]
    fn signature_is_deterministic_test() {
        let keys = Ed25519::key_pair_from_seed(&SEED);
        assert_eq!(
            Ed25519.sign("message", &keys.private_key).unwrap(),
            Ed25519.sign("message", &keys.private_key).unwrap()
        );
    }

    #[test]
    fn invalid_keys_test() {
        assert!(matches!(
            Ed25519.sign("message", &STANDARD.encode([1u8; 5])),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(matches!(Ed25519.sign("message", "%%%"), Err(CryptoError::Base64(_))));

        let keys = Ed25519::key_pair_from_seed(&SEED);
        assert!(matches!(
            Ed25519.verify("message", &STANDARD.encode([0u8; 10]), &keys.public_key),
            Err(CryptoError::MalformedSignature(_))
        ));
    }
}
