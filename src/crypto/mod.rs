use std::sync::Arc;

use serde_json::Value;

pub use ed25519::{Ed25519, KeyPair};

use crate::error::TransportError;

mod ed25519;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("Unsupported signature algorithm \"{0}\"")]
    UnsupportedAlgorithm(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<CryptoError> for TransportError {
    fn from(error: CryptoError) -> Self {
        Self::Signature(error.to_string())
    }
}

/// Detached signatures over command requests.
pub trait CryptoManager: Send + Sync {
    fn algorithm(&self) -> &'static str;

    /// Signs `message` and returns the encoded signature.
    fn sign(&self, message: &str, private_key: &str) -> Result<String, CryptoError>;

    /// Whether `signature` was produced over `message` by the owner of `public_key`.
    ///
    /// A well-formed but wrong signature is `Ok(false)`; an undecodable key or signature is an
    /// error.
    fn verify(&self, message: &str, signature: &str, public_key: &str) -> Result<bool, CryptoError>;
}

/// The text a command signature covers: its name, its request as canonical JSON, and the nonce.
///
/// Object keys are sorted, so sender and verifier produce the same text whatever order the
/// request was built in.
pub fn signing_text(name: &str, request: &Value, nonce: &str) -> Result<String, CryptoError> {
    Ok(format!("{}{}{}", name, serde_json::to_string(request)?, nonce))
}

pub struct CryptoManagerFactory;

impl CryptoManagerFactory {
    pub fn get(algorithm: &str) -> Result<Arc<dyn CryptoManager>, CryptoError> {
        match algorithm {
            ed25519::ALGORITHM => Ok(Arc::new(Ed25519)),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}
