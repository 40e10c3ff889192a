use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ExtendedError, TransportError};
use crate::fabric::config::FabricSettings;
use crate::fabric::payload::ResponsePayload;

const FAILURE_PREFIX: &str = "transaction returned with failure:";

/// A failed ledger call. Endorsement failures nest the peer errors that caused them.
#[derive(thiserror::Error, Debug, Clone, Default, PartialEq, Eq)]
#[error("{message}")]
pub struct LedgerError {
    pub message: String,
    pub endorsements: Vec<LedgerError>,
}

impl LedgerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            endorsements: Vec::new(),
        }
    }

    #[must_use]
    pub fn endorsed_by(mut self, endorsement: LedgerError) -> Self {
        self.endorsements.push(endorsement);
        self
    }
}

impl From<LedgerError> for TransportError {
    fn from(error: LedgerError) -> Self {
        Self::Ledger(error.message)
    }
}

/// The deployed chaincode, as seen from a gateway connection.
#[async_trait]
pub trait FabricContract: Send + Sync {
    /// Endorses and commits a transaction, returning the chaincode payload.
    async fn submit_transaction(&self, method: &str, args: &[String]) -> Result<Vec<u8>, LedgerError>;

    /// Runs a transaction on a peer without committing it.
    async fn evaluate_transaction(&self, method: &str, args: &[String]) -> Result<Vec<u8>, LedgerError>;

    /// Payloads of the chaincode events named `event_name`.
    async fn contract_events(&self, event_name: &str) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, LedgerError>;
}

/// Opens gateway connections.
#[async_trait]
pub trait FabricConnector: Send + Sync {
    async fn connect(&self, settings: &FabricSettings) -> Result<Arc<dyn FabricContract>, LedgerError>;
}

/// Digs through nested endorsement failures down to the error the chaincode returned.
pub fn parse_endorsement_error(error: &LedgerError) -> ExtendedError {
    if let Some(endorsement) = error.endorsements.first() {
        return parse_endorsement_error(endorsement);
    }

    let fallback = || ExtendedError::new(format!("Unable to execute transaction: {}", error.message));
    let message: &str = error
        .message
        .find(FAILURE_PREFIX)
        .map_or(error.message.as_str(), |index| &error.message[index + FAILURE_PREFIX.len()..])
        .trim();

    match serde_json::from_str::<ResponsePayload>(message) {
        Ok(payload) if payload.is_error => payload.into_response().err().unwrap_or_else(fallback),
        _ => fallback(),
    }
}
