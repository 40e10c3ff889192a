use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable codes carried by [`ExtendedError`] across process boundaries.
pub mod codes {
    pub const DEFAULT: i64 = -1;
    pub const TIMEOUT: i64 = 5001;
    pub const NO_CONNECTION: i64 = 5002;
    pub const WAIT_EXCEED: i64 = 5003;
    pub const INVALID_HEADERS: i64 = 5004;
    pub const INVALID_DATA: i64 = 5005;
    pub const WAIT: i64 = 5006;
}

/// The error shape every transport serializes onto the wire, so that a remote failure can be
/// reconstructed without losing its `code` or `details`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message} ({code})")]
#[serde(rename_all = "camelCase")]
pub struct ExtendedError {
    #[serde(default = "default_code")]
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default = "default_is_fatal")]
    pub is_fatal: bool,
}

const fn default_code() -> i64 {
    codes::DEFAULT
}

const fn default_is_fatal() -> bool {
    true
}

impl ExtendedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: codes::DEFAULT,
            message: message.into(),
            details: None,
            is_fatal: true,
        }
    }

    pub fn with_code(message: impl Into<String>, code: i64) -> Self {
        Self {
            code,
            ..Self::new(message)
        }
    }

    #[must_use]
    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn non_fatal(mut self) -> Self {
        self.is_fatal = false;
        self
    }
}

/// Errors returned by transport operations on the local side.
///
/// Every variant maps onto an [`ExtendedError`] code, which is what a `send_listen` caller
/// ultimately receives.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("\"{name}\" command ({id}) is timed out")]
    Timeout { name: String, id: String },
    #[error("\"{name}\" command ({id}) wait timeout or count exceeded")]
    WaitExceed { name: String, id: String },
    #[error("Invalid message headers: {0}")]
    InvalidHeaders(String),
    #[error("Invalid message data: {0}")]
    InvalidData(String),
    #[error("No connection: {0}")]
    NoConnection(String),
    #[error("Unable to connect: {0}")]
    ConnectionTimeout(String),
    #[error("Command \"{0}\" is already listening")]
    AlreadyListening(String),
    #[error("Unable to find request details for \"{name}\" command ({id}): probably it was already completed")]
    RequestNotFound { name: String, id: String },
    #[error("\"{0}\" command request is null")]
    EmptyRequest(String),
    #[error("Method \"{0}\" is not supported by this transport")]
    Unsupported(&'static str),
    #[error("Invalid settings: {0}")]
    Settings(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "amqp")]
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
    #[error("Ledger error: {0}")]
    Ledger(String),
    #[error("Invalid signature: {0}")]
    Signature(String),
    #[error(transparent)]
    Extended(#[from] ExtendedError),
}

impl TransportError {
    /// Returns the [`ExtendedError`] code this error is reported with.
    pub fn code(&self) -> i64 {
        match self {
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::WaitExceed { .. } => codes::WAIT_EXCEED,
            Self::InvalidHeaders(_) => codes::INVALID_HEADERS,
            Self::InvalidData(_) | Self::Json(_) => codes::INVALID_DATA,
            Self::NoConnection(_) | Self::ConnectionTimeout(_) => codes::NO_CONNECTION,
            #[cfg(feature = "amqp")]
            Self::Amqp(_) => codes::NO_CONNECTION,
            Self::Extended(error) => error.code,
            Self::AlreadyListening(_)
            | Self::RequestNotFound { .. }
            | Self::EmptyRequest(_)
            | Self::Unsupported(_)
            | Self::Settings(_)
            | Self::Ledger(_)
            | Self::Signature(_) => codes::DEFAULT,
        }
    }
}

impl From<TransportError> for ExtendedError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Extended(error) => error,
            other => ExtendedError::with_code(other.to_string(), other.code()),
        }
    }
}
