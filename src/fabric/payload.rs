use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::command::{Command, Response};
use crate::error::{codes, ExtendedError, TransportError};

/// Detached signature attached to a ledger request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub nonce: String,
    pub value: String,
    pub algorithm: String,
    pub public_key: String,
}

/// Options travelling with a ledger request.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FabricCommandOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    /// Deadline in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_max_count: Option<u32>,
    /// Sends the request through `evaluate_transaction`: the ledger is only read.
    #[serde(skip)]
    pub is_read_only: bool,
}

impl FabricCommandOptions {
    pub fn read_only() -> Self {
        Self {
            is_read_only: true,
            ..Self::default()
        }
    }
}

/// The single argument of the chaincode transport method.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub request: Value,
    #[serde(default)]
    pub options: FabricCommandOptions,
    #[serde(default)]
    pub is_need_reply: bool,
}

impl RequestPayload {
    pub fn new(command: &Command, options: FabricCommandOptions, is_need_reply: bool) -> Self {
        Self {
            id: command.id().to_string(),
            name: command.name().to_string(),
            request: command.request().clone(),
            options,
            is_need_reply,
        }
    }

    pub fn parse(data: &str) -> Result<Self, TransportError> {
        let payload: Self = serde_json::from_str(data).map_err(|error| TransportError::InvalidData(error.to_string()))?;
        if payload.id.is_empty() || payload.name.is_empty() {
            return Err(TransportError::InvalidData("request id and name must not be empty".to_string()));
        }
        Ok(payload)
    }

    pub fn command(&self) -> Command {
        Command::with_id(self.id.as_str(), self.name.as_str(), self.request.clone())
    }
}

/// The return value of the chaincode transport method.
///
/// A missing `response` is an undefined reply, `null` a null one. `isError` marks `response` as a
/// serialized [`ExtendedError`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    #[serde(default)]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

impl ResponsePayload {
    pub fn from_response(id: impl Into<String>, response: &Response) -> Self {
        match response {
            Ok(value) => Self {
                id: id.into(),
                response: value.clone(),
                is_error: false,
            },
            Err(error) => Self::from_error(id, error),
        }
    }

    pub fn from_error(id: impl Into<String>, error: &ExtendedError) -> Self {
        Self {
            id: id.into(),
            response: serde_json::to_value(error).ok(),
            is_error: true,
        }
    }

    /// An empty payload is an undefined reply.
    pub fn decode(data: &[u8]) -> Response {
        if data.is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice::<Self>(data) {
            Ok(payload) => payload.into_response(),
            Err(error) => Err(ExtendedError::with_code(
                format!("Invalid response payload: {}", error),
                codes::INVALID_DATA,
            )),
        }
    }

    pub fn into_response(self) -> Response {
        if !self.is_error {
            return Ok(self.response);
        }
        let error: Value = self.response.unwrap_or(Value::Null);
        Err(serde_json::from_value(error).unwrap_or_else(|error| {
            ExtendedError::with_code(format!("Invalid error payload: {}", error), codes::INVALID_DATA)
        }))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

fn deserialize_some<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

fn is_false(value: &bool) -> bool {
    !value
}
