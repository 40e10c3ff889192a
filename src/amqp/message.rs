use std::time::Duration;

use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use serde_json::Value;

use crate::command::{Command, Response};
use crate::error::{codes, ExtendedError, TransportError};

pub const IS_ASYNC_COMMAND: &str = "IS_ASYNC_COMMAND";
pub const IS_NEED_REPLY: &str = "IS_NEED_REPLY";
/// Command deadline in milliseconds.
pub const TRANSPORT_TIMEOUT: &str = "GATEWAY_TRANSPORT_TIMEOUT";
pub const NULL_RESPONSE: &str = "GATEWAY_NULL_RESPONSE";
pub const UNDEFINED_RESPONSE: &str = "GATEWAY_UNDERFINED_RESPONSE";
pub const TRANSPORT_ERROR: &str = "GATEWAY_TRANSPORT_ERROR";

const X_DEATH: &str = "x-death";
const CONTENT_TYPE: &str = "application/json";
const PERSISTENT: u8 = 2;

/// Routing data of a command read back from a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    pub id: String,
    pub is_async: bool,
    pub is_need_reply: bool,
    pub timeout: Duration,
    pub reply_to: Option<String>,
}

pub fn request_properties(command: &Command, timeout: Duration, reply_to: Option<&str>) -> BasicProperties {
    let is_async: bool = reply_to.is_some();
    let mut headers = FieldTable::default();
    headers.insert(IS_ASYNC_COMMAND.into(), AMQPValue::Boolean(is_async));
    headers.insert(IS_NEED_REPLY.into(), AMQPValue::Boolean(is_async));
    headers.insert(
        TRANSPORT_TIMEOUT.into(),
        AMQPValue::LongLongInt(i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX)),
    );

    let properties = BasicProperties::default()
        .with_message_id(ShortString::from(command.id()))
        .with_content_type(ShortString::from(CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT)
        .with_headers(headers);

    match reply_to {
        Some(reply_to) => properties
            .with_correlation_id(ShortString::from(command.id()))
            .with_reply_to(ShortString::from(reply_to)),
        None => properties,
    }
}

/// Validates the headers of a received command.
pub fn parse_request(properties: &BasicProperties) -> Result<RequestHeaders, TransportError> {
    let id: String = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .ok_or_else(|| TransportError::InvalidHeaders("message id is missing".to_string()))?;
    let headers: &FieldTable = properties
        .headers()
        .as_ref()
        .ok_or_else(|| TransportError::InvalidHeaders(format!("message {} has no headers", id)))?;

    let is_async: bool = header(headers, IS_ASYNC_COMMAND)
        .and_then(AMQPValue::as_bool)
        .ok_or_else(|| TransportError::InvalidHeaders(format!("{} is missing or not a boolean", IS_ASYNC_COMMAND)))?;
    let is_need_reply: bool = header(headers, IS_NEED_REPLY)
        .and_then(AMQPValue::as_bool)
        .ok_or_else(|| TransportError::InvalidHeaders(format!("{} is missing or not a boolean", IS_NEED_REPLY)))?;
    let timeout: u64 = header(headers, TRANSPORT_TIMEOUT)
        .and_then(as_u64)
        .ok_or_else(|| TransportError::InvalidHeaders(format!("{} is missing or not a number", TRANSPORT_TIMEOUT)))?;

    let reply_to: Option<String> = properties.reply_to().as_ref().map(|reply_to| reply_to.as_str().to_string());
    if is_need_reply && reply_to.is_none() {
        return Err(TransportError::InvalidHeaders(format!(
            "message {} needs a reply but has no reply queue",
            id
        )));
    }

    Ok(RequestHeaders {
        id,
        is_async,
        is_need_reply,
        timeout: Duration::from_millis(timeout),
        reply_to,
    })
}

/// How many times the message already expired in a delay queue.
pub fn death_count(properties: &BasicProperties) -> u32 {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| header(headers, X_DEATH))
        .and_then(AMQPValue::as_array)
        .and_then(|deaths| deaths.as_slice().first())
        .and_then(AMQPValue::as_field_table)
        .and_then(|death| header(death, "count"))
        .and_then(as_u64)
        .map_or(0, |count| u32::try_from(count).unwrap_or(u32::MAX))
}

/// Encodes a reply, flagging null, undefined and error in headers so they survive the JSON body.
pub fn encode_reply(response: &Response) -> Result<(Vec<u8>, FieldTable), TransportError> {
    let mut headers = FieldTable::default();
    let body: Vec<u8> = match response {
        Ok(None) => {
            headers.insert(UNDEFINED_RESPONSE.into(), AMQPValue::Boolean(true));
            Vec::new()
        }
        Ok(Some(Value::Null)) => {
            headers.insert(NULL_RESPONSE.into(), AMQPValue::Boolean(true));
            Vec::new()
        }
        Ok(Some(value)) => serde_json::to_vec(value)?,
        Err(error) => {
            headers.insert(TRANSPORT_ERROR.into(), AMQPValue::Boolean(true));
            serde_json::to_vec(error)?
        }
    };
    Ok((body, headers))
}

/// Rebuilds a reply from its headers and body. Headers are checked before the body is parsed.
pub fn decode_reply(headers: Option<&FieldTable>, body: &[u8]) -> Response {
    let flag = |key: &str| headers.and_then(|headers| header(headers, key)).and_then(AMQPValue::as_bool) == Some(true);

    if flag(UNDEFINED_RESPONSE) {
        return Ok(None);
    }
    if flag(NULL_RESPONSE) {
        return Ok(Some(Value::Null));
    }
    if flag(TRANSPORT_ERROR) {
        return match serde_json::from_slice::<ExtendedError>(body) {
            Ok(error) => Err(error),
            Err(error) => Err(ExtendedError::with_code(
                format!("Unable to parse error reply: {}", error),
                codes::INVALID_DATA,
            )),
        };
    }
    serde_json::from_slice::<Value>(body)
        .map(Some)
        .map_err(|error| TransportError::InvalidData(error.to_string()).into())
}

fn header<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == key)
        .map(|(_, value)| value)
}

fn as_u64(value: &AMQPValue) -> Option<u64> {
    match *value {
        AMQPValue::ShortShortUInt(value) => Some(u64::from(value)),
        AMQPValue::ShortUInt(value) => Some(u64::from(value)),
        AMQPValue::LongUInt(value) => Some(u64::from(value)),
        AMQPValue::Timestamp(value) => Some(value),
        AMQPValue::ShortShortInt(value) => u64::try_from(value).ok(),
        AMQPValue::ShortInt(value) => u64::try_from(value).ok(),
        AMQPValue::LongInt(value) => u64::try_from(value).ok(),
        AMQPValue::LongLongInt(value) => u64::try_from(value).ok(),
        _ => None,
    }
}
