use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ExtendedError;

/// Outcome of an async command.
///
/// `Ok(None)` is the *undefined* channel (the handler returned nothing), `Ok(Some(Value::Null))`
/// is the *null* channel and `Err` carries the remote error. The three are kept apart on every
/// substrate.
pub type Response = Result<Option<Value>, ExtendedError>;

type Validator = Arc<dyn Fn(&Option<Value>) -> Result<(), ExtendedError> + Send + Sync>;

/// A unit of work addressed by `name`, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    id: String,
    name: String,
    request: Value,
}

impl Command {
    /// Creates a command with a freshly generated id.
    pub fn new(name: impl Into<String>, request: impl Into<Value>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name, request)
    }

    /// A command whose request is an empty object.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Value::Object(Default::default()))
    }

    /// Rebuilds a command keeping the given id, used when a command is reconstructed from a
    /// received message.
    pub fn with_id(id: impl Into<String>, name: impl Into<String>, request: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            request: request.into(),
        }
    }

    pub fn from_request<U: Serialize>(name: impl Into<String>, request: &U) -> Result<Self, serde_json::Error> {
        Ok(Self::new(name, serde_json::to_value(request)?))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request(&self) -> &Value {
        &self.request
    }

    pub fn request_as<U: DeserializeOwned>(&self) -> Result<U, serde_json::Error> {
        serde_json::from_value(self.request.clone())
    }
}

/// A [`Command`] expecting a reply, with its response slot.
#[derive(Clone)]
pub struct AsyncCommand {
    command: Command,
    response: Option<Response>,
    validator: Option<Validator>,
}

impl AsyncCommand {
    pub fn new(name: impl Into<String>, request: impl Into<Value>) -> Self {
        Self::from_command(Command::new(name, request))
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self::from_command(Command::empty(name))
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>, request: impl Into<Value>) -> Self {
        Self::from_command(Command::with_id(id, name, request))
    }

    pub fn from_request<U: Serialize>(name: impl Into<String>, request: &U) -> Result<Self, serde_json::Error> {
        Command::from_request(name, request).map(Self::from_command)
    }

    pub const fn from_command(command: Command) -> Self {
        Self {
            command,
            response: None,
            validator: None,
        }
    }

    /// Installs a check run against successful responses; a failed check turns the response
    /// into an error.
    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Option<Value>) -> Result<(), ExtendedError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub const fn command(&self) -> &Command {
        &self.command
    }

    pub fn id(&self) -> &str {
        self.command.id()
    }

    pub fn name(&self) -> &str {
        self.command.name()
    }

    pub fn request(&self) -> &Value {
        self.command.request()
    }

    /// Fills the response slot. This is the only way the slot is mutated.
    pub fn response(&mut self, value: Response) {
        let value = match (value, &self.validator) {
            (Ok(data), Some(validator)) => validator(&data).map(|()| data),
            (value, _) => value,
        };
        self.response = Some(value);
    }

    pub const fn result(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn take_result(&mut self) -> Option<Response> {
        self.response.take()
    }

    pub fn data(&self) -> Option<&Value> {
        match &self.response {
            Some(Ok(Some(value))) => Some(value),
            _ => None,
        }
    }

    /// Deserializes the successful payload. Undefined and null both yield `None`.
    pub fn data_as<V: DeserializeOwned>(&self) -> Result<Option<V>, serde_json::Error> {
        match self.data() {
            Some(Value::Null) | None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some),
        }
    }

    pub fn error(&self) -> Option<&ExtendedError> {
        match &self.response {
            Some(Err(error)) => Some(error),
            _ => None,
        }
    }

    pub const fn is_settled(&self) -> bool {
        self.response.is_some()
    }
}

impl Debug for AsyncCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCommand")
            .field("command", &self.command)
            .field("response", &self.response)
            .finish()
    }
}

/// What a listener receives: either a fire-and-forget command or one awaiting a reply.
#[derive(Debug, Clone)]
pub enum TransportCommand {
    Command(Command),
    Async(AsyncCommand),
}

impl TransportCommand {
    pub const fn command(&self) -> &Command {
        match self {
            Self::Command(command) => command,
            Self::Async(command) => command.command(),
        }
    }

    pub fn id(&self) -> &str {
        self.command().id()
    }

    pub fn name(&self) -> &str {
        self.command().name()
    }

    pub fn request(&self) -> &Value {
        self.command().request()
    }

    pub const fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }

    pub const fn as_async(&self) -> Option<&AsyncCommand> {
        match self {
            Self::Async(command) => Some(command),
            Self::Command(_) => None,
        }
    }
}

impl From<Command> for TransportCommand {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<AsyncCommand> for TransportCommand {
    fn from(command: AsyncCommand) -> Self {
        Self::Async(command)
    }
}

/// A broadcast notification with zero or more subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn from_data<T: Serialize>(name: impl Into<String>, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(name, Some(serde_json::to_value(data)?)))
    }
}
