use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::command::{AsyncCommand, Command, Event, Response, TransportCommand};
use crate::error::{ExtendedError, TransportError};
use crate::options::CommandOptions;

/// Stream of commands delivered to the single listener of a command name.
pub type CommandReceiver = mpsc::UnboundedReceiver<TransportCommand>;

/// Stream of broadcast events of one name.
pub type EventReceiver = broadcast::Receiver<Event>;

/// Capacity of every per-name event channel.
pub(crate) const EVENT_CAPACITY: usize = 1024;

/// The capability contract shared by every substrate.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget. Only local validation errors are returned.
    async fn send(&self, command: Command, options: CommandOptions) -> Result<(), TransportError>;

    /// Sends `command` and waits for its reply or its deadline.
    ///
    /// Calling it again with the same command id while the first call is in flight awaits the
    /// same outcome without sending twice.
    async fn send_listen(&self, command: AsyncCommand, options: CommandOptions) -> Response;

    /// Subscribes to every command named `name`. Only one listener per name is allowed.
    async fn listen(&self, name: &str) -> Result<CommandReceiver, TransportError>;

    /// Terminal action of a handler: attaches `result` and relays it to the sender.
    async fn complete(&self, command: TransportCommand, result: Response) -> Result<(), TransportError>;

    /// Asks for the command to be delivered again later instead of completing it.
    async fn wait(&self, command: &TransportCommand) -> Result<(), TransportError>;

    async fn dispatch(&self, event: Event) -> Result<(), TransportError>;

    async fn get_dispatcher(&self, name: &str) -> Result<EventReceiver, TransportError>;
}

/// Typed helpers on top of any [`Transport`].
#[async_trait]
pub trait TransportExt: Transport {
    /// Serializes `request`, sends it with `send_listen` and deserializes the reply. An
    /// undefined reply is deserialized from `null`.
    async fn request<U, V>(&self, name: &str, request: &U, options: CommandOptions) -> Result<V, ExtendedError>
    where
        U: Serialize + Sync,
        V: DeserializeOwned + Send,
    {
        let command = AsyncCommand::from_request(name, request).map_err(TransportError::from)?;
        let data: Option<Value> = self.send_listen(command, options).await?;
        serde_json::from_value(data.unwrap_or(Value::Null)).map_err(|error| TransportError::from(error).into())
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

/// Kinds of transport log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportLogType {
    RequestSent,
    RequestReceived,
    RequestNoReply,
    RequestExpired,
    ResponseSent,
    ResponseReceived,
    ResponseNoReply,
    ResponseExpired,
    ResponseWait,
    EventSent,
    EventReceived,
}

impl TransportLogType {
    pub const fn mark(self) -> &'static str {
        match self {
            Self::RequestSent => "→",
            Self::RequestReceived => "⇠",
            Self::RequestNoReply => "↮",
            Self::RequestExpired => "⧖→",
            Self::ResponseSent => "⇢",
            Self::ResponseReceived => "←",
            Self::ResponseNoReply => "×",
            Self::ResponseExpired => "⧖←",
            Self::ResponseWait => "↺",
            Self::EventSent => "•→",
            Self::EventReceived => "•←",
        }
    }

    const fn is_request(self) -> bool {
        matches!(
            self,
            Self::RequestSent | Self::RequestReceived | Self::RequestNoReply | Self::RequestExpired
        )
    }
}

pub(crate) fn log_command(context: &str, command: &TransportCommand, log_type: TransportLogType) {
    let has_error = command.as_async().map_or(false, |command| command.error().is_some());
    tracing::debug!(
        context,
        command.name = %command.name(),
        command.id = %command.id(),
        log_type = ?log_type,
        "{} {} {}",
        log_type.mark(),
        command.name(),
        if has_error { "✘" } else { "✔" },
    );

    if log_type.is_request() {
        tracing::trace!(context, command.id = %command.id(), request = %command.request(), "{}", log_type.mark());
    } else if let Some(result) = command.as_async().and_then(AsyncCommand::result) {
        tracing::trace!(context, command.id = %command.id(), response = ?result, "{}", log_type.mark());
    }
}

pub(crate) fn log_event(context: &str, event: &Event, log_type: TransportLogType) {
    tracing::debug!(context, event.name = %event.name, log_type = ?log_type, "{} {}", log_type.mark(), event.name);
}
