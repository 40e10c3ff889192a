use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::command::{Response, TransportCommand};
use crate::error::{ExtendedError, TransportError};
use crate::transport::Transport;

/// What a handler may return instead of a value.
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    /// The command cannot be processed yet; it is handed to [`Transport::wait`].
    #[error("command is not ready to be processed")]
    Wait,
    #[error(transparent)]
    Failed(#[from] ExtendedError),
}

impl From<TransportError> for HandlerError {
    fn from(error: TransportError) -> Self {
        Self::Failed(error.into())
    }
}

/// Business logic bound to one command name.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    type Request: DeserializeOwned + Send;
    /// Serialized as the reply payload; `()` replies with `null`.
    type Response: Serialize + Send;

    fn name(&self) -> &str;

    async fn execute(&self, request: Self::Request, command: &TransportCommand) -> Result<Self::Response, HandlerError>;
}

/// Listens to `handler.name()` on `transport` and runs every received command through
/// [`handle_command`] on a spawned task.
///
/// The task ends when the transport drops the listener side.
pub async fn listen_handler<T, H>(transport: Arc<T>, handler: Arc<H>) -> Result<JoinHandle<()>, TransportError>
where
    T: Transport + ?Sized + 'static,
    H: CommandHandler + 'static,
{
    let mut commands = transport.listen(handler.name()).await?;
    Ok(tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            handle_command(transport.as_ref(), handler.as_ref(), command).await;
        }
        tracing::debug!(command.name = %handler.name(), "listener closed");
    }))
}

/// Executes one command and sends its outcome back through `transport`.
///
/// [`HandlerError::Wait`] turns into [`Transport::wait`]; every other failure, including a request
/// that does not deserialize, is completed as an error reply.
pub async fn handle_command<T, H>(transport: &T, handler: &H, command: TransportCommand)
where
    T: Transport + ?Sized,
    H: CommandHandler,
{
    let result: Result<H::Response, HandlerError> = match command.command().request_as::<H::Request>() {
        Ok(request) => handler.execute(request, &command).await,
        Err(error) => Err(TransportError::InvalidData(error.to_string()).into()),
    };

    let response: Response = match result {
        Ok(value) => serde_json::to_value(&value)
            .map(Some)
            .map_err(|error| TransportError::from(error).into()),
        Err(HandlerError::Wait) => match transport.wait(&command).await {
            Ok(()) => return,
            Err(error @ TransportError::WaitExceed { .. }) => {
                tracing::warn!(command.name = %command.name(), command.id = %command.id(), "{}", error);
                return;
            }
            Err(error) => Err(error.into()),
        },
        Err(HandlerError::Failed(error)) => Err(error),
    };

    if let Err(error) = &response {
        if error.is_fatal {
            tracing::error!(command.name = %command.name(), command.id = %command.id(), code = error.code, "{}", error);
        } else {
            tracing::warn!(command.name = %command.name(), command.id = %command.id(), code = error.code, "{}", error);
        }
    }

    let name: String = command.name().to_string();
    if let Err(error) = transport.complete(command, response).await {
        tracing::error!(command.name = %name, "unable to complete command: {}", error);
    }
}
