use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::command::{AsyncCommand, Command, Event, Response, TransportCommand};
use crate::crypto::{signing_text, CryptoManagerFactory};
use crate::error::{codes, ExtendedError, TransportError};
use crate::fabric::ledger::LedgerError;
use crate::fabric::payload::{RequestPayload, ResponsePayload, Signature};
use crate::fabric::TRANSPORT_METHOD;
use crate::options::{CommandOptions, DEFAULT_TIMEOUT};
use crate::request::{RequestTable, TrackRequest};
use crate::transport::{
    log_command, log_event, CommandReceiver, EventReceiver, Transport, TransportLogType,
};

const CONTEXT: &str = "ChaincodeTransport";

/// World state access of the transaction being endorsed.
#[async_trait]
pub trait ChaincodeStub: Send + Sync {
    fn tx_id(&self) -> String;

    fn function_and_parameters(&self) -> (String, Vec<String>);

    async fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError>;

    async fn put_state(&self, key: &str, value: Vec<u8>) -> Result<(), LedgerError>;

    async fn delete_state(&self, key: &str) -> Result<(), LedgerError>;

    fn set_event(&self, name: &str, payload: Vec<u8>) -> Result<(), LedgerError>;
}

/// The stub of one command invocation, with the identity of the caller.
pub struct FabricStub {
    stub: Arc<dyn ChaincodeStub>,
    user_id: Option<String>,
    user_public_key: Option<String>,
    is_signature_verified: bool,
}

impl FabricStub {
    fn new(stub: Arc<dyn ChaincodeStub>, payload: &RequestPayload, is_signature_verified: bool) -> Self {
        Self {
            stub,
            user_id: payload.options.user_id.clone(),
            user_public_key: payload
                .options
                .signature
                .as_ref()
                .map(|signature| signature.public_key.clone()),
            is_signature_verified,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn user_public_key(&self) -> Option<&str> {
        self.user_public_key.as_deref()
    }

    pub const fn is_signature_verified(&self) -> bool {
        self.is_signature_verified
    }

    pub fn stub(&self) -> &dyn ChaincodeStub {
        self.stub.as_ref()
    }

    pub async fn has_state(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.stub.get_state(key).await?.map_or(false, |value| !value.is_empty()))
    }

    /// Reads a JSON value. A missing or empty entry is `None`.
    pub async fn get_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, TransportError> {
        match self.stub.get_state(key).await? {
            Some(value) if !value.is_empty() => Ok(Some(serde_json::from_slice(&value)?)),
            _ => Ok(None),
        }
    }

    pub async fn put_state<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), TransportError> {
        Ok(self.stub.put_state(key, serde_json::to_vec(value)?).await?)
    }

    pub async fn delete_state(&self, key: &str) -> Result<(), LedgerError> {
        self.stub.delete_state(key).await
    }

    /// Emits `event` as a chaincode event of the same name.
    pub fn dispatch(&self, event: &Event) -> Result<(), TransportError> {
        let payload: Vec<u8> = match &event.data {
            Some(data) => serde_json::to_vec(data)?,
            None => Vec::new(),
        };
        self.stub.set_event(&event.name, payload)?;
        log_event(CONTEXT, event, TransportLogType::EventSent);
        Ok(())
    }
}

struct Invocation {
    reply: oneshot::Sender<ResponsePayload>,
    stub: Arc<FabricStub>,
}

/// The receiving half of the ledger transport, running inside the chaincode.
///
/// [`invoke`](Self::invoke) decodes the transaction argument into a command, checks its signature
/// and hands it to the listener of its name; the transaction returns whatever the handler
/// completes the command with. `wait` answers the current transaction with a
/// [`codes::WAIT`] error, and the next transaction of the same command sees an incremented wait
/// count.
pub struct ChaincodeTransport {
    anonymous_commands: HashSet<String>,
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<TransportCommand>>>,
    requests: RequestTable<Invocation>,
    default_timeout: Duration,
}

impl Default for ChaincodeTransport {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl ChaincodeTransport {
    /// Commands named in `anonymous_commands` are accepted without a signature.
    pub fn new<I, S>(anonymous_commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            anonymous_commands: anonymous_commands.into_iter().map(Into::into).collect(),
            listeners: Mutex::new(HashMap::new()),
            requests: RequestTable::default(),
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    /// The stub of the invocation currently executing `command_id`.
    pub fn stub(&self, command_id: &str) -> Option<Arc<FabricStub>> {
        self.requests
            .inspect(command_id, |entry| entry.handle.as_ref().map(|invocation| invocation.stub.clone()))
            .flatten()
    }

    /// How many times the command was invoked again after waiting.
    pub fn wait_count(&self, command_id: &str) -> Option<u32> {
        self.requests.inspect(command_id, |entry| entry.wait_count)
    }

    /// Executes one transaction. `None` means there is nothing to return, e.g. the command
    /// expired before it could run.
    pub async fn invoke(&self, stub: Arc<dyn ChaincodeStub>) -> Option<ResponsePayload> {
        for (id, entry) in self.requests.purge_expired() {
            let mark = TransportLogType::RequestExpired.mark();
            tracing::warn!(context = CONTEXT, command.id = %id, "{} request expired", mark);
            if let Some(invocation) = entry.handle {
                let error = ExtendedError::with_code("Request timeout is expired", codes::TIMEOUT);
                let _ = invocation.reply.send(ResponsePayload::from_error(id, &error));
            }
        }

        let (payload, is_signature_verified) = match self.parse(stub.as_ref()) {
            Ok(parsed) => parsed,
            Err((id, error)) => {
                tracing::warn!(context = CONTEXT, "unable to create command: {}", error);
                return Some(ResponsePayload::from_error(id.unwrap_or_default(), &ExtendedError::from(error)));
            }
        };

        let command: TransportCommand = if payload.is_need_reply {
            AsyncCommand::from_command(payload.command()).into()
        } else {
            payload.command().into()
        };
        log_command(CONTEXT, &command, TransportLogType::RequestReceived);

        let timeout: Duration = payload
            .options
            .timeout
            .map_or(self.default_timeout, Duration::from_millis);
        let (reply, response) = oneshot::channel::<ResponsePayload>();
        let tracked = self.requests.track(
            &payload.id,
            TrackRequest {
                is_need_reply: payload.is_need_reply,
                timeout,
                options: CommandOptions {
                    timeout: Some(timeout),
                    wait_delay: None,
                    wait_max_count: payload.options.wait_max_count,
                },
                wait_count: None,
            },
            Invocation {
                reply,
                stub: Arc::new(FabricStub::new(stub, &payload, is_signature_verified)),
            },
        );

        if tracked.is_expired {
            log_command(CONTEXT, &command, TransportLogType::RequestExpired);
            tracing::warn!(
                context = CONTEXT,
                command.name = %payload.name,
                "received command with an expired timeout: ignored"
            );
            self.requests.take(&payload.id);
            return None;
        }

        let listener = self.listeners.lock().get(&payload.name).cloned();
        let delivered = match listener {
            Some(listener) => listener.send(command).map_err(|error| error.0),
            None => Err(command),
        };
        if let Err(command) = delivered {
            let error = ExtendedError::new(format!("No listener for \"{}\" command", payload.name));
            if let Err(error) = self.complete(command, Err(error)).await {
                tracing::error!(context = CONTEXT, "{}", error);
            }
        }

        match response.await {
            Ok(payload) => Some(payload),
            Err(_) => {
                let error = ExtendedError::new(format!("\"{}\" command was dropped before completion", payload.name));
                Some(ResponsePayload::from_error(payload.id, &error))
            }
        }
    }

    /// Decodes the transaction argument and verifies its signature. Failures carry the command
    /// id when it could be read.
    fn parse(&self, stub: &dyn ChaincodeStub) -> Result<(RequestPayload, bool), (Option<String>, TransportError)> {
        let (function, parameters) = stub.function_and_parameters();
        if function != TRANSPORT_METHOD {
            return Err((
                None,
                TransportError::InvalidData(format!("Invalid chaincode function \"{}\"", function)),
            ));
        }
        let [argument] = parameters.as_slice() else {
            return Err((
                None,
                TransportError::InvalidData(format!("Expected 1 argument, received {}", parameters.len())),
            ));
        };

        let payload: RequestPayload = RequestPayload::parse(argument).map_err(|error| (None, error))?;
        if self.anonymous_commands.contains(&payload.name) {
            return Ok((payload, false));
        }
        match verify_signature(&payload) {
            Ok(()) => Ok((payload, true)),
            Err(error) => Err((Some(payload.id), error)),
        }
    }
}

fn verify_signature(payload: &RequestPayload) -> Result<(), TransportError> {
    let invalid = |reason: &str| TransportError::Signature(format!("command \"{}\" {}", payload.name, reason));
    let signature: &Signature = payload
        .options
        .signature
        .as_ref()
        .ok_or_else(|| invalid("has no signature"))?;
    if signature.nonce.is_empty() {
        return Err(invalid("signature has an empty nonce"));
    }
    if signature.public_key.is_empty() {
        return Err(invalid("signature has an empty public key"));
    }

    let text: String = signing_text(&payload.name, &payload.request, &signature.nonce)?;
    let is_valid: bool =
        CryptoManagerFactory::get(&signature.algorithm)?.verify(&text, &signature.value, &signature.public_key)?;
    if is_valid {
        Ok(())
    } else {
        Err(invalid("has an invalid signature"))
    }
}

#[async_trait]
impl Transport for ChaincodeTransport {
    async fn send(&self, _: Command, _: CommandOptions) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("send"))
    }

    async fn send_listen(&self, _: AsyncCommand, _: CommandOptions) -> Response {
        Err(TransportError::Unsupported("send_listen").into())
    }

    async fn listen(&self, name: &str) -> Result<CommandReceiver, TransportError> {
        let mut listeners = self.listeners.lock();
        if listeners.get(name).map_or(false, |listener| !listener.is_closed()) {
            return Err(TransportError::AlreadyListening(name.to_string()));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        listeners.insert(name.to_string(), sender);
        Ok(receiver)
    }

    async fn complete(&self, command: TransportCommand, result: Response) -> Result<(), TransportError> {
        let not_found = || TransportError::RequestNotFound {
            name: command.name().to_string(),
            id: command.id().to_string(),
        };
        let entry = self.requests.take(command.id()).ok_or_else(not_found)?;
        let is_expired: bool = entry.is_expired();
        let is_need_reply: bool = entry.is_need_reply;
        let invocation: Invocation = entry.handle.ok_or_else(not_found)?;

        if is_expired {
            log_command(CONTEXT, &command, TransportLogType::ResponseExpired);
            let error = ExtendedError::new(format!(
                "Unable to complete \"{}\" command: timeout is expired",
                command.name()
            ));
            tracing::warn!(context = CONTEXT, "{}", error.message);
            let _ = invocation.reply.send(ResponsePayload::from_error(command.id(), &error));
            return Ok(());
        }

        let (command, payload) = match command {
            TransportCommand::Async(mut command) => {
                command.response(result);
                let response: Response = command.result().cloned().unwrap_or(Ok(None));
                let payload = ResponsePayload::from_response(command.id(), &response);
                (TransportCommand::Async(command), payload)
            }
            command => {
                let payload = ResponsePayload::from_response(command.id(), &Ok(None));
                (command, payload)
            }
        };

        let log_type = if is_need_reply {
            TransportLogType::ResponseSent
        } else {
            TransportLogType::ResponseNoReply
        };
        log_command(CONTEXT, &command, log_type);
        let _ = invocation.reply.send(payload);
        Ok(())
    }

    /// A fire-and-forget command is never submitted again by its client, so it cannot wait: it
    /// is settled with `WAIT_EXCEED` right away.
    async fn wait(&self, command: &TransportCommand) -> Result<(), TransportError> {
        let (is_exhausted, is_need_reply) = self
            .requests
            .inspect(command.id(), |entry| (entry.is_wait_exhausted(), entry.is_need_reply))
            .ok_or_else(|| TransportError::RequestNotFound {
                name: command.name().to_string(),
                id: command.id().to_string(),
            })?;

        if is_exhausted || !is_need_reply {
            let error = TransportError::WaitExceed {
                name: command.name().to_string(),
                id: command.id().to_string(),
            };
            let reply = ExtendedError::with_code(error.to_string(), codes::WAIT_EXCEED);
            if is_need_reply {
                self.complete(command.clone(), Err(reply)).await?;
            } else if let Some(invocation) = self.requests.take(command.id()).and_then(|entry| entry.handle) {
                let _ = invocation.reply.send(ResponsePayload::from_error(command.id(), &reply));
            }
            return Err(error);
        }

        let invocation: Invocation = self
            .requests
            .park(command.id())
            .ok_or_else(|| TransportError::RequestNotFound {
                name: command.name().to_string(),
                id: command.id().to_string(),
            })?;
        let error =
            ExtendedError::with_code(format!("\"{}\" command is waiting", command.name()), codes::WAIT).non_fatal();
        let _ = invocation.reply.send(ResponsePayload::from_error(command.id(), &error));
        log_command(CONTEXT, command, TransportLogType::ResponseWait);
        Ok(())
    }

    /// Chaincode events belong to a transaction: emit them through [`FabricStub::dispatch`].
    async fn dispatch(&self, _: Event) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("dispatch"))
    }

    async fn get_dispatcher(&self, _: &str) -> Result<EventReceiver, TransportError> {
        Err(TransportError::Unsupported("get_dispatcher"))
    }
}

/// Lifecycle notifications of a [`Chaincode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaincodeEvent {
    Inited,
    InvokeStarted,
    InvokeComplete,
    InvokeError,
    InvokeFinished,
}

#[derive(Debug, Clone)]
pub struct ChaincodeEventData {
    pub event: ChaincodeEvent,
    pub tx_id: String,
    pub response: Option<ResponsePayload>,
}

/// What the peer receives back from `init` or `invoke`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChaincodeResponse {
    Success(Vec<u8>),
    Error(String),
}

impl ChaincodeResponse {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Chaincode entry points bound to a [`ChaincodeTransport`].
pub struct Chaincode {
    name: String,
    transport: Arc<ChaincodeTransport>,
    events: broadcast::Sender<ChaincodeEventData>,
}

impl Chaincode {
    pub fn new(name: impl Into<String>, transport: Arc<ChaincodeTransport>) -> Self {
        Self {
            name: name.into(),
            transport,
            events: broadcast::channel(64).0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &Arc<ChaincodeTransport> {
        &self.transport
    }

    pub fn events(&self) -> broadcast::Receiver<ChaincodeEventData> {
        self.events.subscribe()
    }

    pub async fn init(&self, stub: Arc<dyn ChaincodeStub>) -> ChaincodeResponse {
        tracing::debug!(context = CONTEXT, chaincode = %self.name, "chaincode inited");
        self.emit(ChaincodeEvent::Inited, stub.as_ref(), None);
        ChaincodeResponse::Success(Vec::new())
    }

    pub async fn invoke(&self, stub: Arc<dyn ChaincodeStub>) -> ChaincodeResponse {
        self.emit(ChaincodeEvent::InvokeStarted, stub.as_ref(), None);

        let response: Option<ResponsePayload> = self.transport.invoke(stub.clone()).await;
        let is_error: bool = response.as_ref().map_or(false, |response| response.is_error);
        let event = if is_error {
            ChaincodeEvent::InvokeError
        } else {
            ChaincodeEvent::InvokeComplete
        };
        self.emit(event, stub.as_ref(), response.clone());
        self.emit(ChaincodeEvent::InvokeFinished, stub.as_ref(), response.clone());

        let content: Vec<u8> = match response.as_ref().map(ResponsePayload::to_vec) {
            Some(Ok(content)) => content,
            Some(Err(error)) => return ChaincodeResponse::Error(error.to_string()),
            None => Vec::new(),
        };
        if is_error {
            ChaincodeResponse::Error(String::from_utf8_lossy(&content).into_owned())
        } else {
            ChaincodeResponse::Success(content)
        }
    }

    fn emit(&self, event: ChaincodeEvent, stub: &dyn ChaincodeStub, response: Option<ResponsePayload>) {
        let _ = self.events.send(ChaincodeEventData {
            event,
            tx_id: stub.tx_id(),
            response,
        });
    }
}
