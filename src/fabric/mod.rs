use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use chaincode::{
    Chaincode, ChaincodeEvent, ChaincodeEventData, ChaincodeResponse, ChaincodeStub, ChaincodeTransport, FabricStub,
};
pub use config::FabricSettings;
pub use ledger::{parse_endorsement_error, FabricConnector, FabricContract, LedgerError};
pub use payload::{FabricCommandOptions, RequestPayload, ResponsePayload, Signature};

use crate::command::{AsyncCommand, Command, Event, Response, TransportCommand};
use crate::crypto::{signing_text, CryptoError, CryptoManager, CryptoManagerFactory};
use crate::error::{codes, ExtendedError, TransportError};
use crate::options::CommandOptions;
use crate::pending::PendingReplies;
use crate::transport::{
    log_command, log_event, CommandReceiver, EventReceiver, Transport, TransportLogType, EVENT_CAPACITY,
};

mod chaincode;
mod config;
mod ledger;
mod payload;

/// The chaincode method every command is executed through.
pub const TRANSPORT_METHOD: &str = "fabricTransportExecute";

const CONTEXT: &str = "FabricTransport";

/// Signs outgoing requests on behalf of a ledger user.
#[derive(Clone)]
pub struct FabricSigner {
    user_id: String,
    public_key: String,
    private_key: String,
    manager: Arc<dyn CryptoManager>,
}

impl FabricSigner {
    pub fn new(
        user_id: impl Into<String>,
        algorithm: &str,
        public_key: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            user_id: user_id.into(),
            public_key: public_key.into(),
            private_key: private_key.into(),
            manager: CryptoManagerFactory::get(algorithm)?,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn sign(&self, command: &Command) -> Result<Signature, CryptoError> {
        let nonce: String = Uuid::new_v4().to_string();
        let text: String = signing_text(command.name(), command.request(), &nonce)?;
        Ok(Signature {
            value: self.manager.sign(&text, &self.private_key)?,
            algorithm: self.manager.algorithm().to_string(),
            public_key: self.public_key.clone(),
            nonce,
        })
    }
}

/// [`Transport`] executing commands as ledger transactions.
///
/// Every command goes through the [`TRANSPORT_METHOD`] of the chaincode, where a
/// [`ChaincodeTransport`] hands it to its listener. Only the sending half of the contract is
/// available here.
pub struct FabricTransport {
    settings: FabricSettings,
    contract: Mutex<Option<Arc<dyn FabricContract>>>,
    signer: Option<FabricSigner>,
    replies: Arc<PendingReplies>,
    dispatchers: Mutex<HashMap<String, broadcast::Sender<Event>>>,
    event_listeners: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl FabricTransport {
    /// Opens the gateway through `connector`, retrying `reconnect_max_attempts` times.
    pub async fn connect(settings: FabricSettings, connector: &dyn FabricConnector) -> Result<Self, TransportError> {
        let mut attempt: u32 = 0;
        let contract: Arc<dyn FabricContract> = loop {
            attempt += 1;
            tracing::debug!(
                context = CONTEXT,
                attempt,
                "connecting to {}:{}:{}",
                settings.identity,
                settings.network_name,
                settings.chaincode_name
            );
            match connector.connect(&settings).await {
                Ok(contract) => break contract,
                Err(error) if attempt > settings.reconnect_max_attempts => {
                    return Err(TransportError::ConnectionTimeout(format!(
                        "{} after {} attempts",
                        error, attempt
                    )));
                }
                Err(error) => {
                    tracing::warn!(context = CONTEXT, attempt, "unable to connect: {}", error);
                    tokio::time::sleep(settings.reconnect_delay).await;
                }
            }
        };

        Ok(Self {
            settings,
            contract: Mutex::new(Some(contract)),
            signer: None,
            replies: PendingReplies::new(),
            dispatchers: Mutex::new(HashMap::new()),
            event_listeners: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn with_signer(mut self, signer: FabricSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn settings(&self) -> &FabricSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.contract.lock().is_some()
    }

    /// Number of `send_listen` calls still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.replies.len()
    }

    /// Drops the gateway, stops event listeners and rejects every pending reply.
    pub fn disconnect(&self) {
        self.contract.lock().take();
        for (_, listener) in self.event_listeners.lock().drain() {
            listener.abort();
        }
        let error = ExtendedError::with_code("Fabric transport disconnected", codes::NO_CONNECTION);
        let rejected: usize = self.replies.reject_all(&error);
        tracing::info!(context = CONTEXT, rejected, "disconnected");
    }

    /// [`Transport::send_listen`] with ledger specific options, such as a read only evaluation or
    /// another user id.
    pub async fn send_listen_with(
        &self,
        command: AsyncCommand,
        options: CommandOptions,
        fabric_options: FabricCommandOptions,
    ) -> Response {
        let timeout: Duration = options.timeout_or(self.settings.default_timeout);
        let registration = self.replies.register(command.command(), timeout);
        if !registration.is_new() {
            return registration.into_future().await;
        }

        let is_read_only: bool = fabric_options.is_read_only;
        let prepared = self
            .contract()
            .and_then(|contract| Ok((contract, self.payload(command.command(), &options, fabric_options, true)?)));
        let command = TransportCommand::Async(command);

        match prepared {
            Ok((contract, payload)) => {
                log_command(CONTEXT, &command, TransportLogType::RequestSent);
                let wait_delay: Duration = options.wait_delay.unwrap_or_default().as_duration();
                tokio::spawn(execute_until_settled(
                    contract,
                    payload,
                    is_read_only,
                    wait_delay,
                    self.replies.clone(),
                ));
            }
            Err(error) => {
                self.replies.settle(command.id(), Err(error.into()));
            }
        }
        registration.into_future().await
    }

    /// [`Transport::send`] with ledger specific options.
    pub async fn send_with(
        &self,
        command: Command,
        options: CommandOptions,
        fabric_options: FabricCommandOptions,
    ) -> Result<(), TransportError> {
        let contract = self.contract()?;
        let is_read_only: bool = fabric_options.is_read_only;
        let payload: RequestPayload = self.payload(&command, &options, fabric_options, false)?;
        log_command(CONTEXT, &command.into(), TransportLogType::RequestNoReply);

        tokio::spawn(async move {
            if let Err(error) = execute(contract.as_ref(), &payload, is_read_only).await {
                tracing::error!(
                    context = CONTEXT,
                    command.name = %payload.name,
                    command.id = %payload.id,
                    code = error.code,
                    "{}",
                    error
                );
            }
        });
        Ok(())
    }

    fn contract(&self) -> Result<Arc<dyn FabricContract>, TransportError> {
        self.contract
            .lock()
            .clone()
            .ok_or_else(|| TransportError::NoConnection("fabric transport is not connected".to_string()))
    }

    fn payload(
        &self,
        command: &Command,
        options: &CommandOptions,
        mut fabric_options: FabricCommandOptions,
        is_need_reply: bool,
    ) -> Result<RequestPayload, TransportError> {
        let timeout: Duration = options.timeout_or(self.settings.default_timeout);
        fabric_options.timeout = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        fabric_options.wait_max_count = options.wait_max_count;

        if let Some(signer) = &self.signer {
            if fabric_options.user_id.is_none() {
                fabric_options.user_id = Some(signer.user_id().to_string());
            }
            fabric_options.signature = Some(signer.sign(command)?);
        }
        Ok(RequestPayload::new(command, fabric_options, is_need_reply))
    }
}

/// Submits `payload` again every `wait_delay` while the chaincode answers that the command has
/// to wait and the caller is still waiting, then settles the reply.
async fn execute_until_settled(
    contract: Arc<dyn FabricContract>,
    payload: RequestPayload,
    is_read_only: bool,
    wait_delay: Duration,
    replies: Arc<PendingReplies>,
) {
    loop {
        match execute(contract.as_ref(), &payload, is_read_only).await {
            Err(error) if error.code == codes::WAIT && replies.contains(&payload.id) => {
                tracing::debug!(
                    context = CONTEXT,
                    command.name = %payload.name,
                    command.id = %payload.id,
                    "{} {}",
                    TransportLogType::ResponseWait.mark(),
                    payload.name
                );
                tokio::time::sleep(wait_delay).await;
            }
            response => {
                let mark = TransportLogType::ResponseReceived.mark();
                if replies.settle(&payload.id, response) {
                    tracing::debug!(
                        context = CONTEXT,
                        command.name = %payload.name,
                        command.id = %payload.id,
                        "{} {}",
                        mark,
                        payload.name
                    );
                } else {
                    tracing::warn!(
                        context = CONTEXT,
                        command.name = %payload.name,
                        command.id = %payload.id,
                        "{} reply arrived after timeout",
                        mark
                    );
                }
                return;
            }
        }
    }
}

async fn execute(contract: &dyn FabricContract, payload: &RequestPayload, is_read_only: bool) -> Response {
    let args: Vec<String> = vec![serde_json::to_string(payload).map_err(TransportError::from)?];
    let result = if is_read_only {
        contract.evaluate_transaction(TRANSPORT_METHOD, &args).await
    } else {
        contract.submit_transaction(TRANSPORT_METHOD, &args).await
    };

    match result {
        Ok(data) => ResponsePayload::decode(&data),
        Err(error) => Err(parse_endorsement_error(&error)),
    }
}

#[async_trait]
impl Transport for FabricTransport {
    async fn send(&self, command: Command, options: CommandOptions) -> Result<(), TransportError> {
        self.send_with(command, options, FabricCommandOptions::default()).await
    }

    async fn send_listen(&self, command: AsyncCommand, options: CommandOptions) -> Response {
        self.send_listen_with(command, options, FabricCommandOptions::default()).await
    }

    async fn listen(&self, _: &str) -> Result<CommandReceiver, TransportError> {
        Err(TransportError::Unsupported("listen"))
    }

    async fn complete(&self, _: TransportCommand, _: Response) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("complete"))
    }

    async fn wait(&self, _: &TransportCommand) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("wait"))
    }

    async fn dispatch(&self, _: Event) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("dispatch"))
    }

    /// Follows the chaincode events named `name`.
    async fn get_dispatcher(&self, name: &str) -> Result<EventReceiver, TransportError> {
        let (sender, receiver) = {
            let mut dispatchers = self.dispatchers.lock();
            let sender = dispatchers
                .entry(name.to_string())
                .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0);
            (sender.clone(), sender.subscribe())
        };

        if self.event_listeners.lock().contains_key(name) {
            return Ok(receiver);
        }

        let mut events = self.contract()?.contract_events(name).await?;
        let event_name: String = name.to_string();
        let listener = tokio::spawn(async move {
            while let Some(data) = events.recv().await {
                let data: Option<Value> = if data.is_empty() {
                    None
                } else {
                    match serde_json::from_slice(&data) {
                        Ok(data) => Some(data),
                        Err(error) => {
                            tracing::warn!(
                                context = CONTEXT,
                                event.name = %event_name,
                                "invalid event payload: {}",
                                error
                            );
                            continue;
                        }
                    }
                };
                let event = Event::new(event_name.as_str(), data);
                log_event(CONTEXT, &event, TransportLogType::EventReceived);
                let _ = sender.send(event);
            }
        });

        let mut listeners = self.event_listeners.lock();
        match listeners.get(name) {
            // Lost a race with a concurrent subscription.
            Some(_) => listener.abort(),
            None => {
                listeners.insert(name.to_string(), listener);
            }
        }
        Ok(receiver)
    }
}

impl Drop for FabricTransport {
    fn drop(&mut self) {
        for (_, listener) in self.event_listeners.get_mut().drain() {
            listener.abort();
        }
    }
}
