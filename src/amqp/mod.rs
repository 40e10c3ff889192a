use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use config::AmqpSettings;

use crate::command::{AsyncCommand, Command, Event, Response, TransportCommand};
use crate::error::{codes, ExtendedError, TransportError};
use crate::options::CommandOptions;
use crate::pending::PendingReplies;
use crate::request::{wait_budget_exceeded, RequestTable, TrackRequest};
use crate::transport::{
    log_command, log_event, CommandReceiver, EventReceiver, Transport, TransportLogType, EVENT_CAPACITY,
};

mod config;
pub mod message;

const CONTEXT: &str = "AmqpTransport";

/// Fanout exchange carrying every broadcast event.
pub const EVENT_EXCHANGE: &str = "GATEWAY_EVENT_EXCHANGE";
pub const REPLY_POSTFIX: &str = ".REPLY";
pub const DELAY_POSTFIX: &str = "_delay";

/// Health of the broker connection, published on [`AmqpTransport::state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// The connection was lost and could not be restored. The hosting process decides what to do.
    Failed(String),
    /// Closed through [`AmqpTransport::disconnect`].
    Closed,
}

struct Session {
    connection: Connection,
    channel: Channel,
    generation: u64,
}

/// A delivery owned by a handler until `complete` or `wait`.
struct Received {
    acker: Acker,
    data: Vec<u8>,
    properties: BasicProperties,
}

/// [`Transport`] over a RabbitMQ broker.
///
/// Every command name owns a durable queue bound to a direct exchange of the same name. Replies
/// travel through an exclusive `<name>.REPLY.<uid>` queue per command name, and `wait` parks a
/// delivery in a `<name>_delay` queue whose dead-letter policy routes it back once its TTL
/// elapses.
pub struct AmqpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    settings: AmqpSettings,
    uid: String,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    asserted: Mutex<HashSet<String>>,
    reply_queues: Mutex<HashMap<String, String>>,
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<TransportCommand>>>,
    dispatchers: Mutex<HashMap<String, broadcast::Sender<Event>>>,
    is_event_consumed: AtomicBool,
    replies: Arc<PendingReplies>,
    requests: RequestTable<Received>,
    state: watch::Sender<ConnectionState>,
    errors: mpsc::UnboundedSender<u64>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpTransport {
    /// Connects to the broker, retrying every `reconnect_delay` until `connection_timeout` or
    /// `reconnect_max_attempts` is exhausted.
    pub async fn connect(settings: AmqpSettings) -> Result<Self, TransportError> {
        settings.uri()?;
        let (errors, errors_receiver) = mpsc::unbounded_channel::<u64>();
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let inner = Arc::new(Inner {
            settings,
            uid: Uuid::new_v4().to_string(),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            asserted: Mutex::new(HashSet::new()),
            reply_queues: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            dispatchers: Mutex::new(HashMap::new()),
            is_event_consumed: AtomicBool::new(false),
            replies: PendingReplies::new(),
            requests: RequestTable::default(),
            state,
            errors,
            supervisor: Mutex::new(None),
        });

        if let Err(error) = inner.establish().await {
            inner.state.send_replace(ConnectionState::Failed(error.to_string()));
            return Err(error);
        }
        *inner.supervisor.lock() = Some(supervise(&inner, errors_receiver));
        Ok(Self { inner })
    }

    pub fn settings(&self) -> &AmqpSettings {
        &self.inner.settings
    }

    /// Follows the connection health. `Failed` is terminal.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// How many times a command currently owned by a handler went through the delay queue.
    pub fn retry_count(&self, command: &TransportCommand) -> Option<u32> {
        self.inner.requests.inspect(command.id(), |entry| entry.wait_count)
    }

    /// Number of `send_listen` calls still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.inner.replies.len()
    }

    /// Stops supervision, rejects every pending reply and closes the connection.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(supervisor) = self.inner.supervisor.lock().take() {
            supervisor.abort();
        }
        let session = self.inner.session.lock().take();
        self.inner.reset(&ExtendedError::with_code("Transport disconnected", codes::NO_CONNECTION));
        self.inner.listeners.lock().clear();
        self.inner.state.send_replace(ConnectionState::Closed);

        match session {
            Some(session) => Ok(session.connection.close(200, "OK").await?),
            None => Ok(()),
        }
    }
}

fn supervise(inner: &Arc<Inner>, mut errors: mpsc::UnboundedReceiver<u64>) -> JoinHandle<()> {
    let inner: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(generation) = errors.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            let Some(lost) = inner.drop_session(generation) else { continue };
            if lost.connection.status().connected() {
                if let Err(error) = lost.connection.close(200, "Channel closed").await {
                    tracing::warn!(context = CONTEXT, "unable to close the previous connection: {}", error);
                }
            }
            if inner.settings.fail_on_disconnect {
                inner
                    .state
                    .send_replace(ConnectionState::Failed("connection lost".to_string()));
                break;
            }
            match inner.establish().await {
                Ok(()) => inner.resubscribe().await,
                Err(error) => {
                    tracing::error!(context = CONTEXT, "unable to restore connection: {}", error);
                    inner.state.send_replace(ConnectionState::Failed(error.to_string()));
                    break;
                }
            }
        }
    })
}

impl Inner {
    async fn establish(self: &Arc<Self>) -> Result<(), TransportError> {
        self.state.send_replace(ConnectionState::Connecting);
        let started = tokio::time::Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.open_session().await {
                Ok(session) => {
                    *self.session.lock() = Some(session);
                    self.state.send_replace(ConnectionState::Connected);
                    tracing::info!(context = CONTEXT, attempt, host = %self.settings.host, "connected");
                    return Ok(());
                }
                Err(error) => {
                    tracing::warn!(context = CONTEXT, attempt, "unable to connect: {}", error);
                    let out_of_attempts = self
                        .settings
                        .reconnect_max_attempts
                        .map_or(false, |max| attempt >= max);
                    let out_of_time =
                        started.elapsed() + self.settings.reconnect_delay > self.settings.connection_timeout;
                    if out_of_attempts || out_of_time {
                        return Err(TransportError::ConnectionTimeout(format!(
                            "{} after {} attempts",
                            error, attempt
                        )));
                    }
                    tokio::time::sleep(self.settings.reconnect_delay).await;
                }
            }
        }
    }

    async fn open_session(&self) -> Result<Session, TransportError> {
        let generation: u64 = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Connection::connect_uri(self.settings.uri()?, ConnectionProperties::default()).await?;

        let errors = self.errors.clone();
        connection.on_error(move |error| {
            tracing::error!(context = CONTEXT, "connection error: {}", error);
            let _ = errors.send(generation);
        });

        let channel = connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        Ok(Session {
            connection,
            channel,
            generation,
        })
    }

    /// Forgets the session of `generation`. Returns `None` for a stale error of an older session.
    fn drop_session(&self, generation: u64) -> Option<Session> {
        let lost: Session = {
            let mut session = self.session.lock();
            if session.as_ref().map(|session| session.generation) != Some(generation) {
                return None;
            }
            session.take()?
        };
        self.state.send_replace(ConnectionState::Connecting);
        self.reset(&ExtendedError::with_code("Connection closed", codes::NO_CONNECTION));
        Some(lost)
    }

    /// Clears everything bound to the lost connection.
    fn reset(&self, error: &ExtendedError) {
        self.asserted.lock().clear();
        self.reply_queues.lock().clear();
        self.is_event_consumed.store(false, Ordering::SeqCst);
        let rejected: usize = self.replies.reject_all(error);
        let dropped: usize = self.requests.drain().len();
        tracing::warn!(context = CONTEXT, rejected, dropped, "{}", error.message);
    }

    async fn resubscribe(self: &Arc<Self>) {
        let names: Vec<String> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, listener)| !listener.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            if let Err(error) = self.consume_commands(&name).await {
                tracing::error!(context = CONTEXT, command.name = %name, "unable to listen again: {}", error);
            }
        }

        let has_dispatchers: bool = !self.dispatchers.lock().is_empty();
        if has_dispatchers {
            if let Err(error) = self.consume_events().await {
                tracing::error!(context = CONTEXT, "unable to consume events again: {}", error);
            }
        }
    }

    /// The shared channel of the current session.
    ///
    /// The broker closes a channel on its own, e.g. after a declaration with mismatched arguments,
    /// while the connection stays up. Such a session is handed to the supervisor to be rebuilt.
    fn channel(&self) -> Result<Channel, TransportError> {
        let session = self.session.lock();
        let session: &Session = session
            .as_ref()
            .ok_or_else(|| TransportError::NoConnection("no broker connection".to_string()))?;
        if session.channel.status().connected() {
            return Ok(session.channel.clone());
        }

        tracing::warn!(context = CONTEXT, generation = session.generation, "channel closed by the broker");
        let _ = self.errors.send(session.generation);
        Err(TransportError::NoConnection("broker channel closed".to_string()))
    }

    /// Lets a stopped consumer trigger the recovery of a closed channel.
    fn check_channel(&self) {
        let _ = self.channel();
    }

    fn is_asserted(&self, name: &str) -> bool {
        self.asserted.lock().contains(name)
    }

    /// Declares the `name` direct exchange and durable queue, once per connection.
    async fn assert_queue(&self, channel: &Channel, name: &str) -> Result<(), TransportError> {
        if self.is_asserted(name) {
            return Ok(());
        }
        channel
            .exchange_declare(name, ExchangeKind::Direct, durable_exchange(), FieldTable::default())
            .await?;
        channel
            .queue_declare(name, durable_queue(), FieldTable::default())
            .await?;
        channel
            .queue_bind(name, name, name, QueueBindOptions::default(), FieldTable::default())
            .await?;
        self.asserted.lock().insert(name.to_string());
        Ok(())
    }

    /// Declares the delay queue of `name`: no consumer, a TTL, and a dead-letter route back to
    /// `name`.
    async fn assert_delay(&self, channel: &Channel, name: &str) -> Result<String, TransportError> {
        let delay: String = format!("{}{}", name, DELAY_POSTFIX);
        if self.is_asserted(&delay) {
            return Ok(delay);
        }

        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-message-ttl".into(),
            AMQPValue::LongUInt(u32::try_from(self.settings.delay_ttl.as_millis()).unwrap_or(u32::MAX)),
        );
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(LongString::from(name.to_string())),
        );
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(LongString::from(name.to_string())),
        );

        channel
            .exchange_declare(&delay, ExchangeKind::Direct, durable_exchange(), FieldTable::default())
            .await?;
        channel.queue_declare(&delay, durable_queue(), arguments).await?;
        channel
            .queue_bind(&delay, &delay, "", QueueBindOptions::default(), FieldTable::default())
            .await?;
        self.asserted.lock().insert(delay.clone());
        Ok(delay)
    }

    async fn assert_event_exchange(&self, channel: &Channel) -> Result<(), TransportError> {
        if self.is_asserted(EVENT_EXCHANGE) {
            return Ok(());
        }
        channel
            .exchange_declare(
                EVENT_EXCHANGE,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.asserted.lock().insert(EVENT_EXCHANGE.to_string());
        Ok(())
    }

    /// Returns the reply queue of `name`, declaring and consuming it on first use.
    async fn reply_queue(self: &Arc<Self>, channel: &Channel, name: &str) -> Result<String, TransportError> {
        if let Some(queue) = self.reply_queues.lock().get(name) {
            return Ok(queue.clone());
        }

        let queue: String = format!("{}{}.{}", name, REPLY_POSTFIX, self.uid);
        let options = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        channel.queue_declare(&queue, options, FieldTable::default()).await?;
        let consumer: Consumer = channel
            .basic_consume(&queue, "", no_ack(), FieldTable::default())
            .await?;
        self.spawn_reply_consumer(consumer);

        self.reply_queues.lock().insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    fn spawn_reply_consumer(self: &Arc<Self>, mut consumer: Consumer) {
        let inner: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let Some(inner) = inner.upgrade() else { break };
                match delivery {
                    Ok(delivery) => inner.on_reply(&delivery),
                    Err(error) => {
                        tracing::warn!(context = CONTEXT, "reply consumer stopped: {}", error);
                        inner.check_channel();
                        break;
                    }
                }
            }
        });
    }

    fn on_reply(&self, delivery: &Delivery) {
        let Some(id) = delivery.properties.correlation_id().as_ref().map(ShortString::as_str) else {
            tracing::warn!(context = CONTEXT, "reply without correlation id ignored");
            return;
        };

        let response: Response = message::decode_reply(delivery.properties.headers().as_ref(), &delivery.data);
        let mark = TransportLogType::ResponseReceived.mark();
        if self.replies.settle(id, response) {
            tracing::debug!(context = CONTEXT, command.id = %id, "{} reply settled", mark);
        } else {
            tracing::debug!(
                context = CONTEXT,
                command.id = %id,
                "{} reply for an unknown or expired command ignored",
                mark
            );
        }
    }

    async fn consume_commands(self: &Arc<Self>, name: &str) -> Result<(), TransportError> {
        let channel: Channel = self.channel()?;
        self.assert_queue(&channel, name).await?;
        let mut consumer: Consumer = channel
            .basic_consume(name, "", BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        let inner: Weak<Self> = Arc::downgrade(self);
        let name: String = name.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let Some(inner) = inner.upgrade() else { break };
                match delivery {
                    Ok(delivery) => {
                        if !inner.on_command(&name, delivery).await {
                            let tag = consumer.tag();
                            let cancelled = channel.basic_cancel(tag.as_str(), BasicCancelOptions::default()).await;
                            if let Err(error) = cancelled {
                                tracing::warn!(context = CONTEXT, command.name = %name, "unable to cancel: {}", error);
                            }
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(context = CONTEXT, command.name = %name, "consumer stopped: {}", error);
                        inner.check_channel();
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Hands a delivery to the listener of `name`. Returns false once the listener is gone.
    async fn on_command(&self, name: &str, delivery: Delivery) -> bool {
        for (id, entry) in self.requests.purge_expired() {
            let mark = TransportLogType::RequestExpired.mark();
            tracing::warn!(context = CONTEXT, command.id = %id, "{} request expired", mark);
            if let Some(received) = entry.handle {
                reject(&received.acker, false).await;
            }
        }

        let Delivery {
            data, properties, acker, ..
        } = delivery;

        let headers = match message::parse_request(&properties) {
            Ok(headers) => headers,
            Err(error) => {
                tracing::warn!(context = CONTEXT, command.name = %name, "{}", error);
                reject(&acker, false).await;
                return true;
            }
        };
        let request: Value = match serde_json::from_slice(&data) {
            Ok(request) => request,
            Err(error) => {
                let error = TransportError::InvalidData(error.to_string());
                tracing::warn!(context = CONTEXT, command.name = %name, command.id = %headers.id, "{}", error);
                reject(&acker, false).await;
                return true;
            }
        };

        let command: TransportCommand = if headers.is_async {
            AsyncCommand::with_id(headers.id.as_str(), name, request).into()
        } else {
            Command::with_id(headers.id.as_str(), name, request).into()
        };

        let wait_count: u32 = message::death_count(&properties);
        let tracked = self.requests.track(
            &headers.id,
            TrackRequest {
                is_need_reply: headers.is_need_reply,
                timeout: headers.timeout,
                options: CommandOptions::default(),
                wait_count: Some(wait_count),
            },
            Received {
                acker,
                data,
                properties,
            },
        );

        if tracked.is_expired {
            log_command(CONTEXT, &command, TransportLogType::RequestExpired);
            if let Some(received) = self.requests.take(&headers.id).and_then(|entry| entry.handle) {
                reject(&received.acker, false).await;
            }
            return true;
        }

        log_command(CONTEXT, &command, TransportLogType::RequestReceived);
        let listener = self.listeners.lock().get(name).cloned();
        match listener.map(|listener| listener.send(command)) {
            Some(Ok(())) => true,
            _ => {
                if let Some(received) = self.requests.take(&headers.id).and_then(|entry| entry.handle) {
                    reject(&received.acker, true).await;
                }
                false
            }
        }
    }

    async fn consume_events(self: &Arc<Self>) -> Result<(), TransportError> {
        let channel: Channel = self.channel()?;
        self.assert_event_exchange(&channel).await?;

        let options = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        let queue = channel.queue_declare("", options, FieldTable::default()).await?;
        channel
            .queue_bind(
                queue.name().as_str(),
                EVENT_EXCHANGE,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let mut consumer: Consumer = channel
            .basic_consume(queue.name().as_str(), "", no_ack(), FieldTable::default())
            .await?;

        let inner: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let Some(inner) = inner.upgrade() else { break };
                match delivery {
                    Ok(delivery) => inner.on_event(&delivery.data),
                    Err(error) => {
                        tracing::warn!(context = CONTEXT, "event consumer stopped: {}", error);
                        inner.check_channel();
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    fn on_event(&self, data: &[u8]) {
        let event: Event = match serde_json::from_slice(data) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(context = CONTEXT, "invalid event: {}", error);
                return;
            }
        };
        log_event(CONTEXT, &event, TransportLogType::EventReceived);
        if let Some(sender) = self.dispatchers.lock().get(&event.name) {
            let _ = sender.send(event);
        }
    }

    async fn complete(&self, command: TransportCommand, result: Response) -> Result<(), TransportError> {
        let not_found = || TransportError::RequestNotFound {
            name: command.name().to_string(),
            id: command.id().to_string(),
        };
        let entry = self.requests.take(command.id()).ok_or_else(not_found)?;
        let is_expired: bool = entry.is_expired();
        let is_need_reply: bool = entry.is_need_reply;
        let received: Received = entry.handle.ok_or_else(not_found)?;

        let published: Result<(), TransportError> = match command {
            TransportCommand::Async(mut command) if is_need_reply => {
                let reply_to = received.properties.reply_to().as_ref().map(ShortString::as_str);
                match reply_to {
                    Some(_) if is_expired => {
                        log_command(CONTEXT, &command.into(), TransportLogType::ResponseExpired);
                        Ok(())
                    }
                    Some(reply_to) => {
                        command.response(result);
                        let response: Response = command.result().cloned().unwrap_or(Ok(None));
                        let sent = self.reply(reply_to, command.id(), &response).await;
                        log_command(CONTEXT, &command.into(), TransportLogType::ResponseSent);
                        sent
                    }
                    None => Err(TransportError::InvalidHeaders(format!(
                        "command {} has no reply queue",
                        command.id()
                    ))),
                }
            }
            command => {
                log_command(CONTEXT, &command, TransportLogType::ResponseNoReply);
                Ok(())
            }
        };

        received.acker.ack(BasicAckOptions::default()).await?;
        published
    }

    async fn reply(&self, reply_to: &str, id: &str, response: &Response) -> Result<(), TransportError> {
        let (body, headers) = message::encode_reply(response)?;
        let properties = BasicProperties::default()
            .with_correlation_id(ShortString::from(id))
            .with_content_type(ShortString::from("application/json"))
            .with_headers(headers);
        publish(&self.channel()?, "", reply_to, &body, properties).await
    }

    async fn wait(&self, command: &TransportCommand) -> Result<(), TransportError> {
        let (wait_count, timeout, is_exhausted) = self
            .requests
            .inspect(command.id(), |entry| (entry.wait_count, entry.timeout, entry.is_wait_exhausted()))
            .ok_or_else(|| TransportError::RequestNotFound {
                name: command.name().to_string(),
                id: command.id().to_string(),
            })?;

        if is_exhausted || wait_budget_exceeded(wait_count, self.settings.delay_ttl, timeout) {
            let error = TransportError::WaitExceed {
                name: command.name().to_string(),
                id: command.id().to_string(),
            };
            let reply = ExtendedError::with_code(error.to_string(), codes::WAIT_EXCEED);
            self.complete(command.clone(), Err(reply)).await?;
            return Err(error);
        }

        let received: Received = self
            .requests
            .park(command.id())
            .ok_or_else(|| TransportError::RequestNotFound {
                name: command.name().to_string(),
                id: command.id().to_string(),
            })?;

        let delayed: Result<(), TransportError> = async {
            let channel: Channel = self.channel()?;
            let delay: String = self.assert_delay(&channel, command.name()).await?;
            publish(&channel, &delay, "", &received.data, received.properties.clone()).await
        }
        .await;

        match delayed {
            Ok(()) => {
                received
                    .acker
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..BasicNackOptions::default()
                    })
                    .await?;
                log_command(CONTEXT, command, TransportLogType::ResponseWait);
                Ok(())
            }
            Err(error) => {
                // Give the delivery back to the queue; it is tracked again on redelivery.
                reject(&received.acker, true).await;
                Err(error)
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.abort();
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn send(&self, command: Command, options: CommandOptions) -> Result<(), TransportError> {
        if command.request().is_null() {
            return Err(TransportError::EmptyRequest(command.name().to_string()));
        }

        let channel: Channel = self.inner.channel()?;
        self.inner.assert_queue(&channel, command.name()).await?;
        let timeout: Duration = options.timeout_or(self.inner.settings.default_timeout);
        let properties: BasicProperties = message::request_properties(&command, timeout, None);
        let body: Vec<u8> = serde_json::to_vec(command.request())?;
        publish(&channel, command.name(), command.name(), &body, properties).await?;

        log_command(CONTEXT, &command.into(), TransportLogType::RequestSent);
        Ok(())
    }

    async fn send_listen(&self, command: AsyncCommand, options: CommandOptions) -> Response {
        let timeout: Duration = options.timeout_or(self.inner.settings.default_timeout);
        let registration = self.inner.replies.register(command.command(), timeout);

        if registration.is_new() {
            let sent: Result<(), TransportError> = async {
                let channel: Channel = self.inner.channel()?;
                self.inner.assert_queue(&channel, command.name()).await?;
                let reply_to: String = self.inner.reply_queue(&channel, command.name()).await?;
                let properties = message::request_properties(command.command(), timeout, Some(&reply_to));
                let body: Vec<u8> = serde_json::to_vec(command.request())?;
                publish(&channel, command.name(), command.name(), &body, properties).await
            }
            .await;

            let command = TransportCommand::Async(command);
            match sent {
                Ok(()) => log_command(CONTEXT, &command, TransportLogType::RequestSent),
                Err(error) => {
                    log_command(CONTEXT, &command, TransportLogType::RequestNoReply);
                    self.inner.replies.settle(command.id(), Err(error.into()));
                }
            }
        }

        registration.into_future().await
    }

    async fn listen(&self, name: &str) -> Result<CommandReceiver, TransportError> {
        let receiver = {
            let mut listeners = self.inner.listeners.lock();
            if listeners.get(name).map_or(false, |listener| !listener.is_closed()) {
                return Err(TransportError::AlreadyListening(name.to_string()));
            }
            let (sender, receiver) = mpsc::unbounded_channel();
            listeners.insert(name.to_string(), sender);
            receiver
        };

        if let Err(error) = self.inner.consume_commands(name).await {
            self.inner.listeners.lock().remove(name);
            return Err(error);
        }
        Ok(receiver)
    }

    async fn complete(&self, command: TransportCommand, result: Response) -> Result<(), TransportError> {
        self.inner.complete(command, result).await
    }

    async fn wait(&self, command: &TransportCommand) -> Result<(), TransportError> {
        self.inner.wait(command).await
    }

    async fn dispatch(&self, event: Event) -> Result<(), TransportError> {
        let channel: Channel = self.inner.channel()?;
        self.inner.assert_event_exchange(&channel).await?;
        let body: Vec<u8> = serde_json::to_vec(&event)?;
        let properties = BasicProperties::default().with_content_type(ShortString::from("application/json"));
        publish(&channel, EVENT_EXCHANGE, "", &body, properties).await?;
        log_event(CONTEXT, &event, TransportLogType::EventSent);
        Ok(())
    }

    async fn get_dispatcher(&self, name: &str) -> Result<EventReceiver, TransportError> {
        let receiver: EventReceiver = self
            .inner
            .dispatchers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .subscribe();

        if !self.inner.is_event_consumed.swap(true, Ordering::SeqCst) {
            if let Err(error) = self.inner.consume_events().await {
                self.inner.is_event_consumed.store(false, Ordering::SeqCst);
                return Err(error);
            }
        }
        Ok(receiver)
    }
}

async fn publish(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    properties: BasicProperties,
) -> Result<(), TransportError> {
    let confirmation: Confirmation = channel
        .basic_publish(exchange, routing_key, BasicPublishOptions::default(), body, properties)
        .await?
        .await?;

    match confirmation {
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        Confirmation::Nack(_) => Err(TransportError::NoConnection(format!(
            "message to \"{}\" was not confirmed by the broker",
            exchange
        ))),
    }
}

async fn reject(acker: &Acker, requeue: bool) {
    let options = BasicNackOptions {
        requeue,
        ..BasicNackOptions::default()
    };
    if let Err(error) = acker.nack(options).await {
        tracing::warn!(context = CONTEXT, "unable to reject message: {}", error);
    }
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

fn no_ack() -> BasicConsumeOptions {
    BasicConsumeOptions {
        no_ack: true,
        ..BasicConsumeOptions::default()
    }
}
