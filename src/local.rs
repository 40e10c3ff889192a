use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::command::{AsyncCommand, Command, Event, Response, TransportCommand};
use crate::error::TransportError;
use crate::options::{CommandOptions, DEFAULT_TIMEOUT};
use crate::pending::PendingReplies;
use crate::transport::{
    log_command, log_event, CommandReceiver, EventReceiver, Transport, TransportLogType, EVENT_CAPACITY,
};

const CONTEXT: &str = "LocalTransport";

#[derive(Default)]
struct Subjects {
    listeners: HashMap<String, mpsc::UnboundedSender<TransportCommand>>,
    /// Commands sent before anyone listened to their name.
    buffered: HashMap<String, Vec<TransportCommand>>,
}

/// In-process transport: one channel per command name, replies correlated through
/// [`PendingReplies`].
///
/// Commands sent to a name nobody listens to yet are kept and handed to the first listener.
pub struct LocalTransport {
    subjects: Mutex<Subjects>,
    dispatchers: Mutex<HashMap<String, broadcast::Sender<Event>>>,
    replies: Arc<PendingReplies>,
    default_timeout: Duration,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::with_default_timeout(DEFAULT_TIMEOUT)
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_timeout(default_timeout: Duration) -> Self {
        Self {
            subjects: Mutex::new(Subjects::default()),
            dispatchers: Mutex::new(HashMap::new()),
            replies: PendingReplies::new(),
            default_timeout,
        }
    }

    /// Number of `send_listen` calls still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.replies.len()
    }

    /// Number of commands held for names nobody listens to.
    pub fn buffered(&self, name: &str) -> usize {
        self.subjects.lock().buffered.get(name).map_or(0, Vec::len)
    }

    fn deliver(&self, command: TransportCommand) {
        let mut subjects = self.subjects.lock();
        let command = match subjects.listeners.get(command.name()) {
            Some(listener) => match listener.send(command) {
                Ok(()) => return,
                Err(mpsc::error::SendError(command)) => command,
            },
            None => command,
        };

        // The listener went away: keep the command for the next one.
        subjects.listeners.remove(command.name());
        subjects
            .buffered
            .entry(command.name().to_string())
            .or_default()
            .push(command);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, command: Command, _: CommandOptions) -> Result<(), TransportError> {
        let command = TransportCommand::Command(command);
        log_command(CONTEXT, &command, TransportLogType::RequestSent);
        self.deliver(command);
        Ok(())
    }

    async fn send_listen(&self, command: AsyncCommand, options: CommandOptions) -> Response {
        let timeout: Duration = options.timeout_or(self.default_timeout);
        let registration = self.replies.register(command.command(), timeout);
        if registration.is_new() {
            let command = TransportCommand::Async(command);
            log_command(CONTEXT, &command, TransportLogType::RequestSent);
            self.deliver(command);
        }
        registration.into_future().await
    }

    async fn listen(&self, name: &str) -> Result<CommandReceiver, TransportError> {
        let mut subjects = self.subjects.lock();
        if subjects
            .listeners
            .get(name)
            .map_or(false, |listener| !listener.is_closed())
        {
            return Err(TransportError::AlreadyListening(name.to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        for command in subjects.buffered.remove(name).unwrap_or_default() {
            log_command(CONTEXT, &command, TransportLogType::RequestReceived);
            // The receiver is alive until this function returns.
            let _ = sender.send(command);
        }
        subjects.listeners.insert(name.to_string(), sender);
        Ok(receiver)
    }

    async fn complete(&self, command: TransportCommand, result: Response) -> Result<(), TransportError> {
        let mut command = match command {
            TransportCommand::Async(command) => command,
            command @ TransportCommand::Command(_) => {
                log_command(CONTEXT, &command, TransportLogType::ResponseNoReply);
                return Ok(());
            }
        };

        command.response(result);
        let response: Response = command.result().cloned().unwrap_or(Ok(None));
        let id: String = command.id().to_string();
        let command = TransportCommand::Async(command);

        if self.replies.settle(&id, response) {
            log_command(CONTEXT, &command, TransportLogType::ResponseSent);
        } else {
            log_command(CONTEXT, &command, TransportLogType::ResponseExpired);
        }
        Ok(())
    }

    async fn wait(&self, _: &TransportCommand) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("wait"))
    }

    async fn dispatch(&self, event: Event) -> Result<(), TransportError> {
        log_event(CONTEXT, &event, TransportLogType::EventSent);
        if let Some(sender) = self.dispatchers.lock().get(&event.name) {
            // No subscriber is not an error for a broadcast.
            let _ = sender.send(event);
        }
        Ok(())
    }

    async fn get_dispatcher(&self, name: &str) -> Result<EventReceiver, TransportError> {
        let mut dispatchers = self.dispatchers.lock();
        let sender = dispatchers
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0);
        Ok(sender.subscribe())
    }
}
