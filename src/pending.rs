use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::command::{Command, Response};
use crate::error::{codes, ExtendedError, TransportError};

/// A cloneable handle on the outcome of one in-flight `send_listen`.
pub type ReplyFuture = Shared<BoxFuture<'static, Response>>;

/// Result of [`PendingReplies::register`].
pub enum Registration {
    /// The id was not in flight: the caller owns the send.
    New(ReplyFuture),
    /// The id is already in flight: await the same outcome and do not send again.
    Existing(ReplyFuture),
}

impl Registration {
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }

    pub fn into_future(self) -> ReplyFuture {
        match self {
            Self::New(future) | Self::Existing(future) => future,
        }
    }
}

struct PendingReply {
    name: String,
    sender: oneshot::Sender<Response>,
    future: ReplyFuture,
    timer: JoinHandle<()>,
}

/// Table of replies a transport is waiting for, keyed by correlation id.
///
/// Each entry leaves the table exactly once, through whichever of [`settle`](Self::settle),
/// [`expire`](Self::expire) or [`reject_all`](Self::reject_all) happens first; later attempts
/// for the same id are no-ops.
#[derive(Default)]
pub struct PendingReplies {
    entries: Mutex<HashMap<String, PendingReply>>,
}

impl PendingReplies {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `command` and arms its timeout. Must be called from within a tokio runtime.
    pub fn register(self: &Arc<Self>, command: &Command, timeout: Duration) -> Registration {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(command.id()) {
            return Registration::Existing(entry.future.clone());
        }

        let (sender, receiver) = oneshot::channel::<Response>();
        let name: String = command.name().to_string();
        let closed = format!("\"{}\" command ({}) reply channel closed", name, command.id());
        let future: ReplyFuture = receiver
            .map(move |result| result.unwrap_or_else(|_| Err(ExtendedError::with_code(closed, codes::NO_CONNECTION))))
            .boxed()
            .shared();

        let table: Weak<Self> = Arc::downgrade(self);
        let id: String = command.id().to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.expire(&id);
            }
        });

        entries.insert(
            command.id().to_string(),
            PendingReply {
                name,
                sender,
                future: future.clone(),
                timer,
            },
        );
        Registration::New(future)
    }

    /// Resolves the entry for `id` with `response`. Returns `false` when the id is unknown,
    /// i.e. it already timed out or was settled.
    pub fn settle(&self, id: &str, response: Response) -> bool {
        let entry = self.entries.lock().remove(id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.sender.send(response);
                true
            }
            None => false,
        }
    }

    /// Rejects the entry for `id` with a timeout error.
    pub fn expire(&self, id: &str) -> bool {
        let entry = self.entries.lock().remove(id);
        match entry {
            Some(entry) => {
                tracing::warn!(command.name = %entry.name, command.id = %id, "command is timed out");
                let error = TransportError::Timeout {
                    name: entry.name,
                    id: id.to_string(),
                };
                let _ = entry.sender.send(Err(error.into()));
                true
            }
            None => false,
        }
    }

    /// Rejects every entry with `error`, returning how many were in flight.
    pub fn reject_all(&self, error: &ExtendedError) -> usize {
        let entries: Vec<PendingReply> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        let count = entries.len();
        for entry in entries {
            entry.timer.abort();
            let _ = entry.sender.send(Err(error.clone()));
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
