use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::options::CommandOptions;

/// Whether scheduling one more delayed attempt would spend the command's whole timeout.
///
/// `wait_count` is the number of delays the command has already gone through.
pub fn wait_budget_exceeded(wait_count: u32, delay_ttl: Duration, timeout: Duration) -> bool {
    (u128::from(wait_count) + 1) * delay_ttl.as_millis() >= timeout.as_millis()
}

/// Book-keeping for a command currently owned by a receiving transport.
#[derive(Debug)]
pub struct RequestEntry<H> {
    pub wait_count: u32,
    pub is_need_reply: bool,
    pub expired_date: Option<DateTime<Utc>>,
    pub timeout: Duration,
    pub options: CommandOptions,
    /// Substrate handle used to answer; `None` while the command sits in a delay.
    pub handle: Option<H>,
}

impl<H> RequestEntry<H> {
    pub fn is_expired(&self) -> bool {
        self.expired_date.map_or(false, |date| date <= Utc::now())
    }

    /// True once `wait_max_count` is reached or the deadline passed.
    pub fn is_wait_exhausted(&self) -> bool {
        let count_exceeded = self
            .options
            .wait_max_count
            .map_or(false, |max| self.wait_count >= max);
        count_exceeded || self.is_expired()
    }
}

/// What the receiving side knows about a message when it starts tracking it.
#[derive(Debug, Clone, Copy)]
pub struct TrackRequest {
    pub is_need_reply: bool,
    pub timeout: Duration,
    pub options: CommandOptions,
    /// Authoritative wait count carried by the message itself (the broker death count); when
    /// `None`, re-entries increment the stored count.
    pub wait_count: Option<u32>,
}

/// State of an entry right after [`RequestTable::track`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracked {
    pub wait_count: u32,
    pub is_expired: bool,
}

/// Commands received and not yet completed, keyed by command id.
pub struct RequestTable<H> {
    entries: Mutex<HashMap<String, RequestEntry<H>>>,
}

impl<H> Default for RequestTable<H> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<H> RequestTable<H> {
    /// Inserts the command, or registers a re-entry of an already tracked one.
    pub fn track(&self, id: &str, request: TrackRequest, handle: H) -> Tracked {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(id.to_string())
            .and_modify(|entry| {
                entry.wait_count = request.wait_count.unwrap_or(entry.wait_count + 1);
            })
            .or_insert_with(|| RequestEntry {
                wait_count: request.wait_count.unwrap_or(0),
                is_need_reply: request.is_need_reply,
                expired_date: deadline(request.is_need_reply, request.timeout),
                timeout: request.timeout,
                options: request.options,
                handle: None,
            });
        entry.handle = Some(handle);

        Tracked {
            wait_count: entry.wait_count,
            is_expired: entry.is_expired(),
        }
    }

    /// Removes the entry: the command reached its terminal state.
    pub fn take(&self, id: &str) -> Option<RequestEntry<H>> {
        self.entries.lock().remove(id)
    }

    /// Takes the handle out while keeping the entry, for a command that goes into a delay.
    ///
    /// A parked entry always gets a deadline, so one that never comes back is purged even when
    /// nobody waits for its reply.
    pub fn park(&self, id: &str) -> Option<H> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id)?;
        if entry.expired_date.is_none() {
            entry.expired_date = deadline(true, entry.timeout);
        }
        entry.handle.take()
    }

    /// Reads an entry without removing it.
    pub fn inspect<T>(&self, id: &str, f: impl FnOnce(&RequestEntry<H>) -> T) -> Option<T> {
        self.entries.lock().get(id).map(f)
    }

    /// Removes entries whose deadline passed, e.g. commands that never came back from a delay.
    pub fn purge_expired(&self) -> Vec<(String, RequestEntry<H>)> {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    pub fn drain(&self) -> Vec<(String, RequestEntry<H>)> {
        self.entries.lock().drain().collect()
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

fn deadline(is_need_reply: bool, timeout: Duration) -> Option<DateTime<Utc>> {
    if !is_need_reply {
        return None;
    }
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| Utc::now().checked_add_signed(timeout))
}
