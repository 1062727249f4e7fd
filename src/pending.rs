use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Error;
use crate::frame::Response;

pub type Reply = Result<Response, Error>;

struct PendingEntry {
    sender: oneshot::Sender<Reply>,
    created_at: Instant,
}

/// Requests that were sent and are waiting for their response, keyed by correlation id.
///
/// Every entry is settled at most once: it is taken out of the map before its sender is used, so a
/// late or repeated response for the same id finds nothing. Cloning is cheap and shares the table.
#[derive(Clone, Default)]
pub struct PendingRequests {
    entries: Arc<Mutex<HashMap<u32, PendingEntry>>>,
}

impl PendingRequests {
    pub fn new() -> PendingRequests {
        Self::default()
    }

    /// Registers `id` and returns the receiving end its response will be delivered to.
    pub fn register(&self, id: u32) -> Result<oneshot::Receiver<Reply>, Error> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }

        let (sender, receiver) = oneshot::channel();
        entries.insert(
            id,
            PendingEntry {
                sender,
                created_at: Instant::now(),
            },
        );
        Ok(receiver)
    }

    pub fn resolve(&self, response: Response) {
        let id = response.id;
        self.settle(id, Ok(response));
    }

    pub fn reject(&self, id: u32, err: Error) {
        self.settle(id, Err(err));
    }

    /// Guard that removes the entry for `id` when dropped, unless disarmed once the reply arrived.
    pub fn guard(&self, id: u32) -> Registration<'_> {
        Registration {
            pending: self,
            id,
            armed: true,
        }
    }

    /// Drops the entry for `id` without settling it. Returns whether it was still pending.
    pub fn remove(&self, id: u32) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Rejects every pending request with `err` and empties the table.
    pub fn drain_all_with_error(&self, err: Error) {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), %err, "rejecting pending requests");
        }
        for (_, entry) in drained {
            let _ = entry.sender.send(Err(err.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn settle(&self, id: u32, reply: Reply) {
        let entry = self.lock().remove(&id);
        match entry {
            Some(entry) => {
                debug!(id, elapsed = ?entry.created_at.elapsed(), "request settled");
                // The caller may have stopped waiting; nothing to do then.
                let _ = entry.sender.send(reply);
            }
            None => warn!(id, "received a response for a request that is not pending"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, PendingEntry>> {
        // Entries are inserted and removed whole; a poisoned map is still consistent.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Ties a pending entry to the call waiting on it. A call that is dropped before its response
/// arrives takes the entry with it.
pub struct Registration<'a> {
    pending: &'a PendingRequests,
    id: u32,
    armed: bool,
}

impl Registration<'_> {
    /// The reply was received; the entry is already gone.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.armed && self.pending.remove(self.id) {
            debug!(id = self.id, "request abandoned before it was settled");
        }
    }
}
