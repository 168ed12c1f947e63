//! The set of connected client sessions and their routing state.
//!
//! # For beginners: why a bounded queue per session?
//!
//! Every session has its own `mpsc` channel of already-serialized JSON
//! frames.  The WebSocket writer task drains it.  The channel is bounded,
//! and delivery uses `try_send`, which never waits: if a client stops
//! reading, *its* queue fills and it is evicted, while every other client
//! keeps receiving at full speed.
//!
//! # Locking
//!
//! The map sits behind a `std::sync::RwLock`.  Fan-out copies the eligible
//! senders out under the read lock, drops the lock, and only then delivers.
//! No lock is ever held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use iop_core::{JausAddress, MessageId};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

/// What a new session's tasks need: its id, its outbound queue and the
/// signal fired when it is evicted.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub outbox: mpsc::Receiver<String>,
    pub evicted: Arc<Notify>,
}

/// Result of queueing one frame for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The queue was full; the session is now evicted.
    Evicted,
    /// Unknown, already evicted, or closing.
    Dropped,
}

#[derive(Debug)]
struct SessionEntry {
    outbox: mpsc::Sender<String>,
    /// `None` means "every message type".
    filter: Option<HashSet<MessageId>>,
    /// JAUS source addresses this session has registered with the link.
    addresses: HashSet<JausAddress>,
    evicted: Arc<Notify>,
    is_evicted: bool,
}

impl SessionEntry {
    fn wants(&self, message_id: Option<MessageId>) -> bool {
        match (message_id, &self.filter) {
            (_, None) | (None, Some(_)) => true,
            (Some(id), Some(filter)) => filter.contains(&id),
        }
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    queue_capacity: usize,
}

impl SessionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    // A poisoned lock only means another thread panicked mid-update; the
    // map itself is still consistent, so keep serving.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self) -> SessionHandle {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let evicted = Arc::new(Notify::new());
        self.write().insert(
            id,
            SessionEntry {
                outbox: tx,
                filter: None,
                addresses: HashSet::new(),
                evicted: Arc::clone(&evicted),
                is_evicted: false,
            },
        );
        SessionHandle {
            id,
            outbox: rx,
            evicted,
        }
    }

    /// Removes a session and returns the addresses it had registered.
    pub fn remove(&self, id: SessionId) -> Option<HashSet<JausAddress>> {
        self.write().remove(&id).map(|entry| entry.addresses)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn is_evicted(&self, id: SessionId) -> bool {
        self.read().get(&id).is_some_and(|entry| entry.is_evicted)
    }

    /// Replaces the session's subscription filter.  Returns `false` for an
    /// unknown session.
    pub fn set_filter(&self, id: SessionId, filter: Option<Vec<MessageId>>) -> bool {
        match self.write().get_mut(&id) {
            Some(entry) => {
                entry.filter = filter.map(|ids| ids.into_iter().collect());
                true
            }
            None => false,
        }
    }

    /// Records that `id` sends from `address`.  Returns `true` the first time
    /// this session claims it, i.e. when the link needs a new reference.
    pub fn claim_address(&self, id: SessionId, address: JausAddress) -> bool {
        self.write()
            .get_mut(&id)
            .is_some_and(|entry| entry.addresses.insert(address))
    }

    /// Marks a session evicted and wakes its writer.  Idempotent.
    pub fn evict(&self, id: SessionId) {
        let mut sessions = self.write();
        if let Some(entry) = sessions.get_mut(&id) {
            if !entry.is_evicted {
                entry.is_evicted = true;
                entry.evicted.notify_one();
                warn!("session {id} evicted: outbound queue full or writer stalled");
            }
        }
    }

    /// Queues one frame for one session (replies, errors, acks).
    pub fn deliver(&self, id: SessionId, text: String) -> Delivery {
        let sender = {
            let sessions = self.read();
            match sessions.get(&id) {
                Some(entry) if !entry.is_evicted => entry.outbox.clone(),
                _ => return Delivery::Dropped,
            }
        };
        self.offer(id, &sender, text)
    }

    /// Queues `text` for every live session whose filter accepts
    /// `message_id` (`None` = not a message, e.g. a status frame).
    ///
    /// Returns how many sessions received it.
    pub fn broadcast(&self, message_id: Option<MessageId>, text: &str) -> usize {
        let targets: Vec<(SessionId, mpsc::Sender<String>)> = self
            .read()
            .iter()
            .filter(|(_, entry)| !entry.is_evicted && entry.wants(message_id))
            .map(|(id, entry)| (*id, entry.outbox.clone()))
            .collect();

        targets
            .iter()
            .filter(|(id, sender)| self.offer(*id, sender, text.to_string()) == Delivery::Queued)
            .count()
    }

    fn offer(&self, id: SessionId, sender: &mpsc::Sender<String>, text: String) -> Delivery {
        match sender.try_send(text) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.evict(id);
                Delivery::Evicted
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("session {id} is closing; frame dropped");
                Delivery::Dropped
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
