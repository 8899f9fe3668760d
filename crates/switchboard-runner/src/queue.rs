//! Per-session serialization and preemption.
//!
//! Every run for a session key chains onto the key's current tail future
//! inside one critical section, so two near-simultaneous requests are
//! guaranteed to serialize. Preemption is explicit only: a regenerate
//! request (or `/stop`) cancels the active run's token; a plain new request
//! never does - killing in-flight assistant work implicitly would throw away
//! output users care about.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A claimed position in a session's queue.
pub struct RunTicket {
    id: u64,
    session_key: String,
    prev: Option<watch::Receiver<bool>>,
    done: watch::Sender<bool>,
}

impl RunTicket {
    /// Wait until every earlier run for this key has finished.
    pub async fn wait_turn(&mut self) {
        if let Some(mut prev) = self.prev.take() {
            loop {
                if *prev.borrow() {
                    break;
                }
                // A dropped sender counts as completion.
                if prev.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Queue-tail table: session key → the tail-most run's completion future.
#[derive(Default)]
pub struct SessionQueues {
    tails: Mutex<HashMap<String, (u64, watch::Receiver<bool>)>>,
    next_id: AtomicU64,
}

impl SessionQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run at the tail of `session_key`'s queue. The returned
    /// ticket holds the previous tail to await and this run's completion
    /// signal.
    pub fn join(&self, session_key: &str) -> RunTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done, rx) = watch::channel(false);
        // Read-and-replace under one lock: the serialization guarantee.
        let prev = {
            let mut tails = self.tails.lock().unwrap();
            tails
                .insert(session_key.to_string(), (id, rx))
                .map(|(_, prev_rx)| prev_rx)
        };
        debug!(session_key, run = id, queued = prev.is_some(), "queue join");
        RunTicket {
            id,
            session_key: session_key.to_string(),
            prev,
            done,
        }
    }

    /// Resolve the ticket's completion future and clear the tail slot when
    /// this run is still tail-most. Idempotent.
    pub fn release(&self, ticket: &RunTicket) {
        let _ = ticket.done.send(true);
        let mut tails = self.tails.lock().unwrap();
        if tails
            .get(&ticket.session_key)
            .is_some_and(|(id, _)| *id == ticket.id)
        {
            tails.remove(&ticket.session_key);
            debug!(session_key = %ticket.session_key, run = ticket.id, "tail cleared");
        }
    }

    /// Whether any run is queued or active for the key.
    pub fn has_tail(&self, session_key: &str) -> bool {
        self.tails.lock().unwrap().contains_key(session_key)
    }

    pub fn len(&self) -> usize {
        self.tails.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One running child per session key.
pub struct ActiveRun {
    pub request_id: String,
    /// Cancelling this token terminates the child.
    pub kill: CancellationToken,
    /// Regenerate runs preempt; they are never preempted by arrival order.
    pub is_priority: bool,
    /// Sender handle, for monitor visibility.
    pub sender: Option<String>,
}

/// Active-run table: session key → the run whose child is alive.
#[derive(Default)]
pub struct ActiveRuns {
    map: DashMap<String, ActiveRun>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_key: &str, run: ActiveRun) {
        self.map.insert(session_key.to_string(), run);
    }

    /// Remove the entry, but only if it still belongs to `request_id` - a
    /// successor run may have already claimed the slot.
    pub fn remove(&self, session_key: &str, request_id: &str) {
        self.map
            .remove_if(session_key, |_, run| run.request_id == request_id);
    }

    /// Signal the active run (if any) to terminate. Returns whether a run
    /// was signalled. Idempotent - cancelling twice is harmless.
    pub fn kill(&self, session_key: &str) -> bool {
        match self.map.get(session_key) {
            Some(run) => {
                run.kill.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, session_key: &str) -> bool {
        self.map.contains_key(session_key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
