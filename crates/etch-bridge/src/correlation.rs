//! Correlation table - matches debuggee responses to the requests that caused them.
//!
//! Entries are keyed by the outgoing request's sequence number, so any number of
//! requests can be in flight at once. Each entry owns a oneshot sink and a timer:
//! - `resolve` delivers the debuggee's payload and cancels the timer
//! - on deadline the sink is completed with the entry's fallback payload
//!
//! Removal from the DashMap is the single point of completion, so a sink is
//! completed exactly once no matter how resolve and expiry race.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

struct PendingCorrelation {
    /// Distinguishes an entry from a later one registered under the same key.
    generation: u64,
    command: String,
    sink: oneshot::Sender<Value>,
    fallback: Value,
    cancel: CancellationToken,
}

impl PendingCorrelation {
    fn complete(self, payload: Value) {
        self.cancel.cancel();
        if self.sink.send(payload).is_err() {
            tracing::debug!(command = %self.command, "Correlation sink dropped before completion");
        }
    }

    fn complete_with_fallback(self) {
        let fallback = self.fallback.clone();
        self.complete(fallback);
    }
}

/// In-flight requests awaiting a debuggee response.
pub struct CorrelationTable {
    entries: DashMap<u64, PendingCorrelation>,
    generations: AtomicU64,
}

impl CorrelationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a pending correlation under `key`, expiring after `timeout`.
    ///
    /// An existing entry under the same key is replaced; its sink receives its
    /// fallback so the waiter behind it is released.
    pub fn register(
        self: &Arc<Self>,
        key: u64,
        command: impl Into<String>,
        sink: oneshot::Sender<Value>,
        fallback: Value,
        timeout: Duration,
    ) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let command = command.into();
        let entry = PendingCorrelation {
            generation,
            command: command.clone(),
            sink,
            fallback,
            cancel: cancel.clone(),
        };

        if let Some(replaced) = self.entries.insert(key, entry) {
            tracing::warn!(key, command = %replaced.command, "Replacing pending correlation");
            replaced.complete_with_fallback();
        }
        tracing::trace!(key, %command, ?timeout, "Registered correlation");

        let deadline = tokio::time::Instant::now() + timeout;
        let table = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(table) = table.upgrade() {
                        table.expire_generation(key, generation);
                    }
                }
            }
        });
    }

    /// Complete the entry under `key` with `payload`. Returns false if none matched.
    pub fn resolve(&self, key: u64, payload: Value) -> bool {
        match self.entries.remove(&key) {
            Some((_, entry)) => {
                tracing::debug!(key, command = %entry.command, "Resolved correlation");
                entry.complete(payload);
                true
            }
            None => false,
        }
    }

    /// Complete the oldest pending entry for `command`.
    ///
    /// Used when a response does not echo the request's sequence number.
    pub fn resolve_command(&self, command: &str, payload: Value) -> bool {
        let oldest = self
            .entries
            .iter()
            .filter(|e| e.value().command == command)
            .map(|e| *e.key())
            .min();
        match oldest {
            Some(key) => self.resolve(key, payload),
            None => false,
        }
    }

    /// Complete the entry under `key` with its fallback payload.
    pub fn expire(&self, key: u64) -> bool {
        match self.entries.remove(&key) {
            Some((_, entry)) => {
                tracing::warn!(key, command = %entry.command, "Correlation timed out - sending fallback response");
                entry.complete_with_fallback();
                true
            }
            None => false,
        }
    }

    fn expire_generation(&self, key: u64, generation: u64) {
        if let Some((_, entry)) = self
            .entries
            .remove_if(&key, |_, e| e.generation == generation)
        {
            tracing::warn!(key, command = %entry.command, "Correlation timed out - sending fallback response");
            entry.complete_with_fallback();
        }
    }

    /// Complete every pending entry with its fallback.
    pub fn drain(&self) -> usize {
        let keys: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        let mut drained = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.complete_with_fallback();
                drained += 1;
            }
        }
        drained
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            generations: AtomicU64::new(0),
        }
    }
}
