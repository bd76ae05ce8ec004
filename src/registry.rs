//! Registry of previously seen senders, keyed by `(channel, sender)`.
//!
//! Membership only grows for the lifetime of the process. The in-memory set is
//! authoritative and its lookup-or-insert is atomic under a single mutex, so
//! events classified concurrently from different files cannot both claim to be
//! the first from a sender. When a [`StateDb`] is attached, new members are
//! written through to SQLite after the in-memory insert.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::db::StateDb;

/// Set of known sender identities.
pub struct SenderRegistry {
    known: Mutex<HashSet<(String, String)>>,
    store: Option<Arc<StateDb>>,
}

impl std::fmt::Debug for SenderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderRegistry")
            .field("known", &self.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl SenderRegistry {
    /// Create an empty, process-local registry.
    pub fn in_memory() -> Self {
        Self {
            known: Mutex::new(HashSet::new()),
            store: None,
        }
    }

    /// Create a registry seeded from, and persisted to, the state database.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored senders cannot be loaded.
    pub async fn persistent(store: Arc<StateDb>) -> anyhow::Result<Self> {
        let stored = store.load_senders().await?;
        info!(count = stored.len(), "loaded known senders");
        Ok(Self {
            known: Mutex::new(stored.into_iter().collect()),
            store: Some(store),
        })
    }

    /// Insert the pair if absent. Returns `true` when it was newly inserted.
    pub fn lookup_or_insert(&self, channel: &str, sender: &str) -> bool {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        known.insert((channel.to_owned(), sender.to_owned()))
    }

    /// [`lookup_or_insert`](Self::lookup_or_insert), then persist a new pair.
    ///
    /// Persistence failures are logged; the in-memory answer stands.
    pub async fn observe(&self, channel: &str, sender: &str, seen_at: DateTime<Utc>) -> bool {
        let inserted = self.lookup_or_insert(channel, sender);
        if inserted {
            debug!(channel, sender, "new sender");
            if let Some(store) = &self.store {
                if let Err(e) = store.insert_sender(channel, sender, seen_at).await {
                    warn!(channel, sender, error = %e, "failed to persist known sender");
                }
            }
        }
        inserted
    }

    /// Whether the pair is already known.
    pub fn contains(&self, channel: &str, sender: &str) -> bool {
        let known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        known.contains(&(channel.to_owned(), sender.to_owned()))
    }

    /// Number of known senders.
    pub fn len(&self) -> usize {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no sender has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
