//! Time-boxed alert muting.
//!
//! Expiry is checked lazily on every read: there is no timer task, so a stale
//! `active` flag is cleared by whichever dispatch or query observes it first.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::info;

/// Snapshot of the mute state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MuteState {
    /// Whether alerts are currently muted.
    pub active: bool,
    /// When the mute lapses. `None` when inactive.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Guards the shared [`MuteState`].
#[derive(Debug, Default)]
pub struct MuteController {
    state: Mutex<MuteState>,
}

impl MuteController {
    /// Create an unmuted controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether alerts are muted at `now`, expiring the mute if it has lapsed.
    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        self.state_at(now).active
    }

    /// Current state at `now`, after lazy expiry.
    pub fn state_at(&self, now: DateTime<Utc>) -> MuteState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.active && state.expires_at.is_none_or(|expiry| now >= expiry) {
            info!("mute expired");
            *state = MuteState::default();
        }
        *state
    }

    /// Mute for `duration` starting at `now`. Returns the expiry time.
    ///
    /// A non-positive duration clears the mute instead.
    pub fn set_mute(&self, now: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let expiry = now.checked_add_signed(duration).filter(|e| *e > now);
        *state = MuteState {
            active: expiry.is_some(),
            expires_at: expiry,
        };
        expiry
    }

    /// Lift any active mute.
    pub fn clear_mute(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = MuteState::default();
    }
}
