//! Fixed-capacity ring of the most recently classified alerts.
//!
//! Every classified alert is recorded, including suppressed and muted ones,
//! so `/recent` reflects what the agent actually received.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::classifier::Alert;

/// Ring buffer of the last `capacity` alerts, oldest evicted first.
#[derive(Debug)]
pub struct RecentBuffer {
    capacity: usize,
    alerts: Mutex<VecDeque<Alert>>,
}

impl RecentBuffer {
    /// Create a buffer holding at most `capacity` alerts (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            alerts: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Maximum number of retained alerts.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an alert, evicting the oldest on overflow.
    pub fn record(&self, alert: Alert) {
        let mut alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
        while alerts.len() >= self.capacity {
            alerts.pop_front();
        }
        alerts.push_back(alert);
    }

    /// The last `min(k, len)` alerts, oldest first.
    pub fn snapshot(&self, k: usize) -> Vec<Alert> {
        let alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = alerts.len().saturating_sub(k);
        alerts.iter().skip(skip).cloned().collect()
    }

    /// Number of retained alerts.
    pub fn len(&self) -> usize {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
