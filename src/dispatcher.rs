//! Alert delivery through the outbound notification channel.
//!
//! Suppressed alerts are never sent. Everything else is gated on the mute
//! controller, checked at send time. In digest mode alerts are queued and
//! flushed as a single combined message per interval; the mute check then
//! happens at flush time.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::channel::Notifier;
use crate::classifier::{Alert, AlertLevel, AlertPolicy};
use crate::mute::MuteController;
use crate::telegram::ui::{escape_html, format_time, truncate_chars};

/// Fixed closing line of every alert.
pub const CALL_TO_ACTION: &str = "Reply /kill to stop Moltbot";

/// Longest message excerpt included in an alert.
pub const ALERT_TEXT_CHARS: usize = 500;

/// Longest message excerpt per digest entry.
pub const DIGEST_TEXT_CHARS: usize = 200;

/// Entries listed in one digest before the rest are summarised.
pub const MAX_DIGEST_ENTRIES: usize = 20;

/// What happened to an alert (or digest batch) handed to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Verdict was `suppressed`; nothing to do.
    Suppressed,
    /// Alerts are muted; dropped.
    Muted,
    /// Queued for the next digest flush.
    Queued,
    /// Delivered to the notification channel.
    Sent,
    /// The channel rejected the message; logged and dropped.
    Failed,
}

/// Formats and sends alerts, honouring mute state and digest batching.
pub struct AlertDispatcher {
    notifier: Arc<dyn Notifier>,
    mute: Arc<MuteController>,
    digest: Option<Mutex<Vec<Alert>>>,
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("digest", &self.is_digest())
            .finish()
    }
}

impl AlertDispatcher {
    /// Create a dispatcher. Digest batching is enabled for [`AlertPolicy::Digest`].
    pub fn new(notifier: Arc<dyn Notifier>, mute: Arc<MuteController>, policy: AlertPolicy) -> Self {
        Self {
            notifier,
            mute,
            digest: (policy == AlertPolicy::Digest).then(|| Mutex::new(Vec::new())),
        }
    }

    /// Whether alerts are batched into digests.
    pub fn is_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// Number of alerts waiting for the next digest flush.
    pub fn pending_digest(&self) -> usize {
        self.digest.as_ref().map_or(0, |batch| {
            batch.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    /// Dispatch an alert now.
    pub async fn dispatch(&self, alert: &Alert) -> DispatchOutcome {
        self.dispatch_at(alert, Utc::now()).await
    }

    /// Dispatch an alert, evaluating mute state at `now`.
    pub async fn dispatch_at(&self, alert: &Alert, now: DateTime<Utc>) -> DispatchOutcome {
        if alert.level == AlertLevel::Suppressed {
            return DispatchOutcome::Suppressed;
        }

        if let Some(batch) = &self.digest {
            batch
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(alert.clone());
            debug!(sender = %alert.event.sender, "alert queued for digest");
            return DispatchOutcome::Queued;
        }

        if self.mute.is_muted(now) {
            info!(sender = %alert.event.sender, "alert suppressed (muted)");
            return DispatchOutcome::Muted;
        }

        self.deliver(&format_alert(alert)).await
    }

    /// Flush the digest batch now. `None` when there was nothing to send.
    pub async fn flush_digest(&self) -> Option<DispatchOutcome> {
        self.flush_digest_at(Utc::now()).await
    }

    /// Flush the digest batch, evaluating mute state at `now`.
    ///
    /// The batch is cleared whether or not it is delivered.
    pub async fn flush_digest_at(&self, now: DateTime<Utc>) -> Option<DispatchOutcome> {
        let batch = {
            let mut pending = self
                .digest
                .as_ref()?
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *pending)
        };

        if batch.is_empty() {
            return None;
        }

        if self.mute.is_muted(now) {
            info!(count = batch.len(), "digest suppressed (muted)");
            return Some(DispatchOutcome::Muted);
        }

        Some(self.deliver(&format_digest(&batch)).await)
    }

    async fn deliver(&self, text: &str) -> DispatchOutcome {
        match self.notifier.send(text).await {
            Ok(()) => DispatchOutcome::Sent,
            Err(e) => {
                warn!(error = %e, "failed to send alert");
                DispatchOutcome::Failed
            }
        }
    }
}

/// Label a sender, marking first-time senders.
fn sender_label(alert: &Alert) -> String {
    let sender = escape_html(&alert.event.sender);
    if alert.is_new_sender() {
        format!("{sender} (NEW)")
    } else {
        sender
    }
}

/// Render a single alert as an HTML notification.
pub fn format_alert(alert: &Alert) -> String {
    let header = if alert.level == AlertLevel::Suspicious {
        "<b>SUSPICIOUS INPUT DETECTED</b>"
    } else {
        "<b>MOLTBOT INPUT</b>"
    };

    let mut text = format!(
        "{header}\n\n\
         <b>Channel:</b> {channel}\n\
         <b>Sender:</b> {sender}\n\
         <b>Time:</b> {time}\n\n\
         <b>Message:</b>\n\
         <code>{message}</code>\n\n\
         <b>Flags:</b>",
        channel = escape_html(&alert.event.channel),
        sender = sender_label(alert),
        time = format_time(alert.event.timestamp),
        message = escape_html(&truncate_chars(&alert.event.text, ALERT_TEXT_CHARS)),
    );

    if alert.flags.is_empty() {
        text.push_str(" None");
    } else {
        for flag in &alert.flags {
            text.push_str(&format!("\n  - {}", escape_html(&flag.to_string())));
        }
    }

    text.push_str("\n\n");
    text.push_str(CALL_TO_ACTION);
    text
}

/// Render a batch of alerts as one HTML digest message.
pub fn format_digest(alerts: &[Alert]) -> String {
    let suspicious = alerts
        .iter()
        .filter(|a| a.level == AlertLevel::Suspicious)
        .count();

    let mut text = format!(
        "<b>MOLTBOT DIGEST</b>\n{count} inputs, {suspicious} suspicious\n",
        count = alerts.len(),
    );

    for (i, alert) in alerts.iter().take(MAX_DIGEST_ENTRIES).enumerate() {
        let marker = if alert.level == AlertLevel::Suspicious {
            " [SUSPICIOUS]"
        } else {
            ""
        };
        text.push_str(&format!(
            "\n{n}.{marker} <b>{sender}</b> via {channel} at {time}\n<code>{message}</code>\n",
            n = i.saturating_add(1),
            sender = sender_label(alert),
            channel = escape_html(&alert.event.channel),
            time = format_time(alert.event.timestamp),
            message = escape_html(&truncate_chars(&alert.event.text, DIGEST_TEXT_CHARS)),
        ));
        if !alert.flags.is_empty() {
            let flags: Vec<String> = alert.flags.iter().map(ToString::to_string).collect();
            text.push_str(&format!("Flags: {}\n", escape_html(&flags.join(", "))));
        }
    }

    let remaining = alerts.len().saturating_sub(MAX_DIGEST_ENTRIES);
    if remaining > 0 {
        text.push_str(&format!("\n...and {remaining} more\n"));
    }

    text.push('\n');
    text.push_str(CALL_TO_ACTION);
    text
}
