//! The watch pipeline: tail, decode, classify, record, dispatch.
//!
//! Runs as one long-lived task. Each wake-up (poll interval tick or a
//! filesystem change notification) drains every newly completed line in
//! read order. In digest mode a second timer flushes the pending batch.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::classifier::{Alert, Classifier};
use crate::dispatcher::{AlertDispatcher, DispatchOutcome};
use crate::event::{self, DecodeError};
use crate::recent::RecentBuffer;
use crate::tailer::{LogTailer, TailedLine};

/// Counters shared between the pipeline and `/status`.
#[derive(Debug, Default)]
pub struct PipelineStats {
    lines_read: AtomicU64,
    decode_failures: AtomicU64,
    records_skipped: AtomicU64,
    alerts_classified: AtomicU64,
    alerts_dispatched: AtomicU64,
    alerts_muted: AtomicU64,
    send_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Complete lines read from watched files.
    pub lines_read: u64,
    /// Lines that were not valid JSON objects.
    pub decode_failures: u64,
    /// Valid records that were not input messages.
    pub records_skipped: u64,
    /// Message events classified.
    pub alerts_classified: u64,
    /// Alerts (or digests) delivered to the channel.
    pub alerts_dispatched: u64,
    /// Alerts (or digests) dropped because of an active mute.
    pub alerts_muted: u64,
    /// Deliveries the channel rejected.
    pub send_failures: u64,
}

impl PipelineStats {
    /// Fresh zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            lines_read: self.lines_read.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            alerts_classified: self.alerts_classified.load(Ordering::Relaxed),
            alerts_dispatched: self.alerts_dispatched.load(Ordering::Relaxed),
            alerts_muted: self.alerts_muted.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }

    /// Count a dispatcher outcome.
    pub fn record_outcome(&self, outcome: DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Sent => &self.alerts_dispatched,
            DispatchOutcome::Muted => &self.alerts_muted,
            DispatchOutcome::Failed => &self.send_failures,
            DispatchOutcome::Suppressed | DispatchOutcome::Queued => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything between the tailer and the notification channel.
#[derive(Debug)]
pub struct Pipeline {
    tailer: LogTailer,
    classifier: Arc<Classifier>,
    recent: Arc<RecentBuffer>,
    dispatcher: Arc<AlertDispatcher>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Assemble a pipeline from its stages.
    pub fn new(
        tailer: LogTailer,
        classifier: Arc<Classifier>,
        recent: Arc<RecentBuffer>,
        dispatcher: Arc<AlertDispatcher>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            tailer,
            classifier,
            recent,
            dispatcher,
            stats,
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Decode, classify, record and dispatch one line.
    ///
    /// Returns the alert when the line was a message event.
    pub async fn process_line(&self, line: &TailedLine) -> Option<Alert> {
        self.stats.lines_read.fetch_add(1, Ordering::Relaxed);
        if line.line.trim().is_empty() {
            return None;
        }

        let event = match event::decode(&line.line) {
            Ok(event) => event,
            Err(DecodeError::NotAMessage(kind)) => {
                self.stats.records_skipped.fetch_add(1, Ordering::Relaxed);
                debug!(path = %line.path.display(), kind = ?kind, "skipping non-message record");
                return None;
            }
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                debug!(path = %line.path.display(), error = %e, "dropping undecodable line");
                return None;
            }
        };

        let alert = self.classifier.classify(event).await;
        self.stats.alerts_classified.fetch_add(1, Ordering::Relaxed);
        debug!(
            channel = %alert.event.channel,
            sender = %alert.event.sender,
            level = %alert.level,
            flags = alert.flags.len(),
            "classified event"
        );

        self.recent.record(alert.clone());
        let outcome = self.dispatcher.dispatch(&alert).await;
        self.stats.record_outcome(outcome);
        Some(alert)
    }

    /// Poll the tailer once and process every line it returns.
    ///
    /// Returns the number of lines processed.
    pub async fn poll_once(&mut self) -> usize {
        let lines = self.tailer.poll();
        for line in &lines {
            self.process_line(line).await;
        }
        lines.len()
    }

    /// Flush the digest batch, counting the outcome.
    pub async fn flush_digest(&self) {
        if let Some(outcome) = self.dispatcher.flush_digest().await {
            info!(outcome = ?outcome, "digest flushed");
            self.stats.record_outcome(outcome);
        }
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// `wake` carries filesystem change notifications; `None` means pure
    /// polling. `digest_interval` is only used when the dispatcher batches.
    pub async fn run(
        mut self,
        poll_interval: Duration,
        digest_interval: Duration,
        mut wake: Option<mpsc::Receiver<()>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick fires immediately against an empty batch.
        let mut digest = self
            .dispatcher
            .is_digest()
            .then(|| tokio::time::interval(digest_interval));

        info!(
            poll_secs = poll_interval.as_secs(),
            notify = wake.is_some(),
            digest = digest.is_some(),
            "watch pipeline started"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.poll_once().await;
                }
                woke = recv_wake(&mut wake) => {
                    if woke {
                        // Coalesce a burst of notifications into one poll.
                        if let Some(rx) = wake.as_mut() {
                            while rx.try_recv().is_ok() {}
                        }
                        self.poll_once().await;
                    } else {
                        warn!("change notifications stopped, continuing with polling");
                        wake = None;
                    }
                }
                _ = tick_digest(&mut digest) => {
                    self.flush_digest().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("watch pipeline shutting down");
                        break;
                    }
                }
            }
        }

        info!("watch pipeline stopped");
    }
}

/// Wait for the next change notification, or forever without a watcher.
async fn recv_wake(wake: &mut Option<mpsc::Receiver<()>>) -> bool {
    match wake {
        Some(rx) => rx.recv().await.is_some(),
        None => std::future::pending().await,
    }
}

/// Wait for the next digest tick, or forever outside digest mode.
async fn tick_digest(digest: &mut Option<tokio::time::Interval>) {
    match digest {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Register a recursive change watcher on each root.
///
/// Returns the watcher (keep it alive) and a channel that receives one unit
/// per change event. Events are coalesced when the channel is full.
///
/// # Errors
///
/// Returns an error if the platform watcher cannot be created or a root
/// cannot be registered.
pub fn spawn_change_watcher(
    roots: &[PathBuf],
) -> anyhow::Result<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let (tx, rx) = mpsc::channel(1);

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        match event {
            Ok(evt) if evt.kind.is_access() => {}
            // A full channel already has a wake-up pending.
            Ok(_) => {
                let _ = tx.try_send(());
            }
            Err(e) => warn!(error = %e, "file watcher error"),
        }
    })?;

    for root in roots {
        watcher.watch(root, RecursiveMode::Recursive)?;
        debug!(root = %root.display(), "watching for changes");
    }

    Ok((watcher, rx))
}
