//! Operator command parsing and handling.
//!
//! Commands are handled strictly one at a time in receipt order. Every command
//! except `/help` requires the sender to be in the allow-set; anything else
//! from an unknown sender is dropped without a reply and without side effects.
//! Replies are HTML.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::channel::{InboundCommand, Notifier};
use crate::classifier::AlertPolicy;
use crate::mute::MuteController;
use crate::pipeline::PipelineStats;
use crate::process::{ProcessController, ProcessStatus};
use crate::recent::RecentBuffer;
use crate::registry::SenderRegistry;
use crate::telegram::ui::{escape_html, format_time, truncate_chars};

/// Alerts listed by `/recent`.
pub const RECENT_LIMIT: usize = 5;

/// Longest message excerpt shown by `/recent`.
pub const RECENT_TEXT_CHARS: usize = 100;

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/status`: process liveness and watcher state.
    Status,
    /// `/kill`: stop the monitored process.
    Kill,
    /// `/start_moltbot`: start the monitored process.
    StartMoltbot,
    /// `/mute [minutes]`: raw argument, validated on handling.
    Mute(Option<String>),
    /// `/unmute`: lift the mute.
    Unmute,
    /// `/recent`: latest classified events.
    Recent,
    /// `/help` (or `/start`): command list.
    Help,
    /// Anything else, verbatim.
    Unknown(String),
}

impl Command {
    /// Whether the command may be answered for senders outside the allow-set.
    pub fn is_public(&self) -> bool {
        matches!(self, Self::Help)
    }
}

/// Parse raw message text into a [`Command`].
///
/// Strips the leading `/` and any `@botname` suffix; command names are
/// matched case-insensitively.
pub fn parse(text: &str) -> Command {
    let trimmed = text.trim();
    let Some(without_slash) = trimmed.strip_prefix('/') else {
        return Command::Unknown(trimmed.to_owned());
    };

    let (full_command, args) = match without_slash.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (without_slash, ""),
    };
    let name = full_command
        .split('@')
        .next()
        .unwrap_or(full_command)
        .to_ascii_lowercase();

    match name.as_str() {
        "status" => Command::Status,
        "kill" => Command::Kill,
        "start_moltbot" => Command::StartMoltbot,
        "mute" => Command::Mute((!args.is_empty()).then(|| args.to_owned())),
        "unmute" => Command::Unmute,
        "recent" => Command::Recent,
        "help" | "start" => Command::Help,
        _ => Command::Unknown(trimmed.to_owned()),
    }
}

/// Dependencies injected into the [`CommandProcessor`].
pub struct CommandDeps {
    /// Controls the monitored process.
    pub controller: Arc<dyn ProcessController>,
    /// Where replies are sent.
    pub notifier: Arc<dyn Notifier>,
    /// Shared mute state.
    pub mute: Arc<MuteController>,
    /// Shared recent-alert buffer.
    pub recent: Arc<RecentBuffer>,
    /// Shared sender registry (for `/status`).
    pub registry: Arc<SenderRegistry>,
    /// Pipeline counters (for `/status`).
    pub stats: Arc<PipelineStats>,
    /// Active alert policy (for `/status`).
    pub policy: AlertPolicy,
    /// Sender identities allowed to issue commands.
    pub allowed_senders: Vec<String>,
    /// Mute length when `/mute` has no valid argument.
    pub default_mute_minutes: u32,
    /// Upper bound for `/mute`.
    pub max_mute_minutes: u32,
}

/// Handles inbound operator commands sequentially.
pub struct CommandProcessor {
    controller: Arc<dyn ProcessController>,
    notifier: Arc<dyn Notifier>,
    mute: Arc<MuteController>,
    recent: Arc<RecentBuffer>,
    registry: Arc<SenderRegistry>,
    stats: Arc<PipelineStats>,
    policy: AlertPolicy,
    allowed: HashSet<String>,
    default_mute_minutes: u32,
    max_mute_minutes: u32,
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("allowed", &self.allowed.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CommandProcessor {
    /// Create a processor from its dependencies.
    pub fn new(deps: CommandDeps) -> Self {
        Self {
            controller: deps.controller,
            notifier: deps.notifier,
            mute: deps.mute,
            recent: deps.recent,
            registry: deps.registry,
            stats: deps.stats,
            policy: deps.policy,
            allowed: deps.allowed_senders.into_iter().collect(),
            default_mute_minutes: deps.default_mute_minutes.max(1),
            max_mute_minutes: deps.max_mute_minutes.max(1),
        }
    }

    /// Whether `sender` is in the allow-set.
    pub fn is_authorized(&self, sender: &str) -> bool {
        self.allowed.contains(sender)
    }

    /// Handle a command at the current time. `None` means no reply.
    pub async fn handle(&self, inbound: &InboundCommand) -> Option<String> {
        self.handle_at(inbound, Utc::now()).await
    }

    /// Handle a command with an explicit clock.
    ///
    /// Authorization is checked before anything else runs.
    pub async fn handle_at(&self, inbound: &InboundCommand, now: DateTime<Utc>) -> Option<String> {
        let command = parse(&inbound.text);

        if !command.is_public() && !self.is_authorized(&inbound.sender) {
            warn!(sender = %inbound.sender, "command dropped: sender not authorized");
            return None;
        }

        debug!(sender = %inbound.sender, command = ?command, "handling command");

        let reply = match command {
            Command::Status => self.handle_status(now).await,
            Command::Kill => self.handle_kill().await,
            Command::StartMoltbot => self.handle_start().await,
            Command::Mute(arg) => self.handle_mute(arg.as_deref(), now),
            Command::Unmute => self.handle_unmute(),
            Command::Recent => self.handle_recent(),
            Command::Help => handle_help(),
            Command::Unknown(text) => handle_unknown(&text),
        };
        Some(reply)
    }

    /// Consume commands until `shutdown` flips to `true` or the source closes.
    ///
    /// A command already being handled runs to completion, including any
    /// external process invocation, before shutdown is observed.
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<InboundCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(allowed = self.allowed.len(), "command processor started");

        loop {
            tokio::select! {
                received = commands.recv() => {
                    let Some(inbound) = received else {
                        info!("command source closed");
                        break;
                    };
                    if let Some(reply) = self.handle(&inbound).await {
                        if let Err(e) = self.notifier.reply(&inbound.conversation, &reply).await {
                            warn!(error = %e, "failed to send command reply");
                        }
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("command processor shutting down");
                        break;
                    }
                }
            }
        }

        info!("command processor stopped");
    }

    async fn handle_status(&self, now: DateTime<Utc>) -> String {
        let process = match self.controller.is_running().await {
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Unknown => "unknown (check failed)",
        };

        let mute = self.mute.state_at(now);
        let alerts = match mute.expires_at {
            Some(expiry) if mute.active => format!("muted until {}", format_time(expiry)),
            _ => "active".to_owned(),
        };
        let stats = self.stats.snapshot();

        format!(
            "<b>Moltbot Status</b>\n\
             Process: {process}\n\
             Alerts: {alerts}\n\
             Alert level: {policy}\n\
             Known senders: {senders}\n\
             Lines read: {lines} ({failures} undecodable)\n\
             Alerts sent: {sent}",
            policy = self.policy,
            senders = self.registry.len(),
            lines = stats.lines_read,
            failures = stats.decode_failures,
            sent = stats.alerts_dispatched,
        )
    }

    async fn handle_kill(&self) -> String {
        info!("kill requested");
        match self.controller.stop().await {
            Ok(detail) => format!("Moltbot stopped ({}).", escape_html(&detail)),
            Err(e) => {
                warn!(error = %e, "kill failed");
                format!("Failed to stop Moltbot: {}", escape_html(&e.to_string()))
            }
        }
    }

    async fn handle_start(&self) -> String {
        info!("start requested");
        match self.controller.start().await {
            Ok(detail) => format!("Moltbot started ({}).", escape_html(&detail)),
            Err(e) => {
                warn!(error = %e, "start failed");
                format!("Failed to start Moltbot: {}", escape_html(&e.to_string()))
            }
        }
    }

    fn handle_mute(&self, arg: Option<&str>, now: DateTime<Utc>) -> String {
        let minutes = arg
            .and_then(|a| a.parse::<u32>().ok())
            .filter(|m| *m > 0)
            .unwrap_or(self.default_mute_minutes)
            .min(self.max_mute_minutes);

        match self.mute.set_mute(now, Duration::minutes(i64::from(minutes))) {
            Some(expiry) => {
                info!(minutes, "alerts muted");
                format!(
                    "Alerts muted for {minutes} minutes (until {}).",
                    format_time(expiry)
                )
            }
            None => "Could not mute alerts.".to_owned(),
        }
    }

    fn handle_unmute(&self) -> String {
        self.mute.clear_mute();
        info!("alerts unmuted");
        "Alerts unmuted.".to_owned()
    }

    fn handle_recent(&self) -> String {
        let alerts = self.recent.snapshot(RECENT_LIMIT);
        if alerts.is_empty() {
            return "No recent activity".to_owned();
        }

        let mut text = String::from("<b>Recent activity</b>\n");
        for alert in &alerts {
            let new_marker = if alert.is_new_sender() { " (NEW)" } else { "" };
            text.push_str(&format!(
                "\n{time} [{level}] <b>{sender}</b>{new_marker} via {channel}\n<code>{message}</code>\n",
                time = format_time(alert.event.timestamp),
                level = alert.level,
                sender = escape_html(&alert.event.sender),
                channel = escape_html(&alert.event.channel),
                message = escape_html(&truncate_chars(&alert.event.text, RECENT_TEXT_CHARS)),
            ));
        }
        text
    }
}

/// List the available commands.
pub fn handle_help() -> String {
    [
        "<b>Moltbot Watcher commands:</b>",
        "",
        "/status - process status and watcher state",
        "/kill - stop Moltbot",
        "/start_moltbot - start Moltbot",
        "/mute [minutes] - mute alerts",
        "/unmute - resume alerts",
        "/recent - last few inputs",
        "/help - show this message",
    ]
    .join("\n")
}

fn handle_unknown(text: &str) -> String {
    format!(
        "Unknown command: {}\nSend /help for the command list.",
        escape_html(&truncate_chars(text, RECENT_TEXT_CHARS))
    )
}
