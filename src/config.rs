//! Configuration loading and validation.
//!
//! Loads `config.toml` with per-section defaults. Every section uses
//! `#[serde(default)]` so only `telegram.chat_id` has to be set. The file is
//! read once at startup and treated as read-only afterwards.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::classifier::{build_rules, AlertPolicy, Rule, DEFAULT_SUSPICIOUS_PATTERNS};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "MOLTBOT_WATCHER_CONFIG";

/// Top-level watcher configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Telegram alert destination and command authorization.
    pub telegram: TelegramConfig,
    /// Which logs to tail and how alerts are delivered.
    pub watch: WatchConfig,
    /// Classification rules and deny-list.
    pub patterns: PatternsConfig,
    /// `/mute` durations.
    pub mute: MuteConfig,
    /// Commands controlling the monitored process.
    pub moltbot: MoltbotConfig,
    /// Persistent state.
    pub state: StateConfig,
}

/// Telegram settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Environment variable name holding the bot token.
    pub bot_token_env: String,

    /// Chat receiving alerts.
    pub chat_id: i64,

    /// Telegram user ids allowed to issue commands. Empty means `[chat_id]`.
    pub allowed_senders: Vec<i64>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token_env: default_bot_token_env(),
            chat_id: 0,
            allowed_senders: Vec::new(),
        }
    }
}

impl TelegramConfig {
    /// Effective allow-set as sender identity strings.
    pub fn allowed_senders(&self) -> Vec<String> {
        if self.allowed_senders.is_empty() {
            vec![self.chat_id.to_string()]
        } else {
            self.allowed_senders.iter().map(ToString::to_string).collect()
        }
    }
}

/// Log tailing and alert delivery.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Glob patterns of JSONL session logs. `~` is expanded.
    pub paths: Vec<String>,

    /// Which classified events produce notifications.
    pub alert_level: AlertPolicy,

    /// Minutes between digest messages in `digest` mode.
    pub digest_interval_minutes: u64,

    /// Seconds between polls.
    pub poll_interval_secs: u64,

    /// Read files present at startup from the beginning instead of EOF.
    pub replay_from_start: bool,

    /// Wake the tailer on filesystem change notifications.
    pub use_notify: bool,

    /// Alerts retained for `/recent`.
    pub recent_capacity: usize,

    /// Lines longer than this many bytes are discarded.
    pub max_line_bytes: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            paths: default_watch_paths(),
            alert_level: AlertPolicy::default(),
            digest_interval_minutes: default_digest_interval_minutes(),
            poll_interval_secs: default_poll_interval_secs(),
            replay_from_start: false,
            use_notify: true,
            recent_capacity: default_recent_capacity(),
            max_line_bytes: crate::tailer::DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl WatchConfig {
    /// Glob patterns with `~` expanded.
    pub fn expanded_paths(&self) -> Vec<String> {
        self.paths
            .iter()
            .map(|p| expand_home(p).to_string_lossy().into_owned())
            .collect()
    }
}

/// A named regex rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleConfig {
    /// Stable rule id reported in `pattern:<id>` flags.
    pub id: String,
    /// Case-insensitive regex.
    pub regex: String,
}

/// Classification rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatternsConfig {
    /// Bare patterns; each rule's id is its pattern text.
    pub suspicious: Vec<String>,

    /// Rules with explicit ids.
    pub rules: Vec<RuleConfig>,

    /// Senders whose events are always suppressed.
    pub blocked_senders: Vec<String>,
}

impl Default for PatternsConfig {
    fn default() -> Self {
        Self {
            suspicious: DEFAULT_SUSPICIOUS_PATTERNS
                .iter()
                .map(|p| (*p).to_owned())
                .collect(),
            rules: Vec::new(),
            blocked_senders: Vec::new(),
        }
    }
}

impl PatternsConfig {
    /// Compile the configured rule set, bare patterns first.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid regex, an empty id, or a duplicate id.
    pub fn rules(&self) -> anyhow::Result<Vec<Rule>> {
        let specs = self
            .suspicious
            .iter()
            .map(|p| (p.as_str(), p.as_str()))
            .chain(self.rules.iter().map(|r| (r.id.as_str(), r.regex.as_str())));
        build_rules(specs).context("invalid [patterns] configuration")
    }
}

/// `/mute` durations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuteConfig {
    /// Duration when `/mute` has no valid argument.
    pub default_minutes: u32,

    /// Upper bound on any mute.
    pub max_minutes: u32,
}

impl Default for MuteConfig {
    fn default() -> Self {
        Self {
            default_minutes: default_mute_minutes(),
            max_minutes: default_max_mute_minutes(),
        }
    }
}

/// Commands controlling the monitored process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MoltbotConfig {
    /// Command line for `/start_moltbot`.
    pub start_command: String,

    /// Command line for `/kill`. Terminating processes matching
    /// `process_pattern` is the fallback.
    pub stop_command: String,

    /// Optional liveness command: exit 0 running, exit 1 stopped.
    pub status_command: String,

    /// Regex matched against running command lines for the stop fallback and
    /// liveness. The watcher's own process never matches.
    pub process_pattern: String,

    /// Optional pid file checked with `kill -0`.
    pub pid_file: String,

    /// Timeout for every process-control invocation.
    pub command_timeout_secs: u64,
}

impl Default for MoltbotConfig {
    fn default() -> Self {
        Self {
            start_command: default_start_command(),
            stop_command: default_stop_command(),
            status_command: String::new(),
            process_pattern: default_process_pattern(),
            pid_file: String::new(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

/// Persistent state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Keep known senders across restarts.
    pub persist_senders: bool,

    /// SQLite database path. `~` is expanded.
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            persist_senders: true,
            db_path: default_db_path(),
        }
    }
}

impl Config {
    /// Validate that configuration values are within sane bounds.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.telegram.chat_id != 0, "telegram.chat_id must be set");
        anyhow::ensure!(
            !self.telegram.bot_token_env.trim().is_empty(),
            "telegram.bot_token_env must not be empty"
        );
        anyhow::ensure!(
            !self.watch.paths.is_empty(),
            "watch.paths must contain at least one glob"
        );
        anyhow::ensure!(
            self.watch.poll_interval_secs >= 1,
            "watch.poll_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.watch.digest_interval_minutes >= 1,
            "watch.digest_interval_minutes must be >= 1"
        );
        anyhow::ensure!(
            self.watch.recent_capacity >= RECENT_MIN_CAPACITY,
            "watch.recent_capacity must be >= {RECENT_MIN_CAPACITY}"
        );
        anyhow::ensure!(
            self.watch.max_line_bytes >= 1024,
            "watch.max_line_bytes must be >= 1024"
        );
        anyhow::ensure!(
            self.mute.default_minutes >= 1,
            "mute.default_minutes must be >= 1"
        );
        anyhow::ensure!(
            self.mute.max_minutes >= self.mute.default_minutes,
            "mute.max_minutes must be >= mute.default_minutes"
        );
        anyhow::ensure!(
            !self.moltbot.process_pattern.trim().is_empty(),
            "moltbot.process_pattern must not be empty"
        );
        regex::Regex::new(&self.moltbot.process_pattern)
            .context("moltbot.process_pattern is not a valid regex")?;
        anyhow::ensure!(
            (1..=300).contains(&self.moltbot.command_timeout_secs),
            "moltbot.command_timeout_secs must be in [1, 300]"
        );
        anyhow::ensure!(
            !self.state.persist_senders || !self.state.db_path.trim().is_empty(),
            "state.db_path must be set when state.persist_senders is true"
        );
        self.patterns.rules()?;
        Ok(())
    }
}

/// `/recent` shows this many alerts, so the buffer must hold at least as many.
const RECENT_MIN_CAPACITY: usize = crate::commands::RECENT_LIMIT;

/// Load configuration from a TOML file and validate it.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Resolve the default config directory (`~/.config/moltbot-watcher/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".config").join("moltbot-watcher"))
}

/// The default config file path.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Expand a leading `~` to the home directory.
///
/// Paths without `~`, and all paths when the home directory is unknown, are
/// returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some("") => "",
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match directories::BaseDirs::new() {
        Some(home) if rest.is_empty() => home.home_dir().to_path_buf(),
        Some(home) => home.home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

// Default value functions for serde.

fn default_bot_token_env() -> String {
    "MOLTBOT_WATCHER_TELEGRAM_TOKEN".to_owned()
}

fn default_watch_paths() -> Vec<String> {
    vec!["~/.moltbot/agents/*/sessions/*.jsonl".to_owned()]
}

fn default_digest_interval_minutes() -> u64 {
    15
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_recent_capacity() -> usize {
    10
}

fn default_mute_minutes() -> u32 {
    30
}

fn default_max_mute_minutes() -> u32 {
    1440
}

fn default_start_command() -> String {
    "moltbot gateway start".to_owned()
}

fn default_stop_command() -> String {
    "moltbot gateway stop".to_owned()
}

fn default_process_pattern() -> String {
    "moltbot gateway".to_owned()
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_db_path() -> String {
    "~/.config/moltbot-watcher/state.db".to_owned()
}
