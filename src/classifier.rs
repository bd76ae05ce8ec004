//! Rule-based classification of message events.
//!
//! Every event becomes an [`Alert`] carrying the flags that explain it and a
//! verdict resolved from the configured [`AlertPolicy`]. Rules are identified
//! by a stable id so that alerts stay meaningful when rule text changes.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::event::MessageEvent;
use crate::registry::SenderRegistry;

/// Patterns used when the configuration does not supply any.
pub const DEFAULT_SUSPICIOUS_PATTERNS: &[&str] = &[
    "ignore.*previous",
    "disregard.*(above|prior)",
    "system prompt",
    "you are now",
    "rm -rf",
    r"curl.*\|\s*(ba)?sh",
    "(api[_-]?key|password|secret)",
];

/// Errors raised while building the rule set.
#[derive(Debug, Error)]
pub enum RuleError {
    /// The rule's regex failed to compile.
    #[error("invalid regex for rule {id:?}: {source}")]
    InvalidRegex {
        /// Rule id.
        id: String,
        /// Underlying compile error.
        #[source]
        source: regex::Error,
    },
    /// Two rules share an id.
    #[error("duplicate rule id {0:?}")]
    DuplicateId(String),
    /// A rule has an empty id.
    #[error("rule id must not be empty")]
    EmptyId,
}

/// A case-insensitive regex rule with a stable identity.
#[derive(Debug, Clone)]
pub struct Rule {
    id: String,
    regex: Regex,
}

impl Rule {
    /// Compile a rule.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError`] for an empty id or an invalid regex.
    pub fn new(id: &str, pattern: &str) -> Result<Self, RuleError> {
        if id.trim().is_empty() {
            return Err(RuleError::EmptyId);
        }
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| RuleError::InvalidRegex {
                id: id.to_owned(),
                source,
            })?;
        Ok(Self {
            id: id.to_owned(),
            regex,
        })
    }

    /// Stable rule identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the rule matches anywhere in `text`.
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Build a rule set, rejecting duplicate ids.
///
/// # Errors
///
/// Returns the first [`RuleError`] encountered.
pub fn build_rules<'a, I>(specs: I) -> Result<Vec<Rule>, RuleError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut seen = HashSet::new();
    let mut rules = Vec::new();
    for (id, pattern) in specs {
        if !seen.insert(id.to_owned()) {
            return Err(RuleError::DuplicateId(id.to_owned()));
        }
        rules.push(Rule::new(id, pattern)?);
    }
    Ok(rules)
}

/// The built-in rule set. Each rule's id is its pattern text.
pub fn default_rules() -> Vec<Rule> {
    DEFAULT_SUSPICIOUS_PATTERNS
        .iter()
        .filter_map(|p| Rule::new(p, p).ok())
        .collect()
}

/// Why an event was escalated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    /// A rule matched the message text.
    Pattern(String),
    /// First event ever seen from this `(channel, sender)`.
    NewSender,
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(id) => write!(f, "pattern:{id}"),
            Self::NewSender => f.write_str("new_sender"),
        }
    }
}

/// Verdict for a classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertLevel {
    /// Recorded but never dispatched.
    Suppressed,
    /// Dispatched as an ordinary input notification.
    Normal,
    /// Dispatched as a suspicious-input notification.
    Suspicious,
}

impl AlertLevel {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Suppressed => "suppressed",
            Self::Normal => "normal",
            Self::Suspicious => "suspicious",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which classified events produce outbound notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPolicy {
    /// Every event is dispatched.
    All,
    /// Suspicious events and first events from new senders.
    #[default]
    NewSender,
    /// Only events matching a rule.
    Suspicious,
    /// Like `all`, but batched into periodic digests.
    Digest,
}

impl AlertPolicy {
    /// Configuration name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::NewSender => "new_sender",
            Self::Suspicious => "suspicious",
            Self::Digest => "digest",
        }
    }

    /// Resolve the verdict for a set of flags.
    pub fn resolve(self, flags: &[Flag]) -> AlertLevel {
        let suspicious = flags.iter().any(|f| matches!(f, Flag::Pattern(_)));
        let new_sender = flags.contains(&Flag::NewSender);
        match self {
            Self::All | Self::Digest if suspicious => AlertLevel::Suspicious,
            Self::All | Self::Digest => AlertLevel::Normal,
            Self::NewSender if suspicious => AlertLevel::Suspicious,
            Self::NewSender if new_sender => AlertLevel::Normal,
            Self::Suspicious if suspicious => AlertLevel::Suspicious,
            Self::NewSender | Self::Suspicious => AlertLevel::Suppressed,
        }
    }
}

impl fmt::Display for AlertPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified event. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// The underlying event.
    pub event: MessageEvent,
    /// Flags in evaluation order: `new_sender` first, then rule matches.
    pub flags: Vec<Flag>,
    /// Resolved verdict.
    pub level: AlertLevel,
    /// When classification happened.
    pub classified_at: DateTime<Utc>,
}

impl Alert {
    /// Whether the `new_sender` flag is present.
    pub fn is_new_sender(&self) -> bool {
        self.flags.contains(&Flag::NewSender)
    }

    /// Ids of the rules that matched.
    pub fn pattern_ids(&self) -> impl Iterator<Item = &str> {
        self.flags.iter().filter_map(|f| match f {
            Flag::Pattern(id) => Some(id.as_str()),
            Flag::NewSender => None,
        })
    }
}

/// Applies rules and sender novelty to produce alerts.
#[derive(Debug)]
pub struct Classifier {
    rules: Vec<Rule>,
    policy: AlertPolicy,
    blocked_senders: HashSet<String>,
    registry: Arc<SenderRegistry>,
}

impl Classifier {
    /// Create a classifier.
    pub fn new(
        rules: Vec<Rule>,
        policy: AlertPolicy,
        blocked_senders: impl IntoIterator<Item = String>,
        registry: Arc<SenderRegistry>,
    ) -> Self {
        Self {
            rules,
            policy,
            blocked_senders: blocked_senders.into_iter().collect(),
            registry,
        }
    }

    /// The active alert policy.
    pub fn policy(&self) -> AlertPolicy {
        self.policy
    }

    /// Ids of the configured rules, in evaluation order.
    pub fn rule_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(Rule::id)
    }

    /// Classify an event at the current time.
    pub async fn classify(&self, event: MessageEvent) -> Alert {
        self.classify_at(event, Utc::now()).await
    }

    /// Classify an event with an explicit classification time.
    pub async fn classify_at(&self, event: MessageEvent, now: DateTime<Utc>) -> Alert {
        let blocked = self.blocked_senders.contains(&event.sender);
        let mut flags = Vec::new();

        if !blocked && self.registry.observe(&event.channel, &event.sender, now).await {
            flags.push(Flag::NewSender);
        }

        flags.extend(
            self.rules
                .iter()
                .filter(|rule| rule.is_match(&event.text))
                .map(|rule| Flag::Pattern(rule.id.clone())),
        );

        let level = if blocked {
            debug!(sender = %event.sender, "blocked sender, suppressing");
            AlertLevel::Suppressed
        } else {
            self.policy.resolve(&flags)
        };

        Alert {
            event,
            flags,
            level,
            classified_at: now,
        }
    }
}
