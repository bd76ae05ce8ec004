//! Bot token resolution.
//!
//! The token is never stored in `config.toml`. It comes from the environment
//! variable named by `telegram.bot_token_env`, or from a `.env` file next to
//! the config, which must be private (0600) on unix.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::debug;

/// Values that mean "not configured yet".
const PLACEHOLDER_TOKENS: &[&str] = &["YOUR_BOT_TOKEN", "changeme", "xxx"];

/// A Telegram bot token. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct BotToken(String);

impl std::fmt::Debug for BotToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BotToken([REDACTED])")
    }
}

impl BotToken {
    /// Validate and wrap a raw token.
    ///
    /// # Errors
    ///
    /// Returns an error for empty or placeholder values and for strings that
    /// do not look like `<bot id>:<secret>`.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let token = raw.trim();
        anyhow::ensure!(!token.is_empty(), "bot token is empty");
        anyhow::ensure!(
            !PLACEHOLDER_TOKENS
                .iter()
                .any(|p| token.eq_ignore_ascii_case(p)),
            "bot token is still a placeholder"
        );
        let well_formed = token.split_once(':').is_some_and(|(id, secret)| {
            !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) && !secret.is_empty()
        });
        anyhow::ensure!(well_formed, "bot token must look like <bot id>:<secret>");
        Ok(Self(token.to_owned()))
    }

    /// The raw token, for handing to the Bot API client.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

/// Resolve the bot token from `env_var`, falling back to `env_file`.
///
/// # Errors
///
/// Returns an error if neither source provides a token, the `.env` file is
/// unreadable or too permissive, or the token fails [`BotToken::parse`].
pub fn resolve_bot_token(env_var: &str, env_file: &Path) -> anyhow::Result<BotToken> {
    if let Some(value) = std::env::var(env_var).ok().filter(|v| !v.trim().is_empty()) {
        debug!(source = env_var, "bot token read from environment");
        return BotToken::parse(&value).with_context(|| format!("invalid ${env_var}"));
    }

    if env_file.exists() {
        let vars = load_env_file(env_file)?;
        if let Some(value) = vars.get(env_var) {
            debug!(source = %env_file.display(), "bot token read from env file");
            return BotToken::parse(value)
                .with_context(|| format!("invalid {env_var} in {}", env_file.display()));
        }
    }

    anyhow::bail!(
        "telegram bot token not found: set ${env_var} or add it to {}",
        env_file.display()
    )
}

/// Parse a private `.env` file into key-value pairs.
///
/// # Errors
///
/// Returns an error if the file does not exist, permissions are too broad,
/// or parsing fails.
pub fn load_env_file(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    if !path.exists() {
        anyhow::bail!("env file does not exist: {}", path.display());
    }

    validate_private_permissions(path)?;

    let mut vars = BTreeMap::new();
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read env file {}", path.display()))?;

    for item in iter {
        let (key, value) = item
            .with_context(|| format!("failed to parse entry in env file {}", path.display()))?;
        vars.insert(key, value);
    }

    Ok(vars)
}

/// Restrict a file to its owner (0600) where supported.
///
/// # Errors
///
/// Returns an error if permissions cannot be updated.
pub fn enforce_private_file_permissions(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to inspect env file {}", path.display()))?;
    let mode = metadata.permissions().mode() & 0o777;

    anyhow::ensure!(
        mode & 0o077 == 0,
        "env file {} must be 0600, found {:o}",
        path.display(),
        mode
    );
    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}
