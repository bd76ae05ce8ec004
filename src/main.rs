//! Moltbot Watcher CLI entry point.
//!
//! `start` runs the daemon; `check` validates the configuration and reports
//! what the daemon would watch, then exits.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use moltbot_watcher::channel::Notifier;
use moltbot_watcher::classifier::Classifier;
use moltbot_watcher::commands::{CommandDeps, CommandProcessor};
use moltbot_watcher::config::{self, expand_home, load_config, Config, CONFIG_ENV};
use moltbot_watcher::credentials::resolve_bot_token;
use moltbot_watcher::db::StateDb;
use moltbot_watcher::dispatcher::AlertDispatcher;
use moltbot_watcher::logging;
use moltbot_watcher::mute::MuteController;
use moltbot_watcher::pipeline::{spawn_change_watcher, Pipeline, PipelineStats};
use moltbot_watcher::process::{ProcessController, ShellProcessController};
use moltbot_watcher::recent::RecentBuffer;
use moltbot_watcher::registry::SenderRegistry;
use moltbot_watcher::tailer::LogTailer;
use moltbot_watcher::telegram::{self, TelegramNotifier};

/// Inbound commands buffered between the listener and the processor.
const COMMAND_QUEUE: usize = 32;

/// Moltbot Watcher: alerts on suspicious Moltbot inputs over Telegram.
#[derive(Parser)]
#[command(name = "moltbot-watcher", version, about)]
struct Cli {
    /// Path to config.toml (default: ~/.config/moltbot-watcher/config.toml).
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the watcher daemon.
    Start,
    /// Validate the configuration, show what would be watched, and exit.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };

    match cli.command {
        Command::Start => handle_start(&config_path).await,
        Command::Check => handle_check(&config_path).await,
    }
}

/// Directory holding `config.toml`, `.env` and `logs/`.
fn config_home(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Run the watcher daemon until SIGINT or SIGTERM.
async fn handle_start(config_path: &Path) -> anyhow::Result<()> {
    let home = config_home(config_path);
    let _logging_guard = logging::init_daemon(&logging::logs_dir(&home))?;

    let result = run_daemon(config_path, &home).await;
    if let Err(e) = &result {
        error!(error = format!("{e:#}"), "moltbot watcher failed to start");
    }
    result
}

async fn run_daemon(config_path: &Path, home: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let env_file = home.join(".env");
    let token = resolve_bot_token(&config.telegram.bot_token_env, &env_file)?;

    let notifier = Arc::new(TelegramNotifier::new(token.expose(), config.telegram.chat_id));
    let bot_name = notifier.verify().await?;
    info!(bot = %bot_name, chat_id = config.telegram.chat_id, "telegram bot verified");

    let store = if config.state.persist_senders {
        let db_path = expand_home(&config.state.db_path);
        Some(Arc::new(StateDb::open(&db_path).await?))
    } else {
        None
    };
    let registry = Arc::new(match &store {
        Some(db) => SenderRegistry::persistent(Arc::clone(db)).await?,
        None => SenderRegistry::in_memory(),
    });

    let policy = config.watch.alert_level;
    let rules = config.patterns.rules()?;
    let rule_count = rules.len();
    let classifier = Arc::new(Classifier::new(
        rules,
        policy,
        config.patterns.blocked_senders.clone(),
        Arc::clone(&registry),
    ));

    let mute = Arc::new(MuteController::new());
    let recent = Arc::new(RecentBuffer::new(config.watch.recent_capacity));
    let stats = Arc::new(PipelineStats::new());
    let outbound: Arc<dyn Notifier> = notifier.clone();
    let dispatcher = Arc::new(AlertDispatcher::new(
        Arc::clone(&outbound),
        Arc::clone(&mute),
        policy,
    ));

    let tailer = LogTailer::new(&config.watch.expanded_paths())?
        .replay_from_start(config.watch.replay_from_start)
        .max_line_bytes(config.watch.max_line_bytes);

    let (_fs_watcher, wake) = if config.watch.use_notify {
        match spawn_change_watcher(&tailer.watch_roots()) {
            Ok((watcher, rx)) => (Some(watcher), Some(rx)),
            Err(e) => {
                warn!(error = %e, "file change notifications unavailable, polling only");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let pipeline = Pipeline::new(
        tailer,
        classifier,
        Arc::clone(&recent),
        dispatcher,
        Arc::clone(&stats),
    );

    let controller: Arc<dyn ProcessController> =
        Arc::new(ShellProcessController::from_config(&config.moltbot)?);
    let processor = CommandProcessor::new(CommandDeps {
        controller,
        notifier: Arc::clone(&outbound),
        mute,
        recent,
        registry,
        stats,
        policy,
        allowed_senders: config.telegram.allowed_senders(),
        default_mute_minutes: config.mute.default_minutes,
        max_mute_minutes: config.mute.max_minutes,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let listener = tokio::spawn(telegram::run_command_listener(notifier.bot(), command_tx));

    if let Err(e) = outbound.send(&startup_message(&config, rule_count)).await {
        warn!(error = %e, "failed to send startup notice");
    }

    let poll_interval = Duration::from_secs(config.watch.poll_interval_secs);
    let digest_interval =
        Duration::from_secs(config.watch.digest_interval_minutes.saturating_mul(60));
    let pipeline_task = tokio::spawn(pipeline.run(
        poll_interval,
        digest_interval,
        wake,
        shutdown_rx.clone(),
    ));
    let command_task = tokio::spawn(processor.run(command_rx, shutdown_rx));

    info!(
        config = %config_path.display(),
        patterns = config.watch.paths.len(),
        alert_level = %policy,
        rules = rule_count,
        "moltbot watcher started"
    );

    shutdown_signal().await;
    info!("shutdown requested");
    if shutdown_tx.send(true).is_err() {
        warn!("both loops already stopped");
    }

    if let Err(e) = pipeline_task.await {
        warn!(error = %e, "watch pipeline task failed");
    }
    if let Err(e) = command_task.await {
        warn!(error = %e, "command processor task failed");
    }
    listener.abort();

    if let Some(db) = store {
        db.close().await;
    }
    info!("moltbot watcher stopped");
    Ok(())
}

/// Validate configuration and report what the daemon would do.
async fn handle_check(config_path: &Path) -> anyhow::Result<()> {
    logging::init_cli();

    let config = load_config(config_path)?;
    let home = config_home(config_path);

    println!("config: {}", config_path.display());
    println!("alert level: {}", config.watch.alert_level);
    println!("chat id: {}", config.telegram.chat_id);
    println!(
        "allowed senders: {}",
        config.telegram.allowed_senders().join(", ")
    );

    match resolve_bot_token(&config.telegram.bot_token_env, &home.join(".env")) {
        Ok(_) => println!("bot token: ok"),
        Err(e) => println!("bot token: missing ({e:#})"),
    }

    let rules = config.patterns.rules()?;
    println!("rules ({}):", rules.len());
    for rule in &rules {
        println!("  {}", rule.id());
    }

    let tailer = LogTailer::new(&config.watch.expanded_paths())?;
    for target in tailer.targets() {
        let files = target.resolve();
        println!("watch {} ({} files)", target.pattern(), files.len());
        for file in files {
            println!("  {}", file.display());
        }
    }

    let controller = ShellProcessController::from_config(&config.moltbot)?;
    println!("moltbot: {}", controller.is_running().await.as_str());
    println!(
        "daemon log: {}",
        logging::log_file_for(&logging::logs_dir(&home), Utc::now().date_naive()).display()
    );

    Ok(())
}

fn startup_message(config: &Config, rule_count: usize) -> String {
    format!(
        "<b>Moltbot Watcher Started</b>\n\
         Watching {patterns} log pattern(s)\n\
         Alert level: {level}\n\
         Rules: {rule_count}\n\n\
         Send /help for commands.",
        patterns = config.watch.paths.len(),
        level = config.watch.alert_level,
    )
}

/// Resolve on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!(error = %e, "failed to listen for ctrl-c");
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
}
