//! Telegram transport: outbound alerts and the inbound command listener.
//!
//! Outbound messages always use HTML parse mode. The inbound side runs a
//! teloxide dispatcher that forwards every text message, unfiltered, to the
//! command processor; authorization happens there.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::update_listeners::Polling;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{InboundCommand, Notifier};

pub mod ui;

/// Long-poll timeout for `getUpdates`.
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends HTML messages to the configured operator chat.
#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("chat_id", &self.chat_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl TelegramNotifier {
    /// Create a notifier for `chat_id` using the given bot token.
    pub fn new(bot_token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(bot_token),
            chat_id: ChatId(chat_id),
        }
    }

    /// A handle to the underlying bot, for the inbound listener.
    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    /// Check the token against the Bot API. Returns the bot's username.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is rejected or the API is unreachable.
    pub async fn verify(&self) -> anyhow::Result<String> {
        let me = self
            .bot
            .get_me()
            .await
            .context("failed to verify telegram bot token")?;
        Ok(me.username().to_owned())
    }

    async fn send_html(&self, chat_id: ChatId, text: &str) -> anyhow::Result<()> {
        self.bot
            .send_message(chat_id, text)
            .parse_mode(ParseMode::Html)
            .await
            .with_context(|| format!("failed to send telegram message to {chat_id}"))?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        self.send_html(self.chat_id, text).await
    }

    async fn reply(&self, conversation: &str, text: &str) -> anyhow::Result<()> {
        let chat_id: i64 = conversation
            .parse()
            .with_context(|| format!("invalid telegram chat id: {conversation}"))?;
        self.send_html(ChatId(chat_id), text).await
    }
}

/// Run the inbound listener, forwarding text messages into `commands`.
///
/// Updates queued while the watcher was down are dropped. Runs until the task
/// is aborted or the Bot API listener stops.
pub async fn run_command_listener(bot: Bot, commands: mpsc::Sender<InboundCommand>) {
    let handler = dptree::entry().branch(Update::filter_message().endpoint(forward_message));

    let listener = Polling::builder(bot.clone())
        .timeout(POLL_TIMEOUT)
        .drop_pending_updates()
        .build();

    info!("telegram command listener starting");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![commands])
        .build()
        .dispatch_with_listener(
            listener,
            LoggingErrorHandler::with_custom_text("telegram update listener error"),
        )
        .await;

    info!("telegram command listener stopped");
}

/// Convert a Telegram message into an [`InboundCommand`].
async fn forward_message(
    msg: Message,
    commands: mpsc::Sender<InboundCommand>,
) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        debug!(user_id = user.id.0, "ignoring non-text message");
        return Ok(());
    };

    let inbound = InboundCommand {
        sender: user.id.0.to_string(),
        conversation: msg.chat.id.0.to_string(),
        text: text.to_owned(),
        received_at: msg.date,
    };

    if commands.send(inbound).await.is_err() {
        warn!("command processor is gone, dropping message");
    }
    Ok(())
}
