//! Outbound Telegram messaging.

use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::warn;

pub const LOG_TARGET: &str = module_path!();

/// Capability to post a text message into a chat.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Sends `text` verbatim and returns the new message id.
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i64, String>;
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl MessageSender for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i64, String> {
        // No parse mode: greetings and intent replies carry user-provided text.
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .map(|msg| msg.id.0 as i64)
            .map_err(|e| {
                let msg = format!("Failed to send to chat {chat_id}: {e}");
                warn!("{}", msg);
                msg
            })
    }
}
