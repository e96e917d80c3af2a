//! Private-chat replies via the intent service.

use std::sync::Arc;

use teloxide::types::Chat;
use tracing::{debug, info, warn};

use crate::assistant::intent::{IntentQuery, IntentService, query_intent};
use crate::assistant::telegram::MessageSender;

pub const DEFAULT_FALLBACK: &str = "Sorry, I didn't understand that.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatType {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl From<&Chat> for ChatType {
    fn from(chat: &Chat) -> Self {
        if chat.is_private() {
            Self::Private
        } else if chat.is_channel() {
            Self::Channel
        } else if chat.is_supergroup() {
            Self::Supergroup
        } else {
            Self::Group
        }
    }
}

/// Intent-service settings shared by every private chat.
#[derive(Debug, Clone)]
pub struct IntentSettings {
    pub project_id: String,
    pub session_id: String,
    pub language_code: String,
    pub fallback_reply: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectOutcome {
    /// Not a private chat, a command, or empty text.
    Ignored,
    Answered(String),
    Fallback,
    SendFailed,
}

pub struct DirectMessageHandler {
    settings: IntentSettings,
    intent: Arc<dyn IntentService>,
    sender: Arc<dyn MessageSender>,
}

impl DirectMessageHandler {
    pub fn new(settings: IntentSettings, intent: Arc<dyn IntentService>, sender: Arc<dyn MessageSender>) -> Self {
        Self { settings, intent, sender }
    }

    pub async fn on_direct_message(&self, chat_id: i64, chat_type: ChatType, text: &str) -> DirectOutcome {
        if chat_type != ChatType::Private {
            return DirectOutcome::Ignored;
        }
        if text.trim().is_empty() || text.starts_with('/') {
            debug!("Not forwarding message in chat {chat_id} to intent service");
            return DirectOutcome::Ignored;
        }

        let query = IntentQuery {
            project_id: self.settings.project_id.clone(),
            session_id: self.settings.session_id.clone(),
            text: text.to_string(),
            language_code: self.settings.language_code.clone(),
        };

        let (reply, outcome) = match query_intent(self.intent.as_ref(), &query).await {
            Some(reply) if !reply.is_empty() => (reply.clone(), DirectOutcome::Answered(reply)),
            _ => (self.settings.fallback_reply.clone(), DirectOutcome::Fallback),
        };

        match self.sender.send_text(chat_id, &reply).await {
            Ok(_) => {
                info!("💬 Replied in chat {chat_id} with: {reply}");
                outcome
            }
            Err(e) => {
                warn!("Failed to reply in chat {chat_id}: {e}");
                DirectOutcome::SendFailed
            }
        }
    }
}
