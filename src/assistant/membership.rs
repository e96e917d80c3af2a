//! Greets people who join a group.
//!
//! Telegram reports joins in two shapes: a service message listing the new
//! members, and a `chat_member` update carrying the old and new status. Both
//! are normalized into [`MembershipEvent`] so the bot filtering and greeting
//! happen in one place.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use teloxide::types::{ChatMemberStatus, ChatMemberUpdated, Message};
use tracing::{debug, info, warn};

use crate::assistant::greeting::TemplateSelector;
use crate::assistant::telegram::MessageSender;

/// A chat participant, built per event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub full_name: String,
    pub is_bot: bool,
}

impl User {
    /// `@username` when the user has one, else the full name.
    pub fn display_name(&self) -> String {
        match self.username.as_deref() {
            Some(username) if !username.is_empty() => format!("@{username}"),
            _ => self.full_name.clone(),
        }
    }
}

impl From<&teloxide::types::User> for User {
    fn from(user: &teloxide::types::User) -> Self {
        Self {
            id: user.id.0 as i64,
            username: user.username.clone(),
            full_name: user.full_name(),
            is_bot: user.is_bot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Owner,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
}

impl From<ChatMemberStatus> for MemberStatus {
    fn from(status: ChatMemberStatus) -> Self {
        match status {
            ChatMemberStatus::Owner => Self::Owner,
            ChatMemberStatus::Administrator => Self::Administrator,
            ChatMemberStatus::Member => Self::Member,
            ChatMemberStatus::Restricted => Self::Restricted,
            ChatMemberStatus::Left => Self::Left,
            ChatMemberStatus::Banned => Self::Kicked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Service message: these users were just added.
    NewMembersList { chat_id: i64, users: Vec<User> },
    /// A single user's status changed.
    StatusTransition {
        chat_id: i64,
        old_status: MemberStatus,
        new_status: MemberStatus,
        user: User,
    },
}

impl MembershipEvent {
    /// Returns `None` unless the message is a new-members service message.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let members = msg.new_chat_members()?;
        Some(Self::NewMembersList {
            chat_id: msg.chat.id.0,
            users: members.iter().map(User::from).collect(),
        })
    }

    pub fn from_chat_member(update: &ChatMemberUpdated) -> Self {
        Self::StatusTransition {
            chat_id: update.chat.id.0,
            old_status: update.old_chat_member.status().into(),
            new_status: update.new_chat_member.status().into(),
            user: User::from(&update.new_chat_member.user),
        }
    }

    pub fn chat_id(&self) -> i64 {
        match self {
            Self::NewMembersList { chat_id, .. } | Self::StatusTransition { chat_id, .. } => *chat_id,
        }
    }

    /// Users this event reports as having just joined, bots included.
    pub fn joined_users(&self) -> &[User] {
        match self {
            Self::NewMembersList { users, .. } => users,
            Self::StatusTransition { old_status, new_status, user, .. } => {
                let rejoined = matches!(old_status, MemberStatus::Left | MemberStatus::Kicked)
                    && *new_status == MemberStatus::Member;
                if rejoined { std::slice::from_ref(user) } else { &[] }
            }
        }
    }
}

/// What happened to one joined user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Greeted { user_id: i64, text: String },
    SkippedBot { user_id: i64 },
    Duplicate { user_id: i64 },
    SendFailed { user_id: i64 },
}

/// Remembers recent (chat, user) joins so a join reported in both shapes
/// is greeted once.
pub struct JoinCache {
    ttl: Duration,
    seen: Mutex<HashMap<(i64, i64), Instant>>,
}

impl JoinCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// True the first time a (chat, user) pair is seen within the TTL.
    pub fn first_sighting(&self, chat_id: i64, user_id: i64) -> bool {
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);
        match seen.get(&(chat_id, user_id)) {
            Some(_) => false,
            None => {
                seen.insert((chat_id, user_id), now);
                true
            }
        }
    }

    /// Drops a sighting whose greeting never went out.
    pub fn forget(&self, chat_id: i64, user_id: i64) {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.remove(&(chat_id, user_id));
    }
}

pub struct MembershipHandler {
    selector: TemplateSelector,
    sender: Arc<dyn MessageSender>,
    dedup: Option<JoinCache>,
}

impl MembershipHandler {
    pub fn new(selector: TemplateSelector, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            selector,
            sender,
            dedup: None,
        }
    }

    /// Enables join de-duplication. A zero TTL leaves it off.
    pub fn with_dedup(mut self, ttl: Duration) -> Self {
        self.dedup = (!ttl.is_zero()).then(|| JoinCache::new(ttl));
        self
    }

    /// Sends one greeting per joined human user.
    pub async fn on_membership_event(&self, event: &MembershipEvent) -> Vec<JoinOutcome> {
        let chat_id = event.chat_id();
        let joined = event.joined_users();
        if joined.is_empty() {
            debug!("Ignoring membership event in chat {chat_id}: no join");
            return Vec::new();
        }

        let mut outcomes = Vec::with_capacity(joined.len());
        for user in joined {
            outcomes.push(self.greet(chat_id, user).await);
        }
        outcomes
    }

    async fn greet(&self, chat_id: i64, user: &User) -> JoinOutcome {
        if user.is_bot {
            debug!("Skipping bot account {} in chat {}", user.id, chat_id);
            return JoinOutcome::SkippedBot { user_id: user.id };
        }

        if let Some(ref cache) = self.dedup
            && !cache.first_sighting(chat_id, user.id)
        {
            info!("Already greeted {} in chat {}", user.id, chat_id);
            return JoinOutcome::Duplicate { user_id: user.id };
        }

        let name = user.display_name();
        let text = self.selector.select_greeting(&name);
        match self.sender.send_text(chat_id, &text).await {
            Ok(_) => {
                info!("✅ Sent welcome message to {name}");
                JoinOutcome::Greeted { user_id: user.id, text }
            }
            Err(e) => {
                warn!("Failed to welcome {name} in chat {chat_id}: {e}");
                // Let the other delivery of this join retry.
                if let Some(ref cache) = self.dedup {
                    cache.forget(chat_id, user.id);
                }
                JoinOutcome::SendFailed { user_id: user.id }
            }
        }
    }
}
