//! Assistant core - greets new members and answers private messages.

pub mod direct;
pub mod greeting;
pub mod intent;
pub mod membership;
pub mod telegram;


pub use direct::{ChatType, DirectMessageHandler, IntentSettings};
pub use intent::DialogflowClient;
pub use membership::{MembershipEvent, MembershipHandler};
pub use telegram::{MessageSender, TelegramClient};
