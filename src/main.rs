mod alerts;
mod assistant;
mod config;
mod credentials;
mod liveness;

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ChatMemberUpdated;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

use assistant::{
    ChatType, DialogflowClient, DirectMessageHandler, IntentSettings, MembershipEvent, MembershipHandler,
    MessageSender, TelegramClient,
};
use config::Config;
use credentials::{Credentials, ServiceAccountAuth};

struct BotState {
    members: MembershipHandler,
    direct: DirectMessageHandler,
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.bot_token);
    let telegram: Arc<dyn MessageSender> = Arc::new(TelegramClient::new(bot.clone()));

    let guard = match init_logging(&config, telegram.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("❌ Failed to open log file in {}: {e}", config.log_dir.display());
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config, bot, telegram).await {
        error!("❌ Startup failed: {e}");
        drop(guard);
        std::process::exit(1);
    }
}

fn init_logging(config: &Config, telegram: Arc<dyn MessageSender>) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_dir.join("vaultbot.log"))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);

    let alert_layer = config
        .log_chat_id
        .map(|chat_id| {
            alerts::AlertLayer::new(telegram, chat_id, alerts::REPEAT_WINDOW).with_filter(alerts::alert_filter())
        });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(alert_layer)
        .init();

    Ok(guard)
}

async fn run(config: Config, bot: Bot, telegram: Arc<dyn MessageSender>) -> Result<(), Box<dyn std::error::Error>> {
    info!("🚀 Starting Maker's Vault Bot...");
    info!(
        "Dialogflow project {} (session {}, language {})",
        config.project_id, config.session_id, config.language_code
    );

    // Credentials must verify before any update is accepted.
    let credentials = Credentials::bootstrap(&config.credentials_base64)?;
    info!(
        "Loaded service account {} into {}",
        credentials.key().client_email,
        credentials.path().display()
    );
    if let Some(key_project) = credentials.key().project_id.as_deref()
        && key_project != config.project_id
    {
        warn!(
            "Service account belongs to project {key_project}, queries go to {}",
            config.project_id
        );
    }
    let tokens = Arc::new(ServiceAccountAuth::new(credentials, config.intent_timeout)?);
    let intent = Arc::new(DialogflowClient::new(
        config.dialogflow_endpoint.clone(),
        tokens,
        config.intent_timeout,
    )?);

    info!("Loaded {} greeting templates", config.templates.templates().len());
    let members = MembershipHandler::new(config.templates.clone(), telegram.clone()).with_dedup(config.dedup_ttl);
    if !config.dedup_ttl.is_zero() {
        info!("Join de-duplication enabled ({}s)", config.dedup_ttl.as_secs());
    }
    let direct = DirectMessageHandler::new(
        IntentSettings {
            project_id: config.project_id.clone(),
            session_id: config.session_id.clone(),
            language_code: config.language_code.clone(),
            fallback_reply: config.fallback_reply.clone(),
        },
        intent,
        telegram,
    );

    liveness::spawn(config.liveness_addr, config.liveness_message.clone()).await?;

    let state = Arc::new(BotState { members, direct });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_chat_member().endpoint(handle_chat_member));

    info!("📡 Bot is polling...");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    if let Some(event) = MembershipEvent::from_message(&msg) {
        state.members.on_membership_event(&event).await;
        return Ok(());
    }

    let Some(text) = msg.text() else {
        return Ok(());
    };

    state
        .direct
        .on_direct_message(msg.chat.id.0, ChatType::from(&msg.chat), text)
        .await;
    Ok(())
}

async fn handle_chat_member(update: ChatMemberUpdated, state: Arc<BotState>) -> ResponseResult<()> {
    let event = MembershipEvent::from_chat_member(&update);
    state.members.on_membership_event(&event).await;
    Ok(())
}
