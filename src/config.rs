use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::assistant::direct::DEFAULT_FALLBACK;
use crate::assistant::greeting::TemplateSelector;
use crate::assistant::intent::DEFAULT_ENDPOINT;

const DEFAULT_SESSION_ID: &str = "maker-vault-session";
const DEFAULT_LANGUAGE_CODE: &str = "en";
const DEFAULT_LIVENESS_MESSAGE: &str = "🤖 Maker's Vault Bot is active!";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_INTENT_TIMEOUT_SECS: u64 = 10;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    Missing(&'static str),
    /// An environment variable has an unparseable value.
    Invalid { name: &'static str, value: String },
    /// Failed to read the templates file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse the templates file.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(name) => write!(f, "{name} not found, set it in your environment variables"),
            Self::Invalid { name, value } => write!(f, "{name} has an invalid value '{value}'"),
            Self::ReadFile { path, source } => {
                write!(f, "failed to read templates file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse templates file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Missing(_) | Self::Invalid { .. } | Self::Validation(_) => None,
        }
    }
}

/// Process-wide settings, built once at startup and never mutated.
pub struct Config {
    pub bot_token: String,
    pub project_id: String,
    /// Base64 service-account key; decoded by `credentials`.
    pub credentials_base64: String,
    pub session_id: String,
    pub language_code: String,
    pub dialogflow_endpoint: String,
    pub intent_timeout: Duration,
    pub liveness_addr: SocketAddr,
    pub liveness_message: String,
    pub fallback_reply: String,
    pub templates: TemplateSelector,
    /// Zero disables join de-duplication.
    pub dedup_ttl: Duration,
    pub log_dir: PathBuf,
    pub log_chat_id: Option<i64>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let bot_token = require("BOT_TOKEN")?;
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "BOT_TOKEN appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }

        let project_id = require("DIALOGFLOW_PROJECT_ID")?;
        let credentials_base64 = require("GOOGLE_CREDENTIALS_BASE64")?;

        let intent_timeout_secs = parse_or("INTENT_TIMEOUT_SECS", get("INTENT_TIMEOUT_SECS"), DEFAULT_INTENT_TIMEOUT_SECS)?;
        if intent_timeout_secs == 0 {
            return Err(ConfigError::Validation("INTENT_TIMEOUT_SECS must be greater than zero".into()));
        }
        let port = parse_or("PORT", get("PORT"), DEFAULT_PORT)?;
        let dedup_secs = parse_or("WELCOME_DEDUP_SECS", get("WELCOME_DEDUP_SECS"), 0u64)?;
        let log_chat_id = get("LOG_CHAT_ID")
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|_| ConfigError::Invalid { name: "LOG_CHAT_ID", value: v })
            })
            .transpose()?;

        let templates = match get("WELCOME_TEMPLATES_FILE") {
            Some(path) => load_templates(Path::new(&path))?,
            None => TemplateSelector::builtin(),
        };

        Ok(Self {
            bot_token,
            project_id,
            credentials_base64,
            session_id: get("DIALOGFLOW_SESSION_ID").unwrap_or_else(|| DEFAULT_SESSION_ID.to_string()),
            language_code: get("DIALOGFLOW_LANGUAGE_CODE").unwrap_or_else(|| DEFAULT_LANGUAGE_CODE.to_string()),
            dialogflow_endpoint: get("DIALOGFLOW_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            intent_timeout: Duration::from_secs(intent_timeout_secs),
            liveness_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            liveness_message: get("LIVENESS_MESSAGE").unwrap_or_else(|| DEFAULT_LIVENESS_MESSAGE.to_string()),
            fallback_reply: get("FALLBACK_REPLY").unwrap_or_else(|| DEFAULT_FALLBACK.to_string()),
            templates,
            dedup_ttl: Duration::from_secs(dedup_secs),
            log_dir: get("LOG_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("logs")),
            log_chat_id,
        })
    }
}

fn parse_or<T: std::str::FromStr>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid { name, value: v }),
        None => Ok(default),
    }
}

/// Reads a JSON array of greeting templates.
pub fn load_templates(path: &Path) -> Result<TemplateSelector, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadFile { path: path.to_path_buf(), source: e })?;
    let templates: Vec<String> = serde_json::from_str(&content)
        .map_err(|e| ConfigError::ParseJson { path: path.to_path_buf(), source: e })?;
    TemplateSelector::new(templates)
}
