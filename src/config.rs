// Bot configuration, read from the environment (and `.env` via dotenv).
//
// Parsing goes through a lookup function so tests never touch the real
// process environment.

use crate::core::moderation::ModerationConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing {0} environment variable")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone)]
pub struct MatrixSettings {
    pub homeserver_url: String,
    pub username: String,
    pub password: String,
    pub room_id: String,
    pub room_language: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub api_url: String,
    pub text_model: String,
    pub vision_model: String,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub matrix: MatrixSettings,
    pub openai: OpenAiSettings,
    pub moderation: ModerationConfig,
    pub log_level: Level,
    /// LOG_LEVEL value that could not be understood, reported once logging is up.
    pub unknown_log_level: Option<String>,
    /// Log bans instead of executing them.
    pub debug_mode: bool,
    pub store_backend: StoreBackend,
    pub data_dir: PathBuf,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let debug_mode = env.flag("DEBUG_MODE", false)?;
        let probation_hours: u64 = env.number("CHECKS_NEW_MEMBER_DURATION_HOURS", 60)?;
        let raw_level = env.get("LOG_LEVEL");
        let log_level = parse_log_level(raw_level.as_deref());
        let unknown_log_level = raw_level.filter(|v| Level::from_str(v).is_err());

        Ok(Self {
            matrix: MatrixSettings {
                homeserver_url: env.required("MATRIX_HOMESERVER_URL")?,
                username: env.required("MATRIX_USERNAME")?,
                password: env.required("MATRIX_PASSWORD")?,
                room_id: env.required("MATRIX_ROOM_ID")?,
                room_language: env.or("MATRIX_ROOM_LANGUAGE", "English"),
            },
            openai: OpenAiSettings {
                api_key: env.required("OPENAI_API_KEY")?,
                api_url: env.or("OPENAI_API_URL", "https://api.openai.com/v1"),
                text_model: env.or("OPENAI_TEXT_MODEL", "gpt-4o-mini"),
                vision_model: env.or("OPENAI_VISION_MODEL", "gpt-4o-mini"),
            },
            moderation: ModerationConfig {
                probation: Duration::from_secs(probation_hours * 60 * 60),
                required_valid_messages: env.number("CHECKS_REQUIRED_VALID_MESSAGES", 5)?,
                min_message_length: env.number("CHECKS_MIN_MESSAGE_LENGTH", 10)?,
                check_all_members: env.flag("CHECK_ALL_MEMBERS", debug_mode)?,
            },
            log_level,
            unknown_log_level,
            debug_mode,
            store_backend: match env.get("STORE_BACKEND").as_deref() {
                None | Some("sqlite") => StoreBackend::Sqlite,
                Some("memory") => StoreBackend::Memory,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        key: "STORE_BACKEND",
                        value: other.to_string(),
                    })
                }
            },
            data_dir: PathBuf::from(env.or("DATA_DIR", "data")),
        })
    }
}

/// Unknown levels fall back to `info`.
fn parse_log_level(value: Option<&str>) -> Level {
    value
        .and_then(|v| Level::from_str(v.trim()).ok())
        .unwrap_or(Level::INFO)
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Non-blank value of `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn number<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value }),
        }
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid { key, value }),
            },
        }
    }
}
