use std::time::Duration;

use chatgpt::config::ChatGPTEngine;
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EDIT_INTERVAL_MS: u64 = 700;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
    #[error("environment variable {name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// How the model client is built.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub engine: ChatGPTEngine,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            engine: engine_for(DEFAULT_MODEL),
            temperature: DEFAULT_TEMPERATURE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_token: String,
    /// When absent the key is asked for in the chat and kept in memory only.
    pub api_key: Option<String>,
    pub model: ModelSettings,
    pub stream_edit_interval: Duration,
    /// Restricts the bot to one chat instead of the first one that writes.
    pub chat_id: Option<i64>,
}

impl Config {
    /// Reads the process environment. Call `dotenv` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let telegram_token = var("TELOXIDE_TOKEN").ok_or(ConfigError::Missing("TELOXIDE_TOKEN"))?;
        let api_key = var("OPENAI_API_KEY");

        let engine = engine_for(&var("MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()));
        let temperature = match var("MODEL_TEMPERATURE") {
            Some(value) => parse_temperature(&value)?,
            None => DEFAULT_TEMPERATURE,
        };
        let timeout = Duration::from_secs(parse_number(
            "MODEL_TIMEOUT_SECS",
            var("MODEL_TIMEOUT_SECS"),
            DEFAULT_TIMEOUT_SECS,
        )?);
        let stream_edit_interval = Duration::from_millis(parse_number(
            "STREAM_EDIT_INTERVAL_MS",
            var("STREAM_EDIT_INTERVAL_MS"),
            DEFAULT_EDIT_INTERVAL_MS,
        )?);
        let chat_id = var("TUTOR_CHAT_ID")
            .map(|value| {
                value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| ConfigError::Invalid {
                        name: "TUTOR_CHAT_ID",
                        value,
                        reason: "expected a Telegram chat id",
                    })
            })
            .transpose()?;

        Ok(Self {
            telegram_token,
            api_key,
            model: ModelSettings {
                engine,
                temperature,
                timeout,
            },
            stream_edit_interval,
            chat_id,
        })
    }
}

fn parse_temperature(value: &str) -> Result<f32, ConfigError> {
    match value.trim().parse::<f32>() {
        Ok(t) if (0.0..=2.0).contains(&t) => Ok(t),
        _ => Err(ConfigError::Invalid {
            name: "MODEL_TEMPERATURE",
            value: value.to_string(),
            reason: "expected a number between 0 and 2",
        }),
    }
}

fn parse_number(
    name: &'static str,
    value: Option<String>,
    default: u64,
) -> Result<u64, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            reason: "expected a positive integer",
        }),
    }
}

fn engine_for(model: &str) -> ChatGPTEngine {
    match model.trim() {
        "gpt-3.5-turbo" => ChatGPTEngine::Gpt35Turbo,
        "gpt-4" => ChatGPTEngine::Gpt4,
        "gpt-4-32k" => ChatGPTEngine::Gpt4_32k,
        // Read once at startup, so leaking the name is bounded
        other => ChatGPTEngine::Custom(Box::leak(other.to_string().into_boxed_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_token_is_set() {
        let config = config_from(&[("TELOXIDE_TOKEN", "123:abc")]).unwrap();
        assert_eq!(config.telegram_token, "123:abc");
        assert_eq!(config.api_key, None);
        assert_eq!(config.model.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(config.model.timeout, Duration::from_secs(30));
        assert_eq!(config.stream_edit_interval, Duration::from_millis(700));
        assert_eq!(config.chat_id, None);
    }

    #[test]
    fn missing_token_is_reported() {
        assert_eq!(
            config_from(&[("OPENAI_API_KEY", "sk-test")]).unwrap_err(),
            ConfigError::Missing("TELOXIDE_TOKEN")
        );
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config_from(&[("TELOXIDE_TOKEN", "t"), ("OPENAI_API_KEY", "  ")]).unwrap();
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn explicit_values_are_parsed() {
        let config = config_from(&[
            ("TELOXIDE_TOKEN", "t"),
            ("OPENAI_API_KEY", "sk-test"),
            ("MODEL_TEMPERATURE", "0.2"),
            ("MODEL_TIMEOUT_SECS", "15"),
            ("STREAM_EDIT_INTERVAL_MS", "250"),
            ("TUTOR_CHAT_ID", "-10042"),
        ])
        .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.model.temperature, 0.2);
        assert_eq!(config.model.timeout, Duration::from_secs(15));
        assert_eq!(config.stream_edit_interval, Duration::from_millis(250));
        assert_eq!(config.chat_id, Some(-10042));
    }

    #[test]
    fn out_of_range_temperature_is_rejected() {
        assert!(matches!(
            config_from(&[("TELOXIDE_TOKEN", "t"), ("MODEL_TEMPERATURE", "3")]),
            Err(ConfigError::Invalid {
                name: "MODEL_TEMPERATURE",
                ..
            })
        ));
    }

    #[test]
    fn malformed_chat_id_is_rejected() {
        assert!(matches!(
            config_from(&[("TELOXIDE_TOKEN", "t"), ("TUTOR_CHAT_ID", "moi")]),
            Err(ConfigError::Invalid {
                name: "TUTOR_CHAT_ID",
                ..
            })
        ));
    }
}
