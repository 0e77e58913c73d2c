use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::consumer::ConsumerBuilder;
use crate::retry::DEFAULT_RECONNECT_DELAY;

pub const URL_VAR: &str = "FIREHOSE_URL";
pub const IDLE_TIMEOUT_VAR: &str = "FIREHOSE_IDLE_TIMEOUT_SECS";
pub const RECONNECT_DELAY_VAR: &str = "FIREHOSE_RECONNECT_DELAY_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{var} must be a {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub url: String,
    pub idle_timeout: Option<Duration>,
    pub reconnect_delay: Duration,
}

impl ConsumerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            idle_timeout: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| Self::normalize_opt(lookup(name));

        let url = read(URL_VAR).ok_or(ConfigError::Missing(URL_VAR))?;
        let idle_timeout = read(IDLE_TIMEOUT_VAR)
            .map(|value| parse_u64(IDLE_TIMEOUT_VAR, value))
            .transpose()?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let reconnect_delay = read(RECONNECT_DELAY_VAR)
            .map(|value| parse_u64(RECONNECT_DELAY_VAR, value))
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RECONNECT_DELAY);

        Ok(Self {
            url,
            idle_timeout,
            reconnect_delay,
        })
    }

    pub fn into_builder(self) -> ConsumerBuilder {
        let builder = ConsumerBuilder::new(self.url).reconnect_delay(self.reconnect_delay);
        match self.idle_timeout {
            Some(timeout) => builder.idle_timeout(timeout),
            None => builder,
        }
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }
}

fn parse_u64(var: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        var,
        expected: "non-negative integer",
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ConsumerConfig, ConfigError> {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        ConsumerConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn url_is_required() {
        assert!(matches!(config(&[]), Err(ConfigError::Missing(URL_VAR))));
        assert!(matches!(
            config(&[(URL_VAR, "   ")]),
            Err(ConfigError::Missing(URL_VAR))
        ));
    }

    #[test]
    fn defaults_apply_when_unset_or_blank() {
        let cfg = config(&[(URL_VAR, " wss://doppler.example.com:443 "), (IDLE_TIMEOUT_VAR, "")])
            .unwrap();
        assert_eq!(cfg.url, "wss://doppler.example.com:443");
        assert_eq!(cfg.idle_timeout, None);
        assert_eq!(cfg.reconnect_delay, DEFAULT_RECONNECT_DELAY);
    }

    #[test]
    fn reads_durations() {
        let cfg = config(&[
            (URL_VAR, "ws://127.0.0.1:9911"),
            (IDLE_TIMEOUT_VAR, "30"),
            (RECONNECT_DELAY_VAR, "25"),
        ])
        .unwrap();
        assert_eq!(cfg.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.reconnect_delay, Duration::from_millis(25));

        let cfg = config(&[(URL_VAR, "ws://127.0.0.1:9911"), (IDLE_TIMEOUT_VAR, "0")]).unwrap();
        assert_eq!(cfg.idle_timeout, None);
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = config(&[(URL_VAR, "ws://127.0.0.1:9911"), (RECONNECT_DELAY_VAR, "soon")])
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: RECONNECT_DELAY_VAR,
                ..
            }
        ));
    }
}
