use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::SpaceError;
use crate::reference::Credential;
use crate::retry::RetryPolicy;

const DEFAULT_HUB_URL: &str = "https://huggingface.co";

/// Client settings, read from `SPACE_CLIENT__*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_runtime_timeout_secs")]
    pub runtime_timeout_secs: u64,
    #[serde(default = "default_poll_initial_ms")]
    pub poll_initial_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
    #[serde(default = "default_wake_sleep_time_secs")]
    pub wake_sleep_time_secs: u64,
    #[serde(default)]
    pub token: Option<String>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("SPACE_CLIENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map(ClientConfig::normalize)
            .unwrap_or_else(|err| {
                tracing::warn!(
                    target = "space_client::config",
                    error = %err,
                    "invalid SPACE_CLIENT environment; using defaults"
                );
                ClientConfig::default()
            })
    }

    fn normalize(mut self) -> Self {
        self.hub_url = self.hub_url.trim().to_string();
        if self.hub_url.is_empty() {
            self.hub_url = default_hub_url();
        }
        self.token = self.token.take().and_then(|token| {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        });
        self.retry_max_attempts = self.retry_max_attempts.max(1);
        self
    }

    pub fn hub_base(&self) -> Result<Url, SpaceError> {
        Url::parse(&self.hub_url).map_err(|err| {
            SpaceError::InvalidConfig(format!("invalid hub url '{}': {err}", self.hub_url))
        })
    }

    pub fn credential(&self) -> Option<Credential> {
        Credential::from_optional(self.token.as_deref())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_timeout_secs)
    }

    pub fn poll_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.poll_initial_ms),
            Duration::from_millis(self.poll_max_ms),
        )
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            runtime_timeout_secs: default_runtime_timeout_secs(),
            poll_initial_ms: default_poll_initial_ms(),
            poll_max_ms: default_poll_max_ms(),
            wake_sleep_time_secs: default_wake_sleep_time_secs(),
            token: None,
        }
    }
}

fn default_hub_url() -> String {
    DEFAULT_HUB_URL.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_retry_max_delay_ms() -> u64 {
    4_000
}

fn default_runtime_timeout_secs() -> u64 {
    300
}

fn default_poll_initial_ms() -> u64 {
    1_000
}

fn default_poll_max_ms() -> u64 {
    15_000
}

fn default_wake_sleep_time_secs() -> u64 {
    3_600
}
