//! Configuration for the conversation sync engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::errors::{ChatError, ChatResult};

/// Top-level configuration for the engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Responder (agent backend) settings.
    pub responder: ResponderConfig,
    /// Durable store settings.
    pub persistence: PersistenceConfig,
    /// Send-pipeline guards and dedup tuning.
    pub send: SendConfig,
    /// Synthetic greeting settings.
    pub greeting: GreetingConfig,
}

impl SyncConfig {
    /// Create a new config with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the responder base URL.
    #[must_use]
    pub fn with_responder_url(mut self, base_url: impl Into<String>) -> Self {
        self.responder.base_url = Some(base_url.into());
        self
    }

    /// Set the store base URL and API key.
    #[must_use]
    pub fn with_persistence(
        mut self,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        self.persistence.base_url = Some(base_url.into());
        self.persistence.api_key = Some(api_key.into());
        self
    }

    /// Set the responder request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.responder.request_timeout = timeout;
        self
    }

    /// Set the greeting text.
    #[must_use]
    pub fn with_greeting_text(mut self, text: impl Into<String>) -> Self {
        self.greeting.text = text.into();
        self
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> ChatResult<()> {
        if self.responder.request_timeout.is_zero() {
            return Err(ChatError::InvalidConfig(
                "responder.request_timeout must be > 0".to_string(),
            ));
        }

        if self.persistence.request_timeout.is_zero() {
            return Err(ChatError::InvalidConfig(
                "persistence.request_timeout must be > 0".to_string(),
            ));
        }

        if self.persistence.list_limit == 0 {
            return Err(ChatError::InvalidConfig(
                "persistence.list_limit must be > 0".to_string(),
            ));
        }

        if self.send.identity_bucket_secs == 0 {
            return Err(ChatError::InvalidConfig(
                "send.identity_bucket_secs must be > 0".to_string(),
            ));
        }

        if self.send.dedup_window.is_zero() {
            return Err(ChatError::InvalidConfig(
                "send.dedup_window must be > 0".to_string(),
            ));
        }

        if self.send.title_max_chars == 0 {
            return Err(ChatError::InvalidConfig(
                "send.title_max_chars must be > 0".to_string(),
            ));
        }

        if self.send.applied_cache_capacity == 0 {
            return Err(ChatError::InvalidConfig(
                "send.applied_cache_capacity must be > 0".to_string(),
            ));
        }

        if let Some(base_url) = &self.responder.base_url {
            Url::parse(base_url)?;
        }

        if let Some(base_url) = &self.persistence.base_url {
            Url::parse(base_url)?;
        }

        Ok(())
    }
}

/// Responder (agent backend) settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponderConfig {
    /// Base URL of the agent backend, e.g. `http://127.0.0.1:8000`.
    pub base_url: Option<String>,
    /// Total request timeout.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Connection timeout.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Durable store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Base URL of the REST store, e.g. `https://<project>.supabase.co`.
    pub base_url: Option<String>,
    /// API key sent as `apikey` and bearer token.
    pub api_key: Option<String>,
    /// Default page size for conversation listing.
    pub list_limit: usize,
    /// Per-request timeout for store calls.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            list_limit: 20,
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Send-pipeline guards and dedup tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendConfig {
    /// Window during which an identical resend is rejected.
    #[serde(with = "duration_serde")]
    pub resend_cooldown: Duration,
    /// Maximum characters of a message used as a conversation title.
    pub title_max_chars: usize,
    /// Identity-key time-bucket granularity in seconds.
    pub identity_bucket_secs: u64,
    /// Lookback window for the pre-insert existence check.
    #[serde(with = "duration_serde")]
    pub dedup_window: Duration,
    /// LRU capacity for the applied-realtime-rows cache.
    pub applied_cache_capacity: usize,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            resend_cooldown: Duration::from_secs(1),
            title_max_chars: 50,
            identity_bucket_secs: 60,
            dedup_window: Duration::from_secs(300),
            applied_cache_capacity: 256,
        }
    }
}

/// Synthetic greeting settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GreetingConfig {
    /// Whether an empty conversation is seeded with a greeting.
    pub enabled: bool,
    /// Greeting text (rendered as a supervisor notice, never persisted).
    pub text: String,
}

impl Default for GreetingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            text: "Hello! I'm your startup advisor. What are you working on?".to_string(),
        }
    }
}

/// Serde module for Duration serialization.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
