//! Runtime configuration shared by every worker.
//!
//! Values live in the store so that operators can change retry behaviour
//! for the whole queue while workers are running. Workers read
//! `backoff_base` on every claim attempt; `max_retries` is only read when a
//! job is enqueued without an explicit limit.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::storage::StorageError;

pub const MAX_RETRIES: &str = "max_retries";
pub const BACKOFF_BASE: &str = "backoff_base";

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// Built-in defaults, as stored strings.
pub const DEFAULTS: [(&str, &str); 2] = [(MAX_RETRIES, "3"), (BACKOFF_BASE, "2")];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invalid value '{value}' for config '{key}': {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Canonical form of a config key: trimmed, lowercase, underscores.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace('-', "_")
}

/// Spelling used by older databases, if the key has one.
pub(crate) fn legacy_key(normalized: &str) -> Option<String> {
    normalized
        .contains('_')
        .then(|| normalized.replace('_', "-"))
}

pub fn default_value(key: &str) -> Option<&'static str> {
    let key = normalize_key(key);
    DEFAULTS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
}

/// Check a value before it is stored. Integer keys must be positive.
pub fn validate(key: &str, value: &str) -> Result<()> {
    match normalize_key(key).as_str() {
        MAX_RETRIES | BACKOFF_BASE => parse_positive(key, value).map(|_| ()),
        _ => Ok(()),
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u32> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let parsed: i64 = value
        .trim()
        .parse()
        .map_err(|_| invalid("expected an integer"))?;

    if parsed < 1 {
        return Err(invalid("must be at least 1"));
    }

    u32::try_from(parsed).map_err(|_| invalid("out of range"))
}

/// Source of configuration values for the queue and its workers
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Stored value for `key`, without defaults applied.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Effective configuration: defaults overlaid with stored values.
    async fn entries(&self) -> Result<BTreeMap<String, String>>;

    /// Stored value or built-in default.
    async fn get_or_default(&self, key: &str) -> Result<Option<String>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(value)),
            None => Ok(default_value(key).map(str::to_string)),
        }
    }

    async fn max_retries(&self) -> Result<u32> {
        self.positive_int(MAX_RETRIES, DEFAULT_MAX_RETRIES).await
    }

    async fn backoff_base(&self) -> Result<u32> {
        self.positive_int(BACKOFF_BASE, DEFAULT_BACKOFF_BASE).await
    }

    async fn positive_int(&self, key: &str, default: u32) -> Result<u32> {
        match self.get(key).await? {
            Some(value) => parse_positive(key, &value),
            None => Ok(default),
        }
    }
}

/// Fixed in-memory configuration
#[derive(Debug, Clone)]
pub struct StaticConfig {
    values: std::sync::Arc<std::sync::RwLock<BTreeMap<String, String>>>,
}

impl StaticConfig {
    pub fn new() -> Self {
        Self {
            values: Default::default(),
        }
    }

    pub fn with(self, key: &str, value: impl ToString) -> Self {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize_key(key), value.to_string());
        self
    }
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigProvider for StaticConfig {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(&normalize_key(key)).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        validate(key, value)?;
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize_key(key), value.to_string());
        Ok(())
    }

    async fn entries(&self) -> Result<BTreeMap<String, String>> {
        let mut merged: BTreeMap<String, String> = DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        merged.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(merged)
    }
}
