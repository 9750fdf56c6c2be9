//! Runtime configuration, loaded from `STREAMCHAT_*` environment variables.

use crate::error::ChatError;
use crate::reducer::CancelPolicy;
use anyhow::{Context, Result};
use keyring::Entry;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.deepseek.com/v1";
pub const DEFAULT_MODEL: &str = "deepseek-chat";
pub const DEFAULT_API_KEY_REF: &str = "env:DEEPSEEK_API_KEY";

const KEYRING_SERVICE: &str = "streamchat_api_key";

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address the HTTP server binds to.
    pub bind_address: String,
    /// sqlx SQLite URL, or `memory` for the in-process store.
    pub database_url: String,
    /// Base URL of the OpenAI-compatible API (without `/chat/completions`).
    pub api_base: String,
    /// Where to read the API key from: `env:VAR_NAME` or `keyring`.
    pub api_key_ref: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
    /// Total attempts per upstream call; 1 disables the retry decorator.
    pub retry_attempts: u32,
    pub system_prompt: Option<String>,
    pub cancel_policy: CancelPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:3000".to_string(),
            database_url: "sqlite://streamchat.sqlite?mode=rwc".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_key_ref: DEFAULT_API_KEY_REF.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: Some(0.7),
            max_tokens: Some(2000),
            timeout: Duration::from_secs(30),
            retry_attempts: 1,
            system_prompt: None,
            cancel_policy: CancelPolicy::Discard,
        }
    }
}

impl Config {
    /// Build a [`Config`] from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let cancel_policy = match std::env::var("STREAMCHAT_CANCEL_POLICY") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                log::warn!("Ignoring STREAMCHAT_CANCEL_POLICY: {}", e);
                defaults.cancel_policy
            }),
            Err(_) => defaults.cancel_policy,
        };

        Self {
            bind_address: env_or("STREAMCHAT_BIND", &defaults.bind_address),
            database_url: env_or("STREAMCHAT_DATABASE_URL", &defaults.database_url),
            api_base: env_or("STREAMCHAT_API_BASE", &defaults.api_base),
            api_key_ref: env_or("STREAMCHAT_API_KEY_REF", &defaults.api_key_ref),
            model: env_or("STREAMCHAT_MODEL", &defaults.model),
            temperature: parse_env("STREAMCHAT_TEMPERATURE").or(defaults.temperature),
            max_tokens: parse_env("STREAMCHAT_MAX_TOKENS").or(defaults.max_tokens),
            timeout: parse_env("STREAMCHAT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            retry_attempts: parse_env("STREAMCHAT_RETRY_ATTEMPTS")
                .unwrap_or(defaults.retry_attempts)
                .max(1),
            system_prompt: std::env::var("STREAMCHAT_SYSTEM_PROMPT")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            cancel_policy,
        }
    }

    /// Resolves the API key and bundles everything the transport client needs.
    /// A missing key is an [`ChatError::AuthConfig`] so callers can fail fast.
    pub fn provider_settings(&self) -> Result<ProviderSettings, ChatError> {
        let api_key =
            get_api_key(&self.api_key_ref).map_err(|e| ChatError::AuthConfig(format!("{:#}", e)))?;
        Ok(ProviderSettings {
            base_url: self.api_base.clone(),
            api_key,
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout: self.timeout,
        })
    }
}

/// Everything needed to talk to one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

// --- API Key Retrieval ---

/// Retrieves the API key named by `key_ref`: `env:VAR` reads an environment
/// variable, `keyring` reads the OS keyring entry written by
/// [`set_api_key_in_keyring`].
pub fn get_api_key(key_ref: &str) -> Result<String> {
    match key_ref {
        r if r.starts_with("env:") => {
            let env_var_name = r.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            let key = std::env::var(env_var_name).context(format!(
                "Failed to get API key from environment variable '{}'",
                env_var_name
            ))?;
            if key.trim().is_empty() {
                anyhow::bail!("Environment variable '{}' is empty", env_var_name);
            }
            Ok(key)
        }
        "keyring" => {
            let entry = keyring_entry()?;
            log::debug!("Retrieving API key from keyring for service: {}", KEYRING_SERVICE);
            entry
                .get_password()
                .context("Failed to get API key from keyring. Run `streamchat set-key` first.")
        }
        other => Err(anyhow::anyhow!("Unsupported api_key_ref format: {}", other)),
    }
}

/// Stores an API key in the OS keyring.
pub fn set_api_key_in_keyring(api_key: &str) -> Result<()> {
    let entry = keyring_entry()?;
    log::info!("Setting API key in keyring for service: {}", KEYRING_SERVICE);
    entry
        .set_password(api_key)
        .context("Failed to set API key in keyring")
}

fn keyring_entry() -> Result<Entry> {
    let user = whoami();
    Entry::new(KEYRING_SERVICE, &user).context("Failed to create keyring entry")
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "default".to_string())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
