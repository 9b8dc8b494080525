use crate::errors::{AppError, AppResult};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "Llama-4-Maverick-17B-128E-Instruct-FP8";
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 2_000;

const MIN_QUERY_TIMEOUT_MS: u64 = 10;
const MAX_QUERY_TIMEOUT_MS: u64 = 600_000;
const MIN_LLM_TIMEOUT_SECS: u64 = 1;
const MAX_LLM_TIMEOUT_SECS: u64 = 600;

const KEYRING_SERVICE: &str = "course-metrics";
const KEYRING_USER: &str = "llm-api-key";

/// Connection settings for the OpenAI-compatible endpoint serving the model.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS),
        }
    }
}

impl LlmSettings {
    pub fn is_configured(&self) -> bool {
        self.base_url.as_deref().is_some_and(|url| !url.trim().is_empty())
            && self.api_key.as_deref().is_some_and(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub db_path: PathBuf,
    pub registry_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub query_timeout: Duration,
    pub busy_timeout: Duration,
    pub llm: LlmSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("user.db"),
            registry_path: PathBuf::from("metrics.json"),
            log_dir: None,
            query_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            llm: LlmSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> AppResult<()> {
        let query_ms = u64::try_from(self.query_timeout.as_millis()).unwrap_or(u64::MAX);
        if !(MIN_QUERY_TIMEOUT_MS..=MAX_QUERY_TIMEOUT_MS).contains(&query_ms) {
            return Err(AppError::Config(format!(
                "Query timeout {} ms is out of allowed range ({}..={}) ms",
                query_ms, MIN_QUERY_TIMEOUT_MS, MAX_QUERY_TIMEOUT_MS
            )));
        }

        let llm_secs = self.llm.timeout.as_secs();
        if !(MIN_LLM_TIMEOUT_SECS..=MAX_LLM_TIMEOUT_SECS).contains(&llm_secs) {
            return Err(AppError::Config(format!(
                "LLM timeout {} s is out of allowed range ({}..={}) seconds",
                llm_secs, MIN_LLM_TIMEOUT_SECS, MAX_LLM_TIMEOUT_SECS
            )));
        }

        if self.llm.model.trim().is_empty() {
            return Err(AppError::Config("LLM model name cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Explicit key wins; otherwise fall back to the key stored in the OS keyring.
pub fn resolve_api_key(explicit: Option<String>) -> Option<String> {
    explicit
        .filter(|key| !key.trim().is_empty())
        .or_else(|| match stored_api_key() {
            Ok(key) => key,
            Err(error) => {
                tracing::debug!(%error, "keyring lookup failed");
                None
            }
        })
}

fn keyring_entry(user: &str) -> AppResult<keyring::Entry> {
    keyring::Entry::new(KEYRING_SERVICE, user).map_err(|error| AppError::Config(error.to_string()))
}

pub fn stored_api_key() -> AppResult<Option<String>> {
    read_secret(KEYRING_USER)
}

pub fn save_api_key(key: &str) -> AppResult<()> {
    write_secret(KEYRING_USER, key)
}

pub fn clear_api_key() -> AppResult<()> {
    delete_secret(KEYRING_USER)
}

fn read_secret(user: &str) -> AppResult<Option<String>> {
    match keyring_entry(user)?.get_password() {
        Ok(value) if !value.is_empty() => Ok(Some(value)),
        Ok(_) | Err(keyring::Error::NoEntry) => Ok(None),
        Err(error) => Err(AppError::Config(error.to_string())),
    }
}

fn write_secret(user: &str, key: &str) -> AppResult<()> {
    if key.trim().is_empty() {
        return Err(AppError::Config("API key cannot be empty".to_string()));
    }
    keyring_entry(user)?
        .set_password(key.trim())
        .map_err(|error| AppError::Config(error.to_string()))
}

fn delete_secret(user: &str) -> AppResult<()> {
    match keyring_entry(user)?.delete_credential() {
        Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(error) => Err(AppError::Config(error.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::{delete_secret, read_secret, resolve_api_key, write_secret, LlmSettings, Settings};
    use crate::errors::AppError;
    use std::time::Duration;

    #[test]
    fn llm_needs_both_url_and_key() {
        let mut settings = LlmSettings::default();
        assert!(!settings.is_configured());
        settings.base_url = Some("http://localhost:8000/v1".to_string());
        assert!(!settings.is_configured());
        settings.api_key = Some("  ".to_string());
        assert!(!settings.is_configured());
        settings.api_key = Some("secret".to_string());
        assert!(settings.is_configured());
    }

    #[test]
    fn explicit_key_is_preferred() {
        assert_eq!(resolve_api_key(Some("abc".to_string())), Some("abc".to_string()));
    }

    #[test]
    fn defaults_validate_and_bounds_are_enforced() {
        assert!(Settings::default().validate().is_ok());

        let zero_query = Settings {
            query_timeout: Duration::ZERO,
            ..Settings::default()
        };
        assert!(matches!(zero_query.validate(), Err(AppError::Config(_))));

        let mut slow_llm = Settings::default();
        slow_llm.llm.timeout = Duration::from_secs(3_600);
        assert!(matches!(slow_llm.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn stored_key_survives_a_fresh_entry() {
        let user = format!("test-roundtrip-{}", std::process::id());
        if let Err(error) = write_secret(&user, "  round-trip-secret  ") {
            eprintln!("skipping: no OS keyring available ({})", error);
            return;
        }
        let read_back = read_secret(&user);
        let cleared = delete_secret(&user);
        assert_eq!(read_back.expect("read"), Some("round-trip-secret".to_string()));
        cleared.expect("clear");
        assert_eq!(read_secret(&user).expect("read after clear"), None);
    }

    #[test]
    fn blank_keys_are_rejected_before_the_keyring() {
        assert!(matches!(write_secret("unused", "   "), Err(AppError::Config(_))));
    }
}
