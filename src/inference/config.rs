//! Model endpoint configuration.
//!
//! The `model` section of `config.yaml`, plus the `${VAR}` / `${VAR:-default}`
//! interpolation applied to every config file before it is parsed.

use std::fmt;

use serde::Deserialize;

use super::errors::InferenceError;

// ─── Defaults ────────────────────────────────────────────────────────────────

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
pub const DEFAULT_API_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: u32 = 2000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Environment variable consulted when `api_key` is unset or empty.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

// ─── ModelConfig ─────────────────────────────────────────────────────────────

/// Which model to call and how.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Endpoint root; `/v1/messages` is appended.
    pub base_url: String,
    pub model_name: String,
    pub api_key: Option<String>,
    pub api_version: String,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    /// Optional system prompt sent with every request.
    pub system_prompt: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model_name: DEFAULT_MODEL.to_string(),
            api_key: None,
            api_version: DEFAULT_API_VERSION.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            system_prompt: None,
        }
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("base_url", &self.base_url)
            .field("model_name", &self.model_name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_version", &self.api_version)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("system_prompt", &self.system_prompt)
            .finish()
    }
}

impl ModelConfig {
    /// The configured key, falling back to `ANTHROPIC_API_KEY`.
    pub fn resolve_api_key(&self) -> Result<String, InferenceError> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Ok(key.to_string());
        }
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(InferenceError::ConfigError {
                reason: format!("no API key: set model.api_key or {API_KEY_ENV}"),
            }),
        }
    }

    /// Full URL of the messages endpoint.
    pub fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
///
/// Uses `dirs::home_dir()` so it also works where `$HOME` is unset.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        // When env var is NOT set, use default
        std::env::remove_var("__TEST_RELAY_NONEXISTENT_VAR__");
        let input = "${__TEST_RELAY_NONEXISTENT_VAR__:-/fallback/path}";
        assert_eq!(interpolate_env_vars(input), "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TEST_RELAY_INFERENCE_VAR__", "/custom/path");
        let input = "url: ${__TEST_RELAY_INFERENCE_VAR__:-/fallback/path}/x";
        assert_eq!(interpolate_env_vars(input), "url: /custom/path/x");
        std::env::remove_var("__TEST_RELAY_INFERENCE_VAR__");
    }

    #[test]
    fn test_interpolate_unset_without_default_is_empty() {
        std::env::remove_var("__TEST_RELAY_UNSET_VAR__");
        assert_eq!(interpolate_env_vars("key=${__TEST_RELAY_UNSET_VAR__}."), "key=.");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with $dollar but no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/Documents");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/Documents"));
    }

    #[test]
    fn test_model_config_partial_yaml_uses_defaults() {
        let yaml = r#"
            model_name: claude-test
            max_tokens: 512
        "#;
        let config: ModelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.model_name, "claude-test");
        assert_eq!(config.max_tokens, 512);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.api_version, DEFAULT_API_VERSION);
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let config = ModelConfig {
            api_key: Some("sk-explicit".into()),
            ..ModelConfig::default()
        };
        assert_eq!(config.resolve_api_key().unwrap(), "sk-explicit");
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = ModelConfig {
            api_key: Some("sk-secret".into()),
            ..ModelConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_messages_url_trims_trailing_slash() {
        let config = ModelConfig {
            base_url: "http://localhost:8080/".into(),
            ..ModelConfig::default()
        };
        assert_eq!(config.messages_url(), "http://localhost:8080/v1/messages");
    }
}
