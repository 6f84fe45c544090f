//! Process-level configuration resolved once at startup.
//!
//! Components receive the pieces they need through constructors; nothing in
//! the engine reaches for environment variables after bootstrap.

use std::path::PathBuf;

/// Default heartbeat lease granted to sessions, in seconds.
pub const DEFAULT_HEARTBEAT_LEASE_SECS: i64 = 60;

/// Engine configuration.
///
/// Resolved from the environment via [`WindlassConfig::from_env`], or built
/// directly in tests.
#[derive(Clone, Debug)]
pub struct WindlassConfig {
    /// Base URL of the OpenAI-compatible provider (chat completions,
    /// embeddings, and the generation/cost endpoint).
    pub provider_base_url: String,
    /// Bearer token for the provider.
    pub provider_api_key: String,
    /// Root directory for the engine store, per-session DBs, and artifacts.
    pub data_dir: PathBuf,
    /// Default chat model for LLM cells that do not name one.
    pub default_model: String,
    /// Cheap model used for evaluators and context summarization.
    pub eval_model: String,
    /// Default embedding model.
    pub embed_model: String,
    /// When true, embeddings are computed offline and deterministically.
    pub deterministic_embeddings: bool,
    /// Heartbeat lease granted to new sessions.
    pub heartbeat_lease_seconds: i64,
}

impl Default for WindlassConfig {
    fn default() -> Self {
        Self {
            provider_base_url: "https://openrouter.ai/api/v1".to_string(),
            provider_api_key: String::new(),
            data_dir: PathBuf::from("./windlass-data"),
            default_model: "openai/gpt-4o-mini".to_string(),
            eval_model: "google/gemini-2.5-flash-lite".to_string(),
            embed_model: "openai/text-embedding-3-small".to_string(),
            deterministic_embeddings: false,
            heartbeat_lease_seconds: DEFAULT_HEARTBEAT_LEASE_SECS,
        }
    }
}

impl WindlassConfig {
    /// Resolve configuration from `.env` and the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            provider_base_url: std::env::var("PROVIDER_BASE_URL")
                .unwrap_or(defaults.provider_base_url),
            provider_api_key: std::env::var("PROVIDER_API_KEY").unwrap_or_default(),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            default_model: std::env::var("WINDLASS_DEFAULT_MODEL")
                .unwrap_or(defaults.default_model),
            eval_model: std::env::var("WINDLASS_EVAL_MODEL").unwrap_or(defaults.eval_model),
            embed_model: std::env::var("WINDLASS_EMBED_MODEL").unwrap_or(defaults.embed_model),
            deterministic_embeddings: std::env::var("EMBED_BACKEND")
                .map(|v| v.eq_ignore_ascii_case("deterministic"))
                .unwrap_or(false),
            heartbeat_lease_seconds: std::env::var("HEARTBEAT_LEASE_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HEARTBEAT_LEASE_SECS),
        }
    }

    /// Path of the durable engine store (unified log, sessions, checkpoints).
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("windlass.db")
    }

    /// Directory holding per-session temp-table databases.
    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Directory holding per-session pipeline artifacts (large frames).
    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    /// Extract the provider name from a model identifier.
    ///
    /// `anthropic/claude-sonnet` yields `anthropic`; bare model names yield
    /// `unknown`.
    #[must_use]
    pub fn provider_from_model(model: &str) -> &str {
        match model.split_once('/') {
            Some((provider, _)) if !provider.is_empty() => provider,
            _ => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_extraction() {
        assert_eq!(
            WindlassConfig::provider_from_model("anthropic/claude-sonnet-4"),
            "anthropic"
        );
        assert_eq!(WindlassConfig::provider_from_model("x-ai/grok-4:free"), "x-ai");
        assert_eq!(WindlassConfig::provider_from_model("gpt-4"), "unknown");
        assert_eq!(WindlassConfig::provider_from_model(""), "unknown");
    }

    #[test]
    fn store_paths_derive_from_data_dir() {
        let cfg = WindlassConfig {
            data_dir: PathBuf::from("/tmp/wl"),
            ..WindlassConfig::default()
        };
        assert_eq!(cfg.store_path(), PathBuf::from("/tmp/wl/windlass.db"));
        assert_eq!(cfg.sessions_dir(), PathBuf::from("/tmp/wl/sessions"));
    }
}
