use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const CONFIG_ENV: &str = "REPLYBUS_CONFIG";
const CONFIG_DIR_NAME: &str = ".replybus";
const CONFIG_FILE_NAME: &str = "config.toml";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level replybus configuration, loaded from `config.toml`.
///
/// Resolution order: `REPLYBUS_CONFIG` env → `~/.replybus/config.toml` → defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct Config {
    /// Path the config was loaded from - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Request/reply engine tunables (`[request_reply]`).
    #[serde(default)]
    pub request_reply: RequestReplyConfig,

    /// Logical binding name → concrete topic or topic pattern (`[bindings]`).
    /// Patterns may use MQTT wildcards (`+` one level, trailing `#` the rest).
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
}

// ── Request/reply ─────────────────────────────────────────────────

/// Request/reply engine configuration (`[request_reply]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RequestReplyConfig {
    /// Deadline applied when a call does not pass its own. Default: `30000`.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Upper bound on concurrently running send+await exchanges. Default: `1024`.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Binding (or topic) replies are routed to. Default: `"replies"`.
    #[serde(default = "default_reply_to")]
    pub reply_to: String,
    /// Reply indices tracked for duplicate detection per request. Default: `4096`.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    /// Byte budget for packing multi-part replies into one message.
    /// `0` disables grouping. Default: `0`.
    #[serde(default)]
    pub group_max_bytes: usize,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_in_flight() -> usize {
    1024
}

fn default_reply_to() -> String {
    "replies".into()
}

fn default_dedup_window() -> usize {
    4096
}

impl Default for RequestReplyConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            reply_to: default_reply_to(),
            dedup_window: default_dedup_window(),
            group_max_bytes: 0,
        }
    }
}

impl RequestReplyConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            anyhow::bail!("request_reply.default_timeout_ms must be greater than 0");
        }
        if self.max_in_flight == 0 {
            anyhow::bail!("request_reply.max_in_flight must be greater than 0");
        }
        if self.dedup_window == 0 {
            anyhow::bail!("request_reply.dedup_window must be greater than 0");
        }
        if self.reply_to.trim().is_empty() {
            anyhow::bail!("request_reply.reply_to must not be empty");
        }
        Ok(())
    }
}

// ── Loading ───────────────────────────────────────────────────────

/// `~/.replybus/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn resolve_config_path() -> Result<PathBuf> {
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
        _ => default_config_path(),
    }
}

impl Config {
    /// Load from the resolved config path, falling back to defaults when the
    /// file does not exist. Env overrides are applied and the result validated.
    pub async fn load_or_default() -> Result<Self> {
        let path = resolve_config_path()?;
        let mut config = if fs::try_exists(&path).await.unwrap_or(false) {
            Self::load_from(&path).await?
        } else {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            Self {
                config_path: path,
                ..Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse the TOML file at `path` without env overrides.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_path = path.to_path_buf();
        tracing::info!(path = %path.display(), bindings = config.bindings.len(), "config loaded");
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = self.to_toml()?;
        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;
        fs::write(&self.config_path, toml_str)
            .await
            .with_context(|| format!("Failed to write config file {}", self.config_path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(timeout_ms) = env_parse::<u64>("REPLYBUS_DEFAULT_TIMEOUT_MS") {
            self.request_reply.default_timeout_ms = timeout_ms;
        }
        if let Ok(reply_to) = std::env::var("REPLYBUS_REPLY_TO") {
            if !reply_to.is_empty() {
                self.request_reply.reply_to = reply_to;
            }
        }
        if let Some(window) = env_parse::<usize>("REPLYBUS_DEDUP_WINDOW") {
            self.request_reply.dedup_window = window;
        }
        if let Some(budget) = env_parse::<usize>("REPLYBUS_GROUP_MAX_BYTES") {
            self.request_reply.group_max_bytes = budget;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.request_reply.validate()?;
        for (binding, destination) in &self.bindings {
            if binding.trim().is_empty() {
                anyhow::bail!("bindings: binding names must not be empty");
            }
            if destination.trim().is_empty() {
                anyhow::bail!("bindings.{binding}: destination must not be empty");
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.request_reply.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.request_reply.max_in_flight, 1024);
        assert_eq!(config.request_reply.reply_to, "replies");
        assert_eq!(config.request_reply.dedup_window, 4096);
        assert_eq!(config.request_reply.group_max_bytes, 0);
    }

    #[test]
    fn partial_section_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [request_reply]
            reply_to = "svc/replies"

            [bindings]
            orders = "svc/orders/requests"
            "#,
        )
        .expect("parse");
        assert_eq!(config.request_reply.reply_to, "svc/replies");
        assert_eq!(config.request_reply.dedup_window, 4096);
        assert_eq!(config.bindings["orders"], "svc/orders/requests");
    }

    #[test]
    fn validation_rejects_zero_and_empty_values() {
        let mut config = Config::default();
        config.request_reply.default_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.request_reply.max_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.request_reply.dedup_window = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.request_reply.reply_to = "  ".into();
        let error = config.validate().expect_err("empty reply_to");
        assert!(error.to_string().contains("reply_to"));

        let mut config = Config::default();
        config.bindings.insert("orders".into(), String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_preserves_values() {
        let mut config = Config::default();
        config.request_reply.group_max_bytes = 512;
        config.bindings.insert("replies".into(), "svc/+/replies".into());
        let parsed: Config = toml::from_str(&config.to_toml().expect("serialize")).expect("parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn schema_names_request_reply_fields() {
        let schema = serde_json::to_string(&schemars::schema_for!(Config)).expect("schema json");
        assert!(schema.contains("dedup_window"));
        assert!(schema.contains("bindings"));
    }
}
