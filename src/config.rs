use crate::protocol::UserId;
use crate::session::DEFAULT_HISTORY_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BINDING_NAME: &str = "KV";
pub const DEFAULT_WEBHOOK_LISTEN: &str = "0.0.0.0:8080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Telegram bot token is required (set TELEGRAM_BOT_TOKEN, --bot-token or telegram.token)")]
    MissingToken,

    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Bot configuration loaded from ~/.config/cfbot/config.toml
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BotConfig {
    /// Telegram transport settings
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Cloudflare API settings
    #[serde(default)]
    pub cloudflare: CloudflareConfig,

    /// User registry persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// Per-user session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Webhook server settings
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token from @BotFather
    pub token: Option<String>,

    /// Telegram user id of the administrator who approves new users.
    /// When unset, registration and approval are skipped.
    pub admin_id: Option<UserId>,

    /// Long-poll timeout for getUpdates
    pub poll_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CloudflareConfig {
    /// API base URL (default: https://api.cloudflare.com/client/v4)
    pub api_base: Option<String>,

    /// Per-request timeout in seconds
    pub timeout_secs: Option<u64>,

    /// Variable name a bound KV namespace is exposed under in the Worker
    pub binding_name: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON file for the user registry (memory-only when unset)
    pub registry_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Number of history entries kept per session
    pub history_capacity: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_capacity: Some(DEFAULT_HISTORY_CAPACITY),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Socket address the webhook server binds to
    pub listen: Option<String>,

    /// Public base URL Telegram should deliver updates to
    pub public_url: Option<String>,
}

impl BotConfig {
    /// Get the default config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("cfbot").join("config.toml"))
    }

    /// Load config from `path` (or the default location). A missing file
    /// yields the defaults; an unreadable or invalid file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::config_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Bot token: explicit override, then config. Required to start.
    pub fn bot_token(&self, cli_override: Option<&str>) -> Result<String, ConfigError> {
        cli_override
            .map(str::to_string)
            .or_else(|| self.telegram.token.clone())
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or(ConfigError::MissingToken)
    }

    pub fn admin_id(&self, cli_override: Option<UserId>) -> Option<UserId> {
        cli_override.or(self.telegram.admin_id)
    }

    pub fn poll_timeout_secs(&self) -> u64 {
        self.telegram
            .poll_timeout_secs
            .unwrap_or(DEFAULT_POLL_TIMEOUT_SECS)
    }

    pub fn cloudflare_api_base(&self) -> String {
        self.cloudflare
            .api_base
            .clone()
            .unwrap_or_else(|| crate::cloudflare::DEFAULT_API_BASE.to_string())
    }

    pub fn cloudflare_timeout_secs(&self) -> u64 {
        self.cloudflare
            .timeout_secs
            .unwrap_or(crate::cloudflare::DEFAULT_TIMEOUT_SECS)
    }

    pub fn binding_name(&self) -> String {
        self.cloudflare
            .binding_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BINDING_NAME.to_string())
    }

    pub fn registry_path(&self, cli_override: Option<PathBuf>) -> Option<PathBuf> {
        cli_override.or_else(|| self.storage.registry_path.clone())
    }

    pub fn history_capacity(&self) -> usize {
        self.session
            .history_capacity
            .unwrap_or(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn webhook_listen(&self, cli_override: Option<String>) -> String {
        cli_override
            .or_else(|| self.webhook.listen.clone())
            .unwrap_or_else(|| DEFAULT_WEBHOOK_LISTEN.to_string())
    }

    pub fn webhook_public_url(&self, cli_override: Option<String>) -> Option<String> {
        cli_override.or_else(|| self.webhook.public_url.clone())
    }
}

/// Generate a sample config file content
pub fn sample_config() -> &'static str {
    r#"# cfbot configuration
# Location: ~/.config/cfbot/config.toml

[telegram]
# Bot token from @BotFather (or set TELEGRAM_BOT_TOKEN)
token = "123456:your-bot-token"

# Telegram user id allowed to approve new users (or set ADMIN_ID).
# Remove to let anyone log in without approval.
# admin_id = 123456789

# poll_timeout_secs = 30

[cloudflare]
# api_base = "https://api.cloudflare.com/client/v4"
# timeout_secs = 30
# Name the bound KV namespace gets inside the Worker
binding_name = "KV"

[storage]
# Persist registered users (memory-only when unset)
# registry_path = "/var/lib/cfbot/users.json"

[session]
history_capacity = 50

[webhook]
# listen = "0.0.0.0:8080"
# public_url = "https://bot.example.com"
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_parses() {
        let cfg = BotConfig::parse(sample_config()).expect("sample config is valid TOML");
        assert_eq!(cfg.binding_name(), "KV");
        assert_eq!(cfg.history_capacity(), 50);
        assert_eq!(cfg.admin_id(None), None);
        assert!(cfg.registry_path(None).is_none());
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let cfg = BotConfig::parse("").unwrap();
        assert_eq!(cfg.poll_timeout_secs(), DEFAULT_POLL_TIMEOUT_SECS);
        assert_eq!(cfg.cloudflare_api_base(), crate::cloudflare::DEFAULT_API_BASE);
        assert_eq!(cfg.webhook_listen(None), DEFAULT_WEBHOOK_LISTEN);
        assert!(matches!(cfg.bot_token(None), Err(ConfigError::MissingToken)));
    }

    #[test]
    fn test_cli_overrides_take_precedence() {
        let cfg = BotConfig::parse(
            r#"
[telegram]
token = "from-file"
admin_id = 1

[storage]
registry_path = "/tmp/users.json"
"#,
        )
        .unwrap();

        assert_eq!(cfg.bot_token(None).unwrap(), "from-file");
        assert_eq!(cfg.bot_token(Some(" from-cli ")).unwrap(), "from-cli");
        assert_eq!(cfg.admin_id(Some(2)), Some(2));
        assert_eq!(cfg.admin_id(None), Some(1));
        assert_eq!(
            cfg.registry_path(Some(PathBuf::from("/data/u.json"))),
            Some(PathBuf::from("/data/u.json"))
        );
    }

    #[test]
    fn test_blank_token_is_missing() {
        let cfg = BotConfig::parse("[telegram]\ntoken = \"  \"\n").unwrap();
        assert!(matches!(cfg.bot_token(None), Err(ConfigError::MissingToken)));
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let path = std::env::temp_dir().join(format!("cfbot-missing-{}.toml", uuid::Uuid::new_v4()));
        let cfg = BotConfig::load(Some(&path)).unwrap();
        assert!(cfg.telegram.token.is_none());
    }

    #[test]
    fn test_load_invalid_file_is_error() {
        let path = std::env::temp_dir().join(format!("cfbot-invalid-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[telegram\ntoken = 1").unwrap();
        assert!(matches!(
            BotConfig::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
        let _ = std::fs::remove_file(&path);
    }
}
