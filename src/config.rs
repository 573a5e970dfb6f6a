use crate::error::{EscrowError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub trust: TrustConfig,
    pub rooms: RoomConfig,
    pub deals: DealConfig,
    pub auth: AuthConfig,
    pub notify: NotifyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub acquire_timeout_seconds: Option<u64>,
    pub busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct TrustConfig {
    pub max_score: i32,
    pub new_account_cap: i32,
    pub new_account_days: i64,
    pub no_dispute_after_days: i64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Free-room count below which operators get an advisory alert.
    pub low_watermark: u32,
    /// `{handle}` is replaced by the room's chat handle.
    pub invite_template: String,
}

#[derive(Debug, Deserialize, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisputePolicy {
    /// Closing is refused while a dispute is open; cancel stays available.
    BlockClose,
    /// Close and cancel ignore open disputes.
    Allow,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct DealConfig {
    pub seller_reward_rate: Decimal,
    pub dispute_policy: DisputePolicy,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub token_ttl_hours: i64,
}

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub operator_chat: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8040,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://escrow.db".to_string(),
            max_connections: Some(10),
            min_connections: Some(1),
            acquire_timeout_seconds: Some(30),
            busy_timeout_ms: Some(5_000),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            max_score: 100,
            new_account_cap: 70,
            new_account_days: 30,
            no_dispute_after_days: 30,
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            low_watermark: 3,
            invite_template: "https://t.me/{handle}".to_string(),
        }
    }
}

impl Default for DealConfig {
    fn default() -> Self {
        Self {
            seller_reward_rate: dec!(0.001),
            dispute_policy: DisputePolicy::BlockClose,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_hours: 24,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("json".to_string()),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| EscrowError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| EscrowError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }

        if let Ok(jwt_secret) = std::env::var("JWT_SECRET") {
            self.auth.jwt_secret = Some(jwt_secret);
        }

        if let Ok(webhook) = std::env::var("NOTIFY_WEBHOOK_URL") {
            self.notify.webhook_url = Some(webhook);
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(EscrowError::Config("Server port cannot be 0".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(EscrowError::Config("Database URL cannot be empty".to_string()));
        }

        if self.trust.max_score <= 0 {
            return Err(EscrowError::Config("Trust max_score must be positive".to_string()));
        }

        if !(0..=self.trust.max_score).contains(&self.trust.new_account_cap) {
            return Err(EscrowError::Config(
                "Trust new_account_cap must lie within [0, max_score]".to_string(),
            ));
        }

        if self.deals.seller_reward_rate.is_sign_negative() {
            return Err(EscrowError::Config("Seller reward rate cannot be negative".to_string()));
        }

        if !self.rooms.invite_template.contains("{handle}") {
            return Err(EscrowError::Config(
                "Room invite_template must contain {handle}".to_string(),
            ));
        }

        if self.auth.token_ttl_hours <= 0 {
            return Err(EscrowError::Config("Token TTL must be positive".to_string()));
        }

        Ok(())
    }

    pub fn get_database_url(&self) -> &str {
        &self.database.url
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn get_jwt_secret(&self) -> Option<&str> {
        self.auth.jwt_secret.as_deref()
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| EscrowError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| EscrowError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
