//! Fleet configuration module
//!
//! Loads manager configuration from an optional `fleet.toml`, `FLEET_*`
//! environment variables and a `.env` file. `DISCORD_TOKEN`, `HTTP_PORT`,
//! `NATS_URL` and `LOG_LEVEL` keep their unprefixed names.

use crate::error::FleetError;
use crate::ipc::ClientOptions;
use config::{Config, Environment, File};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default delay between two cluster connects
pub const DEFAULT_STARTUP_COOLDOWN_MS: u64 = 10_000;
/// Default time a connect may stay unacknowledged
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_GUILDS_PER_SHARD: u32 = 1000;
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_WORKER_STATS_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 5_000;

/// Fleet configuration
#[derive(Clone)]
pub struct FleetConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Display name used in the startup banner
    pub name: String,

    /// Total shards across the fleet; 0 asks the gateway
    pub total_shards: u32,

    /// First shard run by this fleet (defaults to 0)
    pub first_shard: Option<u32>,

    /// Last shard run by this fleet (defaults to total_shards - 1)
    pub last_shard: Option<u32>,

    /// Number of worker processes
    pub cluster_count: u32,

    pub startup_cooldown: Duration,

    pub queue_timeout: Duration,

    /// Guild budget per shard when the shard count is automatic
    pub guilds_per_shard: u32,

    pub stats_enabled: bool,

    pub stats_interval: Duration,

    /// Worker-side telemetry sampling period
    pub worker_stats_interval: Duration,

    pub fetch_timeout: Duration,

    /// Forward worker debug logs
    pub debug: bool,

    /// Discord webhook (id, token) for lifecycle notifications
    pub webhook: Option<(u64, String)>,

    /// Activity label shown on every shard
    pub presence: Option<String>,

    /// Passthrough gateway client options
    pub client_options: ClientOptions,

    /// Workers skip the gateway connection
    pub dry_run: bool,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// NATS server URL(s), comma-separated
    pub nats_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

// The tokens never reach a log line
impl std::fmt::Debug for FleetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetConfig")
            .field("name", &self.name)
            .field("total_shards", &self.total_shards)
            .field("first_shard", &self.first_shard)
            .field("last_shard", &self.last_shard)
            .field("cluster_count", &self.cluster_count)
            .field("startup_cooldown", &self.startup_cooldown)
            .field("stats_enabled", &self.stats_enabled)
            .field("webhook", &self.webhook.as_ref().map(|(id, _)| id))
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl FleetConfig {
    /// Defaults for everything but the token; one cluster, automatic shard count
    pub fn new(discord_token: impl Into<String>) -> Self {
        Self {
            discord_token: discord_token.into(),
            name: env!("CARGO_PKG_NAME").to_string(),
            total_shards: 0,
            first_shard: None,
            last_shard: None,
            cluster_count: 1,
            startup_cooldown: Duration::from_millis(DEFAULT_STARTUP_COOLDOWN_MS),
            queue_timeout: Duration::from_millis(DEFAULT_QUEUE_TIMEOUT_MS),
            guilds_per_shard: DEFAULT_GUILDS_PER_SHARD,
            stats_enabled: false,
            stats_interval: Duration::from_millis(DEFAULT_STATS_INTERVAL_MS),
            worker_stats_interval: Duration::from_millis(DEFAULT_WORKER_STATS_INTERVAL_MS),
            fetch_timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
            debug: false,
            webhook: None,
            presence: None,
            client_options: ClientOptions::default(),
            dry_run: false,
            http_port: 9090,
            nats_url: None,
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from `fleet.toml` and the environment
    pub fn from_env() -> Result<Self, FleetError> {
        dotenvy::dotenv().ok();

        let settings = Config::builder()
            .add_source(File::with_name("fleet").required(false))
            .add_source(Environment::with_prefix("FLEET"))
            .build()
            .map_err(|e| FleetError::Config(format!("failed to load settings: {e}")))?;

        Self::from_settings(&settings)
    }

    /// Build from already-layered settings (keys without the `FLEET_` prefix)
    pub fn from_settings(settings: &Config) -> Result<Self, FleetError> {
        let discord_token = env::var("DISCORD_TOKEN")
            .or_else(|_| env::var("DISCORD_BOT_TOKEN"))
            .ok()
            .or_else(|| settings.get_string("token").ok())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| FleetError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string()))?;

        let total_shards = parse_or(settings, "total_shards", 0u32)?;
        let first_shard = parse_opt(settings, "first_shard")?;
        let last_shard = parse_opt(settings, "last_shard")?;
        if let (Some(first), Some(last)) = (first_shard, last_shard) {
            if first > last {
                return Err(FleetError::Config(format!(
                    "FLEET_FIRST_SHARD ({first}) must not exceed FLEET_LAST_SHARD ({last})"
                )));
            }
        }

        let default_clusters = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let cluster_count = parse_or(settings, "cluster_count", default_clusters)?;
        if cluster_count == 0 {
            return Err(FleetError::Config("FLEET_CLUSTER_COUNT must be at least 1".to_string()));
        }

        let guilds_per_shard = parse_or(settings, "guilds_per_shard", DEFAULT_GUILDS_PER_SHARD)?;
        if guilds_per_shard == 0 {
            return Err(FleetError::Config("FLEET_GUILDS_PER_SHARD must be at least 1".to_string()));
        }

        let webhook = match (settings.get_string("webhook_id").ok(), settings.get_string("webhook_token").ok()) {
            (Some(id), Some(token)) => {
                let id = id
                    .parse::<u64>()
                    .ok()
                    .filter(|id| *id != 0)
                    .ok_or_else(|| FleetError::Config(format!("FLEET_WEBHOOK_ID must be a non-zero snowflake, got '{id}'")))?;
                Some((id, token))
            }
            (None, None) => None,
            _ => {
                return Err(FleetError::Config(
                    "FLEET_WEBHOOK_ID and FLEET_WEBHOOK_TOKEN must be set together".to_string(),
                ))
            }
        };

        let client_options = match settings.get_string("client_options").ok() {
            Some(raw) => parse_client_options(&raw)?,
            None => ClientOptions::default(),
        };

        let http_port = env::var("HTTP_PORT")
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| FleetError::Config(format!("HTTP_PORT must be a valid port number: {e}")))?;

        Ok(Self {
            discord_token,
            name: settings
                .get_string("name")
                .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string()),
            total_shards,
            first_shard,
            last_shard,
            cluster_count,
            startup_cooldown: millis(settings, "startup_cooldown_ms", DEFAULT_STARTUP_COOLDOWN_MS)?,
            queue_timeout: millis(settings, "queue_timeout_ms", DEFAULT_QUEUE_TIMEOUT_MS)?,
            guilds_per_shard,
            stats_enabled: parse_or(settings, "stats_enabled", false)?,
            stats_interval: millis(settings, "stats_interval_ms", DEFAULT_STATS_INTERVAL_MS)?,
            worker_stats_interval: millis(settings, "worker_stats_interval_ms", DEFAULT_WORKER_STATS_INTERVAL_MS)?,
            fetch_timeout: millis(settings, "fetch_timeout_ms", DEFAULT_FETCH_TIMEOUT_MS)?,
            debug: parse_or(settings, "debug", false)?,
            webhook,
            presence: settings.get_string("presence").ok().filter(|p| !p.is_empty()),
            client_options,
            dry_run: parse_or(settings, "dry_run", false)?,
            http_port,
            nats_url: env::var("NATS_URL").ok(),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Parse `FLEET_CLIENT_OPTIONS` JSON
pub fn parse_client_options(raw: &str) -> Result<ClientOptions, FleetError> {
    let options: ClientOptions = serde_json::from_str(raw)
        .map_err(|e| FleetError::Config(format!("FLEET_CLIENT_OPTIONS must be a JSON object: {e}")))?;

    if let Some(threshold) = options.large_threshold {
        if !(50..=250).contains(&threshold) {
            return Err(FleetError::Config(format!(
                "large_threshold must be between 50 and 250, got {threshold}"
            )));
        }
    }

    Ok(options)
}

fn parse_opt<T>(settings: &Config, key: &str) -> Result<Option<T>, FleetError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match settings.get_string(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| FleetError::Config(format!("FLEET_{} is invalid: {e}", key.to_uppercase()))),
        Err(_) => Ok(None),
    }
}

fn parse_or<T>(settings: &Config, key: &str, default: T) -> Result<T, FleetError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(settings, key)?.unwrap_or(default))
}

fn millis(settings: &Config, key: &str, default: u64) -> Result<Duration, FleetError> {
    parse_or(settings, key, default).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Config {
        let mut builder = Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn defaults_apply() {
        let config = FleetConfig::from_settings(&settings(&[("token", "abc")])).unwrap();
        assert_eq!(config.total_shards, 0);
        assert_eq!(config.startup_cooldown, Duration::from_millis(DEFAULT_STARTUP_COOLDOWN_MS));
        assert_eq!(config.stats_interval, Duration::from_millis(DEFAULT_STATS_INTERVAL_MS));
        assert_eq!(config.guilds_per_shard, 1000);
        assert!(config.cluster_count >= 1);
        assert!(!config.stats_enabled);
        assert!(config.webhook.is_none());
    }

    #[test]
    fn explicit_values_are_parsed() {
        let config = FleetConfig::from_settings(&settings(&[
            ("token", "abc"),
            ("total_shards", "5"),
            ("cluster_count", "2"),
            ("stats_enabled", "true"),
            ("startup_cooldown_ms", "250"),
            ("webhook_id", "123456789"),
            ("webhook_token", "hook"),
            ("presence", "fleet"),
        ]))
        .unwrap();
        assert_eq!(config.total_shards, 5);
        assert_eq!(config.cluster_count, 2);
        assert!(config.stats_enabled);
        assert_eq!(config.startup_cooldown, Duration::from_millis(250));
        assert_eq!(config.webhook, Some((123456789, "hook".to_string())));
        assert_eq!(config.presence.as_deref(), Some("fleet"));
    }

    #[test]
    fn invalid_numbers_are_config_errors() {
        let err = FleetConfig::from_settings(&settings(&[("token", "abc"), ("cluster_count", "many")]))
            .err()
            .unwrap();
        assert_eq!(err.error_type_label(), "config");
        assert!(err.to_string().contains("FLEET_CLUSTER_COUNT"));
    }

    #[test]
    fn half_configured_webhook_is_rejected() {
        let err = FleetConfig::from_settings(&settings(&[("token", "abc"), ("webhook_id", "1")]));
        assert!(err.is_err());
    }

    #[test]
    fn client_options_validate_large_threshold() {
        let ok = parse_client_options(r#"{"large_threshold": 100, "intents": 1}"#).unwrap();
        assert_eq!(ok.large_threshold, Some(100));
        assert_eq!(ok.intents, Some(1));
        assert!(parse_client_options(r#"{"large_threshold": 10}"#).is_err());
        assert!(parse_client_options("not json").is_err());
    }
}
