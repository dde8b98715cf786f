//! Configuration management

use anyhow::Result;
use chrono_tz::Tz;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,
    /// Directory holding the built dashboard (index.html + assets)
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls_cert: String::new(),
            tls_key: String::new(),
            static_dir: default_static_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database before giving up
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Which representation backs the "today" counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Today is read from today's history bucket; rollover has nothing to do
    #[default]
    History,
    /// Entities carry a live counter for the open day, closed out by rollover
    LiveCounters,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::History => "history",
            StorageMode::LiveCounters => "live_counters",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficConfig {
    /// IANA timezone that defines calendar-day boundaries
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub storage_mode: StorageMode,
    #[serde(default = "default_source_freshness_secs")]
    pub source_freshness_secs: i64,
    #[serde(default = "default_entity_freshness_secs")]
    pub entity_freshness_secs: i64,
    /// Run the midnight rollover task
    #[serde(default = "default_true")]
    pub rollover_enabled: bool,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            storage_mode: StorageMode::default(),
            source_freshness_secs: default_source_freshness_secs(),
            entity_freshness_secs: default_entity_freshness_secs(),
            rollover_enabled: true,
        }
    }
}

impl TrafficConfig {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Invalid timezone '{}': {}", self.timezone, e))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Dashboard login password, also the token signing secret
    pub password: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub sources: Vec<SyncSourceConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            sources: Vec::new(),
        }
    }
}

/// A Hysteria2 traffic-stats endpoint polled on every sync tick
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSourceConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    #[serde(default = "default_sync_tag")]
    pub tag: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    37022
}

fn default_static_dir() -> String {
    "web/dist".to_string()
}

fn default_database_url() -> String {
    "trafficdash.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

fn default_source_freshness_secs() -> i64 {
    30
}

fn default_entity_freshness_secs() -> i64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_token_ttl_hours() -> i64 {
    24
}

fn default_sync_interval_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_sync_tag() -> String {
    "hysteria2".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("TRAFFICDASH")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        // Both or neither
        let has_cert = !self.server.tls_cert.is_empty();
        let has_key = !self.server.tls_key.is_empty();
        if has_cert != has_key {
            anyhow::bail!(
                "TLS configuration incomplete: both tls_cert and tls_key must be set, or neither"
            );
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        self.traffic.tz()?;
        if self.traffic.source_freshness_secs <= 0 || self.traffic.entity_freshness_secs <= 0 {
            anyhow::bail!("Freshness windows must be positive");
        }

        if self.auth.password.trim().is_empty() {
            anyhow::bail!("auth.password must be set (TRAFFICDASH__AUTH__PASSWORD)");
        }
        if self.auth.token_ttl_hours <= 0 {
            anyhow::bail!("auth.token_ttl_hours must be positive");
        }

        if self.sync.interval_secs == 0 {
            anyhow::bail!("sync.interval_secs must be at least 1");
        }
        for source in &self.sync.sources {
            if source.host.trim().is_empty() || source.port == 0 || source.password.is_empty() {
                anyhow::bail!("Incomplete sync source '{}:{}'", source.host, source.port);
            }
        }

        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        !self.server.tls_cert.is_empty() && !self.server.tls_key.is_empty()
    }
}
