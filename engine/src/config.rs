//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use ledgerline_common::{LedgerError, Rate, Result};
use ledgerline_fx::DEFAULT_USD_EUR_RATE;
use ledgerline_ledger::{PoolSettings, RetryPolicy};
use rust_decimal::Decimal;

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/ledgerline".to_string(),
            max_connections: 30,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl DatabaseConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            url: self.url.clone(),
            max_connections: self.max_connections,
            acquire_timeout: self.acquire_timeout,
        }
    }
}

/// Transactional executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Attempts per call, the first one included.
    pub max_attempts: u32,
    /// Base of the quadratic backoff.
    pub base_backoff: Duration,
    /// Upper bound of the random jitter added to each backoff.
    pub max_jitter: Duration,
    /// Deadline for one call, retries included. `None` disables it.
    pub request_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(20),
            max_jitter: Duration::from_millis(10),
            request_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl ExecutorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: self.base_backoff,
            max_jitter: self.max_jitter,
        }
    }
}

/// Exchange quote configuration.
#[derive(Debug, Clone)]
pub struct QuoteConfig {
    pub ttl: Duration,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(120),
        }
    }
}

impl QuoteConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(2))
    }
}

/// Rate source configuration.
#[derive(Debug, Clone)]
pub struct FxConfig {
    /// Units of EUR bought by one USD.
    pub usd_eur_rate: Decimal,
}

impl Default for FxConfig {
    fn default() -> Self {
        Self {
            usd_eur_rate: DEFAULT_USD_EUR_RATE,
        }
    }
}

impl FxConfig {
    /// The configured rate, normalized to six digits.
    pub fn usd_eur(&self) -> Result<Rate> {
        Ok(Rate::new(self.usd_eur_rate)?)
    }
}

/// Balance notification hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Queued messages per subscriber before updates are dropped.
    pub subscriber_buffer: usize,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Largest inbound message a subscriber may send.
    pub max_message_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 10,
            ping_interval: Duration::from_secs(50),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_message_bytes: 512,
        }
    }
}

/// House capital and default opening balances, in minor units.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub system_capital_usd: i64,
    pub system_capital_eur: i64,
    pub opening_balance_usd: i64,
    pub opening_balance_eur: i64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            system_capital_usd: 1_000_000_000,
            system_capital_eur: 1_000_000_000,
            opening_balance_usd: 100_000,
            opening_balance_eur: 50_000,
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub executor: ExecutorConfig,
    pub quotes: QuoteConfig,
    pub fx: FxConfig,
    pub hub: HubConfig,
    pub bootstrap: BootstrapConfig,
}

fn env_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| LedgerError::Configuration(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }
        if let Some(max) = env_var("DATABASE_MAX_CONNECTIONS")? {
            config.database.max_connections = max;
        }
        if let Some(secs) = env_var("DATABASE_ACQUIRE_TIMEOUT_SECS")? {
            config.database.acquire_timeout = Duration::from_secs(secs);
        }

        if let Some(attempts) = env_var("LEDGER_TX_MAX_ATTEMPTS")? {
            config.executor.max_attempts = attempts;
        }
        if let Some(ms) = env_var("LEDGER_TX_BACKOFF_MS")? {
            config.executor.base_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_var("LEDGER_TX_JITTER_MS")? {
            config.executor.max_jitter = Duration::from_millis(ms);
        }
        if let Some(ms) = env_var::<u64>("LEDGER_REQUEST_TIMEOUT_MS")? {
            config.executor.request_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(secs) = env_var("QUOTE_TTL_SECS")? {
            config.quotes.ttl = Duration::from_secs(secs);
        }

        if let Ok(rate) = std::env::var("FX_USD_EUR_RATE") {
            config.fx.usd_eur_rate = Rate::parse(&rate)
                .map_err(|e| LedgerError::Configuration(format!("FX_USD_EUR_RATE: {e}")))?
                .value();
        }

        if let Some(buffer) = env_var("HUB_SUBSCRIBER_BUFFER")? {
            config.hub.subscriber_buffer = buffer;
        }
        if let Some(secs) = env_var("HUB_PING_INTERVAL_SECS")? {
            config.hub.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_var("HUB_READ_TIMEOUT_SECS")? {
            config.hub.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_var("HUB_WRITE_TIMEOUT_SECS")? {
            config.hub.write_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_var("HUB_MAX_MESSAGE_BYTES")? {
            config.hub.max_message_bytes = bytes;
        }

        if let Some(minor) = env_var("SYSTEM_CAPITAL_USD_MINOR")? {
            config.bootstrap.system_capital_usd = minor;
        }
        if let Some(minor) = env_var("SYSTEM_CAPITAL_EUR_MINOR")? {
            config.bootstrap.system_capital_eur = minor;
        }
        if let Some(minor) = env_var("OPENING_BALANCE_USD_MINOR")? {
            config.bootstrap.opening_balance_usd = minor;
        }
        if let Some(minor) = env_var("OPENING_BALANCE_EUR_MINOR")? {
            config.bootstrap.opening_balance_eur = minor;
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(LedgerError::Configuration(msg.to_string()));

        if self.database.url.is_empty() {
            return invalid("database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            return invalid("database pool needs at least one connection");
        }
        if self.executor.max_attempts == 0 {
            return invalid("executor needs at least one attempt");
        }
        if self.fx.usd_eur().is_err() {
            return invalid("USD/EUR rate must be positive");
        }
        if self.quotes.ttl.is_zero() {
            return invalid("quote TTL must be positive");
        }
        if self.hub.subscriber_buffer == 0 {
            return invalid("subscriber buffer cannot be 0");
        }
        if self.hub.ping_interval >= self.hub.read_timeout {
            return invalid("ping interval must be shorter than the read timeout");
        }
        let bootstrap = &self.bootstrap;
        if [
            bootstrap.system_capital_usd,
            bootstrap.system_capital_eur,
            bootstrap.opening_balance_usd,
            bootstrap.opening_balance_eur,
        ]
        .iter()
        .any(|minor| *minor < 0)
        {
            return invalid("capital and opening balances cannot be negative");
        }

        Ok(())
    }
}
