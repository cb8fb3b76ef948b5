use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, U256};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::observers::NotificationMatch;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub bench: BenchConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcConfig {
    /// JSON-RPC HTTP endpoint (polling and submission). Env BENCH_HTTP_URL.
    #[serde(default)]
    pub http_url: String,
    /// JSON-RPC WebSocket endpoint (subscriptions). Env BENCH_WS_URL.
    #[serde(default)]
    pub ws_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Hex private key - loaded from env BENCH_PRIVATE_KEY
    #[serde(default)]
    pub private_key: String,
    /// Transfer recipient. Defaults to the sender (self-transfer).
    #[serde(default)]
    pub recipient: Option<Address>,
    /// Value of each test transfer in wei.
    #[serde(default = "default_amount_wei")]
    pub amount_wei: U256,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BenchConfig {
    /// Number of trials (one test transfer each).
    #[serde(default = "default_trials")]
    pub trials: u64,
    /// Per-trial budget shared by every strategy.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Polling cadence.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause between trials.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// One nonce-polling strategy per tag, e.g. ["pending", "latest"].
    #[serde(default = "default_nonce_tags", deserialize_with = "deserialize_tags")]
    pub nonce_tags: Vec<BlockNumberOrTag>,
    /// Also poll for the receipt.
    #[serde(default = "default_true")]
    pub receipt_poll: bool,
    /// Strategy pair for the improvement line: [faster, reference].
    #[serde(default = "default_compare")]
    pub compare: Option<[String; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Raw `eth_subscribe` params.
    #[serde(default = "default_subscription_params")]
    pub params: serde_json::Value,
    #[serde(default = "default_matcher")]
    pub matcher: NotificationMatch,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportConfig {
    /// Write the run and its summary as JSON here.
    #[serde(default)]
    pub json_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_amount_wei() -> U256 {
    U256::from(1u64)
}
fn default_trials() -> u64 {
    2
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_cooldown_ms() -> u64 {
    2_000
}
fn default_nonce_tags() -> Vec<BlockNumberOrTag> {
    vec![BlockNumberOrTag::Pending, BlockNumberOrTag::Latest]
}
fn default_true() -> bool {
    true
}
fn default_compare() -> Option<[String; 2]> {
    Some(["nonce-pending".to_string(), "nonce-latest".to_string()])
}
fn default_subscription_params() -> serde_json::Value {
    serde_json::json!(["newPendingTransactions"])
}
fn default_matcher() -> NotificationMatch {
    NotificationMatch::TxHash
}
fn default_ack_timeout_ms() -> u64 {
    5_000
}
fn default_ping_interval_secs() -> u64 {
    20
}
fn default_log_level() -> String {
    "info".to_string()
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<BlockNumberOrTag>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<String> = Vec::deserialize(deserializer)?;
    raw.iter()
        .map(|tag| BlockNumberOrTag::from_str(tag).map_err(serde::de::Error::custom))
        .collect()
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key: String::new(),
            recipient: None,
            amount_wei: default_amount_wei(),
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            trials: default_trials(),
            timeout_ms: default_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            cooldown_ms: default_cooldown_ms(),
            nonce_tags: default_nonce_tags(),
            receipt_poll: true,
            compare: default_compare(),
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            params: default_subscription_params(),
            matcher: default_matcher(),
            ack_timeout_ms: default_ack_timeout_ms(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for
    /// endpoints and the key.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Defaults plus environment; no file needed.
    pub fn from_env() -> Self {
        let mut config = Config {
            rpc: RpcConfig::default(),
            wallet: WalletConfig::default(),
            bench: BenchConfig::default(),
            subscription: SubscriptionConfig::default(),
            report: ReportConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        // Never store the key in the config file.
        if let Ok(key) = std::env::var("BENCH_PRIVATE_KEY") {
            self.wallet.private_key = key;
        }
        if let Ok(url) = std::env::var("BENCH_HTTP_URL") {
            self.rpc.http_url = url;
        }
        if let Ok(url) = std::env::var("BENCH_WS_URL") {
            self.rpc.ws_url = url;
        }
    }

    /// Check everything the run needs before any network activity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc.http_url.is_empty() {
            return Err(ConfigError::MissingEnv("BENCH_HTTP_URL".into()));
        }
        if self.wallet.private_key.is_empty() {
            return Err(ConfigError::MissingEnv("BENCH_PRIVATE_KEY".into()));
        }
        if self.subscription.enabled && self.rpc.ws_url.is_empty() {
            return Err(ConfigError::MissingEnv("BENCH_WS_URL".into()));
        }
        if self.bench.trials == 0 {
            return Err(ConfigError::Invalid("bench.trials must be at least 1".into()));
        }
        if self.bench.timeout_ms == 0 {
            return Err(ConfigError::Invalid("bench.timeout_ms must be positive".into()));
        }
        if self.bench.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("bench.poll_interval_ms must be positive".into()));
        }
        if self.bench.nonce_tags.is_empty() && !self.bench.receipt_poll && !self.subscription.enabled {
            return Err(ConfigError::Invalid("no observation strategy enabled".into()));
        }
        Ok(())
    }

    pub fn compare_pair(&self) -> Option<(&str, &str)> {
        self.bench
            .compare
            .as_ref()
            .map(|[a, b]| (a.as_str(), b.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.bench.trials, 2);
        assert_eq!(config.bench.timeout_ms, 30_000);
        assert_eq!(config.bench.poll_interval_ms, 100);
        assert_eq!(
            config.bench.nonce_tags,
            vec![BlockNumberOrTag::Pending, BlockNumberOrTag::Latest]
        );
        assert_eq!(config.compare_pair(), Some(("nonce-pending", "nonce-latest")));
        assert_eq!(config.subscription.matcher, NotificationMatch::TxHash);
        assert_eq!(config.subscription.params, serde_json::json!(["newPendingTransactions"]));
        assert_eq!(config.wallet.amount_wei, U256::from(1u64));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parses_full_file() {
        let config = Config::parse(
            r#"
            [rpc]
            http_url = "https://rpc.example"
            ws_url = "wss://rpc.example/ws"

            [wallet]
            recipient = "0x000000000000000000000000000000000000dEaD"
            amount_wei = "0x64"

            [bench]
            trials = 5
            timeout_ms = 20000
            nonce_tags = ["latest", "safe"]
            receipt_poll = false
            compare = ["push", "nonce-latest"]

            [subscription]
            params = ["newHeads"]
            matcher = "any"
            ack_timeout_ms = 1000

            [report]
            json_path = "run.json"

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(config.rpc.ws_url, "wss://rpc.example/ws");
        assert_eq!(
            config.wallet.recipient,
            Some("0x000000000000000000000000000000000000dEaD".parse().unwrap())
        );
        assert_eq!(config.wallet.amount_wei, U256::from(100u64));
        assert_eq!(config.bench.trials, 5);
        assert_eq!(
            config.bench.nonce_tags,
            vec![BlockNumberOrTag::Latest, BlockNumberOrTag::Safe]
        );
        assert!(!config.bench.receipt_poll);
        assert_eq!(config.compare_pair(), Some(("push", "nonce-latest")));
        assert_eq!(config.subscription.params, serde_json::json!(["newHeads"]));
        assert_eq!(config.subscription.matcher, NotificationMatch::Any);
        assert_eq!(config.report.json_path.as_deref(), Some("run.json"));
        assert!(config.logging.json);
    }

    #[test]
    fn test_rejects_unknown_tag() {
        let err = Config::parse("[bench]\nnonce_tags = [\"mempool\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate() {
        let mut config = Config::parse(
            r#"
            [rpc]
            http_url = "http://localhost:8545"
            ws_url = "ws://localhost:8546"
            [wallet]
            private_key = "0x01"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());

        config.bench.timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.bench.timeout_ms = 1000;
        config.rpc.ws_url.clear();
        assert!(matches!(config.validate(), Err(ConfigError::MissingEnv(v)) if v == "BENCH_WS_URL"));

        config.subscription.enabled = false;
        assert!(config.validate().is_ok());
    }
}
