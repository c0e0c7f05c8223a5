//! Application configuration loaded from environment variables.

use std::fmt;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;

/// Application configuration loaded from environment variables.
#[derive(Clone, Deserialize)]
pub struct Config {
    // === Polymarket Credentials ===
    /// Wallet private key (hex, starts with 0x).
    pub polymarket_private_key: String,

    /// Optional pre-generated CLOB API key.
    #[serde(default)]
    pub polymarket_api_key: Option<String>,

    /// Optional CLOB API secret.
    #[serde(default)]
    pub polymarket_api_secret: Option<String>,

    /// Optional CLOB API passphrase.
    #[serde(default)]
    pub polymarket_api_passphrase: Option<String>,

    // === Wallet Configuration ===
    /// Signature type: 0=EOA, 1=Magic.link, 2=Gnosis Safe.
    #[serde(default = "default_signature_type")]
    pub polymarket_signature_type: u8,

    /// Proxy wallet / Safe address holding the positions.
    #[serde(default)]
    pub polymarket_funder: Option<String>,

    /// CLOB API base URL.
    #[serde(default = "default_clob_url")]
    pub polymarket_clob_url: String,

    /// Sign orders for the neg-risk exchange contract.
    #[serde(default)]
    pub polymarket_neg_risk: bool,

    // === Relayer ===
    /// Comma-separated relay endpoints, tried in order.
    #[serde(default = "default_relay_endpoints")]
    pub relay_endpoints: String,

    /// Builder API key for relayer authentication.
    #[serde(default)]
    pub poly_builder_api_key: Option<String>,

    /// Builder API secret (base64).
    #[serde(default)]
    pub poly_builder_secret: Option<String>,

    /// Builder API passphrase.
    #[serde(default)]
    pub poly_builder_passphrase: Option<String>,

    /// Relay connect timeout in milliseconds (capped at 5000).
    #[serde(default = "default_relay_connect_timeout_ms")]
    pub relay_connect_timeout_ms: u64,

    /// Relay overall request timeout in milliseconds.
    #[serde(default = "default_relay_request_timeout_ms")]
    pub relay_request_timeout_ms: u64,

    // === Chain ===
    /// Comma-separated Polygon RPC URLs, tried in order.
    #[serde(default = "default_rpc_urls")]
    pub rpc_urls: String,

    /// Chain ID (137 for Polygon).
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// Conditional tokens contract.
    #[serde(default = "default_ctf_address")]
    pub ctf_address: String,

    /// Collateral token (USDC.e).
    #[serde(default = "default_collateral_address")]
    pub collateral_address: String,

    /// Minimum native balance (MATIC) before the direct-chain tier is tried.
    #[serde(default = "default_min_gas_balance")]
    pub min_gas_balance: Decimal,

    /// Gas limit for direct redemption transactions.
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,

    /// Overall confirmation budget for a direct broadcast, in seconds.
    #[serde(default = "default_chain_confirm_timeout_s")]
    pub chain_confirm_timeout_s: u64,

    /// Receipt poll interval in milliseconds.
    #[serde(default = "default_chain_poll_interval_ms")]
    pub chain_poll_interval_ms: u64,

    // === Orders ===
    /// Minimum order size (lot).
    #[serde(default = "default_min_order_size")]
    pub min_order_size: Decimal,

    /// Maximum notional (price * size) per order, in USDC.
    #[serde(default = "default_max_order_notional")]
    pub max_order_notional: Decimal,

    /// Daily realized loss that stops new orders, in USDC.
    #[serde(default = "default_daily_max_loss")]
    pub daily_max_loss: Decimal,

    /// Order status poll interval in milliseconds.
    #[serde(default = "default_order_poll_interval_ms")]
    pub order_poll_interval_ms: u64,

    /// Order tracking budget in seconds before status becomes UNKNOWN.
    #[serde(default = "default_order_track_timeout_s")]
    pub order_track_timeout_s: u64,

    /// HTTP timeout for exchange calls in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    // === Engine ===
    /// Control cycle cadence in milliseconds.
    #[serde(default = "default_control_interval_ms")]
    pub control_interval_ms: u64,

    /// Directory for the attempt log and status snapshot.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Base URL for manual-action links.
    #[serde(default = "default_market_url_base")]
    pub market_url_base: String,

    // === Notifications ===
    /// Telegram bot token.
    #[serde(default)]
    pub telegram_bot_token: Option<String>,

    /// Telegram chat id.
    #[serde(default)]
    pub telegram_chat_id: Option<String>,

    /// Prefix prepended to every alert.
    #[serde(default = "default_notify_prefix")]
    pub notify_prefix: String,

    // === Server Configuration ===
    /// HTTP server port for health/metrics endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub rust_log: String,

    /// Log output format: "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Enable verbose logging.
    #[serde(default)]
    pub verbose: bool,
}

fn default_signature_type() -> u8 {
    2
}

fn default_clob_url() -> String {
    "https://clob.polymarket.com".to_string()
}

fn default_relay_endpoints() -> String {
    "https://relayer-v2.polymarket.com/submit".to_string()
}

fn default_relay_connect_timeout_ms() -> u64 {
    5000
}

fn default_relay_request_timeout_ms() -> u64 {
    15_000
}

fn default_rpc_urls() -> String {
    "https://polygon-rpc.com,https://rpc.ankr.com/polygon,https://polygon.llamarpc.com".to_string()
}

fn default_chain_id() -> u64 {
    137
}

fn default_ctf_address() -> String {
    "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045".to_string()
}

fn default_collateral_address() -> String {
    "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174".to_string()
}

fn default_min_gas_balance() -> Decimal {
    Decimal::new(1, 2) // 0.01 MATIC
}

fn default_gas_limit() -> u64 {
    300_000
}

fn default_chain_confirm_timeout_s() -> u64 {
    120
}

fn default_chain_poll_interval_ms() -> u64 {
    2000
}

fn default_min_order_size() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn default_max_order_notional() -> Decimal {
    Decimal::new(100, 0)
}

fn default_daily_max_loss() -> Decimal {
    Decimal::new(50, 0)
}

fn default_order_poll_interval_ms() -> u64 {
    5000
}

fn default_order_track_timeout_s() -> u64 {
    300
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_control_interval_ms() -> u64 {
    5000
}

fn default_state_dir() -> String {
    "./state".to_string()
}

fn default_market_url_base() -> String {
    "https://polymarket.com/market".to_string()
}

fn default_notify_prefix() -> String {
    "[redeemer]".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Mask a secret for display, keeping a short prefix.
pub fn redact(secret: &str) -> String {
    if secret.chars().count() <= 6 {
        return "***".to_string();
    }
    let visible: String = secret.chars().take(6).collect();
    format!("{}***", visible)
}

fn redact_opt(secret: &Option<String>) -> Option<String> {
    secret.as_deref().map(redact)
}

fn parse_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl Config {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::from_env()?)
    }

    /// Check if the configuration is valid.
    pub fn validate(&self) -> Result<(), String> {
        if self.polymarket_private_key.is_empty() {
            return Err("POLYMARKET_PRIVATE_KEY is required".to_string());
        }

        if !self.polymarket_private_key.starts_with("0x") {
            return Err("POLYMARKET_PRIVATE_KEY must start with 0x".to_string());
        }

        if self.is_safe_wallet() && self.polymarket_funder.is_none() {
            return Err("POLYMARKET_FUNDER (Safe address) is required for signature type 2".to_string());
        }

        if let Some(funder) = &self.polymarket_funder {
            funder
                .parse::<Address>()
                .map_err(|e| format!("POLYMARKET_FUNDER is not an address: {}", e))?;
        }

        self.relay_urls().map_err(|e| e.to_string())?;

        if self.rpc_url_list().map_err(|e| e.to_string())?.is_empty() {
            return Err("RPC_URLS must contain at least one URL".to_string());
        }

        self.ctf().map_err(|e| e.to_string())?;
        self.collateral().map_err(|e| e.to_string())?;

        if self.relay_connect_timeout_ms == 0 || self.relay_connect_timeout_ms > 5000 {
            return Err("RELAY_CONNECT_TIMEOUT_MS must be within 1..=5000".to_string());
        }

        if self.relay_request_timeout_ms < self.relay_connect_timeout_ms {
            return Err("RELAY_REQUEST_TIMEOUT_MS must not be shorter than the connect timeout".to_string());
        }

        if self.chain_confirm_timeout_s == 0 {
            return Err("CHAIN_CONFIRM_TIMEOUT_S must be positive".to_string());
        }

        if self.min_order_size <= Decimal::ZERO {
            return Err("MIN_ORDER_SIZE must be positive".to_string());
        }

        if self.min_gas_balance < Decimal::ZERO {
            return Err("MIN_GAS_BALANCE must not be negative".to_string());
        }

        let builder = [
            &self.poly_builder_api_key,
            &self.poly_builder_secret,
            &self.poly_builder_passphrase,
        ];
        let set = builder.iter().filter(|v| v.is_some()).count();
        if set != 0 && set != builder.len() {
            return Err("POLY_BUILDER_API_KEY, POLY_BUILDER_SECRET and POLY_BUILDER_PASSPHRASE must be set together".to_string());
        }

        Ok(())
    }

    /// Check if positions are held by a Gnosis Safe (signature_type == 2).
    pub fn is_safe_wallet(&self) -> bool {
        self.polymarket_signature_type == 2
    }

    /// Parsed relay endpoints in configured order.
    pub fn relay_urls(&self) -> Result<Vec<Url>, ConfigError> {
        parse_list(&self.relay_endpoints)
            .map(|raw| {
                Url::parse(raw)
                    .map_err(|e| ConfigError::Invalid(format!("relay endpoint {}: {}", raw, e)))
            })
            .collect()
    }

    /// Parsed RPC URLs in configured order.
    pub fn rpc_url_list(&self) -> Result<Vec<Url>, ConfigError> {
        parse_list(&self.rpc_urls)
            .map(|raw| {
                Url::parse(raw).map_err(|e| ConfigError::Invalid(format!("rpc url {}: {}", raw, e)))
            })
            .collect()
    }

    /// Safe address holding the positions, when configured.
    pub fn safe_address(&self) -> Result<Option<Address>, ConfigError> {
        match (&self.polymarket_funder, self.is_safe_wallet()) {
            (Some(funder), true) => funder
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::Invalid(format!("POLYMARKET_FUNDER: {}", e))),
            _ => Ok(None),
        }
    }

    /// Conditional tokens contract address.
    pub fn ctf(&self) -> Result<Address, ConfigError> {
        self.ctf_address
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("CTF_ADDRESS: {}", e)))
    }

    /// Collateral token address.
    pub fn collateral(&self) -> Result<Address, ConfigError> {
        self.collateral_address
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("COLLATERAL_ADDRESS: {}", e)))
    }

    /// Gas balance threshold in wei.
    pub fn min_gas_balance_wei(&self) -> U256 {
        let wei = (self.min_gas_balance * Decimal::new(1_000_000_000_000_000_000, 0)).trunc();
        wei.to_u128().map(U256::from).unwrap_or(U256::ZERO)
    }

    /// Builder credentials, when all three are set.
    pub fn builder_credentials(&self) -> Option<crate::signing::ApiCredentials> {
        Some(crate::signing::ApiCredentials {
            key: self.poly_builder_api_key.clone()?,
            secret: self.poly_builder_secret.clone()?,
            passphrase: self.poly_builder_passphrase.clone()?,
        })
    }

    /// CLOB L2 credentials, when all three are set.
    pub fn clob_credentials(&self) -> Option<crate::signing::ApiCredentials> {
        Some(crate::signing::ApiCredentials {
            key: self.polymarket_api_key.clone()?,
            secret: self.polymarket_api_secret.clone()?,
            passphrase: self.polymarket_api_passphrase.clone()?,
        })
    }

    /// Relay connect timeout.
    pub fn relay_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_connect_timeout_ms.min(5000))
    }

    /// Relay overall request timeout.
    pub fn relay_request_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_request_timeout_ms)
    }

    /// Direct broadcast confirmation budget.
    pub fn chain_confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.chain_confirm_timeout_s)
    }

    /// Receipt poll interval.
    pub fn chain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.chain_poll_interval_ms)
    }

    /// Order status poll interval.
    pub fn order_poll_interval(&self) -> Duration {
        Duration::from_millis(self.order_poll_interval_ms)
    }

    /// Order tracking budget.
    pub fn order_track_timeout(&self) -> Duration {
        Duration::from_secs(self.order_track_timeout_s)
    }

    /// Control cycle cadence.
    pub fn control_interval(&self) -> Duration {
        Duration::from_millis(self.control_interval_ms)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("polymarket_private_key", &"***")
            .field("polymarket_api_key", &redact_opt(&self.polymarket_api_key))
            .field("polymarket_api_secret", &self.polymarket_api_secret.as_ref().map(|_| "***"))
            .field("polymarket_api_passphrase", &self.polymarket_api_passphrase.as_ref().map(|_| "***"))
            .field("polymarket_signature_type", &self.polymarket_signature_type)
            .field("polymarket_funder", &self.polymarket_funder)
            .field("polymarket_clob_url", &self.polymarket_clob_url)
            .field("polymarket_neg_risk", &self.polymarket_neg_risk)
            .field("relay_endpoints", &self.relay_endpoints)
            .field("poly_builder_api_key", &redact_opt(&self.poly_builder_api_key))
            .field("poly_builder_secret", &self.poly_builder_secret.as_ref().map(|_| "***"))
            .field("poly_builder_passphrase", &self.poly_builder_passphrase.as_ref().map(|_| "***"))
            .field("rpc_urls", &self.rpc_urls)
            .field("chain_id", &self.chain_id)
            .field("ctf_address", &self.ctf_address)
            .field("collateral_address", &self.collateral_address)
            .field("min_gas_balance", &self.min_gas_balance)
            .field("chain_confirm_timeout_s", &self.chain_confirm_timeout_s)
            .field("min_order_size", &self.min_order_size)
            .field("daily_max_loss", &self.daily_max_loss)
            .field("state_dir", &self.state_dir)
            .field("telegram_bot_token", &redact_opt(&self.telegram_bot_token))
            .field("telegram_chat_id", &self.telegram_chat_id)
            .field("port", &self.port)
            .field("rust_log", &self.rust_log)
            .field("log_format", &self.log_format)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        polymarket_private_key:
            "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef".to_string(),
        polymarket_api_key: None,
        polymarket_api_secret: None,
        polymarket_api_passphrase: None,
        polymarket_signature_type: 2,
        polymarket_funder: Some("0x00000000000000000000000000000000000000aa".to_string()),
        polymarket_clob_url: default_clob_url(),
        polymarket_neg_risk: false,
        relay_endpoints: "https://relay-a.test/submit, https://relay-b.test/submit".to_string(),
        poly_builder_api_key: None,
        poly_builder_secret: None,
        poly_builder_passphrase: None,
        relay_connect_timeout_ms: default_relay_connect_timeout_ms(),
        relay_request_timeout_ms: default_relay_request_timeout_ms(),
        rpc_urls: default_rpc_urls(),
        chain_id: default_chain_id(),
        ctf_address: default_ctf_address(),
        collateral_address: default_collateral_address(),
        min_gas_balance: default_min_gas_balance(),
        gas_limit: default_gas_limit(),
        chain_confirm_timeout_s: default_chain_confirm_timeout_s(),
        chain_poll_interval_ms: default_chain_poll_interval_ms(),
        min_order_size: default_min_order_size(),
        max_order_notional: default_max_order_notional(),
        daily_max_loss: default_daily_max_loss(),
        order_poll_interval_ms: default_order_poll_interval_ms(),
        order_track_timeout_s: default_order_track_timeout_s(),
        http_timeout_ms: default_http_timeout_ms(),
        control_interval_ms: default_control_interval_ms(),
        state_dir: default_state_dir(),
        market_url_base: default_market_url_base(),
        telegram_bot_token: None,
        telegram_chat_id: None,
        notify_prefix: default_notify_prefix(),
        port: default_port(),
        rust_log: default_log_level(),
        log_format: default_log_format(),
        verbose: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_values_are_sensible() {
        assert_eq!(default_min_order_size(), dec!(0.0001));
        assert_eq!(default_min_gas_balance(), dec!(0.01));
        assert_eq!(default_relay_connect_timeout_ms(), 5000);
        assert_eq!(default_signature_type(), 2);
    }

    #[test]
    fn test_config_is_valid() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_private_key() {
        let config = Config {
            polymarket_private_key: "".to_string(),
            ..test_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_invalid_private_key_prefix() {
        let config = Config {
            polymarket_private_key: "abc123".to_string(),
            ..test_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_safe_address_for_safe_wallet() {
        let config = Config {
            polymarket_funder: None,
            ..test_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_slow_connect_timeout() {
        let config = Config {
            relay_connect_timeout_ms: 10_000,
            ..test_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_partial_builder_credentials() {
        let config = Config {
            poly_builder_api_key: Some("key".to_string()),
            ..test_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn relay_urls_keep_configured_order() {
        let urls = test_config().relay_urls().unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].host_str(), Some("relay-a.test"));
        assert_eq!(urls[1].host_str(), Some("relay-b.test"));
    }

    #[test]
    fn min_gas_balance_converts_to_wei() {
        let config = test_config();
        assert_eq!(
            config.min_gas_balance_wei(),
            U256::from(10_000_000_000_000_000u64)
        );
    }

    #[test]
    fn debug_output_hides_private_key() {
        let config = Config {
            telegram_bot_token: Some("123456:ABCDEFGHIJ".to_string()),
            ..test_config()
        };
        let printed = format!("{:?}", config);
        assert!(!printed.contains("0123456789abcdef"));
        assert!(!printed.contains("ABCDEFGHIJ"));
    }
}
