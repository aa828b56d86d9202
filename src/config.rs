// =============================================================================
// ROMER - Configuration
// =============================================================================
//
// Network selection and node tunables. `NodeConfig` has sane defaults for
// every field, so a JSON file only needs to name what it changes:
//
//   { "network": "Regtest", "alias": "carol", "max_payment_attempts": 5 }
//
// The network can also be chosen from an API token, whose first character
// names it (R/T/S/M).
//
// =============================================================================

use serde::{Serialize, Deserialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::channels::{ChannelConfig, MAX_CLTV_EXPIRY_DELTA, MIN_FINAL_CLTV_EXPIRY_DELTA};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::payment::DEFAULT_MAX_PAYMENT_ATTEMPTS;
use crate::routing::{
    FeePolicy, RouteParams, DEFAULT_MAX_CANDIDATES, DEFAULT_MAX_HOPS, DEFAULT_RISK_FACTOR,
};

/// Seconds an invoice stays payable
pub const DEFAULT_INVOICE_EXPIRY_SECS: u64 = 3600;

/// Wait for the first hop to acknowledge an HTLC
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;

/// Wait for a dispatched HTLC to be fulfilled or failed
pub const DEFAULT_PAYMENT_TIMEOUT_MS: u64 = 30_000;

// =============================================================================
// Network
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Bitcoin,
    Testnet,
    Signet,
    #[default]
    Regtest,
}

impl Network {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bitcoin" | "mainnet" | "main" => Some(Network::Bitcoin),
            "testnet" | "test" => Some(Network::Testnet),
            "signet" => Some(Network::Signet),
            "regtest" | "reg" => Some(Network::Regtest),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Network::Bitcoin => "bitcoin",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }

    /// Human-readable prefix of payment requests
    pub fn invoice_prefix(&self) -> &'static str {
        match self {
            Network::Bitcoin => "lnbc",
            Network::Testnet => "lntb",
            Network::Signet => "lntbs",
            Network::Regtest => "lnbcrt",
        }
    }

    pub fn from_invoice_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "lnbc" => Some(Network::Bitcoin),
            "lntb" => Some(Network::Testnet),
            "lntbs" => Some(Network::Signet),
            "lnbcrt" => Some(Network::Regtest),
            _ => None,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Network named by the first character of an API token
pub fn network_from_token(token: &str) -> Result<Network, ConfigError> {
    match token.chars().next() {
        Some('R') => Ok(Network::Regtest),
        Some('T') => Ok(Network::Testnet),
        Some('S') => Ok(Network::Signet),
        Some('M') => Ok(Network::Bitcoin),
        _ => Err(ConfigError::InvalidToken),
    }
}

// =============================================================================
// Config Error
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Token empty or with an unknown network prefix
    InvalidToken,
    Io(String),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidToken => write!(f, "Invalid API token"),
            ConfigError::Io(s) => write!(f, "Config I/O error: {}", s),
            ConfigError::Parse(s) => write!(f, "Config parse error: {}", s),
            ConfigError::Invalid(s) => write!(f, "Invalid config: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

// =============================================================================
// Node Config
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    pub alias: String,
    /// Database directory; in-memory store when unset
    pub data_dir: Option<PathBuf>,

    /// Parameters proposed for channels we open
    pub channel: ChannelConfig,
    /// Fees charged for forwarding over our channels
    pub forwarding_fee: FeePolicy,

    pub max_payment_attempts: usize,
    pub max_route_hops: usize,
    pub max_route_candidates: usize,
    pub risk_factor: u64,
    pub final_cltv_delta: u32,
    pub max_total_cltv: u32,

    pub ack_timeout_ms: u64,
    pub payment_timeout_ms: u64,
    pub invoice_expiry_secs: u64,

    /// Broadcast buffer of the event bus
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            network: Network::default(),
            alias: "romer".to_string(),
            data_dir: None,
            channel: ChannelConfig::default(),
            forwarding_fee: FeePolicy::default(),
            max_payment_attempts: DEFAULT_MAX_PAYMENT_ATTEMPTS,
            max_route_hops: DEFAULT_MAX_HOPS,
            max_route_candidates: DEFAULT_MAX_CANDIDATES,
            risk_factor: DEFAULT_RISK_FACTOR,
            final_cltv_delta: MIN_FINAL_CLTV_EXPIRY_DELTA,
            max_total_cltv: MAX_CLTV_EXPIRY_DELTA,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            payment_timeout_ms: DEFAULT_PAYMENT_TIMEOUT_MS,
            invoice_expiry_secs: DEFAULT_INVOICE_EXPIRY_SECS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl NodeConfig {
    /// Defaults for the network named by an API token
    pub fn from_token(token: &str) -> Result<Self, ConfigError> {
        Ok(NodeConfig {
            network: network_from_token(token)?,
            ..NodeConfig::default()
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payment_attempts == 0 {
            return Err(ConfigError::Invalid("max_payment_attempts must be at least 1".into()));
        }
        if self.max_route_hops == 0 {
            return Err(ConfigError::Invalid("max_route_hops must be at least 1".into()));
        }
        if self.final_cltv_delta >= self.max_total_cltv {
            return Err(ConfigError::Invalid("final_cltv_delta exceeds max_total_cltv".into()));
        }
        if self.forwarding_fee.cltv_expiry_delta == 0
            || self.forwarding_fee.cltv_expiry_delta > MAX_CLTV_EXPIRY_DELTA
        {
            return Err(ConfigError::Invalid(format!(
                "forwarding cltv delta must be 1..={}",
                MAX_CLTV_EXPIRY_DELTA
            )));
        }
        if self.ack_timeout_ms == 0 || self.payment_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Route search parameters at a given chain height
    pub fn route_params(&self, current_height: u32) -> RouteParams {
        RouteParams {
            max_hops: self.max_route_hops,
            risk_factor: self.risk_factor,
            final_cltv_delta: self.final_cltv_delta,
            max_total_cltv: self.max_total_cltv,
            current_height,
            max_candidates: self.max_route_candidates,
        }
    }

    pub fn ack_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn payment_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.payment_timeout_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_from_token() {
        assert_eq!(network_from_token(""), Err(ConfigError::InvalidToken));
        assert_eq!(network_from_token("Rsometoken"), Ok(Network::Regtest));
        assert_eq!(network_from_token("Tsometoken"), Ok(Network::Testnet));
        assert_eq!(network_from_token("Ssometoken"), Ok(Network::Signet));
        assert_eq!(network_from_token("Msometoken"), Ok(Network::Bitcoin));
        assert_eq!(network_from_token("Gsometoken"), Err(ConfigError::InvalidToken));
    }

    #[test]
    fn test_invoice_prefixes() {
        for network in [Network::Bitcoin, Network::Testnet, Network::Signet, Network::Regtest] {
            assert_eq!(Network::from_invoice_prefix(network.invoice_prefix()), Some(network));
        }
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{ "network": "Testnet", "max_payment_attempts": 3 }"#).unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.max_payment_attempts, 3);
        assert_eq!(config.invoice_expiry_secs, DEFAULT_INVOICE_EXPIRY_SECS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let config = NodeConfig { max_payment_attempts: 0, ..NodeConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("romer-config-{}.json", rand::random::<u64>()));
        let config = NodeConfig { alias: "dave".into(), ..NodeConfig::from_token("Sabc").unwrap() };
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = fs::remove_file(&path);
    }
}
