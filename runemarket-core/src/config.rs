//! Marketplace configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! mainnet configuration with the standard padding and sweep settings.

use std::path::Path;
use std::time::Duration;

use bitcoin::{Amount, Network};
use serde::{Deserialize, Serialize};

use crate::{error::Result, fee::FeeRate, DUST_LIMIT, PADDING_UNIT_VALUE};

/// Smallest and largest allowed sweep revalidation batch.
pub const SWEEP_BATCH_RANGE: std::ops::RangeInclusive<usize> = 3..=5;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketConfig {
    /// Bitcoin network addresses are checked against
    #[serde(default = "default_network")]
    pub network: Network,

    /// Fee rate used when the caller does not give one
    #[serde(default = "default_fee_rate")]
    pub fee_rate: FeeRate,

    /// Minimum value of any created output, in sats
    #[serde(default = "default_dust_limit")]
    pub dust_limit: u64,

    #[serde(default)]
    pub padding: PaddingConfig,

    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Padding outputs for inscription purchases
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaddingConfig {
    /// Value of each padding output created by a split
    #[serde(default = "default_padding_unit")]
    pub unit_value: u64,

    /// UTXOs at or below this value are reused as padding
    #[serde(default = "default_reuse_threshold")]
    pub reuse_threshold: u64,

    /// Most outputs a split transaction may create
    #[serde(default = "default_max_split_outputs")]
    pub max_outputs: usize,

    /// Padding inputs needed by a purchase
    #[serde(default = "default_padding_count")]
    pub count: usize,
}

/// Sweep revalidation pacing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepConfig {
    /// Concurrent balance lookups per batch, clamped to 3..=5
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay before each batch in milliseconds
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

fn default_network() -> Network {
    Network::Bitcoin
}

fn default_fee_rate() -> FeeRate {
    FeeRate::MIN_RELAY
}

fn default_dust_limit() -> u64 {
    DUST_LIMIT
}

fn default_padding_unit() -> u64 {
    PADDING_UNIT_VALUE
}

fn default_reuse_threshold() -> u64 {
    1000
}

fn default_max_split_outputs() -> usize {
    11
}

fn default_padding_count() -> usize {
    2
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_delay_ms() -> u64 {
    500
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            fee_rate: default_fee_rate(),
            dust_limit: default_dust_limit(),
            padding: PaddingConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            unit_value: default_padding_unit(),
            reuse_threshold: default_reuse_threshold(),
            max_outputs: default_max_split_outputs(),
            count: default_padding_count(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

impl SweepConfig {
    /// Batch size within the allowed range.
    pub fn batch_size(&self) -> usize {
        self.batch_size
            .clamp(*SWEEP_BATCH_RANGE.start(), *SWEEP_BATCH_RANGE.end())
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

impl MarketConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn dust_limit(&self) -> Amount {
        Amount::from_sat(self.dust_limit)
    }

    /// Default configuration for `network`
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }
}
