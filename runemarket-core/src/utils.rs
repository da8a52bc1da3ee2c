//! # Utility Functions
//!
//! Common utility functions for Bitcoin operations and data conversion.

use crate::{error::Result, ValidationError};
use bitcoin::{Address, Network, OutPoint, Script};
use sha2::{Digest, Sha256};
use std::str::FromStr;

/// Hash a message using SHA256
pub fn sha256_hash(message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.as_bytes());
    let hash = hasher.finalize();
    hex::encode(hash)
}

/// Location-derived offer id: sha256 of `txid:vout`.
///
/// Stable across re-listing of the same location, so offers can be upserted
/// by location.
pub fn location_id(location: &OutPoint) -> String {
    sha256_hash(&location.to_string())
}

/// Parse an address and require it to belong to `network`
pub fn parse_address(address: &str, network: Network) -> Result<Address> {
    let unchecked = Address::from_str(address)?;
    unchecked.require_network(network).map_err(|_| {
        ValidationError::BadRequest(format!("address {address} is not valid for {network}"))
            .into()
    })
}

/// Validate a Bitcoin address for the specified network
pub fn validate_address(address: &str, network: Network) -> bool {
    Address::from_str(address)
        .map(|addr| addr.is_valid_for_network(network))
        .unwrap_or(false)
}

/// Address paying to `script`, if it is a standard address script
pub fn address_from_script(script: &Script, network: Network) -> Result<Address> {
    Address::from_script(script, network).map_err(|e| {
        ValidationError::BadRequest(format!("script {} has no address: {e}", script.to_hex_string()))
            .into()
    })
}

/// Convert satoshis to Bitcoin
pub fn satoshi_to_btc(satoshi: u64) -> f64 {
    satoshi as f64 / 100_000_000.0
}

/// Convert Bitcoin to satoshis
pub fn btc_to_satoshi(btc: f64) -> u64 {
    (btc * 100_000_000.0).round() as u64
}

/// Whole token units held by a raw balance (`raw / 10^divisibility`).
pub fn whole_units(raw: u128, divisibility: u8) -> u128 {
    match 10u128.checked_pow(divisibility.into()) {
        Some(scale) => raw / scale,
        None => 0,
    }
}

/// Raw balance of `amount` whole token units.
pub fn base_units(amount: u128, divisibility: u8) -> Option<u128> {
    10u128
        .checked_pow(divisibility.into())
        .and_then(|scale| amount.checked_mul(scale))
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
