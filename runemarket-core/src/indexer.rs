//! External collaborators: the rune indexer, the wallet signer and the
//! transaction broadcaster.
//!
//! The core never caches what these return; every call is a point-in-time
//! snapshot. Implementations report transport failures as
//! [`MarketError::ExternalService`](crate::MarketError::ExternalService), and
//! a broadcaster reports a node rejection as
//! [`MarketError::BroadcastRejected`](crate::MarketError::BroadcastRejected).

use async_trait::async_trait;
use bitcoin::{psbt::PsbtSighashType, Address, OutPoint, Txid};
use serde::{Deserialize, Serialize};

use crate::{error::Result, rune_id::RuneId, utxo::Utxo};

/// Rune balance held by one output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RuneBalance {
    pub rune_id: RuneId,
    /// Raw amount in base units
    pub amount: u128,
    pub divisibility: u8,
}

/// Output holding a rune balance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TokenUtxo {
    pub utxo: Utxo,
    pub balance: RuneBalance,
}

/// Etching data of a rune.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RuneInfo {
    pub rune_id: RuneId,
    pub name: String,
    pub spaced_name: String,
    pub symbol: Option<char>,
    pub divisibility: u8,
}

/// UTXO and balance feed.
#[async_trait]
pub trait RuneIndexer: Send + Sync {
    /// Spendable outputs of `address`, excluding rune and inscription holders.
    async fn list_utxos(&self, address: &Address) -> Result<Vec<Utxo>>;

    /// Outputs of `address` holding `rune_id`.
    async fn list_token_utxos(&self, address: &Address, rune_id: RuneId)
        -> Result<Vec<TokenUtxo>>;

    /// Every rune balance held by `location`; empty once it is spent.
    async fn utxo_balance(&self, location: OutPoint) -> Result<Vec<RuneBalance>>;

    async fn rune_info(&self, rune_id: RuneId) -> Result<Option<RuneInfo>>;

    /// Current location of an inscription, `None` if unknown.
    async fn inscription_location(&self, inscription_id: &str) -> Result<Option<OutPoint>>;
}

/// How the external wallet should sign a PSBT.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SignOptions {
    /// Sighash to sign with; `None` means the default full commitment
    pub sighash: Option<PsbtSighashType>,
    /// Inputs to sign
    pub input_indexes: Vec<usize>,
    /// Whether the signer finalizes the signed inputs
    pub finalize: bool,
}

/// External wallet holding the keys.
#[async_trait]
pub trait PsbtSigner: Send + Sync {
    /// Sign `psbt_hex` and return the signed PSBT as hex.
    async fn sign_psbt(&self, psbt_hex: &str, options: SignOptions) -> Result<String>;
}

/// Transaction relay.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid>;
}
