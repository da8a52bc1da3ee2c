//! # Runemarket Core
//!
//! Core Rust library for a trustless Bitcoin Runes marketplace.
//!
//! Sellers list rune balances by pre-signing offer fragments with
//! SIGHASH_SINGLE|ANYONECANPAY, so that any buyer can later combine one or
//! more fragments with their own inputs into a single transaction without
//! the seller being online:
//! - Offers are built, signed by an external wallet and validated against
//!   live indexer state
//! - Purchases revalidate offers, select fee inputs and assemble one PSBT
//! - Sweeps buy many offers at once, optionally splitting the runes across
//!   several receiver outputs with a runestone
//! - Inscription-bearing offers are bought behind padding inputs
//!
//! ## Features
//!
//! - **Runestone Encoding**: Edicts, mints, pointers and etchings as an
//!   `OP_RETURN` script
//! - **Coin Selection**: Fee-rate driven selection that converges on the
//!   final transaction size
//! - **Offer Validation**: ECDSA and Schnorr signature checks for every
//!   supported address type
//! - **Order Assembly**: Layouts that keep every offer input facing its
//!   funding output
//! - **Padding**: Reuse or split of small UTXOs for inscription purchases
//!
//! ## Examples
//!
//! ```rust
//! use runemarket_core::{location_id, runestone::Runestone, RuneId};
//!
//! // Transfer 100 units of a rune to output 1
//! let rune_id: RuneId = "840000:3".parse()?;
//! let script = Runestone::transfer(rune_id, 100, [1]).encipher();
//! assert!(script.is_op_return());
//!
//! // Offers are keyed by the location they spend
//! let location = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b:0".parse()?;
//! println!("offer id: {}", location_id(&location));
//! Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod account;
pub mod coin_select;
pub mod config;
pub mod error;
pub mod fee;
pub mod indexer;
pub mod offer;
pub mod order;
pub mod rune_id;
pub mod runestone;
pub mod signature;
pub mod split;
pub mod utils;
pub mod utxo;
pub mod validate;
pub mod varint;

#[cfg(test)]
pub mod test_utils;

pub use account::{AccountKeys, AddressType};
pub use coin_select::{CoinSelection, CoinSelector};
pub use config::MarketConfig;
pub use error::{MarketError, Result, ValidationError};
pub use fee::FeeRate;
pub use indexer::{Broadcaster, PsbtSigner, RuneIndexer, SignOptions};
pub use offer::{Offer, OfferBuilder, OfferFragment, OfferStatus};
pub use order::{Order, OrderAssembler, PurchaseKind, PurchaseRequest};
pub use rune_id::RuneId;
pub use split::UtxoSplitter;
pub use utils::*;
pub use utxo::{PendingOutputs, Utxo};
pub use validate::{OfferKind, OfferSubmission, OfferValidator};

/// Smallest output value the marketplace creates (546 satoshis)
pub const DUST_LIMIT: u64 = 546;

/// SIGHASH_SINGLE|ANYONECANPAY, the sighash of every offer input (0x83)
pub const OFFER_SIGHASH: u32 = 0x83;

/// Value of each padding output created by a split (600 satoshis)
pub const PADDING_UNIT_VALUE: u64 = 600;
