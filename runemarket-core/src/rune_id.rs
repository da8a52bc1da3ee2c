//! Relative rune identifiers (`block:tx`).

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{error::Result, MarketError, ValidationError};

/// Identifies a rune by the block and transaction index of its etching.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, PartialOrd, Ord, Default)]
pub struct RuneId {
    pub block: u64,
    pub tx: u32,
}

impl RuneId {
    /// Create a rune id, rejecting a non-zero tx in block zero.
    pub fn new(block: u64, tx: u32) -> Option<RuneId> {
        let id = RuneId { block, tx };

        if id.block == 0 && id.tx > 0 {
            return None;
        }

        Some(id)
    }

    /// Delta of `next` against `self`.
    ///
    /// The tx component is relative only when both ids share a block;
    /// otherwise it is the absolute tx index of `next`. Returns `None` when
    /// `next` sorts before `self`.
    pub fn delta(self, next: RuneId) -> Option<(u128, u128)> {
        let block = next.block.checked_sub(self.block)?;

        let tx = if block == 0 {
            next.tx.checked_sub(self.tx)?
        } else {
            next.tx
        };

        Some((block.into(), tx.into()))
    }
}

impl Display for RuneId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.tx)
    }
}

impl FromStr for RuneId {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        let (block, tx) = s
            .split_once(':')
            .ok_or_else(|| bad_rune_id(s, "missing separator"))?;

        Ok(Self {
            block: block.parse().map_err(|_| bad_rune_id(s, "invalid block"))?,
            tx: tx.parse().map_err(|_| bad_rune_id(s, "invalid tx"))?,
        })
    }
}

fn bad_rune_id(s: &str, reason: &str) -> MarketError {
    ValidationError::BadRequest(format!("rune id `{s}`: {reason}")).into()
}

impl Serialize for RuneId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RuneId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
