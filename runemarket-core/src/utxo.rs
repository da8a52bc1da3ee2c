//! Spendable outputs and the pending set of outputs created by
//! not-yet-confirmed marketplace transactions.

use bitcoin::{Amount, OutPoint, Script, Transaction, Txid};
use serde::{Deserialize, Serialize};

/// An unspent output as reported by the indexer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    /// Value in satoshis
    pub value: u64,
}

impl Utxo {
    pub fn new(outpoint: OutPoint, value: u64) -> Self {
        Self {
            txid: outpoint.txid,
            vout: outpoint.vout,
            value,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    pub fn amount(&self) -> Amount {
        Amount::from_sat(self.value)
    }
}

/// Outputs created and spent by transactions the caller is about to
/// broadcast.
///
/// The indexer only sees confirmed or relayed state, so a client chaining
/// a split transaction into a purchase merges this value into its pool
/// before the next selection.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingOutputs {
    pub created: Vec<Utxo>,
    pub spent: Vec<OutPoint>,
}

impl PendingOutputs {
    /// Pending view of `tx`: every input is spent, and every output paying
    /// `owner` is created.
    pub fn from_transaction(tx: &Transaction, owner: &Script) -> Self {
        let txid = tx.compute_txid();

        Self {
            created: tx
                .output
                .iter()
                .enumerate()
                .filter(|(_, output)| output.script_pubkey.as_script() == owner)
                .map(|(vout, output)| Utxo {
                    txid,
                    vout: vout as u32,
                    value: output.value.to_sat(),
                })
                .collect(),
            spent: tx.input.iter().map(|input| input.previous_output).collect(),
        }
    }

    /// Fold another pending set into this one.
    pub fn extend(&mut self, other: PendingOutputs) {
        for outpoint in other.spent {
            self.created.retain(|utxo| utxo.outpoint() != outpoint);
            if !self.spent.contains(&outpoint) {
                self.spent.push(outpoint);
            }
        }
        for utxo in other.created {
            if !self.created.contains(&utxo) {
                self.created.push(utxo);
            }
        }
    }

    /// Apply the pending set to an indexer snapshot: spent outputs are
    /// removed and created outputs become spendable.
    pub fn merge_into(&self, pool: &mut Vec<Utxo>) {
        pool.retain(|utxo| !self.spent.contains(&utxo.outpoint()));
        for utxo in &self.created {
            if !pool.iter().any(|known| known.outpoint() == utxo.outpoint()) {
                pool.push(utxo.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.spent.is_empty()
    }
}
