//! # Coin selection
//!
//! Picks fee-paying UTXOs from a payer's pool until the targets and the fee
//! for the resulting transaction are covered. The transaction size grows
//! with every selected input, so the fee is re-estimated on each round.

use bitcoin::{Amount, TxOut};
use tracing::{debug, info};

use crate::{
    account::AccountKeys,
    error::Result,
    fee::{estimate_vsize, FeeRate, InputSize},
    utxo::Utxo,
    MarketError, DUST_LIMIT,
};

/// Outcome of a successful selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    /// Payer UTXOs to add as inputs, in selection order
    pub inputs: Vec<Utxo>,
    /// Targets followed by the change output, if any
    pub outputs: Vec<TxOut>,
    pub fee: Amount,
    /// Value of the trailing change output
    pub change: Option<Amount>,
}

/// Fee-rate driven selector for one payer account.
#[derive(Debug, Clone)]
pub struct CoinSelector<'a> {
    payer: &'a AccountKeys,
    fee_rate: FeeRate,
    dust_limit: Amount,
    committed: Vec<InputSize>,
    committed_value: Amount,
}

impl<'a> CoinSelector<'a> {
    pub fn new(payer: &'a AccountKeys, fee_rate: FeeRate) -> Self {
        Self {
            payer,
            fee_rate,
            dust_limit: Amount::from_sat(DUST_LIMIT),
            committed: Vec::new(),
            committed_value: Amount::ZERO,
        }
    }

    /// Smallest change output worth creating.
    pub fn dust_limit(mut self, dust_limit: Amount) -> Self {
        self.dust_limit = dust_limit;
        self
    }

    /// Account for an input that is already part of the transaction (an
    /// offer input or a padding input). Its value counts towards the targets.
    pub fn committed_input(mut self, size: InputSize, value: Amount) -> Self {
        self.committed.push(size);
        self.committed_value += value;
        self
    }

    /// Select from `pool` until `targets` plus fee are covered.
    ///
    /// At least one pool UTXO is always selected. Change is appended to the
    /// outputs only when it reaches the dust limit; smaller leftovers go to
    /// the fee.
    pub fn select(&self, pool: &[Utxo], targets: Vec<TxOut>) -> Result<CoinSelection> {
        let target_value: Amount = targets.iter().map(|output| output.value).sum();
        let mut output_scripts: Vec<usize> =
            targets.iter().map(|output| output.script_pubkey.len()).collect();
        output_scripts.push(self.payer.script_pubkey.len());

        let payer_input = InputSize::for_address_type(self.payer.address_type);
        let available = self.committed_value.to_sat() + pool.iter().map(|utxo| utxo.value).sum::<u64>();

        let mut remaining = pool.to_vec();
        let mut inputs = Vec::new();
        let mut selected = self.committed_value;

        loop {
            let mut sizes = self.committed.clone();
            sizes.extend(std::iter::repeat(payer_input.clone()).take(inputs.len() + 1));
            let fee = self.fee_rate.fee(estimate_vsize(&sizes, &output_scripts));
            let needed = target_value + fee;

            let shortfall = needed.to_sat().saturating_sub(selected.to_sat());
            order_by_desirability(&mut remaining, shortfall, self.dust_limit.to_sat());

            if remaining.is_empty() {
                return Err(MarketError::InsufficientFunds {
                    needed: needed.to_sat(),
                    available,
                });
            }

            let utxo = remaining.remove(0);
            debug!(
                txid = %utxo.txid,
                vout = utxo.vout,
                value = utxo.value,
                shortfall,
                "selected fee input"
            );
            selected += utxo.amount();
            inputs.push(utxo);

            if selected >= needed {
                let refund = selected - needed;
                let mut outputs = targets;
                let change = (refund >= self.dust_limit).then(|| {
                    outputs.push(TxOut {
                        value: refund,
                        script_pubkey: self.payer.script_pubkey.clone(),
                    });
                    refund
                });
                // A dropped refund is paid as fee
                let fee = if change.is_some() { fee } else { selected - target_value };

                info!(
                    inputs = inputs.len(),
                    fee = fee.to_sat(),
                    change = change.map(Amount::to_sat),
                    "coin selection converged"
                );

                return Ok(CoinSelection {
                    inputs,
                    outputs,
                    fee,
                    change,
                });
            }
        }
    }
}

/// Sort candidates for a `shortfall`: UTXOs covering it with a non-dust
/// excess first (smallest first), then UTXOs covering it with a dust excess
/// (smallest first), then the rest (largest first).
fn order_by_desirability(pool: &mut [Utxo], shortfall: u64, dust_limit: u64) {
    pool.sort_by_key(|utxo| {
        if utxo.value >= shortfall {
            let tier = if utxo.value - shortfall >= dust_limit { 0 } else { 1 };
            (tier, utxo.value)
        } else {
            (2, u64::MAX - utxo.value)
        }
    });
}
