//! # Padding
//!
//! Inscription purchases put small buyer outputs in front of the
//! inscription input so that its sats land in the receiver output. Small
//! UTXOs already in the pool are reused; otherwise one UTXO is split into
//! fixed-value padding outputs and a remainder.

use bitcoin::{
    absolute::LockTime, psbt::Psbt, transaction::Version, Amount, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Witness,
};
use tracing::{debug, info};

use crate::{
    account::AccountKeys,
    config::PaddingConfig,
    error::Result,
    fee::{estimate_vsize, FeeRate, InputSize},
    indexer::{Broadcaster, PsbtSigner, SignOptions},
    signature::{finalize_input, is_finalized, verify_input, SighashPolicy},
    utxo::{PendingOutputs, Utxo},
    MarketError, ValidationError,
};

/// Padding ready for a purchase.
#[derive(Clone, Debug, PartialEq)]
pub struct Padding {
    /// Inputs to place in front of the inscription
    pub padding: Vec<Utxo>,
    /// Everything else the buyer can pay fees with
    pub fee_utxos: Vec<Utxo>,
    /// Split transaction, when one was needed
    pub transaction: Option<Transaction>,
    pub pending: PendingOutputs,
}

/// Unsigned split of one UTXO into padding outputs.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitPlan {
    pub psbt: Psbt,
    pub consumed: Utxo,
    pub fee: Amount,
}

impl SplitPlan {
    pub fn sign_options(&self) -> SignOptions {
        SignOptions {
            sighash: None,
            input_indexes: vec![0],
            finalize: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PaddingPlan {
    /// The pool already holds small enough UTXOs
    Reuse(Padding),
    Split(SplitPlan),
}

/// Produces padding UTXOs for one buyer account.
#[derive(Debug, Clone)]
pub struct UtxoSplitter<'a> {
    account: &'a AccountKeys,
    config: &'a PaddingConfig,
    fee_rate: FeeRate,
}

impl<'a> UtxoSplitter<'a> {
    pub fn new(account: &'a AccountKeys, config: &'a PaddingConfig, fee_rate: FeeRate) -> Self {
        Self {
            account,
            config,
            fee_rate,
        }
    }

    fn split_fee(&self, outputs: usize) -> Amount {
        let input = InputSize::for_address_type(self.account.address_type);
        let scripts = vec![self.account.script_pubkey.len(); outputs];
        self.fee_rate.fee(estimate_vsize(&[input], &scripts))
    }

    /// Reuse small UTXOs when possible, otherwise plan the widest split the
    /// pool can pay for.
    pub fn plan(&self, pool: &[Utxo]) -> Result<PaddingPlan> {
        let mut sorted = pool.to_vec();
        sorted.sort_by_key(|utxo| utxo.value);

        let count = self.config.count;
        if sorted.len() > count
            && sorted[..count]
                .iter()
                .all(|utxo| utxo.value <= self.config.reuse_threshold)
        {
            let fee_utxos = sorted.split_off(count);
            debug!(count, "reusing small utxos as padding");
            return Ok(PaddingPlan::Reuse(Padding {
                padding: sorted,
                fee_utxos,
                transaction: None,
                pending: PendingOutputs::default(),
            }));
        }

        let mut chosen = None;
        for outputs in count.max(2)..=self.config.max_outputs {
            let fee = self.split_fee(outputs);
            let needed = fee.to_sat() + self.config.unit_value * outputs as u64;

            match sorted.iter().find(|utxo| utxo.value >= needed) {
                Some(utxo) => chosen = Some((outputs, utxo.clone(), fee)),
                None if chosen.is_none() => {
                    return Err(MarketError::InsufficientFunds {
                        needed,
                        available: sorted.last().map_or(0, |utxo| utxo.value),
                    })
                }
                None => break,
            }
        }

        let (outputs, consumed, fee) = chosen.ok_or_else(|| {
            MarketError::from(ValidationError::BadRequest(format!(
                "cannot split into {} padding outputs",
                count
            )))
        })?;

        let output = |value: u64| TxOut {
            value: Amount::from_sat(value),
            script_pubkey: self.account.script_pubkey.clone(),
        };
        let remainder = consumed.value - fee.to_sat() - self.config.unit_value * (outputs as u64 - 1);

        let mut tx_outputs: Vec<TxOut> = (1..outputs).map(|_| output(self.config.unit_value)).collect();
        tx_outputs.push(output(remainder));

        let unsigned_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: consumed.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: tx_outputs,
        };

        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx)?;
        psbt.inputs[0].witness_utxo = Some(output(consumed.value));
        self.account.apply_input_extras(&mut psbt.inputs[0]);

        info!(
            outputs,
            consumed = consumed.value,
            fee = fee.to_sat(),
            "planned padding split"
        );

        Ok(PaddingPlan::Split(SplitPlan {
            psbt,
            consumed,
            fee,
        }))
    }

    /// Finalize the signed split and hand out its outputs.
    pub fn complete(&self, plan: &SplitPlan, signed_psbt_hex: &str, pool: &[Utxo]) -> Result<Padding> {
        let mut psbt = Psbt::deserialize(&hex::decode(signed_psbt_hex)?)?;
        if psbt.unsigned_tx.compute_txid() != plan.psbt.unsigned_tx.compute_txid() {
            return Err(ValidationError::BadRequest(
                "signed psbt does not match the split".to_string(),
            )
            .into());
        }

        verify_input(&psbt, 0, SighashPolicy::Any)?;
        if !is_finalized(&psbt.inputs[0]) {
            finalize_input(&mut psbt, 0)?;
        }

        let tx = psbt.extract_tx_unchecked_fee_rate();
        let pending = PendingOutputs::from_transaction(&tx, &self.account.script_pubkey);

        let mut created = pending.created.clone();
        let rest = created.split_off(self.config.count.min(created.len()));

        let mut fee_utxos: Vec<Utxo> = pool
            .iter()
            .filter(|utxo| utxo.outpoint() != plan.consumed.outpoint())
            .cloned()
            .collect();
        fee_utxos.extend(rest);

        Ok(Padding {
            padding: created,
            fee_utxos,
            transaction: Some(tx),
            pending,
        })
    }

    /// Plan, sign, finalize and broadcast the split if one is needed.
    pub async fn prepare<S, B>(&self, pool: &[Utxo], signer: &S, broadcaster: &B) -> Result<Padding>
    where
        S: PsbtSigner + ?Sized,
        B: Broadcaster + ?Sized,
    {
        let plan = match self.plan(pool)? {
            PaddingPlan::Reuse(padding) => return Ok(padding),
            PaddingPlan::Split(plan) => plan,
        };

        let signed = signer
            .sign_psbt(&plan.psbt.serialize_hex(), plan.sign_options())
            .await?;
        let padding = self.complete(&plan, &signed, pool)?;

        if let Some(tx) = &padding.transaction {
            let txid = broadcaster
                .broadcast(&bitcoin::consensus::encode::serialize_hex(tx))
                .await?;
            info!(%txid, padding = padding.padding.len(), "padding split broadcast");
        }

        Ok(padding)
    }
}
