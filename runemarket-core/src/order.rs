//! # Orders
//!
//! The buyer side of the marketplace. Validated offer fragments are
//! revalidated against the indexer, spliced into one transaction together
//! with the buyer's fee inputs, signed by the buyer's wallet, finalized and
//! broadcast.
//!
//! Offer input `i` must face its funding output `i` in the final
//! transaction, since the seller's SIGHASH_SINGLE signature commits to the
//! output at its own index. Both layouts below keep that alignment:
//!
//! - token: inputs `[fee₀, offers…, fee…]`, outputs `[lead, funding…,
//!   split receivers…, change]`
//! - collection: inputs `[padding₀, padding₁, inscription, asset, fee…]`,
//!   outputs `[padding, receiver, funding…, OP_RETURN, change]`

use std::collections::HashSet;

use bitcoin::{
    absolute::LockTime,
    psbt::{self, Psbt},
    transaction::Version,
    Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    account::AccountKeys,
    coin_select::{CoinSelection, CoinSelector},
    config::MarketConfig,
    error::Result,
    fee::{FeeRate, InputSize},
    indexer::{Broadcaster, PsbtSigner, RuneBalance, RuneIndexer, SignOptions},
    offer::{Offer, OfferStatus},
    rune_id::RuneId,
    runestone::{Edict, Runestone, MAX_STANDARD_OP_RETURN_SIZE},
    signature::{is_finalized, verify_and_finalize, verify_input, SighashPolicy},
    utils::{base_units, parse_address, unix_now, whole_units},
    utxo::{PendingOutputs, Utxo},
    validate::single_rune_balance,
    MarketError, ValidationError, DUST_LIMIT,
};

/// A settled purchase.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Order {
    /// Offers bought, in their `Sold` state
    pub offers: Vec<Offer>,
    pub buyer: String,
    pub item_receiver: String,
    pub txid: Txid,
    /// Fee paid in sats
    pub fee: u64,
    pub created_at: u64,
}

/// Offers that survived revalidation, with their live balances.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Revalidation {
    pub offers: Vec<Offer>,
    /// Live balance of each offer, in the same order
    pub balances: Vec<RuneBalance>,
    /// `txid:vout` of every excluded offer
    pub invalid_locations: Vec<String>,
}

impl Revalidation {
    /// Raw rune amount held by all valid offers together.
    pub fn total_raw(&self) -> u128 {
        self.balances.iter().map(|balance| balance.amount).sum()
    }

    /// Rune id and divisibility shared by every valid offer.
    fn rune(&self) -> Result<(RuneId, u8)> {
        let first = self
            .offers
            .first()
            .ok_or_else(|| ValidationError::BadRequest("no valid offer".to_string()))?;

        if self.offers.iter().any(|offer| offer.rune_id != first.rune_id) {
            return Err(ValidationError::BadRequest("offers of different runes".to_string()).into());
        }

        Ok((first.rune_id, first.divisibility))
    }
}

/// Unsigned purchase transaction waiting for the buyer's signatures.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderDraft {
    pub psbt: Psbt,
    pub buyer: AccountKeys,
    pub item_receiver: String,
    pub offers: Vec<Offer>,
    /// Inputs the buyer signs
    pub buyer_inputs: Vec<usize>,
    /// Inputs carrying finalized offer fragments
    pub offer_inputs: Vec<usize>,
    pub fee: Amount,
    pub change: Option<Amount>,
}

impl OrderDraft {
    /// What the buyer's wallet must do with the draft.
    pub fn sign_options(&self) -> SignOptions {
        SignOptions {
            sighash: None,
            input_indexes: self.buyer_inputs.clone(),
            finalize: false,
        }
    }

    pub fn psbt_hex(&self) -> String {
        self.psbt.serialize_hex()
    }

    fn offer_ids(&self) -> HashSet<&str> {
        self.offers.iter().map(|offer| offer.id.as_str()).collect()
    }
}

/// What a purchase buys.
#[derive(Clone, Debug, PartialEq)]
pub enum PurchaseKind {
    /// Rune balances, optionally split into receiver outputs of
    /// `split_amount` whole units each
    Token { split_amount: Option<u128> },
    /// One inscription-bearing offer, preceded by the buyer's padding
    Collection { padding: Vec<Utxo> },
}

/// Everything the buyer brings to a purchase.
#[derive(Clone, Debug, PartialEq)]
pub struct PurchaseRequest {
    pub buyer: AccountKeys,
    pub item_receiver: String,
    /// Falls back to the configured fee rate
    pub fee_rate: Option<FeeRate>,
    pub kind: PurchaseKind,
    /// Outputs of the buyer's unconfirmed transactions
    pub pending: PendingOutputs,
}

/// Result of a successful purchase.
#[derive(Clone, Debug, PartialEq)]
pub struct Purchase {
    pub order: Order,
    /// Buyer outputs of the purchase transaction
    pub pending: PendingOutputs,
    pub invalid_locations: Vec<String>,
}

/// Combines offers with buyer inputs into final transactions.
pub struct OrderAssembler<'a, I: RuneIndexer + ?Sized> {
    indexer: &'a I,
    config: &'a MarketConfig,
}

impl<'a, I: RuneIndexer + ?Sized> OrderAssembler<'a, I> {
    pub fn new(indexer: &'a I, config: &'a MarketConfig) -> Self {
        Self { indexer, config }
    }

    /// Check every offer against its live location.
    ///
    /// In a sweep (more than one offer) an offer whose assets moved is
    /// dropped and reported in `invalid_locations`; with a single offer the
    /// mismatch is returned as the error. Indexer failures always abort.
    pub async fn revalidate(&self, offers: Vec<Offer>) -> Result<Revalidation> {
        let sweep = offers.len() > 1;
        let mut result = Revalidation::default();

        let mut active = Vec::with_capacity(offers.len());
        for offer in offers {
            if offer.status == OfferStatus::Active {
                active.push(offer);
            } else if sweep {
                warn!(location = %offer.location_key(), status = ?offer.status, "skipping inactive offer");
                result.invalid_locations.push(offer.location_key());
            } else {
                return Err(ValidationError::BadRequest(format!("offer {} is not active", offer.id)).into());
            }
        }

        for batch in active.chunks(self.config.sweep.batch_size()) {
            tokio::time::sleep(self.config.sweep.batch_delay()).await;
            let checks = join_all(batch.iter().map(|offer| self.check_offer(offer))).await;

            for (offer, check) in batch.iter().zip(checks) {
                match check {
                    Ok(balance) => {
                        result.offers.push(offer.clone());
                        result.balances.push(balance);
                    }
                    Err(e @ (MarketError::AssetMismatch(_) | MarketError::InscriptionMismatch(_)))
                        if sweep =>
                    {
                        warn!(location = %offer.location_key(), error = %e, "excluding offer from sweep");
                        result.invalid_locations.push(offer.location_key());
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        debug!(
            valid = result.offers.len(),
            invalid = result.invalid_locations.len(),
            "offers revalidated"
        );

        Ok(result)
    }

    async fn check_offer(&self, offer: &Offer) -> Result<RuneBalance> {
        let location = offer.location.outpoint();
        let balances = self.indexer.utxo_balance(location).await?;
        let balance = single_rune_balance(&balances, offer.rune_id, &location)?;

        let amount = whole_units(balance.amount, balance.divisibility);
        if amount != offer.amount {
            return Err(MarketError::AssetMismatch(format!(
                "{location} holds {amount} units, offer lists {}",
                offer.amount
            )));
        }

        if let Some(inscription) = &offer.inscription {
            let current = self
                .indexer
                .inscription_location(&inscription.inscription_id)
                .await?;
            if current != Some(inscription.location) {
                return Err(MarketError::InscriptionMismatch(format!(
                    "inscription {} left {}",
                    inscription.inscription_id, inscription.location
                )));
            }
        }

        Ok(balance)
    }

    /// Receiver output for split purchases: raw amounts per output, or
    /// `None` when everything fits a single output.
    fn split_amounts(&self, revalidated: &Revalidation, split_amount: Option<u128>) -> Result<Option<Vec<u128>>> {
        let Some(per_output) = split_amount else {
            return Ok(None);
        };

        let (_, divisibility) = revalidated.rune()?;
        let per_output = base_units(per_output, divisibility)
            .filter(|raw| *raw > 0)
            .ok_or_else(|| ValidationError::BadRequest(format!("invalid split amount {per_output}")))?;

        let total = revalidated.total_raw();
        let full = total / per_output;
        let remainder = total % per_output;
        if full >= MAX_STANDARD_OP_RETURN_SIZE as u128 {
            return Err(ValidationError::BadRequest(format!(
                "split amount {per_output} creates too many outputs"
            ))
            .into());
        }

        let mut amounts = vec![per_output; full as usize];
        if remainder > 0 {
            amounts.push(remainder);
        }

        Ok((amounts.len() > 1).then_some(amounts))
    }

    /// Draft a purchase of rune balances (single-input fragments).
    pub fn assemble_token(
        &self,
        revalidated: &Revalidation,
        buyer: &AccountKeys,
        item_receiver: &str,
        pool: &[Utxo],
        fee_rate: FeeRate,
        split_amount: Option<u128>,
    ) -> Result<OrderDraft> {
        let (rune_id, _) = revalidated.rune()?;
        let receiver = parse_address(item_receiver, self.config.network)?.script_pubkey();

        let mut offer_parts = Vec::with_capacity(revalidated.offers.len());
        for offer in &revalidated.offers {
            let fragment = offer.fragment()?;
            if offer.inscription.is_some() || fragment.inscription().is_some() {
                return Err(ValidationError::InvalidFragment(format!(
                    "offer {} carries an inscription",
                    offer.id
                ))
                .into());
            }
            offer_parts.push(fragment.asset().clone());
        }

        let receiver_output = |value: u64| TxOut {
            value: Amount::from_sat(value),
            script_pubkey: receiver.clone(),
        };

        let split = self.split_amounts(revalidated, split_amount)?;
        let runestone = split.as_ref().map(|amounts| {
            let first = revalidated.offers.len() as u32 + 1;
            Runestone {
                edicts: amounts
                    .iter()
                    .zip(first..)
                    .map(|(amount, output)| Edict {
                        id: rune_id,
                        amount: *amount,
                        output,
                    })
                    .collect(),
                pointer: Some(first),
                ..Default::default()
            }
        });

        let mut targets = Vec::new();
        match &runestone {
            Some(runestone) => {
                let script = runestone.encipher();
                if script.len() > MAX_STANDARD_OP_RETURN_SIZE {
                    return Err(ValidationError::BadRequest(format!(
                        "{} split outputs do not fit a standard OP_RETURN",
                        runestone.edicts.len()
                    ))
                    .into());
                }
                targets.push(TxOut {
                    value: Amount::ZERO,
                    script_pubkey: script,
                });
            }
            None => targets.push(receiver_output(DUST_LIMIT)),
        }

        targets.extend(offer_parts.iter().map(|part| part.funding.clone()));
        if let Some(amounts) = &split {
            targets.extend(amounts.iter().map(|_| receiver_output(DUST_LIMIT)));
        }

        let mut selector = CoinSelector::new(buyer, fee_rate).dust_limit(self.config.dust_limit());
        for part in &offer_parts {
            selector = selector.committed_input(InputSize::of_finalized(&part.input), part.value());
        }
        let selection = selector.select(pool, targets)?;

        let mut fee_inputs = selection.inputs.iter();
        let mut inputs = Vec::new();
        let mut buyer_inputs = Vec::new();

        if let Some(first) = fee_inputs.next() {
            buyer_inputs.push(inputs.len());
            inputs.push(buyer_input(buyer, first));
        }
        let offer_inputs: Vec<usize> = (inputs.len()..inputs.len() + offer_parts.len()).collect();
        inputs.extend(offer_parts.iter().map(|part| (part.txin(), part.input.clone())));
        for utxo in fee_inputs {
            buyer_inputs.push(inputs.len());
            inputs.push(buyer_input(buyer, utxo));
        }

        if let Some(runestone) = &runestone {
            runestone.check_outputs(selection.outputs.len())?;
            debug!(receivers = runestone.edicts.len(), "purchase split across receiver outputs");
        }

        self.draft(revalidated, buyer, item_receiver, inputs, buyer_inputs, offer_inputs, selection)
    }

    /// Draft the purchase of one inscription-bearing offer, spending the
    /// buyer's `padding` in front of it.
    pub fn assemble_collection(
        &self,
        revalidated: &Revalidation,
        buyer: &AccountKeys,
        item_receiver: &str,
        padding: &[Utxo],
        pool: &[Utxo],
        fee_rate: FeeRate,
    ) -> Result<OrderDraft> {
        let (offer, balance) = match (revalidated.offers.as_slice(), revalidated.balances.as_slice()) {
            ([offer], [balance]) if offer.inscription.is_some() => (offer, balance),
            _ => {
                return Err(ValidationError::BadRequest(
                    "a collection order buys exactly one inscription offer".to_string(),
                )
                .into())
            }
        };
        if padding.len() != self.config.padding.count {
            return Err(ValidationError::BadRequest(format!(
                "{} padding inputs given, {} needed",
                padding.len(),
                self.config.padding.count
            ))
            .into());
        }

        let receiver = parse_address(item_receiver, self.config.network)?.script_pubkey();
        let fragment = offer.fragment()?;
        let parts: Vec<_> = fragment.inputs().into_iter().cloned().collect();

        let padding_value: Amount = padding.iter().map(Utxo::amount).sum();
        let mut targets = vec![
            TxOut {
                value: padding_value,
                script_pubkey: buyer.script_pubkey.clone(),
            },
            TxOut {
                value: Amount::from_sat(DUST_LIMIT),
                script_pubkey: receiver,
            },
        ];
        targets.extend(parts.iter().map(|part| part.funding.clone()));

        let edict = Runestone::transfer(offer.rune_id, balance.amount, [1]);
        targets.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: edict.encipher(),
        });

        let buyer_size = InputSize::for_address_type(buyer.address_type);
        let mut selector = CoinSelector::new(buyer, fee_rate).dust_limit(self.config.dust_limit());
        for utxo in padding {
            selector = selector.committed_input(buyer_size.clone(), utxo.amount());
        }
        for part in &parts {
            selector = selector.committed_input(InputSize::of_finalized(&part.input), part.value());
        }

        let fee_pool: Vec<Utxo> = pool
            .iter()
            .filter(|utxo| !padding.iter().any(|pad| pad.outpoint() == utxo.outpoint()))
            .cloned()
            .collect();
        let selection = selector.select(&fee_pool, targets)?;

        let mut inputs: Vec<(TxIn, psbt::Input)> = padding.iter().map(|utxo| buyer_input(buyer, utxo)).collect();
        let mut buyer_inputs: Vec<usize> = (0..inputs.len()).collect();
        let offer_inputs: Vec<usize> = (inputs.len()..inputs.len() + parts.len()).collect();
        inputs.extend(parts.iter().map(|part| (part.txin(), part.input.clone())));
        for utxo in &selection.inputs {
            buyer_inputs.push(inputs.len());
            inputs.push(buyer_input(buyer, utxo));
        }

        self.draft(revalidated, buyer, item_receiver, inputs, buyer_inputs, offer_inputs, selection)
    }

    #[allow(clippy::too_many_arguments)]
    fn draft(
        &self,
        revalidated: &Revalidation,
        buyer: &AccountKeys,
        item_receiver: &str,
        inputs: Vec<(TxIn, psbt::Input)>,
        buyer_inputs: Vec<usize>,
        offer_inputs: Vec<usize>,
        selection: CoinSelection,
    ) -> Result<OrderDraft> {
        let (txins, psbt_inputs): (Vec<TxIn>, Vec<psbt::Input>) = inputs.into_iter().unzip();

        let unsigned_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: txins,
            output: selection.outputs,
        };

        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx)?;
        for (slot, input) in psbt.inputs.iter_mut().zip(psbt_inputs) {
            *slot = input;
        }

        info!(
            offers = revalidated.offers.len(),
            inputs = psbt.inputs.len(),
            outputs = psbt.outputs.len(),
            fee = selection.fee.to_sat(),
            "order drafted"
        );

        Ok(OrderDraft {
            psbt,
            buyer: buyer.clone(),
            item_receiver: item_receiver.to_string(),
            offers: revalidated.offers.clone(),
            buyer_inputs,
            offer_inputs,
            fee: selection.fee,
            change: selection.change,
        })
    }

    /// Verify and finalize the buyer's signatures, re-check every offer
    /// signature in place and extract the transaction.
    pub fn finalize(&self, draft: &OrderDraft, signed_psbt_hex: &str) -> Result<Transaction> {
        let mut psbt = Psbt::deserialize(&hex::decode(signed_psbt_hex)?)?;
        if psbt.unsigned_tx.compute_txid() != draft.psbt.unsigned_tx.compute_txid() {
            return Err(ValidationError::BadRequest(
                "signed psbt does not match the order".to_string(),
            )
            .into());
        }

        verify_and_finalize(&mut psbt, &draft.buyer_inputs, SighashPolicy::Any)?;

        for &index in &draft.offer_inputs {
            let offer_input = &draft.psbt.inputs[index];
            let input = &mut psbt.inputs[index];
            if !is_finalized(input) {
                input.final_script_sig = offer_input.final_script_sig.clone();
                input.final_script_witness = offer_input.final_script_witness.clone();
            }
            verify_input(&psbt, index, SighashPolicy::Offer)?;
        }

        if let Some(index) = psbt.inputs.iter().position(|input| !is_finalized(input)) {
            return Err(MarketError::SignatureInvalid(format!("input {index} is not finalized")));
        }

        Ok(psbt.extract_tx_unchecked_fee_rate())
    }

    /// Broadcast a finalized purchase and settle the offers in `book`.
    ///
    /// A rejection cancels the draft's offers: their locations are spent or
    /// conflicted, so they can never fill.
    pub async fn broadcast<B: Broadcaster + ?Sized>(
        &self,
        broadcaster: &B,
        draft: &OrderDraft,
        tx: &Transaction,
        book: &mut [Offer],
    ) -> Result<(Order, PendingOutputs)> {
        let ids = draft.offer_ids();
        let raw_tx = bitcoin::consensus::encode::serialize_hex(tx);

        let txid = match broadcaster.broadcast(&raw_tx).await {
            Ok(txid) => txid,
            Err(e) => {
                if e.is_terminal_for_offer() {
                    warn!(error = %e, offers = ids.len(), "purchase rejected, cancelling offers");
                    set_status(book, &ids, OfferStatus::Cancelled);
                }
                return Err(e);
            }
        };

        set_status(book, &ids, OfferStatus::Sold);

        let offers = draft
            .offers
            .iter()
            .cloned()
            .map(|mut offer| {
                offer.set_status(OfferStatus::Sold)?;
                Ok(offer)
            })
            .collect::<Result<Vec<_>>>()?;

        info!(%txid, offers = offers.len(), fee = draft.fee.to_sat(), "purchase broadcast");

        let order = Order {
            offers,
            buyer: draft.buyer.address.to_string(),
            item_receiver: draft.item_receiver.clone(),
            txid,
            fee: draft.fee.to_sat(),
            created_at: unix_now(),
        };

        Ok((order, PendingOutputs::from_transaction(tx, &draft.buyer.script_pubkey)))
    }

    /// Run a whole purchase: revalidate, draft, have the buyer sign,
    /// finalize and broadcast. Offers in `book` are updated to their final
    /// status.
    pub async fn purchase<S, B>(
        &self,
        request: &PurchaseRequest,
        book: &mut [Offer],
        signer: &S,
        broadcaster: &B,
    ) -> Result<Purchase>
    where
        S: PsbtSigner + ?Sized,
        B: Broadcaster + ?Sized,
    {
        let revalidated = self.revalidate(book.to_vec()).await?;
        if revalidated.offers.is_empty() {
            return Err(ValidationError::BadRequest("no valid offer".to_string()).into());
        }

        let mut pool = self.indexer.list_utxos(&request.buyer.address).await?;
        request.pending.merge_into(&mut pool);

        let fee_rate = request.fee_rate.unwrap_or(self.config.fee_rate);
        let draft = match &request.kind {
            PurchaseKind::Token { split_amount } => self.assemble_token(
                &revalidated,
                &request.buyer,
                &request.item_receiver,
                &pool,
                fee_rate,
                *split_amount,
            )?,
            PurchaseKind::Collection { padding } => self.assemble_collection(
                &revalidated,
                &request.buyer,
                &request.item_receiver,
                padding,
                &pool,
                fee_rate,
            )?,
        };

        let signed = signer.sign_psbt(&draft.psbt_hex(), draft.sign_options()).await?;
        let tx = self.finalize(&draft, &signed)?;
        let (order, pending) = self.broadcast(broadcaster, &draft, &tx, book).await?;

        Ok(Purchase {
            order,
            pending,
            invalid_locations: revalidated.invalid_locations,
        })
    }
}

fn buyer_input(buyer: &AccountKeys, utxo: &Utxo) -> (TxIn, psbt::Input) {
    let txin = TxIn {
        previous_output: utxo.outpoint(),
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    };

    let mut input = psbt::Input {
        witness_utxo: Some(TxOut {
            value: utxo.amount(),
            script_pubkey: buyer.script_pubkey.clone(),
        }),
        ..Default::default()
    };
    buyer.apply_input_extras(&mut input);

    (txin, input)
}

fn set_status(book: &mut [Offer], ids: &HashSet<&str>, status: OfferStatus) {
    for offer in book.iter_mut().filter(|offer| ids.contains(offer.id.as_str())) {
        if let Err(e) = offer.set_status(status) {
            warn!(offer = %offer.id, error = %e, "offer status unchanged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crate::{AddressType, OFFER_SIGHASH};
    use bitcoin::psbt::PsbtSighashType;

    fn config() -> MarketConfig {
        let mut config = MarketConfig::for_network(bitcoin::Network::Regtest);
        config.sweep.batch_delay_ms = 0;
        config
    }

    fn buyer() -> AccountKeys {
        test_account(20, AddressType::P2wpkh)
    }

    fn receiver() -> String {
        test_account(21, AddressType::P2tr).address.to_string()
    }

    fn buyer_pool() -> Vec<Utxo> {
        vec![test_utxo(100, 50_000), test_utxo(101, 400_000), test_utxo(102, 1_000_000)]
    }

    fn rate() -> FeeRate {
        FeeRate::try_from(3.0).unwrap()
    }

    fn revalidated(offers: Vec<Offer>) -> Revalidation {
        Revalidation {
            balances: offers
                .iter()
                .map(|offer| RuneBalance {
                    rune_id: offer.rune_id,
                    amount: offer.amount,
                    divisibility: offer.divisibility,
                })
                .collect(),
            offers,
            invalid_locations: vec![],
        }
    }

    #[tokio::test]
    async fn test_sweep_excludes_moved_offer() {
        let offers: Vec<Offer> = (1..=4)
            .map(|i| test_offer(i, AddressType::P2tr, i, 100, 1000.0))
            .collect();
        let indexer = TestIndexer::new().with_offers(&offers);
        // the second offer's balance was spent after listing
        indexer.set_balance(offers[1].location.outpoint(), vec![]);

        let config = config();
        let result = OrderAssembler::new(&indexer, &config)
            .revalidate(offers.clone())
            .await
            .unwrap();

        assert_eq!(result.offers.len(), 3);
        assert!(!result.offers.iter().any(|offer| offer.id == offers[1].id));
        assert_eq!(result.invalid_locations, vec![offers[1].location_key()]);
        assert_eq!(result.total_raw(), 300);
    }

    #[tokio::test]
    async fn test_single_offer_mismatch_aborts() {
        let offer = test_offer(1, AddressType::P2tr, 1, 100, 1000.0);
        let indexer = TestIndexer::new().with_offers(std::slice::from_ref(&offer));
        indexer.set_balance(
            offer.location.outpoint(),
            vec![RuneBalance {
                rune_id: offer.rune_id,
                amount: 40,
                divisibility: 0,
            }],
        );

        let config = config();
        let result = OrderAssembler::new(&indexer, &config)
            .revalidate(vec![offer])
            .await;
        assert!(matches!(result, Err(MarketError::AssetMismatch(_))));
    }

    #[tokio::test]
    async fn test_indexer_failure_aborts_sweep() {
        let offers: Vec<Offer> = (1..=3)
            .map(|i| test_offer(i, AddressType::P2tr, i, 10, 1000.0))
            .collect();
        let indexer = TestIndexer::new().with_offers(&offers);
        indexer.set_unavailable(offers[2].location.outpoint());

        let config = config();
        let result = OrderAssembler::new(&indexer, &config).revalidate(offers).await;
        assert!(matches!(result, Err(MarketError::ExternalService(_))));
    }

    #[tokio::test]
    async fn test_revalidation_runs_in_batches() {
        let offers: Vec<Offer> = (1..=7)
            .map(|i| test_offer(i, AddressType::P2wpkh, i, 10, 1000.0))
            .collect();
        let indexer = TestIndexer::new().with_offers(&offers);

        let mut config = config();
        config.sweep.batch_size = 3;
        let result = OrderAssembler::new(&indexer, &config)
            .revalidate(offers.clone())
            .await
            .unwrap();

        let ids: Vec<&str> = result.offers.iter().map(|offer| offer.id.as_str()).collect();
        let expected: Vec<&str> = offers.iter().map(|offer| offer.id.as_str()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_moved_inscription_excluded_or_fatal() {
        let offer = test_collection_offer(1, AddressType::P2tr, 1, 2, 20_000.0);
        let indexer = TestIndexer::new().with_offers(std::slice::from_ref(&offer));
        let inscription_id = offer.inscription.as_ref().unwrap().inscription_id.clone();
        indexer.move_inscription(&inscription_id, test_utxo(50, 546).outpoint());

        let config = config();
        let assembler = OrderAssembler::new(&indexer, &config);
        assert!(matches!(
            assembler.revalidate(vec![offer.clone()]).await,
            Err(MarketError::InscriptionMismatch(_))
        ));

        let other = test_offer(3, AddressType::P2tr, 3, 10, 1000.0);
        let indexer = TestIndexer::new().with_offers(&[offer.clone(), other.clone()]);
        indexer.move_inscription(&inscription_id, test_utxo(50, 546).outpoint());
        let result = OrderAssembler::new(&indexer, &config)
            .revalidate(vec![offer.clone(), other])
            .await
            .unwrap();
        assert_eq!(result.invalid_locations, vec![offer.location_key()]);
    }

    #[tokio::test]
    async fn test_inactive_offer_skipped_in_sweep() {
        let mut offers: Vec<Offer> = (1..=2)
            .map(|i| test_offer(i, AddressType::P2tr, i, 10, 1000.0))
            .collect();
        offers[0].set_status(OfferStatus::Sold).unwrap();
        let indexer = TestIndexer::new().with_offers(&offers);

        let config = config();
        let result = OrderAssembler::new(&indexer, &config)
            .revalidate(offers.clone())
            .await
            .unwrap();
        assert_eq!(result.offers.len(), 1);
        assert_eq!(result.invalid_locations, vec![offers[0].location_key()]);
    }

    #[test]
    fn test_token_layout() {
        let offers: Vec<Offer> = vec![
            test_offer(1, AddressType::P2tr, 1, 100, 1000.0),
            test_offer(2, AddressType::P2wpkh, 2, 50, 1000.0),
        ];
        let indexer = TestIndexer::new();
        let config = config();
        let buyer = buyer();

        let draft = OrderAssembler::new(&indexer, &config)
            .assemble_token(&revalidated(offers.clone()), &buyer, &receiver(), &buyer_pool(), rate(), None)
            .unwrap();
        let tx = &draft.psbt.unsigned_tx;

        assert_eq!(draft.offer_inputs, vec![1, 2]);
        assert_eq!(draft.buyer_inputs[0], 0);
        assert_eq!(tx.input[1].previous_output, offers[0].location.outpoint());
        assert_eq!(tx.input[2].previous_output, offers[1].location.outpoint());

        // offer input i faces funding output i
        assert_eq!(tx.output[0].value, Amount::from_sat(546));
        assert_eq!(tx.output[1].value, Amount::from_sat(100_000));
        assert_eq!(tx.output[1].script_pubkey, offers[0].funding_receiver);
        assert_eq!(tx.output[2].value, Amount::from_sat(50_000));
        assert_eq!(tx.output[2].script_pubkey, offers[1].funding_receiver);

        let change = tx.output.last().unwrap();
        assert_eq!(change.script_pubkey, buyer.script_pubkey);
        assert!(change.value.to_sat() >= DUST_LIMIT);
        assert_eq!(Some(change.value), draft.change);

        assert!(draft.psbt.inputs[1].final_script_witness.is_some());
        assert_eq!(
            draft.psbt.inputs[1].sighash_type,
            Some(PsbtSighashType::from_u32(OFFER_SIGHASH))
        );
        assert_eq!(draft.sign_options().input_indexes, draft.buyer_inputs);
        assert_eq!(draft.sign_options().sighash, None);
    }

    #[test]
    fn test_split_purchase_edicts() {
        let offers: Vec<Offer> = (1..=3)
            .map(|i| test_offer(i, AddressType::P2tr, i, 100, 100.0))
            .collect();
        let indexer = TestIndexer::new();
        let config = config();

        // 300 units in outputs of 120: 120, 120, 60
        let draft = OrderAssembler::new(&indexer, &config)
            .assemble_token(&revalidated(offers), &buyer(), &receiver(), &buyer_pool(), rate(), Some(120))
            .unwrap();
        let tx = &draft.psbt.unsigned_tx;

        let expected = Runestone {
            edicts: vec![
                Edict { id: test_rune_id(), amount: 120, output: 4 },
                Edict { id: test_rune_id(), amount: 120, output: 5 },
                Edict { id: test_rune_id(), amount: 60, output: 6 },
            ],
            pointer: Some(4),
            ..Default::default()
        };
        assert_eq!(tx.output[0].script_pubkey, expected.encipher());
        assert_eq!(tx.output[0].value, Amount::ZERO);

        let receiver_script = test_account(21, AddressType::P2tr).script_pubkey;
        for output in &tx.output[4..7] {
            assert_eq!(output.script_pubkey, receiver_script);
            assert_eq!(output.value, Amount::from_sat(546));
        }
        assert_eq!(tx.output.len(), 8);
        expected.check_outputs(tx.output.len()).unwrap();
    }

    #[test]
    fn test_split_into_one_output_is_plain() {
        let offers = vec![test_offer(1, AddressType::P2tr, 1, 100, 100.0)];
        let indexer = TestIndexer::new();
        let config = config();

        let draft = OrderAssembler::new(&indexer, &config)
            .assemble_token(&revalidated(offers), &buyer(), &receiver(), &buyer_pool(), rate(), Some(100))
            .unwrap();
        assert_eq!(draft.psbt.unsigned_tx.output[0].value, Amount::from_sat(546));
        assert!(!draft.psbt.unsigned_tx.output[0].script_pubkey.is_op_return());
    }

    #[test]
    fn test_insufficient_buyer_funds() {
        let offers = vec![test_offer(1, AddressType::P2tr, 1, 100, 1000.0)];
        let indexer = TestIndexer::new();
        let config = config();

        let result = OrderAssembler::new(&indexer, &config).assemble_token(
            &revalidated(offers),
            &buyer(),
            &receiver(),
            &[test_utxo(100, 20_000)],
            rate(),
            None,
        );
        assert!(matches!(
            result,
            Err(MarketError::InsufficientFunds { available, .. }) if available == 20_000 + 546
        ));
    }

    #[test]
    fn test_collection_layout() {
        let offer = test_collection_offer(1, AddressType::P2tr, 1, 2, 20_000.0);
        let indexer = TestIndexer::new();
        let config = config();
        let buyer = buyer();
        let padding = vec![test_utxo(110, 600), test_utxo(111, 600)];
        let mut pool = buyer_pool();
        pool.extend(padding.clone());

        let draft = OrderAssembler::new(&indexer, &config)
            .assemble_collection(&revalidated(vec![offer.clone()]), &buyer, &receiver(), &padding, &pool, rate())
            .unwrap();
        let tx = &draft.psbt.unsigned_tx;

        assert_eq!(tx.input[0].previous_output, padding[0].outpoint());
        assert_eq!(tx.input[1].previous_output, padding[1].outpoint());
        assert_eq!(tx.input[2].previous_output, offer.inscription.as_ref().unwrap().location);
        assert_eq!(tx.input[3].previous_output, offer.location.outpoint());
        assert_eq!(draft.offer_inputs, vec![2, 3]);
        assert_eq!(&draft.buyer_inputs[..2], &[0, 1]);
        assert!(draft.buyer_inputs[2..].iter().all(|&i| i >= 4));

        assert_eq!(tx.output[0].value, Amount::from_sat(1_200));
        assert_eq!(tx.output[0].script_pubkey, buyer.script_pubkey);
        assert_eq!(tx.output[1].value, Amount::from_sat(546));
        assert_eq!(tx.output[2].value, Amount::from_sat(10_000));
        assert_eq!(tx.output[3].value, Amount::from_sat(10_000));
        assert_eq!(
            tx.output[4].script_pubkey,
            Runestone::transfer(test_rune_id(), 1, [1]).encipher()
        );
        // padding never pays fees
        assert!(!tx.input[4..]
            .iter()
            .any(|input| padding.iter().any(|pad| pad.outpoint() == input.previous_output)));
    }

    #[test]
    fn test_collection_needs_padding() {
        let offer = test_collection_offer(1, AddressType::P2tr, 1, 1, 20_000.0);
        let indexer = TestIndexer::new();
        let config = config();

        let result = OrderAssembler::new(&indexer, &config).assemble_collection(
            &revalidated(vec![offer]),
            &buyer(),
            &receiver(),
            &[test_utxo(110, 600)],
            &buyer_pool(),
            rate(),
        );
        assert!(matches!(result, Err(MarketError::Validation(_))));
    }

    #[tokio::test]
    async fn test_fragments_compose_with_extra_inputs_and_outputs() {
        // three offers from different sellers and address types, three
        // buyer fee inputs, extra outputs beyond the offer pairs
        let offers = vec![
            test_offer(1, AddressType::P2tr, 1, 100, 1000.0),
            test_offer(2, AddressType::P2wpkh, 2, 200, 500.0),
            test_offer(3, AddressType::P2sh, 3, 300, 400.0),
        ];
        let indexer = TestIndexer::new();
        let config = config();
        let buyer = buyer();
        let pool: Vec<Utxo> = (0..3).map(|i| test_utxo(100 + i, 120_000)).collect();

        let assembler = OrderAssembler::new(&indexer, &config);
        let draft = assembler
            .assemble_token(&revalidated(offers), &buyer, &receiver(), &pool, rate(), Some(150))
            .unwrap();
        assert_eq!(draft.buyer_inputs.len(), 3);
        assert!(draft.psbt.unsigned_tx.output.len() > 4);

        let signed = TestSigner { key_index: 20 }
            .sign_psbt(&draft.psbt_hex(), draft.sign_options())
            .await
            .unwrap();
        let tx = assembler.finalize(&draft, &signed).unwrap();

        assert_eq!(tx.input.len(), 6);
        assert!(tx.input.iter().all(|input| !input.witness.is_empty()));
        assert!(!tx.input[3].script_sig.is_empty());
    }

    #[tokio::test]
    async fn test_tampered_funding_output_fails_finalize() {
        let offers = vec![test_offer(1, AddressType::P2tr, 1, 100, 1000.0)];
        let indexer = TestIndexer::new();
        let config = config();
        let assembler = OrderAssembler::new(&indexer, &config);

        let mut draft = assembler
            .assemble_token(&revalidated(offers), &buyer(), &receiver(), &buyer_pool(), rate(), None)
            .unwrap();
        draft.psbt.unsigned_tx.output[1].value = Amount::from_sat(1_000);

        let signed = TestSigner { key_index: 20 }
            .sign_psbt(&draft.psbt_hex(), draft.sign_options())
            .await
            .unwrap();
        assert!(matches!(
            assembler.finalize(&draft, &signed),
            Err(MarketError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_unsigned_buyer_input_fails_finalize() {
        let offers = vec![test_offer(1, AddressType::P2tr, 1, 100, 1000.0)];
        let indexer = TestIndexer::new();
        let config = config();
        let assembler = OrderAssembler::new(&indexer, &config);

        let draft = assembler
            .assemble_token(&revalidated(offers), &buyer(), &receiver(), &buyer_pool(), rate(), None)
            .unwrap();
        assert!(matches!(
            assembler.finalize(&draft, &draft.psbt_hex()),
            Err(MarketError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_purchase_marks_offers_sold() {
        let mut book: Vec<Offer> = (1..=3)
            .map(|i| test_offer(i, AddressType::P2tr, i, 100, 1000.0))
            .collect();
        let buyer = buyer();
        let indexer = TestIndexer::new()
            .with_offers(&book)
            .with_utxos(&buyer.address, buyer_pool());
        // sold elsewhere after listing
        indexer.set_balance(book[2].location.outpoint(), vec![]);

        let config = config();
        let request = PurchaseRequest {
            buyer: buyer.clone(),
            item_receiver: receiver(),
            fee_rate: None,
            kind: PurchaseKind::Token { split_amount: None },
            pending: PendingOutputs::default(),
        };
        let broadcaster = TestBroadcaster::default();

        let purchase = OrderAssembler::new(&indexer, &config)
            .purchase(&request, &mut book, &TestSigner { key_index: 20 }, &broadcaster)
            .await
            .unwrap();

        assert_eq!(purchase.order.offers.len(), 2);
        assert_eq!(purchase.invalid_locations, vec![book[2].location_key()]);
        assert_eq!(book[0].status, OfferStatus::Sold);
        assert_eq!(book[1].status, OfferStatus::Sold);
        assert_eq!(book[2].status, OfferStatus::Active);

        let sent = broadcaster.broadcasts.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(purchase.order.txid, sent[0].compute_txid());

        let change = purchase.pending.created.last().unwrap();
        assert_eq!(change.txid, purchase.order.txid);
        assert!(change.value >= DUST_LIMIT);
    }

    #[tokio::test]
    async fn test_rejected_broadcast_cancels_offers() {
        let mut book = vec![test_offer(1, AddressType::P2tr, 1, 100, 1000.0)];
        let buyer = buyer();
        let indexer = TestIndexer::new()
            .with_offers(&book)
            .with_utxos(&buyer.address, buyer_pool());

        let config = config();
        let request = PurchaseRequest {
            buyer,
            item_receiver: receiver(),
            fee_rate: Some(rate()),
            kind: PurchaseKind::Token { split_amount: None },
            pending: PendingOutputs::default(),
        };

        let result = OrderAssembler::new(&indexer, &config)
            .purchase(
                &request,
                &mut book,
                &TestSigner { key_index: 20 },
                &TestBroadcaster::rejecting("txn-mempool-conflict"),
            )
            .await;

        assert!(matches!(result, Err(MarketError::BroadcastRejected(_))));
        assert_eq!(book[0].status, OfferStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_collection_purchase() {
        let offer = test_collection_offer(1, AddressType::P2wpkh, 1, 2, 20_000.0);
        let mut book = vec![offer];
        let buyer = buyer();
        let padding = vec![test_utxo(110, 600), test_utxo(111, 600)];
        let indexer = TestIndexer::new()
            .with_offers(&book)
            .with_utxos(&buyer.address, buyer_pool());

        let config = config();
        let request = PurchaseRequest {
            buyer: buyer.clone(),
            item_receiver: receiver(),
            fee_rate: Some(rate()),
            kind: PurchaseKind::Collection {
                padding: padding.clone(),
            },
            pending: PendingOutputs {
                created: padding,
                spent: vec![],
            },
        };
        let broadcaster = TestBroadcaster::default();

        let purchase = OrderAssembler::new(&indexer, &config)
            .purchase(&request, &mut book, &TestSigner { key_index: 20 }, &broadcaster)
            .await
            .unwrap();

        assert_eq!(book[0].status, OfferStatus::Sold);
        // merged padding output comes back to the buyer
        assert_eq!(purchase.pending.created[0].vout, 0);
        assert_eq!(purchase.pending.created[0].value, 1_200);
        assert_eq!(purchase.pending.spent.len(), broadcaster.broadcasts.lock().unwrap()[0].input.len());
    }
}
