//! Validation of signed offer submissions.
//!
//! A submission is checked against the live indexer state before any offer
//! is created from it: the lister must own every input, every signature
//! must verify under SIGHASH_SINGLE|ANYONECANPAY, and the spent outputs must
//! still hold exactly the claimed assets. Accepted inputs are finalized and
//! split into one offer per asset.

use bitcoin::{psbt::PsbtSighashType, Amount, Network, OutPoint, Psbt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::Result,
    indexer::{RuneBalance, RuneIndexer, RuneInfo, TokenUtxo},
    offer::{
        check_funding, fragment_inputs, fragment_psbt, funding_value, FragmentInput, InscriptionRef, Offer,
        OfferFragment, OfferStatus,
    },
    rune_id::RuneId,
    signature::{finalize_input, verify_input, SighashPolicy},
    utils::{location_id, parse_address, unix_now, whole_units},
    utxo::Utxo,
    MarketError, ValidationError, DUST_LIMIT, OFFER_SIGHASH,
};

/// What a submission lists.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OfferKind {
    /// One offer per input, each a plain rune balance
    Token,
    /// A single offer for an inscription bundled with one rune unit
    Collection { inscription_id: String },
}

/// Signed listing as posted by a seller.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OfferSubmission {
    /// Signed, non-finalized PSBT hex
    pub psbt: String,
    pub address: String,
    pub rune_id: RuneId,
    pub unit_price: f64,
    #[serde(flatten)]
    pub kind: OfferKind,
}

/// The single rune balance a location must hold, checked against `rune_id`.
pub(crate) fn single_rune_balance(
    balances: &[RuneBalance],
    rune_id: RuneId,
    location: &OutPoint,
) -> Result<RuneBalance> {
    match balances {
        [balance] if balance.rune_id == rune_id => Ok(balance.clone()),
        [balance] => Err(MarketError::AssetMismatch(format!(
            "{location} holds rune {} instead of {rune_id}",
            balance.rune_id
        ))),
        [] => Err(MarketError::AssetMismatch(format!(
            "{location} holds no runes"
        ))),
        many => Err(MarketError::AssetMismatch(format!(
            "{location} holds {} runes",
            many.len()
        ))),
    }
}

/// Checks offer submissions against the indexer.
pub struct OfferValidator<'a, I: RuneIndexer + ?Sized> {
    indexer: &'a I,
    network: Network,
    dust_limit: Amount,
}

impl<'a, I: RuneIndexer + ?Sized> OfferValidator<'a, I> {
    pub fn new(indexer: &'a I, network: Network) -> Self {
        Self {
            indexer,
            network,
            dust_limit: Amount::from_sat(DUST_LIMIT),
        }
    }

    pub fn dust_limit(mut self, dust_limit: Amount) -> Self {
        self.dust_limit = dust_limit;
        self
    }

    /// Validate `submission` and return the offers it creates, all
    /// `Active`, with finalized seller inputs.
    pub async fn validate(&self, submission: &OfferSubmission) -> Result<Vec<Offer>> {
        let lister = parse_address(&submission.address, self.network)?;
        if !submission.unit_price.is_finite() || submission.unit_price <= 0.0 {
            return Err(ValidationError::BadRequest(format!(
                "invalid unit price {}",
                submission.unit_price
            ))
            .into());
        }

        let mut psbt = Psbt::deserialize(&hex::decode(&submission.psbt)?)?;
        let parts = fragment_inputs(&psbt)?;

        if let OfferKind::Collection { .. } = submission.kind {
            if parts.len() > 2 {
                return Err(ValidationError::InvalidFragment(format!(
                    "collection offer must have 1 or 2 inputs, found {}",
                    parts.len()
                ))
                .into());
            }
        }

        let (rune, token_utxos) = futures::try_join!(
            self.indexer.rune_info(submission.rune_id),
            self.indexer.list_token_utxos(&lister, submission.rune_id),
        )?;
        let rune = rune.ok_or_else(|| MarketError::RuneNotFound(submission.rune_id.to_string()))?;

        for (index, part) in parts.iter().enumerate() {
            let prevout = part
                .input
                .witness_utxo
                .as_ref()
                .ok_or(ValidationError::MissingWitnessUtxo(index))?;

            if prevout.script_pubkey != lister.script_pubkey() {
                return Err(MarketError::OwnershipMismatch(format!(
                    "input {index} is not owned by {}",
                    submission.address
                )));
            }

            verify_input(&psbt, index, SighashPolicy::Offer)?;
        }

        let offers = match &submission.kind {
            OfferKind::Token => {
                let mut balances = Vec::with_capacity(parts.len());
                for part in &parts {
                    let balance = self.check_asset(part, &token_utxos, submission.rune_id).await?;
                    let amount = whole_units(balance.amount, rune.divisibility);
                    self.check_price(std::slice::from_ref(part), amount, submission.unit_price)?;
                    balances.push(balance);
                }

                finalize_all(&mut psbt)?;
                let finalized = fragment_inputs(&psbt)?;

                finalized
                    .into_iter()
                    .zip(parts)
                    .zip(balances)
                    .map(|((signed, unsigned), balance)| {
                        let amount = whole_units(balance.amount, rune.divisibility);
                        self.offer(
                            submission,
                            &rune,
                            amount,
                            OfferFragment::Single(unsigned),
                            OfferFragment::Single(signed),
                            None,
                        )
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            OfferKind::Collection { inscription_id } => {
                let asset = parts.last().ok_or(ValidationError::EmptyPsbt)?;
                self.check_asset(asset, &token_utxos, submission.rune_id).await?;
                self.check_price(&parts, 1, submission.unit_price)?;

                let carrier = &parts[0];
                let location = self.indexer.inscription_location(inscription_id).await?;
                if location != Some(carrier.previous_output) {
                    return Err(MarketError::InscriptionMismatch(format!(
                        "inscription {inscription_id} is not at {}",
                        carrier.previous_output
                    )));
                }
                let inscription = InscriptionRef {
                    inscription_id: inscription_id.clone(),
                    location: carrier.previous_output,
                    value: carrier.value().to_sat(),
                };

                finalize_all(&mut psbt)?;
                let signed = OfferFragment::from_psbt(&psbt)?;
                let unsigned = OfferFragment::from_psbt(&fragment_psbt(parts)?)?.unsigned();

                vec![self.offer(submission, &rune, 1, unsigned, signed, Some(inscription))?]
            }
        };

        info!(
            lister = %submission.address,
            rune_id = %submission.rune_id,
            offers = offers.len(),
            "offer submission accepted"
        );

        Ok(offers)
    }

    /// The asset input must be one of the lister's rune outputs (same
    /// location and value) and hold exactly one rune, the listed one.
    async fn check_asset(
        &self,
        part: &FragmentInput,
        token_utxos: &[TokenUtxo],
        rune_id: RuneId,
    ) -> Result<RuneBalance> {
        let location = part.previous_output;
        let owned = token_utxos.iter().any(|token| {
            token.utxo.outpoint() == location && token.utxo.amount() == part.value()
        });
        if !owned {
            return Err(MarketError::AssetNotOwned(format!(
                "{location} is not a rune output of the lister"
            )));
        }

        let balances = self.indexer.utxo_balance(location).await?;
        let balance = single_rune_balance(&balances, rune_id, &location)?;
        debug!(%location, amount = %balance.amount, "asset input checked");
        Ok(balance)
    }

    /// The signed funding outputs of one offer must pay exactly
    /// `amount × unit_price` (rounded up, shared evenly) to a standard output
    /// worth more than what it is paired with.
    fn check_price(&self, parts: &[FragmentInput], amount: u128, unit_price: f64) -> Result<()> {
        let expected = Amount::from_sat(funding_value(amount, unit_price, parts.len() as u32));

        for part in parts {
            check_funding(
                [(part.previous_output, part.value())],
                part.funding.value,
                self.dust_limit,
            )?;

            if part.funding.value != expected {
                return Err(ValidationError::InvalidFragment(format!(
                    "funding output for {} pays {} sats, expected {} sats",
                    part.previous_output,
                    part.funding.value.to_sat(),
                    expected.to_sat()
                ))
                .into());
            }
        }

        Ok(())
    }

    fn offer(
        &self,
        submission: &OfferSubmission,
        rune: &RuneInfo,
        amount: u128,
        unsigned: OfferFragment,
        signed: OfferFragment,
        inscription: Option<InscriptionRef>,
    ) -> Result<Offer> {
        let asset = signed.asset();
        let location = Utxo::new(asset.previous_output, asset.value().to_sat());
        let now = unix_now();

        Ok(Offer {
            id: location_id(&asset.previous_output),
            lister: submission.address.clone(),
            rune_id: submission.rune_id,
            rune_name: rune.name.clone(),
            spaced_rune_name: rune.spaced_name.clone(),
            symbol: rune.symbol,
            amount,
            divisibility: rune.divisibility,
            unit_price: submission.unit_price,
            total_price: signed.total_price().to_sat(),
            funding_receiver: asset.funding.script_pubkey.clone(),
            location,
            inscription,
            unsigned_fragment: unsigned.unsigned().to_hex()?,
            signed_fragment: signed.to_hex()?,
            status: OfferStatus::Active,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Finalize every input, keeping the 0x83 marker so buyers can tell the
/// fragment's sighash without parsing the witness.
fn finalize_all(psbt: &mut Psbt) -> Result<()> {
    for index in 0..psbt.inputs.len() {
        finalize_input(psbt, index)?;
        psbt.inputs[index].sighash_type = Some(PsbtSighashType::from_u32(OFFER_SIGHASH));
    }
    Ok(())
}
