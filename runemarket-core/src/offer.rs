//! # Offers
//!
//! A seller lists rune balances by pre-signing *fragments*: each seller
//! input faces exactly one funding output paying the seller, and every input
//! is signed with SIGHASH_SINGLE|ANYONECANPAY (0x83). The signature then
//! commits only to its own input and the output at the same index, so any
//! buyer can later splice the fragment into a larger transaction.

use bitcoin::{
    absolute::LockTime,
    psbt::{self, Psbt, PsbtSighashType},
    transaction::Version,
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    account::AccountKeys,
    error::Result,
    indexer::{RuneBalance, SignOptions, TokenUtxo},
    rune_id::RuneId,
    utils::{location_id, unix_now, whole_units},
    utxo::Utxo,
    MarketError, ValidationError, DUST_LIMIT, OFFER_SIGHASH,
};

/// Lifecycle of an offer. Offers only ever leave `Active`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(into = "u8", try_from = "u8")]
pub enum OfferStatus {
    Active = 1,
    Cancelled = 2,
    Sold = 3,
}

impl OfferStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Move to `next`; only transitions out of `Active` are allowed.
    pub fn transition(self, next: OfferStatus) -> Result<OfferStatus> {
        match (self, next) {
            (OfferStatus::Active, OfferStatus::Cancelled | OfferStatus::Sold) => Ok(next),
            (current, next) => Err(ValidationError::BadRequest(format!(
                "offer cannot move from {current:?} to {next:?}"
            ))
            .into()),
        }
    }
}

impl From<OfferStatus> for u8 {
    fn from(status: OfferStatus) -> Self {
        status.code()
    }
}

impl TryFrom<u8> for OfferStatus {
    type Error = MarketError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Active),
            2 => Ok(Self::Cancelled),
            3 => Ok(Self::Sold),
            other => Err(ValidationError::BadRequest(format!("unknown offer status {other}")).into()),
        }
    }
}

/// Inscription sold together with a rune balance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InscriptionRef {
    pub inscription_id: String,
    pub location: OutPoint,
    pub value: u64,
}

/// A listed, signed offer as handed to the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Offer {
    /// sha256 of the asset location (`txid:vout`)
    pub id: String,
    /// Seller address
    pub lister: String,
    pub rune_id: RuneId,
    pub rune_name: String,
    pub spaced_rune_name: String,
    pub symbol: Option<char>,
    /// Whole token units on sale
    pub amount: u128,
    pub divisibility: u8,
    /// Price per whole unit in sats
    pub unit_price: f64,
    /// Sum of the funding outputs in sats
    pub total_price: u64,
    pub funding_receiver: ScriptBuf,
    /// Asset input location and value
    pub location: Utxo,
    pub inscription: Option<InscriptionRef>,
    /// Fragment without signatures, used to re-list at a new price
    pub unsigned_fragment: String,
    /// Fragment with finalized seller inputs
    pub signed_fragment: String,
    pub status: OfferStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Offer {
    pub fn fragment(&self) -> Result<OfferFragment> {
        OfferFragment::from_hex(&self.signed_fragment)
    }

    pub fn location_key(&self) -> String {
        self.location.outpoint().to_string()
    }

    /// Apply a status transition and touch `updated_at`.
    pub fn set_status(&mut self, status: OfferStatus) -> Result<()> {
        self.status = self.status.transition(status)?;
        self.updated_at = unix_now();
        Ok(())
    }
}

/// One seller input together with the funding output at the same index.
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentInput {
    pub previous_output: OutPoint,
    pub sequence: Sequence,
    pub input: psbt::Input,
    pub funding: TxOut,
}

impl FragmentInput {
    /// Value of the spent output.
    pub fn value(&self) -> Amount {
        self.input
            .witness_utxo
            .as_ref()
            .map_or(Amount::ZERO, |utxo| utxo.value)
    }

    pub fn txin(&self) -> TxIn {
        TxIn {
            previous_output: self.previous_output,
            script_sig: ScriptBuf::new(),
            sequence: self.sequence,
            witness: Witness::new(),
        }
    }

    fn without_signatures(&self) -> Self {
        Self {
            input: psbt::Input {
                witness_utxo: self.input.witness_utxo.clone(),
                ..Default::default()
            },
            ..self.clone()
        }
    }
}

/// Shape of an offer fragment.
#[derive(Clone, Debug, PartialEq)]
pub enum OfferFragment {
    /// A rune balance, possibly with an inscription at the same location
    Single(FragmentInput),
    /// Inscription input first, then the rune balance input
    Bundled(FragmentInput, FragmentInput),
}

impl OfferFragment {
    /// Split a one or two input fragment PSBT into its parts.
    pub fn from_psbt(psbt: &Psbt) -> Result<Self> {
        let mut parts = fragment_inputs(psbt)?;

        match parts.len() {
            1 => Ok(Self::Single(parts.remove(0))),
            2 => {
                let asset = parts.remove(1);
                let inscription = parts.remove(0);
                Ok(Self::Bundled(inscription, asset))
            }
            n => Err(ValidationError::InvalidFragment(format!(
                "offer fragment must have 1 or 2 inputs, found {n}"
            ))
            .into()),
        }
    }

    pub fn from_hex(psbt_hex: &str) -> Result<Self> {
        Self::from_psbt(&Psbt::deserialize(&hex::decode(psbt_hex)?)?)
    }

    /// Inputs in transaction order.
    pub fn inputs(&self) -> Vec<&FragmentInput> {
        match self {
            Self::Single(asset) => vec![asset],
            Self::Bundled(inscription, asset) => vec![inscription, asset],
        }
    }

    /// The input carrying the rune balance.
    pub fn asset(&self) -> &FragmentInput {
        match self {
            Self::Single(asset) | Self::Bundled(_, asset) => asset,
        }
    }

    /// Separate inscription input, if any.
    pub fn inscription(&self) -> Option<&FragmentInput> {
        match self {
            Self::Single(_) => None,
            Self::Bundled(inscription, _) => Some(inscription),
        }
    }

    pub fn total_price(&self) -> Amount {
        self.inputs().iter().map(|part| part.funding.value).sum()
    }

    /// Same fragment with all signing data removed.
    pub fn unsigned(&self) -> Self {
        match self {
            Self::Single(asset) => Self::Single(asset.without_signatures()),
            Self::Bundled(inscription, asset) => {
                Self::Bundled(inscription.without_signatures(), asset.without_signatures())
            }
        }
    }

    pub fn to_psbt(&self) -> Result<Psbt> {
        fragment_psbt(self.inputs().into_iter().cloned())
    }

    pub fn to_hex(&self) -> Result<String> {
        Ok(self.to_psbt()?.serialize_hex())
    }
}

/// Pair every input of a fragment PSBT with its funding output.
pub fn fragment_inputs(psbt: &Psbt) -> Result<Vec<FragmentInput>> {
    let tx = &psbt.unsigned_tx;

    if tx.input.is_empty() || tx.output.is_empty() {
        return Err(ValidationError::EmptyPsbt.into());
    }

    if tx.input.len() != tx.output.len() {
        return Err(ValidationError::CountMismatch {
            inputs: tx.input.len(),
            outputs: tx.output.len(),
        }
        .into());
    }

    Ok(tx
        .input
        .iter()
        .zip(&psbt.inputs)
        .zip(&tx.output)
        .map(|((txin, input), funding)| FragmentInput {
            previous_output: txin.previous_output,
            sequence: txin.sequence,
            input: input.clone(),
            funding: funding.clone(),
        })
        .collect())
}

/// Assemble a fragment PSBT from its parts.
pub fn fragment_psbt(parts: impl IntoIterator<Item = FragmentInput>) -> Result<Psbt> {
    let parts: Vec<FragmentInput> = parts.into_iter().collect();

    let unsigned_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: parts.iter().map(FragmentInput::txin).collect(),
        output: parts.iter().map(|part| part.funding.clone()).collect(),
    };

    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx)?;
    for (slot, part) in psbt.inputs.iter_mut().zip(parts) {
        *slot = part.input;
    }

    Ok(psbt)
}

/// Inscription to list together with a rune balance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InscriptionItem {
    pub inscription_id: String,
    pub utxo: Utxo,
}

/// A rune balance to list, optionally carrying an inscription.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ListingItem {
    pub asset: TokenUtxo,
    pub inscription: Option<InscriptionItem>,
}

impl ListingItem {
    pub fn token(asset: TokenUtxo) -> Self {
        Self {
            asset,
            inscription: None,
        }
    }

    /// Whole units this item puts on sale.
    pub fn amount(&self) -> u128 {
        if self.inscription.is_some() {
            1
        } else {
            let RuneBalance {
                amount,
                divisibility,
                ..
            } = self.asset.balance;
            whole_units(amount, divisibility)
        }
    }

    fn inscription_apart(&self) -> Option<&InscriptionItem> {
        self.inscription
            .as_ref()
            .filter(|inscription| inscription.utxo.outpoint() != self.asset.utxo.outpoint())
    }
}

/// Funding value for `amount` units at `unit_price`, split over `outputs`
/// funding outputs and rounded up.
pub fn funding_value(amount: u128, unit_price: f64, outputs: u32) -> u64 {
    (amount as f64 * unit_price / f64::from(outputs)).ceil() as u64
}

/// A funding output must clear `dust_limit` and be worth more than every
/// output it is paired with.
pub(crate) fn check_funding(
    spent: impl IntoIterator<Item = (OutPoint, Amount)>,
    value: Amount,
    dust_limit: Amount,
) -> Result<()> {
    if value < dust_limit {
        return Err(MarketError::DustOutput {
            value: value.to_sat(),
            limit: dust_limit.to_sat(),
        });
    }

    for (outpoint, spent_value) in spent {
        if spent_value >= value {
            return Err(ValidationError::InvalidFragment(format!(
                "input {outpoint} of {} sats is not below its funding output of {} sats",
                spent_value.to_sat(),
                value.to_sat()
            ))
            .into());
        }
    }

    Ok(())
}

/// Builds unsigned offer fragments for one seller.
#[derive(Debug, Clone)]
pub struct OfferBuilder<'a> {
    seller: &'a AccountKeys,
    dust_limit: Amount,
}

impl<'a> OfferBuilder<'a> {
    pub fn new(seller: &'a AccountKeys) -> Self {
        Self {
            seller,
            dust_limit: Amount::from_sat(DUST_LIMIT),
        }
    }

    pub fn dust_limit(mut self, dust_limit: Amount) -> Self {
        self.dust_limit = dust_limit;
        self
    }

    fn seller_input(&self, utxo: &Utxo, funding: TxOut) -> FragmentInput {
        let mut input = psbt::Input {
            witness_utxo: Some(TxOut {
                value: utxo.amount(),
                script_pubkey: self.seller.script_pubkey.clone(),
            }),
            sighash_type: Some(PsbtSighashType::from_u32(OFFER_SIGHASH)),
            ..Default::default()
        };
        self.seller.apply_input_extras(&mut input);

        FragmentInput {
            previous_output: utxo.outpoint(),
            sequence: Sequence::MAX,
            input,
            funding,
        }
    }

    /// Fragment parts for one item.
    fn item_inputs(
        &self,
        item: &ListingItem,
        unit_price: f64,
        funding_receiver: &ScriptBuf,
    ) -> Result<Vec<FragmentInput>> {
        let amount = item.amount();
        if amount == 0 {
            return Err(ValidationError::BadRequest(format!(
                "{} holds no whole units to list",
                item.asset.utxo.outpoint()
            ))
            .into());
        }

        let apart = item.inscription_apart();
        let outputs = if apart.is_some() { 2 } else { 1 };
        let value = Amount::from_sat(funding_value(amount, unit_price, outputs));

        let spent = std::iter::once(&item.asset.utxo).chain(apart.map(|i| &i.utxo));
        check_funding(
            spent.map(|utxo| (utxo.outpoint(), utxo.amount())),
            value,
            self.dust_limit,
        )?;

        let funding = TxOut {
            value,
            script_pubkey: funding_receiver.clone(),
        };

        let mut parts = Vec::new();
        if let Some(inscription) = apart {
            parts.push(self.seller_input(&inscription.utxo, funding.clone()));
        }
        parts.push(self.seller_input(&item.asset.utxo, funding));

        Ok(parts)
    }

    /// Unsigned PSBT listing every item at `unit_price`.
    pub fn build(
        &self,
        items: &[ListingItem],
        unit_price: f64,
        funding_receiver: &ScriptBuf,
    ) -> Result<Psbt> {
        if items.is_empty() {
            return Err(ValidationError::BadRequest("nothing to list".to_string()).into());
        }
        if !unit_price.is_finite() || unit_price <= 0.0 {
            return Err(ValidationError::BadRequest(format!("invalid unit price {unit_price}")).into());
        }

        let mut parts = Vec::new();
        for item in items {
            parts.extend(self.item_inputs(item, unit_price, funding_receiver)?);
        }

        debug!(
            items = items.len(),
            inputs = parts.len(),
            unit_price,
            "built offer psbt"
        );

        fragment_psbt(parts)
    }

    /// Re-price an existing offer. The spent outputs (and therefore the
    /// offer id) are reused from its unsigned fragment.
    pub fn edit(&self, offer: &Offer, unit_price: f64, funding_receiver: &ScriptBuf) -> Result<Psbt> {
        if !unit_price.is_finite() || unit_price <= 0.0 {
            return Err(ValidationError::BadRequest(format!("invalid unit price {unit_price}")).into());
        }

        let fragment = OfferFragment::from_hex(&offer.unsigned_fragment)?;
        let outputs = fragment.inputs().len() as u32;
        let value = Amount::from_sat(funding_value(offer.amount, unit_price, outputs));

        check_funding(
            fragment.inputs().into_iter().map(|part| (part.previous_output, part.value())),
            value,
            self.dust_limit,
        )?;

        let parts = fragment.inputs().into_iter().map(|part| {
            let mut input = psbt::Input {
                witness_utxo: part.input.witness_utxo.clone(),
                sighash_type: Some(PsbtSighashType::from_u32(OFFER_SIGHASH)),
                ..Default::default()
            };
            self.seller.apply_input_extras(&mut input);

            FragmentInput {
                previous_output: part.previous_output,
                sequence: part.sequence,
                input,
                funding: TxOut {
                    value,
                    script_pubkey: funding_receiver.clone(),
                },
            }
        });

        fragment_psbt(parts)
    }
}

/// What the seller's wallet must do with an offer PSBT.
pub fn offer_sign_options(psbt: &Psbt) -> SignOptions {
    SignOptions {
        sighash: Some(PsbtSighashType::from_u32(OFFER_SIGHASH)),
        input_indexes: (0..psbt.inputs.len()).collect(),
        finalize: false,
    }
}

/// Message a lister signs to withdraw offers.
pub fn unlist_message(offer_ids: &[String], address: &str) -> String {
    format!("unlist offers {} by {}", offer_ids.join(","), address)
}

/// Cancel the offers listed by `address`. Offers of other listers are left
/// alone and reported back, as are offers no longer active.
pub fn unlist(offers: &mut [Offer], address: &str) -> Vec<String> {
    let mut skipped = Vec::new();

    for offer in offers.iter_mut() {
        if offer.lister != address || offer.set_status(OfferStatus::Cancelled).is_err() {
            skipped.push(offer.id.clone());
        }
    }

    skipped
}

/// Offer id for a fragment: the location id of its asset input.
pub fn fragment_id(fragment: &OfferFragment) -> String {
    location_id(&fragment.asset().previous_output)
}
