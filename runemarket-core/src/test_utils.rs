//! Common test utilities for runemarket-core tests.
//!
//! Keys are derived deterministically from a one-byte index, and the
//! in-memory indexer, signer and broadcaster sign and check with real
//! secp256k1 keys so offers and orders can be verified end to end.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::{
    ecdsa,
    hashes::Hash,
    key::{Keypair, TapTweak},
    psbt::{Psbt, PsbtSighashType},
    secp256k1::{Message, Secp256k1, SecretKey},
    sighash::{Prevouts, SighashCache},
    taproot, Address, Amount, CompressedPublicKey, EcdsaSighashType, Network, OutPoint,
    PublicKey, ScriptBuf, TapSighashType, Transaction, TxOut, Txid,
};

use crate::{
    account::{AccountKeys, AddressType},
    error::Result,
    indexer::{Broadcaster, PsbtSigner, RuneBalance, RuneIndexer, RuneInfo, SignOptions, TokenUtxo},
    offer::{fragment_psbt, InscriptionItem, InscriptionRef, ListingItem, Offer, OfferBuilder, OfferFragment, OfferStatus},
    rune_id::RuneId,
    signature::{finalize_input, prevouts},
    utils::{base_units, location_id, unix_now},
    utxo::Utxo,
    MarketError, OFFER_SIGHASH,
};

/// Txid used by fixtures that need any valid txid.
pub const TEST_TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

/// Deterministic secret key for `index`.
pub fn test_secret(index: u8) -> SecretKey {
    let mut secret_bytes = [0u8; 32];
    secret_bytes[0] = index;
    secret_bytes[31] = index;
    SecretKey::from_slice(&secret_bytes).unwrap()
}

/// Regtest account of `address_type` for the key at `index`.
pub fn test_account(index: u8, address_type: AddressType) -> AccountKeys {
    let secp = Secp256k1::new();
    let pubkey = CompressedPublicKey(test_secret(index).public_key(&secp));
    AccountKeys::new(pubkey, address_type, Network::Regtest)
}

pub fn test_rune_id() -> RuneId {
    RuneId::new(840000, 3).unwrap()
}

/// Output `index:0`, where the txid is `index` repeated.
pub fn test_utxo(index: u8, value: u64) -> Utxo {
    Utxo {
        txid: Txid::from_byte_array([index; 32]),
        vout: 0,
        value,
    }
}

pub fn test_token_utxo(index: u8, value: u64, raw_amount: u128, divisibility: u8) -> TokenUtxo {
    TokenUtxo {
        utxo: test_utxo(index, value),
        balance: RuneBalance {
            rune_id: test_rune_id(),
            amount: raw_amount,
            divisibility,
        },
    }
}

pub fn test_inscription_id(index: u8) -> String {
    format!("{}i0", test_utxo(index, 0).txid)
}

pub fn offer_sighash() -> Option<PsbtSighashType> {
    Some(PsbtSighashType::from_u32(OFFER_SIGHASH))
}

/// One input of `value` owned by account `index`, paying twice its value to
/// an unrelated account.
pub fn single_input_psbt(index: u8, address_type: AddressType, value: u64) -> (Psbt, AccountKeys) {
    let account = test_account(index, address_type);
    let utxo = test_utxo(index, value);

    let mut input = bitcoin::psbt::Input {
        witness_utxo: Some(TxOut {
            value: utxo.amount(),
            script_pubkey: account.script_pubkey.clone(),
        }),
        ..Default::default()
    };
    account.apply_input_extras(&mut input);

    let part = crate::offer::FragmentInput {
        previous_output: utxo.outpoint(),
        sequence: bitcoin::Sequence::MAX,
        input,
        funding: TxOut {
            value: Amount::from_sat(value * 2),
            script_pubkey: test_account(9, AddressType::P2tr).script_pubkey,
        },
    };

    (fragment_psbt([part]).unwrap(), account)
}

/// Sign `indexes` of `psbt` with the key at `key_index`, leaving the
/// signatures in the partial fields.
pub fn sign_inputs(psbt: &mut Psbt, key_index: u8, indexes: &[usize], sighash: Option<PsbtSighashType>) {
    let secp = Secp256k1::new();
    let secret = test_secret(key_index);
    let pubkey = PublicKey::new(secret.public_key(&secp));

    for &index in indexes {
        let prevout = psbt.inputs[index].witness_utxo.clone().unwrap();
        let mut cache = SighashCache::new(&psbt.unsigned_tx);

        match AddressType::from_script(&prevout.script_pubkey).unwrap() {
            AddressType::P2tr => {
                let sighash_type = sighash
                    .map(|ty| ty.taproot_hash_ty().unwrap())
                    .unwrap_or(TapSighashType::Default);
                let all;
                let prevouts = if matches!(
                    sighash_type,
                    TapSighashType::AllPlusAnyoneCanPay
                        | TapSighashType::NonePlusAnyoneCanPay
                        | TapSighashType::SinglePlusAnyoneCanPay
                ) {
                    Prevouts::One(index, prevout.clone())
                } else {
                    all = prevouts(psbt).unwrap();
                    Prevouts::All(&all)
                };
                let digest = cache
                    .taproot_key_spend_signature_hash(index, &prevouts, sighash_type)
                    .unwrap();

                let keypair = Keypair::from_secret_key(&secp, &secret)
                    .tap_tweak(&secp, None)
                    .to_inner();
                let signature = secp.sign_schnorr_no_aux_rand(
                    &Message::from_digest(digest.to_byte_array()),
                    &keypair,
                );
                psbt.inputs[index].tap_key_sig = Some(taproot::Signature {
                    signature,
                    sighash_type,
                });
            }
            address_type => {
                let sighash_type = sighash
                    .map(|ty| ty.ecdsa_hash_ty().unwrap())
                    .unwrap_or(EcdsaSighashType::All);
                let digest = if address_type == AddressType::P2pkh {
                    cache
                        .legacy_signature_hash(index, &prevout.script_pubkey, sighash_type.to_u32())
                        .unwrap()
                        .to_byte_array()
                } else {
                    let script_code = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash().unwrap());
                    cache
                        .p2wpkh_signature_hash(index, &script_code, prevout.value, sighash_type)
                        .unwrap()
                        .to_byte_array()
                };

                let signature = secp.sign_ecdsa(&Message::from_digest(digest), &secret);
                psbt.inputs[index].partial_sigs.insert(
                    pubkey,
                    ecdsa::Signature {
                        signature,
                        sighash_type,
                    },
                );
            }
        }
    }
}

/// Sign and finalize every input of a fragment PSBT, keeping the offer
/// sighash marker the way a validated offer stores it.
fn sign_fragment(psbt: &mut Psbt, key_index: u8) {
    let indexes: Vec<usize> = (0..psbt.inputs.len()).collect();
    sign_inputs(psbt, key_index, &indexes, offer_sighash());
    for index in indexes {
        finalize_input(psbt, index).unwrap();
        psbt.inputs[index].sighash_type = offer_sighash();
    }
}

fn offer_from_psbt(
    seller: &AccountKeys,
    unsigned: &Psbt,
    signed: &Psbt,
    amount: u128,
    unit_price: f64,
    inscription: Option<InscriptionRef>,
) -> Offer {
    let fragment = OfferFragment::from_psbt(signed).unwrap();
    let asset = fragment.asset();
    let now = unix_now();

    Offer {
        id: location_id(&asset.previous_output),
        lister: seller.address.to_string(),
        rune_id: test_rune_id(),
        rune_name: "TESTRUNE".to_string(),
        spaced_rune_name: "TEST•RUNE".to_string(),
        symbol: Some('T'),
        amount,
        divisibility: 0,
        unit_price,
        total_price: fragment.total_price().to_sat(),
        funding_receiver: asset.funding.script_pubkey.clone(),
        location: Utxo::new(asset.previous_output, asset.value().to_sat()),
        inscription,
        unsigned_fragment: OfferFragment::from_psbt(unsigned).unwrap().unsigned().to_hex().unwrap(),
        signed_fragment: fragment.to_hex().unwrap(),
        status: OfferStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

/// Active token offer of `amount` units at `utxo_index`, signed and
/// finalized by seller `seller_index`, paying the seller's own address.
pub fn test_offer(
    seller_index: u8,
    address_type: AddressType,
    utxo_index: u8,
    amount: u128,
    unit_price: f64,
) -> Offer {
    let seller = test_account(seller_index, address_type);
    let item = ListingItem::token(test_token_utxo(utxo_index, 546, amount, 0));

    let unsigned = OfferBuilder::new(&seller)
        .build(&[item], unit_price, &seller.script_pubkey)
        .unwrap();
    let mut signed = unsigned.clone();
    sign_fragment(&mut signed, seller_index);

    offer_from_psbt(&seller, &unsigned, &signed, amount, unit_price, None)
}

/// Active collection offer for one rune unit at `asset_index` plus an
/// inscription at `inscription_index`; the same index bundles nothing.
pub fn test_collection_offer(
    seller_index: u8,
    address_type: AddressType,
    asset_index: u8,
    inscription_index: u8,
    price: f64,
) -> Offer {
    let seller = test_account(seller_index, address_type);
    let asset = test_token_utxo(asset_index, 546, 1, 0);
    let inscription_utxo = if inscription_index == asset_index {
        asset.utxo.clone()
    } else {
        test_utxo(inscription_index, 546)
    };
    let item = ListingItem {
        asset,
        inscription: Some(InscriptionItem {
            inscription_id: test_inscription_id(inscription_index),
            utxo: inscription_utxo.clone(),
        }),
    };

    let unsigned = OfferBuilder::new(&seller)
        .build(&[item], price, &seller.script_pubkey)
        .unwrap();
    let mut signed = unsigned.clone();
    sign_fragment(&mut signed, seller_index);

    let inscription = InscriptionRef {
        inscription_id: test_inscription_id(inscription_index),
        location: inscription_utxo.outpoint(),
        value: inscription_utxo.value,
    };
    offer_from_psbt(&seller, &unsigned, &signed, 1, price, Some(inscription))
}

/// In-memory indexer. State sits behind mutexes so tests can move assets
/// after offers were listed.
pub struct TestIndexer {
    utxos: Mutex<HashMap<Address, Vec<Utxo>>>,
    token_utxos: Mutex<HashMap<Address, Vec<TokenUtxo>>>,
    balances: Mutex<HashMap<OutPoint, Vec<RuneBalance>>>,
    unavailable: Mutex<Vec<OutPoint>>,
    inscriptions: Mutex<HashMap<String, OutPoint>>,
    runes: Mutex<HashMap<RuneId, RuneInfo>>,
}

impl TestIndexer {
    /// Indexer that knows the test rune and nothing else.
    pub fn new() -> Self {
        let rune = RuneInfo {
            rune_id: test_rune_id(),
            name: "TESTRUNE".to_string(),
            spaced_name: "TEST•RUNE".to_string(),
            symbol: Some('T'),
            divisibility: 0,
        };

        Self {
            utxos: Mutex::default(),
            token_utxos: Mutex::default(),
            balances: Mutex::default(),
            unavailable: Mutex::default(),
            inscriptions: Mutex::default(),
            runes: Mutex::new(HashMap::from([(rune.rune_id, rune)])),
        }
    }

    pub fn without_rune_info(self) -> Self {
        self.runes.lock().unwrap().clear();
        self
    }

    pub fn with_utxos(self, address: &Address, utxos: Vec<Utxo>) -> Self {
        self.utxos.lock().unwrap().insert(address.clone(), utxos);
        self
    }

    /// Rune outputs of `address`; their balances become queryable too.
    pub fn with_token_utxos(self, address: &Address, token_utxos: Vec<TokenUtxo>) -> Self {
        {
            let mut balances = self.balances.lock().unwrap();
            for token in &token_utxos {
                balances
                    .entry(token.utxo.outpoint())
                    .or_default()
                    .push(token.balance.clone());
            }
        }
        self.token_utxos.lock().unwrap().insert(address.clone(), token_utxos);
        self
    }

    pub fn with_extra_balance(self, location: OutPoint, balance: RuneBalance) -> Self {
        self.balances.lock().unwrap().entry(location).or_default().push(balance);
        self
    }

    pub fn with_inscription(self, inscription_id: &str, location: OutPoint) -> Self {
        self.inscriptions
            .lock()
            .unwrap()
            .insert(inscription_id.to_string(), location);
        self
    }

    /// Live state matching `offers`: balances at their locations and
    /// inscriptions where the offers say they are.
    pub fn with_offers(self, offers: &[Offer]) -> Self {
        for offer in offers {
            self.set_balance(
                offer.location.outpoint(),
                vec![RuneBalance {
                    rune_id: offer.rune_id,
                    amount: base_units(offer.amount, offer.divisibility).unwrap(),
                    divisibility: offer.divisibility,
                }],
            );
            if let Some(inscription) = &offer.inscription {
                self.inscriptions
                    .lock()
                    .unwrap()
                    .insert(inscription.inscription_id.clone(), inscription.location);
            }
        }
        self
    }

    pub fn set_balance(&self, location: OutPoint, balances: Vec<RuneBalance>) {
        self.balances.lock().unwrap().insert(location, balances);
    }

    /// Balance lookups for `location` fail as if the service were down.
    pub fn set_unavailable(&self, location: OutPoint) {
        self.unavailable.lock().unwrap().push(location);
    }

    pub fn move_inscription(&self, inscription_id: &str, location: OutPoint) {
        self.inscriptions
            .lock()
            .unwrap()
            .insert(inscription_id.to_string(), location);
    }
}

#[async_trait]
impl RuneIndexer for TestIndexer {
    async fn list_utxos(&self, address: &Address) -> Result<Vec<Utxo>> {
        Ok(self.utxos.lock().unwrap().get(address).cloned().unwrap_or_default())
    }

    async fn list_token_utxos(&self, address: &Address, rune_id: RuneId) -> Result<Vec<TokenUtxo>> {
        Ok(self
            .token_utxos
            .lock()
            .unwrap()
            .get(address)
            .map(|tokens| {
                tokens
                    .iter()
                    .filter(|token| token.balance.rune_id == rune_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn utxo_balance(&self, location: OutPoint) -> Result<Vec<RuneBalance>> {
        if self.unavailable.lock().unwrap().contains(&location) {
            return Err(MarketError::ExternalService(format!("balance of {location} unavailable")));
        }
        Ok(self.balances.lock().unwrap().get(&location).cloned().unwrap_or_default())
    }

    async fn rune_info(&self, rune_id: RuneId) -> Result<Option<RuneInfo>> {
        Ok(self.runes.lock().unwrap().get(&rune_id).cloned())
    }

    async fn inscription_location(&self, inscription_id: &str) -> Result<Option<OutPoint>> {
        Ok(self.inscriptions.lock().unwrap().get(inscription_id).copied())
    }
}

/// Wallet holding the key at one index.
pub struct TestSigner {
    pub key_index: u8,
}

#[async_trait]
impl PsbtSigner for TestSigner {
    async fn sign_psbt(&self, psbt_hex: &str, options: SignOptions) -> Result<String> {
        let mut psbt = Psbt::deserialize(&hex::decode(psbt_hex)?)?;
        sign_inputs(&mut psbt, self.key_index, &options.input_indexes, options.sighash);
        if options.finalize {
            for &index in &options.input_indexes {
                finalize_input(&mut psbt, index)?;
            }
        }
        Ok(psbt.serialize_hex())
    }
}

/// Records every broadcast; rejects all of them when `reject` is set.
#[derive(Default)]
pub struct TestBroadcaster {
    pub reject: Option<String>,
    pub broadcasts: Mutex<Vec<Transaction>>,
}

impl TestBroadcaster {
    pub fn rejecting(reason: &str) -> Self {
        Self {
            reject: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Broadcaster for TestBroadcaster {
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid> {
        let tx: Transaction = bitcoin::consensus::deserialize(&hex::decode(raw_tx_hex)?)?;
        if let Some(reason) = &self.reject {
            return Err(MarketError::BroadcastRejected(reason.clone()));
        }
        let txid = tx.compute_txid();
        self.broadcasts.lock().unwrap().push(tx);
        Ok(txid)
    }
}
