//! Signature verification and input finalization for PSBTs.
//!
//! Offer inputs are signed once by the seller and later re-verified inside
//! the buyer's combined transaction, so verification reads the signature
//! from partial data (`partial_sigs`, `tap_key_sig`) or, for finalized
//! inputs, from the final witness or scriptSig.

use bitcoin::{
    ecdsa,
    hashes::Hash,
    key::Secp256k1,
    psbt::{self, Psbt},
    script::{Instruction, PushBytes},
    secp256k1::{Message, Verification},
    sighash::{Prevouts, SighashCache},
    taproot, CompressedPublicKey, PublicKey, ScriptBuf, TapSighashType, TxOut, Witness,
    XOnlyPublicKey,
};

use crate::{account::AddressType, error::Result, MarketError, ValidationError, OFFER_SIGHASH};

/// Sighash an input's signature must use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SighashPolicy {
    /// SIGHASH_SINGLE|ANYONECANPAY, required for offer inputs
    Offer,
    /// Whatever the signer chose
    Any,
}

impl SighashPolicy {
    fn check(self, index: usize, sighash: u32) -> Result<()> {
        match self {
            Self::Offer if sighash != OFFER_SIGHASH => Err(MarketError::SignatureInvalid(format!(
                "input {index} signed with sighash {sighash:#04x}, expected {OFFER_SIGHASH:#04x}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Witness UTXO of every input, in order.
pub fn prevouts(psbt: &Psbt) -> Result<Vec<TxOut>> {
    psbt.inputs
        .iter()
        .enumerate()
        .map(|(index, input)| {
            input
                .witness_utxo
                .clone()
                .ok_or_else(|| ValidationError::MissingWitnessUtxo(index).into())
        })
        .collect()
}

/// Whether an input carries final scriptSig or witness data.
pub fn is_finalized(input: &psbt::Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

fn witness_utxo(psbt: &Psbt, index: usize) -> Result<&TxOut> {
    psbt.inputs
        .get(index)
        .ok_or_else(|| {
            MarketError::from(ValidationError::BadRequest(format!("no input {index} in psbt")))
        })?
        .witness_utxo
        .as_ref()
        .ok_or_else(|| ValidationError::MissingWitnessUtxo(index).into())
}

fn address_type(script: &bitcoin::Script, index: usize) -> Result<AddressType> {
    AddressType::from_script(script).ok_or_else(|| {
        MarketError::SignatureInvalid(format!("input {index} spends an unsupported script"))
    })
}

fn invalid(index: usize, reason: impl std::fmt::Display) -> MarketError {
    MarketError::SignatureInvalid(format!("input {index}: {reason}"))
}

/// ECDSA signature and key of a non-taproot input.
fn ecdsa_signature(input: &psbt::Input, index: usize) -> Result<(PublicKey, ecdsa::Signature)> {
    if let Some((pubkey, signature)) = input.partial_sigs.iter().next() {
        return Ok((*pubkey, *signature));
    }

    let pushes: Vec<Vec<u8>> = if let Some(witness) = &input.final_script_witness {
        witness.iter().map(<[u8]>::to_vec).collect()
    } else if let Some(script_sig) = &input.final_script_sig {
        script_sig
            .instructions()
            .filter_map(|instruction| match instruction {
                Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
                _ => None,
            })
            .collect()
    } else {
        return Err(invalid(index, "not signed"));
    };

    match pushes.as_slice() {
        [signature, pubkey] => Ok((
            PublicKey::from_slice(pubkey).map_err(|e| invalid(index, e))?,
            ecdsa::Signature::from_slice(signature).map_err(|e| invalid(index, e))?,
        )),
        _ => Err(invalid(index, "unexpected signature data")),
    }
}

/// Schnorr signature of a taproot key-path input.
fn schnorr_signature(input: &psbt::Input, index: usize) -> Result<taproot::Signature> {
    if let Some(signature) = input.tap_key_sig {
        return Ok(signature);
    }

    match &input.final_script_witness {
        Some(witness) if witness.len() == 1 => witness
            .nth(0)
            .ok_or_else(|| invalid(index, "empty witness"))
            .and_then(|bytes| taproot::Signature::from_slice(bytes).map_err(|e| invalid(index, e))),
        Some(_) => Err(invalid(index, "not a key path spend")),
        None => Err(invalid(index, "not signed")),
    }
}

fn p2wpkh_script(pubkey: &PublicKey, index: usize) -> Result<ScriptBuf> {
    let compressed =
        CompressedPublicKey::try_from(*pubkey).map_err(|e| invalid(index, e))?;
    Ok(ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()))
}

fn verify_ecdsa<C: Verification>(
    secp: &Secp256k1<C>,
    digest: [u8; 32],
    signature: &ecdsa::Signature,
    pubkey: &PublicKey,
    index: usize,
) -> Result<()> {
    secp.verify_ecdsa(&Message::from_digest(digest), &signature.signature, &pubkey.inner)
        .map_err(|_| invalid(index, "ecdsa signature does not verify"))
}

/// Verify the signature of input `index`.
///
/// ECDSA for p2pkh, p2sh-p2wpkh and p2wpkh inputs, BIP-340 Schnorr for
/// taproot key-path inputs. The key must match the spent script.
pub fn verify_input(psbt: &Psbt, index: usize, policy: SighashPolicy) -> Result<()> {
    let prevout = witness_utxo(psbt, index)?;
    let script = &prevout.script_pubkey;
    let secp = Secp256k1::verification_only();
    let mut cache = SighashCache::new(&psbt.unsigned_tx);

    match address_type(script, index)? {
        AddressType::P2tr => {
            let signature = schnorr_signature(&psbt.inputs[index], index)?;
            policy.check(index, signature.sighash_type as u32)?;

            let output_key = XOnlyPublicKey::from_slice(&script.as_bytes()[2..34])
                .map_err(|e| invalid(index, e))?;

            let all;
            let prevouts = if signature.sighash_type == TapSighashType::SinglePlusAnyoneCanPay
                || signature.sighash_type == TapSighashType::AllPlusAnyoneCanPay
                || signature.sighash_type == TapSighashType::NonePlusAnyoneCanPay
            {
                Prevouts::One(index, prevout.clone())
            } else {
                all = self::prevouts(psbt)?;
                Prevouts::All(&all)
            };

            let sighash = cache
                .taproot_key_spend_signature_hash(index, &prevouts, signature.sighash_type)
                .map_err(|e| invalid(index, e))?;

            secp.verify_schnorr(
                &signature.signature,
                &Message::from_digest(sighash.to_byte_array()),
                &output_key,
            )
            .map_err(|_| invalid(index, "schnorr signature does not verify"))
        }
        AddressType::P2wpkh | AddressType::P2sh => {
            let (pubkey, signature) = ecdsa_signature(&psbt.inputs[index], index)?;
            policy.check(index, signature.sighash_type.to_u32())?;

            let key_script = p2wpkh_script(&pubkey, index)?;
            let owns = if script.is_p2sh() {
                ScriptBuf::new_p2sh(&key_script.script_hash()) == *script
            } else {
                key_script == *script
            };
            if !owns {
                return Err(invalid(index, "public key does not match the spent script"));
            }

            let sighash = cache
                .p2wpkh_signature_hash(index, &key_script, prevout.value, signature.sighash_type)
                .map_err(|e| invalid(index, e))?;
            verify_ecdsa(&secp, sighash.to_byte_array(), &signature, &pubkey, index)
        }
        AddressType::P2pkh => {
            let (pubkey, signature) = ecdsa_signature(&psbt.inputs[index], index)?;
            policy.check(index, signature.sighash_type.to_u32())?;

            if ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()) != *script {
                return Err(invalid(index, "public key does not match the spent script"));
            }

            let sighash = cache
                .legacy_signature_hash(index, script, signature.sighash_type.to_u32())
                .map_err(|e| invalid(index, e))?;
            verify_ecdsa(&secp, sighash.to_byte_array(), &signature, &pubkey, index)
        }
    }
}

/// Move the signature of input `index` into its final scriptSig / witness
/// and drop the partial signing data. Already finalized inputs are left
/// untouched.
pub fn finalize_input(psbt: &mut Psbt, index: usize) -> Result<()> {
    let script = witness_utxo(psbt, index)?.script_pubkey.clone();
    let address_type = address_type(&script, index)?;
    let input = &mut psbt.inputs[index];

    if is_finalized(input) {
        return Ok(());
    }

    match address_type {
        AddressType::P2tr => {
            let signature = schnorr_signature(input, index)?;
            input.final_script_witness = Some(Witness::p2tr_key_spend(&signature));
        }
        AddressType::P2wpkh => {
            let (pubkey, signature) = ecdsa_signature(input, index)?;
            input.final_script_witness = Some(Witness::p2wpkh(&signature, &pubkey.inner));
        }
        AddressType::P2sh => {
            let (pubkey, signature) = ecdsa_signature(input, index)?;
            let redeem_script = p2wpkh_script(&pubkey, index)?;
            let push = <&PushBytes>::try_from(redeem_script.as_bytes())
                .map_err(|e| invalid(index, e))?;
            input.final_script_sig = Some(bitcoin::script::Builder::new().push_slice(push).into_script());
            input.final_script_witness = Some(Witness::p2wpkh(&signature, &pubkey.inner));
        }
        AddressType::P2pkh => {
            let (pubkey, signature) = ecdsa_signature(input, index)?;
            let signature = signature.to_vec();
            let push = <&PushBytes>::try_from(signature.as_slice())
                .map_err(|e| invalid(index, e))?;
            input.final_script_sig = Some(
                bitcoin::script::Builder::new()
                    .push_slice(push)
                    .push_key(&pubkey)
                    .into_script(),
            );
        }
    }

    input.partial_sigs.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.tap_key_sig = None;
    input.tap_internal_key = None;
    input.bip32_derivation.clear();
    input.tap_key_origins.clear();

    Ok(())
}

/// Verify and finalize every input listed in `indexes`.
pub fn verify_and_finalize(psbt: &mut Psbt, indexes: &[usize], policy: SighashPolicy) -> Result<()> {
    for &index in indexes {
        verify_input(psbt, index, policy)?;
        finalize_input(psbt, index)?;
    }
    Ok(())
}
