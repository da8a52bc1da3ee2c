//! Account keys and address-type specific input data.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use bitcoin::{
    key::Secp256k1, psbt, Address, CompressedPublicKey, Network, Script, ScriptBuf,
    XOnlyPublicKey,
};
use serde::{Deserialize, Serialize};

use crate::{error::Result, MarketError, ValidationError};

/// Output script families a marketplace account can use.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    /// Legacy pay-to-pubkey-hash
    P2pkh,
    /// P2WPKH wrapped in P2SH
    P2sh,
    /// Native segwit v0
    P2wpkh,
    /// Taproot key path
    P2tr,
}

impl AddressType {
    /// Classify an output script.
    pub fn from_script(script: &Script) -> Option<Self> {
        if script.is_p2tr() {
            Some(Self::P2tr)
        } else if script.is_p2pkh() {
            Some(Self::P2pkh)
        } else if script.is_p2wpkh() {
            Some(Self::P2wpkh)
        } else if script.is_p2sh() {
            Some(Self::P2sh)
        } else {
            None
        }
    }

    /// Whether signatures for this type are Schnorr (BIP-340).
    pub fn is_taproot(self) -> bool {
        matches!(self, Self::P2tr)
    }
}

impl Display for AddressType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            Self::P2pkh => "p2pkh",
            Self::P2sh => "p2sh",
            Self::P2wpkh => "p2wpkh",
            Self::P2tr => "p2tr",
        };
        write!(f, "{name}")
    }
}

impl FromStr for AddressType {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "p2pkh" => Ok(Self::P2pkh),
            "p2sh" => Ok(Self::P2sh),
            "p2wpkh" => Ok(Self::P2wpkh),
            "p2tr" => Ok(Self::P2tr),
            other => Err(ValidationError::BadRequest(format!("unknown address type `{other}`")).into()),
        }
    }
}

/// Keys of a wallet account: the address, its script and the public key
/// that signs for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountKeys {
    pub address: Address,
    pub script_pubkey: ScriptBuf,
    pub pubkey: CompressedPublicKey,
    pub address_type: AddressType,
}

impl AccountKeys {
    /// Derive the account address of `address_type` for `pubkey`.
    pub fn new(pubkey: CompressedPublicKey, address_type: AddressType, network: Network) -> Self {
        let address = match address_type {
            AddressType::P2pkh => Address::p2pkh(pubkey.pubkey_hash(), network),
            AddressType::P2sh => Address::p2shwpkh(&pubkey, network),
            AddressType::P2wpkh => Address::p2wpkh(&pubkey, network),
            AddressType::P2tr => {
                let secp = Secp256k1::verification_only();
                Address::p2tr(&secp, XOnlyPublicKey::from(pubkey.0), None, network)
            }
        };

        Self {
            script_pubkey: address.script_pubkey(),
            address,
            pubkey,
            address_type,
        }
    }

    /// Build account keys from a claimed address and hex public key, checking
    /// that the key actually controls the address.
    pub fn from_claim(address: &str, pubkey_hex: &str, network: Network) -> Result<Self> {
        let claimed = crate::utils::parse_address(address, network)?;
        let pubkey = CompressedPublicKey::from_slice(&hex::decode(pubkey_hex)?).map_err(|e| {
            ValidationError::BadRequest(format!("invalid public key {pubkey_hex}: {e}"))
        })?;
        let address_type = AddressType::from_script(&claimed.script_pubkey()).ok_or_else(|| {
            ValidationError::BadRequest(format!("unsupported address type for {address}"))
        })?;

        let account = Self::new(pubkey, address_type, network);
        if account.script_pubkey != claimed.script_pubkey() {
            return Err(MarketError::OwnershipMismatch(format!(
                "public key {pubkey_hex} does not control {address}"
            )));
        }

        Ok(account)
    }

    /// X-only form of the account key (taproot internal key).
    pub fn x_only(&self) -> XOnlyPublicKey {
        XOnlyPublicKey::from(self.pubkey.0)
    }

    /// Redeem script for the P2SH-wrapped account type.
    pub fn redeem_script(&self) -> Option<ScriptBuf> {
        matches!(self.address_type, AddressType::P2sh)
            .then(|| ScriptBuf::new_p2wpkh(&self.pubkey.wpubkey_hash()))
    }

    /// Attach the data a signer needs for this account type to a PSBT input.
    pub fn apply_input_extras(&self, input: &mut psbt::Input) {
        match self.address_type {
            AddressType::P2sh => input.redeem_script = self.redeem_script(),
            AddressType::P2tr => input.tap_internal_key = Some(self.x_only()),
            AddressType::P2pkh | AddressType::P2wpkh => {}
        }
    }
}
