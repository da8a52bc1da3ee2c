//! Fee rates and virtual size estimation for unsigned transactions.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use bitcoin::{psbt, Amount};
use serde::{Deserialize, Serialize};

use crate::{account::AddressType, error::Result, ValidationError};

/// Fee rate in sat/vB.
#[derive(Debug, PartialEq, PartialOrd, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct FeeRate(f64);

impl FromStr for FeeRate {
    type Err = crate::MarketError;

    fn from_str(s: &str) -> Result<Self> {
        let rate = f64::from_str(s)
            .map_err(|_| ValidationError::BadRequest(format!("invalid fee rate: {s}")))?;
        Self::try_from(rate)
    }
}

impl TryFrom<f64> for FeeRate {
    type Error = crate::MarketError;

    fn try_from(rate: f64) -> Result<Self> {
        if rate.is_sign_negative() | rate.is_nan() | rate.is_infinite() {
            return Err(ValidationError::BadRequest(format!("invalid fee rate: {rate}")).into());
        }
        Ok(Self(rate))
    }
}

impl From<FeeRate> for f64 {
    fn from(rate: FeeRate) -> Self {
        rate.0
    }
}

impl Display for FeeRate {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} sat/vB", self.0)
    }
}

impl FeeRate {
    /// Default minimum relay fee rate.
    pub const MIN_RELAY: FeeRate = FeeRate(1.0);

    /// Fee for `vsize` virtual bytes, rounded up to the next satoshi.
    pub fn fee(&self, vsize: usize) -> Amount {
        let exact = self.0 * vsize as f64;
        let rounded = exact.round();
        // 1.1 * 100 is 110.00000000000001 in binary floating point
        let sats = if (exact - rounded).abs() < 1e-6 {
            rounded
        } else {
            exact.ceil()
        };
        Amount::from_sat(sats as u64)
    }

    pub fn sat_per_vb(&self) -> f64 {
        self.0
    }
}

/// Serialized size contributions of one input.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputSize {
    /// Length of the scriptSig in bytes
    pub script_sig: usize,
    /// Length of each witness stack element
    pub witness: Vec<usize>,
}

impl InputSize {
    /// Expected size of a signed input spending an output of `address_type`.
    pub fn for_address_type(address_type: AddressType) -> Self {
        match address_type {
            // <sig> <pubkey>
            AddressType::P2pkh => Self {
                script_sig: 107,
                witness: vec![],
            },
            // push of the p2wpkh redeem script
            AddressType::P2sh => Self {
                script_sig: 23,
                witness: vec![71, 33],
            },
            AddressType::P2wpkh => Self {
                script_sig: 0,
                witness: vec![71, 33],
            },
            AddressType::P2tr => Self {
                script_sig: 0,
                witness: vec![64],
            },
        }
    }

    /// Actual size of an already finalized PSBT input.
    ///
    /// Inputs without final data are assumed to be taproot key spends.
    pub fn of_finalized(input: &psbt::Input) -> Self {
        let script_sig = input.final_script_sig.as_ref().map_or(0, |s| s.len());
        let witness = match &input.final_script_witness {
            Some(witness) => witness.iter().map(<[u8]>::len).collect(),
            None if script_sig == 0 => vec![64],
            None => vec![],
        };
        Self {
            script_sig,
            witness,
        }
    }
}

/// Length of a Bitcoin compact size prefix for `n`.
fn compact_size_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn var_slice_len(len: usize) -> usize {
    compact_size_len(len) + len
}

fn transaction_len(inputs: &[InputSize], output_scripts: &[usize], with_witness: bool) -> usize {
    let has_witness = with_witness && inputs.iter().any(|input| !input.witness.is_empty());

    let mut len = if has_witness { 10 } else { 8 };
    len += compact_size_len(inputs.len()) + compact_size_len(output_scripts.len());
    len += inputs
        .iter()
        .map(|input| 40 + var_slice_len(input.script_sig))
        .sum::<usize>();
    len += output_scripts
        .iter()
        .map(|script| 8 + var_slice_len(*script))
        .sum::<usize>();

    if has_witness {
        len += inputs
            .iter()
            .map(|input| {
                compact_size_len(input.witness.len())
                    + input.witness.iter().copied().map(var_slice_len).sum::<usize>()
            })
            .sum::<usize>();
    }

    len
}

/// Virtual size of a transaction with the given inputs and output script
/// lengths: `ceil((base * 3 + total) / 4)`.
pub fn estimate_vsize(inputs: &[InputSize], output_scripts: &[usize]) -> usize {
    let base = transaction_len(inputs, output_scripts, false);
    let total = transaction_len(inputs, output_scripts, true);
    (base * 3 + total).div_ceil(4)
}
