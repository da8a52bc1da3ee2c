//! # Runestone encoding
//!
//! Serializes rune protocol instructions into an `OP_RETURN OP_13 <payload>`
//! output script. Only encoding is implemented; transfers (edicts) are the
//! part exercised by the marketplace, with mint, pointer and etching fields
//! available for completeness.
//!
//! Payload layout: optional `tag, value` varint pairs, then the `Body` tag
//! followed by four varints per edict: `block delta, tx delta, amount, output`.

use bitcoin::{opcodes, script, Opcode, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::{error::Result, rune_id::RuneId, varint, ValidationError};

/// Largest output script relayed by default policy for `OP_RETURN` outputs.
pub const MAX_STANDARD_OP_RETURN_SIZE: usize = 83;

/// Consensus limit on a single data push.
const MAX_PUSH_SIZE: usize = 520;

#[derive(Copy, Clone, Debug)]
pub(crate) enum Tag {
    Body = 0,
    Flags = 2,
    Rune = 4,
    Premine = 6,
    Cap = 8,
    Amount = 10,
    HeightStart = 12,
    HeightEnd = 14,
    OffsetStart = 16,
    OffsetEnd = 18,
    Mint = 20,
    Pointer = 22,

    Divisibility = 1,
    Spacers = 3,
    Symbol = 5,
}

impl Tag {
    fn encode<const N: usize>(self, values: [u128; N], payload: &mut Vec<u8>) {
        for value in values {
            varint::encode_to_vec(self.into(), payload);
            varint::encode_to_vec(value, payload);
        }
    }

    fn encode_option<T: Into<u128>>(self, value: Option<T>, payload: &mut Vec<u8>) {
        if let Some(value) = value {
            self.encode([value.into()], payload)
        }
    }
}

impl From<Tag> for u128 {
    fn from(tag: Tag) -> Self {
        tag as u128
    }
}

#[derive(Copy, Clone, Debug)]
enum Flag {
    Etching = 0,
    Terms = 1,
    Turbo = 2,
}

impl Flag {
    fn mask(self) -> u128 {
        1 << self as u128
    }

    fn set(self, flags: &mut u128) {
        *flags |= self.mask()
    }
}

/// A single transfer instruction.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone)]
pub struct Edict {
    pub id: RuneId,
    pub amount: u128,
    pub output: u32,
}

/// Open mint terms of an etching.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone)]
pub struct Terms {
    pub amount: Option<u128>,
    pub cap: Option<u128>,
    pub height: (Option<u64>, Option<u64>),
    pub offset: (Option<u64>, Option<u64>),
}

/// Fields of a new rune.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone)]
pub struct Etching {
    pub divisibility: Option<u8>,
    pub premine: Option<u128>,
    /// Rune name as its base-26 integer, see [`encode_rune_name`].
    pub rune: Option<u128>,
    pub spacers: Option<u32>,
    pub symbol: Option<char>,
    pub terms: Option<Terms>,
    pub turbo: bool,
}

/// Structured runestone instruction.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Runestone {
    pub edicts: Vec<Edict>,
    pub etching: Option<Etching>,
    pub mint: Option<RuneId>,
    pub pointer: Option<u32>,
}

impl Runestone {
    /// Protocol marker following `OP_RETURN`.
    pub const MAGIC_NUMBER: Opcode = opcodes::all::OP_PUSHNUM_13;

    /// Runestone transferring `amount` of `id` to each output in `outputs`.
    pub fn transfer(id: RuneId, amount: u128, outputs: impl IntoIterator<Item = u32>) -> Self {
        Self {
            edicts: outputs
                .into_iter()
                .map(|output| Edict { id, amount, output })
                .collect(),
            ..Default::default()
        }
    }

    /// Raw payload bytes, without the script wrapping.
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();

        if let Some(etching) = self.etching {
            let mut flags = 0;
            Flag::Etching.set(&mut flags);

            if etching.terms.is_some() {
                Flag::Terms.set(&mut flags);
            }

            if etching.turbo {
                Flag::Turbo.set(&mut flags);
            }

            Tag::Flags.encode([flags], &mut payload);

            Tag::Rune.encode_option(etching.rune, &mut payload);
            Tag::Divisibility.encode_option(etching.divisibility, &mut payload);
            Tag::Spacers.encode_option(etching.spacers, &mut payload);
            Tag::Symbol.encode_option(etching.symbol, &mut payload);
            Tag::Premine.encode_option(etching.premine, &mut payload);

            if let Some(terms) = etching.terms {
                Tag::Amount.encode_option(terms.amount, &mut payload);
                Tag::Cap.encode_option(terms.cap, &mut payload);
                Tag::HeightStart.encode_option(terms.height.0, &mut payload);
                Tag::HeightEnd.encode_option(terms.height.1, &mut payload);
                Tag::OffsetStart.encode_option(terms.offset.0, &mut payload);
                Tag::OffsetEnd.encode_option(terms.offset.1, &mut payload);
            }
        }

        if let Some(RuneId { block, tx }) = self.mint {
            Tag::Mint.encode([block.into(), tx.into()], &mut payload);
        }

        Tag::Pointer.encode_option(self.pointer, &mut payload);

        if !self.edicts.is_empty() {
            varint::encode_to_vec(Tag::Body.into(), &mut payload);

            let mut edicts = self.edicts.clone();
            edicts.sort_by_key(|edict| edict.id);

            let mut previous = RuneId::default();
            for edict in edicts {
                // sorted ascending, so the delta always exists
                let (block, tx) = previous.delta(edict.id).unwrap_or_default();
                varint::encode_to_vec(block, &mut payload);
                varint::encode_to_vec(tx, &mut payload);
                varint::encode_to_vec(edict.amount, &mut payload);
                varint::encode_to_vec(edict.output.into(), &mut payload);
                previous = edict.id;
            }
        }

        payload
    }

    /// Full `OP_RETURN` output script.
    pub fn encipher(&self) -> ScriptBuf {
        let payload = self.payload();

        let mut builder = script::Builder::new()
            .push_opcode(opcodes::all::OP_RETURN)
            .push_opcode(Runestone::MAGIC_NUMBER);

        for chunk in payload.chunks(MAX_PUSH_SIZE) {
            // chunks never exceed the push limit
            if let Ok(push) = <&script::PushBytes>::try_from(chunk) {
                builder = builder.push_slice(push);
            }
        }

        builder.into_script()
    }

    /// Every edict must point at an existing output, or at `output_count`
    /// itself (split across all non-`OP_RETURN` outputs).
    pub fn check_outputs(&self, output_count: usize) -> Result<()> {
        for edict in &self.edicts {
            if edict.output as usize > output_count {
                return Err(ValidationError::InvalidFragment(format!(
                    "edict for {} targets output {} of {}",
                    edict.id, edict.output, output_count
                ))
                .into());
            }
        }

        if let Some(pointer) = self.pointer {
            if pointer as usize >= output_count {
                return Err(ValidationError::InvalidFragment(format!(
                    "pointer {pointer} out of range for {output_count} outputs"
                ))
                .into());
            }
        }

        Ok(())
    }
}

/// Base-26 integer of a rune name (`A` = 0, `Z` = 25, `AA` = 26, ...).
///
/// Spacers (`•` or `.`) are ignored; use [`encode_spacers`] for them.
pub fn encode_rune_name(name: &str) -> Result<u128> {
    let mut x = 0u128;
    let mut letters = 0;

    for c in name.chars() {
        if is_spacer(c) {
            continue;
        }

        if !c.is_ascii_uppercase() {
            return Err(ValidationError::BadRequest(format!(
                "invalid character `{c}` in rune name `{name}`"
            ))
            .into());
        }

        if letters > 0 {
            x = x.checked_add(1).ok_or_else(|| name_overflow(name))?;
        }
        x = x
            .checked_mul(26)
            .and_then(|x| x.checked_add(u128::from(c as u8 - b'A')))
            .ok_or_else(|| name_overflow(name))?;
        letters += 1;
    }

    if letters == 0 {
        return Err(ValidationError::BadRequest("empty rune name".to_string()).into());
    }

    Ok(x)
}

/// Spacer bitfield of a spaced rune name: bit `i` set means a spacer follows
/// the `i`th letter.
pub fn encode_spacers(name: &str) -> Result<u32> {
    let mut spacers = 0u32;
    let mut letters = 0u32;
    let mut trailing = false;

    for c in name.chars() {
        trailing = is_spacer(c);
        if trailing {
            if letters == 0 || letters > 32 {
                return Err(ValidationError::BadRequest(format!(
                    "misplaced spacer in rune name `{name}`"
                ))
                .into());
            }

            let flag = 1 << (letters - 1);
            if spacers & flag != 0 {
                return Err(ValidationError::BadRequest(format!(
                    "double spacer in rune name `{name}`"
                ))
                .into());
            }
            spacers |= flag;
        } else {
            letters += 1;
        }
    }

    if trailing {
        return Err(ValidationError::BadRequest(format!(
            "trailing spacer in rune name `{name}`"
        ))
        .into());
    }

    Ok(spacers)
}

fn is_spacer(c: char) -> bool {
    c == '•' || c == '.'
}

fn name_overflow(name: &str) -> crate::MarketError {
    ValidationError::BadRequest(format!("rune name `{name}` is too long")).into()
}
