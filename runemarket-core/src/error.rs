//! Error types for runemarket-core

use thiserror::Error;

/// Result type alias for marketplace operations
pub type Result<T> = std::result::Result<T, MarketError>;

/// Error types for marketplace operations
#[derive(Error, Debug)]
pub enum MarketError {
    /// PSBT (de)serialization and construction errors
    #[error("PSBT error: {0}")]
    Psbt(#[from] bitcoin::psbt::Error),

    /// Raw transaction decoding errors
    #[error("Transaction decoding error: {0}")]
    Consensus(#[from] bitcoin::consensus::encode::Error),

    /// Address parsing errors
    #[error("Address error: {0}")]
    Address(#[from] bitcoin::address::ParseError),

    /// Txid / hash parsing errors
    #[error("Bitcoin error: {0}")]
    Hash(#[from] bitcoin::hex::HexToArrayError),

    /// Secp256k1 errors
    #[error("Secp256k1 error: {0}")]
    Secp256k1(#[from] bitcoin::secp256k1::Error),

    /// Hex decoding errors
    #[error("Hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Serde JSON errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed input rejected before any external call
    #[error("Validation error: {0}")]
    Validation(ValidationError),

    /// Claimed address does not own the input script
    #[error("Ownership mismatch: {0}")]
    OwnershipMismatch(String),

    /// Live balance, rune id or amount differs from the claim
    #[error("Asset mismatch: {0}")]
    AssetMismatch(String),

    /// The claimed output is not among the lister's rune outputs
    #[error("Asset not owned: {0}")]
    AssetNotOwned(String),

    /// The indexer does not know the rune
    #[error("Rune not found: {0}")]
    RuneNotFound(String),

    /// The inscription is not where the offer says it is
    #[error("Inscription mismatch: {0}")]
    InscriptionMismatch(String),

    /// Wrong signature scheme, wrong sighash or bad signature
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    /// Coin selection ran out of pool before covering the target
    #[error("Insufficient funds: need {needed} sats, pool provides {available} sats")]
    InsufficientFunds {
        /// Target value plus fee at the point of exhaustion
        needed: u64,
        /// Everything that was available for selection
        available: u64,
    },

    /// An output would fall below the dust limit
    #[error("Dust output: {value} sats is below the {limit} sats dust limit")]
    DustOutput {
        /// Computed output value
        value: u64,
        /// Dust limit in force
        limit: u64,
    },

    /// Indexer, signer or broadcaster unreachable; surfaced verbatim
    #[error("External service failure: {0}")]
    ExternalService(String),

    /// Node rejected the broadcast (double spend or conflict); terminal
    #[error("Broadcast rejected: {0}")]
    BroadcastRejected(String),
}

/// Pre-flight validation failures, each with its own API code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no inputs or outputs in psbt")]
    EmptyPsbt,

    #[error("inputs and outputs length do not match ({inputs} != {outputs})")]
    CountMismatch { inputs: usize, outputs: usize },

    #[error("no witness utxo for input {0}")]
    MissingWitnessUtxo(usize),

    #[error("invalid offer psbt: {0}")]
    InvalidFragment(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl MarketError {
    /// Numeric code reported to API clients for this failure.
    pub fn code(&self) -> u32 {
        match self {
            Self::Validation(ValidationError::EmptyPsbt) => 30001,
            Self::Validation(ValidationError::CountMismatch { .. }) => 30002,
            Self::Validation(ValidationError::MissingWitnessUtxo(_)) => 30003,
            Self::Validation(ValidationError::InvalidFragment(_)) => 30010,
            Self::Validation(ValidationError::BadRequest(_)) => 10001,
            Self::OwnershipMismatch(_) => 30004,
            Self::AssetMismatch(_) => 30009,
            Self::AssetNotOwned(_) => 30005,
            Self::RuneNotFound(_) => 30013,
            Self::InscriptionMismatch(_) => 30014,
            Self::SignatureInvalid(_) => 30008,
            Self::BroadcastRejected(_) => 30011,
            Self::Psbt(_) | Self::Consensus(_) => 30010,
            Self::Address(_) | Self::Hash(_) | Self::Hex(_) | Self::Json(_) => 10001,
            Self::InsufficientFunds { .. }
            | Self::DustOutput { .. }
            | Self::ExternalService(_)
            | Self::Secp256k1(_)
            | Self::Config(_)
            | Self::Io(_) => 20001,
        }
    }

    /// Whether an offer involved in this failure must be delisted.
    pub fn is_terminal_for_offer(&self) -> bool {
        matches!(self, Self::BroadcastRejected(_))
    }
}

impl From<ValidationError> for MarketError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}
