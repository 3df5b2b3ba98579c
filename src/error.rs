use thiserror::Error;

/// Renders only the first 20 hex characters of a pubkey/address-like string.
///
/// Per the engine's error-surface contract: never leak more key material than
/// is needed to eyeball which key a message is about.
pub fn truncate_pubkey(s: &str) -> String {
    if s.len() <= 20 {
        s.to_string()
    } else {
        format!("{}…", &s[..20])
    }
}

#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("duplicate keys: borrower, lender and platform pubkeys must be pairwise distinct")]
    DuplicateKeys,

    #[error("invalid pubkey {0}")]
    InvalidPubkey(String),

    #[error("witness script mismatch for loan {0}")]
    WitnessScriptMismatch(bitcoin::Txid),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("resolution already in progress for loan {0}")]
    ResolutionInProgress(bitcoin::Txid),

    #[error("required pre-signed template missing for loan {0} tx type {1:?}")]
    TemplateMissing(bitcoin::Txid, crate::psbt::TxType),

    #[error("recovery broadcast attempted before valid_after")]
    TimelockNotMet,

    #[error("no UTXO found at escrow address for loan {0}")]
    UtxoMissing(bitcoin::Txid),

    #[error("broadcast failed (transient): {reason}")]
    BroadcastFailedTransient { reason: String },

    #[error("broadcast failed (permanent): {reason}")]
    BroadcastFailedPermanent { reason: String },

    #[error("price oracle and fallback both unavailable")]
    PriceUnavailable,

    #[error("loan not found: {0}")]
    LoanNotFound(bitcoin::Txid),

    #[error("loan already exists: {0}")]
    LoanAlreadyExists(bitcoin::Txid),

    #[error("invalid state transition for loan {0}: {1}")]
    InvalidTransition(bitcoin::Txid, String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("bitcoin consensus encode error: {0}")]
    BitcoinEncodeError(#[from] bitcoin::consensus::encode::Error),

    #[error("amount parse error: {0}")]
    AmountParseError(#[from] bitcoin::amount::ParseAmountError),

    #[error("psbt error: {0}")]
    PsbtError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EscrowError>;
