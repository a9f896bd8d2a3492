// ❗ Ledger errors
// Validation failures are always raised before anything is persisted.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Broad class of an error, used by callers to decide whether to retry,
/// surface or queue for review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Duplicate,
    Conflict,
    Ambiguous,
    Storage,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    // === Validation ===
    #[error("entry is unbalanced: debits {debit} != credits {credit} (difference {difference})")]
    UnbalancedEntry {
        debit: Decimal,
        credit: Decimal,
        difference: Decimal,
    },

    #[error("entry must have at least two lines, got {0}")]
    EmptyEntry(usize),

    #[error("account {0} is synthetic and cannot receive entry lines")]
    PostingToSyntheticAccount(String),

    #[error("invalid line for account {account_code}: {reason}")]
    InvalidLine {
        account_code: String,
        reason: &'static str,
    },

    #[error("invalid account code: {0:?}")]
    InvalidAccountCode(String),

    #[error("account {parent} is analytic; convert it to synthetic before adding {child}")]
    ParentNotSynthetic { parent: String, child: String },

    #[error("account {code} already carries {lines} entry lines")]
    AccountHasLines { code: String, lines: usize },

    #[error("account {0} still has child accounts")]
    AccountHasChildren(String),

    #[error("malformed feed record {external_id}: {reason}")]
    MalformedFeedRecord { external_id: String, reason: String },

    #[error("invalid period: {start} is after {end}")]
    InvalidPeriod { start: NaiveDate, end: NaiveDate },

    #[error("invalid classification rule {rule_id}: {reason}")]
    InvalidRule { rule_id: String, reason: String },

    // === Lookup / idempotency ===
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("duplicate {kind}: {key}")]
    Duplicate { kind: &'static str, key: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("ambiguous classification for transaction {transaction_id}: {candidates} candidate rules")]
    AmbiguousClassification {
        transaction_id: Uuid,
        candidates: usize,
    },

    // === Infrastructure ===
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ledger state lock poisoned")]
    LockPoisoned,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        LedgerError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn duplicate(kind: &'static str, key: impl ToString) -> Self {
        LedgerError::Duplicate {
            kind,
            key: key.to_string(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::UnbalancedEntry { .. }
            | LedgerError::EmptyEntry(_)
            | LedgerError::PostingToSyntheticAccount(_)
            | LedgerError::InvalidLine { .. }
            | LedgerError::InvalidAccountCode(_)
            | LedgerError::ParentNotSynthetic { .. }
            | LedgerError::AccountHasLines { .. }
            | LedgerError::AccountHasChildren(_)
            | LedgerError::MalformedFeedRecord { .. }
            | LedgerError::InvalidPeriod { .. }
            | LedgerError::InvalidRule { .. } => ErrorCategory::Validation,
            LedgerError::NotFound { .. } => ErrorCategory::NotFound,
            LedgerError::Duplicate { .. } => ErrorCategory::Duplicate,
            LedgerError::Conflict(_) => ErrorCategory::Conflict,
            LedgerError::AmbiguousClassification { .. } => ErrorCategory::Ambiguous,
            LedgerError::Storage(_)
            | LedgerError::Serialization(_)
            | LedgerError::LockPoisoned
            | LedgerError::Io(_) => ErrorCategory::Storage,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
