// Entity Models
//
// Strongly typed ledger records. Rows are validated into these types at the
// storage and feed boundaries; nothing downstream handles missing amounts.

pub mod account;
pub mod bank_transaction;
pub mod entry;

pub use account::{Account, AccountNature};
pub use bank_transaction::{
    normalize_description, BankTransaction, FeedDirection, FeedRecord, TransactionStatus,
};
pub use entry::{
    EntryLine, EntryRecord, EntryTotals, EntryType, JournalEntry, NewEntry, NewLine, BANK_SOURCE,
};

use thiserror::Error;

/// Raised when a stored or supplied tag does not name a known variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        ParseEnumError {
            kind,
            value: value.to_string(),
        }
    }
}
