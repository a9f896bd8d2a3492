// 🏦 Bank Transaction Entity
//
// Feed records arrive typed from an external parser. The feed's CREDIT/DEBIT
// type is authoritative for the sign; a record whose signed amount disagrees
// with its type is rejected here instead of being "fixed" by keyword guesses.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;
use crate::error::{LedgerError, Result};

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Reconciled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Reconciled => "RECONCILED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "RECONCILED" => Ok(TransactionStatus::Reconciled),
            _ => Err(ParseEnumError::new("transaction status", s)),
        }
    }
}

// ============================================================================
// FEED RECORD (ingestion boundary)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeedDirection {
    /// Money into the bank account
    Credit,
    /// Money out of the bank account
    Debit,
}

/// One bank feed movement as delivered by the OFX/CSV parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
    #[serde(rename = "type")]
    pub direction: FeedDirection,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub external_id: String,
    pub memo: String,
}

impl FeedRecord {
    /// Signed amount derived from the feed type: `+|amount|` for CREDIT,
    /// `-|amount|` for DEBIT.
    pub fn canonical_amount(&self) -> Result<Decimal> {
        let malformed = |reason: &str| LedgerError::MalformedFeedRecord {
            external_id: self.external_id.clone(),
            reason: reason.to_string(),
        };

        if self.external_id.trim().is_empty() {
            return Err(malformed("missing external id"));
        }
        if self.amount.is_zero() {
            return Err(malformed("zero amount"));
        }

        // Parsers emit either signed amounts (OFX TRNAMT) or bare magnitudes
        // next to the type, so a positive DEBIT is a magnitude. Only a
        // negative CREDIT contradicts its own type.
        match self.direction {
            FeedDirection::Credit if self.amount.is_sign_negative() => {
                Err(malformed("CREDIT record with a negative amount"))
            }
            FeedDirection::Credit => Ok(self.amount.abs()),
            FeedDirection::Debit => Ok(-self.amount.abs()),
        }
    }

    /// Validate and convert into a PENDING transaction.
    pub fn into_transaction(self) -> Result<BankTransaction> {
        let amount = self.canonical_amount()?;
        let description = self.memo.trim().to_string();
        let content_hash = BankTransaction::compute_content_hash(self.date, amount, &description);

        Ok(BankTransaction {
            id: Uuid::new_v4(),
            transaction_date: self.date,
            amount,
            description,
            external_id: self.external_id.trim().to_string(),
            content_hash,
            status: TransactionStatus::Pending,
            linked_entry_id: None,
            reconciled_at: None,
            imported_at: Utc::now(),
        })
    }
}

// ============================================================================
// BANK TRANSACTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: Uuid,
    pub transaction_date: NaiveDate,

    /// Signed: positive = inflow, negative = outflow
    pub amount: Decimal,

    pub description: String,

    /// Feed-native identifier (FITID)
    pub external_id: String,

    /// Hash of (date, amount, normalized description) for content de-dup
    pub content_hash: String,

    pub status: TransactionStatus,
    pub linked_entry_id: Option<Uuid>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub imported_at: DateTime<Utc>,
}

impl BankTransaction {
    /// Content hash used as the second idempotency key.
    /// Identity is `id`; the hash only answers "have we seen this movement".
    pub fn compute_content_hash(date: NaiveDate, amount: Decimal, description: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}",
            date,
            amount.normalize(),
            normalize_description(description)
        ));
        format!("{:x}", hasher.finalize())
    }

    pub fn is_inflow(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn magnitude(&self) -> Decimal {
        self.amount.abs()
    }

    pub fn is_reconciled(&self) -> bool {
        self.status == TransactionStatus::Reconciled
    }

    /// Same movement as another record (external id aside).
    pub fn same_content(&self, other: &BankTransaction) -> bool {
        self.content_hash == other.content_hash
    }
}

/// Uppercase, strip Latin accents and collapse whitespace.
pub fn normalize_description(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
            'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'E',
            'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
            'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
            'ç' | 'Ç' => 'C',
            other => other.to_ascii_uppercase(),
        })
        .collect();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}
