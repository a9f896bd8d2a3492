// 📒 Journal Entry Entity
// An entry and its lines are created, stored and deleted as one unit.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::bank_transaction::normalize_description;
use super::ParseEnumError;

/// `source_type` of entries posted for a bank transaction; their
/// `reference` is the transaction id.
pub const BANK_SOURCE: &str = "bank_transaction";

// ============================================================================
// ENTRY TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Manual,
    /// Created by the reconciliation matcher from a bank feed record
    BankImport,
    /// Carried-in balance; always counted as pre-period
    OpeningBalance,
    /// Manual classification of a bank transaction
    Classification,
    Payroll,
    Termination,
    Adjustment,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Manual => "MANUAL",
            EntryType::BankImport => "BANK_IMPORT",
            EntryType::OpeningBalance => "OPENING_BALANCE",
            EntryType::Classification => "CLASSIFICATION",
            EntryType::Payroll => "PAYROLL",
            EntryType::Termination => "TERMINATION",
            EntryType::Adjustment => "ADJUSTMENT",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MANUAL" => Ok(EntryType::Manual),
            "BANK_IMPORT" => Ok(EntryType::BankImport),
            "OPENING_BALANCE" => Ok(EntryType::OpeningBalance),
            "CLASSIFICATION" => Ok(EntryType::Classification),
            "PAYROLL" => Ok(EntryType::Payroll),
            "TERMINATION" => Ok(EntryType::Termination),
            "ADJUSTMENT" => Ok(EntryType::Adjustment),
            _ => Err(ParseEnumError::new("entry type", s)),
        }
    }
}

// ============================================================================
// PERSISTED RECORDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub entry_date: NaiveDate,
    pub competence_date: NaiveDate,
    pub description: String,
    pub entry_type: EntryType,

    /// Kind of external record that caused this entry (e.g. `bank_transaction`)
    pub source_type: Option<String>,

    /// Identifier of that record
    pub reference: Option<String>,

    pub is_draft: bool,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn is_bank_sourced(&self) -> bool {
        self.source_type.as_deref() == Some(BANK_SOURCE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryLine {
    /// Monotonic sequence assigned by the store (0 until persisted)
    pub id: i64,
    pub entry_id: Uuid,
    pub account_id: Uuid,
    pub debit: Decimal,
    pub credit: Decimal,
    pub description: String,
}

impl EntryLine {
    /// The booked amount, whichever side it is on.
    pub fn amount(&self) -> Decimal {
        self.debit + self.credit
    }

    pub fn is_debit(&self) -> bool {
        self.debit > Decimal::ZERO
    }
}

/// An entry together with its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub entry: JournalEntry,
    pub lines: Vec<EntryLine>,
}

impl EntryRecord {
    pub fn totals(&self) -> EntryTotals {
        EntryTotals::of(&self.lines)
    }

    /// "normalized description|debit total|entry date", shared by entries
    /// that look like the same posting. Drafts and entries without lines
    /// have none.
    pub fn fingerprint(&self) -> Option<String> {
        if self.entry.is_draft || self.lines.is_empty() {
            return None;
        }
        Some(format!(
            "{}|{}|{}",
            normalize_description(&self.entry.description),
            self.totals().debit.normalize(),
            self.entry.entry_date
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryTotals {
    pub debit: Decimal,
    pub credit: Decimal,
}

impl EntryTotals {
    pub fn of(lines: &[EntryLine]) -> Self {
        lines.iter().fold(EntryTotals::default(), |acc, line| EntryTotals {
            debit: acc.debit + line.debit,
            credit: acc.credit + line.credit,
        })
    }

    /// Debits minus credits.
    pub fn difference(&self) -> Decimal {
        self.debit - self.credit
    }

    /// A difference of exactly `epsilon` still counts as balanced.
    pub fn is_balanced(&self, epsilon: Decimal) -> bool {
        self.difference().abs() <= epsilon
    }
}

// ============================================================================
// POSTING INPUT
// ============================================================================

/// Header of an entry about to be posted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntry {
    pub entry_date: NaiveDate,
    /// Defaults to `entry_date`
    pub competence_date: Option<NaiveDate>,
    pub description: String,
    pub entry_type: EntryType,
    pub source_type: Option<String>,
    pub reference: Option<String>,
    pub is_draft: bool,
}

impl NewEntry {
    pub fn new(entry_date: NaiveDate, description: impl Into<String>, entry_type: EntryType) -> Self {
        NewEntry {
            entry_date,
            competence_date: None,
            description: description.into(),
            entry_type,
            source_type: None,
            reference: None,
            is_draft: false,
        }
    }

    pub fn with_source(mut self, source_type: impl Into<String>, reference: impl Into<String>) -> Self {
        self.source_type = Some(source_type.into());
        self.reference = Some(reference.into());
        self
    }

    pub fn with_competence(mut self, competence_date: NaiveDate) -> Self {
        self.competence_date = Some(competence_date);
        self
    }

    pub fn draft(mut self) -> Self {
        self.is_draft = true;
        self
    }

    /// Materialize the header with a fresh id.
    pub fn into_entry(self) -> JournalEntry {
        JournalEntry {
            id: Uuid::new_v4(),
            entry_date: self.entry_date,
            competence_date: self.competence_date.unwrap_or(self.entry_date),
            description: self.description,
            entry_type: self.entry_type,
            source_type: self.source_type,
            reference: self.reference,
            is_draft: self.is_draft,
            created_at: Utc::now(),
        }
    }
}

/// A line about to be posted, addressed by account code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLine {
    pub account_code: String,
    pub debit: Decimal,
    pub credit: Decimal,
    pub description: String,
}

impl NewLine {
    pub fn debit_to(account_code: impl Into<String>, amount: Decimal) -> Self {
        NewLine {
            account_code: account_code.into(),
            debit: amount,
            credit: Decimal::ZERO,
            description: String::new(),
        }
    }

    pub fn credit_to(account_code: impl Into<String>, amount: Decimal) -> Self {
        NewLine {
            account_code: account_code.into(),
            debit: Decimal::ZERO,
            credit: amount,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}
