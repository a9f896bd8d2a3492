// Ledger Engine - Core Library
// Exposes all modules for use in the CLI and tests

pub mod error;
pub mod entities;
pub mod store;
pub mod config;
pub mod chart;          // Chart of accounts hierarchy
pub mod journal;        // Validated double-entry posting
pub mod balance;        // Period balances with rollup
pub mod rules;          // Classification rules
pub mod reconciliation; // Bank feed matching
pub mod audit;          // Integrity scan
pub mod remediation;    // Findings -> corrective actions
pub mod engine;

// Re-export commonly used types
pub use error::{ErrorCategory, LedgerError, Result};
pub use entities::{
    Account, AccountNature, BankTransaction, EntryLine, EntryRecord, EntryTotals, EntryType,
    FeedDirection, FeedRecord, JournalEntry, NewEntry, NewLine, TransactionStatus, BANK_SOURCE,
};
pub use store::{
    read_consistent, AccountChange, EntryFingerprint, Event, FingerprintCursor, LedgerReader,
    LedgerStore, MemoryStore, ScanCursor, SqliteStore,
};
pub use config::LedgerConfig;
pub use chart::{load_chart_csv, ChartOfAccounts, ChartRow, ImportSummary};
pub use journal::{JournalStore, PostingPreview};
pub use balance::{
    AccountBalance, BalanceCalculator, BalanceFilter, BalanceReport, OrphanReason, OrphanedLine,
};
pub use rules::{AmountRange, Candidate, Classification, ClassificationRule, Direction, RuleEngine};
pub use reconciliation::{
    read_feed_csv, FeedFile, IngestOutcome, ReconciliationMatcher, ReconciliationReport,
    ReviewItem, RunMode, TransactionOutcome, UndoOutcome,
};
pub use audit::{
    AuditCheckpoint, AuditPhase, AuditReport, Finding, FindingKind, IntegrityAuditor, Severity,
};
pub use remediation::{
    ActionResult, ActionStatus, RemediationAction, RemediationPlanner, RemediationReport, Restored,
};
pub use engine::LedgerEngine;
