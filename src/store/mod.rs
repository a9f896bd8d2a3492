// 🗄️ Persistence port
//
// Every component talks to storage through `LedgerStore`. Each mutating
// method is one atomic unit: it either applies completely (including its
// audit event) or not at all. Multi-page reads go through `read_snapshot`
// so they see one committed state from the first page to the last.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Account, BankTransaction, EntryLine, EntryRecord, JournalEntry};
use crate::error::{LedgerError, Result};

// ============================================================================
// SCAN CURSOR
// ============================================================================

/// Resumable position in the line sequence.
///
/// `watermark` is the highest line id visible when the scan started; pages
/// never go past it, so a scan reads one fixed set of committed lines even
/// while writers keep appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub after: i64,
    pub watermark: i64,
}

impl ScanCursor {
    pub fn start(watermark: i64) -> Self {
        ScanCursor { after: 0, watermark }
    }

    pub fn advance(&mut self, last_id: i64) {
        self.after = self.after.max(last_id);
    }

    pub fn is_exhausted(&self) -> bool {
        self.after >= self.watermark
    }
}

/// A line joined with its owning entry; `entry` is `None` for orphan lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerLine {
    pub line: EntryLine,
    pub entry: Option<JournalEntry>,
}

/// Result of inserting a feed transaction under the uniqueness constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(BankTransaction),
    /// A record with the same external id or content hash already exists
    Existing(BankTransaction),
}

/// A posted entry positioned in duplicate-fingerprint order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFingerprint {
    pub fingerprint: String,
    pub entry: JournalEntry,
}

/// Resumable position in the (fingerprint, entry id) ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintCursor {
    pub fingerprint: String,
    pub entry_id: Uuid,
}

impl FingerprintCursor {
    pub fn at(item: &EntryFingerprint) -> Self {
        FingerprintCursor {
            fingerprint: item.fingerprint.clone(),
            entry_id: item.entry.id,
        }
    }
}

/// One change to the chart, applied as part of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountChange {
    /// A new account. Its parent, when set, must exist and be synthetic.
    Insert(Account),
    /// Replace an existing account. Turning an analytic account synthetic
    /// is refused while lines are booked to it.
    Update(Account),
    /// Refused while the account has children or lines.
    Remove(Uuid),
}

/// A removed record together with the audit event that logged it.
#[derive(Debug, Clone)]
pub struct Deletion<T> {
    pub removed: T,
    pub event_id: String,
}

// ============================================================================
// AUDIT EVENT
// ============================================================================

/// Audit trail record: every change is an event.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }

    pub fn entry_posted(record: &EntryRecord, link: Option<Uuid>, actor: &str) -> Result<Self> {
        Ok(Event::new(
            "entry_posted",
            "journal_entry",
            &record.entry.id.to_string(),
            serde_json::json!({
                "line_ids": record.lines.iter().map(|l| l.id).collect::<Vec<_>>(),
                "bank_transaction_id": link,
                "snapshot": serde_json::to_value(record)?,
            }),
            actor,
        ))
    }

    pub fn entry_deleted(record: &EntryRecord, unlinked: &[Uuid], actor: &str) -> Result<Self> {
        Ok(Event::new(
            "entry_deleted",
            "journal_entry",
            &record.entry.id.to_string(),
            serde_json::json!({
                "unlinked_bank_transactions": unlinked,
                "snapshot": serde_json::to_value(record)?,
            }),
            actor,
        ))
    }

    pub fn entry_restored(record: &EntryRecord, relinked: &[Uuid], actor: &str) -> Result<Self> {
        Ok(Event::new(
            "entry_restored",
            "journal_entry",
            &record.entry.id.to_string(),
            serde_json::json!({
                "relinked_bank_transactions": relinked,
                "snapshot": serde_json::to_value(record)?,
            }),
            actor,
        ))
    }

    pub fn line_deleted(line: &EntryLine, actor: &str) -> Result<Self> {
        Ok(Event::new(
            "line_deleted",
            "entry_line",
            &line.id.to_string(),
            serde_json::json!({ "snapshot": serde_json::to_value(line)? }),
            actor,
        ))
    }

    pub fn line_restored(line: &EntryLine, actor: &str) -> Result<Self> {
        Ok(Event::new(
            "line_restored",
            "entry_line",
            &line.id.to_string(),
            serde_json::json!({ "snapshot": serde_json::to_value(line)? }),
            actor,
        ))
    }

    pub fn account_changed(event_type: &str, account: &Account, actor: &str) -> Result<Self> {
        Ok(Event::new(
            event_type,
            "account",
            &account.id.to_string(),
            serde_json::json!({ "snapshot": serde_json::to_value(account)? }),
            actor,
        ))
    }

    pub fn transaction_imported(tx: &BankTransaction, actor: &str) -> Self {
        Event::new(
            "bank_transaction_imported",
            "bank_transaction",
            &tx.id.to_string(),
            serde_json::json!({
                "external_id": tx.external_id,
                "amount": tx.amount,
                "date": tx.transaction_date,
            }),
            actor,
        )
    }

    pub fn transaction_released(tx: &BankTransaction, actor: &str) -> Self {
        Event::new(
            "bank_transaction_released",
            "bank_transaction",
            &tx.id.to_string(),
            serde_json::json!({
                "external_id": tx.external_id,
                "previous_status": tx.status,
                "previous_linked_entry_id": tx.linked_entry_id,
            }),
            actor,
        )
    }

    /// Bank transactions an `entry_deleted` event reset to PENDING.
    pub fn unlinked_transactions(&self) -> Vec<Uuid> {
        self.data
            .get("unlinked_bank_transactions")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    /// The `snapshot` payload of a deletion/posting event.
    pub fn snapshot(&self) -> Option<&serde_json::Value> {
        self.data.get("snapshot")
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Read access to one consistent state of the ledger.
pub trait LedgerReader {
    fn line_watermark(&self) -> Result<i64>;
    /// Lines with `cursor.after < id <= cursor.watermark`, ascending, at most `limit`.
    fn scan_lines(&self, cursor: &ScanCursor, limit: usize) -> Result<Vec<LedgerLine>>;
    /// Entries with id greater than `after`, ascending, at most `limit`.
    fn scan_entries(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<EntryRecord>>;
    /// Entries that have a fingerprint, ordered by (fingerprint, id) and
    /// strictly after `after`, at most `limit`.
    fn scan_fingerprints(&self, after: Option<&FingerprintCursor>, limit: usize) -> Result<Vec<EntryFingerprint>>;
    fn get_entry(&self, id: Uuid) -> Result<Option<EntryRecord>>;
    fn get_bank_transaction(&self, id: Uuid) -> Result<Option<BankTransaction>>;
    fn find_bank_transaction(&self, external_id: &str, content_hash: &str) -> Result<Option<BankTransaction>>;
    fn scan_bank_transactions(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<BankTransaction>>;
}

pub trait LedgerStore: Send + Sync {
    // --- chart of accounts ---
    fn load_accounts(&self) -> Result<Vec<Account>>;
    /// Apply every change or none, each checked against the stored chart
    /// as left by the changes before it.
    fn apply_accounts(&self, changes: &[AccountChange], actor: &str) -> Result<()>;
    fn insert_account(&self, account: &Account, actor: &str) -> Result<()> {
        self.apply_accounts(&[AccountChange::Insert(account.clone())], actor)
    }
    fn update_account(&self, account: &Account, actor: &str) -> Result<()> {
        self.apply_accounts(&[AccountChange::Update(account.clone())], actor)
    }
    /// Removes the account row only, skipping the checks of
    /// `AccountChange::Remove`; lines that reference it are left alone.
    fn delete_account(&self, id: Uuid, actor: &str) -> Result<()>;
    fn count_lines_for_account(&self, account_id: Uuid) -> Result<usize>;

    // --- journal ---
    /// Persist an entry and its lines atomically, assigning line ids. Every
    /// line must name an existing analytic account as of the write.
    /// With `link`, the bank transaction is marked RECONCILED in the same
    /// unit; a transaction already reconciled yields `Duplicate`.
    fn insert_entry(&self, record: &EntryRecord, link: Option<Uuid>, actor: &str) -> Result<EntryRecord>;
    /// Delete an entry, cascade to its lines and reset any bank transaction
    /// linked to it back to PENDING. `None` when the entry does not exist.
    fn delete_entry(&self, id: Uuid, actor: &str) -> Result<Option<Deletion<EntryRecord>>>;
    fn delete_line(&self, line_id: i64, actor: &str) -> Result<Option<Deletion<EntryLine>>>;
    /// Re-insert a previously deleted entry with its original ids and
    /// reconcile `relink` to it again. Each of those transactions must still
    /// be PENDING and unlinked.
    fn restore_entry(&self, record: &EntryRecord, relink: &[Uuid], actor: &str) -> Result<()>;
    /// Re-insert a previously deleted line with its original id.
    fn restore_line(&self, line: &EntryLine, actor: &str) -> Result<()>;
    fn get_entry(&self, id: Uuid) -> Result<Option<EntryRecord>>;

    // --- scanning ---
    /// Run `read` against a single consistent state. Writers are not
    /// blocked, but nothing they commit meanwhile is visible to `read`.
    fn read_snapshot(&self, read: &mut dyn FnMut(&dyn LedgerReader) -> Result<()>) -> Result<()>;
    fn line_watermark(&self) -> Result<i64>;
    fn scan_lines(&self, cursor: &ScanCursor, limit: usize) -> Result<Vec<LedgerLine>>;
    fn scan_entries(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<EntryRecord>>;

    // --- bank transactions ---
    fn insert_bank_transaction(&self, tx: &BankTransaction, actor: &str) -> Result<InsertOutcome>;
    fn find_bank_transaction(&self, external_id: &str, content_hash: &str) -> Result<Option<BankTransaction>>;
    fn get_bank_transaction(&self, id: Uuid) -> Result<Option<BankTransaction>>;
    fn scan_bank_transactions(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<BankTransaction>>;
    /// Set a transaction back to PENDING and clear its link, provided the
    /// entry it points to no longer exists. Returns the transaction as it
    /// was before.
    fn release_bank_transaction(&self, id: Uuid, actor: &str) -> Result<BankTransaction>;

    // --- audit trail ---
    fn get_event(&self, event_id: &str) -> Result<Option<Event>>;
    fn events_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>>;
}

/// `read_snapshot` for callers that want a value out of the snapshot.
pub fn read_consistent<T>(
    store: &dyn LedgerStore,
    mut read: impl FnMut(&dyn LedgerReader) -> Result<T>,
) -> Result<T> {
    let mut out = None;
    store.read_snapshot(&mut |reader| {
        out = Some(read(reader)?);
        Ok(())
    })?;
    out.ok_or_else(|| LedgerError::Conflict("snapshot read did not run".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_advances_monotonically() {
        let mut cursor = ScanCursor::start(10);
        cursor.advance(4);
        cursor.advance(2);
        assert_eq!(cursor.after, 4);
        assert!(!cursor.is_exhausted());
        cursor.advance(10);
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn test_unlinked_transactions_read_from_deletion_event() {
        let tx_id = Uuid::new_v4();
        let event = Event::new(
            "entry_deleted",
            "journal_entry",
            "e-1",
            serde_json::json!({ "unlinked_bank_transactions": [tx_id] }),
            "test",
        );
        assert_eq!(event.unlinked_transactions(), vec![tx_id]);

        let bare = Event::new("entry_deleted", "journal_entry", "e-2", serde_json::json!({}), "test");
        assert!(bare.unlinked_transactions().is_empty());
    }

    #[test]
    fn test_cursor_serializes_for_checkpoints() {
        let cursor = ScanCursor { after: 42, watermark: 99 };
        let json = serde_json::to_string(&cursor).unwrap();
        let back: ScanCursor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cursor);
    }
}

/// Reader wrapper for tests that need a writer to act in the middle of a
/// multi-page scan.
#[cfg(test)]
pub(crate) mod interleave {
    use super::*;
    use std::cell::RefCell;

    pub struct InterleavedReader<'a> {
        inner: &'a dyn LedgerReader,
        after_first_page: RefCell<Option<Box<dyn FnOnce() + 'a>>>,
    }

    impl<'a> InterleavedReader<'a> {
        /// `write` runs once, right after the first page of lines is read.
        pub fn new(inner: &'a dyn LedgerReader, write: impl FnOnce() + 'a) -> Self {
            InterleavedReader {
                inner,
                after_first_page: RefCell::new(Some(Box::new(write))),
            }
        }
    }

    impl LedgerReader for InterleavedReader<'_> {
        fn line_watermark(&self) -> Result<i64> {
            self.inner.line_watermark()
        }

        fn scan_lines(&self, cursor: &ScanCursor, limit: usize) -> Result<Vec<LedgerLine>> {
            let page = self.inner.scan_lines(cursor, limit)?;
            if let Some(write) = self.after_first_page.borrow_mut().take() {
                write();
            }
            Ok(page)
        }

        fn scan_entries(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<EntryRecord>> {
            self.inner.scan_entries(after, limit)
        }

        fn scan_fingerprints(&self, after: Option<&FingerprintCursor>, limit: usize) -> Result<Vec<EntryFingerprint>> {
            self.inner.scan_fingerprints(after, limit)
        }

        fn get_entry(&self, id: Uuid) -> Result<Option<EntryRecord>> {
            self.inner.get_entry(id)
        }

        fn get_bank_transaction(&self, id: Uuid) -> Result<Option<BankTransaction>> {
            self.inner.get_bank_transaction(id)
        }

        fn find_bank_transaction(&self, external_id: &str, content_hash: &str) -> Result<Option<BankTransaction>> {
            self.inner.find_bank_transaction(external_id, content_hash)
        }

        fn scan_bank_transactions(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<BankTransaction>> {
            self.inner.scan_bank_transactions(after, limit)
        }
    }
}
