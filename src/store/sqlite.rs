// 💾 SQLite store
//
// Money and dates are stored as TEXT so values round-trip exactly. Every
// mutation runs in an IMMEDIATE transaction and writes its audit event in
// the same transaction. Snapshot reads run in a DEFERRED transaction, which
// under WAL pins one committed state without blocking writers.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    AccountChange, Deletion, EntryFingerprint, Event, FingerprintCursor, InsertOutcome, LedgerLine,
    LedgerReader, LedgerStore, ScanCursor,
};
use crate::entities::{
    Account, BankTransaction, EntryLine, EntryRecord, JournalEntry, TransactionStatus,
};
use crate::error::{LedgerError, Result};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| LedgerError::LockPoisoned)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery and readers alongside the writer
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            code TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            nature TEXT NOT NULL,
            is_synthetic INTEGER NOT NULL,
            parent_id TEXT
        );

        CREATE TABLE IF NOT EXISTS journal_entries (
            id TEXT PRIMARY KEY,
            entry_date TEXT NOT NULL,
            competence_date TEXT NOT NULL,
            description TEXT NOT NULL,
            entry_type TEXT NOT NULL,
            source_type TEXT,
            reference TEXT,
            is_draft INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            fingerprint TEXT
        );

        -- Lines keep a weak reference to entry and account: legacy data may
        -- hold lines whose entry or account is gone, and the auditor must see them.
        CREATE TABLE IF NOT EXISTS entry_lines (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            debit TEXT NOT NULL,
            credit TEXT NOT NULL,
            description TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS bank_transactions (
            id TEXT PRIMARY KEY,
            transaction_date TEXT NOT NULL,
            amount TEXT NOT NULL,
            description TEXT NOT NULL,
            external_id TEXT UNIQUE NOT NULL,
            content_hash TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL,
            linked_entry_id TEXT,
            reconciled_at TEXT,
            imported_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );",
    )?;

    migrate_fingerprints(conn)?;

    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_source
            ON journal_entries(source_type, reference)
            WHERE is_draft = 0 AND source_type IS NOT NULL AND reference IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_lines_entry ON entry_lines(entry_id);
        CREATE INDEX IF NOT EXISTS idx_entries_fingerprint
            ON journal_entries(fingerprint, id) WHERE fingerprint IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_lines_account ON entry_lines(account_id);
        CREATE INDEX IF NOT EXISTS idx_bank_tx_status ON bank_transactions(status);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )?;

    Ok(())
}

/// Databases created before entries carried a fingerprint get the column
/// and have it filled in once.
fn migrate_fingerprints(conn: &Connection) -> Result<()> {
    let has_column: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('journal_entries') WHERE name = 'fingerprint'",
        [],
        |row| row.get(0),
    )?;
    if has_column {
        return Ok(());
    }

    conn.execute("ALTER TABLE journal_entries ADD COLUMN fingerprint TEXT", [])?;
    let ids: Vec<Uuid> = {
        let mut stmt = conn.prepare("SELECT id FROM journal_entries")?;
        let rows = stmt
            .query_map([], |row| uuid_at(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    for id in ids {
        refresh_fingerprint(conn, id)?;
    }
    Ok(())
}

// ============================================================================
// ROW CONVERSION
// ============================================================================

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| conversion_error(idx, e))
}

fn opt_uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| Uuid::parse_str(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn decimal_at(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn date_at(row: &Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(idx)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn datetime_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_datetime_at(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn tag_at<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse::<T>().map_err(|e| conversion_error(idx, e))
}

const ACCOUNT_COLUMNS: &str = "id, code, name, nature, is_synthetic, parent_id";

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: uuid_at(row, 0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        nature: tag_at(row, 3)?,
        is_synthetic: row.get(4)?,
        parent_id: opt_uuid_at(row, 5)?,
    })
}

const ENTRY_COLUMNS: &str = "id, entry_date, competence_date, description, entry_type, \
                             source_type, reference, is_draft, created_at";

/// Reads the nine entry columns starting at `base`.
fn entry_from_row(row: &Row, base: usize) -> rusqlite::Result<JournalEntry> {
    Ok(JournalEntry {
        id: uuid_at(row, base)?,
        entry_date: date_at(row, base + 1)?,
        competence_date: date_at(row, base + 2)?,
        description: row.get(base + 3)?,
        entry_type: tag_at(row, base + 4)?,
        source_type: row.get(base + 5)?,
        reference: row.get(base + 6)?,
        is_draft: row.get(base + 7)?,
        created_at: datetime_at(row, base + 8)?,
    })
}

const LINE_COLUMNS: &str = "id, entry_id, account_id, debit, credit, description";

fn line_from_row(row: &Row) -> rusqlite::Result<EntryLine> {
    Ok(EntryLine {
        id: row.get(0)?,
        entry_id: uuid_at(row, 1)?,
        account_id: uuid_at(row, 2)?,
        debit: decimal_at(row, 3)?,
        credit: decimal_at(row, 4)?,
        description: row.get(5)?,
    })
}

const TX_COLUMNS: &str = "id, transaction_date, amount, description, external_id, content_hash, \
                          status, linked_entry_id, reconciled_at, imported_at";

fn transaction_from_row(row: &Row) -> rusqlite::Result<BankTransaction> {
    Ok(BankTransaction {
        id: uuid_at(row, 0)?,
        transaction_date: date_at(row, 1)?,
        amount: decimal_at(row, 2)?,
        description: row.get(3)?,
        external_id: row.get(4)?,
        content_hash: row.get(5)?,
        status: tag_at(row, 6)?,
        linked_entry_id: opt_uuid_at(row, 7)?,
        reconciled_at: opt_datetime_at(row, 8)?,
        imported_at: datetime_at(row, 9)?,
    })
}

fn event_from_row(row: &Row) -> rusqlite::Result<Event> {
    let data_json: String = row.get(5)?;
    Ok(Event {
        event_id: row.get(0)?,
        timestamp: datetime_at(row, 1)?,
        event_type: row.get(2)?,
        entity_type: row.get(3)?,
        entity_id: row.get(4)?,
        data: serde_json::from_str(&data_json).map_err(|e| conversion_error(5, e))?,
        actor: row.get(6)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ============================================================================
// STATEMENT HELPERS
// ============================================================================

/// Insert event into audit trail
fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

fn write_entry_header(conn: &Connection, record: &EntryRecord) -> Result<()> {
    let entry = &record.entry;
    conn.execute(
        "INSERT INTO journal_entries (
            id, entry_date, competence_date, description, entry_type,
            source_type, reference, is_draft, created_at, fingerprint
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.id.to_string(),
            entry.entry_date.to_string(),
            entry.competence_date.to_string(),
            entry.description,
            entry.entry_type.as_str(),
            entry.source_type,
            entry.reference,
            entry.is_draft,
            entry.created_at.to_rfc3339(),
            record.fingerprint(),
        ],
    )?;
    Ok(())
}

/// Recompute the stored fingerprint after the lines of an entry changed.
fn refresh_fingerprint(conn: &Connection, entry_id: Uuid) -> Result<()> {
    if let Some(record) = load_record(conn, entry_id)? {
        conn.execute(
            "UPDATE journal_entries SET fingerprint = ?2 WHERE id = ?1",
            params![entry_id.to_string(), record.fingerprint()],
        )?;
    }
    Ok(())
}

/// Insert a line; with `id == 0` the database assigns the next sequence value.
fn write_line(conn: &Connection, line: &EntryLine) -> Result<i64> {
    let id = if line.id > 0 { Some(line.id) } else { None };
    conn.execute(
        "INSERT INTO entry_lines (id, entry_id, account_id, debit, credit, description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            line.entry_id.to_string(),
            line.account_id.to_string(),
            line.debit.to_string(),
            line.credit.to_string(),
            line.description,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn source_taken(conn: &Connection, entry: &JournalEntry) -> Result<bool> {
    if entry.is_draft {
        return Ok(false);
    }
    let (source_type, reference) = match (&entry.source_type, &entry.reference) {
        (Some(s), Some(r)) => (s, r),
        _ => return Ok(false),
    };
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM journal_entries
             WHERE is_draft = 0 AND source_type = ?1 AND reference = ?2",
            params![source_type, reference],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn load_lines(conn: &Connection, entry_id: Uuid) -> Result<Vec<EntryLine>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM entry_lines WHERE entry_id = ?1 ORDER BY id",
        LINE_COLUMNS
    ))?;
    let lines = stmt
        .query_map(params![entry_id.to_string()], line_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(lines)
}

fn load_record(conn: &Connection, id: Uuid) -> Result<Option<EntryRecord>> {
    let entry = conn
        .query_row(
            &format!("SELECT {} FROM journal_entries WHERE id = ?1", ENTRY_COLUMNS),
            params![id.to_string()],
            |row| entry_from_row(row, 0),
        )
        .optional()?;

    match entry {
        Some(entry) => {
            let lines = load_lines(conn, entry.id)?;
            Ok(Some(EntryRecord { entry, lines }))
        }
        None => Ok(None),
    }
}

fn load_transaction(conn: &Connection, sql_where: &str, key: &str) -> Result<Option<BankTransaction>> {
    let tx = conn
        .query_row(
            &format!("SELECT {} FROM bank_transactions WHERE {} = ?1", TX_COLUMNS, sql_where),
            params![key],
            transaction_from_row,
        )
        .optional()?;
    Ok(tx)
}

fn link_transaction(conn: &Connection, tx_id: Uuid, entry_id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE bank_transactions
         SET status = ?2, linked_entry_id = ?3, reconciled_at = ?4
         WHERE id = ?1",
        params![
            tx_id.to_string(),
            TransactionStatus::Reconciled.as_str(),
            entry_id.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn check_linkable(conn: &Connection, tx_id: Uuid) -> Result<()> {
    let bank_tx = load_transaction(conn, "id", &tx_id.to_string())?
        .ok_or_else(|| LedgerError::not_found("bank transaction", tx_id))?;
    if bank_tx.status != TransactionStatus::Pending || bank_tx.linked_entry_id.is_some() {
        return Err(LedgerError::duplicate("reconciliation", tx_id));
    }
    Ok(())
}

fn load_account(conn: &Connection, id: Uuid) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
            params![id.to_string()],
            account_from_row,
        )
        .optional()?;
    Ok(account)
}

fn has_children(conn: &Connection, code: &str) -> Result<bool> {
    let found: bool = conn.query_row(
        "SELECT EXISTS (
            SELECT 1 FROM accounts WHERE substr(code, 1, length(?1) + 1) = ?1 || '.'
         )",
        params![code],
        |row| row.get(0),
    )?;
    Ok(found)
}

/// Synthetic by flag or because some account sits below it.
fn is_synthetic(conn: &Connection, account: &Account) -> Result<bool> {
    Ok(account.is_synthetic || has_children(conn, &account.code)?)
}

fn count_lines(conn: &Connection, account_id: Uuid) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM entry_lines WHERE account_id = ?1",
        params![account_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Every line must land on an existing analytic account.
fn check_postable(conn: &Connection, record: &EntryRecord) -> Result<()> {
    for line in &record.lines {
        let account = load_account(conn, line.account_id)?
            .ok_or_else(|| LedgerError::not_found("account", line.account_id))?;
        if is_synthetic(conn, &account)? {
            return Err(LedgerError::PostingToSyntheticAccount(account.code));
        }
    }
    Ok(())
}

fn write_account(conn: &Connection, account: &Account, replace: bool) -> Result<usize> {
    let verb = if replace {
        "UPDATE accounts SET code = ?2, name = ?3, nature = ?4, is_synthetic = ?5, parent_id = ?6 WHERE id = ?1"
    } else {
        "INSERT INTO accounts (id, code, name, nature, is_synthetic, parent_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
    };
    let result = conn.execute(
        verb,
        params![
            account.id.to_string(),
            account.code,
            account.name,
            account.nature.as_str(),
            account.is_synthetic,
            account.parent_id.map(|id| id.to_string()),
        ],
    );
    match result {
        Ok(changed) => Ok(changed),
        Err(e) if is_constraint_violation(&e) => Err(LedgerError::duplicate("account", &account.code)),
        Err(e) => Err(e.into()),
    }
}

/// Check and write one account change inside the caller's transaction.
fn apply_account_change(conn: &Connection, change: &AccountChange, actor: &str) -> Result<()> {
    let event = match change {
        AccountChange::Insert(account) => {
            if let Some(parent_id) = account.parent_id {
                let parent = load_account(conn, parent_id)?
                    .ok_or_else(|| LedgerError::not_found("account", parent_id))?;
                if !is_synthetic(conn, &parent)? {
                    return Err(LedgerError::ParentNotSynthetic {
                        parent: parent.code,
                        child: account.code.clone(),
                    });
                }
            }
            write_account(conn, account, false)?;
            Event::account_changed("account_created", account, actor)?
        }
        AccountChange::Update(account) => {
            let current = load_account(conn, account.id)?
                .ok_or_else(|| LedgerError::not_found("account", account.id))?;
            if account.is_synthetic && !is_synthetic(conn, &current)? {
                let booked = count_lines(conn, account.id)?;
                if booked > 0 {
                    return Err(LedgerError::AccountHasLines {
                        code: current.code,
                        lines: booked,
                    });
                }
            }
            write_account(conn, account, true)?;
            Event::account_changed("account_updated", account, actor)?
        }
        AccountChange::Remove(id) => {
            let current = load_account(conn, *id)?.ok_or_else(|| LedgerError::not_found("account", id))?;
            if has_children(conn, &current.code)? {
                return Err(LedgerError::AccountHasChildren(current.code));
            }
            let booked = count_lines(conn, current.id)?;
            if booked > 0 {
                return Err(LedgerError::AccountHasLines {
                    code: current.code,
                    lines: booked,
                });
            }
            conn.execute("DELETE FROM accounts WHERE id = ?1", params![id.to_string()])?;
            Event::account_changed("account_deleted", &current, actor)?
        }
    };
    insert_event(conn, &event)
}

// ============================================================================
// READS
// ============================================================================

/// Reads through one connection, or through a transaction pinned to a
/// snapshot.
struct SqliteReader<'c>(&'c Connection);

impl LedgerReader for SqliteReader<'_> {
    fn line_watermark(&self) -> Result<i64> {
        let max: i64 = self
            .0
            .query_row("SELECT COALESCE(MAX(id), 0) FROM entry_lines", [], |row| row.get(0))?;
        Ok(max)
    }

    fn scan_lines(&self, cursor: &ScanCursor, limit: usize) -> Result<Vec<LedgerLine>> {
        let mut stmt = self.0.prepare(
            "SELECT l.id, l.entry_id, l.account_id, l.debit, l.credit, l.description,
                    e.id, e.entry_date, e.competence_date, e.description, e.entry_type,
                    e.source_type, e.reference, e.is_draft, e.created_at
             FROM entry_lines l
             LEFT JOIN journal_entries e ON e.id = l.entry_id
             WHERE l.id > ?1 AND l.id <= ?2
             ORDER BY l.id
             LIMIT ?3",
        )?;

        let lines = stmt
            .query_map(params![cursor.after, cursor.watermark, limit as i64], |row| {
                let line = line_from_row(row)?;
                let entry_id: Option<String> = row.get(6)?;
                let entry = match entry_id {
                    Some(_) => Some(entry_from_row(row, 6)?),
                    None => None,
                };
                Ok(LedgerLine { line, entry })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(lines)
    }

    fn scan_entries(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<EntryRecord>> {
        // Hyphenated lowercase uuids sort the same as their bytes
        let after = after.map(|id| id.to_string()).unwrap_or_default();
        let entries = {
            let mut stmt = self.0.prepare(&format!(
                "SELECT {} FROM journal_entries WHERE id > ?1 ORDER BY id LIMIT ?2",
                ENTRY_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![after, limit as i64], |row| entry_from_row(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        entries
            .into_iter()
            .map(|entry| {
                let lines = load_lines(self.0, entry.id)?;
                Ok(EntryRecord { entry, lines })
            })
            .collect()
    }

    fn scan_fingerprints(&self, after: Option<&FingerprintCursor>, limit: usize) -> Result<Vec<EntryFingerprint>> {
        let (key, id) = match after {
            Some(cursor) => (cursor.fingerprint.clone(), cursor.entry_id.to_string()),
            None => (String::new(), String::new()),
        };
        let mut stmt = self.0.prepare(&format!(
            "SELECT fingerprint, {} FROM journal_entries
             WHERE fingerprint IS NOT NULL
               AND (fingerprint > ?1 OR (fingerprint = ?1 AND id > ?2))
             ORDER BY fingerprint, id
             LIMIT ?3",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![key, id, limit as i64], |row| {
                Ok(EntryFingerprint {
                    fingerprint: row.get(0)?,
                    entry: entry_from_row(row, 1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_entry(&self, id: Uuid) -> Result<Option<EntryRecord>> {
        load_record(self.0, id)
    }

    fn get_bank_transaction(&self, id: Uuid) -> Result<Option<BankTransaction>> {
        load_transaction(self.0, "id", &id.to_string())
    }

    fn find_bank_transaction(&self, external_id: &str, content_hash: &str) -> Result<Option<BankTransaction>> {
        match load_transaction(self.0, "external_id", external_id)? {
            Some(found) => Ok(Some(found)),
            None => load_transaction(self.0, "content_hash", content_hash),
        }
    }

    fn scan_bank_transactions(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<BankTransaction>> {
        let after = after.map(|id| id.to_string()).unwrap_or_default();
        let mut stmt = self.0.prepare(&format!(
            "SELECT {} FROM bank_transactions WHERE id > ?1 ORDER BY id LIMIT ?2",
            TX_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![after, limit as i64], transaction_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ============================================================================
// LEDGER STORE
// ============================================================================

impl LedgerStore for SqliteStore {
    fn load_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM accounts ORDER BY code",
            ACCOUNT_COLUMNS
        ))?;
        let accounts = stmt
            .query_map([], account_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    fn apply_accounts(&self, changes: &[AccountChange], actor: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for change in changes {
            apply_account_change(&tx, change, actor)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_account(&self, id: Uuid, actor: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let account = load_account(&tx, id)?.ok_or_else(|| LedgerError::not_found("account", id))?;
        tx.execute("DELETE FROM accounts WHERE id = ?1", params![id.to_string()])?;
        insert_event(&tx, &Event::account_changed("account_deleted", &account, actor)?)?;

        tx.commit()?;
        Ok(())
    }

    fn count_lines_for_account(&self, account_id: Uuid) -> Result<usize> {
        let conn = self.lock()?;
        count_lines(&conn, account_id)
    }

    fn insert_entry(&self, record: &EntryRecord, link: Option<Uuid>, actor: &str) -> Result<EntryRecord> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        check_postable(&tx, record)?;
        if source_taken(&tx, &record.entry)? {
            return Err(LedgerError::duplicate(
                "entry source",
                record.entry.reference.as_deref().unwrap_or_default(),
            ));
        }
        if let Some(tx_id) = link {
            check_linkable(&tx, tx_id)?;
        }

        match write_entry_header(&tx, record) {
            Ok(()) => {}
            Err(LedgerError::Storage(e)) if is_constraint_violation(&e) => {
                return Err(LedgerError::duplicate("journal entry", record.entry.id));
            }
            Err(e) => return Err(e),
        }

        let mut stored = record.clone();
        for line in stored.lines.iter_mut() {
            line.entry_id = record.entry.id;
            line.id = 0;
            line.id = write_line(&tx, line)?;
        }

        if let Some(tx_id) = link {
            link_transaction(&tx, tx_id, stored.entry.id)?;
        }

        insert_event(&tx, &Event::entry_posted(&stored, link, actor)?)?;

        // Dropping `tx` without commit rolls back every write above
        tx.commit()?;
        Ok(stored)
    }

    fn delete_entry(&self, id: Uuid, actor: &str) -> Result<Option<Deletion<EntryRecord>>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record = match load_record(&tx, id)? {
            Some(record) => record,
            None => return Ok(None),
        };

        let unlinked: Vec<Uuid> = {
            let mut stmt = tx.prepare("SELECT id FROM bank_transactions WHERE linked_entry_id = ?1")?;
            let rows = stmt
                .query_map(params![id.to_string()], |row| uuid_at(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        tx.execute("DELETE FROM entry_lines WHERE entry_id = ?1", params![id.to_string()])?;
        tx.execute("DELETE FROM journal_entries WHERE id = ?1", params![id.to_string()])?;
        tx.execute(
            "UPDATE bank_transactions
             SET status = ?2, linked_entry_id = NULL, reconciled_at = NULL
             WHERE linked_entry_id = ?1",
            params![id.to_string(), TransactionStatus::Pending.as_str()],
        )?;

        let event = Event::entry_deleted(&record, &unlinked, actor)?;
        insert_event(&tx, &event)?;

        tx.commit()?;
        Ok(Some(Deletion {
            removed: record,
            event_id: event.event_id,
        }))
    }

    fn delete_line(&self, line_id: i64, actor: &str) -> Result<Option<Deletion<EntryLine>>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let line = tx
            .query_row(
                &format!("SELECT {} FROM entry_lines WHERE id = ?1", LINE_COLUMNS),
                params![line_id],
                line_from_row,
            )
            .optional()?;
        let line = match line {
            Some(line) => line,
            None => return Ok(None),
        };

        tx.execute("DELETE FROM entry_lines WHERE id = ?1", params![line_id])?;
        refresh_fingerprint(&tx, line.entry_id)?;
        let event = Event::line_deleted(&line, actor)?;
        insert_event(&tx, &event)?;

        tx.commit()?;
        Ok(Some(Deletion {
            removed: line,
            event_id: event.event_id,
        }))
    }

    fn restore_entry(&self, record: &EntryRecord, relink: &[Uuid], actor: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        check_postable(&tx, record)?;
        if source_taken(&tx, &record.entry)? {
            return Err(LedgerError::duplicate(
                "entry source",
                record.entry.reference.as_deref().unwrap_or_default(),
            ));
        }
        for tx_id in relink {
            check_linkable(&tx, *tx_id).map_err(|_| {
                LedgerError::Conflict(format!(
                    "bank transaction {} was reconciled again after entry {} was deleted",
                    tx_id, record.entry.id
                ))
            })?;
        }

        match write_entry_header(&tx, record) {
            Ok(()) => {}
            Err(LedgerError::Storage(e)) if is_constraint_violation(&e) => {
                return Err(LedgerError::duplicate("journal entry", record.entry.id));
            }
            Err(e) => return Err(e),
        }
        for line in &record.lines {
            match write_line(&tx, line) {
                Ok(_) => {}
                Err(LedgerError::Storage(e)) if is_constraint_violation(&e) => {
                    return Err(LedgerError::Conflict(format!("line id {} is already in use", line.id)));
                }
                Err(e) => return Err(e),
            }
        }
        for tx_id in relink {
            link_transaction(&tx, *tx_id, record.entry.id)?;
        }
        insert_event(&tx, &Event::entry_restored(record, relink, actor)?)?;

        tx.commit()?;
        Ok(())
    }

    fn restore_line(&self, line: &EntryLine, actor: &str) -> Result<()> {
        if line.id <= 0 {
            return Err(LedgerError::Conflict(format!("line id {} is not free", line.id)));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match write_line(&tx, line) {
            Ok(_) => {}
            Err(LedgerError::Storage(e)) if is_constraint_violation(&e) => {
                return Err(LedgerError::Conflict(format!("line id {} is not free", line.id)));
            }
            Err(e) => return Err(e),
        }
        refresh_fingerprint(&tx, line.entry_id)?;
        insert_event(&tx, &Event::line_restored(line, actor)?)?;

        tx.commit()?;
        Ok(())
    }

    fn get_entry(&self, id: Uuid) -> Result<Option<EntryRecord>> {
        let conn = self.lock()?;
        load_record(&conn, id)
    }

    fn read_snapshot(&self, read: &mut dyn FnMut(&dyn LedgerReader) -> Result<()>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        read(&SqliteReader(&tx))?;
        tx.commit()?;
        Ok(())
    }

    fn line_watermark(&self) -> Result<i64> {
        let conn = self.lock()?;
        SqliteReader(&conn).line_watermark()
    }

    fn scan_lines(&self, cursor: &ScanCursor, limit: usize) -> Result<Vec<LedgerLine>> {
        let conn = self.lock()?;
        SqliteReader(&conn).scan_lines(cursor, limit)
    }

    fn scan_entries(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<EntryRecord>> {
        let conn = self.lock()?;
        SqliteReader(&conn).scan_entries(after, limit)
    }

    fn insert_bank_transaction(&self, bank_tx: &BankTransaction, actor: &str) -> Result<InsertOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let result = tx.execute(
            "INSERT INTO bank_transactions (
                id, transaction_date, amount, description, external_id, content_hash,
                status, linked_entry_id, reconciled_at, imported_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                bank_tx.id.to_string(),
                bank_tx.transaction_date.to_string(),
                bank_tx.amount.to_string(),
                bank_tx.description,
                bank_tx.external_id,
                bank_tx.content_hash,
                bank_tx.status.as_str(),
                bank_tx.linked_entry_id.map(|id| id.to_string()),
                bank_tx.reconciled_at.map(|dt| dt.to_rfc3339()),
                bank_tx.imported_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => {
                insert_event(&tx, &Event::transaction_imported(bank_tx, actor))?;
                tx.commit()?;
                Ok(InsertOutcome::Inserted(bank_tx.clone()))
            }
            Err(e) if is_constraint_violation(&e) => {
                let existing = match load_transaction(&tx, "external_id", &bank_tx.external_id)? {
                    Some(existing) => existing,
                    None => load_transaction(&tx, "content_hash", &bank_tx.content_hash)?
                        .ok_or_else(|| LedgerError::Conflict(format!(
                            "constraint violation importing {}",
                            bank_tx.external_id
                        )))?,
                };
                Ok(InsertOutcome::Existing(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn find_bank_transaction(&self, external_id: &str, content_hash: &str) -> Result<Option<BankTransaction>> {
        let conn = self.lock()?;
        SqliteReader(&conn).find_bank_transaction(external_id, content_hash)
    }

    fn get_bank_transaction(&self, id: Uuid) -> Result<Option<BankTransaction>> {
        let conn = self.lock()?;
        SqliteReader(&conn).get_bank_transaction(id)
    }

    fn scan_bank_transactions(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<BankTransaction>> {
        let conn = self.lock()?;
        SqliteReader(&conn).scan_bank_transactions(after, limit)
    }

    fn release_bank_transaction(&self, id: Uuid, actor: &str) -> Result<BankTransaction> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let before = load_transaction(&tx, "id", &id.to_string())?
            .ok_or_else(|| LedgerError::not_found("bank transaction", id))?;
        if let Some(entry_id) = before.linked_entry_id {
            if load_record(&tx, entry_id)?.is_some() {
                return Err(LedgerError::Conflict(format!(
                    "bank transaction {} is linked to existing entry {}",
                    before.external_id, entry_id
                )));
            }
        }

        tx.execute(
            "UPDATE bank_transactions
             SET status = ?2, linked_entry_id = NULL, reconciled_at = NULL
             WHERE id = ?1",
            params![id.to_string(), TransactionStatus::Pending.as_str()],
        )?;
        insert_event(&tx, &Event::transaction_released(&before, actor))?;

        tx.commit()?;
        Ok(before)
    }

    fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        let conn = self.lock()?;
        let event = conn
            .query_row(
                "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
                 FROM events WHERE event_id = ?1",
                params![event_id],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Get events for a specific entity, newest first
    fn events_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
             FROM events
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY id DESC",
        )?;

        let events = stmt
            .query_map(params![entity_type, entity_id], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AccountNature, EntryType, FeedDirection, FeedRecord, NewEntry};
    use rust_decimal_macros::dec;

    fn create_test_accounts(store: &SqliteStore) -> (Uuid, Uuid) {
        let bank = Account::new("1.1.1.05", "Banco Sicredi", AccountNature::Debit);
        let revenue = Account::new("3.1.1.01", "Honorarios", AccountNature::Credit);
        store.insert_account(&bank, "test").unwrap();
        store.insert_account(&revenue, "test").unwrap();
        (bank.id, revenue.id)
    }

    fn create_test_record(debit_account: Uuid, credit_account: Uuid, amount: Decimal) -> EntryRecord {
        let entry = NewEntry::new(
            NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            "Honorarios janeiro",
            EntryType::Manual,
        )
        .into_entry();
        let line = |account_id, debit, credit| EntryLine {
            id: 0,
            entry_id: entry.id,
            account_id,
            debit,
            credit,
            description: String::new(),
        };
        let lines = vec![
            line(debit_account, amount, Decimal::ZERO),
            line(credit_account, Decimal::ZERO, amount),
        ];
        EntryRecord { entry, lines }
    }

    fn feed(external_id: &str, amount: Decimal, memo: &str) -> BankTransaction {
        FeedRecord {
            direction: FeedDirection::Credit,
            date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            amount,
            external_id: external_id.to_string(),
            memo: memo.to_string(),
        }
        .into_transaction()
        .unwrap()
    }

    #[test]
    fn test_entry_round_trips_exact_decimals() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (bank, revenue) = create_test_accounts(&store);
        let record = create_test_record(bank, revenue, dec!(173116.65));

        let stored = store.insert_entry(&record, None, "test").unwrap();
        let loaded = store.get_entry(stored.entry.id).unwrap().unwrap();

        assert_eq!(loaded, stored);
        assert_eq!(loaded.lines[0].debit, dec!(173116.65));
        assert!(loaded.lines.iter().all(|l| l.id > 0));

        println!("✅ Decimal round-trip test PASSED");
    }

    #[test]
    fn test_idempotent_feed_import() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tx = feed("FIT-1", dec!(100), "PIX AMPLA");

        assert!(matches!(
            store.insert_bank_transaction(&tx, "test").unwrap(),
            InsertOutcome::Inserted(_)
        ));

        // Same external id
        let again = feed("FIT-1", dec!(100), "PIX AMPLA");
        match store.insert_bank_transaction(&again, "test").unwrap() {
            InsertOutcome::Existing(existing) => assert_eq!(existing.id, tx.id),
            other => panic!("expected existing, got {:?}", other),
        }

        // Same content, different external id
        let same_content = feed("FIT-2", dec!(100), "pix ampla");
        assert!(matches!(
            store.insert_bank_transaction(&same_content, "test").unwrap(),
            InsertOutcome::Existing(_)
        ));

        assert_eq!(store.scan_bank_transactions(None, 10).unwrap().len(), 1);
        println!("✅ Idempotent import test PASSED");
    }

    #[test]
    fn test_link_is_atomic_and_exclusive() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (bank, revenue) = create_test_accounts(&store);
        let bank_tx = feed("FIT-1", dec!(50), "PIX");
        store.insert_bank_transaction(&bank_tx, "test").unwrap();

        let first = create_test_record(bank, revenue, dec!(50));
        let stored = store.insert_entry(&first, Some(bank_tx.id), "test").unwrap();

        let reconciled = store.get_bank_transaction(bank_tx.id).unwrap().unwrap();
        assert_eq!(reconciled.status, TransactionStatus::Reconciled);
        assert_eq!(reconciled.linked_entry_id, Some(stored.entry.id));
        assert!(reconciled.reconciled_at.is_some());

        // Second link attempt fails and leaves nothing behind
        let second = create_test_record(bank, revenue, dec!(50));
        let err = store.insert_entry(&second, Some(bank_tx.id), "test").unwrap_err();
        assert!(matches!(err, LedgerError::Duplicate { .. }));
        assert!(store.get_entry(second.entry.id).unwrap().is_none());
        assert_eq!(store.line_watermark().unwrap(), 2);

        // Deleting the entry resets the transaction
        store.delete_entry(stored.entry.id, "test").unwrap();
        let pending = store.get_bank_transaction(bank_tx.id).unwrap().unwrap();
        assert_eq!(pending.status, TransactionStatus::Pending);
        assert!(pending.linked_entry_id.is_none());
        assert!(pending.reconciled_at.is_none());
    }

    #[test]
    fn test_source_reference_is_unique_for_posted_entries() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (bank, revenue) = create_test_accounts(&store);
        let mut a = create_test_record(bank, revenue, dec!(10));
        a.entry.source_type = Some("payroll".into());
        a.entry.reference = Some("2025-01".into());
        let mut b = create_test_record(bank, revenue, dec!(10));
        b.entry.source_type = a.entry.source_type.clone();
        b.entry.reference = a.entry.reference.clone();

        store.insert_entry(&a, None, "test").unwrap();
        let err = store.insert_entry(&b, None, "test").unwrap_err();
        assert!(matches!(err, LedgerError::Duplicate { .. }));
    }

    #[test]
    fn test_orphan_lines_visible_in_scan() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (bank, revenue) = create_test_accounts(&store);
        let stored = store
            .insert_entry(&create_test_record(bank, revenue, dec!(5)), None, "test")
            .unwrap();

        // Simulate legacy damage: header gone, lines left behind
        {
            let conn = store.lock().unwrap();
            conn.execute(
                "DELETE FROM journal_entries WHERE id = ?1",
                params![stored.entry.id.to_string()],
            )
            .unwrap();
        }

        let cursor = ScanCursor::start(store.line_watermark().unwrap());
        let page = store.scan_lines(&cursor, 10).unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|l| l.entry.is_none()));
    }

    #[test]
    fn test_restore_reuses_original_ids_and_relinks() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (bank, revenue) = create_test_accounts(&store);
        let bank_tx = feed("FIT-1", dec!(5), "PIX");
        store.insert_bank_transaction(&bank_tx, "test").unwrap();
        let stored = store
            .insert_entry(&create_test_record(bank, revenue, dec!(5)), Some(bank_tx.id), "test")
            .unwrap();

        let deletion = store.delete_entry(stored.entry.id, "test").unwrap().unwrap();
        store.restore_entry(&deletion.removed, &[bank_tx.id], "test").unwrap();

        assert_eq!(store.get_entry(stored.entry.id).unwrap().unwrap(), stored);
        let relinked = store.get_bank_transaction(bank_tx.id).unwrap().unwrap();
        assert_eq!(relinked.status, TransactionStatus::Reconciled);
        assert_eq!(relinked.linked_entry_id, Some(stored.entry.id));

        let events = store
            .events_for_entity("journal_entry", &stored.entry.id.to_string())
            .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, "entry_restored");
        assert_eq!(events[0].data["relinked_bank_transactions"][0], bank_tx.id.to_string());
    }

    #[test]
    fn test_account_persistence() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut account = Account::new("1.1.1.05", "Banco Sicredi", AccountNature::Debit);
        store.insert_account(&account, "test").unwrap();

        account.name = "Banco Sicredi S.A.".into();
        store.update_account(&account, "test").unwrap();

        let accounts = store.load_accounts().unwrap();
        assert_eq!(accounts, vec![account.clone()]);

        store.delete_account(account.id, "test").unwrap();
        assert!(store.load_accounts().unwrap().is_empty());
    }

    #[test]
    fn test_posting_rechecks_chart_inside_transaction() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (bank, revenue) = create_test_accounts(&store);

        // legacy child without parent link still makes 1.1.1.05 synthetic
        store
            .insert_account(&Account::new("1.1.1.05.01", "Conta movimento", AccountNature::Debit), "test")
            .unwrap();
        let err = store
            .insert_entry(&create_test_record(bank, revenue, dec!(5)), None, "test")
            .unwrap_err();
        assert!(matches!(err, LedgerError::PostingToSyntheticAccount(code) if code == "1.1.1.05"));

        store.delete_account(revenue, "test").unwrap();
        let child = store.load_accounts().unwrap()[1].id;
        let err = store
            .insert_entry(&create_test_record(child, revenue, dec!(5)), None, "test")
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { kind: "account", .. }));
        assert_eq!(store.line_watermark().unwrap(), 0);
    }

    #[test]
    fn test_account_batch_rolls_back_on_failure() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (bank, revenue) = create_test_accounts(&store);
        store
            .insert_entry(&create_test_record(bank, revenue, dec!(5)), None, "test")
            .unwrap();

        let group = Account::new("4", "Despesas", AccountNature::Debit);
        let err = store
            .apply_accounts(&[AccountChange::Insert(group.clone()), AccountChange::Remove(revenue)], "test")
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountHasLines { lines: 1, .. }));
        assert_eq!(store.load_accounts().unwrap().len(), 2);
        assert!(store.events_for_entity("account", &group.id.to_string()).unwrap().is_empty());
    }

    #[test]
    fn test_fingerprint_follows_line_changes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (bank, revenue) = create_test_accounts(&store);
        let stored = store
            .insert_entry(&create_test_record(bank, revenue, dec!(40)), None, "test")
            .unwrap();

        let fingerprints = |store: &SqliteStore| {
            let mut found = Vec::new();
            store
                .read_snapshot(&mut |reader| {
                    found = reader.scan_fingerprints(None, 10)?;
                    Ok(())
                })
                .unwrap();
            found
        };
        assert_eq!(fingerprints(&store)[0].fingerprint, "HONORARIOS JANEIRO|40|2025-01-10");

        let deletion = store.delete_line(stored.lines[0].id, "test").unwrap().unwrap();
        assert_eq!(fingerprints(&store)[0].fingerprint, "HONORARIOS JANEIRO|0|2025-01-10");

        store.restore_line(&deletion.removed, "test").unwrap();
        store.delete_line(stored.lines[0].id, "test").unwrap();
        store.delete_line(stored.lines[1].id, "test").unwrap();
        assert!(fingerprints(&store).is_empty(), "entries without lines are not duplicate candidates");
    }

    #[test]
    fn test_old_database_gains_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let store = SqliteStore::open(&path).unwrap();
        let (bank, revenue) = create_test_accounts(&store);
        store
            .insert_entry(&create_test_record(bank, revenue, dec!(7)), None, "test")
            .unwrap();
        {
            let conn = store.lock().unwrap();
            conn.execute_batch(
                "DROP INDEX idx_entries_fingerprint;
                 ALTER TABLE journal_entries DROP COLUMN fingerprint;",
            )
            .unwrap();
        }
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        let conn = reopened.lock().unwrap();
        let fingerprint: Option<String> = conn
            .query_row("SELECT fingerprint FROM journal_entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fingerprint.as_deref(), Some("HONORARIOS JANEIRO|7|2025-01-10"));
    }

    #[test]
    fn test_snapshot_hides_writes_committed_during_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let reader = SqliteStore::open(&path).unwrap();
        let writer = SqliteStore::open(&path).unwrap();
        let (bank, revenue) = create_test_accounts(&writer);
        let first = writer
            .insert_entry(&create_test_record(bank, revenue, dec!(10)), None, "test")
            .unwrap();

        reader
            .read_snapshot(&mut |snapshot| {
                let watermark = snapshot.line_watermark()?;
                writer.delete_entry(first.entry.id, "test")?;
                writer.insert_entry(&create_test_record(bank, revenue, dec!(20)), None, "test")?;

                let lines = snapshot.scan_lines(&ScanCursor::start(watermark), 10)?;
                assert_eq!(lines.len(), 2);
                assert!(lines.iter().all(|l| l.entry.is_some()));
                assert!(snapshot.get_entry(first.entry.id)?.is_some());
                Ok(())
            })
            .unwrap();

        assert!(reader.get_entry(first.entry.id).unwrap().is_none());
        assert_eq!(reader.line_watermark().unwrap(), 4);

        println!("✅ Snapshot isolation test PASSED");
    }
}
