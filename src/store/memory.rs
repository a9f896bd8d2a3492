// In-memory store
// Same constraints as the SQLite store, guarded by a single RwLock so every
// mutation is atomic with respect to readers.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::{
    AccountChange, Deletion, EntryFingerprint, Event, FingerprintCursor, InsertOutcome, LedgerLine,
    LedgerReader, LedgerStore, ScanCursor,
};
use crate::entities::account::is_ancestor_code;
use crate::entities::{Account, BankTransaction, EntryLine, EntryRecord, JournalEntry, TransactionStatus};
use crate::error::{LedgerError, Result};

#[derive(Default)]
struct MemoryState {
    accounts: BTreeMap<Uuid, Account>,
    entries: BTreeMap<Uuid, JournalEntry>,
    lines: BTreeMap<i64, EntryLine>,
    last_line_id: i64,
    bank_transactions: BTreeMap<Uuid, BankTransaction>,
    events: Vec<Event>,
}

fn is_synthetic_in(accounts: &BTreeMap<Uuid, Account>, account: &Account) -> bool {
    account.is_synthetic || accounts.values().any(|a| is_ancestor_code(&account.code, &a.code))
}

fn lines_on(lines: &BTreeMap<i64, EntryLine>, account_id: Uuid) -> usize {
    lines.values().filter(|l| l.account_id == account_id).count()
}

/// Apply one change to `accounts`, returning the event that records it.
fn apply_account_change(
    accounts: &mut BTreeMap<Uuid, Account>,
    lines: &BTreeMap<i64, EntryLine>,
    change: &AccountChange,
    actor: &str,
) -> Result<Event> {
    match change {
        AccountChange::Insert(account) => {
            if accounts.contains_key(&account.id) || accounts.values().any(|a| a.code == account.code) {
                return Err(LedgerError::duplicate("account", &account.code));
            }
            if let Some(parent_id) = account.parent_id {
                let parent = accounts
                    .get(&parent_id)
                    .ok_or_else(|| LedgerError::not_found("account", parent_id))?;
                if !is_synthetic_in(accounts, parent) {
                    return Err(LedgerError::ParentNotSynthetic {
                        parent: parent.code.clone(),
                        child: account.code.clone(),
                    });
                }
            }
            accounts.insert(account.id, account.clone());
            Event::account_changed("account_created", account, actor)
        }
        AccountChange::Update(account) => {
            let current = accounts
                .get(&account.id)
                .ok_or_else(|| LedgerError::not_found("account", account.id))?;
            if accounts.values().any(|a| a.id != account.id && a.code == account.code) {
                return Err(LedgerError::duplicate("account", &account.code));
            }
            if account.is_synthetic && !is_synthetic_in(accounts, current) {
                let booked = lines_on(lines, account.id);
                if booked > 0 {
                    return Err(LedgerError::AccountHasLines {
                        code: current.code.clone(),
                        lines: booked,
                    });
                }
            }
            accounts.insert(account.id, account.clone());
            Event::account_changed("account_updated", account, actor)
        }
        AccountChange::Remove(id) => {
            let current = accounts
                .get(id)
                .cloned()
                .ok_or_else(|| LedgerError::not_found("account", id))?;
            if accounts.values().any(|a| is_ancestor_code(&current.code, &a.code)) {
                return Err(LedgerError::AccountHasChildren(current.code));
            }
            let booked = lines_on(lines, current.id);
            if booked > 0 {
                return Err(LedgerError::AccountHasLines {
                    code: current.code,
                    lines: booked,
                });
            }
            accounts.remove(id);
            Event::account_changed("account_deleted", &current, actor)
        }
    }
}

impl MemoryState {
    fn lines_of(&self, entry_id: Uuid) -> Vec<EntryLine> {
        self.lines
            .values()
            .filter(|l| l.entry_id == entry_id)
            .cloned()
            .collect()
    }

    fn record(&self, entry_id: Uuid) -> Option<EntryRecord> {
        self.entries.get(&entry_id).map(|entry| EntryRecord {
            entry: entry.clone(),
            lines: self.lines_of(entry_id),
        })
    }

    fn source_taken(&self, record: &EntryRecord) -> bool {
        let entry = &record.entry;
        if entry.is_draft {
            return false;
        }
        match (&entry.source_type, &entry.reference) {
            (Some(source_type), Some(reference)) => self.entries.values().any(|e| {
                !e.is_draft
                    && e.id != entry.id
                    && e.source_type.as_deref() == Some(source_type.as_str())
                    && e.reference.as_deref() == Some(reference.as_str())
            }),
            _ => false,
        }
    }

    /// Every line must land on an existing analytic account.
    fn check_postable(&self, record: &EntryRecord) -> Result<()> {
        for line in &record.lines {
            let account = self
                .accounts
                .get(&line.account_id)
                .ok_or_else(|| LedgerError::not_found("account", line.account_id))?;
            if is_synthetic_in(&self.accounts, account) {
                return Err(LedgerError::PostingToSyntheticAccount(account.code.clone()));
            }
        }
        Ok(())
    }

    fn check_linkable(&self, tx_id: Uuid) -> Result<()> {
        let tx = self
            .bank_transactions
            .get(&tx_id)
            .ok_or_else(|| LedgerError::not_found("bank transaction", tx_id))?;
        if tx.status != TransactionStatus::Pending || tx.linked_entry_id.is_some() {
            return Err(LedgerError::duplicate("reconciliation", tx_id));
        }
        Ok(())
    }

    fn link(&mut self, tx_id: Uuid, entry_id: Uuid) {
        if let Some(tx) = self.bank_transactions.get_mut(&tx_id) {
            tx.status = TransactionStatus::Reconciled;
            tx.linked_entry_id = Some(entry_id);
            tx.reconciled_at = Some(chrono::Utc::now());
        }
    }
}

impl LedgerReader for MemoryState {
    fn line_watermark(&self) -> Result<i64> {
        Ok(self.lines.keys().next_back().copied().unwrap_or(0))
    }

    fn scan_lines(&self, cursor: &ScanCursor, limit: usize) -> Result<Vec<LedgerLine>> {
        if cursor.after >= cursor.watermark {
            return Ok(Vec::new());
        }
        Ok(self
            .lines
            .range((cursor.after + 1)..=cursor.watermark)
            .take(limit)
            .map(|(_, line)| LedgerLine {
                line: line.clone(),
                entry: self.entries.get(&line.entry_id).cloned(),
            })
            .collect())
    }

    fn scan_entries(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<EntryRecord>> {
        let ids: Vec<Uuid> = match after {
            Some(after) => self
                .entries
                .range((Bound::Excluded(after), Bound::Unbounded))
                .take(limit)
                .map(|(id, _)| *id)
                .collect(),
            None => self.entries.keys().take(limit).copied().collect(),
        };
        Ok(ids.into_iter().filter_map(|id| self.record(id)).collect())
    }

    fn scan_fingerprints(&self, after: Option<&FingerprintCursor>, limit: usize) -> Result<Vec<EntryFingerprint>> {
        let mut keyed: Vec<EntryFingerprint> = self
            .entries
            .keys()
            .filter_map(|id| self.record(*id))
            .filter_map(|record| {
                record.fingerprint().map(|fingerprint| EntryFingerprint {
                    fingerprint,
                    entry: record.entry,
                })
            })
            .filter(|item| match after {
                Some(cursor) => {
                    (item.fingerprint.as_str(), item.entry.id) > (cursor.fingerprint.as_str(), cursor.entry_id)
                }
                None => true,
            })
            .collect();
        keyed.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint).then(a.entry.id.cmp(&b.entry.id)));
        keyed.truncate(limit);
        Ok(keyed)
    }

    fn get_entry(&self, id: Uuid) -> Result<Option<EntryRecord>> {
        Ok(self.record(id))
    }

    fn get_bank_transaction(&self, id: Uuid) -> Result<Option<BankTransaction>> {
        Ok(self.bank_transactions.get(&id).cloned())
    }

    fn find_bank_transaction(&self, external_id: &str, content_hash: &str) -> Result<Option<BankTransaction>> {
        // external id wins over content when both would match different rows
        let by_external = self
            .bank_transactions
            .values()
            .find(|t| t.external_id == external_id);
        Ok(by_external
            .or_else(|| self.bank_transactions.values().find(|t| t.content_hash == content_hash))
            .cloned())
    }

    fn scan_bank_transactions(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<BankTransaction>> {
        let iter: Box<dyn Iterator<Item = &BankTransaction>> = match after {
            Some(after) => Box::new(
                self.bank_transactions
                    .range((Bound::Excluded(after), Bound::Unbounded))
                    .map(|(_, tx)| tx),
            ),
            None => Box::new(self.bank_transactions.values()),
        };
        Ok(iter.take(limit).cloned().collect())
    }
}

/// Test double and embedded store.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state.read().map_err(|_| LedgerError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state.write().map_err(|_| LedgerError::LockPoisoned)
    }
}

impl LedgerStore for MemoryStore {
    fn load_accounts(&self) -> Result<Vec<Account>> {
        let state = self.read()?;
        let mut accounts: Vec<Account> = state.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(accounts)
    }

    fn apply_accounts(&self, changes: &[AccountChange], actor: &str) -> Result<()> {
        let mut state = self.write()?;

        // Work on a copy; the state is only touched once every change passed.
        let mut accounts = state.accounts.clone();
        let mut events = Vec::with_capacity(changes.len());
        for change in changes {
            events.push(apply_account_change(&mut accounts, &state.lines, change, actor)?);
        }

        state.accounts = accounts;
        state.events.extend(events);
        Ok(())
    }

    fn delete_account(&self, id: Uuid, actor: &str) -> Result<()> {
        let mut state = self.write()?;
        let account = state
            .accounts
            .remove(&id)
            .ok_or_else(|| LedgerError::not_found("account", id))?;
        let event = Event::account_changed("account_deleted", &account, actor)?;
        state.events.push(event);
        Ok(())
    }

    fn count_lines_for_account(&self, account_id: Uuid) -> Result<usize> {
        let state = self.read()?;
        Ok(lines_on(&state.lines, account_id))
    }

    fn insert_entry(&self, record: &EntryRecord, link: Option<Uuid>, actor: &str) -> Result<EntryRecord> {
        let mut state = self.write()?;

        if state.entries.contains_key(&record.entry.id) {
            return Err(LedgerError::duplicate("journal entry", record.entry.id));
        }
        state.check_postable(record)?;
        if state.source_taken(record) {
            return Err(LedgerError::duplicate(
                "entry source",
                record.entry.reference.as_deref().unwrap_or_default(),
            ));
        }
        if let Some(tx_id) = link {
            state.check_linkable(tx_id)?;
        }

        // All checks passed; from here on nothing can fail.
        let mut stored = record.clone();
        for line in stored.lines.iter_mut() {
            state.last_line_id += 1;
            line.id = state.last_line_id;
            line.entry_id = record.entry.id;
        }
        let event = Event::entry_posted(&stored, link, actor)?;

        state.entries.insert(stored.entry.id, stored.entry.clone());
        for line in &stored.lines {
            state.lines.insert(line.id, line.clone());
        }
        if let Some(tx_id) = link {
            state.link(tx_id, stored.entry.id);
        }
        state.events.push(event);

        Ok(stored)
    }

    fn delete_entry(&self, id: Uuid, actor: &str) -> Result<Option<Deletion<EntryRecord>>> {
        let mut state = self.write()?;
        let record = match state.record(id) {
            Some(record) => record,
            None => return Ok(None),
        };

        let unlinked: Vec<Uuid> = state
            .bank_transactions
            .values()
            .filter(|tx| tx.linked_entry_id == Some(id))
            .map(|tx| tx.id)
            .collect();
        let event = Event::entry_deleted(&record, &unlinked, actor)?;

        state.entries.remove(&id);
        state.lines.retain(|_, line| line.entry_id != id);
        for tx_id in &unlinked {
            if let Some(tx) = state.bank_transactions.get_mut(tx_id) {
                tx.status = TransactionStatus::Pending;
                tx.linked_entry_id = None;
                tx.reconciled_at = None;
            }
        }
        let event_id = event.event_id.clone();
        state.events.push(event);

        Ok(Some(Deletion {
            removed: record,
            event_id,
        }))
    }

    fn delete_line(&self, line_id: i64, actor: &str) -> Result<Option<Deletion<EntryLine>>> {
        let mut state = self.write()?;
        let line = match state.lines.get(&line_id) {
            Some(line) => line.clone(),
            None => return Ok(None),
        };
        let event = Event::line_deleted(&line, actor)?;
        state.lines.remove(&line_id);
        let event_id = event.event_id.clone();
        state.events.push(event);
        Ok(Some(Deletion {
            removed: line,
            event_id,
        }))
    }

    fn restore_entry(&self, record: &EntryRecord, relink: &[Uuid], actor: &str) -> Result<()> {
        let mut state = self.write()?;
        if state.entries.contains_key(&record.entry.id) {
            return Err(LedgerError::duplicate("journal entry", record.entry.id));
        }
        if record.lines.iter().any(|l| state.lines.contains_key(&l.id)) {
            return Err(LedgerError::Conflict(format!(
                "line ids of entry {} are already in use",
                record.entry.id
            )));
        }
        state.check_postable(record)?;
        if state.source_taken(record) {
            return Err(LedgerError::duplicate(
                "entry source",
                record.entry.reference.as_deref().unwrap_or_default(),
            ));
        }
        for tx_id in relink {
            state.check_linkable(*tx_id).map_err(|_| {
                LedgerError::Conflict(format!(
                    "bank transaction {} was reconciled again after entry {} was deleted",
                    tx_id, record.entry.id
                ))
            })?;
        }

        let event = Event::entry_restored(record, relink, actor)?;
        state.entries.insert(record.entry.id, record.entry.clone());
        for line in &record.lines {
            state.last_line_id = state.last_line_id.max(line.id);
            state.lines.insert(line.id, line.clone());
        }
        for tx_id in relink {
            state.link(*tx_id, record.entry.id);
        }
        state.events.push(event);
        Ok(())
    }

    fn restore_line(&self, line: &EntryLine, actor: &str) -> Result<()> {
        let mut state = self.write()?;
        if line.id <= 0 || state.lines.contains_key(&line.id) {
            return Err(LedgerError::Conflict(format!("line id {} is not free", line.id)));
        }
        let event = Event::line_restored(line, actor)?;
        state.last_line_id = state.last_line_id.max(line.id);
        state.lines.insert(line.id, line.clone());
        state.events.push(event);
        Ok(())
    }

    fn get_entry(&self, id: Uuid) -> Result<Option<EntryRecord>> {
        Ok(self.read()?.record(id))
    }

    fn read_snapshot(&self, read: &mut dyn FnMut(&dyn LedgerReader) -> Result<()>) -> Result<()> {
        let state = self.read()?;
        read(&*state)
    }

    fn line_watermark(&self) -> Result<i64> {
        self.read()?.line_watermark()
    }

    fn scan_lines(&self, cursor: &ScanCursor, limit: usize) -> Result<Vec<LedgerLine>> {
        self.read()?.scan_lines(cursor, limit)
    }

    fn scan_entries(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<EntryRecord>> {
        self.read()?.scan_entries(after, limit)
    }

    fn insert_bank_transaction(&self, tx: &BankTransaction, actor: &str) -> Result<InsertOutcome> {
        let mut state = self.write()?;
        if let Some(existing) = state
            .bank_transactions
            .values()
            .find(|t| t.external_id == tx.external_id || t.content_hash == tx.content_hash)
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        state.bank_transactions.insert(tx.id, tx.clone());
        state.events.push(Event::transaction_imported(tx, actor));
        Ok(InsertOutcome::Inserted(tx.clone()))
    }

    fn find_bank_transaction(&self, external_id: &str, content_hash: &str) -> Result<Option<BankTransaction>> {
        self.read()?.find_bank_transaction(external_id, content_hash)
    }

    fn get_bank_transaction(&self, id: Uuid) -> Result<Option<BankTransaction>> {
        self.read()?.get_bank_transaction(id)
    }

    fn scan_bank_transactions(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<BankTransaction>> {
        self.read()?.scan_bank_transactions(after, limit)
    }

    fn release_bank_transaction(&self, id: Uuid, actor: &str) -> Result<BankTransaction> {
        let mut state = self.write()?;
        let before = state
            .bank_transactions
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("bank transaction", id))?;
        if let Some(entry_id) = before.linked_entry_id {
            if state.entries.contains_key(&entry_id) {
                return Err(LedgerError::Conflict(format!(
                    "bank transaction {} is linked to existing entry {}",
                    before.external_id, entry_id
                )));
            }
        }

        if let Some(tx) = state.bank_transactions.get_mut(&id) {
            tx.status = TransactionStatus::Pending;
            tx.linked_entry_id = None;
            tx.reconciled_at = None;
        }
        state.events.push(Event::transaction_released(&before, actor));
        Ok(before)
    }

    fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        let state = self.read()?;
        Ok(state.events.iter().find(|e| e.event_id == event_id).cloned())
    }

    fn events_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        let state = self.read()?;
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect())
    }
}
