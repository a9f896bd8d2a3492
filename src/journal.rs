// 📒 Journal Store - Double-entry posting
//
// An entry is accepted only as a whole: every line validated, totals
// balanced, then written in one store transaction together with its audit
// event. Nothing is persisted on any validation failure. The chart copy held
// here only screens input early; the store checks every account again inside
// the write.

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chart::ChartOfAccounts;
use crate::entities::{EntryLine, EntryRecord, EntryTotals, NewEntry, NewLine};
use crate::error::{LedgerError, Result};
use crate::store::{Deletion, LedgerStore};

/// What `post` would write, computed without touching the store.
#[derive(Debug, Clone, Serialize)]
pub struct PostingPreview {
    pub record: EntryRecord,
    pub totals: EntryTotals,
}

pub struct JournalStore {
    store: Arc<dyn LedgerStore>,
    chart: Arc<ChartOfAccounts>,
    epsilon: Decimal,
}

impl JournalStore {
    pub fn new(store: Arc<dyn LedgerStore>, chart: Arc<ChartOfAccounts>, epsilon: Decimal) -> Self {
        JournalStore { store, chart, epsilon }
    }

    pub fn chart(&self) -> &Arc<ChartOfAccounts> {
        &self.chart
    }

    // ========================================================================
    // POSTING
    // ========================================================================

    pub fn preview(&self, entry: NewEntry, lines: Vec<NewLine>) -> Result<PostingPreview> {
        let record = self.build(entry, lines)?;
        let totals = record.totals();
        Ok(PostingPreview { record, totals })
    }

    /// Validate and persist an entry with its lines. Returns the entry id.
    pub fn post(&self, entry: NewEntry, lines: Vec<NewLine>, actor: &str) -> Result<Uuid> {
        let record = self.build(entry, lines)?;
        let stored = self.store.insert_entry(&record, None, actor)?;
        self.log_posted(&stored, None);
        Ok(stored.entry.id)
    }

    /// Post an entry and mark `bank_transaction_id` RECONCILED in the same unit.
    pub(crate) fn post_linked(
        &self,
        entry: NewEntry,
        lines: Vec<NewLine>,
        bank_transaction_id: Uuid,
        actor: &str,
    ) -> Result<EntryRecord> {
        let record = self.build(entry, lines)?;
        let stored = self.store.insert_entry(&record, Some(bank_transaction_id), actor)?;
        self.log_posted(&stored, Some(bank_transaction_id));
        Ok(stored)
    }

    fn log_posted(&self, stored: &EntryRecord, link: Option<Uuid>) {
        let totals = stored.totals();
        info!(
            entry_id = %stored.entry.id,
            entry_type = %stored.entry.entry_type,
            lines = stored.lines.len(),
            debit = %totals.debit,
            draft = stored.entry.is_draft,
            bank_transaction = ?link,
            "entry posted"
        );
    }

    /// Resolve and validate every line, then check the totals.
    fn build(&self, entry: NewEntry, lines: Vec<NewLine>) -> Result<EntryRecord> {
        if lines.len() < 2 {
            warn!(lines = lines.len(), description = %entry.description, "rejected entry with too few lines");
            return Err(LedgerError::EmptyEntry(lines.len()));
        }

        let entry = entry.into_entry();
        let mut resolved = Vec::with_capacity(lines.len());
        for line in lines {
            resolved.push(self.resolve_line(entry.id, line)?);
        }

        let record = EntryRecord { entry, lines: resolved };
        let totals = record.totals();

        // Drafts may be saved unbalanced; they never count toward balances.
        if !record.entry.is_draft && !totals.is_balanced(self.epsilon) {
            warn!(
                debit = %totals.debit,
                credit = %totals.credit,
                description = %record.entry.description,
                "rejected unbalanced entry"
            );
            return Err(LedgerError::UnbalancedEntry {
                debit: totals.debit,
                credit: totals.credit,
                difference: totals.difference(),
            });
        }

        Ok(record)
    }

    fn resolve_line(&self, entry_id: Uuid, line: NewLine) -> Result<EntryLine> {
        let invalid = |reason: &'static str| LedgerError::InvalidLine {
            account_code: line.account_code.clone(),
            reason,
        };

        if line.debit.is_sign_negative() || line.credit.is_sign_negative() {
            return Err(invalid("negative amount"));
        }
        match (line.debit.is_zero(), line.credit.is_zero()) {
            (false, false) => return Err(invalid("both debit and credit are set")),
            (true, true) => return Err(invalid("zero amount")),
            _ => {}
        }

        let account = self.chart.resolve(&line.account_code)?;
        if account.is_synthetic {
            warn!(account = %account.code, "rejected posting to synthetic account");
            return Err(LedgerError::PostingToSyntheticAccount(account.code.clone()));
        }

        Ok(EntryLine {
            id: 0,
            entry_id,
            account_id: account.id,
            debit: line.debit,
            credit: line.credit,
            description: line.description,
        })
    }

    // ========================================================================
    // VOIDING
    // ========================================================================

    /// The entry `void` would remove.
    pub fn void_preview(&self, entry_id: Uuid) -> Result<EntryRecord> {
        self.get(entry_id)
    }

    /// Remove an entry with its lines and release any bank transaction
    /// reconciled through it back to PENDING.
    pub fn void(&self, entry_id: Uuid, actor: &str) -> Result<Deletion<EntryRecord>> {
        let deletion = self
            .store
            .delete_entry(entry_id, actor)?
            .ok_or_else(|| LedgerError::not_found("journal entry", entry_id))?;

        info!(
            entry_id = %entry_id,
            lines = deletion.removed.lines.len(),
            event_id = %deletion.event_id,
            "entry voided"
        );
        Ok(deletion)
    }

    pub fn get(&self, entry_id: Uuid) -> Result<EntryRecord> {
        debug!(entry_id = %entry_id, "loading entry");
        self.store
            .get_entry(entry_id)?
            .ok_or_else(|| LedgerError::not_found("journal entry", entry_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Account, AccountNature, EntryType};
    use crate::reconciliation::RunMode;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<MemoryStore>, JournalStore) {
        let store = Arc::new(MemoryStore::new());
        for account in [
            Account::new("1.1.1.05", "Banco Sicredi", AccountNature::Debit),
            Account::new("1.1.2.01", "Clientes", AccountNature::Debit),
            Account::new("1.1.2.01.0052", "Cliente 52", AccountNature::Debit),
            Account::new("3.1.1.01", "Honorarios", AccountNature::Credit),
        ] {
            store.insert_account(&account, "test").unwrap();
        }
        let chart = ChartOfAccounts::load(store.as_ref()).unwrap();
        let journal = JournalStore::new(store.clone(), Arc::new(chart), dec!(0.01));
        (store, journal)
    }

    fn header() -> NewEntry {
        NewEntry::new(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(), "Honorarios", EntryType::Manual)
    }

    #[test]
    fn test_post_balanced_entry() {
        let (_, journal) = setup();
        let id = journal
            .post(
                header(),
                vec![
                    NewLine::debit_to("1.1.1.05", dec!(250.00)),
                    NewLine::credit_to("3.1.1.01", dec!(250.00)),
                ],
                "test",
            )
            .unwrap();

        let record = journal.get(id).unwrap();
        assert_eq!(record.lines.len(), 2);
        assert!(record.totals().is_balanced(dec!(0.01)));

        println!("✅ Balanced posting test PASSED");
    }

    #[test]
    fn test_unbalanced_entry_persists_nothing() {
        let (store, journal) = setup();
        let err = journal
            .post(
                header(),
                vec![
                    NewLine::debit_to("1.1.1.05", dec!(100.00)),
                    NewLine::credit_to("3.1.1.01", dec!(99.98)),
                ],
                "test",
            )
            .unwrap_err();

        match err {
            LedgerError::UnbalancedEntry { difference, .. } => assert_eq!(difference, dec!(0.02)),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(store.line_watermark().unwrap(), 0);
    }

    #[test]
    fn test_rounding_within_epsilon_accepted() {
        let (_, journal) = setup();
        journal
            .post(
                header(),
                vec![
                    NewLine::debit_to("1.1.1.05", dec!(100.005)),
                    NewLine::credit_to("3.1.1.01", dec!(100.00)),
                ],
                "test",
            )
            .unwrap();
    }

    #[test]
    fn test_single_line_is_empty_entry() {
        let (_, journal) = setup();
        let err = journal
            .post(header(), vec![NewLine::debit_to("1.1.1.05", dec!(1))], "test")
            .unwrap_err();
        assert!(matches!(err, LedgerError::EmptyEntry(1)));
    }

    #[test]
    fn test_synthetic_target_rejected() {
        let (store, journal) = setup();
        let err = journal
            .post(
                header(),
                vec![
                    NewLine::debit_to("1.1.2.01", dec!(10)),
                    NewLine::credit_to("3.1.1.01", dec!(10)),
                ],
                "test",
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::PostingToSyntheticAccount(code) if code == "1.1.2.01"));
        assert_eq!(store.line_watermark().unwrap(), 0);
    }

    #[test]
    fn test_invalid_lines_rejected() {
        let (_, journal) = setup();
        let both = NewLine {
            account_code: "1.1.1.05".into(),
            debit: dec!(5),
            credit: dec!(5),
            description: String::new(),
        };
        let cases = vec![
            NewLine::debit_to("1.1.1.05", dec!(-5)),
            NewLine::debit_to("1.1.1.05", dec!(0)),
            both,
        ];
        for bad in cases {
            let err = journal
                .preview(header(), vec![bad, NewLine::credit_to("3.1.1.01", dec!(5))])
                .unwrap_err();
            assert!(matches!(err, LedgerError::InvalidLine { .. }), "got {:?}", err);
        }

        let err = journal
            .preview(
                header(),
                vec![NewLine::debit_to("9.9.9", dec!(5)), NewLine::credit_to("3.1.1.01", dec!(5))],
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }

    #[test]
    fn test_draft_may_be_unbalanced() {
        let (_, journal) = setup();
        let id = journal
            .post(
                header().draft(),
                vec![
                    NewLine::debit_to("1.1.1.05", dec!(10)),
                    NewLine::credit_to("3.1.1.01", dec!(7)),
                ],
                "test",
            )
            .unwrap();
        assert!(journal.get(id).unwrap().entry.is_draft);
    }

    #[test]
    fn test_preview_does_not_persist() {
        let (store, journal) = setup();
        let preview = journal
            .preview(
                header(),
                vec![
                    NewLine::debit_to("1.1.1.05", dec!(10)),
                    NewLine::credit_to("3.1.1.01", dec!(10)),
                ],
            )
            .unwrap();
        assert_eq!(preview.totals.debit, dec!(10));
        assert!(store.get_entry(preview.record.entry.id).unwrap().is_none());
    }

    #[test]
    fn test_void_removes_entry_and_logs_snapshot() {
        let (store, journal) = setup();
        let id = journal
            .post(
                header(),
                vec![
                    NewLine::debit_to("1.1.1.05", dec!(10)),
                    NewLine::credit_to("3.1.1.01", dec!(10)),
                ],
                "test",
            )
            .unwrap();

        assert_eq!(journal.void_preview(id).unwrap().entry.id, id);
        let deletion = journal.void(id, "test").unwrap();
        assert!(matches!(journal.get(id), Err(LedgerError::NotFound { .. })));

        let event = store.get_event(&deletion.event_id).unwrap().unwrap();
        let snapshot: EntryRecord = serde_json::from_value(event.snapshot().unwrap().clone()).unwrap();
        assert_eq!(snapshot.entry.id, id);

        assert!(matches!(journal.void(id, "test"), Err(LedgerError::NotFound { .. })));
    }

    #[test]
    fn test_stale_chart_cannot_post_to_changed_accounts() {
        let (store, journal) = setup();
        let fresh = ChartOfAccounts::load(store.as_ref()).unwrap();
        let fresh = fresh
            .convert_to_synthetic(store.as_ref(), "1.1.1.05", RunMode::Apply, "admin")
            .unwrap()
            .remove_account(store.as_ref(), "3.1.1.01", RunMode::Apply, "admin")
            .unwrap();
        assert!(!fresh.contains("3.1.1.01"));

        // `journal` still holds the chart from before both changes
        let err = journal
            .post(
                header(),
                vec![
                    NewLine::debit_to("1.1.1.05", dec!(10)),
                    NewLine::credit_to("1.1.2.01.0052", dec!(10)),
                ],
                "test",
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::PostingToSyntheticAccount(code) if code == "1.1.1.05"));

        let err = journal
            .post(
                header(),
                vec![
                    NewLine::debit_to("1.1.2.01.0052", dec!(10)),
                    NewLine::credit_to("3.1.1.01", dec!(10)),
                ],
                "test",
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { kind: "account", .. }));
        assert_eq!(store.line_watermark().unwrap(), 0);

        println!("✅ Stale chart posting test PASSED");
    }
}
