// 📊 Balance Calculator - Trial balance over a period
//
// Lines are streamed in bounded pages under one watermark, all inside one
// read snapshot, so a report is computed over a single committed state no
// matter how many pages it takes or what gets posted or voided meanwhile.
//
//   closing = opening + period_debit - period_credit   (DEBIT nature)
//   closing = opening + period_credit - period_debit   (CREDIT nature)
//
// Synthetic accounts are the sum of their direct children.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chart::ChartOfAccounts;
use crate::entities::{Account, AccountNature, EntryType};
use crate::error::{LedgerError, Result};
use crate::store::{read_consistent, LedgerReader, LedgerStore, ScanCursor};

// ============================================================================
// REPORT TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountBalance {
    pub account_id: Uuid,
    pub code: String,
    pub name: String,
    pub nature: AccountNature,
    pub is_synthetic: bool,
    pub opening_balance: Decimal,
    pub period_debit: Decimal,
    pub period_credit: Decimal,
    pub closing_balance: Decimal,
}

impl AccountBalance {
    fn empty(account: &Account) -> Self {
        AccountBalance {
            account_id: account.id,
            code: account.code.clone(),
            name: account.name.clone(),
            nature: account.nature,
            is_synthetic: account.is_synthetic,
            opening_balance: Decimal::ZERO,
            period_debit: Decimal::ZERO,
            period_credit: Decimal::ZERO,
            closing_balance: Decimal::ZERO,
        }
    }

    /// Any non-zero figure.
    pub fn has_movement(&self) -> bool {
        !(self.opening_balance.is_zero()
            && self.period_debit.is_zero()
            && self.period_credit.is_zero()
            && self.closing_balance.is_zero())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrphanReason {
    MissingEntry,
    MissingAccount,
}

/// A line left out of every balance because it cannot be attributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedLine {
    pub line_id: i64,
    pub entry_id: Uuid,
    pub account_id: Uuid,
    pub amount: Decimal,
    pub reason: OrphanReason,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceFilter {
    /// Drop accounts whose figures are all zero
    pub only_moved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceReport {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub balances: Vec<AccountBalance>,
    pub orphaned_lines: Vec<OrphanedLine>,

    /// Lines booked directly to synthetic accounts, excluded from figures
    pub misposted_lines: Vec<i64>,

    pub lines_scanned: usize,
}

impl BalanceReport {
    pub fn get(&self, code: &str) -> Option<&AccountBalance> {
        self.balances.iter().find(|b| b.code == code)
    }

    /// Σ period debits − Σ period credits over analytic accounts. Zero for
    /// a ledger made only of balanced entries.
    pub fn trial_balance_difference(&self) -> Decimal {
        self.balances
            .iter()
            .filter(|b| !b.is_synthetic)
            .map(|b| b.period_debit - b.period_credit)
            .sum()
    }

    pub fn summary(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!(
            "📊 Balances {} .. {}\n",
            self.period_start, self.period_end
        ));
        output.push_str(&format!(
            "{:<20} {:<30} {:>15} {:>15} {:>15} {:>15}\n",
            "Code", "Name", "Opening", "Debit", "Credit", "Closing"
        ));
        for b in &self.balances {
            output.push_str(&format!(
                "{:<20} {:<30} {:>15} {:>15} {:>15} {:>15}\n",
                b.code,
                truncate(&b.name, 30),
                b.opening_balance,
                b.period_debit,
                b.period_credit,
                b.closing_balance
            ));
        }
        output.push_str(&format!(
            "Lines scanned: {} | Trial balance difference: {}\n",
            self.lines_scanned,
            self.trial_balance_difference()
        ));
        if !self.orphaned_lines.is_empty() {
            output.push_str(&format!("⚠️  Orphaned lines excluded: {}\n", self.orphaned_lines.len()));
        }
        if !self.misposted_lines.is_empty() {
            output.push_str(&format!(
                "⚠️  Lines on synthetic accounts excluded: {}\n",
                self.misposted_lines.len()
            ));
        }
        output
    }
}

fn truncate(text: &str, width: usize) -> String {
    text.chars().take(width).collect()
}

// ============================================================================
// CALCULATOR
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Figures {
    opening: Decimal,
    debit: Decimal,
    credit: Decimal,
    closing: Decimal,
}

impl Figures {
    fn add(&mut self, other: &Figures) {
        self.opening += other.opening;
        self.debit += other.debit;
        self.credit += other.credit;
        self.closing += other.closing;
    }
}

pub struct BalanceCalculator {
    store: Arc<dyn LedgerStore>,
    chart: Arc<ChartOfAccounts>,
    batch_size: usize,
}

impl BalanceCalculator {
    pub fn new(store: Arc<dyn LedgerStore>, chart: Arc<ChartOfAccounts>, batch_size: usize) -> Self {
        BalanceCalculator {
            store,
            chart,
            batch_size: batch_size.max(1),
        }
    }

    /// Every account of the chart, in code order.
    pub fn balances(&self, period_start: NaiveDate, period_end: NaiveDate) -> Result<Vec<AccountBalance>> {
        Ok(self
            .report(period_start, period_end, BalanceFilter::default())?
            .balances)
    }

    pub fn balance_of(&self, code: &str, period_start: NaiveDate, period_end: NaiveDate) -> Result<AccountBalance> {
        self.chart.resolve(code)?;
        let report = self.report(period_start, period_end, BalanceFilter::default())?;
        report
            .balances
            .into_iter()
            .find(|b| b.code == code)
            .ok_or_else(|| LedgerError::not_found("account", code))
    }

    pub fn report(&self, period_start: NaiveDate, period_end: NaiveDate, filter: BalanceFilter) -> Result<BalanceReport> {
        if period_start > period_end {
            return Err(LedgerError::InvalidPeriod {
                start: period_start,
                end: period_end,
            });
        }

        read_consistent(self.store.as_ref(), |reader| {
            self.report_in(reader, period_start, period_end, filter)
        })
    }

    pub(crate) fn report_in(
        &self,
        reader: &dyn LedgerReader,
        period_start: NaiveDate,
        period_end: NaiveDate,
        filter: BalanceFilter,
    ) -> Result<BalanceReport> {

        let mut figures: HashMap<Uuid, Figures> = HashMap::new();
        let mut orphaned_lines = Vec::new();
        let mut misposted_lines = Vec::new();
        let mut lines_scanned = 0usize;

        let mut cursor = ScanCursor::start(reader.line_watermark()?);
        while !cursor.is_exhausted() {
            let page = reader.scan_lines(&cursor, self.batch_size)?;
            let last = match page.last() {
                Some(last) => last.line.id,
                None => break,
            };
            lines_scanned += page.len();

            for item in page {
                let line = item.line;
                let entry = match item.entry {
                    Some(entry) => entry,
                    None => {
                        orphaned_lines.push(orphan(&line, OrphanReason::MissingEntry));
                        continue;
                    }
                };
                if entry.is_draft || entry.entry_date > period_end {
                    continue;
                }
                let account = match self.chart.by_id(line.account_id) {
                    Some(account) => account,
                    None => {
                        orphaned_lines.push(orphan(&line, OrphanReason::MissingAccount));
                        continue;
                    }
                };
                if account.is_synthetic {
                    misposted_lines.push(line.id);
                    continue;
                }

                let acc = figures.entry(account.id).or_default();
                let counts_as_opening =
                    entry.entry_type == EntryType::OpeningBalance || entry.entry_date < period_start;
                if counts_as_opening {
                    acc.opening += account.nature.signed(line.debit, line.credit);
                } else {
                    acc.debit += line.debit;
                    acc.credit += line.credit;
                }
            }

            cursor.advance(last);
            debug!(after = cursor.after, watermark = cursor.watermark, "balance page scanned");
        }

        let balances = self.roll_up(figures, filter);

        if !orphaned_lines.is_empty() {
            warn!(count = orphaned_lines.len(), "orphaned lines excluded from balances");
        }
        if !misposted_lines.is_empty() {
            warn!(count = misposted_lines.len(), "lines on synthetic accounts excluded from balances");
        }
        info!(
            %period_start,
            %period_end,
            accounts = balances.len(),
            lines_scanned,
            "balances computed"
        );

        Ok(BalanceReport {
            period_start,
            period_end,
            balances,
            orphaned_lines,
            misposted_lines,
            lines_scanned,
        })
    }

    /// Close analytic figures, then fold every account into its parent,
    /// deepest first, so each synthetic total is complete before it is
    /// added upward.
    fn roll_up(&self, mut figures: HashMap<Uuid, Figures>, filter: BalanceFilter) -> Vec<AccountBalance> {
        for account in self.chart.all().filter(|a| a.is_analytic()) {
            let acc = figures.entry(account.id).or_default();
            acc.closing = acc.opening + account.nature.signed(acc.debit, acc.credit);
        }

        let mut by_depth: Vec<&Account> = self.chart.all().collect();
        by_depth.sort_by(|a, b| b.depth().cmp(&a.depth()));
        for account in by_depth {
            let own = figures.get(&account.id).copied().unwrap_or_default();
            if let Some(parent_id) = account.parent_id {
                figures.entry(parent_id).or_default().add(&own);
            }
        }

        self.chart
            .all()
            .map(|account| {
                let f = figures.get(&account.id).copied().unwrap_or_default();
                AccountBalance {
                    opening_balance: f.opening,
                    period_debit: f.debit,
                    period_credit: f.credit,
                    closing_balance: f.closing,
                    ..AccountBalance::empty(account)
                }
            })
            .filter(|b| !filter.only_moved || b.has_movement())
            .collect()
    }
}

fn orphan(line: &crate::entities::EntryLine, reason: OrphanReason) -> OrphanedLine {
    OrphanedLine {
        line_id: line.id,
        entry_id: line.entry_id,
        account_id: line.account_id,
        amount: line.amount(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{NewEntry, NewLine};
    use crate::journal::JournalStore;
    use crate::store::interleave::InterleavedReader;
    use crate::store::{MemoryStore, SqliteStore};
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn create_test_chart(store: &dyn LedgerStore) -> Arc<ChartOfAccounts> {
        for account in [
            Account::new("1", "Ativo", AccountNature::Debit),
            Account::new("1.1.1.05", "Banco Sicredi", AccountNature::Debit),
            Account::new("1.1.1.06", "Caixa", AccountNature::Debit),
            Account::new("3.1.1.01", "Honorarios", AccountNature::Credit),
            Account::new("5.2.1.01", "Saldo de abertura", AccountNature::Credit),
        ] {
            store.insert_account(&account, "test").unwrap();
        }
        Arc::new(ChartOfAccounts::load(store).unwrap())
    }

    fn setup() -> (Arc<MemoryStore>, Arc<ChartOfAccounts>, JournalStore) {
        let store = Arc::new(MemoryStore::new());
        let chart = create_test_chart(store.as_ref());
        let journal = JournalStore::new(store.clone(), chart.clone(), dec!(0.01));
        (store, chart, journal)
    }

    fn post(journal: &JournalStore, on: NaiveDate, ty: EntryType, debit: &str, credit: &str, amount: Decimal) {
        journal
            .post(
                NewEntry::new(on, "test", ty),
                vec![NewLine::debit_to(debit, amount), NewLine::credit_to(credit, amount)],
                "test",
            )
            .unwrap();
    }

    #[test]
    fn test_opening_and_period_movement() {
        let (store, chart, journal) = setup();
        post(&journal, date(2025, 1, 1), EntryType::OpeningBalance, "1.1.1.05", "5.2.1.01", dec!(1000.00));
        post(&journal, date(2025, 1, 10), EntryType::Manual, "1.1.1.05", "3.1.1.01", dec!(250.00));

        let calc = BalanceCalculator::new(store, chart, 1);
        let bank = calc.balance_of("1.1.1.05", date(2025, 1, 1), date(2025, 1, 31)).unwrap();

        assert_eq!(bank.opening_balance, dec!(1000.00));
        assert_eq!(bank.period_debit, dec!(250.00));
        assert_eq!(bank.period_credit, dec!(0));
        assert_eq!(bank.closing_balance, dec!(1250.00));

        let revenue = calc.balance_of("3.1.1.01", date(2025, 1, 1), date(2025, 1, 31)).unwrap();
        assert_eq!(revenue.closing_balance, dec!(250.00));

        println!("✅ Opening + movement test PASSED");
    }

    #[test]
    fn test_earlier_entries_roll_into_opening_later_ignored() {
        let (store, chart, journal) = setup();
        post(&journal, date(2024, 12, 20), EntryType::Manual, "1.1.1.05", "3.1.1.01", dec!(40));
        post(&journal, date(2025, 1, 15), EntryType::Manual, "1.1.1.05", "3.1.1.01", dec!(60));
        post(&journal, date(2025, 2, 3), EntryType::Manual, "1.1.1.05", "3.1.1.01", dec!(500));

        let calc = BalanceCalculator::new(store, chart, 2);
        let bank = calc.balance_of("1.1.1.05", date(2025, 1, 1), date(2025, 1, 31)).unwrap();
        assert_eq!(bank.opening_balance, dec!(40));
        assert_eq!(bank.period_debit, dec!(60));
        assert_eq!(bank.closing_balance, dec!(100));
    }

    #[test]
    fn test_synthetic_is_sum_of_children() {
        let (store, chart, journal) = setup();
        post(&journal, date(2025, 1, 5), EntryType::Manual, "1.1.1.05", "3.1.1.01", dec!(70));
        post(&journal, date(2025, 1, 6), EntryType::Manual, "1.1.1.06", "3.1.1.01", dec!(30));

        let calc = BalanceCalculator::new(store, chart, 1000);
        let report = calc
            .report(date(2025, 1, 1), date(2025, 1, 31), BalanceFilter::default())
            .unwrap();

        let root = report.get("1").unwrap();
        assert!(root.is_synthetic);
        assert_eq!(root.closing_balance, dec!(100));
        assert_eq!(root.period_debit, dec!(100));
        assert_eq!(report.trial_balance_difference(), dec!(0));
    }

    #[test]
    fn test_drafts_excluded_and_only_moved_filter() {
        let (store, chart, journal) = setup();
        journal
            .post(
                NewEntry::new(date(2025, 1, 5), "draft", EntryType::Manual).draft(),
                vec![
                    NewLine::debit_to("1.1.1.05", dec!(10)),
                    NewLine::credit_to("3.1.1.01", dec!(10)),
                ],
                "test",
            )
            .unwrap();
        post(&journal, date(2025, 1, 6), EntryType::Manual, "1.1.1.06", "3.1.1.01", dec!(30));

        let calc = BalanceCalculator::new(store, chart, 10);
        let all = calc.balances(date(2025, 1, 1), date(2025, 1, 31)).unwrap();
        assert_eq!(all.len(), 5, "zero accounts are included by default");

        let moved = calc
            .report(date(2025, 1, 1), date(2025, 1, 31), BalanceFilter { only_moved: true })
            .unwrap();
        let codes: Vec<&str> = moved.balances.iter().map(|b| b.code.as_str()).collect();
        assert_eq!(codes, vec!["1", "1.1.1.06", "3.1.1.01"]);
    }

    #[test]
    fn test_line_with_missing_account_is_surfaced() {
        let (store, chart, journal) = setup();
        post(&journal, date(2025, 1, 5), EntryType::Manual, "1.1.1.05", "3.1.1.01", dec!(70));

        // Chart without the bank account: its line can no longer be attributed
        let reduced = Arc::new(ChartOfAccounts::from_accounts(
            chart.all().filter(|a| a.code != "1.1.1.05").cloned().collect(),
        ));
        let calc = BalanceCalculator::new(store, reduced, 10);
        let report = calc
            .report(date(2025, 1, 1), date(2025, 1, 31), BalanceFilter::default())
            .unwrap();

        assert_eq!(report.orphaned_lines.len(), 1);
        assert_eq!(report.orphaned_lines[0].reason, OrphanReason::MissingAccount);
        assert_eq!(report.orphaned_lines[0].amount, dec!(70));
        assert_eq!(report.get("3.1.1.01").unwrap().closing_balance, dec!(70));
    }

    #[test]
    fn test_entry_voided_mid_report_is_counted_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let writer = Arc::new(SqliteStore::open(&path).unwrap());
        let chart = create_test_chart(store.as_ref());
        let journal = JournalStore::new(store.clone(), chart.clone(), dec!(0.01));
        post(&journal, date(2025, 1, 10), EntryType::Manual, "1.1.1.05", "3.1.1.01", dec!(500));
        let entry_id = store.scan_entries(None, 10).unwrap()[0].entry.id;

        // one line per page; the entry is voided between its debit and its credit
        let calc = BalanceCalculator::new(store.clone(), chart, 1);
        let report = read_consistent(store.as_ref(), |snapshot| {
            let reader = InterleavedReader::new(snapshot, || {
                writer.delete_entry(entry_id, "test").unwrap();
            });
            calc.report_in(&reader, date(2025, 1, 1), date(2025, 1, 31), BalanceFilter::default())
        })
        .unwrap();

        assert!(store.get_entry(entry_id).unwrap().is_none(), "the void did commit");
        assert_eq!(report.lines_scanned, 2);
        assert!(report.orphaned_lines.is_empty());
        assert_eq!(report.get("1.1.1.05").unwrap().period_debit, dec!(500));
        assert_eq!(report.get("3.1.1.01").unwrap().period_credit, dec!(500));
        assert_eq!(report.trial_balance_difference(), dec!(0));

        let after = calc.report(date(2025, 1, 1), date(2025, 1, 31), BalanceFilter::default()).unwrap();
        assert_eq!(after.lines_scanned, 0);

        println!("✅ Void during report test PASSED");
    }

    #[test]
    fn test_inverted_period_rejected() {
        let (store, chart, _) = setup();
        let calc = BalanceCalculator::new(store, chart, 10);
        assert!(matches!(
            calc.balances(date(2025, 2, 1), date(2025, 1, 1)),
            Err(LedgerError::InvalidPeriod { .. })
        ));
    }
}
