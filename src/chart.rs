// 🌳 Chart of Accounts - Hierarchy and posting targets
//
// Loaded once from the store and shared read-only (`Arc<ChartOfAccounts>`).
// Mutations go through the store as one atomic batch and hand back a
// freshly loaded chart; a dry run hands back the chart they would produce.
//
// The stored `parent_id` is only a cache: on load the hierarchy is derived
// again from the codes, so an interrupted re-parenting never leaves the chart
// inconsistent.

use anyhow::{Context as AnyhowContext, Result as AnyResult};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::account::{is_ancestor_code, is_valid_code, parent_code};
use crate::entities::{Account, AccountNature};
use crate::error::{LedgerError, Result};
use crate::reconciliation::RunMode;
use crate::store::{AccountChange, LedgerStore};

#[derive(Debug, Clone, Default)]
pub struct ChartOfAccounts {
    by_code: BTreeMap<String, Account>,
    code_by_id: HashMap<Uuid, String>,
}

impl ChartOfAccounts {
    /// Build a chart from stored accounts, deriving parents and synthetic
    /// flags from the codes. An account is synthetic when it was marked so or
    /// when any other account hangs below it.
    pub fn from_accounts(accounts: Vec<Account>) -> Self {
        let mut by_code: BTreeMap<String, Account> = accounts
            .into_iter()
            .map(|account| (account.code.clone(), account))
            .collect();

        let parents: Vec<(String, Option<Uuid>)> = by_code
            .keys()
            .map(|code| (code.clone(), nearest_existing_ancestor(&by_code, code).map(|a| a.id)))
            .collect();

        let mut has_children: HashSet<Uuid> = HashSet::new();
        for (code, parent_id) in parents {
            if let Some(parent_id) = parent_id {
                has_children.insert(parent_id);
            }
            if let Some(account) = by_code.get_mut(&code) {
                account.parent_id = parent_id;
            }
        }
        for account in by_code.values_mut() {
            account.is_synthetic = account.is_synthetic || has_children.contains(&account.id);
        }

        let code_by_id = by_code
            .values()
            .map(|account| (account.id, account.code.clone()))
            .collect();

        ChartOfAccounts { by_code, code_by_id }
    }

    pub fn load(store: &dyn LedgerStore) -> Result<Self> {
        Ok(Self::from_accounts(store.load_accounts()?))
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn resolve(&self, code: &str) -> Result<&Account> {
        self.by_code
            .get(code)
            .ok_or_else(|| LedgerError::not_found("account", code))
    }

    pub fn resolve_id(&self, id: Uuid) -> Result<&Account> {
        self.by_id(id).ok_or_else(|| LedgerError::not_found("account", id))
    }

    /// Lookup by id; `None` when the account record no longer exists.
    pub fn by_id(&self, id: Uuid) -> Option<&Account> {
        self.code_by_id.get(&id).and_then(|code| self.by_code.get(code))
    }

    pub fn contains(&self, code: &str) -> bool {
        self.by_code.contains_key(code)
    }

    pub fn is_analytic(&self, code: &str) -> Result<bool> {
        Ok(self.resolve(code)?.is_analytic())
    }

    /// True when `ancestor` lies on the parent chain of `code`.
    pub fn is_descendant_of(&self, code: &str, ancestor: &str) -> bool {
        self.ancestors(code).iter().any(|a| a.code == ancestor)
    }

    /// Direct children, in code order.
    pub fn children(&self, code: &str) -> Vec<&Account> {
        let id = match self.by_code.get(code) {
            Some(account) => account.id,
            None => return Vec::new(),
        };
        self.by_code
            .values()
            .filter(|account| account.parent_id == Some(id))
            .collect()
    }

    /// Parent chain, nearest first.
    pub fn ancestors(&self, code: &str) -> Vec<&Account> {
        let mut chain = Vec::new();
        let mut current = self.by_code.get(code).and_then(|a| a.parent_id);
        while let Some(parent_id) = current {
            match self.by_id(parent_id) {
                Some(parent) => {
                    chain.push(parent);
                    current = parent.parent_id;
                }
                None => break,
            }
        }
        chain
    }

    /// All accounts in code order.
    pub fn all(&self) -> impl Iterator<Item = &Account> {
        self.by_code.values()
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    // ========================================================================
    // MUTATIONS (through the store)
    // ========================================================================

    /// Create an analytic account. The nearest existing ancestor must be
    /// synthetic; existing accounts that fall below the new code are
    /// re-parented to it, which makes it synthetic. The insert and the
    /// re-parenting are written as one unit.
    pub fn create_account(
        &self,
        store: &dyn LedgerStore,
        code: &str,
        name: &str,
        nature: AccountNature,
        mode: RunMode,
        actor: &str,
    ) -> Result<ChartOfAccounts> {
        if !is_valid_code(code) {
            return Err(LedgerError::InvalidAccountCode(code.to_string()));
        }
        if self.contains(code) {
            return Err(LedgerError::duplicate("account", code));
        }

        let parent = nearest_existing_ancestor(&self.by_code, code);
        if let Some(parent) = parent {
            if parent.is_analytic() {
                warn!(parent = %parent.code, child = code, "refusing child under analytic account");
                return Err(LedgerError::ParentNotSynthetic {
                    parent: parent.code.clone(),
                    child: code.to_string(),
                });
            }
        }

        let parent_id = parent.map(|p| p.id);
        let adopted: Vec<Account> = self
            .by_code
            .values()
            .filter(|a| a.parent_id == parent_id && is_ancestor_code(code, &a.code))
            .cloned()
            .collect();

        let mut account = Account::new(code, name, nature);
        account.parent_id = parent_id;
        account.is_synthetic = !adopted.is_empty();

        let mut changes = vec![AccountChange::Insert(account.clone())];
        for mut child in adopted {
            child.parent_id = Some(account.id);
            changes.push(AccountChange::Update(child));
        }

        let chart = self.commit(store, &changes, mode, actor)?;
        info!(code, synthetic = account.is_synthetic, applied = mode.is_apply(), "account created");
        Ok(chart)
    }

    /// Turn an analytic account into a grouping node so children can be
    /// created under it. Refused while lines are booked to it; the store
    /// checks again when writing.
    pub fn convert_to_synthetic(
        &self,
        store: &dyn LedgerStore,
        code: &str,
        mode: RunMode,
        actor: &str,
    ) -> Result<ChartOfAccounts> {
        let account = self.resolve(code)?;
        if account.is_synthetic {
            return Ok(self.clone());
        }

        let lines = store.count_lines_for_account(account.id)?;
        if lines > 0 {
            return Err(LedgerError::AccountHasLines {
                code: code.to_string(),
                lines,
            });
        }

        let mut updated = account.clone();
        updated.is_synthetic = true;
        let chart = self.commit(store, &[AccountChange::Update(updated)], mode, actor)?;
        info!(code, applied = mode.is_apply(), "account converted to synthetic");
        Ok(chart)
    }

    /// Delete an account that has neither children nor lines.
    pub fn remove_account(
        &self,
        store: &dyn LedgerStore,
        code: &str,
        mode: RunMode,
        actor: &str,
    ) -> Result<ChartOfAccounts> {
        let account = self.resolve(code)?;
        if !self.children(code).is_empty() {
            return Err(LedgerError::AccountHasChildren(code.to_string()));
        }
        let lines = store.count_lines_for_account(account.id)?;
        if lines > 0 {
            return Err(LedgerError::AccountHasLines {
                code: code.to_string(),
                lines,
            });
        }

        let chart = self.commit(store, &[AccountChange::Remove(account.id)], mode, actor)?;
        info!(code, applied = mode.is_apply(), "account removed");
        Ok(chart)
    }

    /// Bulk insert accounts, skipping codes already present. Hierarchy flags
    /// from the input are ignored and derived from the codes instead. The
    /// whole file is applied as one unit or not at all.
    pub fn import(
        &self,
        store: &dyn LedgerStore,
        rows: Vec<ChartRow>,
        mode: RunMode,
        actor: &str,
    ) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut fresh: Vec<Account> = Vec::new();

        for row in rows {
            let code = row.code.trim().to_string();
            if !is_valid_code(&code) {
                return Err(LedgerError::InvalidAccountCode(code));
            }
            if self.contains(&code) || !seen.insert(code.clone()) {
                summary.skipped += 1;
                continue;
            }
            fresh.push(Account::new(code, row.name.trim(), row.nature));
        }

        // Derive the hierarchy over the union so new leaves under existing
        // parents (and vice versa) are classified correctly.
        let mut union: Vec<Account> = self.by_code.values().cloned().collect();
        union.extend(fresh.iter().cloned());
        let derived = ChartOfAccounts::from_accounts(union);

        for account in &fresh {
            let account = derived.resolve(&account.code)?;
            if let Some(parent) = account.parent_id.and_then(|id| self.by_id(id)) {
                if parent.is_analytic() && store.count_lines_for_account(parent.id)? > 0 {
                    return Err(LedgerError::ParentNotSynthetic {
                        parent: parent.code.clone(),
                        child: account.code.clone(),
                    });
                }
            }
        }

        // Existing accounts that gained children turn synthetic before any
        // child lands under them; new accounts go in parents first.
        let mut changes = Vec::new();
        for existing in self.by_code.values() {
            if let Some(now) = derived.by_id(existing.id) {
                if now != existing {
                    changes.push(AccountChange::Update(now.clone()));
                    summary.updated += 1;
                }
            }
        }
        let mut inserts: Vec<&Account> = Vec::with_capacity(fresh.len());
        for account in &fresh {
            inserts.push(derived.resolve(&account.code)?);
        }
        inserts.sort_by(|a, b| a.depth().cmp(&b.depth()).then(a.code.cmp(&b.code)));
        summary.inserted = inserts.len();
        changes.extend(inserts.into_iter().map(|account| AccountChange::Insert(account.clone())));

        if mode.is_apply() {
            store.apply_accounts(&changes, actor)?;
        }

        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            applied = mode.is_apply(),
            "chart imported"
        );
        Ok(summary)
    }

    /// Write `changes` and reload, or in a dry run only compute the chart
    /// they would produce.
    fn commit(
        &self,
        store: &dyn LedgerStore,
        changes: &[AccountChange],
        mode: RunMode,
        actor: &str,
    ) -> Result<ChartOfAccounts> {
        if !mode.is_apply() {
            return Ok(self.with_changes(changes));
        }
        store.apply_accounts(changes, actor)?;
        Self::load(store)
    }

    fn with_changes(&self, changes: &[AccountChange]) -> ChartOfAccounts {
        let mut accounts: BTreeMap<Uuid, Account> = self
            .by_code
            .values()
            .map(|account| (account.id, account.clone()))
            .collect();
        for change in changes {
            match change {
                AccountChange::Insert(account) | AccountChange::Update(account) => {
                    accounts.insert(account.id, account.clone());
                }
                AccountChange::Remove(id) => {
                    accounts.remove(id);
                }
            }
        }
        ChartOfAccounts::from_accounts(accounts.into_values().collect())
    }
}

fn nearest_existing_ancestor<'a>(by_code: &'a BTreeMap<String, Account>, code: &str) -> Option<&'a Account> {
    let mut current = parent_code(code);
    while let Some(candidate) = current {
        if let Some(account) = by_code.get(candidate) {
            return Some(account);
        }
        current = parent_code(candidate);
    }
    None
}

// ============================================================================
// CSV CHART FILES
// ============================================================================

/// One row of a `code,name,nature` chart file.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartRow {
    pub code: String,
    pub name: String,
    #[serde(deserialize_with = "nature_from_text")]
    pub nature: AccountNature,
}

fn nature_from_text<'de, D>(deserializer: D) -> std::result::Result<AccountNature, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    text.parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

pub fn load_chart_csv(path: &Path) -> AnyResult<Vec<ChartRow>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open chart file: {:?}", path))?;

    let mut rows = Vec::new();
    for (index, result) in rdr.deserialize().enumerate() {
        let row: ChartRow = result.with_context(|| format!("Invalid chart row {}", index + 1))?;
        rows.push(row);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{EntryLine, EntryRecord, EntryType, NewEntry};
    use crate::store::MemoryStore;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn account(code: &str, nature: AccountNature) -> Account {
        Account::new(code, code, nature)
    }

    fn sample_chart() -> ChartOfAccounts {
        ChartOfAccounts::from_accounts(vec![
            account("1", AccountNature::Debit),
            account("1.1", AccountNature::Debit),
            account("1.1.1.05", AccountNature::Debit),
            account("1.1.2.01", AccountNature::Debit),
            account("1.1.2.01.0052", AccountNature::Debit),
            account("3.1.1.01", AccountNature::Credit),
        ])
    }

    #[test]
    fn test_hierarchy_is_derived_from_codes() {
        let chart = sample_chart();

        // 1.1.1 is missing; 1.1 is the nearest existing ancestor
        let bank = chart.resolve("1.1.1.05").unwrap();
        assert_eq!(bank.parent_id, Some(chart.resolve("1.1").unwrap().id));
        assert!(bank.is_analytic());

        assert!(!chart.is_analytic("1.1.2.01").unwrap());
        assert!(chart.is_analytic("1.1.2.01.0052").unwrap());
        assert!(chart.is_analytic("3.1.1.01").unwrap());
        assert!(chart.resolve("3.1.1.01").unwrap().parent_id.is_none());
    }

    #[test]
    fn test_descendants_and_children() {
        let chart = sample_chart();

        assert!(chart.is_descendant_of("1.1.2.01.0052", "1"));
        assert!(chart.is_descendant_of("1.1.2.01.0052", "1.1.2.01"));
        assert!(!chart.is_descendant_of("1.1.2.01", "1.1.2.01"));
        assert!(!chart.is_descendant_of("3.1.1.01", "1"));

        let children: Vec<&str> = chart.children("1.1").iter().map(|a| a.code.as_str()).collect();
        assert_eq!(children, vec!["1.1.1.05", "1.1.2.01"]);

        let ancestors: Vec<&str> = chart
            .ancestors("1.1.2.01.0052")
            .iter()
            .map(|a| a.code.as_str())
            .collect();
        assert_eq!(ancestors, vec!["1.1.2.01", "1.1", "1"]);
    }

    #[test]
    fn test_unknown_code_is_not_found() {
        let chart = sample_chart();
        assert!(matches!(chart.resolve("9.9"), Err(LedgerError::NotFound { .. })));
    }

    #[test]
    fn test_child_under_analytic_parent_is_refused() {
        let store = MemoryStore::new();
        let chart = ChartOfAccounts::load(&store).unwrap();
        let chart = chart
            .create_account(&store, "1.1.1.05", "Banco Sicredi", AccountNature::Debit, RunMode::Apply, "test")
            .unwrap();

        let err = chart
            .create_account(&store, "1.1.1.05.01", "Sub", AccountNature::Debit, RunMode::Apply, "test")
            .unwrap_err();
        assert!(matches!(err, LedgerError::ParentNotSynthetic { .. }));

        let chart = chart.convert_to_synthetic(&store, "1.1.1.05", RunMode::Apply, "test").unwrap();
        let chart = chart
            .create_account(&store, "1.1.1.05.01", "Sub", AccountNature::Debit, RunMode::Apply, "test")
            .unwrap();
        assert!(chart.is_descendant_of("1.1.1.05.01", "1.1.1.05"));
    }

    #[test]
    fn test_convert_refused_when_account_has_lines() {
        let store = MemoryStore::new();
        let chart = ChartOfAccounts::default()
            .create_account(&store, "1.1.1.05", "Banco", AccountNature::Debit, RunMode::Apply, "test")
            .unwrap();
        let bank = chart.resolve("1.1.1.05").unwrap().clone();

        let entry = NewEntry::new(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), "x", EntryType::Manual).into_entry();
        let line = EntryLine {
            id: 0,
            entry_id: entry.id,
            account_id: bank.id,
            debit: dec!(1),
            credit: dec!(0),
            description: String::new(),
        };
        store
            .insert_entry(&EntryRecord { entry, lines: vec![line] }, None, "test")
            .unwrap();

        let err = chart.convert_to_synthetic(&store, "1.1.1.05", RunMode::Apply, "test").unwrap_err();
        assert!(matches!(err, LedgerError::AccountHasLines { lines: 1, .. }));

        let err = chart.remove_account(&store, "1.1.1.05", RunMode::Apply, "test").unwrap_err();
        assert!(matches!(err, LedgerError::AccountHasLines { .. }));
    }

    #[test]
    fn test_intermediate_node_adopts_children() {
        let store = MemoryStore::new();
        let chart = ChartOfAccounts::default()
            .create_account(&store, "1", "Ativo", AccountNature::Debit, RunMode::Apply, "test")
            .unwrap()
            .convert_to_synthetic(&store, "1", RunMode::Apply, "test")
            .unwrap();
        let chart = chart
            .create_account(&store, "1.1.9.01", "Transitoria", AccountNature::Debit, RunMode::Apply, "test")
            .unwrap();
        let chart = chart
            .create_account(&store, "1.1", "Circulante", AccountNature::Debit, RunMode::Apply, "test")
            .unwrap();

        assert!(!chart.is_analytic("1.1").unwrap());
        let ancestors: Vec<&str> = chart.ancestors("1.1.9.01").iter().map(|a| a.code.as_str()).collect();
        assert_eq!(ancestors, vec!["1.1", "1"]);
    }

    #[test]
    fn test_remove_account_with_children_refused() {
        let store = MemoryStore::new();
        let chart = ChartOfAccounts::default()
            .create_account(&store, "1", "Ativo", AccountNature::Debit, RunMode::Apply, "test")
            .unwrap()
            .convert_to_synthetic(&store, "1", RunMode::Apply, "test")
            .unwrap()
            .create_account(&store, "1.1", "Circulante", AccountNature::Debit, RunMode::Apply, "test")
            .unwrap();

        assert!(matches!(
            chart.remove_account(&store, "1", RunMode::Apply, "test"),
            Err(LedgerError::AccountHasChildren(_))
        ));
        let chart = chart.remove_account(&store, "1.1", RunMode::Apply, "test").unwrap();
        assert!(!chart.contains("1.1"));
    }

    #[test]
    fn test_import_csv_chart() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "code,name,nature").unwrap();
        writeln!(file, "1,Ativo,DEBIT").unwrap();
        writeln!(file, "1.1.1.05,Banco Sicredi,D").unwrap();
        writeln!(file, "3.1.1.01,Honorarios,CREDORA").unwrap();
        writeln!(file, "3.1.1.01,Honorarios again,C").unwrap();

        let rows = load_chart_csv(file.path()).unwrap();
        assert_eq!(rows.len(), 4);

        let store = MemoryStore::new();
        let summary = ChartOfAccounts::default().import(&store, rows, RunMode::Apply, "test").unwrap();
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.skipped, 1);

        let chart = ChartOfAccounts::load(&store).unwrap();
        assert!(!chart.is_analytic("1").unwrap());
        assert_eq!(chart.resolve("3.1.1.01").unwrap().nature, AccountNature::Credit);

        println!("✅ Chart import test PASSED");
    }

    fn row(code: &str, nature: AccountNature) -> ChartRow {
        ChartRow {
            code: code.to_string(),
            name: code.to_string(),
            nature,
        }
    }

    #[test]
    fn test_dry_runs_write_nothing() {
        let store = MemoryStore::new();
        let chart = ChartOfAccounts::default()
            .create_account(&store, "1", "Ativo", AccountNature::Debit, RunMode::Apply, "test")
            .unwrap();

        let preview = chart
            .create_account(&store, "2", "Passivo", AccountNature::Credit, RunMode::DryRun, "test")
            .unwrap();
        assert!(preview.contains("2"));
        assert!(!ChartOfAccounts::load(&store).unwrap().contains("2"));

        let preview = chart.convert_to_synthetic(&store, "1", RunMode::DryRun, "test").unwrap();
        assert!(!preview.is_analytic("1").unwrap());
        assert!(ChartOfAccounts::load(&store).unwrap().is_analytic("1").unwrap());

        let preview = chart.remove_account(&store, "1", RunMode::DryRun, "test").unwrap();
        assert!(preview.is_empty());

        let summary = chart
            .import(&store, vec![row("3", AccountNature::Credit)], RunMode::DryRun, "test")
            .unwrap();
        assert_eq!(summary.inserted, 1);

        assert_eq!(store.load_accounts().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_import_rolls_back_whole_file() {
        let store = MemoryStore::new();
        let stale = ChartOfAccounts::load(&store).unwrap();

        // someone else creates 3.1.1.01 after our chart was loaded
        ChartOfAccounts::load(&store)
            .unwrap()
            .create_account(&store, "3.1.1.01", "Honorarios", AccountNature::Credit, RunMode::Apply, "other")
            .unwrap();

        let rows = vec![
            row("4", AccountNature::Debit),
            row("4.1", AccountNature::Debit),
            row("3.1.1.01", AccountNature::Credit),
        ];
        let err = stale.import(&store, rows, RunMode::Apply, "test").unwrap_err();
        assert!(matches!(err, LedgerError::Duplicate { .. }));

        let chart = ChartOfAccounts::load(&store).unwrap();
        assert_eq!(chart.len(), 1, "no part of the failed file was written");
        assert!(!chart.contains("4"));
    }

    #[test]
    fn test_stale_chart_cannot_remove_parent() {
        let store = MemoryStore::new();
        let stale = ChartOfAccounts::default()
            .create_account(&store, "1", "Ativo", AccountNature::Debit, RunMode::Apply, "test")
            .unwrap()
            .convert_to_synthetic(&store, "1", RunMode::Apply, "test")
            .unwrap();
        stale
            .create_account(&store, "1.1", "Circulante", AccountNature::Debit, RunMode::Apply, "other")
            .unwrap();

        let err = stale.remove_account(&store, "1", RunMode::Apply, "test").unwrap_err();
        assert!(matches!(err, LedgerError::AccountHasChildren(code) if code == "1"));
        assert_eq!(ChartOfAccounts::load(&store).unwrap().len(), 2);
    }

    #[test]
    fn test_import_under_existing_leaf_updates_it_first() {
        let store = MemoryStore::new();
        let chart = ChartOfAccounts::default()
            .create_account(&store, "1.1", "Circulante", AccountNature::Debit, RunMode::Apply, "test")
            .unwrap();

        let summary = chart
            .import(
                &store,
                vec![row("1.1.1.05", AccountNature::Debit), row("1.1.1", AccountNature::Debit)],
                RunMode::Apply,
                "test",
            )
            .unwrap();
        assert_eq!(summary, ImportSummary { inserted: 2, updated: 1, skipped: 0 });

        let chart = ChartOfAccounts::load(&store).unwrap();
        let ancestors: Vec<&str> = chart.ancestors("1.1.1.05").iter().map(|a| a.code.as_str()).collect();
        assert_eq!(ancestors, vec!["1.1.1", "1.1"]);
    }
}
