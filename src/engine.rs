// 🧭 Ledger Engine - Wiring
//
// Owns the store, configuration, rules and the current chart snapshot, and
// hands out components built against that snapshot. Account mutations swap
// in a fresh chart so later components see them.

use std::sync::{Arc, RwLock};
use tracing::info;

use crate::audit::IntegrityAuditor;
use crate::balance::BalanceCalculator;
use crate::chart::{ChartOfAccounts, ChartRow, ImportSummary};
use crate::config::LedgerConfig;
use crate::entities::{Account, AccountNature};
use crate::error::{LedgerError, Result};
use crate::journal::JournalStore;
use crate::reconciliation::{ReconciliationMatcher, RunMode};
use crate::remediation::RemediationPlanner;
use crate::rules::RuleEngine;
use crate::store::{Event, LedgerStore};

/// Entity types that carry audit events.
const EVENT_ENTITY_TYPES: [&str; 4] = ["journal_entry", "entry_line", "account", "bank_transaction"];

pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
    rules: Arc<RuleEngine>,
    chart: RwLock<Arc<ChartOfAccounts>>,
}

impl LedgerEngine {
    /// Load the chart from `store` and bind it to `config` and `rules`.
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig, rules: RuleEngine) -> Result<Self> {
        let chart = ChartOfAccounts::load(store.as_ref())?;
        info!(accounts = chart.len(), rules = rules.rule_count(), "ledger engine ready");
        Ok(LedgerEngine {
            store,
            rules: Arc::new(rules.with_min_confidence(config.min_rule_confidence)),
            config,
            chart: RwLock::new(Arc::new(chart)),
        })
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    /// Current chart snapshot.
    pub fn chart(&self) -> Result<Arc<ChartOfAccounts>> {
        let chart = self.chart.read().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(Arc::clone(&chart))
    }

    fn replace_chart(&self, chart: ChartOfAccounts) -> Result<Arc<ChartOfAccounts>> {
        let chart = Arc::new(chart);
        *self.chart.write().map_err(|_| LedgerError::LockPoisoned)? = Arc::clone(&chart);
        Ok(chart)
    }

    // ========================================================================
    // CHART
    // ========================================================================

    /// A dry run leaves the current chart in place.
    pub fn create_account(
        &self,
        code: &str,
        name: &str,
        nature: AccountNature,
        mode: RunMode,
        actor: &str,
    ) -> Result<Account> {
        let chart = self.chart()?.create_account(self.store.as_ref(), code, name, nature, mode, actor)?;
        let account = chart.resolve(code)?.clone();
        self.adopt(chart, mode)?;
        Ok(account)
    }

    pub fn convert_to_synthetic(&self, code: &str, mode: RunMode, actor: &str) -> Result<()> {
        let chart = self.chart()?.convert_to_synthetic(self.store.as_ref(), code, mode, actor)?;
        self.adopt(chart, mode)
    }

    pub fn remove_account(&self, code: &str, mode: RunMode, actor: &str) -> Result<()> {
        let chart = self.chart()?.remove_account(self.store.as_ref(), code, mode, actor)?;
        self.adopt(chart, mode)
    }

    pub fn import_chart(&self, rows: Vec<ChartRow>, mode: RunMode, actor: &str) -> Result<ImportSummary> {
        let summary = self.chart()?.import(self.store.as_ref(), rows, mode, actor)?;
        if mode.is_apply() {
            self.replace_chart(ChartOfAccounts::load(self.store.as_ref())?)?;
        }
        Ok(summary)
    }

    fn adopt(&self, chart: ChartOfAccounts, mode: RunMode) -> Result<()> {
        if mode.is_apply() {
            self.replace_chart(chart)?;
        }
        Ok(())
    }

    /// Pick up account changes made by another process.
    pub fn reload_chart(&self) -> Result<Arc<ChartOfAccounts>> {
        self.replace_chart(ChartOfAccounts::load(self.store.as_ref())?)
    }

    // ========================================================================
    // COMPONENTS
    // ========================================================================

    pub fn journal(&self) -> Result<Arc<JournalStore>> {
        Ok(Arc::new(JournalStore::new(
            Arc::clone(&self.store),
            self.chart()?,
            self.config.epsilon,
        )))
    }

    pub fn balances(&self) -> Result<BalanceCalculator> {
        Ok(BalanceCalculator::new(
            Arc::clone(&self.store),
            self.chart()?,
            self.config.scan_batch_size,
        ))
    }

    /// Rules are checked against the current chart before any matching.
    pub fn matcher(&self) -> Result<ReconciliationMatcher> {
        let chart = self.chart()?;
        self.rules.validate_against(&chart)?;
        chart.resolve(&self.config.clearing_account_code)?;

        Ok(ReconciliationMatcher::new(
            Arc::clone(&self.store),
            self.journal()?,
            Arc::clone(&self.rules),
            self.config.clearing_account_code.clone(),
            self.config.auto_post_threshold,
            self.config.scan_batch_size,
        ))
    }

    pub fn auditor(&self) -> Result<IntegrityAuditor> {
        Ok(IntegrityAuditor::new(
            Arc::clone(&self.store),
            self.chart()?,
            self.config.clone(),
        ))
    }

    pub fn remediation(&self) -> Result<RemediationPlanner> {
        Ok(RemediationPlanner::new(Arc::clone(&self.store), self.journal()?))
    }

    /// Audit trail of any entity, newest first by the store's insertion
    /// sequence. Timestamps can tie, so they are never used to reorder.
    pub fn events_for(&self, entity_id: &str) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for entity_type in EVENT_ENTITY_TYPES {
            events.extend(self.store.events_for_entity(entity_type, entity_id)?);
        }
        Ok(events)
    }
}
