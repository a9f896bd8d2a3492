// 🔍 Integrity Auditor - Read-only ledger health scan
//
// Phases run in a fixed order, each reading the store in bounded pages:
//
//   Lines        orphan lines, lines on synthetic accounts, per-account sums
//   Entries      empty or unbalanced entries, bank entries not linked back
//   Duplicates   entries in fingerprint order, one finding per group
//   Signs        analytic accounts closing against their nature
//   Transactions link mismatches, suspicious feed signs
//
// The auditor never mutates anything. A run reads one snapshot; its
// checkpoint holds cursors and at most one open duplicate group, and is
// serializable so an interrupted run resumes where it stopped.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balance::OrphanReason;
use crate::chart::ChartOfAccounts;
use crate::config::LedgerConfig;
use crate::entities::{normalize_description, BankTransaction, EntryRecord, JournalEntry, TransactionStatus};
use crate::error::Result;
use crate::store::{
    read_consistent, EntryFingerprint, FingerprintCursor, LedgerLine, LedgerReader, LedgerStore, ScanCursor,
};

// ============================================================================
// FINDINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FindingKind {
    OrphanLine,
    EntryWithoutLines,
    UnbalancedEntry,
    DuplicateEntry,
    SignInversion,
    LineOnSyntheticAccount,
    LinkMismatch,
    SuspiciousFeedSign,
}

impl FindingKind {
    pub fn severity(&self) -> Severity {
        match self {
            FindingKind::OrphanLine
            | FindingKind::UnbalancedEntry
            | FindingKind::LineOnSyntheticAccount
            | FindingKind::LinkMismatch => Severity::Critical,
            FindingKind::EntryWithoutLines | FindingKind::DuplicateEntry | FindingKind::SignInversion => {
                Severity::Warning
            }
            FindingKind::SuspiciousFeedSign => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Books are wrong until fixed
    Warning,  // Probably wrong, needs a look
    Info,     // Worth knowing
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    /// Other entries of a duplicate group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_entry_ids: Vec<Uuid>,
    /// For orphan lines: what is missing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphan_reason: Option<OrphanReason>,
    pub message: String,
}

impl Finding {
    fn new(kind: FindingKind, message: String) -> Self {
        Finding {
            kind,
            severity: kind.severity(),
            entry_id: None,
            line_id: None,
            account_code: None,
            transaction_id: None,
            amount: None,
            related_entry_ids: Vec::new(),
            orphan_reason: None,
            message,
        }
    }
}

// ============================================================================
// CHECKPOINT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditPhase {
    Lines,
    Entries,
    Duplicates,
    Signs,
    Transactions,
    Done,
}

/// Entry of the duplicate group being collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DuplicateMember {
    entry_id: Uuid,
    created_at: DateTime<Utc>,
    /// What makes this entry distinct activity: its source reference, or
    /// the external id and content hash of the bank transaction behind it
    identities: Vec<String>,
}

/// Entries sharing one fingerprint, seen so far in fingerprint order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DuplicateGroup {
    fingerprint: String,
    members: Vec<DuplicateMember>,
}

/// Everything needed to continue an interrupted audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditCheckpoint {
    pub phase: AuditPhase,
    pub line_cursor: ScanCursor,
    pub entry_after: Option<Uuid>,
    pub fingerprint_after: Option<FingerprintCursor>,
    pub transaction_after: Option<Uuid>,
    pub findings: Vec<Finding>,
    pub lines_scanned: usize,
    pub entries_scanned: usize,
    pub transactions_scanned: usize,
    pub started_at: DateTime<Utc>,

    /// Nature-signed sum per analytic account over posted lines
    account_sums: HashMap<Uuid, Decimal>,
    /// Only the group under the fingerprint cursor is held
    open_group: Option<DuplicateGroup>,
}

impl AuditCheckpoint {
    pub fn start(line_watermark: i64) -> Self {
        AuditCheckpoint {
            phase: AuditPhase::Lines,
            line_cursor: ScanCursor::start(line_watermark),
            entry_after: None,
            fingerprint_after: None,
            transaction_after: None,
            findings: Vec::new(),
            lines_scanned: 0,
            entries_scanned: 0,
            transactions_scanned: 0,
            started_at: Utc::now(),
            account_sums: HashMap::new(),
            open_group: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == AuditPhase::Done
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub findings: Vec<Finding>,
    pub lines_scanned: usize,
    pub entries_scanned: usize,
    pub transactions_scanned: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AuditReport {
    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }

    pub fn of_kind(&self, kind: FindingKind) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.kind == kind)
    }

    pub fn has_critical_issues(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Critical)
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut by_kind: BTreeMap<FindingKind, usize> = BTreeMap::new();
        for finding in &self.findings {
            *by_kind.entry(finding.kind).or_default() += 1;
        }

        let mut output = format!(
            "Audit: {} findings ({} critical) over {} lines, {} entries, {} bank transactions",
            self.findings.len(),
            self.findings.iter().filter(|f| f.severity == Severity::Critical).count(),
            self.lines_scanned,
            self.entries_scanned,
            self.transactions_scanned
        );
        for (kind, count) in by_kind {
            output.push_str(&format!("\n  {:?}: {}", kind, count));
        }
        output
    }
}

// ============================================================================
// AUDITOR
// ============================================================================

pub struct IntegrityAuditor {
    store: Arc<dyn LedgerStore>,
    chart: Arc<ChartOfAccounts>,
    config: LedgerConfig,
}

impl IntegrityAuditor {
    pub fn new(store: Arc<dyn LedgerStore>, chart: Arc<ChartOfAccounts>, config: LedgerConfig) -> Self {
        IntegrityAuditor { store, chart, config }
    }

    pub fn checkpoint(&self) -> Result<AuditCheckpoint> {
        Ok(AuditCheckpoint::start(self.store.line_watermark()?))
    }

    /// Full scan from the beginning.
    pub fn run(&self) -> Result<AuditReport> {
        let checkpoint = self.checkpoint()?;
        self.resume(checkpoint)
    }

    /// Continue a scan until it is done.
    pub fn resume(&self, checkpoint: AuditCheckpoint) -> Result<AuditReport> {
        self.resume_with(checkpoint, |_| Ok(()))
    }

    /// Continue a scan until it is done, handing the checkpoint to
    /// `on_step` after every page so the caller can persist it. All pages
    /// are read from one snapshot.
    pub fn resume_with(
        &self,
        mut checkpoint: AuditCheckpoint,
        mut on_step: impl FnMut(&AuditCheckpoint) -> Result<()>,
    ) -> Result<AuditReport> {
        read_consistent(self.store.as_ref(), |reader| {
            self.resume_in(reader, &mut checkpoint, &mut on_step)
        })?;

        let report = AuditReport {
            findings: checkpoint.findings,
            lines_scanned: checkpoint.lines_scanned,
            entries_scanned: checkpoint.entries_scanned,
            transactions_scanned: checkpoint.transactions_scanned,
            started_at: checkpoint.started_at,
            finished_at: Utc::now(),
        };
        if report.has_critical_issues() {
            warn!("{}", report.summary());
        } else {
            info!("{}", report.summary());
        }
        Ok(report)
    }

    pub(crate) fn resume_in(
        &self,
        reader: &dyn LedgerReader,
        checkpoint: &mut AuditCheckpoint,
        on_step: &mut dyn FnMut(&AuditCheckpoint) -> Result<()>,
    ) -> Result<()> {
        while !checkpoint.is_done() {
            self.step_in(reader, checkpoint)?;
            on_step(checkpoint)?;
        }
        Ok(())
    }

    /// Process one page (or one in-memory phase) in its own snapshot. On
    /// error the checkpoint is left at the last completed page.
    pub fn step(&self, checkpoint: &mut AuditCheckpoint) -> Result<()> {
        read_consistent(self.store.as_ref(), |reader| self.step_in(reader, &mut *checkpoint))
    }

    fn step_in(&self, reader: &dyn LedgerReader, checkpoint: &mut AuditCheckpoint) -> Result<()> {
        let mut next = checkpoint.clone();
        self.advance(reader, &mut next)?;
        *checkpoint = next;
        debug!(phase = ?checkpoint.phase, findings = checkpoint.findings.len(), "audit step");
        Ok(())
    }

    fn advance(&self, reader: &dyn LedgerReader, checkpoint: &mut AuditCheckpoint) -> Result<()> {
        let batch = self.config.scan_batch_size.max(1);
        match checkpoint.phase {
            AuditPhase::Lines => {
                let page = reader.scan_lines(&checkpoint.line_cursor, batch)?;
                match page.last() {
                    Some(last) => {
                        let last_id = last.line.id;
                        checkpoint.lines_scanned += page.len();
                        for item in &page {
                            self.check_line(item, checkpoint);
                        }
                        checkpoint.line_cursor.advance(last_id);
                        if checkpoint.line_cursor.is_exhausted() {
                            checkpoint.phase = AuditPhase::Entries;
                        }
                    }
                    None => checkpoint.phase = AuditPhase::Entries,
                }
            }
            AuditPhase::Entries => {
                let page = reader.scan_entries(checkpoint.entry_after, batch)?;
                match page.last() {
                    Some(last) => {
                        let last_id = last.entry.id;
                        checkpoint.entries_scanned += page.len();
                        for record in &page {
                            self.check_entry(reader, record, checkpoint)?;
                        }
                        checkpoint.entry_after = Some(last_id);
                    }
                    None => checkpoint.phase = AuditPhase::Duplicates,
                }
            }
            AuditPhase::Duplicates => {
                let page = reader.scan_fingerprints(checkpoint.fingerprint_after.as_ref(), batch)?;
                match page.last() {
                    Some(last) => {
                        let cursor = FingerprintCursor::at(last);
                        for item in &page {
                            self.collect_duplicate(reader, item, checkpoint)?;
                        }
                        checkpoint.fingerprint_after = Some(cursor);
                    }
                    None => {
                        if let Some(group) = checkpoint.open_group.take() {
                            self.report_duplicates(group, checkpoint);
                        }
                        checkpoint.phase = AuditPhase::Signs;
                    }
                }
            }
            AuditPhase::Signs => {
                self.report_sign_inversions(checkpoint);
                checkpoint.phase = AuditPhase::Transactions;
            }
            AuditPhase::Transactions => {
                let page = reader.scan_bank_transactions(checkpoint.transaction_after, batch)?;
                match page.last() {
                    Some(last) => {
                        let last_id = last.id;
                        checkpoint.transactions_scanned += page.len();
                        for tx in &page {
                            self.check_transaction(reader, tx, checkpoint)?;
                        }
                        checkpoint.transaction_after = Some(last_id);
                    }
                    None => checkpoint.phase = AuditPhase::Done,
                }
            }
            AuditPhase::Done => {}
        }
        Ok(())
    }

    // ========================================================================
    // CHECKS
    // ========================================================================

    fn check_line(&self, item: &LedgerLine, checkpoint: &mut AuditCheckpoint) {
        let line = &item.line;

        let entry = match &item.entry {
            Some(entry) => entry,
            None => {
                let mut finding = Finding::new(
                    FindingKind::OrphanLine,
                    format!("line {} references missing entry {}", line.id, line.entry_id),
                );
                finding.line_id = Some(line.id);
                finding.entry_id = Some(line.entry_id);
                finding.amount = Some(line.amount());
                finding.account_code = self.chart.by_id(line.account_id).map(|a| a.code.clone());
                finding.orphan_reason = Some(OrphanReason::MissingEntry);
                checkpoint.findings.push(finding);
                return;
            }
        };

        let account = match self.chart.by_id(line.account_id) {
            Some(account) => account,
            None => {
                let mut finding = Finding::new(
                    FindingKind::OrphanLine,
                    format!("line {} references missing account {}", line.id, line.account_id),
                );
                finding.line_id = Some(line.id);
                finding.entry_id = Some(entry.id);
                finding.amount = Some(line.amount());
                finding.orphan_reason = Some(OrphanReason::MissingAccount);
                checkpoint.findings.push(finding);
                return;
            }
        };

        if account.is_synthetic {
            let mut finding = Finding::new(
                FindingKind::LineOnSyntheticAccount,
                format!("line {} is booked to synthetic account {}", line.id, account.code),
            );
            finding.line_id = Some(line.id);
            finding.entry_id = Some(entry.id);
            finding.account_code = Some(account.code.clone());
            finding.amount = Some(line.amount());
            checkpoint.findings.push(finding);
            return;
        }

        if !entry.is_draft {
            *checkpoint.account_sums.entry(account.id).or_default() +=
                account.nature.signed(line.debit, line.credit);
        }
    }

    fn check_entry(&self, reader: &dyn LedgerReader, record: &EntryRecord, checkpoint: &mut AuditCheckpoint) -> Result<()> {
        let entry = &record.entry;

        if record.lines.is_empty() {
            let mut finding = Finding::new(
                FindingKind::EntryWithoutLines,
                format!("entry {} ({}) has no lines", entry.id, entry.description),
            );
            finding.entry_id = Some(entry.id);
            checkpoint.findings.push(finding);
            return Ok(());
        }
        if entry.is_draft {
            return Ok(());
        }

        let totals = record.totals();
        if !totals.is_balanced(self.config.epsilon) {
            let mut finding = Finding::new(
                FindingKind::UnbalancedEntry,
                format!(
                    "entry {} debits {} != credits {}",
                    entry.id, totals.debit, totals.credit
                ),
            );
            finding.entry_id = Some(entry.id);
            finding.amount = Some(totals.difference());
            checkpoint.findings.push(finding);
        }

        if entry.is_bank_sourced() {
            self.check_link_back(reader, entry, totals.debit, checkpoint)?;
        }
        Ok(())
    }

    /// A bank-sourced entry must be the one its transaction points to.
    fn check_link_back(
        &self,
        reader: &dyn LedgerReader,
        entry: &JournalEntry,
        amount: Decimal,
        checkpoint: &mut AuditCheckpoint,
    ) -> Result<()> {
        let reference = entry.reference.as_deref().unwrap_or_default();
        let (transaction_id, message) = match resolve_transaction(reader, reference)? {
            None => (None, format!("entry {} references missing bank transaction {:?}", entry.id, reference)),
            Some(tx) if tx.linked_entry_id == Some(entry.id) => return Ok(()),
            Some(tx) => {
                let linked = match tx.linked_entry_id {
                    Some(other) => format!("linked to entry {}", other),
                    None => format!("{} without a link", tx.status),
                };
                (
                    Some(tx.id),
                    format!("entry {} is sourced from bank transaction {} which is {}", entry.id, tx.external_id, linked),
                )
            }
        };

        let mut finding = Finding::new(FindingKind::LinkMismatch, message);
        finding.entry_id = Some(entry.id);
        finding.transaction_id = transaction_id;
        finding.amount = Some(amount);
        checkpoint.findings.push(finding);
        Ok(())
    }

    /// Rows arrive ordered by fingerprint, so a group is complete as soon
    /// as a different fingerprint shows up.
    fn collect_duplicate(
        &self,
        reader: &dyn LedgerReader,
        item: &EntryFingerprint,
        checkpoint: &mut AuditCheckpoint,
    ) -> Result<()> {
        let member = DuplicateMember {
            entry_id: item.entry.id,
            created_at: item.entry.created_at,
            identities: identities(reader, &item.entry)?,
        };

        match checkpoint.open_group.as_mut() {
            Some(group) if group.fingerprint == item.fingerprint => group.members.push(member),
            _ => {
                let next = DuplicateGroup {
                    fingerprint: item.fingerprint.clone(),
                    members: vec![member],
                };
                if let Some(done) = checkpoint.open_group.replace(next) {
                    self.report_duplicates(done, checkpoint);
                }
            }
        }
        Ok(())
    }

    /// One finding per group of entries sharing description, amount and
    /// date. A group whose members are all tied to distinct source records
    /// is independent activity, not duplication.
    fn report_duplicates(&self, group: DuplicateGroup, checkpoint: &mut AuditCheckpoint) {
        let DuplicateGroup { fingerprint, mut members } = group;
        if members.len() < 2 || has_structural_reason(&members) {
            return;
        }
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.entry_id.cmp(&b.entry_id)));

        let amount = fingerprint
            .rsplit('|')
            .nth(1)
            .and_then(|text| text.parse::<Decimal>().ok());
        let keeper = members[0].entry_id;
        let mut finding = Finding::new(
            FindingKind::DuplicateEntry,
            format!("{} entries share description, amount and date ({})", members.len(), fingerprint),
        );
        finding.entry_id = Some(keeper);
        finding.amount = amount;
        finding.related_entry_ids = members[1..].iter().map(|m| m.entry_id).collect();
        checkpoint.findings.push(finding);
    }

    fn report_sign_inversions(&self, checkpoint: &mut AuditCheckpoint) {
        for account in self.chart.all().filter(|a| a.is_analytic()) {
            if self.config.is_sign_check_exempt(&account.code) {
                continue;
            }
            let balance = checkpoint.account_sums.get(&account.id).copied().unwrap_or_default();
            if balance < -self.config.epsilon {
                let mut finding = Finding::new(
                    FindingKind::SignInversion,
                    format!(
                        "{} account {} ({}) closes at {}",
                        account.nature, account.code, account.name, balance
                    ),
                );
                finding.account_code = Some(account.code.clone());
                finding.amount = Some(balance);
                checkpoint.findings.push(finding);
            }
        }
        checkpoint.account_sums.clear();
    }

    fn check_transaction(
        &self,
        reader: &dyn LedgerReader,
        tx: &BankTransaction,
        checkpoint: &mut AuditCheckpoint,
    ) -> Result<()> {
        let mismatch = match (tx.status, tx.linked_entry_id) {
            (TransactionStatus::Reconciled, None) => Some("is RECONCILED without a linked entry".to_string()),
            (TransactionStatus::Pending, Some(entry_id)) => Some(format!("is PENDING but linked to entry {}", entry_id)),
            (TransactionStatus::Reconciled, Some(entry_id)) => {
                if reader.get_entry(entry_id)?.is_none() {
                    Some(format!("is linked to missing entry {}", entry_id))
                } else if tx.reconciled_at.is_none() {
                    Some("is RECONCILED without a reconciliation time".to_string())
                } else {
                    None
                }
            }
            (TransactionStatus::Pending, None) => None,
        };
        if let Some(problem) = mismatch {
            let mut finding = Finding::new(
                FindingKind::LinkMismatch,
                format!("bank transaction {} {}", tx.external_id, problem),
            );
            finding.transaction_id = Some(tx.id);
            finding.entry_id = tx.linked_entry_id;
            finding.amount = Some(tx.amount);
            checkpoint.findings.push(finding);
        }

        if tx.is_inflow() {
            let description = normalize_description(&tx.description);
            let words: HashSet<&str> = description.split(' ').collect();
            if let Some(keyword) = self
                .config
                .outflow_keywords
                .iter()
                .find(|k| words.contains(normalize_description(k).as_str()))
            {
                let mut finding = Finding::new(
                    FindingKind::SuspiciousFeedSign,
                    format!(
                        "inflow {} of {} mentions {:?}: \"{}\"",
                        tx.external_id, tx.amount, keyword, tx.description
                    ),
                );
                finding.transaction_id = Some(tx.id);
                finding.amount = Some(tx.amount);
                checkpoint.findings.push(finding);
            }
        }
        Ok(())
    }
}

/// The bank transaction a bank-sourced reference points to: by id, or by
/// external id for references written before ids were used.
fn resolve_transaction(reader: &dyn LedgerReader, reference: &str) -> Result<Option<BankTransaction>> {
    match Uuid::parse_str(reference) {
        Ok(id) => reader.get_bank_transaction(id),
        Err(_) if reference.trim().is_empty() => Ok(None),
        Err(_) => reader.find_bank_transaction(reference, reference),
    }
}

fn identities(reader: &dyn LedgerReader, entry: &JournalEntry) -> Result<Vec<String>> {
    let reference = match entry.reference.as_deref().map(str::trim) {
        Some(reference) if !reference.is_empty() => reference,
        _ => return Ok(Vec::new()),
    };
    if entry.is_bank_sourced() {
        // two feed rows are the same activity when they share an external
        // id or content, whatever transaction ids they were given
        return Ok(match resolve_transaction(reader, reference)? {
            Some(tx) => vec![format!("ext:{}", tx.external_id), format!("hash:{}", tx.content_hash)],
            None if Uuid::parse_str(reference).is_ok() => Vec::new(),
            None => vec![format!("ext:{}", reference)],
        });
    }
    Ok(vec![match &entry.source_type {
        Some(source) => format!("{}:{}", source, reference),
        None => reference.to_string(),
    }])
}

fn has_structural_reason(members: &[DuplicateMember]) -> bool {
    let mut seen = HashSet::new();
    members.iter().all(|m| {
        !m.identities.is_empty() && m.identities.iter().all(|identity| seen.insert(identity.as_str()))
    })
}
