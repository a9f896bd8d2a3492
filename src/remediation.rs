// 🩹 Remediation - Audit findings to corrective actions
//
// plan -> (dry run | apply) -> restore
//
// Only mechanical fixes are automated: orphan lines, empty entries and the
// extra copies of duplicated entries. Everything else becomes ManualReview.
// Each applied action leaves one audit event holding the full snapshot, and
// `restore` rebuilds the deleted record from it, reconciling again any bank
// transaction the deletion had released.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditReport, FindingKind};
use crate::balance::OrphanReason;
use crate::entities::{EntryLine, EntryRecord, TransactionStatus};
use crate::error::{LedgerError, Result};
use crate::journal::JournalStore;
use crate::reconciliation::RunMode;
use crate::store::{Event, LedgerStore, ScanCursor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemediationAction {
    DeleteOrphanLine { line_id: i64 },
    DeleteEmptyEntry { entry_id: Uuid },
    /// Void a duplicate copy; `keep` is the entry that stays
    VoidDuplicateEntry { entry_id: Uuid, keep: Uuid },
    ManualReview { kind: FindingKind, message: String },
}

impl RemediationAction {
    pub fn is_automatic(&self) -> bool {
        !matches!(self, RemediationAction::ManualReview { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ActionStatus {
    /// Dry run: nothing changed
    WouldApply,
    Applied { event_id: String },
    /// Target already gone (fixed concurrently or by an earlier action)
    Skipped { reason: String },
    ManualReview,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub action: RemediationAction,
    pub status: ActionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemediationReport {
    pub mode: RunMode,
    pub results: Vec<ActionResult>,
}

impl RemediationReport {
    pub fn applied(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, ActionStatus::Applied { .. }))
            .count()
    }

    pub fn event_ids(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter_map(|r| match &r.status {
                ActionStatus::Applied { event_id } => Some(event_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        let count = |f: fn(&ActionStatus) -> bool| self.results.iter().filter(|r| f(&r.status)).count();
        format!(
            "Remediation ({:?}): {} applied, {} would apply, {} skipped, {} for manual review",
            self.mode,
            self.applied(),
            count(|s| matches!(s, ActionStatus::WouldApply)),
            count(|s| matches!(s, ActionStatus::Skipped { .. })),
            count(|s| matches!(s, ActionStatus::ManualReview)),
        )
    }
}

/// What `restore` brought back.
#[derive(Debug, Clone, PartialEq)]
pub enum Restored {
    Entry(EntryRecord),
    Line(EntryLine),
}

pub struct RemediationPlanner {
    store: Arc<dyn LedgerStore>,
    journal: Arc<JournalStore>,
}

impl RemediationPlanner {
    pub fn new(store: Arc<dyn LedgerStore>, journal: Arc<JournalStore>) -> Self {
        RemediationPlanner { store, journal }
    }

    /// Turn findings into actions. Each target id appears at most once.
    pub fn plan(&self, report: &AuditReport) -> Vec<RemediationAction> {
        let mut actions = Vec::new();
        let mut lines_seen = HashSet::new();
        let mut entries_seen = HashSet::new();

        for finding in &report.findings {
            let manual = || RemediationAction::ManualReview {
                kind: finding.kind,
                message: finding.message.clone(),
            };

            match (finding.kind, finding.orphan_reason) {
                (FindingKind::OrphanLine, Some(OrphanReason::MissingEntry)) => match finding.line_id {
                    Some(line_id) if lines_seen.insert(line_id) => {
                        actions.push(RemediationAction::DeleteOrphanLine { line_id })
                    }
                    Some(_) => {}
                    None => actions.push(manual()),
                },
                (FindingKind::EntryWithoutLines, _) => match finding.entry_id {
                    Some(entry_id) if entries_seen.insert(entry_id) => {
                        actions.push(RemediationAction::DeleteEmptyEntry { entry_id })
                    }
                    Some(_) => {}
                    None => actions.push(manual()),
                },
                (FindingKind::DuplicateEntry, _) => match finding.entry_id {
                    Some(keep) => {
                        for &entry_id in &finding.related_entry_ids {
                            if entry_id != keep && entries_seen.insert(entry_id) {
                                actions.push(RemediationAction::VoidDuplicateEntry { entry_id, keep });
                            }
                        }
                    }
                    None => actions.push(manual()),
                },
                // a line whose account is gone needs a decision about where it belongs
                _ => actions.push(manual()),
            }
        }
        actions
    }

    /// Execute a plan. Dry run only reports; `Apply` mutates one target at a time.
    pub fn apply(&self, plan: Vec<RemediationAction>, mode: RunMode, actor: &str) -> Result<RemediationReport> {
        let mut results = Vec::with_capacity(plan.len());

        for action in plan {
            let status = if !action.is_automatic() {
                ActionStatus::ManualReview
            } else if !mode.is_apply() {
                ActionStatus::WouldApply
            } else {
                self.execute(&action, actor)?
            };
            results.push(ActionResult { action, status });
        }

        let report = RemediationReport { mode, results };
        info!("{}", report.summary());
        Ok(report)
    }

    fn execute(&self, action: &RemediationAction, actor: &str) -> Result<ActionStatus> {
        let status = match action {
            RemediationAction::DeleteOrphanLine { line_id } => match self.store.delete_line(*line_id, actor)? {
                Some(deletion) => {
                    info!(line_id, event_id = %deletion.event_id, "orphan line deleted");
                    ActionStatus::Applied { event_id: deletion.event_id }
                }
                None => skipped(format!("line {} no longer exists", line_id)),
            },
            RemediationAction::DeleteEmptyEntry { entry_id } => {
                match self.store.get_entry(*entry_id)? {
                    Some(record) if !record.lines.is_empty() => {
                        skipped(format!("entry {} has lines again", entry_id))
                    }
                    Some(_) => self.void(*entry_id, actor)?,
                    None => skipped(format!("entry {} no longer exists", entry_id)),
                }
            }
            RemediationAction::VoidDuplicateEntry { entry_id, keep } => {
                if self.store.get_entry(*keep)?.is_none() {
                    // never remove the last copy
                    skipped(format!("kept entry {} is gone", keep))
                } else {
                    self.void(*entry_id, actor)?
                }
            }
            RemediationAction::ManualReview { .. } => ActionStatus::ManualReview,
        };
        Ok(status)
    }

    fn void(&self, entry_id: Uuid, actor: &str) -> Result<ActionStatus> {
        match self.journal.void(entry_id, actor) {
            Ok(deletion) => Ok(ActionStatus::Applied { event_id: deletion.event_id }),
            Err(LedgerError::NotFound { .. }) => Ok(skipped(format!("entry {} no longer exists", entry_id))),
            Err(err) => Err(err),
        }
    }

    /// Re-create a deleted entry (with its lines) or line from the snapshot
    /// logged by its deletion event. Bank transactions the deletion reset
    /// to PENDING are reconciled to the entry again in the same unit. A dry
    /// run checks the same conditions and writes nothing.
    pub fn restore(&self, event_id: &str, mode: RunMode, actor: &str) -> Result<Restored> {
        let event = self
            .store
            .get_event(event_id)?
            .ok_or_else(|| LedgerError::not_found("event", event_id))?;

        match event.event_type.as_str() {
            "entry_deleted" => {
                let record: EntryRecord = snapshot_of(&event)?;
                let relink = event.unlinked_transactions();
                if !mode.is_apply() {
                    self.check_entry_restorable(&record, &relink)?;
                    return Ok(Restored::Entry(record));
                }
                self.store.restore_entry(&record, &relink, actor)?;
                info!(entry_id = %record.entry.id, event_id, relinked = relink.len(), "entry restored");
                Ok(Restored::Entry(record))
            }
            "line_deleted" => {
                let line: EntryLine = snapshot_of(&event)?;
                if !mode.is_apply() {
                    self.check_line_restorable(&line)?;
                    return Ok(Restored::Line(line));
                }
                self.store.restore_line(&line, actor)?;
                info!(line_id = line.id, event_id, "line restored");
                Ok(Restored::Line(line))
            }
            other => {
                warn!(event_id, event_type = other, "event cannot be restored");
                Err(LedgerError::Conflict(format!(
                    "event {} ({}) is not a deletion",
                    event_id, other
                )))
            }
        }
    }

    fn check_entry_restorable(&self, record: &EntryRecord, relink: &[Uuid]) -> Result<()> {
        if self.store.get_entry(record.entry.id)?.is_some() {
            return Err(LedgerError::duplicate("journal entry", record.entry.id));
        }
        for tx_id in relink {
            let free = self
                .store
                .get_bank_transaction(*tx_id)?
                .is_some_and(|tx| tx.status == TransactionStatus::Pending && tx.linked_entry_id.is_none());
            if !free {
                return Err(LedgerError::Conflict(format!(
                    "bank transaction {} was reconciled again after entry {} was deleted",
                    tx_id, record.entry.id
                )));
            }
        }
        Ok(())
    }

    fn check_line_restorable(&self, line: &EntryLine) -> Result<()> {
        let cursor = ScanCursor {
            after: line.id - 1,
            watermark: line.id,
        };
        if line.id <= 0 || !self.store.scan_lines(&cursor, 1)?.is_empty() {
            return Err(LedgerError::Conflict(format!("line id {} is not free", line.id)));
        }
        Ok(())
    }
}

fn skipped(reason: String) -> ActionStatus {
    ActionStatus::Skipped { reason }
}

fn snapshot_of<T: serde::de::DeserializeOwned>(event: &Event) -> Result<T> {
    let snapshot = event
        .snapshot()
        .cloned()
        .ok_or_else(|| LedgerError::Conflict(format!("event {} carries no snapshot", event.event_id)))?;
    Ok(serde_json::from_value(snapshot)?)
}
