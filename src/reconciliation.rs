// ⚖️ Reconciliation Matcher - Bank feed to ledger
//
// PENDING --(auto, confidence >= threshold)--> RECONCILED
// PENDING --(manual override)---------------> RECONCILED
// RECONCILED --(undo)------------------------> PENDING
//
// Undo voids the reconciling entry; when that entry is already gone the
// transaction is released back to PENDING on its own.
//
// Every reconciliation is one balanced entry against the clearing account,
// posted in the same store transaction that links the bank transaction.
// Re-running a batch never creates a second entry for the same transaction.

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{
    BankTransaction, EntryRecord, EntryType, FeedRecord, NewEntry, NewLine, TransactionStatus, BANK_SOURCE,
};
use crate::error::{LedgerError, Result};
use crate::journal::JournalStore;
use crate::rules::{Candidate, Classification, RuleEngine};
use crate::store::{InsertOutcome, LedgerStore};

// ============================================================================
// RUN MODE
// ============================================================================

/// Every mutating batch operation runs as a dry run unless told otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunMode {
    #[default]
    DryRun,
    Apply,
}

impl RunMode {
    pub fn is_apply(&self) -> bool {
        *self == RunMode::Apply
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum IngestOutcome {
    /// Stored as PENDING (or would be, in a dry run)
    Imported(BankTransaction),
    /// Already known by external id or content; the stored record
    Duplicate(BankTransaction),
    Rejected { external_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TransactionOutcome {
    Reconciled {
        transaction_id: Uuid,
        /// `None` in a dry run
        entry_id: Option<Uuid>,
        account_code: String,
        confidence: f64,
        rule_id: String,
    },
    AlreadyReconciled {
        transaction_id: Uuid,
        entry_id: Option<Uuid>,
    },
    /// Queued for review
    Ambiguous {
        transaction_id: Uuid,
        candidates: Vec<Candidate>,
    },
    Unmatched {
        transaction_id: Uuid,
    },
    BelowThreshold {
        transaction_id: Uuid,
        account_code: String,
        confidence: f64,
    },
    /// The entry was refused (e.g. target account no longer analytic)
    Failed {
        transaction_id: Uuid,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub mode: RunMode,
    pub imported: usize,
    pub duplicates: usize,
    pub rejected: Vec<(String, String)>,
    pub outcomes: Vec<TransactionOutcome>,
}

impl ReconciliationReport {
    fn count(&self, pred: impl Fn(&TransactionOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }

    pub fn created(&self) -> usize {
        self.count(|o| matches!(o, TransactionOutcome::Reconciled { .. }))
    }

    pub fn already_reconciled(&self) -> usize {
        self.count(|o| matches!(o, TransactionOutcome::AlreadyReconciled { .. }))
    }

    pub fn ambiguous(&self) -> usize {
        self.count(|o| matches!(o, TransactionOutcome::Ambiguous { .. }))
    }

    pub fn unmatched(&self) -> usize {
        self.count(|o| matches!(o, TransactionOutcome::Unmatched { .. }))
    }

    pub fn below_threshold(&self) -> usize {
        self.count(|o| matches!(o, TransactionOutcome::BelowThreshold { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TransactionOutcome::Failed { .. }))
    }

    pub fn summary(&self) -> String {
        format!(
            "Reconciliation ({:?}): {} imported, {} duplicates, {} rejected | {} reconciled, {} already reconciled, {} ambiguous, {} unmatched, {} below threshold, {} failed",
            self.mode,
            self.imported,
            self.duplicates,
            self.rejected.len(),
            self.created(),
            self.already_reconciled(),
            self.ambiguous(),
            self.unmatched(),
            self.below_threshold(),
            self.failed()
        )
    }
}

/// What `undo` did (or would do, in a dry run).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum UndoOutcome {
    AlreadyPending,
    /// The reconciling entry, voided
    Voided(EntryRecord),
    /// The entry was already gone; only the transaction was reset
    Released { missing_entry: Option<Uuid> },
}

/// A pending transaction with what the rules say about it.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewItem {
    pub transaction: BankTransaction,
    pub classification: Classification,
}

// ============================================================================
// MATCHER
// ============================================================================

pub struct ReconciliationMatcher {
    store: Arc<dyn LedgerStore>,
    journal: Arc<JournalStore>,
    rules: Arc<RuleEngine>,
    clearing_account_code: String,
    auto_post_threshold: f64,
    batch_size: usize,
}

impl ReconciliationMatcher {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        journal: Arc<JournalStore>,
        rules: Arc<RuleEngine>,
        clearing_account_code: impl Into<String>,
        auto_post_threshold: f64,
        batch_size: usize,
    ) -> Self {
        ReconciliationMatcher {
            store,
            journal,
            rules,
            clearing_account_code: clearing_account_code.into(),
            auto_post_threshold,
            batch_size: batch_size.max(1),
        }
    }

    // ========================================================================
    // INGESTION
    // ========================================================================

    /// Store feed records as PENDING transactions. Duplicates and malformed
    /// records are reported per record; only storage failures abort.
    pub fn ingest(&self, records: Vec<FeedRecord>, mode: RunMode, actor: &str) -> Result<Vec<IngestOutcome>> {
        let mut outcomes = Vec::with_capacity(records.len());
        // dry runs see nothing stored, so duplicates inside the batch are tracked here
        let mut batch_seen: HashMap<String, BankTransaction> = HashMap::new();

        for record in records {
            let external_id = record.external_id.clone();
            let tx = match record.into_transaction() {
                Ok(tx) => tx,
                Err(err) => {
                    warn!(external_id = %external_id, error = %err, "feed record rejected");
                    outcomes.push(IngestOutcome::Rejected {
                        external_id,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let existing = if mode.is_apply() {
                match self.store.insert_bank_transaction(&tx, actor)? {
                    InsertOutcome::Inserted(inserted) => {
                        outcomes.push(IngestOutcome::Imported(inserted));
                        continue;
                    }
                    InsertOutcome::Existing(existing) => Some(existing),
                }
            } else {
                self.store.find_bank_transaction(&tx.external_id, &tx.content_hash)?
            };

            match existing {
                Some(existing) => outcomes.push(self.classify_existing(tx, existing)),
                None => {
                    let id_key = format!("id:{}", tx.external_id);
                    let hash_key = format!("hash:{}", tx.content_hash);
                    let seen = batch_seen
                        .get(&id_key)
                        .or_else(|| batch_seen.get(&hash_key))
                        .cloned();
                    match seen {
                        Some(first) => outcomes.push(self.classify_existing(tx, first)),
                        None => {
                            batch_seen.insert(id_key, tx.clone());
                            batch_seen.insert(hash_key, tx.clone());
                            outcomes.push(IngestOutcome::Imported(tx));
                        }
                    }
                }
            }
        }

        Ok(outcomes)
    }

    /// Same external id with different content is a conflict; anything else
    /// already seen is a harmless duplicate.
    fn classify_existing(&self, incoming: BankTransaction, existing: BankTransaction) -> IngestOutcome {
        if existing.external_id == incoming.external_id && !existing.same_content(&incoming) {
            let err = LedgerError::Conflict(format!(
                "external id {} already imported with different content",
                incoming.external_id
            ));
            warn!(external_id = %incoming.external_id, "conflicting feed record");
            return IngestOutcome::Rejected {
                external_id: incoming.external_id,
                reason: err.to_string(),
            };
        }
        IngestOutcome::Duplicate(existing)
    }

    /// Ingest, classify and post a feed batch.
    pub fn reconcile_batch(&self, records: Vec<FeedRecord>, mode: RunMode, actor: &str) -> Result<ReconciliationReport> {
        let mut report = ReconciliationReport {
            mode,
            ..Default::default()
        };

        let mut processed: HashSet<Uuid> = HashSet::new();
        for outcome in self.ingest(records, mode, actor)? {
            let tx = match outcome {
                IngestOutcome::Imported(tx) => {
                    report.imported += 1;
                    tx
                }
                IngestOutcome::Duplicate(tx) => {
                    // a pending duplicate still gets its chance to reconcile
                    report.duplicates += 1;
                    tx
                }
                IngestOutcome::Rejected { external_id, reason } => {
                    report.rejected.push((external_id, reason));
                    continue;
                }
            };
            if !processed.insert(tx.id) {
                continue;
            }
            report.outcomes.push(self.reconcile_one(&tx, mode, actor)?);
        }

        info!(mode = ?mode, "{}", report.summary());
        Ok(report)
    }

    /// `reconcile_batch` over a feed file; rows that could not be read are
    /// listed first among the rejections.
    pub fn reconcile_feed(&self, feed: FeedFile, mode: RunMode, actor: &str) -> Result<ReconciliationReport> {
        let mut report = self.reconcile_batch(feed.records, mode, actor)?;
        report.rejected.splice(0..0, feed.rejected);
        Ok(report)
    }

    /// Re-run classification over every PENDING transaction already stored.
    pub fn reconcile_pending(&self, mode: RunMode, actor: &str) -> Result<ReconciliationReport> {
        let mut report = ReconciliationReport {
            mode,
            ..Default::default()
        };
        for tx in self.pending()? {
            report.outcomes.push(self.reconcile_one(&tx, mode, actor)?);
        }
        info!(mode = ?mode, "{}", report.summary());
        Ok(report)
    }

    // ========================================================================
    // POSTING
    // ========================================================================

    fn reconcile_one(&self, tx: &BankTransaction, mode: RunMode, actor: &str) -> Result<TransactionOutcome> {
        if tx.is_reconciled() {
            return Ok(TransactionOutcome::AlreadyReconciled {
                transaction_id: tx.id,
                entry_id: tx.linked_entry_id,
            });
        }

        let (account_code, confidence, rule_id) = match self.rules.classify(tx) {
            Classification::NoMatch => return Ok(TransactionOutcome::Unmatched { transaction_id: tx.id }),
            Classification::Ambiguous(candidates) => {
                return Ok(TransactionOutcome::Ambiguous {
                    transaction_id: tx.id,
                    candidates,
                })
            }
            Classification::Matched {
                account_code,
                confidence,
                rule_id,
            } => (account_code, confidence, rule_id),
        };

        if confidence < self.auto_post_threshold {
            return Ok(TransactionOutcome::BelowThreshold {
                transaction_id: tx.id,
                account_code,
                confidence,
            });
        }

        let (entry, lines) = self.entry_for(tx, &account_code, EntryType::BankImport);
        match self.post(tx, entry, lines, mode, actor) {
            Ok(entry_id) => Ok(TransactionOutcome::Reconciled {
                transaction_id: tx.id,
                entry_id,
                account_code,
                confidence,
                rule_id,
            }),
            Err(err) => self.posting_failure(tx, err),
        }
    }

    /// Lines of the reconciling entry: inflows debit the clearing account,
    /// outflows credit it; the classified account takes the other side.
    fn entry_for(&self, tx: &BankTransaction, account_code: &str, entry_type: EntryType) -> (NewEntry, Vec<NewLine>) {
        let amount = tx.magnitude();
        let entry = NewEntry::new(tx.transaction_date, tx.description.clone(), entry_type)
            .with_source(BANK_SOURCE, tx.id.to_string());

        let lines = if tx.is_inflow() {
            vec![
                NewLine::debit_to(self.clearing_account_code.clone(), amount),
                NewLine::credit_to(account_code, amount),
            ]
        } else {
            vec![
                NewLine::debit_to(account_code, amount),
                NewLine::credit_to(self.clearing_account_code.clone(), amount),
            ]
        };
        (entry, lines)
    }

    fn post(&self, tx: &BankTransaction, entry: NewEntry, lines: Vec<NewLine>, mode: RunMode, actor: &str) -> Result<Option<Uuid>> {
        if !mode.is_apply() {
            self.journal.preview(entry, lines)?;
            return Ok(None);
        }
        let stored = self.journal.post_linked(entry, lines, tx.id, actor)?;
        info!(
            transaction = %tx.id,
            entry_id = %stored.entry.id,
            amount = %tx.amount,
            "bank transaction reconciled"
        );
        Ok(Some(stored.entry.id))
    }

    /// A concurrent reconciliation won the race: report it as already done.
    /// Validation refusals become a per-transaction failure; storage errors abort.
    fn posting_failure(&self, tx: &BankTransaction, err: LedgerError) -> Result<TransactionOutcome> {
        match err {
            LedgerError::Duplicate { .. } => {
                let current = self.store.get_bank_transaction(tx.id)?;
                Ok(TransactionOutcome::AlreadyReconciled {
                    transaction_id: tx.id,
                    entry_id: current.and_then(|t| t.linked_entry_id),
                })
            }
            err if err.is_validation() || matches!(err, LedgerError::NotFound { .. }) => {
                warn!(transaction = %tx.id, error = %err, "reconciling entry refused");
                Ok(TransactionOutcome::Failed {
                    transaction_id: tx.id,
                    reason: err.to_string(),
                })
            }
            err => Err(err),
        }
    }

    // ========================================================================
    // MANUAL OVERRIDE / UNDO
    // ========================================================================

    /// Reconcile a transaction against an operator-chosen account.
    pub fn reconcile_manual(&self, tx_id: Uuid, account_code: &str, mode: RunMode, actor: &str) -> Result<TransactionOutcome> {
        let tx = self.get_transaction(tx_id)?;
        if tx.is_reconciled() {
            return Ok(TransactionOutcome::AlreadyReconciled {
                transaction_id: tx.id,
                entry_id: tx.linked_entry_id,
            });
        }

        let (entry, lines) = self.entry_for(&tx, account_code, EntryType::Classification);
        match self.post(&tx, entry, lines, mode, actor) {
            Ok(entry_id) => Ok(TransactionOutcome::Reconciled {
                transaction_id: tx.id,
                entry_id,
                account_code: account_code.to_string(),
                confidence: 1.0,
                rule_id: "manual".to_string(),
            }),
            Err(LedgerError::Duplicate { .. }) => self.posting_failure(&tx, LedgerError::duplicate("reconciliation", tx.id)),
            Err(err) => Err(err),
        }
    }

    /// Void the reconciling entry and return the transaction to PENDING.
    /// A transaction whose entry no longer exists is released directly.
    pub fn undo(&self, tx_id: Uuid, mode: RunMode, actor: &str) -> Result<UndoOutcome> {
        let tx = self.get_transaction(tx_id)?;
        if tx.status == TransactionStatus::Pending && tx.linked_entry_id.is_none() {
            return Ok(UndoOutcome::AlreadyPending);
        }

        if let Some(entry_id) = tx.linked_entry_id {
            let voided = if mode.is_apply() {
                self.journal.void(entry_id, actor).map(|deletion| deletion.removed)
            } else {
                self.journal.void_preview(entry_id)
            };
            match voided {
                Ok(record) => {
                    if mode.is_apply() {
                        info!(transaction = %tx.id, entry_id = %entry_id, "reconciliation undone");
                    }
                    return Ok(UndoOutcome::Voided(record));
                }
                Err(LedgerError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        if mode.is_apply() {
            self.store.release_bank_transaction(tx.id, actor)?;
            warn!(
                transaction = %tx.id,
                missing_entry = ?tx.linked_entry_id,
                "reconciling entry already gone; transaction released"
            );
        }
        Ok(UndoOutcome::Released {
            missing_entry: tx.linked_entry_id,
        })
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Pending transactions with their current classification.
    pub fn review_queue(&self) -> Result<Vec<ReviewItem>> {
        Ok(self
            .pending()?
            .into_iter()
            .map(|transaction| ReviewItem {
                classification: self.rules.classify(&transaction),
                transaction,
            })
            .collect())
    }

    fn pending(&self) -> Result<Vec<BankTransaction>> {
        let mut pending = Vec::new();
        let mut after = None;
        loop {
            let page = self.store.scan_bank_transactions(after, self.batch_size)?;
            let last = match page.last() {
                Some(last) => last.id,
                None => break,
            };
            pending.extend(page.into_iter().filter(|tx| tx.status == TransactionStatus::Pending));
            after = Some(last);
        }
        pending.sort_by(|a, b| a.transaction_date.cmp(&b.transaction_date).then(a.id.cmp(&b.id)));
        Ok(pending)
    }

    fn get_transaction(&self, tx_id: Uuid) -> Result<BankTransaction> {
        self.store
            .get_bank_transaction(tx_id)?
            .ok_or_else(|| LedgerError::not_found("bank transaction", tx_id))
    }
}

/// Feed records read from a CSV file, plus the rows that did not parse.
#[derive(Debug, Clone, Default)]
pub struct FeedFile {
    pub records: Vec<FeedRecord>,
    /// ("row N", reason)
    pub rejected: Vec<(String, String)>,
}

/// Read a `type,date,amount,external_id,memo` feed file. Unreadable rows
/// are kept as rejections so the operator sees them in the report.
pub fn read_feed_csv(path: &Path) -> AnyResult<FeedFile> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open feed file: {:?}", path))?;

    let mut feed = FeedFile::default();
    for (index, result) in rdr.deserialize::<FeedRecord>().enumerate() {
        match result {
            Ok(record) => feed.records.push(record),
            Err(err) => {
                warn!(row = index + 1, error = %err, "unreadable feed row");
                feed.rejected.push((format!("row {}", index + 1), err.to_string()));
            }
        }
    }
    Ok(feed)
}
