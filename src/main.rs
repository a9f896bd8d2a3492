// Ledger Engine CLI
// Every mutating command is a dry run unless `--apply` is given.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ledger_engine::config::DATABASE_ENV;
use ledger_engine::{
    load_chart_csv, read_feed_csv, ActionStatus, AuditCheckpoint, BalanceFilter, LedgerConfig,
    LedgerEngine, Restored, RuleEngine, RunMode, SqliteStore, TransactionOutcome, UndoOutcome,
};

const DEFAULT_DB: &str = "ledger.db";

/// Double-entry ledger with bank reconciliation and integrity auditing
#[derive(Parser)]
#[command(name = "ledger-engine")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// SQLite database (defaults to $LEDGER_DB, then ledger.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON config file (defaults to $LEDGER_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Name recorded in audit events
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,

    /// Load accounts from a code,name,nature CSV
    LoadChart {
        csv: PathBuf,
        #[arg(long)]
        apply: bool,
    },

    /// Ingest a bank feed CSV (type,date,amount,external_id,memo) and reconcile it
    ImportFeed {
        csv: PathBuf,
        #[arg(long)]
        apply: bool,
    },

    /// Period balances with rollup
    Balances {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        /// Hide accounts without any figure
        #[arg(long)]
        only_moved: bool,
    },

    /// Pending bank transactions and what the rules say about them
    Review,

    /// Scan the ledger for integrity problems
    Audit {
        #[arg(long)]
        json: bool,
        /// Save progress here and resume from it if present
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Fix what the audit can fix mechanically
    Remediate {
        #[arg(long)]
        apply: bool,
    },

    /// Re-create a record deleted by remediation or undo
    Restore {
        event_id: String,
        #[arg(long)]
        apply: bool,
    },

    /// Reconcile a pending transaction to an account by hand
    Classify {
        tx_id: Uuid,
        account_code: String,
        #[arg(long)]
        apply: bool,
    },

    /// Return a reconciled transaction to PENDING
    Undo {
        tx_id: Uuid,
        #[arg(long)]
        apply: bool,
    },

    /// Audit trail of an entity
    Events { entity_id: String },
}

fn run_mode(apply: bool) -> RunMode {
    if apply {
        RunMode::Apply
    } else {
        RunMode::DryRun
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = cli
        .db
        .clone()
        .or_else(|| std::env::var_os(DATABASE_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));

    let config = match &cli.config {
        Some(path) => LedgerConfig::from_file(path)?,
        None => LedgerConfig::from_env()?,
    };

    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("Failed to open database {:?}", db_path))?;

    if let Commands::Init = cli.command {
        println!("✓ Database initialized at {:?}", db_path);
        return Ok(());
    }

    let rules = match &config.rules_path {
        Some(path) => RuleEngine::from_file(path)?,
        None => RuleEngine::new(),
    };
    let engine = LedgerEngine::new(Arc::new(store), config, rules)?;

    run(&engine, cli.command, &cli.actor)
}

fn run(engine: &LedgerEngine, command: Commands, actor: &str) -> Result<()> {
    match command {
        Commands::Init => Ok(()),
        Commands::LoadChart { csv, apply } => load_chart(engine, &csv, run_mode(apply), actor),
        Commands::ImportFeed { csv, apply } => import_feed(engine, &csv, run_mode(apply), actor),
        Commands::Balances { from, to, only_moved } => {
            let report = engine.balances()?.report(from, to, BalanceFilter { only_moved })?;
            print!("{}", report.summary());
            Ok(())
        }
        Commands::Review => review(engine),
        Commands::Audit { json, checkpoint } => audit(engine, json, checkpoint.as_deref()),
        Commands::Remediate { apply } => remediate(engine, run_mode(apply), actor),
        Commands::Restore { event_id, apply } => {
            let mode = run_mode(apply);
            let verb = if apply { "✓ Restored" } else { "Would restore" };
            match engine.remediation()?.restore(&event_id, mode, actor)? {
                Restored::Entry(record) => println!(
                    "{} entry {} with {} lines",
                    verb,
                    record.entry.id,
                    record.lines.len()
                ),
                Restored::Line(line) => println!("{} line {}", verb, line.id),
            }
            if !apply {
                println!("Dry run: nothing was written. Re-run with --apply.");
            }
            Ok(())
        }
        Commands::Classify { tx_id, account_code, apply } => {
            let outcome = engine.matcher()?.reconcile_manual(tx_id, &account_code, run_mode(apply), actor)?;
            print_outcome(&outcome);
            Ok(())
        }
        Commands::Undo { tx_id, apply } => {
            match engine.matcher()?.undo(tx_id, run_mode(apply), actor)? {
                UndoOutcome::Voided(record) if apply => {
                    println!("✓ Voided entry {}; transaction is PENDING", record.entry.id)
                }
                UndoOutcome::Voided(record) => println!("Would void entry {} (dry run, use --apply)", record.entry.id),
                UndoOutcome::Released { missing_entry } if apply => {
                    println!("✓ Entry {:?} was already gone; transaction is PENDING", missing_entry)
                }
                UndoOutcome::Released { missing_entry } => {
                    println!("Would release transaction; entry {:?} is gone (dry run, use --apply)", missing_entry)
                }
                UndoOutcome::AlreadyPending => println!("Transaction {} is already PENDING", tx_id),
            }
            Ok(())
        }
        Commands::Events { entity_id } => {
            let events = engine.events_for(&entity_id)?;
            if events.is_empty() {
                println!("No events for {}", entity_id);
            }
            for event in events {
                println!(
                    "{} {:<28} {:<18} {} {}",
                    event.timestamp.to_rfc3339(),
                    event.event_type,
                    event.actor,
                    event.event_id,
                    event.data
                );
            }
            Ok(())
        }
    }
}

fn load_chart(engine: &LedgerEngine, csv: &Path, mode: RunMode, actor: &str) -> Result<()> {
    let rows = load_chart_csv(csv)?;
    println!("📂 Loaded {} chart rows from {:?}", rows.len(), csv);

    let summary = engine.import_chart(rows, mode, actor)?;
    println!(
        "✓ {} inserted, {} updated, {} skipped",
        summary.inserted, summary.updated, summary.skipped
    );
    if !mode.is_apply() {
        println!("Dry run: nothing was written. Re-run with --apply.");
    }
    Ok(())
}

fn import_feed(engine: &LedgerEngine, csv: &Path, mode: RunMode, actor: &str) -> Result<()> {
    let feed = read_feed_csv(csv)?;
    println!("📂 Read {} feed records from {:?}", feed.records.len(), csv);

    let report = engine.matcher()?.reconcile_feed(feed, mode, actor)?;
    for (external_id, reason) in &report.rejected {
        println!("  ✗ {}: {}", external_id, reason);
    }
    for outcome in &report.outcomes {
        print_outcome(outcome);
    }
    println!("{}", report.summary());
    if !mode.is_apply() {
        println!("Dry run: nothing was written. Re-run with --apply.");
    }
    Ok(())
}

fn print_outcome(outcome: &TransactionOutcome) {
    match outcome {
        TransactionOutcome::Reconciled { transaction_id, entry_id, account_code, confidence, rule_id } => {
            let entry = entry_id.map(|id| id.to_string()).unwrap_or_else(|| "(dry run)".to_string());
            println!(
                "  ✓ {} -> {} via {} ({:.0}%) entry {}",
                transaction_id,
                account_code,
                rule_id,
                confidence * 100.0,
                entry
            );
        }
        TransactionOutcome::AlreadyReconciled { transaction_id, .. } => {
            println!("  = {} already reconciled", transaction_id)
        }
        TransactionOutcome::Ambiguous { transaction_id, candidates } => {
            let targets: Vec<&str> = candidates.iter().map(|c| c.account_code.as_str()).collect();
            println!("  ? {} ambiguous between {}", transaction_id, targets.join(", "));
        }
        TransactionOutcome::Unmatched { transaction_id } => println!("  ? {} unmatched", transaction_id),
        TransactionOutcome::BelowThreshold { transaction_id, account_code, confidence } => println!(
            "  ? {} -> {} only {:.0}% confident",
            transaction_id,
            account_code,
            confidence * 100.0
        ),
        TransactionOutcome::Failed { transaction_id, reason } => {
            println!("  ✗ {} failed: {}", transaction_id, reason)
        }
    }
}

fn review(engine: &LedgerEngine) -> Result<()> {
    let queue = engine.matcher()?.review_queue()?;
    println!("📋 {} pending bank transactions", queue.len());
    for item in queue {
        let tx = &item.transaction;
        println!(
            "  {} {} {:>14} {:<40} {:?}",
            tx.id, tx.transaction_date, tx.amount, tx.description, item.classification
        );
    }
    Ok(())
}

fn audit(engine: &LedgerEngine, json: bool, checkpoint_path: Option<&Path>) -> Result<()> {
    let auditor = engine.auditor()?;

    let checkpoint = match checkpoint_path {
        Some(path) if path.exists() => {
            let saved = fs::read_to_string(path).with_context(|| format!("Failed to read checkpoint {:?}", path))?;
            info!(path = ?path, "resuming audit");
            serde_json::from_str::<AuditCheckpoint>(&saved).context("Failed to parse audit checkpoint")?
        }
        _ => auditor.checkpoint()?,
    };

    let report = match checkpoint_path {
        Some(path) => {
            let report = auditor.resume_with(checkpoint, |progress| {
                fs::write(path, serde_json::to_string(progress)?)?;
                Ok(())
            })?;
            fs::remove_file(path).with_context(|| format!("Failed to remove checkpoint {:?}", path))?;
            report
        }
        None => auditor.resume(checkpoint)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for finding in &report.findings {
        println!("[{:?}] {:?}: {}", finding.severity, finding.kind, finding.message);
    }
    println!("{}", report.summary());
    Ok(())
}

fn remediate(engine: &LedgerEngine, mode: RunMode, actor: &str) -> Result<()> {
    let audit = engine.auditor()?.run()?;
    let planner = engine.remediation()?;
    let plan = planner.plan(&audit);
    let report = planner.apply(plan, mode, actor)?;

    for result in &report.results {
        match &result.status {
            ActionStatus::Applied { event_id } => println!("  ✓ {:?} (event {})", result.action, event_id),
            ActionStatus::WouldApply => println!("  · {:?}", result.action),
            ActionStatus::Skipped { reason } => println!("  - {:?}: {}", result.action, reason),
            ActionStatus::ManualReview => println!("  ? {:?}", result.action),
        }
    }
    println!("{}", report.summary());
    if !mode.is_apply() {
        println!("Dry run: nothing was written. Re-run with --apply.");
    }
    Ok(())
}
