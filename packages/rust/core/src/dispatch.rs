//! Bounded-concurrency dispatcher and durable job ledger.
//!
//! The dispatcher binds the concurrency limit, fans exactly one worker out
//! per work unit behind a semaphore, and collects completions in whatever
//! order they arrive — units are embarrassingly parallel and no ordering is
//! guaranteed or needed. Each completion is appended to the job ledger and
//! recorded into its group's accounting before the next is awaited.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use codevec_shared::{
    CodevecError, ExitClass, LEDGER_FILE_NAME, LedgerEntry, PipelineConfig, Result, RunId,
    WorkUnit,
};
use codevec_vocab::VocabSource;
use codevec_worker::{UnitReport, WorkerContext, run_unit};

use crate::accounting::{GroupAccounting, GroupLog};
use crate::pipeline::ProgressReporter;

/// Upper clamp on derived or requested concurrency.
const MAX_JOBS: usize = 32;

// ---------------------------------------------------------------------------
// Concurrency binding
// ---------------------------------------------------------------------------

/// Bind the worker pool size: explicit override wins, otherwise ~60% of the
/// detected core count, clamped to a sane range either way.
pub fn derive_jobs(explicit: Option<usize>) -> usize {
    match explicit {
        Some(jobs) => jobs.clamp(1, MAX_JOBS),
        None => {
            let cores = detected_cores();
            (cores * 3 / 5).clamp(1, MAX_JOBS)
        }
    }
}

/// Per-worker compute budget (cores ÷ concurrency) exported to inference
/// subprocesses so they cannot oversubscribe the host.
pub fn compute_budget(jobs: usize) -> usize {
    (detected_cores() / jobs.max(1)).max(1)
}

fn detected_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// ---------------------------------------------------------------------------
// Job ledger
// ---------------------------------------------------------------------------

/// Append-only JSONL audit ledger: one line per unit.
pub struct Ledger {
    file: std::fs::File,
}

impl Ledger {
    pub fn open(output_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(output_root).map_err(|e| CodevecError::io(output_root, e))?;
        let path = output_root.join(LEDGER_FILE_NAME);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CodevecError::io(&path, e))?;
        Ok(Self { file })
    }

    pub fn append(&mut self, entry: &LedgerEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)
            .map_err(|e| CodevecError::Failure(format!("ledger serialization: {e}")))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|()| self.file.flush())
            .map_err(|e| CodevecError::Failure(format!("ledger append: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Fan the unit list out to the bounded worker pool and collect every
/// report. Worker failures are already classified inside the reports; only
/// infrastructure errors (ledger I/O, task panics) surface here.
#[instrument(skip_all, fields(units = units.len()))]
pub async fn dispatch(
    config: Arc<PipelineConfig>,
    vocab: VocabSource,
    units: Vec<WorkUnit>,
    run_id: RunId,
    progress: &dyn ProgressReporter,
) -> Result<Vec<UnitReport>> {
    let jobs = derive_jobs(config.jobs);
    let threads = compute_budget(jobs);
    let total = units.len();
    info!(jobs, threads_per_worker = threads, total, "dispatching workers");

    let mut ledger = Ledger::open(&config.output_root)?;
    let semaphore = Arc::new(Semaphore::new(jobs));
    let mut tasks = JoinSet::new();

    for unit in units {
        let ctx = WorkerContext {
            config: config.clone(),
            vocab: vocab.clone(),
            compute_threads: threads,
        };
        let sem = semaphore.clone();
        tasks.spawn(async move {
            let _permit = sem.acquire().await.expect("semaphore closed");
            run_unit(&ctx, &unit).await
        });
    }

    let mut accounting: HashMap<String, GroupAccounting> = HashMap::new();
    let mut logs: HashMap<String, GroupLog> = HashMap::new();
    let mut reports = Vec::with_capacity(total);

    while let Some(joined) = tasks.join_next().await {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                // A panicking worker must not abort the batch.
                warn!(error = %e, "worker task failed");
                continue;
            }
        };

        record_report(&config, &report, &mut accounting, &mut logs)?;
        ledger.append(&ledger_entry(&run_id, &report))?;

        reports.push(report);
        progress.unit_done(reports.last().expect("just pushed"), reports.len(), total);
    }

    for acct in accounting.values_mut() {
        acct.finalize()?;
    }

    Ok(reports)
}

/// Write one report's file outcomes into its group's accounting and
/// narrative log.
fn record_report(
    config: &PipelineConfig,
    report: &UnitReport,
    accounting: &mut HashMap<String, GroupAccounting>,
    logs: &mut HashMap<String, GroupLog>,
) -> Result<()> {
    let acct = match accounting.entry(report.group.clone()) {
        std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
        std::collections::hash_map::Entry::Vacant(e) => {
            e.insert(GroupAccounting::open(&config.output_root, &report.group)?)
        }
    };
    let log = match logs.entry(report.group.clone()) {
        std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
        std::collections::hash_map::Entry::Vacant(e) => {
            e.insert(GroupLog::open(&config.output_root, &report.group)?)
        }
    };

    for file in &report.files {
        if let Some(value) = file.contexts {
            acct.record(&file.name, value)?;
        }
        match file.class {
            ExitClass::Done => log.line(&format!(
                "[ok] {}: {} contexts",
                file.name,
                match file.contexts {
                    Some(codevec_shared::ContextCount::Count(n)) => n,
                    _ => 0,
                }
            )),
            ExitClass::Skipped => log.line(&format!("[skip] {}: final artifact present", file.name)),
            class => log.line(&format!(
                "[fail] {}: {class}: {}",
                file.name,
                file.detail.as_deref().unwrap_or("unknown")
            )),
        }
    }
    Ok(())
}

fn ledger_entry(run_id: &RunId, report: &UnitReport) -> LedgerEntry {
    LedgerEntry {
        run_id: run_id.clone(),
        group: report.group.clone(),
        unit: report.unit.clone(),
        started_at: report.started_at,
        ended_at: report.ended_at,
        retries: report.retries,
        class: report.class,
        contexts: report.contexts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_is_clamped() {
        assert_eq!(derive_jobs(Some(4)), 4);
        assert_eq!(derive_jobs(Some(0)), 1);
        assert_eq!(derive_jobs(Some(10_000)), MAX_JOBS);
    }

    #[test]
    fn derived_jobs_stay_in_range() {
        let jobs = derive_jobs(None);
        assert!((1..=MAX_JOBS).contains(&jobs));
    }

    #[test]
    fn compute_budget_never_zero() {
        assert!(compute_budget(1) >= 1);
        assert_eq!(compute_budget(10_000), 1);
    }
}
