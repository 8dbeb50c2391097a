//! Per-unit pipeline state machine.
//!
//! One machine handles both granularities: a unit carries an ordered source
//! list (a single file in flat mode, a project's files in grouped mode) and
//! every source is driven through the same
//! `Start → Extracted → Validated → Preprocessed → Vectorized → Done`
//! progression. Unit-scoped failures never escape: the worker classifies
//! them into the report and always completes normally from the dispatcher's
//! point of view.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use codevec_shared::{
    CodevecError, ContextCount, ExitClass, PipelineConfig, Result, UnitPaths, WorkUnit,
};
use codevec_vocab::VocabSource;

use crate::stages::{self, FilterStats};

// ---------------------------------------------------------------------------
// Context & reports
// ---------------------------------------------------------------------------

/// The fixed bundle the dispatcher hands to every worker.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub config: Arc<PipelineConfig>,
    /// Vocabulary handoff for the normalization stage.
    pub vocab: VocabSource,
    /// Compute budget exported to inference subprocesses.
    pub compute_threads: usize,
}

/// Terminal outcome of one source file.
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub name: String,
    pub class: ExitClass,
    /// Accounting value; `None` for skipped files whose count is unknown
    /// to this run.
    pub contexts: Option<ContextCount>,
    /// Normalization retries consumed.
    pub retries: u32,
    /// Human-readable failure detail for the narrative log.
    pub detail: Option<String>,
}

/// Completed unit report handed back to the dispatcher. Workers always
/// produce one; failures live inside, never in a `Result`.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub group: String,
    pub unit: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub files: Vec<FileOutcome>,
    /// Worst classification across the unit's files.
    pub class: ExitClass,
    pub retries: u32,
    /// Total context count across successful files.
    pub contexts: u64,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Stage progression for a single file.
enum FileState {
    Start,
    Extracted,
    Validated(FilterStats),
    Preprocessed { stats: FilterStats, retries: u32 },
    Vectorized { stats: FilterStats, retries: u32 },
}

/// Drive every source of `unit` through the pipeline.
#[instrument(skip_all, fields(group = %unit.group, unit = %unit.name))]
pub async fn run_unit(ctx: &WorkerContext, unit: &WorkUnit) -> UnitReport {
    let started_at = Utc::now();
    let mut files = Vec::with_capacity(unit.sources.len());

    for source in &unit.sources {
        let outcome = process_file(ctx, &unit.group, source).await;
        match outcome.class {
            ExitClass::Done => debug!(file = %outcome.name, "file complete"),
            ExitClass::Skipped => debug!(file = %outcome.name, "file skipped"),
            class => warn!(
                file = %outcome.name,
                class = %class,
                detail = outcome.detail.as_deref().unwrap_or(""),
                "file failed"
            ),
        }
        files.push(outcome);
    }

    let class = worst_class(&files);
    let retries = files.iter().map(|f| f.retries).sum();
    let contexts = files
        .iter()
        .filter_map(|f| match f.contexts {
            Some(ContextCount::Count(n)) => Some(n),
            _ => None,
        })
        .sum();

    let report = UnitReport {
        group: unit.group.clone(),
        unit: unit.name.clone(),
        started_at,
        ended_at: Utc::now(),
        files,
        class,
        retries,
        contexts,
    };
    info!(class = %report.class, contexts = report.contexts, "unit complete");
    report
}

/// Drive one source file to a terminal state. Never returns an error:
/// unit-scoped failures become a classified outcome.
async fn process_file(ctx: &WorkerContext, group: &str, source: &Path) -> FileOutcome {
    let name = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unit".into());
    let paths = UnitPaths::derive(&ctx.config.output_root, group, &name);

    match advance_to_done(ctx, source, &paths).await {
        Ok(Terminal::Skipped) => FileOutcome {
            name,
            class: ExitClass::Skipped,
            contexts: None,
            retries: 0,
            detail: None,
        },
        Ok(Terminal::Done { stats, retries }) => {
            remove_intermediates(&paths, true);
            FileOutcome {
                name,
                class: ExitClass::Done,
                contexts: Some(ContextCount::Count(stats.contexts)),
                retries,
                detail: None,
            }
        }
        Err(err) => {
            let class = classify(&err);
            // Validation failures keep the raw output for diagnosis;
            // every other terminal failure clears the file's intermediates.
            remove_intermediates(&paths, class != ExitClass::ValidateFailed);
            let retries = if class == ExitClass::PreprocessFailed {
                ctx.config.preprocess.retries
            } else {
                0
            };
            FileOutcome {
                name,
                class,
                contexts: Some(ContextCount::Error),
                retries,
                detail: Some(err.to_string()),
            }
        }
    }
}

enum Terminal {
    Skipped,
    Done { stats: FilterStats, retries: u32 },
}

/// The transition table. Each arm performs one stage and yields the next
/// state; errors surface to `process_file` for classification.
async fn advance_to_done(
    ctx: &WorkerContext,
    source: &Path,
    paths: &UnitPaths,
) -> Result<Terminal> {
    let config = &ctx.config;
    let mut state = FileState::Start;

    loop {
        state = match state {
            FileState::Start => {
                // Completion is defined solely by the final artifact.
                if paths.final_artifact.is_file() {
                    return Ok(Terminal::Skipped);
                }
                ensure_dir(&paths.c2v_dir)?;
                ensure_dir(&paths.vectors_dir)?;
                stages::extract(config, source, &paths.raw).await?;
                FileState::Extracted
            }
            FileState::Extracted => {
                let stats = stages::filter(&paths.raw, &paths.filtered).await?;
                FileState::Validated(stats)
            }
            FileState::Validated(stats) => {
                let retries = stages::preprocess(
                    config,
                    &ctx.vocab,
                    &paths.filtered,
                    &paths.stem,
                    &paths.normalized,
                )
                .await?;
                FileState::Preprocessed { stats, retries }
            }
            FileState::Preprocessed { stats, retries } => {
                stages::vectorize(config, ctx.compute_threads, &paths.normalized, &paths.inferred)
                    .await?;
                FileState::Vectorized { stats, retries }
            }
            FileState::Vectorized { stats, retries } => {
                // Atomic relocation publishes completion.
                std::fs::rename(&paths.inferred, &paths.final_artifact)
                    .map_err(|e| CodevecError::io(&paths.final_artifact, e))?;
                return Ok(Terminal::Done { stats, retries });
            }
        };
    }
}

/// Map a stage error to its terminal classification.
fn classify(err: &CodevecError) -> ExitClass {
    match err {
        CodevecError::Extraction(_) => ExitClass::ExtractFailed,
        CodevecError::Validation { .. } => ExitClass::ValidateFailed,
        CodevecError::Preprocess(_) => ExitClass::PreprocessFailed,
        CodevecError::Timeout { .. } => ExitClass::Timeout,
        CodevecError::Killed { .. } => ExitClass::Killed,
        _ => ExitClass::Failed,
    }
}

fn worst_class(files: &[FileOutcome]) -> ExitClass {
    let mut worst = ExitClass::Skipped;
    for file in files {
        if file.class.is_error() {
            return file.class;
        }
        if file.class == ExitClass::Done {
            worst = ExitClass::Done;
        }
    }
    worst
}

fn remove_intermediates(paths: &UnitPaths, include_raw: bool) {
    for path in paths.intermediates() {
        if !include_raw && path == paths.raw.as_path() {
            continue;
        }
        let _ = std::fs::remove_file(path);
    }
}

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| CodevecError::io(dir, e))
}
