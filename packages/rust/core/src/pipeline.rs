//! End-to-end batch pipeline: validate → discover → acquire vocabulary →
//! dispatch workers → aggregate.
//!
//! Only configuration errors abort a run. Unit failures are classified
//! inside the reports, and the vocabulary segment degrades transparently to
//! direct table reads when it cannot be established.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument, warn};

use codevec_discovery::DiscoveryOptions;
use codevec_shared::{CodevecError, PipelineConfig, Result, RunId};
use codevec_vocab::{SegmentRegistry, VocabSource};
use codevec_worker::UnitReport;

use crate::aggregate::{self, RunStats};
use crate::dispatch::{self, derive_jobs};

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called as each unit reaches a terminal state.
    fn unit_done(&self, report: &UnitReport, current: usize, total: usize);
    /// Called when the pipeline completes.
    fn done(&self, outcome: &RunOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn unit_done(&self, _report: &UnitReport, _current: usize, _total: usize) {}
    fn done(&self, _outcome: &RunOutcome) {}
}

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

/// Result of one full pipeline run.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: RunId,
    /// Bound concurrency limit.
    pub jobs: usize,
    /// Whether workers fell back to direct vocabulary reads.
    pub degraded: bool,
    pub stats: RunStats,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the full batch pipeline.
///
/// 1. Validate references (fatal on missing root/tables/model)
/// 2. Discover work units
/// 3. Acquire the shared vocabulary segment (or degrade)
/// 4. Dispatch the bounded worker pool
/// 5. Aggregate ledger + accounting into durable artifacts
#[instrument(skip_all, fields(root = %config.root.display()))]
pub async fn run_pipeline(
    config: PipelineConfig,
    progress: &dyn ProgressReporter,
) -> Result<RunOutcome> {
    let start = Instant::now();
    let run_id = RunId::new();
    info!(%run_id, root = %config.root.display(), "starting pipeline run");

    // --- Phase 1: Validation ---
    progress.phase("Validating configuration");
    config.validate_references()?;

    // --- Phase 2: Discovery ---
    progress.phase("Discovering work units");
    let units = codevec_discovery::discover(
        &config.root,
        &DiscoveryOptions {
            granularity: config.granularity,
            source_ext: config.source_ext.clone(),
        },
    )?;

    // --- Phase 3: Vocabulary segment ---
    progress.phase("Acquiring vocabulary segment");
    let registry = SegmentRegistry::new(&config.segment_state_dir);
    let acquired = registry
        .acquire(
            &config.dataset,
            &config.histograms,
            (
                config.word_vocab_size,
                config.path_vocab_size,
                config.target_vocab_size,
            ),
            config.poll_attempts,
            config.poll_interval,
        )
        .await;

    // The guard releases on every exit path below: Borrowers detach, the
    // Owner tears the segment down once no borrowers remain.
    let (vocab, _segment_guard, degraded) = match acquired {
        Ok(handle) => {
            info!(role = ?handle.role(), "vocabulary segment attached");
            (handle.vocab_source(), Some(handle), false)
        }
        Err(e) => {
            warn!(error = %e, "segment unavailable, falling back to direct table reads");
            (VocabSource::Direct, None, true)
        }
    };

    // --- Phase 4: Dispatch ---
    progress.phase("Dispatching workers");
    let jobs = derive_jobs(config.jobs);
    let config = Arc::new(config);
    let reports = tokio::select! {
        reports = dispatch::dispatch(
            config.clone(),
            vocab,
            units,
            run_id.clone(),
            progress,
        ) => reports?,
        _ = tokio::signal::ctrl_c() => {
            // Dropping the dispatch future runs the accounting guards; the
            // segment guard releases on return. In-flight subprocesses may
            // outlive us briefly.
            warn!("interrupt received, finalizing accounting");
            return Err(CodevecError::Failure("interrupted".into()));
        }
    };

    // --- Phase 5: Aggregation ---
    progress.phase("Aggregating results");
    let stats = aggregate::finalize(&config.output_root, &reports, start.elapsed())?;

    let outcome = RunOutcome {
        run_id,
        jobs,
        degraded,
        stats,
    };
    progress.done(&outcome);

    info!(
        run_id = %outcome.run_id,
        jobs = outcome.jobs,
        degraded = outcome.degraded,
        done = outcome.stats.done,
        skipped = outcome.stats.skipped,
        errors = outcome.stats.errors,
        elapsed_ms = outcome.stats.elapsed.as_millis(),
        "pipeline run complete"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    use codevec_shared::{AppConfig, HistogramPaths, LEDGER_FILE_NAME, LedgerEntry};

    /// `sh -c <script> stage` — "stage" consumes `$0` so stage-appended
    /// arguments land in `$1..`.
    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into(), "stage".into()]
    }

    const PREPROCESS_CP: &str = r#"while [ "$#" -gt 0 ]; do case "$1" in --test_data) src="$2";; --output_name) stem="$2";; esac; shift; done; cp "$src" "$stem.test.c2v""#;
    const INFER_OK: &str = r#"while [ "$#" -gt 0 ]; do case "$1" in --test) t="$2";; esac; shift; done; printf "0.1 0.2 0.3\n" > "$t.vectors""#;

    struct Fixture {
        root: PathBuf,
    }

    impl Fixture {
        /// A full runnable environment: corpus, reference tables, model,
        /// segment registry, and fake stage subprocesses.
        fn new() -> Self {
            let root = std::env::temp_dir().join(format!("codevec-pipe-{}", uuid::Uuid::now_v7()));
            let data = root.join("data");
            fs::create_dir_all(&data).unwrap();

            let histograms = HistogramPaths::derive(&data, "testset");
            fs::write(&histograms.word, "get 9\nset 5\n").unwrap();
            fs::write(&histograms.path, "p1 7\n").unwrap();
            fs::write(&histograms.target, "main 4\n").unwrap();
            fs::write(data.join("model.release"), b"weights").unwrap();

            Self { root }
        }

        fn corpus(&self, files: &[(&str, &str)]) -> PathBuf {
            let corpus = self.root.join("corpus");
            for (rel, content) in files {
                let path = corpus.join(rel);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, content).unwrap();
            }
            corpus
        }

        fn config(&self, corpus: PathBuf) -> PipelineConfig {
            let app = AppConfig::default();
            let mut config = PipelineConfig::from_app(&app, corpus).unwrap();
            config.output_root = self.root.join("out");
            config.dataset = "testset".into();
            config.histograms = HistogramPaths::derive(&self.root.join("data"), "testset");
            config.model_path = self.root.join("data/model.release");
            config.segment_state_dir = self.root.join("segments");
            config.poll_attempts = 1;
            config.poll_interval = std::time::Duration::from_millis(10);
            config.jobs = Some(2);
            config.extract.command = sh(r#"cat "$2""#);
            config.preprocess.command = sh(PREPROCESS_CP);
            config.preprocess.backoff_ms = 10;
            config.inference.command = sh(INFER_OK);
            config
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[tokio::test]
    async fn mixed_group_reports_one_success_two_errors() {
        let fx = Fixture::new();
        let corpus = fx.corpus(&[
            ("g1/unit_a.js", "render a,p,b\n"),
            ("g1/unit_b.js", "[WARN] noise only\n"),
            ("g1/unit_c.js", "render a,p,b c,q,d\n"),
        ]);
        let mut config = fx.config(corpus);
        config.extract.command = sh(r#"case "$2" in *unit_a*) exit 1;; *) cat "$2";; esac"#);

        let outcome = run_pipeline(config, &SilentProgress).await.expect("run");
        assert_eq!(outcome.stats.done, 1);
        assert_eq!(outcome.stats.errors, 2);
        assert!(!outcome.degraded);

        // Exactly one final artifact.
        let vectors: Vec<_> = fs::read_dir(fx.root.join("out/g1/vectors"))
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(vectors.len(), 1);

        // One ledger line per unit (grouped: the project is the unit).
        let ledger = fs::read_to_string(fx.root.join("out").join(LEDGER_FILE_NAME)).unwrap();
        let entries: Vec<LedgerEntry> = ledger
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].class.is_error());

        // Accounting distinguishes counts from error markers.
        let accounting =
            fs::read_to_string(fx.root.join("out/g1/c2v/context_count.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&accounting).unwrap();
        assert_eq!(parsed["unit_a"], "error");
        assert_eq!(parsed["unit_b"], "error");
        assert_eq!(parsed["unit_c"], 2);

        // The narrative log names every failing file with its tag.
        let log = fs::read_to_string(fx.root.join("out/g1/process.log")).unwrap();
        assert!(log.contains("unit_a: extract_failed"));
        assert!(log.contains("unit_b: validate_failed"));
        assert!(log.contains("summary: 1 processed, 0 skipped, 2 errored"));
    }

    #[tokio::test]
    async fn second_run_skips_everything_without_subprocesses() {
        let fx = Fixture::new();
        let corpus = fx.corpus(&[("g1/unit_x.js", "render a,p,b\n")]);

        let first = run_pipeline(fx.config(corpus.clone()), &SilentProgress)
            .await
            .expect("first run");
        assert_eq!(first.stats.done, 1);

        // Any stage running on the second pass would trip the sentinel.
        let sentinel = fx.root.join("stage-ran");
        let mut config = fx.config(corpus);
        config.extract.command = sh(&format!("touch {}; exit 1", sentinel.display()));

        let second = run_pipeline(config, &SilentProgress).await.expect("second run");
        assert_eq!(second.stats.skipped, 1);
        assert_eq!(second.stats.done, 0);
        assert_eq!(second.stats.errors, 0);
        assert!(!sentinel.exists());
    }

    #[tokio::test]
    async fn segment_failure_degrades_transparently() {
        let fx = Fixture::new();
        let corpus = fx.corpus(&[("g1/unit_d.js", "render a,p,b\n")]);
        let config = fx.config(corpus);

        // A foreign claim that never publishes forces the poll to expire.
        let slot = config.segment_state_dir.join("testset");
        fs::create_dir_all(&slot).unwrap();
        fs::write(slot.join("starting.lock"), b"0").unwrap();

        let outcome = run_pipeline(config, &SilentProgress).await.expect("run");
        assert!(outcome.degraded);
        assert_eq!(outcome.stats.done, 1);
    }

    #[tokio::test]
    async fn missing_model_aborts_before_any_work() {
        let fx = Fixture::new();
        let corpus = fx.corpus(&[("g1/unit_e.js", "render a,p,b\n")]);
        let mut config = fx.config(corpus);
        config.model_path = fx.root.join("data/absent-model.release");

        let err = run_pipeline(config, &SilentProgress).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!fx.root.join("out").exists(), "no unit work may start");
    }
}
