//! Result aggregation: consolidated accounting and run summaries.
//!
//! Runs after dispatch completes. Everything here works from durable state
//! (the per-group accounting documents) plus the in-memory reports, so an
//! interrupted run can be aggregated again by simply re-running.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, instrument};

use codevec_shared::{
    ACCOUNTING_FILE_NAME, CodevecError, ContextCount, ExitClass, Result,
};
use codevec_worker::UnitReport;

use crate::accounting::GroupLog;

/// Combined accounting document at the output root.
pub const COMBINED_ACCOUNTING_FILE: &str = "all_context_count.json";

/// Human-readable run summary at the output root.
pub const RUN_SUMMARY_FILE: &str = "run_summary.txt";

// ---------------------------------------------------------------------------
// RunStats
// ---------------------------------------------------------------------------

/// Per-run tallies across every file of every unit.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub groups: usize,
    pub units: usize,
    pub files: usize,
    pub done: usize,
    pub skipped: usize,
    pub errors: usize,
    pub contexts: u64,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Finalization
// ---------------------------------------------------------------------------

/// Consolidate a completed dispatch: per-group summaries into each
/// narrative log, the combined accounting document, and the run summary.
#[instrument(skip_all, fields(reports = reports.len()))]
pub fn finalize(output_root: &Path, reports: &[UnitReport], elapsed: Duration) -> Result<RunStats> {
    let stats = collect_stats(reports, elapsed);

    write_group_summaries(output_root, reports)?;
    let combined = write_combined_accounting(output_root)?;
    write_run_summary(output_root, &stats)?;

    info!(
        groups = stats.groups,
        files = stats.files,
        done = stats.done,
        skipped = stats.skipped,
        errors = stats.errors,
        combined = %combined.display(),
        "aggregation complete"
    );
    Ok(stats)
}

/// Tally the reports' file outcomes.
pub fn collect_stats(reports: &[UnitReport], elapsed: Duration) -> RunStats {
    let mut stats = RunStats {
        units: reports.len(),
        elapsed,
        ..Default::default()
    };

    let mut groups = std::collections::BTreeSet::new();
    for report in reports {
        groups.insert(report.group.as_str());
        stats.contexts += report.contexts;
        for file in &report.files {
            stats.files += 1;
            match file.class {
                ExitClass::Done => stats.done += 1,
                ExitClass::Skipped => stats.skipped += 1,
                _ => stats.errors += 1,
            }
        }
    }
    stats.groups = groups.len();
    stats
}

/// Append each group's processed / skipped / errored tallies, naming every
/// failing file with its classification tag.
fn write_group_summaries(output_root: &Path, reports: &[UnitReport]) -> Result<()> {
    let mut per_group: BTreeMap<&str, (usize, usize, usize)> = BTreeMap::new();
    for report in reports {
        let entry = per_group.entry(&report.group).or_default();
        for file in &report.files {
            match file.class {
                ExitClass::Done => entry.0 += 1,
                ExitClass::Skipped => entry.1 += 1,
                _ => entry.2 += 1,
            }
        }
    }

    for (group, (done, skipped, errors)) in per_group {
        let log = GroupLog::open(output_root, group)?;
        log.line(&format!(
            "summary: {done} processed, {skipped} skipped, {errors} errored"
        ));
    }
    Ok(())
}

/// Merge every group's accounting document into `all_context_count.json`.
/// Reads from durable state so counts recorded by earlier, interrupted runs
/// are consolidated too.
pub fn write_combined_accounting(output_root: &Path) -> Result<PathBuf> {
    let mut combined: BTreeMap<String, ContextCount> = BTreeMap::new();

    let mut group_dirs: Vec<_> = std::fs::read_dir(output_root)
        .map_err(|e| CodevecError::io(output_root, e))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    group_dirs.sort();

    for group_dir in group_dirs {
        let path = group_dir.join("c2v").join(ACCOUNTING_FILE_NAME);
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        if let Ok(entries) = serde_json::from_str::<BTreeMap<String, ContextCount>>(&content) {
            combined.extend(entries);
        }
    }

    let out = output_root.join(COMBINED_ACCOUNTING_FILE);
    let json = serde_json::to_vec_pretty(&combined)
        .map_err(|e| CodevecError::Failure(format!("combined accounting: {e}")))?;
    let tmp = output_root.join(format!(".tmp-{}", uuid::Uuid::now_v7()));
    std::fs::write(&tmp, &json).map_err(|e| CodevecError::io(&tmp, e))?;
    std::fs::rename(&tmp, &out).map_err(|e| CodevecError::io(&out, e))?;
    Ok(out)
}

fn write_run_summary(output_root: &Path, stats: &RunStats) -> Result<()> {
    let path = output_root.join(RUN_SUMMARY_FILE);
    let content = format!(
        "Total groups: {}\n\
         Total units: {}\n\
         Total files: {}\n\
         Success: {}\n\
         Skipped: {}\n\
         Errors: {}\n\
         Total contexts: {}\n\
         Processing time: {:.1}s\n",
        stats.groups,
        stats.units,
        stats.files,
        stats.done,
        stats.skipped,
        stats.errors,
        stats.contexts,
        stats.elapsed.as_secs_f64(),
    );
    std::fs::write(&path, content).map_err(|e| CodevecError::io(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use codevec_worker::FileOutcome;
    use std::fs;

    fn report(group: &str, unit: &str, classes: &[(&str, ExitClass, u64)]) -> UnitReport {
        let files: Vec<FileOutcome> = classes
            .iter()
            .map(|(name, class, contexts)| FileOutcome {
                name: name.to_string(),
                class: *class,
                contexts: match class {
                    ExitClass::Done => Some(ContextCount::Count(*contexts)),
                    ExitClass::Skipped => None,
                    _ => Some(ContextCount::Error),
                },
                retries: 0,
                detail: class.is_error().then(|| "boom".into()),
            })
            .collect();
        let contexts = classes
            .iter()
            .filter(|(_, c, _)| *c == ExitClass::Done)
            .map(|(_, _, n)| n)
            .sum();
        UnitReport {
            group: group.into(),
            unit: unit.into(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            class: if files.iter().any(|f| f.class.is_error()) {
                ExitClass::Failed
            } else {
                ExitClass::Done
            },
            retries: 0,
            contexts,
            files,
        }
    }

    #[test]
    fn stats_tally_file_outcomes() {
        let reports = vec![
            report(
                "g1",
                "g1",
                &[
                    ("a", ExitClass::Done, 10),
                    ("b", ExitClass::ExtractFailed, 0),
                ],
            ),
            report("g2", "g2", &[("c", ExitClass::Skipped, 0)]),
        ];
        let stats = collect_stats(&reports, Duration::from_secs(3));
        assert_eq!(stats.groups, 2);
        assert_eq!(stats.units, 2);
        assert_eq!(stats.files, 3);
        assert_eq!(stats.done, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.contexts, 10);
    }

    #[test]
    fn finalize_writes_all_artifacts() {
        let root = std::env::temp_dir().join(format!("codevec-agg-{}", uuid::Uuid::now_v7()));
        fs::create_dir_all(&root).unwrap();

        // Durable per-group accounting, as the dispatcher would leave it.
        for (group, body) in [
            ("g1", r#"{"a": 10, "b": "error"}"#),
            ("g2", r#"{"c": 5}"#),
        ] {
            let dir = root.join(group).join("c2v");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(ACCOUNTING_FILE_NAME), body).unwrap();
        }

        let reports = vec![
            report(
                "g1",
                "g1",
                &[("a", ExitClass::Done, 10), ("b", ExitClass::ValidateFailed, 0)],
            ),
            report("g2", "g2", &[("c", ExitClass::Done, 5)]),
        ];

        let stats = finalize(&root, &reports, Duration::from_secs(1)).expect("finalize");
        assert_eq!(stats.errors, 1);

        let combined: BTreeMap<String, ContextCount> = serde_json::from_str(
            &fs::read_to_string(root.join(COMBINED_ACCOUNTING_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(combined.len(), 3);
        assert_eq!(combined.get("b"), Some(&ContextCount::Error));

        let summary = fs::read_to_string(root.join(RUN_SUMMARY_FILE)).unwrap();
        assert!(summary.contains("Success: 2"));
        assert!(summary.contains("Errors: 1"));

        let g1_log = fs::read_to_string(root.join("g1/process.log")).unwrap();
        assert!(g1_log.contains("1 processed, 0 skipped, 1 errored"));

        let _ = fs::remove_dir_all(&root);
    }
}
