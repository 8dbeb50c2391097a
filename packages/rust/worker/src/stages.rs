//! The four pipeline stages a file passes through.
//!
//! Extraction, normalization, and inference are external subprocesses; only
//! their invocation contracts live here. The structural filter is the one
//! stage computed in-process. Each stage blocks on its subprocess until it
//! exits or its wall-clock budget forces termination.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use codevec_shared::{CodevecError, PipelineConfig, Result};
use codevec_vocab::{SEGMENT_NAME_ENV, SEGMENT_PATH_ENV, SEGMENT_SIZE_ENV, VocabSource};

/// Structural line predicate: a record starts with a label of letters and
/// `|` separators followed by whitespace.
fn record_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z|]+\s").expect("static pattern"))
}

/// Survivor statistics from the structural filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterStats {
    /// Record lines that survived the filter.
    pub lines: u64,
    /// Total context fields across surviving lines.
    pub contexts: u64,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Run the extraction subprocess for one source file, capturing stdout to
/// `raw_out`. Non-zero exit, timeout, or empty output all fail the stage and
/// remove the partial output.
#[instrument(skip_all, fields(source = %source.display()))]
pub async fn extract(config: &PipelineConfig, source: &Path, raw_out: &Path) -> Result<()> {
    let out_file = std::fs::File::create(raw_out).map_err(|e| CodevecError::io(raw_out, e))?;

    let mut cmd = build_command(&config.extract.command)?;
    cmd.arg("--file")
        .arg(source)
        .arg("--whole_file")
        .arg("--max_path_length")
        .arg(config.extract.max_path_length.to_string())
        .arg("--max_path_width")
        .arg(config.extract.max_path_width.to_string())
        .stdout(Stdio::from(out_file))
        .stderr(Stdio::null());

    let budget = Duration::from_secs(config.extract.timeout_secs);
    let mut child = cmd
        .spawn()
        .map_err(|e| CodevecError::Extraction(format!("failed to spawn extractor: {e}")))?;

    let waited = tokio::time::timeout(budget, child.wait()).await;
    let status = match waited {
        Ok(status) => status.map_err(|e| CodevecError::Extraction(format!("wait: {e}")))?,
        Err(_) => {
            let _ = child.kill().await;
            let _ = tokio::fs::remove_file(raw_out).await;
            return Err(CodevecError::Extraction(format!(
                "timed out after {}s",
                config.extract.timeout_secs
            )));
        }
    };

    if !status.success() {
        let _ = tokio::fs::remove_file(raw_out).await;
        return Err(CodevecError::Extraction(format!("extractor exited {status}")));
    }

    let size = tokio::fs::metadata(raw_out)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    if size == 0 {
        let _ = tokio::fs::remove_file(raw_out).await;
        return Err(CodevecError::Extraction("extractor produced no output".into()));
    }

    debug!(bytes = size, "extraction complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Structural filter
// ---------------------------------------------------------------------------

/// Apply the structural filter to the raw extractor output, writing
/// survivors to `filtered_out`. Zero surviving lines is a validation
/// failure; the raw file is retained for diagnosis, the partial filtered
/// file is not.
#[instrument(skip_all, fields(raw = %raw.display()))]
pub async fn filter(raw: &Path, filtered_out: &Path) -> Result<FilterStats> {
    let input = tokio::fs::File::open(raw)
        .await
        .map_err(|e| CodevecError::io(raw, e))?;
    let output = tokio::fs::File::create(filtered_out)
        .await
        .map_err(|e| CodevecError::io(filtered_out, e))?;

    let mut reader = BufReader::new(input).lines();
    let mut writer = BufWriter::new(output);
    let mut stats = FilterStats {
        lines: 0,
        contexts: 0,
    };

    while let Some(line) = reader
        .next_line()
        .await
        .map_err(|e| CodevecError::io(raw, e))?
    {
        if !record_pattern().is_match(&line) {
            continue;
        }
        stats.lines += 1;
        stats.contexts += line.split(' ').skip(1).filter(|f| !f.is_empty()).count() as u64;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| CodevecError::io(filtered_out, e))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| CodevecError::io(filtered_out, e))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| CodevecError::io(filtered_out, e))?;

    if stats.lines == 0 {
        let _ = tokio::fs::remove_file(filtered_out).await;
        return Err(CodevecError::validation("no records survived the filter"));
    }

    debug!(lines = stats.lines, contexts = stats.contexts, "filter complete");
    Ok(stats)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Run the normalization subprocess, retrying up to the configured bound
/// with a short backoff. Returns the number of retries consumed.
#[instrument(skip_all, fields(filtered = %filtered.display()))]
pub async fn preprocess(
    config: &PipelineConfig,
    vocab: &VocabSource,
    filtered: &Path,
    stem: &Path,
    normalized: &Path,
) -> Result<u32> {
    let mut last_err = String::new();

    for attempt in 0..=config.preprocess.retries {
        if attempt > 0 {
            let backoff = Duration::from_millis(config.preprocess.backoff_ms);
            warn!(attempt, error = %last_err, "retrying normalization");
            tokio::time::sleep(backoff).await;
        }

        match run_preprocess_once(config, vocab, filtered, stem).await {
            Ok(()) if normalized.is_file() => {
                check_fixed_width(normalized, config.max_contexts).await;
                return Ok(attempt);
            }
            Ok(()) => {
                last_err = format!("normalizer produced no {}", normalized.display());
            }
            Err(e) => last_err = e,
        }
    }

    Err(CodevecError::Preprocess(format!(
        "exhausted {} retries: {last_err}",
        config.preprocess.retries
    )))
}

/// Whether a normalized record honors the fixed-width contract: one label
/// plus exactly `window_size` context fields, counting the padding.
pub fn fixed_width_ok(line: &str, window_size: usize) -> bool {
    line.split(' ').count() == window_size + 1
}

/// Spot-check the normalizer's fixed-width contract on its first output
/// line. The subprocess stays authoritative — a deviation is surfaced, not
/// failed.
async fn check_fixed_width(normalized: &Path, window_size: usize) {
    let Ok(file) = tokio::fs::File::open(normalized).await else {
        return;
    };
    let mut lines = BufReader::new(file).lines();
    if let Ok(Some(first)) = lines.next_line().await {
        if !fixed_width_ok(&first, window_size) {
            warn!(
                path = %normalized.display(),
                fields = first.split(' ').count(),
                expected = window_size + 1,
                "normalized record violates the fixed-width contract"
            );
        }
    }
}

async fn run_preprocess_once(
    config: &PipelineConfig,
    vocab: &VocabSource,
    filtered: &Path,
    stem: &Path,
) -> std::result::Result<(), String> {
    let mut cmd = build_command(&config.preprocess.command).map_err(|e| e.to_string())?;
    cmd.arg("--test_data")
        .arg(filtered)
        .arg("--max_contexts")
        .arg(config.max_contexts.to_string())
        .arg("--word_vocab_size")
        .arg(config.word_vocab_size.to_string())
        .arg("--path_vocab_size")
        .arg(config.path_vocab_size.to_string())
        .arg("--target_vocab_size")
        .arg(config.target_vocab_size.to_string())
        .arg("--word_histogram")
        .arg(&config.histograms.word)
        .arg("--path_histogram")
        .arg(&config.histograms.path)
        .arg("--target_histogram")
        .arg(&config.histograms.target)
        .arg("--output_name")
        .arg(stem)
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // An attached segment spares the normalizer the raw table reads; the
    // table paths stay on the argv so it can fall back on its own.
    if let VocabSource::Segment {
        name,
        path,
        byte_size,
    } = vocab
    {
        cmd.env(SEGMENT_NAME_ENV, name)
            .env(SEGMENT_PATH_ENV, path)
            .env(SEGMENT_SIZE_ENV, byte_size.to_string());
    }

    let status = cmd
        .status()
        .await
        .map_err(|e| format!("failed to spawn normalizer: {e}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("normalizer exited {status}"))
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

/// Run the inference subprocess under a hard wall-clock timeout with
/// escalating termination: SIGTERM at the deadline, SIGKILL after the grace
/// period. Success requires non-empty output.
#[instrument(skip_all, fields(normalized = %normalized.display()))]
pub async fn vectorize(
    config: &PipelineConfig,
    compute_threads: usize,
    normalized: &Path,
    inferred: &Path,
) -> Result<()> {
    let mut cmd = build_command(&config.inference.command)?;
    cmd.arg("--load")
        .arg(&config.model_path)
        .arg("--test")
        .arg(normalized)
        .arg("--export_code_vectors")
        .env("OMP_NUM_THREADS", compute_threads.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .map_err(|e| CodevecError::Failure(format!("failed to spawn inference: {e}")))?;

    let budget = Duration::from_secs(config.inference.timeout_secs);
    let waited = tokio::time::timeout(budget, child.wait()).await;
    let status = match waited {
        Ok(status) => status.map_err(|e| CodevecError::Failure(format!("wait: {e}")))?,
        Err(_) => {
            return escalate_termination(config, child).await;
        }
    };

    if !status.success() {
        return Err(CodevecError::Failure(format!("inference exited {status}")));
    }

    let size = tokio::fs::metadata(inferred)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    if size == 0 {
        return Err(CodevecError::Failure("inference produced no output".into()));
    }

    debug!(bytes = size, "inference complete");
    Ok(())
}

/// Deadline hit: SIGTERM, wait out the grace period, then SIGKILL.
/// Classifies the outcome as Timeout (honored the signal) or Killed.
async fn escalate_termination(
    config: &PipelineConfig,
    mut child: tokio::process::Child,
) -> Result<()> {
    let secs = config.inference.timeout_secs;
    if let Some(pid) = child.id() {
        warn!(pid, secs, "inference deadline reached, sending SIGTERM");
        send_sigterm(pid);
    }

    let grace = Duration::from_secs(config.inference.grace_secs);
    let waited = tokio::time::timeout(grace, child.wait()).await;
    match waited {
        Ok(_) => Err(CodevecError::timeout("inference", secs)),
        Err(_) => {
            warn!("inference ignored SIGTERM, killing");
            let _ = child.kill().await;
            Err(CodevecError::killed("inference"))
        }
    }
}

fn send_sigterm(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a command from a configured argv prefix.
fn build_command(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CodevecError::config("empty subprocess command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_counts_padding_fields() {
        // 1 label + 2 contexts, window 2: exact fit.
        assert!(fixed_width_ok("lbl a,p,b c,q,d", 2));
        // 1 label + 1 context + 1 pad space, window 2.
        assert!(fixed_width_ok("lbl a,p,b ", 2));
        // Too many contexts for the window.
        assert!(!fixed_width_ok("lbl a,p,b c,q,d e,r,f", 2));
        assert!(!fixed_width_ok("lbl", 2));
    }

    #[test]
    fn record_pattern_matches_labels() {
        let p = record_pattern();
        assert!(p.is_match("render target,path,name other,p,ctx"));
        assert!(p.is_match("get|name ctx,p,tok"));
        assert!(!p.is_match("123bad ctx"));
        assert!(!p.is_match("# comment"));
        assert!(!p.is_match("warning:"));
        assert!(!p.is_match(""));
    }

    #[tokio::test]
    async fn filter_drops_non_records_and_counts_contexts() {
        let dir = std::env::temp_dir().join(format!("codevec-filter-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let raw = dir.join("raw.txt");
        let out = dir.join("filtered.txt");
        std::fs::write(
            &raw,
            "render a,p,b c,q,d\n[WARN] extractor noise\nparse x,r,y\n42 nope\n",
        )
        .unwrap();

        let stats = filter(&raw, &out).await.expect("filter");
        assert_eq!(stats.lines, 2);
        assert_eq!(stats.contexts, 3);

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written, "render a,p,b c,q,d\nparse x,r,y\n");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn filter_with_no_survivors_fails_and_keeps_raw() {
        let dir = std::env::temp_dir().join(format!("codevec-filter-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let raw = dir.join("raw.txt");
        let out = dir.join("filtered.txt");
        std::fs::write(&raw, "[ERROR] nothing parsed\n!!\n").unwrap();

        let err = filter(&raw, &out).await.unwrap_err();
        assert!(matches!(err, CodevecError::Validation { .. }));
        assert!(raw.exists(), "raw output must be retained for diagnosis");
        assert!(!out.exists(), "partial filtered file must be removed");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
