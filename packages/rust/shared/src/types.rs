//! Core domain types for the codevec batch pipeline.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// File name of the per-group accounting document, under the group's
/// intermediate directory.
pub const ACCOUNTING_FILE_NAME: &str = "context_count.json";

/// File name of the per-group narrative log, at the group root.
pub const GROUP_LOG_FILE_NAME: &str = "process.log";

/// File name of the durable job ledger, at the output root.
pub const LEDGER_FILE_NAME: &str = "job_ledger.jsonl";

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one orchestrator invocation (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Granularity
// ---------------------------------------------------------------------------

/// How the discovery phase slices the corpus into work units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One unit per source file directly under the root.
    Flat,
    /// One unit per project subdirectory; the unit carries the project's
    /// ordered file list.
    Grouped,
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "flat" => Ok(Self::Flat),
            "grouped" => Ok(Self::Grouped),
            other => Err(format!("unknown mode {other:?} (expected flat|grouped)")),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkUnit
// ---------------------------------------------------------------------------

/// One schedulable unit of pipeline work.
///
/// Flat discovery yields units with exactly one source; grouped discovery
/// yields one unit per project with the project's full file list. The worker
/// runs the same per-file state machine either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// Group identity (project subdirectory name, or the root's name in
    /// flat mode).
    pub group: String,
    /// Unit identity within the group.
    pub name: String,
    /// Ordered source files this unit covers.
    pub sources: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// UnitPaths
// ---------------------------------------------------------------------------

/// Derived artifact paths for a single source file within a group.
///
/// Layout under the output root `R`:
/// `R/<group>/c2v/` holds intermediates and the accounting document,
/// `R/<group>/vectors/` holds one final artifact per completed file.
#[derive(Debug, Clone)]
pub struct UnitPaths {
    /// Intermediate directory for the group.
    pub c2v_dir: PathBuf,
    /// Final artifact directory for the group.
    pub vectors_dir: PathBuf,
    /// Raw extractor output.
    pub raw: PathBuf,
    /// Filtered record file (survivors of the structural filter).
    pub filtered: PathBuf,
    /// Output name stem handed to the normalization subprocess.
    pub stem: PathBuf,
    /// Normalized fixed-width record file (`<stem>.test.c2v`).
    pub normalized: PathBuf,
    /// Inference output (`<normalized>.vectors`).
    pub inferred: PathBuf,
    /// Final artifact path; its existence alone defines completion.
    pub final_artifact: PathBuf,
}

impl UnitPaths {
    /// Derive all artifact paths for file `name` of `group` under `output_root`.
    pub fn derive(output_root: &Path, group: &str, name: &str) -> Self {
        let group_dir = output_root.join(group);
        let c2v_dir = group_dir.join("c2v");
        let vectors_dir = group_dir.join("vectors");
        let stem = c2v_dir.join(name);
        let normalized = c2v_dir.join(format!("{name}.test.c2v"));
        let inferred = c2v_dir.join(format!("{name}.test.c2v.vectors"));
        Self {
            raw: c2v_dir.join(format!("{name}.test.raw.txt")),
            filtered: c2v_dir.join(format!("{name}.test.txt")),
            final_artifact: vectors_dir.join(format!("{name}.vectors")),
            c2v_dir,
            vectors_dir,
            stem,
            normalized,
            inferred,
        }
    }

    /// Intermediates removed once a file reaches a terminal state.
    pub fn intermediates(&self) -> [&Path; 4] {
        [&self.raw, &self.filtered, &self.normalized, &self.inferred]
    }
}

// ---------------------------------------------------------------------------
// ExitClass
// ---------------------------------------------------------------------------

/// Terminal classification of one file's trip through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    /// Final artifact produced this run.
    Done,
    /// Final artifact already existed; nothing re-run.
    Skipped,
    ExtractFailed,
    ValidateFailed,
    PreprocessFailed,
    /// Inference exceeded its wall-clock budget and honored SIGTERM.
    Timeout,
    /// Inference ignored SIGTERM and was forcibly killed.
    Killed,
    /// Unclassified failure.
    Failed,
}

impl ExitClass {
    /// Stable tag used in the ledger and narrative logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::ExtractFailed => "extract_failed",
            Self::ValidateFailed => "validate_failed",
            Self::PreprocessFailed => "preprocess_failed",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
            Self::Failed => "failed",
        }
    }

    /// Whether this classification counts as an error in accounting.
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Done | Self::Skipped)
    }
}

impl std::fmt::Display for ExitClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

/// One line of the durable job ledger: the per-unit audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Owning orchestrator invocation.
    pub run_id: RunId,
    pub group: String,
    pub unit: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Normalization retries consumed across the unit's files.
    pub retries: u32,
    /// Worst classification across the unit's files.
    pub class: ExitClass,
    /// Total context count across the unit's successful files.
    pub contexts: u64,
}

// ---------------------------------------------------------------------------
// ContextCount
// ---------------------------------------------------------------------------

/// Accounting value for one file: a context count, or an explicit error
/// marker. Serializes as a bare number or the string `"error"` so the
/// accounting document stays readable by downstream tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextCount {
    Count(u64),
    Error,
}

impl Serialize for ContextCount {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Count(n) => s.serialize_u64(*n),
            Self::Error => s.serialize_str("error"),
        }
    }
}

impl<'de> Deserialize<'de> for ContextCount {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = ContextCount;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a context count or the string \"error\"")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                Ok(ContextCount::Count(v))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                if v == "error" {
                    Ok(ContextCount::Error)
                } else {
                    Err(E::invalid_value(serde::de::Unexpected::Str(v), &self))
                }
            }
        }

        d.deserialize_any(V)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let s = id.to_string();
        let parsed: RunId = s.parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn unit_paths_layout() {
        let paths = UnitPaths::derive(Path::new("/out"), "proj-a", "proj-a_7");
        assert_eq!(paths.raw, Path::new("/out/proj-a/c2v/proj-a_7.test.raw.txt"));
        assert_eq!(paths.filtered, Path::new("/out/proj-a/c2v/proj-a_7.test.txt"));
        assert_eq!(paths.normalized, Path::new("/out/proj-a/c2v/proj-a_7.test.c2v"));
        assert_eq!(
            paths.inferred,
            Path::new("/out/proj-a/c2v/proj-a_7.test.c2v.vectors")
        );
        assert_eq!(
            paths.final_artifact,
            Path::new("/out/proj-a/vectors/proj-a_7.vectors")
        );
    }

    #[test]
    fn exit_class_tags() {
        assert_eq!(ExitClass::ExtractFailed.as_str(), "extract_failed");
        assert!(ExitClass::Timeout.is_error());
        assert!(!ExitClass::Done.is_error());
        assert!(!ExitClass::Skipped.is_error());
    }

    #[test]
    fn granularity_parses() {
        assert_eq!("flat".parse::<Granularity>().unwrap(), Granularity::Flat);
        assert_eq!(
            "grouped".parse::<Granularity>().unwrap(),
            Granularity::Grouped
        );
        assert!("tree".parse::<Granularity>().is_err());
    }

    #[test]
    fn context_count_serialization() {
        let json = serde_json::to_string(&ContextCount::Count(42)).unwrap();
        assert_eq!(json, "42");
        let json = serde_json::to_string(&ContextCount::Error).unwrap();
        assert_eq!(json, "\"error\"");

        let parsed: ContextCount = serde_json::from_str("17").unwrap();
        assert_eq!(parsed, ContextCount::Count(17));
        let parsed: ContextCount = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(parsed, ContextCount::Error);
        assert!(serde_json::from_str::<ContextCount>("\"oops\"").is_err());
    }

    #[test]
    fn ledger_entry_roundtrip() {
        let entry = LedgerEntry {
            run_id: RunId::new(),
            group: "proj-a".into(),
            unit: "proj-a_3".into(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            retries: 1,
            class: ExitClass::Done,
            contexts: 180,
        };
        let line = serde_json::to_string(&entry).expect("serialize");
        let parsed: LedgerEntry = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(parsed.class, ExitClass::Done);
        assert_eq!(parsed.contexts, 180);
    }
}
