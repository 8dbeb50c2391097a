//! Orchestration core for codevec: dispatcher, accounting, aggregation,
//! and the end-to-end pipeline entry point.

pub mod accounting;
pub mod aggregate;
pub mod dispatch;
pub mod pipeline;

pub use accounting::{GroupAccounting, GroupLog};
pub use codevec_worker::{FileOutcome, UnitReport};
pub use aggregate::{COMBINED_ACCOUNTING_FILE, RUN_SUMMARY_FILE, RunStats};
pub use dispatch::{Ledger, compute_budget, derive_jobs, dispatch};
pub use pipeline::{ProgressReporter, RunOutcome, SilentProgress, run_pipeline};
