//! Per-unit pipeline worker for codevec.
//!
//! A worker drives one work unit through the four-stage pipeline
//! (extraction → structural filter → normalization → inference) as a state
//! machine with idempotent resumption, bounded retries, and escalating
//! subprocess termination. Failures are classified, never propagated: the
//! dispatcher always sees a completed [`UnitReport`].

pub mod machine;
pub mod stages;

pub use machine::{FileOutcome, UnitReport, WorkerContext, run_unit};
pub use stages::{FilterStats, fixed_width_ok};
