//! Shared vocabulary tables and segment lifecycle for codevec.
//!
//! The three reference tables (token, path-shape, target-label) are loaded
//! once, capped, and published as a read-only segment that concurrent
//! orchestrator invocations attach to. See [`segment`] for the registry and
//! ownership protocol, [`tables`] for the table loader used both to
//! populate segments and as the degraded-mode direct-read fallback.

pub mod segment;
pub mod tables;

pub use segment::{
    SEGMENT_NAME_ENV, SEGMENT_PATH_ENV, SEGMENT_SIZE_ENV, SegmentDescriptor, SegmentHandle,
    SegmentPayload, SegmentRegistry, SegmentRole, SegmentStatus, StopOutcome, VocabSource,
    fingerprint_sources,
};
pub use tables::{VocabSet, VocabTable};
