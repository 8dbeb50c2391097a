//! Shared vocabulary segment lifecycle.
//!
//! The "server" is a published, read-only serialization of the three
//! vocabulary tables plus a descriptor document in a registry directory.
//! The first acquirer claims the registry slot with an atomic
//! create-if-absent lock, populates the segment, and publishes the
//! descriptor only once population is complete — becoming the Owner.
//! Later acquirers attach as Borrowers, tracked by per-process marker
//! files; teardown requires the Owner role and a zero borrower count.
//!
//! Registry layout under the state directory:
//!
//! ```text
//! <name>/
//!   starting.lock        create-if-absent claim for population
//!   segment.json         the serialized tables
//!   descriptor.json      published atomically after population
//!   borrowers/<uuid>     one marker per attached borrower (content: pid)
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use codevec_shared::{CodevecError, HistogramPaths, Result};

use crate::tables::VocabSet;

/// Env var naming the attached segment, exported to stage subprocesses.
pub const SEGMENT_NAME_ENV: &str = "CODEVEC_SEGMENT_NAME";
/// Env var carrying the segment file path, exported to stage subprocesses.
pub const SEGMENT_PATH_ENV: &str = "CODEVEC_SEGMENT_PATH";
/// Env var carrying the segment byte size, exported to stage subprocesses.
pub const SEGMENT_SIZE_ENV: &str = "CODEVEC_SEGMENT_SIZE";

const DESCRIPTOR_FILE: &str = "descriptor.json";
const SEGMENT_FILE: &str = "segment.json";
const LOCK_FILE: &str = "starting.lock";
const BORROWERS_DIR: &str = "borrowers";

// ---------------------------------------------------------------------------
// Descriptor & payload
// ---------------------------------------------------------------------------

/// The persisted descriptor: sole source of truth for "a server is running".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Segment name (the dataset name).
    pub name: String,
    /// Exact byte size of the published segment file.
    pub byte_size: u64,
    /// Fingerprint of the source tables the segment was built from.
    pub fingerprint: String,
    /// Pid of the owning process at publication time.
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

/// Serialized segment content: the three tables as ordered count maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentPayload {
    pub dataset: String,
    pub word_to_count: BTreeMap<String, u64>,
    pub path_to_count: BTreeMap<String, u64>,
    pub target_to_count: BTreeMap<String, u64>,
}

impl SegmentPayload {
    pub fn from_tables(dataset: &str, tables: &VocabSet) -> Self {
        Self {
            dataset: dataset.to_string(),
            word_to_count: tables.word.to_count_map(),
            path_to_count: tables.path.to_count_map(),
            target_to_count: tables.target.to_count_map(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status, role, source
// ---------------------------------------------------------------------------

/// Observable lifecycle state of a registry slot.
#[derive(Debug, Clone)]
pub enum SegmentStatus {
    Absent,
    /// A claim exists but no descriptor has been published yet.
    Starting,
    Ready(SegmentDescriptor),
    /// Descriptor removed but segment bytes still on disk (interrupted
    /// teardown).
    Stopping,
    /// Descriptor present but its owner process is gone.
    Stale(SegmentDescriptor),
}

/// Ownership tag on an acquired segment handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRole {
    /// This process populated the segment and is responsible for teardown.
    Owner,
    /// This process attached to an existing segment and must never tear it
    /// down.
    Borrower,
}

/// How workers hand the vocabulary to the normalization subprocess.
#[derive(Debug, Clone)]
pub enum VocabSource {
    /// Attached segment, exported via `CODEVEC_SEGMENT_*` env vars.
    Segment {
        name: String,
        path: PathBuf,
        byte_size: u64,
    },
    /// Degraded mode: subprocesses read the raw tables themselves.
    Direct,
}

/// Outcome of an out-of-process stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// SIGTERM delivered to the live owner.
    SignalSent(u32),
    /// The owner was gone; stale registry state was swept.
    CleanedStale,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The segment registry: a directory of named slots with atomic
/// create-if-absent claims and borrower-marker reference counts.
#[derive(Debug, Clone)]
pub struct SegmentRegistry {
    dir: PathBuf,
}

impl SegmentRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn slot(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn descriptor_path(&self, name: &str) -> PathBuf {
        self.slot(name).join(DESCRIPTOR_FILE)
    }

    fn segment_path(&self, name: &str) -> PathBuf {
        self.slot(name).join(SEGMENT_FILE)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.slot(name).join(LOCK_FILE)
    }

    fn borrowers_dir(&self, name: &str) -> PathBuf {
        self.slot(name).join(BORROWERS_DIR)
    }

    /// Liveness probe used by every other operation to decide
    /// attach-vs-start.
    pub fn status(&self, name: &str) -> SegmentStatus {
        let descriptor_path = self.descriptor_path(name);
        match read_descriptor(&descriptor_path) {
            Some(desc) => {
                let segment_ok = std::fs::metadata(self.segment_path(name))
                    .map(|m| m.len() == desc.byte_size)
                    .unwrap_or(false);
                if !segment_ok {
                    return SegmentStatus::Stale(desc);
                }
                if pid_alive(desc.pid) {
                    SegmentStatus::Ready(desc)
                } else {
                    SegmentStatus::Stale(desc)
                }
            }
            None => {
                if self.lock_path(name).exists() {
                    SegmentStatus::Starting
                } else if self.segment_path(name).exists() {
                    SegmentStatus::Stopping
                } else {
                    SegmentStatus::Absent
                }
            }
        }
    }

    /// Idempotent acquisition.
    ///
    /// Attaches as Borrower when a ready descriptor is found; otherwise
    /// claims the slot, populates the segment from `sources`, and publishes
    /// the descriptor, returning an Owner handle. A process that loses the
    /// claim race polls for the descriptor up to `poll_attempts` fixed
    /// intervals; exceeding the bound is a startup error.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn acquire(
        &self,
        name: &str,
        sources: &HistogramPaths,
        caps: (usize, usize, usize),
        poll_attempts: u32,
        poll_interval: std::time::Duration,
    ) -> Result<SegmentHandle> {
        match self.status(name) {
            SegmentStatus::Ready(desc) => {
                info!(name, pid = desc.pid, "segment already running, attaching");
                return self.attach(name, sources);
            }
            SegmentStatus::Stale(desc) => {
                warn!(name, pid = desc.pid, "sweeping stale segment state");
                self.sweep(name);
            }
            SegmentStatus::Stopping => {
                warn!(name, "sweeping interrupted teardown");
                self.sweep(name);
            }
            SegmentStatus::Starting | SegmentStatus::Absent => {}
        }

        if self.try_claim(name)? {
            return self.populate(name, sources, caps);
        }

        // Lost the claim race: bounded fixed-interval poll for the winner's
        // descriptor.
        for attempt in 1..=poll_attempts {
            tokio::time::sleep(poll_interval).await;
            if let SegmentStatus::Ready(_) = self.status(name) {
                debug!(name, attempt, "descriptor appeared, attaching");
                return self.attach(name, sources);
            }
        }
        Err(CodevecError::Segment(format!(
            "timed out waiting for segment {name:?} after {poll_attempts} attempts"
        )))
    }

    /// Attach to a ready segment as Borrower. Fails when the segment is not
    /// ready or was built from different source tables.
    pub fn attach(&self, name: &str, sources: &HistogramPaths) -> Result<SegmentHandle> {
        let SegmentStatus::Ready(desc) = self.status(name) else {
            return Err(CodevecError::Segment(format!(
                "segment {name:?} is not ready"
            )));
        };

        let expected = fingerprint_sources(sources)?;
        if desc.fingerprint != expected {
            return Err(CodevecError::Segment(format!(
                "segment {name:?} was built from different vocabulary tables"
            )));
        }

        let borrowers = self.borrowers_dir(name);
        std::fs::create_dir_all(&borrowers).map_err(|e| CodevecError::io(&borrowers, e))?;
        let marker = borrowers.join(uuid::Uuid::now_v7().to_string());
        atomic_create(&marker, std::process::id().to_string().as_bytes())?;

        Ok(SegmentHandle {
            registry: self.clone(),
            name: name.to_string(),
            role: SegmentRole::Borrower,
            descriptor: desc,
            marker: Some(marker),
            released: false,
        })
    }

    /// Out-of-process stop: signal the live owner, or sweep stale state.
    pub fn request_stop(&self, name: &str) -> Result<StopOutcome> {
        match self.status(name) {
            SegmentStatus::Ready(desc) => {
                info!(name, pid = desc.pid, "sending SIGTERM to segment owner");
                send_sigterm(desc.pid)?;
                Ok(StopOutcome::SignalSent(desc.pid))
            }
            SegmentStatus::Stale(desc) => {
                warn!(name, pid = desc.pid, "owner gone, sweeping stale state");
                self.sweep(name);
                Ok(StopOutcome::CleanedStale)
            }
            SegmentStatus::Stopping => {
                self.sweep(name);
                Ok(StopOutcome::CleanedStale)
            }
            SegmentStatus::Starting | SegmentStatus::Absent => Ok(StopOutcome::NotRunning),
        }
    }

    /// Live borrower count; markers whose recorded pid is gone are swept.
    pub fn live_borrowers(&self, name: &str) -> usize {
        let dir = self.borrowers_dir(name);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return 0;
        };
        let mut live = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let pid = std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            match pid {
                Some(pid) if pid_alive(pid) => live += 1,
                _ => {
                    debug!(marker = %path.display(), "sweeping dead borrower marker");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        live
    }

    /// Claim the slot with an atomic create-if-absent lock. Returns false
    /// when another process already holds the claim.
    fn try_claim(&self, name: &str) -> Result<bool> {
        let slot = self.slot(name);
        std::fs::create_dir_all(&slot).map_err(|e| CodevecError::io(&slot, e))?;
        match atomic_create(&self.lock_path(name), std::process::id().to_string().as_bytes()) {
            Ok(()) => Ok(true),
            Err(CodevecError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::AlreadyExists =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Owner path: load the tables, write the segment, then publish the
    /// descriptor atomically so attachers never observe a half-populated
    /// segment.
    fn populate(
        &self,
        name: &str,
        sources: &HistogramPaths,
        caps: (usize, usize, usize),
    ) -> Result<SegmentHandle> {
        let result = self.populate_inner(name, sources, caps);
        if result.is_err() {
            // Failed claims must not wedge the slot for the next starter.
            self.sweep(name);
        }
        result
    }

    fn populate_inner(
        &self,
        name: &str,
        sources: &HistogramPaths,
        caps: (usize, usize, usize),
    ) -> Result<SegmentHandle> {
        info!(name, "populating shared vocabulary segment");
        let tables = VocabSet::load(sources, caps.0, caps.1, caps.2)?;
        let payload = SegmentPayload::from_tables(name, &tables);

        let segment_path = self.segment_path(name);
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| CodevecError::Segment(format!("segment serialization: {e}")))?;
        atomic_write(&segment_path, &bytes)?;

        let descriptor = SegmentDescriptor {
            name: name.to_string(),
            byte_size: bytes.len() as u64,
            fingerprint: fingerprint_sources(sources)?,
            pid: std::process::id(),
            created_at: Utc::now(),
        };
        let desc_bytes = serde_json::to_vec_pretty(&descriptor)
            .map_err(|e| CodevecError::Segment(format!("descriptor serialization: {e}")))?;
        atomic_write(&self.descriptor_path(name), &desc_bytes)?;

        let borrowers = self.borrowers_dir(name);
        std::fs::create_dir_all(&borrowers).map_err(|e| CodevecError::io(&borrowers, e))?;

        info!(
            name,
            byte_size = descriptor.byte_size,
            "segment published"
        );
        Ok(SegmentHandle {
            registry: self.clone(),
            name: name.to_string(),
            role: SegmentRole::Owner,
            descriptor,
            marker: None,
            released: false,
        })
    }

    /// Remove every file of a slot. Used for stale state and failed claims.
    fn sweep(&self, name: &str) {
        let _ = std::fs::remove_file(self.descriptor_path(name));
        let _ = std::fs::remove_file(self.segment_path(name));
        let _ = std::fs::remove_file(self.lock_path(name));
        let _ = std::fs::remove_dir_all(self.borrowers_dir(name));
        let _ = std::fs::remove_dir(self.slot(name));
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// An acquired segment with an explicit ownership role.
///
/// Release runs from a scoped guard on every exit path — dropping the handle
/// is sufficient — and dispatches on the role: Borrowers remove their marker
/// and never touch the published segment; the Owner tears the slot down only
/// once no live borrowers remain.
#[derive(Debug)]
pub struct SegmentHandle {
    registry: SegmentRegistry,
    name: String,
    role: SegmentRole,
    descriptor: SegmentDescriptor,
    marker: Option<PathBuf>,
    released: bool,
}

impl SegmentHandle {
    pub fn role(&self) -> SegmentRole {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    /// The vocabulary source workers export to stage subprocesses.
    pub fn vocab_source(&self) -> VocabSource {
        VocabSource::Segment {
            name: self.name.clone(),
            path: self.registry.segment_path(&self.name),
            byte_size: self.descriptor.byte_size,
        }
    }

    /// Explicit stop. Honored only by the Owner; a Borrower invoking it is
    /// a log-only no-op (its marker is still removed).
    pub fn stop(mut self) {
        match self.role {
            SegmentRole::Owner => self.release_inner(),
            SegmentRole::Borrower => {
                info!(name = %self.name, "stop requested by borrower, ignoring");
                self.release_inner();
            }
        }
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match self.role {
            SegmentRole::Borrower => {
                if let Some(marker) = &self.marker {
                    let _ = std::fs::remove_file(marker);
                }
                debug!(name = %self.name, "borrower detached");
            }
            SegmentRole::Owner => {
                let live = self.registry.live_borrowers(&self.name);
                if live > 0 {
                    // Attachers that lose the narrow race between this count
                    // and descriptor removal still work: the normalization
                    // contract always carries the raw table paths.
                    warn!(
                        name = %self.name,
                        borrowers = live,
                        "borrowers still attached, leaving segment published"
                    );
                    return;
                }
                self.registry.sweep(&self.name);
                info!(name = %self.name, "segment torn down");
            }
        }
    }
}

impl Drop for SegmentHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Metadata fingerprint of the three source tables (path + byte length).
/// Cheap enough to recompute at attach time, strong enough to catch a
/// segment built from a different dataset.
pub fn fingerprint_sources(sources: &HistogramPaths) -> Result<String> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for path in sources.all() {
        let meta = std::fs::metadata(path).map_err(|e| CodevecError::io(path, e))?;
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(meta.len().to_le_bytes());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn read_descriptor(path: &Path) -> Option<SegmentDescriptor> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

fn send_sigterm(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| CodevecError::Segment(format!("pid out of range: {pid}")))?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM)
        .map_err(|e| CodevecError::Segment(format!("failed to signal owner {pid}: {e}")))
}

/// Create a file that must not already exist (atomic create-if-absent).
fn atomic_create(path: &Path, content: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| CodevecError::io(path, e))?;
    file.write_all(content).map_err(|e| CodevecError::io(path, e))
}

/// Write via temp file + rename so readers never observe partial content.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CodevecError::Segment(format!("no parent for {}", path.display())))?;
    let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::now_v7()));
    std::fs::write(&tmp, content).map_err(|e| CodevecError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| CodevecError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    struct Fixture {
        root: PathBuf,
        registry: SegmentRegistry,
        sources: HistogramPaths,
    }

    impl Fixture {
        fn new() -> Self {
            let root = std::env::temp_dir().join(format!("codevec-seg-{}", uuid::Uuid::now_v7()));
            let data = root.join("data");
            fs::create_dir_all(&data).unwrap();
            let sources = HistogramPaths::derive(&data, "testset");
            fs::write(&sources.word, "get 9\nset 5\nname 2\n").unwrap();
            fs::write(&sources.path, "p1 7\np2 3\n").unwrap();
            fs::write(&sources.target, "main 4\nrun 1\n").unwrap();
            let registry = SegmentRegistry::new(root.join("segments"));
            Self {
                root,
                registry,
                sources,
            }
        }

        async fn acquire(&self) -> Result<SegmentHandle> {
            self.registry
                .acquire(
                    "testset",
                    &self.sources,
                    (10, 10, 10),
                    3,
                    Duration::from_millis(10),
                )
                .await
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[tokio::test]
    async fn first_acquire_becomes_owner() {
        let fx = Fixture::new();
        let handle = fx.acquire().await.expect("acquire");
        assert_eq!(handle.role(), SegmentRole::Owner);
        assert!(matches!(
            fx.registry.status("testset"),
            SegmentStatus::Ready(_)
        ));

        let desc = handle.descriptor().clone();
        let seg_meta = fs::metadata(fx.registry.segment_path("testset")).unwrap();
        assert_eq!(seg_meta.len(), desc.byte_size);

        handle.release();
        assert!(matches!(
            fx.registry.status("testset"),
            SegmentStatus::Absent
        ));
    }

    #[tokio::test]
    async fn second_acquire_attaches_as_borrower() {
        let fx = Fixture::new();
        let owner = fx.acquire().await.expect("owner");
        let borrower = fx.acquire().await.expect("borrower");
        assert_eq!(borrower.role(), SegmentRole::Borrower);
        assert_eq!(fx.registry.live_borrowers("testset"), 1);

        // Borrower exit never tears the segment down.
        borrower.release();
        assert!(matches!(
            fx.registry.status("testset"),
            SegmentStatus::Ready(_)
        ));
        assert_eq!(fx.registry.live_borrowers("testset"), 0);

        owner.release();
        assert!(matches!(
            fx.registry.status("testset"),
            SegmentStatus::Absent
        ));
    }

    #[tokio::test]
    async fn borrower_stop_is_noop() {
        let fx = Fixture::new();
        let owner = fx.acquire().await.expect("owner");
        let borrower = fx.acquire().await.expect("borrower");

        borrower.stop();
        assert!(matches!(
            fx.registry.status("testset"),
            SegmentStatus::Ready(_)
        ));

        owner.stop();
        assert!(matches!(
            fx.registry.status("testset"),
            SegmentStatus::Absent
        ));
    }

    #[tokio::test]
    async fn owner_leaves_segment_while_borrowed() {
        let fx = Fixture::new();
        let owner = fx.acquire().await.expect("owner");
        let borrower = fx.acquire().await.expect("borrower");

        // Owner exits first: segment must stay published for the borrower.
        owner.release();
        assert!(matches!(
            fx.registry.status("testset"),
            SegmentStatus::Ready(_)
        ));
        borrower.release();
    }

    #[tokio::test]
    async fn drop_releases_like_explicit_release() {
        let fx = Fixture::new();
        {
            let _handle = fx.acquire().await.expect("owner");
        }
        assert!(matches!(
            fx.registry.status("testset"),
            SegmentStatus::Absent
        ));
    }

    #[tokio::test]
    async fn poll_times_out_when_starter_never_publishes() {
        let fx = Fixture::new();
        // Simulate a foreign claim that never completes.
        let slot = fx.registry.slot("testset");
        fs::create_dir_all(&slot).unwrap();
        fs::write(fx.registry.lock_path("testset"), b"0").unwrap();

        let err = fx.acquire().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn stale_descriptor_is_swept_and_reowned() {
        let fx = Fixture::new();
        {
            let owner = fx.acquire().await.expect("owner");
            // Forge a dead owner pid so the next acquire sees stale state.
            let mut desc = owner.descriptor().clone();
            desc.pid = 99_999_999;
            fs::write(
                fx.registry.descriptor_path("testset"),
                serde_json::to_vec(&desc).unwrap(),
            )
            .unwrap();
            std::mem::forget(owner);
        }
        assert!(matches!(
            fx.registry.status("testset"),
            SegmentStatus::Stale(_)
        ));

        let handle = fx.acquire().await.expect("reacquire");
        assert_eq!(handle.role(), SegmentRole::Owner);
        handle.release();
    }

    #[tokio::test]
    async fn attach_rejects_mismatched_tables() {
        let fx = Fixture::new();
        let owner = fx.acquire().await.expect("owner");

        // Grow a source table after publication: fingerprint changes.
        fs::write(&fx.sources.word, "get 9\nset 5\nname 2\nextra 1\n").unwrap();
        let err = fx.acquire().await.unwrap_err();
        assert!(err.to_string().contains("different vocabulary tables"));

        owner.release();
    }

    #[tokio::test]
    async fn payload_roundtrip() {
        let fx = Fixture::new();
        let handle = fx.acquire().await.expect("owner");

        let VocabSource::Segment { path, byte_size, .. } = handle.vocab_source() else {
            panic!("expected segment source");
        };
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, byte_size);
        let payload: SegmentPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload.dataset, "testset");
        assert_eq!(payload.word_to_count.get("get"), Some(&9));
        assert_eq!(payload.path_to_count.len(), 2);

        handle.release();
    }
}
