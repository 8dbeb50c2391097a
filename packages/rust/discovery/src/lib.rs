//! Work discovery: enumerate processable units from a corpus root.
//!
//! Discovery is deterministic — repeated runs over an unchanged tree return
//! the same lexicographically ordered, deduplicated unit list — and fails
//! fast with a fatal configuration error when the root is missing or yields
//! nothing to do.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, instrument};

use codevec_shared::{CodevecError, Granularity, Result, WorkUnit};

// ---------------------------------------------------------------------------
// Discovery options
// ---------------------------------------------------------------------------

/// Configuration for the discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Unit granularity: one unit per file, or one per project subdirectory.
    pub granularity: Granularity,
    /// Source file extension (without the leading dot).
    pub source_ext: String,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            granularity: Granularity::Grouped,
            source_ext: "js".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Enumerate work units under `root`.
///
/// Flat granularity yields one unit per matching file directly under the
/// root; grouped granularity yields one unit per first-level subdirectory,
/// carrying that project's ordered file list. Hidden entries and files with
/// other extensions are ignored.
#[instrument(skip_all, fields(root = %root.display(), granularity = ?opts.granularity))]
pub fn discover(root: &Path, opts: &DiscoveryOptions) -> Result<Vec<WorkUnit>> {
    if !root.is_dir() {
        return Err(CodevecError::config(format!(
            "corpus root not found: {}",
            root.display()
        )));
    }

    let units = match opts.granularity {
        Granularity::Flat => discover_flat(root, &opts.source_ext)?,
        Granularity::Grouped => discover_grouped(root, &opts.source_ext)?,
    };

    if units.is_empty() {
        return Err(CodevecError::config(format!(
            "corpus root {} yields zero work units (looked for *.{} files)",
            root.display(),
            opts.source_ext
        )));
    }

    let files: usize = units.iter().map(|u| u.sources.len()).sum();
    info!(units = units.len(), files, "discovery complete");

    Ok(units)
}

/// One unit per matching file directly under the root. The group identity
/// is the root directory's own name.
fn discover_flat(root: &Path, ext: &str) -> Result<Vec<WorkUnit>> {
    let group = dir_name(root);
    let files = matching_files(root, ext)?;

    Ok(files
        .into_iter()
        .map(|(name, path)| WorkUnit {
            group: group.clone(),
            name,
            sources: vec![path],
        })
        .collect())
}

/// One unit per first-level subdirectory holding at least one matching file.
fn discover_grouped(root: &Path, ext: &str) -> Result<Vec<WorkUnit>> {
    let mut dirs: Vec<_> = read_dir(root)?
        .into_iter()
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    let mut units = Vec::new();
    for dir in dirs {
        let group = dir_name(&dir);
        if group.starts_with('.') {
            continue;
        }
        let files = matching_files(&dir, ext)?;
        if files.is_empty() {
            debug!(group = %group, "no matching files, skipping group");
            continue;
        }
        units.push(WorkUnit {
            name: group.clone(),
            group,
            sources: files.into_values().collect(),
        });
    }
    Ok(units)
}

/// Matching files of one directory, deduplicated by unit name (file stem)
/// and lexicographically ordered by the map's key order.
fn matching_files(dir: &Path, ext: &str) -> Result<BTreeMap<String, std::path::PathBuf>> {
    let mut files = BTreeMap::new();
    for path in read_dir(dir)? {
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(ext) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with('.') {
            continue;
        }
        files.insert(stem.to_string(), path);
    }
    Ok(files)
}

fn read_dir(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| CodevecError::io(dir, e))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CodevecError::io(dir, e))?;
        paths.push(entry.path());
    }
    Ok(paths)
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "corpus".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn fixture_root(layout: &[(&str, &str)]) -> PathBuf {
        let root = std::env::temp_dir().join(format!("codevec-disc-{}", uuid::Uuid::now_v7()));
        for (rel, content) in layout {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
        }
        root
    }

    #[test]
    fn grouped_discovery_orders_and_groups() {
        let root = fixture_root(&[
            ("proj-b/proj-b_1.js", "x"),
            ("proj-a/proj-a_2.js", "x"),
            ("proj-a/proj-a_1.js", "x"),
            ("proj-a/notes.txt", "ignored"),
        ]);

        let units = discover(&root, &DiscoveryOptions::default()).expect("discover");
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].group, "proj-a");
        assert_eq!(units[0].sources.len(), 2);
        assert!(units[0].sources[0].ends_with("proj-a_1.js"));
        assert!(units[0].sources[1].ends_with("proj-a_2.js"));
        assert_eq!(units[1].group, "proj-b");

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn flat_discovery_one_unit_per_file() {
        let root = fixture_root(&[
            ("beta.js", "x"),
            ("alpha.js", "x"),
            ("readme.md", "ignored"),
        ]);

        let opts = DiscoveryOptions {
            granularity: Granularity::Flat,
            source_ext: "js".into(),
        };
        let units = discover(&root, &opts).expect("discover");
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].name, "alpha");
        assert_eq!(units[1].name, "beta");
        assert!(units.iter().all(|u| u.sources.len() == 1));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn discovery_is_deterministic() {
        let root = fixture_root(&[
            ("p1/p1_3.js", "x"),
            ("p1/p1_1.js", "x"),
            ("p2/p2_1.js", "x"),
            ("p0/p0_9.js", "x"),
        ]);

        let first = discover(&root, &DiscoveryOptions::default()).expect("first");
        let second = discover(&root, &DiscoveryOptions::default()).expect("second");
        assert_eq!(first, second);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_root_is_fatal() {
        let err = discover(
            Path::new("/nonexistent/codevec-root"),
            &DiscoveryOptions::default(),
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn empty_root_is_fatal() {
        let root = fixture_root(&[("only/notes.txt", "no sources here")]);
        let err = discover(&root, &DiscoveryOptions::default()).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("zero work units"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn empty_groups_are_skipped() {
        let root = fixture_root(&[("full/full_1.js", "x"), ("empty/readme.md", "x")]);
        let units = discover(&root, &DiscoveryOptions::default()).expect("discover");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].group, "full");

        let _ = fs::remove_dir_all(&root);
    }
}
