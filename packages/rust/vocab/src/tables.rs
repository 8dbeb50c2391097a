//! Frequency-ranked vocabulary tables.
//!
//! Each reference table is loaded from a histogram file of `<entry> <count>`
//! lines, ranked by descending frequency, and capped at a configured size.
//! Identifiers are assigned from 1 in rank order (0 is reserved for padding
//! by the downstream consumers).

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{debug, info, instrument};

use codevec_shared::{CodevecError, HistogramPaths, Result};

// ---------------------------------------------------------------------------
// VocabTable
// ---------------------------------------------------------------------------

/// One read-only vocabulary table: entry → (stable id, frequency).
#[derive(Debug, Clone, Default)]
pub struct VocabTable {
    ids: HashMap<String, u32>,
    counts: HashMap<String, u64>,
}

impl VocabTable {
    /// Load a table from a histogram file, keeping the `cap` most frequent
    /// entries. Ties are broken lexicographically so the ranking is
    /// deterministic across runs.
    #[instrument(skip_all, fields(path = %path.display(), cap))]
    pub fn load(path: &Path, cap: usize) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| CodevecError::io(path, e))?;
        let reader = BufReader::new(file);

        let mut entries: Vec<(String, u64)> = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| CodevecError::io(path, e))?;
            let mut parts = line.split_whitespace();
            let (Some(entry), Some(count)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(count) = count.parse::<u64>() else {
                debug!(line = %line, "skipping malformed histogram line");
                continue;
            };
            entries.push((entry.to_string(), count));
        }

        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(cap);

        let mut ids = HashMap::with_capacity(entries.len());
        let mut counts = HashMap::with_capacity(entries.len());
        for (rank, (entry, count)) in entries.into_iter().enumerate() {
            ids.insert(entry.clone(), rank as u32 + 1);
            counts.insert(entry, count);
        }

        info!(entries = counts.len(), "vocabulary table loaded");
        Ok(Self { ids, counts })
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.counts.contains_key(entry)
    }

    /// Stable rank-order identifier, 1-based.
    pub fn id_of(&self, entry: &str) -> Option<u32> {
        self.ids.get(entry).copied()
    }

    pub fn count_of(&self, entry: &str) -> Option<u64> {
        self.counts.get(entry).copied()
    }

    /// Ordered entry → count view used for segment serialization.
    pub fn to_count_map(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// VocabSet
// ---------------------------------------------------------------------------

/// The three reference tables the normalization stage depends on.
#[derive(Debug, Clone, Default)]
pub struct VocabSet {
    /// Token vocabulary.
    pub word: VocabTable,
    /// Path-shape vocabulary.
    pub path: VocabTable,
    /// Target-label vocabulary.
    pub target: VocabTable,
}

impl VocabSet {
    /// Load all three tables directly from durable storage. This is both the
    /// Owner's population path and the degraded-mode fallback.
    #[instrument(skip_all)]
    pub fn load(
        histograms: &HistogramPaths,
        word_cap: usize,
        path_cap: usize,
        target_cap: usize,
    ) -> Result<Self> {
        let word = VocabTable::load(&histograms.word, word_cap)?;
        let path = VocabTable::load(&histograms.path, path_cap)?;
        let target = VocabTable::load(&histograms.target, target_cap)?;
        info!(
            words = word.len(),
            paths = path.len(),
            targets = target.len(),
            "vocabularies loaded"
        );
        Ok(Self { word, path, target })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn histogram_file(lines: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("codevec-histo-{}", uuid::Uuid::now_v7()));
        std::fs::write(&path, lines).unwrap();
        path
    }

    #[test]
    fn ranks_by_frequency_and_caps() {
        let path = histogram_file("alpha 5\nbeta 40\ngamma 12\ndelta 3\n");
        let table = VocabTable::load(&path, 3).expect("load");

        assert_eq!(table.len(), 3);
        assert_eq!(table.id_of("beta"), Some(1));
        assert_eq!(table.id_of("gamma"), Some(2));
        assert_eq!(table.id_of("alpha"), Some(3));
        assert!(!table.contains("delta"));
        assert_eq!(table.count_of("beta"), Some(40));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn ties_break_lexicographically() {
        let path = histogram_file("zeta 7\neta 7\ntheta 7\n");
        let table = VocabTable::load(&path, 10).expect("load");

        assert_eq!(table.id_of("eta"), Some(1));
        assert_eq!(table.id_of("theta"), Some(2));
        assert_eq!(table.id_of("zeta"), Some(3));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let path = histogram_file("good 2\nbad\nalso-bad not-a-number\n\n");
        let table = VocabTable::load(&path, 10).expect("load");
        assert_eq!(table.len(), 1);
        assert!(table.contains("good"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn count_map_is_ordered() {
        let path = histogram_file("b 2\na 9\nc 1\n");
        let table = VocabTable::load(&path, 10).expect("load");
        let map = table.to_count_map();
        let keys: Vec<_> = map.keys().cloned().collect();
        assert_eq!(keys, ["a", "b", "c"]);

        let _ = std::fs::remove_file(&path);
    }
}
