//! Per-leaf hotness statistics driving the read-optimization task.
//!
//! Reads and writes bump per-leaf counters; a periodic refresh folds the
//! counters into exponentially decayed hotness values and resets them.

use std::collections::HashMap;
use std::sync::RwLock;

/// Retained fraction of the previous hotness at each refresh.
const DECAY: f64 = 0.8;

#[derive(Debug, Clone, Default)]
pub struct LeafStat {
    pub read_hotness: f64,
    pub write_hotness: f64,
    pub num_runs: usize,
    reads_since_refresh: u64,
    writes_since_refresh: u64,
}

#[derive(Default)]
pub struct LeafStatStore {
    leaves: RwLock<HashMap<Vec<u8>, LeafStat>>,
}

impl LeafStatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_leaf(&self, leaf_max_key: &[u8], num_runs: usize) {
        if let Ok(mut leaves) = self.leaves.write() {
            leaves.entry(leaf_max_key.to_vec()).or_default().num_runs = num_runs;
        }
    }

    pub fn delete_leaf(&self, leaf_max_key: &[u8]) {
        if let Ok(mut leaves) = self.leaves.write() {
            leaves.remove(leaf_max_key);
        }
    }

    /// Replaces a split leaf's entry with one per produced leaf, each a
    /// single fresh run.
    pub fn split_leaf(&self, old_max_key: &[u8], new_max_keys: &[Vec<u8>]) {
        if let Ok(mut leaves) = self.leaves.write() {
            leaves.remove(old_max_key);
            for key in new_max_keys {
                let stat = leaves.entry(key.clone()).or_default();
                stat.num_runs = 1;
            }
        }
    }

    pub fn update_leaf_num_runs(&self, leaf_max_key: &[u8], num_runs: usize) {
        if let Ok(mut leaves) = self.leaves.write() {
            leaves.entry(leaf_max_key.to_vec()).or_default().num_runs = num_runs;
        }
    }

    pub fn update_write_hotness(&self, leaf_max_key: &[u8], writes: u64) {
        if writes == 0 {
            return;
        }
        if let Ok(mut leaves) = self.leaves.write() {
            leaves
                .entry(leaf_max_key.to_vec())
                .or_default()
                .writes_since_refresh += writes;
        }
    }

    pub fn record_read(&self, leaf_max_key: &[u8]) {
        if let Ok(mut leaves) = self.leaves.write() {
            if let Some(stat) = leaves.get_mut(leaf_max_key) {
                stat.reads_since_refresh += 1;
            }
        }
    }

    /// Folds accumulated counters into the decayed hotness values.
    pub fn refresh_hotness(&self) {
        if let Ok(mut leaves) = self.leaves.write() {
            for stat in leaves.values_mut() {
                stat.read_hotness = stat.read_hotness * DECAY + stat.reads_since_refresh as f64;
                stat.write_hotness =
                    stat.write_hotness * DECAY + stat.writes_since_refresh as f64;
                stat.reads_since_refresh = 0;
                stat.writes_since_refresh = 0;
            }
        }
    }

    pub fn for_each_leaf(&self, mut f: impl FnMut(&[u8], &LeafStat)) {
        if let Ok(leaves) = self.leaves.read() {
            for (key, stat) in leaves.iter() {
                f(key, stat);
            }
        }
    }

    pub fn num_leaves(&self) -> usize {
        self.leaves.read().map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_hotness_decays() {
        let stats = LeafStatStore::new();
        stats.new_leaf(b"leaf", 3);
        stats.record_read(b"leaf");
        stats.record_read(b"leaf");
        stats.refresh_hotness();

        let mut hotness = 0.0;
        stats.for_each_leaf(|_, stat| hotness = stat.read_hotness);
        assert_eq!(hotness, 2.0);

        // No reads in the next interval: hotness decays.
        stats.refresh_hotness();
        stats.for_each_leaf(|_, stat| hotness = stat.read_hotness);
        assert!(hotness < 2.0 && hotness > 0.0);
    }

    #[test]
    fn test_reads_on_unknown_leaf_are_ignored() {
        let stats = LeafStatStore::new();
        stats.record_read(b"ghost");
        assert_eq!(stats.num_leaves(), 0);
    }

    #[test]
    fn test_split_replaces_leaf() {
        let stats = LeafStatStore::new();
        stats.new_leaf(b"old", 7);
        stats.split_leaf(b"old", &[b"new-a".to_vec(), b"new-b".to_vec()]);

        let mut seen = Vec::new();
        stats.for_each_leaf(|key, stat| seen.push((key.to_vec(), stat.num_runs)));
        seen.sort();
        assert_eq!(
            seen,
            vec![(b"new-a".to_vec(), 1), (b"new-b".to_vec(), 1)]
        );
    }
}
