use std::path::PathBuf;
use std::time::Duration;

const MB: usize = 1024 * 1024;

/// Configuration for a LoomDB instance.
///
/// All sizes are in bytes. The defaults mirror a small server deployment;
/// tests shrink them aggressively to exercise rotation, split and GC.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory path for the database.
    pub dir: PathBuf,

    /// Initial memtable capacity (default: 64MB). The capacity adapts
    /// upward as the segment tier grows, see `memtbl_to_l0_ratio`.
    pub write_buffer_size: usize,

    /// Divisor applied to (capacity + total segment storage) when adapting
    /// the memtable capacity on rotation (default: 8).
    pub memtbl_to_l0_ratio: usize,

    /// Upper bound on the adapted memtable capacity (default: 1GB).
    pub max_memtbl_capacity: usize,

    /// Soft cap on a leaf's data size in bytes (default: 4MB).
    pub leaf_datasize_thresh: usize,

    /// Run-count cap per leaf; reaching it makes the leaf a split candidate
    /// (default: 15).
    pub leaf_max_num_miniruns: usize,

    /// Soft cap on a segment file; builders roll over past it
    /// (default: 32MB).
    pub segment_file_size_thresh: usize,

    /// Total segment storage allowed before GC kicks in. Zero disables the
    /// storage-pressure loop (default: 0).
    pub maximum_segments_storage_size: usize,

    /// Fraction of `maximum_segments_storage_size` at which the compactor
    /// starts garbage collecting (default: 0.7).
    pub segments_storage_size_gc_threshold: f64,

    /// Fraction of `leaf_datasize_thresh` each leaf produced by a split is
    /// filled to (default: 0.5).
    pub leaf_split_fill_frac: f64,

    /// Fraction of `leaf_datasize_thresh` each brand-new leaf created by a
    /// flush is filled to (default: 0.05).
    pub new_leaf_fill_frac: f64,

    /// Attach a dynamic bloom filter to each memtable (default: true).
    pub use_memtable_dynamic_filter: bool,

    /// False-positive rate for the memtable dynamic filter (default: 0.01).
    pub memtable_dynamic_filter_fp_rate: f64,

    /// False-positive rate for minirun filter blocks (default: 0.01).
    pub minirun_filter_fp_rate: f64,

    /// Enable the periodic read-hotness leaf optimization task
    /// (default: false).
    pub enable_leaf_read_opt: bool,

    /// Interval between read-hotness refreshes and optimization passes
    /// (default: 1s).
    pub read_refresh_interval: Duration,

    /// PM backing file for memtables. Empty means `<dir>/memtable.pm`.
    pub nvmemtable_file: PathBuf,

    /// Extent of the memtable PM backing file (default: 1GB).
    pub nvmemtable_size: usize,

    /// PM backing file for the leaf index. Empty means `<dir>/leafindex.pm`.
    pub nvmleafindex_file: PathBuf,

    /// Extent of the leaf index PM backing file (default: 64MB).
    pub nvmleafindex_size: usize,

    /// Worker threads for the leaf split phase (default: 4).
    pub split_leaf_num_threads: usize,

    /// Worker threads for the flush compaction phase (default: 2).
    pub compact_num_threads: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./loomdb"),
            write_buffer_size: 64 * MB,
            memtbl_to_l0_ratio: 8,
            max_memtbl_capacity: 1024 * MB,
            leaf_datasize_thresh: 4 * MB,
            leaf_max_num_miniruns: 15,
            segment_file_size_thresh: 32 * MB,
            maximum_segments_storage_size: 0,
            segments_storage_size_gc_threshold: 0.7,
            leaf_split_fill_frac: 0.5,
            new_leaf_fill_frac: 0.05,
            use_memtable_dynamic_filter: true,
            memtable_dynamic_filter_fp_rate: 0.01,
            minirun_filter_fp_rate: 0.01,
            enable_leaf_read_opt: false,
            read_refresh_interval: Duration::from_secs(1),
            nvmemtable_file: PathBuf::new(),
            nvmemtable_size: 1024 * MB,
            nvmleafindex_file: PathBuf::new(),
            nvmleafindex_size: 64 * MB,
            split_leaf_num_threads: 4,
            compact_num_threads: 2,
        }
    }
}

impl Options {
    /// Create options rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Path of the memtable PM backing file.
    pub fn memtable_pm_path(&self) -> PathBuf {
        if self.nvmemtable_file.as_os_str().is_empty() {
            self.dir.join("memtable.pm")
        } else {
            self.nvmemtable_file.clone()
        }
    }

    /// Path of the leaf index PM backing file.
    pub fn leafindex_pm_path(&self) -> PathBuf {
        if self.nvmleafindex_file.as_os_str().is_empty() {
            self.dir.join("leafindex.pm")
        } else {
            self.nvmleafindex_file.clone()
        }
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn memtbl_to_l0_ratio(mut self, ratio: usize) -> Self {
        self.memtbl_to_l0_ratio = ratio.max(1);
        self
    }

    pub fn max_memtbl_capacity(mut self, size: usize) -> Self {
        self.max_memtbl_capacity = size;
        self
    }

    pub fn leaf_datasize_thresh(mut self, size: usize) -> Self {
        self.leaf_datasize_thresh = size;
        self
    }

    pub fn leaf_max_num_miniruns(mut self, n: usize) -> Self {
        self.leaf_max_num_miniruns = n;
        self
    }

    pub fn segment_file_size_thresh(mut self, size: usize) -> Self {
        self.segment_file_size_thresh = size;
        self
    }

    pub fn maximum_segments_storage_size(mut self, size: usize) -> Self {
        self.maximum_segments_storage_size = size;
        self
    }

    pub fn segments_storage_size_gc_threshold(mut self, frac: f64) -> Self {
        self.segments_storage_size_gc_threshold = frac;
        self
    }

    pub fn leaf_split_fill_frac(mut self, frac: f64) -> Self {
        self.leaf_split_fill_frac = frac;
        self
    }

    pub fn new_leaf_fill_frac(mut self, frac: f64) -> Self {
        self.new_leaf_fill_frac = frac;
        self
    }

    pub fn use_memtable_dynamic_filter(mut self, enabled: bool) -> Self {
        self.use_memtable_dynamic_filter = enabled;
        self
    }

    pub fn memtable_dynamic_filter_fp_rate(mut self, rate: f64) -> Self {
        self.memtable_dynamic_filter_fp_rate = rate;
        self
    }

    pub fn enable_leaf_read_opt(mut self, enabled: bool) -> Self {
        self.enable_leaf_read_opt = enabled;
        self
    }

    pub fn read_refresh_interval(mut self, interval: Duration) -> Self {
        self.read_refresh_interval = interval;
        self
    }

    pub fn nvmemtable_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.nvmemtable_file = path.into();
        self
    }

    pub fn nvmemtable_size(mut self, size: usize) -> Self {
        self.nvmemtable_size = size;
        self
    }

    pub fn nvmleafindex_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.nvmleafindex_file = path.into();
        self
    }

    pub fn nvmleafindex_size(mut self, size: usize) -> Self {
        self.nvmleafindex_size = size;
        self
    }

    pub fn split_leaf_num_threads(mut self, n: usize) -> Self {
        self.split_leaf_num_threads = n.max(1);
        self
    }

    pub fn compact_num_threads(mut self, n: usize) -> Self {
        self.compact_num_threads = n.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.write_buffer_size, 64 * MB);
        assert_eq!(opts.leaf_max_num_miniruns, 15);
        assert!(opts.use_memtable_dynamic_filter);
        assert_eq!(opts.maximum_segments_storage_size, 0);
    }

    #[test]
    fn test_options_builder() {
        let opts = Options::new("/tmp/loomdb_test")
            .write_buffer_size(MB)
            .leaf_max_num_miniruns(4)
            .compact_num_threads(0);

        assert_eq!(opts.dir, PathBuf::from("/tmp/loomdb_test"));
        assert_eq!(opts.write_buffer_size, MB);
        assert_eq!(opts.leaf_max_num_miniruns, 4);
        // Thread counts are clamped to at least one worker.
        assert_eq!(opts.compact_num_threads, 1);
    }

    #[test]
    fn test_pm_paths_default_into_dir() {
        let opts = Options::new("/tmp/loomdb_test");
        assert_eq!(
            opts.memtable_pm_path(),
            PathBuf::from("/tmp/loomdb_test/memtable.pm")
        );
        let opts = opts.nvmleafindex_file("/pmem/idx.pm");
        assert_eq!(opts.leafindex_pm_path(), PathBuf::from("/pmem/idx.pm"));
    }
}
