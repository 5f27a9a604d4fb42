//! Engine configuration (spec §6's configuration table).

use std::path::PathBuf;

use crate::compact::CompactionOptions;

/// Tuning knobs controlling the behavior of the LSM engine.
#[derive(Clone, Debug)]
pub struct LsmStorageOptions {
    /// Directory the engine stores WAL/SST/manifest files under.
    pub work_dir: PathBuf,
    /// Size, in bytes, at which the active memtable is sealed.
    pub mem_table_size: usize,
    /// Size, in bytes, at which a compaction output SST is rolled over.
    pub sstable_max_size: usize,
    /// Size of a single data block inside an SST.
    pub block_size: usize,
    /// Target false-positive rate for per-table Bloom filters. `0.0`
    /// explicitly disables the filter for a table (spec §9 Open Question).
    pub bloom_false_positive: f64,
    /// Target total size of the base level (L1) before deeper levels scale
    /// by `level_size_multiplier`.
    pub base_level_size: usize,
    /// Per-level size ratio used by the leveled compaction scorer.
    pub level_size_multiplier: usize,
    /// Target size of a single SST in the base level, before
    /// `table_size_multiplier` grows it per level.
    pub base_table_size: usize,
    /// Per-level table-size ratio.
    pub table_size_multiplier: usize,
    /// Number of L0 tables that triggers an L0->L1 compaction.
    pub num_level_zero_tables: usize,
    /// Maximum number of levels the level manager will grow to.
    pub max_level_num: usize,
    /// Number of background compaction worker threads.
    pub num_compactors: usize,
    /// Reserved: values larger than this move to a value log. Not
    /// implemented in core (spec's explicit "reserved, not implemented").
    pub value_threshold: usize,
    /// Reserved: target size of a value-log file.
    pub value_log_file_size: usize,
    /// Reserved: max entries per value-log file.
    pub value_log_max_entries: usize,
    /// Whether writes go through the WAL before the memtable.
    pub enable_wal: bool,
    /// Active compaction strategy.
    pub compaction_options: CompactionOptions,
}

impl LsmStorageOptions {
    /// Defaults tuned for tests and the demo CLI: small enough to exercise
    /// freeze/flush/compaction without huge fixtures.
    pub fn default_for_test(work_dir: impl Into<PathBuf>) -> Self {
        use crate::compact::LeveledCompactionOptions;

        Self {
            work_dir: work_dir.into(),
            mem_table_size: 4 << 20,
            sstable_max_size: 2 << 20,
            block_size: 4096,
            bloom_false_positive: 0.01,
            base_level_size: 64 << 20,
            level_size_multiplier: 4,
            base_table_size: 2 << 20,
            table_size_multiplier: 2,
            num_level_zero_tables: 2,
            max_level_num: 4,
            num_compactors: 1,
            value_threshold: 1 << 20,
            value_log_file_size: 256 << 20,
            value_log_max_entries: 1_000_000,
            enable_wal: true,
            compaction_options: CompactionOptions::Leveled(LeveledCompactionOptions {
                level_size_multiplier: 4,
                level0_file_num_compaction_threshold: 2,
                max_levels: 4,
                base_level_size_mb: 64,
            }),
        }
    }
}
