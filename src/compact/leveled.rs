//! Leveled compaction (spec §4.J): each level Li (i >= 1) holds
//! non-overlapping SSTs sorted by key range. A level is compacted once its
//! total size exceeds a target computed top-down from the bottom level, and
//! L0 is flushed into the base level once it accumulates too many tables.

#![allow(unused)]

use serde::{Deserialize, Serialize};

use crate::lsm_storage::LsmStorageState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeveledCompactionTask {
    /// `None` means the upper input is L0, not a numbered level.
    pub upper_level: Option<usize>,
    pub upper_level_sst_ids: Vec<usize>,
    pub lower_level: usize,
    pub lower_level_sst_ids: Vec<usize>,
    pub is_lower_level_bottom_level: bool,
}

pub struct LeveledCompactionController {
    options: LeveledCompactionOptions,
}

#[derive(Debug, Clone)]
pub struct LeveledCompactionOptions {
    pub level_size_multiplier: usize,
    pub level0_file_num_compaction_threshold: usize,
    pub max_levels: usize,
    pub base_level_size_mb: usize,
}

impl LeveledCompactionController {
    pub fn new(options: LeveledCompactionOptions) -> Self {
        Self { options }
    }

    /// SSTs in `in_level` whose key range overlaps `[begin_key, end_key]`.
    fn find_overlapping_ssts(
        &self,
        snapshot: &LsmStorageState,
        sst_ids: &[usize],
        in_level: usize,
    ) -> Vec<usize> {
        let Some(begin_key) = sst_ids.iter().map(|id| snapshot.sstables[id].first_key()).min() else {
            return Vec::new();
        };
        let end_key = sst_ids
            .iter()
            .map(|id| snapshot.sstables[id].last_key())
            .max()
            .unwrap();
        let mut overlap = Vec::new();
        for sst_id in &snapshot.levels[in_level - 1].1 {
            let sst = &snapshot.sstables[sst_id];
            if !(sst.last_key() < begin_key || sst.first_key() > end_key) {
                overlap.push(*sst_id);
            }
        }
        overlap
    }

    /// Sum of `stale_data_size` across every SST currently in `level`
    /// (1-indexed). A lower bound on the bytes a full compaction of this
    /// level would reclaim; used to break ties between equally-overflowing
    /// levels and to pick which table within a level is worth compacting
    /// first.
    fn level_stale_data_size(&self, snapshot: &LsmStorageState, level: usize) -> u64 {
        snapshot.levels[level - 1]
            .1
            .iter()
            .map(|id| snapshot.sstables[id].stale_data_size())
            .sum()
    }

    /// Target byte size of each level (1-indexed; index 0 unused), computed
    /// bottom-up: the bottom level's target is its own actual size (floored
    /// at `base_level_size`), and each level above divides by
    /// `level_size_multiplier`, floored at zero once it drops below
    /// `base_level_size`.
    fn target_level_sizes(&self, level_actual_sizes: &[usize]) -> Vec<usize> {
        let base_level_size_bytes = self.options.base_level_size_mb * 1024 * 1024;
        let mut target = vec![0usize; self.options.max_levels + 1];
        target[self.options.max_levels] =
            level_actual_sizes[self.options.max_levels].max(base_level_size_bytes);
        for level in (1..self.options.max_levels).rev() {
            let next = target[level + 1] / self.options.level_size_multiplier;
            target[level] = if next < base_level_size_bytes { 0 } else { next };
        }
        target
    }

    pub fn generate_compaction_task(
        &self,
        snapshot: &LsmStorageState,
    ) -> Option<LeveledCompactionTask> {
        let mut level_actual_sizes = vec![0usize; self.options.max_levels + 1];
        for (level, sst_ids) in &snapshot.levels {
            level_actual_sizes[*level] = sst_ids
                .iter()
                .map(|id| snapshot.sstables[id].table_size() as usize)
                .sum();
        }

        if snapshot.l0_sstables.len() >= self.options.level0_file_num_compaction_threshold {
            let target = self.target_level_sizes(&level_actual_sizes);
            let lower_level = target
                .iter()
                .enumerate()
                .skip(1)
                .find(|(_, &size)| size > 0)
                .map(|(level, _)| level)
                .unwrap_or(self.options.max_levels);
            return Some(LeveledCompactionTask {
                upper_level: None,
                upper_level_sst_ids: snapshot.l0_sstables.clone(),
                lower_level_sst_ids: self.find_overlapping_ssts(
                    snapshot,
                    &snapshot.l0_sstables,
                    lower_level,
                ),
                lower_level,
                is_lower_level_bottom_level: lower_level == self.options.max_levels,
            });
        }

        let target = self.target_level_sizes(&level_actual_sizes);
        let mut worst: Option<(usize, f64, u64)> = None;
        for level in 1..self.options.max_levels {
            if target[level] == 0 {
                continue;
            }
            let priority = level_actual_sizes[level] as f64 / target[level] as f64;
            if priority <= 1.0 {
                continue;
            }
            let stale = self.level_stale_data_size(snapshot, level);
            let better = match worst {
                None => true,
                // A level further over its target wins; a near-tie is
                // broken by whichever level has more reclaimable stale data.
                Some((_, best_priority, best_stale)) => {
                    (priority - best_priority).abs() > 0.05
                        && priority > best_priority
                        || (priority - best_priority).abs() <= 0.05 && stale > best_stale
                }
            };
            if better {
                worst = Some((level, priority, stale));
            }
        }
        let (level, _, _) = worst?;
        // The table carrying the most shadowed data reclaims the most space
        // per compaction; ties fall back to oldest (lowest id) first.
        let victim = *snapshot.levels[level - 1]
            .1
            .iter()
            .max_by_key(|id| (snapshot.sstables[id].stale_data_size(), std::cmp::Reverse(**id)))?;
        let lower_level = level + 1;
        Some(LeveledCompactionTask {
            upper_level: Some(level),
            upper_level_sst_ids: vec![victim],
            lower_level_sst_ids: self.find_overlapping_ssts(snapshot, &[victim], lower_level),
            lower_level,
            is_lower_level_bottom_level: lower_level == self.options.max_levels,
        })
    }

    pub fn apply_compaction_result(
        &self,
        snapshot: &LsmStorageState,
        task: &LeveledCompactionTask,
        output: &[usize],
    ) -> (LsmStorageState, Vec<usize>) {
        let mut snapshot = snapshot.clone();
        let mut files_to_remove = Vec::new();

        match task.upper_level {
            Some(upper_level) => {
                let upper_ids: std::collections::HashSet<_> =
                    task.upper_level_sst_ids.iter().copied().collect();
                let (_, files) = &mut snapshot.levels[upper_level - 1];
                let before = files.len();
                files.retain(|id| !upper_ids.contains(id));
                assert_eq!(before - files.len(), task.upper_level_sst_ids.len());
                files_to_remove.extend(&task.upper_level_sst_ids);
            }
            None => {
                let upper_ids: std::collections::HashSet<_> =
                    task.upper_level_sst_ids.iter().copied().collect();
                snapshot.l0_sstables.retain(|id| !upper_ids.contains(id));
                files_to_remove.extend(&task.upper_level_sst_ids);
            }
        }

        let lower_ids: std::collections::HashSet<_> =
            task.lower_level_sst_ids.iter().copied().collect();
        let (_, files) = &mut snapshot.levels[task.lower_level - 1];
        files.retain(|id| !lower_ids.contains(id));
        files_to_remove.extend(&task.lower_level_sst_ids);
        files.extend(output);
        files.sort_by(|a, b| {
            snapshot.sstables[a]
                .first_key()
                .cmp(snapshot.sstables[b].first_key())
        });

        (snapshot, files_to_remove)
    }
}
