//! Choosing what to compact next.
//!
//! Each strategy turns the current [`Version`] into an ordered list of
//! candidates. The first candidate that does not conflict with a running job
//! is returned.
//!
//! ## Leveled
//!
//! Every level gets a score: L0 by table count against
//! `level0_file_num_compaction_trigger`, deeper levels by bytes against
//! `max_bytes_for_level`. Levels scoring at least 1 are tried highest score
//! first. L0 merges all of its tables with the overlapping part of L1. A
//! deeper level merges one table, chosen round-robin through a per-level
//! cursor, with the overlapping tables of the next level.
//!
//! ## Tiered
//!
//! L0 past its trigger is merged whole with L1. A deeper level holding at
//! least `max_tables_per_level` tables is merged whole into the next level
//! when it is the deepest populated level or at least `size_ratio_threshold`
//! times the size of the next one. The bottom level is rewritten in place
//! when that would shrink its table count.

use std::sync::Arc;

use super::Reservations;
use crate::config::{CompactionOptions, CompactionStrategy};
use crate::store::lsm::manifest::SSTable;
use crate::store::lsm::state::{Version, NUM_LEVELS};

/// Tables selected for one merge.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub source_level: u32,
    pub target_level: u32,
    /// Newest data first: source tables, then target tables.
    pub inputs: Vec<Arc<SSTable>>,
}

impl Candidate {
    pub fn table_ids(&self) -> Vec<u64> {
        self.inputs.iter().map(|t| t.id()).collect()
    }

    /// Union of the inputs' user key ranges.
    pub fn key_range(&self) -> (Vec<u8>, Vec<u8>) {
        let min = self.inputs.iter().map(|t| &t.meta.min_key).min();
        let max = self.inputs.iter().map(|t| &t.meta.max_key).max();
        (
            min.cloned().unwrap_or_default(),
            max.cloned().unwrap_or_default(),
        )
    }

    pub fn input_bytes(&self) -> u64 {
        self.inputs.iter().map(|t| t.size()).sum()
    }
}

/// Round-robin position per level: the largest key of the last table picked.
pub type Cursors = Vec<Vec<u8>>;

pub fn pick(
    version: &Version,
    options: &CompactionOptions,
    target_file_size: u64,
    reservations: &Reservations,
    cursors: &mut Cursors,
) -> Option<Candidate> {
    cursors.resize(NUM_LEVELS, Vec::new());
    match options.strategy {
        CompactionStrategy::Leveled => pick_leveled(version, options, reservations, cursors),
        CompactionStrategy::Tiered => pick_tiered(version, options, target_file_size, reservations),
        CompactionStrategy::None => None,
    }
}

/// Whether any level is over its threshold, ignoring running jobs.
pub fn needs_compaction(version: &Version, options: &CompactionOptions, target_file_size: u64) -> bool {
    let mut cursors = Cursors::new();
    pick(
        version,
        options,
        target_file_size,
        &Reservations::default(),
        &mut cursors,
    )
    .is_some()
}

fn level0_candidate(version: &Version) -> Option<Candidate> {
    let level0 = version.level(0);
    if level0.is_empty() {
        return None;
    }
    let mut candidate = Candidate {
        source_level: 0,
        target_level: 1,
        inputs: level0.sstables.iter().rev().cloned().collect(),
    };
    let (min, max) = candidate.key_range();
    candidate.inputs.extend(version.level(1).overlapping(&min, &max));
    Some(candidate)
}

fn pick_leveled(
    version: &Version,
    options: &CompactionOptions,
    reservations: &Reservations,
    cursors: &mut Cursors,
) -> Option<Candidate> {
    let mut scores: Vec<(f64, u32)> = Vec::new();
    let trigger = options.level0_file_num_compaction_trigger.max(1);
    scores.push((version.l0_count() as f64 / trigger as f64, 0));
    for level in 1..NUM_LEVELS - 1 {
        let budget = options.max_bytes_for_level(level).max(1);
        scores.push((version.levels[level].size() as f64 / budget as f64, level as u32));
    }
    scores.sort_by(|a, b| b.0.total_cmp(&a.0));

    for (score, level) in scores {
        if score < 1.0 {
            break;
        }
        let candidate = if level == 0 {
            level0_candidate(version).filter(|c| !reservations.conflicts(c))
        } else {
            pick_round_robin(version, level, reservations, cursors)
        };
        if candidate.is_some() {
            return candidate;
        }
    }
    None
}

/// First table after the level's cursor, wrapping, whose merge is free to run.
fn pick_round_robin(
    version: &Version,
    level: u32,
    reservations: &Reservations,
    cursors: &mut Cursors,
) -> Option<Candidate> {
    let tables = &version.level(level).sstables;
    let cursor = &cursors[level as usize];
    let start = tables.partition_point(|t| t.meta.min_key.as_slice() <= cursor.as_slice());
    let start = if start >= tables.len() { 0 } else { start };

    for offset in 0..tables.len() {
        let table = &tables[(start + offset) % tables.len()];
        let mut candidate = Candidate {
            source_level: level,
            target_level: level + 1,
            inputs: vec![table.clone()],
        };
        candidate.inputs.extend(
            version
                .level(level + 1)
                .overlapping(&table.meta.min_key, &table.meta.max_key),
        );
        if !reservations.conflicts(&candidate) {
            cursors[level as usize] = table.meta.max_key.clone();
            return Some(candidate);
        }
    }
    None
}

fn pick_tiered(
    version: &Version,
    options: &CompactionOptions,
    target_file_size: u64,
    reservations: &Reservations,
) -> Option<Candidate> {
    if version.l0_count() >= options.level0_file_num_compaction_trigger.max(1) {
        if let Some(candidate) = level0_candidate(version) {
            let mut candidate = candidate;
            // Tiered merges the whole of L1, not only the overlapping part.
            candidate.inputs.truncate(version.l0_count());
            candidate
                .inputs
                .extend(version.level(1).sstables.iter().cloned());
            if !reservations.conflicts(&candidate) {
                return Some(candidate);
            }
        }
    }

    let deepest = version
        .levels
        .iter()
        .rposition(|l| !l.is_empty())
        .unwrap_or(0);

    for level in 1..NUM_LEVELS {
        let current = &version.levels[level];
        if current.len() < options.max_tables_per_level.max(1) {
            continue;
        }

        let candidate = if level == NUM_LEVELS - 1 {
            // Rewriting the bottom level only helps if it packs into fewer tables.
            let packed = current.size().div_ceil(target_file_size.max(1)) as usize;
            if packed >= current.len() {
                continue;
            }
            Candidate {
                source_level: level as u32,
                target_level: level as u32,
                inputs: current.sstables.clone(),
            }
        } else {
            let next = &version.levels[level + 1];
            let oversized = current.size()
                >= next.size().max(1) * options.size_ratio_threshold as u64;
            if level != deepest && !oversized {
                continue;
            }
            let mut inputs = current.sstables.clone();
            inputs.extend(next.sstables.iter().cloned());
            Candidate {
                source_level: level as u32,
                target_level: level as u32 + 1,
                inputs,
            }
        };

        if !reservations.conflicts(&candidate) {
            return Some(candidate);
        }
    }
    None
}
