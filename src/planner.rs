//! Chunk planner (§4.D): translates a total length and any prior chunk
//! checkpoints into an ordered set of range jobs that partition the
//! outstanding bytes with no overlaps and no gaps.

use serde::{Deserialize, Serialize};

use crate::config::Chunking;

/// A persisted per-chunk checkpoint. `next_offset == end_inclusive + 1`
/// (when bounded) means the chunk is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkState {
    pub index: u32,
    pub start: u64,
    pub end_inclusive: Option<u64>,
    pub next_offset: u64,
}

impl ChunkState {
    pub fn is_complete(&self) -> bool {
        match self.end_inclusive {
            Some(end) => self.next_offset == end + 1,
            None => false,
        }
    }

    /// Bytes this chunk has written so far (`next_offset - start`).
    pub fn completed_bytes(&self) -> u64 {
        self.next_offset.saturating_sub(self.start)
    }
}

/// A chunk still needing work, handed to the range fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub index: u32,
    pub start: u64,
    pub end_inclusive: Option<u64>,
    pub resume_offset: u64,
}

impl ChunkPlan {
    fn to_state(self) -> ChunkState {
        ChunkState {
            index: self.index,
            start: self.start,
            end_inclusive: self.end_inclusive,
            next_offset: self.resume_offset,
        }
    }
}

pub struct ChunkPlanner;

impl ChunkPlanner {
    /// Build the plan for a fresh or resuming attempt.
    ///
    /// - `total_bytes`: known content length, if any.
    /// - `start_offset`: bytes already downloaded with no per-chunk detail
    ///   (used when resuming a single unbounded stream, or a checksum-forced
    ///   restart sets this to 0).
    /// - `prior_states`: per-chunk checkpoints from a previous attempt, if
    ///   any — takes precedence over `start_offset` when both are present.
    pub fn plan(
        total_bytes: Option<u64>,
        chunking: &Chunking,
        start_offset: u64,
        prior_states: &[ChunkState],
    ) -> Vec<ChunkPlan> {
        let Some(total_bytes) = total_bytes.filter(|&t| t > 0) else {
            return vec![ChunkPlan {
                index: 0,
                start: start_offset.max(0),
                end_inclusive: None,
                resume_offset: start_offset.max(0),
            }];
        };

        let ranges = Self::partition(total_bytes, chunking);

        if !prior_states.is_empty() {
            return Self::apply_prior_states(ranges, prior_states);
        }

        if start_offset > 0 {
            return Self::apply_start_offset(ranges, start_offset, total_bytes);
        }

        ranges
            .into_iter()
            .map(|(index, start, end_inclusive)| ChunkPlan {
                index,
                start,
                end_inclusive: Some(end_inclusive),
                resume_offset: start,
            })
            .collect()
    }

    /// Divide `[0, total_bytes)` into `count` contiguous half-open slices;
    /// the last slice absorbs any remainder.
    fn partition(total_bytes: u64, chunking: &Chunking) -> Vec<(u32, u64, u64)> {
        let effective = chunking.min_chunk_size_bytes.max(total_bytes / chunking.chunk_count.max(1) as u64).max(1);
        let ideal_count = total_bytes.div_ceil(effective);
        let count = ideal_count.clamp(1, chunking.chunk_count as u64) as u32;

        let slice_size = total_bytes / count as u64;
        let mut ranges = Vec::with_capacity(count as usize);
        let mut start = 0u64;

        for index in 0..count {
            let end_inclusive = if index == count - 1 {
                total_bytes - 1
            } else {
                start + slice_size - 1
            };
            ranges.push((index, start, end_inclusive));
            start = end_inclusive + 1;
        }

        ranges
    }

    fn apply_prior_states(
        ranges: Vec<(u32, u64, u64)>,
        prior_states: &[ChunkState],
    ) -> Vec<ChunkPlan> {
        ranges
            .into_iter()
            .filter_map(|(index, start, end_inclusive)| {
                let resume_offset = prior_states
                    .iter()
                    .find(|s| s.index == index)
                    .map(|s| s.next_offset.clamp(start, end_inclusive + 1))
                    .unwrap_or(start);

                if resume_offset >= end_inclusive + 1 {
                    None
                } else {
                    Some(ChunkPlan {
                        index,
                        start,
                        end_inclusive: Some(end_inclusive),
                        resume_offset,
                    })
                }
            })
            .collect()
    }

    fn apply_start_offset(
        ranges: Vec<(u32, u64, u64)>,
        start_offset: u64,
        total_bytes: u64,
    ) -> Vec<ChunkPlan> {
        let plans: Vec<ChunkPlan> = ranges
            .into_iter()
            .filter(|&(_, _, end_inclusive)| start_offset <= end_inclusive)
            .map(|(index, start, end_inclusive)| {
                let resume_offset = if start_offset >= start && start_offset <= end_inclusive {
                    start_offset
                } else {
                    start
                };
                ChunkPlan {
                    index,
                    start,
                    end_inclusive: Some(end_inclusive),
                    resume_offset,
                }
            })
            .collect();

        if plans.is_empty() {
            let tail_start = start_offset.min(total_bytes.saturating_sub(1));
            return vec![ChunkPlan {
                index: 0,
                start: tail_start,
                end_inclusive: Some(total_bytes - 1),
                resume_offset: tail_start,
            }];
        }

        plans
    }

    /// Snapshot of a freshly planned attempt's initial chunk states, used
    /// by the checkpoint updater before any bytes have been written.
    pub fn initial_states(plans: &[ChunkPlan]) -> Vec<ChunkState> {
        plans.iter().map(|p| p.to_state()).collect()
    }
}
