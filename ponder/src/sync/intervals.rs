// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Closed-closed block-range algebra backing the interval bookkeeping in the
//! sync store. Ranges are `(start, end)` with `start <= end`, both inclusive.

/// Normalize into pairwise-disjoint, sorted ranges. Adjacent ranges
/// (`[0,5], [6,9]`) merge; the result is independent of input order.
pub fn merge(mut intervals: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    intervals.retain(|(s, e)| s <= e);
    intervals.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
    for (start, end) in intervals {
        match merged.last_mut() {
            Some((_, last_end)) if start <= last_end.saturating_add(1) => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// The gaps of `requested` not covered by `cached`. `cached` must be
/// normalized (sorted, disjoint).
pub fn subtract(requested: (u64, u64), cached: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let (mut cursor, end) = requested;
    let mut gaps = Vec::new();
    for &(s, e) in cached {
        if e < cursor {
            continue;
        }
        if s > end {
            break;
        }
        if s > cursor {
            gaps.push((cursor, s - 1));
        }
        cursor = e.saturating_add(1);
        if cursor > end {
            return gaps;
        }
    }
    if cursor <= end {
        gaps.push((cursor, end));
    }
    gaps
}

/// Split a range into chunks of at most `max` blocks.
pub fn chunk(range: (u64, u64), max: u64) -> Vec<(u64, u64)> {
    let max = max.max(1);
    let (start, end) = range;
    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let chunk_end = cursor.saturating_add(max - 1).min(end);
        chunks.push((cursor, chunk_end));
        if chunk_end == u64::MAX {
            break;
        }
        cursor = chunk_end + 1;
    }
    chunks
}

/// Drop/truncate everything above `max_block`. Used by reorg pruning.
pub fn truncate(intervals: &[(u64, u64)], max_block: u64) -> Vec<(u64, u64)> {
    intervals
        .iter()
        .filter(|(s, _)| *s <= max_block)
        .map(|&(s, e)| (s, e.min(max_block)))
        .collect()
}

/// The end of the contiguous cached prefix beginning at `start`, if any.
pub fn contiguous_prefix_end(start: u64, cached: &[(u64, u64)]) -> Option<u64> {
    cached
        .iter()
        .find(|(s, e)| *s <= start && start <= *e)
        .map(|(_, e)| *e)
}
