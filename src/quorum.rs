/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Byzantine-majority voting over collections of votes.
//!
//! A vote only counts towards a majority if it appears strictly more than `threshold` times:
//! with `threshold = f`, the winning vote is then backed by at least `f + 1` replicas, at least
//! one of which is correct.

use std::collections::HashMap;
use std::hash::Hash;

/// The most frequent vote, provided it appears more than `threshold` times. Ties between
/// equally frequent votes resolve to whichever reached the winning count first.
pub fn majority<T: Clone + Eq + Hash>(votes: &[T], threshold: u64) -> Option<T> {
    let mut tally: HashMap<&T, u64> = HashMap::new();
    let mut best: Option<(&T, u64)> = None;
    for vote in votes {
        let count = tally.entry(vote).or_insert(0);
        *count += 1;
        match best {
            Some((_, best_count)) if *count <= best_count => {}
            _ => best = Some((vote, *count)),
        }
    }
    match best {
        Some((vote, count)) if count > threshold => Some(vote.clone()),
        _ => None,
    }
}

/// Like [majority], but falls back to `default` when no vote clears the threshold.
pub fn majority_or<T: Clone + Eq + Hash>(votes: &[T], threshold: u64, default: T) -> T {
    majority(votes, threshold).unwrap_or(default)
}
