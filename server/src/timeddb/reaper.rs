/*
 * This file is part of ktd, a networked, expiration-aware key-value
 * cache server with master/slave replication.
 *
 * Copyright (c) 2024, ktd contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The lazy expiration reaper (§4.D.4): an opportunistic sweep that
//! piggybacks on regular operations rather than running on its own timer.
//! Every mutating/read/iterating operation nudges an atomic `score`
//! forward; once the score crosses a threshold, the next caller to
//! observe that (under a try-lock, so contending callers just accumulate
//! and return) drains a batch of steps off the expiration cursor.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

pub const SCORE_UNIT: i64 = 256;
pub const READ_FREQ: i64 = 32;
pub const ITER_FREQ: i64 = 4;
pub const STEP_UNIT: i64 = 8;

const ORD: Ordering = Ordering::SeqCst;

/// The reaper's mutable state: the accumulated score and the position of
/// the expiration-sweep cursor (by key; `None` means "wrapped around, not
/// yet repositioned").
pub struct ReaperState {
    score: AtomicI64,
    cursor: Mutex<Option<Vec<u8>>>,
}

impl Default for ReaperState {
    fn default() -> Self {
        Self {
            score: AtomicI64::new(0),
            cursor: Mutex::new(None),
        }
    }
}

impl ReaperState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mutate(&self) {
        self.score.fetch_add(SCORE_UNIT, ORD);
    }

    pub fn add_read(&self) {
        self.score.fetch_add(SCORE_UNIT / READ_FREQ, ORD);
    }

    pub fn add_iter(&self, scanned: usize) {
        let delta = (scanned as i64 * SCORE_UNIT) / ITER_FREQ;
        self.score.fetch_add(delta, ORD);
    }

    /// If the accumulated score has crossed the drain threshold, take a
    /// try-lock on the cursor and return the number of steps to drain and
    /// a guard over the cursor position. Returns `None` when the
    /// threshold hasn't been crossed or another caller already holds the
    /// try-lock (the reaper is opportunistic: contention means "someone
    /// else will deal with it, or it'll be picked up next time").
    pub fn try_begin_drain(&self) -> Option<(i64, std::sync::MutexGuard<'_, Option<Vec<u8>>>)> {
        let score = self.score.load(ORD);
        if score < SCORE_UNIT * STEP_UNIT {
            return None;
        }
        let guard = self.cursor.try_lock().ok()?;
        let steps = score / SCORE_UNIT;
        self.score.fetch_sub(steps * SCORE_UNIT, ORD);
        Some((steps, guard))
    }

    /// Used by capacity eviction, which always wants to drain regardless
    /// of the opportunistic threshold; blocks instead of try-locking since
    /// capacity bounds are a hard invariant (§8 property 5), not best
    /// effort.
    pub fn force_begin_drain(&self) -> std::sync::MutexGuard<'_, Option<Vec<u8>>> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_and_drains_above_threshold() {
        let r = ReaperState::new();
        for _ in 0..(STEP_UNIT - 1) {
            r.add_mutate();
        }
        assert!(r.try_begin_drain().is_none());
        r.add_mutate();
        let (steps, _guard) = r.try_begin_drain().unwrap();
        assert_eq!(steps, STEP_UNIT);
    }

    #[test]
    fn read_contributes_a_fraction_of_a_mutate() {
        let r = ReaperState::new();
        for _ in 0..(STEP_UNIT * READ_FREQ as i64) {
            r.add_read();
        }
        let (steps, _guard) = r.try_begin_drain().unwrap();
        assert_eq!(steps, STEP_UNIT);
    }
}
