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

//! Bulk and search operations layered on top of the basic verbs in
//! [`super`]: prefix/regex/similarity matching, parallel full scans,
//! cross-db copy, and cursor stepping. Kept in a separate module so
//! `mod.rs` stays focused on the single-key verbs and the reaper/eviction
//! machinery.

use super::cursor::{Cursor, Direction};
use super::value::{is_expired, modify_exp_time};
use super::{TimedDb, UpdateOp};
use crate::errors::{KtError, KtResult};
use crate::util::now_epoch_seconds;
use std::sync::Arc;

impl TimedDb {
    /// Bulk set (§3 RPC `set_bulk`). In atomic mode every record is written
    /// under a single write-lock hold and logged only once the whole batch
    /// has landed, so a reader never observes a partial batch; in
    /// non-atomic mode each record goes through the ordinary `set` path and
    /// a failing record is simply skipped, matching the "one call per key"
    /// semantics for non-atomic bulk ops.
    pub fn set_bulk(&self, records: &[(Vec<u8>, Vec<u8>, i64)], atomic: bool) -> KtResult<u64> {
        self.ensure_open()?;
        if !atomic {
            let mut applied = 0u64;
            for (key, value, xt) in records {
                if self.set(key, value, *xt).is_ok() {
                    applied += 1;
                }
            }
            return Ok(applied);
        }

        let now = now_epoch_seconds();
        let mut logged = Vec::with_capacity(records.len());
        self.with_write_lock(|engine| {
            for (key, value, xt) in records {
                let xt = modify_exp_time(*xt, now);
                let stored = self.pack_for_store(value, xt);
                engine.set(key.clone(), stored);
                logged.push(UpdateOp::Set {
                    key: key.clone(),
                    value: value.clone(),
                    xt,
                });
            }
            Ok(())
        })?;
        for op in logged {
            self.log(op);
        }
        self.reaper.add_mutate();
        self.maybe_reap();
        self.maybe_evict();
        Ok(records.len() as u64)
    }

    /// Bulk remove (§3 RPC `remove_bulk`). Returns the number of keys that
    /// actually existed and were removed.
    pub fn remove_bulk(&self, keys: &[Vec<u8>]) -> KtResult<u64> {
        self.ensure_open()?;
        let mut removed = 0u64;
        for key in keys {
            if self.remove(key).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Bulk get (§3 RPC `get_bulk`). Missing keys are simply absent from
    /// the result rather than failing the whole batch.
    pub fn get_bulk(&self, keys: &[Vec<u8>]) -> KtResult<Vec<(Vec<u8>, Vec<u8>, i64)>> {
        self.ensure_open()?;
        let mut out = Vec::new();
        for key in keys {
            if let Ok((value, xt)) = self.get(key) {
                out.push((key.clone(), value, xt));
            }
        }
        Ok(out)
    }
    /// All live keys with the given prefix, in key order.
    pub fn match_prefix(&self, prefix: &[u8], limit: Option<usize>) -> KtResult<Vec<Vec<u8>>> {
        self.live_keys_matching(limit, |guard| {
            guard
                .keys_with_prefix(prefix)
                .cloned()
                .collect::<Vec<_>>()
                .into_iter()
        })
    }

    /// All live keys matching `pattern`, compiled as a regular expression
    /// over the raw key bytes interpreted as UTF-8 (non-UTF-8 keys never
    /// match, rather than erroring the whole scan).
    pub fn match_regex(&self, pattern: &str, limit: Option<usize>) -> KtResult<Vec<Vec<u8>>> {
        let re = regex::bytes::Regex::new(pattern)
            .map_err(|e| KtError::invalid(format!("bad regex: {e}")))?;
        self.live_keys_matching(limit, move |guard| {
            guard
                .iter()
                .map(|(k, _)| k.clone())
                .filter(|k| re.is_match(k))
                .collect::<Vec<_>>()
                .into_iter()
        })
    }

    /// All live keys within `max_distance` Levenshtein edit operations of
    /// `target`. When `utf` is set, distance is computed over decoded
    /// UCS-4 (`char`) sequences rather than raw bytes, so multi-byte
    /// characters count as a single edit.
    pub fn match_similar(
        &self,
        target: &[u8],
        max_distance: usize,
        utf: bool,
        limit: Option<usize>,
    ) -> KtResult<Vec<Vec<u8>>> {
        let target_chars: Vec<char>;
        let target_units: Vec<u32> = if utf {
            let s = std::str::from_utf8(target)
                .map_err(|_| KtError::invalid("target is not valid UTF-8"))?;
            target_chars = s.chars().collect();
            target_chars.iter().map(|c| *c as u32).collect()
        } else {
            target_chars = Vec::new();
            target.iter().map(|b| *b as u32).collect()
        };
        self.live_keys_matching(limit, move |guard| {
            guard
                .iter()
                .map(|(k, _)| k.clone())
                .filter(|k| {
                    let units: Vec<u32> = if utf {
                        match std::str::from_utf8(k) {
                            Ok(s) => s.chars().map(|c| c as u32).collect(),
                            Err(_) => return false,
                        }
                    } else {
                        k.iter().map(|b| *b as u32).collect()
                    };
                    levenshtein(&target_units, &units) <= max_distance
                })
                .collect::<Vec<_>>()
                .into_iter()
        })
    }

    fn live_keys_matching<I>(
        &self,
        limit: Option<usize>,
        select: impl FnOnce(&super::kvengine::MemEngine) -> I,
    ) -> KtResult<Vec<Vec<u8>>>
    where
        I: Iterator<Item = Vec<u8>>,
    {
        self.ensure_open()?;
        let now = now_epoch_seconds();
        let guard = self.read_guard();
        let mut out = Vec::new();
        for key in select(&guard) {
            if let Some(stored) = guard.get(&key) {
                if let Ok((xt, _)) = self.unpack_stored(stored) {
                    if !is_expired(xt, now) {
                        out.push(key);
                        if let Some(limit) = limit {
                            if out.len() >= limit {
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.reaper.add_iter(out.len());
        Ok(out)
    }

    /// Scans the whole keyspace concurrently over `workers` key-range
    /// chunks, invoking `f` with each live `(key, value)` pair. Chunk
    /// boundaries are computed from a sorted snapshot of keys taken up
    /// front, so `f` never observes a key twice even if the map is
    /// mutated mid-scan.
    pub fn scan_parallel<F>(&self, workers: usize, f: F) -> KtResult<()>
    where
        F: Fn(&[u8], &[u8]) + Send + Sync,
    {
        self.ensure_open()?;
        let now = now_epoch_seconds();
        let keys: Vec<Vec<u8>> = {
            let guard = self.read_guard();
            guard.iter().map(|(k, _)| k.clone()).collect()
        };
        if keys.is_empty() {
            return Ok(());
        }
        let workers = workers.max(1).min(keys.len());
        let chunk_size = keys.len().div_ceil(workers);
        std::thread::scope(|scope| {
            for chunk in keys.chunks(chunk_size) {
                let f = &f;
                scope.spawn(move || {
                    for key in chunk {
                        let guard = self.read_guard();
                        if let Some(stored) = guard.get(key) {
                            if let Ok((xt, payload)) = self.unpack_stored(stored) {
                                if !is_expired(xt, now) {
                                    f(key, payload);
                                }
                            }
                        }
                    }
                });
            }
        });
        self.reaper.add_iter(keys.len());
        Ok(())
    }

    /// Copies every live record into `dest` verbatim (including each
    /// record's own expiration), used by the `copy` RPC to clone a
    /// database into a fresh one before a heavyweight migration.
    pub fn copy_into(&self, dest: &Arc<TimedDb>) -> KtResult<u64> {
        self.ensure_open()?;
        dest.ensure_open()?;
        let now = now_epoch_seconds();
        let mut copied = 0u64;
        let records: Vec<(Vec<u8>, i64, Vec<u8>)> = {
            let guard = self.read_guard();
            guard
                .iter()
                .filter_map(|(k, stored)| {
                    let (xt, payload) = self.unpack_stored(stored).ok()?;
                    if is_expired(xt, now) {
                        None
                    } else {
                        Some((k.clone(), xt, payload.to_vec()))
                    }
                })
                .collect()
        };
        for (key, xt, value) in records {
            // xt is already absolute; pass it through modify_exp_time's
            // "negative means absolute" convention via its magnitude.
            dest.set(&key, &value, -xt)?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Runs `body` with the engine's write lock held for its whole
    /// duration, so every op inside observes and produces a single atomic
    /// unit (`beginTransaction`/`endTransaction`, §4.D.3).
    pub fn with_write_lock<F, R>(&self, body: F) -> KtResult<R>
    where
        F: FnOnce(&mut super::kvengine::MemEngine) -> KtResult<R>,
    {
        self.ensure_open()?;
        let mut guard = self.write_guard();
        body(&mut guard)
    }

    // ---- cursor stepping -------------------------------------------------

    /// Repositions `cursor` to the next (or, in `Backward` mode, previous)
    /// live key from its current position, skipping and reaping any
    /// expired records it passes over.
    pub fn cur_step(&self, cursor: &mut Cursor) -> KtResult<Option<(Vec<u8>, Vec<u8>, i64)>> {
        self.ensure_open()?;
        if !cursor.is_valid() {
            return Err(KtError::invalid("cursor invalidated by a db close"));
        }
        let now = now_epoch_seconds();
        loop {
            let mut guard = self.write_guard();
            let next = match cursor.direction() {
                Direction::Forward => guard.next_key_after(cursor.position()),
                Direction::Backward => guard.prev_key_before(cursor.position()),
            };
            let Some(key) = next else {
                cursor.set_position(None);
                return Ok(None);
            };
            cursor.set_position(Some(key.clone()));
            let stored = match guard.get(&key) {
                Some(s) => s.to_vec(),
                None => continue,
            };
            let (xt, payload) = match self.unpack_stored(&stored) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if is_expired(xt, now) {
                guard.remove(&key);
                continue;
            }
            return Ok(Some((key, payload.to_vec(), xt)));
        }
    }

    /// Jumps `cursor` to sit just before `key`, stepping forward from
    /// there on, without reading a record.
    pub fn cur_jump(&self, cursor: &mut Cursor, key: Option<&[u8]>) -> KtResult<()> {
        self.ensure_open()?;
        cursor.set_direction(Direction::Forward);
        cursor.set_position(key.map(|k| k.to_vec()));
        Ok(())
    }

    /// Jumps `cursor` to sit just after `key`, stepping backward from
    /// there on (`cur_jump_back` RPC).
    pub fn cur_jump_back(&self, cursor: &mut Cursor, key: Option<&[u8]>) -> KtResult<()> {
        self.ensure_open()?;
        cursor.set_direction(Direction::Backward);
        cursor.set_position(key.map(|k| k.to_vec()));
        Ok(())
    }

    /// Repositions `cursor` to the previous live key regardless of its own
    /// configured direction (`cur_step_back` RPC) — the mirror image of
    /// `cur_step`'s forward-only sibling.
    pub fn cur_step_back(&self, cursor: &mut Cursor) -> KtResult<Option<(Vec<u8>, Vec<u8>, i64)>> {
        self.ensure_open()?;
        if !cursor.is_valid() {
            return Err(KtError::invalid("cursor invalidated by a db close"));
        }
        let now = now_epoch_seconds();
        loop {
            let mut guard = self.write_guard();
            let Some(key) = guard.prev_key_before(cursor.position()) else {
                cursor.set_position(None);
                return Ok(None);
            };
            cursor.set_position(Some(key.clone()));
            let stored = match guard.get(&key) {
                Some(s) => s.to_vec(),
                None => continue,
            };
            let (xt, payload) = match self.unpack_stored(&stored) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if is_expired(xt, now) {
                guard.remove(&key);
                continue;
            }
            return Ok(Some((key, payload.to_vec(), xt)));
        }
    }

    /// Reads the record at `cursor`'s current position without moving it
    /// (`cur_get` RPC). `None` if the cursor carries no position (hasn't
    /// stepped yet, or just walked off the end).
    pub fn cur_get(&self, cursor: &Cursor) -> KtResult<Option<(Vec<u8>, Vec<u8>, i64)>> {
        self.ensure_open()?;
        let Some(key) = cursor.position() else {
            return Ok(None);
        };
        match self.get(key) {
            Ok((value, xt)) => Ok(Some((key.to_vec(), value, xt))),
            Err(KtError::NoRec) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `cur_get_key` RPC: just the key half of `cur_get`.
    pub fn cur_get_key(&self, cursor: &Cursor) -> KtResult<Option<Vec<u8>>> {
        Ok(self.cur_get(cursor)?.map(|(k, _, _)| k))
    }

    /// `cur_get_value` RPC: just the value half of `cur_get`.
    pub fn cur_get_value(&self, cursor: &Cursor) -> KtResult<Option<Vec<u8>>> {
        Ok(self.cur_get(cursor)?.map(|(_, v, _)| v))
    }

    /// Overwrites the value at `cursor`'s current key in place, without
    /// moving the cursor (`cur_set_value` RPC). Fails with `NoRec` if the
    /// cursor carries no position or that key no longer exists.
    pub fn cur_set_value(&self, cursor: &Cursor, value: &[u8], xt_rel_or_abs: i64) -> KtResult<()> {
        self.ensure_open()?;
        let key = cursor.position().ok_or(KtError::NoRec)?.to_vec();
        let now = now_epoch_seconds();
        let xt = modify_exp_time(xt_rel_or_abs, now);
        let stored = self.pack_for_store(value, xt);
        let mut guard = self.write_guard();
        let existing = guard.get(&key).ok_or(KtError::NoRec)?;
        let (existing_xt, _) = self.unpack_stored(existing)?;
        if is_expired(existing_xt, now) {
            return Err(KtError::NoRec);
        }
        guard.set(key.clone(), stored);
        drop(guard);
        self.log(UpdateOp::Set { key, value: value.to_vec(), xt });
        Ok(())
    }

    /// Removes the record at `cursor`'s current key and repositions the
    /// cursor per the "remove repositions forward" rule: the cursor ends
    /// up sitting on whatever record would have followed the removed one
    /// in forward key order, regardless of the cursor's own direction
    /// (`cur_remove` RPC). Returns nothing on success; see `cur_seize` to
    /// also get the removed value back.
    pub fn cur_remove(&self, cursor: &mut Cursor) -> KtResult<()> {
        self.cur_take(cursor).map(|_| ())
    }

    /// Like `cur_remove`, but returns the removed record's value and
    /// expiration (`cur_seize` RPC).
    pub fn cur_seize(&self, cursor: &mut Cursor) -> KtResult<(Vec<u8>, i64)> {
        self.cur_take(cursor)
    }

    fn cur_take(&self, cursor: &mut Cursor) -> KtResult<(Vec<u8>, i64)> {
        self.ensure_open()?;
        let key = cursor.position().ok_or(KtError::NoRec)?.to_vec();
        let mut guard = self.write_guard();
        let stored = guard.get(&key).ok_or(KtError::NoRec)?.to_vec();
        let (xt, payload) = self.unpack_stored(&stored)?;
        let now = now_epoch_seconds();
        if is_expired(xt, now) {
            guard.remove(&key);
            return Err(KtError::NoRec);
        }
        // forward order regardless of the cursor's own direction (§3 cursor
        // invariant: after remove, position is the record that would follow
        // the removed one in forward order).
        let next = guard.next_key_after(Some(&key));
        guard.remove(&key);
        drop(guard);
        cursor.set_position(next);
        self.reaper.add_mutate();
        self.log(UpdateOp::Remove { key });
        Ok((payload.to_vec(), xt))
    }
}

/// Classic O(n*m) edit-distance DP over arbitrary "character unit"
/// sequences (raw bytes or UCS-4 code points — see `match_similar`).
fn levenshtein(a: &[u32], b: &[u32]) -> usize {
    let (n, m) = (a.len(), b.len());
    let mut prev: Vec<usize> = (0..=m).collect();
    let mut cur = vec![0usize; m + 1];
    for i in 1..=n {
        cur[0] = i;
        for j in 1..=m {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[m]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeddb::TimedDb;

    fn db() -> TimedDb {
        TimedDb::open("test", 0, 1, false, 0, 0, None)
    }

    #[test]
    fn prefix_match_returns_only_matching_live_keys() {
        let d = db();
        d.set(b"app", b"1", 60).unwrap();
        d.set(b"apple", b"2", 60).unwrap();
        d.set(b"banana", b"3", 60).unwrap();
        let mut got = d.match_prefix(b"app", None).unwrap();
        got.sort();
        assert_eq!(got, vec![b"app".to_vec(), b"apple".to_vec()]);
    }

    #[test]
    fn regex_match_filters_by_pattern() {
        let d = db();
        d.set(b"k1", b"v", 60).unwrap();
        d.set(b"k2", b"v", 60).unwrap();
        d.set(b"other", b"v", 60).unwrap();
        let mut got = d.match_regex("^k[0-9]$", None).unwrap();
        got.sort();
        assert_eq!(got, vec![b"k1".to_vec(), b"k2".to_vec()]);
    }

    #[test]
    fn similar_match_respects_distance_bound() {
        let d = db();
        d.set(b"kitten", b"v", 60).unwrap();
        d.set(b"sitting", b"v", 60).unwrap();
        d.set(b"zzzzzzzzzz", b"v", 60).unwrap();
        let got = d.match_similar(b"kitten", 3, false, None).unwrap();
        assert!(got.contains(&b"kitten".to_vec()));
        assert!(got.contains(&b"sitting".to_vec()));
        assert!(!got.contains(&b"zzzzzzzzzz".to_vec()));
    }

    #[test]
    fn cursor_steps_in_key_order_and_skips_expired() {
        let d = db();
        d.set(b"a", b"1", 60).unwrap();
        d.set(b"b", b"2", -(now_epoch_seconds() - 10)).unwrap();
        d.set(b"c", b"3", 60).unwrap();
        let mut cursor = d.new_cursor(Direction::Forward);
        let (k1, _, _) = d.cur_step(&mut cursor).unwrap().unwrap();
        assert_eq!(k1, b"a");
        let (k2, _, _) = d.cur_step(&mut cursor).unwrap().unwrap();
        assert_eq!(k2, b"c");
        assert!(d.cur_step(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn set_bulk_atomic_lands_every_record() {
        let d = db();
        let n = d
            .set_bulk(
                &[
                    (b"a".to_vec(), b"1".to_vec(), 60),
                    (b"b".to_vec(), b"2".to_vec(), 60),
                    (b"c".to_vec(), b"3".to_vec(), 60),
                ],
                true,
            )
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(d.get(b"a").unwrap().0, b"1");
        assert_eq!(d.get(b"b").unwrap().0, b"2");
        assert_eq!(d.get(b"c").unwrap().0, b"3");
    }

    #[test]
    fn get_bulk_skips_missing_keys() {
        let d = db();
        d.set(b"a", b"1", 60).unwrap();
        let got = d.get_bulk(&[b"a".to_vec(), b"missing".to_vec()]).unwrap();
        assert_eq!(got, vec![(b"a".to_vec(), b"1".to_vec(), got[0].2)]);
    }

    #[test]
    fn remove_bulk_counts_only_existing_keys() {
        let d = db();
        d.set(b"a", b"1", 60).unwrap();
        let removed = d.remove_bulk(&[b"a".to_vec(), b"missing".to_vec()]).unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn cur_remove_repositions_to_the_next_key_in_forward_order() {
        let d = db();
        d.set(b"a", b"1", 60).unwrap();
        d.set(b"b", b"2", 60).unwrap();
        d.set(b"c", b"3", 60).unwrap();
        let mut cursor = d.new_cursor(Direction::Backward);
        cursor.set_position(Some(b"b".to_vec()));
        d.cur_remove(&mut cursor).unwrap();
        assert_eq!(cursor.position(), Some(&b"c"[..]));
        assert!(d.get(b"b").is_err());
    }

    #[test]
    fn cur_seize_returns_the_removed_value() {
        let d = db();
        d.set(b"a", b"1", 60).unwrap();
        let mut cursor = d.new_cursor(Direction::Forward);
        cursor.set_position(Some(b"a".to_vec()));
        let (value, _) = d.cur_seize(&mut cursor).unwrap();
        assert_eq!(value, b"1");
        assert!(d.get(b"a").is_err());
    }

    #[test]
    fn cur_get_reads_without_advancing() {
        let d = db();
        d.set(b"a", b"1", 60).unwrap();
        let mut cursor = d.new_cursor(Direction::Forward);
        d.cur_step(&mut cursor).unwrap();
        let (k, v, _) = d.cur_get(&cursor).unwrap().unwrap();
        assert_eq!(k, b"a");
        assert_eq!(v, b"1");
        let (k2, _, _) = d.cur_get(&cursor).unwrap().unwrap();
        assert_eq!(k2, b"a");
    }

    #[test]
    fn cur_set_value_overwrites_without_moving() {
        let d = db();
        d.set(b"a", b"1", 60).unwrap();
        let mut cursor = d.new_cursor(Direction::Forward);
        d.cur_step(&mut cursor).unwrap();
        d.cur_set_value(&cursor, b"2", 60).unwrap();
        assert_eq!(d.get(b"a").unwrap().0, b"2");
        assert_eq!(cursor.position(), Some(&b"a"[..]));
    }

    #[test]
    fn cur_step_back_walks_in_reverse_key_order() {
        let d = db();
        d.set(b"a", b"1", 60).unwrap();
        d.set(b"b", b"2", 60).unwrap();
        let mut cursor = d.new_cursor(Direction::Forward);
        cursor.set_position(None);
        let (k1, _, _) = d.cur_step_back(&mut cursor).unwrap().unwrap();
        assert_eq!(k1, b"b");
        let (k2, _, _) = d.cur_step_back(&mut cursor).unwrap().unwrap();
        assert_eq!(k2, b"a");
        assert!(d.cur_step_back(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn copy_into_clones_live_records() {
        let src = db();
        let dest = Arc::new(db());
        src.set(b"k", b"v", 60).unwrap();
        let n = src.copy_into(&dest).unwrap();
        assert_eq!(n, 1);
        assert_eq!(dest.get(b"k").unwrap().0, b"v");
    }
}
