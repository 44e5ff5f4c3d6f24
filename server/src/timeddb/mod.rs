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

//! # TimedDB
//!
//! An expiration-augmented wrapper over an ordered key-value store (§4.D).
//! Every mutating/read/iterating operation nudges the lazy reaper
//! ([`reaper`]) and, when a capacity bound is configured, the eviction
//! check in [`Self::maybe_evict`].

pub mod cursor;
pub mod kvengine;
pub mod ops;
pub mod reaper;
pub mod snapshot;
pub mod value;
pub mod visitor;

use crate::errors::{KtError, KtResult};
use crate::ulog::{UpdateLogger, UpdateOp};
use crate::util::now_epoch_seconds;
use cursor::{Cursor, Direction};
use kvengine::MemEngine;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use reaper::ReaperState;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use value::{is_expired, modify_exp_time, pack, unpack, XT_MAX};
use visitor::{Visitor, VisitResult};

/// `increment`'s "set unconditionally" sentinel.
pub const ORIGIN_FORCE: i64 = i64::MAX;
/// `increment`'s "fail if missing" sentinel.
pub const ORIGIN_MUST_EXIST: i64 = i64::MIN;

/// Per-thread operation counters (§4.E.3), one set per `TimedDb` — a
/// worker increments the handle for the DB it is currently serving.
#[derive(Debug, Default)]
pub struct Counters {
    pub set: AtomicU64,
    pub set_miss: AtomicU64,
    pub remove: AtomicU64,
    pub remove_miss: AtomicU64,
    pub get: AtomicU64,
    pub get_miss: AtomicU64,
    pub script: AtomicU64,
    pub misc: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> [(&'static str, u64); 8] {
        [
            ("SET", self.set.load(Ordering::Relaxed)),
            ("SETMISS", self.set_miss.load(Ordering::Relaxed)),
            ("REMOVE", self.remove.load(Ordering::Relaxed)),
            ("REMOVEMISS", self.remove_miss.load(Ordering::Relaxed)),
            ("GET", self.get.load(Ordering::Relaxed)),
            ("GETMISS", self.get_miss.load(Ordering::Relaxed)),
            ("SCRIPT", self.script.load(Ordering::Relaxed)),
            ("MISC", self.misc.load(Ordering::Relaxed)),
        ]
    }
}

/// Write mode for the RPC/REST surface's `set`-family dispatch (§4.E.1
/// `X-Kt-Mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Set,
    Add,
    Replace,
}

/// A point-in-time status report (`status` RPC / `report`).
#[derive(Debug, Clone)]
pub struct DbStatus {
    pub name: String,
    pub index: u16,
    pub count: u64,
    pub size_bytes: u64,
    pub poisoned: bool,
}

/// One expiration-wrapped, ordered key-value database.
pub struct TimedDb {
    name: String,
    index: u16,
    persistence_option: bool,
    capacity_count: usize,
    capacity_size: usize,
    store: RwLock<MemEngine>,
    trigger: Option<Arc<UpdateLogger>>,
    /// The sid tagged onto update records written by this handle. Set to
    /// a non-local sid by the Slave thread immediately before applying a
    /// foreign-origin record, so the resulting write is itself logged
    /// under the *origin's* sid rather than this server's own —
    /// suppressing replication echo (§4.F STREAMING).
    write_origin_sid: AtomicU16,
    local_sid: u16,
    reaper: ReaperState,
    reap_inflight: AtomicBool,
    counters: Counters,
    closed: AtomicBool,
    next_cursor_id: AtomicU64,
}

impl TimedDb {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        name: impl Into<String>,
        index: u16,
        local_sid: u16,
        persistence_option: bool,
        capacity_count: usize,
        capacity_size: usize,
        trigger: Option<Arc<UpdateLogger>>,
    ) -> Self {
        Self {
            name: name.into(),
            index,
            persistence_option,
            capacity_count,
            capacity_size,
            store: RwLock::new(MemEngine::new()),
            trigger,
            write_origin_sid: AtomicU16::new(local_sid),
            local_sid,
            reaper: ReaperState::new(),
            reap_inflight: AtomicBool::new(false),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            next_cursor_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn new_cursor_id(&self) -> u64 {
        self.next_cursor_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn new_cursor(&self, direction: Direction) -> Cursor {
        Cursor::new(self.new_cursor_id(), direction)
    }

    /// Sets the sid an applying write should be tagged with. The Slave
    /// thread calls this with the record's origin sid right before
    /// `recover()`; ordinary client writes leave it at `local_sid`.
    pub fn set_write_origin(&self, sid: u16) {
        self.write_origin_sid.store(sid, Ordering::SeqCst);
    }

    pub fn clear_write_origin(&self) {
        self.write_origin_sid.store(self.local_sid, Ordering::SeqCst);
    }

    /// Close must wait for in-flight visitors: acquiring the write lock
    /// blocks until every outstanding reader/writer on `store` has
    /// finished, which is exactly the property we need since every public
    /// operation takes at least a read lock on it.
    pub fn close(&self) {
        let _wlock = self.store.write();
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> KtResult<()> {
        if self.is_closed() {
            Err(KtError::invalid("database is closed"))
        } else {
            Ok(())
        }
    }

    fn log(&self, op: UpdateOp) {
        if let Some(trigger) = &self.trigger {
            let sid = self.write_origin_sid.load(Ordering::SeqCst);
            if let Err(e) = trigger.append(sid, self.index, op) {
                log::warn!("db '{}': failed to append to update log: {e}", self.name);
            }
        }
    }

    fn pack_for_store(&self, payload: &[u8], xt: i64) -> Vec<u8> {
        if self.persistence_option {
            payload.to_vec()
        } else {
            pack(payload, xt)
        }
    }

    /// Splits a stored value into `(xt, payload)`, treating
    /// persistence-option-on values as never expiring.
    fn unpack_stored<'a>(&self, stored: &'a [u8]) -> KtResult<(i64, &'a [u8])> {
        if self.persistence_option {
            Ok((XT_MAX, stored))
        } else {
            unpack(stored).ok_or_else(|| KtError::broken("value shorter than the xt prefix"))
        }
    }

    fn read_live<'a>(
        guard: &'a RwLockReadGuard<'_, MemEngine>,
        db: &TimedDb,
        key: &[u8],
    ) -> KtResult<Option<(i64, &'a [u8])>> {
        match guard.get(key) {
            None => Ok(None),
            Some(stored) => {
                let (xt, payload) = db.unpack_stored(stored)?;
                if is_expired(xt, now_epoch_seconds()) {
                    Ok(None)
                } else {
                    Ok(Some((xt, payload)))
                }
            }
        }
    }

    // ---- basic verbs (§4.D.3) ----------------------------------------

    pub fn get(&self, key: &[u8]) -> KtResult<(Vec<u8>, i64)> {
        self.ensure_open()?;
        self.reaper.add_read();
        self.maybe_reap();
        let guard = self.store.read();
        match Self::read_live(&guard, self, key)? {
            Some((xt, payload)) => Ok((payload.to_vec(), xt)),
            None => Err(KtError::NoRec),
        }
    }

    pub fn check(&self, key: &[u8]) -> KtResult<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(KtError::NoRec) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn set(&self, key: &[u8], value: &[u8], xt_rel_or_abs: i64) -> KtResult<()> {
        self.ensure_open()?;
        let now = now_epoch_seconds();
        let xt = modify_exp_time(xt_rel_or_abs, now);
        let stored = self.pack_for_store(value, xt);
        {
            let mut guard = self.store.write();
            guard.set(key.to_vec(), stored);
        }
        self.reaper.add_mutate();
        self.maybe_reap();
        self.maybe_evict();
        self.log(UpdateOp::Set {
            key: key.to_vec(),
            value: value.to_vec(),
            xt,
        });
        Ok(())
    }

    pub fn add(&self, key: &[u8], value: &[u8], xt_rel_or_abs: i64) -> KtResult<()> {
        self.ensure_open()?;
        let now = now_epoch_seconds();
        let xt = modify_exp_time(xt_rel_or_abs, now);
        let stored = self.pack_for_store(value, xt);
        let mut guard = self.store.write();
        let is_live = match guard.get(key) {
            Some(existing) => {
                let (existing_xt, _) = self.unpack_stored(existing)?;
                !is_expired(existing_xt, now)
            }
            None => false,
        };
        if is_live {
            return Err(KtError::DupRec);
        }
        guard.set(key.to_vec(), stored);
        drop(guard);
        self.reaper.add_mutate();
        self.maybe_reap();
        self.maybe_evict();
        self.log(UpdateOp::Set {
            key: key.to_vec(),
            value: value.to_vec(),
            xt,
        });
        Ok(())
    }

    pub fn replace(&self, key: &[u8], value: &[u8], xt_rel_or_abs: i64) -> KtResult<()> {
        self.ensure_open()?;
        let now = now_epoch_seconds();
        let xt = modify_exp_time(xt_rel_or_abs, now);
        let stored = self.pack_for_store(value, xt);
        let mut guard = self.store.write();
        let is_live = match guard.get(key) {
            Some(existing) => {
                let (existing_xt, _) = self.unpack_stored(existing)?;
                !is_expired(existing_xt, now)
            }
            None => false,
        };
        if !is_live {
            return Err(KtError::NoRec);
        }
        guard.set(key.to_vec(), stored);
        drop(guard);
        self.reaper.add_mutate();
        self.maybe_reap();
        self.maybe_evict();
        self.log(UpdateOp::Set {
            key: key.to_vec(),
            value: value.to_vec(),
            xt,
        });
        Ok(())
    }

    pub fn append(&self, key: &[u8], suffix: &[u8], xt_rel_or_abs: i64) -> KtResult<()> {
        self.ensure_open()?;
        let now = now_epoch_seconds();
        let mut guard = self.store.write();
        let mut combined = match guard.get(key) {
            Some(existing) => {
                let (existing_xt, payload) = self.unpack_stored(existing)?;
                if is_expired(existing_xt, now) {
                    Vec::new()
                } else {
                    payload.to_vec()
                }
            }
            None => Vec::new(),
        };
        combined.extend_from_slice(suffix);
        let xt = modify_exp_time(xt_rel_or_abs, now);
        let stored = self.pack_for_store(&combined, xt);
        guard.set(key.to_vec(), stored);
        drop(guard);
        self.reaper.add_mutate();
        self.maybe_reap();
        self.maybe_evict();
        self.log(UpdateOp::Set {
            key: key.to_vec(),
            value: combined,
            xt,
        });
        Ok(())
    }

    pub fn remove(&self, key: &[u8]) -> KtResult<()> {
        self.ensure_open()?;
        let existed = {
            let guard = self.store.read();
            Self::read_live(&guard, self, key)?.is_some()
        };
        if !existed {
            return Err(KtError::NoRec);
        }
        self.store.write().remove(key);
        self.reaper.add_mutate();
        self.maybe_reap();
        self.log(UpdateOp::Remove { key: key.to_vec() });
        Ok(())
    }

    /// Atomic get+remove.
    pub fn seize(&self, key: &[u8]) -> KtResult<(Vec<u8>, i64)> {
        self.ensure_open()?;
        let mut guard = self.store.write();
        let (xt, payload) = match guard.get(key) {
            Some(stored) => self.unpack_stored(stored)?,
            None => return Err(KtError::NoRec),
        };
        if is_expired(xt, now_epoch_seconds()) {
            guard.remove(key);
            return Err(KtError::NoRec);
        }
        let payload = payload.to_vec();
        guard.remove(key);
        drop(guard);
        self.reaper.add_mutate();
        self.maybe_reap();
        self.log(UpdateOp::Remove { key: key.to_vec() });
        Ok((payload, xt))
    }

    pub fn clear(&self) -> KtResult<()> {
        self.ensure_open()?;
        self.store.write().clear();
        self.log(UpdateOp::Clear);
        Ok(())
    }

    pub fn count(&self) -> KtResult<u64> {
        self.ensure_open()?;
        Ok(self.store.read().len() as u64)
    }

    pub fn size(&self) -> KtResult<u64> {
        self.ensure_open()?;
        Ok(self.store.read().size_bytes() as u64)
    }

    pub fn status(&self) -> KtResult<DbStatus> {
        self.ensure_open()?;
        let guard = self.store.read();
        Ok(DbStatus {
            name: self.name.clone(),
            index: self.index,
            count: guard.len() as u64,
            size_bytes: guard.size_bytes() as u64,
            poisoned: false,
        })
    }

    // ---- numeric verbs -------------------------------------------------

    /// `increment(k, n, origin)`: value is stored as an 8-byte big-endian
    /// signed integer.
    pub fn increment(&self, key: &[u8], n: i64, origin: i64) -> KtResult<i64> {
        self.ensure_open()?;
        let mut guard = self.store.write();
        let current = match guard.get(key) {
            Some(stored) => {
                let (xt, payload) = self.unpack_stored(stored)?;
                if is_expired(xt, now_epoch_seconds()) {
                    None
                } else if payload.len() != 8 {
                    return Err(KtError::logic("value is not an 8-byte integer"));
                } else {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(payload);
                    Some(i64::from_be_bytes(buf))
                }
            }
            None => None,
        };
        let next = match current {
            Some(v) => {
                if origin == ORIGIN_FORCE {
                    n
                } else {
                    v.wrapping_add(n)
                }
            }
            None => {
                if origin == ORIGIN_MUST_EXIST {
                    return Err(KtError::logic("increment target missing"));
                }
                if origin == ORIGIN_FORCE {
                    n
                } else {
                    origin.wrapping_add(n)
                }
            }
        };
        let stored = self.pack_for_store(&next.to_be_bytes(), XT_MAX);
        guard.set(key.to_vec(), stored);
        drop(guard);
        self.reaper.add_mutate();
        self.maybe_reap();
        self.log(UpdateOp::Set {
            key: key.to_vec(),
            value: next.to_be_bytes().to_vec(),
            xt: XT_MAX,
        });
        Ok(next)
    }

    /// `increment_double`: 16-byte value, two big-endian 64-bit halves —
    /// integer part and fractional part scaled by 10^15.
    pub fn increment_double(&self, key: &[u8], n: f64, origin: f64) -> KtResult<f64> {
        self.ensure_open()?;
        const SCALE: f64 = 1_000_000_000_000_000.0;
        let mut guard = self.store.write();
        let current = match guard.get(key) {
            Some(stored) => {
                let (xt, payload) = self.unpack_stored(stored)?;
                if is_expired(xt, now_epoch_seconds()) {
                    None
                } else if payload.len() != 16 {
                    return Err(KtError::logic("value is not a 16-byte double"));
                } else {
                    let mut ibuf = [0u8; 8];
                    let mut fbuf = [0u8; 8];
                    ibuf.copy_from_slice(&payload[..8]);
                    fbuf.copy_from_slice(&payload[8..]);
                    let ipart = i64::from_be_bytes(ibuf) as f64;
                    let fpart = i64::from_be_bytes(fbuf) as f64 / SCALE;
                    Some(ipart + fpart)
                }
            }
            None => None,
        };
        let next = match current {
            Some(v) => {
                if origin == f64::MAX {
                    n
                } else {
                    v + n
                }
            }
            None => {
                if origin == f64::MIN {
                    return Err(KtError::logic("increment_double target missing"));
                }
                if origin == f64::MAX {
                    n
                } else {
                    origin + n
                }
            }
        };
        let ipart = next.trunc() as i64;
        let fpart = ((next.fract()) * SCALE).round() as i64;
        let mut stored_payload = Vec::with_capacity(16);
        stored_payload.extend_from_slice(&ipart.to_be_bytes());
        stored_payload.extend_from_slice(&fpart.to_be_bytes());
        let stored = self.pack_for_store(&stored_payload, XT_MAX);
        guard.set(key.to_vec(), stored);
        drop(guard);
        self.reaper.add_mutate();
        self.maybe_reap();
        self.log(UpdateOp::Set {
            key: key.to_vec(),
            value: stored_payload,
            xt: XT_MAX,
        });
        Ok(next)
    }

    /// Compare-and-swap. `old = None` means "must be absent"; `new = None`
    /// means "must delete".
    pub fn cas(&self, key: &[u8], old: Option<&[u8]>, new: Option<&[u8]>) -> KtResult<()> {
        self.ensure_open()?;
        let mut guard = self.store.write();
        let current = match guard.get(key) {
            Some(stored) => {
                let (xt, payload) = self.unpack_stored(stored)?;
                if is_expired(xt, now_epoch_seconds()) {
                    None
                } else {
                    Some(payload.to_vec())
                }
            }
            None => None,
        };
        let matches = match (&current, old) {
            (None, None) => true,
            (Some(cur), Some(expect)) => cur.as_slice() == expect,
            _ => false,
        };
        if !matches {
            return Err(KtError::logic("cas precondition failed"));
        }
        match new {
            None => {
                guard.remove(key);
                drop(guard);
                self.log(UpdateOp::Remove { key: key.to_vec() });
            }
            Some(new_val) => {
                // cas leaves expiry untouched by default; callers needing one
                // set should issue a `set` afterward.
                guard.set(key.to_vec(), self.pack_for_store(new_val, XT_MAX));
                drop(guard);
                self.log(UpdateOp::Set {
                    key: key.to_vec(),
                    value: new_val.to_vec(),
                    xt: XT_MAX,
                });
            }
        }
        self.reaper.add_mutate();
        self.maybe_reap();
        Ok(())
    }

    // ---- visitor-driven iteration --------------------------------------

    /// Applies `visitor` to every live record in key order, removing
    /// expired records it passes over along the way (§4.D.2: "when
    /// iterating, transparently treats expired records as absent and
    /// immediately schedules their removal").
    pub fn iterate(&self, visitor: &mut dyn Visitor) -> KtResult<()> {
        self.ensure_open()?;
        visitor.visit_before();
        let now = now_epoch_seconds();
        let keys: Vec<Vec<u8>> = self.store.read().iter().map(|(k, _)| k.clone()).collect();
        let mut scanned = 0usize;
        for key in keys {
            scanned += 1;
            let mut guard = self.store.write();
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
            let decision = visitor.visit_full(&key, payload, xt);
            self.apply_visit_decision(&mut guard, &key, decision, now);
        }
        visitor.visit_after();
        self.reaper.add_iter(scanned);
        self.maybe_reap();
        Ok(())
    }

    fn apply_visit_decision(
        &self,
        guard: &mut RwLockWriteGuard<'_, MemEngine>,
        key: &[u8],
        decision: VisitResult,
        now: i64,
    ) {
        match decision {
            VisitResult::Nop => {}
            VisitResult::Remove => {
                guard.remove(key);
                self.log(UpdateOp::Remove { key: key.to_vec() });
            }
            VisitResult::Replace(new_value, new_xt) => {
                let xt = modify_exp_time(new_xt, now);
                guard.set(key.to_vec(), self.pack_for_store(&new_value, xt));
                self.log(UpdateOp::Set {
                    key: key.to_vec(),
                    value: new_value,
                    xt,
                });
            }
        }
    }

    // ---- reaper / eviction ----------------------------------------------

    fn maybe_reap(&self) {
        if self.reap_inflight.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some((steps, mut cursor_guard)) = self.reaper.try_begin_drain() {
            self.drain_steps(steps, &mut cursor_guard);
        }
        self.reap_inflight.store(false, Ordering::SeqCst);
    }

    fn drain_steps(&self, steps: i64, cursor_guard: &mut Option<Vec<u8>>) {
        let now = now_epoch_seconds();
        for _ in 0..steps {
            let mut guard = self.store.write();
            let next = guard.next_key_after(cursor_guard.as_deref());
            let next = match next {
                Some(k) => k,
                None => {
                    // wrapped around; try from the start next time
                    *cursor_guard = None;
                    continue;
                }
            };
            if let Some(stored) = guard.get(&next) {
                if let Ok((xt, _)) = self.unpack_stored(stored) {
                    if is_expired(xt, now) {
                        guard.remove(&next);
                        *cursor_guard = None;
                        continue;
                    }
                }
            }
            *cursor_guard = Some(next);
        }
    }

    /// Manual vacuum (`vacuum(steps)` RPC / idle housekeeping): forces
    /// `steps` reaper drain iterations regardless of the accumulated
    /// score.
    pub fn vacuum(&self, steps: i64) -> KtResult<()> {
        self.ensure_open()?;
        let mut guard = self.reaper.force_begin_drain();
        self.drain_steps(steps, &mut guard);
        Ok(())
    }

    /// `synchronize(hard)` (§4.E.4 timer housekeeping / `synchronize` RPC):
    /// flushes the shared update log's buffered writes. `hard` additionally
    /// fsyncs the OS page cache via `UpdateLogger::sync_all`; a soft
    /// synchronize only pushes the Rust-level write buffer down to the OS.
    /// A no-op when the database carries no update log (persistence off).
    pub fn synchronize(&self, hard: bool) -> KtResult<()> {
        self.ensure_open()?;
        if let Some(trigger) = &self.trigger {
            if hard {
                trigger.sync_all()?;
            } else {
                trigger.flush()?;
            }
        }
        Ok(())
    }

    /// Lists the update log's rotated file names (`ulog_list` RPC), or an
    /// empty list when the database carries no update log.
    pub fn ulog_files(&self) -> KtResult<Vec<String>> {
        self.ensure_open()?;
        match &self.trigger {
            Some(trigger) => Ok(trigger
                .list()?
                .iter()
                .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Deletes a rotated update-log file by name (`ulog_remove` RPC).
    pub fn ulog_remove(&self, file_name: &str) -> KtResult<()> {
        self.ensure_open()?;
        match &self.trigger {
            Some(trigger) => trigger.remove(file_name),
            None => Err(KtError::NoRec),
        }
    }

    fn maybe_evict(&self) {
        if self.capacity_count > 0 {
            let count = self.store.read().len();
            if count > self.capacity_count {
                let mut guard = self.reaper.force_begin_drain();
                let overflow = (count - self.capacity_count) as i64;
                self.evict_n(overflow, &mut guard);
            }
        }
        if self.capacity_size > 0 {
            let size = self.store.read().size_bytes();
            if size > self.capacity_size {
                let steps = self.reaper.try_begin_drain().map(|(s, _)| s).unwrap_or(reaper::STEP_UNIT);
                let mut guard = self.reaper.force_begin_drain();
                self.evict_n(steps, &mut guard);
                log::trace!("db '{}': requesting a defragmentation pass after size eviction", self.name);
            }
        }
    }

    fn evict_n(&self, n: i64, cursor_guard: &mut Option<Vec<u8>>) {
        for _ in 0..n {
            let mut guard = self.store.write();
            let next = guard.next_key_after(cursor_guard.as_deref());
            match next {
                Some(k) => {
                    guard.remove(&k);
                    self.log(UpdateOp::Remove { key: k });
                    *cursor_guard = None;
                }
                None => {
                    *cursor_guard = None;
                    break;
                }
            }
        }
    }

    pub(crate) fn read_guard(&self) -> RwLockReadGuard<'_, MemEngine> {
        self.store.read()
    }

    pub(crate) fn write_guard(&self) -> RwLockWriteGuard<'_, MemEngine> {
        self.store.write()
    }

    pub fn persistence_option(&self) -> bool {
        self.persistence_option
    }

    /// Applies a single replayed update (used by the Slave thread's
    /// `db.recover(payload)` and by crash-recovery ulog replay).
    pub fn recover(&self, op: &UpdateOp) -> KtResult<()> {
        match op {
            UpdateOp::Set { key, value, xt } => {
                self.store
                    .write()
                    .set(key.clone(), self.pack_for_store(value, *xt));
                Ok(())
            }
            UpdateOp::Remove { key } => {
                self.store.write().remove(key);
                Ok(())
            }
            UpdateOp::Clear => {
                self.store.write().clear();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> TimedDb {
        TimedDb::open("test", 0, 1, false, 0, 0, None)
    }

    #[test]
    fn set_then_get_round_trips() {
        let d = db();
        d.set(b"a", b"1", 60).unwrap();
        let (v, xt) = d.get(b"a").unwrap();
        assert_eq!(v, b"1");
        assert!(xt > now_epoch_seconds());
    }

    #[test]
    fn expired_record_reads_as_norec() {
        let d = db();
        d.set(b"a", b"1", -(now_epoch_seconds() - 10)).unwrap();
        assert!(matches!(d.get(b"a"), Err(KtError::NoRec)));
    }

    #[test]
    fn add_fails_on_existing_replace_fails_on_missing() {
        let d = db();
        d.set(b"k", b"v", 60).unwrap();
        assert!(matches!(d.add(b"k", b"v2", 60), Err(KtError::DupRec)));
        assert!(matches!(d.replace(b"missing", b"v", 60), Err(KtError::NoRec)));
    }

    #[test]
    fn cas_succeeds_once_then_fails() {
        let d = db();
        d.set(b"k", b"v1", 60).unwrap();
        d.cas(b"k", Some(b"v1"), Some(b"v2")).unwrap();
        assert!(matches!(d.cas(b"k", Some(b"v1"), Some(b"v3")), Err(KtError::Logic(_))));
        let (v, _) = d.get(b"k").unwrap();
        assert_eq!(v, b"v2");
    }

    #[test]
    fn increment_follows_origin_rules() {
        let d = db();
        assert!(d.remove(b"c").is_err());
        assert_eq!(d.increment(b"c", 3, 0).unwrap(), 3);
        assert_eq!(d.increment(b"c", 4, 0).unwrap(), 7);
    }

    #[test]
    fn increment_on_missing_with_must_exist_fails() {
        let d = db();
        assert!(matches!(
            d.increment(b"missing", 1, ORIGIN_MUST_EXIST),
            Err(KtError::Logic(_))
        ));
    }

    #[test]
    fn seize_is_get_and_remove() {
        let d = db();
        d.set(b"k", b"v", 60).unwrap();
        let (v, _) = d.seize(b"k").unwrap();
        assert_eq!(v, b"v");
        assert!(matches!(d.get(b"k"), Err(KtError::NoRec)));
    }

    #[test]
    fn visitor_nop_leaves_count_and_values_unchanged() {
        let d = db();
        d.set(b"a", b"1", 60).unwrap();
        d.set(b"b", b"2", 60).unwrap();
        let before = d.count().unwrap();
        let mut v = visitor::ClosureVisitor {
            full: |_k: &[u8], _v: &[u8], _xt: i64| VisitResult::Nop,
            empty: |_k: &[u8]| VisitResult::Nop,
        };
        d.iterate(&mut v).unwrap();
        assert_eq!(d.count().unwrap(), before);
    }

    #[test]
    fn capacity_count_eviction_keeps_within_bound() {
        let d = TimedDb::open("test", 0, 1, false, 3, 0, None);
        for i in 0..10u32 {
            d.set(format!("k{i}").as_bytes(), b"v", 60).unwrap();
        }
        assert!(d.count().unwrap() <= 3);
    }

    #[test]
    fn close_waits_for_in_flight_readers() {
        let d = Arc::new(db());
        d.set(b"k", b"v", 60).unwrap();
        d.close();
        assert!(d.is_closed());
        assert!(matches!(d.get(b"k"), Err(KtError::Invalid(_))));
    }
}
