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

//! Named condition rendezvous (§4.H): workers block on a name with
//! `wait`/`wait_timeout`, and any worker can `signal`/`broadcast` that
//! name to wake waiters — used by the RPC `WAIT`/`SIGNAL` pre/post hooks
//! so one session can park on an event another session produces (e.g.
//! "this key was just written").

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Slot {
    mutex: Mutex<u64>,
    condvar: Condvar,
    /// Threads currently parked in `wait` on this slot — read by
    /// `signal`/`broadcast` to report `SIGNALED=<count>` back over the
    /// wire (§4.H).
    waiters: AtomicUsize,
}

/// A registry of named condition variables, created lazily on first use
/// and kept alive as long as any handle references them.
#[derive(Default)]
pub struct ConditionMap {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl ConditionMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock();
        slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Slot::default()))
            .clone()
    }

    /// Blocks until `name` is signaled/broadcast, or `timeout` elapses.
    /// Returns `true` if woken by a signal, `false` on timeout (the caller
    /// surfaces a timeout as `ETIMEOUT`).
    pub fn wait(&self, name: &str, timeout: Duration) -> bool {
        let slot = self.slot(name);
        slot.waiters.fetch_add(1, Ordering::SeqCst);
        let mut generation = slot.mutex.lock();
        let seen = *generation;
        let result = slot
            .condvar
            .wait_for_while(&mut generation, timeout, |g| *g == seen);
        drop(generation);
        slot.waiters.fetch_sub(1, Ordering::SeqCst);
        !result.timed_out()
    }

    /// Wakes exactly one waiter on `name`, if any. Returns the number of
    /// threads parked on `name` at the moment of the call (`SIGNALED=<n>`).
    pub fn signal(&self, name: &str) -> usize {
        let slot = self.slot(name);
        let mut generation = slot.mutex.lock();
        *generation = generation.wrapping_add(1);
        let count = slot.waiters.load(Ordering::SeqCst);
        slot.condvar.notify_one();
        count
    }

    /// Wakes every waiter on `name`. Returns the number of threads that
    /// were parked on `name` at the moment of the call.
    pub fn broadcast(&self, name: &str) -> usize {
        let slot = self.slot(name);
        let mut generation = slot.mutex.lock();
        *generation = generation.wrapping_add(1);
        let count = slot.waiters.load(Ordering::SeqCst);
        slot.condvar.notify_all();
        count
    }

    /// Broadcasts every known condition name, waking every blocked `WAIT`
    /// so it unblocks with `ETIMEOUT` rather than hanging past shutdown
    /// (§4.K: "broadcasts every condition in the condition map").
    pub fn broadcast_all(&self) {
        let names: Vec<String> = self.slots.lock().keys().cloned().collect();
        for name in names {
            self.broadcast(&name);
        }
    }

    /// Drops named slots with no other live reference, called
    /// periodically by idle housekeeping so long-lived servers don't
    /// accumulate one-shot condition names forever.
    pub fn sweep(&self) {
        self.slots.lock().retain(|_, slot| Arc::strong_count(slot) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn wait_without_signal_times_out() {
        let map = ConditionMap::new();
        assert!(!map.wait("never", Duration::from_millis(20)));
    }

    #[test]
    fn signal_wakes_a_waiting_thread() {
        let map = Arc::new(ConditionMap::new());
        let woken = Arc::new(AtomicBool::new(false));
        let map2 = map.clone();
        let woken2 = woken.clone();
        let handle = thread::spawn(move || {
            let ok = map2.wait("evt", Duration::from_secs(5));
            woken2.store(ok, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(30));
        map.signal("evt");
        handle.join().unwrap();
        assert!(woken.load(Ordering::SeqCst));
    }

    #[test]
    fn sweep_drops_slots_with_no_outstanding_waiters() {
        let map = ConditionMap::new();
        map.signal("ephemeral");
        map.sweep();
        assert_eq!(map.slots.lock().len(), 0);
    }
}
