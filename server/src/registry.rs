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

//! # Process-wide registry
//!
//! Replaces the ad hoc globals (`g_serv`, `g_procid`, `g_restart`) that the
//! reference implementation kept as process-wide mutable statics with an
//! explicit, cloneable handle that is threaded into the acceptor, the
//! worker pool, the idle/timer thread and every slave thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const ORD: Ordering = Ordering::SeqCst;

#[derive(Debug, Default)]
struct Inner {
    /// Set once the acceptor should stop handing out new connections.
    shutdown_requested: AtomicBool,
    /// Set when a write path has hit an unrecoverable failure (e.g. a
    /// BGSAVE/flush failure) and the server should refuse further writes.
    poisoned: AtomicBool,
}

/// A cheap, `Clone`-able handle to the process-wide registry.
#[derive(Debug, Clone, Default)]
pub struct Registry(Arc<Inner>);

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_shutdown(&self) {
        self.0.shutdown_requested.store(true, ORD);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.shutdown_requested.load(ORD)
    }

    pub fn poison(&self) {
        self.0.poisoned.store(true, ORD);
    }

    pub fn unpoison(&self) {
        self.0.poisoned.store(false, ORD);
    }

    pub fn is_poisoned(&self) -> bool {
        self.0.poisoned.load(ORD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_flag_is_observed_across_clones() {
        let reg = Registry::new();
        let reg2 = reg.clone();
        assert!(!reg2.is_shutting_down());
        reg.request_shutdown();
        assert!(reg2.is_shutting_down());
    }

    #[test]
    fn poison_is_independent_of_shutdown() {
        let reg = Registry::new();
        reg.poison();
        assert!(reg.is_poisoned());
        assert!(!reg.is_shutting_down());
        reg.unpoison();
        assert!(!reg.is_poisoned());
    }
}
