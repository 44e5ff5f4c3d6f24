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

//! The worker pool (§4.E, component E): a fixed set of threads pulling
//! accepted connections off a channel and running [`dispatch::dispatch`]
//! for each request a connection sends, plus the idle/timer housekeeping
//! thread that drives vacuuming and periodic snapshotting.

pub mod binary;
pub mod dispatch;
pub mod rest;
pub mod rpc;
pub mod session;

pub use dispatch::{dispatch, Dispatched, Hooks, Request, Response};
pub use session::Session;

use crate::condvar::ConditionMap;
use crate::corestore::Corestore;
use crate::registry::Registry;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Every open connection's session state, keyed by connection id (the raw
/// fd), shared across the pool so any worker thread can pick up the next
/// request on a connection regardless of which thread handled its last
/// one.
pub type SessionTable = Arc<Mutex<HashMap<u64, Session>>>;

/// One unit of work handed to the pool: an already-parsed request
/// belonging to connection `conn_id`, plus a channel to deliver the
/// response back to whatever front end produced it.
pub struct Job {
    pub conn_id: u64,
    pub request: Request,
    pub hooks: Hooks,
    pub respond: crossbeam_channel::Sender<crate::errors::KtResult<Dispatched>>,
}

/// Spawns `n` worker threads pulling [`Job`]s off `jobs` until the
/// channel closes or shutdown is requested. `default_db` seeds a brand
/// new connection's session before its first `db=` hook runs.
pub fn spawn_pool(
    n: usize,
    jobs: Receiver<Job>,
    sessions: SessionTable,
    corestore: Arc<Corestore>,
    conditions: Arc<ConditionMap>,
    registry: Registry,
) -> Vec<std::thread::JoinHandle<()>> {
    (0..n)
        .map(|worker_id| {
            let jobs = jobs.clone();
            let sessions = sessions.clone();
            let corestore = corestore.clone();
            let conditions = conditions.clone();
            let registry = registry.clone();
            std::thread::Builder::new()
                .name(format!("ktd-worker-{worker_id}"))
                .spawn(move || {
                    while !registry.is_shutting_down() {
                        match jobs.recv_timeout(Duration::from_millis(200)) {
                            Ok(job) => {
                                let result = {
                                    let mut table = sessions.lock();
                                    let session = table.entry(job.conn_id).or_insert_with(|| {
                                        Session::new(
                                            corestore
                                                .by_index(0)
                                                .expect("corestore always has at least one database"),
                                        )
                                    });
                                    dispatch(job.request, session, &job.hooks, &corestore, &conditions)
                                };
                                let _ = job.respond.send(result);
                            }
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })
                .expect("failed to spawn worker thread")
        })
        .collect()
}

/// Periodic housekeeping (§4.E "idle/timer housekeeping"): forces a small
/// reaper vacuum pass and sweeps stale condition slots on every database
/// on every tick, and additionally runs a hard `synchronize` and a
/// snapshot dump per database on their own, coarser cadences tracked in
/// elapsed wall-clock time since the thread started.
pub fn spawn_housekeeping(
    corestore: Arc<Corestore>,
    conditions: Arc<ConditionMap>,
    registry: Registry,
    interval: Duration,
    vacuum_steps: i64,
    sync_interval: Duration,
    snapshot_interval: Duration,
    snapshot_dir: std::path::PathBuf,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("ktd-housekeeping".to_string())
        .spawn(move || {
            if let Err(e) = std::fs::create_dir_all(&snapshot_dir) {
                log::warn!("housekeeping: failed to create snapshot directory: {e}");
            }
            let mut since_sync = Duration::ZERO;
            let mut since_snapshot = Duration::ZERO;
            while !registry.is_shutting_down() {
                std::thread::sleep(interval);
                since_sync += interval;
                since_snapshot += interval;

                for name in corestore.names() {
                    if let Ok(db) = corestore.by_name(&name) {
                        if let Err(e) = db.vacuum(vacuum_steps) {
                            log::warn!("housekeeping vacuum failed for '{name}': {e}");
                        }
                    }
                }
                conditions.sweep();

                if since_sync >= sync_interval {
                    since_sync = Duration::ZERO;
                    for name in corestore.names() {
                        if let Ok(db) = corestore.by_name(&name) {
                            if let Err(e) = db.synchronize(true) {
                                log::warn!("housekeeping synchronize failed for '{name}': {e}");
                            }
                        }
                    }
                }

                if since_snapshot >= snapshot_interval {
                    since_snapshot = Duration::ZERO;
                    for name in corestore.names() {
                        if let Ok(db) = corestore.by_name(&name) {
                            let path = snapshot_dir.join(format!("{name}.ktss"));
                            if let Err(e) = crate::timeddb::snapshot::dump_snapshot_atomic(
                                &db,
                                &path,
                                &crate::timeddb::snapshot::Identity,
                            ) {
                                log::warn!("housekeeping snapshot failed for '{name}': {e}");
                            }
                        }
                    }
                }
            }
        })
        .expect("failed to spawn housekeeping thread")
}
