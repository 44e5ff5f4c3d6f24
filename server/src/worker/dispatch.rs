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

//! Request dispatch (§4.E): translates one parsed request into a
//! `TimedDb`/`Corestore` call, running the pre-hooks (`DB` database
//! selection, `CUR` cursor resolution, `WAIT` blocking on a named
//! condition) before the operation and the post-hook (`SIGNAL`) after,
//! then tallies the per-database operation counters.
//!
//! The RPC, REST and binary front ends (§6) all funnel into this one
//! `dispatch` so the three surfaces share identical semantics — only
//! their wire encodings differ.

use super::session::Session;
use crate::condvar::ConditionMap;
use crate::corestore::Corestore;
use crate::errors::{KtError, KtResult};
use crate::timeddb::cursor::Direction;
use crate::timeddb::WriteMode;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Hooks that run around every request regardless of which operation it
/// carries (§4.E "pre/post hooks").
#[derive(Debug, Clone, Default)]
pub struct Hooks {
    /// Switch the session's selected database before running the op.
    pub select_db: Option<String>,
    /// Block on this named condition (up to `wait_timeout`) before
    /// running the op.
    pub wait_on: Option<String>,
    pub wait_timeout: Duration,
    /// Signal this named condition after the op completes (success or
    /// failure — a waiter may be interested in "it was attempted").
    pub signal: Option<String>,
    /// When set, `signal` wakes every waiter (`broadcast`) instead of just
    /// one (`SIGNALBROAD` field on the wire).
    pub signal_broadcast: bool,
}

/// What a dispatch produced, plus anything the pre/post hooks want
/// surfaced back to the caller alongside it (`SIGNALED=<count>`).
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub response: Response,
    /// Number of threads parked on `hooks.signal`'s name at the moment it
    /// fired, or `None` if no `signal` hook was set.
    pub signaled: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum Request {
    /// No-op, used to check a connection is alive (`void` RPC).
    Void,
    /// Echoes `text` back verbatim (`echo` RPC).
    Echo { text: String },
    /// Returns a human-readable line describing this server (`report`
    /// RPC) — version, sid, uptime.
    Report,
    Get { key: Vec<u8> },
    Set { key: Vec<u8>, value: Vec<u8>, xt: i64, mode: WriteMode },
    Append { key: Vec<u8>, suffix: Vec<u8>, xt: i64 },
    Remove { key: Vec<u8> },
    Seize { key: Vec<u8> },
    Check { key: Vec<u8> },
    Cas { key: Vec<u8>, old: Option<Vec<u8>>, new: Option<Vec<u8>> },
    Increment { key: Vec<u8>, n: i64, origin: i64 },
    IncrementDouble { key: Vec<u8>, n: f64, origin: f64 },
    SetBulk { records: Vec<(Vec<u8>, Vec<u8>, i64)>, atomic: bool },
    RemoveBulk { keys: Vec<Vec<u8>> },
    GetBulk { keys: Vec<Vec<u8>> },
    DumpSnapshot { path: String },
    LoadSnapshot { path: String },
    Clear,
    Count,
    Size,
    Status,
    /// Flushes (and, when `hard`, fsyncs) the update log (`synchronize`
    /// RPC).
    Synchronize { hard: bool },
    /// Forces `steps` reaper passes ahead of the housekeeping thread's own
    /// schedule (`vacuum` RPC).
    Vacuum { steps: i64 },
    /// Lists the update log's rotated file names (`ulog_list` RPC).
    UlogList,
    /// Deletes a rotated update-log file (`ulog_remove` RPC).
    UlogRemove { file_name: String },
    /// Always fails with `NoImpl` — no embedded scripting engine is
    /// provided (`play_script` RPC).
    PlayScript { script: String },
    /// Reconfigures replication sid-filtering at runtime (`tune_replication`
    /// RPC) — accepted and acknowledged, but this server's filter is fixed
    /// per-connection at `Frame::Open` time (§4.C), so there is nothing
    /// further to apply.
    TuneReplication { whitesid: bool },
    MatchPrefix { prefix: Vec<u8>, limit: Option<usize> },
    MatchRegex { pattern: String, limit: Option<usize> },
    MatchSimilar { target: Vec<u8>, max_distance: usize, utf: bool, limit: Option<usize> },
    CursorOpen { direction: Direction },
    CursorStep { id: u64 },
    CursorStepBack { id: u64 },
    CursorJump { id: u64, key: Option<Vec<u8>> },
    CursorJumpBack { id: u64, key: Option<Vec<u8>> },
    CursorGet { id: u64 },
    CursorGetKey { id: u64 },
    CursorGetValue { id: u64 },
    CursorSetValue { id: u64, value: Vec<u8>, xt: i64 },
    CursorRemove { id: u64 },
    CursorSeize { id: u64 },
    CursorClose { id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Value(Vec<u8>, i64),
    Ok,
    Bool(bool),
    Count(u64),
    Keys(Vec<Vec<u8>>),
    Status {
        name: String,
        count: u64,
        size_bytes: u64,
    },
    Text(String),
    Double(f64),
    FileNames(Vec<String>),
    CursorId(u64),
    Record(Option<(Vec<u8>, Vec<u8>, i64)>),
    Records(Vec<(Vec<u8>, Vec<u8>, i64)>),
    MaybeKey(Option<Vec<u8>>),
    MaybeValue(Option<Vec<u8>>),
}

/// Dispatches one request against `session`, applying `hooks` first/last.
/// `corestore` resolves `hooks.select_db`; `conditions` backs
/// `wait_on`/`signal`.
pub fn dispatch(
    request: Request,
    session: &mut Session,
    hooks: &Hooks,
    corestore: &Corestore,
    conditions: &ConditionMap,
) -> KtResult<Dispatched> {
    if let Some(name) = &hooks.select_db {
        session.select_db(corestore.by_name(name)?);
    }
    if let Some(name) = &hooks.wait_on {
        if !conditions.wait(name, hooks.wait_timeout) {
            return Err(KtError::Timeout);
        }
    }

    let response = run(request, session)?;

    let signaled = hooks.signal.as_ref().map(|name| {
        if hooks.signal_broadcast {
            conditions.broadcast(name)
        } else {
            conditions.signal(name)
        }
    });
    Ok(Dispatched { response, signaled })
}

fn run(request: Request, session: &mut Session) -> KtResult<Response> {
    let db = session.db.clone();
    let counters = db.counters();
    match request {
        Request::Get { key } => match db.get(&key) {
            Ok((v, xt)) => {
                counters.get.fetch_add(1, Ordering::Relaxed);
                Ok(Response::Value(v, xt))
            }
            Err(KtError::NoRec) => {
                counters.get_miss.fetch_add(1, Ordering::Relaxed);
                Err(KtError::NoRec)
            }
            Err(e) => Err(e),
        },
        Request::Set { key, value, xt, mode } => {
            let outcome = match mode {
                WriteMode::Set => db.set(&key, &value, xt),
                WriteMode::Add => db.add(&key, &value, xt),
                WriteMode::Replace => db.replace(&key, &value, xt),
            };
            match &outcome {
                Ok(()) => counters.set.fetch_add(1, Ordering::Relaxed),
                Err(_) => counters.set_miss.fetch_add(1, Ordering::Relaxed),
            };
            outcome.map(|_| Response::Ok)
        }
        Request::Append { key, suffix, xt } => db.append(&key, &suffix, xt).map(|_| Response::Ok),
        Request::Remove { key } => {
            let outcome = db.remove(&key);
            match &outcome {
                Ok(()) => counters.remove.fetch_add(1, Ordering::Relaxed),
                Err(_) => counters.remove_miss.fetch_add(1, Ordering::Relaxed),
            };
            outcome.map(|_| Response::Ok)
        }
        Request::Seize { key } => db.seize(&key).map(|(v, xt)| Response::Value(v, xt)),
        Request::Check { key } => db.check(&key).map(Response::Bool),
        Request::Cas { key, old, new } => db
            .cas(&key, old.as_deref(), new.as_deref())
            .map(|_| Response::Ok),
        Request::Increment { key, n, origin } => db.increment(&key, n, origin).map(|v| {
            counters.misc.fetch_add(1, Ordering::Relaxed);
            Response::Count(v as u64)
        }),
        Request::SetBulk { records, atomic } => {
            let outcome = db.set_bulk(&records, atomic);
            match &outcome {
                Ok(n) => counters.set.fetch_add(*n, Ordering::Relaxed),
                Err(_) => counters.set_miss.fetch_add(1, Ordering::Relaxed),
            };
            outcome.map(Response::Count)
        }
        Request::RemoveBulk { keys } => db.remove_bulk(&keys).map(Response::Count),
        Request::GetBulk { keys } => db.get_bulk(&keys).map(Response::Records),
        Request::DumpSnapshot { path } => {
            crate::timeddb::snapshot::dump_snapshot_atomic(&db, &path, &crate::timeddb::snapshot::Identity)
                .map(|_| Response::Ok)
        }
        Request::LoadSnapshot { path } => {
            crate::timeddb::snapshot::load_snapshot_atomic(&db, &path, &crate::timeddb::snapshot::Identity)
                .map(Response::Count)
        }
        Request::Clear => db.clear().map(|_| Response::Ok),
        Request::Count => db.count().map(Response::Count),
        Request::Size => db.size().map(Response::Count),
        Request::Status => db.status().map(|s| Response::Status {
            name: s.name,
            count: s.count,
            size_bytes: s.size_bytes,
        }),
        Request::MatchPrefix { prefix, limit } => db.match_prefix(&prefix, limit).map(Response::Keys),
        Request::MatchRegex { pattern, limit } => db.match_regex(&pattern, limit).map(Response::Keys),
        Request::MatchSimilar { target, max_distance, utf, limit } => db
            .match_similar(&target, max_distance, utf, limit)
            .map(Response::Keys),
        Request::Void => Ok(Response::Ok),
        Request::Echo { text } => Ok(Response::Text(text)),
        Request::Report => {
            let status = db.status()?;
            Ok(Response::Text(format!(
                "ktd db={} count={} size_bytes={}",
                status.name, status.count, status.size_bytes
            )))
        }
        Request::IncrementDouble { key, n, origin } => {
            db.increment_double(&key, n, origin).map(Response::Double)
        }
        Request::Synchronize { hard } => db.synchronize(hard).map(|_| Response::Ok),
        Request::Vacuum { steps } => db.vacuum(steps).map(|_| Response::Ok),
        Request::UlogList => db.ulog_files().map(Response::FileNames),
        Request::UlogRemove { file_name } => db.ulog_remove(&file_name).map(|_| Response::Ok),
        Request::PlayScript { script: _ } => Err(KtError::NoImpl("play_script")),
        Request::TuneReplication { whitesid: _ } => Ok(Response::Ok),
        Request::CursorOpen { direction } => Ok(Response::CursorId(session.open_cursor(direction))),
        Request::CursorStep { id } => {
            let cursor = session
                .cursor_mut(id)
                .ok_or_else(|| KtError::invalid("unknown cursor id"))?;
            db.cur_step(cursor).map(Response::Record)
        }
        Request::CursorStepBack { id } => {
            let cursor = session
                .cursor_mut(id)
                .ok_or_else(|| KtError::invalid("unknown cursor id"))?;
            db.cur_step_back(cursor).map(Response::Record)
        }
        Request::CursorJump { id, key } => {
            let cursor = session
                .cursor_mut(id)
                .ok_or_else(|| KtError::invalid("unknown cursor id"))?;
            db.cur_jump(cursor, key.as_deref()).map(|_| Response::Ok)
        }
        Request::CursorJumpBack { id, key } => {
            let cursor = session
                .cursor_mut(id)
                .ok_or_else(|| KtError::invalid("unknown cursor id"))?;
            db.cur_jump_back(cursor, key.as_deref()).map(|_| Response::Ok)
        }
        Request::CursorGet { id } => {
            let cursor = session
                .cursor_mut(id)
                .ok_or_else(|| KtError::invalid("unknown cursor id"))?;
            db.cur_get(cursor).map(Response::Record)
        }
        Request::CursorGetKey { id } => {
            let cursor = session
                .cursor_mut(id)
                .ok_or_else(|| KtError::invalid("unknown cursor id"))?;
            db.cur_get_key(cursor).map(Response::MaybeKey)
        }
        Request::CursorGetValue { id } => {
            let cursor = session
                .cursor_mut(id)
                .ok_or_else(|| KtError::invalid("unknown cursor id"))?;
            db.cur_get_value(cursor).map(Response::MaybeValue)
        }
        Request::CursorSetValue { id, value, xt } => {
            let cursor = session
                .cursor_mut(id)
                .ok_or_else(|| KtError::invalid("unknown cursor id"))?;
            db.cur_set_value(cursor, &value, xt).map(|_| Response::Ok)
        }
        Request::CursorRemove { id } => {
            let cursor = session
                .cursor_mut(id)
                .ok_or_else(|| KtError::invalid("unknown cursor id"))?;
            db.cur_remove(cursor).map(|_| Response::Ok)
        }
        Request::CursorSeize { id } => {
            let cursor = session
                .cursor_mut(id)
                .ok_or_else(|| KtError::invalid("unknown cursor id"))?;
            db.cur_seize(cursor).map(|(v, xt)| Response::Value(v, xt))
        }
        Request::CursorClose { id } => Ok(Response::Bool(session.close_cursor(id))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corestore::{Corestore, DbSpec};
    use std::sync::atomic::Ordering::Relaxed;

    fn store() -> Corestore {
        Corestore::open(
            vec![DbSpec {
                name: "default".into(),
                persistence_option: false,
                capacity_count: 0,
                capacity_size: 0,
            }],
            1,
            None,
        )
        .unwrap()
    }

    #[test]
    fn set_then_get_tallies_counters() {
        let store = store();
        let conditions = ConditionMap::new();
        let mut session = Session::new(store.by_index(0).unwrap());
        let hooks = Hooks::default();

        dispatch(
            Request::Set {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                xt: 60,
                mode: WriteMode::Set,
            },
            &mut session,
            &hooks,
            &store,
            &conditions,
        )
        .unwrap();

        let resp = dispatch(
            Request::Get { key: b"k".to_vec() },
            &mut session,
            &hooks,
            &store,
            &conditions,
        )
        .unwrap();
        match resp.response {
            Response::Value(v, _) => assert_eq!(v, b"v"),
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(session.db.counters().set.load(Relaxed), 1);
        assert_eq!(session.db.counters().get.load(Relaxed), 1);
    }

    #[test]
    fn get_miss_tallies_get_miss_counter() {
        let store = store();
        let conditions = ConditionMap::new();
        let mut session = Session::new(store.by_index(0).unwrap());
        let hooks = Hooks::default();
        let err = dispatch(
            Request::Get { key: b"missing".to_vec() },
            &mut session,
            &hooks,
            &store,
            &conditions,
        );
        assert!(matches!(err, Err(KtError::NoRec)));
        assert_eq!(session.db.counters().get_miss.load(Relaxed), 1);
    }

    #[test]
    fn select_db_hook_switches_session_database() {
        let store = Corestore::open(
            vec![
                DbSpec { name: "a".into(), persistence_option: false, capacity_count: 0, capacity_size: 0 },
                DbSpec { name: "b".into(), persistence_option: false, capacity_count: 0, capacity_size: 0 },
            ],
            1,
            None,
        )
        .unwrap();
        let conditions = ConditionMap::new();
        let mut session = Session::new(store.by_index(0).unwrap());
        let hooks = Hooks {
            select_db: Some("b".to_string()),
            ..Default::default()
        };
        dispatch(Request::Count, &mut session, &hooks, &store, &conditions).unwrap();
        assert_eq!(session.db.name(), "b");
    }

    #[test]
    fn cursor_open_then_step_returns_first_record() {
        let store = store();
        let conditions = ConditionMap::new();
        let mut session = Session::new(store.by_index(0).unwrap());
        let hooks = Hooks::default();
        session.db.set(b"a", b"1", 60).unwrap();

        let id = match dispatch(
            Request::CursorOpen { direction: Direction::Forward },
            &mut session,
            &hooks,
            &store,
            &conditions,
        )
        .unwrap()
        .response
        {
            Response::CursorId(id) => id,
            _ => panic!("expected cursor id"),
        };
        let resp = dispatch(
            Request::CursorStep { id },
            &mut session,
            &hooks,
            &store,
            &conditions,
        )
        .unwrap();
        match resp.response {
            Response::Record(Some((k, v, _))) => {
                assert_eq!(k, b"a");
                assert_eq!(v, b"1");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn wait_hook_times_out_when_never_signaled() {
        let store = store();
        let conditions = ConditionMap::new();
        let mut session = Session::new(store.by_index(0).unwrap());
        let hooks = Hooks {
            wait_on: Some("never".to_string()),
            wait_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let err = dispatch(Request::Count, &mut session, &hooks, &store, &conditions);
        assert!(matches!(err, Err(KtError::Timeout)));
    }

    #[test]
    fn signal_hook_reports_waiter_count() {
        let store = store();
        let conditions = ConditionMap::new();
        let mut session = Session::new(store.by_index(0).unwrap());
        let hooks = Hooks {
            signal: Some("evt".to_string()),
            ..Default::default()
        };
        let resp = dispatch(Request::Count, &mut session, &hooks, &store, &conditions).unwrap();
        assert_eq!(resp.signaled, Some(0));
    }
}
