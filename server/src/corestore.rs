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

//! Corestore (§4.I): the fixed-size array of open databases plus a
//! name-to-index map, mirroring how the dispatcher resolves a `DB`
//! pre-hook's database name/id into the `TimedDb` handle an operation
//! actually runs against.

use crate::errors::{KtError, KtResult};
use crate::timeddb::TimedDb;
use crate::ulog::UpdateLogger;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Construction-time parameters for one database, resolved from config
/// (§4.J) before `Corestore::open` runs.
pub struct DbSpec {
    pub name: String,
    pub persistence_option: bool,
    pub capacity_count: usize,
    pub capacity_size: usize,
}

/// The open set of databases this server is serving. Indices are stable
/// for the process lifetime once assigned; names may be looked up, but
/// the hot path (an already-resolved `DB` pre-hook) indexes directly.
pub struct Corestore {
    dbs: Vec<Arc<TimedDb>>,
    by_name: RwLock<HashMap<String, u16>>,
    sid: u16,
}

impl Corestore {
    /// Opens every database named in `specs`, in order, attaching
    /// `trigger` (the shared update logger) to each unless
    /// `persistence_option` is set (persisted databases don't also need
    /// append-log replication — see DESIGN.md).
    pub fn open(specs: Vec<DbSpec>, sid: u16, trigger: Option<Arc<UpdateLogger>>) -> KtResult<Self> {
        let mut dbs = Vec::with_capacity(specs.len());
        let mut by_name = HashMap::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let index = index as u16;
            if by_name.contains_key(&spec.name) {
                return Err(KtError::invalid(format!("duplicate database name '{}'", spec.name)));
            }
            let db_trigger = if spec.persistence_option {
                None
            } else {
                trigger.clone()
            };
            let db = TimedDb::open(
                spec.name.clone(),
                index,
                sid,
                spec.persistence_option,
                spec.capacity_count,
                spec.capacity_size,
                db_trigger,
            );
            by_name.insert(spec.name, index);
            dbs.push(Arc::new(db));
        }
        Ok(Self {
            dbs,
            by_name: RwLock::new(by_name),
            sid,
        })
    }

    pub fn sid(&self) -> u16 {
        self.sid
    }

    pub fn len(&self) -> usize {
        self.dbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dbs.is_empty()
    }

    pub fn by_index(&self, index: u16) -> KtResult<Arc<TimedDb>> {
        self.dbs
            .get(index as usize)
            .cloned()
            .ok_or_else(|| KtError::invalid(format!("no database at index {index}")))
    }

    pub fn by_name(&self, name: &str) -> KtResult<Arc<TimedDb>> {
        let index = *self
            .by_name
            .read()
            .get(name)
            .ok_or_else(|| KtError::invalid(format!("no database named '{name}'")))?;
        self.by_index(index)
    }

    pub fn names(&self) -> Vec<String> {
        self.dbs.iter().map(|d| d.name().to_string()).collect()
    }

    /// Closes every database, waiting for in-flight operations on each
    /// (§4.D lifecycle) before returning.
    pub fn close_all(&self) {
        for db in &self.dbs {
            db.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> DbSpec {
        DbSpec {
            name: name.to_string(),
            persistence_option: false,
            capacity_count: 0,
            capacity_size: 0,
        }
    }

    #[test]
    fn open_assigns_stable_indices_in_spec_order() {
        let store = Corestore::open(vec![spec("a"), spec("b")], 1, None).unwrap();
        assert_eq!(store.by_name("a").unwrap().index(), 0);
        assert_eq!(store.by_name("b").unwrap().index(), 1);
        assert_eq!(store.by_index(1).unwrap().name(), "b");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Corestore::open(vec![spec("a"), spec("a")], 1, None);
        assert!(matches!(err, Err(KtError::Invalid(_))));
    }

    #[test]
    fn unknown_name_or_index_is_an_error() {
        let store = Corestore::open(vec![spec("a")], 1, None).unwrap();
        assert!(store.by_name("missing").is_err());
        assert!(store.by_index(9).is_err());
    }
}
