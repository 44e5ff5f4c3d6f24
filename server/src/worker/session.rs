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

//! Per-connection session state (§4.E): which database the connection is
//! currently bound to, and the cursors it has opened. One `Session` is
//! created per accepted connection and lives for its lifetime; a worker
//! thread borrows it mutably while processing that connection's request.

use crate::timeddb::cursor::{Cursor, Direction};
use crate::timeddb::TimedDb;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Session {
    pub db: Arc<TimedDb>,
    cursors: HashMap<u64, Cursor>,
}

impl Session {
    pub fn new(db: Arc<TimedDb>) -> Self {
        Self {
            db,
            cursors: HashMap::new(),
        }
    }

    pub fn select_db(&mut self, db: Arc<TimedDb>) {
        self.db = db;
    }

    pub fn open_cursor(&mut self, direction: Direction) -> u64 {
        let cursor = self.db.new_cursor(direction);
        let id = cursor.id();
        self.cursors.insert(id, cursor);
        id
    }

    pub fn cursor_mut(&mut self, id: u64) -> Option<&mut Cursor> {
        self.cursors.get_mut(&id)
    }

    pub fn close_cursor(&mut self, id: u64) -> bool {
        self.cursors.remove(&id).is_some()
    }
}
