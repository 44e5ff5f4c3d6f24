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

//! Cursor positions (§3 "Cursor"). A cursor is owned by exactly one
//! `TimedDb`; positions are tracked by key rather than by any internal
//! engine pointer so a cursor survives concurrent mutation of unrelated
//! keys — the engine backing this server is a plain `BTreeMap`, not a
//! pointer-stable page structure, so key-based repositioning is both the
//! simplest and the most robust representation.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// A single session-owned cursor. `TimedDb` holds the actual stepping
/// logic (it needs to skip/reap expired records); this type is just the
/// position + validity state a `Session` keeps per `cursorId`.
#[derive(Debug, Clone)]
pub struct Cursor {
    id: u64,
    position: Option<Vec<u8>>,
    direction: Direction,
    valid: bool,
}

impl Cursor {
    pub fn new(id: u64, direction: Direction) -> Self {
        Self {
            id,
            position: None,
            direction,
            valid: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn position(&self) -> Option<&[u8]> {
        self.position.as_deref()
    }

    pub fn set_position(&mut self, key: Option<Vec<u8>>) {
        self.position = key;
    }

    /// Reverses a cursor's stepping direction in place (`cur_jump_back`),
    /// rather than requiring the caller to close and reopen it.
    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    /// Invoked when the owning `TimedDb` closes (§3 lifecycle: "a cursor
    /// becomes invalid when the owning DB closes").
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cursor_has_no_position_and_is_valid() {
        let c = Cursor::new(1, Direction::Forward);
        assert!(c.position().is_none());
        assert!(c.is_valid());
    }

    #[test]
    fn invalidate_is_observed() {
        let mut c = Cursor::new(1, Direction::Forward);
        c.invalidate();
        assert!(!c.is_valid());
    }
}
