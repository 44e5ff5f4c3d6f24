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

//! Shared, dependency-light utilities used by the server binary and its
//! tooling. Kept separate from `server` so future client/bench crates can
//! depend on it without pulling in the storage engine.

pub mod util;

/// The on-disk version stamp written into snapshot headers and reported by
/// `status`/`report`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of the per-connection read buffer.
pub const BUF_CAP: usize = 8 * 1024;
