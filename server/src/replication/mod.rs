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

//! Replication (§4.C, §4.F): a master tails its own update log to every
//! connected slave over a small framed protocol; a slave applies what it
//! receives to a local `TimedDb` and tracks progress so a restart resumes
//! close to where it left off.

pub mod master;
pub mod protocol;
pub mod slave;

pub use master::{serve, SidFilter};
pub use protocol::{Frame, BMERROR, BMNOP, BMREPLICATION, DUMMY_FREQ};
pub use slave::{read_rts, write_rts, Slave, SlaveState};
