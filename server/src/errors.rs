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

//! The error taxonomy threaded through every layer (storage, replication,
//! wire protocols). Database-level errors are captured and returned as
//! values; only truly unrecoverable conditions (corrupt log/snapshot) are
//! logged and surfaced as [`KtError::Broken`].

use std::{fmt, io};

pub type KtResult<T> = Result<T, KtError>;

/// The taxonomy from the error handling design: every fallible operation in
/// this crate returns one of these kinds.
#[derive(Debug)]
pub enum KtError {
    /// Operation not supported on this engine (e.g. scripting, regex engine
    /// missing a feature).
    NoImpl(&'static str),
    /// Bad argument or state.
    Invalid(String),
    /// A required repository (db directory, ulog directory) is missing.
    NoRepos(String),
    /// A writer-only operation was attempted on a read-only handle.
    NoPerm,
    /// Corruption detected (bad magic/checksum/frame).
    Broken(String),
    /// `add` found an existing, non-expired record.
    DupRec,
    /// `get`/`remove`/`replace` found nothing (or found only an expired
    /// record).
    NoRec,
    /// `cas`/`increment` precondition failed.
    Logic(String),
    /// I/O or OS failure.
    Io(io::Error),
    /// A `WAIT` hook's named condition was not signaled before its timeout
    /// elapsed.
    Timeout,
    /// Anything else.
    Misc(String),
}

impl KtError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
    pub fn broken(msg: impl Into<String>) -> Self {
        Self::Broken(msg.into())
    }
    pub fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(msg.into())
    }
    pub fn misc(msg: impl Into<String>) -> Self {
        Self::Misc(msg.into())
    }

    /// Maps this error onto the small status-code space used by the RPC and
    /// binary protocols (§6.2, §7).
    pub fn rpc_status(&self) -> &'static str {
        match self {
            Self::NoImpl(_) => "ENOIMPL",
            Self::Invalid(_) => "EINVALID",
            Self::NoRepos(_) | Self::NoPerm | Self::Broken(_) | Self::Io(_) | Self::Misc(_) => {
                "EINTERNAL"
            }
            Self::DupRec | Self::NoRec | Self::Logic(_) => "ELOGIC",
            Self::Timeout => "ETIMEOUT",
        }
    }

    /// Maps this error onto an HTTP status code for the REST surface (§6.3).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NoRec => 404,
            Self::DupRec | Self::Logic(_) => 450,
            Self::Invalid(_) => 400,
            Self::NoImpl(_) => 501,
            Self::Timeout => 408,
            _ => 500,
        }
    }
}

impl fmt::Display for KtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoImpl(op) => write!(f, "operation not implemented: {op}"),
            Self::Invalid(m) => write!(f, "invalid argument or state: {m}"),
            Self::NoRepos(m) => write!(f, "repository missing: {m}"),
            Self::NoPerm => write!(f, "writer required but handle is read-only"),
            Self::Broken(m) => write!(f, "corruption detected: {m}"),
            Self::DupRec => write!(f, "record already exists"),
            Self::NoRec => write!(f, "no such record"),
            Self::Logic(m) => write!(f, "logic precondition failed: {m}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Timeout => write!(f, "timed out waiting on condition"),
            Self::Misc(m) => write!(f, "error: {m}"),
        }
    }
}

impl std::error::Error for KtError {}

impl From<io::Error> for KtError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
