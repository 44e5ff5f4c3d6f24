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

//! The slave side of replication (§4.F): connects to a master, streams
//! [`protocol::Frame`]s, and applies each data frame to the local
//! `TimedDb` via `recover`. Tracks replication progress (`rts`, the
//! timestamp of the last applied record) in a small fixed-width file so a
//! restarted slave resumes roughly where it left off rather than
//! re-streaming the whole log.

use super::protocol::Frame;
use crate::errors::{KtError, KtResult};
use crate::timeddb::TimedDb;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// `rts` files are exactly this many bytes: a right-padded (with spaces)
/// decimal `u64` followed by a newline. Fixed width means `fs::write` is
/// effectively atomic with respect to a concurrent reader on most
/// filesystems (no length change straddling a crash).
const RTS_FILE_LEN: usize = 21;

/// The slave connection's lifecycle state (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlaveState {
    /// Not yet connected, or reconnecting after a drop.
    Connect = 0,
    /// Connected and actively applying data frames.
    Streaming = 1,
    /// Connected but intentionally not applying records (e.g. paused by
    /// an operator, or waiting on a dependency database to open).
    Deferred = 2,
    /// Configuration changed (new master address/dbid) and the
    /// connection needs to be torn down and re-established.
    Reconfigured = 3,
}

impl SlaveState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SlaveState::Connect,
            1 => SlaveState::Streaming,
            2 => SlaveState::Deferred,
            _ => SlaveState::Reconfigured,
        }
    }
}

/// Reads the persisted replication timestamp, treating a missing, short,
/// or garbled file as `0` (replicate from the very start of the log)
/// rather than failing startup.
pub fn read_rts(path: &Path) -> u64 {
    let Ok(bytes) = fs::read(path) else {
        return 0;
    };
    if bytes.len() < RTS_FILE_LEN {
        return 0;
    }
    std::str::from_utf8(&bytes[..RTS_FILE_LEN])
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

pub fn write_rts(path: &Path, ts: u64) -> KtResult<()> {
    let mut line = format!("{ts}");
    if line.len() > RTS_FILE_LEN - 1 {
        return Err(KtError::invalid("rts value too large to persist"));
    }
    line.push_str(&" ".repeat(RTS_FILE_LEN - 1 - line.len()));
    line.push('\n');
    fs::write(path, line.as_bytes())?;
    Ok(())
}

/// A slave's connection to one master, serving one local `TimedDb`.
pub struct Slave {
    db: Arc<TimedDb>,
    dbid: u16,
    local_sid: u16,
    rts_path: PathBuf,
    state: AtomicU8,
}

impl Slave {
    pub fn new(db: Arc<TimedDb>, dbid: u16, local_sid: u16, rts_path: PathBuf) -> Self {
        Self {
            db,
            dbid,
            local_sid,
            rts_path,
            state: AtomicU8::new(SlaveState::Connect as u8),
        }
    }

    pub fn state(&self) -> SlaveState {
        SlaveState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, s: SlaveState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    pub fn defer(&self) {
        self.set_state(SlaveState::Deferred);
    }

    pub fn reconfigure(&self) {
        self.set_state(SlaveState::Reconfigured);
    }

    /// Drives one connection lifetime: sends the open frame, then applies
    /// data frames until the stream ends, a shutdown is requested, or the
    /// state is flipped to `Deferred`/`Reconfigured` by another thread.
    /// Returns once the caller should reconnect (or stop, for
    /// `Reconfigured`/shutdown).
    pub fn run(
        &self,
        mut stream: impl Read + Write,
        should_continue: impl Fn() -> bool,
    ) -> KtResult<()> {
        self.set_state(SlaveState::Connect);
        let from_ts = read_rts(&self.rts_path);
        Frame::Open {
            sid: self.local_sid,
            dbid: self.dbid,
            from_ts,
            flags: 0,
        }
        .write(&mut stream)?;
        self.set_state(SlaveState::Streaming);

        while should_continue() && self.state() == SlaveState::Streaming {
            let frame = Frame::read(&mut stream)?;
            match frame {
                Frame::Data(rec) => {
                    if rec.dbid != self.dbid {
                        continue;
                    }
                    self.db.set_write_origin(rec.sid);
                    let res = self.db.recover(&rec.op);
                    self.db.clear_write_origin();
                    res?;
                    write_rts(&self.rts_path, rec.ts)?;
                }
                Frame::Nop => continue,
                Frame::Error(msg) => {
                    return Err(KtError::broken(format!("master refused stream: {msg}")));
                }
                Frame::Open { .. } => {
                    return Err(KtError::broken("unexpected open frame from master"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ulog::UpdateOp;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn rts_round_trips_through_the_fixed_width_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rts");
        write_rts(&path, 123456789).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, RTS_FILE_LEN);
        assert_eq!(read_rts(&path), 123456789);
    }

    #[test]
    fn missing_rts_file_reads_as_zero() {
        let dir = tempdir().unwrap();
        assert_eq!(read_rts(&dir.path().join("nope")), 0);
    }

    #[test]
    fn garbled_rts_file_reads_as_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rts");
        fs::write(&path, b"not a number at all!!").unwrap();
        assert_eq!(read_rts(&path), 0);
    }

    #[test]
    fn slave_applies_a_data_frame_and_persists_rts() {
        let dir = tempdir().unwrap();
        let rts_path = dir.path().join("rts");
        let db = Arc::new(TimedDb::open("replica", 0, 9, false, 0, 0, None));
        let slave = Slave::new(db.clone(), 0, 9, rts_path.clone());

        let mut wire = Vec::new();
        Frame::Data(crate::ulog::LogRecord {
            ts: 555,
            sid: 1,
            dbid: 0,
            op: UpdateOp::Set {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                xt: 0,
            },
        })
        .write(&mut wire)
        .unwrap();

        let stream = Duplex {
            read: Cursor::new(wire),
            write: Vec::new(),
        };
        let mut calls = 0;
        let _ = slave.run(stream, || {
            calls += 1;
            calls <= 1
        });
        assert_eq!(db.get(b"k").unwrap().0, b"v");
        assert_eq!(read_rts(&rts_path), 555);
    }

    /// A stream whose reads and writes go to independent buffers, so a
    /// test can hand `run` a fixed script of incoming frames without the
    /// outgoing open frame clobbering it (a single shared `Cursor<Vec<u8>>`
    /// would overwrite the script's start with the write).
    struct Duplex {
        read: Cursor<Vec<u8>>,
        write: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.read.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.write.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
