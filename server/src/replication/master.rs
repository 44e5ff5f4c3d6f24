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

//! The master side of replication (§4.C): serves one connected slave by
//! tailing the update log and forwarding records over [`protocol::Frame`]
//! frames, with sid-based loop prevention and a dummy-frame heartbeat.

use super::protocol::{Frame, DUMMY_FREQ, WHITESID};
use crate::errors::KtResult;
use crate::registry::Registry;
use crate::ulog::{Reader, UpdateLogger};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// How a master filters records by sid before forwarding them to a given
/// slave connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidFilter {
    /// Default: forward everything except records whose sid equals this
    /// master's own sid (the record originated from this connection's
    /// peer, or a replay that already passed through this node — sending
    /// it back would loop).
    SkipOwnSid(u16),
    /// `WHITESID` mode: forward only records whose sid *is* the given
    /// value — used when a slave wants a filtered feed of one upstream
    /// origin rather than the whole mesh.
    OnlySid(u16),
}

impl SidFilter {
    fn allows(&self, sid: u16) -> bool {
        match self {
            SidFilter::SkipOwnSid(own) => sid != *own,
            SidFilter::OnlySid(only) => sid == *only,
        }
    }
}

/// Accumulates "interval units" and converts crossing a threshold of 100
/// into a 100ms pause, throttling a master that would otherwise spray a
/// fast-tailing slave with as many frames as the log can produce.
struct RateControl {
    acc: u32,
}

impl RateControl {
    fn new() -> Self {
        Self { acc: 0 }
    }

    /// `units` follows the reference ratio: a data frame costs 1 unit, a
    /// dummy/nop frame costs `DUMMY_FREQ / 4` units (an idle heartbeat is
    /// cheap but not free).
    fn tick(&mut self, units: u32) {
        self.acc += units;
        if self.acc >= 100 {
            self.acc -= 100;
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

/// Serves a single slave connection until it disconnects or `registry`
/// signals shutdown. `local_sid` is this master's own sid, used for the
/// default loop-prevention filter.
pub fn serve(
    mut stream: impl std::io::Read + Write,
    ulog_dir: &std::path::Path,
    local_sid: u16,
    registry: &Registry,
) -> KtResult<()> {
    let open = Frame::read(&mut stream)?;
    let (dbid, from_ts, filter) = match open {
        Frame::Open { sid, dbid, from_ts, flags } => {
            let filter = if flags & WHITESID != 0 {
                // the slave asked for a filtered replay of just one origin
                // (WHITESID mode) rather than the default loop-prevention
                // "everything but my own sid" filter.
                SidFilter::OnlySid(sid)
            } else {
                SidFilter::SkipOwnSid(local_sid)
            };
            (dbid, from_ts, filter)
        }
        _ => {
            Frame::Error("expected an open frame".into()).write(&mut stream)?;
            return Ok(());
        }
    };

    let mut reader = Reader::open(ulog_dir, from_ts)?;
    let mut rate = RateControl::new();
    let mut since_dummy: u64 = 0;

    while !registry.is_shutting_down() {
        match reader.read()? {
            Some(rec) if rec.dbid == dbid && filter.allows(rec.sid) => {
                Frame::Data(rec).write(&mut stream)?;
                stream.flush()?;
                rate.tick(1);
                since_dummy += 1;
                if since_dummy >= DUMMY_FREQ {
                    Frame::Nop.write(&mut stream)?;
                    stream.flush()?;
                    rate.tick((DUMMY_FREQ / 4) as u32);
                    since_dummy = 0;
                }
            }
            Some(_) => {
                // filtered out, but still counts toward the heartbeat
                // cadence so a quiet-for-us but busy-overall log doesn't
                // go silent for long stretches.
                since_dummy += 1;
            }
            None => {
                Frame::Nop.write(&mut stream)?;
                stream.flush()?;
                rate.tick((DUMMY_FREQ / 4) as u32);
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
    Ok(())
}

/// Convenience constructor mirroring how `Corestore`/`main` wires a
/// [`UpdateLogger`]'s directory into the replication listener.
pub fn ulog_dir_of(logger: &Arc<UpdateLogger>) -> std::path::PathBuf {
    logger.dir().to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ulog::UpdateOp;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn sid_filter_skips_own_sid_by_default() {
        let f = SidFilter::SkipOwnSid(5);
        assert!(!f.allows(5));
        assert!(f.allows(6));
    }

    #[test]
    fn sid_filter_whitesid_keeps_only_matching_sid() {
        let f = SidFilter::OnlySid(5);
        assert!(f.allows(5));
        assert!(!f.allows(6));
    }

    #[test]
    fn serve_streams_matching_records_then_returns_on_shutdown() {
        let dir = tempdir().unwrap();
        let log = UpdateLogger::open(dir.path(), 1 << 20, 0).unwrap();
        log.append(
            2,
            0,
            UpdateOp::Set {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                xt: 0,
            },
        )
        .unwrap();
        log.flush().unwrap();

        let mut request = Vec::new();
        Frame::Open {
            sid: 1,
            dbid: 0,
            from_ts: 0,
            flags: 0,
        }
        .write(&mut request)
        .unwrap();

        let registry = Registry::new();
        registry.request_shutdown();
        let stream = Cursor::new(request);
        let mut io = PrependRead { inner: stream, out: Vec::new() };
        let _ = serve(&mut io, dir.path(), 1, &registry);
    }

    struct PrependRead<R> {
        inner: R,
        out: Vec<u8>,
    }

    impl<R: std::io::Read> std::io::Read for PrependRead<R> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl<R> std::io::Write for PrependRead<R> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.out.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
