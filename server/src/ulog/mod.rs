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

//! The update logger (§4.B): an append-only, rolling set of files that
//! records every mutation applied to any database on this server, tagged
//! with the originating sid/dbid so a replication reader can filter and a
//! slave can apply records idempotently.
//!
//! Record framing: `ts(u64 be) | sid(u16 be) | dbid(u16 be) | body`, where
//! `body` is an [`UpdateOp`]'s own encoding (opcode byte + varint-length
//! fields). Files roll over once they cross `file_limit` bytes; each file
//! is named by its starting record's timestamp so a [`Reader`] can seek to
//! roughly the right file before scanning.

use crate::errors::{KtError, KtResult};
use crate::registry::Registry;
use crate::util::varint::{read_uvarint, write_uvarint};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const FILE_MAGIC: &[u8; 4] = b"KTUL";

/// A single logged mutation. Mirrors the operations `TimedDb` applies to
/// its backing engine, not the full RPC surface — `add`/`replace`/`cas`
/// etc. all eventually reduce to a `Set` or `Remove` by the time they hit
/// the log, since that's what a replica replays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOp {
    Set { key: Vec<u8>, value: Vec<u8>, xt: i64 },
    Remove { key: Vec<u8> },
    Clear,
}

impl UpdateOp {
    fn opcode(&self) -> u8 {
        match self {
            UpdateOp::Set { .. } => 1,
            UpdateOp::Remove { .. } => 2,
            UpdateOp::Clear => 3,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode()];
        match self {
            UpdateOp::Set { key, value, xt } => {
                write_uvarint(&mut out, key.len() as u64);
                out.extend_from_slice(key);
                out.extend_from_slice(&xt.to_be_bytes());
                write_uvarint(&mut out, value.len() as u64);
                out.extend_from_slice(value);
            }
            UpdateOp::Remove { key } => {
                write_uvarint(&mut out, key.len() as u64);
                out.extend_from_slice(key);
            }
            UpdateOp::Clear => {}
        }
        out
    }

    fn decode(buf: &[u8]) -> KtResult<Self> {
        let opcode = *buf
            .first()
            .ok_or_else(|| KtError::broken("empty update record body"))?;
        let rest = &buf[1..];
        match opcode {
            1 => {
                let (klen, off) = read_uvarint(rest)?;
                let rest = &rest[off..];
                if rest.len() < klen as usize {
                    return Err(KtError::broken("truncated update record key"));
                }
                let (key, rest) = rest.split_at(klen as usize);
                if rest.len() < 8 {
                    return Err(KtError::broken("truncated update record xt"));
                }
                let mut xt_buf = [0u8; 8];
                xt_buf.copy_from_slice(&rest[..8]);
                let xt = i64::from_be_bytes(xt_buf);
                let rest = &rest[8..];
                let (vlen, off) = read_uvarint(rest)?;
                let rest = &rest[off..];
                let value = rest
                    .get(..vlen as usize)
                    .ok_or_else(|| KtError::broken("truncated update record value"))?
                    .to_vec();
                Ok(UpdateOp::Set {
                    key: key.to_vec(),
                    value,
                    xt,
                })
            }
            2 => {
                let (klen, off) = read_uvarint(rest)?;
                let rest = &rest[off..];
                let key = rest
                    .get(..klen as usize)
                    .ok_or_else(|| KtError::broken("truncated update record key"))?
                    .to_vec();
                Ok(UpdateOp::Remove { key })
            }
            3 => Ok(UpdateOp::Clear),
            other => Err(KtError::broken(format!("unknown update opcode {other}"))),
        }
    }
}

/// A fully framed record as it sits on disk / travels over the
/// replication wire: the sid/dbid tag plus the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub ts: u64,
    pub sid: u16,
    pub dbid: u16,
    pub op: UpdateOp,
}

impl LogRecord {
    fn write_framed(&self, out: &mut impl Write) -> KtResult<()> {
        let body = self.op.encode();
        out.write_all(&self.ts.to_be_bytes())?;
        out.write_all(&self.sid.to_be_bytes())?;
        out.write_all(&self.dbid.to_be_bytes())?;
        write_uvarint_to(out, body.len() as u64)?;
        out.write_all(&body)?;
        Ok(())
    }

    fn read_framed(inp: &mut impl Read) -> KtResult<Option<Self>> {
        let mut ts_buf = [0u8; 8];
        match inp.read_exact(&mut ts_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let mut sid_buf = [0u8; 2];
        inp.read_exact(&mut sid_buf)?;
        let mut dbid_buf = [0u8; 2];
        inp.read_exact(&mut dbid_buf)?;
        let len = read_uvarint_from(inp)?;
        let mut body = vec![0u8; len as usize];
        inp.read_exact(&mut body)?;
        Ok(Some(LogRecord {
            ts: u64::from_be_bytes(ts_buf),
            sid: u16::from_be_bytes(sid_buf),
            dbid: u16::from_be_bytes(dbid_buf),
            op: UpdateOp::decode(&body)?,
        }))
    }
}

fn write_uvarint_to(out: &mut impl Write, v: u64) -> KtResult<()> {
    let mut buf = Vec::new();
    write_uvarint(&mut buf, v);
    out.write_all(&buf)?;
    Ok(())
}

fn read_uvarint_from(inp: &mut impl Read) -> KtResult<u64> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        inp.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            break;
        }
    }
    Ok(read_uvarint(&buf)?.0)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_millis() as u64
}

struct WriterState {
    file: File,
    path: PathBuf,
    size: u64,
    last_ts: u64,
}

/// The append-only update log shared by every `TimedDb` on this server.
pub struct UpdateLogger {
    dir: PathBuf,
    file_limit: u64,
    /// Seconds between background flusher passes (§4.B durability); `0`
    /// disables the background thread entirely.
    async_sync_interval: u64,
    writer: Mutex<WriterState>,
}

impl UpdateLogger {
    pub fn open(dir: impl Into<PathBuf>, file_limit: u64, async_sync_interval: u64) -> KtResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let (path, file, size) = Self::open_or_create_latest(&dir)?;
        Ok(Self {
            dir,
            file_limit,
            async_sync_interval,
            writer: Mutex::new(WriterState {
                file,
                path,
                size,
                last_ts: 0,
            }),
        })
    }

    /// Spawns the background flusher thread (§4.B: "an optional background
    /// flusher syncs every asyncSyncInterval seconds"). Returns `None`
    /// without spawning when the interval is `0`.
    pub fn spawn_flusher(logger: Arc<UpdateLogger>, registry: Registry) -> Option<std::thread::JoinHandle<()>> {
        if logger.async_sync_interval == 0 {
            return None;
        }
        let interval = Duration::from_secs(logger.async_sync_interval);
        std::thread::Builder::new()
            .name("ktd-ulog-flusher".to_string())
            .spawn(move || {
                while !registry.is_shutting_down() {
                    std::thread::sleep(interval);
                    if let Err(e) = logger.sync_all() {
                        log::warn!("update log: periodic sync failed: {e}");
                    }
                }
            })
            .ok()
    }

    fn open_or_create_latest(dir: &Path) -> KtResult<(PathBuf, File, u64)> {
        let mut files = Self::list_files(dir)?;
        files.sort();
        if let Some(last) = files.pop() {
            let meta = fs::metadata(&last)?;
            let file = OpenOptions::new().append(true).read(true).open(&last)?;
            Ok((last, file, meta.len()))
        } else {
            Self::create_file(dir, now_millis())
        }
    }

    fn create_file(dir: &Path, start_ts: u64) -> KtResult<(PathBuf, File, u64)> {
        let path = dir.join(format!("{start_ts:020}.ktl"));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(FILE_MAGIC)?;
        file.flush()?;
        Ok((path, file, FILE_MAGIC.len() as u64))
    }

    fn list_files(dir: &Path) -> KtResult<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some("ktl") {
                out.push(entry.path());
            }
        }
        Ok(out)
    }

    /// All log files in ascending (oldest-first) order.
    pub fn list(&self) -> KtResult<Vec<PathBuf>> {
        let mut files = Self::list_files(&self.dir)?;
        files.sort();
        Ok(files)
    }

    /// Deletes a rotated log file by its file name (`ulog_remove` RPC).
    /// Refuses to remove the file currently being appended to.
    pub fn remove(&self, file_name: &str) -> KtResult<()> {
        let state = self.writer.lock();
        if state.path.file_name().and_then(|n| n.to_str()) == Some(file_name) {
            return Err(KtError::invalid("cannot remove the active update log file"));
        }
        drop(state);
        let path = self.dir.join(file_name);
        fs::remove_file(&path)?;
        Ok(())
    }

    /// Appends one record, assigning it a strictly-monotonic millisecond
    /// timestamp (reusing `last_ts + 1` if the wall clock has gone
    /// backwards or not advanced since the previous record — §4.B "clock
    /// monotonicity").
    pub fn append(&self, sid: u16, dbid: u16, op: UpdateOp) -> KtResult<u64> {
        let mut state = self.writer.lock();
        let ts = now_millis().max(state.last_ts + 1);
        state.last_ts = ts;
        let record = LogRecord {
            ts,
            sid,
            dbid,
            op,
        };
        let mut buf = Vec::new();
        record.write_framed(&mut buf)?;
        state.file.write_all(&buf)?;
        state.size += buf.len() as u64;
        if state.size >= self.file_limit {
            self.rotate(&mut state)?;
        }
        Ok(ts)
    }

    fn rotate(&self, state: &mut WriterState) -> KtResult<()> {
        state.file.flush()?;
        let (path, file, size) = Self::create_file(&self.dir, state.last_ts + 1)?;
        state.path = path;
        state.file = file;
        state.size = size;
        Ok(())
    }

    pub fn flush(&self) -> KtResult<()> {
        self.writer.lock().file.flush()?;
        Ok(())
    }

    /// Flushes the Rust-level write buffer, then fsyncs the file so its
    /// data is durable across a crash (`synchronize(hard=true)`).
    pub fn sync_all(&self) -> KtResult<()> {
        let state = self.writer.lock();
        state.file.sync_all()?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// A tailing reader over the log file set, used by the replication engine
/// (§4.C) to stream records from a given timestamp onward.
pub struct Reader {
    dir: PathBuf,
    files: Vec<PathBuf>,
    file_idx: usize,
    current: Option<BufReader<File>>,
    from_ts: u64,
}

impl Reader {
    pub fn open(dir: impl Into<PathBuf>, from_ts: u64) -> KtResult<Self> {
        let dir = dir.into();
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some("ktl") {
                files.push(entry.path());
            }
        }
        files.sort();
        // Start from the last file whose name timestamp is <= from_ts, so
        // we don't miss records appended to a file started before from_ts.
        let file_idx = files
            .iter()
            .rposition(|p| Self::file_start_ts(p) <= from_ts)
            .unwrap_or(0);
        Ok(Self {
            dir,
            files,
            file_idx,
            current: None,
            from_ts,
        })
    }

    fn file_start_ts(path: &Path) -> u64 {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    fn ensure_current(&mut self) -> KtResult<bool> {
        if self.current.is_some() {
            return Ok(true);
        }
        let Some(path) = self.files.get(self.file_idx) else {
            return Ok(false);
        };
        let mut file = File::open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != FILE_MAGIC {
            return Err(KtError::broken("bad update log file magic"));
        }
        self.current = Some(BufReader::new(file));
        Ok(true)
    }

    /// Reads the next record at or after `from_ts`, returning `None` once
    /// every known file is exhausted (the caller should then poll again —
    /// tailing, not EOF, is the terminal state for a live reader).
    pub fn read(&mut self) -> KtResult<Option<LogRecord>> {
        loop {
            if !self.ensure_current()? {
                return Ok(None);
            }
            let reader = self.current.as_mut().unwrap();
            match LogRecord::read_framed(reader)? {
                Some(rec) => {
                    if rec.ts < self.from_ts {
                        continue;
                    }
                    return Ok(Some(rec));
                }
                None => {
                    // this file is exhausted; advance to the next one if it
                    // exists, otherwise signal "nothing more right now".
                    if self.file_idx + 1 < self.files.len() {
                        self.file_idx += 1;
                        self.current = None;
                        continue;
                    }
                    // refresh file list in case a rotation created a new file
                    // while we were tailing the last one
                    let mut files = Vec::new();
                    for entry in fs::read_dir(&self.dir)? {
                        let entry = entry?;
                        if entry.path().extension().and_then(|e| e.to_str()) == Some("ktl") {
                            files.push(entry.path());
                        }
                    }
                    files.sort();
                    if files.len() > self.files.len() {
                        self.files = files;
                        self.file_idx += 1;
                        self.current = None;
                        continue;
                    }
                    return Ok(None);
                }
            }
        }
    }

    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let log = UpdateLogger::open(dir.path(), 1 << 20, 0).unwrap();
        log.append(
            1,
            0,
            UpdateOp::Set {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                xt: 12345,
            },
        )
        .unwrap();
        log.append(1, 0, UpdateOp::Remove { key: b"k".to_vec() })
            .unwrap();
        log.flush().unwrap();

        let mut reader = Reader::open(dir.path(), 0).unwrap();
        let first = reader.read().unwrap().unwrap();
        assert_eq!(
            first.op,
            UpdateOp::Set {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                xt: 12345
            }
        );
        let second = reader.read().unwrap().unwrap();
        assert_eq!(second.op, UpdateOp::Remove { key: b"k".to_vec() });
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn reader_from_ts_skips_earlier_records() {
        let dir = tempdir().unwrap();
        let log = UpdateLogger::open(dir.path(), 1 << 20, 0).unwrap();
        let first_ts = log.append(1, 0, UpdateOp::Clear).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        log.append(1, 0, UpdateOp::Clear).unwrap();
        log.flush().unwrap();

        let mut reader = Reader::open(dir.path(), first_ts + 1).unwrap();
        let rec = reader.read().unwrap().unwrap();
        assert!(rec.ts > first_ts);
    }

    #[test]
    fn rotation_creates_a_new_file_past_the_limit() {
        let dir = tempdir().unwrap();
        let log = UpdateLogger::open(dir.path(), 16, 0).unwrap();
        for i in 0..20u32 {
            log.append(
                1,
                0,
                UpdateOp::Set {
                    key: format!("k{i}").into_bytes(),
                    value: b"v".to_vec(),
                    xt: 0,
                },
            )
            .unwrap();
        }
        assert!(log.list().unwrap().len() > 1);
    }
}
