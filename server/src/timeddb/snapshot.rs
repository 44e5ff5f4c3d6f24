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

//! Snapshot dump/load (§4.D.5): a point-in-time serialization of a
//! database's full record set, used for `save`/`load` and for seeding a
//! newly-registered slave before it starts tailing the update log.
//!
//! On-disk layout:
//! ```text
//! "KTSS\n" | checksum(u32 be) | ts(u64 be) | count(u64 be) | size(u64 be)
//! [ 0xCC | keylen(varint) | key | vallen(varint) | value ] *count
//! ```
//! `checksum` covers every byte following it, computed with CRC-32 rather
//! than the reference implementation's murmur hash (see DESIGN.md) —
//! `size` is the uncompressed record-stream length, `count` the number of
//! records. Records are written through a pluggable [`Compressor`] so a
//! future on-disk format can turn compression on without touching this
//! framing.

use super::kvengine::MemEngine;
use super::TimedDb;
use crate::errors::{KtError, KtResult};
use crate::util::now_epoch_seconds;
use crate::util::varint::{read_uvarint, write_uvarint};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8] = b"KTSS\n";
const RECORD_TAG: u8 = 0xCC;
/// Buffering unit for the record stream, mirroring the reference
/// implementation's `SSIOUNIT` (1 MiB).
pub const SSIOUNIT: usize = 1 << 20;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A pluggable record-stream transform. The identity compressor is the
/// default; a real deployment could plug in a streaming codec here
/// without changing the header/record framing.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> KtResult<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> KtResult<Vec<u8>>;
}

pub struct Identity;

impl Compressor for Identity {
    fn compress(&self, data: &[u8]) -> KtResult<Vec<u8>> {
        Ok(data.to_vec())
    }
    fn decompress(&self, data: &[u8]) -> KtResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

fn encode_records(engine: &MemEngine) -> Vec<u8> {
    let mut body = Vec::with_capacity(SSIOUNIT.min(engine.size_bytes() + 64));
    for (key, value) in engine.iter() {
        body.push(RECORD_TAG);
        write_uvarint(&mut body, key.len() as u64);
        body.extend_from_slice(key);
        write_uvarint(&mut body, value.len() as u64);
        body.extend_from_slice(value);
    }
    body
}

fn decode_records(mut body: &[u8]) -> KtResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    while !body.is_empty() {
        let tag = body[0];
        if tag != RECORD_TAG {
            return Err(KtError::broken("bad snapshot record tag"));
        }
        body = &body[1..];
        let (klen, off) = read_uvarint(body)?;
        body = &body[off..];
        if body.len() < klen as usize {
            return Err(KtError::broken("truncated snapshot key"));
        }
        let (key, rest) = body.split_at(klen as usize);
        body = rest;
        let (vlen, off) = read_uvarint(body)?;
        body = &body[off..];
        if body.len() < vlen as usize {
            return Err(KtError::broken("truncated snapshot value"));
        }
        let (value, rest) = body.split_at(vlen as usize);
        body = rest;
        out.push((key.to_vec(), value.to_vec()));
    }
    Ok(out)
}

/// Dumps `db`'s full raw record set (values as stored, xt prefix
/// included) to `path`, under the db's read lock so the snapshot is a
/// single consistent point in time.
pub fn dump_snapshot_atomic(db: &TimedDb, path: impl AsRef<Path>, compressor: &dyn Compressor) -> KtResult<()> {
    let path = path.as_ref();
    let tmp_path = path.with_extension("tmp");
    let guard = db.read_guard();
    let body = encode_records(&guard);
    let count = guard.len() as u64;
    let size = body.len() as u64;
    drop(guard);

    let compressed = compressor.compress(&body)?;
    let mut checksum_input = Vec::with_capacity(8 + 8 + 8 + compressed.len());
    checksum_input.extend_from_slice(&count.to_be_bytes());
    checksum_input.extend_from_slice(&size.to_be_bytes());
    checksum_input.extend_from_slice(&compressed);
    let checksum = CRC32.checksum(&checksum_input);

    let file = File::create(&tmp_path)?;
    let mut out = BufWriter::with_capacity(SSIOUNIT, file);
    out.write_all(MAGIC)?;
    out.write_all(&checksum.to_be_bytes())?;
    out.write_all(&(now_epoch_seconds() as u64).to_be_bytes())?;
    out.write_all(&count.to_be_bytes())?;
    out.write_all(&size.to_be_bytes())?;
    out.write_all(&compressed)?;
    out.flush()?;
    drop(out);
    // rename is atomic on the same filesystem, giving load_snapshot_atomic
    // a guarantee it never observes a half-written file.
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Loads a snapshot written by [`dump_snapshot_atomic`] into `db`,
/// replacing its current contents entirely. Records are inserted at the
/// engine level (bypassing `set`'s own xt framing) so the loaded values'
/// expirations are reproduced exactly.
pub fn load_snapshot_atomic(db: &TimedDb, path: impl AsRef<Path>, compressor: &dyn Compressor) -> KtResult<u64> {
    let mut file = File::open(path.as_ref())?;
    let mut magic = [0u8; 5];
    file.read_exact(&mut magic)?;
    if magic != *MAGIC {
        return Err(KtError::broken("bad snapshot magic"));
    }
    let mut checksum_buf = [0u8; 4];
    file.read_exact(&mut checksum_buf)?;
    let expected_checksum = u32::from_be_bytes(checksum_buf);
    let mut ts_buf = [0u8; 8];
    file.read_exact(&mut ts_buf)?;
    let mut count_buf = [0u8; 8];
    file.read_exact(&mut count_buf)?;
    let count = u64::from_be_bytes(count_buf);
    let mut size_buf = [0u8; 8];
    file.read_exact(&mut size_buf)?;
    let size = u64::from_be_bytes(size_buf);

    let mut compressed = Vec::new();
    file.read_to_end(&mut compressed)?;

    let mut checksum_input = Vec::with_capacity(8 + 8 + compressed.len());
    checksum_input.extend_from_slice(&count_buf);
    checksum_input.extend_from_slice(&size_buf);
    checksum_input.extend_from_slice(&compressed);
    if CRC32.checksum(&checksum_input) != expected_checksum {
        return Err(KtError::broken("snapshot checksum mismatch"));
    }

    let body = compressor.decompress(&compressed)?;
    if body.len() as u64 != size {
        return Err(KtError::broken("snapshot size header mismatch"));
    }
    let records = decode_records(&body)?;
    if records.len() as u64 != count {
        return Err(KtError::broken("snapshot count header mismatch"));
    }

    let mut guard = db.write_guard();
    guard.clear();
    for (key, value) in &records {
        guard.set(key.clone(), value.clone());
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeddb::TimedDb;
    use tempfile::tempdir;

    #[test]
    fn dump_then_load_round_trips_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.kss");
        let src = TimedDb::open("src", 0, 1, false, 0, 0, None);
        src.set(b"a", b"1", 60).unwrap();
        src.set(b"b", b"2", 60).unwrap();
        dump_snapshot_atomic(&src, &path, &Identity).unwrap();

        let dest = TimedDb::open("dest", 1, 1, false, 0, 0, None);
        let n = load_snapshot_atomic(&dest, &path, &Identity).unwrap();
        assert_eq!(n, 2);
        assert_eq!(dest.count().unwrap(), 2);
        let (v, _) = dest.get(b"a").unwrap();
        assert_eq!(v, b"1");
    }

    #[test]
    fn load_rejects_corrupted_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.kss");
        let src = TimedDb::open("src", 0, 1, false, 0, 0, None);
        src.set(b"a", b"1", 60).unwrap();
        dump_snapshot_atomic(&src, &path, &Identity).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let dest = TimedDb::open("dest", 1, 1, false, 0, 0, None);
        assert!(matches!(
            load_snapshot_atomic(&dest, &path, &Identity),
            Err(KtError::Broken(_))
        ));
    }
}
