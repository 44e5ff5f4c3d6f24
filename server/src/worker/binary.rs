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

//! The Binary front end (§6.1): one magic byte at the start of every
//! request multiplexes `{replication, play_script, set_bulk, remove_bulk,
//! get_bulk}` onto a single TCP listener, rather than giving each its own
//! port. `BMREPLICATION` hands the whole connection over to the existing
//! framed replication reader (a slave's open/data/nop exchange is a
//! long-lived stream, not a request/response); the bulk verbs and
//! `play_script` funnel through the same `dispatch::dispatch` the RPC/REST
//! surfaces use, so all three front ends share identical operation
//! semantics and only their framing differs.
//!
//! Record framing here reuses the replication wire's own convention
//! (uvarint-prefixed byte strings, big-endian fixed-width integers)
//! rather than inventing a second length-prefix scheme.

use super::dispatch::{dispatch, Hooks, Request, Response};
use super::session::Session;
use crate::condvar::ConditionMap;
use crate::corestore::Corestore;
use crate::errors::{KtError, KtResult};
use crate::registry::Registry;
use crate::replication::{self, BMERROR, BMNOP, BMREPLICATION};
use crate::util::varint::{read_uvarint, write_uvarint};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;

pub const BMPLAYSCRIPT: u8 = 0xB2;
pub const BMSETBULK: u8 = 0xB8;
pub const BMREMOVEBULK: u8 = 0xB9;
pub const BMGETBULK: u8 = 0xBA;

fn read_uvarint_sync(inp: &mut impl Read) -> KtResult<u64> {
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

fn read_framed(inp: &mut impl Read) -> KtResult<Vec<u8>> {
    let len = read_uvarint_sync(inp)?;
    let mut buf = vec![0u8; len as usize];
    inp.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_framed(out: &mut impl Write, bytes: &[u8]) -> KtResult<()> {
    let mut lenbuf = Vec::new();
    write_uvarint(&mut lenbuf, bytes.len() as u64);
    out.write_all(&lenbuf)?;
    out.write_all(bytes)?;
    Ok(())
}

/// Serializes a dispatch outcome as `status(u8: 0 ok / 1 err)` followed by
/// a payload specific to the request that produced it — the bulk verbs
/// only ever produce `Count`/`Records`, so the encoding doesn't need to
/// cover the full `Response` enum the way the RPC/REST encoders do.
fn write_result(out: &mut impl Write, result: KtResult<Response>) -> KtResult<()> {
    match result {
        Ok(Response::Count(n)) => {
            out.write_all(&[0u8])?;
            let mut buf = Vec::new();
            write_uvarint(&mut buf, n);
            out.write_all(&buf)?;
        }
        Ok(Response::Records(records)) => {
            out.write_all(&[0u8])?;
            let mut buf = Vec::new();
            write_uvarint(&mut buf, records.len() as u64);
            out.write_all(&buf)?;
            for (k, v, xt) in &records {
                write_framed(out, k)?;
                write_framed(out, v)?;
                out.write_all(&xt.to_be_bytes())?;
            }
        }
        Ok(Response::Ok) => {
            out.write_all(&[0u8])?;
        }
        Ok(_) => {
            out.write_all(&[0u8])?;
        }
        Err(e) => {
            out.write_all(&[1u8])?;
            write_framed(out, e.rpc_status().as_bytes())?;
            write_framed(out, e.to_string().as_bytes())?;
        }
    }
    Ok(())
}

/// Handles one binary-surface connection until it closes, hits
/// `BMERROR`, or `registry` signals shutdown.
pub fn serve_connection(
    mut stream: TcpStream,
    corestore: &Corestore,
    conditions: &ConditionMap,
    ulog_dir: &Path,
    sid: u16,
    registry: &Registry,
) -> KtResult<()> {
    let mut magic = [0u8; 1];
    loop {
        if registry.is_shutting_down() {
            return Ok(());
        }
        match stream.peek(&mut magic) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        match magic[0] {
            BMREPLICATION => {
                return replication::serve(stream, ulog_dir, sid, registry);
            }
            BMNOP => {
                stream.read_exact(&mut magic)?;
                stream.write_all(&[BMNOP])?;
            }
            BMPLAYSCRIPT => {
                stream.read_exact(&mut magic)?;
                let db_name = read_framed(&mut stream)?;
                let script = read_framed(&mut stream)?;
                let db = corestore.by_name(&String::from_utf8_lossy(&db_name))?;
                let mut session = Session::new(db);
                let request = Request::PlayScript {
                    script: String::from_utf8_lossy(&script).into_owned(),
                };
                let result = dispatch(request, &mut session, &Hooks::default(), corestore, conditions)
                    .map(|d| d.response);
                write_result(&mut stream, result)?;
            }
            BMSETBULK => {
                stream.read_exact(&mut magic)?;
                let db_name = read_framed(&mut stream)?;
                let count = read_uvarint_sync(&mut stream)?;
                let mut records = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = read_framed(&mut stream)?;
                    let value = read_framed(&mut stream)?;
                    let mut xt_buf = [0u8; 8];
                    stream.read_exact(&mut xt_buf)?;
                    records.push((key, value, i64::from_be_bytes(xt_buf)));
                }
                let result = run_bulk(corestore, conditions, &db_name, Request::SetBulk { records, atomic: false });
                write_result(&mut stream, result)?;
            }
            BMREMOVEBULK => {
                stream.read_exact(&mut magic)?;
                let db_name = read_framed(&mut stream)?;
                let count = read_uvarint_sync(&mut stream)?;
                let mut keys = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    keys.push(read_framed(&mut stream)?);
                }
                let result = run_bulk(corestore, conditions, &db_name, Request::RemoveBulk { keys });
                write_result(&mut stream, result)?;
            }
            BMGETBULK => {
                stream.read_exact(&mut magic)?;
                let db_name = read_framed(&mut stream)?;
                let count = read_uvarint_sync(&mut stream)?;
                let mut keys = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    keys.push(read_framed(&mut stream)?);
                }
                let result = run_bulk(corestore, conditions, &db_name, Request::GetBulk { keys });
                write_result(&mut stream, result)?;
            }
            BMERROR => {
                stream.read_exact(&mut magic)?;
                return Ok(());
            }
            other => {
                stream.read_exact(&mut magic)?;
                return Err(KtError::broken(format!("unknown binary magic {other:#x}")));
            }
        }
    }
}

fn run_bulk(
    corestore: &Corestore,
    conditions: &ConditionMap,
    db_name: &[u8],
    request: Request,
) -> KtResult<Response> {
    let db = corestore.by_name(&String::from_utf8_lossy(db_name))?;
    let mut session = Session::new(db);
    dispatch(request, &mut session, &Hooks::default(), corestore, conditions).map(|d| d.response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framed_bytes_round_trip() {
        let mut buf = Vec::new();
        write_framed(&mut buf, b"hello").unwrap();
        let mut cursor = &buf[..];
        assert_eq!(read_framed(&mut cursor).unwrap(), b"hello".to_vec());
    }

    #[test]
    fn write_result_encodes_count_as_success() {
        let mut buf = Vec::new();
        write_result(&mut buf, Ok(Response::Count(7))).unwrap();
        assert_eq!(buf[0], 0);
        let mut cursor = &buf[1..];
        assert_eq!(read_uvarint_sync(&mut cursor).unwrap(), 7);
    }

    #[test]
    fn write_result_encodes_error_with_status_and_message() {
        let mut buf = Vec::new();
        write_result(&mut buf, Err(KtError::NoRec)).unwrap();
        assert_eq!(buf[0], 1);
        let mut cursor = &buf[1..];
        let status = read_framed(&mut cursor).unwrap();
        assert_eq!(status, b"ELOGIC".to_vec());
    }

    #[test]
    fn write_result_encodes_records_with_key_value_xt() {
        let mut buf = Vec::new();
        write_result(&mut buf, Ok(Response::Records(vec![(b"k".to_vec(), b"v".to_vec(), 60)])))
            .unwrap();
        assert_eq!(buf[0], 0);
        let mut cursor = &buf[1..];
        assert_eq!(read_uvarint_sync(&mut cursor).unwrap(), 1);
        assert_eq!(read_framed(&mut cursor).unwrap(), b"k".to_vec());
        assert_eq!(read_framed(&mut cursor).unwrap(), b"v".to_vec());
    }
}
