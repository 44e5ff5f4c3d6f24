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

//! The replication wire protocol (§4.C): a small framed protocol a slave
//! speaks to a master's replication listener to tail its update log.
//!
//! Every frame starts with a one-byte magic:
//!
//! - `BMREPLICATION` (0xB1): an open request (slave -> master) or a data
//!   frame carrying one update record (master -> slave).
//! - `BMNOP` (0xB0): a heartbeat with no payload, injected every
//!   `DUMMY_FREQ` records so an idle master doesn't look like a stalled
//!   one.
//! - `BMERROR` (0xBF): the master is refusing/aborting the stream; the
//!   payload is a UTF-8 reason string.

use crate::errors::{KtError, KtResult};
use crate::ulog::{LogRecord, UpdateOp};
use crate::util::varint::{read_uvarint, write_uvarint};
use std::io::{Read, Write};

pub const BMREPLICATION: u8 = 0xB1;
pub const BMNOP: u8 = 0xB0;
pub const BMERROR: u8 = 0xBF;

/// Every `DUMMY_FREQ`-th record the master's tailing loop sends, it
/// injects one `Nop` frame regardless of whether there was anything new
/// to send — keeps the connection demonstrably alive during quiet
/// periods.
pub const DUMMY_FREQ: u64 = 256;

/// `Frame::Open.flags` bit: the slave wants only records whose origin sid
/// equals its own (§4.C WHITESID), rather than the default "everything but
/// my own sid" loop-prevention filter.
pub const WHITESID: u32 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Slave -> master: "start streaming dbid `dbid` from `from_ts`,
    /// identifying yourself as sid `sid`", with `flags` carrying mode bits
    /// such as `WHITESID`.
    Open { sid: u16, dbid: u16, from_ts: u64, flags: u32 },
    /// Master -> slave: one logged record.
    Data(LogRecord),
    Nop,
    Error(String),
}

impl Frame {
    pub fn write(&self, out: &mut impl Write) -> KtResult<()> {
        match self {
            Frame::Open { sid, dbid, from_ts, flags } => {
                out.write_all(&[BMREPLICATION, 0])?;
                out.write_all(&sid.to_be_bytes())?;
                out.write_all(&dbid.to_be_bytes())?;
                out.write_all(&from_ts.to_be_bytes())?;
                out.write_all(&flags.to_be_bytes())?;
            }
            Frame::Data(rec) => {
                out.write_all(&[BMREPLICATION, 1])?;
                out.write_all(&rec.ts.to_be_bytes())?;
                out.write_all(&rec.sid.to_be_bytes())?;
                out.write_all(&rec.dbid.to_be_bytes())?;
                let body = encode_op(&rec.op);
                let mut lenbuf = Vec::new();
                write_uvarint(&mut lenbuf, body.len() as u64);
                out.write_all(&lenbuf)?;
                out.write_all(&body)?;
            }
            Frame::Nop => {
                out.write_all(&[BMNOP])?;
            }
            Frame::Error(msg) => {
                out.write_all(&[BMERROR])?;
                let bytes = msg.as_bytes();
                let mut lenbuf = Vec::new();
                write_uvarint(&mut lenbuf, bytes.len() as u64);
                out.write_all(&lenbuf)?;
                out.write_all(bytes)?;
            }
        }
        Ok(())
    }

    pub fn read(inp: &mut impl Read) -> KtResult<Frame> {
        let mut magic = [0u8; 1];
        inp.read_exact(&mut magic)?;
        match magic[0] {
            BMREPLICATION => {
                let mut kind = [0u8; 1];
                inp.read_exact(&mut kind)?;
                match kind[0] {
                    0 => {
                        let mut sid_buf = [0u8; 2];
                        inp.read_exact(&mut sid_buf)?;
                        let mut dbid_buf = [0u8; 2];
                        inp.read_exact(&mut dbid_buf)?;
                        let mut ts_buf = [0u8; 8];
                        inp.read_exact(&mut ts_buf)?;
                        let mut flags_buf = [0u8; 4];
                        inp.read_exact(&mut flags_buf)?;
                        Ok(Frame::Open {
                            sid: u16::from_be_bytes(sid_buf),
                            dbid: u16::from_be_bytes(dbid_buf),
                            from_ts: u64::from_be_bytes(ts_buf),
                            flags: u32::from_be_bytes(flags_buf),
                        })
                    }
                    1 => {
                        let mut ts_buf = [0u8; 8];
                        inp.read_exact(&mut ts_buf)?;
                        let mut sid_buf = [0u8; 2];
                        inp.read_exact(&mut sid_buf)?;
                        let mut dbid_buf = [0u8; 2];
                        inp.read_exact(&mut dbid_buf)?;
                        let len = read_uvarint_sync(inp)?;
                        let mut body = vec![0u8; len as usize];
                        inp.read_exact(&mut body)?;
                        Ok(Frame::Data(LogRecord {
                            ts: u64::from_be_bytes(ts_buf),
                            sid: u16::from_be_bytes(sid_buf),
                            dbid: u16::from_be_bytes(dbid_buf),
                            op: decode_op(&body)?,
                        }))
                    }
                    other => Err(KtError::broken(format!("bad replication frame kind {other}"))),
                }
            }
            BMNOP => Ok(Frame::Nop),
            BMERROR => {
                let len = read_uvarint_sync(inp)?;
                let mut buf = vec![0u8; len as usize];
                inp.read_exact(&mut buf)?;
                let msg = String::from_utf8_lossy(&buf).into_owned();
                Ok(Frame::Error(msg))
            }
            other => Err(KtError::broken(format!("bad replication magic {other:#x}"))),
        }
    }
}

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

// UpdateOp's own (de)serialization is private to the ulog module, so the
// wire protocol keeps a small mirror here rather than reaching into it —
// the two are allowed to drift independently (the log's on-disk framing
// and the wire framing are different concerns that happen to share a
// payload shape today).
fn encode_op(op: &UpdateOp) -> Vec<u8> {
    let mut out = Vec::new();
    match op {
        UpdateOp::Set { key, value, xt } => {
            out.push(1);
            write_uvarint(&mut out, key.len() as u64);
            out.extend_from_slice(key);
            out.extend_from_slice(&xt.to_be_bytes());
            write_uvarint(&mut out, value.len() as u64);
            out.extend_from_slice(value);
        }
        UpdateOp::Remove { key } => {
            out.push(2);
            write_uvarint(&mut out, key.len() as u64);
            out.extend_from_slice(key);
        }
        UpdateOp::Clear => out.push(3),
    }
    out
}

fn decode_op(buf: &[u8]) -> KtResult<UpdateOp> {
    let opcode = *buf.first().ok_or_else(|| KtError::broken("empty op frame"))?;
    let rest = &buf[1..];
    match opcode {
        1 => {
            let (klen, off) = read_uvarint(rest)?;
            let rest = &rest[off..];
            if rest.len() < klen as usize {
                return Err(KtError::broken("truncated op key"));
            }
            let (key, rest) = rest.split_at(klen as usize);
            if rest.len() < 8 {
                return Err(KtError::broken("truncated op xt"));
            }
            let mut xt_buf = [0u8; 8];
            xt_buf.copy_from_slice(&rest[..8]);
            let xt = i64::from_be_bytes(xt_buf);
            let rest = &rest[8..];
            let (vlen, off) = read_uvarint(rest)?;
            let rest = &rest[off..];
            let value = rest
                .get(..vlen as usize)
                .ok_or_else(|| KtError::broken("truncated op value"))?
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
                .ok_or_else(|| KtError::broken("truncated op key"))?
                .to_vec();
            Ok(UpdateOp::Remove { key })
        }
        3 => Ok(UpdateOp::Clear),
        other => Err(KtError::broken(format!("unknown op opcode {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_frame_round_trips() {
        let frame = Frame::Open {
            sid: 7,
            dbid: 2,
            from_ts: 123456,
            flags: WHITESID,
        };
        let mut buf = Vec::new();
        frame.write(&mut buf).unwrap();
        let got = Frame::read(&mut &buf[..]).unwrap();
        assert_eq!(frame, got);
    }

    #[test]
    fn data_frame_round_trips() {
        let frame = Frame::Data(LogRecord {
            ts: 99,
            sid: 1,
            dbid: 0,
            op: UpdateOp::Set {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                xt: 42,
            },
        });
        let mut buf = Vec::new();
        frame.write(&mut buf).unwrap();
        let got = Frame::read(&mut &buf[..]).unwrap();
        assert_eq!(frame, got);
    }

    #[test]
    fn nop_and_error_frames_round_trip() {
        let mut buf = Vec::new();
        Frame::Nop.write(&mut buf).unwrap();
        assert_eq!(Frame::read(&mut &buf[..]).unwrap(), Frame::Nop);

        let mut buf = Vec::new();
        Frame::Error("bad sid".into()).write(&mut buf).unwrap();
        assert_eq!(
            Frame::read(&mut &buf[..]).unwrap(),
            Frame::Error("bad sid".into())
        );
    }
}
