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

//! The line-oriented RPC surface (§6.2): one request per line, tab
//! separated — `METHOD<TAB>field=value<TAB>field=value...` — terminated
//! by `\n`. Chosen as the concrete realization of the spec's "RPC/HTTP
//! hybrid" wire format: simple enough to parse without a generic codec
//! dependency, in the same spirit as the reference implementation's own
//! TSV-RPC protocol.

use super::dispatch::{Dispatched, Hooks, Request, Response};
use crate::errors::{KtError, KtResult};
use crate::timeddb::cursor::Direction;
use crate::timeddb::WriteMode;
use std::collections::HashMap;
use std::time::Duration;

fn fields(line: &str) -> HashMap<&str, &str> {
    line.split('\t')
        .skip(1)
        .filter_map(|f| f.split_once('='))
        .collect()
}

fn req_field<'a>(map: &HashMap<&'a str, &'a str>, name: &str) -> KtResult<&'a str> {
    map.get(name)
        .copied()
        .ok_or_else(|| KtError::invalid(format!("missing field '{name}'")))
}

/// Parses one request line into a `(Request, Hooks)` pair. Hooks are
/// carried as the reserved `db=`/`wait=`/`signal=` fields, present on any
/// method.
pub fn parse_line(line: &str) -> KtResult<(Request, Hooks)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let method = line
        .split('\t')
        .next()
        .ok_or_else(|| KtError::invalid("empty request line"))?;
    let map = fields(line);

    let hooks = Hooks {
        select_db: map.get("db").map(|s| s.to_string()),
        wait_on: map.get("wait").map(|s| s.to_string()),
        wait_timeout: map
            .get("wait_ms")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(500)),
        signal: map.get("signal").map(|s| s.to_string()),
        signal_broadcast: map.get("signalbroad").copied() == Some("true"),
    };

    let request = match method {
        "get" => Request::Get {
            key: req_field(&map, "key")?.as_bytes().to_vec(),
        },
        "set" | "add" | "replace" => Request::Set {
            key: req_field(&map, "key")?.as_bytes().to_vec(),
            value: req_field(&map, "value")?.as_bytes().to_vec(),
            xt: map.get("xt").and_then(|s| s.parse().ok()).unwrap_or(0),
            mode: match method {
                "add" => WriteMode::Add,
                "replace" => WriteMode::Replace,
                _ => WriteMode::Set,
            },
        },
        "append" => Request::Append {
            key: req_field(&map, "key")?.as_bytes().to_vec(),
            suffix: req_field(&map, "value")?.as_bytes().to_vec(),
            xt: map.get("xt").and_then(|s| s.parse().ok()).unwrap_or(0),
        },
        "remove" => Request::Remove {
            key: req_field(&map, "key")?.as_bytes().to_vec(),
        },
        "seize" => Request::Seize {
            key: req_field(&map, "key")?.as_bytes().to_vec(),
        },
        "check" => Request::Check {
            key: req_field(&map, "key")?.as_bytes().to_vec(),
        },
        "cas" => Request::Cas {
            key: req_field(&map, "key")?.as_bytes().to_vec(),
            old: map.get("old").map(|s| s.as_bytes().to_vec()),
            new: map.get("new").map(|s| s.as_bytes().to_vec()),
        },
        "set_bulk" => {
            let xt = map.get("xt").and_then(|s| s.parse().ok()).unwrap_or(0);
            let atomic = map.get("atomic").copied() == Some("true");
            let records = req_field(&map, "records")?
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|pair| {
                    let (k, v) = pair
                        .split_once(':')
                        .ok_or_else(|| KtError::invalid("malformed 'records' entry, expected k:v"))?;
                    Ok((k.as_bytes().to_vec(), v.as_bytes().to_vec(), xt))
                })
                .collect::<KtResult<Vec<_>>>()?;
            Request::SetBulk { records, atomic }
        }
        "remove_bulk" => Request::RemoveBulk {
            keys: req_field(&map, "keys")?
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec())
                .collect(),
        },
        "get_bulk" => Request::GetBulk {
            keys: req_field(&map, "keys")?
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec())
                .collect(),
        },
        "increment" => Request::Increment {
            key: req_field(&map, "key")?.as_bytes().to_vec(),
            n: req_field(&map, "num")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'num' field"))?,
            origin: map.get("origin").and_then(|s| s.parse().ok()).unwrap_or(0),
        },
        "dump_snapshot" => Request::DumpSnapshot {
            path: req_field(&map, "path")?.to_string(),
        },
        "load_snapshot" => Request::LoadSnapshot {
            path: req_field(&map, "path")?.to_string(),
        },
        "clear" => Request::Clear,
        "count" => Request::Count,
        "size" => Request::Size,
        "status" => Request::Status,
        "match_prefix" => Request::MatchPrefix {
            prefix: req_field(&map, "prefix")?.as_bytes().to_vec(),
            limit: map.get("limit").and_then(|s| s.parse().ok()),
        },
        "match_regex" => Request::MatchRegex {
            pattern: req_field(&map, "pattern")?.to_string(),
            limit: map.get("limit").and_then(|s| s.parse().ok()),
        },
        "match_similar" => Request::MatchSimilar {
            target: req_field(&map, "target")?.as_bytes().to_vec(),
            max_distance: req_field(&map, "max_distance")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'max_distance' field"))?,
            utf: map.get("utf").copied() == Some("true"),
            limit: map.get("limit").and_then(|s| s.parse().ok()),
        },
        "void" => Request::Void,
        "echo" => Request::Echo {
            text: req_field(&map, "message")?.to_string(),
        },
        "report" => Request::Report,
        "increment_double" => Request::IncrementDouble {
            key: req_field(&map, "key")?.as_bytes().to_vec(),
            n: req_field(&map, "num")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'num' field"))?,
            origin: map.get("origin").and_then(|s| s.parse().ok()).unwrap_or(0.0),
        },
        "synchronize" => Request::Synchronize {
            hard: map.get("hard").copied() == Some("true"),
        },
        "vacuum" => Request::Vacuum {
            steps: map.get("steps").and_then(|s| s.parse().ok()).unwrap_or(1),
        },
        "ulog_list" => Request::UlogList,
        "ulog_remove" => Request::UlogRemove {
            file_name: req_field(&map, "file")?.to_string(),
        },
        "play_script" => Request::PlayScript {
            script: req_field(&map, "script")?.to_string(),
        },
        "tune_replication" => Request::TuneReplication {
            whitesid: map.get("whitesid").copied() == Some("true"),
        },
        "cur_open" => Request::CursorOpen {
            direction: if map.get("dir") == Some(&"backward") {
                Direction::Backward
            } else {
                Direction::Forward
            },
        },
        "cur_step" => Request::CursorStep {
            id: req_field(&map, "id")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'id' field"))?,
        },
        "cur_step_back" => Request::CursorStepBack {
            id: req_field(&map, "id")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'id' field"))?,
        },
        "cur_jump" => Request::CursorJump {
            id: req_field(&map, "id")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'id' field"))?,
            key: map.get("key").map(|s| s.as_bytes().to_vec()),
        },
        "cur_jump_back" => Request::CursorJumpBack {
            id: req_field(&map, "id")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'id' field"))?,
            key: map.get("key").map(|s| s.as_bytes().to_vec()),
        },
        "cur_get" => Request::CursorGet {
            id: req_field(&map, "id")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'id' field"))?,
        },
        "cur_get_key" => Request::CursorGetKey {
            id: req_field(&map, "id")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'id' field"))?,
        },
        "cur_get_value" => Request::CursorGetValue {
            id: req_field(&map, "id")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'id' field"))?,
        },
        "cur_set_value" => Request::CursorSetValue {
            id: req_field(&map, "id")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'id' field"))?,
            value: req_field(&map, "value")?.as_bytes().to_vec(),
            xt: map.get("xt").and_then(|s| s.parse().ok()).unwrap_or(0),
        },
        "cur_remove" => Request::CursorRemove {
            id: req_field(&map, "id")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'id' field"))?,
        },
        "cur_seize" => Request::CursorSeize {
            id: req_field(&map, "id")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'id' field"))?,
        },
        "cur_close" | "cur_delete" => Request::CursorClose {
            id: req_field(&map, "id")?
                .parse()
                .map_err(|_| KtError::invalid("bad 'id' field"))?,
        },
        other => return Err(KtError::invalid(format!("unknown method '{other}'"))),
    };
    Ok((request, hooks))
}

/// Encodes a response back into the TSV line format, `STATUS<TAB>...`. A
/// `signal`/`signalbroad` hook that fired appends `signaled=<count>`
/// after the operation's own fields.
pub fn encode_response(result: &KtResult<Dispatched>) -> String {
    match result {
        Ok(dispatched) => {
            let body = match &dispatched.response {
                Response::Value(v, xt) => format!(
                    "SUCCESS\tvalue={}\txt={xt}",
                    String::from_utf8_lossy(v)
                ),
                Response::Ok => "SUCCESS".to_string(),
                Response::Bool(b) => format!("SUCCESS\tresult={b}"),
                Response::Count(n) => format!("SUCCESS\tcount={n}"),
                Response::Keys(keys) => {
                    let joined = keys
                        .iter()
                        .map(|k| String::from_utf8_lossy(k).into_owned())
                        .collect::<Vec<_>>()
                        .join(",");
                    format!("SUCCESS\tkeys={joined}")
                }
                Response::Status { name, count, size_bytes } => {
                    format!("SUCCESS\tname={name}\tcount={count}\tsize={size_bytes}")
                }
                Response::CursorId(id) => format!("SUCCESS\tid={id}"),
                Response::Record(Some((k, v, xt))) => format!(
                    "SUCCESS\tkey={}\tvalue={}\txt={xt}",
                    String::from_utf8_lossy(k),
                    String::from_utf8_lossy(v)
                ),
                Response::Record(None) => "SUCCESS\teof=true".to_string(),
                Response::Records(records) => {
                    let joined = records
                        .iter()
                        .map(|(k, v, xt)| {
                            format!(
                                "{}:{}:{xt}",
                                String::from_utf8_lossy(k),
                                String::from_utf8_lossy(v)
                            )
                        })
                        .collect::<Vec<_>>()
                        .join(",");
                    format!("SUCCESS\trecords={joined}")
                }
                Response::Text(text) => format!("SUCCESS\tmessage={text}"),
                Response::Double(n) => format!("SUCCESS\tnum={n}"),
                Response::FileNames(names) => format!("SUCCESS\tfiles={}", names.join(",")),
                Response::MaybeKey(Some(k)) => {
                    format!("SUCCESS\tkey={}", String::from_utf8_lossy(k))
                }
                Response::MaybeKey(None) => "SUCCESS\teof=true".to_string(),
                Response::MaybeValue(Some(v)) => {
                    format!("SUCCESS\tvalue={}", String::from_utf8_lossy(v))
                }
                Response::MaybeValue(None) => "SUCCESS\teof=true".to_string(),
            };
            match dispatched.signaled {
                Some(count) => format!("{body}\tsignaled={count}"),
                None => body,
            }
        }
        Err(e) => format!("{}\tmessage={e}", e.rpc_status()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_set_request_with_hooks() {
        let (req, hooks) = parse_line("set\tkey=a\tvalue=1\txt=60\tdb=main\n").unwrap();
        assert!(matches!(req, Request::Set { mode: WriteMode::Set, .. }));
        assert_eq!(hooks.select_db.as_deref(), Some("main"));
    }

    #[test]
    fn unknown_method_is_invalid() {
        assert!(matches!(parse_line("frobnicate\n"), Err(KtError::Invalid(_))));
    }

    #[test]
    fn missing_required_field_is_invalid() {
        assert!(matches!(parse_line("get\n"), Err(KtError::Invalid(_))));
    }

    #[test]
    fn encode_response_formats_success_and_error() {
        let ok = Dispatched { response: Response::Ok, signaled: None };
        assert_eq!(encode_response(&Ok(ok)), "SUCCESS");
        let err: KtResult<Dispatched> = Err(KtError::NoRec);
        assert!(encode_response(&err).starts_with("ELOGIC"));
    }

    #[test]
    fn encode_response_appends_signaled_count() {
        let dispatched = Dispatched { response: Response::Ok, signaled: Some(3) };
        assert_eq!(encode_response(&Ok(dispatched)), "SUCCESS\tsignaled=3");
    }

    #[test]
    fn parses_signalbroad_field() {
        let (_, hooks) = parse_line("count\tsignal=evt\tsignalbroad=true\n").unwrap();
        assert!(hooks.signal_broadcast);
    }

    #[test]
    fn parses_cas_with_absent_old_as_none() {
        let (req, _) = parse_line("cas\tkey=k\tnew=v1\n").unwrap();
        match req {
            Request::Cas { old, new, .. } => {
                assert_eq!(old, None);
                assert_eq!(new, Some(b"v1".to_vec()));
            }
            _ => panic!("expected Cas"),
        }
    }

    #[test]
    fn parses_set_bulk_records_into_triples() {
        let (req, _) = parse_line("set_bulk\trecords=a:1,b:2\tatomic=true\txt=60\n").unwrap();
        match req {
            Request::SetBulk { records, atomic } => {
                assert!(atomic);
                assert_eq!(
                    records,
                    vec![(b"a".to_vec(), b"1".to_vec(), 60), (b"b".to_vec(), b"2".to_vec(), 60)]
                );
            }
            _ => panic!("expected SetBulk"),
        }
    }

    #[test]
    fn encode_response_formats_bulk_records() {
        let resp = Ok(Dispatched {
            response: Response::Records(vec![(b"a".to_vec(), b"1".to_vec(), 60)]),
            signaled: None,
        });
        assert_eq!(encode_response(&resp), "SUCCESS\trecords=a:1:60");
    }

    #[test]
    fn parses_echo_and_void() {
        assert!(matches!(parse_line("void\n").unwrap().0, Request::Void));
        let (req, _) = parse_line("echo\tmessage=hi\n").unwrap();
        assert!(matches!(req, Request::Echo { text } if text == "hi"));
    }

    #[test]
    fn parses_cur_delete_as_cursor_close() {
        let (req, _) = parse_line("cur_delete\tid=4\n").unwrap();
        assert!(matches!(req, Request::CursorClose { id: 4 }));
    }

    #[test]
    fn parses_cur_jump_back_with_optional_key() {
        let (req, _) = parse_line("cur_jump_back\tid=1\tkey=k\n").unwrap();
        match req {
            Request::CursorJumpBack { id, key } => {
                assert_eq!(id, 1);
                assert_eq!(key, Some(b"k".to_vec()));
            }
            _ => panic!("expected CursorJumpBack"),
        }
    }

    #[test]
    fn encode_response_formats_maybe_key_and_double() {
        let some = Ok(Dispatched { response: Response::MaybeKey(Some(b"k".to_vec())), signaled: None });
        assert_eq!(encode_response(&some), "SUCCESS\tkey=k");
        let none = Ok(Dispatched { response: Response::MaybeKey(None), signaled: None });
        assert_eq!(encode_response(&none), "SUCCESS\teof=true");
        let double = Ok(Dispatched { response: Response::Double(2.5), signaled: None });
        assert_eq!(encode_response(&double), "SUCCESS\tnum=2.5");
    }
}
