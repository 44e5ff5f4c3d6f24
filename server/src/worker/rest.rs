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

//! The REST surface (§6.3): a minimal HTTP/1.1 subset — `GET`/`PUT`/
//! `DELETE`/`HEAD` on `/<db>/<key>` — mapped onto the same
//! [`Request`]/[`Hooks`] dispatch() runs for the RPC surface. The write
//! mode and expiry time travel as the `X-Kt-Mode`/`X-Kt-Xt` request
//! headers (not query parameters) so a key containing `&`/`=` never has
//! to be escaped twice.

use super::dispatch::{Dispatched, Hooks, Request, Response};
use crate::errors::{KtError, KtResult};
use crate::timeddb::WriteMode;
use std::collections::HashMap;

pub struct ParsedRequest {
    pub method: String,
    pub request: Request,
    pub hooks: Hooks,
}

/// Parses the header block into a lower-cased-name lookup table, matching
/// HTTP's case-insensitive header names.
fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, &'a str> {
    lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim()))
        .collect()
}

/// Parses the request line + first header block of an HTTP/1.1 request
/// (`method`, `path`, optional body for `PUT`). Expects the full request
/// (headers + body, if any) to already be buffered — no chunked transfer
/// support, matching the spec's Non-goal on TLS/advanced HTTP features.
pub fn parse_http(request_text: &str) -> KtResult<ParsedRequest> {
    let mut lines = request_text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| KtError::invalid("empty HTTP request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| KtError::invalid("malformed request line"))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| KtError::invalid("malformed request line"))?;

    let path = target.split_once('?').map(|(p, _)| p).unwrap_or(target);
    let mut segments = path.trim_start_matches('/').splitn(2, '/');
    let db = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| KtError::invalid("path must be /<db>/<key>"))?;
    let key = segments
        .next()
        .ok_or_else(|| KtError::invalid("path must be /<db>/<key>"))?;

    let header_lines = lines.clone().take_while(|l| !l.is_empty());
    let headers = parse_headers(header_lines);

    let hooks = Hooks {
        select_db: Some(db.to_string()),
        ..Default::default()
    };

    let body = request_text.split("\r\n\r\n").nth(1).unwrap_or("");

    let request = match method.as_str() {
        "GET" => Request::Get {
            key: key.as_bytes().to_vec(),
        },
        "PUT" => Request::Set {
            key: key.as_bytes().to_vec(),
            value: body.as_bytes().to_vec(),
            xt: headers
                .get("x-kt-xt")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            mode: match headers.get("x-kt-mode").copied() {
                Some("add") => WriteMode::Add,
                Some("replace") => WriteMode::Replace,
                _ => WriteMode::Set,
            },
        },
        "DELETE" => Request::Remove {
            key: key.as_bytes().to_vec(),
        },
        "HEAD" => Request::Check {
            key: key.as_bytes().to_vec(),
        },
        other => return Err(KtError::invalid(format!("unsupported HTTP method '{other}'"))),
    };

    Ok(ParsedRequest { method, request, hooks })
}

/// Renders a dispatch result as an HTTP/1.1 response. `method` picks the
/// success status: `PUT` -> 201 Created, `DELETE` -> 204 No Content,
/// `HEAD` on an existing key -> 200 OK (not 204 — 204 is reserved for
/// "no body", and a `HEAD` reply never has one regardless of outcome).
pub fn format_http(method: &str, result: &KtResult<Dispatched>) -> String {
    match result {
        Ok(dispatched) => match &dispatched.response {
            Response::Value(v, xt) => http_ok_with_body(&String::from_utf8_lossy(v), xt.to_string()),
            Response::Bool(true) => http_status(200, ""),
            Response::Bool(false) => http_status(404, ""),
            Response::Ok => match method {
                "PUT" => http_status(201, ""),
                "DELETE" => http_status(204, ""),
                _ => http_status(200, ""),
            },
            Response::Count(n) => http_ok_with_body(&n.to_string(), String::new()),
            Response::Keys(keys) => {
                let joined = keys
                    .iter()
                    .map(|k| String::from_utf8_lossy(k).into_owned())
                    .collect::<Vec<_>>()
                    .join("\n");
                http_ok_with_body(&joined, String::new())
            }
            Response::Status { name, count, size_bytes } => {
                http_ok_with_body(&format!("{name}\t{count}\t{size_bytes}"), String::new())
            }
            Response::CursorId(id) => http_ok_with_body(&id.to_string(), String::new()),
            Response::Record(Some((k, v, _))) => http_ok_with_body(
                &format!("{}\t{}", String::from_utf8_lossy(k), String::from_utf8_lossy(v)),
                String::new(),
            ),
            Response::Record(None) => http_status(404, ""),
            Response::Records(records) => {
                let joined = records
                    .iter()
                    .map(|(k, v, _)| {
                        format!(
                            "{}\t{}",
                            String::from_utf8_lossy(k),
                            String::from_utf8_lossy(v)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                http_ok_with_body(&joined, String::new())
            }
            Response::Text(text) => http_ok_with_body(text, String::new()),
            Response::Double(n) => http_ok_with_body(&n.to_string(), String::new()),
            Response::FileNames(names) => http_ok_with_body(&names.join("\n"), String::new()),
            Response::MaybeKey(Some(k)) => http_ok_with_body(&String::from_utf8_lossy(k), String::new()),
            Response::MaybeKey(None) => http_status(404, ""),
            Response::MaybeValue(Some(v)) => http_ok_with_body(&String::from_utf8_lossy(v), String::new()),
            Response::MaybeValue(None) => http_status(404, ""),
        },
        Err(e) => http_status(e.http_status(), &e.to_string()),
    }
}

fn http_ok_with_body(body: &str, xt_header: String) -> String {
    let xt_line = if xt_header.is_empty() {
        String::new()
    } else {
        format!("X-Kt-Xt: {xt_header}\r\n")
    };
    format!(
        "HTTP/1.1 200 OK\r\n{xt_line}Content-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

fn http_status(code: u16, body: &str) -> String {
    let reason = match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        450 => "Logic Failure",
        501 => "Not Implemented",
        _ => "Internal Server Error",
    };
    format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_parses_db_and_key_from_path() {
        let req = parse_http("GET /main/hello HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(req.hooks.select_db.as_deref(), Some("main"));
        match req.request {
            Request::Get { key } => assert_eq!(key, b"hello"),
            _ => panic!("expected Get"),
        }
    }

    #[test]
    fn put_carries_the_body_as_the_value() {
        let req = parse_http("PUT /main/hello HTTP/1.1\r\nContent-Length: 5\r\n\r\nworld").unwrap();
        match req.request {
            Request::Set { value, mode, .. } => {
                assert_eq!(value, b"world");
                assert_eq!(mode, WriteMode::Set);
            }
            _ => panic!("expected Set"),
        }
    }

    #[test]
    fn put_reads_mode_and_xt_from_headers() {
        let req = parse_http(
            "PUT /main/hello HTTP/1.1\r\nX-Kt-Mode: add\r\nX-Kt-Xt: 60\r\nContent-Length: 1\r\n\r\nv",
        )
        .unwrap();
        match req.request {
            Request::Set { xt, mode, .. } => {
                assert_eq!(xt, 60);
                assert_eq!(mode, WriteMode::Add);
            }
            _ => panic!("expected Set"),
        }
    }

    #[test]
    fn missing_key_segment_is_invalid() {
        assert!(matches!(
            parse_http("GET /main HTTP/1.1\r\n\r\n"),
            Err(KtError::Invalid(_))
        ));
    }

    #[test]
    fn format_http_maps_norec_to_404() {
        let resp: KtResult<Dispatched> = Err(KtError::NoRec);
        assert!(format_http("GET", &resp).starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn format_http_maps_put_ok_to_201() {
        let resp: KtResult<Dispatched> = Ok(Dispatched { response: Response::Ok, signaled: None });
        assert!(format_http("PUT", &resp).starts_with("HTTP/1.1 201"));
    }

    #[test]
    fn format_http_maps_delete_ok_to_204() {
        let resp: KtResult<Dispatched> = Ok(Dispatched { response: Response::Ok, signaled: None });
        assert!(format_http("DELETE", &resp).starts_with("HTTP/1.1 204"));
    }

    #[test]
    fn format_http_maps_head_on_existing_key_to_200() {
        let resp: KtResult<Dispatched> = Ok(Dispatched { response: Response::Bool(true), signaled: None });
        assert!(format_http("HEAD", &resp).starts_with("HTTP/1.1 200"));
    }
}
