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

//! Black-box integration suite (§8 S1-S7): spawns the compiled `ktd`
//! binary against a scratch data directory and drives it over the TSV-RPC
//! wire exactly as a real client would, in the spirit of the teacher's
//! `harness`/`testsuite` process-spawning tests (`harness/src/test/svc.rs`)
//! — rebuilt around `std::process::Command` + `CARGO_BIN_EXE_ktd` rather
//! than a generated client crate, since this protocol has none.

use rand::Rng;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Binds to an ephemeral port and immediately releases it, so the child
/// process can bind the same address. Good enough for a test harness: the
/// window between release and the child's own bind is negligible.
fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

struct ServerGuard {
    child: Child,
    #[allow(dead_code)]
    dir: tempfile::TempDir,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_config(
    dir: &std::path::Path,
    rpc: SocketAddr,
    rest: SocketAddr,
    repl: SocketAddr,
    sid: u16,
    master: Option<SocketAddr>,
) -> PathBuf {
    let mut yaml = format!(
        "rpc_bind: \"{rpc}\"\nrest_bind: \"{rest}\"\nrepl_bind: \"{repl}\"\nsid: {sid}\nworker_threads: 2\ndata_dir: \"{}\"\ndatabases:\n  - name: default\n",
        dir.display(),
    );
    if let Some(m) = master {
        yaml.push_str(&format!("master: \"{m}\"\n"));
    }
    let path = dir.join("ktd.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

fn spawn_server(config_path: &std::path::Path, dir: tempfile::TempDir) -> ServerGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_ktd"))
        .arg(config_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn ktd");
    ServerGuard { child, dir }
}

/// Exponential backoff connect, mirroring the teacher's own
/// `wait_for_startup` harness helper.
fn wait_for_listening(addr: SocketAddr) -> TcpStream {
    let mut backoff_ms = 10;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(_) if backoff_ms < 2000 => {
                std::thread::sleep(Duration::from_millis(backoff_ms));
                backoff_ms *= 2;
            }
            Err(e) => panic!("server at {addr} never started listening: {e}"),
        }
    }
}

fn rpc_call(stream: &mut TcpStream, line: &str) -> String {
    stream.write_all(line.as_bytes()).unwrap();
    stream.write_all(b"\n").unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut resp = String::new();
    reader.read_line(&mut resp).unwrap();
    resp.trim_end().to_string()
}

fn field<'a>(resp: &'a str, name: &str) -> Option<&'a str> {
    resp.split('\t')
        .filter_map(|f| f.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

fn start_single(sid: u16) -> (ServerGuard, TcpStream) {
    let dir = tempfile::tempdir().unwrap();
    let rpc = free_addr();
    let rest = free_addr();
    let repl = free_addr();
    let cfg = write_config(dir.path(), rpc, rest, repl, sid, None);
    let guard = spawn_server(&cfg, dir);
    let stream = wait_for_listening(rpc);
    (guard, stream)
}

#[test]
fn s1_set_then_get_round_trips_value_and_expiry() {
    let (_guard, mut stream) = start_single(1);
    let resp = rpc_call(&mut stream, "set\tkey=a\tvalue=1\txt=60\tdb=default");
    assert!(resp.starts_with("SUCCESS"), "set failed: {resp}");

    let resp = rpc_call(&mut stream, "get\tkey=a\tdb=default");
    assert!(resp.starts_with("SUCCESS"), "get failed: {resp}");
    assert_eq!(field(&resp, "value"), Some("1"));
    let xt: i64 = field(&resp, "xt").unwrap().parse().unwrap();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    assert!((xt - (now + 60)).abs() <= 2, "xt={xt} now+60={}", now + 60);
}

#[test]
fn s2_expired_key_reads_as_norec() {
    let (_guard, mut stream) = start_single(1);
    let resp = rpc_call(&mut stream, "set\tkey=a\tvalue=1\txt=1\tdb=default");
    assert!(resp.starts_with("SUCCESS"), "set failed: {resp}");
    std::thread::sleep(Duration::from_secs(2));
    let resp = rpc_call(&mut stream, "get\tkey=a\tdb=default");
    assert!(resp.starts_with("ELOGIC"), "expected the expired key to read back as a logic-level miss: {resp}");
}

#[test]
fn s3_cas_succeeds_once_then_fails_on_stale_expectation() {
    let (_guard, mut stream) = start_single(1);
    let resp = rpc_call(&mut stream, "set\tkey=k\tvalue=v1\txt=60\tdb=default");
    assert!(resp.starts_with("SUCCESS"), "set failed: {resp}");

    let resp = rpc_call(&mut stream, "cas\tkey=k\told=v1\tnew=v2\tdb=default");
    assert!(resp.starts_with("SUCCESS"), "first cas should succeed: {resp}");

    let resp = rpc_call(&mut stream, "cas\tkey=k\told=v1\tnew=v3\tdb=default");
    assert!(resp.starts_with("ELOGIC"), "second cas should fail: {resp}");

    let resp = rpc_call(&mut stream, "get\tkey=k\tdb=default");
    assert_eq!(field(&resp, "value"), Some("v2"));
}

#[test]
fn s4_increment_accumulates_from_a_fresh_key() {
    let (_guard, mut stream) = start_single(1);
    let _ = rpc_call(&mut stream, "remove\tkey=c\tdb=default");

    let resp = rpc_call(&mut stream, "increment\tkey=c\tnum=3\tdb=default");
    assert_eq!(field(&resp, "count"), Some("3"), "{resp}");

    let resp = rpc_call(&mut stream, "increment\tkey=c\tnum=4\tdb=default");
    assert_eq!(field(&resp, "count"), Some("7"), "{resp}");
}

#[test]
fn s6_bulk_atomic_set_lands_all_records_or_none() {
    let (_guard, mut stream) = start_single(1);
    let resp = rpc_call(
        &mut stream,
        "set_bulk\trecords=a:1,b:2,c:3\tatomic=true\tdb=default",
    );
    assert_eq!(field(&resp, "count"), Some("3"), "{resp}");

    for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
        let resp = rpc_call(&mut stream, &format!("get\tkey={k}\tdb=default"));
        assert_eq!(field(&resp, "value"), Some(v), "key {k}: {resp}");
    }
}

#[test]
fn s7_snapshot_round_trip_preserves_every_record() {
    let (_guard, mut stream) = start_single(1);
    let mut rng = rand::thread_rng();
    let mut written = Vec::new();
    for i in 0..200 {
        let key = format!("k{i}");
        let value: String = (0..8)
            .map(|_| (b'a' + rng.gen_range(0..26)) as char)
            .collect();
        let resp = rpc_call(&mut stream, &format!("set\tkey={key}\tvalue={value}\txt=120\tdb=default"));
        assert!(resp.starts_with("SUCCESS"));
        written.push((key, value));
    }

    let snap_dir = tempfile::tempdir().unwrap();
    let snap_path = snap_dir.path().join("default.snap");
    let resp = rpc_call(
        &mut stream,
        &format!("dump_snapshot\tpath={}\tdb=default", snap_path.display()),
    );
    assert!(resp.starts_with("SUCCESS"), "dump failed: {resp}");

    let resp = rpc_call(&mut stream, "clear\tdb=default");
    assert!(resp.starts_with("SUCCESS"));
    let resp = rpc_call(&mut stream, "count\tdb=default");
    assert_eq!(field(&resp, "count"), Some("0"));

    let resp = rpc_call(
        &mut stream,
        &format!("load_snapshot\tpath={}\tdb=default", snap_path.display()),
    );
    assert!(resp.starts_with("SUCCESS"), "load failed: {resp}");
    assert_eq!(field(&resp, "count"), Some(&written.len().to_string()));

    for (key, value) in &written {
        let resp = rpc_call(&mut stream, &format!("get\tkey={key}\tdb=default"));
        assert_eq!(field(&resp, "value"), Some(value.as_str()), "key {key}: {resp}");
    }
}

#[test]
fn s5_replication_streams_writes_from_master_to_slave() {
    let master_dir = tempfile::tempdir().unwrap();
    let master_data_dir = master_dir.path().to_path_buf();
    let master_rpc = free_addr();
    let master_rest = free_addr();
    let master_repl = free_addr();
    let master_cfg = write_config(master_dir.path(), master_rpc, master_rest, master_repl, 1, None);
    let master_guard = spawn_server(&master_cfg, master_dir);
    let mut master_stream = wait_for_listening(master_rpc);

    let slave_dir = tempfile::tempdir().unwrap();
    let slave_rpc = free_addr();
    let slave_rest = free_addr();
    let slave_repl = free_addr();
    let slave_cfg = write_config(
        slave_dir.path(),
        slave_rpc,
        slave_rest,
        slave_repl,
        2,
        Some(master_repl),
    );
    let slave_guard = spawn_server(&slave_cfg, slave_dir);
    let mut slave_stream = wait_for_listening(slave_rpc);

    let resp = rpc_call(&mut master_stream, "set\tkey=a\tvalue=1\txt=60\tdb=default");
    assert!(resp.starts_with("SUCCESS"), "master set failed: {resp}");

    let mut got = None;
    for _ in 0..50 {
        let resp = rpc_call(&mut slave_stream, "get\tkey=a\tdb=default");
        if resp.starts_with("SUCCESS") {
            got = Some(resp);
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    let resp = got.expect("slave never observed the master's write");
    assert_eq!(field(&resp, "value"), Some("1"));

    let ulog_dir = master_data_dir.join("ulog");
    let files: Vec<_> = std::fs::read_dir(&ulog_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.metadata().map(|m| m.len() > 0).unwrap_or(false))
        .collect();
    assert!(!files.is_empty(), "master should have written at least one non-empty ulog file");

    drop(master_guard);
    drop(slave_guard);
}
