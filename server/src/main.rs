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

//! `ktd`: a networked, expiration-aware key-value cache server with
//! master/slave replication, modeled on the KyotoTycoon/KyotoCabinet
//! architecture (see DESIGN.md for the module-by-module grounding).

mod condvar;
mod config;
mod corestore;
mod dbnet;
mod errors;
mod poller;
mod registry;
mod replication;
mod timeddb;
mod ulog;
mod util;
mod worker;

use condvar::ConditionMap;
use corestore::{Corestore, DbSpec};
use crossbeam_channel::bounded;
use kt_common::util::terminal;
use parking_lot::Mutex;
use poller::Poller;
use registry::Registry;
use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use worker::{Job, SessionTable};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ktd.yaml".to_string());
    let cfg = match config::load(&PathBuf::from(&config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            terminal::write_error(&format!("failed to load config '{config_path}': {e}"));
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&cfg.data_dir) {
        terminal::write_error(&format!("failed to create data directory: {e}"));
        std::process::exit(1);
    }
    let pid_path = cfg.data_dir.join("ktd.pid");
    let _pid_lock = match acquire_pid_lock(&pid_path) {
        Ok(lock) => lock,
        Err(e) => {
            terminal::write_error(&format!("another instance appears to be running: {e}"));
            std::process::exit(1);
        }
    };

    let ulog_dir = cfg.data_dir.join("ulog");
    let trigger = match ulog::UpdateLogger::open(
        &ulog_dir,
        cfg.ulog_file_limit,
        cfg.ulog_async_sync_interval_secs,
    ) {
        Ok(l) => Some(Arc::new(l)),
        Err(e) => {
            terminal::write_error(&format!("failed to open update log: {e}"));
            std::process::exit(1);
        }
    };

    let specs = cfg
        .databases
        .iter()
        .map(|d| DbSpec {
            name: d.name.clone(),
            persistence_option: d.persistence_option,
            capacity_count: d.capacity_count,
            capacity_size: d.capacity_size,
        })
        .collect();
    let corestore = match Corestore::open(specs, cfg.sid, trigger.clone()) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            terminal::write_error(&format!("failed to open databases: {e}"));
            std::process::exit(1);
        }
    };

    let registry = Registry::new();
    install_signal_handler(registry.clone());

    let conditions = Arc::new(ConditionMap::new());
    let (jobs_tx, jobs_rx) = bounded::<Job>(1024);
    let sessions: SessionTable = Arc::new(Mutex::new(std::collections::HashMap::new()));
    let _workers = worker::spawn_pool(
        cfg.worker_threads,
        jobs_rx,
        sessions.clone(),
        corestore.clone(),
        conditions.clone(),
        registry.clone(),
    );
    let _flusher = trigger
        .clone()
        .and_then(|logger| ulog::UpdateLogger::spawn_flusher(logger, registry.clone()));
    let _housekeeping = worker::spawn_housekeeping(
        corestore.clone(),
        conditions.clone(),
        registry.clone(),
        Duration::from_secs(1),
        timeddb::reaper::STEP_UNIT,
        Duration::from_secs(cfg.sync_interval_secs),
        Duration::from_secs(cfg.snapshot_interval_secs),
        cfg.snapshot_dir.clone(),
    );

    let next_conn_id = Arc::new(AtomicU64::new(1));

    let rpc_listener = match std::net::TcpListener::bind(cfg.rpc_bind) {
        Ok(l) => l,
        Err(e) => {
            terminal::write_error(&format!("failed to bind rpc listener on {}: {e}", cfg.rpc_bind));
            std::process::exit(1);
        }
    };
    let rpc_poller = Poller::open().expect("failed to open epoll instance for rpc listener");
    let rpc_jobs = jobs_tx.clone();
    let rpc_registry = registry.clone();
    let rpc_ids = next_conn_id.clone();
    let rpc_thread = std::thread::Builder::new()
        .name("ktd-rpc-acceptor".to_string())
        .spawn(move || {
            let mut conn_bufs: std::collections::HashMap<i32, (u64, Vec<u8>)> =
                std::collections::HashMap::new();
            let result = dbnet::run_acceptor(
                rpc_listener,
                dbnet::Surface::Rpc,
                rpc_poller,
                rpc_registry,
                move |_surface, stream| {
                    handle_rpc_connection(stream, &mut conn_bufs, &rpc_ids, &rpc_jobs);
                },
            );
            if let Err(e) = result {
                log::error!("rpc acceptor exited: {e}");
            }
        })
        .expect("failed to spawn rpc acceptor thread");

    let rest_listener = match std::net::TcpListener::bind(cfg.rest_bind) {
        Ok(l) => l,
        Err(e) => {
            terminal::write_error(&format!("failed to bind rest listener on {}: {e}", cfg.rest_bind));
            std::process::exit(1);
        }
    };
    let rest_poller = Poller::open().expect("failed to open epoll instance for rest listener");
    let rest_jobs = jobs_tx.clone();
    let rest_registry = registry.clone();
    let rest_ids = next_conn_id.clone();
    let rest_thread = std::thread::Builder::new()
        .name("ktd-rest-acceptor".to_string())
        .spawn(move || {
            let mut conn_bufs: std::collections::HashMap<i32, (u64, Vec<u8>)> =
                std::collections::HashMap::new();
            let result = dbnet::run_acceptor(
                rest_listener,
                dbnet::Surface::Rest,
                rest_poller,
                rest_registry,
                move |_surface, stream| {
                    handle_rest_connection(stream, &mut conn_bufs, &rest_ids, &rest_jobs);
                },
            );
            if let Err(e) = result {
                log::error!("rest acceptor exited: {e}");
            }
        })
        .expect("failed to spawn rest acceptor thread");

    let repl_listener = match std::net::TcpListener::bind(cfg.repl_bind) {
        Ok(l) => l,
        Err(e) => {
            terminal::write_error(&format!("failed to bind replication listener on {}: {e}", cfg.repl_bind));
            std::process::exit(1);
        }
    };
    let repl_registry = registry.clone();
    let repl_ulog_dir = ulog_dir.clone();
    let repl_sid = cfg.sid;
    let repl_thread = std::thread::Builder::new()
        .name("ktd-repl-acceptor".to_string())
        .spawn(move || {
            repl_listener
                .set_nonblocking(true)
                .expect("failed to set replication listener nonblocking");
            while !repl_registry.is_shutting_down() {
                match repl_listener.accept() {
                    Ok((stream, _addr)) => {
                        let registry = repl_registry.clone();
                        let dir = repl_ulog_dir.clone();
                        std::thread::Builder::new()
                            .name("ktd-repl-slave-feed".to_string())
                            .spawn(move || {
                                if let Err(e) = replication::serve(stream, &dir, repl_sid, &registry) {
                                    log::warn!("replication feed ended: {e}");
                                }
                            })
                            .ok();
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    Err(e) => {
                        log::error!("replication listener accept failed: {e}");
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn replication acceptor thread");

    let binary_listener = match std::net::TcpListener::bind(cfg.binary_bind) {
        Ok(l) => l,
        Err(e) => {
            terminal::write_error(&format!(
                "failed to bind binary listener on {}: {e}",
                cfg.binary_bind
            ));
            std::process::exit(1);
        }
    };
    let binary_registry = registry.clone();
    let binary_ulog_dir = ulog_dir.clone();
    let binary_sid = cfg.sid;
    let binary_corestore = corestore.clone();
    let binary_conditions = conditions.clone();
    let binary_thread = std::thread::Builder::new()
        .name("ktd-binary-acceptor".to_string())
        .spawn(move || {
            binary_listener
                .set_nonblocking(true)
                .expect("failed to set binary listener nonblocking");
            while !binary_registry.is_shutting_down() {
                match binary_listener.accept() {
                    Ok((stream, _addr)) => {
                        let registry = binary_registry.clone();
                        let dir = binary_ulog_dir.clone();
                        let corestore = binary_corestore.clone();
                        let conditions = binary_conditions.clone();
                        std::thread::Builder::new()
                            .name("ktd-binary-conn".to_string())
                            .spawn(move || {
                                if let Err(e) = worker::binary::serve_connection(
                                    stream,
                                    &corestore,
                                    &conditions,
                                    &dir,
                                    binary_sid,
                                    &registry,
                                ) {
                                    log::warn!("binary connection ended: {e}");
                                }
                            })
                            .ok();
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    Err(e) => {
                        log::error!("binary listener accept failed: {e}");
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn binary acceptor thread");

    let slave_threads: Vec<_> = match cfg.master {
        Some(master_addr) => corestore
            .names()
            .into_iter()
            .filter_map(|name| corestore.by_name(&name).ok())
            .map(|db| {
                let registry = registry.clone();
                let rts_path = cfg.data_dir.join(format!("{}.rts", db.name()));
                let dbid = db.index();
                let sid = cfg.sid;
                std::thread::Builder::new()
                    .name(format!("ktd-slave-{dbid}"))
                    .spawn(move || {
                        let slave = replication::Slave::new(db, dbid, sid, rts_path);
                        while !registry.is_shutting_down() {
                            match std::net::TcpStream::connect(master_addr) {
                                Ok(stream) => {
                                    let registry = registry.clone();
                                    if let Err(e) = slave.run(stream, || !registry.is_shutting_down()) {
                                        log::warn!("slave for db {dbid} disconnected: {e}");
                                    }
                                }
                                Err(e) => {
                                    log::warn!("slave for db {dbid} failed to connect to master: {e}");
                                }
                            }
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    })
                    .expect("failed to spawn slave thread")
            })
            .collect(),
        None => Vec::new(),
    };

    terminal::write_info(&format!(
        "ktd {} listening: rpc={} rest={} repl={} binary={}",
        kt_common::VERSION,
        cfg.rpc_bind,
        cfg.rest_bind,
        cfg.repl_bind,
        cfg.binary_bind,
    ));

    while !registry.is_shutting_down() {
        std::thread::sleep(Duration::from_millis(200));
    }

    let _ = rpc_thread.join();
    let _ = rest_thread.join();
    let _ = repl_thread.join();
    let _ = binary_thread.join();
    for t in slave_threads {
        let _ = t.join();
    }
    corestore.close_all();
    if let Some(trigger) = &trigger {
        let _ = trigger.flush();
    }
}

/// Accumulates bytes for a REST connection across readiness hits until a
/// full HTTP request (headers plus any `Content-Length` body) is
/// available, then dispatches it through the worker pool exactly like the
/// RPC surface.
fn handle_rest_connection(
    stream: &mut TcpStream,
    conn_bufs: &mut std::collections::HashMap<i32, (u64, Vec<u8>)>,
    next_conn_id: &Arc<AtomicU64>,
    jobs: &crossbeam_channel::Sender<Job>,
) {
    use std::io::Read;
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    let entry = conn_bufs
        .entry(fd)
        .or_insert_with(|| (next_conn_id.fetch_add(1, Ordering::Relaxed), Vec::new()));
    let conn_id = entry.0;

    let mut chunk = [0u8; 4096];
    match stream.read(&mut chunk) {
        Ok(0) => {
            conn_bufs.remove(&fd);
            return;
        }
        Ok(n) => entry.1.extend_from_slice(&chunk[..n]),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
        Err(_) => {
            conn_bufs.remove(&fd);
            return;
        }
    }

    let Some(header_end) = find_header_end(&entry.1) else {
        return;
    };
    let content_length = std::str::from_utf8(&entry.1[..header_end])
        .ok()
        .and_then(|headers| {
            headers
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length:").or_else(|| l.strip_prefix("content-length:")))
        })
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let total_needed = header_end + content_length;
    if entry.1.len() < total_needed {
        return;
    }

    let request_text = String::from_utf8_lossy(&entry.1[..total_needed]).into_owned();
    conn_bufs.remove(&fd);

    let out = match worker::rest::parse_http(&request_text) {
        Ok(parsed) => {
            let (resp_tx, resp_rx) = bounded(1);
            let method = parsed.method.clone();
            let _ = jobs.send(Job {
                conn_id,
                request: parsed.request,
                hooks: parsed.hooks,
                respond: resp_tx,
            });
            match resp_rx.recv_timeout(Duration::from_secs(5)) {
                Ok(result) => worker::rest::format_http(&method, &result),
                Err(_) => worker::rest::format_http(
                    &method,
                    &Err(errors::KtError::misc("worker pool timed out")),
                ),
            }
        }
        Err(e) => worker::rest::format_http("GET", &Err(e)),
    };
    let _ = stream.write_all(out.as_bytes());
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Accumulates bytes for an RPC connection across readiness hits until a
/// full `\n`-terminated line is available, dispatches it through the
/// worker pool and writes back the encoded response. A connection that
/// sent only a partial line this round is simply revisited on its next
/// readiness hit.
fn handle_rpc_connection(
    stream: &mut TcpStream,
    conn_bufs: &mut std::collections::HashMap<i32, (u64, Vec<u8>)>,
    next_conn_id: &Arc<AtomicU64>,
    jobs: &crossbeam_channel::Sender<Job>,
) {
    use std::io::Read;
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    let entry = conn_bufs
        .entry(fd)
        .or_insert_with(|| (next_conn_id.fetch_add(1, Ordering::Relaxed), Vec::new()));
    let conn_id = entry.0;

    let mut chunk = [0u8; 4096];
    match stream.read(&mut chunk) {
        Ok(0) => {
            conn_bufs.remove(&fd);
            return;
        }
        Ok(n) => entry.1.extend_from_slice(&chunk[..n]),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
        Err(_) => {
            conn_bufs.remove(&fd);
            return;
        }
    }

    while let Some(nl) = entry.1.iter().position(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(&entry.1[..nl]).into_owned();
        entry.1.drain(..=nl);

        let (resp_tx, resp_rx) = bounded(1);
        let mut out = match worker::rpc::parse_line(&line) {
            Ok((request, hooks)) => {
                let _ = jobs.send(Job {
                    conn_id,
                    request,
                    hooks,
                    respond: resp_tx,
                });
                match resp_rx.recv_timeout(Duration::from_secs(5)) {
                    Ok(result) => worker::rpc::encode_response(&result),
                    Err(_) => worker::rpc::encode_response(&Err(errors::KtError::misc(
                        "worker pool timed out",
                    ))),
                }
            }
            Err(e) => worker::rpc::encode_response(&Err(e)),
        };
        out.push('\n');
        let _ = stream.write_all(out.as_bytes());
    }
}

struct PidLock {
    path: PathBuf,
    fd: i32,
}

impl Drop for PidLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.fd, libc::LOCK_UN);
            libc::close(self.fd);
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Takes an exclusive advisory lock on a PID file, refusing to start if
/// another live `ktd` process already holds it — the same
/// "one process per data directory" guard a file-backed KV engine needs.
fn acquire_pid_lock(path: &std::path::Path) -> std::io::Result<PidLock> {
    use std::os::unix::io::IntoRawFd;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let fd = file.into_raw_fd();
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        unsafe { libc::close(fd) };
        return Err(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            "pid file is already locked",
        ));
    }
    std::fs::write(path, std::process::id().to_string().as_bytes())?;
    Ok(PidLock {
        path: path.to_path_buf(),
        fd,
    })
}

fn install_signal_handler(registry: Registry) {
    static REGISTRY_SLOT: Mutex<Option<Registry>> = Mutex::new(None);
    *REGISTRY_SLOT.lock() = Some(registry);

    extern "C" fn on_signal(_sig: i32) {
        if let Some(registry) = REGISTRY_SLOT.lock().as_ref() {
            registry.request_shutdown();
        }
    }

    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}
