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

//! Configuration (§4.J): a YAML file loaded with `serde_yaml` into a
//! `RawConfig`, validated and defaulted into the immutable [`ServerConfig`]
//! the rest of the server runs with. Every field can be overridden by a
//! `KTD_*` environment variable, read after the file so deployment
//! tooling (containers, systemd units) can tweak a shared config file
//! without templating it.

use crate::errors::{KtError, KtResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

fn default_rpc_bind() -> String {
    "127.0.0.1:1978".to_string()
}
fn default_rest_bind() -> String {
    "127.0.0.1:1979".to_string()
}
fn default_repl_bind() -> String {
    "127.0.0.1:1861".to_string()
}
fn default_binary_bind() -> String {
    "127.0.0.1:1862".to_string()
}
fn default_worker_threads() -> usize {
    4
}
fn default_ulog_file_limit() -> u64 {
    64 * 1024 * 1024
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_ulog_async_sync_interval_secs() -> u64 {
    1
}
fn default_sync_interval_secs() -> u64 {
    10
}
fn default_snapshot_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Default)]
pub struct RawDbConfig {
    pub name: String,
    #[serde(default)]
    pub persistence_option: bool,
    #[serde(default)]
    pub capacity_count: usize,
    #[serde(default)]
    pub capacity_size: usize,
}

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    #[serde(default = "default_rpc_bind")]
    pub rpc_bind: String,
    #[serde(default = "default_rest_bind")]
    pub rest_bind: String,
    #[serde(default = "default_repl_bind")]
    pub repl_bind: String,
    /// Magic-byte-dispatched surface (§6.1): replication/play_script/
    /// set_bulk/remove_bulk/get_bulk multiplexed onto one listener.
    #[serde(default = "default_binary_bind")]
    pub binary_bind: String,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_ulog_file_limit")]
    pub ulog_file_limit: u64,
    /// How often the background flusher thread fsyncs the update log, in
    /// seconds. `0` disables the thread (`synchronize` becomes purely
    /// on-demand, e.g. via the `synchronize` RPC or `ktd.yaml` reload).
    #[serde(default = "default_ulog_async_sync_interval_secs")]
    pub ulog_async_sync_interval_secs: u64,
    /// Housekeeping's `synchronize(true)` cadence per database, in seconds.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Housekeeping's snapshot-dump cadence per database, in seconds.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// Directory snapshots are written to (`<snapshot_dir>/<db>.ktss`).
    /// Defaults under `data_dir` when unset.
    #[serde(default)]
    pub snapshot_dir: Option<String>,
    #[serde(default)]
    pub sid: u16,
    #[serde(default)]
    pub master: Option<String>,
    #[serde(default)]
    pub databases: Vec<RawDbConfig>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            rpc_bind: default_rpc_bind(),
            rest_bind: default_rest_bind(),
            repl_bind: default_repl_bind(),
            binary_bind: default_binary_bind(),
            worker_threads: default_worker_threads(),
            data_dir: default_data_dir(),
            ulog_file_limit: default_ulog_file_limit(),
            ulog_async_sync_interval_secs: default_ulog_async_sync_interval_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            snapshot_dir: None,
            sid: 0,
            master: None,
            databases: Vec::new(),
        }
    }
}

/// The validated, immutable configuration the rest of the server is
/// built from.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub rpc_bind: SocketAddr,
    pub rest_bind: SocketAddr,
    pub repl_bind: SocketAddr,
    pub binary_bind: SocketAddr,
    pub worker_threads: usize,
    pub data_dir: PathBuf,
    pub ulog_file_limit: u64,
    pub ulog_async_sync_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub snapshot_interval_secs: u64,
    pub snapshot_dir: PathBuf,
    pub sid: u16,
    pub master: Option<SocketAddr>,
    pub databases: Vec<RawDbConfig>,
}

/// Loads `path` as YAML, applies `KTD_*` environment overrides, then
/// validates into a [`ServerConfig`]. A missing file is an error (unlike
/// `rts`/log-file absence, a missing config is a deployment mistake, not
/// an expected first-run state).
pub fn load(path: &Path) -> KtResult<ServerConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| KtError::NoRepos(format!("config file '{}': {e}", path.display())))?;
    let mut raw: RawConfig = serde_yaml::from_str(&text)
        .map_err(|e| KtError::invalid(format!("malformed config: {e}")))?;
    apply_env_overrides(&mut raw);
    validate(raw)
}

pub fn load_default() -> ServerConfig {
    let mut raw = RawConfig::default();
    apply_env_overrides(&mut raw);
    validate(raw).expect("built-in defaults always validate")
}

fn apply_env_overrides(raw: &mut RawConfig) {
    if let Ok(v) = std::env::var("KTD_RPC_BIND") {
        raw.rpc_bind = v;
    }
    if let Ok(v) = std::env::var("KTD_REST_BIND") {
        raw.rest_bind = v;
    }
    if let Ok(v) = std::env::var("KTD_REPL_BIND") {
        raw.repl_bind = v;
    }
    if let Ok(v) = std::env::var("KTD_BINARY_BIND") {
        raw.binary_bind = v;
    }
    if let Ok(v) = std::env::var("KTD_WORKER_THREADS") {
        if let Ok(n) = v.parse() {
            raw.worker_threads = n;
        }
    }
    if let Ok(v) = std::env::var("KTD_DATA_DIR") {
        raw.data_dir = v;
    }
    if let Ok(v) = std::env::var("KTD_ULOG_FILE_LIMIT") {
        if let Ok(n) = v.parse() {
            raw.ulog_file_limit = n;
        }
    }
    if let Ok(v) = std::env::var("KTD_SID") {
        if let Ok(n) = v.parse() {
            raw.sid = n;
        }
    }
    if let Ok(v) = std::env::var("KTD_MASTER") {
        raw.master = Some(v);
    }
    if let Ok(v) = std::env::var("KTD_ULOG_ASYNC_SYNC_INTERVAL_SECS") {
        if let Ok(n) = v.parse() {
            raw.ulog_async_sync_interval_secs = n;
        }
    }
    if let Ok(v) = std::env::var("KTD_SYNC_INTERVAL_SECS") {
        if let Ok(n) = v.parse() {
            raw.sync_interval_secs = n;
        }
    }
    if let Ok(v) = std::env::var("KTD_SNAPSHOT_INTERVAL_SECS") {
        if let Ok(n) = v.parse() {
            raw.snapshot_interval_secs = n;
        }
    }
    if let Ok(v) = std::env::var("KTD_SNAPSHOT_DIR") {
        raw.snapshot_dir = Some(v);
    }
}

fn validate(raw: RawConfig) -> KtResult<ServerConfig> {
    let rpc_bind = SocketAddr::from_str(&raw.rpc_bind)
        .map_err(|e| KtError::invalid(format!("bad rpc_bind '{}': {e}", raw.rpc_bind)))?;
    let rest_bind = SocketAddr::from_str(&raw.rest_bind)
        .map_err(|e| KtError::invalid(format!("bad rest_bind '{}': {e}", raw.rest_bind)))?;
    let repl_bind = SocketAddr::from_str(&raw.repl_bind)
        .map_err(|e| KtError::invalid(format!("bad repl_bind '{}': {e}", raw.repl_bind)))?;
    let binary_bind = SocketAddr::from_str(&raw.binary_bind)
        .map_err(|e| KtError::invalid(format!("bad binary_bind '{}': {e}", raw.binary_bind)))?;
    if raw.worker_threads == 0 {
        return Err(KtError::invalid("worker_threads must be at least 1"));
    }
    let master = raw
        .master
        .as_deref()
        .map(SocketAddr::from_str)
        .transpose()
        .map_err(|e| KtError::invalid(format!("bad master address: {e}")))?;
    let mut databases = raw.databases;
    if databases.is_empty() {
        databases.push(RawDbConfig {
            name: "default".to_string(),
            ..Default::default()
        });
    }
    let data_dir = PathBuf::from(raw.data_dir);
    let snapshot_dir = raw
        .snapshot_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("snapshots"));
    Ok(ServerConfig {
        rpc_bind,
        rest_bind,
        repl_bind,
        binary_bind,
        worker_threads: raw.worker_threads,
        data_dir,
        ulog_file_limit: raw.ulog_file_limit,
        ulog_async_sync_interval_secs: raw.ulog_async_sync_interval_secs,
        sync_interval_secs: raw.sync_interval_secs,
        snapshot_interval_secs: raw.snapshot_interval_secs,
        snapshot_dir,
        sid: raw.sid,
        master,
        databases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn load_applies_defaults_for_missing_fields() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "sid: 3").unwrap();
        let cfg = load(f.path()).unwrap();
        assert_eq!(cfg.sid, 3);
        assert_eq!(cfg.worker_threads, 4);
        assert_eq!(cfg.databases.len(), 1);
        assert_eq!(cfg.databases[0].name, "default");
    }

    #[test]
    fn missing_file_is_norepos() {
        assert!(matches!(
            load(Path::new("/nonexistent/path/to/config.yaml")),
            Err(KtError::NoRepos(_))
        ));
    }

    #[test]
    fn zero_worker_threads_is_rejected() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "worker_threads: 0").unwrap();
        assert!(matches!(load(f.path()), Err(KtError::Invalid(_))));
    }

    #[test]
    fn env_override_wins_over_file() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "sid: 3").unwrap();
        std::env::set_var("KTD_SID", "42");
        let cfg = load(f.path()).unwrap();
        std::env::remove_var("KTD_SID");
        assert_eq!(cfg.sid, 42);
    }
}
