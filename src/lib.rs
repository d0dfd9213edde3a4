//! Kennel - the configuration core of a database-driven web server.
//!
//! The runtime is driven by two things: a relational configuration database
//! describing servers, hosts, routes and backends, and a self-describing
//! wire format (tagged netstrings) used to ship requests to out-of-process
//! handlers. This crate implements both, plus the lifecycle registry that
//! makes reload-without-restart work:
//!
//! - [`registry`]: keyed interning of backends with prefix lookup and the
//!   start/stop lifecycle sweeps.
//! - [`config`]: the SQLite loader populating the registry and the
//!   [`Server`] tree.
//! - [`tnetstring`]: the tagged-netstring codec with streaming request
//!   emit.
//! - [`handler`]: request frame encoding and the per-handler worker task.
//!
//! [`ServerState`] ties them together the way the server binary uses them:
//! one registry for the life of the process, a live server tree swapped on
//! reload, and backends that keep running across reloads as long as the new
//! configuration still references them.
//!
//! ```no_run
//! use kennel::ServerState;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), kennel::LoadError> {
//! let state = ServerState::new("/etc/kennel/config.sqlite");
//! state.load("54c6755b-9628-40a4-9a2d-cc82a816345e")?;
//! // ... later, after the database changed:
//! state.reload("54c6755b-9628-40a4-9a2d-cc82a816345e")?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

pub mod backend;
pub mod config;
pub mod error;
pub mod handler;
pub mod registry;
pub mod server;
pub mod tnetstring;

pub use backend::{Backend, BackendKind, HandlerProtocol};
pub use error::{LoadError, LoadResult};
pub use registry::{BackendEntry, Registry};
pub use server::{Host, HostPattern, Route, Server};
pub use tnetstring::{parse, render, Value, WireError};

/// One registry entry in a [`ServerState::status_json`] snapshot.
#[derive(Debug, Serialize)]
pub struct BackendStatus {
    pub key: String,
    pub kind: BackendKind,
    pub active: bool,
    pub running: bool,
}

/// Top-level owner of the process-wide configuration state.
///
/// The registry lives as long as the state does; that is what lets backend
/// identity (and a handler's worker) survive a reload. The server tree is
/// published through an atomic swap so request-path readers never block a
/// reload in progress.
#[derive(Debug)]
pub struct ServerState {
    db_path: PathBuf,
    registry: Registry,
    server: ArcSwapOption<Server>,
    mimetypes: RwLock<HashMap<String, String>>,
    settings: RwLock<HashMap<String, String>>,
}

impl ServerState {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            registry: Registry::new(),
            server: ArcSwapOption::empty(),
            mimetypes: RwLock::new(HashMap::new()),
            settings: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The currently published server tree, if a load has succeeded.
    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.load_full()
    }

    pub fn mimetype_for(&self, extension: &str) -> Option<String> {
        self.mimetypes.read().get(extension).cloned()
    }

    pub fn setting(&self, key: &str) -> Option<String> {
        self.settings.read().get(key).cloned()
    }

    /// Load the configuration for `uuid` and start its handlers.
    ///
    /// On failure nothing is published and the previous tree (if any) stays
    /// in place; the caller is expected to abort startup. Must be called
    /// from within a tokio runtime since the start pass spawns worker
    /// tasks.
    pub fn load(&self, uuid: &str) -> LoadResult<()> {
        let conn = Connection::open(&self.db_path)?;
        let server = config::load_server(&conn, &self.registry, uuid)?;
        *self.mimetypes.write() = config::load_mimetypes(&conn)?;
        *self.settings.write() = config::load_settings(&conn)?;

        self.registry.start_handlers();
        self.server.store(Some(Arc::new(server)));
        Ok(())
    }

    /// Reload over the running state.
    ///
    /// Quiesces every active backend, then loads against the same registry.
    /// A backend present in both configurations keeps its identity and its
    /// worker; one absent from the new configuration stays stopped.
    pub fn reload(&self, uuid: &str) -> LoadResult<()> {
        info!(uuid = %uuid, "reloading configuration");
        self.registry.stop_all();
        self.load(uuid)
    }

    /// JSON snapshot of every registry entry, for operator tooling.
    pub fn status_json(&self) -> String {
        let mut backends = Vec::new();
        self.registry.for_each(|entry| {
            backends.push(BackendStatus {
                key: entry.key().to_string(),
                kind: entry.kind(),
                active: entry.is_active(),
                running: entry.backend().is_running(),
            });
        });
        let status = serde_json::json!({
            "server": self.server.load().as_ref().map(|s| s.uuid.clone()),
            "backends": backends,
        });
        status.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "54c6755b-9628-40a4-9a2d-cc82a816345e";

    fn write_db(path: &std::path::Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE server (id INTEGER PRIMARY KEY, uuid TEXT, default_host TEXT,
                 bind_addr TEXT, port INTEGER, chroot TEXT, access_log TEXT, error_log TEXT,
                 pid_file TEXT);
             CREATE TABLE host (id INTEGER PRIMARY KEY, name TEXT, matching TEXT,
                 server_id INTEGER);
             CREATE TABLE route (id INTEGER PRIMARY KEY, path TEXT, target_id INTEGER,
                 target_type TEXT, host_id INTEGER);
             CREATE TABLE handler (id INTEGER PRIMARY KEY, send_spec TEXT, send_ident TEXT,
                 recv_spec TEXT, recv_ident TEXT, raw_payload INTEGER, protocol TEXT);
             CREATE TABLE proxy (id INTEGER PRIMARY KEY, addr TEXT, port INTEGER);
             CREATE TABLE directory (id INTEGER PRIMARY KEY, base TEXT, index_file TEXT,
                 default_ctype TEXT, cache_ttl INTEGER);
             CREATE TABLE mimetype (id INTEGER PRIMARY KEY, extension TEXT, mimetype TEXT);
             CREATE TABLE setting (id INTEGER PRIMARY KEY, key TEXT, value TEXT);",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO server VALUES (1, ?1, 'd.example', '0.0.0.0', 6767, '/var/www',
                 '/logs/access.log', '/logs/error.log', '/run/kennel.pid')",
            [UUID],
        )
        .unwrap();
        conn.execute_batch(
            "INSERT INTO handler VALUES (1, 'tcp://127.0.0.1:9997', 'ident',
                 'tcp://127.0.0.1:9996', 'ident', 1, 'tnet');
             INSERT INTO host VALUES (1, 'd.example', 'd.example', 1);
             INSERT INTO route VALUES (1, '/', 1, 'handler', 1);
             INSERT INTO mimetype VALUES (1, '.html', 'text/html');
             INSERT INTO setting VALUES (1, 'zeromq.threads', '1');",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_load_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("config.sqlite");
        write_db(&db_path);

        let state = ServerState::new(&db_path);
        state.load(UUID).unwrap();

        let server = state.server().unwrap();
        assert_eq!(server.uuid, UUID);
        assert_eq!(server.default_host().unwrap().name, "d.example");
        assert_eq!(state.mimetype_for(".html").unwrap(), "text/html");
        assert_eq!(state.setting("zeromq.threads").unwrap(), "1");

        let entry = state.registry().find_backend("handler", "1").unwrap();
        assert!(entry.is_active());
        assert!(entry.backend().is_running());

        // A reload over the same configuration keeps the backend identity.
        state.reload(UUID).unwrap();
        let after = state.registry().find_backend("handler", "1").unwrap();
        assert!(Arc::ptr_eq(&entry, &after));
        assert!(after.backend().is_running());
    }

    #[tokio::test]
    async fn test_failed_load_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("config.sqlite");
        write_db(&db_path);

        let state = ServerState::new(&db_path);
        assert!(state.load("no-such-uuid").is_err());
        assert!(state.server().is_none());
    }

    #[tokio::test]
    async fn test_status_json_lists_backends() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("config.sqlite");
        write_db(&db_path);

        let state = ServerState::new(&db_path);
        state.load(UUID).unwrap();

        let status: serde_json::Value = serde_json::from_str(&state.status_json()).unwrap();
        assert_eq!(status["server"], UUID);
        let backends = status["backends"].as_array().unwrap();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0]["kind"], "handler");
        assert_eq!(backends[0]["active"], true);
        assert_eq!(backends[0]["running"], true);
    }
}
