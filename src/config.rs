//! Configuration loading from the SQLite store.
//!
//! A load runs a fixed set of queries in dependency order: handlers,
//! proxies and directories are interned into the registry first, then the
//! server row, its hosts, and their routes are built on top, so route
//! resolution can assume every backend is already present.
//!
//! Reload works against the same registry: a backend row whose fingerprint
//! key is already interned is reused (and marked running again), everything
//! else is created fresh. A backend missing from the new configuration is
//! simply never rediscovered, stays inactive, and is not restarted.
//!
//! Failures are fatal to the load and leave no server behind; registry
//! entries interned by earlier phases remain but stay inactive, so a caller
//! aborting startup has nothing to unwind.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, Row};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendKind, Dir, Handler, HandlerProtocol, Proxy};
use crate::error::{LoadError, LoadResult};
use crate::registry::Registry;
use crate::server::{Host, Server};

const HANDLER_QUERY: &str = "SELECT id, send_spec, send_ident, recv_spec, recv_ident FROM handler";

const HANDLER_OPTIONS_QUERY: &str = "SELECT id, raw_payload, protocol FROM handler WHERE id = ?1";

const PROXY_QUERY: &str = "SELECT id, addr, port FROM proxy";

const DIR_QUERY: &str = "SELECT id, base, index_file, default_ctype, cache_ttl FROM directory";

const SERVER_QUERY: &str = "SELECT id, uuid, default_host, bind_addr, port, chroot, access_log, \
                            error_log, pid_file FROM server WHERE uuid = ?1";

const HOST_QUERY: &str = "SELECT id, name, matching, server_id FROM host WHERE server_id = ?1";

const ROUTE_QUERY: &str = "SELECT route.id AS id, route.path AS path, route.target_id AS \
                           target_id, route.target_type AS target_type FROM route, host WHERE \
                           host_id = ?1 AND host.server_id = ?2 AND host.id = route.host_id";

const MIMETYPE_QUERY: &str = "SELECT id, extension, mimetype FROM mimetype";

const SETTING_QUERY: &str = "SELECT id, key, value FROM setting";

/// Read a cell as text. The registry fingerprint and the flag parsers work
/// on the textual column values, so INTEGER cells coerce to their decimal
/// form and NULL comes back as `None`.
fn cell_text(row: &Row<'_>, column: &str) -> LoadResult<Option<String>> {
    let text = match row.get_ref(column)? {
        ValueRef::Null => None,
        ValueRef::Integer(n) => Some(n.to_string()),
        ValueRef::Real(x) => Some(x.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    };
    Ok(text)
}

/// Read a mandatory cell; NULL fails the load.
fn require_text(row: &Row<'_>, table: &'static str, column: &'static str) -> LoadResult<String> {
    cell_text(row, column)?.ok_or(LoadError::NullColumn { table, column })
}

fn parse_number<T: std::str::FromStr>(
    value: String,
    table: &'static str,
    column: &'static str,
) -> LoadResult<T> {
    value.parse().map_err(|_| LoadError::BadColumn {
        table,
        column,
        value,
    })
}

/// Load every handler row, reusing surviving registry entries.
fn load_handlers(conn: &Connection, registry: &Registry) -> LoadResult<()> {
    let mut stmt = conn.prepare(HANDLER_QUERY)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let id = require_text(row, "handler", "id")?;
        let send_spec = require_text(row, "handler", "send_spec")?;
        let send_ident = require_text(row, "handler", "send_ident")?;
        let recv_spec = require_text(row, "handler", "recv_spec")?;
        let recv_ident = require_text(row, "handler", "recv_ident")?;
        let key = Registry::fingerprint(
            BackendKind::Handler,
            &[&id, &send_spec, &send_ident, &recv_spec, &recv_ident],
        );
        debug!(key = %key, "validating backend key for reload");

        if let Some(entry) = registry.get(&key) {
            let Some(h) = entry.backend().as_handler() else {
                return Err(LoadError::BackendTypeChanged { key });
            };
            debug!(key = %key, "found original handler, keeping it running");
            h.set_running(true);
        } else {
            let (raw, protocol) = match load_handler_options(conn, &id) {
                Ok(options) => options,
                Err(err) => {
                    warn!(
                        id = %id,
                        error = %err,
                        "couldn't get the handler raw_payload setting, \
                         you might need to rebuild your db"
                    );
                    (true, HandlerProtocol::Json)
                }
            };
            let handler =
                Handler::new(&send_spec, &send_ident, &recv_spec, &recv_ident, raw, protocol);
            info!(
                id = %id,
                send_spec = %send_spec,
                send_ident = %send_ident,
                recv_spec = %recv_spec,
                recv_ident = %recv_ident,
                "loaded handler"
            );
            registry.insert(key, Backend::Handler(handler))?;
        }
    }
    Ok(())
}

/// Fetch the per-id handler options. A missing row is an advisory, not an
/// error: the defaults are raw payloads over the json protocol.
fn load_handler_options(conn: &Connection, id: &str) -> LoadResult<(bool, HandlerProtocol)> {
    let mut stmt = conn.prepare(HANDLER_OPTIONS_QUERY)?;
    let mut rows = stmt.query([id])?;
    let Some(row) = rows.next()? else {
        warn!(id = %id, "no options row for handler, assuming raw json");
        return Ok((true, HandlerProtocol::Json));
    };

    let raw = match cell_text(row, "raw_payload")?.as_deref() {
        Some("1") => true,
        Some("0") => false,
        other => {
            warn!(
                id = %id,
                raw_payload = ?other,
                "weird raw_payload setting, assuming you want raw; it should be 0 or 1"
            );
            true
        }
    };
    let protocol = match cell_text(row, "protocol")? {
        Some(p) if p.starts_with('t') => HandlerProtocol::Tnet,
        _ => HandlerProtocol::Json,
    };
    info!(id = %id, protocol = ?protocol, "using handler protocol");
    Ok((raw, protocol))
}

/// Load every proxy row, reusing surviving registry entries.
fn load_proxies(conn: &Connection, registry: &Registry) -> LoadResult<()> {
    let mut stmt = conn.prepare(PROXY_QUERY)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let id = require_text(row, "proxy", "id")?;
        let addr = require_text(row, "proxy", "addr")?;
        let port = require_text(row, "proxy", "port")?;
        let key = Registry::fingerprint(BackendKind::Proxy, &[&id, &addr, &port]);

        if let Some(entry) = registry.get(&key) {
            if entry.kind() != BackendKind::Proxy {
                return Err(LoadError::BackendTypeChanged { key });
            }
            entry.backend().set_running(true);
        } else {
            let port = parse_number::<u16>(port, "proxy", "port")?;
            info!(id = %id, addr = %addr, port, "loaded proxy");
            registry.insert(key, Backend::Proxy(Proxy::new(&addr, port)))?;
        }
    }
    Ok(())
}

/// Load every directory row, reusing surviving registry entries. A NULL
/// `cache_ttl` means no caching.
fn load_dirs(conn: &Connection, registry: &Registry) -> LoadResult<()> {
    let mut stmt = conn.prepare(DIR_QUERY)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let id = require_text(row, "directory", "id")?;
        let base = require_text(row, "directory", "base")?;
        let index_file = require_text(row, "directory", "index_file")?;
        let default_ctype = require_text(row, "directory", "default_ctype")?;
        let cache_ttl = cell_text(row, "cache_ttl")?;
        let key = Registry::fingerprint(
            BackendKind::Dir,
            &[
                &id,
                &base,
                &index_file,
                &default_ctype,
                cache_ttl.as_deref().unwrap_or(""),
            ],
        );

        if let Some(entry) = registry.get(&key) {
            if entry.kind() != BackendKind::Dir {
                return Err(LoadError::BackendTypeChanged { key });
            }
            entry.backend().set_running(true);
        } else {
            let cache_ttl = match cache_ttl {
                Some(ttl) => parse_number::<u32>(ttl, "directory", "cache_ttl")?,
                None => 0,
            };
            info!(
                id = %id,
                base = %base,
                index = %index_file,
                ctype = %default_ctype,
                cache_ttl,
                "loaded dir"
            );
            registry.insert(
                key,
                Backend::Dir(Dir::new(&base, &index_file, &default_ctype, cache_ttl)),
            )?;
        }
    }
    Ok(())
}

/// Load the routes of one host and resolve them against the registry. A
/// resolved backend becomes active; an unresolved one fails the load.
fn load_routes(
    conn: &Connection,
    registry: &Registry,
    host_id: &str,
    server_id: &str,
    host: &mut Host,
) -> LoadResult<()> {
    let mut stmt = conn.prepare(ROUTE_QUERY)?;
    let mut rows = stmt.query([host_id, server_id])?;
    while let Some(row) = rows.next()? {
        let route_id = require_text(row, "route", "id")?;
        let path = require_text(row, "route", "path")?;
        let target_id = require_text(row, "route", "target_id")?;
        let target_type = require_text(row, "route", "target_type")?;
        debug!(
            host = %host.name,
            route = %route_id,
            path = %path,
            target_type = %target_type,
            target_id = %target_id,
            "loading route"
        );

        let entry = registry
            .find_backend(&target_type, &target_id)
            .ok_or_else(|| LoadError::UnresolvedRoute {
                path: path.clone(),
                target_type: target_type.clone(),
                target_id: target_id.clone(),
            })?;
        entry.set_active(true);
        host.add_route(path, entry.backend().clone());
    }
    Ok(())
}

/// Load the hosts of one server row, routes included, and resolve the
/// default host. Two hosts matching the declared default hostname fail the
/// load.
fn load_hosts(
    conn: &Connection,
    registry: &Registry,
    server_id: &str,
    server: &mut Server,
) -> LoadResult<()> {
    let mut stmt = conn.prepare(HOST_QUERY)?;
    let mut rows = stmt.query([server_id])?;
    while let Some(row) = rows.next()? {
        let host_id = require_text(row, "host", "id")?;
        let name = require_text(row, "host", "name")?;
        let matching = require_text(row, "host", "matching")?;

        let mut host = Host::new(&name, &matching)?;
        load_routes(conn, registry, &host_id, server_id, &mut host)?;
        info!(id = %host_id, name = %name, pattern = %matching, "adding host to server");

        let host = Arc::new(host);
        server.add_host(Arc::clone(&host));

        if host.name == server.default_hostname {
            if server.default_host().is_some() {
                return Err(LoadError::DuplicateDefaultHost(
                    server.default_hostname.clone(),
                ));
            }
            info!(name = %name, "setting default host");
            server.set_default_host(host);
        }
    }
    Ok(())
}

/// Load the full configuration graph for the server with the given uuid.
///
/// Backends are interned into `registry` (reusing entries that survive a
/// reload), then the server, host and route tree is built on top. On any
/// failure no server is returned and nothing that was interned is active.
pub fn load_server(conn: &Connection, registry: &Registry, uuid: &str) -> LoadResult<Server> {
    load_handlers(conn, registry)?;
    load_proxies(conn, registry)?;
    load_dirs(conn, registry)?;

    let mut stmt = conn.prepare(SERVER_QUERY)?;
    let mut rows = stmt.query([uuid])?;
    let mut found: Option<(String, Server)> = None;
    while let Some(row) = rows.next()? {
        if found.is_some() {
            info!(uuid = %uuid, "more than one server row matches this uuid, using the last one");
        }
        let id = require_text(row, "server", "id")?;
        let port = parse_number::<u16>(require_text(row, "server", "port")?, "server", "port")?;
        let server = Server::new(
            &require_text(row, "server", "uuid")?,
            &require_text(row, "server", "default_host")?,
            &require_text(row, "server", "bind_addr")?,
            port,
            &require_text(row, "server", "chroot")?,
            &require_text(row, "server", "access_log")?,
            &require_text(row, "server", "error_log")?,
            &require_text(row, "server", "pid_file")?,
        );
        found = Some((id, server));
    }
    let (server_id, mut server) =
        found.ok_or_else(|| LoadError::ServerNotFound(uuid.to_string()))?;

    load_hosts(conn, registry, &server_id, &mut server)?;
    info!(
        uuid = %server.uuid,
        port = server.port,
        default_host = %server.default_hostname,
        "loaded server"
    );
    Ok(server)
}

/// Load the extension to content-type table.
pub fn load_mimetypes(conn: &Connection) -> LoadResult<HashMap<String, String>> {
    let mut stmt = conn.prepare(MIMETYPE_QUERY)?;
    let mut rows = stmt.query([])?;
    let mut mimetypes = HashMap::new();
    while let Some(row) = rows.next()? {
        let extension = require_text(row, "mimetype", "extension")?;
        let mimetype = require_text(row, "mimetype", "mimetype")?;
        mimetypes.insert(extension, mimetype);
    }
    Ok(mimetypes)
}

/// Load the process settings table.
pub fn load_settings(conn: &Connection) -> LoadResult<HashMap<String, String>> {
    let mut stmt = conn.prepare(SETTING_QUERY)?;
    let mut rows = stmt.query([])?;
    let mut settings = HashMap::new();
    while let Some(row) = rows.next()? {
        let key = require_text(row, "setting", "key")?;
        let value = require_text(row, "setting", "value")?;
        settings.insert(key, value);
    }
    Ok(settings)
}
