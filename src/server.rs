//! The configured object tree: Server, Host, Route.
//!
//! The tree is built by the loader and then read-only; a reload builds a
//! whole new tree. Routes hold clones of the [`Backend`] enum, so the tree
//! never owns backend lifecycle state; the registry stays the authority for
//! the `active` and `running` flags.

use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use crate::backend::Backend;
use crate::error::{LoadError, LoadResult};

/// Compiled host matching pattern.
///
/// The pattern is a hostname glob: `*` matches any run of characters, every
/// other character is literal. Compiled once at load time to an anchored,
/// case-insensitive regex.
#[derive(Debug, Clone)]
pub struct HostPattern {
    pattern: String,
    re: Regex,
}

impl HostPattern {
    pub fn compile(pattern: &str) -> LoadResult<Self> {
        let mut expr = String::with_capacity(pattern.len() + 4);
        expr.push('^');
        for (i, chunk) in pattern.split('*').enumerate() {
            if i > 0 {
                expr.push_str(".*");
            }
            expr.push_str(&regex::escape(chunk));
        }
        expr.push('$');
        let re = RegexBuilder::new(&expr)
            .case_insensitive(true)
            .build()
            .map_err(|source| LoadError::BadHostPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self {
            pattern: pattern.to_string(),
            re,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, hostname: &str) -> bool {
        self.re.is_match(hostname)
    }
}

/// A path prefix bound to a backend.
#[derive(Debug, Clone)]
pub struct Route {
    pub path: String,
    pub backend: Backend,
}

/// A named virtual host and its route table.
#[derive(Debug)]
pub struct Host {
    pub name: String,
    pub matching: HostPattern,
    routes: Vec<Route>,
}

impl Host {
    pub fn new(name: &str, matching: &str) -> LoadResult<Self> {
        Ok(Self {
            name: name.to_string(),
            matching: HostPattern::compile(matching)?,
            routes: Vec::new(),
        })
    }

    pub(crate) fn add_route(&mut self, path: String, backend: Backend) {
        self.routes.push(Route { path, backend });
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Does this host serve the given request hostname?
    pub fn matches(&self, hostname: &str) -> bool {
        self.matching.matches(hostname)
    }

    /// Pick the route whose prefix covers `path`. The longest matching
    /// prefix wins.
    pub fn find_route(&self, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|r| path.starts_with(&r.path))
            .max_by_key(|r| r.path.len())
    }
}

/// Root of the configured object tree for one server row.
#[derive(Debug)]
pub struct Server {
    pub uuid: String,
    pub default_hostname: String,
    pub bind_addr: String,
    pub port: u16,
    pub chroot: String,
    pub access_log: String,
    pub error_log: String,
    pub pid_file: String,
    hosts: Vec<Arc<Host>>,
    default_host: Option<Arc<Host>>,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        uuid: &str,
        default_hostname: &str,
        bind_addr: &str,
        port: u16,
        chroot: &str,
        access_log: &str,
        error_log: &str,
        pid_file: &str,
    ) -> Self {
        Self {
            uuid: uuid.to_string(),
            default_hostname: default_hostname.to_string(),
            bind_addr: bind_addr.to_string(),
            port,
            chroot: chroot.to_string(),
            access_log: access_log.to_string(),
            error_log: error_log.to_string(),
            pid_file: pid_file.to_string(),
            hosts: Vec::new(),
            default_host: None,
        }
    }

    pub(crate) fn add_host(&mut self, host: Arc<Host>) {
        self.hosts.push(host);
    }

    pub(crate) fn set_default_host(&mut self, host: Arc<Host>) {
        self.default_host = Some(host);
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn default_host(&self) -> Option<&Arc<Host>> {
        self.default_host.as_ref()
    }

    /// Find the host serving a request hostname: first pattern match wins,
    /// the default host catches the rest.
    pub fn find_host(&self, hostname: &str) -> Option<&Arc<Host>> {
        self.hosts
            .iter()
            .find(|h| h.matches(hostname))
            .or(self.default_host.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Proxy;

    fn proxy() -> Backend {
        Backend::Proxy(Proxy::new("127.0.0.1", 8080))
    }

    #[test]
    fn test_host_pattern_exact() {
        let pattern = HostPattern::compile("api.example.com").unwrap();
        assert!(pattern.matches("api.example.com"));
        assert!(pattern.matches("API.Example.COM"));
        assert!(!pattern.matches("api.example.com.evil"));
        assert!(!pattern.matches("www.example.com"));
    }

    #[test]
    fn test_host_pattern_wildcard() {
        let pattern = HostPattern::compile("*.example.com").unwrap();
        assert!(pattern.matches("foo.example.com"));
        assert!(pattern.matches("foo.bar.example.com"));
        assert!(!pattern.matches("example.com"));
        assert!(!pattern.matches("foo.example.org"));
    }

    #[test]
    fn test_host_pattern_escapes_literals() {
        // The dot is literal, not a regex any-char.
        let pattern = HostPattern::compile("d.example").unwrap();
        assert!(!pattern.matches("dxexample"));
        assert!(pattern.matches("d.example"));
    }

    #[test]
    fn test_find_route_longest_prefix_wins() {
        let mut host = Host::new("d.example", "d.example").unwrap();
        host.add_route("/".to_string(), proxy());
        host.add_route("/api".to_string(), proxy());
        host.add_route("/api/v2".to_string(), proxy());

        assert_eq!(host.find_route("/index.html").unwrap().path, "/");
        assert_eq!(host.find_route("/api/users").unwrap().path, "/api");
        assert_eq!(host.find_route("/api/v2/users").unwrap().path, "/api/v2");
        assert!(host.find_route("nope").is_none());
    }

    #[test]
    fn test_find_host_falls_back_to_default() {
        let mut server = Server::new(
            "54c6755b",
            "d.example",
            "0.0.0.0",
            6767,
            "/var/www",
            "/logs/access.log",
            "/logs/error.log",
            "/run/kennel.pid",
        );
        let main = Arc::new(Host::new("d.example", "d.example").unwrap());
        let wild = Arc::new(Host::new("wild", "*.d.example").unwrap());
        server.add_host(Arc::clone(&main));
        server.add_host(Arc::clone(&wild));
        server.set_default_host(Arc::clone(&main));

        assert_eq!(server.find_host("d.example").unwrap().name, "d.example");
        assert_eq!(server.find_host("a.d.example").unwrap().name, "wild");
        // Unknown hostnames land on the default host.
        assert_eq!(server.find_host("elsewhere.org").unwrap().name, "d.example");
    }
}
