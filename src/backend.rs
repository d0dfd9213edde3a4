//! Backend variants and their worker-visible state.
//!
//! A backend is a routable target: a Handler (out-of-process worker reached
//! over messaging sockets), a Proxy (TCP forward), or a Dir (static files).
//! The registry owns every backend; hosts and routes hold cheap clones of
//! the [`Backend`] enum, which shares the concrete struct behind an `Arc`.
//!
//! The `running` flag on each variant is the lifecycle contract with worker
//! tasks: only the registry's start/stop sweeps write it, workers read it at
//! their next wakeup and shut themselves down when it goes false.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

/// Wire protocol spoken to an out-of-process handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerProtocol {
    /// Tagged-netstring headers dict.
    Tnet,
    /// JSON headers object wrapped in a plain netstring.
    Json,
}

/// Backend type tag. Doubles as the first component of a registry key and
/// as the `target_type` value routes use to reference a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Handler,
    Proxy,
    Dir,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Handler => "handler",
            BackendKind::Proxy => "proxy",
            BackendKind::Dir => "dir",
        }
    }
}

/// An out-of-process handler endpoint pair.
///
/// Requests flow out through `send_spec`, responses come back on
/// `recv_spec`. Each handler owns an outbox of encoded frames; the worker
/// task drains it and parks the receiver back when it stops, so a later
/// start pass can respawn the worker on the same channel.
#[derive(Debug)]
pub struct Handler {
    pub send_spec: String,
    pub send_ident: String,
    pub recv_spec: String,
    pub recv_ident: String,
    /// Deliver the raw request body instead of the parsed form.
    pub raw: bool,
    pub protocol: HandlerProtocol,
    running: AtomicBool,
    outbox: UnboundedSender<Vec<u8>>,
    pub(crate) inbox: Mutex<Option<UnboundedReceiver<Vec<u8>>>>,
    pub(crate) shutdown: Notify,
}

impl Handler {
    pub fn new(
        send_spec: &str,
        send_ident: &str,
        recv_spec: &str,
        recv_ident: &str,
        raw: bool,
        protocol: HandlerProtocol,
    ) -> Arc<Self> {
        let (outbox, inbox) = mpsc::unbounded_channel();
        Arc::new(Self {
            send_spec: send_spec.to_string(),
            send_ident: send_ident.to_string(),
            recv_spec: recv_spec.to_string(),
            recv_ident: recv_ident.to_string(),
            raw,
            protocol,
            running: AtomicBool::new(false),
            outbox,
            inbox: Mutex::new(Some(inbox)),
            shutdown: Notify::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, on: bool) {
        self.running.store(on, Ordering::Release);
        if !on {
            // notify_one stores a permit, so a worker that is mid-frame
            // rather than parked still sees the stop at its next wait.
            self.shutdown.notify_one();
        }
    }

    /// Queue an encoded request frame for the worker. Returns false if the
    /// channel is gone, which only happens during teardown.
    pub fn deliver(&self, frame: Vec<u8>) -> bool {
        self.outbox.send(frame).is_ok()
    }
}

/// A plain TCP forwarding target.
#[derive(Debug)]
pub struct Proxy {
    pub addr: String,
    pub port: u16,
    running: AtomicBool,
}

impl Proxy {
    pub fn new(addr: &str, port: u16) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.to_string(),
            port,
            running: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// A static-file directory target.
#[derive(Debug)]
pub struct Dir {
    pub base: String,
    pub index_file: String,
    pub default_ctype: String,
    /// Cache lifetime for served files, in seconds. Zero disables caching.
    pub cache_ttl: u32,
    running: AtomicBool,
}

impl Dir {
    pub fn new(base: &str, index_file: &str, default_ctype: &str, cache_ttl: u32) -> Arc<Self> {
        Arc::new(Self {
            base: base.to_string(),
            index_file: index_file.to_string(),
            default_ctype: default_ctype.to_string(),
            cache_ttl,
            running: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// A routable backend. Clones share the underlying struct.
#[derive(Debug, Clone)]
pub enum Backend {
    Handler(Arc<Handler>),
    Proxy(Arc<Proxy>),
    Dir(Arc<Dir>),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Handler(_) => BackendKind::Handler,
            Backend::Proxy(_) => BackendKind::Proxy,
            Backend::Dir(_) => BackendKind::Dir,
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            Backend::Handler(h) => h.is_running(),
            Backend::Proxy(p) => p.is_running(),
            Backend::Dir(d) => d.is_running(),
        }
    }

    pub(crate) fn set_running(&self, on: bool) {
        match self {
            Backend::Handler(h) => h.set_running(on),
            Backend::Proxy(p) => p.running.store(on, Ordering::Release),
            Backend::Dir(d) => d.running.store(on, Ordering::Release),
        }
    }

    pub fn as_handler(&self) -> Option<&Arc<Handler>> {
        match self {
            Backend::Handler(h) => Some(h),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(BackendKind::Handler.as_str(), "handler");
        assert_eq!(BackendKind::Proxy.as_str(), "proxy");
        assert_eq!(BackendKind::Dir.as_str(), "dir");
    }

    #[test]
    fn test_backend_kind_and_flags() {
        let backend = Backend::Proxy(Proxy::new("127.0.0.1", 8080));
        assert_eq!(backend.kind(), BackendKind::Proxy);
        assert!(!backend.is_running());
        backend.set_running(true);
        assert!(backend.is_running());
        backend.set_running(false);
        assert!(!backend.is_running());
    }

    #[test]
    fn test_handler_deliver_queues_without_worker() {
        let handler = Handler::new(
            "tcp://127.0.0.1:9997",
            "54c6755b",
            "tcp://127.0.0.1:9996",
            "54c6755b",
            true,
            HandlerProtocol::Tnet,
        );
        assert!(handler.deliver(b"frame".to_vec()));

        let mut inbox = handler.inbox.lock().take().unwrap();
        assert_eq!(inbox.try_recv().unwrap(), b"frame".to_vec());
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn test_backend_clone_shares_state() {
        let backend = Backend::Dir(Dir::new("/var/www/", "index.html", "text/plain", 30));
        let clone = backend.clone();
        backend.set_running(true);
        assert!(clone.is_running());
    }
}
