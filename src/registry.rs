//! Keyed store of loaded backends.
//!
//! Backends are interned under a deterministic fingerprint key of the form
//! `type:col0:col1:…:` built from the identity columns of their
//! configuration row. The trailing separator is part of the contract: a
//! `type:id:` prefix search is unambiguous because every key component ends
//! in `:`.
//!
//! The registry persists across configuration reloads. That is what makes
//! reload-without-restart work: a backend whose key reappears in the new
//! configuration is the same object, flags and worker included. Entries are
//! never removed while the process runs; deactivation just clears `active`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::backend::{Backend, BackendKind};
use crate::error::{LoadError, LoadResult};
use crate::handler;

/// One interned backend with its lifecycle flags.
///
/// `active` means at least one route in the current configuration refers to
/// this backend; it is flipped by the loader and the stop sweep only.
#[derive(Debug)]
pub struct BackendEntry {
    key: String,
    backend: Backend,
    active: AtomicBool,
}

impl BackendEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, on: bool) {
        self.active.store(on, Ordering::Release);
    }
}

/// Process-wide interning store for backends.
///
/// A sorted map over the fingerprint keys serves both exact lookup and the
/// prefix lookup routes need; a plain hash map could not answer the latter.
/// The map is behind a read/write lock: loader phases and lifecycle sweeps
/// take whichever side they need, route lookups from worker tasks take the
/// read side.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<BTreeMap<String, Arc<BackendEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the fingerprint key for a backend row: the type tag followed
    /// by every identity column, each terminated by `:`.
    pub fn fingerprint(kind: BackendKind, cols: &[&str]) -> String {
        let mut key = String::with_capacity(16 + cols.len() * 8);
        key.push_str(kind.as_str());
        key.push(':');
        for col in cols {
            key.push_str(col);
            key.push(':');
        }
        key
    }

    /// Intern a freshly created backend. Fails if the key is taken; the
    /// loader looks up first and only inserts on a miss.
    pub fn insert(&self, key: String, backend: Backend) -> LoadResult<Arc<BackendEntry>> {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(LoadError::DuplicateBackend(key));
        }
        let entry = Arc::new(BackendEntry {
            key: key.clone(),
            backend,
            active: AtomicBool::new(false),
        });
        entries.insert(key, Arc::clone(&entry));
        Ok(entry)
    }

    /// Exact-key lookup.
    pub fn get(&self, key: &str) -> Option<Arc<BackendEntry>> {
        self.entries.read().get(key).cloned()
    }

    /// Return an entry whose key starts with `prefix`, if any. With
    /// well-formed fingerprints a `type:id:` prefix matches at most one
    /// entry; on a tie the lexicographically first key wins.
    pub fn find_prefix(&self, prefix: &str) -> Option<Arc<BackendEntry>> {
        let entries = self.entries.read();
        let (key, entry) = entries.range(prefix.to_string()..).next()?;
        key.starts_with(prefix).then(|| Arc::clone(entry))
    }

    /// Find a backend by its type tag and configuration id, the way routes
    /// reference it, without knowing the full key shape.
    pub fn find_backend(&self, target_type: &str, target_id: &str) -> Option<Arc<BackendEntry>> {
        self.find_prefix(&format!("{target_type}:{target_id}:"))
    }

    /// Visit every entry. Order is unspecified.
    pub fn for_each(&self, mut visit: impl FnMut(&Arc<BackendEntry>)) {
        for entry in self.entries.read().values() {
            visit(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Start pass: spawn a worker for every active handler that is not
    /// already running. Must be called from within a tokio runtime.
    pub fn start_handlers(&self) {
        debug!("starting active handlers");
        self.for_each(|entry| {
            let Some(h) = entry.backend().as_handler() else {
                return;
            };
            if !entry.is_active() {
                debug!(key = entry.key(), "skipping inactive handler");
                return;
            }
            if !h.is_running() {
                debug!(key = entry.key(), send_spec = %h.send_spec, "starting handler");
                entry.backend().set_running(true);
                handler::spawn_worker(Arc::clone(h));
            }
        });
    }

    /// Stop pass: quiesce every active entry. Workers observe the cleared
    /// `running` flag at their next wakeup and terminate themselves.
    pub fn stop_all(&self) {
        self.for_each(|entry| {
            if !entry.is_active() {
                return;
            }
            debug!(key = entry.key(), "stopping backend");
            entry.backend().set_running(false);
            entry.set_active(false);
        });
    }
}
