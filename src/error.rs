//! Error types for configuration loading and the backend registry.

use thiserror::Error;

/// Errors that are fatal to a configuration load.
///
/// The loader performs no silent recovery: any of these aborts the load and
/// the caller is expected to abort startup. Advisory conditions (a missing
/// handler options row, an unusable `raw_payload` cell) are logged and
/// defaulted instead of raised.
#[derive(Debug, Error)]
pub enum LoadError {
    /// SQL execution failure in the configuration store.
    #[error("config database: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A mandatory column came back NULL.
    #[error("{table}.{column} is NULL")]
    NullColumn {
        table: &'static str,
        column: &'static str,
    },

    /// A column held a value the loader cannot use (for example a
    /// non-numeric port).
    #[error("{table}.{column} has unusable value {value:?}")]
    BadColumn {
        table: &'static str,
        column: &'static str,
        value: String,
    },

    /// A backend key was inserted twice in one load.
    #[error("backend {0} is already registered")]
    DuplicateBackend(String),

    /// A surviving registry entry no longer matches the type the
    /// configuration says it should have.
    #[error("backend {key} is registered with a different type")]
    BackendTypeChanged { key: String },

    /// A route referenced a backend that was never loaded.
    #[error("route {path} references unknown backend {target_type}:{target_id}")]
    UnresolvedRoute {
        path: String,
        target_type: String,
        target_id: String,
    },

    /// More than one host matched the server's declared default hostname.
    #[error("more than one host matches the default host {0}")]
    DuplicateDefaultHost(String),

    /// No server row carried the requested uuid.
    #[error("no server with uuid {0}")]
    ServerNotFound(String),

    /// A host's matching pattern did not compile.
    #[error("host pattern {pattern:?} does not compile: {source}")]
    BadHostPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A [Result] alias for the [LoadError] type.
pub type LoadResult<T> = std::result::Result<T, LoadError>;
