#[cfg(feature = "live")]
use std::sync::mpsc::RecvError;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors returned by plugin implementations.
pub use anyhow::Error as PluginError;

/// Failure to resolve a dependency to an asset group.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No resolver in the pipeline could locate the module. Optional
    /// dependencies swallow this variant and resolve to nothing.
    #[error("Cannot find module '{specifier}' from '{from}'")]
    NotFound { specifier: String, from: String },

    #[error("Resolver '{0}':\n{1}")]
    Plugin(String, PluginError),
}

impl ResolveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResolveError::NotFound { .. })
    }
}

/// Malformed configuration, fatal at load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} can't be empty")]
    Empty(Utf8PathBuf),

    #[error("Couldn't read config '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Invalid config '{0}'.\n{1}")]
    Parse(Utf8PathBuf, serde_json::Error),

    #[error("Only one spread element can be included in a config pipeline ('{key}' in '{path}')")]
    MultipleSpread { path: Utf8PathBuf, key: String },

    #[error("Couldn't resolve '{name}' extended from '{path}'")]
    Extends { path: Utf8PathBuf, name: String },

    #[error("Config '{0}' extends itself")]
    CircularExtends(Utf8PathBuf),

    #[error("Invalid glob '{0}' in config.\n{1}")]
    Glob(String, glob::PatternError),

    #[error("Unknown {kind} plugin '{name}'")]
    UnknownPlugin { kind: &'static str, name: String },
}

/// Failure of a single request run.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Transforming '{0}':\n{1}")]
    Transform(Utf8PathBuf, PluginError),

    #[error("Loading config of '{plugin}' for '{path}':\n{error}")]
    Config {
        path: Utf8PathBuf,
        plugin: String,
        error: PluginError,
    },

    #[error("Entry '{0}' does not exist")]
    EntryNotFound(String),

    #[error("Couldn't read package manifest '{0}'.\n{1}")]
    Manifest(Utf8PathBuf, serde_json::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Request panicked: {0}")]
    Panic(String),

    #[error("Sub-requests never completed")]
    Unresolved,
}

/// Failure of a whole build pass.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The build was cancelled because inputs changed while it was running.
    /// The coordinator discards partial work and restarts; this is never
    /// reported as a failure.
    #[error("Build aborted")]
    Aborted,

    #[error("Request '{0}':\n{1}")]
    Request(String, RequestError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Bundler:\n{0}")]
    Bundle(PluginError),

    #[error("Packaging bundle '{0}':\n{1}")]
    Package(String, PluginError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BuildError {
    pub fn is_abort(&self) -> bool {
        matches!(self, BuildError::Aborted)
    }
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("Watcher stopped: {0}")]
    Recv(#[from] RecvError),
}
