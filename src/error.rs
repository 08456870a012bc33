//! The error taxonomy used throughout the engine.
//!
//! Every fallible operation in this crate returns [`Result<T>`], a thin
//! alias over `std::result::Result<T, Error>`. Errors are never silently
//! swallowed inside a memoized call: a failure aborts that call and nothing
//! is written to the backend for it (see [`crate::memoize`]).

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A tool-detection or environment-configuration step failed. The core
    /// itself never raises this directly, but build scripts built on top of
    /// it do, and it needs a home in the shared taxonomy.
    #[error("configuration failed: {0}")]
    ConfigFailed(String),

    /// An external tool invoked through the [`crate::executor::Executor`]
    /// exited with a non-zero status.
    #[error("command `{argv}` failed with exit code {exit_code}")]
    ExecutionError { argv: String, exit_code: i32 },

    /// An external tool did not finish before its deadline.
    #[error("command `{argv}` timed out after {elapsed_secs:.1}s")]
    ExecutionTimedOut { argv: String, elapsed_secs: f32 },

    /// An external tool could not even be started.
    #[error("failed to launch command `{argv}`: {source}")]
    SpawnError {
        argv: String,
        #[source]
        source: std::io::Error,
    },

    /// A failure while reading, writing, or decoding the persistent backend.
    #[error("database error: {0}")]
    DatabaseError(String),

    /// A declared source path does not exist.
    #[error("missing dependency: `{0}`")]
    MissingDependency(PathBuf),

    /// A file that was expected to exist during a digest query could not be
    /// read at all.
    #[error("file missing: `{0}`")]
    FileMissing(PathBuf),

    /// A dependency cycle was detected while scheduling
    /// [`crate::scheduler::Pool::map_with_dependencies`].
    #[error("dependency cycle detected among scheduled tasks")]
    DependencyCycle,

    /// The user interrupt signal was observed; the current operation is
    /// unwinding cooperatively.
    #[error("build cancelled")]
    Cancelled,

    /// The user's build script raised an error of its own.
    #[error("build script error: {0}")]
    BuildScriptError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "sql-backend")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    pub fn database(msg: impl Into<String>) -> Self {
        Error::DatabaseError(msg.into())
    }

    /// Whether this error should be reported to the user as a single
    /// coloured summary line (true for every variant a build script or CLI
    /// user can reasonably be expected to act on).
    pub fn is_user_visible(&self) -> bool {
        true
    }
}
