//! The persistent backend: component B of the engine (`spec.md` §4.B).
//!
//! A [`Backend`] owns five logical tables (functions, calls, call-files,
//! external sources, external destinations) plus the file-digest table from
//! [`crate::digest`], and is the only part of the engine that ever touches
//! disk directly. Two engines implement it: [`snapshot`], a single
//! bincode-serialized blob kept entirely in memory between saves, and
//! (behind the `sql-backend` feature) [`sql`], an embedded SQLite database.
//!
//! Call results and bound-argument representations are stored as
//! [`serde_json::Value`] rather than opaque bytes. This is a deliberate
//! departure from the teacher, whose cache values are native Python objects
//! pickled as-is: storing JSON here means `--config-dump` and
//! `--config-query` can walk the whole database generically, without the
//! backend needing to know the concrete type of anything it stores.

pub mod snapshot;

#[cfg(feature = "sql-backend")]
pub mod sql;

use std::path::{Path, PathBuf};

use crate::digest::{Digest, Observation};
use crate::error::Result;

/// Identifies one memoized invocation of a function, scoped to that
/// function's name. Monotonically assigned by the backend on `save_call`.
pub type CallId = u64;

/// A previously recorded call: its bound-argument digest (for the
/// fast-path lookup), the bound representation itself (for
/// [`crate::dirtiness`] to re-derive argument identity), and the memoized
/// result.
#[derive(Clone, Debug)]
pub struct CallRecord {
    pub call_id: CallId,
    pub bound_digest: Digest,
    pub bound_repr: serde_json::Value,
    pub result: serde_json::Value,
}

/// The file paths a call declared as external sources or destinations via
/// [`crate::memoize::Call::add_external_dependencies`], as last recorded.
#[derive(Clone, Debug, Default)]
pub struct ExternalFiles {
    pub srcs: Vec<PathBuf>,
    pub dsts: Vec<PathBuf>,
}

/// One row of the call-file table: the digest recorded for a single
/// declared or external path under a given role name, scoped to one call.
/// Both backend engines store this relationally (`(call_id, role, path) ->
/// digest`); this type exists so callers of [`Backend::find_call_file`]
/// have a named shape to build on rather than a bare tuple.
#[derive(Clone, Debug)]
pub struct CallFileRecord {
    pub call_id: CallId,
    pub role: String,
    pub path: PathBuf,
    pub digest: Digest,
}

/// The storage contract every backend engine must satisfy.
///
/// All methods are synchronous: callers that need concurrent access (the
/// scheduler's worker pool) are expected to hold the backend behind a
/// `Mutex`, mirroring the teacher's own single-writer assumption for its
/// cache file.
pub trait Backend: Send {
    /// Open (creating if absent) the backend's persisted state at `path`.
    fn connect(&mut self, path: &Path) -> Result<()>;

    /// Flush and close the backend, writing a consistent snapshot to
    /// `path`. After this returns, killing the process must not corrupt
    /// what was already persisted.
    fn close(&mut self, path: &Path) -> Result<()>;

    /// The last digest recorded for a function's own body/source, or
    /// `None` if the function has never been called.
    fn find_function(&self, name: &str) -> Result<Option<Digest>>;

    /// Record (or update) a function's digest. Per `spec.md` §4.B/§4.C,
    /// this is a single atomic operation: if a digest was already recorded
    /// for `name` and it differs from `digest`, every call record,
    /// call-file record, and external-deps record for `name` is deleted as
    /// part of the same call, via [`Backend::clear_calls`]. Implementations
    /// must perform this cascade themselves rather than leave it to the
    /// caller.
    fn save_function(&mut self, name: &str, digest: Digest) -> Result<()>;

    /// Drop every call, call-file, and external-deps record under `name`.
    /// Exposed as its own method because [`Backend::save_function`] uses it
    /// internally, and because a caller may want to force-invalidate a
    /// function's calls without changing its recorded digest (e.g.
    /// `--configure`-style resets scoped to one function).
    fn clear_calls(&mut self, name: &str) -> Result<()>;

    /// Find a previously recorded call for `name` whose bound-argument
    /// digest matches `bound_digest`. There is at most one live call per
    /// `(name, bound_digest)` pair; a match replaces rather than
    /// accumulates.
    fn find_call(&self, name: &str, bound_digest: Digest) -> Result<Option<CallRecord>>;

    /// Record a call's result, replacing any prior call for the same
    /// `(name, bound_digest)`. Returns the (possibly reused) call id, which
    /// scopes the call-file and external-file tables.
    fn save_call(
        &mut self,
        name: &str,
        bound_digest: Digest,
        bound_repr: serde_json::Value,
        result: serde_json::Value,
    ) -> Result<CallId>;

    /// The digest last recorded for a source or destination path declared
    /// under role `name` (e.g. `"src"`, `"dst"`, or an indexed variant for
    /// `srcs`/`dsts`) on `call_id`.
    fn find_call_file(&self, call_id: CallId, name: &str, path: &Path) -> Result<Option<Digest>>;

    /// Record the digest observed for a declared source or destination
    /// path on `call_id`.
    fn save_call_file(&mut self, call_id: CallId, name: &str, path: &Path, digest: Digest) -> Result<()>;

    /// The external source/destination paths last recorded for `call_id`
    /// via `add_external_dependencies`.
    fn find_external_files(&self, call_id: CallId) -> Result<ExternalFiles>;

    /// Replace the external source/destination paths recorded for
    /// `call_id`, together with their observed digests (recorded into the
    /// call-file table under the `"ext-src"`/`"ext-dst"` role names).
    fn save_external_files(
        &mut self,
        call_id: CallId,
        srcs: &[(PathBuf, Digest)],
        dsts: &[(PathBuf, Digest)],
    ) -> Result<()>;

    /// Query (refreshing if necessary) the digest of a path through the
    /// backend's shared file-digest table, so every caller sees a
    /// consistent view of what was last observed for a given path within
    /// one run.
    fn observe_file(&mut self, path: &Path) -> Result<Observation>;

    /// Render the whole persisted state as one JSON value, for
    /// `--config-dump`/`--config-query`. Top-level keys are function
    /// names; each function maps call ids (as strings) to `{bound, result}`
    /// objects.
    fn dump(&self) -> Result<serde_json::Value>;

    /// Remove every entry in the dump reachable by the dotted `path` (see
    /// [`crate::driver`]'s `--config-remove`). Returns whether anything was
    /// removed.
    fn remove_path(&mut self, path: &[String]) -> Result<bool>;
}
