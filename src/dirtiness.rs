//! The dirtiness detector: component C of the engine (`spec.md` §4.C).
//!
//! [`evaluate`] is a pure decision procedure: given the pending invocation's
//! identity and declared sources, it consults the file-digest table and the
//! backend and returns a [`Decision`] describing exactly what changed,
//! without mutating anything except the file-digest table's own lazily
//! refreshed entries. The memoization façade ([`crate::memoize`]) is the
//! only caller, and is the one that turns a [`Decision`] into a cache
//! hit/miss and persists the outcome of a miss.
//!
//! Grounded directly on `fbuild/db/backend.py`'s `Backend.prepare` /
//! `check_call_files` / `check_external_files`, which return the same
//! seven-tuple this module's `Decision` struct renames field-by-field.

use std::path::PathBuf;

use crate::backend::{Backend, CallId};
use crate::digest::Digest;
use crate::error::Result;

/// The outcome of evaluating one pending invocation against the backend.
#[derive(Clone, Debug)]
pub struct Decision {
    pub function_dirty: bool,
    pub call_id: Option<CallId>,
    pub previous_result: Option<serde_json::Value>,
    pub dirty_files: Vec<(PathBuf, Digest)>,
    pub external_dirty: bool,
    pub external_srcs: Vec<PathBuf>,
    pub external_dsts: Vec<PathBuf>,
    pub external_digests: Vec<(PathBuf, Digest)>,
}

/// Evaluate a pending call.
///
/// 1. `function_dirty` is set iff the function's recorded digest (if any)
///    differs from `function_digest`.
/// 2. The call is looked up by `(function_name, bound_digest)`; absence
///    leaves `call_id`/`previous_result` empty.
/// 3. Every path in `declared_srcs` is observed. With no prior call, every
///    declared source counts as dirty; otherwise a source is dirty if its
///    freshly observed digest doesn't match what was recorded for it under
///    this call id.
/// 4. The call's previously recorded external sources (from
///    `add_external_dependencies`) are checked the same way; a source that
///    can no longer be stat'd marks `external_dirty` instead of failing
///    outright, since a re-run is exactly how such paths get recovered.
///    Destinations are surfaced for later re-recording but never checked
///    for content: their absence does not count as a miss.
pub fn evaluate(
    backend: &mut dyn Backend,
    function_name: &str,
    function_digest: Digest,
    bound_digest: Digest,
    declared_srcs: &[PathBuf],
) -> Result<Decision> {
    let function_dirty = backend.find_function(function_name)?.map(|d| d != function_digest).unwrap_or(true);

    let existing = backend.find_call(function_name, bound_digest)?;
    let call_id = existing.as_ref().map(|c| c.call_id);
    let previous_result = existing.as_ref().map(|c| c.result.clone());

    let mut dirty_files = Vec::new();
    for path in declared_srcs {
        let observation = backend.observe_file(path)?;
        let dirty = match call_id {
            None => true,
            Some(id) => match backend.find_call_file(id, "src", path)? {
                Some(recorded) => recorded != observation.digest,
                None => true,
            },
        };
        if dirty {
            dirty_files.push((path.clone(), observation.digest));
        }
    }

    let mut external_dirty = false;
    let mut external_digests = Vec::new();
    let (external_srcs, external_dsts) = match call_id {
        Some(id) => {
            let recorded = backend.find_external_files(id)?;
            for path in &recorded.srcs {
                match backend.observe_file(path) {
                    Ok(observation) => {
                        let matches = backend
                            .find_call_file(id, "ext-src", path)?
                            .map(|d| d == observation.digest)
                            .unwrap_or(false);
                        if !matches {
                            external_dirty = true;
                        }
                        external_digests.push((path.clone(), observation.digest));
                    }
                    Err(_) => external_dirty = true,
                }
            }
            (recorded.srcs, recorded.dsts)
        }
        None => (Vec::new(), Vec::new()),
    };

    Ok(Decision {
        function_dirty,
        call_id,
        previous_result,
        dirty_files,
        external_dirty,
        external_srcs,
        external_dsts,
        external_digests,
    })
}

/// Whether a [`Decision`] counts as a cache hit: the function is unchanged,
/// a prior call exists, every declared source is unchanged, and no external
/// source went dirty or missing.
pub fn is_hit(d: &Decision) -> bool {
    !d.function_dirty && d.call_id.is_some() && d.dirty_files.is_empty() && !d.external_dirty
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::snapshot::SnapshotBackend;
    use std::fs;
    use tempfile::tempdir;

    fn backend() -> SnapshotBackend {
        SnapshotBackend::new()
    }

    #[test]
    fn first_call_is_never_a_hit() {
        let mut b = backend();
        let fd = Digest::of_bytes(b"fn");
        let bd = Digest::of_bytes(b"args");
        let decision = evaluate(&mut b, "f", fd, bd, &[]).unwrap();
        assert!(!is_hit(&decision));
        assert!(decision.call_id.is_none());
    }

    #[test]
    fn recorded_call_with_unchanged_source_is_a_hit() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.c");
        fs::write(&src, "int main() {}").unwrap();

        let mut b = backend();
        let fd = Digest::of_bytes(b"fn");
        let bd = Digest::of_bytes(b"args");

        b.save_function("f", fd).unwrap();
        let obs = b.observe_file(&src).unwrap();
        let call_id = b
            .save_call("f", bd, serde_json::json!([src.to_string_lossy()]), serde_json::json!("ok"))
            .unwrap();
        b.save_call_file(call_id, "src", &src, obs.digest).unwrap();

        let decision = evaluate(&mut b, "f", fd, bd, std::slice::from_ref(&src)).unwrap();
        assert!(is_hit(&decision));
        assert_eq!(decision.previous_result, Some(serde_json::json!("ok")));
    }

    #[test]
    fn changed_function_digest_is_dirty_even_with_unchanged_sources() {
        let mut b = backend();
        let bd = Digest::of_bytes(b"args");
        b.save_function("f", Digest::of_bytes(b"old")).unwrap();
        b.save_call("f", bd, serde_json::json!([]), serde_json::json!("ok")).unwrap();

        let decision = evaluate(&mut b, "f", Digest::of_bytes(b"new"), bd, &[]).unwrap();
        assert!(decision.function_dirty);
        assert!(!is_hit(&decision));
    }

    #[test]
    fn changed_source_content_marks_it_dirty() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.c");
        fs::write(&src, "v1").unwrap();

        let mut b = backend();
        let fd = Digest::of_bytes(b"fn");
        let bd = Digest::of_bytes(b"args");
        b.save_function("f", fd).unwrap();
        let obs = b.observe_file(&src).unwrap();
        let call_id = b.save_call("f", bd, serde_json::json!([]), serde_json::json!("ok")).unwrap();
        b.save_call_file(call_id, "src", &src, obs.digest).unwrap();

        fs::write(&src, "v2 (different length defeats any mtime coincidence)").unwrap();
        let decision = evaluate(&mut b, "f", fd, bd, std::slice::from_ref(&src)).unwrap();
        assert!(!decision.dirty_files.is_empty());
        assert!(!is_hit(&decision));
    }
}
