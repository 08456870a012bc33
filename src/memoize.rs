//! The memoization façade: component D of the engine (`spec.md` §4.D).
//!
//! Python's `fbuild.db.cache`/`fbuild.db.cachemethod` decorators infer a
//! parameter's role (plain value, source path, destination path) from a
//! `fbuild.db.SRC`/`fbuild.db.DST` type annotation and bind the call's
//! signature reflectively. Rust has neither decorators nor runtime
//! signature reflection, so [`CallBuilder`] makes the same declaration
//! explicit at the call site: the implementer pushes each argument through
//! `.arg()`, `.src()`, `.dst()`, `.srcs()`, or `.dsts()` in the order the
//! original function would have bound them, and that push order *is* the
//! canonicalization fbuild performs by signature-binding (`spec.md` §4.D
//! step 1 — positional/named/default-filled collapse to one key, here by
//! construction rather than by reflection).
//!
//! `pure-memoize` (`fbuild.db.caches`) and `method-memoize`
//! (`fbuild.db.cachemethod`) become two entry points on the same builder,
//! [`CallBuilder::run`] and [`CallBuilder::run_with_deps`], rather than two
//! decorators, since the builder already stands in for the decorator
//! itself. Grounded on `fbuild/db/backend.py`'s `Backend.prepare` (the
//! actual binder this module drives) and
//! `fbuild/builders/c/__init__.py`'s `add_external_dependencies_to_call`.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::Backend;
use crate::digest::{digest_bytes, Digest};
use crate::dirtiness::{self, is_hit};
use crate::driver::Context;
use crate::error::Result;

/// The role an argument plays in a call's canonical signature: whether it
/// participates only in the bound-argument digest (`Value`), or is also a
/// filesystem path the dirtiness detector must track (`Source`,
/// `Destination`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Value,
    Source,
    Destination,
}

/// Accumulates one pending invocation's canonical argument list and
/// declared source/destination paths, then runs it through the dirtiness
/// detector and (on a miss) the caller's body.
pub struct CallBuilder<'a> {
    ctx: &'a Context,
    name: &'static str,
    function_digest: Digest,
    bound: Vec<(Role, serde_json::Value)>,
    declared_srcs: Vec<PathBuf>,
    declared_dsts: Vec<PathBuf>,
}

impl<'a> CallBuilder<'a> {
    pub fn new(ctx: &'a Context, name: &'static str, function_digest: Digest) -> Self {
        CallBuilder {
            ctx,
            name,
            function_digest,
            bound: Vec::new(),
            declared_srcs: Vec::new(),
            declared_dsts: Vec::new(),
        }
    }

    /// Bind a plain (non-path) argument, in declared parameter order.
    pub fn arg(mut self, value: impl Serialize) -> Self {
        self.bound
            .push((Role::Value, serde_json::to_value(value).unwrap_or(serde_json::Value::Null)));
        self
    }

    /// Bind a single declared source path.
    pub fn src(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        self.bound.push((Role::Source, serde_json::json!(path.to_string_lossy())));
        self.declared_srcs.push(path);
        self
    }

    /// Bind a single declared destination path.
    pub fn dst(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        self.bound.push((Role::Destination, serde_json::json!(path.to_string_lossy())));
        self.declared_dsts.push(path);
        self
    }

    /// Bind an ordered sequence of declared source paths.
    pub fn srcs(mut self, paths: impl IntoIterator<Item = impl AsRef<Path>>) -> Self {
        for path in paths {
            self = self.src(path);
        }
        self
    }

    /// Bind an ordered sequence of declared destination paths.
    pub fn dsts(mut self, paths: impl IntoIterator<Item = impl AsRef<Path>>) -> Self {
        for path in paths {
            self = self.dst(path);
        }
        self
    }

    fn bound_digest(&self) -> Result<(Digest, serde_json::Value)> {
        let repr = serde_json::Value::Array(self.bound.iter().map(|(_, v)| v.clone()).collect());
        let bytes = serde_json::to_vec(&repr)?;
        Ok((digest_bytes(&bytes), repr))
    }

    /// Run as a pure-memoized call: the body may not declare external
    /// dependencies. Equivalent to `fbuild.db.caches`.
    pub fn run<R, F>(self, body: F) -> Result<R>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<R>,
    {
        self.run_with_deps(|_call| body())
    }

    /// Run as a method-memoized call: the body may declare external
    /// dependencies discovered during execution via
    /// [`Call::add_external_dependencies`]. Equivalent to
    /// `fbuild.db.cachemethod`.
    pub fn run_with_deps<R, F>(self, body: F) -> Result<R>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce(&mut Call) -> Result<R>,
    {
        let (bound_digest, bound_repr) = self.bound_digest()?;
        let mut db = self.ctx.db.lock().expect("backend mutex poisoned");
        let backend: &mut dyn Backend = &mut db;

        let decision = dirtiness::evaluate(backend, self.name, self.function_digest, bound_digest, &self.declared_srcs)?;

        if decision.function_dirty {
            // `save_function` cascades internally: it deletes every call,
            // call-file, and external-deps record for `self.name` as part
            // of recording the new digest.
            backend.save_function(self.name, self.function_digest)?;
        }

        if is_hit(&decision) {
            let result = decision.previous_result.expect("hit implies a previous result");
            return Ok(serde_json::from_value(result)?);
        }

        drop(db);

        let mut call = Call { extra_srcs: Vec::new(), extra_dsts: Vec::new() };
        let result = body(&mut call)?;

        let mut db = self.ctx.db.lock().expect("backend mutex poisoned");
        let backend: &mut dyn Backend = &mut db;

        let result_json = serde_json::to_value(&result)?;
        let call_id = backend.save_call(self.name, bound_digest, bound_repr, result_json)?;

        for path in &self.declared_srcs {
            let observation = backend.observe_file(path)?;
            backend.save_call_file(call_id, "src", path, observation.digest)?;
        }
        for path in &self.declared_dsts {
            let observation = backend.observe_file(path)?;
            backend.save_call_file(call_id, "dst", path, observation.digest)?;
        }

        if !call.extra_srcs.is_empty() || !call.extra_dsts.is_empty() {
            let mut srcs = Vec::with_capacity(call.extra_srcs.len());
            for path in &call.extra_srcs {
                srcs.push((path.clone(), backend.observe_file(path)?.digest));
            }
            let mut dsts = Vec::with_capacity(call.extra_dsts.len());
            for path in &call.extra_dsts {
                dsts.push((path.clone(), backend.observe_file(path)?.digest));
            }
            backend.save_external_files(call_id, &srcs, &dsts)?;
        }

        Ok(result)
    }
}

/// Handle passed into a `method-memoize` body, for declaring dependencies
/// discovered mid-execution rather than present in the argument list (e.g.
/// headers found by scanning a translation unit).
pub struct Call {
    extra_srcs: Vec<PathBuf>,
    extra_dsts: Vec<PathBuf>,
}

impl Call {
    /// Record additional source/destination paths discovered during this
    /// call's execution. May be called more than once; later calls append.
    /// Grounded on `fbuild.db.add_external_dependencies_to_call`.
    pub fn add_external_dependencies(
        &mut self,
        srcs: impl IntoIterator<Item = impl AsRef<Path>>,
        dsts: impl IntoIterator<Item = impl AsRef<Path>>,
    ) {
        self.extra_srcs.extend(srcs.into_iter().map(|p| p.as_ref().to_path_buf()));
        self.extra_dsts.extend(dsts.into_iter().map(|p| p.as_ref().to_path_buf()));
    }
}
