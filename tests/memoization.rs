//! End-to-end coverage of `spec.md` §8 scenarios S1-S5: memoized calls
//! driven through `anvil::memoize::CallBuilder` against a real
//! `anvil::driver::Context`, with a file on disk standing in for a
//! declared or external source.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anvil::backend::snapshot::SnapshotBackend;
use anvil::backend::Backend;
use anvil::digest::Digest;
use anvil::driver::{Context, Options};
use anvil::executor::ProcessExecutor;
use anvil::memoize::CallBuilder;
use anvil::scheduler::Pool;
use tempfile::tempdir;

fn test_context(jobs: usize) -> Context {
    Context {
        options: Options { jobs, ..Options::default() },
        db: Mutex::new(Box::new(SnapshotBackend::new()) as Box<dyn Backend>),
        execute: Arc::new(ProcessExecutor::new()),
        pool: Pool::new(jobs),
    }
}

fn compile(ctx: &Context, invocations: &AtomicUsize, src: &std::path::Path) -> String {
    CallBuilder::new(ctx, "compile", Digest::of_bytes(b"compile v1"))
        .src(src)
        .run(|| {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok("a.o".to_string())
        })
        .unwrap()
}

#[test]
fn s1_unchanged_source_is_a_cache_hit_on_the_second_call() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("a.c");
    fs::write(&src, "int main() {}").unwrap();

    let ctx = test_context(1);
    let invocations = AtomicUsize::new(0);

    assert_eq!(compile(&ctx, &invocations, &src), "a.o");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    assert_eq!(compile(&ctx, &invocations, &src), "a.o");
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "second call on an unchanged source must not re-run the body");
}

#[test]
fn s2_changed_source_after_the_trust_window_invokes_the_body_again() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("a.c");
    fs::write(&src, "int main() {}").unwrap();

    let ctx = test_context(1);
    let invocations = AtomicUsize::new(0);
    compile(&ctx, &invocations, &src);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    std::thread::sleep(Duration::from_millis(1100));
    fs::write(&src, "int main() { return 1; }").unwrap();

    compile(&ctx, &invocations, &src);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[test]
fn s3_two_independent_calls_run_concurrently_on_a_pool_of_two() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.c");
    let b = dir.path().join("b.c");
    fs::write(&a, "a").unwrap();
    fs::write(&b, "b").unwrap();

    let ctx = Arc::new(test_context(2));
    let started = std::time::Instant::now();

    let results = ctx
        .pool
        .map(vec![a, b], {
            let ctx = Arc::clone(&ctx);
            move |src| {
                CallBuilder::new(&ctx, "compile", Digest::of_bytes(b"compile v1")).src(&src).run(|| {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(src.to_string_lossy().to_string())
                })
            }
        })
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(started.elapsed() < Duration::from_millis(550), "two 300ms jobs on a 2-worker pool should overlap");
}

#[test]
fn s4_a_mutated_external_dependency_invalidates_a_call_with_identical_arguments() {
    let dir = tempdir().unwrap();
    let header = dir.path().join("h.h");
    fs::write(&header, "#define X 1").unwrap();

    let ctx = test_context(1);
    let invocations = AtomicUsize::new(0);

    let run_once = |ctx: &Context, invocations: &AtomicUsize| {
        CallBuilder::new(ctx, "compile_with_header", Digest::of_bytes(b"v1"))
            .arg("unit.c")
            .run_with_deps(|call| {
                invocations.fetch_add(1, Ordering::SeqCst);
                call.add_external_dependencies([&header], std::iter::empty::<&std::path::Path>());
                Ok("unit.o".to_string())
            })
            .unwrap()
    };

    run_once(&ctx, &invocations);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    run_once(&ctx, &invocations);
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "unchanged header should still be a hit");

    std::thread::sleep(Duration::from_millis(1100));
    fs::write(&header, "#define X 2").unwrap();

    run_once(&ctx, &invocations);
    assert_eq!(invocations.load(Ordering::SeqCst), 2, "a mutated external dependency must force a miss");
}

#[test]
fn s5_a_changed_function_digest_invalidates_every_prior_call_in_one_save() {
    let ctx = test_context(1);

    let run_with_digest = |digest: Digest, arg: &str| {
        CallBuilder::new(&ctx, "compile", digest).arg(arg).run(|| Ok(format!("built:{arg}"))).unwrap()
    };

    run_with_digest(Digest::of_bytes(b"v1"), "x");
    run_with_digest(Digest::of_bytes(b"v1"), "y");

    {
        let db = ctx.db.lock().unwrap();
        let dump = db.dump().unwrap();
        assert_eq!(dump.get("compile").unwrap().as_object().unwrap().len(), 2);
    }

    // A new function digest invalidates every previously recorded call for
    // this name as soon as the next invocation observes it.
    run_with_digest(Digest::of_bytes(b"v2"), "x");

    let db = ctx.db.lock().unwrap();
    let dump = db.dump().unwrap();
    assert_eq!(dump.get("compile").unwrap().as_object().unwrap().len(), 1, "the v1 calls must be gone after a digest change");
}
