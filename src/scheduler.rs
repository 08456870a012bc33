//! The worker-pool scheduler: component E of the engine (`spec.md` §4.E).
//!
//! The teacher ships two thread-pool flavors of its own, `texworker.rs`
//! (built on the `threadpool` crate) and `tex_pass.rs` (built on
//! `tokio_task_pool`). Both are **dispatch-and-join** pools: a caller
//! submits work and blocks until it's done, with no provision for a
//! blocked caller to do anything useful in the meantime. That is exactly
//! the failure mode `spec.md` §9 warns about by name — *"a naive `join`
//! implementation will deadlock"* — because a pool at full occupancy has
//! no thread left to run a worker's own nested `map` call.
//!
//! This module drops `threadpool` (see `DESIGN.md`) in favor of a
//! hand-rolled fixed-size pool over a shared job queue, where a thread
//! waiting on results it submitted itself helps drain that same queue
//! instead of blocking. Any thread — a pool worker mid-thunk, or the main
//! thread calling in from outside — can call [`Pool::map`] and becomes,
//! for the duration of that call, an additional consumer of the shared
//! queue. This is the "work-stealing or helper-thread semantics" `spec.md`
//! §4.E permits as an implementation choice.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

const HELPER_POLL: Duration = Duration::from_millis(10);

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    queue_cv: Condvar,
    cancelled: AtomicBool,
    shutdown: AtomicBool,
}

fn drain_one(shared: &Shared) -> bool {
    let job = {
        let mut q = shared.queue.lock().expect("scheduler queue mutex poisoned");
        q.pop_front()
    };
    match job {
        Some(job) => {
            job();
            true
        }
        None => false,
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        if drain_one(&shared) {
            continue;
        }
        let q = shared.queue.lock().expect("scheduler queue mutex poisoned");
        if q.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
            let _ = shared.queue_cv.wait_timeout(q, HELPER_POLL);
        }
    }
}

/// A fixed-size pool of OS worker threads sharing one job queue.
pub struct Pool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    pub fn new(n_workers: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            cancelled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        let workers = (0..n_workers.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(shared))
            })
            .collect();

        Pool { shared, workers }
    }

    fn enqueue(&self, job: Job) {
        self.shared.queue.lock().expect("scheduler queue mutex poisoned").push_back(job);
        self.shared.queue_cv.notify_all();
    }

    /// Apply `f` to every item, in parallel, returning results in input
    /// order. Safe to call re-entrantly: if the calling thread is itself a
    /// pool worker running a thunk submitted by an outer `map`, it helps
    /// drain the shared queue (possibly running unrelated jobs) while
    /// waiting for its own children, rather than blocking the thread.
    ///
    /// On failure, the first failure by input position is returned once
    /// every thunk has either completed or been short-circuited; thunks
    /// not yet started when a failure is observed are skipped rather than
    /// run, and already-running thunks are allowed to finish with their
    /// results discarded.
    pub fn map<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Result<R> + Sync + Send + 'static,
    {
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let n = items.len();
        let state = Arc::new(MapState {
            results: Mutex::new((0..n).map(|_| None).collect()),
            remaining: Mutex::new(n),
            aborted: AtomicBool::new(false),
            cv: Condvar::new(),
        });
        let f = Arc::new(f);

        for (idx, item) in items.into_iter().enumerate() {
            let state = Arc::clone(&state);
            let f = Arc::clone(&f);
            let shared = Arc::clone(&self.shared);
            self.enqueue(Box::new(move || run_map_job(&shared, &state, idx, item, f.as_ref())));
        }

        self.wait_for(&state);

        let mut results = state.results.lock().expect("scheduler results mutex poisoned");
        if let Some(idx) = results.iter().position(|r| matches!(r, Some(Err(_)))) {
            return Err(results[idx].take().unwrap().unwrap_err());
        }
        Ok(results.iter_mut().map(|r| r.take().unwrap().unwrap()).collect())
    }

    /// Like [`Pool::map`], but `f(item[i])` is only enqueued once `f` has
    /// completed for every index `deps_of(item[i])` names. The dependency
    /// graph is topologically checked up front; a cycle is reported as
    /// [`Error::DependencyCycle`] before any work runs.
    pub fn map_with_dependencies<T, R, F, D>(&self, items: Vec<T>, deps_of: D, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Result<R> + Sync + Send + 'static,
        D: Fn(&T) -> Vec<usize>,
    {
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let n = items.len();
        let deps: Vec<Vec<usize>> = items.iter().map(&deps_of).collect();

        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, ds) in deps.iter().enumerate() {
            for &dep in ds {
                if dep >= n {
                    continue;
                }
                in_degree[i] += 1;
                dependents[dep].push(i);
            }
        }

        assert_acyclic(&in_degree, &dependents)?;

        let state = Arc::new(DepMapState {
            items: Mutex::new(items.into_iter().map(Some).collect()),
            results: Mutex::new((0..n).map(|_| None).collect()),
            in_degree: Mutex::new(in_degree.clone()),
            dependents,
            remaining: Mutex::new(n),
            aborted: AtomicBool::new(false),
            cv: Condvar::new(),
        });
        let f = Arc::new(f);

        for i in 0..n {
            if in_degree[i] == 0 {
                schedule_dep_job(Arc::clone(&self.shared), Arc::clone(&state), Arc::clone(&f), i);
            }
        }

        self.wait_for_dep(&state);

        let mut results = state.results.lock().expect("scheduler results mutex poisoned");
        if let Some(idx) = results.iter().position(|r| matches!(r, Some(Err(_)))) {
            return Err(results[idx].take().unwrap().unwrap_err());
        }
        Ok(results.iter_mut().map(|r| r.take().unwrap().unwrap()).collect())
    }

    fn wait_for<R>(&self, state: &Arc<MapState<R>>) {
        loop {
            {
                let rem = state.remaining.lock().expect("scheduler remaining mutex poisoned");
                if *rem == 0 {
                    return;
                }
            }
            if self.shared.cancelled.load(Ordering::SeqCst) {
                state.aborted.store(true, Ordering::SeqCst);
            }
            if !drain_one(&self.shared) {
                let rem = state.remaining.lock().expect("scheduler remaining mutex poisoned");
                if *rem == 0 {
                    return;
                }
                let _ = state.cv.wait_timeout(rem, HELPER_POLL);
            }
        }
    }

    fn wait_for_dep<T, R>(&self, state: &Arc<DepMapState<T, R>>) {
        loop {
            {
                let rem = state.remaining.lock().expect("scheduler remaining mutex poisoned");
                if *rem == 0 {
                    return;
                }
            }
            if self.shared.cancelled.load(Ordering::SeqCst) {
                state.aborted.store(true, Ordering::SeqCst);
            }
            if !drain_one(&self.shared) {
                let rem = state.remaining.lock().expect("scheduler remaining mutex poisoned");
                if *rem == 0 {
                    return;
                }
                let _ = state.cv.wait_timeout(rem, HELPER_POLL);
            }
        }
    }

    /// Mark the current thunk as blocked on external I/O (used around
    /// [`crate::executor::Executor`] calls): for the duration of `body`, a
    /// temporary helper thread drains the shared queue on this thread's
    /// behalf, so a fully-occupied pool doesn't stall just because one
    /// worker is parked in a blocking syscall. Grounded on
    /// `fbuild/context.py`'s `scheduler.interruptible()` used around
    /// `Popen.communicate()`.
    ///
    /// Checks the cancel flag before running `body` and again once it
    /// returns, so every `Executor` call site routed through this method
    /// observes a cancellation without needing its own check (`spec.md`
    /// §5: "every worker checks the flag ... at every Executor call").
    pub fn interruptible<R>(&self, body: impl FnOnce() -> R) -> Result<R> {
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let shared = Arc::clone(&self.shared);
        let stop = Arc::new(AtomicBool::new(false));
        let helper_stop = Arc::clone(&stop);
        let helper = thread::spawn(move || {
            while !helper_stop.load(Ordering::Relaxed) {
                if !drain_one(&shared) {
                    thread::sleep(HELPER_POLL);
                }
            }
        });

        let result = body();

        stop.store(true, Ordering::Relaxed);
        let _ = helper.join();

        if self.shared.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(result)
    }

    /// Set the process-wide cancel flag. Every worker observes it at the
    /// next job boundary and every in-flight [`Pool::map`]/
    /// [`Pool::map_with_dependencies`] call aborts not-yet-started work
    /// with [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.queue_cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// A cheap, cloneable, `'static` handle that can call [`Pool::cancel`]
    /// from outside the pool's own lifetime, e.g. from a signal handler.
    pub fn canceller(&self) -> Canceller {
        Canceller(Arc::clone(&self.shared))
    }
}

/// A `'static` handle onto a [`Pool`]'s cancel flag, independent of the
/// pool's own borrow. Obtained via [`Pool::canceller`].
#[derive(Clone)]
pub struct Canceller(Arc<Shared>);

impl Canceller {
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.queue_cv.notify_all();
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.queue_cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

struct MapState<R> {
    results: Mutex<Vec<Option<Result<R>>>>,
    remaining: Mutex<usize>,
    aborted: AtomicBool,
    cv: Condvar,
}

fn run_map_job<T, R, F>(shared: &Arc<Shared>, state: &Arc<MapState<R>>, idx: usize, item: T, f: &F)
where
    F: Fn(T) -> Result<R>,
{
    let out = if shared.cancelled.load(Ordering::SeqCst) || state.aborted.load(Ordering::SeqCst) {
        Err(Error::Cancelled)
    } else {
        f(item)
    };
    if out.is_err() {
        state.aborted.store(true, Ordering::SeqCst);
    }
    state.results.lock().expect("scheduler results mutex poisoned")[idx] = Some(out);

    let mut rem = state.remaining.lock().expect("scheduler remaining mutex poisoned");
    *rem -= 1;
    if *rem == 0 {
        state.cv.notify_all();
    }
}

struct DepMapState<T, R> {
    items: Mutex<Vec<Option<T>>>,
    results: Mutex<Vec<Option<Result<R>>>>,
    in_degree: Mutex<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    remaining: Mutex<usize>,
    aborted: AtomicBool,
    cv: Condvar,
}

fn schedule_dep_job<T, R, F>(shared: Arc<Shared>, state: Arc<DepMapState<T, R>>, f: Arc<F>, idx: usize)
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Result<R> + Sync + Send + 'static,
{
    let job: Job = Box::new(move || {
        let item = state.items.lock().expect("scheduler items mutex poisoned")[idx]
            .take()
            .expect("dependency-scheduled item already consumed");

        let out = if shared.cancelled.load(Ordering::SeqCst) || state.aborted.load(Ordering::SeqCst) {
            Err(Error::Cancelled)
        } else {
            f(item)
        };
        if out.is_err() {
            state.aborted.store(true, Ordering::SeqCst);
        }
        state.results.lock().expect("scheduler results mutex poisoned")[idx] = Some(out);

        let mut newly_ready = Vec::new();
        {
            let mut in_degree = state.in_degree.lock().expect("scheduler in-degree mutex poisoned");
            for &dependent in &state.dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    newly_ready.push(dependent);
                }
            }
        }
        for dependent in newly_ready {
            schedule_dep_job(Arc::clone(&shared), Arc::clone(&state), Arc::clone(&f), dependent);
        }

        let mut rem = state.remaining.lock().expect("scheduler remaining mutex poisoned");
        *rem -= 1;
        if *rem == 0 {
            state.cv.notify_all();
        }
    });

    shared.queue.lock().expect("scheduler queue mutex poisoned").push_back(job);
    shared.queue_cv.notify_all();
}

fn assert_acyclic(in_degree: &[usize], dependents: &[Vec<usize>]) -> Result<()> {
    let n = in_degree.len();
    let mut indeg = in_degree.to_vec();
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| indeg[i] == 0).collect();
    let mut visited = 0usize;
    while let Some(i) = queue.pop_front() {
        visited += 1;
        for &d in &dependents[i] {
            indeg[d] -= 1;
            if indeg[d] == 0 {
                queue.push_back(d);
            }
        }
    }
    if visited == n {
        Ok(())
    } else {
        Err(Error::DependencyCycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn map_preserves_input_order_regardless_of_completion_order() {
        let pool = Pool::new(4);
        let items: Vec<i32> = (0..20).collect();
        let results = pool
            .map(items, |x| {
                if x % 2 == 0 {
                    thread::sleep(Duration::from_millis(2));
                }
                Ok(x * 2)
            })
            .unwrap();
        let expected: Vec<i32> = (0..20).map(|x| x * 2).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn nested_map_does_not_deadlock_a_fully_occupied_pool() {
        let pool = Arc::new(Pool::new(2));
        let outer_pool = Arc::clone(&pool);
        let result = pool.map(vec![0, 1], move |_| {
            outer_pool.map(vec![0, 1, 2], |x| Ok::<i32, Error>(x + 1))
        });
        assert_eq!(result.unwrap(), vec![vec![1, 2, 3], vec![1, 2, 3]]);
    }

    #[test]
    fn a_failing_thunk_surfaces_as_the_map_result() {
        let pool = Pool::new(2);
        let result: Result<Vec<i32>> = pool.map(vec![1, 2, 3], |x| {
            if x == 2 {
                Err(Error::BuildScriptError("boom".to_string()))
            } else {
                Ok(x)
            }
        });
        assert!(result.is_err());
    }

    #[test]
    fn map_with_dependencies_runs_children_after_parents() {
        let pool = Pool::new(4);
        let order = Arc::new(Mutex::new(Vec::new()));
        // item 0 has no deps; item 1 depends on 0; item 2 depends on 1.
        let items = vec![0usize, 1, 2];
        let deps = |x: &usize| match x {
            1 => vec![0],
            2 => vec![1],
            _ => vec![],
        };
        let order_cl = Arc::clone(&order);
        pool.map_with_dependencies(items, deps, move |x| {
            order_cl.lock().unwrap().push(x);
            Ok::<usize, Error>(x)
        })
        .unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn map_with_dependencies_detects_a_cycle() {
        let pool = Pool::new(2);
        let items = vec![0usize, 1];
        let deps = |x: &usize| match x {
            0 => vec![1],
            1 => vec![0],
            _ => vec![],
        };
        let result = pool.map_with_dependencies(items, deps, |x| Ok::<usize, Error>(x));
        assert!(matches!(result, Err(Error::DependencyCycle)));
    }

    #[test]
    fn interruptible_is_cancelled_before_running_body() {
        let pool = Pool::new(1);
        pool.cancel();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_cl = Arc::clone(&ran);
        let result = pool.interruptible(move || {
            ran_cl.fetch_add(1, Ordering::SeqCst);
        });
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn interruptible_reports_cancellation_that_happens_mid_body() {
        let pool = Arc::new(Pool::new(1));
        let pool_cl = Arc::clone(&pool);
        let result = pool.interruptible(move || {
            pool_cl.cancel();
        });
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn interruptible_lets_an_uncancelled_body_run_to_completion() {
        let pool = Pool::new(1);
        let result = pool.interruptible(|| 42);
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn cancel_propagates_to_not_yet_started_work() {
        let pool = Pool::new(1);
        let started = Arc::new(AtomicUsize::new(0));
        pool.cancel();
        let started_cl = Arc::clone(&started);
        let result: Result<Vec<()>> = pool.map(vec![0, 1, 2], move |_| {
            started_cl.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }
}
