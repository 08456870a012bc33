//! Driver glue: component G of the engine (`spec.md` §6/§7, `SPEC_FULL.md`
//! §4.G).
//!
//! [`run`] is the whole CLI entry point a binary crate needs: parse
//! arguments, build a [`Context`], hand it to a [`BuildScript`], and persist
//! the backend on the way out regardless of how `build` returned. Grounded
//! on the teacher's `main.rs` (`ToplevelArgs`/`Action`, `clap::Parser`,
//! `status.report_error(&e)` + `exit(1)`) and on `fbuild/bin/fbuild.py`'s
//! `try/except fbuild.Error/finally: database.save()` sequence, which is the
//! original this module's control flow is distilled from.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};

use crate::backend::snapshot::SnapshotBackend;
#[cfg(feature = "sql-backend")]
use crate::backend::sql::SqlBackend;
use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::executor::{ExecOutput, ExecRequest, Executor, ProcessExecutor};
use crate::logging;
use crate::scheduler::Pool;

/// Set while the DB-save step runs, so a SIGINT delivered during `close`
/// doesn't itself start a second cancellation that would race the save.
/// Grounded on `fbuild/context.py`'s `save_configuration`, which masks
/// `SIGINT` around `db.close()` for the same reason.
static CLOSING: AtomicBool = AtomicBool::new(false);

/// Everything a build script needs at runtime: its resolved options, the
/// memoization façade bound to an open backend, the executor used to run
/// external tools, and the worker pool memoized calls may fan work out
/// onto. `spec.md` §6 names `options`/`logger`/`db`/`execute` explicitly;
/// `pool` is this crate's ambient addition, since a build script has no
/// other way to reach the scheduler a build runs on.
pub struct Context {
    pub options: Options,
    pub db: Mutex<Box<dyn Backend>>,
    pub execute: Arc<dyn Executor>,
    pub pool: Pool,
}

impl Context {
    /// Run `body` around an [`crate::executor::Executor`] call, parking a
    /// helper thread on the pool for the duration so a fully-occupied pool
    /// doesn't stall. Thin convenience over `ctx.pool.interruptible`; fails
    /// with [`Error::Cancelled`] if the pool was cancelled before or during
    /// `body`.
    pub fn run_external<R>(&self, body: impl FnOnce() -> R) -> Result<R> {
        self.pool.interruptible(body)
    }

    /// Run an external tool through `self.execute`, wrapped in
    /// [`Context::run_external`] so a worker blocked on the subprocess
    /// doesn't stall a fully-occupied pool and so the call is cancelled
    /// promptly if the build is interrupted mid-flight.
    pub fn execute_command(&self, request: ExecRequest) -> Result<ExecOutput> {
        self.run_external(|| self.execute.execute(request))?
    }
}

/// Resolved CLI options, after `pre_options`/`post_options` have had their
/// say. Field names mirror the `SPEC_FULL.md` §4.G flag table.
#[derive(Clone, Debug)]
pub struct Options {
    pub jobs: usize,
    pub buildroot: PathBuf,
    pub state_file: PathBuf,
    pub force_configure: bool,
    pub verbose: u8,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            jobs: num_cpus::get(),
            buildroot: PathBuf::from("build"),
            state_file: PathBuf::from("anvil-state.db"),
            force_configure: false,
            verbose: 0,
        }
    }
}

/// The three hooks a build script may offer the driver. Only `build` is
/// mandatory; `pre_options`/`post_options` default to no-ops, mirroring
/// `spec.md` §6's "up to three hooks" build-script contract.
pub trait BuildScript {
    /// Extend the argument parser before the driver parses `std::env::args`.
    fn pre_options(&self, parser: clap::Command) -> clap::Command {
        parser
    }

    /// Adjust resolved options (e.g. from extra flags registered in
    /// `pre_options`) before the backend is opened.
    fn post_options(&self, _opts: &mut Options) -> Result<()> {
        Ok(())
    }

    /// The build itself.
    fn build(&self, ctx: &Context) -> Result<()>;
}

#[derive(Parser, Debug)]
#[command(name = "anvil", about = "A memoizing, parallel build engine")]
struct Cli {
    #[arg(short = 'j', long = "jobs")]
    jobs: Option<usize>,

    #[arg(long, default_value = "build")]
    buildroot: PathBuf,

    #[arg(long)]
    state_file: Option<PathBuf>,

    #[arg(long)]
    configure: bool,

    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the full database contents as pretty JSON.
    ConfigDump,
    /// Print the subset of the database reachable by a dotted key path.
    ConfigQuery { keys: Vec<String> },
    /// Delete the subset of the database reachable by a dotted key path.
    ConfigRemove { keys: Vec<String> },
}

/// Parse `std::env::args`, run `script` against a freshly opened backend,
/// and return the process exit code. This is the only function a binary
/// crate built on top of this engine needs to call from `main`.
pub fn run(script: &dyn BuildScript) -> i32 {
    let command = script.pre_options(Cli::command());
    let matches = command.get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(err) => {
            err.print().ok();
            return 1;
        }
    };

    logging::init(cli.verbose);

    let mut options = Options {
        jobs: cli.jobs.unwrap_or_else(num_cpus::get),
        buildroot: cli.buildroot.clone(),
        state_file: cli.state_file.clone().unwrap_or_else(|| PathBuf::from("anvil-state.db")),
        force_configure: cli.configure,
        verbose: cli.verbose,
    };

    if let Err(err) = script.post_options(&mut options) {
        logging::report_error(&err);
        return 1;
    }

    match run_with_options(script, options, cli.action) {
        Ok(()) => 0,
        Err(err) => {
            logging::report_error(&err);
            1
        }
    }
}

fn run_with_options(script: &dyn BuildScript, options: Options, action: Option<ConfigAction>) -> Result<()> {
    std::fs::create_dir_all(&options.buildroot)?;
    let state_path = options.buildroot.join(&options.state_file);

    if options.force_configure && state_path.exists() {
        std::fs::remove_file(&state_path)?;
    }

    let mut backend = open_backend(&state_path)?;
    backend.connect(&state_path)?;

    if let Some(action) = action {
        let outcome = run_config_action(backend.as_mut(), &action);
        backend.close(&state_path)?;
        return outcome;
    }

    let ctx = Context {
        pool: Pool::new(options.jobs.max(1)),
        execute: Arc::new(ProcessExecutor::new()),
        db: Mutex::new(backend),
        options,
    };

    install_sigint_handler(&ctx.pool);

    // Catch a panicking `build` so the DB-save step below still runs before
    // the panic is allowed to unwind past this function, per the same
    // finally-save contract as a returned `Err`.
    let build_result = panic::catch_unwind(AssertUnwindSafe(|| script.build(&ctx)));

    // The DB-save step runs regardless of how `build` returned, mirroring
    // `fbuild`'s `finally: database.save()`. The cancel flag is deliberately
    // not consulted here: a cancelled build still wants its completed work
    // persisted. `CLOSING` masks a SIGINT arriving during the save itself.
    let state_path = ctx.options.buildroot.join(&ctx.options.state_file);
    CLOSING.store(true, Ordering::SeqCst);
    // `build` may have panicked while holding this lock (e.g. mid-call in
    // `memoize.rs`), poisoning it; the save step must still run, so a
    // poisoned lock is recovered rather than treated as fatal here.
    let mut backend = ctx.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let save_result = backend.close(&state_path);
    drop(backend);
    CLOSING.store(false, Ordering::SeqCst);

    match build_result {
        Ok(build_result) => build_result.and(save_result),
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// Install a process-wide Ctrl-C handler that cancels `pool`'s in-flight
/// work. A second SIGINT delivered while `CLOSING` is set (i.e. during the
/// DB-save step) is swallowed rather than triggering a second cancellation.
fn install_sigint_handler(pool: &Pool) {
    let canceller = pool.canceller();
    if let Err(err) = ctrlc::set_handler(move || {
        if CLOSING.load(Ordering::SeqCst) {
            return;
        }
        canceller.cancel();
    }) {
        log::warn!("failed to install Ctrl-C handler: {err}");
    }
}

fn run_config_action(backend: &mut dyn Backend, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::ConfigDump => {
            let dump = backend.dump()?;
            println!("{}", serde_json::to_string_pretty(&dump)?);
            Ok(())
        }
        ConfigAction::ConfigQuery { keys } => {
            let dump = backend.dump()?;
            match walk(&dump, keys) {
                Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
                None => println!("null"),
            }
            Ok(())
        }
        ConfigAction::ConfigRemove { keys } => {
            let removed = backend.remove_path(keys)?;
            if !removed {
                log::warn!("no entry found at key path {:?}", keys.join("."));
            }
            Ok(())
        }
    }
}

fn walk<'a>(value: &'a serde_json::Value, keys: &[String]) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for key in keys {
        current = current.get(key)?;
    }
    Some(current)
}

/// Choose the backend engine by state-file extension: `.sqldb` selects the
/// embedded-SQL engine (when built with the `sql-backend` feature),
/// anything else (including the default `.db`) selects the in-memory
/// snapshot engine. `spec.md` §6 permits either filename convention or a
/// leading magic; this crate uses the filename alone since the extension is
/// already chosen by the caller and a magic-byte probe adds nothing a fresh
/// `--state-file` flag doesn't already decide.
fn open_backend(path: &Path) -> Result<Box<dyn Backend>> {
    let is_sql = path.extension().and_then(|e| e.to_str()) == Some("sqldb");

    if is_sql {
        #[cfg(feature = "sql-backend")]
        {
            return Ok(Box::new(SqlBackend::new()));
        }
        #[cfg(not(feature = "sql-backend"))]
        {
            return Err(Error::ConfigFailed(format!(
                "state file `{}` asks for the SQL backend, but this binary was built without the `sql-backend` feature",
                path.display()
            )));
        }
    }

    Ok(Box::new(SnapshotBackend::new()))
}
