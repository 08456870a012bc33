//! Thin logging glue: a `log`-backed logger configured by verbosity count,
//! plus the coloured one-line error summary the driver prints on exit.
//!
//! Grounded on the teacher's own use of `tectonic::status::TermcolorStatusBackend`
//! for its final `status.report_error(&e)` call in `main.rs`; this crate has
//! no `tectonic_errors`-shaped `StatusBackend` trait to implement, so the
//! same effect is reached directly with `env_logger` + `termcolor`.

use std::io::Write;

use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::error::Error;

/// Initialize the global `log` logger at a verbosity derived from a
/// `-v`/`--verbose` repeat count: 0 is warnings and above, 1 is `info`, 2+
/// is `debug`.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };

    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .try_init();
}

/// Print a single coloured summary line for a fatal, user-visible error,
/// the same shape as the teacher's `status.report_error(&e)` call at the
/// bottom of `main()`.
pub fn report_error(err: &Error) {
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let _ = stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true));
    let _ = write!(stderr, "error: ");
    let _ = stderr.reset();
    let _ = writeln!(stderr, "{err}");

    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  caused by: {cause}");
        source = cause.source();
    }
}
