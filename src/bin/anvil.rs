//! Thin CLI binary exercising the driver glue. This crate has no notion of
//! what is actually being built (see `src/lib.rs`), so the shipped build
//! script is a no-op: a real consumer of this crate links their own
//! `BuildScript` impl against `anvil::driver::run` the same way a program
//! built on the teacher would supply its own `pass1`/`config` modules
//! against `tectonic`'s driver plumbing.

use anvil::driver::{BuildScript, Context};
use anvil::error::Result;

struct NullBuildScript;

impl BuildScript for NullBuildScript {
    fn build(&self, ctx: &Context) -> Result<()> {
        log::info!("anvil: no build script configured ({} worker(s) available)", ctx.options.jobs);
        Ok(())
    }
}

fn main() {
    std::process::exit(anvil::driver::run(&NullBuildScript));
}
