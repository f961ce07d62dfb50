#![forbid(unsafe_code)]

mod archive;
mod boot;
mod cachedir;
mod error;
mod installer;
mod interpreter;
mod output;
mod pex_info;
mod prelude;
mod tree;
mod util;
mod venv;
mod vocab;

#[cfg(test)]
mod test_util;

use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::cachedir::CacheRoot;
use crate::output::OutputArgs;

/// Native bootstrapper for self-contained Python application archives.
#[derive(Parser)]
#[command(name = "czex", version)]
struct Czex {
    #[command(flatten)]
    output: OutputArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Materialize (or reuse) the archive's venv, then exec its python.
    Run {
        /// The python to boot the archive with.
        python: PathBuf,
        /// The archive to run.
        archive: PathBuf,
        /// Arguments passed through to the application.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },
}

fn main() {
    let czex = Czex::parse();
    output::init(&czex.output);

    let result = match czex.command {
        Command::Run {
            python,
            archive,
            args,
        } => {
            let cache = CacheRoot::from_env();
            boot::boot(&cache, &python, &archive, &args)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!("{:#}", err);
            std::process::exit(1);
        }
    }
}
