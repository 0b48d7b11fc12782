// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Command-line entry point: resolves `LOOP_PACKAGES_PATH`, constructs a
//! [`Vm`], loads and runs the requested entry module, and maps any
//! resulting [`VmError`] onto the process exit code (§7).

mod filesystem;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use loop_vm::{VmConfig, VmError};
use tracing_subscriber::EnvFilter;

use filesystem::StdFileSystem;

/// Run a Loop bytecode program.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Entry module path.
    path: Option<String>,

    /// Run the collector on every allocation instead of pacing by size.
    #[arg(long)]
    stress_gc: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // The original's `argc != 2` check maps a wrong argument count onto
    // `WrongArgumentsCount`'s own exit code (§6) rather than clap's usage-error
    // exit behavior, so arity is validated here instead of trusted to
    // `Args::parse`.
    let args = match Args::try_parse() {
        Ok(args) if args.path.is_some() => args,
        _ => {
            let err = VmError::WrongArgumentsCount { expected: 1, got: 0 };
            eprintln!("error: {err}");
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            return ExitCode::from(err.exit_code() as u8);
        }
    };
    let path = args.path.expect("validated above");

    let packages_path = match std::env::var("LOOP_PACKAGES_PATH") {
        Ok(path) => PathBuf::from(path),
        Err(_) => {
            let err = VmError::IOError {
                message: "LOOP_PACKAGES_PATH environment variable is not set".to_string(),
            };
            eprintln!("error: {err}");
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    let config = VmConfig::new(packages_path).with_stress_gc(args.stress_gc);
    let mut vm = loop_vm::Vm::new(config);
    let fs = StdFileSystem;

    match vm.run_file(&fs, &path) {
        Ok(_) => ExitCode::SUCCESS,
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Err(e) => ExitCode::from(e.exit_code() as u8),
    }
}
