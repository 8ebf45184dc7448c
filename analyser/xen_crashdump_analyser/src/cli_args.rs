// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CLI argument parsing.
//!
//! This module only marshals raw CLI strings into typed values; files are
//! opened by the pipeline so every failure flows through one error path.

use clap::ArgAction;
use clap::CommandFactory;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

pub const VERSION: &str = "2.1.0";

/// Analyse a Xen crash in the kdump environment.
#[derive(Debug, Parser)]
#[clap(name = "xen-crashdump-analyser", disable_version_flag = true)]
pub struct Options {
    /// Core crash file
    #[clap(short = 'c', long, value_name = "PATH", default_value = "/proc/vmcore")]
    pub core: PathBuf,

    /// Directory for output files
    #[clap(short = 'o', long, value_name = "PATH")]
    pub outdir: PathBuf,

    /// Xen symbol table file
    #[clap(short = 'x', long, value_name = "PATH")]
    pub xen_symtab: PathBuf,

    /// Dom0 symbol table file
    #[clap(short = 'd', long, value_name = "PATH")]
    pub dom0_symtab: PathBuf,

    /// Less logging
    #[clap(short = 'q', long)]
    pub quiet: bool,

    /// More logging, accepted multiple times for extra debug logging
    #[clap(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Display version and exit
    #[clap(long)]
    pub version: bool,
}

impl Options {
    /// Effective verbosity: 0 errors only, 1 info (the default), 2 debug,
    /// 3 debug with reference detail. `--verbose` saturates at 3.
    pub fn verbosity(&self) -> u8 {
        (1u8.saturating_sub(self.quiet as u8) + self.verbose).min(3)
    }
}

/// Parses the command line. `Err` carries the exit code the process should
/// finish with: usage problems report [`crate::EX_USAGE`], while `--help`
/// with no arguments at all prints usage and fails the same way.
pub fn parse() -> Result<Options, ExitCode> {
    if std::env::args_os().len() < 2 {
        let mut cmd = Options::command();
        let _ = cmd.print_help();
        return Err(ExitCode::from(crate::EX_USAGE));
    }

    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(err) => {
            let code = if err.kind() == clap::error::ErrorKind::DisplayHelp {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(crate::EX_USAGE)
            };
            let _ = err.print();
            return Err(code);
        }
    };

    if options.version {
        println!("Xen Crashdump Analyser, version {VERSION}");
        return Err(ExitCode::SUCCESS);
    }
    Ok(options)
}
