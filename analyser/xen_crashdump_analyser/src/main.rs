// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Post-mortem crashdump analyser for Xen.
//!
//! Runs the linear pipeline: parse both symbol tables, parse the ELF CORE
//! capture, build the memory map, decode hypervisor state, then emit the
//! hypervisor summary and one report per domain into the output directory.

mod cli_args;
mod tracing_init;

use anyhow::Context as _;
use cli_args::Options;
use corefile::CoreFile;
use dumpmem::MemoryMap;
use hostwalk::Host;
use hostwalk::OutDir;
use std::io;
use std::io::BufWriter;
use std::io::Write as _;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use symtab::SymbolTable;

// Exit codes from sysexits(3).
pub const EX_USAGE: u8 = 64;
pub const EX_SOFTWARE: u8 = 70;
pub const EX_IOERR: u8 = 74;

/// Structured log inside the output directory.
const LOG_NAME: &str = "xen-crashdump-analyser.log";

/// Set once the log sink is up; before that, fatal errors can only go to
/// stderr directly.
static LOG_ACTIVE: AtomicBool = AtomicBool::new(false);

/// A run-fatal error, classified for the exit code.
#[derive(Debug)]
enum Fatal {
    Io(anyhow::Error),
    Software(anyhow::Error),
}

impl Fatal {
    fn exit_code(&self) -> u8 {
        match self {
            Fatal::Io(_) => EX_IOERR,
            Fatal::Software(_) => EX_SOFTWARE,
        }
    }

    fn inner(&self) -> &anyhow::Error {
        match self {
            Fatal::Io(err) | Fatal::Software(err) => err,
        }
    }
}

fn main() -> ExitCode {
    let options = match cli_args::parse() {
        Ok(options) => options,
        Err(code) => return code,
    };

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            let err = fatal.inner();
            if LOG_ACTIVE.load(Ordering::Relaxed) {
                tracing::error!("{err:#}");
            } else {
                eprintln!("ERROR {err:#}");
            }
            ExitCode::from(fatal.exit_code())
        }
    }
}

fn run(options: &Options) -> Result<(), Fatal> {
    // Make the output directory if it doesn't exist.
    match std::fs::create_dir(&options.outdir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => {
            return Err(Fatal::Io(anyhow::Error::new(err).context(format!(
                "unable to create output directory {}",
                options.outdir.display()
            ))));
        }
    }
    let outdir = OutDir::new(&options.outdir)
        .context("unable to open the output directory")
        .map_err(Fatal::Io)?;

    let log_file = outdir
        .create(LOG_NAME)
        .context("unable to open the log file")
        .map_err(Fatal::Io)?;
    tracing_init::enable_tracing(log_file, options.verbosity()).map_err(Fatal::Software)?;
    LOG_ACTIVE.store(true, Ordering::Relaxed);

    tracing::info!(
        level = %tracing_init::level_for(options.verbosity()),
        "logging level"
    );
    let command_line: Vec<String> = std::env::args().collect();
    tracing::info!(command_line = %command_line.join(" "));
    tracing::info!(path = %outdir.path().display(), "output directory");

    let xen_symtab_path = resolve(&options.xen_symtab, "Xen symbol table")?;
    let xen_symtab = SymbolTable::parse(&xen_symtab_path, true)
        .context("failed to parse the Xen symbol table file")
        .map_err(Fatal::Io)?;

    let dom0_symtab_path = resolve(&options.dom0_symtab, "Dom0 symbol table")?;
    let dom0_symtab = SymbolTable::parse(&dom0_symtab_path, false)
        .context("failed to parse the Dom0 symbol table file")
        .map_err(Fatal::Io)?;

    let core_path = resolve(&options.core, "Elf CORE crash file")?;
    let core = CoreFile::open(&core_path)
        .context("failed to parse the crash file")
        .map_err(Fatal::Io)?;

    let memory = MemoryMap::new(&core_path, core.segments().to_vec())
        .context("failed to set up memory regions from the crash file")
        .map_err(Fatal::Software)?;

    let mut host = Host::setup(&core, xen_symtab, dom0_symtab)
        .context("failed to set up host structures")
        .map_err(Fatal::Software)?;
    drop(core);

    let mut xen_log = BufWriter::new(
        outdir
            .create("xen.log")
            .context("unable to open xen.log in the output directory")
            .map_err(Fatal::Io)?,
    );
    tracing::info!("opened xen.log for host information");

    host.decode_xen(&memory);
    match host.print_xen(&mut xen_log).and_then(|()| xen_log.flush()) {
        Ok(()) => {
            let domains = host.print_domains(&memory, &outdir);
            tracing::debug!(domains, "successfully printed domain reports");
        }
        Err(err) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to print xen information"
            );
        }
    }

    tracing::info!("COMPLETE");
    Ok(())
}

/// Canonicalises an input path and logs where it resolved to, so the log
/// records exactly which files the analysis consumed.
fn resolve(path: &Path, what: &str) -> Result<std::path::PathBuf, Fatal> {
    let resolved = path
        .canonicalize()
        .with_context(|| format!("failed to resolve {what} path {}", path.display()))
        .map_err(Fatal::Io)?;
    tracing::info!(path = %resolved.display(), "{what}");
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        let io = Fatal::Io(anyhow::anyhow!("x"));
        let sw = Fatal::Software(anyhow::anyhow!("y"));
        assert_eq!(io.exit_code(), EX_IOERR);
        assert_eq!(sw.exit_code(), EX_SOFTWARE);
    }
}
