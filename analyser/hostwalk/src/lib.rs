// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Walks the crashed hypervisor's structures out of captured memory.
//!
//! The [`Host`] is built from the parsed core file and the two symbol
//! tables, then drives the per-component decoders: console ring, per-PCPU
//! state, and the domain list with each domain's vCPUs. Failures below the
//! host level are caught at the entity they belong to — a corrupt domain or
//! vCPU degrades its own report, never the run.

#![forbid(unsafe_code)]

pub mod console;
pub mod domain;
pub mod host;
pub mod report;
pub mod unwind;

pub use host::Host;
pub use report::OutDir;

use thiserror::Error;

/// Bound on the domain-list walk, to defeat cycles through corrupt memory.
pub const MAX_DOMAINS: usize = 32768;

/// Bound on the per-domain vCPU table, for the same reason.
pub const MAX_VCPUS: u32 = 4096;

/// Frame-pointer unwind depth cap.
pub const MAX_STACK_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] corefile::Error),
    #[error(transparent)]
    Memory(#[from] dumpmem::Error),
    #[error("required symbol {name} is missing from the hypervisor symbol table")]
    MissingSymbol { name: &'static str },
    #[error("vcpu structure at {va:#x} has unrecognised guest mode {mode}")]
    GuestMode { va: u64, mode: u8 },
    #[error("domain at {va:#x} claims {count} vcpus, above the {MAX_VCPUS} cap")]
    VcpuCount { va: u64, count: u32 },
    #[error("console ring size {size:#x} is implausible")]
    ConsoleRingSize { size: u64 },
}
