// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The host: everything decoded at hypervisor scope.

use crate::console;
use crate::domain;
use crate::report;
use crate::report::OutDir;
use crate::Error;
use crate::MAX_DOMAINS;
use corefile::CoreArch;
use corefile::CoreFile;
use dumpmem::MemoryMap;
use std::collections::HashSet;
use std::io;
use std::io::Write;
use symtab::SymbolTable;
use x86defs::regs::CrashXenRegs;
use x86defs::regs::PcpuRegisters;
use xendefs::layout;
use xendefs::layout::XenLayout;
use xendefs::XenCrashInfo;
use xendefs::XenVersion;
use zerocopy::FromBytes;

/// Per-architecture register state attached to a PCPU. The variant is
/// matched exhaustively wherever registers are interpreted, so adding an
/// architecture extends every seam at compile time.
#[derive(Debug, Clone)]
pub enum RegisterFrame {
    X86_64(PcpuRegisters),
}

/// One physical CPU that was online at crash time.
#[derive(Debug, Clone)]
pub struct Pcpu {
    pub index: u32,
    pub regs: RegisterFrame,
    /// Virtual address of the vCPU the PCPU was running, once decoded.
    pub current_vcpu: Option<u64>,
    /// Whether that vCPU is the PCPU's idle vCPU.
    pub running_idle: bool,
}

/// Hypervisor symbol addresses the walker anchors on. Only `domain_list`
/// is load-bearing; the rest degrade individual reports when absent.
#[derive(Debug, Default, Clone)]
pub struct HostSymbols {
    pub domain_list: u64,
    pub idle_vcpu: Option<u64>,
    pub per_cpu_offset: Option<u64>,
    pub curr_vcpu: Option<u64>,
    pub conring: Option<u64>,
    pub conring_size: Option<u64>,
    pub conring_cons: Option<u64>,
    pub conring_prod: Option<u64>,
    pub saved_cmdline: Option<u64>,
}

/// Hypervisor-scope decoded state, owner of every PCPU, domain, and vCPU
/// the walk produces.
pub struct Host {
    pub arch: CoreArch,
    pub crash_info: XenCrashInfo,
    pub version: XenVersion,
    pub layout: &'static XenLayout,
    pub pcpus: Vec<Pcpu>,
    pub symtab: SymbolTable,
    pub dom0_symtab: SymbolTable,
    pub symbols: HostSymbols,
    console_ring: Option<String>,
    cmdline: Option<String>,
}

impl Host {
    /// Stashes the PCPU notes, resolves the anchor note, and resolves the
    /// symbols later stages walk from.
    pub fn setup(
        core: &CoreFile,
        symtab: SymbolTable,
        dom0_symtab: SymbolTable,
    ) -> Result<Self, Error> {
        let crash_info = core.crash_info()?;
        let version = crash_info.version();
        let (layout, known) = layout::for_version(crash_info.version_major, crash_info.version_minor);
        if !known {
            tracing::debug!(
                %version,
                "unknown hypervisor version, decoding with the newest known layout"
            );
        }

        let prstatus = core.prstatus()?;
        let crash_regs: Vec<Option<CrashXenRegs>> = core
            .crash_regs()
            .iter()
            .map(|note| match CrashXenRegs::read_from_prefix(&note.desc) {
                Ok((regs, _)) => Some(regs),
                Err(_) => {
                    tracing::warn!("truncated crash-regs note, control registers unavailable");
                    None
                }
            })
            .collect();

        let arch = core.arch();
        let pcpus: Vec<Pcpu> = prstatus
            .iter()
            .enumerate()
            .map(|(index, status)| {
                let crash = crash_regs.get(index).copied().flatten();
                let regs = match arch {
                    CoreArch::X86_64 => {
                        RegisterFrame::X86_64(PcpuRegisters::from_notes(status, crash.as_ref()))
                    }
                };
                Pcpu {
                    index: index as u32,
                    regs,
                    current_vcpu: None,
                    running_idle: false,
                }
            })
            .collect();

        if pcpus.len() as u64 != crash_info.cpu_count {
            tracing::warn!(
                notes = pcpus.len(),
                cpu_count = crash_info.cpu_count,
                "PCPU note count disagrees with the anchor note"
            );
        }

        let required = |name: &'static str| {
            symtab
                .lookup_name(name)
                .ok_or(Error::MissingSymbol { name })
        };
        let symbols = HostSymbols {
            domain_list: required(xendefs::SYM_DOMAIN_LIST)?,
            idle_vcpu: symtab.lookup_name(xendefs::SYM_IDLE_VCPU),
            per_cpu_offset: symtab.lookup_name(xendefs::SYM_PER_CPU_OFFSET),
            curr_vcpu: symtab.lookup_name(xendefs::SYM_CURR_VCPU),
            conring: symtab.lookup_name(xendefs::SYM_CONRING),
            conring_size: symtab.lookup_name(xendefs::SYM_CONRING_SIZE),
            conring_cons: symtab.lookup_name(xendefs::SYM_CONRING_CONS),
            conring_prod: symtab.lookup_name(xendefs::SYM_CONRING_PROD),
            saved_cmdline: symtab.lookup_name(xendefs::SYM_SAVED_CMDLINE),
        };

        Ok(Self {
            arch,
            crash_info,
            version,
            layout,
            pcpus,
            symtab,
            dom0_symtab,
            symbols,
            console_ring: None,
            cmdline: None,
        })
    }

    /// Symbolises a code address, preferring the control domain's table
    /// when the address falls inside its kernel text range.
    pub fn symbolise(&self, address: u64) -> Option<(&str, u64)> {
        match self.dom0_symtab.text_range() {
            Some(range) if range.contains(&address) => self.dom0_symtab.symbolise(address),
            _ => self.symtab.symbolise(address),
        }
    }

    /// Decodes hypervisor-scope state out of captured memory: the console
    /// ring and each PCPU's current vCPU. Failures here are advisory; the
    /// affected piece is simply absent from the report.
    pub fn decode_xen(&mut self, memory: &MemoryMap) {
        let root = self.crash_info.page_table_base;

        match console::read_console_ring(memory, root, &self.crash_info, &self.symbols) {
            Ok(ring) => self.console_ring = Some(ring),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "console ring unavailable"
                );
            }
        }

        if let Some(va) = self.symbols.saved_cmdline {
            match memory.read_cstr(root, va, 1024) {
                Ok(cmdline) => self.cmdline = Some(cmdline),
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "command line unavailable"
                    );
                }
            }
        }

        let (Some(per_cpu_offset), Some(curr_vcpu)) =
            (self.symbols.per_cpu_offset, self.symbols.curr_vcpu)
        else {
            tracing::warn!("per-cpu symbols missing, current vcpus unavailable");
            return;
        };
        for pcpu in &mut self.pcpus {
            let result = memory
                .read_plain::<u64>(root, per_cpu_offset.wrapping_add(8 * u64::from(pcpu.index)))
                .and_then(|base| memory.read_plain::<u64>(root, base.wrapping_add(curr_vcpu)));
            match result {
                Ok(va) => pcpu.current_vcpu = (va != 0).then_some(va),
                Err(err) => {
                    tracing::warn!(
                        pcpu = pcpu.index,
                        error = &err as &dyn std::error::Error,
                        "failed to read current vcpu"
                    );
                }
            }

            // Was the PCPU parked in its idle vCPU when the crash hit?
            if let (Some(idle_table), Some(current)) =
                (self.symbols.idle_vcpu, pcpu.current_vcpu)
            {
                let idle = memory
                    .read_plain::<u64>(root, idle_table.wrapping_add(8 * u64::from(pcpu.index)));
                pcpu.running_idle = idle.is_ok_and(|idle| idle == current);
            }
        }
    }

    /// Writes the hypervisor summary: version, command line, per-PCPU
    /// state with symbolised RIPs, and the console ring.
    pub fn print_xen(&self, sink: &mut dyn Write) -> io::Result<()> {
        writeln!(sink, "Xen version {}", self.version)?;
        match &self.cmdline {
            Some(cmdline) => writeln!(sink, "Command line: {cmdline}")?,
            None => writeln!(sink, "Command line: <unavailable>")?,
        }
        writeln!(sink)?;

        for pcpu in &self.pcpus {
            let RegisterFrame::X86_64(regs) = &pcpu.regs;
            write!(
                sink,
                "PCPU{}: RIP {:016x}",
                pcpu.index, regs.gregs.rip
            )?;
            if let Some((name, offset)) = self.symbolise(regs.gregs.rip) {
                write!(sink, " ({name}+{offset:#x})")?;
            }
            write!(
                sink,
                " RSP {:016x} CR3 {:016x}",
                regs.gregs.rsp, regs.cr3
            )?;
            match pcpu.current_vcpu {
                Some(va) if pcpu.running_idle => writeln!(sink, " current vcpu {va:#x} (idle)")?,
                Some(va) => writeln!(sink, " current vcpu {va:#x}")?,
                None => writeln!(sink)?,
            }
        }
        writeln!(sink)?;

        match &self.console_ring {
            Some(ring) => {
                writeln!(sink, "Console ring:")?;
                sink.write_all(ring.as_bytes())?;
                if !ring.ends_with('\n') {
                    writeln!(sink)?;
                }
            }
            None => writeln!(sink, "Console ring: <unavailable>")?,
        }
        Ok(())
    }

    /// Walks the domain list and writes one report per domain into the
    /// output directory. Returns the number of domains successfully
    /// written; a failing domain is reported and skipped.
    pub fn print_domains(&self, memory: &MemoryMap, outdir: &OutDir) -> usize {
        let root = self.crash_info.page_table_base;
        let head = self.symbols.domain_list;

        let mut current = match memory.read_plain::<u64>(root, head) {
            Ok(va) => va,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to read the domain list head"
                );
                return 0;
            }
        };

        let mut visited = HashSet::new();
        let mut emitted = 0;
        while current != 0 && current != head {
            if !visited.insert(current) {
                tracing::warn!("CycleDetected after N={} entries", visited.len());
                break;
            }
            if visited.len() > MAX_DOMAINS {
                tracing::warn!("domain list exceeded the {MAX_DOMAINS} cap");
                break;
            }

            match domain::decode_domain(memory, self, current) {
                Ok(dom) => match report::write_domain(outdir, self, memory, &dom) {
                    Ok(()) => emitted += 1,
                    Err(err) => {
                        tracing::warn!(
                            domain = dom.domain_id,
                            error = &err as &dyn std::error::Error,
                            "failed to write domain report"
                        );
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        va = current,
                        error = &err as &dyn std::error::Error,
                        "skipping undecodable domain"
                    );
                }
            }

            current = match memory
                .read_plain::<u64>(root, current.wrapping_add(self.layout.domain.next_in_list))
            {
                Ok(next) => next,
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "failed to follow the domain list"
                    );
                    break;
                }
            };
        }
        emitted
    }

    pub fn console_ring(&self) -> Option<&str> {
        self.console_ring.as_deref()
    }

    pub fn cmdline(&self) -> Option<&str> {
        self.cmdline.as_deref()
    }
}
