// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Report emission into the output directory.

use crate::domain::Domain;
use crate::domain::Vcpu;
use crate::domain::VcpuFrame;
use crate::host::Host;
use crate::unwind;
use crate::Error;
use dumpmem::MemoryMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

/// Well-known alias for the control domain's report.
pub const CONTROL_DOMAIN_LOG: &str = "dom0.log";

/// The output directory, resolved once at startup so every report path is
/// formed against the same base for the life of the process.
#[derive(Debug)]
pub struct OutDir {
    root: PathBuf,
}

impl OutDir {
    pub fn new(path: &Path) -> io::Result<Self> {
        Ok(Self {
            root: path.canonicalize()?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Creates (truncating) a report file inside the directory.
    pub fn create(&self, name: &str) -> io::Result<File> {
        File::create(self.root.join(name))
    }
}

/// Writes one domain's report to `domain-<id>.log`, and aliases the
/// control domain's report to `dom0.log`.
pub fn write_domain(
    outdir: &OutDir,
    host: &Host,
    memory: &MemoryMap,
    domain: &Domain,
) -> io::Result<()> {
    let text = render_domain(host, memory, domain);
    let name = format!("domain-{}.log", domain.domain_id);
    outdir.create(&name)?.write_all(text.as_bytes())?;
    if domain.is_control_domain {
        outdir.create(CONTROL_DOMAIN_LOG)?.write_all(text.as_bytes())?;
    }
    tracing::info!(domain = domain.domain_id, file = %name, "wrote domain report");
    Ok(())
}

fn render_domain(host: &Host, memory: &MemoryMap, domain: &Domain) -> String {
    let mut out = String::new();
    if domain.is_control_domain {
        let _ = writeln!(out, "Domain {} (control domain)", domain.domain_id);
    } else {
        let _ = writeln!(out, "Domain {}", domain.domain_id);
    }
    let _ = writeln!(out, "  Handle: {}", domain.handle);
    let _ = writeln!(out, "  State: {}", domain.state);
    let _ = writeln!(
        out,
        "  Pages: {:#x} allocated of {:#x} maximum",
        domain.tot_pages, domain.max_pages
    );
    let _ = writeln!(out, "  Page table base: {:#x}", domain.page_table_base);
    let _ = writeln!(out, "  Vcpus: {}", domain.vcpu_count);

    for vcpu in &domain.vcpus {
        let _ = writeln!(out);
        match vcpu {
            Ok(vcpu) => render_vcpu(&mut out, host, memory, domain, vcpu),
            Err(err) => render_vcpu_placeholder(&mut out, err),
        }
    }
    out
}

/// A vCPU that could not be decoded still gets a section, so the report
/// shows where and why the capture was bad.
fn render_vcpu_placeholder(out: &mut String, err: &Error) {
    let _ = writeln!(out, "  VCPU <undecoded>: {err}");
}

fn render_vcpu(out: &mut String, host: &Host, memory: &MemoryMap, domain: &Domain, vcpu: &Vcpu) {
    let VcpuFrame::X86_64 { regs, cr3, hvm } = &vcpu.frame;
    let _ = writeln!(
        out,
        "  VCPU{}: {}, runstate {}, pause flags {:#x}",
        vcpu.vcpu_id,
        if *hvm { "HVM" } else { "PV" },
        vcpu.runstate,
        vcpu.pause_flags
    );

    let _ = write!(out, "    RIP: {:016x}", regs.rip);
    if let Some((name, offset)) = host.symbolise(regs.rip) {
        let _ = write!(out, " ({name}+{offset:#x})");
    }
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "    RFLAGS: {:016x}   CS: {:04x} SS: {:04x} DS: {:04x} ES: {:04x}",
        regs.rflags, regs.cs, regs.ss, regs.ds, regs.es
    );
    let _ = writeln!(
        out,
        "    rax: {:016x}   rbx: {:016x}   rcx: {:016x}",
        regs.rax, regs.rbx, regs.rcx
    );
    let _ = writeln!(
        out,
        "    rdx: {:016x}   rsi: {:016x}   rdi: {:016x}",
        regs.rdx, regs.rsi, regs.rdi
    );
    let _ = writeln!(
        out,
        "    rbp: {:016x}   rsp: {:016x}   r8:  {:016x}",
        regs.rbp, regs.rsp, regs.r8
    );
    let _ = writeln!(
        out,
        "    r9:  {:016x}   r10: {:016x}   r11: {:016x}",
        regs.r9, regs.r10, regs.r11
    );
    let _ = writeln!(
        out,
        "    r12: {:016x}   r13: {:016x}   r14: {:016x}",
        regs.r12, regs.r13, regs.r14
    );
    let _ = writeln!(out, "    r15: {:016x}   cr3: {:016x}", regs.r15, cr3);

    // Unwind with the guest's own page tables, falling back to the
    // domain-wide root when the vCPU's CR3 was not captured.
    let root = if *cr3 != 0 {
        *cr3
    } else {
        domain.page_table_base
    };
    let unwind = unwind::unwind_stack(memory, root, regs.rip, regs.rsp, regs.rbp);
    let _ = writeln!(out, "    Call trace:");
    for frame in &unwind.frames {
        let _ = write!(out, "      [{:016x}]", frame.rip);
        if let Some((name, offset)) = host.symbolise(frame.rip) {
            let _ = write!(out, " {name}+{offset:#x}");
        }
        let _ = writeln!(out);
    }
    if let Some(fault) = &unwind.fault {
        let _ = writeln!(out, "      <trace stopped: {fault}>");
    }
    if unwind.truncated {
        let _ = writeln!(out, "      <trace truncated at {} frames>", unwind.frames.len());
    }
}
