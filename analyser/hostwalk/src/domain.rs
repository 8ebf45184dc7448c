// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Decoding of captured `domain` and `vcpu` structures.
//!
//! All reads go through the hypervisor's page tables at the field offsets
//! for the capture's version. Links between entities stay as virtual
//! addresses; nothing here holds a reference into another decoded entity.

use crate::host::Host;
use crate::Error;
use crate::MAX_VCPUS;
use corefile::CoreArch;
use dumpmem::MemoryMap;
use x86defs::regs::CpuUserRegs;
use x86defs::regs::HvmHwCpu;
use xendefs::layout;
use xendefs::DomainHandle;
use xendefs::DomainState;
use xendefs::VcpuRunstate;

/// One decoded domain and its vCPUs. A vCPU that failed to decode keeps
/// its error so the report can carry a placeholder in its place.
#[derive(Debug)]
pub struct Domain {
    pub va: u64,
    pub domain_id: u16,
    pub handle: DomainHandle,
    pub is_control_domain: bool,
    pub state: DomainState,
    pub tot_pages: u64,
    pub max_pages: u64,
    pub page_table_base: u64,
    pub vcpu_count: u32,
    pub vcpus: Vec<Result<Vcpu, Error>>,
}

/// Guest register state, per architecture.
#[derive(Debug)]
pub enum VcpuFrame {
    X86_64 {
        regs: CpuUserRegs,
        cr3: u64,
        hvm: bool,
    },
}

#[derive(Debug)]
pub struct Vcpu {
    pub va: u64,
    pub vcpu_id: u32,
    pub domain_va: u64,
    pub pause_flags: u32,
    pub runstate: VcpuRunstate,
    pub frame: VcpuFrame,
}

/// Decodes the domain structure at `va`, then each populated vCPU slot.
/// A single vCPU failure is recorded in place and does not fail the
/// domain.
pub fn decode_domain(memory: &MemoryMap, host: &Host, va: u64) -> Result<Domain, Error> {
    let root = host.crash_info.page_table_base;
    let fields = &host.layout.domain;

    let domain_id: u16 = memory.read_plain(root, va.wrapping_add(fields.domain_id))?;
    let handle: [u8; 16] = memory.read_plain(root, va.wrapping_add(fields.handle))?;
    let is_privileged: u8 = memory.read_plain(root, va.wrapping_add(fields.is_privileged))?;
    let state: u32 = memory.read_plain(root, va.wrapping_add(fields.state))?;
    let tot_pages: u64 = memory.read_plain(root, va.wrapping_add(fields.tot_pages))?;
    let max_pages: u64 = memory.read_plain(root, va.wrapping_add(fields.max_pages))?;
    let page_table_base: u64 = memory.read_plain(root, va.wrapping_add(fields.page_table_base))?;
    let vcpu_count: u32 = memory.read_plain(root, va.wrapping_add(fields.max_vcpus))?;
    let vcpu_table: u64 = memory.read_plain(root, va.wrapping_add(fields.vcpus))?;

    if vcpu_count > MAX_VCPUS {
        return Err(Error::VcpuCount {
            va,
            count: vcpu_count,
        });
    }

    let mut vcpus = Vec::with_capacity(vcpu_count as usize);
    for slot in 0..vcpu_count {
        let vcpu_va: u64 = memory.read_plain(root, vcpu_table.wrapping_add(8 * u64::from(slot)))?;
        if vcpu_va == 0 {
            continue;
        }
        vcpus.push(decode_vcpu(memory, host, vcpu_va));
    }

    Ok(Domain {
        va,
        domain_id,
        handle: DomainHandle(handle),
        is_control_domain: is_privileged != 0,
        state: DomainState::from_raw(state),
        tot_pages,
        max_pages,
        page_table_base,
        vcpu_count,
        vcpus,
    })
}

/// Decodes the vCPU structure at `va`, including the guest register frame.
/// The guest-mode discriminator selects between the paravirtual pt_regs
/// area and the VMCS-mirrored block of a hardware-virtualised guest.
pub fn decode_vcpu(memory: &MemoryMap, host: &Host, va: u64) -> Result<Vcpu, Error> {
    let root = host.crash_info.page_table_base;
    let fields = &host.layout.vcpu;

    let vcpu_id: u32 = memory.read_plain(root, va.wrapping_add(fields.vcpu_id))?;
    let pause_flags: u32 = memory.read_plain(root, va.wrapping_add(fields.pause_flags))?;
    let runstate: u32 = memory.read_plain(root, va.wrapping_add(fields.runstate_state))?;
    let guest_mode: u8 = memory.read_plain(root, va.wrapping_add(fields.guest_mode))?;
    let domain_va: u64 = memory.read_plain(root, va.wrapping_add(fields.domain))?;

    let frame = match host.arch {
        CoreArch::X86_64 => match guest_mode {
            layout::GUEST_MODE_PV => {
                let regs: CpuUserRegs = memory.read_plain(root, va.wrapping_add(fields.user_regs))?;
                let cr3: u64 = memory.read_plain(root, va.wrapping_add(fields.guest_cr3))?;
                VcpuFrame::X86_64 {
                    regs,
                    cr3,
                    hvm: false,
                }
            }
            layout::GUEST_MODE_HVM => {
                let hw: HvmHwCpu = memory.read_plain(root, va.wrapping_add(fields.hvm_hw_cpu))?;
                VcpuFrame::X86_64 {
                    regs: hw.regs,
                    cr3: hw.cr3,
                    hvm: true,
                }
            }
            mode => return Err(Error::GuestMode { va, mode }),
        },
    };

    Ok(Vcpu {
        va,
        vcpu_id,
        domain_va,
        pause_flags,
        runstate: VcpuRunstate::from_raw(runstate),
        frame,
    })
}
