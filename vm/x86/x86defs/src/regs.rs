// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Register save-area layouts: the `NT_PRSTATUS` note body, the Xen
//! crash-regs note body, and the frame shape used for guest register state
//! captured inside hypervisor structures.

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// General register file as laid out in `NT_PRSTATUS` (`user_regs_struct`).
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ElfGregSet {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

/// `elf_prstatus` for x86-64. Only the register file is interpreted; the
/// signal and timing fields are carried as padding to keep `pr_reg` at its
/// ABI offset of 112.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ElfPrstatus {
    pub siginfo: [u8; 12],
    pub cursig: u16,
    pub _pad0: u16,
    pub sigpend: u64,
    pub sighold: u64,
    pub pid: u32,
    pub ppid: u32,
    pub pgrp: u32,
    pub sid: u32,
    pub times: [u8; 64],
    pub reg: ElfGregSet,
    pub fpvalid: u32,
    pub _pad1: u32,
}

/// Body of the per-PCPU crash-regs note: state not present in `NT_PRSTATUS`.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CrashXenRegs {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub kernel_gs_base: u64,
}

/// The pt_regs-shaped register frame embedded in captured vCPU structures.
/// Paravirtualised guests store their interrupted context here directly.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CpuUserRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub error_code: u32,
    pub entry_vector: u32,
    pub rip: u64,
    pub cs: u16,
    pub _pad0: [u16; 3],
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u16,
    pub _pad1: [u16; 3],
    pub es: u16,
    pub _pad2: [u16; 3],
    pub ds: u16,
    pub _pad3: [u16; 3],
    pub fs: u16,
    pub _pad4: [u16; 3],
    pub gs: u16,
    pub _pad5: [u16; 3],
}

/// The VMCS-mirrored block holding a hardware-virtualised guest's register
/// state: the common frame followed by the control registers the hardware
/// tracks per vCPU.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct HvmHwCpu {
    pub regs: CpuUserRegs,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

/// Canonical per-PCPU register set decoded from the CORE notes.
#[derive(Debug, Copy, Clone, Default)]
pub struct PcpuRegisters {
    pub gregs: ElfGregSet,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub gs_base: u64,
    pub kernel_gs_base: u64,
}

impl PcpuRegisters {
    /// Combines the `NT_PRSTATUS` register file with the crash-regs note.
    /// The crash-regs note is optional; captures from hypervisors that do
    /// not emit it still decode, with the control registers left zero.
    pub fn from_notes(status: &ElfPrstatus, crash: Option<&CrashXenRegs>) -> Self {
        let crash = crash.copied().unwrap_or_default();
        Self {
            gregs: status.reg,
            cr0: crash.cr0,
            cr2: crash.cr2,
            cr3: crash.cr3,
            cr4: crash.cr4,
            gs_base: status.reg.gs_base,
            kernel_gs_base: crash.kernel_gs_base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_layout_sizes() {
        use core::mem::size_of;

        // Fixed ABI sizes; a drift here would misparse every capture.
        assert_eq!(size_of::<ElfGregSet>(), 216);
        assert_eq!(size_of::<ElfPrstatus>(), 336);
        assert_eq!(size_of::<CrashXenRegs>(), 40);
        assert_eq!(size_of::<CpuUserRegs>(), 200);
        assert_eq!(size_of::<HvmHwCpu>(), 232);
    }

    #[test]
    fn prstatus_reg_offset() {
        assert_eq!(core::mem::offset_of!(ElfPrstatus, reg), 112);
    }
}
