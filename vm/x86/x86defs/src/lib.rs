// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! x86-64 architectural definitions needed to decode a crash capture:
//! paging structures, control register bits, and the register save areas
//! found in CORE notes and in captured hypervisor structures.

#![forbid(unsafe_code)]

pub mod regs;

use bitfield_struct::bitfield;

pub const X64_PAGE_SIZE: u64 = 0x1000;
pub const X64_PAGE_SHIFT: u64 = 12;
pub const X64_LARGE_PAGE_SIZE: u64 = 0x20_0000;
pub const X64_1GB_PAGE_SIZE: u64 = 0x4000_0000;

/// Mask selecting the physical address bits of a page table entry.
pub const X64_PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Mask selecting the page table base from CR3.
pub const X64_CR3_ADDR_MASK: u64 = !0xfffu64;

pub const X64_CR0_PE: u64 = 0x0000000000000001; // protection enable
pub const X64_CR0_WP: u64 = 0x0000000000010000; // write protect
pub const X64_CR0_PG: u64 = 0x0000000080000000; // paging

pub const X64_CR4_PSE: u64 = 0x0000000000000010; // page size extensions
pub const X64_CR4_PAE: u64 = 0x0000000000000020; // physical address extensions
pub const X64_CR4_LA57: u64 = 0x0000000000001000; // 5-level paging enabled
pub const X64_CR4_SMEP: u64 = 0x0000000000100000; // supervisor mode execution protection
pub const X64_CR4_SMAP: u64 = 0x0000000000200000; // supervisor mode access protection

pub const X64_EFER_LME: u64 = 0x0000000000000100; // long mode enabled
pub const X64_EFER_LMA: u64 = 0x0000000000000400; // long mode active
pub const X64_EFER_NXE: u64 = 0x0000000000000800; // no-execute enable

pub const X86X_MSR_GS_BASE: u32 = 0xc0000101;
pub const X86X_MSR_KERNEL_GS_BASE: u32 = 0xc0000102;

/// A page table entry, valid at any level of the hierarchy. Bit 7 is PAT in
/// a terminal 4KB PTE and the page-size flag in a PDPTE or PDE; callers
/// reinterpret via [`LargePde`] when it is set below the terminal level.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Pte {
    pub present: bool,
    pub read_write: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,
    #[bits(3)]
    pub available0: u64,
    #[bits(40)]
    pub pfn: u64,
    #[bits(11)]
    pub available1: u64,
    pub no_execute: bool,
}

impl Pte {
    pub fn address(&self) -> u64 {
        self.pfn() << X64_PAGE_SHIFT
    }
}

/// A page directory entry mapping a 2MB page.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct LargePde {
    pub present: bool,
    pub read_write: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,
    #[bits(3)]
    pub available0: u64,
    pub pat: bool,
    #[bits(8)]
    _reserved0: u64,
    #[bits(31)]
    pub large_page_base: u64,
    #[bits(11)]
    pub available1: u64,
    pub no_execute: bool,
}

/// Bits of a 2MB PDE that must be clear below the page base (bit 12 is PAT).
pub const X64_PDE_2MB_RESERVED_MASK: u64 = 0x001f_e000;

/// Bits of a 1GB PDPTE that must be clear below the page base.
pub const X64_PDPTE_1GB_RESERVED_MASK: u64 = 0x3fff_e000;

#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct RFlags {
    pub carry: bool,
    _reserved0: bool,
    pub parity: bool,
    _reserved1: bool,
    pub adjust: bool,
    _reserved2: bool,
    pub zero: bool,
    pub sign: bool,
    pub trap: bool,
    pub interrupt_enable: bool,
    pub direction: bool,
    pub overflow: bool,
    #[bits(2)]
    pub io_privilege_level: u8,
    pub nested_task: bool,
    _reserved3: bool,
    pub resume: bool,
    pub virtual_8086_mode: bool,
    pub alignment_check: bool,
    pub virtual_interrupt: bool,
    pub virtual_interrupt_pending: bool,
    pub cpuid_allowed: bool,
    #[bits(42)]
    _reserved4: u64,
}

/// Returns whether a virtual address is canonical: the top unused bits must
/// equal the top used bit, where `address_bits` is 48 or 57.
pub fn is_canonical_address(va: u64, address_bits: u32) -> bool {
    let high_bits = (va as i64) >> (address_bits - 1);
    high_bits == 0 || high_bits == -1
}
