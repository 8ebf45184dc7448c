// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Synthetic crash captures for the scenario tests.
//!
//! Builds a small "machine": a physical image with real four-level page
//! tables identity-mapping the low region, hypervisor structures placed at
//! known addresses, and an ELF CORE file wrapping it all with PRSTATUS and
//! Xen notes.

use std::path::Path;
use std::path::PathBuf;
use x86defs::regs::CpuUserRegs;
use x86defs::regs::ElfPrstatus;
use x86defs::regs::HvmHwCpu;
use xendefs::XenCrashInfo;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

pub const PRESENT_RW: u64 = 0x3;
pub const LARGE: u64 = 0x80;

// Physical layout of the synthetic machine. Everything below 2MB is
// identity-mapped; the window at 0x200000 goes through an empty page table
// so reads there fault NonPresent.
pub const PA_PML4: u64 = 0x1000;
pub const PA_PDPT: u64 = 0x2000;
pub const PA_PD: u64 = 0x3000;
pub const PA_EMPTY_PT: u64 = 0x4000;
pub const VA_TEXT_START: u64 = 0x10000;
pub const VA_IDLE_LOOP: u64 = 0x11000;
pub const VA_TEXT_END: u64 = 0x18000;
pub const VA_DOMAIN_LIST: u64 = 0x20000;
pub const VA_CONRING: u64 = 0x20100;
pub const VA_CONRING_SIZE: u64 = 0x20108;
pub const VA_CONRING_CONS: u64 = 0x20110;
pub const VA_CONRING_PROD: u64 = 0x20114;
pub const VA_PER_CPU_OFFSET: u64 = 0x20118;
pub const VA_SAVED_CMDLINE: u64 = 0x20300;
pub const PER_CPU_BLOCK: u64 = 0x21000;
pub const CURR_VCPU_OFFSET: u64 = 0x200;
pub const VA_RING_BUF: u64 = 0x28000;
pub const RING_SIZE: u64 = 0x1000;
pub const VA_DOM0: u64 = 0x30000;
pub const VA_DOM0_VCPU_TABLE: u64 = 0x30100;
pub const VA_DOM0_VCPU0: u64 = 0x31000;
pub const VA_DOMU: u64 = 0x32000;
pub const VA_DOMU_VCPU_TABLE: u64 = 0x32100;
pub const VA_DOMU_VCPU0: u64 = 0x33000;
pub const VA_STACK: u64 = 0x3f000;
pub const VA_UNMAPPED_VCPU: u64 = 0x201000;

pub const DOM0_RIP: u64 = 0xffffffff81234567;
pub const DOM0_RET1: u64 = 0xffffffff81234570;
pub const DOM0_RET2: u64 = 0xffffffff81234580;

pub const MEM_SIZE: usize = 0x40000;
const NOTE_OFF: u64 = 0x1000;
const LOAD_OFF: u64 = 0x2000;

pub struct WorldBuilder {
    pub mem: Vec<u8>,
    notes: Vec<u8>,
}

impl WorldBuilder {
    pub fn new() -> Self {
        Self {
            mem: vec![0u8; MEM_SIZE],
            notes: Vec::new(),
        }
    }

    pub fn put_u64(&mut self, pa: u64, value: u64) {
        let pa = pa as usize;
        self.mem[pa..pa + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, pa: u64, value: u32) {
        let pa = pa as usize;
        self.mem[pa..pa + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn put_u16(&mut self, pa: u64, value: u16) {
        let pa = pa as usize;
        self.mem[pa..pa + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn put_bytes(&mut self, pa: u64, bytes: &[u8]) {
        let pa = pa as usize;
        self.mem[pa..pa + bytes.len()].copy_from_slice(bytes);
    }

    /// Identity map for the first 2MB plus an empty page table covering
    /// 0x200000..0x400000.
    pub fn identity_tables(&mut self) {
        self.put_u64(PA_PML4, PA_PDPT | PRESENT_RW);
        self.put_u64(PA_PDPT, PA_PD | PRESENT_RW);
        self.put_u64(PA_PD, PRESENT_RW | LARGE);
        self.put_u64(PA_PD + 8, PA_EMPTY_PT | PRESENT_RW);
    }

    pub fn add_note(&mut self, name: &str, n_type: u32, desc: &[u8]) {
        self.notes
            .extend_from_slice(&(name.len() as u32 + 1).to_le_bytes());
        self.notes.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        self.notes.extend_from_slice(&n_type.to_le_bytes());
        self.notes.extend_from_slice(name.as_bytes());
        self.notes.push(0);
        while self.notes.len() % 4 != 0 {
            self.notes.push(0);
        }
        self.notes.extend_from_slice(desc);
        while self.notes.len() % 4 != 0 {
            self.notes.push(0);
        }
    }

    pub fn add_anchor_note(&mut self, cpu_count: u64, major: u64, minor: u64, extra: &str) {
        let mut info = XenCrashInfo::new_zeroed();
        info.cpu_count = cpu_count;
        info.version_major = major;
        info.version_minor = minor;
        info.version_extra[..extra.len()].copy_from_slice(extra.as_bytes());
        info.page_table_base = PA_PML4;
        info.console_ring_va = VA_RING_BUF;
        info.console_ring_size = RING_SIZE;
        self.add_note(
            xendefs::NOTE_NAME_XEN,
            xendefs::XEN_ELFNOTE_CRASH_INFO,
            info.as_bytes(),
        );
    }

    /// Anchor note with no memory behind it: page-table root zero and no
    /// console ring, as in the minimal scenario.
    pub fn add_bare_anchor_note(&mut self, cpu_count: u64) {
        let mut info = XenCrashInfo::new_zeroed();
        info.cpu_count = cpu_count;
        info.version_major = 4;
        info.version_minor = 4;
        info.version_extra[..2].copy_from_slice(b".0");
        self.add_note(
            xendefs::NOTE_NAME_XEN,
            xendefs::XEN_ELFNOTE_CRASH_INFO,
            info.as_bytes(),
        );
    }

    pub fn add_prstatus_note(&mut self, rip: u64, rsp: u64, rbp: u64) {
        let mut status = ElfPrstatus::new_zeroed();
        status.reg.rip = rip;
        status.reg.rsp = rsp;
        status.reg.rbp = rbp;
        self.add_note("CORE", 1, status.as_bytes());
    }

    /// Writes the ELF CORE file: one PT_NOTE and one PT_LOAD at physical
    /// zero covering the whole image.
    pub fn write_core(&self, dir: &Path) -> PathBuf {
        let mut out = vec![
            0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        out.extend_from_slice(&4u16.to_le_bytes()); // ET_CORE
        out.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&56u16.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes()); // e_phnum
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());

        let phdr = |p_type: u32, offset: u64, paddr: u64, filesz: u64| {
            let mut v = Vec::new();
            v.extend_from_slice(&p_type.to_le_bytes());
            v.extend_from_slice(&0u32.to_le_bytes());
            v.extend_from_slice(&offset.to_le_bytes());
            v.extend_from_slice(&0u64.to_le_bytes()); // p_vaddr
            v.extend_from_slice(&paddr.to_le_bytes());
            v.extend_from_slice(&filesz.to_le_bytes());
            v.extend_from_slice(&filesz.to_le_bytes());
            v.extend_from_slice(&0u64.to_le_bytes());
            v
        };
        out.extend(phdr(4, NOTE_OFF, 0, self.notes.len() as u64)); // PT_NOTE
        out.extend(phdr(1, LOAD_OFF, 0, self.mem.len() as u64)); // PT_LOAD

        out.resize(NOTE_OFF as usize, 0);
        out.extend_from_slice(&self.notes);
        out.resize(LOAD_OFF as usize, 0);
        out.extend_from_slice(&self.mem);

        let path = dir.join("vmcore");
        std::fs::write(&path, &out).unwrap();
        path
    }

    // Populated-world helpers below: structures at the addresses the
    // scenario tests assert on, laid out per the 4.4 layout.

    pub fn populate_symbols_area(&mut self, first_domain: u64) {
        self.put_u64(VA_DOMAIN_LIST, first_domain);
        self.put_u64(VA_CONRING, VA_RING_BUF);
        self.put_u32(VA_CONRING_SIZE, RING_SIZE as u32);
        self.put_u64(VA_PER_CPU_OFFSET, PER_CPU_BLOCK);
        self.put_u64(PER_CPU_BLOCK + CURR_VCPU_OFFSET, VA_DOM0_VCPU0);
        self.put_bytes(VA_SAVED_CMDLINE, b"console=com1 loglvl=all\0");
    }

    pub fn populate_console_ring(&mut self, text: &[u8]) {
        self.put_bytes(VA_RING_BUF, text);
        self.put_u32(VA_CONRING_CONS, 0);
        self.put_u32(VA_CONRING_PROD, text.len() as u32);
    }

    pub fn populate_dom0(&mut self, next_in_list: u64) {
        let d = VA_DOM0;
        self.put_u16(d, 0); // domain_id
        self.put_bytes(d + 0x8, &[0x11; 16]); // handle
        self.put_bytes(d + 0x18, &[1]); // is_privileged
        self.put_u32(d + 0x1c, 0); // running
        self.put_u64(d + 0x20, 0x1234); // tot_pages
        self.put_u64(d + 0x28, 0x2000); // max_pages
        self.put_u64(d + 0x30, PA_PML4); // page_table_base
        self.put_u32(d + 0x38, 2); // max_vcpus
        self.put_u64(d + 0x40, VA_DOM0_VCPU_TABLE);
        self.put_u64(d + 0x48, next_in_list);

        self.put_u64(VA_DOM0_VCPU_TABLE, VA_DOM0_VCPU0);
        self.put_u64(VA_DOM0_VCPU_TABLE + 8, VA_UNMAPPED_VCPU);

        let v = VA_DOM0_VCPU0;
        self.put_u32(v, 0); // vcpu_id
        self.put_u32(v + 0x4, 0); // pause_flags
        self.put_u32(v + 0x8, 0); // running
        self.put_bytes(v + 0xc, &[xendefs::layout::GUEST_MODE_PV]);
        self.put_u64(v + 0x10, VA_DOM0);
        self.put_u64(v + 0x18, PA_PML4); // guest cr3

        let mut regs = CpuUserRegs::new_zeroed();
        regs.rip = DOM0_RIP;
        regs.rsp = VA_STACK - 0x100;
        regs.rbp = VA_STACK;
        self.put_bytes(v + 0x40, regs.as_bytes());

        // Two stack frames above the interrupted one.
        self.put_u64(VA_STACK, VA_STACK + 0x40);
        self.put_u64(VA_STACK + 0x8, DOM0_RET1);
        self.put_u64(VA_STACK + 0x40, 0);
        self.put_u64(VA_STACK + 0x48, DOM0_RET2);
    }

    pub fn populate_domu(&mut self) {
        let d = VA_DOMU;
        self.put_u16(d, 1);
        self.put_bytes(d + 0x8, &[0xaa; 16]);
        self.put_bytes(d + 0x18, &[0]);
        self.put_u32(d + 0x1c, 2); // paused
        self.put_u64(d + 0x20, 0x555);
        self.put_u64(d + 0x28, 0x1000);
        self.put_u64(d + 0x30, PA_PML4);
        self.put_u32(d + 0x38, 1);
        self.put_u64(d + 0x40, VA_DOMU_VCPU_TABLE);
        self.put_u64(d + 0x48, 0); // end of list

        self.put_u64(VA_DOMU_VCPU_TABLE, VA_DOMU_VCPU0);

        let v = VA_DOMU_VCPU0;
        self.put_u32(v, 0);
        self.put_u32(v + 0x4, 0);
        self.put_u32(v + 0x8, 2); // blocked
        self.put_bytes(v + 0xc, &[xendefs::layout::GUEST_MODE_HVM]);
        self.put_u64(v + 0x10, VA_DOMU);

        let mut hw = HvmHwCpu::new_zeroed();
        hw.regs.rip = VA_IDLE_LOOP;
        hw.cr3 = PA_PML4;
        self.put_bytes(v + 0x140, hw.as_bytes());
    }
}

fn symtab_line(out: &mut String, address: u64, type_code: char, name: &str) {
    out.push_str(&format!("{address:016x} {type_code} {name}\n"));
}

/// Full hypervisor symbol table for the populated world.
pub fn write_xen_symtab(dir: &Path) -> PathBuf {
    let mut text = String::new();
    symtab_line(&mut text, VA_TEXT_START, 'T', "_stext");
    symtab_line(&mut text, VA_IDLE_LOOP, 'T', "idle_loop");
    symtab_line(&mut text, VA_TEXT_END, 'T', "_etext");
    symtab_line(&mut text, VA_DOMAIN_LIST, 'D', "domain_list");
    symtab_line(&mut text, VA_CONRING, 'D', "conring");
    symtab_line(&mut text, VA_CONRING_SIZE, 'D', "conring_size");
    symtab_line(&mut text, VA_CONRING_CONS, 'D', "conringc");
    symtab_line(&mut text, VA_CONRING_PROD, 'D', "conringp");
    symtab_line(&mut text, VA_PER_CPU_OFFSET, 'D', "__per_cpu_offset");
    symtab_line(&mut text, CURR_VCPU_OFFSET, 'D', "per_cpu__curr_vcpu");
    symtab_line(&mut text, VA_SAVED_CMDLINE, 'D', "saved_cmdline");
    let path = dir.join("xen-syms");
    std::fs::write(&path, text).unwrap();
    path
}

/// Control-domain symbol table with a kernel text range covering the guest
/// return addresses used by the scenarios.
pub fn write_dom0_symtab(dir: &Path) -> PathBuf {
    let mut text = String::new();
    symtab_line(&mut text, 0xffffffff81000000, 'T', "_stext");
    symtab_line(&mut text, 0xffffffff81234560, 'T', "do_syscall");
    symtab_line(&mut text, 0xffffffff81800000, 'T', "_etext");
    let path = dir.join("dom0-syms");
    std::fs::write(&path, text).unwrap();
    path
}
