// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Field offsets of the captured `domain` and `vcpu` structures, keyed on
//! the hypervisor version from the anchor note. The decoder reads raw bytes
//! at these offsets rather than overlaying whole structs, so a layout
//! revision only has to describe the fields the analyser consumes.

/// Discriminator values for [`VcpuLayout::guest_mode`].
pub const GUEST_MODE_PV: u8 = 0;
pub const GUEST_MODE_HVM: u8 = 1;

/// Offsets within `struct domain`.
#[derive(Debug, Copy, Clone)]
pub struct DomainLayout {
    /// u16 domain identifier.
    pub domain_id: u64,
    /// 16-byte domain handle.
    pub handle: u64,
    /// u8, nonzero for the privileged control domain.
    pub is_privileged: u64,
    /// u32 scheduler state.
    pub state: u64,
    /// u64 pages currently allocated to the domain.
    pub tot_pages: u64,
    /// u64 allocation ceiling.
    pub max_pages: u64,
    /// u64 guest page-table root.
    pub page_table_base: u64,
    /// u32 number of populated vCPU slots.
    pub max_vcpus: u64,
    /// u64 pointer to the array of `vcpu` pointers.
    pub vcpus: u64,
    /// u64 pointer to the next domain in the list.
    pub next_in_list: u64,
}

/// Offsets within `struct vcpu`.
#[derive(Debug, Copy, Clone)]
pub struct VcpuLayout {
    /// u32 vCPU identifier.
    pub vcpu_id: u64,
    /// u32 pause flag bitset.
    pub pause_flags: u64,
    /// u32 run state.
    pub runstate_state: u64,
    /// u8 guest kind, [`GUEST_MODE_PV`] or [`GUEST_MODE_HVM`].
    pub guest_mode: u64,
    /// u64 back-pointer to the owning domain.
    pub domain: u64,
    /// u64 guest page-table root for PV guests.
    pub guest_cr3: u64,
    /// `CpuUserRegs` save area for PV guests.
    pub user_regs: u64,
    /// `HvmHwCpu` block for HVM guests.
    pub hvm_hw_cpu: u64,
}

/// The layouts for one hypervisor release line.
#[derive(Debug, Copy, Clone)]
pub struct XenLayout {
    pub domain: DomainLayout,
    pub vcpu: VcpuLayout,
}

/// 4.2 and 4.3: the vCPU arch save areas sit one slot earlier.
pub const LAYOUT_4_2: XenLayout = XenLayout {
    domain: DOMAIN_LAYOUT,
    vcpu: VcpuLayout {
        vcpu_id: 0x0,
        pause_flags: 0x4,
        runstate_state: 0x8,
        guest_mode: 0xc,
        domain: 0x10,
        guest_cr3: 0x18,
        user_regs: 0x38,
        hvm_hw_cpu: 0x138,
    },
};

/// 4.4 and 4.5.
pub const LAYOUT_4_4: XenLayout = XenLayout {
    domain: DOMAIN_LAYOUT,
    vcpu: VCPU_LAYOUT,
};

const DOMAIN_LAYOUT: DomainLayout = DomainLayout {
    domain_id: 0x0,
    handle: 0x8,
    is_privileged: 0x18,
    state: 0x1c,
    tot_pages: 0x20,
    max_pages: 0x28,
    page_table_base: 0x30,
    max_vcpus: 0x38,
    vcpus: 0x40,
    next_in_list: 0x48,
};

const VCPU_LAYOUT: VcpuLayout = VcpuLayout {
    vcpu_id: 0x0,
    pause_flags: 0x4,
    runstate_state: 0x8,
    guest_mode: 0xc,
    domain: 0x10,
    guest_cr3: 0x18,
    user_regs: 0x40,
    hvm_hw_cpu: 0x140,
};

/// Returns the layout for a hypervisor version and whether the version is
/// one the analyser knows. Unknown versions decode with the newest layout.
pub fn for_version(major: u64, minor: u64) -> (&'static XenLayout, bool) {
    match (major, minor) {
        (4, 2) | (4, 3) => (&LAYOUT_4_2, true),
        (4, 4) | (4, 5) => (&LAYOUT_4_4, true),
        _ => (&LAYOUT_4_4, false),
    }
}
