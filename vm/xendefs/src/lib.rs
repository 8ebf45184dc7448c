// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Xen ABI definitions: the crash-note payloads a kdump kernel emits for the
//! hypervisor, the names of the symbols the analyser anchors on, and the
//! per-version field layouts of the captured `domain` and `vcpu` structures.

#![forbid(unsafe_code)]

pub mod layout;

use core::fmt;
use core::fmt::Display;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Owner name of the hypervisor-specific CORE notes.
pub const NOTE_NAME_XEN: &str = "Xen";

/// Anchor note: one per capture, body is [`XenCrashInfo`].
pub const XEN_ELFNOTE_CRASH_INFO: u32 = 0x0100_0001;

/// Per-PCPU control register note, paired in order with `NT_PRSTATUS`.
pub const XEN_ELFNOTE_CRASH_REGS: u32 = 0x0100_0002;

// Symbols the host walker resolves from the hypervisor symbol table.
pub const SYM_TEXT_START: &str = "_stext";
pub const SYM_TEXT_END: &str = "_etext";
pub const SYM_DOMAIN_LIST: &str = "domain_list";
pub const SYM_IDLE_VCPU: &str = "idle_vcpu";
pub const SYM_PER_CPU_OFFSET: &str = "__per_cpu_offset";
pub const SYM_CURR_VCPU: &str = "per_cpu__curr_vcpu";
pub const SYM_CONRING: &str = "conring";
pub const SYM_CONRING_SIZE: &str = "conring_size";
pub const SYM_CONRING_CONS: &str = "conringc";
pub const SYM_CONRING_PROD: &str = "conringp";
pub const SYM_SAVED_CMDLINE: &str = "saved_cmdline";

/// Body of the anchor note. Everything symbolic decoding needs to get
/// started: the page-table root for hypervisor virtual addresses, the CPU
/// count, the console ring location, and the version the structure layouts
/// are keyed on.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XenCrashInfo {
    pub cpu_count: u64,
    pub version_major: u64,
    pub version_minor: u64,
    pub version_extra: [u8; 16],
    pub idle_vcpu: u64,
    pub page_table_base: u64,
    pub console_ring_va: u64,
    pub console_ring_size: u64,
}

impl XenCrashInfo {
    /// The inline extra-version string, e.g. `.0`, up to the first NUL.
    pub fn extra_str(&self) -> &str {
        let end = self
            .version_extra
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.version_extra.len());
        core::str::from_utf8(&self.version_extra[..end]).unwrap_or("")
    }

    pub fn version(&self) -> XenVersion {
        XenVersion {
            major: self.version_major,
            minor: self.version_minor,
            extra: self.extra_str().to_owned(),
        }
    }
}

/// Hypervisor version from the anchor note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XenVersion {
    pub major: u64,
    pub minor: u64,
    pub extra: String,
}

impl Display for XenVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.major, self.minor, self.extra)
    }
}

/// Scheduler state of a captured domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Blocked,
    Paused,
    Dying,
    Shutdown,
    Unknown(u32),
}

impl DomainState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Blocked,
            2 => Self::Paused,
            3 => Self::Dying,
            4 => Self::Shutdown,
            n => Self::Unknown(n),
        }
    }
}

impl Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Blocked => f.write_str("blocked"),
            Self::Paused => f.write_str("paused"),
            Self::Dying => f.write_str("dying"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::Unknown(n) => write!(f, "unknown ({n})"),
        }
    }
}

/// Run state of a captured vCPU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VcpuRunstate {
    Running,
    Runnable,
    Blocked,
    Offline,
    Unknown(u32),
}

impl VcpuRunstate {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Runnable,
            2 => Self::Blocked,
            3 => Self::Offline,
            n => Self::Unknown(n),
        }
    }
}

impl Display for VcpuRunstate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Runnable => f.write_str("runnable"),
            Self::Blocked => f.write_str("blocked"),
            Self::Offline => f.write_str("offline"),
            Self::Unknown(n) => write!(f, "unknown ({n})"),
        }
    }
}

/// A domain's 16-byte handle, displayed in the usual UUID grouping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DomainHandle(pub [u8; 16]);

impl Display for DomainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10],
            b[11], b[12], b[13], b[14], b[15]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    #[test]
    fn crash_info_size() {
        assert_eq!(core::mem::size_of::<XenCrashInfo>(), 72);
    }

    #[test]
    fn version_display() {
        let mut info = XenCrashInfo::new_zeroed();
        info.version_major = 4;
        info.version_minor = 4;
        info.version_extra[..2].copy_from_slice(b".0");
        assert_eq!(info.version().to_string(), "4.4.0");
    }

    #[test]
    fn handle_display() {
        let handle = DomainHandle([
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa,
            0xbb, 0xcc, 0xdd, 0xee, 0xff,
        ]);
        assert_eq!(
            handle.to_string(),
            "00112233-4455-6677-8899-aabbccddeeff"
        );
    }

    #[test]
    fn state_display() {
        assert_eq!(DomainState::from_raw(3).to_string(), "dying");
        assert_eq!(DomainState::from_raw(9).to_string(), "unknown (9)");
        assert_eq!(VcpuRunstate::from_raw(1).to_string(), "runnable");
    }
}
