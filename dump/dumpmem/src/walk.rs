// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! x86-64 page table walking over captured memory.

use crate::Access;
use crate::Error;
use crate::MemoryMap;
use crate::WalkLevel;
use x86defs::is_canonical_address;
use x86defs::Pte;
use x86defs::X64_CR3_ADDR_MASK;
use x86defs::X64_PDE_2MB_RESERVED_MASK;
use x86defs::X64_PDPTE_1GB_RESERVED_MASK;

const LEVELS: [(WalkLevel, u32); 4] = [
    (WalkLevel::Pml4, 39),
    (WalkLevel::Pdpt, 30),
    (WalkLevel::Pd, 21),
    (WalkLevel::Pt, 12),
];

/// Translates `virt` by walking the four-level tables rooted at `root`,
/// honouring 1GB and 2MB large-page short circuits. Five-level paging is
/// not used by the hypervisors this tool analyses.
///
/// Permissions accumulate across levels: a write needs the writable bit
/// the whole way down, and execute fails on any no-execute bit.
pub(crate) fn translate(
    map: &MemoryMap,
    root: u64,
    virt: u64,
    access: Access,
) -> Result<u64, Error> {
    if !is_canonical_address(virt, 48) {
        return Err(Error::NonCanonical { virt });
    }

    let mut table = root & X64_CR3_ADDR_MASK;
    for (level, shift) in LEVELS {
        let entry_addr = table + ((virt >> shift) & 0x1ff) * 8;
        let raw = map.read_u64_phys(entry_addr)?;
        let entry = Pte::from(raw);

        if !entry.present() {
            return Err(Error::NotPresent { virt, level });
        }
        match access {
            Access::Read => {}
            Access::Write if !entry.read_write() => {
                return Err(Error::Protection { virt, access });
            }
            Access::Execute if entry.no_execute() => {
                return Err(Error::Protection { virt, access });
            }
            Access::Write | Access::Execute => {}
        }

        let phys = if shift == 12 {
            entry.address() | (virt & 0xfff)
        } else if entry.large_page() {
            let reserved = match level {
                WalkLevel::Pdpt => X64_PDPTE_1GB_RESERVED_MASK,
                WalkLevel::Pd => X64_PDE_2MB_RESERVED_MASK,
                // The page-size bit is reserved in a PML4 entry.
                WalkLevel::Pml4 | WalkLevel::Pt => {
                    return Err(Error::Reserved { virt, entry: raw })
                }
            };
            if raw & reserved != 0 {
                return Err(Error::Reserved { virt, entry: raw });
            }
            let page_mask = (1u64 << shift) - 1;
            (entry.address() & !page_mask) | (virt & page_mask)
        } else {
            table = entry.address();
            continue;
        };

        if !map.contains_phys(phys) {
            return Err(Error::OutOfMap { phys });
        }
        return Ok(phys);
    }

    // The PT level always returns above.
    Err(Error::NotPresent {
        virt,
        level: WalkLevel::Pt,
    })
}
