// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Access to the captured physical memory of a crashed machine.
//!
//! A [`MemoryMap`] indexes the core file's load segments by physical
//! address and serves reads at physical or virtual addresses, the latter by
//! walking the captured page tables. The map never mutates the underlying
//! file and every successful read returns exactly the requested length.

#![forbid(unsafe_code)]

mod walk;

use corefile::LoadSegment;
use std::fmt;
use std::fmt::Display;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;
use x86defs::X64_PAGE_SIZE;
use zerocopy::FromBytes;

/// The kind of access a translation is performed for. Permission bits are
/// checked against it at every level of the walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// The paging level at which a translation stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WalkLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Display for WalkLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pml4 => f.write_str("pml4"),
            Self::Pdpt => f.write_str("pdpt"),
            Self::Pd => f.write_str("pd"),
            Self::Pt => f.write_str("pt"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open core file {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("overlapping load segments at {first:#x} and {second:#x}")]
    Overlap { first: u64, second: u64 },
    #[error("failed to read {len} bytes at physical address {phys:#x}")]
    Io {
        phys: u64,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("PageFault(OutOfMap) at phys={phys:#x}")]
    OutOfMap { phys: u64 },
    #[error("read of {len} bytes at {phys:#x} crosses a segment boundary")]
    SpansSegments { phys: u64, len: usize },
    #[error("PageFault(NonPresent) at va={virt:#x} ({level} level)")]
    NotPresent { virt: u64, level: WalkLevel },
    #[error("PageFault(Protection) at va={virt:#x} for {access:?} access")]
    Protection { virt: u64, access: Access },
    #[error("PageFault(Reserved) at va={virt:#x}, entry {entry:#x}")]
    Reserved { virt: u64, entry: u64 },
    #[error("non-canonical virtual address {virt:#x}")]
    NonCanonical { virt: u64 },
    #[error("short read decoding a value at va={virt:#x}")]
    ShortRead { virt: u64 },
}

/// Read-only view of the captured physical address space.
#[derive(Debug)]
pub struct MemoryMap {
    file: File,
    segments: Vec<LoadSegment>,
}

impl MemoryMap {
    /// Opens the core file for random reads over the given load segments.
    /// The segments are sorted by physical start; overlap is rejected here
    /// as well so the map upholds its own invariants.
    pub fn new(core_path: &Path, mut segments: Vec<LoadSegment>) -> Result<Self, Error> {
        let file = File::open(core_path).map_err(|source| Error::Open {
            path: core_path.to_owned(),
            source,
        })?;

        segments.sort_by_key(|s| s.phys_start);
        for pair in segments.windows(2) {
            if pair[1].phys_start < pair[0].phys_end() {
                return Err(Error::Overlap {
                    first: pair[0].phys_start,
                    second: pair[1].phys_start,
                });
            }
        }

        Ok(Self { file, segments })
    }

    /// Whether any load segment covers `phys`.
    pub fn contains_phys(&self, phys: u64) -> bool {
        self.segment_for(phys).is_some()
    }

    fn segment_for(&self, phys: u64) -> Option<&LoadSegment> {
        let idx = self.segments.partition_point(|s| s.phys_start <= phys);
        self.segments[..idx].last().filter(|s| s.contains(phys))
    }

    /// Reads `len` bytes at a physical address. The range must lie inside a
    /// single load segment.
    pub fn read_phys(&self, phys: u64, len: usize) -> Result<Vec<u8>, Error> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let segment = self.segment_for(phys).ok_or(Error::OutOfMap { phys })?;
        let end = phys
            .checked_add(len as u64)
            .ok_or(Error::OutOfMap { phys })?;
        if end > segment.phys_end() {
            return Err(Error::SpansSegments { phys, len });
        }

        let offset = segment.file_offset + (phys - segment.phys_start);
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, offset)
            .map_err(|source| Error::Io { phys, len, source })?;
        Ok(buf)
    }

    /// Reads a little-endian u64 at a physical address.
    pub fn read_u64_phys(&self, phys: u64) -> Result<u64, Error> {
        let bytes = self.read_phys(phys, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Translates a virtual address by walking the captured page tables
    /// rooted at `root` (a CR3 value or equivalent page-table base).
    pub fn virt_to_phys(&self, root: u64, virt: u64, access: Access) -> Result<u64, Error> {
        walk::translate(self, root, virt, access)
    }

    /// Reads `len` bytes at a virtual address, splitting the read at page
    /// boundaries. A fault on any page aborts the whole read.
    pub fn read_virt(&self, root: u64, virt: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(len);
        let mut va = virt;
        let mut remaining = len;
        while remaining > 0 {
            let page_off = va & (X64_PAGE_SIZE - 1);
            let take = usize::min(remaining, (X64_PAGE_SIZE - page_off) as usize);
            let phys = self.virt_to_phys(root, va, Access::Read)?;
            out.extend_from_slice(&self.read_phys(phys, take)?);
            va = va.wrapping_add(take as u64);
            remaining -= take;
        }
        Ok(out)
    }

    /// Reads a plain value at a virtual address.
    pub fn read_plain<T: FromBytes>(&self, root: u64, virt: u64) -> Result<T, Error> {
        let bytes = self.read_virt(root, virt, core::mem::size_of::<T>())?;
        T::read_from_bytes(&bytes).map_err(|_| Error::ShortRead { virt })
    }

    /// Reads a NUL-terminated string of at most `max` bytes at a virtual
    /// address, decoding lossily.
    pub fn read_cstr(&self, root: u64, virt: u64, max: usize) -> Result<String, Error> {
        let mut out = Vec::new();
        let mut va = virt;
        while out.len() < max {
            let page_off = va & (X64_PAGE_SIZE - 1);
            let take = usize::min(max - out.len(), (X64_PAGE_SIZE - page_off) as usize);
            let chunk = self.read_virt(root, va, take)?;
            match chunk.iter().position(|&b| b == 0) {
                Some(pos) => {
                    out.extend_from_slice(&chunk[..pos]);
                    break;
                }
                None => {
                    out.extend_from_slice(&chunk);
                    va = va.wrapping_add(take as u64);
                }
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}
