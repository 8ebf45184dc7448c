// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! ELF CORE parsing for crash captures.
//!
//! Inspects the ELF identification to pick an architecture backend, turns
//! every `PT_LOAD` into a [`LoadSegment`], and walks every `PT_NOTE`
//! note-by-note into [`CoreNote`] records. Malformed headers and
//! overlapping segments are fatal; an individual note that fails to parse
//! is only a warning.

#![forbid(unsafe_code)]

use object::elf;
use object::read::elf::FileHeader;
use object::read::elf::ProgramHeader;
use object::ReadCache;
use object::ReadRef;
use std::fmt;
use std::fmt::Display;
use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;
use x86defs::regs::ElfPrstatus;
use xendefs::XenCrashInfo;
use zerocopy::FromBytes;

type LE = object::LittleEndian;
const LE: LE = LE {};

/// Name of the per-CPU `NT_PRSTATUS` notes.
pub const NOTE_NAME_CORE: &str = "CORE";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open core file {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read the ELF file header")]
    ReadHeader,
    #[error("not an ELF file")]
    NotElf,
    #[error("unsupported ELF class {class:#x}")]
    UnsupportedClass { class: u8 },
    #[error("unsupported ELF byte order {data:#x}")]
    UnsupportedEndian { data: u8 },
    #[error("unsupported machine {machine:#x}")]
    UnsupportedMachine { machine: u16 },
    #[error("not an ELF CORE file (type {e_type:#x})")]
    NotACore { e_type: u16 },
    #[error("failed to parse program headers")]
    ProgramHeaders(#[source] object::read::Error),
    #[error("PT_LOAD segment out of bounds: offset {offset:#x} length {length:#x}")]
    SegmentBounds { offset: u64, length: u64 },
    #[error("overlapping PT_LOAD segments at {first:#x} and {second:#x}")]
    OverlappingSegments { first: u64, second: u64 },
    #[error("core file contains no PT_LOAD segments")]
    NoLoadSegments,
    #[error("core file contains no {name} note of type {n_type:#x}")]
    MissingNote { name: &'static str, n_type: u32 },
    #[error("truncated {name} note of type {n_type:#x}")]
    TruncatedNote { name: String, n_type: u32 },
}

/// The instruction set a capture was taken on. Only x86-64 captures decode
/// today; the dispatch point exists so another backend slots in beside it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoreArch {
    X86_64,
}

impl Display for CoreArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86_64 => f.write_str("x86_64"),
        }
    }
}

/// One `PT_LOAD`: a range of captured physical memory and where its bytes
/// sit in the core file.
#[derive(Debug, Clone)]
pub struct LoadSegment {
    pub phys_start: u64,
    pub file_offset: u64,
    pub length: u64,
    pub virt_start: Option<u64>,
}

impl LoadSegment {
    pub fn phys_end(&self) -> u64 {
        self.phys_start + self.length
    }

    pub fn contains(&self, phys: u64) -> bool {
        phys >= self.phys_start && phys < self.phys_end()
    }
}

/// One entry from a `PT_NOTE` segment.
#[derive(Debug, Clone)]
pub struct CoreNote {
    pub name: String,
    pub n_type: u32,
    pub desc: Vec<u8>,
}

/// A parsed ELF CORE file.
#[derive(Debug)]
pub struct CoreFile {
    arch: CoreArch,
    segments: Vec<LoadSegment>,
    notes: Vec<CoreNote>,
    unknown_notes: usize,
}

impl CoreFile {
    /// Opens and fully parses a core file. The architecture backend is
    /// chosen from the ELF identification; only 64-bit little-endian
    /// `EM_X86_64` captures are supported.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path).map_err(|source| Error::Open {
            path: path.to_owned(),
            source,
        })?;
        let reader = ReadCache::new(file);

        let ident = reader.read_bytes_at(0, 16).map_err(|()| Error::ReadHeader)?;
        if ident[..4] != elf::ELFMAG {
            return Err(Error::NotElf);
        }
        const EI_CLASS: usize = 4;
        const EI_DATA: usize = 5;
        let class = ident[EI_CLASS];
        if class != elf::ELFCLASS64 {
            return Err(Error::UnsupportedClass { class });
        }
        let data = ident[EI_DATA];
        if data != elf::ELFDATA2LSB {
            return Err(Error::UnsupportedEndian { data });
        }

        let ehdr: &elf::FileHeader64<LE> =
            reader.read_at(0).map_err(|()| Error::ReadHeader)?;
        if !ehdr.is_supported() {
            return Err(Error::NotElf);
        }

        let machine = ehdr.e_machine(LE);
        let arch = match machine {
            elf::EM_X86_64 => CoreArch::X86_64,
            _ => return Err(Error::UnsupportedMachine { machine }),
        };

        let e_type = ehdr.e_type(LE);
        if e_type != elf::ET_CORE {
            return Err(Error::NotACore { e_type });
        }

        let file_len = reader.len().map_err(|()| Error::ReadHeader)?;
        let phdrs = ehdr
            .program_headers(LE, &reader)
            .map_err(Error::ProgramHeaders)?;

        let mut segments = Vec::new();
        let mut notes = Vec::new();
        let mut unknown_notes = 0;

        for phdr in phdrs {
            match phdr.p_type(LE) {
                elf::PT_LOAD => {
                    let segment = parse_load(phdr, file_len)?;
                    match segment {
                        Some(segment) => segments.push(segment),
                        None => {
                            tracing::debug!("skipping empty PT_LOAD");
                        }
                    }
                }
                elf::PT_NOTE => {
                    parse_notes(phdr, &reader, &mut notes, &mut unknown_notes);
                }
                other => {
                    tracing::debug!(p_type = other, "ignoring program header");
                }
            }
        }

        segments.sort_by_key(|s| s.phys_start);
        for pair in segments.windows(2) {
            if pair[1].phys_start < pair[0].phys_end() {
                return Err(Error::OverlappingSegments {
                    first: pair[0].phys_start,
                    second: pair[1].phys_start,
                });
            }
        }
        if segments.is_empty() {
            return Err(Error::NoLoadSegments);
        }

        tracing::debug!(
            %arch,
            segments = segments.len(),
            notes = notes.len(),
            unknown_notes,
            "parsed core file"
        );

        Ok(Self {
            arch,
            segments,
            notes,
            unknown_notes,
        })
    }

    pub fn arch(&self) -> CoreArch {
        self.arch
    }

    /// The load segments, sorted by physical start address.
    pub fn segments(&self) -> &[LoadSegment] {
        &self.segments
    }

    pub fn notes(&self) -> &[CoreNote] {
        &self.notes
    }

    /// The number of notes that were recorded but not interpreted.
    pub fn unknown_notes(&self) -> usize {
        self.unknown_notes
    }

    fn notes_of<'a>(&'a self, name: &'a str, n_type: u32) -> impl Iterator<Item = &'a CoreNote> + 'a {
        self.notes
            .iter()
            .filter(move |n| n.name == name && n.n_type == n_type)
    }

    /// The anchor note that seeds symbolic decoding.
    pub fn crash_info(&self) -> Result<XenCrashInfo, Error> {
        let note = self
            .notes_of(xendefs::NOTE_NAME_XEN, xendefs::XEN_ELFNOTE_CRASH_INFO)
            .next()
            .ok_or(Error::MissingNote {
                name: xendefs::NOTE_NAME_XEN,
                n_type: xendefs::XEN_ELFNOTE_CRASH_INFO,
            })?;
        let (info, _) =
            XenCrashInfo::read_from_prefix(&note.desc).map_err(|_| Error::TruncatedNote {
                name: note.name.clone(),
                n_type: note.n_type,
            })?;
        Ok(info)
    }

    /// The per-PCPU `NT_PRSTATUS` register snapshots, in note order.
    pub fn prstatus(&self) -> Result<Vec<ElfPrstatus>, Error> {
        self.notes_of(NOTE_NAME_CORE, elf::NT_PRSTATUS)
            .map(|note| {
                ElfPrstatus::read_from_prefix(&note.desc)
                    .map(|(status, _)| status)
                    .map_err(|_| Error::TruncatedNote {
                        name: note.name.clone(),
                        n_type: note.n_type,
                    })
            })
            .collect()
    }

    /// The per-PCPU crash-regs notes, in note order, paired positionally
    /// with [`Self::prstatus`].
    pub fn crash_regs(&self) -> Vec<&CoreNote> {
        self.notes_of(xendefs::NOTE_NAME_XEN, xendefs::XEN_ELFNOTE_CRASH_REGS)
            .collect()
    }
}

fn parse_load(
    phdr: &elf::ProgramHeader64<LE>,
    file_len: u64,
) -> Result<Option<LoadSegment>, Error> {
    let offset = phdr.p_offset(LE);
    let length = phdr.p_filesz(LE);
    if length == 0 {
        return Ok(None);
    }

    let bounds = Error::SegmentBounds { offset, length };
    let end = offset.checked_add(length).ok_or(bounds)?;
    if end > file_len {
        return Err(Error::SegmentBounds { offset, length });
    }

    let phys_start = phdr.p_paddr(LE);
    phys_start
        .checked_add(length)
        .ok_or(Error::SegmentBounds { offset, length })?;

    let vaddr = phdr.p_vaddr(LE);
    Ok(Some(LoadSegment {
        phys_start,
        file_offset: offset,
        length,
        virt_start: (vaddr != 0).then_some(vaddr),
    }))
}

fn parse_notes<'data, R: ReadRef<'data>>(
    phdr: &elf::ProgramHeader64<LE>,
    reader: R,
    notes: &mut Vec<CoreNote>,
    unknown_notes: &mut usize,
) {
    let mut iter = match phdr.notes(LE, reader) {
        Ok(Some(iter)) => iter,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "unparseable PT_NOTE segment"
            );
            return;
        }
    };

    loop {
        let note = match iter.next() {
            Ok(Some(note)) => note,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "abandoning malformed note entry"
                );
                break;
            }
        };

        let name = String::from_utf8_lossy(note.name());
        let name = name.trim_end_matches('\0').to_owned();
        let n_type = note.n_type(LE);
        let recognised = matches!(
            (name.as_str(), n_type),
            (NOTE_NAME_CORE, elf::NT_PRSTATUS)
                | (xendefs::NOTE_NAME_XEN, xendefs::XEN_ELFNOTE_CRASH_INFO)
                | (xendefs::NOTE_NAME_XEN, xendefs::XEN_ELFNOTE_CRASH_REGS)
        );
        if !recognised {
            *unknown_notes += 1;
            tracing::debug!(name, n_type, "recording unknown note");
        }
        notes.push(CoreNote {
            name,
            n_type,
            desc: note.desc().to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zerocopy::FromZeros;
    use zerocopy::IntoBytes;

    struct Phdr {
        p_type: u32,
        offset: u64,
        vaddr: u64,
        paddr: u64,
        filesz: u64,
    }

    fn make_elf(phdrs: &[Phdr], e_type: u16, machine: u16, payload: &[(u64, Vec<u8>)]) -> Vec<u8> {
        let mut out = vec![
            0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        out.extend_from_slice(&e_type.to_le_bytes());
        out.extend_from_slice(&machine.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes()); // e_version
        out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        out.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        out.extend_from_slice(&(phdrs.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

        for p in phdrs {
            out.extend_from_slice(&p.p_type.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // p_flags
            out.extend_from_slice(&p.offset.to_le_bytes());
            out.extend_from_slice(&p.vaddr.to_le_bytes());
            out.extend_from_slice(&p.paddr.to_le_bytes());
            out.extend_from_slice(&p.filesz.to_le_bytes());
            out.extend_from_slice(&p.filesz.to_le_bytes()); // p_memsz
            out.extend_from_slice(&0u64.to_le_bytes()); // p_align
        }

        for (offset, bytes) in payload {
            let offset = *offset as usize;
            if out.len() < offset + bytes.len() {
                out.resize(offset + bytes.len(), 0);
            }
            out[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        out
    }

    fn make_note(name: &str, n_type: u32, desc: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(name.len() as u32 + 1).to_le_bytes());
        out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        out.extend_from_slice(&n_type.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(desc);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    fn anchor_note() -> Vec<u8> {
        let mut info = XenCrashInfo::new_zeroed();
        info.cpu_count = 1;
        info.version_major = 4;
        info.version_minor = 4;
        info.version_extra[..2].copy_from_slice(b".0");
        make_note(xendefs::NOTE_NAME_XEN, xendefs::XEN_ELFNOTE_CRASH_INFO, info.as_bytes())
    }

    #[test]
    fn parses_minimal_core() {
        let mut note_seg = anchor_note();
        note_seg.extend(make_note("CORE", elf::NT_PRSTATUS, &[0u8; 336]));
        note_seg.extend(make_note("GNU", 0xdead, b"x"));
        let note_len = note_seg.len() as u64;
        let bytes = make_elf(
            &[
                Phdr { p_type: elf::PT_LOAD, offset: 0x1000, vaddr: 0, paddr: 0, filesz: 0x1000 },
                Phdr { p_type: elf::PT_NOTE, offset: 0x2000, vaddr: 0, paddr: 0, filesz: note_len },
            ],
            elf::ET_CORE,
            elf::EM_X86_64,
            &[(0x1000, vec![0xaa; 0x1000]), (0x2000, note_seg)],
        );
        let file = write_temp(&bytes);
        let core = CoreFile::open(file.path()).unwrap();

        assert_eq!(core.arch(), CoreArch::X86_64);
        assert_eq!(core.segments().len(), 1);
        assert_eq!(core.segments()[0].length, 0x1000);
        assert_eq!(core.unknown_notes(), 1);

        let info = core.crash_info().unwrap();
        assert_eq!(info.cpu_count, 1);
        assert_eq!(info.version().to_string(), "4.4.0");
        assert_eq!(core.prstatus().unwrap().len(), 1);
    }

    #[test]
    fn rejects_overlapping_segments() {
        let bytes = make_elf(
            &[
                Phdr { p_type: elf::PT_LOAD, offset: 0x1000, vaddr: 0, paddr: 0, filesz: 0x1000 },
                Phdr { p_type: elf::PT_LOAD, offset: 0x2000, vaddr: 0, paddr: 0xfff, filesz: 0x1000 },
            ],
            elf::ET_CORE,
            elf::EM_X86_64,
            &[(0x2000, vec![0; 0x1000])],
        );
        let file = write_temp(&bytes);
        let err = CoreFile::open(file.path()).unwrap_err();
        assert!(matches!(err, Error::OverlappingSegments { .. }));
    }

    #[test]
    fn rejects_unsupported_machine() {
        let bytes = make_elf(
            &[Phdr { p_type: elf::PT_LOAD, offset: 0x1000, vaddr: 0, paddr: 0, filesz: 0x10 }],
            elf::ET_CORE,
            elf::EM_AARCH64,
            &[(0x1000, vec![0; 0x10])],
        );
        let file = write_temp(&bytes);
        let err = CoreFile::open(file.path()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedMachine { machine } if machine == elf::EM_AARCH64));
    }

    #[test]
    fn rejects_non_core() {
        let bytes = make_elf(
            &[Phdr { p_type: elf::PT_LOAD, offset: 0x1000, vaddr: 0, paddr: 0, filesz: 0x10 }],
            elf::ET_EXEC,
            elf::EM_X86_64,
            &[(0x1000, vec![0; 0x10])],
        );
        let file = write_temp(&bytes);
        let err = CoreFile::open(file.path()).unwrap_err();
        assert!(matches!(err, Error::NotACore { .. }));
    }

    #[test]
    fn rejects_empty_and_truncated() {
        let bytes = make_elf(&[], elf::ET_CORE, elf::EM_X86_64, &[]);
        let file = write_temp(&bytes);
        let err = CoreFile::open(file.path()).unwrap_err();
        assert!(matches!(err, Error::NoLoadSegments));

        // filesz runs past the end of the file.
        let bytes = make_elf(
            &[Phdr { p_type: elf::PT_LOAD, offset: 0x1000, vaddr: 0, paddr: 0, filesz: 0x10000 }],
            elf::ET_CORE,
            elf::EM_X86_64,
            &[(0x1000, vec![0; 0x10])],
        );
        let file = write_temp(&bytes);
        let err = CoreFile::open(file.path()).unwrap_err();
        assert!(matches!(err, Error::SegmentBounds { .. }));
    }

    #[test]
    fn missing_anchor_note() {
        let bytes = make_elf(
            &[Phdr { p_type: elf::PT_LOAD, offset: 0x1000, vaddr: 0, paddr: 0, filesz: 0x10 }],
            elf::ET_CORE,
            elf::EM_X86_64,
            &[(0x1000, vec![0; 0x10])],
        );
        let file = write_temp(&bytes);
        let core = CoreFile::open(file.path()).unwrap();
        assert!(matches!(core.crash_info(), Err(Error::MissingNote { .. })));
    }
}
