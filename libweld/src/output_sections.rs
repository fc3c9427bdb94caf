//! Output-side section model: regular output sections fed by input
//! sections, the chunk records that make up the final image, and the rank
//! function that orders chunks into the required segment layout.

use crate::elf::SectionHeader;
use object::elf;

#[derive(Clone, Copy, derive_more::Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[debug("osec-{_0}")]
pub struct OutputSectionId(pub(crate) u32);

impl OutputSectionId {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A reference to one input section: index of the owning object in the
/// compacted object list, plus the section's index within that object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRef {
    pub file: u32,
    pub section: u32,
}

/// A regular output section: the concatenation of the input sections that
/// share its name, type and flags.
pub struct OutputSection<'data> {
    pub name: &'data [u8],
    pub shdr: SectionHeader,
    pub members: Vec<SectionRef>,
}

impl<'data> OutputSection<'data> {
    pub(crate) fn new(name: &'data [u8], sh_type: u32, sh_flags: u64) -> OutputSection<'data> {
        OutputSection {
            name,
            shdr: SectionHeader {
                sh_type,
                sh_flags,
                sh_addralign: 1,
                ..SectionHeader::default()
            },
            members: Vec::new(),
        }
    }
}

/// Roles of the fixed synthetic chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticKind {
    Got,
    GotPlt,
    Plt,
    PltGot,
    RelPlt,
    RelDyn,
    Dynsym,
    Dynstr,
    Strtab,
    Shstrtab,
    Symtab,
    Dynamic,
    Interp,
    BuildId,
    EhFrame,
    EhFrameHdr,
    Hash,
    GnuHash,
    Verdef,
    Verneed,
    Versym,
    Dynbss,
    DynbssRelro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Header,
    Regular,
    Synthetic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSource {
    Ehdr,
    Phdr,
    Shdr,
    Regular(OutputSectionId),
    Merged(crate::merged_sections::MergedSectionId),
    Synthetic(SyntheticKind),
}

/// One record of the final image: a header, a regular/merged output
/// section, or a synthetic section, with the section header being
/// materialized for it.
#[derive(Debug)]
pub struct OutputChunk<'data> {
    pub name: &'data [u8],
    pub kind: ChunkKind,
    pub shdr: SectionHeader,
    pub shndx: u32,
    pub new_page: bool,
    pub new_page_end: bool,
    pub source: ChunkSource,
}

impl<'data> OutputChunk<'data> {
    pub(crate) fn new(
        name: &'data [u8],
        kind: ChunkKind,
        shdr: SectionHeader,
        source: ChunkSource,
    ) -> OutputChunk<'data> {
        OutputChunk {
            name,
            kind,
            shdr,
            shndx: 0,
            new_page: false,
            new_page_end: false,
            source,
        }
    }

    /// Whether the loader must keep this chunk read-only after relocation
    /// (the RELRO region).
    pub(crate) fn is_relro(&self) -> bool {
        matches!(
            self.shdr.sh_type,
            elf::SHT_INIT_ARRAY | elf::SHT_FINI_ARRAY | elf::SHT_PREINIT_ARRAY
        ) || matches!(
            self.name,
            b".dynamic" | b".got" | b".ctors" | b".dtors" | b".dynbss.rel.ro"
        ) || self.name.starts_with(b".data.rel.ro")
    }
}

/// Ranks chunks so that a single sort yields the segment layout:
///
///   ELF header, program header, .interp, notes,
///   alloc r/o data, alloc r/o code, tdata, tbss,
///   RELRO data, RELRO bss, data, bss, non-alloc, section header.
pub(crate) fn section_rank(chunk: &OutputChunk) -> u32 {
    match chunk.source {
        ChunkSource::Ehdr => return 0,
        ChunkSource::Phdr => return 1,
        ChunkSource::Synthetic(SyntheticKind::Interp) => return 2,
        ChunkSource::Shdr => return 1 << 20,
        _ => {}
    }

    let shdr = &chunk.shdr;
    if shdr.sh_type == elf::SHT_NOTE {
        return 3;
    }
    if !shdr.is_alloc() {
        return (1 << 20) - 1;
    }

    let writable = shdr.sh_flags & u64::from(elf::SHF_WRITE) != 0;
    let exec = shdr.sh_flags & u64::from(elf::SHF_EXECINSTR) != 0;
    let tls = shdr.is_tls();
    let relro = chunk.is_relro();
    let hasbits = !shdr.is_nobits();

    (u32::from(writable) << 9
        | u32::from(exec) << 8
        | u32::from(!tls) << 7
        | u32::from(!relro) << 6
        | u32::from(!hasbits) << 5)
        + 4
}
