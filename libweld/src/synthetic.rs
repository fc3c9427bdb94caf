//! The fixed set of synthetic output sections and their slot allocation.
//!
//! Relocation scanning records which auxiliary resources each symbol needs;
//! the serial allocation walk then calls into this module to hand out GOT
//! slots, PLT entries, dynamic symbol table indices and copy-relocation
//! reservations. Only sizes, indices and record contents are computed here;
//! writing the bytes of most of these sections into the output image is the
//! output writer's job.

use crate::args::Args;
use crate::args::BuildIdKind;
use crate::elf::COPYREL_ALIGNMENT;
use crate::elf::GOT_ENTRY_SIZE;
use crate::elf::PLT_ENTRY_SIZE;
use crate::elf::RELA_ENTRY_SIZE;
use crate::elf::SYMTAB_ENTRY_SIZE;
use crate::elf::SectionHeader;
use crate::elf::VERSYM_ENTRY_SIZE;
use crate::elf::elf_hash;
use crate::alignment::align_to;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use hashbrown::HashMap;
use object::LittleEndian as LE;
use object::U16;
use object::U32;
use object::elf;
use object::pod::bytes_of;

const VERDEF_RECORD_SIZE: u32 = 20 + 8;
const VERNEED_SIZE: u32 = 16;
const VERNAUX_SIZE: u32 = 16;
const DYNAMIC_ENTRY_SIZE: u64 = 16;

/// Name and materialized header of one synthetic section.
#[derive(Debug)]
pub struct SyntheticSection {
    pub name: &'static [u8],
    pub shdr: SectionHeader,
}

impl SyntheticSection {
    fn new(name: &'static [u8], sh_type: u32, sh_flags: u64, align: u64) -> SyntheticSection {
        SyntheticSection {
            name,
            shdr: SectionHeader {
                sh_type,
                sh_flags,
                sh_addralign: align,
                ..SectionHeader::default()
            },
        }
    }

    fn with_entsize(mut self, entsize: u64) -> SyntheticSection {
        self.shdr.sh_entsize = entsize;
        self
    }

    fn with_size(mut self, size: u64) -> SyntheticSection {
        self.shdr.sh_size = size;
        self
    }
}

/// One slot of the global offset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotEntry {
    /// Address of the symbol.
    Got(SymbolId),
    /// Offset of the symbol from the thread pointer.
    GotTpOff(SymbolId),
    /// Module id + offset pair for general-dynamic TLS.
    TlsGd(SymbolId),
    /// TLS descriptor pair.
    TlsDesc(SymbolId),
    /// The module id + offset pair shared by all local-dynamic TLS access.
    TlsLd,
}

/// String table under construction. Identical strings share one offset.
#[derive(Debug)]
pub struct StringTable {
    contents: Vec<u8>,
    offsets: HashMap<Vec<u8>, u32>,
}

impl StringTable {
    fn new() -> StringTable {
        StringTable {
            contents: vec![0],
            offsets: HashMap::new(),
        }
    }

    pub(crate) fn add_string(&mut self, string: &[u8]) -> u32 {
        if string.is_empty() {
            return 0;
        }
        if let Some(offset) = self.offsets.get(string) {
            return *offset;
        }
        let offset = self.contents.len() as u32;
        self.contents.extend_from_slice(string);
        self.contents.push(0);
        self.offsets.insert(string.to_vec(), offset);
        offset
    }

    pub(crate) fn get(&self, string: &[u8]) -> Option<u32> {
        self.offsets.get(string).copied()
    }

    pub fn len(&self) -> u64 {
        self.contents.len() as u64
    }
}

/// An entry of one `.gnu.version_r` group, before serialization.
pub(crate) struct VerneedEntry<'a> {
    pub version: &'a [u8],
    pub idx: u16,
}

pub struct SyntheticSections {
    pub got: SyntheticSection,
    pub gotplt: SyntheticSection,
    pub plt: SyntheticSection,
    pub pltgot: SyntheticSection,
    pub relplt: SyntheticSection,
    pub reldyn: SyntheticSection,
    pub dynsym: SyntheticSection,
    pub dynstr_sec: SyntheticSection,
    pub strtab: SyntheticSection,
    pub shstrtab: SyntheticSection,
    pub symtab: SyntheticSection,
    pub dynamic: SyntheticSection,
    pub eh_frame: SyntheticSection,
    pub dynbss: SyntheticSection,
    pub dynbss_relro: SyntheticSection,
    pub versym: SyntheticSection,
    pub verneed: SyntheticSection,
    pub interp: Option<SyntheticSection>,
    pub buildid: Option<SyntheticSection>,
    pub eh_frame_hdr: Option<SyntheticSection>,
    pub hash: Option<SyntheticSection>,
    pub gnu_hash: Option<SyntheticSection>,
    pub verdef: Option<SyntheticSection>,

    pub got_entries: Vec<GotEntry>,
    pub tlsld_slot: Option<u32>,
    pub plt_syms: Vec<SymbolId>,
    pub pltgot_syms: Vec<SymbolId>,
    /// Dynamic symbol table contents; index 0 is the null entry.
    pub dynsym_syms: Vec<SymbolId>,
    pub dynstr: StringTable,
    pub copyrel_syms: Vec<SymbolId>,
    pub copyrel_relro_syms: Vec<SymbolId>,
    pub versym_contents: Vec<u16>,
    pub verdef_contents: Vec<u8>,
    pub verneed_contents: Vec<u8>,
}

impl SyntheticSections {
    pub(crate) fn new(args: &Args) -> SyntheticSections {
        let alloc = u64::from(elf::SHF_ALLOC);
        let write = u64::from(elf::SHF_WRITE);
        let exec = u64::from(elf::SHF_EXECINSTR);

        SyntheticSections {
            got: SyntheticSection::new(b".got", elf::SHT_PROGBITS, alloc | write, 8),
            // The first three .got.plt slots are reserved for the dynamic
            // loader.
            gotplt: SyntheticSection::new(b".got.plt", elf::SHT_PROGBITS, alloc | write, 8)
                .with_size(3 * GOT_ENTRY_SIZE),
            // The PLT starts with its resolver header entry.
            plt: SyntheticSection::new(b".plt", elf::SHT_PROGBITS, alloc | exec, 16)
                .with_size(PLT_ENTRY_SIZE),
            pltgot: SyntheticSection::new(b".plt.got", elf::SHT_PROGBITS, alloc | exec, 8),
            relplt: SyntheticSection::new(b".rela.plt", elf::SHT_RELA, alloc, 8)
                .with_entsize(RELA_ENTRY_SIZE),
            reldyn: SyntheticSection::new(b".rela.dyn", elf::SHT_RELA, alloc, 8)
                .with_entsize(RELA_ENTRY_SIZE),
            dynsym: SyntheticSection::new(b".dynsym", elf::SHT_DYNSYM, alloc, 8)
                .with_entsize(SYMTAB_ENTRY_SIZE)
                .with_size(SYMTAB_ENTRY_SIZE),
            dynstr_sec: SyntheticSection::new(b".dynstr", elf::SHT_STRTAB, alloc, 1).with_size(1),
            strtab: SyntheticSection::new(b".strtab", elf::SHT_STRTAB, 0, 1).with_size(1),
            shstrtab: SyntheticSection::new(b".shstrtab", elf::SHT_STRTAB, 0, 1).with_size(1),
            symtab: SyntheticSection::new(b".symtab", elf::SHT_SYMTAB, 0, 8)
                .with_entsize(SYMTAB_ENTRY_SIZE)
                .with_size(SYMTAB_ENTRY_SIZE),
            dynamic: SyntheticSection::new(b".dynamic", elf::SHT_DYNAMIC, alloc | write, 8)
                .with_entsize(DYNAMIC_ENTRY_SIZE),
            eh_frame: SyntheticSection::new(b".eh_frame", elf::SHT_PROGBITS, alloc, 8),
            dynbss: SyntheticSection::new(
                b".dynbss",
                elf::SHT_NOBITS,
                alloc | write,
                COPYREL_ALIGNMENT,
            ),
            dynbss_relro: SyntheticSection::new(
                b".dynbss.rel.ro",
                elf::SHT_NOBITS,
                alloc | write,
                COPYREL_ALIGNMENT,
            ),
            versym: SyntheticSection::new(b".gnu.version", elf::SHT_GNU_VERSYM, alloc, 2)
                .with_entsize(VERSYM_ENTRY_SIZE),
            verneed: SyntheticSection::new(b".gnu.version_r", elf::SHT_GNU_VERNEED, alloc, 8),
            interp: args.dynamic_linker.as_ref().map(|path| {
                SyntheticSection::new(b".interp", elf::SHT_PROGBITS, alloc, 1)
                    .with_size(path.len() as u64 + 1)
            }),
            buildid: (args.build_id != BuildIdKind::None).then(|| {
                // Note header, "GNU\0", then the digest.
                SyntheticSection::new(b".note.gnu.build-id", elf::SHT_NOTE, alloc, 4)
                    .with_size(16 + args.build_id.digest_size())
            }),
            eh_frame_hdr: args.eh_frame_hdr.then(|| {
                SyntheticSection::new(b".eh_frame_hdr", elf::SHT_PROGBITS, alloc, 4).with_size(12)
            }),
            hash: args.hash_style_sysv.then(|| {
                SyntheticSection::new(b".hash", elf::SHT_HASH, alloc, 4).with_entsize(4)
            }),
            gnu_hash: args
                .hash_style_gnu
                .then(|| SyntheticSection::new(b".gnu.hash", elf::SHT_GNU_HASH, alloc, 8)),
            verdef: (!args.version_definitions.is_empty())
                .then(|| SyntheticSection::new(b".gnu.version_d", elf::SHT_GNU_VERDEF, alloc, 8)),

            got_entries: Vec::new(),
            tlsld_slot: None,
            plt_syms: Vec::new(),
            pltgot_syms: Vec::new(),
            dynsym_syms: vec![SymbolId::UNDEFINED],
            dynstr: StringTable::new(),
            copyrel_syms: Vec::new(),
            copyrel_relro_syms: Vec::new(),
            versym_contents: Vec::new(),
            verdef_contents: Vec::new(),
            verneed_contents: Vec::new(),
        }
    }

    /// Appends a symbol to `.dynsym`, growing `.dynstr` with its name.
    /// Idempotent per symbol.
    pub(crate) fn add_dynsym(&mut self, db: &SymbolDb, id: SymbolId) {
        let sym = db.symbol(id);
        if sym.dynsym_idx().is_some() {
            return;
        }
        sym.set_dynsym_idx(self.dynsym_syms.len() as u32);
        self.dynsym_syms.push(id);
        self.dynsym.shdr.sh_size += SYMTAB_ENTRY_SIZE;
        self.dynstr.add_string(sym.name);
        self.dynstr_sec.shdr.sh_size = self.dynstr.len();
    }

    fn alloc_got_slots(&mut self, count: u64) -> u32 {
        let slot = self.got.shdr.sh_size / GOT_ENTRY_SIZE;
        self.got.shdr.sh_size += count * GOT_ENTRY_SIZE;
        slot as u32
    }

    /// Allocates a regular GOT slot. Imported symbols and position
    /// independent outputs need a dynamic relocation for it.
    pub(crate) fn add_got_symbol(&mut self, db: &SymbolDb, id: SymbolId, pic: bool) {
        let sym = db.symbol(id);
        if sym.got_idx().is_some() {
            return;
        }
        sym.set_got_idx(self.alloc_got_slots(1));
        self.got_entries.push(GotEntry::Got(id));
        if sym.is_imported() || pic {
            self.reldyn.shdr.sh_size += RELA_ENTRY_SIZE;
        }
    }

    pub(crate) fn add_gottpoff_symbol(&mut self, db: &SymbolDb, id: SymbolId, pic: bool) {
        let sym = db.symbol(id);
        if sym.gottpoff_idx().is_some() {
            return;
        }
        sym.set_gottpoff_idx(self.alloc_got_slots(1));
        self.got_entries.push(GotEntry::GotTpOff(id));
        if sym.is_imported() || pic {
            self.reldyn.shdr.sh_size += RELA_ENTRY_SIZE;
        }
    }

    pub(crate) fn add_tlsgd_symbol(&mut self, db: &SymbolDb, id: SymbolId, pic: bool) {
        let sym = db.symbol(id);
        if sym.tlsgd_idx().is_some() {
            return;
        }
        sym.set_tlsgd_idx(self.alloc_got_slots(2));
        self.got_entries.push(GotEntry::TlsGd(id));
        if sym.is_imported() || pic {
            self.reldyn.shdr.sh_size += 2 * RELA_ENTRY_SIZE;
        }
    }

    pub(crate) fn add_tlsdesc_symbol(&mut self, db: &SymbolDb, id: SymbolId) {
        let sym = db.symbol(id);
        if sym.tlsdesc_idx().is_some() {
            return;
        }
        sym.set_tlsdesc_idx(self.alloc_got_slots(2));
        self.got_entries.push(GotEntry::TlsDesc(id));
        self.reldyn.shdr.sh_size += RELA_ENTRY_SIZE;
    }

    /// Allocates the module-wide local-dynamic TLS slot pair. All users
    /// share one.
    pub(crate) fn add_tlsld(&mut self, pic: bool) {
        if self.tlsld_slot.is_some() {
            return;
        }
        self.tlsld_slot = Some(self.alloc_got_slots(2));
        self.got_entries.push(GotEntry::TlsLd);
        if pic {
            self.reldyn.shdr.sh_size += RELA_ENTRY_SIZE;
        }
    }

    /// Appends a PLT entry together with its `.got.plt` slot and
    /// `.rela.plt` record.
    pub(crate) fn add_plt_symbol(&mut self, db: &SymbolDb, id: SymbolId) {
        let sym = db.symbol(id);
        if sym.plt_idx().is_some() {
            return;
        }
        sym.set_plt_idx((self.plt.shdr.sh_size / PLT_ENTRY_SIZE) as u32);
        self.plt_syms.push(id);
        self.plt.shdr.sh_size += PLT_ENTRY_SIZE;
        self.gotplt.shdr.sh_size += GOT_ENTRY_SIZE;
        self.relplt.shdr.sh_size += RELA_ENTRY_SIZE;
    }

    /// The combined form used when a symbol needs both GOT and PLT: the
    /// stub jumps through the already-allocated GOT slot, so no `.got.plt`
    /// slot or JUMP_SLOT relocation is required.
    pub(crate) fn add_pltgot_symbol(&mut self, db: &SymbolDb, id: SymbolId) {
        let sym = db.symbol(id);
        if sym.plt_idx().is_some() {
            return;
        }
        sym.set_plt_idx((self.pltgot.shdr.sh_size / GOT_ENTRY_SIZE) as u32);
        self.pltgot_syms.push(id);
        self.pltgot.shdr.sh_size += GOT_ENTRY_SIZE;
    }

    /// Reserves a copy-relocation slot of `size` bytes. Returns the offset
    /// of the slot within the chosen `.dynbss` section, which becomes the
    /// symbol's value.
    pub(crate) fn add_copy_relocation(
        &mut self,
        db: &SymbolDb,
        id: SymbolId,
        size: u64,
        readonly: bool,
    ) -> u64 {
        let sym = db.symbol(id);
        sym.set_has_copyrel();
        sym.set_copyrel_readonly(readonly);
        let (sec, list) = if readonly {
            (&mut self.dynbss_relro, &mut self.copyrel_relro_syms)
        } else {
            (&mut self.dynbss, &mut self.copyrel_syms)
        };
        let offset = align_to(sec.shdr.sh_size, COPYREL_ALIGNMENT);
        sec.shdr.sh_size = offset + size.max(1);
        list.push(id);
        self.reldyn.shdr.sh_size += RELA_ENTRY_SIZE;
        offset
    }

    /// Grows `.gnu.version` to cover the current dynsym population. Entry 0
    /// stays 0; everything else defaults to the global version.
    pub(crate) fn ensure_versym(&mut self) {
        let len = self.dynsym_syms.len();
        if self.versym_contents.len() < len {
            self.versym_contents.resize(len, elf::VER_NDX_GLOBAL);
        }
        if let Some(first) = self.versym_contents.first_mut() {
            *first = 0;
        }
        self.versym.shdr.sh_size = self.versym_contents.len() as u64 * VERSYM_ENTRY_SIZE;
    }

    /// Builds `.gnu.version_d`: the base definition carrying the output's
    /// identity, then one record per user-defined version.
    pub(crate) fn build_verdef(&mut self, base_name: &[u8], version_definitions: &[String]) {
        let mut records: Vec<(u16, u16, Vec<u8>)> = Vec::new();
        records.push((elf::VER_FLG_BASE, 1, base_name.to_vec()));
        for (i, name) in version_definitions.iter().enumerate() {
            records.push((0, i as u16 + 2, name.as_bytes().to_vec()));
        }

        let mut contents = Vec::with_capacity(records.len() * VERDEF_RECORD_SIZE as usize);
        let count = records.len();
        for (i, (flags, idx, name)) in records.into_iter().enumerate() {
            let is_last = i + 1 == count;
            let verdef = elf::Verdef::<LE> {
                vd_version: U16::new(LE, 1),
                vd_flags: U16::new(LE, flags),
                vd_ndx: U16::new(LE, idx),
                vd_cnt: U16::new(LE, 1),
                vd_hash: U32::new(LE, elf_hash(&name)),
                vd_aux: U32::new(LE, 20),
                vd_next: U32::new(LE, if is_last { 0 } else { VERDEF_RECORD_SIZE }),
            };
            let verdaux = elf::Verdaux::<LE> {
                vda_name: U32::new(LE, self.dynstr.add_string(&name)),
                vda_next: U32::new(LE, 0),
            };
            contents.extend_from_slice(bytes_of(&verdef));
            contents.extend_from_slice(bytes_of(&verdaux));
        }

        self.dynstr_sec.shdr.sh_size = self.dynstr.len();
        if let Some(verdef) = &mut self.verdef {
            verdef.shdr.sh_size = contents.len() as u64;
            verdef.shdr.sh_info = count as u32;
        }
        self.verdef_contents = contents;
    }

    /// Serializes `.gnu.version_r` from the per-library groups assembled by
    /// the verneed pass.
    pub(crate) fn build_verneed(&mut self, groups: &[(Vec<u8>, Vec<(Vec<u8>, u16)>)]) {
        let mut contents = Vec::new();
        for (group_index, (soname, entries)) in groups.iter().enumerate() {
            let group_is_last = group_index + 1 == groups.len();
            let group_size = VERNEED_SIZE + VERNAUX_SIZE * entries.len() as u32;
            let verneed = elf::Verneed::<LE> {
                vn_version: U16::new(LE, 1),
                vn_cnt: U16::new(LE, entries.len() as u16),
                vn_file: U32::new(LE, self.dynstr.add_string(soname)),
                vn_aux: U32::new(LE, VERNEED_SIZE),
                vn_next: U32::new(LE, if group_is_last { 0 } else { group_size }),
            };
            contents.extend_from_slice(bytes_of(&verneed));
            for (entry_index, (version, idx)) in entries.iter().enumerate() {
                let entry_is_last = entry_index + 1 == entries.len();
                let vernaux = elf::Vernaux::<LE> {
                    vna_hash: U32::new(LE, elf_hash(version)),
                    vna_flags: U16::new(LE, 0),
                    vna_other: U16::new(LE, *idx),
                    vna_name: U32::new(LE, self.dynstr.add_string(version)),
                    vna_next: U32::new(LE, if entry_is_last { 0 } else { VERNAUX_SIZE }),
                };
                contents.extend_from_slice(bytes_of(&vernaux));
            }
        }

        self.dynstr_sec.shdr.sh_size = self.dynstr.len();
        self.verneed.shdr.sh_size = contents.len() as u64;
        self.verneed.shdr.sh_info = groups.len() as u32;
        self.verneed_contents = contents;
    }

    /// Recomputes sizes that depend on the final dynsym population.
    pub(crate) fn update_hash_sizes(&mut self, num_needed_libs: usize) {
        let n = self.dynsym_syms.len() as u64;
        if let Some(hash) = &mut self.hash {
            hash.shdr.sh_size = 4 * (2 + n + n);
        }
        if let Some(gnu_hash) = &mut self.gnu_hash {
            // Header, one bloom word, one bucket per symbol, one chain
            // entry per non-null symbol.
            gnu_hash.shdr.sh_size = 16 + 8 + 4 * n + 4 * (n - 1);
        }
        // DT_NEEDED per library plus the fixed tag block and the
        // terminator.
        let mut dynamic_entries = num_needed_libs as u64 + 20;
        if self.verdef.is_some() {
            dynamic_entries += 2;
        }
        if self.verneed.shdr.sh_size > 0 {
            dynamic_entries += 2;
        }
        self.dynamic.shdr.sh_size = dynamic_entries * DYNAMIC_ENTRY_SIZE;
    }
}
