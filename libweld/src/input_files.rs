//! In-memory form of already-parsed input files: relocatable objects and
//! shared libraries. The ELF reader (external to this crate) produces these;
//! the passes mutate the resolution-related parts.

use crate::elf::Visibility;
use crate::merged_sections::MergedSectionId;
use crate::output_sections::OutputSectionId;
use crate::symbol_db::FileKind;
use crate::symbol_db::ProviderKind;
use crate::symbol_db::SymbolCandidate;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolProvider;
use smallvec::SmallVec;
use std::fmt::Display;
use std::ops::Range;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;

/// Identifies an interned COMDAT group key.
#[derive(Clone, Copy, derive_more::Debug, PartialEq, Eq)]
#[debug("comdat-{_0}")]
pub struct ComdatGroupId(pub(crate) u32);

/// Where an input symbol is defined, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolSection {
    Undefined,
    Absolute,
    Common,
    Section(u32),
}

/// One entry of an input file's symbol table, decoded by the reader.
#[derive(Debug, Clone)]
pub struct InputSymbol<'data> {
    pub name: &'data [u8],
    pub st_bind: u8,
    pub st_type: u8,
    pub visibility: Visibility,
    pub section: SymbolSection,
    pub value: u64,
    pub size: u64,
}

impl<'data> InputSymbol<'data> {
    pub fn defined(name: &'data [u8], shndx: u32) -> InputSymbol<'data> {
        InputSymbol {
            name,
            st_bind: object::elf::STB_GLOBAL,
            st_type: object::elf::STT_NOTYPE,
            visibility: Visibility::Default,
            section: SymbolSection::Section(shndx),
            value: 0,
            size: 0,
        }
    }

    pub fn undefined(name: &'data [u8]) -> InputSymbol<'data> {
        InputSymbol {
            name,
            st_bind: object::elf::STB_GLOBAL,
            st_type: object::elf::STT_NOTYPE,
            visibility: Visibility::Default,
            section: SymbolSection::Undefined,
            value: 0,
            size: 0,
        }
    }

    pub fn common(name: &'data [u8], size: u64, alignment: u64) -> InputSymbol<'data> {
        InputSymbol {
            name,
            st_bind: object::elf::STB_GLOBAL,
            st_type: object::elf::STT_OBJECT,
            visibility: Visibility::Default,
            section: SymbolSection::Common,
            value: alignment,
            size,
        }
    }

    pub fn with_binding(mut self, st_bind: u8) -> InputSymbol<'data> {
        self.st_bind = st_bind;
        self
    }

    pub fn with_type(mut self, st_type: u8) -> InputSymbol<'data> {
        self.st_type = st_type;
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> InputSymbol<'data> {
        self.visibility = visibility;
        self
    }

    pub fn with_value(mut self, value: u64) -> InputSymbol<'data> {
        self.value = value;
        self
    }

    pub fn is_undefined(&self) -> bool {
        self.section == SymbolSection::Undefined
    }

    pub fn is_defined(&self) -> bool {
        !self.is_undefined()
    }

    pub fn is_common(&self) -> bool {
        self.section == SymbolSection::Common
    }

    pub fn is_absolute(&self) -> bool {
        self.section == SymbolSection::Absolute
    }

    pub fn is_weak(&self) -> bool {
        self.st_bind == object::elf::STB_WEAK
    }

    pub(crate) fn section_index(&self) -> Option<u32> {
        match self.section {
            SymbolSection::Section(n) => Some(n),
            _ => None,
        }
    }
}

/// One relocation record. `symbol` indexes the containing file's symbol
/// table.
#[derive(Debug, Clone, Copy)]
pub struct Rela {
    pub offset: u64,
    pub r_type: u32,
    pub symbol: u32,
    pub addend: i64,
}

/// An input section owned by one object file, assigned to an output section
/// when the file was read.
#[derive(Debug)]
pub struct InputSection<'data> {
    pub name: &'data [u8],
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_size: u64,
    pub sh_addralign: u64,
    pub output_section: OutputSectionId,
    /// Offset within the output section, assigned by section sizing.
    pub offset: AtomicU64,
    pub relocations: Vec<Rela>,
}

/// A reference from an object file to a fragment of a merge section.
#[derive(Debug, Clone, Copy)]
pub struct FragmentRef {
    pub section: MergedSectionId,
    pub fragment: u32,
}

pub struct ObjectFile<'data> {
    pub name: String,
    pub archive_name: Option<String>,
    pub is_in_lib: bool,
    pub exclude_libs: bool,
    pub priority: u32,
    pub is_alive: AtomicBool,
    pub first_global: usize,
    pub elf_syms: Vec<InputSymbol<'data>>,
    /// Interned ids, parallel to `elf_syms`. Entries below `first_global`
    /// are the undefined sentinel; locals don't participate in resolution.
    pub symbols: Vec<SymbolId>,
    pub sections: Vec<Option<InputSection<'data>>>,
    pub fragments: Vec<FragmentRef>,
    /// Version suffix per global symbol (`name@ver`); a leading `@` marks
    /// the default-version form (`name@@ver`).
    pub symvers: Vec<Option<&'data [u8]>>,
    pub comdat_groups: Vec<(ComdatGroupId, SmallVec<[u32; 4]>)>,
}

impl<'data> ObjectFile<'data> {
    pub fn new(name: impl Into<String>, archive_name: Option<String>) -> ObjectFile<'data> {
        let is_in_lib = archive_name.is_some();
        ObjectFile {
            name: name.into(),
            archive_name,
            is_in_lib,
            exclude_libs: false,
            priority: 0,
            is_alive: AtomicBool::new(!is_in_lib),
            first_global: 0,
            elf_syms: Vec::new(),
            symbols: Vec::new(),
            sections: Vec::new(),
            fragments: Vec::new(),
            symvers: Vec::new(),
            comdat_groups: Vec::new(),
        }
    }

    pub(crate) fn global_indices(&self) -> Range<usize> {
        self.first_global..self.elf_syms.len()
    }

    fn provider(&self, kind: ProviderKind) -> SymbolProvider {
        SymbolProvider {
            kind,
            file_kind: FileKind::Object,
            priority: self.priority,
        }
    }

    fn candidate(&self, esym: &InputSymbol<'data>, kind: ProviderKind) -> SymbolCandidate {
        SymbolCandidate {
            provider: self.provider(kind),
            value: esym.value,
            shndx: esym.section_index().unwrap_or(0),
            is_weak: esym.is_weak(),
            visibility: esym.visibility,
            st_type: esym.st_type,
        }
    }

    /// Publishes this archive member's defined globals as lazy candidates:
    /// a name is bound to this file without making the file alive.
    pub(crate) fn resolve_lazy_symbols(&self, db: &SymbolDb<'data>) {
        for i in self.global_indices() {
            let esym = &self.elf_syms[i];
            if esym.is_defined() {
                db.symbol(self.symbols[i])
                    .resolve(self.candidate(esym, ProviderKind::Lazy));
            }
        }
    }

    /// Registers this file's defined globals under the standard rule:
    /// stronger binding beats weaker, lower priority breaks ties.
    pub(crate) fn resolve_regular_symbols(&self, db: &SymbolDb<'data>) {
        for i in self.global_indices() {
            let esym = &self.elf_syms[i];
            if esym.is_defined() {
                db.symbol(self.symbols[i])
                    .resolve(self.candidate(esym, ProviderKind::Definition));
            }
        }
    }

    /// Resets globals still bound to this file. Called for files that were
    /// never pulled into the link.
    pub(crate) fn clear_dead_symbols(&self, db: &SymbolDb<'data>) {
        for i in self.global_indices() {
            let sym = db.symbol(self.symbols[i]);
            if sym.owned_by(FileKind::Object, self.priority) {
                sym.clear();
            }
        }
    }

    pub(crate) fn owns_symbol(&self, db: &SymbolDb<'data>, index: usize) -> bool {
        db.symbol(self.symbols[index])
            .owned_by(FileKind::Object, self.priority)
    }
}

impl Display for ObjectFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.archive_name {
            Some(archive) => write!(f, "{}({})", archive, self.name),
            None => f.write_str(&self.name),
        }
    }
}

pub struct SharedFile<'data> {
    pub soname: String,
    pub priority: u32,
    pub is_alive: AtomicBool,
    pub elf_syms: Vec<InputSymbol<'data>>,
    pub symbols: Vec<SymbolId>,
    /// Per-symbol version index into `version_names`, parallel to
    /// `elf_syms`. Zero means unversioned.
    pub versym: Vec<u16>,
    /// Version strings of this library, indexed by version index. The two
    /// reserved indices are unused.
    pub version_names: Vec<&'data [u8]>,
    /// Names this library refers to but doesn't define, interned when the
    /// file is added to the link.
    pub undefs: Vec<SymbolId>,
    /// Address ranges the library maps read-only. Used to decide where a
    /// copy-relocated object must be placed.
    pub readonly_ranges: Vec<Range<u64>>,
}

impl<'data> SharedFile<'data> {
    pub fn new(soname: impl Into<String>) -> SharedFile<'data> {
        SharedFile {
            soname: soname.into(),
            priority: 0,
            is_alive: AtomicBool::new(false),
            elf_syms: Vec::new(),
            symbols: Vec::new(),
            versym: Vec::new(),
            version_names: Vec::new(),
            undefs: Vec::new(),
            readonly_ranges: Vec::new(),
        }
    }

    /// Exports this library's defined symbols, weaker than any object
    /// definition. The winning library also stamps its version index on the
    /// symbol.
    pub(crate) fn resolve_symbols(&self, db: &SymbolDb<'data>) {
        for (i, esym) in self.elf_syms.iter().enumerate() {
            if !esym.is_defined() {
                continue;
            }
            let sym = db.symbol(self.symbols[i]);
            let won = sym.resolve(SymbolCandidate {
                provider: SymbolProvider {
                    kind: ProviderKind::Definition,
                    file_kind: FileKind::Dso,
                    priority: self.priority,
                },
                value: esym.value,
                shndx: 0,
                is_weak: esym.is_weak(),
                visibility: esym.visibility,
                st_type: esym.st_type,
            });
            if won {
                sym.set_ver_idx(
                    self.versym
                        .get(i)
                        .copied()
                        .unwrap_or(object::elf::VER_NDX_GLOBAL),
                );
            }
        }
    }

    pub(crate) fn clear_dead_symbols(&self, db: &SymbolDb<'data>) {
        for &id in &self.symbols {
            let sym = db.symbol(id);
            if sym.owned_by(FileKind::Dso, self.priority) {
                sym.clear();
            }
        }
    }

    /// Returns symbols of this library defined at the same address as
    /// `sym_index`, excluding the symbol itself. Uses the library-side
    /// addresses, which stay valid after the symbol's value is rewritten to
    /// its copy-relocation slot.
    pub(crate) fn find_aliases(&self, db: &SymbolDb<'data>, sym_index: usize) -> Vec<SymbolId> {
        let value = self.elf_syms[sym_index].value;
        self.elf_syms
            .iter()
            .enumerate()
            .filter(|(i, esym)| {
                *i != sym_index
                    && esym.is_defined()
                    && esym.value == value
                    && db
                        .symbol(self.symbols[*i])
                        .owned_by(FileKind::Dso, self.priority)
            })
            .map(|(i, _)| self.symbols[i])
            .collect()
    }

    pub(crate) fn is_readonly(&self, value: u64) -> bool {
        self.readonly_ranges.iter().any(|r| r.contains(&value))
    }

    /// The version string recorded for a symbol, if it has one past the
    /// reserved indices.
    pub(crate) fn version_name(&self, sym_index: usize) -> Option<&'data [u8]> {
        let idx = self.versym.get(sym_index).copied().unwrap_or(0) & !object::elf::VERSYM_HIDDEN;
        self.version_names.get(usize::from(idx)).copied()
    }

    /// Index of `id` within this library's symbol list.
    pub(crate) fn symbol_index(&self, id: SymbolId) -> Option<usize> {
        self.symbols.iter().position(|&s| s == id)
    }
}

impl Display for SharedFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.soname)
    }
}
