//! The shared state threaded through the pass pipeline: the input file
//! lists, the symbol database, the output/merged section registries, the
//! synthetic sections, and the final chunk list.

use crate::args::Args;
use crate::diagnostics::DiagnosticSink;
use crate::elf::output_section_name;
use crate::input_files::ComdatGroupId;
use crate::input_files::InputSection;
use crate::input_files::ObjectFile;
use crate::input_files::SharedFile;
use crate::merged_sections::MergedSection;
use crate::merged_sections::MergedSectionId;
use crate::output_sections::OutputChunk;
use crate::output_sections::OutputSection;
use crate::output_sections::OutputSectionId;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::synthetic::SyntheticSections;
use bumpalo_herd::Herd;
use hashbrown::HashMap;
use object::elf;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;

/// Flags that don't participate in output section identity.
const OSEC_FLAGS_MASK: u64 = !(elf::SHF_GROUP as u64
    | elf::SHF_MERGE as u64
    | elf::SHF_STRINGS as u64
    | elf::SHF_COMPRESSED as u64
    | elf::SHF_LINK_ORDER as u64);

/// A registered COMDAT group key. `owner` holds the priority of the object
/// that won the group, `u32::MAX` while unclaimed.
pub(crate) struct ComdatGroup {
    pub owner: AtomicU32,
}

/// Which master list a file lives in, by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileRef {
    Obj(usize),
    Dso(usize),
}

/// Interned ids of the linker-defined symbols bound by synthetic symbol
/// fixup.
pub(crate) struct InternalSymbols {
    pub bss_start: SymbolId,
    pub ehdr_start: SymbolId,
    pub executable_start: SymbolId,
    pub rela_iplt_start: SymbolId,
    pub rela_iplt_end: SymbolId,
    pub init_array_start: SymbolId,
    pub init_array_end: SymbolId,
    pub fini_array_start: SymbolId,
    pub fini_array_end: SymbolId,
    pub end: SymbolId,
    pub etext: SymbolId,
    pub edata: SymbolId,
    pub dynamic: SymbolId,
    pub global_offset_table: SymbolId,
    pub gnu_eh_frame_hdr: SymbolId,
}

impl InternalSymbols {
    fn intern(db: &mut SymbolDb<'_>) -> InternalSymbols {
        InternalSymbols {
            bss_start: db.intern(b"__bss_start"),
            ehdr_start: db.intern(b"__ehdr_start"),
            executable_start: db.intern(b"__executable_start"),
            rela_iplt_start: db.intern(b"__rela_iplt_start"),
            rela_iplt_end: db.intern(b"__rela_iplt_end"),
            init_array_start: db.intern(b"__init_array_start"),
            init_array_end: db.intern(b"__init_array_end"),
            fini_array_start: db.intern(b"__fini_array_start"),
            fini_array_end: db.intern(b"__fini_array_end"),
            end: db.intern(b"_end"),
            etext: db.intern(b"_etext"),
            edata: db.intern(b"_edata"),
            dynamic: db.intern(b"_DYNAMIC"),
            global_offset_table: db.intern(b"_GLOBAL_OFFSET_TABLE_"),
            gnu_eh_frame_hdr: db.intern(b"__GNU_EH_FRAME_HDR"),
        }
    }
}

pub struct Context<'data> {
    pub arg: Args,
    pub cmdline_args: Vec<String>,
    pub objs: Vec<ObjectFile<'data>>,
    pub dsos: Vec<SharedFile<'data>>,
    pub symbol_db: SymbolDb<'data>,
    pub diagnostics: DiagnosticSink,
    pub output_sections: Vec<OutputSection<'data>>,
    osec_by_key: HashMap<(&'data [u8], u32, u64), OutputSectionId>,
    pub merged_sections: Vec<MergedSection<'data>>,
    merged_by_key: HashMap<(&'data [u8], u32, u64), MergedSectionId>,
    pub(crate) comdat_groups: Vec<ComdatGroup>,
    comdat_by_name: HashMap<&'data [u8], ComdatGroupId>,
    pub synthetic: SyntheticSections,
    /// The output chunks in their final layout order. Assembled once
    /// sections are sized, before offset assignment.
    pub chunks: Vec<OutputChunk<'data>>,
    pub(crate) internal_syms: InternalSymbols,
    file_by_priority: HashMap<u32, FileRef>,
    herd: &'data Herd,
}

impl<'data> Context<'data> {
    pub fn new(arg: Args, cmdline_args: Vec<String>, herd: &'data Herd) -> Context<'data> {
        let mut symbol_db = SymbolDb::new();
        let internal_syms = InternalSymbols::intern(&mut symbol_db);
        let synthetic = SyntheticSections::new(&arg);
        Context {
            arg,
            cmdline_args,
            objs: Vec::new(),
            dsos: Vec::new(),
            symbol_db,
            diagnostics: DiagnosticSink::default(),
            output_sections: Vec::new(),
            osec_by_key: HashMap::new(),
            merged_sections: Vec::new(),
            merged_by_key: HashMap::new(),
            comdat_groups: Vec::new(),
            comdat_by_name: HashMap::new(),
            synthetic,
            chunks: Vec::new(),
            internal_syms,
            file_by_priority: HashMap::new(),
            herd,
        }
    }

    /// Copies `bytes` into the run-long arena.
    pub(crate) fn alloc_bytes(&self, bytes: &[u8]) -> &'data [u8] {
        self.herd.get().alloc_slice_copy(bytes)
    }

    /// Registers `file` with the link, interning its global symbol names.
    pub fn add_object(&mut self, mut file: ObjectFile<'data>) -> usize {
        file.symbols = file
            .elf_syms
            .iter()
            .enumerate()
            .map(|(i, esym)| {
                if i < file.first_global {
                    SymbolId::UNDEFINED
                } else {
                    self.symbol_db.intern(esym.name)
                }
            })
            .collect();
        let num_globals = file.elf_syms.len() - file.first_global;
        if file.symvers.len() < num_globals {
            file.symvers.resize(num_globals, None);
        }
        self.objs.push(file);
        self.objs.len() - 1
    }

    /// Registers a shared library, interning both its exports and the names
    /// it refers to.
    pub fn add_dso(&mut self, mut file: SharedFile<'data>, undefs: &[&'data [u8]]) -> usize {
        file.symbols = file
            .elf_syms
            .iter()
            .map(|esym| self.symbol_db.intern(esym.name))
            .collect();
        file.undefs = undefs
            .iter()
            .map(|&name| self.symbol_db.intern(name))
            .collect();
        self.dsos.push(file);
        self.dsos.len() - 1
    }

    /// The regular output section that input sections with this
    /// name/type/flags combination feed.
    pub fn output_section_for(
        &mut self,
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
    ) -> OutputSectionId {
        let name = output_section_name(name);
        let sh_flags = sh_flags & OSEC_FLAGS_MASK;
        *self
            .osec_by_key
            .entry((name, sh_type, sh_flags))
            .or_insert_with(|| {
                let id = OutputSectionId(self.output_sections.len() as u32);
                self.output_sections
                    .push(OutputSection::new(name, sh_type, sh_flags));
                id
            })
    }

    pub fn merged_section_for(
        &mut self,
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
    ) -> MergedSectionId {
        let sh_flags = sh_flags & OSEC_FLAGS_MASK;
        *self
            .merged_by_key
            .entry((name, sh_type, sh_flags))
            .or_insert_with(|| {
                let id = MergedSectionId(self.merged_sections.len() as u32);
                self.merged_sections
                    .push(MergedSection::new(name, sh_type, sh_flags));
                id
            })
    }

    pub fn merged_section(&self, id: MergedSectionId) -> &MergedSection<'data> {
        &self.merged_sections[id.as_usize()]
    }

    pub fn merged_section_mut(&mut self, id: MergedSectionId) -> &mut MergedSection<'data> {
        &mut self.merged_sections[id.as_usize()]
    }

    pub fn intern_comdat(&mut self, name: &'data [u8]) -> ComdatGroupId {
        *self.comdat_by_name.entry(name).or_insert_with(|| {
            let id = ComdatGroupId(self.comdat_groups.len() as u32);
            self.comdat_groups.push(ComdatGroup {
                owner: AtomicU32::new(u32::MAX),
            });
            id
        })
    }

    /// Convenience constructor wiring an input section to its output
    /// section.
    pub fn new_input_section(
        &mut self,
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
        sh_size: u64,
        sh_addralign: u64,
    ) -> InputSection<'data> {
        let output_section = self.output_section_for(name, sh_type, sh_flags);
        InputSection {
            name,
            sh_type,
            sh_flags,
            sh_size,
            sh_addralign,
            output_section,
            offset: AtomicU64::new(0),
            relocations: Vec::new(),
        }
    }

    /// Rebuilt after priority assignment and after each compaction of the
    /// file lists; symbol providers address files by priority.
    pub(crate) fn rebuild_file_index(&mut self) {
        self.file_by_priority.clear();
        for (i, file) in self.objs.iter().enumerate() {
            self.file_by_priority.insert(file.priority, FileRef::Obj(i));
        }
        for (i, file) in self.dsos.iter().enumerate() {
            self.file_by_priority.insert(file.priority, FileRef::Dso(i));
        }
    }

    pub(crate) fn file_by_priority(&self, priority: u32) -> Option<FileRef> {
        self.file_by_priority.get(&priority).copied()
    }

    pub(crate) fn file_display(&self, priority: u32) -> String {
        match self.file_by_priority(priority) {
            Some(FileRef::Obj(i)) => self.objs[i].to_string(),
            Some(FileRef::Dso(i)) => self.dsos[i].to_string(),
            None => format!("<file {priority}>"),
        }
    }

    /// Whether the output will be loaded by a dynamic linker.
    pub(crate) fn is_dynamic_output(&self) -> bool {
        self.arg.shared || !self.dsos.is_empty() || self.arg.dynamic_linker.is_some()
    }
}
