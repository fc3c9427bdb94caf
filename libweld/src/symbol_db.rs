//! The global symbol interner and per-symbol resolution state.
//!
//! Every distinct global name in the link gets exactly one `Symbol` record,
//! addressed by a `SymbolId`. Resolution fields that parallel passes race on
//! sit behind a per-symbol mutex; the requirement flags and auxiliary table
//! indices are atomics so that relocation scanning can OR bits in from many
//! workers at once.

use crate::elf::Visibility;
use hashbrown::HashMap;
use std::fmt::Display;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;

/// An ID for an interned symbol. ID 0 is reserved for the undefined symbol.
#[derive(Clone, Copy, derive_more::Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[debug("sym-{_0}")]
pub struct SymbolId(u32);

impl SymbolId {
    pub(crate) const UNDEFINED: SymbolId = SymbolId(0);

    pub(crate) fn from_usize(raw: usize) -> SymbolId {
        SymbolId(raw as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Auxiliary resources a symbol was found to need during relocation
/// scanning. Slot allocation consumes these in a deterministic serial walk.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SymbolFlags(u32);

impl SymbolFlags {
    pub const NEEDS_DYNSYM: SymbolFlags = SymbolFlags(1 << 0);
    pub const NEEDS_GOT: SymbolFlags = SymbolFlags(1 << 1);
    pub const NEEDS_PLT: SymbolFlags = SymbolFlags(1 << 2);
    pub const NEEDS_GOTTPOFF: SymbolFlags = SymbolFlags(1 << 3);
    pub const NEEDS_TLSGD: SymbolFlags = SymbolFlags(1 << 4);
    pub const NEEDS_TLSDESC: SymbolFlags = SymbolFlags(1 << 5);
    pub const NEEDS_TLSLD: SymbolFlags = SymbolFlags(1 << 6);
    pub const NEEDS_COPYREL: SymbolFlags = SymbolFlags(1 << 7);

    pub(crate) fn empty() -> SymbolFlags {
        SymbolFlags(0)
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn contains(self, other: SymbolFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SymbolFlags {
    type Output = SymbolFlags;

    fn bitor(self, rhs: SymbolFlags) -> SymbolFlags {
        SymbolFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for SymbolFlags {
    fn bitor_assign(&mut self, rhs: SymbolFlags) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for SymbolFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (SymbolFlags::NEEDS_DYNSYM, "DYNSYM"),
            (SymbolFlags::NEEDS_GOT, "GOT"),
            (SymbolFlags::NEEDS_PLT, "PLT"),
            (SymbolFlags::NEEDS_GOTTPOFF, "GOTTPOFF"),
            (SymbolFlags::NEEDS_TLSGD, "TLSGD"),
            (SymbolFlags::NEEDS_TLSDESC, "TLSDESC"),
            (SymbolFlags::NEEDS_TLSLD, "TLSLD"),
            (SymbolFlags::NEEDS_COPYREL, "COPYREL"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct AtomicSymbolFlags(AtomicU32);

impl AtomicSymbolFlags {
    pub(crate) fn fetch_or(&self, flags: SymbolFlags) -> SymbolFlags {
        SymbolFlags(self.0.fetch_or(flags.0, Relaxed))
    }

    pub(crate) fn load(&self) -> SymbolFlags {
        SymbolFlags(self.0.load(Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Object,
    Dso,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// A real definition in the providing file.
    Definition,
    /// A candidate definition in an archive member that hasn't been pulled
    /// into the link yet.
    Lazy,
    /// A weak reference nothing defined, finalized to value zero by the
    /// lowest-priority referencing file.
    WeakUndef,
}

/// The file currently bound as the provider of a symbol. Files are
/// identified by their link-wide priority, which stays stable across the
/// compaction of the file lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolProvider {
    pub kind: ProviderKind,
    pub file_kind: FileKind,
    pub priority: u32,
}

/// Mutable resolution state, guarded by the per-symbol mutex.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymbolResolution {
    pub provider: Option<SymbolProvider>,
    pub value: u64,
    pub shndx: u32,
    pub is_weak: bool,
}

impl SymbolResolution {
    /// Binding strength. Lower is stronger; priority breaks ties within a
    /// rank. Object definitions beat DSO definitions, which beat lazy
    /// archive candidates.
    fn rank(&self) -> (u32, u32) {
        let Some(provider) = self.provider else {
            return (4, u32::MAX);
        };
        let class = match (provider.kind, provider.file_kind) {
            (ProviderKind::Definition, FileKind::Object) => {
                if self.is_weak {
                    1
                } else {
                    0
                }
            }
            (ProviderKind::Definition, FileKind::Dso) => 2,
            (ProviderKind::Lazy | ProviderKind::WeakUndef, _) => 3,
        };
        (class, provider.priority)
    }
}

/// A definition offered to `Symbol::resolve` by one input file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SymbolCandidate {
    pub provider: SymbolProvider,
    pub value: u64,
    pub shndx: u32,
    pub is_weak: bool,
    pub visibility: Visibility,
    pub st_type: u8,
}

pub struct Symbol<'data> {
    pub name: &'data [u8],
    res: Mutex<SymbolResolution>,
    pub(crate) flags: AtomicSymbolFlags,
    ver_idx: AtomicU16,
    visibility: AtomicU8,
    st_type: AtomicU8,
    is_imported: AtomicBool,
    is_exported: AtomicBool,
    has_copyrel: AtomicBool,
    copyrel_readonly: AtomicBool,
    dynsym_idx: AtomicI32,
    got_idx: AtomicI32,
    gottpoff_idx: AtomicI32,
    tlsgd_idx: AtomicI32,
    tlsdesc_idx: AtomicI32,
    plt_idx: AtomicI32,
}

const NO_INDEX: i32 = -1;

impl<'data> Symbol<'data> {
    fn new(name: &'data [u8]) -> Symbol<'data> {
        Symbol {
            name,
            res: Mutex::default(),
            flags: AtomicSymbolFlags::default(),
            ver_idx: AtomicU16::new(object::elf::VER_NDX_GLOBAL),
            visibility: AtomicU8::new(0),
            st_type: AtomicU8::new(0),
            is_imported: AtomicBool::new(false),
            is_exported: AtomicBool::new(false),
            has_copyrel: AtomicBool::new(false),
            copyrel_readonly: AtomicBool::new(false),
            dynsym_idx: AtomicI32::new(NO_INDEX),
            got_idx: AtomicI32::new(NO_INDEX),
            gottpoff_idx: AtomicI32::new(NO_INDEX),
            tlsgd_idx: AtomicI32::new(NO_INDEX),
            tlsdesc_idx: AtomicI32::new(NO_INDEX),
            plt_idx: AtomicI32::new(NO_INDEX),
        }
    }

    /// Offers `candidate` as the symbol's binding. The candidate wins if it
    /// is stronger than the current binding under the `(rank, priority)`
    /// order. Returns whether it won.
    pub(crate) fn resolve(&self, candidate: SymbolCandidate) -> bool {
        let mut res = self.res.lock().unwrap();
        let new = SymbolResolution {
            provider: Some(candidate.provider),
            value: candidate.value,
            shndx: candidate.shndx,
            is_weak: candidate.is_weak,
        };
        if new.rank() < res.rank() {
            *res = new;
            self.visibility
                .store(candidate.visibility as u8, Relaxed);
            self.st_type.store(candidate.st_type, Relaxed);
            true
        } else {
            false
        }
    }

    /// Forgets the binding. Used when the providing file turned out to be
    /// dead so that later passes see the symbol as undefined.
    pub(crate) fn clear(&self) {
        *self.res.lock().unwrap() = SymbolResolution::default();
    }

    pub fn resolution(&self) -> SymbolResolution {
        *self.res.lock().unwrap()
    }

    pub(crate) fn provider(&self) -> Option<SymbolProvider> {
        self.res.lock().unwrap().provider
    }

    pub(crate) fn owned_by(&self, file_kind: FileKind, priority: u32) -> bool {
        self.provider()
            .is_some_and(|p| p.file_kind == file_kind && p.priority == priority)
    }

    pub(crate) fn clear_weak(&self) {
        self.res.lock().unwrap().is_weak = false;
    }

    pub(crate) fn set_value(&self, value: u64) {
        self.res.lock().unwrap().value = value;
    }

    pub(crate) fn set_value_and_shndx(&self, value: u64, shndx: u32) {
        let mut res = self.res.lock().unwrap();
        res.value = value;
        res.shndx = shndx;
    }

    /// Finalizes an unresolved weak reference to value zero. Racing claims
    /// from several referencing files converge on the lowest priority, so
    /// the outcome doesn't depend on scheduling.
    pub(crate) fn finalize_undefined_weak(&self, provider: SymbolProvider) -> bool {
        debug_assert_eq!(provider.kind, ProviderKind::WeakUndef);
        let mut res = self.res.lock().unwrap();
        let claim = match res.provider {
            None => true,
            Some(p) => p.kind == ProviderKind::WeakUndef && provider.priority < p.priority,
        };
        if claim {
            *res = SymbolResolution {
                provider: Some(provider),
                value: 0,
                shndx: 0,
                is_weak: true,
            };
        }
        claim
    }

    pub fn ver_idx(&self) -> u16 {
        self.ver_idx.load(Relaxed)
    }

    pub(crate) fn set_ver_idx(&self, ver_idx: u16) {
        self.ver_idx.store(ver_idx, Relaxed);
    }

    pub fn visibility(&self) -> Visibility {
        match self.visibility.load(Relaxed) {
            1 => Visibility::Protected,
            2 => Visibility::Hidden,
            _ => Visibility::Default,
        }
    }

    pub(crate) fn is_func(&self) -> bool {
        self.st_type.load(Relaxed) == object::elf::STT_FUNC
    }

    pub fn is_imported(&self) -> bool {
        self.is_imported.load(Relaxed)
    }

    pub(crate) fn set_imported(&self) {
        self.is_imported.store(true, Relaxed);
    }

    pub fn is_exported(&self) -> bool {
        self.is_exported.load(Relaxed)
    }

    pub(crate) fn set_exported(&self) {
        self.is_exported.store(true, Relaxed);
    }

    pub fn has_copyrel(&self) -> bool {
        self.has_copyrel.load(Relaxed)
    }

    pub(crate) fn set_has_copyrel(&self) {
        self.has_copyrel.store(true, Relaxed);
    }

    pub fn copyrel_readonly(&self) -> bool {
        self.copyrel_readonly.load(Relaxed)
    }

    pub(crate) fn set_copyrel_readonly(&self, readonly: bool) {
        self.copyrel_readonly.store(readonly, Relaxed);
    }

    pub fn dynsym_idx(&self) -> Option<u32> {
        index_of(&self.dynsym_idx)
    }

    pub(crate) fn set_dynsym_idx(&self, idx: u32) {
        self.dynsym_idx.store(idx as i32, Relaxed);
    }

    pub fn got_idx(&self) -> Option<u32> {
        index_of(&self.got_idx)
    }

    pub(crate) fn set_got_idx(&self, idx: u32) {
        self.got_idx.store(idx as i32, Relaxed);
    }

    pub fn gottpoff_idx(&self) -> Option<u32> {
        index_of(&self.gottpoff_idx)
    }

    pub(crate) fn set_gottpoff_idx(&self, idx: u32) {
        self.gottpoff_idx.store(idx as i32, Relaxed);
    }

    pub fn tlsgd_idx(&self) -> Option<u32> {
        index_of(&self.tlsgd_idx)
    }

    pub(crate) fn set_tlsgd_idx(&self, idx: u32) {
        self.tlsgd_idx.store(idx as i32, Relaxed);
    }

    pub fn tlsdesc_idx(&self) -> Option<u32> {
        index_of(&self.tlsdesc_idx)
    }

    pub(crate) fn set_tlsdesc_idx(&self, idx: u32) {
        self.tlsdesc_idx.store(idx as i32, Relaxed);
    }

    pub fn plt_idx(&self) -> Option<u32> {
        index_of(&self.plt_idx)
    }

    pub(crate) fn set_plt_idx(&self, idx: u32) {
        self.plt_idx.store(idx as i32, Relaxed);
    }
}

fn index_of(slot: &AtomicI32) -> Option<u32> {
    let raw = slot.load(Relaxed);
    (raw != NO_INDEX).then_some(raw as u32)
}

impl Display for Symbol<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&String::from_utf8_lossy(self.name), f)
    }
}

pub struct SymbolDb<'data> {
    name_to_id: HashMap<&'data [u8], SymbolId>,
    symbols: Vec<Symbol<'data>>,
}

impl<'data> SymbolDb<'data> {
    pub(crate) fn new() -> SymbolDb<'data> {
        SymbolDb {
            name_to_id: HashMap::new(),
            symbols: vec![Symbol::new(b"")],
        }
    }

    pub fn intern(&mut self, name: &'data [u8]) -> SymbolId {
        *self.name_to_id.entry(name).or_insert_with(|| {
            let id = SymbolId::from_usize(self.symbols.len());
            self.symbols.push(Symbol::new(name));
            id
        })
    }

    pub fn get(&self, name: &[u8]) -> Option<SymbolId> {
        self.name_to_id.get(name).copied()
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol<'data> {
        &self.symbols[id.as_usize()]
    }
}
