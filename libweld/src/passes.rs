//! The link-time passes: the ordered sequence that resolves symbols,
//! decides file liveness, de-duplicates COMDAT groups, bins and sizes
//! output sections, scans relocations to materialize the synthetic tables,
//! applies symbol versions, and assigns file offsets and virtual addresses.
//!
//! Passes are internally parallel but strictly ordered with respect to each
//! other; each one assumes the invariants established by its predecessors.
//! The complete layout is a pure function of the inputs and the argument
//! record, independent of thread count.

use crate::alignment::align_to;
use crate::alignment::align_with_skew;
use crate::context::Context;
use crate::context::FileRef;
use crate::elf::EHDR_SIZE;
use crate::elf::PHDR_ENTRY_SIZE;
use crate::elf::SHDR_ENTRY_SIZE;
use crate::elf::SectionHeader;
use crate::elf::VER_NDX_LAST_RESERVED;
use crate::elf::Visibility;
use crate::elf::is_c_identifier;
use crate::error::Result;
use crate::glob::GlobPattern;
use crate::input_files::InputSection;
use crate::input_files::SymbolSection;
use crate::output_sections::ChunkKind;
use crate::output_sections::ChunkSource;
use crate::output_sections::OutputChunk;
use crate::output_sections::OutputSectionId;
use crate::output_sections::SectionRef;
use crate::output_sections::SyntheticKind;
use crate::output_sections::section_rank;
use crate::symbol_db::FileKind;
use crate::symbol_db::ProviderKind;
use crate::symbol_db::SymbolFlags;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolProvider;
use crate::synthetic::SyntheticSections;
use crate::target::RelocSymbolInfo;
use crate::target::Target;
use foldhash::HashSet;
use hashbrown::HashMap;
use itertools::Itertools;
use object::elf;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// Runs the pipeline over a populated context. Returns the total file size
/// of the laid-out image.
pub fn run_passes<T: Target>(ctx: &mut Context) -> Result<u64> {
    apply_exclude_libs(ctx);
    create_synthetic_sections(ctx);
    set_file_priority(ctx);
    resolve_obj_symbols(ctx);
    resolve_dso_symbols(ctx);
    eliminate_comdats(ctx);
    convert_common_symbols(ctx);
    compute_merged_section_sizes(ctx);
    bin_sections(ctx);
    check_duplicate_symbols(ctx)?;
    compute_section_sizes(ctx);
    convert_undefined_weak_symbols(ctx);
    scan_rels::<T>(ctx)?;
    apply_version_script(ctx);
    parse_symbol_version(ctx)?;
    compute_import_export(ctx);
    fill_verdef(ctx);
    fill_verneed(ctx);
    assemble_chunks::<T>(ctx);
    let filesize = set_osec_offsets::<T>(ctx);
    fix_synthetic_symbols(ctx);
    Ok(filesize)
}

/// Marks objects pulled from archives named in `--exclude-libs` as
/// non-exporting. The effect is applied when import/export is computed.
#[tracing::instrument(skip_all, name = "Apply exclude-libs")]
pub fn apply_exclude_libs(ctx: &mut Context) {
    if ctx.arg.exclude_libs.is_empty() {
        return;
    }

    let set: HashSet<&str> = ctx.arg.exclude_libs.iter().map(String::as_str).collect();
    let exclude_all = set.contains("ALL");

    for file in &mut ctx.objs {
        if let Some(archive) = &file.archive_name {
            if exclude_all || set.contains(archive.as_str()) {
                file.exclude_libs = true;
            }
        }
    }
}

/// Allocates the fixed set of synthetic output chunks for the configured
/// output kind.
#[tracing::instrument(skip_all, name = "Create synthetic sections")]
pub fn create_synthetic_sections(ctx: &mut Context) {
    ctx.synthetic = SyntheticSections::new(&ctx.arg);
}

/// Assigns the total order used for resolution tie-breaks: priority 1 is
/// reserved for the internal file, then command-line objects, then archive
/// members, then shared libraries.
#[tracing::instrument(skip_all, name = "Set file priority")]
pub fn set_file_priority(ctx: &mut Context) {
    let mut priority = 2;
    for file in ctx.objs.iter_mut().filter(|f| !f.is_in_lib) {
        file.priority = priority;
        priority += 1;
    }
    for file in ctx.objs.iter_mut().filter(|f| f.is_in_lib) {
        file.priority = priority;
        priority += 1;
    }
    for file in &mut ctx.dsos {
        file.priority = priority;
        priority += 1;
    }
    ctx.rebuild_file_index();
}

/// Resolves defined and lazy symbols from object files, then runs the
/// liveness closure that decides which archive members join the link.
/// Unused members are removed; their symbols are reset to undefined.
#[tracing::instrument(skip_all, name = "Resolve object symbols")]
pub fn resolve_obj_symbols(ctx: &mut Context) {
    {
        let db = &ctx.symbol_db;
        ctx.objs.par_iter().for_each(|file| {
            if file.is_in_lib {
                file.resolve_lazy_symbols(db);
            }
        });
        ctx.objs.par_iter().for_each(|file| {
            if !file.is_in_lib {
                file.resolve_regular_symbols(db);
            }
        });
    }

    // Roots of the liveness closure: files that are live from the start,
    // plus providers of names forced with --undefined.
    let mut roots: Vec<usize> = (0..ctx.objs.len())
        .filter(|&i| ctx.objs[i].is_alive.load(Relaxed))
        .collect();

    for name in ctx.arg.undefined.clone() {
        let name = ctx.alloc_bytes(name.as_bytes());
        let id = ctx.symbol_db.intern(name);
        let Some(provider) = ctx.symbol_db.symbol(id).provider() else {
            continue;
        };
        if let Some(FileRef::Obj(i)) = ctx.file_by_priority(provider.priority) {
            if !ctx.objs[i].is_alive.swap(true, Relaxed) {
                roots.push(i);
            }
        }
    }

    {
        let shared = &*ctx;
        rayon::scope(|scope| {
            for index in roots {
                scope.spawn(move |scope| mark_live_objects(shared, index, scope));
            }
        });
    }

    let db = &ctx.symbol_db;
    ctx.objs.par_iter().for_each(|file| {
        if !file.is_alive.load(Relaxed) {
            file.clear_dead_symbols(db);
        }
    });

    ctx.objs.retain(|file| file.is_alive.load(Relaxed));
    ctx.rebuild_file_index();
}

/// One step of the liveness worklist: a newly live object re-registers its
/// definitions eagerly (archive members were only registered lazily), then
/// spawns a task for every dead archive member that satisfies one of its
/// non-weak undefined references. The `is_alive` swap guarantees each file
/// is admitted at most once.
fn mark_live_objects<'data, 'scope>(
    ctx: &'scope Context<'data>,
    index: usize,
    scope: &rayon::Scope<'scope>,
) where
    'data: 'scope,
{
    let file = &ctx.objs[index];
    if file.is_in_lib {
        file.resolve_regular_symbols(&ctx.symbol_db);
    }

    for i in file.global_indices() {
        let esym = &file.elf_syms[i];
        if !esym.is_undefined() || esym.is_weak() {
            continue;
        }
        let sym = ctx.symbol_db.symbol(file.symbols[i]);
        let Some(provider) = sym.provider() else {
            continue;
        };
        if provider.file_kind != FileKind::Object {
            continue;
        }
        let Some(FileRef::Obj(target)) = ctx.file_by_priority(provider.priority) else {
            continue;
        };
        if !ctx.objs[target].is_alive.swap(true, Relaxed) {
            scope.spawn(move |scope| mark_live_objects(ctx, target, scope));
        }
    }
}

/// Resolves symbols exported by shared libraries, marks the libraries that
/// are actually referenced as alive, and drops the rest.
#[tracing::instrument(skip_all, name = "Resolve DSO symbols")]
pub fn resolve_dso_symbols(ctx: &mut Context) {
    {
        let db = &ctx.symbol_db;
        ctx.dsos.par_iter().for_each(|file| file.resolve_symbols(db));
    }

    {
        let shared = &*ctx;
        ctx.objs.par_iter().for_each(|file| {
            for i in file.global_indices() {
                let esym = &file.elf_syms[i];
                if esym.is_defined() {
                    continue;
                }
                let sym = shared.symbol_db.symbol(file.symbols[i]);
                let Some(provider) = sym.provider() else {
                    continue;
                };
                if provider.file_kind != FileKind::Dso {
                    continue;
                }
                if let Some(FileRef::Dso(d)) = shared.file_by_priority(provider.priority) {
                    shared.dsos[d].is_alive.store(true, Relaxed);
                }
                sym.set_imported();
                if !esym.is_weak() {
                    sym.clear_weak();
                }
            }
        });
    }

    let db = &ctx.symbol_db;
    ctx.dsos.par_iter().for_each(|file| {
        if !file.is_alive.load(Relaxed) {
            file.clear_dead_symbols(db);
        }
    });

    ctx.dsos.retain(|file| file.is_alive.load(Relaxed));
    ctx.rebuild_file_index();
}

/// COMDAT group de-duplication: every object first registers its group
/// keys, resolving each key to the lowest-priority holder; every object
/// then drops the member sections of the groups it lost. The two phases
/// must not overlap.
#[tracing::instrument(skip_all, name = "Eliminate COMDAT groups")]
pub fn eliminate_comdats(ctx: &mut Context) {
    {
        let groups = &ctx.comdat_groups;
        ctx.objs.par_iter().for_each(|file| {
            for (id, _) in &file.comdat_groups {
                groups[id.0 as usize].owner.fetch_min(file.priority, Relaxed);
            }
        });
    }

    let groups = &ctx.comdat_groups;
    ctx.objs.par_iter_mut().for_each(|file| {
        let priority = file.priority;
        let sections = &mut file.sections;
        for (id, members) in &file.comdat_groups {
            if groups[id.0 as usize].owner.load(Relaxed) != priority {
                for &member in members {
                    sections[member as usize] = None;
                }
            }
        }
    });
}

/// Rewrites each common symbol owned by a file into a synthesized BSS
/// input section of that file, so downstream passes only see regular
/// definitions.
#[tracing::instrument(skip_all, name = "Convert common symbols")]
pub fn convert_common_symbols(ctx: &mut Context) {
    let bss = ctx.output_section_for(
        b".common",
        elf::SHT_NOBITS,
        u64::from(elf::SHF_ALLOC | elf::SHF_WRITE),
    );

    let db = &ctx.symbol_db;
    ctx.objs.par_iter_mut().for_each(|file| {
        for i in file.first_global..file.elf_syms.len() {
            if !file.elf_syms[i].is_common() || !file.owns_symbol(db, i) {
                continue;
            }

            let shndx = file.sections.len() as u32;
            let esym = &mut file.elf_syms[i];
            // For commons, st_value holds the required alignment.
            let alignment = esym.value.max(1);
            file.sections.push(Some(InputSection {
                name: b".common",
                sh_type: elf::SHT_NOBITS,
                sh_flags: u64::from(elf::SHF_ALLOC | elf::SHF_WRITE),
                sh_size: esym.size,
                sh_addralign: alignment,
                output_section: bss,
                offset: AtomicU64::new(0),
                relocations: Vec::new(),
            }));

            let esym = &mut file.elf_syms[i];
            esym.section = SymbolSection::Section(shndx);
            esym.value = 0;
            db.symbol(file.symbols[i]).set_value_and_shndx(0, shndx);
        }
    });
}

fn add_comment_string(ctx: &mut Context, text: &str) {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    let data = ctx.alloc_bytes(&bytes);
    let id = ctx.merged_section_for(b".comment", elf::SHT_PROGBITS, 0);
    let section = ctx.merged_section_mut(id);
    let fragment = section.insert(data, 1);
    section.fragment(fragment).is_alive.store(true, Relaxed);
}

/// Marks fragments referenced by live objects, inserts the identification
/// strings into `.comment`, and assigns every merge section its
/// deterministic intra-section offsets.
#[tracing::instrument(skip_all, name = "Compute merged section sizes")]
pub fn compute_merged_section_sizes(ctx: &mut Context) {
    if !ctx.arg.gc_sections {
        let merged = &ctx.merged_sections;
        ctx.objs.par_iter().for_each(|file| {
            for frag in &file.fragments {
                merged[frag.section.as_usize()]
                    .fragment(frag.fragment)
                    .is_alive
                    .store(true, Relaxed);
            }
        });
    }

    add_comment_string(ctx, concat!("weld ", env!("CARGO_PKG_VERSION")));
    let cmdline = format!("weld command line: {}", ctx.cmdline_args.iter().join(" "));
    add_comment_string(ctx, &cmdline);

    ctx.merged_sections
        .par_iter_mut()
        .for_each(|section| section.assign_offsets());
}

/// Builds the member list of every regular output section with a two-level
/// parallel scatter: per-slice local vectors, exact capacity reservation,
/// then per-output-section appends in slice order. The slice-order append
/// is what keeps member order deterministic.
#[tracing::instrument(skip_all, name = "Bin sections")]
pub fn bin_sections(ctx: &mut Context) {
    let num_osec = ctx.output_sections.len();
    if num_osec == 0 || ctx.objs.is_empty() {
        return;
    }

    let objs = &ctx.objs;
    let unit = objs.len().div_ceil(128);
    let slices: Vec<&[crate::input_files::ObjectFile]> = objs.chunks(unit).collect();

    let groups: Vec<Vec<Vec<SectionRef>>> = slices
        .par_iter()
        .enumerate()
        .map(|(slice_index, slice)| {
            let mut local = vec![Vec::new(); num_osec];
            for (offset, file) in slice.iter().enumerate() {
                let file_index = (slice_index * unit + offset) as u32;
                for (section_index, slot) in file.sections.iter().enumerate() {
                    if let Some(isec) = slot {
                        local[isec.output_section.as_usize()].push(SectionRef {
                            file: file_index,
                            section: section_index as u32,
                        });
                    }
                }
            }
            local
        })
        .collect();

    let mut sizes = vec![0usize; num_osec];
    for group in &groups {
        for (i, members) in group.iter().enumerate() {
            sizes[i] += members.len();
        }
    }

    ctx.output_sections
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, osec)| {
            osec.members.clear();
            osec.members.reserve(sizes[i]);
            for group in &groups {
                osec.members.extend_from_slice(&group[i]);
            }
        });
}

/// Reports every pair of strong definitions of the same name in distinct
/// alive files, then aborts the link if any were found.
#[tracing::instrument(skip_all, name = "Check duplicate symbols")]
pub fn check_duplicate_symbols(ctx: &mut Context) -> Result {
    let shared = &*ctx;
    ctx.objs.par_iter().for_each(|file| {
        for i in file.global_indices() {
            let esym = &file.elf_syms[i];
            if !esym.is_defined() || esym.is_common() || esym.is_weak() {
                continue;
            }
            // Sections discarded by COMDAT elimination don't count as
            // definitions.
            let is_eliminated = match esym.section {
                SymbolSection::Section(n) => {
                    file.sections.get(n as usize).is_none_or(|s| s.is_none())
                }
                _ => false,
            };
            if is_eliminated || file.owns_symbol(&shared.symbol_db, i) {
                continue;
            }

            let sym = shared.symbol_db.symbol(file.symbols[i]);
            let owner = sym
                .provider()
                .map(|p| shared.file_display(p.priority))
                .unwrap_or_else(|| "<undefined>".to_string());
            shared
                .diagnostics
                .report(format!("duplicate symbol: {file}: {owner}: {sym}"));
        }
    });

    ctx.diagnostics.checkpoint()
}

/// Lays out input sections within each output section using a two-pass
/// parallel prefix over 10000-member slices.
#[tracing::instrument(skip_all, name = "Compute section sizes")]
pub fn compute_section_sizes(ctx: &mut Context) {
    let objs = &ctx.objs;
    ctx.output_sections.par_iter_mut().for_each(|osec| {
        if osec.members.is_empty() {
            return;
        }

        let slices: Vec<&[SectionRef]> = osec.members.chunks(10_000).collect();

        let locals: Vec<(u64, u64)> = slices
            .par_iter()
            .map(|slice| {
                let mut offset = 0;
                let mut align = 1;
                for r in *slice {
                    let Some(isec) = objs[r.file as usize].sections[r.section as usize].as_ref()
                    else {
                        continue;
                    };
                    let isec_align = isec.sh_addralign.max(1);
                    offset = align_to(offset, isec_align);
                    isec.offset.store(offset, Relaxed);
                    offset += isec.sh_size;
                    align = align.max(isec_align);
                }
                (offset, align)
            })
            .collect();

        let align = locals.iter().map(|(_, a)| *a).max().unwrap_or(1);

        let mut starts = vec![0u64; slices.len()];
        for i in 1..slices.len() {
            starts[i] = align_to(starts[i - 1] + locals[i - 1].0, align);
        }

        slices.par_iter().enumerate().for_each(|(i, slice)| {
            if i == 0 {
                return;
            }
            for r in *slice {
                if let Some(isec) = objs[r.file as usize].sections[r.section as usize].as_ref() {
                    isec.offset.fetch_add(starts[i], Relaxed);
                }
            }
        });

        osec.shdr.sh_size = starts[slices.len() - 1] + locals[slices.len() - 1].0;
        osec.shdr.sh_addralign = align;
    });
}

/// Finalizes weak references that no file ever defined: the
/// lowest-priority referencing file claims them with value zero. When the
/// output uses the dynamic loader, the symbol is additionally marked
/// imported so the loader can still interpose it.
#[tracing::instrument(skip_all, name = "Convert undefined weak symbols")]
pub fn convert_undefined_weak_symbols(ctx: &mut Context) {
    let dynamic = ctx.is_dynamic_output();
    let db = &ctx.symbol_db;
    ctx.objs.par_iter().for_each(|file| {
        for i in file.global_indices() {
            let esym = &file.elf_syms[i];
            if !esym.is_undefined() || !esym.is_weak() {
                continue;
            }
            let sym = db.symbol(file.symbols[i]);
            let claimed = sym.finalize_undefined_weak(SymbolProvider {
                kind: ProviderKind::WeakUndef,
                file_kind: FileKind::Object,
                priority: file.priority,
            });
            if claimed && dynamic {
                sym.set_imported();
            }
        }
    });
}

struct CopyrelTarget {
    size: u64,
    readonly: bool,
    aliases: Vec<SymbolId>,
}

/// Walks every relocation to record which auxiliary resources each symbol
/// needs, then allocates GOT/PLT/copyrel/TLS slots and dynamic symbol
/// table entries in one deterministic serial sweep.
#[tracing::instrument(skip_all, name = "Scan relocations")]
pub fn scan_rels<T: Target>(ctx: &mut Context) -> Result {
    let pic = ctx.arg.shared;

    {
        let shared = &*ctx;
        ctx.objs.par_iter().for_each(|file| {
            for slot in &file.sections {
                let Some(isec) = slot else { continue };
                for rel in &isec.relocations {
                    let sym_index = rel.symbol as usize;
                    if sym_index < file.first_global {
                        continue;
                    }
                    let esym = &file.elf_syms[sym_index];
                    let sym = shared.symbol_db.symbol(file.symbols[sym_index]);

                    if sym.provider().is_none() {
                        if !esym.is_weak() {
                            shared
                                .diagnostics
                                .report(format!("undefined symbol: {file}: {sym}"));
                        }
                        continue;
                    }

                    let info = RelocSymbolInfo {
                        is_imported: sym.is_imported(),
                        is_func: sym.is_func(),
                        pic,
                    };
                    match T::scan_relocation(rel.r_type, &info) {
                        Ok(mut flags) => {
                            // Any reference to an imported symbol makes it
                            // part of the dynamic symbol table.
                            if info.is_imported {
                                flags |= SymbolFlags::NEEDS_DYNSYM;
                            }
                            if !flags.is_empty() {
                                sym.flags.fetch_or(flags);
                            }
                        }
                        Err(e) => shared.diagnostics.report(format!("{file}: {e}")),
                    }
                }
            }
        });
    }

    ctx.diagnostics.checkpoint()?;

    {
        let db = &ctx.symbol_db;
        ctx.objs.par_iter().for_each(|file| {
            for i in file.global_indices() {
                if !file.owns_symbol(db, i) {
                    continue;
                }
                let sym = db.symbol(file.symbols[i]);
                if sym.is_imported() || sym.is_exported() {
                    sym.flags.fetch_or(SymbolFlags::NEEDS_DYNSYM);
                }
            }
        });
    }

    // Flagged symbols, gathered per file in parallel and flattened in file
    // order so slot indices stay deterministic.
    let db = &ctx.symbol_db;
    let per_obj: Vec<Vec<SymbolId>> = ctx
        .objs
        .par_iter()
        .map(|file| {
            file.symbols[file.first_global..]
                .iter()
                .filter(|&&id| {
                    let sym = db.symbol(id);
                    !sym.flags.load().is_empty()
                        && sym.owned_by(FileKind::Object, file.priority)
                })
                .copied()
                .collect()
        })
        .collect();
    let per_dso: Vec<Vec<SymbolId>> = ctx
        .dsos
        .par_iter()
        .map(|file| {
            file.symbols
                .iter()
                .filter(|&&id| {
                    let sym = db.symbol(id);
                    !sym.flags.load().is_empty() && sym.owned_by(FileKind::Dso, file.priority)
                })
                .copied()
                .collect()
        })
        .collect();
    let flagged: Vec<SymbolId> = per_obj
        .into_iter()
        .flatten()
        .chain(per_dso.into_iter().flatten())
        .collect();

    // Copy-relocation targets need their providing library's view: the
    // datum's size, whether its page is read-only, and its
    // address-equivalent aliases.
    let mut copyrel_targets: HashMap<SymbolId, CopyrelTarget> = HashMap::new();
    for &id in &flagged {
        let sym = ctx.symbol_db.symbol(id);
        if !sym.flags.load().contains(SymbolFlags::NEEDS_COPYREL) {
            continue;
        }
        let Some(provider) = sym.provider() else {
            continue;
        };
        debug_assert_eq!(provider.file_kind, FileKind::Dso);
        let Some(FileRef::Dso(d)) = ctx.file_by_priority(provider.priority) else {
            continue;
        };
        let dso = &ctx.dsos[d];
        let Some(index) = dso.symbol_index(id) else {
            continue;
        };
        copyrel_targets.insert(
            id,
            CopyrelTarget {
                size: dso.elf_syms[index].size,
                readonly: dso.is_readonly(dso.elf_syms[index].value),
                aliases: dso.find_aliases(&ctx.symbol_db, index),
            },
        );
    }

    let db = &ctx.symbol_db;
    let syn = &mut ctx.synthetic;
    for id in flagged {
        let flags = db.symbol(id).flags.load();

        if flags.contains(SymbolFlags::NEEDS_DYNSYM) {
            syn.add_dynsym(db, id);
        }
        if flags.contains(SymbolFlags::NEEDS_GOT) {
            syn.add_got_symbol(db, id, pic);
        }
        if flags.contains(SymbolFlags::NEEDS_PLT) {
            if flags.contains(SymbolFlags::NEEDS_GOT) {
                syn.add_pltgot_symbol(db, id);
            } else {
                syn.add_plt_symbol(db, id);
            }
        }
        if flags.contains(SymbolFlags::NEEDS_GOTTPOFF) {
            syn.add_gottpoff_symbol(db, id, pic);
        }
        if flags.contains(SymbolFlags::NEEDS_TLSGD) {
            syn.add_tlsgd_symbol(db, id, pic);
        }
        if flags.contains(SymbolFlags::NEEDS_TLSDESC) {
            syn.add_tlsdesc_symbol(db, id);
        }
        if flags.contains(SymbolFlags::NEEDS_TLSLD) {
            syn.add_tlsld(pic);
        }
        if flags.contains(SymbolFlags::NEEDS_COPYREL) {
            let Some(target) = copyrel_targets.get(&id) else {
                continue;
            };
            let offset = syn.add_copy_relocation(db, id, target.size, target.readonly);
            let sym = db.symbol(id);
            sym.set_value(offset);
            for &alias in &target.aliases {
                let alias_sym = db.symbol(alias);
                alias_sym.set_has_copyrel();
                alias_sym.set_copyrel_readonly(target.readonly);
                alias_sym.set_value(offset);
                syn.add_dynsym(db, alias);
            }
        }
    }

    Ok(())
}

/// Applies version-script patterns in declaration order; the last matching
/// pattern wins for each symbol.
#[tracing::instrument(skip_all, name = "Apply version script")]
pub fn apply_version_script(ctx: &mut Context) {
    let patterns = ctx.arg.version_patterns.clone();
    for pattern in &patterns {
        debug_assert_ne!(pattern.pattern, "*");

        if !pattern.is_extern_cpp && !pattern.pattern.contains(['*', '?', '[']) {
            let name = ctx.alloc_bytes(pattern.pattern.as_bytes());
            let id = ctx.symbol_db.intern(name);
            ctx.symbol_db.symbol(id).set_ver_idx(pattern.ver_idx);
            continue;
        }

        let glob = match GlobPattern::new(&pattern.pattern) {
            Ok(glob) => glob,
            Err(e) => {
                ctx.diagnostics
                    .report(format!("version script pattern `{}`: {e}", pattern.pattern));
                continue;
            }
        };

        let db = &ctx.symbol_db;
        ctx.objs.par_iter().for_each(|file| {
            for i in file.global_indices() {
                if !file.owns_symbol(db, i) {
                    continue;
                }
                let sym = db.symbol(file.symbols[i]);
                let matched = if pattern.is_extern_cpp {
                    std::str::from_utf8(sym.name).is_ok_and(|name| {
                        glob.matches(symbolic_demangle::demangle(name).as_bytes())
                    })
                } else {
                    glob.matches(sym.name)
                };
                if matched {
                    sym.set_ver_idx(pattern.ver_idx);
                }
            }
        });
    }
}

/// Resolves embedded version suffixes (`name@ver` / `name@@ver`) against
/// the configured version definitions. Unknown versions are errors;
/// non-default versions are marked hidden.
#[tracing::instrument(skip_all, name = "Parse symbol versions")]
pub fn parse_symbol_version(ctx: &mut Context) -> Result {
    let verdefs: HashMap<&[u8], u16> = ctx
        .arg
        .version_definitions
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_bytes(), i as u16 + VER_NDX_LAST_RESERVED + 1))
        .collect();

    let shared = &*ctx;
    ctx.objs.par_iter().for_each(|file| {
        for (offset, symver) in file.symvers.iter().enumerate() {
            let Some(mut version) = *symver else { continue };
            let index = file.first_global + offset;
            if !file.owns_symbol(&shared.symbol_db, index) {
                continue;
            }
            let sym = shared.symbol_db.symbol(file.symbols[index]);

            let is_default = version.starts_with(b"@");
            if is_default {
                version = &version[1..];
            }

            match verdefs.get(version) {
                Some(&idx) => {
                    sym.set_ver_idx(if is_default {
                        idx
                    } else {
                        idx | elf::VERSYM_HIDDEN
                    });
                }
                None => shared.diagnostics.report(format!(
                    "{file}: symbol {sym} has undefined version {}",
                    String::from_utf8_lossy(version)
                )),
            }
        }
    });

    ctx.diagnostics.checkpoint()
}

/// Marks symbols imported and exported. An executable exports what its
/// shared libraries refer to; a shared object (or `--export-dynamic`)
/// exports its non-hidden globals, and a shared object imports them too
/// unless symbolic binding applies.
#[tracing::instrument(skip_all, name = "Compute import/export")]
pub fn compute_import_export(ctx: &mut Context) {
    let shared = &*ctx;

    if !ctx.arg.shared {
        ctx.dsos.par_iter().for_each(|dso| {
            for &id in &dso.undefs {
                let sym = shared.symbol_db.symbol(id);
                let Some(provider) = sym.provider() else {
                    continue;
                };
                if provider.kind != ProviderKind::Definition
                    || provider.file_kind == FileKind::Dso
                    || sym.visibility() == Visibility::Hidden
                {
                    continue;
                }
                if let Some(FileRef::Obj(i)) = shared.file_by_priority(provider.priority) {
                    if shared.objs[i].exclude_libs {
                        continue;
                    }
                }
                sym.set_exported();
            }
        });
    }

    if ctx.arg.shared || ctx.arg.export_dynamic {
        ctx.objs.par_iter().for_each(|file| {
            if file.exclude_libs {
                return;
            }
            for i in file.global_indices() {
                if !file.owns_symbol(&shared.symbol_db, i) {
                    continue;
                }
                let sym = shared.symbol_db.symbol(file.symbols[i]);
                if sym
                    .provider()
                    .is_none_or(|p| p.kind != ProviderKind::Definition)
                {
                    continue;
                }
                if sym.visibility() == Visibility::Hidden
                    || sym.ver_idx() == elf::VER_NDX_LOCAL
                {
                    continue;
                }

                sym.set_exported();

                if shared.arg.shared
                    && sym.visibility() != Visibility::Protected
                    && !shared.arg.bsymbolic
                    && !(shared.arg.bsymbolic_functions && sym.is_func())
                {
                    sym.set_imported();
                }
            }
        });
    }
}

/// Builds `.gnu.version_d` and seeds `.gnu.version` with each dynsym
/// entry's version index.
#[tracing::instrument(skip_all, name = "Fill verdef")]
pub fn fill_verdef(ctx: &mut Context) {
    if ctx.arg.version_definitions.is_empty() {
        return;
    }

    let base_name = ctx
        .arg
        .soname
        .clone()
        .unwrap_or_else(|| ctx.arg.output.clone());
    let definitions = ctx.arg.version_definitions.clone();

    ctx.synthetic.ensure_versym();
    ctx.synthetic
        .build_verdef(base_name.as_bytes(), &definitions);

    let entries: Vec<(u32, u16)> = ctx.synthetic.dynsym_syms[1..]
        .iter()
        .filter_map(|&id| {
            let sym = ctx.symbol_db.symbol(id);
            Some((sym.dynsym_idx()?, sym.ver_idx()))
        })
        .collect();
    for (index, ver) in entries {
        ctx.synthetic.versym_contents[index as usize] = ver;
    }
    ctx.synthetic.ensure_versym();
}

/// Builds `.gnu.version_r`: dynsym entries provided by shared libraries
/// with a real version get grouped by library, each distinct version
/// receiving a freshly assigned index that is also written into
/// `.gnu.version`.
#[tracing::instrument(skip_all, name = "Fill verneed")]
pub fn fill_verneed(ctx: &mut Context) {
    if ctx.synthetic.dynsym_syms.len() <= 1 {
        return;
    }

    // (dso index, masked version, dynsym index, version string)
    let mut versioned: Vec<(usize, u16, u32, Vec<u8>)> = Vec::new();
    for &id in &ctx.synthetic.dynsym_syms[1..] {
        let sym = ctx.symbol_db.symbol(id);
        let Some(provider) = sym.provider() else {
            continue;
        };
        if provider.file_kind != FileKind::Dso {
            continue;
        }
        let ver = sym.ver_idx() & !elf::VERSYM_HIDDEN;
        if ver <= VER_NDX_LAST_RESERVED {
            continue;
        }
        let Some(FileRef::Dso(d)) = ctx.file_by_priority(provider.priority) else {
            continue;
        };
        let dso = &ctx.dsos[d];
        let Some(index) = dso.symbol_index(id) else {
            continue;
        };
        let Some(version) = dso.version_name(index) else {
            continue;
        };
        let Some(dynsym_idx) = sym.dynsym_idx() else {
            continue;
        };
        versioned.push((d, ver, dynsym_idx, version.to_vec()));
    }

    if versioned.is_empty() {
        return;
    }

    versioned.sort_by(|a, b| {
        (ctx.dsos[a.0].soname.as_str(), a.1).cmp(&(ctx.dsos[b.0].soname.as_str(), b.1))
    });

    ctx.synthetic.ensure_versym();

    let mut veridx = VER_NDX_LAST_RESERVED + ctx.arg.version_definitions.len() as u16;
    let mut groups: Vec<(Vec<u8>, Vec<(Vec<u8>, u16)>)> = Vec::new();
    let mut versym_updates: Vec<(u32, u16)> = Vec::new();
    let mut last: Option<(usize, u16)> = None;

    for (dso_index, ver, dynsym_idx, version) in versioned {
        let new_group = last.is_none_or(|(d, _)| d != dso_index);
        let new_version = last.is_none_or(|(d, v)| d != dso_index || v != ver);
        if new_group {
            groups.push((
                ctx.dsos[dso_index].soname.as_bytes().to_vec(),
                Vec::new(),
            ));
        }
        if new_group || new_version {
            veridx += 1;
            groups
                .last_mut()
                .expect("group pushed above")
                .1
                .push((version, veridx));
        }
        versym_updates.push((dynsym_idx, veridx));
        last = Some((dso_index, ver));
    }

    ctx.synthetic.build_verneed(&groups);
    for (index, ver) in versym_updates {
        ctx.synthetic.versym_contents[index as usize] = ver;
    }
    ctx.synthetic.ensure_versym();
}

/// The subset of regular and merge output sections with contents, sorted
/// by `(name, type, flags)`. Section creation order is parallel and
/// arbitrary; this sort is what makes the section list deterministic.
pub fn collect_output_sections<'data>(ctx: &Context<'data>) -> Vec<OutputChunk<'data>> {
    let mut chunks = Vec::new();
    for (i, osec) in ctx.output_sections.iter().enumerate() {
        if !osec.members.is_empty() {
            chunks.push(OutputChunk::new(
                osec.name,
                ChunkKind::Regular,
                osec.shdr,
                ChunkSource::Regular(OutputSectionId(i as u32)),
            ));
        }
    }
    for (i, merged) in ctx.merged_sections.iter().enumerate() {
        if merged.shdr.sh_size > 0 {
            chunks.push(OutputChunk::new(
                merged.name,
                ChunkKind::Synthetic,
                merged.shdr,
                ChunkSource::Merged(crate::merged_sections::MergedSectionId(i as u32)),
            ));
        }
    }
    chunks.sort_by(|a, b| {
        (a.name, a.shdr.sh_type, a.shdr.sh_flags).cmp(&(b.name, b.shdr.sh_type, b.shdr.sh_flags))
    });
    chunks
}

fn synthetic_chunk<'data>(
    section: &crate::synthetic::SyntheticSection,
    kind: SyntheticKind,
) -> OutputChunk<'data> {
    OutputChunk::new(
        section.name,
        ChunkKind::Synthetic,
        section.shdr,
        ChunkSource::Synthetic(kind),
    )
}

/// Assembles the final chunk list: headers, the collected output sections
/// and the populated synthetic sections, sorted by rank and numbered.
#[tracing::instrument(skip_all, name = "Assemble chunks")]
pub fn assemble_chunks<T: Target>(ctx: &mut Context) {
    let dynamic = ctx.is_dynamic_output();
    if dynamic {
        ctx.synthetic.update_hash_sizes(ctx.dsos.len());
    }

    let mut chunks = Vec::new();
    chunks.push(OutputChunk::new(
        b"",
        ChunkKind::Header,
        SectionHeader {
            sh_flags: u64::from(elf::SHF_ALLOC),
            sh_size: EHDR_SIZE,
            sh_addralign: 8,
            ..SectionHeader::default()
        },
        ChunkSource::Ehdr,
    ));
    chunks.push(OutputChunk::new(
        b"",
        ChunkKind::Header,
        SectionHeader {
            sh_flags: u64::from(elf::SHF_ALLOC),
            sh_addralign: 8,
            ..SectionHeader::default()
        },
        ChunkSource::Phdr,
    ));
    chunks.push(OutputChunk::new(
        b"",
        ChunkKind::Header,
        SectionHeader {
            sh_addralign: 8,
            ..SectionHeader::default()
        },
        ChunkSource::Shdr,
    ));

    chunks.extend(collect_output_sections(ctx));

    let syn = &ctx.synthetic;
    if !syn.got_entries.is_empty() {
        chunks.push(synthetic_chunk(&syn.got, SyntheticKind::Got));
    }
    if dynamic || !syn.plt_syms.is_empty() {
        chunks.push(synthetic_chunk(&syn.gotplt, SyntheticKind::GotPlt));
    }
    if !syn.plt_syms.is_empty() {
        chunks.push(synthetic_chunk(&syn.plt, SyntheticKind::Plt));
        chunks.push(synthetic_chunk(&syn.relplt, SyntheticKind::RelPlt));
    }
    if !syn.pltgot_syms.is_empty() {
        chunks.push(synthetic_chunk(&syn.pltgot, SyntheticKind::PltGot));
    }
    if syn.reldyn.shdr.sh_size > 0 {
        chunks.push(synthetic_chunk(&syn.reldyn, SyntheticKind::RelDyn));
    }
    if dynamic {
        chunks.push(synthetic_chunk(&syn.dynsym, SyntheticKind::Dynsym));
        chunks.push(synthetic_chunk(&syn.dynstr_sec, SyntheticKind::Dynstr));
        chunks.push(synthetic_chunk(&syn.dynamic, SyntheticKind::Dynamic));
        if let Some(hash) = &syn.hash {
            chunks.push(synthetic_chunk(hash, SyntheticKind::Hash));
        }
        if let Some(gnu_hash) = &syn.gnu_hash {
            chunks.push(synthetic_chunk(gnu_hash, SyntheticKind::GnuHash));
        }
    }
    if syn.versym.shdr.sh_size > 0 {
        chunks.push(synthetic_chunk(&syn.versym, SyntheticKind::Versym));
    }
    if let Some(verdef) = &syn.verdef {
        if verdef.shdr.sh_size > 0 {
            chunks.push(synthetic_chunk(verdef, SyntheticKind::Verdef));
        }
    }
    if syn.verneed.shdr.sh_size > 0 {
        chunks.push(synthetic_chunk(&syn.verneed, SyntheticKind::Verneed));
    }
    if let Some(interp) = &syn.interp {
        chunks.push(synthetic_chunk(interp, SyntheticKind::Interp));
    }
    if let Some(buildid) = &syn.buildid {
        chunks.push(synthetic_chunk(buildid, SyntheticKind::BuildId));
    }
    if let Some(eh_frame_hdr) = &syn.eh_frame_hdr {
        chunks.push(synthetic_chunk(eh_frame_hdr, SyntheticKind::EhFrameHdr));
    }
    if syn.eh_frame.shdr.sh_size > 0 {
        chunks.push(synthetic_chunk(&syn.eh_frame, SyntheticKind::EhFrame));
    }
    if syn.dynbss.shdr.sh_size > 0 {
        chunks.push(synthetic_chunk(&syn.dynbss, SyntheticKind::Dynbss));
    }
    if syn.dynbss_relro.shdr.sh_size > 0 {
        chunks.push(synthetic_chunk(&syn.dynbss_relro, SyntheticKind::DynbssRelro));
    }
    chunks.push(synthetic_chunk(&syn.symtab, SyntheticKind::Symtab));
    chunks.push(synthetic_chunk(&syn.strtab, SyntheticKind::Strtab));
    chunks.push(synthetic_chunk(&syn.shstrtab, SyntheticKind::Shstrtab));

    chunks.sort_by_key(section_rank);

    // Section numbering skips the pure header chunks.
    let mut shndx = 1;
    for chunk in &mut chunks {
        if chunk.kind != ChunkKind::Header {
            chunk.shndx = shndx;
            shndx += 1;
        }
    }

    // Page hints bracket the RELRO region so the loader can round it to
    // page boundaries.
    if let Some(first) = chunks.iter().position(|c| c.is_relro()) {
        let last = chunks.iter().rposition(|c| c.is_relro()).unwrap_or(first);
        chunks[first].new_page = true;
        chunks[last].new_page_end = true;
    }

    // Sizes that depend on the final chunk list.
    let num_sections = shndx as u64;
    let shstrtab_size = 1 + chunks
        .iter()
        .filter(|c| !c.name.is_empty())
        .map(|c| c.name.len() as u64 + 1)
        .sum::<u64>();
    let phdr_size = estimate_phdr_size(&chunks, dynamic);
    for chunk in &mut chunks {
        match chunk.source {
            ChunkSource::Shdr => chunk.shdr.sh_size = (num_sections + 1) * SHDR_ENTRY_SIZE,
            ChunkSource::Phdr => chunk.shdr.sh_size = phdr_size,
            ChunkSource::Synthetic(SyntheticKind::Shstrtab) => {
                chunk.shdr.sh_size = shstrtab_size;
            }
            _ => {}
        }
    }

    ctx.chunks = chunks;
}

/// Program header table size: one entry per segment the writer will emit.
fn estimate_phdr_size(chunks: &[OutputChunk], dynamic: bool) -> u64 {
    let mut segments: u64 = 2; // PT_PHDR + PT_GNU_STACK
    if dynamic {
        segments += 1; // PT_DYNAMIC
    }

    let mut last_rank_class = None;
    for chunk in chunks {
        if !chunk.shdr.is_alloc() {
            continue;
        }
        match chunk.source {
            ChunkSource::Synthetic(SyntheticKind::Interp) => segments += 1,
            ChunkSource::Synthetic(SyntheticKind::EhFrameHdr) => segments += 1,
            _ => {}
        }
        if chunk.shdr.sh_type == elf::SHT_NOTE {
            segments += 1;
        }
        // One PT_LOAD per contiguous run of chunks with the same
        // readable/writable/executable class.
        let class = (
            chunk.shdr.sh_flags & u64::from(elf::SHF_WRITE) != 0,
            chunk.shdr.sh_flags & u64::from(elf::SHF_EXECINSTR) != 0,
        );
        if last_rank_class != Some(class) {
            segments += 1;
            last_rank_class = Some(class);
        }
    }
    if chunks.iter().any(|c| c.shdr.is_tls()) {
        segments += 1; // PT_TLS
    }
    if chunks.iter().any(|c| c.is_relro()) {
        segments += 1; // PT_GNU_RELRO
    }
    segments * PHDR_ENTRY_SIZE
}

/// Assigns file offsets and virtual addresses to every chunk in layout
/// order, keeping `fileoff ≡ vaddr (mod PAGE_SIZE)` so the output can be
/// mapped directly. Returns the total file size.
#[tracing::instrument(skip_all, name = "Set output section offsets")]
pub fn set_osec_offsets<T: Target>(ctx: &mut Context) -> u64 {
    let mut fileoff = 0;
    let mut vaddr = ctx.arg.image_base;

    for chunk in &mut ctx.chunks {
        if chunk.new_page {
            vaddr = align_to(vaddr, T::PAGE_SIZE);
        }

        vaddr = align_to(vaddr, chunk.shdr.sh_addralign.max(1));
        fileoff = align_with_skew(fileoff, T::PAGE_SIZE, vaddr % T::PAGE_SIZE);

        chunk.shdr.sh_offset = fileoff;
        if chunk.shdr.is_alloc() {
            chunk.shdr.sh_addr = vaddr;
        }

        if !chunk.shdr.is_nobits() {
            fileoff += chunk.shdr.sh_size;
        }

        let is_tbss = chunk.shdr.is_nobits() && chunk.shdr.is_tls();
        if !is_tbss {
            vaddr += chunk.shdr.sh_size;
        }

        if chunk.new_page_end {
            vaddr = align_to(vaddr, T::PAGE_SIZE);
        }
    }
    fileoff
}

/// Binds the linker-defined symbols (`__bss_start`, `_etext`,
/// `__start_SECNAME`, …) to their final addresses.
#[tracing::instrument(skip_all, name = "Fix synthetic symbols")]
pub fn fix_synthetic_symbols(ctx: &mut Context) {
    let db = &ctx.symbol_db;
    let start = |id: SymbolId, chunk: &OutputChunk| {
        db.symbol(id)
            .set_value_and_shndx(chunk.shdr.sh_addr, chunk.shndx);
    };
    let stop = |id: SymbolId, chunk: &OutputChunk| {
        db.symbol(id)
            .set_value_and_shndx(chunk.shdr.sh_addr + chunk.shdr.sh_size, chunk.shndx);
    };
    let find_synthetic = |kind: SyntheticKind| {
        ctx.chunks
            .iter()
            .find(|c| c.source == ChunkSource::Synthetic(kind))
    };

    if let Some(chunk) = ctx
        .chunks
        .iter()
        .find(|c| c.kind == ChunkKind::Regular && c.name == b".bss")
    {
        start(ctx.internal_syms.bss_start, chunk);
    }

    // If nothing made it into the output, these stay at value 0.
    if ctx.chunks.iter().any(|c| c.shndx == 1) {
        if let Some(ehdr) = ctx.chunks.iter().find(|c| c.source == ChunkSource::Ehdr) {
            db.symbol(ctx.internal_syms.ehdr_start)
                .set_value_and_shndx(ehdr.shdr.sh_addr, 1);
            db.symbol(ctx.internal_syms.executable_start)
                .set_value_and_shndx(ehdr.shdr.sh_addr, 1);
        }
    }

    if let Some(chunk) = find_synthetic(SyntheticKind::RelPlt) {
        start(ctx.internal_syms.rela_iplt_start, chunk);
        stop(ctx.internal_syms.rela_iplt_end, chunk);
    }

    for chunk in &ctx.chunks {
        match chunk.shdr.sh_type {
            elf::SHT_INIT_ARRAY => {
                start(ctx.internal_syms.init_array_start, chunk);
                stop(ctx.internal_syms.init_array_end, chunk);
            }
            elf::SHT_FINI_ARRAY => {
                start(ctx.internal_syms.fini_array_start, chunk);
                stop(ctx.internal_syms.fini_array_end, chunk);
            }
            _ => {}
        }
    }

    for chunk in &ctx.chunks {
        if chunk.kind == ChunkKind::Header {
            continue;
        }
        if chunk.shdr.is_alloc() {
            stop(ctx.internal_syms.end, chunk);
        }
        if chunk.shdr.sh_flags & u64::from(elf::SHF_EXECINSTR) != 0 {
            stop(ctx.internal_syms.etext, chunk);
        }
        if !chunk.shdr.is_nobits() && chunk.shdr.is_alloc() {
            stop(ctx.internal_syms.edata, chunk);
        }
    }

    if let Some(chunk) = find_synthetic(SyntheticKind::Dynamic) {
        start(ctx.internal_syms.dynamic, chunk);
    }
    if let Some(chunk) = find_synthetic(SyntheticKind::GotPlt) {
        start(ctx.internal_syms.global_offset_table, chunk);
    }
    if let Some(chunk) = find_synthetic(SyntheticKind::EhFrameHdr) {
        start(ctx.internal_syms.gnu_eh_frame_hdr, chunk);
    }

    // Bracket every output section whose name is a valid C identifier with
    // __start_/__stop_ symbols.
    let bracketed: Vec<(Vec<u8>, u64, u64, u32)> = ctx
        .chunks
        .iter()
        .filter(|c| is_c_identifier(c.name))
        .map(|c| {
            (
                c.name.to_vec(),
                c.shdr.sh_addr,
                c.shdr.sh_size,
                c.shndx,
            )
        })
        .collect();
    for (name, addr, size, shndx) in bracketed {
        let mut start_name = b"__start_".to_vec();
        start_name.extend_from_slice(&name);
        let mut stop_name = b"__stop_".to_vec();
        stop_name.extend_from_slice(&name);

        let start_name = ctx.alloc_bytes(&start_name);
        let stop_name = ctx.alloc_bytes(&stop_name);
        let start_id = ctx.symbol_db.intern(start_name);
        let stop_id = ctx.symbol_db.intern(stop_name);
        ctx.symbol_db
            .symbol(start_id)
            .set_value_and_shndx(addr, shndx);
        ctx.symbol_db
            .symbol(stop_id)
            .set_value_and_shndx(addr + size, shndx);
    }
}

/// Zeroes the gaps between chunks in the mapped output buffer, and from
/// the end of the last chunk to the end of the file.
pub fn clear_padding(ctx: &Context, buf: &mut [u8]) {
    let zero = |buf: &mut [u8], chunk: &OutputChunk, next_start: usize| {
        let mut pos = chunk.shdr.sh_offset as usize;
        if !chunk.shdr.is_nobits() {
            pos += chunk.shdr.sh_size as usize;
        }
        buf[pos..next_start].fill(0);
    };

    for i in 1..ctx.chunks.len() {
        let next_start = ctx.chunks[i].shdr.sh_offset as usize;
        zero(buf, &ctx.chunks[i - 1], next_start);
    }
    if let Some(last) = ctx.chunks.last() {
        let len = buf.len();
        zero(buf, last, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Args;
    use crate::args::VersionPattern;
    use crate::elf_x86_64::ElfX86_64;
    use crate::input_files::FragmentRef;
    use crate::input_files::InputSymbol;
    use crate::input_files::ObjectFile;
    use crate::input_files::Rela;
    use crate::input_files::SharedFile;
    use bumpalo_herd::Herd;
    use smallvec::SmallVec;

    const ALLOC: u64 = elf::SHF_ALLOC as u64;
    const AX: u64 = (elf::SHF_ALLOC | elf::SHF_EXECINSTR) as u64;

    fn new_context(herd: &Herd) -> Context {
        Context::new(Args::default(), vec!["weld".to_string()], herd)
    }

    fn push_section<'data>(
        ctx: &mut Context<'data>,
        file: &mut ObjectFile<'data>,
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
        sh_size: u64,
        sh_addralign: u64,
    ) -> u32 {
        let isec = ctx.new_input_section(name, sh_type, sh_flags, sh_size, sh_addralign);
        file.sections.push(Some(isec));
        (file.sections.len() - 1) as u32
    }

    fn resolve_all(ctx: &mut Context) {
        set_file_priority(ctx);
        resolve_obj_symbols(ctx);
        resolve_dso_symbols(ctx);
    }

    fn owner_name(ctx: &Context, name: &[u8]) -> String {
        let id = ctx.symbol_db.get(name).unwrap();
        let provider = ctx.symbol_db.symbol(id).provider().unwrap();
        ctx.file_display(provider.priority)
    }

    #[test]
    fn archive_liveness_pulls_referenced_members() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);

        let mut main_o = ObjectFile::new("main.o", None);
        push_section(&mut ctx, &mut main_o, b".text", elf::SHT_PROGBITS, AX, 0x10, 16);
        main_o.elf_syms = vec![InputSymbol::undefined(b"f")];
        ctx.add_object(main_o);

        let mut x_o = ObjectFile::new("x.o", Some("libx.a".to_string()));
        let sec = push_section(&mut ctx, &mut x_o, b".text", elf::SHT_PROGBITS, AX, 0x10, 16);
        x_o.elf_syms = vec![
            InputSymbol::defined(b"f", sec),
            InputSymbol::undefined(b"g"),
        ];
        ctx.add_object(x_o);

        let mut y_o = ObjectFile::new("y.o", Some("liby.a".to_string()));
        let sec = push_section(&mut ctx, &mut y_o, b".text", elf::SHT_PROGBITS, AX, 0x10, 16);
        y_o.elf_syms = vec![InputSymbol::defined(b"g", sec)];
        ctx.add_object(y_o);

        let mut z_o = ObjectFile::new("z.o", Some("libx.a".to_string()));
        let sec = push_section(&mut ctx, &mut z_o, b".text", elf::SHT_PROGBITS, AX, 0x10, 16);
        z_o.elf_syms = vec![InputSymbol::defined(b"unused", sec)];
        ctx.add_object(z_o);

        set_file_priority(&mut ctx);
        resolve_obj_symbols(&mut ctx);

        // The transitive closure pulls x.o and y.o; z.o is never needed.
        let names: Vec<&str> = ctx.objs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["main.o", "x.o", "y.o"]);
        assert_eq!(owner_name(&ctx, b"f"), "libx.a(x.o)");
        assert_eq!(owner_name(&ctx, b"g"), "liby.a(y.o)");

        // z.o's symbols were reset to undefined.
        let unused = ctx.symbol_db.get(b"unused").unwrap();
        assert!(ctx.symbol_db.symbol(unused).provider().is_none());
    }

    #[test]
    fn strong_definition_beats_weak() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);

        let mut a_o = ObjectFile::new("a.o", None);
        let sec = push_section(&mut ctx, &mut a_o, b".text", elf::SHT_PROGBITS, AX, 8, 8);
        a_o.elf_syms = vec![InputSymbol::defined(b"g", sec)];
        ctx.add_object(a_o);

        let mut b_o = ObjectFile::new("b.o", None);
        let sec = push_section(&mut ctx, &mut b_o, b".text", elf::SHT_PROGBITS, AX, 8, 8);
        b_o.elf_syms =
            vec![InputSymbol::defined(b"g", sec).with_binding(elf::STB_WEAK)];
        ctx.add_object(b_o);

        resolve_all(&mut ctx);

        assert_eq!(owner_name(&ctx, b"g"), "a.o");
        // A weak second definition is not a duplicate.
        check_duplicate_symbols(&mut ctx).unwrap();
    }

    #[test]
    fn first_of_two_strong_definitions_wins() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);

        for name in ["a.o", "b.o"] {
            let mut file = ObjectFile::new(name, None);
            let sec = push_section(&mut ctx, &mut file, b".text", elf::SHT_PROGBITS, AX, 8, 8);
            file.elf_syms = vec![InputSymbol::defined(b"g", sec)];
            ctx.add_object(file);
        }

        resolve_all(&mut ctx);
        assert_eq!(owner_name(&ctx, b"g"), "a.o");
    }

    #[test]
    fn duplicate_strong_definitions_fail_the_link() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);

        for name in ["a.o", "b.o"] {
            let mut file = ObjectFile::new(name, None);
            let sec = push_section(&mut ctx, &mut file, b".text", elf::SHT_PROGBITS, AX, 8, 8);
            file.elf_syms = vec![InputSymbol::defined(b"g", sec)];
            ctx.add_object(file);
        }

        resolve_all(&mut ctx);
        let err = check_duplicate_symbols(&mut ctx).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("duplicate symbol"), "{rendered}");
        assert!(rendered.contains("b.o"), "{rendered}");
        // Exactly one error for the pair.
        assert_eq!(rendered.matches("duplicate symbol").count(), 1);
    }

    #[test]
    fn symbol_versions_default_and_hidden() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);
        ctx.arg.version_definitions = vec!["V1".to_string()];

        let mut a_o = ObjectFile::new("a.o", None);
        let sec = push_section(&mut ctx, &mut a_o, b".text", elf::SHT_PROGBITS, AX, 8, 8);
        a_o.elf_syms = vec![
            InputSymbol::defined(b"f", sec),
            InputSymbol::defined(b"g", sec),
        ];
        a_o.symvers = vec![Some(&b"@V1"[..]), Some(&b"V1"[..])];
        ctx.add_object(a_o);

        resolve_all(&mut ctx);
        parse_symbol_version(&mut ctx).unwrap();

        let f = ctx.symbol_db.get(b"f").unwrap();
        let g = ctx.symbol_db.get(b"g").unwrap();
        assert_eq!(ctx.symbol_db.symbol(f).ver_idx(), 2);
        assert_eq!(
            ctx.symbol_db.symbol(g).ver_idx(),
            2 | elf::VERSYM_HIDDEN
        );
    }

    #[test]
    fn unknown_symbol_version_is_an_error() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);
        ctx.arg.version_definitions = vec!["V1".to_string()];

        let mut a_o = ObjectFile::new("a.o", None);
        let sec = push_section(&mut ctx, &mut a_o, b".text", elf::SHT_PROGBITS, AX, 8, 8);
        a_o.elf_syms = vec![InputSymbol::defined(b"f", sec)];
        a_o.symvers = vec![Some(&b"V9"[..])];
        ctx.add_object(a_o);

        resolve_all(&mut ctx);
        let err = parse_symbol_version(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("undefined version V9"));
    }

    #[test]
    fn offsets_and_addresses_stay_page_congruent() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);
        ctx.arg.image_base = 0x40_0000;

        ctx.chunks.push(OutputChunk::new(
            b".text",
            ChunkKind::Regular,
            SectionHeader {
                sh_type: elf::SHT_PROGBITS,
                sh_flags: ALLOC,
                sh_size: 0x1000,
                sh_addralign: 0x1000,
                ..SectionHeader::default()
            },
            ChunkSource::Regular(OutputSectionId(0)),
        ));
        ctx.chunks.push(OutputChunk::new(
            b".rodata",
            ChunkKind::Regular,
            SectionHeader {
                sh_type: elf::SHT_PROGBITS,
                sh_flags: ALLOC,
                sh_size: 0x20,
                sh_addralign: 0x10,
                ..SectionHeader::default()
            },
            ChunkSource::Regular(OutputSectionId(1)),
        ));

        let filesize = set_osec_offsets::<ElfX86_64>(&mut ctx);

        assert_eq!(ctx.chunks[0].shdr.sh_addr, 0x40_0000);
        assert_eq!(ctx.chunks[0].shdr.sh_offset, 0);
        assert_eq!(ctx.chunks[1].shdr.sh_addr, 0x40_1000);
        assert_eq!(ctx.chunks[1].shdr.sh_offset, 0x1000);
        assert_eq!(filesize, 0x1020);
    }

    #[test]
    fn c_identifier_sections_get_start_stop_symbols() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);

        let mut main_o = ObjectFile::new("main.o", None);
        push_section(&mut ctx, &mut main_o, b".text", elf::SHT_PROGBITS, AX, 0x10, 16);
        push_section(&mut ctx, &mut main_o, b"foo_data", elf::SHT_PROGBITS, ALLOC, 8, 8);
        ctx.add_object(main_o);

        run_passes::<ElfX86_64>(&mut ctx).unwrap();

        let chunk = ctx.chunks.iter().find(|c| c.name == b"foo_data").unwrap();
        let start = ctx.symbol_db.get(b"__start_foo_data").unwrap();
        let stop = ctx.symbol_db.get(b"__stop_foo_data").unwrap();
        let start_res = ctx.symbol_db.symbol(start).resolution();
        let stop_res = ctx.symbol_db.symbol(stop).resolution();
        assert_eq!(start_res.value, chunk.shdr.sh_addr);
        assert_eq!(stop_res.value, chunk.shdr.sh_addr + 8);
        assert_eq!(start_res.shndx, chunk.shndx);

        // While we're here: allocated chunks don't overlap, and every
        // chunk's file offset is congruent to its address modulo the page
        // size.
        let mut prev_end = 0;
        for chunk in ctx.chunks.iter().filter(|c| c.shdr.is_alloc()) {
            assert!(chunk.shdr.sh_addr >= prev_end, "{:?} overlaps", chunk.name);
            assert_eq!(chunk.shdr.sh_offset % 0x1000, chunk.shdr.sh_addr % 0x1000);
            let align = chunk.shdr.sh_addralign.max(1);
            assert_eq!(chunk.shdr.sh_addr % align, 0);
            if !(chunk.shdr.is_nobits() && chunk.shdr.is_tls()) {
                prev_end = chunk.shdr.sh_addr + chunk.shdr.sh_size;
            }
        }
    }

    #[test]
    fn common_symbols_become_bss_definitions() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);

        let mut a_o = ObjectFile::new("a.o", None);
        a_o.elf_syms = vec![InputSymbol::common(b"c", 16, 8)];
        ctx.add_object(a_o);

        resolve_all(&mut ctx);
        convert_common_symbols(&mut ctx);

        let file = &ctx.objs[0];
        let isec = file.sections.last().unwrap().as_ref().unwrap();
        assert_eq!(isec.name, b".common");
        assert_eq!(isec.sh_type, elf::SHT_NOBITS);
        assert_eq!(isec.sh_size, 16);
        assert_eq!(isec.sh_addralign, 8);
        assert!(file.elf_syms[0].is_defined());
        assert!(!file.elf_syms[0].is_common());

        bin_sections(&mut ctx);
        compute_section_sizes(&mut ctx);
        let bss = ctx
            .output_sections
            .iter()
            .find(|o| o.name == b".bss")
            .unwrap();
        assert_eq!(bss.shdr.sh_size, 16);
    }

    #[test]
    fn comdat_groups_keep_one_copy() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);
        let group = ctx.intern_comdat(b"_ZTV3Foo");

        for name in ["a.o", "b.o"] {
            let mut file = ObjectFile::new(name, None);
            let sec = push_section(
                &mut ctx,
                &mut file,
                b".text._ZTV3Foo",
                elf::SHT_PROGBITS,
                AX,
                0x40,
                16,
            );
            file.comdat_groups
                .push((group, SmallVec::from_slice(&[sec])));
            ctx.add_object(file);
        }

        resolve_all(&mut ctx);
        eliminate_comdats(&mut ctx);

        assert!(ctx.objs[0].sections[0].is_some());
        assert!(ctx.objs[1].sections[0].is_none());
    }

    #[test]
    fn merged_fragments_and_comment_strings() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);

        let merged = ctx.merged_section_for(
            b".rodata.str1.1",
            elf::SHT_PROGBITS,
            (elf::SHF_ALLOC | elf::SHF_MERGE | elf::SHF_STRINGS) as u64,
        );
        let used = ctx.merged_section_mut(merged).insert(b"abc\0", 1);
        let unused = ctx.merged_section_mut(merged).insert(b"zzz\0", 1);

        let mut a_o = ObjectFile::new("a.o", None);
        a_o.fragments.push(FragmentRef {
            section: merged,
            fragment: used,
        });
        ctx.add_object(a_o);

        resolve_all(&mut ctx);
        compute_merged_section_sizes(&mut ctx);

        let section = ctx.merged_section(merged);
        assert!(section.fragment(used).is_alive.load(Relaxed));
        assert!(!section.fragment(unused).is_alive.load(Relaxed));
        assert_eq!(section.shdr.sh_size, 4);

        let comment = ctx
            .merged_sections
            .iter()
            .find(|m| m.name == b".comment")
            .unwrap();
        assert!(comment.shdr.sh_size > 0);
    }

    #[test]
    fn binning_preserves_file_order_and_alignment() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);

        let mut a_o = ObjectFile::new("a.o", None);
        push_section(&mut ctx, &mut a_o, b".text.hot", elf::SHT_PROGBITS, AX, 8, 16);
        ctx.add_object(a_o);
        let mut b_o = ObjectFile::new("b.o", None);
        push_section(&mut ctx, &mut b_o, b".text", elf::SHT_PROGBITS, AX, 4, 4);
        ctx.add_object(b_o);

        resolve_all(&mut ctx);
        bin_sections(&mut ctx);
        compute_section_sizes(&mut ctx);

        let text = ctx
            .output_sections
            .iter()
            .find(|o| o.name == b".text")
            .unwrap();
        assert_eq!(text.members.len(), 2);
        assert_eq!(text.members[0].file, 0);
        assert_eq!(text.members[1].file, 1);

        let first = ctx.objs[0].sections[0].as_ref().unwrap();
        let second = ctx.objs[1].sections[0].as_ref().unwrap();
        assert_eq!(first.offset.load(Relaxed), 0);
        assert_eq!(second.offset.load(Relaxed), 8);
        assert_eq!(text.shdr.sh_size, 12);
        assert_eq!(text.shdr.sh_addralign, 16);
    }

    fn dynamic_scenario<'data>(herd: &'data Herd) -> Context<'data> {
        let mut ctx = new_context(herd);
        ctx.arg.dynamic_linker = Some("/lib64/ld-linux-x86-64.so.2".to_string());

        let mut main_o = ObjectFile::new("main.o", None);
        let mut isec = ctx.new_input_section(b".text", elf::SHT_PROGBITS, AX, 0x20, 16);
        isec.relocations = vec![
            Rela {
                offset: 0x2,
                r_type: elf::R_X86_64_PLT32,
                symbol: 0,
                addend: -4,
            },
            Rela {
                offset: 0xa,
                r_type: elf::R_X86_64_PC32,
                symbol: 1,
                addend: -4,
            },
        ];
        main_o.sections.push(Some(isec));
        main_o.elf_syms = vec![
            InputSymbol::undefined(b"func"),
            InputSymbol::undefined(b"data"),
        ];
        ctx.add_object(main_o);

        let mut dso = SharedFile::new("libfoo.so.1");
        dso.elf_syms = vec![
            InputSymbol::defined(b"func", 0)
                .with_type(elf::STT_FUNC)
                .with_value(0x1000),
            InputSymbol::defined(b"data", 0)
                .with_type(elf::STT_OBJECT)
                .with_value(0x2000),
            InputSymbol::defined(b"data_alias", 0)
                .with_type(elf::STT_OBJECT)
                .with_value(0x2000),
        ];
        dso.elf_syms[1].size = 8;
        dso.elf_syms[2].size = 8;
        ctx.add_dso(dso, &[]);
        ctx
    }

    #[test]
    fn scan_rels_allocates_plt_dynsym_and_copyrel() {
        let herd = Herd::new();
        let mut ctx = dynamic_scenario(&herd);

        resolve_all(&mut ctx);
        convert_undefined_weak_symbols(&mut ctx);
        scan_rels::<ElfX86_64>(&mut ctx).unwrap();

        let func = ctx.symbol_db.symbol(ctx.symbol_db.get(b"func").unwrap());
        let data = ctx.symbol_db.symbol(ctx.symbol_db.get(b"data").unwrap());
        let alias = ctx
            .symbol_db
            .symbol(ctx.symbol_db.get(b"data_alias").unwrap());

        assert!(func.is_imported());
        assert_eq!(func.plt_idx(), Some(1));
        assert_eq!(func.dynsym_idx(), Some(1));

        assert!(data.has_copyrel());
        assert!(!data.copyrel_readonly());
        assert_eq!(data.resolution().value, 0);
        assert_eq!(data.dynsym_idx(), Some(2));

        // The address-equivalent alias shares the copy-relocation slot.
        assert!(alias.has_copyrel());
        assert_eq!(alias.resolution().value, 0);
        assert_eq!(alias.dynsym_idx(), Some(3));

        let syn = &ctx.synthetic;
        assert_eq!(syn.dynbss.shdr.sh_size, 8);
        assert_eq!(syn.dynbss_relro.shdr.sh_size, 0);
        assert_eq!(syn.plt.shdr.sh_size, 2 * crate::elf::PLT_ENTRY_SIZE);
        assert_eq!(syn.relplt.shdr.sh_size, crate::elf::RELA_ENTRY_SIZE);
        // One R_COPY for the copy relocation.
        assert_eq!(syn.reldyn.shdr.sh_size, crate::elf::RELA_ENTRY_SIZE);
    }

    #[test]
    fn copyrel_against_readonly_page_goes_to_relro_bss() {
        let herd = Herd::new();
        let mut ctx = dynamic_scenario(&herd);
        ctx.dsos[0].readonly_ranges.push(0x2000..0x3000);

        resolve_all(&mut ctx);
        convert_undefined_weak_symbols(&mut ctx);
        scan_rels::<ElfX86_64>(&mut ctx).unwrap();

        let data = ctx.symbol_db.symbol(ctx.symbol_db.get(b"data").unwrap());
        assert!(data.copyrel_readonly());
        assert_eq!(ctx.synthetic.dynbss_relro.shdr.sh_size, 8);
        assert_eq!(ctx.synthetic.dynbss.shdr.sh_size, 0);
    }

    #[test]
    fn relocation_against_undefined_symbol_fails() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);

        let mut main_o = ObjectFile::new("main.o", None);
        let mut isec = ctx.new_input_section(b".text", elf::SHT_PROGBITS, AX, 0x10, 16);
        isec.relocations = vec![Rela {
            offset: 0,
            r_type: elf::R_X86_64_PC32,
            symbol: 0,
            addend: -4,
        }];
        main_o.sections.push(Some(isec));
        main_o.elf_syms = vec![InputSymbol::undefined(b"missing")];
        ctx.add_object(main_o);

        resolve_all(&mut ctx);
        convert_undefined_weak_symbols(&mut ctx);
        let err = scan_rels::<ElfX86_64>(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("undefined symbol"));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn weak_undefined_resolves_to_zero_in_static_output() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);

        let mut main_o = ObjectFile::new("main.o", None);
        push_section(&mut ctx, &mut main_o, b".text", elf::SHT_PROGBITS, AX, 8, 8);
        main_o.elf_syms =
            vec![InputSymbol::undefined(b"w").with_binding(elf::STB_WEAK)];
        ctx.add_object(main_o);

        resolve_all(&mut ctx);
        convert_undefined_weak_symbols(&mut ctx);

        let w = ctx.symbol_db.symbol(ctx.symbol_db.get(b"w").unwrap());
        let res = w.resolution();
        assert_eq!(res.provider.unwrap().kind, ProviderKind::WeakUndef);
        assert_eq!(res.value, 0);
        assert!(res.is_weak);
        assert!(!w.is_imported());

        // Weak references never force archive extraction, and never count
        // as undefined-reference errors.
        scan_rels::<ElfX86_64>(&mut ctx).unwrap();
    }

    #[test]
    fn weak_undefined_is_interposable_in_dynamic_output() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);
        ctx.arg.dynamic_linker = Some("/lib64/ld-linux-x86-64.so.2".to_string());

        let mut main_o = ObjectFile::new("main.o", None);
        push_section(&mut ctx, &mut main_o, b".text", elf::SHT_PROGBITS, AX, 8, 8);
        main_o.elf_syms =
            vec![InputSymbol::undefined(b"w").with_binding(elf::STB_WEAK)];
        ctx.add_object(main_o);

        resolve_all(&mut ctx);
        convert_undefined_weak_symbols(&mut ctx);

        let w = ctx.symbol_db.symbol(ctx.symbol_db.get(b"w").unwrap());
        assert!(w.is_imported());
    }

    #[test]
    fn exclude_libs_suppresses_exports() {
        for exclude in [false, true] {
            let herd = Herd::new();
            let mut ctx = new_context(&herd);
            if exclude {
                ctx.arg.exclude_libs = vec!["libx.a".to_string()];
            }

            let mut main_o = ObjectFile::new("main.o", None);
            push_section(&mut ctx, &mut main_o, b".text", elf::SHT_PROGBITS, AX, 8, 8);
            main_o.elf_syms = vec![
                InputSymbol::undefined(b"api"),
                InputSymbol::undefined(b"dso_func"),
            ];
            ctx.add_object(main_o);

            let mut x_o = ObjectFile::new("x.o", Some("libx.a".to_string()));
            let sec = push_section(&mut ctx, &mut x_o, b".text", elf::SHT_PROGBITS, AX, 8, 8);
            x_o.elf_syms = vec![InputSymbol::defined(b"api", sec)];
            ctx.add_object(x_o);

            let mut dso = SharedFile::new("libz.so.1");
            dso.elf_syms = vec![
                InputSymbol::defined(b"dso_func", 0).with_type(elf::STT_FUNC)
            ];
            ctx.add_dso(dso, &[b"api"]);

            apply_exclude_libs(&mut ctx);
            resolve_all(&mut ctx);
            compute_import_export(&mut ctx);

            let api = ctx.symbol_db.symbol(ctx.symbol_db.get(b"api").unwrap());
            assert_eq!(api.is_exported(), !exclude);
        }
    }

    #[test]
    fn verneed_assigns_fresh_indices_per_library_version() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);
        ctx.arg.dynamic_linker = Some("/lib64/ld-linux-x86-64.so.2".to_string());

        let mut main_o = ObjectFile::new("main.o", None);
        let mut isec = ctx.new_input_section(b".text", elf::SHT_PROGBITS, AX, 0x10, 16);
        isec.relocations = vec![Rela {
            offset: 0x2,
            r_type: elf::R_X86_64_PLT32,
            symbol: 0,
            addend: -4,
        }];
        main_o.sections.push(Some(isec));
        main_o.elf_syms = vec![InputSymbol::undefined(b"func")];
        ctx.add_object(main_o);

        let mut dso = SharedFile::new("libc.so.6");
        dso.elf_syms = vec![
            InputSymbol::defined(b"func", 0)
                .with_type(elf::STT_FUNC)
                .with_value(0x10),
        ];
        dso.versym = vec![2];
        dso.version_names = vec![&b""[..], &b""[..], &b"GLIBC_2.2.5"[..]];
        ctx.add_dso(dso, &[]);

        resolve_all(&mut ctx);
        convert_undefined_weak_symbols(&mut ctx);
        scan_rels::<ElfX86_64>(&mut ctx).unwrap();
        fill_verneed(&mut ctx);

        let func = ctx.symbol_db.symbol(ctx.symbol_db.get(b"func").unwrap());
        let dynsym_idx = func.dynsym_idx().unwrap() as usize;
        // No user-defined versions, so the first needed version gets
        // index 2.
        assert_eq!(ctx.synthetic.versym_contents[dynsym_idx], 2);
        assert_eq!(ctx.synthetic.versym_contents[0], 0);
        assert_eq!(ctx.synthetic.verneed.shdr.sh_info, 1);
        assert_eq!(ctx.synthetic.verneed_contents.len(), 32);
    }

    #[test]
    fn versym_agrees_with_ver_idx_for_exported_symbols() {
        let herd = Herd::new();
        let mut ctx = Context::new(
            Args {
                shared: true,
                output: "libfoo.so.1".to_string(),
                version_definitions: vec!["V1".to_string()],
                version_patterns: vec![VersionPattern {
                    pattern: "f*".to_string(),
                    is_extern_cpp: false,
                    ver_idx: 2,
                }],
                ..Args::default()
            },
            vec!["weld".to_string()],
            &herd,
        );

        let mut a_o = ObjectFile::new("a.o", None);
        let sec = push_section(&mut ctx, &mut a_o, b".text", elf::SHT_PROGBITS, AX, 8, 8);
        a_o.elf_syms =
            vec![InputSymbol::defined(b"foo", sec).with_type(elf::STT_FUNC)];
        ctx.add_object(a_o);

        resolve_all(&mut ctx);
        apply_version_script(&mut ctx);
        compute_import_export(&mut ctx);
        scan_rels::<ElfX86_64>(&mut ctx).unwrap();
        fill_verdef(&mut ctx);

        let foo = ctx.symbol_db.symbol(ctx.symbol_db.get(b"foo").unwrap());
        assert!(foo.is_exported());
        assert!(foo.is_imported());
        assert_eq!(foo.ver_idx(), 2);
        let dynsym_idx = foo.dynsym_idx().unwrap() as usize;
        assert_eq!(ctx.synthetic.versym_contents[dynsym_idx], 2);
        assert_eq!(ctx.synthetic.versym_contents[0], 0);
        // Base verdef plus one user-defined version.
        assert_eq!(ctx.synthetic.verdef.as_ref().unwrap().shdr.sh_info, 2);
    }

    fn build_end_to_end<'data>(herd: &'data Herd) -> Context<'data> {
        let mut ctx = new_context(herd);
        ctx.arg.dynamic_linker = Some("/lib64/ld-linux-x86-64.so.2".to_string());

        let mut main_o = ObjectFile::new("main.o", None);
        let mut text = ctx.new_input_section(b".text", elf::SHT_PROGBITS, AX, 0x40, 16);
        text.relocations = vec![Rela {
            offset: 0x2,
            r_type: elf::R_X86_64_PLT32,
            symbol: 1,
            addend: -4,
        }];
        main_o.sections.push(Some(text));
        push_section(
            &mut ctx,
            &mut main_o,
            b".data",
            elf::SHT_PROGBITS,
            (elf::SHF_ALLOC | elf::SHF_WRITE) as u64,
            0x10,
            8,
        );
        push_section(
            &mut ctx,
            &mut main_o,
            b".bss",
            elf::SHT_NOBITS,
            (elf::SHF_ALLOC | elf::SHF_WRITE) as u64,
            0x20,
            8,
        );
        main_o.elf_syms = vec![
            InputSymbol::defined(b"_start", 0).with_type(elf::STT_FUNC),
            InputSymbol::undefined(b"puts"),
        ];
        ctx.add_object(main_o);

        let mut libc = SharedFile::new("libc.so.6");
        libc.elf_syms = vec![
            InputSymbol::defined(b"puts", 0)
                .with_type(elf::STT_FUNC)
                .with_value(0x5000),
        ];
        ctx.add_dso(libc, &[]);
        ctx
    }

    #[test]
    fn end_to_end_layout_is_ordered_and_deterministic() {
        let herd = Herd::new();
        let mut ctx = build_end_to_end(&herd);
        let filesize = run_passes::<ElfX86_64>(&mut ctx).unwrap();
        assert!(filesize > 0);

        // Rank order holds over the final chunk list.
        let ranks: Vec<u32> = ctx.chunks.iter().map(section_rank).collect();
        assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "{ranks:?}");

        // __bss_start brackets the start of .bss, _etext the end of the
        // last executable chunk.
        let bss = ctx.chunks.iter().find(|c| c.name == b".bss").unwrap();
        let bss_start = ctx.symbol_db.get(b"__bss_start").unwrap();
        assert_eq!(
            ctx.symbol_db.symbol(bss_start).resolution().value,
            bss.shdr.sh_addr
        );
        let etext_addr = ctx
            .chunks
            .iter()
            .filter(|c| c.shdr.sh_flags & u64::from(elf::SHF_EXECINSTR) != 0)
            .map(|c| c.shdr.sh_addr + c.shdr.sh_size)
            .last()
            .unwrap();
        let etext = ctx.symbol_db.get(b"_etext").unwrap();
        assert_eq!(ctx.symbol_db.symbol(etext).resolution().value, etext_addr);

        // The PLT made it into the output with its stub for puts.
        assert!(ctx.chunks.iter().any(|c| c.name == b".plt"));
        let puts = ctx.symbol_db.symbol(ctx.symbol_db.get(b"puts").unwrap());
        assert_eq!(puts.plt_idx(), Some(1));

        // Identical inputs produce identical layouts.
        let herd2 = Herd::new();
        let mut ctx2 = build_end_to_end(&herd2);
        let filesize2 = run_passes::<ElfX86_64>(&mut ctx2).unwrap();
        assert_eq!(filesize, filesize2);
        let summary = |ctx: &Context| {
            ctx.chunks
                .iter()
                .map(|c| (c.name.to_vec(), c.shdr.sh_addr, c.shdr.sh_offset, c.shdr.sh_size))
                .collect::<Vec<_>>()
        };
        assert_eq!(summary(&ctx), summary(&ctx2));
    }

    #[test]
    fn clear_padding_zeroes_gaps_only() {
        let herd = Herd::new();
        let mut ctx = new_context(&herd);
        ctx.arg.image_base = 0;

        for (name, size, align) in [(&b".text"[..], 8u64, 16u64), (&b".rodata"[..], 8, 16)] {
            ctx.chunks.push(OutputChunk::new(
                name,
                ChunkKind::Regular,
                SectionHeader {
                    sh_type: elf::SHT_PROGBITS,
                    sh_flags: ALLOC,
                    sh_size: size,
                    sh_addralign: align,
                    ..SectionHeader::default()
                },
                ChunkSource::Regular(OutputSectionId(0)),
            ));
        }
        let filesize = set_osec_offsets::<ElfX86_64>(&mut ctx);
        assert_eq!(filesize, 0x18);

        let mut buf = vec![0xaau8; filesize as usize];
        clear_padding(&ctx, &mut buf);

        // Chunk contents are untouched, the alignment gap is zeroed.
        assert!(buf[0..8].iter().all(|&b| b == 0xaa));
        assert!(buf[8..16].iter().all(|&b| b == 0));
        assert!(buf[16..24].iter().all(|&b| b == 0xaa));
    }
}
