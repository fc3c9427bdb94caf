//! The x86-64 target: relocation-scanning policy for the `R_X86_64_*`
//! relocation types.

use crate::error::Result;
use crate::symbol_db::SymbolFlags;
use crate::target::RelocSymbolInfo;
use crate::target::Target;
use anyhow::bail;
use object::elf;

pub struct ElfX86_64;

impl Target for ElfX86_64 {
    const PAGE_SIZE: u64 = 0x1000;
    const NAME: &'static str = "x86_64";

    fn scan_relocation(r_type: u32, sym: &RelocSymbolInfo) -> Result<SymbolFlags> {
        let flags = match r_type {
            elf::R_X86_64_NONE => SymbolFlags::empty(),

            elf::R_X86_64_8
            | elf::R_X86_64_16
            | elf::R_X86_64_32
            | elf::R_X86_64_32S
            | elf::R_X86_64_64
            | elf::R_X86_64_PC8
            | elf::R_X86_64_PC16
            | elf::R_X86_64_PC32
            | elf::R_X86_64_PC64 => direct_flags(sym),

            elf::R_X86_64_PLT32 | elf::R_X86_64_PLTOFF64 => {
                if sym.is_imported {
                    SymbolFlags::NEEDS_PLT
                } else {
                    SymbolFlags::empty()
                }
            }

            elf::R_X86_64_GOT32
            | elf::R_X86_64_GOT64
            | elf::R_X86_64_GOTPC32
            | elf::R_X86_64_GOTPC64
            | elf::R_X86_64_GOTOFF64
            | elf::R_X86_64_GOTPCREL
            | elf::R_X86_64_GOTPCREL64
            | elf::R_X86_64_GOTPCRELX
            | elf::R_X86_64_REX_GOTPCRELX => SymbolFlags::NEEDS_GOT,

            elf::R_X86_64_GOTTPOFF => SymbolFlags::NEEDS_GOTTPOFF,
            elf::R_X86_64_TLSGD => SymbolFlags::NEEDS_TLSGD,
            elf::R_X86_64_TLSLD => SymbolFlags::NEEDS_TLSLD,
            elf::R_X86_64_GOTPC32_TLSDESC => SymbolFlags::NEEDS_TLSDESC,

            elf::R_X86_64_TLSDESC_CALL
            | elf::R_X86_64_TPOFF32
            | elf::R_X86_64_TPOFF64
            | elf::R_X86_64_DTPOFF32
            | elf::R_X86_64_DTPOFF64
            | elf::R_X86_64_DTPMOD64 => SymbolFlags::empty(),

            _ => bail!("unsupported relocation type {r_type} for {}", Self::NAME),
        };
        Ok(flags)
    }
}

/// Policy for relocations that want the symbol's address directly. A
/// reference to an imported function goes through a PLT stub; a reference
/// to imported data from a non-PIC executable copies the datum into the
/// executable's BSS. Position independent outputs leave data references to
/// the dynamic relocation machinery.
fn direct_flags(sym: &RelocSymbolInfo) -> SymbolFlags {
    if !sym.is_imported {
        return SymbolFlags::empty();
    }
    if sym.is_func {
        return SymbolFlags::NEEDS_PLT;
    }
    if sym.pic {
        SymbolFlags::empty()
    } else {
        SymbolFlags::NEEDS_COPYREL
    }
}
