//! Target descriptor abstraction. The pipeline is written once against this
//! trait; an instantiation supplies the page size and the
//! relocation-scanning policy for its architecture.

use crate::error::Result;
use crate::symbol_db::SymbolFlags;

/// What the scanner knows about a relocation's referenced symbol when it
/// decides which auxiliary resources to request.
#[derive(Debug, Clone, Copy)]
pub struct RelocSymbolInfo {
    pub is_imported: bool,
    pub is_func: bool,
    /// Whether the output is position independent (a shared object).
    pub pic: bool,
}

pub trait Target: Send + Sync + 'static {
    const PAGE_SIZE: u64;
    const NAME: &'static str;

    /// Maps one relocation type to the resources its referenced symbol
    /// needs. Fails on relocation types the target doesn't know.
    fn scan_relocation(r_type: u32, sym: &RelocSymbolInfo) -> Result<SymbolFlags>;
}
