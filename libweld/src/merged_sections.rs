//! Merge sections deduplicate small constants (string literals, literal
//! pools) across all input files. Each distinct piece of content becomes one
//! fragment; alive fragments get stable offsets within the output section.

use crate::elf::SectionHeader;
use crate::alignment::align_to;
use hashbrown::HashMap;
use itertools::Itertools;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;

#[derive(Clone, Copy, derive_more::Debug, PartialEq, Eq)]
#[debug("merged-{_0}")]
pub struct MergedSectionId(pub(crate) u32);

impl MergedSectionId {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub struct Fragment<'data> {
    pub data: &'data [u8],
    pub alignment: u64,
    pub is_alive: AtomicBool,
    pub offset: u64,
}

pub struct MergedSection<'data> {
    pub name: &'data [u8],
    pub shdr: SectionHeader,
    pub(crate) fragments: Vec<Fragment<'data>>,
    by_content: HashMap<&'data [u8], u32>,
}

impl<'data> MergedSection<'data> {
    pub(crate) fn new(name: &'data [u8], sh_type: u32, sh_flags: u64) -> MergedSection<'data> {
        MergedSection {
            name,
            shdr: SectionHeader {
                sh_type,
                sh_flags,
                sh_addralign: 1,
                ..SectionHeader::default()
            },
            fragments: Vec::new(),
            by_content: HashMap::new(),
        }
    }

    /// Adds `data`, deduplicating against identical content. The fragment's
    /// alignment is the strictest alignment any inserter asked for.
    pub fn insert(&mut self, data: &'data [u8], alignment: u64) -> u32 {
        match self.by_content.entry(data) {
            hashbrown::hash_map::Entry::Occupied(e) => {
                let index = *e.get();
                let frag = &mut self.fragments[index as usize];
                frag.alignment = frag.alignment.max(alignment);
                index
            }
            hashbrown::hash_map::Entry::Vacant(e) => {
                let index = self.fragments.len() as u32;
                self.fragments.push(Fragment {
                    data,
                    alignment,
                    is_alive: AtomicBool::new(false),
                    offset: 0,
                });
                e.insert(index);
                index
            }
        }
    }

    pub fn fragment(&self, index: u32) -> &Fragment<'data> {
        &self.fragments[index as usize]
    }

    /// Assigns a stable offset to every alive fragment. Offsets are
    /// content-ordered so the result doesn't depend on insertion order.
    pub(crate) fn assign_offsets(&mut self) {
        let order = (0..self.fragments.len())
            .filter(|&i| self.fragments[i].is_alive.load(Relaxed))
            .sorted_by_key(|&i| (self.fragments[i].data, self.fragments[i].alignment))
            .collect_vec();

        let mut offset = 0;
        let mut align = 1;
        for i in order {
            let frag = &mut self.fragments[i];
            offset = align_to(offset, frag.alignment);
            frag.offset = offset;
            offset += frag.data.len() as u64;
            align = align.max(frag.alignment);
        }
        self.shdr.sh_size = offset;
        self.shdr.sh_addralign = align;
    }
}
