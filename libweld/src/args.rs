//! The argument record consumed by the pass pipeline. Command-line parsing
//! itself happens upstream; the pipeline only reads the decoded form.

/// One pattern from a version script, in declaration order. Later patterns
/// override earlier ones when both match a symbol.
#[derive(Debug, Clone)]
pub struct VersionPattern {
    pub pattern: String,
    pub is_extern_cpp: bool,
    pub ver_idx: u16,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BuildIdKind {
    #[default]
    None,
    Hash,
    Uuid,
}

impl BuildIdKind {
    pub(crate) fn digest_size(self) -> u64 {
        match self {
            BuildIdKind::None => 0,
            BuildIdKind::Hash => 20,
            BuildIdKind::Uuid => 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Args {
    pub exclude_libs: Vec<String>,
    pub undefined: Vec<String>,
    pub dynamic_linker: Option<String>,
    pub build_id: BuildIdKind,
    pub eh_frame_hdr: bool,
    pub hash_style_sysv: bool,
    pub hash_style_gnu: bool,
    pub version_definitions: Vec<String>,
    pub version_patterns: Vec<VersionPattern>,
    pub shared: bool,
    pub export_dynamic: bool,
    pub bsymbolic: bool,
    pub bsymbolic_functions: bool,
    pub soname: Option<String>,
    pub output: String,
    pub image_base: u64,
    pub gc_sections: bool,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            exclude_libs: Vec::new(),
            undefined: Vec::new(),
            dynamic_linker: None,
            build_id: BuildIdKind::None,
            eh_frame_hdr: false,
            hash_style_sysv: true,
            hash_style_gnu: true,
            version_definitions: Vec::new(),
            version_patterns: Vec::new(),
            shared: false,
            export_dynamic: false,
            bsymbolic: false,
            bsymbolic_functions: false,
            soname: None,
            output: "a.out".to_string(),
            image_base: 0x40_0000,
            gc_sections: false,
        }
    }
}
