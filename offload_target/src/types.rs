//! Object-level types shared between the pipeline stages and the object
//! writers.

use crate::reloc::Relocation;

/// Symbol binding in the emitted object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Binding {
    /// File-local (STB_LOCAL).
    Local,
    #[default]
    Global,
    /// Weak (STB_WEAK), so identical definitions across objects merge.
    Weak,
}

/// Symbol visibility in the emitted object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolVisibility {
    #[default]
    Default,
    /// STV_PROTECTED: exported, but never pre-empted by another definition.
    Protected,
    Hidden,
}

/// A compiled function ready for object file emission.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub name: String,
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub binding: Binding,
    pub visibility: SymbolVisibility,
}

impl CompiledFunction {
    pub fn local(name: impl Into<String>, code: Vec<u8>, relocations: Vec<Relocation>) -> Self {
        Self {
            name: name.into(),
            code,
            relocations,
            binding: Binding::Local,
            visibility: SymbolVisibility::Default,
        }
    }
}

/// A static data blob to be placed in a data section.
#[derive(Debug, Clone)]
pub struct StaticData {
    pub name: String,
    pub data: Vec<u8>,
    /// Relocations within the data (e.g. pointers in descriptor records).
    pub relocations: Vec<Relocation>,
    /// If true, place in a writable section (.data) instead of .rodata.
    pub writable: bool,
    pub binding: Binding,
    pub visibility: SymbolVisibility,
    pub align: u64,
}

impl StaticData {
    /// A read-only, file-local blob.
    pub fn local(name: impl Into<String>, data: Vec<u8>, relocations: Vec<Relocation>) -> Self {
        Self {
            name: name.into(),
            data,
            relocations,
            writable: false,
            binding: Binding::Local,
            visibility: SymbolVisibility::Default,
            align: 8,
        }
    }
}

/// Zero-initialized data. Occupies no space in the object file.
#[derive(Debug, Clone)]
pub struct ZeroFill {
    pub name: String,
    pub size: u64,
    pub binding: Binding,
    pub visibility: SymbolVisibility,
    pub align: u64,
}

/// How a named section is flagged in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionFlavor {
    /// Allocated, read-only data.
    ReadOnly,
    /// Allocated, writable data.
    Writable,
    /// Carried in the object but dropped by the host linker (SHF_EXCLUDE).
    Excluded,
    /// Pointer array run at process start.
    InitArray,
    /// Pointer array run at process exit.
    FiniArray,
}

/// A symbol defined inside a [`CustomSection`].
#[derive(Debug, Clone)]
pub struct SectionSymbol {
    pub name: String,
    pub offset: u64,
    pub size: u64,
    pub binding: Binding,
}

/// A section with an explicit name, emitted as-is.
#[derive(Debug, Clone)]
pub struct CustomSection {
    pub name: String,
    pub flavor: SectionFlavor,
    pub align: u64,
    pub data: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub symbols: Vec<SectionSymbol>,
}

impl CustomSection {
    pub fn new(name: impl Into<String>, flavor: SectionFlavor, align: u64) -> Self {
        Self {
            name: name.into(),
            flavor,
            align,
            data: Vec::new(),
            relocations: Vec::new(),
            symbols: Vec::new(),
        }
    }
}

/// Everything that goes into one emitted object file.
#[derive(Debug, Clone, Default)]
pub struct ObjectModule {
    pub functions: Vec<CompiledFunction>,
    pub statics: Vec<StaticData>,
    pub zero_fill: Vec<ZeroFill>,
    pub sections: Vec<CustomSection>,
}
