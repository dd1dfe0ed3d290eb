//! Relocation types shared between the host backend and the object writers.

/// Kind of relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// PC-relative call or tail jump (e.g., R_X86_64_PLT32 on x86-64).
    Call,
    /// PC-relative data reference (e.g., R_X86_64_PC32 on x86-64).
    PcRel,
    /// Absolute pointer-sized reference (e.g., R_X86_64_64 on x86-64).
    Abs64,
}

/// A relocation against a named symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset in the containing buffer where the relocated field starts.
    pub offset: usize,
    /// The symbol name this relocation targets.
    pub symbol: String,
    /// Kind of relocation.
    pub kind: RelocKind,
    /// Constant added to the symbol value. PC-relative kinds get the
    /// target's own displacement bias on top of this.
    pub addend: i64,
}

impl Relocation {
    pub fn new(offset: usize, symbol: impl Into<String>, kind: RelocKind) -> Self {
        Self {
            offset,
            symbol: symbol.into(),
            kind,
            addend: 0,
        }
    }

    pub fn abs64(offset: usize, symbol: impl Into<String>, addend: i64) -> Self {
        Self {
            offset,
            symbol: symbol.into(),
            kind: RelocKind::Abs64,
            addend,
        }
    }
}
