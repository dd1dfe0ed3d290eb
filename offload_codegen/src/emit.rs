//! ELF object file emission using the `object` crate.

use std::collections::HashMap;

use object::write::{
    Object, Relocation as ObjRelocation, StandardSection, Symbol, SymbolId, SymbolSection,
};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SectionFlags, SectionKind, SymbolFlags, SymbolKind, SymbolScope, elf,
};

use offload_target::backend::EmitError;
use offload_target::reloc::{RelocKind, Relocation};
use offload_target::types::{Binding, ObjectModule, SectionFlavor, SymbolVisibility};

/// ELF flavour of one emitted object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfTarget {
    pub architecture: Architecture,
    pub endianness: Endianness,
}

impl ElfTarget {
    pub const X86_64: ElfTarget = ElfTarget {
        architecture: Architecture::X86_64,
        endianness: Endianness::Little,
    };
}

fn reloc_flags(
    arch: Architecture,
    reloc: &Relocation,
) -> Option<(RelocationFlags, i64)> {
    let (kind, encoding, size, bias) = match (arch, reloc.kind) {
        (_, RelocKind::Abs64) => (RelocationKind::Absolute, RelocationEncoding::Generic, 64, 0),
        (Architecture::X86_64, RelocKind::Call) => (
            RelocationKind::PltRelative,
            RelocationEncoding::X86Branch,
            32,
            -4,
        ),
        (Architecture::X86_64, RelocKind::PcRel) => {
            (RelocationKind::Relative, RelocationEncoding::Generic, 32, -4)
        }
        _ => return None,
    };
    Some((
        RelocationFlags::Generic {
            kind,
            encoding,
            size,
        },
        reloc.addend + bias,
    ))
}

fn scope_of(binding: Binding, visibility: SymbolVisibility) -> SymbolScope {
    match (binding, visibility) {
        (Binding::Local, _) => SymbolScope::Compilation,
        (_, SymbolVisibility::Hidden) => SymbolScope::Linkage,
        _ => SymbolScope::Dynamic,
    }
}

/// Symbol flags: only protected symbols need explicit ELF bits.
fn symbol_flags(
    kind: SymbolKind,
    binding: Binding,
    visibility: SymbolVisibility,
) -> SymbolFlags<object::write::SectionId, SymbolId> {
    if binding == Binding::Local || visibility != SymbolVisibility::Protected {
        return SymbolFlags::None;
    }
    let bind = if binding == Binding::Weak {
        elf::STB_WEAK
    } else {
        elf::STB_GLOBAL
    };
    let ty = if kind == SymbolKind::Text {
        elf::STT_FUNC
    } else {
        elf::STT_OBJECT
    };
    SymbolFlags::Elf {
        st_info: (bind << 4) | ty,
        st_other: elf::STV_PROTECTED,
    }
}

fn section_kind(flavor: SectionFlavor) -> (SectionKind, u64) {
    let alloc = u64::from(elf::SHF_ALLOC);
    let write = u64::from(elf::SHF_WRITE);
    match flavor {
        SectionFlavor::ReadOnly => (SectionKind::ReadOnlyData, alloc),
        SectionFlavor::Writable => (SectionKind::Data, alloc | write),
        SectionFlavor::Excluded => (
            SectionKind::Elf(elf::SHT_PROGBITS),
            u64::from(elf::SHF_EXCLUDE),
        ),
        SectionFlavor::InitArray => (SectionKind::Elf(elf::SHT_INIT_ARRAY), alloc | write),
        SectionFlavor::FiniArray => (SectionKind::Elf(elf::SHT_FINI_ARRAY), alloc | write),
    }
}

struct PendingRelocs<'m> {
    container: &'m str,
    section: object::write::SectionId,
    base: u64,
    relocations: &'m [Relocation],
}

/// Emit functions, static data and named sections as one ELF object file.
///
/// All definitions are laid out first so relocations can reference any
/// symbol defined in this object regardless of order; every other name
/// becomes an undefined reference.
pub fn emit_object(target: ElfTarget, module: &ObjectModule) -> Result<Vec<u8>, EmitError> {
    let mut obj = Object::new(BinaryFormat::Elf, target.architecture, target.endianness);

    let mut sym_map: HashMap<String, SymbolId> = HashMap::new();
    let mut pending: Vec<PendingRelocs<'_>> = Vec::new();

    // Named sections first so their symbols are known.
    for sec in &module.sections {
        let (kind, sh_flags) = section_kind(sec.flavor);
        let id = obj.add_section(Vec::new(), sec.name.as_bytes().to_vec(), kind);
        obj.section_mut(id).flags = SectionFlags::Elf { sh_flags };
        obj.set_section_data(id, sec.data.clone(), sec.align.max(1));
        for sym in &sec.symbols {
            let sid = obj.add_symbol(Symbol {
                name: sym.name.as_bytes().to_vec(),
                value: sym.offset,
                size: sym.size,
                kind: SymbolKind::Data,
                scope: scope_of(sym.binding, SymbolVisibility::Default),
                weak: sym.binding == Binding::Weak,
                section: SymbolSection::Section(id),
                flags: SymbolFlags::None,
            });
            sym_map.insert(sym.name.clone(), sid);
        }
        if !sec.relocations.is_empty() {
            pending.push(PendingRelocs {
                container: &sec.name,
                section: id,
                base: 0,
                relocations: &sec.relocations,
            });
        }
    }

    // Static data: plain data in .rodata, data with relocations in
    // .data.rel.ro, writable data in .data. Zero-fill goes to .bss.
    for sd in &module.statics {
        let standard = if sd.writable {
            StandardSection::Data
        } else if sd.relocations.is_empty() {
            StandardSection::ReadOnlyData
        } else {
            StandardSection::ReadOnlyDataWithRel
        };
        let section = obj.section_id(standard);
        let offset = obj.append_section_data(section, &sd.data, sd.align.max(1));
        let sid = obj.add_symbol(Symbol {
            name: sd.name.as_bytes().to_vec(),
            value: offset,
            size: sd.data.len() as u64,
            kind: SymbolKind::Data,
            scope: scope_of(sd.binding, sd.visibility),
            weak: sd.binding == Binding::Weak,
            section: SymbolSection::Section(section),
            flags: symbol_flags(SymbolKind::Data, sd.binding, sd.visibility),
        });
        sym_map.insert(sd.name.clone(), sid);
        if !sd.relocations.is_empty() {
            pending.push(PendingRelocs {
                container: &sd.name,
                section,
                base: offset,
                relocations: &sd.relocations,
            });
        }
    }

    if !module.zero_fill.is_empty() {
        let bss = obj.section_id(StandardSection::UninitializedData);
        for zf in &module.zero_fill {
            let sid = obj.add_symbol(Symbol {
                name: zf.name.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::Data,
                scope: scope_of(zf.binding, zf.visibility),
                weak: zf.binding == Binding::Weak,
                section: SymbolSection::Undefined,
                flags: symbol_flags(SymbolKind::Data, zf.binding, zf.visibility),
            });
            obj.add_symbol_bss(sid, bss, zf.size, zf.align.max(1));
            sym_map.insert(zf.name.clone(), sid);
        }
    }

    if !module.functions.is_empty() {
        let text = obj.section_id(StandardSection::Text);
        for func in &module.functions {
            let code_offset = obj.append_section_data(text, &func.code, 16);
            let sid = obj.add_symbol(Symbol {
                name: func.name.as_bytes().to_vec(),
                value: code_offset,
                size: func.code.len() as u64,
                kind: SymbolKind::Text,
                scope: scope_of(func.binding, func.visibility),
                weak: func.binding == Binding::Weak,
                section: SymbolSection::Section(text),
                flags: symbol_flags(SymbolKind::Text, func.binding, func.visibility),
            });
            sym_map.insert(func.name.clone(), sid);
            if !func.relocations.is_empty() {
                pending.push(PendingRelocs {
                    container: &func.name,
                    section: text,
                    base: code_offset,
                    relocations: &func.relocations,
                });
            }
        }
    }

    for group in pending {
        for reloc in group.relocations {
            // Reuse the symbol if it is defined in this object file,
            // otherwise create an undefined external reference.
            let sym_id = if let Some(&existing) = sym_map.get(&reloc.symbol) {
                existing
            } else {
                let kind = if reloc.kind == RelocKind::Call {
                    SymbolKind::Text
                } else {
                    SymbolKind::Unknown
                };
                let sid = obj.add_symbol(Symbol {
                    name: reloc.symbol.as_bytes().to_vec(),
                    value: 0,
                    size: 0,
                    kind,
                    scope: SymbolScope::Unknown,
                    weak: false,
                    section: SymbolSection::Undefined,
                    flags: SymbolFlags::None,
                });
                sym_map.insert(reloc.symbol.clone(), sid);
                sid
            };

            let (flags, addend) =
                reloc_flags(target.architecture, reloc).ok_or_else(|| EmitError::Relocation {
                    container: group.container.to_string(),
                    symbol: reloc.symbol.clone(),
                    message: format!("{:?} is not supported on {:?}", reloc.kind, target.architecture),
                })?;
            obj.add_relocation(
                group.section,
                ObjRelocation {
                    offset: group.base + reloc.offset as u64,
                    symbol: sym_id,
                    addend,
                    flags,
                },
            )
            .map_err(|e| EmitError::Relocation {
                container: group.container.to_string(),
                symbol: reloc.symbol.clone(),
                message: e.to_string(),
            })?;
        }
    }

    obj.write().map_err(|e| EmitError::Write(e.to_string()))
}
