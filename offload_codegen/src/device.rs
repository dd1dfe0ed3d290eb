//! Per-target device compilation.
//!
//! Builds a [`DeviceModule`] from the translation unit, gives every symbol
//! the host depends on protected visibility, pulls in runtime-support
//! modules and checks the exports against the host's entry list. The
//! result is either a native relocatable object or portable IR, which is
//! deferred to link time.

use std::collections::BTreeSet;

use object::{Architecture, Endianness};
use offload_ir::link;
use offload_ir::module::{
    DeviceFunction, DeviceGlobal, DeviceModule, FunctionKind, Linkage, Symbol, Visibility,
};
use offload_ir::verifier::verify_module;
use offload_target::entry::LINK_REF_SUFFIX;
use offload_target::layout::POINTER_SIZE;
use offload_target::types::{
    Binding, CompiledFunction, ObjectModule, StaticData, SymbolVisibility, ZeroFill,
};
use offload_target::{ArchFamily, TargetId};
use tracing::{debug, info};

use crate::collect::{ExportKind, ExportList, MapKind, TranslationUnit, region_entry_name};
use crate::emit::{ElfTarget, emit_object};
use crate::error::CodegenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceObjectKind {
    /// Relocatable ELF for the device architecture.
    Native,
    /// Serialized [`DeviceModule`], finished at link time.
    PortableIr,
}

/// One device artifact, ready to be embedded.
#[derive(Debug, Clone)]
pub struct DeviceObject {
    pub target: TargetId,
    pub kind: DeviceObjectKind,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DeviceCompileOptions {
    pub target: TargetId,
    /// Defer code generation to link time even for native-capable targets.
    pub whole_program: bool,
    /// Runtime-support modules, linked only when they define something needed.
    pub runtime_libraries: Vec<DeviceModule>,
}

impl DeviceCompileOptions {
    pub fn new(target: TargetId) -> Self {
        Self {
            target,
            whole_program: false,
            runtime_libraries: Vec::new(),
        }
    }
}

/// Lower the translation unit's device side into a module for `target`.
///
/// Names referenced but not defined here become declarations, to be
/// resolved by runtime libraries or at device link time.
pub fn build_device_module(tu: &TranslationUnit, target: &TargetId) -> DeviceModule {
    let mut module = DeviceModule::new(target.clone());

    for region in &tu.regions {
        let name = region_entry_name(tu.file_id, region);
        module.add_function(
            DeviceFunction::definition(name, FunctionKind::Kernel, region.device_code.clone())
                .with_references(region.references.iter().cloned()),
        );
    }
    for func in &tu.functions {
        module.add_function(
            DeviceFunction::definition(&func.name, FunctionKind::Device, func.device_code.clone())
                .with_references(func.references.iter().cloned()),
        );
    }
    for var in &tu.variables {
        match var.map {
            MapKind::To => {
                module.add_global(DeviceGlobal::definition(&var.name, var.size, var.init.clone()))
            }
            // The device copy lives behind a pointer the runtime fills in.
            MapKind::Link => module.add_global(DeviceGlobal::definition(
                format!("{}{LINK_REF_SUFFIX}", var.name),
                POINTER_SIZE as u64,
                None,
            )),
        }
    }

    let missing: BTreeSet<String> = module
        .functions
        .iter()
        .flat_map(|f| f.references.iter())
        .filter(|r| module.symbol(r).is_none())
        .cloned()
        .collect();
    for name in missing {
        module.add_function(DeviceFunction::declaration(name));
    }
    module
}

fn mark_protected(module: &mut DeviceModule, exports: &ExportList) {
    for f in &mut module.functions {
        if exports.contains(&f.name) {
            f.visibility = f.visibility.merge(Visibility::Protected);
        }
    }
    for g in &mut module.globals {
        if exports.contains(&g.name) {
            g.visibility = g.visibility.merge(Visibility::Protected);
        }
    }
}

/// Every symbol the host metadata names must be an exported definition of
/// the right shape.
pub fn check_exports(module: &DeviceModule, exports: &ExportList) -> Result<(), CodegenError> {
    let target = &module.target;
    for (name, kind) in exports.iter() {
        let mismatch = |reason: String| CodegenError::ExportMismatch {
            target: target.clone(),
            symbol: name.to_string(),
            reason,
        };
        let symbol = match module.symbol(name) {
            Some(s) if s.is_definition() => s,
            _ => {
                return Err(CodegenError::MissingExport {
                    target: target.clone(),
                    symbol: name.to_string(),
                });
            }
        };
        if symbol.linkage() == Linkage::Internal {
            return Err(mismatch("symbol has internal linkage".into()));
        }
        if symbol.visibility() == Visibility::Hidden {
            return Err(mismatch("symbol is hidden".into()));
        }
        match (kind, symbol) {
            (ExportKind::Kernel, Symbol::Function(f)) if f.kind == FunctionKind::Kernel => {}
            (ExportKind::Kernel, _) => return Err(mismatch("expected a kernel".into())),
            (ExportKind::Variable { size }, Symbol::Global(g)) => {
                if g.size != size {
                    return Err(mismatch(format!(
                        "host expects {size} bytes, device defines {}",
                        g.size
                    )));
                }
            }
            (ExportKind::Variable { .. }, _) => {
                return Err(mismatch("expected a variable".into()));
            }
        }
    }
    Ok(())
}

/// Object format parameters for device families that have one.
pub fn native_target(family: ArchFamily) -> Option<ElfTarget> {
    let architecture = match family {
        ArchFamily::X86_64 => Architecture::X86_64,
        ArchFamily::Aarch64 => Architecture::Aarch64,
        ArchFamily::Riscv64 => Architecture::Riscv64,
        ArchFamily::PowerPc64Le => Architecture::PowerPc64,
        ArchFamily::Nvptx64 | ArchFamily::Amdgcn | ArchFamily::Spirv64 => return None,
    };
    Some(ElfTarget {
        architecture,
        endianness: Endianness::Little,
    })
}

fn binding_of(linkage: Linkage) -> Binding {
    match linkage {
        Linkage::External => Binding::Global,
        Linkage::Weak => Binding::Weak,
        Linkage::Internal => Binding::Local,
    }
}

fn visibility_of(visibility: Visibility) -> SymbolVisibility {
    match visibility {
        Visibility::Default => SymbolVisibility::Default,
        Visibility::Protected => SymbolVisibility::Protected,
        Visibility::Hidden => SymbolVisibility::Hidden,
    }
}

/// Lay a device module out as an object module. Declarations are left to
/// the device linker; globals without an initializer are zero-filled.
pub fn lower_to_object(module: &DeviceModule) -> ObjectModule {
    let mut out = ObjectModule::default();
    for f in &module.functions {
        let Some(body) = &f.body else { continue };
        out.functions.push(CompiledFunction {
            name: f.name.clone(),
            code: body.clone(),
            relocations: Vec::new(),
            binding: binding_of(f.linkage),
            visibility: visibility_of(f.visibility),
        });
    }
    for g in module.globals.iter().filter(|g| !g.declaration) {
        let binding = binding_of(g.linkage);
        let visibility = visibility_of(g.visibility);
        match &g.init {
            Some(init) => out.statics.push(StaticData {
                name: g.name.clone(),
                data: init.clone(),
                relocations: Vec::new(),
                writable: true,
                binding,
                visibility,
                align: 8,
            }),
            None => out.zero_fill.push(ZeroFill {
                name: g.name.clone(),
                size: g.size,
                binding,
                visibility,
                align: 8,
            }),
        }
    }
    out
}

/// Compile the device side of `tu` for one target.
pub fn compile_device(
    tu: &TranslationUnit,
    exports: &ExportList,
    options: &DeviceCompileOptions,
) -> Result<DeviceObject, CodegenError> {
    let target = &options.target;
    let family = target.family()?;

    let mut module = build_device_module(tu, target);
    mark_protected(&mut module, exports);

    let (module, pulled) = link::link_lazy(module, &options.runtime_libraries).map_err(|source| {
        CodegenError::RuntimeLink {
            target: target.clone(),
            source,
        }
    })?;
    if pulled > 0 {
        debug!(%target, pulled, "linked runtime-support modules");
    }

    let report = verify_module(&module);
    if !report.is_ok() {
        return Err(CodegenError::Verify {
            target: target.clone(),
            report,
        });
    }
    check_exports(&module, exports)?;

    let deferred = options.whole_program || !family.has_native_relocatable();
    let (kind, bytes) = if deferred {
        (DeviceObjectKind::PortableIr, module.to_bytes()?)
    } else {
        let elf = native_target(family).ok_or_else(|| CodegenError::NoNativeFormat(target.clone()))?;
        (DeviceObjectKind::Native, emit_object(elf, &lower_to_object(&module))?)
    };
    info!(%target, ?kind, size = bytes.len(), "compiled device object");

    Ok(DeviceObject {
        target: target.clone(),
        kind,
        bytes,
    })
}
