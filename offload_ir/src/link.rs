//! Whole-program device IR linking.
//!
//! Symbol resolution follows the usual ELF rules: definitions replace
//! declarations, weak definitions yield to strong ones, two strong
//! definitions conflict, and internal symbols never resolve anything outside
//! their own module (they are renamed when their name is taken).

use std::collections::{BTreeSet, HashMap};

use offload_target::TargetId;
use tracing::debug;

use crate::module::{DeviceFunction, DeviceGlobal, DeviceModule, FunctionKind, IrFormatError, Linkage};
use crate::verifier::{VerifyResult, verify_module};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("module for '{found}' cannot be linked into '{expected}'")]
    TargetMismatch { expected: TargetId, found: TargetId },
    #[error("duplicate definition of @{0}")]
    DuplicateSymbol(String),
    #[error("@{0} is defined both as a function and as a global")]
    KindMismatch(String),
    #[error("global @{name} has conflicting sizes {first} and {second}")]
    SizeMismatch { name: String, first: u64, second: u64 },
    #[error("unresolved symbols: {}", .0.join(", "))]
    Unresolved(Vec<String>),
    #[error("{0}")]
    Verify(VerifyResult),
    #[error(transparent)]
    Format(#[from] IrFormatError),
}

/// Incremental linker for one target.
struct Linker {
    output: DeviceModule,
    /// Non-internal names across every input that may still be merged.
    reserved: BTreeSet<String>,
}

impl Linker {
    fn new(target: TargetId, reserved: BTreeSet<String>) -> Self {
        Self {
            output: DeviceModule::new(target),
            reserved,
        }
    }

    fn taken(&self, name: &str) -> bool {
        self.reserved.contains(name) || self.output.symbol(name).is_some()
    }

    fn add(&mut self, mut module: DeviceModule) -> Result<(), LinkError> {
        if module.target != self.output.target {
            return Err(LinkError::TargetMismatch {
                expected: self.output.target.clone(),
                found: module.target,
            });
        }

        // Give clashing internal symbols fresh names before merging.
        let internals: Vec<String> = module
            .functions
            .iter()
            .filter(|f| f.linkage == Linkage::Internal)
            .map(|f| f.name.clone())
            .chain(
                module
                    .globals
                    .iter()
                    .filter(|g| g.linkage == Linkage::Internal)
                    .map(|g| g.name.clone()),
            )
            .collect();
        for name in internals {
            if self.taken(&name) {
                let fresh = (1..)
                    .map(|k| format!("{name}.{k}"))
                    .find(|n| !self.taken(n) && module.symbol(n).is_none())
                    .unwrap_or_default();
                debug!(from = %name, to = %fresh, "renaming internal device symbol");
                module.rename_symbol(&name, &fresh);
            }
        }

        for func in module.functions {
            self.merge_function(func)?;
        }
        for global in module.globals {
            self.merge_global(global)?;
        }
        Ok(())
    }

    fn merge_function(&mut self, func: DeviceFunction) -> Result<(), LinkError> {
        if self.output.global(&func.name).is_some() {
            return Err(LinkError::KindMismatch(func.name));
        }
        let Some(idx) = self.output.functions.iter().position(|f| f.name == func.name) else {
            self.output.add_function(func);
            return Ok(());
        };
        let existing = &mut self.output.functions[idx];
        let visibility = existing.visibility.merge(func.visibility);
        let replace = match (existing.is_declaration(), func.is_declaration()) {
            (true, false) => true,
            (_, true) => false,
            (false, false) => match (existing.linkage, func.linkage) {
                (Linkage::Weak, Linkage::External) => true,
                (_, Linkage::Weak) | (Linkage::Weak, _) => false,
                _ => return Err(LinkError::DuplicateSymbol(func.name)),
            },
        };
        if replace {
            *existing = func;
        }
        existing.visibility = visibility;
        Ok(())
    }

    fn merge_global(&mut self, global: DeviceGlobal) -> Result<(), LinkError> {
        if self.output.function(&global.name).is_some() {
            return Err(LinkError::KindMismatch(global.name));
        }
        let Some(idx) = self.output.globals.iter().position(|g| g.name == global.name) else {
            self.output.add_global(global);
            return Ok(());
        };
        let existing = &mut self.output.globals[idx];
        if existing.size != global.size {
            return Err(LinkError::SizeMismatch {
                name: global.name,
                first: existing.size,
                second: global.size,
            });
        }
        let visibility = existing.visibility.merge(global.visibility);
        let replace = match (existing.declaration, global.declaration) {
            (true, false) => true,
            (_, true) => false,
            (false, false) => match (existing.linkage, global.linkage) {
                (Linkage::Weak, Linkage::External) => true,
                (_, Linkage::Weak) | (Linkage::Weak, _) => false,
                _ => return Err(LinkError::DuplicateSymbol(global.name)),
            },
        };
        if replace {
            *existing = global;
        }
        existing.visibility = visibility;
        Ok(())
    }
}

fn non_internal_names(module: &DeviceModule) -> impl Iterator<Item = String> + '_ {
    module
        .functions
        .iter()
        .filter(|f| f.linkage != Linkage::Internal)
        .map(|f| f.name.clone())
        .chain(
            module
                .globals
                .iter()
                .filter(|g| g.linkage != Linkage::Internal)
                .map(|g| g.name.clone()),
        )
}

/// Merge every module into one module for `target`.
pub fn link_modules(
    target: &TargetId,
    modules: Vec<DeviceModule>,
) -> Result<DeviceModule, LinkError> {
    let reserved = modules.iter().flat_map(non_internal_names).collect();
    let mut linker = Linker::new(target.clone(), reserved);
    for module in modules {
        linker.add(module)?;
    }
    let verify = verify_module(&linker.output);
    if !verify.is_ok() {
        return Err(LinkError::Verify(verify));
    }
    Ok(linker.output)
}

/// Pull in library modules that define a symbol `module` still needs,
/// repeating until nothing changes. Returns how many libraries were linked.
pub fn link_lazy(
    module: DeviceModule,
    libraries: &[DeviceModule],
) -> Result<(DeviceModule, usize), LinkError> {
    let reserved = std::iter::once(&module)
        .chain(libraries)
        .flat_map(non_internal_names)
        .collect();
    let mut linker = Linker::new(module.target.clone(), reserved);
    linker.add(module)?;

    let mut pulled = vec![false; libraries.len()];
    loop {
        let undefined = linker.output.undefined_symbols();
        let next = libraries.iter().enumerate().find(|(i, lib)| {
            !pulled[*i]
                && lib
                    .exported_definitions()
                    .iter()
                    .any(|name| undefined.contains(name))
        });
        let Some((i, lib)) = next else {
            break;
        };
        debug!(library = i, "linking runtime-support module");
        pulled[i] = true;
        linker.add(lib.clone())?;
    }
    let count = pulled.iter().filter(|p| **p).count();
    Ok((linker.output, count))
}

/// Symbols still undefined after linking.
pub fn unresolved(module: &DeviceModule) -> Vec<String> {
    module.undefined_symbols().into_iter().collect()
}

/// Give every definition outside `roots` internal linkage. Kernels stay
/// external since the host can launch them.
pub fn internalize(module: &mut DeviceModule, roots: &BTreeSet<String>) {
    for f in &mut module.functions {
        if !f.is_declaration() && f.kind != FunctionKind::Kernel && !roots.contains(&f.name) {
            f.linkage = Linkage::Internal;
        }
    }
    for g in &mut module.globals {
        if !g.declaration && !roots.contains(&g.name) {
            g.linkage = Linkage::Internal;
        }
    }
}

/// Remove internal definitions and declarations unreachable from `roots`
/// and the kernels. Returns the number of removed symbols.
pub fn strip_dead(module: &mut DeviceModule, roots: &BTreeSet<String>) -> usize {
    let refs: HashMap<&str, &[String]> = module
        .functions
        .iter()
        .map(|f| (f.name.as_str(), f.references.as_slice()))
        .collect();

    let mut live: BTreeSet<String> = roots.clone();
    live.extend(
        module
            .functions
            .iter()
            .filter(|f| f.kind == FunctionKind::Kernel || f.linkage != Linkage::Internal)
            .filter(|f| !f.is_declaration())
            .map(|f| f.name.clone()),
    );
    live.extend(
        module
            .globals
            .iter()
            .filter(|g| !g.declaration && g.linkage != Linkage::Internal)
            .map(|g| g.name.clone()),
    );
    let mut work: Vec<String> = live.iter().cloned().collect();
    while let Some(name) = work.pop() {
        if let Some(targets) = refs.get(name.as_str()) {
            for t in targets.iter() {
                if live.insert(t.clone()) {
                    work.push(t.clone());
                }
            }
        }
    }

    let before = module.functions.len() + module.globals.len();
    module.functions.retain(|f| live.contains(&f.name));
    module.globals.retain(|g| live.contains(&g.name));
    before - module.functions.len() - module.globals.len()
}
