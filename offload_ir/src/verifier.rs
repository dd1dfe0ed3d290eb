//! Device module verifier: symbol-level structural checks.
//!
//! Collects all errors rather than stopping at the first one.
//! Entry point: [`verify_module`].

use std::collections::HashSet;
use std::fmt;

use crate::module::{DeviceModule, FunctionKind, Linkage};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Location context for a verification error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Module,
    Function(String),
    Global(String),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Module => write!(f, "module"),
            Location::Function(name) => write!(f, "func @{name}"),
            Location::Global(name) => write!(f, "global @{name}"),
        }
    }
}

/// A single verification error.
#[derive(Debug, Clone)]
pub struct VerifyError {
    pub location: Location,
    pub message: String,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.location, self.message)
    }
}

/// Collected verification results.
#[derive(Debug, Default)]
pub struct VerifyResult {
    pub errors: Vec<VerifyError>,
}

impl VerifyResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, location: Location, message: impl Into<String>) {
        self.errors.push(VerifyError {
            location,
            message: message.into(),
        });
    }
}

impl fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "verification passed");
        }
        writeln!(
            f,
            "verification failed with {} error(s):",
            self.errors.len()
        )?;
        for e in &self.errors {
            writeln!(f, "  {e}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Verify an entire module.
pub fn verify_module(module: &DeviceModule) -> VerifyResult {
    let mut result = VerifyResult::default();

    let mut seen = HashSet::new();
    let names = module
        .functions
        .iter()
        .map(|f| &f.name)
        .chain(module.globals.iter().map(|g| &g.name));
    for name in names {
        if !seen.insert(name.as_str()) {
            result.error(Location::Module, format!("duplicate symbol @{name}"));
        }
    }

    for func in &module.functions {
        let loc = || Location::Function(func.name.clone());
        if func.is_declaration() {
            if func.linkage == Linkage::Internal {
                result.error(loc(), "declaration with internal linkage");
            }
            if !func.references.is_empty() {
                result.error(loc(), "declaration carries references");
            }
        }
        if func.kind == FunctionKind::Kernel {
            if func.is_declaration() {
                result.error(loc(), "kernel has no body");
            }
            if func.linkage != Linkage::External {
                result.error(loc(), "kernel must have external linkage");
            }
        }
        for r in &func.references {
            if !seen.contains(r.as_str()) {
                result.error(loc(), format!("reference to unknown symbol @{r}"));
            }
        }
    }

    for global in &module.globals {
        let loc = || Location::Global(global.name.clone());
        if global.size == 0 {
            result.error(loc(), "zero-sized global");
        }
        if global.declaration {
            if global.init.is_some() {
                result.error(loc(), "declaration carries an initializer");
            }
            if global.linkage == Linkage::Internal {
                result.error(loc(), "declaration with internal linkage");
            }
        } else if let Some(init) = &global.init
            && init.len() as u64 != global.size
        {
            result.error(
                loc(),
                format!(
                    "initializer is {} bytes, global is {} bytes",
                    init.len(),
                    global.size
                ),
            );
        }
    }

    result
}
