//! Device module container and its on-disk form.
//!
//! The serialized form is the 4-byte magic `\x7fOIR`, a little-endian format
//! version, and the JSON body. Anything else is treated as a native object
//! by the link-time scanner.

use std::collections::BTreeSet;
use std::fmt;

use offload_target::TargetId;
use serde::{Deserialize, Serialize};

pub const MAGIC: [u8; 4] = *b"\x7fOIR";
pub const FORMAT_VERSION: u32 = 1;

/// Whether `bytes` start with the portable IR magic.
pub fn is_portable_ir(bytes: &[u8]) -> bool {
    bytes.starts_with(&MAGIC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    #[default]
    External,
    Weak,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Default,
    Protected,
    Hidden,
}

impl Visibility {
    /// Combine two visibilities for the same symbol; the most constraining
    /// one wins.
    pub fn merge(self, other: Visibility) -> Visibility {
        self.max(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    /// Launchable from the host.
    Kernel,
    #[default]
    Device,
}

/// A device function. `body == None` marks a declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFunction {
    pub name: String,
    #[serde(default)]
    pub kind: FunctionKind,
    #[serde(default)]
    pub linkage: Linkage,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    /// Symbols referenced from the body.
    #[serde(default)]
    pub references: Vec<String>,
}

impl DeviceFunction {
    pub fn definition(name: impl Into<String>, kind: FunctionKind, body: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind,
            linkage: Linkage::External,
            visibility: Visibility::Default,
            body: Some(body),
            references: Vec::new(),
        }
    }

    pub fn declaration(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FunctionKind::Device,
            linkage: Linkage::External,
            visibility: Visibility::Default,
            body: None,
            references: Vec::new(),
        }
    }

    pub fn with_references<I, S>(mut self, refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.references.extend(refs.into_iter().map(Into::into));
        self
    }

    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }
}

/// A device global variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGlobal {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub init: Option<Vec<u8>>,
    #[serde(default)]
    pub linkage: Linkage,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub declaration: bool,
}

impl DeviceGlobal {
    pub fn definition(name: impl Into<String>, size: u64, init: Option<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            size,
            init,
            linkage: Linkage::External,
            visibility: Visibility::Default,
            declaration: false,
        }
    }

    pub fn declaration(name: impl Into<String>, size: u64) -> Self {
        Self {
            declaration: true,
            ..Self::definition(name, size, None)
        }
    }
}

/// A symbol looked up by name.
#[derive(Debug, Clone, Copy)]
pub enum Symbol<'a> {
    Function(&'a DeviceFunction),
    Global(&'a DeviceGlobal),
}

impl Symbol<'_> {
    pub fn is_definition(&self) -> bool {
        match self {
            Symbol::Function(f) => !f.is_declaration(),
            Symbol::Global(g) => !g.declaration,
        }
    }

    pub fn linkage(&self) -> Linkage {
        match self {
            Symbol::Function(f) => f.linkage,
            Symbol::Global(g) => g.linkage,
        }
    }

    pub fn visibility(&self) -> Visibility {
        match self {
            Symbol::Function(f) => f.visibility,
            Symbol::Global(g) => g.visibility,
        }
    }
}

/// Device code for one target.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModule {
    pub target: TargetId,
    #[serde(default)]
    pub functions: Vec<DeviceFunction>,
    #[serde(default)]
    pub globals: Vec<DeviceGlobal>,
}

impl DeviceModule {
    pub fn new(target: TargetId) -> Self {
        Self {
            target,
            functions: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn add_function(&mut self, func: DeviceFunction) {
        self.functions.push(func);
    }

    pub fn add_global(&mut self, global: DeviceGlobal) {
        self.globals.push(global);
    }

    pub fn function(&self, name: &str) -> Option<&DeviceFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&DeviceGlobal> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn symbol(&self, name: &str) -> Option<Symbol<'_>> {
        self.function(name)
            .map(Symbol::Function)
            .or_else(|| self.global(name).map(Symbol::Global))
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.symbol(name).is_some_and(|s| s.is_definition())
    }

    /// Names of all defined, non-internal symbols.
    pub fn exported_definitions(&self) -> BTreeSet<String> {
        let funcs = self
            .functions
            .iter()
            .filter(|f| !f.is_declaration() && f.linkage != Linkage::Internal)
            .map(|f| f.name.clone());
        let globals = self
            .globals
            .iter()
            .filter(|g| !g.declaration && g.linkage != Linkage::Internal)
            .map(|g| g.name.clone());
        funcs.chain(globals).collect()
    }

    /// Names referenced by some function or declared without a definition.
    pub fn undefined_symbols(&self) -> BTreeSet<String> {
        let mut undefined = BTreeSet::new();
        for f in &self.functions {
            if f.is_declaration() {
                undefined.insert(f.name.clone());
            }
            for r in &f.references {
                if !self.is_defined(r) {
                    undefined.insert(r.clone());
                }
            }
        }
        for g in self.globals.iter().filter(|g| g.declaration) {
            undefined.insert(g.name.clone());
        }
        undefined
    }

    /// Rename a symbol and every reference to it.
    pub fn rename_symbol(&mut self, from: &str, to: &str) {
        for f in &mut self.functions {
            if f.name == from {
                f.name = to.to_string();
            }
            for r in &mut f.references {
                if r == from {
                    *r = to.to_string();
                }
            }
        }
        for g in &mut self.globals {
            if g.name == from {
                g.name = to.to_string();
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IrFormatError> {
        let mut buf = Vec::from(MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        serde_json::to_writer(&mut buf, self)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IrFormatError> {
        if !is_portable_ir(bytes) {
            return Err(IrFormatError::BadMagic);
        }
        let version = bytes
            .get(4..8)
            .and_then(|v| v.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or(IrFormatError::Truncated)?;
        if version != FORMAT_VERSION {
            return Err(IrFormatError::UnsupportedVersion(version));
        }
        Ok(serde_json::from_slice(&bytes[8..])?)
    }
}

impl fmt::Debug for DeviceModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceModule")
            .field("target", &self.target)
            .field(
                "functions",
                &format!("[{} functions]", self.functions.len()),
            )
            .field("globals", &format!("[{} globals]", self.globals.len()))
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IrFormatError {
    #[error("not a portable device IR module")]
    BadMagic,
    #[error("truncated portable device IR header")]
    Truncated,
    #[error("unsupported portable device IR version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid portable device IR body: {0}")]
    Json(#[from] serde_json::Error),
}
