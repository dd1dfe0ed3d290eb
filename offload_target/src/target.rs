//! Device target identification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Device families the pipeline knows how to route.
///
/// The family is derived from the first component of the target triple and
/// decides whether the device has a native relocatable object form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArchFamily {
    Nvptx64,
    Amdgcn,
    Spirv64,
    X86_64,
    Aarch64,
    Riscv64,
    PowerPc64Le,
}

impl ArchFamily {
    /// Classify a target triple by its architecture component.
    pub fn from_triple(triple: &str) -> Result<Self, TargetError> {
        let arch = triple.split('-').next().unwrap_or_default();
        match arch {
            "nvptx64" => Ok(ArchFamily::Nvptx64),
            "amdgcn" => Ok(ArchFamily::Amdgcn),
            "spirv64" => Ok(ArchFamily::Spirv64),
            "x86_64" => Ok(ArchFamily::X86_64),
            "aarch64" => Ok(ArchFamily::Aarch64),
            "riscv64" => Ok(ArchFamily::Riscv64),
            "powerpc64le" => Ok(ArchFamily::PowerPc64Le),
            _ => Err(TargetError::UnknownArch(triple.to_string())),
        }
    }

    /// Whether device code for this family can be emitted as a relocatable
    /// ELF object and linked by a native device linker.
    ///
    /// Families without one always go through the whole-program IR link.
    pub fn has_native_relocatable(self) -> bool {
        matches!(
            self,
            ArchFamily::X86_64 | ArchFamily::Aarch64 | ArchFamily::Riscv64 | ArchFamily::PowerPc64Le
        )
    }

    /// Default native device linker for families that have one.
    pub fn default_linker(self) -> Option<&'static str> {
        if self.has_native_relocatable() {
            Some("ld.lld")
        } else {
            None
        }
    }
}

/// A `(target platform, architecture)` pair.
///
/// The textual form is `triple[:arch]`. Architectures may contain colons
/// themselves (`gfx90a:xnack+`), so parsing splits at the first colon only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    pub triple: String,
    #[serde(default)]
    pub arch: String,
}

impl TargetId {
    pub fn new(triple: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            triple: triple.into(),
            arch: arch.into(),
        }
    }

    pub fn family(&self) -> Result<ArchFamily, TargetError> {
        ArchFamily::from_triple(&self.triple)
    }

    /// A file-name friendly rendering used for temporaries.
    pub fn file_stem(&self) -> String {
        let raw = if self.arch.is_empty() {
            self.triple.clone()
        } else {
            format!("{}-{}", self.triple, self.arch)
        };
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.arch.is_empty() {
            write!(f, "{}", self.triple)
        } else {
            write!(f, "{}:{}", self.triple, self.arch)
        }
    }
}

impl FromStr for TargetId {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (triple, arch) = match s.split_once(':') {
            Some((triple, arch)) => (triple, arch),
            None => (s, ""),
        };
        if triple.is_empty() {
            return Err(TargetError::Malformed(s.to_string()));
        }
        let id = TargetId::new(triple, arch);
        id.family()?;
        Ok(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("unknown device architecture in triple '{0}'")]
    UnknownArch(String),
    #[error("malformed target '{0}', expected triple[:arch]")]
    Malformed(String),
}
