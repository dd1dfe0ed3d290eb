//! Translation units and offload entry collection.
//!
//! The front end hands over one [`TranslationUnit`] per source file: the
//! marked target regions and declare-target variables it found, with device
//! code already generated as opaque bytes.

use std::collections::{BTreeMap, HashSet};

use offload_target::entry::{EntryFlags, OffloadEntry};
use offload_target::layout::POINTER_SIZE;
use serde::{Deserialize, Serialize};

use crate::error::CodegenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    #[default]
    Ordinary,
    GlobalCtor,
    GlobalDtor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapKind {
    To,
    Link,
}

/// A marked kernel region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRegion {
    /// Enclosing host function (or variable, for ctor/dtor regions).
    pub parent: String,
    pub line: u32,
    #[serde(default)]
    pub kind: RegionKind,
    #[serde(default)]
    pub device_code: Vec<u8>,
    #[serde(default)]
    pub references: Vec<String>,
}

/// A global marked for the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclareTargetVariable {
    pub name: String,
    pub size: u64,
    pub map: MapKind,
    #[serde(default)]
    pub init: Option<Vec<u8>>,
}

/// A function compiled for the device but not launchable from the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOnlyFunction {
    pub name: String,
    #[serde(default)]
    pub device_code: Vec<u8>,
    #[serde(default)]
    pub references: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationUnit {
    pub source: String,
    /// Unique per source file; feeds region names and section disambiguators.
    pub file_id: u64,
    #[serde(default)]
    pub regions: Vec<TargetRegion>,
    #[serde(default)]
    pub variables: Vec<DeclareTargetVariable>,
    #[serde(default)]
    pub functions: Vec<DeviceOnlyFunction>,
}

impl TranslationUnit {
    pub fn new(source: impl Into<String>, file_id: u64) -> Self {
        Self {
            source: source.into(),
            file_id,
            regions: Vec::new(),
            variables: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Entry name of a region: `__omp_offloading_<fileid>_<parent>_l<line>`.
pub fn region_entry_name(file_id: u64, region: &TargetRegion) -> String {
    let suffix = match region.kind {
        RegionKind::Ordinary => "",
        RegionKind::GlobalCtor => "_ctor",
        RegionKind::GlobalDtor => "_dtor",
    };
    format!(
        "__omp_offloading_{file_id:x}_{}_l{}{suffix}",
        region.parent, region.line
    )
}

/// Host symbol standing in for a region's address.
pub fn region_id_symbol(entry_name: &str) -> String {
    format!(".{entry_name}.region_id")
}

/// Entries of one translation unit, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct CollectedEntries {
    pub entries: Vec<OffloadEntry>,
    /// Region-id symbols the host object has to define.
    pub region_ids: Vec<String>,
}

/// Collect entries for every region, then every variable.
pub fn collect_entries(tu: &TranslationUnit) -> Result<CollectedEntries, CodegenError> {
    let mut out = CollectedEntries::default();
    let mut seen = HashSet::new();

    for region in &tu.regions {
        let name = region_entry_name(tu.file_id, region);
        if !seen.insert(name.clone()) {
            return Err(CodegenError::DuplicateEntry(name));
        }
        let flags = match region.kind {
            RegionKind::Ordinary => EntryFlags::Region,
            RegionKind::GlobalCtor => EntryFlags::GlobalCtor,
            RegionKind::GlobalDtor => EntryFlags::GlobalDtor,
        };
        let id = region_id_symbol(&name);
        out.entries.push(OffloadEntry::function(id.clone(), name, flags)?);
        out.region_ids.push(id);
    }

    for var in &tu.variables {
        if !seen.insert(var.name.clone()) {
            return Err(CodegenError::DuplicateEntry(var.name.clone()));
        }
        let flags = match var.map {
            MapKind::To => EntryFlags::To,
            MapKind::Link => EntryFlags::Link,
        };
        out.entries.push(OffloadEntry::variable(
            var.name.clone(),
            var.name.clone(),
            var.size,
            flags,
        )?);
    }

    Ok(out)
}

/// What the device module must provide for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Kernel,
    Variable { size: u64 },
}

/// Device symbols the host metadata depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportList {
    symbols: BTreeMap<String, ExportKind>,
}

impl ExportList {
    pub fn from_entries(entries: &[OffloadEntry]) -> Self {
        let symbols = entries
            .iter()
            .map(|e| {
                let kind = match e.flags {
                    EntryFlags::Link => ExportKind::Variable {
                        size: POINTER_SIZE as u64,
                    },
                    f if f.is_function() => ExportKind::Kernel,
                    _ => ExportKind::Variable { size: e.size },
                };
                (e.device_symbol(), kind)
            })
            .collect();
        Self { symbols }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ExportKind)> {
        self.symbols.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
