//! Fat object embedding.
//!
//! Adds to the host object:
//! - one weak byte per region, whose address identifies the region;
//! - the entry records in `omp_offloading_entries`, address and name slots
//!   relocated against the host symbol and the entry's name string;
//! - one excluded section per device object, named after its target.

use std::collections::BTreeSet;

use offload_target::backend::HostBackend;
use offload_target::layout::{ENTRY_ADDRESS, ENTRY_NAME, ENTRY_SIZE, RECORD_ALIGN};
use offload_target::reloc::Relocation;
use offload_target::section::{
    DeviceSectionKey, ENTRIES_SECTION, ENTRY_NAMES_SECTION,
};
use offload_target::types::{
    Binding, CustomSection, ObjectModule, SectionFlavor, SectionSymbol, StaticData,
};
use tracing::debug;

use crate::collect::CollectedEntries;
use crate::device::DeviceObject;
use crate::error::CodegenError;

fn name_symbol(index: usize) -> String {
    format!("{ENTRY_NAMES_SECTION}.{index}")
}

/// Builds fat host objects for one backend.
pub struct FatObjectEmbedder<'b> {
    backend: &'b dyn HostBackend,
    disambiguator: Option<String>,
}

impl<'b> FatObjectEmbedder<'b> {
    pub fn new(backend: &'b dyn HostBackend) -> Self {
        Self {
            backend,
            disambiguator: None,
        }
    }

    /// Suffix for device section names, so that several fat objects for the
    /// same target can be told apart after a relocatable link.
    pub fn with_disambiguator(mut self, disambiguator: impl Into<String>) -> Self {
        self.disambiguator = Some(disambiguator.into());
        self
    }

    /// Add region ids, entry records and names to `module`.
    pub fn add_entries(&self, module: &mut ObjectModule, collected: &CollectedEntries) {
        for id in &collected.region_ids {
            module.statics.push(StaticData {
                binding: Binding::Weak,
                align: 1,
                ..StaticData::local(id, vec![0], Vec::new())
            });
        }
        if collected.entries.is_empty() {
            return;
        }

        let mut names = CustomSection::new(ENTRY_NAMES_SECTION, SectionFlavor::ReadOnly, 1);
        let mut records = CustomSection::new(ENTRIES_SECTION, SectionFlavor::Writable, RECORD_ALIGN);
        for (i, entry) in collected.entries.iter().enumerate() {
            let name_offset = names.data.len() as u64;
            names.data.extend_from_slice(entry.name.as_bytes());
            names.data.push(0);
            names.symbols.push(SectionSymbol {
                name: name_symbol(i),
                offset: name_offset,
                size: entry.name.len() as u64 + 1,
                binding: Binding::Local,
            });

            let base = i * ENTRY_SIZE;
            records.data.extend_from_slice(&entry.encode());
            records
                .relocations
                .push(Relocation::abs64(base + ENTRY_ADDRESS, &entry.address, 0));
            records
                .relocations
                .push(Relocation::abs64(base + ENTRY_NAME, name_symbol(i), 0));
        }
        module.sections.push(names);
        module.sections.push(records);
    }

    /// Add one excluded section per device object.
    pub fn add_device_objects(
        &self,
        module: &mut ObjectModule,
        devices: &[DeviceObject],
    ) -> Result<(), CodegenError> {
        let mut seen = BTreeSet::new();
        for device in devices {
            if !seen.insert(&device.target) {
                return Err(CodegenError::DuplicateTarget(device.target.clone()));
            }
            let key = DeviceSectionKey::new(device.target.clone(), self.disambiguator.clone());
            let mut section = CustomSection::new(key.section_name(), SectionFlavor::Excluded, 1);
            section.data = device.bytes.clone();
            debug!(section = %section.name, size = section.data.len(), "embedding device object");
            module.sections.push(section);
        }
        Ok(())
    }

    /// Emit the host object with entries and device objects embedded.
    pub fn embed(
        &self,
        host: &ObjectModule,
        collected: &CollectedEntries,
        devices: &[DeviceObject],
    ) -> Result<Vec<u8>, CodegenError> {
        let mut module = host.clone();
        self.add_entries(&mut module, collected);
        self.add_device_objects(&mut module, devices)?;
        Ok(self.backend.emit_object(&module)?)
    }
}
