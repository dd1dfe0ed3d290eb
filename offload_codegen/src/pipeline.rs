//! Compile one translation unit into a fat host object.

use std::collections::BTreeMap;

use offload_ir::module::DeviceModule;
use offload_target::TargetId;
use offload_target::backend::HostBackend;
use offload_target::entry::OffloadEntry;
use offload_target::types::ObjectModule;
use rayon::prelude::*;
use tracing::info;

use crate::collect::{ExportList, TranslationUnit, collect_entries};
use crate::device::{DeviceCompileOptions, DeviceObject, compile_device};
use crate::embed::FatObjectEmbedder;
use crate::error::CodegenError;

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub targets: Vec<TargetId>,
    pub whole_program: bool,
    pub runtime_libraries: BTreeMap<TargetId, Vec<DeviceModule>>,
    /// Entries of a separately compiled host artifact. When set, device
    /// exports are checked against these rather than the unit's own.
    pub host_entries: Option<Vec<OffloadEntry>>,
}

/// Result of compiling one translation unit.
#[derive(Debug, Clone)]
pub struct FatObject {
    pub bytes: Vec<u8>,
    pub entries: Vec<OffloadEntry>,
    pub device_objects: Vec<DeviceObject>,
}

/// Collect entries, compile every target in parallel, then embed.
///
/// Device objects come back in the order of `options.targets`.
pub fn compile_fat_object(
    tu: &TranslationUnit,
    host: &ObjectModule,
    backend: &dyn HostBackend,
    options: &CompileOptions,
) -> Result<FatObject, CodegenError> {
    let collected = collect_entries(tu)?;
    let exports = ExportList::from_entries(
        options.host_entries.as_deref().unwrap_or(&collected.entries),
    );
    info!(
        source = %tu.source,
        entries = collected.entries.len(),
        targets = options.targets.len(),
        "compiling translation unit"
    );

    let device_objects = options
        .targets
        .par_iter()
        .map(|target| {
            let device_options = DeviceCompileOptions {
                target: target.clone(),
                whole_program: options.whole_program,
                runtime_libraries: options
                    .runtime_libraries
                    .get(target)
                    .cloned()
                    .unwrap_or_default(),
            };
            compile_device(tu, &exports, &device_options)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let bytes = FatObjectEmbedder::new(backend)
        .with_disambiguator(format!("{:x}", tu.file_id))
        .embed(host, &collected, &device_objects)?;

    Ok(FatObject {
        bytes,
        entries: collected.entries,
        device_objects,
    })
}
