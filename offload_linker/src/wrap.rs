//! Descriptor synthesis.
//!
//! The wrapper object holds, for N linked images:
//! - N read-only image buffers;
//! - an array of N device-image records, each pointing at its own buffer
//!   and at the shared entry-table bounds;
//! - the binary descriptor;
//! - an empty contribution to the entries section carrying a zero-sized
//!   sentinel, so the bounds exist even when no input had entries;
//! - registration and unregistration stubs run from `.init_array` and
//!   `.fini_array`.

use offload_target::TargetId;
use offload_target::backend::{EmitError, HostBackend};
use offload_target::layout::{
    self, DESCRIPTOR_ENTRIES_BEGIN, DESCRIPTOR_ENTRIES_END, DESCRIPTOR_IMAGES, IMAGE_END,
    IMAGE_ENTRIES_BEGIN, IMAGE_ENTRIES_END, IMAGE_SIZE, IMAGE_START, POINTER_SIZE, RECORD_ALIGN,
};
use offload_target::reloc::Relocation;
use offload_target::runtime::{REGISTER_LIB, UNREGISTER_LIB};
use offload_target::section::{ENTRIES_SECTION, ENTRIES_SENTINEL, ENTRIES_START, ENTRIES_STOP};
use offload_target::types::{
    Binding, CustomSection, ObjectModule, SectionFlavor, SectionSymbol, StaticData,
};
use tracing::debug;

pub const DEVICE_IMAGES: &str = ".omp_offloading.device_images";
pub const DESCRIPTOR: &str = ".omp_offloading.descriptor";
pub const REGISTER_STUB: &str = ".omp_offloading.descriptor_reg";
pub const UNREGISTER_STUB: &str = ".omp_offloading.descriptor_unreg";
/// Priority-suffixed so registration runs ahead of ordinary constructors.
pub const INIT_ARRAY_SECTION: &str = ".init_array.00001";
pub const FINI_ARRAY_SECTION: &str = ".fini_array.00001";

/// One fully linked device image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedImage {
    pub target: TargetId,
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum WrapError {
    #[error("linked image for '{0}' is empty")]
    EmptyImage(TargetId),
    #[error("{0} device images do not fit in the descriptor")]
    TooManyImages(usize),
    #[error(transparent)]
    Emit(#[from] EmitError),
}

fn image_symbol(index: usize) -> String {
    format!(".omp_offloading.device_image.{index}")
}

/// Builds the registration object for a host backend.
pub struct BinaryWrapper<'b> {
    backend: &'b dyn HostBackend,
}

impl<'b> BinaryWrapper<'b> {
    pub fn new(backend: &'b dyn HostBackend) -> Self {
        Self { backend }
    }

    /// Lay out the wrapper contents.
    pub fn module(&self, images: &[LinkedImage]) -> Result<ObjectModule, WrapError> {
        let count =
            i32::try_from(images.len()).map_err(|_| WrapError::TooManyImages(images.len()))?;
        let mut module = ObjectModule::default();

        let records = vec![0u8; images.len() * IMAGE_SIZE];
        let mut record_relocs = Vec::with_capacity(images.len() * 4);
        for (i, image) in images.iter().enumerate() {
            if image.bytes.is_empty() {
                return Err(WrapError::EmptyImage(image.target.clone()));
            }
            let name = image_symbol(i);
            let base = i * IMAGE_SIZE;
            record_relocs.push(Relocation::abs64(base + IMAGE_START, &name, 0));
            record_relocs.push(Relocation::abs64(
                base + IMAGE_END,
                &name,
                image.bytes.len() as i64,
            ));
            record_relocs.push(Relocation::abs64(base + IMAGE_ENTRIES_BEGIN, ENTRIES_START, 0));
            record_relocs.push(Relocation::abs64(base + IMAGE_ENTRIES_END, ENTRIES_STOP, 0));
            debug!(target = %image.target, size = image.bytes.len(), "wrapping device image");
            module.statics.push(StaticData {
                align: RECORD_ALIGN,
                ..StaticData::local(name, image.bytes.clone(), Vec::new())
            });
        }
        module
            .statics
            .push(StaticData::local(DEVICE_IMAGES, records, record_relocs));

        module.statics.push(StaticData::local(
            DESCRIPTOR,
            layout::encode_descriptor(count).to_vec(),
            vec![
                Relocation::abs64(DESCRIPTOR_IMAGES, DEVICE_IMAGES, 0),
                Relocation::abs64(DESCRIPTOR_ENTRIES_BEGIN, ENTRIES_START, 0),
                Relocation::abs64(DESCRIPTOR_ENTRIES_END, ENTRIES_STOP, 0),
            ],
        ));

        let mut sentinel = CustomSection::new(ENTRIES_SECTION, SectionFlavor::Writable, RECORD_ALIGN);
        sentinel.symbols.push(SectionSymbol {
            name: ENTRIES_SENTINEL.to_string(),
            offset: 0,
            size: 0,
            binding: Binding::Local,
        });
        module.sections.push(sentinel);

        module
            .functions
            .push(self.backend.descriptor_stub(REGISTER_STUB, DESCRIPTOR, REGISTER_LIB));
        module
            .functions
            .push(self.backend.descriptor_stub(UNREGISTER_STUB, DESCRIPTOR, UNREGISTER_LIB));
        for (section, flavor, stub) in [
            (INIT_ARRAY_SECTION, SectionFlavor::InitArray, REGISTER_STUB),
            (FINI_ARRAY_SECTION, SectionFlavor::FiniArray, UNREGISTER_STUB),
        ] {
            let mut array = CustomSection::new(section, flavor, POINTER_SIZE as u64);
            array.data = vec![0; POINTER_SIZE];
            array.relocations.push(Relocation::abs64(0, stub, 0));
            module.sections.push(array);
        }
        Ok(module)
    }

    /// Emit the wrapper object. `None` when there is nothing to register.
    pub fn wrap(&self, images: &[LinkedImage]) -> Result<Option<Vec<u8>>, WrapError> {
        if images.is_empty() {
            return Ok(None);
        }
        let module = self.module(images)?;
        Ok(Some(self.backend.emit_object(&module)?))
    }
}
