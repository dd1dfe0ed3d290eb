//! Runtime collaborator contract.
//!
//! The synthesized registration stub calls [`REGISTER_LIB`] once at process
//! start and [`UNREGISTER_LIB`] once at exit, each with the address of the
//! binary descriptor. This module describes what the collaborator receives
//! and provides a reference host-to-device pointer table with the
//! exactly-once lifecycle the stubs guarantee.

use std::collections::BTreeMap;
use std::ffi::CStr;

use crate::entry::{EntryError, EntryFlags};
use crate::layout::{RawBinaryDescriptor, RawOffloadEntry};

pub const REGISTER_LIB: &str = "__tgt_register_lib";
pub const UNREGISTER_LIB: &str = "__tgt_unregister_lib";

/// One entry as read from the descriptor's entry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryView {
    pub host_address: usize,
    pub name: String,
    pub size: u64,
    pub flags: EntryFlags,
}

/// Safe copy of a registered descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorView {
    /// Device image bytes, one per target, in descriptor order.
    pub images: Vec<Vec<u8>>,
    pub entries: Vec<EntryView>,
}

impl DescriptorView {
    /// Read a descriptor laid out as in [`crate::layout`].
    ///
    /// # Safety
    ///
    /// `desc` must point to a live descriptor whose image and entry ranges
    /// are valid for reads and whose entry names are NUL-terminated.
    pub unsafe fn from_raw(desc: *const RawBinaryDescriptor) -> Result<Self, RuntimeError> {
        if desc.is_null() {
            return Err(RuntimeError::NullDescriptor);
        }
        // SAFETY: caller guarantees `desc` is valid.
        let desc = unsafe { &*desc };
        if desc.entries_begin.is_null() || desc.entries_end.is_null() {
            return Err(RuntimeError::NullEntryRange);
        }
        let count = usize::try_from(desc.image_count).map_err(|_| RuntimeError::BadImageCount)?;

        let mut images = Vec::with_capacity(count);
        for i in 0..count {
            // SAFETY: `images` holds `image_count` records.
            let image = unsafe { &*desc.images.add(i) };
            if image.entries_begin != desc.entries_begin || image.entries_end != desc.entries_end {
                return Err(RuntimeError::SplitEntryRange(i));
            }
            // SAFETY: `start..end` is one contiguous buffer.
            let len = unsafe { image.end.offset_from(image.start) };
            let len = usize::try_from(len).map_err(|_| RuntimeError::InvertedImage(i))?;
            // SAFETY: as above.
            let bytes = unsafe { std::slice::from_raw_parts(image.start, len) };
            images.push(bytes.to_vec());
        }

        // SAFETY: both bounds come from the same entries table.
        let n = unsafe { desc.entries_end.offset_from(desc.entries_begin) };
        let n = usize::try_from(n).map_err(|_| RuntimeError::InvertedEntryRange)?;
        let mut entries = Vec::with_capacity(n);
        for i in 0..n {
            // SAFETY: `i` is inside the entries range.
            let raw: &RawOffloadEntry = unsafe { &*desc.entries_begin.add(i) };
            // SAFETY: entry names are NUL-terminated per the contract.
            let name = unsafe { CStr::from_ptr(raw.name) }
                .to_string_lossy()
                .into_owned();
            let size = raw.size as u64;
            entries.push(EntryView {
                host_address: raw.address as usize,
                name,
                size,
                flags: EntryFlags::from_bits(raw.flags, size)?,
            });
        }
        Ok(Self { images, entries })
    }
}

/// Process-wide offloading runtime.
pub trait OffloadRuntime {
    fn register(&mut self, descriptor: &DescriptorView) -> Result<(), RuntimeError>;
    fn unregister(&mut self) -> Result<(), RuntimeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Fresh,
    Registered,
    Released,
}

#[derive(Debug, Clone)]
struct TableSlot {
    name: String,
    size: u64,
    device: Option<usize>,
}

/// Reference registration state: a host-pointer to device-pointer table for
/// variable entries plus the set of known kernels.
#[derive(Debug)]
pub struct Registration {
    state: Lifecycle,
    image_count: usize,
    variables: BTreeMap<usize, TableSlot>,
    kernels: BTreeMap<String, Option<usize>>,
}

impl Default for Registration {
    fn default() -> Self {
        Self::new()
    }
}

impl Registration {
    pub fn new() -> Self {
        Self {
            state: Lifecycle::Fresh,
            image_count: 0,
            variables: BTreeMap::new(),
            kernels: BTreeMap::new(),
        }
    }

    pub fn image_count(&self) -> usize {
        self.image_count
    }

    pub fn is_registered(&self) -> bool {
        self.state == Lifecycle::Registered
    }

    /// Record where an entry landed once its image is loaded.
    pub fn bind(&mut self, name: &str, device_address: usize) -> Result<(), RuntimeError> {
        if self.state != Lifecycle::Registered {
            return Err(RuntimeError::NotRegistered);
        }
        if let Some(slot) = self.kernels.get_mut(name) {
            *slot = Some(device_address);
            return Ok(());
        }
        let slot = self
            .variables
            .values_mut()
            .find(|slot| slot.name == name)
            .ok_or_else(|| RuntimeError::UnknownEntry(name.to_string()))?;
        slot.device = Some(device_address);
        Ok(())
    }

    /// Translate a host variable address into its device counterpart.
    pub fn device_pointer(&self, host_address: usize) -> Option<usize> {
        self.variables.get(&host_address).and_then(|slot| slot.device)
    }

    /// Device address of a kernel, once bound.
    pub fn kernel_address(&self, name: &str) -> Option<usize> {
        self.kernels.get(name).copied().flatten()
    }

    /// Size recorded for a host variable.
    pub fn variable_size(&self, host_address: usize) -> Option<u64> {
        self.variables.get(&host_address).map(|slot| slot.size)
    }
}

impl OffloadRuntime for Registration {
    fn register(&mut self, descriptor: &DescriptorView) -> Result<(), RuntimeError> {
        match self.state {
            Lifecycle::Fresh => {}
            Lifecycle::Registered => return Err(RuntimeError::AlreadyRegistered),
            Lifecycle::Released => return Err(RuntimeError::AlreadyReleased),
        }
        for entry in &descriptor.entries {
            if entry.flags.is_function() {
                self.kernels.insert(entry.name.clone(), None);
            } else {
                self.variables.insert(
                    entry.host_address,
                    TableSlot {
                        name: entry.name.clone(),
                        size: entry.size,
                        device: None,
                    },
                );
            }
        }
        self.image_count = descriptor.images.len();
        self.state = Lifecycle::Registered;
        Ok(())
    }

    fn unregister(&mut self) -> Result<(), RuntimeError> {
        match self.state {
            Lifecycle::Registered => {}
            Lifecycle::Fresh => return Err(RuntimeError::NotRegistered),
            Lifecycle::Released => return Err(RuntimeError::AlreadyReleased),
        }
        self.variables.clear();
        self.kernels.clear();
        self.state = Lifecycle::Released;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("null binary descriptor")]
    NullDescriptor,
    #[error("descriptor has a null entry range")]
    NullEntryRange,
    #[error("descriptor has a negative image count")]
    BadImageCount,
    #[error("descriptor entry range is inverted")]
    InvertedEntryRange,
    #[error("device image {0} has end before start")]
    InvertedImage(usize),
    #[error("device image {0} does not share the descriptor's entry range")]
    SplitEntryRange(usize),
    #[error("descriptor already registered")]
    AlreadyRegistered,
    #[error("descriptor not registered")]
    NotRegistered,
    #[error("descriptor already unregistered")]
    AlreadyReleased,
    #[error("no entry named '{0}'")]
    UnknownEntry(String),
    #[error(transparent)]
    Entry(#[from] EntryError),
}
