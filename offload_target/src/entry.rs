//! Offload entries: the host-visible metadata for one device kernel or
//! variable.

use std::fmt;

use crate::layout;

/// Suffix of the device-side reference pointer that stands in for a
/// link-attributed variable.
pub const LINK_REF_SUFFIX: &str = "_decl_tgt_ref_ptr";

/// Entry flags.
///
/// Function entries (`size == 0`) use `Region`, `GlobalCtor` or `GlobalDtor`;
/// variable entries (`size > 0`) use `To` or `Link`. The raw encodings of the
/// two groups overlap, so decoding needs the entry size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryFlags {
    /// Ordinary target region.
    Region,
    /// Device-side global constructor.
    GlobalCtor,
    /// Device-side global destructor.
    GlobalDtor,
    /// Variable copied to the device.
    To,
    /// Variable accessed through a device-side reference pointer.
    Link,
}

impl EntryFlags {
    pub fn bits(self) -> i32 {
        match self {
            EntryFlags::Region => 0x0,
            EntryFlags::GlobalCtor => 0x2,
            EntryFlags::GlobalDtor => 0x4,
            EntryFlags::To => 0x0,
            EntryFlags::Link => 0x1,
        }
    }

    pub fn is_function(self) -> bool {
        matches!(
            self,
            EntryFlags::Region | EntryFlags::GlobalCtor | EntryFlags::GlobalDtor
        )
    }

    /// Decode raw flags for an entry of the given size.
    pub fn from_bits(bits: i32, size: u64) -> Result<Self, EntryError> {
        let flags = if size == 0 {
            match bits {
                0x0 => EntryFlags::Region,
                0x2 => EntryFlags::GlobalCtor,
                0x4 => EntryFlags::GlobalDtor,
                _ => return Err(EntryError::UnknownFlags { bits, size }),
            }
        } else {
            match bits {
                0x0 => EntryFlags::To,
                0x1 => EntryFlags::Link,
                _ => return Err(EntryError::UnknownFlags { bits, size }),
            }
        };
        Ok(flags)
    }
}

impl fmt::Display for EntryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryFlags::Region => "region",
            EntryFlags::GlobalCtor => "ctor",
            EntryFlags::GlobalDtor => "dtor",
            EntryFlags::To => "to",
            EntryFlags::Link => "link",
        };
        f.write_str(s)
    }
}

/// One offload entry record.
///
/// `address` names the host symbol the record's address field is relocated
/// against. The runtime overwrites the field once the owning image is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadEntry {
    pub address: String,
    pub name: String,
    pub size: u64,
    pub flags: EntryFlags,
    pub reserved: i32,
}

impl OffloadEntry {
    /// A kernel entry. `flags` must be one of the function flags.
    pub fn function(
        address: impl Into<String>,
        name: impl Into<String>,
        flags: EntryFlags,
    ) -> Result<Self, EntryError> {
        let entry = Self {
            address: address.into(),
            name: name.into(),
            size: 0,
            flags,
            reserved: 0,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// A variable entry of `size` bytes. `flags` must be `To` or `Link`.
    pub fn variable(
        address: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        flags: EntryFlags,
    ) -> Result<Self, EntryError> {
        let entry = Self {
            address: address.into(),
            name: name.into(),
            size,
            flags,
            reserved: 0,
        };
        entry.validate()?;
        Ok(entry)
    }

    pub fn is_function(&self) -> bool {
        self.size == 0
    }

    /// Check `size == 0` if and only if the flags describe a function.
    pub fn validate(&self) -> Result<(), EntryError> {
        if self.name.is_empty() {
            return Err(EntryError::EmptyName);
        }
        if (self.size == 0) != self.flags.is_function() {
            return Err(EntryError::SizeFlagsMismatch {
                name: self.name.clone(),
                size: self.size,
                flags: self.flags,
            });
        }
        Ok(())
    }

    /// The symbol the device image has to export for this entry.
    pub fn device_symbol(&self) -> String {
        match self.flags {
            EntryFlags::Link => format!("{}{LINK_REF_SUFFIX}", self.name),
            _ => self.name.clone(),
        }
    }

    /// Encode the non-relocated fields. The address and name slots stay zero
    /// and are filled by relocations.
    pub fn encode(&self) -> [u8; layout::ENTRY_SIZE] {
        layout::encode_entry(self.size, self.flags.bits(), self.reserved)
    }
}

impl fmt::Display for OffloadEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} size={} flags={} addr=@{}",
            self.name, self.size, self.flags, self.address
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("offload entry has an empty name")]
    EmptyName,
    #[error("offload entry '{name}' has size {size} but {flags} flags")]
    SizeFlagsMismatch {
        name: String,
        size: u64,
        flags: EntryFlags,
    },
    #[error("unknown offload entry flags {bits:#x} for size {size}")]
    UnknownFlags { bits: i32, size: u64 },
}
