//! Bit-exact record layouts for 64-bit little-endian hosts.
//!
//! ```text
//! OffloadEntry     { address: ptr; name: ptr<cstring>; size: size_t; flags: i32; reserved: i32 }
//! DeviceImage      { start: ptr; end: ptr; entries_begin: ptr; entries_end: ptr }
//! BinaryDescriptor { image_count: i32; images: ptr; entries_begin: ptr; entries_end: ptr }
//! ```
//!
//! Pointer fields are written as zero and carried by absolute relocations.

use std::ffi::{c_char, c_void};

pub const POINTER_SIZE: usize = 8;
pub const RECORD_ALIGN: u64 = 8;

pub const ENTRY_SIZE: usize = 32;
pub const ENTRY_ADDRESS: usize = 0;
pub const ENTRY_NAME: usize = 8;
pub const ENTRY_SIZE_FIELD: usize = 16;
pub const ENTRY_FLAGS: usize = 24;
pub const ENTRY_RESERVED: usize = 28;

pub const IMAGE_SIZE: usize = 32;
pub const IMAGE_START: usize = 0;
pub const IMAGE_END: usize = 8;
pub const IMAGE_ENTRIES_BEGIN: usize = 16;
pub const IMAGE_ENTRIES_END: usize = 24;

pub const DESCRIPTOR_SIZE: usize = 32;
pub const DESCRIPTOR_IMAGE_COUNT: usize = 0;
pub const DESCRIPTOR_IMAGES: usize = 8;
pub const DESCRIPTOR_ENTRIES_BEGIN: usize = 16;
pub const DESCRIPTOR_ENTRIES_END: usize = 24;

/// Encode an entry record with zeroed pointer slots.
pub fn encode_entry(size: u64, flags: i32, reserved: i32) -> [u8; ENTRY_SIZE] {
    let mut buf = [0u8; ENTRY_SIZE];
    buf[ENTRY_SIZE_FIELD..ENTRY_FLAGS].copy_from_slice(&size.to_le_bytes());
    buf[ENTRY_FLAGS..ENTRY_RESERVED].copy_from_slice(&flags.to_le_bytes());
    buf[ENTRY_RESERVED..ENTRY_SIZE].copy_from_slice(&reserved.to_le_bytes());
    buf
}

/// Decode `(size, flags, reserved)` from one entry record.
///
/// Returns `None` if `record` is shorter than [`ENTRY_SIZE`].
pub fn decode_entry(record: &[u8]) -> Option<(u64, i32, i32)> {
    if record.len() < ENTRY_SIZE {
        return None;
    }
    let size = u64::from_le_bytes(record[ENTRY_SIZE_FIELD..ENTRY_FLAGS].try_into().ok()?);
    let flags = i32::from_le_bytes(record[ENTRY_FLAGS..ENTRY_RESERVED].try_into().ok()?);
    let reserved = i32::from_le_bytes(record[ENTRY_RESERVED..ENTRY_SIZE].try_into().ok()?);
    Some((size, flags, reserved))
}

/// Encode a descriptor with zeroed pointer slots.
pub fn encode_descriptor(image_count: i32) -> [u8; DESCRIPTOR_SIZE] {
    let mut buf = [0u8; DESCRIPTOR_SIZE];
    buf[DESCRIPTOR_IMAGE_COUNT..DESCRIPTOR_IMAGE_COUNT + 4]
        .copy_from_slice(&image_count.to_le_bytes());
    buf
}

/// In-memory entry as the runtime sees it.
#[repr(C)]
#[derive(Debug)]
pub struct RawOffloadEntry {
    pub address: *mut c_void,
    pub name: *const c_char,
    pub size: usize,
    pub flags: i32,
    pub reserved: i32,
}

/// In-memory device image as the runtime sees it.
#[repr(C)]
#[derive(Debug)]
pub struct RawDeviceImage {
    pub start: *const u8,
    pub end: *const u8,
    pub entries_begin: *const RawOffloadEntry,
    pub entries_end: *const RawOffloadEntry,
}

/// In-memory binary descriptor as the runtime sees it.
#[repr(C)]
#[derive(Debug)]
pub struct RawBinaryDescriptor {
    pub image_count: i32,
    pub images: *const RawDeviceImage,
    pub entries_begin: *const RawOffloadEntry,
    pub entries_end: *const RawOffloadEntry,
}

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(std::mem::size_of::<RawOffloadEntry>() == ENTRY_SIZE);
    assert!(std::mem::size_of::<RawDeviceImage>() == IMAGE_SIZE);
    assert!(std::mem::size_of::<RawBinaryDescriptor>() == DESCRIPTOR_SIZE);
    assert!(std::mem::offset_of!(RawOffloadEntry, flags) == ENTRY_FLAGS);
    assert!(std::mem::offset_of!(RawBinaryDescriptor, images) == DESCRIPTOR_IMAGES);
};
