//! offload_target: ABI shared by the host-compile and link-time halves of the
//! offloading pipeline.
//!
//! Everything that must agree bit-for-bit between the object files written
//! at compile time, the link-time scanner, the synthesized descriptor and the
//! runtime collaborator lives here.

pub mod backend;
pub mod entry;
pub mod layout;
pub mod reloc;
pub mod runtime;
pub mod section;
pub mod target;
pub mod types;

pub use entry::{EntryError, EntryFlags, OffloadEntry};
pub use target::{ArchFamily, TargetError, TargetId};
