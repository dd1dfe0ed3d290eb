//! offload_linker: the link-time half of the offloading pipeline.
//!
//! [`scan`] reads fat objects and archives, [`driver`] links each target's
//! device blobs into one image, [`wrap`] synthesizes the registration
//! object, and [`wrapper`] runs the whole sequence ahead of the host link.

pub mod config;
pub mod driver;
pub mod error;
pub mod input;
pub mod scan;
pub mod toolchain;
pub mod wrap;
pub mod wrapper;

pub use config::WrapperConfig;
pub use error::WrapperError;
pub use wrapper::{LinkerWrapper, WrapperOutcome};
