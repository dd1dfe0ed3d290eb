//! offload_codegen: host-compile side of the offloading pipeline.
//!
//! A translation unit flows through [`collect`] (offload entries for the
//! host), [`device`] (one device object per target) and [`embed`] (the fat
//! host object). [`pipeline`] strings the three together.

pub mod collect;
pub mod device;
pub mod embed;
pub mod emit;
pub mod error;
pub mod pipeline;
pub mod x86;

pub use error::CodegenError;

#[cfg(test)]
mod tests;
