//! offload_ir: Portable device intermediate representation.
//!
//! Device code that cannot (or should not) be emitted as a native relocatable
//! object travels through the pipeline as a serialized [`module::DeviceModule`].
//! Code bodies are opaque bytes produced by an external code generator; this
//! crate only reasons about symbols, linkage and visibility.

pub mod link;
pub mod module;
pub mod verifier;

pub use module::{DeviceFunction, DeviceGlobal, DeviceModule, FunctionKind, Linkage, Visibility};

#[cfg(test)]
mod tests;
