//! Host backend trait for object emission and registration stubs.

use crate::types::{CompiledFunction, ObjectModule};

/// Error produced while writing an object file.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("unsupported host target '{0}'")]
    UnsupportedTarget(String),
    #[error("relocation against '{symbol}' in '{container}': {message}")]
    Relocation {
        container: String,
        symbol: String,
        message: String,
    },
    #[error("failed to write object: {0}")]
    Write(String),
}

/// Target-specific host code generation backend.
///
/// Implementations know the host's object format, relocation encodings and
/// enough machine code to forward a descriptor to the runtime.
pub trait HostBackend: Send + Sync {
    /// The host target triple this backend emits for.
    fn triple(&self) -> &str;

    /// Emit functions, static data and custom sections as one object file.
    fn emit_object(&self, module: &ObjectModule) -> Result<Vec<u8>, EmitError>;

    /// Generate a file-local function named `name` that passes the address of
    /// `descriptor` as the first argument to the runtime entry point `callee`.
    fn descriptor_stub(&self, name: &str, descriptor: &str, callee: &str) -> CompiledFunction;
}
