//! Errors raised while compiling a translation unit.

use offload_ir::link::LinkError;
use offload_ir::module::IrFormatError;
use offload_ir::verifier::VerifyResult;
use offload_target::backend::EmitError;
use offload_target::{EntryError, TargetError, TargetId};

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("duplicate offload entry '{0}'")]
    DuplicateEntry(String),
    #[error(transparent)]
    Entry(#[from] EntryError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("device module for '{target}' does not define required symbol '{symbol}'")]
    MissingExport { target: TargetId, symbol: String },
    #[error("device symbol '{symbol}' for '{target}' does not match host metadata: {reason}")]
    ExportMismatch {
        target: TargetId,
        symbol: String,
        reason: String,
    },
    #[error("device module for '{target}' failed verification: {report}")]
    Verify { target: TargetId, report: VerifyResult },
    #[error("linking runtime support for '{target}' failed: {source}")]
    RuntimeLink {
        target: TargetId,
        #[source]
        source: LinkError,
    },
    #[error("no native object format for '{0}'")]
    NoNativeFormat(TargetId),
    #[error("more than one device object for '{0}'")]
    DuplicateTarget(TargetId),
    #[error(transparent)]
    Format(#[from] IrFormatError),
    #[error(transparent)]
    Emit(#[from] EmitError),
}
