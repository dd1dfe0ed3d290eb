//! Errors of the link-time pipeline.

use std::path::PathBuf;

use offload_ir::link::LinkError;
use offload_ir::module::IrFormatError;
use offload_target::backend::EmitError;
use offload_target::{TargetError, TargetId};

use crate::scan::ScanError;
use crate::toolchain::CommandError;
use crate::wrap::WrapError;

#[derive(Debug, thiserror::Error)]
pub enum WrapperError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("no {tool} available for target '{target}'")]
    MissingToolchain { target: TargetId, tool: String },
    #[error("target '{target}' mixes native objects with portable IR")]
    MixedArtifacts { target: TargetId },
    #[error("device link for '{target}' failed: {source}")]
    DeviceLinkFailed {
        target: TargetId,
        #[source]
        source: CommandError,
    },
    #[error("device IR for '{target}' is unusable: {source}")]
    IrFormat {
        target: TargetId,
        #[source]
        source: IrFormatError,
    },
    #[error("whole-program link for '{target}' failed: {source}")]
    IrLink {
        target: TargetId,
        #[source]
        source: LinkError,
    },
    #[error("device link for '{target}' produced an empty image")]
    EmptyImage { target: TargetId },
    #[error(transparent)]
    Wrap(#[from] WrapError),
    #[error(transparent)]
    Emit(#[from] EmitError),
    #[error("host link failed: {0}")]
    HostLinkFailed(#[source] CommandError),
    #[error("cannot start device link workers: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl WrapperError {
    /// Process exit status for this error: the failing sub-process's own
    /// status when there is one, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        let status = match self {
            WrapperError::DeviceLinkFailed { source, .. } | WrapperError::HostLinkFailed(source) => {
                source.status()
            }
            _ => None,
        };
        match status {
            Some(code) if code != 0 => code,
            _ => 1,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WrapperError::Io {
            path: path.into(),
            source,
        }
    }
}
