//! Per-target device link drivers.
//!
//! Every target group is classified as native or portable IR, paired with a
//! [`DeviceLinker`] before anything runs, and then linked into exactly one
//! image.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use offload_ir::link::{self, LinkError};
use offload_ir::module::DeviceModule;
use offload_target::TargetId;
use offload_target::entry::OffloadEntry;
use tracing::{debug, info};

use crate::config::WrapperConfig;
use crate::error::WrapperError;
use crate::scan::DeviceBlob;
use crate::toolchain::{ToolCommand, find_program};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Native,
    PortableIr,
}

/// Decide how a target group is linked.
///
/// Portable IR whenever the family has no native relocatable form, whole
/// program mode is on, or a blob already is IR. Native blobs cannot join an
/// IR link.
pub fn classify(
    target: &TargetId,
    blobs: &[DeviceBlob],
    whole_program: bool,
) -> Result<ArtifactKind, WrapperError> {
    let family = target.family()?;
    let any_ir = blobs.iter().any(DeviceBlob::is_portable_ir);
    let ir = !family.has_native_relocatable() || whole_program || any_ir;
    if !ir {
        return Ok(ArtifactKind::Native);
    }
    if blobs.iter().any(|b| !b.is_portable_ir()) {
        return Err(WrapperError::MixedArtifacts {
            target: target.clone(),
        });
    }
    Ok(ArtifactKind::PortableIr)
}

/// Work for one target group.
#[derive(Debug, Clone)]
pub struct LinkJob {
    pub target: TargetId,
    pub kind: ArtifactKind,
    pub blobs: Vec<DeviceBlob>,
    /// Device symbols the host entries refer to; whole-program roots.
    pub roots: BTreeSet<String>,
}

impl LinkJob {
    pub fn new(
        target: TargetId,
        kind: ArtifactKind,
        blobs: Vec<DeviceBlob>,
        entries: &[OffloadEntry],
    ) -> Self {
        Self {
            target,
            kind,
            blobs,
            roots: entries.iter().map(OffloadEntry::device_symbol).collect(),
        }
    }

    fn input_path(&self, work: &Path, index: usize, ext: &str) -> PathBuf {
        work.join(format!("{}.{index}.{ext}", self.target.file_stem()))
    }

    fn output_path(&self, work: &Path) -> PathBuf {
        work.join(format!("{}.img", self.target.file_stem()))
    }

    fn write_inputs(&self, work: &Path, ext: &str) -> Result<Vec<PathBuf>, WrapperError> {
        self.blobs
            .iter()
            .enumerate()
            .map(|(i, blob)| {
                let path = self.input_path(work, i, ext);
                std::fs::write(&path, &blob.bytes).map_err(|e| WrapperError::io(&path, e))?;
                Ok(path)
            })
            .collect()
    }
}

fn read_image(target: &TargetId, path: &Path) -> Result<Vec<u8>, WrapperError> {
    let bytes = std::fs::read(path).map_err(|e| WrapperError::io(path, e))?;
    if bytes.is_empty() {
        return Err(WrapperError::EmptyImage {
            target: target.clone(),
        });
    }
    Ok(bytes)
}

/// Links one target group into an image.
pub trait DeviceLinker: Send + Sync {
    /// Commands `link` would run, for `--dry-run`.
    fn plan(&self, job: &LinkJob, work: &Path) -> Vec<ToolCommand>;

    fn link(&self, job: &LinkJob, work: &Path) -> Result<Vec<u8>, WrapperError>;
}

/// Runs the target's native linker over the relocatable device objects.
#[derive(Debug, Clone)]
pub struct NativeLinker {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl NativeLinker {
    fn command(&self, job: &LinkJob, work: &Path) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.program);
        cmd.args(&self.args).arg("-o").arg(job.output_path(work));
        for i in 0..job.blobs.len() {
            cmd.arg(job.input_path(work, i, "o"));
        }
        cmd
    }
}

impl DeviceLinker for NativeLinker {
    fn plan(&self, job: &LinkJob, work: &Path) -> Vec<ToolCommand> {
        vec![self.command(job, work)]
    }

    fn link(&self, job: &LinkJob, work: &Path) -> Result<Vec<u8>, WrapperError> {
        job.write_inputs(work, "o")?;
        self.command(job, work)
            .run()
            .map_err(|source| WrapperError::DeviceLinkFailed {
                target: job.target.clone(),
                source,
            })?;
        read_image(&job.target, &job.output_path(work))
    }
}

/// Merges portable IR into one module, internalizes everything the host
/// cannot see and drops what becomes dead. With a code generator the
/// result is lowered to a native image; without one the IR is the image.
#[derive(Debug, Clone, Default)]
pub struct WholeProgramLinker {
    pub codegen: Option<PathBuf>,
}

impl WholeProgramLinker {
    fn linked_path(job: &LinkJob, work: &Path) -> PathBuf {
        work.join(format!("{}.linked.oir", job.target.file_stem()))
    }

    fn codegen_command(&self, codegen: &Path, job: &LinkJob, work: &Path) -> ToolCommand {
        let mut cmd = ToolCommand::new(codegen);
        cmd.arg(format!("--target={}", job.target))
            .arg(Self::linked_path(job, work))
            .arg("-o")
            .arg(job.output_path(work));
        cmd
    }

    /// Link the group's modules in memory. Every reference left after
    /// dead-symbol removal must be defined by some module of the group.
    pub fn link_ir(&self, job: &LinkJob) -> Result<DeviceModule, WrapperError> {
        let modules = job
            .blobs
            .iter()
            .map(|blob| {
                DeviceModule::from_bytes(&blob.bytes).map_err(|source| WrapperError::IrFormat {
                    target: job.target.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let ir_link = |source: LinkError| WrapperError::IrLink {
            target: job.target.clone(),
            source,
        };
        let mut module = link::link_modules(&job.target, modules).map_err(ir_link)?;
        link::internalize(&mut module, &job.roots);
        let removed = link::strip_dead(&mut module, &job.roots);
        debug!(target = %job.target, removed, "whole-program dead symbol removal");
        let missing = link::unresolved(&module);
        if !missing.is_empty() {
            return Err(ir_link(LinkError::Unresolved(missing)));
        }
        Ok(module)
    }
}

impl DeviceLinker for WholeProgramLinker {
    fn plan(&self, job: &LinkJob, work: &Path) -> Vec<ToolCommand> {
        self.codegen
            .iter()
            .map(|codegen| self.codegen_command(codegen, job, work))
            .collect()
    }

    fn link(&self, job: &LinkJob, work: &Path) -> Result<Vec<u8>, WrapperError> {
        let module = self.link_ir(job)?;
        let bytes = module.to_bytes().map_err(|source| WrapperError::IrFormat {
            target: job.target.clone(),
            source,
        })?;
        let Some(codegen) = &self.codegen else {
            return Ok(bytes);
        };
        let linked = Self::linked_path(job, work);
        std::fs::write(&linked, &bytes).map_err(|e| WrapperError::io(&linked, e))?;
        self.codegen_command(codegen, job, work)
            .run()
            .map_err(|source| WrapperError::DeviceLinkFailed {
                target: job.target.clone(),
                source,
            })?;
        read_image(&job.target, &job.output_path(work))
    }
}

fn locate(
    config: &WrapperConfig,
    target: &TargetId,
    tool: &str,
    program: &Path,
) -> Result<PathBuf, WrapperError> {
    find_program(program, config.search_path.as_deref()).ok_or_else(|| {
        WrapperError::MissingToolchain {
            target: target.clone(),
            tool: format!("{tool} '{}'", program.display()),
        }
    })
}

/// Pick and locate the tools for one target.
pub fn resolve_linker(
    config: &WrapperConfig,
    target: &TargetId,
    kind: ArtifactKind,
) -> Result<Box<dyn DeviceLinker>, WrapperError> {
    let family = target.family()?;
    let triple = target.triple.as_str();
    let linker: Box<dyn DeviceLinker> = match kind {
        ArtifactKind::Native => {
            let configured = config.device_linkers.get(triple).cloned();
            let Some(program) = configured.or_else(|| family.default_linker().map(PathBuf::from))
            else {
                return Err(WrapperError::MissingToolchain {
                    target: target.clone(),
                    tool: "device linker".into(),
                });
            };
            let program = locate(config, target, "device linker", &program)?;
            Box::new(NativeLinker {
                program,
                args: config.device_link_args_for(triple),
            })
        }
        ArtifactKind::PortableIr => {
            let codegen = match config.device_codegen.get(triple) {
                Some(program) => Some(locate(config, target, "device code generator", program)?),
                None if family.has_native_relocatable() => {
                    return Err(WrapperError::MissingToolchain {
                        target: target.clone(),
                        tool: "device code generator".into(),
                    });
                }
                None => None,
            };
            Box::new(WholeProgramLinker { codegen })
        }
    };
    info!(%target, ?kind, "resolved device toolchain");
    Ok(linker)
}
