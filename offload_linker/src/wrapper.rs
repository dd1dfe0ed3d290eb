//! The link-time pipeline: scan, plan, device-link, wrap, host-link.

use std::path::{Path, PathBuf};

use offload_codegen::x86::host_backend;
use offload_target::TargetId;
use offload_target::backend::HostBackend;
use offload_target::entry::OffloadEntry;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::WrapperConfig;
use crate::driver::{DeviceLinker, LinkJob, classify, resolve_linker};
use crate::error::WrapperError;
use crate::input::host_inputs;
use crate::scan::{ScanResult, scan_inputs};
use crate::toolchain::ToolCommand;
use crate::wrap::{BinaryWrapper, LinkedImage};

pub const WRAPPER_OBJECT: &str = "offload-wrapper.o";

/// A target group paired with the linker that will handle it.
pub struct PlannedLink {
    pub job: LinkJob,
    pub linker: Box<dyn DeviceLinker>,
}

/// What one invocation did.
#[derive(Debug, Default)]
pub struct WrapperOutcome {
    pub entries: Vec<OffloadEntry>,
    pub images: Vec<LinkedImage>,
    /// Every command that ran, or would have run under `--dry-run`.
    pub commands: Vec<ToolCommand>,
    /// The work directory, when it was kept.
    pub temps: Option<PathBuf>,
}

pub struct LinkerWrapper {
    config: WrapperConfig,
    backend: Box<dyn HostBackend>,
}

impl LinkerWrapper {
    pub fn new(config: WrapperConfig) -> Result<Self, WrapperError> {
        let backend = host_backend(&config.host_triple)?;
        Ok(Self { config, backend })
    }

    /// Requested targets first, then any other target found in the inputs.
    pub fn planned_targets(&self, scan: &ScanResult) -> Vec<TargetId> {
        let mut targets = Vec::new();
        for target in self.config.offload_targets.iter().cloned().chain(scan.targets()) {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }

    /// Classify every planned target and resolve its tools. Nothing runs
    /// until every target has a toolchain; groups without blobs are dropped
    /// afterwards.
    pub fn plan(&self, scan: &ScanResult) -> Result<Vec<PlannedLink>, WrapperError> {
        let mut planned = Vec::new();
        for target in self.planned_targets(scan) {
            let blobs = scan.blobs_for(&target);
            let kind = classify(&target, &blobs, self.config.whole_program)?;
            let linker = resolve_linker(&self.config, &target, kind)?;
            planned.push(PlannedLink {
                job: LinkJob::new(target, kind, blobs, &scan.entries),
                linker,
            });
        }
        planned.retain(|p| {
            let keep = !p.job.blobs.is_empty();
            if !keep {
                info!(target = %p.job.target, "no device code for target, skipping");
            }
            keep
        });
        Ok(planned)
    }

    /// Link every group on a bounded pool. Results are inspected in plan
    /// order, so the first failure reported is the first target's.
    fn link_all(&self, planned: &[PlannedLink], work: &Path) -> Result<Vec<LinkedImage>, WrapperError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.jobs.unwrap_or(0))
            .thread_name(|i| format!("offload-link-{i}"))
            .build()?;
        let results: Vec<Result<Vec<u8>, WrapperError>> = pool.install(|| {
            planned
                .par_iter()
                .map(|p| p.linker.link(&p.job, work))
                .collect()
        });

        planned
            .iter()
            .zip(results)
            .map(|(p, result)| {
                let bytes = result?;
                info!(target = %p.job.target, size = bytes.len(), "linked device image");
                Ok(LinkedImage {
                    target: p.job.target.clone(),
                    bytes,
                })
            })
            .collect()
    }

    fn host_command(&self, wrapper: Option<&Path>) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.config.linker_path);
        cmd.args(&self.config.host_args);
        if let Some(wrapper) = wrapper {
            cmd.arg(wrapper);
        }
        cmd
    }

    pub fn run(&self) -> Result<WrapperOutcome, WrapperError> {
        let inputs = host_inputs(&self.config.host_args)?;
        let scan = scan_inputs(&inputs)?;
        info!(
            loaded = scan.loaded.len(),
            entries = scan.entries.len(),
            blobs = scan.blobs.len(),
            "scanned link inputs"
        );
        let planned = self.plan(&scan)?;

        if self.config.print_entries {
            for entry in &scan.entries {
                println!("{entry}");
            }
        }

        let parent = self.config.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
        let tmp = tempfile::Builder::new()
            .prefix("offload-link-")
            .tempdir_in(&parent)
            .map_err(|e| WrapperError::io(&parent, e))?;
        // Kept before anything can fail, so a failed link leaves its inputs.
        let (work, _cleanup) = if self.config.save_temps {
            let kept = tmp.keep();
            info!(path = %kept.display(), "keeping temporary files");
            (kept, None)
        } else {
            (tmp.path().to_path_buf(), Some(tmp))
        };
        let wrapper_path = work.join(WRAPPER_OBJECT);
        let mut outcome = WrapperOutcome {
            entries: scan.entries.clone(),
            temps: self.config.save_temps.then(|| work.clone()),
            ..WrapperOutcome::default()
        };

        if self.config.dry_run {
            for p in &planned {
                outcome.commands.extend(p.linker.plan(&p.job, &work));
            }
            let wrapper = (!planned.is_empty()).then_some(wrapper_path.as_path());
            outcome.commands.push(self.host_command(wrapper));
            for cmd in &outcome.commands {
                println!("{cmd}");
            }
            return Ok(outcome);
        }

        for p in &planned {
            outcome.commands.extend(p.linker.plan(&p.job, &work));
        }
        outcome.images = self.link_all(&planned, &work)?;

        let wrapper = match BinaryWrapper::new(self.backend.as_ref()).wrap(&outcome.images)? {
            Some(bytes) => {
                std::fs::write(&wrapper_path, bytes)
                    .map_err(|e| WrapperError::io(&wrapper_path, e))?;
                debug!(path = %wrapper_path.display(), images = outcome.images.len(), "wrote wrapper object");
                Some(wrapper_path.as_path())
            }
            None => None,
        };

        let host = self.host_command(wrapper);
        host.run().map_err(WrapperError::HostLinkFailed)?;
        outcome.commands.push(host);
        Ok(outcome)
    }
}
