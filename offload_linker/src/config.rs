//! Wrapper configuration.
//!
//! Filled in by the command line front end; the library never reads argv
//! or the environment on its own.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;

use offload_target::TargetId;

pub const DEFAULT_HOST_LINKER: &str = "ld";
pub const DEFAULT_HOST_TRIPLE: &str = "x86_64-unknown-linux-gnu";
/// Arguments every native device link gets before the user's own.
pub const DEFAULT_DEVICE_LINK_ARGS: &[&str] = &["-shared"];

#[derive(Debug, Clone)]
pub struct WrapperConfig {
    /// Host linker and the arguments it is invoked with.
    pub linker_path: PathBuf,
    pub host_args: Vec<String>,
    pub host_triple: String,
    /// Targets that must produce an image even if no input mentions them.
    pub offload_targets: Vec<TargetId>,
    pub whole_program: bool,
    /// Device linker per triple; unset triples fall back to the family default.
    pub device_linkers: BTreeMap<String, PathBuf>,
    pub device_link_args: BTreeMap<String, Vec<String>>,
    /// Code generator for linked portable IR, per triple.
    pub device_codegen: BTreeMap<String, PathBuf>,
    /// Upper bound on concurrent device links; `None` picks one per CPU.
    pub jobs: Option<usize>,
    pub dry_run: bool,
    /// Parent of the per-invocation work directory; the system default
    /// when unset.
    pub temp_dir: Option<PathBuf>,
    pub save_temps: bool,
    pub print_entries: bool,
    /// `PATH`-style list used to locate bare tool names.
    pub search_path: Option<OsString>,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            linker_path: PathBuf::from(DEFAULT_HOST_LINKER),
            host_args: Vec::new(),
            host_triple: DEFAULT_HOST_TRIPLE.to_string(),
            offload_targets: Vec::new(),
            whole_program: false,
            device_linkers: BTreeMap::new(),
            device_link_args: BTreeMap::new(),
            device_codegen: BTreeMap::new(),
            jobs: None,
            dry_run: false,
            temp_dir: None,
            save_temps: false,
            print_entries: false,
            search_path: None,
        }
    }
}

impl WrapperConfig {
    /// Extra device-link arguments for `triple`, after the defaults.
    pub fn device_link_args_for(&self, triple: &str) -> Vec<String> {
        DEFAULT_DEVICE_LINK_ARGS
            .iter()
            .map(|s| s.to_string())
            .chain(self.device_link_args.get(triple).into_iter().flatten().cloned())
            .collect()
    }
}

/// Split a `triple=value` option argument.
pub fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((triple, value)) if !triple.is_empty() && !value.is_empty() => {
            Ok((triple.to_string(), value.to_string()))
        }
        _ => Err(format!("expected <triple>=<value>, got '{s}'")),
    }
}
