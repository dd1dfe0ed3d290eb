use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use offload_linker::config::{DEFAULT_HOST_LINKER, DEFAULT_HOST_TRIPLE, parse_assignment};
use offload_linker::{LinkerWrapper, WrapperConfig};
use offload_target::TargetId;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "offload-linker-wrapper",
    version,
    about = "Link embedded device code and register it with the offloading runtime before the host link"
)]
struct Cli {
    /// Host linker to run once device images are wrapped
    #[arg(long, env = "OFFLOAD_HOST_LINKER", default_value = DEFAULT_HOST_LINKER)]
    linker_path: PathBuf,

    /// Triple of the host objects
    #[arg(long, default_value = DEFAULT_HOST_TRIPLE)]
    host_triple: String,

    /// Target that must get a device image (triple[:arch]); repeatable
    #[arg(long = "offload-target", value_name = "TARGET")]
    offload_targets: Vec<TargetId>,

    /// Link device code as portable IR for every target
    #[arg(long)]
    whole_program: bool,

    /// Device linker for a triple
    #[arg(long, value_name = "TRIPLE=PATH", value_parser = parse_assignment)]
    device_linker: Vec<(String, String)>,

    /// Extra device linker argument for a triple; repeatable
    #[arg(long, value_name = "TRIPLE=ARG", value_parser = parse_assignment, allow_hyphen_values = true)]
    device_link_arg: Vec<(String, String)>,

    /// Code generator turning linked portable IR into a device image
    #[arg(long, value_name = "TRIPLE=PATH", value_parser = parse_assignment)]
    device_codegen: Vec<(String, String)>,

    /// Maximum number of concurrent device links
    #[arg(long, env = "OFFLOAD_WRAPPER_JOBS")]
    wrapper_jobs: Option<usize>,

    /// Print the commands without running them
    #[arg(long)]
    dry_run: bool,

    /// Directory in which the work directory is created
    #[arg(long, value_name = "DIR")]
    temp_dir: Option<PathBuf>,

    /// Keep intermediate files, also when a link fails
    #[arg(long)]
    save_temps: bool,

    /// List the offload entries found in the inputs
    #[arg(long)]
    print_entries: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    /// Host linker arguments
    #[arg(last = true)]
    host_args: Vec<String>,
}

impl Cli {
    fn into_config(self) -> WrapperConfig {
        let mut device_link_args: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (triple, arg) in self.device_link_arg {
            device_link_args.entry(triple).or_default().push(arg);
        }
        WrapperConfig {
            linker_path: self.linker_path,
            host_args: self.host_args,
            host_triple: self.host_triple,
            offload_targets: self.offload_targets,
            whole_program: self.whole_program,
            device_linkers: self
                .device_linker
                .into_iter()
                .map(|(t, p)| (t, PathBuf::from(p)))
                .collect(),
            device_link_args,
            device_codegen: self
                .device_codegen
                .into_iter()
                .map(|(t, p)| (t, PathBuf::from(p)))
                .collect(),
            jobs: self.wrapper_jobs,
            dry_run: self.dry_run,
            temp_dir: self.temp_dir,
            save_temps: self.save_temps,
            print_entries: self.print_entries,
            search_path: std::env::var_os("PATH"),
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = LinkerWrapper::new(cli.into_config()).and_then(|wrapper| wrapper.run());
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("offload-linker-wrapper: error: {err}");
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
        }
    }
}
