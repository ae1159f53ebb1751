use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use crate::app::adb::channel::AdbChannel;
use crate::app::analysis::{run_analysis, select_modules, AnalysisKind, AnalysisSummary};
use crate::app::config::{load_config, validate_for_device_manager, FleetConfig};
use crate::app::error::AppError;
use crate::app::registry::{start_monitoring, DeviceRegistry, OperatingMode};

#[derive(Debug, Parser)]
#[command(
    name = "trace-fleet",
    version,
    about = "Stop, collect and restart Perfetto sessions on every connected Android device"
)]
pub struct Cli {
    /// Debug-level logging (RUST_LOG still wins).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Settings file. Defaults to $TRACE_FLEET_CONFIG_PATH or ~/.trace_fleet_config.json.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Watch for devices and apply the operation once per connection.
    DeviceManager(DeviceManagerArgs),
    /// Write an inventory report next to every collected trace.
    TraceAnalysis(TraceAnalysisArgs),
}

#[derive(Debug, Args)]
pub struct DeviceManagerArgs {
    /// Perfetto TraceConfig (text proto) streamed to the device on start.
    #[arg(short = 'c', long = "perfetto-config", value_name = "FILE")]
    pub perfetto_config: PathBuf,

    #[arg(long, value_enum)]
    pub operation: OperatingMode,

    #[arg(long, value_name = "DIR")]
    pub traces_directory: PathBuf,

    /// Leave traces on the device after they are pulled.
    #[arg(long)]
    pub keep_remote: bool,
}

#[derive(Debug, Args)]
pub struct TraceAnalysisArgs {
    #[arg(long, value_name = "DIR")]
    pub traces_directory: PathBuf,

    /// Restrict the scan to these serials.
    #[arg(short = 's', long = "serial", value_name = "SERIAL")]
    pub serials: Vec<String>,

    /// Analysis modules to run; defaults to all of them.
    #[arg(long = "module", value_enum, num_args = 1..)]
    pub modules: Vec<AnalysisKind>,
}

pub fn execute(cli: Cli) -> Result<(), AppError> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::DeviceManager(args) => device_manager(config, args),
        Command::TraceAnalysis(args) => trace_analysis(config, args),
    }
}

fn device_manager_config(
    mut config: FleetConfig,
    args: &DeviceManagerArgs,
) -> Result<FleetConfig, AppError> {
    if !args.perfetto_config.is_file() {
        return Err(AppError::config(
            format!(
                "Perfetto config not found: {}",
                args.perfetto_config.display()
            ),
            "",
        ));
    }
    config.trace_config_path = args.perfetto_config.to_string_lossy().to_string();
    config.output_dir = args.traces_directory.to_string_lossy().to_string();
    if args.keep_remote {
        config.collect.delete_after_transfer = false;
    }
    validate_for_device_manager(&config)?;
    Ok(config)
}

fn device_manager(config: FleetConfig, args: DeviceManagerArgs) -> Result<(), AppError> {
    let config = device_manager_config(config, &args)?;
    std::fs::create_dir_all(config.output_dir()).map_err(|err| {
        AppError::filesystem(
            format!("Failed to create {}: {err}", config.output_dir().display()),
            "",
        )
    })?;

    let stop_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop_flag);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|err| AppError::system(format!("Failed to install SIGINT handler: {err}"), ""))?;

    let channel = AdbChannel::new(&config.adb);
    info!(
        adb = %channel.program(),
        operation = %args.operation,
        traces_directory = %config.output_dir().display(),
        perfetto_config = %config.trace_config_path,
        delete_after_transfer = config.collect.delete_after_transfer,
        "device manager started"
    );
    let registry = DeviceRegistry::new(channel, config, args.operation);
    let handle = start_monitoring(registry, stop_flag);
    let registry = handle.join()?;
    info!(
        handled = registry.handled().len(),
        "device manager stopped"
    );
    Ok(())
}

fn trace_analysis(config: FleetConfig, args: TraceAnalysisArgs) -> Result<(), AppError> {
    let summary = analyse_tree(
        &args.traces_directory,
        &config.perfetto.trace_extension,
        &args.serials,
        &args.modules,
    )?;
    if !summary.failures.is_empty() {
        warn!(failures = summary.failures.len(), "some reports were not written");
    }
    let payload = serde_json::to_string_pretty(&summary)
        .map_err(|err| AppError::system(format!("Failed to encode summary: {err}"), ""))?;
    println!("{payload}");
    Ok(())
}

fn analyse_tree(
    traces_directory: &Path,
    extension: &str,
    serials: &[String],
    kinds: &[AnalysisKind],
) -> Result<AnalysisSummary, AppError> {
    let modules = select_modules(kinds, extension);
    run_analysis(traces_directory, extension, serials, &modules)
}
