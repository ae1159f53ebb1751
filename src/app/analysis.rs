use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::error::AppError;
use crate::app::perfetto::filename::parse_trace_file_name;

/// One analysis pass over a collected trace. The result is written next to the
/// trace as `<trace without extension>-<name>-report.json`.
pub trait AnalysisModule {
    fn name(&self) -> &'static str;

    fn run(&self, serial: &str, trace_path: &Path) -> Result<serde_json::Value, AppError>;
}

/// Describes the trace file itself: owner device, size and capture time taken
/// from the file name. Payload contents are left to external processors.
#[derive(Debug, Clone)]
pub struct InventoryModule {
    extension: String,
}

impl InventoryModule {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct InventoryReport {
    serial: String,
    trace: String,
    size_bytes: u64,
    captured_at: Option<String>,
    suffix: Option<String>,
}

impl AnalysisModule for InventoryModule {
    fn name(&self) -> &'static str {
        "inventory"
    }

    fn run(&self, serial: &str, trace_path: &Path) -> Result<serde_json::Value, AppError> {
        let metadata = fs::metadata(trace_path).map_err(|err| {
            AppError::filesystem(format!("Failed to stat {}: {err}", trace_path.display()), "")
        })?;
        let file_name = trace_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let parsed = parse_trace_file_name(&file_name, &self.extension);
        let report = InventoryReport {
            serial: serial.to_string(),
            trace: file_name,
            size_bytes: metadata.len(),
            captured_at: parsed
                .as_ref()
                .map(|name| name.captured_at.format("%Y-%m-%dT%H:%M:%S").to_string()),
            suffix: parsed.map(|name| name.suffix),
        };
        serde_json::to_value(report)
            .map_err(|err| AppError::system(format!("Failed to encode report: {err}"), ""))
    }
}

/// Module selection on the command line. `all` (or no selection) runs every module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AnalysisKind {
    #[value(alias = "ANALYSIS_ALL")]
    All,
    /// File name, size and capture time of each trace.
    #[value(alias = "ANALYSIS_INVENTORY")]
    Inventory,
}

pub fn select_modules(kinds: &[AnalysisKind], extension: &str) -> Vec<Box<dyn AnalysisModule>> {
    let all = kinds.is_empty() || kinds.contains(&AnalysisKind::All);
    let mut modules: Vec<Box<dyn AnalysisModule>> = Vec::new();
    if all || kinds.contains(&AnalysisKind::Inventory) {
        modules.push(Box::new(InventoryModule::new(extension)));
    }
    modules
}

/// Trace files under `<output_dir>/<serial>/`, keyed by serial.
/// A missing output directory yields an empty map.
pub fn local_traces(
    output_dir: &Path,
    extension: &str,
) -> Result<BTreeMap<String, Vec<PathBuf>>, AppError> {
    let entries = match fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(output_dir = %output_dir.display(), "traces directory does not exist");
            return Ok(BTreeMap::new());
        }
        Err(err) => {
            return Err(AppError::filesystem(
                format!("Failed to read {}: {err}", output_dir.display()),
                "",
            ))
        }
    };

    let suffix = format!(".{extension}");
    let mut traces: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for entry in entries.flatten() {
        let serial_dir = entry.path();
        if !serial_dir.is_dir() {
            continue;
        }
        let serial = entry.file_name().to_string_lossy().to_string();
        let mut files: Vec<PathBuf> = match fs::read_dir(&serial_dir) {
            Ok(files) => files
                .flatten()
                .map(|file| file.path())
                .filter(|path| path.is_file())
                .filter(|path| {
                    path.file_name()
                        .map(|name| name.to_string_lossy().ends_with(&suffix))
                        .unwrap_or(false)
                })
                .collect(),
            Err(err) => {
                warn!(serial = %serial, error = %err, "cannot list serial directory");
                Vec::new()
            }
        };
        files.sort();
        traces.insert(serial, files);
    }
    Ok(traces)
}

pub fn filter_serials(
    traces: BTreeMap<String, Vec<PathBuf>>,
    serials: &[String],
) -> BTreeMap<String, Vec<PathBuf>> {
    if serials.is_empty() {
        return traces;
    }
    traces
        .into_iter()
        .filter(|(serial, _)| serials.contains(serial))
        .collect()
}

pub fn report_path(trace_path: &Path, module_name: &str) -> PathBuf {
    let stem = trace_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    trace_path.with_file_name(format!("{stem}-{module_name}-report.json"))
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SerialSummary {
    pub serial: String,
    pub traces: usize,
    pub reports: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct AnalysisSummary {
    pub output_dir: PathBuf,
    pub serials: Vec<SerialSummary>,
    pub failures: Vec<String>,
}

pub fn run_analysis(
    output_dir: &Path,
    extension: &str,
    serials: &[String],
    modules: &[Box<dyn AnalysisModule>],
) -> Result<AnalysisSummary, AppError> {
    let traces = filter_serials(local_traces(output_dir, extension)?, serials);
    let mut summary = AnalysisSummary {
        output_dir: output_dir.to_path_buf(),
        ..AnalysisSummary::default()
    };
    for (serial, files) in traces {
        debug!(serial = %serial, traces = files.len(), "analysing serial");
        let mut serial_summary = SerialSummary {
            serial: serial.clone(),
            traces: files.len(),
            reports: Vec::new(),
        };
        for trace_path in &files {
            for module in modules {
                match write_report(module.as_ref(), &serial, trace_path) {
                    Ok(path) => {
                        info!(
                            serial = %serial,
                            module = module.name(),
                            trace = %trace_path.display(),
                            report = %path.display(),
                            "report saved"
                        );
                        serial_summary.reports.push(path);
                    }
                    Err(err) => {
                        warn!(serial = %serial, module = module.name(), error = %err, "analysis failed");
                        summary
                            .failures
                            .push(format!("{} [{}]: {err}", trace_path.display(), module.name()));
                    }
                }
            }
        }
        summary.serials.push(serial_summary);
    }
    Ok(summary)
}

fn write_report(
    module: &dyn AnalysisModule,
    serial: &str,
    trace_path: &Path,
) -> Result<PathBuf, AppError> {
    let value = module.run(serial, trace_path)?;
    let path = report_path(trace_path, module.name());
    let payload = serde_json::to_string_pretty(&value)
        .map_err(|err| AppError::system(format!("Failed to encode report: {err}"), ""))?;
    fs::write(&path, payload).map_err(|err| {
        AppError::filesystem(format!("Failed to write {}: {err}", path.display()), "")
    })?;
    Ok(path)
}
