use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::app::adb::channel::ShellChannel;
use crate::app::adb::parse::parse_trace_listing;
use crate::app::adb::paths::{
    device_output_dir, remote_basename, shell_quote, validate_device_path,
    validate_serial_component,
};
use crate::app::config::FleetConfig;
use crate::app::error::AppError;
use crate::app::models::{CollectReport, PulledTrace, TraceFailure};

const PARTIAL_SUFFIX: &str = ".part";

/// Moves trace files from a device into `<output_dir>/<serial>/`.
///
/// The local name always equals the remote basename; the analysis stage
/// relies on that layout.
#[derive(Debug, Clone)]
pub struct TraceCollector {
    output_dir: PathBuf,
    remote_dir: String,
    extension: String,
    delete_after_transfer: bool,
}

impl TraceCollector {
    pub fn new(config: &FleetConfig) -> Self {
        Self {
            output_dir: config.output_dir(),
            remote_dir: config.perfetto.remote_dir().to_string(),
            extension: config.perfetto.trace_extension.clone(),
            delete_after_transfer: config.collect.delete_after_transfer,
        }
    }

    pub fn local_dir(&self, serial: &str) -> PathBuf {
        device_output_dir(&self.output_dir, serial)
    }

    pub fn local_path(&self, serial: &str, remote_path: &str) -> Option<PathBuf> {
        remote_basename(remote_path).map(|name| self.local_dir(serial).join(name))
    }

    pub fn list_remote<C: ShellChannel + ?Sized>(
        &self,
        channel: &C,
        serial: &str,
        trace_id: &str,
    ) -> Result<Vec<String>, AppError> {
        let listing = channel
            .shell(serial, &format!("ls {}", shell_quote(&self.remote_dir)))
            .map_err(|err| err.with_trace_id(trace_id))?;
        Ok(parse_trace_listing(&listing, &self.remote_dir, &self.extension))
    }

    pub fn collect<C: ShellChannel + ?Sized>(
        &self,
        channel: &C,
        serial: &str,
        trace_id: &str,
    ) -> Result<CollectReport, AppError> {
        self.collect_matching(channel, serial, |_| true, trace_id)
    }

    /// Pulls every listed trace accepted by `filter`. One failed file never
    /// stops the others; the remote copy is removed only after its pull is
    /// confirmed.
    pub fn collect_matching<C, F>(
        &self,
        channel: &C,
        serial: &str,
        filter: F,
        trace_id: &str,
    ) -> Result<CollectReport, AppError>
    where
        C: ShellChannel + ?Sized,
        F: Fn(&str) -> bool,
    {
        validate_serial_component(serial).map_err(|message| AppError::validation(message, trace_id))?;
        let local_dir = self.local_dir(serial);
        create_output_dir(&local_dir, trace_id)?;

        let mut report = CollectReport {
            serial: serial.to_string(),
            local_dir: local_dir.clone(),
            ..CollectReport::default()
        };

        let remote_files = self.list_remote(channel, serial, trace_id)?;
        if remote_files.is_empty() {
            info!(trace_id = %trace_id, serial = %serial, "no trace files found");
            return Ok(report);
        }

        for remote_path in remote_files.into_iter().filter(|path| filter(path)) {
            debug!(trace_id = %trace_id, serial = %serial, remote_path = %remote_path, "collecting trace");
            let local_path = match self.pull_one(channel, serial, &remote_path, trace_id) {
                Ok(local_path) => local_path,
                Err(err) => {
                    warn!(
                        trace_id = %trace_id,
                        serial = %serial,
                        remote_path = %remote_path,
                        error = %err,
                        "trace transfer failed; remote copy kept"
                    );
                    report.failed.push(TraceFailure {
                        remote_path,
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            info!(
                trace_id = %trace_id,
                serial = %serial,
                remote_path = %remote_path,
                local_path = %local_path.display(),
                "trace saved"
            );

            let mut remote_deleted = false;
            if self.delete_after_transfer {
                match channel.shell(serial, &format!("rm -f {}", shell_quote(&remote_path))) {
                    Ok(_) => {
                        remote_deleted = true;
                        debug!(trace_id = %trace_id, serial = %serial, remote_path = %remote_path, "remote trace deleted");
                    }
                    Err(err) => {
                        warn!(
                            trace_id = %trace_id,
                            serial = %serial,
                            remote_path = %remote_path,
                            error = %err,
                            "failed to delete remote trace"
                        );
                        report.delete_failed.push(TraceFailure {
                            remote_path: remote_path.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
            report.pulled.push(PulledTrace {
                remote_path,
                local_path,
                remote_deleted,
            });
        }
        Ok(report)
    }

    fn pull_one<C: ShellChannel + ?Sized>(
        &self,
        channel: &C,
        serial: &str,
        remote_path: &str,
        trace_id: &str,
    ) -> Result<PathBuf, AppError> {
        validate_device_path(remote_path).map_err(|message| AppError::validation(message, trace_id))?;
        let local_path = self.local_path(serial, remote_path).ok_or_else(|| {
            AppError::validation(format!("no file name in {remote_path}"), trace_id)
        })?;
        let partial_path = partial_path_for(&local_path);
        let _ = fs::remove_file(&partial_path);

        if let Err(err) = channel.pull(serial, remote_path, &partial_path) {
            let _ = fs::remove_file(&partial_path);
            return Err(err.with_trace_id(trace_id));
        }
        // adb can exit 0 without producing the file when the remote vanished mid-transfer.
        if !partial_path.is_file() {
            return Err(AppError::channel(
                format!("pull of {remote_path} reported success but produced no file"),
                trace_id,
            ));
        }
        fs::rename(&partial_path, &local_path).map_err(|err| {
            let _ = fs::remove_file(&partial_path);
            AppError::filesystem(
                format!("Failed to move trace into {}: {err}", local_path.display()),
                trace_id,
            )
        })?;
        Ok(local_path)
    }
}

fn partial_path_for(local_path: &Path) -> PathBuf {
    let mut name = local_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    local_path.with_file_name(name)
}

fn create_output_dir(local_dir: &Path, trace_id: &str) -> Result<(), AppError> {
    fs::create_dir_all(local_dir).map_err(|err| {
        let message = match err.kind() {
            ErrorKind::PermissionDenied => {
                format!("Permission denied creating directory {}", local_dir.display())
            }
            _ => format!("Failed to create directory {}: {err}", local_dir.display()),
        };
        AppError::filesystem(message, trace_id)
    })
}
