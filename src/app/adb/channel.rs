use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::app::adb::parse::{is_adb_transport_error, parse_adb_devices, reachable_serials};
use crate::app::adb::runner::{run_command_with_options, CommandOutput, RunOptions};
use crate::app::config::AdbSettings;
use crate::app::error::AppError;

/// Everything the tracing core needs from the debug bridge.
///
/// Implementations report transport faults as `ERR_CHANNEL` errors. A remote
/// command that ran but printed nothing is *not* an error: `shell` returns the
/// (possibly empty) text and leaves interpretation to the caller.
pub trait ShellChannel {
    /// Reachable serials in the order the bridge lists them.
    fn discover(&self) -> Result<Vec<String>, AppError>;

    fn shell(&self, serial: &str, command: &str) -> Result<String, AppError>;

    /// Runs `argv` on the device with `input` as stdin. The local launcher
    /// runs in its own process group.
    fn exec_with_stdin(
        &self,
        serial: &str,
        argv: &[String],
        input: &[u8],
    ) -> Result<CommandOutput, AppError>;

    fn pull(&self, serial: &str, remote_path: &str, local_path: &Path) -> Result<(), AppError>;
}

impl<T: ShellChannel + ?Sized> ShellChannel for &T {
    fn discover(&self) -> Result<Vec<String>, AppError> {
        (**self).discover()
    }

    fn shell(&self, serial: &str, command: &str) -> Result<String, AppError> {
        (**self).shell(serial, command)
    }

    fn exec_with_stdin(
        &self,
        serial: &str,
        argv: &[String],
        input: &[u8],
    ) -> Result<CommandOutput, AppError> {
        (**self).exec_with_stdin(serial, argv, input)
    }

    fn pull(&self, serial: &str, remote_path: &str, local_path: &Path) -> Result<(), AppError> {
        (**self).pull(serial, remote_path, local_path)
    }
}

impl<T: ShellChannel + ?Sized> ShellChannel for Arc<T> {
    fn discover(&self) -> Result<Vec<String>, AppError> {
        (**self).discover()
    }

    fn shell(&self, serial: &str, command: &str) -> Result<String, AppError> {
        (**self).shell(serial, command)
    }

    fn exec_with_stdin(
        &self,
        serial: &str,
        argv: &[String],
        input: &[u8],
    ) -> Result<CommandOutput, AppError> {
        (**self).exec_with_stdin(serial, argv, input)
    }

    fn pull(&self, serial: &str, remote_path: &str, local_path: &Path) -> Result<(), AppError> {
        (**self).pull(serial, remote_path, local_path)
    }
}

pub fn resolve_adb_program(config_command_path: &str) -> String {
    let trimmed = config_command_path.trim();
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|quote| {
            trimmed
                .strip_prefix(*quote)
                .and_then(|inner| inner.strip_suffix(*quote))
        })
        .unwrap_or(trimmed)
        .trim();
    if unquoted.is_empty() {
        "adb".to_string()
    } else {
        unquoted.to_string()
    }
}

/// `ShellChannel` backed by the `adb` host binary.
#[derive(Debug, Clone)]
pub struct AdbChannel {
    program: String,
    command_timeout: Duration,
    transfer_timeout: Duration,
}

impl AdbChannel {
    pub fn new(settings: &AdbSettings) -> Self {
        Self {
            program: resolve_adb_program(&settings.command_path),
            command_timeout: Duration::from_secs(settings.command_timeout_secs.max(1)),
            transfer_timeout: Duration::from_secs(settings.transfer_timeout_secs.max(1)),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn run(
        &self,
        args: Vec<String>,
        timeout: Duration,
        options: &RunOptions<'_>,
    ) -> Result<CommandOutput, AppError> {
        debug!(program = %self.program, args = ?args, "adb invocation");
        run_command_with_options(&self.program, &args, timeout, options, "").map_err(|err| {
            // Spawn failures and timeouts both leave the device state unknown.
            AppError::channel(format!("adb {}: {}", args.join(" "), err.error), err.trace_id)
        })
    }
}

fn device_args(serial: &str, rest: &[&str]) -> Vec<String> {
    let mut args = vec!["-s".to_string(), serial.to_string()];
    args.extend(rest.iter().map(|item| item.to_string()));
    args
}

fn transport_failure(output: &CommandOutput) -> Option<String> {
    if output.success() || !is_adb_transport_error(&output.stderr) {
        return None;
    }
    Some(output.stderr.trim().to_string())
}

impl ShellChannel for AdbChannel {
    fn discover(&self) -> Result<Vec<String>, AppError> {
        let output = self.run(
            vec!["devices".to_string(), "-l".to_string()],
            self.command_timeout,
            &RunOptions::default(),
        )?;
        if !output.success() {
            return Err(AppError::channel(
                format!("adb devices failed: {}", output.stderr.trim()),
                "",
            ));
        }
        Ok(reachable_serials(&parse_adb_devices(&output.stdout)))
    }

    fn shell(&self, serial: &str, command: &str) -> Result<String, AppError> {
        let output = self.run(
            device_args(serial, &["shell", command]),
            self.command_timeout,
            &RunOptions::default(),
        )?;
        if let Some(message) = transport_failure(&output) {
            return Err(AppError::channel(
                format!("[{serial}] shell <{command}> failed: {message}"),
                "",
            ));
        }
        Ok(output.stdout)
    }

    fn exec_with_stdin(
        &self,
        serial: &str,
        argv: &[String],
        input: &[u8],
    ) -> Result<CommandOutput, AppError> {
        let mut args = device_args(serial, &["shell"]);
        args.extend(argv.iter().cloned());
        let options = RunOptions {
            stdin: Some(input),
            own_process_group: true,
        };
        let output = self.run(args, self.command_timeout, &options)?;
        if let Some(message) = transport_failure(&output) {
            return Err(AppError::channel(
                format!("[{serial}] {} failed: {message}", argv.join(" ")),
                "",
            ));
        }
        Ok(output)
    }

    fn pull(&self, serial: &str, remote_path: &str, local_path: &Path) -> Result<(), AppError> {
        let local = local_path.to_string_lossy().to_string();
        let output = self.run(
            device_args(serial, &["pull", remote_path, &local]),
            self.transfer_timeout,
            &RunOptions::default(),
        )?;
        if !output.success() {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            return Err(AppError::channel(
                format!("[{serial}] pull {remote_path} failed: {detail}"),
                "",
            ));
        }
        Ok(())
    }
}
