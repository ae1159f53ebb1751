use tracing::debug;

use crate::app::adb::channel::ShellChannel;
use crate::app::adb::parse::{find_trace_arg, parse_pidof_output};
use crate::app::error::AppError;
use crate::app::models::ProbeResult;

/// Answers "is `<process>` running on this device, and as which PID?".
#[derive(Debug, Clone)]
pub struct ProcessProbe {
    process_name: String,
}

impl ProcessProbe {
    /// `command` may be a bare name or a device path such as
    /// `/system/bin/perfetto`; `pidof` matches on the basename.
    pub fn new(command: &str) -> Self {
        let trimmed = command.trim();
        let process_name = trimmed
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(trimmed);
        Self {
            process_name: process_name.to_string(),
        }
    }

    /// A channel failure is returned as an error and must be read as "unknown".
    pub fn probe<C: ShellChannel + ?Sized>(
        &self,
        channel: &C,
        serial: &str,
        trace_id: &str,
    ) -> Result<ProbeResult, AppError> {
        let output = channel
            .shell(serial, &format!("pidof {}", self.process_name))
            .map_err(|err| err.with_trace_id(trace_id))?;
        let pids = parse_pidof_output(&output);
        if pids.is_empty() {
            debug!(trace_id = %trace_id, serial = %serial, process = %self.process_name, "process not running");
            return Ok(ProbeResult::NotRunning);
        }
        debug!(trace_id = %trace_id, serial = %serial, pids = ?pids, "process running");
        Ok(ProbeResult::Running(pids))
    }

    /// Output file of a running tracing process, read from its command line.
    pub fn running_trace_path<C: ShellChannel + ?Sized>(
        &self,
        channel: &C,
        serial: &str,
        pid: u32,
        extension: &str,
        trace_id: &str,
    ) -> Result<Option<String>, AppError> {
        let cmdline = channel
            .shell(serial, &format!("ps -p {pid} -o ARGS="))
            .map_err(|err| err.with_trace_id(trace_id))?;
        debug!(trace_id = %trace_id, serial = %serial, pid, cmdline = %cmdline.trim(), "running cmdline");
        Ok(find_trace_arg(&cmdline, extension))
    }
}
