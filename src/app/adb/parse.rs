use regex::Regex;

use crate::app::models::DeviceSummary;

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let mut model = None;
            let mut transport_id = None;
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    transport_id = Some(value.to_string());
                }
            }
            Some(DeviceSummary {
                serial: tokens[0].to_string(),
                state: tokens[1].to_string(),
                model,
                transport_id,
            })
        })
        .collect()
}

/// Serials that accept commands, in the order adb listed them, without duplicates.
pub fn reachable_serials(devices: &[DeviceSummary]) -> Vec<String> {
    let mut serials: Vec<String> = Vec::new();
    for device in devices.iter().filter(|device| device.is_reachable()) {
        if !serials.contains(&device.serial) {
            serials.push(device.serial.clone());
        }
    }
    serials
}

/// Parses `pidof` output. Anything that is not a list of numbers means the
/// process is absent; `pidof` prints nothing (and exits 1) in that case.
pub fn parse_pidof_output(output: &str) -> Vec<u32> {
    let tokens: Vec<&str> = output.split_whitespace().collect();
    if tokens.is_empty() {
        return Vec::new();
    }
    let mut pids = Vec::with_capacity(tokens.len());
    for token in tokens {
        match token.parse::<u32>() {
            Ok(pid) if pid > 0 => pids.push(pid),
            _ => return Vec::new(),
        }
    }
    pids
}

/// `perfetto --background` prints the daemon PID on a line of its own.
/// Exactly one such line must be present; zero or several is ambiguous.
pub fn parse_background_pid(output: &str) -> Option<u32> {
    let line_re = Regex::new(r"(?m)^[ \t]*(\d+)[ \t]*\r?$").ok()?;
    let mut matches = line_re.captures_iter(output);
    let first = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    first[1].parse::<u32>().ok().filter(|pid| *pid > 0)
}

/// Picks names with the trace extension out of an `ls` listing of `dir`
/// and returns their full device paths.
pub fn parse_trace_listing(output: &str, dir: &str, extension: &str) -> Vec<String> {
    let suffix = format!(".{extension}");
    let dir = dir.trim_end_matches('/');
    output
        .split_whitespace()
        .filter(|name| name.ends_with(&suffix) && name.len() > suffix.len())
        .filter(|name| !name.contains('/') && !name.ends_with(':'))
        .map(|name| format!("{dir}/{name}"))
        .collect()
}

/// Finds the output path in a tracing process command line (`ps -o ARGS=`).
pub fn find_trace_arg(cmdline: &str, extension: &str) -> Option<String> {
    let suffix = format!(".{extension}");
    cmdline
        .split_whitespace()
        .find(|token| token.ends_with(&suffix))
        .map(|token| token.to_string())
}

/// Distinguishes adb client/transport failures from the remote command's own stderr.
pub fn is_adb_transport_error(stderr: &str) -> bool {
    stderr.lines().map(|line| line.trim()).any(|line| {
        let lower = line.to_lowercase();
        lower.starts_with("error:")
            || lower.starts_with("adb: device")
            || lower.starts_with("adb: no devices")
            || lower.contains("device offline")
            || lower.contains("device unauthorized")
            || lower.contains("no devices/emulators found")
    })
}
