//! Scripted in-memory `ShellChannel` used by the controller, collector and
//! registry tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::app::adb::channel::ShellChannel;
use crate::app::adb::runner::CommandOutput;
use crate::app::error::AppError;

#[derive(Debug, Clone)]
struct FakeProcess {
    pids: Vec<u32>,
    cmdline: String,
    killed: bool,
    /// Probes that still report the process after it was signalled.
    probes_until_exit: u32,
}

#[derive(Debug, Clone)]
struct LaunchScript {
    stdout: String,
    exit_code: Option<i32>,
    spawns_process: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    devices: Vec<String>,
    discover_fails: bool,
    unreachable: HashSet<String>,
    processes: HashMap<String, FakeProcess>,
    files: HashMap<String, BTreeMap<String, Vec<u8>>>,
    failing_pulls: HashSet<String>,
    launches: HashMap<String, LaunchScript>,
    stdin_seen: HashMap<String, Vec<u8>>,
    calls: Vec<String>,
    next_pid: u32,
    exit_after_kill: u32,
}

#[derive(Debug)]
pub struct FakeChannel {
    state: Mutex<FakeState>,
}

impl Default for FakeChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChannel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_pid: 4821,
                ..FakeState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake channel lock")
    }

    pub fn set_devices(&self, serials: &[&str]) {
        self.lock().devices = serials.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_discover_fails(&self, fails: bool) {
        self.lock().discover_fails = fails;
    }

    pub fn set_unreachable(&self, serial: &str, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(serial.to_string());
        } else {
            state.unreachable.remove(serial);
        }
    }

    /// Pretends a tracing process is already running on `serial`.
    pub fn add_running(&self, serial: &str, pids: &[u32], remote_path: &str) {
        let mut state = self.lock();
        let probes_until_exit = state.exit_after_kill;
        state.processes.insert(
            serial.to_string(),
            FakeProcess {
                pids: pids.to_vec(),
                cmdline: format!("perfetto --background -o {remote_path} -c -"),
                killed: false,
                probes_until_exit,
            },
        );
    }

    /// Number of probes a signalled process survives, applied to processes added afterwards.
    pub fn set_exit_after_kill(&self, probes: u32) {
        self.lock().exit_after_kill = probes;
    }

    pub fn set_next_pid(&self, pid: u32) {
        self.lock().next_pid = pid;
    }

    pub fn add_file(&self, serial: &str, remote_path: &str, content: &[u8]) {
        self.lock()
            .files
            .entry(serial.to_string())
            .or_default()
            .insert(remote_path.to_string(), content.to_vec());
    }

    pub fn fail_pull(&self, remote_path: &str) {
        self.lock().failing_pulls.insert(remote_path.to_string());
    }

    pub fn script_launch(&self, serial: &str, stdout: &str, exit_code: Option<i32>, spawns: bool) {
        self.lock().launches.insert(
            serial.to_string(),
            LaunchScript {
                stdout: stdout.to_string(),
                exit_code,
                spawns_process: spawns,
            },
        );
    }

    pub fn remote_files(&self, serial: &str) -> Vec<String> {
        self.lock()
            .files
            .get(serial)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn running_pids(&self, serial: &str) -> Vec<u32> {
        self.lock()
            .processes
            .get(serial)
            .map(|process| process.pids.clone())
            .unwrap_or_default()
    }

    pub fn stdin_seen(&self, serial: &str) -> Option<Vec<u8>> {
        self.lock().stdin_seen.get(serial).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, serial: &str) -> Vec<String> {
        let prefix = format!("{serial}: ");
        self.calls()
            .into_iter()
            .filter_map(|call| call.strip_prefix(&prefix).map(|rest| rest.to_string()))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

fn unquote(arg: &str) -> String {
    arg.trim_matches('\'').to_string()
}

fn check_reachable(state: &FakeState, serial: &str) -> Result<(), AppError> {
    if state.unreachable.contains(serial) || !state.devices.iter().any(|s| s == serial) {
        return Err(AppError::channel(format!("error: device '{serial}' not found"), ""));
    }
    Ok(())
}

impl ShellChannel for FakeChannel {
    fn discover(&self) -> Result<Vec<String>, AppError> {
        let mut state = self.lock();
        state.calls.push("discover".to_string());
        if state.discover_fails {
            return Err(AppError::channel("adb server not running", ""));
        }
        Ok(state.devices.clone())
    }

    fn shell(&self, serial: &str, command: &str) -> Result<String, AppError> {
        let mut state = self.lock();
        state.calls.push(format!("{serial}: {command}"));
        check_reachable(&state, serial)?;

        let tokens: Vec<&str> = command.split_whitespace().collect();
        match tokens.as_slice() {
            ["pidof", _name] => {
                let Some(process) = state.processes.get_mut(serial) else {
                    return Ok(String::new());
                };
                if process.killed {
                    if process.probes_until_exit == 0 {
                        state.processes.remove(serial);
                        return Ok(String::new());
                    }
                    process.probes_until_exit -= 1;
                }
                let pids = process
                    .pids
                    .iter()
                    .map(|pid| pid.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                Ok(format!("{pids}\n"))
            }
            ["kill", "-TERM", pids @ ..] => {
                if let Some(process) = state.processes.get_mut(serial) {
                    if pids.iter().any(|pid| process.pids.iter().any(|p| p.to_string() == *pid)) {
                        process.killed = true;
                    }
                }
                Ok(String::new())
            }
            ["ps", "-p", pid, "-o", "ARGS="] => Ok(state
                .processes
                .get(serial)
                .filter(|process| process.pids.iter().any(|p| p.to_string() == *pid))
                .map(|process| format!("{}\n", process.cmdline))
                .unwrap_or_default()),
            ["ls", dir] => {
                let dir = unquote(dir);
                let dir = dir.trim_end_matches('/');
                let names = state
                    .files
                    .get(serial)
                    .map(|files| {
                        files
                            .keys()
                            .filter_map(|path| {
                                path.strip_prefix(dir)
                                    .and_then(|rest| rest.strip_prefix('/'))
                                    .map(|name| name.to_string())
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                Ok(names.join("\n"))
            }
            ["rm", "-f", path] => {
                let path = unquote(path);
                if let Some(files) = state.files.get_mut(serial) {
                    files.remove(&path);
                }
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }

    fn exec_with_stdin(
        &self,
        serial: &str,
        argv: &[String],
        input: &[u8],
    ) -> Result<CommandOutput, AppError> {
        let mut state = self.lock();
        state.calls.push(format!("{serial}: {}", argv.join(" ")));
        check_reachable(&state, serial)?;
        state.stdin_seen.insert(serial.to_string(), input.to_vec());

        let remote_path = argv
            .iter()
            .position(|arg| arg == "-o")
            .and_then(|index| argv.get(index + 1))
            .cloned()
            .unwrap_or_default();
        let pid = state.next_pid;
        let script = state.launches.get(serial).cloned().unwrap_or(LaunchScript {
            stdout: format!("{pid}\n"),
            exit_code: Some(0),
            spawns_process: true,
        });
        if script.spawns_process {
            let probes_until_exit = state.exit_after_kill;
            state.processes.insert(
                serial.to_string(),
                FakeProcess {
                    pids: vec![pid],
                    cmdline: argv.join(" "),
                    killed: false,
                    probes_until_exit,
                },
            );
            state
                .files
                .entry(serial.to_string())
                .or_default()
                .insert(remote_path, input.to_vec());
            state.next_pid += 1;
        }
        Ok(CommandOutput {
            stdout: script.stdout,
            stderr: String::new(),
            exit_code: script.exit_code,
        })
    }

    fn pull(&self, serial: &str, remote_path: &str, local_path: &Path) -> Result<(), AppError> {
        let mut state = self.lock();
        state
            .calls
            .push(format!("{serial}: pull {remote_path} {}", local_path.display()));
        check_reachable(&state, serial)?;
        if state.failing_pulls.contains(remote_path) {
            return Err(AppError::channel(format!("pull {remote_path} interrupted"), ""));
        }
        let content = state
            .files
            .get(serial)
            .and_then(|files| files.get(remote_path))
            .cloned()
            .ok_or_else(|| {
                AppError::channel(format!("remote object '{remote_path}' does not exist"), "")
            })?;
        fs::write(local_path, content)
            .map_err(|err| AppError::channel(format!("cannot write local file: {err}"), ""))?;
        Ok(())
    }
}
