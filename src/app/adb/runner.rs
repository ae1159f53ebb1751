use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::app::error::AppError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// How a local command is launched.
#[derive(Debug, Clone, Default)]
pub struct RunOptions<'a> {
    /// Bytes written to the child's stdin, which is then closed.
    pub stdin: Option<&'a [u8]>,
    /// Start the child as leader of a new process group so signals aimed at
    /// our own group never reach it.
    pub own_process_group: bool,
}

pub fn run_command_with_options(
    program: &str,
    args: &[String],
    timeout: Duration,
    options: &RunOptions<'_>,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if options.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if options.own_process_group {
        set_own_process_group(&mut command);
    }
    let mut child = command
        .spawn()
        .map_err(|err| AppError::system(format!("Failed to spawn command: {err}"), trace_id))?;

    let stdin_handle = match options.stdin {
        Some(input) => {
            let mut stdin = match child.stdin.take() {
                Some(stdin) => stdin,
                None => {
                    reap(&mut child);
                    return Err(AppError::system("Failed to capture stdin", trace_id));
                }
            };
            let payload = input.to_vec();
            // A child that exits without reading its input yields a broken pipe; the exit
            // code is what we report, so the write error is dropped.
            Some(std::thread::spawn(move || {
                let _ = stdin.write_all(&payload);
            }))
        }
        None => None,
    };

    // Drain stdout/stderr in parallel; otherwise, a chatty child process can block once the pipe
    // buffer fills, and we will incorrectly hit the timeout.
    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            reap(&mut child);
            return Err(AppError::system("Failed to capture stdout", trace_id));
        }
    };
    let stderr = match child.stderr.take() {
        Some(stderr) => stderr,
        None => {
            reap(&mut child);
            return Err(AppError::system("Failed to capture stderr", trace_id));
        }
    };
    let stdout_handle = spawn_drain(stdout);
    let stderr_handle = spawn_drain(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    // Descendants may still hold the pipes, so the drain and stdin
                    // threads are left to finish on their own.
                    reap_group(&mut child, options.own_process_group);
                    return Err(AppError::system(
                        format!("Command timed out after {}s", timeout.as_secs()),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                reap_group(&mut child, options.own_process_group);
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    };

    join_quietly(stdin_handle);
    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

fn spawn_drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

/// Kills the child if still alive and always waits on it, so no zombie is left behind.
fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Like `reap`, but first kills the child's whole process group when it leads one.
fn reap_group(child: &mut Child, own_process_group: bool) {
    if own_process_group {
        kill_process_group(child.id());
    }
    reap(child);
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal. The leader is not reaped yet, so the
    // group id cannot have been reused; ESRCH from an empty group is ignored.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

fn join_quietly(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        let _ = handle.join();
    }
}

#[cfg(unix)]
fn set_own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn set_own_process_group(_command: &mut Command) {}
