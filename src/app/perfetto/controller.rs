use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::adb::channel::ShellChannel;
use crate::app::adb::parse::parse_background_pid;
use crate::app::collector::TraceCollector;
use crate::app::config::{FleetConfig, PerfettoSettings};
use crate::app::error::AppError;
use crate::app::models::{
    CollectReport, ProbeResult, SessionState, StartOutcome, StopOutcome, TracingSession,
};
use crate::app::perfetto::filename::TraceNameGenerator;
use crate::app::perfetto::probe::ProcessProbe;

/// Start/stop/collect for the tracing session of one device.
///
/// Remote state is only ever learned by probing; the cached `state` is a
/// record of the last observation, and every operation re-probes before acting.
pub struct PerfettoController<'a, C: ShellChannel + ?Sized> {
    channel: &'a C,
    serial: String,
    trace_id: String,
    settings: PerfettoSettings,
    trace_config_path: PathBuf,
    probe: ProcessProbe,
    collector: TraceCollector,
    state: SessionState,
    session: Option<TracingSession>,
}

impl<'a, C: ShellChannel + ?Sized> PerfettoController<'a, C> {
    pub fn new(
        channel: &'a C,
        serial: impl Into<String>,
        config: &FleetConfig,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            serial: serial.into(),
            trace_id: trace_id.into(),
            settings: config.perfetto.clone(),
            trace_config_path: PathBuf::from(config.trace_config_path.trim()),
            probe: ProcessProbe::new(&config.perfetto.command),
            collector: TraceCollector::new(config),
            state: SessionState::Unknown,
            session: None,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> Option<&TracingSession> {
        self.session.as_ref()
    }

    /// Probes the device and records what it saw. On a channel fault the
    /// state becomes `Unknown` and the error is returned.
    pub fn refresh(&mut self) -> Result<ProbeResult, AppError> {
        match self.probe.probe(self.channel, &self.serial, &self.trace_id) {
            Ok(ProbeResult::NotRunning) => {
                self.state = SessionState::NotRunning;
                self.session = None;
                Ok(ProbeResult::NotRunning)
            }
            Ok(ProbeResult::Running(pids)) => {
                self.adopt(pids[0]);
                Ok(ProbeResult::Running(pids))
            }
            Err(err) => {
                self.state = SessionState::Unknown;
                Err(err)
            }
        }
    }

    fn adopt(&mut self, pid: u32) {
        self.state = SessionState::Running;
        if self.session.as_ref().map(|session| session.pid) == Some(pid) {
            return;
        }
        let remote_path = match self.probe.running_trace_path(
            self.channel,
            &self.serial,
            pid,
            &self.settings.trace_extension,
            &self.trace_id,
        ) {
            Ok(path) => path,
            Err(err) => {
                debug!(trace_id = %self.trace_id, serial = %self.serial, error = %err, "could not read running trace path");
                None
            }
        };
        self.session = Some(TracingSession {
            pid,
            remote_path,
            config_source: None,
        });
    }

    /// Launches a background tracing session unless one is already live.
    ///
    /// `Ok(AlreadyRunning)` and `Ok(Started)` are the two successful outcomes.
    /// A launch whose output carries no PID line, or that exits nonzero, is an
    /// `ERR_PROTOCOL` error; an unreadable trace config is `ERR_CONFIG`.
    pub fn start(&mut self, names: &mut TraceNameGenerator) -> Result<StartOutcome, AppError> {
        if let Some(pid) = self.refresh()?.primary_pid() {
            info!(trace_id = %self.trace_id, serial = %self.serial, pid, "perfetto is already running");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        let trace_config = fs::read(&self.trace_config_path).map_err(|err| {
            AppError::config(
                format!(
                    "Failed to read trace config {}: {err}",
                    self.trace_config_path.display()
                ),
                &self.trace_id,
            )
        })?;

        self.state = SessionState::Starting;
        let remote_path = names.next_remote_path(self.settings.remote_dir());
        let argv = vec![
            self.settings.command.clone(),
            "--background".to_string(),
            "-o".to_string(),
            remote_path.clone(),
            "-c".to_string(),
            "-".to_string(),
        ];
        debug!(trace_id = %self.trace_id, serial = %self.serial, remote_path = %remote_path, "starting perfetto");

        let output = match self.channel.exec_with_stdin(&self.serial, &argv, &trace_config) {
            Ok(output) => output,
            Err(err) => {
                self.state = SessionState::Unknown;
                return Err(err.with_trace_id(&self.trace_id));
            }
        };

        let Some(pid) = parse_background_pid(&output.stdout) else {
            // The launcher may still have left a daemon behind; only a probe can tell.
            self.state = SessionState::Unknown;
            warn!(
                trace_id = %self.trace_id,
                serial = %self.serial,
                exit_code = ?output.exit_code,
                stdout = %output.stdout.trim(),
                stderr = %output.stderr.trim(),
                "failed to read the pid from perfetto --background"
            );
            return Err(AppError::protocol(
                format!("[{}] perfetto --background printed no PID line", self.serial),
                &self.trace_id,
            ));
        };
        if !output.success() {
            self.state = SessionState::Unknown;
            warn!(
                trace_id = %self.trace_id,
                serial = %self.serial,
                pid,
                exit_code = ?output.exit_code,
                stderr = %output.stderr.trim(),
                "perfetto invocation failed"
            );
            return Err(AppError::protocol(
                format!(
                    "[{}] perfetto exited with {:?} after reporting PID {pid}",
                    self.serial, output.exit_code
                ),
                &self.trace_id,
            ));
        }

        let session = TracingSession {
            pid,
            remote_path: Some(remote_path),
            config_source: Some(self.trace_config_path.clone()),
        };
        self.state = SessionState::Running;
        self.session = Some(session.clone());
        info!(trace_id = %self.trace_id, serial = %self.serial, pid, "perfetto has started");
        Ok(StartOutcome::Started(session))
    }

    /// Stops the tracing session using the configured stop bound.
    pub fn stop(&mut self) -> Result<StopOutcome, AppError> {
        self.stop_within(self.settings.stop_timeout())
    }

    /// Signals every running tracing PID and waits for the probe to report
    /// absence. With `bound == None` the wait is unbounded.
    pub fn stop_within(&mut self, bound: Option<Duration>) -> Result<StopOutcome, AppError> {
        debug!(trace_id = %self.trace_id, serial = %self.serial, "stopping perfetto");
        let pids = match self.refresh()? {
            ProbeResult::NotRunning => {
                info!(trace_id = %self.trace_id, serial = %self.serial, "perfetto was not running");
                return Ok(StopOutcome::NotRunning);
            }
            ProbeResult::Running(pids) => pids,
        };
        if let Some(recorded) = self.session.as_ref().map(|session| session.pid) {
            if recorded != pids[0] {
                debug!(trace_id = %self.trace_id, serial = %self.serial, recorded, probed = pids[0], "recorded pid is stale");
            }
        }

        self.state = SessionState::Stopping;
        let pid_list = pids
            .iter()
            .map(|pid| pid.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        debug!(trace_id = %self.trace_id, serial = %self.serial, pids = %pid_list, "terminating perfetto");
        if let Err(err) = self.channel.shell(&self.serial, &format!("kill -TERM {pid_list}")) {
            self.state = SessionState::Unknown;
            return Err(err.with_trace_id(&self.trace_id));
        }

        let interval = self.settings.stop_poll_interval();
        let started = Instant::now();
        let mut polls = 0u32;
        loop {
            polls += 1;
            match self.probe.probe(self.channel, &self.serial, &self.trace_id) {
                Ok(ProbeResult::NotRunning) => break,
                Ok(ProbeResult::Running(_)) => {}
                Err(err) => {
                    self.state = SessionState::Unknown;
                    return Err(err);
                }
            }
            if let Some(bound) = bound {
                if started.elapsed() + interval > bound {
                    self.state = SessionState::Unknown;
                    warn!(
                        trace_id = %self.trace_id,
                        serial = %self.serial,
                        pids = %pid_list,
                        polls,
                        "perfetto still running after termination signal"
                    );
                    return Err(AppError::protocol(
                        format!(
                            "[{}] perfetto (PID {pid_list}) still running {}s after SIGTERM",
                            self.serial,
                            started.elapsed().as_secs()
                        ),
                        &self.trace_id,
                    ));
                }
            }
            thread::sleep(interval);
        }

        self.state = SessionState::NotRunning;
        self.session = None;
        info!(trace_id = %self.trace_id, serial = %self.serial, pids = %pid_list, "perfetto has been terminated");
        Ok(StopOutcome::Stopped { pids, polls })
    }

    pub fn collect(&self) -> Result<CollectReport, AppError> {
        self.collector.collect(self.channel, &self.serial, &self.trace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::FakeChannel;
    use std::path::Path;

    const SERIAL: &str = "ABC123";

    struct Fixture {
        _dir: tempfile::TempDir,
        config: FleetConfig,
        channel: FakeChannel,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let trace_config = dir.path().join("config.pbtxt");
        fs::write(&trace_config, b"buffers { size_kb: 63488 }\nduration_ms: 10000\n")
            .expect("write config");
        let mut config = FleetConfig::default();
        config.output_dir = dir.path().join("out").to_string_lossy().to_string();
        config.trace_config_path = trace_config.to_string_lossy().to_string();
        let channel = FakeChannel::new();
        channel.set_devices(&[SERIAL]);
        Fixture {
            _dir: dir,
            config,
            channel,
        }
    }

    #[test]
    fn start_then_stop_scenario() {
        let fx = fixture();
        fx.channel.set_next_pid(4821);
        fx.channel.set_exit_after_kill(3);
        let mut names = TraceNameGenerator::new("pftrace");
        let mut controller = PerfettoController::new(&fx.channel, SERIAL, &fx.config, "t");

        let session = match controller.start(&mut names).expect("start") {
            StartOutcome::Started(session) => session,
            other => panic!("expected Started, got {other:?}"),
        };
        assert_eq!(session.pid, 4821);
        assert_eq!(controller.state(), SessionState::Running);
        assert_eq!(fx.channel.running_pids(SERIAL), vec![4821]);
        assert_eq!(
            fx.channel.stdin_seen(SERIAL).expect("stdin"),
            fs::read(&fx.config.trace_config_path).expect("config")
        );
        let remote_path = session.remote_path.expect("remote path");
        assert!(remote_path.starts_with("/data/misc/perfetto-traces/"));
        assert!(remote_path.ends_with(".pftrace"));

        let (pids, polls) = match controller.stop().expect("stop") {
            StopOutcome::Stopped { pids, polls } => (pids, polls),
            other => panic!("expected Stopped, got {other:?}"),
        };
        assert_eq!(pids, vec![4821]);
        assert!(polls <= 5, "took {polls} polls");
        assert!(fx.channel.calls_for(SERIAL).contains(&"kill -TERM 4821".to_string()));
        assert_eq!(controller.state(), SessionState::NotRunning);
        assert!(controller.session().is_none());
    }

    #[test]
    fn launch_uses_background_mode_with_stdin_config() {
        let fx = fixture();
        let mut names = TraceNameGenerator::new("pftrace");
        let mut controller = PerfettoController::new(&fx.channel, SERIAL, &fx.config, "t");
        controller.start(&mut names).expect("start");
        let launch = fx
            .channel
            .calls_for(SERIAL)
            .into_iter()
            .find(|call| call.starts_with("perfetto"))
            .expect("launch call");
        assert!(launch.starts_with("perfetto --background -o /data/misc/perfetto-traces/"));
        assert!(launch.ends_with(".pftrace -c -"));
    }

    #[test]
    fn start_when_running_does_not_start() {
        let fx = fixture();
        fx.channel
            .add_running(SERIAL, &[777], "/data/misc/perfetto-traces/old.pftrace");
        let mut names = TraceNameGenerator::new("pftrace");
        let mut controller = PerfettoController::new(&fx.channel, SERIAL, &fx.config, "t");

        let outcome = controller.start(&mut names).expect("start");
        assert_eq!(outcome, StartOutcome::AlreadyRunning { pid: 777 });
        assert_eq!(controller.state(), SessionState::Running);
        let session = controller.session().expect("adopted session").clone();
        assert_eq!(
            session.remote_path.as_deref(),
            Some("/data/misc/perfetto-traces/old.pftrace")
        );

        let again = controller.start(&mut names).expect("start again");
        assert_eq!(again, StartOutcome::AlreadyRunning { pid: 777 });
        assert_eq!(controller.session(), Some(&session));
        assert!(!fx
            .channel
            .calls_for(SERIAL)
            .iter()
            .any(|call| call.contains("--background")));
    }

    #[test]
    fn unparsable_launch_output_is_protocol_error() {
        let fx = fixture();
        fx.channel
            .script_launch(SERIAL, "Could not connect to traced\n", Some(1), false);
        let mut names = TraceNameGenerator::new("pftrace");
        let mut controller = PerfettoController::new(&fx.channel, SERIAL, &fx.config, "trace-x");
        let err = controller.start(&mut names).expect_err("no pid");
        assert!(err.is_protocol());
        assert_eq!(err.trace_id, "trace-x");
        assert_eq!(controller.state(), SessionState::Unknown);
        assert!(controller.session().is_none());
    }

    #[test]
    fn nonzero_exit_with_pid_is_still_a_failure() {
        let fx = fixture();
        fx.channel.script_launch(SERIAL, "4821\n", Some(1), false);
        let mut names = TraceNameGenerator::new("pftrace");
        let mut controller = PerfettoController::new(&fx.channel, SERIAL, &fx.config, "t");
        let err = controller.start(&mut names).expect_err("exit failure");
        assert!(err.is_protocol());
        assert!(controller.session().is_none());
    }

    #[test]
    fn unreadable_trace_config_is_config_error() {
        let mut fx = fixture();
        fx.config.trace_config_path = "/this/path/should/not/exist.pbtxt".to_string();
        let mut names = TraceNameGenerator::new("pftrace");
        let mut controller = PerfettoController::new(&fx.channel, SERIAL, &fx.config, "t");
        let err = controller.start(&mut names).expect_err("config");
        assert!(err.is_config());
        assert_eq!(controller.state(), SessionState::NotRunning);
        assert!(fx.channel.stdin_seen(SERIAL).is_none());
    }

    #[test]
    fn stop_when_not_running_is_noop() {
        let fx = fixture();
        let mut controller = PerfettoController::new(&fx.channel, SERIAL, &fx.config, "t");
        assert_eq!(controller.state(), SessionState::Unknown);
        assert_eq!(controller.stop().expect("stop"), StopOutcome::NotRunning);
        assert_eq!(controller.state(), SessionState::NotRunning);
        assert!(!fx.channel.calls_for(SERIAL).iter().any(|c| c.starts_with("kill")));
    }

    #[test]
    fn stop_signals_every_pid() {
        let fx = fixture();
        fx.channel
            .add_running(SERIAL, &[100, 101], "/data/misc/perfetto-traces/a.pftrace");
        let mut controller = PerfettoController::new(&fx.channel, SERIAL, &fx.config, "t");
        let outcome = controller.stop().expect("stop");
        assert_eq!(
            outcome,
            StopOutcome::Stopped {
                pids: vec![100, 101],
                polls: 1
            }
        );
        assert!(fx.channel.calls_for(SERIAL).contains(&"kill -TERM 100 101".to_string()));
    }

    #[test]
    fn stop_bound_exceeded_is_reported() {
        let fx = fixture();
        fx.channel.set_exit_after_kill(1_000);
        fx.channel
            .add_running(SERIAL, &[4821], "/data/misc/perfetto-traces/a.pftrace");
        let mut controller = PerfettoController::new(&fx.channel, SERIAL, &fx.config, "t");
        let err = controller
            .stop_within(Some(Duration::from_millis(1_200)))
            .expect_err("still running");
        assert!(err.is_protocol());
        assert_eq!(controller.state(), SessionState::Unknown);
    }

    #[test]
    fn stop_on_unreachable_device_is_channel_error() {
        let fx = fixture();
        fx.channel.set_unreachable(SERIAL, true);
        let mut controller = PerfettoController::new(&fx.channel, SERIAL, &fx.config, "t");
        let err = controller.stop().expect_err("unknown");
        assert!(err.is_channel());
        assert_eq!(controller.state(), SessionState::Unknown);
    }

    #[test]
    fn stop_then_start_sees_no_stale_pid() {
        let fx = fixture();
        fx.channel
            .add_running(SERIAL, &[500], "/data/misc/perfetto-traces/a.pftrace");
        fx.channel.set_next_pid(900);
        let mut names = TraceNameGenerator::new("pftrace");
        let mut controller = PerfettoController::new(&fx.channel, SERIAL, &fx.config, "t");

        controller.stop().expect("stop");
        let outcome = controller.start(&mut names).expect("start");
        match outcome {
            StartOutcome::Started(session) => assert_eq!(session.pid, 900),
            other => panic!("expected Started, got {other:?}"),
        }
        let calls = fx.channel.calls_for(SERIAL);
        let launch = calls
            .iter()
            .position(|call| call.contains("--background"))
            .expect("launch");
        assert_eq!(calls[launch - 1], "pidof perfetto");
    }

    #[test]
    fn collect_uses_serial_dir() {
        let fx = fixture();
        fx.channel.add_file(
            SERIAL,
            "/data/misc/perfetto-traces/2024-05-01-10-00-00-a1b2c3.pftrace",
            b"trace",
        );
        let controller = PerfettoController::new(&fx.channel, SERIAL, &fx.config, "t");
        let report = controller.collect().expect("collect");
        assert_eq!(
            report.pulled[0].local_path,
            Path::new(&fx.config.output_dir)
                .join(SERIAL)
                .join("2024-05-01-10-00-00-a1b2c3.pftrace")
        );
    }
}
