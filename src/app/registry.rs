use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::adb::channel::ShellChannel;
use crate::app::config::FleetConfig;
use crate::app::error::AppError;
use crate::app::models::{CollectReport, StartOutcome, StopOutcome};
use crate::app::perfetto::controller::PerfettoController;
use crate::app::perfetto::filename::TraceNameGenerator;

const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    /// Stop tracing, then pull every trace.
    #[value(alias = "TERMINATE_COLLECT")]
    TerminateCollect,
    /// Stop tracing, pull every trace, then start a fresh session.
    #[value(alias = "TERMINATE_COLLECT_RESTART")]
    TerminateCollectRestart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Stop,
    Collect,
    Start,
}

impl OperatingMode {
    pub fn steps(self) -> &'static [Step] {
        match self {
            OperatingMode::TerminateCollect => &[Step::Stop, Step::Collect],
            OperatingMode::TerminateCollectRestart => &[Step::Stop, Step::Collect, Step::Start],
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::TerminateCollect => write!(f, "TERMINATE_COLLECT"),
            OperatingMode::TerminateCollectRestart => write!(f, "TERMINATE_COLLECT_RESTART"),
        }
    }
}

/// What happened to one device during its pass. `None` means the step was not run.
#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub serial: String,
    pub trace_id: String,
    pub stop: Option<Result<StopOutcome, AppError>>,
    pub collect: Option<Result<CollectReport, AppError>>,
    pub start: Option<Result<StartOutcome, AppError>>,
}

impl DeviceReport {
    pub fn succeeded(&self) -> bool {
        let stop_ok = self.stop.as_ref().map_or(true, |result| result.is_ok());
        let collect_ok = self
            .collect
            .as_ref()
            .map_or(true, |result| result.as_ref().is_ok_and(|report| report.is_clean()));
        let start_ok = self.start.as_ref().map_or(true, |result| result.is_ok());
        stop_ok && collect_ok && start_ok
    }
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub discovered: Vec<String>,
    pub handled: Vec<DeviceReport>,
    pub pruned: Vec<String>,
}

/// Applies the operating mode once to every device per connection episode.
///
/// The handled set belongs to the registry alone; other threads can only ask
/// the monitor loop to stop.
pub struct DeviceRegistry<C: ShellChannel> {
    channel: C,
    config: FleetConfig,
    mode: OperatingMode,
    handled: BTreeSet<String>,
    names: TraceNameGenerator,
}

impl<C: ShellChannel> DeviceRegistry<C> {
    pub fn new(channel: C, config: FleetConfig, mode: OperatingMode) -> Self {
        let names = TraceNameGenerator::new(config.perfetto.trace_extension.clone());
        Self {
            channel,
            config,
            mode,
            handled: BTreeSet::new(),
            names,
        }
    }

    pub fn handled(&self) -> &BTreeSet<String> {
        &self.handled
    }

    /// One discovery pass. A failed discovery leaves the handled set alone:
    /// reachability is unknown, so nothing is pruned.
    pub fn run_cycle(&mut self) -> Result<CycleReport, AppError> {
        let serials = self.channel.discover()?;
        if serials.is_empty() {
            debug!("No device connected");
        } else {
            debug!(devices = %serials.join(", "), "Device(s) connected");
        }

        let mut report = CycleReport {
            discovered: serials.clone(),
            ..CycleReport::default()
        };
        for serial in &serials {
            if self.handled.contains(serial) {
                continue;
            }
            report.handled.push(self.handle_device(serial));
            self.handled.insert(serial.clone());
            info!(serial = %serial, "Device can be disconnected");
        }

        let gone: Vec<String> = self
            .handled
            .iter()
            .filter(|serial| !serials.contains(serial))
            .cloned()
            .collect();
        for serial in gone {
            debug!(serial = %serial, "device is not connected, removing from handled set");
            self.handled.remove(&serial);
            report.pruned.push(serial);
        }
        Ok(report)
    }

    fn handle_device(&mut self, serial: &str) -> DeviceReport {
        let trace_id = Uuid::new_v4().to_string();
        info!(trace_id = %trace_id, serial = %serial, mode = %self.mode, "Handling device");
        let mut controller = PerfettoController::new(&self.channel, serial, &self.config, &trace_id);
        let mut report = DeviceReport {
            serial: serial.to_string(),
            trace_id: trace_id.clone(),
            stop: None,
            collect: None,
            start: None,
        };

        for step in self.mode.steps() {
            match step {
                Step::Stop => {
                    debug!(trace_id = %trace_id, serial = %serial, "terminate perfetto");
                    let result = controller.stop();
                    if let Err(err) = &result {
                        warn!(trace_id = %trace_id, serial = %serial, error = %err, "failed to stop perfetto");
                    }
                    report.stop = Some(result);
                }
                Step::Collect => {
                    if matches!(report.stop, Some(Err(_))) {
                        // A session that may still be writing must keep its trace on the device.
                        warn!(trace_id = %trace_id, serial = %serial, "perfetto may still be running; not collecting traces");
                        continue;
                    }
                    debug!(trace_id = %trace_id, serial = %serial, "collect all trace files");
                    let result = controller.collect();
                    match &result {
                        Ok(collected) if !collected.is_clean() => warn!(
                            trace_id = %trace_id,
                            serial = %serial,
                            pulled = collected.pulled.len(),
                            failed = collected.failed.len(),
                            delete_failed = collected.delete_failed.len(),
                            "trace collection incomplete"
                        ),
                        Ok(collected) => info!(
                            trace_id = %trace_id,
                            serial = %serial,
                            pulled = collected.pulled.len(),
                            "trace collection done"
                        ),
                        Err(err) => warn!(trace_id = %trace_id, serial = %serial, error = %err, "failed to collect traces"),
                    }
                    report.collect = Some(result);
                }
                Step::Start => {
                    if matches!(report.stop, Some(Err(_))) {
                        warn!(trace_id = %trace_id, serial = %serial, "previous session state unknown; not starting perfetto");
                        continue;
                    }
                    debug!(trace_id = %trace_id, serial = %serial, "start perfetto");
                    let result = controller.start(&mut self.names);
                    if let Err(err) = &result {
                        warn!(trace_id = %trace_id, serial = %serial, error = %err, "failed to start perfetto");
                    }
                    report.start = Some(result);
                }
            }
        }
        info!(
            trace_id = %trace_id,
            serial = %serial,
            mode = %self.mode,
            succeeded = report.succeeded(),
            "end of mode"
        );
        report
    }

    /// Polls until `stop_flag` is raised. The flag is checked before every
    /// cycle and while sleeping; a device pass in progress always completes.
    pub fn run(&mut self, stop_flag: &AtomicBool) {
        let interval = Duration::from_millis(self.config.monitor.poll_interval_ms);
        info!(mode = %self.mode, "Start monitoring devices");
        while !stop_flag.load(Ordering::SeqCst) {
            if let Err(err) = self.run_cycle() {
                warn!(error = %err, "device discovery failed");
            }
            sleep_unless_stopped(interval, stop_flag);
        }
        debug!("Stopped monitoring devices");
    }
}

fn sleep_unless_stopped(total: Duration, stop_flag: &AtomicBool) {
    let start = Instant::now();
    while !stop_flag.load(Ordering::SeqCst) {
        let elapsed = start.elapsed();
        if elapsed >= total {
            return;
        }
        thread::sleep(STOP_CHECK_INTERVAL.min(total - elapsed));
    }
}

pub struct MonitorHandle<C: ShellChannel> {
    stop_flag: Arc<AtomicBool>,
    join: JoinHandle<DeviceRegistry<C>>,
}

impl<C: ShellChannel> MonitorHandle<C> {
    /// Raises the stop flag and waits for the loop, including any in-flight device pass.
    pub fn stop(self) -> Result<DeviceRegistry<C>, AppError> {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.join()
    }

    pub fn join(self) -> Result<DeviceRegistry<C>, AppError> {
        self.join
            .join()
            .map_err(|_| AppError::system("Device monitor thread panicked", ""))
    }
}

/// Runs the registry on a background thread until `stop_flag` is raised.
pub fn start_monitoring<C>(mut registry: DeviceRegistry<C>, stop_flag: Arc<AtomicBool>) -> MonitorHandle<C>
where
    C: ShellChannel + Send + 'static,
{
    let stop_thread = Arc::clone(&stop_flag);
    let join = thread::spawn(move || {
        registry.run(&stop_thread);
        registry
    });
    MonitorHandle { stop_flag, join }
}
