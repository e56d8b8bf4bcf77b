//! Evacuate/intake orchestration.
//!
//! A sequence drives the plant to a pressure threshold: close every valve and
//! pump, open the mode's valve and pump, restart the barometer, poll the
//! reading until it crosses the threshold, then close what was opened.
//!
//! At most one sequence runs at a time. The [`SequenceGuard`] is acquired with
//! a compare-and-set and released when the [`SequenceLease`] is dropped, on
//! success, failure or cancellation alike.

use crate::config::{SequenceProfile, SequencerConfig};
use crate::error::ServerError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use plcsim_core::{Device, DeviceController, DeviceKind, DeviceStatus};
use plcsim_space::Variant;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Which way a sequence drives the pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceKind {
    /// Pump down until the reading is below the threshold.
    Evacuate,
    /// Let gas in until the reading is above the threshold.
    Intake,
}

impl SequenceKind {
    /// Whether `reading` has crossed `threshold` for this kind.
    pub fn is_satisfied(&self, reading: f64, threshold: f64) -> bool {
        match self {
            SequenceKind::Evacuate => reading < threshold,
            SequenceKind::Intake => reading > threshold,
        }
    }
}

impl fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceKind::Evacuate => f.write_str("evacuate"),
            SequenceKind::Intake => f.write_str("intake"),
        }
    }
}

impl FromStr for SequenceKind {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "evacuate" => Ok(SequenceKind::Evacuate),
            "intake" => Ok(SequenceKind::Intake),
            other => Err(ServerError::InvalidRequest(format!(
                "unknown sequence '{}'",
                other
            ))),
        }
    }
}

/// Single-flight guard shared by all sequences.
#[derive(Debug, Default)]
pub struct SequenceGuard {
    held: AtomicBool,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the guard, or returns None if a sequence already holds it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SequenceLease> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SequenceLease {
                guard: Arc::clone(self),
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Ownership of the [`SequenceGuard`]. Dropping it releases the guard.
#[derive(Debug)]
pub struct SequenceLease {
    guard: Arc<SequenceGuard>,
}

impl Drop for SequenceLease {
    fn drop(&mut self) {
        self.guard.held.store(false, Ordering::Release);
    }
}

/// Summary of a completed sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceReport {
    pub kind: SequenceKind,
    pub threshold: f64,
    /// Sensor samples taken while waiting for the threshold.
    pub samples: usize,
    pub final_reading: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SequenceReport {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Result of triggering a sequence in the background.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// The sequence was started.
    Started,
    /// Another sequence holds the guard.
    AlreadyRunning,
    /// The reading already satisfies the threshold; nothing was touched.
    AlreadySatisfied { reading: f64 },
}

impl TriggerOutcome {
    pub fn started(&self) -> bool {
        matches!(self, TriggerOutcome::Started)
    }
}

/// Result of running a sequence to completion.
#[derive(Debug, Clone)]
pub enum SequenceOutcome {
    Completed(SequenceReport),
    AlreadyRunning,
    AlreadySatisfied { reading: f64 },
}

/// Devices a sequence acts on.
struct Targets {
    valve: Device,
    pump: Device,
    barometer: Device,
    series: String,
    stop_barometer: bool,
}

enum Prepared {
    Ready(SequenceLease, Targets),
    AlreadyRunning,
    AlreadySatisfied(f64),
}

/// Runs evacuate and intake sequences.
pub struct Sequencer {
    controller: Arc<DeviceController>,
    config: SequencerConfig,
    guard: Arc<SequenceGuard>,
    current: Mutex<Option<JoinHandle<Result<SequenceOutcome, ServerError>>>>,
}

impl Sequencer {
    pub fn new(controller: Arc<DeviceController>, config: SequencerConfig) -> Self {
        Self {
            controller,
            config,
            guard: Arc::new(SequenceGuard::new()),
            current: Mutex::new(None),
        }
    }

    pub fn guard(&self) -> &Arc<SequenceGuard> {
        &self.guard
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Returns whether a sequence currently holds the guard.
    pub fn is_running(&self) -> bool {
        self.guard.is_held()
    }

    /// Starts a sequence in the background.
    ///
    /// The guard and the precondition are checked before returning; the
    /// actuator steps run on a spawned task. Use [`Sequencer::wait`] to
    /// collect its result.
    pub fn trigger(
        self: &Arc<Self>,
        kind: SequenceKind,
        threshold: f64,
    ) -> Result<TriggerOutcome, ServerError> {
        match self.prepare(kind, threshold)? {
            Prepared::AlreadyRunning => Ok(TriggerOutcome::AlreadyRunning),
            Prepared::AlreadySatisfied(reading) => {
                Ok(TriggerOutcome::AlreadySatisfied { reading })
            }
            Prepared::Ready(lease, targets) => {
                let sequencer = Arc::clone(self);
                let task = tokio::spawn(async move {
                    sequencer
                        .execute(lease, targets, kind, threshold)
                        .await
                        .map(SequenceOutcome::Completed)
                });
                *self.current.lock() = Some(task);
                Ok(TriggerOutcome::Started)
            }
        }
    }

    /// Waits for the most recently triggered sequence.
    ///
    /// Returns None if nothing was triggered since the last wait.
    pub async fn wait(&self) -> Option<Result<SequenceOutcome, ServerError>> {
        let task = self.current.lock().take()?;
        Some(match task.await {
            Ok(result) => result,
            Err(e) => Err(ServerError::TaskFailed(e.to_string())),
        })
    }

    /// Runs a sequence to completion on the current task.
    pub async fn run(
        &self,
        kind: SequenceKind,
        threshold: f64,
    ) -> Result<SequenceOutcome, ServerError> {
        match self.prepare(kind, threshold)? {
            Prepared::AlreadyRunning => Ok(SequenceOutcome::AlreadyRunning),
            Prepared::AlreadySatisfied(reading) => {
                Ok(SequenceOutcome::AlreadySatisfied { reading })
            }
            Prepared::Ready(lease, targets) => self
                .execute(lease, targets, kind, threshold)
                .await
                .map(SequenceOutcome::Completed),
        }
    }

    fn profile(&self, kind: SequenceKind) -> &SequenceProfile {
        match kind {
            SequenceKind::Evacuate => &self.config.evacuate,
            SequenceKind::Intake => &self.config.intake,
        }
    }

    fn prepare(&self, kind: SequenceKind, threshold: f64) -> Result<Prepared, ServerError> {
        if !threshold.is_finite() {
            return Err(ServerError::InvalidRequest(format!(
                "threshold {} is not a number",
                threshold
            )));
        }

        let Some(lease) = self.guard.try_acquire() else {
            tracing::info!("{} not started: a sequence is already running", kind);
            return Ok(Prepared::AlreadyRunning);
        };

        // The lease is released by drop on every early return below.
        let targets = self.resolve_targets(kind)?;
        let reading = self.controller.reading(&targets.barometer)?;
        if kind.is_satisfied(reading, threshold) {
            tracing::info!(
                "{} not needed: {} reads {} (threshold {})",
                kind,
                targets.barometer.browse_name,
                reading,
                threshold
            );
            return Ok(Prepared::AlreadySatisfied(reading));
        }

        Ok(Prepared::Ready(lease, targets))
    }

    fn resolve_targets(&self, kind: SequenceKind) -> Result<Targets, ServerError> {
        let profile = self.profile(kind);
        Ok(Targets {
            valve: self.resolve(&profile.valve, DeviceKind::Valve)?,
            pump: self.resolve(&profile.pump, DeviceKind::VacuumPump)?,
            barometer: self.resolve(&profile.barometer, DeviceKind::Barometer)?,
            series: profile.series.clone(),
            stop_barometer: profile.stop_barometer,
        })
    }

    fn resolve(&self, name: &str, kind: DeviceKind) -> Result<Device, ServerError> {
        let device = self.controller.registry().by_name(name)?;
        if device.kind != kind {
            return Err(ServerError::InvalidRequest(format!(
                "{} is a {}, expected a {}",
                device, device.kind, kind
            )));
        }
        Ok(device)
    }

    async fn execute(
        &self,
        lease: SequenceLease,
        targets: Targets,
        kind: SequenceKind,
        threshold: f64,
    ) -> Result<SequenceReport, ServerError> {
        let started_at = Utc::now();
        tracing::info!(
            "Starting {} sequence: {} + {}, threshold {}",
            kind,
            targets.valve.browse_name,
            targets.pump.browse_name,
            threshold
        );

        let result = self.drive(&targets, kind, threshold).await;
        let report = match result {
            Ok((samples, final_reading)) => {
                let report = SequenceReport {
                    kind,
                    threshold,
                    samples,
                    final_reading,
                    started_at,
                    finished_at: Utc::now(),
                };
                tracing::info!(
                    "{} sequence completed: reading {} after {} samples",
                    kind,
                    final_reading,
                    samples
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!("{} sequence failed: {}", kind, e);
                self.abort_actuators(&targets);
                Err(e)
            }
        };

        drop(lease);
        report
    }

    /// Runs the actuator steps. Returns (samples, final reading).
    async fn drive(
        &self,
        targets: &Targets,
        kind: SequenceKind,
        threshold: f64,
    ) -> Result<(usize, f64), ServerError> {
        let controller = &self.controller;
        let poll = self.config.poll_interval();

        self.baseline().await?;

        tracing::info!("{}: opening {}", kind, targets.valve.browse_name);
        controller.start_device(&targets.valve, &Variant::Float(self.config.nominal_flow))?;
        wait_until(
            &format!("{} to open", targets.valve.browse_name),
            self.config.settle_timeout(),
            poll,
            || Ok(controller.status(&targets.valve)? == DeviceStatus::Open),
        )
        .await?;

        tracing::info!("{}: starting {}", kind, targets.pump.browse_name);
        controller.start_device(&targets.pump, &Variant::Float(self.config.pump_speed))?;

        tracing::info!(
            "{}: restarting {} with series '{}'",
            kind,
            targets.barometer.browse_name,
            targets.series
        );
        controller.restart_barometer(&targets.barometer, &targets.series)?;

        let mut samples = 0;
        let mut last = f64::NAN;
        wait_until(
            &format!("{} to cross {}", targets.barometer.browse_name, threshold),
            self.config.sensor_timeout(),
            poll,
            || {
                let reading = controller.reading(&targets.barometer)?;
                samples += 1;
                last = reading;
                tracing::info!("{}: {} reads {}", kind, targets.barometer.browse_name, reading);
                Ok(kind.is_satisfied(reading, threshold))
            },
        )
        .await?;

        tracing::info!("{}: closing {}", kind, targets.valve.browse_name);
        controller.stop_device(&targets.valve)?;
        wait_until(
            &format!("{} to close", targets.valve.browse_name),
            self.config.settle_timeout(),
            poll,
            || Ok(controller.status(&targets.valve)? == DeviceStatus::Closed),
        )
        .await?;

        controller.stop_device(&targets.pump)?;
        if targets.stop_barometer {
            controller.stop_device(&targets.barometer)?;
        }

        Ok((samples, last))
    }

    /// Brings every valve and pump to CLOSED.
    async fn baseline(&self) -> Result<(), ServerError> {
        let controller = &self.controller;
        let poll = self.config.poll_interval();
        let valves = controller.registry().of_kind(DeviceKind::Valve);
        let pumps = controller.registry().of_kind(DeviceKind::VacuumPump);

        tracing::info!("Baseline: closing {} valves", valves.len());
        for valve in &valves {
            controller.stop_device(valve)?;
        }
        // A valve that was still opening ignores the first stop; stop it again
        // once it reports OPEN.
        wait_until("valves to close", self.config.baseline_timeout(), poll, || {
            let mut all_closed = true;
            for valve in &valves {
                match controller.status(valve)? {
                    DeviceStatus::Closed => {}
                    DeviceStatus::Open => {
                        controller.stop_device(valve)?;
                        all_closed = false;
                    }
                    _ => all_closed = false,
                }
            }
            Ok(all_closed)
        })
        .await?;

        tracing::info!("Baseline: stopping {} pumps", pumps.len());
        for pump in &pumps {
            controller.stop_device(pump)?;
        }
        wait_until("pumps to stop", self.config.baseline_timeout(), poll, || {
            for pump in &pumps {
                if controller.status(pump)? != DeviceStatus::Closed {
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await
    }

    /// Best-effort close of the sequence's valve and pump after a failure.
    fn abort_actuators(&self, targets: &Targets) {
        for device in [&targets.valve, &targets.pump] {
            if let Err(e) = self.controller.stop_device(device) {
                tracing::warn!("Failed to stop {} after aborted sequence: {}", device, e);
            }
        }
    }
}

/// Polls `check` until it returns true or `timeout` elapses.
async fn wait_until<F>(
    what: &str,
    timeout: Duration,
    poll: Duration,
    mut check: F,
) -> Result<(), ServerError>
where
    F: FnMut() -> Result<bool, ServerError>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ServerError::Timeout {
                what: what.to_string(),
                waited: timeout,
            });
        }
        tokio::time::sleep(poll).await;
    }
}
