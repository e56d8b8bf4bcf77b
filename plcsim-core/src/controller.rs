//! Device command engine - start/stop state machines with timed transitions.
//!
//! Status changes to a transient state (OPENING/CLOSING) are written
//! synchronously by the command; settling to the final state happens on a
//! spawned task after the settle time. Barometer read-outs run as spawned
//! loops that replay a canned series into the reading attribute, one value
//! per tick, until cancelled.
//!
//! Commands on one device are serialized: the status check, the status write
//! and any read-out swap happen under a per-device lock. The lock is
//! reentrant, so a command issued from within an address-space callback on
//! the same thread does not deadlock.
//!
//! Commands spawn tasks and must be issued from within a tokio runtime.

use crate::device::{
    Device, DeviceKind, DeviceStatus, BAROMETER_VALUE, PUMP_FREQUENCY, VALVE_GAS_FLOW,
};
use crate::error::CoreError;
use crate::registry::DeviceRegistry;
use crate::series::SeriesCatalog;
use crate::DEFAULT_VALVE_SETTLE_TICKS;
use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use plcsim_space::{AddressSpace, NodeId, Variant};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Controller timing configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Length of one time unit.
    pub tick: Duration,
    /// Ticks a valve spends in OPENING/CLOSING.
    pub valve_settle_ticks: u32,
}

impl ControllerConfig {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            valve_settle_ticks: DEFAULT_VALVE_SETTLE_TICKS,
        }
    }

    pub fn with_valve_settle_ticks(mut self, ticks: u32) -> Self {
        self.valve_settle_ticks = ticks;
        self
    }

    /// Returns the valve settle duration.
    pub fn settle_time(&self) -> Duration {
        self.tick * self.valve_settle_ticks
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Result of a start/stop command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Whether the command changed the device status.
    pub applied: bool,
    /// Human-readable confirmation.
    pub message: String,
}

impl CommandOutcome {
    fn applied(message: impl Into<String>) -> Self {
        Self {
            applied: true,
            message: message.into(),
        }
    }

    fn unchanged(message: impl Into<String>) -> Self {
        Self {
            applied: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Start/stop commands addressed by device id.
///
/// This is the control surface shared by external callers and cascading.
pub trait DeviceCommands: Send + Sync {
    fn start(&self, device: &NodeId, param: &Variant) -> Result<CommandOutcome, CoreError>;
    fn stop(&self, device: &NodeId) -> Result<CommandOutcome, CoreError>;
}

/// Cancellation handle shared between a barometer and its read-out loop.
#[derive(Debug)]
struct Readout {
    series: String,
    cancelled: AtomicBool,
    notify: Notify,
}

impl Readout {
    fn new(series: &str) -> Self {
        Self {
            series: series.to_string(),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

type DeviceLocks = DashMap<NodeId, Arc<ReentrantMutex<()>>>;

fn device_lock(locks: &DeviceLocks, id: &NodeId) -> Arc<ReentrantMutex<()>> {
    Arc::clone(
        locks
            .entry(*id)
            .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
            .value(),
    )
}

/// Executes device commands against the address space.
pub struct DeviceController {
    space: Arc<dyn AddressSpace>,
    registry: Arc<DeviceRegistry>,
    series: Arc<SeriesCatalog>,
    config: ControllerConfig,
    /// Active read-out per barometer. At most one live loop per device.
    readouts: Arc<DashMap<NodeId, Arc<Readout>>>,
    /// Per-device command locks, shared with settle tasks.
    locks: Arc<DeviceLocks>,
}

impl DeviceController {
    pub fn new(
        space: Arc<dyn AddressSpace>,
        registry: Arc<DeviceRegistry>,
        series: Arc<SeriesCatalog>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            space,
            registry,
            series,
            config,
            readouts: Arc::new(DashMap::new()),
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Reads the current status of a device.
    pub fn status(&self, device: &Device) -> Result<DeviceStatus, CoreError> {
        let value = self
            .space
            .get_attribute(&device.id, device.status_attribute())?;
        DeviceStatus::from_variant(&value).ok_or_else(|| CoreError::InvalidStatus {
            device: device.to_string(),
            value: value.to_string(),
        })
    }

    /// Reads the current pressure of a barometer.
    pub fn reading(&self, barometer: &Device) -> Result<f64, CoreError> {
        let value = self.space.get_attribute(&barometer.id, BAROMETER_VALUE)?;
        value.as_f64().ok_or_else(|| CoreError::InvalidStatus {
            device: barometer.to_string(),
            value: value.to_string(),
        })
    }

    /// Returns the series id of the active read-out, if any.
    pub fn active_readout(&self, barometer: &NodeId) -> Option<String> {
        self.readouts.get(barometer).map(|r| r.series.clone())
    }

    /// Starts a device. `param` is the gas flow (valve), frequency (pump) or series id (barometer).
    pub fn start_device(
        &self,
        device: &Device,
        param: &Variant,
    ) -> Result<CommandOutcome, CoreError> {
        let lock = device_lock(&self.locks, &device.id);
        let outcome = {
            let _guard = lock.lock();
            match device.kind {
                DeviceKind::Valve => self.start_valve(device, numeric_param(device, param)?),
                DeviceKind::VacuumPump => self.start_pump(device, numeric_param(device, param)?),
                DeviceKind::Barometer => self.start_barometer(device, series_param(device, param)?),
            }
        }?;

        if outcome.applied {
            tracing::info!("{}: {}", device.browse_name, outcome.message);
        } else {
            tracing::debug!("{}: {}", device.browse_name, outcome.message);
        }
        Ok(outcome)
    }

    /// Stops a device.
    pub fn stop_device(&self, device: &Device) -> Result<CommandOutcome, CoreError> {
        let lock = device_lock(&self.locks, &device.id);
        let outcome = {
            let _guard = lock.lock();
            match device.kind {
                DeviceKind::Valve => self.stop_valve(device),
                DeviceKind::VacuumPump => self.stop_pump(device),
                DeviceKind::Barometer => self.stop_barometer(device),
            }
        }?;

        if outcome.applied {
            tracing::info!("{}: {}", device.browse_name, outcome.message);
        } else {
            tracing::debug!("{}: {}", device.browse_name, outcome.message);
        }
        Ok(outcome)
    }

    /// Stops a barometer and starts it again on `series` as one command.
    ///
    /// No other command on the barometer can run between the stop and the
    /// start, so the new read-out always replays `series`.
    pub fn restart_barometer(
        &self,
        barometer: &Device,
        series: &str,
    ) -> Result<CommandOutcome, CoreError> {
        if barometer.kind != DeviceKind::Barometer {
            return Err(CoreError::InvalidParameter {
                device: barometer.to_string(),
                reason: format!("{} is not a barometer", barometer.kind),
            });
        }
        self.series.get(series)?;

        let lock = device_lock(&self.locks, &barometer.id);
        let outcome = {
            let _guard = lock.lock();
            self.stop_barometer(barometer)?;
            self.start_barometer(barometer, series)?
        };
        tracing::info!("{}: {}", barometer.browse_name, outcome.message);
        Ok(outcome)
    }

    fn start_valve(&self, device: &Device, flow: f64) -> Result<CommandOutcome, CoreError> {
        match self.status(device)? {
            DeviceStatus::Closed => {
                self.write_status(device, DeviceStatus::Opening)?;
                self.schedule_settle(device, DeviceStatus::Opening, DeviceStatus::Open);
                self.space
                    .set_attribute(&device.id, VALVE_GAS_FLOW, Variant::Float(flow))?;
                Ok(CommandOutcome::applied(format!(
                    "The valve opens and sets the gas flow rate to {flow} L/min"
                )))
            }
            DeviceStatus::Open | DeviceStatus::Opening => {
                Ok(CommandOutcome::unchanged("The valve is already open"))
            }
            DeviceStatus::Closing => Ok(CommandOutcome::unchanged(
                "The valve is still closing; start ignored",
            )),
        }
    }

    fn stop_valve(&self, device: &Device) -> Result<CommandOutcome, CoreError> {
        match self.status(device)? {
            DeviceStatus::Open => {
                self.write_status(device, DeviceStatus::Closing)?;
                self.schedule_settle(device, DeviceStatus::Closing, DeviceStatus::Closed);
                self.space
                    .set_attribute(&device.id, VALVE_GAS_FLOW, Variant::Float(0.0))?;
                Ok(CommandOutcome::applied(
                    "The valve closes and sets the gas flow rate to 0 L/min",
                ))
            }
            DeviceStatus::Closed | DeviceStatus::Closing => {
                Ok(CommandOutcome::unchanged("The valve is already closed"))
            }
            DeviceStatus::Opening => Ok(CommandOutcome::unchanged(
                "The valve is still opening; stop ignored",
            )),
        }
    }

    fn start_pump(&self, device: &Device, speed: f64) -> Result<CommandOutcome, CoreError> {
        match self.status(device)? {
            DeviceStatus::Closed => {
                self.write_status(device, DeviceStatus::Open)?;
                self.space
                    .set_attribute(&device.id, PUMP_FREQUENCY, Variant::Float(speed))?;
                Ok(CommandOutcome::applied(format!(
                    "The vacuum pump starts at frequency {speed}"
                )))
            }
            _ => Ok(CommandOutcome::unchanged("The vacuum pump is already open")),
        }
    }

    fn stop_pump(&self, device: &Device) -> Result<CommandOutcome, CoreError> {
        match self.status(device)? {
            DeviceStatus::Open => {
                self.write_status(device, DeviceStatus::Closed)?;
                self.space
                    .set_attribute(&device.id, PUMP_FREQUENCY, Variant::Float(0.0))?;
                Ok(CommandOutcome::applied("The vacuum pump stops"))
            }
            _ => Ok(CommandOutcome::unchanged("The vacuum pump is already closed")),
        }
    }

    fn start_barometer(&self, device: &Device, series: &str) -> Result<CommandOutcome, CoreError> {
        match self.status(device)? {
            DeviceStatus::Closed => {
                let values = self.series.get(series)?;
                self.write_status(device, DeviceStatus::Open)?;
                self.spawn_readout(device, series, values);
                Ok(CommandOutcome::applied(format!(
                    "The barometer opens and replays series '{series}'"
                )))
            }
            _ => Ok(CommandOutcome::unchanged("The barometer is already open")),
        }
    }

    fn stop_barometer(&self, device: &Device) -> Result<CommandOutcome, CoreError> {
        let status = self.status(device)?;
        // Only the loop current at this point is cancelled. A start issued
        // while the CLOSED write is being published owns the loop it spawns.
        let current = self
            .readouts
            .get(&device.id)
            .map(|entry| Arc::clone(entry.value()));
        if status == DeviceStatus::Open {
            self.write_status(device, DeviceStatus::Closed)?;
        }

        if let Some(readout) = current {
            self.readouts
                .remove_if(&device.id, |_, active| Arc::ptr_eq(active, &readout));
            readout.cancel();
            tracing::debug!(
                "{}: cancelled read-out of series '{}'",
                device.browse_name,
                readout.series
            );
        }

        if status == DeviceStatus::Open {
            Ok(CommandOutcome::applied("The barometer closes"))
        } else {
            Ok(CommandOutcome::unchanged("The barometer is already closed"))
        }
    }

    fn write_status(&self, device: &Device, status: DeviceStatus) -> Result<(), CoreError> {
        tracing::debug!("{}: status -> {}", device.browse_name, status);
        self.space
            .set_attribute(&device.id, device.status_attribute(), status.to_variant())?;
        Ok(())
    }

    /// Commits `target` after the settle time if the device is still in `transient`.
    fn schedule_settle(&self, device: &Device, transient: DeviceStatus, target: DeviceStatus) {
        let space = Arc::clone(&self.space);
        let locks = Arc::clone(&self.locks);
        let device = device.clone();
        let settle = self.config.settle_time();

        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            commit_settle(space.as_ref(), &locks, &device, transient, target);
        });
    }

    /// Starts a read-out loop, cancelling any loop already running for the device.
    fn spawn_readout(&self, device: &Device, series: &str, values: Arc<[f64]>) {
        let readout = Arc::new(Readout::new(series));
        if let Some(previous) = self.readouts.insert(device.id, Arc::clone(&readout)) {
            previous.cancel();
        }

        let space = Arc::clone(&self.space);
        let readouts = Arc::clone(&self.readouts);
        let tick = self.config.tick;
        let device = device.clone();

        tokio::spawn(async move {
            for value in values.iter() {
                if readout.is_cancelled() {
                    break;
                }
                if let Err(e) =
                    space.set_attribute(&device.id, BAROMETER_VALUE, Variant::Float(*value))
                {
                    tracing::warn!("{}: read-out stopped: {}", device.browse_name, e);
                    break;
                }

                tokio::select! {
                    _ = readout.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }
            }

            readouts.remove_if(&device.id, |_, current| Arc::ptr_eq(current, &readout));
            tracing::debug!(
                "{}: read-out of series '{}' finished",
                device.browse_name,
                readout.series
            );
        });
    }
}

impl DeviceCommands for DeviceController {
    fn start(&self, device: &NodeId, param: &Variant) -> Result<CommandOutcome, CoreError> {
        let device = self.registry.get(device)?;
        self.start_device(&device, param)
    }

    fn stop(&self, device: &NodeId) -> Result<CommandOutcome, CoreError> {
        let device = self.registry.get(device)?;
        self.stop_device(&device)
    }
}

/// Writes `target` if the device is still in `transient`.
fn commit_settle(
    space: &dyn AddressSpace,
    locks: &DeviceLocks,
    device: &Device,
    transient: DeviceStatus,
    target: DeviceStatus,
) {
    let lock = device_lock(locks, &device.id);
    let _guard = lock.lock();

    let current = space
        .get_attribute(&device.id, device.status_attribute())
        .map(|v| DeviceStatus::from_variant(&v));
    match current {
        Ok(Some(status)) if status == transient => {
            if let Err(e) =
                space.set_attribute(&device.id, device.status_attribute(), target.to_variant())
            {
                tracing::warn!("{}: failed to settle to {}: {}", device.browse_name, target, e);
            } else {
                tracing::debug!("{}: status -> {}", device.browse_name, target);
            }
        }
        Ok(status) => {
            tracing::debug!(
                "{}: settle to {} skipped, status is now {:?}",
                device.browse_name,
                target,
                status
            );
        }
        Err(e) => {
            tracing::warn!("{}: settle to {} failed: {}", device.browse_name, target, e);
        }
    }
}

fn series_param<'a>(device: &Device, param: &'a Variant) -> Result<&'a str, CoreError> {
    param.as_str().ok_or_else(|| CoreError::InvalidParameter {
        device: device.to_string(),
        reason: format!("expected a series id, got {}", param.type_name()),
    })
}

fn numeric_param(device: &Device, param: &Variant) -> Result<f64, CoreError> {
    let value = param.as_f64().ok_or_else(|| CoreError::InvalidParameter {
        device: device.to_string(),
        reason: format!("expected a number, got {}", param.type_name()),
    })?;
    if !value.is_finite() || value < 0.0 {
        return Err(CoreError::InvalidParameter {
            device: device.to_string(),
            reason: format!("{value} is not a valid rate"),
        });
    }
    Ok(value)
}
