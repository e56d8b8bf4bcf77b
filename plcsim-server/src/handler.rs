//! Control surface - the commands external callers issue against the plant.

use crate::error::ServerError;
use crate::sequencer::{SequenceKind, Sequencer, TriggerOutcome};
use parking_lot::RwLock;
use plcsim_core::device::{BAROMETER_VALUE, PUMP_FREQUENCY, VALVE_GAS_FLOW};
use plcsim_core::{CommandOutcome, Device, DeviceController, DeviceKind, DeviceStatus};
use plcsim_relation::{RelationDocument, RelationGraph, RelationStore};
use plcsim_space::Variant;
use serde::Serialize;
use std::sync::Arc;

/// Snapshot of one device for listings.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub device: Device,
    pub status: DeviceStatus,
    /// Gas flow, pump frequency or pressure reading, depending on the kind.
    pub value: Option<f64>,
}

/// Handles device, sequence and relation commands.
pub struct ControlSurface {
    controller: Arc<DeviceController>,
    sequencer: Arc<Sequencer>,
    relations: Arc<RwLock<RelationGraph>>,
    store: RelationStore,
}

impl ControlSurface {
    pub fn new(
        controller: Arc<DeviceController>,
        sequencer: Arc<Sequencer>,
        relations: Arc<RwLock<RelationGraph>>,
        store: RelationStore,
    ) -> Self {
        Self {
            controller,
            sequencer,
            relations,
            store,
        }
    }

    /// Resolves a browse name or a `ns=..;i=..` node id.
    pub fn resolve_device(&self, name_or_id: &str) -> Result<Device, ServerError> {
        Ok(self.controller.registry().lookup(name_or_id)?)
    }

    pub fn start_device(
        &self,
        device: &str,
        param: &Variant,
    ) -> Result<CommandOutcome, ServerError> {
        let device = self.resolve_device(device)?;
        Ok(self.controller.start_device(&device, param)?)
    }

    pub fn stop_device(&self, device: &str) -> Result<CommandOutcome, ServerError> {
        let device = self.resolve_device(device)?;
        Ok(self.controller.stop_device(&device)?)
    }

    pub fn device_status(&self, device: &str) -> Result<DeviceStatus, ServerError> {
        let device = self.resolve_device(device)?;
        Ok(self.controller.status(&device)?)
    }

    /// Lists every device with its status, ordered by id.
    pub fn list_devices(&self) -> Result<Vec<DeviceSummary>, ServerError> {
        let space = self.controller.space();
        self.controller
            .registry()
            .all()
            .into_iter()
            .map(|device| -> Result<DeviceSummary, ServerError> {
                let status = self.controller.status(&device)?;
                let attribute = match device.kind {
                    DeviceKind::Valve => VALVE_GAS_FLOW,
                    DeviceKind::VacuumPump => PUMP_FREQUENCY,
                    DeviceKind::Barometer => BAROMETER_VALUE,
                };
                let value = space.get_attribute(&device.id, attribute)?.as_f64();
                Ok(DeviceSummary {
                    device,
                    status,
                    value,
                })
            })
            .collect()
    }

    /// Starts a sequence in the background. Returns whether it was started.
    pub fn trigger_sequence(
        &self,
        kind: SequenceKind,
        threshold: f64,
    ) -> Result<bool, ServerError> {
        let outcome = self.sequencer.trigger(kind, threshold)?;
        if let TriggerOutcome::AlreadySatisfied { reading } = outcome {
            tracing::info!("{} skipped, reading {} already past {}", kind, reading, threshold);
        }
        Ok(outcome.started())
    }

    /// Adds a parent -> child relation and persists the relation file.
    ///
    /// Returns false if the relation already existed. The sequence guard is
    /// held for the whole update, so no sequence runs while the graph changes.
    pub fn add_relation(&self, parent: &str, child: &str) -> Result<bool, ServerError> {
        let parent = self.resolve_device(parent)?;
        let child = self.resolve_device(child)?;

        let _lease = self.sequencer.guard().try_acquire().ok_or_else(|| {
            ServerError::InvalidRequest(
                "relations cannot change while a sequence is running".to_string(),
            )
        })?;
        let mut graph = self.relations.write();
        let mut next = graph.clone();
        let added = next.add_edge(
            (parent.id, parent.browse_name.as_str()),
            (child.id, child.browse_name.as_str()),
        )?;
        if added {
            self.store.save(&next)?;
            *graph = next;
            tracing::info!("Added relation {} -> {}", parent, child);
        }
        Ok(added)
    }

    /// Returns the current relations.
    pub fn relations(&self) -> RelationDocument {
        self.relations.read().to_document()
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }
}
