//! Simulator runtime - wires the address space, devices, relations,
//! cascading and sequencing together.

use crate::cascade::{CascadeHandler, CascadeParams, CascadeRules};
use crate::config::Config;
use crate::dispatcher::{DataChangeHandler, SubscriptionDispatcher};
use crate::error::ServerError;
use crate::handler::ControlSurface;
use crate::sequencer::Sequencer;
use parking_lot::RwLock;
use plcsim_core::{DeviceCommands, DeviceController, DeviceRegistry, Plant, SeriesCatalog};
use plcsim_relation::{RelationError, RelationGraph, RelationStore};
use plcsim_space::MemorySpace;
use std::sync::Arc;

/// A running plant simulation.
pub struct Simulator {
    config: Config,
    space: Arc<MemorySpace>,
    controller: Arc<DeviceController>,
    relations: Arc<RwLock<RelationGraph>>,
    dispatcher: SubscriptionDispatcher,
    sequencer: Arc<Sequencer>,
    control: ControlSurface,
}

impl Simulator {
    /// Builds the plant and, when the relation file is present, enables cascading.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: Config) -> Result<Self, ServerError> {
        config.validate()?;

        let space = Arc::new(MemorySpace::new(config.dispatcher.channel_capacity));
        let registry = Arc::new(DeviceRegistry::new());
        Plant::provision(
            &space,
            &registry,
            &config.plant.layout,
            config.plant.ambient_pressure,
        )?;

        let series = match &config.plant.series_file {
            Some(path) => SeriesCatalog::with_file(path)?,
            None => SeriesCatalog::builtin(),
        };
        let controller = Arc::new(DeviceController::new(
            space.clone(),
            registry.clone(),
            Arc::new(series),
            config.plant.controller_config(),
        ));

        let store = RelationStore::new(&config.relations.path);
        let (graph, loaded) = match store.load() {
            Ok(graph) => (graph, true),
            Err(RelationError::ConfigurationMissing(path)) => {
                if config.relations.required {
                    return Err(ServerError::ConfigurationMissing(format!(
                        "relation file {}",
                        path.display()
                    )));
                }
                tracing::error!(
                    "Relation file {} not found; cascading is disabled",
                    path.display()
                );
                (RelationGraph::new(), false)
            }
            Err(e) => return Err(e.into()),
        };

        for (parent, child) in graph.edges() {
            for id in [parent, child] {
                if registry.get(&id).is_err() {
                    tracing::warn!("Relation {} -> {} names unknown device {}", parent, child, id);
                }
            }
        }

        let relations = Arc::new(RwLock::new(graph));
        let sequencer = Arc::new(Sequencer::new(
            controller.clone(),
            config.sequencer_config(),
        ));
        let control = ControlSurface::new(
            controller.clone(),
            sequencer.clone(),
            relations.clone(),
            store,
        );
        let dispatcher = SubscriptionDispatcher::new(space.clone());

        let simulator = Self {
            config,
            space,
            controller,
            relations,
            dispatcher,
            sequencer,
            control,
        };

        if loaded && simulator.config.dispatcher.cascade {
            let count = simulator.enable_cascading()?;
            tracing::info!("Cascading enabled ({} subscriptions)", count);
        }

        tracing::info!(
            "Simulator ready: {} devices, tick {:?}",
            simulator.controller.registry().len(),
            simulator.config.plant.tick()
        );
        Ok(simulator)
    }

    /// Subscribes the cascade handler to the status of every device.
    ///
    /// Returns the number of new subscriptions.
    pub fn enable_cascading(&self) -> Result<usize, ServerError> {
        let handler: Arc<dyn DataChangeHandler> = Arc::new(CascadeHandler::new(
            self.relations.clone(),
            self.controller.registry().clone(),
            self.controller.clone() as Arc<dyn DeviceCommands>,
            CascadeRules::standard(),
            CascadeParams::from(&self.config.dispatcher),
        ));

        let mut count = 0;
        for device in self.controller.registry().all() {
            if self
                .dispatcher
                .is_subscribed(&device.id, device.status_attribute())
            {
                continue;
            }
            self.dispatcher
                .subscribe(&device.id, device.status_attribute(), handler.clone())?;
            count += 1;
        }
        Ok(count)
    }

    /// Returns whether status changes currently cascade.
    pub fn cascading_enabled(&self) -> bool {
        self.dispatcher.subscription_count() > 0
    }

    pub fn control(&self) -> &ControlSurface {
        &self.control
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn space(&self) -> &Arc<MemorySpace> {
        &self.space
    }

    pub fn controller(&self) -> &Arc<DeviceController> {
        &self.controller
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    /// Waits for a running sequence, then releases all subscriptions.
    pub async fn shutdown(self) {
        if let Some(Err(e)) = self.sequencer.wait().await {
            tracing::warn!("Sequence ended with error during shutdown: {}", e);
        }
        let released = self.dispatcher.disconnect();
        tracing::info!(
            "Simulator stopped ({} subscriptions released, {} nodes)",
            released,
            self.space.node_count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::SequenceKind;
    use plcsim_core::DeviceStatus;
    use plcsim_space::{NodeId, Variant};
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_relations(dir: &TempDir, pairs: &[(&str, u32, &str, u32)]) -> std::path::PathBuf {
        let path = dir.path().join("relation.json");
        let mut graph = RelationGraph::new();
        for (parent, pid, child, cid) in pairs {
            graph
                .add_edge((NodeId::new(1, *pid), *parent), (NodeId::new(1, *cid), *child))
                .unwrap();
        }
        RelationStore::new(&path).save(&graph).unwrap();
        path
    }

    fn config_with(relations: std::path::PathBuf) -> Config {
        let mut config = Config::default();
        config.relations.path = relations;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_relation_file_disables_cascading() {
        let dir = tempfile::tempdir().unwrap();
        let simulator = Simulator::start(config_with(dir.path().join("missing.json"))).unwrap();
        assert!(!simulator.cascading_enabled());
        assert_eq!(simulator.control().list_devices().unwrap().len(), 5);

        let mut config = config_with(dir.path().join("missing.json"));
        config.relations.required = true;
        assert!(matches!(
            Simulator::start(config),
            Err(ServerError::ConfigurationMissing(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_valve_cascades_to_pump() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_relations(&dir, &[("valve02", 1002, "vacuumpump02", 1004)]);
        let simulator = Simulator::start(config_with(path)).unwrap();
        assert!(simulator.cascading_enabled());

        let control = simulator.control();
        let outcome = control.start_device("valve02", &Variant::Float(2.0)).unwrap();
        assert!(outcome.applied);
        assert_eq!(
            control.device_status("vacuumpump02").unwrap(),
            DeviceStatus::Closed
        );

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(control.device_status("valve02").unwrap(), DeviceStatus::Open);
        assert_eq!(
            control.device_status("vacuumpump02").unwrap(),
            DeviceStatus::Open
        );

        control.stop_device("valve02").unwrap();
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(
            control.device_status("vacuumpump02").unwrap(),
            DeviceStatus::Closed
        );
        assert_eq!(
            control.device_status("valve01").unwrap(),
            DeviceStatus::Closed
        );

        simulator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_relation_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_set/relation.json");
        let simulator = Simulator::start(config_with(path.clone())).unwrap();
        let control = simulator.control();

        assert!(control.add_relation("vacuumpump01", "barometer01").unwrap());
        assert!(!control.add_relation("vacuumpump01", "barometer01").unwrap());
        assert!(matches!(
            control.add_relation("valve01", "barometer01"),
            Err(ServerError::Relation(_))
        ));
        assert!(control.resolve_device("pump99").unwrap_err().is_not_found());

        let graph = RelationStore::new(&path).load().unwrap();
        assert_eq!(
            graph.edges(),
            vec![(NodeId::new(1, 1003), NodeId::new(1, 1005))]
        );
        assert_eq!(control.relations().relations.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_sequence_from_control_surface() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with(dir.path().join("missing.json"));
        config.plant.ambient_pressure = 0.0;
        let simulator = Simulator::start(config).unwrap();
        let control = simulator.control();

        // Already below threshold: nothing starts.
        assert!(!control.trigger_sequence(SequenceKind::Evacuate, 0.01).unwrap());

        assert!(control.trigger_sequence(SequenceKind::Intake, 50_000.0).unwrap());
        assert!(!control.trigger_sequence(SequenceKind::Evacuate, 0.01).unwrap());
        assert!(control.add_relation("valve01", "valve02").is_err());

        simulator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_relation_excludes_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relation.json");
        let mut config = config_with(path.clone());
        config.plant.ambient_pressure = 0.0;
        let simulator = Simulator::start(config).unwrap();
        let control = simulator.control();

        let lease = simulator.sequencer().guard().try_acquire().unwrap();
        assert!(matches!(
            control.add_relation("valve01", "vacuumpump01"),
            Err(ServerError::InvalidRequest(_))
        ));
        assert!(!path.exists());
        drop(lease);

        assert!(control.add_relation("valve01", "vacuumpump01").unwrap());
        // The guard is released once the relation is stored.
        assert!(!simulator.sequencer().is_running());
        assert!(control.trigger_sequence(SequenceKind::Intake, 50_000.0).unwrap());

        simulator.shutdown().await;
    }

    #[tokio::test]
    async fn test_devices_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let simulator = Simulator::start(config_with(dir.path().join("missing.json"))).unwrap();
        let control = simulator.control();

        assert_eq!(
            control.device_status("ns=1;i=1005").unwrap(),
            DeviceStatus::Closed
        );
        let summary = control.list_devices().unwrap();
        assert_eq!(summary[4].device.browse_name, "barometer01");
        assert_eq!(summary[4].value, Some(101_325.0));
        assert!(control.stop_device("ns=1;i=4242").is_err());
    }
}
