//! Cascading of device commands along the relation graph.
//!
//! When a device reaches OPEN or CLOSED, each of its children in the relation
//! graph receives a start or stop command according to the rule for the
//! (parent kind, child kind) pair. Commands go through the same
//! [`DeviceCommands`] interface external callers use, so idempotence of the
//! commands bounds any feedback between related devices.

use crate::config::DispatcherConfig;
use crate::dispatcher::DataChangeHandler;
use parking_lot::RwLock;
use plcsim_core::{DeviceCommands, DeviceKind, DeviceRegistry, DeviceStatus};
use plcsim_relation::{RelationError, RelationGraph};
use plcsim_space::{DataChange, NodeId, Variant};
use std::collections::HashMap;
use std::sync::Arc;

/// How a child follows its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeRule {
    /// Parent OPEN starts the child, parent CLOSED stops it.
    Mirror,
    /// Parent OPEN starts the child.
    StartOnOpen,
}

/// Command issued to a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeAction {
    Start,
    Stop,
}

impl CascadeRule {
    /// Returns the child command for a parent status, if any.
    pub fn action(&self, parent: DeviceStatus) -> Option<CascadeAction> {
        match (self, parent) {
            (_, DeviceStatus::Open) => Some(CascadeAction::Start),
            (CascadeRule::Mirror, DeviceStatus::Closed) => Some(CascadeAction::Stop),
            _ => None,
        }
    }
}

/// Rule table keyed by (parent kind, child kind).
#[derive(Debug, Clone)]
pub struct CascadeRules {
    rules: HashMap<(DeviceKind, DeviceKind), CascadeRule>,
}

impl CascadeRules {
    /// Creates a table with no rules.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// The plant's rule table.
    pub fn standard() -> Self {
        use CascadeRule::*;
        use DeviceKind::*;

        Self::empty()
            .with(Valve, Valve, Mirror)
            .with(Valve, VacuumPump, Mirror)
            .with(VacuumPump, Valve, Mirror)
            .with(VacuumPump, VacuumPump, StartOnOpen)
            .with(VacuumPump, Barometer, StartOnOpen)
            .with(Barometer, Valve, Mirror)
            .with(Barometer, VacuumPump, StartOnOpen)
    }

    pub fn with(mut self, parent: DeviceKind, child: DeviceKind, rule: CascadeRule) -> Self {
        self.rules.insert((parent, child), rule);
        self
    }

    pub fn rule(&self, parent: DeviceKind, child: DeviceKind) -> Option<CascadeRule> {
        self.rules.get(&(parent, child)).copied()
    }
}

impl Default for CascadeRules {
    fn default() -> Self {
        Self::standard()
    }
}

/// Start parameters for cascaded commands.
#[derive(Debug, Clone)]
pub struct CascadeParams {
    pub valve_flow: f64,
    pub pump_speed: f64,
    pub barometer_series: String,
}

impl CascadeParams {
    pub fn start_param(&self, kind: DeviceKind) -> Variant {
        match kind {
            DeviceKind::Valve => Variant::Float(self.valve_flow),
            DeviceKind::VacuumPump => Variant::Float(self.pump_speed),
            DeviceKind::Barometer => Variant::String(self.barometer_series.clone()),
        }
    }
}

impl From<&DispatcherConfig> for CascadeParams {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            valve_flow: config.valve_flow,
            pump_speed: config.pump_speed,
            barometer_series: config.barometer_series.clone(),
        }
    }
}

/// Status-change handler that applies the cascade rules.
pub struct CascadeHandler {
    relations: Arc<RwLock<RelationGraph>>,
    registry: Arc<DeviceRegistry>,
    commands: Arc<dyn DeviceCommands>,
    rules: CascadeRules,
    params: CascadeParams,
}

impl CascadeHandler {
    pub fn new(
        relations: Arc<RwLock<RelationGraph>>,
        registry: Arc<DeviceRegistry>,
        commands: Arc<dyn DeviceCommands>,
        rules: CascadeRules,
        params: CascadeParams,
    ) -> Self {
        Self {
            relations,
            registry,
            commands,
            rules,
            params,
        }
    }

    /// Applies the rules to the children of `parent`. Returns the number of
    /// commands that changed a child.
    ///
    /// Failures affect only their own branch and are logged.
    pub fn cascade(&self, parent: &NodeId, status: DeviceStatus) -> usize {
        let parent = match self.registry.get(parent) {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!("Cascade from {} skipped: {}", parent, e);
                return 0;
            }
        };

        // Copy the child ids out so no lock is held while commands run.
        let children: Vec<NodeId> = match self.relations.read().children(&parent.id) {
            Ok(children) => children.iter().map(|c| c.id).collect(),
            Err(RelationError::NotFound { .. }) => return 0,
            Err(e) => {
                tracing::warn!("Cascade from {} skipped: {}", parent, e);
                return 0;
            }
        };

        let mut applied = 0;
        for child_id in children {
            let child = match self.registry.get(&child_id) {
                Ok(device) => device,
                Err(e) => {
                    tracing::warn!("Cascade {} -> {} skipped: {}", parent, child_id, e);
                    continue;
                }
            };
            let Some(action) = self
                .rules
                .rule(parent.kind, child.kind)
                .and_then(|rule| rule.action(status))
            else {
                continue;
            };

            let result = match action {
                CascadeAction::Start => self
                    .commands
                    .start(&child.id, &self.params.start_param(child.kind)),
                CascadeAction::Stop => self.commands.stop(&child.id),
            };

            match result {
                Ok(outcome) => {
                    tracing::debug!(
                        "Cascade {} {} -> {} {:?}: {}",
                        parent.browse_name,
                        status,
                        child.browse_name,
                        action,
                        outcome
                    );
                    if outcome.applied {
                        applied += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Cascade {} -> {} {:?} failed: {}",
                        parent.browse_name,
                        child.browse_name,
                        action,
                        e
                    );
                }
            }
        }
        applied
    }
}

impl DataChangeHandler for CascadeHandler {
    fn handle(&self, change: &DataChange) {
        let Some(status) = DeviceStatus::from_variant(&change.value) else {
            tracing::warn!(
                "Ignoring non-status value {} of {} on {}",
                change.value,
                change.attribute,
                change.node
            );
            return;
        };
        // Transient states never cascade.
        if status.is_transient() {
            return;
        }
        self.cascade(&change.node, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use plcsim_core::{CommandOutcome, CoreError, Device};

    #[derive(Default)]
    struct RecordingCommands {
        calls: Mutex<Vec<(NodeId, &'static str, Option<Variant>)>>,
    }

    impl DeviceCommands for RecordingCommands {
        fn start(&self, device: &NodeId, param: &Variant) -> Result<CommandOutcome, CoreError> {
            self.calls
                .lock()
                .push((*device, "start", Some(param.clone())));
            Ok(CommandOutcome {
                applied: true,
                message: "started".to_string(),
            })
        }

        fn stop(&self, device: &NodeId) -> Result<CommandOutcome, CoreError> {
            self.calls.lock().push((*device, "stop", None));
            Ok(CommandOutcome {
                applied: true,
                message: "stopped".to_string(),
            })
        }
    }

    const P: NodeId = NodeId::new(1, 1);
    const C1: NodeId = NodeId::new(1, 2);
    const C2: NodeId = NodeId::new(1, 3);
    const B: NodeId = NodeId::new(1, 4);

    fn setup(parent_kind: DeviceKind) -> (CascadeHandler, Arc<RecordingCommands>) {
        let registry = Arc::new(DeviceRegistry::new());
        registry.register(Device::new(P, "parent", parent_kind));
        registry.register(Device::new(C1, "child_valve", DeviceKind::Valve));
        registry.register(Device::new(C2, "child_pump", DeviceKind::VacuumPump));
        registry.register(Device::new(B, "barometer", DeviceKind::Barometer));

        let mut graph = RelationGraph::new();
        graph.add_edge((P, "parent"), (C1, "child_valve")).unwrap();
        graph.add_edge((P, "parent"), (C2, "child_pump")).unwrap();

        let commands = Arc::new(RecordingCommands::default());
        let handler = CascadeHandler::new(
            Arc::new(RwLock::new(graph)),
            registry,
            commands.clone(),
            CascadeRules::standard(),
            CascadeParams {
                valve_flow: 2.0,
                pump_speed: 3.0,
                barometer_series: "pump_down".to_string(),
            },
        );
        (handler, commands)
    }

    fn status_change(node: NodeId, status: DeviceStatus) -> DataChange {
        DataChange {
            node,
            attribute: "ValveStatus".to_string(),
            value: status.to_variant(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_rule_table() {
        let rules = CascadeRules::standard();
        assert_eq!(
            rules.rule(DeviceKind::Valve, DeviceKind::VacuumPump),
            Some(CascadeRule::Mirror)
        );
        assert_eq!(
            rules.rule(DeviceKind::VacuumPump, DeviceKind::Barometer),
            Some(CascadeRule::StartOnOpen)
        );
        assert_eq!(rules.rule(DeviceKind::Valve, DeviceKind::Barometer), None);
        assert_eq!(rules.rule(DeviceKind::Barometer, DeviceKind::Barometer), None);

        assert_eq!(
            CascadeRule::StartOnOpen.action(DeviceStatus::Closed),
            None
        );
        assert_eq!(
            CascadeRule::Mirror.action(DeviceStatus::Closed),
            Some(CascadeAction::Stop)
        );
        assert_eq!(CascadeRule::Mirror.action(DeviceStatus::Opening), None);
    }

    #[test]
    fn test_open_starts_each_child_once() {
        let (handler, commands) = setup(DeviceKind::Valve);
        handler.handle(&status_change(P, DeviceStatus::Open));

        let calls = commands.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                (C1, "start", Some(Variant::Float(2.0))),
                (C2, "start", Some(Variant::Float(3.0))),
            ]
        );
    }

    #[test]
    fn test_close_mirrors_only_mirror_children() {
        let (handler, commands) = setup(DeviceKind::VacuumPump);
        handler.handle(&status_change(P, DeviceStatus::Closed));

        // pump -> valve mirrors, pump -> pump only starts on open
        let calls = commands.calls.lock().clone();
        assert_eq!(calls, vec![(C1, "stop", None)]);
    }

    #[test]
    fn test_transient_status_ignored() {
        let (handler, commands) = setup(DeviceKind::Valve);
        handler.handle(&status_change(P, DeviceStatus::Opening));
        handler.handle(&status_change(P, DeviceStatus::Closing));
        assert!(commands.calls.lock().is_empty());
    }

    #[test]
    fn test_device_without_relations() {
        let (handler, commands) = setup(DeviceKind::Valve);
        assert_eq!(handler.cascade(&B, DeviceStatus::Open), 0);
        assert_eq!(handler.cascade(&NodeId::new(1, 99), DeviceStatus::Open), 0);
        assert!(commands.calls.lock().is_empty());
    }

    #[test]
    fn test_unknown_child_skips_only_its_branch() {
        let (handler, commands) = setup(DeviceKind::Valve);
        handler
            .relations
            .write()
            .add_edge((P, "parent"), (NodeId::new(1, 50), "ghost"))
            .unwrap();

        assert_eq!(handler.cascade(&P, DeviceStatus::Open), 2);
        assert_eq!(commands.calls.lock().len(), 2);
    }
}
