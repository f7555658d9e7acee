// src/manager/mod.rs
//! Resource manager facade
//!
//! [`SimpleResourceManager`] owns the machine model, the resource graph and
//! the broker director for one target machine. Clients keep their
//! [`BasicBlock`] and pass it to every call; successful assignments bind
//! concrete ports, registers and buses into the block's moves.
//!
//! ```no_run
//! use tta_resman::config::MachineConfig;
//! use tta_resman::manager::SimpleResourceManager;
//! use tta_resman::tta::instruction::{BasicBlock, Move, Terminal};
//!
//! let mut rm = SimpleResourceManager::from_config(&MachineConfig::default_test())?;
//! let rf = rm.machine().register_file_by_name("RF").unwrap();
//! let mut block = BasicBlock::new();
//! let n = block.add_move(Move::new(Terminal::register(rf, 1), Terminal::register(rf, 2)));
//! if let Some(cycle) = rm.earliest_cycle(&mut block, n)?.cycle() {
//!     rm.assign(&mut block, cycle, n)?;
//! }
//! # Ok::<(), tta_resman::error::RmError>(())
//! ```

pub mod build;
pub mod director;
pub mod plan;

pub use crate::broker::{AssignRequest, CycleBound};
pub use build::ResourceBuildDirector;
pub use director::SimpleBrokerDirector;
pub use plan::{AssignmentPlan, PendingAssignment, PlanEnv};

use crate::broker::{Broker, BrokerContext, BrokerKind, ResourceMapper};
use crate::config::MachineConfig;
use crate::error::{RmError, RmResult};
use crate::resource::{ResourceId, ResourceKind, ResourceStore};
use crate::tta::instruction::{BasicBlock, Immediate, ImmediateValue, Instruction, NodeId};
use crate::tta::processor::Machine;
use std::collections::BTreeMap;
use std::fmt;

pub struct SimpleResourceManager {
    machine: Machine,
    store: ResourceStore,
    mapper: ResourceMapper,
    director: SimpleBrokerDirector,
}

impl SimpleResourceManager {
    /// Build the brokers and the resource graph of `machine`
    pub fn new(machine: Machine) -> RmResult<Self> {
        let mut brokers = Broker::default_set();
        let (store, mapper) = ResourceBuildDirector::build(&machine, &mut brokers)?;
        let window = machine.limits.scheduling_window;
        log::info!("Resource manager for {} ready: {} resources", machine.name, store.len());
        Ok(Self {
            machine,
            store,
            mapper,
            director: SimpleBrokerDirector::new(AssignmentPlan::new(brokers), window),
        })
    }

    pub fn from_config(config: &MachineConfig) -> RmResult<Self> {
        Self::new(Machine::from_config(config)?)
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    pub fn mapper(&self) -> &ResourceMapper {
        &self.mapper
    }

    pub fn brokers(&self) -> &[Broker] {
        self.director.brokers()
    }

    fn split<'a>(&'a mut self, block: &'a mut BasicBlock) -> (&'a mut SimpleBrokerDirector, PlanEnv<'a>) {
        (
            &mut self.director,
            PlanEnv {
                machine: &self.machine,
                store: &mut self.store,
                mapper: &self.mapper,
                block,
            },
        )
    }

    fn context<'a>(&'a self, block: &'a BasicBlock) -> BrokerContext<'a> {
        self.director
            .plan()
            .context(&self.machine, &self.store, &self.mapper, block)
    }

    fn check_node(block: &BasicBlock, node: NodeId) -> RmResult<()> {
        if block.contains(node) {
            Ok(())
        } else {
            Err(RmError::invalid_use(format!("{} is not in the block", node)))
        }
    }

    pub fn can_assign(&mut self, block: &mut BasicBlock, cycle: i32, node: NodeId) -> RmResult<bool> {
        self.can_assign_with(block, cycle, node, AssignRequest::default())
    }

    pub fn can_assign_with(
        &mut self,
        block: &mut BasicBlock,
        cycle: i32,
        node: NodeId,
        request: AssignRequest,
    ) -> RmResult<bool> {
        Self::check_node(block, node)?;
        let (director, mut env) = self.split(block);
        director.can_assign(&mut env, cycle, node, request)
    }

    pub fn assign(&mut self, block: &mut BasicBlock, cycle: i32, node: NodeId) -> RmResult<()> {
        self.assign_with(block, cycle, node, AssignRequest::default())
    }

    pub fn assign_with(
        &mut self,
        block: &mut BasicBlock,
        cycle: i32,
        node: NodeId,
        request: AssignRequest,
    ) -> RmResult<()> {
        Self::check_node(block, node)?;
        let (director, mut env) = self.split(block);
        director.assign(&mut env, cycle, node, request)
    }

    pub fn unassign(&mut self, block: &mut BasicBlock, node: NodeId) -> RmResult<()> {
        Self::check_node(block, node)?;
        let (director, mut env) = self.split(block);
        director.unassign(&mut env, node)
    }

    /// Earliest feasible cycle of `node`, searching from cycle 0
    pub fn earliest_cycle(&mut self, block: &mut BasicBlock, node: NodeId) -> RmResult<CycleBound> {
        self.earliest_cycle_from(block, 0, node)
    }

    pub fn earliest_cycle_from(&mut self, block: &mut BasicBlock, cycle: i32, node: NodeId) -> RmResult<CycleBound> {
        self.earliest_cycle_with(block, cycle, node, AssignRequest::default())
    }

    pub fn earliest_cycle_with(
        &mut self,
        block: &mut BasicBlock,
        cycle: i32,
        node: NodeId,
        request: AssignRequest,
    ) -> RmResult<CycleBound> {
        Self::check_node(block, node)?;
        let (director, mut env) = self.split(block);
        director.earliest_cycle(&mut env, cycle, node, request)
    }

    /// Latest feasible cycle of `node` with no upper limit
    pub fn latest_cycle(&mut self, block: &mut BasicBlock, node: NodeId) -> RmResult<CycleBound> {
        self.latest_cycle_from(block, i32::MAX, node)
    }

    pub fn latest_cycle_from(&mut self, block: &mut BasicBlock, cycle: i32, node: NodeId) -> RmResult<CycleBound> {
        self.latest_cycle_with(block, cycle, node, AssignRequest::default())
    }

    pub fn latest_cycle_with(
        &mut self,
        block: &mut BasicBlock,
        cycle: i32,
        node: NodeId,
        request: AssignRequest,
    ) -> RmResult<CycleBound> {
        Self::check_node(block, node)?;
        let (director, mut env) = self.split(block);
        director.latest_cycle(&mut env, cycle, node, request)
    }

    /// Can all of `nodes` be placed one after another past the current high-water mark
    pub fn has_connection(&mut self, block: &mut BasicBlock, nodes: &[NodeId]) -> RmResult<bool> {
        for node in nodes {
            Self::check_node(block, *node)?;
        }
        let (director, mut env) = self.split(block);
        director.has_connection(&mut env, nodes)
    }

    /// Candidates of the `kind` broker for `node` at `cycle`, given the choices of the brokers before it
    pub fn available_resources(
        &mut self,
        block: &mut BasicBlock,
        kind: BrokerKind,
        cycle: i32,
        node: NodeId,
    ) -> RmResult<Vec<ResourceId>> {
        self.available_resources_with(block, kind, cycle, node, AssignRequest::default())
    }

    pub fn available_resources_with(
        &mut self,
        block: &mut BasicBlock,
        kind: BrokerKind,
        cycle: i32,
        node: NodeId,
        request: AssignRequest,
    ) -> RmResult<Vec<ResourceId>> {
        Self::check_node(block, node)?;
        let (director, mut env) = self.split(block);
        director.available_resources(&mut env, kind, cycle, node, request)
    }

    /// Instruction of `cycle`, created empty when nothing is placed there yet
    pub fn instruction(&mut self, block: &BasicBlock, cycle: i32) -> RmResult<&Instruction> {
        let templates = self
            .director
            .plan_mut()
            .itemplate_broker_mut()
            .ok_or_else(|| RmError::invalid_use("no instruction template broker"))?;
        templates.instruction(&self.machine, block, &mut self.store, cycle)
    }

    /// Hand the instruction of `cycle` over to the caller
    pub fn lose_instruction_ownership(&mut self, cycle: i32) -> RmResult<Option<Instruction>> {
        let templates = self
            .director
            .plan_mut()
            .itemplate_broker_mut()
            .ok_or_else(|| RmError::invalid_use("no instruction template broker"))?;
        let instruction = templates.lose_instruction_ownership(&mut self.store, cycle)?;
        if instruction.is_none() {
            log::warn!("[manager] no instruction to hand over at cycle {}", cycle);
        }
        Ok(instruction)
    }

    pub fn instruction_is_empty(&self, cycle: i32) -> bool {
        self.director
            .plan()
            .itemplate_broker()
            .map(|t| t.instruction_is_empty(cycle))
            .unwrap_or(true)
    }

    /// Instructions held by the manager, in cycle order
    pub fn instructions(&self) -> Vec<(i32, &Instruction)> {
        self.director
            .plan()
            .itemplate_broker()
            .map(|t| t.instructions().collect())
            .unwrap_or_default()
    }

    pub fn largest_cycle(&self) -> i32 {
        self.director.largest_cycle(&self.store)
    }

    pub fn smallest_cycle(&self) -> i32 {
        self.director.smallest_cycle()
    }

    /// Constant read from a long immediate register by `node`
    pub fn immediate_value(&self, node: NodeId) -> Option<ImmediateValue> {
        self.director
            .plan()
            .iu_broker()
            .and_then(|iu| iu.immediate_value(&self.store, node))
    }

    /// Cycle the long immediate read by `node` is written in
    pub fn immediate_write_cycle(&self, node: NodeId) -> Option<i32> {
        self.director
            .plan()
            .iu_broker()
            .and_then(|iu| iu.immediate_write_cycle(&self.store, node))
    }

    pub fn is_template_available(&self, block: &BasicBlock, cycle: i32, immediate: &Immediate) -> bool {
        let ctx = self.context(block);
        self.director
            .plan()
            .itemplate_broker()
            .map(|t| t.is_template_available(&ctx, cycle, immediate))
            .unwrap_or(false)
    }

    pub fn can_transport_immediate(&self, block: &BasicBlock, node: NodeId) -> bool {
        self.can_transport_immediate_with(block, node, AssignRequest::default())
    }

    pub fn can_transport_immediate_with(&self, block: &BasicBlock, node: NodeId, request: AssignRequest) -> bool {
        let ctx = self.context(block);
        self.director
            .plan()
            .bus_broker()
            .map(|bus| bus.can_transport_immediate(&ctx, node, &request))
            .unwrap_or(false)
    }

    /// Does some bus support the guard of `node`
    pub fn has_guard(&self, block: &BasicBlock, node: NodeId) -> bool {
        let ctx = self.context(block);
        self.director
            .plan()
            .bus_broker()
            .map(|bus| bus.has_guard(&ctx, node))
            .unwrap_or(false)
    }

    /// Moves placed at `cycle`
    pub fn move_count(&self, cycle: i32) -> usize {
        self.director.move_count(cycle)
    }

    /// Drop every assignment so the manager can serve another block
    pub fn clear(&mut self) {
        self.director.clear();
        self.store.clear_occupancy();
        log::debug!("[manager] cleared");
    }

    pub fn resource_count(&self) -> usize {
        self.store.len()
    }

    /// Resources per kind
    pub fn resource_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for (_, resource) in self.store.iter() {
            *counts.entry(format!("{:?}", resource.kind())).or_insert(0) += 1;
        }
        counts
    }

    pub fn resource_name(&self, resource: ResourceId) -> &str {
        self.store.name(resource)
    }

    pub fn resource_kind(&self, resource: ResourceId) -> ResourceKind {
        self.store.kind(resource)
    }
}

impl fmt::Display for SimpleResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Resource manager for {}", self.machine.name)?;
        for broker in self.brokers() {
            let broker = broker.as_dyn();
            writeln!(f, "  {}: {} resources", broker.kind(), broker.resource_count())?;
        }
        write!(f, "{}", self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tta::instruction::{Move, Terminal};

    fn manager() -> SimpleResourceManager {
        SimpleResourceManager::from_config(&MachineConfig::default_test()).unwrap()
    }

    #[test]
    fn test_register_copy_binds_ports_and_bus() {
        let mut rm = manager();
        let rf = rm.machine().register_file_by_name("RF").unwrap();
        let mut block = BasicBlock::new();
        let n = block.add_move(Move::new(Terminal::register(rf, 1), Terminal::register(rf, 2)));

        assert!(rm.can_assign(&mut block, 0, n).unwrap());
        assert!(block.node(n).transport.bus.is_none());
        assert!(!block.node(n).is_placed());

        rm.assign(&mut block, 0, n).unwrap();
        let moved = block.node(n);
        assert_eq!(moved.cycle, Some(0));
        assert!(moved.transport.bus.is_some());
        assert!(moved.transport.source.bound_port().is_some());
        assert!(moved.transport.destination.bound_port().is_some());
        assert_eq!(rm.largest_cycle(), 0);
        assert_eq!(rm.smallest_cycle(), 0);
        assert_eq!(rm.move_count(0), 1);

        rm.unassign(&mut block, n).unwrap();
        let moved = block.node(n);
        assert!(moved.transport.bus.is_none());
        assert!(moved.transport.source.bound_port().is_none());
        assert_eq!(rm.largest_cycle(), -1);
        assert_eq!(rm.smallest_cycle(), i32::MAX);
    }

    #[test]
    fn test_assign_rejects_bad_cycles() {
        let mut rm = manager();
        let rf = rm.machine().register_file_by_name("RF").unwrap();
        let mut block = BasicBlock::new();
        let n = block.add_move(Move::new(Terminal::register(rf, 1), Terminal::register(rf, 2)));

        assert!(matches!(rm.assign(&mut block, -1, n), Err(RmError::InvalidUse(_))));
        assert!(matches!(rm.assign(&mut block, i32::MAX, n), Err(RmError::InvalidUse(_))));
        assert!(!rm.can_assign(&mut block, -3, n).unwrap());
        assert!(matches!(rm.unassign(&mut block, n), Err(RmError::InvalidUse(_))));
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut rm = manager();
        let rf = rm.machine().register_file_by_name("RF").unwrap();
        let mut block = BasicBlock::new();
        let n = block.add_move(Move::new(Terminal::register(rf, 1), Terminal::register(rf, 2)));
        rm.assign(&mut block, 4, n).unwrap();
        assert!(!rm.instruction_is_empty(4));

        rm.clear();
        assert!(rm.instruction_is_empty(4));
        assert_eq!(rm.largest_cycle(), -1);
        assert_eq!(rm.move_count(4), 0);
        assert!(rm.store().iter().all(|(_, r)| !r.is_in_use(4)));
    }

    #[test]
    fn test_brokers_agree_on_candidates() {
        let mut rm = manager();
        let rf = rm.machine().register_file_by_name("RF").unwrap();
        let mut block = BasicBlock::new();
        let n = block.add_move(Move::new(Terminal::register(rf, 1), Terminal::register(rf, 2)));
        let request = AssignRequest::default();
        {
            let ctx = rm.context(&block);
            for broker in rm.brokers() {
                let broker = broker.as_dyn();
                let any = broker.is_any_resource_available(&ctx, 0, n, &request);
                assert_eq!(any, !broker.all_available_resources(&ctx, 0, n, &request).is_empty());
            }
        }

        rm.assign(&mut block, 0, n).unwrap();
        let bus = block.node(n).transport.bus.unwrap();
        let resource = rm
            .mapper()
            .resource_of(crate::broker::MachinePart::Bus(bus), ResourceKind::Bus);
        let bus_broker = rm.brokers().iter().find(|b| b.kind() == BrokerKind::Bus).unwrap();
        assert_eq!(bus_broker.as_dyn().assigned_resource(n), resource);
        assert!(bus_broker.as_dyn().is_already_assigned(0, n));
        assert!(!bus_broker.as_dyn().is_already_assigned(1, n));
    }

    #[test]
    fn test_display_lists_brokers() {
        let rm = manager();
        let text = rm.to_string();
        assert!(text.contains("BusBroker"));
        assert!(text.contains("ITemplateBroker"));
        assert!(rm.resource_counts().contains_key("Bus"));
    }
}
