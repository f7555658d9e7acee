// src/broker/mod.rs
//! Resource brokers
//!
//! A broker owns every scheduling resource of one kind and answers, for a
//! move node and a cycle, which of them can serve the move. Assigning a
//! broker's resource reserves it in the shared [`ResourceStore`] and may
//! rewrite the move's terminals (binding ports, registers and buses).
//!
//! Brokers are kept in a closed [`Broker`] enum so the assignment plan
//! can hold them in one vector and still give each broker typed access
//! to its peers through [`Peers`].

pub mod bus;
pub mod input_fu;
pub mod input_psocket;
pub mod itemplate;
pub mod iu;
pub mod mapper;
pub mod output_fu;
pub mod output_psocket;
pub mod pipeline;

pub use bus::BusBroker;
pub use input_fu::InputFuBroker;
pub use input_psocket::InputPSocketBroker;
pub use itemplate::ITemplateBroker;
pub use iu::IuBroker;
pub use mapper::{MachinePart, ResourceMapper};
pub use output_fu::OutputFuBroker;
pub use output_psocket::OutputPSocketBroker;
pub use pipeline::ExecutionPipelineBroker;

use crate::config::ConfigError;
use crate::error::{RmError, RmResult};
use crate::resource::pipeline::OpKey;
use crate::resource::{ResourceId, ResourceStore};
use crate::tta::instruction::{BasicBlock, MoveNode, NodeId, OpId, Terminal};
use crate::tta::processor::{BusId, FuId, IuId, Machine, PortRef, UnitRef};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Broker category, in the order the default plan consults them
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BrokerKind {
    InputFu,
    OutputFu,
    ExecutionPipeline,
    InputPSocket,
    ImmediateUnit,
    OutputPSocket,
    Bus,
    InstructionTemplate,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BrokerKind::InputFu => "InputFUBroker",
            BrokerKind::OutputFu => "OutputFUBroker",
            BrokerKind::ExecutionPipeline => "ExecutionPipelineBroker",
            BrokerKind::InputPSocket => "InputPSocketBroker",
            BrokerKind::ImmediateUnit => "IUBroker",
            BrokerKind::OutputPSocket => "OutputPSocketBroker",
            BrokerKind::Bus => "BusBroker",
            BrokerKind::InstructionTemplate => "ITemplateBroker",
        };
        f.write_str(name)
    }
}

/// Optional constraints passed along with an assignment query
///
/// Every field narrows the candidate set of the broker that reads it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssignRequest {
    pub bus: Option<BusId>,
    pub src_fu: Option<FuId>,
    pub dst_fu: Option<FuId>,
    /// Cycle the long immediate must be written in
    pub imm_write_cycle: Option<i32>,
    pub immu: Option<IuId>,
    pub imm_reg_index: Option<usize>,
}

/// Result of an earliest or latest cycle search
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleBound {
    Cycle(i32),
    /// No constraint in the searched direction
    Unbounded,
    Infeasible,
}

impl CycleBound {
    pub fn cycle(self) -> Option<i32> {
        match self {
            CycleBound::Cycle(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_feasible(self) -> bool {
        !matches!(self, CycleBound::Infeasible)
    }
}

impl fmt::Display for CycleBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleBound::Cycle(c) => write!(f, "{}", c),
            CycleBound::Unbounded => f.write_str("unbounded"),
            CycleBound::Infeasible => f.write_str("infeasible"),
        }
    }
}

/// Other brokers of the plan, visible while one broker is borrowed mutably
#[derive(Clone, Copy)]
pub struct Peers<'a> {
    before: &'a [Broker],
    after: &'a [Broker],
}

impl<'a> Peers<'a> {
    pub fn new(before: &'a [Broker], after: &'a [Broker]) -> Self {
        Self { before, after }
    }

    fn iter(&self) -> impl Iterator<Item = &'a Broker> {
        let (before, after) = (self.before, self.after);
        before.iter().chain(after.iter())
    }

    pub fn bus(&self) -> Option<&'a BusBroker> {
        self.iter().find_map(|b| match b {
            Broker::Bus(b) => Some(b),
            _ => None,
        })
    }

    pub fn iu(&self) -> Option<&'a IuBroker> {
        self.iter().find_map(|b| match b {
            Broker::ImmediateUnit(b) => Some(b),
            _ => None,
        })
    }

    pub fn itemplate(&self) -> Option<&'a ITemplateBroker> {
        self.iter().find_map(|b| match b {
            Broker::InstructionTemplate(b) => Some(b),
            _ => None,
        })
    }

    pub fn pipeline(&self) -> Option<&'a ExecutionPipelineBroker> {
        self.iter().find_map(|b| match b {
            Broker::ExecutionPipeline(b) => Some(b),
            _ => None,
        })
    }
}

/// Read-only view used by queries
#[derive(Clone, Copy)]
pub struct BrokerContext<'a> {
    pub machine: &'a Machine,
    pub store: &'a ResourceStore,
    pub mapper: &'a ResourceMapper,
    pub block: &'a BasicBlock,
    pub peers: Peers<'a>,
}

impl<'a> BrokerContext<'a> {
    pub fn node(&self, node: NodeId) -> &'a MoveNode {
        self.block.node(node)
    }
}

/// Mutable view used by assign and unassign
pub struct AssignContext<'a> {
    pub machine: &'a Machine,
    pub store: &'a mut ResourceStore,
    pub mapper: &'a ResourceMapper,
    pub block: &'a mut BasicBlock,
    pub peers: Peers<'a>,
}

impl<'a> AssignContext<'a> {
    pub fn view(&self) -> BrokerContext<'_> {
        BrokerContext {
            machine: self.machine,
            store: &*self.store,
            mapper: self.mapper,
            block: &*self.block,
            peers: self.peers,
        }
    }
}

/// Move state to put back when an assignment is undone
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Restore {
    Nothing,
    Source(Terminal),
    Destination(Terminal),
    Bus(Option<BusId>),
}

impl Restore {
    pub fn apply(self, node: &mut MoveNode) {
        match self {
            Restore::Nothing => {}
            Restore::Source(t) => node.transport.source = t,
            Restore::Destination(t) => node.transport.destination = t,
            Restore::Bus(b) => node.transport.bus = b,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub resource: ResourceId,
    pub cycle: i32,
    pub restore: Restore,
}

/// Bookkeeping shared by every broker: owned resources and live assignments
#[derive(Clone, Debug, Default)]
pub struct BrokerCore {
    resources: BTreeMap<MachinePart, ResourceId>,
    parts: BTreeMap<ResourceId, MachinePart>,
    assignments: HashMap<NodeId, Assignment>,
}

impl BrokerCore {
    pub fn add_resource(&mut self, part: MachinePart, resource: ResourceId) {
        self.resources.insert(part, resource);
        self.parts.insert(resource, part);
    }

    pub fn resource_of(&self, part: MachinePart) -> Option<ResourceId> {
        self.resources.get(&part).copied()
    }

    pub fn part_of(&self, resource: ResourceId) -> Option<MachinePart> {
        self.parts.get(&resource).copied()
    }

    /// Owned resources in machine part order
    pub fn resources(&self) -> impl Iterator<Item = (MachinePart, ResourceId)> + '_ {
        self.resources.iter().map(|(p, r)| (*p, *r))
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn record(&mut self, node: NodeId, assignment: Assignment) {
        self.assignments.insert(node, assignment);
    }

    pub fn take(&mut self, node: NodeId) -> Option<Assignment> {
        self.assignments.remove(&node)
    }

    pub fn assignment(&self, node: NodeId) -> Option<&Assignment> {
        self.assignments.get(&node)
    }

    pub fn clear_assignments(&mut self) {
        self.assignments.clear();
    }

    /// Machine part behind `resource`, failing if another broker owns it
    pub fn ensure_owned(&self, broker: BrokerKind, resource: ResourceId) -> RmResult<MachinePart> {
        self.part_of(resource)
            .ok_or_else(|| RmError::invalid_use(format!("{} does not own resource {:?}", broker, resource)))
    }
}

/// Common interface of all brokers
pub trait ResourceBroker {
    fn kind(&self) -> BrokerKind;
    fn core(&self) -> &BrokerCore;
    fn core_mut(&mut self) -> &mut BrokerCore;

    /// Does this broker take part in placing `node`
    fn is_applicable(&self, ctx: &BrokerContext<'_>, node: NodeId, request: &AssignRequest) -> bool;

    /// Resources that could serve `node` at `cycle`, most preferred first
    fn all_available_resources(
        &self,
        ctx: &BrokerContext<'_>,
        cycle: i32,
        node: NodeId,
        request: &AssignRequest,
    ) -> Vec<ResourceId>;

    fn is_any_resource_available(
        &self,
        ctx: &BrokerContext<'_>,
        cycle: i32,
        node: NodeId,
        request: &AssignRequest,
    ) -> bool {
        !self.all_available_resources(ctx, cycle, node, request).is_empty()
    }

    fn is_available(
        &self,
        ctx: &BrokerContext<'_>,
        resource: ResourceId,
        cycle: i32,
        node: NodeId,
        request: &AssignRequest,
    ) -> bool {
        self.all_available_resources(ctx, cycle, node, request)
            .contains(&resource)
    }

    fn assign(
        &mut self,
        ctx: &mut AssignContext<'_>,
        cycle: i32,
        node: NodeId,
        resource: ResourceId,
        request: &AssignRequest,
    ) -> RmResult<()>;

    /// Undo the assignment of `node`; a no-op if this broker holds none
    fn unassign(&mut self, ctx: &mut AssignContext<'_>, node: NodeId) -> RmResult<()>;

    fn is_already_assigned(&self, cycle: i32, node: NodeId) -> bool {
        self.core()
            .assignment(node)
            .map(|a| a.cycle == cycle)
            .unwrap_or(false)
    }

    fn assigned_resource(&self, node: NodeId) -> Option<ResourceId> {
        self.core().assignment(node).map(|a| a.resource)
    }

    fn earliest_cycle(
        &self,
        _ctx: &BrokerContext<'_>,
        _cycle: i32,
        _node: NodeId,
        _request: &AssignRequest,
    ) -> RmResult<CycleBound> {
        Err(RmError::NotImplemented {
            broker: self.kind().to_string(),
            method: "earliest_cycle",
        })
    }

    fn latest_cycle(
        &self,
        _ctx: &BrokerContext<'_>,
        _cycle: i32,
        _node: NodeId,
        _request: &AssignRequest,
    ) -> RmResult<CycleBound> {
        Err(RmError::NotImplemented {
            broker: self.kind().to_string(),
            method: "latest_cycle",
        })
    }

    /// Create one resource per machine part this broker models
    fn build_resources(
        &mut self,
        machine: &Machine,
        store: &mut ResourceStore,
        mapper: &mut ResourceMapper,
    ) -> Result<(), ConfigError>;

    /// Wire related and dependent links once every broker has built its resources
    fn setup_resource_links(
        &mut self,
        machine: &Machine,
        store: &mut ResourceStore,
        mapper: &ResourceMapper,
    ) -> Result<(), ConfigError>;

    fn resource_count(&self) -> usize {
        self.core().resource_count()
    }

    fn clear(&mut self) {
        self.core_mut().clear_assignments();
    }
}

/// Every broker of the plan
pub enum Broker {
    InputFu(InputFuBroker),
    OutputFu(OutputFuBroker),
    ExecutionPipeline(ExecutionPipelineBroker),
    InputPSocket(InputPSocketBroker),
    ImmediateUnit(IuBroker),
    OutputPSocket(OutputPSocketBroker),
    Bus(BusBroker),
    InstructionTemplate(ITemplateBroker),
}

impl Broker {
    pub fn as_dyn(&self) -> &dyn ResourceBroker {
        match self {
            Broker::InputFu(b) => b,
            Broker::OutputFu(b) => b,
            Broker::ExecutionPipeline(b) => b,
            Broker::InputPSocket(b) => b,
            Broker::ImmediateUnit(b) => b,
            Broker::OutputPSocket(b) => b,
            Broker::Bus(b) => b,
            Broker::InstructionTemplate(b) => b,
        }
    }

    pub fn as_dyn_mut(&mut self) -> &mut dyn ResourceBroker {
        match self {
            Broker::InputFu(b) => b,
            Broker::OutputFu(b) => b,
            Broker::ExecutionPipeline(b) => b,
            Broker::InputPSocket(b) => b,
            Broker::ImmediateUnit(b) => b,
            Broker::OutputPSocket(b) => b,
            Broker::Bus(b) => b,
            Broker::InstructionTemplate(b) => b,
        }
    }

    pub fn kind(&self) -> BrokerKind {
        self.as_dyn().kind()
    }

    /// The default broker set in plan order
    pub fn default_set() -> Vec<Broker> {
        vec![
            Broker::InputFu(InputFuBroker::new()),
            Broker::OutputFu(OutputFuBroker::new()),
            Broker::ExecutionPipeline(ExecutionPipelineBroker::new()),
            Broker::InputPSocket(InputPSocketBroker::new()),
            Broker::ImmediateUnit(IuBroker::new()),
            Broker::OutputPSocket(OutputPSocketBroker::new()),
            Broker::Bus(BusBroker::new()),
            Broker::InstructionTemplate(ITemplateBroker::new()),
        ]
    }
}

/// Pipeline key of the operation `terminal` belongs to
pub(crate) fn op_key(node: &MoveNode, terminal: &Terminal) -> OpKey {
    terminal
        .program_operation()
        .map(OpKey::Program)
        .unwrap_or(OpKey::Lone(node.id))
}

/// Function unit another move of `op` is already bound to
pub(crate) fn operation_unit(block: &BasicBlock, op: OpId, except: NodeId) -> Option<FuId> {
    block
        .operation_nodes(op)
        .filter(|n| *n != except)
        .find_map(|n| {
            let other = &block.node(n).transport;
            [&other.destination, &other.source]
                .into_iter()
                .filter_map(|t| t.fu_terminal())
                .filter(|t| t.program_operation == Some(op))
                .find_map(|t| t.fu)
        })
}

/// Function units that may execute the operation behind `terminal`
///
/// A unit already bound on the terminal or preset by the client wins;
/// otherwise a unit chosen by another move of the same operation; otherwise
/// every unit implementing the operation.
pub(crate) fn candidate_units(
    machine: &Machine,
    block: &BasicBlock,
    node: NodeId,
    terminal: &Terminal,
    preset: Option<FuId>,
) -> Vec<FuId> {
    let fu_terminal = match terminal.fu_terminal() {
        Some(t) => t,
        None => return Vec::new(),
    };
    let sibling = fu_terminal
        .program_operation
        .and_then(|op| operation_unit(block, op, node));
    let forced = [fu_terminal.fu, preset, sibling];
    let mut forced = forced.iter().flatten();
    if let Some(first) = forced.next() {
        if forced.any(|other| other != first) {
            return Vec::new();
        }
        return if machine.function_unit(*first).has_operation(&fu_terminal.operation) {
            vec![*first]
        } else {
            Vec::new()
        };
    }
    machine.units_with_operation(&fu_terminal.operation).collect()
}

/// Ports the destination of `node` may be written through
pub(crate) fn destination_ports(machine: &Machine, node: &MoveNode) -> Vec<PortRef> {
    let destination = &node.transport.destination;
    if let Some(port) = destination.bound_port() {
        return vec![port];
    }
    match destination {
        Terminal::Register { rf, .. } => {
            let unit = UnitRef::RegisterFile(*rf);
            machine
                .ports_of(unit)
                .iter()
                .enumerate()
                .filter(|(_, p)| p.input_socket.is_some())
                .map(|(i, _)| PortRef::new(unit, i))
                .collect()
        }
        Terminal::FuPort(t) => {
            let units: Vec<FuId> = match t.fu {
                Some(fu) => vec![fu],
                None => machine.units_with_operation(&t.operation).collect(),
            };
            units
                .into_iter()
                .filter_map(|fu| {
                    let port = machine.function_unit(fu).operation(&t.operation)?.port_of(t.operand)?;
                    Some(PortRef::new(UnitRef::FunctionUnit(fu), port))
                })
                .filter(|p| machine.port(*p).input_socket.is_some())
                .collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::tta::instruction::Move;

    #[test]
    fn test_candidate_units_follow_sibling_moves() {
        let machine = Machine::from_config(&MachineConfig::default_test()).unwrap();
        let alu = machine.function_unit_by_name("ALU").unwrap();
        let rf = machine.register_file_by_name("RF").unwrap();
        let mut block = BasicBlock::new();
        let op = block.add_operation("add");
        let first = block.add_operand(op, 1, Terminal::register(rf, 1));
        let second = block.add_operand(op, 2, Terminal::register(rf, 2));

        let dst = block.node(second).transport.destination.clone();
        assert_eq!(candidate_units(&machine, &block, second, &dst, None), vec![alu]);

        if let Terminal::FuPort(t) = &mut block.node_mut(first).transport.destination {
            t.fu = Some(alu);
        }
        assert_eq!(operation_unit(&block, op, second), Some(alu));
        let mul = machine.function_unit_by_name("MUL").unwrap();
        assert!(candidate_units(&machine, &block, second, &dst, Some(mul)).is_empty());
    }

    #[test]
    fn test_destination_ports_of_register() {
        let machine = Machine::from_config(&MachineConfig::default_test()).unwrap();
        let rf = machine.register_file_by_name("RF").unwrap();
        let mut block = BasicBlock::new();
        let n = block.add_move(Move::new(Terminal::immediate(1, 32), Terminal::register(rf, 0)));
        let ports = destination_ports(&machine, block.node(n));
        assert_eq!(ports.len(), 1);
        assert_eq!(machine.port_name(ports[0]), "RF.w1");
    }

    #[test]
    fn test_cycle_bound() {
        assert_eq!(CycleBound::Cycle(3).cycle(), Some(3));
        assert!(CycleBound::Unbounded.is_feasible());
        assert!(!CycleBound::Infeasible.is_feasible());
        assert_eq!(CycleBound::Infeasible.to_string(), "infeasible");
    }
}
