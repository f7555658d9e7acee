// src/tta/instruction.rs
//! Program representation placed by the resource manager
//!
//! The client owns a [`BasicBlock`] of move nodes. Brokers read the moves
//! to decide what they need and rewrite their terminals to bind concrete
//! ports, registers and buses as a side effect of a successful assignment.

use crate::tta::processor::{BusId, FuId, Guard, IuId, Machine, PortRef, RfId, TemplateId, UnitRef};

/// Handle of a move node inside a [`BasicBlock`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Handle of a program operation inside a [`BasicBlock`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Constant carried by a move
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImmediateValue {
    pub value: i64,
    /// Width of the constant in bits
    pub width: u32,
    /// Instruction address references cannot be narrowed
    pub is_address: bool,
}

impl ImmediateValue {
    pub fn new(value: i64, width: u32) -> Self {
        Self { value, width, is_address: false }
    }

    pub fn address(value: i64, width: u32) -> Self {
        Self { value, width, is_address: true }
    }
}

/// Operation operand terminal; `fu` and `port` are bound by the FU brokers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuTerminal {
    /// Lower case operation name
    pub operation: String,
    /// Operand index, inputs first, 1-based
    pub operand: u32,
    pub program_operation: Option<OpId>,
    pub fu: Option<FuId>,
    pub port: Option<usize>,
}

/// Source or destination of a move
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminal {
    Immediate(ImmediateValue),
    /// General purpose register; `port` is bound by the socket brokers
    Register { rf: RfId, index: usize, port: Option<usize> },
    /// Long immediate register read
    ImmediateRegister { iu: IuId, index: usize, port: Option<usize> },
    FuPort(FuTerminal),
}

impl Terminal {
    pub fn immediate(value: i64, width: u32) -> Self {
        Terminal::Immediate(ImmediateValue::new(value, width))
    }

    pub fn register(rf: RfId, index: usize) -> Self {
        Terminal::Register { rf, index, port: None }
    }

    /// Operand of an operation not yet bound to a function unit
    pub fn operand(operation: &str, operand: u32, program_operation: Option<OpId>) -> Self {
        Terminal::FuPort(FuTerminal {
            operation: operation.to_lowercase(),
            operand,
            program_operation,
            fu: None,
            port: None,
        })
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, Terminal::Immediate(_))
    }

    pub fn is_gpr(&self) -> bool {
        matches!(self, Terminal::Register { .. })
    }

    pub fn is_immediate_register(&self) -> bool {
        matches!(self, Terminal::ImmediateRegister { .. })
    }

    pub fn is_fu_port(&self) -> bool {
        matches!(self, Terminal::FuPort(_))
    }

    pub fn immediate_value(&self) -> Option<ImmediateValue> {
        match self {
            Terminal::Immediate(imm) => Some(*imm),
            _ => None,
        }
    }

    pub fn fu_terminal(&self) -> Option<&FuTerminal> {
        match self {
            Terminal::FuPort(t) => Some(t),
            _ => None,
        }
    }

    pub fn program_operation(&self) -> Option<OpId> {
        self.fu_terminal().and_then(|t| t.program_operation)
    }

    /// Concrete port once bound
    pub fn bound_port(&self) -> Option<PortRef> {
        match self {
            Terminal::Immediate(_) => None,
            Terminal::Register { rf, port, .. } => port.map(|p| PortRef::new(UnitRef::RegisterFile(*rf), p)),
            Terminal::ImmediateRegister { iu, port, .. } => {
                port.map(|p| PortRef::new(UnitRef::ImmediateUnit(*iu), p))
            }
            Terminal::FuPort(t) => match (t.fu, t.port) {
                (Some(fu), Some(port)) => Some(PortRef::new(UnitRef::FunctionUnit(fu), port)),
                _ => None,
            },
        }
    }

    /// Same terminal with the port binding replaced
    pub fn with_port(&self, port: usize) -> Self {
        let mut bound = self.clone();
        match &mut bound {
            Terminal::Register { port: p, .. } | Terminal::ImmediateRegister { port: p, .. } => *p = Some(port),
            Terminal::FuPort(t) => t.port = Some(port),
            Terminal::Immediate(_) => {}
        }
        bound
    }

    pub fn describe(&self, machine: &Machine) -> String {
        match self {
            Terminal::Immediate(imm) => format!("#{}", imm.value),
            Terminal::Register { rf, index, .. } => format!("{}.{}", machine.register_file(*rf).name, index),
            Terminal::ImmediateRegister { iu, index, .. } => {
                format!("{}.{}", machine.immediate_unit(*iu).name, index)
            }
            Terminal::FuPort(t) => match t.fu {
                Some(fu) => format!("{}.{}.{}", machine.function_unit(fu).name, t.operation, t.operand),
                None => format!("?.{}.{}", t.operation, t.operand),
            },
        }
    }
}

/// A data transport from `source` to `destination`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Move {
    pub source: Terminal,
    pub destination: Terminal,
    pub guard: Option<Guard>,
    /// Bus carrying the move, bound by the bus broker or preset by the client
    pub bus: Option<BusId>,
}

impl Move {
    pub fn new(source: Terminal, destination: Terminal) -> Self {
        Self {
            source,
            destination,
            guard: None,
            bus: None,
        }
    }

    pub fn guarded(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn is_unconditional(&self) -> bool {
        self.guard.is_none()
    }

    pub fn describe(&self, machine: &Machine) -> String {
        let guard = match &self.guard {
            Some(Guard::Register { rf, index, inverted }) => format!(
                "{}{}.{} ",
                if *inverted { '!' } else { '?' },
                machine.register_file(*rf).name,
                index
            ),
            Some(guard) => format!("{} ", guard),
            None => String::new(),
        };
        let bus = match self.bus {
            Some(bus) => format!(" [{}]", machine.bus(bus).name),
            None => String::new(),
        };
        format!(
            "{}{} -> {}{}",
            guard,
            self.source.describe(machine),
            self.destination.describe(machine),
            bus
        )
    }
}

/// A move and its placement state
#[derive(Clone, Debug)]
pub struct MoveNode {
    pub id: NodeId,
    pub transport: Move,
    /// Cycle the move is placed at
    pub cycle: Option<i32>,
    /// Force the constant source through a long immediate
    pub requires_long_immediate: bool,
}

impl MoveNode {
    pub fn is_placed(&self) -> bool {
        self.cycle.is_some()
    }

    pub fn source_operation(&self) -> Option<OpId> {
        self.transport.source.program_operation()
    }

    pub fn destination_operation(&self) -> Option<OpId> {
        self.transport.destination.program_operation()
    }
}

/// One execution of an operation: its operand writes and result reads
#[derive(Clone, Debug)]
pub struct ProgramOperation {
    pub id: OpId,
    pub operation: String,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

/// Moves of one basic block, owned by the client
#[derive(Clone, Debug, Default)]
pub struct BasicBlock {
    nodes: Vec<MoveNode>,
    operations: Vec<ProgramOperation>,
}

impl BasicBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a move; operand terminals register it with their program operations
    pub fn add_move(&mut self, transport: Move) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(op) = transport.destination.program_operation() {
            if let Some(op) = self.operations.get_mut(op.0) {
                op.inputs.push(id);
            }
        }
        if let Some(op) = transport.source.program_operation() {
            if let Some(op) = self.operations.get_mut(op.0) {
                op.outputs.push(id);
            }
        }
        self.nodes.push(MoveNode {
            id,
            transport,
            cycle: None,
            requires_long_immediate: false,
        });
        id
    }

    pub fn add_operation(&mut self, operation: &str) -> OpId {
        let id = OpId(self.operations.len());
        self.operations.push(ProgramOperation {
            id,
            operation: operation.to_lowercase(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        });
        id
    }

    /// Add a move writing operand `operand` of `op`
    pub fn add_operand(&mut self, op: OpId, operand: u32, source: Terminal) -> NodeId {
        let name = self.operations[op.0].operation.clone();
        self.add_move(Move::new(source, Terminal::operand(&name, operand, Some(op))))
    }

    /// Add a move reading result operand `operand` of `op`
    pub fn add_result(&mut self, op: OpId, operand: u32, destination: Terminal) -> NodeId {
        let name = self.operations[op.0].operation.clone();
        self.add_move(Move::new(Terminal::operand(&name, operand, Some(op)), destination))
    }

    pub fn node(&self, id: NodeId) -> &MoveNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut MoveNode {
        &mut self.nodes[id.0]
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &MoveNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn operation(&self, id: OpId) -> &ProgramOperation {
        &self.operations[id.0]
    }

    pub fn operations(&self) -> impl Iterator<Item = &ProgramOperation> {
        self.operations.iter()
    }

    /// Every move of a program operation, inputs first
    pub fn operation_nodes(&self, id: OpId) -> impl Iterator<Item = NodeId> + '_ {
        let op = &self.operations[id.0];
        op.inputs.iter().chain(op.outputs.iter()).copied()
    }
}

/// Long immediate written by an instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Immediate {
    pub value: ImmediateValue,
    pub destination: IuId,
    pub register: usize,
}

/// Everything issued in one cycle
#[derive(Clone, Debug, Default)]
pub struct Instruction {
    pub template: Option<TemplateId>,
    pub moves: Vec<NodeId>,
    pub immediates: Vec<Immediate>,
}

impl Instruction {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.immediates.is_empty()
    }

    pub fn describe(&self, machine: &Machine, block: &BasicBlock) -> String {
        let template = self
            .template
            .map(|t| machine.template(t).name.clone())
            .unwrap_or_else(|| "-".to_string());
        let mut parts: Vec<String> = self
            .moves
            .iter()
            .filter(|n| block.contains(**n))
            .map(|n| block.node(*n).transport.describe(machine))
            .collect();
        for imm in &self.immediates {
            parts.push(format!(
                "[{}.{}=#{}]",
                machine.immediate_unit(imm.destination).name,
                imm.register,
                imm.value.value
            ));
        }
        format!("<{}> {}", template, parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_builder() {
        let mut block = BasicBlock::new();
        let add = block.add_operation("ADD");
        let a = block.add_operand(add, 1, Terminal::register(RfId(0), 1));
        let b = block.add_operand(add, 2, Terminal::immediate(5, 32));
        let r = block.add_result(add, 3, Terminal::register(RfId(0), 2));

        assert_eq!(block.operation(add).operation, "add");
        assert_eq!(block.operation_nodes(add).collect::<Vec<_>>(), vec![a, b, r]);
        assert_eq!(block.node(a).destination_operation(), Some(add));
        assert_eq!(block.node(r).source_operation(), Some(add));
        assert!(!block.node(a).is_placed());

        // a bypass belongs to both operations
        let mul = block.add_operation("mul");
        let bypass = block.add_move(Move::new(
            Terminal::operand("add", 3, Some(add)),
            Terminal::operand("mul", 1, Some(mul)),
        ));
        assert_eq!(block.operation(add).outputs, vec![r, bypass]);
        assert_eq!(block.operation(mul).inputs, vec![bypass]);
    }

    #[test]
    fn test_terminal_port_binding() {
        let reg = Terminal::register(RfId(1), 3);
        assert_eq!(reg.bound_port(), None);
        let bound = reg.with_port(0);
        assert_eq!(bound.bound_port(), Some(PortRef::new(UnitRef::RegisterFile(RfId(1)), 0)));
        assert!(bound.is_gpr());

        let imm = Terminal::immediate(-3, 32);
        assert_eq!(imm.with_port(2), imm);
        assert_eq!(imm.immediate_value().map(|v| v.value), Some(-3));
    }
}
