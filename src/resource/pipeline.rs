// src/resource/pipeline.rs
//! Execution pipeline of one function unit
//!
//! Tracks operand writes, triggers and result reads per port together with
//! the internal pipeline resources each triggered operation occupies. A
//! value written to a port lives from its write until the last move that
//! consumes it (the trigger for operands, the last result read for
//! results); two operations may not have overlapping lifetimes on one port.

use super::Occupancy;
use crate::tta::functional_unit::{FunctionUnit, PipelineUsage};
use crate::tta::instruction::{NodeId, OpId};
use std::collections::BTreeMap;

/// Timing of one hardware operation, copied from the machine description
#[derive(Clone, Debug)]
pub struct OperationTiming {
    pub latency: u32,
    pub usage: Vec<PipelineUsage>,
    /// Ports the operation writes results to
    pub result_ports: Vec<usize>,
}

/// Program operation a port access belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKey {
    Program(OpId),
    /// A move that is not part of a program operation
    Lone(NodeId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortAccess {
    Operand,
    Trigger,
    Result,
}

/// One port access of a move
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Access {
    pub node: NodeId,
    pub op: OpKey,
    pub cycle: i32,
    pub port: usize,
    pub hw_op: usize,
    pub kind: PortAccess,
}

#[derive(Clone, Debug)]
pub struct PipelineState {
    operations: Vec<OperationTiming>,
    accesses: Vec<Access>,
    stages: BTreeMap<(i32, usize), NodeId>,
}

fn overlaps(a: (i32, i32), b: (i32, i32)) -> bool {
    a.0 <= b.1 && b.0 <= a.1
}

impl PipelineState {
    pub fn new(fu: &FunctionUnit) -> Self {
        let operations = fu
            .operations
            .iter()
            .map(|op| OperationTiming {
                latency: op.latency,
                usage: op.pipeline.clone(),
                result_ports: op
                    .bindings
                    .iter()
                    .filter(|(_, port)| fu.ports[*port].output_socket.is_some())
                    .map(|(_, port)| *port)
                    .collect(),
            })
            .collect();
        Self {
            operations,
            accesses: Vec::new(),
            stages: BTreeMap::new(),
        }
    }

    pub fn latency(&self, hw_op: usize) -> i32 {
        self.operations.get(hw_op).map(|t| t.latency as i32).unwrap_or(0)
    }

    pub fn accesses(&self) -> &[Access] {
        &self.accesses
    }

    pub fn access_of(&self, node: NodeId) -> Option<&Access> {
        self.accesses.iter().find(|a| a.node == node)
    }

    fn trigger_of(&self, op: OpKey, except: Option<NodeId>) -> Option<&Access> {
        self.accesses
            .iter()
            .find(|a| a.op == op && a.kind == PortAccess::Trigger && Some(a.node) != except)
    }

    /// Write..last-read intervals of results of operations other than `op` on `port`
    fn result_lifetimes(&self, port: usize, op: OpKey) -> Vec<(i32, i32)> {
        self.accesses
            .iter()
            .filter(|t| t.kind == PortAccess::Trigger && t.op != op)
            .filter(|t| {
                self.operations
                    .get(t.hw_op)
                    .map(|timing| timing.result_ports.contains(&port))
                    .unwrap_or(false)
            })
            .map(|t| {
                let write = t.cycle + self.latency(t.hw_op);
                let last_read = self.last_read(t.op, port, None).unwrap_or(write);
                (write, last_read.max(write))
            })
            .collect()
    }

    /// Write..trigger intervals of operands of operations other than `op` on `port`
    fn operand_lifetimes(&self, port: usize, op: OpKey) -> Vec<(i32, i32)> {
        self.accesses
            .iter()
            .filter(|a| a.port == port && a.op != op)
            .filter(|a| a.kind != PortAccess::Result)
            .map(|a| {
                let end = self
                    .trigger_of(a.op, None)
                    .map(|t| t.cycle)
                    .unwrap_or(a.cycle);
                (a.cycle, end.max(a.cycle))
            })
            .collect()
    }

    fn last_read(&self, op: OpKey, port: usize, except: Option<NodeId>) -> Option<i32> {
        self.accesses
            .iter()
            .filter(|a| a.op == op && a.port == port && a.kind == PortAccess::Result)
            .filter(|a| Some(a.node) != except)
            .map(|a| a.cycle)
            .max()
    }

    /// Can `node` write operand `port` of `op` at `cycle`
    pub fn can_write_operand(&self, cycle: i32, node: NodeId, port: usize, op: OpKey) -> bool {
        let end = match self.trigger_of(op, Some(node)) {
            Some(trigger) if cycle > trigger.cycle => return false,
            Some(trigger) => trigger.cycle,
            None => cycle,
        };
        self.operand_lifetimes(port, op)
            .into_iter()
            .all(|other| !overlaps((cycle, end), other))
    }

    /// Can `node` trigger hardware operation `hw_op` of `op` through `port` at `cycle`
    pub fn can_trigger(&self, cycle: i32, node: NodeId, port: usize, hw_op: usize, op: OpKey) -> bool {
        let timing = match self.operations.get(hw_op) {
            Some(timing) => timing,
            None => return false,
        };

        // pipeline resources
        for usage in &timing.usage {
            let first = cycle + usage.start as i32;
            for c in first..first + usage.cycles as i32 {
                if let Some(holder) = self.stages.get(&(c, usage.resource)) {
                    if *holder != node {
                        return false;
                    }
                }
            }
        }

        // operands already written must stay intact until the trigger
        let mut operand_spans = vec![(port, cycle, cycle)];
        for access in self.accesses.iter() {
            if access.op == op && access.kind == PortAccess::Operand && access.node != node {
                if access.cycle > cycle {
                    return false;
                }
                operand_spans.push((access.port, access.cycle, cycle));
            }
        }
        for (p, start, end) in operand_spans {
            if self
                .operand_lifetimes(p, op)
                .into_iter()
                .any(|other| overlaps((start, end), other))
            {
                return false;
            }
        }

        // results must not be read before they are ready or overwritten before they are read
        let write = cycle + timing.latency as i32;
        for access in self.accesses.iter() {
            if access.op == op && access.kind == PortAccess::Result && access.cycle < write {
                return false;
            }
        }
        for result_port in &timing.result_ports {
            let last = self.last_read(op, *result_port, None).unwrap_or(write);
            if self
                .result_lifetimes(*result_port, op)
                .into_iter()
                .any(|other| overlaps((write, last.max(write)), other))
            {
                return false;
            }
        }
        true
    }

    /// Can `node` read result `port` of `op` at `cycle`
    pub fn can_read_result(&self, cycle: i32, node: NodeId, port: usize, op: OpKey) -> bool {
        let trigger = match self.trigger_of(op, Some(node)) {
            Some(trigger) => *trigger,
            None => return true,
        };
        let write = trigger.cycle + self.latency(trigger.hw_op);
        if cycle < write {
            return false;
        }
        let last = self.last_read(op, port, Some(node)).unwrap_or(cycle).max(cycle);
        self.result_lifetimes(port, op)
            .into_iter()
            .all(|other| !overlaps((write, last), other))
    }

    /// Record a port access; the trigger also reserves its pipeline resources
    pub fn assign(&mut self, access: Access) {
        if self.accesses.contains(&access) {
            return;
        }
        if access.kind == PortAccess::Trigger {
            if let Some(timing) = self.operations.get(access.hw_op) {
                for usage in &timing.usage {
                    let first = access.cycle + usage.start as i32;
                    for c in first..first + usage.cycles as i32 {
                        self.stages.insert((c, usage.resource), access.node);
                    }
                }
            }
        }
        self.accesses.push(access);
    }

    /// Drop the result reads of `node`, or its operand writes and trigger
    /// when `results` is false; false if it had none
    ///
    /// A bypass move reads one unit and writes another (or the same) unit,
    /// so each side releases only its own accesses.
    pub fn unassign(&mut self, node: NodeId, results: bool) -> bool {
        let before = self.accesses.len();
        self.accesses
            .retain(|a| a.node != node || (a.kind == PortAccess::Result) != results);
        if !results {
            self.stages.retain(|_, holder| *holder != node);
        }
        self.accesses.len() != before
    }
}

impl Occupancy for PipelineState {
    fn is_in_use(&self, cycle: i32) -> bool {
        self.stages.keys().any(|(c, _)| *c == cycle)
            || self
                .accesses
                .iter()
                .any(|a| a.kind == PortAccess::Trigger && a.cycle == cycle)
    }

    fn is_available(&self, cycle: i32) -> bool {
        !self.is_in_use(cycle)
    }

    fn highest_cycle(&self) -> Option<i32> {
        let accesses = self.accesses.iter().map(|a| match a.kind {
            PortAccess::Trigger => a.cycle + self.latency(a.hw_op),
            _ => a.cycle,
        });
        let stages = self.stages.keys().map(|(c, _)| *c);
        accesses.chain(stages).max()
    }

    fn clear(&mut self) {
        self.accesses.clear();
        self.stages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::tta::processor::Machine;

    const IN1T: usize = 0;
    const IN2: usize = 1;
    const OUT1: usize = 2;

    fn mul_pipeline() -> PipelineState {
        let machine = Machine::from_config(&MachineConfig::default_test()).unwrap();
        let mul = machine.function_unit_by_name("MUL").unwrap();
        PipelineState::new(machine.function_unit(mul))
    }

    fn access(node: usize, op: usize, cycle: i32, port: usize, kind: PortAccess) -> Access {
        Access {
            node: NodeId(node),
            op: OpKey::Program(OpId(op)),
            cycle,
            port,
            hw_op: 0,
            kind,
        }
    }

    #[test]
    fn test_pipeline_resource_conflict() {
        let mut pipe = mul_pipeline();
        pipe.assign(access(0, 0, 4, IN1T, PortAccess::Trigger));
        // multiplier stage held for cycles 4 and 5
        assert!(!pipe.can_trigger(5, NodeId(1), IN1T, 0, OpKey::Program(OpId(1))));
        assert!(pipe.can_trigger(6, NodeId(1), IN1T, 0, OpKey::Program(OpId(1))));
        assert!(pipe.is_in_use(5));
        assert_eq!(pipe.highest_cycle(), Some(7));
    }

    #[test]
    fn test_result_after_latency() {
        let mut pipe = mul_pipeline();
        pipe.assign(access(0, 0, 2, IN1T, PortAccess::Trigger));
        let op = OpKey::Program(OpId(0));
        assert!(!pipe.can_read_result(4, NodeId(1), OUT1, op));
        assert!(pipe.can_read_result(5, NodeId(1), OUT1, op));
    }

    #[test]
    fn test_operand_before_trigger() {
        let mut pipe = mul_pipeline();
        pipe.assign(access(0, 0, 3, IN1T, PortAccess::Trigger));
        let op = OpKey::Program(OpId(0));
        assert!(pipe.can_write_operand(3, NodeId(1), IN2, op));
        assert!(!pipe.can_write_operand(4, NodeId(1), IN2, op));
    }

    #[test]
    fn test_operand_not_clobbered() {
        let mut pipe = mul_pipeline();
        pipe.assign(access(0, 0, 1, IN2, PortAccess::Operand));
        pipe.assign(access(1, 0, 4, IN1T, PortAccess::Trigger));
        // another operation writing in2 between the operand write and the trigger
        assert!(!pipe.can_write_operand(2, NodeId(2), IN2, OpKey::Program(OpId(1))));
        assert!(pipe.can_write_operand(5, NodeId(2), IN2, OpKey::Program(OpId(1))));
    }

    #[test]
    fn test_result_not_overwritten_before_read() {
        let mut pipe = mul_pipeline();
        pipe.assign(access(0, 0, 0, IN1T, PortAccess::Trigger));
        pipe.assign(access(1, 0, 8, OUT1, PortAccess::Result));
        // second multiply would write out1 at 5, before the read at 8
        assert!(!pipe.can_trigger(2, NodeId(2), IN1T, 0, OpKey::Program(OpId(1))));
        assert!(pipe.can_trigger(6, NodeId(2), IN1T, 0, OpKey::Program(OpId(1))));
    }

    #[test]
    fn test_bypass_sides_release_separately() {
        let mut pipe = mul_pipeline();
        let first = OpKey::Program(OpId(0));
        pipe.assign(access(0, 0, 0, IN1T, PortAccess::Trigger));
        // node 1 reads the first result and triggers the second multiply
        pipe.assign(access(1, 0, 3, OUT1, PortAccess::Result));
        pipe.assign(access(1, 1, 3, IN1T, PortAccess::Trigger));

        assert!(pipe.unassign(NodeId(1), true));
        assert!(pipe.can_read_result(3, NodeId(2), OUT1, first));
        assert!(!pipe.can_trigger(4, NodeId(2), IN1T, 0, OpKey::Program(OpId(2))));
        assert!(pipe.unassign(NodeId(1), false));
        assert!(pipe.can_trigger(4, NodeId(2), IN1T, 0, OpKey::Program(OpId(2))));
    }

    #[test]
    fn test_unassign_releases_stages() {
        let mut pipe = mul_pipeline();
        pipe.assign(access(0, 0, 4, IN1T, PortAccess::Trigger));
        assert!(!pipe.unassign(NodeId(0), true));
        assert!(pipe.unassign(NodeId(0), false));
        assert!(!pipe.unassign(NodeId(0), false));
        assert!(pipe.can_trigger(5, NodeId(1), IN1T, 0, OpKey::Program(OpId(1))));
        assert_eq!(pipe.highest_cycle(), None);
    }
}
