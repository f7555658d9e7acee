// src/broker/pipeline.rs
//! Execution pipeline broker
//!
//! Never assigns anything itself: the pipeline resources it builds are
//! reserved through the function unit sides. It narrows earliest and latest
//! cycle searches using the operand and result moves of the same operation
//! that are already placed.

use super::{
    AssignContext, AssignRequest, BrokerContext, BrokerCore, BrokerKind, CycleBound, MachinePart, ResourceBroker,
    ResourceMapper,
};
use crate::config::ConfigError;
use crate::error::{RmError, RmResult};
use crate::resource::pipeline::PipelineState;
use crate::resource::{ResourceId, ResourceKind, ResourceState, ResourceStore};
use crate::tta::instruction::{BasicBlock, MoveNode, NodeId, OpId};
use crate::tta::processor::{FuId, Machine};

#[derive(Default)]
pub struct ExecutionPipelineBroker {
    core: BrokerCore,
    longest_latency: i32,
}

/// A placed move of the same operation
struct Placed {
    cycle: i32,
    fu: Option<FuId>,
    triggers: bool,
    latency: i32,
}

fn placed_moves(machine: &Machine, block: &BasicBlock, op: OpId, except: NodeId, inputs: bool) -> Vec<Placed> {
    let operation = block.operation(op);
    let nodes = if inputs { &operation.inputs } else { &operation.outputs };
    nodes
        .iter()
        .filter(|n| **n != except)
        .map(|n| block.node(*n))
        .filter_map(|other| {
            let cycle = other.cycle?;
            let terminal = if inputs {
                &other.transport.destination
            } else {
                &other.transport.source
            };
            let fu = terminal.fu_terminal().and_then(|t| t.fu);
            let triggers = terminal
                .bound_port()
                .map(|p| machine.port(p).triggering)
                .unwrap_or(false);
            let latency = fu
                .and_then(|fu| machine.function_unit(fu).operation(&operation.operation))
                .map(|hw| hw.latency as i32)
                .unwrap_or(0);
            Some(Placed {
                cycle,
                fu,
                triggers,
                latency,
            })
        })
        .collect()
}

/// Does `node` write the triggering port of the unit its siblings use
fn writes_trigger(machine: &Machine, block: &BasicBlock, node: &MoveNode, op: OpId) -> bool {
    let terminal = match node.transport.destination.fu_terminal() {
        Some(t) => t,
        None => return false,
    };
    let fu = terminal.fu.or_else(|| {
        placed_moves(machine, block, op, node.id, true)
            .into_iter()
            .chain(placed_moves(machine, block, op, node.id, false))
            .find_map(|p| p.fu)
    });
    fu.and_then(|fu| {
        let unit = machine.function_unit(fu);
        let port = unit.operation(&terminal.operation)?.port_of(terminal.operand)?;
        Some(unit.ports[port].triggering)
    })
    .unwrap_or(false)
}

fn mismatch(fu: Option<FuId>, wanted: Option<FuId>) -> bool {
    matches!((fu, wanted), (Some(a), Some(b)) if a != b)
}

impl ExecutionPipelineBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Longest operation latency of any unit
    pub fn longest_latency(&self) -> i32 {
        self.longest_latency
    }

    /// Highest cycle any pipeline holds a reservation in
    pub fn highest_known_cycle(&self, store: &ResourceStore) -> Option<i32> {
        store.highest_cycle_of(ResourceKind::ExecutionPipeline)
    }

    /// Earliest result read: after every placed operand, and after the trigger's latency
    fn earliest_from_source(&self, ctx: &BrokerContext<'_>, cycle: i32, node: &MoveNode, src_fu: Option<FuId>) -> Option<i32> {
        let op = match node.source_operation() {
            Some(op) => op,
            None => return Some(cycle),
        };
        let mut earliest: Option<i32> = None;
        for input in placed_moves(ctx.machine, ctx.block, op, node.id, true) {
            if mismatch(input.fu, src_fu) {
                return None;
            }
            let bound = if input.triggers {
                input.cycle + input.latency
            } else {
                input.cycle + 1
            };
            earliest = Some(earliest.map_or(bound, |e| e.max(bound)));
        }
        // an unplaced operation cannot deliver results in its first cycle
        Some(earliest.unwrap_or(1).max(cycle))
    }

    /// Earliest operand write: not after the trigger, a trigger not before other operands
    fn earliest_from_destination(
        &self,
        ctx: &BrokerContext<'_>,
        cycle: i32,
        node: &MoveNode,
        dst_fu: Option<FuId>,
    ) -> Option<i32> {
        let op = match node.destination_operation() {
            Some(op) => op,
            None => return Some(cycle),
        };
        let triggers = writes_trigger(ctx.machine, ctx.block, node, op);
        let mut earliest = cycle;
        for input in placed_moves(ctx.machine, ctx.block, op, node.id, true) {
            if mismatch(input.fu, dst_fu) {
                return None;
            }
            if triggers {
                earliest = earliest.max(input.cycle);
            }
            if input.triggers && input.cycle < cycle {
                return None;
            }
        }
        for output in placed_moves(ctx.machine, ctx.block, op, node.id, false) {
            if mismatch(output.fu, dst_fu) {
                return None;
            }
            if output.cycle - output.latency < earliest {
                return None;
            }
        }
        Some(earliest)
    }

    /// Latest result read given the placed trigger
    fn latest_from_source(&self, ctx: &BrokerContext<'_>, cycle: i32, node: &MoveNode, src_fu: Option<FuId>) -> Option<i32> {
        let op = match node.source_operation() {
            Some(op) => op,
            None => return Some(cycle),
        };
        let inputs = placed_moves(ctx.machine, ctx.block, op, node.id, true);
        if inputs.iter().any(|i| mismatch(i.fu, src_fu)) {
            return None;
        }
        match inputs.iter().find(|i| i.triggers) {
            Some(trigger) if trigger.cycle + trigger.latency > cycle => None,
            Some(_) => Some(cycle),
            None if inputs.iter().any(|i| i.cycle >= cycle) => None,
            None => Some(cycle),
        }
    }

    /// Latest operand write: no later than the trigger and early enough for placed result reads
    fn latest_from_destination(&self, ctx: &BrokerContext<'_>, cycle: i32, node: &MoveNode, dst_fu: Option<FuId>) -> Option<i32> {
        let op = match node.destination_operation() {
            Some(op) => op,
            None => return Some(cycle),
        };
        let mut latest = cycle;
        for input in placed_moves(ctx.machine, ctx.block, op, node.id, true) {
            if input.triggers {
                latest = latest.min(input.cycle);
            }
        }
        for output in placed_moves(ctx.machine, ctx.block, op, node.id, false) {
            if mismatch(output.fu, dst_fu) {
                return None;
            }
            latest = latest.min(output.cycle - output.latency);
        }
        Some(latest)
    }
}

impl ResourceBroker for ExecutionPipelineBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::ExecutionPipeline
    }

    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        &mut self.core
    }

    fn is_applicable(&self, _ctx: &BrokerContext<'_>, _node: NodeId, _request: &AssignRequest) -> bool {
        false
    }

    fn all_available_resources(
        &self,
        _ctx: &BrokerContext<'_>,
        _cycle: i32,
        _node: NodeId,
        _request: &AssignRequest,
    ) -> Vec<ResourceId> {
        Vec::new()
    }

    fn assign(
        &mut self,
        _ctx: &mut AssignContext<'_>,
        _cycle: i32,
        _node: NodeId,
        _resource: ResourceId,
        _request: &AssignRequest,
    ) -> RmResult<()> {
        Err(RmError::NotImplemented {
            broker: self.kind().to_string(),
            method: "assign",
        })
    }

    fn unassign(&mut self, _ctx: &mut AssignContext<'_>, _node: NodeId) -> RmResult<()> {
        Ok(())
    }

    fn earliest_cycle(
        &self,
        ctx: &BrokerContext<'_>,
        cycle: i32,
        node: NodeId,
        request: &AssignRequest,
    ) -> RmResult<CycleBound> {
        let moved = ctx.node(node);
        let mut from_source = match self.earliest_from_source(ctx, cycle, moved, request.src_fu) {
            Some(c) => c,
            None => return Ok(CycleBound::Infeasible),
        };
        let mut from_destination = match self.earliest_from_destination(ctx, from_source, moved, request.dst_fu) {
            Some(c) => c,
            None => return Ok(CycleBound::Infeasible),
        };
        while from_source != from_destination {
            from_source = match self.earliest_from_source(ctx, from_destination, moved, request.src_fu) {
                Some(c) => c,
                None => return Ok(CycleBound::Infeasible),
            };
            if from_source == from_destination {
                break;
            }
            from_destination = match self.earliest_from_destination(ctx, from_source, moved, request.dst_fu) {
                Some(c) => c,
                None => return Ok(CycleBound::Infeasible),
            };
        }
        Ok(CycleBound::Cycle(from_destination))
    }

    fn latest_cycle(
        &self,
        ctx: &BrokerContext<'_>,
        cycle: i32,
        node: NodeId,
        request: &AssignRequest,
    ) -> RmResult<CycleBound> {
        let moved = ctx.node(node);
        let latest = self
            .latest_from_source(ctx, cycle, moved, request.src_fu)
            .and_then(|c| self.latest_from_destination(ctx, c, moved, request.dst_fu));
        Ok(match latest {
            Some(i32::MAX) => CycleBound::Unbounded,
            Some(c) if c >= 0 => CycleBound::Cycle(c),
            _ => CycleBound::Infeasible,
        })
    }

    fn build_resources(
        &mut self,
        machine: &Machine,
        store: &mut ResourceStore,
        mapper: &mut ResourceMapper,
    ) -> Result<(), ConfigError> {
        for fu in machine.function_unit_ids() {
            let unit = machine.function_unit(fu);
            let id = store.add(
                format!("{}.pipeline", unit.name),
                ResourceState::ExecutionPipeline(PipelineState::new(unit)),
            );
            mapper.add(MachinePart::FunctionUnit(fu), ResourceKind::ExecutionPipeline, id);
            self.core.add_resource(MachinePart::FunctionUnit(fu), id);
            self.longest_latency = self.longest_latency.max(unit.max_latency() as i32);
        }
        Ok(())
    }

    fn setup_resource_links(
        &mut self,
        machine: &Machine,
        store: &mut ResourceStore,
        mapper: &ResourceMapper,
    ) -> Result<(), ConfigError> {
        for (part, id) in self.core.resources() {
            let fu = match part {
                MachinePart::FunctionUnit(fu) => fu,
                _ => continue,
            };
            let name = &machine.function_unit(fu).name;
            let input = mapper.require(part, ResourceKind::InputFu, name)?;
            let output = mapper.require(part, ResourceKind::OutputFu, name)?;
            store.add_related(id, 0, input);
            store.add_related(id, 0, output);
        }
        Ok(())
    }
}
