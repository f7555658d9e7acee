// src/broker/output_fu.rs
//! Chooses the function unit a result is read from

use super::{
    candidate_units, op_key, AssignContext, AssignRequest, Assignment, BrokerContext, BrokerCore, BrokerKind,
    MachinePart, ResourceBroker, ResourceMapper, Restore,
};
use crate::config::ConfigError;
use crate::error::{RmError, RmResult};
use crate::resource::function_unit::{FU_PIPELINE, FU_SOCKETS};
use crate::resource::pipeline::{Access, PortAccess};
use crate::resource::{FuSideState, ReadSource, ResourceId, ResourceKind, ResourceState, ResourceStore};
use crate::tta::instruction::{MoveNode, NodeId, Terminal};
use crate::tta::processor::{FuId, Machine, PortRef, SocketId, UnitRef};

#[derive(Default)]
pub struct OutputFuBroker {
    core: BrokerCore,
}

fn result_access(machine: &Machine, node: &MoveNode, fu: FuId, cycle: i32) -> Option<(SocketId, ReadSource, Access)> {
    let terminal = node.transport.source.fu_terminal()?;
    let unit = machine.function_unit(fu);
    let hw_op = unit.operation_index(&terminal.operation)?;
    let port = unit.operations[hw_op].port_of(terminal.operand)?;
    let socket = unit.ports[port].output_socket?;
    let source = ReadSource {
        port: PortRef::new(UnitRef::FunctionUnit(fu), port),
        register: None,
    };
    let access = Access {
        node: node.id,
        op: op_key(node, &node.transport.source),
        cycle,
        port,
        hw_op,
        kind: PortAccess::Result,
    };
    Some((socket, source, access))
}

impl OutputFuBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceBroker for OutputFuBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::OutputFu
    }

    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        &mut self.core
    }

    fn is_applicable(&self, ctx: &BrokerContext<'_>, node: NodeId, _request: &AssignRequest) -> bool {
        ctx.node(node).transport.source.is_fu_port()
    }

    fn all_available_resources(
        &self,
        ctx: &BrokerContext<'_>,
        cycle: i32,
        node: NodeId,
        request: &AssignRequest,
    ) -> Vec<ResourceId> {
        let moved = ctx.node(node);
        let units = candidate_units(ctx.machine, ctx.block, node, &moved.transport.source, request.src_fu);
        units
            .into_iter()
            .filter_map(|fu| {
                let side = self.core.resource_of(MachinePart::FunctionUnit(fu))?;
                let (socket, source, access) = result_access(ctx.machine, moved, fu, cycle)?;
                let socket = ctx.mapper.resource_of(MachinePart::Socket(socket), ResourceKind::OutputPSocket)?;
                ctx.store
                    .output_fu_can_assign(side, socket, &source, &access)
                    .then_some(side)
            })
            .collect()
    }

    fn assign(
        &mut self,
        ctx: &mut AssignContext<'_>,
        cycle: i32,
        node: NodeId,
        resource: ResourceId,
        request: &AssignRequest,
    ) -> RmResult<()> {
        let fu = match self.core.ensure_owned(self.kind(), resource)? {
            MachinePart::FunctionUnit(fu) => fu,
            other => return Err(RmError::invalid_use(format!("{:?} is not a function unit", other))),
        };
        if !self.is_available(&ctx.view(), resource, cycle, node, request) {
            return Err(RmError::invalid_use(format!(
                "{} cannot serve {} at cycle {}",
                ctx.store.name(resource),
                node,
                cycle
            )));
        }
        let (_, _, access) = result_access(ctx.machine, ctx.block.node(node), fu, cycle)
            .ok_or_else(|| RmError::invalid_use(format!("{} does not read a result", node)))?;
        ctx.store.fu_side_assign(resource, access)?;

        let moved = ctx.block.node_mut(node);
        let previous = moved.transport.source.clone();
        if let Terminal::FuPort(t) = &mut moved.transport.source {
            t.fu = Some(fu);
            t.port = Some(access.port);
        }
        self.core.record(
            node,
            Assignment {
                resource,
                cycle,
                restore: Restore::Source(previous),
            },
        );
        log::trace!("[{}] {} -> {} at {}", self.kind(), node, ctx.store.name(resource), cycle);
        Ok(())
    }

    fn unassign(&mut self, ctx: &mut AssignContext<'_>, node: NodeId) -> RmResult<()> {
        let assignment = match self.core.take(node) {
            Some(assignment) => assignment,
            None => return Ok(()),
        };
        ctx.store.fu_side_unassign(assignment.resource, node)?;
        assignment.restore.apply(ctx.block.node_mut(node));
        Ok(())
    }

    fn build_resources(
        &mut self,
        machine: &Machine,
        store: &mut ResourceStore,
        mapper: &mut ResourceMapper,
    ) -> Result<(), ConfigError> {
        for fu in machine.function_unit_ids() {
            let name = format!("{}.out", machine.function_unit(fu).name);
            let id = store.add(name, ResourceState::OutputFu(FuSideState::new(fu)));
            mapper.add(MachinePart::FunctionUnit(fu), ResourceKind::OutputFu, id);
            self.core.add_resource(MachinePart::FunctionUnit(fu), id);
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
            let unit = machine.function_unit(fu);
            for socket in unit.ports.iter().filter_map(|p| p.output_socket) {
                let socket_res = mapper.require(
                    MachinePart::Socket(socket),
                    ResourceKind::OutputPSocket,
                    &machine.socket(socket).name,
                )?;
                store.add_dependent(id, FU_SOCKETS, socket_res);
            }
            let pipeline = mapper.require(MachinePart::FunctionUnit(fu), ResourceKind::ExecutionPipeline, &unit.name)?;
            store.add_dependent(id, FU_PIPELINE, pipeline);
        }
        Ok(())
    }
}
