// src/broker/input_psocket.rs
//! Input socket broker: the socket a move's destination port is written through

use super::{
    AssignContext, AssignRequest, Assignment, BrokerContext, BrokerCore, BrokerKind, MachinePart, ResourceBroker,
    ResourceMapper, Restore,
};
use crate::config::{ConfigError, SocketDirection};
use crate::error::{RmError, RmResult};
use crate::resource::{InputPSocketState, ResourceId, ResourceKind, ResourceState, ResourceStore};
use crate::tta::instruction::{NodeId, Terminal};
use crate::tta::processor::{Machine, PortRef, SocketId, UnitRef};

#[derive(Default)]
pub struct InputPSocketBroker {
    core: BrokerCore,
}

impl InputPSocketBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate (socket, port) pairs for the destination of `node`
    fn candidates(&self, ctx: &BrokerContext<'_>, node: NodeId) -> Vec<(ResourceId, PortRef)> {
        let destination = &ctx.node(node).transport.destination;
        let ports: Vec<PortRef> = match destination {
            Terminal::FuPort(_) => destination.bound_port().into_iter().collect(),
            Terminal::Register { rf, .. } => {
                let unit = UnitRef::RegisterFile(*rf);
                (0..ctx.machine.ports_of(unit).len())
                    .map(|i| PortRef::new(unit, i))
                    .collect()
            }
            _ => Vec::new(),
        };
        ports
            .into_iter()
            .filter_map(|port| {
                let socket = ctx.machine.port(port).input_socket?;
                let resource = self.core.resource_of(MachinePart::Socket(socket))?;
                Some((resource, port))
            })
            .collect()
    }
}

impl ResourceBroker for InputPSocketBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::InputPSocket
    }

    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        &mut self.core
    }

    fn is_applicable(&self, ctx: &BrokerContext<'_>, node: NodeId, _request: &AssignRequest) -> bool {
        let destination = &ctx.node(node).transport.destination;
        destination.is_fu_port() || destination.is_gpr()
    }

    fn all_available_resources(
        &self,
        ctx: &BrokerContext<'_>,
        cycle: i32,
        node: NodeId,
        _request: &AssignRequest,
    ) -> Vec<ResourceId> {
        self.candidates(ctx, node)
            .into_iter()
            .map(|(socket, _)| socket)
            .filter(|socket| ctx.store.input_psocket_can_assign(*socket, cycle, node))
            .collect()
    }

    fn assign(
        &mut self,
        ctx: &mut AssignContext<'_>,
        cycle: i32,
        node: NodeId,
        resource: ResourceId,
        _request: &AssignRequest,
    ) -> RmResult<()> {
        self.core.ensure_owned(self.kind(), resource)?;
        let port = self
            .candidates(&ctx.view(), node)
            .into_iter()
            .find(|(socket, _)| *socket == resource)
            .map(|(_, port)| port)
            .ok_or_else(|| {
                RmError::invalid_use(format!("{} cannot write through {}", node, ctx.store.name(resource)))
            })?;
        ctx.store.input_psocket_assign(resource, cycle, node)?;

        let moved = ctx.block.node_mut(node);
        let previous = moved.transport.destination.clone();
        moved.transport.destination = previous.with_port(port.index);
        self.core.record(
            node,
            Assignment {
                resource,
                cycle,
                restore: Restore::Destination(previous),
            },
        );
        Ok(())
    }

    fn unassign(&mut self, ctx: &mut AssignContext<'_>, node: NodeId) -> RmResult<()> {
        let assignment = match self.core.take(node) {
            Some(assignment) => assignment,
            None => return Ok(()),
        };
        ctx.store
            .input_psocket_unassign(assignment.resource, assignment.cycle, node)?;
        assignment.restore.apply(ctx.block.node_mut(node));
        Ok(())
    }

    fn build_resources(
        &mut self,
        machine: &Machine,
        store: &mut ResourceStore,
        mapper: &mut ResourceMapper,
    ) -> Result<(), ConfigError> {
        for socket in machine.socket_ids() {
            let s = machine.socket(socket);
            if s.direction != SocketDirection::Input {
                continue;
            }
            let id = store.add(s.name.clone(), ResourceState::InputPSocket(InputPSocketState::default()));
            mapper.add(MachinePart::Socket(socket), ResourceKind::InputPSocket, id);
            self.core.add_resource(MachinePart::Socket(socket), id);
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
            let socket: SocketId = match part {
                MachinePart::Socket(s) => s,
                _ => continue,
            };
            let s = machine.socket(socket);
            for port in &s.ports {
                if let UnitRef::FunctionUnit(fu) = port.unit {
                    let side = mapper.require(
                        MachinePart::FunctionUnit(fu),
                        ResourceKind::InputFu,
                        &machine.function_unit(fu).name,
                    )?;
                    store.add_related(id, 0, side);
                }
            }
            for bus in &s.buses {
                let bus_res = mapper.require(MachinePart::Bus(*bus), ResourceKind::Bus, &machine.bus(*bus).name)?;
                store.add_related(id, 1, bus_res);
            }
        }
        Ok(())
    }
}
