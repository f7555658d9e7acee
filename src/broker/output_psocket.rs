// src/broker/output_psocket.rs
//! Output socket broker: the socket a move's source is read through
//!
//! Several moves may read one socket in the same cycle when they read the
//! same port (and register) of the same unit.

use super::{
    AssignContext, AssignRequest, Assignment, BrokerContext, BrokerCore, BrokerKind, MachinePart, ResourceBroker,
    ResourceMapper, Restore,
};
use crate::config::{ConfigError, SocketDirection};
use crate::error::{RmError, RmResult};
use crate::resource::{OutputPSocketState, ReadSource, ResourceId, ResourceKind, ResourceState, ResourceStore};
use crate::tta::instruction::{NodeId, Terminal};
use crate::tta::processor::{Machine, PortRef, UnitRef};

#[derive(Default)]
pub struct OutputPSocketBroker {
    core: BrokerCore,
}

impl OutputPSocketBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate (socket, driver) pairs for the source of `node`
    fn candidates(&self, ctx: &BrokerContext<'_>, node: NodeId) -> Vec<(ResourceId, ReadSource)> {
        let source = &ctx.node(node).transport.source;
        let (unit, register) = match source {
            Terminal::FuPort(_) => match source.bound_port() {
                Some(port) => (port.unit, None),
                None => return Vec::new(),
            },
            Terminal::Register { rf, index, .. } => (UnitRef::RegisterFile(*rf), Some(*index)),
            Terminal::ImmediateRegister { iu, index, .. } => (UnitRef::ImmediateUnit(*iu), Some(*index)),
            Terminal::Immediate(_) => return Vec::new(),
        };
        let ports: Vec<PortRef> = match source.bound_port() {
            Some(port) if source.is_fu_port() => vec![port],
            _ => (0..ctx.machine.ports_of(unit).len())
                .map(|i| PortRef::new(unit, i))
                .collect(),
        };
        ports
            .into_iter()
            .filter_map(|port| {
                let socket = ctx.machine.port(port).output_socket?;
                let resource = self.core.resource_of(MachinePart::Socket(socket))?;
                Some((resource, ReadSource { port, register }))
            })
            .collect()
    }

    fn needs_long_immediate(&self, ctx: &BrokerContext<'_>, node: NodeId, request: &AssignRequest) -> bool {
        let moved = ctx.node(node);
        moved.requires_long_immediate
            || ctx
                .peers
                .bus()
                .map(|bus| !bus.can_transport_immediate(ctx, node, request))
                .unwrap_or(true)
    }
}

impl ResourceBroker for OutputPSocketBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::OutputPSocket
    }

    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        &mut self.core
    }

    fn is_applicable(&self, ctx: &BrokerContext<'_>, node: NodeId, request: &AssignRequest) -> bool {
        match &ctx.node(node).transport.source {
            Terminal::FuPort(_) | Terminal::Register { .. } | Terminal::ImmediateRegister { .. } => true,
            Terminal::Immediate(_) => self.needs_long_immediate(ctx, node, request),
        }
    }

    fn all_available_resources(
        &self,
        ctx: &BrokerContext<'_>,
        cycle: i32,
        node: NodeId,
        _request: &AssignRequest,
    ) -> Vec<ResourceId> {
        let mut sockets: Vec<ResourceId> = self
            .candidates(ctx, node)
            .into_iter()
            .filter(|(socket, source)| ctx.store.output_psocket_can_assign(*socket, cycle, source))
            .map(|(socket, _)| socket)
            .collect();
        sockets.dedup();
        sockets
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
        let source = self
            .candidates(&ctx.view(), node)
            .into_iter()
            .find(|(socket, _)| *socket == resource)
            .map(|(_, source)| source)
            .ok_or_else(|| RmError::invalid_use(format!("{} cannot read through {}", node, ctx.store.name(resource))))?;
        let port = source.port.index;
        ctx.store.output_psocket_assign(resource, cycle, node, source)?;

        let moved = ctx.block.node_mut(node);
        let previous = moved.transport.source.clone();
        moved.transport.source = previous.with_port(port);
        self.core.record(
            node,
            Assignment {
                resource,
                cycle,
                restore: Restore::Source(previous),
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
            .output_psocket_unassign(assignment.resource, assignment.cycle, node)?;
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
            if s.direction != SocketDirection::Output {
                continue;
            }
            let id = store.add(s.name.clone(), ResourceState::OutputPSocket(OutputPSocketState::default()));
            mapper.add(MachinePart::Socket(socket), ResourceKind::OutputPSocket, id);
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
            let socket = match part {
                MachinePart::Socket(s) => s,
                _ => continue,
            };
            let s = machine.socket(socket);
            for port in &s.ports {
                match port.unit {
                    UnitRef::FunctionUnit(fu) => {
                        let side = mapper.require(
                            MachinePart::FunctionUnit(fu),
                            ResourceKind::OutputFu,
                            &machine.function_unit(fu).name,
                        )?;
                        store.add_related(id, 0, side);
                    }
                    UnitRef::ImmediateUnit(iu) => {
                        let unit = mapper.require(
                            MachinePart::ImmediateUnit(iu),
                            ResourceKind::ImmediateUnit,
                            &machine.immediate_unit(iu).name,
                        )?;
                        store.add_related(id, 1, unit);
                    }
                    UnitRef::RegisterFile(_) => {}
                }
            }
            for bus in &s.buses {
                let bus_res = mapper.require(MachinePart::Bus(*bus), ResourceKind::Bus, &machine.bus(*bus).name)?;
                store.add_related(id, 2, bus_res);
            }
        }
        Ok(())
    }
}
