// src/broker/bus.rs
//! Bus broker
//!
//! A bus can carry a move when it connects the move's output socket (or
//! its own short immediate socket, for constants) to the input socket, is
//! free in the cycle and supports the move's guard. Buses reserved by
//! fewer instruction templates for long immediate bits are preferred.

use super::{
    destination_ports, AssignContext, AssignRequest, Assignment, BrokerContext, BrokerCore, BrokerKind,
    MachinePart, ResourceBroker, ResourceMapper, Restore,
};
use crate::config::ConfigError;
use crate::error::{RmError, RmResult};
use crate::resource::bus::{BUS_INPUT_SOCKETS, BUS_OUTPUT_SOCKETS, BUS_SHORT_IMMEDIATE};
use crate::resource::{BusState, ResourceId, ResourceKind, ResourceState, ResourceStore, ShortImmPSocketState};
use crate::tta::immediate_unit::required_immediate_width;
use crate::tta::instruction::{ImmediateValue, MoveNode, NodeId, Terminal};
use crate::tta::processor::{Bus, Machine};

#[derive(Default)]
pub struct BusBroker {
    core: BrokerCore,
}

fn fits_short_immediate(bus: &Bus, value: &ImmediateValue) -> bool {
    bus.carries_short_immediates()
        && required_immediate_width(value.value, value.width, bus.extension) <= bus.immediate_width
}

fn guard_supported(bus: &Bus, node: &MoveNode) -> bool {
    node.transport
        .guard
        .as_ref()
        .map(|g| bus.has_guard(g))
        .unwrap_or(true)
}

impl BusBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Can the constant source of `node` travel as a short immediate on some bus
    pub fn can_transport_immediate(&self, ctx: &BrokerContext<'_>, node: NodeId, request: &AssignRequest) -> bool {
        let moved = ctx.node(node);
        let value = match moved.transport.source.immediate_value() {
            Some(value) => value,
            None => return false,
        };
        let preset = request.bus.or(moved.transport.bus);
        let ports = destination_ports(ctx.machine, moved);
        ctx.machine.bus_ids().any(|id| {
            let bus = ctx.machine.bus(id);
            let connected = !ctx.machine.has_long_immediates()
                || ports.iter().any(|p| {
                    ctx.machine
                        .port(*p)
                        .input_socket
                        .map(|s| ctx.machine.is_bus_connected(id, s))
                        .unwrap_or(false)
                });
            preset.map(|p| p == id).unwrap_or(true)
                && fits_short_immediate(bus, &value)
                && guard_supported(bus, moved)
                && connected
        })
    }

    /// Does any bus support the guard of `node`
    pub fn has_guard(&self, ctx: &BrokerContext<'_>, node: NodeId) -> bool {
        let moved = ctx.node(node);
        ctx.machine
            .bus_ids()
            .any(|id| guard_supported(ctx.machine.bus(id), moved))
    }
}

impl ResourceBroker for BusBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Bus
    }

    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        &mut self.core
    }

    fn is_applicable(&self, _ctx: &BrokerContext<'_>, _node: NodeId, _request: &AssignRequest) -> bool {
        true
    }

    fn all_available_resources(
        &self,
        ctx: &BrokerContext<'_>,
        cycle: i32,
        node: NodeId,
        request: &AssignRequest,
    ) -> Vec<ResourceId> {
        let moved = ctx.node(node);
        let input = moved
            .transport
            .destination
            .bound_port()
            .and_then(|p| ctx.machine.port(p).input_socket)
            .and_then(|s| ctx.mapper.resource_of(MachinePart::Socket(s), ResourceKind::InputPSocket));
        let input = match input {
            Some(input) => input,
            None => return Vec::new(),
        };
        let source_socket = moved
            .transport
            .source
            .bound_port()
            .and_then(|p| ctx.machine.port(p).output_socket)
            .and_then(|s| ctx.mapper.resource_of(MachinePart::Socket(s), ResourceKind::OutputPSocket));
        let preset = request.bus.or(moved.transport.bus);

        let mut buses: Vec<(usize, ResourceId)> = self
            .core
            .resources()
            .filter_map(|(part, resource)| {
                let id = match part {
                    MachinePart::Bus(id) => id,
                    _ => return None,
                };
                if preset.map(|p| p != id).unwrap_or(false) {
                    return None;
                }
                let bus = ctx.machine.bus(id);
                if !guard_supported(bus, moved) {
                    return None;
                }
                let output = match &moved.transport.source {
                    Terminal::Immediate(value) => {
                        if !fits_short_immediate(bus, value) {
                            return None;
                        }
                        ctx.store.bus_short_immediate(resource)?
                    }
                    _ => source_socket?,
                };
                if !ctx.store.bus_can_assign(resource, cycle, node, output, input) {
                    return None;
                }
                let slots = ctx.store.bus(resource).map(|b| b.limm_slots).unwrap_or(0);
                Some((slots, resource))
            })
            .collect();
        buses.sort_by_key(|(slots, _)| *slots);
        buses.into_iter().map(|(_, resource)| resource).collect()
    }

    fn assign(
        &mut self,
        ctx: &mut AssignContext<'_>,
        cycle: i32,
        node: NodeId,
        resource: ResourceId,
        request: &AssignRequest,
    ) -> RmResult<()> {
        let bus = match self.core.ensure_owned(self.kind(), resource)? {
            MachinePart::Bus(bus) => bus,
            other => return Err(RmError::invalid_use(format!("{:?} is not a bus", other))),
        };
        if !self.is_available(&ctx.view(), resource, cycle, node, request) {
            return Err(RmError::invalid_use(format!(
                "bus {} cannot carry {} at cycle {}",
                ctx.store.name(resource),
                node,
                cycle
            )));
        }
        ctx.store.bus_assign(resource, cycle, node)?;
        let moved = ctx.block.node_mut(node);
        let previous = moved.transport.bus.replace(bus);
        self.core.record(
            node,
            Assignment {
                resource,
                cycle,
                restore: Restore::Bus(previous),
            },
        );
        Ok(())
    }

    fn unassign(&mut self, ctx: &mut AssignContext<'_>, node: NodeId) -> RmResult<()> {
        let assignment = match self.core.take(node) {
            Some(assignment) => assignment,
            None => return Ok(()),
        };
        ctx.store.bus_unassign(assignment.resource, assignment.cycle, node)?;
        assignment.restore.apply(ctx.block.node_mut(node));
        Ok(())
    }

    fn build_resources(
        &mut self,
        machine: &Machine,
        store: &mut ResourceStore,
        mapper: &mut ResourceMapper,
    ) -> Result<(), ConfigError> {
        for id in machine.bus_ids() {
            let bus = machine.bus(id);
            let limm_slots = machine.templates.iter().filter(|t| t.uses_slot(id)).count();
            let resource = store.add(bus.name.clone(), ResourceState::Bus(BusState::new(bus.width, limm_slots)));
            mapper.add(MachinePart::Bus(id), ResourceKind::Bus, resource);
            self.core.add_resource(MachinePart::Bus(id), resource);

            if bus.carries_short_immediates() {
                let simm = store.add(
                    format!("{}.simm", bus.name),
                    ResourceState::ShortImmPSocket(ShortImmPSocketState {
                        width: bus.immediate_width,
                        extension: bus.extension,
                    }),
                );
                store.add_related(simm, 0, resource);
                store.add_related(resource, BUS_SHORT_IMMEDIATE, simm);
            }
        }
        Ok(())
    }

    fn setup_resource_links(
        &mut self,
        machine: &Machine,
        store: &mut ResourceStore,
        mapper: &ResourceMapper,
    ) -> Result<(), ConfigError> {
        for (part, resource) in self.core.resources() {
            let bus = match part {
                MachinePart::Bus(bus) => bus,
                _ => continue,
            };
            for socket in machine.socket_ids().filter(|s| machine.is_bus_connected(bus, *s)) {
                let name = &machine.socket(socket).name;
                if let Some(input) = mapper.resource_of(MachinePart::Socket(socket), ResourceKind::InputPSocket) {
                    store.add_related(resource, BUS_INPUT_SOCKETS, input);
                } else {
                    let output = mapper.require(MachinePart::Socket(socket), ResourceKind::OutputPSocket, name)?;
                    store.add_related(resource, BUS_OUTPUT_SOCKETS, output);
                }
            }
        }
        Ok(())
    }
}
