// src/broker/iu.rs
//! Long immediate broker
//!
//! Constants that do not fit any bus's short immediate field are written
//! into an immediate unit register by an instruction template in an
//! earlier cycle and read from there by the move. The broker searches the
//! definition cycle backwards from the use cycle, at most
//! `max_limm_distance` cycles, and rewrites the move's source to read the
//! register it reserved.

use super::{
    AssignContext, AssignRequest, Assignment, BrokerContext, BrokerCore, BrokerKind, MachinePart, ResourceBroker,
    ResourceMapper, Restore,
};
use crate::config::ConfigError;
use crate::error::{RmError, RmResult};
use crate::resource::immediate_unit::{IU_OUTPUT_SOCKETS, IU_TEMPLATES};
use crate::resource::{IuState, ResourceId, ResourceKind, ResourceState, ResourceStore};
use crate::tta::instruction::{Immediate, ImmediateValue, NodeId, Terminal};
use crate::tta::processor::{IuId, Machine};

#[derive(Default)]
pub struct IuBroker {
    core: BrokerCore,
}

impl IuBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Can `resource` hold `value` from `definition` to `use_cycle`, with a template free to write it
    fn fits_at(
        &self,
        ctx: &BrokerContext<'_>,
        resource: ResourceId,
        iu: IuId,
        definition: i32,
        use_cycle: i32,
        value: &ImmediateValue,
        request: &AssignRequest,
    ) -> bool {
        if !ctx
            .store
            .iu_can_assign(resource, definition, use_cycle, value, request.imm_reg_index)
        {
            return false;
        }
        let immediate = Immediate {
            value: *value,
            destination: iu,
            register: 0,
        };
        ctx.peers
            .itemplate()
            .map(|templates| templates.is_template_available(ctx, definition, &immediate))
            .unwrap_or(true)
    }

    /// Definition cycles to try, latest first
    fn definition_cycles(ctx: &BrokerContext<'_>, use_cycle: i32, request: &AssignRequest) -> Vec<i32> {
        let limit = ctx.machine.limits.max_limm_distance;
        if let Some(forced) = request.imm_write_cycle {
            return if forced >= 0 && use_cycle - forced < limit {
                vec![forced]
            } else {
                Vec::new()
            };
        }
        (0..=use_cycle)
            .rev()
            .take_while(|def| use_cycle - def < limit)
            .collect()
    }

    /// Value held for `node`, while it is assigned
    pub fn immediate_value(&self, store: &ResourceStore, node: NodeId) -> Option<ImmediateValue> {
        let assignment = self.core.assignment(node)?;
        let (_, record) = store.immediate_unit(assignment.resource)?.record_of(node)?;
        Some(record.value)
    }

    /// Cycle the immediate read by `node` is written in
    pub fn immediate_write_cycle(&self, store: &ResourceStore, node: NodeId) -> Option<i32> {
        let assignment = self.core.assignment(node)?;
        let (_, record) = store.immediate_unit(assignment.resource)?.record_of(node)?;
        Some(record.definition)
    }
}

impl ResourceBroker for IuBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::ImmediateUnit
    }

    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        &mut self.core
    }

    fn is_applicable(&self, ctx: &BrokerContext<'_>, node: NodeId, request: &AssignRequest) -> bool {
        let moved = ctx.node(node);
        if !moved.transport.source.is_immediate() {
            return false;
        }
        moved.requires_long_immediate
            || ctx
                .peers
                .bus()
                .map(|bus| !bus.can_transport_immediate(ctx, node, request))
                .unwrap_or(true)
    }

    fn all_available_resources(
        &self,
        ctx: &BrokerContext<'_>,
        cycle: i32,
        node: NodeId,
        request: &AssignRequest,
    ) -> Vec<ResourceId> {
        let value = match ctx.node(node).transport.source.immediate_value() {
            Some(value) => value,
            None => return Vec::new(),
        };
        for definition in Self::definition_cycles(ctx, cycle, request) {
            let mut found: Vec<(u32, ResourceId)> = self
                .core
                .resources()
                .filter_map(|(part, resource)| match part {
                    MachinePart::ImmediateUnit(iu) if request.immu.map(|u| u == iu).unwrap_or(true) => {
                        Some((iu, resource))
                    }
                    _ => None,
                })
                .filter(|(iu, resource)| self.fits_at(ctx, *resource, *iu, definition, cycle, &value, request))
                .map(|(_, resource)| {
                    let width = ctx.store.immediate_unit(resource).map(|s| s.width).unwrap_or(0);
                    (width, resource)
                })
                .collect();
            if !found.is_empty() {
                found.sort_by_key(|(width, _)| *width);
                return found.into_iter().map(|(_, resource)| resource).collect();
            }
        }
        Vec::new()
    }

    fn assign(
        &mut self,
        ctx: &mut AssignContext<'_>,
        cycle: i32,
        node: NodeId,
        resource: ResourceId,
        request: &AssignRequest,
    ) -> RmResult<()> {
        let iu = match self.core.ensure_owned(self.kind(), resource)? {
            MachinePart::ImmediateUnit(iu) => iu,
            other => return Err(RmError::invalid_use(format!("{:?} is not an immediate unit", other))),
        };
        let value = ctx
            .block
            .node(node)
            .transport
            .source
            .immediate_value()
            .ok_or_else(|| RmError::invalid_use(format!("{} does not carry a constant", node)))?;
        let definition = {
            let view = ctx.view();
            Self::definition_cycles(&view, cycle, request)
                .into_iter()
                .find(|def| self.fits_at(&view, resource, iu, *def, cycle, &value, request))
        };
        let definition = definition.ok_or_else(|| {
            RmError::invalid_use(format!(
                "{} cannot hold the immediate of {} read at cycle {}",
                ctx.store.name(resource),
                node,
                cycle
            ))
        })?;
        let index = ctx
            .store
            .iu_assign(resource, definition, cycle, node, value, request.imm_reg_index)?;

        let moved = ctx.block.node_mut(node);
        let previous = std::mem::replace(
            &mut moved.transport.source,
            Terminal::ImmediateRegister { iu, index, port: None },
        );
        self.core.record(
            node,
            Assignment {
                resource,
                cycle,
                restore: Restore::Source(previous),
            },
        );
        log::trace!(
            "[{}] {} reads {}.{} written at {}",
            self.kind(),
            node,
            ctx.machine.immediate_unit(iu).name,
            index,
            definition
        );
        Ok(())
    }

    fn unassign(&mut self, ctx: &mut AssignContext<'_>, node: NodeId) -> RmResult<()> {
        let assignment = match self.core.take(node) {
            Some(assignment) => assignment,
            None => return Ok(()),
        };
        ctx.store.iu_unassign(assignment.resource, assignment.cycle, node)?;
        assignment.restore.apply(ctx.block.node_mut(node));
        Ok(())
    }

    fn build_resources(
        &mut self,
        machine: &Machine,
        store: &mut ResourceStore,
        mapper: &mut ResourceMapper,
    ) -> Result<(), ConfigError> {
        for iu in machine.immediate_unit_ids() {
            let unit = machine.immediate_unit(iu);
            let state = IuState::new(unit.registers, unit.width, unit.latency, unit.extension);
            let resource = store.add(unit.name.clone(), ResourceState::ImmediateUnit(state));
            mapper.add(MachinePart::ImmediateUnit(iu), ResourceKind::ImmediateUnit, resource);
            self.core.add_resource(MachinePart::ImmediateUnit(iu), resource);
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
            let iu = match part {
                MachinePart::ImmediateUnit(iu) => iu,
                _ => continue,
            };
            let unit = machine.immediate_unit(iu);
            for socket in unit.ports.iter().filter_map(|p| p.output_socket) {
                let socket_res = mapper.require(
                    MachinePart::Socket(socket),
                    ResourceKind::OutputPSocket,
                    &machine.socket(socket).name,
                )?;
                store.add_related(resource, IU_OUTPUT_SOCKETS, socket_res);
            }
            for template in machine.template_ids().filter(|t| machine.template(*t).is_destination(iu)) {
                let template_res = mapper.require(
                    MachinePart::Template(template),
                    ResourceKind::InstructionTemplate,
                    &machine.template(template).name,
                )?;
                store.add_related(resource, IU_TEMPLATES, template_res);
            }
        }
        Ok(())
    }
}
