// src/broker/itemplate.rs
//! Instruction template broker
//!
//! Owns the instruction of every cycle that holds a move or a long
//! immediate. A template fits an instruction when it can encode all of the
//! instruction's long immediates and none of the buses its moves use is
//! reserved by the template for immediate bits. The instruction's template
//! is switched whenever a move or immediate no longer fits it, and
//! reselected when something is removed.

use super::{
    AssignContext, AssignRequest, Assignment, BrokerContext, BrokerCore, BrokerKind, MachinePart, ResourceBroker,
    ResourceMapper, Restore,
};
use crate::config::ConfigError;
use crate::error::{RmError, RmResult};
use crate::resource::template::{TEMPLATE_DESTINATIONS, TEMPLATE_SLOT_BUSES};
use crate::resource::{ResourceId, ResourceKind, ResourceState, ResourceStore, TemplateState};
use crate::tta::immediate_unit::required_immediate_width;
use crate::tta::instruction::{BasicBlock, Immediate, Instruction, NodeId, Terminal};
use crate::tta::processor::{BusId, InstructionTemplate, Machine, TemplateId};
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
pub struct ITemplateBroker {
    core: BrokerCore,
    instructions: BTreeMap<i32, Instruction>,
    /// Long immediate written on behalf of each move reading one: (definition cycle, immediate)
    immediates: HashMap<NodeId, (i32, Immediate)>,
}

/// Can `template` encode `immediates` while `buses` carry moves
fn supports(machine: &Machine, template: &InstructionTemplate, buses: &[BusId], immediates: &[&Immediate]) -> bool {
    if immediates.len() > template.destination_count() {
        return false;
    }
    for (i, imm) in immediates.iter().enumerate() {
        if immediates[..i].iter().any(|other| other.destination == imm.destination) {
            return false;
        }
        if !template.is_destination(imm.destination) {
            return false;
        }
        let unit = machine.immediate_unit(imm.destination);
        let required = if imm.value.is_address {
            imm.value.width
        } else {
            required_immediate_width(imm.value.value, imm.value.width, unit.extension)
        };
        if required > template.supported_width(imm.destination) {
            return false;
        }
    }
    buses.iter().all(|bus| !template.uses_slot(*bus))
}

/// Long immediate the immediate-unit broker wrote for `node`: (definition cycle, immediate)
fn long_immediate_of(ctx: &BrokerContext<'_>, node: NodeId) -> Option<(i32, Immediate)> {
    let (iu, index) = match ctx.block.node(node).transport.source {
        Terminal::ImmediateRegister { iu, index, .. } => (iu, index),
        _ => return None,
    };
    let broker = ctx.peers.iu()?;
    let value = broker.immediate_value(ctx.store, node)?;
    let definition = broker.immediate_write_cycle(ctx.store, node)?;
    Some((
        definition,
        Immediate {
            value,
            destination: iu,
            register: index,
        },
    ))
}

impl ITemplateBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Templates able to encode the instruction at `cycle` extended with
    /// `extra_move` and `extra_immediate`; the current template first, then
    /// by increasing number of reserved slots
    fn find_templates(
        &self,
        machine: &Machine,
        block: &BasicBlock,
        cycle: i32,
        extra_move: Option<NodeId>,
        extra_immediate: Option<&Immediate>,
    ) -> Vec<ResourceId> {
        let instruction = self.instructions.get(&cycle);
        let buses: Vec<BusId> = instruction
            .iter()
            .flat_map(|i| i.moves.iter())
            .chain(extra_move.iter())
            .filter(|n| block.contains(**n))
            .filter_map(|n| block.node(*n).transport.bus)
            .collect();
        let immediates: Vec<&Immediate> = instruction
            .iter()
            .flat_map(|i| i.immediates.iter())
            .chain(extra_immediate)
            .collect();
        let current = instruction.and_then(|i| i.template);

        let mut found: Vec<(bool, usize, ResourceId)> = self
            .core
            .resources()
            .filter_map(|(part, resource)| match part {
                MachinePart::Template(id) => Some((id, resource)),
                _ => None,
            })
            .filter(|(id, _)| supports(machine, machine.template(*id), &buses, &immediates))
            .map(|(id, resource)| (Some(id) != current, machine.template(id).slots.len(), resource))
            .collect();
        found.sort_by_key(|(not_current, slots, _)| (*not_current, *slots));
        found.into_iter().map(|(_, _, resource)| resource).collect()
    }

    /// Could `immediate` be written by the instruction at `cycle`
    pub fn is_template_available(&self, ctx: &BrokerContext<'_>, cycle: i32, immediate: &Immediate) -> bool {
        !self
            .find_templates(ctx.machine, ctx.block, cycle, None, Some(immediate))
            .is_empty()
    }

    fn template_of(&self, resource: ResourceId) -> RmResult<TemplateId> {
        match self.core.ensure_owned(BrokerKind::InstructionTemplate, resource)? {
            MachinePart::Template(id) => Ok(id),
            other => Err(RmError::invalid_use(format!("{:?} is not an instruction template", other))),
        }
    }

    /// Make `template` the template of the instruction at `cycle`
    fn set_template(
        &mut self,
        store: &mut ResourceStore,
        cycle: i32,
        template: TemplateId,
        resource: ResourceId,
    ) -> RmResult<()> {
        let instruction = self.instructions.entry(cycle).or_default();
        if instruction.template == Some(template) {
            return Ok(());
        }
        if let Some(old) = instruction.template {
            if let Some(old_resource) = self.core.resource_of(MachinePart::Template(old)) {
                store.template_unassign(old_resource, cycle)?;
            }
            log::debug!("[{}] cycle {} switches template", BrokerKind::InstructionTemplate, cycle);
        }
        store.template_assign(resource, cycle)?;
        instruction.template = Some(template);
        Ok(())
    }

    /// Pick a template again after something left the instruction at `cycle`
    fn reselect(&mut self, machine: &Machine, block: &BasicBlock, store: &mut ResourceStore, cycle: i32) -> RmResult<()> {
        let empty = match self.instructions.get(&cycle) {
            Some(instruction) => instruction.is_empty(),
            None => return Ok(()),
        };
        if empty {
            if let Some(template) = self.instructions.remove(&cycle).and_then(|i| i.template) {
                if let Some(resource) = self.core.resource_of(MachinePart::Template(template)) {
                    store.template_unassign(resource, cycle)?;
                }
            }
            return Ok(());
        }
        if let Some(resource) = self.find_templates(machine, block, cycle, None, None).first().copied() {
            let template = self.template_of(resource)?;
            self.set_template(store, cycle, template, resource)?;
        }
        Ok(())
    }

    fn add_immediate(&mut self, ctx: &mut AssignContext<'_>, cycle: i32, immediate: Immediate) -> RmResult<()> {
        let resource = self
            .find_templates(ctx.machine, ctx.block, cycle, None, Some(&immediate))
            .first()
            .copied()
            .ok_or_else(|| {
                RmError::invalid_use(format!(
                    "no template can write immediate {} at cycle {}",
                    immediate.value.value, cycle
                ))
            })?;
        let template = self.template_of(resource)?;
        self.set_template(ctx.store, cycle, template, resource)?;
        self.instructions
            .entry(cycle)
            .or_default()
            .immediates
            .push(immediate);
        Ok(())
    }

    fn remove_immediate(&mut self, ctx: &mut AssignContext<'_>, cycle: i32, immediate: &Immediate) -> RmResult<()> {
        if let Some(instruction) = self.instructions.get_mut(&cycle) {
            if let Some(pos) = instruction.immediates.iter().position(|i| i == immediate) {
                instruction.immediates.remove(pos);
            }
        }
        self.reselect(ctx.machine, ctx.block, ctx.store, cycle)
    }

    fn remove_move(&mut self, ctx: &mut AssignContext<'_>, cycle: i32, node: NodeId) -> RmResult<()> {
        if let Some(instruction) = self.instructions.get_mut(&cycle) {
            instruction.moves.retain(|n| *n != node);
        }
        self.reselect(ctx.machine, ctx.block, ctx.store, cycle)
    }

    /// Instruction at `cycle`, created empty with the first fitting template if absent
    pub fn instruction(
        &mut self,
        machine: &Machine,
        block: &BasicBlock,
        store: &mut ResourceStore,
        cycle: i32,
    ) -> RmResult<&Instruction> {
        if !self.instructions.contains_key(&cycle) {
            if let Some(resource) = self.find_templates(machine, block, cycle, None, None).first().copied() {
                let template = self.template_of(resource)?;
                self.set_template(store, cycle, template, resource)?;
            }
        }
        Ok(&*self.instructions.entry(cycle).or_default())
    }

    /// Hand the instruction at `cycle` to the caller; later queries start from a fresh one
    pub fn lose_instruction_ownership(&mut self, store: &mut ResourceStore, cycle: i32) -> RmResult<Option<Instruction>> {
        let instruction = match self.instructions.remove(&cycle) {
            Some(instruction) => instruction,
            None => return Ok(None),
        };
        if let Some(resource) = instruction
            .template
            .and_then(|t| self.core.resource_of(MachinePart::Template(t)))
        {
            store.template_unassign(resource, cycle)?;
        }
        Ok(Some(instruction))
    }

    pub fn instruction_is_empty(&self, cycle: i32) -> bool {
        self.instructions
            .get(&cycle)
            .map(Instruction::is_empty)
            .unwrap_or(true)
    }

    /// Owned instructions in cycle order
    pub fn instructions(&self) -> impl Iterator<Item = (i32, &Instruction)> {
        self.instructions.iter().map(|(c, i)| (*c, i))
    }
}

impl ResourceBroker for ITemplateBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::InstructionTemplate
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
        _request: &AssignRequest,
    ) -> Vec<ResourceId> {
        // an immediate written in the move's own cycle must fit the same template
        let own = long_immediate_of(ctx, node).filter(|(definition, _)| *definition == cycle);
        self.find_templates(ctx.machine, ctx.block, cycle, Some(node), own.as_ref().map(|(_, imm)| imm))
    }

    fn assign(
        &mut self,
        ctx: &mut AssignContext<'_>,
        cycle: i32,
        node: NodeId,
        resource: ResourceId,
        request: &AssignRequest,
    ) -> RmResult<()> {
        let template = self.template_of(resource)?;
        if !self.is_available(&ctx.view(), resource, cycle, node, request) {
            return Err(RmError::invalid_use(format!(
                "template {} cannot encode {} at cycle {}",
                ctx.store.name(resource),
                node,
                cycle
            )));
        }
        self.set_template(ctx.store, cycle, template, resource)?;
        self.instructions.entry(cycle).or_default().moves.push(node);

        let long_immediate = long_immediate_of(&ctx.view(), node);
        if let Some((definition, immediate)) = long_immediate {
            if let Err(err) = self.add_immediate(ctx, definition, immediate) {
                self.remove_move(ctx, cycle, node)?;
                return Err(err);
            }
            self.immediates.insert(node, (definition, immediate));
        }

        self.core.record(
            node,
            Assignment {
                resource,
                cycle,
                restore: Restore::Nothing,
            },
        );
        Ok(())
    }

    fn unassign(&mut self, ctx: &mut AssignContext<'_>, node: NodeId) -> RmResult<()> {
        let assignment = match self.core.take(node) {
            Some(assignment) => assignment,
            None => return Ok(()),
        };
        if let Some((definition, immediate)) = self.immediates.remove(&node) {
            self.remove_immediate(ctx, definition, &immediate)?;
        }
        self.remove_move(ctx, assignment.cycle, node)
    }

    fn build_resources(
        &mut self,
        machine: &Machine,
        store: &mut ResourceStore,
        mapper: &mut ResourceMapper,
    ) -> Result<(), ConfigError> {
        for id in machine.template_ids() {
            let resource = store.add(
                machine.template(id).name.clone(),
                ResourceState::InstructionTemplate(TemplateState::default()),
            );
            mapper.add(MachinePart::Template(id), ResourceKind::InstructionTemplate, resource);
            self.core.add_resource(MachinePart::Template(id), resource);
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
            let id = match part {
                MachinePart::Template(id) => id,
                _ => continue,
            };
            for slot in &machine.template(id).slots {
                let bus = mapper.require(MachinePart::Bus(slot.bus), ResourceKind::Bus, &machine.bus(slot.bus).name)?;
                store.add_dependent(resource, TEMPLATE_SLOT_BUSES, bus);
                let iu = mapper.require(
                    MachinePart::ImmediateUnit(slot.destination),
                    ResourceKind::ImmediateUnit,
                    &machine.immediate_unit(slot.destination).name,
                )?;
                store.add_dependent(resource, TEMPLATE_DESTINATIONS, iu);
            }
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.core.clear_assignments();
        self.instructions.clear();
        self.immediates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::tta::instruction::ImmediateValue;

    #[test]
    fn test_template_fit_rules() {
        let machine = Machine::from_config(&MachineConfig::default_test()).unwrap();
        let limm = machine.template(machine.template_by_name("limm").unwrap());
        let no_limm = machine.template(machine.template_by_name("no_limm").unwrap());
        let iu = machine.immediate_unit_by_name("IMM").unwrap();
        let b2 = machine.bus_by_name("B2").unwrap();
        let b0 = machine.bus_by_name("B0").unwrap();
        let imm = Immediate {
            value: ImmediateValue::new(1 << 20, 32),
            destination: iu,
            register: 0,
        };

        assert!(supports(&machine, limm, &[b0], &[&imm]));
        assert!(!supports(&machine, no_limm, &[b0], &[&imm]));
        // the slot bus cannot carry a move
        assert!(!supports(&machine, limm, &[b2], &[&imm]));
        // one destination, two immediates
        assert!(!supports(&machine, limm, &[], &[&imm, &imm]));
        assert!(supports(&machine, no_limm, &[b2], &[]));
    }
}
