// src/resource/template.rs
//! Instruction template resource: marks the cycles whose instruction uses the template

use super::{Occupancy, ResourceId, ResourceKind, ResourceStore};
use crate::error::RmResult;
use std::collections::BTreeSet;

/// Dependent groups of a template: buses carrying immediate bits, immediate units written
pub const TEMPLATE_SLOT_BUSES: usize = 0;
pub const TEMPLATE_DESTINATIONS: usize = 1;

#[derive(Clone, Debug, Default)]
pub struct TemplateState {
    cycles: BTreeSet<i32>,
}

impl Occupancy for TemplateState {
    fn is_in_use(&self, cycle: i32) -> bool {
        self.cycles.contains(&cycle)
    }

    fn is_available(&self, cycle: i32) -> bool {
        !self.is_in_use(cycle)
    }

    fn highest_cycle(&self) -> Option<i32> {
        self.cycles.iter().next_back().copied()
    }

    fn clear(&mut self) {
        self.cycles.clear();
    }
}

impl ResourceStore {
    /// Mark the template used by the instruction at `cycle`; idempotent
    pub fn template_assign(&mut self, template: ResourceId, cycle: i32) -> RmResult<()> {
        self.expect_kind(template, ResourceKind::InstructionTemplate)?;
        if let Some(state) = self.template_mut(template) {
            state.cycles.insert(cycle);
        }
        Ok(())
    }

    pub fn template_unassign(&mut self, template: ResourceId, cycle: i32) -> RmResult<()> {
        self.expect_kind(template, ResourceKind::InstructionTemplate)?;
        let removed = self
            .template_mut(template)
            .map(|state| state.cycles.remove(&cycle))
            .unwrap_or(false);
        if removed {
            Ok(())
        } else {
            Err(self.not_assigned(template, cycle))
        }
    }
}
