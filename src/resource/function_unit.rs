// src/resource/function_unit.rs
//! Input and output sides of a function unit
//!
//! The input side accepts operand writes and triggers, the output side
//! result reads. Both delegate timing rules to the unit's execution
//! pipeline resource.

use super::pipeline::{Access, PortAccess};
use super::psocket::ReadSource;
use super::{Occupancy, ResourceId, ResourceKind, ResourceStore};
use crate::error::{RmError, RmResult};
use crate::tta::instruction::NodeId;
use crate::tta::processor::FuId;
use std::collections::BTreeMap;

/// Dependent groups of both sides: port sockets, execution pipeline
pub const FU_SOCKETS: usize = 0;
pub const FU_PIPELINE: usize = 1;

#[derive(Clone, Debug)]
pub struct FuSideState {
    pub fu: FuId,
    assignments: BTreeMap<NodeId, i32>,
}

impl FuSideState {
    pub fn new(fu: FuId) -> Self {
        Self {
            fu,
            assignments: BTreeMap::new(),
        }
    }

    pub fn cycle_of(&self, node: NodeId) -> Option<i32> {
        self.assignments.get(&node).copied()
    }
}

impl Occupancy for FuSideState {
    fn is_in_use(&self, cycle: i32) -> bool {
        self.assignments.values().any(|c| *c == cycle)
    }

    fn is_available(&self, _cycle: i32) -> bool {
        true
    }

    fn highest_cycle(&self) -> Option<i32> {
        self.assignments.values().max().copied()
    }

    fn clear(&mut self) {
        self.assignments.clear();
    }
}

impl ResourceStore {
    pub fn fu_pipeline(&self, side: ResourceId) -> Option<ResourceId> {
        self.dependent(side, FU_PIPELINE).first().copied()
    }

    fn pipeline_allows(&self, side: ResourceId, access: &Access) -> bool {
        let pipeline = match self.fu_pipeline(side).and_then(|p| self.pipeline(p)) {
            Some(pipeline) => pipeline,
            None => return false,
        };
        match access.kind {
            PortAccess::Trigger => {
                pipeline.can_trigger(access.cycle, access.node, access.port, access.hw_op, access.op)
            }
            PortAccess::Operand => pipeline.can_write_operand(access.cycle, access.node, access.port, access.op),
            PortAccess::Result => pipeline.can_read_result(access.cycle, access.node, access.port, access.op),
        }
    }

    /// Can the operand write or trigger described by `access` go through `socket`
    pub fn input_fu_can_assign(&self, side: ResourceId, socket: ResourceId, access: &Access) -> bool {
        self.dependent(side, FU_SOCKETS).contains(&socket)
            && self.input_psocket_can_assign(socket, access.cycle, access.node)
            && self.pipeline_allows(side, access)
    }

    /// Can the result read described by `access` go through `socket` driven by `source`
    pub fn output_fu_can_assign(
        &self,
        side: ResourceId,
        socket: ResourceId,
        source: &ReadSource,
        access: &Access,
    ) -> bool {
        self.dependent(side, FU_SOCKETS).contains(&socket)
            && self.output_psocket_can_assign(socket, access.cycle, source)
            && self.pipeline_allows(side, access)
    }

    pub fn fu_side_assign(&mut self, side: ResourceId, access: Access) -> RmResult<()> {
        let pipeline = self
            .fu_pipeline(side)
            .ok_or_else(|| RmError::invalid_use(format!("{} has no pipeline", self.name(side))))?;
        let state = self
            .fu_side_mut(side)
            .ok_or_else(|| RmError::invalid_use(format!("resource {:?} is not a function unit side", side)))?;
        state.assignments.insert(access.node, access.cycle);
        if let Some(pipeline) = self.pipeline_mut(pipeline) {
            pipeline.assign(access);
        }
        Ok(())
    }

    pub fn fu_side_unassign(&mut self, side: ResourceId, node: NodeId) -> RmResult<()> {
        let pipeline = self.fu_pipeline(side);
        let results = self.kind(side) == ResourceKind::OutputFu;
        let cycle = self
            .fu_side_mut(side)
            .and_then(|state| state.assignments.remove(&node));
        let cycle = match cycle {
            Some(cycle) => cycle,
            None => return Err(self.not_assigned(side, -1)),
        };
        if let Some(pipeline) = pipeline.and_then(|p| self.pipeline_mut(p)) {
            if !pipeline.unassign(node, results) {
                return Err(self.not_assigned(side, cycle));
            }
        }
        Ok(())
    }
}
