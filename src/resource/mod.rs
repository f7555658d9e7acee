// src/resource/mod.rs
//! Scheduling resource model
//!
//! Every physical resource instance (a socket, a bus, an immediate unit,
//! an instruction template, a function unit side or pipeline) is one
//! [`SchedulingResource`] in an arena [`ResourceStore`]. Brokers refer to
//! resources by [`ResourceId`] handle. Each resource carries a time indexed
//! occupancy record and two groups of links to other resources:
//!
//! - *related* resources must themselves be compatible for an assignment
//!   to be valid (a socket is related to the buses it connects to);
//! - *dependent* resources are consumed by an assignment (a template
//!   depends on the buses it reserves for immediate bits).

pub mod bus;
pub mod function_unit;
pub mod immediate_unit;
pub mod pipeline;
pub mod psocket;
pub mod template;

pub use bus::BusState;
pub use function_unit::FuSideState;
pub use immediate_unit::{IuRecord, IuState};
pub use pipeline::PipelineState;
pub use psocket::{InputPSocketState, OutputPSocketState, ReadSource, ShortImmPSocketState};
pub use template::TemplateState;

use crate::config::ConfigError;
use crate::error::{RmError, RmResult};
use crate::tta::instruction::NodeId;
use std::collections::BTreeMap;
use std::fmt;

/// Handle of a resource in the [`ResourceStore`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub usize);

/// Resource category
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    InputPSocket,
    OutputPSocket,
    ShortImmPSocket,
    Bus,
    ImmediateUnit,
    InstructionTemplate,
    InputFu,
    OutputFu,
    ExecutionPipeline,
}

/// Occupancy queries shared by every resource kind
pub trait Occupancy {
    /// Any occupant at `cycle`
    fn is_in_use(&self, cycle: i32) -> bool;
    /// At least one unit of capacity free at `cycle`
    fn is_available(&self, cycle: i32) -> bool;
    /// Highest cycle holding a reservation
    fn highest_cycle(&self) -> Option<i32>;
    fn clear(&mut self);
}

/// Resources held by at most one move per cycle
pub trait Exclusive: Occupancy {
    fn occupant(&self, cycle: i32) -> Option<NodeId>;
}

/// Resources read by several moves in one cycle as long as they agree on the source
pub trait SharedRead: Occupancy {
    fn driver(&self, cycle: i32) -> Option<&ReadSource>;
}

/// Resources reserved over (definition, use) intervals
pub trait IntervalBased: Occupancy {
    /// Intervals reserved on register `index`
    fn intervals(&self, index: usize) -> Vec<(i32, i32)>;
}

/// Single occupant per cycle table
#[derive(Clone, Debug, Default)]
pub struct CycleTable {
    slots: BTreeMap<i32, NodeId>,
}

impl CycleTable {
    pub fn occupant(&self, cycle: i32) -> Option<NodeId> {
        self.slots.get(&cycle).copied()
    }

    pub fn can_reserve(&self, cycle: i32, node: NodeId) -> bool {
        match self.slots.get(&cycle) {
            Some(occupant) => *occupant == node,
            None => true,
        }
    }

    /// Returns false if another node holds the cycle
    pub fn reserve(&mut self, cycle: i32, node: NodeId) -> bool {
        if !self.can_reserve(cycle, node) {
            return false;
        }
        self.slots.insert(cycle, node);
        true
    }

    /// Returns false if `node` does not hold the cycle
    pub fn release(&mut self, cycle: i32, node: NodeId) -> bool {
        if self.slots.get(&cycle) == Some(&node) {
            self.slots.remove(&cycle);
            true
        } else {
            false
        }
    }

    pub fn highest(&self) -> Option<i32> {
        self.slots.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Kind specific occupancy state
#[derive(Clone, Debug)]
pub enum ResourceState {
    InputPSocket(InputPSocketState),
    OutputPSocket(OutputPSocketState),
    ShortImmPSocket(ShortImmPSocketState),
    Bus(BusState),
    ImmediateUnit(IuState),
    InstructionTemplate(TemplateState),
    InputFu(FuSideState),
    OutputFu(FuSideState),
    ExecutionPipeline(PipelineState),
}

impl ResourceState {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceState::InputPSocket(_) => ResourceKind::InputPSocket,
            ResourceState::OutputPSocket(_) => ResourceKind::OutputPSocket,
            ResourceState::ShortImmPSocket(_) => ResourceKind::ShortImmPSocket,
            ResourceState::Bus(_) => ResourceKind::Bus,
            ResourceState::ImmediateUnit(_) => ResourceKind::ImmediateUnit,
            ResourceState::InstructionTemplate(_) => ResourceKind::InstructionTemplate,
            ResourceState::InputFu(_) => ResourceKind::InputFu,
            ResourceState::OutputFu(_) => ResourceKind::OutputFu,
            ResourceState::ExecutionPipeline(_) => ResourceKind::ExecutionPipeline,
        }
    }

    fn occupancy(&self) -> &dyn Occupancy {
        match self {
            ResourceState::InputPSocket(s) => s,
            ResourceState::OutputPSocket(s) => s,
            ResourceState::ShortImmPSocket(s) => s,
            ResourceState::Bus(s) => s,
            ResourceState::ImmediateUnit(s) => s,
            ResourceState::InstructionTemplate(s) => s,
            ResourceState::InputFu(s) | ResourceState::OutputFu(s) => s,
            ResourceState::ExecutionPipeline(s) => s,
        }
    }

    fn occupancy_mut(&mut self) -> &mut dyn Occupancy {
        match self {
            ResourceState::InputPSocket(s) => s,
            ResourceState::OutputPSocket(s) => s,
            ResourceState::ShortImmPSocket(s) => s,
            ResourceState::Bus(s) => s,
            ResourceState::ImmediateUnit(s) => s,
            ResourceState::InstructionTemplate(s) => s,
            ResourceState::InputFu(s) | ResourceState::OutputFu(s) => s,
            ResourceState::ExecutionPipeline(s) => s,
        }
    }
}

/// One physical resource instance
#[derive(Clone, Debug)]
pub struct SchedulingResource {
    pub name: String,
    pub state: ResourceState,
    related: Vec<Vec<ResourceId>>,
    dependent: Vec<Vec<ResourceId>>,
}

impl SchedulingResource {
    pub fn kind(&self) -> ResourceKind {
        self.state.kind()
    }

    pub fn is_in_use(&self, cycle: i32) -> bool {
        self.state.occupancy().is_in_use(cycle)
    }

    pub fn is_available(&self, cycle: i32) -> bool {
        self.state.occupancy().is_available(cycle)
    }

    pub fn highest_cycle(&self) -> Option<i32> {
        self.state.occupancy().highest_cycle()
    }

    pub fn related_group(&self, group: usize) -> &[ResourceId] {
        self.related.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependent_group(&self, group: usize) -> &[ResourceId] {
        self.dependent.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn related_group_count(&self) -> usize {
        self.related.len()
    }

    pub fn dependent_group_count(&self) -> usize {
        self.dependent.len()
    }

    pub fn has_related(&self, other: ResourceId) -> bool {
        self.related.iter().any(|g| g.contains(&other))
    }

    pub fn has_dependent(&self, other: ResourceId) -> bool {
        self.dependent.iter().any(|g| g.contains(&other))
    }
}

/// Kinds allowed in each link group; `None` means the group must not exist
fn allowed_related(kind: ResourceKind, group: usize) -> Option<&'static [ResourceKind]> {
    use ResourceKind::*;
    match (kind, group) {
        (InputPSocket, 0) => Some(&[InputFu]),
        (InputPSocket, 1) => Some(&[Bus]),
        (OutputPSocket, 0) => Some(&[OutputFu]),
        (OutputPSocket, 1) => Some(&[ImmediateUnit]),
        (OutputPSocket, 2) => Some(&[Bus]),
        (ShortImmPSocket, 0) => Some(&[Bus]),
        (Bus, 0) => Some(&[InputPSocket]),
        (Bus, 1) => Some(&[OutputPSocket]),
        (Bus, 2) => Some(&[ShortImmPSocket]),
        (ImmediateUnit, 0) => Some(&[OutputPSocket]),
        (ImmediateUnit, 1) => Some(&[InstructionTemplate]),
        (ExecutionPipeline, 0) => Some(&[InputFu, OutputFu]),
        _ => None,
    }
}

fn allowed_dependent(kind: ResourceKind, group: usize) -> Option<&'static [ResourceKind]> {
    use ResourceKind::*;
    match (kind, group) {
        (InstructionTemplate, 0) => Some(&[Bus]),
        (InstructionTemplate, 1) => Some(&[ImmediateUnit]),
        (InputFu, 0) => Some(&[InputPSocket]),
        (InputFu, 1) => Some(&[ExecutionPipeline]),
        (OutputFu, 0) => Some(&[OutputPSocket]),
        (OutputFu, 1) => Some(&[ExecutionPipeline]),
        _ => None,
    }
}

/// Arena of every scheduling resource of one machine
#[derive(Clone, Debug, Default)]
pub struct ResourceStore {
    resources: Vec<SchedulingResource>,
}

macro_rules! state_accessors {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        pub fn $get(&self, id: ResourceId) -> Option<&$ty> {
            match &self.resources.get(id.0)?.state {
                ResourceState::$variant(s) => Some(s),
                _ => None,
            }
        }

        pub fn $get_mut(&mut self, id: ResourceId) -> Option<&mut $ty> {
            match &mut self.resources.get_mut(id.0)?.state {
                ResourceState::$variant(s) => Some(s),
                _ => None,
            }
        }
    };
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, state: ResourceState) -> ResourceId {
        let id = ResourceId(self.resources.len());
        self.resources.push(SchedulingResource {
            name: name.into(),
            state,
            related: Vec::new(),
            dependent: Vec::new(),
        });
        id
    }

    pub fn get(&self, id: ResourceId) -> &SchedulingResource {
        &self.resources[id.0]
    }

    pub fn name(&self, id: ResourceId) -> &str {
        &self.resources[id.0].name
    }

    pub fn kind(&self, id: ResourceId) -> ResourceKind {
        self.resources[id.0].kind()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ResourceId> {
        (0..self.resources.len()).map(ResourceId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceId, &SchedulingResource)> {
        self.resources.iter().enumerate().map(|(i, r)| (ResourceId(i), r))
    }

    /// Link `other` into related group `group` of `id`; duplicates are ignored
    pub fn add_related(&mut self, id: ResourceId, group: usize, other: ResourceId) {
        let groups = &mut self.resources[id.0].related;
        if groups.len() <= group {
            groups.resize_with(group + 1, Vec::new);
        }
        if !groups[group].contains(&other) {
            groups[group].push(other);
        }
    }

    /// Link `other` into dependent group `group` of `id`; duplicates are ignored
    pub fn add_dependent(&mut self, id: ResourceId, group: usize, other: ResourceId) {
        let groups = &mut self.resources[id.0].dependent;
        if groups.len() <= group {
            groups.resize_with(group + 1, Vec::new);
        }
        if !groups[group].contains(&other) {
            groups[group].push(other);
        }
    }

    pub fn related(&self, id: ResourceId, group: usize) -> &[ResourceId] {
        self.resources[id.0].related_group(group)
    }

    pub fn dependent(&self, id: ResourceId, group: usize) -> &[ResourceId] {
        self.resources[id.0].dependent_group(group)
    }

    pub fn is_in_use(&self, id: ResourceId, cycle: i32) -> bool {
        self.resources[id.0].is_in_use(cycle)
    }

    pub fn is_available(&self, id: ResourceId, cycle: i32) -> bool {
        self.resources[id.0].is_available(cycle)
    }

    /// Highest reserved cycle over all resources of `kind`
    pub fn highest_cycle_of(&self, kind: ResourceKind) -> Option<i32> {
        self.resources
            .iter()
            .filter(|r| r.kind() == kind)
            .filter_map(|r| r.highest_cycle())
            .max()
    }

    /// Drop all occupancy; links stay
    pub fn clear_occupancy(&mut self) {
        for resource in &mut self.resources {
            resource.state.occupancy_mut().clear();
        }
    }

    /// Check every link group holds only the kinds it may hold
    pub fn validate_links(&self) -> Result<(), ConfigError> {
        for (id, resource) in self.iter() {
            let kind = resource.kind();
            for (group, members) in resource.related.iter().enumerate() {
                let allowed = allowed_related(kind, group).ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "Resource {} has unexpected related group {}",
                        resource.name, group
                    ))
                })?;
                self.check_members(id, members, allowed, "related")?;
            }
            for (group, members) in resource.dependent.iter().enumerate() {
                let allowed = allowed_dependent(kind, group).ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "Resource {} has unexpected dependent group {}",
                        resource.name, group
                    ))
                })?;
                self.check_members(id, members, allowed, "dependent")?;
            }

            let required = match kind {
                ResourceKind::InputPSocket => resource.related_group(1).is_empty(),
                ResourceKind::OutputPSocket => resource.related_group(2).is_empty(),
                ResourceKind::ImmediateUnit => resource.related_group(0).is_empty(),
                ResourceKind::InputFu | ResourceKind::OutputFu => resource.dependent_group(1).len() != 1,
                _ => false,
            };
            if required {
                return Err(ConfigError::Validation(format!(
                    "Resource {} is missing a required link",
                    resource.name
                )));
            }
        }
        Ok(())
    }

    fn check_members(
        &self,
        id: ResourceId,
        members: &[ResourceId],
        allowed: &[ResourceKind],
        relation: &str,
    ) -> Result<(), ConfigError> {
        for member in members {
            if !allowed.contains(&self.kind(*member)) {
                return Err(ConfigError::Validation(format!(
                    "Resource {} has {} resource {} of unexpected kind {:?}",
                    self.name(id),
                    relation,
                    self.name(*member),
                    self.kind(*member)
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn not_assigned(&self, id: ResourceId, cycle: i32) -> RmError {
        RmError::NotAssigned {
            resource: self.name(id).to_string(),
            cycle,
        }
    }

    pub(crate) fn wrong_kind(&self, id: ResourceId, expected: ResourceKind) -> RmError {
        RmError::invalid_use(format!(
            "resource {} is {:?}, expected {:?}",
            self.name(id),
            self.kind(id),
            expected
        ))
    }

    state_accessors!(input_psocket, input_psocket_mut, InputPSocket, InputPSocketState);
    state_accessors!(output_psocket, output_psocket_mut, OutputPSocket, OutputPSocketState);
    state_accessors!(short_imm_psocket, short_imm_psocket_mut, ShortImmPSocket, ShortImmPSocketState);
    state_accessors!(bus, bus_mut, Bus, BusState);
    state_accessors!(immediate_unit, immediate_unit_mut, ImmediateUnit, IuState);
    state_accessors!(template, template_mut, InstructionTemplate, TemplateState);
    state_accessors!(pipeline, pipeline_mut, ExecutionPipeline, PipelineState);

    pub fn fu_side(&self, id: ResourceId) -> Option<&FuSideState> {
        match &self.resources.get(id.0)?.state {
            ResourceState::InputFu(s) | ResourceState::OutputFu(s) => Some(s),
            _ => None,
        }
    }

    pub fn fu_side_mut(&mut self, id: ResourceId) -> Option<&mut FuSideState> {
        match &mut self.resources.get_mut(id.0)?.state {
            ResourceState::InputFu(s) | ResourceState::OutputFu(s) => Some(s),
            _ => None,
        }
    }

    /// Fetch typed state or fail with an invalid use error
    pub(crate) fn expect_kind(&self, id: ResourceId, kind: ResourceKind) -> RmResult<&SchedulingResource> {
        match self.resources.get(id.0) {
            Some(r) if r.kind() == kind => Ok(r),
            Some(_) => Err(self.wrong_kind(id, kind)),
            None => Err(RmError::invalid_use(format!("unknown resource {:?}", id))),
        }
    }
}

impl fmt::Display for ResourceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, resource) in self.iter() {
            write!(f, "{:>4} {:<18} {:?}", id.0, resource.name, resource.kind())?;
            if let Some(highest) = resource.highest_cycle() {
                let busy: Vec<String> = (0..=highest)
                    .filter(|c| resource.is_in_use(*c))
                    .map(|c| c.to_string())
                    .collect();
                write!(f, " in use: [{}]", busy.join(" "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_table_exclusive() {
        let mut table = CycleTable::default();
        assert!(table.reserve(3, NodeId(0)));
        // idempotent for the same node
        assert!(table.reserve(3, NodeId(0)));
        assert_eq!(table.len(), 1);
        assert!(!table.reserve(3, NodeId(1)));
        assert!(!table.release(3, NodeId(1)));
        assert!(table.release(3, NodeId(0)));
        assert!(!table.release(3, NodeId(0)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_link_validation() {
        let mut store = ResourceStore::new();
        let bus = store.add("B0", ResourceState::Bus(BusState::new(32, 0)));
        let socket = store.add("s", ResourceState::InputPSocket(InputPSocketState::default()));
        store.add_related(bus, 0, socket);
        store.add_related(socket, 1, bus);
        store.add_related(socket, 1, bus);
        assert_eq!(store.related(socket, 1), &[bus]);
        assert!(store.validate_links().is_ok());

        // a bus in the function unit group is rejected
        store.add_related(socket, 0, bus);
        assert!(store.validate_links().is_err());
    }

    #[test]
    fn test_missing_required_link() {
        let mut store = ResourceStore::new();
        store.add("dangling", ResourceState::InputPSocket(InputPSocketState::default()));
        assert!(matches!(store.validate_links(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_typed_accessors() {
        let mut store = ResourceStore::new();
        let bus = store.add("B0", ResourceState::Bus(BusState::new(32, 0)));
        assert!(store.bus(bus).is_some());
        assert!(store.template(bus).is_none());
        assert!(store.expect_kind(bus, ResourceKind::InputPSocket).is_err());
        assert_eq!(store.kind(bus), ResourceKind::Bus);
    }
}
