// src/resource/bus.rs
//! Transport bus resource

use super::{CycleTable, Exclusive, Occupancy, ResourceId, ResourceKind, ResourceStore};
use crate::error::{RmError, RmResult};
use crate::tta::instruction::NodeId;

/// Related groups of a bus: input sockets, output sockets, short immediate socket
pub const BUS_INPUT_SOCKETS: usize = 0;
pub const BUS_OUTPUT_SOCKETS: usize = 1;
pub const BUS_SHORT_IMMEDIATE: usize = 2;

#[derive(Clone, Debug)]
pub struct BusState {
    table: CycleTable,
    pub width: u32,
    /// Number of template slots that reserve this bus for long immediates
    pub limm_slots: usize,
}

impl BusState {
    pub fn new(width: u32, limm_slots: usize) -> Self {
        Self {
            table: CycleTable::default(),
            width,
            limm_slots,
        }
    }
}

impl Occupancy for BusState {
    fn is_in_use(&self, cycle: i32) -> bool {
        self.table.occupant(cycle).is_some()
    }

    fn is_available(&self, cycle: i32) -> bool {
        !self.is_in_use(cycle)
    }

    fn highest_cycle(&self) -> Option<i32> {
        self.table.highest()
    }

    fn clear(&mut self) {
        self.table.clear();
    }
}

impl Exclusive for BusState {
    fn occupant(&self, cycle: i32) -> Option<NodeId> {
        self.table.occupant(cycle)
    }
}

impl ResourceStore {
    /// Can `node` travel on `bus` at `cycle` from `output` (an output or
    /// short immediate socket) to `input`
    pub fn bus_can_assign(
        &self,
        bus: ResourceId,
        cycle: i32,
        node: NodeId,
        output: ResourceId,
        input: ResourceId,
    ) -> bool {
        let state = match self.bus(bus) {
            Some(state) => state,
            None => return false,
        };
        if !state.table.can_reserve(cycle, node) {
            return false;
        }
        let resource = self.get(bus);
        let source_connected = resource.related_group(BUS_OUTPUT_SOCKETS).contains(&output)
            || resource.related_group(BUS_SHORT_IMMEDIATE).contains(&output);
        source_connected && resource.related_group(BUS_INPUT_SOCKETS).contains(&input)
    }

    pub fn bus_assign(&mut self, bus: ResourceId, cycle: i32, node: NodeId) -> RmResult<()> {
        self.expect_kind(bus, ResourceKind::Bus)?;
        let reserved = self
            .bus_mut(bus)
            .map(|s| s.table.reserve(cycle, node))
            .unwrap_or(false);
        if reserved {
            Ok(())
        } else {
            Err(RmError::invalid_use(format!(
                "bus {} already carries a move at cycle {}",
                self.name(bus),
                cycle
            )))
        }
    }

    pub fn bus_unassign(&mut self, bus: ResourceId, cycle: i32, node: NodeId) -> RmResult<()> {
        self.expect_kind(bus, ResourceKind::Bus)?;
        let released = self
            .bus_mut(bus)
            .map(|s| s.table.release(cycle, node))
            .unwrap_or(false);
        if released {
            Ok(())
        } else {
            Err(self.not_assigned(bus, cycle))
        }
    }

    /// Short immediate socket of a bus, if it carries short immediates
    pub fn bus_short_immediate(&self, bus: ResourceId) -> Option<ResourceId> {
        self.related(bus, BUS_SHORT_IMMEDIATE).first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{InputPSocketState, OutputPSocketState, ResourceState};

    #[test]
    fn test_bus_requires_connected_sockets() {
        let mut store = ResourceStore::new();
        let bus = store.add("B0", ResourceState::Bus(BusState::new(32, 0)));
        let out = store.add("o", ResourceState::OutputPSocket(OutputPSocketState::default()));
        let inp = store.add("i", ResourceState::InputPSocket(InputPSocketState::default()));
        let other = store.add("x", ResourceState::InputPSocket(InputPSocketState::default()));
        store.add_related(bus, BUS_INPUT_SOCKETS, inp);
        store.add_related(bus, BUS_OUTPUT_SOCKETS, out);

        assert!(store.bus_can_assign(bus, 0, NodeId(0), out, inp));
        assert!(!store.bus_can_assign(bus, 0, NodeId(0), out, other));

        store.bus_assign(bus, 0, NodeId(0)).unwrap();
        assert!(!store.bus_can_assign(bus, 0, NodeId(1), out, inp));
        assert!(store.bus_can_assign(bus, 0, NodeId(0), out, inp));
        assert_eq!(store.bus(bus).unwrap().occupant(0), Some(NodeId(0)));

        store.bus_unassign(bus, 0, NodeId(0)).unwrap();
        assert!(matches!(
            store.bus_unassign(bus, 0, NodeId(0)),
            Err(RmError::NotAssigned { .. })
        ));
    }
}
