// src/resource/psocket.rs
//! Port-socket resources: the connection points between unit ports and buses

use super::{CycleTable, Exclusive, Occupancy, ResourceId, ResourceKind, ResourceStore, SharedRead};
use crate::config::Extension;
use crate::error::RmResult;
use crate::tta::instruction::NodeId;
use crate::tta::processor::PortRef;
use std::collections::BTreeMap;

/// Input socket: one write per cycle
#[derive(Clone, Debug, Default)]
pub struct InputPSocketState {
    table: CycleTable,
}

impl Occupancy for InputPSocketState {
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

impl Exclusive for InputPSocketState {
    fn occupant(&self, cycle: i32) -> Option<NodeId> {
        self.table.occupant(cycle)
    }
}

/// The port (and register) driving an output socket in one cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadSource {
    pub port: PortRef,
    /// Register index for register file and immediate unit reads
    pub register: Option<usize>,
}

/// Output socket: several readers per cycle, all of the same source
#[derive(Clone, Debug, Default)]
pub struct OutputPSocketState {
    reads: BTreeMap<i32, (ReadSource, Vec<NodeId>)>,
}

impl OutputPSocketState {
    pub fn can_assign(&self, cycle: i32, source: &ReadSource) -> bool {
        match self.reads.get(&cycle) {
            Some((driver, _)) => driver == source,
            None => true,
        }
    }

    pub fn readers(&self, cycle: i32) -> &[NodeId] {
        self.reads.get(&cycle).map(|(_, r)| r.as_slice()).unwrap_or(&[])
    }
}

impl Occupancy for OutputPSocketState {
    fn is_in_use(&self, cycle: i32) -> bool {
        self.reads.contains_key(&cycle)
    }

    fn is_available(&self, _cycle: i32) -> bool {
        true
    }

    fn highest_cycle(&self) -> Option<i32> {
        self.reads.keys().next_back().copied()
    }

    fn clear(&mut self) {
        self.reads.clear();
    }
}

impl SharedRead for OutputPSocketState {
    fn driver(&self, cycle: i32) -> Option<&ReadSource> {
        self.reads.get(&cycle).map(|(d, _)| d)
    }
}

/// Short immediate field of a bus, modelled as the socket the constant is read from
#[derive(Clone, Debug)]
pub struct ShortImmPSocketState {
    pub width: u32,
    pub extension: Extension,
}

impl Occupancy for ShortImmPSocketState {
    fn is_in_use(&self, _cycle: i32) -> bool {
        false
    }

    fn is_available(&self, _cycle: i32) -> bool {
        true
    }

    fn highest_cycle(&self) -> Option<i32> {
        None
    }

    fn clear(&mut self) {}
}

impl ResourceStore {
    /// Can `node` write through input socket `socket` at `cycle`
    pub fn input_psocket_can_assign(&self, socket: ResourceId, cycle: i32, node: NodeId) -> bool {
        self.input_psocket(socket)
            .map(|s| s.table.can_reserve(cycle, node))
            .unwrap_or(false)
    }

    pub fn input_psocket_assign(&mut self, socket: ResourceId, cycle: i32, node: NodeId) -> RmResult<()> {
        self.expect_kind(socket, ResourceKind::InputPSocket)?;
        let reserved = self
            .input_psocket_mut(socket)
            .map(|s| s.table.reserve(cycle, node))
            .unwrap_or(false);
        if reserved {
            Ok(())
        } else {
            Err(crate::error::RmError::invalid_use(format!(
                "{} already in use at cycle {}",
                self.name(socket),
                cycle
            )))
        }
    }

    pub fn input_psocket_unassign(&mut self, socket: ResourceId, cycle: i32, node: NodeId) -> RmResult<()> {
        self.expect_kind(socket, ResourceKind::InputPSocket)?;
        let released = self
            .input_psocket_mut(socket)
            .map(|s| s.table.release(cycle, node))
            .unwrap_or(false);
        if released {
            Ok(())
        } else {
            Err(self.not_assigned(socket, cycle))
        }
    }

    /// Can `socket` be read at `cycle` with `source` driving it
    pub fn output_psocket_can_assign(&self, socket: ResourceId, cycle: i32, source: &ReadSource) -> bool {
        self.output_psocket(socket)
            .map(|s| s.can_assign(cycle, source))
            .unwrap_or(false)
    }

    pub fn output_psocket_assign(
        &mut self,
        socket: ResourceId,
        cycle: i32,
        node: NodeId,
        source: ReadSource,
    ) -> RmResult<()> {
        self.expect_kind(socket, ResourceKind::OutputPSocket)?;
        if !self.output_psocket_can_assign(socket, cycle, &source) {
            return Err(crate::error::RmError::invalid_use(format!(
                "{} driven by another source at cycle {}",
                self.name(socket),
                cycle
            )));
        }
        if let Some(state) = self.output_psocket_mut(socket) {
            let (_, readers) = state.reads.entry(cycle).or_insert_with(|| (source, Vec::new()));
            if !readers.contains(&node) {
                readers.push(node);
            }
        }
        Ok(())
    }

    pub fn output_psocket_unassign(&mut self, socket: ResourceId, cycle: i32, node: NodeId) -> RmResult<()> {
        self.expect_kind(socket, ResourceKind::OutputPSocket)?;
        let mut found = false;
        if let Some(state) = self.output_psocket_mut(socket) {
            if let Some((_, readers)) = state.reads.get_mut(&cycle) {
                if let Some(pos) = readers.iter().position(|n| *n == node) {
                    readers.remove(pos);
                    found = true;
                }
                if readers.is_empty() {
                    state.reads.remove(&cycle);
                }
            }
        }
        if found {
            Ok(())
        } else {
            Err(self.not_assigned(socket, cycle))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceState;
    use crate::tta::processor::{RfId, UnitRef};

    fn rf_source(register: usize) -> ReadSource {
        ReadSource {
            port: PortRef::new(UnitRef::RegisterFile(RfId(0)), 0),
            register: Some(register),
        }
    }

    #[test]
    fn test_input_socket_exclusive() {
        let mut store = ResourceStore::new();
        let s = store.add("in", ResourceState::InputPSocket(InputPSocketState::default()));
        store.input_psocket_assign(s, 2, NodeId(0)).unwrap();
        assert!(store.is_in_use(s, 2));
        assert!(!store.input_psocket_can_assign(s, 2, NodeId(1)));
        assert!(store.input_psocket_can_assign(s, 3, NodeId(1)));
        assert!(store.input_psocket_assign(s, 2, NodeId(1)).is_err());
        store.input_psocket_unassign(s, 2, NodeId(0)).unwrap();
        assert!(store.input_psocket_unassign(s, 2, NodeId(0)).is_err());
    }

    #[test]
    fn test_output_socket_broadcast_same_source() {
        let mut store = ResourceStore::new();
        let s = store.add("out", ResourceState::OutputPSocket(OutputPSocketState::default()));
        store.output_psocket_assign(s, 1, NodeId(0), rf_source(3)).unwrap();
        assert!(store.output_psocket_can_assign(s, 1, &rf_source(3)));
        assert!(!store.output_psocket_can_assign(s, 1, &rf_source(4)));
        store.output_psocket_assign(s, 1, NodeId(1), rf_source(3)).unwrap();
        assert_eq!(store.output_psocket(s).unwrap().readers(1).len(), 2);
        assert!(store.is_available(s, 1));

        store.output_psocket_unassign(s, 1, NodeId(0)).unwrap();
        assert!(store.is_in_use(s, 1));
        store.output_psocket_unassign(s, 1, NodeId(1)).unwrap();
        assert!(!store.is_in_use(s, 1));
        assert!(store.output_psocket_can_assign(s, 1, &rf_source(4)));
    }

    #[test]
    fn test_output_socket_rejects_mixed_drivers() {
        let mut store = ResourceStore::new();
        let s = store.add("out", ResourceState::OutputPSocket(OutputPSocketState::default()));
        let iu = ReadSource {
            port: PortRef::new(UnitRef::ImmediateUnit(crate::tta::processor::IuId(0)), 0),
            register: Some(0),
        };
        store.output_psocket_assign(s, 0, NodeId(0), iu.clone()).unwrap();
        assert!(store.output_psocket_assign(s, 0, NodeId(1), rf_source(0)).is_err());
        assert_eq!(store.output_psocket(s).unwrap().driver(0), Some(&iu));
    }
}
