// src/resource/immediate_unit.rs
//! Long immediate unit resource
//!
//! Registers are reserved over a (definition, use) interval: the value is
//! written by an instruction template at the definition cycle and read by
//! a move at the use cycle.

use super::{IntervalBased, Occupancy, ResourceId, ResourceKind, ResourceStore};
use crate::config::Extension;
use crate::error::{RmError, RmResult};
use crate::tta::immediate_unit::required_immediate_width;
use crate::tta::instruction::{ImmediateValue, NodeId};

/// Related groups of an immediate unit: output sockets, templates writing it
pub const IU_OUTPUT_SOCKETS: usize = 0;
pub const IU_TEMPLATES: usize = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IuRecord {
    pub definition: i32,
    pub use_cycle: i32,
    pub value: ImmediateValue,
    pub node: NodeId,
}

impl IuRecord {
    fn conflicts(&self, definition: i32, use_cycle: i32) -> bool {
        let use_inside = use_cycle > self.definition && use_cycle <= self.use_cycle;
        let def_inside = definition >= self.definition && definition < self.use_cycle;
        let contains = self.definition >= definition && self.definition < use_cycle;
        use_inside || def_inside || contains || definition == self.definition
    }
}

#[derive(Clone, Debug)]
pub struct IuState {
    registers: Vec<Vec<IuRecord>>,
    pub width: u32,
    pub latency: u32,
    pub extension: Extension,
}

impl IuState {
    pub fn new(registers: usize, width: u32, latency: u32, extension: Extension) -> Self {
        Self {
            registers: vec![Vec::new(); registers],
            width,
            latency,
            extension,
        }
    }

    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    /// First register (or `index` only, when given) free over the interval
    pub fn find_available(&self, definition: i32, use_cycle: i32, index: Option<usize>) -> Option<usize> {
        let free = |i: &usize| {
            self.registers[*i]
                .iter()
                .all(|r| !r.conflicts(definition, use_cycle))
        };
        match index {
            Some(i) if i < self.registers.len() => Some(i).filter(free),
            Some(_) => None,
            None => (0..self.registers.len()).find(free),
        }
    }

    pub fn fits(&self, value: &ImmediateValue) -> bool {
        required_immediate_width(value.value, value.width, self.extension) <= self.width
    }

    /// Occupancy rules of the unit itself, without the output socket check
    pub fn can_assign(&self, definition: i32, use_cycle: i32, value: &ImmediateValue, index: Option<usize>) -> bool {
        definition <= use_cycle
            && (use_cycle - definition) as i64 >= self.latency as i64
            && self.fits(value)
            && self.find_available(definition, use_cycle, index).is_some()
    }

    pub fn record_of(&self, node: NodeId) -> Option<(usize, &IuRecord)> {
        self.registers.iter().enumerate().find_map(|(i, records)| {
            records.iter().find(|r| r.node == node).map(|r| (i, r))
        })
    }

    pub fn record_count(&self) -> usize {
        self.registers.iter().map(Vec::len).sum()
    }
}

impl Occupancy for IuState {
    fn is_in_use(&self, cycle: i32) -> bool {
        self.registers
            .iter()
            .flatten()
            .any(|r| r.definition <= cycle && cycle <= r.use_cycle)
    }

    fn is_available(&self, cycle: i32) -> bool {
        self.registers
            .iter()
            .any(|records| records.iter().all(|r| cycle < r.definition || cycle > r.use_cycle))
    }

    fn highest_cycle(&self) -> Option<i32> {
        self.registers.iter().flatten().map(|r| r.use_cycle).max()
    }

    fn clear(&mut self) {
        for records in &mut self.registers {
            records.clear();
        }
    }
}

impl IntervalBased for IuState {
    fn intervals(&self, index: usize) -> Vec<(i32, i32)> {
        self.registers
            .get(index)
            .map(|records| records.iter().map(|r| (r.definition, r.use_cycle)).collect())
            .unwrap_or_default()
    }
}

impl ResourceStore {
    /// Full check: interval, width, latency and a free output socket at the use cycle
    pub fn iu_can_assign(
        &self,
        iu: ResourceId,
        definition: i32,
        use_cycle: i32,
        value: &ImmediateValue,
        index: Option<usize>,
    ) -> bool {
        let state = match self.immediate_unit(iu) {
            Some(state) => state,
            None => return false,
        };
        state.can_assign(definition, use_cycle, value, index)
            && self
                .related(iu, IU_OUTPUT_SOCKETS)
                .iter()
                .any(|socket| !self.is_in_use(*socket, use_cycle))
    }

    /// Reserve a register; returns its index
    pub fn iu_assign(
        &mut self,
        iu: ResourceId,
        definition: i32,
        use_cycle: i32,
        node: NodeId,
        value: ImmediateValue,
        index: Option<usize>,
    ) -> RmResult<usize> {
        self.expect_kind(iu, ResourceKind::ImmediateUnit)?;
        let name = self.name(iu).to_string();
        let state = self
            .immediate_unit_mut(iu)
            .ok_or_else(|| RmError::invalid_use(format!("{} is not an immediate unit", name)))?;

        if definition > use_cycle {
            return Err(RmError::invalid_use(format!(
                "{}: immediate written at {} after its use at {}",
                name, definition, use_cycle
            )));
        }
        if ((use_cycle - definition) as i64) < state.latency as i64 {
            return Err(RmError::invalid_use(format!(
                "{}: immediate read {} cycles after write, latency is {}",
                name,
                use_cycle - definition,
                state.latency
            )));
        }
        if let Some((register, record)) = state.record_of(node) {
            if record.definition == definition && record.use_cycle == use_cycle {
                return Ok(register);
            }
        }
        let register = state
            .find_available(definition, use_cycle, index)
            .ok_or_else(|| RmError::invalid_use(format!("{}: no free register for {}..{}", name, definition, use_cycle)))?;
        state.registers[register].push(IuRecord {
            definition,
            use_cycle,
            value,
            node,
        });
        Ok(register)
    }

    /// Release the register read by `node` at `use_cycle`, returning its record
    pub fn iu_unassign(&mut self, iu: ResourceId, use_cycle: i32, node: NodeId) -> RmResult<IuRecord> {
        self.expect_kind(iu, ResourceKind::ImmediateUnit)?;
        let removed = self.immediate_unit_mut(iu).and_then(|state| {
            state.registers.iter_mut().find_map(|records| {
                records
                    .iter()
                    .position(|r| r.node == node && r.use_cycle == use_cycle)
                    .map(|pos| records.remove(pos))
            })
        });
        removed.ok_or_else(|| self.not_assigned(iu, use_cycle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{OutputPSocketState, ReadSource, ResourceState};
    use crate::tta::processor::{IuId, PortRef, UnitRef};

    fn store_with_iu(registers: usize, width: u32, extension: Extension) -> (ResourceStore, ResourceId, ResourceId) {
        let mut store = ResourceStore::new();
        let iu = store.add("IMM", ResourceState::ImmediateUnit(IuState::new(registers, width, 1, extension)));
        let socket = store.add("imm_o1", ResourceState::OutputPSocket(OutputPSocketState::default()));
        store.add_related(iu, IU_OUTPUT_SOCKETS, socket);
        (store, iu, socket)
    }

    #[test]
    fn test_interval_reservation() {
        let (mut store, iu, _) = store_with_iu(1, 32, Extension::Sign);
        let value = ImmediateValue::new(100_000, 32);
        assert_eq!(store.iu_assign(iu, 2, 5, NodeId(0), value, None).unwrap(), 0);

        // overlapping use, overlapping definition, containing interval
        assert!(!store.iu_can_assign(iu, 0, 3, &value, None));
        assert!(!store.iu_can_assign(iu, 3, 7, &value, None));
        assert!(!store.iu_can_assign(iu, 1, 6, &value, None));
        // touching intervals share the register
        assert!(store.iu_can_assign(iu, 5, 7, &value, None));
        assert!(store.iu_can_assign(iu, 0, 2, &value, None));
    }

    #[test]
    fn test_latency_and_width() {
        let (store, iu, _) = store_with_iu(2, 8, Extension::Zero);
        assert!(!store.iu_can_assign(iu, 3, 3, &ImmediateValue::new(1, 32), None));
        assert!(store.iu_can_assign(iu, 2, 3, &ImmediateValue::new(255, 32), None));
        assert!(!store.iu_can_assign(iu, 2, 3, &ImmediateValue::new(256, 32), None));
        assert!(!store.iu_can_assign(iu, 4, 3, &ImmediateValue::new(1, 32), None));
    }

    #[test]
    fn test_requires_free_output_socket() {
        let (mut store, iu, socket) = store_with_iu(1, 32, Extension::Sign);
        let source = ReadSource {
            port: PortRef::new(UnitRef::ImmediateUnit(IuId(0)), 0),
            register: Some(0),
        };
        store.output_psocket_assign(socket, 4, NodeId(9), source).unwrap();
        assert!(!store.iu_can_assign(iu, 1, 4, &ImmediateValue::new(1, 32), None));
        assert!(store.iu_can_assign(iu, 1, 5, &ImmediateValue::new(1, 32), None));
    }

    #[test]
    fn test_assign_errors_and_unassign() {
        let (mut store, iu, _) = store_with_iu(1, 32, Extension::Sign);
        let value = ImmediateValue::new(7, 32);
        assert!(store.iu_assign(iu, 5, 4, NodeId(0), value, None).is_err());
        assert!(store.iu_assign(iu, 4, 4, NodeId(0), value, None).is_err());

        store.iu_assign(iu, 3, 4, NodeId(0), value, None).unwrap();
        assert!(store.is_in_use(iu, 3));
        assert_eq!(store.immediate_unit(iu).unwrap().intervals(0), vec![(3, 4)]);

        let record = store.iu_unassign(iu, 4, NodeId(0)).unwrap();
        assert_eq!(record.value, value);
        assert!(matches!(store.iu_unassign(iu, 4, NodeId(0)), Err(RmError::NotAssigned { .. })));
        assert!(!store.is_in_use(iu, 3));
    }

    #[test]
    fn test_register_index_request() {
        let (mut store, iu, _) = store_with_iu(2, 32, Extension::Sign);
        let value = ImmediateValue::new(7, 32);
        assert_eq!(store.iu_assign(iu, 0, 2, NodeId(0), value, Some(1)).unwrap(), 1);
        assert_eq!(store.iu_assign(iu, 0, 2, NodeId(1), value, None).unwrap(), 0);
        assert!(!store.iu_can_assign(iu, 1, 3, &value, None));
        assert!(!store.iu_can_assign(iu, 0, 2, &value, Some(5)));
    }
}
