// src/tta/listing.rs
//! TOML program listings
//!
//! A listing names the operations of a block and lists its moves in
//! program order:
//!
//! ```toml
//! [[operations]]
//! label = "sum"
//! operation = "add"
//!
//! [[moves]]
//! source = "RF.1"
//! destination = "sum.1"
//!
//! [[moves]]
//! source = "#1000"
//! destination = "sum.2"
//!
//! [[moves]]
//! source = "sum.3"
//! destination = "RF.2"
//! guard = "?BOOL.0"
//! ```
//!
//! Terminals are `#<value>` constants, `@<value>` address constants,
//! `<register file>.<index>` registers and `<label>.<operand>` operands of
//! a listed operation.

use crate::config::ConfigError;
use crate::tta::instruction::{BasicBlock, ImmediateValue, Move, NodeId, OpId, Terminal};
use crate::tta::processor::{Guard, Machine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramListing {
    #[serde(default)]
    pub operations: Vec<OperationListing>,
    #[serde(default)]
    pub moves: Vec<MoveListing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationListing {
    pub label: String,
    pub operation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveListing {
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    /// Bus the move must use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
    /// Width of a constant source in bits
    #[serde(default = "default_immediate_width")]
    pub immediate_width: u32,
    #[serde(default)]
    pub long_immediate: bool,
}

fn default_immediate_width() -> u32 {
    32
}

/// Which side of a move a terminal sits on
#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Source,
    Destination,
}

impl ProgramListing {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build the block of this listing for `machine`; node ids follow listing order
    pub fn to_block(&self, machine: &Machine) -> Result<(BasicBlock, Vec<NodeId>), ConfigError> {
        let mut block = BasicBlock::new();
        let mut labels: HashMap<&str, (OpId, String)> = HashMap::new();
        for op in &self.operations {
            if machine.units_with_operation(&op.operation.to_lowercase()).next().is_none() {
                return Err(ConfigError::Validation(format!(
                    "No function unit implements operation {}",
                    op.operation
                )));
            }
            let id = block.add_operation(&op.operation);
            if labels
                .insert(op.label.as_str(), (id, op.operation.to_lowercase()))
                .is_some()
            {
                return Err(ConfigError::Validation(format!("Duplicate operation label: {}", op.label)));
            }
        }

        let mut nodes = Vec::with_capacity(self.moves.len());
        for listed in &self.moves {
            let source = parse_terminal(machine, &labels, &listed.source, listed.immediate_width, Side::Source)?;
            let destination = parse_terminal(machine, &labels, &listed.destination, 32, Side::Destination)?;
            let node = block.add_move(Move::new(source, destination));

            let moved = block.node_mut(node);
            if let Some(guard) = &listed.guard {
                moved.transport.guard = Some(parse_guard(machine, guard)?);
            }
            if let Some(bus) = &listed.bus {
                let id = machine
                    .bus_by_name(bus)
                    .ok_or_else(|| ConfigError::Validation(format!("Unknown bus {}", bus)))?;
                moved.transport.bus = Some(id);
            }
            moved.requires_long_immediate = listed.long_immediate;
            nodes.push(node);
        }
        Ok((block, nodes))
    }
}

fn parse_terminal(
    machine: &Machine,
    labels: &HashMap<&str, (OpId, String)>,
    text: &str,
    immediate_width: u32,
    side: Side,
) -> Result<Terminal, ConfigError> {
    let text = text.trim();
    let number = |s: &str| {
        s.parse::<i64>()
            .map_err(|_| ConfigError::Parse(format!("Bad constant: {}", text)))
    };
    if let Some(value) = text.strip_prefix('#') {
        if side == Side::Destination {
            return Err(ConfigError::Validation(format!("Constant {} cannot be written", text)));
        }
        return Ok(Terminal::Immediate(ImmediateValue::new(number(value)?, immediate_width)));
    }
    if let Some(value) = text.strip_prefix('@') {
        if side == Side::Destination {
            return Err(ConfigError::Validation(format!("Constant {} cannot be written", text)));
        }
        return Ok(Terminal::Immediate(ImmediateValue::address(number(value)?, immediate_width)));
    }

    let (unit, index) = text
        .rsplit_once('.')
        .ok_or_else(|| ConfigError::Parse(format!("Bad terminal: {}", text)))?;
    let index: usize = index
        .parse()
        .map_err(|_| ConfigError::Parse(format!("Bad index in {}", text)))?;
    if let Some((op, operation)) = labels.get(unit) {
        return Ok(Terminal::operand(operation, index as u32, Some(*op)));
    }
    if let Some(rf) = machine.register_file_by_name(unit) {
        if index >= machine.register_file(rf).size {
            return Err(ConfigError::Validation(format!("Register {} out of range", text)));
        }
        return Ok(Terminal::register(rf, index));
    }
    Err(ConfigError::Validation(format!("Unknown unit or label in {}", text)))
}

fn parse_guard(machine: &Machine, text: &str) -> Result<Guard, ConfigError> {
    let text = text.trim();
    let (inverted, rest) = match text.chars().next() {
        Some('!') => (true, &text[1..]),
        Some('?') => (false, &text[1..]),
        _ => (false, text),
    };
    let (rf, index) = rest
        .rsplit_once('.')
        .ok_or_else(|| ConfigError::Parse(format!("Bad guard: {}", text)))?;
    let rf = machine
        .register_file_by_name(rf)
        .ok_or_else(|| ConfigError::Validation(format!("Unknown guard register file in {}", text)))?;
    let index = index
        .parse()
        .map_err(|_| ConfigError::Parse(format!("Bad guard index: {}", text)))?;
    Ok(Guard::Register { rf, index, inverted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    const LISTING: &str = r##"
[[operations]]
label = "sum"
operation = "ADD"

[[moves]]
source = "RF.1"
destination = "sum.1"

[[moves]]
source = "#100000"
destination = "sum.2"

[[moves]]
source = "sum.3"
destination = "RF.2"
guard = "!BOOL.0"
bus = "B0"
"##;

    #[test]
    fn test_listing_builds_operation() {
        let machine = Machine::from_config(&MachineConfig::default_test()).unwrap();
        let listing = ProgramListing::from_toml_str(LISTING).unwrap();
        let (block, nodes) = listing.to_block(&machine).unwrap();

        assert_eq!(nodes.len(), 3);
        let op = block.node(nodes[0]).destination_operation().unwrap();
        assert_eq!(block.operation(op).operation, "add");
        assert_eq!(block.operation(op).inputs, vec![nodes[0], nodes[1]]);
        assert_eq!(block.operation(op).outputs, vec![nodes[2]]);
        assert!(block.node(nodes[2]).transport.source.is_fu_port());
        assert_eq!(
            block.node(nodes[1]).transport.source.immediate_value(),
            Some(ImmediateValue::new(100000, 32))
        );
        let result = &block.node(nodes[2]).transport;
        assert!(result.guard.map(|g| g.is_inverted()).unwrap_or(false));
        assert_eq!(result.bus, machine.bus_by_name("B0"));
    }

    #[test]
    fn test_listing_errors() {
        let machine = Machine::from_config(&MachineConfig::default_test()).unwrap();
        let bad_register = ProgramListing::from_toml_str(
            r##"
[[moves]]
source = "RF.99"
destination = "RF.1"
"##,
        )
        .unwrap();
        assert!(bad_register.to_block(&machine).is_err());

        let constant_destination = ProgramListing::from_toml_str(
            r##"
[[moves]]
source = "RF.1"
destination = "#3"
"##,
        )
        .unwrap();
        assert!(constant_destination.to_block(&machine).is_err());

        let unknown_operation = ProgramListing::from_toml_str(
            r##"
[[operations]]
label = "x"
operation = "fma"
"##,
        )
        .unwrap();
        assert!(unknown_operation.to_block(&machine).is_err());
    }
}
