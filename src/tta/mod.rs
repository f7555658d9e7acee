// src/tta/mod.rs
//! Transport-Triggered Architecture machine and program model

pub mod functional_unit;
pub mod immediate_unit;
pub mod instruction;
pub mod listing;
pub mod processor;

// Re-export core types for easy access
pub use functional_unit::{FunctionUnit, HwOperation};
pub use immediate_unit::ImmediateUnit;
pub use instruction::{BasicBlock, Immediate, ImmediateValue, Instruction, Move, MoveNode, NodeId, OpId, Terminal};
pub use listing::ProgramListing;
pub use processor::{Guard, Machine};
