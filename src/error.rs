// src/error.rs
//! Errors raised by the resource manager
//!
//! Infeasibility is not an error: it is reported through `bool`, empty
//! candidate lists and [`CycleBound::Infeasible`](crate::manager::CycleBound).

use crate::config::ConfigError;
use crate::tta::instruction::NodeId;

pub type RmResult<T> = Result<T, RmError>;

#[derive(Debug, thiserror::Error)]
pub enum RmError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid use: {0}")]
    InvalidUse(String),

    #[error("Resource {resource} not assigned at cycle {cycle}")]
    NotAssigned { resource: String, cycle: i32 },

    #[error("No resource assignment found for {node} at cycle {cycle}")]
    NoAssignment { node: NodeId, cycle: i32 },

    #[error("{broker} does not implement {method}")]
    NotImplemented { broker: String, method: &'static str },
}

impl RmError {
    pub fn invalid_use(message: impl Into<String>) -> Self {
        RmError::InvalidUse(message.into())
    }
}
