// src/tta/functional_unit.rs
//! Function unit description: ports, hardware operations and the
//! pipeline resources each operation occupies after it is triggered.

use crate::config::{ConfigError, FunctionUnitConfig};
use crate::tta::processor::{Port, SocketNames};

/// Pipeline resource usage of one operation, relative to its trigger cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineUsage {
    /// Index into [`FunctionUnit::pipeline_resources`]
    pub resource: usize,
    pub start: u32,
    pub cycles: u32,
}

/// An operation implemented by a function unit
#[derive(Clone, Debug)]
pub struct HwOperation {
    /// Lower case operation name
    pub name: String,
    /// Cycles from trigger until results are readable
    pub latency: u32,
    /// (operand index, port index) pairs
    pub bindings: Vec<(u32, usize)>,
    pub pipeline: Vec<PipelineUsage>,
}

impl HwOperation {
    /// Port bound to the given operand index
    pub fn port_of(&self, operand: u32) -> Option<usize> {
        self.bindings
            .iter()
            .find(|(o, _)| *o == operand)
            .map(|(_, p)| *p)
    }

    pub fn is_bound(&self, operand: u32) -> bool {
        self.port_of(operand).is_some()
    }

    /// Number of cycles after the trigger during which a pipeline resource is held
    pub fn pipeline_length(&self) -> u32 {
        self.pipeline
            .iter()
            .map(|u| u.start + u.cycles)
            .max()
            .unwrap_or(0)
    }
}

/// Function unit of the target machine
#[derive(Clone, Debug)]
pub struct FunctionUnit {
    pub name: String,
    pub ports: Vec<Port>,
    pub operations: Vec<HwOperation>,
    /// Names of the internal pipeline resources shared by the operations
    pub pipeline_resources: Vec<String>,
}

impl FunctionUnit {
    pub(crate) fn from_config(config: &FunctionUnitConfig, sockets: &SocketNames) -> Result<Self, ConfigError> {
        let ports = config
            .ports
            .iter()
            .map(|p| Port::from_config(p, 32, sockets))
            .collect::<Result<Vec<_>, _>>()?;

        let mut pipeline_resources: Vec<String> = Vec::new();
        let mut operations = Vec::with_capacity(config.operations.len());
        for op in &config.operations {
            let mut bindings = Vec::with_capacity(op.bindings.len());
            for binding in &op.bindings {
                let port = config
                    .ports
                    .iter()
                    .position(|p| p.name == binding.port)
                    .ok_or_else(|| {
                        ConfigError::Validation(format!(
                            "Operation {}.{} binds unknown port {}",
                            config.name, op.name, binding.port
                        ))
                    })?;
                bindings.push((binding.operand, port));
            }

            let triggered = bindings.iter().any(|(_, p)| ports[*p].triggering);
            if !triggered {
                return Err(ConfigError::Validation(format!(
                    "Operation {}.{} binds no triggering port",
                    config.name, op.name
                )));
            }

            let mut pipeline = Vec::with_capacity(op.pipeline.len());
            for usage in &op.pipeline {
                let resource = match pipeline_resources.iter().position(|r| *r == usage.resource) {
                    Some(index) => index,
                    None => {
                        pipeline_resources.push(usage.resource.clone());
                        pipeline_resources.len() - 1
                    }
                };
                pipeline.push(PipelineUsage {
                    resource,
                    start: usage.start,
                    cycles: usage.cycles,
                });
            }

            operations.push(HwOperation {
                name: op.name.to_lowercase(),
                latency: op.latency,
                bindings,
                pipeline,
            });
        }

        Ok(Self {
            name: config.name.clone(),
            ports,
            operations,
            pipeline_resources,
        })
    }

    /// Look up an operation by name, case insensitive
    pub fn operation(&self, name: &str) -> Option<&HwOperation> {
        self.operations
            .iter()
            .find(|op| op.name.eq_ignore_ascii_case(name))
    }

    pub fn operation_index(&self, name: &str) -> Option<usize> {
        self.operations
            .iter()
            .position(|op| op.name.eq_ignore_ascii_case(name))
    }

    pub fn has_operation(&self, name: &str) -> bool {
        self.operation(name).is_some()
    }

    /// Index of the triggering port, if the unit has one
    pub fn trigger_port(&self) -> Option<usize> {
        self.ports.iter().position(|p| p.triggering)
    }

    pub fn port_index(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|p| p.name == name)
    }

    /// Longest result latency of any operation
    pub fn max_latency(&self) -> u32 {
        self.operations.iter().map(|op| op.latency).max().unwrap_or(0)
    }
}
