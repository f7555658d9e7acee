// src/config/mod.rs
//! Machine description configuration
//! Handles TOML parsing and validation of the target processor

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,
    #[serde(default)]
    pub resource_manager: ResourceManagerConfig,
    pub buses: Vec<BusConfig>,
    #[serde(default)]
    pub sockets: Vec<SocketConfig>,
    #[serde(default)]
    pub register_files: Vec<RegisterFileConfig>,
    #[serde(default)]
    pub immediate_units: Vec<ImmediateUnitConfig>,
    #[serde(default)]
    pub function_units: Vec<FunctionUnitConfig>,
    #[serde(default)]
    pub instruction_templates: Vec<TemplateConfig>,
}

/// Search bounds used by the resource manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceManagerConfig {
    /// How many cycles before its use a long immediate may be written
    pub max_limm_distance: i32,
    /// How far below the highest known cycle `earliest_cycle` starts probing
    pub scheduling_window: i32,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            max_limm_distance: 25,
            scheduling_window: 140,
        }
    }
}

/// Immediate extension mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Extension {
    Zero,
    Sign,
}

impl Default for Extension {
    fn default() -> Self {
        Extension::Zero
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub name: String,
    pub width: u32,
    /// Width of the short immediate field, 0 if the bus carries none
    #[serde(default)]
    pub immediate_width: u32,
    #[serde(default)]
    pub extension: Extension,
    #[serde(default)]
    pub guards: Vec<GuardConfig>,
}

/// Guard expression; either `register_file` + `index` or `function_unit` + `port`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub inverted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    pub name: String,
    pub direction: SocketDirection,
    pub buses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,
    /// Defaults to the width of the owning unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default)]
    pub triggering: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_socket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_socket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterFileConfig {
    pub name: String,
    pub size: usize,
    pub width: u32,
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImmediateUnitConfig {
    pub name: String,
    pub registers: usize,
    pub width: u32,
    #[serde(default = "default_iu_latency")]
    pub latency: u32,
    #[serde(default)]
    pub extension: Extension,
    pub ports: Vec<PortConfig>,
}

fn default_iu_latency() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionUnitConfig {
    pub name: String,
    pub ports: Vec<PortConfig>,
    pub operations: Vec<OperationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    pub name: String,
    /// Cycles from trigger until the results can be read
    pub latency: u32,
    pub bindings: Vec<BindingConfig>,
    #[serde(default)]
    pub pipeline: Vec<PipelineUsageConfig>,
}

/// Operand index (1-based, inputs first) bound to a port of the unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    pub operand: u32,
    pub port: String,
}

/// Pipeline resource occupied for `cycles` cycles starting `start` cycles after the trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineUsageConfig {
    pub resource: String,
    #[serde(default)]
    pub start: u32,
    #[serde(default = "default_usage_cycles")]
    pub cycles: u32,
}

fn default_usage_cycles() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub name: String,
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
}

/// A bus reserved by a template to carry long immediate bits to an immediate unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    pub bus: String,
    pub width: u32,
    pub destination: String,
}

impl MachineConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MachineConfig = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Create default configuration for testing
    ///
    /// Three buses, a general purpose register file, a one-bit guard
    /// register file, one long immediate unit, an ALU and a pipelined
    /// multiplier. Bus B2 doubles as the long immediate carrier.
    pub fn default_test() -> Self {
        let all_buses = vec!["B0".to_string(), "B1".to_string(), "B2".to_string()];
        let socket = |name: &str, direction, buses: &[String]| SocketConfig {
            name: name.to_string(),
            direction,
            buses: buses.to_vec(),
        };
        let input = |name: &str, socket: &str| PortConfig {
            name: name.to_string(),
            width: None,
            triggering: false,
            input_socket: Some(socket.to_string()),
            output_socket: None,
        };
        let trigger = |name: &str, socket: &str| PortConfig {
            triggering: true,
            ..input(name, socket)
        };
        let output = |name: &str, socket: &str| PortConfig {
            name: name.to_string(),
            width: None,
            triggering: false,
            input_socket: None,
            output_socket: Some(socket.to_string()),
        };
        let binary_op = |name: &str, latency: u32, pipeline: Vec<PipelineUsageConfig>| OperationConfig {
            name: name.to_string(),
            latency,
            bindings: vec![
                BindingConfig { operand: 1, port: "in1t".to_string() },
                BindingConfig { operand: 2, port: "in2".to_string() },
                BindingConfig { operand: 3, port: "out1".to_string() },
            ],
            pipeline,
        };

        Self {
            name: "TTA-Test".to_string(),
            resource_manager: ResourceManagerConfig::default(),
            buses: vec![
                BusConfig {
                    name: "B0".to_string(),
                    width: 32,
                    immediate_width: 8,
                    extension: Extension::Sign,
                    guards: vec![
                        GuardConfig {
                            register_file: Some("BOOL".to_string()),
                            function_unit: None,
                            port: None,
                            index: 0,
                            inverted: false,
                        },
                        GuardConfig {
                            register_file: Some("BOOL".to_string()),
                            function_unit: None,
                            port: None,
                            index: 0,
                            inverted: true,
                        },
                    ],
                },
                BusConfig {
                    name: "B1".to_string(),
                    width: 32,
                    immediate_width: 6,
                    extension: Extension::Zero,
                    guards: Vec::new(),
                },
                BusConfig {
                    name: "B2".to_string(),
                    width: 32,
                    immediate_width: 0,
                    extension: Extension::Zero,
                    guards: Vec::new(),
                },
            ],
            sockets: vec![
                socket("rf_o1", SocketDirection::Output, &all_buses),
                socket("rf_i1", SocketDirection::Input, &all_buses),
                socket("bool_i1", SocketDirection::Input, &all_buses[..2]),
                socket("imm_o1", SocketDirection::Output, &all_buses[1..]),
                socket("alu_i1", SocketDirection::Input, &all_buses),
                socket("alu_i2", SocketDirection::Input, &all_buses),
                socket("alu_o1", SocketDirection::Output, &all_buses),
                socket("mul_i1", SocketDirection::Input, &all_buses[..2]),
                socket("mul_i2", SocketDirection::Input, &all_buses[..2]),
                socket("mul_o1", SocketDirection::Output, &all_buses),
            ],
            register_files: vec![
                RegisterFileConfig {
                    name: "RF".to_string(),
                    size: 8,
                    width: 32,
                    ports: vec![output("r1", "rf_o1"), input("w1", "rf_i1")],
                },
                RegisterFileConfig {
                    name: "BOOL".to_string(),
                    size: 1,
                    width: 1,
                    ports: vec![input("w1", "bool_i1")],
                },
            ],
            immediate_units: vec![ImmediateUnitConfig {
                name: "IMM".to_string(),
                registers: 1,
                width: 32,
                latency: 1,
                extension: Extension::Sign,
                ports: vec![output("r1", "imm_o1")],
            }],
            function_units: vec![
                FunctionUnitConfig {
                    name: "ALU".to_string(),
                    ports: vec![
                        trigger("in1t", "alu_i1"),
                        input("in2", "alu_i2"),
                        output("out1", "alu_o1"),
                    ],
                    operations: vec![
                        binary_op("add", 1, Vec::new()),
                        binary_op("sub", 1, Vec::new()),
                        binary_op("eq", 1, Vec::new()),
                    ],
                },
                FunctionUnitConfig {
                    name: "MUL".to_string(),
                    ports: vec![
                        trigger("in1t", "mul_i1"),
                        input("in2", "mul_i2"),
                        output("out1", "mul_o1"),
                    ],
                    operations: vec![binary_op(
                        "mul",
                        3,
                        vec![PipelineUsageConfig {
                            resource: "multiplier".to_string(),
                            start: 0,
                            cycles: 2,
                        }],
                    )],
                },
            ],
            instruction_templates: vec![
                TemplateConfig {
                    name: "no_limm".to_string(),
                    slots: Vec::new(),
                },
                TemplateConfig {
                    name: "limm".to_string(),
                    slots: vec![SlotConfig {
                        bus: "B2".to_string(),
                        width: 32,
                        destination: "IMM".to_string(),
                    }],
                },
            ],
        }
    }

    /// Validate configuration for consistency
    ///
    /// Only checks that can be made without resolving names; cross
    /// references are resolved when the machine model is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buses.is_empty() {
            return Err(ConfigError::Validation("Machine must have at least one bus".to_string()));
        }

        if self.instruction_templates.is_empty() {
            return Err(ConfigError::Validation(
                "Machine must have at least one instruction template".to_string(),
            ));
        }

        if self.resource_manager.max_limm_distance <= 0 || self.resource_manager.scheduling_window <= 0 {
            return Err(ConfigError::Validation(
                "Resource manager search bounds must be > 0".to_string(),
            ));
        }

        check_unique("bus", self.buses.iter().map(|b| b.name.as_str()))?;
        check_unique("socket", self.sockets.iter().map(|s| s.name.as_str()))?;
        check_unique(
            "unit",
            self.register_files
                .iter()
                .map(|rf| rf.name.as_str())
                .chain(self.immediate_units.iter().map(|iu| iu.name.as_str()))
                .chain(self.function_units.iter().map(|fu| fu.name.as_str())),
        )?;
        check_unique("template", self.instruction_templates.iter().map(|t| t.name.as_str()))?;

        for bus in &self.buses {
            if bus.width == 0 {
                return Err(ConfigError::Validation(format!("Bus {} has zero width", bus.name)));
            }
            if bus.immediate_width > bus.width {
                return Err(ConfigError::Validation(format!(
                    "Bus {} immediate field is wider than the bus", bus.name
                )));
            }
        }

        for rf in &self.register_files {
            if rf.size == 0 || rf.width == 0 {
                return Err(ConfigError::Validation(format!(
                    "Register file {} must have size and width > 0", rf.name
                )));
            }
        }

        for iu in &self.immediate_units {
            if iu.registers == 0 || iu.width == 0 {
                return Err(ConfigError::Validation(format!(
                    "Immediate unit {} must have registers and width > 0", iu.name
                )));
            }
        }

        for fu in &self.function_units {
            check_unique("port", fu.ports.iter().map(|p| p.name.as_str()))?;
            for op in &fu.operations {
                if op.bindings.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Operation {}.{} binds no operands", fu.name, op.name
                    )));
                }
                for binding in &op.bindings {
                    if !fu.ports.iter().any(|p| p.name == binding.port) {
                        return Err(ConfigError::Validation(format!(
                            "Operation {}.{} binds operand {} to unknown port {}",
                            fu.name, op.name, binding.operand, binding.port
                        )));
                    }
                }
            }
        }

        for template in &self.instruction_templates {
            check_unique("template slot bus", template.slots.iter().map(|s| s.bus.as_str()))?;
            if template.slots.iter().any(|s| s.width == 0) {
                return Err(ConfigError::Validation(format!(
                    "Template {} has a zero width slot", template.name
                )));
            }
        }

        Ok(())
    }

    /// Export configuration to TOML string
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let toml_str = self.to_toml_string()?;
        std::fs::write(path.as_ref(), toml_str)?;
        Ok(())
    }
}

fn check_unique<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::Validation(format!("Duplicate {} name: {}", what, name)));
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialize(String),
}
