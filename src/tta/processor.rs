// src/tta/processor.rs
//! Resolved, read-only model of the target processor
//!
//! A [`Machine`] is built once from a [`MachineConfig`]. All names are
//! resolved to typed indices so that the resource graph and the program
//! representation can refer to machine parts without string lookups.

use crate::config::{
    ConfigError, Extension, GuardConfig, MachineConfig, PortConfig, ResourceManagerConfig,
    SocketDirection,
};
use crate::tta::functional_unit::FunctionUnit;
use crate::tta::immediate_unit::ImmediateUnit;
use std::collections::HashMap;
use std::fmt;

macro_rules! machine_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub usize);
    };
}

machine_id!(
    /// Index of a transport bus
    BusId
);
machine_id!(
    /// Index of a socket
    SocketId
);
machine_id!(
    /// Index of a register file
    RfId
);
machine_id!(
    /// Index of an immediate unit
    IuId
);
machine_id!(
    /// Index of a function unit
    FuId
);
machine_id!(
    /// Index of an instruction template
    TemplateId
);

/// Unit that owns a port
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitRef {
    RegisterFile(RfId),
    ImmediateUnit(IuId),
    FunctionUnit(FuId),
}

/// Port addressed by its owning unit and its index in the unit's port list
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRef {
    pub unit: UnitRef,
    pub index: usize,
}

impl PortRef {
    pub fn new(unit: UnitRef, index: usize) -> Self {
        Self { unit, index }
    }
}

#[derive(Clone, Debug)]
pub struct Port {
    pub name: String,
    pub width: u32,
    pub triggering: bool,
    pub input_socket: Option<SocketId>,
    pub output_socket: Option<SocketId>,
}

/// Socket name lookup used while resolving unit ports
pub(crate) struct SocketNames {
    names: HashMap<String, (SocketId, SocketDirection)>,
}

impl SocketNames {
    fn resolve(&self, name: &str, direction: SocketDirection, port: &str) -> Result<SocketId, ConfigError> {
        match self.names.get(name) {
            Some((id, dir)) if *dir == direction => Ok(*id),
            Some(_) => Err(ConfigError::Validation(format!(
                "Port {} uses socket {} in the wrong direction",
                port, name
            ))),
            None => Err(ConfigError::Validation(format!(
                "Port {} refers to unknown socket {}",
                port, name
            ))),
        }
    }
}

impl Port {
    pub(crate) fn from_config(config: &PortConfig, default_width: u32, sockets: &SocketNames) -> Result<Self, ConfigError> {
        let input_socket = config
            .input_socket
            .as_deref()
            .map(|s| sockets.resolve(s, SocketDirection::Input, &config.name))
            .transpose()?;
        let output_socket = config
            .output_socket
            .as_deref()
            .map(|s| sockets.resolve(s, SocketDirection::Output, &config.name))
            .transpose()?;

        if input_socket.is_none() && output_socket.is_none() {
            return Err(ConfigError::Validation(format!(
                "Port {} is not connected to any socket",
                config.name
            )));
        }

        Ok(Self {
            name: config.name.clone(),
            width: config.width.unwrap_or(default_width),
            triggering: config.triggering,
            input_socket,
            output_socket,
        })
    }
}

/// Guard expression a move can be predicated on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Guard {
    Register { rf: RfId, index: usize, inverted: bool },
    Port { fu: FuId, port: usize, inverted: bool },
}

impl Guard {
    pub fn is_inverted(&self) -> bool {
        match self {
            Guard::Register { inverted, .. } | Guard::Port { inverted, .. } => *inverted,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Bus {
    pub name: String,
    pub width: u32,
    pub immediate_width: u32,
    pub extension: Extension,
    pub guards: Vec<Guard>,
}

impl Bus {
    pub fn has_guard(&self, guard: &Guard) -> bool {
        self.guards.contains(guard)
    }

    pub fn carries_short_immediates(&self) -> bool {
        self.immediate_width > 0
    }
}

#[derive(Clone, Debug)]
pub struct Socket {
    pub name: String,
    pub direction: SocketDirection,
    pub buses: Vec<BusId>,
    /// Ports attached to this socket
    pub ports: Vec<PortRef>,
}

#[derive(Clone, Debug)]
pub struct RegisterFile {
    pub name: String,
    pub size: usize,
    pub width: u32,
    pub ports: Vec<Port>,
}

/// Bus reserved by a template to carry long immediate bits
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateSlot {
    pub bus: BusId,
    pub width: u32,
    pub destination: IuId,
}

#[derive(Clone, Debug)]
pub struct InstructionTemplate {
    pub name: String,
    pub slots: Vec<TemplateSlot>,
}

impl InstructionTemplate {
    /// Does the template use `bus` to carry immediate bits
    pub fn uses_slot(&self, bus: BusId) -> bool {
        self.slots.iter().any(|s| s.bus == bus)
    }

    pub fn is_destination(&self, iu: IuId) -> bool {
        self.slots.iter().any(|s| s.destination == iu)
    }

    /// Total immediate bits the template can write to `iu`
    pub fn supported_width(&self, iu: IuId) -> u32 {
        self.slots
            .iter()
            .filter(|s| s.destination == iu)
            .map(|s| s.width)
            .sum()
    }

    /// Number of distinct immediate units the template writes to
    pub fn destination_count(&self) -> usize {
        let mut destinations: Vec<IuId> = self.slots.iter().map(|s| s.destination).collect();
        destinations.sort();
        destinations.dedup();
        destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Target machine
#[derive(Clone, Debug)]
pub struct Machine {
    pub name: String,
    pub limits: ResourceManagerConfig,
    pub buses: Vec<Bus>,
    pub sockets: Vec<Socket>,
    pub register_files: Vec<RegisterFile>,
    pub immediate_units: Vec<ImmediateUnit>,
    pub function_units: Vec<FunctionUnit>,
    pub templates: Vec<InstructionTemplate>,
}

impl Machine {
    /// Resolve a configuration into a machine model
    pub fn from_config(config: &MachineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let bus_ids: HashMap<&str, BusId> = config
            .buses
            .iter()
            .enumerate()
            .map(|(i, b)| (b.name.as_str(), BusId(i)))
            .collect();
        let rf_ids: HashMap<&str, RfId> = config
            .register_files
            .iter()
            .enumerate()
            .map(|(i, rf)| (rf.name.as_str(), RfId(i)))
            .collect();
        let iu_ids: HashMap<&str, IuId> = config
            .immediate_units
            .iter()
            .enumerate()
            .map(|(i, iu)| (iu.name.as_str(), IuId(i)))
            .collect();
        let fu_ids: HashMap<&str, FuId> = config
            .function_units
            .iter()
            .enumerate()
            .map(|(i, fu)| (fu.name.as_str(), FuId(i)))
            .collect();

        let lookup_bus = |name: &str, user: &str| {
            bus_ids.get(name).copied().ok_or_else(|| {
                ConfigError::Validation(format!("{} refers to unknown bus {}", user, name))
            })
        };

        let mut sockets = Vec::with_capacity(config.sockets.len());
        for socket in &config.sockets {
            let buses = socket
                .buses
                .iter()
                .map(|b| lookup_bus(b, &socket.name))
                .collect::<Result<Vec<_>, _>>()?;
            sockets.push(Socket {
                name: socket.name.clone(),
                direction: socket.direction,
                buses,
                ports: Vec::new(),
            });
        }
        let socket_names = SocketNames {
            names: sockets
                .iter()
                .enumerate()
                .map(|(i, s)| (s.name.clone(), (SocketId(i), s.direction)))
                .collect(),
        };

        let register_files = config
            .register_files
            .iter()
            .map(|rf| {
                let ports = rf
                    .ports
                    .iter()
                    .map(|p| Port::from_config(p, rf.width, &socket_names))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(RegisterFile {
                    name: rf.name.clone(),
                    size: rf.size,
                    width: rf.width,
                    ports,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let immediate_units = config
            .immediate_units
            .iter()
            .map(|iu| ImmediateUnit::from_config(iu, &socket_names))
            .collect::<Result<Vec<_>, _>>()?;

        let function_units = config
            .function_units
            .iter()
            .map(|fu| FunctionUnit::from_config(fu, &socket_names))
            .collect::<Result<Vec<_>, _>>()?;

        let resolve_guard = |guard: &GuardConfig, bus: &str| -> Result<Guard, ConfigError> {
            match (&guard.register_file, &guard.function_unit) {
                (Some(rf_name), None) => {
                    let rf = rf_ids.get(rf_name.as_str()).copied().ok_or_else(|| {
                        ConfigError::Validation(format!("Bus {} guard uses unknown register file {}", bus, rf_name))
                    })?;
                    if guard.index >= register_files[rf.0].size {
                        return Err(ConfigError::Validation(format!(
                            "Bus {} guard register {}.{} out of range",
                            bus, rf_name, guard.index
                        )));
                    }
                    Ok(Guard::Register {
                        rf,
                        index: guard.index,
                        inverted: guard.inverted,
                    })
                }
                (None, Some(fu_name)) => {
                    let fu = fu_ids.get(fu_name.as_str()).copied().ok_or_else(|| {
                        ConfigError::Validation(format!("Bus {} guard uses unknown function unit {}", bus, fu_name))
                    })?;
                    let port_name = guard.port.as_deref().unwrap_or_default();
                    let port = function_units[fu.0].port_index(port_name).ok_or_else(|| {
                        ConfigError::Validation(format!("Bus {} guard uses unknown port {}.{}", bus, fu_name, port_name))
                    })?;
                    Ok(Guard::Port {
                        fu,
                        port,
                        inverted: guard.inverted,
                    })
                }
                _ => Err(ConfigError::Validation(format!(
                    "Bus {} guard must name either a register file or a function unit",
                    bus
                ))),
            }
        };

        let mut buses = Vec::with_capacity(config.buses.len());
        for bus in &config.buses {
            let guards = bus
                .guards
                .iter()
                .map(|g| resolve_guard(g, &bus.name))
                .collect::<Result<Vec<_>, _>>()?;
            buses.push(Bus {
                name: bus.name.clone(),
                width: bus.width,
                immediate_width: bus.immediate_width,
                extension: bus.extension,
                guards,
            });
        }

        let mut templates = Vec::with_capacity(config.instruction_templates.len());
        for template in &config.instruction_templates {
            let mut slots = Vec::with_capacity(template.slots.len());
            for slot in &template.slots {
                let destination = iu_ids.get(slot.destination.as_str()).copied().ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "Template {} writes unknown immediate unit {}",
                        template.name, slot.destination
                    ))
                })?;
                slots.push(TemplateSlot {
                    bus: lookup_bus(&slot.bus, &template.name)?,
                    width: slot.width,
                    destination,
                });
            }
            templates.push(InstructionTemplate {
                name: template.name.clone(),
                slots,
            });
        }

        let mut machine = Self {
            name: config.name.clone(),
            limits: config.resource_manager.clone(),
            buses,
            sockets,
            register_files,
            immediate_units,
            function_units,
            templates,
        };
        machine.attach_ports_to_sockets();
        Ok(machine)
    }

    fn attach_ports_to_sockets(&mut self) {
        let mut attached: Vec<(SocketId, PortRef)> = Vec::new();
        for unit in self.units() {
            for (index, port) in self.ports_of(unit).iter().enumerate() {
                for socket in port.input_socket.iter().chain(port.output_socket.iter()) {
                    attached.push((*socket, PortRef::new(unit, index)));
                }
            }
        }
        for (socket, port) in attached {
            self.sockets[socket.0].ports.push(port);
        }
    }

    /// All units that own ports
    pub fn units(&self) -> Vec<UnitRef> {
        let rfs = (0..self.register_files.len()).map(|i| UnitRef::RegisterFile(RfId(i)));
        let ius = (0..self.immediate_units.len()).map(|i| UnitRef::ImmediateUnit(IuId(i)));
        let fus = (0..self.function_units.len()).map(|i| UnitRef::FunctionUnit(FuId(i)));
        rfs.chain(ius).chain(fus).collect()
    }

    pub fn ports_of(&self, unit: UnitRef) -> &[Port] {
        match unit {
            UnitRef::RegisterFile(rf) => &self.register_files[rf.0].ports,
            UnitRef::ImmediateUnit(iu) => &self.immediate_units[iu.0].ports,
            UnitRef::FunctionUnit(fu) => &self.function_units[fu.0].ports,
        }
    }

    pub fn port(&self, port: PortRef) -> &Port {
        &self.ports_of(port.unit)[port.index]
    }

    pub fn unit_name(&self, unit: UnitRef) -> &str {
        match unit {
            UnitRef::RegisterFile(rf) => &self.register_files[rf.0].name,
            UnitRef::ImmediateUnit(iu) => &self.immediate_units[iu.0].name,
            UnitRef::FunctionUnit(fu) => &self.function_units[fu.0].name,
        }
    }

    /// "UNIT.port" name of a port
    pub fn port_name(&self, port: PortRef) -> String {
        format!("{}.{}", self.unit_name(port.unit), self.port(port).name)
    }

    pub fn bus(&self, id: BusId) -> &Bus {
        &self.buses[id.0]
    }

    pub fn socket(&self, id: SocketId) -> &Socket {
        &self.sockets[id.0]
    }

    pub fn register_file(&self, id: RfId) -> &RegisterFile {
        &self.register_files[id.0]
    }

    pub fn immediate_unit(&self, id: IuId) -> &ImmediateUnit {
        &self.immediate_units[id.0]
    }

    pub fn function_unit(&self, id: FuId) -> &FunctionUnit {
        &self.function_units[id.0]
    }

    pub fn template(&self, id: TemplateId) -> &InstructionTemplate {
        &self.templates[id.0]
    }

    pub fn bus_ids(&self) -> impl Iterator<Item = BusId> {
        (0..self.buses.len()).map(BusId)
    }

    pub fn socket_ids(&self) -> impl Iterator<Item = SocketId> {
        (0..self.sockets.len()).map(SocketId)
    }

    pub fn immediate_unit_ids(&self) -> impl Iterator<Item = IuId> {
        (0..self.immediate_units.len()).map(IuId)
    }

    pub fn function_unit_ids(&self) -> impl Iterator<Item = FuId> {
        (0..self.function_units.len()).map(FuId)
    }

    pub fn template_ids(&self) -> impl Iterator<Item = TemplateId> {
        (0..self.templates.len()).map(TemplateId)
    }

    pub fn bus_by_name(&self, name: &str) -> Option<BusId> {
        self.buses.iter().position(|b| b.name == name).map(BusId)
    }

    pub fn socket_by_name(&self, name: &str) -> Option<SocketId> {
        self.sockets.iter().position(|s| s.name == name).map(SocketId)
    }

    pub fn register_file_by_name(&self, name: &str) -> Option<RfId> {
        self.register_files.iter().position(|rf| rf.name == name).map(RfId)
    }

    pub fn immediate_unit_by_name(&self, name: &str) -> Option<IuId> {
        self.immediate_units.iter().position(|iu| iu.name == name).map(IuId)
    }

    pub fn function_unit_by_name(&self, name: &str) -> Option<FuId> {
        self.function_units.iter().position(|fu| fu.name == name).map(FuId)
    }

    pub fn template_by_name(&self, name: &str) -> Option<TemplateId> {
        self.templates.iter().position(|t| t.name == name).map(TemplateId)
    }

    pub fn is_bus_connected(&self, bus: BusId, socket: SocketId) -> bool {
        self.sockets[socket.0].buses.contains(&bus)
    }

    /// Does any template carry long immediates
    pub fn has_long_immediates(&self) -> bool {
        self.templates.iter().any(|t| !t.is_empty())
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    /// Function units implementing an operation
    pub fn units_with_operation<'a>(&'a self, operation: &'a str) -> impl Iterator<Item = FuId> + 'a {
        self.function_unit_ids()
            .filter(move |fu| self.function_unit(*fu).has_operation(operation))
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_inverted() { '!' } else { '?' };
        match self {
            Guard::Register { rf, index, .. } => write!(f, "{}RF{}.{}", prefix, rf.0, index),
            Guard::Port { fu, port, .. } => write!(f, "{}FU{}.{}", prefix, fu.0, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_from_default_config() {
        let machine = Machine::from_config(&MachineConfig::default_test()).unwrap();
        assert_eq!(machine.bus_count(), 3);
        assert!(machine.has_long_immediates());

        let rf_o1 = machine.socket_by_name("rf_o1").unwrap();
        let rf = machine.register_file_by_name("RF").unwrap();
        assert_eq!(machine.socket(rf_o1).ports, vec![PortRef::new(UnitRef::RegisterFile(rf), 0)]);

        let b0 = machine.bus_by_name("B0").unwrap();
        let b2 = machine.bus_by_name("B2").unwrap();
        let imm_o1 = machine.socket_by_name("imm_o1").unwrap();
        assert!(!machine.is_bus_connected(b0, imm_o1));
        assert!(machine.is_bus_connected(b2, imm_o1));
    }

    #[test]
    fn test_guards_resolved() {
        let machine = Machine::from_config(&MachineConfig::default_test()).unwrap();
        let bool_rf = machine.register_file_by_name("BOOL").unwrap();
        let guard = Guard::Register { rf: bool_rf, index: 0, inverted: true };
        assert!(machine.bus(BusId(0)).has_guard(&guard));
        assert!(!machine.bus(BusId(1)).has_guard(&guard));
    }

    #[test]
    fn test_template_widths() {
        let machine = Machine::from_config(&MachineConfig::default_test()).unwrap();
        let iu = machine.immediate_unit_by_name("IMM").unwrap();
        let limm = machine.template(machine.template_by_name("limm").unwrap());
        assert_eq!(limm.supported_width(iu), 32);
        assert_eq!(limm.destination_count(), 1);
        assert!(limm.uses_slot(machine.bus_by_name("B2").unwrap()));

        let plain = machine.template(machine.template_by_name("no_limm").unwrap());
        assert_eq!(plain.supported_width(iu), 0);
        assert!(!plain.is_destination(iu));
    }

    #[test]
    fn test_unknown_socket_rejected() {
        let mut config = MachineConfig::default_test();
        config.register_files[0].ports[0].output_socket = Some("missing".to_string());
        assert!(matches!(Machine::from_config(&config), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_socket_direction_checked() {
        let mut config = MachineConfig::default_test();
        config.register_files[0].ports[0].output_socket = Some("rf_i1".to_string());
        assert!(Machine::from_config(&config).is_err());
    }

    #[test]
    fn test_operation_lookup() {
        let machine = Machine::from_config(&MachineConfig::default_test()).unwrap();
        let alu = machine.function_unit_by_name("ALU").unwrap();
        let units: Vec<FuId> = machine.units_with_operation("ADD").collect();
        assert_eq!(units, vec![alu]);

        let mul = machine.function_unit(machine.function_unit_by_name("MUL").unwrap());
        let op = mul.operation("mul").unwrap();
        assert_eq!(op.latency, 3);
        assert_eq!(op.pipeline_length(), 2);
        assert_eq!(op.port_of(1), mul.trigger_port());
    }
}
