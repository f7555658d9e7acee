// src/manager/build.rs
//! One-time construction of the resource graph

use crate::broker::{Broker, ResourceMapper};
use crate::config::ConfigError;
use crate::resource::ResourceStore;
use crate::tta::processor::Machine;

/// Builds every broker's resources, then wires their links
pub struct ResourceBuildDirector;

impl ResourceBuildDirector {
    /// Build the resource graph of `machine` for `brokers`
    ///
    /// Links are set up only after every broker has built its resources,
    /// since sockets, buses and templates refer to each other.
    pub fn build(machine: &Machine, brokers: &mut [Broker]) -> Result<(ResourceStore, ResourceMapper), ConfigError> {
        let mut store = ResourceStore::new();
        let mut mapper = ResourceMapper::new();

        for broker in brokers.iter_mut() {
            broker
                .as_dyn_mut()
                .build_resources(machine, &mut store, &mut mapper)?;
        }
        for broker in brokers.iter_mut() {
            broker
                .as_dyn_mut()
                .setup_resource_links(machine, &mut store, &mapper)?;
        }
        store.validate_links()?;

        log::debug!(
            "[build] {}: {} resources from {} brokers",
            machine.name,
            store.len(),
            brokers.len()
        );
        Ok((store, mapper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MachinePart;
    use crate::config::MachineConfig;
    use crate::resource::ResourceKind;

    #[test]
    fn test_build_default_machine() {
        let machine = Machine::from_config(&MachineConfig::default_test()).unwrap();
        let mut brokers = Broker::default_set();
        let (store, mapper) = ResourceBuildDirector::build(&machine, &mut brokers).unwrap();

        let b0 = machine.bus_by_name("B0").unwrap();
        let bus = mapper.resource_of(MachinePart::Bus(b0), ResourceKind::Bus).unwrap();
        assert_eq!(store.name(bus), "B0");
        assert_eq!(store.kind(bus), ResourceKind::Bus);

        let owned: usize = brokers.iter().map(|b| b.as_dyn().resource_count()).sum();
        // short immediate sockets belong to their bus, not to a broker
        let simm = store.iter().filter(|(_, r)| r.kind() == ResourceKind::ShortImmPSocket).count();
        assert_eq!(owned + simm, store.len());
    }
}
