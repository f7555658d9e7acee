// src/broker/mapper.rs
//! Registry from machine parts to the resources that model them

use crate::config::ConfigError;
use crate::resource::{ResourceId, ResourceKind};
use crate::tta::processor::{BusId, FuId, IuId, SocketId, TemplateId};
use std::collections::BTreeMap;

/// Machine component a scheduling resource models
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MachinePart {
    Bus(BusId),
    Socket(SocketId),
    ImmediateUnit(IuId),
    Template(TemplateId),
    /// Modelled by an input side, an output side and a pipeline resource
    FunctionUnit(FuId),
}

/// Lookup shared by all brokers while the resource graph is wired
#[derive(Clone, Debug, Default)]
pub struct ResourceMapper {
    map: BTreeMap<MachinePart, Vec<(ResourceKind, ResourceId)>>,
}

impl ResourceMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, part: MachinePart, kind: ResourceKind, resource: ResourceId) {
        self.map.entry(part).or_default().push((kind, resource));
    }

    /// Resource of the given kind modelling `part`
    pub fn resource_of(&self, part: MachinePart, kind: ResourceKind) -> Option<ResourceId> {
        self.map
            .get(&part)?
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, r)| *r)
    }

    /// Like [`resource_of`](Self::resource_of), reporting `what` when missing
    pub fn require(&self, part: MachinePart, kind: ResourceKind, what: &str) -> Result<ResourceId, ConfigError> {
        self.resource_of(part, kind).ok_or_else(|| {
            ConfigError::Validation(format!("No {:?} resource registered for {}", kind, what))
        })
    }

    pub fn resources_of(&self, part: MachinePart) -> impl Iterator<Item = ResourceId> + '_ {
        self.map
            .get(&part)
            .into_iter()
            .flat_map(|entries| entries.iter().map(|(_, r)| *r))
    }

    pub fn resource_count(&self, part: MachinePart) -> usize {
        self.map.get(&part).map(Vec::len).unwrap_or(0)
    }

    /// Total number of mapped resources
    pub fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_resources_per_part() {
        let mut mapper = ResourceMapper::new();
        let fu = MachinePart::FunctionUnit(FuId(0));
        mapper.add(fu, ResourceKind::InputFu, ResourceId(3));
        mapper.add(fu, ResourceKind::OutputFu, ResourceId(4));
        mapper.add(MachinePart::Bus(BusId(0)), ResourceKind::Bus, ResourceId(0));

        assert_eq!(mapper.resource_of(fu, ResourceKind::OutputFu), Some(ResourceId(4)));
        assert_eq!(mapper.resource_of(fu, ResourceKind::ExecutionPipeline), None);
        assert_eq!(mapper.resource_count(fu), 2);
        assert_eq!(mapper.resources_of(fu).collect::<Vec<_>>(), vec![ResourceId(3), ResourceId(4)]);
        assert_eq!(mapper.len(), 3);
    }
}
