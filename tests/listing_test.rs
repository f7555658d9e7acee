// tests/listing_test.rs
//! Scheduling the sample program listing on the sample machine

use tta_resman::config::MachineConfig;
use tta_resman::manager::{CycleBound, SimpleResourceManager};
use tta_resman::tta::instruction::Terminal;
use tta_resman::tta::ProgramListing;

#[test]
fn test_sample_machine_matches_default() {
    let config = MachineConfig::from_file("config/machine.toml").unwrap();
    let sample = SimpleResourceManager::from_config(&config).unwrap();
    let default = SimpleResourceManager::from_config(&MachineConfig::default_test()).unwrap();

    assert_eq!(config.resource_manager, MachineConfig::default_test().resource_manager);
    assert_eq!(sample.resource_count(), default.resource_count());
    assert_eq!(sample.resource_counts(), default.resource_counts());
}

#[test]
fn test_schedule_sample_program() {
    let config = MachineConfig::from_file("config/machine.toml").unwrap();
    let mut rm = SimpleResourceManager::from_config(&config).unwrap();
    let listing = ProgramListing::from_file("config/program.toml").unwrap();
    let (mut block, nodes) = listing.to_block(rm.machine()).unwrap();

    for node in &nodes {
        match rm.earliest_cycle(&mut block, *node).unwrap() {
            CycleBound::Cycle(cycle) => rm.assign(&mut block, cycle, *node).unwrap(),
            bound => panic!("{} not placed: {}", node, bound),
        }
    }

    let cycle = |i: usize| block.node(nodes[i]).cycle.unwrap();
    // the constant goes through the immediate unit and cannot be read at cycle 0
    assert!(block.node(nodes[0]).transport.source.is_immediate_register());
    assert!(cycle(0) >= 1);
    // the trigger is not written before the other operand
    assert!(cycle(1) >= cycle(0));
    // results are read after the operation latency
    assert!(cycle(2) >= cycle(1) + 1);
    assert!(cycle(4) >= cycle(2) + 3);
    assert!(cycle(3) <= cycle(2));
    // only B0 carries the guard
    assert_eq!(block.node(nodes[4]).transport.bus, rm.machine().bus_by_name("B0"));
    assert!(matches!(block.node(nodes[4]).transport.destination, Terminal::Register { index: 2, .. }));

    assert_eq!(rm.largest_cycle(), cycle(4));
    let placed: usize = rm.instructions().iter().map(|(_, i)| i.moves.len()).sum();
    assert_eq!(placed, nodes.len());
    let immediates: usize = rm.instructions().iter().map(|(_, i)| i.immediates.len()).sum();
    assert_eq!(immediates, 1);

    // unscheduling in reverse leaves an empty manager
    for node in nodes.iter().rev() {
        rm.unassign(&mut block, *node).unwrap();
    }
    assert!(rm.instructions().iter().all(|(_, i)| i.is_empty()));
    assert_eq!(rm.largest_cycle(), -1);
}
