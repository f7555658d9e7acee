// tests/guard_test.rs
//! Bus selection under guards and preset buses

use tta_resman::broker::{AssignRequest, BrokerKind};
use tta_resman::config::MachineConfig;
use tta_resman::manager::SimpleResourceManager;
use tta_resman::resource::ResourceId;
use tta_resman::tta::instruction::{BasicBlock, Move, Terminal};
use tta_resman::tta::processor::Guard;

/// B0 carries unconditional moves only, B1 also moves guarded by P.0
const GUARDED_MACHINE: &str = r#"
name = "guarded"

[[buses]]
name = "B0"
width = 32

[[buses]]
name = "B1"
width = 32
guards = [{ register_file = "P", index = 0 }]

[[sockets]]
name = "rf_o"
direction = "output"
buses = ["B0", "B1"]

[[sockets]]
name = "rf_i"
direction = "input"
buses = ["B0", "B1"]

[[sockets]]
name = "rf_i2"
direction = "input"
buses = ["B0", "B1"]

[[register_files]]
name = "RF"
size = 4
width = 32
ports = [
    { name = "r1", output_socket = "rf_o" },
    { name = "w1", input_socket = "rf_i" },
    { name = "w2", input_socket = "rf_i2" },
]

[[register_files]]
name = "P"
size = 1
width = 1
ports = []

[[instruction_templates]]
name = "plain"
"#;

fn manager() -> SimpleResourceManager {
    let config = MachineConfig::from_toml_str(GUARDED_MACHINE).unwrap();
    SimpleResourceManager::from_config(&config).unwrap()
}

fn names(rm: &SimpleResourceManager, resources: &[ResourceId]) -> Vec<String> {
    let mut names: Vec<String> = resources.iter().map(|r| rm.resource_name(*r).to_string()).collect();
    names.sort();
    names
}

#[test]
fn test_guard_narrows_bus_candidates() {
    let mut rm = manager();
    let rf = rm.machine().register_file_by_name("RF").unwrap();
    let p = rm.machine().register_file_by_name("P").unwrap();
    let mut block = BasicBlock::new();
    let m1 = block.add_move(Move::new(Terminal::register(rf, 1), Terminal::register(rf, 2)));
    let m2 = block.add_move(
        Move::new(Terminal::register(rf, 1), Terminal::register(rf, 2)).guarded(Guard::Register {
            rf: p,
            index: 0,
            inverted: false,
        }),
    );

    let buses = rm.available_resources(&mut block, BrokerKind::Bus, 0, m1).unwrap();
    assert_eq!(names(&rm, &buses), vec!["B0", "B1"]);
    let buses = rm.available_resources(&mut block, BrokerKind::Bus, 0, m2).unwrap();
    assert_eq!(names(&rm, &buses), vec!["B1"]);

    // the query leaves both moves as they were
    assert!(!block.node(m1).is_placed());
    assert!(block.node(m2).transport.source.bound_port().is_none());
    assert!(rm.store().iter().all(|(_, r)| !r.is_in_use(0)));

    rm.assign(&mut block, 0, m2).unwrap();
    assert_eq!(block.node(m2).transport.bus, rm.machine().bus_by_name("B1"));
}

#[test]
fn test_guard_missing_from_every_bus() {
    let mut rm = manager();
    let rf = rm.machine().register_file_by_name("RF").unwrap();
    let p = rm.machine().register_file_by_name("P").unwrap();
    let mut block = BasicBlock::new();
    let inverted = block.add_move(
        Move::new(Terminal::register(rf, 1), Terminal::register(rf, 2)).guarded(Guard::Register {
            rf: p,
            index: 0,
            inverted: true,
        }),
    );

    assert!(!rm.has_guard(&block, inverted));
    let buses = rm.available_resources(&mut block, BrokerKind::Bus, 0, inverted).unwrap();
    assert!(buses.is_empty());
    assert!(!rm.can_assign(&mut block, 0, inverted).unwrap());
}

#[test]
fn test_guarded_move_competes_for_its_only_bus() {
    let mut rm = manager();
    let rf = rm.machine().register_file_by_name("RF").unwrap();
    let p = rm.machine().register_file_by_name("P").unwrap();
    let b1 = rm.machine().bus_by_name("B1").unwrap();
    let mut block = BasicBlock::new();
    let plain = block.add_move(Move::new(Terminal::register(rf, 1), Terminal::register(rf, 2)));
    let guarded = block.add_move(
        Move::new(Terminal::register(rf, 1), Terminal::register(rf, 3)).guarded(Guard::Register {
            rf: p,
            index: 0,
            inverted: false,
        }),
    );

    // both read RF.1 and have a write port each; only the bus is contended
    assert!(rm.can_assign(&mut block, 0, guarded).unwrap());

    // pin the unconditional move on the bus the guarded one needs
    let request = AssignRequest {
        bus: Some(b1),
        ..AssignRequest::default()
    };
    rm.assign_with(&mut block, 0, plain, request).unwrap();
    assert_eq!(block.node(plain).transport.bus, Some(b1));
    assert!(!rm.can_assign(&mut block, 0, guarded).unwrap());

    rm.unassign(&mut block, plain).unwrap();
    assert!(block.node(plain).transport.bus.is_none());
    rm.assign(&mut block, 0, plain).unwrap();
    // the unconditional move takes B0 and leaves B1 free
    assert_eq!(block.node(plain).transport.bus, rm.machine().bus_by_name("B0"));
    rm.assign(&mut block, 0, guarded).unwrap();
    assert_eq!(block.node(guarded).transport.bus, Some(b1));
}
