// tests/assignment_test.rs
//! Assignment, release and backtracking through the resource manager facade

use tta_resman::config::MachineConfig;
use tta_resman::error::RmError;
use tta_resman::manager::{CycleBound, SimpleResourceManager};
use tta_resman::tta::instruction::{BasicBlock, Move, NodeId, Terminal};
use tta_resman::tta::processor::Guard;

/// One bus, one register file with a single read and a single write port, one ALU
const ONE_BUS_MACHINE: &str = r#"
name = "one-bus"

[[buses]]
name = "B"
width = 32

[[sockets]]
name = "rf_o"
direction = "output"
buses = ["B"]

[[sockets]]
name = "rf_i"
direction = "input"
buses = ["B"]

[[sockets]]
name = "alu_i1"
direction = "input"
buses = ["B"]

[[sockets]]
name = "alu_i2"
direction = "input"
buses = ["B"]

[[sockets]]
name = "alu_o1"
direction = "output"
buses = ["B"]

[[register_files]]
name = "RF"
size = 8
width = 32
ports = [
    { name = "r1", output_socket = "rf_o" },
    { name = "w1", input_socket = "rf_i" },
]

[[function_units]]
name = "ALU"
ports = [
    { name = "in1t", triggering = true, input_socket = "alu_i1" },
    { name = "in2", input_socket = "alu_i2" },
    { name = "out1", output_socket = "alu_o1" },
]

[[function_units.operations]]
name = "add"
latency = 1
bindings = [
    { operand = 1, port = "in1t" },
    { operand = 2, port = "in2" },
    { operand = 3, port = "out1" },
]

[[instruction_templates]]
name = "plain"
"#;

fn default_manager() -> SimpleResourceManager {
    SimpleResourceManager::from_config(&MachineConfig::default_test()).unwrap()
}

fn one_bus_manager() -> SimpleResourceManager {
    let config = MachineConfig::from_toml_str(ONE_BUS_MACHINE).unwrap();
    SimpleResourceManager::from_config(&config).unwrap()
}

fn copy(rm: &SimpleResourceManager, block: &mut BasicBlock, from: usize, to: usize) -> NodeId {
    let rf = rm.machine().register_file_by_name("RF").unwrap();
    block.add_move(Move::new(Terminal::register(rf, from), Terminal::register(rf, to)))
}

#[test]
fn test_release_leaves_no_occupancy() {
    let mut rm = default_manager();
    let mut block = BasicBlock::new();
    let n = copy(&rm, &mut block, 1, 2);

    assert!(rm.can_assign(&mut block, 3, n).unwrap());
    rm.assign(&mut block, 3, n).unwrap();
    let bus = block.node(n).transport.bus;
    assert!(rm.store().iter().any(|(_, r)| r.is_in_use(3)));

    rm.unassign(&mut block, n).unwrap();
    assert!(rm.store().iter().all(|(_, r)| !r.is_in_use(3)));
    assert!(rm.instruction_is_empty(3));
    assert_eq!(rm.move_count(3), 0);

    // same request, same resources
    assert!(rm.can_assign(&mut block, 3, n).unwrap());
    rm.assign(&mut block, 3, n).unwrap();
    assert_eq!(block.node(n).transport.bus, bus);
}

#[test]
fn test_no_double_booking_on_one_bus() {
    let mut rm = one_bus_manager();
    let mut block = BasicBlock::new();
    let first = copy(&rm, &mut block, 1, 2);
    let second = copy(&rm, &mut block, 3, 4);

    assert!(rm.can_assign(&mut block, 0, first).unwrap());
    assert!(rm.can_assign(&mut block, 0, second).unwrap());

    rm.assign(&mut block, 0, first).unwrap();
    assert!(!rm.can_assign(&mut block, 0, second).unwrap());
    assert!(matches!(
        rm.assign(&mut block, 0, second),
        Err(RmError::NoAssignment { cycle: 0, .. })
    ));
    // the failed attempt left the second move untouched
    assert!(!block.node(second).is_placed());
    assert!(block.node(second).transport.bus.is_none());
    assert!(block.node(second).transport.source.bound_port().is_none());

    assert!(rm.can_assign(&mut block, 1, second).unwrap());
    rm.unassign(&mut block, first).unwrap();
    assert!(rm.can_assign(&mut block, 0, second).unwrap());
    rm.assign(&mut block, 0, second).unwrap();
    assert_eq!(block.node(second).cycle, Some(0));
}

#[test]
fn test_earliest_cycle_skips_busy_cycles() {
    let mut rm = one_bus_manager();
    let mut block = BasicBlock::new();
    let nodes: Vec<NodeId> = (0..4).map(|i| copy(&rm, &mut block, i, i + 4)).collect();

    for (expected, node) in nodes.iter().enumerate() {
        let cycle = rm.earliest_cycle(&mut block, *node).unwrap();
        assert_eq!(cycle, CycleBound::Cycle(expected as i32));
        rm.assign(&mut block, expected as i32, *node).unwrap();
    }
    assert_eq!(rm.largest_cycle(), 3);
    assert_eq!(rm.smallest_cycle(), 0);

    // freeing cycle 1 lets a new move in there
    rm.unassign(&mut block, nodes[1]).unwrap();
    let late = copy(&rm, &mut block, 7, 0);
    assert_eq!(rm.earliest_cycle(&mut block, late).unwrap(), CycleBound::Cycle(1));
}

#[test]
fn test_earliest_cycle_infeasible_for_unsupported_guard() {
    let mut rm = default_manager();
    let rf = rm.machine().register_file_by_name("RF").unwrap();
    let mut block = BasicBlock::new();
    let n = block.add_move(
        Move::new(Terminal::register(rf, 1), Terminal::register(rf, 2)).guarded(Guard::Register {
            rf,
            index: 3,
            inverted: false,
        }),
    );

    assert!(!rm.has_guard(&block, n));
    assert_eq!(rm.earliest_cycle(&mut block, n).unwrap(), CycleBound::Infeasible);
    assert!(!block.node(n).is_placed());
}

#[test]
fn test_misuse_is_reported() {
    let mut rm = default_manager();
    let mut block = BasicBlock::new();
    let n = copy(&rm, &mut block, 1, 2);

    rm.assign(&mut block, 2, n).unwrap();
    assert!(matches!(rm.assign(&mut block, 5, n), Err(RmError::InvalidUse(_))));
    assert!(matches!(rm.assign(&mut block, 2, n), Err(RmError::InvalidUse(_))));
    assert!(!rm.can_assign(&mut block, 2, n).unwrap());

    rm.unassign(&mut block, n).unwrap();
    assert!(matches!(rm.unassign(&mut block, n), Err(RmError::InvalidUse(_))));

    let foreign = NodeId(42);
    assert!(matches!(rm.can_assign(&mut block, 0, foreign), Err(RmError::InvalidUse(_))));
}

#[test]
fn test_register_read_port_is_shared_by_same_register_only() {
    let mut rm = default_manager();
    let rf = rm.machine().register_file_by_name("RF").unwrap();
    let mut block = BasicBlock::new();
    let n = copy(&rm, &mut block, 0, 4);
    rm.assign(&mut block, 0, n).unwrap();

    // the write port is taken
    let other_write = copy(&rm, &mut block, 1, 5);
    assert!(!rm.can_assign(&mut block, 0, other_write).unwrap());

    // the read of RF.0 fans out on another bus, a read of RF.1 needs the single read port
    let op = block.add_operation("add");
    let same_read = block.add_operand(op, 1, Terminal::register(rf, 0));
    let other_read = block.add_operand(op, 2, Terminal::register(rf, 1));
    assert!(!rm.can_assign(&mut block, 0, other_read).unwrap());
    rm.assign(&mut block, 0, same_read).unwrap();
    assert_ne!(block.node(same_read).transport.bus, block.node(n).transport.bus);
    assert_eq!(rm.move_count(0), 2);
}

#[test]
fn test_pipeline_resource_conflict() {
    let mut rm = default_manager();
    let rf = rm.machine().register_file_by_name("RF").unwrap();
    let mul = rm.machine().function_unit_by_name("MUL").unwrap();
    let mut block = BasicBlock::new();

    let first = block.add_operation("mul");
    let first_trigger = block.add_operand(first, 1, Terminal::register(rf, 1));
    let first_result = block.add_result(first, 3, Terminal::register(rf, 3));
    let second = block.add_operation("mul");
    let second_trigger = block.add_operand(second, 1, Terminal::register(rf, 2));

    rm.assign(&mut block, 0, first_trigger).unwrap();
    let bound = block.node(first_trigger).transport.destination.fu_terminal().unwrap();
    assert_eq!(bound.fu, Some(mul));

    // the multiplier stage is held for two cycles
    assert!(!rm.can_assign(&mut block, 1, second_trigger).unwrap());
    assert!(rm.can_assign(&mut block, 2, second_trigger).unwrap());
    assert_eq!(rm.earliest_cycle(&mut block, second_trigger).unwrap(), CycleBound::Cycle(2));

    // the result is ready three cycles after the trigger
    assert!(!rm.can_assign(&mut block, 2, first_result).unwrap());
    assert_eq!(rm.earliest_cycle(&mut block, first_result).unwrap(), CycleBound::Cycle(3));
    rm.assign(&mut block, 3, first_result).unwrap();
    assert!(rm.largest_cycle() >= 3);

    rm.unassign(&mut block, first_result).unwrap();
    rm.unassign(&mut block, first_trigger).unwrap();
    assert!(rm.can_assign(&mut block, 1, second_trigger).unwrap());
}

#[test]
fn test_has_connection_leaves_nothing_placed() {
    let mut rm = default_manager();
    let mut block = BasicBlock::new();
    let a = copy(&rm, &mut block, 1, 2);
    let b = copy(&rm, &mut block, 2, 3);

    assert!(rm.has_connection(&mut block, &[a, b]).unwrap());
    assert!(!block.node(a).is_placed());
    assert!(!block.node(b).is_placed());
    assert_eq!(rm.largest_cycle(), -1);
    assert!(rm.store().iter().all(|(_, r)| (0..4).all(|c| !r.is_in_use(c))));
}

#[test]
fn test_lose_instruction_ownership() {
    let mut rm = default_manager();
    let mut block = BasicBlock::new();
    let n = copy(&rm, &mut block, 1, 2);
    rm.assign(&mut block, 2, n).unwrap();

    let instruction = rm.lose_instruction_ownership(2).unwrap().unwrap();
    assert_eq!(instruction.moves, vec![n]);
    assert!(instruction.template.is_some());
    assert!(rm.instruction_is_empty(2));
    assert!(rm.lose_instruction_ownership(2).unwrap().is_none());

    let fresh = rm.instruction(&block, 2).unwrap();
    assert!(fresh.is_empty());
}
