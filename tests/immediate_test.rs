// tests/immediate_test.rs
//! Short and long immediates: bus fields, immediate unit registers and templates

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tta_resman::broker::AssignRequest;
use tta_resman::config::{Extension, MachineConfig};
use tta_resman::error::RmError;
use tta_resman::manager::{CycleBound, SimpleResourceManager};
use tta_resman::resource::immediate_unit::IU_OUTPUT_SOCKETS;
use tta_resman::resource::{IuState, OutputPSocketState, ResourceId, ResourceState, ResourceStore};
use tta_resman::tta::instruction::{BasicBlock, Immediate, ImmediateValue, Move, NodeId, Terminal};

fn manager() -> SimpleResourceManager {
    SimpleResourceManager::from_config(&MachineConfig::default_test()).unwrap()
}

fn constant_to_register(rm: &SimpleResourceManager, block: &mut BasicBlock, value: i64) -> NodeId {
    let rf = rm.machine().register_file_by_name("RF").unwrap();
    block.add_move(Move::new(Terminal::immediate(value, 32), Terminal::register(rf, 2)))
}

#[test]
fn test_short_immediate_rides_the_bus() {
    let mut rm = manager();
    let mut block = BasicBlock::new();
    let n = constant_to_register(&rm, &mut block, -5);

    assert!(rm.can_transport_immediate(&block, n));
    rm.assign(&mut block, 0, n).unwrap();
    assert!(block.node(n).transport.source.is_immediate());
    // only B0 sign extends
    assert_eq!(block.node(n).transport.bus, rm.machine().bus_by_name("B0"));
    assert!(rm.immediate_write_cycle(n).is_none());
    assert!(rm.instructions().iter().all(|(_, i)| i.immediates.is_empty()));
}

#[test]
fn test_long_immediate_conversion_and_restore() {
    let mut rm = manager();
    let mut block = BasicBlock::new();
    let n = constant_to_register(&rm, &mut block, 100_000);
    let imm = rm.machine().immediate_unit_by_name("IMM").unwrap();

    assert!(!rm.can_transport_immediate(&block, n));
    // the register cannot be written and read in the same cycle
    assert!(!rm.can_assign(&mut block, 0, n).unwrap());
    assert_eq!(rm.earliest_cycle(&mut block, n).unwrap(), CycleBound::Cycle(1));

    rm.assign(&mut block, 1, n).unwrap();
    assert!(matches!(
        block.node(n).transport.source,
        Terminal::ImmediateRegister { iu, index: 0, port: Some(_) } if iu == imm
    ));
    assert_eq!(rm.immediate_value(n), Some(ImmediateValue::new(100_000, 32)));
    assert_eq!(rm.immediate_write_cycle(n), Some(0));
    assert_eq!(rm.smallest_cycle(), 0);
    assert_eq!(rm.largest_cycle(), 1);

    let limm = rm.machine().template_by_name("limm");
    let writer = rm.instruction(&block, 0).unwrap();
    assert_eq!(writer.template, limm);
    assert_eq!(writer.immediates.len(), 1);
    assert_eq!(writer.immediates[0].value.value, 100_000);
    let reader = rm.instruction(&block, 1).unwrap();
    assert_eq!(reader.moves, vec![n]);
    assert!(reader.immediates.is_empty());

    rm.unassign(&mut block, n).unwrap();
    assert_eq!(block.node(n).transport.source, Terminal::immediate(100_000, 32));
    assert!(rm.immediate_write_cycle(n).is_none());
    assert!(rm.instruction_is_empty(0));
    assert_eq!(rm.largest_cycle(), -1);
}

#[test]
fn test_forced_long_immediate_and_write_cycle() {
    let mut rm = manager();
    let mut block = BasicBlock::new();
    let n = constant_to_register(&rm, &mut block, 3);
    block.node_mut(n).requires_long_immediate = true;

    let request = AssignRequest {
        imm_write_cycle: Some(2),
        ..AssignRequest::default()
    };
    assert!(!rm.can_assign_with(&mut block, 2, n, request).unwrap());
    rm.assign_with(&mut block, 5, n, request).unwrap();
    assert!(block.node(n).transport.source.is_immediate_register());
    assert_eq!(rm.immediate_write_cycle(n), Some(2));
    assert_eq!(rm.smallest_cycle(), 2);
}

#[test]
fn test_immediate_distance_is_bounded() {
    let mut rm = manager();
    let mut block = BasicBlock::new();
    let first = constant_to_register(&rm, &mut block, 100_000);
    let rf = rm.machine().register_file_by_name("RF").unwrap();
    let second = block.add_move(Move::new(Terminal::immediate(200_000, 32), Terminal::register(rf, 3)));

    // a write 30 cycles ahead is too far; the only register then holds the value from 0 to 20
    let request = AssignRequest {
        imm_write_cycle: Some(0),
        ..AssignRequest::default()
    };
    assert!(!rm.can_assign_with(&mut block, 30, first, request).unwrap());
    rm.assign_with(&mut block, 20, first, request).unwrap();
    assert!(!rm.can_assign(&mut block, 10, second).unwrap());
    assert!(rm.can_assign(&mut block, 21, second).unwrap());
}

#[test]
fn test_template_width_limits_immediates() {
    let mut config = MachineConfig::default_test();
    config.instruction_templates[1].slots[0].width = 16;
    let mut rm = SimpleResourceManager::from_config(&config).unwrap();
    let imm = rm.machine().immediate_unit_by_name("IMM").unwrap();
    let mut block = BasicBlock::new();

    let immediate = |value: i64| Immediate {
        value: ImmediateValue::new(value, 32),
        destination: imm,
        register: 0,
    };
    // the unit sign extends: 16 bits hold -32768..=32767
    assert!(rm.is_template_available(&block, 0, &immediate(32_767)));
    assert!(!rm.is_template_available(&block, 0, &immediate(32_768)));
    assert!(rm.is_template_available(&block, 0, &immediate(-32_768)));
    assert!(!rm.is_template_available(&block, 0, &immediate(-32_769)));

    // a move on the slot bus rules the immediate template out at that cycle
    let rf = rm.machine().register_file_by_name("RF").unwrap();
    let n = block.add_move(Move::new(Terminal::register(rf, 1), Terminal::register(rf, 2)));
    let request = AssignRequest {
        bus: rm.machine().bus_by_name("B2"),
        ..AssignRequest::default()
    };
    rm.assign_with(&mut block, 0, n, request).unwrap();
    assert!(!rm.is_template_available(&block, 0, &immediate(1)));
    assert!(rm.is_template_available(&block, 1, &immediate(1)));
}

#[test]
fn test_slot_bus_blocked_by_immediate_write() {
    let mut rm = manager();
    let mut block = BasicBlock::new();
    let long = constant_to_register(&rm, &mut block, 100_000);
    let request = AssignRequest {
        imm_write_cycle: Some(0),
        ..AssignRequest::default()
    };
    rm.assign_with(&mut block, 3, long, request).unwrap();

    // cycle 0 now encodes a long immediate on B2
    let rf = rm.machine().register_file_by_name("RF").unwrap();
    let n = block.add_move(Move::new(Terminal::register(rf, 1), Terminal::register(rf, 4)));
    let on_slot = AssignRequest {
        bus: rm.machine().bus_by_name("B2"),
        ..AssignRequest::default()
    };
    assert!(!rm.can_assign_with(&mut block, 0, n, on_slot).unwrap());
    rm.assign(&mut block, 0, n).unwrap();
    assert_ne!(block.node(n).transport.bus, rm.machine().bus_by_name("B2"));
}

#[test]
fn test_same_cycle_immediate_competes_with_its_read() {
    let mut config = MachineConfig::default_test();
    config.immediate_units[0].latency = 0;
    let socket = config.sockets.iter_mut().find(|s| s.name == "imm_o1").unwrap();
    socket.buses = vec!["B2".to_string()];
    let mut rm = SimpleResourceManager::from_config(&config).unwrap();
    let mut block = BasicBlock::new();
    let n = constant_to_register(&rm, &mut block, 100_000);

    // written and read at 0, B2 would be both the immediate slot and the transport bus
    assert!(!rm.can_assign(&mut block, 0, n).unwrap());
    assert!(matches!(
        rm.assign(&mut block, 0, n),
        Err(RmError::NoAssignment { cycle: 0, .. })
    ));
    assert_eq!(block.node(n).transport.source, Terminal::immediate(100_000, 32));
    assert!(rm.store().iter().all(|(_, r)| !r.is_in_use(0)));
    assert!(rm.instruction_is_empty(0));

    // written one cycle ahead, the read may use B2
    let request = AssignRequest {
        imm_write_cycle: Some(0),
        ..AssignRequest::default()
    };
    assert!(rm.can_assign_with(&mut block, 1, n, request).unwrap());
    rm.assign_with(&mut block, 1, n, request).unwrap();
    assert_eq!(block.node(n).transport.bus, rm.machine().bus_by_name("B2"));
    assert_eq!(rm.immediate_write_cycle(n), Some(0));
    let limm = rm.machine().template_by_name("limm");
    assert_eq!(rm.instruction(&block, 0).unwrap().template, limm);
}

fn store_with_register() -> (ResourceStore, ResourceId) {
    let mut store = ResourceStore::new();
    let iu = store.add(
        "IMM",
        ResourceState::ImmediateUnit(IuState::new(1, 32, 1, Extension::Sign)),
    );
    let socket = store.add("imm_o1", ResourceState::OutputPSocket(OutputPSocketState::default()));
    store.add_related(iu, IU_OUTPUT_SOCKETS, socket);
    (store, iu)
}

/// Intervals of one register overlap when one's use falls inside the
/// other, one's definition falls inside the other, or they share a definition
fn overlaps(a: (i32, i32), b: (i32, i32)) -> bool {
    let use_inside = b.1 > a.0 && b.1 <= a.1;
    let def_inside = b.0 >= a.0 && b.0 < a.1;
    let contains = a.0 >= b.0 && a.0 < b.1;
    use_inside || def_inside || contains || a.0 == b.0
}

#[test]
fn test_random_interval_pairs() {
    let mut rng = StdRng::seed_from_u64(0x11u64);
    let value = ImmediateValue::new(1_000_000, 32);

    for _ in 0..500 {
        let (mut store, iu) = store_with_register();
        let def = rng.gen_range(0..20);
        let committed = (def, def + rng.gen_range(1..8));
        store
            .iu_assign(iu, committed.0, committed.1, NodeId(0), value, None)
            .unwrap();

        let def = rng.gen_range(0..20);
        let probe = (def, def + rng.gen_range(1..8));
        let accepted = store.iu_can_assign(iu, probe.0, probe.1, &value, None);
        assert_eq!(
            accepted,
            !overlaps(committed, probe),
            "committed {:?}, probe {:?}",
            committed,
            probe
        );
    }
}
