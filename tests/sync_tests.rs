// Integration tests for the MS-SYNC replication engine.
//
// Two VM instances talk over loopback UDP (127.0.0.1 and 127.0.0.2 on
// the same port, one socket per node) and exercise the mirror, checkpoint
// and failover paths end to end. Each test uses its own port so the suite
// can run in parallel.

use std::thread::sleep;
use std::time::{Duration, Instant};
use stvm::bytecode::OpCode;
use stvm::generator::BytecodeBuilder;
use stvm::sync::{NodeRole, NodeState, SyncConfig};
use stvm::value::{Value, ValueTag};
use stvm::vm::{SyncMode, Vm, VmConfig};

/// A minimal program with two Int globals and a HALT; the sync tests
/// drive the engines directly rather than the dispatch loop
fn make_vm() -> Vm {
    let mut builder = BytecodeBuilder::new();
    builder.add_variable("x", ValueTag::Int as u32, 1, true).unwrap();
    builder.add_variable("y", ValueTag::Int as u32, 1, true).unwrap();
    builder.emit(OpCode::Halt);
    let file = builder.finish().unwrap();

    let mut machine = Vm::new(VmConfig::default());
    machine.load(&file).unwrap();
    machine
}

fn config(local: &str, peer: &str, port: u16) -> SyncConfig {
    SyncConfig {
        local_ip: local.into(),
        peer_ip: peer.into(),
        port,
        ..SyncConfig::default()
    }
}

fn fast_config(local: &str, peer: &str, port: u16) -> SyncConfig {
    SyncConfig {
        heartbeat_interval_ms: 20,
        heartbeat_timeout_ms: 60,
        checkpoint_interval_ms: 50,
        ..config(local, peer, port)
    }
}

#[test]
fn primary_write_is_mirrored_to_secondary() {
    let port = 47911;
    let mut primary = make_vm();
    let mut secondary = make_vm();
    primary
        .enable_sync(config("127.0.0.1", "127.0.0.2", port), SyncMode::Primary)
        .unwrap();
    secondary
        .enable_sync(config("127.0.0.2", "127.0.0.1", port), SyncMode::Secondary)
        .unwrap();

    primary.set_global(0, Value::Int(42)).unwrap();

    let deadline = Instant::now() + Duration::from_millis(200);
    while Instant::now() < deadline {
        primary.process_sync_messages();
        secondary.process_sync_messages();
        if secondary.global(0) == Some(&Value::Int(42)) {
            break;
        }
        sleep(Duration::from_millis(5));
    }

    assert_eq!(secondary.global(0), Some(&Value::Int(42)));
    assert!(primary.sync_engine().unwrap().stats().bytes_sent > 0);
    assert!(secondary.sync_engine().unwrap().stats().bytes_received > 0);
}

#[test]
fn repeated_writes_converge_on_the_last_value() {
    let port = 47912;
    let mut primary = make_vm();
    let mut secondary = make_vm();
    primary
        .enable_sync(config("127.0.0.1", "127.0.0.2", port), SyncMode::Primary)
        .unwrap();
    secondary
        .enable_sync(config("127.0.0.2", "127.0.0.1", port), SyncMode::Secondary)
        .unwrap();

    // Per-variable updates carry strictly increasing sequence numbers, so
    // the secondary converges on the latest write
    for value in [1, 2, 3] {
        primary.set_global(0, Value::Int(value)).unwrap();
        primary.process_sync_messages();
        sleep(Duration::from_millis(5));
        secondary.process_sync_messages();
    }

    let deadline = Instant::now() + Duration::from_millis(200);
    while Instant::now() < deadline && secondary.global(0) != Some(&Value::Int(3)) {
        primary.process_sync_messages();
        secondary.process_sync_messages();
        sleep(Duration::from_millis(5));
    }
    assert_eq!(secondary.global(0), Some(&Value::Int(3)));
}

#[test]
fn checkpoint_replicates_the_whole_variable_set_and_pc() {
    let port = 47913;
    let mut primary = make_vm();
    let mut secondary = make_vm();
    primary
        .enable_sync(fast_config("127.0.0.1", "127.0.0.2", port), SyncMode::Primary)
        .unwrap();
    secondary
        .enable_sync(fast_config("127.0.0.2", "127.0.0.1", port), SyncMode::Secondary)
        .unwrap();

    primary.set_global(0, Value::Int(7)).unwrap();
    primary.set_global(1, Value::Int(11)).unwrap();
    primary.set_pc(0); // entry; replicated via the state snapshot

    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline {
        primary.process_sync_messages();
        secondary.process_sync_messages();
        let done = secondary.global(0) == Some(&Value::Int(7))
            && secondary.global(1) == Some(&Value::Int(11))
            && primary.sync_engine().unwrap().last_checkpoint_id() >= 1;
        if done {
            break;
        }
        sleep(Duration::from_millis(5));
    }

    assert_eq!(secondary.global(0), Some(&Value::Int(7)));
    assert_eq!(secondary.global(1), Some(&Value::Int(11)));
    assert!(primary.sync_engine().unwrap().last_checkpoint_id() >= 1);
    assert_eq!(secondary.pc(), primary.pc());
}

#[test]
fn secondary_takes_over_after_heartbeat_loss() {
    let port = 47914;
    let mut primary = make_vm();
    let mut secondary = make_vm();
    primary
        .enable_sync(fast_config("127.0.0.1", "127.0.0.2", port), SyncMode::Primary)
        .unwrap();
    secondary
        .enable_sync(fast_config("127.0.0.2", "127.0.0.1", port), SyncMode::Secondary)
        .unwrap();

    // Let the nodes see each other first
    let handshake = Instant::now() + Duration::from_millis(150);
    while Instant::now() < handshake {
        primary.process_sync_messages();
        secondary.process_sync_messages();
        sleep(Duration::from_millis(10));
    }
    assert!(secondary.sync_engine().unwrap().peer_alive());

    // Silence the primary; the secondary must promote itself after three
    // missed heartbeat windows
    drop(primary);
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        secondary.process_sync_messages();
        if secondary.sync_engine().unwrap().role() == NodeRole::Primary {
            break;
        }
        sleep(Duration::from_millis(10));
    }

    let engine = secondary.sync_engine().unwrap();
    assert_eq!(engine.role(), NodeRole::Primary);
    assert_eq!(engine.state(), NodeState::Active);
    assert_eq!(engine.stats().failovers, 1);
    assert_eq!(secondary.sync_mode(), SyncMode::Primary);
}

#[test]
fn dual_primary_resolves_by_demotion() {
    let port = 47915;
    let mut node_a = make_vm();
    let mut node_b = make_vm();
    node_a
        .enable_sync(fast_config("127.0.0.1", "127.0.0.2", port), SyncMode::Primary)
        .unwrap();
    node_b
        .enable_sync(fast_config("127.0.0.2", "127.0.0.1", port), SyncMode::Primary)
        .unwrap();

    // Drive A first so its heartbeat lands before B ever sends one; B
    // must demote itself on receipt
    sleep(Duration::from_millis(25));
    node_a.process_sync_messages();
    sleep(Duration::from_millis(10));
    node_b.process_sync_messages();
    sleep(Duration::from_millis(10));
    node_a.process_sync_messages();

    let roles = (
        node_a.sync_engine().unwrap().role(),
        node_b.sync_engine().unwrap().role(),
    );
    assert_eq!(roles, (NodeRole::Primary, NodeRole::Secondary));
    assert_eq!(node_b.sync_mode(), SyncMode::Secondary);
}
