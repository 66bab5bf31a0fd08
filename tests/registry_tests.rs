use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gpiof::{
    Direction, EdgeMode, Error, GpioConfig, MockGpioDriver, MockOp, OpenPolicy, PinRegistry,
};

const DEADLINE: Duration = Duration::from_secs(5);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn registry_with(config: GpioConfig) -> (Arc<MockGpioDriver>, Arc<PinRegistry<MockGpioDriver>>) {
    init_logger();
    let driver = Arc::new(MockGpioDriver::new());
    let registry = Arc::new(PinRegistry::new(driver.clone(), &config));
    (driver, registry)
}

fn registry() -> (Arc<MockGpioDriver>, Arc<PinRegistry<MockGpioDriver>>) {
    registry_with(GpioConfig::default())
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < DEADLINE, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn open_then_close_leaves_no_export() {
    let (driver, registry) = registry();

    let handle = registry
        .open(5, Direction::Output, EdgeMode::None, 0)
        .expect("open pin 5");
    assert!(driver.is_exported(5));
    assert_eq!(registry.open_pins(), vec![5]);

    registry.close(handle).expect("close pin 5");
    assert!(!driver.is_exported(5));
    assert!(registry.open_pins().is_empty());
    assert!(matches!(registry.direction(handle), Err(Error::Handle(5))));
}

#[test]
fn exclusive_policy_rejects_second_open() {
    let (_driver, registry) = registry();

    let first = registry
        .open(17, Direction::Input, EdgeMode::Rising, 0)
        .expect("first open");
    let second = registry.open(17, Direction::Input, EdgeMode::Rising, 0);

    assert!(matches!(second, Err(Error::Used(17))));
    assert_eq!(registry.direction(first).unwrap(), Direction::Input);
    assert_eq!(registry.edge(first).unwrap(), EdgeMode::Rising);
}

#[test]
fn shared_policy_counts_users_down() {
    let (driver, registry) = registry_with(GpioConfig {
        policy: OpenPolicy::Shared,
        ..GpioConfig::default()
    });

    let first = registry
        .open(3, Direction::Output, EdgeMode::None, 1)
        .expect("first open");
    let second = registry
        .open(3, Direction::Output, EdgeMode::None, 1)
        .expect("second open");
    assert_eq!(first, second);
    assert_eq!(driver.calls(MockOp::Export), 1);

    registry.close(first).expect("first close");
    assert!(driver.is_exported(3));
    assert_eq!(registry.value(second).unwrap(), 1);

    registry.close(second).expect("second close");
    assert!(!driver.is_exported(3));
    assert!(matches!(registry.close(second), Err(Error::Handle(3))));
}

#[test]
fn failed_setup_unexports_the_pin() {
    let (driver, registry) = registry();
    driver.fail(MockOp::SetEdge);

    let result = registry.open(44, Direction::Input, EdgeMode::Both, 0);

    assert!(matches!(result, Err(Error::General(_))));
    assert!(!driver.is_exported(44));
    assert_eq!(driver.calls(MockOp::Unexport), 1);
    assert!(registry.open_pins().is_empty());
}

#[test]
fn open_applies_value_only_to_outputs() {
    let (driver, registry) = registry();

    let output = registry
        .open(1, Direction::Output, EdgeMode::Both, 7)
        .expect("open output");
    registry
        .open(2, Direction::Input, EdgeMode::Falling, 1)
        .expect("open input");

    // edge only applies to inputs
    assert_eq!(registry.edge(output).unwrap(), EdgeMode::None);

    let output = driver.state(1).unwrap();
    assert_eq!(output.direction, Direction::Output);
    assert_eq!(output.value, 1);
    assert_eq!(output.edge, EdgeMode::None);

    let input = driver.state(2).unwrap();
    assert_eq!(input.direction, Direction::Input);
    assert_eq!(input.edge, EdgeMode::Falling);
    assert_eq!(driver.calls(MockOp::SetValue), 1);
    assert_eq!(driver.calls(MockOp::SetEdge), 1);
}

#[test]
fn set_value_on_input_is_a_direction_error() {
    let (driver, registry) = registry();
    let handle = registry
        .open(8, Direction::Input, EdgeMode::None, 0)
        .expect("open input");

    assert!(matches!(registry.set_value(handle, 1), Err(Error::Direction(8))));
    assert_eq!(driver.calls(MockOp::SetValue), 0);
}

#[test]
fn failed_write_keeps_cached_output_value() {
    let (driver, registry) = registry();
    let handle = registry
        .open(9, Direction::Output, EdgeMode::None, 1)
        .expect("open output");

    driver.fail(MockOp::SetValue);
    assert!(matches!(registry.set_value(handle, 0), Err(Error::General(_))));
    assert_eq!(registry.value(handle).unwrap(), 1);
}

#[test]
fn output_value_comes_from_cache() {
    let (driver, registry) = registry();
    let handle = registry
        .open(10, Direction::Output, EdgeMode::None, 0)
        .expect("open output");
    registry.set_value(handle, 42).expect("set value");

    driver.fail_reads();
    assert_eq!(registry.value(handle).unwrap(), 1);
    assert_eq!(driver.calls(MockOp::Value), 0);
}

#[test]
fn input_value_is_read_live() {
    let (driver, registry) = registry();
    let handle = registry
        .open(11, Direction::Input, EdgeMode::None, 0)
        .expect("open input");

    driver.set_level(11, 1).unwrap();
    assert_eq!(registry.value(handle).unwrap(), 1);
    driver.set_level(11, 0).unwrap();
    assert_eq!(registry.value(handle).unwrap(), 0);
    assert_eq!(driver.calls(MockOp::Value), 2);

    driver.fail_reads();
    assert!(matches!(registry.value(handle), Err(Error::General(_))));
}

#[test]
fn direction_and_edge_changes_skip_redundant_writes() {
    let (driver, registry) = registry();
    let handle = registry
        .open(12, Direction::Input, EdgeMode::None, 0)
        .expect("open input");

    registry.set_edge(handle, EdgeMode::None).unwrap();
    registry.set_direction(handle, Direction::Input).unwrap();
    assert_eq!(driver.calls(MockOp::SetEdge), 1);
    assert_eq!(driver.calls(MockOp::SetDirection), 1);

    registry.set_edge(handle, EdgeMode::Rising).unwrap();
    assert_eq!(registry.edge(handle).unwrap(), EdgeMode::Rising);
    assert_eq!(driver.state(12).unwrap().edge, EdgeMode::Rising);

    registry.set_direction(handle, Direction::Output).unwrap();
    assert_eq!(registry.direction(handle).unwrap(), Direction::Output);
    assert_eq!(registry.value(handle).unwrap(), 0);
    assert!(matches!(
        registry.set_edge(handle, EdgeMode::Both),
        Err(Error::Direction(12))
    ));
}

#[test]
fn wait_on_output_is_a_direction_error() {
    let (driver, registry) = registry();
    let handle = registry
        .open(13, Direction::Output, EdgeMode::None, 0)
        .expect("open output");

    assert!(matches!(
        registry.wait_for_edge(handle, EdgeMode::Both),
        Err(Error::Direction(13))
    ));
    assert_eq!(driver.calls(MockOp::OpenEdgeSource), 0);
}

#[test]
fn waiting_pin_rejects_changes_until_interrupted() {
    let (_driver, registry) = registry();
    let handle = registry
        .open(60, Direction::Input, EdgeMode::Both, 0)
        .expect("open input");

    let waiter = {
        let registry = registry.clone();
        thread::spawn(move || registry.wait_for_edge(handle, EdgeMode::Both))
    };
    wait_until("wait in flight", || registry.coordinator().is_in_flight(60));

    assert!(registry.is_waiting(handle).unwrap());
    assert_eq!(registry.coordinator().in_flight(), vec![60]);
    assert!(matches!(
        registry.set_direction(handle, Direction::Output),
        Err(Error::Waiting(60))
    ));
    assert!(matches!(
        registry.set_edge(handle, EdgeMode::Rising),
        Err(Error::Waiting(60))
    ));
    assert!(matches!(
        registry.wait_for_edge(handle, EdgeMode::Both),
        Err(Error::Waiting(60))
    ));

    registry.interrupt(60).expect("interrupt");
    let result = waiter.join().expect("waiter thread");

    assert!(matches!(result, Err(Error::Interrupted(60))));
    assert!(!registry.is_waiting(handle).unwrap());
    assert!(registry.coordinator().in_flight().is_empty());
    registry.set_edge(handle, EdgeMode::Rising).expect("edge after wait");
    registry
        .set_direction(handle, Direction::Output)
        .expect("direction after wait");
}

#[test]
fn interrupt_without_wait_is_a_no_op() {
    let (_driver, registry) = registry();
    registry.interrupt(99).expect("nothing to interrupt");
}

#[test]
fn edge_wakes_waiter_with_level() {
    let (driver, registry) = registry_with(GpioConfig {
        discard_initial_event: false,
        ..GpioConfig::default()
    });
    let handle = registry
        .open(61, Direction::Input, EdgeMode::Both, 0)
        .expect("open input");

    let waiter = {
        let registry = registry.clone();
        thread::spawn(move || registry.wait_for_edge(handle, EdgeMode::Both))
    };
    wait_until("wait in flight", || registry.coordinator().is_in_flight(61));
    driver.trigger_edge(61, 1).expect("trigger edge");

    assert_eq!(waiter.join().expect("waiter thread").unwrap(), 1);
    assert!(!registry.is_waiting(handle).unwrap());
    // same mode as cached, only the write from open
    assert_eq!(driver.calls(MockOp::SetEdge), 1);
}

#[test]
fn wait_rewrites_edge_only_when_it_changes() {
    let (driver, registry) = registry_with(GpioConfig {
        discard_initial_event: false,
        ..GpioConfig::default()
    });
    let handle = registry
        .open(62, Direction::Input, EdgeMode::Both, 0)
        .expect("open input");

    let waiter = {
        let registry = registry.clone();
        thread::spawn(move || registry.wait_for_edge(handle, EdgeMode::Falling))
    };
    wait_until("wait in flight", || registry.coordinator().is_in_flight(62));
    driver.trigger_edge(62, 0).expect("trigger edge");

    assert_eq!(waiter.join().expect("waiter thread").unwrap(), 0);
    assert_eq!(registry.edge(handle).unwrap(), EdgeMode::Falling);
    assert_eq!(driver.state(62).unwrap().edge, EdgeMode::Falling);
    assert_eq!(driver.calls(MockOp::SetEdge), 2);
}

#[test]
fn output_turned_input_arms_edge_before_waiting() {
    let (driver, registry) = registry();
    let handle = registry
        .open(70, Direction::Output, EdgeMode::Both, 0)
        .expect("open output");
    registry
        .set_direction(handle, Direction::Input)
        .expect("switch to input");
    assert_eq!(registry.edge(handle).unwrap(), EdgeMode::None);

    let waiter = {
        let registry = registry.clone();
        thread::spawn(move || registry.wait_for_edge(handle, EdgeMode::Both))
    };
    wait_until("wait in flight", || registry.coordinator().is_in_flight(70));

    assert_eq!(driver.calls(MockOp::SetEdge), 1);
    assert_eq!(driver.state(70).unwrap().edge, EdgeMode::Both);
    assert_eq!(registry.edge(handle).unwrap(), EdgeMode::Both);

    registry.interrupt(70).expect("interrupt");
    assert!(matches!(
        waiter.join().expect("waiter thread"),
        Err(Error::Interrupted(70))
    ));
}

#[test]
fn first_edge_is_discarded_and_second_returns_latest_level() {
    let (driver, registry) = registry();
    let handle = registry
        .open(5, Direction::Input, EdgeMode::Both, 0)
        .expect("open input");

    let waiter = {
        let registry = registry.clone();
        thread::spawn(move || registry.wait_for_edge(handle, EdgeMode::Both))
    };
    wait_until("wait in flight", || registry.coordinator().is_in_flight(5));

    driver.trigger_edge(5, 1).expect("first edge");
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());
    assert!(registry.is_waiting(handle).unwrap());

    driver.trigger_edge(5, 0).expect("second edge");
    assert_eq!(waiter.join().expect("waiter thread").unwrap(), 0);
    assert!(!registry.is_waiting(handle).unwrap());
}

#[test]
fn failed_edge_source_leaves_pin_usable() {
    let (driver, registry) = registry();
    let handle = registry
        .open(63, Direction::Input, EdgeMode::Both, 0)
        .expect("open input");
    driver.fail(MockOp::OpenEdgeSource);

    assert!(matches!(
        registry.wait_for_edge(handle, EdgeMode::Both),
        Err(Error::General(_))
    ));
    assert!(!registry.is_waiting(handle).unwrap());

    driver.heal();
    registry
        .set_edge(handle, EdgeMode::None)
        .expect("pin usable after failed wait");
}

#[test]
fn close_interrupts_pending_wait() {
    let (driver, registry) = registry();
    let handle = registry
        .open(64, Direction::Input, EdgeMode::Rising, 0)
        .expect("open input");

    let waiter = {
        let registry = registry.clone();
        thread::spawn(move || registry.wait_for_edge(handle, EdgeMode::Rising))
    };
    wait_until("wait in flight", || registry.coordinator().is_in_flight(64));

    registry.close(handle).expect("close waiting pin");

    assert!(matches!(
        waiter.join().expect("waiter thread"),
        Err(Error::Interrupted(64))
    ));
    assert!(!driver.is_exported(64));
    assert!(matches!(registry.is_waiting(handle), Err(Error::Handle(64))));
}

#[test]
fn shared_pin_wait_survives_until_last_close() {
    let (driver, registry) = registry_with(GpioConfig {
        policy: OpenPolicy::Shared,
        ..GpioConfig::default()
    });
    let first = registry
        .open(65, Direction::Input, EdgeMode::Rising, 0)
        .expect("first open");
    let second = registry
        .open(65, Direction::Input, EdgeMode::Rising, 0)
        .expect("second open");

    let waiter = {
        let registry = registry.clone();
        thread::spawn(move || registry.wait_for_edge(first, EdgeMode::Rising))
    };
    wait_until("wait in flight", || registry.coordinator().is_in_flight(65));

    registry.close(first).expect("first close");
    assert!(registry.is_waiting(second).unwrap());
    assert!(registry.coordinator().is_in_flight(65));
    assert!(driver.is_exported(65));

    registry.close(second).expect("last close");
    assert!(matches!(
        waiter.join().expect("waiter thread"),
        Err(Error::Interrupted(65))
    ));
    assert!(!driver.is_exported(65));
    assert!(registry.open_pins().is_empty());
}

#[test]
fn output_round_trip_then_stale_handle() {
    let (driver, registry) = registry();

    let handle = registry
        .open(62, Direction::Output, EdgeMode::None, 0)
        .expect("open pin 62");
    registry.set_value(handle, 1).expect("set pin 62");
    assert_eq!(registry.value(handle).unwrap(), 1);
    assert_eq!(driver.state(62).unwrap().value, 1);

    registry.close(handle).expect("close pin 62");
    assert!(matches!(registry.value(handle), Err(Error::Handle(62))));
}

#[test]
fn reopened_pin_does_not_revive_old_handle() {
    let (_driver, registry) = registry();

    let old = registry
        .open(20, Direction::Output, EdgeMode::None, 0)
        .expect("first open");
    registry.close(old).expect("close");
    let new = registry
        .open(20, Direction::Output, EdgeMode::None, 0)
        .expect("reopen");

    assert_ne!(old, new);
    assert_eq!(new.pin(), 20);
    assert!(matches!(registry.set_value(old, 1), Err(Error::Handle(20))));
    registry.set_value(new, 1).expect("new handle works");
}

#[test]
fn error_codes_match_legacy_status() {
    assert_eq!(Error::General("x".into()).code(), -1);
    assert_eq!(Error::Interrupted(1).code(), -1);
    assert_eq!(Error::Handle(1).code(), -2);
    assert_eq!(Error::Waiting(1).code(), -3);
    assert_eq!(Error::Direction(1).code(), -4);
    assert_eq!(Error::Used(1).code(), -5);
}
