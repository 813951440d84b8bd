//! Integration tests for scripts running inside the bridge core

use rs_throttle_bridge::automation::ProcessState;
use rs_throttle_bridge::hal::mock::{MockPins, MockScripts};
use rs_throttle_bridge::{AutomationError, BridgeCore, Config, PowerState, TurnoutState};

fn dccex_core() -> BridgeCore {
    let mut core = BridgeCore::new(Config::default());
    core.on_connected(0);
    for line in ["<iDCC-EX V-5.0.0 / MEGA>", "<jR>", "<jT 7>", "<jA>"] {
        core.on_upstream_line(line, 5).unwrap();
    }
    core.on_upstream_line("<jT 7 C \"Yard\">", 6).unwrap();
    core.on_upstream_line("<p1>", 6).unwrap();
    assert!(core.session().is_synchronized());
    core.drain_upstream();
    core.drain_deltas();
    core
}

// ============================================================================
// Layout Interaction
// ============================================================================

#[test]
fn script_waits_for_upstream_sensor() {
    let mut core = dccex_core();
    let scripts = MockScripts::new().with_script("yard", "waitfor sensor 12 on\nthrow 7");
    let mut pins = MockPins::new();
    core.spawn_script("yard", 10, &scripts, &mut pins, false).unwrap();

    core.tick(10, &scripts, &mut pins);
    core.tick(30, &scripts, &mut pins);
    assert!(core.drain_upstream().is_empty());

    core.on_upstream_line("<Q 12>", 40).unwrap();
    core.tick(50, &scripts, &mut pins);
    assert_eq!(core.drain_upstream(), ["<T 7 1>"]);
    assert_eq!(core.registries().turnout("7").unwrap().state, TurnoutState::Thrown);
}

#[test]
fn key_press_wakes_script() {
    let mut core = dccex_core();
    let scripts = MockScripts::new().with_script("off", "key g\npower off");
    let mut pins = MockPins::new();
    core.spawn_script("off", 0, &scripts, &mut pins, false).unwrap();
    core.tick(0, &scripts, &mut pins);
    assert!(core.drain_upstream().is_empty());

    assert_eq!(core.inject_key('x'), 0);
    assert_eq!(core.inject_key('g'), 1);
    core.tick(20, &scripts, &mut pins);
    assert_eq!(core.drain_upstream(), ["<0>"]);
    assert_eq!(core.registries().power(), PowerState::Off);
}

#[test]
fn variables_are_shared_between_processes() {
    let mut core = dccex_core();
    let scripts = MockScripts::new()
        .with_script("seed", "set $shared 41")
        .with_script("bump", "delay 10\nset $shared $shared + 1");
    let mut pins = MockPins::new();
    core.spawn_script("seed", 0, &scripts, &mut pins, false).unwrap();
    core.spawn_script("bump", 0, &scripts, &mut pins, false).unwrap();

    core.tick(0, &scripts, &mut pins);
    core.tick(10, &scripts, &mut pins);
    assert_eq!(core.automation().variable("shared"), 42);
}

#[test]
fn refused_pin_does_not_stop_script() {
    let mut core = dccex_core();
    let scripts = MockScripts::new().with_script("pins", "configpin 2 high\nconfigpin 3 low\nset $done 1");
    let mut pins = MockPins::new().with_reserved(2);
    core.spawn_script("pins", 0, &scripts, &mut pins, false).unwrap();

    assert!(core.tick(0, &scripts, &mut pins).is_empty());
    assert_eq!(pins.mode(2), None);
    assert!(pins.mode(3).is_some());
    assert_eq!(core.automation().variable("done"), 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn stopped_script_is_freed_on_next_tick() {
    let mut core = dccex_core();
    let scripts = MockScripts::new().with_script("idle", "key x");
    let mut pins = MockPins::new();
    let pid = core.spawn_script("idle", 0, &scripts, &mut pins, false).unwrap();
    core.tick(0, &scripts, &mut pins);

    core.stop_script(pid).unwrap();
    assert_eq!(
        core.automation().process(pid).unwrap().state(),
        ProcessState::Terminating
    );
    core.tick(20, &scripts, &mut pins);
    assert_eq!(core.automation().process(pid).unwrap().state(), ProcessState::Free);
    assert_eq!(core.stop_script(pid), Err(AutomationError::NoSuchProcess(pid)));
}

#[test]
fn missing_foreground_child_fails_caller() {
    let mut core = dccex_core();
    let scripts = MockScripts::new().with_script("main", "runfg nothere\nthrow 7");
    let mut pins = MockPins::new();
    let pid = core.spawn_script("main", 0, &scripts, &mut pins, false).unwrap();

    let failures = core.tick(0, &scripts, &mut pins);
    assert_eq!(
        failures,
        [(pid, AutomationError::ScriptNotFound("nothere".into()))]
    );
    assert!(core.drain_upstream().is_empty());
}

#[test]
fn closing_session_stops_scripts() {
    let mut core = dccex_core();
    let scripts = MockScripts::new().with_script("idle", "key x");
    let mut pins = MockPins::new();
    core.spawn_script("idle", 0, &scripts, &mut pins, false).unwrap();
    core.spawn_script("idle", 0, &scripts, &mut pins, false).unwrap();
    assert_eq!(core.automation().live_count(), 2);

    core.close_session();
    core.tick(20, &scripts, &mut pins);
    assert_eq!(core.automation().live_count(), 0);
}

#[test]
fn tracing_records_executed_lines() {
    let mut core = dccex_core();
    let scripts = MockScripts::new().with_script("t", "rem hello\nset r0 1");
    let mut pins = MockPins::new();
    core.spawn_script("t", 0, &scripts, &mut pins, true).unwrap();
    core.tick(0, &scripts, &mut pins);

    let lines: Vec<_> = core.automation().trace().map(|t| t.line).collect();
    assert_eq!(lines, [1, 2]);
}
