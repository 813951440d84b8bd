//! Integration tests for the upstream session and the relay, driven through
//! the bridge core

use rs_throttle_bridge::{
    BridgeCore, Config, ControlPath, Delta, Dialect, Direction, Intent, IntentOutcome, NetworkConfig,
    PowerState, RejectReason, Route, RouteState, SessionError, SessionSignal, SessionState,
    TurnoutState,
};

fn dccex_core() -> BridgeCore {
    dccex_core_with(Config::default())
}

fn dccex_core_with(config: Config) -> BridgeCore {
    let mut core = BridgeCore::new(config);
    core.on_connected(0);
    assert_eq!(core.drain_upstream(), ["<s>"]);

    core.on_upstream_line("<iDCC-EX V-5.0.0 / MEGA>", 5).unwrap();
    assert_eq!(core.drain_upstream(), ["<JR>", "<JT>", "<JA>"]);

    core.on_upstream_line("<jR 3>", 6).unwrap();
    core.on_upstream_line("<jT 7>", 6).unwrap();
    core.on_upstream_line("<jA>", 6).unwrap();
    assert_eq!(core.drain_upstream(), ["<JR 3>", "<JT 7>"]);
    assert!(!core.session().is_synchronized());

    core.on_upstream_line("<jR 3 \"Mogul\" \"Light/Bell/*Horn\">", 7).unwrap();
    core.on_upstream_line("<jT 7 C \"Yard\">", 7).unwrap();
    core.on_upstream_line("<p1>", 8).unwrap();
    assert!(core.session().is_synchronized());
    core.drain_deltas();
    core
}

// ============================================================================
// Session
// ============================================================================

#[test]
fn dccex_synchronization_fills_registries() {
    let core = dccex_core();
    assert_eq!(core.session().dialect(), Some(Dialect::DccEx));

    let loco = core.registries().locomotive(3).unwrap();
    assert_eq!(loco.name.as_str(), "Mogul");
    assert!(!loco.is_latching(2));

    let turnout = core.registries().turnout("7").unwrap();
    assert_eq!(turnout.state, TurnoutState::Closed);
    assert_eq!(core.registries().power(), PowerState::On);
}

#[test]
fn local_throttle_goes_upstream() {
    let mut core = dccex_core();
    let outcome = core
        .submit(Intent::SetSpeed { id: 3, speed: 30 }, ControlPath::Local)
        .unwrap();
    assert!(outcome.is_applied());
    assert_eq!(core.registries().locomotive(3).unwrap().owner, Some(ControlPath::Local));
    assert!(core.drain_upstream().iter().any(|l| l.starts_with("<t 3 30 ")));
}

#[test]
fn ownership_conflict_is_rejected() {
    let mut core = dccex_core();
    core.submit(Intent::SetSpeed { id: 3, speed: 30 }, ControlPath::Local)
        .unwrap();
    let outcome = core
        .submit(Intent::SetSpeed { id: 3, speed: 0 }, ControlPath::Automation(1))
        .unwrap();
    assert_eq!(
        outcome,
        IntentOutcome::Rejected(RejectReason::AlreadyOwned {
            owner: ControlPath::Local
        })
    );
    assert_eq!(core.registries().locomotive(3).unwrap().speed, 30);
}

#[test]
fn unchanged_direction_is_a_no_op() {
    let mut core = dccex_core();
    core.drain_upstream();
    let outcome = core
        .submit(
            Intent::SetDirection {
                id: 3,
                direction: Direction::Unchanged,
            },
            ControlPath::Local,
        )
        .unwrap();
    assert!(outcome.deltas().is_empty());
    assert!(core.drain_upstream().is_empty());
}

#[test]
fn submit_before_identification_is_not_ready() {
    let mut core = BridgeCore::new(Config::default());
    core.on_connected(0);
    assert_eq!(
        core.submit(Intent::SetSpeed { id: 3, speed: 1 }, ControlPath::Local),
        Err(SessionError::NotReady)
    );
}

#[test]
fn silent_dccex_station_degrades_session() {
    let mut core = dccex_core();
    let network = core.config().network.clone();
    let deadline = 8 + network.keepalive_ms + network.timeout_ms + 1;

    let signal = core.poll_session(deadline);
    assert!(matches!(signal, Some(SessionSignal::Disconnect(_))));
    assert_eq!(core.session().state(), SessionState::Degraded);
}

#[test]
fn identification_window_expires() {
    let config = Config::default().with_network(NetworkConfig::default().with_init_wait_ms(100));
    let mut core = BridgeCore::new(config);
    core.on_connected(0);
    core.on_upstream_line("garbage", 10).unwrap();
    assert_eq!(core.poll_session(50), None);
    assert!(matches!(core.poll_session(100), Some(SessionSignal::Disconnect(_))));
}

// ============================================================================
// Local routes
// ============================================================================

fn yard_ladder() -> Route {
    Route::new("9")
        .with_user_name("Yard ladder")
        .with_step("5", TurnoutState::Thrown)
        .unwrap()
        .with_step("6", TurnoutState::Closed)
        .unwrap()
        .with_step("8", TurnoutState::Thrown)
        .unwrap()
}

#[test]
fn configured_route_is_driven_step_by_step() {
    let mut core = dccex_core_with(Config::default().with_route(yard_ladder()));
    assert_eq!(core.registries().route("9").unwrap().steps.len(), 3);
    core.drain_upstream();

    let outcome = core
        .submit(Intent::route("9"), ControlPath::Local)
        .unwrap();
    assert!(outcome.is_applied());
    assert_eq!(core.drain_upstream(), ["<T 5 1>", "<T 6 0>", "<T 8 1>"]);
    assert_eq!(core.registries().route("9").unwrap().state, RouteState::Unknown);

    core.on_upstream_line("<H 8 1>", 20).unwrap();
    core.on_upstream_line("<H 5 1>", 21).unwrap();
    assert_eq!(core.registries().route("9").unwrap().state, RouteState::Unknown);
    core.on_upstream_line("<H 6 0>", 22).unwrap();
    assert_eq!(core.registries().route("9").unwrap().state, RouteState::Active);
}

#[test]
fn defined_route_is_published_and_keeps_steps() {
    let mut core = dccex_core();
    let delta = core.define_route(yard_ladder()).unwrap();
    assert!(matches!(delta, Delta::Route { old: None, .. }));
    assert_eq!(core.drain_deltas(), [delta]);

    // A name-only update from the command station leaves the steps alone.
    core.on_upstream_line("<jA 9 R \"Ladder\">", 30).unwrap();
    assert_eq!(core.registries().route("9").unwrap().steps.len(), 3);

    core.submit(Intent::route("9"), ControlPath::Automation(0))
        .unwrap();
    assert_eq!(core.drain_upstream().len(), 3);
}

// ============================================================================
// Relay
// ============================================================================

#[test]
fn withrottle_client_throws_dccex_turnout() {
    let mut core = dccex_core();
    let slot = core.accept_client("10.0.0.9:5000", 10).unwrap();
    core.on_client_line(slot, "NPhone", 10).unwrap();
    let greeting = core.drain_client(slot);
    assert_eq!(greeting.first().map(String::as_str), Some("VN2.0"));
    assert!(greeting.iter().any(|l| l.starts_with("RL1")));

    core.drain_upstream();
    core.on_client_line(slot, "PTAT7", 11).unwrap();
    assert_eq!(core.drain_upstream(), ["<T 7 1>"]);
    assert_eq!(core.registries().turnout("7").unwrap().state, TurnoutState::Thrown);

    // The command station confirms; nothing changes a second time.
    core.on_upstream_line("<H 7 1>", 12).unwrap();
    assert_eq!(core.registries().turnout("7").unwrap().state, TurnoutState::Thrown);
}

#[test]
fn relay_clients_cannot_take_each_others_locomotives() {
    let mut core = dccex_core();
    let a = core.accept_client("a", 10).unwrap();
    let b = core.accept_client("b", 10).unwrap();
    core.on_client_line(a, "NA", 10).unwrap();
    core.on_client_line(b, "NB", 10).unwrap();

    core.on_client_line(a, "M0+S3<;>S3", 11).unwrap();
    core.on_client_line(b, "M0+S3<;>S3", 12).unwrap();
    assert_eq!(core.registries().locomotive(3).unwrap().owner, Some(ControlPath::Relay(a)));

    core.teardown_client(a);
    assert!(!core.registries().locomotive(3).unwrap().is_owned());
    assert!(core.relay().connection(a).is_none());
}

#[test]
fn dccex_client_sees_upstream_sensor_changes() {
    let mut core = dccex_core();
    let slot = core.accept_client("panel", 10).unwrap();
    core.on_client_line(slot, "<s>", 10).unwrap();
    core.drain_client(slot);

    core.on_upstream_line("<Q 12>", 20).unwrap();
    assert_eq!(core.drain_client(slot), ["<Q 12>"]);
}

#[test]
fn full_relay_refuses_newcomers() {
    let mut core = dccex_core();
    let capacity = core.relay().capacity();
    for n in 0..capacity {
        core.accept_client(&format!("c{n}"), 10).unwrap();
    }
    assert!(core.accept_client("late", 10).is_err());
    assert!(core.client_active(0));
}
