//! Integration tests for the registries and ownership arbiter

use rs_throttle_bridge::{
    Claim, ControlPath, Delta, Direction, ListOrder, Locomotive, PowerState, Registries,
    RegistryError, SensorValue, Turnout, TurnoutState,
};

// ============================================================================
// Ownership
// ============================================================================

#[test]
fn one_owner_at_a_time() {
    let mut reg = Registries::new();
    reg.set_owner(3, ControlPath::Local).unwrap();

    let err = reg.set_owner(3, ControlPath::Relay(0)).unwrap_err();
    assert_eq!(
        err,
        RegistryError::AlreadyOwned {
            id: 3,
            owner: ControlPath::Local
        }
    );
    assert_eq!(reg.locomotive(3).unwrap().owner, Some(ControlPath::Local));
}

#[test]
fn reclaiming_own_locomotive_is_silent() {
    let mut reg = Registries::new();
    assert!(reg.set_owner(3, ControlPath::Local).unwrap().is_some());
    assert_eq!(reg.set_owner(3, ControlPath::Local), Ok(None));
}

#[test]
fn steal_waits_for_confirmation() {
    let mut reg = Registries::new();
    reg.set_owner(3, ControlPath::Relay(1)).unwrap();

    let claim = reg.request_steal(3, ControlPath::Local).unwrap();
    assert_eq!(claim, Claim::PendingConfirmation);
    let loco = reg.locomotive(3).unwrap();
    assert_eq!(loco.owner, Some(ControlPath::Relay(1)));
    assert_eq!(loco.pending_steal, Some(ControlPath::Local));

    reg.confirm_steal(3).unwrap();
    let loco = reg.locomotive(3).unwrap();
    assert_eq!(loco.owner, Some(ControlPath::Local));
    assert_eq!(loco.pending_steal, None);
    assert_eq!(loco.relay_slot, None);
}

#[test]
fn confirm_without_request_fails() {
    let mut reg = Registries::new();
    reg.upsert_locomotive(Locomotive::new(7));
    assert_eq!(reg.confirm_steal(7), Err(RegistryError::NoPendingSteal(7)));
}

#[test]
fn release_by_stranger_is_refused() {
    let mut reg = Registries::new();
    reg.set_owner(3, ControlPath::Automation(2)).unwrap();
    assert!(matches!(
        reg.release(3, ControlPath::Local),
        Err(RegistryError::NotOwner { id: 3, .. })
    ));
    assert!(reg.release(3, ControlPath::Automation(2)).unwrap().is_some());
    assert!(!reg.locomotive(3).unwrap().is_owned());
}

#[test]
fn consist_limit_applies_per_path() {
    let mut reg = Registries::new().with_max_consist(2);
    reg.set_owner(1, ControlPath::Local).unwrap();
    reg.set_owner(2, ControlPath::Local).unwrap();
    assert!(matches!(
        reg.set_owner(3, ControlPath::Local),
        Err(RegistryError::ConsistFull { limit: 2, .. })
    ));
    assert!(reg.set_owner(3, ControlPath::Relay(0)).is_ok());
}

#[test]
fn release_all_covers_pending_steals() {
    let mut reg = Registries::new();
    reg.set_owner(1, ControlPath::Relay(0)).unwrap();
    reg.set_owner(2, ControlPath::Relay(0)).unwrap();
    reg.set_owner(3, ControlPath::Local).unwrap();
    reg.request_steal(3, ControlPath::Relay(0)).unwrap();

    let deltas = reg.release_all(ControlPath::Relay(0));
    assert_eq!(deltas.len(), 3);
    assert!(reg.owned_by(ControlPath::Relay(0)).is_empty());
    assert_eq!(reg.locomotive(3).unwrap().pending_steal, None);
    assert_eq!(reg.locomotive(3).unwrap().owner, Some(ControlPath::Local));
}

// ============================================================================
// Deltas
// ============================================================================

#[test]
fn unchanged_values_produce_no_delta() {
    let mut reg = Registries::new();
    assert!(reg.set_speed(3, 20).is_some());
    assert!(reg.set_speed(3, 20).is_none());
    assert!(reg.set_direction(3, Direction::Unchanged).is_none());
}

#[test]
fn power_and_sensor_changes_are_reported() {
    let mut reg = Registries::new();
    assert_eq!(reg.power(), PowerState::Unknown);
    assert!(matches!(reg.set_power(PowerState::On), Some(Delta::Power { .. })));
    assert!(reg.set_power(PowerState::On).is_none());

    assert!(reg.set_sensor(12, SensorValue::On).is_some());
    assert_eq!(reg.sensor(12).unwrap().value, SensorValue::On);
}

#[test]
fn clear_locomotives_reports_each_removal() {
    let mut reg = Registries::new();
    reg.upsert_locomotive(Locomotive::new(1));
    reg.upsert_locomotive(Locomotive::new(2));
    assert_eq!(reg.clear_locomotives().len(), 2);
    assert!(reg.locomotive(1).is_none());
}

// ============================================================================
// Listing
// ============================================================================

#[test]
fn turnouts_list_in_requested_order() {
    let mut reg = Registries::new();
    reg.upsert_turnout(Turnout::new("LT9").with_user_name("Alpha"));
    reg.upsert_turnout(Turnout::new("LT1").with_user_name("Zulu"));

    let insertion: Vec<_> = reg
        .list_turnouts(ListOrder::Insertion)
        .iter()
        .map(|t| t.sys_name.as_str())
        .collect();
    assert_eq!(insertion, ["LT9", "LT1"]);

    let by_name: Vec<_> = reg
        .list_turnouts(ListOrder::ByName)
        .iter()
        .map(|t| t.sys_name.as_str())
        .collect();
    assert_eq!(by_name, ["LT9", "LT1"]);

    assert_eq!(reg.turnout("LT1").unwrap().state, TurnoutState::Unknown);
}
