//! Integration tests for the WiThrottle and DCC-Ex codecs

use rs_throttle_bridge::protocol::{
    decode, detect_dialect, encode, encode_delta, is_keepalive_line, throttle_char, DccMessage,
    DialectDetector, LocoKey, ThrottleAction, ThrottleOp, WiMessage,
};
use rs_throttle_bridge::{AddressType, Delta, Dialect, Message, PowerState, ProtocolError};

// ============================================================================
// WiThrottle
// ============================================================================

#[test]
fn roster_entries_are_split() {
    let msg = decode(
        Dialect::WiThrottle,
        "RL2]\\[Mogul}|{1234}|{L]\\[Switcher}|{3}|{S",
    )
    .unwrap();
    let Message::WiThrottle(WiMessage::Roster(entries)) = msg else {
        panic!("expected roster, got {:?}", msg);
    };
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "Mogul");
    assert_eq!(entries[0].address, 1234);
    assert_eq!(entries[0].address_type, AddressType::Long);
    assert_eq!(entries[1].address, 3);
    assert_eq!(entries[1].address_type, AddressType::Short);
}

#[test]
fn throttle_speed_line_round_trips() {
    let line = "M0AL1234<;>V64";
    let msg = decode(Dialect::WiThrottle, line).unwrap();
    let Message::WiThrottle(WiMessage::Throttle(throttle)) = &msg else {
        panic!("expected throttle line, got {:?}", msg);
    };
    assert_eq!(throttle.throttle, '0');
    assert_eq!(throttle.op, ThrottleOp::Action);
    assert_eq!(throttle.key, LocoKey::address(1234, AddressType::Long));
    assert_eq!(throttle.action, ThrottleAction::Speed(64));
    assert_eq!(encode(&msg), line);
}

#[test]
fn power_and_heartbeat() {
    assert_eq!(
        decode(Dialect::WiThrottle, "PPA1").unwrap(),
        Message::WiThrottle(WiMessage::Power(PowerState::On))
    );
    assert_eq!(
        decode(Dialect::WiThrottle, "*").unwrap(),
        Message::WiThrottle(WiMessage::Heartbeat)
    );
    assert_eq!(
        decode(Dialect::WiThrottle, "*10").unwrap(),
        Message::WiThrottle(WiMessage::HeartbeatInterval(10))
    );
}

#[test]
fn unknown_withrottle_line_is_noop() {
    let msg = decode(Dialect::WiThrottle, "ZZtop").unwrap();
    assert!(msg.is_noop());
}

#[test]
fn malformed_lines_are_errors() {
    assert!(decode(Dialect::WiThrottle, "M0AL3<;>Vfast").is_err());
    assert!(decode(Dialect::WiThrottle, "").is_err());
    assert!(decode(Dialect::WiThrottle, "PPA").is_err());
}

// ============================================================================
// DCC-Ex
// ============================================================================

#[test]
fn dccex_frames_decode() {
    assert_eq!(
        decode(Dialect::DccEx, "<Q 12>").unwrap(),
        Message::DccEx(DccMessage::SensorActive(12))
    );
    assert_eq!(
        decode(Dialect::DccEx, "<q 12>").unwrap(),
        Message::DccEx(DccMessage::SensorInactive(12))
    );
    assert_eq!(
        decode(Dialect::DccEx, "<H 7 1>").unwrap(),
        Message::DccEx(DccMessage::TurnoutBroadcast { id: 7, thrown: true })
    );
    assert_eq!(
        decode(Dialect::DccEx, "<s>").unwrap(),
        Message::DccEx(DccMessage::StatusRequest)
    );
}

#[test]
fn dccex_identity_keeps_free_text() {
    let msg = decode(Dialect::DccEx, "<iDCC-EX V-5.0.0 / MEGA / STANDARD_MOTOR_SHIELD G-c389fe9>").unwrap();
    assert!(matches!(msg, Message::DccEx(DccMessage::Identity(ref text)) if text.starts_with("DCC-EX")));
}

#[test]
fn dccex_power_with_district_round_trips() {
    let msg = decode(Dialect::DccEx, "<p1 MAIN>").unwrap();
    assert_eq!(encode(&msg), "<p1 MAIN>");
}

#[test]
fn dccex_unknown_opcode_passes_through() {
    let msg = decode(Dialect::DccEx, "<@ 0 0 \"hello\">").unwrap();
    assert!(msg.is_noop());
}

// ============================================================================
// Detection and helpers
// ============================================================================

#[test]
fn dialect_is_detected_from_first_line() {
    assert_eq!(detect_dialect("VN2.0"), Some(Dialect::WiThrottle));
    assert_eq!(detect_dialect("<iDCC-EX V-5.0.0>"), Some(Dialect::DccEx));
    assert_eq!(detect_dialect("   "), None);
    assert_eq!(detect_dialect("hello"), None);
}

#[test]
fn detection_window_expires() {
    let detector = DialectDetector::new(1_000, 500);
    assert!(detector.check(1_499).is_ok());
    assert_eq!(
        detector.check(1_500),
        Err(ProtocolError::Timeout { window_ms: 500 })
    );
}

#[test]
fn keepalive_lines_are_recognised() {
    for line in ["*", "*+", "*-", "*10", "<#>", "<# 12>"] {
        assert!(is_keepalive_line(line), "{line}");
    }
    for line in ["PPA1", "<Q 12>", "M0AL3<;>V1"] {
        assert!(!is_keepalive_line(line), "{line}");
    }
}

#[test]
fn throttle_numbers_map_to_base36() {
    assert_eq!(throttle_char(0), '0');
    assert_eq!(throttle_char(9), '9');
    assert_eq!(throttle_char(10), 'A');
}

#[test]
fn power_delta_is_announced_in_both_dialects() {
    let delta = Delta::Power {
        old: PowerState::Off,
        new: PowerState::On,
    };
    let wi = encode_delta(Dialect::WiThrottle, &delta);
    assert_eq!(wi.iter().map(encode).collect::<Vec<_>>(), ["PPA1"]);

    let dcc = encode_delta(Dialect::DccEx, &delta);
    assert_eq!(dcc.len(), 1);
    assert!(encode(&dcc[0]).starts_with("<p1"));
}
