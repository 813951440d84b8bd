//! Protocol codec: stateless translation between text lines and messages.
//!
//! Two dialects are spoken, WiThrottle and DCC-Ex. A [`Message`] is tagged
//! with its dialect, so nothing downstream needs to inspect runtime types.
//! Decoding never panics; a line that cannot be understood yields a
//! [`ParseError`], and a line that is well formed but irrelevant yields a
//! `Noop` carrying the raw text for verbatim forwarding.
//!
//! ```rust
//! use rs_throttle_bridge::protocol::{decode, encode, Dialect, Message};
//!
//! let msg = decode(Dialect::DccEx, "<p1 MAIN>").unwrap();
//! assert_eq!(encode(&msg), "<p1 MAIN>");
//!
//! assert!(decode(Dialect::WiThrottle, "M0AL3<;>Vfast").is_err());
//! ```

pub mod dccex;
pub mod fields;
pub mod withrottle;

use alloc::vec::Vec;

pub use dccex::{DccMessage, ListKind, PowerDistrict};
pub use withrottle::{LocoKey, ThrottleAction, ThrottleLine, ThrottleOp, WiMessage};

use crate::entities::{Delta, Locomotive, PowerState, SensorValue, TurnoutState};
use crate::error::{ParseError, ProtocolError};

/// Wire dialect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Dialect {
    /// JMRI WiThrottle.
    WiThrottle,
    /// DCC-Ex native.
    DccEx,
}

impl Dialect {
    /// Whether the command station answers our keepalive probe.
    pub const fn probe_is_answered(&self) -> bool {
        matches!(self, Dialect::DccEx)
    }

    /// The keepalive probe for this dialect.
    pub fn keepalive_probe(&self) -> Message {
        match self {
            Dialect::WiThrottle => Message::WiThrottle(WiMessage::Heartbeat),
            Dialect::DccEx => Message::DccEx(DccMessage::SlotQuery),
        }
    }
}

/// A decoded line of either dialect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// WiThrottle line.
    WiThrottle(WiMessage),
    /// DCC-Ex frame.
    DccEx(DccMessage),
}

impl Message {
    /// Dialect of this message.
    pub fn dialect(&self) -> Dialect {
        match self {
            Message::WiThrottle(_) => Dialect::WiThrottle,
            Message::DccEx(_) => Dialect::DccEx,
        }
    }

    /// Whether this is an unrecognised pass-through line.
    pub fn is_noop(&self) -> bool {
        matches!(
            self,
            Message::WiThrottle(WiMessage::Noop(_)) | Message::DccEx(DccMessage::Noop(_))
        )
    }
}

/// Decode one line in the given dialect. Surrounding whitespace is ignored.
pub fn decode(dialect: Dialect, line: &str) -> Result<Message, ParseError> {
    let line = line.trim_matches(|c: char| c == '\r' || c == '\n' || c == ' ');
    match dialect {
        Dialect::WiThrottle => withrottle::decode(line).map(Message::WiThrottle),
        Dialect::DccEx => dccex::decode(line).map(Message::DccEx),
    }
}

/// Encode a message as a line without terminator.
pub fn encode(msg: &Message) -> alloc::string::String {
    match msg {
        Message::WiThrottle(m) => withrottle::encode(m),
        Message::DccEx(m) => dccex::encode(m),
    }
}

/// Whether a line is keepalive chatter that may be shed under backpressure.
pub fn is_keepalive_line(line: &str) -> bool {
    let line = line.trim();
    matches!(line, "*" | "*+" | "*-" | "<#>")
        || (line.starts_with("<#") && line.ends_with('>'))
        || (line.starts_with('*') && line[1..].bytes().all(|b| b.is_ascii_digit()))
}

/// Guess the dialect from a single line, or `None` if it is unrecognisable.
pub fn detect_dialect(line: &str) -> Option<Dialect> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with('<') {
        return Some(Dialect::DccEx);
    }
    match withrottle::decode(line) {
        Ok(WiMessage::Noop(_)) | Err(_) => None,
        Ok(_) => Some(Dialect::WiThrottle),
    }
}

/// Tracks the identification window after a connection opens.
#[derive(Clone, Copy, Debug)]
pub struct DialectDetector {
    started_ms: u64,
    window_ms: u64,
}

impl DialectDetector {
    /// Open a window of `window_ms` starting at `now_ms`.
    pub fn new(now_ms: u64, window_ms: u64) -> Self {
        Self {
            started_ms: now_ms,
            window_ms,
        }
    }

    /// Inspect a received line.
    pub fn observe(&self, line: &str) -> Option<Dialect> {
        detect_dialect(line)
    }

    /// Fails once the window has elapsed.
    pub fn check(&self, now_ms: u64) -> Result<(), ProtocolError> {
        if now_ms.saturating_sub(self.started_ms) >= self.window_ms {
            Err(ProtocolError::Timeout {
                window_ms: self.window_ms,
            })
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Delta encoding
// ============================================================================

/// WiThrottle multi-throttle identifier for a throttle number (`0`..`Z`).
pub fn throttle_char(throttle_nr: u8) -> char {
    char::from_digit(u32::from(throttle_nr), 36)
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or('0')
}

fn state_char(code: u8) -> char {
    char::from_digit(u32::from(code), 10).unwrap_or('1')
}

/// Messages that announce `delta` to a peer speaking `dialect`.
///
/// Ownership-only changes produce nothing; neither dialect carries them.
pub fn encode_delta(dialect: Dialect, delta: &Delta) -> Vec<Message> {
    let mut out = Vec::new();
    match (dialect, delta) {
        (_, Delta::Locomotive { old, new: Some(new) }) => {
            let baseline = old.clone().unwrap_or_else(|| Locomotive::new(new.id));
            let speed = baseline.speed != new.speed;
            let direction = baseline.direction != new.direction;
            let functions = baseline.functions ^ new.functions;
            match dialect {
                Dialect::WiThrottle => {
                    let t = throttle_char(new.throttle_nr);
                    let key = LocoKey::address(new.id, new.address_type);
                    let action = |action| {
                        Message::WiThrottle(WiMessage::Throttle(ThrottleLine::new(
                            t,
                            ThrottleOp::Action,
                            key,
                            action,
                        )))
                    };
                    if speed {
                        out.push(action(ThrottleAction::Speed(new.speed)));
                    }
                    if direction {
                        out.push(action(ThrottleAction::Direction(new.direction)));
                    }
                    for num in 0..crate::entities::MAX_FUNCTIONS {
                        if functions & (1 << num) != 0 {
                            out.push(action(ThrottleAction::Function {
                                on: new.function(num),
                                num,
                            }));
                        }
                    }
                }
                Dialect::DccEx => {
                    if speed || direction || functions != 0 {
                        out.push(Message::DccEx(DccMessage::LocoBroadcast {
                            cab: new.id,
                            register: -1,
                            speed_byte: dccex::speed_byte(new.speed, new.direction),
                            functions: new.functions,
                        }));
                    }
                }
            }
        }
        (Dialect::WiThrottle, Delta::Turnout { old, new: Some(new) }) => {
            if old.as_ref().map(|o| o.state) != Some(new.state) {
                out.push(Message::WiThrottle(WiMessage::TurnoutAction {
                    code: state_char(new.state.code()),
                    sys_name: new.sys_name.as_str().into(),
                }));
            }
        }
        (Dialect::DccEx, Delta::Turnout { old, new: Some(new) }) => {
            let changed = old.as_ref().map(|o| o.state) != Some(new.state);
            let thrown = match new.state {
                TurnoutState::Thrown => Some(true),
                TurnoutState::Closed => Some(false),
                _ => None,
            };
            if let (true, Some(thrown), Ok(id)) =
                (changed, thrown, new.sys_name.as_str().parse::<u16>())
            {
                out.push(Message::DccEx(DccMessage::TurnoutBroadcast { id, thrown }));
            }
        }
        (Dialect::WiThrottle, Delta::Route { old, new: Some(new) }) => {
            if old.as_ref().map(|o| o.state) != Some(new.state) {
                out.push(Message::WiThrottle(WiMessage::RouteAction {
                    code: state_char(new.state.code()),
                    sys_name: new.sys_name.as_str().into(),
                }));
            }
        }
        (Dialect::DccEx, Delta::Sensor { id, new: Some(value), .. }) => match value {
            SensorValue::On => out.push(Message::DccEx(DccMessage::SensorActive(*id))),
            SensorValue::Off => out.push(Message::DccEx(DccMessage::SensorInactive(*id))),
            SensorValue::Unknown => {}
        },
        (Dialect::WiThrottle, Delta::Power { new, .. }) => {
            out.push(Message::WiThrottle(WiMessage::Power(*new)));
        }
        (Dialect::DccEx, Delta::Power { new, .. }) => {
            if *new != PowerState::Unknown {
                out.push(Message::DccEx(DccMessage::PowerBroadcast {
                    on: *new == PowerState::On,
                    district: None,
                }));
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Direction, Turnout};

    #[test]
    fn detection() {
        assert_eq!(detect_dialect("<iDCC-EX V-5.0.0>"), Some(Dialect::DccEx));
        assert_eq!(detect_dialect("VN2.0"), Some(Dialect::WiThrottle));
        assert_eq!(detect_dialect("HUclient"), Some(Dialect::WiThrottle));
        assert_eq!(detect_dialect("hello world"), None);
        assert_eq!(detect_dialect("   "), None);
    }

    #[test]
    fn keepalive_lines() {
        assert!(is_keepalive_line("*"));
        assert!(is_keepalive_line("*10"));
        assert!(is_keepalive_line("<# 50>"));
        assert!(!is_keepalive_line("<s>"));
        assert!(!is_keepalive_line("M0AL3<;>V4"));
        assert_eq!(throttle_char(11), 'B');
    }

    #[test]
    fn detector_window() {
        let det = DialectDetector::new(1_000, 5_000);
        assert!(det.check(5_999).is_ok());
        assert_eq!(
            det.check(6_000),
            Err(ProtocolError::Timeout { window_ms: 5_000 })
        );
    }

    #[test]
    fn decode_strips_terminators() {
        let msg = decode(Dialect::WiThrottle, "PPA1\r\n").unwrap();
        assert_eq!(msg, Message::WiThrottle(WiMessage::Power(PowerState::On)));
    }

    #[test]
    fn loco_delta_per_dialect() {
        let old = Locomotive::new(3);
        let mut new = old.clone();
        new.speed = 20;
        new.functions = 0b10;
        let delta = Delta::Locomotive {
            old: Some(old),
            new: Some(new),
        };

        let wi: Vec<_> = encode_delta(Dialect::WiThrottle, &delta)
            .iter()
            .map(encode)
            .collect();
        assert_eq!(wi, ["M0AS3<;>V20", "M0AS3<;>F11"]);

        let dcc: Vec<_> = encode_delta(Dialect::DccEx, &delta)
            .iter()
            .map(encode)
            .collect();
        assert_eq!(dcc, ["<l 3 -1 149 2>"]);
    }

    #[test]
    fn ownership_only_delta_is_silent() {
        let old = Locomotive::new(3);
        let mut new = old.clone();
        new.owner = Some(crate::ControlPath::Local);
        let delta = Delta::Locomotive {
            old: Some(old),
            new: Some(new),
        };
        assert!(encode_delta(Dialect::WiThrottle, &delta).is_empty());
        assert!(encode_delta(Dialect::DccEx, &delta).is_empty());
    }

    #[test]
    fn reverse_direction_delta() {
        let old = Locomotive::new(1234);
        let mut new = old.clone();
        new.direction = Direction::Reverse;
        let delta = Delta::Locomotive {
            old: Some(old),
            new: Some(new),
        };
        let wi: Vec<_> = encode_delta(Dialect::WiThrottle, &delta)
            .iter()
            .map(encode)
            .collect();
        assert_eq!(wi, ["M0AL1234<;>R0"]);
    }

    #[test]
    fn turnout_delta_numeric_only_for_dccex() {
        let delta = Delta::Turnout {
            old: None,
            new: Some(Turnout::new("12").with_state(TurnoutState::Thrown)),
        };
        assert_eq!(
            encode_delta(Dialect::DccEx, &delta),
            [Message::DccEx(DccMessage::TurnoutBroadcast {
                id: 12,
                thrown: true
            })]
        );
        assert_eq!(
            encode(&encode_delta(Dialect::WiThrottle, &delta)[0]),
            "PTA412"
        );

        let named = Delta::Turnout {
            old: None,
            new: Some(Turnout::new("LT12").with_state(TurnoutState::Thrown)),
        };
        assert!(encode_delta(Dialect::DccEx, &named).is_empty());
    }

    #[test]
    fn power_delta() {
        let delta = Delta::Power {
            old: PowerState::Unknown,
            new: PowerState::On,
        };
        assert_eq!(encode(&encode_delta(Dialect::WiThrottle, &delta)[0]), "PPA1");
        assert_eq!(encode(&encode_delta(Dialect::DccEx, &delta)[0]), "<p1>");
    }
}
