//! WiThrottle line grammar.
//!
//! Lines are dispatched on their prefix. Anything not listed here decodes to
//! [`WiMessage::Noop`] holding the raw text, so unknown server chatter passes
//! through a relay untouched.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::fields::{
    join_subtokens, parse_num, split_fields, split_subtokens, FIELD_SEPARATOR, KEY_SEPARATOR,
};
use crate::entities::{AddressType, Direction, PowerState};
use crate::error::ParseError;

/// One roster entry from `RL`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RosterEntry {
    /// Roster name.
    pub name: String,
    /// DCC address.
    pub address: u16,
    /// Short or long address.
    pub address_type: AddressType,
}

/// One turnout or route from `PTL` / `PRL`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListEntry {
    /// System name.
    pub sys_name: String,
    /// User name.
    pub user_name: String,
    /// Numeric state code.
    pub state: u8,
}

/// Locomotive selector inside a multi-throttle line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocoKey {
    /// `*`: every locomotive on the throttle.
    All,
    /// `L1234` / `S3`.
    Address {
        /// DCC address.
        id: u16,
        /// Short or long.
        address_type: AddressType,
    },
}

impl LocoKey {
    /// Key for a single address.
    pub fn address(id: u16, address_type: AddressType) -> Self {
        LocoKey::Address { id, address_type }
    }

    /// Address, unless this is the `*` wildcard.
    pub fn id(&self) -> Option<u16> {
        match self {
            LocoKey::All => None,
            LocoKey::Address { id, .. } => Some(*id),
        }
    }

    fn parse(s: &str) -> Result<Self, ParseError> {
        if s == "*" {
            return Ok(LocoKey::All);
        }
        let mut chars = s.chars();
        let address_type = chars
            .next()
            .and_then(AddressType::from_char)
            .ok_or_else(|| ParseError::InvalidField {
                field: "locomotive key",
                value: s.into(),
            })?;
        Ok(LocoKey::Address {
            id: parse_num(chars.as_str())?,
            address_type,
        })
    }

    fn encode(&self) -> String {
        match self {
            LocoKey::All => "*".into(),
            LocoKey::Address { id, address_type } => format!("{}{}", address_type.as_char(), id),
        }
    }
}

/// Multi-throttle operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleOp {
    /// `+` add a locomotive (or acknowledge one).
    Add,
    /// `-` remove a locomotive.
    Remove,
    /// `A` action on a locomotive.
    Action,
    /// `S` steal prompt / steal confirmation.
    Steal,
    /// `L` function labels.
    Labels,
}

impl ThrottleOp {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(ThrottleOp::Add),
            '-' => Some(ThrottleOp::Remove),
            'A' => Some(ThrottleOp::Action),
            'S' => Some(ThrottleOp::Steal),
            'L' => Some(ThrottleOp::Labels),
            _ => None,
        }
    }

    fn as_char(&self) -> char {
        match self {
            ThrottleOp::Add => '+',
            ThrottleOp::Remove => '-',
            ThrottleOp::Action => 'A',
            ThrottleOp::Steal => 'S',
            ThrottleOp::Labels => 'L',
        }
    }
}

/// Right-hand side of a multi-throttle line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThrottleAction {
    /// Nothing after `<;>`.
    None,
    /// `V<speed>`.
    Speed(i16),
    /// `R1` forward, `R0` reverse.
    Direction(Direction),
    /// `F<0/1><n>`: button release/press (client) or state report (server).
    Function {
        /// Pressed / on.
        on: bool,
        /// Function number.
        num: u8,
    },
    /// `f<0/1><n>`: force a function state.
    ForceFunction {
        /// Desired state.
        on: bool,
        /// Function number.
        num: u8,
    },
    /// `m<0/1><n>`: set momentary mode.
    Momentary {
        /// Momentary (true) or latching.
        momentary: bool,
        /// Function number.
        num: u8,
    },
    /// `s<mode>`: speed-step mode.
    SpeedSteps(u8),
    /// `X`: emergency stop.
    EStop,
    /// `I`: idle (speed 0).
    Idle,
    /// `q<V|R>`: query speed or direction.
    Query(char),
    /// `r`: release.
    Release,
    /// `d`: dispatch.
    Dispatch,
    /// `E<name>`: add by roster name.
    Roster(String),
    /// Key echo, as in `M0+L1234<;>L1234`.
    Key(LocoKey),
    /// `]\[label]\[label…`.
    Labels(Vec<String>),
    /// Anything else, kept verbatim.
    Other(String),
}

impl ThrottleAction {
    fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Ok(ThrottleAction::None);
        }
        if s.starts_with(FIELD_SEPARATOR) {
            let labels = split_fields(s).into_iter().skip(1).map(String::from).collect();
            return Ok(ThrottleAction::Labels(labels));
        }
        let mut chars = s.chars();
        let Some(first) = chars.next() else {
            return Ok(ThrottleAction::None);
        };
        let rest = chars.as_str();
        let action = match first {
            'V' => ThrottleAction::Speed(parse_num(rest)?),
            'R' => ThrottleAction::Direction(match rest {
                "1" => Direction::Forward,
                "0" => Direction::Reverse,
                _ => {
                    return Err(ParseError::InvalidField {
                        field: "direction",
                        value: rest.into(),
                    })
                }
            }),
            'F' | 'f' | 'm' => {
                let (flag, num) = split_flag(rest)?;
                let num = parse_num(num)?;
                match first {
                    'F' => ThrottleAction::Function { on: flag, num },
                    'f' => ThrottleAction::ForceFunction { on: flag, num },
                    _ => ThrottleAction::Momentary {
                        momentary: flag,
                        num,
                    },
                }
            }
            's' => ThrottleAction::SpeedSteps(parse_num(rest)?),
            'X' if rest.is_empty() => ThrottleAction::EStop,
            'I' if rest.is_empty() => ThrottleAction::Idle,
            'r' if rest.is_empty() => ThrottleAction::Release,
            'd' if rest.is_empty() => ThrottleAction::Dispatch,
            'q' => match rest.chars().next() {
                Some(c) => ThrottleAction::Query(c),
                None => return Err(ParseError::MissingField("query")),
            },
            'E' => ThrottleAction::Roster(rest.into()),
            '*' if rest.is_empty() => ThrottleAction::Key(LocoKey::All),
            'L' | 'S' => ThrottleAction::Key(LocoKey::parse(s)?),
            _ => ThrottleAction::Other(s.into()),
        };
        Ok(action)
    }

    fn encode(&self) -> String {
        match self {
            ThrottleAction::None => String::new(),
            ThrottleAction::Speed(v) => format!("V{v}"),
            ThrottleAction::Direction(d) => {
                if d.is_forward() {
                    "R1".into()
                } else {
                    "R0".into()
                }
            }
            ThrottleAction::Function { on, num } => format!("F{}{num}", u8::from(*on)),
            ThrottleAction::ForceFunction { on, num } => format!("f{}{num}", u8::from(*on)),
            ThrottleAction::Momentary { momentary, num } => {
                format!("m{}{num}", u8::from(*momentary))
            }
            ThrottleAction::SpeedSteps(n) => format!("s{n}"),
            ThrottleAction::EStop => "X".into(),
            ThrottleAction::Idle => "I".into(),
            ThrottleAction::Query(c) => format!("q{c}"),
            ThrottleAction::Release => "r".into(),
            ThrottleAction::Dispatch => "d".into(),
            ThrottleAction::Roster(name) => format!("E{name}"),
            ThrottleAction::Key(key) => key.encode(),
            ThrottleAction::Labels(labels) => {
                let mut out = String::new();
                for label in labels {
                    out.push_str(FIELD_SEPARATOR);
                    out.push_str(label);
                }
                out
            }
            ThrottleAction::Other(raw) => raw.clone(),
        }
    }
}

fn split_flag(s: &str) -> Result<(bool, &str), ParseError> {
    match s.as_bytes().first() {
        Some(b'1') => Ok((true, &s[1..])),
        Some(b'0') => Ok((false, &s[1..])),
        _ => Err(ParseError::InvalidField {
            field: "function flag",
            value: s.into(),
        }),
    }
}

/// A multi-throttle (`M…`) line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThrottleLine {
    /// Throttle identifier character.
    pub throttle: char,
    /// Operation.
    pub op: ThrottleOp,
    /// Locomotive selector.
    pub key: LocoKey,
    /// Action.
    pub action: ThrottleAction,
}

impl ThrottleLine {
    /// Build a line.
    pub fn new(throttle: char, op: ThrottleOp, key: LocoKey, action: ThrottleAction) -> Self {
        Self {
            throttle,
            op,
            key,
            action,
        }
    }
}

/// A decoded WiThrottle line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WiMessage {
    /// `VN<version>`.
    Version(String),
    /// `RL<n>]\[…`.
    Roster(Vec<RosterEntry>),
    /// `PPA<0|1|2>`.
    Power(PowerState),
    /// `PTT]\[…` state label table, one sub-token list per field.
    TurnoutLabels(Vec<Vec<String>>),
    /// `PRT]\[…` state label table.
    RouteLabels(Vec<Vec<String>>),
    /// `PTL]\[…`.
    TurnoutList(Vec<ListEntry>),
    /// `PRL]\[…`.
    RouteList(Vec<ListEntry>),
    /// `PTA<code><sys>`; code is `T`/`C`/`2` from clients, a state digit from servers.
    TurnoutAction {
        /// Action or state code.
        code: char,
        /// Turnout system name.
        sys_name: String,
    },
    /// `PRA<code><sys>`.
    RouteAction {
        /// Action or state code.
        code: char,
        /// Route system name.
        sys_name: String,
    },
    /// `*<secs>`.
    HeartbeatInterval(u16),
    /// `*`.
    Heartbeat,
    /// `*+` / `*-`.
    HeartbeatMode(bool),
    /// `N<name>`.
    Name(String),
    /// `HU<id>`.
    HardwareId(String),
    /// `HT`, `Ht`, `HM`, `Hm` server type/description/message.
    ServerMessage {
        /// Second character of the prefix.
        kind: char,
        /// Message text.
        text: String,
    },
    /// `PW<port>`.
    WebPort(u16),
    /// `PFT<seconds><;><ratio>`.
    FastClock {
        /// Fast-clock epoch seconds.
        seconds: u64,
        /// Clock ratio, kept as text.
        ratio: String,
    },
    /// `Q`.
    Quit,
    /// `M…`.
    Throttle(ThrottleLine),
    /// Unrecognised line, kept verbatim.
    Noop(String),
}

/// Decode one WiThrottle line (already stripped of its terminator).
pub fn decode(line: &str) -> Result<WiMessage, ParseError> {
    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    let msg = if let Some(rest) = line.strip_prefix("VN") {
        WiMessage::Version(rest.into())
    } else if let Some(rest) = line.strip_prefix("RL") {
        WiMessage::Roster(decode_roster(rest)?)
    } else if let Some(rest) = line.strip_prefix("PPA") {
        let code = rest.chars().next().ok_or(ParseError::MissingField("power"))?;
        WiMessage::Power(PowerState::from_code(code).ok_or_else(|| ParseError::InvalidField {
            field: "power",
            value: rest.into(),
        })?)
    } else if let Some(rest) = line.strip_prefix("PTT") {
        WiMessage::TurnoutLabels(decode_table(rest))
    } else if let Some(rest) = line.strip_prefix("PRT") {
        WiMessage::RouteLabels(decode_table(rest))
    } else if let Some(rest) = line.strip_prefix("PTL") {
        WiMessage::TurnoutList(decode_list(rest))
    } else if let Some(rest) = line.strip_prefix("PRL") {
        WiMessage::RouteList(decode_list(rest))
    } else if let Some(rest) = line.strip_prefix("PTA") {
        let (code, sys_name) = decode_action(rest)?;
        WiMessage::TurnoutAction { code, sys_name }
    } else if let Some(rest) = line.strip_prefix("PRA") {
        let (code, sys_name) = decode_action(rest)?;
        WiMessage::RouteAction { code, sys_name }
    } else if let Some(rest) = line.strip_prefix("PFT") {
        let (secs, ratio) = rest.split_once(KEY_SEPARATOR).unwrap_or((rest, ""));
        WiMessage::FastClock {
            seconds: parse_num(secs)?,
            ratio: ratio.into(),
        }
    } else if let Some(rest) = line.strip_prefix("PW") {
        WiMessage::WebPort(parse_num(rest)?)
    } else if let Some(rest) = line.strip_prefix('*') {
        match rest {
            "" => WiMessage::Heartbeat,
            "+" => WiMessage::HeartbeatMode(true),
            "-" => WiMessage::HeartbeatMode(false),
            secs => WiMessage::HeartbeatInterval(parse_num(secs)?),
        }
    } else if let Some(rest) = line.strip_prefix("HU") {
        WiMessage::HardwareId(rest.into())
    } else if let Some(rest) = line.strip_prefix('H') {
        let mut chars = rest.chars();
        match chars.next() {
            Some(kind @ ('T' | 't' | 'M' | 'm')) => WiMessage::ServerMessage {
                kind,
                text: chars.as_str().into(),
            },
            _ => WiMessage::Noop(line.into()),
        }
    } else if let Some(rest) = line.strip_prefix('N') {
        WiMessage::Name(rest.into())
    } else if line == "Q" {
        WiMessage::Quit
    } else if let Some(rest) = line.strip_prefix('M') {
        WiMessage::Throttle(decode_throttle(rest)?)
    } else {
        WiMessage::Noop(line.into())
    };
    Ok(msg)
}

fn decode_roster(body: &str) -> Result<Vec<RosterEntry>, ParseError> {
    let fields = split_fields(body);
    let _count: usize = parse_num(fields.first().copied().unwrap_or("0"))?;
    let entries = fields
        .iter()
        .skip(1)
        .filter_map(|field| {
            let parts = split_subtokens(field);
            let address: u16 = parts.get(1)?.parse().ok()?;
            let address_type = parts
                .get(2)
                .and_then(|t| t.chars().next())
                .and_then(AddressType::from_char)
                .unwrap_or_else(|| AddressType::infer(address));
            Some(RosterEntry {
                name: parts[0].into(),
                address,
                address_type,
            })
        })
        .collect();
    Ok(entries)
}

fn decode_table(body: &str) -> Vec<Vec<String>> {
    split_fields(body)
        .into_iter()
        .skip(1)
        .map(|field| split_subtokens(field).into_iter().map(String::from).collect())
        .collect()
}

fn decode_list(body: &str) -> Vec<ListEntry> {
    split_fields(body)
        .into_iter()
        .skip(1)
        .filter(|field| !field.is_empty())
        .map(|field| {
            let parts = split_subtokens(field);
            ListEntry {
                sys_name: parts[0].into(),
                user_name: parts.get(1).copied().unwrap_or("").into(),
                state: parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(1),
            }
        })
        .collect()
}

fn decode_action(body: &str) -> Result<(char, String), ParseError> {
    let mut chars = body.chars();
    let code = chars.next().ok_or(ParseError::MissingField("action code"))?;
    let sys = chars.as_str();
    if sys.is_empty() {
        return Err(ParseError::MissingField("system name"));
    }
    Ok((code, sys.into()))
}

fn decode_throttle(body: &str) -> Result<ThrottleLine, ParseError> {
    let mut chars = body.chars();
    let throttle = chars.next().ok_or(ParseError::MissingField("throttle id"))?;
    let op_char = chars.next().ok_or(ParseError::MissingField("throttle op"))?;
    let op = ThrottleOp::from_char(op_char).ok_or_else(|| ParseError::InvalidField {
        field: "throttle op",
        value: op_char.to_string(),
    })?;
    let (key, action) = chars
        .as_str()
        .split_once(KEY_SEPARATOR)
        .ok_or(ParseError::MissingField("key separator"))?;
    Ok(ThrottleLine {
        throttle,
        op,
        key: LocoKey::parse(key)?,
        action: ThrottleAction::parse(action)?,
    })
}

/// Encode a WiThrottle message as a line (no terminator).
pub fn encode(msg: &WiMessage) -> String {
    match msg {
        WiMessage::Version(v) => format!("VN{v}"),
        WiMessage::Roster(entries) => {
            let mut out = format!("RL{}", entries.len());
            for e in entries {
                out.push_str(FIELD_SEPARATOR);
                out.push_str(&join_subtokens(&[
                    e.name.as_str(),
                    &e.address.to_string(),
                    &e.address_type.as_char().to_string(),
                ]));
            }
            out
        }
        WiMessage::Power(p) => format!("PPA{}", p.code()),
        WiMessage::TurnoutLabels(table) => encode_table("PTT", table),
        WiMessage::RouteLabels(table) => encode_table("PRT", table),
        WiMessage::TurnoutList(list) => encode_list("PTL", list),
        WiMessage::RouteList(list) => encode_list("PRL", list),
        WiMessage::TurnoutAction { code, sys_name } => format!("PTA{code}{sys_name}"),
        WiMessage::RouteAction { code, sys_name } => format!("PRA{code}{sys_name}"),
        WiMessage::HeartbeatInterval(secs) => format!("*{secs}"),
        WiMessage::Heartbeat => "*".into(),
        WiMessage::HeartbeatMode(on) => (if *on { "*+" } else { "*-" }).into(),
        WiMessage::Name(n) => format!("N{n}"),
        WiMessage::HardwareId(id) => format!("HU{id}"),
        WiMessage::ServerMessage { kind, text } => format!("H{kind}{text}"),
        WiMessage::WebPort(port) => format!("PW{port}"),
        WiMessage::FastClock { seconds, ratio } => format!("PFT{seconds}{KEY_SEPARATOR}{ratio}"),
        WiMessage::Quit => "Q".into(),
        WiMessage::Throttle(t) => format!(
            "M{}{}{}{KEY_SEPARATOR}{}",
            t.throttle,
            t.op.as_char(),
            t.key.encode(),
            t.action.encode()
        ),
        WiMessage::Noop(raw) => raw.clone(),
    }
}

fn encode_table(prefix: &str, table: &[Vec<String>]) -> String {
    let mut out = String::from(prefix);
    for field in table {
        out.push_str(FIELD_SEPARATOR);
        out.push_str(&join_subtokens(field));
    }
    out
}

fn encode_list(prefix: &str, list: &[ListEntry]) -> String {
    let mut out = String::from(prefix);
    for e in list {
        out.push_str(FIELD_SEPARATOR);
        out.push_str(&join_subtokens(&[
            e.sys_name.as_str(),
            e.user_name.as_str(),
            &e.state.to_string(),
        ]));
    }
    out
}
