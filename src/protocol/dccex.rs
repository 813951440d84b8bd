//! DCC-Ex `<op args…>` grammar.
//!
//! The opcode is the first character inside the angle brackets; arguments
//! follow separated by whitespace. Frames this bridge has no use for decode
//! to [`DccMessage::Noop`] and re-encode verbatim.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use super::fields::{parse_num, tokenize, Token};
use crate::entities::Direction;
use crate::error::ParseError;

/// Track power district.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerDistrict {
    /// Main track.
    Main,
    /// Programming track.
    Prog,
    /// Programming track joined to main.
    Join,
}

impl PowerDistrict {
    /// Wire name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            PowerDistrict::Main => "MAIN",
            PowerDistrict::Prog => "PROG",
            PowerDistrict::Join => "JOIN",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MAIN" => Some(PowerDistrict::Main),
            "PROG" => Some(PowerDistrict::Prog),
            "JOIN" => Some(PowerDistrict::Join),
            _ => None,
        }
    }
}

/// Which list a `<J…>` request or `<j…>` reply concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListKind {
    /// `R`: roster.
    Roster,
    /// `T`: turnouts.
    Turnouts,
    /// `A`: routes and automations.
    Routes,
}

impl ListKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "R" => Some(ListKind::Roster),
            "T" => Some(ListKind::Turnouts),
            "A" => Some(ListKind::Routes),
            _ => None,
        }
    }

    /// Wire letter.
    pub const fn as_char(&self) -> char {
        match self {
            ListKind::Roster => 'R',
            ListKind::Turnouts => 'T',
            ListKind::Routes => 'A',
        }
    }
}

/// A decoded DCC-Ex frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DccMessage {
    /// `<s>`.
    StatusRequest,
    /// `<iDCC-EX …>`; the text after `i`.
    Identity(String),
    /// `<0>` / `<1>` with optional district.
    PowerCommand {
        /// On or off.
        on: bool,
        /// District, or all.
        district: Option<PowerDistrict>,
    },
    /// `<p0>` / `<p1 MAIN>`.
    PowerBroadcast {
        /// On or off.
        on: bool,
        /// District, or all.
        district: Option<PowerDistrict>,
    },
    /// `<t cab speed dir>` (or the legacy `<t reg cab speed dir>`).
    Throttle {
        /// Legacy register argument.
        register: Option<u16>,
        /// DCC address.
        cab: u16,
        /// 0..=126, −1 for emergency stop.
        speed: i16,
        /// Forward or reverse.
        direction: Direction,
    },
    /// `<t cab>`: ask for a locomotive's state.
    LocoStateRequest {
        /// DCC address.
        cab: u16,
    },
    /// `<l cab reg speedbyte functmap>`.
    LocoBroadcast {
        /// DCC address.
        cab: u16,
        /// Register (−1 when none).
        register: i16,
        /// Packed speed and direction.
        speed_byte: u8,
        /// Function bitmap.
        functions: u32,
    },
    /// `<F cab fn 0|1>`.
    Function {
        /// DCC address.
        cab: u16,
        /// Function number.
        function: u8,
        /// Desired state.
        on: bool,
    },
    /// `<T id 0|1>`.
    TurnoutCommand {
        /// Turnout id.
        id: u16,
        /// Thrown (true) or closed.
        thrown: bool,
    },
    /// `<H id 0|1>`.
    TurnoutBroadcast {
        /// Turnout id.
        id: u16,
        /// Thrown (true) or closed.
        thrown: bool,
    },
    /// `<JR>` / `<JR id>` etc.
    ListRequest {
        /// Which list.
        kind: ListKind,
        /// Detail for one id, or the id list.
        id: Option<u16>,
    },
    /// `<jR id id …>`.
    RosterIds(Vec<u16>),
    /// `<jR id "name" "labels">`.
    RosterDetail {
        /// DCC address.
        id: u16,
        /// Roster name.
        name: String,
        /// `/`-separated function labels, `*` marks momentary.
        functions: String,
    },
    /// `<jT id id …>`.
    TurnoutIds(Vec<u16>),
    /// `<jT id C|T|X "desc">`.
    TurnoutDetail {
        /// Turnout id.
        id: u16,
        /// `C` closed, `T` thrown, `X` unknown id.
        state: char,
        /// Description.
        description: Option<String>,
    },
    /// `<jA id id …>`.
    RouteIds(Vec<u16>),
    /// `<jA id R|A|X "desc">`.
    RouteDetail {
        /// Route id.
        id: u16,
        /// `R` route, `A` automation, `X` unknown id.
        kind: char,
        /// Description.
        description: Option<String>,
    },
    /// `</START id>`.
    StartRoute {
        /// Route id.
        id: u16,
    },
    /// `<Q id>`.
    SensorActive(u16),
    /// `<q id>`.
    SensorInactive(u16),
    /// `<!>`.
    EmergencyStop,
    /// `<#>`.
    SlotQuery,
    /// `<# n>`.
    SlotCount(u16),
    /// `<X>`.
    Failed,
    /// Unrecognised frame, kept verbatim.
    Noop(String),
}

// ============================================================================
// Speed byte
// ============================================================================

/// Pack speed and direction into a `<l>` speed byte.
///
/// ```
/// use rs_throttle_bridge::protocol::dccex::{speed_byte, from_speed_byte};
/// use rs_throttle_bridge::Direction;
///
/// assert_eq!(speed_byte(0, Direction::Forward), 0x80);
/// assert_eq!(speed_byte(-1, Direction::Reverse), 0x01);
/// assert_eq!(speed_byte(10, Direction::Forward), 0x80 | 11);
/// assert_eq!(from_speed_byte(0x80 | 11), (10, Direction::Forward));
/// ```
pub fn speed_byte(speed: i16, direction: Direction) -> u8 {
    let low = match speed {
        s if s < 0 => 1,
        0 => 0,
        s => (s.min(126) + 1) as u8,
    };
    if direction.is_forward() {
        0x80 | low
    } else {
        low
    }
}

/// Unpack a `<l>` speed byte.
pub fn from_speed_byte(byte: u8) -> (i16, Direction) {
    let direction = if byte & 0x80 != 0 {
        Direction::Forward
    } else {
        Direction::Reverse
    };
    let speed = match byte & 0x7f {
        0 => 0,
        1 => -1,
        n => i16::from(n) - 1,
    };
    (speed, direction)
}

// ============================================================================
// Decode
// ============================================================================

const KNOWN_OPCODES: &str = "s01ptlFTHJj/Qq!#X";

fn flag(token: &str) -> Result<bool, ParseError> {
    match token {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(ParseError::InvalidField {
            field: "flag",
            value: other.into(),
        }),
    }
}

fn numbers(tokens: &[Token<'_>]) -> Result<Vec<u16>, ParseError> {
    tokens.iter().map(|t| parse_num(t.text)).collect()
}

fn is_numeric(token: &Token<'_>) -> bool {
    !token.quoted && token.text.bytes().all(|b| b.is_ascii_digit())
}

fn first_char(token: &Token<'_>) -> Result<char, ParseError> {
    token
        .text
        .chars()
        .next()
        .ok_or(ParseError::MissingField("state"))
}

/// Decode one DCC-Ex frame, brackets included.
pub fn decode(line: &str) -> Result<DccMessage, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    let inner = line.strip_prefix('<').ok_or_else(|| ParseError::InvalidField {
        field: "frame",
        value: line.into(),
    })?;
    let body = inner.strip_suffix('>').ok_or(ParseError::Unterminated)?;
    let mut chars = body.chars();
    let op = chars.next().ok_or(ParseError::MissingField("opcode"))?;
    let args = chars.as_str();
    let noop = || DccMessage::Noop(line.into());

    // Identity text is free-form and may contain unbalanced quotes.
    if op == 'i' {
        return Ok(DccMessage::Identity(args.into()));
    }
    if !KNOWN_OPCODES.contains(op) {
        return Ok(noop());
    }
    let tokens = tokenize(args)?;
    let t: Vec<&str> = tokens.iter().map(|t| t.text).collect();

    let msg = match (op, t.as_slice()) {
        ('s', []) => DccMessage::StatusRequest,
        ('0' | '1', [rest @ ..]) if rest.len() <= 1 => DccMessage::PowerCommand {
            on: op == '1',
            district: match rest.first() {
                Some(d) => match PowerDistrict::parse(d) {
                    Some(d) => Some(d),
                    None => return Ok(noop()),
                },
                None => None,
            },
        },
        ('p', [state, rest @ ..]) if rest.len() <= 1 => DccMessage::PowerBroadcast {
            on: flag(state)?,
            district: match rest.first() {
                Some(d) => match PowerDistrict::parse(d) {
                    Some(d) => Some(d),
                    None => return Ok(noop()),
                },
                None => None,
            },
        },
        ('t', [cab]) => DccMessage::LocoStateRequest {
            cab: parse_num(cab)?,
        },
        ('t', [cab, speed, dir]) => DccMessage::Throttle {
            register: None,
            cab: parse_num(cab)?,
            speed: parse_num(speed)?,
            direction: throttle_direction(dir)?,
        },
        ('t', [reg, cab, speed, dir]) => DccMessage::Throttle {
            register: Some(parse_num(reg)?),
            cab: parse_num(cab)?,
            speed: parse_num(speed)?,
            direction: throttle_direction(dir)?,
        },
        ('l', [cab, reg, byte, functions]) => DccMessage::LocoBroadcast {
            cab: parse_num(cab)?,
            register: parse_num(reg)?,
            speed_byte: parse_num(byte)?,
            functions: parse_num(functions)?,
        },
        ('F', [cab, function, state]) => DccMessage::Function {
            cab: parse_num(cab)?,
            function: parse_num(function)?,
            on: flag(state)?,
        },
        ('T', [id, state]) if matches!(*state, "0" | "1") => DccMessage::TurnoutCommand {
            id: parse_num(id)?,
            thrown: flag(state)?,
        },
        ('H', [id, state]) if matches!(*state, "0" | "1") => DccMessage::TurnoutBroadcast {
            id: parse_num(id)?,
            thrown: flag(state)?,
        },
        ('J', [kind]) => match ListKind::parse(kind) {
            Some(kind) => DccMessage::ListRequest { kind, id: None },
            None => noop(),
        },
        ('J', [kind, id]) => match ListKind::parse(kind) {
            Some(kind) => DccMessage::ListRequest {
                kind,
                id: Some(parse_num(id)?),
            },
            None => noop(),
        },
        ('j', [kind, ..]) => match ListKind::parse(kind) {
            Some(kind) => decode_list_reply(kind, &tokens[1..])?,
            None => noop(),
        },
        ('/', ["START", id]) => DccMessage::StartRoute {
            id: parse_num(id)?,
        },
        ('Q', [id]) => DccMessage::SensorActive(parse_num(id)?),
        ('q', [id]) => DccMessage::SensorInactive(parse_num(id)?),
        ('!', []) => DccMessage::EmergencyStop,
        ('#', []) => DccMessage::SlotQuery,
        ('#', [n]) => DccMessage::SlotCount(parse_num(n)?),
        ('X', []) => DccMessage::Failed,
        _ => noop(),
    };
    Ok(msg)
}

fn throttle_direction(token: &str) -> Result<Direction, ParseError> {
    Ok(if flag(token)? {
        Direction::Forward
    } else {
        Direction::Reverse
    })
}

fn decode_list_reply(kind: ListKind, rest: &[Token<'_>]) -> Result<DccMessage, ParseError> {
    let detail = rest.len() >= 2 && !is_numeric(&rest[1]);
    if !detail {
        let ids = numbers(rest)?;
        return Ok(match kind {
            ListKind::Roster => DccMessage::RosterIds(ids),
            ListKind::Turnouts => DccMessage::TurnoutIds(ids),
            ListKind::Routes => DccMessage::RouteIds(ids),
        });
    }
    let id = parse_num(rest[0].text)?;
    let description = rest.get(2).map(|t| String::from(t.text));
    Ok(match kind {
        ListKind::Roster => DccMessage::RosterDetail {
            id,
            name: rest[1].text.into(),
            functions: description.unwrap_or_default(),
        },
        ListKind::Turnouts => DccMessage::TurnoutDetail {
            id,
            state: first_char(&rest[1])?,
            description,
        },
        ListKind::Routes => DccMessage::RouteDetail {
            id,
            kind: first_char(&rest[1])?,
            description,
        },
    })
}

// ============================================================================
// Encode
// ============================================================================

fn join_ids(prefix: &str, ids: &[u16]) -> String {
    let mut out = String::from(prefix);
    for id in ids {
        out.push_str(&format!(" {id}"));
    }
    out.push('>');
    out
}

fn district_suffix(district: &Option<PowerDistrict>) -> String {
    match district {
        Some(d) => format!(" {}", d.as_str()),
        None => String::new(),
    }
}

fn quoted_suffix(description: &Option<String>) -> String {
    match description {
        Some(d) => format!(" \"{d}\""),
        None => String::new(),
    }
}

/// Encode a DCC-Ex message as a frame.
pub fn encode(msg: &DccMessage) -> String {
    match msg {
        DccMessage::StatusRequest => "<s>".into(),
        DccMessage::Identity(text) => format!("<i{text}>"),
        DccMessage::PowerCommand { on, district } => {
            format!("<{}{}>", u8::from(*on), district_suffix(district))
        }
        DccMessage::PowerBroadcast { on, district } => {
            format!("<p{}{}>", u8::from(*on), district_suffix(district))
        }
        DccMessage::Throttle {
            register,
            cab,
            speed,
            direction,
        } => {
            let dir = u8::from(direction.is_forward());
            match register {
                Some(reg) => format!("<t {reg} {cab} {speed} {dir}>"),
                None => format!("<t {cab} {speed} {dir}>"),
            }
        }
        DccMessage::LocoStateRequest { cab } => format!("<t {cab}>"),
        DccMessage::LocoBroadcast {
            cab,
            register,
            speed_byte,
            functions,
        } => format!("<l {cab} {register} {speed_byte} {functions}>"),
        DccMessage::Function { cab, function, on } => {
            format!("<F {cab} {function} {}>", u8::from(*on))
        }
        DccMessage::TurnoutCommand { id, thrown } => format!("<T {id} {}>", u8::from(*thrown)),
        DccMessage::TurnoutBroadcast { id, thrown } => format!("<H {id} {}>", u8::from(*thrown)),
        DccMessage::ListRequest { kind, id } => match id {
            Some(id) => format!("<J{} {id}>", kind.as_char()),
            None => format!("<J{}>", kind.as_char()),
        },
        DccMessage::RosterIds(ids) => join_ids("<jR", ids),
        DccMessage::TurnoutIds(ids) => join_ids("<jT", ids),
        DccMessage::RouteIds(ids) => join_ids("<jA", ids),
        DccMessage::RosterDetail {
            id,
            name,
            functions,
        } => format!("<jR {id} \"{name}\" \"{functions}\">"),
        DccMessage::TurnoutDetail {
            id,
            state,
            description,
        } => format!("<jT {id} {state}{}>", quoted_suffix(description)),
        DccMessage::RouteDetail {
            id,
            kind,
            description,
        } => format!("<jA {id} {kind}{}>", quoted_suffix(description)),
        DccMessage::StartRoute { id } => format!("</START {id}>"),
        DccMessage::SensorActive(id) => format!("<Q {id}>"),
        DccMessage::SensorInactive(id) => format!("<q {id}>"),
        DccMessage::EmergencyStop => "<!>".into(),
        DccMessage::SlotQuery => "<#>".into(),
        DccMessage::SlotCount(n) => format!("<# {n}>"),
        DccMessage::Failed => "<X>".into(),
        DccMessage::Noop(raw) => raw.clone(),
    }
}
