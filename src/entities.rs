//! Entity data model shared by the registries, the codec and the engine.
//!
//! Locomotives are keyed by DCC address, turnouts and routes by their system
//! name, sensors by numeric id. Names are bounded `heapless` strings so the
//! records stay allocation-light on the target; only function labels (which
//! arrive with the roster detail and vary wildly in count) live on the heap.

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::bounded_string;

/// Functions addressable per locomotive (F0..F29).
pub const MAX_FUNCTIONS: u8 = 30;

/// Locomotives a single control path may own at once.
pub const MAX_CONSIST_SIZE: usize = 8;

/// Byte length of user-visible names.
pub const NAME_LENGTH: usize = 32;

/// Byte length of system names.
pub const SYS_NAME_LENGTH: usize = 16;

/// Turnout steps a route may hold.
pub const MAX_ROUTE_STEPS: usize = 25;

/// Default latching mask: F0, F1, F5, F6, F7 and F8 latch, the rest are momentary.
pub const DEFAULT_FUNCTION_LATCH: u32 = 483;

/// Highest DCC speed step value.
pub const MAX_SPEED: i16 = 126;

/// Speed sentinel for an emergency stop.
pub const ESTOP_SPEED: i16 = -1;

/// User-visible name.
pub type Name = heapless::String<NAME_LENGTH>;

/// System name (turnout/route identity).
pub type SysName = heapless::String<SYS_NAME_LENGTH>;

/// Build a [`Name`], truncating at a character boundary.
pub fn name(s: &str) -> Name {
    bounded_string(s)
}

/// Build a [`SysName`], truncating at a character boundary.
pub fn sys_name(s: &str) -> SysName {
    bounded_string(s)
}

// ============================================================================
// Enumerations
// ============================================================================

/// Direction of travel.
///
/// [`Unchanged`](Self::Unchanged) is a request sentinel meaning "leave the
/// direction as it is"; it is resolved before anything is stored, so a
/// locomotive record never carries it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    /// Moving forward.
    Forward,
    /// Centre-off: speed forced to zero, direction kept.
    #[default]
    Stop,
    /// Moving in reverse.
    Reverse,
    /// Leave the current direction alone.
    Unchanged,
}

impl Direction {
    /// Lowercase name.
    ///
    /// ```
    /// use rs_throttle_bridge::Direction;
    ///
    /// assert_eq!(Direction::Forward.as_str(), "forward");
    /// assert_eq!(Direction::Unchanged.as_str(), "unchanged");
    /// ```
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Stop => "stop",
            Direction::Reverse => "reverse",
            Direction::Unchanged => "unchanged",
        }
    }

    /// Parse direction from text input (case-insensitive, trimmed).
    ///
    /// ```
    /// use rs_throttle_bridge::Direction;
    ///
    /// assert_eq!(Direction::from_text(" FWD "), Some(Direction::Forward));
    /// assert_eq!(Direction::from_text("rev"), Some(Direction::Reverse));
    /// assert_eq!(Direction::from_text("sideways"), None);
    /// ```
    pub fn from_text(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" | "fwd" => Some(Direction::Forward),
            "reverse" | "rev" => Some(Direction::Reverse),
            "stop" | "stopped" => Some(Direction::Stop),
            "unchanged" | "same" => Some(Direction::Unchanged),
            _ => None,
        }
    }

    /// Numeric code used by the throttle firmware's diagnostic output.
    pub const fn legacy_code(&self) -> u8 {
        match self {
            Direction::Forward => 0,
            Direction::Stop => 1,
            Direction::Reverse => 2,
            Direction::Unchanged => 3,
        }
    }

    /// Resolve the `Unchanged` sentinel against the current value.
    #[inline]
    pub fn resolve(self, current: Direction) -> Direction {
        match self {
            Direction::Unchanged => current,
            other => other,
        }
    }

    /// True for the direction that the wire protocols call "forward".
    ///
    /// `Stop` reports forward so a stopped locomotive keeps a sane wire value.
    #[inline]
    pub fn is_forward(&self) -> bool {
        !matches!(self, Direction::Reverse)
    }
}

/// DCC address length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressType {
    /// Short (one byte) address.
    Short,
    /// Long (two byte) address.
    Long,
}

impl AddressType {
    /// Infer the address type: 1..=127 short, everything else long.
    pub fn infer(address: u16) -> Self {
        if (1..=127).contains(&address) {
            AddressType::Short
        } else {
            AddressType::Long
        }
    }

    /// WiThrottle key prefix.
    pub const fn as_char(&self) -> char {
        match self {
            AddressType::Short => 'S',
            AddressType::Long => 'L',
        }
    }

    /// Parse a WiThrottle key prefix.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'S' | 's' => Some(AddressType::Short),
            'L' | 'l' => Some(AddressType::Long),
            _ => None,
        }
    }
}

/// Who is driving a locomotive or issuing an intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ControlPath {
    /// The local human interface.
    Local,
    /// A relay client, by slot.
    Relay(u8),
    /// An automation process, by process id.
    Automation(u8),
}

/// Track power.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PowerState {
    /// Power off.
    Off,
    /// Power on.
    On,
    /// Not yet reported.
    #[default]
    Unknown,
}

impl PowerState {
    /// WiThrottle `PPA` digit.
    pub const fn code(&self) -> char {
        match self {
            PowerState::Off => '0',
            PowerState::On => '1',
            PowerState::Unknown => '2',
        }
    }

    /// Parse a WiThrottle `PPA` digit.
    pub fn from_code(c: char) -> Option<Self> {
        match c {
            '0' => Some(PowerState::Off),
            '1' => Some(PowerState::On),
            '2' => Some(PowerState::Unknown),
            _ => None,
        }
    }
}

/// Sensor reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum SensorValue {
    /// Active / occupied.
    On,
    /// Inactive / clear.
    Off,
    /// Not yet reported.
    #[default]
    Unknown,
}

/// Turnout state with its WiThrottle numeric code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TurnoutState {
    /// 1
    #[default]
    Unknown,
    /// 2
    Closed,
    /// 4
    Thrown,
    /// 8
    Inconsistent,
}

impl TurnoutState {
    /// Numeric code.
    pub const fn code(&self) -> u8 {
        match self {
            TurnoutState::Unknown => 1,
            TurnoutState::Closed => 2,
            TurnoutState::Thrown => 4,
            TurnoutState::Inconsistent => 8,
        }
    }

    /// Decode a numeric code; anything unrecognised is `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            2 => TurnoutState::Closed,
            4 => TurnoutState::Thrown,
            8 => TurnoutState::Inconsistent,
            _ => TurnoutState::Unknown,
        }
    }
}

/// Route state with its WiThrottle numeric code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum RouteState {
    /// 1
    #[default]
    Unknown,
    /// 2
    Active,
    /// 4
    Inactive,
    /// 8
    Inconsistent,
}

impl RouteState {
    /// Numeric code.
    pub const fn code(&self) -> u8 {
        match self {
            RouteState::Unknown => 1,
            RouteState::Active => 2,
            RouteState::Inactive => 4,
            RouteState::Inconsistent => 8,
        }
    }

    /// Decode a numeric code; anything unrecognised is `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            2 => RouteState::Active,
            4 => RouteState::Inactive,
            8 => RouteState::Inconsistent,
            _ => RouteState::Unknown,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// A locomotive known to the bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Locomotive {
    /// DCC address.
    pub id: u16,
    /// Short or long address.
    pub address_type: AddressType,
    /// WiThrottle multi-throttle the locomotive is driven on.
    pub throttle_nr: u8,
    /// Current direction (never `Unchanged`).
    pub direction: Direction,
    /// Speed step, 0..=126, or [`ESTOP_SPEED`].
    pub speed: i16,
    /// Decoder speed-step mode (14, 27, 28 or 128).
    pub speed_steps: u8,
    /// Function state bitmap, bit n = Fn.
    pub functions: u32,
    /// Latching mask, bit n set = Fn latches.
    pub function_latch: u32,
    /// Control path currently driving it.
    pub owner: Option<ControlPath>,
    /// Control path waiting for a steal to be confirmed.
    pub pending_steal: Option<ControlPath>,
    /// Relay slot of the owner, when the owner is a relay client.
    pub relay_slot: Option<u8>,
    /// Roster name.
    pub name: Name,
    /// Function labels from the roster detail, index = function number.
    pub function_labels: Vec<String>,
}

impl Locomotive {
    /// A fresh, ownerless, stopped locomotive.
    pub fn new(id: u16) -> Self {
        Self {
            id,
            address_type: AddressType::infer(id),
            throttle_nr: 0,
            direction: Direction::Forward,
            speed: 0,
            speed_steps: 128,
            functions: 0,
            function_latch: DEFAULT_FUNCTION_LATCH,
            owner: None,
            pending_steal: None,
            relay_slot: None,
            name: Name::new(),
            function_labels: Vec::new(),
        }
    }

    /// Set the roster name.
    pub fn with_name(mut self, n: &str) -> Self {
        self.name = name(n);
        self
    }

    /// Set the address type explicitly.
    pub fn with_address_type(mut self, address_type: AddressType) -> Self {
        self.address_type = address_type;
        self
    }

    /// Set the latching mask.
    pub fn with_function_latch(mut self, mask: u32) -> Self {
        self.function_latch = mask;
        self
    }

    /// Apply roster function labels. A leading `*` marks the function momentary.
    ///
    /// ```
    /// use rs_throttle_bridge::Locomotive;
    ///
    /// let loco = Locomotive::new(3).with_function_labels("Light/Bell/*Horn");
    /// assert_eq!(loco.function_labels, ["Light", "Bell", "Horn"]);
    /// assert!(loco.is_latching(1));
    /// assert!(!loco.is_latching(2));
    /// ```
    pub fn with_function_labels(mut self, labels: &str) -> Self {
        if labels.is_empty() {
            return self;
        }
        let mut latch = 0u32;
        self.function_labels.clear();
        for (n, label) in labels.split('/').take(MAX_FUNCTIONS as usize).enumerate() {
            match label.strip_prefix('*') {
                Some(momentary) => self.function_labels.push(momentary.into()),
                None => {
                    latch |= 1 << n;
                    self.function_labels.push(label.into());
                }
            }
        }
        self.function_latch = latch;
        self
    }

    /// State of function `n`.
    #[inline]
    pub fn function(&self, n: u8) -> bool {
        n < MAX_FUNCTIONS && self.functions & (1 << n) != 0
    }

    /// Whether function `n` latches (toggles on press) rather than being momentary.
    #[inline]
    pub fn is_latching(&self, n: u8) -> bool {
        n < MAX_FUNCTIONS && self.function_latch & (1 << n) != 0
    }

    /// Whether any control path currently owns it.
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }

    /// WiThrottle key, e.g. `L1234` or `S3`.
    pub fn key(&self) -> String {
        alloc::format!("{}{}", self.address_type.as_char(), self.id)
    }
}

/// A turnout (point).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Turnout {
    /// System name (identity).
    pub sys_name: SysName,
    /// User name.
    pub user_name: Name,
    /// Last known state.
    pub state: TurnoutState,
}

impl Turnout {
    /// Turnout with unknown state and no user name.
    pub fn new(sys: &str) -> Self {
        Self {
            sys_name: sys_name(sys),
            user_name: Name::new(),
            state: TurnoutState::Unknown,
        }
    }

    /// Set the user name.
    pub fn with_user_name(mut self, n: &str) -> Self {
        self.user_name = name(n);
        self
    }

    /// Set the state.
    pub fn with_state(mut self, state: TurnoutState) -> Self {
        self.state = state;
        self
    }
}

/// One turnout movement inside a route.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RouteStep {
    /// Turnout system name.
    pub turnout: SysName,
    /// State the turnout must reach.
    pub desired: TurnoutState,
}

impl RouteStep {
    /// Build a step.
    pub fn new(turnout: &str, desired: TurnoutState) -> Self {
        Self {
            turnout: sys_name(turnout),
            desired,
        }
    }
}

/// A named sequence of turnout movements.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Route {
    /// System name (identity).
    pub sys_name: SysName,
    /// User name.
    pub user_name: Name,
    /// Last known state.
    pub state: RouteState,
    /// Locally known steps, empty when the route is executed server-side.
    pub steps: heapless::Vec<RouteStep, MAX_ROUTE_STEPS>,
    /// Bit n set while step n awaits confirmation.
    pub(crate) pending: u32,
}

impl Route {
    /// Route with unknown state and no steps.
    pub fn new(sys: &str) -> Self {
        Self {
            sys_name: sys_name(sys),
            user_name: Name::new(),
            state: RouteState::Unknown,
            steps: heapless::Vec::new(),
            pending: 0,
        }
    }

    /// Set the user name.
    pub fn with_user_name(mut self, n: &str) -> Self {
        self.user_name = name(n);
        self
    }

    /// Set the state.
    pub fn with_state(mut self, state: RouteState) -> Self {
        self.state = state;
        self
    }

    /// Append a step; fails once [`MAX_ROUTE_STEPS`] is reached.
    pub fn with_step(
        mut self,
        turnout: &str,
        desired: TurnoutState,
    ) -> Result<Self, crate::error::RegistryError> {
        self.steps
            .push(RouteStep::new(turnout, desired))
            .map_err(|_| crate::error::RegistryError::RouteTooLong(MAX_ROUTE_STEPS))?;
        Ok(self)
    }

    /// True while a local execution is waiting for confirmations.
    #[inline]
    pub fn in_flight(&self) -> bool {
        self.pending != 0
    }
}

/// A sensor reported by the command station.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sensor {
    /// Sensor id.
    pub id: u16,
    /// Last reading.
    pub value: SensorValue,
}

// ============================================================================
// Deltas
// ============================================================================

/// A registry change, carrying the record before and after.
///
/// `old == None` means the entity was created; `new == None` means it was
/// removed. The registries never emit a delta whose snapshots are equal.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Delta {
    /// Locomotive change.
    Locomotive {
        /// Before.
        old: Option<Locomotive>,
        /// After.
        new: Option<Locomotive>,
    },
    /// Turnout change.
    Turnout {
        /// Before.
        old: Option<Turnout>,
        /// After.
        new: Option<Turnout>,
    },
    /// Route change.
    Route {
        /// Before.
        old: Option<Route>,
        /// After.
        new: Option<Route>,
    },
    /// Sensor change.
    Sensor {
        /// Sensor id.
        id: u16,
        /// Before.
        old: Option<SensorValue>,
        /// After.
        new: Option<SensorValue>,
    },
    /// Track power change.
    Power {
        /// Before.
        old: PowerState,
        /// After.
        new: PowerState,
    },
}

impl Delta {
    /// Locomotive id if this is a locomotive delta.
    pub fn locomotive_id(&self) -> Option<u16> {
        match self {
            Delta::Locomotive { old, new } => new.as_ref().or(old.as_ref()).map(|l| l.id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_resolves_to_current() {
        assert_eq!(
            Direction::Unchanged.resolve(Direction::Reverse),
            Direction::Reverse
        );
        assert_eq!(
            Direction::Forward.resolve(Direction::Reverse),
            Direction::Forward
        );
    }

    #[test]
    fn legacy_codes() {
        assert_eq!(Direction::Forward.legacy_code(), 0);
        assert_eq!(Direction::Stop.legacy_code(), 1);
        assert_eq!(Direction::Reverse.legacy_code(), 2);
        assert_eq!(Direction::Unchanged.legacy_code(), 3);
    }

    #[test]
    fn address_type_inference() {
        assert_eq!(AddressType::infer(3), AddressType::Short);
        assert_eq!(AddressType::infer(127), AddressType::Short);
        assert_eq!(AddressType::infer(128), AddressType::Long);
        assert_eq!(AddressType::infer(0), AddressType::Long);
    }

    #[test]
    fn default_latch_mask() {
        let loco = Locomotive::new(1234);
        // 483 = 0b1_1110_0011
        for n in [0, 1, 5, 6, 7, 8] {
            assert!(loco.is_latching(n), "F{n} should latch");
        }
        for n in [2, 3, 4, 9, 29] {
            assert!(!loco.is_latching(n), "F{n} should be momentary");
        }
        assert!(!loco.is_latching(MAX_FUNCTIONS));
    }

    #[test]
    fn key_uses_address_type() {
        assert_eq!(Locomotive::new(3).key(), "S3");
        assert_eq!(Locomotive::new(1234).key(), "L1234");
    }

    #[test]
    fn state_codes_fall_back_to_unknown() {
        assert_eq!(TurnoutState::from_code(4), TurnoutState::Thrown);
        assert_eq!(TurnoutState::from_code(99), TurnoutState::Unknown);
        assert_eq!(RouteState::from_code(2), RouteState::Active);
        assert_eq!(RouteState::Inconsistent.code(), 8);
    }

    #[test]
    fn route_step_limit() {
        let mut route = Route::new("IR1");
        for i in 0..MAX_ROUTE_STEPS {
            route = route
                .with_step(&alloc::format!("LT{i}"), TurnoutState::Thrown)
                .unwrap();
        }
        assert!(route.with_step("LT99", TurnoutState::Closed).is_err());
    }

    #[test]
    fn names_truncate() {
        let long = "x".repeat(40);
        assert_eq!(name(&long).len(), NAME_LENGTH);
        assert_eq!(sys_name(&long).len(), SYS_NAME_LENGTH);
    }
}
