//! Intent types: the single operation set every control path speaks.
//!
//! Human input, relay clients and automation processes all express what they
//! want as an [`Intent`] tagged with the [`ControlPath`] that issued it. The
//! session manager resolves ownership, applies the intent to the registries
//! and encodes it for the command station, answering with an
//! [`IntentOutcome`].
//!
//! # Outcomes
//!
//! - [`IntentOutcome::Applied`]: accepted; carries the registry deltas
//! - [`IntentOutcome::PendingConfirmation`]: a steal is parked until confirmed
//! - [`IntentOutcome::Rejected`]: refused for a [`RejectReason`]
//!
//! Emergency stops bypass ownership: any path may stop any locomotive.
//!
//! ```rust
//! use rs_throttle_bridge::{Intent, IntentKind, Direction};
//!
//! let intent = Intent::SetDirection { id: 3, direction: Direction::Reverse };
//! assert_eq!(intent.kind(), IntentKind::SetDirection);
//! assert!(intent.needs_ownership());
//! assert!(!Intent::EmergencyStop { id: Some(3) }.needs_ownership());
//! ```
//!
//! [`ControlPath`]: crate::entities::ControlPath

use alloc::string::String;
use alloc::vec::Vec;

use crate::entities::{AddressType, ControlPath, Delta, Direction, PowerState, SysName};
use crate::protocol::PowerDistrict;

/// Requested turnout movement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TurnoutAction {
    /// Set thrown.
    Throw,
    /// Set closed.
    Close,
    /// Flip the last known state (unknown flips to thrown).
    Toggle,
}

/// Category of an intent, for logging and filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum IntentKind {
    /// Pass-through protocol line.
    Raw,
    /// Acquire/release/steal.
    Ownership,
    /// Function change.
    SetFunction,
    /// Direction change.
    SetDirection,
    /// Speed change.
    SetSpeed,
    /// Turnout or route.
    Accessory,
    /// Track power.
    Power,
    /// Emergency stop.
    EmergencyStop,
}

/// Something a control path wants done.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "intent", rename_all = "snake_case"))]
pub enum Intent {
    /// Take control of a locomotive.
    AcquireLoco {
        /// DCC address.
        id: u16,
        /// Address type if known; inferred otherwise.
        address_type: Option<AddressType>,
    },
    /// Give up control of a locomotive.
    ReleaseLoco {
        /// DCC address.
        id: u16,
    },
    /// Ask to take a locomotive another path controls.
    StealLoco {
        /// DCC address.
        id: u16,
    },
    /// Confirm a pending steal.
    ConfirmSteal {
        /// DCC address.
        id: u16,
    },
    /// Set speed (0..=126).
    SetSpeed {
        /// DCC address.
        id: u16,
        /// Speed step.
        speed: i16,
    },
    /// Set direction.
    SetDirection {
        /// DCC address.
        id: u16,
        /// New direction; `Unchanged` is a no-op.
        direction: Direction,
    },
    /// Set a function to a definite state.
    SetFunction {
        /// DCC address.
        id: u16,
        /// Function number.
        function: u8,
        /// Desired state.
        on: bool,
    },
    /// Emergency stop one locomotive, or all of them.
    EmergencyStop {
        /// DCC address, `None` for all.
        id: Option<u16>,
    },
    /// Move a turnout.
    SetTurnout {
        /// System name.
        sys_name: SysName,
        /// Movement.
        action: TurnoutAction,
    },
    /// Execute a route.
    RunRoute {
        /// System name.
        sys_name: SysName,
    },
    /// Switch track power.
    SetPower {
        /// On or off.
        state: PowerState,
        /// DCC-Ex district, all when `None`.
        district: Option<PowerDistrict>,
    },
    /// Send a protocol line verbatim.
    Raw(String),
}

impl Intent {
    /// Category of this intent.
    pub fn kind(&self) -> IntentKind {
        match self {
            Intent::AcquireLoco { .. }
            | Intent::ReleaseLoco { .. }
            | Intent::StealLoco { .. }
            | Intent::ConfirmSteal { .. } => IntentKind::Ownership,
            Intent::SetSpeed { .. } => IntentKind::SetSpeed,
            Intent::SetDirection { .. } => IntentKind::SetDirection,
            Intent::SetFunction { .. } => IntentKind::SetFunction,
            Intent::EmergencyStop { .. } => IntentKind::EmergencyStop,
            Intent::SetTurnout { .. } | Intent::RunRoute { .. } => IntentKind::Accessory,
            Intent::SetPower { .. } => IntentKind::Power,
            Intent::Raw(_) => IntentKind::Raw,
        }
    }

    /// Locomotive this intent drives, if any.
    pub fn loco_id(&self) -> Option<u16> {
        match self {
            Intent::AcquireLoco { id, .. }
            | Intent::ReleaseLoco { id }
            | Intent::StealLoco { id }
            | Intent::ConfirmSteal { id }
            | Intent::SetSpeed { id, .. }
            | Intent::SetDirection { id, .. }
            | Intent::SetFunction { id, .. } => Some(*id),
            Intent::EmergencyStop { id } => *id,
            _ => None,
        }
    }

    /// Whether the issuing path must own the locomotive first.
    ///
    /// Speed, direction and function changes implicitly acquire an unowned
    /// locomotive; they are refused only when another path owns it.
    pub fn needs_ownership(&self) -> bool {
        matches!(
            self,
            Intent::SetSpeed { .. } | Intent::SetDirection { .. } | Intent::SetFunction { .. }
        )
    }

    /// Shorthand for a turnout intent.
    pub fn turnout(sys_name: &str, action: TurnoutAction) -> Self {
        Intent::SetTurnout {
            sys_name: crate::entities::sys_name(sys_name),
            action,
        }
    }

    /// Shorthand for a route intent.
    pub fn route(sys_name: &str) -> Self {
        Intent::RunRoute {
            sys_name: crate::entities::sys_name(sys_name),
        }
    }
}

/// Why an intent was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RejectReason {
    /// Another path owns the locomotive.
    AlreadyOwned {
        /// Current owner.
        owner: ControlPath,
    },
    /// The path does not own what it tried to release.
    NotOwner,
    /// The path is at its consist limit.
    ConsistFull,
    /// No such turnout/route, or an id the upstream dialect cannot address.
    UnknownEntity,
    /// No steal is pending for this path.
    NoPendingSteal,
    /// A value outside the protocol's range.
    OutOfRange,
}

/// Result of submitting an intent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntentOutcome {
    /// Accepted and sent upstream.
    Applied {
        /// Registry changes, already applied.
        deltas: Vec<Delta>,
    },
    /// Parked until the steal is confirmed.
    PendingConfirmation,
    /// Refused.
    Rejected(RejectReason),
}

impl IntentOutcome {
    /// Applied with the given deltas.
    pub fn applied(deltas: Vec<Delta>) -> Self {
        IntentOutcome::Applied { deltas }
    }

    /// Whether the intent went through.
    pub fn is_applied(&self) -> bool {
        matches!(self, IntentOutcome::Applied { .. })
    }

    /// Deltas of an applied intent (empty otherwise).
    pub fn deltas(&self) -> &[Delta] {
        match self {
            IntentOutcome::Applied { deltas } => deltas,
            _ => &[],
        }
    }

    /// Consume into the applied deltas (empty otherwise).
    pub fn into_deltas(self) -> Vec<Delta> {
        match self {
            IntentOutcome::Applied { deltas } => deltas,
            _ => Vec::new(),
        }
    }
}

/// An intent stamped with its origin and time, for queues and logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedIntent {
    /// The intent.
    pub intent: Intent,
    /// Who issued it.
    pub path: ControlPath,
    /// When it was issued (milliseconds since start).
    pub timestamp_ms: u64,
}

impl TaggedIntent {
    /// Stamp an intent.
    pub fn new(intent: Intent, path: ControlPath, timestamp_ms: u64) -> Self {
        Self {
            intent,
            path,
            timestamp_ms,
        }
    }
}
