//! Error taxonomy for the bridge core.
//!
//! Every subsystem owns a small `thiserror` enum. Recoverable conditions that
//! are part of normal operation (a pending steal, a consist at capacity) are
//! returned as values; only genuine failures become errors. [`Error`]
//! aggregates them for callers that do not care which layer failed.

use alloc::string::String;

use crate::entities::ControlPath;

/// Failure to decode a single protocol frame.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The line was empty after trimming.
    #[error("empty frame")]
    Empty,
    /// A DCC-Ex frame without its closing `>`.
    #[error("unterminated frame")]
    Unterminated,
    /// A double-quoted argument was never closed.
    #[error("unterminated quoted string")]
    UnterminatedQuote,
    /// A numeric field did not parse.
    #[error("invalid number `{0}`")]
    InvalidNumber(String),
    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// A field is present but holds an unexpected value.
    #[error("invalid {field}: `{value}`")]
    InvalidField {
        /// Name of the field.
        field: &'static str,
        /// Offending text.
        value: String,
    },
}

/// Upstream protocol failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A frame failed to decode.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    /// No recognisable frame arrived inside the identification window.
    #[error("no protocol identified within {window_ms} ms")]
    Timeout {
        /// Length of the identification window.
        window_ms: u64,
    },
    /// The peer stopped answering keepalive probes.
    #[error("keepalive not answered for {silent_ms} ms")]
    KeepaliveTimeout {
        /// Time since the last frame was received.
        silent_ms: u64,
    },
    /// Too many consecutive malformed frames.
    #[error("{count} consecutive malformed frames")]
    TooManyParseErrors {
        /// Number of consecutive failures.
        count: u8,
    },
}

/// Registry contract violations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The locomotive is held by another control path.
    #[error("locomotive {id} already owned by {owner:?}")]
    AlreadyOwned {
        /// Locomotive address.
        id: u16,
        /// Current owner.
        owner: ControlPath,
    },
    /// The caller does not own the locomotive.
    #[error("locomotive {id} is not owned by {path:?}")]
    NotOwner {
        /// Locomotive address.
        id: u16,
        /// Path that attempted the operation.
        path: ControlPath,
    },
    /// No entity with that identity exists.
    #[error("no such entity: {0}")]
    NotFound(String),
    /// `confirm_steal` called with no steal outstanding.
    #[error("no pending steal for locomotive {0}")]
    NoPendingSteal(u16),
    /// The control path already owns the maximum number of locomotives.
    #[error("{path:?} already controls {limit} locomotives")]
    ConsistFull {
        /// Path that hit the limit.
        path: ControlPath,
        /// Configured consist limit.
        limit: usize,
    },
    /// A route definition exceeds the step limit.
    #[error("route exceeds {0} steps")]
    RouteTooLong(usize),
}

/// Relay multiplexer failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Every relay slot is occupied.
    #[error("all {0} relay slots in use")]
    Full(usize),
    /// The slot is not connected.
    #[error("relay slot {0} is not connected")]
    NoSuchSlot(u8),
    /// A client frame failed to decode; the slot has been deactivated.
    #[error("relay slot {slot}: {source}")]
    Protocol {
        /// Slot that sent the frame.
        slot: u8,
        /// Decode failure.
        source: ParseError,
    },
}

/// Automation engine failures. All of them are local to one process.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AutomationError {
    /// A `goto` names a label the script does not define.
    #[error("line {line}: unresolved label `{label}`")]
    UnresolvedLabel {
        /// Label text.
        label: String,
        /// Source line number.
        line: u16,
    },
    /// The call/loop stack is exhausted.
    #[error("stack overflow at depth {0}")]
    StackOverflow(usize),
    /// The first word of a line is not a known token.
    #[error("line {line}: unknown token `{token}`")]
    UnknownToken {
        /// Offending word.
        token: String,
        /// Source line number.
        line: u16,
    },
    /// A token received the wrong number or kind of arguments.
    #[error("line {line}: bad argument for `{token}`")]
    BadArgument {
        /// Token name.
        token: &'static str,
        /// Source line number.
        line: u16,
    },
    /// The script source has no script by that name.
    #[error("script `{0}` not found")]
    ScriptNotFound(String),
    /// Every process slot is busy.
    #[error("process table full")]
    TableFull,
    /// No live process has that id.
    #[error("no such process {0}")]
    NoSuchProcess(u8),
}

/// Session manager refusals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No upstream dialect is known yet.
    #[error("session not ready")]
    NotReady,
    /// The session gave up reconnecting.
    #[error("session closed")]
    Closed,
}

/// NVS diagnostic dump failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NvsError {
    /// A stored CRC does not match the computed one.
    #[error("crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        /// CRC read from flash.
        stored: u32,
        /// CRC computed over the bytes.
        computed: u32,
    },
    /// The image ends part-way through a page or entry.
    #[error("image truncated at offset {0}")]
    Truncated(usize),
    /// A page header holds an impossible state.
    #[error("page {index}: invalid state {state:#010x}")]
    BadPage {
        /// Page index within the image.
        index: usize,
        /// Raw state word.
        state: u32,
    },
}

/// Any bridge error.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// See [`ProtocolError`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// See [`RegistryError`].
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// See [`RelayError`].
    #[error(transparent)]
    Relay(#[from] RelayError),
    /// See [`AutomationError`].
    #[error(transparent)]
    Automation(#[from] AutomationError),
    /// See [`SessionError`].
    #[error(transparent)]
    Session(#[from] SessionError),
    /// See [`NvsError`].
    #[error(transparent)]
    Nvs(#[from] NvsError),
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::Protocol(ProtocolError::Parse(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn parse_error_converts_through_protocol() {
        let err: Error = ParseError::Empty.into();
        assert_eq!(err, Error::Protocol(ProtocolError::Parse(ParseError::Empty)));
    }

    #[test]
    fn messages_name_the_entity() {
        let err = RegistryError::AlreadyOwned {
            id: 3,
            owner: ControlPath::Relay(1),
        };
        assert_eq!(err.to_string(), "locomotive 3 already owned by Relay(1)");

        let err = NvsError::CrcMismatch {
            stored: 1,
            computed: 2,
        };
        assert!(err.to_string().contains("0x00000001"));
    }
}
