//! # rs-throttle-bridge
//!
//! A model railway throttle bridge: one connection to a WiThrottle or
//! DCC-Ex command station, shared with local controls, downstream throttle
//! apps and scripted automation.
//!
//! ## Features
//!
//! - **Two dialects**: WiThrottle and DCC-Ex, detected from the first frames
//! - **Single owner per locomotive**: every change goes through one arbiter
//! - **Relay**: downstream clients see the layout in their own dialect
//! - **Automation**: small scripts with waits, loops and child processes
//! - **Diagnostics**: an ESP-IDF NVS partition dumper
//!
//! ## Architecture
//!
//! The crate is structured to run without a network or hardware:
//!
//! - `entities` / `registry` - Layout objects and their owner
//! - `commands` - Intents and outcomes
//! - `protocol` - Line codecs for both dialects
//! - `session` - The upstream session state machine
//! - `relay` - Downstream client multiplexer
//! - `automation` - Script parser and cooperative scheduler
//! - `bridge` - Everything above in one container
//! - `traits` / `hal` - I/O abstractions and mocks
//! - `services` (feature `net`) - tokio runtime
//!
//! ## Example
//!
//! ```rust
//! use rs_throttle_bridge::{BridgeCore, Config, ControlPath, Intent, Direction};
//!
//! let mut core = BridgeCore::new(Config::default());
//! core.on_connected(0);
//! for line in ["<iDCC-EX V-5.0.0>", "<jR>", "<jT>", "<jA>"] {
//!     core.on_upstream_line(line, 10).unwrap();
//! }
//! assert!(core.session().is_synchronized());
//!
//! core.submit(Intent::AcquireLoco { id: 3, address_type: None }, ControlPath::Local)
//!     .unwrap();
//! core.submit(Intent::SetDirection { id: 3, direction: Direction::Forward }, ControlPath::Local)
//!     .unwrap();
//! assert_eq!(core.registries().locomotive(3).unwrap().direction, Direction::Forward);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

extern crate alloc;

/// Layout entities: locomotives, turnouts, routes, sensors and deltas.
pub mod entities;
/// Entity registries and the ownership arbiter.
pub mod registry;
/// Intents submitted by control paths and their outcomes.
pub mod commands;
/// WiThrottle and DCC-Ex line codecs.
pub mod protocol;
/// Upstream session lifecycle and synchronization.
pub mod session;
/// Downstream relay client multiplexer.
pub mod relay;
/// Bounded network-to-core queue.
pub mod handoff;
/// Script automation engine.
pub mod automation;
/// The bridge core tying all components together.
pub mod bridge;
/// ESP-IDF NVS partition dump.
pub mod nvs;

/// Core traits for I/O abstraction.
pub mod traits;
/// Hardware abstraction layer with mock implementations for testing.
pub mod hal;

/// Shared configuration system.
pub mod config;
/// Error types.
pub mod error;

/// Threaded runtime (feature-gated).
#[cfg(feature = "net")]
pub mod services;

// Re-exports for convenience
pub use automation::{AutomationEngine, Script};
pub use bridge::BridgeCore;
pub use commands::{Intent, IntentKind, IntentOutcome, RejectReason, TurnoutAction};
pub use entities::{
    AddressType, ControlPath, Delta, Direction, Locomotive, PowerState, Route, RouteState, Sensor,
    SensorValue, Turnout, TurnoutState,
};
pub use error::{
    AutomationError, Error, NvsError, ParseError, ProtocolError, RegistryError, RelayError,
    SessionError,
};
pub use protocol::{Dialect, Message};
pub use registry::{Claim, ListOrder, Registries};
pub use relay::RelayMultiplexer;
pub use session::{SessionManager, SessionSignal, SessionState};
pub use traits::{Clock, DeltaSink, LineTransport, PinConfigurator, PinMode, ScriptSource};

// Config re-exports
pub use config::{AutomationConfig, Config, DeviceConfig, NetworkConfig, RelayConfig, ThrottleConfig};
