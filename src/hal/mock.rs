//! Mock implementations for testing without hardware or sockets.
//!
//! This module provides test doubles for every trait in [`crate::traits`],
//! so the bridge core can be driven end to end on a desktop.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockClock`] | [`Clock`] | Controllable time source |
//! | [`MockPins`] | [`PinConfigurator`] | Records pin modes |
//! | [`MockScripts`] | [`ScriptSource`] | In-memory scripts |
//! | [`MockTransport`] | [`LineTransport`] | Queued inbound, captured outbound |
//! | [`MockDeltaSink`] | [`DeltaSink`] | Captures published deltas |
//!
//! # Example
//!
//! ```rust
//! use rs_throttle_bridge::bridge::BridgeCore;
//! use rs_throttle_bridge::config::Config;
//! use rs_throttle_bridge::hal::{MockPins, MockScripts};
//!
//! let mut core = BridgeCore::new(Config::default());
//! let scripts = MockScripts::new().with_script("blink", "configpin 2 high\ndelay 500\nconfigpin 2 low");
//! let mut pins = MockPins::new();
//!
//! core.spawn_script("blink", 0, &scripts, &mut pins, false).unwrap();
//! core.tick(0, &scripts, &mut pins);
//! assert_eq!(pins.history(), [(2, rs_throttle_bridge::traits::PinMode::High)]);
//! ```
//!
//! [`Clock`]: crate::traits::Clock
//! [`PinConfigurator`]: crate::traits::PinConfigurator
//! [`ScriptSource`]: crate::traits::ScriptSource
//! [`LineTransport`]: crate::traits::LineTransport
//! [`DeltaSink`]: crate::traits::DeltaSink

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;

use crate::entities::Delta;
use crate::traits::{Clock, DeltaSink, LineTransport, PinConfigurator, PinMode, ScriptSource};

// ============================================================================
// Hardware Mocks
// ============================================================================

/// Mock clock for testing time-dependent behavior.
///
/// ```rust
/// use rs_throttle_bridge::hal::MockClock;
/// use rs_throttle_bridge::traits::Clock;
///
/// let mut clock = MockClock::new();
/// clock.set(1000);
/// clock.advance(500);
/// assert_eq!(clock.now_ms(), 1500);
/// ```
#[derive(Debug, Default)]
pub struct MockClock {
    current_ms: u64,
}

impl MockClock {
    /// Creates a new mock clock starting at 0ms.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current time in milliseconds.
    pub fn set(&mut self, ms: u64) {
        self.current_ms = ms;
    }

    /// Advances the clock by the given duration.
    pub fn advance(&mut self, ms: u64) {
        self.current_ms += ms;
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.current_ms
    }
}

/// Mock hardware lines.
///
/// Records every `configure` call; pins listed with
/// [`with_reserved`](Self::with_reserved) refuse configuration.
#[derive(Debug, Default)]
pub struct MockPins {
    modes: BTreeMap<u8, PinMode>,
    history: Vec<(u8, PinMode)>,
    reserved: Vec<u8>,
}

impl MockPins {
    /// Creates a mock with every pin available.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse configuration of `pin`.
    pub fn with_reserved(mut self, pin: u8) -> Self {
        self.reserved.push(pin);
        self
    }

    /// Current mode of `pin`.
    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        self.modes.get(&pin).copied()
    }

    /// Every accepted call, in order.
    pub fn history(&self) -> &[(u8, PinMode)] {
        &self.history
    }
}

impl PinConfigurator for MockPins {
    type Error = u8;

    fn configure(&mut self, pin: u8, mode: PinMode) -> Result<(), u8> {
        if self.reserved.contains(&pin) {
            return Err(pin);
        }
        self.modes.insert(pin, mode);
        self.history.push((pin, mode));
        Ok(())
    }
}

// ============================================================================
// Storage Mocks
// ============================================================================

/// In-memory script store.
#[derive(Debug, Default, Clone)]
pub struct MockScripts {
    scripts: BTreeMap<String, String>,
}

impl MockScripts {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a script.
    pub fn with_script(mut self, name: &str, text: &str) -> Self {
        self.insert(name, text);
        self
    }

    /// Add or replace a script.
    pub fn insert(&mut self, name: &str, text: &str) {
        self.scripts.insert(name.into(), text.into());
    }
}

impl ScriptSource for MockScripts {
    fn read_script(&self, name: &str) -> Option<String> {
        self.scripts.get(name).cloned()
    }
}

// ============================================================================
// Network Mocks
// ============================================================================

/// Mock line transport.
///
/// Lines queued with [`inject`](Self::inject) come back from
/// `try_recv_line`; sent lines are captured in order.
#[derive(Debug)]
pub struct MockTransport {
    incoming: VecDeque<String>,
    sent: Vec<String>,
    /// Whether the peer is connected; sending fails when false.
    pub connected: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a connected transport with nothing queued.
    pub fn new() -> Self {
        Self {
            incoming: VecDeque::new(),
            sent: Vec::new(),
            connected: true,
        }
    }

    /// Queue a line as if received from the peer.
    pub fn inject(&mut self, line: &str) {
        self.incoming.push_back(line.into());
    }

    /// Lines sent so far.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    /// Take the lines sent so far.
    pub fn take_sent(&mut self) -> Vec<String> {
        core::mem::take(&mut self.sent)
    }
}

impl LineTransport for MockTransport {
    type Error = ();

    fn send_line(&mut self, line: &str) -> Result<(), ()> {
        if !self.connected {
            return Err(());
        }
        self.sent.push(line.into());
        Ok(())
    }

    fn try_recv_line(&mut self) -> Option<String> {
        self.incoming.pop_front()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Display Mocks
// ============================================================================

/// Mock delta sink.
#[derive(Debug, Default)]
pub struct MockDeltaSink {
    received: Vec<Delta>,
    flushes: usize,
    fail: bool,
}

impl MockDeltaSink {
    /// Creates a sink that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Deltas accepted so far.
    pub fn received(&self) -> &[Delta] {
        &self.received
    }

    /// Number of flushes.
    pub fn flush_count(&self) -> usize {
        self.flushes
    }
}

impl DeltaSink for MockDeltaSink {
    type Error = ();

    fn publish(&mut self, delta: &Delta) -> Result<(), ()> {
        if self.fail {
            return Err(());
        }
        self.received.push(delta.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ()> {
        self.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_pin_is_refused() {
        let mut pins = MockPins::new().with_reserved(0);
        assert_eq!(pins.configure(0, PinMode::Output), Err(0));
        assert!(pins.configure(1, PinMode::Input).is_ok());
        assert_eq!(pins.history(), [(1, PinMode::Input)]);
    }

    #[test]
    fn disconnected_transport_refuses_send() {
        let mut link = MockTransport::new();
        link.connected = false;
        assert!(link.send_line("*").is_err());
        assert!(link.sent().is_empty());
    }
}
