//! Hardware abstraction traits: time source and I/O lines.
//!
//! # Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`Clock`] | Time source for `no_std` environments |
//! | [`PinConfigurator`] | Hardware line setup for the `configpin` script token |
//!
//! For testing and desktop development, use the mock implementations
//! from [`crate::hal::mock`].
//!
//! # Example
//!
//! ```rust
//! use rs_throttle_bridge::traits::{PinConfigurator, PinMode};
//! use rs_throttle_bridge::hal::MockPins;
//!
//! let mut pins = MockPins::new();
//! pins.configure(4, PinMode::PullUp).unwrap();
//! assert_eq!(pins.mode(4), Some(PinMode::PullUp));
//! ```

/// How a hardware line is configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PinMode {
    /// Floating input.
    Input,
    /// Input with pull-up.
    PullUp,
    /// Input with pull-down.
    PullDown,
    /// Output, level untouched.
    Output,
    /// Output driven high.
    High,
    /// Output driven low.
    Low,
}

impl PinMode {
    /// Returns the mode as its script keyword.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_throttle_bridge::traits::PinMode;
    ///
    /// assert_eq!(PinMode::PullUp.as_str(), "pullup");
    /// ```
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PinMode::Input => "input",
            PinMode::PullUp => "pullup",
            PinMode::PullDown => "pulldown",
            PinMode::Output => "output",
            PinMode::High => "high",
            PinMode::Low => "low",
        }
    }

    /// Parses a mode keyword (case-insensitive).
    pub fn from_text(s: &str) -> Option<Self> {
        let s = s.trim();
        [
            PinMode::Input,
            PinMode::PullUp,
            PinMode::PullDown,
            PinMode::Output,
            PinMode::High,
            PinMode::Low,
        ]
        .into_iter()
        .find(|mode| mode.as_str().eq_ignore_ascii_case(s))
    }

    /// Whether the line drives a level.
    pub const fn is_output(&self) -> bool {
        matches!(self, PinMode::Output | PinMode::High | PinMode::Low)
    }
}

/// Hardware line configuration.
///
/// Called from the automation engine when a script runs `configpin`.
/// Implementations should be quick: the call happens inside a scheduler tick.
pub trait PinConfigurator {
    /// Error type for pin operations.
    type Error: core::fmt::Debug;

    /// Configure `pin` for `mode`.
    fn configure(&mut self, pin: u8, mode: PinMode) -> Result<(), Self::Error>;
}

/// Monotonic time source.
///
/// # Example
///
/// ```rust
/// use rs_throttle_bridge::traits::Clock;
/// use rs_throttle_bridge::hal::MockClock;
///
/// let mut clock = MockClock::new();
/// assert_eq!(clock.now_ms(), 0);
///
/// clock.advance(100);
/// assert_eq!(clock.now_ms(), 100);
/// ```
pub trait Clock {
    /// Returns current time in milliseconds since an arbitrary epoch.
    ///
    /// Must be monotonically increasing.
    fn now_ms(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_mode_keywords() {
        assert_eq!(PinMode::from_text("PULLDOWN"), Some(PinMode::PullDown));
        assert_eq!(PinMode::from_text(" high "), Some(PinMode::High));
        assert_eq!(PinMode::from_text("analog"), None);
    }

    #[test]
    fn pin_mode_outputs() {
        assert!(PinMode::Low.is_output());
        assert!(PinMode::Output.is_output());
        assert!(!PinMode::Input.is_output());
    }
}
