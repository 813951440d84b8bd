//! Registry change feed for displays and local I/O.
//!
//! This module defines the [`DeltaSink`] trait: whatever renders layout state
//! (an OLED, an LED panel, a log) receives every registry [`Delta`] the core
//! applied, in order.

use crate::entities::Delta;

/// Consumer of registry deltas.
///
/// # Example
///
/// ```rust
/// use rs_throttle_bridge::traits::DeltaSink;
/// use rs_throttle_bridge::entities::{Delta, PowerState};
/// use rs_throttle_bridge::hal::MockDeltaSink;
///
/// let mut sink = MockDeltaSink::new();
/// sink.publish(&Delta::Power { old: PowerState::Off, new: PowerState::On }).unwrap();
/// assert_eq!(sink.received().len(), 1);
/// ```
pub trait DeltaSink {
    /// Error type for sink operations.
    type Error;

    /// Handle one delta.
    fn publish(&mut self, delta: &Delta) -> Result<(), Self::Error>;

    /// Flush buffered output, if any.
    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
