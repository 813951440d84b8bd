//! Line-oriented transport trait for the upstream server and relay clients.
//!
//! Both protocol dialects are newline-delimited text, so a transport only
//! moves whole lines. Framing, reconnect and buffering live below this
//! trait; everything above it works on `&str`.
//!
//! ```text
//! core  --send_line-->  transport  --TCP-->  command station
//! core  <--try_recv_line--  transport  <--TCP--
//! ```

use alloc::string::String;

// ============================================================================
// Line Transport (Sync-First Design)
// ============================================================================

/// Line transport for protocol traffic.
///
/// This trait uses a **sync-first design**: `send_line` queues or writes,
/// `try_recv_line` never blocks. Async runtimes wrap it with their own
/// reader/writer tasks.
///
/// # Example
///
/// ```rust
/// use rs_throttle_bridge::traits::LineTransport;
/// use rs_throttle_bridge::hal::MockTransport;
///
/// let mut link = MockTransport::new();
/// link.inject("VN2.0");
/// link.send_line("NmThrottle").unwrap();
///
/// assert_eq!(link.try_recv_line().as_deref(), Some("VN2.0"));
/// assert_eq!(link.sent(), ["NmThrottle"]);
/// ```
pub trait LineTransport {
    /// Error type for transport operations.
    type Error: core::fmt::Debug;

    /// Send one line; the transport appends the terminator.
    fn send_line(&mut self, line: &str) -> Result<(), Self::Error>;

    /// Take the next received line without its terminator (non-blocking).
    ///
    /// Returns `None` if no complete line is available.
    fn try_recv_line(&mut self) -> Option<String>;

    /// Check if the peer is connected.
    fn is_connected(&self) -> bool;
}
