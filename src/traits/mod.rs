//! Trait definitions for hardware, transport, storage and display seams.
//!
//! These abstractions let the bridge core run unchanged on the device, on a
//! desktop, and under test:
//!
//! - `hardware`: clock and hardware lines
//! - `network`: line-oriented transport
//! - `storage`: named script resources
//! - `display`: registry change feed
//!
//! Mock implementations of every trait live in [`crate::hal::mock`].

pub mod display;
pub mod hardware;
pub mod network;
pub mod storage;

pub use display::*;
pub use hardware::*;
pub use network::*;
pub use storage::*;
