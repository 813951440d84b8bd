//! Hardware Abstraction Layer implementations.
//!
//! This module contains concrete implementations of the traits
//! defined in [`crate::traits`].
//!
//! # Available Implementations
//!
//! - `mock`: Test implementations for desktop development
//! - `tcp` (feature `net`): tokio line transport for the upstream link

pub mod mock;

#[cfg(feature = "net")]
pub mod tcp;

pub use mock::*;

#[cfg(feature = "net")]
pub use tcp::*;
