//! Threaded runtime for the bridge (feature `net`).
//!
//! All services share a single [`BridgeCore`](crate::bridge::BridgeCore)
//! through [`SharedBridge`]:
//!
//! ```ignore
//! use std::sync::Arc;
//! use rs_throttle_bridge::services::*;
//!
//! let shared = Arc::new(SharedBridge::new(core));
//!
//! tokio::spawn(run_upstream(Arc::clone(&shared)));
//! tokio::spawn(run_relay(Arc::clone(&shared), listener));
//! run_ticker(shared, DirScripts::new("scripts"), LoggedPins, LogSink::default()).await;
//! ```

pub mod host;
pub mod runtime;
pub mod shared;
pub mod upstream;

pub use host::*;
pub use runtime::*;
pub use shared::*;
pub use upstream::*;
