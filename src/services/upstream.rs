//! Upstream link runner.
//!
//! Moves lines between any [`LineTransport`] and the shared core and turns
//! session signals into transport actions. It is synchronous; the async
//! runtime only decides when to call it and how to reconnect.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_throttle_bridge::bridge::BridgeCore;
//! use rs_throttle_bridge::config::Config;
//! use rs_throttle_bridge::hal::MockTransport;
//! use rs_throttle_bridge::services::{SharedBridge, UpstreamRunner};
//!
//! let shared = Arc::new(SharedBridge::new(BridgeCore::new(Config::default())));
//! let mut runner = UpstreamRunner::new(Arc::clone(&shared));
//!
//! let mut link = MockTransport::new();
//! link.inject("VN2.0");
//! link.inject("RL0");
//! link.inject("PPA1");
//! runner.attach(link);
//! runner.poll();
//!
//! assert!(shared.with_core(|core| core.session().is_synchronized()));
//! ```

use std::sync::Arc;

use log::{debug, info, warn};

use crate::session::SessionSignal;
use crate::traits::LineTransport;

use super::SharedBridge;

// ============================================================================
// Upstream Runner
// ============================================================================

/// Pumps one upstream connection.
pub struct UpstreamRunner<T: LineTransport> {
    shared: Arc<SharedBridge>,
    transport: Option<T>,
}

impl<T: LineTransport> UpstreamRunner<T> {
    /// Create a runner with no connection.
    pub fn new(shared: Arc<SharedBridge>) -> Self {
        Self {
            shared,
            transport: None,
        }
    }

    /// The current connection, if any.
    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// Mutable access to the current connection.
    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.transport.as_mut()
    }

    /// Whether a connection is attached.
    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    /// Take over a freshly opened connection and start identification.
    pub fn attach(&mut self, transport: T) {
        let now = self.shared.now_ms();
        self.shared.with_core(|core| core.on_connected(now));
        self.transport = Some(transport);
        self.flush();
    }

    /// Drop the connection and report the loss to the session.
    pub fn detach(&mut self) {
        if self.transport.take().is_some() {
            let now = self.shared.now_ms();
            self.shared.with_core(|core| core.on_disconnected(now));
        }
    }

    /// Report a failed connection attempt.
    pub fn connect_failed(&mut self) {
        self.transport = None;
        let now = self.shared.now_ms();
        self.shared.with_core(|core| core.on_disconnected(now));
    }

    /// Receive pending lines, drive session timers, then send queued lines.
    ///
    /// Returns the session signal of this step, if any. On
    /// [`SessionSignal::Disconnect`] and [`SessionSignal::GaveUp`] the
    /// connection has already been dropped; on
    /// [`SessionSignal::Reconnect`] the caller should open a new one and
    /// [`attach`](Self::attach) it (or call
    /// [`connect_failed`](Self::connect_failed)).
    pub fn poll(&mut self) -> Option<SessionSignal> {
        self.receive();

        let now = self.shared.now_ms();
        let signal = self.shared.with_core(|core| core.poll_session(now));
        match &signal {
            Some(SessionSignal::Disconnect(err)) => {
                info!("[upstream] dropping connection: {}", err);
                self.transport = None;
            }
            Some(SessionSignal::GaveUp) => {
                self.transport = None;
            }
            Some(SessionSignal::Reconnect { attempt }) => {
                debug!("[upstream] reconnect requested (attempt {})", attempt);
            }
            None => {}
        }

        self.flush();
        signal
    }

    fn receive(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        while let Some(line) = transport.try_recv_line() {
            let now = self.shared.now_ms();
            if let Err(err) = self.shared.with_core(|core| core.on_upstream_line(&line, now)) {
                debug!("[upstream] {}: {:?}", err, line);
            }
        }
        if !transport.is_connected() {
            warn!("[upstream] connection lost");
            self.detach();
        }
    }

    fn flush(&mut self) {
        let lines = self.shared.with_core(|core| core.drain_upstream());
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        for line in lines {
            if let Err(err) = transport.send_line(&line) {
                warn!("[upstream] send failed: {:?}", err);
                self.detach();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeCore;
    use crate::config::{Config, NetworkConfig};
    use crate::hal::MockTransport;
    use crate::session::SessionState;

    fn runner(network: NetworkConfig) -> (Arc<SharedBridge>, UpstreamRunner<MockTransport>) {
        let shared = Arc::new(SharedBridge::new(BridgeCore::new(
            Config::default().with_network(network),
        )));
        let runner = UpstreamRunner::new(Arc::clone(&shared));
        (shared, runner)
    }

    #[test]
    fn attach_sends_identify_probe() {
        let (_, mut runner) = runner(NetworkConfig::default());
        runner.attach(MockTransport::new());
        let sent = runner.transport().unwrap().sent();
        assert_eq!(sent.first().map(String::as_str), Some("<s>"));
    }

    #[test]
    fn withrottle_handshake_is_answered() {
        let (shared, mut runner) = runner(NetworkConfig::default().with_identify_probe(false));
        let mut link = MockTransport::new();
        link.inject("VN2.0");
        runner.attach(link);
        runner.poll();
        assert_eq!(shared.session_state(), SessionState::Identifying);
        assert!(runner
            .transport()
            .unwrap()
            .sent()
            .iter()
            .any(|l| l.starts_with('N')));
    }

    #[test]
    fn lost_connection_degrades_session() {
        let (shared, mut runner) = runner(NetworkConfig::default());
        runner.attach(MockTransport::new());
        runner.transport_mut().unwrap().connected = false;
        runner.poll();
        assert!(!runner.is_attached());
        assert_eq!(shared.session_state(), SessionState::Degraded);
    }

    #[test]
    fn failed_connect_counts_toward_giving_up() {
        let (shared, mut runner) = runner(
            NetworkConfig::default()
                .with_max_retries(0)
                .with_backoff_ms(0, 0),
        );
        runner.connect_failed();
        assert_eq!(runner.poll(), Some(SessionSignal::GaveUp));
        assert_eq!(shared.session_state(), SessionState::Closed);
    }
}
