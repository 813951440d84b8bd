//! The bridge core: registries, upstream session, relay and automation in
//! one exclusively owned container.
//!
//! Every component receives the registries by reference from here; nothing
//! holds them globally. Each method is a short, non-blocking step, so a
//! threaded runtime can wrap the whole core in one mutex (see
//! `services::SharedBridge`) and keep critical sections small.
//!
//! Changes flow outwards in one place: whenever a step produces registry
//! deltas, the core broadcasts them to relay clients (skipping the slot that
//! caused them), tells the command station about ownership released behind
//! its back, and queues them on the change feed for displays.
//!
//! ```rust
//! use rs_throttle_bridge::bridge::BridgeCore;
//! use rs_throttle_bridge::config::Config;
//! use rs_throttle_bridge::{ControlPath, Intent};
//!
//! let mut core = BridgeCore::new(Config::default());
//! core.on_connected(0);
//! core.on_upstream_line("VN2.0", 10).unwrap();
//! core.on_upstream_line("RL1]\\[Mogul}|{3}|{S", 11).unwrap();
//! core.on_upstream_line("PPA1", 12).unwrap();
//! assert!(core.session().is_synchronized());
//!
//! let outcome = core
//!     .submit(Intent::SetSpeed { id: 3, speed: 40 }, ControlPath::Local)
//!     .unwrap();
//! assert!(outcome.is_applied());
//! assert_eq!(core.registries().locomotive(3).unwrap().speed, 40);
//! ```

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::automation::{AutomationContext, AutomationEngine, Script};
use crate::commands::{Intent, IntentOutcome};
use crate::config::Config;
use crate::entities::{ControlPath, Delta, PowerState, Route, RouteState, SensorValue, TurnoutState};
use crate::error::{AutomationError, ProtocolError, RelayError, SessionError};
use crate::registry::{ListOrder, Registries};
use crate::relay::RelayMultiplexer;
use crate::session::{SessionManager, SessionSignal};
use crate::traits::{DeltaSink, PinConfigurator, PinMode, ScriptSource};

/// Registries plus every component that reads or mutates them.
pub struct BridgeCore {
    config: Config,
    registries: Registries,
    session: SessionManager,
    relay: RelayMultiplexer,
    automation: AutomationEngine,
    feed: VecDeque<Delta>,
}

/// Fan deltas out to relay clients and the change feed.
fn publish(relay: &mut RelayMultiplexer, feed: &mut VecDeque<Delta>, deltas: Vec<Delta>, origin: Option<u8>) {
    if deltas.is_empty() {
        return;
    }
    relay.broadcast(&deltas, origin);
    feed.extend(deltas);
}

/// Publish ownership released outside a session request.
fn publish_released(
    session: &mut SessionManager,
    relay: &mut RelayMultiplexer,
    feed: &mut VecDeque<Delta>,
    deltas: Vec<Delta>,
) {
    session.announce_releases(&deltas);
    publish(relay, feed, deltas, None);
}

impl BridgeCore {
    /// Build a core from configuration.
    pub fn new(config: Config) -> Self {
        let list_order = if config.throttle.sort_lists {
            ListOrder::ByName
        } else {
            ListOrder::Insertion
        };
        let mut registries = Registries::new()
            .with_function_latch(config.throttle.function_latch)
            .with_max_consist(config.throttle.max_consist);
        for route in &config.routes {
            registries.upsert_route(route.clone());
        }
        let session = SessionManager::new(config.network.clone(), config.device.clone());
        let relay = RelayMultiplexer::new(&config.relay, list_order).with_device_name(&config.device.name);
        let automation = AutomationEngine::new(&config.automation);
        Self {
            config,
            registries,
            session,
            relay,
            automation,
            feed: VecDeque::new(),
        }
    }

    /// Configuration the core was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Read access to the registries.
    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// The upstream session.
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// The relay multiplexer.
    pub fn relay(&self) -> &RelayMultiplexer {
        &self.relay
    }

    /// The automation engine.
    pub fn automation(&self) -> &AutomationEngine {
        &self.automation
    }

    /// Define a route whose steps this bridge drives itself.
    ///
    /// Steps survive later updates from the command station that carry
    /// only the route's name and state. The change is published like any
    /// other delta.
    pub fn define_route(&mut self, route: Route) -> Option<Delta> {
        let sys_name = route.sys_name.clone();
        let delta = self.registries.upsert_route(route)?;
        info!("[bridge] route {} defined", sys_name);
        publish(&mut self.relay, &mut self.feed, vec![delta.clone()], None);
        Some(delta)
    }

    // ========================================================================
    // Upstream
    // ========================================================================

    /// The upstream transport connected.
    pub fn on_connected(&mut self, now_ms: u64) {
        self.session.on_connected(now_ms);
    }

    /// The upstream transport dropped.
    pub fn on_disconnected(&mut self, now_ms: u64) {
        self.session.on_disconnected(now_ms);
    }

    /// Feed one line from the command station.
    ///
    /// # Errors
    ///
    /// The session's [`ProtocolError`]; a single malformed line is not fatal.
    pub fn on_upstream_line(&mut self, line: &str, now_ms: u64) -> Result<(), ProtocolError> {
        let deltas = self.session.on_receive(line, now_ms, &mut self.registries)?;
        publish(&mut self.relay, &mut self.feed, deltas, None);
        Ok(())
    }

    /// Drive session timers. A [`SessionSignal::GaveUp`] also drops every
    /// locomotive record.
    pub fn poll_session(&mut self, now_ms: u64) -> Option<SessionSignal> {
        let signal = self.session.poll(now_ms)?;
        if signal == SessionSignal::GaveUp {
            self.close_session();
        }
        Some(signal)
    }

    /// Close the upstream session for good.
    pub fn close_session(&mut self) {
        self.automation.stop_all();
        let deltas = self.session.close(&mut self.registries);
        publish(&mut self.relay, &mut self.feed, deltas, None);
    }

    /// Lines waiting for the command station.
    pub fn drain_upstream(&mut self) -> Vec<String> {
        self.session.drain_outbound()
    }

    // ========================================================================
    // Intents
    // ========================================================================

    /// Submit an intent on behalf of `path`.
    ///
    /// Relay clients and automation processes go through their own entry
    /// points; this is for local input.
    ///
    /// # Errors
    ///
    /// [`SessionError`] when there is no usable upstream session.
    pub fn submit(&mut self, intent: Intent, path: ControlPath) -> Result<IntentOutcome, SessionError> {
        let outcome = self.session.submit(intent, path, &mut self.registries)?;
        if let IntentOutcome::Applied { deltas } = &outcome {
            let origin = match path {
                ControlPath::Relay(slot) => Some(slot),
                _ => None,
            };
            publish(&mut self.relay, &mut self.feed, deltas.clone(), origin);
        }
        Ok(outcome)
    }

    // ========================================================================
    // Relay Clients
    // ========================================================================

    /// A downstream client connected.
    ///
    /// # Errors
    ///
    /// [`RelayError::Full`] when every slot is taken; existing clients are
    /// unaffected.
    pub fn accept_client(&mut self, remote: &str, now_ms: u64) -> Result<u8, RelayError> {
        self.relay.accept(remote, now_ms)
    }

    /// Feed one line from the client in `slot`.
    ///
    /// # Errors
    ///
    /// [`RelayError::Protocol`] when the line could not be decoded; the slot
    /// has then been deactivated and its locomotives released.
    pub fn on_client_line(&mut self, slot: u8, line: &str, now_ms: u64) -> Result<(), RelayError> {
        let result = self
            .relay
            .on_client_line(slot, line, now_ms, &mut self.session, &mut self.registries);
        let released = self.relay.drain_released();
        publish_released(&mut self.session, &mut self.relay, &mut self.feed, released);
        let deltas = result?;
        publish(&mut self.relay, &mut self.feed, deltas, Some(slot));
        Ok(())
    }

    /// The client in `slot` disconnected. Its ownership is released before
    /// this returns.
    pub fn teardown_client(&mut self, slot: u8) {
        let deltas = self.relay.teardown(slot, &mut self.registries);
        if !deltas.is_empty() {
            info!("[bridge] slot {} released {} locomotive(s)", slot, deltas.len());
        }
        publish_released(&mut self.session, &mut self.relay, &mut self.feed, deltas);
    }

    /// Lines waiting for the client in `slot`.
    pub fn drain_client(&mut self, slot: u8) -> Vec<String> {
        self.relay.drain_outbound(slot)
    }

    /// Whether the client in `slot` is still active.
    pub fn client_active(&self, slot: u8) -> bool {
        self.relay.connection(slot).is_some_and(|c| c.active)
    }

    // ========================================================================
    // Automation
    // ========================================================================

    /// Start a script.
    ///
    /// # Errors
    ///
    /// Load failures ([`AutomationError::ScriptNotFound`],
    /// [`AutomationError::UnresolvedLabel`], ...) or a full process table.
    pub fn spawn_script<S, P>(
        &mut self,
        name: &str,
        now_ms: u64,
        scripts: &S,
        pins: &mut P,
        tracing: bool,
    ) -> Result<u8, AutomationError>
    where
        S: ScriptSource,
        P: PinConfigurator,
    {
        let (automation, mut ctx) = self.split(scripts, pins);
        automation.spawn(name, now_ms, &mut ctx, tracing)
    }

    /// Stop a script and its foreground children.
    ///
    /// # Errors
    ///
    /// [`AutomationError::NoSuchProcess`] if `pid` is free.
    pub fn stop_script(&mut self, pid: u8) -> Result<(), AutomationError> {
        self.automation.stop(pid)
    }

    /// Deliver an input key to scripts waiting on `key`.
    pub fn inject_key(&mut self, key: char) -> usize {
        self.automation.inject_key(key)
    }

    /// One scheduler tick: relay keepalive, then automation.
    ///
    /// Returns the automation failures of this tick.
    pub fn tick<S, P>(&mut self, now_ms: u64, scripts: &S, pins: &mut P) -> Vec<(u8, AutomationError)>
    where
        S: ScriptSource,
        P: PinConfigurator,
    {
        let stale = self.relay.check_keepalive(now_ms, &mut self.registries);
        publish_released(&mut self.session, &mut self.relay, &mut self.feed, stale);

        let (automation, mut ctx) = self.split(scripts, pins);
        automation.tick(now_ms, &mut ctx)
    }

    fn split<'a, S: ScriptSource, P: PinConfigurator>(
        &'a mut self,
        scripts: &'a S,
        pins: &'a mut P,
    ) -> (&'a mut AutomationEngine, CoreContext<'a, S, P>) {
        (
            &mut self.automation,
            CoreContext {
                registries: &mut self.registries,
                session: &mut self.session,
                relay: &mut self.relay,
                feed: &mut self.feed,
                scripts,
                pins,
            },
        )
    }

    // ========================================================================
    // Change Feed
    // ========================================================================

    /// Take every delta applied since the last drain, oldest first.
    pub fn drain_deltas(&mut self) -> Vec<Delta> {
        self.feed.drain(..).collect()
    }

    /// Push pending deltas into `sink`.
    ///
    /// Deltas stay queued if the sink fails.
    ///
    /// # Errors
    ///
    /// The sink's error; deltas already accepted are not re-sent.
    pub fn publish_to<K: DeltaSink>(&mut self, sink: &mut K) -> Result<usize, K::Error> {
        let mut sent = 0;
        while let Some(delta) = self.feed.front() {
            sink.publish(delta)?;
            self.feed.pop_front();
            sent += 1;
        }
        sink.flush()?;
        Ok(sent)
    }
}

/// Disjoint borrows of the core handed to the automation engine.
struct CoreContext<'a, S, P> {
    registries: &'a mut Registries,
    session: &'a mut SessionManager,
    relay: &'a mut RelayMultiplexer,
    feed: &'a mut VecDeque<Delta>,
    scripts: &'a S,
    pins: &'a mut P,
}

impl<S: ScriptSource, P: PinConfigurator> AutomationContext for CoreContext<'_, S, P> {
    fn submit(&mut self, pid: u8, intent: Intent) -> Result<IntentOutcome, SessionError> {
        let outcome = self
            .session
            .submit(intent, ControlPath::Automation(pid), self.registries)?;
        if let IntentOutcome::Applied { deltas } = &outcome {
            publish(self.relay, self.feed, deltas.clone(), None);
        }
        Ok(outcome)
    }

    fn sensor(&self, id: u16) -> SensorValue {
        self.registries.sensor(id).map(|s| s.value).unwrap_or_default()
    }

    fn turnout_state(&self, sys_name: &str) -> TurnoutState {
        self.registries
            .turnout(sys_name)
            .map(|t| t.state)
            .unwrap_or_default()
    }

    fn route_state(&self, sys_name: &str) -> RouteState {
        self.registries
            .route(sys_name)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    fn power(&self) -> PowerState {
        self.registries.power()
    }

    fn configure_pin(&mut self, pin: u8, mode: PinMode) {
        match self.pins.configure(pin, mode) {
            Ok(()) => debug!("[bridge] pin {} -> {}", pin, mode.as_str()),
            Err(err) => warn!("[bridge] pin {} -> {} failed: {:?}", pin, mode.as_str(), err),
        }
    }

    fn load_script(&mut self, name: &str) -> Result<Script, AutomationError> {
        let text = self
            .scripts
            .read_script(name)
            .ok_or_else(|| AutomationError::ScriptNotFound(name.into()))?;
        Script::parse(name, &text)
    }

    fn on_process_exit(&mut self, pid: u8) {
        let deltas = self.registries.release_all(ControlPath::Automation(pid));
        publish_released(self.session, self.relay, self.feed, deltas);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Direction;
    use crate::hal::mock::{MockDeltaSink, MockPins, MockScripts};

    fn synchronized_core() -> BridgeCore {
        let mut core = BridgeCore::new(Config::default());
        core.on_connected(0);
        for line in ["VN2.0", "RL1]\\[Mogul}|{1234}|{L", "PTL]\\[LT1}|{Yard}|{2", "PPA1"] {
            core.on_upstream_line(line, 5).unwrap();
        }
        assert!(core.session().is_synchronized());
        core.drain_upstream();
        core.drain_deltas();
        core
    }

    #[test]
    fn relay_speed_is_broadcast_to_others_only() {
        let mut core = synchronized_core();
        let a = core.accept_client("10.0.0.2:4000", 10).unwrap();
        let b = core.accept_client("10.0.0.3:4000", 10).unwrap();
        core.on_client_line(a, "NCab A", 10).unwrap();
        core.on_client_line(b, "<s>", 10).unwrap();
        core.drain_client(a);
        core.drain_client(b);

        core.on_client_line(a, "M0+L1234<;>L1234", 20).unwrap();
        core.on_client_line(a, "M0AL1234<;>V64", 21).unwrap();
        let loco = core.registries().locomotive(1234).unwrap();
        assert_eq!(loco.owner, Some(ControlPath::Relay(a)));
        assert_eq!(loco.speed, 64);
        assert!(!core.drain_deltas().is_empty());
        assert_eq!(core.drain_upstream(), ["M1+L1234<;>L1234", "M1AL1234<;>V64"]);

        let to_b = core.drain_client(b);
        assert!(to_b.iter().any(|l| l.starts_with("<l 1234 ")));
        assert!(core.drain_client(a).iter().all(|l| !l.starts_with("<l")));
    }

    #[test]
    fn teardown_releases_and_announces() {
        let mut core = synchronized_core();
        let slot = core.accept_client("10.0.0.2:4000", 10).unwrap();
        core.on_client_line(slot, "NCab", 20).unwrap();
        core.on_client_line(slot, "M0+L1234<;>L1234", 20).unwrap();
        assert!(core.registries().locomotive(1234).unwrap().is_owned());
        core.drain_upstream();

        core.teardown_client(slot);
        assert!(!core.registries().locomotive(1234).unwrap().is_owned());
        assert!(core.drain_upstream().iter().any(|l| l.starts_with("M1-L1234<;>r")));
    }

    #[test]
    fn script_drives_turnout_and_releases_on_exit() {
        let mut core = synchronized_core();
        let scripts = MockScripts::new().with_script("yard", "throw LT1\nconfigpin 2 high\nexit");
        let mut pins = MockPins::new();
        let pid = core.spawn_script("yard", 30, &scripts, &mut pins, false).unwrap();
        assert!(core.tick(30, &scripts, &mut pins).is_empty());

        assert_eq!(pins.mode(2), Some(PinMode::High));
        assert!(core.drain_upstream().iter().any(|l| l == "PTATLT1"));
        assert_eq!(
            core.registries().turnout("LT1").unwrap().state,
            TurnoutState::Thrown
        );
        core.tick(50, &scripts, &mut pins);
        assert_eq!(
            core.automation().process(pid).unwrap().state(),
            crate::automation::ProcessState::Free
        );
    }

    #[test]
    fn script_waits_for_power() {
        let mut core = synchronized_core();
        let scripts = MockScripts::new().with_script("lights", "waitfor power off\nset $dark 1");
        let mut pins = MockPins::new();
        core.spawn_script("lights", 0, &scripts, &mut pins, false).unwrap();
        core.tick(20, &scripts, &mut pins);
        assert_eq!(core.automation().variable("dark"), 0);

        core.on_upstream_line("PPA0", 30).unwrap();
        core.tick(40, &scripts, &mut pins);
        assert_eq!(core.automation().variable("dark"), 1);
    }

    #[test]
    fn missing_script_is_reported() {
        let mut core = synchronized_core();
        let err = core
            .spawn_script("ghost", 0, &MockScripts::new(), &mut MockPins::new(), false)
            .unwrap_err();
        assert_eq!(err, AutomationError::ScriptNotFound("ghost".into()));
    }

    #[test]
    fn feed_reaches_sink_in_order() {
        let mut core = synchronized_core();
        core.submit(Intent::SetSpeed { id: 1234, speed: 20 }, ControlPath::Local)
            .unwrap();
        core.submit(
            Intent::SetDirection {
                id: 1234,
                direction: Direction::Reverse,
            },
            ControlPath::Local,
        )
        .unwrap();
        let mut sink = MockDeltaSink::new();
        let sent = core.publish_to(&mut sink).unwrap();
        assert_eq!(sent, sink.received().len());
        assert!(sent >= 2);
        assert!(core.drain_deltas().is_empty());
    }

    #[test]
    fn failing_sink_keeps_deltas() {
        let mut core = synchronized_core();
        core.submit(Intent::SetSpeed { id: 1234, speed: 20 }, ControlPath::Local)
            .unwrap();
        let mut sink = MockDeltaSink::new().failing();
        assert!(core.publish_to(&mut sink).is_err());
        assert!(!core.drain_deltas().is_empty());
    }

    #[test]
    fn gave_up_drops_locomotives() {
        let config = Config::default().with_network(crate::config::NetworkConfig::default().with_max_retries(0));
        let mut core = BridgeCore::new(config);
        core.on_connected(0);
        core.on_upstream_line("VN2.0", 1).unwrap();
        core.on_upstream_line("RL1]\\[Mogul}|{1234}|{L", 2).unwrap();
        assert!(core.registries().locomotive(1234).is_some());

        core.on_disconnected(10);
        let mut signal = None;
        for t in (20..200_000).step_by(1_000) {
            if let Some(s) = core.poll_session(t) {
                signal = Some(s);
                break;
            }
        }
        assert_eq!(signal, Some(SessionSignal::GaveUp));
        assert!(core.registries().locomotive(1234).is_none());
    }
}
