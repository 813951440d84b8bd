//! Session manager: the single upstream connection to the command station.
//!
//! The session is a polled state machine. It never touches a socket; the
//! caller feeds received lines to [`SessionManager::on_receive`], drains
//! encoded lines with [`SessionManager::drain_outbound`], and calls
//! [`SessionManager::poll`] periodically to drive timers.
//!
//! ```text
//! Connecting ──on_connected──▶ Identifying ──sync complete──▶ Synchronized
//!      ▲                            │                              │
//!      │ Reconnect            timeout / errors              keepalive miss
//!      │                            ▼                              │
//!      └────────backoff──────── Degraded ◀─────────────────────────┘
//!                                   │ retries exhausted
//!                                   ▼
//!                                Closed
//! ```
//!
//! # Example
//!
//! ```rust
//! use rs_throttle_bridge::config::{DeviceConfig, NetworkConfig};
//! use rs_throttle_bridge::registry::Registries;
//! use rs_throttle_bridge::session::{SessionManager, SessionState};
//!
//! let mut reg = Registries::new();
//! let mut session = SessionManager::new(NetworkConfig::default(), DeviceConfig::default());
//!
//! session.on_connected(0);
//! assert_eq!(session.drain_outbound(), ["<s>"]);
//!
//! session.on_receive("VN2.0", 10, &mut reg).unwrap();
//! session.on_receive("RL0", 20, &mut reg).unwrap();
//! session.on_receive("PPA1", 30, &mut reg).unwrap();
//! assert_eq!(session.state(), SessionState::Synchronized);
//! ```

use alloc::collections::{BTreeSet, VecDeque};
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::commands::{Intent, IntentOutcome, RejectReason, TurnoutAction};
use crate::config::{DeviceConfig, NetworkConfig};
use crate::entities::{
    AddressType, ControlPath, Delta, Direction, Locomotive, PowerState, Route, RouteState, SensorValue,
    Turnout, TurnoutState, ESTOP_SPEED, MAX_FUNCTIONS, MAX_SPEED,
};
use crate::error::{ProtocolError, RegistryError, SessionError};
use crate::protocol::{
    self, dccex, throttle_char, DccMessage, Dialect, DialectDetector, ListKind, LocoKey, Message,
    PowerDistrict, ThrottleAction, ThrottleLine, ThrottleOp, WiMessage,
};
use crate::registry::{Claim, ListOrder, Registries};

/// Session lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// Waiting for the transport to connect.
    #[default]
    Connecting,
    /// Connected; detecting the dialect and loading the initial state.
    Identifying,
    /// Initial state fully applied.
    Synchronized,
    /// Connection lost or unusable; waiting to reconnect.
    Degraded,
    /// Gave up.
    Closed,
}

impl SessionState {
    /// Lowercase name for logs and status output.
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Identifying => "identifying",
            SessionState::Synchronized => "synchronized",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        }
    }
}

/// Something the transport owner must act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionSignal {
    /// Drop the current connection.
    Disconnect(ProtocolError),
    /// Open a new connection, then call [`SessionManager::on_connected`].
    Reconnect {
        /// 1-based attempt number.
        attempt: u8,
    },
    /// Retries exhausted; the session is closed.
    GaveUp,
}

/// Frame counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionStats {
    /// Lines received.
    pub frames_in: u32,
    /// Lines queued for sending.
    pub frames_out: u32,
    /// Lines that failed to decode.
    pub parse_errors: u32,
    /// Reconnect attempts made.
    pub reconnects: u32,
}

const LIST_ROSTER: u8 = 1;
const LIST_TURNOUTS: u8 = 2;
const LIST_ROUTES: u8 = 4;
const LIST_ALL: u8 = LIST_ROSTER | LIST_TURNOUTS | LIST_ROUTES;

#[derive(Clone, Copy, Debug, Default)]
struct SyncProgress {
    roster: bool,
    power: bool,
    identity: bool,
    lists: u8,
    pending_details: usize,
}

impl SyncProgress {
    fn complete(&self, dialect: Dialect) -> bool {
        match dialect {
            Dialect::WiThrottle => self.roster && self.power,
            Dialect::DccEx => self.identity && self.lists == LIST_ALL && self.pending_details == 0,
        }
    }
}

/// Upstream multi-throttle number for a control path.
///
/// Each path drives its locomotives on its own WiThrottle throttle so a
/// release on one never touches another's consist.
pub fn throttle_nr_for(path: ControlPath) -> u8 {
    match path {
        ControlPath::Local => 0,
        ControlPath::Relay(slot) => 1 + slot.min(8),
        ControlPath::Automation(pid) => 10 + pid.min(25),
    }
}

/// WiThrottle speed-step mode code to step count.
fn speed_steps_from_mode(mode: u8) -> Option<u8> {
    match mode {
        1 => Some(128),
        2 | 16 => Some(28),
        4 => Some(27),
        8 => Some(14),
        _ => None,
    }
}

fn reject_reason(err: RegistryError) -> RejectReason {
    match err {
        RegistryError::AlreadyOwned { owner, .. } => RejectReason::AlreadyOwned { owner },
        RegistryError::NotOwner { .. } => RejectReason::NotOwner,
        RegistryError::NotFound(_) => RejectReason::UnknownEntity,
        RegistryError::NoPendingSteal(_) => RejectReason::NoPendingSteal,
        RegistryError::ConsistFull { .. } => RejectReason::ConsistFull,
        RegistryError::RouteTooLong(_) => RejectReason::OutOfRange,
    }
}

/// Wire identity of a locomotive on the upstream connection.
#[derive(Clone, Copy)]
struct Wire {
    throttle: char,
    key: LocoKey,
    speed: i16,
    direction: Direction,
}

impl Wire {
    fn of(loco: &Locomotive) -> Self {
        Self {
            throttle: throttle_char(loco.throttle_nr),
            key: LocoKey::address(loco.id, loco.address_type),
            speed: loco.speed,
            direction: loco.direction,
        }
    }
}

// ============================================================================
// Session Manager
// ============================================================================

/// Upstream session state machine.
#[derive(Debug)]
pub struct SessionManager {
    network: NetworkConfig,
    device: DeviceConfig,
    state: SessionState,
    dialect: Option<Dialect>,
    detector: Option<DialectDetector>,
    outbound: VecDeque<String>,
    last_rx_ms: u64,
    last_probe_ms: u64,
    attempt: u8,
    next_retry_ms: u64,
    parse_errors: u8,
    heartbeat_secs: Option<u16>,
    server_version: Option<String>,
    sync: SyncProgress,
    upstream_steals: BTreeSet<u16>,
    resync: bool,
    signal: Option<SessionSignal>,
    stats: SessionStats,
}

impl SessionManager {
    /// New session in `Connecting`.
    pub fn new(network: NetworkConfig, device: DeviceConfig) -> Self {
        Self {
            network,
            device,
            state: SessionState::Connecting,
            dialect: None,
            detector: None,
            outbound: VecDeque::new(),
            last_rx_ms: 0,
            last_probe_ms: 0,
            attempt: 0,
            next_retry_ms: 0,
            parse_errors: 0,
            heartbeat_secs: None,
            server_version: None,
            sync: SyncProgress::default(),
            upstream_steals: BTreeSet::new(),
            resync: false,
            signal: None,
            stats: SessionStats::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Detected upstream dialect.
    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect
    }

    /// Whether the initial state has been applied.
    pub fn is_synchronized(&self) -> bool {
        self.state == SessionState::Synchronized
    }

    /// Frame counters.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Heartbeat interval announced by a WiThrottle server.
    pub fn heartbeat_secs(&self) -> Option<u16> {
        self.heartbeat_secs
    }

    /// Server version (`VN`) or DCC-Ex identity text.
    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    /// Network settings in use.
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    /// Whether lines are waiting to be sent.
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Take every queued outbound line, oldest first.
    pub fn drain_outbound(&mut self) -> Vec<String> {
        self.outbound.drain(..).collect()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// The transport connected: open the identification window.
    pub fn on_connected(&mut self, now_ms: u64) {
        info!(
            "[session] connected to {}:{}, identifying",
            self.network.host, self.network.port
        );
        self.state = SessionState::Identifying;
        self.dialect = None;
        self.detector = Some(DialectDetector::new(now_ms, self.network.init_wait_ms));
        self.outbound.clear();
        self.last_rx_ms = now_ms;
        self.last_probe_ms = now_ms;
        self.parse_errors = 0;
        self.sync = SyncProgress::default();
        self.signal = None;
        if self.network.identify_probe {
            self.send(Message::DccEx(DccMessage::StatusRequest));
        }
    }

    /// The transport failed or was closed by the peer.
    pub fn on_disconnected(&mut self, now_ms: u64) {
        if matches!(
            self.state,
            SessionState::Connecting | SessionState::Identifying | SessionState::Synchronized
        ) {
            warn!("[session] transport lost in state {}", self.state.as_str());
            self.enter_degraded(now_ms);
        }
    }

    /// Leave `Closed` and start over with a fresh retry budget.
    pub fn reopen(&mut self) {
        self.state = SessionState::Connecting;
        self.attempt = 0;
        self.signal = None;
    }

    /// Close the session for good. Every locomotive record is dropped, since
    /// upstream ownership ends with the connection.
    pub fn close(&mut self, registries: &mut Registries) -> Vec<Delta> {
        info!("[session] closing");
        self.state = SessionState::Closed;
        self.dialect = None;
        self.detector = None;
        self.outbound.clear();
        self.upstream_steals.clear();
        registries.clear_locomotives()
    }

    /// Tell the command station about ownerships dropped outside
    /// [`submit`](Self::submit), such as a relay client going away.
    pub fn announce_releases(&mut self, deltas: &[Delta]) {
        if self.dialect != Some(Dialect::WiThrottle) {
            return;
        }
        for delta in deltas {
            if let Delta::Locomotive {
                old: Some(old),
                new: Some(new),
            } = delta
            {
                if old.owner.is_some() && new.owner.is_none() {
                    let wire = Wire::of(old);
                    self.send_throttle(
                        wire.throttle,
                        ThrottleOp::Remove,
                        wire.key,
                        ThrottleAction::Release,
                    );
                }
            }
        }
    }

    fn enter_degraded(&mut self, now_ms: u64) {
        self.state = SessionState::Degraded;
        self.dialect = None;
        self.detector = None;
        self.outbound.clear();
        self.upstream_steals.clear();
        self.resync = true;
        self.next_retry_ms = now_ms.saturating_add(self.network.backoff_ms(self.attempt));
    }

    fn degrade(&mut self, now_ms: u64, err: ProtocolError) -> SessionSignal {
        warn!("[session] degraded: {}", err);
        self.enter_degraded(now_ms);
        SessionSignal::Disconnect(err)
    }

    fn probe_interval_ms(&self) -> u64 {
        match self.heartbeat_secs {
            Some(secs) if secs > 0 => (u64::from(secs) * 500).min(self.network.keepalive_ms),
            _ => self.network.keepalive_ms,
        }
    }

    /// Drive timers: identification window, keepalive and reconnect backoff.
    pub fn poll(&mut self, now_ms: u64) -> Option<SessionSignal> {
        if let Some(signal) = self.signal.take() {
            return Some(signal);
        }
        match self.state {
            SessionState::Identifying if self.dialect.is_none() => {
                let err = self.detector?.check(now_ms).err()?;
                Some(self.degrade(now_ms, err))
            }
            SessionState::Identifying | SessionState::Synchronized => {
                let dialect = self.dialect?;
                let silent_ms = now_ms.saturating_sub(self.last_rx_ms);
                if dialect.probe_is_answered()
                    && silent_ms > self.network.keepalive_ms + self.network.timeout_ms
                {
                    return Some(self.degrade(now_ms, ProtocolError::KeepaliveTimeout { silent_ms }));
                }
                if now_ms.saturating_sub(self.last_probe_ms) >= self.probe_interval_ms() {
                    self.last_probe_ms = now_ms;
                    self.send(dialect.keepalive_probe());
                }
                None
            }
            SessionState::Degraded if now_ms >= self.next_retry_ms => {
                if self.attempt >= self.network.max_retries {
                    warn!("[session] giving up after {} attempts", self.attempt);
                    self.state = SessionState::Closed;
                    Some(SessionSignal::GaveUp)
                } else {
                    self.attempt += 1;
                    self.stats.reconnects += 1;
                    self.state = SessionState::Connecting;
                    info!("[session] reconnect attempt {}", self.attempt);
                    Some(SessionSignal::Reconnect {
                        attempt: self.attempt,
                    })
                }
            }
            _ => None,
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Decode one received line and apply it to the registries.
    ///
    /// A malformed line is dropped and reported as [`ProtocolError::Parse`];
    /// the session stays up until more than `max_parse_errors` consecutive
    /// lines fail.
    pub fn on_receive(
        &mut self,
        line: &str,
        now_ms: u64,
        registries: &mut Registries,
    ) -> Result<Vec<Delta>, ProtocolError> {
        if !matches!(
            self.state,
            SessionState::Identifying | SessionState::Synchronized
        ) {
            debug!("[session] ignoring line while {}", self.state.as_str());
            return Ok(Vec::new());
        }
        if line.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.stats.frames_in += 1;
        self.last_rx_ms = now_ms;

        let dialect = match self.dialect {
            Some(dialect) => dialect,
            None => match self.detector.as_ref().and_then(|d| d.observe(line)) {
                Some(dialect) => {
                    self.identified(dialect);
                    dialect
                }
                None => {
                    debug!("[session] unrecognised line during identification: {:?}", line);
                    return Ok(Vec::new());
                }
            },
        };

        let msg = match protocol::decode(dialect, line) {
            Ok(msg) => {
                self.parse_errors = 0;
                msg
            }
            Err(err) => {
                self.parse_errors = self.parse_errors.saturating_add(1);
                self.stats.parse_errors += 1;
                warn!("[session] dropping malformed frame {:?}: {}", line, err);
                if self.parse_errors > self.network.max_parse_errors {
                    let err = ProtocolError::TooManyParseErrors {
                        count: self.parse_errors,
                    };
                    self.signal = Some(self.degrade(now_ms, err.clone()));
                    return Err(err);
                }
                return Err(err.into());
            }
        };

        let deltas = match msg {
            Message::WiThrottle(msg) => self.apply_withrottle(msg, registries),
            Message::DccEx(msg) => self.apply_dccex(msg, registries),
        };
        self.check_synchronized(registries);
        Ok(deltas)
    }

    fn identified(&mut self, dialect: Dialect) {
        info!("[session] dialect identified: {:?}", dialect);
        self.dialect = Some(dialect);
        self.detector = None;
        match dialect {
            Dialect::WiThrottle => {
                self.send(Message::WiThrottle(WiMessage::Name(
                    self.device.name.as_str().into(),
                )));
                self.send(Message::WiThrottle(WiMessage::HardwareId(
                    self.device.id.as_str().into(),
                )));
                self.send(Message::WiThrottle(WiMessage::HeartbeatMode(true)));
            }
            Dialect::DccEx => {
                if !self.network.identify_probe {
                    self.send(Message::DccEx(DccMessage::StatusRequest));
                }
                for kind in [ListKind::Roster, ListKind::Turnouts, ListKind::Routes] {
                    self.send(Message::DccEx(DccMessage::ListRequest { kind, id: None }));
                }
            }
        }
    }

    fn check_synchronized(&mut self, registries: &Registries) {
        let Some(dialect) = self.dialect else {
            return;
        };
        if self.state != SessionState::Identifying || !self.sync.complete(dialect) {
            return;
        }
        info!(
            "[session] synchronized: {} locomotives, {} turnouts, {} routes",
            registries.list_locomotives(ListOrder::Insertion).len(),
            registries.list_turnouts(ListOrder::Insertion).len(),
            registries.list_routes(ListOrder::Insertion).len()
        );
        self.state = SessionState::Synchronized;
        self.attempt = 0;
        if core::mem::take(&mut self.resync) {
            let owned: Vec<u16> = registries
                .list_locomotives(ListOrder::Insertion)
                .into_iter()
                .filter(|l| l.is_owned())
                .map(|l| l.id)
                .collect();
            for id in owned {
                debug!("[session] re-acquiring {}", id);
                self.send_acquire(dialect, id, registries);
            }
        }
    }

    fn apply_withrottle(&mut self, msg: WiMessage, reg: &mut Registries) -> Vec<Delta> {
        let mut deltas = Vec::new();
        match msg {
            WiMessage::Version(version) => {
                info!("[session] WiThrottle server version {}", version);
                self.server_version = Some(version);
            }
            WiMessage::Roster(entries) => {
                for entry in entries {
                    let loco = Locomotive::new(entry.address)
                        .with_name(&entry.name)
                        .with_address_type(entry.address_type);
                    deltas.extend(reg.upsert_locomotive(loco));
                }
                self.sync.roster = true;
            }
            WiMessage::Power(state) => {
                deltas.extend(reg.set_power(state));
                self.sync.power = true;
            }
            WiMessage::TurnoutList(list) => {
                for entry in list {
                    let turnout = Turnout::new(&entry.sys_name)
                        .with_user_name(&entry.user_name)
                        .with_state(TurnoutState::from_code(entry.state));
                    deltas.extend(reg.upsert_turnout(turnout));
                }
            }
            WiMessage::RouteList(list) => {
                for entry in list {
                    let route = Route::new(&entry.sys_name)
                        .with_user_name(&entry.user_name)
                        .with_state(RouteState::from_code(entry.state));
                    deltas.extend(reg.upsert_route(route));
                }
            }
            WiMessage::TurnoutAction { code, sys_name } => {
                if let Some(code) = code.to_digit(10) {
                    deltas.extend(
                        reg.apply_turnout_confirmation(&sys_name, TurnoutState::from_code(code as u8)),
                    );
                }
            }
            WiMessage::RouteAction { code, sys_name } => {
                if let Some(code) = code.to_digit(10) {
                    deltas.extend(reg.set_route_state(&sys_name, RouteState::from_code(code as u8)));
                }
            }
            WiMessage::HeartbeatInterval(secs) => {
                debug!("[session] server heartbeat {} s", secs);
                self.heartbeat_secs = Some(secs);
            }
            WiMessage::ServerMessage { kind, text } => {
                info!("[session] server message H{}: {}", kind, text);
            }
            WiMessage::Throttle(line) => deltas = self.apply_throttle_line(line, reg),
            WiMessage::Quit => warn!("[session] server is closing the session"),
            WiMessage::Noop(raw) => debug!("[session] ignoring {:?}", raw),
            _ => {}
        }
        deltas
    }

    fn apply_throttle_line(&mut self, line: ThrottleLine, reg: &mut Registries) -> Vec<Delta> {
        let ids: Vec<u16> = match line.key {
            LocoKey::Address { id, .. } => vec![id],
            LocoKey::All => reg
                .list_locomotives(ListOrder::Insertion)
                .into_iter()
                .filter(|l| l.is_owned() && throttle_char(l.throttle_nr) == line.throttle)
                .map(|l| l.id)
                .collect(),
        };
        let mut deltas = Vec::new();
        for id in ids {
            match line.op {
                ThrottleOp::Add => {
                    if self.upstream_steals.remove(&id) {
                        let path = reg.locomotive(id).and_then(|l| l.pending_steal);
                        match reg.confirm_steal(id) {
                            Ok(delta) => deltas.extend(delta),
                            Err(err) => warn!("[session] steal of {} not applied: {}", id, err),
                        }
                        if let Some(path) = path {
                            deltas.extend(reg.set_throttle_nr(id, throttle_nr_for(path)));
                        }
                        info!("[session] steal of {} confirmed", id);
                    }
                }
                ThrottleOp::Steal => {
                    info!("[session] locomotive {} is in use elsewhere", id);
                    deltas.extend(reg.demote_to_pending(id));
                    self.upstream_steals.insert(id);
                }
                ThrottleOp::Remove => {
                    self.upstream_steals.remove(&id);
                    deltas.extend(reg.force_release(id));
                }
                ThrottleOp::Labels => {
                    if let ThrottleAction::Labels(labels) = &line.action {
                        deltas.extend(reg.set_function_labels(id, labels.clone()));
                    }
                }
                ThrottleOp::Action => match &line.action {
                    ThrottleAction::Speed(speed) => deltas.extend(reg.set_speed(id, *speed)),
                    ThrottleAction::Direction(dir) => deltas.extend(reg.set_direction(id, *dir)),
                    ThrottleAction::Function { on, num } => {
                        deltas.extend(reg.set_function(id, *num, *on))
                    }
                    ThrottleAction::SpeedSteps(mode) => {
                        if let Some(steps) = speed_steps_from_mode(*mode) {
                            deltas.extend(reg.set_speed_steps(id, steps));
                        }
                    }
                    _ => {}
                },
            }
        }
        deltas
    }

    fn apply_dccex(&mut self, msg: DccMessage, reg: &mut Registries) -> Vec<Delta> {
        let mut deltas = Vec::new();
        match msg {
            DccMessage::Identity(text) => {
                info!("[session] command station: {}", text);
                self.server_version = Some(text);
                self.sync.identity = true;
            }
            DccMessage::PowerBroadcast { on, district } => {
                if district != Some(PowerDistrict::Prog) {
                    let state = if on { PowerState::On } else { PowerState::Off };
                    deltas.extend(reg.set_power(state));
                }
            }
            DccMessage::LocoBroadcast {
                cab,
                speed_byte,
                functions,
                ..
            } => {
                let (speed, direction) = dccex::from_speed_byte(speed_byte);
                deltas.extend(reg.apply_loco_state(cab, speed, direction, functions));
            }
            DccMessage::TurnoutBroadcast { id, thrown } => {
                let state = if thrown {
                    TurnoutState::Thrown
                } else {
                    TurnoutState::Closed
                };
                deltas.extend(reg.apply_turnout_confirmation(&id.to_string(), state));
            }
            DccMessage::RosterIds(ids) => self.request_details(ListKind::Roster, ids),
            DccMessage::TurnoutIds(ids) => self.request_details(ListKind::Turnouts, ids),
            DccMessage::RouteIds(ids) => self.request_details(ListKind::Routes, ids),
            DccMessage::RosterDetail {
                id,
                name,
                functions,
            } => {
                self.sync.pending_details = self.sync.pending_details.saturating_sub(1);
                let loco = Locomotive::new(id)
                    .with_name(&name)
                    .with_function_labels(&functions);
                deltas.extend(reg.upsert_locomotive(loco));
            }
            DccMessage::TurnoutDetail {
                id,
                state,
                description,
            } => {
                self.sync.pending_details = self.sync.pending_details.saturating_sub(1);
                if state != 'X' {
                    let state = match state {
                        'T' | '1' => TurnoutState::Thrown,
                        'C' | '0' => TurnoutState::Closed,
                        _ => TurnoutState::Unknown,
                    };
                    let turnout = Turnout::new(&id.to_string())
                        .with_user_name(description.as_deref().unwrap_or(""))
                        .with_state(state);
                    deltas.extend(reg.upsert_turnout(turnout));
                }
            }
            DccMessage::RouteDetail {
                id,
                kind,
                description,
            } => {
                self.sync.pending_details = self.sync.pending_details.saturating_sub(1);
                if kind != 'X' {
                    let sys = id.to_string();
                    let state = reg.route(&sys).map(|r| r.state).unwrap_or_default();
                    let route = Route::new(&sys)
                        .with_user_name(description.as_deref().unwrap_or(""))
                        .with_state(state);
                    deltas.extend(reg.upsert_route(route));
                }
            }
            DccMessage::SensorActive(id) => deltas.extend(reg.set_sensor(id, SensorValue::On)),
            DccMessage::SensorInactive(id) => deltas.extend(reg.set_sensor(id, SensorValue::Off)),
            DccMessage::SlotCount(_) => {}
            DccMessage::Failed => warn!("[session] command station rejected a command"),
            DccMessage::Noop(raw) => debug!("[session] ignoring {:?}", raw),
            _ => {}
        }
        deltas
    }

    fn request_details(&mut self, kind: ListKind, ids: Vec<u16>) {
        self.sync.lists |= match kind {
            ListKind::Roster => LIST_ROSTER,
            ListKind::Turnouts => LIST_TURNOUTS,
            ListKind::Routes => LIST_ROUTES,
        };
        debug!("[session] {:?} list: {} ids", kind, ids.len());
        for id in ids {
            self.sync.pending_details += 1;
            self.send(Message::DccEx(DccMessage::ListRequest { kind, id: Some(id) }));
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    fn send(&mut self, msg: Message) {
        self.outbound.push_back(protocol::encode(&msg));
        self.stats.frames_out += 1;
    }

    fn send_throttle(&mut self, throttle: char, op: ThrottleOp, key: LocoKey, action: ThrottleAction) {
        self.send(Message::WiThrottle(WiMessage::Throttle(ThrottleLine::new(
            throttle, op, key, action,
        ))));
    }

    fn send_acquire(&mut self, dialect: Dialect, id: u16, reg: &Registries) {
        let Some(wire) = reg.locomotive(id).map(Wire::of) else {
            return;
        };
        match dialect {
            Dialect::WiThrottle => self.send_throttle(
                wire.throttle,
                ThrottleOp::Add,
                wire.key,
                ThrottleAction::Key(wire.key),
            ),
            Dialect::DccEx => self.send(Message::DccEx(DccMessage::LocoStateRequest { cab: id })),
        }
    }

    /// Send the current speed of `id` (and, for DCC-Ex, its direction).
    fn send_speed(&mut self, dialect: Dialect, wire: Wire) {
        match dialect {
            Dialect::WiThrottle => self.send_throttle(
                wire.throttle,
                ThrottleOp::Action,
                wire.key,
                ThrottleAction::Speed(wire.speed),
            ),
            Dialect::DccEx => self.send_dcc_throttle(wire, wire.speed),
        }
    }

    fn send_dcc_throttle(&mut self, wire: Wire, speed: i16) {
        if let Some(cab) = wire.key.id() {
            self.send(Message::DccEx(DccMessage::Throttle {
                register: None,
                cab,
                speed,
                direction: wire.direction,
            }));
        }
    }

    /// Queue a turnout command; false when the dialect cannot address it.
    fn send_turnout(&mut self, dialect: Dialect, sys_name: &str, thrown: bool) -> bool {
        match dialect {
            Dialect::WiThrottle => {
                self.send(Message::WiThrottle(WiMessage::TurnoutAction {
                    code: if thrown { 'T' } else { 'C' },
                    sys_name: sys_name.into(),
                }));
                true
            }
            Dialect::DccEx => match sys_name.parse::<u16>() {
                Ok(id) => {
                    self.send(Message::DccEx(DccMessage::TurnoutCommand { id, thrown }));
                    true
                }
                Err(_) => false,
            },
        }
    }

    // ========================================================================
    // Intents
    // ========================================================================

    /// Apply an intent from `path` to the registries and queue its wire form.
    ///
    /// Fails only when no upstream dialect is known yet or the session is
    /// closed; ownership conflicts are reported through the outcome.
    pub fn submit(
        &mut self,
        intent: Intent,
        path: ControlPath,
        registries: &mut Registries,
    ) -> Result<IntentOutcome, SessionError> {
        let dialect = match (self.state, self.dialect) {
            (SessionState::Closed, _) => return Err(SessionError::Closed),
            (_, Some(dialect)) => dialect,
            (_, None) => return Err(SessionError::NotReady),
        };
        debug!("[session] {:?} from {:?}", intent, path);
        let reg = registries;

        let outcome = match intent {
            Intent::AcquireLoco { id, address_type } => {
                match self.acquire(dialect, id, address_type, path, reg) {
                    Ok(deltas) => IntentOutcome::applied(deltas),
                    Err(reason) => IntentOutcome::Rejected(reason),
                }
            }
            Intent::ReleaseLoco { id } => self.release(dialect, id, path, reg),
            Intent::StealLoco { id } => self.steal(dialect, id, path, reg),
            Intent::ConfirmSteal { id } => self.confirm_steal(dialect, id, path, reg),
            Intent::SetSpeed { id, speed } => {
                if !(ESTOP_SPEED..=MAX_SPEED).contains(&speed) {
                    return Ok(IntentOutcome::Rejected(RejectReason::OutOfRange));
                }
                self.drive(dialect, id, path, reg, |session, reg, deltas| {
                    deltas.extend(reg.set_speed(id, speed));
                    if let Some(wire) = reg.locomotive(id).map(Wire::of) {
                        session.send_speed(dialect, wire);
                    }
                })
            }
            Intent::SetDirection { id, direction } => {
                if direction == Direction::Unchanged {
                    return Ok(IntentOutcome::applied(Vec::new()));
                }
                self.drive(dialect, id, path, reg, |session, reg, deltas| {
                    deltas.extend(reg.set_direction(id, direction));
                    let Some(wire) = reg.locomotive(id).map(Wire::of) else {
                        return;
                    };
                    match (dialect, direction) {
                        (Dialect::WiThrottle, Direction::Stop) => session.send_speed(dialect, wire),
                        (Dialect::WiThrottle, dir) => session.send_throttle(
                            wire.throttle,
                            ThrottleOp::Action,
                            wire.key,
                            ThrottleAction::Direction(dir),
                        ),
                        (Dialect::DccEx, _) => session.send_dcc_throttle(wire, wire.speed.max(0)),
                    }
                })
            }
            Intent::SetFunction { id, function, on } => {
                if function >= MAX_FUNCTIONS {
                    return Ok(IntentOutcome::Rejected(RejectReason::OutOfRange));
                }
                self.drive(dialect, id, path, reg, |session, reg, deltas| {
                    deltas.extend(reg.set_function(id, function, on));
                    let Some(wire) = reg.locomotive(id).map(Wire::of) else {
                        return;
                    };
                    match dialect {
                        Dialect::WiThrottle => session.send_throttle(
                            wire.throttle,
                            ThrottleOp::Action,
                            wire.key,
                            ThrottleAction::ForceFunction { on, num: function },
                        ),
                        Dialect::DccEx => session.send(Message::DccEx(DccMessage::Function {
                            cab: id,
                            function,
                            on,
                        })),
                    }
                })
            }
            Intent::EmergencyStop { id: Some(id) } => {
                if reg.locomotive(id).is_none() {
                    return Ok(IntentOutcome::Rejected(RejectReason::UnknownEntity));
                }
                let deltas: Vec<Delta> = reg.set_speed(id, ESTOP_SPEED).into_iter().collect();
                if let Some(wire) = reg.locomotive(id).map(Wire::of) {
                    match dialect {
                        Dialect::WiThrottle => self.send_throttle(
                            wire.throttle,
                            ThrottleOp::Action,
                            wire.key,
                            ThrottleAction::EStop,
                        ),
                        Dialect::DccEx => self.send_dcc_throttle(wire, ESTOP_SPEED),
                    }
                }
                warn!("[session] emergency stop {} by {:?}", id, path);
                IntentOutcome::applied(deltas)
            }
            Intent::EmergencyStop { id: None } => {
                match dialect {
                    Dialect::WiThrottle => {
                        let throttles: BTreeSet<char> = reg
                            .list_locomotives(ListOrder::Insertion)
                            .into_iter()
                            .filter(|l| l.is_owned())
                            .map(|l| throttle_char(l.throttle_nr))
                            .collect();
                        for t in throttles {
                            self.send_throttle(t, ThrottleOp::Action, LocoKey::All, ThrottleAction::EStop);
                        }
                    }
                    Dialect::DccEx => self.send(Message::DccEx(DccMessage::EmergencyStop)),
                }
                warn!("[session] emergency stop all by {:?}", path);
                IntentOutcome::applied(reg.estop_all())
            }
            Intent::SetTurnout { sys_name, action } => {
                let desired = match action {
                    TurnoutAction::Throw => TurnoutState::Thrown,
                    TurnoutAction::Close => TurnoutState::Closed,
                    TurnoutAction::Toggle => match reg.turnout(&sys_name).map(|t| t.state) {
                        Some(TurnoutState::Thrown) => TurnoutState::Closed,
                        _ => TurnoutState::Thrown,
                    },
                };
                if !self.send_turnout(dialect, &sys_name, desired == TurnoutState::Thrown) {
                    return Ok(IntentOutcome::Rejected(RejectReason::UnknownEntity));
                }
                IntentOutcome::applied(reg.set_turnout_state(&sys_name, desired).into_iter().collect())
            }
            Intent::RunRoute { sys_name } => self.run_route(dialect, &sys_name, reg),
            Intent::SetPower { state, district } => {
                if state == PowerState::Unknown {
                    return Ok(IntentOutcome::Rejected(RejectReason::OutOfRange));
                }
                let on = state == PowerState::On;
                match dialect {
                    Dialect::WiThrottle => self.send(Message::WiThrottle(WiMessage::Power(state))),
                    Dialect::DccEx => {
                        self.send(Message::DccEx(DccMessage::PowerCommand { on, district }))
                    }
                }
                let deltas = if district == Some(PowerDistrict::Prog) {
                    Vec::new()
                } else {
                    reg.set_power(state).into_iter().collect()
                };
                IntentOutcome::applied(deltas)
            }
            Intent::Raw(line) => {
                self.outbound.push_back(line);
                self.stats.frames_out += 1;
                IntentOutcome::applied(Vec::new())
            }
        };
        Ok(outcome)
    }

    fn acquire(
        &mut self,
        dialect: Dialect,
        id: u16,
        address_type: Option<AddressType>,
        path: ControlPath,
        reg: &mut Registries,
    ) -> Result<Vec<Delta>, RejectReason> {
        let mut deltas = Vec::new();
        if reg.locomotive(id).and_then(|l| l.owner) == Some(path) {
            return Ok(deltas);
        }
        deltas.extend(reg.set_owner(id, path).map_err(reject_reason)?);
        if let Some(address_type) = address_type {
            deltas.extend(reg.upsert_locomotive(Locomotive::new(id).with_address_type(address_type)));
        }
        deltas.extend(reg.set_throttle_nr(id, throttle_nr_for(path)));
        self.send_acquire(dialect, id, reg);
        info!("[session] {:?} acquired {}", path, id);
        Ok(deltas)
    }

    /// Resolve implicit acquisition, then run `apply`.
    fn drive(
        &mut self,
        dialect: Dialect,
        id: u16,
        path: ControlPath,
        reg: &mut Registries,
        apply: impl FnOnce(&mut Self, &mut Registries, &mut Vec<Delta>),
    ) -> IntentOutcome {
        let mut deltas = Vec::new();
        match reg.locomotive(id).and_then(|l| l.owner) {
            Some(owner) if owner == path => {}
            Some(owner) => return IntentOutcome::Rejected(RejectReason::AlreadyOwned { owner }),
            None => match self.acquire(dialect, id, None, path, reg) {
                Ok(acquired) => deltas.extend(acquired),
                Err(reason) => return IntentOutcome::Rejected(reason),
            },
        }
        apply(self, reg, &mut deltas);
        IntentOutcome::applied(deltas)
    }

    fn release(
        &mut self,
        dialect: Dialect,
        id: u16,
        path: ControlPath,
        reg: &mut Registries,
    ) -> IntentOutcome {
        let Some(loco) = reg.locomotive(id) else {
            return IntentOutcome::Rejected(RejectReason::UnknownEntity);
        };
        let was_owner = loco.owner == Some(path);
        let wire = Wire::of(loco);
        match reg.release(id, path) {
            Ok(delta) => {
                if was_owner {
                    if dialect == Dialect::WiThrottle {
                        self.send_throttle(
                            wire.throttle,
                            ThrottleOp::Remove,
                            wire.key,
                            ThrottleAction::Release,
                        );
                    }
                    info!("[session] {:?} released {}", path, id);
                } else {
                    self.upstream_steals.remove(&id);
                }
                IntentOutcome::applied(delta.into_iter().collect())
            }
            Err(err) => IntentOutcome::Rejected(reject_reason(err)),
        }
    }

    fn steal(
        &mut self,
        dialect: Dialect,
        id: u16,
        path: ControlPath,
        reg: &mut Registries,
    ) -> IntentOutcome {
        match reg.request_steal(id, path) {
            Ok(Claim::Granted(None)) => IntentOutcome::applied(Vec::new()),
            Ok(Claim::Granted(Some(delta))) => {
                let mut deltas = vec![delta];
                deltas.extend(reg.set_throttle_nr(id, throttle_nr_for(path)));
                self.send_acquire(dialect, id, reg);
                IntentOutcome::applied(deltas)
            }
            Ok(Claim::PendingConfirmation) => {
                info!("[session] {:?} waiting to steal {}", path, id);
                IntentOutcome::PendingConfirmation
            }
            Err(err) => IntentOutcome::Rejected(reject_reason(err)),
        }
    }

    fn confirm_steal(
        &mut self,
        dialect: Dialect,
        id: u16,
        path: ControlPath,
        reg: &mut Registries,
    ) -> IntentOutcome {
        let Some(loco) = reg.locomotive(id) else {
            return IntentOutcome::Rejected(RejectReason::UnknownEntity);
        };
        if loco.pending_steal != Some(path) {
            return IntentOutcome::Rejected(RejectReason::NoPendingSteal);
        }
        let previous = loco.owner;
        let old = Wire::of(loco);

        if previous.is_none() && dialect == Dialect::WiThrottle && self.upstream_steals.contains(&id)
        {
            // The server completes the transfer with an `M<t>+` acknowledgement.
            let t = throttle_char(throttle_nr_for(path));
            self.send_throttle(t, ThrottleOp::Steal, old.key, ThrottleAction::Key(old.key));
            return IntentOutcome::PendingConfirmation;
        }

        let mut deltas: Vec<Delta> = match reg.confirm_steal(id) {
            Ok(delta) => delta.into_iter().collect(),
            Err(err) => return IntentOutcome::Rejected(reject_reason(err)),
        };
        deltas.extend(reg.set_throttle_nr(id, throttle_nr_for(path)));
        let new_throttle = throttle_char(throttle_nr_for(path));
        if dialect == Dialect::WiThrottle && previous.is_some() && old.throttle != new_throttle {
            self.send_throttle(old.throttle, ThrottleOp::Remove, old.key, ThrottleAction::Release);
        }
        if previous.is_none() || old.throttle != new_throttle {
            self.send_acquire(dialect, id, reg);
        }
        info!("[session] {:?} stole {} from {:?}", path, id, previous);
        IntentOutcome::applied(deltas)
    }

    fn run_route(&mut self, dialect: Dialect, sys_name: &str, reg: &mut Registries) -> IntentOutcome {
        let Some(route) = reg.route(sys_name) else {
            return IntentOutcome::Rejected(RejectReason::UnknownEntity);
        };

        if route.steps.is_empty() {
            match dialect {
                Dialect::WiThrottle => self.send(Message::WiThrottle(WiMessage::RouteAction {
                    code: '2',
                    sys_name: sys_name.into(),
                })),
                Dialect::DccEx => match sys_name.parse::<u16>() {
                    Ok(id) => self.send(Message::DccEx(DccMessage::StartRoute { id })),
                    Err(_) => return IntentOutcome::Rejected(RejectReason::UnknownEntity),
                },
            }
            return IntentOutcome::applied(Vec::new());
        }

        if dialect == Dialect::DccEx
            && route.steps.iter().any(|s| s.turnout.parse::<u16>().is_err())
        {
            return IntentOutcome::Rejected(RejectReason::UnknownEntity);
        }
        let (steps, reset) = match reg.begin_route(sys_name) {
            Ok(run) => run,
            Err(err) => return IntentOutcome::Rejected(reject_reason(err)),
        };
        info!("[session] route {} with {} steps", sys_name, steps.len());
        let mut deltas: Vec<Delta> = reset.into_iter().collect();
        for step in steps {
            self.send_turnout(dialect, &step.turnout, step.desired == TurnoutState::Thrown);
            deltas.extend(reg.set_turnout_state(&step.turnout, step.desired));
        }
        IntentOutcome::applied(deltas)
    }
}
