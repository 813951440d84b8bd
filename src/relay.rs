//! Relay multiplexer: downstream throttle clients sharing the upstream session.
//!
//! Each accepted client occupies a slot and speaks either WiThrottle or
//! DCC-Ex, detected from its first line. Client requests become intents
//! tagged [`ControlPath::Relay`] and go through the [`SessionManager`], so a
//! relay client obeys the same ownership rules as the local operator.
//! Registry changes are fanned back out with [`RelayMultiplexer::broadcast`].
//!
//! The multiplexer owns no sockets. Transport workers feed lines in and
//! drain each slot's outbound queue.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::commands::{Intent, IntentOutcome, RejectReason, TurnoutAction};
use crate::config::{short_string, RelayConfig, ShortString, MAX_RELAY_CLIENTS};
use crate::entities::{
    AddressType, ControlPath, Delta, Locomotive, PowerState, TurnoutState, MAX_CONSIST_SIZE,
    MAX_FUNCTIONS,
};
use crate::error::RelayError;
use crate::protocol::withrottle::{ListEntry, RosterEntry};
use crate::protocol::{
    self, dccex, DccMessage, Dialect, ListKind, LocoKey, Message, ThrottleAction, ThrottleLine,
    ThrottleOp, WiMessage,
};
use crate::registry::{ListOrder, Registries};
use crate::session::SessionManager;

/// WiThrottle protocol version announced to clients.
pub const RELAY_PROTOCOL_VERSION: &str = "2.0";

/// One connected relay client.
#[derive(Clone, Debug)]
pub struct RelayConnection {
    /// Slot index.
    pub slot: u8,
    /// Peer address, for logs.
    pub remote: String,
    /// Name the client announced (`N…`).
    pub node_name: Option<String>,
    /// Client dialect, once detected.
    pub dialect: Option<Dialect>,
    /// Lines received.
    pub packets_in: u32,
    /// Lines queued for the client.
    pub packets_out: u32,
    /// When the client connected.
    pub connected_ms: u64,
    /// Last line received.
    pub last_activity_ms: u64,
    /// False once timed out, quit or misbehaving; the slot awaits teardown.
    pub active: bool,
    /// Locomotives this slot owns.
    pub owned: BTreeSet<u16>,
    /// WiThrottle throttle char the client uses for each locomotive.
    throttles: BTreeMap<u16, char>,
    outbound: VecDeque<String>,
}

impl RelayConnection {
    fn new(slot: u8, remote: &str, now_ms: u64) -> Self {
        Self {
            slot,
            remote: remote.into(),
            node_name: None,
            dialect: None,
            packets_in: 0,
            packets_out: 0,
            connected_ms: now_ms,
            last_activity_ms: now_ms,
            active: true,
            owned: BTreeSet::new(),
            throttles: BTreeMap::new(),
            outbound: VecDeque::new(),
        }
    }

    fn push(&mut self, line: String) {
        self.outbound.push_back(line);
        self.packets_out = self.packets_out.saturating_add(1);
    }

    fn push_message(&mut self, msg: &Message) {
        self.push(protocol::encode(msg));
    }

    /// Throttle char the client drives `id` on.
    pub fn throttle_for(&self, id: u16) -> Option<char> {
        self.throttles.get(&id).copied()
    }

    /// Whether lines are waiting to be sent.
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }
}

fn wi(msg: WiMessage) -> Message {
    Message::WiThrottle(msg)
}

fn dcc(msg: DccMessage) -> Message {
    Message::DccEx(msg)
}

fn throttle_line(t: char, op: ThrottleOp, key: LocoKey, action: ThrottleAction) -> Message {
    wi(WiMessage::Throttle(ThrottleLine::new(t, op, key, action)))
}

/// Lines acknowledging an acquisition on throttle `t`: the add echo, labels,
/// function states, speed and direction.
fn acquire_ack(t: char, loco: &Locomotive) -> Vec<Message> {
    let key = LocoKey::address(loco.id, loco.address_type);
    let mut out = vec![throttle_line(t, ThrottleOp::Add, key, ThrottleAction::None)];
    if !loco.function_labels.is_empty() {
        out.push(throttle_line(
            t,
            ThrottleOp::Labels,
            key,
            ThrottleAction::Labels(loco.function_labels.clone()),
        ));
    }
    for num in 0..MAX_FUNCTIONS {
        if usize::from(num) < loco.function_labels.len() || loco.function(num) {
            out.push(throttle_line(
                t,
                ThrottleOp::Action,
                key,
                ThrottleAction::Function {
                    on: loco.function(num),
                    num,
                },
            ));
        }
    }
    out.push(throttle_line(t, ThrottleOp::Action, key, ThrottleAction::Speed(loco.speed)));
    out.push(throttle_line(
        t,
        ThrottleOp::Action,
        key,
        ThrottleAction::Direction(loco.direction),
    ));
    out
}

fn loco_state(loco: &Locomotive) -> Message {
    dcc(DccMessage::LocoBroadcast {
        cab: loco.id,
        register: -1,
        speed_byte: dccex::speed_byte(loco.speed, loco.direction),
        functions: loco.functions,
    })
}

/// `/`-joined labels with `*` marking momentary functions.
fn roster_functions(loco: &Locomotive) -> String {
    let mut out = String::new();
    for (n, label) in loco.function_labels.iter().enumerate() {
        if n > 0 {
            out.push('/');
        }
        if !loco.is_latching(n as u8) {
            out.push('*');
        }
        out.push_str(label);
    }
    out
}

fn reject_text(reason: RejectReason) -> String {
    match reason {
        RejectReason::AlreadyOwned { owner } => format!("In use by {:?}", owner),
        RejectReason::NotOwner => "Not your locomotive".into(),
        RejectReason::ConsistFull => format!("Consist limit of {} reached", MAX_CONSIST_SIZE),
        RejectReason::UnknownEntity => "Unknown item".into(),
        RejectReason::NoPendingSteal => "Nothing to steal".into(),
        RejectReason::OutOfRange => "Value out of range".into(),
    }
}

// ============================================================================
// Relay Multiplexer
// ============================================================================

/// Fixed set of relay client slots.
///
/// # Example
///
/// ```rust
/// use rs_throttle_bridge::config::RelayConfig;
/// use rs_throttle_bridge::registry::ListOrder;
/// use rs_throttle_bridge::relay::RelayMultiplexer;
///
/// let mut relay = RelayMultiplexer::new(&RelayConfig::default().with_max_clients(1), ListOrder::ById);
/// let slot = relay.accept("192.168.4.2:50123", 0).unwrap();
/// assert_eq!(slot, 0);
/// assert!(relay.accept("192.168.4.3:50124", 0).is_err());
/// ```
#[derive(Debug)]
pub struct RelayMultiplexer {
    slots: Vec<Option<RelayConnection>>,
    keepalive_ms: u64,
    heartbeat_secs: u16,
    list_order: ListOrder,
    device_name: ShortString,
    released: Vec<Delta>,
}

impl RelayMultiplexer {
    /// Create `config.max_clients` empty slots (at most [`MAX_RELAY_CLIENTS`]).
    pub fn new(config: &RelayConfig, list_order: ListOrder) -> Self {
        let capacity = config.max_clients.clamp(1, MAX_RELAY_CLIENTS);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            keepalive_ms: config.keepalive_ms,
            heartbeat_secs: config.heartbeat_secs,
            list_order,
            device_name: short_string("relay"),
            released: Vec::new(),
        }
    }

    /// Name used in the DCC-Ex identity reply.
    pub fn with_device_name(mut self, name: &str) -> Self {
        self.device_name = short_string(name);
        self
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Connected clients that are still active.
    pub fn active_count(&self) -> usize {
        self.connections().filter(|c| c.active).count()
    }

    /// A slot's connection, if occupied.
    pub fn connection(&self, slot: u8) -> Option<&RelayConnection> {
        self.slots.get(usize::from(slot)).and_then(Option::as_ref)
    }

    /// Every occupied slot.
    pub fn connections(&self) -> impl Iterator<Item = &RelayConnection> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    fn conn_mut(&mut self, slot: u8) -> Result<&mut RelayConnection, RelayError> {
        self.slots
            .get_mut(usize::from(slot))
            .and_then(Option::as_mut)
            .ok_or(RelayError::NoSuchSlot(slot))
    }

    fn send(&mut self, slot: u8, msg: Message) {
        if let Ok(conn) = self.conn_mut(slot) {
            conn.push_message(&msg);
        }
    }

    /// Claim the first free slot for a new client.
    pub fn accept(&mut self, remote: &str, now_ms: u64) -> Result<u8, RelayError> {
        let capacity = self.capacity();
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            warn!("[relay] refusing {}: all {} slots in use", remote, capacity);
            return Err(RelayError::Full(capacity));
        };
        let slot = index as u8;
        self.slots[index] = Some(RelayConnection::new(slot, remote, now_ms));
        info!("[relay] slot {} accepted {}", slot, remote);
        Ok(slot)
    }

    /// Take queued lines for `slot`, oldest first.
    pub fn drain_outbound(&mut self, slot: u8) -> Vec<String> {
        match self.conn_mut(slot) {
            Ok(conn) => conn.outbound.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Take deltas from ownerships released outside a returned result
    /// (a slot deactivated by a decode failure).
    pub fn drain_released(&mut self) -> Vec<Delta> {
        core::mem::take(&mut self.released)
    }

    fn deactivate(&mut self, slot: u8, registries: &mut Registries) -> Vec<Delta> {
        let Ok(conn) = self.conn_mut(slot) else {
            return Vec::new();
        };
        conn.active = false;
        conn.owned.clear();
        conn.throttles.clear();
        conn.outbound.clear();
        registries.release_all(ControlPath::Relay(slot))
    }

    /// Free `slot`, releasing everything it owned.
    pub fn teardown(&mut self, slot: u8, registries: &mut Registries) -> Vec<Delta> {
        let deltas = self.deactivate(slot, registries);
        if let Some(conn) = self.slots.get_mut(usize::from(slot)).and_then(Option::take) {
            info!(
                "[relay] slot {} closed ({}): {} in / {} out",
                slot, conn.remote, conn.packets_in, conn.packets_out
            );
        }
        deltas
    }

    /// Deactivate clients silent for longer than the keepalive window.
    pub fn check_keepalive(&mut self, now_ms: u64, registries: &mut Registries) -> Vec<Delta> {
        if self.keepalive_ms == 0 {
            return Vec::new();
        }
        let stale: Vec<u8> = self
            .connections()
            .filter(|c| c.active && now_ms.saturating_sub(c.last_activity_ms) > self.keepalive_ms)
            .map(|c| c.slot)
            .collect();
        let mut deltas = Vec::new();
        for slot in stale {
            warn!("[relay] slot {} timed out", slot);
            deltas.extend(self.deactivate(slot, registries));
        }
        deltas
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Handle one line from the client in `slot`.
    ///
    /// Returns the registry deltas the client's requests produced; the
    /// caller broadcasts them with `origin = Some(slot)`. A frame that fails
    /// to decode deactivates the slot and releases its locomotives (see
    /// [`drain_released`](Self::drain_released)).
    pub fn on_client_line(
        &mut self,
        slot: u8,
        line: &str,
        now_ms: u64,
        session: &mut SessionManager,
        registries: &mut Registries,
    ) -> Result<Vec<Delta>, RelayError> {
        let conn = self.conn_mut(slot)?;
        if !conn.active {
            return Ok(Vec::new());
        }
        conn.packets_in = conn.packets_in.saturating_add(1);
        conn.last_activity_ms = now_ms;
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }

        let known = conn.dialect;
        let dialect = match known {
            Some(dialect) => dialect,
            None => match protocol::detect_dialect(line) {
                Some(dialect) => {
                    conn.dialect = Some(dialect);
                    info!("[relay] slot {} speaks {:?}", slot, dialect);
                    if dialect == Dialect::WiThrottle {
                        self.send_initial_dump(slot, registries);
                    }
                    dialect
                }
                None => {
                    debug!("[relay] slot {} unrecognised line {:?}", slot, line);
                    return Ok(Vec::new());
                }
            },
        };

        let msg = match protocol::decode(dialect, line) {
            Ok(msg) => msg,
            Err(source) => {
                warn!("[relay] slot {} sent malformed {:?}: {}", slot, line, source);
                let released = self.deactivate(slot, registries);
                self.released.extend(released);
                return Err(RelayError::Protocol { slot, source });
            }
        };

        let mut deltas = Vec::new();
        match msg {
            Message::WiThrottle(msg) => {
                self.on_withrottle(slot, msg, session, registries, &mut deltas)
            }
            Message::DccEx(msg) => self.on_dccex(slot, msg, session, registries, &mut deltas),
        }
        Ok(deltas)
    }

    fn submit(
        slot: u8,
        intent: Intent,
        session: &mut SessionManager,
        registries: &mut Registries,
        deltas: &mut Vec<Delta>,
    ) -> Option<IntentOutcome> {
        match session.submit(intent, ControlPath::Relay(slot), registries) {
            Ok(IntentOutcome::Applied { deltas: applied }) => {
                deltas.extend(applied.iter().cloned());
                Some(IntentOutcome::Applied { deltas: applied })
            }
            Ok(outcome) => {
                debug!("[relay] slot {}: {:?}", slot, outcome);
                Some(outcome)
            }
            Err(err) => {
                warn!("[relay] slot {} request dropped: {}", slot, err);
                None
            }
        }
    }

    fn send_initial_dump(&mut self, slot: u8, registries: &Registries) {
        let order = self.list_order;
        let roster = registries
            .list_locomotives(order)
            .into_iter()
            .map(|l| RosterEntry {
                name: l.name.as_str().into(),
                address: l.id,
                address_type: l.address_type,
            })
            .collect();
        let turnouts: Vec<ListEntry> = registries
            .list_turnouts(order)
            .into_iter()
            .map(|t| ListEntry {
                sys_name: t.sys_name.as_str().into(),
                user_name: t.user_name.as_str().into(),
                state: t.state.code(),
            })
            .collect();
        let routes: Vec<ListEntry> = registries
            .list_routes(order)
            .into_iter()
            .map(|r| ListEntry {
                sys_name: r.sys_name.as_str().into(),
                user_name: r.user_name.as_str().into(),
                state: r.state.code(),
            })
            .collect();
        let table = |rows: &[(&str, &str)]| -> Vec<Vec<String>> {
            rows.iter()
                .map(|(a, b)| vec![String::from(*a), String::from(*b)])
                .collect()
        };

        let mut msgs = vec![
            WiMessage::Version(RELAY_PROTOCOL_VERSION.into()),
            WiMessage::Roster(roster),
            WiMessage::Power(registries.power()),
            WiMessage::TurnoutLabels(table(&[
                ("Turnouts", "Turnout"),
                ("Closed", "2"),
                ("Thrown", "4"),
                ("Unknown", "1"),
                ("Inconsistent", "8"),
            ])),
            WiMessage::RouteLabels(table(&[
                ("Routes", "Route"),
                ("Active", "2"),
                ("Inactive", "4"),
                ("Unknown", "1"),
                ("Inconsistent", "8"),
            ])),
        ];
        if !turnouts.is_empty() {
            msgs.push(WiMessage::TurnoutList(turnouts));
        }
        if !routes.is_empty() {
            msgs.push(WiMessage::RouteList(routes));
        }
        msgs.push(WiMessage::HeartbeatInterval(self.heartbeat_secs));
        for msg in msgs {
            self.send(slot, wi(msg));
        }
    }

    fn on_withrottle(
        &mut self,
        slot: u8,
        msg: WiMessage,
        session: &mut SessionManager,
        reg: &mut Registries,
        deltas: &mut Vec<Delta>,
    ) {
        match msg {
            WiMessage::Name(name) => {
                info!("[relay] slot {} is {:?}", slot, name);
                if let Ok(conn) = self.conn_mut(slot) {
                    conn.node_name = Some(name);
                }
            }
            WiMessage::HardwareId(id) => debug!("[relay] slot {} hardware id {}", slot, id),
            WiMessage::Quit => {
                info!("[relay] slot {} quit", slot);
                deltas.extend(self.deactivate(slot, reg));
            }
            WiMessage::Power(state) => {
                let intent = Intent::SetPower {
                    state,
                    district: None,
                };
                Self::submit(slot, intent, session, reg, deltas);
            }
            WiMessage::TurnoutAction { code, sys_name } => {
                let action = match code {
                    'T' => TurnoutAction::Throw,
                    'C' => TurnoutAction::Close,
                    '2' => TurnoutAction::Toggle,
                    _ => return,
                };
                Self::submit(slot, Intent::turnout(&sys_name, action), session, reg, deltas);
            }
            WiMessage::RouteAction { code: '2', sys_name } => {
                Self::submit(slot, Intent::route(&sys_name), session, reg, deltas);
            }
            WiMessage::Throttle(line) => self.on_throttle_line(slot, line, session, reg, deltas),
            WiMessage::Noop(raw) => {
                if session.dialect() == Some(Dialect::WiThrottle) {
                    Self::submit(slot, Intent::Raw(raw), session, reg, deltas);
                } else {
                    debug!("[relay] slot {} dropping {:?}", slot, raw);
                }
            }
            _ => {}
        }
    }

    fn ack_acquire(&mut self, slot: u8, t: char, id: u16, reg: &Registries) {
        let Some(loco) = reg.locomotive(id) else {
            return;
        };
        let Ok(conn) = self.conn_mut(slot) else {
            return;
        };
        conn.throttles.insert(id, t);
        conn.owned.insert(id);
        for msg in acquire_ack(t, loco) {
            conn.push_message(&msg);
        }
    }

    fn on_throttle_line(
        &mut self,
        slot: u8,
        line: ThrottleLine,
        session: &mut SessionManager,
        reg: &mut Registries,
        deltas: &mut Vec<Delta>,
    ) {
        let t = line.throttle;
        let keys: Vec<(u16, AddressType)> = match line.key {
            LocoKey::Address { id, address_type } => vec![(id, address_type)],
            LocoKey::All => match self.connection(slot) {
                Some(conn) => conn
                    .throttles
                    .iter()
                    .filter(|(_, c)| **c == t)
                    .map(|(id, _)| {
                        let at = reg
                            .locomotive(*id)
                            .map(|l| l.address_type)
                            .unwrap_or_else(|| AddressType::infer(*id));
                        (*id, at)
                    })
                    .collect(),
                None => return,
            },
        };

        for (id, address_type) in keys {
            let key = LocoKey::address(id, address_type);
            match line.op {
                ThrottleOp::Add => {
                    let intent = Intent::AcquireLoco {
                        id,
                        address_type: Some(address_type),
                    };
                    match Self::submit(slot, intent, session, reg, deltas) {
                        Some(IntentOutcome::Applied { .. }) => self.ack_acquire(slot, t, id, reg),
                        Some(IntentOutcome::Rejected(RejectReason::AlreadyOwned { .. })) => {
                            self.send(slot, throttle_line(t, ThrottleOp::Steal, key, ThrottleAction::Key(key)));
                        }
                        Some(IntentOutcome::Rejected(reason)) => {
                            self.send(
                                slot,
                                wi(WiMessage::ServerMessage {
                                    kind: 'M',
                                    text: reject_text(reason),
                                }),
                            );
                        }
                        _ => {}
                    }
                }
                ThrottleOp::Steal => {
                    if let Ok(conn) = self.conn_mut(slot) {
                        conn.throttles.insert(id, t);
                    }
                    let mut outcome = Self::submit(slot, Intent::StealLoco { id }, session, reg, deltas);
                    if outcome == Some(IntentOutcome::PendingConfirmation) {
                        outcome = Self::submit(slot, Intent::ConfirmSteal { id }, session, reg, deltas);
                    }
                    // Upstream steals complete later and are acknowledged from broadcast.
                    if let Some(IntentOutcome::Applied { .. }) = outcome {
                        self.ack_acquire(slot, t, id, reg);
                    }
                }
                ThrottleOp::Remove => {
                    Self::submit(slot, Intent::ReleaseLoco { id }, session, reg, deltas);
                    if let Ok(conn) = self.conn_mut(slot) {
                        conn.throttles.remove(&id);
                        conn.owned.remove(&id);
                    }
                }
                ThrottleOp::Labels => {}
                ThrottleOp::Action => {
                    self.on_throttle_action(slot, t, key, &line.action, session, reg, deltas)
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_throttle_action(
        &mut self,
        slot: u8,
        t: char,
        key: LocoKey,
        action: &ThrottleAction,
        session: &mut SessionManager,
        reg: &mut Registries,
        deltas: &mut Vec<Delta>,
    ) {
        let Some(id) = key.id() else {
            return;
        };
        let intent = match action {
            ThrottleAction::Speed(speed) => Intent::SetSpeed { id, speed: *speed },
            ThrottleAction::Idle => Intent::SetSpeed { id, speed: 0 },
            ThrottleAction::Direction(direction) => Intent::SetDirection {
                id,
                direction: *direction,
            },
            ThrottleAction::Function { on, num } => {
                let (latching, current) = reg
                    .locomotive(id)
                    .map(|l| (l.is_latching(*num), l.function(*num)))
                    .unwrap_or((true, false));
                match (latching, *on) {
                    (true, true) => Intent::SetFunction {
                        id,
                        function: *num,
                        on: !current,
                    },
                    (true, false) => return,
                    (false, on) => Intent::SetFunction {
                        id,
                        function: *num,
                        on,
                    },
                }
            }
            ThrottleAction::ForceFunction { on, num } => Intent::SetFunction {
                id,
                function: *num,
                on: *on,
            },
            ThrottleAction::Momentary { momentary, num } => {
                deltas.extend(reg.set_function_latching(id, *num, !*momentary));
                return;
            }
            ThrottleAction::EStop => Intent::EmergencyStop { id: Some(id) },
            ThrottleAction::Release | ThrottleAction::Dispatch => {
                if let Ok(conn) = self.conn_mut(slot) {
                    conn.throttles.remove(&id);
                    conn.owned.remove(&id);
                }
                Intent::ReleaseLoco { id }
            }
            ThrottleAction::Query(what) => {
                let Some(loco) = reg.locomotive(id) else {
                    return;
                };
                let reply = match what {
                    'V' => ThrottleAction::Speed(loco.speed),
                    'R' => ThrottleAction::Direction(loco.direction),
                    _ => return,
                };
                self.send(slot, throttle_line(t, ThrottleOp::Action, key, reply));
                return;
            }
            other => {
                debug!("[relay] slot {} ignoring {:?}", slot, other);
                return;
            }
        };
        if let Some(IntentOutcome::Applied { .. }) = Self::submit(slot, intent, session, reg, deltas) {
            // Driving a loco without `M<t>+` first still acquires it.
            let owns = reg
                .locomotive(id)
                .is_some_and(|l| l.owner == Some(ControlPath::Relay(slot)));
            if let (true, Ok(conn)) = (owns, self.conn_mut(slot)) {
                conn.throttles.entry(id).or_insert(t);
                conn.owned.insert(id);
            }
        }
    }

    fn on_dccex(
        &mut self,
        slot: u8,
        msg: DccMessage,
        session: &mut SessionManager,
        reg: &mut Registries,
        deltas: &mut Vec<Delta>,
    ) {
        match msg {
            DccMessage::StatusRequest => {
                let on = reg.power() == PowerState::On;
                self.send(slot, dcc(DccMessage::PowerBroadcast { on, district: None }));
                let identity = format!("DCC-EX V-5.0.0 / {} relay", self.device_name);
                self.send(slot, dcc(DccMessage::Identity(identity)));
            }
            DccMessage::PowerCommand { on, district } => {
                let state = if on { PowerState::On } else { PowerState::Off };
                Self::submit(slot, Intent::SetPower { state, district }, session, reg, deltas);
            }
            DccMessage::Throttle {
                cab,
                speed,
                direction,
                ..
            } => {
                if speed < 0 {
                    Self::submit(slot, Intent::EmergencyStop { id: Some(cab) }, session, reg, deltas);
                } else {
                    let turn = Intent::SetDirection { id: cab, direction };
                    if let Some(IntentOutcome::Applied { .. }) =
                        Self::submit(slot, turn, session, reg, deltas)
                    {
                        Self::submit(slot, Intent::SetSpeed { id: cab, speed }, session, reg, deltas);
                    }
                }
                self.reply_loco_state(slot, cab, reg);
            }
            DccMessage::LocoStateRequest { cab } => self.reply_loco_state(slot, cab, reg),
            DccMessage::Function { cab, function, on } => {
                let intent = Intent::SetFunction {
                    id: cab,
                    function,
                    on,
                };
                Self::submit(slot, intent, session, reg, deltas);
                self.reply_loco_state(slot, cab, reg);
            }
            DccMessage::TurnoutCommand { id, thrown } => {
                let action = if thrown {
                    TurnoutAction::Throw
                } else {
                    TurnoutAction::Close
                };
                Self::submit(slot, Intent::turnout(&id.to_string(), action), session, reg, deltas);
            }
            DccMessage::ListRequest { kind, id: None } => {
                let reply = self.list_ids(kind, reg);
                self.send(slot, dcc(reply));
            }
            DccMessage::ListRequest { kind, id: Some(id) } => {
                let reply = list_detail(kind, id, reg);
                self.send(slot, dcc(reply));
            }
            DccMessage::StartRoute { id } => {
                Self::submit(slot, Intent::route(&id.to_string()), session, reg, deltas);
            }
            DccMessage::EmergencyStop => {
                Self::submit(slot, Intent::EmergencyStop { id: None }, session, reg, deltas);
            }
            DccMessage::SlotQuery => {
                let slots = (self.capacity() * MAX_CONSIST_SIZE) as u16;
                self.send(slot, dcc(DccMessage::SlotCount(slots)));
            }
            DccMessage::Noop(raw) => {
                if session.dialect() == Some(Dialect::DccEx) {
                    Self::submit(slot, Intent::Raw(raw), session, reg, deltas);
                } else {
                    debug!("[relay] slot {} dropping {:?}", slot, raw);
                }
            }
            other => debug!("[relay] slot {} ignoring {:?}", slot, other),
        }
    }

    fn reply_loco_state(&mut self, slot: u8, cab: u16, reg: &Registries) {
        if let Some(loco) = reg.locomotive(cab) {
            self.send(slot, loco_state(loco));
        }
    }

    fn list_ids(&self, kind: ListKind, reg: &Registries) -> DccMessage {
        let order = self.list_order;
        match kind {
            ListKind::Roster => {
                DccMessage::RosterIds(reg.list_locomotives(order).iter().map(|l| l.id).collect())
            }
            ListKind::Turnouts => DccMessage::TurnoutIds(
                reg.list_turnouts(order)
                    .iter()
                    .filter_map(|t| t.sys_name.parse().ok())
                    .collect(),
            ),
            ListKind::Routes => DccMessage::RouteIds(
                reg.list_routes(order)
                    .iter()
                    .filter_map(|r| r.sys_name.parse().ok())
                    .collect(),
            ),
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Queue `deltas` to every active client except `origin`.
    ///
    /// Each delta is encoded once per dialect. WiThrottle throttle lines are
    /// only sent to clients driving that locomotive, on the client's own
    /// throttle char. A client losing a locomotive to another path is told
    /// with a remove line; one gaining it after an upstream steal gets the
    /// acquisition acknowledgement.
    pub fn broadcast(&mut self, deltas: &[Delta], origin: Option<u8>) {
        for delta in deltas {
            let wi_msgs = protocol::encode_delta(Dialect::WiThrottle, delta);
            let dcc_lines: Vec<String> = protocol::encode_delta(Dialect::DccEx, delta)
                .iter()
                .map(protocol::encode)
                .collect();

            for conn in self.slots.iter_mut().flatten().filter(|c| c.active) {
                let is_origin = origin == Some(conn.slot);
                if let Delta::Locomotive { old, new } = delta {
                    track_ownership(conn, old.as_ref(), new.as_ref(), is_origin);
                }
                if is_origin {
                    continue;
                }
                match conn.dialect {
                    Some(Dialect::DccEx) => {
                        for line in &dcc_lines {
                            conn.push(line.clone());
                        }
                    }
                    Some(Dialect::WiThrottle) => {
                        for msg in &wi_msgs {
                            match msg {
                                Message::WiThrottle(WiMessage::Throttle(line)) => {
                                    let client_t = line.key.id().and_then(|id| conn.throttle_for(id));
                                    if let Some(client_t) = client_t {
                                        let mut line = line.clone();
                                        line.throttle = client_t;
                                        conn.push_message(&wi(WiMessage::Throttle(line)));
                                    }
                                }
                                other => conn.push_message(other),
                            }
                        }
                    }
                    None => {}
                }
            }
        }
    }
}

fn track_ownership(
    conn: &mut RelayConnection,
    old: Option<&Locomotive>,
    new: Option<&Locomotive>,
    is_origin: bool,
) {
    let path = Some(ControlPath::Relay(conn.slot));
    let Some(id) = new.or(old).map(|l| l.id) else {
        return;
    };
    let was = old.is_some_and(|l| l.owner == path);
    let is = new.is_some_and(|l| l.owner == path);

    if was && !is {
        conn.owned.remove(&id);
        if let (Some(t), Some(loco)) = (conn.throttles.remove(&id), old) {
            if !is_origin && conn.dialect == Some(Dialect::WiThrottle) {
                let key = LocoKey::address(id, loco.address_type);
                conn.push_message(&throttle_line(t, ThrottleOp::Remove, key, ThrottleAction::None));
            }
        }
    } else if is && !conn.owned.contains(&id) {
        conn.owned.insert(id);
        if let (Some(t), Some(loco)) = (conn.throttle_for(id), new) {
            if !is_origin && conn.dialect == Some(Dialect::WiThrottle) {
                for msg in acquire_ack(t, loco) {
                    conn.push_message(&msg);
                }
            }
        }
    }
}

fn list_detail(kind: ListKind, id: u16, reg: &Registries) -> DccMessage {
    let sys = id.to_string();
    match kind {
        ListKind::Roster => match reg.locomotive(id) {
            Some(loco) => DccMessage::RosterDetail {
                id,
                name: loco.name.as_str().into(),
                functions: roster_functions(loco),
            },
            None => DccMessage::RosterDetail {
                id,
                name: String::new(),
                functions: String::new(),
            },
        },
        ListKind::Turnouts => match reg.turnout(&sys) {
            Some(turnout) => DccMessage::TurnoutDetail {
                id,
                state: if turnout.state == TurnoutState::Thrown {
                    'T'
                } else {
                    'C'
                },
                description: (!turnout.user_name.is_empty())
                    .then(|| turnout.user_name.as_str().into()),
            },
            None => DccMessage::TurnoutDetail {
                id,
                state: 'X',
                description: None,
            },
        },
        ListKind::Routes => match reg.route(&sys) {
            Some(route) => DccMessage::RouteDetail {
                id,
                kind: 'R',
                description: (!route.user_name.is_empty()).then(|| route.user_name.as_str().into()),
            },
            None => DccMessage::RouteDetail {
                id,
                kind: 'X',
                description: None,
            },
        },
    }
}
