//! Entity registries: the single source of truth for layout state.
//!
//! Every mutation returns the [`Delta`]s it produced so the caller can fan
//! them out to relay clients and the display feed. Setting a value that is
//! already stored produces no delta, which keeps broadcast loops from echoing.
//!
//! # Ownership
//!
//! A locomotive is driven by at most one [`ControlPath`]. Claiming one that
//! another path holds fails with [`RegistryError::AlreadyOwned`]; the caller
//! may then [`request_steal`](Registries::request_steal), which parks the
//! claim until [`confirm_steal`](Registries::confirm_steal) transfers it.
//!
//! ```rust
//! use rs_throttle_bridge::registry::{Claim, Registries};
//! use rs_throttle_bridge::ControlPath;
//!
//! let mut reg = Registries::new();
//! reg.set_owner(3, ControlPath::Relay(0)).unwrap();
//!
//! assert!(reg.set_owner(3, ControlPath::Local).is_err());
//! assert_eq!(reg.request_steal(3, ControlPath::Local).unwrap(), Claim::PendingConfirmation);
//!
//! reg.confirm_steal(3).unwrap();
//! assert_eq!(reg.locomotive(3).unwrap().owner, Some(ControlPath::Local));
//! ```

use alloc::string::String;
use alloc::vec::Vec;

use crate::entities::{
    ControlPath, Delta, Direction, Locomotive, PowerState, Route, RouteState, RouteStep, Sensor,
    SensorValue, Turnout, TurnoutState, DEFAULT_FUNCTION_LATCH, ESTOP_SPEED, MAX_CONSIST_SIZE,
    MAX_FUNCTIONS, MAX_SPEED,
};
use crate::error::RegistryError;

/// Order in which `list_*` presents entities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ListOrder {
    /// Order of first insertion.
    #[default]
    Insertion,
    /// Numeric address / system name.
    ById,
    /// User name, then id.
    ByName,
}

/// Result of a steal request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Claim {
    /// Nobody owned it; the requester owns it now.
    Granted(Option<Delta>),
    /// Another path owns it; the claim waits for confirmation.
    PendingConfirmation,
}

/// Locomotive, turnout, route and sensor tables plus track power.
#[derive(Clone, Debug)]
pub struct Registries {
    locomotives: Vec<Locomotive>,
    turnouts: Vec<Turnout>,
    routes: Vec<Route>,
    sensors: Vec<Sensor>,
    power: PowerState,
    function_latch: u32,
    max_consist: usize,
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

fn loco_delta(old: Option<Locomotive>, new: Option<Locomotive>) -> Option<Delta> {
    if old == new {
        None
    } else {
        Some(Delta::Locomotive { old, new })
    }
}

impl Registries {
    /// Empty registries with the default latch mask and consist limit.
    pub fn new() -> Self {
        Self {
            locomotives: Vec::new(),
            turnouts: Vec::new(),
            routes: Vec::new(),
            sensors: Vec::new(),
            power: PowerState::Unknown,
            function_latch: DEFAULT_FUNCTION_LATCH,
            max_consist: MAX_CONSIST_SIZE,
        }
    }

    /// Latch mask given to locomotives created without roster labels.
    pub fn with_function_latch(mut self, mask: u32) -> Self {
        self.function_latch = mask;
        self
    }

    /// Locomotives a single control path may own.
    pub fn with_max_consist(mut self, n: usize) -> Self {
        self.max_consist = n.clamp(1, MAX_CONSIST_SIZE);
        self
    }

    // ========================================================================
    // Locomotives
    // ========================================================================

    /// Find a locomotive by address.
    pub fn locomotive(&self, id: u16) -> Option<&Locomotive> {
        self.locomotives.iter().find(|l| l.id == id)
    }

    fn loco_index(&self, id: u16) -> Option<usize> {
        self.locomotives.iter().position(|l| l.id == id)
    }

    /// Index of `id`, creating a fresh record on first reference.
    fn loco_index_or_create(&mut self, id: u16) -> usize {
        match self.loco_index(id) {
            Some(idx) => idx,
            None => {
                self.locomotives
                    .push(Locomotive::new(id).with_function_latch(self.function_latch));
                self.locomotives.len() - 1
            }
        }
    }

    /// Run `f` on the record for `id` (created if missing) and diff the result.
    fn mutate_loco(&mut self, id: u16, f: impl FnOnce(&mut Locomotive)) -> Option<Delta> {
        let existed = self.loco_index(id).is_some();
        let idx = self.loco_index_or_create(id);
        let old = existed.then(|| self.locomotives[idx].clone());
        f(&mut self.locomotives[idx]);
        loco_delta(old, Some(self.locomotives[idx].clone()))
    }

    /// Insert a roster entry or merge its descriptive fields into an existing
    /// record. Runtime state (speed, direction, ownership) is preserved.
    pub fn upsert_locomotive(&mut self, loco: Locomotive) -> Option<Delta> {
        match self.loco_index(loco.id) {
            Some(idx) => {
                let old = self.locomotives[idx].clone();
                let entry = &mut self.locomotives[idx];
                entry.address_type = loco.address_type;
                if !loco.name.is_empty() {
                    entry.name = loco.name;
                }
                if !loco.function_labels.is_empty() {
                    entry.function_labels = loco.function_labels;
                    entry.function_latch = loco.function_latch;
                }
                loco_delta(Some(old), Some(self.locomotives[idx].clone()))
            }
            None => {
                let new = loco.clone();
                self.locomotives.push(loco);
                loco_delta(None, Some(new))
            }
        }
    }

    /// Remove a locomotive entirely.
    pub fn remove_locomotive(&mut self, id: u16) -> Option<Delta> {
        let idx = self.loco_index(id)?;
        let old = self.locomotives.remove(idx);
        loco_delta(Some(old), None)
    }

    /// Drop every locomotive record (session teardown).
    pub fn clear_locomotives(&mut self) -> Vec<Delta> {
        self.locomotives
            .drain(..)
            .map(|old| Delta::Locomotive {
                old: Some(old),
                new: None,
            })
            .collect()
    }

    /// Locomotives in the requested order.
    pub fn list_locomotives(&self, order: ListOrder) -> Vec<&Locomotive> {
        let mut list: Vec<&Locomotive> = self.locomotives.iter().collect();
        match order {
            ListOrder::Insertion => {}
            ListOrder::ById => list.sort_by_key(|l| l.id),
            ListOrder::ByName => list.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id))),
        }
        list
    }

    /// Set speed (clamped to the estop sentinel..=126).
    pub fn set_speed(&mut self, id: u16, speed: i16) -> Option<Delta> {
        let speed = speed.clamp(ESTOP_SPEED, MAX_SPEED);
        self.mutate_loco(id, |l| l.speed = speed)
    }

    /// Set direction. `Unchanged` is a no-op; `Stop` also zeroes the speed
    /// while keeping the travel direction.
    pub fn set_direction(&mut self, id: u16, direction: Direction) -> Option<Delta> {
        match direction {
            Direction::Unchanged => None,
            Direction::Stop => self.mutate_loco(id, |l| l.speed = 0),
            dir => self.mutate_loco(id, |l| l.direction = dir),
        }
    }

    /// Set a single function bit.
    pub fn set_function(&mut self, id: u16, function: u8, on: bool) -> Option<Delta> {
        if function >= MAX_FUNCTIONS {
            return None;
        }
        self.mutate_loco(id, |l| {
            if on {
                l.functions |= 1 << function;
            } else {
                l.functions &= !(1 << function);
            }
        })
    }

    /// Replace the whole function bitmap.
    pub fn set_functions(&mut self, id: u16, mask: u32) -> Option<Delta> {
        let mask = mask & ((1 << MAX_FUNCTIONS) - 1);
        self.mutate_loco(id, |l| l.functions = mask)
    }

    /// Set the decoder speed-step mode.
    pub fn set_speed_steps(&mut self, id: u16, steps: u8) -> Option<Delta> {
        self.mutate_loco(id, |l| l.speed_steps = steps)
    }

    /// Mark function `function` latching or momentary.
    pub fn set_function_latching(&mut self, id: u16, function: u8, latching: bool) -> Option<Delta> {
        if function >= MAX_FUNCTIONS {
            return None;
        }
        self.mutate_loco(id, |l| {
            if latching {
                l.function_latch |= 1 << function;
            } else {
                l.function_latch &= !(1 << function);
            }
        })
    }

    /// Set the roster function labels (see [`Locomotive::with_function_labels`]).
    pub fn set_function_labels(&mut self, id: u16, labels: Vec<String>) -> Option<Delta> {
        self.mutate_loco(id, |l| {
            if !labels.is_empty() {
                l.function_labels = labels;
            }
        })
    }

    /// Set the WiThrottle multi-throttle number.
    pub fn set_throttle_nr(&mut self, id: u16, throttle_nr: u8) -> Option<Delta> {
        self.mutate_loco(id, |l| l.throttle_nr = throttle_nr)
    }

    /// Apply a full state broadcast from the command station.
    pub fn apply_loco_state(
        &mut self,
        id: u16,
        speed: i16,
        direction: Direction,
        functions: u32,
    ) -> Option<Delta> {
        let speed = speed.clamp(ESTOP_SPEED, MAX_SPEED);
        let functions = functions & ((1 << MAX_FUNCTIONS) - 1);
        self.mutate_loco(id, |l| {
            l.speed = speed;
            l.direction = direction.resolve(l.direction);
            l.functions = functions;
        })
    }

    /// Emergency-stop every known locomotive.
    pub fn estop_all(&mut self) -> Vec<Delta> {
        let ids: Vec<u16> = self.locomotives.iter().map(|l| l.id).collect();
        ids.into_iter()
            .filter_map(|id| self.set_speed(id, ESTOP_SPEED))
            .collect()
    }

    // ========================================================================
    // Ownership
    // ========================================================================

    /// Ids owned by `path`, in insertion order.
    pub fn owned_by(&self, path: ControlPath) -> Vec<u16> {
        self.locomotives
            .iter()
            .filter(|l| l.owner == Some(path))
            .map(|l| l.id)
            .collect()
    }

    fn check_consist(&self, id: u16, path: ControlPath) -> Result<(), RegistryError> {
        let held = self
            .locomotives
            .iter()
            .filter(|l| l.owner == Some(path) && l.id != id)
            .count();
        if held >= self.max_consist {
            Err(RegistryError::ConsistFull {
                path,
                limit: self.max_consist,
            })
        } else {
            Ok(())
        }
    }

    fn assign(loco: &mut Locomotive, path: ControlPath) {
        loco.owner = Some(path);
        loco.relay_slot = match path {
            ControlPath::Relay(slot) => Some(slot),
            _ => None,
        };
        if loco.pending_steal == Some(path) {
            loco.pending_steal = None;
        }
    }

    /// Claim `id` for `path`, creating the record on first reference.
    ///
    /// Claiming a locomotive the path already owns is a no-op.
    pub fn set_owner(&mut self, id: u16, path: ControlPath) -> Result<Option<Delta>, RegistryError> {
        if let Some(loco) = self.locomotive(id) {
            match loco.owner {
                Some(owner) if owner == path => return Ok(None),
                Some(owner) => return Err(RegistryError::AlreadyOwned { id, owner }),
                None => {}
            }
        }
        self.check_consist(id, path)?;
        Ok(self.mutate_loco(id, |l| Self::assign(l, path)))
    }

    /// Ask to take over `id`. Unowned locomotives are granted immediately.
    pub fn request_steal(&mut self, id: u16, path: ControlPath) -> Result<Claim, RegistryError> {
        let owner = self.locomotive(id).and_then(|l| l.owner);
        match owner {
            None => self.set_owner(id, path).map(Claim::Granted),
            Some(owner) if owner == path => Ok(Claim::Granted(None)),
            Some(_) => {
                self.check_consist(id, path)?;
                self.mutate_loco(id, |l| l.pending_steal = Some(path));
                Ok(Claim::PendingConfirmation)
            }
        }
    }

    /// Transfer `id` to the path waiting on it.
    pub fn confirm_steal(&mut self, id: u16) -> Result<Option<Delta>, RegistryError> {
        let loco = self
            .locomotive(id)
            .ok_or_else(|| RegistryError::NotFound(alloc::format!("locomotive {id}")))?;
        let path = loco.pending_steal.ok_or(RegistryError::NoPendingSteal(id))?;
        self.check_consist(id, path)?;
        Ok(self.mutate_loco(id, |l| Self::assign(l, path)))
    }

    /// Demote the current owner of `id` into a pending steal.
    ///
    /// Used when the command station refuses an acquisition that was applied
    /// optimistically: the path keeps its claim but loses control until the
    /// steal is confirmed.
    pub fn demote_to_pending(&mut self, id: u16) -> Option<Delta> {
        let owner = self.locomotive(id)?.owner?;
        self.mutate_loco(id, |l| {
            l.owner = None;
            l.relay_slot = None;
            l.pending_steal = Some(owner);
        })
    }

    /// Give up `id`. Also withdraws a pending steal held by `path`.
    pub fn release(&mut self, id: u16, path: ControlPath) -> Result<Option<Delta>, RegistryError> {
        let loco = self
            .locomotive(id)
            .ok_or_else(|| RegistryError::NotFound(alloc::format!("locomotive {id}")))?;
        if loco.owner == Some(path) {
            Ok(self.mutate_loco(id, |l| {
                l.owner = None;
                l.relay_slot = None;
            }))
        } else if loco.pending_steal == Some(path) {
            Ok(self.mutate_loco(id, |l| l.pending_steal = None))
        } else {
            Err(RegistryError::NotOwner { id, path })
        }
    }

    /// Clear ownership of `id` regardless of who holds it.
    pub fn force_release(&mut self, id: u16) -> Option<Delta> {
        self.loco_index(id)?;
        self.mutate_loco(id, |l| {
            l.owner = None;
            l.relay_slot = None;
            l.pending_steal = None;
        })
    }

    /// Release everything `path` owns or is waiting on.
    pub fn release_all(&mut self, path: ControlPath) -> Vec<Delta> {
        let ids: Vec<u16> = self
            .locomotives
            .iter()
            .filter(|l| l.owner == Some(path) || l.pending_steal == Some(path))
            .map(|l| l.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.release(id, path).ok().flatten())
            .collect()
    }

    // ========================================================================
    // Turnouts
    // ========================================================================

    /// Find a turnout by system name.
    pub fn turnout(&self, sys_name: &str) -> Option<&Turnout> {
        self.turnouts.iter().find(|t| t.sys_name == sys_name)
    }

    /// Insert or replace a turnout.
    pub fn upsert_turnout(&mut self, turnout: Turnout) -> Option<Delta> {
        match self.turnouts.iter().position(|t| t.sys_name == turnout.sys_name) {
            Some(idx) if self.turnouts[idx] == turnout => None,
            Some(idx) => {
                let old = core::mem::replace(&mut self.turnouts[idx], turnout.clone());
                Some(Delta::Turnout {
                    old: Some(old),
                    new: Some(turnout),
                })
            }
            None => {
                self.turnouts.push(turnout.clone());
                Some(Delta::Turnout {
                    old: None,
                    new: Some(turnout),
                })
            }
        }
    }

    /// Set a turnout's state, creating it if unknown.
    pub fn set_turnout_state(&mut self, sys_name: &str, state: TurnoutState) -> Option<Delta> {
        let turnout = match self.turnout(sys_name) {
            Some(existing) => existing.clone().with_state(state),
            None => Turnout::new(sys_name).with_state(state),
        };
        self.upsert_turnout(turnout)
    }

    /// Record a state confirmed by the command station and advance any
    /// route waiting on it.
    pub fn apply_turnout_confirmation(&mut self, sys_name: &str, state: TurnoutState) -> Vec<Delta> {
        let mut deltas: Vec<Delta> = self.set_turnout_state(sys_name, state).into_iter().collect();

        for route in self.routes.iter_mut() {
            let old = route.clone();
            if route.in_flight() {
                for (n, step) in route.steps.iter().enumerate() {
                    if route.pending & (1 << n) != 0 && step.turnout == sys_name && step.desired == state
                    {
                        route.pending &= !(1 << n);
                    }
                }
                if !route.in_flight() {
                    route.state = RouteState::Active;
                }
            } else if route.state == RouteState::Active
                && route
                    .steps
                    .iter()
                    .any(|step| step.turnout == sys_name && step.desired != state)
            {
                // A member moved away after completion
                route.state = RouteState::Inconsistent;
            }
            if route.state != old.state {
                deltas.push(Delta::Route {
                    old: Some(old),
                    new: Some(route.clone()),
                });
            }
        }
        deltas
    }

    /// Remove a turnout.
    pub fn remove_turnout(&mut self, sys_name: &str) -> Option<Delta> {
        let idx = self.turnouts.iter().position(|t| t.sys_name == sys_name)?;
        Some(Delta::Turnout {
            old: Some(self.turnouts.remove(idx)),
            new: None,
        })
    }

    /// Turnouts in the requested order.
    pub fn list_turnouts(&self, order: ListOrder) -> Vec<&Turnout> {
        let mut list: Vec<&Turnout> = self.turnouts.iter().collect();
        match order {
            ListOrder::Insertion => {}
            ListOrder::ById => list.sort_by(|a, b| a.sys_name.cmp(&b.sys_name)),
            ListOrder::ByName => list.sort_by(|a, b| {
                a.user_name
                    .cmp(&b.user_name)
                    .then(a.sys_name.cmp(&b.sys_name))
            }),
        }
        list
    }

    // ========================================================================
    // Routes
    // ========================================================================

    /// Find a route by system name.
    pub fn route(&self, sys_name: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.sys_name == sys_name)
    }

    /// Insert a route or update its name and state. Locally known steps are
    /// kept when the update carries none.
    pub fn upsert_route(&mut self, mut route: Route) -> Option<Delta> {
        match self.routes.iter().position(|r| r.sys_name == route.sys_name) {
            Some(idx) => {
                let existing = &self.routes[idx];
                if route.steps.is_empty() {
                    route.steps = existing.steps.clone();
                }
                route.pending = existing.pending;
                if *existing == route {
                    return None;
                }
                let old = core::mem::replace(&mut self.routes[idx], route.clone());
                Some(Delta::Route {
                    old: Some(old),
                    new: Some(route),
                })
            }
            None => {
                route.pending = 0;
                self.routes.push(route.clone());
                Some(Delta::Route {
                    old: None,
                    new: Some(route),
                })
            }
        }
    }

    /// Set a route's state, creating it if unknown.
    pub fn set_route_state(&mut self, sys_name: &str, state: RouteState) -> Option<Delta> {
        let route = match self.route(sys_name) {
            Some(existing) => existing.clone().with_state(state),
            None => Route::new(sys_name).with_state(state),
        };
        self.upsert_route(route)
    }

    /// Start a local route execution: returns its steps in order and marks
    /// each one pending.
    ///
    /// A route that was in a known state drops back to `Unknown`, returned
    /// as the second element; it becomes `Active` again only once every
    /// step has been confirmed.
    pub fn begin_route(&mut self, sys_name: &str) -> Result<(Vec<RouteStep>, Option<Delta>), RegistryError> {
        let route = self
            .routes
            .iter_mut()
            .find(|r| r.sys_name == sys_name)
            .ok_or_else(|| RegistryError::NotFound(alloc::format!("route {sys_name}")))?;
        let old = route.clone();
        let n = route.steps.len();
        route.pending = if n >= 32 { u32::MAX } else { (1u32 << n) - 1 };
        let reset = (route.state != RouteState::Unknown).then(|| {
            route.state = RouteState::Unknown;
            Delta::Route {
                old: Some(old),
                new: Some(route.clone()),
            }
        });
        Ok((route.steps.iter().cloned().collect(), reset))
    }

    /// Remove a route.
    pub fn remove_route(&mut self, sys_name: &str) -> Option<Delta> {
        let idx = self.routes.iter().position(|r| r.sys_name == sys_name)?;
        Some(Delta::Route {
            old: Some(self.routes.remove(idx)),
            new: None,
        })
    }

    /// Routes in the requested order.
    pub fn list_routes(&self, order: ListOrder) -> Vec<&Route> {
        let mut list: Vec<&Route> = self.routes.iter().collect();
        match order {
            ListOrder::Insertion => {}
            ListOrder::ById => list.sort_by(|a, b| a.sys_name.cmp(&b.sys_name)),
            ListOrder::ByName => list.sort_by(|a, b| {
                a.user_name
                    .cmp(&b.user_name)
                    .then(a.sys_name.cmp(&b.sys_name))
            }),
        }
        list
    }

    // ========================================================================
    // Sensors and power
    // ========================================================================

    /// Find a sensor.
    pub fn sensor(&self, id: u16) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.id == id)
    }

    /// Record a sensor reading, creating the sensor on first report.
    pub fn set_sensor(&mut self, id: u16, value: SensorValue) -> Option<Delta> {
        match self.sensors.iter_mut().find(|s| s.id == id) {
            Some(sensor) if sensor.value == value => None,
            Some(sensor) => {
                let old = core::mem::replace(&mut sensor.value, value);
                Some(Delta::Sensor {
                    id,
                    old: Some(old),
                    new: Some(value),
                })
            }
            None => {
                self.sensors.push(Sensor { id, value });
                Some(Delta::Sensor {
                    id,
                    old: None,
                    new: Some(value),
                })
            }
        }
    }

    /// Remove a sensor.
    pub fn remove_sensor(&mut self, id: u16) -> Option<Delta> {
        let idx = self.sensors.iter().position(|s| s.id == id)?;
        let old = self.sensors.remove(idx);
        Some(Delta::Sensor {
            id,
            old: Some(old.value),
            new: None,
        })
    }

    /// Sensors in the requested order (`ByName` falls back to id).
    pub fn list_sensors(&self, order: ListOrder) -> Vec<&Sensor> {
        let mut list: Vec<&Sensor> = self.sensors.iter().collect();
        if order != ListOrder::Insertion {
            list.sort_by_key(|s| s.id);
        }
        list
    }

    /// Track power.
    pub fn power(&self) -> PowerState {
        self.power
    }

    /// Set track power.
    pub fn set_power(&mut self, state: PowerState) -> Option<Delta> {
        if self.power == state {
            return None;
        }
        let old = core::mem::replace(&mut self.power, state);
        Some(Delta::Power { old, new: state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reference_creates_locomotive() {
        let mut reg = Registries::new();
        let delta = reg.set_speed(1234, 40).unwrap();
        match delta {
            Delta::Locomotive { old: None, new: Some(l) } => {
                assert_eq!(l.id, 1234);
                assert_eq!(l.speed, 40);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unchanged_value_produces_no_delta() {
        let mut reg = Registries::new();
        reg.set_speed(3, 10);
        assert!(reg.set_speed(3, 10).is_none());
        assert!(reg.set_direction(3, Direction::Unchanged).is_none());
        reg.set_power(PowerState::On);
        assert!(reg.set_power(PowerState::On).is_none());
    }

    #[test]
    fn speed_clamps_to_range() {
        let mut reg = Registries::new();
        reg.set_speed(3, 500);
        assert_eq!(reg.locomotive(3).unwrap().speed, MAX_SPEED);
        reg.set_speed(3, -9);
        assert_eq!(reg.locomotive(3).unwrap().speed, ESTOP_SPEED);
    }

    #[test]
    fn stop_direction_keeps_travel_direction() {
        let mut reg = Registries::new();
        reg.set_direction(3, Direction::Reverse);
        reg.set_speed(3, 50);
        reg.set_direction(3, Direction::Stop);
        let loco = reg.locomotive(3).unwrap();
        assert_eq!(loco.speed, 0);
        assert_eq!(loco.direction, Direction::Reverse);
    }

    #[test]
    fn second_owner_is_rejected() {
        let mut reg = Registries::new();
        reg.set_owner(3, ControlPath::Local).unwrap();
        assert_eq!(
            reg.set_owner(3, ControlPath::Relay(1)),
            Err(RegistryError::AlreadyOwned {
                id: 3,
                owner: ControlPath::Local
            })
        );
        assert_eq!(reg.set_owner(3, ControlPath::Local), Ok(None));
    }

    #[test]
    fn relay_slot_tracks_owner() {
        let mut reg = Registries::new();
        reg.set_owner(3, ControlPath::Relay(2)).unwrap();
        assert_eq!(reg.locomotive(3).unwrap().relay_slot, Some(2));
        reg.release(3, ControlPath::Relay(2)).unwrap();
        assert_eq!(reg.locomotive(3).unwrap().relay_slot, None);
    }

    #[test]
    fn steal_of_unowned_is_granted() {
        let mut reg = Registries::new();
        let claim = reg.request_steal(7, ControlPath::Local).unwrap();
        assert!(matches!(claim, Claim::Granted(Some(_))));
        assert_eq!(reg.locomotive(7).unwrap().owner, Some(ControlPath::Local));
    }

    #[test]
    fn confirm_without_pending_fails() {
        let mut reg = Registries::new();
        reg.set_owner(7, ControlPath::Local).unwrap();
        assert_eq!(reg.confirm_steal(7), Err(RegistryError::NoPendingSteal(7)));
        assert!(matches!(reg.confirm_steal(8), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn release_by_non_owner_fails() {
        let mut reg = Registries::new();
        reg.set_owner(7, ControlPath::Local).unwrap();
        assert_eq!(
            reg.release(7, ControlPath::Relay(0)),
            Err(RegistryError::NotOwner {
                id: 7,
                path: ControlPath::Relay(0)
            })
        );
    }

    #[test]
    fn consist_limit() {
        let mut reg = Registries::new().with_max_consist(2);
        reg.set_owner(1, ControlPath::Local).unwrap();
        reg.set_owner(2, ControlPath::Local).unwrap();
        assert!(matches!(
            reg.set_owner(3, ControlPath::Local),
            Err(RegistryError::ConsistFull { limit: 2, .. })
        ));
        // Re-claiming an owned loco is not counted twice.
        assert_eq!(reg.set_owner(2, ControlPath::Local), Ok(None));
    }

    #[test]
    fn release_all_clears_owner_and_pending() {
        let mut reg = Registries::new();
        reg.set_owner(1, ControlPath::Relay(0)).unwrap();
        reg.set_owner(2, ControlPath::Relay(0)).unwrap();
        reg.set_owner(3, ControlPath::Local).unwrap();
        reg.request_steal(3, ControlPath::Relay(0)).unwrap();

        let deltas = reg.release_all(ControlPath::Relay(0));
        assert_eq!(deltas.len(), 3);
        assert!(reg.owned_by(ControlPath::Relay(0)).is_empty());
        assert_eq!(reg.locomotive(3).unwrap().pending_steal, None);
        assert_eq!(reg.locomotive(3).unwrap().owner, Some(ControlPath::Local));
    }

    #[test]
    fn demote_moves_owner_to_pending() {
        let mut reg = Registries::new();
        reg.set_owner(5, ControlPath::Local).unwrap();
        reg.demote_to_pending(5).unwrap();
        let loco = reg.locomotive(5).unwrap();
        assert_eq!(loco.owner, None);
        assert_eq!(loco.pending_steal, Some(ControlPath::Local));
        reg.confirm_steal(5).unwrap();
        assert_eq!(reg.locomotive(5).unwrap().owner, Some(ControlPath::Local));
    }

    #[test]
    fn upsert_preserves_runtime_state() {
        let mut reg = Registries::new();
        reg.set_owner(3, ControlPath::Local).unwrap();
        reg.set_speed(3, 20);
        reg.upsert_locomotive(Locomotive::new(3).with_name("Shunter"));
        let loco = reg.locomotive(3).unwrap();
        assert_eq!(loco.name.as_str(), "Shunter");
        assert_eq!(loco.speed, 20);
        assert_eq!(loco.owner, Some(ControlPath::Local));
    }

    #[test]
    fn route_completes_out_of_order() {
        let mut reg = Registries::new();
        let route = Route::new("IR1")
            .with_step("LT1", TurnoutState::Thrown)
            .unwrap()
            .with_step("LT2", TurnoutState::Closed)
            .unwrap()
            .with_step("LT3", TurnoutState::Thrown)
            .unwrap();
        reg.upsert_route(route);

        let (steps, reset) = reg.begin_route("IR1").unwrap();
        assert_eq!(steps.len(), 3);
        assert!(reset.is_none());
        assert_eq!(reg.route("IR1").unwrap().state, RouteState::Unknown);

        reg.apply_turnout_confirmation("LT3", TurnoutState::Thrown);
        reg.apply_turnout_confirmation("LT1", TurnoutState::Thrown);
        // Wrong state does not count.
        reg.apply_turnout_confirmation("LT2", TurnoutState::Thrown);
        assert_eq!(reg.route("IR1").unwrap().state, RouteState::Unknown);

        let deltas = reg.apply_turnout_confirmation("LT2", TurnoutState::Closed);
        assert!(deltas.iter().any(|d| matches!(d, Delta::Route { .. })));
        assert_eq!(reg.route("IR1").unwrap().state, RouteState::Active);
    }

    #[test]
    fn moved_member_makes_route_inconsistent() {
        let mut reg = Registries::new();
        let route = Route::new("IR1")
            .with_step("LT1", TurnoutState::Thrown)
            .unwrap()
            .with_step("LT2", TurnoutState::Closed)
            .unwrap();
        reg.upsert_route(route);
        reg.begin_route("IR1").unwrap();
        reg.apply_turnout_confirmation("LT1", TurnoutState::Thrown);
        reg.apply_turnout_confirmation("LT2", TurnoutState::Closed);
        assert_eq!(reg.route("IR1").unwrap().state, RouteState::Active);

        // Confirming a state the route already wants changes nothing.
        assert!(reg
            .apply_turnout_confirmation("LT1", TurnoutState::Thrown)
            .is_empty());

        let deltas = reg.apply_turnout_confirmation("LT1", TurnoutState::Closed);
        assert!(deltas.iter().any(|d| matches!(
            d,
            Delta::Route { new: Some(r), .. } if r.state == RouteState::Inconsistent
        )));
        assert_eq!(reg.route("IR1").unwrap().state, RouteState::Inconsistent);
    }

    #[test]
    fn rerun_resets_state_until_confirmed() {
        let mut reg = Registries::new();
        let route = Route::new("IR1")
            .with_step("LT1", TurnoutState::Thrown)
            .unwrap()
            .with_step("LT2", TurnoutState::Closed)
            .unwrap();
        reg.upsert_route(route);
        reg.begin_route("IR1").unwrap();
        reg.apply_turnout_confirmation("LT1", TurnoutState::Thrown);
        reg.apply_turnout_confirmation("LT2", TurnoutState::Closed);
        assert_eq!(reg.route("IR1").unwrap().state, RouteState::Active);

        let (_, reset) = reg.begin_route("IR1").unwrap();
        assert!(matches!(
            reset,
            Some(Delta::Route { new: Some(ref r), .. }) if r.state == RouteState::Unknown
        ));
        assert_eq!(reg.route("IR1").unwrap().state, RouteState::Unknown);

        reg.apply_turnout_confirmation("LT2", TurnoutState::Closed);
        assert_eq!(reg.route("IR1").unwrap().state, RouteState::Unknown);
        reg.apply_turnout_confirmation("LT1", TurnoutState::Thrown);
        assert_eq!(reg.route("IR1").unwrap().state, RouteState::Active);
    }

    #[test]
    fn begin_unknown_route_fails() {
        let mut reg = Registries::new();
        assert!(matches!(reg.begin_route("IR9"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn list_orders() {
        let mut reg = Registries::new();
        reg.upsert_turnout(Turnout::new("LT9").with_user_name("Alpha"));
        reg.upsert_turnout(Turnout::new("LT1").with_user_name("Zulu"));
        let by_insert: Vec<&str> = reg
            .list_turnouts(ListOrder::Insertion)
            .iter()
            .map(|t| t.sys_name.as_str())
            .collect();
        assert_eq!(by_insert, ["LT9", "LT1"]);
        let by_id: Vec<&str> = reg
            .list_turnouts(ListOrder::ById)
            .iter()
            .map(|t| t.sys_name.as_str())
            .collect();
        assert_eq!(by_id, ["LT1", "LT9"]);
        let by_name: Vec<&str> = reg
            .list_turnouts(ListOrder::ByName)
            .iter()
            .map(|t| t.user_name.as_str())
            .collect();
        assert_eq!(by_name, ["Alpha", "Zulu"]);
    }

    #[test]
    fn sensor_created_on_first_report() {
        let mut reg = Registries::new();
        assert!(reg.sensor(5).is_none());
        assert!(reg.set_sensor(5, SensorValue::On).is_some());
        assert!(reg.set_sensor(5, SensorValue::On).is_none());
        assert_eq!(reg.sensor(5).unwrap().value, SensorValue::On);
    }

    #[test]
    fn functions_masked_to_range() {
        let mut reg = Registries::new();
        reg.set_functions(3, u32::MAX);
        assert_eq!(reg.locomotive(3).unwrap().functions, (1 << 30) - 1);
        assert!(reg.set_function(3, 30, true).is_none());
    }
}
