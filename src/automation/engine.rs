//! Cooperative scheduler over a fixed process table.
//!
//! Each [`AutomationEngine::tick`] first frees every `terminating` slot, then
//! gives each running process a turn. A turn executes instructions until the
//! process blocks (`delay`, `sleep`, `key`, `waitfor`, `runfg`), finishes, or
//! spends its per-tick instruction budget, in which case it yields at the
//! line boundary and resumes on the next tick. Instructions never span
//! ticks, so a stopped process is never caught halfway through a registry
//! mutation.
//!
//! The engine reaches the rest of the bridge through an
//! [`AutomationContext`]: intents go out through it, predicates are
//! evaluated against it, and scripts are loaded from it.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::process::{Frame, Process, ProcessState, Wait};
use super::script::{Condition, Expr, Op, Operand, Script, SetTarget};
use crate::commands::{Intent, IntentOutcome};
use crate::config::AutomationConfig;
use crate::entities::{PowerState, RouteState, SensorValue, TurnoutState};
use crate::error::{AutomationError, SessionError};
use crate::traits::PinMode;

/// Everything the engine needs from the outside world.
pub trait AutomationContext {
    /// Submit an intent on behalf of process `pid`.
    fn submit(&mut self, pid: u8, intent: Intent) -> Result<IntentOutcome, SessionError>;

    /// Current sensor reading.
    fn sensor(&self, id: u16) -> SensorValue;

    /// Current turnout state.
    fn turnout_state(&self, sys_name: &str) -> TurnoutState;

    /// Current route state.
    fn route_state(&self, sys_name: &str) -> RouteState;

    /// Current track power.
    fn power(&self) -> PowerState;

    /// Configure a hardware line.
    fn configure_pin(&mut self, pin: u8, mode: PinMode);

    /// Load and parse the script called `name`.
    fn load_script(&mut self, name: &str) -> Result<Script, AutomationError>;

    /// Called when a slot is freed.
    fn on_process_exit(&mut self, _pid: u8) {}
}

/// One executed line, recorded for tracing processes.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceLine {
    /// Process slot.
    pub pid: u8,
    /// Script name.
    pub script: String,
    /// Source line.
    pub line: u16,
    /// Source text.
    pub text: String,
    /// When it ran.
    pub at_ms: u64,
}

enum Flow {
    Continue,
    Block,
    Finish,
}

/// The script scheduler.
pub struct AutomationEngine {
    processes: Vec<Process>,
    stack_depth: usize,
    steps_per_tick: usize,
    variables: BTreeMap<String, i32>,
    scripts: BTreeMap<String, Arc<Script>>,
    trace: VecDeque<TraceLine>,
    trace_capacity: usize,
}

impl AutomationEngine {
    /// Create an engine with an empty process table.
    pub fn new(config: &AutomationConfig) -> Self {
        let slots = config.max_processes.clamp(1, usize::from(u8::MAX));
        Self {
            processes: (0..slots).map(|pid| Process::empty(pid as u8)).collect(),
            stack_depth: config.stack_depth.clamp(1, crate::config::MAX_STACK_DEPTH),
            steps_per_tick: config.steps_per_tick.max(1),
            variables: BTreeMap::new(),
            scripts: BTreeMap::new(),
            trace: VecDeque::new(),
            trace_capacity: config.trace_capacity,
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Process slot `pid`.
    pub fn process(&self, pid: u8) -> Option<&Process> {
        self.processes.get(usize::from(pid))
    }

    /// All slots, free ones included.
    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    /// Number of slots not free.
    pub fn live_count(&self) -> usize {
        self.processes
            .iter()
            .filter(|p| p.state != ProcessState::Free)
            .count()
    }

    /// Value of a named variable (0 if unset).
    pub fn variable(&self, name: &str) -> i32 {
        self.variables.get(name).copied().unwrap_or(0)
    }

    /// Set a named variable.
    pub fn set_variable(&mut self, name: &str, value: i32) {
        self.variables.insert(name.to_string(), value);
    }

    /// Recorded trace lines, oldest first.
    pub fn trace(&self) -> impl Iterator<Item = &TraceLine> {
        self.trace.iter()
    }

    /// Take the recorded trace.
    pub fn drain_trace(&mut self) -> Vec<TraceLine> {
        self.trace.drain(..).collect()
    }

    /// Drop a cached script so the next spawn reloads it.
    pub fn forget_script(&mut self, name: &str) -> bool {
        self.scripts.remove(name).is_some()
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Start the script called `name` in a free slot.
    ///
    /// The script is loaded and resolved before a slot is touched, so a
    /// script that fails to load never reaches `running`.
    ///
    /// # Errors
    ///
    /// Load failures from the context, or [`AutomationError::TableFull`].
    pub fn spawn<C: AutomationContext>(
        &mut self,
        name: &str,
        now_ms: u64,
        ctx: &mut C,
        tracing: bool,
    ) -> Result<u8, AutomationError> {
        self.spawn_at_depth(name, now_ms, ctx, tracing, 0)
    }

    /// Ask a process to stop, together with its foreground children.
    ///
    /// The slot becomes `terminating` now and `free` at the next tick.
    ///
    /// # Errors
    ///
    /// [`AutomationError::NoSuchProcess`] if the slot is free.
    pub fn stop(&mut self, pid: u8) -> Result<(), AutomationError> {
        match self.process(pid).map(Process::state) {
            None | Some(ProcessState::Free) => Err(AutomationError::NoSuchProcess(pid)),
            Some(_) => {
                self.stop_chain(pid);
                Ok(())
            }
        }
    }

    /// Stop every process.
    pub fn stop_all(&mut self) {
        for p in &mut self.processes {
            if p.state != ProcessState::Free {
                p.state = ProcessState::Terminating;
            }
        }
    }

    /// Deliver an input key; wakes every process waiting on it.
    ///
    /// Returns the number of processes woken.
    pub fn inject_key(&mut self, key: char) -> usize {
        let mut woken = 0;
        for p in &mut self.processes {
            if p.state.is_active() && p.wait == Some(Wait::Key(key)) {
                p.wait = None;
                woken += 1;
            }
        }
        woken
    }

    /// Run one scheduler tick.
    ///
    /// Returns the failures that terminated processes during this tick.
    pub fn tick<C: AutomationContext>(&mut self, now_ms: u64, ctx: &mut C) -> Vec<(u8, AutomationError)> {
        for idx in 0..self.processes.len() {
            if self.processes[idx].state == ProcessState::Terminating {
                self.processes[idx].reset();
                log::debug!("[automation] process {} freed", idx);
                ctx.on_process_exit(idx as u8);
            }
        }

        let mut failures = Vec::new();
        for idx in 0..self.processes.len() {
            if !self.processes[idx].state.is_active() {
                continue;
            }
            if let Err(err) = self.run(idx, now_ms, ctx) {
                let p = &mut self.processes[idx];
                log::warn!(
                    "[automation] process {} ({}) failed: {}",
                    idx,
                    p.script_name().unwrap_or("?"),
                    err
                );
                p.state = ProcessState::Terminating;
                p.error = Some(err.clone());
                self.stop_children(idx);
                failures.push((idx as u8, err));
            }
        }
        failures
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    fn spawn_at_depth<C: AutomationContext>(
        &mut self,
        name: &str,
        now_ms: u64,
        ctx: &mut C,
        tracing: bool,
        base_depth: usize,
    ) -> Result<u8, AutomationError> {
        let script = match self.scripts.get(name) {
            Some(script) => script.clone(),
            None => {
                let script = Arc::new(ctx.load_script(name)?);
                self.scripts.insert(name.to_string(), script.clone());
                script
            }
        };
        let slot = self
            .processes
            .iter_mut()
            .find(|p| p.state == ProcessState::Free)
            .ok_or(AutomationError::TableFull)?;
        slot.start(script, now_ms, tracing, base_depth);
        log::info!("[automation] process {} started `{}`", slot.id, name);
        Ok(slot.id)
    }

    fn stop_chain(&mut self, pid: u8) {
        let idx = usize::from(pid);
        if let Some(p) = self.processes.get_mut(idx) {
            if p.state != ProcessState::Free {
                p.state = ProcessState::Terminating;
                log::info!("[automation] process {} stopping", pid);
            }
        }
        self.stop_children(idx);
    }

    fn stop_children(&mut self, idx: usize) {
        let children: Vec<(u8, u32)> = self.processes[idx]
            .stack
            .iter()
            .filter_map(|frame| match *frame {
                Frame::Foreground { child, generation } => Some((child, generation)),
                Frame::Loop { .. } => None,
            })
            .collect();
        for (child, generation) in children {
            if self.processes[usize::from(child)].generation == generation {
                self.stop_chain(child);
            }
        }
    }

    fn satisfied<C: AutomationContext>(&self, wait: &Wait, now_ms: u64, ctx: &C) -> bool {
        match wait {
            Wait::Until(deadline) => now_ms >= *deadline,
            Wait::Key(_) => false,
            Wait::Condition(cond) => match cond {
                Condition::Sensor { id, value } => ctx.sensor(*id) == *value,
                Condition::Turnout { sys_name, state } => ctx.turnout_state(sys_name) == *state,
                Condition::Route { sys_name, state } => ctx.route_state(sys_name) == *state,
                Condition::Power(state) => ctx.power() == *state,
            },
            Wait::Child { pid, generation } => {
                let child = &self.processes[usize::from(*pid)];
                child.generation != *generation || !child.state.is_active()
            }
        }
    }

    fn run<C: AutomationContext>(&mut self, idx: usize, now_ms: u64, ctx: &mut C) -> Result<(), AutomationError> {
        if let Some(wait) = self.processes[idx].wait.clone() {
            if !self.satisfied(&wait, now_ms, &*ctx) {
                return Ok(());
            }
            let p = &mut self.processes[idx];
            p.wait = None;
            if let Wait::Child { .. } = wait {
                p.stack.pop();
            }
        }

        for _ in 0..self.steps_per_tick {
            let p = &mut self.processes[idx];
            if !p.state.is_active() {
                return Ok(());
            }
            let Some(script) = p.script.clone() else {
                p.state = ProcessState::Terminating;
                return Ok(());
            };
            let Some(instr) = script.get(p.pc) else {
                log::info!("[automation] process {} finished `{}`", idx, script.name());
                p.state = ProcessState::Terminating;
                return Ok(());
            };
            if p.state == ProcessState::Tracing {
                self.record(idx, &script, instr.line, &instr.text, now_ms);
            }
            self.processes[idx].pc += 1;

            match self.execute(idx, &instr.op, now_ms, ctx)? {
                Flow::Continue => {}
                Flow::Block => return Ok(()),
                Flow::Finish => {
                    log::info!("[automation] process {} exited `{}`", idx, script.name());
                    self.processes[idx].state = ProcessState::Terminating;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn record(&mut self, idx: usize, script: &Script, line: u16, text: &str, now_ms: u64) {
        log::info!("[automation] {}:{}:{} {}", idx, script.name(), line, text);
        if self.trace_capacity == 0 {
            return;
        }
        if self.trace.len() >= self.trace_capacity {
            self.trace.pop_front();
        }
        self.trace.push_back(TraceLine {
            pid: idx as u8,
            script: script.name().to_string(),
            line,
            text: text.to_string(),
            at_ms: now_ms,
        });
    }

    // ========================================================================
    // Instructions
    // ========================================================================

    fn value(&self, idx: usize, operand: &Operand) -> i32 {
        match operand {
            Operand::Literal(n) => *n,
            Operand::Register(r) => self.processes[idx].registers[usize::from(*r)],
            Operand::Variable(name) => self.variable(name),
        }
    }

    fn block(&mut self, idx: usize, wait: Wait) -> Flow {
        self.processes[idx].wait = Some(wait);
        Flow::Block
    }

    fn submit<C: AutomationContext>(idx: usize, intent: Intent, ctx: &mut C) {
        let kind = intent.kind();
        match ctx.submit(idx as u8, intent) {
            Ok(IntentOutcome::Rejected(reason)) => {
                log::debug!("[automation] process {} {:?} rejected: {:?}", idx, kind, reason);
            }
            Ok(_) => {}
            Err(err) => log::warn!("[automation] process {} {:?} not sent: {}", idx, kind, err),
        }
    }

    fn execute<C: AutomationContext>(
        &mut self,
        idx: usize,
        op: &Op,
        now_ms: u64,
        ctx: &mut C,
    ) -> Result<Flow, AutomationError> {
        let flow = match op {
            Op::Rem => Flow::Continue,
            Op::Exit => Flow::Finish,
            Op::Key(key) => self.block(idx, Wait::Key(*key)),
            Op::Delay(ms) => {
                let ms = self.value(idx, ms).max(0) as u64;
                self.block(idx, Wait::Until(now_ms.saturating_add(ms)))
            }
            Op::Sleep(ms) => {
                let ms = self.value(idx, ms).max(0) as u64;
                let deadline = self.processes[idx].started_ms.saturating_add(ms);
                if deadline <= now_ms {
                    Flow::Continue
                } else {
                    self.block(idx, Wait::Until(deadline))
                }
            }
            Op::WaitFor(cond) => {
                let wait = Wait::Condition(cond.clone());
                if self.satisfied(&wait, now_ms, &*ctx) {
                    Flow::Continue
                } else {
                    self.block(idx, wait)
                }
            }
            Op::Goto { target, count: None, .. } => {
                self.processes[idx].pc = *target;
                Flow::Continue
            }
            Op::Goto {
                target,
                count: Some(count),
                ..
            } => {
                self.counted_goto(idx, *target, count)?;
                Flow::Continue
            }
            Op::Run { script, foreground } => self.run_child(idx, script, *foreground, now_ms, ctx)?,
            Op::Power(state) => {
                Self::submit(
                    idx,
                    Intent::SetPower {
                        state: *state,
                        district: None,
                    },
                    ctx,
                );
                Flow::Continue
            }
            Op::Route(sys_name) => {
                Self::submit(idx, Intent::RunRoute { sys_name: sys_name.clone() }, ctx);
                Flow::Continue
            }
            Op::Turnout { sys_name, action } => {
                Self::submit(
                    idx,
                    Intent::SetTurnout {
                        sys_name: sys_name.clone(),
                        action: *action,
                    },
                    ctx,
                );
                Flow::Continue
            }
            Op::SendCmd(line) => {
                Self::submit(idx, Intent::Raw(line.clone()), ctx);
                Flow::Continue
            }
            Op::ConfigPin { pin, mode } => {
                ctx.configure_pin(*pin, *mode);
                Flow::Continue
            }
            Op::Set { target, expr } => {
                let value = match expr {
                    Expr::Value(v) => self.value(idx, v),
                    Expr::Binary(a, op, b) => op.apply(self.value(idx, a), self.value(idx, b)),
                };
                match target {
                    SetTarget::Register(r) => self.processes[idx].registers[usize::from(*r)] = value,
                    SetTarget::Variable(name) => self.set_variable(name, value),
                }
                Flow::Continue
            }
        };
        Ok(flow)
    }

    /// `goto label n` jumps `n` times, then falls through.
    fn counted_goto(&mut self, idx: usize, target: usize, count: &Operand) -> Result<(), AutomationError> {
        let count = self.value(idx, count);
        let limit = self.stack_depth;
        let p = &mut self.processes[idx];
        let here = p.pc - 1;

        let existing = p
            .stack
            .iter()
            .rposition(|f| matches!(f, Frame::Loop { pc, .. } if *pc == here));
        if let Some(pos) = existing {
            // Loops entered after this one were left by a plain goto
            p.stack.truncate(pos + 1);
            if let Some(Frame::Loop { remaining, .. }) = p.stack.last_mut() {
                if *remaining > 0 {
                    *remaining -= 1;
                    p.pc = target;
                    return Ok(());
                }
            }
            p.stack.pop();
            return Ok(());
        }

        if count <= 0 {
            return Ok(());
        }
        p.push(
            Frame::Loop {
                pc: here,
                remaining: count - 1,
            },
            limit,
        )?;
        p.pc = target;
        Ok(())
    }

    fn run_child<C: AutomationContext>(
        &mut self,
        idx: usize,
        name: &str,
        foreground: bool,
        now_ms: u64,
        ctx: &mut C,
    ) -> Result<Flow, AutomationError> {
        let tracing = self.processes[idx].state == ProcessState::Tracing;
        if !foreground {
            self.spawn_at_depth(name, now_ms, ctx, tracing, 0)?;
            return Ok(Flow::Continue);
        }

        // Reserve the frame first so an overflow never leaves an orphan child
        let limit = self.stack_depth;
        let placeholder = Frame::Foreground {
            child: u8::MAX,
            generation: 0,
        };
        self.processes[idx].push(placeholder, limit)?;
        let depth = self.processes[idx].depth();
        let child = match self.spawn_at_depth(name, now_ms, ctx, tracing, depth) {
            Ok(child) => child,
            Err(err) => {
                self.processes[idx].stack.pop();
                return Err(err);
            }
        };
        let generation = self.processes[usize::from(child)].generation;
        if let Some(top) = self.processes[idx].stack.last_mut() {
            *top = Frame::Foreground { child, generation };
        }
        Ok(self.block(idx, Wait::Child { pid: child, generation }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::TurnoutAction;
    use crate::entities::sys_name;
    use alloc::vec;

    #[derive(Default)]
    struct TestContext {
        scripts: BTreeMap<String, String>,
        submitted: Vec<(u8, Intent)>,
        sensors: BTreeMap<u16, SensorValue>,
        power: PowerState,
        pins: Vec<(u8, PinMode)>,
        exited: Vec<u8>,
    }

    impl TestContext {
        fn with(mut self, name: &str, text: &str) -> Self {
            self.scripts.insert(name.into(), text.into());
            self
        }
    }

    impl AutomationContext for TestContext {
        fn submit(&mut self, pid: u8, intent: Intent) -> Result<IntentOutcome, SessionError> {
            self.submitted.push((pid, intent));
            Ok(IntentOutcome::applied(Vec::new()))
        }

        fn sensor(&self, id: u16) -> SensorValue {
            self.sensors.get(&id).copied().unwrap_or_default()
        }

        fn turnout_state(&self, _sys_name: &str) -> TurnoutState {
            TurnoutState::Unknown
        }

        fn route_state(&self, _sys_name: &str) -> RouteState {
            RouteState::Unknown
        }

        fn power(&self) -> PowerState {
            self.power
        }

        fn configure_pin(&mut self, pin: u8, mode: PinMode) {
            self.pins.push((pin, mode));
        }

        fn load_script(&mut self, name: &str) -> Result<Script, AutomationError> {
            let text = self
                .scripts
                .get(name)
                .ok_or_else(|| AutomationError::ScriptNotFound(name.into()))?;
            Script::parse(name, text)
        }

        fn on_process_exit(&mut self, pid: u8) {
            self.exited.push(pid);
        }
    }

    fn engine() -> AutomationEngine {
        AutomationEngine::new(&AutomationConfig::default())
    }

    #[test]
    fn unresolved_label_never_runs() {
        let mut ctx = TestContext::default().with("bad", "throw LT1\ngoto missing");
        let mut engine = engine();
        let err = engine.spawn("bad", 0, &mut ctx, false).unwrap_err();
        assert!(matches!(err, AutomationError::UnresolvedLabel { .. }));
        assert_eq!(engine.live_count(), 0);
        engine.tick(0, &mut ctx);
        assert!(ctx.submitted.is_empty());
    }

    #[test]
    fn missing_script() {
        let mut ctx = TestContext::default();
        assert_eq!(
            engine().spawn("nope", 0, &mut ctx, false),
            Err(AutomationError::ScriptNotFound("nope".into()))
        );
    }

    #[test]
    fn table_full() {
        let mut ctx = TestContext::default().with("idle", "key x");
        let mut engine = AutomationEngine::new(&AutomationConfig::default().with_max_processes(2));
        engine.spawn("idle", 0, &mut ctx, false).unwrap();
        engine.spawn("idle", 0, &mut ctx, false).unwrap();
        assert_eq!(engine.spawn("idle", 0, &mut ctx, false), Err(AutomationError::TableFull));
    }

    #[test]
    fn counted_loop_jumps_count_times() {
        let mut ctx = TestContext::default().with("laps", ":top\nset $laps $laps + 1\ngoto top 3\nexit");
        let mut engine = engine();
        let pid = engine.spawn("laps", 0, &mut ctx, false).unwrap();
        engine.tick(0, &mut ctx);
        assert_eq!(engine.variable("laps"), 4);
        assert_eq!(engine.process(pid).unwrap().state(), ProcessState::Terminating);
        engine.tick(20, &mut ctx);
        assert_eq!(engine.process(pid).unwrap().state(), ProcessState::Free);
        assert_eq!(ctx.exited, [pid]);
    }

    #[test]
    fn nested_counted_loops() {
        let text = "\
:outer
:inner
set r0 r0 + 1
goto inner 2
goto outer 1
set $total r0";
        let mut ctx = TestContext::default().with("nest", text);
        let mut engine = engine();
        engine.spawn("nest", 0, &mut ctx, false).unwrap();
        engine.tick(0, &mut ctx);
        // inner body runs 3 times per outer pass, outer runs twice
        assert_eq!(engine.variable("total"), 6);
    }

    #[test]
    fn delay_blocks_until_deadline() {
        let mut ctx = TestContext::default().with("d", "delay 100\nthrow LT1");
        let mut engine = engine();
        engine.spawn("d", 1_000, &mut ctx, false).unwrap();
        engine.tick(1_000, &mut ctx);
        assert!(ctx.submitted.is_empty());
        engine.tick(1_050, &mut ctx);
        assert!(ctx.submitted.is_empty());
        engine.tick(1_100, &mut ctx);
        assert_eq!(
            ctx.submitted,
            [(0, Intent::turnout("LT1", TurnoutAction::Throw))]
        );
    }

    #[test]
    fn sleep_is_measured_from_start() {
        let mut ctx = TestContext::default().with("s", "delay 80\nsleep 100\nclose LT2\nsleep 50\nthrow LT2");
        let mut engine = engine();
        engine.spawn("s", 0, &mut ctx, false).unwrap();
        engine.tick(0, &mut ctx);
        engine.tick(80, &mut ctx);
        assert!(ctx.submitted.is_empty());
        engine.tick(100, &mut ctx);
        // second sleep is already past its deadline
        assert_eq!(ctx.submitted.len(), 2);
    }

    #[test]
    fn waitfor_sensor() {
        let mut ctx = TestContext::default().with("w", "waitfor sensor 7 on\npower on");
        let mut engine = engine();
        engine.spawn("w", 0, &mut ctx, false).unwrap();
        engine.tick(0, &mut ctx);
        engine.tick(20, &mut ctx);
        assert!(ctx.submitted.is_empty());

        ctx.sensors.insert(7, SensorValue::On);
        engine.tick(40, &mut ctx);
        assert_eq!(
            ctx.submitted,
            [(
                0,
                Intent::SetPower {
                    state: PowerState::On,
                    district: None
                }
            )]
        );
    }

    #[test]
    fn key_wakes_waiter() {
        let mut ctx = TestContext::default().with("k", "key g\nroute IR1");
        let mut engine = engine();
        engine.spawn("k", 0, &mut ctx, false).unwrap();
        engine.tick(0, &mut ctx);
        assert_eq!(engine.inject_key('h'), 0);
        assert_eq!(engine.inject_key('g'), 1);
        engine.tick(20, &mut ctx);
        assert_eq!(ctx.submitted, [(0, Intent::route("IR1"))]);
    }

    #[test]
    fn runfg_blocks_parent_until_child_exits() {
        let mut ctx = TestContext::default()
            .with("parent", "runfg child\nset $after $step")
            .with("child", "set $step 1\nkey c\nset $step 2");
        let mut engine = engine();
        let parent = engine.spawn("parent", 0, &mut ctx, false).unwrap();
        engine.tick(0, &mut ctx);
        assert_eq!(engine.variable("step"), 1);
        assert_eq!(engine.variable("after"), 0);
        assert_eq!(engine.live_count(), 2);

        engine.inject_key('c');
        engine.tick(20, &mut ctx);
        // child finished after the parent's turn
        assert_eq!(engine.variable("step"), 2);
        engine.tick(40, &mut ctx);
        assert_eq!(engine.variable("after"), 2);
        assert_eq!(engine.process(parent).unwrap().depth(), 0);
    }

    #[test]
    fn runbg_does_not_block() {
        let mut ctx = TestContext::default()
            .with("main", "runbg bell\nset $main 1")
            .with("bell", "key z");
        let mut engine = engine();
        engine.spawn("main", 0, &mut ctx, false).unwrap();
        engine.tick(0, &mut ctx);
        assert_eq!(engine.variable("main"), 1);
        assert_eq!(engine.process(1).unwrap().script_name(), Some("bell"));
    }

    #[test]
    fn recursion_overflows_stack() {
        let mut ctx = TestContext::default().with("deep", "runfg deep");
        let mut engine = AutomationEngine::new(&AutomationConfig::default().with_stack_depth(3));
        engine.spawn("deep", 0, &mut ctx, false).unwrap();
        let failures = engine.tick(0, &mut ctx);
        assert_eq!(failures, [(3, AutomationError::StackOverflow(3))]);
        assert_eq!(engine.process(3).unwrap().state(), ProcessState::Terminating);
        assert_eq!(engine.live_count(), 4);

        for t in 1..=8 {
            engine.tick(t * 20, &mut ctx);
        }
        assert_eq!(engine.live_count(), 0);
    }

    #[test]
    fn stop_frees_within_one_tick() {
        let mut ctx = TestContext::default()
            .with("parent", "runfg child\nthrow LT9")
            .with("child", "waitfor power on");
        let mut engine = engine();
        let parent = engine.spawn("parent", 0, &mut ctx, false).unwrap();
        engine.tick(0, &mut ctx);
        assert_eq!(engine.live_count(), 2);

        engine.stop(parent).unwrap();
        assert_eq!(engine.process(1).unwrap().state(), ProcessState::Terminating);
        engine.tick(20, &mut ctx);
        assert_eq!(engine.live_count(), 0);
        assert_eq!(ctx.exited, [0, 1]);
        assert!(ctx.submitted.is_empty());
        assert_eq!(engine.stop(parent), Err(AutomationError::NoSuchProcess(parent)));
    }

    #[test]
    fn busy_loop_yields_at_budget() {
        let mut ctx = TestContext::default().with("spin", ":a\nset r0 r0 + 1\ngoto a");
        let mut engine = AutomationEngine::new(&AutomationConfig::default().with_steps_per_tick(10));
        engine.spawn("spin", 0, &mut ctx, false).unwrap();
        engine.tick(0, &mut ctx);
        assert_eq!(engine.process(0).unwrap().registers()[0], 5);
        engine.tick(20, &mut ctx);
        assert_eq!(engine.process(0).unwrap().registers()[0], 10);
    }

    #[test]
    fn tracing_records_lines() {
        let mut ctx = TestContext::default().with("t", "rem start\nconfigpin 5 output\nexit");
        let mut engine = engine();
        engine.spawn("t", 7, &mut ctx, true).unwrap();
        engine.tick(7, &mut ctx);
        let lines: Vec<u16> = engine.trace().map(|t| t.line).collect();
        assert_eq!(lines, [1, 2, 3]);
        assert_eq!(ctx.pins, vec![(5, PinMode::Output)]);
        assert_eq!(engine.drain_trace()[1].text, "configpin 5 output");
        assert_eq!(engine.trace().count(), 0);
    }

    #[test]
    fn turnout_and_raw_intents_carry_pid() {
        let mut ctx = TestContext::default()
            .with("idle", "key q")
            .with("yard", "close LT4\nsendcmd <t 1 3 20 1>");
        let mut engine = engine();
        engine.spawn("idle", 0, &mut ctx, false).unwrap();
        let pid = engine.spawn("yard", 0, &mut ctx, false).unwrap();
        engine.tick(0, &mut ctx);
        assert_eq!(
            ctx.submitted,
            [
                (
                    pid,
                    Intent::SetTurnout {
                        sys_name: sys_name("LT4"),
                        action: TurnoutAction::Close
                    }
                ),
                (pid, Intent::Raw("<t 1 3 20 1>".into())),
            ]
        );
    }
}
