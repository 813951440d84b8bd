//! Script loading: tokenizing, argument parsing and label resolution.
//!
//! A script is one instruction per line. Blank lines are skipped and a line
//! of the form `:name` defines a label pointing at the next instruction.
//! Every `goto` target is resolved here, so a loaded [`Script`] never jumps
//! to an unknown place.
//!
//! ```rust
//! use rs_throttle_bridge::automation::{Op, Script};
//!
//! let script = Script::parse("shuttle", ":top\nthrow LT1\ndelay 500\ngoto top 3").unwrap();
//! assert_eq!(script.len(), 3);
//! assert_eq!(script.label("top"), Some(0));
//! assert!(matches!(script.instructions()[2].op, Op::Goto { target: 0, .. }));
//! ```

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::commands::TurnoutAction;
use crate::entities::{sys_name, PowerState, RouteState, SensorValue, SysName, TurnoutState};
use crate::error::AutomationError;
use crate::traits::PinMode;

/// Number of general-purpose registers per process.
pub const REGISTER_COUNT: usize = 8;

// ============================================================================
// Arguments
// ============================================================================

/// A value read by an instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    /// A number written in the script.
    Literal(i32),
    /// `r0`..`r7`.
    Register(u8),
    /// `$name`; unset variables read as 0.
    Variable(String),
}

/// Where `set` stores its result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetTarget {
    /// `rN`.
    Register(u8),
    /// `$name`.
    Variable(String),
}

/// Arithmetic for the three-operand `set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`, 0 when dividing by zero
    Div,
    /// `%`, 0 when dividing by zero
    Rem,
}

impl ArithOp {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "+" => ArithOp::Add,
            "-" => ArithOp::Sub,
            "*" => ArithOp::Mul,
            "/" => ArithOp::Div,
            "%" => ArithOp::Rem,
            _ => return None,
        })
    }

    /// Apply with wrapping semantics.
    pub fn apply(self, a: i32, b: i32) -> i32 {
        match self {
            ArithOp::Add => a.wrapping_add(b),
            ArithOp::Sub => a.wrapping_sub(b),
            ArithOp::Mul => a.wrapping_mul(b),
            ArithOp::Div if b == 0 => 0,
            ArithOp::Div => a.wrapping_div(b),
            ArithOp::Rem if b == 0 => 0,
            ArithOp::Rem => a.wrapping_rem(b),
        }
    }
}

/// Right-hand side of `set`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    /// `set r0 5`
    Value(Operand),
    /// `set r0 r1 + 5`
    Binary(Operand, ArithOp, Operand),
}

/// A registry predicate for `waitfor`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    /// `waitfor sensor <id> on|off`
    Sensor {
        /// Sensor id.
        id: u16,
        /// Awaited reading.
        value: SensorValue,
    },
    /// `waitfor turnout <sys> thrown|closed`
    Turnout {
        /// System name.
        sys_name: SysName,
        /// Awaited state.
        state: TurnoutState,
    },
    /// `waitfor route <sys> active|inactive`
    Route {
        /// System name.
        sys_name: SysName,
        /// Awaited state.
        state: RouteState,
    },
    /// `waitfor power on|off`
    Power(PowerState),
}

// ============================================================================
// Instructions
// ============================================================================

/// One decoded instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// `rem`
    Rem,
    /// `key <char>`
    Key(char),
    /// `delay <ms>`
    Delay(Operand),
    /// `sleep <ms>`, measured from process start
    Sleep(Operand),
    /// `goto <label> [count]`
    Goto {
        /// Label as written.
        label: String,
        /// Resolved instruction index.
        target: usize,
        /// Number of jumps for a counted loop.
        count: Option<Operand>,
    },
    /// `waitfor ...`
    WaitFor(Condition),
    /// `exit`
    Exit,
    /// `runfg <script>` / `runbg <script>`
    Run {
        /// Script name.
        script: String,
        /// Caller blocks until the child terminates.
        foreground: bool,
    },
    /// `power on|off`
    Power(PowerState),
    /// `route <sys>`
    Route(SysName),
    /// `throw <sys>` / `close <sys>`
    Turnout {
        /// System name.
        sys_name: SysName,
        /// Throw or close.
        action: TurnoutAction,
    },
    /// `set <target> ...`
    Set {
        /// Destination.
        target: SetTarget,
        /// Value.
        expr: Expr,
    },
    /// `sendcmd <raw line>`
    SendCmd(String),
    /// `configpin <pin> <mode>`
    ConfigPin {
        /// Hardware line.
        pin: u8,
        /// Mode.
        mode: PinMode,
    },
}

impl Op {
    /// Script keyword of this instruction.
    pub fn token(&self) -> &'static str {
        match self {
            Op::Rem => "rem",
            Op::Key(_) => "key",
            Op::Delay(_) => "delay",
            Op::Sleep(_) => "sleep",
            Op::Goto { .. } => "goto",
            Op::WaitFor(_) => "waitfor",
            Op::Exit => "exit",
            Op::Run { foreground: true, .. } => "runfg",
            Op::Run { foreground: false, .. } => "runbg",
            Op::Power(_) => "power",
            Op::Route(_) => "route",
            Op::Turnout { action: TurnoutAction::Close, .. } => "close",
            Op::Turnout { .. } => "throw",
            Op::Set { .. } => "set",
            Op::SendCmd(_) => "sendcmd",
            Op::ConfigPin { .. } => "configpin",
        }
    }
}

/// An instruction with its source position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// Decoded operation.
    pub op: Op,
    /// 1-based source line.
    pub line: u16,
    /// Source text, trimmed.
    pub text: String,
}

/// A loaded script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Script {
    name: String,
    instructions: Vec<Instruction>,
    labels: BTreeMap<String, usize>,
}

impl Script {
    /// Parse and resolve a script.
    ///
    /// # Errors
    ///
    /// - [`AutomationError::UnknownToken`] for an unrecognized keyword
    /// - [`AutomationError::BadArgument`] for malformed arguments or a
    ///   duplicate label
    /// - [`AutomationError::UnresolvedLabel`] for a `goto` to an undefined label
    pub fn parse(name: &str, text: &str) -> Result<Self, AutomationError> {
        let mut instructions = Vec::new();
        let mut labels = BTreeMap::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = u16::try_from(idx + 1).unwrap_or(u16::MAX);
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(label) = trimmed.strip_prefix(':') {
                let label = label.trim();
                if label.is_empty() || labels.insert(label.to_string(), instructions.len()).is_some() {
                    return Err(AutomationError::BadArgument { token: "label", line });
                }
                continue;
            }
            let op = parse_line(trimmed, line)?;
            instructions.push(Instruction {
                op,
                line,
                text: trimmed.to_string(),
            });
        }

        for instr in &mut instructions {
            if let Op::Goto { label, target, .. } = &mut instr.op {
                *target = *labels.get(label.as_str()).ok_or_else(|| AutomationError::UnresolvedLabel {
                    label: label.clone(),
                    line: instr.line,
                })?;
            }
        }

        Ok(Self {
            name: name.to_string(),
            instructions,
            labels,
        })
    }

    /// Script name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decoded instructions in order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Instruction at `pc`.
    pub fn get(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }

    /// Instruction index a label points at.
    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns true if the script has no instructions.
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

// ============================================================================
// Line Parsing
// ============================================================================

fn parse_line(text: &str, line: u16) -> Result<Op, AutomationError> {
    let (word, rest) = match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (text, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();
    let keyword = word.to_ascii_lowercase();

    let token: &'static str = match keyword.as_str() {
        "rem" => return Ok(Op::Rem),
        "exit" => return Ok(Op::Exit),
        "key" => "key",
        "delay" => "delay",
        "sleep" => "sleep",
        "goto" => "goto",
        "waitfor" => "waitfor",
        "runfg" => "runfg",
        "runbg" => "runbg",
        "power" => "power",
        "route" => "route",
        "throw" => "throw",
        "close" => "close",
        "set" => "set",
        "sendcmd" => "sendcmd",
        "configpin" => "configpin",
        _ => {
            return Err(AutomationError::UnknownToken {
                token: word.to_string(),
                line,
            })
        }
    };
    let bad = || AutomationError::BadArgument { token, line };

    let op = match (token, args.as_slice()) {
        ("key", [k]) => {
            let mut chars = k.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Op::Key(c),
                _ => return Err(bad()),
            }
        }
        ("delay", [ms]) => Op::Delay(operand(ms).ok_or_else(bad)?),
        ("sleep", [ms]) => Op::Sleep(operand(ms).ok_or_else(bad)?),
        ("goto", [label]) => Op::Goto {
            label: label.to_string(),
            target: 0,
            count: None,
        },
        ("goto", [label, count]) => Op::Goto {
            label: label.to_string(),
            target: 0,
            count: Some(operand(count).ok_or_else(bad)?),
        },
        ("waitfor", _) => Op::WaitFor(condition(&args).ok_or_else(bad)?),
        ("runfg", [script]) | ("runbg", [script]) => Op::Run {
            script: script.to_string(),
            foreground: token == "runfg",
        },
        ("power", [state]) => Op::Power(on_off(state).ok_or_else(bad)?),
        ("route", [sys]) => Op::Route(sys_name(sys)),
        ("throw", [sys]) => Op::Turnout {
            sys_name: sys_name(sys),
            action: TurnoutAction::Throw,
        },
        ("close", [sys]) => Op::Turnout {
            sys_name: sys_name(sys),
            action: TurnoutAction::Close,
        },
        ("set", [target, value]) => Op::Set {
            target: set_target(target).ok_or_else(bad)?,
            expr: Expr::Value(operand(value).ok_or_else(bad)?),
        },
        ("set", [target, a, op, b]) => Op::Set {
            target: set_target(target).ok_or_else(bad)?,
            expr: Expr::Binary(
                operand(a).ok_or_else(bad)?,
                ArithOp::parse(op).ok_or_else(bad)?,
                operand(b).ok_or_else(bad)?,
            ),
        },
        ("sendcmd", _) if !rest.is_empty() => Op::SendCmd(rest.to_string()),
        ("configpin", [pin, mode]) => Op::ConfigPin {
            pin: pin.parse().map_err(|_| bad())?,
            mode: PinMode::from_text(mode).ok_or_else(bad)?,
        },
        _ => return Err(bad()),
    };
    Ok(op)
}

fn register(s: &str) -> Option<u8> {
    let n: u8 = s.strip_prefix(['r', 'R'])?.parse().ok()?;
    (usize::from(n) < REGISTER_COUNT).then_some(n)
}

fn variable(s: &str) -> Option<String> {
    let name = s.strip_prefix('$')?;
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then(|| name.to_string())
}

fn operand(s: &str) -> Option<Operand> {
    if let Some(r) = register(s) {
        return Some(Operand::Register(r));
    }
    if let Some(v) = variable(s) {
        return Some(Operand::Variable(v));
    }
    s.parse().ok().map(Operand::Literal)
}

fn set_target(s: &str) -> Option<SetTarget> {
    register(s)
        .map(SetTarget::Register)
        .or_else(|| variable(s).map(SetTarget::Variable))
}

fn on_off(s: &str) -> Option<PowerState> {
    if s.eq_ignore_ascii_case("on") {
        Some(PowerState::On)
    } else if s.eq_ignore_ascii_case("off") {
        Some(PowerState::Off)
    } else {
        None
    }
}

fn condition(args: &[&str]) -> Option<Condition> {
    fn keyword(s: &str, yes: &str, no: &str) -> Option<bool> {
        if s.eq_ignore_ascii_case(yes) {
            Some(true)
        } else if s.eq_ignore_ascii_case(no) {
            Some(false)
        } else {
            None
        }
    }

    match args {
        [kind, id, value] if kind.eq_ignore_ascii_case("sensor") => Some(Condition::Sensor {
            id: id.parse().ok()?,
            value: if keyword(value, "on", "off")? {
                SensorValue::On
            } else {
                SensorValue::Off
            },
        }),
        [kind, sys, state] if kind.eq_ignore_ascii_case("turnout") => Some(Condition::Turnout {
            sys_name: sys_name(sys),
            state: if keyword(state, "thrown", "closed")? {
                TurnoutState::Thrown
            } else {
                TurnoutState::Closed
            },
        }),
        [kind, sys, state] if kind.eq_ignore_ascii_case("route") => Some(Condition::Route {
            sys_name: sys_name(sys),
            state: if keyword(state, "active", "inactive")? {
                RouteState::Active
            } else {
                RouteState::Inactive
            },
        }),
        [kind, state] if kind.eq_ignore_ascii_case("power") => Some(Condition::Power(on_off(state)?)),
        _ => None,
    }
}
