//! Automation: small line-oriented scripts run by a cooperative scheduler.
//!
//! Scripts drive the layout the same way a person at a throttle would: every
//! `throw`, `route`, `power` or `sendcmd` becomes an [`Intent`] submitted on
//! the process's own control path, [`ControlPath::Automation`].
//!
//! ```text
//! rem shuttle between two sidings
//! :again
//! throw LT1
//! waitfor sensor 12 on
//! delay 2000
//! close LT1
//! waitfor sensor 13 on
//! goto again 10
//! ```
//!
//! # Components
//!
//! - [`Script`]: parsed, label-resolved instructions
//! - [`Process`]: one slot with program counter, bounded stack and registers
//! - [`AutomationEngine`]: the process table and its scheduler
//!
//! [`Intent`]: crate::commands::Intent
//! [`ControlPath::Automation`]: crate::entities::ControlPath::Automation

pub mod engine;
pub mod process;
pub mod script;

pub use engine::{AutomationContext, AutomationEngine, TraceLine};
pub use process::{Frame, Process, ProcessState, Wait};
pub use script::{ArithOp, Condition, Expr, Instruction, Op, Operand, Script, SetTarget, REGISTER_COUNT};
