//! Process slots: program counter, bounded stack and register bank.

use alloc::sync::Arc;

use heapless::Vec;

use super::script::{Condition, Script, REGISTER_COUNT};
use crate::config::MAX_STACK_DEPTH;
use crate::error::AutomationError;

/// Lifecycle of a process slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ProcessState {
    /// Slot unused.
    #[default]
    Free,
    /// Stopping; freed at the start of the next tick.
    Terminating,
    /// Executing.
    Running,
    /// Executing and recording every line.
    Tracing,
}

impl ProcessState {
    /// Returns the state as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Free => "free",
            ProcessState::Terminating => "terminating",
            ProcessState::Running => "running",
            ProcessState::Tracing => "tracing",
        }
    }

    /// Running or tracing.
    pub const fn is_active(&self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Tracing)
    }
}

/// A call/loop stack entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Waiting on a `runfg` child.
    Foreground {
        /// Child slot.
        child: u8,
        /// Child slot generation at spawn.
        generation: u32,
    },
    /// A counted `goto` in progress.
    Loop {
        /// Instruction index of the `goto`.
        pc: usize,
        /// Jumps left.
        remaining: i32,
    },
}

/// What a blocked process waits for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Absolute deadline in milliseconds.
    Until(u64),
    /// An injected key.
    Key(char),
    /// A registry predicate.
    Condition(Condition),
    /// A foreground child to terminate.
    Child {
        /// Child slot.
        pid: u8,
        /// Child slot generation at spawn.
        generation: u32,
    },
}

/// One slot of the process table.
#[derive(Clone, Debug, Default)]
pub struct Process {
    pub(crate) id: u8,
    pub(crate) state: ProcessState,
    pub(crate) script: Option<Arc<Script>>,
    pub(crate) pc: usize,
    pub(crate) stack: Vec<Frame, MAX_STACK_DEPTH>,
    pub(crate) registers: [i32; REGISTER_COUNT],
    pub(crate) wait: Option<Wait>,
    pub(crate) started_ms: u64,
    pub(crate) generation: u32,
    pub(crate) base_depth: usize,
    pub(crate) error: Option<AutomationError>,
}

impl Process {
    pub(crate) fn empty(id: u8) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Slot id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Name of the loaded script.
    pub fn script_name(&self) -> Option<&str> {
        self.script.as_deref().map(Script::name)
    }

    /// Source line of the next instruction.
    pub fn line(&self) -> Option<u16> {
        self.script.as_deref()?.get(self.pc).map(|i| i.line)
    }

    /// Register bank.
    pub fn registers(&self) -> &[i32; REGISTER_COUNT] {
        &self.registers
    }

    /// What the process is blocked on, if anything.
    pub fn waiting_on(&self) -> Option<&Wait> {
        self.wait.as_ref()
    }

    /// Current stack depth including inherited foreground depth.
    pub fn depth(&self) -> usize {
        self.base_depth + self.stack.len()
    }

    /// Bumped every time the slot is reused.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Failure that terminated the process, if any.
    pub fn error(&self) -> Option<&AutomationError> {
        self.error.as_ref()
    }

    /// Push a frame, bounded by `limit`.
    pub(crate) fn push(&mut self, frame: Frame, limit: usize) -> Result<(), AutomationError> {
        let depth = self.depth();
        if depth >= limit {
            return Err(AutomationError::StackOverflow(depth));
        }
        self.stack
            .push(frame)
            .map_err(|_| AutomationError::StackOverflow(depth))
    }

    /// Load a script into a free slot.
    pub(crate) fn start(&mut self, script: Arc<Script>, now_ms: u64, tracing: bool, base_depth: usize) {
        let id = self.id;
        let generation = self.generation.wrapping_add(1);
        *self = Self {
            id,
            state: if tracing {
                ProcessState::Tracing
            } else {
                ProcessState::Running
            },
            script: Some(script),
            started_ms: now_ms,
            generation,
            base_depth,
            ..Self::default()
        };
    }

    /// Return the slot to the free pool, keeping its generation.
    pub(crate) fn reset(&mut self) {
        let (id, generation) = (self.id, self.generation);
        *self = Self {
            id,
            generation,
            ..Self::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> Arc<Script> {
        Arc::new(Script::parse("t", "rem").unwrap())
    }

    #[test]
    fn start_bumps_generation() {
        let mut p = Process::empty(3);
        p.start(script(), 100, false, 0);
        assert_eq!(p.state(), ProcessState::Running);
        assert_eq!(p.generation(), 1);
        assert_eq!(p.script_name(), Some("t"));

        p.reset();
        assert_eq!(p.state(), ProcessState::Free);
        assert_eq!(p.generation(), 1);
        assert_eq!(p.id(), 3);

        p.start(script(), 200, true, 0);
        assert_eq!(p.state(), ProcessState::Tracing);
        assert_eq!(p.generation(), 2);
    }

    #[test]
    fn push_respects_inherited_depth() {
        let mut p = Process::empty(0);
        p.start(script(), 0, false, 2);
        let frame = Frame::Loop { pc: 0, remaining: 1 };
        assert!(p.push(frame, 3).is_ok());
        assert_eq!(p.push(frame, 3), Err(AutomationError::StackOverflow(3)));
        assert_eq!(p.depth(), 3);
    }
}
