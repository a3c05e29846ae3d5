//! Execution observation for forensic replay.
//!
//! The engine optionally notifies a registered [`Observer`] after each
//! instruction dispatch and once at program end.  Notification is
//! fire-and-forget: the engine never alters behaviour based on observer
//! presence or response, so telemetry can be attached and detached without
//! changing what a guest program does.

use serde::{Deserialize, Serialize};

use crate::exec::Outcome;

/// One instruction dispatch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvent {
    /// Program counter at the time the instruction executed.
    pub pc: usize,
    /// Raw opcode byte that was dispatched.
    pub opcode: u8,
    /// Immediate field of the dispatched instruction.
    pub immediate: u16,
}

/// End-of-program event, emitted exactly once per run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FinishEvent {
    /// Total instructions executed during the run.
    pub executed: u64,
    /// How the run ended.
    pub outcome: Outcome,
}

/// External listener for execution events.
pub trait Observer {
    /// Called after each instruction dispatch.
    fn instruction_executed(&mut self, event: &StepEvent);

    /// Called once when the run ends.
    fn program_finished(&mut self, event: &FinishEvent);
}

/// Trace emitted after execution completes, suitable for serialisation into
/// the telemetry sink and offline replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub steps: Vec<StepEvent>,
    pub executed: u64,
    pub outcome: Option<Outcome>,
}

/// Bundled observer that records every event into an [`ExecutionTrace`].
#[derive(Debug, Default)]
pub struct TraceRecorder {
    steps: Vec<StepEvent>,
    executed: u64,
    outcome: Option<Outcome>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the recorder, yielding the collected trace.
    pub fn into_trace(self) -> ExecutionTrace {
        ExecutionTrace {
            steps: self.steps,
            executed: self.executed,
            outcome: self.outcome,
        }
    }
}

impl Observer for TraceRecorder {
    fn instruction_executed(&mut self, event: &StepEvent) {
        self.steps.push(*event);
    }

    fn program_finished(&mut self, event: &FinishEvent) {
        self.executed = event.executed;
        self.outcome = Some(event.outcome);
    }
}
