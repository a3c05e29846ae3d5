//! Execution engine: the single dispatch loop.
//!
//! One [`Engine`] owns one operand stack, one memory context, the program
//! counter, the halted flag, and the last-error slot.  It is the sole entry
//! point for execution: handlers return an [`ExecResult`] and only the loop
//! applies it, so recursion between execution paths is structurally
//! impossible.  An external, polled [`CancelToken`] is sampled once per
//! iteration before instruction fetch, bounding cancellation latency by one
//! instruction's execution time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bytecode::Program;
use crate::dispatch::{self, Machine};
use crate::exec::{ErrorKind, ExecResult, Outcome};
use crate::host::HostInterface;
use crate::memory::{MemoryContext, MemoryLimits};
use crate::stack::OperandStack;
use crate::trace::{FinishEvent, Observer, StepEvent};

/// Capacity configuration for one engine instance.
///
/// Everything is bounded here, at construction; the engine allocates nothing
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Operand stack capacity in values.
    pub stack_capacity: usize,
    /// Number of global variable slots.
    pub globals: usize,
    /// Number of array slots.
    pub array_slots: usize,
    /// Element capacity of each array slot.
    pub array_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let memory = MemoryLimits::default();
        Self {
            stack_capacity: 64,
            globals: memory.globals,
            array_slots: memory.array_slots,
            array_capacity: memory.array_capacity,
        }
    }
}

impl EngineConfig {
    fn memory_limits(&self) -> MemoryLimits {
        MemoryLimits {
            globals: self.globals,
            array_slots: self.array_slots,
            array_capacity: self.array_capacity,
        }
    }
}

/// Counters accumulated over one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Instructions dispatched, including the faulting one.
    pub executed: u64,
    /// High-water mark of the operand stack.
    pub max_stack_depth: usize,
}

/// Result of one [`Engine::run`] call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: Outcome,
    pub metrics: ExecutionMetrics,
}

/// Cloneable handle for the externally raised cancellation signal, e.g. an
/// operator-triggered return to recovery mode.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal.  The engine observes it before its next fetch.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether the signal has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Bytecode execution engine.
///
/// Multiple engines may coexist, one per independently loaded program; each
/// exclusively owns its stack and memory context, so no locking is needed
/// between instances.  The handler table they dispatch through is built once
/// and shared read-only.
pub struct Engine {
    stack: OperandStack,
    memory: MemoryContext,
    pc: usize,
    halted: bool,
    last_error: Option<ErrorKind>,
    cancel: CancelToken,
    metrics: ExecutionMetrics,
}

impl Engine {
    /// Engine with a fresh memory context and an empty stack.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            stack: OperandStack::new(config.stack_capacity),
            memory: MemoryContext::new(config.memory_limits()),
            pc: 0,
            halted: false,
            last_error: None,
            cancel: CancelToken::new(),
            metrics: ExecutionMetrics::default(),
        }
    }

    /// Handle through which an operator can request cancellation.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Operand stack, for post-run inspection.
    pub fn stack(&self) -> &OperandStack {
        &self.stack
    }

    /// Memory context, for post-run inspection.
    pub fn memory(&self) -> &MemoryContext {
        &self.memory
    }

    /// Program counter at the time execution stopped.
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Whether the last run has ended.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Authoritative record of the most recent fault, untouched on success.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Counters from the most recent run.
    pub fn metrics(&self) -> ExecutionMetrics {
        self.metrics
    }

    /// Execute `program` to halt, fault, or cancellation.
    ///
    /// The memory context and operand stack are left exactly as execution
    /// left them, whatever the outcome, so the surrounding firmware can
    /// capture them before discarding the instance.
    pub fn run(&mut self, program: &Program, host: &mut dyn HostInterface) -> RunReport {
        self.run_inner(program, host, None)
    }

    /// As [`Engine::run`], notifying `observer` of every dispatch and of the
    /// end of the program.  Notification is fire-and-forget; the engine never
    /// changes behaviour based on the observer.
    pub fn run_with_observer(
        &mut self,
        program: &Program,
        host: &mut dyn HostInterface,
        observer: &mut dyn Observer,
    ) -> RunReport {
        self.run_inner(program, host, Some(observer))
    }

    fn run_inner(
        &mut self,
        program: &Program,
        host: &mut dyn HostInterface,
        mut observer: Option<&mut dyn Observer>,
    ) -> RunReport {
        self.pc = 0;
        self.halted = false;
        self.metrics = ExecutionMetrics::default();
        debug!(instructions = program.len(), "run started");

        let outcome = self.dispatch_loop(program, host, observer.as_deref_mut());

        if let Outcome::Faulted { kind, pc } = outcome {
            self.last_error = Some(kind);
            warn!(%kind, pc, "execution faulted");
        }
        self.halted = true;

        let finish = FinishEvent {
            executed: self.metrics.executed,
            outcome,
        };
        if let Some(observer) = observer {
            observer.program_finished(&finish);
        }
        debug!(executed = self.metrics.executed, ?outcome, "run finished");

        RunReport {
            outcome,
            metrics: self.metrics,
        }
    }

    fn dispatch_loop(
        &mut self,
        program: &Program,
        host: &mut dyn HostInterface,
        mut observer: Option<&mut (dyn Observer + '_)>,
    ) -> Outcome {
        if program.is_empty() {
            return Outcome::Faulted {
                kind: ErrorKind::ProgramNotLoaded,
                pc: 0,
            };
        }

        loop {
            // Sampled before fetch: cancellation latency is bounded by one
            // instruction's execution time.
            if self.cancel.is_cancelled() {
                debug!(pc = self.pc, "cancellation observed");
                return Outcome::Cancelled;
            }
            if self.pc >= program.len() {
                // Ran past the last instruction without an explicit HALT.
                return Outcome::Halted;
            }

            let instruction = program.get(self.pc).expect("pc bounds checked");
            let pc_at_dispatch = self.pc;

            let result = match dispatch::lookup(instruction.opcode) {
                Some(handler) => {
                    let mut machine = Machine {
                        stack: &mut self.stack,
                        memory: &mut self.memory,
                        host: &mut *host,
                    };
                    handler(&mut machine, instruction.flags, instruction.immediate)
                }
                None => ExecResult::Error(ErrorKind::InvalidOpcode),
            };

            self.metrics.executed += 1;
            if self.stack.len() > self.metrics.max_stack_depth {
                self.metrics.max_stack_depth = self.stack.len();
            }

            if let Some(observer) = observer.as_deref_mut() {
                observer.instruction_executed(&StepEvent {
                    pc: pc_at_dispatch,
                    opcode: instruction.opcode,
                    immediate: instruction.immediate,
                });
            }

            match result {
                ExecResult::Continue => self.pc += 1,
                ExecResult::Jump(target) => {
                    if target >= program.len() {
                        return Outcome::Faulted {
                            kind: ErrorKind::InvalidJump,
                            pc: pc_at_dispatch,
                        };
                    }
                    self.pc = target;
                }
                ExecResult::Halt => return Outcome::Halted,
                ExecResult::Error(kind) => {
                    return Outcome::Faulted {
                        kind,
                        pc: pc_at_dispatch,
                    }
                }
            }
        }
    }
}
