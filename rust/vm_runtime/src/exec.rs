//! Execution results and the fault taxonomy.
//!
//! Every handler produces exactly one [`ExecResult`] per invocation and the
//! dispatch loop is its only consumer.  The single [`ErrorKind`] vocabulary
//! replaces the per-handler boolean signalling the original firmware grew:
//! one sum type, no parallel error channels.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tagged outcome of one handler invocation.
///
/// Handlers return data and never touch the program counter; `Jump` carries a
/// target instruction index that the loop validates against the program
/// length before applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecResult {
    /// Advance to the next instruction.
    Continue,
    /// Redirect the program counter to the given instruction index.
    Jump(usize),
    /// Stop execution, success.
    Halt,
    /// Stop execution, recording the fault.
    Error(ErrorKind),
}

/// Flat, exhaustive fault taxonomy carried in [`ExecResult::Error`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A handler required more operands than the stack holds.
    #[error("operand stack underflow")]
    StackUnderflow,
    /// A push would exceed the stack capacity.
    #[error("operand stack overflow")]
    StackOverflow,
    /// The fetched opcode byte names no defined instruction.
    #[error("invalid opcode")]
    InvalidOpcode,
    /// A jump target lies outside the program.
    #[error("jump target outside program")]
    InvalidJump,
    /// An operand value is outside its opcode's accepted range.
    #[error("invalid operand")]
    InvalidOperand,
    /// A global or array access failed its bounds or lifecycle check.
    #[error("invalid memory access")]
    InvalidMemoryAccess,
    /// Division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// A delegated host capability reported failure.
    #[error("host i/o operation failed")]
    IoOperationFailed,
    /// The engine was started without a loaded program.
    #[error("no program loaded")]
    ProgramNotLoaded,
}

/// Terminal state of one engine run, preserved for forensic capture.
///
/// Cancellation is deliberately distinct from a fault so recovery-mode
/// aborts never masquerade as guest bugs in the telemetry stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The program halted (explicitly or by running past its end).
    Halted,
    /// The external cancellation signal was observed.
    Cancelled,
    /// A handler or the loop produced a fault at `pc`.
    Faulted { kind: ErrorKind, pc: usize },
}

impl Outcome {
    /// Whether the run finished without fault or cancellation.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Halted)
    }
}
