//! Host capability interface for hardware-delegating opcodes.
//!
//! The core performs no pin I/O, timing, or text output itself.  Each
//! host-delegating opcode validates its arguments locally, makes exactly one
//! call from the fixed capability set below, and translates failure into
//! [`ErrorKind::IoOperationFailed`](crate::exec::ErrorKind::IoOperationFailed)
//! without retrying.  The host guarantees every call returns in bounded time.

use thiserror::Error;

/// Number of addressable digital pins; pin arguments are validated against
/// this before any host call is made.
pub const PIN_COUNT: u8 = 32;

/// Failure reported by a host capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("host capability '{capability}' failed")]
pub struct HostError {
    pub capability: &'static str,
}

impl HostError {
    pub fn new(capability: &'static str) -> Self {
        Self { capability }
    }
}

pub type HostResult<T> = Result<T, HostError>;

/// Fixed, enumerated capability set the core may invoke.
pub trait HostInterface {
    /// Drive a digital pin high or low.
    fn pin_write(&mut self, pin: u8, level: bool) -> HostResult<()>;

    /// Sample a digital pin.
    fn pin_read(&mut self, pin: u8) -> HostResult<bool>;

    /// Emit already-formatted text.
    fn print(&mut self, text: &str) -> HostResult<()>;

    /// Milliseconds elapsed since the host's reference point.
    fn elapsed_millis(&mut self) -> HostResult<u32>;

    /// Block for at most `millis` milliseconds.
    fn delay_millis(&mut self, millis: u32) -> HostResult<()>;
}

/// Host with no hardware behind it: pins read low, output is discarded, the
/// clock sits at zero and delays return immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl HostInterface for NullHost {
    fn pin_write(&mut self, _pin: u8, _level: bool) -> HostResult<()> {
        Ok(())
    }

    fn pin_read(&mut self, _pin: u8) -> HostResult<bool> {
        Ok(false)
    }

    fn print(&mut self, _text: &str) -> HostResult<()> {
        Ok(())
    }

    fn elapsed_millis(&mut self) -> HostResult<u32> {
        Ok(0)
    }

    fn delay_millis(&mut self, _millis: u32) -> HostResult<()> {
        Ok(())
    }
}
