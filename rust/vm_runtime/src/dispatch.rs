//! Handler table and opcode handlers.
//!
//! Dispatch is deliberately closed: the table is built once from the
//! canonical opcode list, covers all 256 opcode byte values exactly once
//! (undefined values bind to the invalid-opcode handler), is sorted for
//! binary search, and is shared read-only by every engine instance.  Handlers
//! are plain functions over [`Machine`] state that return an [`ExecResult`];
//! they never see the program counter and cannot re-enter the dispatch loop.
//!
//! Every handler validates its whole operation by peeking before committing
//! any pop or write, so a faulting instruction leaves the operand stack and
//! memory context exactly as it found them.

use std::sync::OnceLock;

use crate::bytecode::flags;
use crate::exec::{ErrorKind, ExecResult};
use crate::host::{HostInterface, PIN_COUNT};
use crate::memory::MemoryContext;
use crate::stack::OperandStack;

/// Mutable machine state a handler may touch: the operand stack and memory
/// context of its own engine, plus the host capability seam.
pub(crate) struct Machine<'a> {
    pub stack: &'a mut OperandStack,
    pub memory: &'a mut MemoryContext,
    pub host: &'a mut dyn HostInterface,
}

/// One opcode handler.  Arguments beyond the machine are the instruction's
/// flags and immediate fields.
pub(crate) type Handler = fn(&mut Machine<'_>, u8, u16) -> ExecResult;

/// Sorted table entry pairing an opcode byte with its handler.
#[derive(Clone, Copy)]
pub(crate) struct TableEntry {
    pub opcode: u8,
    pub handler: Handler,
}

macro_rules! defined_handlers {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $value:literal, $mnemonic:literal, $mode:ident => $handler:ident
        ),* $(,)?
    ) => {
        /// Opcode/handler pairs for every defined opcode, list order.
        pub(crate) const DEFINED: &[(u8, Handler)] = &[
            $( ($value, $handler as Handler), )*
        ];
    };
}

crate::for_each_opcode!(defined_handlers);

fn build_table() -> [TableEntry; 256] {
    let mut table = [TableEntry {
        opcode: 0,
        handler: op_invalid as Handler,
    }; 256];
    for (value, entry) in table.iter_mut().enumerate() {
        entry.opcode = value as u8;
    }
    for &(opcode, handler) in DEFINED {
        table[opcode as usize].handler = handler;
    }
    debug_assert!(table.windows(2).all(|w| w[0].opcode < w[1].opcode));
    table
}

/// The shared read-only handler table, built on first use.
pub(crate) fn handler_table() -> &'static [TableEntry; 256] {
    static TABLE: OnceLock<[TableEntry; 256]> = OnceLock::new();
    TABLE.get_or_init(build_table)
}

/// Binary-search the table for `opcode`.
pub(crate) fn lookup(opcode: u8) -> Option<Handler> {
    let table = handler_table();
    table
        .binary_search_by_key(&opcode, |entry| entry.opcode)
        .ok()
        .map(|index| table[index].handler)
}

// ---------- shared handler shapes ----------

/// Peek both operands, compute, then commit two pops and one push.
fn binary_op(
    machine: &mut Machine<'_>,
    op: impl FnOnce(i32, i32) -> Result<i32, ErrorKind>,
) -> ExecResult {
    let right = match machine.stack.peek(0) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    let left = match machine.stack.peek(1) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    match op(left, right) {
        Ok(result) => {
            machine.stack.pop().expect("depth checked");
            machine.stack.pop().expect("depth checked");
            machine.stack.push(result).expect("pops made room");
            ExecResult::Continue
        }
        Err(kind) => ExecResult::Error(kind),
    }
}

/// Peek the top operand, compute, then commit one pop and one push.
fn unary_op(
    machine: &mut Machine<'_>,
    op: impl FnOnce(i32) -> Result<i32, ErrorKind>,
) -> ExecResult {
    let value = match machine.stack.peek(0) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    match op(value) {
        Ok(result) => {
            machine.stack.pop().expect("depth checked");
            machine.stack.push(result).expect("pop made room");
            ExecResult::Continue
        }
        Err(kind) => ExecResult::Error(kind),
    }
}

/// Comparison producing a C-style boolean, 1 or 0 and never anything else.
fn compare_op(machine: &mut Machine<'_>, pred: impl FnOnce(i32, i32) -> bool) -> ExecResult {
    binary_op(machine, |left, right| Ok(i32::from(pred(left, right))))
}

fn shift_amount(amount: i32) -> Result<u32, ErrorKind> {
    if (0..=31).contains(&amount) {
        Ok(amount as u32)
    } else {
        Err(ErrorKind::InvalidOperand)
    }
}

// ---------- stack ----------

fn op_nop(_machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    ExecResult::Continue
}

fn op_push(machine: &mut Machine<'_>, flag_bits: u8, immediate: u16) -> ExecResult {
    let value = if flag_bits & flags::PUSH_SIGNED != 0 {
        i32::from(immediate as i16)
    } else {
        i32::from(immediate)
    };
    match machine.stack.push(value) {
        Ok(()) => ExecResult::Continue,
        Err(kind) => ExecResult::Error(kind),
    }
}

fn op_pop(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    match machine.stack.pop() {
        Ok(_) => ExecResult::Continue,
        Err(kind) => ExecResult::Error(kind),
    }
}

fn op_dup(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    let top = match machine.stack.peek(0) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    match machine.stack.push(top) {
        Ok(()) => ExecResult::Continue,
        Err(kind) => ExecResult::Error(kind),
    }
}

fn op_swap(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    if let Err(kind) = machine.stack.require(2) {
        return ExecResult::Error(kind);
    }
    let a = machine.stack.pop().expect("depth checked");
    let b = machine.stack.pop().expect("depth checked");
    machine.stack.push(a).expect("pops made room");
    machine.stack.push(b).expect("pops made room");
    ExecResult::Continue
}

fn op_over(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    let second = match machine.stack.peek(1) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    match machine.stack.push(second) {
        Ok(()) => ExecResult::Continue,
        Err(kind) => ExecResult::Error(kind),
    }
}

fn op_rot(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    if let Err(kind) = machine.stack.require(3) {
        return ExecResult::Error(kind);
    }
    let a = machine.stack.pop().expect("depth checked");
    let b = machine.stack.pop().expect("depth checked");
    let c = machine.stack.pop().expect("depth checked");
    machine.stack.push(b).expect("pops made room");
    machine.stack.push(a).expect("pops made room");
    machine.stack.push(c).expect("pops made room");
    ExecResult::Continue
}

fn op_halt(_machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    ExecResult::Halt
}

// ---------- arithmetic ----------

fn op_add(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    binary_op(machine, |left, right| Ok(left.wrapping_add(right)))
}

fn op_sub(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    binary_op(machine, |left, right| Ok(left.wrapping_sub(right)))
}

fn op_mul(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    binary_op(machine, |left, right| Ok(left.wrapping_mul(right)))
}

fn op_div(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    binary_op(machine, |left, right| {
        if right == 0 {
            Err(ErrorKind::DivisionByZero)
        } else {
            Ok(left.wrapping_div(right))
        }
    })
}

fn op_mod(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    binary_op(machine, |left, right| {
        if right == 0 {
            Err(ErrorKind::DivisionByZero)
        } else {
            Ok(left.wrapping_rem(right))
        }
    })
}

fn op_neg(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    unary_op(machine, |value| Ok(value.wrapping_neg()))
}

fn op_abs(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    unary_op(machine, |value| Ok(value.wrapping_abs()))
}

fn op_min(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    binary_op(machine, |left, right| Ok(left.min(right)))
}

fn op_max(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    binary_op(machine, |left, right| Ok(left.max(right)))
}

fn op_inc(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    unary_op(machine, |value| Ok(value.wrapping_add(1)))
}

fn op_dec(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    unary_op(machine, |value| Ok(value.wrapping_sub(1)))
}

// ---------- comparison ----------

fn op_eq(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    compare_op(machine, |left, right| left == right)
}

fn op_ne(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    compare_op(machine, |left, right| left != right)
}

fn op_lt_s(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    compare_op(machine, |left, right| left < right)
}

fn op_le_s(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    compare_op(machine, |left, right| left <= right)
}

fn op_gt_s(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    compare_op(machine, |left, right| left > right)
}

fn op_ge_s(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    compare_op(machine, |left, right| left >= right)
}

fn op_lt_u(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    compare_op(machine, |left, right| (left as u32) < (right as u32))
}

fn op_le_u(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    compare_op(machine, |left, right| (left as u32) <= (right as u32))
}

fn op_gt_u(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    compare_op(machine, |left, right| (left as u32) > (right as u32))
}

fn op_ge_u(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    compare_op(machine, |left, right| (left as u32) >= (right as u32))
}

// ---------- logical ----------

fn op_and_l(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    compare_op(machine, |left, right| left != 0 && right != 0)
}

fn op_or_l(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    compare_op(machine, |left, right| left != 0 || right != 0)
}

fn op_not_l(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    unary_op(machine, |value| Ok(i32::from(value == 0)))
}

// ---------- bitwise ----------

fn op_band(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    binary_op(machine, |left, right| Ok(left & right))
}

fn op_bor(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    binary_op(machine, |left, right| Ok(left | right))
}

fn op_bxor(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    binary_op(machine, |left, right| Ok(left ^ right))
}

fn op_bnot(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    unary_op(machine, |value| Ok(!value))
}

fn op_shl(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    binary_op(machine, |left, right| {
        let amount = shift_amount(right)?;
        Ok(((left as u32) << amount) as i32)
    })
}

fn op_shr(machine: &mut Machine<'_>, flag_bits: u8, _immediate: u16) -> ExecResult {
    let arithmetic = flag_bits & flags::SHR_ARITHMETIC != 0;
    binary_op(machine, |left, right| {
        let amount = shift_amount(right)?;
        if arithmetic {
            Ok(left >> amount)
        } else {
            Ok(((left as u32) >> amount) as i32)
        }
    })
}

// ---------- control flow ----------

fn op_jmp(_machine: &mut Machine<'_>, _flags: u8, immediate: u16) -> ExecResult {
    ExecResult::Jump(usize::from(immediate))
}

fn op_jmp_true(machine: &mut Machine<'_>, _flags: u8, immediate: u16) -> ExecResult {
    match machine.stack.pop() {
        Ok(condition) if condition != 0 => ExecResult::Jump(usize::from(immediate)),
        Ok(_) => ExecResult::Continue,
        Err(kind) => ExecResult::Error(kind),
    }
}

fn op_jmp_false(machine: &mut Machine<'_>, _flags: u8, immediate: u16) -> ExecResult {
    match machine.stack.pop() {
        Ok(condition) if condition == 0 => ExecResult::Jump(usize::from(immediate)),
        Ok(_) => ExecResult::Continue,
        Err(kind) => ExecResult::Error(kind),
    }
}

// ---------- memory ----------

fn op_load_global(machine: &mut Machine<'_>, _flags: u8, immediate: u16) -> ExecResult {
    let value = match machine.memory.load_global(usize::from(immediate)) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    match machine.stack.push(value) {
        Ok(()) => ExecResult::Continue,
        Err(kind) => ExecResult::Error(kind),
    }
}

fn op_store_global(machine: &mut Machine<'_>, _flags: u8, immediate: u16) -> ExecResult {
    let value = match machine.stack.peek(0) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    match machine.memory.store_global(usize::from(immediate), value) {
        Ok(()) => {
            machine.stack.pop().expect("depth checked");
            ExecResult::Continue
        }
        Err(kind) => ExecResult::Error(kind),
    }
}

fn op_create_array(machine: &mut Machine<'_>, _flags: u8, immediate: u16) -> ExecResult {
    let size = match machine.stack.peek(0) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    if size < 0 {
        return ExecResult::Error(ErrorKind::InvalidMemoryAccess);
    }
    match machine
        .memory
        .create_array(usize::from(immediate), size as usize)
    {
        Ok(()) => {
            machine.stack.pop().expect("depth checked");
            ExecResult::Continue
        }
        Err(kind) => ExecResult::Error(kind),
    }
}

fn op_load_array(machine: &mut Machine<'_>, _flags: u8, immediate: u16) -> ExecResult {
    let index = match machine.stack.peek(0) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    if index < 0 {
        return ExecResult::Error(ErrorKind::InvalidMemoryAccess);
    }
    match machine
        .memory
        .array_load(usize::from(immediate), index as usize)
    {
        Ok(value) => {
            machine.stack.pop().expect("depth checked");
            machine.stack.push(value).expect("pop made room");
            ExecResult::Continue
        }
        Err(kind) => ExecResult::Error(kind),
    }
}

// Stack contract: index pushed first, value pushed last; the slot id rides in
// the immediate.  Value is therefore peeked at depth 0, index at depth 1.
fn op_store_array(machine: &mut Machine<'_>, _flags: u8, immediate: u16) -> ExecResult {
    let value = match machine.stack.peek(0) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    let index = match machine.stack.peek(1) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    if index < 0 {
        return ExecResult::Error(ErrorKind::InvalidMemoryAccess);
    }
    match machine
        .memory
        .array_store(usize::from(immediate), index as usize, value)
    {
        Ok(()) => {
            machine.stack.pop().expect("depth checked");
            machine.stack.pop().expect("depth checked");
            ExecResult::Continue
        }
        Err(kind) => ExecResult::Error(kind),
    }
}

// ---------- host capabilities ----------

fn pin_argument(immediate: u16) -> Result<u8, ErrorKind> {
    if immediate < u16::from(PIN_COUNT) {
        Ok(immediate as u8)
    } else {
        Err(ErrorKind::InvalidOperand)
    }
}

fn op_pin_write(machine: &mut Machine<'_>, _flags: u8, immediate: u16) -> ExecResult {
    let pin = match pin_argument(immediate) {
        Ok(pin) => pin,
        Err(kind) => return ExecResult::Error(kind),
    };
    let level = match machine.stack.peek(0) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    match machine.host.pin_write(pin, level != 0) {
        Ok(()) => {
            machine.stack.pop().expect("depth checked");
            ExecResult::Continue
        }
        Err(_) => ExecResult::Error(ErrorKind::IoOperationFailed),
    }
}

fn op_pin_read(machine: &mut Machine<'_>, _flags: u8, immediate: u16) -> ExecResult {
    let pin = match pin_argument(immediate) {
        Ok(pin) => pin,
        Err(kind) => return ExecResult::Error(kind),
    };
    if machine.stack.is_full() {
        return ExecResult::Error(ErrorKind::StackOverflow);
    }
    match machine.host.pin_read(pin) {
        Ok(level) => {
            machine
                .stack
                .push(i32::from(level))
                .expect("capacity checked");
            ExecResult::Continue
        }
        Err(_) => ExecResult::Error(ErrorKind::IoOperationFailed),
    }
}

fn op_print(machine: &mut Machine<'_>, flag_bits: u8, _immediate: u16) -> ExecResult {
    let value = match machine.stack.peek(0) {
        Ok(value) => value,
        Err(kind) => return ExecResult::Error(kind),
    };
    let text = match flag_bits {
        flags::PRINT_SIGNED => value.to_string(),
        flags::PRINT_UNSIGNED => (value as u32).to_string(),
        flags::PRINT_HEX => format!("{:x}", value as u32),
        flags::PRINT_CHAR => match char::from_u32(value as u32) {
            Some(c) => c.to_string(),
            None => return ExecResult::Error(ErrorKind::InvalidOperand),
        },
        _ => return ExecResult::Error(ErrorKind::InvalidOperand),
    };
    match machine.host.print(&text) {
        Ok(()) => {
            machine.stack.pop().expect("depth checked");
            ExecResult::Continue
        }
        Err(_) => ExecResult::Error(ErrorKind::IoOperationFailed),
    }
}

fn op_millis(machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    if machine.stack.is_full() {
        return ExecResult::Error(ErrorKind::StackOverflow);
    }
    match machine.host.elapsed_millis() {
        Ok(millis) => {
            machine
                .stack
                .push(millis as i32)
                .expect("capacity checked");
            ExecResult::Continue
        }
        Err(_) => ExecResult::Error(ErrorKind::IoOperationFailed),
    }
}

fn op_delay(machine: &mut Machine<'_>, _flags: u8, immediate: u16) -> ExecResult {
    match machine.host.delay_millis(u32::from(immediate)) {
        Ok(()) => ExecResult::Continue,
        Err(_) => ExecResult::Error(ErrorKind::IoOperationFailed),
    }
}

// ---------- invalid ----------

/// Bound to every opcode byte the ISA does not define.
fn op_invalid(_machine: &mut Machine<'_>, _flags: u8, _immediate: u16) -> ExecResult {
    ExecResult::Error(ErrorKind::InvalidOpcode)
}
