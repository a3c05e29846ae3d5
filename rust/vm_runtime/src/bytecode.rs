//! Bytecode model for the Cinder guest VM.
//!
//! Guest programs arrive as a contiguous stream of fixed-width instruction
//! records placed in memory by the boot/recovery loader.  The types below
//! describe the record format, the opcode space, and the immutable [`Program`]
//! container the engine executes.  The [`for_each_opcode!`] macro holds the
//! canonical opcode list and invokes a callback macro for code generation, so
//! the [`Opcode`] enum, the mnemonic table, and the dispatch table can never
//! drift apart.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::exec::ErrorKind;

/// Invokes a callback macro with the complete opcode definition list.
///
/// Entry shape: `Name = opcode, "MNEMONIC", immediate-use => handler`.  The
/// `imm`/`none` token records whether the opcode consumes its immediate
/// field; the handler identifier is only resolved inside the dispatch module.
#[macro_export]
macro_rules! for_each_opcode {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Stack
            // =========================
            /// NOP ; no effect
            Nop = 0x00, "NOP", none => op_nop,
            /// PUSH imm ; push immediate (flags bit 0: sign-extend)
            Push = 0x01, "PUSH", imm => op_push,
            /// POP ; discard top of stack
            Pop = 0x02, "POP", none => op_pop,
            /// DUP ; duplicate top of stack
            Dup = 0x03, "DUP", none => op_dup,
            /// SWAP ; exchange the top two values
            Swap = 0x04, "SWAP", none => op_swap,
            /// OVER ; push a copy of the second value from the top
            Over = 0x05, "OVER", none => op_over,
            /// ROT ; rotate the third value from the top to the top
            Rot = 0x06, "ROT", none => op_rot,
            /// HALT ; stop execution, success
            Halt = 0x07, "HALT", none => op_halt,
            // =========================
            // Arithmetic (wrapping two's-complement)
            // =========================
            /// ADD ; pop right, pop left, push left + right
            Add = 0x10, "ADD", none => op_add,
            /// SUB ; pop right, pop left, push left - right
            Sub = 0x11, "SUB", none => op_sub,
            /// MUL ; pop right, pop left, push left * right
            Mul = 0x12, "MUL", none => op_mul,
            /// DIV ; pop right, pop left, push left / right (zero divisor faults)
            Div = 0x13, "DIV", none => op_div,
            /// MOD ; pop right, pop left, push left % right (zero divisor faults)
            Mod = 0x14, "MOD", none => op_mod,
            /// NEG ; negate top of stack
            Neg = 0x15, "NEG", none => op_neg,
            /// ABS ; absolute value of top of stack
            Abs = 0x16, "ABS", none => op_abs,
            /// MIN ; pop right, pop left, push the signed minimum
            Min = 0x17, "MIN", none => op_min,
            /// MAX ; pop right, pop left, push the signed maximum
            Max = 0x18, "MAX", none => op_max,
            /// INC ; add one to top of stack
            Inc = 0x19, "INC", none => op_inc,
            /// DEC ; subtract one from top of stack
            Dec = 0x1A, "DEC", none => op_dec,
            // =========================
            // Comparison (push 1 or 0)
            // =========================
            /// EQ ; left == right
            Eq = 0x20, "EQ", none => op_eq,
            /// NE ; left != right
            Ne = 0x21, "NE", none => op_ne,
            /// LT_S ; left < right, signed
            LtS = 0x22, "LT_S", none => op_lt_s,
            /// LE_S ; left <= right, signed
            LeS = 0x23, "LE_S", none => op_le_s,
            /// GT_S ; left > right, signed
            GtS = 0x24, "GT_S", none => op_gt_s,
            /// GE_S ; left >= right, signed
            GeS = 0x25, "GE_S", none => op_ge_s,
            /// LT_U ; left < right, unsigned bit pattern
            LtU = 0x26, "LT_U", none => op_lt_u,
            /// LE_U ; left <= right, unsigned bit pattern
            LeU = 0x27, "LE_U", none => op_le_u,
            /// GT_U ; left > right, unsigned bit pattern
            GtU = 0x28, "GT_U", none => op_gt_u,
            /// GE_U ; left >= right, unsigned bit pattern
            GeU = 0x29, "GE_U", none => op_ge_u,
            // =========================
            // Logical (non-zero is true)
            // =========================
            /// AND_L ; logical and, push 1 or 0
            AndL = 0x30, "AND_L", none => op_and_l,
            /// OR_L ; logical or, push 1 or 0
            OrL = 0x31, "OR_L", none => op_or_l,
            /// NOT_L ; logical not, push 1 or 0
            NotL = 0x32, "NOT_L", none => op_not_l,
            // =========================
            // Bitwise
            // =========================
            /// BAND ; bitwise and
            BAnd = 0x38, "BAND", none => op_band,
            /// BOR ; bitwise or
            BOr = 0x39, "BOR", none => op_bor,
            /// BXOR ; bitwise xor
            BXor = 0x3A, "BXOR", none => op_bxor,
            /// BNOT ; bitwise complement
            BNot = 0x3B, "BNOT", none => op_bnot,
            /// SHL ; shift left by popped amount, amount must be in [0, 31]
            Shl = 0x3C, "SHL", none => op_shl,
            /// SHR ; shift right by popped amount (flags bit 0: arithmetic)
            Shr = 0x3D, "SHR", none => op_shr,
            // =========================
            // Control flow (immediate is an instruction index)
            // =========================
            /// JMP target ; unconditional jump
            Jmp = 0x40, "JMP", imm => op_jmp,
            /// JMP_TRUE target ; pop condition, jump when non-zero
            JmpTrue = 0x41, "JMP_TRUE", imm => op_jmp_true,
            /// JMP_FALSE target ; pop condition, jump when zero
            JmpFalse = 0x42, "JMP_FALSE", imm => op_jmp_false,
            // =========================
            // Memory (immediate is a slot id)
            // =========================
            /// LOAD_GLOBAL id ; push the value of global slot id
            LoadGlobal = 0x50, "LOAD_GLOBAL", imm => op_load_global,
            /// STORE_GLOBAL id ; pop a value into global slot id
            StoreGlobal = 0x51, "STORE_GLOBAL", imm => op_store_global,
            /// CREATE_ARRAY id ; pop size, activate array slot id
            CreateArray = 0x52, "CREATE_ARRAY", imm => op_create_array,
            /// LOAD_ARRAY id ; pop index, push arrays[id][index]
            LoadArray = 0x53, "LOAD_ARRAY", imm => op_load_array,
            /// STORE_ARRAY id ; pop value, pop index, arrays[id][index] = value
            StoreArray = 0x54, "STORE_ARRAY", imm => op_store_array,
            // =========================
            // Host capabilities
            // =========================
            /// PIN_WRITE pin ; pop level, drive the pin (non-zero is high)
            PinWrite = 0x60, "PIN_WRITE", imm => op_pin_write,
            /// PIN_READ pin ; sample the pin, push 1 or 0
            PinRead = 0x61, "PIN_READ", imm => op_pin_read,
            /// PRINT ; pop a value, render per flags, emit via the host
            Print = 0x62, "PRINT", none => op_print,
            /// MILLIS ; push the host's elapsed-time counter
            Millis = 0x63, "MILLIS", none => op_millis,
            /// DELAY ms ; bounded delay delegated to the host
            Delay = 0x64, "DELAY", imm => op_delay,
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! opcode_uses_immediate {
    (imm) => {
        true
    };
    (none) => {
        false
    };
}

macro_rules! define_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $value:literal, $mnemonic:literal, $mode:ident => $handler:ident
        ),* $(,)?
    ) => {
        /// Opcode bytes understood by the engine.
        ///
        /// Any byte outside this enumeration dispatches to the invalid-opcode
        /// handler and faults with [`ErrorKind::InvalidOpcode`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $value,
            )*
        }

        impl Opcode {
            /// Every defined opcode in ascending byte order.
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$name, )* ];

            /// Returns the assembly mnemonic for this opcode.
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Whether this opcode consumes its immediate field.
            pub const fn uses_immediate(self) -> bool {
                match self {
                    $( Opcode::$name => $crate::opcode_uses_immediate!($mode), )*
                }
            }
        }

        impl TryFrom<u8> for Opcode {
            type Error = ErrorKind;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $value => Ok(Opcode::$name), )*
                    _ => Err(ErrorKind::InvalidOpcode),
                }
            }
        }
    };
}

for_each_opcode!(define_opcodes);

impl Opcode {
    /// Whether `opcode` names a defined instruction.
    pub fn is_defined(opcode: u8) -> bool {
        Opcode::try_from(opcode).is_ok()
    }
}

/// Opcode-specific flag bits.
///
/// The flags byte carries no global convention; each opcode documents its own
/// interpretation and ignores every bit it does not define.
pub mod flags {
    /// `PUSH`: sign-extend the 16-bit immediate instead of zero-extending.
    pub const PUSH_SIGNED: u8 = 0b0000_0001;
    /// `SHR`: arithmetic (sign-propagating) shift instead of logical.
    pub const SHR_ARITHMETIC: u8 = 0b0000_0001;
    /// `PRINT`: signed decimal rendering.
    pub const PRINT_SIGNED: u8 = 0;
    /// `PRINT`: unsigned decimal rendering of the raw bit pattern.
    pub const PRINT_UNSIGNED: u8 = 1;
    /// `PRINT`: lowercase hexadecimal rendering of the raw bit pattern.
    pub const PRINT_HEX: u8 = 2;
    /// `PRINT`: render the value as a Unicode scalar.
    pub const PRINT_CHAR: u8 = 3;
}

/// Fixed-width instruction record.
///
/// Wire layout is four bytes, `[opcode, flags, immediate_lo, immediate_hi]`,
/// immediate little-endian.  The opcode stays a raw byte so undefined values
/// survive loading and reach the invalid-opcode handler instead of being
/// rejected up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: u8,
    pub flags: u8,
    pub immediate: u16,
}

impl Instruction {
    /// Encoded size of one record in bytes.
    pub const SIZE: usize = 4;

    /// Instruction with the given opcode and immediate, flags clear.
    pub fn new(opcode: Opcode, immediate: u16) -> Self {
        Self {
            opcode: opcode as u8,
            flags: 0,
            immediate,
        }
    }

    /// Instruction with an explicit flags byte.
    pub fn with_flags(opcode: Opcode, flags: u8, immediate: u16) -> Self {
        Self {
            opcode: opcode as u8,
            flags,
            immediate,
        }
    }

    /// Instruction from raw bytes, defined or not.
    pub fn from_raw(opcode: u8, flags: u8, immediate: u16) -> Self {
        Self {
            opcode,
            flags,
            immediate,
        }
    }

    /// Encode into the fixed wire layout.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let [lo, hi] = self.immediate.to_le_bytes();
        [self.opcode, self.flags, lo, hi]
    }

    /// Decode from the fixed wire layout.
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            opcode: bytes[0],
            flags: bytes[1],
            immediate: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Opcode::try_from(self.opcode) {
            Ok(opcode) if opcode.uses_immediate() => {
                write!(f, "{} {}", opcode.mnemonic(), self.immediate)
            }
            Ok(opcode) => write!(f, "{}", opcode.mnemonic()),
            Err(_) => write!(f, "??(0x{:02x})", self.opcode),
        }
    }
}

/// Errors raised while accepting an instruction stream from the loader.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    /// Byte length disagrees with the instruction count supplied alongside it.
    #[error("instruction stream is {actual} bytes, expected {expected} for the declared count")]
    LengthMismatch { expected: usize, actual: usize },
    /// More instructions than a 16-bit jump immediate can address.
    #[error("program of {count} instructions exceeds the addressable maximum {max}")]
    TooLarge { count: usize, max: usize },
}

/// Immutable, indexed instruction sequence.
///
/// Integrity checking, transport framing, and flash bank selection belong to
/// the loader; this type only validates that the byte region it was handed is
/// consistent with the declared instruction count before first use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    instructions: Vec<Instruction>,
}

impl Program {
    /// Highest instruction count a jump immediate can address.
    pub const MAX_INSTRUCTIONS: usize = 1 << 16;

    /// Program from already-decoded records.
    pub fn from_instructions(instructions: Vec<Instruction>) -> Result<Self, LoadError> {
        if instructions.len() > Self::MAX_INSTRUCTIONS {
            return Err(LoadError::TooLarge {
                count: instructions.len(),
                max: Self::MAX_INSTRUCTIONS,
            });
        }
        Ok(Self { instructions })
    }

    /// Decode a loader-provided byte region of `count` fixed-width records.
    pub fn from_bytes(bytes: &[u8], count: usize) -> Result<Self, LoadError> {
        if count > Self::MAX_INSTRUCTIONS {
            return Err(LoadError::TooLarge {
                count,
                max: Self::MAX_INSTRUCTIONS,
            });
        }
        let expected = count * Instruction::SIZE;
        if bytes.len() != expected {
            return Err(LoadError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let instructions = bytes
            .chunks_exact(Instruction::SIZE)
            .map(|chunk| Instruction::from_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        debug!(count, "instruction stream decoded");
        Ok(Self { instructions })
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the program holds no instructions.
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Record at `index`, if in range.
    pub fn get(&self, index: usize) -> Option<Instruction> {
        self.instructions.get(index).copied()
    }

    /// Full record slice, index order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }
}
