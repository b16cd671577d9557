//! The interface between the architecture independent LIR generator and a target architecture.

use super::Value;
use crate::{
    compile::CompilationError,
    graph::nodes::{ArithOp, ConvertOp, IntrinsicOp},
    meta::{Constant, Kind},
};
use std::{
    fmt::{Debug, Display},
    hash::Hash,
};

/// Whose calling convention is wanted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallType {
    /// Outgoing arguments of a call to a Java method.
    JavaCall,
    /// Incoming arguments of the method being compiled.
    JavaCallee,
    /// Outgoing arguments of a call into the runtime.
    Runtime,
}

/// Atomic read-modify-write operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AtomicOp {
    CompareAndSwap,
    /// Used to release a lock.
    Store,
}

/// A target architecture. The LIR generator never encodes instructions itself: it asks the
/// architecture which operands it can use directly and which opcode implements an operation.
pub trait ArchT {
    type Reg: Copy + Debug + Display + Eq + Hash;
    type Opcode: Copy + Debug + Display + PartialEq;

    /// Can `c` be used as an immediate operand of an arithmetic or compare instruction? If not it
    /// is first moved into a variable.
    fn can_inline_constant(&self, c: &Constant) -> bool;

    /// Can `c` be stored to memory without first moving it into a variable?
    fn can_store_constant(&self, c: &Constant) -> bool;

    /// Can `disp` be encoded as a memory operand's displacement?
    fn is_legal_displacement(&self, disp: i64) -> bool;

    /// The offset of element 0 from the start of an array of `kind`s.
    fn array_base_offset(&self, kind: Kind) -> i32;
    fn array_length_offset(&self) -> i32;
    /// The distance in bytes between two elements of an array of `kind`s.
    fn array_index_scale(&self, kind: Kind) -> u8;

    fn word_size(&self) -> i32;
    /// The size of the stack slot a held lock occupies.
    fn lock_slot_size(&self) -> i32;

    /// Return the locations arguments of `kinds` are passed in.
    fn calling_convention(&self, kinds: &[Kind], call_type: CallType) -> Vec<Value<Self::Reg>>;
    fn return_register(&self, kind: Kind) -> Value<Self::Reg>;
    /// Where the exception object is found on entry to an exception handler.
    fn exception_register(&self) -> Value<Self::Reg>;
    /// If shift counts must be in a specific register, that register.
    fn shift_count_register(&self) -> Option<Self::Reg>;
    /// The registers a call may clobber.
    fn caller_saved(&self) -> Vec<Value<Self::Reg>>;

    fn move_op(&self, kind: Kind) -> Self::Opcode;
    fn load_op(&self, kind: Kind) -> Self::Opcode;
    fn store_op(&self, kind: Kind) -> Self::Opcode;
    fn compare_op(&self, kind: Kind) -> Self::Opcode;
    /// The opcode for `op` on `kind`s, or `None` if there is no such instruction and the runtime
    /// must be called.
    fn arith_op(&self, op: ArithOp, kind: Kind) -> Option<Self::Opcode>;
    fn negate_op(&self, kind: Kind) -> Self::Opcode;
    fn convert_op(&self, op: ConvertOp) -> Self::Opcode;
    fn div_rem_op(&self, is_rem: bool, kind: Kind) -> Self::Opcode;
    fn atomic_op(&self, op: AtomicOp, kind: Kind) -> Self::Opcode;
    /// Bit scans and counts, and floating point math.
    fn intrinsic_op(&self, op: IntrinsicOp, kind: Kind) -> Result<Self::Opcode, CompilationError>;
}
