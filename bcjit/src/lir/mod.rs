//! The low-level intermediate representation.
//!
//! LIR is close to machine code but not yet register allocated: most values live in unbounded
//! virtual registers ("variables"), while calling conventions and instruction constraints show
//! up as fixed physical registers and stack slots. Instructions are grouped into blocks that
//! mirror the [crate::graph::cfg::Schedule] they were generated from.
//!
//! Control flow uses explicit SSA phis: the label at the start of a merge block defines one
//! variable per phi and every jump to that block passes the matching values.
//!
//! Opcodes are chosen by the architecture ([arch::ArchT]) so that the generator itself needs no
//! knowledge of any instruction encoding.

pub mod arch;
pub mod gen;
pub mod switch;

use crate::{
    debug_info::DebugInfo,
    graph::{
        cfg::BlockId,
        nodes::{BytecodeExceptionKind, Condition, DeoptAction, DeoptReason, MethodRef, Prob},
    },
    meta::{Constant, Kind},
};
use index_vec::IndexVec;
use smallvec::{smallvec, SmallVec};
use std::fmt::{self, Debug, Display, Formatter};
use switch::RangeTest;

index_vec::define_index_type! {
    pub struct VarIdx = u32;
}

index_vec::define_index_type! {
    /// Indexes [Lir::descriptors].
    pub struct DescIdx = u32;
}

/// An operand.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Value<R> {
    Var(VarIdx, Kind),
    Reg(R, Kind),
    Const(Constant),
    /// A slot in the current frame, `offset` bytes from the stack pointer.
    Stack(i32, Kind),
    /// An incoming argument in the caller's frame, `offset` bytes above the return address.
    Incoming(i32, Kind),
    Illegal,
}

impl<R> Value<R> {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Var(_, k) | Value::Reg(_, k) | Value::Stack(_, k) | Value::Incoming(_, k) => {
                *k
            }
            Value::Const(c) => c.kind(),
            Value::Illegal => Kind::Illegal,
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Value::Var(..))
    }
}

impl<R: Display> Display for Value<R> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Value::Var(v, _) => write!(f, "v{}", v.index()),
            Value::Reg(r, _) => write!(f, "{r}"),
            Value::Const(c) => write!(f, "{c}"),
            Value::Stack(o, _) => write!(f, "stack:{o}"),
            Value::Incoming(o, _) => write!(f, "in:{o}"),
            Value::Illegal => write!(f, "-"),
        }
    }
}

/// A memory operand: `base + index * scale + disp`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Address<R> {
    pub base: Value<R>,
    pub index: Option<Value<R>>,
    pub scale: u8,
    pub disp: i32,
}

impl<R: Display> Display for Address<R> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "[{}", self.base)?;
        if let Some(i) = &self.index {
            write!(f, " + {i} * {}", self.scale)?;
        }
        if self.disp != 0 {
            write!(f, " + {}", self.disp)?;
        }
        write!(f, "]")
    }
}

/// The runtime routines compiled code calls for the operations it cannot do inline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RuntimeCall {
    NewInstance,
    NewArray,
    NewMultiArray,
    CheckCast,
    InstanceOf,
    CreateException(BytecodeExceptionKind),
    /// Floating point remainder, which has no machine instruction.
    FloatRem(Kind),
    Unwind,
}

impl Display for RuntimeCall {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            RuntimeCall::NewInstance => write!(f, "new_instance"),
            RuntimeCall::NewArray => write!(f, "new_array"),
            RuntimeCall::NewMultiArray => write!(f, "new_multi_array"),
            RuntimeCall::CheckCast => write!(f, "checkcast"),
            RuntimeCall::InstanceOf => write!(f, "instanceof"),
            RuntimeCall::CreateException(k) => write!(f, "create_exception {k}"),
            RuntimeCall::FloatRem(k) => write!(f, "frem {k}"),
            RuntimeCall::Unwind => write!(f, "unwind"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CallDest {
    /// A statically bound Java method.
    Direct(MethodRef),
    /// A Java method dispatched through the receiver's class.
    Virtual(MethodRef),
    Runtime(RuntimeCall),
}

impl Display for CallDest {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            CallDest::Direct(m) => write!(f, "direct {}", m.qualified_name()),
            CallDest::Virtual(m) => write!(f, "virtual {}", m.qualified_name()),
            CallDest::Runtime(r) => write!(f, "runtime {r}"),
        }
    }
}

/// A LIR instruction. `O` is the architecture's opcode type.
#[derive(Clone, Debug)]
pub enum Inst<R, O> {
    /// Starts every block. At merges `phis` are defined here.
    Label { block: BlockId, phis: Vec<Value<R>> },
    /// An entry point for on-stack replacement.
    OsrEntry { state: DescIdx },
    Move { op: O, dst: Value<R>, src: Value<R> },
    Unary { op: O, dst: Value<R>, x: Value<R> },
    Binary { op: O, dst: Value<R>, x: Value<R>, y: Value<R> },
    /// Integer division, which traps if `y` is zero.
    DivRem { op: O, dst: Value<R>, x: Value<R>, y: Value<R>, temp: Value<R>, state: DescIdx },
    Load { op: O, dst: Value<R>, addr: Address<R>, state: Option<DescIdx> },
    Store { op: O, addr: Address<R>, value: Value<R>, state: Option<DescIdx> },
    /// Set the flags from comparing `x` with `y`.
    Compare { op: O, x: Value<R>, y: Value<R> },
    /// `dst = cond ? t : f`, reading the flags.
    CondMove { cond: Condition, unordered_is_true: bool, dst: Value<R>, t: Value<R>, f: Value<R> },
    Branch {
        cond: Condition,
        unordered_is_true: bool,
        true_dest: BlockId,
        false_dest: BlockId,
        prob: Prob,
    },
    /// Deoptimise if the flags satisfy `cond`.
    DeoptIf { cond: Condition, unordered_is_true: bool, reason: DeoptReason, action: DeoptAction, state: DescIdx },
    Jump { dest: BlockId, phi_values: Vec<Value<R>> },
    SwitchSequential { value: Value<R>, cases: Vec<(i32, BlockId)>, default: BlockId },
    SwitchRanges { value: Value<R>, tests: Vec<RangeTest>, default: BlockId },
    TableSwitch { value: Value<R>, temp: Value<R>, low: i32, targets: Vec<BlockId>, default: BlockId },
    Call {
        dest: CallDest,
        args: Vec<Value<R>>,
        result: Option<Value<R>>,
        /// Registers the call clobbers.
        temps: Vec<Value<R>>,
        state: Option<DescIdx>,
    },
    MonitorEnter { op: O, object: Value<R>, lock: Value<R>, temp: Value<R>, state: DescIdx },
    MonitorExit { op: O, object: Value<R>, lock: Value<R>, temp: Value<R>, state: DescIdx },
    Deopt { reason: DeoptReason, action: DeoptAction, state: DescIdx },
    Return { value: Option<Value<R>> },
    Unwind { exception: Value<R> },
}

impl<R: Copy, O> Inst<R, O> {
    /// The values this instruction reads.
    pub fn uses(&self) -> SmallVec<[Value<R>; 4]> {
        let addr = |a: &Address<R>| {
            let mut v: SmallVec<[Value<R>; 4]> = smallvec![a.base];
            v.extend(a.index);
            v
        };
        match self {
            Inst::Label { .. }
            | Inst::OsrEntry { .. }
            | Inst::CondMove { .. }
            | Inst::Branch { .. }
            | Inst::DeoptIf { .. }
            | Inst::Deopt { .. } => SmallVec::new(),
            Inst::Move { src, .. } => smallvec![*src],
            Inst::Unary { x, .. } => smallvec![*x],
            Inst::Binary { x, y, .. } | Inst::DivRem { x, y, .. } | Inst::Compare { x, y, .. } => {
                smallvec![*x, *y]
            }
            Inst::Load { addr: a, .. } => addr(a),
            Inst::Store { addr: a, value, .. } => {
                let mut v = addr(a);
                v.push(*value);
                v
            }
            Inst::Jump { phi_values, .. } => phi_values.iter().copied().collect(),
            Inst::SwitchSequential { value, .. }
            | Inst::SwitchRanges { value, .. }
            | Inst::TableSwitch { value, .. } => smallvec![*value],
            Inst::Call { args, .. } => args.iter().copied().collect(),
            Inst::MonitorEnter { object, lock, .. } | Inst::MonitorExit { object, lock, .. } => {
                smallvec![*object, *lock]
            }
            Inst::Return { value } => value.iter().copied().collect(),
            Inst::Unwind { exception } => smallvec![*exception],
        }
    }

    /// The values this instruction writes.
    pub fn defs(&self) -> SmallVec<[Value<R>; 4]> {
        match self {
            Inst::Label { phis, .. } => phis.iter().copied().collect(),
            Inst::Move { dst, .. }
            | Inst::Unary { dst, .. }
            | Inst::Binary { dst, .. }
            | Inst::DivRem { dst, .. }
            | Inst::Load { dst, .. }
            | Inst::CondMove { dst, .. } => smallvec![*dst],
            Inst::Call { result, .. } => result.iter().copied().collect(),
            _ => SmallVec::new(),
        }
    }

    /// Values that are clobbered by, but otherwise not part of, this instruction.
    pub fn temps(&self) -> SmallVec<[Value<R>; 4]> {
        match self {
            Inst::DivRem { temp, .. }
            | Inst::TableSwitch { temp, .. }
            | Inst::MonitorEnter { temp, .. }
            | Inst::MonitorExit { temp, .. } => smallvec![*temp],
            Inst::Call { temps, .. } => temps.iter().copied().collect(),
            _ => SmallVec::new(),
        }
    }

    /// The deoptimisation state of an instruction that can trap or call.
    pub fn state(&self) -> Option<DescIdx> {
        match self {
            Inst::OsrEntry { state }
            | Inst::DivRem { state, .. }
            | Inst::DeoptIf { state, .. }
            | Inst::MonitorEnter { state, .. }
            | Inst::MonitorExit { state, .. }
            | Inst::Deopt { state, .. } => Some(*state),
            Inst::Load { state, .. } | Inst::Store { state, .. } | Inst::Call { state, .. } => {
                *state
            }
            _ => None,
        }
    }

    /// Does this instruction end its block?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Branch { .. }
                | Inst::Jump { .. }
                | Inst::SwitchSequential { .. }
                | Inst::SwitchRanges { .. }
                | Inst::TableSwitch { .. }
                | Inst::Deopt { .. }
                | Inst::Return { .. }
                | Inst::Unwind { .. }
        )
    }
}

fn bb(b: BlockId) -> String {
    format!("bb{}", b.index())
}

fn join<T: Display>(xs: &[T]) -> String {
    xs.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(", ")
}

fn state(s: Option<DescIdx>) -> String {
    s.map_or_else(String::new, |s| format!(" [d{}]", s.index()))
}

fn unordered(u: bool) -> &'static str {
    if u {
        " unordered"
    } else {
        ""
    }
}

impl<R: Display, O: Display> Display for Inst<R, O> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Inst::Label { block, phis } => {
                write!(f, "{}:", bb(*block))?;
                if !phis.is_empty() {
                    write!(f, " phis [{}]", join(phis))?;
                }
                Ok(())
            }
            Inst::OsrEntry { state: s } => write!(f, "osr_entry{}", state(Some(*s))),
            Inst::Move { op, dst, src } => write!(f, "{dst} = {op} {src}"),
            Inst::Unary { op, dst, x } => write!(f, "{dst} = {op} {x}"),
            Inst::Binary { op, dst, x, y } => write!(f, "{dst} = {op} {x}, {y}"),
            Inst::DivRem {
                op,
                dst,
                x,
                y,
                temp,
                state: s,
            } => write!(f, "{dst} = {op} {x}, {y} temp {temp}{}", state(Some(*s))),
            Inst::Load {
                op,
                dst,
                addr,
                state: s,
            } => write!(f, "{dst} = {op} {addr}{}", state(*s)),
            Inst::Store {
                op,
                addr,
                value,
                state: s,
            } => write!(f, "{op} {addr}, {value}{}", state(*s)),
            Inst::Compare { op, x, y } => write!(f, "{op} {x}, {y}"),
            Inst::CondMove {
                cond,
                unordered_is_true,
                dst,
                t,
                f: fv,
            } => write!(
                f,
                "{dst} = cmov {cond}{} {t}, {fv}",
                unordered(*unordered_is_true)
            ),
            Inst::Branch {
                cond,
                unordered_is_true,
                true_dest,
                false_dest,
                prob,
            } => write!(
                f,
                "branch {}{} {}, {} p={prob}",
                cond,
                unordered(*unordered_is_true),
                bb(*true_dest),
                bb(*false_dest)
            ),
            Inst::DeoptIf {
                cond,
                unordered_is_true,
                reason,
                action,
                state: s,
            } => write!(
                f,
                "deopt_if {}{} {reason} {action}{}",
                cond,
                unordered(*unordered_is_true),
                state(Some(*s))
            ),
            Inst::Jump { dest, phi_values } => {
                write!(f, "jump {}", bb(*dest))?;
                if !phi_values.is_empty() {
                    write!(f, " [{}]", join(phi_values))?;
                }
                Ok(())
            }
            Inst::SwitchSequential {
                value,
                cases,
                default,
            } => {
                let cases = cases
                    .iter()
                    .map(|(k, b)| format!("{k}: {}", bb(*b)))
                    .collect::<Vec<_>>();
                write!(
                    f,
                    "switch_seq {value} [{}] default {}",
                    cases.join(", "),
                    bb(*default)
                )
            }
            Inst::SwitchRanges {
                value,
                tests,
                default,
            } => write!(
                f,
                "switch_ranges {value} [{}] default {}",
                join(tests),
                bb(*default)
            ),
            Inst::TableSwitch {
                value,
                temp,
                low,
                targets,
                default,
            } => {
                let targets = targets.iter().map(|b| bb(*b)).collect::<Vec<_>>();
                write!(
                    f,
                    "table_switch {value} - {low} [{}] default {} temp {temp}",
                    targets.join(", "),
                    bb(*default)
                )
            }
            Inst::Call {
                dest,
                args,
                result,
                temps: _,
                state: s,
            } => {
                if let Some(r) = result {
                    write!(f, "{r} = ")?;
                }
                write!(f, "call {dest}({}){}", join(args), state(*s))
            }
            Inst::MonitorEnter {
                op,
                object,
                lock,
                temp,
                state: s,
            } => write!(
                f,
                "monitor_enter {object}, {lock} temp {temp} ({op}){}",
                state(Some(*s))
            ),
            Inst::MonitorExit {
                op,
                object,
                lock,
                temp,
                state: s,
            } => write!(
                f,
                "monitor_exit {object}, {lock} temp {temp} ({op}){}",
                state(Some(*s))
            ),
            Inst::Deopt {
                reason,
                action,
                state: s,
            } => write!(f, "deopt {reason} {action}{}", state(Some(*s))),
            Inst::Return { value } => match value {
                Some(v) => write!(f, "return {v}"),
                None => write!(f, "return"),
            },
            Inst::Unwind { exception } => write!(f, "unwind {exception}"),
        }
    }
}

#[derive(Debug)]
pub struct LirBlock<R, O> {
    pub id: BlockId,
    pub insts: Vec<Inst<R, O>>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
}

/// The LIR of one compiled method.
#[derive(Debug)]
pub struct Lir<R, O> {
    pub blocks: IndexVec<BlockId, LirBlock<R, O>>,
    /// The kind of every variable.
    pub vars: IndexVec<VarIdx, Kind>,
    /// The deoptimisation descriptors referenced by instructions.
    pub descriptors: IndexVec<DescIdx, DebugInfo<R>>,
}

impl<R, O> Lir<R, O> {
    pub fn new_var(&mut self, kind: Kind) -> Value<R> {
        Value::Var(self.vars.push(kind), kind)
    }

    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }

    pub fn iter_insts(&self) -> impl Iterator<Item = &Inst<R, O>> {
        self.blocks.iter().flat_map(|b| b.insts.iter())
    }
}

impl<R: Display + Debug, O: Display> Display for Lir<R, O> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for b in &self.blocks {
            for (i, inst) in b.insts.iter().enumerate() {
                if i == 0 && matches!(inst, Inst::Label { .. }) {
                    writeln!(f, "{inst}")?;
                } else {
                    writeln!(f, "  {inst}")?;
                }
            }
        }
        for (i, d) in self.descriptors.iter_enumerated() {
            writeln!(f, "d{}: {d}", i.index())?;
        }
        Ok(())
    }
}
