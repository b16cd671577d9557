//! Lowering a scheduled graph to LIR.
//!
//! Blocks are generated in schedule order, which is a reverse post-order: every block's forward
//! predecessors have been generated before it. Each node's result is recorded in an operand map
//! the first time it is lowered. Floating nodes are lowered on demand, so a node first needed by
//! a deoptimisation descriptor is lowered at that point and reused thereafter.

use super::{
    arch::{ArchT, AtomicOp, CallType},
    switch::{self, SwitchStrategy},
    Address, CallDest, DescIdx, Inst, Lir, LirBlock, RuntimeCall, Value,
};
use crate::{
    compile::{CompilationError, ErrorContext},
    config::Config,
    debug_info::{same_locks, DebugInfo, LockScope},
    graph::{
        cfg::{BlockId, Schedule},
        frame_state::FrameStateIdx,
        nodes::{
            Arith, ArithOp, CallTarget, Compare, Condition, Conditional, Convert, DeoptAction,
            DeoptReason, FixedGuard, If, IntegerDivRem, IntegerSwitch, Intrinsic, Invoke,
            InvokeWithException, LoadField, LoadIndexed, MonitorEnter, MonitorExit, MonitorId,
            Negate, NewArray, NewMultiArray, Node, NodeT, NormalizeCompare, Param, StoreField,
            StoreIndexed,
        },
        Graph, NodeIdx,
    },
    meta::{Constant, Kind},
};
use index_vec::{index_vec, IndexVec};
use std::rc::Rc;

type Locks<R> = Option<Rc<LockScope<R>>>;

/// Generate the LIR for `g`, whose control flow has been scheduled as `sched`.
pub fn generate<A: ArchT>(
    arch: &A,
    config: &Config,
    g: &Graph,
    sched: &Schedule,
) -> Result<Lir<A::Reg, A::Opcode>, CompilationError> {
    let mut gen = LirGenerator::new(arch, config, g, sched);
    for b in sched.blocks.indices() {
        gen.block(b)?;
    }
    Ok(gen.lir)
}

pub struct LirGenerator<'a, A: ArchT> {
    arch: &'a A,
    config: &'a Config,
    g: &'a Graph,
    sched: &'a Schedule,
    lir: Lir<A::Reg, A::Opcode>,
    operands: IndexVec<NodeIdx, Option<Value<A::Reg>>>,
    cur: BlockId,
    /// The instructions of the block being generated.
    insts: Vec<Inst<A::Reg, A::Opcode>>,
    /// The most recent frame state: the state before the node being lowered.
    last_state: Option<FrameStateIdx>,
    locks: Locks<A::Reg>,
    /// `None` until a block has been generated.
    entry_locks: IndexVec<BlockId, Option<Locks<A::Reg>>>,
    end_locks: IndexVec<BlockId, Option<Locks<A::Reg>>>,
    end_states: IndexVec<BlockId, Option<FrameStateIdx>>,
}

impl<'a, A: ArchT> LirGenerator<'a, A> {
    pub fn new(arch: &'a A, config: &'a Config, g: &'a Graph, sched: &'a Schedule) -> Self {
        let nblocks = sched.blocks.len();
        LirGenerator {
            arch,
            config,
            g,
            sched,
            lir: Lir {
                blocks: IndexVec::with_capacity(nblocks),
                vars: IndexVec::new(),
                descriptors: IndexVec::new(),
            },
            operands: index_vec![None; g.node_capacity()],
            cur: sched.entry(),
            insts: Vec::new(),
            last_state: None,
            locks: None,
            entry_locks: index_vec![None; nblocks],
            end_locks: index_vec![None; nblocks],
            end_states: index_vec![None; nblocks],
        }
    }

    fn internal(&self, n: NodeIdx, msg: impl Into<String>) -> CompilationError {
        CompilationError::Internal {
            msg: msg.into(),
            context: ErrorContext {
                method: None,
                bci: None,
                node: Some(n),
            },
        }
    }

    fn block_of(&self, n: NodeIdx) -> Result<BlockId, CompilationError> {
        self.sched
            .block_of(n)
            .ok_or_else(|| self.internal(n, "node is not scheduled"))
    }

    fn emit(&mut self, inst: Inst<A::Reg, A::Opcode>) {
        self.insts.push(inst);
    }

    fn new_var(&mut self, kind: Kind) -> Value<A::Reg> {
        self.lir.new_var(kind.stack_kind())
    }

    /// Record `v` as the result of `n`.
    fn set_result(&mut self, n: NodeIdx, v: Value<A::Reg>) {
        assert!(
            self.operands[n].is_none(),
            "%{}: result set twice",
            usize::from(n)
        );
        self.operands[n] = Some(v);
    }

    fn block(&mut self, b: BlockId) -> Result<(), CompilationError> {
        let (g, sched) = (self.g, self.sched);
        let blk = &sched.blocks[b];
        self.cur = b;
        self.insts = Vec::new();

        self.locks = self.merge_locks(b)?;
        self.entry_locks[b] = Some(self.locks.clone());
        self.last_state = g
            .state_after(blk.begin)
            .or_else(|| blk.idom.and_then(|d| self.end_states[d]));

        let mut phis = Vec::with_capacity(blk.phis.len());
        for &p in &blk.phis {
            let v = self.new_var(g.node(p).stamp());
            self.set_result(p, v);
            phis.push(v);
        }
        self.emit(Inst::Label { block: b, phis });
        if b == sched.entry() {
            self.prologue()?;
        }

        for &n in &blk.nodes {
            self.lower(n)?;
            if let Some(s) = g.state_after(n) {
                self.last_state = Some(s);
            }
        }

        if !self.insts.last().is_some_and(|i| i.is_terminator()) {
            if let Some(&s) = blk.succs.first() {
                self.emit(Inst::Jump {
                    dest: s,
                    phi_values: Vec::new(),
                });
            }
        }

        self.end_locks[b] = Some(self.locks.clone());
        self.end_states[b] = self.last_state;
        self.lir.blocks.push(LirBlock {
            id: b,
            insts: std::mem::take(&mut self.insts),
            preds: blk.preds.clone(),
            succs: blk.succs.clone(),
        });
        Ok(())
    }

    /// The locks held on entry to `b`. Every already generated predecessor must agree; back
    /// edges are checked when their loop end is lowered.
    fn merge_locks(&self, b: BlockId) -> Result<Locks<A::Reg>, CompilationError> {
        let mut locks: Option<&Locks<A::Reg>> = None;
        for p in &self.sched.blocks[b].preds {
            let Some(pl) = &self.end_locks[*p] else {
                continue;
            };
            match locks {
                None => locks = Some(pl),
                Some(l) if same_locks(l, pl) => (),
                Some(_) => return Err(different_monitor_states()),
            }
        }
        Ok(locks.cloned().flatten())
    }

    /// Move the incoming arguments into variables.
    pub fn prologue(&mut self) -> Result<(), CompilationError> {
        let g = self.g;
        let kinds = g.method.arg_kinds();
        let locs = self.arch.calling_convention(&kinds, CallType::JavaCallee);
        let mut params = g
            .iter_live()
            .filter_map(|n| match g.node(n) {
                Node::Param(Param { index, kind }) => Some((*index, *kind, n)),
                _ => None,
            })
            .collect::<Vec<_>>();
        params.sort_by_key(|(index, _, _)| *index);
        for (index, kind, n) in params {
            let Some(&src) = locs.get(index) else {
                return Err(self.internal(n, format!("parameter {index} out of range")));
            };
            let dst = self.new_var(kind);
            self.emit(Inst::Move {
                op: self.arch.move_op(kind),
                dst,
                src,
            });
            self.set_result(n, dst);
        }
        Ok(())
    }

    /// The operand holding `n`'s value, lowering `n` first if it is a floating node that has not
    /// yet been lowered. Constants that the architecture cannot use directly are moved into a
    /// fresh variable on every use.
    pub fn operand(&mut self, n: NodeIdx) -> Result<Value<A::Reg>, CompilationError> {
        if let Some(v) = self.operands[n] {
            return Ok(v);
        }
        let g = self.g;
        match g.node(n) {
            Node::Const(c) => {
                if self.arch.can_inline_constant(&c.c) {
                    Ok(Value::Const(c.c))
                } else {
                    let dst = self.new_var(c.c.kind());
                    self.emit(Inst::Move {
                        op: self.arch.move_op(c.c.kind()),
                        dst,
                        src: Value::Const(c.c),
                    });
                    Ok(dst)
                }
            }
            Node::Phi(_) => Err(self.internal(n, "phi used before its merge")),
            x if !x.class().is_fixed() => {
                self.lower_floating(n)?;
                self.operands[n].ok_or_else(|| self.internal(n, "node produced no value"))
            }
            _ => Err(self.internal(n, "value used before it is defined")),
        }
    }

    /// `n`'s operand, moved into a variable if it is a constant.
    fn load(&mut self, n: NodeIdx) -> Result<Value<A::Reg>, CompilationError> {
        let v = self.operand(n)?;
        Ok(self.load_value(v))
    }

    fn load_value(&mut self, v: Value<A::Reg>) -> Value<A::Reg> {
        match v {
            Value::Const(c) => {
                let dst = self.new_var(c.kind());
                self.emit(Inst::Move {
                    op: self.arch.move_op(c.kind()),
                    dst,
                    src: v,
                });
                dst
            }
            _ => v,
        }
    }

    /// Build a descriptor for `fs` with the locks currently held.
    fn describe(
        &mut self,
        fs: FrameStateIdx,
        exception_edge: Option<BlockId>,
    ) -> Result<DescIdx, CompilationError> {
        let g = self.g;
        let locks = self.locks.clone();
        let di = DebugInfo::build(g, fs, locks.as_ref(), exception_edge, |x| self.operand(x))?;
        Ok(self.lir.descriptors.push(di))
    }

    /// A descriptor for a trap in `n`, which resumes in the interpreter before `n`.
    fn trap_state(&mut self, n: NodeIdx) -> Result<DescIdx, CompilationError> {
        let fs = self
            .last_state
            .ok_or_else(|| self.internal(n, "no frame state before trapping node"))?;
        self.describe(fs, None)
    }

    fn state_after(&mut self, n: NodeIdx) -> Result<DescIdx, CompilationError> {
        let fs = self
            .g
            .state_after(n)
            .ok_or_else(|| self.internal(n, "node has no frame state"))?;
        self.describe(fs, None)
    }

    fn lower(&mut self, n: NodeIdx) -> Result<(), CompilationError> {
        let g = self.g;
        match g.node(n) {
            Node::Start(_)
            | Node::Begin(_)
            | Node::Merge(_)
            | Node::LoopBegin(_)
            | Node::LoopExit(_) => (),
            Node::ExceptionObject(_) => {
                let dst = self.new_var(Kind::Object);
                self.emit(Inst::Move {
                    op: self.arch.move_op(Kind::Object),
                    dst,
                    src: self.arch.exception_register(),
                });
                self.set_result(n, dst);
            }
            Node::EntryMarker(_) => {
                let state = self.state_after(n)?;
                self.emit(Inst::OsrEntry { state });
            }
            Node::LoadField(LoadField { object, field }) => {
                let base = self.load(*object)?;
                let state = if field.is_static || self.config.explicit_exceptions {
                    None
                } else {
                    Some(self.trap_state(n)?)
                };
                let dst = self.new_var(field.kind);
                self.emit(Inst::Load {
                    op: self.arch.load_op(field.kind),
                    dst,
                    addr: Address {
                        base,
                        index: None,
                        scale: 1,
                        disp: field_offset(field.offset, n)?,
                    },
                    state,
                });
                self.set_result(n, dst);
            }
            Node::StoreField(StoreField {
                object,
                field,
                value,
            }) => {
                let base = self.load(*object)?;
                let value = self.store_value(*value)?;
                let state = if field.is_static || self.config.explicit_exceptions {
                    None
                } else {
                    Some(self.trap_state(n)?)
                };
                self.emit(Inst::Store {
                    op: self.arch.store_op(field.kind),
                    addr: Address {
                        base,
                        index: None,
                        scale: 1,
                        disp: field_offset(field.offset, n)?,
                    },
                    value,
                    state,
                });
            }
            Node::LoadIndexed(LoadIndexed {
                array,
                index,
                elem_kind,
            }) => {
                let base = self.load(*array)?;
                self.implicit_bounds_check(n, base, *index)?;
                let addr = self.array_address(base, *index, *elem_kind)?;
                let dst = self.new_var(*elem_kind);
                self.emit(Inst::Load {
                    op: self.arch.load_op(*elem_kind),
                    dst,
                    addr,
                    state: None,
                });
                self.set_result(n, dst);
            }
            Node::StoreIndexed(StoreIndexed {
                array,
                index,
                value,
                elem_kind,
            }) => {
                let base = self.load(*array)?;
                self.implicit_bounds_check(n, base, *index)?;
                let addr = self.array_address(base, *index, *elem_kind)?;
                let value = self.store_value(*value)?;
                self.emit(Inst::Store {
                    op: self.arch.store_op(*elem_kind),
                    addr,
                    value,
                    state: None,
                });
            }
            Node::ArrayLength(a) => {
                let base = self.load(a.array)?;
                let state = if self.config.explicit_exceptions {
                    None
                } else {
                    Some(self.trap_state(n)?)
                };
                let dst = self.new_var(Kind::Int);
                self.emit(Inst::Load {
                    op: self.arch.load_op(Kind::Int),
                    dst,
                    addr: Address {
                        base,
                        index: None,
                        scale: 1,
                        disp: self.arch.array_length_offset(),
                    },
                    state,
                });
                self.set_result(n, dst);
            }
            Node::NewInstance(ni) => {
                let state = self.trap_state(n)?;
                let hub = Value::Const(Constant::Object(ni.ty.hub));
                self.runtime_call(n, RuntimeCall::NewInstance, vec![hub], Kind::Object, state)?;
            }
            Node::NewArray(NewArray {
                elem_kind,
                elem_type,
                length,
            }) => {
                let elem = match elem_type {
                    Some(t) => Value::Const(Constant::Object(t.hub)),
                    None => Value::Const(Constant::Int(primitive_array_code(*elem_kind))),
                };
                let length = self.operand(*length)?;
                let state = self.trap_state(n)?;
                self.runtime_call(n, RuntimeCall::NewArray, vec![elem, length], Kind::Object, state)?;
            }
            Node::NewMultiArray(NewMultiArray { ty, dims }) => {
                let mut args = vec![Value::Const(Constant::Object(ty.hub))];
                for d in dims {
                    args.push(self.operand(*d)?);
                }
                let state = self.trap_state(n)?;
                self.runtime_call(n, RuntimeCall::NewMultiArray, args, Kind::Object, state)?;
            }
            Node::CheckCast(cc) => {
                let object = self.operand(cc.object)?;
                let hub = Value::Const(Constant::Object(cc.ty.hub));
                let state = self.trap_state(n)?;
                self.runtime_call(n, RuntimeCall::CheckCast, vec![object, hub], Kind::Object, state)?;
            }
            Node::BytecodeException(be) => {
                let mut args = Vec::with_capacity(be.args.len());
                for a in &be.args {
                    args.push(self.operand(*a)?);
                }
                let state = self.trap_state(n)?;
                self.runtime_call(n, RuntimeCall::CreateException(be.kind), args, Kind::Object, state)?;
            }
            Node::MonitorEnter(MonitorEnter { object, monitor_id }) => {
                self.monitor_enter(n, *object, *monitor_id)?
            }
            Node::MonitorExit(MonitorExit { object, monitor_id }) => {
                self.monitor_exit(n, *object, *monitor_id)?
            }
            Node::Invoke(Invoke {
                target,
                state_during,
                ..
            }) => self.call(n, target, *state_during, None)?,
            Node::InvokeWithException(InvokeWithException {
                target,
                state_during,
                exception_edge,
                ..
            }) => {
                let edge = self.block_of(*exception_edge)?;
                self.call(n, target, *state_during, Some(edge))?
            }
            Node::IntegerDivRem(IntegerDivRem { is_rem, x, y, kind }) => {
                let x = self.load(*x)?;
                let y = self.load(*y)?;
                let state = self.trap_state(n)?;
                let dst = self.new_var(*kind);
                let temp = self.new_var(*kind);
                self.emit(Inst::DivRem {
                    op: self.arch.div_rem_op(*is_rem, *kind),
                    dst,
                    x,
                    y,
                    temp,
                    state,
                });
                self.set_result(n, dst);
            }
            Node::FixedGuard(FixedGuard {
                cond,
                reason,
                action,
                negated,
            }) => {
                let (c, unordered) = self.compare(*cond)?;
                // Deoptimise when the guarded condition fails.
                let (c, unordered) = if *negated {
                    (c, unordered)
                } else {
                    (c.negate(), !unordered)
                };
                let state = self.trap_state(n)?;
                self.emit(Inst::DeoptIf {
                    cond: c,
                    unordered_is_true: unordered,
                    reason: *reason,
                    action: *action,
                    state,
                });
            }
            Node::If(If {
                cond,
                true_succ,
                false_succ,
                prob,
            }) => {
                let true_dest = self.block_of(*true_succ)?;
                let false_dest = self.block_of(*false_succ)?;
                let (c, unordered_is_true) = self.compare(*cond)?;
                self.emit(Inst::Branch {
                    cond: c,
                    unordered_is_true,
                    true_dest,
                    false_dest,
                    prob: *prob,
                });
            }
            Node::IntegerSwitch(sw) => self.switch(n, sw)?,
            Node::End(_) => {
                let merge = g
                    .merge_of(n)
                    .ok_or_else(|| self.internal(n, "end without a merge"))?;
                self.jump(n, merge)?;
            }
            Node::LoopEnd(le) => {
                let header = self.block_of(le.loop_begin)?;
                match &self.entry_locks[header] {
                    Some(l) if same_locks(l, &self.locks) => (),
                    _ => return Err(different_monitor_states()),
                }
                self.jump(n, le.loop_begin)?;
            }
            Node::Return(r) => {
                let value = match r.value {
                    Some(v) => {
                        let reg = self.arch.return_register(g.node(v).stamp());
                        let src = self.operand(v)?;
                        self.emit(Inst::Move {
                            op: self.arch.move_op(reg.kind()),
                            dst: reg,
                            src,
                        });
                        Some(reg)
                    }
                    None => None,
                };
                self.emit(Inst::Return { value });
            }
            Node::Unwind(u) => {
                let exception = self.load(u.exception)?;
                self.emit(Inst::Unwind { exception });
            }
            Node::Deoptimize(d) => {
                let state = self.trap_state(n)?;
                self.emit(Inst::Deopt {
                    reason: d.reason,
                    action: d.action,
                    state,
                });
            }
            // Logic nodes are folded into their users.
            Node::Compare(_) | Node::IsNull(_) | Node::InstanceOf(_) => (),
            Node::VirtualObject(_) | Node::MonitorId(_) | Node::Phi(_) | Node::Const(_) => (),
            _ => {
                if self.operands[n].is_none() {
                    self.lower_floating(n)?;
                }
            }
        }
        Ok(())
    }

    fn lower_floating(&mut self, n: NodeIdx) -> Result<(), CompilationError> {
        let g = self.g;
        match g.node(n) {
            Node::Arith(Arith { op, x, y, kind }) => {
                let dst = self.arith(n, *op, *x, *y, *kind)?;
                self.set_result(n, dst);
            }
            Node::Negate(Negate { x, kind }) => {
                let x = self.load(*x)?;
                let dst = self.new_var(*kind);
                self.emit(Inst::Unary {
                    op: self.arch.negate_op(*kind),
                    dst,
                    x,
                });
                self.set_result(n, dst);
            }
            Node::Convert(Convert { op, x }) => {
                let x = self.load(*x)?;
                let dst = self.new_var(op.to_kind());
                self.emit(Inst::Unary {
                    op: self.arch.convert_op(*op),
                    dst,
                    x,
                });
                self.set_result(n, dst);
            }
            Node::NormalizeCompare(NormalizeCompare {
                x,
                y,
                kind,
                unordered_less,
            }) => {
                let x = self.load(*x)?;
                let y = self.operand(*y)?;
                self.emit(Inst::Compare {
                    op: self.arch.compare_op(*kind),
                    x,
                    y,
                });
                let ne = self.new_var(Kind::Int);
                self.emit(Inst::CondMove {
                    cond: Condition::Eq,
                    unordered_is_true: false,
                    dst: ne,
                    t: Value::Const(Constant::Int(0)),
                    f: Value::Const(Constant::Int(1)),
                });
                let dst = self.new_var(Kind::Int);
                self.emit(Inst::CondMove {
                    cond: Condition::Lt,
                    unordered_is_true: *unordered_less,
                    dst,
                    t: Value::Const(Constant::Int(-1)),
                    f: ne,
                });
                self.set_result(n, dst);
            }
            Node::Conditional(Conditional { cond, t, f, kind }) => {
                let t = self.operand(*t)?;
                let f = self.operand(*f)?;
                let (c, unordered_is_true) = self.compare(*cond)?;
                let dst = self.new_var(*kind);
                self.emit(Inst::CondMove {
                    cond: c,
                    unordered_is_true,
                    dst,
                    t,
                    f,
                });
                self.set_result(n, dst);
            }
            Node::ValueProxy(p) => {
                let v = self.operand(p.value)?;
                self.set_result(n, v);
            }
            Node::Intrinsic(Intrinsic { op, x, kind }) => {
                let xk = g.node(*x).stamp();
                let op = self.arch.intrinsic_op(*op, xk)?;
                let x = self.load(*x)?;
                let dst = self.new_var(*kind);
                self.emit(Inst::Unary { op, dst, x });
                self.set_result(n, dst);
            }
            Node::Param(_) => return Err(self.internal(n, "parameter not set up by the prologue")),
            x => {
                return Err(self.internal(
                    n,
                    format!("cannot lower {}", NodeT::to_string(x)),
                ))
            }
        }
        Ok(())
    }

    fn arith(
        &mut self,
        n: NodeIdx,
        op: ArithOp,
        x: NodeIdx,
        y: NodeIdx,
        kind: Kind,
    ) -> Result<Value<A::Reg>, CompilationError> {
        let Some(opc) = self.arch.arith_op(op, kind) else {
            if op == ArithOp::Rem && kind.is_numeric_float() {
                let args = vec![self.operand(x)?, self.operand(y)?];
                return self
                    .runtime_call_value(RuntimeCall::FloatRem(kind), args, kind, None)
                    .ok_or_else(|| self.internal(n, "remainder call produced no value"));
            }
            return Err(self.internal(n, format!("no instruction for {op} on {kind}")));
        };
        let (mut xv, mut yv) = (self.operand(x)?, self.operand(y)?);
        if op.is_commutative() && !xv.is_var() && yv.is_var() {
            std::mem::swap(&mut xv, &mut yv);
        }
        let xv = self.load_value(xv);
        if op.is_shift() && !matches!(yv, Value::Const(_)) {
            if let Some(r) = self.arch.shift_count_register() {
                let count = Value::Reg(r, Kind::Int);
                self.emit(Inst::Move {
                    op: self.arch.move_op(Kind::Int),
                    dst: count,
                    src: yv,
                });
                yv = count;
            }
        }
        let dst = self.new_var(kind);
        self.emit(Inst::Binary {
            op: opc,
            dst,
            x: xv,
            y: yv,
        });
        Ok(dst)
    }

    /// Emit a compare for the logic node `cond`, returning the condition (and its unordered
    /// behaviour) under which it holds.
    fn compare(&mut self, cond: NodeIdx) -> Result<(Condition, bool), CompilationError> {
        let g = self.g;
        match g.node(cond) {
            Node::Compare(Compare {
                cond: c,
                x,
                y,
                unordered_is_true,
            }) => {
                let kind = g.node(*x).stamp();
                let (mut xv, mut yv) = (self.operand(*x)?, self.operand(*y)?);
                let mut c = *c;
                if !xv.is_var() && yv.is_var() {
                    std::mem::swap(&mut xv, &mut yv);
                    c = c.mirror();
                }
                let xv = self.load_value(xv);
                self.emit(Inst::Compare {
                    op: self.arch.compare_op(kind),
                    x: xv,
                    y: yv,
                });
                Ok((c, *unordered_is_true))
            }
            Node::IsNull(isn) => {
                let x = self.load(isn.x)?;
                self.emit(Inst::Compare {
                    op: self.arch.compare_op(Kind::Object),
                    x,
                    y: Value::Const(Constant::Null),
                });
                Ok((Condition::Eq, false))
            }
            Node::InstanceOf(io) => {
                let x = self.operand(io.x)?;
                let hub = Value::Const(Constant::Object(io.ty.hub));
                let r = self
                    .runtime_call_value(RuntimeCall::InstanceOf, vec![x, hub], Kind::Int, None)
                    .ok_or_else(|| self.internal(cond, "instanceof produced no value"))?;
                self.emit(Inst::Compare {
                    op: self.arch.compare_op(Kind::Int),
                    x: r,
                    y: Value::Const(Constant::Int(0)),
                });
                Ok((Condition::Ne, false))
            }
            x => Err(self.internal(
                cond,
                format!("cannot branch on {}", NodeT::to_string(x)),
            )),
        }
    }

    /// A value to be stored to memory.
    fn store_value(&mut self, n: NodeIdx) -> Result<Value<A::Reg>, CompilationError> {
        if let Node::Const(c) = self.g.node(n) {
            if self.arch.can_store_constant(&c.c) {
                return Ok(Value::Const(c.c));
            }
        }
        self.load(n)
    }

    fn array_address(
        &mut self,
        base: Value<A::Reg>,
        index: NodeIdx,
        kind: Kind,
    ) -> Result<Address<A::Reg>, CompilationError> {
        let scale = self.arch.array_index_scale(kind);
        let off = self.arch.array_base_offset(kind);
        if let Node::Const(c) = self.g.node(index) {
            if let Some(i) = c.c.as_int() {
                let disp = i64::from(off) + i64::from(i) * i64::from(scale);
                if self.arch.is_legal_displacement(disp) {
                    if let Ok(disp) = i32::try_from(disp) {
                        return Ok(Address {
                            base,
                            index: None,
                            scale,
                            disp,
                        });
                    }
                }
            }
        }
        let index = self.load(index)?;
        Ok(Address {
            base,
            index: Some(index),
            scale,
            disp: off,
        })
    }

    /// Unless bounds are checked explicitly in the graph, check `index` against the length of
    /// `array`, deoptimising if it is out of bounds. The length load doubles as a null check.
    fn implicit_bounds_check(
        &mut self,
        n: NodeIdx,
        array: Value<A::Reg>,
        index: NodeIdx,
    ) -> Result<(), CompilationError> {
        if self.config.explicit_exceptions {
            return Ok(());
        }
        let state = self.trap_state(n)?;
        let len = self.new_var(Kind::Int);
        self.emit(Inst::Load {
            op: self.arch.load_op(Kind::Int),
            dst: len,
            addr: Address {
                base: array,
                index: None,
                scale: 1,
                disp: self.arch.array_length_offset(),
            },
            state: Some(state),
        });
        let index = self.load(index)?;
        self.emit(Inst::Compare {
            op: self.arch.compare_op(Kind::Int),
            x: index,
            y: len,
        });
        self.emit(Inst::DeoptIf {
            cond: Condition::Ae,
            unordered_is_true: false,
            reason: DeoptReason::BoundsCheck,
            action: DeoptAction::InvalidateReprofile,
            state,
        });
        Ok(())
    }

    /// Call the runtime, setting `n`'s result to the returned value.
    fn runtime_call(
        &mut self,
        n: NodeIdx,
        call: RuntimeCall,
        args: Vec<Value<A::Reg>>,
        result_kind: Kind,
        state: DescIdx,
    ) -> Result<(), CompilationError> {
        let v = self
            .runtime_call_value(call, args, result_kind, Some(state))
            .ok_or_else(|| self.internal(n, "runtime call produced no value"))?;
        self.set_result(n, v);
        Ok(())
    }

    fn runtime_call_value(
        &mut self,
        call: RuntimeCall,
        args: Vec<Value<A::Reg>>,
        result_kind: Kind,
        state: Option<DescIdx>,
    ) -> Option<Value<A::Reg>> {
        let kinds = args.iter().map(|a| a.kind()).collect::<Vec<_>>();
        let locs = self.arch.calling_convention(&kinds, CallType::Runtime);
        for (&dst, &src) in locs.iter().zip(&args) {
            self.emit(Inst::Move {
                op: self.arch.move_op(src.kind()),
                dst,
                src,
            });
        }
        let result = (result_kind != Kind::Void).then(|| self.arch.return_register(result_kind));
        self.emit(Inst::Call {
            dest: CallDest::Runtime(call),
            args: locs,
            result,
            temps: self.arch.caller_saved(),
            state,
        });
        let ret = result?;
        let dst = self.new_var(result_kind);
        self.emit(Inst::Move {
            op: self.arch.move_op(result_kind),
            dst,
            src: ret,
        });
        Some(dst)
    }

    fn call(
        &mut self,
        n: NodeIdx,
        target: &CallTarget,
        state_during: Option<FrameStateIdx>,
        exception_edge: Option<BlockId>,
    ) -> Result<(), CompilationError> {
        let g = self.g;
        let kinds = target
            .args
            .iter()
            .map(|a| g.node(*a).stamp())
            .collect::<Vec<_>>();
        let locs = self.arch.calling_convention(&kinds, CallType::JavaCall);
        let mut srcs = Vec::with_capacity(target.args.len());
        for a in &target.args {
            srcs.push(self.operand(*a)?);
        }
        for (&dst, &src) in locs.iter().zip(&srcs) {
            self.emit(Inst::Move {
                op: self.arch.move_op(dst.kind()),
                dst,
                src,
            });
        }
        let fs = state_during
            .or(self.last_state)
            .ok_or_else(|| self.internal(n, "call has no frame state"))?;
        let state = self.describe(fs, exception_edge)?;
        let dest = if target.invoke_kind.is_direct() || target.method.can_be_statically_bound {
            CallDest::Direct(target.method.clone())
        } else {
            CallDest::Virtual(target.method.clone())
        };
        let result = (target.return_kind != Kind::Void)
            .then(|| self.arch.return_register(target.return_kind));
        self.emit(Inst::Call {
            dest,
            args: locs,
            result,
            temps: self.arch.caller_saved(),
            state: Some(state),
        });
        if let Some(ret) = result {
            let dst = self.new_var(target.return_kind);
            self.emit(Inst::Move {
                op: self.arch.move_op(target.return_kind),
                dst,
                src: ret,
            });
            self.set_result(n, dst);
        }
        Ok(())
    }

    fn monitor_enter(
        &mut self,
        n: NodeIdx,
        object: NodeIdx,
        monitor_id: NodeIdx,
    ) -> Result<(), CompilationError> {
        let g = self.g;
        let Node::MonitorId(MonitorId {
            lock_depth,
            eliminated,
        }) = g.node(monitor_id)
        else {
            return Err(self.internal(n, "lock without a monitor id"));
        };
        let fs = g
            .state_after(n)
            .ok_or_else(|| self.internal(n, "monitor enter has no frame state"))?;
        let slot = self.lock_slot(n, *lock_depth)?;
        let obj = self.load(object)?;
        self.locks = Some(LockScope::push(
            self.locks.take(),
            g.frame_state(fs).inlining_id,
            object,
            monitor_id,
            slot,
            *eliminated,
        ));
        let state = self.describe(fs, None)?;
        let temp = self.new_var(Kind::Long);
        self.emit(Inst::MonitorEnter {
            op: self.arch.atomic_op(AtomicOp::CompareAndSwap, Kind::Long),
            object: obj,
            lock: slot,
            temp,
            state,
        });
        Ok(())
    }

    fn monitor_exit(
        &mut self,
        n: NodeIdx,
        object: NodeIdx,
        monitor_id: NodeIdx,
    ) -> Result<(), CompilationError> {
        let Some(top) = self.locks.take() else {
            return Err(not_on_top());
        };
        if top.monitor_id != monitor_id {
            return Err(not_on_top());
        }
        self.locks = top.outer.clone();
        let obj = self.load(object)?;
        let state = self.state_after(n)?;
        let temp = self.new_var(Kind::Long);
        self.emit(Inst::MonitorExit {
            op: self.arch.atomic_op(AtomicOp::CompareAndSwap, Kind::Long),
            object: obj,
            lock: top.slot,
            temp,
            state,
        });
        Ok(())
    }

    fn lock_slot(&self, n: NodeIdx, depth: usize) -> Result<Value<A::Reg>, CompilationError> {
        i32::try_from(depth)
            .ok()
            .and_then(|d| d.checked_mul(self.arch.lock_slot_size()))
            .map(|off| Value::Stack(off, Kind::Long))
            .ok_or_else(|| self.internal(n, "lock depth too large"))
    }

    fn switch(&mut self, n: NodeIdx, sw: &IntegerSwitch) -> Result<(), CompilationError> {
        let default = self.block_of(sw.default_succ())?;
        let mut cases = Vec::with_capacity(sw.keys.len());
        for (k, s) in sw.keys.iter().zip(&sw.key_succ) {
            let succ = *sw
                .succs
                .get(*s)
                .ok_or_else(|| self.internal(n, "switch successor out of range"))?;
            cases.push((*k, self.block_of(succ)?));
        }
        cases.sort_by_key(|(k, _)| *k);
        let keys = cases.iter().map(|(k, _)| *k).collect::<Vec<_>>();
        let dests = cases.iter().map(|(_, d)| *d).collect::<Vec<_>>();
        let value = self.load(sw.value)?;
        match switch::choose(self.config, sw.kind, &keys, &dests, default) {
            SwitchStrategy::Sequential => self.emit(Inst::SwitchSequential {
                value,
                cases,
                default,
            }),
            SwitchStrategy::RangeTests(tests) => self.emit(Inst::SwitchRanges {
                value,
                tests,
                default,
            }),
            SwitchStrategy::Table { low, targets } => {
                let temp = self.new_var(Kind::Long);
                self.emit(Inst::TableSwitch {
                    value,
                    temp,
                    low,
                    targets,
                    default,
                })
            }
        }
        Ok(())
    }

    /// Jump from the end node `n` to `merge`, passing the inputs of `merge`'s phis.
    fn jump(&mut self, n: NodeIdx, merge: NodeIdx) -> Result<(), CompilationError> {
        let (g, sched) = (self.g, self.sched);
        let mb = self.block_of(merge)?;
        let pred_idx = sched.blocks[mb]
            .preds
            .iter()
            .position(|p| *p == self.cur)
            .ok_or_else(|| self.internal(n, "end is not a predecessor of its merge"))?;
        let mut phi_values = Vec::with_capacity(sched.blocks[mb].phis.len());
        for &p in &sched.blocks[mb].phis {
            let Node::Phi(phi) = g.node(p) else {
                return Err(self.internal(p, "merge phi is not a phi"));
            };
            let v = *phi
                .values
                .get(pred_idx)
                .ok_or_else(|| self.internal(p, "phi has too few inputs"))?;
            phi_values.push(self.operand(v)?);
        }
        self.emit(Inst::Jump {
            dest: mb,
            phi_values,
        });
        Ok(())
    }
}

fn different_monitor_states() -> CompilationError {
    CompilationError::Bailout(
        "unbalanced monitors: predecessor blocks have different monitor states".into(),
    )
}

fn not_on_top() -> CompilationError {
    CompilationError::Bailout(
        "unbalanced monitors: attempting to unlock an object that is not on top of the locking stack"
            .into(),
    )
}

fn field_offset(offset: u32, n: NodeIdx) -> Result<i32, CompilationError> {
    i32::try_from(offset).map_err(|_| CompilationError::Internal {
        msg: format!("field offset {offset} too large"),
        context: ErrorContext {
            node: Some(n),
            ..ErrorContext::default()
        },
    })
}

/// The `newarray` operand for arrays of `kind`.
fn primitive_array_code(kind: Kind) -> i32 {
    match kind {
        Kind::Boolean => 4,
        Kind::Char => 5,
        Kind::Float => 6,
        Kind::Double => 7,
        Kind::Byte => 8,
        Kind::Short => 9,
        Kind::Int => 10,
        Kind::Long => 11,
        _ => 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        amd64::Amd64,
        builder::build_graph,
        bytecode::blockmap::test::method,
        config::ConfigBuilder,
        graph::{
            frame_state::{Bci, FrameState},
            nodes::{Begin, Const, End, IsNull, Merge, Prob, Return},
            simplify::post_parse_cleanup,
        },
        meta::{HeapSnapshot, Registry},
    };
    use fm::FMBuilder;
    use lazy_static::lazy_static;
    use regex::Regex;
    use std::sync::Arc;

    lazy_static! {
        static ref PTN_RE: Regex = Regex::new(r"\{\{.+?\}\}").unwrap();
        static ref PTN_RE_IGNORE: Regex = Regex::new(r"\{\{_}\}").unwrap();
        static ref TEXT_RE: Regex = Regex::new(r"[a-zA-Z0-9\._]+").unwrap();
    }

    fn graph(sig: &str, src: &str, config: &Config) -> Graph {
        let m = Arc::new(method(sig, src));
        let mut g = build_graph(&m, None, config, &Registry::new(), &HeapSnapshot::default())
            .unwrap();
        post_parse_cleanup(&mut g);
        g
    }

    fn lir_with(
        sig: &str,
        src: &str,
        config: &Config,
    ) -> Result<Lir<crate::amd64::Reg, crate::amd64::Amd64Op>, CompilationError> {
        let g = graph(sig, src, config);
        let sched = Schedule::new(&g).unwrap();
        generate(&Amd64::new(), config, &g, &sched)
    }

    fn lir(sig: &str, src: &str) -> Lir<crate::amd64::Reg, crate::amd64::Amd64Op> {
        lir_with(sig, src, &Config::default()).unwrap()
    }

    fn match_lir(sig: &str, src: &str, ptn: &str) {
        let s = lir(sig, src).to_string();
        let fm = FMBuilder::new(ptn)
            .unwrap()
            .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
            .name_matcher_ignore(PTN_RE_IGNORE.clone(), TEXT_RE.clone())
            .build()
            .unwrap();
        if let Err(e) = fm.matches(&s) {
            panic!("{e}");
        }
    }

    #[test]
    fn straight_line() {
        match_lir(
            "(II)I",
            "iload_0\niload_1\niadd\nireturn",
            "
              bb0:
                {{x}} = movl rsi
                {{y}} = movl rdx
                {{z}} = addl {{x}}, {{y}}
                rax = movl {{z}}
                return rax
            ",
        );
    }

    #[test]
    fn constant_operands_come_second() {
        let src = "
              iconst_5
              iload_0
              if_icmpge L1
              iconst_1
              ireturn
            L1:
              iconst_0
              ireturn
            ";
        match_lir(
            "(I)I",
            src,
            "
              bb0:
                {{x}} = movl rsi
                cmpl {{x}}, 5i
                branch {{_}} bb{{_}}, bb{{_}} p={{_}}
              ...
            ",
        );
        // `5 >= x` holds exactly when `x <= 5`.
        let l = lir("(I)I", src);
        let conds = l
            .iter_insts()
            .filter_map(|i| match i {
                Inst::Branch { cond, .. } => Some(*cond),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(conds.len(), 1);
        assert!(matches!(conds[0], Condition::Gt | Condition::Le));
    }

    #[test]
    fn loop_phis() {
        let l = lir(
            "(I)I",
            "iconst_0
             istore_1
             L0:
             iload_0
             ifle L1
             iload_1
             iload_0
             iadd
             istore_1
             iinc 0 -1
             goto L0
             L1:
             iload_1
             ireturn",
        );
        let header = l
            .blocks
            .iter()
            .find(|b| matches!(&b.insts[0], Inst::Label { phis, .. } if phis.len() == 2))
            .unwrap();
        assert_eq!(header.preds.len(), 2);
        // Both the entry and the back edge pass one value per phi.
        let jumps = l
            .iter_insts()
            .filter(|i| matches!(i, Inst::Jump { dest, phi_values } if *dest == header.id && phi_values.len() == 2))
            .count();
        assert_eq!(jumps, 2);
    }

    #[test]
    fn operands_are_lowered_once() {
        let config = Config::default();
        let g = graph("(I)I", "iload_0\niconst_3\nimul\ndup\niadd\nireturn", &config);
        let sched = Schedule::new(&g).unwrap();
        let arch = Amd64::new();
        let mut gen = LirGenerator::new(&arch, &config, &g, &sched);
        gen.prologue().unwrap();
        let add = g
            .iter_live()
            .find(|n| matches!(g.node(*n), Node::Arith(Arith { op: ArithOp::Add, .. })))
            .unwrap();
        let mul = g
            .iter_live()
            .find(|n| matches!(g.node(*n), Node::Arith(Arith { op: ArithOp::Mul, .. })))
            .unwrap();
        let v = gen.operand(add).unwrap();
        let before = gen.insts.len();
        assert_eq!(gen.operand(add).unwrap(), v);
        gen.operand(mul).unwrap();
        assert_eq!(gen.insts.len(), before);
        let muls = gen
            .insts
            .iter()
            .filter(|i| matches!(i, Inst::Binary { op, .. } if op.to_string() == "imull"))
            .count();
        assert_eq!(muls, 1);
    }

    #[test]
    fn wide_constants_are_materialised() {
        let config = Config::default();
        let mut g = graph("()V", "return", &config);
        let small = g.unique(Node::Const(Const {
            c: Constant::Long(7),
        }));
        let wide = g.unique(Node::Const(Const {
            c: Constant::Long(1 << 32),
        }));
        let sched = Schedule::new(&g).unwrap();
        let arch = Amd64::new();
        let mut gen = LirGenerator::new(&arch, &config, &g, &sched);
        assert_eq!(gen.operand(small).unwrap(), Value::Const(Constant::Long(7)));
        assert!(gen.insts.is_empty());
        // Every use gets its own move.
        let a = gen.operand(wide).unwrap();
        let b = gen.operand(wide).unwrap();
        assert!(a.is_var() && b.is_var() && a != b);
        assert_eq!(gen.insts.len(), 2);
    }

    #[test]
    fn trapping_instructions_get_descriptors() {
        let l = lir("([II)I", "aload_0\niload_1\niaload\nireturn");
        let s = l.to_string();
        assert!(s.contains("deopt_if ae BoundsCheck InvalidateReprofile [d0]"), "{s}");
        // The length load and the bounds check share a descriptor.
        assert_eq!(l.descriptors.len(), 1);
        assert_eq!(l.descriptors[DescIdx::new(0)].frames.len(), 1);

        // With explicit exceptions the graph does the checking.
        let config = ConfigBuilder::new().explicit_exceptions(true).build();
        let l = lir_with("([II)I", "aload_0\niload_1\niaload\nireturn", &config).unwrap();
        assert!(!l.iter_insts().any(|i| matches!(i, Inst::DeoptIf { .. })));
        assert!(l.iter_insts().any(|i| matches!(
            i,
            Inst::Call {
                dest: CallDest::Runtime(RuntimeCall::CreateException(_)),
                ..
            }
        )));
    }

    #[test]
    fn switches() {
        let src = "
              iload_0
              tableswitch 0 default:L3 L1 L1 L1 L1 L1 L2 L2 L2 L2 L2
            L1:
              iconst_1
              ireturn
            L2:
              iconst_2
              ireturn
            L3:
              iconst_3
              ireturn
            ";
        let l = lir("(I)I", src);
        let s = l.to_string();
        assert!(s.contains("switch_ranges"), "{s}");
        assert!(s.contains("ge 0 le 4 -> bb"), "{s}");
        assert!(s.contains("ge 5 le 9 -> bb"), "{s}");

        let config = ConfigBuilder::new().sequential_switch_limit(10).build();
        let l = lir_with("(I)I", src, &config).unwrap();
        assert!(l.to_string().contains("switch_seq"));
    }

    #[test]
    fn monitors() {
        let l = lir(
            "(Ljava/lang/Object;)V",
            "aload_0\nmonitorenter\naload_0\nmonitorexit\nreturn",
        );
        let s = l.to_string();
        assert!(s.contains("monitor_enter v0, stack:0"), "{s}");
        assert!(s.contains("monitor_exit v0, stack:0"), "{s}");
        let enter = l
            .iter_insts()
            .find_map(|i| match i {
                Inst::MonitorEnter { state, .. } => Some(*state),
                _ => None,
            })
            .unwrap();
        assert_eq!(l.descriptors[enter].frames[0].num_locks, 1);
    }

    /// Build `start -> if (p0 == null) -> [t: begin, f: begin] -> merge -> return`, letting
    /// `t_body` add nodes after the true begin.
    fn diamond(t_body: impl FnOnce(&mut Graph, NodeIdx, NodeIdx) -> NodeIdx) -> Graph {
        let mut g = Graph::new(Arc::new(method(
            "(Ljava/lang/Object;Ljava/lang/Object;)V",
            "return",
        )));
        let p0 = g.unique(Node::Param(Param {
            index: 0,
            kind: Kind::Object,
        }));
        let fs = g.add_frame_state(state(&g, vec![Some(p0)], Vec::new(), Vec::new()));
        g.set_state_after(g.start(), Some(fs));
        let cond = g.unique(Node::IsNull(IsNull { x: p0 }));
        let t = g.add_node(Node::Begin(Begin));
        let f = g.add_node(Node::Begin(Begin));
        let iff = g.add_node(Node::If(If {
            cond,
            true_succ: t,
            false_succ: f,
            prob: Prob::new(0.5),
        }));
        g.set_next(g.start(), iff);
        let t_last = t_body(&mut g, t, p0);
        let te = g.add_node(Node::End(End));
        let fe = g.add_node(Node::End(End));
        g.set_next(t_last, te);
        g.set_next(f, fe);
        let m = g.add_node(Node::Merge(Merge { ends: vec![te, fe] }));
        let r = g.add_node(Node::Return(Return { value: None }));
        g.set_next(m, r);
        g
    }

    fn state(
        g: &Graph,
        locals: Vec<Option<NodeIdx>>,
        locks: Vec<NodeIdx>,
        monitor_ids: Vec<NodeIdx>,
    ) -> FrameState {
        FrameState {
            outer: None,
            method: Arc::clone(&g.method),
            inlining_id: 0,
            bci: Bci::At(1),
            locals,
            stack: Vec::new(),
            locks,
            monitor_ids,
            rethrow_exception: false,
            during_call: false,
            virtual_mappings: Vec::new(),
        }
    }

    fn lock(g: &mut Graph, after: NodeIdx, object: NodeIdx, depth: usize) -> (NodeIdx, NodeIdx) {
        let mid = g.add_node(Node::MonitorId(MonitorId {
            lock_depth: depth,
            eliminated: false,
        }));
        let enter = g.add_node(Node::MonitorEnter(MonitorEnter {
            object,
            monitor_id: mid,
        }));
        g.set_next(after, enter);
        (enter, mid)
    }

    fn bailout(g: &Graph) -> String {
        let sched = Schedule::new(g).unwrap();
        match generate(&Amd64::new(), &Config::default(), g, &sched) {
            Err(CompilationError::Bailout(m)) => m,
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn merge_with_different_locks() {
        let g = diamond(|g, t, p0| {
            let (enter, mid) = lock(g, t, p0, 0);
            let fs = g.add_frame_state(state(g, vec![Some(p0)], vec![p0], vec![mid]));
            g.set_state_after(enter, Some(fs));
            enter
        });
        assert_eq!(
            bailout(&g),
            "unbalanced monitors: predecessor blocks have different monitor states"
        );
    }

    #[test]
    fn unlock_not_on_top() {
        let g = diamond(|g, t, p0| {
            let p1 = g.unique(Node::Param(Param {
                index: 1,
                kind: Kind::Object,
            }));
            let (e1, m1) = lock(g, t, p0, 0);
            let fs = g.add_frame_state(state(g, vec![Some(p0)], vec![p0], vec![m1]));
            g.set_state_after(e1, Some(fs));
            let (e2, m2) = lock(g, e1, p1, 1);
            let fs = g.add_frame_state(state(g, vec![Some(p0)], vec![p0, p1], vec![m1, m2]));
            g.set_state_after(e2, Some(fs));
            let exit = g.add_node(Node::MonitorExit(MonitorExit {
                object: p0,
                monitor_id: m1,
            }));
            g.set_next(e2, exit);
            exit
        });
        assert_eq!(
            bailout(&g),
            "unbalanced monitors: attempting to unlock an object that is not on top of the locking stack"
        );
    }
}
