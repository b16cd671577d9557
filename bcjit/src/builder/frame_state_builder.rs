//! The abstract interpreter state of the graph builder.
//!
//! A [FrameStateBuilder] tracks which graph node is held in every local variable, operand stack
//! slot and lock slot while a block's bytecode is parsed. It is cheap to clone: a clone is taken
//! whenever a control flow edge needs a state of its own. Snapshots of it are turned into
//! immutable [FrameState]s with [FrameStateBuilder::create].
//!
//! Two slot values (`long` and `double`) occupy a slot holding the value followed by an empty
//! slot, both in locals and on the stack.

use crate::{
    bytecode::{blockmap::BciBlock, liveness::LocalLiveness},
    compile::CompilationError,
    graph::{
        frame_state::{Bci, FrameState, FrameStateIdx},
        nodes::{Const, Node, NodeT, Param, Phi, ValueProxy},
        Graph, NodeIdx,
    },
    meta::{Constant, Kind, ResolvedMethod},
};
use std::sync::Arc;

fn unverifiable(what: &str) -> CompilationError {
    CompilationError::Bailout(format!("{what}; bytecodes would not verify"))
}

#[derive(Clone, Debug)]
pub struct FrameStateBuilder {
    method: Arc<ResolvedMethod>,
    inlining_id: usize,
    locals: Vec<Option<NodeIdx>>,
    stack: Vec<Option<NodeIdx>>,
    locks: Vec<NodeIdx>,
    monitor_ids: Vec<NodeIdx>,
    pub rethrow_exception: bool,
    /// The caller's state at the call site if this is the state of an inlined method.
    outer: Option<FrameStateIdx>,
    /// The number of locks held by the callers of an inlined method.
    outer_lock_depth: usize,
}

impl FrameStateBuilder {
    pub fn new(
        method: Arc<ResolvedMethod>,
        inlining_id: usize,
        outer: Option<FrameStateIdx>,
        outer_lock_depth: usize,
    ) -> Self {
        let locals = vec![None; usize::from(method.max_locals)];
        FrameStateBuilder {
            method,
            inlining_id,
            locals,
            stack: Vec::new(),
            locks: Vec::new(),
            monitor_ids: Vec::new(),
            rethrow_exception: false,
            outer,
            outer_lock_depth,
        }
    }

    /// Store a [Param] node for each of the method's arguments in its locals.
    pub fn init_params(&mut self, g: &mut Graph) -> Result<(), CompilationError> {
        let kinds = self.method.arg_kinds();
        let params = kinds
            .iter()
            .enumerate()
            .map(|(index, &kind)| g.unique(Node::Param(Param { index, kind })))
            .collect::<Vec<_>>();
        self.store_args(&kinds, &params)
    }

    /// Store the argument values `args` (including any receiver) of an inlined call in its locals.
    pub fn init_from_args(&mut self, args: &[NodeIdx]) -> Result<(), CompilationError> {
        let kinds = self.method.arg_kinds();
        if kinds.len() != args.len() {
            return Err(CompilationError::internal(format!(
                "{} expects {} arguments but {} were given",
                self.method.qualified_name(),
                kinds.len(),
                args.len()
            )));
        }
        self.store_args(&kinds, args)
    }

    fn store_args(&mut self, kinds: &[Kind], args: &[NodeIdx]) -> Result<(), CompilationError> {
        let mut slot = 0;
        for (&kind, &a) in kinds.iter().zip(args) {
            if slot + kind.slot_count() > self.locals.len() {
                return Err(unverifiable("arguments do not fit in the locals"));
            }
            self.locals[slot] = Some(a);
            slot += kind.slot_count();
        }
        Ok(())
    }

    fn frame_state(&self, bci: Bci, during_call: bool) -> FrameState {
        FrameState {
            outer: self.outer,
            method: Arc::clone(&self.method),
            inlining_id: self.inlining_id,
            bci,
            locals: self.locals.clone(),
            stack: self.stack.clone(),
            locks: self.locks.clone(),
            monitor_ids: self.monitor_ids.clone(),
            rethrow_exception: self.rethrow_exception,
            during_call,
            virtual_mappings: Vec::new(),
        }
    }

    /// Snapshot this state as an immutable frame state at `bci`.
    pub fn create(&self, g: &mut Graph, bci: Bci) -> FrameStateIdx {
        g.add_frame_state(self.frame_state(bci, false))
    }

    /// Snapshot this state as the state of a caller during a call at `bci`. The call's
    /// arguments `args` have already been popped: they are pushed back onto the snapshot's stack
    /// so that the call can be re-executed.
    pub fn create_during_call(
        &self,
        g: &mut Graph,
        bci: u32,
        args: &[(Kind, NodeIdx)],
    ) -> FrameStateIdx {
        let mut fs = self.frame_state(Bci::At(bci), true);
        fs.rethrow_exception = false;
        for &(k, a) in args {
            fs.stack.push(Some(a));
            if k.needs_two_slots() {
                fs.stack.push(None);
            }
        }
        g.add_frame_state(fs)
    }

    pub fn method(&self) -> &Arc<ResolvedMethod> {
        &self.method
    }

    pub fn inlining_id(&self) -> usize {
        self.inlining_id
    }

    pub fn outer(&self) -> Option<FrameStateIdx> {
        self.outer
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    pub fn locals_size(&self) -> usize {
        self.locals.len()
    }

    pub fn local(&self, i: usize) -> Option<NodeIdx> {
        self.locals.get(i).copied().flatten()
    }

    pub fn push(&mut self, kind: Kind, v: NodeIdx) {
        debug_assert_ne!(kind, Kind::Void);
        self.stack.push(Some(v));
        if kind.needs_two_slots() {
            self.stack.push(None);
        }
    }

    pub fn pop(&mut self, kind: Kind) -> Result<NodeIdx, CompilationError> {
        if kind.needs_two_slots() && self.xpop()?.is_some() {
            return Err(unverifiable("expected a two slot value"));
        }
        self.xpop()?
            .ok_or_else(|| unverifiable("popped the second half of a two slot value"))
    }

    /// Pop the values of `kinds`, returning them in push order.
    pub fn pop_arguments(&mut self, kinds: &[Kind]) -> Result<Vec<NodeIdx>, CompilationError> {
        let mut args = kinds
            .iter()
            .rev()
            .map(|&k| self.pop(k))
            .collect::<Result<Vec<_>, _>>()?;
        args.reverse();
        Ok(args)
    }

    /// Pop a raw stack slot.
    pub fn xpop(&mut self) -> Result<Option<NodeIdx>, CompilationError> {
        self.stack.pop().ok_or_else(|| unverifiable("stack underflow"))
    }

    /// Push a raw stack slot.
    pub fn xpush(&mut self, v: Option<NodeIdx>) {
        self.stack.push(v);
    }

    /// The value `depth` slots below the top of the stack.
    pub fn peek(&self, depth: usize) -> Result<Option<NodeIdx>, CompilationError> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .map(|i| self.stack[i])
            .ok_or_else(|| unverifiable("stack underflow"))
    }

    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }

    pub fn load_local(&self, i: usize, kind: Kind) -> Result<NodeIdx, CompilationError> {
        let v = self
            .locals
            .get(i)
            .copied()
            .flatten()
            .ok_or_else(|| unverifiable(&format!("load of dead or uninitialised local {i}")))?;
        if kind.needs_two_slots() && self.locals.get(i + 1).copied().flatten().is_some() {
            return Err(unverifiable(&format!("local {i} is not a two slot value")));
        }
        Ok(v)
    }

    pub fn store_local(
        &mut self,
        g: &Graph,
        i: usize,
        kind: Kind,
        v: NodeIdx,
    ) -> Result<(), CompilationError> {
        if i + kind.slot_count() > self.locals.len() {
            return Err(unverifiable(&format!("store to local {i} out of range")));
        }
        // Overwriting the second half of a two slot value invalidates it.
        if i > 0 {
            if let Some(prev) = self.locals[i - 1] {
                if g.node(prev).stamp().needs_two_slots() {
                    self.locals[i - 1] = None;
                }
            }
        }
        self.locals[i] = Some(v);
        if kind.needs_two_slots() {
            self.locals[i + 1] = None;
        }
        Ok(())
    }

    /// The number of locks held, including those held by callers of an inlined method.
    pub fn lock_depth(&self) -> usize {
        self.outer_lock_depth + self.locks.len()
    }

    /// The number of locks held by this method.
    pub fn locks_size(&self) -> usize {
        self.locks.len()
    }

    pub fn monitor_ids_size(&self) -> usize {
        self.monitor_ids.len()
    }

    pub fn push_lock(&mut self, object: NodeIdx, monitor_id: NodeIdx) {
        self.locks.push(object);
        self.monitor_ids.push(monitor_id);
    }

    /// Pop the innermost lock, returning its object and monitor id.
    pub fn pop_lock(&mut self) -> Option<(NodeIdx, NodeIdx)> {
        let o = self.locks.pop()?;
        let m = self.monitor_ids.pop()?;
        Some((o, m))
    }

    /// Can `other` be merged into this state? Locks that differ cannot be reconciled and cause a
    /// bailout.
    pub fn is_compatible_with(&self, g: &Graph, other: &Self) -> Result<bool, CompilationError> {
        debug_assert_eq!(self.locals.len(), other.locals.len());
        if self.stack.len() != other.stack.len() {
            return Ok(false);
        }
        for (x, y) in self.stack.iter().zip(&other.stack) {
            match (x, y) {
                (Some(x), Some(y)) if x != y => {
                    if !g.is_live(*x) || !g.is_live(*y) || g.node(*x).stamp() != g.node(*y).stamp()
                    {
                        return Ok(false);
                    }
                }
                (Some(_), None) | (None, Some(_)) => return Ok(false),
                _ => (),
            }
        }
        if self.locks.len() != other.locks.len() {
            return Ok(false);
        }
        for i in 0..self.locks.len() {
            if g.original_value(self.locks[i]) != g.original_value(other.locks[i])
                || self.monitor_ids[i] != other.monitor_ids[i]
            {
                return Err(CompilationError::Bailout("unbalanced monitors".into()));
            }
        }
        Ok(true)
    }

    /// Merge `other`, the state flowing in along a new edge, into this state, which is the entry
    /// state of `merge`. Slots holding different values get a phi; slots whose values cannot be
    /// reconciled become dead.
    ///
    /// This must be called before the new edge's end is added to `merge`.
    pub fn merge(&mut self, g: &mut Graph, merge: NodeIdx, other: &Self) -> Result<(), CompilationError> {
        debug_assert_eq!(self.stack.len(), other.stack.len());
        for i in 0..self.locals.len() {
            self.locals[i] = merge_value(g, merge, self.locals[i], other.locals[i])?;
        }
        for i in 0..self.stack.len() {
            self.stack[i] = merge_value(g, merge, self.stack[i], other.stack[i])?;
        }
        // Locks were checked by `is_compatible_with`: both edges hold the same objects.
        debug_assert!(self
            .locks
            .iter()
            .zip(&other.locks)
            .all(|(x, y)| g.original_value(*x) == g.original_value(*y)));
        debug_assert_eq!(self.monitor_ids, other.monitor_ids);
        Ok(())
    }

    /// Give every slot that may change inside the loop starting at `loop_begin` a phi whose
    /// first input is the slot's current value. Locks get no phi: a lock held at the loop header
    /// must be held on every back edge.
    pub fn insert_loop_phis(
        &mut self,
        g: &mut Graph,
        liveness: &LocalLiveness,
        loop_id: usize,
        loop_begin: NodeIdx,
    ) {
        for i in 0..self.locals.len() {
            if liveness.local_is_changed_in_loop(loop_id, i) {
                self.locals[i] = self.locals[i].map(|v| loop_phi(g, loop_begin, v));
            }
        }
        for i in 0..self.stack.len() {
            self.stack[i] = self.stack[i].map(|v| loop_phi(g, loop_begin, v));
        }
    }

    /// Route every value that was created inside a loop through a proxy at `exit`. `loop_entry`
    /// is the entry state of the loop's header.
    pub fn insert_loop_proxies(
        &mut self,
        g: &mut Graph,
        exit: NodeIdx,
        loop_begin: NodeIdx,
        loop_entry: &FrameStateBuilder,
    ) {
        let proxy = |g: &mut Graph, v: NodeIdx| {
            let n = g.node(v);
            if matches!(n, Node::Const(_)) {
                return v;
            }
            let is_loop_phi = matches!(n, Node::Phi(Phi { merge, .. }) if *merge == loop_begin);
            if loop_entry.contains(v) && !is_loop_phi {
                return v;
            }
            let kind = n.stamp();
            g.unique(Node::ValueProxy(ValueProxy {
                value: v,
                exit,
                kind,
            }))
        };
        for i in 0..self.locals.len() {
            self.locals[i] = self.locals[i].map(|v| proxy(g, v));
        }
        for i in 0..self.stack.len() {
            self.stack[i] = self.stack[i].map(|v| proxy(g, v));
        }
        for i in 0..self.locks.len() {
            self.locks[i] = proxy(g, self.locks[i]);
        }
    }

    /// Forget locals that are not live on entry to `block`.
    pub fn clear_non_live_locals(&mut self, block: &BciBlock, liveness: &LocalLiveness) {
        for i in 0..self.locals.len() {
            if !liveness.local_is_live_in(block.id, i) {
                self.locals[i] = None;
            }
        }
    }

    /// Does any slot of this state hold `v`?
    pub fn contains(&self, v: NodeIdx) -> bool {
        self.locals
            .iter()
            .chain(self.stack.iter())
            .any(|x| *x == Some(v))
            || self.locks.contains(&v)
    }
}

fn is_phi_at(g: &Graph, merge: NodeIdx, v: NodeIdx) -> bool {
    matches!(g.node(v), Node::Phi(Phi { merge: m, .. }) if *m == merge)
}

fn loop_phi(g: &mut Graph, loop_begin: NodeIdx, v: NodeIdx) -> NodeIdx {
    debug_assert!(!is_phi_at(g, loop_begin, v));
    let kind = g.node(v).stamp();
    g.add_node(Node::Phi(Phi {
        merge: loop_begin,
        values: vec![v],
        kind,
    }))
}

fn merge_value(
    g: &mut Graph,
    merge: NodeIdx,
    cur: Option<NodeIdx>,
    other: Option<NodeIdx>,
) -> Result<Option<NodeIdx>, CompilationError> {
    let Some(cur) = cur else {
        return Ok(None);
    };
    if !g.is_live(cur) {
        return Ok(None);
    }
    let kind = g.node(cur).stamp();
    let other = other.filter(|o| g.is_live(*o) && g.node(*o).stamp() == kind);
    if is_phi_at(g, merge, cur) {
        let input = match other {
            Some(o) => o,
            // The phi must be dead: keep it well formed with a value of the right kind.
            None => match Constant::default_for_kind(kind) {
                Some(c) => g.unique(Node::Const(Const { c })),
                None => cur,
            },
        };
        g.add_phi_input(cur, input);
        return Ok(Some(cur));
    }
    match other {
        Some(o) if o == cur => Ok(Some(cur)),
        Some(o) => {
            if matches!(g.node(merge), Node::LoopBegin(_)) {
                return Err(CompilationError::internal(format!(
                    "loop phi for %{} was not created eagerly",
                    usize::from(cur)
                )));
            }
            let mut values = vec![cur; g.phi_predecessor_count(merge)];
            values.push(o);
            Ok(Some(g.add_node(Node::Phi(Phi {
                merge,
                values,
                kind,
            }))))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bytecode::blockmap::test::method,
        graph::nodes::{End, LoopBegin, Merge, MonitorId},
    };

    fn setup(sig: &str) -> (Graph, FrameStateBuilder) {
        let m = Arc::new(method(sig, "iload_0\nireturn"));
        let mut g = Graph::new(Arc::clone(&m));
        let mut fsb = FrameStateBuilder::new(m, 0, None, 0);
        fsb.init_params(&mut g).unwrap();
        (g, fsb)
    }

    fn konst(g: &mut Graph, c: Constant) -> NodeIdx {
        g.unique(Node::Const(Const { c }))
    }

    #[test]
    fn params_and_two_slot_locals() {
        let (mut g, mut fsb) = setup("(IJI)I");
        assert!(fsb.local(0).is_some());
        assert!(fsb.local(1).is_some());
        assert!(fsb.local(2).is_none());
        assert!(fsb.local(3).is_some());
        assert_eq!(fsb.stack_size(), 0);
        // Overwriting the second slot of the long kills the long.
        let one = konst(&mut g, Constant::Int(1));
        fsb.store_local(&g, 2, Kind::Int, one).unwrap();
        assert!(fsb.local(1).is_none());
        assert_eq!(fsb.local(2), Some(one));
        assert!(fsb.load_local(1, Kind::Long).is_err());
    }

    #[test]
    fn push_pop() {
        let (mut g, mut fsb) = setup("()V");
        let l = konst(&mut g, Constant::Long(3));
        let i = konst(&mut g, Constant::Int(4));
        fsb.push(Kind::Long, l);
        fsb.push(Kind::Int, i);
        assert_eq!(fsb.stack_size(), 3);
        assert_eq!(fsb.pop_arguments(&[Kind::Long, Kind::Int]).unwrap(), vec![l, i]);
        assert!(fsb.pop(Kind::Int).is_err());
        fsb.push(Kind::Int, i);
        assert!(fsb.pop(Kind::Long).is_err());
    }

    #[test]
    fn merge_creates_phis_in_arrival_order() {
        let (mut g, mut a) = setup("(II)I");
        let mut b = a.clone();
        let mut c = a.clone();
        let (one, two, three) = (
            konst(&mut g, Constant::Int(1)),
            konst(&mut g, Constant::Int(2)),
            konst(&mut g, Constant::Int(3)),
        );
        a.store_local(&g, 1, Kind::Int, one).unwrap();
        b.store_local(&g, 1, Kind::Int, two).unwrap();
        c.store_local(&g, 1, Kind::Int, three).unwrap();
        let (e1, e2, e3) = (
            g.add_node(Node::End(End)),
            g.add_node(Node::End(End)),
            g.add_node(Node::End(End)),
        );
        let m = g.add_node(Node::Merge(Merge { ends: vec![e1] }));
        assert!(a.is_compatible_with(&g, &b).unwrap());
        a.merge(&mut g, m, &b).unwrap();
        g.add_forward_end(m, e2);
        a.merge(&mut g, m, &c).unwrap();
        g.add_forward_end(m, e3);
        // Local 0 is unchanged; local 1 is a phi of all three values.
        assert_eq!(a.local(0), b.local(0));
        let phi = a.local(1).unwrap();
        match g.node(phi) {
            Node::Phi(p) => assert_eq!(p.values, vec![one, two, three]),
            x => panic!("{x:?}"),
        }
        assert_eq!(g.phis_of(m), vec![phi]);
    }

    #[test]
    fn conflicting_kinds_kill_slot() {
        let (mut g, mut a) = setup("()V");
        let mut b = a.clone();
        let i = konst(&mut g, Constant::Int(1));
        let f = konst(&mut g, Constant::float(1.0));
        a.store_local(&g, 0, Kind::Int, i).unwrap();
        b.store_local(&g, 0, Kind::Float, f).unwrap();
        let e = g.add_node(Node::End(End));
        let m = g.add_node(Node::Merge(Merge { ends: vec![e] }));
        a.merge(&mut g, m, &b).unwrap();
        assert_eq!(a.local(0), None);
        assert!(g.phis_of(m).is_empty());
    }

    #[test]
    fn merging_twice_gives_the_same_phis() {
        fn run() -> (Vec<Vec<NodeIdx>>, String) {
            let (mut g, mut a) = setup("(II)I");
            let mut b = a.clone();
            let c = a.clone();
            let (one, two) = (konst(&mut g, Constant::Int(1)), konst(&mut g, Constant::Int(2)));
            a.store_local(&g, 0, Kind::Int, one).unwrap();
            b.store_local(&g, 1, Kind::Int, two).unwrap();
            let ends = [
                g.add_node(Node::End(End)),
                g.add_node(Node::End(End)),
                g.add_node(Node::End(End)),
            ];
            let m = g.add_node(Node::Merge(Merge {
                ends: vec![ends[0]],
            }));
            for (st, e) in [(&b, ends[1]), (&c, ends[2])] {
                assert!(a.is_compatible_with(&g, st).unwrap());
                a.merge(&mut g, m, st).unwrap();
                g.add_forward_end(m, e);
            }
            let phis = g
                .phis_of(m)
                .into_iter()
                .map(|p| match g.node(p) {
                    Node::Phi(p) => p.values.clone(),
                    x => panic!("{x:?}"),
                })
                .collect();
            (phis, g.to_string())
        }
        let (phis, printed) = run();
        assert_eq!(phis.len(), 2);
        assert!(phis.iter().all(|v| v.len() == 3));
        assert_eq!(run(), (phis, printed));
    }

    #[test]
    fn back_edge_kind_conflict_keeps_loop_phi() {
        let (mut g, mut a) = setup("()V");
        let i = konst(&mut g, Constant::Int(7));
        let f = konst(&mut g, Constant::float(1.0));
        let lb = g.add_node(Node::LoopBegin(LoopBegin {
            forward_ends: Vec::new(),
            loop_ends: Vec::new(),
        }));
        let phi = loop_phi(&mut g, lb, i);
        a.locals[0] = Some(phi);
        let mut b = a.clone();
        b.store_local(&g, 0, Kind::Float, f).unwrap();
        a.merge(&mut g, lb, &b).unwrap();
        assert_eq!(a.local(0), Some(phi));
        let zero = konst(&mut g, Constant::Int(0));
        match g.node(phi) {
            Node::Phi(p) => assert_eq!(p.values, vec![i, zero]),
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn incompatible_stacks() {
        let (mut g, mut a) = setup("()V");
        let mut b = a.clone();
        let i = konst(&mut g, Constant::Int(1));
        let f = konst(&mut g, Constant::float(1.0));
        a.push(Kind::Int, i);
        assert!(!a.is_compatible_with(&g, &b).unwrap());
        b.push(Kind::Float, f);
        assert!(!a.is_compatible_with(&g, &b).unwrap());
    }

    #[test]
    fn different_locks_are_unbalanced() {
        let (mut g, mut a) = setup("(Ljava/lang/Object;Ljava/lang/Object;)V");
        let mut b = a.clone();
        let mid = g.add_node(Node::MonitorId(MonitorId {
            lock_depth: 0,
            eliminated: false,
        }));
        a.push_lock(a.local(0).unwrap(), mid);
        b.push_lock(b.local(1).unwrap(), mid);
        assert!(matches!(
            a.is_compatible_with(&g, &b),
            Err(CompilationError::Bailout(ref s)) if s == "unbalanced monitors"
        ));
        assert_eq!(a.locks_size(), a.monitor_ids_size());
    }
}
