//! Deoptimisation metadata.
//!
//! Every LIR instruction that can trap or call carries a [DebugInfo]: enough information for the
//! runtime to rebuild the interpreter frames of the method (and of any methods inlined into it)
//! at that point. A [DebugInfo] is built from a graph [FrameState] chain plus the chain of locks
//! the LIR generator knows to be held.

use crate::{
    compile::CompilationError,
    graph::{
        cfg::BlockId,
        frame_state::{Bci, FrameState, FrameStateIdx},
        nodes::{Node, TypeRef},
        Graph, NodeIdx,
    },
    lir::Value,
    meta::{Constant, ResolvedMethod},
};
use indexmap::IndexMap;
use std::{
    fmt::{self, Display, Formatter},
    rc::Rc,
    sync::Arc,
};

/// One held lock. Scopes form a persistent stack: the innermost lock points to the lock acquired
/// before it, which may belong to a caller of an inlined method.
#[derive(Debug)]
pub struct LockScope<R> {
    pub outer: Option<Rc<LockScope<R>>>,
    /// The inlined method body that acquired the lock.
    pub inlining_id: usize,
    /// The position of this lock amongst those acquired by the same inlined method body.
    pub state_depth: usize,
    pub object: NodeIdx,
    pub monitor_id: NodeIdx,
    /// Where the lock's displaced header lives.
    pub slot: Value<R>,
    pub eliminated: bool,
}

impl<R> LockScope<R> {
    /// Push a new lock on top of `outer`.
    pub fn push(
        outer: Option<Rc<LockScope<R>>>,
        inlining_id: usize,
        object: NodeIdx,
        monitor_id: NodeIdx,
        slot: Value<R>,
        eliminated: bool,
    ) -> Rc<Self> {
        let state_depth = match &outer {
            Some(o) if o.inlining_id == inlining_id => o.state_depth + 1,
            _ => 0,
        };
        Rc::new(LockScope {
            outer,
            inlining_id,
            state_depth,
            object,
            monitor_id,
            slot,
            eliminated,
        })
    }

    /// The total number of locks held, including this one.
    pub fn depth(&self) -> usize {
        1 + self.outer.as_ref().map_or(0, |o| o.depth())
    }
}

/// Do `a` and `b` describe the same chain of locks?
pub fn same_locks<R>(a: &Option<Rc<LockScope<R>>>, b: &Option<Rc<LockScope<R>>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            Rc::ptr_eq(a, b)
                || (a.monitor_id == b.monitor_id
                    && a.object == b.object
                    && same_locks(&a.outer, &b.outer))
        }
        _ => false,
    }
}

/// A value the runtime needs to rebuild a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum DebugValue<R> {
    /// A dead local or the second slot of a two slot value.
    Illegal,
    Constant(Constant),
    Location(Value<R>),
    /// An index into [DebugInfo::virtual_objects].
    Virtual(usize),
    /// A held lock.
    Monitor {
        owner: Box<DebugValue<R>>,
        slot: Value<R>,
        eliminated: bool,
    },
}

impl<R: Display> Display for DebugValue<R> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            DebugValue::Illegal => write!(f, "_"),
            DebugValue::Constant(c) => write!(f, "{c}"),
            DebugValue::Location(v) => write!(f, "{v}"),
            DebugValue::Virtual(i) => write!(f, "vobj{i}"),
            DebugValue::Monitor {
                owner,
                slot,
                eliminated,
            } => {
                write!(f, "lock({owner}, {slot})")?;
                if *eliminated {
                    write!(f, " eliminated")?;
                }
                Ok(())
            }
        }
    }
}

/// One interpreter frame.
#[derive(Clone, Debug)]
pub struct BytecodeFrame<R> {
    pub method: Arc<ResolvedMethod>,
    pub bci: Bci,
    pub rethrow_exception: bool,
    pub during_call: bool,
    /// Locals, then the operand stack, then locks (outermost first).
    pub values: Vec<DebugValue<R>>,
    pub num_locals: usize,
    pub num_stack: usize,
    pub num_locks: usize,
}

impl<R> BytecodeFrame<R> {
    pub fn locals(&self) -> &[DebugValue<R>] {
        &self.values[..self.num_locals]
    }

    pub fn stack(&self) -> &[DebugValue<R>] {
        &self.values[self.num_locals..self.num_locals + self.num_stack]
    }

    pub fn locks(&self) -> &[DebugValue<R>] {
        &self.values[self.num_locals + self.num_stack..]
    }
}

#[derive(Clone, Debug)]
pub struct VirtualObjectDesc<R> {
    pub ty: TypeRef,
    pub id: usize,
    pub values: Vec<DebugValue<R>>,
}

/// Deoptimisation metadata for one instruction.
#[derive(Clone, Debug)]
pub struct DebugInfo<R> {
    /// Innermost frame first.
    pub frames: Vec<BytecodeFrame<R>>,
    pub virtual_objects: Vec<VirtualObjectDesc<R>>,
    /// Where a call's exceptions are dispatched to, if it has an exception edge.
    pub exception_edge: Option<BlockId>,
}

impl<R> DebugInfo<R> {
    /// Build the metadata for the frame state `state`, while the locks in `locks` are held.
    /// `locate` returns the location of a (non-constant, non-virtual) value.
    pub fn build<F>(
        g: &Graph,
        state: FrameStateIdx,
        locks: Option<&Rc<LockScope<R>>>,
        exception_edge: Option<BlockId>,
        locate: F,
    ) -> Result<Self, CompilationError>
    where
        R: Copy,
        F: FnMut(NodeIdx) -> Result<Value<R>, CompilationError>,
    {
        let mut b = Builder {
            g,
            locate,
            virtuals: IndexMap::new(),
            objects: Vec::new(),
        };

        let mut chain = Vec::new();
        let mut cur = Some(state);
        while let Some(s) = cur {
            let fs = g.frame_state(s);
            chain.push(fs);
            cur = fs.outer;
        }

        let mut lock = locks.cloned();
        let mut frames = Vec::with_capacity(chain.len());
        for fs in &chain {
            frames.push(b.frame(fs, &mut lock)?);
        }
        if lock.is_some() {
            return Err(CompilationError::Bailout(
                "unbalanced monitors: found monitor for unknown frame".into(),
            ));
        }
        b.fill_virtual_objects(&chain)?;
        Ok(DebugInfo {
            frames,
            virtual_objects: b.objects,
            exception_edge,
        })
    }
}

struct Builder<'a, R, F> {
    g: &'a Graph,
    locate: F,
    /// Virtual object nodes already given a descriptor, mapped to its index.
    virtuals: IndexMap<NodeIdx, usize>,
    objects: Vec<VirtualObjectDesc<R>>,
}

impl<R, F> Builder<'_, R, F>
where
    R: Copy,
    F: FnMut(NodeIdx) -> Result<Value<R>, CompilationError>,
{
    fn value(&mut self, x: Option<NodeIdx>) -> Result<DebugValue<R>, CompilationError> {
        let Some(x) = x else {
            return Ok(DebugValue::Illegal);
        };
        match self.g.node(x) {
            Node::Const(c) => Ok(DebugValue::Constant(c.c)),
            Node::VirtualObject(vo) => {
                if let Some(i) = self.virtuals.get(&x) {
                    return Ok(DebugValue::Virtual(*i));
                }
                let i = self.objects.len();
                self.objects.push(VirtualObjectDesc {
                    ty: vo.ty.clone(),
                    id: vo.id,
                    values: Vec::new(),
                });
                self.virtuals.insert(x, i);
                Ok(DebugValue::Virtual(i))
            }
            _ => Ok(DebugValue::Location((self.locate)(x)?)),
        }
    }

    /// Describe `fs`, consuming the locks in `lock` that belong to it.
    fn frame(
        &mut self,
        fs: &FrameState,
        lock: &mut Option<Rc<LockScope<R>>>,
    ) -> Result<BytecodeFrame<R>, CompilationError> {
        let num_locks = match lock {
            Some(l) if l.inlining_id == fs.inlining_id => l.state_depth + 1,
            _ => 0,
        };
        let mut values = Vec::with_capacity(fs.locals.len() + fs.stack.len() + num_locks);
        for x in fs.locals.iter().chain(fs.stack.iter()) {
            values.push(self.value(*x)?);
        }
        let base = values.len();
        values.resize(base + num_locks, DebugValue::Illegal);
        // The innermost lock fills the last slot.
        for i in (0..num_locks).rev() {
            let Some(l) = lock.take() else {
                return Err(CompilationError::internal(format!(
                    "lock chain ended {i} locks early at bci {}",
                    fs.bci
                )));
            };
            let owner = self.value(Some(l.object))?;
            values[base + i] = DebugValue::Monitor {
                owner: Box::new(owner),
                slot: l.slot,
                eliminated: l.eliminated,
            };
            *lock = l.outer.clone();
        }
        Ok(BytecodeFrame {
            method: Arc::clone(&fs.method),
            bci: fs.bci,
            rethrow_exception: fs.rethrow_exception,
            during_call: fs.during_call,
            values,
            num_locals: fs.locals.len(),
            num_stack: fs.stack.len(),
            num_locks,
        })
    }

    /// Give every virtual object referenced so far its field values. Field values can reference
    /// further virtual objects, so iterate until no new ones appear.
    fn fill_virtual_objects(&mut self, chain: &[&FrameState]) -> Result<(), CompilationError> {
        let mut done = 0;
        while done < self.objects.len() {
            let (node, _) = self
                .virtuals
                .get_index(done)
                .map(|(n, i)| (*n, *i))
                .ok_or_else(|| CompilationError::internal("virtual object memo out of sync"))?;
            let mapping = chain
                .iter()
                .flat_map(|fs| fs.virtual_mappings.iter())
                .find(|m| m.object == node)
                .ok_or_else(|| {
                    CompilationError::internal(format!(
                        "no virtual mapping for %{}",
                        usize::from(node)
                    ))
                })?;
            let mut values = Vec::with_capacity(mapping.values.len());
            for x in &mapping.values {
                values.push(self.value(*x)?);
            }
            self.objects[done].values = values;
            done += 1;
        }
        Ok(())
    }
}

impl<R: Display> Display for BytecodeFrame<R> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let list = |xs: &[DebugValue<R>]| {
            xs.iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "{}@{} locals=[{}] stack=[{}]",
            self.method.name,
            self.bci,
            list(self.locals()),
            list(self.stack())
        )?;
        if self.num_locks > 0 {
            write!(f, " locks=[{}]", list(self.locks()))?;
        }
        if self.rethrow_exception {
            write!(f, " rethrow")?;
        }
        if self.during_call {
            write!(f, " during_call")?;
        }
        Ok(())
    }
}

impl<R: Display> Display for DebugInfo<R> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for (i, fr) in self.frames.iter().enumerate() {
            if i > 0 {
                write!(f, " <- ")?;
            }
            write!(f, "{fr}")?;
        }
        for (i, vo) in self.virtual_objects.iter().enumerate() {
            let vals = vo
                .values
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " vobj{i}={}{{{vals}}}", vo.ty.name)?;
        }
        if let Some(b) = self.exception_edge {
            write!(f, " exc=bb{}", b.index())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bytecode::blockmap::test::method,
        graph::{
            frame_state::VirtualObjectState,
            nodes::{Const, MetaRef, MonitorId, Param, VirtualObject},
        },
        lir::VarIdx,
        meta::{test::test_type, Kind},
    };

    type V = Value<&'static str>;

    fn state(g: &Graph, outer: Option<FrameStateIdx>, inlining_id: usize) -> FrameState {
        FrameState {
            outer,
            method: Arc::clone(&g.method),
            inlining_id,
            bci: Bci::At(4),
            locals: Vec::new(),
            stack: Vec::new(),
            locks: Vec::new(),
            monitor_ids: Vec::new(),
            rethrow_exception: false,
            during_call: false,
            virtual_mappings: Vec::new(),
        }
    }

    fn var(i: usize) -> V {
        Value::Var(VarIdx::new(i), Kind::Object)
    }

    /// Locate every node in the variable with the node's index.
    fn locate(x: NodeIdx) -> Result<V, CompilationError> {
        Ok(var(usize::from(x)))
    }

    #[test]
    fn locals_stack_and_constants() {
        let mut g = Graph::new(Arc::new(method("(IJ)V", "return")));
        let p = g.unique(Node::Param(Param {
            index: 0,
            kind: Kind::Int,
        }));
        let c = g.unique(Node::Const(Const {
            c: Constant::Long(3),
        }));
        let mut fs = state(&g, None, 0);
        fs.locals = vec![Some(p), Some(c), None];
        fs.stack = vec![Some(p)];
        let s = g.add_frame_state(fs);
        let di = DebugInfo::<&str>::build(&g, s, None, None, locate).unwrap();
        assert_eq!(di.frames.len(), 1);
        let fr = &di.frames[0];
        assert_eq!(
            fr.locals(),
            &[
                DebugValue::Location(var(usize::from(p))),
                DebugValue::Constant(Constant::Long(3)),
                DebugValue::Illegal
            ]
        );
        assert_eq!(fr.stack().len(), 1);
        assert!(fr.locks().is_empty());
        // Every live slot resolves to something.
        assert!(fr
            .values
            .iter()
            .enumerate()
            .all(|(i, v)| i == 2 || *v != DebugValue::Illegal));
    }

    #[test]
    fn locks_per_inlining_level() {
        let mut g = Graph::new(Arc::new(method("()V", "return")));
        let o1 = g.unique(Node::Param(Param {
            index: 0,
            kind: Kind::Object,
        }));
        let o2 = g.unique(Node::Param(Param {
            index: 1,
            kind: Kind::Object,
        }));
        let m1 = g.add_node(Node::MonitorId(MonitorId {
            lock_depth: 0,
            eliminated: false,
        }));
        let m2 = g.add_node(Node::MonitorId(MonitorId {
            lock_depth: 1,
            eliminated: false,
        }));
        let mut outer = state(&g, None, 0);
        outer.locks = vec![o1];
        outer.monitor_ids = vec![m1];
        outer.during_call = true;
        let outer = g.add_frame_state(outer);
        let mut inner = state(&g, Some(outer), 1);
        inner.locks = vec![o2];
        inner.monitor_ids = vec![m2];
        let inner = g.add_frame_state(inner);

        let l1 = LockScope::push(None, 0, o1, m1, Value::Stack(0, Kind::Long), false);
        let l2 = LockScope::push(Some(l1), 1, o2, m2, Value::Stack(8, Kind::Long), false);
        assert_eq!(l2.state_depth, 0);
        assert_eq!(l2.depth(), 2);
        let di = DebugInfo::<&str>::build(&g, inner, Some(&l2), None, locate).unwrap();
        assert_eq!(di.frames.len(), 2);
        assert_eq!(di.frames[0].num_locks, 1);
        assert_eq!(di.frames[1].num_locks, 1);
        assert_eq!(
            di.frames[0].locks()[0],
            DebugValue::Monitor {
                owner: Box::new(DebugValue::Location(var(usize::from(o2)))),
                slot: Value::Stack(8, Kind::Long),
                eliminated: false
            }
        );
        assert!(di.frames[1].during_call);
    }

    #[test]
    fn lock_for_unknown_frame() {
        let mut g = Graph::new(Arc::new(method("()V", "return")));
        let o = g.unique(Node::Param(Param {
            index: 0,
            kind: Kind::Object,
        }));
        let m = g.add_node(Node::MonitorId(MonitorId {
            lock_depth: 0,
            eliminated: false,
        }));
        let fs = state(&g, None, 0);
        let s = g.add_frame_state(fs);
        // The lock belongs to an inlined method with no frame in the chain.
        let l = LockScope::push(None, 3, o, m, Value::Stack(0, Kind::Long), false);
        match DebugInfo::<&str>::build(&g, s, Some(&l), None, locate) {
            Err(CompilationError::Bailout(m)) => {
                assert_eq!(m, "unbalanced monitors: found monitor for unknown frame")
            }
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn nested_virtual_objects() {
        let mut g = Graph::new(Arc::new(method("()V", "return")));
        let ty = MetaRef::new(&test_type("Pair", 0x200));
        let a = g.add_node(Node::VirtualObject(VirtualObject {
            ty: ty.clone(),
            field_kinds: vec![Kind::Object, Kind::Int],
            id: 0,
        }));
        let b = g.add_node(Node::VirtualObject(VirtualObject {
            ty,
            field_kinds: vec![Kind::Object, Kind::Int],
            id: 1,
        }));
        let one = g.unique(Node::Const(Const {
            c: Constant::Int(1),
        }));
        let mut fs = state(&g, None, 0);
        fs.locals = vec![Some(a)];
        fs.stack = vec![Some(a)];
        fs.virtual_mappings = vec![
            VirtualObjectState {
                object: a,
                values: vec![Some(b), Some(one)],
            },
            // Objects may refer to each other.
            VirtualObjectState {
                object: b,
                values: vec![Some(a), None],
            },
        ];
        let s = g.add_frame_state(fs);
        let di = DebugInfo::<&str>::build(&g, s, None, None, locate).unwrap();
        assert_eq!(di.virtual_objects.len(), 2);
        assert_eq!(di.frames[0].locals()[0], DebugValue::Virtual(0));
        assert_eq!(di.frames[0].stack()[0], DebugValue::Virtual(0));
        assert_eq!(
            di.virtual_objects[0].values,
            vec![DebugValue::Virtual(1), DebugValue::Constant(Constant::Int(1))]
        );
        assert_eq!(
            di.virtual_objects[1].values,
            vec![DebugValue::Virtual(0), DebugValue::Illegal]
        );
        assert_eq!(
            di.to_string(),
            "m@4 locals=[vobj0] stack=[vobj0] vobj0=Pair{vobj1, 1i} vobj1=Pair{vobj0, _}"
        );
    }
}
