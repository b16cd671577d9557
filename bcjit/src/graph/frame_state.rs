//! Frame states: snapshots of the abstract interpreter's locals, operand stack and held locks at
//! one bytecode position.
//!
//! A [FrameState] is immutable once added to a [super::Graph]. States of inlined callees point
//! to their caller's state via [FrameState::outer], forming a chain that the debug info builder
//! walks to reconstruct every interpreter frame at a deoptimisation point.

use super::NodeIdx;
use crate::meta::ResolvedMethod;
use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

index_vec::define_index_type! {
    pub struct FrameStateIdx = u32;
}

/// A bytecode index or one of the sentinel positions a frame state can describe.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Bci {
    At(u32),
    /// Before the first instruction, e.g. before a synchronised method acquires its lock.
    Before,
    /// After the method has returned (and released any method lock).
    After,
    /// After an exception has been thrown out of the method.
    AfterException,
    /// A placeholder that must be replaced before the state is used for deoptimisation.
    Unknown,
}

impl Bci {
    /// The raw encoding used by deoptimisation metadata.
    pub fn raw(self) -> i32 {
        match self {
            Bci::At(x) => x as i32,
            Bci::Before => -1,
            Bci::After => -2,
            Bci::AfterException => -4,
            Bci::Unknown => -5,
        }
    }

    pub fn at(self) -> Option<u32> {
        match self {
            Bci::At(x) => Some(x),
            _ => None,
        }
    }
}

impl Display for Bci {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Bci::At(x) => write!(f, "{x}"),
            Bci::Before => write!(f, "before"),
            Bci::After => write!(f, "after"),
            Bci::AfterException => write!(f, "after-exception"),
            Bci::Unknown => write!(f, "unknown"),
        }
    }
}

/// The field values of a virtual object at a given frame state.
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualObjectState {
    /// A [super::nodes::VirtualObject] node.
    pub object: NodeIdx,
    pub values: Vec<Option<NodeIdx>>,
}

#[derive(Clone, Debug)]
pub struct FrameState {
    /// The caller's state if this state belongs to an inlined method.
    pub outer: Option<FrameStateIdx>,
    pub method: Arc<ResolvedMethod>,
    /// Identifies the inlined method body this state belongs to: 0 for the root method.
    pub inlining_id: usize,
    pub bci: Bci,
    /// `None` for dead locals and the second slot of two slot values.
    pub locals: Vec<Option<NodeIdx>>,
    /// `None` for the second slot of two slot values.
    pub stack: Vec<Option<NodeIdx>>,
    /// The objects whose locks are held, outermost first.
    pub locks: Vec<NodeIdx>,
    /// The [super::nodes::MonitorId]s of `locks`, in the same order.
    pub monitor_ids: Vec<NodeIdx>,
    /// Should the interpreter rethrow the exception on top of the stack on resumption?
    pub rethrow_exception: bool,
    /// Is this the state of a caller during a call to an inlined method?
    pub during_call: bool,
    pub virtual_mappings: Vec<VirtualObjectState>,
}

impl FrameState {
    pub fn verify(&self) {
        assert_eq!(
            self.locks.len(),
            self.monitor_ids.len(),
            "frame state at bci {}: {} locks but {} monitor ids",
            self.bci,
            self.locks.len(),
            self.monitor_ids.len()
        );
    }

    /// Iterate over every node this state refers to.
    pub fn values(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        self.locals
            .iter()
            .chain(self.stack.iter())
            .flatten()
            .copied()
            .chain(self.locks.iter().copied())
            .chain(self.monitor_ids.iter().copied())
            .chain(self.virtual_mappings.iter().flat_map(|v| {
                std::iter::once(v.object).chain(v.values.iter().flatten().copied())
            }))
    }

    /// Replace every reference to `old` with `new`.
    pub(super) fn replace_value(&mut self, old: NodeIdx, new: Option<NodeIdx>) {
        for x in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if *x == Some(old) {
                *x = new;
            }
        }
        for vm in &mut self.virtual_mappings {
            for x in &mut vm.values {
                if *x == Some(old) {
                    *x = new;
                }
            }
        }
        if let Some(new) = new {
            for x in self.locks.iter_mut().chain(self.monitor_ids.iter_mut()) {
                if *x == old {
                    *x = new;
                }
            }
        }
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }
}

fn slots(f: &mut Formatter, slots: &[Option<NodeIdx>]) -> fmt::Result {
    write!(f, "[")?;
    for (i, x) in slots.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        match x {
            Some(x) => write!(f, "%{}", usize::from(*x))?,
            None => write!(f, "_")?,
        }
    }
    write!(f, "]")
}

impl Display for FrameState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "bci={} locals=", self.bci)?;
        slots(f, &self.locals)?;
        write!(f, " stack=")?;
        slots(f, &self.stack)?;
        if !self.locks.is_empty() {
            write!(f, " locks=")?;
            slots(f, &self.locks.iter().map(|x| Some(*x)).collect::<Vec<_>>())?;
        }
        if self.rethrow_exception {
            write!(f, " rethrow")?;
        }
        if self.during_call {
            write!(f, " during_call")?;
        }
        if let Some(outer) = self.outer {
            write!(f, " outer=#{}", usize::from(outer))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bytecode::blockmap::test::method;

    fn fs(locks: Vec<NodeIdx>, monitor_ids: Vec<NodeIdx>) -> FrameState {
        FrameState {
            outer: None,
            method: Arc::new(method("()V", "return")),
            inlining_id: 0,
            bci: Bci::At(3),
            locals: vec![Some(NodeIdx::new(1)), None],
            stack: vec![Some(NodeIdx::new(2))],
            locks,
            monitor_ids,
            rethrow_exception: false,
            during_call: false,
            virtual_mappings: Vec::new(),
        }
    }

    #[test]
    fn bci_encoding() {
        assert_eq!(Bci::At(7).raw(), 7);
        assert_eq!(Bci::Before.raw(), -1);
        assert_eq!(Bci::AfterException.to_string(), "after-exception");
    }

    #[test]
    fn display_and_replace() {
        let mut s = fs(vec![NodeIdx::new(1)], vec![NodeIdx::new(4)]);
        s.verify();
        assert_eq!(
            s.to_string(),
            "bci=3 locals=[%1, _] stack=[%2] locks=[%1]"
        );
        s.replace_value(NodeIdx::new(1), Some(NodeIdx::new(9)));
        assert_eq!(s.locals[0], Some(NodeIdx::new(9)));
        assert_eq!(s.locks[0], NodeIdx::new(9));
        s.replace_value(NodeIdx::new(2), None);
        assert_eq!(s.stack[0], None);
        assert_eq!(s.values().count(), 3);
    }

    #[test]
    #[should_panic(expected = "1 locks but 0 monitor ids")]
    fn unbalanced_locks() {
        fs(vec![NodeIdx::new(1)], Vec::new()).verify();
    }
}
