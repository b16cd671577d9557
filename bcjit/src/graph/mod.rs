//! The program graph: a sea of nodes in which fixed nodes are threaded together by control edges
//! and floating nodes hang off them by data edges.
//!
//! Nodes live in an arena and are referred to by [NodeIdx]. Nodes are never physically removed:
//! deleting a node marks its arena entry dead, so indices remain stable for the lifetime of the
//! graph. Floating nodes can be value numbered via [Graph::unique], which returns an existing
//! equal node if there is one.

use crate::meta::{Kind, ResolvedMethod};
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    sync::Arc,
};

pub mod cfg;
pub mod frame_state;
pub mod nodes;
pub mod simplify;

use frame_state::{FrameState, FrameStateIdx};
use nodes::{LoopBegin, Merge, Node, NodeClass, NodeT, Phi, Start, ValueProxy};

index_vec::define_index_type! {
    pub struct NodeIdx = u32;
}

static_assertions::assert_eq_size!(NodeIdx, u32);

#[derive(Clone, Debug)]
struct Entry {
    node: Node,
    /// For begin and fixed nodes: the next fixed node.
    next: Option<NodeIdx>,
    /// For fixed nodes: the node whose `next` (or, for a split, whose successor) this is.
    pred: Option<NodeIdx>,
    state_after: Option<FrameStateIdx>,
    live: bool,
}

#[derive(Debug)]
pub struct Graph {
    pub method: Arc<ResolvedMethod>,
    nodes: IndexVec<NodeIdx, Entry>,
    frame_states: IndexVec<FrameStateIdx, FrameState>,
    gvn: HashMap<Node, NodeIdx>,
    start: NodeIdx,
    live: usize,
}

impl Graph {
    pub fn new(method: Arc<ResolvedMethod>) -> Self {
        let mut g = Graph {
            method,
            nodes: IndexVec::new(),
            frame_states: IndexVec::new(),
            gvn: HashMap::new(),
            start: NodeIdx::new(0),
            live: 0,
        };
        g.start = g.add_node(Node::Start(Start));
        g
    }

    pub fn start(&self) -> NodeIdx {
        self.start
    }

    /// Add `node` to the graph without value numbering it.
    pub fn add_node(&mut self, node: Node) -> NodeIdx {
        let succs = node.successors();
        let idx = self.nodes.push(Entry {
            node,
            next: None,
            pred: None,
            state_after: None,
            live: true,
        });
        for s in succs {
            assert!(
                self.nodes[s].pred.is_none(),
                "%{s:?}: split successor already attached"
            );
            self.nodes[s].pred = Some(idx);
        }
        self.live += 1;
        idx
    }

    /// Return a node equal to `node`, adding `node` to the graph only if no such node exists.
    pub fn unique(&mut self, node: Node) -> NodeIdx {
        assert!(
            !node.class().is_fixed(),
            "only floating nodes can be value numbered: {node:?}"
        );
        if let Some(&idx) = self.gvn.get(&node) {
            let e = &self.nodes[idx];
            if e.live && e.node == node {
                return idx;
            }
        }
        let idx = self.add_node(node.clone());
        self.gvn.insert(node, idx);
        idx
    }

    pub fn node(&self, idx: NodeIdx) -> &Node {
        &self.nodes[idx].node
    }

    pub fn node_mut(&mut self, idx: NodeIdx) -> &mut Node {
        &mut self.nodes[idx].node
    }

    pub fn is_live(&self, idx: NodeIdx) -> bool {
        self.nodes[idx].live
    }

    /// Replace the node at `idx` with `node`, keeping its edges.
    pub fn replace_node(&mut self, idx: NodeIdx, node: Node) {
        assert_eq!(
            self.nodes[idx].node.class(),
            node.class(),
            "%{idx:?}: in-place replacement must preserve the node class"
        );
        self.nodes[idx].node = node;
    }

    /// The indices of every live node, in creation order.
    pub fn iter_live(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        self.nodes
            .iter_enumerated()
            .filter(|(_, e)| e.live)
            .map(|(i, _)| i)
    }

    /// The number of live nodes.
    pub fn node_count(&self) -> usize {
        self.live
    }

    /// The number of nodes ever created, which bounds every [NodeIdx].
    pub fn node_capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn next(&self, idx: NodeIdx) -> Option<NodeIdx> {
        self.nodes[idx].next
    }

    pub fn pred(&self, idx: NodeIdx) -> Option<NodeIdx> {
        self.nodes[idx].pred
    }

    pub fn set_next(&mut self, from: NodeIdx, to: NodeIdx) {
        assert!(
            self.nodes[from].node.class().has_next(),
            "%{from:?}: node cannot have a next node"
        );
        assert!(
            self.nodes[to].node.class().is_fixed(),
            "%{to:?}: floating nodes cannot be control successors"
        );
        assert!(
            self.nodes[from].next.is_none(),
            "%{from:?}: already has a successor"
        );
        assert!(self.nodes[to].pred.is_none(), "%{to:?}: already attached");
        self.nodes[from].next = Some(to);
        self.nodes[to].pred = Some(from);
    }

    /// Detach `from`'s next node, returning it.
    pub fn clear_next(&mut self, from: NodeIdx) -> Option<NodeIdx> {
        let next = self.nodes[from].next.take()?;
        self.nodes[next].pred = None;
        Some(next)
    }

    /// The control successors of `idx`: its next node, a split's successors, or the merge an end
    /// flows into.
    pub fn successors(&self, idx: NodeIdx) -> SmallVec<[NodeIdx; 2]> {
        let n = &self.nodes[idx].node;
        match n.class() {
            NodeClass::Begin | NodeClass::Fixed => self.nodes[idx].next.into_iter().collect(),
            NodeClass::Split => n.successors(),
            NodeClass::End => self.merge_of(idx).into_iter().collect(),
            _ => SmallVec::new(),
        }
    }

    pub fn state_after(&self, idx: NodeIdx) -> Option<FrameStateIdx> {
        self.nodes[idx].state_after
    }

    pub fn set_state_after(&mut self, idx: NodeIdx, fs: Option<FrameStateIdx>) {
        self.nodes[idx].state_after = fs;
    }

    /// Make `old`'s predecessor point to `new` instead.
    pub fn replace_at_predecessor(&mut self, old: NodeIdx, new: NodeIdx) {
        let Some(pred) = self.nodes[old].pred.take() else {
            return;
        };
        assert!(self.nodes[new].pred.is_none(), "%{new:?}: already attached");
        if self.nodes[pred].next == Some(old) {
            self.nodes[pred].next = Some(new);
        } else {
            for s in self.nodes[pred].node.successors_mut() {
                if *s == old {
                    *s = new;
                }
            }
        }
        self.nodes[new].pred = Some(pred);
    }

    /// Unlink the fixed node `idx` from the control flow, connecting its predecessor to its next
    /// node.
    pub fn unlink_fixed(&mut self, idx: NodeIdx) {
        let next = self.clear_next(idx);
        match next {
            Some(next) => self.replace_at_predecessor(idx, next),
            None => {
                if let Some(pred) = self.nodes[idx].pred.take() {
                    self.nodes[pred].next = None;
                }
            }
        }
    }

    /// The merge or loop begin that the end `end` flows into.
    pub fn merge_of(&self, end: NodeIdx) -> Option<NodeIdx> {
        if let Node::LoopEnd(le) = &self.nodes[end].node {
            return Some(le.loop_begin);
        }
        self.iter_live().find(|&m| match &self.nodes[m].node {
            Node::Merge(Merge { ends }) => ends.contains(&end),
            Node::LoopBegin(LoopBegin { forward_ends, .. }) => forward_ends.contains(&end),
            _ => false,
        })
    }

    pub fn add_forward_end(&mut self, merge: NodeIdx, end: NodeIdx) {
        match &mut self.nodes[merge].node {
            Node::Merge(Merge { ends }) => ends.push(end),
            Node::LoopBegin(LoopBegin { forward_ends, .. }) => forward_ends.push(end),
            x => panic!("%{merge:?}: {x:?} is not a merge"),
        }
    }

    pub fn add_loop_end(&mut self, loop_begin: NodeIdx, end: NodeIdx) {
        match &mut self.nodes[loop_begin].node {
            Node::LoopBegin(LoopBegin { loop_ends, .. }) => loop_ends.push(end),
            x => panic!("%{loop_begin:?}: {x:?} is not a loop begin"),
        }
    }

    /// The number of control flow edges into `merge`, which is also the number of inputs each
    /// of its phis must have.
    pub fn phi_predecessor_count(&self, merge: NodeIdx) -> usize {
        match &self.nodes[merge].node {
            Node::Merge(m) => m.ends.len(),
            Node::LoopBegin(lb) => lb.forward_ends.len() + lb.loop_ends.len(),
            _ => 0,
        }
    }

    pub fn phis_of(&self, merge: NodeIdx) -> Vec<NodeIdx> {
        self.iter_live()
            .filter(|&i| matches!(&self.nodes[i].node, Node::Phi(p) if p.merge == merge))
            .collect()
    }

    pub fn add_phi_input(&mut self, phi: NodeIdx, value: NodeIdx) {
        match &mut self.nodes[phi].node {
            Node::Phi(Phi { values, .. }) => values.push(value),
            x => panic!("%{phi:?}: {x:?} is not a phi"),
        }
    }

    /// The nodes that use `idx` as a data input.
    pub fn usages(&self, idx: NodeIdx) -> Vec<NodeIdx> {
        self.iter_live()
            .filter(|&i| self.nodes[i].node.inputs().contains(&idx))
            .collect()
    }

    /// The frame states that refer to `idx`.
    pub fn state_usages(&self, idx: NodeIdx) -> Vec<FrameStateIdx> {
        self.frame_states
            .iter_enumerated()
            .filter(|(_, fs)| fs.values().any(|x| x == idx))
            .map(|(i, _)| i)
            .collect()
    }

    /// Redirect every use of `old` (by nodes other than `new` and by frame states) to `new`.
    pub fn replace_at_usages(&mut self, old: NodeIdx, new: NodeIdx) {
        for (i, e) in self.nodes.iter_mut_enumerated() {
            if !e.live || i == new {
                continue;
            }
            for x in e.node.inputs_mut() {
                if *x == old {
                    *x = new;
                }
            }
        }
        for fs in self.frame_states.iter_mut() {
            fs.replace_value(old, Some(new));
        }
    }

    /// Remove `idx` from every frame state, leaving the slots it occupied empty.
    pub fn clear_frame_state_usages(&mut self, idx: NodeIdx) {
        for fs in self.frame_states.iter_mut() {
            fs.replace_value(idx, None);
        }
    }

    /// Delete `idx`, which must have no remaining node usages and must not be linked into the
    /// control flow.
    pub fn safe_delete(&mut self, idx: NodeIdx) {
        assert!(self.nodes[idx].live, "%{idx:?}: already deleted");
        let users = self.usages(idx);
        assert!(users.is_empty(), "%{idx:?}: still has usages {users:?}");
        assert!(
            self.nodes[idx].next.is_none() && self.nodes[idx].pred.is_none(),
            "%{idx:?}: still linked into the control flow"
        );
        self.nodes[idx].live = false;
        self.live -= 1;
    }

    /// Look through loop proxies to the value they forward.
    pub fn original_value(&self, mut idx: NodeIdx) -> NodeIdx {
        while let Node::ValueProxy(ValueProxy { value, .. }) = &self.nodes[idx].node {
            idx = *value;
        }
        idx
    }

    pub fn add_frame_state(&mut self, fs: FrameState) -> FrameStateIdx {
        fs.verify();
        self.frame_states.push(fs)
    }

    pub fn frame_state(&self, idx: FrameStateIdx) -> &FrameState {
        &self.frame_states[idx]
    }

    pub fn frame_state_count(&self) -> usize {
        self.frame_states.len()
    }

    /// Pretty print a single node as `%3: i = add %1, %2`.
    pub fn node_str(&self, idx: NodeIdx) -> String {
        let n = &self.nodes[idx].node;
        match n.stamp() {
            Kind::Void => format!("%{}: {}", usize::from(idx), n.to_string()),
            k => format!("%{}: {k} = {}", usize::from(idx), n.to_string()),
        }
    }

    /// Check the graph's structural invariants, panicking if any is violated.
    pub fn assert_well_formed(&self) {
        for (idx, e) in self.nodes.iter_enumerated() {
            if !e.live {
                continue;
            }
            for x in e.node.inputs() {
                assert!(self.nodes[x].live, "%{idx:?}: input %{x:?} is dead");
            }
            let class = e.node.class();
            if let Some(n) = e.next {
                assert!(class.has_next(), "%{idx:?}: node cannot have a next node");
                assert_eq!(
                    self.nodes[n].pred,
                    Some(idx),
                    "%{idx:?}: next node's predecessor is wrong"
                );
            }
            if class == NodeClass::Split {
                for s in e.node.successors() {
                    assert_eq!(
                        self.nodes[s].node.class(),
                        NodeClass::Begin,
                        "%{idx:?}: split successor %{s:?} is not a begin node"
                    );
                    assert_eq!(
                        self.nodes[s].pred,
                        Some(idx),
                        "%{idx:?}: split successor's predecessor is wrong"
                    );
                }
            }
            if class == NodeClass::End {
                assert!(
                    self.merge_of(idx).is_some(),
                    "%{idx:?}: end without a merge"
                );
            }
            e.node.assert_well_formed(self, idx);
        }
        for (fsidx, fs) in self.frame_states.iter_enumerated() {
            fs.verify();
            for x in fs.values() {
                assert!(
                    self.nodes[x].live,
                    "#{}: refers to dead node %{x:?}",
                    usize::from(fsidx)
                );
            }
        }
    }
}

impl Display for Graph {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "; {}", self.method.qualified_name())?;
        for (idx, e) in self.nodes.iter_enumerated() {
            if !e.live {
                continue;
            }
            write!(f, "{}", self.node_str(idx))?;
            if let Some(n) = e.next {
                write!(f, " -> %{}", usize::from(n))?;
            }
            if let Some(fs) = e.state_after {
                write!(f, " [#{}]", usize::from(fs))?;
            }
            writeln!(f)?;
        }
        for (idx, fs) in self.frame_states.iter_enumerated() {
            writeln!(f, "#{}: {fs}", usize::from(idx))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{
        frame_state::Bci,
        nodes::{Arith, ArithOp, Begin, Const, End, If, IsNull, Param, Prob, Return},
        *,
    };
    use crate::{bytecode::blockmap::test::method, meta::Constant};

    fn graph() -> Graph {
        Graph::new(Arc::new(method("(II)I", "iload_0\nireturn")))
    }

    #[test]
    fn value_numbering() {
        let mut g = graph();
        let p0 = g.unique(Node::Param(Param {
            index: 0,
            kind: Kind::Int,
        }));
        let c = g.unique(Node::Const(Const {
            c: Constant::Int(1),
        }));
        let add = |g: &mut Graph| {
            g.unique(Node::Arith(Arith {
                op: ArithOp::Add,
                x: p0,
                y: c,
                kind: Kind::Int,
            }))
        };
        let a1 = add(&mut g);
        let a2 = add(&mut g);
        assert_eq!(a1, a2);
        assert_eq!(g.node_count(), 4);
        // A deleted node is never handed out again.
        g.safe_delete(a1);
        let a3 = add(&mut g);
        assert_ne!(a1, a3);
    }

    #[test]
    fn control_flow_and_display() {
        let mut g = graph();
        let p0 = g.unique(Node::Param(Param {
            index: 0,
            kind: Kind::Object,
        }));
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
        let te = g.add_node(Node::End(End));
        let fe = g.add_node(Node::End(End));
        g.set_next(t, te);
        g.set_next(f, fe);
        let m = g.add_node(Node::Merge(Merge { ends: vec![te] }));
        g.add_forward_end(m, fe);
        let r = g.add_node(Node::Return(Return { value: None }));
        g.set_next(m, r);
        let fs = g.add_frame_state(FrameState {
            outer: None,
            method: Arc::clone(&g.method),
            inlining_id: 0,
            bci: Bci::At(1),
            locals: vec![Some(p0), None],
            stack: Vec::new(),
            locks: Vec::new(),
            monitor_ids: Vec::new(),
            rethrow_exception: false,
            during_call: false,
            virtual_mappings: Vec::new(),
        });
        g.set_state_after(m, Some(fs));
        g.assert_well_formed();

        assert_eq!(g.pred(t), Some(iff));
        assert_eq!(g.successors(te).as_slice(), &[m]);
        assert_eq!(g.phi_predecessor_count(m), 2);
        assert_eq!(
            g.to_string(),
            "; T.m(II)I
%0: start -> %5
%1: a = param 0
%2: is_null %1
%3: begin -> %6
%4: begin -> %7
%5: if %2 then %3 else %4 p=0.5
%6: end
%7: end
%8: merge [%6, %7] -> %9 [#0]
%9: return
#0: bci=1 locals=[%1, _] stack=[]
"
        );
    }

    #[test]
    #[should_panic(expected = "already has a successor")]
    fn double_next() {
        let mut g = graph();
        let a = g.add_node(Node::Return(Return { value: None }));
        let b = g.add_node(Node::Return(Return { value: None }));
        g.set_next(g.start(), a);
        g.set_next(g.start(), b);
    }

    #[test]
    fn replace_and_delete() {
        let mut g = graph();
        let p0 = g.unique(Node::Param(Param {
            index: 0,
            kind: Kind::Int,
        }));
        let p1 = g.unique(Node::Param(Param {
            index: 1,
            kind: Kind::Int,
        }));
        let r = g.add_node(Node::Return(Return { value: Some(p0) }));
        g.set_next(g.start(), r);
        assert_eq!(g.usages(p0), vec![r]);
        g.replace_at_usages(p0, p1);
        assert!(g.usages(p0).is_empty());
        g.safe_delete(p0);
        assert!(!g.is_live(p0));
        assert_eq!(g.node_count(), 3);
        g.assert_well_formed();
    }

    #[test]
    #[should_panic(expected = "still has usages")]
    fn delete_used() {
        let mut g = graph();
        let p0 = g.unique(Node::Param(Param {
            index: 0,
            kind: Kind::Int,
        }));
        g.add_node(Node::Return(Return { value: Some(p0) }));
        g.safe_delete(p0);
    }
}
