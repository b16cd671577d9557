//! Basic blocks, dominators and the schedule of floating nodes.
//!
//! A [Schedule] partitions a graph's fixed nodes into basic blocks (each starting at a begin
//! node), orders the blocks in reverse post-order and assigns every floating node that the code
//! needs to a block and a position within it. Floating nodes are scheduled as early as possible:
//! into the deepest (in the dominator tree) block that defines one of their inputs.
//!
//! Constants, logic nodes, virtual objects and monitor ids are never scheduled. Constants are
//! materialised by their users, logic nodes are folded into the branch, guard or conditional
//! that consumes them, and the latter two only exist in debug info.

use super::{
    frame_state::FrameStateIdx,
    nodes::{InvokeWithException, LoopBegin, Merge, Node, NodeClass, NodeT},
    Graph, NodeIdx,
};
use crate::compile::CompilationError;
use index_vec::IndexVec;
use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Display, Formatter},
};

index_vec::define_index_type! {
    pub struct BlockId = u32;
}

/// Compute the immediate dominator of every node of a flow graph using the algorithm of Cooper,
/// Harvey and Kennedy. Nodes are numbered in reverse post-order with the entry at 0, and `preds`
/// holds each node's predecessors. The entry is its own dominator; unreachable nodes map to
/// `usize::MAX`.
pub(crate) fn compute_idoms(preds: &[Vec<usize>]) -> Vec<usize> {
    let mut idom = vec![usize::MAX; preds.len()];
    if preds.is_empty() {
        return idom;
    }
    idom[0] = 0;
    let mut changed = true;
    while changed {
        changed = false;
        for b in 1..preds.len() {
            let mut new = usize::MAX;
            for &p in &preds[b] {
                if idom[p] == usize::MAX {
                    continue;
                }
                new = if new == usize::MAX {
                    p
                } else {
                    intersect(&idom, p, new)
                };
            }
            if new != usize::MAX && idom[b] != new {
                idom[b] = new;
                changed = true;
            }
        }
    }
    idom
}

fn intersect(idom: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while a > b {
            a = idom[a];
        }
        while b > a {
            b = idom[b];
        }
    }
    a
}

#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub begin: NodeIdx,
    /// The block's final fixed node.
    pub end: NodeIdx,
    /// For merges: the merge's phis.
    pub phis: Vec<NodeIdx>,
    /// The begin node, then every fixed and scheduled floating node in execution order.
    pub nodes: Vec<NodeIdx>,
    /// For merges, ordered as the merge's ends (forward ends then loop ends), so that the
    /// position of a predecessor is also the index of its phi inputs.
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    pub is_loop_header: bool,
    pub idom: Option<BlockId>,
    /// Depth in the dominator tree.
    pub depth: usize,
}

#[derive(Debug)]
pub struct Schedule {
    pub blocks: IndexVec<BlockId, Block>,
    node_block: HashMap<NodeIdx, BlockId>,
}

/// A block as first discovered, before being renumbered into reverse post-order.
struct RawBlock {
    begin: NodeIdx,
    fixed: Vec<NodeIdx>,
    succs: Vec<NodeIdx>,
}

impl Schedule {
    pub fn new(g: &Graph) -> Result<Self, CompilationError> {
        let raw = Self::discover(g)?;
        let begin_raw = raw
            .iter()
            .enumerate()
            .map(|(i, r)| (r.begin, i))
            .collect::<HashMap<_, _>>();
        let raw_succs = raw
            .iter()
            .map(|r| r.succs.iter().map(|s| begin_raw[s]).collect::<Vec<_>>())
            .collect::<Vec<_>>();

        // Reverse post-order, visiting earlier successors first.
        let mut visited = vec![false; raw.len()];
        let mut post = Vec::with_capacity(raw.len());
        let mut stack = vec![(0usize, 0usize)];
        visited[0] = true;
        while let Some(top) = stack.len().checked_sub(1) {
            let (b, i) = stack[top];
            let n = raw_succs[b].len();
            if i < n {
                stack[top].1 += 1;
                let s = raw_succs[b][n - 1 - i];
                if !visited[s] {
                    visited[s] = true;
                    stack.push((s, 0));
                }
            } else {
                post.push(b);
                stack.pop();
            }
        }
        let mut rpo_of = vec![0; raw.len()];
        for (i, &b) in post.iter().rev().enumerate() {
            rpo_of[b] = i;
        }

        let mut node_block = HashMap::new();
        let mut blocks: IndexVec<BlockId, Block> = IndexVec::with_capacity(raw.len());
        for &rb in post.iter().rev() {
            let r = &raw[rb];
            let id = BlockId::new(blocks.len());
            for &n in &r.fixed {
                node_block.insert(n, id);
            }
            blocks.push(Block {
                id,
                begin: r.begin,
                end: *r.fixed.last().unwrap_or(&r.begin),
                phis: g.phis_of(r.begin),
                nodes: Vec::new(),
                preds: Vec::new(),
                succs: raw_succs[rb]
                    .iter()
                    .map(|s| BlockId::new(rpo_of[*s]))
                    .collect(),
                is_loop_header: matches!(g.node(r.begin), Node::LoopBegin(_)),
                idom: None,
                depth: 0,
            });
        }
        for b in blocks.indices() {
            for p in &blocks[b].phis {
                node_block.insert(*p, b);
            }
        }

        // Predecessors. Merges list theirs in end order.
        let mut preds: IndexVec<BlockId, Vec<BlockId>> =
            index_vec::index_vec![Vec::new(); blocks.len()];
        for b in blocks.indices() {
            for &s in &blocks[b].succs {
                preds[s].push(b);
            }
        }
        for b in blocks.indices() {
            let ends = match g.node(blocks[b].begin) {
                Node::Merge(Merge { ends }) => ends.clone(),
                Node::LoopBegin(LoopBegin {
                    forward_ends,
                    loop_ends,
                }) => forward_ends.iter().chain(loop_ends).copied().collect(),
                _ => continue,
            };
            let mut ordered = Vec::with_capacity(ends.len());
            for e in ends {
                ordered.push(*node_block.get(&e).ok_or_else(|| {
                    CompilationError::internal(format!(
                        "%{}: merge end %{} is unreachable",
                        usize::from(blocks[b].begin),
                        usize::from(e)
                    ))
                })?);
            }
            preds[b] = ordered;
        }

        let idoms = compute_idoms(
            &preds
                .iter()
                .map(|ps| ps.iter().map(|p| p.index()).collect())
                .collect::<Vec<_>>(),
        );
        for (b, ps) in preds.into_iter_enumerated() {
            blocks[b].preds = ps;
            if b.index() > 0 {
                let d = BlockId::new(idoms[b.index()]);
                blocks[b].idom = Some(d);
                blocks[b].depth = blocks[d].depth + 1;
            }
        }

        let mut sched = Schedule { blocks, node_block };
        sched.schedule_floating(g, &raw, &rpo_of);
        Ok(sched)
    }

    /// Find every block reachable from the start node.
    fn discover(g: &Graph) -> Result<Vec<RawBlock>, CompilationError> {
        let mut seen = HashSet::new();
        let mut raw = Vec::new();
        let mut todo = vec![g.start()];
        while let Some(b) = todo.pop() {
            if !seen.insert(b) {
                continue;
            }
            let mut fixed = vec![b];
            let mut cur = b;
            let succs = loop {
                match g.node(cur).class() {
                    NodeClass::Begin | NodeClass::Fixed => match g.next(cur) {
                        Some(n) if g.node(n).class() == NodeClass::Begin => break vec![n],
                        Some(n) => {
                            fixed.push(n);
                            cur = n;
                        }
                        None => {
                            return Err(CompilationError::internal(format!(
                                "%{}: control flow ends without a sink",
                                usize::from(cur)
                            )))
                        }
                    },
                    NodeClass::Split => break g.node(cur).successors().to_vec(),
                    NodeClass::End => {
                        let m = g.merge_of(cur).ok_or_else(|| {
                            CompilationError::internal(format!(
                                "%{}: end without a merge",
                                usize::from(cur)
                            ))
                        })?;
                        break vec![m];
                    }
                    NodeClass::Sink => break Vec::new(),
                    NodeClass::Floating | NodeClass::Logic => {
                        return Err(CompilationError::internal(format!(
                            "%{}: floating node in control flow",
                            usize::from(cur)
                        )))
                    }
                }
            };
            todo.extend(succs.iter().rev());
            raw.push(RawBlock {
                begin: b,
                fixed,
                succs,
            });
        }
        Ok(raw)
    }

    /// Is this floating node placed in a block, or materialised by its users?
    fn is_scheduled(n: &Node) -> bool {
        n.class() == NodeClass::Floating
            && !matches!(
                n,
                Node::Const(_) | Node::VirtualObject(_) | Node::MonitorId(_) | Node::Phi(_)
            )
    }

    /// Push every value of `fs` and its outer states onto `out`.
    fn state_values(g: &Graph, fs: Option<FrameStateIdx>, out: &mut Vec<NodeIdx>) {
        let mut cur = fs;
        while let Some(s) = cur {
            let s = g.frame_state(s);
            out.extend(s.values());
            cur = s.outer;
        }
    }

    fn state_during(n: &Node) -> Option<FrameStateIdx> {
        match n {
            Node::Invoke(i) => i.state_during,
            Node::InvokeWithException(i) => i.state_during,
            _ => None,
        }
    }

    /// The block in which `x`'s value first becomes available.
    fn def_block(&self, g: &Graph, x: NodeIdx, memo: &mut HashMap<NodeIdx, BlockId>) -> BlockId {
        if let Some(b) = memo.get(&x) {
            return *b;
        }
        let entry = BlockId::new(0);
        let n = g.node(x);
        let b = match n {
            Node::InvokeWithException(InvokeWithException { next, .. }) => {
                self.node_block.get(next).copied().unwrap_or(entry)
            }
            Node::Phi(_) => self.node_block.get(&x).copied().unwrap_or(entry),
            Node::ValueProxy(p) => self.node_block.get(&p.exit).copied().unwrap_or(entry),
            Node::Param(_) | Node::Const(_) | Node::VirtualObject(_) | Node::MonitorId(_) => {
                entry
            }
            _ if n.class().is_fixed() => self.node_block.get(&x).copied().unwrap_or(entry),
            _ => {
                let mut best = entry;
                for i in n.inputs() {
                    let ib = self.def_block(g, i, memo);
                    if self.blocks[ib].depth > self.blocks[best].depth {
                        best = ib;
                    }
                }
                best
            }
        };
        memo.insert(x, b);
        b
    }

    fn schedule_floating(&mut self, g: &Graph, raw: &[RawBlock], rpo_of: &[usize]) {
        // Find every floating node the fixed nodes, frame states and phis need.
        let mut todo = Vec::new();
        for b in &self.blocks {
            todo.extend(b.phis.iter().flat_map(|p| g.node(*p).inputs()));
        }
        for r in raw {
            for &f in &r.fixed {
                todo.extend(g.node(f).inputs());
                Self::state_values(g, g.state_after(f), &mut todo);
                Self::state_values(g, Self::state_during(g.node(f)), &mut todo);
            }
        }
        let mut seen = HashSet::new();
        let mut needed = Vec::new();
        while let Some(x) = todo.pop() {
            if !seen.insert(x) {
                continue;
            }
            let n = g.node(x);
            if Self::is_scheduled(n) {
                needed.push(x);
            }
            if !n.class().is_fixed() {
                todo.extend(n.inputs());
            }
        }
        needed.sort();

        let mut memo = HashMap::new();
        let mut floating: IndexVec<BlockId, Vec<NodeIdx>> =
            index_vec::index_vec![Vec::new(); self.blocks.len()];
        for &x in &needed {
            let b = self.def_block(g, x, &mut memo);
            floating[b].push(x);
        }
        for (b, xs) in floating.iter_enumerated() {
            for x in xs {
                self.node_block.insert(*x, b);
            }
        }

        for (rb, r) in raw.iter().enumerate() {
            let b = BlockId::new(rpo_of[rb]);
            let mut o = Orderer {
                g,
                block: b,
                node_block: &self.node_block,
                emitted: HashSet::new(),
                out: Vec::with_capacity(r.fixed.len()),
            };
            for (i, &f) in r.fixed.iter().enumerate() {
                let fnode = g.node(f);
                let is_term = i + 1 == r.fixed.len()
                    && matches!(
                        fnode.class(),
                        NodeClass::End | NodeClass::Split | NodeClass::Sink
                    );
                if is_term {
                    for &x in &floating[b] {
                        o.emit(x);
                    }
                }
                for x in fnode.inputs() {
                    o.emit(x);
                }
                let mut during = Vec::new();
                Self::state_values(g, Self::state_during(fnode), &mut during);
                for x in during {
                    o.emit(x);
                }
                o.out.push(f);
                let mut after = Vec::new();
                Self::state_values(g, g.state_after(f), &mut after);
                for x in after {
                    o.emit(x);
                }
            }
            for &x in &floating[b] {
                o.emit(x);
            }
            let out = o.out;
            self.blocks[b].nodes = out;
        }
    }

    /// The block `x` is scheduled in, if any.
    pub fn block_of(&self, x: NodeIdx) -> Option<BlockId> {
        self.node_block.get(&x).copied()
    }

    /// Does block `a` dominate block `b`?
    pub fn dominates(&self, a: BlockId, mut b: BlockId) -> bool {
        loop {
            if a == b {
                return true;
            }
            match self.blocks[b].idom {
                Some(d) => b = d,
                None => return false,
            }
        }
    }

    pub fn entry(&self) -> BlockId {
        BlockId::new(0)
    }
}

/// Orders the nodes of one block.
struct Orderer<'a> {
    g: &'a Graph,
    block: BlockId,
    node_block: &'a HashMap<NodeIdx, BlockId>,
    emitted: HashSet<NodeIdx>,
    out: Vec<NodeIdx>,
}

impl Orderer<'_> {
    /// Emit `x` (after its inputs) if it is a floating node scheduled in this block that has not
    /// yet been emitted. Unscheduled nodes are looked through.
    fn emit(&mut self, x: NodeIdx) {
        if !self.emitted.insert(x) {
            return;
        }
        let n = self.g.node(x);
        if n.class().is_fixed() || matches!(n, Node::Phi(_)) {
            return;
        }
        if !Schedule::is_scheduled(n) {
            if !matches!(n, Node::Const(_)) {
                for i in n.inputs() {
                    self.emit(i);
                }
            }
            return;
        }
        if self.node_block.get(&x) != Some(&self.block) {
            return;
        }
        for i in n.inputs() {
            self.emit(i);
        }
        self.out.push(x);
    }
}

impl Schedule {
    pub fn to_string(&self, g: &Graph) -> String {
        DisplayableSchedule { s: self, g }.to_string()
    }
}

struct DisplayableSchedule<'a> {
    s: &'a Schedule,
    g: &'a Graph,
}

impl Display for DisplayableSchedule<'_> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let ids = |xs: &[BlockId]| {
            xs.iter()
                .map(|b| format!("bb{}", b.index()))
                .collect::<Vec<_>>()
                .join(", ")
        };
        for b in &self.s.blocks {
            write!(
                f,
                "bb{}: preds=[{}] succs=[{}]",
                b.id.index(),
                ids(&b.preds),
                ids(&b.succs)
            )?;
            if let Some(d) = b.idom {
                write!(f, " idom=bb{}", d.index())?;
            }
            if b.is_loop_header {
                write!(f, " loop")?;
            }
            writeln!(f)?;
            for p in &b.phis {
                writeln!(f, "  {}", self.g.node_str(*p))?;
            }
            for n in &b.nodes {
                writeln!(f, "  {}", self.g.node_str(*n))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn idoms_diamond_and_loop() {
        // 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3
        let preds = vec![vec![], vec![0], vec![0], vec![1, 2]];
        assert_eq!(compute_idoms(&preds), vec![0, 0, 0, 0]);
        // 0 -> 1 -> 2 -> 1, 2 -> 3
        let preds = vec![vec![], vec![0, 2], vec![1], vec![2]];
        assert_eq!(compute_idoms(&preds), vec![0, 0, 1, 2]);
        // 2 is unreachable.
        let preds = vec![vec![], vec![0], vec![]];
        assert_eq!(compute_idoms(&preds), vec![0, 0, usize::MAX]);
    }
}
