//! Splits a method's bytecode into basic blocks.
//!
//! The resulting [BlockMap] records, for every block: its bytecode range; its successors; whether
//! it is a loop header (and if so, its loop id); and the set of loops it is part of as a bit mask
//! (so at most 64 loops per method are supported). Blocks are numbered in reverse post-order, so
//! iterating over blocks in ascending order visits every block after all of its forward
//! predecessors.
//!
//! Three kinds of synthetic block exist alongside bytecode blocks:
//!
//!  * exception dispatch blocks, one per exception handler, which test the exception's type and
//!    branch either to the handler or to the next dispatch block;
//!  * a single unwind block which rethrows an exception to the caller;
//!  * a single return block, used by inlined callees with more than one return.
//!
//! A block always ends after an instruction that can trap if a handler covers that instruction.
//! Thus an exception raised at a block's final instruction dispatches via that block's
//! [BciBlock::exception_dispatch], and any other exception unwinds.
//!
//! `jsr` / `ret` are supported only for subroutines with a single call site, which can then be
//! treated as plain control flow.

use super::{BytecodeStream, Op};
use crate::{
    compile::CompilationError,
    graph::{cfg::compute_idoms, frame_state::Bci},
    meta::{ExceptionHandler, ResolvedMethod},
};
use index_vec::IndexVec;
use std::collections::{BTreeSet, HashMap};

index_vec::define_index_type! {
    pub struct BlockIdx = u32;
}

/// The maximum number of loops we can represent in [BciBlock::loops].
pub const MAX_LOOPS: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub enum BlockKind {
    Bytecode,
    ExceptionDispatch {
        handler: ExceptionHandler,
        /// The bci of the instruction whose exception first led to this dispatch block.
        deopt_bci: u32,
    },
    Unwind,
    Return,
}

#[derive(Clone, Debug)]
pub struct BciBlock {
    pub id: BlockIdx,
    pub kind: BlockKind,
    pub start_bci: u32,
    /// The bci of the block's last instruction (inclusive).
    pub end_bci: u32,
    pub successors: Vec<BlockIdx>,
    pub predecessor_count: usize,
    pub is_exception_entry: bool,
    pub is_loop_header: bool,
    pub loop_id: usize,
    /// A bit set of every loop this block is part of.
    pub loops: u64,
    /// Where an exception raised by the block's final instruction is dispatched to.
    pub exception_dispatch: Option<BlockIdx>,
    /// If this block is part of a subroutine, the bci of the subroutine's entry.
    pub jsr_scope: Option<u32>,
}

impl BciBlock {
    fn new(kind: BlockKind, start_bci: u32, end_bci: u32) -> Self {
        BciBlock {
            id: BlockIdx::new(0),
            kind,
            start_bci,
            end_bci,
            successors: Vec::new(),
            predecessor_count: 0,
            is_exception_entry: false,
            is_loop_header: false,
            loop_id: 0,
            loops: 0,
            exception_dispatch: None,
            jsr_scope: None,
        }
    }

    pub fn is_dispatch(&self) -> bool {
        matches!(self.kind, BlockKind::ExceptionDispatch { .. })
    }

    /// The bci a frame state at the entry of this block should carry.
    pub fn entry_bci(&self) -> Bci {
        match self.kind {
            BlockKind::Bytecode => Bci::At(self.start_bci),
            BlockKind::ExceptionDispatch { deopt_bci, .. } => Bci::At(deopt_bci),
            BlockKind::Unwind => Bci::AfterException,
            BlockKind::Return => Bci::After,
        }
    }
}

#[derive(Debug)]
pub struct BlockMap {
    pub blocks: IndexVec<BlockIdx, BciBlock>,
    /// Maps the start bci of each bytecode block to its block.
    starts: HashMap<u32, BlockIdx>,
    pub unwind: BlockIdx,
    pub ret: BlockIdx,
    pub loop_count: usize,
    /// How many return instructions the method has.
    pub return_count: usize,
}

/// Scratch state used while building a [BlockMap].
struct Builder<'a> {
    method: &'a ResolvedMethod,
    blocks: Vec<BciBlock>,
    starts: HashMap<u32, usize>,
    dispatch: HashMap<usize, usize>,
    unwind: usize,
    ret: usize,
    visited: Vec<bool>,
    active: Vec<bool>,
    post_order: Vec<usize>,
    back_edges: Vec<(usize, usize)>,
    next_loop: usize,
}

impl BlockMap {
    pub fn new(method: &ResolvedMethod) -> Result<Self, CompilationError> {
        let insts = Self::validate(method)?;
        let mut b = Builder {
            method,
            blocks: Vec::new(),
            starts: HashMap::new(),
            dispatch: HashMap::new(),
            unwind: 0,
            ret: 0,
            visited: Vec::new(),
            active: Vec::new(),
            post_order: Vec::new(),
            back_edges: Vec::new(),
            next_loop: 0,
        };
        b.make_blocks(&insts)?;
        b.link_blocks(&insts)?;
        b.link_subroutines(&insts)?;
        b.compute_block_order()?;
        let mut bm = b.finish()?;
        let mut s = BytecodeStream::new(&method.code);
        for &bci in &insts {
            s.set_bci(bci);
            if s.opcode()?.is_return() {
                bm.return_count += 1;
            }
        }
        Ok(bm)
    }

    /// Check that every instruction decodes and that branch targets are instruction starts,
    /// returning the bci of every instruction.
    fn validate(method: &ResolvedMethod) -> Result<Vec<u32>, CompilationError> {
        if method.code.is_empty() {
            return Err(CompilationError::Bailout("method has no bytecode".into()));
        }
        let mut s = BytecodeStream::new(&method.code);
        let mut insts = Vec::new();
        while !s.at_end() {
            insts.push(s.current_bci());
            if s.opcode()? == Op::invokedynamic {
                return Err(CompilationError::Bailout(
                    "invokedynamic is not supported".into(),
                ));
            }
            s.next()?;
        }
        let is_start = |bci: u32| insts.binary_search(&bci).is_ok();
        let mut s = BytecodeStream::new(&method.code);
        for &bci in &insts {
            s.set_bci(bci);
            for t in Self::branch_targets(&s)? {
                if !is_start(t) {
                    return Err(CompilationError::Bailout(format!(
                        "branch target {t} at bci {bci} is not an instruction"
                    )));
                }
            }
        }
        for h in &method.handlers {
            if !is_start(h.handler_bci) || h.start_bci >= h.end_bci {
                return Err(CompilationError::Bailout(format!(
                    "malformed exception handler {h:?}"
                )));
            }
        }
        s.set_bci(*insts.last().unwrap_or(&0));
        let last = s.opcode()?;
        if !(Self::ends_flow(last) || last.is_return()) {
            return Err(CompilationError::Bailout(
                "control falls off the end of the method".into(),
            ));
        }
        Ok(insts)
    }

    /// Does `op` end a block without falling through to the next instruction?
    fn ends_flow(op: Op) -> bool {
        matches!(
            op,
            Op::goto
                | Op::goto_w
                | Op::athrow
                | Op::ret
                | Op::tableswitch
                | Op::lookupswitch
                | Op::jsr
                | Op::jsr_w
        ) || op.is_return()
    }

    /// The explicit branch targets of the instruction at `s`.
    fn branch_targets(s: &BytecodeStream) -> Result<Vec<u32>, CompilationError> {
        let op = s.opcode()?;
        Ok(match op {
            Op::goto_w | Op::jsr_w => vec![s.read_far_branch_dest()],
            Op::tableswitch | Op::lookupswitch => {
                let t = s.read_switch();
                let mut v = t.targets;
                v.push(t.default);
                v
            }
            x if x.is_branch() => vec![s.read_branch_dest()],
            _ => Vec::new(),
        })
    }

    /// The block starting at `bci`.
    pub fn block_at(&self, bci: u32) -> Option<BlockIdx> {
        self.starts.get(&bci).copied()
    }

    /// The bytecode block containing `bci`.
    pub fn block_containing(&self, bci: u32) -> Option<BlockIdx> {
        self.blocks
            .iter()
            .find(|b| b.kind == BlockKind::Bytecode && b.start_bci <= bci && bci <= b.end_bci)
            .map(|b| b.id)
    }

    pub fn start(&self) -> BlockIdx {
        BlockIdx::new(0)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}

impl Builder<'_> {
    fn covered(&self, bci: u32) -> bool {
        self.method.handlers.iter().any(|h| h.covers(bci))
    }

    fn make_blocks(&mut self, insts: &[u32]) -> Result<(), CompilationError> {
        let mut starts = BTreeSet::new();
        starts.insert(0);
        for h in &self.method.handlers {
            starts.insert(h.handler_bci);
        }
        let mut s = BytecodeStream::new(&self.method.code);
        for (i, &bci) in insts.iter().enumerate() {
            s.set_bci(bci);
            let op = s.inner_opcode()?;
            starts.extend(BlockMap::branch_targets(&s)?);
            let ends = BlockMap::ends_flow(op)
                || op.is_branch()
                || (op.can_trap() && self.covered(bci));
            if ends {
                if let Some(&next) = insts.get(i + 1) {
                    starts.insert(next);
                }
            }
        }
        let starts = starts.into_iter().collect::<Vec<_>>();
        for (i, &start) in starts.iter().enumerate() {
            let limit = starts.get(i + 1).copied().unwrap_or(u32::MAX);
            let end = insts
                .iter()
                .copied()
                .filter(|&bci| bci >= start && bci < limit)
                .last()
                .unwrap_or(start);
            self.starts.insert(start, self.blocks.len());
            self.blocks
                .push(BciBlock::new(BlockKind::Bytecode, start, end));
        }
        for h in &self.method.handlers {
            let b = self.starts[&h.handler_bci];
            self.blocks[b].is_exception_entry = true;
        }
        self.unwind = self.blocks.len();
        self.blocks.push(BciBlock::new(BlockKind::Unwind, 0, 0));
        self.ret = self.blocks.len();
        self.blocks.push(BciBlock::new(BlockKind::Return, 0, 0));
        Ok(())
    }

    fn add_successor(&mut self, from: usize, to: usize) {
        if !self.blocks[from].successors.contains(&BlockIdx::new(to)) {
            self.blocks[from].successors.push(BlockIdx::new(to));
        }
    }

    /// Return the dispatch block for an exception raised at `bci`, creating the chain of
    /// dispatch blocks if necessary.
    fn exception_dispatch(&mut self, bci: u32) -> Option<usize> {
        let mut last: Option<usize> = None;
        for (hidx, h) in self.method.handlers.iter().enumerate().rev() {
            if !h.covers(bci) {
                continue;
            }
            if h.is_catch_all() {
                // Handlers after a catch-all can never be reached.
                last = None;
            }
            let d = match self.dispatch.get(&hidx) {
                Some(d) => *d,
                None => {
                    let d = self.blocks.len();
                    self.blocks.push(BciBlock::new(
                        BlockKind::ExceptionDispatch {
                            handler: *h,
                            deopt_bci: bci,
                        },
                        bci,
                        bci,
                    ));
                    let handler_block = self.starts[&h.handler_bci];
                    self.add_successor(d, handler_block);
                    if !h.is_catch_all() {
                        let next = last.unwrap_or(self.unwind);
                        self.add_successor(d, next);
                    }
                    self.dispatch.insert(hidx, d);
                    d
                }
            };
            last = Some(d);
        }
        last
    }

    fn link_blocks(&mut self, insts: &[u32]) -> Result<(), CompilationError> {
        let mut s = BytecodeStream::new(&self.method.code);
        for b in 0..self.unwind {
            let end = self.blocks[b].end_bci;
            s.set_bci(end);
            let op = s.inner_opcode()?;
            let next = insts
                .iter()
                .find(|&&bci| bci > end)
                .map(|bci| self.starts[bci]);
            match op {
                Op::jsr | Op::jsr_w => {
                    let t = BlockMap::branch_targets(&s)?[0];
                    self.add_successor(b, self.starts[&t]);
                }
                // Linked in `link_subroutines`.
                Op::ret => (),
                _ => {
                    for t in BlockMap::branch_targets(&s)? {
                        self.add_successor(b, self.starts[&t]);
                    }
                    if !BlockMap::ends_flow(op) {
                        if let Some(next) = next {
                            self.add_successor(b, next);
                        }
                    }
                }
            }
            if op.can_trap() && self.covered(end) {
                if let Some(d) = self.exception_dispatch(end) {
                    self.add_successor(b, d);
                    self.blocks[b].exception_dispatch = Some(BlockIdx::new(d));
                }
            }
        }
        Ok(())
    }

    /// Resolve `ret` instructions to the instruction after their subroutine's single `jsr`.
    fn link_subroutines(&mut self, insts: &[u32]) -> Result<(), CompilationError> {
        let unstructured =
            || CompilationError::Bailout("unstructured control flow (internal limitation)".into());
        let mut s = BytecodeStream::new(&self.method.code);
        // Subroutine entry bci -> bci after its call site.
        let mut subroutines: HashMap<u32, u32> = HashMap::new();
        for &bci in insts {
            s.set_bci(bci);
            if matches!(s.opcode()?, Op::jsr | Op::jsr_w) {
                let entry = BlockMap::branch_targets(&s)?[0];
                if subroutines.insert(entry, s.next_bci()).is_some() {
                    return Err(unstructured());
                }
            }
        }
        let mut entries = subroutines.keys().copied().collect::<Vec<_>>();
        entries.sort();
        for entry in entries {
            let ret_to = self
                .starts
                .get(&subroutines[&entry])
                .copied()
                .ok_or_else(unstructured)?;
            let mut todo = vec![self.starts[&entry]];
            let mut seen = vec![false; self.blocks.len()];
            while let Some(b) = todo.pop() {
                if seen[b] {
                    continue;
                }
                seen[b] = true;
                match self.blocks[b].jsr_scope {
                    Some(x) if x != entry => {
                        return Err(CompilationError::Bailout(
                            "unstructured control flow (ret leaves more than one scope)".into(),
                        ))
                    }
                    _ => self.blocks[b].jsr_scope = Some(entry),
                }
                if self.blocks[b].kind != BlockKind::Bytecode {
                    continue;
                }
                s.set_bci(self.blocks[b].end_bci);
                match s.inner_opcode()? {
                    Op::ret => self.add_successor(b, ret_to),
                    Op::jsr | Op::jsr_w => return Err(unstructured()),
                    _ => todo.extend(self.blocks[b].successors.iter().map(|x| x.index())),
                }
            }
        }
        // A `ret` outside of any subroutine cannot be resolved.
        for b in 0..self.unwind {
            s.set_bci(self.blocks[b].end_bci);
            if s.inner_opcode()? == Op::ret && self.blocks[b].jsr_scope.is_none() {
                return Err(unstructured());
            }
        }
        Ok(())
    }

    fn make_loop_header(&mut self, b: usize) -> Result<(), CompilationError> {
        if !self.blocks[b].is_loop_header {
            if self.blocks[b].is_exception_entry {
                return Err(CompilationError::Bailout(
                    "loop formed by an exception handler".into(),
                ));
            }
            if self.next_loop >= MAX_LOOPS {
                return Err(CompilationError::Bailout("too many loops in method".into()));
            }
            self.blocks[b].is_loop_header = true;
            self.blocks[b].loop_id = self.next_loop;
            self.blocks[b].loops |= 1 << self.next_loop;
            self.next_loop += 1;
        }
        Ok(())
    }

    /// Depth first search which finds loop headers (targets of edges back to an active block)
    /// and records the post order. Returns the loop bits that flow back into the caller.
    fn order_block(&mut self, b: usize) -> Result<u64, CompilationError> {
        if self.visited[b] {
            if self.active[b] {
                self.make_loop_header(b)?;
                return Ok(self.blocks[b].loops);
            } else if self.blocks[b].is_loop_header {
                return Ok(self.blocks[b].loops & !(1 << self.blocks[b].loop_id));
            } else {
                return Ok(self.blocks[b].loops);
            }
        }
        self.visited[b] = true;
        self.active[b] = true;
        let mut loops = 0;
        let succs = self.blocks[b].successors.clone();
        for s in succs {
            if self.active[s.index()] {
                self.back_edges.push((b, s.index()));
            }
            loops |= self.order_block(s.index())?;
        }
        self.blocks[b].loops |= loops;
        let mut loops = self.blocks[b].loops;
        if self.blocks[b].is_loop_header {
            loops &= !(1 << self.blocks[b].loop_id);
        }
        self.active[b] = false;
        self.post_order.push(b);
        Ok(loops)
    }

    /// Propagate loop bits until a fixed point is reached: a loop's bit must be set on every
    /// block from which the loop's back edge can be reached without leaving the loop.
    fn fix_loop_bits(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            for &b in &self.post_order {
                let mut loops = self.blocks[b].loops;
                for s in &self.blocks[b].successors {
                    let s = &self.blocks[s.index()];
                    loops |= if s.is_loop_header {
                        s.loops & !(1 << s.loop_id)
                    } else {
                        s.loops
                    };
                }
                if loops != self.blocks[b].loops {
                    self.blocks[b].loops = loops;
                    changed = true;
                }
            }
        }
    }

    fn compute_block_order(&mut self) -> Result<(), CompilationError> {
        self.visited = vec![false; self.blocks.len()];
        self.active = vec![false; self.blocks.len()];
        // The unwind and return blocks always come last, so take them out of the search.
        self.visited[self.unwind] = true;
        self.visited[self.ret] = true;
        self.order_block(0)?;
        self.fix_loop_bits();

        // A loop can only be entered through its header, so the header of every back edge must
        // dominate the edge's source: anything else is irreducible.
        let rpo = self.post_order.iter().rev().copied().collect::<Vec<_>>();
        let mut rpo_idx = vec![usize::MAX; self.blocks.len()];
        for (i, &b) in rpo.iter().enumerate() {
            rpo_idx[b] = i;
        }
        let mut preds = vec![Vec::new(); rpo.len()];
        for (i, &b) in rpo.iter().enumerate() {
            for s in &self.blocks[b].successors {
                if rpo_idx[s.index()] != usize::MAX {
                    preds[rpo_idx[s.index()]].push(i);
                }
            }
        }
        let idoms = compute_idoms(&preds);
        for &(src, header) in &self.back_edges {
            let (header, mut cur) = (rpo_idx[header], rpo_idx[src]);
            while cur != header && cur != 0 {
                cur = idoms[cur];
            }
            if cur != header {
                return Err(CompilationError::Bailout(
                    "irreducible loop (internal limitation)".into(),
                ));
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<BlockMap, CompilationError> {
        let mut order = self.post_order.iter().rev().copied().collect::<Vec<_>>();
        order.push(self.unwind);
        order.push(self.ret);
        let mut new_id = vec![None; self.blocks.len()];
        for (i, &b) in order.iter().enumerate() {
            new_id[b] = Some(BlockIdx::new(i));
        }
        let remap = |x: BlockIdx| new_id[x.index()];
        let mut blocks = IndexVec::with_capacity(order.len());
        for &b in &order {
            let mut blk = std::mem::replace(
                &mut self.blocks[b],
                BciBlock::new(BlockKind::Bytecode, 0, 0),
            );
            blk.id = BlockIdx::new(blocks.len());
            blk.successors = blk.successors.iter().filter_map(|&x| remap(x)).collect();
            blk.exception_dispatch = blk.exception_dispatch.and_then(remap);
            blocks.push(blk);
        }
        let succs = blocks
            .iter()
            .flat_map(|b: &BciBlock| b.successors.clone())
            .collect::<Vec<_>>();
        for s in succs {
            blocks[s].predecessor_count += 1;
        }
        let starts = self
            .starts
            .iter()
            .filter_map(|(&bci, &b)| new_id[b].map(|x| (bci, x)))
            .collect();
        Ok(BlockMap {
            blocks,
            starts,
            unwind: BlockIdx::new(order.len() - 2),
            ret: BlockIdx::new(order.len() - 1),
            loop_count: self.next_loop,
            return_count: 0,
        })
    }
}
