//! Bytecode to graph translation.
//!
//! A [Parser] abstractly interprets a method's bytecode block by block, in the reverse post
//! order computed by the [BlockMap]. Each block starts from the entry state recorded by the first
//! control flow edge that reached it: later edges are merged into that state, creating phis where
//! values differ. Loop headers get their phis eagerly (for every slot that the liveness analysis
//! says may change in the loop), so that back edges only ever add phi inputs.
//!
//! Edges that leave loops pass through one [LoopExit] per exited loop, and every value created
//! inside the loop is routed through a [ValueProxy] at the exit.
//!
//! Calls to small, statically bound methods can be inlined: the callee is parsed by a nested
//! parser that shares the graph with its caller.

pub mod frame_state_builder;

use crate::{
    bytecode::{
        blockmap::{BciBlock, BlockIdx, BlockKind, BlockMap},
        liveness::LocalLiveness,
        BytecodeStream, Op, SwitchTable,
    },
    compile::{CompilationError, ErrorContext},
    config::Config,
    graph::{
        frame_state::Bci,
        nodes::{
            Arith, ArithOp, ArrayLength, Begin, BytecodeException, BytecodeExceptionKind,
            CallTarget, CheckCast, Compare, Condition, Conditional, Const, Convert, ConvertOp,
            DeoptAction, DeoptReason, Deoptimize, End, EntryMarker, ExceptionObject, FieldRef,
            FixedGuard, If, InstanceOf, IntegerDivRem, IntegerSwitch, Intrinsic, IntrinsicOp,
            InvokeKind, InvokeWithException, Invoke, IsNull, LoadField, LoadIndexed, LoopBegin,
            LoopEnd, LoopExit, Merge, MethodRef, MonitorEnter, MonitorExit, MonitorId, Negate,
            NewArray, NewInstance, NewMultiArray, Node, NodeClass, NodeT, NormalizeCompare, Param,
            Prob, Return, StoreField, StoreIndexed, SwitchKind, TypeRef, Unwind,
        },
        simplify::fold_logic,
        Graph, NodeIdx,
    },
    meta::{
        Constant, ConstantReflection, JavaField, JavaMethod, JavaType, Kind, LoadableConstant,
        MetaAccess, ResolvedField, ResolvedMethod, ResolvedType,
    },
};
use frame_state_builder::FrameStateBuilder;
use index_vec::{index_vec, IndexVec};
use std::{cmp::Reverse, iter, sync::Arc};

/// The probability we assign to the exceptional side of an explicit exception check.
const EXCEPTION_PROB: f64 = 0.0001;

/// The kinds of the `xload_n` / `xstore_n` families, in opcode order.
const SHORT_LOCAL_KINDS: [Kind; 5] = [Kind::Int, Kind::Long, Kind::Float, Kind::Double, Kind::Object];

/// State shared by the parser of the root method and the parsers of the methods inlined into it.
struct BuildContext<'a> {
    g: Graph,
    config: &'a Config,
    meta: &'a dyn MetaAccess,
    reflection: &'a dyn ConstantReflection,
    next_inlining_id: usize,
}

/// Parse `method` into a new graph. If `entry_bci` is given, an [EntryMarker] is placed at that
/// bci so that the compiled code can be entered there (on-stack replacement).
pub fn build_graph(
    method: &Arc<ResolvedMethod>,
    entry_bci: Option<u32>,
    config: &Config,
    meta: &dyn MetaAccess,
    reflection: &dyn ConstantReflection,
) -> Result<Graph, CompilationError> {
    let mut cx = BuildContext {
        g: Graph::new(Arc::clone(method)),
        config,
        meta,
        reflection,
        next_inlining_id: 1,
    };
    let state = FrameStateBuilder::new(Arc::clone(method), 0, None, 0);
    Parser::new(&mut cx, Arc::clone(method), 0, state, entry_bci)?
        .build_root()
        .map_err(|e| e.with_method(&method.qualified_name()))?;
    Ok(cx.g)
}

struct Parser<'c, 'a> {
    cx: &'c mut BuildContext<'a>,
    method: Arc<ResolvedMethod>,
    bm: BlockMap,
    liveness: LocalLiveness,
    /// 0 for the root method, 1 for methods it inlines, and so on.
    depth: usize,
    entry_bci: Option<u32>,
    state: FrameStateBuilder,
    /// The fixed node that the next appended node follows, or `None` if control flow has ended.
    last: Option<NodeIdx>,
    current: Option<BlockIdx>,
    bci: u32,
    next_bci: u32,
    first_instr: IndexVec<BlockIdx, Option<NodeIdx>>,
    entry_states: IndexVec<BlockIdx, Option<FrameStateBuilder>>,
    /// Loop id -> the loop's header block.
    loop_headers: Vec<BlockIdx>,
    /// Has any control flow edge been split so far? Until one has, a block's first instruction
    /// can always reuse the predecessor's last instruction.
    control_flow_split: bool,
    /// The object locked by a synchronized method.
    sync_object: Option<NodeIdx>,
    // Results for the caller of an inlined method.
    return_value: Option<NodeIdx>,
    before_return: Option<NodeIdx>,
    unwind: Option<(NodeIdx, NodeIdx)>,
}

impl<'c, 'a> Parser<'c, 'a> {
    fn new(
        cx: &'c mut BuildContext<'a>,
        method: Arc<ResolvedMethod>,
        depth: usize,
        state: FrameStateBuilder,
        entry_bci: Option<u32>,
    ) -> Result<Self, CompilationError> {
        let bm = BlockMap::new(&method)?;
        let liveness = LocalLiveness::compute(&method, &bm, cx.config.liveness_analysis)?;
        if let Some(e) = entry_bci {
            let b = bm.block_containing(e).ok_or_else(|| {
                CompilationError::Bailout(format!("OSR entry bci {e} is unreachable"))
            })?;
            if bm.blocks[b].jsr_scope.is_some() {
                return Err(CompilationError::Bailout(
                    "OSR into a JSR scope is not supported".into(),
                ));
            }
            if bm.block_at(e) != Some(b) {
                return Err(CompilationError::Bailout(format!(
                    "OSR entry bci {e} is not at the start of a block"
                )));
            }
        }
        let mut loop_headers = vec![BlockIdx::new(0); bm.loop_count];
        for b in bm.blocks.iter().filter(|b| b.is_loop_header) {
            loop_headers[b.loop_id] = b.id;
        }
        let nblocks = bm.len();
        Ok(Parser {
            cx,
            method,
            bm,
            liveness,
            depth,
            entry_bci,
            state,
            last: None,
            current: None,
            bci: 0,
            next_bci: 0,
            first_instr: index_vec![None; nblocks],
            entry_states: index_vec![None; nblocks],
            loop_headers,
            control_flow_split: false,
            sync_object: None,
            return_value: None,
            before_return: None,
            unwind: None,
        })
    }

    fn internal(&self, msg: impl Into<String>) -> CompilationError {
        CompilationError::Internal {
            msg: msg.into(),
            context: ErrorContext {
                method: Some(self.method.qualified_name()),
                bci: Some(self.bci),
                node: None,
            },
        }
    }

    fn last(&self) -> Result<NodeIdx, CompilationError> {
        self.last
            .ok_or_else(|| self.internal("control flow has already ended"))
    }

    fn block_at(&self, bci: u32) -> Result<BlockIdx, CompilationError> {
        self.bm
            .block_at(bci)
            .ok_or_else(|| self.internal(format!("no block starts at bci {bci}")))
    }

    /// Parse the root method, starting at the graph's start node.
    fn build_root(&mut self) -> Result<(), CompilationError> {
        let g = &mut self.cx.g;
        let start = g.start();
        self.state.init_params(g)?;
        let start_bci = if self.method.is_synchronized {
            Bci::Before
        } else {
            Bci::At(0)
        };
        let fs = self.state.create(g, start_bci);
        g.set_state_after(start, Some(fs));
        self.last = Some(start);
        if self.method.is_synchronized {
            let obj = if self.method.is_static {
                self.constant(Constant::Object(self.method.holder.mirror))
            } else {
                self.state.load_local(0, Kind::Object)?
            };
            self.sync_object = Some(obj);
            self.gen_monitor_enter(obj, 0)?;
        }
        self.parse()
    }

    /// Parse every reachable block, continuing from `self.last`.
    fn parse(&mut self) -> Result<(), CompilationError> {
        let start = self.bm.start();
        if self.bm.blocks[start].is_loop_header {
            self.append_goto(start)?;
        } else {
            self.first_instr[start] = self.last;
            self.entry_states[start] = Some(self.state.clone());
        }
        for b in 0..self.bm.len() {
            self.process_block(BlockIdx::new(b))?;
            if self.cx.g.node_count() > self.cx.config.max_nodes {
                return Err(CompilationError::ResourceExhausted(format!(
                    "graph exceeds {} nodes",
                    self.cx.config.max_nodes
                )));
            }
        }
        Ok(())
    }

    fn process_block(&mut self, b: BlockIdx) -> Result<(), CompilationError> {
        let Some(first) = self.first_instr[b] else {
            return Ok(());
        };
        let blk = self.bm.blocks[b].clone();
        self.current = Some(b);
        self.last = Some(first);
        self.bci = blk.start_bci;
        self.state = self.entry_states[b]
            .clone()
            .ok_or_else(|| self.internal(format!("block {} has no entry state", b.index())))?;
        if matches!(self.cx.g.node(first), Node::Merge(_)) && self.cx.g.state_after(first).is_none()
        {
            let fs = self.state.create(&mut self.cx.g, blk.entry_bci());
            self.cx.g.set_state_after(first, Some(fs));
        }
        match blk.kind {
            BlockKind::Unwind => self.handle_unwind_block(),
            BlockKind::Return => self.handle_return_block(),
            BlockKind::ExceptionDispatch { deopt_bci, .. } => {
                self.bci = deopt_bci;
                self.create_exception_dispatch(&blk)
            }
            BlockKind::Bytecode => {
                self.state.rethrow_exception = false;
                self.iterate_bytecodes(&blk)
            }
        }
    }

    fn iterate_bytecodes(&mut self, blk: &BciBlock) -> Result<(), CompilationError> {
        if blk.is_loop_header {
            self.control_flow_split = true;
            let last = self.last()?;
            let g = &mut self.cx.g;
            let pre = g.add_node(Node::End(End));
            g.set_next(last, pre);
            let lb = g.add_node(Node::LoopBegin(LoopBegin {
                forward_ends: vec![pre],
                loop_ends: Vec::new(),
            }));
            self.state
                .insert_loop_phis(g, &self.liveness, blk.loop_id, lb);
            let fs = self.state.create(g, Bci::At(blk.start_bci));
            g.set_state_after(lb, Some(fs));
            self.first_instr[blk.id] = Some(lb);
            self.entry_states[blk.id] = Some(self.state.clone());
            self.last = Some(lb);
        }

        let method = Arc::clone(&self.method);
        let mut s = BytecodeStream::new(&method.code);
        s.set_bci(blk.start_bci);
        loop {
            self.bci = s.current_bci();
            self.next_bci = s.next_bci();
            if self.entry_bci == Some(self.bci) {
                let m = self.append(Node::EntryMarker(EntryMarker))?;
                let fs = self.state.create(&mut self.cx.g, Bci::At(self.bci));
                self.cx.g.set_state_after(m, Some(fs));
            }
            self.process_bytecode(&s)?;
            let Some(last) = self.last else {
                break;
            };
            let next = s.next()?;
            self.finish_instruction(last, next);
            if next > blk.end_bci {
                let succ = self.block_at(next)?;
                self.append_goto(succ)?;
                break;
            }
        }
        Ok(())
    }

    /// Give side effecting nodes that did not get a state of their own a state after them.
    fn finish_instruction(&mut self, last: NodeIdx, next_bci: u32) {
        let g = &mut self.cx.g;
        if matches!(g.node(last), Node::StoreField(_) | Node::StoreIndexed(_))
            && g.state_after(last).is_none()
        {
            let fs = self.state.create(g, Bci::At(next_bci));
            g.set_state_after(last, Some(fs));
        }
    }

    /// Add `node` to the graph. Floating nodes are value numbered; fixed nodes are linked after
    /// the last instruction.
    fn append(&mut self, node: Node) -> Result<NodeIdx, CompilationError> {
        let class = node.class();
        if !class.is_fixed() {
            return Ok(self.cx.g.unique(node));
        }
        let last = self.last()?;
        let n = self.cx.g.add_node(node);
        self.cx.g.set_next(last, n);
        self.last = class.has_next().then_some(n);
        Ok(n)
    }

    fn unique(&mut self, node: Node) -> NodeIdx {
        self.cx.g.unique(node)
    }

    fn constant(&mut self, c: Constant) -> NodeIdx {
        self.cx.g.unique(Node::Const(Const { c }))
    }

    fn constant_of(&self, n: NodeIdx) -> Option<Constant> {
        match self.cx.g.node(n) {
            Node::Const(Const { c }) => Some(*c),
            _ => None,
        }
    }

    /// Delete the floating node `n` if nothing refers to it.
    fn discard(&mut self, n: NodeIdx) {
        let g = &mut self.cx.g;
        if g.is_live(n) && g.usages(n).is_empty() && g.state_usages(n).is_empty() {
            g.safe_delete(n);
        }
    }

    /// Can `n` be shown to never be null without a check?
    fn is_non_null(&self, n: NodeIdx) -> bool {
        match self.cx.g.node(n) {
            Node::Const(Const { c }) => matches!(c, Constant::Object(_)),
            Node::NewInstance(_) | Node::NewArray(_) | Node::NewMultiArray(_) => true,
            Node::Param(Param { index: 0, .. }) => self.depth == 0 && !self.method.is_static,
            _ => false,
        }
    }

    // Control flow targets.

    /// Return the node that control flow arriving at block `b` with `state` should be linked
    /// to. The first edge into a block either reuses the last instruction (if `can_reuse`) or
    /// creates a [Begin]; later edges create ends into a merge or a loop begin.
    fn create_target(
        &mut self,
        b: BlockIdx,
        state: FrameStateBuilder,
        can_reuse: bool,
    ) -> Result<NodeIdx, CompilationError> {
        let (preds, is_loop_header, loops) = {
            let blk = &self.bm.blocks[b];
            (blk.predecessor_count, blk.is_loop_header, blk.loops)
        };
        let Some(first) = self.first_instr[b] else {
            let exits = self
                .current
                .map_or(0, |c| self.bm.blocks[c].loops & !loops);
            let reuse = can_reuse
                && (preds == 1 || !self.control_flow_split)
                && !is_loop_header
                && exits == 0;
            let target = match self.last {
                Some(l) if reuse => {
                    self.last = None;
                    l
                }
                _ => self.cx.g.add_node(Node::Begin(Begin)),
            };
            self.first_instr[b] = Some(target);
            let (result, mut st) = self.check_loop_exit(target, b, state)?;
            st.clear_non_live_locals(&self.bm.blocks[b], &self.liveness);
            self.entry_states[b] = Some(st);
            return Ok(result);
        };

        let mut entry = self.entry_states[b]
            .take()
            .ok_or_else(|| self.internal(format!("block {} has no entry state", b.index())))?;
        if !entry.is_compatible_with(&self.cx.g, &state)? {
            return Err(CompilationError::Bailout(
                "stacks do not match; bytecodes would not verify".into(),
            ));
        }
        let result = if matches!(self.cx.g.node(first), Node::LoopBegin(_)) {
            let le = self
                .cx
                .g
                .add_node(Node::LoopEnd(LoopEnd { loop_begin: first }));
            let (result, st) = self.check_loop_exit(le, b, state)?;
            entry.merge(&mut self.cx.g, first, &st)?;
            self.cx.g.add_loop_end(first, le);
            result
        } else {
            let merge = match self.cx.g.node(first) {
                Node::Merge(_) => first,
                _ => self.convert_to_merge(b, first),
            };
            let end = self.cx.g.add_node(Node::End(End));
            let (result, st) = self.check_loop_exit(end, b, state)?;
            entry.merge(&mut self.cx.g, merge, &st)?;
            self.cx.g.add_forward_end(merge, end);
            result
        };
        self.entry_states[b] = Some(entry);
        Ok(result)
    }

    /// Turn the first instruction `first` of block `b` into a merge with a single end.
    fn convert_to_merge(&mut self, b: BlockIdx, first: NodeIdx) -> NodeIdx {
        let g = &mut self.cx.g;
        let next = g.clear_next(first);
        let end = g.add_node(Node::End(End));
        let merge = g.add_node(Node::Merge(Merge { ends: Vec::new() }));
        let pred_is_split = g
            .pred(first)
            .map(|p| g.node(p).class() == NodeClass::Split);
        if matches!(g.node(first), Node::Begin(_)) && pred_is_split == Some(false) {
            g.replace_at_predecessor(first, end);
            g.safe_delete(first);
        } else {
            g.set_next(first, end);
        }
        g.add_forward_end(merge, end);
        if let Some(n) = next {
            g.set_next(merge, n);
        }
        self.first_instr[b] = Some(merge);
        merge
    }

    /// Like [Self::create_target], but always returns a begin node so that the result can be
    /// the successor of a control split.
    fn create_block_target(
        &mut self,
        b: BlockIdx,
        state: FrameStateBuilder,
    ) -> Result<NodeIdx, CompilationError> {
        let t = self.create_target(b, state, false)?;
        if self.cx.g.node(t).class() == NodeClass::Begin {
            return Ok(t);
        }
        let begin = self.cx.g.add_node(Node::Begin(Begin));
        self.cx.g.set_next(begin, t);
        Ok(begin)
    }

    /// If control flow from the current block to `target_block` leaves any loops, put a chain
    /// of loop exits (innermost loop first) before `target`. Returns the node to link to and the
    /// state, with proxies for loop values, to continue with.
    fn check_loop_exit(
        &mut self,
        target: NodeIdx,
        target_block: BlockIdx,
        state: FrameStateBuilder,
    ) -> Result<(NodeIdx, FrameStateBuilder), CompilationError> {
        let Some(cur) = self.current else {
            return Ok((target, state));
        };
        let exits = self.bm.blocks[cur].loops & !self.bm.blocks[target_block].loops;
        if exits == 0 {
            return Ok((target, state));
        }
        let mut headers = (0..self.bm.loop_count)
            .filter(|i| exits & (1 << i) != 0)
            .map(|i| self.loop_headers[i])
            .collect::<Vec<_>>();
        headers.sort_by_key(|h| {
            let blk = &self.bm.blocks[*h];
            (Reverse(blk.loops.count_ones()), blk.loop_id)
        });
        let entry_bci = self.bm.blocks[target_block].entry_bci();
        let mut st = state;
        let mut first = None;
        let mut prev: Option<NodeIdx> = None;
        for h in headers {
            let lb = self.first_instr[h]
                .ok_or_else(|| self.internal("loop exit from an unparsed loop"))?;
            let exit = self
                .cx
                .g
                .add_node(Node::LoopExit(LoopExit { loop_begin: lb }));
            match prev {
                Some(p) => self.cx.g.set_next(p, exit),
                None => first = Some(exit),
            }
            prev = Some(exit);
            st.clear_non_live_locals(&self.bm.blocks[target_block], &self.liveness);
            let loop_entry = self.entry_states[h]
                .as_ref()
                .ok_or_else(|| CompilationError::internal("loop header has no entry state"))?;
            st.insert_loop_proxies(&mut self.cx.g, exit, lb, loop_entry);
            let fs = st.create(&mut self.cx.g, entry_bci);
            self.cx.g.set_state_after(exit, Some(fs));
        }
        match (first, prev) {
            (Some(first), Some(prev)) => {
                self.cx.g.set_next(prev, target);
                Ok((first, st))
            }
            _ => Ok((target, st)),
        }
    }

    /// Jump to block `b`, ending the current control flow.
    fn append_goto(&mut self, b: BlockIdx) -> Result<(), CompilationError> {
        let target = self.create_target(b, self.state.clone(), true)?;
        if let Some(l) = self.last {
            if l != target {
                self.cx.g.set_next(l, target);
            }
        }
        self.last = None;
        Ok(())
    }

    fn goto_bci(&mut self, bci: u32) -> Result<(), CompilationError> {
        let b = self.block_at(bci)?;
        self.append_goto(b)
    }

    // Bytecodes.

    fn process_bytecode(&mut self, s: &BytecodeStream) -> Result<(), CompilationError> {
        use Op::*;
        let op = s.inner_opcode()?;
        if let Some((kind, i, store)) = short_local_op(op) {
            return if store {
                self.store_local(kind, i)
            } else {
                self.load_local(kind, i)
            };
        }
        match op {
            nop => (),
            aconst_null => {
                let c = self.constant(Constant::Null);
                self.state.push(Kind::Object, c);
            }
            iconst_m1 | iconst_0 | iconst_1 | iconst_2 | iconst_3 | iconst_4 | iconst_5 => {
                self.push_int(op as i32 - iconst_0 as i32)
            }
            lconst_0 | lconst_1 => {
                let c = self.constant(Constant::Long(i64::from(op as u8 - lconst_0 as u8)));
                self.state.push(Kind::Long, c);
            }
            fconst_0 | fconst_1 | fconst_2 => {
                let c = self.constant(Constant::float(f32::from(op as u8 - fconst_0 as u8)));
                self.state.push(Kind::Float, c);
            }
            dconst_0 | dconst_1 => {
                let c = self.constant(Constant::double(f64::from(op as u8 - dconst_0 as u8)));
                self.state.push(Kind::Double, c);
            }
            bipush => self.push_int(i32::from(s.read_i8(1))),
            sipush => self.push_int(i32::from(s.read_i16(1))),
            ldc => self.gen_load_constant(s.read_cpi_u8())?,
            ldc_w | ldc2_w => self.gen_load_constant(s.read_cpi())?,
            iload => self.load_local(Kind::Int, s.read_local_index())?,
            lload => self.load_local(Kind::Long, s.read_local_index())?,
            fload => self.load_local(Kind::Float, s.read_local_index())?,
            dload => self.load_local(Kind::Double, s.read_local_index())?,
            aload => self.load_local(Kind::Object, s.read_local_index())?,
            istore => self.store_local(Kind::Int, s.read_local_index())?,
            lstore => self.store_local(Kind::Long, s.read_local_index())?,
            fstore => self.store_local(Kind::Float, s.read_local_index())?,
            dstore => self.store_local(Kind::Double, s.read_local_index())?,
            astore => self.store_local(Kind::Object, s.read_local_index())?,
            iaload => self.gen_load_indexed(Kind::Int)?,
            laload => self.gen_load_indexed(Kind::Long)?,
            faload => self.gen_load_indexed(Kind::Float)?,
            daload => self.gen_load_indexed(Kind::Double)?,
            aaload => self.gen_load_indexed(Kind::Object)?,
            baload => self.gen_load_indexed(Kind::Byte)?,
            caload => self.gen_load_indexed(Kind::Char)?,
            saload => self.gen_load_indexed(Kind::Short)?,
            iastore => self.gen_store_indexed(Kind::Int)?,
            lastore => self.gen_store_indexed(Kind::Long)?,
            fastore => self.gen_store_indexed(Kind::Float)?,
            dastore => self.gen_store_indexed(Kind::Double)?,
            aastore => self.gen_store_indexed(Kind::Object)?,
            bastore => self.gen_store_indexed(Kind::Byte)?,
            castore => self.gen_store_indexed(Kind::Char)?,
            sastore => self.gen_store_indexed(Kind::Short)?,
            pop | pop2 | dup | dup_x1 | dup_x2 | dup2 | dup2_x1 | dup2_x2 | swap => {
                self.stack_op(op)?
            }
            iadd => self.gen_arith(ArithOp::Add, Kind::Int)?,
            ladd => self.gen_arith(ArithOp::Add, Kind::Long)?,
            fadd => self.gen_arith(ArithOp::Add, Kind::Float)?,
            dadd => self.gen_arith(ArithOp::Add, Kind::Double)?,
            isub => self.gen_arith(ArithOp::Sub, Kind::Int)?,
            lsub => self.gen_arith(ArithOp::Sub, Kind::Long)?,
            fsub => self.gen_arith(ArithOp::Sub, Kind::Float)?,
            dsub => self.gen_arith(ArithOp::Sub, Kind::Double)?,
            imul => self.gen_arith(ArithOp::Mul, Kind::Int)?,
            lmul => self.gen_arith(ArithOp::Mul, Kind::Long)?,
            fmul => self.gen_arith(ArithOp::Mul, Kind::Float)?,
            dmul => self.gen_arith(ArithOp::Mul, Kind::Double)?,
            idiv => self.gen_integer_div_rem(Kind::Int, false)?,
            ldiv => self.gen_integer_div_rem(Kind::Long, false)?,
            fdiv => self.gen_arith(ArithOp::Div, Kind::Float)?,
            ddiv => self.gen_arith(ArithOp::Div, Kind::Double)?,
            irem => self.gen_integer_div_rem(Kind::Int, true)?,
            lrem => self.gen_integer_div_rem(Kind::Long, true)?,
            frem => self.gen_arith(ArithOp::Rem, Kind::Float)?,
            drem => self.gen_arith(ArithOp::Rem, Kind::Double)?,
            ineg => self.gen_negate(Kind::Int)?,
            lneg => self.gen_negate(Kind::Long)?,
            fneg => self.gen_negate(Kind::Float)?,
            dneg => self.gen_negate(Kind::Double)?,
            ishl => self.gen_arith(ArithOp::Shl, Kind::Int)?,
            lshl => self.gen_arith(ArithOp::Shl, Kind::Long)?,
            ishr => self.gen_arith(ArithOp::Shr, Kind::Int)?,
            lshr => self.gen_arith(ArithOp::Shr, Kind::Long)?,
            iushr => self.gen_arith(ArithOp::UShr, Kind::Int)?,
            lushr => self.gen_arith(ArithOp::UShr, Kind::Long)?,
            iand => self.gen_arith(ArithOp::And, Kind::Int)?,
            land => self.gen_arith(ArithOp::And, Kind::Long)?,
            ior => self.gen_arith(ArithOp::Or, Kind::Int)?,
            lor => self.gen_arith(ArithOp::Or, Kind::Long)?,
            ixor => self.gen_arith(ArithOp::Xor, Kind::Int)?,
            lxor => self.gen_arith(ArithOp::Xor, Kind::Long)?,
            iinc => self.gen_increment(s.read_local_index(), s.read_increment())?,
            i2l => self.gen_convert(ConvertOp::I2L)?,
            i2f => self.gen_convert(ConvertOp::I2F)?,
            i2d => self.gen_convert(ConvertOp::I2D)?,
            l2i => self.gen_convert(ConvertOp::L2I)?,
            l2f => self.gen_convert(ConvertOp::L2F)?,
            l2d => self.gen_convert(ConvertOp::L2D)?,
            f2i => self.gen_convert(ConvertOp::F2I)?,
            f2l => self.gen_convert(ConvertOp::F2L)?,
            f2d => self.gen_convert(ConvertOp::F2D)?,
            d2i => self.gen_convert(ConvertOp::D2I)?,
            d2l => self.gen_convert(ConvertOp::D2L)?,
            d2f => self.gen_convert(ConvertOp::D2F)?,
            i2b => self.gen_convert(ConvertOp::I2B)?,
            i2c => self.gen_convert(ConvertOp::I2C)?,
            i2s => self.gen_convert(ConvertOp::I2S)?,
            lcmp => self.gen_normalize_compare(Kind::Long, false)?,
            fcmpl => self.gen_normalize_compare(Kind::Float, true)?,
            fcmpg => self.gen_normalize_compare(Kind::Float, false)?,
            dcmpl => self.gen_normalize_compare(Kind::Double, true)?,
            dcmpg => self.gen_normalize_compare(Kind::Double, false)?,
            ifeq | ifne | iflt | ifge | ifgt | ifle => {
                let x = self.state.pop(Kind::Int)?;
                let y = self.constant(Constant::Int(0));
                self.gen_if(x, if_condition(op), y, s.read_branch_dest())?
            }
            if_icmpeq | if_icmpne | if_icmplt | if_icmpge | if_icmpgt | if_icmple => {
                let y = self.state.pop(Kind::Int)?;
                let x = self.state.pop(Kind::Int)?;
                self.gen_if(x, if_condition(op), y, s.read_branch_dest())?
            }
            if_acmpeq | if_acmpne => {
                let y = self.state.pop(Kind::Object)?;
                let x = self.state.pop(Kind::Object)?;
                let cond = if op == if_acmpeq {
                    Condition::Eq
                } else {
                    Condition::Ne
                };
                self.gen_if(x, cond, y, s.read_branch_dest())?
            }
            ifnull | ifnonnull => {
                let x = self.state.pop(Kind::Object)?;
                let y = self.constant(Constant::Null);
                let cond = if op == ifnull {
                    Condition::Eq
                } else {
                    Condition::Ne
                };
                self.gen_if(x, cond, y, s.read_branch_dest())?
            }
            goto => self.goto_bci(s.read_branch_dest())?,
            goto_w => self.goto_bci(s.read_far_branch_dest())?,
            jsr => self.gen_jsr(s.read_branch_dest())?,
            jsr_w => self.gen_jsr(s.read_far_branch_dest())?,
            ret => self.gen_ret(s.read_local_index())?,
            tableswitch => self.gen_switch(SwitchKind::Table, s.read_switch())?,
            lookupswitch => self.gen_switch(SwitchKind::Lookup, s.read_switch())?,
            ireturn => self.gen_return(Kind::Int)?,
            lreturn => self.gen_return(Kind::Long)?,
            freturn => self.gen_return(Kind::Float)?,
            dreturn => self.gen_return(Kind::Double)?,
            areturn => self.gen_return(Kind::Object)?,
            r#return => self.gen_return(Kind::Void)?,
            getstatic => self.gen_get_field(s.read_cpi(), true)?,
            putstatic => self.gen_put_field(s.read_cpi(), true)?,
            getfield => self.gen_get_field(s.read_cpi(), false)?,
            putfield => self.gen_put_field(s.read_cpi(), false)?,
            invokevirtual => self.gen_invoke(InvokeKind::Virtual, s.read_cpi())?,
            invokespecial => self.gen_invoke(InvokeKind::Special, s.read_cpi())?,
            invokestatic => self.gen_invoke(InvokeKind::Static, s.read_cpi())?,
            invokeinterface => self.gen_invoke(InvokeKind::Interface, s.read_cpi())?,
            new => self.gen_new_instance(s.read_cpi())?,
            newarray => self.gen_new_primitive_array(s.read_u8(1))?,
            anewarray => self.gen_new_object_array(s.read_cpi())?,
            multianewarray => self.gen_new_multi_array(s.read_cpi(), s.read_u8(3))?,
            arraylength => self.gen_array_length()?,
            athrow => self.gen_throw()?,
            checkcast => self.gen_checkcast(s.read_cpi())?,
            instanceof => self.gen_instanceof(s.read_cpi())?,
            monitorenter => {
                let obj = self.state.pop(Kind::Object)?;
                self.emit_null_check(obj)?;
                self.gen_monitor_enter(obj, self.next_bci)?;
            }
            monitorexit => {
                let obj = self.state.pop(Kind::Object)?;
                self.emit_null_check(obj)?;
                self.gen_monitor_exit(obj, Bci::At(self.next_bci))?;
            }
            invokedynamic => {
                return Err(CompilationError::Bailout(
                    "invokedynamic is not supported".into(),
                ))
            }
            _ => return Err(self.internal(format!("unexpected opcode {op}"))),
        }
        Ok(())
    }

    fn push_int(&mut self, x: i32) {
        let c = self.constant(Constant::Int(x));
        self.state.push(Kind::Int, c);
    }

    fn load_local(&mut self, kind: Kind, i: usize) -> Result<(), CompilationError> {
        let v = self.state.load_local(i, kind)?;
        self.state.push(kind, v);
        Ok(())
    }

    fn store_local(&mut self, kind: Kind, i: usize) -> Result<(), CompilationError> {
        let v = self.state.pop(kind)?;
        self.state.store_local(&self.cx.g, i, kind, v)
    }

    fn stack_op(&mut self, op: Op) -> Result<(), CompilationError> {
        let st = &mut self.state;
        match op {
            Op::pop => {
                st.xpop()?;
            }
            Op::pop2 => {
                st.xpop()?;
                st.xpop()?;
            }
            Op::dup => {
                let w = st.peek(0)?;
                st.xpush(w);
            }
            Op::dup_x1 => {
                let (w1, w2) = (st.xpop()?, st.xpop()?);
                for w in [w1, w2, w1] {
                    st.xpush(w);
                }
            }
            Op::dup_x2 => {
                let (w1, w2, w3) = (st.xpop()?, st.xpop()?, st.xpop()?);
                for w in [w1, w3, w2, w1] {
                    st.xpush(w);
                }
            }
            Op::dup2 => {
                let (w1, w2) = (st.xpop()?, st.xpop()?);
                for w in [w2, w1, w2, w1] {
                    st.xpush(w);
                }
            }
            Op::dup2_x1 => {
                let (w1, w2, w3) = (st.xpop()?, st.xpop()?, st.xpop()?);
                for w in [w2, w1, w3, w2, w1] {
                    st.xpush(w);
                }
            }
            Op::dup2_x2 => {
                let (w1, w2, w3, w4) = (st.xpop()?, st.xpop()?, st.xpop()?, st.xpop()?);
                for w in [w2, w1, w4, w3, w2, w1] {
                    st.xpush(w);
                }
            }
            Op::swap => {
                let (w1, w2) = (st.xpop()?, st.xpop()?);
                st.xpush(w1);
                st.xpush(w2);
            }
            _ => return Err(self.internal(format!("{op} is not a stack operation"))),
        }
        Ok(())
    }

    fn gen_arith(&mut self, op: ArithOp, kind: Kind) -> Result<(), CompilationError> {
        let y = self
            .state
            .pop(if op.is_shift() { Kind::Int } else { kind })?;
        let x = self.state.pop(kind)?;
        let n = self.unique(Node::Arith(Arith { op, x, y, kind }));
        self.state.push(kind, n);
        Ok(())
    }

    fn gen_negate(&mut self, kind: Kind) -> Result<(), CompilationError> {
        let x = self.state.pop(kind)?;
        let n = self.unique(Node::Negate(Negate { x, kind }));
        self.state.push(kind, n);
        Ok(())
    }

    fn gen_increment(&mut self, i: usize, delta: i32) -> Result<(), CompilationError> {
        let x = self.state.load_local(i, Kind::Int)?;
        let y = self.constant(Constant::Int(delta));
        let n = self.unique(Node::Arith(Arith {
            op: ArithOp::Add,
            x,
            y,
            kind: Kind::Int,
        }));
        self.state.store_local(&self.cx.g, i, Kind::Int, n)
    }

    fn gen_convert(&mut self, op: ConvertOp) -> Result<(), CompilationError> {
        let x = self.state.pop(op.from_kind())?;
        let n = self.unique(Node::Convert(Convert { op, x }));
        self.state.push(op.to_kind(), n);
        Ok(())
    }

    fn gen_normalize_compare(
        &mut self,
        kind: Kind,
        unordered_less: bool,
    ) -> Result<(), CompilationError> {
        let y = self.state.pop(kind)?;
        let x = self.state.pop(kind)?;
        let n = self.unique(Node::NormalizeCompare(NormalizeCompare {
            x,
            y,
            kind,
            unordered_less,
        }));
        self.state.push(Kind::Int, n);
        Ok(())
    }

    fn gen_integer_div_rem(&mut self, kind: Kind, is_rem: bool) -> Result<(), CompilationError> {
        let y = self.state.pop(kind)?;
        let x = self.state.pop(kind)?;
        if self.cx.config.explicit_exceptions {
            let zero = self.constant(if kind == Kind::Long {
                Constant::Long(0)
            } else {
                Constant::Int(0)
            });
            let cond = self.unique(Node::Compare(Compare {
                cond: Condition::Eq,
                x: y,
                y: zero,
                unordered_is_true: false,
            }));
            self.emit_bytecode_exception_check(
                cond,
                false,
                BytecodeExceptionKind::DivisionByZero,
                Vec::new(),
            )?;
        }
        let n = self.append(Node::IntegerDivRem(IntegerDivRem { is_rem, x, y, kind }))?;
        self.state.push(kind, n);
        Ok(())
    }

    fn gen_load_constant(&mut self, cpi: u16) -> Result<(), CompilationError> {
        match self.cx.meta.lookup_constant(&self.method.cpool, cpi)? {
            LoadableConstant::Value(c) => {
                let n = self.constant(c);
                self.state.push(c.kind(), n);
            }
            LoadableConstant::Type(JavaType::Resolved(t)) => {
                let n = self.constant(Constant::Object(t.mirror));
                self.state.push(Kind::Object, n);
            }
            LoadableConstant::Type(JavaType::Unresolved(_)) => self.handle_unresolved()?,
        }
        Ok(())
    }

    /// Deoptimise: the code that follows needs something the runtime has not resolved yet.
    fn handle_unresolved(&mut self) -> Result<(), CompilationError> {
        self.append(Node::Deoptimize(Deoptimize {
            action: DeoptAction::InvalidateRecompile,
            reason: DeoptReason::Unresolved,
        }))?;
        Ok(())
    }

    // Branches.

    fn gen_if(
        &mut self,
        x: NodeIdx,
        cond: Condition,
        y: NodeIdx,
        true_bci: u32,
    ) -> Result<(), CompilationError> {
        let true_block = self.block_at(true_bci)?;
        let false_block = self.block_at(self.next_bci)?;
        if true_block == false_block {
            return self.append_goto(true_block);
        }
        let (a, b, c) = if cond.canonical_mirror() {
            (y, x, cond.mirror())
        } else {
            (x, y, cond)
        };
        let canonical = match c {
            Condition::Eq | Condition::Ne => Condition::Eq,
            Condition::Lt | Condition::Ge | Condition::Le | Condition::Gt => Condition::Lt,
            Condition::Bt | Condition::Ae | Condition::Be | Condition::At => Condition::Bt,
        };
        let (t, f) = if c.canonical_negate() {
            (false_block, true_block)
        } else {
            (true_block, false_block)
        };
        let logic = self.logic_node(canonical, a, b);
        if let Some(v) = fold_logic(&self.cx.g, logic) {
            self.discard(logic);
            return self.append_goto(if v { t } else { f });
        }
        if self.try_gen_conditional(logic, t, f)? {
            return Ok(());
        }
        self.control_flow_split = true;
        let ts = self.create_block_target(t, self.state.clone())?;
        let fs = self.create_block_target(f, self.state.clone())?;
        let last = self.last()?;
        let iff = self.cx.g.add_node(Node::If(If {
            cond: logic,
            true_succ: ts,
            false_succ: fs,
            prob: Prob::new(0.5),
        }));
        self.cx.g.set_next(last, iff);
        self.last = None;
        Ok(())
    }

    fn logic_node(&mut self, cond: Condition, x: NodeIdx, y: NodeIdx) -> NodeIdx {
        if cond == Condition::Eq && self.cx.g.node(x).stamp() == Kind::Object {
            if self.constant_of(y) == Some(Constant::Null) {
                return self.unique(Node::IsNull(IsNull { x }));
            }
            if self.constant_of(x) == Some(Constant::Null) {
                return self.unique(Node::IsNull(IsNull { x: y }));
            }
        }
        self.unique(Node::Compare(Compare {
            cond,
            x,
            y,
            unordered_is_true: false,
        }))
    }

    /// If both successors of a branch on `logic` do nothing but push a small integer constant
    /// before jumping to the same block, replace the diamond by a [Conditional].
    fn try_gen_conditional(
        &mut self,
        logic: NodeIdx,
        t: BlockIdx,
        f: BlockIdx,
    ) -> Result<bool, CompilationError> {
        let (Some((tv, tj)), Some((fv, fj))) =
            (self.constant_then_jump(t), self.constant_then_jump(f))
        else {
            return Ok(false);
        };
        if tj != fj {
            return Ok(false);
        }
        let tc = self.constant(Constant::Int(tv));
        let fc = self.constant(Constant::Int(fv));
        let n = self.unique(Node::Conditional(Conditional {
            cond: logic,
            t: tc,
            f: fc,
            kind: Kind::Int,
        }));
        self.state.push(Kind::Int, n);
        self.append_goto(tj)?;
        Ok(true)
    }

    /// If block `b` consists of an `iconst` followed by a jump (or fall through), return the
    /// constant and the jump's target.
    fn constant_then_jump(&self, b: BlockIdx) -> Option<(i32, BlockIdx)> {
        let blk = &self.bm.blocks[b];
        if blk.kind != BlockKind::Bytecode
            || blk.predecessor_count != 1
            || blk.is_loop_header
            || blk.is_exception_entry
        {
            return None;
        }
        let mut s = BytecodeStream::new(&self.method.code);
        s.set_bci(blk.start_bci);
        let v = iconst_value(s.opcode().ok()?)?;
        let next = s.next().ok()?;
        if blk.end_bci == blk.start_bci {
            return self.bm.block_at(next).map(|j| (v, j));
        }
        if next != blk.end_bci {
            return None;
        }
        let dest = match s.opcode().ok()? {
            Op::goto => s.read_branch_dest(),
            Op::goto_w => s.read_far_branch_dest(),
            _ => return None,
        };
        self.bm.block_at(dest).map(|j| (v, j))
    }

    fn gen_switch(&mut self, kind: SwitchKind, table: SwitchTable) -> Result<(), CompilationError> {
        let value = self.state.pop(Kind::Int)?;
        let mut cases = table
            .keys
            .iter()
            .copied()
            .zip(table.targets.iter().copied())
            .collect::<Vec<_>>();
        cases.sort_by_key(|c| c.0);
        if let Some(w) = cases.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(CompilationError::Bailout(format!(
                "duplicate key {} in switch",
                w[0].0
            )));
        }
        if let Some(Constant::Int(v)) = self.constant_of(value) {
            let dest = cases
                .iter()
                .find(|c| c.0 == v)
                .map_or(table.default, |c| c.1);
            return self.goto_bci(dest);
        }
        let mut succ_bcis = Vec::new();
        let mut key_succ = Vec::with_capacity(cases.len() + 1);
        for bci in cases.iter().map(|c| c.1).chain(iter::once(table.default)) {
            let i = match succ_bcis.iter().position(|&x| x == bci) {
                Some(i) => i,
                None => {
                    succ_bcis.push(bci);
                    succ_bcis.len() - 1
                }
            };
            key_succ.push(i);
        }
        if succ_bcis.len() == 1 {
            return self.goto_bci(table.default);
        }
        self.control_flow_split = true;
        let mut succs = Vec::with_capacity(succ_bcis.len());
        for bci in succ_bcis {
            let b = self.block_at(bci)?;
            succs.push(self.create_block_target(b, self.state.clone())?);
        }
        let last = self.last()?;
        let sw = self.cx.g.add_node(Node::IntegerSwitch(IntegerSwitch {
            kind,
            value,
            keys: cases.iter().map(|c| c.0).collect(),
            key_succ,
            succs,
        }));
        self.cx.g.set_next(last, sw);
        self.last = None;
        Ok(())
    }

    fn gen_jsr(&mut self, dest: u32) -> Result<(), CompilationError> {
        let ra = self.constant(Constant::ReturnAddress(self.next_bci));
        self.state.push(Kind::ReturnAddress, ra);
        self.goto_bci(dest)
    }

    /// `ret` returns to the single call site of its subroutine: check that the return address
    /// is the one we expect.
    fn gen_ret(&mut self, i: usize) -> Result<(), CompilationError> {
        let cur = self.current.ok_or_else(|| self.internal("ret outside a block"))?;
        let succ = *self.bm.blocks[cur]
            .successors
            .first()
            .ok_or_else(|| self.internal("ret without a successor"))?;
        let ret_bci = self.bm.blocks[succ].start_bci;
        let local = self.state.load_local(i, Kind::ReturnAddress)?;
        let expected = self.constant(Constant::ReturnAddress(ret_bci));
        if local != expected {
            let cond = self.unique(Node::Compare(Compare {
                cond: Condition::Eq,
                x: local,
                y: expected,
                unordered_is_true: false,
            }));
            self.append(Node::FixedGuard(FixedGuard {
                cond,
                reason: DeoptReason::JavaSubroutineMismatch,
                action: DeoptAction::InvalidateReprofile,
                negated: false,
            }))?;
        }
        self.append_goto(succ)
    }

    // Returns and exceptions.

    fn gen_return(&mut self, kind: Kind) -> Result<(), CompilationError> {
        let value = match kind {
            Kind::Void => None,
            k => Some(self.state.pop(k)?),
        };
        if self.depth == 0 {
            self.state.rethrow_exception = false;
            self.state.clear_stack();
            self.before_return(value, kind)?;
            self.append(Node::Return(Return { value }))?;
        } else if self.bm.return_count == 1 || !self.control_flow_split {
            self.before_return(value, kind)?;
            self.return_value = value;
            self.before_return = Some(self.last()?);
            self.last = None;
        } else {
            self.state.clear_stack();
            if let Some(v) = value {
                self.state.push(kind, v);
            }
            self.append_goto(self.bm.ret)?;
        }
        Ok(())
    }

    fn before_return(&mut self, value: Option<NodeIdx>, kind: Kind) -> Result<(), CompilationError> {
        if self.method.is_synchronized {
            if let Some(v) = value {
                self.state.push(kind, v);
            }
            let obj = self
                .sync_object
                .ok_or_else(|| self.internal("synchronized method without a lock"))?;
            self.gen_monitor_exit(obj, Bci::After)?;
            if value.is_some() {
                self.state.pop(kind)?;
            }
        }
        if self.state.locks_size() != 0 {
            return Err(CompilationError::Bailout("unbalanced monitors".into()));
        }
        Ok(())
    }

    /// The synthetic block that the returns of an inlined method with several returns meet at.
    fn handle_return_block(&mut self) -> Result<(), CompilationError> {
        let kind = self.method.signature.ret.stack_kind();
        let value = match kind {
            Kind::Void => None,
            k => Some(self.state.pop(k)?),
        };
        self.before_return(value, kind)?;
        self.return_value = value;
        self.before_return = Some(self.last()?);
        self.last = None;
        Ok(())
    }

    fn handle_unwind_block(&mut self) -> Result<(), CompilationError> {
        if self.depth == 0 {
            self.state.rethrow_exception = false;
            if self.method.is_synchronized {
                let obj = self
                    .sync_object
                    .ok_or_else(|| self.internal("synchronized method without a lock"))?;
                self.gen_monitor_exit(obj, Bci::AfterException)?;
            }
        }
        if self.state.locks_size() != 0 {
            return Err(CompilationError::Bailout("unbalanced monitors".into()));
        }
        let exception = self.state.pop(Kind::Object)?;
        if self.depth == 0 {
            self.append(Node::Unwind(Unwind { exception }))?;
        } else {
            self.unwind = Some((exception, self.last()?));
            self.last = None;
        }
        Ok(())
    }

    /// Create the path taken when the instruction at `bci` throws `exception` (or, if `None`,
    /// an exception that arrives in an [ExceptionObject]). Returns the path's first node, which
    /// the caller must link into the graph.
    fn handle_exception(
        &mut self,
        exception: Option<NodeIdx>,
        bci: u32,
    ) -> Result<NodeIdx, CompilationError> {
        let cur = self
            .current
            .ok_or_else(|| self.internal("exception outside a block"))?;
        let blk = &self.bm.blocks[cur];
        let target = match blk.exception_dispatch {
            Some(d) if blk.end_bci == bci => d,
            _ => self.bm.unwind,
        };
        let mut st = self.state.clone();
        st.clear_stack();
        st.rethrow_exception = true;
        let g = &mut self.cx.g;
        let begin = match exception {
            Some(e) => {
                st.push(Kind::Object, e);
                g.add_node(Node::Begin(Begin))
            }
            None => {
                let e = g.add_node(Node::ExceptionObject(ExceptionObject));
                st.push(Kind::Object, e);
                let fs = st.create(g, Bci::At(bci));
                g.set_state_after(e, Some(fs));
                e
            }
        };
        self.control_flow_split = true;
        let t = self.create_target(target, st, false)?;
        self.cx.g.set_next(begin, t);
        Ok(begin)
    }

    /// Route the exception on top of the stack to the first matching handler.
    fn create_exception_dispatch(&mut self, blk: &BciBlock) -> Result<(), CompilationError> {
        let BlockKind::ExceptionDispatch { handler, .. } = blk.kind else {
            return Err(self.internal("not a dispatch block"));
        };
        let handler_block = *blk
            .successors
            .first()
            .ok_or_else(|| self.internal("dispatch block without a handler"))?;
        if handler.is_catch_all() {
            return self.append_goto(handler_block);
        }
        let ty = match self
            .cx
            .meta
            .lookup_type(&self.method.cpool, handler.catch_type_cpi)?
        {
            JavaType::Resolved(t) => t,
            JavaType::Unresolved(_) => return self.handle_unresolved(),
        };
        let exception = self
            .state
            .peek(0)?
            .ok_or_else(|| self.internal("no exception on the stack"))?;
        let next_block = blk.successors.get(1).copied().unwrap_or(self.bm.unwind);

        let g = &mut self.cx.g;
        let catch = g.add_node(Node::Begin(Begin));
        let cast = g.add_node(Node::CheckCast(CheckCast {
            object: exception,
            ty: TypeRef::new(&ty),
        }));
        g.set_next(catch, cast);
        let mut st = self.state.clone();
        st.pop(Kind::Object)?;
        st.push(Kind::Object, cast);
        self.control_flow_split = true;
        let handler_target = self.create_target(handler_block, st, false)?;
        self.cx.g.set_next(cast, handler_target);
        let no_catch = self.create_block_target(next_block, self.state.clone())?;
        let cond = self.unique(Node::InstanceOf(InstanceOf {
            x: exception,
            ty: TypeRef::new(&ty),
        }));
        let last = self.last()?;
        let iff = self.cx.g.add_node(Node::If(If {
            cond,
            true_succ: catch,
            false_succ: no_catch,
            prob: Prob::new(0.5),
        }));
        self.cx.g.set_next(last, iff);
        self.last = None;
        Ok(())
    }

    fn gen_throw(&mut self) -> Result<(), CompilationError> {
        let exception = self.state.pop(Kind::Object)?;
        if !self.is_non_null(exception) {
            let cond = self.unique(Node::IsNull(IsNull { x: exception }));
            self.append(Node::FixedGuard(FixedGuard {
                cond,
                reason: DeoptReason::NullCheck,
                action: DeoptAction::InvalidateReprofile,
                negated: true,
            }))?;
        }
        let last = self.last()?;
        let d = self.handle_exception(Some(exception), self.bci)?;
        self.cx.g.set_next(last, d);
        self.last = None;
        Ok(())
    }

    /// Branch to a [BytecodeException] of kind `kind` unless `cond` evaluates to `pass_when`.
    fn emit_bytecode_exception_check(
        &mut self,
        cond: NodeIdx,
        pass_when: bool,
        kind: BytecodeExceptionKind,
        args: Vec<NodeIdx>,
    ) -> Result<(), CompilationError> {
        if fold_logic(&self.cx.g, cond) == Some(pass_when) {
            self.discard(cond);
            return Ok(());
        }
        let last = self.last()?;
        let g = &mut self.cx.g;
        let pass = g.add_node(Node::Begin(Begin));
        let fail = g.add_node(Node::Begin(Begin));
        let (true_succ, false_succ, p) = if pass_when {
            (pass, fail, 1.0 - EXCEPTION_PROB)
        } else {
            (fail, pass, EXCEPTION_PROB)
        };
        let iff = g.add_node(Node::If(If {
            cond,
            true_succ,
            false_succ,
            prob: Prob::new(p),
        }));
        g.set_next(last, iff);
        self.control_flow_split = true;

        self.last = Some(fail);
        let exception = self.append(Node::BytecodeException(BytecodeException { kind, args }))?;
        let d = self.handle_exception(Some(exception), self.bci)?;
        self.cx.g.set_next(exception, d);
        self.last = Some(pass);
        Ok(())
    }

    fn emit_null_check(&mut self, obj: NodeIdx) -> Result<(), CompilationError> {
        if !self.cx.config.explicit_exceptions || self.is_non_null(obj) {
            return Ok(());
        }
        let cond = self.unique(Node::IsNull(IsNull { x: obj }));
        self.emit_bytecode_exception_check(cond, false, BytecodeExceptionKind::NullPointer, Vec::new())
    }

    fn emit_bounds_check(&mut self, array: NodeIdx, index: NodeIdx) -> Result<(), CompilationError> {
        if !self.cx.config.explicit_exceptions {
            return Ok(());
        }
        let length = self.array_length(array)?;
        let cond = self.unique(Node::Compare(Compare {
            cond: Condition::Bt,
            x: index,
            y: length,
            unordered_is_true: false,
        }));
        self.emit_bytecode_exception_check(
            cond,
            true,
            BytecodeExceptionKind::OutOfBounds,
            vec![index, length],
        )
    }

    // Memory.

    fn gen_load_indexed(&mut self, elem_kind: Kind) -> Result<(), CompilationError> {
        let index = self.state.pop(Kind::Int)?;
        let array = self.state.pop(Kind::Object)?;
        self.emit_null_check(array)?;
        self.emit_bounds_check(array, index)?;
        let n = self.append(Node::LoadIndexed(LoadIndexed {
            array,
            index,
            elem_kind,
        }))?;
        self.state.push(elem_kind.stack_kind(), n);
        Ok(())
    }

    fn gen_store_indexed(&mut self, elem_kind: Kind) -> Result<(), CompilationError> {
        let value = self.state.pop(elem_kind.stack_kind())?;
        let index = self.state.pop(Kind::Int)?;
        let array = self.state.pop(Kind::Object)?;
        self.emit_null_check(array)?;
        self.emit_bounds_check(array, index)?;
        self.append(Node::StoreIndexed(StoreIndexed {
            array,
            index,
            value,
            elem_kind,
        }))?;
        Ok(())
    }

    /// The length of `array`, folded if `array` is a constant.
    fn array_length(&mut self, array: NodeIdx) -> Result<NodeIdx, CompilationError> {
        if let Some(c) = self.constant_of(array) {
            if let Some(len) = self.cx.reflection.read_array_length(&c) {
                return Ok(self.constant(Constant::Int(len)));
            }
        }
        self.append(Node::ArrayLength(ArrayLength { array }))
    }

    fn gen_array_length(&mut self) -> Result<(), CompilationError> {
        let array = self.state.pop(Kind::Object)?;
        self.emit_null_check(array)?;
        let n = self.array_length(array)?;
        self.state.push(Kind::Int, n);
        Ok(())
    }

    /// Look up the field at `cpi`, returning `None` if it is unresolved or is not of the
    /// expected static-ness.
    fn lookup_field(
        &mut self,
        cpi: u16,
        is_static: bool,
    ) -> Result<(Kind, Option<Arc<ResolvedField>>), CompilationError> {
        let f = self.cx.meta.lookup_field(&self.method.cpool, cpi)?;
        let kind = f.kind().stack_kind();
        Ok(match f {
            JavaField::Resolved(f) if f.is_static == is_static => (kind, Some(f)),
            _ => (kind, None),
        })
    }

    fn static_base(&mut self, holder: &ResolvedType) -> NodeIdx {
        let base = self
            .cx
            .reflection
            .static_base(holder)
            .unwrap_or(Constant::Object(holder.mirror));
        self.constant(base)
    }

    fn gen_get_field(&mut self, cpi: u16, is_static: bool) -> Result<(), CompilationError> {
        let (kind, field) = self.lookup_field(cpi, is_static)?;
        let object = if is_static {
            None
        } else {
            Some(self.state.pop(Kind::Object)?)
        };
        let Some(field) = field else {
            return self.handle_unresolved();
        };
        let object = match object {
            Some(o) => {
                self.emit_null_check(o)?;
                o
            }
            None => {
                if field.is_final {
                    if let Some(c) = self.cx.reflection.read_static_final_field(&field) {
                        let n = self.constant(c);
                        self.state.push(kind, n);
                        return Ok(());
                    }
                }
                self.static_base(&field.holder)
            }
        };
        let n = self.append(Node::LoadField(LoadField {
            object,
            field: FieldRef::new(&field),
        }))?;
        self.state.push(kind, n);
        Ok(())
    }

    fn gen_put_field(&mut self, cpi: u16, is_static: bool) -> Result<(), CompilationError> {
        let (kind, field) = self.lookup_field(cpi, is_static)?;
        let value = self.state.pop(kind)?;
        let object = if is_static {
            None
        } else {
            Some(self.state.pop(Kind::Object)?)
        };
        let Some(field) = field else {
            return self.handle_unresolved();
        };
        let object = match object {
            Some(o) => {
                self.emit_null_check(o)?;
                o
            }
            None => self.static_base(&field.holder),
        };
        self.append(Node::StoreField(StoreField {
            object,
            field: FieldRef::new(&field),
            value,
        }))?;
        Ok(())
    }

    // Allocation and type checks.

    fn lookup_type(&self, cpi: u16) -> Result<Option<Arc<ResolvedType>>, CompilationError> {
        Ok(match self.cx.meta.lookup_type(&self.method.cpool, cpi)? {
            JavaType::Resolved(t) => Some(t),
            JavaType::Unresolved(_) => None,
        })
    }

    fn gen_new_instance(&mut self, cpi: u16) -> Result<(), CompilationError> {
        match self.lookup_type(cpi)? {
            Some(t) if !t.is_array() && !t.is_interface => {
                let n = self.append(Node::NewInstance(NewInstance {
                    ty: TypeRef::new(&t),
                }))?;
                self.state.push(Kind::Object, n);
                Ok(())
            }
            _ => self.handle_unresolved(),
        }
    }

    fn gen_new_primitive_array(&mut self, code: u8) -> Result<(), CompilationError> {
        let elem_kind = Kind::from_primitive_array_code(code).ok_or_else(|| {
            CompilationError::Bailout(format!("invalid newarray type code {code}"))
        })?;
        let length = self.state.pop(Kind::Int)?;
        let n = self.append(Node::NewArray(NewArray {
            elem_kind,
            elem_type: None,
            length,
        }))?;
        self.state.push(Kind::Object, n);
        Ok(())
    }

    fn gen_new_object_array(&mut self, cpi: u16) -> Result<(), CompilationError> {
        let length = self.state.pop(Kind::Int)?;
        let Some(t) = self.lookup_type(cpi)? else {
            return self.handle_unresolved();
        };
        let n = self.append(Node::NewArray(NewArray {
            elem_kind: Kind::Object,
            elem_type: Some(TypeRef::new(&t)),
            length,
        }))?;
        self.state.push(Kind::Object, n);
        Ok(())
    }

    fn gen_new_multi_array(&mut self, cpi: u16, rank: u8) -> Result<(), CompilationError> {
        let dims = self
            .state
            .pop_arguments(&vec![Kind::Int; usize::from(rank)])?;
        let Some(t) = self.lookup_type(cpi)? else {
            return self.handle_unresolved();
        };
        let n = self.append(Node::NewMultiArray(NewMultiArray {
            ty: TypeRef::new(&t),
            dims,
        }))?;
        self.state.push(Kind::Object, n);
        Ok(())
    }

    fn gen_checkcast(&mut self, cpi: u16) -> Result<(), CompilationError> {
        let object = self.state.pop(Kind::Object)?;
        let n = match self.lookup_type(cpi)? {
            Some(t) => self.append(Node::CheckCast(CheckCast {
                object,
                ty: TypeRef::new(&t),
            }))?,
            None => {
                // Only null passes a check against a type that has never been loaded.
                let cond = self.unique(Node::IsNull(IsNull { x: object }));
                self.append(Node::FixedGuard(FixedGuard {
                    cond,
                    reason: DeoptReason::Unresolved,
                    action: DeoptAction::InvalidateRecompile,
                    negated: false,
                }))?;
                self.constant(Constant::Null)
            }
        };
        self.state.push(Kind::Object, n);
        Ok(())
    }

    fn gen_instanceof(&mut self, cpi: u16) -> Result<(), CompilationError> {
        let object = self.state.pop(Kind::Object)?;
        let Some(t) = self.lookup_type(cpi)? else {
            let cond = self.unique(Node::IsNull(IsNull { x: object }));
            let last = self.last()?;
            let g = &mut self.cx.g;
            let null = g.add_node(Node::Begin(Begin));
            let non_null = g.add_node(Node::Begin(Begin));
            let deopt = g.add_node(Node::Deoptimize(Deoptimize {
                action: DeoptAction::InvalidateRecompile,
                reason: DeoptReason::Unresolved,
            }));
            g.set_next(non_null, deopt);
            let iff = g.add_node(Node::If(If {
                cond,
                true_succ: null,
                false_succ: non_null,
                prob: Prob::new(1.0),
            }));
            g.set_next(last, iff);
            self.last = Some(null);
            self.control_flow_split = true;
            self.push_int(0);
            return Ok(());
        };
        let cond = self.unique(Node::InstanceOf(InstanceOf {
            x: object,
            ty: TypeRef::new(&t),
        }));
        let (one, zero) = (
            self.constant(Constant::Int(1)),
            self.constant(Constant::Int(0)),
        );
        let n = self.unique(Node::Conditional(Conditional {
            cond,
            t: one,
            f: zero,
            kind: Kind::Int,
        }));
        self.state.push(Kind::Int, n);
        Ok(())
    }

    // Monitors.

    /// Lock `object`, giving the monitor enter a state at `bci`.
    fn gen_monitor_enter(&mut self, object: NodeIdx, bci: u32) -> Result<(), CompilationError> {
        let monitor_id = self.cx.g.add_node(Node::MonitorId(MonitorId {
            lock_depth: self.state.lock_depth(),
            eliminated: false,
        }));
        let n = self.append(Node::MonitorEnter(MonitorEnter { object, monitor_id }))?;
        self.state.push_lock(object, monitor_id);
        let fs = self.state.create(&mut self.cx.g, Bci::At(bci));
        self.cx.g.set_state_after(n, Some(fs));
        Ok(())
    }

    fn gen_monitor_exit(&mut self, object: NodeIdx, bci: Bci) -> Result<(), CompilationError> {
        let Some((locked, monitor_id)) = self.state.pop_lock() else {
            return Err(CompilationError::Bailout(
                "unbalanced monitors: too many exits".into(),
            ));
        };
        let g = &self.cx.g;
        let eliminated = matches!(g.node(monitor_id), Node::MonitorId(MonitorId { eliminated: true, .. }));
        if g.original_value(locked) != g.original_value(object) || eliminated {
            return Err(CompilationError::Bailout(format!(
                "unbalanced monitors: mismatch at monitorexit, %{} != %{}",
                usize::from(object),
                usize::from(locked)
            )));
        }
        let n = self.append(Node::MonitorExit(MonitorExit {
            object: locked,
            monitor_id,
        }))?;
        let fs = self.state.create(&mut self.cx.g, bci);
        self.cx.g.set_state_after(n, Some(fs));
        Ok(())
    }

    // Calls.

    fn gen_invoke(&mut self, invoke_kind: InvokeKind, cpi: u16) -> Result<(), CompilationError> {
        let m = self.cx.meta.lookup_method(&self.method.cpool, cpi)?;
        let sig = m.signature().clone();
        let mut kinds = Vec::with_capacity(sig.params.len() + 1);
        if invoke_kind.has_receiver() {
            kinds.push(Kind::Object);
        }
        kinds.extend(sig.params.iter().map(|k| k.stack_kind()));
        let args = self.state.pop_arguments(&kinds)?;
        let target = match m {
            JavaMethod::Resolved(t) if t.is_static == !invoke_kind.has_receiver() => t,
            _ => return self.handle_unresolved(),
        };
        if invoke_kind.has_receiver() {
            self.emit_null_check(args[0])?;
        }
        let return_kind = sig.ret.stack_kind();

        if let Some(op) = intrinsic(&target) {
            let n = self.unique(Node::Intrinsic(Intrinsic {
                op,
                x: args[0],
                kind: return_kind,
            }));
            self.state.push(return_kind, n);
            return Ok(());
        }
        if self.should_inline(&target, invoke_kind) {
            return self.inline(target, args, return_kind);
        }

        let (bci, next_bci) = (self.bci, self.next_bci);
        let arg_kinds = kinds.iter().copied().zip(args.iter().copied()).collect::<Vec<_>>();
        let state_during = self
            .state
            .create_during_call(&mut self.cx.g, bci, &arg_kinds);
        let ct = CallTarget {
            method: MethodRef::new(&target),
            args,
            invoke_kind,
            return_kind,
        };
        let inv = if self.needs_exception_edge() {
            let last = self.last()?;
            let exception_edge = self.handle_exception(None, bci)?;
            let g = &mut self.cx.g;
            let next = g.add_node(Node::Begin(Begin));
            let inv = g.add_node(Node::InvokeWithException(InvokeWithException {
                target: ct,
                bci,
                state_during: Some(state_during),
                next,
                exception_edge,
            }));
            g.set_next(last, inv);
            self.last = Some(next);
            inv
        } else {
            self.append(Node::Invoke(Invoke {
                target: ct,
                bci,
                state_during: Some(state_during),
            }))?
        };
        if return_kind != Kind::Void {
            self.state.push(return_kind, inv);
        }
        let fs = self.state.create(&mut self.cx.g, Bci::At(next_bci));
        self.cx.g.set_state_after(inv, Some(fs));
        Ok(())
    }

    /// Can an exception thrown by a call at the current bci be observed by this compilation
    /// unit? If not, the call needs no exception edge: the exception simply unwinds the frame.
    fn needs_exception_edge(&self) -> bool {
        !self.cx.config.omit_exception_edges
            && (self.depth > 0
                || self.method.is_synchronized
                || self.method.handlers.iter().any(|h| h.covers(self.bci)))
    }

    fn should_inline(&self, target: &Arc<ResolvedMethod>, invoke_kind: InvokeKind) -> bool {
        let config = self.cx.config;
        if self.depth >= config.max_inline_depth
            || !(invoke_kind.is_direct() || target.can_be_statically_bound)
            || target.is_synchronized
            || target.code.is_empty()
            || target.code.len() > config.max_inline_bytecode_size
            || Arc::ptr_eq(target, &self.method)
        {
            return false;
        }
        // Don't inline recursive calls.
        let mut outer = self.state.outer();
        while let Some(fs) = outer {
            let fs = self.cx.g.frame_state(fs);
            if Arc::ptr_eq(&fs.method, target) {
                return false;
            }
            outer = fs.outer;
        }
        true
    }

    /// Parse `target` into the graph in place of a call with arguments `args`.
    fn inline(
        &mut self,
        target: Arc<ResolvedMethod>,
        args: Vec<NodeIdx>,
        return_kind: Kind,
    ) -> Result<(), CompilationError> {
        let bci = self.bci;
        let outer = self.state.create_during_call(&mut self.cx.g, bci, &[]);
        let inlining_id = self.cx.next_inlining_id;
        self.cx.next_inlining_id += 1;
        let mut st = FrameStateBuilder::new(
            Arc::clone(&target),
            inlining_id,
            Some(outer),
            self.state.lock_depth(),
        );
        st.init_from_args(&args)?;
        let start = self.last()?;
        let (return_value, before_return, unwind, split) = {
            let mut callee = Parser::new(&mut *self.cx, target, self.depth + 1, st, None)?;
            callee.last = Some(start);
            callee.parse()?;
            (
                callee.return_value,
                callee.before_return,
                callee.unwind,
                callee.control_flow_split,
            )
        };
        self.control_flow_split |= split;
        self.last = None;
        if let Some((exception, before)) = unwind {
            let d = self.handle_exception(Some(exception), bci)?;
            self.cx.g.set_next(before, d);
        }
        if let Some(before) = before_return {
            self.last = Some(before);
            if let Some(v) = return_value {
                self.state.push(return_kind, v);
            }
        }
        Ok(())
    }
}

/// Decode the `xload_n` / `xstore_n` families into `(kind, local index, is store)`.
fn short_local_op(op: Op) -> Option<(Kind, usize, bool)> {
    let b = op as u8;
    let (base, store) = if (Op::iload_0 as u8..=Op::aload_3 as u8).contains(&b) {
        (Op::iload_0 as u8, false)
    } else if (Op::istore_0 as u8..=Op::astore_3 as u8).contains(&b) {
        (Op::istore_0 as u8, true)
    } else {
        return None;
    };
    let off = usize::from(b - base);
    Some((SHORT_LOCAL_KINDS[off / 4], off % 4, store))
}

fn iconst_value(op: Op) -> Option<i32> {
    let b = op as u8;
    (Op::iconst_m1 as u8..=Op::iconst_5 as u8)
        .contains(&b)
        .then(|| i32::from(b) - i32::from(Op::iconst_0 as u8))
}

/// The condition of `ifxx` and `if_icmpxx`.
fn if_condition(op: Op) -> Condition {
    match op {
        Op::ifeq | Op::if_icmpeq => Condition::Eq,
        Op::ifne | Op::if_icmpne => Condition::Ne,
        Op::iflt | Op::if_icmplt => Condition::Lt,
        Op::ifge | Op::if_icmpge => Condition::Ge,
        Op::ifgt | Op::if_icmpgt => Condition::Gt,
        _ => Condition::Le,
    }
}

fn intrinsic(m: &ResolvedMethod) -> Option<IntrinsicOp> {
    if !m.is_static {
        return None;
    }
    Some(
        match (
            m.holder.name.as_str(),
            m.name.as_str(),
            m.signature.descriptor.as_str(),
        ) {
            ("java/lang/Math", "sqrt", "(D)D") => IntrinsicOp::Sqrt,
            ("java/lang/Math", "abs", "(D)D") => IntrinsicOp::Abs,
            ("java/lang/Integer", "bitCount", "(I)I") | ("java/lang/Long", "bitCount", "(J)I") => {
                IntrinsicOp::BitCount
            }
            ("java/lang/Integer", "numberOfLeadingZeros", "(I)I")
            | ("java/lang/Long", "numberOfLeadingZeros", "(J)I") => IntrinsicOp::LeadingZeros,
            ("java/lang/Integer", "numberOfTrailingZeros", "(I)I")
            | ("java/lang/Long", "numberOfTrailingZeros", "(J)I") => IntrinsicOp::TrailingZeros,
            _ => return None,
        },
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bytecode::blockmap::test::method,
        config::ConfigBuilder,
        graph::nodes::{Phi, ValueProxy},
        meta::{test::test_type, ConstantPool, HeapSnapshot, PoolEntry, Registry},
    };
    use fm::FMBuilder;
    use lazy_static::lazy_static;
    use regex::Regex;

    lazy_static! {
        static ref PTN_RE: Regex = Regex::new(r"\{\{.+?\}\}").unwrap();
        static ref PTN_RE_IGNORE: Regex = Regex::new(r"\{\{_}\}").unwrap();
        static ref TEXT_RE: Regex = Regex::new(r"[a-zA-Z0-9\._]+").unwrap();
    }

    fn build_with(
        m: ResolvedMethod,
        config: &Config,
        reg: &Registry,
        entry_bci: Option<u32>,
    ) -> Result<Graph, CompilationError> {
        let g = build_graph(
            &Arc::new(m),
            entry_bci,
            config,
            reg,
            &HeapSnapshot::default(),
        )?;
        g.assert_well_formed();
        Ok(g)
    }

    fn build(sig: &str, src: &str) -> Graph {
        build_with(method(sig, src), &Config::default(), &Registry::new(), None).unwrap()
    }

    fn bailout(m: ResolvedMethod) -> String {
        match build_with(m, &Config::default(), &Registry::new(), None) {
            Err(CompilationError::Bailout(s)) => s,
            x => panic!("{x:?}"),
        }
    }

    fn count(g: &Graph, f: impl Fn(&Node) -> bool) -> usize {
        g.iter_live().filter(|i| f(g.node(*i))).count()
    }

    fn find(g: &Graph, f: impl Fn(&Node) -> bool) -> NodeIdx {
        g.iter_live().find(|i| f(g.node(*i))).unwrap()
    }

    fn with_pool(mut m: ResolvedMethod, entries: Vec<PoolEntry>) -> ResolvedMethod {
        m.cpool = Arc::new(ConstantPool::new(entries));
        m
    }

    fn static_method(holder: &str, name: &str, sig: &str, src: &str) -> Arc<ResolvedMethod> {
        let mut m = method(sig, src);
        m.holder = test_type(holder, 0x200);
        m.name = name.to_owned();
        Arc::new(m)
    }

    fn method_ref(holder: &str, name: &str, descriptor: &str) -> PoolEntry {
        PoolEntry::Method {
            holder: holder.to_owned(),
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
        }
    }

    #[test]
    fn straight_line() {
        let g = build("(I)I", "iload_0\niconst_1\niadd\nireturn");
        let ptn = "
            ; T.m(I)I
            %{{_}}: start -> %{{r}} [#0]
            %{{p}}: i = param 0
            %{{c}}: i = const 1i
            %{{a}}: i = add %{{p}}, %{{c}}
            %{{r}}: return %{{a}}
            ...
        ";
        let fmb = FMBuilder::new(ptn)
            .unwrap()
            .name_matcher_ignore(PTN_RE_IGNORE.clone(), TEXT_RE.clone())
            .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
            .build()
            .unwrap();
        if let Err(e) = fmb.matches(&g.to_string()) {
            eprintln!("{e}");
            panic!();
        }
    }

    #[test]
    fn diamond() {
        let g = build(
            "(III)I",
            "
              iload_0
              ifeq L1
              iload_1
              goto L2
            L1:
              iload_2
            L2:
              ireturn
            ",
        );
        assert_eq!(count(&g, |n| matches!(n, Node::If(_))), 1);
        let merge = find(&g, |n| matches!(n, Node::Merge(_)));
        let phi = find(&g, |n| matches!(n, Node::Phi(_)));
        let Node::Phi(p) = g.node(phi) else { panic!() };
        assert_eq!(p.merge, merge);
        assert_eq!(p.values.len(), 2);
        let ret = find(&g, |n| matches!(n, Node::Return(_)));
        assert_eq!(g.node(ret), &Node::Return(Return { value: Some(phi) }));
    }

    #[test]
    fn constant_diamond_becomes_conditional() {
        let g = build(
            "(I)I",
            "
              iload_0
              ifeq L1
              iconst_1
              goto L2
            L1:
              iconst_0
            L2:
              ireturn
            ",
        );
        assert_eq!(count(&g, |n| matches!(n, Node::If(_))), 0);
        assert_eq!(count(&g, |n| matches!(n, Node::Merge(_))), 0);
        let c = find(&g, |n| matches!(n, Node::Conditional(_)));
        let ret = find(&g, |n| matches!(n, Node::Return(_)));
        assert_eq!(g.node(ret), &Node::Return(Return { value: Some(c) }));
    }

    #[test]
    fn constant_branch_is_folded() {
        let g = build(
            "()I",
            "
              iconst_3
              ifeq L1
              iconst_1
              ireturn
            L1:
              iconst_2
              ireturn
            ",
        );
        assert_eq!(count(&g, |n| matches!(n, Node::If(_))), 0);
        assert_eq!(count(&g, |n| matches!(n, Node::Return(_))), 1);
        assert_eq!(count(&g, |n| matches!(n, Node::Compare(_))), 0);
    }

    #[test]
    fn loop_phis_and_proxies() {
        let g = build(
            "(I)I",
            "
              iconst_0
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
              ireturn
            ",
        );
        let lb = find(&g, |n| matches!(n, Node::LoopBegin(_)));
        let Node::LoopBegin(l) = g.node(lb) else { panic!() };
        assert_eq!(l.forward_ends.len(), 1);
        assert_eq!(l.loop_ends.len(), 1);
        assert_eq!(g.phis_of(lb).len(), 2);
        let exit = find(&g, |n| matches!(n, Node::LoopExit(_)));
        assert_eq!(g.node(exit), &Node::LoopExit(LoopExit { loop_begin: lb }));
        // The sum escapes the loop through a proxy.
        let ret = find(&g, |n| matches!(n, Node::Return(_)));
        let Node::Return(Return { value: Some(v) }) = g.node(ret) else { panic!() };
        assert!(matches!(g.node(*v), Node::ValueProxy(ValueProxy { exit: e, .. }) if *e == exit));
    }

    #[test]
    fn mismatched_stacks() {
        let m = method(
            "(I)I",
            "
              iload_0
              ifeq L1
              iconst_1
            L1:
              iconst_2
              ireturn
            ",
        );
        assert_eq!(bailout(m), "stacks do not match; bytecodes would not verify");
    }

    #[test]
    fn mismatched_stack_depths() {
        let m = method(
            "(I)I",
            "
              iconst_1
              iconst_2
              iload_0
              ifeq L1
              iconst_3
            L1:
              iadd
              ireturn
            ",
        );
        assert!(bailout(m).contains("stacks do not match"));
    }

    #[test]
    fn leaving_nested_loops_proxies_every_loop_phi() {
        let g = build(
            "(II)I",
            "
              iconst_0
              istore_2
            L0:
              iload_0
              ifle L3
            L1:
              iload_1
              ifle L2
              iinc 2 1
              iload_2
              bipush 100
              if_icmpgt L3
              iinc 1 -1
              goto L1
            L2:
              iinc 0 -1
              goto L0
            L3:
              iload_2
              ireturn
            ",
        );
        assert_eq!(count(&g, |n| matches!(n, Node::LoopBegin(_))), 2);
        // One exit from the inner loop into the outer, two when breaking out of both and one
        // from the outer loop.
        assert_eq!(count(&g, |n| matches!(n, Node::LoopExit(_))), 4);
        let is_loop_phi = |v: NodeIdx| {
            matches!(g.node(v), Node::Phi(Phi { merge, .. })
                if matches!(g.node(*merge), Node::LoopBegin(_)))
        };
        for i in g.iter_live() {
            if let Node::Phi(Phi { merge, values, .. }) = g.node(i) {
                if matches!(g.node(*merge), Node::Merge(_)) {
                    assert!(values.iter().all(|v| !is_loop_phi(*v)), "%{i:?}: {values:?}");
                }
            }
        }
        let ret = find(&g, |n| matches!(n, Node::Return(_)));
        let Node::Return(Return { value: Some(v) }) = g.node(ret) else { panic!() };
        assert!(!is_loop_phi(*v));
    }

    #[test]
    fn unbalanced_monitors() {
        let m = method(
            "(Ljava/lang/Object;Ljava/lang/Object;)V",
            "aload_0\nmonitorenter\naload_1\nmonitorexit\nreturn",
        );
        assert!(bailout(m).starts_with("unbalanced monitors: mismatch at monitorexit"));
        let m = method("(Ljava/lang/Object;)V", "aload_0\nmonitorenter\nreturn");
        assert_eq!(bailout(m), "unbalanced monitors");
        let m = method("(Ljava/lang/Object;)V", "aload_0\nmonitorexit\nreturn");
        assert_eq!(bailout(m), "unbalanced monitors: too many exits");
    }

    #[test]
    fn balanced_monitors() {
        let g = build(
            "(Ljava/lang/Object;)V",
            "aload_0\nmonitorenter\naload_0\nmonitorexit\nreturn",
        );
        let enter = find(&g, |n| matches!(n, Node::MonitorEnter(_)));
        let exit = find(&g, |n| matches!(n, Node::MonitorExit(_)));
        let (Node::MonitorEnter(e), Node::MonitorExit(x)) = (g.node(enter), g.node(exit)) else {
            panic!()
        };
        assert_eq!(e.monitor_id, x.monitor_id);
        assert_eq!(g.frame_state(g.state_after(enter).unwrap()).locks.len(), 1);
        assert!(g.frame_state(g.state_after(exit).unwrap()).locks.is_empty());
    }

    #[test]
    fn lock_held_across_loop() {
        let g = build(
            "(Ljava/lang/Object;I)V",
            "
              aload_0
              monitorenter
            L0:
              iload_1
              ifle L1
              iinc 1 -1
              goto L0
            L1:
              aload_0
              monitorexit
              return
            ",
        );
        let enter = find(&g, |n| matches!(n, Node::MonitorEnter(_)));
        let exit = find(&g, |n| matches!(n, Node::MonitorExit(_)));
        let (Node::MonitorEnter(e), Node::MonitorExit(x)) = (g.node(enter), g.node(exit)) else {
            panic!()
        };
        assert_eq!(g.original_value(x.object), e.object);
        assert_eq!(e.monitor_id, x.monitor_id);
        // Only the counter needs a loop phi.
        let lb = find(&g, |n| matches!(n, Node::LoopBegin(_)));
        assert_eq!(g.phis_of(lb).len(), 1);
    }

    #[test]
    fn synchronized_method_with_loop() {
        let mut m = method(
            "(I)I",
            "
              iconst_0
              istore_1
            L0:
              iload_0
              ifle L1
              iinc 1 2
              iinc 0 -1
              goto L0
            L1:
              iload_1
              ireturn
            ",
        );
        m.is_synchronized = true;
        let g = build_with(m, &Config::default(), &Registry::new(), None).unwrap();
        assert_eq!(count(&g, |n| matches!(n, Node::MonitorEnter(_))), 1);
        assert_eq!(count(&g, |n| matches!(n, Node::MonitorExit(_))), 1);
        assert_eq!(count(&g, |n| matches!(n, Node::LoopExit(_))), 1);
    }

    #[test]
    fn synchronized_method() {
        let mut m = method("()V", "return");
        m.is_synchronized = true;
        let g = build_with(m, &Config::default(), &Registry::new(), None).unwrap();
        assert_eq!(count(&g, |n| matches!(n, Node::MonitorEnter(_))), 1);
        let exit = find(&g, |n| matches!(n, Node::MonitorExit(_)));
        assert_eq!(g.frame_state(g.state_after(exit).unwrap()).bci, Bci::After);
        assert_eq!(
            g.frame_state(g.state_after(g.start()).unwrap()).bci,
            Bci::Before
        );
    }

    #[test]
    fn exception_handler() {
        let mut reg = Registry::new();
        reg.add_method(static_method("U", "f", "()V", "return"));
        reg.add_type(test_type("E", 0x300));
        let m = with_pool(
            method(
                "()I",
                "
                L0:
                  invokestatic 1
                L1:
                  iconst_0
                  ireturn
                L2:
                  pop
                  iconst_1
                  ireturn
                .catch L0 L1 L2 2
                ",
            ),
            vec![method_ref("U", "f", "()V"), PoolEntry::Class("E".to_owned())],
        );
        let g = build_with(m, &Config::default(), &reg, None).unwrap();
        let inv = find(&g, |n| matches!(n, Node::InvokeWithException(_)));
        let Node::InvokeWithException(i) = g.node(inv) else { panic!() };
        assert!(g.frame_state(i.state_during.unwrap()).during_call);
        let eo = g.state_after(i.exception_edge).unwrap();
        assert!(g.frame_state(eo).rethrow_exception);
        assert_eq!(count(&g, |n| matches!(n, Node::InstanceOf(_))), 1);
        assert_eq!(count(&g, |n| matches!(n, Node::CheckCast(_))), 1);
        assert_eq!(count(&g, |n| matches!(n, Node::Unwind(_))), 1);
        assert_eq!(count(&g, |n| matches!(n, Node::Return(_))), 2);
    }

    #[test]
    fn no_exception_edge_without_handler() {
        let mut reg = Registry::new();
        reg.add_method(static_method("U", "f", "()V", "return"));
        let m = with_pool(
            method("()V", "invokestatic 1\nreturn"),
            vec![method_ref("U", "f", "()V")],
        );
        let g = build_with(m, &Config::default(), &reg, None).unwrap();
        assert_eq!(count(&g, |n| matches!(n, Node::Invoke(_))), 1);
        assert_eq!(count(&g, |n| matches!(n, Node::InvokeWithException(_))), 0);
    }

    #[test]
    fn explicit_null_check() {
        let config = ConfigBuilder::new().explicit_exceptions(true).build();
        let m = method("([I)I", "aload_0\narraylength\nireturn");
        let g = build_with(m, &config, &Registry::new(), None).unwrap();
        let exc = find(&g, |n| matches!(n, Node::BytecodeException(_)));
        assert_eq!(
            g.node(exc),
            &Node::BytecodeException(BytecodeException {
                kind: BytecodeExceptionKind::NullPointer,
                args: Vec::new()
            })
        );
        assert_eq!(count(&g, |n| matches!(n, Node::Unwind(_))), 1);
        assert_eq!(count(&g, |n| matches!(n, Node::ArrayLength(_))), 1);
    }

    #[test]
    fn unresolved() {
        let m = with_pool(
            method("()V", "new 1\npop\nreturn"),
            vec![PoolEntry::Class("Missing".to_owned())],
        );
        let g = build_with(m, &Config::default(), &Registry::new(), None).unwrap();
        assert_eq!(
            g.node(find(&g, |n| matches!(n, Node::Deoptimize(_)))),
            &Node::Deoptimize(Deoptimize {
                action: DeoptAction::InvalidateRecompile,
                reason: DeoptReason::Unresolved
            })
        );
        assert_eq!(count(&g, |n| matches!(n, Node::Return(_))), 0);

        // Only null can pass a check against an unloaded type.
        let m = with_pool(
            method("(Ljava/lang/Object;)Ljava/lang/Object;", "aload_0\ncheckcast 1\nareturn"),
            vec![PoolEntry::Class("Missing".to_owned())],
        );
        let g = build_with(m, &Config::default(), &Registry::new(), None).unwrap();
        assert_eq!(count(&g, |n| matches!(n, Node::FixedGuard(_))), 1);
        let ret = find(&g, |n| matches!(n, Node::Return(_)));
        let Node::Return(Return { value: Some(v) }) = g.node(ret) else { panic!() };
        assert_eq!(g.node(*v), &Node::Const(Const { c: Constant::Null }));
    }

    #[test]
    fn inlining() {
        let mut reg = Registry::new();
        reg.add_method(static_method("U", "inc", "(I)I", "iload_0\niconst_1\niadd\nireturn"));
        let m = with_pool(
            method("(I)I", "iload_0\ninvokestatic 1\nireturn"),
            vec![method_ref("U", "inc", "(I)I")],
        );
        let config = ConfigBuilder::new().max_inline_depth(1).build();
        let g = build_with(m, &config, &reg, None).unwrap();
        assert_eq!(count(&g, |n| matches!(n, Node::Invoke(_))), 0);
        let ret = find(&g, |n| matches!(n, Node::Return(_)));
        let Node::Return(Return { value: Some(v) }) = g.node(ret) else { panic!() };
        let Node::Arith(a) = g.node(*v) else { panic!() };
        assert_eq!(g.node(a.x), &Node::Param(Param { index: 0, kind: Kind::Int }));

        // Without inlining the call stays.
        let m = with_pool(
            method("(I)I", "iload_0\ninvokestatic 1\nireturn"),
            vec![method_ref("U", "inc", "(I)I")],
        );
        let g = build_with(m, &Config::default(), &reg, None).unwrap();
        assert_eq!(count(&g, |n| matches!(n, Node::Invoke(_))), 1);
    }

    #[test]
    fn inlined_callee_with_several_returns() {
        let mut reg = Registry::new();
        reg.add_method(static_method(
            "U",
            "max",
            "(II)I",
            "
              iload_0
              iload_1
              if_icmplt L1
              iload_0
              ireturn
            L1:
              iload_1
              ireturn
            ",
        ));
        let m = with_pool(
            method("(II)I", "iload_0\niload_1\ninvokestatic 1\nireturn"),
            vec![method_ref("U", "max", "(II)I")],
        );
        let config = ConfigBuilder::new().max_inline_depth(1).build();
        let g = build_with(m, &config, &reg, None).unwrap();
        assert_eq!(count(&g, |n| matches!(n, Node::Invoke(_))), 0);
        let ret = find(&g, |n| matches!(n, Node::Return(_)));
        let Node::Return(Return { value: Some(v) }) = g.node(ret) else { panic!() };
        assert!(matches!(g.node(*v), Node::Phi(_)));
        // The merge's state belongs to the callee, inside the caller's call.
        let merge = find(&g, |n| matches!(n, Node::Merge(_)));
        let fs = g.frame_state(g.state_after(merge).unwrap());
        assert_eq!(fs.bci, Bci::After);
        let outer = g.frame_state(fs.outer.unwrap());
        assert!(outer.during_call);
        assert_eq!(outer.bci, Bci::At(2));
    }

    #[test]
    fn intrinsic() {
        let mut reg = Registry::new();
        reg.add_method(static_method(
            "java/lang/Integer",
            "bitCount",
            "(I)I",
            "iload_0\nireturn",
        ));
        let m = with_pool(
            method("(I)I", "iload_0\ninvokestatic 1\nireturn"),
            vec![method_ref("java/lang/Integer", "bitCount", "(I)I")],
        );
        let g = build_with(m, &Config::default(), &reg, None).unwrap();
        let n = find(&g, |n| matches!(n, Node::Intrinsic(_)));
        let Node::Intrinsic(i) = g.node(n) else { panic!() };
        assert_eq!(i.op, IntrinsicOp::BitCount);
        assert_eq!(count(&g, |n| matches!(n, Node::Invoke(_))), 0);
    }

    #[test]
    fn switch() {
        let g = build(
            "(I)I",
            "
              iload_0
              lookupswitch default:L3 5:L2 1:L1 7:L1
            L1:
              iload_0
              ireturn
            L2:
              iload_0
              iload_0
              iadd
              ireturn
            L3:
              iload_0
              ineg
              ireturn
            ",
        );
        let sw = find(&g, |n| matches!(n, Node::IntegerSwitch(_)));
        let Node::IntegerSwitch(s) = g.node(sw) else { panic!() };
        assert_eq!(s.kind, SwitchKind::Lookup);
        assert_eq!(s.keys, vec![1, 5, 7]);
        assert_eq!(s.succs.len(), 3);
        assert_eq!(s.key_succ[0], s.key_succ[2]);
        assert_ne!(s.key_succ[0], s.key_succ[1]);
    }

    #[test]
    fn osr() {
        let src = "
              iconst_0
              istore_1
            L0:
              iload_0
              ifle L1
              iinc 1 1
              iinc 0 -1
              goto L0
            L1:
              iload_1
              ireturn
            ";
        let g = build_with(method("(I)I", src), &Config::default(), &Registry::new(), Some(2))
            .unwrap();
        let m = find(&g, |n| matches!(n, Node::EntryMarker(_)));
        assert_eq!(g.frame_state(g.state_after(m).unwrap()).bci, Bci::At(2));
        match build_with(method("(I)I", src), &Config::default(), &Registry::new(), Some(3)) {
            Err(CompilationError::Bailout(s)) => assert!(s.contains("not at the start of a block")),
            x => panic!("{x:?}"),
        }
    }
}
