//! Local variable liveness over a [BlockMap].
//!
//! A standard backwards data flow analysis: each block has a `gen` set (locals read before being
//! written in the block) and a `kill` set (locals written in the block), from which
//! `live_in = gen | (live_out & !kill)` and `live_out = union(live_in of successors)` are iterated
//! to a fixed point. We also record which locals are written anywhere inside each loop, which tells
//! the graph builder which locals need loop phis.

use super::{
    blockmap::{BlockIdx, BlockKind, BlockMap},
    BytecodeStream, Op,
};
use crate::{compile::CompilationError, meta::ResolvedMethod};
use index_vec::IndexVec;
use vob::Vob;

#[derive(Debug)]
pub struct LocalLiveness {
    /// If false, every local is considered live everywhere and changed in every loop.
    enabled: bool,
    live_in: IndexVec<BlockIdx, Vob>,
    live_out: IndexVec<BlockIdx, Vob>,
    /// One set per loop id.
    changed_in_loop: Vec<Vob>,
}

impl LocalLiveness {
    pub fn compute(
        method: &ResolvedMethod,
        bm: &BlockMap,
        enabled: bool,
    ) -> Result<Self, CompilationError> {
        if !enabled {
            return Ok(LocalLiveness {
                enabled,
                live_in: IndexVec::new(),
                live_out: IndexVec::new(),
                changed_in_loop: Vec::new(),
            });
        }
        let nlocals = usize::from(method.max_locals);
        let empty = Vob::from_elem(false, nlocals);
        let mut gen: IndexVec<BlockIdx, Vob> = IndexVec::with_capacity(bm.len());
        let mut kill: IndexVec<BlockIdx, Vob> = IndexVec::with_capacity(bm.len());
        let mut changed_in_loop = vec![empty.clone(); bm.loop_count];

        let mut s = BytecodeStream::new(&method.code);
        for b in bm.blocks.iter() {
            let mut g = empty.clone();
            let mut k = empty.clone();
            if b.kind == BlockKind::Bytecode {
                s.set_bci(b.start_bci);
                loop {
                    Self::scan(&s, &mut g, &mut k, nlocals)?;
                    if s.current_bci() >= b.end_bci {
                        break;
                    }
                    s.next()?;
                }
            }
            for (loop_id, changed) in changed_in_loop.iter_mut().enumerate() {
                if b.loops & (1 << loop_id) != 0 {
                    changed.or(&k);
                }
            }
            gen.push(g);
            kill.push(k);
        }

        let mut live_in: IndexVec<BlockIdx, Vob> = index_vec::index_vec![empty.clone(); bm.len()];
        let mut live_out: IndexVec<BlockIdx, Vob> =
            index_vec::index_vec![empty.clone(); bm.len()];
        let mut changed = true;
        while changed {
            changed = false;
            for b in bm.blocks.iter().rev() {
                let mut out = empty.clone();
                for s in &b.successors {
                    out.or(&live_in[*s]);
                }
                let mut inn = out.clone();
                // inn = gen | (out & !kill)
                for i in kill[b.id].iter_set_bits(..) {
                    inn.set(i, false);
                }
                inn.or(&gen[b.id]);
                if inn != live_in[b.id] || out != live_out[b.id] {
                    live_in[b.id] = inn;
                    live_out[b.id] = out;
                    changed = true;
                }
            }
        }

        Ok(LocalLiveness {
            enabled,
            live_in,
            live_out,
            changed_in_loop,
        })
    }

    /// Update `gen` and `kill` with the effect of the instruction at `s`.
    fn scan(
        s: &BytecodeStream,
        gen: &mut Vob,
        kill: &mut Vob,
        nlocals: usize,
    ) -> Result<(), CompilationError> {
        let check = |i: usize| {
            if i < nlocals {
                Ok(i)
            } else {
                Err(CompilationError::Bailout(format!(
                    "local {i} out of range at bci {}",
                    s.current_bci()
                )))
            }
        };
        let load = |i: usize, gen: &mut Vob, kill: &Vob| -> Result<(), CompilationError> {
            let i = check(i)?;
            if !kill[i] {
                gen.set(i, true);
            }
            Ok(())
        };
        let op = s.inner_opcode()?;
        let (base, two) = match op {
            Op::iload | Op::fload | Op::aload | Op::ret => (Some(s.read_local_index()), false),
            Op::lload | Op::dload => (Some(s.read_local_index()), true),
            Op::iload_0 | Op::iload_1 | Op::iload_2 | Op::iload_3 => {
                (Some(op as usize - Op::iload_0 as usize), false)
            }
            Op::fload_0 | Op::fload_1 | Op::fload_2 | Op::fload_3 => {
                (Some(op as usize - Op::fload_0 as usize), false)
            }
            Op::aload_0 | Op::aload_1 | Op::aload_2 | Op::aload_3 => {
                (Some(op as usize - Op::aload_0 as usize), false)
            }
            Op::lload_0 | Op::lload_1 | Op::lload_2 | Op::lload_3 => {
                (Some(op as usize - Op::lload_0 as usize), true)
            }
            Op::dload_0 | Op::dload_1 | Op::dload_2 | Op::dload_3 => {
                (Some(op as usize - Op::dload_0 as usize), true)
            }
            Op::iinc => {
                let i = s.read_local_index();
                load(i, gen, kill)?;
                kill.set(i, true);
                return Ok(());
            }
            _ => (None, false),
        };
        if let Some(i) = base {
            load(i, gen, kill)?;
            if two {
                load(i + 1, gen, kill)?;
            }
            return Ok(());
        }

        let (base, two) = match op {
            Op::istore | Op::fstore | Op::astore => (Some(s.read_local_index()), false),
            Op::lstore | Op::dstore => (Some(s.read_local_index()), true),
            Op::istore_0 | Op::istore_1 | Op::istore_2 | Op::istore_3 => {
                (Some(op as usize - Op::istore_0 as usize), false)
            }
            Op::fstore_0 | Op::fstore_1 | Op::fstore_2 | Op::fstore_3 => {
                (Some(op as usize - Op::fstore_0 as usize), false)
            }
            Op::astore_0 | Op::astore_1 | Op::astore_2 | Op::astore_3 => {
                (Some(op as usize - Op::astore_0 as usize), false)
            }
            Op::lstore_0 | Op::lstore_1 | Op::lstore_2 | Op::lstore_3 => {
                (Some(op as usize - Op::lstore_0 as usize), true)
            }
            Op::dstore_0 | Op::dstore_1 | Op::dstore_2 | Op::dstore_3 => {
                (Some(op as usize - Op::dstore_0 as usize), true)
            }
            _ => (None, false),
        };
        if let Some(i) = base {
            kill.set(check(i)?, true);
            if two {
                kill.set(check(i + 1)?, true);
            }
        }
        Ok(())
    }

    pub fn local_is_live_in(&self, block: BlockIdx, local: usize) -> bool {
        !self.enabled || self.live_in[block].get(local).unwrap_or(false)
    }

    pub fn local_is_live_out(&self, block: BlockIdx, local: usize) -> bool {
        !self.enabled || self.live_out[block].get(local).unwrap_or(false)
    }

    pub fn local_is_changed_in_loop(&self, loop_id: usize, local: usize) -> bool {
        !self.enabled
            || self
                .changed_in_loop
                .get(loop_id)
                .and_then(|x| x.get(local))
                .unwrap_or(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bytecode::blockmap::test::method;

    #[test]
    fn live_across_branch() {
        let m = method(
            "(II)I",
            "
              iload_0
              ifeq L1
              iload_1
              ireturn
            L1:
              iconst_0
              istore_1
              iload_1
              ireturn
            ",
        );
        let bm = BlockMap::new(&m).unwrap();
        let l = LocalLiveness::compute(&m, &bm, true).unwrap();
        let b0 = bm.start();
        assert!(l.local_is_live_in(b0, 0));
        assert!(l.local_is_live_in(b0, 1));
        assert!(!l.local_is_live_out(b0, 0));
        assert!(l.local_is_live_out(b0, 1));
        let l1 = bm.block_at(6).unwrap();
        // Local 1 is overwritten before being read.
        assert!(!l.local_is_live_in(l1, 1));
    }

    #[test]
    fn changed_in_loop() {
        let m = method(
            "(JI)J",
            "
            L0:
              iload_2
              ifle L1
              lload_0
              lconst_1
              lsub
              lstore_0
              iload_2
              istore_3
              goto L0
            L1:
              lload_0
              lreturn
            ",
        );
        let bm = BlockMap::new(&m).unwrap();
        let l = LocalLiveness::compute(&m, &bm, true).unwrap();
        assert!(l.local_is_changed_in_loop(0, 0));
        assert!(l.local_is_changed_in_loop(0, 1));
        assert!(!l.local_is_changed_in_loop(0, 2));
        assert!(l.local_is_changed_in_loop(0, 3));
        // Local 3 is written in the loop but never read.
        assert!(!l.local_is_live_in(bm.start(), 3));

        let l = LocalLiveness::compute(&m, &bm, false).unwrap();
        assert!(l.local_is_live_in(bm.start(), 3));
        assert!(l.local_is_changed_in_loop(0, 2));
    }

    #[test]
    fn out_of_range_local() {
        let mut m = method("()V", "iload 9\npop\nreturn");
        m.max_locals = 2;
        let bm = BlockMap::new(&m).unwrap();
        assert!(matches!(
            LocalLiveness::compute(&m, &bm, true),
            Err(CompilationError::Bailout(_))
        ));
    }
}
