//! Graph clean-ups run after parsing.
//!
//! [post_parse_cleanup] always runs: it removes the scaffolding the builder leaves behind
//! (single-entry merges, loops that turned out to have no back edge, begin nodes that do not
//! follow a split, unused parameters). [simplify] is optional and performs redundant phi removal
//! and constant folding.

use super::{
    nodes::{
        Arith, ArithOp, Begin, Compare, Conditional, Const, Convert, ConvertOp, IntegerDivRem,
        Intrinsic, IntrinsicOp, IsNull, LoopBegin, LoopExit, Merge, Negate, Node, NodeClass, NodeT,
        NormalizeCompare, Phi, ValueProxy,
    },
    Graph, NodeIdx,
};
use crate::meta::Constant;
use num_traits::{CheckedDiv, CheckedRem, PrimInt, WrappingAdd, WrappingMul, WrappingNeg, WrappingSub};

pub fn post_parse_cleanup(g: &mut Graph) {
    let live = g.iter_live().collect::<Vec<_>>();

    // Loops without back edges.
    for &lb in &live {
        if matches!(g.node(lb), Node::LoopBegin(LoopBegin { loop_ends, .. }) if loop_ends.is_empty())
        {
            reduce_degenerate_loop_begin(g, lb);
        }
    }

    // Merges with a single predecessor.
    for &m in &live {
        let end = match g.node(m) {
            Node::Merge(Merge { ends }) if ends.len() == 1 => ends[0],
            _ => continue,
        };
        let Some(pred) = g.pred(end) else {
            continue;
        };
        for phi in g.phis_of(m) {
            let v = match g.node(phi) {
                Node::Phi(Phi { values, .. }) => values[0],
                _ => unreachable!(),
            };
            g.replace_at_usages(phi, v);
            g.safe_delete(phi);
        }
        g.clear_next(pred);
        if let Some(next) = g.clear_next(m) {
            g.set_next(pred, next);
        }
        if let Node::Merge(Merge { ends }) = g.node_mut(m) {
            ends.clear();
        }
        g.safe_delete(end);
        g.safe_delete(m);
    }

    // Begins that do not follow a split.
    for &b in &live {
        if !g.is_live(b) || !matches!(g.node(b), Node::Begin(_)) {
            continue;
        }
        match g.pred(b) {
            Some(p) if g.node(p).class() != NodeClass::Split => {
                g.unlink_fixed(b);
                g.safe_delete(b);
            }
            _ => (),
        }
    }

    for &p in &live {
        if g.is_live(p)
            && matches!(g.node(p), Node::Param(_))
            && g.usages(p).is_empty()
            && g.state_usages(p).is_empty()
        {
            g.safe_delete(p);
        }
    }
}

/// Turn the loop begin `lb`, which has no loop ends, into a plain merge. Its loop exits become
/// begins and their proxies are replaced by the values they forward.
pub fn reduce_degenerate_loop_begin(g: &mut Graph, lb: NodeIdx) {
    let ends = match g.node(lb) {
        Node::LoopBegin(LoopBegin {
            forward_ends,
            loop_ends,
        }) => {
            assert!(loop_ends.is_empty(), "%{lb:?}: loop has back edges");
            forward_ends.clone()
        }
        x => panic!("%{lb:?}: {x:?} is not a loop begin"),
    };
    g.replace_node(lb, Node::Merge(Merge { ends }));
    let live = g.iter_live().collect::<Vec<_>>();
    for &x in &live {
        if !matches!(g.node(x), Node::LoopExit(LoopExit { loop_begin }) if *loop_begin == lb) {
            continue;
        }
        g.replace_node(x, Node::Begin(Begin));
        for &p in &live {
            if !g.is_live(p) {
                continue;
            }
            let value = match g.node(p) {
                Node::ValueProxy(ValueProxy { value, exit, .. }) if *exit == x => *value,
                _ => continue,
            };
            g.replace_at_usages(p, value);
            g.safe_delete(p);
        }
    }
}

/// Remove redundant phis and fold constant expressions until nothing changes. Returns the
/// number of nodes removed.
pub fn simplify(g: &mut Graph) -> usize {
    let mut removed = 0;
    loop {
        let before = removed;
        removed += remove_redundant_phis(g);
        removed += fold_constants(g);
        if removed == before {
            return removed;
        }
    }
}

/// A phi whose inputs are all either the phi itself or one other value `v` is `v`.
fn remove_redundant_phis(g: &mut Graph) -> usize {
    let mut removed = 0;
    for phi in g.iter_live().collect::<Vec<_>>() {
        let Node::Phi(Phi { values, .. }) = g.node(phi) else {
            continue;
        };
        let mut single = None;
        let mut redundant = true;
        for &v in values {
            if v == phi || single == Some(v) {
                continue;
            }
            if single.is_some() {
                redundant = false;
                break;
            }
            single = Some(v);
        }
        let Some(v) = single.filter(|_| redundant) else {
            continue;
        };
        g.replace_at_usages(phi, v);
        if let Node::Phi(Phi { values, .. }) = g.node_mut(phi) {
            values.clear();
        }
        g.safe_delete(phi);
        removed += 1;
    }
    removed
}

enum Folded {
    Const(Constant),
    Value(NodeIdx),
}

fn fold_constants(g: &mut Graph) -> usize {
    let mut removed = 0;
    for x in g.iter_live().collect::<Vec<_>>() {
        if !g.is_live(x) {
            continue;
        }
        let c = |i: NodeIdx| match g.node(i) {
            Node::Const(Const { c }) => Some(*c),
            _ => None,
        };
        let folded = match g.node(x) {
            Node::Arith(Arith { op, x, y, .. }) => c(*x)
                .zip(c(*y))
                .and_then(|(a, b)| fold_arith(*op, a, b))
                .map(Folded::Const),
            Node::IntegerDivRem(IntegerDivRem { is_rem, x, y, .. }) => c(*x)
                .zip(c(*y))
                .and_then(|(a, b)| fold_div_rem(*is_rem, a, b))
                .map(Folded::Const),
            Node::Negate(Negate { x, .. }) => c(*x).and_then(fold_negate).map(Folded::Const),
            Node::Convert(Convert { op, x }) => c(*x)
                .and_then(|a| fold_convert(*op, a))
                .map(Folded::Const),
            Node::NormalizeCompare(NormalizeCompare {
                x,
                y,
                unordered_less,
                ..
            }) => c(*x)
                .zip(c(*y))
                .and_then(|(a, b)| fold_normalize_compare(a, b, *unordered_less))
                .map(Folded::Const),
            Node::Intrinsic(Intrinsic { op, x, .. }) => c(*x)
                .and_then(|a| fold_intrinsic(*op, a))
                .map(Folded::Const),
            Node::Conditional(Conditional { cond, t, f, .. }) => {
                if t == f {
                    Some(Folded::Value(*t))
                } else {
                    fold_logic(g, *cond).map(|b| Folded::Value(if b { *t } else { *f }))
                }
            }
            _ => None,
        };
        let r = match folded {
            None => continue,
            Some(Folded::Const(k)) => g.unique(Node::Const(Const { c: k })),
            Some(Folded::Value(v)) => v,
        };
        g.replace_at_usages(x, r);
        if g.node(x).class().is_fixed() {
            g.unlink_fixed(x);
            g.set_state_after(x, None);
        }
        g.safe_delete(x);
        removed += 1;
    }
    removed
}

/// Evaluate a logic node whose inputs are constants.
pub fn fold_logic(g: &Graph, cond: NodeIdx) -> Option<bool> {
    let c = |i: NodeIdx| match g.node(i) {
        Node::Const(Const { c }) => Some(*c),
        _ => None,
    };
    match g.node(cond) {
        Node::Compare(Compare { cond, x, y, .. }) => match (c(*x)?, c(*y)?) {
            (Constant::Int(a), Constant::Int(b)) => Some(cond.fold(i64::from(a), i64::from(b))),
            (Constant::Long(a), Constant::Long(b)) => Some(cond.fold(a, b)),
            (Constant::Null, Constant::Null) => Some(cond.fold(0, 0)),
            _ => None,
        },
        Node::IsNull(IsNull { x }) => match c(*x)? {
            Constant::Null => Some(true),
            Constant::Object(_) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn shift<T: PrimInt>(op: ArithOp, x: T, count: i64) -> Option<T> {
    let bits = T::zero().count_zeros();
    let n = (count & i64::from(bits - 1)) as usize;
    Some(match op {
        ArithOp::Shl => x << n,
        ArithOp::Shr => x >> n,
        ArithOp::UShr => x.unsigned_shr(n as u32),
        _ => return None,
    })
}

fn fold_int<T>(op: ArithOp, x: T, y: T) -> Option<T>
where
    T: PrimInt + WrappingAdd + WrappingSub + WrappingMul,
{
    Some(match op {
        ArithOp::Add => x.wrapping_add(&y),
        ArithOp::Sub => x.wrapping_sub(&y),
        ArithOp::Mul => x.wrapping_mul(&y),
        ArithOp::And => x & y,
        ArithOp::Or => x | y,
        ArithOp::Xor => x ^ y,
        ArithOp::Shl | ArithOp::Shr | ArithOp::UShr => return shift(op, x, y.to_i64()?),
        ArithOp::Div | ArithOp::Rem => return None,
    })
}

fn fold_float(op: ArithOp, x: f64, y: f64) -> Option<f64> {
    Some(match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::Rem => x % y,
        _ => return None,
    })
}

fn fold_arith(op: ArithOp, x: Constant, y: Constant) -> Option<Constant> {
    match (x, y) {
        (Constant::Int(a), Constant::Int(b)) => fold_int(op, a, b).map(Constant::Int),
        (Constant::Long(a), Constant::Int(b)) if op.is_shift() => {
            shift(op, a, i64::from(b)).map(Constant::Long)
        }
        (Constant::Long(a), Constant::Long(b)) => fold_int(op, a, b).map(Constant::Long),
        // Single precision results are exact when computed in double precision and rounded.
        (Constant::Float(a), Constant::Float(b)) => fold_float(
            op,
            f64::from(f32::from_bits(a)),
            f64::from(f32::from_bits(b)),
        )
        .map(|r| Constant::float(r as f32)),
        (Constant::Double(a), Constant::Double(b)) => {
            fold_float(op, f64::from_bits(a), f64::from_bits(b)).map(Constant::double)
        }
        _ => None,
    }
}

/// Integer division following the bytecode's rules: `MIN / -1 == MIN` and `MIN % -1 == 0`.
/// Division by zero is not folded as it must trap.
fn div_rem<T>(is_rem: bool, x: T, y: T) -> Option<T>
where
    T: PrimInt + CheckedDiv + CheckedRem + WrappingNeg,
{
    if y.is_zero() {
        return None;
    }
    if y == T::zero() - T::one() {
        return Some(if is_rem { T::zero() } else { x.wrapping_neg() });
    }
    if is_rem {
        x.checked_rem(&y)
    } else {
        x.checked_div(&y)
    }
}

fn fold_div_rem(is_rem: bool, x: Constant, y: Constant) -> Option<Constant> {
    match (x, y) {
        (Constant::Int(a), Constant::Int(b)) => div_rem(is_rem, a, b).map(Constant::Int),
        (Constant::Long(a), Constant::Long(b)) => div_rem(is_rem, a, b).map(Constant::Long),
        _ => None,
    }
}

fn fold_negate(x: Constant) -> Option<Constant> {
    match x {
        Constant::Int(a) => Some(Constant::Int(a.wrapping_neg())),
        Constant::Long(a) => Some(Constant::Long(a.wrapping_neg())),
        Constant::Float(a) => Some(Constant::float(-f32::from_bits(a))),
        Constant::Double(a) => Some(Constant::double(-f64::from_bits(a))),
        _ => None,
    }
}

fn fold_convert(op: ConvertOp, x: Constant) -> Option<Constant> {
    // `as` saturates float to integer conversions and maps NaN to 0, as the bytecode requires.
    Some(match (op, x) {
        (ConvertOp::I2L, Constant::Int(a)) => Constant::Long(i64::from(a)),
        (ConvertOp::I2F, Constant::Int(a)) => Constant::float(a as f32),
        (ConvertOp::I2D, Constant::Int(a)) => Constant::double(f64::from(a)),
        (ConvertOp::I2B, Constant::Int(a)) => Constant::Int(i32::from(a as i8)),
        (ConvertOp::I2C, Constant::Int(a)) => Constant::Int(i32::from(a as u16)),
        (ConvertOp::I2S, Constant::Int(a)) => Constant::Int(i32::from(a as i16)),
        (ConvertOp::L2I, Constant::Long(a)) => Constant::Int(a as i32),
        (ConvertOp::L2F, Constant::Long(a)) => Constant::float(a as f32),
        (ConvertOp::L2D, Constant::Long(a)) => Constant::double(a as f64),
        (ConvertOp::F2I, Constant::Float(a)) => Constant::Int(f32::from_bits(a) as i32),
        (ConvertOp::F2L, Constant::Float(a)) => Constant::Long(f32::from_bits(a) as i64),
        (ConvertOp::F2D, Constant::Float(a)) => Constant::double(f64::from(f32::from_bits(a))),
        (ConvertOp::D2I, Constant::Double(a)) => Constant::Int(f64::from_bits(a) as i32),
        (ConvertOp::D2L, Constant::Double(a)) => Constant::Long(f64::from_bits(a) as i64),
        (ConvertOp::D2F, Constant::Double(a)) => Constant::float(f64::from_bits(a) as f32),
        _ => return None,
    })
}

fn fold_normalize_compare(x: Constant, y: Constant, unordered_less: bool) -> Option<Constant> {
    let ord = match (x, y) {
        (Constant::Int(a), Constant::Int(b)) => a.partial_cmp(&b),
        (Constant::Long(a), Constant::Long(b)) => a.partial_cmp(&b),
        (Constant::Float(a), Constant::Float(b)) => {
            f32::from_bits(a).partial_cmp(&f32::from_bits(b))
        }
        (Constant::Double(a), Constant::Double(b)) => {
            f64::from_bits(a).partial_cmp(&f64::from_bits(b))
        }
        _ => return None,
    };
    Some(Constant::Int(match ord {
        Some(o) => o as i32,
        None if unordered_less => -1,
        None => 1,
    }))
}

fn fold_intrinsic(op: IntrinsicOp, x: Constant) -> Option<Constant> {
    Some(match (op, x) {
        (IntrinsicOp::Sqrt, Constant::Double(a)) => Constant::double(f64::from_bits(a).sqrt()),
        (IntrinsicOp::Abs, Constant::Double(a)) => Constant::double(f64::from_bits(a).abs()),
        (IntrinsicOp::BitCount, Constant::Int(a)) => Constant::Int(a.count_ones() as i32),
        (IntrinsicOp::BitCount, Constant::Long(a)) => Constant::Int(a.count_ones() as i32),
        (IntrinsicOp::LeadingZeros, Constant::Int(a)) => Constant::Int(a.leading_zeros() as i32),
        (IntrinsicOp::LeadingZeros, Constant::Long(a)) => Constant::Int(a.leading_zeros() as i32),
        (IntrinsicOp::TrailingZeros, Constant::Int(a)) => {
            Constant::Int(a.trailing_zeros() as i32)
        }
        (IntrinsicOp::TrailingZeros, Constant::Long(a)) => {
            Constant::Int(a.trailing_zeros() as i32)
        }
        _ => return None,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bytecode::blockmap::test::method,
        graph::nodes::{End, If, Param, Prob, Return},
        meta::Kind,
    };
    use std::sync::Arc;

    fn graph() -> Graph {
        Graph::new(Arc::new(method("(II)I", "iload_0\nireturn")))
    }

    fn konst(g: &mut Graph, c: Constant) -> NodeIdx {
        g.unique(Node::Const(Const { c }))
    }

    #[test]
    fn folds_arithmetic() {
        let mut g = graph();
        let (a, b) = (konst(&mut g, Constant::Int(2)), konst(&mut g, Constant::Int(3)));
        let add = g.unique(Node::Arith(Arith {
            op: ArithOp::Add,
            x: a,
            y: b,
            kind: Kind::Int,
        }));
        let n = konst(&mut g, Constant::Int(33));
        let shl = g.unique(Node::Arith(Arith {
            op: ArithOp::Shl,
            x: add,
            y: n,
            kind: Kind::Int,
        }));
        let r = g.add_node(Node::Return(Return { value: Some(shl) }));
        g.set_next(g.start(), r);
        assert_eq!(simplify(&mut g), 2);
        let Node::Return(Return { value: Some(v) }) = g.node(r) else {
            panic!()
        };
        assert_eq!(g.node(*v), &Node::Const(Const { c: Constant::Int(10) }));
        g.assert_well_formed();
    }

    #[test]
    fn folding_rules() {
        assert_eq!(
            fold_div_rem(false, Constant::Int(i32::MIN), Constant::Int(-1)),
            Some(Constant::Int(i32::MIN))
        );
        assert_eq!(
            fold_div_rem(true, Constant::Long(i64::MIN), Constant::Long(-1)),
            Some(Constant::Long(0))
        );
        assert_eq!(fold_div_rem(false, Constant::Int(1), Constant::Int(0)), None);
        assert_eq!(
            fold_arith(ArithOp::UShr, Constant::Int(-1), Constant::Int(28)),
            Some(Constant::Int(15))
        );
        assert_eq!(
            fold_arith(ArithOp::Shr, Constant::Long(-16), Constant::Int(66)),
            Some(Constant::Long(-4))
        );
        assert_eq!(
            fold_convert(ConvertOp::D2I, Constant::double(f64::NAN)),
            Some(Constant::Int(0))
        );
        assert_eq!(
            fold_convert(ConvertOp::F2L, Constant::float(1e30)),
            Some(Constant::Long(i64::MAX))
        );
        assert_eq!(
            fold_convert(ConvertOp::I2C, Constant::Int(-1)),
            Some(Constant::Int(0xffff))
        );
        assert_eq!(
            fold_normalize_compare(Constant::double(f64::NAN), Constant::double(1.0), true),
            Some(Constant::Int(-1))
        );
        assert_eq!(
            fold_normalize_compare(Constant::Long(3), Constant::Long(-3), false),
            Some(Constant::Int(1))
        );
    }

    /// Build `if (p0 == null) {} else {}` joining at a merge, returning (merge, end, end).
    fn diamond(g: &mut Graph) -> (NodeIdx, NodeIdx, NodeIdx) {
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
        let (te, fe) = (g.add_node(Node::End(End)), g.add_node(Node::End(End)));
        g.set_next(t, te);
        g.set_next(f, fe);
        let m = g.add_node(Node::Merge(Merge { ends: vec![te, fe] }));
        (m, te, fe)
    }

    #[test]
    fn redundant_phi() {
        let mut g = graph();
        let (m, _, _) = diamond(&mut g);
        let one = konst(&mut g, Constant::Int(1));
        let phi = g.add_node(Node::Phi(Phi {
            merge: m,
            values: vec![one, one],
            kind: Kind::Int,
        }));
        let r = g.add_node(Node::Return(Return { value: Some(phi) }));
        g.set_next(m, r);
        g.assert_well_formed();
        assert_eq!(simplify(&mut g), 1);
        assert!(!g.is_live(phi));
        assert_eq!(g.usages(one), vec![r]);
    }

    #[test]
    fn cleanup_single_end_merge() {
        let mut g = graph();
        let p1 = g.unique(Node::Param(Param {
            index: 1,
            kind: Kind::Int,
        }));
        let b = g.add_node(Node::Begin(Begin));
        g.set_next(g.start(), b);
        let e = g.add_node(Node::End(End));
        g.set_next(b, e);
        let m = g.add_node(Node::Merge(Merge { ends: vec![e] }));
        let phi = g.add_node(Node::Phi(Phi {
            merge: m,
            values: vec![p1],
            kind: Kind::Int,
        }));
        let r = g.add_node(Node::Return(Return { value: Some(phi) }));
        g.set_next(m, r);
        post_parse_cleanup(&mut g);
        g.assert_well_formed();
        // start -> return, with the phi replaced by its only input.
        assert_eq!(g.next(g.start()), Some(r));
        assert_eq!(g.node(r), &Node::Return(Return { value: Some(p1) }));
        for x in [b, e, m, phi] {
            assert!(!g.is_live(x));
        }
    }

    #[test]
    fn cleanup_degenerate_loop() {
        let mut g = graph();
        let e = g.add_node(Node::End(End));
        g.set_next(g.start(), e);
        let lb = g.add_node(Node::LoopBegin(LoopBegin {
            forward_ends: vec![e],
            loop_ends: Vec::new(),
        }));
        let r = g.add_node(Node::Return(Return { value: None }));
        g.set_next(lb, r);
        post_parse_cleanup(&mut g);
        g.assert_well_formed();
        assert_eq!(g.next(g.start()), Some(r));
        assert_eq!(g.node_count(), 2);
    }
}
