//! The node kinds of the program graph.
//!
//! Every node kind is a struct implementing [NodeT]; [Node] is the closed union of them all.
//! Nodes store their data inputs (other nodes whose values they consume) directly. Control edges
//! are split in two: the `next` edge of fixed nodes lives in the graph's arena entry, while the
//! successors of control splits are fields of the split node itself (see [NodeT::successors]).
//! Edges that are neither data nor control (a phi's merge, a loop end's loop begin, a merge's
//! ends) are "associations": they are not reported by [NodeT::inputs].

use super::{frame_state::FrameStateIdx, Graph, NodeIdx};
use crate::meta::{Constant, Kind, ResolvedField, ResolvedMethod, ResolvedType};
use enum_dispatch::enum_dispatch;
use smallvec::{smallvec, SmallVec};
use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
    ops::Deref,
    sync::Arc,
};
use strum::{Display, EnumCount, EnumDiscriminants};

/// A shared reference to runtime metadata. Two references are equal only if they point to the
/// same allocation.
#[derive(Debug)]
pub struct MetaRef<T>(pub Arc<T>);

pub type TypeRef = MetaRef<ResolvedType>;
pub type FieldRef = MetaRef<ResolvedField>;
pub type MethodRef = MetaRef<ResolvedMethod>;

impl<T> MetaRef<T> {
    pub fn new(x: &Arc<T>) -> Self {
        MetaRef(Arc::clone(x))
    }
}

impl<T> Clone for MetaRef<T> {
    fn clone(&self) -> Self {
        MetaRef(Arc::clone(&self.0))
    }
}

impl<T> PartialEq for MetaRef<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Eq for MetaRef<T> {}

impl<T> Hash for MetaRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state)
    }
}

impl<T> Deref for MetaRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

/// A branch probability. Stored as the bits of an `f32` so that nodes can be hashed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Prob(u32);

impl Prob {
    pub fn new(p: f64) -> Self {
        assert!((0.0..=1.0).contains(&p), "probability {p} out of range");
        Prob((p as f32).to_bits())
    }

    pub fn value(self) -> f64 {
        f64::from(f32::from_bits(self.0))
    }

    pub fn inverse(self) -> Self {
        Prob::new(1.0 - self.value())
    }
}

impl Display for Prob {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", f32::from_bits(self.0))
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    UShr,
}

impl ArithOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            ArithOp::Add | ArithOp::Mul | ArithOp::And | ArithOp::Or | ArithOp::Xor
        )
    }

    pub fn is_shift(self) -> bool {
        matches!(self, ArithOp::Shl | ArithOp::Shr | ArithOp::UShr)
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum ConvertOp {
    I2L,
    L2I,
    I2F,
    I2D,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
}

impl ConvertOp {
    pub fn from_kind(self) -> Kind {
        match self {
            ConvertOp::I2L
            | ConvertOp::I2F
            | ConvertOp::I2D
            | ConvertOp::I2B
            | ConvertOp::I2C
            | ConvertOp::I2S => Kind::Int,
            ConvertOp::L2I | ConvertOp::L2F | ConvertOp::L2D => Kind::Long,
            ConvertOp::F2I | ConvertOp::F2L | ConvertOp::F2D => Kind::Float,
            ConvertOp::D2I | ConvertOp::D2L | ConvertOp::D2F => Kind::Double,
        }
    }

    /// The stack kind of the result.
    pub fn to_kind(self) -> Kind {
        match self {
            ConvertOp::L2I
            | ConvertOp::F2I
            | ConvertOp::D2I
            | ConvertOp::I2B
            | ConvertOp::I2C
            | ConvertOp::I2S => Kind::Int,
            ConvertOp::I2L | ConvertOp::F2L | ConvertOp::D2L => Kind::Long,
            ConvertOp::I2F | ConvertOp::L2F | ConvertOp::D2F => Kind::Float,
            ConvertOp::I2D | ConvertOp::L2D | ConvertOp::F2D => Kind::Double,
        }
    }
}

/// A comparison condition. `Bt`, `Be`, `At` and `Ae` are the unsigned "below" / "above" forms.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Bt,
    Be,
    At,
    Ae,
}

impl Condition {
    /// The condition that is true exactly when `self` is false.
    pub fn negate(self) -> Self {
        match self {
            Condition::Eq => Condition::Ne,
            Condition::Ne => Condition::Eq,
            Condition::Lt => Condition::Ge,
            Condition::Ge => Condition::Lt,
            Condition::Le => Condition::Gt,
            Condition::Gt => Condition::Le,
            Condition::Bt => Condition::Ae,
            Condition::Ae => Condition::Bt,
            Condition::Be => Condition::At,
            Condition::At => Condition::Be,
        }
    }

    /// The condition that holds for `y cond' x` exactly when `x cond y` holds.
    pub fn mirror(self) -> Self {
        match self {
            Condition::Eq => Condition::Eq,
            Condition::Ne => Condition::Ne,
            Condition::Lt => Condition::Gt,
            Condition::Gt => Condition::Lt,
            Condition::Le => Condition::Ge,
            Condition::Ge => Condition::Le,
            Condition::Bt => Condition::At,
            Condition::At => Condition::Bt,
            Condition::Be => Condition::Ae,
            Condition::Ae => Condition::Be,
        }
    }

    /// Must the operands be swapped to express this condition with `Eq`, `Lt` or `Bt`?
    pub fn canonical_mirror(self) -> bool {
        matches!(
            self,
            Condition::Le | Condition::Gt | Condition::Be | Condition::At
        )
    }

    /// Must the result be negated to express this condition with `Eq`, `Lt` or `Bt`?
    pub fn canonical_negate(self) -> bool {
        matches!(
            self,
            Condition::Ne | Condition::Le | Condition::Ge | Condition::Be | Condition::Ae
        )
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            Condition::Bt | Condition::Be | Condition::At | Condition::Ae
        )
    }

    /// Evaluate the condition on two integers.
    pub fn fold(self, x: i64, y: i64) -> bool {
        let (ux, uy) = (x as u64, y as u64);
        match self {
            Condition::Eq => x == y,
            Condition::Ne => x != y,
            Condition::Lt => x < y,
            Condition::Le => x <= y,
            Condition::Gt => x > y,
            Condition::Ge => x >= y,
            Condition::Bt => ux < uy,
            Condition::Be => ux <= uy,
            Condition::At => ux > uy,
            Condition::Ae => ux >= uy,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum DeoptAction {
    None,
    InvalidateReprofile,
    InvalidateRecompile,
    RecompileIfTooManyDeopts,
}

#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum DeoptReason {
    NullCheck,
    BoundsCheck,
    ClassCast,
    ArithmeticException,
    Unresolved,
    UnreachedCode,
    RuntimeConstraint,
    JavaSubroutineMismatch,
    TransferToInterpreter,
}

#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum InvokeKind {
    Static,
    Special,
    Virtual,
    Interface,
}

impl InvokeKind {
    pub fn has_receiver(self) -> bool {
        self != InvokeKind::Static
    }

    pub fn is_direct(self) -> bool {
        matches!(self, InvokeKind::Static | InvokeKind::Special)
    }
}

/// The exceptions that compiled code raises itself rather than by calling a method.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum BytecodeExceptionKind {
    NullPointer,
    OutOfBounds,
    ClassCast,
    DivisionByZero,
    NegativeArraySize,
}

/// Operations with a dedicated machine instruction on most platforms.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum IntrinsicOp {
    Sqrt,
    Abs,
    BitCount,
    LeadingZeros,
    TrailingZeros,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CallTarget {
    pub method: MethodRef,
    /// Including the receiver, if any.
    pub args: Vec<NodeIdx>,
    pub invoke_kind: InvokeKind,
    /// The stack kind of the result, or [Kind::Void].
    pub return_kind: Kind,
}

impl Display for CallTarget {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} {}(", self.invoke_kind, self.method.qualified_name())?;
        write!(f, "{})", idxs(&self.args))
    }
}

/// How a node takes part in control flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeClass {
    /// A pure value with no position in the control flow.
    Floating,
    /// A floating boolean condition consumed by control splits, guards and conditionals.
    Logic,
    /// A fixed node that starts a basic block.
    Begin,
    /// Any other fixed node with a single `next` successor.
    Fixed,
    /// A fixed node with several successors, each a begin node.
    Split,
    /// A forward or backward edge into a merge: has no `next`.
    End,
    /// Terminates a control flow path.
    Sink,
}

impl NodeClass {
    pub fn is_fixed(self) -> bool {
        !matches!(self, NodeClass::Floating | NodeClass::Logic)
    }

    /// Does a node of this class have a `next` edge?
    pub fn has_next(self) -> bool {
        matches!(self, NodeClass::Begin | NodeClass::Fixed)
    }
}

pub(super) fn idx(x: NodeIdx) -> String {
    format!("%{}", usize::from(x))
}

pub(super) fn idxs(xs: &[NodeIdx]) -> String {
    xs.iter().map(|x| idx(*x)).collect::<Vec<_>>().join(", ")
}

/// The trait every node kind implements.
#[enum_dispatch]
pub trait NodeT: Debug {
    /// The stack kind of the value this node produces, or [Kind::Void] if it produces none.
    fn stamp(&self) -> Kind {
        Kind::Void
    }

    fn class(&self) -> NodeClass;

    /// This node's data inputs, in a fixed order.
    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        SmallVec::new()
    }

    /// Mutable references to this node's data inputs, in the same order as [NodeT::inputs].
    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        SmallVec::new()
    }

    /// The successors of a control split.
    fn successors(&self) -> SmallVec<[NodeIdx; 2]> {
        SmallVec::new()
    }

    fn successors_mut(&mut self) -> SmallVec<[&mut NodeIdx; 2]> {
        SmallVec::new()
    }

    /// Return a pretty printed version of `self` without its index or kind.
    fn to_string(&self) -> String;

    #[allow(unused)]
    fn assert_well_formed(&self, g: &Graph, idx: NodeIdx) {}
}

#[enum_dispatch(NodeT)]
#[derive(Clone, Debug, EnumCount, EnumDiscriminants, Eq, Hash, PartialEq)]
pub enum Node {
    // Floating values.
    Param,
    Const,
    Arith,
    Negate,
    Convert,
    NormalizeCompare,
    Conditional,
    Phi,
    ValueProxy,
    VirtualObject,
    MonitorId,
    Intrinsic,
    // Logic.
    Compare,
    IsNull,
    InstanceOf,
    // Begins.
    Start,
    Begin,
    Merge,
    LoopBegin,
    LoopExit,
    ExceptionObject,
    // Fixed.
    EntryMarker,
    LoadField,
    StoreField,
    LoadIndexed,
    StoreIndexed,
    ArrayLength,
    NewInstance,
    NewArray,
    NewMultiArray,
    CheckCast,
    MonitorEnter,
    MonitorExit,
    Invoke,
    IntegerDivRem,
    BytecodeException,
    FixedGuard,
    // Splits.
    If,
    IntegerSwitch,
    InvokeWithException,
    // Ends.
    End,
    LoopEnd,
    // Sinks.
    Return,
    Unwind,
    Deoptimize,
}

/// The `index`th incoming argument of the method, including the receiver.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Param {
    pub index: usize,
    pub kind: Kind,
}

impl NodeT for Param {
    fn stamp(&self) -> Kind {
        self.kind
    }

    fn class(&self) -> NodeClass {
        NodeClass::Floating
    }

    fn to_string(&self) -> String {
        format!("param {}", self.index)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Const {
    pub c: Constant,
}

impl NodeT for Const {
    fn stamp(&self) -> Kind {
        self.c.kind()
    }

    fn class(&self) -> NodeClass {
        NodeClass::Floating
    }

    fn to_string(&self) -> String {
        format!("const {}", self.c)
    }
}

/// A binary arithmetic, bitwise or shift operation. Integer division and remainder are
/// [IntegerDivRem] nodes: `Div` and `Rem` here are only used for floating point values.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Arith {
    pub op: ArithOp,
    pub x: NodeIdx,
    pub y: NodeIdx,
    pub kind: Kind,
}

impl NodeT for Arith {
    fn stamp(&self) -> Kind {
        self.kind
    }

    fn class(&self) -> NodeClass {
        NodeClass::Floating
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.x, self.y]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.x, &mut self.y]
    }

    fn to_string(&self) -> String {
        format!("{} {}, {}", self.op, idx(self.x), idx(self.y))
    }

    fn assert_well_formed(&self, g: &Graph, iidx: NodeIdx) {
        assert_eq!(
            g.node(self.x).stamp(),
            self.kind,
            "%{iidx:?}: inconsistent kinds for result and x"
        );
        let ykind = if self.op.is_shift() {
            Kind::Int
        } else {
            self.kind
        };
        assert_eq!(
            g.node(self.y).stamp(),
            ykind,
            "%{iidx:?}: inconsistent kind for y"
        );
        if matches!(self.op, ArithOp::Div | ArithOp::Rem) {
            assert!(
                self.kind.is_numeric_float(),
                "%{iidx:?}: integer division must be an IntegerDivRem"
            );
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Negate {
    pub x: NodeIdx,
    pub kind: Kind,
}

impl NodeT for Negate {
    fn stamp(&self) -> Kind {
        self.kind
    }

    fn class(&self) -> NodeClass {
        NodeClass::Floating
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.x]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.x]
    }

    fn to_string(&self) -> String {
        format!("neg {}", idx(self.x))
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Convert {
    pub op: ConvertOp,
    pub x: NodeIdx,
}

impl NodeT for Convert {
    fn stamp(&self) -> Kind {
        self.op.to_kind()
    }

    fn class(&self) -> NodeClass {
        NodeClass::Floating
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.x]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.x]
    }

    fn to_string(&self) -> String {
        format!("{} {}", self.op, idx(self.x))
    }

    fn assert_well_formed(&self, g: &Graph, iidx: NodeIdx) {
        assert_eq!(
            g.node(self.x).stamp(),
            self.op.from_kind(),
            "%{iidx:?}: input has the wrong kind for {}",
            self.op
        );
    }
}

/// `lcmp`, `fcmpl` and friends: -1, 0 or 1 depending on whether `x` is less than, equal to or
/// greater than `y`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NormalizeCompare {
    pub x: NodeIdx,
    pub y: NodeIdx,
    /// The kind of `x` and `y`.
    pub kind: Kind,
    /// For floating point comparisons: does an unordered comparison produce -1 (rather than 1)?
    pub unordered_less: bool,
}

impl NodeT for NormalizeCompare {
    fn stamp(&self) -> Kind {
        Kind::Int
    }

    fn class(&self) -> NodeClass {
        NodeClass::Floating
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.x, self.y]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.x, &mut self.y]
    }

    fn to_string(&self) -> String {
        format!(
            "normalize_cmp {}, {}{}",
            idx(self.x),
            idx(self.y),
            if self.unordered_less {
                " unordered_less"
            } else {
                ""
            }
        )
    }
}

/// `cond ? t : f`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Conditional {
    pub cond: NodeIdx,
    pub t: NodeIdx,
    pub f: NodeIdx,
    pub kind: Kind,
}

impl NodeT for Conditional {
    fn stamp(&self) -> Kind {
        self.kind
    }

    fn class(&self) -> NodeClass {
        NodeClass::Floating
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.cond, self.t, self.f]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.cond, &mut self.t, &mut self.f]
    }

    fn to_string(&self) -> String {
        format!("cond {} ? {} : {}", idx(self.cond), idx(self.t), idx(self.f))
    }

    fn assert_well_formed(&self, g: &Graph, iidx: NodeIdx) {
        assert_eq!(
            g.node(self.cond).class(),
            NodeClass::Logic,
            "%{iidx:?}: condition is not a logic node"
        );
    }
}

/// A value selected by the edge control flow took into `merge`. `values` is aligned with the
/// merge's forward ends followed, for loops, by its loop ends.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Phi {
    pub merge: NodeIdx,
    pub values: Vec<NodeIdx>,
    pub kind: Kind,
}

impl NodeT for Phi {
    fn stamp(&self) -> Kind {
        self.kind
    }

    fn class(&self) -> NodeClass {
        NodeClass::Floating
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        self.values.iter().copied().collect()
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        self.values.iter_mut().collect()
    }

    fn to_string(&self) -> String {
        format!("phi {} [{}]", idx(self.merge), idxs(&self.values))
    }

    fn assert_well_formed(&self, g: &Graph, iidx: NodeIdx) {
        let n = g.phi_predecessor_count(self.merge);
        assert_eq!(
            self.values.len(),
            n,
            "%{iidx:?}: phi has {} inputs but its merge has {n} predecessors",
            self.values.len()
        );
    }
}

/// A value flowing out of a loop through `exit`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ValueProxy {
    pub value: NodeIdx,
    pub exit: NodeIdx,
    pub kind: Kind,
}

impl NodeT for ValueProxy {
    fn stamp(&self) -> Kind {
        self.kind
    }

    fn class(&self) -> NodeClass {
        NodeClass::Floating
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.value]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.value]
    }

    fn to_string(&self) -> String {
        format!("proxy {}, {}", idx(self.value), idx(self.exit))
    }

    fn assert_well_formed(&self, g: &Graph, iidx: NodeIdx) {
        assert!(
            matches!(g.node(self.exit), Node::LoopExit(_)),
            "%{iidx:?}: proxy exit is not a loop exit"
        );
    }
}

/// An object whose allocation has been removed: its fields live in frame states'
/// [super::frame_state::VirtualObjectState]s.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct VirtualObject {
    pub ty: TypeRef,
    pub field_kinds: Vec<Kind>,
    /// Distinguishes virtual objects of the same type.
    pub id: usize,
}

impl NodeT for VirtualObject {
    fn stamp(&self) -> Kind {
        Kind::Object
    }

    fn class(&self) -> NodeClass {
        NodeClass::Floating
    }

    fn to_string(&self) -> String {
        format!("virtual {}#{}", self.ty.name, self.id)
    }
}

/// Identifies one lock acquisition.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct MonitorId {
    /// The number of locks held (including by callers of inlined methods) before this one.
    pub lock_depth: usize,
    pub eliminated: bool,
}

impl NodeT for MonitorId {
    fn class(&self) -> NodeClass {
        NodeClass::Floating
    }

    fn to_string(&self) -> String {
        format!(
            "monitor_id {}{}",
            self.lock_depth,
            if self.eliminated { " eliminated" } else { "" }
        )
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Intrinsic {
    pub op: IntrinsicOp,
    pub x: NodeIdx,
    pub kind: Kind,
}

impl NodeT for Intrinsic {
    fn stamp(&self) -> Kind {
        self.kind
    }

    fn class(&self) -> NodeClass {
        NodeClass::Floating
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.x]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.x]
    }

    fn to_string(&self) -> String {
        format!("{} {}", self.op, idx(self.x))
    }
}

/// `x cond y`. For floating point operands, `unordered_is_true` gives the result if either
/// operand is NaN.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Compare {
    pub cond: Condition,
    pub x: NodeIdx,
    pub y: NodeIdx,
    pub unordered_is_true: bool,
}

impl NodeT for Compare {
    fn class(&self) -> NodeClass {
        NodeClass::Logic
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.x, self.y]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.x, &mut self.y]
    }

    fn to_string(&self) -> String {
        format!(
            "cmp {} {}, {}{}",
            self.cond,
            idx(self.x),
            idx(self.y),
            if self.unordered_is_true {
                " unordered"
            } else {
                ""
            }
        )
    }

    fn assert_well_formed(&self, g: &Graph, iidx: NodeIdx) {
        let (xk, yk) = (g.node(self.x).stamp(), g.node(self.y).stamp());
        assert!(
            xk == yk || (xk == Kind::ReturnAddress && yk == Kind::Int),
            "%{iidx:?}: comparing {xk} with {yk}"
        );
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct IsNull {
    pub x: NodeIdx,
}

impl NodeT for IsNull {
    fn class(&self) -> NodeClass {
        NodeClass::Logic
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.x]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.x]
    }

    fn to_string(&self) -> String {
        format!("is_null {}", idx(self.x))
    }
}

/// Is `x` a non-null instance of `ty`?
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct InstanceOf {
    pub x: NodeIdx,
    pub ty: TypeRef,
}

impl NodeT for InstanceOf {
    fn class(&self) -> NodeClass {
        NodeClass::Logic
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.x]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.x]
    }

    fn to_string(&self) -> String {
        format!("instanceof {}, {}", idx(self.x), self.ty.name)
    }
}

/// The graph's single entry point.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Start;

impl NodeT for Start {
    fn class(&self) -> NodeClass {
        NodeClass::Begin
    }

    fn to_string(&self) -> String {
        "start".to_owned()
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Begin;

impl NodeT for Begin {
    fn class(&self) -> NodeClass {
        NodeClass::Begin
    }

    fn to_string(&self) -> String {
        "begin".to_owned()
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Merge {
    pub ends: Vec<NodeIdx>,
}

impl NodeT for Merge {
    fn class(&self) -> NodeClass {
        NodeClass::Begin
    }

    fn to_string(&self) -> String {
        format!("merge [{}]", idxs(&self.ends))
    }

    fn assert_well_formed(&self, g: &Graph, iidx: NodeIdx) {
        for e in &self.ends {
            assert!(
                matches!(g.node(*e), Node::End(_)),
                "%{iidx:?}: merge end {} is not an end",
                idx(*e)
            );
        }
    }
}

/// A loop header. `forward_ends` enter the loop; `loop_ends` are its back edges.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct LoopBegin {
    pub forward_ends: Vec<NodeIdx>,
    pub loop_ends: Vec<NodeIdx>,
}

impl NodeT for LoopBegin {
    fn class(&self) -> NodeClass {
        NodeClass::Begin
    }

    fn to_string(&self) -> String {
        format!(
            "loop_begin [{}] loop_ends [{}]",
            idxs(&self.forward_ends),
            idxs(&self.loop_ends)
        )
    }

    fn assert_well_formed(&self, g: &Graph, iidx: NodeIdx) {
        assert_eq!(
            self.forward_ends.len(),
            1,
            "%{iidx:?}: a loop must have exactly one forward end"
        );
        for e in &self.loop_ends {
            match g.node(*e) {
                Node::LoopEnd(LoopEnd { loop_begin }) => assert_eq!(
                    *loop_begin, iidx,
                    "%{iidx:?}: loop end {} belongs to another loop",
                    idx(*e)
                ),
                _ => panic!("%{iidx:?}: loop end {} is not a loop end", idx(*e)),
            }
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct LoopExit {
    pub loop_begin: NodeIdx,
}

impl NodeT for LoopExit {
    fn class(&self) -> NodeClass {
        NodeClass::Begin
    }

    fn to_string(&self) -> String {
        format!("loop_exit {}", idx(self.loop_begin))
    }
}

/// The start of an exception edge: produces the thrown exception.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ExceptionObject;

impl NodeT for ExceptionObject {
    fn stamp(&self) -> Kind {
        Kind::Object
    }

    fn class(&self) -> NodeClass {
        NodeClass::Begin
    }

    fn to_string(&self) -> String {
        "exception_object".to_owned()
    }
}

/// Where an on-stack-replacement entry transfers control into the method.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct EntryMarker;

impl NodeT for EntryMarker {
    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn to_string(&self) -> String {
        "entry_marker".to_owned()
    }
}

/// Load `field` from `object`. Static fields are loaded relative to the holder's static base.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct LoadField {
    pub object: NodeIdx,
    pub field: FieldRef,
}

impl NodeT for LoadField {
    fn stamp(&self) -> Kind {
        self.field.kind.stack_kind()
    }

    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.object]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.object]
    }

    fn to_string(&self) -> String {
        format!(
            "load_field {}, {}.{}",
            idx(self.object),
            self.field.holder.name,
            self.field.name
        )
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct StoreField {
    pub object: NodeIdx,
    pub field: FieldRef,
    pub value: NodeIdx,
}

impl NodeT for StoreField {
    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.object, self.value]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.object, &mut self.value]
    }

    fn to_string(&self) -> String {
        format!(
            "store_field {}, {}.{}, {}",
            idx(self.object),
            self.field.holder.name,
            self.field.name,
            idx(self.value)
        )
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct LoadIndexed {
    pub array: NodeIdx,
    pub index: NodeIdx,
    pub elem_kind: Kind,
}

impl NodeT for LoadIndexed {
    fn stamp(&self) -> Kind {
        self.elem_kind.stack_kind()
    }

    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.array, self.index]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.array, &mut self.index]
    }

    fn to_string(&self) -> String {
        format!(
            "load_indexed {} {}, {}",
            self.elem_kind,
            idx(self.array),
            idx(self.index)
        )
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct StoreIndexed {
    pub array: NodeIdx,
    pub index: NodeIdx,
    pub value: NodeIdx,
    pub elem_kind: Kind,
}

impl NodeT for StoreIndexed {
    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.array, self.index, self.value]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.array, &mut self.index, &mut self.value]
    }

    fn to_string(&self) -> String {
        format!(
            "store_indexed {} {}, {}, {}",
            self.elem_kind,
            idx(self.array),
            idx(self.index),
            idx(self.value)
        )
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ArrayLength {
    pub array: NodeIdx,
}

impl NodeT for ArrayLength {
    fn stamp(&self) -> Kind {
        Kind::Int
    }

    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.array]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.array]
    }

    fn to_string(&self) -> String {
        format!("array_length {}", idx(self.array))
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NewInstance {
    pub ty: TypeRef,
}

impl NodeT for NewInstance {
    fn stamp(&self) -> Kind {
        Kind::Object
    }

    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn to_string(&self) -> String {
        format!("new {}", self.ty.name)
    }
}

/// A one dimensional array: of primitives if `elem_type` is `None`, otherwise of `elem_type`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NewArray {
    pub elem_kind: Kind,
    pub elem_type: Option<TypeRef>,
    pub length: NodeIdx,
}

impl NodeT for NewArray {
    fn stamp(&self) -> Kind {
        Kind::Object
    }

    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.length]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.length]
    }

    fn to_string(&self) -> String {
        match &self.elem_type {
            Some(t) => format!("new_array {} {}", t.name, idx(self.length)),
            None => format!("new_array {} {}", self.elem_kind, idx(self.length)),
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NewMultiArray {
    pub ty: TypeRef,
    pub dims: Vec<NodeIdx>,
}

impl NodeT for NewMultiArray {
    fn stamp(&self) -> Kind {
        Kind::Object
    }

    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        self.dims.iter().copied().collect()
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        self.dims.iter_mut().collect()
    }

    fn to_string(&self) -> String {
        format!("new_multi_array {} [{}]", self.ty.name, idxs(&self.dims))
    }
}

/// Produces `object` if it is null or an instance of `ty`, otherwise traps.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CheckCast {
    pub object: NodeIdx,
    pub ty: TypeRef,
}

impl NodeT for CheckCast {
    fn stamp(&self) -> Kind {
        Kind::Object
    }

    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.object]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.object]
    }

    fn to_string(&self) -> String {
        format!("checkcast {}, {}", idx(self.object), self.ty.name)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct MonitorEnter {
    pub object: NodeIdx,
    pub monitor_id: NodeIdx,
}

impl NodeT for MonitorEnter {
    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.object, self.monitor_id]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.object, &mut self.monitor_id]
    }

    fn to_string(&self) -> String {
        format!("monitor_enter {}, {}", idx(self.object), idx(self.monitor_id))
    }

    fn assert_well_formed(&self, g: &Graph, iidx: NodeIdx) {
        assert!(
            matches!(g.node(self.monitor_id), Node::MonitorId(_)),
            "%{iidx:?}: monitor id is not a MonitorId"
        );
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct MonitorExit {
    pub object: NodeIdx,
    pub monitor_id: NodeIdx,
}

impl NodeT for MonitorExit {
    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.object, self.monitor_id]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.object, &mut self.monitor_id]
    }

    fn to_string(&self) -> String {
        format!("monitor_exit {}, {}", idx(self.object), idx(self.monitor_id))
    }
}

/// A call with no exception edge: an exception thrown by the callee unwinds this method.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Invoke {
    pub target: CallTarget,
    pub bci: u32,
    /// The caller's state while the call is in progress.
    pub state_during: Option<FrameStateIdx>,
}

impl NodeT for Invoke {
    fn stamp(&self) -> Kind {
        self.target.return_kind
    }

    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        self.target.args.iter().copied().collect()
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        self.target.args.iter_mut().collect()
    }

    fn to_string(&self) -> String {
        format!("invoke {} @{}", self.target, self.bci)
    }
}

/// `idiv`, `irem`, `ldiv` and `lrem`: fixed because they trap on division by zero.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct IntegerDivRem {
    pub is_rem: bool,
    pub x: NodeIdx,
    pub y: NodeIdx,
    pub kind: Kind,
}

impl NodeT for IntegerDivRem {
    fn stamp(&self) -> Kind {
        self.kind
    }

    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.x, self.y]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.x, &mut self.y]
    }

    fn to_string(&self) -> String {
        format!(
            "{} {}, {}",
            if self.is_rem { "irem" } else { "idiv" },
            idx(self.x),
            idx(self.y)
        )
    }
}

/// Creates an exception that the compiled code throws itself (explicit exception checks).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BytecodeException {
    pub kind: BytecodeExceptionKind,
    pub args: Vec<NodeIdx>,
}

impl NodeT for BytecodeException {
    fn stamp(&self) -> Kind {
        Kind::Object
    }

    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        self.args.iter().copied().collect()
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        self.args.iter_mut().collect()
    }

    fn to_string(&self) -> String {
        format!("bytecode_exception {} [{}]", self.kind, idxs(&self.args))
    }
}

/// Deoptimises unless `cond` holds (or, if `negated`, unless it does not hold).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FixedGuard {
    pub cond: NodeIdx,
    pub reason: DeoptReason,
    pub action: DeoptAction,
    pub negated: bool,
}

impl NodeT for FixedGuard {
    fn class(&self) -> NodeClass {
        NodeClass::Fixed
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.cond]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.cond]
    }

    fn to_string(&self) -> String {
        format!(
            "guard {}{} {} {}",
            if self.negated { "!" } else { "" },
            idx(self.cond),
            self.reason,
            self.action
        )
    }

    fn assert_well_formed(&self, g: &Graph, iidx: NodeIdx) {
        assert_eq!(
            g.node(self.cond).class(),
            NodeClass::Logic,
            "%{iidx:?}: guard condition is not a logic node"
        );
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct If {
    pub cond: NodeIdx,
    pub true_succ: NodeIdx,
    pub false_succ: NodeIdx,
    /// The probability of taking `true_succ`.
    pub prob: Prob,
}

impl NodeT for If {
    fn class(&self) -> NodeClass {
        NodeClass::Split
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.cond]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.cond]
    }

    fn successors(&self) -> SmallVec<[NodeIdx; 2]> {
        smallvec![self.true_succ, self.false_succ]
    }

    fn successors_mut(&mut self) -> SmallVec<[&mut NodeIdx; 2]> {
        smallvec![&mut self.true_succ, &mut self.false_succ]
    }

    fn to_string(&self) -> String {
        format!(
            "if {} then {} else {} p={}",
            idx(self.cond),
            idx(self.true_succ),
            idx(self.false_succ),
            self.prob
        )
    }

    fn assert_well_formed(&self, g: &Graph, iidx: NodeIdx) {
        assert_eq!(
            g.node(self.cond).class(),
            NodeClass::Logic,
            "%{iidx:?}: if condition is not a logic node"
        );
        assert_ne!(
            self.true_succ, self.false_succ,
            "%{iidx:?}: if with identical successors"
        );
    }
}

/// The bytecode a switch came from. A `lookupswitch` is never lowered to a jump table.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SwitchKind {
    Table,
    Lookup,
}

/// A multi-way branch on an `int`. `key_succ[i]` is the successor index for `keys[i]`; the final
/// element of `key_succ` is the default successor's index.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct IntegerSwitch {
    pub kind: SwitchKind,
    pub value: NodeIdx,
    pub keys: Vec<i32>,
    pub key_succ: Vec<usize>,
    pub succs: Vec<NodeIdx>,
}

impl IntegerSwitch {
    pub fn default_succ(&self) -> NodeIdx {
        self.succs[self.key_succ[self.keys.len()]]
    }
}

impl NodeT for IntegerSwitch {
    fn class(&self) -> NodeClass {
        NodeClass::Split
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.value]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.value]
    }

    fn successors(&self) -> SmallVec<[NodeIdx; 2]> {
        self.succs.iter().copied().collect()
    }

    fn successors_mut(&mut self) -> SmallVec<[&mut NodeIdx; 2]> {
        self.succs.iter_mut().collect()
    }

    fn to_string(&self) -> String {
        let cases = self
            .keys
            .iter()
            .zip(&self.key_succ)
            .map(|(k, s)| format!("{k}: {}", idx(self.succs[*s])))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "switch {} [{cases}] default {}",
            idx(self.value),
            idx(self.default_succ())
        )
    }

    fn assert_well_formed(&self, _g: &Graph, iidx: NodeIdx) {
        assert_eq!(
            self.key_succ.len(),
            self.keys.len() + 1,
            "%{iidx:?}: switch needs one successor index per key plus a default"
        );
        assert!(
            self.keys.windows(2).all(|w| w[0] < w[1]),
            "%{iidx:?}: switch keys are not sorted"
        );
        assert!(
            self.key_succ.iter().all(|s| *s < self.succs.len()),
            "%{iidx:?}: switch successor index out of range"
        );
    }
}

/// A call whose exceptions are caught (or must be unwound) by this method.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct InvokeWithException {
    pub target: CallTarget,
    pub bci: u32,
    pub state_during: Option<FrameStateIdx>,
    pub next: NodeIdx,
    /// An [ExceptionObject].
    pub exception_edge: NodeIdx,
}

impl NodeT for InvokeWithException {
    fn stamp(&self) -> Kind {
        self.target.return_kind
    }

    fn class(&self) -> NodeClass {
        NodeClass::Split
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        self.target.args.iter().copied().collect()
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        self.target.args.iter_mut().collect()
    }

    fn successors(&self) -> SmallVec<[NodeIdx; 2]> {
        smallvec![self.next, self.exception_edge]
    }

    fn successors_mut(&mut self) -> SmallVec<[&mut NodeIdx; 2]> {
        smallvec![&mut self.next, &mut self.exception_edge]
    }

    fn to_string(&self) -> String {
        format!(
            "invoke {} @{} next {} exception {}",
            self.target,
            self.bci,
            idx(self.next),
            idx(self.exception_edge)
        )
    }

    fn assert_well_formed(&self, g: &Graph, iidx: NodeIdx) {
        assert!(
            matches!(g.node(self.exception_edge), Node::ExceptionObject(_)),
            "%{iidx:?}: exception edge is not an exception object"
        );
    }
}

/// A forward edge into a [Merge] or [LoopBegin].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct End;

impl NodeT for End {
    fn class(&self) -> NodeClass {
        NodeClass::End
    }

    fn to_string(&self) -> String {
        "end".to_owned()
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct LoopEnd {
    pub loop_begin: NodeIdx,
}

impl NodeT for LoopEnd {
    fn class(&self) -> NodeClass {
        NodeClass::End
    }

    fn to_string(&self) -> String {
        format!("loop_end {}", idx(self.loop_begin))
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Return {
    pub value: Option<NodeIdx>,
}

impl NodeT for Return {
    fn class(&self) -> NodeClass {
        NodeClass::Sink
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        self.value.iter().copied().collect()
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        self.value.iter_mut().collect()
    }

    fn to_string(&self) -> String {
        match self.value {
            Some(x) => format!("return {}", idx(x)),
            None => "return".to_owned(),
        }
    }
}

/// Throw `exception` to the caller.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Unwind {
    pub exception: NodeIdx,
}

impl NodeT for Unwind {
    fn class(&self) -> NodeClass {
        NodeClass::Sink
    }

    fn inputs(&self) -> SmallVec<[NodeIdx; 4]> {
        smallvec![self.exception]
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeIdx; 4]> {
        smallvec![&mut self.exception]
    }

    fn to_string(&self) -> String {
        format!("unwind {}", idx(self.exception))
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Deoptimize {
    pub action: DeoptAction,
    pub reason: DeoptReason,
}

impl NodeT for Deoptimize {
    fn class(&self) -> NodeClass {
        NodeClass::Sink
    }

    fn to_string(&self) -> String {
        format!("deopt {} {}", self.reason, self.action)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conditions() {
        for c in [
            Condition::Eq,
            Condition::Ne,
            Condition::Lt,
            Condition::Le,
            Condition::Gt,
            Condition::Ge,
            Condition::Bt,
            Condition::Be,
            Condition::At,
            Condition::Ae,
        ] {
            assert_eq!(c.negate().negate(), c);
            assert_eq!(c.mirror().mirror(), c);
            for (x, y) in [(1, 2), (2, 1), (3, 3), (-1, 1)] {
                assert_eq!(c.fold(x, y), !c.negate().fold(x, y));
                assert_eq!(c.fold(x, y), c.mirror().fold(y, x));
                // Canonicalisation expresses every condition with Eq, Lt or Bt.
                let (a, b) = if c.canonical_mirror() { (y, x) } else { (x, y) };
                let base = match c {
                    Condition::Eq | Condition::Ne => Condition::Eq,
                    x if x.is_unsigned() => Condition::Bt,
                    _ => Condition::Lt,
                };
                assert_eq!(base.fold(a, b) != c.canonical_negate(), c.fold(x, y));
            }
        }
        assert!(Condition::Bt.fold(1, -1));
        assert!(!Condition::Lt.fold(1, -1));
    }

    #[test]
    fn probabilities() {
        let p = Prob::new(0.25);
        assert_eq!(p.value(), 0.25);
        assert_eq!(p.inverse().value(), 0.75);
        assert_eq!(p.to_string(), "0.25");
    }

    #[test]
    fn convert_kinds() {
        assert_eq!(ConvertOp::I2B.to_kind(), Kind::Int);
        assert_eq!(ConvertOp::D2L.from_kind(), Kind::Double);
        assert_eq!(ConvertOp::L2F.to_string(), "l2f");
    }
}
