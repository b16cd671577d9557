//! The AMD64 architecture.

use crate::{
    compile::CompilationError,
    graph::nodes::{ArithOp, ConvertOp, IntrinsicOp},
    lir::{
        arch::{ArchT, AtomicOp, CallType},
        Value,
    },
    meta::{Constant, Kind},
};
use std::fmt::{self, Display, Formatter};
use strum::{EnumCount, FromRepr};

#[derive(Clone, Copy, Debug, EnumCount, Eq, FromRepr, Hash, PartialEq)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,

    XMM0,
    XMM1,
    XMM2,
    XMM3,
    XMM4,
    XMM5,
    XMM6,
    XMM7,
    XMM8,
    XMM9,
    XMM10,
    XMM11,
    XMM12,
    XMM13,
    XMM14,
    XMM15,
}

impl Reg {
    pub fn is_fp(self) -> bool {
        self as u8 >= Reg::XMM0 as u8
    }
}

impl Display for Reg {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", format!("{self:?}").to_lowercase())
    }
}

/// Integer arguments of Java calls. `rdi` comes last so that it stays free for the runtime.
const JAVA_INT_ARGS: [Reg; 6] = [Reg::RSI, Reg::RDX, Reg::RCX, Reg::R8, Reg::R9, Reg::RDI];
/// Integer arguments of runtime calls, as per the System V ABI.
const RUNTIME_INT_ARGS: [Reg; 6] = [Reg::RDI, Reg::RSI, Reg::RDX, Reg::RCX, Reg::R8, Reg::R9];
const FP_ARGS: [Reg; 8] = [
    Reg::XMM0,
    Reg::XMM1,
    Reg::XMM2,
    Reg::XMM3,
    Reg::XMM4,
    Reg::XMM5,
    Reg::XMM6,
    Reg::XMM7,
];
/// Registers preserved across calls.
const CALLEE_SAVED: [Reg; 5] = [Reg::RBX, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// The operand size suffix of an instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpSize {
    Byte,
    Word,
    DWord,
    QWord,
    Single,
    Double,
    /// The mnemonic is complete without a suffix.
    None,
}

impl OpSize {
    fn of(kind: Kind) -> Self {
        match kind {
            Kind::Boolean | Kind::Byte => OpSize::Byte,
            Kind::Short | Kind::Char => OpSize::Word,
            Kind::Int => OpSize::DWord,
            Kind::Float => OpSize::Single,
            Kind::Double => OpSize::Double,
            Kind::Long | Kind::Object | Kind::ReturnAddress | Kind::Void | Kind::Illegal => {
                OpSize::QWord
            }
        }
    }
}

/// An AMD64 opcode in AT&T style: a mnemonic plus a size suffix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Amd64Op {
    pub mnemonic: &'static str,
    pub size: OpSize,
}

impl Amd64Op {
    fn new(mnemonic: &'static str, size: OpSize) -> Self {
        Amd64Op { mnemonic, size }
    }

    fn sized(mnemonic: &'static str, kind: Kind) -> Self {
        Amd64Op::new(mnemonic, OpSize::of(kind))
    }
}

impl Display for Amd64Op {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let suffix = match self.size {
            OpSize::Byte => "b",
            OpSize::Word => "w",
            OpSize::DWord => "l",
            OpSize::QWord => "q",
            OpSize::Single => "ss",
            OpSize::Double => "sd",
            OpSize::None => "",
        };
        write!(f, "{}{suffix}", self.mnemonic)
    }
}

/// The AMD64 target.
#[derive(Debug, Default)]
pub struct Amd64;

impl Amd64 {
    pub fn new() -> Self {
        Amd64
    }
}

impl ArchT for Amd64 {
    type Reg = Reg;
    type Opcode = Amd64Op;

    fn can_inline_constant(&self, c: &Constant) -> bool {
        match c {
            Constant::Long(x) => i32::try_from(*x).is_ok(),
            Constant::Object(_) => false,
            _ => true,
        }
    }

    fn can_store_constant(&self, c: &Constant) -> bool {
        match c {
            Constant::Double(_) => false,
            Constant::Long(x) => i32::try_from(*x).is_ok(),
            Constant::Object(_) => false,
            _ => true,
        }
    }

    fn is_legal_displacement(&self, disp: i64) -> bool {
        i32::try_from(disp).is_ok()
    }

    fn array_base_offset(&self, _kind: Kind) -> i32 {
        16
    }

    fn array_length_offset(&self) -> i32 {
        8
    }

    fn array_index_scale(&self, kind: Kind) -> u8 {
        // Every array element kind is at most 8 bytes.
        kind.byte_count() as u8
    }

    fn word_size(&self) -> i32 {
        8
    }

    fn lock_slot_size(&self) -> i32 {
        8
    }

    fn calling_convention(&self, kinds: &[Kind], call_type: CallType) -> Vec<Value<Reg>> {
        let int_regs: &[Reg] = match call_type {
            CallType::JavaCall | CallType::JavaCallee => &JAVA_INT_ARGS,
            CallType::Runtime => &RUNTIME_INT_ARGS,
        };
        let (mut ni, mut nf) = (0, 0);
        let mut stack_off = 0;
        let mut locs = Vec::with_capacity(kinds.len());
        for &k in kinds {
            let k = k.stack_kind();
            let reg = if k.is_numeric_float() {
                nf += 1;
                FP_ARGS.get(nf - 1)
            } else {
                ni += 1;
                int_regs.get(ni - 1)
            };
            match reg {
                Some(r) => locs.push(Value::Reg(*r, k)),
                None => {
                    locs.push(match call_type {
                        CallType::JavaCallee => Value::Incoming(stack_off, k),
                        CallType::JavaCall | CallType::Runtime => Value::Stack(stack_off, k),
                    });
                    stack_off += self.word_size();
                }
            }
        }
        locs
    }

    fn return_register(&self, kind: Kind) -> Value<Reg> {
        let k = kind.stack_kind();
        if k.is_numeric_float() {
            Value::Reg(Reg::XMM0, k)
        } else {
            Value::Reg(Reg::RAX, k)
        }
    }

    fn exception_register(&self) -> Value<Reg> {
        Value::Reg(Reg::RAX, Kind::Object)
    }

    fn shift_count_register(&self) -> Option<Reg> {
        Some(Reg::RCX)
    }

    fn caller_saved(&self) -> Vec<Value<Reg>> {
        (0..Reg::COUNT)
            .filter_map(|i| Reg::from_repr(i as u8))
            .filter(|r| !matches!(r, Reg::RSP | Reg::RBP) && !CALLEE_SAVED.contains(r))
            .map(|r| {
                Value::Reg(
                    r,
                    if r.is_fp() {
                        Kind::Double
                    } else {
                        Kind::Long
                    },
                )
            })
            .collect()
    }

    fn move_op(&self, kind: Kind) -> Amd64Op {
        match kind.stack_kind() {
            Kind::Float => Amd64Op::new("movaps", OpSize::None),
            Kind::Double => Amd64Op::new("movapd", OpSize::None),
            Kind::Int => Amd64Op::sized("mov", Kind::Int),
            _ => Amd64Op::sized("mov", Kind::Long),
        }
    }

    fn load_op(&self, kind: Kind) -> Amd64Op {
        match kind {
            Kind::Boolean => Amd64Op::new("movzbl", OpSize::None),
            Kind::Byte => Amd64Op::new("movsbl", OpSize::None),
            Kind::Char => Amd64Op::new("movzwl", OpSize::None),
            Kind::Short => Amd64Op::new("movswl", OpSize::None),
            _ => Amd64Op::sized("mov", kind),
        }
    }

    fn store_op(&self, kind: Kind) -> Amd64Op {
        Amd64Op::sized("mov", kind)
    }

    fn compare_op(&self, kind: Kind) -> Amd64Op {
        let k = kind.stack_kind();
        if k.is_numeric_float() {
            Amd64Op::sized("ucomi", k)
        } else {
            Amd64Op::sized("cmp", k)
        }
    }

    fn arith_op(&self, op: ArithOp, kind: Kind) -> Option<Amd64Op> {
        let k = kind.stack_kind();
        if k.is_numeric_float() {
            let m = match op {
                ArithOp::Add => "add",
                ArithOp::Sub => "sub",
                ArithOp::Mul => "mul",
                ArithOp::Div => "div",
                _ => return None,
            };
            return Some(Amd64Op::sized(m, k));
        }
        let m = match op {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "imul",
            ArithOp::Div | ArithOp::Rem => "idiv",
            ArithOp::And => "and",
            ArithOp::Or => "or",
            ArithOp::Xor => "xor",
            ArithOp::Shl => "shl",
            ArithOp::Shr => "sar",
            ArithOp::UShr => "shr",
        };
        Some(Amd64Op::sized(m, k))
    }

    fn negate_op(&self, kind: Kind) -> Amd64Op {
        match kind.stack_kind() {
            // Flip the sign bit with a mask.
            Kind::Float => Amd64Op::new("xorps", OpSize::None),
            Kind::Double => Amd64Op::new("xorpd", OpSize::None),
            k => Amd64Op::sized("neg", k),
        }
    }

    fn convert_op(&self, op: ConvertOp) -> Amd64Op {
        let m = match op {
            ConvertOp::I2L => "movslq",
            ConvertOp::L2I => "movl",
            ConvertOp::I2B => "movsbl",
            ConvertOp::I2C => "movzwl",
            ConvertOp::I2S => "movswl",
            ConvertOp::I2F => "cvtsi2ssl",
            ConvertOp::I2D => "cvtsi2sdl",
            ConvertOp::L2F => "cvtsi2ssq",
            ConvertOp::L2D => "cvtsi2sdq",
            ConvertOp::F2I => "cvttss2sil",
            ConvertOp::F2L => "cvttss2siq",
            ConvertOp::D2I => "cvttsd2sil",
            ConvertOp::D2L => "cvttsd2siq",
            ConvertOp::F2D => "cvtss2sd",
            ConvertOp::D2F => "cvtsd2ss",
        };
        Amd64Op::new(m, OpSize::None)
    }

    fn div_rem_op(&self, _is_rem: bool, kind: Kind) -> Amd64Op {
        // The quotient ends up in rax and the remainder in rdx.
        Amd64Op::sized("idiv", kind.stack_kind())
    }

    fn atomic_op(&self, op: AtomicOp, kind: Kind) -> Amd64Op {
        match op {
            AtomicOp::CompareAndSwap => Amd64Op::sized("lock cmpxchg", kind),
            AtomicOp::Store => Amd64Op::sized("mov", kind),
        }
    }

    fn intrinsic_op(&self, op: IntrinsicOp, kind: Kind) -> Result<Amd64Op, CompilationError> {
        let k = kind.stack_kind();
        match (op, k) {
            (IntrinsicOp::Sqrt, Kind::Float | Kind::Double) => Ok(Amd64Op::sized("sqrt", k)),
            (IntrinsicOp::Abs, Kind::Float) => Ok(Amd64Op::new("andps", OpSize::None)),
            (IntrinsicOp::Abs, Kind::Double) => Ok(Amd64Op::new("andpd", OpSize::None)),
            (IntrinsicOp::BitCount, Kind::Int | Kind::Long) => Ok(Amd64Op::sized("popcnt", k)),
            (IntrinsicOp::LeadingZeros, Kind::Int | Kind::Long) => Ok(Amd64Op::sized("lzcnt", k)),
            (IntrinsicOp::TrailingZeros, Kind::Int | Kind::Long) => {
                Ok(Amd64Op::sized("tzcnt", k))
            }
            _ => Err(CompilationError::internal(format!(
                "no amd64 instruction for {op} on {k}"
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constants() {
        let a = Amd64::new();
        assert!(a.can_inline_constant(&Constant::Long(i64::from(i32::MAX))));
        assert!(!a.can_inline_constant(&Constant::Long(i64::from(i32::MAX) + 1)));
        assert!(a.can_inline_constant(&Constant::Null));
        assert!(!a.can_inline_constant(&Constant::Object(0x1000)));
        assert!(a.can_inline_constant(&Constant::double(1.5)));
        assert!(!a.can_store_constant(&Constant::double(1.5)));
        assert!(a.can_store_constant(&Constant::float(1.5)));
        assert!(!a.can_store_constant(&Constant::Long(1 << 40)));
        assert!(a.can_store_constant(&Constant::Long(-1)));
        assert!(a.is_legal_displacement(-8));
        assert!(!a.is_legal_displacement(1 << 33));
    }

    #[test]
    fn calling_conventions() {
        let a = Amd64::new();
        let kinds = [
            Kind::Object,
            Kind::Double,
            Kind::Int,
            Kind::Long,
            Kind::Int,
            Kind::Int,
            Kind::Int,
            Kind::Int,
        ];
        let locs = a
            .calling_convention(&kinds, CallType::JavaCall)
            .iter()
            .map(|l| l.to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            locs,
            ["rsi", "xmm0", "rdx", "rcx", "r8", "r9", "rdi", "stack:0"]
        );
        let locs = a.calling_convention(&kinds, CallType::JavaCallee);
        assert_eq!(locs[7], Value::Incoming(0, Kind::Int));
        let locs = a.calling_convention(&[Kind::Object, Kind::Int], CallType::Runtime);
        assert_eq!(
            locs,
            vec![Value::Reg(Reg::RDI, Kind::Object), Value::Reg(Reg::RSI, Kind::Int)]
        );
        assert_eq!(a.return_register(Kind::Float), Value::Reg(Reg::XMM0, Kind::Float));
        assert_eq!(a.return_register(Kind::Byte), Value::Reg(Reg::RAX, Kind::Int));
    }

    #[test]
    fn caller_saved() {
        let cs = Amd64::new().caller_saved();
        assert_eq!(cs.len(), 9 + 16);
        assert!(!cs.contains(&Value::Reg(Reg::RBX, Kind::Long)));
        assert!(cs.contains(&Value::Reg(Reg::R11, Kind::Long)));
        assert!(cs.contains(&Value::Reg(Reg::XMM15, Kind::Double)));
    }

    #[test]
    fn opcodes() {
        let a = Amd64::new();
        assert_eq!(a.move_op(Kind::Int).to_string(), "movl");
        assert_eq!(a.move_op(Kind::Object).to_string(), "movq");
        assert_eq!(a.move_op(Kind::Double).to_string(), "movapd");
        assert_eq!(a.load_op(Kind::Char).to_string(), "movzwl");
        assert_eq!(a.store_op(Kind::Byte).to_string(), "movb");
        assert_eq!(a.compare_op(Kind::Float).to_string(), "ucomiss");
        assert_eq!(a.arith_op(ArithOp::Add, Kind::Long).unwrap().to_string(), "addq");
        assert_eq!(a.arith_op(ArithOp::UShr, Kind::Int).unwrap().to_string(), "shrl");
        assert_eq!(a.arith_op(ArithOp::Mul, Kind::Double).unwrap().to_string(), "mulsd");
        assert!(a.arith_op(ArithOp::Rem, Kind::Float).is_none());
        assert_eq!(a.convert_op(ConvertOp::I2D).to_string(), "cvtsi2sdl");
        assert_eq!(
            a.atomic_op(AtomicOp::CompareAndSwap, Kind::Long).to_string(),
            "lock cmpxchgq"
        );
        assert_eq!(
            a.intrinsic_op(IntrinsicOp::LeadingZeros, Kind::Long)
                .unwrap()
                .to_string(),
            "lzcntq"
        );
        assert!(a.intrinsic_op(IntrinsicOp::Sqrt, Kind::Int).is_err());
    }
}
