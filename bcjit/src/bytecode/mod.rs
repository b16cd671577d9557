//! Stack-machine bytecode: the opcode set, instruction lengths and a cursor for decoding
//! instructions and their operands.
//!
//! The bytecode format is the classic JVM one: one opcode byte followed by big-endian operands,
//! with `tableswitch` / `lookupswitch` padded to a 4 byte boundary and `wide` extending the
//! following local variable instruction.

use crate::compile::CompilationError;
use byteorder::{BigEndian, ByteOrder};
use strum::{Display, FromRepr};

#[cfg(test)]
pub(crate) mod asm;
pub(crate) mod blockmap;
pub(crate) mod liveness;

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[repr(u8)]
pub enum Op {
    nop = 0x00,
    aconst_null,
    iconst_m1,
    iconst_0,
    iconst_1,
    iconst_2,
    iconst_3,
    iconst_4,
    iconst_5,
    lconst_0,
    lconst_1,
    fconst_0,
    fconst_1,
    fconst_2,
    dconst_0,
    dconst_1,
    bipush,
    sipush,
    ldc,
    ldc_w,
    ldc2_w,
    iload,
    lload,
    fload,
    dload,
    aload,
    iload_0,
    iload_1,
    iload_2,
    iload_3,
    lload_0,
    lload_1,
    lload_2,
    lload_3,
    fload_0,
    fload_1,
    fload_2,
    fload_3,
    dload_0,
    dload_1,
    dload_2,
    dload_3,
    aload_0,
    aload_1,
    aload_2,
    aload_3,
    iaload,
    laload,
    faload,
    daload,
    aaload,
    baload,
    caload,
    saload,
    istore,
    lstore,
    fstore,
    dstore,
    astore,
    istore_0,
    istore_1,
    istore_2,
    istore_3,
    lstore_0,
    lstore_1,
    lstore_2,
    lstore_3,
    fstore_0,
    fstore_1,
    fstore_2,
    fstore_3,
    dstore_0,
    dstore_1,
    dstore_2,
    dstore_3,
    astore_0,
    astore_1,
    astore_2,
    astore_3,
    iastore,
    lastore,
    fastore,
    dastore,
    aastore,
    bastore,
    castore,
    sastore,
    pop,
    pop2,
    dup,
    dup_x1,
    dup_x2,
    dup2,
    dup2_x1,
    dup2_x2,
    swap,
    iadd,
    ladd,
    fadd,
    dadd,
    isub,
    lsub,
    fsub,
    dsub,
    imul,
    lmul,
    fmul,
    dmul,
    idiv,
    ldiv,
    fdiv,
    ddiv,
    irem,
    lrem,
    frem,
    drem,
    ineg,
    lneg,
    fneg,
    dneg,
    ishl,
    lshl,
    ishr,
    lshr,
    iushr,
    lushr,
    iand,
    land,
    ior,
    lor,
    ixor,
    lxor,
    iinc,
    i2l,
    i2f,
    i2d,
    l2i,
    l2f,
    l2d,
    f2i,
    f2l,
    f2d,
    d2i,
    d2l,
    d2f,
    i2b,
    i2c,
    i2s,
    lcmp,
    fcmpl,
    fcmpg,
    dcmpl,
    dcmpg,
    ifeq,
    ifne,
    iflt,
    ifge,
    ifgt,
    ifle,
    if_icmpeq,
    if_icmpne,
    if_icmplt,
    if_icmpge,
    if_icmpgt,
    if_icmple,
    if_acmpeq,
    if_acmpne,
    goto,
    jsr,
    ret,
    tableswitch,
    lookupswitch,
    ireturn,
    lreturn,
    freturn,
    dreturn,
    areturn,
    #[strum(serialize = "return")]
    r#return,
    getstatic,
    putstatic,
    getfield,
    putfield,
    invokevirtual,
    invokespecial,
    invokestatic,
    invokeinterface,
    invokedynamic,
    new,
    newarray,
    anewarray,
    arraylength,
    athrow,
    checkcast,
    instanceof,
    monitorenter,
    monitorexit,
    wide,
    multianewarray,
    ifnull,
    ifnonnull,
    goto_w,
    jsr_w,
}

impl Op {
    /// The length of an instruction with this opcode, or `None` if the length depends on the
    /// instruction's operands (switches and `wide`).
    pub fn fixed_length(self) -> Option<usize> {
        use Op::*;
        Some(match self {
            bipush | ldc | iload | lload | fload | dload | aload | istore | lstore | fstore
            | dstore | astore | ret | newarray => 2,
            sipush | ldc_w | ldc2_w | iinc | ifeq | ifne | iflt | ifge | ifgt | ifle
            | if_icmpeq | if_icmpne | if_icmplt | if_icmpge | if_icmpgt | if_icmple
            | if_acmpeq | if_acmpne | goto | jsr | getstatic | putstatic | getfield
            | putfield | invokevirtual | invokespecial | invokestatic | new | anewarray
            | checkcast | instanceof | ifnull | ifnonnull => 3,
            multianewarray => 4,
            invokeinterface | invokedynamic | goto_w | jsr_w => 5,
            tableswitch | lookupswitch | wide => return None,
            _ => 1,
        })
    }

    /// Is this an unconditional or conditional branch with a 16 bit offset?
    pub fn is_branch(self) -> bool {
        use Op::*;
        matches!(
            self,
            ifeq | ifne
                | iflt
                | ifge
                | ifgt
                | ifle
                | if_icmpeq
                | if_icmpne
                | if_icmplt
                | if_icmpge
                | if_icmpgt
                | if_icmple
                | if_acmpeq
                | if_acmpne
                | ifnull
                | ifnonnull
                | goto
                | jsr
        )
    }

    pub fn is_return(self) -> bool {
        use Op::*;
        matches!(self, ireturn | lreturn | freturn | dreturn | areturn | r#return)
    }

    pub fn is_invoke(self) -> bool {
        use Op::*;
        matches!(
            self,
            invokevirtual | invokespecial | invokestatic | invokeinterface | invokedynamic
        )
    }

    /// Can an instruction with this opcode raise an exception that a handler in the same method
    /// could catch?
    pub fn can_trap(self) -> bool {
        use Op::*;
        matches!(
            self,
            iaload
                | laload
                | faload
                | daload
                | aaload
                | baload
                | caload
                | saload
                | iastore
                | lastore
                | fastore
                | dastore
                | aastore
                | bastore
                | castore
                | sastore
                | idiv
                | ldiv
                | irem
                | lrem
                | getfield
                | putfield
                | arraylength
                | athrow
                | checkcast
                | monitorenter
                | monitorexit
                | new
                | newarray
                | anewarray
                | multianewarray
        ) || self.is_invoke()
    }
}

/// The decoded operands of a `tableswitch` or `lookupswitch`. Both are normalised to a list of
/// keys with one target per key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SwitchTable {
    pub keys: Vec<i32>,
    pub targets: Vec<u32>,
    pub default: u32,
}

/// A cursor over a method's bytecode. Operands are read relative to the current instruction.
///
/// The cursor assumes the code has been validated (see [blockmap::BlockMap::new]): reading an
/// operand beyond the end of the code panics.
#[derive(Debug)]
pub struct BytecodeStream<'a> {
    code: &'a [u8],
    cur: usize,
}

impl<'a> BytecodeStream<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        BytecodeStream { code, cur: 0 }
    }

    pub fn set_bci(&mut self, bci: u32) {
        self.cur = bci as usize;
    }

    pub fn current_bci(&self) -> u32 {
        self.cur as u32
    }

    pub fn end_bci(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn at_end(&self) -> bool {
        self.cur >= self.code.len()
    }

    pub fn opcode(&self) -> Result<Op, CompilationError> {
        let b = self.code[self.cur];
        Op::from_repr(b).ok_or_else(|| {
            CompilationError::Bailout(format!("unsupported bytecode {b:#04x} at bci {}", self.cur))
        })
    }

    /// The length of the current instruction, including its operands.
    pub fn current_length(&self) -> Result<usize, CompilationError> {
        let op = self.opcode()?;
        if let Some(l) = op.fixed_length() {
            return Ok(l);
        }
        match op {
            Op::wide => {
                let Some(&b) = self.code.get(self.cur + 1) else {
                    return Err(self.truncated());
                };
                match Op::from_repr(b) {
                    Some(Op::iinc) => Ok(6),
                    Some(
                        Op::iload
                        | Op::lload
                        | Op::fload
                        | Op::dload
                        | Op::aload
                        | Op::istore
                        | Op::lstore
                        | Op::fstore
                        | Op::dstore
                        | Op::astore
                        | Op::ret,
                    ) => Ok(4),
                    _ => Err(CompilationError::Bailout(format!(
                        "invalid wide instruction at bci {}",
                        self.cur
                    ))),
                }
            }
            Op::tableswitch => {
                let base = self.switch_base();
                let (low, high) = (self.checked_i32(base + 4)?, self.checked_i32(base + 8)?);
                if high < low {
                    return Err(CompilationError::Bailout(format!(
                        "tableswitch at bci {} has high < low",
                        self.cur
                    )));
                }
                let n = (i64::from(high) - i64::from(low) + 1) as usize;
                Ok(base + 12 + 4 * n - self.cur)
            }
            Op::lookupswitch => {
                let base = self.switch_base();
                let n = self.checked_i32(base + 4)?;
                if n < 0 {
                    return Err(CompilationError::Bailout(format!(
                        "lookupswitch at bci {} has a negative number of pairs",
                        self.cur
                    )));
                }
                Ok(base + 8 + 8 * n as usize - self.cur)
            }
            _ => unreachable!(),
        }
    }

    fn truncated(&self) -> CompilationError {
        CompilationError::Bailout(format!("truncated instruction at bci {}", self.cur))
    }

    fn checked_i32(&self, off: usize) -> Result<i32, CompilationError> {
        if off + 4 > self.code.len() {
            return Err(self.truncated());
        }
        Ok(BigEndian::read_i32(&self.code[off..]))
    }

    /// Advance to the next instruction, returning its bci.
    pub fn next(&mut self) -> Result<u32, CompilationError> {
        let len = self.current_length()?;
        if self.cur + len > self.code.len() {
            return Err(self.truncated());
        }
        self.cur += len;
        Ok(self.cur as u32)
    }

    /// The bci of the instruction following the current one.
    pub fn next_bci(&self) -> u32 {
        // Lengths were validated when the block map was built.
        (self.cur + self.current_length().unwrap_or(1)) as u32
    }

    pub fn read_u8(&self, off: usize) -> u8 {
        self.code[self.cur + off]
    }

    pub fn read_i8(&self, off: usize) -> i8 {
        self.code[self.cur + off] as i8
    }

    pub fn read_u16(&self, off: usize) -> u16 {
        BigEndian::read_u16(&self.code[self.cur + off..])
    }

    pub fn read_i16(&self, off: usize) -> i16 {
        BigEndian::read_i16(&self.code[self.cur + off..])
    }

    pub fn read_i32(&self, off: usize) -> i32 {
        BigEndian::read_i32(&self.code[self.cur + off..])
    }

    /// Is the current instruction prefixed by `wide`?
    pub fn is_wide(&self) -> bool {
        self.code[self.cur] == Op::wide as u8
    }

    /// The opcode of the current instruction, looking through a `wide` prefix.
    pub fn inner_opcode(&self) -> Result<Op, CompilationError> {
        if self.is_wide() {
            Op::from_repr(self.read_u8(1)).ok_or_else(|| self.truncated())
        } else {
            self.opcode()
        }
    }

    /// The local variable index of a load, store, `iinc` or `ret`, honouring `wide`.
    pub fn read_local_index(&self) -> usize {
        if self.is_wide() {
            usize::from(self.read_u16(2))
        } else {
            usize::from(self.read_u8(1))
        }
    }

    /// The increment of an `iinc`, honouring `wide`.
    pub fn read_increment(&self) -> i32 {
        if self.is_wide() {
            i32::from(self.read_i16(4))
        } else {
            i32::from(self.read_i8(2))
        }
    }

    pub fn read_cpi(&self) -> u16 {
        self.read_u16(1)
    }

    pub fn read_cpi_u8(&self) -> u16 {
        u16::from(self.read_u8(1))
    }

    /// The target of a branch with a 16 bit offset.
    pub fn read_branch_dest(&self) -> u32 {
        (self.cur as i64 + i64::from(self.read_i16(1))) as u32
    }

    /// The target of `goto_w` / `jsr_w`.
    pub fn read_far_branch_dest(&self) -> u32 {
        (self.cur as i64 + i64::from(self.read_i32(1))) as u32
    }

    fn switch_base(&self) -> usize {
        (self.cur + 4) & !3
    }

    /// Decode the current `tableswitch` or `lookupswitch`.
    pub fn read_switch(&self) -> SwitchTable {
        let base = self.switch_base();
        let rd = |off: usize| BigEndian::read_i32(&self.code[off..]);
        let dest = |rel: i32| (self.cur as i64 + i64::from(rel)) as u32;
        let default = dest(rd(base));
        let (mut keys, mut targets) = (Vec::new(), Vec::new());
        if self.code[self.cur] == Op::tableswitch as u8 {
            let (low, high) = (rd(base + 4), rd(base + 8));
            for (i, key) in (low..=high).enumerate() {
                keys.push(key);
                targets.push(dest(rd(base + 12 + 4 * i)));
            }
        } else {
            let n = rd(base + 4) as usize;
            for i in 0..n {
                keys.push(rd(base + 8 + 8 * i));
                targets.push(dest(rd(base + 12 + 8 * i)));
            }
        }
        SwitchTable {
            keys,
            targets,
            default,
        }
    }
}

/// Render `code` one instruction per line, showing branch and switch targets.
pub fn disassemble(code: &[u8]) -> Result<String, CompilationError> {
    let mut out = String::new();
    let mut bs = BytecodeStream::new(code);
    while !bs.at_end() {
        let op = bs.inner_opcode()?;
        let bci = bs.current_bci();
        let wide = if bs.is_wide() { "wide " } else { "" };
        let line = match op {
            Op::goto_w | Op::jsr_w => format!("{bci}: {op} {}", bs.read_far_branch_dest()),
            x if x.is_branch() => format!("{bci}: {op} {}", bs.read_branch_dest()),
            Op::tableswitch | Op::lookupswitch => {
                let sw = bs.read_switch();
                let cases = sw
                    .keys
                    .iter()
                    .zip(&sw.targets)
                    .map(|(k, t)| format!("{k}: {t}"))
                    .collect::<Vec<_>>();
                format!("{bci}: {op} [{}] default: {}", cases.join(", "), sw.default)
            }
            _ => format!("{bci}: {wide}{op}"),
        };
        out.push_str(&line);
        out.push('\n');
        bs.next()?;
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opcode_encodings() {
        assert_eq!(Op::iconst_0 as u8, 0x03);
        assert_eq!(Op::iload_0 as u8, 0x1a);
        assert_eq!(Op::iadd as u8, 0x60);
        assert_eq!(Op::iinc as u8, 0x84);
        assert_eq!(Op::lcmp as u8, 0x94);
        assert_eq!(Op::goto as u8, 0xa7);
        assert_eq!(Op::r#return as u8, 0xb1);
        assert_eq!(Op::invokeinterface as u8, 0xb9);
        assert_eq!(Op::monitorenter as u8, 0xc2);
        assert_eq!(Op::jsr_w as u8, 0xc9);
        assert_eq!(Op::from_repr(0xca), None);
        assert_eq!(Op::r#return.to_string(), "return");
    }

    #[test]
    fn stream_operands() {
        // bipush -3; sipush 300; goto -4; wide iinc 300, -2
        let code = [
            0x10, 0xfd, 0x11, 0x01, 0x2c, 0xa7, 0xff, 0xfc, 0xc4, 0x84, 0x01, 0x2c, 0xff, 0xfe,
        ];
        let mut s = BytecodeStream::new(&code);
        assert_eq!(s.opcode().unwrap(), Op::bipush);
        assert_eq!(s.read_i8(1), -3);
        assert_eq!(s.next().unwrap(), 2);
        assert_eq!(s.read_i16(1), 300);
        s.next().unwrap();
        assert_eq!(s.read_branch_dest(), 1);
        s.next().unwrap();
        assert!(s.is_wide());
        assert_eq!(s.inner_opcode().unwrap(), Op::iinc);
        assert_eq!(s.read_local_index(), 300);
        assert_eq!(s.read_increment(), -2);
        assert_eq!(s.next().unwrap(), 14);
        assert!(s.at_end());
    }

    #[test]
    fn switches() {
        // nop; tableswitch (padded to 4) default=+20 low=1 high=2 -> +30, +40
        let mut code = vec![0x00, 0xaa, 0x00, 0x00];
        for x in [20i32, 1, 2, 30, 40] {
            code.extend_from_slice(&x.to_be_bytes());
        }
        let mut s = BytecodeStream::new(&code);
        s.next().unwrap();
        assert_eq!(s.current_length().unwrap(), code.len() - 1);
        assert_eq!(
            s.read_switch(),
            SwitchTable {
                keys: vec![1, 2],
                targets: vec![31, 41],
                default: 21
            }
        );

        // lookupswitch default=+8 npairs=1 (7 -> +12)
        let mut code = vec![0xab, 0x00, 0x00, 0x00];
        for x in [8i32, 1, 7, 12] {
            code.extend_from_slice(&x.to_be_bytes());
        }
        let s = BytecodeStream::new(&code);
        assert_eq!(s.current_length().unwrap(), code.len());
        let t = s.read_switch();
        assert_eq!((t.keys, t.targets, t.default), (vec![7], vec![12], 8));
    }

    #[test]
    fn malformed() {
        let s = BytecodeStream::new(&[0xfe]);
        assert!(matches!(s.opcode(), Err(CompilationError::Bailout(_))));
        let mut s = BytecodeStream::new(&[0x11, 0x00]);
        assert!(s.next().is_err());
    }

    #[test]
    fn disassembly() {
        let a = asm::assemble(
            "
              iload_0
              ifeq L1
              iinc 300 1
            L1:
              iconst_0
              ireturn
            ",
        );
        assert_eq!(
            disassemble(&a.code).unwrap(),
            "0: iload_0\n1: ifeq 10\n4: wide iinc\n10: iconst_0\n11: ireturn\n"
        );
    }
}
