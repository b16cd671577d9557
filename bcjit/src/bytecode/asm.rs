//! A tiny textual assembler so that tests can write bytecode as mnemonics. The syntax is:
//!
//! ```text
//!   iload_0
//!   ifeq L1        // branch targets are labels
//!   iconst_1
//!   ireturn
//! L1:
//!   tableswitch 0 default:L2 L3 L4
//!   lookupswitch default:L2 1:L3 9:L4
//!   getfield 3     // constant pool indices are plain numbers
//! .catch L0 L1 L5 2
//! ```
//!
//! Local variable instructions switch to their `wide` form automatically.

use super::Op;
use crate::meta::ExceptionHandler;
use std::collections::HashMap;

pub(crate) struct Assembled {
    pub code: Vec<u8>,
    pub handlers: Vec<ExceptionHandler>,
    pub labels: HashMap<String, u32>,
}

fn lookup_op(s: &str) -> Op {
    (0..=0xc9u8)
        .filter_map(Op::from_repr)
        .find(|op| op.to_string() == s)
        .unwrap_or_else(|| panic!("unknown mnemonic '{s}'"))
}

fn num(s: &str) -> i64 {
    s.parse::<i64>()
        .unwrap_or_else(|_| panic!("expected a number, got '{s}'"))
}

struct Line<'a> {
    op: Op,
    args: Vec<&'a str>,
    bci: u32,
}

/// How many bytes does `op` with `args` take at `bci`?
fn size(op: Op, args: &[&str], bci: u32) -> u32 {
    let pad = (4 - (bci + 1) % 4) % 4;
    match op {
        Op::tableswitch => 1 + pad + 12 + 4 * (args.len() as u32 - 2),
        Op::lookupswitch => 1 + pad + 8 + 8 * (args.len() as u32 - 1),
        Op::iinc => {
            let (idx, inc) = (num(args[0]), num(args[1]));
            if idx > 255 || !(-128..=127).contains(&inc) {
                6
            } else {
                3
            }
        }
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
        | Op::ret
            if num(args[0]) > 255 =>
        {
            4
        }
        _ => op.fixed_length().unwrap() as u32,
    }
}

pub(crate) fn assemble(src: &str) -> Assembled {
    let mut labels = HashMap::new();
    let mut lines = Vec::new();
    let mut catches = Vec::new();
    let mut bci = 0;
    for raw in src.lines() {
        let l = raw.split("//").next().unwrap().trim();
        if l.is_empty() {
            continue;
        }
        if let Some(name) = l.strip_suffix(':') {
            labels.insert(name.to_owned(), bci);
            continue;
        }
        let mut toks = l.split_whitespace();
        let head = toks.next().unwrap();
        let args = toks.collect::<Vec<_>>();
        if head == ".catch" {
            catches.push(args);
            continue;
        }
        let op = lookup_op(head);
        let sz = size(op, &args, bci);
        lines.push(Line { op, args, bci });
        bci += sz;
    }

    let label = |s: &str| -> u32 {
        *labels
            .get(s)
            .unwrap_or_else(|| panic!("unknown label '{s}'"))
    };

    let mut code = Vec::with_capacity(bci as usize);
    for Line { op, args, bci } in &lines {
        let (op, bci) = (*op, *bci);
        let rel = |s: &str| label(s) as i64 - i64::from(bci);
        let wide = size(op, args, bci) > op.fixed_length().unwrap_or(0) as u32
            && !matches!(op, Op::tableswitch | Op::lookupswitch);
        if wide {
            code.push(Op::wide as u8);
        }
        code.push(op as u8);
        match op {
            Op::bipush | Op::newarray => code.push(num(args[0]) as u8),
            Op::ldc => code.push(num(args[0]) as u8),
            Op::sipush => code.extend_from_slice(&(num(args[0]) as i16).to_be_bytes()),
            Op::iinc => {
                if wide {
                    code.extend_from_slice(&(num(args[0]) as u16).to_be_bytes());
                    code.extend_from_slice(&(num(args[1]) as i16).to_be_bytes());
                } else {
                    code.push(num(args[0]) as u8);
                    code.push(num(args[1]) as u8);
                }
            }
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
            | Op::ret => {
                if wide {
                    code.extend_from_slice(&(num(args[0]) as u16).to_be_bytes());
                } else {
                    code.push(num(args[0]) as u8);
                }
            }
            Op::goto_w | Op::jsr_w => code.extend_from_slice(&(rel(args[0]) as i32).to_be_bytes()),
            x if x.is_branch() => code.extend_from_slice(&(rel(args[0]) as i16).to_be_bytes()),
            Op::tableswitch | Op::lookupswitch => {
                while code.len() % 4 != 0 {
                    code.push(0);
                }
                let default = args
                    .iter()
                    .find_map(|a| a.strip_prefix("default:"))
                    .expect("switch without default");
                code.extend_from_slice(&(rel(default) as i32).to_be_bytes());
                if op == Op::tableswitch {
                    let low = num(args[0]) as i32;
                    let targets = &args[2..];
                    let high = low + targets.len() as i32 - 1;
                    code.extend_from_slice(&low.to_be_bytes());
                    code.extend_from_slice(&high.to_be_bytes());
                    for t in targets {
                        code.extend_from_slice(&(rel(t) as i32).to_be_bytes());
                    }
                } else {
                    let pairs = &args[1..];
                    code.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
                    for p in pairs {
                        let (k, t) = p.split_once(':').unwrap();
                        code.extend_from_slice(&(num(k) as i32).to_be_bytes());
                        code.extend_from_slice(&(rel(t) as i32).to_be_bytes());
                    }
                }
            }
            Op::invokeinterface => {
                code.extend_from_slice(&(num(args[0]) as u16).to_be_bytes());
                code.push(num(args[1]) as u8);
                code.push(0);
            }
            Op::invokedynamic => {
                code.extend_from_slice(&(num(args[0]) as u16).to_be_bytes());
                code.extend_from_slice(&[0, 0]);
            }
            Op::multianewarray => {
                code.extend_from_slice(&(num(args[0]) as u16).to_be_bytes());
                code.push(num(args[1]) as u8);
            }
            _ => match op.fixed_length() {
                Some(3) => code.extend_from_slice(&(num(args[0]) as u16).to_be_bytes()),
                Some(1) => (),
                _ => panic!("don't know how to assemble {op}"),
            },
        }
        assert_eq!(
            code.len() as u32,
            bci + size(op, args, bci),
            "size mismatch for {op}"
        );
    }

    let handlers = catches
        .iter()
        .map(|args| ExceptionHandler {
            start_bci: label(args[0]),
            end_bci: label(args[1]),
            handler_bci: label(args[2]),
            catch_type_cpi: num(args[3]) as u16,
        })
        .collect();

    Assembled {
        code,
        handlers,
        labels,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn assemble_branches_and_switches() {
        let a = assemble(
            "
              iload_0
              ifeq L1
              iconst_1
              ireturn
            L1:
              iload_0
              tableswitch 0 default:L2 L1 L2
            L2:
              iinc 300 1
              iconst_0
              ireturn
            .catch L1 L2 L2 0
            ",
        );
        assert_eq!(&a.code[..7], &[0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x1a]);
        assert_eq!(a.labels["L1"], 6);
        // tableswitch at 7, padded to 8, 12 + 8 bytes of operands.
        assert_eq!(a.labels["L2"], 28);
        assert_eq!(&a.code[28..34], &[0xc4, 0x84, 0x01, 0x2c, 0x00, 0x01]);
        assert_eq!(a.handlers[0].handler_bci, 28);
        assert!(a.handlers[0].is_catch_all());
    }
}
