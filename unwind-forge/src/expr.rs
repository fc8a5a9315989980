//! DWARF expression compiler and the paired stack-machine interpreter.
//!
//! CFA and register expressions are recompiled into a tiny fixed opcode set
//! so the constrained lookup side never needs a DWARF parser. Operands are
//! widened to 64 bits and register numbers to 8 bits, trading density for a
//! trivially decodable stream. The interpreter here is the reference decoder
//! for that stream: fixed 16-slot stack, one bounded loop, no allocation.

use gimli::{EndianSlice, Operation, RunTimeEndian};
use unwind_forge_common::{
    EXPR_MAX_BYTES, EXPR_MAX_OPS, EXPR_STACK_DEPTH, OP_AND, OP_BREG, OP_CONST, OP_DEREF, OP_GE,
    OP_MUL, OP_PLUS, OP_PLUS_CONST, OP_SHL,
};

use crate::error::UnwindError;

/// One instruction of the compiled expression vocabulary.
///
/// Literal/register shorthand DWARF ops (`lit0..31`, `breg0..31`) arrive from
/// gimli already normalized into explicit-operand forms, so `Const` and `Breg`
/// cover them all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOp {
    Const(u64),
    Breg { reg: u8, offset: i64 },
    And,
    Ge,
    Shl,
    Plus,
    Mul,
    PlusConst(u64),
    Deref,
}

/// Translates raw DWARF expression bytes into the fixed opcode set.
///
/// Operators outside the supported set (calls, conversions, typed derefs,
/// plain register locations, ...) are a hard `ParseError`: the object that
/// contains them gets no unwind table at all rather than a wrong one.
pub fn compile_expression(
    bytes: &[u8],
    encoding: gimli::Encoding,
    endian: RunTimeEndian,
) -> Result<Vec<ExprOp>, UnwindError> {
    let expr = gimli::Expression(EndianSlice::new(bytes, endian));
    let mut iter = expr.operations(encoding);
    let mut ops = Vec::new();

    loop {
        let op = match iter.next() {
            Ok(Some(op)) => op,
            Ok(None) => break,
            Err(e) => return Err(UnwindError::ParseError(format!("bad expression: {e}"))),
        };
        if ops.len() >= EXPR_MAX_OPS {
            return Err(UnwindError::ParseError(format!(
                "expression exceeds {EXPR_MAX_OPS} instructions"
            )));
        }
        let compiled = match op {
            Operation::UnsignedConstant { value } => ExprOp::Const(value),
            Operation::SignedConstant { value } => ExprOp::Const(value as u64),
            Operation::RegisterOffset {
                register, offset, ..
            } => {
                let reg = u8::try_from(register.0).map_err(|_| {
                    UnwindError::ParseError(format!("register {} out of range", register.0))
                })?;
                ExprOp::Breg { reg, offset }
            }
            Operation::And => ExprOp::And,
            Operation::Ge => ExprOp::Ge,
            Operation::Shl => ExprOp::Shl,
            Operation::Plus => ExprOp::Plus,
            Operation::Mul => ExprOp::Mul,
            Operation::PlusConstant { value } => ExprOp::PlusConst(value),
            Operation::Deref { .. } => ExprOp::Deref,
            other => {
                return Err(UnwindError::ParseError(format!(
                    "unsupported expression operator {other:?}"
                )))
            }
        };
        ops.push(compiled);
    }

    if ops.is_empty() {
        return Err(UnwindError::ParseError("empty expression".into()));
    }
    Ok(ops)
}

/// Serializes a compiled expression as `[count][bytecode...]`, unpadded.
/// The emitted blob is this padded with zeros to `EXPR_BLOB_SIZE`.
pub fn serialize(ops: &[ExprOp]) -> Result<Vec<u8>, UnwindError> {
    if ops.len() > EXPR_MAX_OPS {
        return Err(UnwindError::ParseError(format!(
            "expression exceeds {EXPR_MAX_OPS} instructions"
        )));
    }
    let mut out = vec![ops.len() as u8];
    for op in ops {
        match *op {
            ExprOp::Const(v) => {
                out.push(OP_CONST);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ExprOp::Breg { reg, offset } => {
                out.push(OP_BREG);
                out.push(reg);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            ExprOp::And => out.push(OP_AND),
            ExprOp::Ge => out.push(OP_GE),
            ExprOp::Shl => out.push(OP_SHL),
            ExprOp::Plus => out.push(OP_PLUS),
            ExprOp::Mul => out.push(OP_MUL),
            ExprOp::PlusConst(v) => {
                out.push(OP_PLUS_CONST);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ExprOp::Deref => out.push(OP_DEREF),
        }
    }
    if out.len() - 1 > EXPR_MAX_BYTES {
        return Err(UnwindError::ParseError(format!(
            "expression bytecode exceeds {EXPR_MAX_BYTES} bytes"
        )));
    }
    Ok(out)
}

/// Why an expression evaluation stopped. Any of these aborts the current
/// unwind step only; the walk ends with the frames collected so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalError {
    StackOverflow,
    StackUnderflow,
    TruncatedProgram,
    BadOpcode,
    BadRegister,
    MemoryRead,
}

/// Evaluates a serialized expression (`[count][bytecode...]`, padding
/// tolerated) against the caller's register file and memory.
///
/// `read_reg` yields the current value of a DWARF register, `read_mem` reads
/// a u64 from an address. Comparison is signed, arithmetic wraps, and every
/// loop is bounded by the instruction-count byte (itself capped at
/// `EXPR_MAX_OPS`), matching the constrained consumer's contract.
pub fn evaluate<R, M>(program: &[u8], read_reg: R, read_mem: M) -> Result<u64, EvalError>
where
    R: Fn(u8) -> Option<u64>,
    M: Fn(u64) -> Option<u64>,
{
    let count = *program.first().ok_or(EvalError::TruncatedProgram)? as usize;
    if count > EXPR_MAX_OPS {
        return Err(EvalError::BadOpcode);
    }

    let mut stack = [0u64; EXPR_STACK_DEPTH];
    let mut depth = 0usize;
    let mut pos = 1usize;

    fn take<'a>(program: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], EvalError> {
        let bytes = program
            .get(*pos..*pos + n)
            .ok_or(EvalError::TruncatedProgram)?;
        *pos += n;
        Ok(bytes)
    }

    for _ in 0..count {
        let opcode = *program.get(pos).ok_or(EvalError::TruncatedProgram)?;
        pos += 1;
        match opcode {
            OP_CONST => {
                let v = u64::from_le_bytes(take(program, &mut pos, 8)?.try_into().unwrap());
                push(&mut stack, &mut depth, v)?;
            }
            OP_BREG => {
                let reg = *program.get(pos).ok_or(EvalError::TruncatedProgram)?;
                pos += 1;
                let offset = i64::from_le_bytes(take(program, &mut pos, 8)?.try_into().unwrap());
                let base = read_reg(reg).ok_or(EvalError::BadRegister)?;
                push(&mut stack, &mut depth, base.wrapping_add_signed(offset))?;
            }
            OP_PLUS_CONST => {
                let v = u64::from_le_bytes(take(program, &mut pos, 8)?.try_into().unwrap());
                let top = pop(&stack, &mut depth)?;
                push(&mut stack, &mut depth, top.wrapping_add(v))?;
            }
            OP_DEREF => {
                let addr = pop(&stack, &mut depth)?;
                let value = read_mem(addr).ok_or(EvalError::MemoryRead)?;
                push(&mut stack, &mut depth, value)?;
            }
            OP_AND | OP_GE | OP_SHL | OP_PLUS | OP_MUL => {
                let b = pop(&stack, &mut depth)?;
                let a = pop(&stack, &mut depth)?;
                let v = match opcode {
                    OP_AND => a & b,
                    OP_GE => ((a as i64) >= (b as i64)) as u64,
                    OP_SHL => a.wrapping_shl(b as u32),
                    OP_PLUS => a.wrapping_add(b),
                    OP_MUL => a.wrapping_mul(b),
                    _ => unreachable!(),
                };
                push(&mut stack, &mut depth, v)?;
            }
            _ => return Err(EvalError::BadOpcode),
        }
    }

    pop(&stack, &mut depth)
}

fn push(stack: &mut [u64; EXPR_STACK_DEPTH], depth: &mut usize, v: u64) -> Result<(), EvalError> {
    if *depth >= EXPR_STACK_DEPTH {
        return Err(EvalError::StackOverflow);
    }
    stack[*depth] = v;
    *depth += 1;
    Ok(())
}

fn pop(stack: &[u64; EXPR_STACK_DEPTH], depth: &mut usize) -> Result<u64, EvalError> {
    if *depth == 0 {
        return Err(EvalError::StackUnderflow);
    }
    *depth -= 1;
    Ok(stack[*depth])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(ops: &[ExprOp], regs: &[(u8, u64)]) -> Result<u64, EvalError> {
        let program = serialize(ops).unwrap();
        evaluate(
            &program,
            |r| regs.iter().find(|(n, _)| *n == r).map(|(_, v)| *v),
            |_| None,
        )
    }

    #[test]
    fn test_const_plus() {
        let v = run(&[ExprOp::Const(40), ExprOp::PlusConst(2)], &[]).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn test_plt_stub_expression() {
        // The glibc PLT pattern: rsp+8 + (((rip & 15) >= 11) << 3).
        let ops = [
            ExprOp::Breg { reg: 7, offset: 8 },
            ExprOp::Breg { reg: 16, offset: 0 },
            ExprOp::Const(15),
            ExprOp::And,
            ExprOp::Const(11),
            ExprOp::Ge,
            ExprOp::Const(3),
            ExprOp::Shl,
            ExprOp::Plus,
        ];
        let rsp = 0x7fff_0000u64;
        // rip & 15 == 12 >= 11, so the CFA gains an extra 8 bytes.
        let v = run(&ops, &[(7, rsp), (16, 0x40_104c)]).unwrap();
        assert_eq!(v, rsp + 16);
        // rip & 15 == 2 < 11: no adjustment.
        let v = run(&ops, &[(7, rsp), (16, 0x40_1042)]).unwrap();
        assert_eq!(v, rsp + 8);
    }

    #[test]
    fn test_deref_reads_memory() {
        let program = serialize(&[ExprOp::Breg { reg: 7, offset: 16 }, ExprOp::Deref]).unwrap();
        let v = evaluate(
            &program,
            |r| (r == 7).then_some(0x1000),
            |addr| (addr == 0x1010).then_some(0xdead_beef),
        )
        .unwrap();
        assert_eq!(v, 0xdead_beef);
    }

    #[test]
    fn test_underflow_and_bad_register() {
        assert_eq!(run(&[ExprOp::Plus], &[]), Err(EvalError::StackUnderflow));
        assert_eq!(
            run(&[ExprOp::Breg { reg: 3, offset: 0 }], &[]),
            Err(EvalError::BadRegister)
        );
    }

    #[test]
    fn test_overflow() {
        let mut ops = Vec::new();
        for _ in 0..EXPR_STACK_DEPTH + 1 {
            ops.push(ExprOp::Const(1));
        }
        assert_eq!(run(&ops, &[]), Err(EvalError::StackOverflow));
    }

    #[test]
    fn test_op_bound_enforced_by_serializer() {
        let ops = vec![ExprOp::Const(0); EXPR_MAX_OPS + 1];
        assert!(matches!(
            serialize(&ops),
            Err(UnwindError::ParseError(_))
        ));
    }

    #[test]
    fn test_padding_tolerated() {
        let mut program = serialize(&[ExprOp::Const(7)]).unwrap();
        program.resize(unwind_forge_common::EXPR_BLOB_SIZE, 0);
        assert_eq!(evaluate(&program, |_| None, |_| None), Ok(7));
    }
}
