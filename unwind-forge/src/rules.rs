//! Canonical unwind rows and their fixed 228-byte wire form.
//!
//! A row is the full register-recovery recipe for one address range: how to
//! compute the CFA, plus one rule per tracked register. Rows are immutable
//! and content-addressed; the serialized bytes double as the dedup key.
//!
//! Wire layout (little-endian): byte 0 format version, bytes 1..12 reserved
//! zero, then 18 twelve-byte slots: the CFA rule first, then DWARF registers
//! 0..=16. Expressions are referenced by id, never inlined.

use unwind_forge_common::{
    CFA_KIND_EXPRESSION, CFA_KIND_REG_OFFSET, REG_KIND_CONSTANT, REG_KIND_EXPRESSION,
    REG_KIND_OFFSET, REG_KIND_REGISTER, REG_KIND_SAME_VALUE, REG_KIND_UNDEFINED, REG_KIND_UNINIT,
    REG_KIND_VAL_EXPRESSION, REG_KIND_VAL_OFFSET, RULE_SLOT_SIZE, TRACKED_REGISTERS,
    UNWIND_ROW_SIZE, UNWIND_ROW_VERSION,
};

use crate::error::UnwindError;

/// How to compute the Call Frame Address for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfaRule {
    /// CFA = register value + offset.
    RegPlusOffset { reg: u8, offset: i64 },
    /// CFA = result of evaluating the referenced expression.
    Expression { id: u32 },
}

/// How to recover one register's caller value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RegisterRule {
    /// No rule was ever set for this register in this row.
    #[default]
    Uninitialized,
    /// The value is not recoverable.
    Undefined,
    /// The register still holds the caller's value.
    SameValue,
    /// Stored at CFA + offset.
    Offset(i64),
    /// The value is CFA + offset itself.
    ValOffset(i64),
    /// The value lives in another register.
    Register(u32),
    /// Stored at the address the referenced expression yields.
    Expression(u32),
    /// The value is what the referenced expression yields.
    ValExpression(u32),
    /// A known constant.
    Constant(i64),
}

/// One canonicalized unwind row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnwindRow {
    pub cfa: CfaRule,
    pub registers: [RegisterRule; TRACKED_REGISTERS],
}

impl UnwindRow {
    pub fn new(cfa: CfaRule) -> Self {
        Self {
            cfa,
            registers: [RegisterRule::Uninitialized; TRACKED_REGISTERS],
        }
    }

    /// Serializes the row into its canonical 228-byte form.
    pub fn encode(&self) -> Result<[u8; UNWIND_ROW_SIZE], UnwindError> {
        let mut out = Vec::with_capacity(UNWIND_ROW_SIZE);
        out.push(UNWIND_ROW_VERSION);
        out.extend_from_slice(&[0u8; 11]);

        match self.cfa {
            CfaRule::RegPlusOffset { reg, offset } => {
                out.push(CFA_KIND_REG_OFFSET);
                out.push(reg);
                out.extend_from_slice(&[0u8; 2]);
                out.extend_from_slice(&(offset as u64).to_le_bytes());
            }
            CfaRule::Expression { id } => {
                out.push(CFA_KIND_EXPRESSION);
                out.extend_from_slice(&[0u8; 3]);
                out.extend_from_slice(&u64::from(id).to_le_bytes());
            }
        }

        for rule in &self.registers {
            let (kind, arg) = match *rule {
                RegisterRule::Uninitialized => (REG_KIND_UNINIT, 0),
                RegisterRule::Undefined => (REG_KIND_UNDEFINED, 0),
                RegisterRule::SameValue => (REG_KIND_SAME_VALUE, 0),
                RegisterRule::Offset(off) => (REG_KIND_OFFSET, off as u64),
                RegisterRule::ValOffset(off) => (REG_KIND_VAL_OFFSET, off as u64),
                RegisterRule::Register(reg) => (REG_KIND_REGISTER, u64::from(reg)),
                RegisterRule::Expression(id) => (REG_KIND_EXPRESSION, u64::from(id)),
                RegisterRule::ValExpression(id) => (REG_KIND_VAL_EXPRESSION, u64::from(id)),
                RegisterRule::Constant(v) => (REG_KIND_CONSTANT, v as u64),
            };
            out.push(kind);
            out.extend_from_slice(&[0u8; 3]);
            out.extend_from_slice(&arg.to_le_bytes());
        }

        <[u8; UNWIND_ROW_SIZE]>::try_from(out.as_slice()).map_err(|_| {
            UnwindError::InternalError(format!(
                "encoded row is {} bytes, expected {UNWIND_ROW_SIZE}",
                out.len()
            ))
        })
    }

    /// Decodes a row from its wire form. This is the lookup-side reader and
    /// must stay in lockstep with `encode`.
    pub fn decode(bytes: &[u8; UNWIND_ROW_SIZE]) -> Result<Self, UnwindError> {
        if bytes[0] != UNWIND_ROW_VERSION {
            return Err(UnwindError::ParseError(format!(
                "unknown row version {}",
                bytes[0]
            )));
        }

        let slot = |index: usize| {
            let at = 12 + index * RULE_SLOT_SIZE;
            let arg = u64::from_le_bytes(bytes[at + 4..at + RULE_SLOT_SIZE].try_into().unwrap());
            (bytes[at], bytes[at + 1], arg)
        };

        let (cfa_kind, cfa_reg, cfa_arg) = slot(0);
        let cfa = match cfa_kind {
            CFA_KIND_REG_OFFSET => CfaRule::RegPlusOffset {
                reg: cfa_reg,
                offset: cfa_arg as i64,
            },
            CFA_KIND_EXPRESSION => CfaRule::Expression {
                id: cfa_arg as u32,
            },
            other => {
                return Err(UnwindError::ParseError(format!(
                    "unknown CFA rule kind {other}"
                )))
            }
        };

        let mut registers = [RegisterRule::Uninitialized; TRACKED_REGISTERS];
        for (i, reg) in registers.iter_mut().enumerate() {
            let (kind, _, arg) = slot(1 + i);
            *reg = match kind {
                REG_KIND_UNINIT => RegisterRule::Uninitialized,
                REG_KIND_UNDEFINED => RegisterRule::Undefined,
                REG_KIND_SAME_VALUE => RegisterRule::SameValue,
                REG_KIND_OFFSET => RegisterRule::Offset(arg as i64),
                REG_KIND_VAL_OFFSET => RegisterRule::ValOffset(arg as i64),
                REG_KIND_REGISTER => RegisterRule::Register(arg as u32),
                REG_KIND_EXPRESSION => RegisterRule::Expression(arg as u32),
                REG_KIND_VAL_EXPRESSION => RegisterRule::ValExpression(arg as u32),
                REG_KIND_CONSTANT => RegisterRule::Constant(arg as i64),
                other => {
                    return Err(UnwindError::ParseError(format!(
                        "unknown register rule kind {other}"
                    )))
                }
            };
        }

        Ok(Self { cfa, registers })
    }
}
