#![no_std]

//! Wire-format constants shared between the unwind-table compiler and the
//! constrained lookup side. Everything here must stay bit-compatible with
//! whatever consumes the emitted blobs, so sizes and marker bytes are
//! spelled out as plain constants rather than derived.

/// Number of tracked registers per unwind row (x86_64 DWARF registers 0..=16,
/// i.e. the general-purpose registers plus the return-address register).
pub const TRACKED_REGISTERS: usize = 17;

/// Serialized size of one unwind row: a 12-byte header followed by 18
/// 12-byte rule slots (CFA first, then the tracked registers).
pub const UNWIND_ROW_SIZE: usize = 12 + (1 + TRACKED_REGISTERS) * RULE_SLOT_SIZE;

/// Size of one rule slot inside a serialized row.
pub const RULE_SLOT_SIZE: usize = 12;

/// Current unwind-row format version, stored in byte 0 of the row.
pub const UNWIND_ROW_VERSION: u8 = 1;

/// Fixed size of an emitted expression blob: one instruction-count byte plus
/// up to 255 bytes of bytecode, zero-padded.
pub const EXPR_BLOB_SIZE: usize = 256;

/// Maximum bytecode payload of one expression.
pub const EXPR_MAX_BYTES: usize = EXPR_BLOB_SIZE - 1;

/// Maximum instruction count of one compiled expression.
pub const EXPR_MAX_OPS: usize = 32;

/// Evaluation stack depth of the expression interpreter.
pub const EXPR_STACK_DEPTH: usize = 16;

/// Fixed size of one unwind-table chunk (the consumer's value size).
pub const CHUNK_SIZE: usize = 256 * 1024;

/// A chunk is considered full once less than this many bytes remain.
pub const CHUNK_SLACK: usize = 200;

/// Maximum number of mapping records per process.
pub const MAX_MAPPINGS: usize = 1000;

/// Serialized size of one mapping record.
pub const MAPPING_RECORD_SIZE: usize = 24;

/// Fixed size of a per-process mappings blob: u64 count header plus the
/// full record array, zero-padded.
pub const MAPPINGS_BLOB_SIZE: usize = 8 + MAX_MAPPINGS * MAPPING_RECORD_SIZE;

/// Step bound for the mapping binary search (2^10 covers `MAX_MAPPINGS`).
pub const MAX_MAPPING_BISECT: usize = 10;

/// Step bound for the tree predecessor search (2^17 entries per chunk is
/// more than a full chunk can hold).
pub const MAX_TREE_DEPTH: usize = 17;

/// Rule id reserved for "no unwind rule from here until the next entry".
pub const RULE_ID_NONE: u32 = 0;

// CFA rule kinds (slot 0 of a serialized row).
pub const CFA_KIND_REG_OFFSET: u8 = 1;
pub const CFA_KIND_EXPRESSION: u8 = 2;

// Register rule kinds (slots 1..=17 of a serialized row).
pub const REG_KIND_UNINIT: u8 = 0;
pub const REG_KIND_UNDEFINED: u8 = 1;
pub const REG_KIND_SAME_VALUE: u8 = 2;
pub const REG_KIND_OFFSET: u8 = 3;
pub const REG_KIND_VAL_OFFSET: u8 = 4;
pub const REG_KIND_REGISTER: u8 = 5;
pub const REG_KIND_EXPRESSION: u8 = 6;
pub const REG_KIND_VAL_EXPRESSION: u8 = 7;
pub const REG_KIND_CONSTANT: u8 = 8;

// Expression opcodes. Operands are widened to 64 bits on the wire.
pub const OP_CONST: u8 = 1;
pub const OP_BREG: u8 = 2;
pub const OP_AND: u8 = 3;
pub const OP_GE: u8 = 4;
pub const OP_SHL: u8 = 5;
pub const OP_PLUS: u8 = 6;
pub const OP_MUL: u8 = 7;
pub const OP_PLUS_CONST: u8 = 8;
pub const OP_DEREF: u8 = 9;

// Compact-tree key encoding: one byte stores `delta + KEY_BIAS` for deltas in
// [-KEY_BIAS, KEY_BIAS]; KEY_WIDE_MARKER is followed by an 8-byte LE i64;
// bytes >= KEY_TWO_BYTE_BASE carry the top 5 bits of `delta + KEY_TWO_BYTE_BIAS`
// (13 bits total) with the low 8 bits in the following byte.
pub const KEY_BIAS: i64 = 111;
pub const KEY_WIDE_MARKER: u8 = 0xDF;
pub const KEY_TWO_BYTE_BASE: u8 = 0xE0;
pub const KEY_TWO_BYTE_BIAS: i64 = 4096;

// Compact-tree pointer encoding: offsets 0..=PTR_ONE_BYTE_MAX to an internal
// node are one byte; larger internal offsets use PTR_WIDE_BASE | (off >> 16)
// plus a u16 LE; pointers whose target is a leaf use the disjoint
// PTR_LEAF_WIDE_BASE marker range. Offsets above PTR_MAX do not encode.
pub const PTR_ONE_BYTE_MAX: usize = 0xCF;
pub const PTR_WIDE_BASE: u8 = 0xD0;
pub const PTR_LEAF_WIDE_BASE: u8 = 0xD8;
pub const PTR_MAX: usize = 0x3FFFF;

/// Marker byte after a leaf's own key when the leaf was not reached through a
/// leaf pointer. Disjoint from every pointer lead byte.
pub const LEAF_MARKER: u8 = 0xFF;

// Compact-tree value encoding: one byte up to VAL_ONE_BYTE_MAX; two bytes
// `VAL_TWO_BYTE_BASE + (v >> 8), v & 0xFF` up to VAL_TWO_BYTE_MAX; otherwise
// VAL_WIDE_MARKER plus 3 bytes big-endian. Values above VAL_MAX do not encode.
pub const VAL_ONE_BYTE_MAX: u32 = 0xF6;
pub const VAL_TWO_BYTE_BASE: u8 = 0xF7;
pub const VAL_TWO_BYTE_MAX: u32 = 0x3FF;
pub const VAL_WIDE_MARKER: u8 = 0xFB;
pub const VAL_MAX: u32 = 0xFF_FFFF;

/// One record of a per-process mappings blob.
///
/// `adjusted_file_offset` is the file offset that corresponds to `vma_start`,
/// so the lookup side recovers the tree search key as
/// `adjusted_file_offset + (ip - vma_start)`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(C)]
pub struct MappingRecord {
    pub vma_start: u64,
    pub adjusted_file_offset: u64,
    pub table_id: u32,
    pub start_in_table: u32,
}

impl MappingRecord {
    /// Serializes the record into its 24-byte little-endian wire form.
    pub fn to_bytes(&self) -> [u8; MAPPING_RECORD_SIZE] {
        let mut out = [0u8; MAPPING_RECORD_SIZE];
        out[0..8].copy_from_slice(&self.vma_start.to_le_bytes());
        out[8..16].copy_from_slice(&self.adjusted_file_offset.to_le_bytes());
        out[16..20].copy_from_slice(&self.table_id.to_le_bytes());
        out[20..24].copy_from_slice(&self.start_in_table.to_le_bytes());
        out
    }

    /// Reads a record back from its wire form.
    pub fn from_bytes(bytes: &[u8; MAPPING_RECORD_SIZE]) -> Self {
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        let vma_start = u64_at(0);
        let adjusted_file_offset = u64_at(8);
        let u32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        Self {
            vma_start,
            adjusted_file_offset,
            table_id: u32_at(16),
            start_in_table: u32_at(20),
        }
    }
}
