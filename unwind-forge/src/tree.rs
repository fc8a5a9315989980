//! Compact binary-search-tree serialization of one offset map, plus the
//! size fitter that packs a maximal entry prefix into a byte budget.
//!
//! Layout decisions, all in service of pointer compactness:
//! - a node's right subtree immediately follows it in the stream, so only a
//!   left-child offset is encoded;
//! - the left subtree always takes a perfectly-complete entry count, so the
//!   only incomplete leaf is the rightmost one;
//! - keys are short signed deltas from the parent key, values are
//!   variable-width rule ids, pointers are 1 or 3 bytes.
//!
//! The tree is built as owned typed nodes, sizes are computed bottom-up, and
//! bytes are emitted in one forward pass; a forward pointer is just the size
//! of the material between it and its target, which is known by then. The
//! wire codecs live here and are shared with the decoder in `lookup` so the
//! two sides cannot drift apart.

use unwind_forge_common::{
    KEY_BIAS, KEY_TWO_BYTE_BASE, KEY_TWO_BYTE_BIAS, KEY_WIDE_MARKER, LEAF_MARKER, PTR_LEAF_WIDE_BASE,
    PTR_MAX, PTR_ONE_BYTE_MAX, PTR_WIDE_BASE, VAL_MAX, VAL_ONE_BYTE_MAX, VAL_TWO_BYTE_BASE,
    VAL_TWO_BYTE_MAX, VAL_WIDE_MARKER,
};

use crate::error::{TreeError, UnwindError};

/// One offset-map entry: file offset, rule id.
pub type Entry = (u64, u32);

/// Empirical average serialized bytes per entry, used to seed and damp the
/// fitter's search.
const AVG_ENTRY_BYTES: f64 = 2.6;

const MAX_FIT_ITERATIONS: usize = 64;

// ---------------------------------------------------------------------------
// Wire codecs, shared by encoder and decoder.

pub(crate) fn encode_key(delta: i64, out: &mut Vec<u8>) {
    if (-KEY_BIAS..=KEY_BIAS).contains(&delta) {
        out.push((delta + KEY_BIAS) as u8);
    } else if (-KEY_TWO_BYTE_BIAS..KEY_TWO_BYTE_BIAS).contains(&delta) {
        let biased = (delta + KEY_TWO_BYTE_BIAS) as u16;
        out.push(KEY_TWO_BYTE_BASE | (biased >> 8) as u8);
        out.push((biased & 0xFF) as u8);
    } else {
        out.push(KEY_WIDE_MARKER);
        out.extend_from_slice(&delta.to_le_bytes());
    }
}

pub(crate) fn key_len(delta: i64) -> usize {
    if (-KEY_BIAS..=KEY_BIAS).contains(&delta) {
        1
    } else if (-KEY_TWO_BYTE_BIAS..KEY_TWO_BYTE_BIAS).contains(&delta) {
        2
    } else {
        9
    }
}

/// Decodes a key delta at `pos`, returning `(delta, bytes consumed)`.
pub(crate) fn decode_key(buf: &[u8], pos: usize) -> Option<(i64, usize)> {
    let b0 = *buf.get(pos)?;
    if b0 < KEY_WIDE_MARKER {
        Some((i64::from(b0) - KEY_BIAS, 1))
    } else if b0 == KEY_WIDE_MARKER {
        let bytes = buf.get(pos + 1..pos + 9)?;
        Some((i64::from_le_bytes(bytes.try_into().unwrap()), 9))
    } else {
        let b1 = *buf.get(pos + 1)?;
        let biased = (u16::from(b0 & 0x1F) << 8) | u16::from(b1);
        Some((i64::from(biased) - KEY_TWO_BYTE_BIAS, 2))
    }
}

pub(crate) fn encode_value(value: u32, out: &mut Vec<u8>) -> Result<(), TreeError> {
    if value <= VAL_ONE_BYTE_MAX {
        out.push(value as u8);
    } else if value <= VAL_TWO_BYTE_MAX {
        out.push(VAL_TWO_BYTE_BASE + (value >> 8) as u8);
        out.push((value & 0xFF) as u8);
    } else if value <= VAL_MAX {
        out.push(VAL_WIDE_MARKER);
        out.push((value >> 16) as u8);
        out.push((value >> 8) as u8);
        out.push(value as u8);
    } else {
        return Err(TreeError::ValueTooLarge);
    }
    Ok(())
}

pub(crate) fn value_len(value: u32) -> Result<usize, TreeError> {
    if value <= VAL_ONE_BYTE_MAX {
        Ok(1)
    } else if value <= VAL_TWO_BYTE_MAX {
        Ok(2)
    } else if value <= VAL_MAX {
        Ok(4)
    } else {
        Err(TreeError::ValueTooLarge)
    }
}

/// Decodes a value at `pos`, returning `(value, bytes consumed)`.
pub(crate) fn decode_value(buf: &[u8], pos: usize) -> Option<(u32, usize)> {
    let b0 = *buf.get(pos)?;
    if u32::from(b0) <= VAL_ONE_BYTE_MAX {
        Some((u32::from(b0), 1))
    } else if b0 < VAL_WIDE_MARKER {
        let b1 = *buf.get(pos + 1)?;
        Some((
            (u32::from(b0 - VAL_TWO_BYTE_BASE) << 8) | u32::from(b1),
            2,
        ))
    } else if b0 == VAL_WIDE_MARKER {
        let bytes = buf.get(pos + 1..pos + 4)?;
        Some((
            (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2]),
            4,
        ))
    } else {
        None
    }
}

pub(crate) fn encode_ptr(offset: usize, to_leaf: bool, out: &mut Vec<u8>) -> Result<(), TreeError> {
    if offset > PTR_MAX {
        return Err(TreeError::PointerTooLarge);
    }
    if !to_leaf && offset <= PTR_ONE_BYTE_MAX {
        out.push(offset as u8);
    } else {
        let base = if to_leaf { PTR_LEAF_WIDE_BASE } else { PTR_WIDE_BASE };
        out.push(base | (offset >> 16) as u8);
        out.extend_from_slice(&(offset as u16).to_le_bytes());
    }
    Ok(())
}

pub(crate) fn ptr_len(offset: usize, to_leaf: bool) -> Result<usize, TreeError> {
    if offset > PTR_MAX {
        Err(TreeError::PointerTooLarge)
    } else if !to_leaf && offset <= PTR_ONE_BYTE_MAX {
        Ok(1)
    } else {
        Ok(3)
    }
}

/// Decodes a pointer at `pos`, returning `(offset, target is leaf, bytes
/// consumed)`. The caller has already ruled out the inline leaf marker.
pub(crate) fn decode_ptr(buf: &[u8], pos: usize) -> Option<(usize, bool, usize)> {
    let b0 = *buf.get(pos)?;
    if usize::from(b0) <= PTR_ONE_BYTE_MAX {
        return Some((usize::from(b0), false, 1));
    }
    let to_leaf = match b0 & !0x03 {
        b if b == PTR_WIDE_BASE => false,
        b if b == PTR_LEAF_WIDE_BASE => true,
        _ => return None,
    };
    let low = buf.get(pos + 1..pos + 3)?;
    let offset = (usize::from(b0 & 0x03) << 16) | usize::from(u16::from_le_bytes(low.try_into().unwrap()));
    Some((offset, to_leaf, 3))
}

// ---------------------------------------------------------------------------
// Tree construction.

struct Node {
    /// Serialized size relative to this node's parent key, filled by
    /// `measure`.
    size: usize,
    kind: NodeKind,
}

enum NodeKind {
    Internal {
        entry: Entry,
        left: Box<Node>,
        /// `None` encodes as a zero key delta: "nothing past this point".
        right: Option<Box<Node>>,
    },
    Leaf {
        own: Entry,
        left: Option<Entry>,
        right: Option<Entry>,
    },
}

impl Node {
    fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }
}

/// Largest perfectly-complete entry count `2^m - 1` (m >= 2, leaves hold
/// three entries) not exceeding `limit`.
fn full_subtree_len(limit: usize) -> usize {
    debug_assert!(limit >= 3);
    let mut f = 3usize;
    while f * 2 + 1 <= limit {
        f = f * 2 + 1;
    }
    f
}

fn build_node(entries: &[Entry]) -> Node {
    let n = entries.len();
    debug_assert!(n > 0);
    if n <= 3 {
        // 1 entry: own only; 2: left + own; 3: left + own + right. The left
        // slot fills first so the irregular remainder stays rightmost.
        let kind = match entries {
            [own] => NodeKind::Leaf {
                own: *own,
                left: None,
                right: None,
            },
            [left, own] => NodeKind::Leaf {
                own: *own,
                left: Some(*left),
                right: None,
            },
            [left, own, right] => NodeKind::Leaf {
                own: *own,
                left: Some(*left),
                right: Some(*right),
            },
            _ => unreachable!(),
        };
        return Node { size: 0, kind };
    }

    let f = full_subtree_len(n - 1);
    let left = Box::new(build_node(&entries[..f]));
    let right = if f + 1 < n {
        Some(Box::new(build_node(&entries[f + 1..])))
    } else {
        None
    };
    Node {
        size: 0,
        kind: NodeKind::Internal {
            entry: entries[f],
            left,
            right,
        },
    }
}

fn delta(key: u64, parent_key: u64) -> i64 {
    key.wrapping_sub(parent_key) as i64
}

/// Computes every node's serialized size bottom-up. `via_pointer` is true
/// when the node is reached through a leaf/internal pointer; a leaf reached
/// any other way needs its inline marker byte.
fn measure(node: &mut Node, parent_key: u64, via_pointer: bool) -> Result<usize, TreeError> {
    let size = match &mut node.kind {
        NodeKind::Leaf { own, left, right } => {
            let mut size = key_len(delta(own.0, parent_key));
            if !via_pointer {
                size += 1;
            }
            size += key_len(left.map_or(0, |l| delta(l.0, own.0)));
            size += value_len(left.map_or(0, |l| l.1))?;
            size += value_len(own.1)?;
            size += key_len(right.map_or(0, |r| delta(r.0, own.0)));
            size += value_len(right.map_or(0, |r| r.1))?;
            size
        }
        NodeKind::Internal { entry, left, right } => {
            let key = entry.0;
            let left_size = measure(left, key, true)?;
            let right_size = match right {
                Some(right) => measure(right, key, false)?,
                None => 1,
            };
            let vlen = value_len(entry.1)?;
            let plen = ptr_len(vlen + right_size, left.is_leaf())?;
            key_len(delta(key, parent_key)) + plen + vlen + right_size + left_size
        }
    };
    node.size = size;
    Ok(size)
}

fn emit(node: &Node, parent_key: u64, via_pointer: bool, out: &mut Vec<u8>) -> Result<(), TreeError> {
    match &node.kind {
        NodeKind::Leaf { own, left, right } => {
            encode_key(delta(own.0, parent_key), out);
            if !via_pointer {
                out.push(LEAF_MARKER);
            }
            encode_key(left.map_or(0, |l| delta(l.0, own.0)), out);
            encode_value(left.map_or(0, |l| l.1), out)?;
            encode_value(own.1, out)?;
            encode_key(right.map_or(0, |r| delta(r.0, own.0)), out);
            encode_value(right.map_or(0, |r| r.1), out)?;
        }
        NodeKind::Internal { entry, left, right } => {
            let key = entry.0;
            encode_key(delta(key, parent_key), out);
            let right_size = right.as_ref().map_or(1, |r| r.size);
            let vlen = value_len(entry.1)?;
            encode_ptr(vlen + right_size, left.is_leaf(), out)?;
            encode_value(entry.1, out)?;
            match right {
                Some(right) => emit(right, key, false, out)?,
                None => encode_key(0, out),
            }
            emit(left, key, true, out)?;
        }
    }
    Ok(())
}

/// Serializes a strictly-increasing entry sequence as one compact tree.
/// An empty sequence encodes as a single terminator byte.
pub(crate) fn encode_tree(entries: &[Entry]) -> Result<Vec<u8>, TreeError> {
    let mut out = Vec::new();
    if entries.is_empty() {
        encode_key(0, &mut out);
        return Ok(out);
    }
    let mut root = build_node(entries);
    let size = measure(&mut root, 0, false)?;
    out.reserve(size);
    emit(&root, 0, false, &mut out)?;
    debug_assert_eq!(out.len(), size);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Size fitter.

/// Outcome of a fit: how many leading entries were included and their
/// serialized tree. `count == 0` means nothing fit.
pub struct FitResult {
    pub count: usize,
    pub bytes: Vec<u8>,
}

/// Finds the largest entry prefix whose serialized tree fits `budget` bytes.
///
/// Damped secant search over a `[fits, overflows)` bracket: seed at
/// `budget / 2.6` entries, adjust by `|size delta| / 2.6` per round, fall
/// back to bisection whenever a step leaves the bracket, and treat
/// `PointerTooLarge` as an overflow signal. The bracket is run down to a
/// single count, so the result is the exact maximum and a larger budget
/// never yields fewer entries.
pub fn fit_entries(entries: &[Entry], budget: usize) -> Result<FitResult, UnwindError> {
    let empty = FitResult {
        count: 0,
        bytes: Vec::new(),
    };
    if entries.is_empty() || budget == 0 {
        return Ok(empty);
    }

    let mut lo = 0usize;
    let mut lo_bytes = Vec::new();
    let mut hi = entries.len() + 1;
    let mut candidate = ((budget as f64 / AVG_ENTRY_BYTES) as usize).clamp(1, entries.len());

    for _ in 0..MAX_FIT_ITERATIONS {
        if candidate <= lo || candidate >= hi {
            // The secant step left the known bracket; bisect instead.
            candidate = (lo + hi) / 2;
        }
        match encode_tree(&entries[..candidate]) {
            Err(TreeError::PointerTooLarge) => {
                hi = candidate;
                candidate = (lo + hi) / 2;
            }
            Err(TreeError::ValueTooLarge) => {
                return Err(UnwindError::InternalError(
                    "rule id exceeds the value encoding range".into(),
                ));
            }
            Ok(bytes) if bytes.len() <= budget => {
                let fits_all = candidate == entries.len();
                let grow = ((budget - bytes.len()) as f64 / AVG_ENTRY_BYTES) as usize;
                lo = candidate;
                lo_bytes = bytes;
                if fits_all {
                    break;
                }
                candidate = lo + grow.max(1);
            }
            Ok(bytes) => {
                let shrink = ((bytes.len() - budget) as f64 / AVG_ENTRY_BYTES) as usize;
                hi = candidate;
                candidate = candidate.saturating_sub(shrink.max(1));
            }
        }
        if hi <= lo + 1 {
            break;
        }
    }

    Ok(FitResult {
        count: lo,
        bytes: lo_bytes,
    })
}
