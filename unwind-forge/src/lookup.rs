//! Read-side algorithms over the emitted blobs: mapping bisection and the
//! compact-tree predecessor search.
//!
//! This is the reference decoder for the constrained consumer and is written
//! under the same contract: no allocation, no recursion, and a fixed step cap
//! on every loop. It shares the wire codecs with the encoder in `tree`, so a
//! format change breaks both sides together instead of silently skewing.

use unwind_forge_common::{
    MappingRecord, LEAF_MARKER, MAPPING_RECORD_SIZE, MAX_MAPPINGS, MAX_MAPPING_BISECT,
    MAX_TREE_DEPTH, RULE_ID_NONE,
};

use crate::tree::{decode_key, decode_ptr, decode_value};

/// Decode failures. `DepthExceeded` means a structural bound was blown
/// without resolving; callers stop the walk, they never retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    DepthExceeded,
    Corrupt,
}

/// Finds the mapping record with the greatest `vma_start <= ip` in a
/// serialized mappings blob. At most `MAX_MAPPING_BISECT` halving steps,
/// which covers the 1000-record cap.
pub fn find_mapping(blob: &[u8], ip: u64) -> Option<MappingRecord> {
    let count_bytes = blob.get(0..8)?;
    let count = (u64::from_le_bytes(count_bytes.try_into().unwrap()) as usize).min(MAX_MAPPINGS);
    if count == 0 {
        return None;
    }

    let record = |i: usize| -> Option<MappingRecord> {
        let at = 8 + i * MAPPING_RECORD_SIZE;
        let bytes: &[u8; MAPPING_RECORD_SIZE] = blob.get(at..at + MAPPING_RECORD_SIZE)?.try_into().ok()?;
        Some(MappingRecord::from_bytes(bytes))
    };

    let mut base = 0usize;
    let mut size = count;
    for _ in 0..MAX_MAPPING_BISECT {
        if size <= 1 {
            break;
        }
        let half = size / 2;
        if record(base + half)?.vma_start <= ip {
            base += half;
        }
        size -= half;
    }

    let found = record(base)?;
    (found.vma_start <= ip).then_some(found)
}

/// Predecessor search over one serialized compact tree: the value of the
/// greatest stored key `<= search_key`, or `None` if every stored key is
/// greater. `Some(RULE_ID_NONE)` means the address is covered by an explicit
/// "no rule" marker.
///
/// At most `MAX_TREE_DEPTH` node visits; a tree that needs more is treated
/// as corrupt.
pub fn predecessor(table: &[u8], start: u32, search_key: u64) -> Result<Option<u32>, LookupError> {
    let mut pos = start as usize;
    let mut parent_key = 0u64;
    let mut best: Option<u32> = None;
    // Set when the node was reached through a leaf pointer; otherwise
    // leaf-ness is signalled by the inline marker byte.
    let mut known_leaf = false;

    for _ in 0..MAX_TREE_DEPTH {
        let (delta, n) = decode_key(table, pos).ok_or(LookupError::Corrupt)?;
        if delta == 0 {
            // "Nothing past this point."
            return Ok(best);
        }
        let key = parent_key.wrapping_add(delta as u64);
        pos += n;

        let at_leaf = known_leaf
            || match table.get(pos) {
                Some(&LEAF_MARKER) => {
                    pos += 1;
                    true
                }
                _ => false,
            };

        if at_leaf {
            let (left_delta, n) = decode_key(table, pos).ok_or(LookupError::Corrupt)?;
            pos += n;
            let (left_value, n) = decode_value(table, pos).ok_or(LookupError::Corrupt)?;
            pos += n;
            let (own_value, n) = decode_value(table, pos).ok_or(LookupError::Corrupt)?;
            pos += n;
            let (right_delta, n) = decode_key(table, pos).ok_or(LookupError::Corrupt)?;
            pos += n;
            let (right_value, _) = decode_value(table, pos).ok_or(LookupError::Corrupt)?;

            return Ok(if search_key < key {
                if left_delta != 0 && search_key >= key.wrapping_add(left_delta as u64) {
                    Some(left_value)
                } else {
                    best
                }
            } else if right_delta != 0 && search_key >= key.wrapping_add(right_delta as u64) {
                Some(right_value)
            } else {
                Some(own_value)
            });
        }

        let (ptr_offset, to_leaf, n) = decode_ptr(table, pos).ok_or(LookupError::Corrupt)?;
        pos += n;
        let after_ptr = pos;
        let (value, n) = decode_value(table, pos).ok_or(LookupError::Corrupt)?;

        parent_key = key;
        if search_key < key {
            pos = after_ptr + ptr_offset;
            known_leaf = to_leaf;
        } else {
            best = Some(value);
            pos = after_ptr + n;
            known_leaf = false;
        }
    }

    Err(LookupError::DepthExceeded)
}

/// Full read path for one instruction pointer: bisect the process's mapping
/// table, translate the ip to a file-offset search key, and run the
/// predecessor search in the referenced chunk. Returns the governing rule id,
/// with the explicit no-rule marker folded into `None`.
pub fn resolve_rule<'a, F>(
    mappings: &[u8],
    chunk_for_table: F,
    ip: u64,
) -> Result<Option<u32>, LookupError>
where
    F: Fn(u32) -> Option<&'a [u8]>,
{
    let Some(mapping) = find_mapping(mappings, ip) else {
        return Ok(None);
    };
    let Some(chunk) = chunk_for_table(mapping.table_id) else {
        return Ok(None);
    };
    let search_key = mapping
        .adjusted_file_offset
        .wrapping_add(ip - mapping.vma_start);
    let rule = predecessor(chunk, mapping.start_in_table, search_key)?;
    Ok(rule.filter(|&id| id != RULE_ID_NONE))
}
