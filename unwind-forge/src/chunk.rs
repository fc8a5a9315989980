//! Packs one object's offset map into fixed-size table chunks.
//!
//! Chunks never span objects, so a whole object can be staged in memory and
//! thrown away if a later row fails to parse.

use unwind_forge_common::{CHUNK_SIZE, CHUNK_SLACK};

use crate::error::UnwindError;
use crate::tree::{fit_entries, Entry};

/// One split boundary: the table chunk and in-chunk offset where the tree
/// segment covering `file_offset` onward begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SplitMarker {
    pub file_offset: u64,
    pub table_id: u32,
    pub start_in_table: u32,
}

/// An object's offset map, chunked. `markers[i].table_id` indexes into the
/// id range `[first_table_id, first_table_id + chunks.len())`.
pub(crate) struct ChunkedTables {
    pub chunks: Vec<Vec<u8>>,
    pub markers: Vec<SplitMarker>,
}

/// Serializes `entries` as a sequence of compact-tree segments packed into
/// 256 KiB chunks. A fresh chunk starts when the current one is within the
/// slack of capacity or the fitter cannot place a single entry in what is
/// left. Each emitted chunk is zero-padded to the full chunk size.
pub(crate) fn chunk_entries(
    entries: &[Entry],
    first_table_id: u32,
) -> Result<ChunkedTables, UnwindError> {
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut markers = Vec::new();
    let mut buf: Vec<u8> = Vec::new();
    let mut remaining = entries;

    while !remaining.is_empty() {
        let budget = (CHUNK_SIZE - CHUNK_SLACK).saturating_sub(buf.len());
        let fit = fit_entries(remaining, budget)?;
        if fit.count == 0 {
            if buf.is_empty() {
                // A single entry encodes in well under the chunk size.
                return Err(UnwindError::InternalError(
                    "offset-map entry does not fit an empty chunk".into(),
                ));
            }
            // Rollover: not even one entry fits the slack-reduced budget,
            // so the chunk ends at most one single-entry tree (under 18
            // bytes) short of that budget.
            buf.resize(CHUNK_SIZE, 0);
            chunks.push(std::mem::take(&mut buf));
            continue;
        }

        markers.push(SplitMarker {
            file_offset: remaining[0].0,
            table_id: first_table_id + chunks.len() as u32,
            start_in_table: buf.len() as u32,
        });
        buf.extend_from_slice(&fit.bytes);
        remaining = &remaining[fit.count..];
    }

    if !buf.is_empty() {
        buf.resize(CHUNK_SIZE, 0);
        chunks.push(buf);
    }

    Ok(ChunkedTables { chunks, markers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::predecessor;
    use crate::tree::encode_tree;

    fn entries(n: usize, stride: u64) -> Vec<Entry> {
        (0..n)
            .map(|i| (8 + i as u64 * stride, (i % 500) as u32 + 1))
            .collect()
    }

    #[test]
    fn test_small_map_is_one_chunk() {
        let entries = entries(1000, 16);
        let tables = chunk_entries(&entries, 5).unwrap();
        assert_eq!(tables.chunks.len(), 1);
        assert_eq!(tables.chunks[0].len(), CHUNK_SIZE);
        assert_eq!(
            tables.markers,
            vec![SplitMarker {
                file_offset: 8,
                table_id: 5,
                start_in_table: 0,
            }]
        );
    }

    #[test]
    fn test_empty_map_emits_nothing() {
        let tables = chunk_entries(&[], 0).unwrap();
        assert!(tables.chunks.is_empty());
        assert!(tables.markers.is_empty());
    }

    #[test]
    fn test_large_map_spans_chunks() {
        // Wide strides force 9-byte key deltas, so 60k entries overflow one
        // 256 KiB chunk.
        let entries = entries(60_000, 1 << 13);
        let tables = chunk_entries(&entries, 0).unwrap();
        assert!(tables.chunks.len() > 1, "{} chunks", tables.chunks.len());
        for chunk in &tables.chunks {
            assert_eq!(chunk.len(), CHUNK_SIZE);
        }
        // Markers are ordered by file offset, start at the first entry, and
        // reference consecutive table ids from the base.
        assert_eq!(tables.markers[0].file_offset, entries[0].0);
        assert_eq!(tables.markers[0].table_id, 0);
        assert!(tables
            .markers
            .windows(2)
            .all(|w| w[0].file_offset < w[1].file_offset));
        let last = tables.markers.last().unwrap();
        assert_eq!(last.table_id as usize, tables.chunks.len() - 1);
    }

    #[test]
    fn test_every_entry_resolvable_through_markers() {
        let entries = entries(60_000, 1 << 13);
        let tables = chunk_entries(&entries, 0).unwrap();
        // Resolve a sample of entries through the marker that governs each key.
        for &(key, value) in entries.iter().step_by(977) {
            let marker = tables
                .markers
                .iter()
                .rev()
                .find(|m| m.file_offset <= key)
                .unwrap();
            let chunk = &tables.chunks[marker.table_id as usize];
            let found = predecessor(chunk, marker.start_in_table, key).unwrap();
            assert_eq!(found, Some(value), "key {key}");
        }
    }

    #[test]
    fn test_non_final_chunks_filled_near_capacity() {
        let entries = entries(60_000, 1 << 13);
        let tables = chunk_entries(&entries, 0).unwrap();
        assert!(tables.chunks.len() > 1);
        // Chunk ids are consecutive across rollovers.
        for w in tables.markers.windows(2) {
            if w[1].start_in_table == 0 {
                assert_eq!(w[0].table_id + 1, w[1].table_id);
            }
        }
        // Reconstruct each chunk's used length from its last marker plus
        // that segment's encoded size (segments re-encode deterministically
        // from the entry range between adjacent markers).
        let mut used = vec![0usize; tables.chunks.len()];
        for (i, marker) in tables.markers.iter().enumerate() {
            let lo = entries.partition_point(|e| e.0 < marker.file_offset);
            let hi = tables
                .markers
                .get(i + 1)
                .map_or(entries.len(), |next| {
                    entries.partition_point(|e| e.0 < next.file_offset)
                });
            let segment = encode_tree(&entries[lo..hi]).unwrap();
            used[marker.table_id as usize] = marker.start_in_table as usize + segment.len();
        }
        // A filled chunk stops only once one more entry cannot fit, so it
        // reaches within one single-entry tree of the slack-reduced budget.
        const SINGLE_ENTRY_MAX: usize = 18;
        for (id, &len) in used[..used.len() - 1].iter().enumerate() {
            assert!(
                len >= CHUNK_SIZE - CHUNK_SLACK - SINGLE_ENTRY_MAX,
                "chunk {id} used only {len} bytes"
            );
            assert!(len <= CHUNK_SIZE - CHUNK_SLACK, "chunk {id} used {len}");
        }
    }
}
