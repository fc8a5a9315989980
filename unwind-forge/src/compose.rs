//! Per-process address-space composition: turns a process's executable
//! memory regions plus each object's split markers into the flat mapping
//! table the lookup side bisects.

use std::path::PathBuf;

use procfs::process::{MMPermissions, MMapPath, MemoryMap, Process};
use unwind_forge_common::{MappingRecord, MAPPINGS_BLOB_SIZE, MAPPING_RECORD_SIZE, MAX_MAPPINGS};

use crate::chunk::SplitMarker;
use crate::error::UnwindError;

/// One executable file-backed region of a process.
#[derive(Debug, Clone)]
pub(crate) struct ExecRegion {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub path: PathBuf,
}

fn is_executable(map: &MemoryMap) -> bool {
    let perms = map.perms;
    perms.contains(MMPermissions::EXECUTE) && perms.contains(MMPermissions::READ)
}

/// Reads `/proc/<pid>/maps` and keeps the executable, file-backed,
/// non-deleted regions.
pub(crate) fn exec_regions(pid: u32) -> Result<Vec<ExecRegion>, UnwindError> {
    let process = Process::new(pid as i32)
        .map_err(|e| UnwindError::FileNotFound(format!("/proc/{pid}: {e}")))?;
    let maps = process
        .maps()
        .map_err(|e| UnwindError::FileNotFound(format!("/proc/{pid}/maps: {e}")))?;

    let mut regions = Vec::new();
    for map in maps.iter() {
        if !is_executable(map) {
            continue;
        }
        let path = match &map.pathname {
            MMapPath::Path(path) => path,
            _ => continue,
        };
        let path_str = path.to_string_lossy();
        if !path_str.starts_with('/') {
            continue;
        }
        if path_str.ends_with(" (deleted)") {
            tracing::debug!("skipping deleted mapping {path_str}");
            continue;
        }
        regions.push(ExecRegion {
            start: map.address.0,
            end: map.address.1,
            offset: map.offset,
            path: PathBuf::from(path_str.as_ref()),
        });
    }
    Ok(regions)
}

/// Accumulates mapping records for one process. Records arrive in region
/// order, which `/proc/<pid>/maps` already sorts by start address; `finish`
/// still enforces the strict-increase invariant.
pub(crate) struct AddressSpaceComposer {
    records: Vec<MappingRecord>,
    truncated: bool,
}

impl AddressSpaceComposer {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            truncated: false,
        }
    }

    /// Maps one region through its object's split markers:
    /// - the governing marker (greatest `file_offset <= region.offset`)
    ///   anchors the region start;
    /// - every marker falling strictly inside the region's file-offset span
    ///   becomes its own record at the translated virtual address.
    pub fn add_region(&mut self, region: &ExecRegion, markers: &[SplitMarker]) {
        let region_len = region.end - region.start;

        if let Some(governing) = markers.iter().rev().find(|m| m.file_offset <= region.offset) {
            self.push(MappingRecord {
                vma_start: region.start,
                adjusted_file_offset: region.offset,
                table_id: governing.table_id,
                start_in_table: governing.start_in_table,
            });
        }

        for marker in markers {
            if marker.file_offset <= region.offset {
                continue;
            }
            if marker.file_offset >= region.offset + region_len {
                break;
            }
            self.push(MappingRecord {
                vma_start: region.start + (marker.file_offset - region.offset),
                adjusted_file_offset: marker.file_offset,
                table_id: marker.table_id,
                start_in_table: marker.start_in_table,
            });
        }
    }

    fn push(&mut self, record: MappingRecord) {
        if self.records.len() >= MAX_MAPPINGS {
            if !self.truncated {
                tracing::warn!(
                    "mapping table full ({MAX_MAPPINGS} records), dropping later mappings"
                );
                self.truncated = true;
            }
            return;
        }
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serializes the accumulated records as a fixed-size mappings blob,
    /// dropping any record that would break the strictly increasing
    /// `vma_start` order the bisection relies on.
    pub fn finish(self) -> Vec<u8> {
        let mut blob = vec![0u8; MAPPINGS_BLOB_SIZE];
        let mut count = 0u64;
        let mut prev: Option<u64> = None;
        for record in self.records {
            if prev.is_some_and(|p| record.vma_start <= p) {
                tracing::debug!(
                    "dropping out-of-order mapping at {:#x}",
                    record.vma_start
                );
                continue;
            }
            prev = Some(record.vma_start);
            let at = 8 + count as usize * MAPPING_RECORD_SIZE;
            blob[at..at + MAPPING_RECORD_SIZE].copy_from_slice(&record.to_bytes());
            count += 1;
        }
        blob[0..8].copy_from_slice(&count.to_le_bytes());
        blob
    }
}
