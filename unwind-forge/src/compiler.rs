//! The build driver: owns the sink, the dedup tables, the id counters, and
//! the per-path object registry.
//!
//! Building an object is transactional. Rows and expressions get tentative
//! ids while the object is being extracted; only when the whole object
//! succeeds are the ids committed and the blobs emitted. A failed object
//! therefore contributes nothing, and its cached error is returned on every
//! later attempt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use unwind_forge_common::{EXPR_BLOB_SIZE, UNWIND_ROW_SIZE};

use crate::chunk::{chunk_entries, SplitMarker};
use crate::compose::{exec_regions, AddressSpaceComposer};
use crate::ehframe::{extract_offset_map, map_object, RowInterner};
use crate::error::UnwindError;
use crate::expr::{serialize, ExprOp};
use crate::rules::UnwindRow;
use crate::sink::{BlobKind, TableSink};

enum ObjectState {
    Built {
        oid: u32,
        markers: Vec<SplitMarker>,
    },
    Failed(UnwindError),
}

/// Compiles object files and process address spaces into emitted blobs.
/// All mutable build state lives here, so independent compilers can run
/// in parallel even though a single build is single-threaded.
pub struct UnwindCompiler<S> {
    sink: S,
    row_ids: HashMap<[u8; UNWIND_ROW_SIZE], u32>,
    expr_ids: HashMap<Vec<u8>, u32>,
    next_rule_id: u32,
    next_expr_id: u32,
    next_table_id: u32,
    next_oid: u32,
    objects: HashMap<PathBuf, ObjectState>,
}

/// Hands out tentative ids on top of the committed dedup tables. Dropped
/// wholesale when the object fails.
struct StagingInterner<'a> {
    committed_rows: &'a HashMap<[u8; UNWIND_ROW_SIZE], u32>,
    committed_exprs: &'a HashMap<Vec<u8>, u32>,
    new_rows: Vec<([u8; UNWIND_ROW_SIZE], u32)>,
    new_row_ids: HashMap<[u8; UNWIND_ROW_SIZE], u32>,
    new_exprs: Vec<(Vec<u8>, u32)>,
    new_expr_ids: HashMap<Vec<u8>, u32>,
    next_rule_id: u32,
    next_expr_id: u32,
}

impl RowInterner for StagingInterner<'_> {
    fn intern_expression(&mut self, ops: &[ExprOp]) -> Result<u32, UnwindError> {
        let bytes = serialize(ops)?;
        if let Some(&id) = self
            .committed_exprs
            .get(&bytes)
            .or_else(|| self.new_expr_ids.get(&bytes))
        {
            return Ok(id);
        }
        let id = self.next_expr_id;
        self.next_expr_id += 1;
        self.new_exprs.push((bytes.clone(), id));
        self.new_expr_ids.insert(bytes, id);
        Ok(id)
    }

    fn intern_row(&mut self, row: &UnwindRow) -> Result<u32, UnwindError> {
        let bytes = row.encode()?;
        if let Some(&id) = self
            .committed_rows
            .get(&bytes)
            .or_else(|| self.new_row_ids.get(&bytes))
        {
            return Ok(id);
        }
        let id = self.next_rule_id;
        self.next_rule_id += 1;
        self.new_rows.push((bytes, id));
        self.new_row_ids.insert(bytes, id);
        Ok(id)
    }
}

impl<S: TableSink> UnwindCompiler<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            row_ids: HashMap::new(),
            expr_ids: HashMap::new(),
            // id 0 is reserved in both spaces.
            next_rule_id: 1,
            next_expr_id: 1,
            next_table_id: 0,
            next_oid: 1,
            objects: HashMap::new(),
        }
    }

    /// Builds one object file's tables and emits them. Idempotent per path:
    /// the cached outcome, success or failure, is returned without rework.
    pub fn add_object_file(&mut self, path: &Path) -> Result<(), UnwindError> {
        if let Some(state) = self.objects.get(path) {
            return match state {
                ObjectState::Built { .. } => Ok(()),
                ObjectState::Failed(e) => Err(e.clone()),
            };
        }
        match self.build_object(path) {
            Ok(markers) => {
                let oid = self.next_oid;
                self.next_oid += 1;
                self.objects
                    .insert(path.to_path_buf(), ObjectState::Built { oid, markers });
                Ok(())
            }
            Err(e) => {
                tracing::debug!("unwind table build failed for {}: {e}", path.display());
                self.objects
                    .insert(path.to_path_buf(), ObjectState::Failed(e.clone()));
                Err(e)
            }
        }
    }

    fn build_object(&mut self, path: &Path) -> Result<Vec<SplitMarker>, UnwindError> {
        if self.next_oid >= u32::from(u16::MAX) {
            return Err(UnwindError::TooManyObjects);
        }
        let data = map_object(path)?;
        let mut staging = StagingInterner {
            committed_rows: &self.row_ids,
            committed_exprs: &self.expr_ids,
            new_rows: Vec::new(),
            new_row_ids: HashMap::new(),
            new_exprs: Vec::new(),
            new_expr_ids: HashMap::new(),
            next_rule_id: self.next_rule_id,
            next_expr_id: self.next_expr_id,
        };
        let entries = extract_offset_map(&data, &mut staging)?;
        let tables = chunk_entries(&entries, self.next_table_id)?;

        // Commit point: nothing below can fail.
        let StagingInterner {
            new_rows,
            new_exprs,
            next_rule_id,
            next_expr_id,
            ..
        } = staging;
        for (bytes, id) in new_rows {
            self.sink.write(BlobKind::UnwindEntries, id, bytes.to_vec());
            self.row_ids.insert(bytes, id);
        }
        for (bytes, id) in new_exprs {
            let mut blob = vec![0u8; EXPR_BLOB_SIZE];
            blob[..bytes.len()].copy_from_slice(&bytes);
            self.sink.write(BlobKind::Expressions, id, blob);
            self.expr_ids.insert(bytes, id);
        }
        self.next_rule_id = next_rule_id;
        self.next_expr_id = next_expr_id;

        let chunk_count = tables.chunks.len() as u32;
        for (i, chunk) in tables.chunks.into_iter().enumerate() {
            self.sink
                .write(BlobKind::UnwindTable, self.next_table_id + i as u32, chunk);
        }
        self.next_table_id += chunk_count;

        tracing::debug!(
            "built {}: {} entries, {} chunks",
            path.display(),
            entries.len(),
            chunk_count
        );
        Ok(tables.markers)
    }

    /// Reads the process's memory map, builds tables for every executable
    /// mapping whose object has not been seen yet (failures are skipped, not
    /// fatal), and emits the process's mappings blob.
    pub fn add_pid(&mut self, pid: u32) -> Result<(), UnwindError> {
        let regions = exec_regions(pid)?;
        let mut composer = AddressSpaceComposer::new();
        for region in &regions {
            if let Err(e) = self.add_object_file(&region.path) {
                tracing::debug!("no unwind table for {}: {e}", region.path.display());
                continue;
            }
            if let Some(ObjectState::Built { markers, .. }) = self.objects.get(&region.path) {
                composer.add_region(region, markers);
            }
        }
        self.sink.write(BlobKind::Mappings, pid, composer.finish());
        Ok(())
    }

    /// The object id assigned to a path, if it has been attempted: a real id
    /// for built objects, 0 for failed ones.
    pub fn object_id(&self, path: &Path) -> Option<u32> {
        match self.objects.get(path)? {
            ObjectState::Built { oid, .. } => Some(*oid),
            ObjectState::Failed(_) => Some(0),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{CfaRule, RegisterRule};
    use crate::sink::VecSink;

    fn row(cfa_offset: i64) -> UnwindRow {
        let mut row = UnwindRow::new(CfaRule::RegPlusOffset {
            reg: 7,
            offset: cfa_offset,
        });
        row.registers[16] = RegisterRule::Offset(-8);
        row
    }

    fn staging<'a>(
        rows: &'a HashMap<[u8; UNWIND_ROW_SIZE], u32>,
        exprs: &'a HashMap<Vec<u8>, u32>,
    ) -> StagingInterner<'a> {
        StagingInterner {
            committed_rows: rows,
            committed_exprs: exprs,
            new_rows: Vec::new(),
            new_row_ids: HashMap::new(),
            new_exprs: Vec::new(),
            new_expr_ids: HashMap::new(),
            next_rule_id: 1,
            next_expr_id: 1,
        }
    }

    #[test]
    fn test_interner_dedups_rows() {
        let rows = HashMap::new();
        let exprs = HashMap::new();
        let mut interner = staging(&rows, &exprs);
        let a = interner.intern_row(&row(8)).unwrap();
        let b = interner.intern_row(&row(16)).unwrap();
        let c = interner.intern_row(&row(8)).unwrap();
        assert_eq!((a, b, c), (1, 2, 1));
        assert_eq!(interner.new_rows.len(), 2);
    }

    #[test]
    fn test_interner_sees_committed_ids() {
        let mut rows = HashMap::new();
        rows.insert(row(8).encode().unwrap(), 42u32);
        let exprs = HashMap::new();
        let mut interner = staging(&rows, &exprs);
        assert_eq!(interner.intern_row(&row(8)).unwrap(), 42);
        assert!(interner.new_rows.is_empty());
        // A genuinely new row still gets the next dense id.
        assert_eq!(interner.intern_row(&row(16)).unwrap(), 1);
    }

    #[test]
    fn test_missing_object_is_cached_failure() {
        let mut compiler = UnwindCompiler::new(VecSink::new());
        let path = Path::new("/nonexistent/libmissing.so");
        let first = compiler.add_object_file(path).unwrap_err();
        assert!(matches!(first, UnwindError::FileNotFound(_)));
        let second = compiler.add_object_file(path).unwrap_err();
        assert!(matches!(second, UnwindError::FileNotFound(_)));
        assert_eq!(compiler.object_id(path), Some(0));
        assert!(compiler.sink().blobs.is_empty());
    }

    #[test]
    fn test_failed_object_emits_nothing() {
        let dir = std::env::temp_dir();
        let path = dir.join("unwind-forge-test-not-an-elf.bin");
        std::fs::write(&path, b"this is not an object file at all").unwrap();

        let mut compiler = UnwindCompiler::new(VecSink::new());
        let err = compiler.add_object_file(&path).unwrap_err();
        assert!(matches!(err, UnwindError::ParseError(_)), "{err}");
        assert!(compiler.sink().blobs.is_empty());
        assert_eq!(compiler.object_id(&path), Some(0));

        std::fs::remove_file(&path).ok();
    }
}
