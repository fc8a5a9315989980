//! Integration tests for the unwind-table compiler.
//!
//! Real binaries are allowed to fail compilation: the compiler rejects a
//! whole object as soon as it contains one rule outside the supported
//! vocabulary. These tests therefore assert the emitted blobs' invariants
//! when compilation succeeds, and a clean error with zero emissions when it
//! does not.

use std::path::Path;

use unwind_forge::rules::UnwindRow;
use unwind_forge::{lookup, BlobKind, UnwindCompiler, UnwindError, VecSink};
use unwind_forge_common::{
    CHUNK_SIZE, EXPR_BLOB_SIZE, MAPPINGS_BLOB_SIZE, MAPPING_RECORD_SIZE, MAX_MAPPINGS,
    MappingRecord, UNWIND_ROW_SIZE,
};

fn assert_blob_invariants(sink: &VecSink) {
    let mut rule_ids: Vec<u32> = sink.of_kind(BlobKind::UnwindEntries).map(|(k, _)| k).collect();
    rule_ids.sort_unstable();
    // Dense ids from 1, one emission per id.
    for (i, id) in rule_ids.iter().enumerate() {
        assert_eq!(*id as usize, i + 1, "rule ids must be dense from 1");
    }

    for (id, bytes) in sink.of_kind(BlobKind::UnwindEntries) {
        assert_eq!(bytes.len(), UNWIND_ROW_SIZE, "row {id}");
        let fixed: &[u8; UNWIND_ROW_SIZE] = bytes.try_into().unwrap();
        UnwindRow::decode(fixed).expect("emitted rows must decode");
    }
    for (id, bytes) in sink.of_kind(BlobKind::Expressions) {
        assert_eq!(bytes.len(), EXPR_BLOB_SIZE, "expression {id}");
        let count = bytes[0] as usize;
        assert!(count > 0, "expression {id} has no instructions");
    }
    for (id, bytes) in sink.of_kind(BlobKind::UnwindTable) {
        assert_eq!(bytes.len(), CHUNK_SIZE, "chunk {id}");
    }
}

#[test]
fn test_self_binary_compiles_or_fails_cleanly() {
    let exe = std::env::current_exe().unwrap();
    let mut compiler = UnwindCompiler::new(VecSink::new());

    match compiler.add_object_file(&exe) {
        Ok(()) => {
            let sink = compiler.sink();
            assert!(
                sink.of_kind(BlobKind::UnwindTable).next().is_some(),
                "a successful build must emit at least one chunk"
            );
            assert!(
                sink.of_kind(BlobKind::UnwindEntries).next().is_some(),
                "a successful build must emit at least one row"
            );
            assert_blob_invariants(sink);
        }
        Err(UnwindError::ParseError(msg)) => {
            eprintln!("self binary rejected ({msg}); checking nothing was emitted");
            assert!(compiler.sink().blobs.is_empty());
        }
        Err(other) => panic!("unexpected failure: {other}"),
    }
}

#[test]
fn test_repeated_add_is_idempotent() {
    let exe = std::env::current_exe().unwrap();
    let mut compiler = UnwindCompiler::new(VecSink::new());

    let first = compiler.add_object_file(&exe);
    let emitted = compiler.sink().blobs.len();
    let second = compiler.add_object_file(&exe);
    assert_eq!(first.is_ok(), second.is_ok());
    assert_eq!(
        compiler.sink().blobs.len(),
        emitted,
        "re-adding a known object must not emit again"
    );
}

#[test]
fn test_current_process_mappings() {
    let pid = std::process::id();
    let mut compiler = UnwindCompiler::new(VecSink::new());
    compiler.add_pid(pid).unwrap();

    let sink = compiler.into_sink();
    let mappings = sink
        .get(BlobKind::Mappings, pid)
        .expect("add_pid must emit a mappings blob");
    assert_eq!(mappings.len(), MAPPINGS_BLOB_SIZE);

    let count = u64::from_le_bytes(mappings[0..8].try_into().unwrap()) as usize;
    assert!(count <= MAX_MAPPINGS);

    let mut prev: Option<u64> = None;
    for i in 0..count {
        let at = 8 + i * MAPPING_RECORD_SIZE;
        let record =
            MappingRecord::from_bytes(mappings[at..at + MAPPING_RECORD_SIZE].try_into().unwrap());
        if let Some(prev) = prev {
            assert!(record.vma_start > prev, "vma_start must strictly increase");
        }
        prev = Some(record.vma_start);
        // Every referenced chunk must have been emitted.
        assert!(
            sink.get(BlobKind::UnwindTable, record.table_id).is_some(),
            "mapping references missing table {}",
            record.table_id
        );
        assert!((record.start_in_table as usize) < CHUNK_SIZE);
    }

    // Looking up a live code address must never produce a decode error,
    // whatever rule it resolves to.
    let ip = test_current_process_mappings as usize as u64;
    let chunk = |id: u32| sink.get(BlobKind::UnwindTable, id);
    lookup::resolve_rule(mappings, chunk, ip).expect("lookup must not hit a decode error");
}

#[test]
fn test_libc_if_present() {
    let libc_paths = [
        "/lib/x86_64-linux-gnu/libc.so.6",
        "/usr/lib/x86_64-linux-gnu/libc.so.6",
        "/lib64/libc.so.6",
    ];
    let Some(path) = libc_paths.iter().find(|p| Path::new(p).exists()) else {
        eprintln!("Skipping: libc not found at known paths");
        return;
    };

    let mut compiler = UnwindCompiler::new(VecSink::new());
    match compiler.add_object_file(Path::new(path)) {
        Ok(()) => assert_blob_invariants(compiler.sink()),
        Err(UnwindError::ParseError(msg)) => {
            eprintln!("libc rejected ({msg})");
            assert!(compiler.sink().blobs.is_empty());
        }
        Err(other) => panic!("unexpected failure: {other}"),
    }
}

#[test]
fn test_mapping_record_layout() {
    // The record crosses into the constrained consumer; its layout is fixed.
    assert_eq!(std::mem::size_of::<MappingRecord>(), MAPPING_RECORD_SIZE);
}
