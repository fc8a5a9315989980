//! The contract between the table compiler and whatever owns the fixed-size
//! key/value storage the constrained consumer reads. Loading blobs into that
//! storage (eBPF maps, files, test vectors) is the sink implementor's problem.

/// Kind of an emitted blob. Each kind has its own fixed value size, see the
/// constants in `unwind-forge-common`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    /// One 228-byte unwind row, keyed by rule id (0 reserved).
    UnwindEntries,
    /// One 256-byte expression program, keyed by expression id (0 reserved).
    Expressions,
    /// One 256 KiB compact-tree chunk, keyed by table id.
    UnwindTable,
    /// One per-process mapping table, keyed by pid.
    Mappings,
}

/// Receives every blob the compiler emits. Called exactly once per key: rows
/// and expressions are deduplicated before emission, table ids are dense, and
/// a pid's mappings are rebuilt wholesale per `add_pid` call.
pub trait TableSink {
    fn write(&mut self, kind: BlobKind, key: u32, bytes: Vec<u8>);
}

impl<F: FnMut(BlobKind, u32, Vec<u8>)> TableSink for F {
    fn write(&mut self, kind: BlobKind, key: u32, bytes: Vec<u8>) {
        self(kind, key, bytes)
    }
}

/// In-memory sink keeping every blob in emission order. Used by tests and by
/// the CLI when no output directory is given.
#[derive(Default)]
pub struct VecSink {
    pub blobs: Vec<(BlobKind, u32, Vec<u8>)>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All blobs of one kind, in emission order.
    pub fn of_kind(&self, kind: BlobKind) -> impl Iterator<Item = (u32, &[u8])> {
        self.blobs
            .iter()
            .filter(move |(k, _, _)| *k == kind)
            .map(|(_, key, bytes)| (*key, bytes.as_slice()))
    }

    /// The blob stored under `(kind, key)`, if any.
    pub fn get(&self, kind: BlobKind, key: u32) -> Option<&[u8]> {
        self.of_kind(kind)
            .find(|(k, _)| *k == key)
            .map(|(_, bytes)| bytes)
    }
}

impl TableSink for VecSink {
    fn write(&mut self, kind: BlobKind, key: u32, bytes: Vec<u8>) {
        self.blobs.push((kind, key, bytes));
    }
}
