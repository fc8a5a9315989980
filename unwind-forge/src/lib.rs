//! Compiles `.eh_frame` call-frame information into compact, fixed-chunk
//! unwind tables that a constrained consumer (an eBPF lookup program reading
//! fixed-value-size maps) can search without a DWARF parser, plus the paired
//! reference lookup implementation.
//!
//! The write path runs through [`UnwindCompiler`]: rows and expressions are
//! deduplicated to small dense ids, each object's `file offset -> rule id`
//! map is serialized as a pointer-compact binary search tree packed into
//! 256 KiB chunks, and a per-process mapping table ties virtual addresses
//! back to the right chunk. The read path lives in [`lookup`] and [`expr`]
//! and shares its wire codecs with the encoder.

mod chunk;
mod compose;
pub mod compiler;
mod ehframe;
pub mod error;
pub mod expr;
pub mod lookup;
pub mod rules;
pub mod sink;
mod tree;

pub use compiler::UnwindCompiler;
pub use error::UnwindError;
pub use sink::{BlobKind, TableSink, VecSink};
