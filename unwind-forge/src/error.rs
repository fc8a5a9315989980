use thiserror::Error;

/// Errors surfaced by the table compiler.
///
/// Variants carry plain strings so outcomes can be cached per object path and
/// handed back on repeated `add_object_file` calls without rework.
#[derive(Debug, Clone, Error)]
pub enum UnwindError {
    /// The object file (or a /proc entry) could not be opened or read.
    #[error("file not found or unreadable: {0}")]
    FileNotFound(String),

    /// The object contains a DWARF construct outside the supported
    /// vocabulary, or a malformed row. The whole object is rejected.
    #[error("unsupported or malformed unwind data: {0}")]
    ParseError(String),

    /// The file is not an ELF object.
    #[error("unsupported object format: {0}")]
    UnsupportedFormat(String),

    /// An encoding invariant was violated. This indicates a bug in the
    /// compiler, not bad input.
    #[error("internal error: {0}")]
    InternalError(String),

    /// The object id space (u16) is exhausted.
    #[error("too many distinct object files")]
    TooManyObjects,
}

/// Internal failure modes of the compact-tree encoder. `PointerTooLarge` is
/// ordinary control data for the size fitter and never escapes the crate;
/// `ValueTooLarge` becomes `UnwindError::InternalError` because rule ids are
/// expected to stay small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeError {
    PointerTooLarge,
    ValueTooLarge,
}
