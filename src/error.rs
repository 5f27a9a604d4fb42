//! Typed error kinds for the storage engine's internal layers (spec §7).
//!
//! WAL, table, and manifest code returns `Result<T, LsmError>`. The facade
//! (`LsmStorageInner`/`MiniLsm`) wraps these in `anyhow::Result` at its
//! public boundary, matching the teacher's existing `anyhow` style.
//! Violations of an invariant that should be impossible given correct
//! callers (a short internal key, a negative checksum range) stay as
//! `panic!`/`assert!` rather than becoming a variant here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LsmError {
    #[error("key must not be empty")]
    EmptyKey,

    #[error("key not found")]
    KeyNotFound,

    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(&'static str),

    #[error("truncated record in {0}")]
    Truncate(&'static str),

    #[error("bad magic header in {0}")]
    BadMagic(&'static str),

    #[error("manifest rewrite failed: {0}")]
    ReWriteFailure(String),

    #[error("missing table referenced by manifest: {0}")]
    MissingTable(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupted {what}: {reason}")]
    Corruption {
        what: &'static str,
        reason: String,
    },
}
