//! Caller-visible and internal error kinds.
use thiserror::Error;

/// All fallible core operations return this error type.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum FsError {
    /// No free block or inode, or requested size exceeds `MAX_FILE_SIZE`.
    #[error("no space left on device")]
    NoSpace,
    /// Address translation failure or a backing-store I/O failure.
    #[error("I/O error")]
    Io,
    /// Name does not resolve to an existing entry.
    #[error("no such file or directory")]
    NotFound,
    /// Name already resolves to an entry where a fresh one was required.
    #[error("entry already exists")]
    AlreadyExists,
    /// Name exceeds `NAMELEN` bytes.
    #[error("name too long")]
    NameTooLong,
    /// Caller is not permitted to perform the requested operation.
    #[error("operation not permitted")]
    PermissionDenied,
    /// User-buffer transfer failed.
    #[error("bad address")]
    BadAddress,
    /// Inode table or other allocation exhausted without any free block
    /// involvement (distinct from `NoSpace` only at the VFS-surface error
    /// code table; internally both stem from allocator exhaustion).
    #[error("out of memory")]
    OutOfMemory,
    /// An on-disk invariant was violated (bad magic, op_kind drift during
    /// replay, a zero pointer where a non-zero one was required).
    #[error("filesystem corrupted: {0}")]
    Corrupted(&'static str),
}

pub type Result<T> = core::result::Result<T, FsError>;
