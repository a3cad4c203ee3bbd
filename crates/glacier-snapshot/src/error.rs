use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The stored index carries a version tag this build does not speak.
    #[error("incompatible snapshot index version: expected {expected}, found {found}")]
    IncompatibleVersion { expected: u32, found: u32 },
    /// The index decoded cleanly enough to know it is damaged.
    #[error("corrupt snapshot index: {0}")]
    CorruptIndex(&'static str),
    /// The index references a RAM block the VM never registered.
    #[error("snapshot references unknown ram block {id:?}")]
    UnknownBlock { id: String },
    /// A page read returned fewer bytes than the index promised.
    #[error("short read for page at file offset {file_pos} ({expected} bytes)")]
    ShortRead { file_pos: u64, expected: u32 },
    /// A stored page failed to inflate back to its in-memory size.
    #[error("page decompression failed: {0}")]
    Decompression(String),
    /// The snapshot directory could not be created, opened or renamed.
    #[error("snapshot directory error at {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The texture index has no entry for the requested id.
    #[error("unknown texture id {id}")]
    UnknownTexture { id: u32 },
    /// A texture id was saved twice within one snapshot.
    #[error("duplicate texture id {id}")]
    DuplicateTexture { id: u32 },
    /// The operation was cancelled via `interrupt_reading`.
    #[error("snapshot load interrupted")]
    Interrupted,
    /// An operation was requested in a state that cannot serve it.
    #[error("invalid snapshot operation: {0}")]
    InvalidOperation(&'static str),
    /// Snapshot metadata failed to encode or decode.
    #[error("snapshot metadata error: {0}")]
    Metadata(String),
    #[error("snapshot i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SnapshotError {
    /// True for failures that invalidate the whole snapshot rather than
    /// one operation attempt (the coordinator deletes the directory).
    pub fn poisons_snapshot(&self) -> bool {
        !matches!(
            self,
            SnapshotError::Interrupted | SnapshotError::InvalidOperation(_)
        )
    }
}
