use std::path::PathBuf;

use thiserror::Error;

pub type PcvResult<T> = Result<T, PcvError>;

/// Everything that can terminate an operation on a volume.
///
/// With the `keep` option most decrypt-side conditions degrade into a
/// [`crate::Outcome::Kept`] result instead of surfacing here.
#[derive(Debug, Error)]
pub enum PcvError {
    #[error("read access denied: {0}")]
    InputAccess(#[source] std::io::Error),

    #[error("write access denied: {0}")]
    OutputAccess(#[source] std::io::Error),

    #[error("insufficient disk space: {0}")]
    InsufficientSpace(#[source] std::io::Error),

    #[error("not a Picocrypt volume")]
    NotAVolume,

    #[error("the volume header is damaged")]
    HeaderDamaged,

    #[error("the provided password is incorrect")]
    WrongPassword,

    #[error("incorrect keyfiles")]
    WrongKeyfiles,

    #[error("incorrect keyfiles or order")]
    WrongKeyfileOrder,

    #[error("the volume body is irrecoverably damaged")]
    BodyIrrecoverable,

    #[error("the volume is damaged or modified")]
    IntegrityFailed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("split volume is incomplete: missing {}", .0.display())]
    IncompleteVolume(PathBuf),

    #[error("comment too long: {0} bytes (maximum 99999)")]
    CommentTooLong(usize),

    #[error("invalid split size")]
    InvalidSplitSize,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
