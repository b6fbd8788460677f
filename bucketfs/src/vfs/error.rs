use crate::cadapter::BackendError;
use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: inode {0}")]
    NotADirectory(u64),

    #[error("is a directory: inode {0}")]
    IsADirectory(u64),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Write offset does not continue the current buffer.
    #[error("non-sequential write at offset {offset}, expected {expected}")]
    InvalidWrite { offset: u64, expected: u64 },

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("unknown handle {0}")]
    BadHandle(u64),

    #[error("I/O error: {0}")]
    Io(String),
}

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::InvalidWrite { .. } | FsError::InvalidName(_) => libc::EINVAL,
            FsError::Unsupported(_) => libc::ENOTSUP,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::Io(_) => libc::EIO,
        }
    }
}

impl From<BackendError> for FsError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(key) => FsError::NotFound(key),
            BackendError::Unsupported(msg) => FsError::Unsupported(msg),
            other @ (BackendError::InvalidRange(_)
            | BackendError::Transient { .. }
            | BackendError::Service { .. }) => FsError::Io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_to_errno() {
        assert_eq!(
            FsError::from(BackendError::NotFound("k".into())).errno(),
            libc::ENOENT
        );
        assert_eq!(
            FsError::from(BackendError::Unsupported("delete".into())).errno(),
            libc::ENOTSUP
        );
        let io = FsError::from(BackendError::Transient {
            op: "get_object",
            message: "timeout".into(),
        });
        assert_eq!(io.errno(), libc::EIO);
        assert_eq!(
            FsError::InvalidWrite {
                offset: 10,
                expected: 0
            }
            .errno(),
            libc::EINVAL
        );
    }
}
