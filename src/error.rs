use std::io;

/// Stable error surface returned by every façade operation (`fs_ops::Facade`).
///
/// Kinds mirror the ones a kernel FUSE bridge would translate into errno
/// values; this crate never constructs an errno directly, it only exposes
/// `into_errno` for a bridge to call.
#[derive(Debug)]
pub enum FsError {
    NotFound,
    PermissionDenied,
    ReadOnlyFilesystem,
    InvalidArgument,
    InputOutputError(io::Error),
    AlreadyExists,
    /// The named extended attribute does not exist on an otherwise valid
    /// node (§4.6) — distinct from `NotFound`, which means the node itself
    /// doesn't exist; maps to `ENODATA`, not `ENOENT`.
    NoAttribute,
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => FsError::NotFound,
            io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
            _ => FsError::InputOutputError(e),
        }
    }
}

impl From<zip::result::ZipError> for FsError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::FileNotFound => FsError::NotFound,
            other => FsError::InputOutputError(io::Error::other(other)),
        }
    }
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsError::NotFound => write!(f, "viewfs: no such file or directory"),
            FsError::PermissionDenied => write!(f, "viewfs: permission denied"),
            FsError::ReadOnlyFilesystem => write!(f, "viewfs: read-only filesystem"),
            FsError::InvalidArgument => write!(f, "viewfs: invalid argument"),
            FsError::InputOutputError(e) => write!(f, "viewfs: I/O error: {e}"),
            FsError::AlreadyExists => write!(f, "viewfs: file exists"),
            FsError::NoAttribute => write!(f, "viewfs: no such attribute"),
        }
    }
}

impl std::error::Error for FsError {}

impl FsError {
    /// The errno a kernel bridge should surface for this error kind.
    pub fn into_errno(self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EACCES,
            FsError::ReadOnlyFilesystem => libc::EROFS,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::InputOutputError(_) => libc::EIO,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NoAttribute => libc::ENODATA,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
