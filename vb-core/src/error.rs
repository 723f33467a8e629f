//! Error taxonomy (spec.md §7). Every lower-layer error (`vb_geom`,
//! `vb_proxy`, `vb_winmap`, and this crate's own backing-store/manager
//! errors) is mapped onto one `ErrorKind` arm before it reaches a caller of
//! the dispatcher or device manager, so callers never match on
//! crate-internal variants from a lower layer.

use thiserror::Error;

/// The external-facing error taxonomy, one variant per class in spec.md §7.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("access denied")]
    AccessDenied,
    #[error("device not found")]
    NotFound,
    #[error("media is write protected")]
    WriteProtected,
    #[error("no media (backing store is gone)")]
    NoMedia,
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("delete pending")]
    DeletePending,
    #[error("object name collision")]
    ObjectNameCollision,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("request cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Cancellation is a distinct taxonomy class (spec.md §7 item 4) and
    /// must never be logged as an error.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ErrorKind::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum BackingError {
    #[error("not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("wrong backing type for this operation")]
    WrongType,
    #[error("write attempted on read-only backing")]
    WriteProtected,
    #[error("insufficient resources to allocate a bounce buffer")]
    InsufficientResources,
    #[error(transparent)]
    Proxy(#[from] vb_proxy::ProxyError),
    #[error(transparent)]
    Window(#[from] vb_winmap::WindowError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<&BackingError> for ErrorKind {
    fn from(e: &BackingError) -> Self {
        match e {
            BackingError::NotFound => ErrorKind::NotFound,
            BackingError::AccessDenied => ErrorKind::AccessDenied,
            BackingError::WrongType => ErrorKind::InvalidParameter("wrong backing type".into()),
            BackingError::WriteProtected => ErrorKind::WriteProtected,
            BackingError::InsufficientResources => ErrorKind::InsufficientResources,
            BackingError::Proxy(p) if matches!(p, vb_proxy::ProxyError::Cancelled) => ErrorKind::Cancelled,
            BackingError::Proxy(p) if p.is_backing_fatal() => ErrorKind::NoMedia,
            BackingError::Proxy(_) => ErrorKind::InsufficientResources,
            BackingError::Window(vb_winmap::WindowError::InvalidParameter(_)) => {
                ErrorKind::InvalidParameter("request exceeds window size".into())
            }
            BackingError::Window(vb_winmap::WindowError::InsufficientResources) => {
                ErrorKind::InsufficientResources
            }
            BackingError::Window(vb_winmap::WindowError::Io(_)) => ErrorKind::InsufficientResources,
            BackingError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
            BackingError::Io(_) => ErrorKind::NoMedia,
        }
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Kind(#[from] ErrorKindError),
    #[error("device table is full")]
    TableFull,
}

/// Wrapper so `ErrorKind` (which isn't itself `std::error::Error`-ergonomic
/// for `#[from]` without a newtype) can participate in `ManagerError`'s
/// `#[from]` derive.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ErrorKindError(pub ErrorKind);

impl From<ErrorKind> for ManagerError {
    fn from(kind: ErrorKind) -> Self {
        ManagerError::Kind(ErrorKindError(kind))
    }
}

impl ManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::Kind(ErrorKindError(k)) => k.clone(),
            ManagerError::TableFull => ErrorKind::InsufficientResources,
        }
    }
}
