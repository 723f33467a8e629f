use thiserror::Error;

/// Errors surfaced by the proxy client. `Reset` and `Protocol` are both
/// backing-fatal per spec.md §7: the dispatcher completes the in-flight
/// request with `no-media` and schedules the device for removal.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy connection reset")]
    Reset,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unsupported alignment {0}")]
    UnsupportedAlignment(u64),

    #[error("proxy reported zero file size with no authoritative size supplied")]
    ZeroFileSize,

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn is_backing_fatal(&self) -> bool {
        matches!(self, ProxyError::Reset | ProxyError::Protocol(_))
    }
}
