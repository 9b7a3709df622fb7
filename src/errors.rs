use thiserror::Error;

/// Error taxonomy of the runtime.
///
/// Everything a caller can reasonably recover from is reported through this
/// enum; broken internal invariants (refcount underflow, double free, CSE
/// index corruption) and backend compilation failures go through [`fatal`]
/// instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested backend was never initialized or its driver/library
    /// could not be located.
    #[error("the {0} backend is inactive: {1}")]
    BackendInactive(&'static str, String),

    /// Malformed request: size-broadcast violation, type mismatch, unknown
    /// device index, bad label, ...
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The allocator could not satisfy a request even after flushing all
    /// deferred frees.
    #[error("out of memory: failed to allocate {size} bytes ({kind})")]
    OutOfMemory { kind: &'static str, size: usize },

    /// An I/O problem while touching the on-disk kernel cache. The cache is
    /// advisory, so most call sites log and continue.
    #[error("kernel cache I/O error: {0}")]
    CacheIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

/// Fatal-error channel: log the message (with any attached source code) at
/// error level, then unwind. The global mutex is a `parking_lot` lock and
/// does not poison, so a catching frame can still call `shutdown()`.
#[cold]
pub fn fatal(msg: &str) -> ! {
    crate::log::write(crate::log::LogLevel::Error, msg);
    panic!("{msg}");
}
