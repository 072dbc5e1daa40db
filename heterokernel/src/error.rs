//! Crate-wide error taxonomy.
//!
//! Mirrors the propagation policy: compilation, argument-mapping, and driver
//! failures surface to the caller; cache-disposed/stream-disposed indicate
//! programmer error; persistence failures never appear here at all (they are
//! logged internally and swallowed, see [`crate::cache::KernelCache::persist`]).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The code-emitter failed to produce a kernel. Not cached.
    #[error("kernel compilation failed: {diagnostics}")]
    Compilation { diagnostics: String },

    /// A parameter kind the mapper does not know how to marshal.
    #[error("unsupported parameter: {detail}")]
    UnsupportedParameter { detail: String },

    /// Computed marshalled size disagrees with the entry point's expected
    /// size. Indicates code-emitter/mapper divergence.
    #[error("layout mismatch: expected {expected} bytes, computed {actual}")]
    LayoutMismatch { expected: usize, actual: usize },

    /// The driver rejected an argument at the given index.
    #[error("argument mapping failed at index {index}: driver status {status}")]
    ArgumentMapping { index: usize, status: i64 },

    /// A driver call returned a non-zero status outside of argument mapping
    /// (compile, launch, synchronize).
    #[error("driver error: {detail}")]
    Driver { detail: String },

    /// Operation attempted after the owning cache was disposed. Programmer
    /// error — the cache outlives every handle derived from it by contract.
    #[error("operation attempted on a disposed kernel cache")]
    CacheDisposed,

    /// Operation attempted after the owning stream was disposed while an
    /// AsyncLaunch future still referenced it. Programmer error.
    #[error("operation attempted on a disposed stream")]
    StreamDisposed,
}

/// Internal-only: persistence failures are logged, never returned to a
/// caller of a public API. Kept as a real error type (rather than a raw
/// String) so `preload`/`persist` can log it uniformly via `tracing`.
#[derive(Error, Debug)]
pub(crate) enum PersistenceError {
    #[error("cache directory io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
