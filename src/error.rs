//! Error surface.
//!
//! The public API fails soft: `create`/`setup` return `None`/`false` rather
//! than panicking or unwinding in release builds. Internally, fallible
//! plumbing threads `Result<T, BoxrootError>` through `?`, distinguishing
//! failure kinds instead of collapsing everything into one catch-all.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BoxrootError {
    #[error("platform could not provide a pool-aligned block of memory")]
    AllocationFailed,

    #[error("setup() was called while boxroot was already running")]
    AlreadySetup,

    #[error("operation attempted before setup() or after teardown()")]
    NotSetup,

    #[error("a boxroot mutex was poisoned by a panicking holder")]
    PoisonedLock,

    #[error("environment variable {0} could not be parsed as a pool log-size")]
    BadPoolLogSize(String),
}

impl<T> From<std::sync::PoisonError<T>> for BoxrootError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        BoxrootError::PoisonedLock
    }
}

pub type Result<T> = std::result::Result<T, BoxrootError>;
