//! Error handling utils.
//!
//! Operations on the loop, its synchronization primitives, and the worker
//! pool either succeed or produce an [`Error`]. Cancellation is not
//! represented here: it propagates as an unwind (see [`Cancelled`]), not as
//! a `Result`, since every blocking primitive must be able to interrupt a
//! call that has no natural place to return an error from.

use std::fmt;
use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases produced by the runtime.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A syscall failed with something other than `EAGAIN`/`EINTR`, both of
    /// which are handled internally and never surface here.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A worker-pool task panicked; the payload is the captured message
    /// (the original panic value is not guaranteed to be `Send`, so it's
    /// rendered to a string at the pool/loop boundary).
    #[error("worker task panicked: {0}")]
    WorkerPanicked(String),

    /// The operation would have blocked and the caller used a zero timeout.
    #[error("operation would block")]
    WouldBlock,

    /// The operation was bound by a timeout which elapsed before it
    /// completed.
    #[error("operation timed out")]
    TimedOut,

    /// A contract documented by the loop/fiber API was violated by the
    /// caller (double-register of an fd, using an unregistered fd, etc).
    /// In debug builds these are caught earlier by `debug_assert!`; this
    /// variant exists for release builds where the check is skipped and
    /// the violation instead surfaces as an ordinary error.
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),

    /// This should only be used if the error doesn't fall into one of the
    /// above categories.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

const _: () = {
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Builds an [`Error::Io`] from the current value of `errno`.
    #[inline(always)]
    pub fn last_os_error() -> Self {
        Self::Io(io::Error::last_os_error())
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Io(_) => "Io",
            Self::WorkerPanicked(_) => "WorkerPanicked",
            Self::WouldBlock => "WouldBlock",
            Self::TimedOut => "TimedOut",
            Self::ContractViolation(_) => "ContractViolation",
            Self::Other(_) => "Other",
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::Other(e)
    }
}

/// Panic payload used to signal fiber cancellation through an unwind.
///
/// Caught only at the fiber-start trampoline (`crate::fiber::scheduler`);
/// any other panic payload is assumed to be a genuine user panic and is
/// re-raised from the next `Loop::run` return.
pub struct Cancelled;

impl fmt::Debug for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cancelled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_names_are_stable() {
        assert_eq!(Error::WouldBlock.variant_name(), "WouldBlock");
        assert_eq!(Error::TimedOut.variant_name(), "TimedOut");
    }

    #[test]
    fn io_error_converts() {
        let e: Error = io::Error::from(io::ErrorKind::NotFound).into();
        assert_eq!(e.variant_name(), "Io");
    }
}
