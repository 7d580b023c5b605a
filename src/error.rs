//! Error types shared by the dispatcher, the await adapter and the driver.
//!
//! The first three variants are raised at an `.await` site inside a running
//! computation and can be handled there like any other `Result`. The remaining
//! ones report a broken contract at the call that caused them.
use std::io;

use thiserror::Error;

/// Convenience alias used throughout `tether`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The asynchronous call failed before producing a response.
    #[error("transport failure: {0}")]
    TransportFailure(#[source] io::Error),

    /// The call completed but reported a non-success status.
    #[error("unsuccessful response: {status} {message}")]
    UnsuccessfulResponse { status: u16, message: String },

    /// The call succeeded but carried no payload.
    #[error("call succeeded with an empty result")]
    EmptyResult,

    /// A computation was resumed after reaching `Completed` or `Failed`.
    #[error("computation has already terminated")]
    AlreadyTerminated,

    /// A [Callback](crate::futures::call::Callback) was resolved a second time.
    #[error("callback has already been resolved")]
    AlreadyResolved,

    /// The dispatcher's execution context no longer accepts work.
    #[error("execution context is no longer available")]
    ContextUnavailable,

    /// Any other failure raised by the computation's own logic.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wrap an arbitrary error raised by user code inside a computation.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self::Other(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn display_includes_status() {
        let err = Error::UnsuccessfulResponse {
            status: 404,
            message: "Not Found".into(),
        };

        assert_eq!(err.to_string(), "unsuccessful response: 404 Not Found");
    }

    #[test]
    fn other_from_str() {
        let err = Error::other("no such user");

        assert!(matches!(err, Error::Other(_)));
        assert_eq!(err.to_string(), "no such user");
    }
}
