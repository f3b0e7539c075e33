//! The public error type of the ledger.
//!
//! Internally the crate builds errors with `anyhow` (see `Res`) so that context can be attached as
//! they bubble up. At the boundaries of the public API, errors are classified with an `ErrorType`
//! using `IntoResult::pub_result`, which lets callers decide how to react (redirect, retry later,
//! surface to the user) without parsing messages.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// The result type used internally, before an error has been classified.
pub(crate) type Res<T> = anyhow::Result<T>;

/// The result type returned by the public API of this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies an `Error` so that callers can decide what to do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// A month was requested that is not adjacent to the budget's known range. The caller should
    /// redirect to the nearest valid boundary month rather than retry.
    OutOfSequence,
    /// A referenced budget, account, category or transaction does not exist. The operation must
    /// abort.
    NotFound,
    /// Reading from the document store failed.
    StoreRead,
    /// Writing to the document store failed. Optimistic state has been rolled back.
    StoreWrite,
    /// A chain recalculation failed partway. Months after the failure point remain stale.
    RecalculationAborted,
    /// A recorded sync conflict could not be resolved because the remote document changed again.
    SyncConflict,
    /// Balance arithmetic failed in a way that would violate the balance invariant.
    Calculation,
    /// The request is malformed or not allowed in the current state.
    Validation,
    /// The configuration or the ledger home directory is invalid.
    Config,
    /// Anything else.
    Internal,
}

serde_plain::derive_display_from_serialize!(ErrorType);
serde_plain::derive_fromstr_from_deserialize!(ErrorType);

/// The public error type. It pairs an `ErrorType` with the full `anyhow` context chain.
///
/// `Error` is cheap to clone so that one outcome can be handed to several waiters, e.g. every
/// trigger that awaited the same in-flight recalculation.
#[derive(Clone)]
pub struct Error {
    error_type: ErrorType,
    inner: Arc<anyhow::Error>,
}

impl Error {
    pub(crate) fn new(error_type: ErrorType, inner: anyhow::Error) -> Self {
        Self {
            error_type,
            inner: Arc::new(inner),
        }
    }

    /// Creates an error of `error_type` from a message.
    pub(crate) fn msg<S>(error_type: ErrorType, message: S) -> Self
    where
        S: Display + Debug + Send + Sync + 'static,
    {
        Self::new(error_type, anyhow::Error::msg(message))
    }

    /// Returns the classification of this error.
    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }

    /// Returns true if this error has the given classification.
    pub fn is(&self, error_type: ErrorType) -> bool {
        self.error_type == error_type
    }

    /// Returns the typed detail of this error, e.g. `OutOfSequence` for `ErrorType::OutOfSequence`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    /// Re-classifies the error while keeping its context chain.
    pub(crate) fn with_type(self, error_type: ErrorType) -> Self {
        Self {
            error_type,
            inner: self.inner,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:#}", self.error_type, self.inner)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error({}, {:?})", self.error_type, self.inner)
    }
}

impl std::error::Error for Error {}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::new(ErrorType::Internal, e)
    }
}

/// Converts an internal result into a public `Result` with the given `ErrorType`.
pub(crate) trait IntoResult<T> {
    fn pub_result(self, error_type: ErrorType) -> Result<T>;
}

impl<T> IntoResult<T> for Res<T> {
    fn pub_result(self, error_type: ErrorType) -> Result<T> {
        self.map_err(|e| Error::new(error_type, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use std::str::FromStr;

    #[test]
    fn error_type_display_round_trips() {
        assert_eq!(ErrorType::OutOfSequence.to_string(), "out_of_sequence");
        assert_eq!(
            ErrorType::from_str("recalculation_aborted").unwrap(),
            ErrorType::RecalculationAborted
        );
    }

    #[test]
    fn pub_result_keeps_context() {
        let res: Res<()> = Err(anyhow::anyhow!("disk on fire")).context("Unable to save month");
        let err = res.pub_result(ErrorType::StoreWrite).unwrap_err();
        assert!(err.is(ErrorType::StoreWrite));
        let message = err.to_string();
        assert!(message.contains("Unable to save month"), "{message}");
        assert!(message.contains("disk on fire"), "{message}");
    }

    #[test]
    fn clones_share_the_same_chain() {
        let err = Error::msg(ErrorType::NotFound, "no such budget 'b1'");
        let clone = err.clone().with_type(ErrorType::RecalculationAborted);
        assert!(err.is(ErrorType::NotFound));
        assert!(clone.is(ErrorType::RecalculationAborted));
        assert!(clone.to_string().contains("no such budget"));
    }
}
