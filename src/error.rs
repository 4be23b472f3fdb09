use std::{any::Any, collections::BTreeMap, error::Error as StdError, sync::Arc};

use thiserror::Error;

/// Rejection reason carried by every promise in this crate.
///
/// User code rejects with [`Error::Reason`] for plain messages or with
/// [`Error::custom`] to carry its own error type, which can later be recovered
/// with [`downcast_ref`](Error::downcast_ref).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// A promise was resolved, directly or through a chain, with itself.
    #[error("cannot resolve a promise with itself")]
    SelfResolution,
    /// `some`/`any` asked for more fulfilled inputs than there are inputs.
    #[error("input must contain at least {required} item{} but contains only {available} item{}", plural(.required), plural(.available))]
    Length {
        /// Number of fulfilled inputs requested.
        required: usize,
        /// Number of inputs supplied.
        available: usize,
    },
    /// A rejection reached [`done`](crate::Chainable::done) without a handler.
    #[error("unhandled rejection: {0}")]
    UnhandledRejection(Box<Error>),
    /// A resolver, handler or factory panicked.
    #[error("promise callback panicked: {0}")]
    Panicked(String),
    /// Too many inputs of a combinator rejected; reasons keyed by input index.
    #[error("{} input(s) rejected", .0.len())]
    Aggregate(BTreeMap<usize, Error>),
    /// The promise was dropped before it could settle.
    #[error("promise dropped before settlement")]
    Dropped,
    /// A plain rejection message.
    #[error("{0}")]
    Reason(String),
    /// A user supplied error value.
    #[error("{0}")]
    Custom(Arc<dyn StdError + Send + Sync>),
}

fn plural(n: &usize) -> &'static str {
    if *n == 1 {
        ""
    } else {
        "s"
    }
}

impl Error {
    /// Creates an [`Error::Reason`].
    ///
    /// ```
    /// # use chainpromise::Error;
    /// assert_eq!(Error::reason("boom").to_string(), "boom");
    /// ```
    pub fn reason(message: impl Into<String>) -> Self {
        Error::Reason(message.into())
    }

    /// Wraps an arbitrary error value.
    pub fn custom<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Custom(Arc::new(error))
    }

    /// Returns the wrapped error if this is a [`Error::Custom`] holding an `E`.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Error::Custom(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Converts a caught panic payload into a rejection reason.
    ///
    /// Payloads that already are an [`Error`] (such as an unhandled rejection
    /// raised by `done`) are passed through.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<Error>() {
            Ok(error) => return *error,
            Err(payload) => payload,
        };
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            Error::Panicked((*message).to_owned())
        } else if let Some(message) = payload.downcast_ref::<String>() {
            Error::Panicked(message.clone())
        } else {
            Error::Panicked("non-string panic payload".to_owned())
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::SelfResolution, Error::SelfResolution) => true,
            (Error::Dropped, Error::Dropped) => true,
            (
                Error::Length {
                    required: r1,
                    available: a1,
                },
                Error::Length {
                    required: r2,
                    available: a2,
                },
            ) => r1 == r2 && a1 == a2,
            (Error::UnhandledRejection(a), Error::UnhandledRejection(b)) => a == b,
            (Error::Panicked(a), Error::Panicked(b)) => a == b,
            (Error::Aggregate(a), Error::Aggregate(b)) => a == b,
            (Error::Reason(a), Error::Reason(b)) => a == b,
            (Error::Custom(a), Error::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
