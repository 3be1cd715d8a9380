//! The crate's error type.

use std::fmt;
use std::sync::Arc;

/// Error delivered through a [`crate::TaskHandle`].
///
/// `Cancelled` is raised by the cache itself; `Producer` forwards whatever
/// the caller's producer returned.
#[derive(Debug)]
pub enum CacheError<E> {
    /// `execute` was called on a cache that is draining or dead, or the
    /// execution this handle was attached to was cancelled — either by
    /// `shutdown_now` or by the last other subscriber leaving first.
    Cancelled(String),
    /// Forwarded verbatim from the producer. Wrapped in an `Arc` so a single
    /// failure can be cloned out to every subscriber without requiring
    /// `E: Clone`.
    Producer(Arc<E>),
}

impl<E> Clone for CacheError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Cancelled(message) => Self::Cancelled(message.clone()),
            Self::Producer(err) => Self::Producer(err.clone()),
        }
    }
}

impl<E: fmt::Display> fmt::Display for CacheError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled(message) => write!(f, "cancelled: {message}"),
            Self::Producer(err) => write!(f, "{err}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CacheError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cancelled(_) => None,
            Self::Producer(err) => Some(err.as_ref()),
        }
    }
}
