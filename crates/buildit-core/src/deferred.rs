//! Results of user hooks that may or may not be ready yet.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;

use crate::{Error, Result};

/// The result of a hook: either a value available right away, or a future
/// that resolves to one.
///
/// Callers always go through [`Deferred::resolve`], so synchronous and
/// asynchronous hooks are handled the same way.
pub enum Deferred<T> {
    Literal(T),
    Pending(BoxFuture<'static, Result<T>>),
}

impl<T: Send + 'static> Deferred<T> {
    /// Wrap a future producing the hook result.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self::Pending(future.boxed())
    }

    /// A hook that failed before producing anything.
    pub fn failed(error: Error) -> Self {
        Self::Pending(futures::future::ready(Err(error)).boxed())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Wait for the hook result.
    pub async fn resolve(self) -> Result<T> {
        match self {
            Self::Literal(value) => Ok(value),
            Self::Pending(future) => future.await,
        }
    }
}

impl<T> From<T> for Deferred<T> {
    fn from(value: T) -> Self {
        Self::Literal(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}
