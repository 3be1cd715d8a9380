//! The future returned by [`crate::Cache::await_termination`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::cache::State;

enum Inner<K, V, E> {
    AlreadyShutdown,
    Pending {
        shared: Arc<Mutex<State<K, V, E>>>,
        id: u64,
        rx: oneshot::Receiver<()>,
    },
}

/// Resolves once the owning cache reaches the `Shutdown` lifecycle state.
///
/// Resolves immediately if the cache was already `Shutdown` at the time
/// [`crate::Cache::await_termination`] was called. Dropping this future
/// before it resolves deregisters the waiter — mirroring how dropping a
/// [`crate::TaskHandle`] detaches its subscription — so polling and
/// abandoning `await_termination()` in a loop (a `select!` or a timeout) on
/// a long-lived, still-`Active` cache does not accumulate dead waiters.
pub struct TerminationWaiter<K, V, E> {
    inner: Inner<K, V, E>,
}

impl<K, V, E> TerminationWaiter<K, V, E> {
    pub(crate) fn ready() -> Self {
        Self {
            inner: Inner::AlreadyShutdown,
        }
    }

    pub(crate) fn pending(shared: Arc<Mutex<State<K, V, E>>>, id: u64, rx: oneshot::Receiver<()>) -> Self {
        Self {
            inner: Inner::Pending { shared, id, rx },
        }
    }
}

impl<K, V, E> Future for TerminationWaiter<K, V, E> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::AlreadyShutdown => Poll::Ready(()),
            Inner::Pending { rx, .. } => match Pin::new(rx).poll(cx) {
                Poll::Ready(_) => Poll::Ready(()),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<K, V, E> Drop for TerminationWaiter<K, V, E> {
    fn drop(&mut self) {
        if let Inner::Pending { shared, id, .. } = &self.inner {
            shared.lock().unwrap().remove_termination_waiter(*id);
        }
    }
}
