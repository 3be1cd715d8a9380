use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::CacheError;
use crate::termination::TerminationWaiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    PendingShutdown,
    Shutdown,
}

/// One subscriber's slot on an [`Execution`]. Removing this from
/// `Execution::observers` and dropping `tx` without sending is exactly the
/// "cancel" outcome: the receiving [`TaskHandle`] sees the sender drop and
/// resolves to [`CacheError::Cancelled`].
struct Observer<V, E> {
    id: u64,
    tx: oneshot::Sender<Result<V, CacheError<E>>>,
}

/// Per-key bookkeeping for one in-progress producer invocation.
///
/// `token` distinguishes this invocation of a key from any later one. A
/// completion callback (spawned in `Cache::execute`) compares its captured
/// token against `in_progress[key]`'s current token before acting on it; a
/// mismatch means the execution it belonged to was already superseded by a
/// `force` re-run or a last-subscriber cancel, and it is a no-op. This is
/// what makes "deliver against a terminated execution" unreachable rather
/// than a checked runtime precondition.
struct Execution<V, E> {
    token: Arc<()>,
    observers: Vec<Observer<V, E>>,
    next_observer_id: u64,
    terminated: bool,
    abort: Option<AbortHandle>,
}

impl<V, E> Execution<V, E> {
    fn new() -> Self {
        Self {
            token: Arc::new(()),
            observers: Vec::new(),
            next_observer_id: 0,
            terminated: false,
            abort: None,
        }
    }

    fn attach(&mut self) -> (u64, oneshot::Receiver<Result<V, CacheError<E>>>) {
        debug_assert!(!self.terminated, "attach on a terminated execution");
        let id = self.next_observer_id;
        self.next_observer_id += 1;
        let (tx, rx) = oneshot::channel();
        self.observers.push(Observer { id, tx });
        (id, rx)
    }
}

/// Shared cache state behind the single coarse lock. `pub(crate)` so
/// [`crate::termination::TerminationWaiter`] can remove its own waiter slot
/// on drop without this crate growing a third sibling module that knows
/// about the lock's innards.
pub(crate) struct State<K, V, E> {
    finished: HashMap<K, V>,
    in_progress: HashMap<K, Execution<V, E>>,
    lifecycle: Lifecycle,
    next_termination_waiter_id: u64,
    termination_waiters: HashMap<u64, oneshot::Sender<()>>,
}

impl<K, V, E> State<K, V, E> {
    fn new() -> Self {
        Self {
            finished: HashMap::new(),
            in_progress: HashMap::new(),
            lifecycle: Lifecycle::Active,
            next_termination_waiter_id: 0,
            termination_waiters: HashMap::new(),
        }
    }

    /// Deregisters a termination waiter by id. A no-op if it already fired
    /// (and was drained by `maybe_notify_termination`) or was never
    /// registered. Called from `TerminationWaiter::drop`.
    pub(crate) fn remove_termination_waiter(&mut self, id: u64) {
        self.termination_waiters.remove(&id);
    }
}

/// Checks the termination predicate (`PendingShutdown` and `in_progress`
/// empty) and, if it holds, transitions to `Shutdown` and fires every
/// registered waiter in FIFO (insertion) order. Called on every event that
/// can advance the lifecycle: `shutdown()`, an execution leaving
/// `in_progress`, and `shutdown_now()`.
fn maybe_notify_termination<K, V, E>(state: &mut State<K, V, E>) {
    if state.lifecycle == Lifecycle::PendingShutdown && state.in_progress.is_empty() {
        state.lifecycle = Lifecycle::Shutdown;
        let mut waiters: Vec<(u64, oneshot::Sender<()>)> = state.termination_waiters.drain().collect();
        waiters.sort_by_key(|(id, _)| *id);
        for (_, waiter) in waiters {
            let _ = waiter.send(());
        }
    }
}

fn register_termination_waiter<K, V, E>(
    shared: &Arc<Mutex<State<K, V, E>>>,
    state: &mut State<K, V, E>,
) -> TerminationWaiter<K, V, E> {
    if state.lifecycle == Lifecycle::Shutdown {
        return TerminationWaiter::ready();
    }
    let id = state.next_termination_waiter_id;
    state.next_termination_waiter_id += 1;
    let (tx, rx) = oneshot::channel();
    state.termination_waiters.insert(id, tx);
    TerminationWaiter::pending(shared.clone(), id, rx)
}

/// An asynchronous, per-key task deduplication and memoization cache.
///
/// Cheap to clone: every clone shares the same underlying map and lock, so
/// handing a `Cache` out to many call sites (workers, request handlers) is
/// the intended way to share it, not wrapping it in an `Arc` yourself.
///
/// `V` must be `Clone`: a successful outcome is fanned out to every
/// subscriber by cloning it. Callers with an expensive-to-clone value should
/// wrap it in an `Arc` themselves before handing it to the cache.
pub struct Cache<K, V, E> {
    shared: Arc<Mutex<State<K, V, E>>>,
}

impl<K, V, E> Clone for Cache<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V, E> Default for Cache<K, V, E>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> Cache<K, V, E>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
    E: Send + 'static,
{
    /// Creates an empty, active cache.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(State::new())),
        }
    }

    /// Returns the result of `producer()` for `key`, deduplicating against
    /// any execution already in flight for the same key and memoizing a
    /// successful outcome.
    ///
    /// - If the cache is not `Active` (shutdown requested or complete), the
    ///   returned handle resolves immediately with
    ///   [`CacheError::Cancelled`] and `producer` is never called.
    /// - Else, if `force` is `false` and `key` has a memoized value, the
    ///   handle resolves immediately with that value and `producer` is
    ///   never called.
    /// - Else, `producer` is started if and only if no execution for `key`
    ///   is already running; either way, the returned handle joins that
    ///   execution's fan-out.
    pub fn execute<F, Fut>(&self, key: K, producer: F, force: bool) -> TaskHandle<K, V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let mut guard = self.shared.lock().unwrap();

        if guard.lifecycle != Lifecycle::Active {
            return TaskHandle::ready(Err(CacheError::Cancelled(
                "cache is shut down".to_string(),
            )));
        }

        if !force {
            if let Some(value) = guard.finished.get(&key) {
                return TaskHandle::ready(Ok(value.clone()));
            }
        } else {
            guard.finished.remove(&key);
        }

        let mut start_producer = false;
        if !guard.in_progress.contains_key(&key) {
            guard.in_progress.insert(key.clone(), Execution::new());
            start_producer = true;
        }

        let exec = guard
            .in_progress
            .get_mut(&key)
            .expect("execution was just looked up or inserted");
        let (observer_id, rx) = exec.attach();
        let token = exec.token.clone();

        if start_producer {
            // Run the producer in its own task so its `JoinHandle` carries an
            // `AbortHandle` usable for cancellation, and so a panic inside it
            // surfaces as a `JoinError` to the completion task below rather
            // than silently leaking this execution: nothing would otherwise
            // ever call `complete`, and every subscriber would hang forever.
            let producer_task = tokio::spawn(producer());
            guard
                .in_progress
                .get_mut(&key)
                .expect("execution still present immediately after insertion")
                .abort = Some(producer_task.abort_handle());

            let shared = self.shared.clone();
            let task_key = key.clone();
            let task_token = token.clone();
            tokio::spawn(async move {
                match producer_task.await {
                    Ok(outcome) => complete(shared, task_key, task_token, outcome),
                    Err(join_err) => {
                        if join_err.is_cancelled() {
                            // Aborted by us (last-subscriber-cancel or
                            // shutdown_now); that path already evicted the
                            // execution and notified its observers.
                            return;
                        }
                        fail_execution(
                            shared,
                            task_key,
                            task_token,
                            format!("producer panicked: {join_err}"),
                        );
                    }
                }
            });
        }

        let subscription = Subscription {
            shared: self.shared.clone(),
            key,
            token,
            observer_id,
            disposed: false,
        };
        drop(guard);

        TaskHandle::pending(rx, subscription)
    }

    /// `execute(key, producer, false)`.
    pub fn execute_if_not<F, Fut>(&self, key: K, producer: F) -> TaskHandle<K, V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.execute(key, producer, false)
    }

    /// Snapshot of the keys with a memoized value.
    pub fn finished_tasks(&self) -> HashSet<K> {
        self.shared
            .lock()
            .unwrap()
            .finished
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of the keys with an execution currently running.
    pub fn in_progress_tasks(&self) -> HashSet<K> {
        self.shared
            .lock()
            .unwrap()
            .in_progress
            .keys()
            .cloned()
            .collect()
    }

    /// Number of live subscriptions on the execution for `key`, or `0` if
    /// no execution is in progress for it.
    pub fn subscriber_count(&self, key: &K) -> usize {
        self.shared
            .lock()
            .unwrap()
            .in_progress
            .get(key)
            .map(|exec| exec.observers.len())
            .unwrap_or(0)
    }

    /// Requests a graceful shutdown: no new `execute` call will start work,
    /// but executions already in flight run to their natural outcome.
    /// Idempotent; has no effect once the cache is `PendingShutdown` or
    /// `Shutdown`.
    pub fn shutdown(&self) {
        let mut guard = self.shared.lock().unwrap();
        if guard.lifecycle == Lifecycle::Active {
            guard.lifecycle = Lifecycle::PendingShutdown;
            maybe_notify_termination(&mut guard);
        }
    }

    /// `shutdown()`, then cancels every execution currently in progress —
    /// each of their subscribers resolves with [`CacheError::Cancelled`] —
    /// and waits for the cache to reach `Shutdown`. Idempotent.
    pub async fn shutdown_now(&self) {
        self.shutdown();

        let (cancelled, waiter) = {
            let mut guard = self.shared.lock().unwrap();
            let executions: Vec<Execution<V, E>> =
                guard.in_progress.drain().map(|(_, exec)| exec).collect();

            let mut cancelled = Vec::new();
            for mut exec in executions {
                exec.terminated = true;
                if let Some(abort) = exec.abort.take() {
                    abort.abort();
                }
                cancelled.extend(std::mem::take(&mut exec.observers));
            }

            maybe_notify_termination(&mut guard);
            let waiter = register_termination_waiter(&self.shared, &mut guard);
            (cancelled, waiter)
        };

        for observer in cancelled {
            let _ = observer.tx.send(Err(CacheError::Cancelled(
                "cache is shutting down".to_string(),
            )));
        }

        waiter.await;
    }

    /// A future that resolves once the cache reaches `Shutdown`. Resolves
    /// immediately if it already has.
    pub fn await_termination(&self) -> TerminationWaiter<K, V, E> {
        let mut guard = self.shared.lock().unwrap();
        register_termination_waiter(&self.shared, &mut guard)
    }
}

/// Removes the execution for `key` from `in_progress` if it is still the
/// one identified by `token`, returning its drained observers. Returns
/// `None` if the execution was already superseded (by a `force` re-run or a
/// last-subscriber cancel) or is simply gone — the caller's outcome is
/// stale and must be discarded without touching the map.
fn evict_current_execution<K, V, E>(
    guard: &mut State<K, V, E>,
    key: &K,
    token: &Arc<()>,
) -> Option<Vec<Observer<V, E>>>
where
    K: Eq + Hash,
{
    let still_current =
        matches!(guard.in_progress.get(key), Some(exec) if Arc::ptr_eq(&exec.token, token));
    if !still_current {
        return None;
    }

    let mut exec = guard.in_progress.remove(key).unwrap();
    exec.terminated = true;
    let observers = std::mem::take(&mut exec.observers);
    maybe_notify_termination(guard);
    Some(observers)
}

/// Runs after a producer's future resolves successfully or with a producer
/// error. A stale `token` (the execution was already superseded by a
/// `force` re-run or a last-subscriber cancel) makes this a no-op.
fn complete<K, V, E>(shared: Arc<Mutex<State<K, V, E>>>, key: K, token: Arc<()>, outcome: Result<V, E>)
where
    K: Eq + Hash,
    V: Clone,
{
    let (observers, result) = {
        let mut guard = shared.lock().unwrap();
        let Some(observers) = evict_current_execution(&mut guard, &key, &token) else {
            return;
        };

        let result = match outcome {
            Ok(value) => {
                guard.finished.insert(key, value.clone());
                Ok(value)
            }
            Err(err) => Err(Arc::new(err)),
        };

        (observers, result)
    };

    for observer in observers {
        let outcome = match &result {
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(CacheError::Producer(err.clone())),
        };
        let _ = observer.tx.send(outcome);
    }
}

/// Evicts the execution for `key` (if still current) and delivers
/// [`CacheError::Cancelled`] carrying `message` to every observer. Used when
/// the producer task ended in a `JoinError` that isn't a cancellation we
/// ourselves requested — i.e. the producer panicked. There is no
/// producer-supplied `E` to forward in that case, so this is modeled as a
/// cache-level cancellation rather than `CacheError::Producer`.
fn fail_execution<K, V, E>(shared: Arc<Mutex<State<K, V, E>>>, key: K, token: Arc<()>, message: String)
where
    K: Eq + Hash,
{
    let observers = {
        let mut guard = shared.lock().unwrap();
        let Some(observers) = evict_current_execution(&mut guard, &key, &token) else {
            return;
        };
        observers
    };

    for observer in observers {
        let _ = observer.tx.send(Err(CacheError::Cancelled(message.clone())));
    }
}

/// A caller's cancel token for one subscription to an [`Execution`].
///
/// `dispose` is idempotent. The first call removes this subscriber's
/// observer slot; if that leaves the execution with zero observers while it
/// is not yet terminated, it cancels the producer and removes the execution
/// from `in_progress` — "last-subscriber-cancel" — delivering nothing to
/// anyone, since there is no one left to deliver to.
struct Subscription<K, V, E> {
    shared: Arc<Mutex<State<K, V, E>>>,
    key: K,
    token: Arc<()>,
    observer_id: u64,
    disposed: bool,
}

impl<K, V, E> Subscription<K, V, E>
where
    K: Eq + Hash,
{
    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        let mut guard = self.shared.lock().unwrap();
        let Some(exec) = guard.in_progress.get_mut(&self.key) else {
            return;
        };
        if !Arc::ptr_eq(&exec.token, &self.token) {
            return;
        }

        exec.observers.retain(|observer| observer.id != self.observer_id);
        if exec.observers.is_empty() && !exec.terminated {
            let mut exec = guard.in_progress.remove(&self.key).unwrap();
            exec.terminated = true;
            if let Some(abort) = exec.abort.take() {
                abort.abort();
            }
            maybe_notify_termination(&mut guard);
        }
    }
}

enum HandleState<K, V, E> {
    Ready(Option<Result<V, CacheError<E>>>),
    Pending {
        rx: oneshot::Receiver<Result<V, CacheError<E>>>,
        subscription: Option<Subscription<K, V, E>>,
    },
}

/// The `Future` returned by [`Cache::execute`] / [`Cache::execute_if_not`].
///
/// Resolves exactly once, with success, a producer error, or a
/// cancellation. Dropping the handle before it resolves disposes its
/// subscription, which is sufficient to cancel a subscriber's interest; use
/// [`TaskHandle::cancel`] to do so early without giving up ownership of the
/// handle.
pub struct TaskHandle<K, V, E> {
    state: HandleState<K, V, E>,
}

impl<K, V, E> TaskHandle<K, V, E>
where
    K: Eq + Hash,
{
    fn ready(result: Result<V, CacheError<E>>) -> Self {
        Self {
            state: HandleState::Ready(Some(result)),
        }
    }

    fn pending(rx: oneshot::Receiver<Result<V, CacheError<E>>>, subscription: Subscription<K, V, E>) -> Self {
        Self {
            state: HandleState::Pending {
                rx,
                subscription: Some(subscription),
            },
        }
    }

    /// Cancels this subscription in place. If this was the last live
    /// subscriber of its execution, the producer is cancelled. The handle
    /// still resolves — with [`CacheError::Cancelled`] if no outcome
    /// reaches it first — rather than hanging forever.
    pub fn cancel(&mut self) {
        if let HandleState::Pending { subscription, .. } = &mut self.state {
            if let Some(mut sub) = subscription.take() {
                sub.dispose();
            }
        }
    }
}

impl<K, V, E> Future for TaskHandle<K, V, E>
where
    K: Eq + Hash,
{
    type Output = Result<V, CacheError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            HandleState::Ready(result) => {
                Poll::Ready(result.take().expect("TaskHandle polled after completion"))
            }
            HandleState::Pending { rx, subscription } => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => {
                    subscription.take();
                    Poll::Ready(result)
                }
                Poll::Ready(Err(_)) => {
                    subscription.take();
                    Poll::Ready(Err(CacheError::Cancelled(
                        "execution was cancelled before producing a result".to_string(),
                    )))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<K, V, E> Drop for TaskHandle<K, V, E>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let HandleState::Pending { subscription, .. } = &mut self.state {
            if let Some(mut sub) = subscription.take() {
                sub.dispose();
            }
        }
    }
}

/// The "no value" convenience variant: a cache over completion-only work
/// units, falling out of `V = ()` with no special-casing required.
pub type SignalCache<K, E> = Cache<K, (), E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn new_cache<K, V, E>() -> Cache<K, V, E>
    where
        K: Clone + Eq + Hash + Send + 'static,
        V: Clone + Send + 'static,
        E: Send + 'static,
    {
        Cache::new()
    }

    #[tokio::test]
    async fn memoizes_a_successful_result() {
        let cache: Cache<&'static str, u32, String> = new_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let first = cache
            .execute_if_not("k", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(7)
            })
            .await
            .unwrap();
        assert_eq!(first, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let c = calls.clone();
        let second = cache
            .execute_if_not("k", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(99)
            })
            .await
            .unwrap();
        assert_eq!(second, 7, "memoized value must win, producer not re-run");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.finished_tasks().contains("k"));
        assert!(cache.in_progress_tasks().is_empty());
    }

    #[tokio::test]
    async fn force_always_reinvokes_and_updates_memoized_value() {
        let cache: Cache<&'static str, u32, String> = new_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        cache
            .execute_if_not("k", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(1)
            })
            .await
            .unwrap();

        let c = calls.clone();
        let forced = cache
            .execute(
                "k",
                move || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(2)
                },
                true,
            )
            .await
            .unwrap();
        assert_eq!(forced, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let c = calls.clone();
        let after = cache
            .execute_if_not("k", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(3)
            })
            .await
            .unwrap();
        assert_eq!(after, 2, "subsequent non-forced call sees the forced value");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_is_not_memoized() {
        let cache: Cache<&'static str, u32, String> = new_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let first = cache
            .execute_if_not("k", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>("boom".to_string())
            })
            .await;
        assert!(matches!(first, Err(CacheError::Producer(_))));
        assert!(!cache.finished_tasks().contains("k"));

        let c = calls.clone();
        let second = cache
            .execute_if_not("k", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(5)
            })
            .await
            .unwrap();
        assert_eq!(second, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2, "a failed run must not be memoized");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn dedup_across_concurrent_callers() {
        let cache: Cache<&'static str, u32, String> = new_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .execute_if_not("k", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "producer must run exactly once");
    }

    #[tokio::test]
    async fn last_subscriber_cancel_drops_the_execution_without_delivering() {
        let cache: Cache<&'static str, u32, String> = new_cache();
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

        let mut a = cache.execute_if_not("k", move || async move {
            let _ = gate_rx.await;
            Ok::<_, String>(1)
        });
        let mut b = cache.execute_if_not("k", move || async move { unreachable!("second caller must join, not start") });

        assert_eq!(cache.subscriber_count(&"k"), 2);

        a.cancel();
        b.cancel();

        // give the spawned producer task a chance to observe the abort.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(cache.in_progress_tasks().is_empty());
        assert!(!cache.finished_tasks().contains("k"));
        drop(gate_tx);

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result = cache
            .execute_if_not("k", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(2)
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "a fresh execution must run for the new caller");
    }

    #[tokio::test]
    async fn shutdown_now_cancels_in_flight_subscribers_and_converges() {
        let cache: Cache<&'static str, u32, String> = new_cache();
        let (_gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = cache.execute_if_not("k", move || async move {
            let _ = gate_rx.await;
            Ok::<_, String>(1)
        });

        cache.shutdown_now().await;

        assert!(cache.in_progress_tasks().is_empty());
        let result = handle.await;
        assert!(matches!(result, Err(CacheError::Cancelled(_))));

        cache.await_termination().await;
    }

    #[tokio::test]
    async fn execute_after_shutdown_is_cancelled_without_running_the_producer() {
        let cache: Cache<&'static str, u32, String> = new_cache();
        cache.shutdown();

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let result = cache
            .execute_if_not("k", move || async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(1)
            })
            .await;
        assert!(matches!(result, Err(CacheError::Cancelled(_))));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_pending_work_still_completes() {
        let cache: Cache<&'static str, u32, String> = new_cache();
        let handle = cache.execute_if_not("k", || async { Ok::<_, String>(9) });

        cache.shutdown();
        cache.shutdown();

        assert_eq!(handle.await.unwrap(), 9);
        cache.await_termination().await;
    }

    #[tokio::test]
    async fn await_termination_fires_once_after_shutdown_with_no_work_in_flight() {
        let cache: Cache<&'static str, u32, String> = new_cache();
        let waiter = cache.await_termination();
        cache.shutdown();
        waiter.await;

        // Registering after Shutdown resolves immediately.
        cache.await_termination().await;
    }

    #[tokio::test]
    async fn disposing_a_handle_twice_is_a_no_op() {
        let cache: Cache<&'static str, u32, String> = new_cache();
        let (_gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let mut handle = cache.execute_if_not("k", move || async move {
            let _ = gate_rx.await;
            Ok::<_, String>(1)
        });

        handle.cancel();
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.in_progress_tasks().is_empty());
    }
}
