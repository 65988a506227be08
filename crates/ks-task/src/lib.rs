//! `Task<T>`: a single-shot lazy computation, composable with middlewares.
//!
//! A `Task` never runs its producer at construction time — only the
//! first `run()`/`detach()` triggers it, and the outcome is memoized so
//! later calls on the same `Task` observe the cached result rather than
//! re-running the producer. Retries, timeouts, fallbacks and the other
//! middlewares in [`middleware`] wrap the producer, so a retried task
//! still resolves "at most once" from the caller's point of view — the
//! retries happen inside that one resolution.

pub mod combinators;
pub mod middleware;

pub use combinators::{all, all_settled, any, race};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error surfaced by a `Task`'s resolution.
#[derive(thiserror::Error, Debug, Clone)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl TaskError {
    pub fn from_err(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Failed(Arc::new(err.into()))
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

/// Context threaded through a producer and every middleware wrapping it.
///
/// `cancel` is the merged cancellation signal: the union of whatever the
/// caller passed in and any signal a middleware derives internally (e.g.
/// `timeout`'s own deadline), so cancelling either aborts the inner call.
#[derive(Clone)]
pub struct TaskCtx {
    pub cancel: CancellationToken,
    /// A name used for logging, set by whichever middleware wraps a task.
    pub name: Option<Arc<str>>,
}

impl TaskCtx {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, name: None }
    }

    pub fn named(cancel: CancellationToken, name: impl Into<Arc<str>>) -> Self {
        Self {
            cancel,
            name: Some(name.into()),
        }
    }

    pub fn child(&self) -> TaskCtx {
        TaskCtx {
            cancel: self.cancel.child_token(),
            name: self.name.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for TaskCtx {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

/// A producer: the closure a `Task` defers. `Fn`, not `FnOnce`, because
/// retry-style middlewares may invoke it more than once during a single
/// resolution.
pub type ProducerFn<T> = Arc<dyn Fn(TaskCtx) -> BoxFuture<'static, TaskResult<T>> + Send + Sync>;

struct TaskInner<T> {
    producer: ProducerFn<T>,
    cell: OnceCell<TaskResult<T>>,
    cancel: CancellationToken,
}

/// A lazy, memoized, cancellable computation.
pub struct Task<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

impl<T> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Build a task from a producer closure. Constructing a `Task` never
    /// invokes `producer` — it only runs on the first `run()`/`detach()`.
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: Fn(TaskCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        Self::from_producer(Arc::new(move |ctx| Box::pin(producer(ctx))), CancellationToken::new())
    }

    /// Build a task that always resolves with `value`, never touching the
    /// producer machinery. Useful for `fallback` and test fixtures.
    pub fn ready(value: T) -> Self {
        Self::new(move |_ctx| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    pub fn failed(err: TaskError) -> Self {
        Self::new(move |_ctx| {
            let err = err.clone();
            async move { Err(err) }
        })
    }

    pub(crate) fn from_producer(producer: ProducerFn<T>, cancel: CancellationToken) -> Self {
        Task {
            inner: Arc::new(TaskInner {
                producer,
                cell: OnceCell::new(),
                cancel,
            }),
        }
    }

    /// The cancellation signal this task's producer observes.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Cancel this task. Outstanding/future `run()` calls resolve with
    /// `TaskError::Cancelled` once the producer observes the signal; a
    /// producer that ignores `ctx.cancel` entirely is not forcibly
    /// interrupted (cooperative cancellation only).
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Await this task's result. The producer runs at most once; a second
    /// call returns the memoized outcome without re-invoking it.
    pub async fn run(&self) -> TaskResult<T> {
        let inner = &self.inner;
        inner
            .cell
            .get_or_init(|| async {
                let ctx = TaskCtx::new(inner.cancel.clone());
                if ctx.is_cancelled() {
                    return Err(TaskError::Cancelled);
                }
                (inner.producer)(ctx).await
            })
            .await
            .clone()
    }

    /// Start execution and discard the result. Errors are logged, not
    /// propagated — there is nowhere for them to go.
    pub fn detach(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.run().await {
                tracing::warn!(error = %err, "detached task failed");
            }
        });
    }

    /// Wrap this task's producer with `middleware`, returning a new task.
    pub fn pipe(self, mw: impl middleware::Middleware<T> + 'static) -> Task<T> {
        let next = self.inner.producer.clone();
        let mw = Arc::new(mw);
        let producer: ProducerFn<T> = Arc::new(move |ctx| {
            let mw = mw.clone();
            let next = next.clone();
            Box::pin(async move { mw.handle(ctx, next).await })
        });
        Task::from_producer(producer, self.inner.cancel.clone())
    }

    /// Apply `mw` only when `cond` holds; otherwise return `self` unchanged.
    pub fn pipe_when(self, cond: bool, mw: impl middleware::Middleware<T> + 'static) -> Task<T> {
        if cond {
            self.pipe(mw)
        } else {
            self
        }
    }
}

/// Resolve after `duration`, or fail with `TaskError::Cancelled` if
/// `cancel` fires first.
pub fn delay(duration: Duration, cancel: CancellationToken) -> Task<()> {
    Task::new(move |ctx| {
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(()),
                _ = cancel.cancelled() => Err(TaskError::Cancelled),
                _ = ctx.cancel.cancelled() => Err(TaskError::Cancelled),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn construction_does_not_run_producer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let _task: Task<u32> = Task::new(move |_ctx| {
            calls2.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_memoizes_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let task: Task<u32> = Task::new(move |_ctx| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            }
        });

        assert_eq!(task.run().await.unwrap(), 7);
        assert_eq!(task.run().await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_before_run_short_circuits() {
        let task: Task<u32> = Task::new(|_ctx| async { Ok(1) });
        task.cancel();
        assert!(matches!(task.run().await, Err(TaskError::Cancelled)));
    }

    #[tokio::test]
    async fn detach_runs_in_background() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let task: Task<u32> = Task::new(move |_ctx| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            }
        });
        task.detach();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delay_resolves_after_duration() {
        let task = delay(Duration::from_millis(10), CancellationToken::new());
        let start = tokio::time::Instant::now();
        task.run().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn delay_cancelled_fails_fast() {
        let cancel = CancellationToken::new();
        let task = delay(Duration::from_secs(5), cancel.clone());
        cancel.cancel();
        assert!(matches!(task.run().await, Err(TaskError::Cancelled)));
    }
}
