//! Middlewares that wrap a `Task`'s producer: retry, timeout, fallback,
//! hedging, observe, bulkhead.
//!
//! Each is a value, not a class: construct it with its parameters and
//! hand it to [`crate::Task::pipe`]. They compose left-to-right —
//! `task.pipe(retry).pipe(timeout)` times out the whole retry loop,
//! while `task.pipe(timeout).pipe(retry)` times out (and retries) each
//! individual attempt.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::{BoxFuture, ProducerFn, TaskCtx, TaskError, TaskResult};

/// A middleware wraps the next producer in the chain. `next` is the
/// producer it wraps (the inner `Task`'s producer, or the next
/// middleware inward).
#[async_trait]
pub trait Middleware<T>: Send + Sync {
    async fn handle(&self, ctx: TaskCtx, next: ProducerFn<T>) -> TaskResult<T>;
}

/// Which failures a middleware acts on.
///
/// `TreatFalseAsError` exists for boolean-returning engine operations
/// (`acquire`, `add`, ...) composed with a task middleware: the caller
/// adapts the `bool` into a `TaskResult<bool>` where `false` is mapped to
/// a sentinel error before this policy is consulted.
pub enum ErrorPolicy {
    All,
    Predicate(Arc<dyn Fn(&TaskError) -> bool + Send + Sync>),
    TreatFalseAsError,
}

impl ErrorPolicy {
    pub fn predicate(f: impl Fn(&TaskError) -> bool + Send + Sync + 'static) -> Self {
        ErrorPolicy::Predicate(Arc::new(f))
    }

    pub fn matches(&self, err: &TaskError) -> bool {
        match self {
            ErrorPolicy::All => true,
            ErrorPolicy::Predicate(f) => f(err),
            ErrorPolicy::TreatFalseAsError => true,
        }
    }
}

impl Clone for ErrorPolicy {
    fn clone(&self) -> Self {
        match self {
            ErrorPolicy::All => ErrorPolicy::All,
            ErrorPolicy::Predicate(f) => ErrorPolicy::Predicate(f.clone()),
            ErrorPolicy::TreatFalseAsError => ErrorPolicy::TreatFalseAsError,
        }
    }
}

/// `(attempt) -> wait duration`, 1-indexed attempt number.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

pub fn constant_backoff(wait: Duration) -> BackoffFn {
    Arc::new(move |_attempt| wait)
}

pub fn linear_backoff(base: Duration) -> BackoffFn {
    Arc::new(move |attempt| base * attempt)
}

pub fn exponential_backoff(base: Duration, max: Duration) -> BackoffFn {
    Arc::new(move |attempt| {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        (base * factor).min(max)
    })
}

pub fn polynomial_backoff(base: Duration, exponent: f64, max: Duration) -> BackoffFn {
    Arc::new(move |attempt| {
        let scaled = base.as_secs_f64() * (attempt as f64).powf(exponent);
        Duration::from_secs_f64(scaled).min(max)
    })
}

/// Add up to `fraction` (0.0-1.0) of random jitter on top of `backoff`.
pub fn with_jitter(backoff: BackoffFn, fraction: f64) -> BackoffFn {
    let fraction = fraction.clamp(0.0, 1.0);
    Arc::new(move |attempt| {
        let base = backoff(attempt);
        if fraction == 0.0 {
            return base;
        }
        let jitter_max = base.as_secs_f64() * fraction;
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_max);
        base + Duration::from_secs_f64(jitter)
    })
}

// ───────────────────────── retry ─────────────────────────

pub struct Retry {
    pub max_attempts: u32,
    pub backoff: BackoffFn,
    pub error_policy: ErrorPolicy,
}

impl Retry {
    pub fn new(max_attempts: u32, backoff: BackoffFn, error_policy: ErrorPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            error_policy,
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Middleware<T> for Retry {
    async fn handle(&self, ctx: TaskCtx, next: ProducerFn<T>) -> TaskResult<T> {
        let mut attempt = 1;
        loop {
            if ctx.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            match next(ctx.child()).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && self.error_policy.matches(&err) => {
                    let wait = (self.backoff)(attempt);
                    tracing::debug!(attempt, ?wait, "retrying task");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = ctx.cancel.cancelled() => return Err(TaskError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ───────────────────────── timeout ─────────────────────────

pub struct Timeout {
    pub wait_time: Duration,
}

impl Timeout {
    pub fn new(wait_time: Duration) -> Self {
        Self { wait_time }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Middleware<T> for Timeout {
    async fn handle(&self, ctx: TaskCtx, next: ProducerFn<T>) -> TaskResult<T> {
        let inner_cancel = ctx.cancel.child_token();
        let run = next(TaskCtx {
            cancel: inner_cancel.clone(),
            name: ctx.name.clone(),
        });
        tokio::select! {
            result = run => result,
            _ = tokio::time::sleep(self.wait_time) => {
                inner_cancel.cancel();
                Err(TaskError::TimedOut(self.wait_time))
            }
            _ = ctx.cancel.cancelled() => {
                inner_cancel.cancel();
                Err(TaskError::Cancelled)
            }
        }
    }
}

// ───────────────────────── fallback ─────────────────────────

pub enum FallbackValue<T> {
    Value(T),
    Fn(Arc<dyn Fn(&TaskError) -> T + Send + Sync>),
}

pub struct Fallback<T> {
    pub value: FallbackValue<T>,
    pub error_policy: ErrorPolicy,
}

impl<T> Fallback<T> {
    pub fn value(value: T, error_policy: ErrorPolicy) -> Self {
        Self {
            value: FallbackValue::Value(value),
            error_policy,
        }
    }

    pub fn from_fn(
        f: impl Fn(&TaskError) -> T + Send + Sync + 'static,
        error_policy: ErrorPolicy,
    ) -> Self {
        Self {
            value: FallbackValue::Fn(Arc::new(f)),
            error_policy,
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Middleware<T> for Fallback<T> {
    async fn handle(&self, ctx: TaskCtx, next: ProducerFn<T>) -> TaskResult<T> {
        match next(ctx).await {
            Ok(value) => Ok(value),
            Err(err) if self.error_policy.matches(&err) => Ok(match &self.value {
                FallbackValue::Value(v) => v.clone(),
                FallbackValue::Fn(f) => f(&err),
            }),
            Err(err) => Err(err),
        }
    }
}

// ───────────────────────── hedging ─────────────────────────

/// Invoke alternate producers in addition to the primary; return the
/// first success.
pub enum Hedging<T> {
    /// Try alternates one at a time, in order, after the primary fails.
    Sequential(Vec<ProducerFn<T>>),
    /// Race the primary against all alternates at once.
    Concurrent(Vec<ProducerFn<T>>),
}

#[async_trait]
impl<T: Send + Sync + 'static> Middleware<T> for Hedging<T> {
    async fn handle(&self, ctx: TaskCtx, next: ProducerFn<T>) -> TaskResult<T> {
        match self {
            Hedging::Sequential(alternates) => {
                let mut last_err = match next(ctx.child()).await {
                    Ok(value) => return Ok(value),
                    Err(err) => err,
                };
                for alt in alternates {
                    if ctx.is_cancelled() {
                        return Err(TaskError::Cancelled);
                    }
                    match alt(ctx.child()).await {
                        Ok(value) => return Ok(value),
                        Err(err) => last_err = err,
                    }
                }
                Err(last_err)
            }
            Hedging::Concurrent(alternates) => {
                use futures::stream::{FuturesUnordered, StreamExt};

                let mut pending: FuturesUnordered<BoxFuture<'static, TaskResult<T>>> =
                    FuturesUnordered::new();
                pending.push(next(ctx.child()));
                for alt in alternates {
                    pending.push(alt(ctx.child()));
                }

                let mut last_err = TaskError::Cancelled;
                while let Some(result) = pending.next().await {
                    match result {
                        Ok(value) => return Ok(value),
                        Err(err) => last_err = err,
                    }
                }
                Err(last_err)
            }
        }
    }
}

// ───────────────────────── observe ─────────────────────────

type ObserveHook<T> = Option<Arc<dyn Fn(&T) + Send + Sync>>;
type ObserveErrHook = Option<Arc<dyn Fn(&TaskError) + Send + Sync>>;
type ObserveVoidHook = Option<Arc<dyn Fn() + Send + Sync>>;

#[derive(Default)]
pub struct Observe<T> {
    pub on_start: ObserveVoidHook,
    pub on_success: ObserveHook<T>,
    pub on_error: ObserveErrHook,
    pub on_finally: ObserveVoidHook,
}

impl<T> Observe<T> {
    pub fn new() -> Self {
        Self {
            on_start: None,
            on_success: None,
            on_error: None,
            on_finally: None,
        }
    }

    pub fn on_start(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    pub fn on_success(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&TaskError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_finally(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_finally = Some(Arc::new(f));
        self
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Middleware<T> for Observe<T> {
    async fn handle(&self, ctx: TaskCtx, next: ProducerFn<T>) -> TaskResult<T> {
        if let Some(f) = &self.on_start {
            f();
        }
        let result = next(ctx).await;
        match &result {
            Ok(value) => {
                if let Some(f) = &self.on_success {
                    f(value);
                }
            }
            Err(err) => {
                if let Some(f) = &self.on_error {
                    f(err);
                }
            }
        }
        if let Some(f) = &self.on_finally {
            f();
        }
        result
    }
}

// ───────────────────────── bulkhead ─────────────────────────

/// Limit the number of concurrent in-flight executions of the wrapped
/// producer across all tasks sharing this `Bulkhead` instance.
pub struct Bulkhead {
    semaphore: Arc<tokio::sync::Semaphore>,
    in_flight: Arc<AtomicU32>,
}

impl Bulkhead {
    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(tokio::sync::Semaphore::new(concurrency)),
            in_flight: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Middleware<T> for Bulkhead {
    async fn handle(&self, ctx: TaskCtx, next: ProducerFn<T>) -> TaskResult<T> {
        let permit = tokio::select! {
            permit = self.semaphore.acquire() => permit.map_err(|_| TaskError::Cancelled)?,
            _ = ctx.cancel.cancelled() => return Err(TaskError::Cancelled),
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = next(ctx).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Task;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_stops_on_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a2 = attempts.clone();
        let task: Task<u32> = Task::new(move |_ctx| {
            let attempts = a2.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(TaskError::from_err(anyhow::anyhow!("transient")))
                } else {
                    Ok(n)
                }
            }
        })
        .pipe(Retry::new(5, constant_backoff(Duration::from_millis(1)), ErrorPolicy::All));

        assert_eq!(task.run().await.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let task: Task<u32> = Task::new(|_ctx| async { Err(TaskError::from_err(anyhow::anyhow!("nope"))) })
            .pipe(Retry::new(2, constant_backoff(Duration::from_millis(1)), ErrorPolicy::All));
        assert!(task.run().await.is_err());
    }

    #[tokio::test]
    async fn timeout_fails_slow_producer() {
        let task: Task<u32> = Task::new(|_ctx| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(1)
        })
        .pipe(Timeout::new(Duration::from_millis(5)));
        assert!(matches!(task.run().await, Err(TaskError::TimedOut(_))));
    }

    #[tokio::test]
    async fn fallback_substitutes_on_error() {
        let task: Task<u32> = Task::new(|_ctx| async { Err(TaskError::from_err(anyhow::anyhow!("boom"))) })
            .pipe(Fallback::value(99, ErrorPolicy::All));
        assert_eq!(task.run().await.unwrap(), 99);
    }

    #[tokio::test]
    async fn observe_hooks_fire() {
        let started = Arc::new(AtomicU32::new(0));
        let succeeded = Arc::new(AtomicU32::new(0));
        let s1 = started.clone();
        let s2 = succeeded.clone();
        let task: Task<u32> = Task::new(|_ctx| async { Ok(5) }).pipe(
            Observe::new()
                .on_start(move || {
                    s1.fetch_add(1, Ordering::SeqCst);
                })
                .on_success(move |_v| {
                    s2.fetch_add(1, Ordering::SeqCst);
                }),
        );
        task.run().await.unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(succeeded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bulkhead_caps_concurrency() {
        let bulkhead = Arc::new(Bulkhead::new(1));
        let b1 = bulkhead.clone();
        let b2 = bulkhead.clone();

        let make = |bulkhead: Arc<Bulkhead>, peak: Arc<AtomicU32>| {
            Task::new(move |ctx: TaskCtx| {
                let peak = peak.clone();
                let cancel = ctx.cancel.clone();
                let bulkhead = bulkhead.clone();
                async move {
                    let _ = cancel;
                    let current = bulkhead.in_flight();
                    peak.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<u32, TaskError>(1)
                }
            })
        };

        let peak = Arc::new(AtomicU32::new(0));
        let t1 = make(b1, peak.clone()).pipe(BulkheadRef(bulkhead.clone()));
        let t2 = make(b2, peak.clone()).pipe(BulkheadRef(bulkhead));

        let (_r1, _r2) = tokio::join!(t1.run(), t2.run());
        assert!(peak.load(Ordering::SeqCst) <= 1);
    }

    /// Test-only adapter: `Bulkhead` itself isn't `Clone`-free to share
    /// across two pipelines without an `Arc` wrapper at the call site.
    struct BulkheadRef(Arc<Bulkhead>);

    #[async_trait]
    impl<T: Send + Sync + 'static> Middleware<T> for BulkheadRef {
        async fn handle(&self, ctx: TaskCtx, next: ProducerFn<T>) -> TaskResult<T> {
            self.0.handle(ctx, next).await
        }
    }
}
