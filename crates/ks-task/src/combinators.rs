//! Lazy combinators mirroring `Promise.all`/`allSettled`/`race`/`any`.
//!
//! Each combinator itself returns a `Task`, so composing `all(tasks)` with
//! `.pipe(timeout(..))` times out the whole group rather than any one
//! member.

use futures::stream::{FuturesUnordered, StreamExt};

use crate::{Task, TaskCtx, TaskError, TaskResult};

/// Resolve with every task's value, in input order; fail fast on the
/// first task that fails.
pub fn all<T: Clone + Send + Sync + 'static>(tasks: Vec<Task<T>>) -> Task<Vec<T>> {
    Task::new(move |ctx: TaskCtx| {
        let tasks = tasks.clone();
        async move {
            let mut values = Vec::with_capacity(tasks.len());
            for task in &tasks {
                if ctx.is_cancelled() {
                    return Err(TaskError::Cancelled);
                }
                values.push(task.run().await?);
            }
            Ok(values)
        }
    })
}

/// Resolve with every task's outcome (success or failure), never failing
/// itself.
pub fn all_settled<T: Clone + Send + Sync + 'static>(
    tasks: Vec<Task<T>>,
) -> Task<Vec<TaskResult<T>>> {
    Task::new(move |_ctx| {
        let tasks = tasks.clone();
        async move {
            let mut results = Vec::with_capacity(tasks.len());
            for task in &tasks {
                results.push(task.run().await);
            }
            Ok(results)
        }
    })
}

/// Settle with whichever task finishes first, success or failure.
pub fn race<T: Clone + Send + Sync + 'static>(tasks: Vec<Task<T>>) -> Task<T> {
    Task::new(move |_ctx| {
        let tasks = tasks.clone();
        async move {
            let mut pending: FuturesUnordered<_> =
                tasks.iter().map(|t| Box::pin(t.run())).collect();
            match pending.next().await {
                Some(result) => result,
                None => Err(TaskError::Cancelled),
            }
        }
    })
}

/// Resolve with the first success; fail only once every task has failed.
pub fn any<T: Clone + Send + Sync + 'static>(tasks: Vec<Task<T>>) -> Task<T> {
    Task::new(move |_ctx| {
        let tasks = tasks.clone();
        async move {
            let mut pending: FuturesUnordered<_> =
                tasks.iter().map(|t| Box::pin(t.run())).collect();
            let mut last_err = TaskError::Cancelled;
            while let Some(result) = pending.next().await {
                match result {
                    Ok(value) => return Ok(value),
                    Err(err) => last_err = err,
                }
            }
            Err(last_err)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn all_collects_in_order() {
        let tasks = vec![Task::ready(1), Task::ready(2), Task::ready(3)];
        assert_eq!(all(tasks).run().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn all_fails_fast() {
        let tasks = vec![Task::ready(1), Task::failed(TaskError::Cancelled)];
        assert!(all(tasks).run().await.is_err());
    }

    #[tokio::test]
    async fn all_settled_never_fails() {
        let tasks = vec![Task::ready(1), Task::failed(TaskError::Cancelled)];
        let results = all_settled(tasks).run().await.unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[tokio::test]
    async fn any_succeeds_despite_one_failure() {
        let tasks = vec![Task::failed(TaskError::Cancelled), Task::ready(9)];
        assert_eq!(any(tasks).run().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn any_fails_when_all_fail() {
        let tasks = vec![
            Task::failed(TaskError::Cancelled),
            Task::failed(TaskError::TimedOut(Duration::from_secs(1))),
        ];
        assert!(any(tasks).run().await.is_err());
    }

    #[tokio::test]
    async fn race_returns_first_settled() {
        let fast: Task<u32> = Task::new(|_ctx| async { Ok(1) });
        let slow: Task<u32> = Task::new(|_ctx| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(2)
        });
        assert_eq!(race(vec![fast, slow]).run().await.unwrap(), 1);
    }
}
