//! Scoped resource acquisition
//!
//! `acquire` / `body` / `release` with release guaranteed on every exit path:
//! success, failure, panic inside `body`, and cancellation from an outer
//! guard (the scope future being dropped mid-body). The resource lives in a
//! guard whose `Drop` runs the release callback, so there is no path out of
//! the scope that skips it.
//!
//! The body borrows the resource through a boxed future, the same shape as
//! `sqlx::Connection::transaction`:
//!
//! ```ignore
//! let rows = use_resource(
//!     || pool.checkout(),
//!     |conn| Box::pin(async move { conn.query("select 1").await }),
//!     |conn| pool.checkin(conn),
//! )
//! .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{trace, warn};

use crate::operation::Operation;

/// Owns an acquired resource until it is released exactly once
struct ReleaseGuard<R, Rel, RE>
where
    Rel: FnOnce(R) -> Result<(), RE>,
    RE: fmt::Display,
{
    resource: Option<R>,
    release: Option<Rel>,
    _error: PhantomData<fn() -> RE>,
}

impl<R, Rel, RE> ReleaseGuard<R, Rel, RE>
where
    Rel: FnOnce(R) -> Result<(), RE>,
    RE: fmt::Display,
{
    fn new(resource: R, release: Rel) -> Self {
        Self {
            resource: Some(resource),
            release: Some(release),
            _error: PhantomData,
        }
    }

    fn resource_mut(&mut self) -> &mut R {
        self.resource
            .as_mut()
            .unwrap_or_else(|| unreachable!("resource is only taken by release"))
    }

    fn release(&mut self) {
        let (Some(resource), Some(release)) = (self.resource.take(), self.release.take()) else {
            return;
        };

        match release(resource) {
            Ok(()) => trace!("resource released"),
            Err(error) => warn!(%error, "resource release failed"),
        }
    }
}

impl<R, Rel, RE> Drop for ReleaseGuard<R, Rel, RE>
where
    Rel: FnOnce(R) -> Result<(), RE>,
    RE: fmt::Display,
{
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquire a resource, run `body` with it, and always release it
///
/// If `acquire` fails its error is returned and neither `body` nor `release`
/// runs. Otherwise `release` runs exactly once after `body`, whatever the
/// outcome; a failing release is logged and never replaces `body`'s result.
pub async fn use_resource<R, T, E, RE, A, AF, B, Rel>(acquire: A, body: B, release: Rel) -> Result<T, E>
where
    A: FnOnce() -> AF,
    AF: Future<Output = Result<R, E>>,
    B: for<'r> FnOnce(&'r mut R) -> BoxFuture<'r, Result<T, E>>,
    Rel: FnOnce(R) -> Result<(), RE>,
    RE: fmt::Display,
{
    let resource = acquire().await?;
    let mut guard = ReleaseGuard::new(resource, release);

    let result = body(guard.resource_mut()).await;

    guard.release();
    result
}

/// Re-invocable form of [`use_resource`]
///
/// Every call acquires a fresh resource, so the scope can sit underneath a
/// retry or timeout like any other [`Operation`].
pub struct ResourceScope<R, T, A, B, Rel> {
    acquire: A,
    body: B,
    release: Rel,
    _marker: PhantomData<fn() -> (R, T)>,
}

impl<R, T, A, B, Rel> ResourceScope<R, T, A, B, Rel> {
    /// Build a scope from its three phases
    pub fn new<E, RE, AF>(acquire: A, body: B, release: Rel) -> Self
    where
        A: Fn() -> AF,
        AF: Future<Output = Result<R, E>>,
        B: for<'r> Fn(&'r mut R) -> BoxFuture<'r, Result<T, E>>,
        Rel: Fn(R) -> Result<(), RE>,
        RE: fmt::Display,
    {
        Self {
            acquire,
            body,
            release,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R, T, E, RE, A, AF, B, Rel> Operation for ResourceScope<R, T, A, B, Rel>
where
    A: Fn() -> AF + Send + Sync,
    AF: Future<Output = Result<R, E>> + Send + 'static,
    B: for<'r> Fn(&'r mut R) -> BoxFuture<'r, Result<T, E>> + Send + Sync,
    Rel: Fn(R) -> Result<(), RE> + Send + Sync,
    RE: fmt::Display + 'static,
    R: Send,
    T: Send,
    E: Send + 'static,
{
    type Output = T;
    type Error = E;

    async fn call(&self) -> Result<T, E> {
        use_resource(&self.acquire, &self.body, &self.release).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::operation::OperationExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug)]
    struct Connection {
        id: u32,
        queries: u32,
    }

    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    impl Journal {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    async fn checkout(journal: Arc<Journal>) -> Result<Connection, AppError> {
        journal.push("acquire");
        Ok(Connection { id: 1, queries: 0 })
    }

    fn checkin(journal: &Journal, conn: Connection) -> Result<(), AppError> {
        journal.push(format!("release {} after {} queries", conn.id, conn.queries));
        Ok(())
    }

    fn explode() -> Result<(), AppError> {
        panic!("query planner exploded")
    }

    #[tokio::test]
    async fn test_release_after_success() {
        let journal = Arc::new(Journal::default());

        let result = use_resource(
            || checkout(journal.clone()),
            |conn: &mut Connection| {
                Box::pin(async move {
                    conn.queries += 1;
                    Ok::<_, AppError>(conn.id)
                })
            },
            |conn| checkin(&journal, conn),
        )
        .await;

        assert_eq!(result, Ok(1));
        assert_eq!(journal.entries(), vec!["acquire", "release 1 after 1 queries"]);
    }

    #[tokio::test]
    async fn test_release_after_failure() {
        let journal = Arc::new(Journal::default());

        let result: Result<u32, _> = use_resource(
            || checkout(journal.clone()),
            |conn: &mut Connection| {
                Box::pin(async move {
                    conn.queries += 2;
                    Err(AppError::validation("bad query"))
                })
            },
            |conn| checkin(&journal, conn),
        )
        .await;

        assert_eq!(result, Err(AppError::validation("bad query")));
        assert_eq!(journal.entries(), vec!["acquire", "release 1 after 2 queries"]);
    }

    #[tokio::test]
    async fn test_failed_acquire_skips_body_and_release() {
        let body_runs = AtomicU32::new(0);
        let releases = AtomicU32::new(0);

        let result: Result<(), _> = use_resource(
            || async { Err::<Connection, _>(AppError::transport("pool exhausted")) },
            |_conn: &mut Connection| {
                body_runs.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            },
            |_conn| {
                releases.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AppError>(())
            },
        )
        .await;

        assert_eq!(result, Err(AppError::transport("pool exhausted")));
        assert_eq!(body_runs.load(Ordering::SeqCst), 0);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_release_failure_does_not_override_result() {
        let result = use_resource(
            || async { Ok::<_, AppError>(Connection { id: 9, queries: 0 }) },
            |conn: &mut Connection| Box::pin(async move { Ok(conn.id) }),
            |_conn| Err(AppError::service("checkin failed")),
        )
        .await;

        assert_eq!(result, Ok(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_on_outer_timeout() {
        let journal = Arc::new(Journal::default());

        let scope = use_resource(
            || checkout(journal.clone()),
            |conn: &mut Connection| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, AppError>(conn.id)
                })
            },
            |conn| checkin(&journal, conn),
        );
        let outcome = tokio::time::timeout(Duration::from_millis(50), scope).await;

        assert!(outcome.is_err());
        assert_eq!(journal.entries(), vec!["acquire", "release 1 after 0 queries"]);
    }

    #[tokio::test]
    async fn test_release_on_panic() {
        let releases = Arc::new(AtomicU32::new(0));

        let handle = tokio::spawn({
            let releases = releases.clone();
            async move {
                use_resource(
                    || async { Ok::<_, AppError>(Connection { id: 3, queries: 0 }) },
                    |_conn: &mut Connection| Box::pin(async { explode() }),
                    move |_conn| {
                        releases.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, AppError>(())
                    },
                )
                .await
            }
        });

        let joined = handle.await;
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_operation_releases_every_attempt() {
        let acquired = Arc::new(AtomicU32::new(0));
        let released = Arc::new(AtomicU32::new(0));

        let scope = ResourceScope::new(
            {
                let acquired = acquired.clone();
                move || {
                    let id = acquired.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Ok::<_, AppError>(Connection { id, queries: 0 }) }
                }
            },
            |conn: &mut Connection| {
                Box::pin(async move {
                    if conn.id < 3 {
                        Err(AppError::transport("connection reset"))
                    } else {
                        Ok(conn.id)
                    }
                })
            },
            {
                let released = released.clone();
                move |_conn: Connection| {
                    released.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, AppError>(())
                }
            },
        )
        .with_retry(crate::reliability::RetryPolicy::fixed(Duration::from_millis(5), 5));

        assert_eq!(scope.call().await, Ok(3));
        assert_eq!(acquired.load(Ordering::SeqCst), 3);
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }
}
