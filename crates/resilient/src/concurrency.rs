//! Bounded-concurrency execution
//!
//! This module provides:
//! - [`ConcurrencyLimiter`] - semaphore-backed ticket pool with load tracking
//! - [`BoundedConcurrencyRunner`] - runs a fixed set of operations with a ceiling
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 BoundedConcurrencyRunner                     │
//! │                                                              │
//! │   ready queue ──► acquire ticket ──► tokio::spawn(op.call)  │
//! │        ▲                                     │               │
//! │        │          ┌──────────────────────────┘               │
//! │        │          ▼                                          │
//! │   dispatch next ◄── completion (slot filled, ticket dropped) │
//! │                                                              │
//! │   ConcurrencyLimiter: [T1] [T2] ... [Tn]  (n = ceiling)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Results are written into per-index slots so output order always matches
//! input order, whatever order tasks finish in.

use std::any::Any;
use std::convert::Infallible;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::AppError;
use crate::operation::Operation;

/// How a batch reacts to failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Stop dispatching on the first error and return it
    #[default]
    FailFast,
    /// Run everything and return every result
    CollectAll,
}

impl std::fmt::Display for JoinMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailFast => write!(f, "fail_fast"),
            Self::CollectAll => write!(f, "collect_all"),
        }
    }
}

impl std::str::FromStr for JoinMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fail_fast" | "fail-fast" => Ok(Self::FailFast),
            "collect_all" | "collect-all" | "settled" => Ok(Self::CollectAll),
            other => Err(format!("unknown join mode: {other}")),
        }
    }
}

struct LimiterState {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Pool of concurrency tickets
///
/// Tickets come from a tokio [`Semaphore`], so grant and release are
/// indivisible and the number in use never exceeds the ceiling. Load
/// counters are tracked with atomics alongside for observability.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    state: Arc<LimiterState>,
}

impl ConcurrencyLimiter {
    /// Create a limiter with `max_concurrency` tickets (at least one)
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            state: Arc::new(LimiterState {
                semaphore: Arc::new(Semaphore::new(max_concurrency)),
                max_concurrency,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a ticket
    pub async fn acquire(&self) -> Result<ConcurrencyTicket, AppError> {
        let permit = Arc::clone(&self.state.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| AppError::service("concurrency limiter closed").with_cause(e))?;
        Ok(self.issue(permit))
    }

    /// Take a ticket if one is free right now
    pub fn try_acquire(&self) -> Option<ConcurrencyTicket> {
        Arc::clone(&self.state.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.issue(permit))
    }

    fn issue(&self, permit: OwnedSemaphorePermit) -> ConcurrencyTicket {
        let load = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(load, Ordering::SeqCst);
        ConcurrencyTicket {
            _permit: permit,
            state: Arc::clone(&self.state),
        }
    }

    /// Configured ceiling
    pub fn max_concurrency(&self) -> usize {
        self.state.max_concurrency
    }

    /// Tickets currently held
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of tickets held at once
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// Tickets available right now
    pub fn available(&self) -> usize {
        self.state.semaphore.available_permits()
    }

    /// Stop issuing tickets; pending and future `acquire` calls fail
    ///
    /// Tickets already held stay valid until dropped.
    pub fn close(&self) {
        self.state.semaphore.close();
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.state.semaphore.is_closed()
    }
}

/// Permit to run one task; returned to the pool when dropped
pub struct ConcurrencyTicket {
    _permit: OwnedSemaphorePermit,
    state: Arc<LimiterState>,
}

impl Drop for ConcurrencyTicket {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Outcome of [`BoundedConcurrencyRunner::run`]
#[derive(Debug, PartialEq)]
pub enum JoinOutcome<T, E> {
    /// Result of a [`JoinMode::FailFast`] run
    FailFast(Result<Vec<T>, E>),
    /// Results of a [`JoinMode::CollectAll`] run, in input order
    Settled(Vec<Result<T, E>>),
}

impl<T, E> JoinOutcome<T, E> {
    /// Collapse to a single result; a settled batch fails on its first error in input order
    pub fn into_result(self) -> Result<Vec<T>, E> {
        match self {
            Self::FailFast(result) => result,
            Self::Settled(results) => results.into_iter().collect(),
        }
    }
}

type Slot<T, E> = (usize, Option<Result<T, E>>, ConcurrencyTicket);

/// Runs independent operations with a concurrency ceiling
///
/// Each operation runs on its own tokio task while holding a
/// [`ConcurrencyTicket`]. Dropping a run future cancels every task it
/// started; a fail-fast run that returns an error leaves tasks already in
/// flight to finish on their own.
///
/// # Example
///
/// ```ignore
/// use resilient::concurrency::BoundedConcurrencyRunner;
///
/// let runner = BoundedConcurrencyRunner::new(4);
/// let posts = runner.run_all(ids.into_iter().map(|id| client.get_post_op(id)).collect()).await?;
/// ```
#[derive(Debug, Clone)]
pub struct BoundedConcurrencyRunner {
    concurrency: usize,
}

impl BoundedConcurrencyRunner {
    /// Create a runner with the given ceiling (at least one)
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Configured ceiling
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run in the given mode
    pub async fn run<O>(&self, ops: Vec<O>, mode: JoinMode) -> JoinOutcome<O::Output, O::Error>
    where
        O: Operation + 'static,
        O::Output: 'static,
        O::Error: From<AppError> + 'static,
    {
        match mode {
            JoinMode::FailFast => JoinOutcome::FailFast(self.run_all(ops).await),
            JoinMode::CollectAll => JoinOutcome::Settled(self.run_all_settled(ops).await),
        }
    }

    /// Run all operations, failing fast on the first error
    ///
    /// Successes already collected are discarded when an error wins.
    pub async fn run_all<O>(&self, ops: Vec<O>) -> Result<Vec<O::Output>, O::Error>
    where
        O: Operation + 'static,
        O::Output: 'static,
        O::Error: From<AppError> + 'static,
    {
        self.run_all_with(ops, ConcurrencyLimiter::new(self.concurrency))
            .await
    }

    /// Like [`run_all`](Self::run_all) but drawing tickets from a shared limiter
    pub async fn run_all_with<O>(
        &self,
        ops: Vec<O>,
        limiter: ConcurrencyLimiter,
    ) -> Result<Vec<O::Output>, O::Error>
    where
        O: Operation + 'static,
        O::Output: 'static,
        O::Error: From<AppError> + 'static,
    {
        let mut slots = empty_slots(ops.len());
        let flow = self
            .drive(ops, &limiter, |index, result| match result {
                Ok(output) => {
                    slots[index] = Some(Ok(output));
                    ControlFlow::Continue(())
                }
                Err(error) => ControlFlow::Break(error),
            })
            .await;

        if let ControlFlow::Break(error) = flow {
            return Err(error);
        }
        settle(slots, &limiter).into_iter().collect()
    }

    /// Run all operations and return every result in input order
    pub async fn run_all_settled<O>(&self, ops: Vec<O>) -> Vec<Result<O::Output, O::Error>>
    where
        O: Operation + 'static,
        O::Output: 'static,
        O::Error: From<AppError> + 'static,
    {
        self.run_all_settled_with(ops, ConcurrencyLimiter::new(self.concurrency))
            .await
    }

    /// Like [`run_all_settled`](Self::run_all_settled) but drawing tickets from a shared limiter
    pub async fn run_all_settled_with<O>(
        &self,
        ops: Vec<O>,
        limiter: ConcurrencyLimiter,
    ) -> Vec<Result<O::Output, O::Error>>
    where
        O: Operation + 'static,
        O::Output: 'static,
        O::Error: From<AppError> + 'static,
    {
        let mut slots = empty_slots(ops.len());
        let flow = self
            .drive(ops, &limiter, |index, result| {
                slots[index] = Some(result);
                ControlFlow::<Infallible>::Continue(())
            })
            .await;

        match flow {
            ControlFlow::Continue(()) => settle(slots, &limiter),
            ControlFlow::Break(never) => match never {},
        }
    }

    /// Dispatch `ops` under `limiter`, handing each result to `on_result`
    ///
    /// A `Break` from `on_result` stops dispatch at once and is returned;
    /// tasks already in flight are left to finish. A ticket goes back to the
    /// limiter only after its result has been handed over, so nothing is
    /// dispatched behind a result that breaks the loop.
    #[instrument(skip_all, fields(total = ops.len(), concurrency = limiter.max_concurrency()))]
    async fn drive<O, B, F>(
        &self,
        ops: Vec<O>,
        limiter: &ConcurrencyLimiter,
        mut on_result: F,
    ) -> ControlFlow<B>
    where
        O: Operation + 'static,
        O::Output: 'static,
        O::Error: From<AppError> + 'static,
        F: FnMut(usize, Result<O::Output, O::Error>) -> ControlFlow<B>,
    {
        let cancel = CancellationToken::new();
        let cancel_on_drop = cancel.clone().drop_guard();

        let mut queue = ops.into_iter().enumerate();
        let mut next = queue.next();
        let mut running: FuturesUnordered<JoinHandle<Slot<O::Output, O::Error>>> =
            FuturesUnordered::new();

        debug!("dispatching operations");

        loop {
            tokio::select! {
                biased;

                Some(joined) = running.next(), if !running.is_empty() => {
                    let (index, outcome, ticket) = match joined {
                        Ok(slot) => slot,
                        Err(join_error) => {
                            error!(%join_error, "operation task failed to join");
                            continue;
                        }
                    };
                    let Some(result) = outcome else { continue };

                    debug!(index, ok = result.is_ok(), "operation completed");
                    if let ControlFlow::Break(stop) = on_result(index, result) {
                        warn!(index, in_flight = running.len(), "operation failed, no further dispatch");
                        // Leave in-flight tasks running to completion
                        cancel_on_drop.disarm();
                        return ControlFlow::Break(stop);
                    }
                    drop(ticket);
                }

                ticket = limiter.acquire(), if next.is_some() => {
                    if let Some((index, op)) = next.take() {
                        next = queue.next();
                        match ticket {
                            Ok(ticket) => running.push(spawn_slot(index, op, ticket, cancel.clone())),
                            Err(error) => {
                                warn!(index, %error, "no ticket for operation");
                                if let ControlFlow::Break(stop) = on_result(index, Err(error.into())) {
                                    cancel_on_drop.disarm();
                                    return ControlFlow::Break(stop);
                                }
                            }
                        }
                    }
                }

                else => break,
            }
        }

        ControlFlow::Continue(())
    }
}

fn empty_slots<T, E>(total: usize) -> Vec<Option<Result<T, E>>> {
    (0..total).map(|_| None).collect()
}

/// Fill slots whose task never reported back and log the batch summary
fn settle<T, E>(slots: Vec<Option<Result<T, E>>>, limiter: &ConcurrencyLimiter) -> Vec<Result<T, E>>
where
    E: From<AppError>,
{
    let results: Vec<_> = slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| {
                Err(AppError::service(format!("operation {index} did not complete")).into())
            })
        })
        .collect();

    info!(
        succeeded = results.iter().filter(|r| r.is_ok()).count(),
        failed = results.iter().filter(|r| r.is_err()).count(),
        peak = limiter.peak(),
        "batch finished"
    );
    results
}

fn spawn_slot<O>(
    index: usize,
    op: O,
    ticket: ConcurrencyTicket,
    cancel: CancellationToken,
) -> JoinHandle<Slot<O::Output, O::Error>>
where
    O: Operation + 'static,
    O::Output: 'static,
    O::Error: From<AppError> + 'static,
{
    tokio::spawn(async move {
        // The ticket rides back with the result; a dropped JoinHandle releases it on completion
        tokio::select! {
            _ = cancel.cancelled() => (index, None, ticket),
            outcome = AssertUnwindSafe(op.call()).catch_unwind() => {
                let result = outcome.unwrap_or_else(|panic| Err(panic_error(panic).into()));
                (index, Some(result), ticket)
            }
        }
    })
}

fn panic_error(panic: Box<dyn Any + Send>) -> AppError {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    AppError::service("operation panicked").with_cause(detail)
}

/// Run all operations with the given ceiling, failing fast
pub async fn run_all<O>(ops: Vec<O>, concurrency: usize) -> Result<Vec<O::Output>, O::Error>
where
    O: Operation + 'static,
    O::Output: 'static,
    O::Error: From<AppError> + 'static,
{
    BoundedConcurrencyRunner::new(concurrency).run_all(ops).await
}

/// Run all operations with the given ceiling, collecting every result
pub async fn run_all_settled<O>(ops: Vec<O>, concurrency: usize) -> Vec<Result<O::Output, O::Error>>
where
    O: Operation + 'static,
    O::Output: 'static,
    O::Error: From<AppError> + 'static,
{
    BoundedConcurrencyRunner::new(concurrency).run_all_settled(ops).await
}
