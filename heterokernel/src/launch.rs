//! AsyncLaunch: wraps an enqueue+synchronize into a cancellable completion
//! future, plus the launch-dimension builder.
//!
//! The dimension-collapsing builder is grounded on `emu_core`'s
//! `launch.rs`/`spawn.rs` (`Spawner::spawn`/`get_work_space_dim`, which
//! folds more than three spawned dimensions into the x axis). The
//! future/cancellation model is grounded on spec §4.7 directly: enqueue is
//! synchronous and fast, the future is backed by a background wait on
//! `synchronize_async`, and cancellation affects only the host future —
//! in-flight device work is not revoked.

use crate::error::{Error, Result};
use crate::stream::Stream;
use futures::future::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Grid/block thread-launch configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_memory_bytes: u32,
}

impl LaunchConfig {
    pub fn new(grid: (u32, u32, u32), block: (u32, u32, u32)) -> Self {
        Self { grid, block, shared_memory_bytes: 0 }
    }

    pub fn with_shared_memory(mut self, bytes: u32) -> Self {
        self.shared_memory_bytes = bytes;
        self
    }

    pub fn total_threads(&self) -> u64 {
        let (gx, gy, gz) = self.grid;
        let (bx, by, bz) = self.block;
        gx as u64 * gy as u64 * gz as u64 * bx as u64 * by as u64 * bz as u64
    }
}

/// Builds a grid by spawning one dimension at a time, collapsing any
/// dimension beyond the third into the x axis — the same strategy
/// `Spawner::get_work_space_dim` uses, needed because real device grids
/// are capped at three dimensions.
#[derive(Debug, Clone, Default)]
pub struct Spawner {
    dims: Vec<u32>,
}

pub fn spawn(n: u32) -> Spawner {
    Spawner { dims: vec![n] }
}

impl Spawner {
    pub fn spawn(mut self, n: u32) -> Self {
        self.dims.push(n);
        self
    }

    pub fn work_space_dim(&self) -> Result<(u32, u32, u32)> {
        match self.dims.len() {
            0 => Err(Error::UnsupportedParameter { detail: "no dimensions spawned".into() }),
            1 => Ok((self.dims[0], 1, 1)),
            2 => Ok((self.dims[0], self.dims[1], 1)),
            3 => Ok((self.dims[0], self.dims[1], self.dims[2])),
            _ => {
                let collapsed_x: u64 = self.dims[2..].iter().map(|&d| d as u64).product::<u64>()
                    * self.dims[0] as u64;
                let x = u32::try_from(collapsed_x).map_err(|_| Error::UnsupportedParameter {
                    detail: "collapsed dimension overflowed u32".into(),
                })?;
                Ok((x, self.dims[1], 1))
            }
        }
    }
}

/// Monotonic completion state: Pending -> (Done | Cancelled), never
/// reversed.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchOutcome {
    Done(std::result::Result<(), Error>),
    Cancelled,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl std::fmt::Debug for TokenInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenInner").field("cancelled", &self.cancelled.load(Ordering::SeqCst)).finish()
    }
}

/// A cancellation handle shared between the caller and an in-flight
/// `AsyncLaunch`. Triggering it only affects the host-side future; the
/// device work it was waiting on keeps running to completion and its side
/// effects still occur.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<TokenInner>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token cancelled and wakes whichever task last registered
    /// itself via `register`, so a future parked on a real executor
    /// (not just a tight re-poll loop) is re-polled promptly instead of
    /// waiting for the device work it was watching to finish on its own.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        if let Some(waker) = self.0.waker.lock().take() {
            waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Registers `waker` as the one `cancel()` should wake. Called on
    /// every `poll` before checking `is_cancelled` so a `cancel()` racing
    /// with this poll is still observed (either by this poll's own
    /// cancellation check, or by waking the just-registered waker).
    fn register(&self, waker: &Waker) {
        *self.0.waker.lock() = Some(waker.clone());
    }
}

/// A future that resolves once the stream has drained past the enqueued
/// launch it was created for, or immediately with `Cancelled` if its
/// token is triggered first.
pub struct AsyncLaunch {
    receiver: futures::channel::oneshot::Receiver<std::result::Result<(), Error>>,
    token: CancellationToken,
}

impl AsyncLaunch {
    /// Enqueues `job` on `stream` and returns a future tracking its
    /// completion. The future is backed by a background task that awaits
    /// `stream.synchronize_async()` (spec §4.7 step 2), matching the
    /// teacher's async-over-opaque-driver model: host futures, device-side
    /// fire-and-forget.
    pub fn enqueue(stream: &Stream, job: crate::stream::Job, token: CancellationToken) -> Result<Self> {
        stream.enqueue(job)?;
        let sync = stream.synchronize_async();
        let (tx, rx) = futures::channel::oneshot::channel();
        std::thread::spawn(move || {
            let outcome = futures::executor::block_on(sync);
            let _ = tx.send(outcome);
        });
        Ok(Self { receiver: rx, token })
    }
}

impl Future for AsyncLaunch {
    type Output = LaunchOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Register before checking, not after: if `cancel()` races with
        // this poll, it either fires before registration (in which case
        // the check below observes it) or after (in which case it wakes
        // the waker just registered here) — either way cancellation is
        // never missed.
        self.token.register(cx.waker());
        if self.token.is_cancelled() {
            return Poll::Ready(LaunchOutcome::Cancelled);
        }
        match self.receiver.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(LaunchOutcome::Done(result)),
            Poll::Ready(Err(_)) => Poll::Ready(LaunchOutcome::Done(Err(Error::StreamDisposed))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Resolves once every future in `futures` has resolved.
pub async fn when_all(futures: Vec<AsyncLaunch>) -> Vec<LaunchOutcome> {
    let mut out = Vec::with_capacity(futures.len());
    for f in futures {
        out.push(f.await);
    }
    out
}

/// Resolves as soon as any future in `futures` resolves; the rest keep
/// running (their device work is unaffected either way).
pub async fn when_any(futures: Vec<AsyncLaunch>) -> LaunchOutcome {
    let (outcome, _index, _rest) = futures::future::select_all(futures.into_iter().map(Box::pin)).await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawner_collapses_beyond_three_dims() {
        let dim = spawn(2).spawn(3).spawn(4).spawn(5).work_space_dim().unwrap();
        assert_eq!(dim, (2 * 4 * 5, 3, 1));
    }

    #[test]
    fn spawner_one_two_three_dims_pass_through() {
        assert_eq!(spawn(7).work_space_dim().unwrap(), (7, 1, 1));
        assert_eq!(spawn(7).spawn(8).work_space_dim().unwrap(), (7, 8, 1));
        assert_eq!(spawn(7).spawn(8).spawn(9).work_space_dim().unwrap(), (7, 8, 9));
    }

    #[test]
    fn async_completion_ordering_scenario_6() {
        use crate::accelerator::BackendTag;
        let stream = Arc::new(Stream::new(0, BackendTag::Cpu));
        let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let obs_a = observed.clone();
        let fut_a = AsyncLaunch::enqueue(
            &stream,
            Box::new(move || {
                obs_a.lock().push('A');
                Ok(())
            }),
            CancellationToken::new(),
        ).unwrap();

        let token_b = CancellationToken::new();
        let obs_b = observed.clone();
        let fut_b = AsyncLaunch::enqueue(
            &stream,
            Box::new(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                obs_b.lock().push('B');
                Ok(())
            }),
            token_b.clone(),
        ).unwrap();

        token_b.cancel();

        let outcome_b = futures::executor::block_on(fut_b);
        assert_eq!(outcome_b, LaunchOutcome::Cancelled);

        let outcome_a = futures::executor::block_on(fut_a);
        assert!(matches!(outcome_a, LaunchOutcome::Done(Ok(()))));

        // Device work for B still ran to completion even though its host
        // future observed Cancelled.
        stream.synchronize().unwrap();
        assert_eq!(*observed.lock(), vec!['A', 'B']);
    }

    #[test]
    fn cancel_while_pending_wakes_a_parked_future_promptly() {
        use crate::accelerator::BackendTag;
        let stream = Arc::new(Stream::new(0, BackendTag::Cpu));
        let token = CancellationToken::new();

        let fut = AsyncLaunch::enqueue(
            &stream,
            Box::new(|| {
                std::thread::sleep(std::time::Duration::from_secs(2));
                Ok(())
            }),
            token.clone(),
        ).unwrap();

        let canceller = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            canceller.cancel();
        });

        let start = std::time::Instant::now();
        // `futures::executor::block_on` parks the thread on `Poll::Pending`
        // and only re-polls when its waker fires. If `cancel()` merely
        // flipped a flag without waking anything, this would block for
        // the full 2-second job instead of resolving ~50ms in.
        let outcome = futures::executor::block_on(fut);
        assert_eq!(outcome, LaunchOutcome::Cancelled);
        assert!(
            start.elapsed() < std::time::Duration::from_millis(500),
            "cancellation did not wake the parked future promptly: took {:?}",
            start.elapsed()
        );

        stream.synchronize().unwrap();
    }
}
