//! Stream: abstraction over a device command queue.
//!
//! Grounded on `emu_core`'s `launch.rs`/`spawn.rs` (`Spawner`, `unsafe fn
//! launch`) for the enqueue/dispatch shape, generalized into an explicit
//! ordered worker rather than calling straight into wgpu, since the actual
//! driver is an out-of-scope external collaborator here. Operations
//! submitted to the same stream execute in submission order (spec §4.6,
//! §5); different streams have no ordering guarantee relative to each
//! other.

use crate::accelerator::BackendTag;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Per-launch dispatch state. The user-visible state machine collapses
/// `Submitted`+`Executing` into `Pending` (spec §4.6).
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchState {
    Pending,
    Complete(std::result::Result<(), Error>),
}

struct Inner {
    queue: Mutex<VecDeque<(u64, Job)>>,
    cv: Condvar,
    submitted: AtomicU64,
    completed: AtomicU64,
    last_error: Mutex<Option<Error>>,
    shutdown: AtomicBool,
    disposed: AtomicBool,
}

/// A device-owned queue handle plus a back-reference to the accelerator
/// that created it and a sequence counter.
pub struct Stream {
    accelerator_id: u64,
    backend: BackendTag,
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Stream {
    pub fn new(accelerator_id: u64, backend: BackendTag) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            last_error: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });
        let worker_inner = inner.clone();
        let handle = std::thread::spawn(move || run_worker(worker_inner));
        Self { accelerator_id, backend, inner, worker: Mutex::new(Some(handle)) }
    }

    pub fn accelerator_id(&self) -> u64 {
        self.accelerator_id
    }

    pub fn backend(&self) -> BackendTag {
        self.backend
    }

    fn check_disposed(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            Err(Error::StreamDisposed)
        } else {
            Ok(())
        }
    }

    /// Enqueues `job` for execution; fast and synchronous, just queues
    /// work. Returns the sequence number assigned to this job.
    pub fn enqueue(&self, job: Job) -> Result<u64> {
        self.check_disposed()?;
        let seq = self.inner.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.queue.lock().push_back((seq, job));
        self.inner.cv.notify_all();
        Ok(seq)
    }

    /// Blocks until every job submitted before this call has drained.
    pub fn synchronize(&self) -> Result<()> {
        self.check_disposed()?;
        let target = self.inner.submitted.load(Ordering::SeqCst);
        wait_until_drained(&self.inner, target)
    }

    /// The async counterpart to [`synchronize`](Self::synchronize) (spec
    /// §4.6): returns a future that resolves once every job submitted
    /// before this call has drained, without blocking the calling thread.
    /// `crate::launch::AsyncLaunch` is backed directly by this rather than
    /// polling `state_of` itself (spec §4.7 step 2).
    pub fn synchronize_async(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let (tx, rx) = futures::channel::oneshot::channel();
        match self.check_disposed() {
            Err(e) => {
                let _ = tx.send(Err(e));
            }
            Ok(()) => {
                let target = self.inner.submitted.load(Ordering::SeqCst);
                let inner = self.inner.clone();
                std::thread::spawn(move || {
                    let result = wait_until_drained(&inner, target);
                    let _ = tx.send(result);
                });
            }
        }
        async move { rx.await.unwrap_or(Err(Error::StreamDisposed)) }
    }

    /// Returns the dispatch state of the job with sequence number `seq`
    /// without blocking.
    pub fn state_of(&self, seq: u64) -> DispatchState {
        state_of(&self.inner, seq)
    }

    /// A thread-safe closure over this stream's completion state, usable
    /// by `crate::launch::AsyncLaunch`'s background wait without needing
    /// to share the `Stream` itself (which owns a worker `JoinHandle`)
    /// across threads.
    pub fn state_checker(&self) -> Box<dyn Fn(u64) -> DispatchState + Send> {
        let inner = self.inner.clone();
        Box::new(move |seq| state_of(&inner, seq))
    }

    /// Explicitly marks the stream disposed. Subsequent operations return
    /// `Error::StreamDisposed` — the program-error case spec §4.6 calls
    /// out for destroying a stream an `AsyncLaunch` future still
    /// references; in-flight device work already enqueued still drains.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.inner.disposed.store(true, Ordering::Release);
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cv.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Blocks the calling thread until `completed >= target`, then returns
/// the stream's last error if one occurred. Shared by `synchronize` (the
/// caller's own thread blocks) and `synchronize_async` (a background
/// thread blocks on the caller's behalf).
fn wait_until_drained(inner: &Arc<Inner>, target: u64) -> Result<()> {
    let mut guard = inner.queue.lock();
    while inner.completed.load(Ordering::SeqCst) < target && !inner.shutdown.load(Ordering::Acquire) {
        inner.cv.wait(&mut guard);
    }
    drop(guard);
    match inner.last_error.lock().clone() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn state_of(inner: &Arc<Inner>, seq: u64) -> DispatchState {
    if inner.completed.load(Ordering::SeqCst) >= seq {
        match inner.last_error.lock().clone() {
            Some(e) => DispatchState::Complete(Err(e)),
            None => DispatchState::Complete(Ok(())),
        }
    } else {
        DispatchState::Pending
    }
}

fn run_worker(inner: Arc<Inner>) {
    loop {
        let job = {
            let mut guard = inner.queue.lock();
            loop {
                if let Some(item) = guard.pop_front() {
                    break Some(item);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                inner.cv.wait(&mut guard);
            }
        };
        let Some((seq, job)) = job else { break };
        // Execute outside the queue lock: no user callback runs while
        // holding a lock, per spec §5's lock-discipline rule.
        let result = job();
        if let Err(e) = &result {
            *inner.last_error.lock() = Some(e.clone());
        }
        inner.completed.store(seq, Ordering::SeqCst);
        inner.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_on_same_stream_execute_in_order() {
        let stream = Stream::new(0, BackendTag::Cpu);
        let observed = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let observed = observed.clone();
            stream.enqueue(Box::new(move || {
                observed.lock().push(i);
                Ok(())
            })).unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*observed.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn synchronize_surfaces_job_error() {
        let stream = Stream::new(0, BackendTag::Cpu);
        stream.enqueue(Box::new(|| Err(Error::Driver { detail: "boom".into() }))).unwrap();
        let err = stream.synchronize().unwrap_err();
        assert!(matches!(err, Error::Driver { .. }));
    }

    #[test]
    fn synchronize_async_resolves_after_drain() {
        let stream = Stream::new(0, BackendTag::Cpu);
        let observed = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let observed = observed.clone();
            stream.enqueue(Box::new(move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                observed.lock().push(i);
                Ok(())
            })).unwrap();
        }
        let fut = stream.synchronize_async();
        futures::executor::block_on(fut).unwrap();
        assert_eq!(*observed.lock(), (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn synchronize_async_surfaces_disposed_error() {
        let stream = Stream::new(0, BackendTag::Cpu);
        stream.dispose();
        let fut = stream.synchronize_async();
        let err = futures::executor::block_on(fut).unwrap_err();
        assert!(matches!(err, Error::StreamDisposed));
    }

    #[test]
    fn disposed_stream_rejects_enqueue() {
        let stream = Stream::new(0, BackendTag::Cpu);
        stream.dispose();
        let result = stream.enqueue(Box::new(|| Ok(())));
        assert!(matches!(result, Err(Error::StreamDisposed)));
    }
}
