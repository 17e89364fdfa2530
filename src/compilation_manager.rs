//! Queues compile jobs onto the tokio blocking pool and returns finished
//! jobs FIFO as they complete (spec §4.5).

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::compiler;
use crate::errors::CompileError;
use crate::knob::KnobSet;

/// Polls an already-ready future exactly once, without needing an `.await`
/// point — used to pull the output out of a `JoinHandle` we already know
/// (via `is_finished()`) has completed, so `dequeue_compilation` can stay a
/// plain synchronous, non-blocking method.
fn poll_once<F: std::future::Future>(fut: Pin<&mut F>) -> Poll<F::Output> {
    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    fn noop_raw_waker() -> RawWaker {
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    let waker = unsafe { Waker::from_raw(noop_raw_waker()) };
    let mut cx = Context::from_waker(&waker);
    fut.poll(&mut cx)
}

/// Process-wide monotonic counter backing unique library names. Shared
/// across every `ClientGroup`'s `CompilationManager` — it is the one truly
/// cross-group resource (spec §5).
static LIBRARY_TICKET: AtomicU64 = AtomicU64::new(1);

fn next_library_name() -> String {
    let n = LIBRARY_TICKET.fetch_add(1, Ordering::Relaxed);
    format!("halo_lib_{n:08}")
}

pub struct CompileJob {
    pub library_name: String,
    pub knobs: KnobSet,
    pub started_at: DateTime<Utc>,
    pub result: Result<Vec<u8>, CompileError>,
}

pub struct CompilationManager {
    inflight: VecDeque<(String, KnobSet, DateTime<Utc>, JoinHandle<Result<Vec<u8>, CompileError>>)>,
}

impl Default for CompilationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilationManager {
    pub fn new() -> Self {
        CompilationManager {
            inflight: VecDeque::new(),
        }
    }

    /// Generates a unique library name, spawns the (CPU-bound) compile onto
    /// tokio's blocking pool so the event loop is never stalled, and pushes
    /// the handle onto the FIFO.
    pub fn enqueue_compilation(&mut self, bitcode: Vec<u8>, knobs: KnobSet) -> String {
        let library_name = next_library_name();
        let started_at = Utc::now();
        let knobs_for_job = knobs.clone();
        let handle = tokio::task::spawn_blocking(move || compiler::compile(&bitcode, &knobs_for_job));
        self.inflight.push_back((library_name.clone(), knobs, started_at, handle));
        library_name
    }

    /// Non-blocking: returns `Some(job)` only when the front of the queue is
    /// ready. Never reorders — a ready job behind a pending one waits.
    pub fn dequeue_compilation(&mut self) -> Option<CompileJob> {
        let ready = matches!(self.inflight.front(), Some((_, _, _, h)) if h.is_finished());
        if !ready {
            return None;
        }
        let (library_name, knobs, started_at, mut handle) = self.inflight.pop_front()?;
        let result = match poll_once(Pin::new(&mut handle)) {
            Poll::Ready(Ok(r)) => r,
            Poll::Ready(Err(_)) => Err(CompileError::Cancelled),
            Poll::Pending => unreachable!("front of queue was checked ready above"),
        };
        Some(CompileJob {
            library_name,
            knobs,
            started_at,
            result,
        })
    }

    pub fn jobs_in_flight(&self) -> usize {
        self.inflight.len()
    }
}
