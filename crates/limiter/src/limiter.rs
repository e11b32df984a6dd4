use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::LimiterError;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;
type Launch = Box<dyn FnOnce(SlotGuard) -> Job + Send>;

/// A queued task that has not been admitted yet.
struct Entry {
    launch: Launch,
    group_key: String,
}

struct State {
    active: usize,
    pending: VecDeque<Entry>,
}

struct Inner {
    max_concurrent: usize,
    state: Mutex<State>,
}

/// Bounds the number of simultaneously running tasks submitted by any caller.
///
/// Cloning yields another handle to the same queue and counter.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("active", &self.active_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ConcurrencyLimiter {
    /// Creates a limiter admitting at most `max_concurrent` running tasks.
    ///
    /// A cap of zero would never admit anything and is raised to one.
    pub fn new(max_concurrent: usize) -> Self {
        if max_concurrent == 0 {
            warn!("concurrency cap of 0 raised to 1");
        }
        Self {
            inner: Arc::new(Inner {
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(State {
                    active: 0,
                    pending: VecDeque::new(),
                }),
            }),
        }
    }

    /// Queues `run_task` under `group_key` and tries to admit it.
    ///
    /// `run_task` is called at most once, on a spawned tokio task, only after
    /// admission. The returned handle resolves to the task's output unchanged,
    /// or to [`LimiterError::Discarded`] if the entry was removed by
    /// [`cancel_group`](Self::cancel_group) or the task panicked.
    ///
    /// Admission spawns onto the current tokio runtime; entries queued outside
    /// a runtime wait until the next admission that happens inside one.
    pub fn enqueue<F, Fut, T>(&self, run_task: F, group_key: impl Into<String>) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let launch: Launch = Box::new(move |mut slot: SlotGuard| -> Job {
            Box::pin(async move {
                let output = run_task().await;
                // Free the slot, deliver the result, then admit the next entry
                // when `slot` drops.
                slot.release();
                let _ = tx.send(output);
                drop(slot);
            })
        });

        let group_key = group_key.into();
        trace!(group = %group_key, "task queued");
        self.inner.lock().pending.push_back(Entry { launch, group_key });
        self.inner.admit();

        TaskHandle { rx }
    }

    /// Removes every queued, not yet started entry of `group_key`.
    ///
    /// Returns how many entries were removed. Their handles resolve to
    /// [`LimiterError::Discarded`]; running tasks are not touched.
    pub fn cancel_group(&self, group_key: &str) -> usize {
        let removed: VecDeque<Entry> = {
            let mut state = self.inner.lock();
            let (removed, kept): (VecDeque<Entry>, VecDeque<Entry>) = state
                .pending
                .drain(..)
                .partition(|entry| entry.group_key == group_key);
            state.pending = kept;
            removed
        };

        let count = removed.len();
        if count > 0 {
            debug!(group = %group_key, removed = count, "pending tasks removed");
        }
        count
    }

    /// Number of tasks started and not yet settled.
    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    /// Number of queued tasks waiting for admission.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Number of queued tasks of `group_key` waiting for admission.
    pub fn pending_for(&self, group_key: &str) -> usize {
        self.inner
            .lock()
            .pending
            .iter()
            .filter(|entry| entry.group_key == group_key)
            .count()
    }

    /// The admission cap.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // No code panics while holding the lock, so a poisoned state is intact.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts queued entries while slots are free.
    fn admit(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; queued tasks stay pending");
            return;
        };

        let mut ready = Vec::new();
        {
            let mut state = self.lock();
            while state.active < self.max_concurrent {
                let Some(entry) = state.pending.pop_front() else {
                    break;
                };
                state.active += 1;
                ready.push(entry);
            }
        }

        for entry in ready {
            trace!(group = %entry.group_key, "task admitted");
            let slot = SlotGuard {
                inner: Arc::clone(self),
                released: false,
            };
            runtime.spawn((entry.launch)(slot));
        }
    }
}

/// Holds one admission slot; releasing it on drop keeps the counter right
/// even when the task panics.
struct SlotGuard {
    inner: Arc<Inner>,
    released: bool,
}

impl SlotGuard {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            let mut state = self.inner.lock();
            state.active = state.active.saturating_sub(1);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
        self.inner.admit();
    }
}

/// Completion of a task submitted with [`ConcurrencyLimiter::enqueue`].
///
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, LimiterError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| LimiterError::Discarded))
    }
}
