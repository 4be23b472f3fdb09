use std::{
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    extended::ExtendedPromise,
    lazy::LazyPromise,
    promise::Promise,
    settled::{FulfilledPromise, RejectedPromise},
};

/// Something that can be asked to cancel.
pub trait Cancellable: Send + 'static {
    /// Requests cancellation.
    fn cancel(&self);
}

impl<T: Clone + Send + 'static> Cancellable for ExtendedPromise<T> {
    fn cancel(&self) {
        ExtendedPromise::cancel(self)
    }
}

impl<T: Clone + Send + 'static> Cancellable for Promise<T> {
    fn cancel(&self) {
        Promise::cancel(self)
    }
}

impl<T: Clone + Send + 'static> Cancellable for LazyPromise<T> {
    fn cancel(&self) {
        LazyPromise::cancel(self)
    }
}

impl<T: Clone + Send + 'static> Cancellable for FulfilledPromise<T> {
    fn cancel(&self) {}
}

impl<T: Clone + Send + 'static> Cancellable for RejectedPromise<T> {
    fn cancel(&self) {}
}

impl Cancellable for CancellationQueue {
    fn cancel(&self) {
        CancellationQueue::cancel(self)
    }
}

#[derive(Default)]
struct QueueState {
    started: bool,
    queue: VecDeque<Box<dyn Cancellable>>,
}

/// Cancels a group of promises together.
///
/// Items enqueued after [`cancel`](Self::cancel) are cancelled right away.
/// Cancelling twice has no further effect.
///
/// ```
/// use chainpromise::{CancellationQueue, Error, Promise};
///
/// let queue = CancellationQueue::new();
/// let p = Promise::<u8>::cancellable(|_| {}, |r| r.reject(Error::reason("stop")));
/// queue.enqueue(p.clone());
/// queue.cancel();
/// assert!(!p.is_pending());
/// ```
#[derive(Clone, Default)]
pub struct CancellationQueue {
    state: Arc<Mutex<QueueState>>,
}

impl fmt::Debug for CancellationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CancellationQueue")
            .field("started", &state.started)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl CancellationQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an item, cancelling it at once if the queue was already
    /// cancelled.
    pub fn enqueue(&self, item: impl Cancellable) {
        let drain = {
            let mut state = self.state.lock();
            state.queue.push_back(Box::new(item));
            state.started && state.queue.len() == 1
        };
        if drain {
            self.drain();
        }
    }

    /// Cancels every queued item, in insertion order.
    ///
    /// # Panics
    /// If an item panics while cancelling, the remaining items are still
    /// cancelled and the first panic is resumed afterwards.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if state.started {
                return;
            }
            state.started = true;
        }
        self.drain();
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().started
    }

    /// Number of items waiting to be cancelled.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no item is waiting to be cancelled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&self) {
        let mut first_panic = None;
        loop {
            let next = self.state.lock().queue.pop_front();
            let Some(item) = next else { break };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| item.cancel())) {
                debug!("cancellation of queued item panicked");
                if first_panic.is_none() {
                    first_panic = Some(payload);
                }
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
    }
}
