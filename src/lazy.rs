use std::{
    fmt,
    future::IntoFuture,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::warn;

use crate::{
    chain_dependency::Dependency,
    extended::{
        Chainable, ExtendedPromise, IntoPromise, OnFulfilled, OnRejected, ProgressHandler,
        Settlement, Update,
    },
    Error,
};

type Factory<T> = Box<dyn FnOnce() -> ExtendedPromise<T> + Send>;

enum LazyState<T> {
    Waiting(Factory<T>),
    Running,
    Ready(ExtendedPromise<T>),
}

/// A promise whose construction is deferred until it is first used.
///
/// The factory runs at most once; every later use sees the same promise. A
/// panicking factory yields a rejected promise.
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use chainpromise::{Chainable, LazyPromise};
///
/// let calls = Arc::new(AtomicUsize::new(0));
/// let counter = calls.clone();
/// let lazy = LazyPromise::new(move || {
///     counter.fetch_add(1, Ordering::SeqCst);
///     Ok(5)
/// });
/// assert_eq!(calls.load(Ordering::SeqCst), 0);
/// assert_eq!(lazy.map(|v, _| Ok(v + 1)).wait(), Ok(6));
/// assert_eq!(lazy.clone().wait(), Ok(5));
/// assert_eq!(calls.load(Ordering::SeqCst), 1);
/// ```
pub struct LazyPromise<T> {
    state: Arc<Mutex<LazyState<T>>>,
}

impl<T> Clone for LazyPromise<T> {
    fn clone(&self) -> Self {
        LazyPromise {
            state: self.state.clone(),
        }
    }
}

impl<T> fmt::Debug for LazyPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            LazyState::Waiting(_) => "waiting",
            LazyState::Running => "running",
            LazyState::Ready(_) => "ready",
        };
        f.debug_struct("LazyPromise").field("state", &state).finish()
    }
}

impl<T> LazyPromise<T>
where
    T: Clone + Send + 'static,
{
    /// Defers `factory` until the promise is used.
    pub fn new<F, R>(factory: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoPromise<T>,
    {
        LazyPromise {
            state: Arc::new(Mutex::new(LazyState::Waiting(Box::new(move || {
                factory().into_promise(None)
            })))),
        }
    }

    /// Whether the factory has run.
    pub fn is_started(&self) -> bool {
        !matches!(&*self.state.lock(), LazyState::Waiting(_))
    }

    /// The underlying promise, running the factory on first call.
    pub fn promise(&self) -> ExtendedPromise<T> {
        let factory = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, LazyState::Running) {
                LazyState::Waiting(factory) => factory,
                LazyState::Ready(promise) => {
                    *state = LazyState::Ready(promise.clone());
                    return promise;
                }
                LazyState::Running => {
                    warn!("lazy promise used by its own factory");
                    return ExtendedPromise::reject(Error::SelfResolution);
                }
            }
        };

        let promise = panic::catch_unwind(AssertUnwindSafe(factory))
            .unwrap_or_else(|payload| ExtendedPromise::reject(Error::from_panic(payload)));
        *self.state.lock() = LazyState::Ready(promise.clone());
        promise
    }

    /// The dependency handle of the underlying promise.
    pub fn dependency(&self) -> Dependency {
        self.promise().dependency()
    }

    /// Cancels the underlying promise.
    pub fn cancel(&self) {
        self.promise().cancel()
    }
}

impl<T> Chainable<T> for LazyPromise<T>
where
    T: Clone + Send + 'static,
{
    fn then<T2, F, G, R1, R2>(&self, on_fulfilled: F, on_rejected: G) -> ExtendedPromise<T2>
    where
        T2: Clone + Send + 'static,
        F: FnOnce(T, &Dependency) -> R1 + Send + 'static,
        G: FnOnce(Error, &Dependency) -> R2 + Send + 'static,
        R1: IntoPromise<T2>,
        R2: IntoPromise<T2>,
    {
        self.promise().then(on_fulfilled, on_rejected)
    }

    fn progress<P>(&self, on_progress: P) -> ExtendedPromise<T>
    where
        P: Fn(Update, &Dependency) -> Update + Send + Sync + 'static,
    {
        self.promise().progress(on_progress)
    }

    fn done_with(
        &self,
        on_fulfilled: Option<OnFulfilled<T>>,
        on_rejected: Option<OnRejected>,
        on_progress: Option<ProgressHandler>,
    ) {
        self.promise()
            .done_with(on_fulfilled, on_rejected, on_progress)
    }
}

impl<T> IntoFuture for LazyPromise<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T, Error>;
    type IntoFuture = Settlement<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.settlement()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_panic_becomes_rejection() {
        let lazy = LazyPromise::<u8>::new(|| -> Result<u8, Error> { panic!("no factory") });
        assert!(!lazy.is_started());
        assert_eq!(
            lazy.promise().peek(),
            Some(Err(Error::Panicked("no factory".into())))
        );
        assert!(lazy.is_started());
    }

    #[test]
    fn reentrant_factory_is_rejected() {
        let slot: Arc<Mutex<Option<LazyPromise<u8>>>> = Arc::default();
        let inner = slot.clone();
        let lazy = LazyPromise::new(move || match inner.lock().take() {
            Some(me) => me.promise(),
            None => ExtendedPromise::resolve(0),
        });
        *slot.lock() = Some(lazy.clone());
        assert_eq!(lazy.promise().peek(), Some(Err(Error::SelfResolution)));
    }
}
