use std::{
    fmt,
    future::IntoFuture,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    chain_dependency::Dependency,
    extended::{
        unwrap_chain, Chainable, ExtendedPromise, IntoPromise, OnFulfilled,
        OnRejected, ProgressHandler, Settlement, Update,
    },
    settled::RejectedPromise,
    Error,
};

/// Cancellation callback of a [`Promise`].
///
/// It receives the promise's [`Resolvers`], so it may settle the promise
/// (typically by rejecting it).
pub type Canceller<T> = Box<dyn FnOnce(Resolvers<T>) + Send>;

type Handler<T> = Box<dyn FnOnce(ExtendedPromise<T>) + Send>;
type OnProgress = Arc<dyn Fn(Update, &Dependency) -> Update + Send + Sync>;

/// A promise that is settled from the outside through its [`Resolvers`].
///
/// # States
/// A promise is pending until its resolver (or anyone holding its
/// [`Resolvers`]) resolves it. Resolving it with another pending promise makes
/// it follow that promise; it is still pending, but its outcome is already
/// decided. Once settled, the outcome never changes and further resolution
/// attempts are ignored.
///
/// # Cancellation
/// A promise created with a canceller can be cancelled with
/// [`cancel`](Self::cancel). Every promise derived from it through
/// [`then`](Chainable::then) and friends counts as one cancellation request;
/// the canceller only runs once every derived promise asked for it.
///
/// # Panics
/// A panic inside the resolver, the canceller or any handler is caught and
/// rejects the affected promise with [`Error::Panicked`]. Unhandled
/// rejections re-raised by [`done`](Chainable::done) are the exception: every
/// other handler still runs, then the first of them is resumed to whoever
/// settled the promise.
///
/// ```
/// use std::thread;
/// use chainpromise::{Chainable, Promise};
///
/// let p = Promise::new(|resolvers| {
///     thread::spawn(move || resolvers.fulfill(21));
/// })
/// .map(|v, _| Ok(v * 2));
/// assert_eq!(p.wait(), Ok(42));
/// ```
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    dependency: Dependency,
}

struct State<T> {
    canceller: Option<Canceller<T>>,
    result: Option<ExtendedPromise<T>>,
    handlers: Vec<Handler<T>>,
    progress_handlers: Vec<ProgressHandler>,
    pending_cancel_requests: usize,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Promise")
            .field("settled", &state.result.is_some())
            .field("handlers", &state.handlers.len())
            .field("cancellable", &state.canceller.is_some())
            .field("pending_cancel_requests", &state.pending_cancel_requests)
            .finish()
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a promise and runs `resolver` immediately.
    pub fn new(resolver: impl FnOnce(Resolvers<T>)) -> Self {
        Self::with_dependency(resolver, None, Dependency::new())
    }

    /// Creates a cancellable promise and runs `resolver` immediately.
    ///
    /// ```
    /// use chainpromise::{Chainable, Error, Promise};
    ///
    /// let p = Promise::<u8>::cancellable(
    ///     |_| {},
    ///     |resolvers| resolvers.reject(Error::reason("cancelled")),
    /// );
    /// p.cancel();
    /// assert_eq!(p.wait(), Err(Error::reason("cancelled")));
    /// ```
    pub fn cancellable(
        resolver: impl FnOnce(Resolvers<T>),
        canceller: impl FnOnce(Resolvers<T>) + Send + 'static,
    ) -> Self {
        Self::with_dependency(resolver, Some(Box::new(canceller)), Dependency::new())
    }

    /// Creates a promise carrying `dependency`.
    pub fn with_dependency(
        resolver: impl FnOnce(Resolvers<T>),
        canceller: Option<Canceller<T>>,
        dependency: Dependency,
    ) -> Self {
        let promise = Promise {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    canceller,
                    result: None,
                    handlers: Vec::new(),
                    progress_handlers: Vec::new(),
                    pending_cancel_requests: 0,
                }),
                dependency,
            }),
        };
        promise.call(resolver);
        promise
    }

    /// The dependency handle of this promise.
    pub fn dependency(&self) -> &Dependency {
        &self.inner.dependency
    }

    /// Whether no outcome has been decided yet.
    ///
    /// A promise that follows another pending promise is not pending in this
    /// sense; use [`ExtendedPromise::is_pending`] to look through the chain.
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().result.is_none()
    }

    /// Requests cancellation.
    ///
    /// Runs the canceller (at most once). If this promise follows another
    /// pending promise, the request is forwarded to it and counts against
    /// its outstanding cancellation requests.
    pub fn cancel(&self) {
        let (canceller, result) = {
            let mut state = self.inner.state.lock();
            (state.canceller.take(), state.result.clone())
        };

        let mut parent = None;
        if let Some(result) = result {
            match unwrap_chain(result) {
                ExtendedPromise::Pending(root) if root.is_pending() => {
                    if root.release_dependent() {
                        parent = Some(root);
                    }
                }
                _ => return,
            }
        }

        if let Some(canceller) = canceller {
            debug!("running promise canceller");
            self.call(canceller);
        }
        if let Some(parent) = parent {
            parent.cancel();
        }
    }

    pub(crate) fn result(&self) -> Option<ExtendedPromise<T>> {
        self.inner.state.lock().result.clone()
    }

    #[cfg(test)]
    pub(crate) fn pending_cancel_requests(&self) -> usize {
        self.inner.state.lock().pending_cancel_requests
    }

    fn ptr_eq(&self, other: &Promise<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn add_dependent(&self) {
        self.inner.state.lock().pending_cancel_requests += 1;
    }

    /// Returns `true` once no dependent is left.
    fn release_dependent(&self) -> bool {
        let mut state = self.inner.state.lock();
        state.pending_cancel_requests = state.pending_cancel_requests.saturating_sub(1);
        trace!(
            remaining = state.pending_cancel_requests,
            "released cancellation request"
        );
        state.pending_cancel_requests == 0
    }

    fn call(&self, callback: impl FnOnce(Resolvers<T>)) {
        let resolvers = Resolvers {
            promise: self.clone(),
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(resolvers))) {
            let reason = Error::from_panic(payload);
            debug!(%reason, "promise callback panicked");
            self.reject(reason);
        }
    }

    fn resolve(&self, value: impl IntoPromise<T>) {
        if !self.is_pending() {
            return;
        }
        let promise = value.into_promise(Some(&self.inner.dependency));
        self.settle(promise);
    }

    fn reject(&self, reason: Error) {
        if !self.is_pending() {
            return;
        }
        self.settle(RejectedPromise::with_dependency(reason, self.inner.dependency.clone()).into());
    }

    fn notify(&self, update: Update) {
        let handlers = {
            let state = self.inner.state.lock();
            if state.result.is_some() {
                return;
            }
            state.progress_handlers.clone()
        };
        for handler in handlers {
            handler(update.clone(), &self.inner.dependency);
        }
    }

    fn settle(&self, promise: ExtendedPromise<T>) {
        let mut promise = unwrap_chain(promise);
        let follows_itself = matches!(&promise, ExtendedPromise::Pending(target) if target.ptr_eq(self));
        if follows_itself {
            warn!("promise resolved with itself");
            promise = RejectedPromise::with_dependency(
                Error::SelfResolution,
                self.inner.dependency.clone(),
            )
            .into();
        }

        let handlers = {
            let mut state = self.inner.state.lock();
            if state.result.is_some() {
                return;
            }
            state.result = Some(promise.clone());
            state.progress_handlers.clear();
            std::mem::take(&mut state.handlers)
        };

        if let ExtendedPromise::Pending(target) = &promise {
            target.add_dependent();
        }
        trace!(handlers = handlers.len(), "promise settled");
        let mut first_panic = None;
        for handler in handlers {
            let settled = promise.clone();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(settled))) {
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
    }

    fn register(&self, handler: Handler<T>, on_progress: Option<ProgressHandler>) {
        let mut state = self.inner.state.lock();
        let result = state.result.clone();
        match result {
            Some(result) => {
                drop(state);
                handler(result);
            }
            None => {
                state.handlers.push(handler);
                if let Some(on_progress) = on_progress {
                    state.progress_handlers.push(on_progress);
                }
            }
        }
    }

    /// Derives a promise settled with `transform` applied to this one's
    /// outcome. The derived promise shares the dependency handle and, if this
    /// promise is cancellable, holds one cancellation request on it.
    ///
    /// The derived canceller keeps this promise alive; the reverse link only
    /// lives in the handler list, which is emptied on settlement.
    fn chain<T2, F>(&self, transform: F, on_progress: Option<OnProgress>) -> ExtendedPromise<T2>
    where
        T2: Clone + Send + 'static,
        F: FnOnce(ExtendedPromise<T>) -> ExtendedPromise<T2> + Send + 'static,
    {
        let cancellable = {
            let mut state = self.inner.state.lock();
            let result = state.result.clone();
            if let Some(result) = result {
                drop(state);
                return transform(result);
            }
            if state.canceller.is_some() {
                state.pending_cancel_requests += 1;
            }
            state.canceller.is_some()
        };

        let canceller = cancellable.then(|| {
            let parent = self.clone();
            Box::new(move |_: Resolvers<T2>| {
                if parent.release_dependent() {
                    parent.cancel();
                }
            }) as Canceller<T2>
        });

        let parent = self.clone();
        Promise::with_dependency(
            move |resolvers| parent.forward(transform, on_progress, resolvers),
            canceller,
            self.inner.dependency.clone(),
        )
        .into()
    }

    fn forward<T2, F>(&self, transform: F, on_progress: Option<OnProgress>, resolvers: Resolvers<T2>)
    where
        T2: Clone + Send + 'static,
        F: FnOnce(ExtendedPromise<T>) -> ExtendedPromise<T2> + Send + 'static,
    {
        let progress: ProgressHandler = {
            let resolvers = resolvers.clone();
            match on_progress {
                Some(on_progress) => Arc::new(move |update: Update, dependency: &Dependency| {
                    match panic::catch_unwind(AssertUnwindSafe(|| on_progress(update, dependency))) {
                        Ok(update) => resolvers.notify(update),
                        Err(payload) => resolvers.reject(Error::from_panic(payload)),
                    }
                }) as ProgressHandler,
                None => Arc::new(move |update: Update, _: &Dependency| resolvers.notify(update)),
            }
        };

        let downstream = progress.clone();
        let handler: Handler<T> = Box::new(move |settled: ExtendedPromise<T>| {
            let on_reject = resolvers.clone();
            transform(settled).done_with(
                Some(Box::new(move |value: T2, _: &Dependency| resolvers.fulfill(value))),
                Some(Box::new(move |reason: Error, _: &Dependency| on_reject.reject(reason))),
                Some(downstream),
            );
        });
        self.register(handler, Some(progress));
    }
}

impl<T> Chainable<T> for Promise<T>
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
        self.chain(move |settled| settled.then(on_fulfilled, on_rejected), None)
    }

    fn progress<P>(&self, on_progress: P) -> ExtendedPromise<T>
    where
        P: Fn(Update, &Dependency) -> Update + Send + Sync + 'static,
    {
        self.chain(|settled| settled, Some(Arc::new(on_progress)))
    }

    fn done_with(
        &self,
        on_fulfilled: Option<OnFulfilled<T>>,
        on_rejected: Option<OnRejected>,
        on_progress: Option<ProgressHandler>,
    ) {
        self.register(
            Box::new(move |settled: ExtendedPromise<T>| {
                settled.done_with(on_fulfilled, on_rejected, None)
            }),
            on_progress,
        );
    }
}

impl<T> IntoFuture for Promise<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T, Error>;
    type IntoFuture = Settlement<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.settlement()
    }
}

/// Capabilities to settle a [`Promise`], handed to its resolver and
/// canceller.
///
/// Only the first resolution counts; later calls are ignored. The handle may
/// be moved to another thread.
pub struct Resolvers<T> {
    promise: Promise<T>,
}

impl<T> Clone for Resolvers<T> {
    fn clone(&self) -> Self {
        Resolvers {
            promise: self.promise.clone(),
        }
    }
}

impl<T> fmt::Debug for Resolvers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolvers")
            .field("promise", &self.promise)
            .finish()
    }
}

impl<T> Resolvers<T>
where
    T: Clone + Send + 'static,
{
    /// Resolves with anything promise-like; a pending promise is followed.
    pub fn resolve(&self, value: impl IntoPromise<T>) {
        self.promise.resolve(value)
    }

    /// Fulfils with `value`.
    pub fn fulfill(&self, value: T) {
        self.promise.resolve(Ok::<T, Error>(value))
    }

    /// Rejects with `reason`.
    pub fn reject(&self, reason: Error) {
        self.promise.reject(reason)
    }

    /// Sends a progress update to the registered progress handlers.
    pub fn notify(&self, update: Update) {
        self.promise.notify(update)
    }

    /// The dependency handle of the promise.
    pub fn dependency(&self) -> &Dependency {
        self.promise.dependency()
    }

    /// Whether the promise is still waiting for an outcome.
    pub fn is_pending(&self) -> bool {
        self.promise.is_pending()
    }
}
