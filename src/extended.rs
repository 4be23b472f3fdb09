//! The promise contract shared by every promise type, and the canonical
//! resolution entry point that turns results, promises and foreign
//! promise-likes into one [`ExtendedPromise`].

use std::{
    fmt,
    future::{Future, IntoFuture},
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use parking_lot::Mutex;
use tracing::error;

use crate::{
    chain_dependency::{merge_dependencies, Dependency},
    lazy::LazyPromise,
    promise::{Canceller, Promise, Resolvers},
    settled::{FulfilledPromise, RejectedPromise},
    Error,
};

/// A progress notification.
pub type Update = serde_json::Value;

/// Boxed fulfilment handler as accepted by [`Chainable::done_with`].
pub type OnFulfilled<T> = Box<dyn FnOnce(T, &Dependency) + Send>;

/// Boxed rejection handler as accepted by [`Chainable::done_with`].
pub type OnRejected = Box<dyn FnOnce(Error, &Dependency) + Send>;

/// Progress handler; may run many times.
pub type ProgressHandler = Arc<dyn Fn(Update, &Dependency) + Send + Sync>;

/// Anything a promise can be resolved with.
///
/// This is the canonical resolution entry point: `Ok`/`Err` become settled
/// promises, promises are adopted as they are (their dependency store is
/// merged into the caller's), and boxed [`Thenable`]s are wrapped in a new
/// [`Promise`].
pub trait IntoPromise<T>: Send + 'static {
    /// Normalises `self`, carrying `dependency` when one is given.
    fn into_promise(self, dependency: Option<&Dependency>) -> ExtendedPromise<T>;
}

/// A foreign promise-like value.
///
/// ```
/// use chainpromise::{resolve, Chainable, Resolvers, Thenable};
///
/// struct Ready(u8);
///
/// impl Thenable<u8> for Ready {
///     fn then(self: Box<Self>, resolvers: Resolvers<u8>) {
///         resolvers.fulfill(self.0);
///     }
/// }
///
/// let p = resolve(Box::new(Ready(7)) as Box<dyn Thenable<u8>>);
/// assert_eq!(p.wait(), Ok(7));
/// ```
pub trait Thenable<T>: Send + 'static {
    /// Hands the value over once it is available.
    fn then(self: Box<Self>, resolvers: Resolvers<T>);

    /// Cancellation hook adopted as the wrapping promise's canceller.
    fn canceller(&self) -> Option<Box<dyn FnOnce() + Send>> {
        None
    }
}

/// What a [`done`](Chainable::done) handler may return.
///
/// Returning a promise continues the terminal chain through it; returning
/// `Err` or a rejected promise is an unhandled rejection.
pub trait Outcome {
    /// Ends the chain.
    fn finish(self);
}

impl Outcome for () {
    fn finish(self) {}
}

impl Outcome for Result<(), Error> {
    fn finish(self) {
        if let Err(reason) = self {
            raise_unhandled(reason)
        }
    }
}

/// Logs and re-raises a rejection that reached the end of a `done` chain.
pub(crate) fn raise_unhandled(reason: Error) -> ! {
    error!(%reason, "unhandled promise rejection");
    panic::resume_unwind(Box::new(Error::UnhandledRejection(Box::new(reason))))
}

/// Runs a handler, converting a panic into a rejection that carries
/// `dependency`.
pub(crate) fn call_handler<T, R>(dependency: &Dependency, handler: impl FnOnce() -> R) -> ExtendedPromise<T>
where
    T: Clone + Send + 'static,
    R: IntoPromise<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(result) => result.into_promise(Some(dependency)),
        Err(payload) => {
            RejectedPromise::with_dependency(Error::from_panic(payload), dependency.clone()).into()
        }
    }
}

/// Follows settled results until reaching a settled promise or a promise
/// that is still pending.
pub(crate) fn unwrap_chain<T>(promise: ExtendedPromise<T>) -> ExtendedPromise<T>
where
    T: Clone + Send + 'static,
{
    let mut promise = promise.extract();
    loop {
        let next = match &promise {
            ExtendedPromise::Pending(pending) => pending.result(),
            _ => None,
        };
        match next {
            Some(next) => promise = next.extract(),
            None => return promise,
        }
    }
}

/// The promise contract.
///
/// Handlers receive the settled value or reason together with the chain's
/// [`Dependency`]. Their return value goes through [`IntoPromise`], so a
/// handler may return `Ok`, `Err` or another promise.
///
/// ```
/// use chainpromise::{Chainable, Error, ExtendedPromise};
///
/// let p = ExtendedPromise::resolve(2)
///     .map(|v, _| Ok(v * 10))
///     .then(|v, _| Err::<i32, _>(Error::reason(format!("got {v}"))), |e, _| Err(e))
///     .otherwise(|e, _| Ok(e.to_string().len() as i32));
/// assert_eq!(p.wait(), Ok(6));
/// ```
pub trait Chainable<T>: Sized
where
    T: Clone + Send + 'static,
{
    /// Transforms the outcome with `on_fulfilled` or `on_rejected`.
    fn then<T2, F, G, R1, R2>(&self, on_fulfilled: F, on_rejected: G) -> ExtendedPromise<T2>
    where
        T2: Clone + Send + 'static,
        F: FnOnce(T, &Dependency) -> R1 + Send + 'static,
        G: FnOnce(Error, &Dependency) -> R2 + Send + 'static,
        R1: IntoPromise<T2>,
        R2: IntoPromise<T2>;

    /// Observes progress notifications while the promise is pending.
    ///
    /// The handler's return value is forwarded to the returned promise's own
    /// progress handlers. A panicking handler rejects the returned promise.
    fn progress<P>(&self, on_progress: P) -> ExtendedPromise<T>
    where
        P: Fn(Update, &Dependency) -> Update + Send + Sync + 'static;

    /// Terminal form of [`then`](Self::then) taking optional boxed handlers.
    ///
    /// # Panics
    /// Re-raises an [`Error::UnhandledRejection`] when the promise rejects
    /// and `on_rejected` is `None`.
    fn done_with(
        &self,
        on_fulfilled: Option<OnFulfilled<T>>,
        on_rejected: Option<OnRejected>,
        on_progress: Option<ProgressHandler>,
    );

    /// Transforms the value; a rejection passes through.
    fn map<T2, F, R>(&self, on_fulfilled: F) -> ExtendedPromise<T2>
    where
        T2: Clone + Send + 'static,
        F: FnOnce(T, &Dependency) -> R + Send + 'static,
        R: IntoPromise<T2>,
    {
        self.then(on_fulfilled, |reason, _| Err::<T2, Error>(reason))
    }

    /// Recovers from a rejection; a fulfilment passes through.
    fn otherwise<F, R>(&self, on_rejected: F) -> ExtendedPromise<T>
    where
        F: FnOnce(Error, &Dependency) -> R + Send + 'static,
        R: IntoPromise<T>,
    {
        self.then(|value, _| Ok::<T, Error>(value), on_rejected)
    }

    /// Recovers from rejections accepted by `predicate` only.
    ///
    /// ```
    /// use chainpromise::{Chainable, Error, ExtendedPromise};
    ///
    /// let p = ExtendedPromise::<u8>::reject(Error::SelfResolution)
    ///     .otherwise_if(|e| matches!(e, Error::Reason(_)), |_, _| Ok(1))
    ///     .otherwise_if(|e| matches!(e, Error::SelfResolution), |_, _| Ok(2));
    /// assert_eq!(p.wait(), Ok(2));
    /// ```
    fn otherwise_if<P, F, R>(&self, predicate: P, on_rejected: F) -> ExtendedPromise<T>
    where
        P: FnOnce(&Error) -> bool + Send + 'static,
        F: FnOnce(Error, &Dependency) -> R + Send + 'static,
        R: IntoPromise<T>,
    {
        self.then(
            |value, _| Ok::<T, Error>(value),
            move |reason, dependency| {
                if predicate(&reason) {
                    on_rejected(reason, dependency).into_promise(Some(dependency))
                } else {
                    RejectedPromise::<T>::with_dependency(reason, dependency.clone()).into()
                }
            },
        )
    }

    /// Runs `handler` on either outcome, waits for the promise it returns,
    /// then re-emits the original outcome.
    ///
    /// A rejection of the handler's promise replaces the original outcome.
    fn always<F, U, R>(&self, handler: F) -> ExtendedPromise<T>
    where
        F: Fn(&Dependency) -> R + Send + Sync + 'static,
        U: Clone + Send + 'static,
        R: IntoPromise<U>,
    {
        let handler = Arc::new(handler);
        let on_reject = handler.clone();
        self.then(
            move |value, dependency| {
                call_handler::<U, R>(dependency, || handler(dependency))
                    .map(move |_, _| Ok::<T, Error>(value))
            },
            move |reason, dependency| {
                call_handler::<U, R>(dependency, || on_reject(dependency))
                    .map(move |_, _| Err::<T, Error>(reason))
            },
        )
    }

    /// Terminates the chain with both handlers.
    fn done<F, G, O1, O2>(&self, on_fulfilled: F, on_rejected: G)
    where
        F: FnOnce(T, &Dependency) -> O1 + Send + 'static,
        G: FnOnce(Error, &Dependency) -> O2 + Send + 'static,
        O1: Outcome,
        O2: Outcome,
    {
        self.done_with(
            Some(Box::new(move |value: T, dependency: &Dependency| {
                on_fulfilled(value, dependency).finish()
            })),
            Some(Box::new(move |reason: Error, dependency: &Dependency| {
                on_rejected(reason, dependency).finish()
            })),
            None,
        )
    }

    /// Terminates the chain; a rejection is unhandled.
    ///
    /// # Panics
    /// See [`done_with`](Self::done_with).
    fn done_fulfilled<F, O>(&self, on_fulfilled: F)
    where
        F: FnOnce(T, &Dependency) -> O + Send + 'static,
        O: Outcome,
    {
        self.done_with(
            Some(Box::new(move |value: T, dependency: &Dependency| {
                on_fulfilled(value, dependency).finish()
            })),
            None,
            None,
        )
    }

    /// Terminates the chain without handlers.
    ///
    /// # Panics
    /// See [`done_with`](Self::done_with).
    fn end(&self) {
        self.done_with(None, None, None)
    }

    /// A future resolving to the outcome.
    fn settlement(&self) -> Settlement<T> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let on_reject = tx.clone();
        self.done_with(
            Some(Box::new(move |value: T, _: &Dependency| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Ok(value));
                }
            })),
            Some(Box::new(move |reason: Error, _: &Dependency| {
                if let Some(tx) = on_reject.lock().take() {
                    let _ = tx.send(Err(reason));
                }
            })),
            None,
        );
        Settlement { rx }
    }

    /// Blocks the current thread until the promise settles.
    ///
    /// Returns [`Error::Dropped`] if the promise can no longer settle. Waiting
    /// on a promise that only this thread could settle never returns.
    fn wait(self) -> Result<T, Error> {
        let settlement = self.settlement();
        drop(self);
        settlement.rx.recv().unwrap_or(Err(Error::Dropped))
    }
}

/// Future returned by [`Chainable::settlement`] and by `.await`ing a promise.
pub struct Settlement<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
}

impl<T> fmt::Debug for Settlement<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settlement").finish_non_exhaustive()
    }
}

impl<T> Future for Settlement<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Dropped)))
    }
}

/// Any promise: pending, settled, or lazily constructed.
#[derive(Debug, Clone)]
pub enum ExtendedPromise<T> {
    /// A promise that may still be pending.
    Pending(Promise<T>),
    /// A fulfilled promise.
    Fulfilled(FulfilledPromise<T>),
    /// A rejected promise.
    Rejected(RejectedPromise<T>),
    /// A promise built on first use.
    Lazy(LazyPromise<T>),
}

impl<T> ExtendedPromise<T>
where
    T: Clone + Send + 'static,
{
    /// A promise fulfilled with `value`.
    pub fn resolve(value: T) -> Self {
        FulfilledPromise::new(value).into()
    }

    /// A promise rejected with `reason`.
    pub fn reject(reason: Error) -> Self {
        RejectedPromise::new(reason).into()
    }

    /// A promise settled with `result`.
    pub fn from_result(result: Result<T, Error>) -> Self {
        result.into_promise(None)
    }

    /// Adapts a foreign promise-like value.
    pub fn from_thenable(thenable: impl Thenable<T>) -> Self {
        let thenable: Box<dyn Thenable<T>> = Box::new(thenable);
        thenable.into_promise(None)
    }

    /// The dependency handle of this promise.
    pub fn dependency(&self) -> Dependency {
        match self {
            ExtendedPromise::Pending(promise) => promise.dependency().clone(),
            ExtendedPromise::Fulfilled(promise) => promise.dependency().clone(),
            ExtendedPromise::Rejected(promise) => promise.dependency().clone(),
            ExtendedPromise::Lazy(promise) => promise.promise().dependency(),
        }
    }

    /// Requests cancellation; settled promises ignore it.
    pub fn cancel(&self) {
        match self {
            ExtendedPromise::Pending(promise) => promise.cancel(),
            ExtendedPromise::Fulfilled(promise) => promise.cancel(),
            ExtendedPromise::Rejected(promise) => promise.cancel(),
            ExtendedPromise::Lazy(promise) => promise.cancel(),
        }
    }

    /// The outcome, if the chain has settled.
    pub fn peek(&self) -> Option<Result<T, Error>> {
        match unwrap_chain(self.clone()) {
            ExtendedPromise::Fulfilled(promise) => Some(Ok(promise.value().clone())),
            ExtendedPromise::Rejected(promise) => Some(Err(promise.reason().clone())),
            _ => None,
        }
    }

    /// Whether the chain is still waiting for an outcome.
    pub fn is_pending(&self) -> bool {
        self.peek().is_none()
    }

    fn extract(self) -> Self {
        let mut promise = self;
        while let ExtendedPromise::Lazy(lazy) = promise {
            promise = lazy.promise();
        }
        promise
    }
}

impl<T> Chainable<T> for ExtendedPromise<T>
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
        match self {
            ExtendedPromise::Pending(promise) => promise.then(on_fulfilled, on_rejected),
            ExtendedPromise::Fulfilled(promise) => promise.then(on_fulfilled, on_rejected),
            ExtendedPromise::Rejected(promise) => promise.then(on_fulfilled, on_rejected),
            ExtendedPromise::Lazy(promise) => promise.then(on_fulfilled, on_rejected),
        }
    }

    fn progress<P>(&self, on_progress: P) -> ExtendedPromise<T>
    where
        P: Fn(Update, &Dependency) -> Update + Send + Sync + 'static,
    {
        match self {
            ExtendedPromise::Pending(promise) => promise.progress(on_progress),
            ExtendedPromise::Fulfilled(promise) => promise.progress(on_progress),
            ExtendedPromise::Rejected(promise) => promise.progress(on_progress),
            ExtendedPromise::Lazy(promise) => promise.progress(on_progress),
        }
    }

    fn done_with(
        &self,
        on_fulfilled: Option<OnFulfilled<T>>,
        on_rejected: Option<OnRejected>,
        on_progress: Option<ProgressHandler>,
    ) {
        match self {
            ExtendedPromise::Pending(promise) => {
                promise.done_with(on_fulfilled, on_rejected, on_progress)
            }
            ExtendedPromise::Fulfilled(promise) => {
                promise.done_with(on_fulfilled, on_rejected, on_progress)
            }
            ExtendedPromise::Rejected(promise) => {
                promise.done_with(on_fulfilled, on_rejected, on_progress)
            }
            ExtendedPromise::Lazy(promise) => {
                promise.done_with(on_fulfilled, on_rejected, on_progress)
            }
        }
    }
}

impl<T> IntoFuture for ExtendedPromise<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T, Error>;
    type IntoFuture = Settlement<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.settlement()
    }
}

impl<T> From<Promise<T>> for ExtendedPromise<T> {
    fn from(promise: Promise<T>) -> Self {
        ExtendedPromise::Pending(promise)
    }
}

impl<T> From<FulfilledPromise<T>> for ExtendedPromise<T> {
    fn from(promise: FulfilledPromise<T>) -> Self {
        ExtendedPromise::Fulfilled(promise)
    }
}

impl<T> From<RejectedPromise<T>> for ExtendedPromise<T> {
    fn from(promise: RejectedPromise<T>) -> Self {
        ExtendedPromise::Rejected(promise)
    }
}

impl<T> From<LazyPromise<T>> for ExtendedPromise<T> {
    fn from(promise: LazyPromise<T>) -> Self {
        ExtendedPromise::Lazy(promise)
    }
}

impl<T> From<Result<T, Error>> for ExtendedPromise<T>
where
    T: Clone + Send + 'static,
{
    fn from(result: Result<T, Error>) -> Self {
        ExtendedPromise::from_result(result)
    }
}

impl<T> IntoPromise<T> for Result<T, Error>
where
    T: Clone + Send + 'static,
{
    fn into_promise(self, dependency: Option<&Dependency>) -> ExtendedPromise<T> {
        let dependency = dependency.cloned().unwrap_or_default();
        match self {
            Ok(value) => FulfilledPromise::with_dependency(value, dependency).into(),
            Err(reason) => RejectedPromise::with_dependency(reason, dependency).into(),
        }
    }
}

impl<T> IntoPromise<T> for ExtendedPromise<T>
where
    T: Clone + Send + 'static,
{
    fn into_promise(self, dependency: Option<&Dependency>) -> ExtendedPromise<T> {
        if let Some(target) = dependency {
            merge_dependencies(target, &self.dependency(), true);
        }
        self
    }
}

impl<T> IntoPromise<T> for Promise<T>
where
    T: Clone + Send + 'static,
{
    fn into_promise(self, dependency: Option<&Dependency>) -> ExtendedPromise<T> {
        ExtendedPromise::from(self).into_promise(dependency)
    }
}

impl<T> IntoPromise<T> for FulfilledPromise<T>
where
    T: Clone + Send + 'static,
{
    fn into_promise(self, dependency: Option<&Dependency>) -> ExtendedPromise<T> {
        ExtendedPromise::from(self).into_promise(dependency)
    }
}

impl<T> IntoPromise<T> for RejectedPromise<T>
where
    T: Clone + Send + 'static,
{
    fn into_promise(self, dependency: Option<&Dependency>) -> ExtendedPromise<T> {
        ExtendedPromise::from(self).into_promise(dependency)
    }
}

impl<T> IntoPromise<T> for LazyPromise<T>
where
    T: Clone + Send + 'static,
{
    fn into_promise(self, dependency: Option<&Dependency>) -> ExtendedPromise<T> {
        ExtendedPromise::from(self).into_promise(dependency)
    }
}

impl<T> IntoPromise<T> for Box<dyn Thenable<T>>
where
    T: Clone + Send + 'static,
{
    fn into_promise(self, dependency: Option<&Dependency>) -> ExtendedPromise<T> {
        let canceller = self.canceller().map(|cancel| {
            Box::new(move |_: Resolvers<T>| cancel()) as Canceller<T>
        });
        Promise::with_dependency(
            move |resolvers| Thenable::then(self, resolvers),
            canceller,
            dependency.cloned().unwrap_or_default(),
        )
        .into()
    }
}

impl<T> Outcome for ExtendedPromise<T>
where
    T: Clone + Send + 'static,
{
    fn finish(self) {
        self.end()
    }
}

impl<T> Outcome for Promise<T>
where
    T: Clone + Send + 'static,
{
    fn finish(self) {
        self.end()
    }
}

impl<T> Outcome for FulfilledPromise<T>
where
    T: Clone + Send + 'static,
{
    fn finish(self) {}
}

impl<T> Outcome for RejectedPromise<T>
where
    T: Clone + Send + 'static,
{
    fn finish(self) {
        self.end()
    }
}

/// Normalises `value` into a promise with a fresh dependency store.
///
/// ```
/// use chainpromise::{resolve, Chainable, ExtendedPromise};
///
/// assert_eq!(resolve(Ok(3)).wait(), Ok(3));
/// let p = ExtendedPromise::resolve("same");
/// assert!(resolve(p.clone()).dependency().same_store(&p.dependency()));
/// ```
pub fn resolve<T, V>(value: V) -> ExtendedPromise<T>
where
    T: Clone + Send + 'static,
    V: IntoPromise<T>,
{
    value.into_promise(None)
}

/// Normalises `value` into a promise carrying `dependency`.
///
/// If `value` already is a promise, its dependency store is merged into
/// `dependency` and redirected to it.
pub fn resolve_with<T, V>(value: V, dependency: &Dependency) -> ExtendedPromise<T>
where
    T: Clone + Send + 'static,
    V: IntoPromise<T>,
{
    value.into_promise(Some(dependency))
}

/// A promise rejected with `reason`.
pub fn reject<T>(reason: Error) -> ExtendedPromise<T>
where
    T: Clone + Send + 'static,
{
    ExtendedPromise::reject(reason)
}

/// Rejects with whatever `reason` resolves to.
///
/// A fulfilment of `reason` becomes the rejection; a rejection of `reason`
/// propagates as it is.
pub fn reject_with<T, V>(reason: V, dependency: Option<&Dependency>) -> ExtendedPromise<T>
where
    T: Clone + Send + 'static,
    V: IntoPromise<Error>,
{
    reason
        .into_promise(dependency)
        .map(|reason, _| Err::<T, Error>(reason))
}
