use std::{fmt, marker::PhantomData};

use crate::{
    chain_dependency::Dependency,
    extended::{
        call_handler, raise_unhandled, Chainable, ExtendedPromise, IntoPromise, OnFulfilled,
        OnRejected, ProgressHandler, Update,
    },
    Error,
};

/// A promise that already holds its value.
///
/// ```
/// use chainpromise::{Chainable, FulfilledPromise};
///
/// let p = FulfilledPromise::new(2).map(|v, _| Ok(v + 1));
/// assert_eq!(p.peek(), Some(Ok(3)));
/// ```
#[derive(Debug, Clone)]
pub struct FulfilledPromise<T> {
    value: T,
    dependency: Dependency,
}

impl<T> FulfilledPromise<T>
where
    T: Clone + Send + 'static,
{
    /// Fulfilled with `value` and a fresh dependency store.
    pub fn new(value: T) -> Self {
        Self::with_dependency(value, Dependency::new())
    }

    /// Fulfilled with `value`, carrying `dependency`.
    pub fn with_dependency(value: T, dependency: Dependency) -> Self {
        FulfilledPromise { value, dependency }
    }

    /// The value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The dependency handle.
    pub fn dependency(&self) -> &Dependency {
        &self.dependency
    }

    /// Does nothing.
    pub fn cancel(&self) {}
}

impl<T> Chainable<T> for FulfilledPromise<T>
where
    T: Clone + Send + 'static,
{
    fn then<T2, F, G, R1, R2>(&self, on_fulfilled: F, _on_rejected: G) -> ExtendedPromise<T2>
    where
        T2: Clone + Send + 'static,
        F: FnOnce(T, &Dependency) -> R1 + Send + 'static,
        G: FnOnce(Error, &Dependency) -> R2 + Send + 'static,
        R1: IntoPromise<T2>,
        R2: IntoPromise<T2>,
    {
        let dependency = &self.dependency;
        call_handler(dependency, || on_fulfilled(self.value.clone(), dependency))
    }

    fn progress<P>(&self, _on_progress: P) -> ExtendedPromise<T>
    where
        P: Fn(Update, &Dependency) -> Update + Send + Sync + 'static,
    {
        self.clone().into()
    }

    fn done_with(
        &self,
        on_fulfilled: Option<OnFulfilled<T>>,
        _on_rejected: Option<OnRejected>,
        _on_progress: Option<ProgressHandler>,
    ) {
        if let Some(on_fulfilled) = on_fulfilled {
            on_fulfilled(self.value.clone(), &self.dependency);
        }
    }
}

/// A promise that already holds its rejection reason.
pub struct RejectedPromise<T> {
    reason: Error,
    dependency: Dependency,
    _value: PhantomData<fn() -> T>,
}

impl<T> RejectedPromise<T>
where
    T: Clone + Send + 'static,
{
    /// Rejected with `reason` and a fresh dependency store.
    pub fn new(reason: Error) -> Self {
        Self::with_dependency(reason, Dependency::new())
    }

    /// Rejected with `reason`, carrying `dependency`.
    pub fn with_dependency(reason: Error, dependency: Dependency) -> Self {
        RejectedPromise {
            reason,
            dependency,
            _value: PhantomData,
        }
    }

    /// The reason.
    pub fn reason(&self) -> &Error {
        &self.reason
    }

    /// The dependency handle.
    pub fn dependency(&self) -> &Dependency {
        &self.dependency
    }

    /// Does nothing.
    pub fn cancel(&self) {}

    /// The same rejection seen as a promise of another value type.
    pub fn cast<T2>(&self) -> RejectedPromise<T2>
    where
        T2: Clone + Send + 'static,
    {
        RejectedPromise::with_dependency(self.reason.clone(), self.dependency.clone())
    }
}

impl<T> Clone for RejectedPromise<T> {
    fn clone(&self) -> Self {
        RejectedPromise {
            reason: self.reason.clone(),
            dependency: self.dependency.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for RejectedPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectedPromise")
            .field("reason", &self.reason)
            .field("dependency", &self.dependency)
            .finish()
    }
}

impl<T> Chainable<T> for RejectedPromise<T>
where
    T: Clone + Send + 'static,
{
    fn then<T2, F, G, R1, R2>(&self, _on_fulfilled: F, on_rejected: G) -> ExtendedPromise<T2>
    where
        T2: Clone + Send + 'static,
        F: FnOnce(T, &Dependency) -> R1 + Send + 'static,
        G: FnOnce(Error, &Dependency) -> R2 + Send + 'static,
        R1: IntoPromise<T2>,
        R2: IntoPromise<T2>,
    {
        let dependency = &self.dependency;
        call_handler(dependency, || on_rejected(self.reason.clone(), dependency))
    }

    fn map<T2, F, R>(&self, _on_fulfilled: F) -> ExtendedPromise<T2>
    where
        T2: Clone + Send + 'static,
        F: FnOnce(T, &Dependency) -> R + Send + 'static,
        R: IntoPromise<T2>,
    {
        self.cast::<T2>().into()
    }

    fn otherwise_if<P, F, R>(&self, predicate: P, on_rejected: F) -> ExtendedPromise<T>
    where
        P: FnOnce(&Error) -> bool + Send + 'static,
        F: FnOnce(Error, &Dependency) -> R + Send + 'static,
        R: IntoPromise<T>,
    {
        if predicate(&self.reason) {
            self.otherwise(on_rejected)
        } else {
            self.clone().into()
        }
    }

    fn progress<P>(&self, _on_progress: P) -> ExtendedPromise<T>
    where
        P: Fn(Update, &Dependency) -> Update + Send + Sync + 'static,
    {
        self.clone().into()
    }

    fn done_with(
        &self,
        _on_fulfilled: Option<OnFulfilled<T>>,
        on_rejected: Option<OnRejected>,
        _on_progress: Option<ProgressHandler>,
    ) {
        match on_rejected {
            Some(on_rejected) => on_rejected(self.reason.clone(), &self.dependency),
            None => raise_unhandled(self.reason.clone()),
        }
    }
}
