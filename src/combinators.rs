//! Combinators over collections of promise-like inputs.
//!
//! Every combinator returns a promise that cancels all of its inputs when it
//! is cancelled itself. Inputs are anything implementing [`IntoPromise`].
//!
//! The `*_of` variants take the collection itself as a promise: it is
//! resolved first, then fanned out like the eager form. Cancelling before the
//! collection arrived cancels the collection's promise.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    cancellation::CancellationQueue,
    chain_dependency::Dependency,
    extended::{Chainable, ExtendedPromise, IntoPromise, ProgressHandler, Update},
    promise::{Promise, Resolvers},
    Error,
};

fn collect<T, I>(promises: I) -> Vec<ExtendedPromise<T>>
where
    T: Clone + Send + 'static,
    I: IntoIterator,
    I::Item: IntoPromise<T>,
{
    promises
        .into_iter()
        .map(|promise| promise.into_promise(None))
        .collect()
}

fn composite<T>(queue: CancellationQueue, resolver: impl FnOnce(Resolvers<T>)) -> ExtendedPromise<T>
where
    T: Clone + Send + 'static,
{
    Promise::cancellable(resolver, move |_| queue.cancel()).into()
}

fn notifier<T>(resolvers: &Resolvers<T>) -> ProgressHandler
where
    T: Clone + Send + 'static,
{
    let resolvers = resolvers.clone();
    Arc::new(move |update: Update, _: &Dependency| resolvers.notify(update))
}

fn rejecter<T>(resolvers: &Resolvers<T>) -> Box<dyn FnOnce(Error, &Dependency) + Send>
where
    T: Clone + Send + 'static,
{
    let resolvers = resolvers.clone();
    Box::new(move |reason: Error, _: &Dependency| resolvers.reject(reason))
}

/// Resolves `list`, then hands its items to `fan_out`.
fn resolve_then<T, X, L, U>(
    list: L,
    fan_out: impl FnOnce(Vec<ExtendedPromise<T>>, &CancellationQueue, Resolvers<U>) + Send + 'static,
) -> ExtendedPromise<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    X: IntoPromise<T> + Clone,
    L: IntoPromise<Vec<X>>,
{
    let list = list.into_promise(None);
    let queue = CancellationQueue::new();
    composite(queue.clone(), move |resolvers: Resolvers<U>| {
        queue.enqueue(list.clone());
        let on_fulfil = resolvers.clone();
        list.done_with(
            Some(Box::new(move |items: Vec<X>, _: &Dependency| {
                fan_out(collect(items), &queue, on_fulfil)
            })),
            Some(rejecter(&resolvers)),
            Some(notifier(&resolvers)),
        );
    })
}

/// Fulfils with every value, in input order, once all inputs fulfil.
/// Rejects with the first rejection.
///
/// ```
/// use chainpromise::{all, Chainable, ExtendedPromise};
///
/// let p = all(vec![ExtendedPromise::resolve(1), ExtendedPromise::resolve(2)]);
/// assert_eq!(p.wait(), Ok(vec![1, 2]));
/// ```
pub fn all<T, I>(promises: I) -> ExtendedPromise<Vec<T>>
where
    T: Clone + Send + 'static,
    I: IntoIterator,
    I::Item: IntoPromise<T>,
{
    map(promises, |value, _| Ok::<T, Error>(value))
}

/// [`all`] over a collection that is itself promised.
///
/// ```
/// use chainpromise::{all_of, Chainable, Error, ExtendedPromise};
///
/// let list = ExtendedPromise::resolve(vec![Ok::<u8, Error>(1), Ok(2)]);
/// let p: ExtendedPromise<Vec<u8>> = all_of(list);
/// assert_eq!(p.wait(), Ok(vec![1, 2]));
/// ```
pub fn all_of<T, X, L>(list: L) -> ExtendedPromise<Vec<T>>
where
    T: Clone + Send + 'static,
    X: IntoPromise<T> + Clone,
    L: IntoPromise<Vec<X>>,
{
    map_of(list, |value, _| Ok::<T, Error>(value))
}

fn race_into<T>(inputs: Vec<ExtendedPromise<T>>, queue: &CancellationQueue, resolvers: Resolvers<Option<T>>)
where
    T: Clone + Send + 'static,
{
    if inputs.is_empty() {
        resolvers.fulfill(None);
        return;
    }
    for input in inputs {
        queue.enqueue(input.clone());
        let on_fulfil = resolvers.clone();
        input.done_with(
            Some(Box::new(move |value: T, _: &Dependency| on_fulfil.fulfill(Some(value)))),
            Some(rejecter(&resolvers)),
            Some(notifier(&resolvers)),
        );
    }
}

/// Settles like the first input to settle.
///
/// An empty input fulfils with `None`.
pub fn race<T, I>(promises: I) -> ExtendedPromise<Option<T>>
where
    T: Clone + Send + 'static,
    I: IntoIterator,
    I::Item: IntoPromise<T>,
{
    let inputs = collect(promises);
    let queue = CancellationQueue::new();
    composite(queue.clone(), move |resolvers| race_into(inputs, &queue, resolvers))
}

/// [`race`] over a collection that is itself promised.
pub fn race_of<T, X, L>(list: L) -> ExtendedPromise<Option<T>>
where
    T: Clone + Send + 'static,
    X: IntoPromise<T> + Clone,
    L: IntoPromise<Vec<X>>,
{
    resolve_then(list, race_into::<T>)
}

struct Tally<T> {
    to_resolve: usize,
    to_reject: usize,
    values: BTreeMap<usize, T>,
    reasons: BTreeMap<usize, Error>,
}

impl<T> Tally<T> {
    fn decided(&self) -> bool {
        self.to_resolve == 0 || self.to_reject == 0
    }
}

fn some_into<T>(
    inputs: Vec<ExtendedPromise<T>>,
    how_many: usize,
    queue: &CancellationQueue,
    resolvers: Resolvers<BTreeMap<usize, T>>,
) where
    T: Clone + Send + 'static,
{
    if how_many < 1 {
        resolvers.fulfill(BTreeMap::new());
        return;
    }
    if inputs.len() < how_many {
        resolvers.reject(Error::Length {
            required: how_many,
            available: inputs.len(),
        });
        return;
    }

    let tally = Arc::new(Mutex::new(Tally {
        to_resolve: how_many,
        to_reject: inputs.len() - how_many + 1,
        values: BTreeMap::new(),
        reasons: BTreeMap::new(),
    }));
    for (index, input) in inputs.into_iter().enumerate() {
        queue.enqueue(input.clone());

        let fulfilled = {
            let tally = tally.clone();
            let resolvers = resolvers.clone();
            move |value: T, _: &Dependency| {
                let done = {
                    let mut tally = tally.lock();
                    if tally.decided() {
                        return;
                    }
                    tally.values.insert(index, value);
                    tally.to_resolve -= 1;
                    (tally.to_resolve == 0).then(|| std::mem::take(&mut tally.values))
                };
                if let Some(values) = done {
                    resolvers.fulfill(values);
                }
            }
        };
        let rejected = {
            let tally = tally.clone();
            let resolvers = resolvers.clone();
            move |reason: Error, _: &Dependency| {
                let done = {
                    let mut tally = tally.lock();
                    if tally.decided() {
                        return;
                    }
                    tally.reasons.insert(index, reason);
                    tally.to_reject -= 1;
                    (tally.to_reject == 0).then(|| std::mem::take(&mut tally.reasons))
                };
                if let Some(reasons) = done {
                    resolvers.reject(Error::Aggregate(reasons));
                }
            }
        };
        input.done_with(
            Some(Box::new(fulfilled)),
            Some(Box::new(rejected)),
            Some(notifier(&resolvers)),
        );
    }
}

/// Fulfils once `how_many` inputs fulfil, with their values keyed by input
/// index. Rejects with [`Error::Aggregate`] once that became impossible.
///
/// A `how_many` of zero fulfils with an empty map.
///
/// # Errors
/// Returns [`Error::Length`] if there are fewer inputs than `how_many`.
///
/// ```
/// use chainpromise::{some, Chainable, Error, ExtendedPromise};
///
/// let inputs = vec![
///     ExtendedPromise::reject(Error::reason("down")),
///     ExtendedPromise::resolve("a"),
///     ExtendedPromise::resolve("b"),
/// ];
/// let values = some(inputs, 2)?.wait()?;
/// assert_eq!(values.into_iter().collect::<Vec<_>>(), vec![(1, "a"), (2, "b")]);
/// # Ok::<(), Error>(())
/// ```
pub fn some<T, I>(promises: I, how_many: usize) -> Result<ExtendedPromise<BTreeMap<usize, T>>, Error>
where
    T: Clone + Send + 'static,
    I: IntoIterator,
    I::Item: IntoPromise<T>,
{
    let inputs = collect(promises);
    if how_many > 0 && inputs.len() < how_many {
        return Err(Error::Length {
            required: how_many,
            available: inputs.len(),
        });
    }
    let queue = CancellationQueue::new();
    Ok(composite(queue.clone(), move |resolvers| {
        some_into(inputs, how_many, &queue, resolvers)
    }))
}

/// [`some`] over a collection that is itself promised.
///
/// The length is only known once the collection arrived, so a short
/// collection rejects with [`Error::Length`] instead of failing upfront.
pub fn some_of<T, X, L>(list: L, how_many: usize) -> ExtendedPromise<BTreeMap<usize, T>>
where
    T: Clone + Send + 'static,
    X: IntoPromise<T> + Clone,
    L: IntoPromise<Vec<X>>,
{
    resolve_then(list, move |inputs, queue: &CancellationQueue, resolvers| {
        some_into(inputs, how_many, queue, resolvers)
    })
}

fn first_value<T>(values: BTreeMap<usize, T>) -> Result<T, Error> {
    values.into_values().next().ok_or(Error::Length {
        required: 1,
        available: 0,
    })
}

/// Settles like the first input to fulfil, or rejects with
/// [`Error::Aggregate`] once every input rejected.
///
/// # Errors
/// Returns [`Error::Length`] for an empty input.
pub fn any<T, I>(promises: I) -> Result<ExtendedPromise<T>, Error>
where
    T: Clone + Send + 'static,
    I: IntoIterator,
    I::Item: IntoPromise<T>,
{
    Ok(some(promises, 1)?.map(|values, _| first_value(values)))
}

/// [`any`] over a collection that is itself promised. An empty collection
/// rejects with [`Error::Length`].
pub fn any_of<T, X, L>(list: L) -> ExtendedPromise<T>
where
    T: Clone + Send + 'static,
    X: IntoPromise<T> + Clone,
    L: IntoPromise<Vec<X>>,
{
    some_of(list, 1).map(|values, _| first_value(values))
}

struct Slots<U> {
    values: Vec<Option<U>>,
    remaining: usize,
}

impl<U> Slots<U> {
    fn fill(&mut self, index: usize, value: U) -> Option<Vec<U>> {
        match self.values.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(value);
                self.remaining -= 1;
            }
            _ => return None,
        }
        if self.remaining == 0 {
            Some(self.values.drain(..).flatten().collect())
        } else {
            None
        }
    }
}

fn map_into<T, U, F, R>(
    inputs: Vec<ExtendedPromise<T>>,
    map_fn: F,
    queue: &CancellationQueue,
    resolvers: Resolvers<Vec<U>>,
) where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: Fn(T, &Dependency) -> R + Send + Sync + 'static,
    R: IntoPromise<U>,
{
    if inputs.is_empty() {
        resolvers.fulfill(Vec::new());
        return;
    }

    let map_fn = Arc::new(map_fn);
    let slots = Arc::new(Mutex::new(Slots {
        values: std::iter::repeat_with(|| None).take(inputs.len()).collect(),
        remaining: inputs.len(),
    }));
    for (index, input) in inputs.into_iter().enumerate() {
        queue.enqueue(input.clone());

        let map_fn = map_fn.clone();
        let slots = slots.clone();
        let on_fulfil = resolvers.clone();
        input
            .map(move |value, dependency| map_fn(value, dependency))
            .done_with(
                Some(Box::new(move |mapped: U, _: &Dependency| {
                    let complete = slots.lock().fill(index, mapped);
                    if let Some(values) = complete {
                        on_fulfil.fulfill(values);
                    }
                })),
                Some(rejecter(&resolvers)),
                Some(notifier(&resolvers)),
            );
    }
}

/// Applies `map_fn` to each input as it fulfils and fulfils with the
/// results in input order.
///
/// `map_fn` may return a promise; it receives the dependency of the input it
/// maps.
///
/// ```
/// use chainpromise::{map, Chainable, Error};
///
/// let p = map(vec![Ok::<_, Error>(1), Ok(2), Ok(3)], |v: i32, _| Ok::<_, Error>(v * v));
/// assert_eq!(p.wait(), Ok(vec![1, 4, 9]));
/// ```
pub fn map<T, U, I, F, R>(promises: I, map_fn: F) -> ExtendedPromise<Vec<U>>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    I: IntoIterator,
    I::Item: IntoPromise<T>,
    F: Fn(T, &Dependency) -> R + Send + Sync + 'static,
    R: IntoPromise<U>,
{
    let inputs = collect(promises);
    let queue = CancellationQueue::new();
    composite(queue.clone(), move |resolvers| map_into(inputs, map_fn, &queue, resolvers))
}

/// [`map`] over a collection that is itself promised.
pub fn map_of<T, U, X, L, F, R>(list: L, map_fn: F) -> ExtendedPromise<Vec<U>>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    X: IntoPromise<T> + Clone,
    L: IntoPromise<Vec<X>>,
    F: Fn(T, &Dependency) -> R + Send + Sync + 'static,
    R: IntoPromise<U>,
{
    resolve_then(list, move |inputs, queue: &CancellationQueue, resolvers| {
        map_into(inputs, map_fn, queue, resolvers)
    })
}

fn reduce_into<T, A, F, R>(
    inputs: Vec<ExtendedPromise<T>>,
    reduce_fn: F,
    initial: ExtendedPromise<A>,
    queue: &CancellationQueue,
    resolvers: Resolvers<A>,
) where
    T: Clone + Send + 'static,
    A: Clone + Send + 'static,
    F: Fn(A, T, usize, usize) -> R + Send + Sync + 'static,
    R: IntoPromise<A>,
{
    let total = inputs.len();
    let reduce_fn = Arc::new(reduce_fn);
    queue.enqueue(initial.clone());

    let mut current = initial;
    for (index, input) in inputs.into_iter().enumerate() {
        queue.enqueue(input.clone());
        let reduce_fn = reduce_fn.clone();
        current = current.map(move |accumulator, _| {
            input.map(move |value, _| reduce_fn(accumulator, value, index, total))
        });
    }

    let on_fulfil = resolvers.clone();
    current.done_with(
        Some(Box::new(move |value: A, _: &Dependency| on_fulfil.fulfill(value))),
        Some(rejecter(&resolvers)),
        Some(notifier(&resolvers)),
    );
}

/// Folds the inputs in order with `reduce_fn(accumulator, value, index,
/// total)`, starting from `initial`.
///
/// Both `initial` and the values returned by `reduce_fn` may be promises.
///
/// ```
/// use chainpromise::{reduce, Chainable, Error, ExtendedPromise};
///
/// let p = reduce(
///     vec![ExtendedPromise::resolve(1), ExtendedPromise::resolve(2)],
///     |acc: i32, v: i32, _, _| Ok::<_, Error>(acc + v),
///     Ok::<_, Error>(10),
/// );
/// assert_eq!(p.wait(), Ok(13));
/// ```
pub fn reduce<T, A, I, F, R, V>(promises: I, reduce_fn: F, initial: V) -> ExtendedPromise<A>
where
    T: Clone + Send + 'static,
    A: Clone + Send + 'static,
    I: IntoIterator,
    I::Item: IntoPromise<T>,
    F: Fn(A, T, usize, usize) -> R + Send + Sync + 'static,
    R: IntoPromise<A>,
    V: IntoPromise<A>,
{
    let inputs = collect(promises);
    let initial = initial.into_promise(None);
    let queue = CancellationQueue::new();
    composite(queue.clone(), move |resolvers| {
        reduce_into(inputs, reduce_fn, initial, &queue, resolvers)
    })
}

/// [`reduce`] over a collection that is itself promised.
pub fn reduce_of<T, A, X, L, F, R, V>(list: L, reduce_fn: F, initial: V) -> ExtendedPromise<A>
where
    T: Clone + Send + 'static,
    A: Clone + Send + 'static,
    X: IntoPromise<T> + Clone,
    L: IntoPromise<Vec<X>>,
    F: Fn(A, T, usize, usize) -> R + Send + Sync + 'static,
    R: IntoPromise<A>,
    V: IntoPromise<A>,
{
    let initial = initial.into_promise(None);
    resolve_then(list, move |inputs, queue: &CancellationQueue, resolvers| {
        reduce_into(inputs, reduce_fn, initial, queue, resolvers)
    })
}
