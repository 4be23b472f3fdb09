#![cfg(test)]

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use super::{
    all, all_of, any, any_of, map, race, race_of, reduce, reduce_of, reject_with, resolve,
    resolve_with, some, some_of, Chainable, Dependency, Error, ExtendedPromise, LazyPromise,
    Promise, Resolvers, Thenable, Update,
};

fn deferred<T: Clone + Send + 'static>() -> (Promise<T>, Resolvers<T>) {
    let mut slot = None;
    let promise = Promise::new(|resolvers| slot = Some(resolvers));
    (promise, slot.unwrap())
}

#[test]
pub fn test_resolved_from_another_thread() {
    let p = Promise::new(|resolvers| {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            resolvers.fulfill(2);
        });
    })
    .map(|v, _| Ok(v * 10))
    .map(|v, _| Ok(v + 5));
    assert_eq!(p.wait(), Ok(25));
}

#[test]
pub fn test_settles_only_once() {
    let (p, r) = deferred::<u8>();
    r.fulfill(1);
    r.reject(Error::reason("late"));
    r.fulfill(2);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    p.done(
        move |v, _| {
            assert_eq!(v, 1);
            counter.fetch_add(1, Ordering::SeqCst);
        },
        |_, _| -> () { panic!("rejection handler must not run") },
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
pub fn test_error_propagation_and_recovery() {
    let (p, r) = deferred::<u32>();
    let out = p
        .map(|_, _| Err::<u32, _>(Error::reason("fail")))
        .map(|_, _| -> Result<u32, Error> { panic!("skipped") })
        .otherwise(|e, _| Ok(e.to_string().len() as u32));
    assert!(out.is_pending());
    r.fulfill(7);
    assert_eq!(out.peek(), Some(Ok(4)));
}

#[test]
pub fn test_handler_panic_rejects() {
    let (p, r) = deferred::<u8>();
    let out = p
        .map(|_, _| -> Result<u8, Error> { panic!("handler blew up") })
        .otherwise(|e, _| match e {
            Error::Panicked(message) => Ok(message.len() as u8),
            _ => Ok(0),
        });
    r.fulfill(0);
    assert_eq!(out.peek(), Some(Ok(15)));
}

#[test]
pub fn test_self_resolution_rejects() {
    let (p, r) = deferred::<i32>();
    r.resolve(p.clone());
    assert_eq!(
        ExtendedPromise::from(p).peek(),
        Some(Err(Error::SelfResolution))
    );
}

#[test]
pub fn test_follows_pending_promise() {
    let (outer, resolve_outer) = deferred::<u8>();
    let (inner, resolve_inner) = deferred::<u8>();
    resolve_outer.resolve(inner);
    resolve_outer.fulfill(9);

    assert!(!outer.is_pending());
    let outer = ExtendedPromise::from(outer);
    assert!(outer.is_pending());
    resolve_inner.fulfill(3);
    assert_eq!(outer.peek(), Some(Ok(3)));
}

#[test]
pub fn test_wait_on_dropped_promise() {
    let p = Promise::<u8>::new(|_| {});
    assert_eq!(p.wait(), Err(Error::Dropped));
}

#[test]
pub fn test_await_promise() {
    let (p, r) = deferred::<u8>();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        r.fulfill(8);
    });
    let value = futures::executor::block_on(async move { p.await });
    handle.join().unwrap();
    assert_eq!(value, Ok(8));
}

#[test]
pub fn test_cancellation_waits_for_every_branch() {
    let cancelled = Arc::new(AtomicUsize::new(0));
    let counter = cancelled.clone();
    let root = Promise::<u8>::cancellable(|_| {}, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let a = root.map(|v, _| Ok(v + 1));
    let b = root.map(|v, _| Ok(v + 2));
    let c = a.map(|v, _| Ok(v * 2));
    assert_eq!(root.pending_cancel_requests(), 2);

    c.cancel();
    assert_eq!(root.pending_cancel_requests(), 1);
    assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    b.cancel();
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    root.cancel();
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
}

#[test]
pub fn test_cancel_through_temporary_parent() {
    let cancelled = Arc::new(AtomicUsize::new(0));
    let counter = cancelled.clone();
    let child = Promise::<u8>::cancellable(|_| {}, move |r| {
        counter.fetch_add(1, Ordering::SeqCst);
        r.reject(Error::reason("stop"));
    })
    .map(|v, _| Ok(v));

    child.cancel();
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(child.peek(), Some(Err(Error::reason("stop"))));
}

#[test]
pub fn test_cancel_reaches_followed_promise() {
    let inner = Promise::<u8>::cancellable(|_| {}, |r| r.reject(Error::reason("stopped")));
    let (outer, r) = deferred::<u8>();
    r.resolve(inner);
    outer.cancel();
    assert_eq!(
        ExtendedPromise::from(outer).peek(),
        Some(Err(Error::reason("stopped")))
    );
}

#[test]
pub fn test_cancel_settled_is_noop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let p = Promise::<u8>::cancellable(
        |r| r.fulfill(1),
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );
    p.cancel();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(p.wait(), Ok(1));
}

#[test]
pub fn test_progress_is_forwarded_until_settled() {
    let (p, r) = deferred::<u8>();
    let seen = Arc::new(Mutex::new(Vec::<Update>::new()));
    let outer = Arc::new(Mutex::new(Vec::<Update>::new()));

    let first = seen.clone();
    let derived = p.progress(move |update, _| {
        first.lock().push(update.clone());
        json!({ "wrapped": update })
    });
    let second = outer.clone();
    let _tail = derived.progress(move |update, _| {
        second.lock().push(update.clone());
        update
    });

    r.notify(json!(1));
    r.notify(json!(2));
    r.fulfill(3);
    r.notify(json!(4));

    assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
    assert_eq!(
        *outer.lock(),
        vec![json!({ "wrapped": 1 }), json!({ "wrapped": 2 })]
    );
    assert_eq!(derived.peek(), Some(Ok(3)));
}

#[test]
pub fn test_progress_handler_panic_rejects() {
    let (p, r) = deferred::<u8>();
    let derived = p.progress(|_, _| panic!("bad progress"));
    r.notify(json!("tick"));
    assert_eq!(
        derived.peek(),
        Some(Err(Error::Panicked("bad progress".into())))
    );
    r.fulfill(1);
    assert_eq!(derived.peek(), Some(Err(Error::Panicked("bad progress".into()))));
}

#[test]
pub fn test_always_waits_for_handler_promise() {
    let (gate, open) = deferred::<()>();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let out = ExtendedPromise::resolve(1).always(move |_| {
        flag.store(true, Ordering::SeqCst);
        gate.clone()
    });
    assert!(ran.load(Ordering::SeqCst));
    assert!(out.is_pending());
    open.fulfill(());
    assert_eq!(out.peek(), Some(Ok(1)));
}

#[test]
pub fn test_otherwise_if_filters_reasons() {
    let (p, r) = deferred::<u8>();
    let out = p
        .otherwise_if(|e| matches!(e, Error::Dropped), |_, _| Ok(1))
        .otherwise_if(|e| matches!(e, Error::Reason(_)), |_, _| Ok(2));
    r.reject(Error::reason("boom"));
    assert_eq!(out.peek(), Some(Ok(2)));
}

#[test]
pub fn test_done_raises_unhandled_rejection() {
    let (p, r) = deferred::<u8>();
    p.done_fulfilled(|_, _| ());
    let payload = panic::catch_unwind(AssertUnwindSafe(|| r.reject(Error::reason("nobody"))))
        .unwrap_err();
    let error = payload.downcast::<Error>().unwrap();
    assert_eq!(
        *error,
        Error::UnhandledRejection(Box::new(Error::reason("nobody")))
    );
}

#[test]
pub fn test_unhandled_rejection_does_not_skip_later_handlers() {
    let (p, r) = deferred::<u8>();
    p.end();
    let later = p.map(|v, _| Ok(v));

    let raised = panic::catch_unwind(AssertUnwindSafe(|| r.reject(Error::reason("x"))));
    let payload = raised.unwrap_err();
    assert!(matches!(
        payload.downcast_ref::<Error>(),
        Some(Error::UnhandledRejection(_))
    ));
    assert_eq!(later.peek(), Some(Err(Error::reason("x"))));
}

#[test]
pub fn test_done_handler_error_is_unhandled() {
    let p = ExtendedPromise::resolve(1);
    let payload = panic::catch_unwind(AssertUnwindSafe(|| {
        p.done(|_, _| Err::<(), _>(Error::reason("late")), |_, _| ())
    }))
    .unwrap_err();
    assert!(matches!(
        payload.downcast_ref::<Error>(),
        Some(Error::UnhandledRejection(reason)) if **reason == Error::reason("late")
    ));

    let handled = Arc::new(AtomicBool::new(false));
    let flag = handled.clone();
    ExtendedPromise::<u8>::reject(Error::reason("fine")).done(
        |_, _| (),
        move |_, _| flag.store(true, Ordering::SeqCst),
    );
    assert!(handled.load(Ordering::SeqCst));
}

#[test]
pub fn test_handlers_share_and_merge_dependencies() {
    let other = ExtendedPromise::resolve(5);
    other
        .dependency()
        .add_dependency(json!("from-other"), "origin");
    let p = ExtendedPromise::resolve(1);
    p.dependency().add_dependency(json!("main"), "flow");

    let out = p.map(move |_, _| other).map(|v, deps| {
        Ok::<_, Error>((
            v,
            deps.get_dependency("origin"),
            deps.get_dependency("flow"),
        ))
    });
    assert_eq!(
        out.peek(),
        Some(Ok((5, Some(json!("from-other")), Some(json!("main")))))
    );
    assert!(out.dependency().same_store(&p.dependency()));
}

#[test]
pub fn test_resolve_with_adopts_dependency() {
    let deps = Dependency::new();
    deps.add_dependency(json!(1), "a");
    let other = ExtendedPromise::resolve("x");
    other.dependency().add_dependency(json!(2), "b");

    let p = resolve_with(other.clone(), &deps);
    assert!(p.dependency().same_store(&deps));
    assert!(other.dependency().same_store(&deps));
    assert_eq!(deps.get_dependency("b"), Some(json!(2)));
    assert_eq!(p.peek(), Some(Ok("x")));
}

#[test]
pub fn test_resolve_and_reject_with() {
    let p = ExtendedPromise::resolve(4);
    assert!(resolve(p.clone()).dependency().same_store(&p.dependency()));
    assert_eq!(resolve(Ok::<_, Error>(3)).peek(), Some(Ok(3)));

    let rejected: ExtendedPromise<u8> = reject_with(Ok::<_, Error>(Error::reason("value")), None);
    assert_eq!(rejected.peek(), Some(Err(Error::reason("value"))));
}

struct Later {
    slot: Arc<Mutex<Option<Resolvers<u8>>>>,
    cancelled: Arc<AtomicBool>,
}

impl Thenable<u8> for Later {
    fn then(self: Box<Self>, resolvers: Resolvers<u8>) {
        *self.slot.lock() = Some(resolvers);
    }

    fn canceller(&self) -> Option<Box<dyn FnOnce() + Send>> {
        let cancelled = self.cancelled.clone();
        Some(Box::new(move || cancelled.store(true, Ordering::SeqCst)))
    }
}

#[test]
pub fn test_thenable_is_adopted() {
    let slot = Arc::new(Mutex::new(None));
    let cancelled = Arc::new(AtomicBool::new(false));
    let p = ExtendedPromise::from_thenable(Later {
        slot: slot.clone(),
        cancelled: cancelled.clone(),
    });
    assert!(p.is_pending());
    p.cancel();
    assert!(cancelled.load(Ordering::SeqCst));

    slot.lock().take().unwrap().fulfill(4);
    assert_eq!(p.peek(), Some(Ok(4)));
}

#[test]
pub fn test_promise_all_keeps_input_order() {
    let promises: Vec<Promise<u32>> = (0..10)
        .map(|x| {
            Promise::new(move |resolvers| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(u64::from(10 - x)));
                    resolvers.fulfill(x);
                });
            })
        })
        .collect();
    let result = all(promises).wait().unwrap();
    assert_eq!(result, (0..10).collect::<Vec<_>>());
}

#[test]
pub fn test_all_rejects_with_first_rejection() {
    let (slow, r) = deferred::<u8>();
    let p = all(vec![
        ExtendedPromise::from(slow),
        ExtendedPromise::reject(Error::reason("first")),
        ExtendedPromise::resolve(3),
    ]);
    assert_eq!(p.peek(), Some(Err(Error::reason("first"))));
    r.reject(Error::reason("second"));
    assert_eq!(p.peek(), Some(Err(Error::reason("first"))));
    assert_eq!(all(Vec::<ExtendedPromise<u8>>::new()).peek(), Some(Ok(vec![])));
}

#[test]
pub fn test_all_accepts_lazy_inputs() {
    let p = all(vec![
        ExtendedPromise::from(LazyPromise::new(|| Ok::<_, Error>(1))),
        ExtendedPromise::resolve(2),
    ]);
    assert_eq!(p.wait(), Ok(vec![1, 2]));
}

#[test]
pub fn test_race_first_settled_wins() {
    let (slow, _r) = deferred::<u8>();
    let p = race(vec![ExtendedPromise::from(slow), ExtendedPromise::resolve(2)]);
    assert_eq!(p.peek(), Some(Ok(Some(2))));

    let empty = race(Vec::<ExtendedPromise<u8>>::new());
    assert_eq!(empty.peek(), Some(Ok(None)));
}

#[test]
pub fn test_some_collects_indexed_values() {
    let (late, r) = deferred::<&str>();
    let p = some(
        vec![
            ExtendedPromise::reject(Error::reason("down")),
            ExtendedPromise::from(late),
            ExtendedPromise::resolve("b"),
        ],
        2,
    )
    .unwrap();
    assert!(p.is_pending());
    r.fulfill("a");
    let values = p.wait().unwrap();
    assert_eq!(values.into_iter().collect::<Vec<_>>(), vec![(1, "a"), (2, "b")]);
}

#[test]
pub fn test_some_rejects_when_impossible() {
    let p = some(
        vec![
            ExtendedPromise::reject(Error::reason("a")),
            ExtendedPromise::reject(Error::reason("b")),
            ExtendedPromise::resolve(1),
        ],
        2,
    )
    .unwrap();
    let Some(Err(Error::Aggregate(reasons))) = p.peek() else {
        panic!("expected an aggregate rejection");
    };
    assert_eq!(
        reasons.into_iter().collect::<Vec<_>>(),
        vec![(0, Error::reason("a")), (1, Error::reason("b"))]
    );
}

#[test]
pub fn test_some_checks_length() {
    assert!(matches!(
        some(vec![ExtendedPromise::resolve(1)], 2),
        Err(Error::Length {
            required: 2,
            available: 1
        })
    ));
    let none = some(vec![ExtendedPromise::resolve(1)], 0).unwrap();
    assert_eq!(none.peek().map(|r| r.map(|m| m.len())), Some(Ok(0)));
}

#[test]
pub fn test_any_returns_first_fulfilled() {
    let p = any(vec![
        ExtendedPromise::reject(Error::reason("x")),
        ExtendedPromise::resolve(7),
    ])
    .unwrap();
    assert_eq!(p.peek(), Some(Ok(7)));

    let all_failed = any(vec![
        ExtendedPromise::<u8>::reject(Error::reason("x")),
        ExtendedPromise::reject(Error::reason("y")),
    ])
    .unwrap();
    assert!(matches!(all_failed.peek(), Some(Err(Error::Aggregate(r))) if r.len() == 2));

    assert!(matches!(
        any(Vec::<ExtendedPromise<u8>>::new()),
        Err(Error::Length {
            required: 1,
            available: 0
        })
    ));
}

#[test]
pub fn test_map_accepts_promise_results() {
    let (late, r) = deferred::<i32>();
    let p = map(
        vec![ExtendedPromise::from(late), ExtendedPromise::resolve(2)],
        |v: i32, _| ExtendedPromise::resolve(v * 2),
    );
    assert!(p.is_pending());
    r.fulfill(1);
    assert_eq!(p.peek(), Some(Ok(vec![2, 4])));
}

#[test]
pub fn test_reduce_passes_index_and_total() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let (second, r) = deferred::<i32>();
    let total = reduce(
        vec![
            ExtendedPromise::resolve(1),
            second.into(),
            ExtendedPromise::resolve(3),
        ],
        move |acc: i32, v: i32, index, count| {
            log.lock().push((index, count));
            Ok::<_, Error>(acc + v)
        },
        Ok::<_, Error>(10),
    );
    assert!(total.is_pending());
    r.fulfill(2);
    assert_eq!(total.peek(), Some(Ok(16)));
    assert_eq!(*seen.lock(), vec![(0, 3), (1, 3), (2, 3)]);
}

#[test]
pub fn test_cancel_combinator_cancels_inputs() {
    let cancelled = Arc::new(AtomicUsize::new(0));
    let inputs: Vec<Promise<u8>> = (0..3)
        .map(|_| {
            let counter = cancelled.clone();
            Promise::cancellable(|_| {}, move |r| {
                counter.fetch_add(1, Ordering::SeqCst);
                r.reject(Error::reason("cancelled"));
            })
        })
        .collect();
    let p = all(inputs);
    p.cancel();
    assert_eq!(cancelled.load(Ordering::SeqCst), 3);
    assert_eq!(p.peek(), Some(Err(Error::reason("cancelled"))));
}

#[test]
pub fn test_all_of_waits_for_the_collection() {
    let (list, r) = deferred::<Vec<ExtendedPromise<u8>>>();
    let (second, second_r) = deferred::<u8>();
    let p: ExtendedPromise<Vec<u8>> = all_of(list);
    assert!(p.is_pending());

    r.fulfill(vec![ExtendedPromise::resolve(1), second.into()]);
    assert!(p.is_pending());
    second_r.fulfill(2);
    assert_eq!(p.peek(), Some(Ok(vec![1, 2])));
}

#[test]
pub fn test_combinators_of_rejected_collection() {
    let list = ExtendedPromise::<Vec<Result<u8, Error>>>::reject(Error::reason("no list"));
    let p: ExtendedPromise<Option<u8>> = race_of(list);
    assert_eq!(p.wait(), Err(Error::reason("no list")));
}

#[test]
pub fn test_some_of_rejects_short_collection() {
    let list = ExtendedPromise::resolve(vec![Ok::<u8, Error>(1)]);
    let p = some_of::<u8, _, _>(list, 2);
    assert_eq!(
        p.wait(),
        Err(Error::Length {
            required: 2,
            available: 1
        })
    );

    let list = ExtendedPromise::resolve(vec![Err::<u8, _>(Error::reason("a")), Ok(7)]);
    assert_eq!(any_of::<u8, _, _>(list).wait(), Ok(7));
}

#[test]
pub fn test_reduce_of_folds_promised_collection() {
    let list = ExtendedPromise::resolve(vec![Ok::<i32, Error>(1), Ok(2), Ok(3)]);
    let p = reduce_of(list, |acc: i32, v: i32, _, _| Ok::<_, Error>(acc * 10 + v), Ok::<_, Error>(0));
    assert_eq!(p.wait(), Ok(123));
}

#[test]
pub fn test_cancel_before_collection_arrives() {
    let cancelled = Arc::new(AtomicUsize::new(0));
    let counter = cancelled.clone();
    let list = Promise::<Vec<Result<u8, Error>>>::cancellable(|_| {}, move |r| {
        counter.fetch_add(1, Ordering::SeqCst);
        r.reject(Error::reason("cancelled"));
    });
    let p: ExtendedPromise<Vec<u8>> = all_of(list);
    p.cancel();
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(p.peek(), Some(Err(Error::reason("cancelled"))));
}
