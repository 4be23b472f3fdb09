#![doc(html_root_url = "https://docs.rs/chainpromise/0.1.0")]
//!
//! # Chainable promises with a dependency side channel
//!
//! This crate provides deferred values that are settled from the outside,
//! chained with handlers, cancelled cooperatively and combined in bulk. Every
//! chain carries a [`Dependency`] store: a small keyed bag of JSON values that
//! each handler can read and extend, and that is merged whenever one chain
//! adopts another.
//!
//! ## Features
//! - Promises/A+ style resolution: handlers may return values, errors or other promises
//! - Chaining with `.then`, `.map`, `.otherwise`, `.otherwise_if`, `.always` and `.progress`
//! - Terminal `.done` that re-raises unhandled rejections
//! - Reference-counted cancellation: a shared ancestor is only cancelled once every branch asked for it
//! - Combinators: [`all`], [`race`], [`some`], [`any`], [`map`], [`reduce`], plus `*_of`
//!   variants that first resolve a promised collection
//! - [`LazyPromise`] for deferred construction, [`Thenable`] for foreign promise-likes
//! - Blocking [`wait`](Chainable::wait) and `.await` support
//! - Panic-safe: panics in resolvers and handlers become rejections
//!
//! ## Example
//! ```
//! use chainpromise::{Chainable, Promise};
//! use serde_json::json;
//!
//! let p = Promise::new(|resolvers| resolvers.fulfill(2))
//!     .map(|v, deps| {
//!         deps.add_dependency(json!("checkout"), "flow");
//!         Ok(v * 10)
//!     })
//!     .map(|v, deps| {
//!         assert_eq!(deps.get_dependency("flow"), Some(json!("checkout")));
//!         Ok(v + 5)
//!     });
//! assert_eq!(p.wait(), Ok(25));
//! ```
//!
//! ## Error Handling
//! Rejections carry an [`Error`]. Use [`Error::Reason`] for plain messages
//! and [`Error::custom`] to carry your own error type. A rejection that
//! reaches [`done`](Chainable::done) without a handler is logged and
//! re-raised as a panic whose payload is [`Error::UnhandledRejection`].
//!
//! ## Logging
//! The crate emits [`tracing`] events: settlement and dependency merges at
//! `trace`, cancellations and caught panics at `debug`, self-resolution at
//! `warn` and unhandled rejections at `error`. Install any subscriber to see
//! them.
//!
//! ## See Also
//! - [`Promise`] for the pending state machine
//! - [`Chainable`] for the methods shared by every promise type
//! - [`Dependency`] for the side-channel store

#![warn(missing_docs)]

#[cfg(test)]
mod tests;

mod cancellation;
mod chain_dependency;
mod combinators;
mod error;
mod extended;
mod lazy;
mod promise;
mod settled;

pub use cancellation::{Cancellable, CancellationQueue};
pub use chain_dependency::{
    merge_dependencies, ChainDependency, Dependency, DependencyConfig, DependencyKey,
    KeyAdmission, UnknownPolicy, WritePolicy,
};
pub use combinators::{
    all, all_of, any, any_of, map, map_of, race, race_of, reduce, reduce_of, some, some_of,
};
pub use error::Error;
pub use extended::{
    reject, reject_with, resolve, resolve_with, Chainable, ExtendedPromise, IntoPromise,
    OnFulfilled, OnRejected, Outcome, ProgressHandler, Settlement, Thenable, Update,
};
pub use lazy::LazyPromise;
pub use promise::{Canceller, Promise, Resolvers};
pub use settled::{FulfilledPromise, RejectedPromise};
