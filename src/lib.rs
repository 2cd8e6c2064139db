//! Thread-safe promises with chaining, cooperative cancellation and fan-in
//! combinators.
//!
//! A [`Promise`] is settled at most once, by any of its handles, from any
//! thread. Consumers [`subscribe`](Promise::subscribe) before or after that
//! happens and are called back exactly once on a [`Dispatch`] of their
//! choosing, never on the thread that settled the promise. Every subscription
//! hands back a [`CancelToken`] that retracts it; when the last interested
//! subscription is retracted the promise itself is cancelled, and that
//! cancellation travels back up through whatever the promise was chained
//! from.
//!
//! # Examples
//!
//! ```
//! use deferred::{when, Dispatch, Promise};
//! use futures::executor::block_on;
//! use std::thread;
//!
//! let queue = Dispatch::serial("lib-doc").unwrap();
//! let (first, second) = (Promise::<u32>::new(), Promise::<u32>::new());
//! let total = when([first.clone(), second.clone()]).map(|values| values.iter().sum::<u32>(), &queue);
//!
//! thread::spawn(move || first.resolve(3));
//! thread::spawn(move || second.resolve(4));
//! assert_eq!(block_on(total.settled()).unwrap(), 7);
//! ```
mod chain;
mod sync;

pub mod cancel;
pub mod combine;
pub mod dispatch;
pub mod error;
pub mod interop;
pub mod promise;

pub use cancel::CancelToken;
pub use combine::{compact_join, flatten, join, join_void, when, Successes};
pub use dispatch::{Dispatch, Executor, Job, SerialQueue};
pub use error::{DispatchError, Error, TransformPanicked};
pub use interop::{Cancelled, NilValueError, Settled};
pub use promise::{Callbacks, Fulfillment, Promise, Resolver};
