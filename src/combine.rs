//! Fan-in over collections of promises.
//!
//! All combinators keep the input order in their output and cancel every
//! input when the aggregate is cancelled. They differ in how they treat a
//! failing input: [`when`] fails fast, [`join`] records it.
use crate::{
    cancel::CancelToken,
    error::Error,
    promise::{Callbacks, Fulfillment, Promise},
    sync::lock,
};
use std::{
    mem,
    sync::{Arc, Mutex},
};

/// Positional result slots, filled once each.
struct Gather<R> {
    slots: Vec<Option<R>>,
    remaining: usize,
}

impl<R> Gather<R> {
    fn new(len: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(len).collect(),
            remaining: len,
        }
    }

    /// Stores `value` at `index`; yields everything once the last slot fills.
    fn fill(&mut self, index: usize, value: R) -> Option<Vec<R>> {
        if self.slots[index].replace(value).is_none() {
            self.remaining -= 1;
        }
        if self.remaining > 0 {
            return None;
        }
        Some(mem::take(&mut self.slots).into_iter().flatten().collect())
    }
}

/// Subscription tokens of the inputs, cancelled together on first failure.
#[derive(Default)]
struct Siblings {
    tokens: Vec<CancelToken>,
    failed: bool,
}

fn register(siblings: &Mutex<Siblings>, token: CancelToken) {
    {
        let mut siblings = lock(siblings);
        if !siblings.failed {
            siblings.tokens.push(token);
            return;
        }
    }
    token.cancel();
}

fn fail_fast(siblings: &Mutex<Siblings>) {
    let tokens = {
        let mut siblings = lock(siblings);
        siblings.failed = true;
        mem::take(&mut siblings.tokens)
    };
    tracing::trace!(inputs = tokens.len(), "aggregate failed, cancelling remaining inputs");
    for token in tokens {
        token.cancel();
    }
}

/// Succeeds with every value once all inputs succeed; fails with the first
/// rejection and cancels the inputs still pending.
///
/// ```
/// use deferred::{when, Promise};
/// use futures::executor::block_on;
///
/// let all = when([Promise::resolved(3), Promise::resolved(4), Promise::resolved(8)]);
/// assert_eq!(block_on(all.settled()).unwrap(), [3, 4, 8]);
/// ```
pub fn when<T, I>(promises: I) -> Promise<Vec<T>>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<Promise<T>> = promises.into_iter().collect();
    if promises.is_empty() {
        return Promise::resolved(Vec::new());
    }
    let aggregate = Promise::new();
    let gather = Arc::new(Mutex::new(Gather::new(promises.len())));
    let siblings = Arc::new(Mutex::new(Siblings::default()));
    for (index, promise) in promises.iter().enumerate() {
        let target = aggregate.clone();
        let orphan = aggregate.clone();
        let gather = gather.clone();
        let on_failure = siblings.clone();
        let token = promise.attach(
            Callbacks::new().settled(move |result| match result {
                Ok(value) => {
                    let filled = lock(&gather).fill(index, value);
                    if let Some(values) = filled {
                        target.resolve(values);
                    }
                }
                Err(error) => {
                    target.reject(error);
                    fail_fast(&on_failure);
                }
            }),
            None,
            Some(Box::new(move || orphan.cancel())),
        );
        aggregate.link_upstream(token.clone());
        register(&siblings, token);
    }
    aggregate
}

/// [`when`] over a mix of ready values and promises.
///
/// ```
/// use deferred::{flatten, Fulfillment, Promise};
/// use futures::executor::block_on;
///
/// let third = Promise::new();
/// let all = flatten([
///     Fulfillment::Success(1),
///     Fulfillment::Success(2),
///     Fulfillment::Promise(third.clone()),
///     Fulfillment::Success(4),
/// ]);
/// third.resolve(3);
/// assert_eq!(block_on(all.settled()).unwrap(), [1, 2, 3, 4]);
/// ```
pub fn flatten<T, I>(items: I) -> Promise<Vec<T>>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Fulfillment<T>>,
{
    when(items.into_iter().map(|item| match item {
        Fulfillment::Success(value) => Promise::resolved(value),
        Fulfillment::Failure(error) => Promise::rejected(error),
        Fulfillment::Promise(promise) => promise,
    }))
}

/// Succeeds once every input has settled, with each outcome in place.
/// Never fails because an input failed.
pub fn join<T, I>(promises: I) -> Promise<Vec<Result<T, Error>>>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<Promise<T>> = promises.into_iter().collect();
    if promises.is_empty() {
        return Promise::resolved(Vec::new());
    }
    let aggregate = Promise::new();
    let gather = Arc::new(Mutex::new(Gather::new(promises.len())));
    for (index, promise) in promises.iter().enumerate() {
        let target = aggregate.clone();
        let orphan = aggregate.clone();
        let gather = gather.clone();
        let token = promise.attach(
            Callbacks::new().settled(move |result| {
                let filled = lock(&gather).fill(index, result);
                if let Some(results) = filled {
                    target.resolve(results);
                }
            }),
            None,
            Some(Box::new(move || orphan.cancel())),
        );
        aggregate.link_upstream(token);
    }
    aggregate
}

/// [`join`], keeping only the successes.
pub fn compact_join<T, I>(promises: I) -> Promise<Vec<T>>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    join(promises).then_on(|results| results.map(|results| results.successes()).into(), None)
}

/// Completes once every `()` input has settled, failed or not.
pub fn join_void<I>(promises: I) -> Promise<()>
where
    I: IntoIterator<Item = Promise<()>>,
{
    join(promises).then_on(|results| results.map(drop).into(), None)
}

pub trait Successes<T> {
    /// The success values, in order, skipping failures.
    fn successes(self) -> Vec<T>;
}

impl<T> Successes<T> for Vec<Result<T, Error>> {
    fn successes(self) -> Vec<T> {
        self.into_iter().filter_map(Result::ok).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_fills_in_position() {
        let mut gather = Gather::new(3);
        assert!(gather.fill(2, "c").is_none());
        assert!(gather.fill(0, "a").is_none());
        assert_eq!(gather.fill(1, "b"), Some(vec!["a", "b", "c"]));
    }

    #[test]
    fn test_gather_ignores_refill() {
        let mut gather = Gather::new(2);
        assert!(gather.fill(0, 1).is_none());
        assert!(gather.fill(0, 2).is_none());
        assert_eq!(gather.fill(1, 3), Some(vec![2, 3]));
    }

    #[test]
    fn test_successes() {
        assert_eq!(vec![Ok::<_, Error>(2), Ok(3)].successes(), [2, 3]);
        assert_eq!(vec![Err(Error::msg("x")), Ok(3)].successes(), [3]);
        assert!(vec![Err::<i32, _>(Error::msg("x")), Err(Error::msg("y"))]
            .successes()
            .is_empty());
    }

    #[test]
    fn test_register_after_failure_cancels() {
        let siblings = Mutex::new(Siblings::default());
        fail_fast(&siblings);
        let token = CancelToken::new();
        register(&siblings, token.clone());
        assert!(token.is_cancelled());
    }
}
