//! Bridges between promises and other result representations.
//!
//! A [`Promise`] can be awaited: [`Settled`] observes the eventual result
//! and, when dropped early, withdraws its interest the same way a cancelled
//! subscription does. [`Promise::from_optional`] reports an optional result
//! into a fresh promise.
use crate::{
    cancel::CancelToken,
    error::Error,
    promise::{Callbacks, Fulfillment, Promise},
};
use std::{
    future::{Future, IntoFuture},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

/// The source promise succeeded without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("promise fulfilled with no value")]
pub struct NilValueError;

/// The awaited promise was cancelled before it settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("promise was cancelled")]
pub struct Cancelled;

/// Future resolving to a promise's result.
///
/// Subscribes on first poll. Dropping it before completion cancels that
/// subscription.
///
/// ```
/// use deferred::Promise;
/// use futures::executor::block_on;
/// use std::thread;
///
/// let promise = Promise::<String>::new();
/// let producer = promise.clone();
/// let task = thread::spawn(move || block_on(promise.settled()));
/// producer.resolve("🍓".into());
/// let value = task.join().expect("The task thread has panicked");
/// assert_eq!(value.unwrap(), "🍓");
/// ```
pub struct Settled<T> {
    promise: Promise<T>,
    slot: Arc<spin::Mutex<Slot<T>>>,
    token: Option<CancelToken>,
}

struct Slot<T> {
    value: Option<Result<T, Error>>,
    waker: Option<Waker>,
}

impl<T> Slot<T> {
    fn put(&mut self, value: Result<T, Error>) -> Option<Waker> {
        self.value = Some(value);
        self.waker.take()
    }
}

impl<T: Clone + Send + 'static> Settled<T> {
    fn subscribe(&self) -> CancelToken {
        let on_settled = self.slot.clone();
        let on_abandon = self.slot.clone();
        self.promise.attach(
            Callbacks::new().settled(move |result| {
                let waker = on_settled.lock().put(result);
                if let Some(waker) = waker {
                    waker.wake()
                }
            }),
            None,
            Some(Box::new(move || {
                let waker = on_abandon.lock().put(Err(Error::new(Cancelled)));
                if let Some(waker) = waker {
                    waker.wake()
                }
            })),
        )
    }
}

impl<T: Clone + Send + 'static> Future for Settled<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        {
            let mut slot = this.slot.lock();
            if let Some(value) = slot.value.take() {
                this.token = None;
                return Poll::Ready(value);
            }
            slot.waker = Some(cx.waker().clone());
        }
        if this.token.is_none() {
            this.token = Some(this.subscribe());
            // Settled or cancelled promises deliver during subscribe.
            if let Some(value) = this.slot.lock().value.take() {
                this.token = None;
                return Poll::Ready(value);
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for Settled<T> {
    /// Withdraws interest if the result never arrived.
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// A future for this promise's result.
    pub fn settled(&self) -> Settled<T> {
        Settled {
            promise: self.clone(),
            slot: Arc::new(spin::Mutex::new(Slot {
                value: None,
                waker: None,
            })),
            token: None,
        }
    }

    /// Unwraps an optional success, rejecting with [`NilValueError`] on
    /// `None`. Cancelling the returned promise withdraws its interest in
    /// `source`.
    pub fn from_optional(source: &Promise<Option<T>>) -> Promise<T> {
        source.then_on(
            |result| match result {
                Ok(Some(value)) => Fulfillment::Success(value),
                Ok(None) => Fulfillment::Failure(Error::new(NilValueError)),
                Err(error) => Fulfillment::Failure(error),
            },
            None,
        )
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Promise<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Settled<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.settled()
    }
}
