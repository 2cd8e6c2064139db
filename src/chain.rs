//! Sequential chaining: `then` and the map/recover family built on it.
//!
//! Each operation subscribes to the source promise and returns a derived
//! promise. Cancelling the derived promise cancels that subscription, which
//! in turn cancels the source once nothing else is interested in it.
//! Cancelling the source before it settles cancels the derived promise.
use crate::{
    dispatch::{panic_message, Dispatch},
    error::{Error, TransformPanicked},
    promise::{Callbacks, Fulfillment, Promise},
};
use std::panic::{catch_unwind, AssertUnwindSafe};

impl<T: Clone + Send + 'static> Promise<T> {
    /// Runs `transform` on `dispatch` with the settled result and fulfils the
    /// returned promise with whatever it produces, including another promise.
    ///
    /// A panicking `transform` rejects the returned promise with
    /// [`TransformPanicked`].
    pub fn then<U, F>(&self, transform: F, dispatch: &Dispatch) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, Error>) -> Fulfillment<U> + Send + 'static,
    {
        self.then_on(transform, Some(dispatch.clone()))
    }

    pub(crate) fn then_on<U, F>(&self, transform: F, dispatch: Option<Dispatch>) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, Error>) -> Fulfillment<U> + Send + 'static,
    {
        let derived = Promise::new();
        let target = derived.clone();
        let orphan = derived.clone();
        let token = self.attach(
            Callbacks::new().settled(move |result| target.fulfill(guarded(transform, result))),
            dispatch,
            Some(Box::new(move || orphan.cancel())),
        );
        derived.link_upstream(token);
        derived
    }

    pub fn map<U, F>(&self, transform: F, dispatch: &Dispatch) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then(
            move |result| match result {
                Ok(value) => Fulfillment::Success(transform(value)),
                Err(error) => Fulfillment::Failure(error),
            },
            dispatch,
        )
    }

    /// Like [`map`](Promise::map), but an `Err` from `transform` rejects the
    /// returned promise.
    ///
    /// ```
    /// use deferred::{Dispatch, Error, Promise};
    /// use futures::executor::block_on;
    ///
    /// let queue = Dispatch::serial("try-map-doc").unwrap();
    /// let parsed = Promise::resolved("1.4".to_owned())
    ///     .try_map(|text| text.parse::<i32>().map_err(Error::new), &queue);
    /// assert!(block_on(parsed.settled()).is_err());
    /// ```
    pub fn try_map<U, F>(&self, transform: F, dispatch: &Dispatch) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, Error> + Send + 'static,
    {
        self.then(
            move |result| match result {
                Ok(value) => transform(value).into(),
                Err(error) => Fulfillment::Failure(error),
            },
            dispatch,
        )
    }

    pub fn flat_map<U, F>(&self, transform: F, dispatch: &Dispatch) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.then(
            move |result| match result {
                Ok(value) => Fulfillment::Promise(transform(value)),
                Err(error) => Fulfillment::Failure(error),
            },
            dispatch,
        )
    }

    /// Substitutes a value for a rejection. Successes pass through.
    pub fn recover<F>(&self, handler: F, dispatch: &Dispatch) -> Promise<T>
    where
        F: FnOnce(Error) -> T + Send + 'static,
    {
        self.then(
            move |result| match result {
                Ok(value) => Fulfillment::Success(value),
                Err(error) => Fulfillment::Success(handler(error)),
            },
            dispatch,
        )
    }

    pub fn try_recover<F>(&self, handler: F, dispatch: &Dispatch) -> Promise<T>
    where
        F: FnOnce(Error) -> Result<T, Error> + Send + 'static,
    {
        self.then(
            move |result| match result {
                Ok(value) => Fulfillment::Success(value),
                Err(error) => handler(error).into(),
            },
            dispatch,
        )
    }

    pub fn flat_recover<F>(&self, handler: F, dispatch: &Dispatch) -> Promise<T>
    where
        F: FnOnce(Error) -> Promise<T> + Send + 'static,
    {
        self.then(
            move |result| match result {
                Ok(value) => Fulfillment::Success(value),
                Err(error) => Fulfillment::Promise(handler(error)),
            },
            dispatch,
        )
    }
}

fn guarded<T, U, F>(transform: F, result: Result<T, Error>) -> Fulfillment<U>
where
    F: FnOnce(Result<T, Error>) -> Fulfillment<U>,
{
    catch_unwind(AssertUnwindSafe(move || transform(result))).unwrap_or_else(|panic| {
        let message = panic_message(panic.as_ref());
        tracing::warn!(panic = %message, "promise transform panicked, rejecting");
        Fulfillment::Failure(Error::new(TransformPanicked { message }))
    })
}
