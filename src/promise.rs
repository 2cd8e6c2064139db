//! The promise state machine and its subscription protocol.
use crate::{
    cancel::{CancelToken, Observer},
    dispatch::{run_inline, Dispatch, Job},
    error::Error,
    sync::lock,
};
use std::{
    fmt, mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

type SuccessFn<T> = Box<dyn FnOnce(T) + Send + 'static>;
type ObservedFn<T> = Box<dyn FnOnce(&Result<T, Error>) + Send + 'static>;
type FailureFn = Box<dyn FnOnce(Error) + Send + 'static>;
type SettledFn<T> = Box<dyn FnOnce(Result<T, Error>) + Send + 'static>;

/// What a producer hands to [`Promise::fulfill`].
pub enum Fulfillment<T> {
    Success(T),
    Failure(Error),
    /// Settle later, with whatever this other promise settles with.
    Promise(Promise<T>),
}

impl<T> Fulfillment<T> {
    /// `false` only while the outcome still depends on another promise.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Fulfillment::Promise(_))
    }
}

impl<T> From<Result<T, Error>> for Fulfillment<T> {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(value) => Fulfillment::Success(value),
            Err(error) => Fulfillment::Failure(error),
        }
    }
}

impl<T> From<Promise<T>> for Fulfillment<T> {
    fn from(promise: Promise<T>) -> Self {
        Fulfillment::Promise(promise)
    }
}

impl<T: fmt::Debug> fmt::Debug for Fulfillment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fulfillment::Success(value) => f.debug_tuple("Success").field(value).finish(),
            Fulfillment::Failure(error) => f.debug_tuple("Failure").field(error).finish(),
            Fulfillment::Promise(promise) => f.debug_tuple("Promise").field(promise).finish(),
        }
    }
}

/// The callbacks of one subscription.
///
/// At settlement they run in a fixed order: `observed` first, then exactly
/// one of `success` / `failure`, then `always`.
///
/// # Examples
///
/// ```
/// use deferred::{Callbacks, Dispatch, Promise};
/// use std::sync::mpsc::channel;
///
/// let queue = Dispatch::serial("callbacks-doc").unwrap();
/// let (tx, rx) = channel();
/// let promise = Promise::resolved(3);
/// let always = tx.clone();
/// promise.subscribe(
///     Callbacks::new()
///         .success(move |value| tx.send(format!("success {value}")).unwrap())
///         .always(move || always.send("always".to_owned()).unwrap()),
///     &queue,
/// );
/// assert_eq!(rx.recv().unwrap(), "success 3");
/// assert_eq!(rx.recv().unwrap(), "always");
/// ```
pub struct Callbacks<T> {
    success: Option<SuccessFn<T>>,
    observed: Option<ObservedFn<T>>,
    failure: Option<FailureFn>,
    always: Option<Job>,
    // Engine-internal: takes the whole result, used by combinators.
    settled: Option<SettledFn<T>>,
}

impl<T> Callbacks<T> {
    pub fn new() -> Self {
        Self {
            success: None,
            observed: None,
            failure: None,
            always: None,
            settled: None,
        }
    }

    pub fn success(mut self, on_success: impl FnOnce(T) + Send + 'static) -> Self {
        self.success = Some(Box::new(on_success));
        self
    }

    /// Sees every outcome but, on its own, does not keep the promise alive.
    pub fn observed(mut self, on_observed: impl FnOnce(&Result<T, Error>) + Send + 'static) -> Self {
        self.observed = Some(Box::new(on_observed));
        self
    }

    pub fn failure(mut self, on_failure: impl FnOnce(Error) + Send + 'static) -> Self {
        self.failure = Some(Box::new(on_failure));
        self
    }

    pub fn always(mut self, on_always: impl FnOnce() + Send + 'static) -> Self {
        self.always = Some(Box::new(on_always));
        self
    }

    pub(crate) fn settled(mut self, on_settled: impl FnOnce(Result<T, Error>) + Send + 'static) -> Self {
        self.settled = Some(Box::new(on_settled));
        self
    }

    /// Whether a subscription with these callbacks is worth keeping the
    /// promise around for.
    pub fn keeps_alive(&self) -> bool {
        self.success.is_some()
            || self.failure.is_some()
            || self.always.is_some()
            || self.settled.is_some()
    }

    fn invoke(self, result: Result<T, Error>) {
        if let Some(observed) = self.observed {
            observed(&result);
        }
        match (self.settled, result) {
            (Some(settled), result) => settled(result),
            (None, Ok(value)) => {
                if let Some(success) = self.success {
                    success(value)
                }
            }
            (None, Err(error)) => {
                if let Some(failure) = self.failure {
                    failure(error)
                }
            }
        }
        if let Some(always) = self.always {
            always();
        }
    }
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscription<T> {
    token: CancelToken,
    callbacks: Callbacks<T>,
    // `None` runs inline; only the engine's own wiring subscribes that way.
    dispatch: Option<Dispatch>,
    on_abandon: Option<Job>,
}

impl<T: Send + 'static> Subscription<T> {
    fn keeps_alive(&self) -> bool {
        self.callbacks.keeps_alive()
    }

    fn deliver(self, result: Result<T, Error>) {
        let Subscription {
            token,
            callbacks,
            dispatch,
            ..
        } = self;
        let job = move || {
            if !token.is_cancelled() {
                callbacks.invoke(result)
            }
        };
        match dispatch {
            Some(dispatch) => dispatch.execute(Box::new(job)),
            None => run_inline(Box::new(job)),
        }
    }

    fn abandon(self) {
        if let Some(on_abandon) = self.on_abandon {
            on_abandon()
        }
    }
}

enum Settlement<T> {
    Unfulfilled,
    /// Waiting on another promise; still unresolved.
    Chained,
    Settled(Result<T, Error>),
}

struct State<T> {
    settlement: Settlement<T>,
    cancelled: bool,
    subscriptions: Vec<Subscription<T>>,
    observer: Option<Observer>,
    upstream: Vec<CancelToken>,
}

impl<T> State<T> {
    fn is_settled(&self) -> bool {
        matches!(self.settlement, Settlement::Settled(_))
    }
}

struct Shared<T> {
    // Mirrors `State::cancelled` for lock-free reads.
    cancelled: AtomicBool,
    state: Mutex<State<T>>,
}

/// Work left over after a cancellation, run once the state lock is gone.
struct Teardown<T> {
    observer: Option<Observer>,
    upstream: Vec<CancelToken>,
    abandoned: Vec<Subscription<T>>,
}

impl<T: Send + 'static> Teardown<T> {
    fn run(self) {
        for token in self.upstream {
            token.cancel();
        }
        for subscription in self.abandoned {
            subscription.abandon();
        }
        if let Some(observer) = self.observer {
            observer.fire();
        }
    }
}

/// A single-assignment, shareable, cancellable result.
///
/// Clones are handles to the same promise. Any clone may fulfill it, cancel
/// it or subscribe to it, from any thread.
///
/// # Examples
///
/// ```
/// use deferred::{Dispatch, Promise};
/// use futures::executor::block_on;
/// use std::thread;
///
/// let queue = Dispatch::serial("promise-doc").unwrap();
/// let promise = Promise::<String>::new();
/// let length = promise.map(|text| text.len(), &queue);
/// let producer = promise.clone();
/// thread::spawn(move || producer.resolve("🍓".into()));
/// assert_eq!(block_on(length.settled()).unwrap(), 4);
/// ```
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("cancelled", &self.shared.cancelled.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl Promise<()> {
    /// An already successful `()` promise.
    pub fn completed() -> Self {
        Self::resolved(())
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self::with_settlement(Settlement::Unfulfilled)
    }

    pub fn resolved(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    pub fn rejected(error: Error) -> Self {
        Self::from_result(Err(error))
    }

    pub fn from_result(result: Result<T, Error>) -> Self {
        Self::with_settlement(Settlement::Settled(result))
    }

    /// Creates a promise and hands its producer side to `resolver` right
    /// away, on the calling thread.
    ///
    /// ```
    /// use deferred::Promise;
    /// use futures::executor::block_on;
    ///
    /// let promise = Promise::with_resolver(|resolver| resolver.resolve("Success"));
    /// assert_eq!(block_on(promise.settled()).unwrap(), "Success");
    /// ```
    pub fn with_resolver(resolver: impl FnOnce(Resolver<T>)) -> Self {
        let promise = Self::new();
        resolver(Resolver {
            promise: promise.clone(),
        });
        promise
    }

    fn with_settlement(settlement: Settlement<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(State {
                    settlement,
                    cancelled: false,
                    subscriptions: Vec::new(),
                    observer: None,
                    upstream: Vec::new(),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        lock(&self.shared.state)
    }

    /// `true` once a terminal result is recorded. A promise waiting on a
    /// chained promise is not settled yet.
    pub fn is_settled(&self) -> bool {
        self.lock().is_settled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// The terminal result, if there is one.
    pub fn result(&self) -> Option<Result<T, Error>> {
        match &self.lock().settlement {
            Settlement::Settled(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// Settles the promise, or defers settlement to another promise.
    ///
    /// Only the first call counts, chained or not. Later calls, and calls
    /// after the promise was cancelled, are ignored.
    pub fn fulfill(&self, fulfillment: impl Into<Fulfillment<T>>) {
        match fulfillment.into() {
            Fulfillment::Success(value) => self.settle(Ok(value), false),
            Fulfillment::Failure(error) => self.settle(Err(error), false),
            Fulfillment::Promise(inner) => self.chain(inner),
        }
    }

    pub fn resolve(&self, value: T) {
        self.settle(Ok(value), false)
    }

    pub fn reject(&self, error: Error) {
        self.settle(Err(error), false)
    }

    fn settle(&self, result: Result<T, Error>, from_chain: bool) {
        let (subscriptions, stale) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.settlement {
                Settlement::Settled(_) => {
                    tracing::debug!("promise already settled, ignoring fulfil");
                    return;
                }
                Settlement::Chained if !from_chain => {
                    tracing::debug!("promise is waiting on a chained promise, ignoring fulfil");
                    return;
                }
                _ => {}
            }
            if state.cancelled {
                tracing::trace!("promise was cancelled first, dropping result");
                return;
            }
            state.settlement = Settlement::Settled(result.clone());
            (
                mem::take(&mut state.subscriptions),
                (state.observer.take(), mem::take(&mut state.upstream)),
            )
        };
        drop(stale);
        tracing::trace!(
            success = result.is_ok(),
            subscribers = subscriptions.len(),
            "promise settled"
        );
        for subscription in subscriptions {
            subscription.deliver(result.clone());
        }
    }

    fn chain(&self, inner: Promise<T>) {
        {
            let mut state = self.lock();
            if !matches!(state.settlement, Settlement::Unfulfilled) {
                tracing::debug!("promise already fulfilled, ignoring chained fulfil");
                return;
            }
            if !state.cancelled {
                state.settlement = Settlement::Chained;
            }
        }
        if self.is_cancelled() {
            tracing::trace!("chaining onto a cancelled promise, cancelling the inner one");
            inner.cancel();
            return;
        }
        tracing::trace!("promise chained");
        let on_success = self.clone();
        let on_failure = self.clone();
        let orphan = self.clone();
        let token = inner.attach(
            Callbacks::new()
                .success(move |value| on_success.settle(Ok(value), true))
                .failure(move |error| on_failure.settle(Err(error), true)),
            None,
            Some(Box::new(move || orphan.cancel())),
        );
        self.link_upstream(token);
    }

    /// Requests cancellation.
    ///
    /// Has no effect on a settled promise. Otherwise any later fulfil is
    /// ignored, pending subscriptions are dropped without firing, upstream
    /// subscriptions this promise was derived from are cancelled and the
    /// cancellation observer is dispatched.
    pub fn cancel(&self) {
        if self.is_cancelled() {
            return;
        }
        let teardown = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.cancelled || state.is_settled() {
                return;
            }
            self.trip(state)
        };
        tracing::trace!("promise cancelled");
        run_inline(Box::new(move || teardown.run()));
    }

    fn trip(&self, state: &mut State<T>) -> Teardown<T> {
        state.cancelled = true;
        self.shared.cancelled.store(true, Ordering::Release);
        Teardown {
            observer: state.observer.take(),
            upstream: mem::take(&mut state.upstream),
            abandoned: mem::take(&mut state.subscriptions),
        }
    }

    /// Registers the cancellation observer, replacing any earlier one.
    ///
    /// Ignored once the promise is settled; dispatched right away if the
    /// promise is already cancelled.
    pub fn on_cancelled<F>(&self, callback: F, dispatch: &Dispatch)
    where
        F: FnOnce() + Send + 'static,
    {
        let observer = Observer::new(Box::new(callback), dispatch.clone());
        {
            let mut state = self.lock();
            if state.is_settled() {
                return;
            }
            if !state.cancelled {
                state.observer = Some(observer);
                return;
            }
        }
        observer.fire();
    }

    /// Registers `callbacks` to run on `dispatch` once the promise settles.
    ///
    /// Cancelling the returned token before delivery suppresses every
    /// callback. If no remaining subscription then keeps the promise alive,
    /// the promise itself is cancelled.
    pub fn subscribe(&self, callbacks: Callbacks<T>, dispatch: &Dispatch) -> CancelToken {
        self.attach(callbacks, Some(dispatch.clone()), None)
    }

    pub fn done(&self, on_success: impl FnOnce(T) + Send + 'static, dispatch: &Dispatch) -> CancelToken {
        self.subscribe(Callbacks::new().success(on_success), dispatch)
    }

    pub fn caught(&self, on_failure: impl FnOnce(Error) + Send + 'static, dispatch: &Dispatch) -> CancelToken {
        self.subscribe(Callbacks::new().failure(on_failure), dispatch)
    }

    pub fn observed(
        &self,
        on_observed: impl FnOnce(&Result<T, Error>) + Send + 'static,
        dispatch: &Dispatch,
    ) -> CancelToken {
        self.subscribe(Callbacks::new().observed(on_observed), dispatch)
    }

    pub fn always(&self, on_always: impl FnOnce() + Send + 'static, dispatch: &Dispatch) -> CancelToken {
        self.subscribe(Callbacks::new().always(on_always), dispatch)
    }

    /// Subscription primitive behind every consumer operation.
    ///
    /// `on_abandon` runs if the promise is cancelled while the subscription
    /// is still pending.
    pub(crate) fn attach(
        &self,
        callbacks: Callbacks<T>,
        dispatch: Option<Dispatch>,
        on_abandon: Option<Job>,
    ) -> CancelToken {
        enum Outcome<T> {
            Deliver(Subscription<T>, Result<T, Error>),
            Abandon(Subscription<T>),
            Queued,
        }

        let token = CancelToken::new();
        let subscription = Subscription {
            token: token.clone(),
            callbacks,
            dispatch,
            on_abandon,
        };
        let outcome = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match &state.settlement {
                Settlement::Settled(result) => Outcome::Deliver(subscription, result.clone()),
                _ if state.cancelled => Outcome::Abandon(subscription),
                _ => {
                    state.subscriptions.push(subscription);
                    Outcome::Queued
                }
            }
        };
        match outcome {
            Outcome::Deliver(subscription, result) => subscription.deliver(result),
            Outcome::Abandon(subscription) => subscription.abandon(),
            Outcome::Queued => {
                let owner = Arc::downgrade(&self.shared);
                let id = token.id();
                token.on_release(move || {
                    if let Some(shared) = owner.upgrade() {
                        Promise { shared }.release(id)
                    }
                });
            }
        }
        token
    }

    /// Drops the subscription behind token `id`, then cancels the promise if
    /// nothing left is interested in its result.
    fn release(&self, id: u64) {
        let (released, teardown) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.cancelled || state.is_settled() {
                return;
            }
            let (released, kept): (Vec<_>, Vec<_>) = mem::take(&mut state.subscriptions)
                .into_iter()
                .partition(|subscription| subscription.token.id() == id);
            state.subscriptions = kept;
            if state.subscriptions.iter().any(Subscription::keeps_alive) {
                (released, None)
            } else {
                (released, Some(self.trip(state)))
            }
        };
        drop(released);
        if let Some(teardown) = teardown {
            tracing::debug!("last interested subscription released, cancelling promise");
            run_inline(Box::new(move || teardown.run()));
        }
    }

    /// Ties `token` to this promise's cancellation: cancelling the promise
    /// cancels the token. Dropped silently once settled.
    pub(crate) fn link_upstream(&self, token: CancelToken) {
        {
            let mut state = self.lock();
            if state.is_settled() {
                return;
            }
            if !state.cancelled {
                state.upstream.push(token);
                return;
            }
        }
        token.cancel();
    }
}

/// Producer-only handle given out by [`Promise::with_resolver`].
pub struct Resolver<T> {
    promise: Promise<T>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Resolver<T> {
    pub fn fulfill(&self, fulfillment: impl Into<Fulfillment<T>>) {
        self.promise.fulfill(fulfillment)
    }

    pub fn resolve(&self, value: T) {
        self.promise.resolve(value)
    }

    pub fn reject(&self, error: Error) {
        self.promise.reject(error)
    }

    pub fn is_cancelled(&self) -> bool {
        self.promise.is_cancelled()
    }
}
