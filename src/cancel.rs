//! Cooperative cancellation handles.
use crate::dispatch::{Dispatch, Job};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// A callback waiting for cancellation, plus where to run it.
pub(crate) struct Observer {
    callback: Job,
    dispatch: Dispatch,
}

impl Observer {
    pub(crate) fn new(callback: Job, dispatch: Dispatch) -> Self {
        Self { callback, dispatch }
    }

    pub(crate) fn fire(self) {
        self.dispatch.execute(self.callback)
    }
}

/// Flags that an operation has been asked to stop.
///
/// Cloning yields another handle to the same token. The flag moves from
/// `false` to `true` once and never back, and the registered observer runs
/// at most once however many times [`cancel`](CancelToken::cancel) is called.
///
/// # Examples
///
/// ```
/// use deferred::{CancelToken, Dispatch};
/// use std::sync::mpsc::channel;
///
/// let queue = Dispatch::serial("cancel-doc").unwrap();
/// let token = CancelToken::new();
/// let (tx, rx) = channel();
/// token.on_cancelled(move || tx.send(()).unwrap(), &queue);
/// token.cancel();
/// token.cancel();
/// rx.recv().unwrap();
/// assert!(token.is_cancelled());
/// ```
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

struct Shared {
    id: u64,
    cancelled: AtomicBool,
    // O(1) critical sections only.
    slots: spin::Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    observer: Option<Observer>,
    release: Option<Job>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
                cancelled: AtomicBool::new(false),
                slots: spin::Mutex::new(Slots::default()),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Requests cancellation. Only the first call has any effect.
    pub fn cancel(&self) {
        let (observer, release) = {
            let mut slots = self.shared.slots.lock();
            if self.shared.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            (slots.observer.take(), slots.release.take())
        };
        tracing::trace!(token = self.shared.id, "cancel token tripped");
        if let Some(release) = release {
            release();
        }
        if let Some(observer) = observer {
            observer.fire();
        }
    }

    /// Registers the cancellation observer, replacing any earlier one.
    ///
    /// When the token is already cancelled the callback is dispatched right
    /// away instead of being stored.
    pub fn on_cancelled<F>(&self, callback: F, dispatch: &Dispatch)
    where
        F: FnOnce() + Send + 'static,
    {
        let observer = Observer::new(Box::new(callback), dispatch.clone());
        {
            let mut slots = self.shared.slots.lock();
            if !self.is_cancelled() {
                slots.observer = Some(observer);
                return;
            }
        }
        observer.fire();
    }

    /// Installs the engine's own hook. It runs inline on the cancelling
    /// thread, before the public observer is dispatched.
    pub(crate) fn on_release<F>(&self, release: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut slots = self.shared.slots.lock();
            if !self.is_cancelled() {
                slots.release = Some(Box::new(release));
                return;
            }
        }
        release();
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("id", &self.shared.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{atomic::AtomicUsize, mpsc::channel},
        thread,
        time::Duration,
    };

    #[test]
    fn test_cancel_fires_observer_once() {
        let queue = Dispatch::serial("test_cancel_fires_observer_once").unwrap();
        let token = CancelToken::new();
        let (tx, rx) = channel();
        token.on_cancelled(move || tx.send(()).unwrap(), &queue);
        token.cancel();
        token.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_late_observer_runs_immediately() {
        let queue = Dispatch::serial("test_late_observer_runs_immediately").unwrap();
        let token = CancelToken::new();
        token.cancel();
        let (tx, rx) = channel();
        token.on_cancelled(move || tx.send(()).unwrap(), &queue);
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_ok());
    }

    #[test]
    fn test_reregistration_replaces_observer() {
        let queue = Dispatch::serial("test_reregistration_replaces_observer").unwrap();
        let token = CancelToken::new();
        let (tx, rx) = channel();
        let first = tx.clone();
        token.on_cancelled(move || first.send("first").unwrap(), &queue);
        token.on_cancelled(move || tx.send("second").unwrap(), &queue);
        token.cancel();
        assert_eq!(rx.recv_timeout(Duration::from_millis(500)), Ok("second"));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_release_hook_is_separate_from_observer() {
        let queue = Dispatch::serial("test_release_hook_is_separate_from_observer").unwrap();
        let token = CancelToken::new();
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        token.on_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (tx, rx) = channel();
        token.on_cancelled(move || tx.send(()).unwrap(), &queue);
        token.cancel();
        // The release hook runs inline.
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_ok());
    }

    #[test]
    fn test_concurrent_cancel_and_register() {
        let queue = Dispatch::serial("test_concurrent_cancel_and_register").unwrap();
        for _ in 0..64 {
            let token = CancelToken::new();
            let (tx, rx) = channel();
            let canceller = token.clone();
            let handle = thread::spawn(move || canceller.cancel());
            token.on_cancelled(move || tx.send(()).unwrap(), &queue);
            token.cancel();
            handle.join().expect("The cancel thread has panicked");
            assert!(rx.recv_timeout(Duration::from_millis(500)).is_ok());
            assert!(rx.recv_timeout(Duration::from_millis(10)).is_err());
        }
    }
}
