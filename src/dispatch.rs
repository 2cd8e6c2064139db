//! Execution contexts that promise callbacks are delivered on.
//!
//! The promise engine never runs user code on the thread that settled or
//! cancelled a promise. Every callback is handed to a [`Dispatch`], which
//! forwards it to an [`Executor`] chosen by the subscriber.
//!
//! # Examples
//!
//! ```
//! use deferred::{Dispatch, Promise};
//! use std::sync::mpsc::channel;
//!
//! let queue = Dispatch::serial("example").unwrap();
//! let (tx, rx) = channel();
//! Promise::resolved(7).done(move |value| tx.send(value).unwrap(), &queue);
//! assert_eq!(rx.recv().unwrap(), 7);
//! ```
use crate::error::DispatchError;
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        mpsc::{channel, Sender},
        Arc,
    },
    thread,
};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run a job later, somewhere else.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Job);
}

/// Cloneable handle to an [`Executor`].
#[derive(Clone)]
pub struct Dispatch {
    executor: Arc<dyn Executor>,
}

impl Dispatch {
    pub fn new(executor: impl Executor) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }

    /// A dedicated worker thread running jobs one at a time, in the order
    /// they were dispatched.
    pub fn serial(label: impl Into<String>) -> Result<Self, DispatchError> {
        Ok(Self::new(SerialQueue::new(label)?))
    }

    /// Jobs run on a `futures` thread pool.
    #[cfg(feature = "thread-pool")]
    pub fn thread_pool(pool: futures::executor::ThreadPool) -> Self {
        Self::new(pool)
    }

    pub fn execute(&self, job: Job) {
        self.executor.execute(job)
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch").finish_non_exhaustive()
    }
}

/// FIFO job queue drained by a single named thread.
///
/// The worker exits once every handle to the queue is dropped and the
/// backlog is empty.
#[derive(Debug)]
pub struct SerialQueue {
    label: String,
    sender: Sender<Job>,
}

impl SerialQueue {
    pub fn new(label: impl Into<String>) -> Result<Self, DispatchError> {
        let label = label.into();
        let (sender, receiver) = channel::<Job>();
        let worker_label = label.clone();
        thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                for job in receiver {
                    run_guarded(&worker_label, job);
                }
                tracing::trace!(queue = %worker_label, "serial queue drained");
            })
            .map_err(|source| DispatchError::Spawn {
                label: label.clone(),
                source,
            })?;
        Ok(Self { label, sender })
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Executor for SerialQueue {
    fn execute(&self, job: Job) {
        if self.sender.send(job).is_err() {
            tracing::warn!(queue = %self.label, "serial queue worker is gone, dropping job");
        }
    }
}

#[cfg(feature = "thread-pool")]
impl Executor for futures::executor::ThreadPool {
    fn execute(&self, job: Job) {
        self.spawn_ok(async move { run_guarded("thread-pool", job) })
    }
}

/// Runs a dispatched job, logging a panic instead of letting it take the
/// worker down.
fn run_guarded(queue: &str, job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!(
            queue = %queue,
            panic = %panic_message(panic.as_ref()),
            "dispatched job panicked"
        );
    }
}

thread_local! {
    // `Some` while this thread is draining inline engine work.
    static INLINE: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

/// Resets the inline queue even if a job unwinds.
struct Draining;

impl Drop for Draining {
    fn drop(&mut self) {
        // Leftover jobs are dropped outside the borrow.
        let leftover = INLINE.with(|inline| inline.borrow_mut().take());
        drop(leftover);
    }
}

/// Runs engine-internal work on the calling thread.
///
/// Work started from inside another inline job is queued and run after it
/// returns, so forwarding through a chain of any length uses constant
/// stack. The outermost call returns once the queue is empty.
pub(crate) fn run_inline(job: Job) {
    let first = INLINE.with(|inline| {
        let mut inline = inline.borrow_mut();
        if let Some(pending) = inline.as_mut() {
            pending.push_back(job);
            return None;
        }
        *inline = Some(VecDeque::new());
        Some(job)
    });
    let Some(first) = first else {
        return;
    };
    let _draining = Draining;
    first();
    while let Some(job) = INLINE.with(|inline| inline.borrow_mut().as_mut()?.pop_front()) {
        job();
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc::channel, time::Duration};

    #[test]
    fn test_serial_queue_runs_in_order() {
        let queue = Dispatch::serial("test_serial_queue_runs_in_order").unwrap();
        let (tx, rx) = channel();
        for i in 0..16 {
            let tx = tx.clone();
            queue.execute(Box::new(move || tx.send(i).unwrap()));
        }
        let seen: Vec<i32> = (0..16)
            .map(|_| rx.recv_timeout(Duration::from_millis(500)).unwrap())
            .collect();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_serial_queue_runs_off_thread() {
        let queue = Dispatch::serial("off-thread").unwrap();
        let (tx, rx) = channel();
        queue.execute(Box::new(move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap()
        }));
        let name = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(name.as_deref(), Some("off-thread"));
    }

    #[test]
    fn test_serial_queue_survives_panicking_job() {
        let queue = Dispatch::serial("test_serial_queue_survives_panicking_job").unwrap();
        let (tx, rx) = channel();
        queue.execute(Box::new(|| panic!("boom")));
        queue.execute(Box::new(move || tx.send(()).unwrap()));
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_ok());
    }

    #[cfg(feature = "thread-pool")]
    #[test]
    fn test_thread_pool_dispatch() {
        let pool = futures::executor::ThreadPool::new().unwrap();
        let dispatch = Dispatch::thread_pool(pool);
        let (tx, rx) = channel();
        dispatch.execute(Box::new(move || tx.send(42).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_millis(500)).unwrap(), 42);
    }

    #[cfg(feature = "thread-pool")]
    #[test]
    fn test_thread_pool_survives_panicking_job() {
        let pool = futures::executor::ThreadPool::builder()
            .pool_size(1)
            .create()
            .unwrap();
        let dispatch = Dispatch::thread_pool(pool);
        let (tx, rx) = channel();
        dispatch.execute(Box::new(|| panic!("boom")));
        dispatch.execute(Box::new(move || tx.send(1).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_millis(500)), Ok(1));
    }

    #[test]
    fn test_serial_queue_label() {
        let queue = SerialQueue::new("labelled").unwrap();
        assert_eq!(queue.label(), "labelled");
    }

    #[test]
    fn test_run_inline_queues_nested_work() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let outer = log.clone();
        run_inline(Box::new(move || {
            let nested = outer.clone();
            run_inline(Box::new(move || nested.lock().unwrap().push("nested")));
            outer.lock().unwrap().push("outer");
        }));
        assert_eq!(*log.lock().unwrap(), ["outer", "nested"]);
    }

    #[test]
    fn test_run_inline_deep_nesting() {
        fn step(depth: usize, done: Sender<usize>) {
            if depth == 0 {
                done.send(depth).unwrap();
                return;
            }
            run_inline(Box::new(move || step(depth - 1, done)));
        }
        let (tx, rx) = channel();
        run_inline(Box::new(move || step(1_000_000, tx)));
        assert_eq!(rx.try_recv(), Ok(0));
    }

    #[test]
    fn test_run_inline_recovers_after_panic() {
        let unwound = catch_unwind(|| run_inline(Box::new(|| panic!("inline boom"))));
        assert!(unwound.is_err());
        let (tx, rx) = channel();
        run_inline(Box::new(move || tx.send(()).unwrap()));
        assert_eq!(rx.try_recv(), Ok(()));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
