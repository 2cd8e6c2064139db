#![allow(dead_code)]

use deferred::{Dispatch, Error};
use std::{
    sync::mpsc::{channel, Receiver, Sender},
    time::Duration,
};

/// How long an expected callback may take to show up.
pub const TIMEOUT: Duration = Duration::from_millis(500);
/// How long to listen for a callback that must never come.
pub const QUIET: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
#[error("whatever")]
pub struct Dummy;

pub fn dummy_error() -> Error {
    Error::new(Dummy)
}

pub fn queue(label: &str) -> Dispatch {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
    Dispatch::serial(label).expect("failed to start test queue")
}

/// Parks `queue` until the returned sender is used or dropped.
pub fn hold(queue: &Dispatch) -> Sender<()> {
    let (release, parked) = channel::<()>();
    queue.execute(Box::new(move || {
        let _ = parked.recv();
    }));
    release
}

pub fn expect<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(TIMEOUT).expect("expected callback never ran")
}

pub fn expect_silence<T: std::fmt::Debug>(rx: &Receiver<T>) {
    if let Ok(value) = rx.recv_timeout(QUIET) {
        panic!("unexpected callback with {value:?}");
    }
}
