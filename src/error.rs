use std::{fmt, sync::Arc};

/// The rejection carried by a failed promise.
///
/// Every subscriber of a promise sees the same rejection, so the underlying
/// error is shared behind an `Arc` and `Error` is cheap to clone.
#[derive(Clone, thiserror::Error)]
#[error(transparent)]
pub struct Error(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl Error {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Rejection with a plain message and no further source.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(Arc::new(Message(message.into())))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    pub fn is<E>(&self) -> bool
    where
        E: std::error::Error + 'static,
    {
        self.0.is::<E>()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl From<Box<dyn std::error::Error + Send + Sync + 'static>> for Error {
    fn from(error: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        Self(Arc::from(error))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

/// A `then`-family transform panicked instead of returning.
#[derive(Debug, thiserror::Error)]
#[error("transform panicked: {message}")]
pub struct TransformPanicked {
    pub message: String,
}

/// Failure to bring up a dispatch worker.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to spawn dispatch worker `{label}`")]
    Spawn {
        label: String,
        #[source]
        source: std::io::Error,
    },
}
