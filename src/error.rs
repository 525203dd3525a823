use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the cache layer.
///
/// Cache-layer errors are never thrown into a live subscriber stream; they
/// are returned from one-shot operations (`call`, errorable `enqueue`) as a
/// rejected future for the caller to handle.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection-level failure that took down a whole request batch.
    #[error("transport failure: {info}")]
    Transport { info: Value },
    /// Per-request error returned by the server for an errorable request.
    #[error("request failed: {info}")]
    Request { info: Value },
    /// The pending request was dropped without ever being resolved, e.g.
    /// after a transport failure for a non-errorable caller.
    #[error("request abandoned before a response arrived")]
    Abandoned,
}

impl ClientError {
    pub fn transport(info: impl Into<Value>) -> Self {
        Self::Transport { info: info.into() }
    }

    pub fn request(info: impl Into<Value>) -> Self {
        Self::Request { info: info.into() }
    }

    /// True for connection-level failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}
