use thiserror::Error;

/// Errors surfaced by the public API. The engine never panics across the API
/// boundary; every fallible operation returns one of these.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("cannot {0} on `{1}`: connection is not confirmed")]
    NotConfirmed(&'static str, String),

    #[error("connection has expired")]
    Expired,

    #[error("cannot send empty data")]
    EmptyPayload,

    #[error("no live socket")]
    NoSocket,

    #[error("no job pool handle")]
    NoPool,

    #[error("malformed payload: {0}")]
    Malformed(&'static str),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error("duplicate bundle guid `{0}`")]
    DuplicateBundle(String),

    #[error("unknown bundle guid `{0}`")]
    UnknownBundle(String),

    #[error(transparent)]
    Pool(#[from] framelink_pool::PoolError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<NetError> for framelink_pool::JobError {
    fn from(err: NetError) -> Self {
        framelink_pool::JobError::new(err.to_string())
    }
}
