use std::path::PathBuf;
use std::sync::Arc;

/// Everything an endpoint reports to its user, as one tagged value delivered
/// through a single callback.
///
/// `id`/`sub_id` name the peer the event concerns: on the server they are the
/// originating session's identity, on the client they are the server's `id`
/// and the `sub_id` the server issued for this connection.
#[derive(Debug, Clone)]
pub enum Event {
    /// Connection condition changed. `condition` is true exactly when the
    /// link reached `Confirmed`; a false value with `by_itself = true` means
    /// the local side initiated (or was refused at) the close.
    Connection {
        id: String,
        sub_id: String,
        condition: bool,
        by_itself: bool,
    },
    Message {
        id: String,
        sub_id: String,
        message: String,
    },
    Binary {
        id: String,
        sub_id: String,
        message: String,
        data: Vec<u8>,
    },
    /// One received file persisted to a temp path. Cleanup of the file is the
    /// receiver's responsibility.
    File {
        id: String,
        sub_id: String,
        message: String,
        path: PathBuf,
    },
    /// Aggregate outcome of one file bundle; fires exactly once per bundle.
    Files {
        id: String,
        sub_id: String,
        failures: Vec<String>,
        successes: Vec<(String, PathBuf)>,
    },
}

/// User callback. Errors are logged and discarded; they never alter pipeline
/// state.
pub type EventCallback = Arc<dyn Fn(Event) -> anyhow::Result<()> + Send + Sync>;

pub(crate) fn emit(callback: &EventCallback, event: Event) {
    if let Err(err) = callback(event) {
        tracing::warn!("event callback failed: {err}");
    }
}
