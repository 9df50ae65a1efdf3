//! One end of one TCP connection: condition state, codec configuration,
//! session key material, the job pool that runs every transform stage, and
//! the read/write drivers.
//!
//! Outbound, each frame walks `encrypt (Normal, skipped for Connection mode)
//! → compress (High) → framed socket write (Top)`. Inbound, the read loop
//! hands every completed frame to `decompress (Low) → decrypt (Normal, only
//! when encryption is on) → dispatch (High)`. Exactly one `Top` worker per
//! pipeline serializes socket writes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use framelink_pool::{Job, JobPriority, Pool};
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bundle::BundleManager;
use crate::codec::{self, CipherKeys, FrameCodes};
use crate::error::NetError;
use crate::types::{append_field, ConnectCondition, DataMode, FieldReader, FileMode};

/// The polymorphic seam between the pipeline and its endpoint. The client and
/// the server session are the two implementations.
pub(crate) trait FrameHandler: Send + Sync {
    /// Fired exactly once, when the pipeline enters `Expired`.
    fn disconnected(&self, by_itself: bool);
    /// A fully decoded inner payload, in wire arrival order per mode class.
    fn received_data(&self, mode: DataMode, data: Vec<u8>) -> Result<(), NetError>;
}

type SharedWriter = Arc<AsyncMutex<OwnedWriteHalf>>;

pub(crate) struct Pipeline {
    id: Mutex<String>,
    sub_id: Mutex<String>,
    condition: Mutex<ConnectCondition>,
    codes: Mutex<FrameCodes>,
    buffer_size: AtomicUsize,
    encrypt_mode: AtomicBool,
    keys: Mutex<Option<CipherKeys>>,
    pool: Mutex<Option<Arc<Pool>>>,
    writer: Mutex<Option<SharedWriter>>,
    handle: Mutex<Option<Handle>>,
    cancel: Mutex<CancellationToken>,
    handler: Mutex<Weak<dyn FrameHandler>>,
}

impl Pipeline {
    pub(crate) fn new(handler: Weak<dyn FrameHandler>) -> Self {
        Pipeline {
            id: Mutex::new(String::new()),
            sub_id: Mutex::new(String::new()),
            condition: Mutex::new(ConnectCondition::None),
            codes: Mutex::new(FrameCodes::default()),
            buffer_size: AtomicUsize::new(1024),
            encrypt_mode: AtomicBool::new(false),
            keys: Mutex::new(None),
            pool: Mutex::new(None),
            writer: Mutex::new(None),
            handle: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            handler: Mutex::new(handler),
        }
    }

    // ── Identity ──

    pub(crate) fn id(&self) -> String {
        self.id.lock().clone()
    }

    pub(crate) fn set_id(&self, id: &str) {
        *self.id.lock() = id.to_string();
        if let Some(pool) = self.pool.lock().clone() {
            pool.thread_title(id);
        }
    }

    pub(crate) fn sub_id(&self) -> String {
        self.sub_id.lock().clone()
    }

    pub(crate) fn set_sub_id(&self, sub_id: &str) {
        *self.sub_id.lock() = sub_id.to_string();
    }

    // ── Codec configuration ──

    pub(crate) fn frame_codes(&self) -> FrameCodes {
        *self.codes.lock()
    }

    pub(crate) fn set_start_code(&self, code: [u8; 4]) {
        self.codes.lock().start = code;
    }

    pub(crate) fn set_end_code(&self, code: [u8; 4]) {
        self.codes.lock().end = code;
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::Relaxed)
    }

    pub(crate) fn encrypt_mode(&self) -> bool {
        self.encrypt_mode.load(Ordering::Relaxed)
    }

    pub(crate) fn set_encrypt_mode(&self, on: bool) {
        self.encrypt_mode.store(on, Ordering::Relaxed);
    }

    pub(crate) fn keys(&self) -> Option<CipherKeys> {
        self.keys.lock().clone()
    }

    pub(crate) fn set_keys(&self, keys: CipherKeys) {
        *self.keys.lock() = Some(keys);
    }

    pub(crate) fn clear_keys(&self) {
        *self.keys.lock() = None;
    }

    // ── Condition ──

    pub(crate) fn condition(&self) -> ConnectCondition {
        *self.condition.lock()
    }

    /// Advance the connection condition. Transitions are forward-only; a
    /// repeat or regression request is ignored, so `Expired` fires its single
    /// `disconnected` notification exactly once.
    pub(crate) fn set_condition(&self, next: ConnectCondition, by_itself: bool) {
        let expired = {
            let mut condition = self.condition.lock();
            if next <= *condition {
                return;
            }
            *condition = next;
            next == ConnectCondition::Expired
        };
        tracing::debug!("connection condition on `{}`: {next:?}", self.id());
        if expired {
            self.clear_keys();
            if let Some(handler) = self.handler.lock().upgrade() {
                handler.disconnected(by_itself);
            }
        }
    }

    /// Rewind to a fresh pipeline for a new `start()` on a reused endpoint.
    pub(crate) fn reset_for_start(&self) {
        *self.condition.lock() = ConnectCondition::None;
        *self.keys.lock() = None;
        self.encrypt_mode.store(false, Ordering::Relaxed);
        *self.cancel.lock() = CancellationToken::new();
    }

    fn ensure_live(&self) -> Result<(), NetError> {
        if self.condition() == ConnectCondition::Expired {
            return Err(NetError::Expired);
        }
        Ok(())
    }

    fn ensure_confirmed(&self, op: &'static str) -> Result<(), NetError> {
        if self.condition() != ConnectCondition::Confirmed {
            return Err(NetError::NotConfirmed(op, self.id()));
        }
        Ok(())
    }

    /// Receive-side confirmation guard: a data frame on an unconfirmed line
    /// is a protocol violation and expires the pipeline.
    pub(crate) fn expect_confirmed_receive(&self, what: &'static str) -> Result<(), NetError> {
        if self.condition() != ConnectCondition::Confirmed {
            self.set_condition(ConnectCondition::Expired, false);
            return Err(NetError::NotConfirmed(what, self.id()));
        }
        Ok(())
    }

    // ── Wiring ──

    pub(crate) fn attach(
        &self,
        handle: Handle,
        writer: OwnedWriteHalf,
        pool: Arc<Pool>,
        buffer_size: usize,
    ) {
        *self.handle.lock() = Some(handle);
        *self.writer.lock() = Some(Arc::new(AsyncMutex::new(writer)));
        *self.pool.lock() = Some(pool);
        self.buffer_size.store(buffer_size.max(1), Ordering::Relaxed);
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    pub(crate) fn pool(&self) -> Result<Arc<Pool>, NetError> {
        self.pool.lock().clone().ok_or(NetError::NoPool)
    }

    /// Cancel the read driver, drain and stop the pool (flushing queued
    /// writes), then release the socket. Safe to call more than once; must
    /// not be called from one of this pipeline's own workers.
    pub(crate) fn shutdown(&self) {
        self.cancel.lock().cancel();
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.lock(true);
            pool.stop(true);
        }
        *self.writer.lock() = None;
        *self.handle.lock() = None;
    }

    // ── Send path ──

    pub(crate) fn send_message(self: &Arc<Self>, message: &str) -> Result<(), NetError> {
        self.ensure_confirmed("send a message")?;
        self.send(DataMode::Message, message.as_bytes())
    }

    pub(crate) fn send_binary(self: &Arc<Self>, data: &[u8], message: &str) -> Result<(), NetError> {
        self.ensure_confirmed("send binary data")?;
        let mut body = Vec::with_capacity(data.len() + message.len() + 32);
        append_field(&mut body, message.as_bytes());
        append_field(&mut body, data);
        self.send(DataMode::Binary, &body)
    }

    /// Announce a bundle with a `File/Start` frame, then queue one `Low` job
    /// per file that reads it and sends a Success or Failure frame.
    pub(crate) fn send_files(self: &Arc<Self>, files: &[(PathBuf, String)]) -> Result<(), NetError> {
        self.ensure_confirmed("send files")?;

        let guid = Uuid::new_v4().to_string();
        let mut start = Vec::new();
        append_field(&mut start, guid.as_bytes());
        append_field(&mut start, &[FileMode::Start as u8]);
        append_field(&mut start, &(files.len() as u64).to_le_bytes());
        self.send(DataMode::File, &start)?;

        let pool = self.pool()?;
        for (index, (path, message)) in files.iter().enumerate() {
            let this = Arc::clone(self);
            let guid = guid.clone();
            let path = path.clone();
            let message = message.clone();
            pool.push(Job::new(
                JobPriority::Low,
                format!("file_sending_job:{index}"),
                move || {
                    this.file_sending_job(&guid, index as u64, &path, &message)
                        .map_err(Into::into)
                },
            ))?;
        }
        Ok(())
    }

    fn file_sending_job(
        self: &Arc<Self>,
        guid: &str,
        index: u64,
        path: &Path,
        message: &str,
    ) -> Result<(), NetError> {
        let mut body = Vec::new();
        append_field(&mut body, guid.as_bytes());
        match std::fs::read(path) {
            Ok(bytes) => {
                append_field(&mut body, &[FileMode::Success as u8]);
                append_field(&mut body, &index.to_le_bytes());
                append_field(&mut body, message.as_bytes());
                append_field(&mut body, &bytes);
            }
            Err(err) => {
                tracing::error!("cannot read `{}` for sending: {err}", path.display());
                append_field(&mut body, &[FileMode::Failure as u8]);
                append_field(&mut body, &index.to_le_bytes());
                append_field(&mut body, message.as_bytes());
            }
        }
        self.send(DataMode::File, &body)
    }

    /// Queue `tlv(mode) || tlv(data)` into the outbound transform chain.
    pub(crate) fn send(self: &Arc<Self>, mode: DataMode, data: &[u8]) -> Result<(), NetError> {
        if self.writer.lock().is_none() {
            return Err(NetError::NoSocket);
        }
        if data.is_empty() {
            return Err(NetError::EmptyPayload);
        }
        let pool = self.pool()?;

        let mut inner = Vec::with_capacity(data.len() + 32);
        append_field(&mut inner, &[mode as u8]);
        append_field(&mut inner, data);

        let this = Arc::clone(self);
        if self.encrypt_mode() && mode != DataMode::Connection {
            pool.push(Job::with_payload(
                JobPriority::Normal,
                "encrypt_message",
                inner,
                move |bytes| this.encrypt_stage(bytes).map_err(Into::into),
            ))?;
        } else {
            pool.push(Job::with_payload(
                JobPriority::High,
                "compress_message",
                inner,
                move |bytes| this.compress_stage(bytes).map_err(Into::into),
            ))?;
        }
        Ok(())
    }

    /// Transform and write one frame on the calling thread, bypassing the job
    /// chain. Used for the handshake rejection response, which must reach the
    /// wire before the pipeline expires and the chain starts refusing work.
    pub(crate) fn send_now(&self, mode: DataMode, data: &[u8]) -> Result<(), NetError> {
        if data.is_empty() {
            return Err(NetError::EmptyPayload);
        }
        let mut inner = Vec::with_capacity(data.len() + 32);
        append_field(&mut inner, &[mode as u8]);
        append_field(&mut inner, data);
        self.write_stage(codec::compress(&inner))
    }

    fn encrypt_stage(self: &Arc<Self>, data: Vec<u8>) -> Result<(), NetError> {
        self.ensure_live()?;
        let out = match self.keys() {
            Some(keys) => match codec::encrypt(&data, &keys) {
                Ok(sealed) => sealed,
                Err(err) => {
                    tracing::warn!("encryption failed, forwarding raw bytes: {err}");
                    data
                }
            },
            None => data,
        };
        let pool = self.pool()?;
        let this = Arc::clone(self);
        pool.push(Job::with_payload(
            JobPriority::High,
            "compress_message",
            out,
            move |bytes| this.compress_stage(bytes).map_err(Into::into),
        ))?;
        Ok(())
    }

    fn compress_stage(self: &Arc<Self>, data: Vec<u8>) -> Result<(), NetError> {
        self.ensure_live()?;
        let out = codec::compress(&data);
        let pool = self.pool()?;
        let this = Arc::clone(self);
        pool.push(Job::with_payload(
            JobPriority::Top,
            "sending_job",
            out,
            move |bytes| this.write_stage(bytes).map_err(Into::into),
        ))?;
        Ok(())
    }

    fn write_stage(&self, data: Vec<u8>) -> Result<(), NetError> {
        self.ensure_live()?;
        let writer = self.writer.lock().clone().ok_or(NetError::NoSocket)?;
        let handle = self.handle.lock().clone().ok_or(NetError::NoSocket)?;
        let codes = self.frame_codes();
        let buffer_size = self.buffer_size();
        handle.block_on(async move {
            let mut writer = writer.lock().await;
            codec::write_frame(&mut *writer, &codes, &data, buffer_size).await
        })?;
        Ok(())
    }

    // ── Receive path ──

    /// Drive the framing state machine until cancellation, an I/O error, or
    /// EOF. Any socket failure expires the pipeline exactly once with
    /// `by_itself = false`.
    pub(crate) async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let cancel = self.cancel_token();
        loop {
            if self.condition() == ConnectCondition::Expired {
                return;
            }
            let codes = self.frame_codes();
            let buffer_size = self.buffer_size();
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = codec::read_frame(&mut reader, &codes, buffer_size) => result,
            };
            match result {
                Ok(payload) => {
                    if let Err(err) = self.receive(payload) {
                        tracing::warn!("cannot queue received frame: {err}");
                    }
                }
                Err(err) => {
                    tracing::debug!("expired connection: {err}");
                    // Frames read before the failure may still be in flight
                    // through the pool (a handshake refusal is the last frame
                    // a refused peer ever gets); let them dispatch before the
                    // expiry starts dropping work.
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    self.set_condition(ConnectCondition::Expired, false);
                    return;
                }
            }
        }
    }

    fn receive(self: &Arc<Self>, payload: Vec<u8>) -> Result<(), NetError> {
        let pool = self.pool()?;
        let this = Arc::clone(self);
        pool.push(Job::with_payload(
            JobPriority::Low,
            "decompress_message",
            payload,
            move |bytes| this.decompress_stage(bytes).map_err(Into::into),
        ))?;
        Ok(())
    }

    fn decompress_stage(self: &Arc<Self>, data: Vec<u8>) -> Result<(), NetError> {
        self.ensure_live()?;
        let out = codec::decompress(&data);
        let pool = self.pool()?;
        let this = Arc::clone(self);
        if self.encrypt_mode() {
            pool.push(Job::with_payload(
                JobPriority::Normal,
                "decrypt_message",
                out,
                move |bytes| this.decrypt_stage(bytes).map_err(Into::into),
            ))?;
        } else {
            pool.push(Job::with_payload(
                JobPriority::High,
                "received_data",
                out,
                move |bytes| this.dispatch_stage(bytes).map_err(Into::into),
            ))?;
        }
        Ok(())
    }

    fn decrypt_stage(self: &Arc<Self>, data: Vec<u8>) -> Result<(), NetError> {
        self.ensure_live()?;
        // Frames that fail to decrypt are treated as clear; that is how
        // unencrypted Connection frames pass while encryption is on.
        let out = match self.keys() {
            Some(keys) => codec::decrypt(&data, &keys).unwrap_or(data),
            None => data,
        };
        let pool = self.pool()?;
        let this = Arc::clone(self);
        pool.push(Job::with_payload(
            JobPriority::High,
            "received_data",
            out,
            move |bytes| this.dispatch_stage(bytes).map_err(Into::into),
        ))?;
        Ok(())
    }

    fn dispatch_stage(self: &Arc<Self>, data: Vec<u8>) -> Result<(), NetError> {
        self.ensure_live()?;
        let mut reader = FieldReader::new(&data);
        let mode = DataMode::from_byte(reader.next_byte()?)
            .ok_or(NetError::Malformed("unknown data mode"))?;
        let body = reader.next_field()?.to_vec();
        if body.is_empty() {
            return Err(NetError::Malformed("empty payload body"));
        }
        let handler = self.handler.lock().upgrade().ok_or(NetError::Expired)?;
        handler.received_data(mode, body)
    }

    // ── File payloads ──

    /// Decode one `File` frame and route it into the bundle manager.
    /// `on_file` fires for every file persisted to its temp path, before the
    /// bundle accounting that may complete the aggregate.
    pub(crate) fn handle_file_payload(
        &self,
        data: &[u8],
        bundles: &BundleManager,
        on_file: impl Fn(&str, &Path),
    ) -> Result<(), NetError> {
        let mut reader = FieldReader::new(data);
        let guid = reader.next_string()?;
        let mode = FileMode::from_byte(reader.next_byte()?)
            .ok_or(NetError::Malformed("unknown file mode"))?;
        let number = reader.next_u64()?;

        match mode {
            FileMode::Start => {
                tracing::debug!("start receiving files [{guid}]: {number} files");
                bundles.start(&guid, number)
            }
            FileMode::Failure => {
                let message = reader.next_string()?;
                tracing::error!("cannot complete file receiving [{guid}]: index[{number}] => {message}");
                bundles.failure(&guid, &message)
            }
            FileMode::Success => {
                let message = reader.next_string()?;
                let file_bytes = reader.next_field()?;
                match self.save_temp_file(file_bytes) {
                    Some(path) => {
                        tracing::debug!(
                            "completed file receiving [{guid}]: index[{number}] => {message}"
                        );
                        on_file(&message, &path);
                        bundles.success(&guid, &message, path)
                    }
                    None => bundles.failure(&guid, &message),
                }
            }
        }
    }

    /// Persist received file bytes under a random name in the OS temp
    /// directory. The file is not cleaned up; the path goes to the user.
    pub(crate) fn save_temp_file(&self, data: &[u8]) -> Option<PathBuf> {
        let path = std::env::temp_dir().join(Uuid::new_v4().to_string());
        match std::fs::write(&path, data) {
            Ok(()) => Some(path),
            Err(err) => {
                tracing::error!("cannot write temp file `{}`: {err}", path.display());
                None
            }
        }
    }
}

// ─── Shared endpoint plumbing ─────────────────────────────────

/// The worker topology every pipeline pool shares: one `Top` writer, then
/// dedicated `High` workers, `Normal` workers that fall back to `High`, and
/// `Low` workers that fall back to both. The client adds its `LongTerm`
/// driver worker on top of this.
pub(crate) fn build_pipeline_pool(title: &str, (high, normal, low): (u16, u16, u16)) -> Arc<Pool> {
    let pool = Arc::new(Pool::new(title));
    pool.add_worker(&[JobPriority::Top]);
    for _ in 0..high {
        pool.add_worker(&[JobPriority::High]);
    }
    for _ in 0..normal {
        pool.add_worker(&[JobPriority::Normal, JobPriority::High]);
    }
    for _ in 0..low {
        pool.add_worker(&[JobPriority::Low, JobPriority::High, JobPriority::Normal]);
    }
    pool
}

/// Socket options shared by both ends: no Nagle, keep-alive, and kernel
/// buffers matched to the configured chunk size.
pub(crate) fn configure_socket(
    stream: &tokio::net::TcpStream,
    buffer_size: usize,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_recv_buffer_size(buffer_size)?;
    sock.set_send_buffer_size(buffer_size)?;
    Ok(())
}

// ─── Handshake documents ──────────────────────────────────────

/// Client → server, sent as a `Connection` frame immediately after connect.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct ConnectionRequest {
    pub id: String,
    pub sub_id: String,
    pub registered_key: String,
    pub condition: bool,
}

/// Server → client. Key material is present only when the server runs with
/// encryption enabled; the response itself always travels in clear because
/// the client has nothing to decrypt with yet.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct ConnectionResponse {
    pub id: String,
    pub sub_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypt_mode: Option<bool>,
    pub condition: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        disconnects: AtomicUsize,
        last_by_itself: AtomicBool,
    }

    impl FrameHandler for CountingHandler {
        fn disconnected(&self, by_itself: bool) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.last_by_itself.store(by_itself, Ordering::SeqCst);
        }

        fn received_data(&self, _mode: DataMode, _data: Vec<u8>) -> Result<(), NetError> {
            Ok(())
        }
    }

    fn counting_pipeline() -> (Arc<CountingHandler>, Pipeline) {
        let handler = Arc::new(CountingHandler {
            disconnects: AtomicUsize::new(0),
            last_by_itself: AtomicBool::new(false),
        });
        let weak: Weak<CountingHandler> = Arc::downgrade(&handler);
        (handler.clone(), Pipeline::new(weak))
    }

    #[test]
    fn condition_is_monotonic_and_expires_once() {
        let (handler, pipeline) = counting_pipeline();

        pipeline.set_condition(ConnectCondition::Waiting, false);
        pipeline.set_condition(ConnectCondition::Confirmed, false);
        assert_eq!(pipeline.condition(), ConnectCondition::Confirmed);

        // Regression requests are ignored.
        pipeline.set_condition(ConnectCondition::Waiting, false);
        assert_eq!(pipeline.condition(), ConnectCondition::Confirmed);

        pipeline.set_condition(ConnectCondition::Expired, true);
        pipeline.set_condition(ConnectCondition::Expired, false);
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
        assert!(handler.last_by_itself.load(Ordering::SeqCst));
    }

    #[test]
    fn unconfirmed_receive_expires_the_pipeline() {
        let (handler, pipeline) = counting_pipeline();
        pipeline.set_condition(ConnectCondition::Waiting, false);

        let err = pipeline.expect_confirmed_receive("handle a message").unwrap_err();
        assert!(matches!(err, NetError::NotConfirmed(..)));
        assert_eq!(pipeline.condition(), ConnectCondition::Expired);
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
        assert!(!handler.last_by_itself.load(Ordering::SeqCst));
    }

    #[test]
    fn expiring_clears_key_material() {
        let (_handler, pipeline) = counting_pipeline();
        pipeline.set_keys(codec::generate_keys());
        pipeline.set_condition(ConnectCondition::Expired, true);
        assert!(pipeline.keys().is_none());
    }

    #[test]
    fn temp_files_round_trip() {
        let (_handler, pipeline) = counting_pipeline();
        let path = pipeline.save_temp_file(b"file body").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"file body");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn file_payloads_route_into_bundles() {
        let (_handler, pipeline) = counting_pipeline();
        let bundles = BundleManager::new();
        let fired = Arc::new(Mutex::new(Vec::<(Vec<String>, usize)>::new()));
        {
            let fired = fired.clone();
            bundles.set_callback(Arc::new(move |failures, successes| {
                fired.lock().push((failures, successes.len()));
            }));
        }

        let mut start = Vec::new();
        append_field(&mut start, b"guid-1");
        append_field(&mut start, &[FileMode::Start as u8]);
        append_field(&mut start, &2u64.to_le_bytes());
        pipeline
            .handle_file_payload(&start, &bundles, |_, _| {})
            .unwrap();

        let mut failure = Vec::new();
        append_field(&mut failure, b"guid-1");
        append_field(&mut failure, &[FileMode::Failure as u8]);
        append_field(&mut failure, &0u64.to_le_bytes());
        append_field(&mut failure, b"could not read");
        pipeline
            .handle_file_payload(&failure, &bundles, |_, _| {})
            .unwrap();

        let mut success = Vec::new();
        append_field(&mut success, b"guid-1");
        append_field(&mut success, &[FileMode::Success as u8]);
        append_field(&mut success, &1u64.to_le_bytes());
        append_field(&mut success, b"second file");
        append_field(&mut success, b"contents");

        let seen = Arc::new(Mutex::new(Vec::<PathBuf>::new()));
        {
            let seen = seen.clone();
            pipeline
                .handle_file_payload(&success, &bundles, |message, path| {
                    assert_eq!(message, "second file");
                    seen.lock().push(path.to_path_buf());
                })
                .unwrap();
        }

        let fired = fired.lock();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, vec!["could not read".to_string()]);
        assert_eq!(fired[0].1, 1);

        for path in seen.lock().drain(..) {
            std::fs::remove_file(path).ok();
        }
    }
}
