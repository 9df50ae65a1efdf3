//! Client endpoint: one pipeline connected to one server.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::time::Duration;

use framelink_pool::{Job, JobPriority};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;

use crate::bundle::BundleManager;
use crate::codec::CipherKeys;
use crate::error::NetError;
use crate::events::{self, Event, EventCallback};
use crate::pipeline::{
    build_pipeline_pool, configure_socket, ConnectionRequest, ConnectionResponse, FrameHandler,
    Pipeline,
};
use crate::types::{ConnectCondition, DataMode, FieldReader};

/// A connecting endpoint. Dropping the client tears the connection down.
///
/// Lifecycle: construct with an id and an event callback, `register_key`,
/// `start`, then either `wait_stop` from the owning thread (with `stop`
/// called from anywhere, including event callbacks) or `stop` directly from
/// a thread that is not running callbacks.
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    pipeline: Arc<Pipeline>,
    bundles: Arc<BundleManager>,
    registered_key: Mutex<String>,
    server_id: Mutex<String>,
    worker_counts: (u16, u16, u16),
    runtime: Mutex<Option<Runtime>>,
    stop_signal: Mutex<Option<mpsc::Sender<()>>>,
    teardown_gate: Mutex<()>,
    events: EventCallback,
}

impl Client {
    /// Create a client with the default 3/3/3 worker configuration.
    pub fn new(id: &str, events: EventCallback) -> Self {
        Client::with_workers(id, events, 3, 3, 3)
    }

    /// Create a client with explicit per-class worker counts for the
    /// pipeline pool.
    pub fn with_workers(id: &str, events: EventCallback, high: u16, normal: u16, low: u16) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let handler: Weak<dyn FrameHandler> = weak.clone();
            let pipeline = Arc::new(Pipeline::new(handler));
            pipeline.set_id(id);
            ClientInner {
                pipeline,
                bundles: Arc::new(BundleManager::new()),
                registered_key: Mutex::new(String::new()),
                server_id: Mutex::new(String::new()),
                worker_counts: (high, normal, low),
                runtime: Mutex::new(None),
                stop_signal: Mutex::new(None),
                teardown_gate: Mutex::new(()),
                events,
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.bundles.set_callback(Arc::new(move |failures, successes| {
            if let Some(client) = weak.upgrade() {
                client.emit_files(failures, successes);
            }
        }));

        Client { inner }
    }

    /// The shared key presented during the handshake; must match the
    /// server's registered key.
    pub fn register_key(&self, key: &str) {
        *self.inner.registered_key.lock() = key.to_string();
    }

    pub fn set_start_code(&self, code: [u8; 4]) {
        self.inner.pipeline.set_start_code(code);
    }

    pub fn set_end_code(&self, code: [u8; 4]) {
        self.inner.pipeline.set_end_code(code);
    }

    pub fn id(&self) -> String {
        self.inner.pipeline.id()
    }

    /// The server-issued session GUID; empty until the handshake completes.
    pub fn sub_id(&self) -> String {
        self.inner.pipeline.sub_id()
    }

    /// The server's id, absorbed from the handshake response.
    pub fn server_id(&self) -> String {
        self.inner.server_id.lock().clone()
    }

    pub fn condition(&self) -> ConnectCondition {
        self.inner.pipeline.condition()
    }

    /// Connect, start the read driver, and request the connection. The
    /// condition moves to `Waiting`; `Confirmed` arrives with the server's
    /// response through the event callback.
    pub fn start(&self, ip: &str, port: u16, buffer_size: usize) -> Result<(), NetError> {
        let inner = &self.inner;
        inner.teardown();
        inner.pipeline.reset_for_start();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("io:{}", inner.pipeline.id()))
            .enable_all()
            .build()?;

        let stream = runtime.block_on(TcpStream::connect((ip, port)))?;
        configure_socket(&stream, buffer_size)?;
        let (read_half, write_half) = stream.into_split();

        let pool = build_pipeline_pool(&inner.pipeline.id(), inner.worker_counts);
        pool.add_worker(&[JobPriority::LongTerm]);
        pool.start()?;

        inner
            .pipeline
            .attach(runtime.handle().clone(), write_half, pool.clone(), buffer_size);
        inner.bundles.set_pool(Some(pool.clone()));
        inner.pipeline.set_condition(ConnectCondition::Waiting, false);

        // The I/O driver: the read loop runs to completion on the LongTerm
        // worker, with the runtime's own thread driving the reactor.
        let pipeline = inner.pipeline.clone();
        let handle = runtime.handle().clone();
        let wired = pool
            .push(Job::new(JobPriority::LongTerm, "client_io_driver", move || {
                handle.block_on(pipeline.read_loop(read_half));
                Ok(())
            }))
            .map_err(NetError::from)
            .and_then(|()| inner.request_connection());

        // The runtime must be registered before any teardown so the driver
        // is cancelled and joined ahead of the runtime going away.
        *inner.runtime.lock() = Some(runtime);
        if let Err(err) = wired {
            inner.teardown();
            return Err(err);
        }
        Ok(())
    }

    pub fn send_message(&self, message: &str) -> Result<(), NetError> {
        self.inner.pipeline.send_message(message)
    }

    pub fn send_binary(&self, data: &[u8], message: &str) -> Result<(), NetError> {
        self.inner.pipeline.send_binary(data, message)
    }

    /// Send a bundle of files. Each entry pairs a local path with a message
    /// delivered alongside the file.
    pub fn send_files(&self, files: &[(PathBuf, String)]) -> Result<(), NetError> {
        self.inner.pipeline.send_files(files)
    }

    /// Block until [`Client::stop`] fires (or the timeout elapses;
    /// `seconds = 0` waits forever), then tear down.
    pub fn wait_stop(&self, seconds: u64) {
        if self.inner.runtime.lock().is_none() {
            return;
        }
        let receiver = {
            let (sender, receiver) = mpsc::channel();
            *self.inner.stop_signal.lock() = Some(sender);
            receiver
        };
        if seconds == 0 {
            receiver.recv().ok();
        } else {
            receiver.recv_timeout(Duration::from_secs(seconds)).ok();
        }
        self.inner.stop_signal.lock().take();
        self.inner.teardown();
    }

    /// Expire the connection. If a [`Client::wait_stop`] is armed this only
    /// signals it and the waiting thread performs the teardown; otherwise
    /// teardown runs on a detached thread. Either way `stop` is safe to call
    /// from inside event callbacks, whose worker cannot join its own pool.
    pub fn stop(&self) {
        if self.inner.runtime.lock().is_none() {
            return;
        }
        tracing::debug!("attempt to stop client `{}`", self.inner.pipeline.id());
        self.inner
            .pipeline
            .set_condition(ConnectCondition::Expired, true);
        let sender = self.inner.stop_signal.lock().take();
        if let Some(sender) = sender {
            sender.send(()).ok();
            return;
        }
        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || inner.teardown());
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl ClientInner {
    fn request_connection(&self) -> Result<(), NetError> {
        let request = ConnectionRequest {
            id: self.pipeline.id(),
            sub_id: self.pipeline.sub_id(),
            registered_key: self.registered_key.lock().clone(),
            condition: true,
        };
        let body = serde_json::to_vec(&request)?;
        self.pipeline.send(DataMode::Connection, &body)
    }

    fn received_connection(&self, data: Vec<u8>) -> Result<(), NetError> {
        if self.pipeline.condition() != ConnectCondition::Waiting {
            return Err(NetError::Handshake(
                "the line is not waiting for a connection response".to_string(),
            ));
        }

        let response: ConnectionResponse = serde_json::from_slice(&data)?;
        *self.server_id.lock() = response.id.clone();
        self.pipeline.set_sub_id(&response.sub_id);

        if let (Some(key), Some(iv)) = (response.key.clone(), response.iv.clone()) {
            if !key.is_empty() && !iv.is_empty() {
                self.pipeline.set_keys(CipherKeys { key, iv });
            }
        }
        if let Some(mode) = response.encrypt_mode {
            self.pipeline.set_encrypt_mode(mode);
        }
        tracing::debug!("received connection response from `{}`", response.id);

        if !response.condition {
            // Refused: the Expired transition fires the single
            // Connection(false, by_itself: true) notification.
            self.pipeline.set_condition(ConnectCondition::Expired, true);
            return Err(NetError::Handshake(
                "connection has expired by server".to_string(),
            ));
        }

        self.pipeline.set_condition(ConnectCondition::Confirmed, false);
        self.push_connection_event(true, true);
        Ok(())
    }

    /// Deliver a connection event from a `Normal` job, the same hop every
    /// other dispatch takes; inline only when the pool is already gone.
    fn push_connection_event(&self, condition: bool, by_itself: bool) {
        let event = Event::Connection {
            id: self.server_id.lock().clone(),
            sub_id: self.pipeline.sub_id(),
            condition,
            by_itself,
        };
        if let Ok(pool) = self.pipeline.pool() {
            let events = self.events.clone();
            let queued_event = event.clone();
            if pool
                .push(Job::new(JobPriority::Normal, "connection_job", move || {
                    events::emit(&events, queued_event);
                    Ok(())
                }))
                .is_ok()
            {
                return;
            }
        }
        events::emit(&self.events, event);
    }

    fn emit_files(&self, failures: Vec<String>, successes: Vec<(String, PathBuf)>) {
        events::emit(
            &self.events,
            Event::Files {
                id: self.server_id.lock().clone(),
                sub_id: self.pipeline.sub_id(),
                failures,
                successes,
            },
        );
    }

    /// Full teardown, serialized: `stop`'s detached thread, `wait_stop`, and
    /// `Drop` may all get here, and the runtime must only go away after the
    /// pool (with its in-flight socket writes) has been joined.
    fn teardown(&self) {
        let _gate = self.teardown_gate.lock();
        self.bundles.set_pool(None);
        self.pipeline.shutdown();
        if let Some(runtime) = self.runtime.lock().take() {
            drop(runtime);
        }
    }
}

impl FrameHandler for ClientInner {
    fn disconnected(&self, by_itself: bool) {
        self.push_connection_event(false, by_itself);
    }

    fn received_data(&self, mode: DataMode, data: Vec<u8>) -> Result<(), NetError> {
        match mode {
            DataMode::Connection => self.received_connection(data),
            DataMode::Binary => {
                self.pipeline.expect_confirmed_receive("handle binary data")?;
                let mut reader = FieldReader::new(&data);
                let message = reader.next_string()?;
                let binary = reader.next_field()?.to_vec();
                if binary.is_empty() {
                    return Err(NetError::Malformed("empty binary body"));
                }
                events::emit(
                    &self.events,
                    Event::Binary {
                        id: self.server_id.lock().clone(),
                        sub_id: self.pipeline.sub_id(),
                        message,
                        data: binary,
                    },
                );
                Ok(())
            }
            DataMode::Message => {
                self.pipeline.expect_confirmed_receive("handle message data")?;
                let message = String::from_utf8(data)
                    .map_err(|_| NetError::Malformed("message is not UTF-8"))?;
                events::emit(
                    &self.events,
                    Event::Message {
                        id: self.server_id.lock().clone(),
                        sub_id: self.pipeline.sub_id(),
                        message,
                    },
                );
                Ok(())
            }
            DataMode::File => {
                self.pipeline.expect_confirmed_receive("handle file data")?;
                let id = self.server_id.lock().clone();
                let sub_id = self.pipeline.sub_id();
                self.pipeline
                    .handle_file_payload(&data, &self.bundles, |message, path| {
                        events::emit(
                            &self.events,
                            Event::File {
                                id: id.clone(),
                                sub_id: sub_id.clone(),
                                message: message.to_string(),
                                path: path.to_path_buf(),
                            },
                        );
                    })
            }
        }
    }
}
