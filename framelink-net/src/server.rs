//! Server acceptor: listens, spawns one session pipeline per accepted
//! socket, and fans sends out to sessions by `(id, sub_id)`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use framelink_pool::{Job, JobPriority, Pool};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::error::NetError;
use crate::events::{self, Event, EventCallback};
use crate::session::Session;
use crate::types::ConnectCondition;

/// A listening endpoint holding one session pipeline per connected client.
/// Dropping the server tears everything down.
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    id: String,
    registered_key: Mutex<String>,
    encrypt_mode: AtomicBool,
    worker_counts: (u16, u16, u16),
    buffer_size: AtomicUsize,
    events: EventCallback,
    start_code: Mutex<[u8; 4]>,
    end_code: Mutex<[u8; 4]>,
    runtime: Mutex<Option<Runtime>>,
    handle: Mutex<Option<tokio::runtime::Handle>>,
    pool: Mutex<Option<Arc<Pool>>>,
    sessions: Mutex<Vec<Session>>,
    cancel: Mutex<CancellationToken>,
    local_port: Mutex<Option<u16>>,
    stop_signal: Mutex<Option<mpsc::Sender<()>>>,
    teardown_gate: Mutex<()>,
}

impl Server {
    /// Create a server with the default 3/3/3 worker configuration for its
    /// session pipelines.
    pub fn new(id: &str, events: EventCallback) -> Self {
        Server::with_workers(id, events, 3, 3, 3)
    }

    pub fn with_workers(id: &str, events: EventCallback, high: u16, normal: u16, low: u16) -> Self {
        Server {
            inner: Arc::new(ServerInner {
                id: id.to_string(),
                registered_key: Mutex::new(String::new()),
                encrypt_mode: AtomicBool::new(false),
                worker_counts: (high, normal, low),
                buffer_size: AtomicUsize::new(1024),
                events,
                start_code: Mutex::new([0xFD; 4]),
                end_code: Mutex::new([0xFC; 4]),
                runtime: Mutex::new(None),
                handle: Mutex::new(None),
                pool: Mutex::new(None),
                sessions: Mutex::new(Vec::new()),
                cancel: Mutex::new(CancellationToken::new()),
                local_port: Mutex::new(None),
                stop_signal: Mutex::new(None),
                teardown_gate: Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> String {
        self.inner.id.clone()
    }

    /// The key every connecting client must present.
    pub fn register_key(&self, key: &str) {
        *self.inner.registered_key.lock() = key.to_string();
    }

    /// When enabled, each confirmed session is issued a fresh AES key/IV and
    /// all non-`Connection` traffic on it is encrypted.
    pub fn set_encrypt_mode(&self, on: bool) {
        self.inner.encrypt_mode.store(on, Ordering::Relaxed);
    }

    pub fn encrypt_mode(&self) -> bool {
        self.inner.encrypt_mode.load(Ordering::Relaxed)
    }

    /// Frame tetrads handed to every session accepted from now on. Both
    /// sides must agree.
    pub fn set_start_code(&self, code: [u8; 4]) {
        *self.inner.start_code.lock() = code;
    }

    pub fn set_end_code(&self, code: [u8; 4]) {
        *self.inner.end_code.lock() = code;
    }

    /// The bound port; useful when starting on port 0.
    pub fn local_port(&self) -> Option<u16> {
        *self.inner.local_port.lock()
    }

    pub fn working_session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Bind, start the acceptor pool (one worker per class High/Normal/Low/
    /// LongTerm), and run the accept loop as the `LongTerm` driver job.
    pub fn start(&self, port: u16, buffer_size: usize) -> Result<(), NetError> {
        let inner = &self.inner;
        inner.teardown();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("io:{}", inner.id))
            .enable_all()
            .build()?;

        let listener = runtime.block_on(TcpListener::bind(("0.0.0.0", port)))?;
        let bound_port = listener.local_addr()?.port();
        *inner.local_port.lock() = Some(bound_port);
        inner.buffer_size.store(buffer_size.max(1), Ordering::Relaxed);

        let cancel = CancellationToken::new();
        *inner.cancel.lock() = cancel.clone();

        let pool = Arc::new(Pool::new(format!("server:{}", inner.id)));
        pool.add_worker(&[JobPriority::High]);
        pool.add_worker(&[JobPriority::Normal]);
        pool.add_worker(&[JobPriority::Low]);
        pool.add_worker(&[JobPriority::LongTerm]);
        pool.start()?;

        let handle = runtime.handle().clone();
        *inner.handle.lock() = Some(handle.clone());

        let accept_inner = Arc::clone(inner);
        pool.push(Job::new(JobPriority::LongTerm, "server_io_driver", move || {
            handle.block_on(accept_loop(accept_inner, listener, cancel));
            Ok(())
        }))?;

        *inner.pool.lock() = Some(pool);
        *inner.runtime.lock() = Some(runtime);

        tracing::info!("server `{}` listening on port {bound_port}", inner.id);
        Ok(())
    }

    /// Send a message to the sessions addressed by `(id, sub_id)`. An empty
    /// `id` broadcasts to every session; an empty `sub_id` matches every
    /// session of that `id`. Returns the first failure.
    pub fn send_message(&self, message: &str, id: &str, sub_id: &str) -> Result<(), NetError> {
        self.inner
            .for_each_target(id, sub_id, |session| session.send_message(message))
    }

    pub fn send_binary(
        &self,
        data: &[u8],
        message: &str,
        id: &str,
        sub_id: &str,
    ) -> Result<(), NetError> {
        self.inner
            .for_each_target(id, sub_id, |session| session.send_binary(data, message))
    }

    pub fn send_files(
        &self,
        files: &[(PathBuf, String)],
        id: &str,
        sub_id: &str,
    ) -> Result<(), NetError> {
        self.inner
            .for_each_target(id, sub_id, |session| session.send_files(files))
    }

    /// Remove and stop the one session matching `(id, sub_id)`.
    pub fn drop_session(&self, id: &str, sub_id: &str) {
        self.inner
            .remove_sessions(|session| session.id() == id && session.sub_id() == sub_id);
    }

    /// Remove and stop every session of `id`.
    pub fn drop_sessions(&self, id: &str) {
        self.inner.remove_sessions(|session| session.id() == id);
    }

    /// Block until [`Server::stop`] fires (or the timeout elapses;
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

    /// Stop accepting and drop every session. If a [`Server::wait_stop`] is
    /// armed this only signals it and the waiting thread tears down;
    /// otherwise teardown runs on a detached thread, making `stop` safe to
    /// call from inside event callbacks.
    pub fn stop(&self) {
        if self.inner.runtime.lock().is_none() {
            return;
        }
        tracing::debug!("attempt to stop server `{}`", self.inner.id);
        let sender = self.inner.stop_signal.lock().take();
        if let Some(sender) = sender {
            sender.send(()).ok();
            return;
        }
        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || inner.teardown());
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!("accepted new client: {peer}");
                if let Err(err) = inner.admit(stream) {
                    tracing::error!("cannot start session for {peer}: {err}");
                }
            }
            Err(err) => {
                tracing::warn!("accept failed: {err}");
            }
        }
    }
}

impl ServerInner {
    fn admit(self: &Arc<Self>, stream: TcpStream) -> Result<(), NetError> {
        let weak = Arc::downgrade(self);
        let fan_in: EventCallback = Arc::new(move |event| {
            if let Some(server) = weak.upgrade() {
                server.route_session_event(event);
            }
            Ok(())
        });

        let session = Session::new(
            &self.id,
            &self.registered_key.lock(),
            self.encrypt_mode.load(Ordering::Relaxed),
            fan_in,
        );
        session.set_start_code(*self.start_code.lock());
        session.set_end_code(*self.end_code.lock());

        let handle = self.handle.lock().clone().ok_or(NetError::NoSocket)?;
        session.start(
            stream,
            self.buffer_size.load(Ordering::Relaxed),
            self.worker_counts,
            &handle,
        )?;
        self.sessions.lock().push(session);
        Ok(())
    }

    /// Connection events hop through a `Normal` job on the server pool: the
    /// pruning they trigger joins session workers, so it must never run on
    /// one. Everything else is delivered in place.
    fn route_session_event(self: &Arc<Self>, event: Event) {
        if matches!(event, Event::Connection { .. }) {
            let Some(pool) = self.pool.lock().clone() else {
                events::emit(&self.events, event);
                return;
            };
            let server = Arc::clone(self);
            if pool
                .push(Job::new(
                    JobPriority::Normal,
                    "received_connection_job",
                    move || {
                        server.handle_connection_event(event);
                        Ok(())
                    },
                ))
                .is_err()
            {
                tracing::debug!("dropped a connection event during teardown");
            }
            return;
        }
        events::emit(&self.events, event);
    }

    fn handle_connection_event(&self, event: Event) {
        if let Event::Connection { condition, .. } = &event {
            if !condition {
                self.prune_expired();
            }
        }
        tracing::info!("working session count: {}", self.sessions.lock().len());
        events::emit(&self.events, event);
    }

    /// Drop every `Expired` session from the registry and stop it.
    fn prune_expired(&self) {
        self.remove_sessions(|session| session.condition() == ConnectCondition::Expired);
    }

    fn remove_sessions(&self, matches: impl Fn(&Session) -> bool) {
        let removed: Vec<Session> = {
            let mut sessions = self.sessions.lock();
            let (gone, keep) = sessions.drain(..).partition(matches);
            *sessions = keep;
            gone
        };
        for session in removed {
            session.stop();
        }
    }

    /// Snapshot the registry under the lock, then iterate without holding
    /// it. First failure aborts the sweep.
    fn for_each_target(
        &self,
        id: &str,
        sub_id: &str,
        send: impl Fn(&Session) -> Result<(), NetError>,
    ) -> Result<(), NetError> {
        let sessions: Vec<Session> = self.sessions.lock().clone();
        for session in &sessions {
            if !id.is_empty() {
                if session.id() != id {
                    continue;
                }
                if !sub_id.is_empty() && session.sub_id() != sub_id {
                    continue;
                }
            }
            send(session)?;
        }
        Ok(())
    }

    /// Full teardown, serialized across `stop`'s detached thread,
    /// `wait_stop`, and `Drop`. Sessions drain their pools (and their
    /// in-flight writes) before the shared runtime goes away.
    fn teardown(&self) {
        let _gate = self.teardown_gate.lock();
        self.cancel.lock().cancel();
        self.remove_sessions(|_| true);
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.lock(true);
            pool.stop(true);
        }
        if let Some(runtime) = self.runtime.lock().take() {
            drop(runtime);
        }
        *self.handle.lock() = None;
        *self.local_port.lock() = None;
    }
}
