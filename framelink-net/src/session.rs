//! Server-side pipeline for one accepted socket.
//!
//! A session is created in the accept loop with a fresh server-issued
//! `sub_id` and the placeholder id `"unauthorized_client"`. The first
//! `Connection` frame either confirms it (key match, optional key/IV issue)
//! or expires it with a `condition: false` response. All session events fan
//! into the server with the session's `(id, sub_id)` attached.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tokio::net::TcpStream;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::bundle::BundleManager;
use crate::codec;
use crate::error::NetError;
use crate::events::{self, Event, EventCallback};
use crate::pipeline::{
    build_pipeline_pool, configure_socket, ConnectionRequest, ConnectionResponse, FrameHandler,
    Pipeline,
};
use crate::types::{ConnectCondition, DataMode, FieldReader};

#[derive(Clone)]
pub(crate) struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    pipeline: Arc<Pipeline>,
    bundles: Arc<BundleManager>,
    server_id: String,
    registered_key: String,
    events: EventCallback,
}

impl Session {
    pub(crate) fn new(
        server_id: &str,
        registered_key: &str,
        encrypt: bool,
        events: EventCallback,
    ) -> Session {
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let handler: Weak<dyn FrameHandler> = weak.clone();
            let pipeline = Arc::new(Pipeline::new(handler));
            pipeline.set_id("unauthorized_client");
            pipeline.set_sub_id(&Uuid::new_v4().to_string());
            pipeline.set_encrypt_mode(encrypt);
            SessionInner {
                pipeline,
                bundles: Arc::new(BundleManager::new()),
                server_id: server_id.to_string(),
                registered_key: registered_key.to_string(),
                events,
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.bundles.set_callback(Arc::new(move |failures, successes| {
            if let Some(session) = weak.upgrade() {
                session.emit_files(failures, successes);
            }
        }));

        Session { inner }
    }

    /// Wire an accepted socket: options, pipeline pool, `Waiting`, and the
    /// read task on the server runtime.
    pub(crate) fn start(
        &self,
        stream: TcpStream,
        buffer_size: usize,
        worker_counts: (u16, u16, u16),
        handle: &Handle,
    ) -> Result<(), NetError> {
        configure_socket(&stream, buffer_size)?;
        let (read_half, write_half) = stream.into_split();

        let pool = build_pipeline_pool(&self.inner.pipeline.id(), worker_counts);
        pool.start()?;

        self.inner
            .pipeline
            .attach(handle.clone(), write_half, pool.clone(), buffer_size);
        self.inner.bundles.set_pool(Some(pool));
        self.inner
            .pipeline
            .set_condition(ConnectCondition::Waiting, false);

        let _ = handle.spawn(self.inner.pipeline.clone().read_loop(read_half));
        Ok(())
    }

    pub(crate) fn id(&self) -> String {
        self.inner.pipeline.id()
    }

    pub(crate) fn sub_id(&self) -> String {
        self.inner.pipeline.sub_id()
    }

    pub(crate) fn condition(&self) -> ConnectCondition {
        self.inner.pipeline.condition()
    }

    pub(crate) fn set_start_code(&self, code: [u8; 4]) {
        self.inner.pipeline.set_start_code(code);
    }

    pub(crate) fn set_end_code(&self, code: [u8; 4]) {
        self.inner.pipeline.set_end_code(code);
    }

    pub(crate) fn send_message(&self, message: &str) -> Result<(), NetError> {
        self.inner.pipeline.send_message(message)
    }

    pub(crate) fn send_binary(&self, data: &[u8], message: &str) -> Result<(), NetError> {
        self.inner.pipeline.send_binary(data, message)
    }

    pub(crate) fn send_files(&self, files: &[(PathBuf, String)]) -> Result<(), NetError> {
        self.inner.pipeline.send_files(files)
    }

    /// Expire and tear down. Must not be called from one of this session's
    /// own pool workers; the server routes session-initiated stops through
    /// its own pool for that reason.
    pub(crate) fn stop(&self) {
        self.inner
            .pipeline
            .set_condition(ConnectCondition::Expired, true);
        self.inner.bundles.set_pool(None);
        self.inner.pipeline.shutdown();
    }
}

impl SessionInner {
    fn received_connection(&self, data: Vec<u8>) -> Result<(), NetError> {
        if self.pipeline.condition() != ConnectCondition::Waiting {
            return Err(NetError::Handshake(
                "the line is not waiting for a connection request".to_string(),
            ));
        }

        let request: ConnectionRequest = serde_json::from_slice(&data)?;
        // The client's advertised sub_id is ignored; this session already
        // carries the server-issued one.
        self.pipeline.set_id(&request.id);
        tracing::debug!("received connection request from `{}`", request.id);

        if request.registered_key != self.registered_key {
            tracing::error!(
                "the registered key of `{}` is not compatible with the server",
                request.id
            );
            self.refuse()?;
            return Err(NetError::Handshake(format!(
                "registered key mismatch for `{}`",
                request.id
            )));
        }

        let mut response = ConnectionResponse {
            id: self.server_id.clone(),
            sub_id: self.pipeline.sub_id(),
            key: None,
            iv: None,
            encrypt_mode: Some(self.pipeline.encrypt_mode()),
            condition: true,
        };
        if self.pipeline.encrypt_mode() {
            let keys = codec::generate_keys();
            response.key = Some(keys.key.clone());
            response.iv = Some(keys.iv.clone());
            self.pipeline.set_keys(keys);
        }

        self.pipeline
            .set_condition(ConnectCondition::Confirmed, false);
        self.pipeline
            .send(DataMode::Connection, &serde_json::to_vec(&response)?)?;

        events::emit(
            &self.events,
            Event::Connection {
                id: self.pipeline.id(),
                sub_id: self.pipeline.sub_id(),
                condition: true,
                by_itself: false,
            },
        );
        Ok(())
    }

    /// Put the `condition: false` response on the wire, then expire. The
    /// refusal bypasses the job chain, which would refuse work the moment
    /// the condition flips.
    fn refuse(&self) -> Result<(), NetError> {
        let refusal = ConnectionResponse {
            id: self.server_id.clone(),
            sub_id: self.pipeline.sub_id(),
            key: None,
            iv: None,
            encrypt_mode: None,
            condition: false,
        };
        if let Err(err) = self
            .pipeline
            .send_now(DataMode::Connection, &serde_json::to_vec(&refusal)?)
        {
            tracing::warn!("cannot send connection refusal: {err}");
        }
        self.pipeline.set_condition(ConnectCondition::Expired, false);
        Ok(())
    }

    fn emit_files(&self, failures: Vec<String>, successes: Vec<(String, PathBuf)>) {
        events::emit(
            &self.events,
            Event::Files {
                id: self.pipeline.id(),
                sub_id: self.pipeline.sub_id(),
                failures,
                successes,
            },
        );
    }
}

impl FrameHandler for SessionInner {
    fn disconnected(&self, by_itself: bool) {
        // Report the drop through the fan-in so the server can prune; the
        // socket is in no state to carry a response.
        events::emit(
            &self.events,
            Event::Connection {
                id: self.pipeline.id(),
                sub_id: self.pipeline.sub_id(),
                condition: false,
                by_itself,
            },
        );
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
                        id: self.pipeline.id(),
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
                        id: self.pipeline.id(),
                        sub_id: self.pipeline.sub_id(),
                        message,
                    },
                );
                Ok(())
            }
            DataMode::File => {
                self.pipeline.expect_confirmed_receive("handle file data")?;
                let id = self.pipeline.id();
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
