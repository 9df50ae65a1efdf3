//! Framed-stream messaging engine.
//!
//! A long-lived TCP client/server framework moving three kinds of payloads
//! between authenticated peers: structured messages, opaque binaries, and
//! file bundles. Every I/O transform (compression, optional AES-CBC,
//! framing, dispatch) runs as a job on a [`framelink_pool::Pool`], with the
//! socket reactor driven by a dedicated `LongTerm` worker and socket writes
//! serialized on the single `Top` worker of each pipeline.
//!
//! The two endpoints are [`Client`] and [`Server`]; both report everything
//! through a single [`Event`] callback.

pub mod client;
pub mod codec;
pub mod error;
pub mod events;
pub mod server;
pub mod types;

mod bundle;
mod pipeline;
mod session;

pub use client::Client;
pub use error::NetError;
pub use events::{Event, EventCallback};
pub use server::Server;
pub use types::{ConnectCondition, DataMode, FileMode};
