//! Pluggable message transport.
//!
//! A [`Transport`] stores and discovers ID-tagged messages under a two-level
//! namespace: sessions at the top, numbered request/response messages inside
//! each session. The client and the server never talk to each other directly;
//! whichever backend is configured is the only rendezvous between them.
//!
//! Two backends ship: a local filesystem tree ([`fs::FsTransport`]) and a
//! prefix-listed object store ([`object_store::ObjectStoreTransport`]). Both
//! realise the same namespace: a session marker plus `<N>-req.yaml` /
//! `<N>-res.yaml` message entries.

pub mod fs;
pub mod object_store;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{GenieError, Result};

pub use fs::{FsConfig, FsTransport};
pub use object_store::{ObjectStoreConfig, ObjectStoreTransport};
pub use store::{DirStore, MemoryStore, ObjectStore};

/// Capacity of the channels handed out by the watch operations.
pub(crate) const WATCH_STREAM_CAPACITY: usize = 16;

/// Default interval for polling backends and resynchronisation scans.
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The transport's unit of transfer: an ID-tagged opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message id, monotonically increasing within a session, starting at 1.
    pub id: u64,
    /// Position within a stream. Always 0 for unary traffic.
    pub sequence_id: u64,
    /// Opaque payload; the protocol layer owns its meaning.
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(id: u64, data: Vec<u8>) -> Self {
        Self {
            id,
            sequence_id: 0,
            data,
        }
    }
}

/// Capability set every transport backend must provide.
///
/// Watch operations hand back a channel receiver; the producing task stops
/// when the receiver is dropped, which is how callers cancel a subscription.
/// `send_unary` suspends until the matching response message is observed;
/// callers bound the wait with a deadline of their own.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Create the session marker. Fails with [`GenieError::SessionExists`]
    /// if the marker is already present.
    async fn create_session(&self, session_id: &str) -> Result<()>;

    /// Whether the session marker exists.
    async fn has_session(&self, session_id: &str) -> bool;

    /// Every currently-existing session id once, then every newly-created
    /// session id as it appears. No duplicates within one subscription.
    async fn watch_sessions(&self) -> Result<mpsc::Receiver<String>>;

    /// Largest N for which a request message exists, or 0 if none.
    async fn get_last_request_id(&self, session_id: &str) -> Result<u64>;

    /// Every request message that has no response yet, exactly once each,
    /// then every request message that appears later.
    async fn watch_requests(&self, session_id: &str) -> Result<mpsc::Receiver<Message>>;

    /// Write the request, then suspend until the matching response message
    /// is observed and return it.
    async fn send_unary(&self, session_id: &str, request: Message) -> Result<Message>;

    /// Write a response message.
    async fn send_response(&self, session_id: &str, response: Message) -> Result<()>;

    /// Reserved for streaming calls.
    async fn send_stream(
        &self,
        session_id: &str,
        request: Message,
    ) -> Result<mpsc::Receiver<Message>> {
        let _ = (session_id, request);
        Err(GenieError::Unsupported {
            message: "streaming transport is not implemented".into(),
        })
    }
}

/// Selects and parameterises a backend. Exactly one section must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_store: Option<ObjectStoreConfig>,
}

/// Build the configured transport backend.
pub fn from_config(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    if let Some(fs) = &config.fs {
        return Ok(Arc::new(FsTransport::new(fs.clone())));
    }
    if let Some(os) = &config.object_store {
        let store = Arc::new(DirStore::new(os.root.clone()));
        return Ok(Arc::new(ObjectStoreTransport::new(store, os.clone())));
    }
    Err(GenieError::TransportUnconfigured)
}

/// Which half of a request/response pair a message entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Request,
    Response,
}

/// Parse a message entry name (`<N>-req.yaml` / `<N>-res.yaml`).
///
/// Returns `None` for anything else; foreign entries in a session namespace
/// are ignored rather than treated as errors.
pub(crate) fn parse_message_name(name: &str) -> Option<(u64, MessageKind)> {
    let (id, suffix) = name.split_once('-')?;
    let kind = match suffix {
        "req.yaml" => MessageKind::Request,
        "res.yaml" => MessageKind::Response,
        _ => return None,
    };
    let id: u64 = id.parse().ok()?;
    Some((id, kind))
}

pub(crate) fn request_name(id: u64) -> String {
    format!("{id}-req.yaml")
}

pub(crate) fn response_name(id: u64) -> String {
    format!("{id}-res.yaml")
}
