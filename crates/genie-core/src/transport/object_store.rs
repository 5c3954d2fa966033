//! Object-store transport backend.
//!
//! Realises the session namespace on any [`ObjectStore`]: the session marker
//! is a zero-byte object under `sessions/` and messages live under
//! `session/<id>/`, so marker keys and message keys can never collide.
//! There are no change notifications in the store contract; discovery and
//! waiting are prefix listings on a polling ticker, with the initial listing
//! emitted before the polling loop begins.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    parse_message_name, request_name, response_name, Message, MessageKind, ObjectStore, Transport,
    DEFAULT_POLL_INTERVAL, WATCH_STREAM_CAPACITY,
};
use crate::error::{GenieError, Result};

/// Object-store backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Directory the bundled [`super::DirStore`] binding uses as its bucket.
    pub root: PathBuf,

    /// Prefix-listing interval in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

impl ObjectStoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval_ms: None,
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }
}

/// Transport over an [`ObjectStore`].
pub struct ObjectStoreTransport {
    store: Arc<dyn ObjectStore>,
    poll_interval: Duration,
}

impl ObjectStoreTransport {
    pub fn new(store: Arc<dyn ObjectStore>, config: ObjectStoreConfig) -> Self {
        Self {
            store,
            poll_interval: config.poll_interval(),
        }
    }

    fn marker_key(session_id: &str) -> String {
        format!("sessions/{session_id}")
    }

    fn message_prefix(session_id: &str) -> String {
        format!("session/{session_id}/")
    }

    fn request_key(session_id: &str, id: u64) -> String {
        format!("{}{}", Self::message_prefix(session_id), request_name(id))
    }

    fn response_key(session_id: &str, id: u64) -> String {
        format!("{}{}", Self::message_prefix(session_id), response_name(id))
    }

    async fn require_session(&self, session_id: &str) -> Result<()> {
        if self.store.exists(&Self::marker_key(session_id)).await {
            Ok(())
        } else {
            Err(GenieError::NoSession {
                id: session_id.to_string(),
            })
        }
    }
}

/// List a session's message entries, split into request and response ids.
async fn scan_messages(
    store: &dyn ObjectStore,
    session_id: &str,
) -> Result<(Vec<u64>, HashSet<u64>)> {
    let prefix = ObjectStoreTransport::message_prefix(session_id);
    let mut requests = Vec::new();
    let mut responses = HashSet::new();

    for key in store.list(&prefix).await? {
        let Some(name) = key.rsplit('/').next() else {
            continue;
        };
        match parse_message_name(name) {
            Some((id, MessageKind::Request)) => requests.push(id),
            Some((id, MessageKind::Response)) => {
                responses.insert(id);
            }
            None => {}
        }
    }
    requests.sort_unstable();
    Ok((requests, responses))
}

#[async_trait]
impl Transport for ObjectStoreTransport {
    async fn create_session(&self, session_id: &str) -> Result<()> {
        let key = Self::marker_key(session_id);
        if self.store.exists(&key).await {
            return Err(GenieError::SessionExists {
                id: session_id.to_string(),
            });
        }
        self.store.put(&key, &[]).await?;
        debug!(session_id, "session marker written");
        Ok(())
    }

    async fn has_session(&self, session_id: &str) -> bool {
        self.store.exists(&Self::marker_key(session_id)).await
    }

    async fn watch_sessions(&self) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(WATCH_STREAM_CAPACITY);
        let store = self.store.clone();
        let interval = self.poll_interval;

        tokio::spawn(async move {
            let mut seen: HashSet<String> = HashSet::new();
            loop {
                match store.list("sessions/").await {
                    Ok(keys) => {
                        for key in keys {
                            let Some(name) = key.strip_prefix("sessions/") else {
                                continue;
                            };
                            // Only keys directly under the marker prefix are
                            // session markers.
                            if name.is_empty() || name.contains('/') || seen.contains(name) {
                                continue;
                            }
                            if tx.send(name.to_string()).await.is_err() {
                                return;
                            }
                            seen.insert(name.to_string());
                        }
                    }
                    Err(e) => warn!(error = %e, "cannot list session markers"),
                }
                tokio::time::sleep(interval).await;
                if tx.is_closed() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn get_last_request_id(&self, session_id: &str) -> Result<u64> {
        let (requests, _) = scan_messages(self.store.as_ref(), session_id).await?;
        Ok(requests.last().copied().unwrap_or(0))
    }

    async fn watch_requests(&self, session_id: &str) -> Result<mpsc::Receiver<Message>> {
        self.require_session(session_id).await?;

        let (tx, rx) = mpsc::channel(WATCH_STREAM_CAPACITY);
        let store = self.store.clone();
        let interval = self.poll_interval;
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let mut emitted: HashSet<u64> = HashSet::new();
            loop {
                match scan_messages(store.as_ref(), &session_id).await {
                    Ok((requests, responses)) => {
                        for id in requests {
                            if responses.contains(&id) || emitted.contains(&id) {
                                continue;
                            }
                            let key = Self::request_key(&session_id, id);
                            match store.get(&key).await {
                                Ok(Some(data)) => {
                                    emitted.insert(id);
                                    if tx.send(Message::new(id, data)).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(session_id = %session_id, request_id = id, error = %e,
                                        "cannot read request object");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "cannot list request objects")
                    }
                }
                tokio::time::sleep(interval).await;
                if tx.is_closed() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn send_unary(&self, session_id: &str, request: Message) -> Result<Message> {
        self.require_session(session_id).await?;

        self.store
            .put(&Self::request_key(session_id, request.id), &request.data)
            .await?;
        debug!(session_id, request_id = request.id, "request object written");

        let response_key = Self::response_key(session_id, request.id);
        loop {
            if let Some(data) = self.store.get(&response_key).await? {
                return Ok(Message::new(request.id, data));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn send_response(&self, session_id: &str, response: Message) -> Result<()> {
        self.require_session(session_id).await?;
        self.store
            .put(&Self::response_key(session_id, response.id), &response.data)
            .await?;
        debug!(session_id, request_id = response.id, "response object written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::MemoryStore;
    use super::*;
    use tokio::time::timeout;

    fn fast_transport() -> ObjectStoreTransport {
        let config = ObjectStoreConfig {
            root: PathBuf::from("unused"),
            poll_interval_ms: Some(20),
        };
        ObjectStoreTransport::new(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn test_create_session_then_has_session() {
        let transport = fast_transport();
        assert!(!transport.has_session("s1").await);
        transport.create_session("s1").await.unwrap();
        assert!(transport.has_session("s1").await);
    }

    #[tokio::test]
    async fn test_create_session_twice_fails() {
        let transport = fast_transport();
        transport.create_session("s1").await.unwrap();
        let err = transport.create_session("s1").await.unwrap_err();
        assert!(matches!(err, GenieError::SessionExists { .. }));
    }

    #[tokio::test]
    async fn test_marker_and_message_keys_do_not_collide() {
        let transport = fast_transport();
        transport.create_session("s1").await.unwrap();
        transport
            .send_response("s1", Message::new(1, b"res".to_vec()))
            .await
            .unwrap();

        // The response object must not surface as a session marker.
        let mut sessions = transport.watch_sessions().await.unwrap();
        let first = timeout(Duration::from_secs(5), sessions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "s1");
        let next = timeout(Duration::from_millis(100), sessions.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_watch_sessions_emits_existing_and_new() {
        let transport = fast_transport();
        transport.create_session("old").await.unwrap();

        let mut sessions = transport.watch_sessions().await.unwrap();
        let first = timeout(Duration::from_secs(5), sessions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "old");

        transport.create_session("new").await.unwrap();
        let second = timeout(Duration::from_secs(5), sessions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, "new");
    }

    #[tokio::test]
    async fn test_last_request_id() {
        let transport = fast_transport();
        transport.create_session("s1").await.unwrap();
        assert_eq!(transport.get_last_request_id("s1").await.unwrap(), 0);

        transport.store.put("session/s1/2-req.yaml", b"x").await.unwrap();
        transport.store.put("session/s1/5-req.yaml", b"y").await.unwrap();
        transport.store.put("session/s1/9-res.yaml", b"z").await.unwrap();
        assert_eq!(transport.get_last_request_id("s1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_watch_requests_skips_answered_pairs() {
        let transport = fast_transport();
        transport.create_session("s1").await.unwrap();

        transport.store.put("session/s1/1-req.yaml", b"one").await.unwrap();
        transport.store.put("session/s1/1-res.yaml", b"done").await.unwrap();
        transport.store.put("session/s1/2-req.yaml", b"two").await.unwrap();

        let mut requests = transport.watch_requests("s1").await.unwrap();
        let msg = timeout(Duration::from_secs(5), requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, 2);

        let next = timeout(Duration::from_millis(100), requests.recv()).await;
        assert!(next.is_err(), "answered request was re-emitted");
    }

    #[tokio::test]
    async fn test_send_unary_roundtrip() {
        let transport = Arc::new(fast_transport());
        transport.create_session("s1").await.unwrap();

        let sender = transport.clone();
        let waiter = tokio::spawn(async move {
            sender.send_unary("s1", Message::new(1, b"req".to_vec())).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        transport
            .send_response("s1", Message::new(1, b"res".to_vec()))
            .await
            .unwrap();

        let reply = timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.data, b"res");
    }

    #[tokio::test]
    async fn test_send_unary_without_session_fails() {
        let transport = fast_transport();
        let err = transport
            .send_unary("missing", Message::new(1, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::NoSession { .. }));
    }
}
