//! Filesystem transport backend.
//!
//! The session namespace is a directory tree under `<root>/sessions/`: the
//! session marker is the session directory itself and messages are regular
//! files inside it. Discovery and waiting are driven by one shared `notify`
//! watcher whose events fan out to per-subscriber queues; when the platform
//! watcher cannot be created the backend falls back to a polling ticker.
//!
//! Watch loops are scan-based: an event (or a tick) triggers a directory
//! rescan and a per-subscription seen-set decides what still needs emitting.
//! A subscriber whose queue backs up is dropped from the fan-out and
//! resynchronises through its own periodic rescan.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    parse_message_name, request_name, response_name, Message, MessageKind, Transport,
    DEFAULT_POLL_INTERVAL, WATCH_STREAM_CAPACITY,
};
use crate::error::{GenieError, Result};

/// Capacity of each subscriber's event queue. A subscriber that falls this
/// far behind is dropped and resynchronises from its next full scan.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Filesystem backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    /// Directory under which the `sessions/` namespace lives.
    pub root: PathBuf,

    /// Resynchronisation interval in milliseconds. Also the polling interval
    /// when the native file watcher is unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

impl FsConfig {
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

/// Transport over a shared directory tree.
pub struct FsTransport {
    config: FsConfig,
    hub: Arc<WatchHub>,
}

impl FsTransport {
    pub fn new(config: FsConfig) -> Self {
        let hub = Arc::new(WatchHub::new(config.root.join("sessions")));
        Self { config, hub }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.hub.sessions_root.join(session_id)
    }

    fn require_session(&self, session_id: &str) -> Result<PathBuf> {
        let path = self.session_path(session_id);
        if !path.is_dir() {
            return Err(GenieError::NoSession {
                id: session_id.to_string(),
            });
        }
        Ok(path)
    }

    /// Suspend until `path` exists, then return its contents.
    async fn await_file(&self, path: PathBuf) -> Result<Vec<u8>> {
        let interval = self.config.poll_interval();
        let mut source = EventSource::subscribe(&self.hub);
        loop {
            match std::fs::read(&path) {
                Ok(data) => return Ok(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(GenieError::io_with_path(e, path)),
            }
            source.wait(interval).await;
        }
    }
}

#[async_trait]
impl Transport for FsTransport {
    async fn create_session(&self, session_id: &str) -> Result<()> {
        std::fs::create_dir_all(&self.hub.sessions_root)
            .map_err(|e| GenieError::io_with_path(e, &self.hub.sessions_root))?;

        let path = self.session_path(session_id);
        match std::fs::create_dir(&path) {
            Ok(()) => {
                debug!(session_id, "session directory created");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(GenieError::SessionExists {
                    id: session_id.to_string(),
                })
            }
            Err(e) => Err(GenieError::io_with_path(e, path)),
        }
    }

    async fn has_session(&self, session_id: &str) -> bool {
        self.session_path(session_id).is_dir()
    }

    async fn watch_sessions(&self) -> Result<mpsc::Receiver<String>> {
        std::fs::create_dir_all(&self.hub.sessions_root)
            .map_err(|e| GenieError::io_with_path(e, &self.hub.sessions_root))?;

        let (tx, rx) = mpsc::channel(WATCH_STREAM_CAPACITY);
        let hub = self.hub.clone();
        let interval = self.config.poll_interval();

        tokio::spawn(async move {
            let mut source = EventSource::subscribe(&hub);
            let mut seen: HashSet<String> = HashSet::new();
            loop {
                match list_sessions(&hub.sessions_root) {
                    Ok(names) => {
                        for name in names {
                            if seen.contains(&name) {
                                continue;
                            }
                            if tx.send(name.clone()).await.is_err() {
                                return;
                            }
                            seen.insert(name);
                        }
                    }
                    Err(e) => warn!(error = %e, "cannot scan sessions directory"),
                }
                source.wait(interval).await;
                if tx.is_closed() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn get_last_request_id(&self, session_id: &str) -> Result<u64> {
        let dir = self.require_session(session_id)?;
        let (requests, _) = scan_session(&dir)?;
        Ok(requests.last().copied().unwrap_or(0))
    }

    async fn watch_requests(&self, session_id: &str) -> Result<mpsc::Receiver<Message>> {
        let dir = self.require_session(session_id)?;

        let (tx, rx) = mpsc::channel(WATCH_STREAM_CAPACITY);
        let hub = self.hub.clone();
        let interval = self.config.poll_interval();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let mut source = EventSource::subscribe(&hub);
            let mut emitted: HashSet<u64> = HashSet::new();
            loop {
                match scan_session(&dir) {
                    Ok((requests, responses)) => {
                        for id in requests {
                            // Answered requests are never emitted, no matter
                            // when the response appeared.
                            if responses.contains(&id) || emitted.contains(&id) {
                                continue;
                            }
                            match std::fs::read(dir.join(request_name(id))) {
                                Ok(data) => {
                                    emitted.insert(id);
                                    if tx.send(Message::new(id, data)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!(session_id = %session_id, request_id = id, error = %e,
                                        "cannot read request file");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "cannot scan session directory")
                    }
                }
                source.wait(interval).await;
                if tx.is_closed() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn send_unary(&self, session_id: &str, request: Message) -> Result<Message> {
        let dir = self.require_session(session_id)?;

        write_atomic(&dir.join(request_name(request.id)), &request.data)?;
        debug!(session_id, request_id = request.id, "request written");

        let data = self.await_file(dir.join(response_name(request.id))).await?;
        Ok(Message::new(request.id, data))
    }

    async fn send_response(&self, session_id: &str, response: Message) -> Result<()> {
        let dir = self.require_session(session_id)?;
        write_atomic(&dir.join(response_name(response.id)), &response.data)?;
        debug!(session_id, request_id = response.id, "response written");
        Ok(())
    }
}

/// Shared file watcher fanning events out to subscriber queues.
struct WatchHub {
    sessions_root: PathBuf,
    watcher: Mutex<WatcherState>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<()>>>,
    next_key: AtomicU64,
}

enum WatcherState {
    NotStarted,
    Running(#[allow(dead_code)] RecommendedWatcher),
    Unavailable,
}

impl WatchHub {
    fn new(sessions_root: PathBuf) -> Self {
        Self {
            sessions_root,
            watcher: Mutex::new(WatcherState::NotStarted),
            subscribers: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
        }
    }

    /// Register a subscriber queue, starting the shared watcher on first use.
    /// Returns `None` when the platform watcher is unavailable; the caller
    /// then relies on its polling ticker alone.
    fn subscribe(self: &Arc<Self>) -> Option<(u64, mpsc::Receiver<()>)> {
        {
            let mut state = self.watcher.lock().ok()?;
            if matches!(*state, WatcherState::NotStarted) {
                *state = match self.start_watcher() {
                    Ok(watcher) => WatcherState::Running(watcher),
                    Err(e) => {
                        warn!(error = %e, "file watcher unavailable, using polling only");
                        WatcherState::Unavailable
                    }
                };
            }
            if matches!(*state, WatcherState::Unavailable) {
                return None;
            }
        }

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(key, tx);
        }
        Some((key, rx))
    }

    fn unsubscribe(&self, key: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&key);
        }
    }

    fn start_watcher(self: &Arc<Self>) -> notify::Result<RecommendedWatcher> {
        std::fs::create_dir_all(&self.sessions_root).map_err(notify::Error::io)?;

        let hub = Arc::downgrade(self);
        let mut watcher = RecommendedWatcher::new(
            move |event: notify::Result<notify::Event>| {
                let Some(hub) = hub.upgrade() else { return };
                match event {
                    Ok(event) => hub.publish(&event),
                    Err(e) => warn!(error = %e, "file watcher error"),
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.sessions_root, RecursiveMode::Recursive)?;
        Ok(watcher)
    }

    /// Fan an event out to every subscriber. Runs on the watcher's thread;
    /// a subscriber with a full queue is dropped rather than waited for.
    fn publish(&self, event: &notify::Event) {
        if !(event.kind.is_create() || event.kind.is_modify()) {
            return;
        }
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|key, tx| match tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = key, "dropping slow watch subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// A waiter's change-notification source: shared-watcher events where
/// available, a plain ticker otherwise. Either way the caller rescans at
/// least once per interval.
enum EventSource {
    Notify {
        hub: Arc<WatchHub>,
        key: u64,
        rx: mpsc::Receiver<()>,
    },
    Poll,
}

impl EventSource {
    fn subscribe(hub: &Arc<WatchHub>) -> Self {
        match hub.subscribe() {
            Some((key, rx)) => EventSource::Notify {
                hub: hub.clone(),
                key,
                rx,
            },
            None => EventSource::Poll,
        }
    }

    async fn wait(&mut self, interval: Duration) {
        let demoted = match self {
            EventSource::Notify { rx, .. } => {
                match tokio::time::timeout(interval, rx.recv()).await {
                    // A change happened somewhere under the root.
                    Ok(Some(())) => false,
                    // Dropped as a slow subscriber; polling resynchronises.
                    Ok(None) => true,
                    // Quiet interval; rescan anyway.
                    Err(_) => false,
                }
            }
            EventSource::Poll => {
                tokio::time::sleep(interval).await;
                false
            }
        };
        if demoted {
            *self = EventSource::Poll;
        }
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        if let EventSource::Notify { hub, key, .. } = self {
            hub.unsubscribe(*key);
        }
    }
}

fn list_sessions(sessions_root: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(sessions_root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// Collect the request and response ids present in a session directory.
fn scan_session(dir: &Path) -> Result<(BTreeSet<u64>, HashSet<u64>)> {
    let mut requests = BTreeSet::new();
    let mut responses = HashSet::new();

    let entries = std::fs::read_dir(dir).map_err(|e| GenieError::io_with_path(e, dir))?;
    for entry in entries {
        let entry = entry.map_err(|e| GenieError::io_with_path(e, dir))?;
        let name = entry.file_name();
        let Some((id, kind)) = parse_message_name(&name.to_string_lossy()) else {
            continue;
        };
        match kind {
            MessageKind::Request => {
                requests.insert(id);
            }
            MessageKind::Response => {
                responses.insert(id);
            }
        }
    }

    Ok((requests, responses))
}

/// Publish a message file atomically: readers either see the complete file
/// or no file at all.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("tmp.{}.{}", std::process::id(), seq));

    std::fs::write(&tmp, data).map_err(|e| GenieError::io_with_path(e, &tmp))?;
    std::fs::rename(&tmp, path).map_err(|e| GenieError::io_with_path(e, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn fast_transport(root: &Path) -> FsTransport {
        FsTransport::new(FsConfig {
            root: root.to_path_buf(),
            poll_interval_ms: Some(50),
        })
    }

    #[tokio::test]
    async fn test_create_session_then_has_session() {
        let temp = TempDir::new().unwrap();
        let transport = fast_transport(temp.path());

        assert!(!transport.has_session("s1").await);
        transport.create_session("s1").await.unwrap();
        assert!(transport.has_session("s1").await);
    }

    #[tokio::test]
    async fn test_create_session_twice_fails() {
        let temp = TempDir::new().unwrap();
        let transport = fast_transport(temp.path());

        transport.create_session("s1").await.unwrap();
        let err = transport.create_session("s1").await.unwrap_err();
        assert!(matches!(err, GenieError::SessionExists { id } if id == "s1"));
    }

    #[tokio::test]
    async fn test_last_request_id_empty_session() {
        let temp = TempDir::new().unwrap();
        let transport = fast_transport(temp.path());

        transport.create_session("s1").await.unwrap();
        assert_eq!(transport.get_last_request_id("s1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_last_request_id_ignores_responses_and_foreign_files() {
        let temp = TempDir::new().unwrap();
        let transport = fast_transport(temp.path());
        transport.create_session("s1").await.unwrap();

        let dir = temp.path().join("sessions").join("s1");
        std::fs::write(dir.join("1-req.yaml"), b"a").unwrap();
        std::fs::write(dir.join("3-req.yaml"), b"b").unwrap();
        std::fs::write(dir.join("9-res.yaml"), b"c").unwrap();
        std::fs::write(dir.join("notes.txt"), b"d").unwrap();

        assert_eq!(transport.get_last_request_id("s1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_last_request_id_no_session() {
        let temp = TempDir::new().unwrap();
        let transport = fast_transport(temp.path());
        let err = transport.get_last_request_id("missing").await.unwrap_err();
        assert!(matches!(err, GenieError::NoSession { .. }));
    }

    #[tokio::test]
    async fn test_watch_sessions_emits_existing_and_new() {
        let temp = TempDir::new().unwrap();
        let transport = fast_transport(temp.path());

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
    async fn test_watch_requests_skips_answered_pairs() {
        let temp = TempDir::new().unwrap();
        let transport = fast_transport(temp.path());
        transport.create_session("s1").await.unwrap();

        let dir = temp.path().join("sessions").join("s1");
        std::fs::write(dir.join("1-req.yaml"), b"one").unwrap();
        std::fs::write(dir.join("1-res.yaml"), b"answered").unwrap();
        std::fs::write(dir.join("2-req.yaml"), b"two").unwrap();

        let mut requests = transport.watch_requests("s1").await.unwrap();
        let msg = timeout(Duration::from_secs(5), requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, 2);
        assert_eq!(msg.data, b"two");

        // Request 1 must not arrive afterwards either.
        let next = timeout(Duration::from_millis(300), requests.recv()).await;
        assert!(next.is_err(), "answered request was re-emitted");
    }

    #[tokio::test]
    async fn test_watch_requests_sees_later_requests() {
        let temp = TempDir::new().unwrap();
        let transport = fast_transport(temp.path());
        transport.create_session("s1").await.unwrap();

        let mut requests = transport.watch_requests("s1").await.unwrap();

        let dir = temp.path().join("sessions").join("s1");
        std::fs::write(dir.join("1-req.yaml"), b"late").unwrap();

        let msg = timeout(Duration::from_secs(5), requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, 1);
    }

    #[tokio::test]
    async fn test_send_unary_returns_immediately_when_response_exists() {
        let temp = TempDir::new().unwrap();
        let transport = fast_transport(temp.path());
        transport.create_session("s1").await.unwrap();

        let dir = temp.path().join("sessions").join("s1");
        std::fs::write(dir.join("1-res.yaml"), b"already there").unwrap();

        let reply = timeout(
            Duration::from_secs(5),
            transport.send_unary("s1", Message::new(1, b"req".to_vec())),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply.data, b"already there");
    }

    #[tokio::test]
    async fn test_send_unary_completes_when_response_arrives() {
        let temp = TempDir::new().unwrap();
        let transport = Arc::new(fast_transport(temp.path()));
        transport.create_session("s1").await.unwrap();

        let sender = transport.clone();
        let waiter = tokio::spawn(async move {
            sender.send_unary("s1", Message::new(1, b"req".to_vec())).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        transport
            .send_response("s1", Message::new(1, b"res".to_vec()))
            .await
            .unwrap();

        let reply = timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.id, 1);
        assert_eq!(reply.data, b"res");
    }

    #[tokio::test]
    async fn test_send_unary_without_session_fails() {
        let temp = TempDir::new().unwrap();
        let transport = fast_transport(temp.path());
        let err = transport
            .send_unary("missing", Message::new(1, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::NoSession { .. }));
    }

    #[tokio::test]
    async fn test_send_stream_is_unsupported() {
        let temp = TempDir::new().unwrap();
        let transport = fast_transport(temp.path());
        transport.create_session("s1").await.unwrap();
        let err = transport
            .send_stream("s1", Message::new(1, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::Unsupported { .. }));
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("1-req.yaml");
        write_atomic(&path, b"payload").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        let entries: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
