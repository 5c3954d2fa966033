//! Server side of the fabric.
//!
//! A long-running dispatcher watches the transport for sessions and runs one
//! [`session::SessionHandler`] per session; each handler watches its session
//! for requests and dispatches them to the command executor. Per-request
//! faults are logged and never take the server down; only startup and
//! transport construction can fail.

pub mod session;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::{GenieError, Result};
use crate::exec::{CommandExecutor, ProcessExecutor};
use crate::protocol::CallType;
use crate::transport::{self, Transport, TransportConfig};

pub use session::SessionHandler;

/// Timeout applied to calls whose type has no configured budget.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Top-level server configuration, loaded from a YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub transport: TransportConfig,
    #[serde(default)]
    pub handler: HandlerConfig,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| GenieError::Config {
            message: format!("cannot read config file {}: {e}", path.display()),
        })?;
        serde_yaml::from_str(&raw).map_err(|e| GenieError::Config {
            message: format!("cannot parse config file {}: {e}", path.display()),
        })
    }
}

/// Request-handling policy: the command allow-list and the time budgets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Logical command name to on-disk binary path. Membership in this map
    /// is the command allow-list.
    #[serde(default)]
    pub binaries: HashMap<String, PathBuf>,

    /// Per-call-type time budgets in milliseconds.
    #[serde(default)]
    pub timeouts: HashMap<CallType, u64>,
}

impl HandlerConfig {
    /// The configured budget for a call type, or the built-in default.
    pub fn timeout_for(&self, call_type: CallType) -> Duration {
        self.timeouts
            .get(&call_type)
            .copied()
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CALL_TIMEOUT)
    }
}

/// The dispatcher: one handler per observed session.
pub struct GenieServer {
    transport: Arc<dyn Transport>,
    executor: Arc<dyn CommandExecutor>,
    handler_config: HandlerConfig,
    sessions: Arc<Mutex<HashSet<String>>>,
}

impl GenieServer {
    pub fn new(
        transport: Arc<dyn Transport>,
        executor: Arc<dyn CommandExecutor>,
        handler_config: HandlerConfig,
    ) -> Self {
        Self {
            transport,
            executor,
            handler_config,
            sessions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Build the server from configuration, with the process-backed executor.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let transport = transport::from_config(&config.transport)?;
        Ok(Self::new(
            transport,
            Arc::new(ProcessExecutor),
            config.handler.clone(),
        ))
    }

    /// Watch for sessions and dispatch until `shutdown` flips to `true` (or
    /// its sender goes away). On return every session handler has been told
    /// to stop as well.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut sessions = self.transport.watch_sessions().await?;
        info!("watching for new sessions");

        let (stop_tx, stop_rx) = watch::channel(false);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = sessions.recv() => match next {
                    Some(session_id) => self.adopt_session(session_id, stop_rx.clone()),
                    None => {
                        info!("session watch closed");
                        break;
                    }
                },
            }
        }

        let _ = stop_tx.send(true);
        info!("stopped watching for new sessions");
        Ok(())
    }

    /// Start a handler for the session unless one is already running.
    fn adopt_session(&self, session_id: String, shutdown: watch::Receiver<bool>) {
        {
            let Ok(mut sessions) = self.sessions.lock() else {
                return;
            };
            if !sessions.insert(session_id.clone()) {
                return;
            }
        }

        let handler = SessionHandler::new(
            session_id.clone(),
            self.transport.clone(),
            self.handler_config.clone(),
            self.executor.clone(),
        );
        let registry = self.sessions.clone();
        tokio::spawn(async move {
            handler.run(shutdown).await;
            if let Ok(mut sessions) = registry.lock() {
                sessions.remove(&session_id);
            }
        });
    }

    /// Number of sessions with a live handler.
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parses_allow_list_and_timeouts() {
        let raw = "\
transport:
  fs:
    root: /var/lib/genie
handler:
  binaries:
    kubectl: /usr/local/bin/kubectl
  timeouts:
    unary: 30000
";
        let config: ServerConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(
            config.handler.binaries.get("kubectl"),
            Some(&PathBuf::from("/usr/local/bin/kubectl"))
        );
        assert_eq!(
            config.handler.timeout_for(CallType::Unary),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_timeout_for_falls_back_to_default() {
        let config = HandlerConfig::default();
        assert_eq!(config.timeout_for(CallType::Unary), DEFAULT_CALL_TIMEOUT);
        assert_eq!(config.timeout_for(CallType::Stream), DEFAULT_CALL_TIMEOUT);
    }

    #[test]
    fn test_config_without_handler_section() {
        let raw = "\
transport:
  object_store:
    root: /mnt/bucket
    poll_interval_ms: 500
";
        let config: ServerConfig = serde_yaml::from_str(raw).unwrap();
        assert!(config.handler.binaries.is_empty());
        assert!(config.transport.object_store.is_some());
    }

    #[test]
    fn test_load_missing_config_is_config_error() {
        let err = ServerConfig::load(Path::new("/does/not/exist.yaml")).unwrap_err();
        assert!(matches!(err, GenieError::Config { .. }));
    }
}
