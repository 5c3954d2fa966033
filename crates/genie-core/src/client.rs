//! Client side of the fabric.
//!
//! A client owns a transport plus a persisted configuration with a "current
//! session" handle. It turns a command intent into a request, allocates the
//! request id, publishes it, and waits (bounded) for the matching response.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GenieError, Result};
use crate::protocol::{CallType, Request, Response};
use crate::transport::{self, Message, Transport, TransportConfig};

/// Environment variable naming the config file when no path is given.
pub const CONFIG_ENV: &str = "GENIE_CONFIG";

/// Environment variable supplying the current session id when the
/// configuration does not.
pub const SESSION_ENV: &str = "GENIE_SESSION";

/// Deadline applied to a send when the request carries no timeout of its own.
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Persisted client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub transport: TransportConfig,

    /// Session the client talks to; `GENIE_SESSION` fills in when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_session: Option<String>,
}

impl ClientConfig {
    /// Load a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| GenieError::Config {
            message: format!("cannot read config file {}: {e}", path.display()),
        })?;
        serde_yaml::from_str(&raw).map_err(|e| GenieError::Config {
            message: format!("cannot parse config file {}: {e}", path.display()),
        })
    }

    /// Write the configuration back, e.g. after the current session changed.
    pub fn store(&self, path: &Path) -> Result<()> {
        let raw = serde_yaml::to_string(self).map_err(|e| GenieError::Config {
            message: format!("cannot serialize config: {e}"),
        })?;
        std::fs::write(path, raw).map_err(|e| GenieError::Config {
            message: format!("cannot write config file {}: {e}", path.display()),
        })?;
        Ok(())
    }
}

/// Resolve the config file path from an explicit argument or `GENIE_CONFIG`.
pub fn resolve_config_path(arg: Option<&Path>) -> Result<std::path::PathBuf> {
    if let Some(path) = arg {
        return Ok(path.to_path_buf());
    }
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.is_empty() => Ok(path.into()),
        _ => Err(GenieError::Config {
            message: "config file path is required but not provided".into(),
        }),
    }
}

/// Client over a configured transport.
pub struct Client {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = transport::from_config(&config.transport)?;
        Ok(Self { config, transport })
    }

    /// Load the configuration at `path` and build a client from it.
    pub fn load(path: &Path) -> Result<Self> {
        Self::new(ClientConfig::load(path)?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Create a session named after the current wall time and `name`.
    ///
    /// Returns the full session id. Surfaces
    /// [`GenieError::SessionExists`] unchanged.
    pub async fn create_session(&self, name: &str) -> Result<String> {
        let session_id = session_id_for(name, Utc::now());
        self.transport.create_session(&session_id).await?;
        debug!(session_id = %session_id, "session created");
        Ok(session_id)
    }

    /// Resolve the current session id and verify it exists.
    pub async fn ensure_session(&self) -> Result<String> {
        let session_id = resolve_current_session(
            std::env::var(SESSION_ENV).ok(),
            self.config.current_session.clone(),
        )?;
        if !self.transport.has_session(&session_id).await {
            return Err(GenieError::NoSession { id: session_id });
        }
        Ok(session_id)
    }

    /// Send a unary request and wait for its response.
    ///
    /// Allocates the next request id in the session, so the `id` field of
    /// `request` is overwritten. The wait is bounded by the request's own
    /// timeout, or a default when it carries none.
    pub async fn send(&self, mut request: Request) -> Result<Response> {
        if request.call_type == CallType::Stream {
            return Err(GenieError::Unsupported {
                message: "streaming requests are not supported yet".into(),
            });
        }

        let last_id = self.transport.get_last_request_id(&request.session_id).await?;
        request.id = last_id + 1;

        let data = request.encode()?;
        let deadline = request
            .context
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SEND_TIMEOUT);

        debug!(
            session_id = %request.session_id,
            request_id = request.id,
            cmd = %request.cmd,
            "sending request"
        );

        let reply = tokio::time::timeout(
            deadline,
            self.transport
                .send_unary(&request.session_id, Message::new(request.id, data)),
        )
        .await
        .map_err(|_| GenieError::Timeout(deadline))??;

        Response::decode(&reply.data)
    }
}

/// Derive a session id: `YYYY_MM_DD_HH_MM-<name>`.
fn session_id_for(name: &str, when: DateTime<Utc>) -> String {
    format!("{}-{}", when.format("%Y_%m_%d_%H_%M"), name)
}

/// The configured current session wins; `GENIE_SESSION` is the fallback
/// when the configuration carries none.
fn resolve_current_session(env: Option<String>, configured: Option<String>) -> Result<String> {
    configured
        .or_else(|| env.filter(|s| !s.is_empty()))
        .ok_or_else(|| GenieError::Config {
            message: format!("no current session; set {SESSION_ENV} or create a session"),
        })
}
