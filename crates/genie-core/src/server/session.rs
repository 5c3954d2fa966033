//! Per-session request handling.
//!
//! One handler per session: it watches the session for request messages and
//! spawns a task per request so a slow command never stalls the rest of the
//! session. Requests pass the authorisation policy before anything runs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::HandlerConfig;
use crate::error::GenieError;
use crate::exec::CommandExecutor;
use crate::protocol::{CallType, Request, Response};
use crate::transport::{Message, Transport};

/// Watches one session and dispatches its requests.
#[derive(Clone)]
pub struct SessionHandler {
    session_id: String,
    transport: Arc<dyn Transport>,
    config: HandlerConfig,
    executor: Arc<dyn CommandExecutor>,
}

impl SessionHandler {
    pub fn new(
        session_id: String,
        transport: Arc<dyn Transport>,
        config: HandlerConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            session_id,
            transport,
            config,
            executor,
        }
    }

    /// Run until `shutdown` flips or the request watch closes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(session_id = %self.session_id, "session handler started");

        let mut requests = match self.transport.watch_requests(&self.session_id).await {
            Ok(requests) => requests,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "cannot watch requests");
                return;
            }
        };

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = requests.recv() => {
                    let Some(message) = next else {
                        info!(session_id = %self.session_id, "request watch closed");
                        break;
                    };
                    info!(
                        session_id = %self.session_id,
                        request_id = message.id,
                        "received request"
                    );
                    let request = match Request::decode(&message.data) {
                        Ok(request) => request,
                        Err(e) => {
                            error!(
                                session_id = %self.session_id,
                                request_id = message.id,
                                error = %e,
                                "cannot decode request"
                            );
                            continue;
                        }
                    };
                    let handler = self.clone();
                    let stop = shutdown.clone();
                    tokio::spawn(async move {
                        // Dropping the in-flight future on shutdown also
                        // kills a still-running child process.
                        tokio::select! {
                            _ = handler.handle_request(request) => {}
                            _ = wait_for_stop(stop) => {}
                        }
                    });
                }
            }
        }

        info!(session_id = %self.session_id, "session handler stopped");
    }

    async fn handle_request(&self, request: Request) {
        let timeout = effective_timeout(&self.config, &request);
        debug!(
            session_id = %self.session_id,
            request_id = request.id,
            ?timeout,
            "handling request"
        );

        if request.call_type != CallType::Unary {
            // A non-unary caller awaits no unary response envelope, so there
            // is nothing useful to publish.
            error!(
                session_id = %self.session_id,
                request_id = request.id,
                "unsupported call type"
            );
            return;
        }

        let binary = match authorize(&self.config, &request) {
            Ok(binary) => binary.to_path_buf(),
            Err(reason) => {
                self.reject(&request, reason).await;
                return;
            }
        };

        match self.executor.run(&binary, &request.args, timeout).await {
            Ok(outcome) => {
                info!(
                    session_id = %self.session_id,
                    request_id = request.id,
                    exit_code = outcome.exit_code,
                    "command finished"
                );
                self.publish(Response {
                    request_id: request.id,
                    sequence_id: 0,
                    exit_code: outcome.exit_code,
                    output: outcome.output,
                })
                .await;
            }
            Err(GenieError::Timeout(_)) => {
                // The client's own deadline covers this; an answer this late
                // would only orphan a response file.
                error!(
                    session_id = %self.session_id,
                    request_id = request.id,
                    "request timed out"
                );
            }
            Err(e) => {
                error!(
                    session_id = %self.session_id,
                    request_id = request.id,
                    error = %e,
                    "command failed to run"
                );
            }
        }
    }

    async fn reject(&self, request: &Request, reason: &str) {
        error!(
            session_id = %self.session_id,
            request_id = request.id,
            reason,
            "request rejected"
        );
        self.publish(Response::rejection(request.id, reason)).await;
    }

    async fn publish(&self, response: Response) {
        let data = match response.encode() {
            Ok(data) => data,
            Err(e) => {
                error!(
                    session_id = %self.session_id,
                    request_id = response.request_id,
                    error = %e,
                    "cannot encode response"
                );
                return;
            }
        };

        let mut message = Message::new(response.request_id, data);
        message.sequence_id = response.sequence_id;
        if let Err(e) = self.transport.send_response(&self.session_id, message).await {
            error!(
                session_id = %self.session_id,
                request_id = response.request_id,
                error = %e,
                "cannot send response"
            );
        } else {
            debug!(
                session_id = %self.session_id,
                request_id = response.request_id,
                "response sent"
            );
        }
    }
}

/// Resolve once the shutdown flag is (or becomes) `true`, or its sender is
/// gone.
async fn wait_for_stop(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// First positional arguments `kubectl` requests may carry.
const KUBECTL_ALLOWED_SUBCOMMANDS: &[&str] = &["get", "describe"];

/// Check a request against the allow-list; returns the binary to run.
///
/// The rejection reason becomes the response's `output` (prefixed with
/// `error:`), so the wording is part of the client-facing surface.
fn authorize<'a>(
    config: &'a HandlerConfig,
    request: &Request,
) -> std::result::Result<&'a Path, &'static str> {
    let Some(binary) = config.binaries.get(&request.cmd) else {
        return Err("unsupported command");
    };

    if request.cmd == "kubectl" {
        let Some(first) = request.args.first() else {
            return Err("auth: invalid args");
        };
        if !KUBECTL_ALLOWED_SUBCOMMANDS.contains(&first.as_str()) {
            return Err("auth: command not allowed");
        }
    }

    Ok(binary)
}

/// The tighter of the request's own timeout and the configured budget.
fn effective_timeout(config: &HandlerConfig, request: &Request) -> Duration {
    let configured = config.timeout_for(request.call_type);
    match request.context.timeout {
        Some(ms) if ms > 0 => configured.min(Duration::from_millis(ms)),
        _ => configured,
    }
}
