//! Genie core - session-scoped asynchronous RPC over a shared data plane.
//!
//! Genie lets a trusted command-line client outside an isolated compute cell
//! run a restricted set of commands inside it. The two sides share no network
//! path; they only exchange message files through a [`transport::Transport`]
//! (a mounted directory tree or an object store). Each conversation is scoped
//! to a named session.
//!
//! # Example
//!
//! ```rust,ignore
//! use genie_core::{Client, ClientConfig, Request};
//!
//! #[tokio::main]
//! async fn main() -> genie_core::Result<()> {
//!     let client = Client::new(ClientConfig::load("config.yaml".as_ref())?)?;
//!     let session_id = client.create_session("my-session").await?;
//!
//!     let response = client
//!         .send(Request {
//!             session_id,
//!             cmd: "kubectl".into(),
//!             args: vec!["get".into(), "nodes".into()],
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("{}", response.output);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod exec;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use client::{resolve_config_path, Client, ClientConfig, CONFIG_ENV, SESSION_ENV};
pub use error::{GenieError, Result};
pub use exec::{CommandExecutor, ExecOutcome, ProcessExecutor};
pub use protocol::{CallType, Request, RequestContext, Response};
pub use server::{GenieServer, HandlerConfig, ServerConfig, SessionHandler};
pub use transport::{
    DirStore, FsConfig, FsTransport, MemoryStore, Message, ObjectStore, ObjectStoreConfig,
    ObjectStoreTransport, Transport, TransportConfig,
};
