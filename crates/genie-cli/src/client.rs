//! `genie client …` commands.

use std::path::Path;

use anyhow::Context;
use genie_core::{resolve_config_path, CallType, Client, ClientConfig, Request};

/// Create a session, print its id, and persist it as the current session.
pub async fn create_session(config_arg: Option<&Path>, name: &str) -> anyhow::Result<i32> {
    if name.is_empty() {
        anyhow::bail!("session name is required but not provided");
    }

    let config_path = resolve_config_path(config_arg)?;
    let mut config = ClientConfig::load(&config_path)?;
    let client = Client::new(config.clone())?;

    let session_id = client
        .create_session(name)
        .await
        .with_context(|| format!("error creating session {name}"))?;

    // Later invocations resolve this; GENIE_SESSION only fills in when the
    // config has no current session.
    config.current_session = Some(session_id.clone());
    config.store(&config_path)?;

    println!("{session_id}");
    Ok(0)
}

/// Forward a kubectl invocation to the current session and exit with the
/// command's exit code.
pub async fn kubectl(config_arg: Option<&Path>, args: Vec<String>) -> anyhow::Result<i32> {
    let config_path = resolve_config_path(config_arg)?;
    let client = Client::load(&config_path)?;
    let session_id = client.ensure_session().await?;

    let request = Request {
        session_id: session_id.clone(),
        call_type: CallType::Unary,
        cmd: "kubectl".into(),
        args,
        ..Default::default()
    };
    let response = client
        .send(request)
        .await
        .with_context(|| format!("error sending request to session {session_id}"))?;

    if response.output.ends_with('\n') {
        print!("{}", response.output);
    } else {
        println!("{}", response.output);
    }
    Ok(response.exit_code)
}
