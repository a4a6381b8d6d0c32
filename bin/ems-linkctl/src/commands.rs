//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Command line client for Edges and backends."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use ems_link_client::{ConnectionState, Session, SessionOptions, DIRECT_EDGE_ID};
use ems_link_common::ClientConfig;
use ems_link_logging::{log_session_event, LogContext, SessionEventOutcome};
use ems_link_msg::ChannelAddress;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::info;

use crate::CredentialArgs;

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Edge id; defaults to the single Edge of a direct connection.
    #[arg(long, short = 'e')]
    edge: Option<String>,

    /// Channels as Component/Channel, e.g. _sum/GridActivePower.
    #[arg(required = true, num_args = 1..)]
    channels: Vec<ChannelAddress>,

    /// Stop after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    duration: Option<u64>,
}

#[derive(Debug, Args)]
pub struct CallArgs {
    /// Edge id; defaults to the single Edge of a direct connection.
    #[arg(long, short = 'e')]
    edge: Option<String>,

    /// JSON-RPC method.
    #[arg(long, short = 'm')]
    method: String,

    /// Params as a JSON object.
    #[arg(long, default_value = "{}")]
    params: String,
}

/// Connect and authenticate, either with the supplied credentials or by
/// waiting for the remote to authenticate the connection by itself.
async fn open_session(config: &ClientConfig, credentials: &CredentialArgs) -> Result<Session> {
    let session = Session::spawn(SessionOptions::from(config));
    session
        .connect(&config.endpoint.url)
        .await
        .with_context(|| format!("unable to connect to {}", config.endpoint.url))?;

    let wait = config.timeouts.authentication;
    if let Some(token) = &credentials.token {
        session.login_with_token(token).await.context("token login failed")?;
    } else if let Some(password) = &credentials.password {
        session
            .login_with_password(credentials.username.as_deref(), password)
            .await
            .context("password login failed")?;
    } else {
        info!("no credentials given; waiting for the remote to authenticate the session");
    }
    timeout(wait, session.wait_for_state(ConnectionState::Authenticated))
        .await
        .map_err(|_| anyhow!("session not authenticated after {wait:?}"))??;

    let mode = config.endpoint.mode.as_str();
    log_session_event(
        Some(&LogContext::new().with_mode(mode)),
        "cli.session",
        "session ready",
        SessionEventOutcome::Success,
    );
    Ok(session)
}

fn edge_id(edge: Option<String>, config: &ClientConfig) -> Result<String> {
    match edge {
        Some(edge) => Ok(edge),
        None if !config.endpoint.mode.is_backend() => Ok(DIRECT_EDGE_ID.to_owned()),
        None => bail!("--edge is required in backend mode"),
    }
}

pub async fn login(config: &ClientConfig, credentials: &CredentialArgs) -> Result<()> {
    let session = open_session(config, credentials).await?;
    let token = session.cached_token().await?;
    let edges = session.devices().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "token": token, "edges": edges }))?
    );
    // No logout: the printed token must stay valid for --token.
    session.disconnect().await?;
    Ok(())
}

pub async fn watch(config: &ClientConfig, credentials: &CredentialArgs, args: WatchArgs) -> Result<()> {
    let edge = edge_id(args.edge, config)?;
    let session = open_session(config, credentials).await?;
    let mut watch = session
        .edge(edge.as_str())
        .watch_channels("ems-linkctl", args.channels)
        .await?;

    let deadline = async {
        match args.duration {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            values = watch.recv() => match values {
                Some(values) => println!("{}", serde_json::to_string(&values)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
        }
    }
    watch.close().await?;
    session.disconnect().await?;
    Ok(())
}

pub async fn call(config: &ClientConfig, credentials: &CredentialArgs, args: CallArgs) -> Result<()> {
    let params: Value = serde_json::from_str(&args.params).context("--params must be valid JSON")?;
    if !params.is_object() {
        bail!("--params must be a JSON object");
    }
    let edge = edge_id(args.edge, config)?;
    let session = open_session(config, credentials).await?;
    let result = session.edge(edge).send_request(args.method, params).await;
    session.disconnect().await?;
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
