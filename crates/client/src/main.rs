//! chatsync-tail - follow the push stream from the command line.
//!
//! Opens the firehose (and any conversation ids given as arguments) and logs
//! every event until interrupted.
//!
//! Environment:
//! - `CHATSYNC_ENDPOINT` (required): `ws://` or `wss://` origin
//! - `CHATSYNC_TOKEN` (required): session credential
//! - `CHATSYNC_IDENTITY`: user id for the session
//! - plus everything `SyncConfig::from_env` reads

use std::sync::Arc;

use anyhow::Context;
use chatsync_client::dispatch::{EventFilter, SyncEvent};
use chatsync_client::ws::TungsteniteConnector;
use chatsync_client::{logging, Credential, Session, SyncClient, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let endpoint = std::env::var("CHATSYNC_ENDPOINT").context("CHATSYNC_ENDPOINT is not set")?;
    let token = std::env::var("CHATSYNC_TOKEN").context("CHATSYNC_TOKEN is not set")?;
    let session = match std::env::var("CHATSYNC_IDENTITY") {
        Ok(user_id) => Session::authenticated(user_id, Some(token.clone())),
        Err(_) => Session::new(),
    };

    let config = SyncConfig::from_env();
    let client = SyncClient::with_http(config, session, Arc::new(TungsteniteConnector))
        .context("failed to build mutation transport")?;

    let _tail = client
        .dispatcher()
        .subscribe(EventFilter::all(), |event| {
            match event {
                SyncEvent::Inbound { channel, event } => {
                    tracing::info!(%channel, ?event, "event");
                }
                SyncEvent::Lifecycle { channel, event } => {
                    tracing::info!(%channel, ?event, "lifecycle");
                }
            }
            Ok(())
        })
        .into_guard();

    client
        .connect(&endpoint, Credential::new(token))
        .context("failed to open firehose")?;

    let mut conversations = Vec::new();
    for id in std::env::args().skip(1) {
        let handle = client
            .connections()
            .open_conversation(&id)
            .with_context(|| format!("failed to open conversation {id}"))?;
        conversations.push(handle);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    for handle in conversations {
        handle.close();
    }
    client.shutdown().await;

    let stats = client.dispatcher().stats();
    tracing::info!(
        published = stats.published,
        delivered = stats.delivered,
        malformed = stats.malformed,
        handler_failures = stats.handler_failures,
        "done"
    );
    Ok(())
}
