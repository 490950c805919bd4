use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kvs_signaling::{ChannelResolver, KinesisVideoClient};
use kvs_viewer_core::logging;
use kvs_viewer_core::{
    LoggingSurface, MediaSink, NoCapture, RtcConnector, ViewerArgs, ViewerSession,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = ViewerArgs::parse().into_config()?;
    logging::init(&config.log)?;

    info!(
        region = %config.region,
        channel = config.channel.describe(),
        client_id = %config.client_id,
        "starting viewer"
    );

    let mut api = KinesisVideoClient::new(config.signer())?;
    if let Some(endpoint) = &config.endpoint {
        api = api.with_endpoint(endpoint.clone());
    }
    let resolved = ChannelResolver::new(api, config.region.clone())
        .with_options(config.resolver_options())
        .resolve(&config.channel)
        .await
        .context("failed to resolve signaling channel")?;

    let connector = RtcConnector::new(&resolved, config.client_id.clone(), config.signer())
        .with_ice_transport_policy(config.ice_transport_policy);
    let media = MediaSink::new(Arc::new(LoggingSurface::new("remote")))
        .with_preview(Arc::new(LoggingSurface::new("preview")));
    let (mut session, handle) =
        ViewerSession::connect(&connector, media, config.session_options()).await?;

    session.start_preview(&NoCapture).await;
    session.start().await?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, hanging up");
            if let Err(err) = handle.hangup() {
                warn!(error = %err, "hangup after close");
            }
        }
    });

    session.run().await;
    info!("viewer stopped");
    Ok(())
}
