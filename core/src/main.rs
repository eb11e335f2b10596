/// chatsync - local conversation sync node
use chatsync_core::types::Viewer;
use chatsync_core::{ui_api, Config, LocalBackend, Session, SyncController};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let data_dir = config.resolved_data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let backend = LocalBackend::open(&data_dir)
        .map_err(|e| anyhow::anyhow!("Backend error: {}", e))?
        .with_feed_capacity(config.feed_capacity);

    let session = Session::login(Viewer {
        id: config.viewer_id.clone(),
        display_name: config.viewer_name.clone(),
    })
    .map_err(|e| anyhow::anyhow!("Login failed: {}", e))?;

    let controller = SyncController::new(session, Arc::new(backend.clone()), &config);
    info!("Starting chatsync for {}", config.viewer_id);
    info!("   Data dir: {:?}", data_dir);

    // The list is usable without a feed; the subscription keeps retrying
    if let Err(e) = controller.load_conversations().await {
        warn!("Conversation list loaded without a live feed: {}", e);
    }
    info!(
        "   {} conversations, {} unread",
        controller.conversations().await.len(),
        controller.unread_total().await
    );

    let api = {
        let controller = controller.clone();
        let config = config.clone();
        tokio::spawn(async move { ui_api::start_ui_api(controller, &config).await })
    };

    tokio::select! {
        res = api => {
            match res {
                Ok(Err(e)) => return Err(anyhow::anyhow!("UI API error: {}", e)),
                Err(e) => return Err(anyhow::anyhow!("UI API task failed: {}", e)),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    controller.logout().await;
    backend.flush().await
        .map_err(|e| anyhow::anyhow!("Flush failed: {}", e))?;
    Ok(())
}
