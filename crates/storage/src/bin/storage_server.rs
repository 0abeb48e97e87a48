//! Storage server binary: one shard, served over the wire protocol (§4.4).
use noema_storage::config::NodeConfig;
use noema_storage::event_emitter::StorageEventEmitter;
use noema_storage::store::Store;
use noema_storage::tcp_server::ShardServer;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).init();

    let config = NodeConfig::from_env()?;
    info!(listen_addr = %config.listen_addr, storage_path = %config.storage_path.display(), "starting storage node");

    let store = Arc::new(Store::open(config.store_config())?);
    let events = Arc::new(StorageEventEmitter::with_endpoint(
        config.listen_addr.to_string(),
        config.event_storage_addr.clone(),
    ));

    let listener = TcpListener::bind(config.listen_addr).await?;
    let server = Arc::new(ShardServer::new(store.clone(), events, config.clone()));

    let checkpoint_store = store.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            if checkpoint_store.should_checkpoint() {
                if let Err(e) = checkpoint_store.checkpoint() {
                    tracing::error!(error = %e, "checkpoint failed");
                }
            }
        }
    });

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    store.checkpoint()?;
    Ok(())
}
