use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};

use std::sync::Arc;
use std::time::Duration;

mod api;
mod blockchain;
mod config;
mod network;

use config::NodeConfig;
use network::{HttpPeerClient, PeerSet, SyncEngine};

// Open the chain from storage; balances are recomputed from the stored blocks
fn initialize_blockchain(config: &NodeConfig) -> anyhow::Result<blockchain::Blockchain> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;

    let blockchain = blockchain::Blockchain::with_storage(&config.data_dir, config.chain_params())
        .with_context(|| format!("Failed to load blockchain from {}", config.data_dir.display()))?;

    info!(
        "Loaded blockchain from storage at {} (height {}, {} pending)",
        config.data_dir.display(),
        blockchain.height(),
        blockchain.get_pending_transactions().len()
    );

    Ok(blockchain)
}

// Periodic height check against all peers, pulling when one is ahead
fn spawn_reconciler(engine: web::Data<SyncEngine>, interval: Duration) {
    actix_web::rt::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match engine.reconcile().await {
                Ok(true) => info!("Background sync adopted a longer chain"),
                Ok(false) => {}
                Err(err) => warn!("Background sync failed: {}", err),
            }
        }
    });
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::from_env().context("Invalid node configuration")?;
    let blockchain = initialize_blockchain(&config)?;

    let peers = match blockchain.storage() {
        Some(storage) => PeerSet::with_storage(config.public_url.clone(), storage.clone())
            .context("Failed to load peers")?,
        None => PeerSet::new(config.public_url.clone()),
    };

    let client = Arc::new(HttpPeerClient::new(config.peer_timeout).context("Failed to build peer HTTP client")?);
    let engine = web::Data::new(SyncEngine::new(blockchain, peers, client, config.sync_settings()));

    for peer in &config.bootstrap_peers {
        if let Err(err) = engine.add_peer(peer).await {
            warn!("Skipping bootstrap peer {}: {}", peer, err);
        }
    }

    spawn_reconciler(engine.clone(), config.sync_interval);

    info!("Starting HTTP server at http://{}:{}", config.bind_addr, config.port);

    // Start HTTP server
    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(engine.clone())
            .configure(api::configure_routes)
    })
    .bind((config.bind_addr.as_str(), config.port))?
    .run()
    .await?;

    Ok(())
}
