use actix_web::web;

use super::handlers;

/// Largest accepted JSON body; `/sync` carries whole blocks
const JSON_LIMIT: usize = 4 * 1024 * 1024;

/// Configures the RPC route and the peer protocol routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().limit(JSON_LIMIT))
        .route("/rpc", web::post().to(handlers::rpc))
        .route("/fullchain", web::get().to(handlers::full_chain))
        .route("/height", web::get().to(handlers::height))
        .route("/sync", web::post().to(handlers::sync))
        .route("/add_peer", web::post().to(handlers::add_peer))
        .route("/peers", web::get().to(handlers::get_peers))
        .route("/chain", web::get().to(handlers::get_chain))
        .route("/status", web::get().to(handlers::status));
}
