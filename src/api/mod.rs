// API module
//
// JSON RPC surface and the HTTP peer protocol

pub mod handlers;
pub mod routes;
pub mod rpc;

// Re-export main components for easier access
pub use routes::configure_routes;
