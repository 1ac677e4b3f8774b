use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::rpc::{dispatch, RpcError, RpcRequest};
use crate::blockchain::Block;
use crate::network::client::{AddPeerRequest, FullChain, HeightResponse};
use crate::network::peers::PeerSetError;
use crate::network::{ReceiveOutcome, SyncEngine};

/// Shared node state handed to every handler
pub type EngineData = web::Data<SyncEngine>;

/// Body of `POST /sync`: a bare block, or one wrapped as `{block}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SyncRequest {
    Wrapped { block: Block },
    Bare(Block),
}

impl SyncRequest {
    fn into_block(self) -> Block {
        match self {
            SyncRequest::Wrapped { block } | SyncRequest::Bare(block) => block,
        }
    }
}

/// Successful RPC reply
#[derive(Serialize)]
pub struct RpcResponse {
    pub result: Value,
    pub id: Value,
}

/// Failed RPC or peer call
#[derive(Serialize)]
pub struct ErrorResponse {
    /// Error kind, e.g. `ValidationError`
    pub error: String,

    /// Human-readable detail
    pub reason: String,

    #[serde(skip_serializing_if = "Value::is_null")]
    pub id: Value,
}

fn status_for(kind: &str) -> StatusCode {
    match kind {
        "ValidationError" | "InvalidParams" => StatusCode::BAD_REQUEST,
        "NotFound" | "MethodNotFound" => StatusCode::NOT_FOUND,
        "ConsensusConflict" => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: RpcError, id: Value) -> HttpResponse {
    HttpResponse::build(status_for(err.kind)).json(ErrorResponse {
        error: err.kind.to_string(),
        reason: err.reason,
        id,
    })
}

/// JSON RPC entry point
///
/// Dispatches `{method, params, id}` and answers `{result, id}` or
/// `{error, reason, id}`
pub async fn rpc(engine: EngineData, request: web::Json<RpcRequest>) -> impl Responder {
    let RpcRequest { method, params, id } = request.into_inner();
    info!("RPC method called: {}", method);

    match dispatch(&engine, &method, &params).await {
        Ok(result) => HttpResponse::Ok().json(RpcResponse { result, id }),
        Err(err) => {
            warn!("RPC {} failed: {}", method, err);
            error_response(err, id)
        }
    }
}

/// Get the full chain with its length
pub async fn full_chain(engine: EngineData) -> impl Responder {
    let chain = engine.blockchain().get_chain();

    HttpResponse::Ok().json(FullChain {
        length: chain.len(),
        chain,
    })
}

/// Get the chain length only
pub async fn height(engine: EngineData) -> impl Responder {
    HttpResponse::Ok().json(HeightResponse {
        height: engine.blockchain().height(),
    })
}

/// Receive a block from a peer
///
/// Appends it if it extends our head, otherwise pulls the longest valid chain
/// from the peer set
pub async fn sync(engine: EngineData, req: HttpRequest, body: web::Json<SyncRequest>) -> impl Responder {
    let block = body.into_inner().into_block();
    let remote = req.peer_addr().map(|addr| addr.ip());

    match engine.receive_block(block, remote).await {
        Ok(ReceiveOutcome::Appended) => HttpResponse::Ok().json(json!({ "result": "Block accepted" })),
        Ok(ReceiveOutcome::AlreadyKnown) => HttpResponse::Ok().json(json!({ "result": "Block already known" })),
        Ok(ReceiveOutcome::Replaced) => HttpResponse::Ok().json(json!({ "result": "Synced from peer" })),
        Ok(ReceiveOutcome::Rejected(reason)) => error_response(
            RpcError {
                kind: "ValidationError",
                reason,
            },
            Value::Null,
        ),
        Err(err) => error_response(err.into(), Value::Null),
    }
}

/// Register a peer URL
pub async fn add_peer(engine: EngineData, body: web::Json<AddPeerRequest>) -> impl Responder {
    match engine.add_peer(&body.url).await {
        Ok(true) => HttpResponse::Ok().json(json!({ "result": "Peer added" })),
        Ok(false) => HttpResponse::Ok().json(json!({ "result": "Peer already known" })),
        Err(err @ (PeerSetError::InvalidUrl(_) | PeerSetError::SelfAddress(_))) => {
            warn!("Rejected peer registration: {}", err);
            error_response(RpcError::invalid_params(err.to_string()), Value::Null)
        }
        Err(err) => error_response(
            RpcError {
                kind: "PersistenceError",
                reason: err.to_string(),
            },
            Value::Null,
        ),
    }
}

/// List registered peers
pub async fn get_peers(engine: EngineData) -> impl Responder {
    HttpResponse::Ok().json(engine.peers().all())
}

/// Get the chain as a bare list of blocks
pub async fn get_chain(engine: EngineData) -> impl Responder {
    HttpResponse::Ok().json(engine.blockchain().get_chain())
}

/// Sync state, height and peers
pub async fn status(engine: EngineData) -> impl Responder {
    HttpResponse::Ok().json(engine.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::blockchain::crypto::KeyPair;
    use crate::blockchain::{Blockchain, ChainParams, SignedTransaction};
    use crate::network::{HttpPeerClient, PeerSet, SyncSettings};
    use actix_web::{test, App};
    use std::sync::Arc;
    use std::time::Duration;

    fn engine(blockchain: Blockchain) -> EngineData {
        web::Data::new(SyncEngine::new(
            blockchain,
            PeerSet::new(None),
            Arc::new(HttpPeerClient::new(Duration::from_millis(200)).unwrap()),
            SyncSettings::default(),
        ))
    }

    fn call(method: &str, params: Value) -> Value {
        json!({ "method": method, "params": params, "id": 1 })
    }

    #[actix_web::test]
    async fn test_block_number_and_mining() {
        let data = engine(Blockchain::new(ChainParams::default()));
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure_routes)).await;
        let miner = KeyPair::generate();

        let req = test::TestRequest::post().uri("/rpc").set_json(call("chain_blockNumber", json!([]))).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"], "0x0");
        assert_eq!(body["id"], 1);

        let req = test::TestRequest::post()
            .uri("/rpc")
            .set_json(call("chain_mineBlock", json!([miner.address().0])))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"]["block"]["index"], 0);
        assert_eq!(body["result"]["reward"], ChainParams::default().initial_reward);

        let req = test::TestRequest::post()
            .uri("/rpc")
            .set_json(call("chain_getBalance", json!([miner.address().0])))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"], ChainParams::default().initial_reward);

        let req = test::TestRequest::get().uri("/height").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["height"], 1);
    }

    #[actix_web::test]
    async fn test_send_transaction_reports_fee() {
        let blockchain = Blockchain::new(ChainParams::default());
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        blockchain.mine_block(&[alice.address().clone()]).unwrap();
        let data = engine(blockchain.clone());
        let app = test::init_service(App::new().app_data(data).configure(configure_routes)).await;

        let req = test::TestRequest::post()
            .uri("/rpc")
            .set_json(call("wallet_register", json!([alice.public_key_hex()])))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"], alice.address().0);

        let tx = SignedTransaction::new(&alice, bob.address().clone(), 1_000).unwrap();
        let req = test::TestRequest::post()
            .uri("/rpc")
            .set_json(call("chain_sendTransaction", json!([tx])))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["result"]["txid"], tx.id().unwrap());
        assert_eq!(body["result"]["fee"], ChainParams::default().fee_for(&tx).unwrap());
        assert_eq!(blockchain.get_pending_transactions().len(), 1);
    }

    #[actix_web::test]
    async fn test_rpc_errors() {
        let data = engine(Blockchain::new(ChainParams::default()));
        let app = test::init_service(App::new().app_data(data).configure(configure_routes)).await;

        let req = test::TestRequest::post().uri("/rpc").set_json(call("chain_teleport", json!([]))).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let stranger = KeyPair::generate();
        let tx = SignedTransaction::new(&stranger, KeyPair::generate().address().clone(), 5).unwrap();
        let req = test::TestRequest::post()
            .uri("/rpc")
            .set_json(call("chain_sendTransaction", json!([tx])))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "ValidationError");
    }

    #[actix_web::test]
    async fn test_sync_accepts_both_shapes_and_is_idempotent() {
        let source = Blockchain::new(ChainParams::default());
        let miner = KeyPair::generate();
        let genesis = source.mine_block(&[miner.address().clone()]).unwrap().block;
        let next = source.mine_block(&[miner.address().clone()]).unwrap().block;

        let data = engine(Blockchain::new(ChainParams::default()));
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure_routes)).await;

        let req = test::TestRequest::post().uri("/sync").set_json(&genesis).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"], "Block accepted");

        let req = test::TestRequest::post().uri("/sync").set_json(json!({ "block": next })).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"], "Block accepted");

        let req = test::TestRequest::post().uri("/sync").set_json(&next).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"], "Block already known");

        let req = test::TestRequest::get().uri("/fullchain").to_request();
        let body: FullChain = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.length, 2);
        assert_eq!(body.chain, source.get_chain());
    }

    #[actix_web::test]
    async fn test_peer_registration_and_status() {
        let data = engine(Blockchain::new(ChainParams::default()));
        let app = test::init_service(App::new().app_data(data).configure(configure_routes)).await;

        let req = test::TestRequest::get().uri("/status").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "SOLO");

        let req = test::TestRequest::post()
            .uri("/add_peer")
            .set_json(json!({ "url": "not-a-url" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/add_peer")
            .set_json(json!({ "url": "http://10.1.1.1:8000" }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"], "Peer added");

        let req = test::TestRequest::get().uri("/peers").to_request();
        let body: Vec<String> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, vec!["http://10.1.1.1:8000"]);
    }
}
