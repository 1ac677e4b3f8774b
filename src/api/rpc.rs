use actix_web::web;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::blockchain::{Address, BlockchainError, SignedTransaction};
use crate::network::SyncEngine;

/// Body of `POST /rpc`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,

    #[serde(default)]
    pub params: Value,

    #[serde(default)]
    pub id: Value,
}

/// A failed call, reported as `{error: kind, reason}`
#[derive(Debug, Error)]
#[error("{kind}: {reason}")]
pub struct RpcError {
    pub kind: &'static str,
    pub reason: String,
}

impl RpcError {
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        RpcError {
            kind: "InvalidParams",
            reason: reason.into(),
        }
    }

    fn method_not_found(method: &str) -> Self {
        RpcError {
            kind: "MethodNotFound",
            reason: format!("Method not found: {}", method),
        }
    }
}

impl From<BlockchainError> for RpcError {
    fn from(err: BlockchainError) -> Self {
        RpcError {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}

/// Positional parameter `index`, or field `name` when params is an object.
/// A bare non-array value stands in for the first parameter.
fn param<'a>(params: &'a Value, index: usize, name: &str) -> Option<&'a Value> {
    match params {
        Value::Null => None,
        Value::Array(items) => items.get(index),
        Value::Object(fields) => fields.get(name).or(if index == 0 { Some(params) } else { None }),
        other => (index == 0).then_some(other),
    }
    .filter(|value| !value.is_null())
}

fn string_param(params: &Value, index: usize, name: &str) -> Result<String, RpcError> {
    param(params, index, name)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| RpcError::invalid_params(format!("expected string parameter `{}`", name)))
}

fn optional_string(params: &Value, index: usize, name: &str) -> Option<String> {
    param(params, index, name).and_then(Value::as_str).map(String::from)
}

/// Accepts a JSON number or a `0x`-prefixed hex string
fn number_param(params: &Value, index: usize, name: &str) -> Result<u64, RpcError> {
    let value = param(params, index, name)
        .ok_or_else(|| RpcError::invalid_params(format!("missing parameter `{}`", name)))?;

    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
    .ok_or_else(|| RpcError::invalid_params(format!("`{}` must be a non-negative integer", name)))
}

/// Miner addresses, either as one list parameter or as string parameters
fn miner_addresses(params: &Value) -> Result<Vec<Address>, RpcError> {
    let first = match params {
        Value::Object(fields) => fields.get("minerAddresses").or_else(|| fields.get("minerAddress")),
        _ => param(params, 0, "minerAddresses"),
    };

    let strings: Vec<&Value> = match first {
        Some(Value::Array(list)) => list.iter().collect(),
        Some(value @ Value::String(_)) => match params {
            Value::Array(items) => items.iter().collect(),
            _ => vec![value],
        },
        _ => return Err(RpcError::invalid_params("expected miner address or list of miner addresses")),
    };

    strings
        .into_iter()
        .map(|value| {
            value
                .as_str()
                .map(|s| Address(s.trim().to_string()))
                .ok_or_else(|| RpcError::invalid_params("miner addresses must be strings"))
        })
        .collect()
}

/// Executes one RPC call against the node
pub async fn dispatch(engine: &web::Data<SyncEngine>, method: &str, params: &Value) -> Result<Value, RpcError> {
    let blockchain = engine.blockchain();

    match method {
        "chain_blockNumber" => Ok(json!(format!("0x{:x}", blockchain.height()))),

        "chain_mineBlock" => {
            let miners = miner_addresses(params)?;
            let worker = blockchain.clone();
            let mined = web::block(move || worker.mine_block(&miners))
                .await
                .map_err(|e| RpcError {
                    kind: "InternalError",
                    reason: e.to_string(),
                })??;

            engine.broadcast(&mined.block, None).await;
            Ok(json!(mined))
        }

        "chain_getBalance" => {
            let address = string_param(params, 0, "address")?;
            Ok(json!(blockchain.balance_of(&Address(address))))
        }

        "chain_sendTransaction" => {
            let raw = param(params, 0, "transaction")
                .ok_or_else(|| RpcError::invalid_params("missing transaction"))?;
            let transaction: SignedTransaction = serde_json::from_value(raw.clone())
                .map_err(|e| RpcError::invalid_params(format!("malformed transaction: {}", e)))?;

            info!("Received transaction from {} to {}", transaction.from, transaction.data.to);
            let (txid, fee) = blockchain.add_transaction(transaction)?;
            Ok(json!({ "txid": txid, "fee": fee }))
        }

        "chain_getBlockByNumber" => {
            let index = number_param(params, 0, "number")?;
            blockchain
                .get_block(index)
                .map(|block| json!(block))
                .ok_or_else(|| BlockchainError::NotFound(format!("block {}", index)).into())
        }

        "chain_getTransaction" => {
            let id = string_param(params, 0, "txid")?;
            blockchain
                .find_transaction(&id)
                .map(|location| json!(location))
                .ok_or_else(|| BlockchainError::NotFound(format!("transaction {}", id)).into())
        }

        "chain_pendingTransactions" => Ok(json!(blockchain.get_pending_transactions())),

        "chain_getSupply" => Ok(json!({
            "circulating": blockchain.circulating_supply(),
            "max": blockchain.params().max_supply,
        })),

        "chain_validate" => {
            let worker = blockchain.clone();
            let valid = web::block(move || worker.is_valid()).await.map_err(|e| RpcError {
                kind: "InternalError",
                reason: e.to_string(),
            })?;
            Ok(json!(valid))
        }

        "wallet_new" => {
            let record = blockchain.create_wallet(optional_string(params, 0, "alias"))?;
            info!("Created wallet {}", record.address);
            Ok(json!({
                "address": record.address,
                "publicKey": record.public_key,
                "privateKey": record.private_key,
            }))
        }

        "wallet_register" => {
            let public_key = string_param(params, 0, "publicKey")?;
            let record = blockchain.register_wallet(&public_key, optional_string(params, 1, "alias"))?;
            Ok(json!(record.address))
        }

        "wallet_list" => Ok(json!(blockchain.list_wallets())),

        "wallet_sendTransaction" => {
            let from = Address(string_param(params, 0, "from")?);
            let to = Address(string_param(params, 1, "to")?);
            let value = number_param(params, 2, "value")?;

            let (txid, fee) = blockchain.send_from_wallet(&from, to, value)?;
            Ok(json!({ "txid": txid, "fee": fee }))
        }

        other => Err(RpcError::method_not_found(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_shapes() {
        let positional = json!(["Wabc", 5]);
        let named = json!({ "address": "Wabc" });
        let bare = json!("Wabc");

        assert_eq!(string_param(&positional, 0, "address").unwrap(), "Wabc");
        assert_eq!(number_param(&positional, 1, "value").unwrap(), 5);
        assert_eq!(string_param(&named, 0, "address").unwrap(), "Wabc");
        assert_eq!(string_param(&bare, 0, "address").unwrap(), "Wabc");
        assert!(string_param(&Value::Null, 0, "address").is_err());
    }

    #[test]
    fn test_hex_numbers() {
        assert_eq!(number_param(&json!(["0x1f"]), 0, "number").unwrap(), 31);
        assert_eq!(number_param(&json!(["12"]), 0, "number").unwrap(), 12);
        assert!(number_param(&json!([-1]), 0, "number").is_err());
    }

    #[test]
    fn test_miner_address_forms() {
        let single = miner_addresses(&json!(["Wa"])).unwrap();
        let listed = miner_addresses(&json!([["Wa", "Wb"]])).unwrap();
        let spread = miner_addresses(&json!(["Wa", "Wb"])).unwrap();
        let named = miner_addresses(&json!({ "minerAddress": "Wa" })).unwrap();

        assert_eq!(single, vec![Address("Wa".into())]);
        assert_eq!(listed, spread);
        assert_eq!(named, single);
        assert!(miner_addresses(&json!([])).is_err());
    }
}
