use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use crate::models::Height;

/// A positional JSON-RPC parameter. Nodes only accept integers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RpcParam {
    Int(i64),
    Str(String),
}

impl From<i64> for RpcParam {
    fn from(v: i64) -> Self {
        RpcParam::Int(v)
    }
}

impl From<&str> for RpcParam {
    fn from(v: &str) -> Self {
        RpcParam::Str(v.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: &'a [RpcParam],
    pub id: u32,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(method: &'a str, params: &'a [RpcParam]) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<JsonRpcErrorObject>,
    pub id: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Invocation/verification script pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawWitness {
    pub invocation: String,
    pub verification: String,
}

/// A block as returned by `getblock <height> 1`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBlock {
    pub hash: String,
    pub size: i64,
    pub version: i64,
    #[serde(rename = "previousblockhash", default)]
    pub previous_block_hash: String,
    #[serde(rename = "merkleroot")]
    pub merkle_root: String,
    pub time: i64,
    pub index: Height,
    pub nonce: String,
    #[serde(rename = "nextconsensus")]
    pub next_consensus: String,
    #[serde(default)]
    pub script: RawWitness,
    pub tx: Vec<RawTx>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTx {
    pub txid: String,
    pub size: i64,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub version: i64,
    #[serde(default)]
    pub attributes: Vec<RawAttribute>,
    #[serde(default)]
    pub vin: Vec<RawInput>,
    #[serde(default)]
    pub vout: Vec<RawOutput>,
    pub sys_fee: BigDecimal,
    pub net_fee: BigDecimal,
    #[serde(default)]
    pub scripts: Vec<RawWitness>,
    /// MinerTransaction only.
    pub nonce: Option<i64>,
    /// InvocationTransaction only.
    pub script: Option<String>,
    pub gas: Option<BigDecimal>,
    /// ClaimTransaction only.
    #[serde(default)]
    pub claims: Vec<RawInput>,
    /// RegisterTransaction only.
    pub asset: Option<RawAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAttribute {
    pub usage: String,
    pub data: String,
}

/// Reference to a previous output, used by both `vin` and `claims`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawInput {
    pub txid: String,
    pub vout: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawOutput {
    pub n: u32,
    pub asset: String,
    pub value: BigDecimal,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAsset {
    #[serde(rename = "type")]
    pub asset_type: String,
    pub name: Vec<RawAssetName>,
    pub amount: BigDecimal,
    pub precision: i64,
    pub owner: String,
    pub admin: String,
}

impl RawAsset {
    /// The English name when present, otherwise the first listed one.
    pub fn display_name(&self) -> String {
        self.name
            .iter()
            .find(|n| n.lang == "en")
            .or_else(|| self.name.first())
            .map(|n| n.name.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAssetName {
    pub lang: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_body_uses_positional_params() {
        let params = vec![RpcParam::from(12_i64), RpcParam::from("x")];
        let body = serde_json::to_value(JsonRpcRequest::new("getblock", &params)).unwrap();
        assert_eq!(
            body,
            json!({"jsonrpc": "2.0", "method": "getblock", "params": [12, "x"], "id": 1})
        );
    }

    #[test]
    fn decodes_a_verbose_block() {
        let raw = json!({
            "hash": "0xd42561e3d30e15be6400b6df2f328e02d2bf6354c41dce433bc57687c82144bf",
            "size": 401,
            "version": 0,
            "previousblockhash": "0x0000000000000000000000000000000000000000000000000000000000000000",
            "merkleroot": "0x803ff4abe3ea6533bcc0be574efa02f83ae8fdc651c879056b0d9be336c01bf4",
            "time": 1468595301,
            "index": 0,
            "nonce": "000000007c2bac1d",
            "nextconsensus": "APyEx5f4Zm4oCHwFWiSTaph1fPBxZacYVR",
            "script": {"invocation": "", "verification": "51"},
            "tx": [{
                "txid": "0xfb5bd72b2d6792d75dc2f1084ffa9e9f70ca85543c717a6b13d9959b452a57d6",
                "size": 10,
                "type": "MinerTransaction",
                "version": 0,
                "attributes": [],
                "vin": [],
                "vout": [],
                "sys_fee": "0",
                "net_fee": "0",
                "scripts": [],
                "nonce": 2083236893
            }, {
                "txid": "0x3631f66024ca6f5b033d7e0809eb993443374830025af904fb51b0334f127cda",
                "size": 60,
                "type": "IssueTransaction",
                "version": 0,
                "vout": [{
                    "n": 0,
                    "asset": "0xc56f33fc6ecfcd0c225c4ab356fee59390af8560be0e930faebe74a6daff7c9b",
                    "value": "100000000",
                    "address": "AQVh2pG732YvtNaxEGkQUei3YA4cvo7d2i"
                }],
                "sys_fee": "0",
                "net_fee": "0"
            }]
        });

        let block: RawBlock = serde_json::from_value(raw).unwrap();
        assert_eq!(block.index, 0);
        assert_eq!(block.tx.len(), 2);
        assert_eq!(block.tx[0].nonce, Some(2083236893));
        assert_eq!(block.tx[1].vout[0].value, BigDecimal::from(100_000_000));
        assert!(block.tx[1].vin.is_empty());
    }
}
