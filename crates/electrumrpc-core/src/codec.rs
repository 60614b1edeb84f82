//! Request encoding and response/notification decoding.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, RpcError};
use crate::method::Method;
use crate::request::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, RpcId};

/// Encode `method` as a JSON-RPC request frame with the given id.
pub fn encode_request<M: Method + ?Sized>(id: &RpcId, method: &M) -> Result<String> {
    encode_raw(id, method.path(), method.params())
}

/// Encode an arbitrary method path and parameter list.
pub fn encode_raw(id: &RpcId, path: &str, params: Vec<Value>) -> Result<String> {
    let req = JsonRpcRequest::new(id.clone(), path, params);
    serde_json::to_string(&req).map_err(|e| RpcError::Encode {
        method: path.to_string(),
        reason: e.to_string(),
    })
}

/// Decode a unary response frame into `T`.
///
/// A present `error` object wins over `result`. A `result` of `null` is a
/// value, not an empty response.
pub fn decode_response<T: DeserializeOwned>(raw: &str, path: &str) -> Result<T> {
    let frame: Value = serde_json::from_str(raw).map_err(|e| decode_error(path, raw, e))?;
    let Value::Object(mut obj) = frame else {
        return Err(decode_error(path, raw, "response is not a JSON object"));
    };

    if let Some(err) = obj.remove("error").filter(|e| !e.is_null()) {
        let err: JsonRpcError =
            serde_json::from_value(err).map_err(|e| decode_error(path, raw, e))?;
        let id = obj
            .get("id")
            .and_then(|v| serde_json::from_value::<RpcId>(v.clone()).ok())
            .map(|id| id.to_string());
        return Err(RpcError::Rpc {
            id,
            code: err.code,
            message: err.message,
        });
    }

    let Some(result) = obj.remove("result") else {
        return Err(RpcError::EmptyResponse {
            method: path.to_string(),
        });
    };
    serde_json::from_value(result).map_err(|e| decode_error(path, raw, e))
}

/// Decode the `params` of a push notification frame into `T`.
pub fn decode_notification<T: DeserializeOwned>(raw: &str, path: &str) -> Result<T> {
    let frame: JsonRpcNotification =
        serde_json::from_str(raw).map_err(|e| decode_error(path, raw, e))?;
    serde_json::from_value(frame.params).map_err(|e| decode_error(path, raw, e))
}

fn decode_error(path: &str, raw: &str, reason: impl std::fmt::Display) -> RpcError {
    RpcError::Decode {
        method: path.to_string(),
        payload_bytes: raw.len(),
        reason: reason.to_string(),
    }
}
