use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RemoteError;

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn call(id: u64, method: &'a str, params: Value) -> Self {
        Self { jsonrpc: "2.0", id: Some(id), method, params }
    }

    pub fn notification(method: &'a str, params: Value) -> Self {
        Self { jsonrpc: "2.0", id: None, method, params }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn answers(&self, id: u64) -> bool {
        self.id.as_ref().and_then(Value::as_u64) == Some(id)
    }

    pub fn into_result(self, service: &str) -> Result<Value, RemoteError> {
        if let Some(error) = self.error {
            return Err(RemoteError::Rpc {
                service: service.to_string(),
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Decodes the response to request `id` from either a plain JSON body or a
/// `text/event-stream` body carrying JSON in `data:` lines.
pub fn decode_body(service: &str, content_type: &str, body: &str, id: u64) -> Result<Value, RemoteError> {
    if content_type.starts_with("text/event-stream") {
        let response = body
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .filter_map(|data| serde_json::from_str::<JsonRpcResponse>(data.trim()).ok())
            .find(|response| response.answers(id))
            .ok_or_else(|| RemoteError::InvalidResponse {
                service: service.to_string(),
                message: format!("event stream carried no response for request {id}"),
            })?;
        return response.into_result(service);
    }

    serde_json::from_str::<JsonRpcResponse>(body)
        .map_err(|error| RemoteError::InvalidResponse {
            service: service.to_string(),
            message: error.to_string(),
        })?
        .into_result(service)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::decode_body;
    use crate::RemoteError;

    #[test]
    fn decodes_plain_json_result() {
        let body = r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[]}}"#;
        let value = decode_body("files", "application/json", body, 3).expect("result");
        assert_eq!(value, json!({"tools": []}));
    }

    #[test]
    fn picks_matching_response_out_of_event_stream() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n\n";
        let value = decode_body("files", "text/event-stream", body, 7).expect("result");
        assert_eq!(value, json!({"ok": true}));
    }

    #[test]
    fn rpc_error_is_surfaced() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such method"}}"#;
        let error = decode_body("files", "application/json", body, 1).expect_err("rpc error");
        assert!(matches!(error, RemoteError::Rpc { code: -32601, .. }));
    }

    #[test]
    fn malformed_body_is_invalid_response() {
        let error = decode_body("files", "application/json", "<html>", 1).expect_err("invalid");
        assert!(matches!(error, RemoteError::InvalidResponse { .. }));
    }
}
