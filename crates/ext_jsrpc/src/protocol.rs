//! Wire protocol: JSON text frames tagged by `type`.
//!
//! ```text
//! {"type":"register","group":"default","name":"astracrawler"}   client → peer
//! {"type":"call","id":"1","functionName":"a.b","args":[1]}       peer → client
//! {"type":"response","id":"1","success":true,"result":42}        client → peer
//! ```

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;

use crate::JsrpcError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteMessage {
    Register { group: String, name: String },
    Call(CallRequest),
    Response(CallResponse),
}

impl RemoteMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Call(_) => "call",
            Self::Response(_) => "response",
        }
    }
}

/// Inbound call. Exactly one of `code` and `function_path` is expected;
/// the dispatcher answers anything else with a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    #[serde(deserialize_with = "call_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(
        default,
        rename = "functionName",
        alias = "function_path",
        skip_serializing_if = "Option::is_none"
    )]
    pub function_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Json>>,
}

/// Ids are strings on the wire; numeric ids are accepted and kept as their decimal text.
fn call_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Json::deserialize(deserializer)? {
        Json::String(id) => Ok(id),
        Json::Number(id) => Ok(id.to_string()),
        other => Err(de::Error::custom(format!("invalid call id: {}", other))),
    }
}

/// Outbound answer to one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl CallResponse {
    /// Success; `None` means the function returned nothing serialisable.
    pub fn ok(id: impl Into<String>, result: Option<Json>) -> Self {
        Self {
            id: id.into(),
            success: true,
            result,
            error: None,
            stack: None,
        }
    }

    pub fn fail(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolFault {
    /// Not JSON, unknown type, or a call without a usable id: drop it.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// A call whose id survived but whose body did not: answer with a failure.
    #[error("bad call {id}: {reason}")]
    BadCall { id: String, reason: String },
}

pub fn decode(text: &str) -> Result<RemoteMessage, ProtocolFault> {
    let json: Json =
        serde_json::from_str(text).map_err(|e| ProtocolFault::Malformed(e.to_string()))?;
    match RemoteMessage::deserialize(&json) {
        Ok(message) => Ok(message),
        Err(e) => match recoverable_id(&json) {
            Some(id) => Err(ProtocolFault::BadCall {
                id,
                reason: e.to_string(),
            }),
            None => Err(ProtocolFault::Malformed(e.to_string())),
        },
    }
}

fn recoverable_id(json: &Json) -> Option<String> {
    if json.get("type")?.as_str()? != "call" {
        return None;
    }
    match json.get("id")? {
        Json::String(id) => Some(id.clone()),
        Json::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

pub fn encode(message: &RemoteMessage) -> Result<String, JsrpcError> {
    Ok(serde_json::to_string(message)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_wire_shape() {
        let frame = encode(&RemoteMessage::Register {
            group: "default".into(),
            name: "astracrawler".into(),
        })
        .unwrap();
        let json: Json = serde_json::from_str(&frame).unwrap();
        assert_eq!(json, json!({"type": "register", "group": "default", "name": "astracrawler"}));
    }

    #[test]
    fn test_decode_call() {
        let message = decode(r#"{"type":"call","id":"1","functionName":"a.b.c","args":[1,"x"]}"#).unwrap();
        let RemoteMessage::Call(call) = message else {
            panic!("expected call");
        };
        assert_eq!(call.id, "1");
        assert_eq!(call.function_path.as_deref(), Some("a.b.c"));
        assert_eq!(call.args, Some(vec![json!(1), json!("x")]));
        assert!(call.code.is_none());
    }

    #[test]
    fn test_numeric_id_accepted() {
        let RemoteMessage::Call(call) = decode(r#"{"type":"call","id":17,"code":"1"}"#).unwrap() else {
            panic!("expected call");
        };
        assert_eq!(call.id, "17");
    }

    #[test]
    fn test_response_omits_absent_fields() {
        let frame = encode(&RemoteMessage::Response(CallResponse::ok("1", Some(json!(42))))).unwrap();
        let json: Json = serde_json::from_str(&frame).unwrap();
        assert_eq!(json, json!({"type": "response", "id": "1", "success": true, "result": 42}));

        let failure = CallResponse::fail("2", "boom").with_stack("Error: boom");
        let json = serde_json::to_value(RemoteMessage::Response(failure)).unwrap();
        assert_eq!(json["error"], "boom");
        assert_eq!(json["stack"], "Error: boom");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_decode_faults() {
        assert!(matches!(decode("not json"), Err(ProtocolFault::Malformed(_))));
        assert!(matches!(decode(r#"{"type":"nope"}"#), Err(ProtocolFault::Malformed(_))));
        assert!(matches!(decode(r#"{"type":"call"}"#), Err(ProtocolFault::Malformed(_))));
        assert!(matches!(
            decode(r#"{"type":"call","id":"9","functionName":5}"#),
            Err(ProtocolFault::BadCall { ref id, .. }) if id == "9"
        ));
        let Err(ProtocolFault::BadCall { id, .. }) = decode(r#"{"type":"call","id":9,"args":"x"}"#) else {
            panic!("expected bad call");
        };
        assert_eq!(id, "9");
    }
}
