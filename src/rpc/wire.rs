//! Wire envelope: one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;

/// A single method invocation, `method` being `<TypeName>.<MethodName>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Request {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// Completion of one request, paired by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Response {
    pub id: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Encodes a message as a newline-terminated JSON frame.
pub(crate) fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, PluginError> {
    let mut frame = serde_json::to_vec(msg).map_err(|e| PluginError::Call {
        detail: format!("encode: {e}"),
    })?;
    frame.push(b'\n');
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_roundtrip() {
        let req = Request {
            id: 7,
            method: "Greeter.Hello".to_string(),
            params: json!("world"),
        };

        let frame = encode(&req).unwrap();
        assert_eq!(*frame.last().unwrap(), b'\n');

        let parsed: Request = serde_json::from_slice(&frame).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.method, "Greeter.Hello");
        assert_eq!(parsed.params, json!("world"));
    }

    #[test]
    fn response_omits_empty_fields() {
        let resp = Response {
            id: 1,
            result: Some(json!({"ok": true})),
            error: None,
        };

        let text = String::from_utf8(encode(&resp).unwrap()).unwrap();
        assert!(!text.contains("error"));

        let parsed: Response = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.result, Some(json!({"ok": true})));
        assert_eq!(parsed.error, None);
    }
}
