//! JSON-RPC 2.0 message shapes. Grounded on
//! `original_source/not_my_board/_jsonrpc/_protocol.py`'s `Request`/
//! `Response`/`ErrorResponse` dataclasses, generalized per spec.md §4.1.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CODE_INTERNAL_ERROR: i64 = -32603;
pub const CODE_PARSE_ERROR: i64 = -32700;
pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;

/// A JSON-RPC id: either a string or a number, never absent on a
/// Response/ErrorResponse and optional on a Request (absent => notification).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Num(i64),
    Str(String),
}

/// Request params: either positional (`args`) or keyword (`kwargs`), never
/// both non-empty (enforced by the caller, see `Channel::call`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Array(Vec<Value>),
    Object(serde_json::Map<String, Value>),
}

impl Default for Params {
    fn default() -> Self {
        Params::Array(Vec::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    pub method: String,
    #[serde(default)]
    pub params: Params,
}

impl Request {
    pub fn to_bytes(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            jsonrpc: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            id: &'a Option<Id>,
            method: &'a str,
            params: &'a Params,
        }
        serde_json::to_vec(&Envelope {
            jsonrpc: "2.0",
            id: &self.id,
            method: &self.method,
            params: &self.params,
        })
        .expect("Request is always serializable")
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub id: Id,
    pub result: Value,
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            jsonrpc: &'static str,
            id: &'a Id,
            result: &'a Value,
        }
        serde_json::to_vec(&Envelope {
            jsonrpc: "2.0",
            id: &self.id,
            result: &self.result,
        })
        .expect("Response is always serializable")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub id: Id,
    pub error: ErrorObject,
}

impl ErrorResponse {
    pub fn new(id: Id, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            error: ErrorObject { code, message: message.into(), data: None },
        }
    }

    pub fn with_traceback(id: Id, code: i64, message: impl Into<String>, traceback: String) -> Self {
        Self {
            id,
            error: ErrorObject {
                code,
                message: message.into(),
                data: Some(serde_json::json!({ "traceback": traceback })),
            },
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            jsonrpc: &'static str,
            id: &'a Id,
            error: &'a ErrorObject,
        }
        serde_json::to_vec(&Envelope {
            jsonrpc: "2.0",
            id: &self.id,
            error: &self.error,
        })
        .expect("ErrorResponse is always serializable")
    }
}

/// A message parsed off the wire, before it is known to be one of the three
/// shapes: still tagged with whatever partial identification we could infer,
/// for the parse-error policy in spec.md §4.1.
pub enum Incoming {
    Request(Request),
    Response(Response),
    Error(ErrorResponse),
}

/// What we learned about a message that failed to parse fully, needed to
/// decide how to report the failure (spec.md §4.1 "Parse-error policy").
#[derive(Debug, Default, Clone)]
pub struct PartialInfo {
    pub id: Option<Id>,
    pub is_request: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Protocol(String),
}

/// Parses a raw JSON-RPC message, recording what we could determine about
/// its identity in `info` even on failure, per spec.md's parse-error policy.
pub fn parse_message(raw: &[u8], info: &mut PartialInfo) -> Result<Incoming, ParseError> {
    let value: Value = serde_json::from_slice(raw)?;
    let obj = value
        .as_object()
        .ok_or_else(|| ParseError::Protocol("message must be a JSON object".into()))?;

    if let Some(id_value) = obj.get("id") {
        if !id_value.is_null() {
            let id: Id = serde_json::from_value(id_value.clone())
                .map_err(|_| ParseError::Protocol("\"id\" must be a string or number".into()))?;
            info.id = Some(id);
        }
    }

    if let Some(method) = obj.get("method") {
        info.is_request = true;
        let method = method
            .as_str()
            .ok_or_else(|| ParseError::Protocol("\"method\" must be a string".into()))?
            .to_string();

        let params = match obj.get("params") {
            None => Params::Array(Vec::new()),
            Some(Value::Array(items)) => Params::Array(items.clone()),
            Some(Value::Object(map)) => Params::Object(map.clone()),
            Some(_) => {
                return Err(ParseError::Protocol(
                    "\"params\" must be a structured value".into(),
                ))
            }
        };

        return Ok(Incoming::Request(Request { id: info.id.clone(), method, params }));
    }

    let id = info
        .id
        .clone()
        .ok_or_else(|| ParseError::Protocol("\"id\" is required".into()))?;

    if let Some(error) = obj.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .ok_or_else(|| ParseError::Protocol("\"error.code\" must be an integer".into()))?;
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::Protocol("\"error.message\" must be a string".into()))?
            .to_string();
        let data = error.get("data").cloned();
        return Ok(Incoming::Error(ErrorResponse { id, error: ErrorObject { code, message, data } }));
    }

    let result = obj
        .get("result")
        .cloned()
        .ok_or_else(|| ParseError::Protocol("missing \"result\"".into()))?;
    Ok(Incoming::Response(Response { id, result }))
}
