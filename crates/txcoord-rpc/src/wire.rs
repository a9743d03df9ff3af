// Request bodies and reply envelopes for the admin command endpoints
//
// Every reply is a JSON object with `ok: 1` on success or
// `{ok: 0, code, codeName, errmsg}` on failure.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};

use txcoord_core::{
    CoordinatorKey, ErrorCode, LogicalSessionId, LogicalTimestamp, OpId, ShardId, Status, TxnNumber,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinateCommitRequest {
    pub lsid: LogicalSessionId,
    pub txn_number: TxnNumber,
    pub participants: Vec<ShardId>,
}

/// Body of prepareTransaction and abortTransaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxnRequest {
    pub lsid: LogicalSessionId,
    pub txn_number: TxnNumber,
}

impl TxnRequest {
    pub fn key(&self) -> CoordinatorKey {
        CoordinatorKey::new(self.lsid, self.txn_number)
    }
}

impl From<&CoordinatorKey> for TxnRequest {
    fn from(key: &CoordinatorKey) -> Self {
        TxnRequest { lsid: key.lsid, txn_number: key.txn_number }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub lsid: LogicalSessionId,
    pub txn_number: TxnNumber,
    pub commit_timestamp: LogicalTimestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertRequest {
    pub lsid: LogicalSessionId,
    pub txn_number: TxnNumber,
    pub ns: String,
    pub documents: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindRequest {
    pub ns: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillOpRequest {
    pub op: OpId,
}

pub fn parse_body<T: DeserializeOwned>(command: &str, body: Value) -> Result<T, Status> {
    serde_json::from_value(body).map_err(|e| {
        Status::new(ErrorCode::FailedToParse, format!("invalid {} request: {}", command, e))
    })
}

/// Reply payload for `value`; a value that cannot be encoded is an InternalError
pub fn encode_body<T: Serialize>(command: &str, value: &T) -> Result<Value, Status> {
    serde_json::to_value(value).map_err(|e| {
        Status::new(ErrorCode::InternalError, format!("failed to encode {} reply: {}", command, e))
    })
}

/// `{ok: 1}` merged with the fields of `fields`, which must be an object or null
pub fn ok_reply(fields: Value) -> Value {
    let mut reply = match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    reply.insert("ok".to_string(), json!(1));
    Value::Object(reply)
}

pub fn error_reply(status: &Status) -> Value {
    json!({
        "ok": 0,
        "code": status.code.code(),
        "codeName": status.code.name(),
        "errmsg": status.reason,
    })
}

pub fn into_reply(result: Result<Value, Status>) -> Value {
    match result {
        Ok(fields) => ok_reply(fields),
        Err(status) => error_reply(&status),
    }
}

/// Split a reply into its payload or the error it carries
pub fn reply_to_result(reply: Value) -> Result<Value, Status> {
    let ok = reply.get("ok").and_then(Value::as_f64).unwrap_or(0.0);
    if ok >= 1.0 {
        return Ok(reply);
    }
    let code = reply
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok())
        .map(ErrorCode::from_code)
        .unwrap_or(ErrorCode::InternalError);
    let errmsg = reply
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or("command failed without an error message");
    Err(Status::new(code, errmsg))
}
