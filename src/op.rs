use serde::{Deserialize, Serialize};

/// One replicated mutation record. Locally the payload is plaintext JSON; on
/// the wire it is the base64 of the sealed blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub client_id: String,
    pub table: String,
    #[serde(rename = "type")]
    pub op_type: OpType,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub timestamp: i64,
    /// Assigned only by the remote store; the total order of the log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Create,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Create => "create",
            OpType::Update => "update",
            OpType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<OpType> {
        match s {
            "create" => Some(OpType::Create),
            "update" => Some(OpType::Update),
            "delete" => Some(OpType::Delete),
            _ => None,
        }
    }
}

/// Binds a sealed payload to its op id so ciphertext cannot be replayed under
/// another operation.
pub fn payload_aad(op_id: &str) -> String {
    format!("op.payload:{op_id}")
}
