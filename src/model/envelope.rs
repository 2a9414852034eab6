//! Bus envelopes
//!
//! The bus carries an outer `{type, content, sender}` frame whose `content` is
//! itself a JSON document `{msgType, msgId, payload}`. Outbound frames are a
//! fan-out descriptor `{roomIds, names, tags, content}`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

/// Heartbeat request sent by the relay backend.
pub const HEARTBEAT: &str = "base@heartbeat";

/// Suffix appended to a request `msgType` to form its reply type.
pub const ANSWER_SUFFIX: &str = "Answer";

/// Reply type for a request type: `httpRelay@getFileInfo` becomes
/// `httpRelay@getFileInfoAnswer`.
pub fn answer_type(request: &str) -> String {
    format!("{request}{ANSWER_SUFFIX}")
}

/// A frame received from the bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiveMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender: String,
}

impl ReceiveMessage {
    /// Decode the inner `{msgType, msgId, payload}` document.
    pub fn decode_content(&self) -> Result<MessageContent, serde_json::Error> {
        serde_json::from_str(&self.content)
    }
}

/// A frame sent to the bus. Targets are a union selector: the backend
/// delivers to every recipient matched by any of the lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(default)]
    pub room_ids: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub content: String,
}

impl SendMessage {
    /// Address raw content to a single named recipient.
    pub fn to_name(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
            content: content.into(),
            ..Default::default()
        }
    }

    /// Encode `content` and address it to a single named recipient.
    pub fn encode_to(name: &str, content: &MessageContent) -> Result<Self, serde_json::Error> {
        Ok(Self::to_name(name, serde_json::to_string(content)?))
    }
}

/// The inner document of every bus frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub msg_type: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub msg_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl MessageContent {
    pub fn new(msg_type: impl Into<String>, msg_id: impl Into<String>, payload: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            msg_id: msg_id.into(),
            payload,
        }
    }
}

/// Status document carried in the payload of every relay reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub code: u16,
    pub msg: String,
    #[serde(default = "empty_data")]
    pub data: Value,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            code: 200,
            msg: "ok".to_string(),
            data: empty_data(),
        }
    }

    pub fn ok_with(data: Value) -> Self {
        Self { data, ..Self::ok() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            code: 404,
            msg: msg.into(),
            data: empty_data(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 200
    }
}

fn empty_data() -> Value {
    Value::Array(vec![])
}

/// Build the automatic reply to a heartbeat, if `message` is one.
///
/// The reply goes back to the sender and echoes `msgId` exactly as it was
/// received (string or number). Anything that is not a JSON object with a
/// matching `msgType` yields `None`.
pub fn heartbeat_answer(message: &ReceiveMessage) -> Option<SendMessage> {
    let content: Value = serde_json::from_str(&message.content).ok()?;
    let object = content.as_object()?;
    if object.get("msgType")?.as_str()? != HEARTBEAT {
        return None;
    }

    let msg_id = object.get("msgId").cloned().unwrap_or_else(|| json!(""));
    let answer = json!({ "msgType": answer_type(HEARTBEAT), "msgId": msg_id });
    Some(SendMessage::to_name(message.sender.clone(), answer.to_string()))
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}
