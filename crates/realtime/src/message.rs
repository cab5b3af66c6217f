use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Represents a full message received or sent over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub message_ref: Value,
}

impl RealtimeMessage {
    pub fn new(topic: &str, event: ChannelEvent, payload: Value, message_ref: Option<String>) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.as_str().to_string(),
            payload,
            message_ref: message_ref.map(Value::String).unwrap_or(Value::Null),
        }
    }

    pub fn is_event(&self, event: ChannelEvent) -> bool {
        self.event == event.as_str()
    }

    /// `phx_reply` の status フィールド
    pub fn reply_status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }
}

/// チャンネルイベント (Phoenix プロトコルのイベント名)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    PostgresChanges,
    AccessToken,
    PhoenixJoin,
    PhoenixLeave,
    PhoenixReply,
    PhoenixError,
    PhoenixClose,
    Heartbeat,
    System,
}

impl ChannelEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelEvent::PostgresChanges => "postgres_changes",
            ChannelEvent::AccessToken => "access_token",
            ChannelEvent::PhoenixJoin => "phx_join",
            ChannelEvent::PhoenixLeave => "phx_leave",
            ChannelEvent::PhoenixReply => "phx_reply",
            ChannelEvent::PhoenixError => "phx_error",
            ChannelEvent::PhoenixClose => "phx_close",
            ChannelEvent::Heartbeat => "heartbeat",
            ChannelEvent::System => "system",
        }
    }
}

impl std::fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// データベース変更の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// 購読するデータベースイベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEvent {
    All,
    Insert,
    Update,
    Delete,
}

impl DatabaseEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseEvent::All => "*",
            DatabaseEvent::Insert => "INSERT",
            DatabaseEvent::Update => "UPDATE",
            DatabaseEvent::Delete => "DELETE",
        }
    }

    pub fn accepts(&self, change: ChangeType) -> bool {
        matches!(
            (self, change),
            (DatabaseEvent::All, _)
                | (DatabaseEvent::Insert, ChangeType::Insert)
                | (DatabaseEvent::Update, ChangeType::Update)
                | (DatabaseEvent::Delete, ChangeType::Delete)
        )
    }
}

/// `postgres_changes` イベントのペイロード
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresChangePayload {
    pub schema: String,
    pub table: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
    #[serde(default)]
    pub record: Map<String, Value>,
    #[serde(default)]
    pub old_record: Map<String, Value>,
}

impl PostgresChangePayload {
    /// Extracts the change from a `postgres_changes` message payload.
    ///
    /// The server nests the change under `data`; older servers sent it flat.
    pub fn from_message_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        let data = payload.get("data").unwrap_or(payload);
        serde_json::from_value(data.clone())
    }

    /// The row a filter should be evaluated against.
    pub fn row(&self) -> &Map<String, Value> {
        match self.change_type {
            ChangeType::Delete => &self.old_record,
            _ => &self.record,
        }
    }
}
