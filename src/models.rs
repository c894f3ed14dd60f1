use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Orchestrator-facing types

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            query: Some(query.into()),
            session_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub session_id: String,
    pub response: String,
    pub sources: Vec<Source>,
}

/// Attribution attached to a generated answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Chunk {
        chunk: String,
    },
    Done {
        sources: Vec<Source>,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// One message of a conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub session_id: String,
    pub history: Vec<Turn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearResponse {
    pub success: bool,
    pub message: String,
}

// Article / vector store types

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub pub_date: Option<String>,
}

/// A stored document matched by a similarity query. Lives for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedItem {
    pub content: String,
    pub metadata: ArticleMetadata,
    pub distance: f32,
}

// Generation provider (OpenAI-compatible chat completions) types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

// Embedding provider types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub input: Vec<String>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub data: Vec<EmbeddingData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_wire_shape() {
        let chunk = serde_json::to_value(StreamEvent::Chunk { chunk: "Hi".into() }).unwrap();
        assert_eq!(chunk, serde_json::json!({"type": "chunk", "chunk": "Hi"}));

        let done = serde_json::to_value(StreamEvent::Done {
            sources: vec![],
            session_id: "abc".into(),
        })
        .unwrap();
        assert_eq!(done["type"], "done");
        assert_eq!(done["sessionId"], "abc");
        assert!(done["sources"].as_array().unwrap().is_empty());

        let error = serde_json::to_value(StreamEvent::Error { error: "boom".into() }).unwrap();
        assert_eq!(error, serde_json::json!({"type": "error", "error": "boom"}));
    }

    #[test]
    fn test_chat_request_accepts_missing_fields() {
        let request: ChatRequest = serde_json::from_str(r#"{"sessionId": null}"#).unwrap();
        assert!(request.query.is_none());
        assert!(request.session_id.is_none());

        let request: ChatRequest =
            serde_json::from_str(r#"{"query": "What happened?", "sessionId": "s1"}"#).unwrap();
        assert_eq!(request.query.as_deref(), Some("What happened?"));
        assert_eq!(request.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_turn_role_serialized_lowercase() {
        let turn = Turn::new(Role::Assistant, "hello");
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value["role"], "assistant");
        let back: Turn = serde_json::from_value(value).unwrap();
        assert_eq!(back, turn);
    }
}
