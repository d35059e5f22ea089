pub mod openai;
pub mod session;

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Ids assigned by the realtime endpoint carry this prefix; anything else
/// was minted locally.
pub const SERVER_EVENT_ID_PREFIX: &str = "event_";

pub const ASSISTANT_AUDIO_STARTED: &str = "output_audio_buffer.started";
pub const ASSISTANT_AUDIO_STOPPED: &str = "output_audio_buffer.stopped";

/// One record on the duplex event channel, in either direction.
///
/// `type`, `event_id` and `timestamp` are lifted out; every other field is
/// kept verbatim in `payload` so the record re-serializes losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Client,
    Server,
}

/// Coarse classification of the event types the session reacts to or the
/// console labels specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SessionCreated,
    SessionUpdated,
    ItemCreate,
    ItemCreated,
    ResponseCreate,
    ResponseDone,
    AssistantAudioStarted,
    AssistantAudioStopped,
    TranscriptDone,
    Delta,
    Error,
    Other,
}

impl RealtimeEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            event_id: None,
            timestamp: None,
            payload: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Assigns a fresh id when none was supplied and returns the id in use.
    pub fn ensure_event_id(&mut self) -> &str {
        self.event_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .as_str()
    }

    pub fn stamp_if_missing(&mut self, timestamp: String) {
        if self.timestamp.is_none() {
            self.timestamp = Some(timestamp);
        }
    }

    pub fn origin(&self) -> EventOrigin {
        match self.event_id.as_deref() {
            Some(id) if !id.starts_with(SERVER_EVENT_ID_PREFIX) => EventOrigin::Client,
            _ => EventOrigin::Server,
        }
    }

    pub fn is_delta(&self) -> bool {
        self.kind.ends_with("delta")
    }

    pub fn classify(&self) -> EventKind {
        match self.kind.as_str() {
            "session.created" => EventKind::SessionCreated,
            "session.updated" => EventKind::SessionUpdated,
            "conversation.item.create" => EventKind::ItemCreate,
            "conversation.item.created" | "conversation.item.added" => EventKind::ItemCreated,
            "response.create" => EventKind::ResponseCreate,
            "response.done" => EventKind::ResponseDone,
            ASSISTANT_AUDIO_STARTED => EventKind::AssistantAudioStarted,
            ASSISTANT_AUDIO_STOPPED => EventKind::AssistantAudioStopped,
            "response.output_audio_transcript.done"
            | "conversation.item.input_audio_transcription.completed" => EventKind::TranscriptDone,
            "error" => EventKind::Error,
            _ if self.is_delta() => EventKind::Delta,
            _ => EventKind::Other,
        }
    }

    /// Human-readable text carried by the event, if any.
    pub fn display_text(&self) -> Option<String> {
        let texts: Vec<&str> = match self.kind.as_str() {
            "response.done" => self
                .payload
                .get("response")
                .and_then(|r| r.get("output"))
                .and_then(|o| o.as_array())
                .into_iter()
                .flatten()
                .filter_map(|item| item.get("content").and_then(|c| c.as_array()))
                .flatten()
                .filter_map(|c| c.get("transcript").and_then(|t| t.as_str()))
                .collect(),
            "conversation.item.create" => self
                .payload
                .get("item")
                .and_then(|i| i.get("content"))
                .and_then(|c| c.as_array())
                .into_iter()
                .flatten()
                .filter(|c| c.get("type").and_then(|t| t.as_str()) == Some("input_text"))
                .filter_map(|c| c.get("text").and_then(|t| t.as_str()))
                .collect(),
            "response.output_audio_transcript.done"
            | "conversation.item.input_audio_transcription.completed" => self
                .payload
                .get("transcript")
                .and_then(|t| t.as_str())
                .into_iter()
                .collect(),
            "error" => self
                .payload
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .into_iter()
                .collect(),
            _ if self.is_delta() => self
                .payload
                .get("delta")
                .and_then(|d| d.as_str())
                .into_iter()
                .collect(),
            _ => Vec::new(),
        };
        if texts.is_empty() {
            None
        } else {
            Some(texts.join(" "))
        }
    }
}

/// A user-authored text turn.
pub fn user_text_message(text: &str) -> RealtimeEvent {
    RealtimeEvent::new("conversation.item.create").with(
        "item",
        json!({
            "type": "message",
            "role": "user",
            "content": [
                { "type": "input_text", "text": text },
            ],
        }),
    )
}

/// Asks the model to answer the conversation so far.
pub fn response_create() -> RealtimeEvent {
    RealtimeEvent::new("response.create")
}

/// Arrival/send time as shown in the event log.
pub fn local_timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}
