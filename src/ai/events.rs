//! Typed events for the per-turn response stream.
//!
//! The transport adapter encodes each event as one JSON line. Exactly one
//! terminal event (`done`, `error` or `age_verification_required`) ends a
//! turn, and it is always the last event on the stream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    ProcessingStart {
        request_id: String,
        conversation_id: Uuid,
    },
    /// Informational progress from the fan-out stage. Clients may ignore.
    Thinking {
        step: String,
        detail: String,
    },
    Classification {
        label: String,
        confidence: f32,
        layer_results: serde_json::Value,
    },
    /// Terminal: generation is suspended until the caller verifies age.
    AgeVerificationRequired {
        conversation_id: Uuid,
        endpoint_hint: String,
    },
    /// Composition summary of the assembled prompt (counts, not content).
    PromptBuilt {
        sections: usize,
        memories: usize,
        history_messages: usize,
    },
    Chunk {
        content: String,
        conversation_id: Uuid,
    },
    Done {
        conversation_id: Uuid,
    },
    Error {
        error: String,
        detail: String,
    },
}

impl ChatEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChatEvent::Done { .. }
                | ChatEvent::Error { .. }
                | ChatEvent::AgeVerificationRequired { .. }
        )
    }

    /// Encode as one newline-terminated JSON line.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","error":"internal","detail":"event encoding failed"}"#.to_string()
        });
        line.push('\n');
        line
    }
}
