use anyhow::Result;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub mod guarded;
pub mod provider;

pub use guarded::open_stream;
pub use provider::{GeminiClient, LlmClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One piece of a conversation turn. Tool results ride on a `user` turn per
/// the provider's multi-turn convention, see [`ChatTurn::tool_result`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Part {
    Text {
        text: String,
    },
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        name: String,
        payload: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl ChatTurn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::ToolCall {
                name: name.into(),
                arguments,
            }],
        }
    }

    /// Tool results are injected as a `user` turn; the provider treats the
    /// function response as coming from the caller side of the conversation.
    pub fn tool_result(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::ToolResult {
                name: name.into(),
                payload,
            }],
        }
    }
}

/// A named side-effecting operation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One incremental fragment of a streaming generation.
#[derive(Debug, Clone, Default)]
pub struct LlmChunk {
    pub parts: Vec<Part>,
}

impl LlmChunk {
    /// Concatenated text content of this chunk, skipping non-text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}

/// Aggregate of a fully drained stream: the spoken text plus at most one
/// tool call.
#[derive(Debug, Clone)]
pub struct TerminalResponse {
    pub text: String,
    pub tool_call: Option<ToolCall>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<LlmChunk>> + Send>>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("generation cancelled")]
    Cancelled,
    #[error("no initial response from the model within {0:?}")]
    TimedOut(Duration),
    #[error("model provider error: {0}")]
    Provider(#[from] anyhow::Error),
}

impl StreamError {
    /// Timeouts are reported to callers exactly like a barge-in: roll back
    /// and stay silent.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut(_))
    }
}

/// Handle over one streaming generation. The chunk sequence is finite and
/// non-restartable; the terminal aggregate is available once the stream has
/// been drained.
pub struct StreamHandle {
    chunks: ChunkStream,
    text: String,
    tool_call: Option<ToolCall>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("chunks", &"<ChunkStream>")
            .field("text", &self.text)
            .field("tool_call", &self.tool_call)
            .finish()
    }
}

impl StreamHandle {
    pub fn new(chunks: ChunkStream) -> Self {
        Self {
            chunks,
            text: String::new(),
            tool_call: None,
        }
    }

    /// Pull the next chunk, folding its content into the terminal aggregate.
    pub async fn next_chunk(&mut self) -> Option<Result<LlmChunk, StreamError>> {
        match self.chunks.next().await {
            Some(Ok(chunk)) => {
                for part in &chunk.parts {
                    match part {
                        Part::Text { text } => self.text.push_str(text),
                        Part::ToolCall { name, arguments } => {
                            self.tool_call = Some(ToolCall {
                                name: name.clone(),
                                arguments: arguments.clone(),
                            });
                        }
                        Part::ToolResult { .. } => {}
                    }
                }
                Some(Ok(chunk))
            }
            Some(Err(e)) => Some(Err(StreamError::Provider(e))),
            None => None,
        }
    }

    /// Consume the remainder of the stream and return the aggregate.
    pub async fn drain(mut self) -> Result<TerminalResponse, StreamError> {
        while let Some(chunk) = self.next_chunk().await {
            chunk?;
        }
        Ok(TerminalResponse {
            text: self.text,
            tool_call: self.tool_call,
        })
    }
}
