use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use super::{ChatTurn, LlmChunk, Part, Role, StreamHandle};
use crate::config::LlmConfig;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Issue one streaming generation over the full history. The client is
    /// stateless between calls; the caller's history is authoritative.
    async fn generate_stream(&self, history: &[ChatTurn]) -> Result<StreamHandle>;
}

/// Adapter over the Gemini streaming API, bound at construction to the
/// composed system prompt and the static tool schema. Never retries.
pub struct GeminiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    system_prompt: String,
    tools: Value,
}

impl GeminiClient {
    pub fn new(config: &LlmConfig, system_prompt: String) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone().unwrap_or_default(),
            system_prompt,
            tools: crate::tools::function_declarations(),
        }
    }

    fn request_body(&self, history: &[ChatTurn]) -> Value {
        let contents: Vec<Value> = history.iter().map(content_json).collect();
        json!({
            "systemInstruction": { "parts": [{ "text": self.system_prompt }] },
            "contents": contents,
            "tools": [{ "functionDeclarations": self.tools }],
        })
    }
}

fn content_json(turn: &ChatTurn) -> Value {
    let role = match turn.role {
        Role::User => "user",
        Role::Model => "model",
    };
    let parts: Vec<Value> = turn
        .parts
        .iter()
        .map(|part| match part {
            Part::Text { text } => json!({ "text": text }),
            Part::ToolCall { name, arguments } => {
                json!({ "functionCall": { "name": name, "args": arguments } })
            }
            Part::ToolResult { name, payload } => {
                json!({ "functionResponse": { "name": name, "response": payload } })
            }
        })
        .collect();
    json!({ "role": role, "parts": parts })
}

/// Map one SSE `data:` payload to a chunk. Payloads without usable parts
/// (keep-alives, usage metadata) map to `None`.
fn parse_sse_data(data: &str) -> Option<LlmChunk> {
    let value: Value = serde_json::from_str(data).ok()?;
    let parts = value["candidates"][0]["content"]["parts"].as_array()?;
    let mut chunk = LlmChunk::default();
    for part in parts {
        if let Some(text) = part["text"].as_str() {
            chunk.parts.push(Part::Text {
                text: text.to_string(),
            });
        } else if let Some(call) = part.get("functionCall") {
            let name = call["name"].as_str().unwrap_or_default().to_string();
            chunk.parts.push(Part::ToolCall {
                name,
                arguments: call.get("args").cloned().unwrap_or(json!({})),
            });
        }
    }
    if chunk.parts.is_empty() {
        return None;
    }
    Some(chunk)
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate_stream(&self, history: &[ChatTurn]) -> Result<StreamHandle> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        let res = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(history))
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(anyhow!("model request failed: {}", res.status()));
        }

        let stream = res.bytes_stream();
        let chunks = async_stream::stream! {
            let mut buffer = String::new();
            for await bytes in stream {
                match bytes {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(line_end) = buffer.find('\n') {
                            let line = buffer[..line_end].trim();
                            if line.starts_with("data:") {
                                let data = line[5..].trim();
                                if let Some(chunk) = parse_sse_data(data) {
                                    yield Ok(chunk);
                                }
                            }
                            buffer.drain(..=line_end);
                        }
                    }
                    Err(e) => yield Err(anyhow!(e)),
                }
            }
        };

        Ok(StreamHandle::new(Box::pin(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_text_chunk() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"We're open "}]}}]}"#;
        let chunk = parse_sse_data(data).unwrap();
        assert_eq!(chunk.text(), "We're open ");
    }

    #[test]
    fn parses_function_call_chunk() {
        let data = r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"place_order","args":{"items":[]}}}]}}]}"#;
        let chunk = parse_sse_data(data).unwrap();
        match &chunk.parts[0] {
            Part::ToolCall { name, arguments } => {
                assert_eq!(name, "place_order");
                assert_eq!(arguments["items"], json!([]));
            }
            other => panic!("unexpected part: {:?}", other),
        }
    }

    #[test]
    fn empty_or_malformed_payloads_are_skipped() {
        assert!(parse_sse_data("not json").is_none());
        assert!(parse_sse_data(r#"{"usageMetadata":{"totalTokenCount":12}}"#).is_none());
        assert!(parse_sse_data(r#"{"candidates":[{"content":{"parts":[]}}]}"#).is_none());
    }

    #[test]
    fn history_maps_to_provider_contents() {
        let config = LlmConfig::default();
        let client = GeminiClient::new(&config, "persona".to_string());
        let history = vec![
            ChatTurn::user_text("Show me the menu."),
            ChatTurn::tool_call("get_menu", json!({})),
            ChatTurn::tool_result("get_menu", json!({"menu": "Bulgogi $18"})),
        ];
        let body = client.request_body(&history);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "persona");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(
            body["contents"][1]["parts"][0]["functionCall"]["name"],
            "get_menu"
        );
        assert_eq!(body["contents"][2]["role"], "user");
        assert_eq!(
            body["contents"][2]["parts"][0]["functionResponse"]["response"]["menu"],
            "Bulgogi $18"
        );
    }
}
