//! OpenAI-compatible chat completions adapter.
//!
//! Covers OpenAI itself plus the long tail of endpoints speaking the same
//! contract (DashScope compatible mode, vLLM, Together, Ollama, ...).
//! An instance is built per request from the credential the arbiter leased,
//! so it holds exactly one key and one endpoint.

use serde_json::Value;
use std::collections::HashMap;

use sp_domain::error::{Error, Result};
use sp_domain::stream::{BoxStream, StreamEvent, Usage};
use sp_domain::thread::{Message, Role};
use sp_domain::tool::{ToolCall, ToolDefinition};

use crate::sse::{from_reqwest, sse_event_stream};
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// `base_url` of `None` targets the official OpenAI endpoint.
    pub fn new(
        id: impl Into<String>,
        base_url: Option<&str>,
        api_key: impl Into<String>,
        request_timeout: std::time::Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: id.into(),
            base_url: base_url
                .unwrap_or(DEFAULT_OPENAI_BASE)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_wire).collect();

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_wire).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or(""),
            "content": msg.content,
        }),
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let tool_calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.call_id,
                        "type": "function",
                        "function": {
                            "name": tc.tool_name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let content = if msg.content.is_empty() {
                Value::Null
            } else {
                Value::String(msg.content.clone())
            };
            serde_json::json!({
                "role": "assistant",
                "content": content,
                "tool_calls": tool_calls,
            })
        }
        _ => serde_json::json!({
            "role": role_to_str(msg.role),
            "content": msg.content,
        }),
    }
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let call_id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let tool_name = func.get("name")?.as_str()?.to_string();
            let args_str = func.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
            let arguments: Value =
                serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall {
                call_id,
                tool_name,
                arguments,
            })
        })
        .collect()
}

fn parse_chat_response(provider: &str, body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: provider.into(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: provider.into(),
        message: "no message in choice".into(),
    })?;

    Ok(ChatResponse {
        content: message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        tool_calls: parse_tool_calls(message),
        usage: body.get("usage").and_then(parse_usage),
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mutable assembly state across SSE payloads. OpenAI only sends the tool
/// call id on the first fragment; later fragments address by choice index.
#[derive(Default)]
struct StreamState {
    index_to_call_id: HashMap<u64, String>,
}

impl StreamState {
    fn parse(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        if data.trim() == "[DONE]" {
            return vec![Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            })];
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::Json(e))],
        };

        let choice = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first());

        // Usage-only chunk (stream_options.include_usage).
        let Some(choice) = choice else {
            if let Some(usage) = v.get("usage").and_then(parse_usage) {
                return vec![Ok(StreamEvent::Done {
                    usage: Some(usage),
                    finish_reason: None,
                })];
            }
            return Vec::new();
        };

        if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            let usage = v.get("usage").and_then(parse_usage);
            return vec![Ok(StreamEvent::Done {
                usage,
                finish_reason: Some(fr.to_string()),
            })];
        }

        let delta = choice.get("delta").unwrap_or(&Value::Null);
        let mut events = Vec::new();

        if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tc_arr {
                let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);

                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    let name = tc
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    self.index_to_call_id.insert(index, id.to_string());
                    events.push(Ok(StreamEvent::ToolCallStarted {
                        call_id: id.to_string(),
                        tool_name: name.to_string(),
                    }));
                }

                if let Some(args) = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                {
                    if !args.is_empty() {
                        if let Some(call_id) = self.index_to_call_id.get(&index) {
                            events.push(Ok(StreamEvent::ToolCallDelta {
                                call_id: call_id.clone(),
                                delta: args.to_string(),
                            }));
                        }
                    }
                }
            }
            return events;
        }

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token {
                    text: text.to_string(),
                }));
            }
        }

        events
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = self.chat_url();
        let body = self.build_body(req, false);

        tracing::debug!(provider = %self.id, model = %req.model, "chat request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        let text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        let json: Value = serde_json::from_str(&text)?;
        parse_chat_response(&self.id, &json)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = self.chat_url();
        let body = self.build_body(req, true);

        tracing::debug!(provider = %self.id, model = %req.model, "chat stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        let mut state = StreamState::default();
        Ok(sse_event_stream(resp, move |data| state.parse(data)))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(
            "openai",
            None,
            "sk-test",
            std::time::Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn wire_shape_for_tool_result() {
        let msg = Message::tool_result("t-1", "tc_9", "ok");
        let v = msg_to_wire(&msg);
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "tc_9");
        assert_eq!(v["content"], "ok");
    }

    #[test]
    fn wire_shape_for_assistant_with_calls() {
        let msg = Message::assistant_with_calls(
            "t-1",
            "",
            vec![ToolCall {
                call_id: "tc_1".into(),
                tool_name: "list_dir".into(),
                arguments: serde_json::json!({"path": "/workspace"}),
            }],
        );
        let v = msg_to_wire(&msg);
        assert_eq!(v["role"], "assistant");
        assert!(v["content"].is_null());
        assert_eq!(v["tool_calls"][0]["function"]["name"], "list_dir");
        // Arguments are a JSON-encoded string on the wire.
        let args: Value =
            serde_json::from_str(v["tool_calls"][0]["function"]["arguments"].as_str().unwrap())
                .unwrap();
        assert_eq!(args["path"], "/workspace");
    }

    #[test]
    fn body_includes_tools_and_stream_options() {
        let req = ChatRequest {
            messages: vec![Message::user("t-1", "hi")],
            tools: vec![ToolDefinition {
                name: "read_file".into(),
                description: "read".into(),
                parameters: serde_json::json!({"type": "object"}),
                requires_confirmation: false,
                category: sp_domain::tool::ToolCategory::FileSystem,
            }],
            temperature: Some(0.1),
            max_tokens: Some(64),
            model: "gpt-4o".into(),
        };
        let body = provider().build_body(&req, true);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "read_file");
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn parses_full_response_with_tool_calls() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "list_dir", "arguments": "{\"path\":\".\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let resp = parse_chat_response("openai", &body).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].call_id, "call_abc");
        assert_eq!(resp.usage.unwrap().total_tokens, 15);
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn stream_state_maps_index_to_call_id() {
        let mut st = StreamState::default();

        let first = st.parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_x","function":{"name":"run_shell","arguments":""}}]}}]}"#,
        );
        assert!(matches!(
            first[0].as_ref().unwrap(),
            StreamEvent::ToolCallStarted { call_id, tool_name }
                if call_id == "call_x" && tool_name == "run_shell"
        ));

        // Later fragments address the call by index only.
        let delta = st.parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"command\":"}}]}}]}"#,
        );
        assert!(matches!(
            delta[0].as_ref().unwrap(),
            StreamEvent::ToolCallDelta { call_id, .. } if call_id == "call_x"
        ));
    }

    #[test]
    fn stream_state_handles_done_and_usage_chunk() {
        let mut st = StreamState::default();
        let done = st.parse(r#"{"choices":[{"finish_reason":"stop"}]}"#);
        assert!(matches!(
            done[0].as_ref().unwrap(),
            StreamEvent::Done { finish_reason: Some(fr), .. } if fr == "stop"
        ));

        let usage = st.parse(
            r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3,"total_tokens":10}}"#,
        );
        assert!(matches!(
            usage[0].as_ref().unwrap(),
            StreamEvent::Done { usage: Some(u), .. } if u.total_tokens == 10
        ));

        let sentinel = st.parse("[DONE]");
        assert!(matches!(sentinel[0].as_ref().unwrap(), StreamEvent::Done { .. }));
    }

    #[test]
    fn stream_state_token_delta() {
        let mut st = StreamState::default();
        let ev = st.parse(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#);
        assert!(matches!(
            ev[0].as_ref().unwrap(),
            StreamEvent::Token { text } if text == "Hel"
        ));
    }
}
