use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::{Result, ReviewError};
use crate::transport::{
    Conversation, ExchangeRequest, Reply, RequestKind, RetryPolicy, Role, Transport, Turn,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const SUBMIT_PATCH: &str = "submit_patch";
const SUBMIT_PLAN: &str = "submit_plan";

/// HTTP chat transport. Each exchange is a single chat-completions request
/// with one forced tool; the model must answer through that tool or the call
/// fails with `ProtocolViolation`.
pub struct ApiTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    retry: RetryPolicy,
    session_id: String,
}

impl ApiTransport {
    /// Build from `OPENAI_API_KEY` / `OPENAI_BASE_URL`.
    pub fn from_env(model: &str, timeout: Duration) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ReviewError::Config("OPENAI_API_KEY is not set".into()))?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key,
            model: model.to_string(),
            timeout,
            retry: RetryPolicy::default(),
            session_id: Uuid::new_v4().to_string(),
        })
    }

    fn endpoint(&self) -> Result<Url> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| ReviewError::Config(format!("invalid OPENAI_BASE_URL: {e}")))?;
        let joined = if base.path().ends_with('/') {
            base.join("chat/completions")
        } else {
            Url::parse(&format!("{}/chat/completions", base.as_str().trim_end_matches('/')))
        };
        joined.map_err(|e| ReviewError::Config(format!("invalid endpoint: {e}")))
    }

    fn messages(&self, conversation: &Conversation, prompt: &str) -> Vec<Value> {
        let head = Turn {
            role: Role::System,
            text: conversation.system().to_string(),
            call: None,
        };

        let mut messages: Vec<Value> = std::iter::once(&head)
            .chain(conversation.window())
            .map(|turn| {
                let role = match turn.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    // One-shot tool calls carry no call id, so local apply
                    // acknowledgments travel as user content.
                    Role::Tool => "user",
                };
                // Assistant tool calls are summarized as plain content; the
                // authoritative record is re-sent by the orchestrator as needed.
                json!({ "role": role, "content": turn.text })
            })
            .collect();

        messages.push(json!({ "role": "user", "content": prompt }));
        messages
    }

    fn body(&self, conversation: &Conversation, request: &ExchangeRequest) -> Value {
        let tool = match request.kind {
            RequestKind::Patch => submit_patch_tool(),
            RequestKind::Plan => submit_plan_tool(),
        };
        let tool_name = match request.kind {
            RequestKind::Patch => SUBMIT_PATCH,
            RequestKind::Plan => SUBMIT_PLAN,
        };

        json!({
            "model": self.model,
            "messages": self.messages(conversation, &request.prompt),
            "temperature": 0,
            "tools": [tool],
            "tool_choice": { "type": "function", "function": { "name": tool_name } },
        })
    }

    async fn send_once(&self, body: &Value, cancel: &CancelToken) -> Result<ChatResponse> {
        let url = self.endpoint()?;
        let request = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .header("x-request-id", Uuid::new_v4().to_string())
            .header("x-session-id", &self.session_id)
            .json(body);

        let fut = async {
            let response = request.send().await.map_err(classify_send_error)?;
            let status = response.status();
            debug!("chat completion status: {status}");

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                let text = response.text().await.unwrap_or_default();
                return Err(ReviewError::TransportAuth(format!("{status}: {text}")));
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(ReviewError::TransportTransient(format!("{status}: {text}")));
            }

            let text = response
                .text()
                .await
                .map_err(|e| ReviewError::TransportTransient(format!("read body: {e}")))?;
            if text.trim().is_empty() {
                return Err(ReviewError::TransportTransient("empty response body".into()));
            }
            serde_json::from_str::<ChatResponse>(&text)
                .map_err(|e| ReviewError::TransportTransient(format!("unparsable response: {e}")))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ReviewError::Cancelled),
            result = tokio::time::timeout(self.timeout, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(ReviewError::TransportTimeout(self.timeout.as_secs())),
            },
        }
    }

    /// Retry transient failures with backoff, bounded by both the retry
    /// count and the policy's wall-clock ceiling.
    async fn send_with_retry(&self, body: &Value, cancel: &CancelToken) -> Result<ChatResponse> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            cancel.check()?;
            match self.send_once(body, cancel).await {
                Ok(response) => return Ok(response),
                Err(e @ (ReviewError::TransportTransient(_) | ReviewError::TransportTimeout(_))) => {
                    let budget_left = attempt < self.retry.max_retries
                        && started.elapsed() < self.retry.ceiling;
                    if !budget_left {
                        return Err(e);
                    }
                    let delay = self.retry.backoff_delay(attempt);
                    warn!(
                        "transport failure ({e}); retrying in {:.1}s (attempt {}/{})",
                        delay.as_secs_f64(),
                        attempt + 1,
                        self.retry.max_retries
                    );
                    cancel.sleep(delay).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Transport for ApiTransport {
    async fn exchange(
        &self,
        conversation: &Conversation,
        request: &ExchangeRequest,
        cancel: &CancelToken,
    ) -> Result<Reply> {
        let body = self.body(conversation, request);
        let response = self.send_with_retry(&body, cancel).await?;

        let expected = match request.kind {
            RequestKind::Patch => SUBMIT_PATCH,
            RequestKind::Plan => SUBMIT_PLAN,
        };
        let arguments = response.tool_arguments(expected)?;

        Ok(match request.kind {
            RequestKind::Patch => Reply::Patch(arguments),
            RequestKind::Plan => Reply::Plan(arguments),
        })
    }

    async fn cancel(&self) -> Result<()> {
        // Stateless over HTTP; nothing to tear down.
        Ok(())
    }
}

fn classify_send_error(err: reqwest::Error) -> ReviewError {
    // The per-call deadline is enforced by the caller's timeout wrapper;
    // anything retriable at the connection level is transient here.
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ReviewError::TransportTransient(err.to_string())
    } else {
        ReviewError::Http(err)
    }
}

// ── response shape ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

impl ChatResponse {
    /// Arguments of the single required tool call, or `ProtocolViolation`
    /// when the model answered outside the structured channel.
    fn tool_arguments(&self, expected: &str) -> Result<String> {
        let message = self
            .choices
            .first()
            .map(|c| &c.message)
            .ok_or_else(|| ReviewError::TransportTransient("response has no choices".into()))?;

        let call = message.tool_calls.first().ok_or_else(|| {
            let preview: String = message
                .content
                .as_deref()
                .unwrap_or("")
                .chars()
                .take(160)
                .collect();
            ReviewError::ProtocolViolation(format!(
                "model replied without calling {expected}: {preview:?}"
            ))
        })?;

        if call.function.name != expected {
            return Err(ReviewError::ProtocolViolation(format!(
                "model called '{}' instead of '{expected}'",
                call.function.name
            )));
        }
        Ok(call.function.arguments.clone())
    }
}

// ── tool schemas ───────────────────────────────────────────────────────────

/// Tool mirroring the patch envelope: exactly one file operation per call,
/// complete file bodies (never diffs).
fn submit_patch_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": SUBMIT_PATCH,
            "description": "Create, update, delete, rename or chmod exactly one file. \
                Always return a complete file body for create/update (never a diff). \
                Use status='in_progress' until the last patch, then 'completed'.",
            "parameters": {
                "type": "object",
                "properties": {
                    "op": { "type": "string", "enum": ["create", "update", "delete", "rename", "chmod"] },
                    "file": { "type": "string", "description": "Repo-relative POSIX path." },
                    "body": { "type": "string" },
                    "body_b64": { "type": "string" },
                    "target": { "type": "string" },
                    "mode": { "type": "string", "enum": ["644", "755", "0644", "0755"] },
                    "status": { "type": "string", "enum": ["in_progress", "completed"] }
                },
                "required": ["op", "file", "status"],
                "additionalProperties": false
            }
        }
    })
}

fn submit_plan_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": SUBMIT_PLAN,
            "description": "Summarize how to approach this repository: an overview, \
                the single best command to verify the software, per-file classification \
                hints, and how many review iterations are needed (1-3).",
            "parameters": {
                "type": "object",
                "properties": {
                    "overview": { "type": "string" },
                    "run_command": { "type": "string" },
                    "classification_hints": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "path": { "type": "string" },
                                "kind": { "type": "string", "enum": ["code", "doc", "deferred"] }
                            },
                            "required": ["path", "kind"],
                            "additionalProperties": false
                        }
                    },
                    "estimated_iterations": { "type": "integer", "minimum": 1, "maximum": 3 }
                },
                "required": ["overview", "estimated_iterations"],
                "additionalProperties": false
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json_text: &str) -> ChatResponse {
        serde_json::from_str(json_text).unwrap()
    }

    #[test]
    fn tool_arguments_extracted() {
        let resp = response(
            r#"{"choices":[{"message":{"content":null,"tool_calls":[
                {"id":"c1","type":"function","function":{"name":"submit_patch","arguments":"{\"op\":\"delete\"}"}}
            ]}}]}"#,
        );
        assert_eq!(resp.tool_arguments("submit_patch").unwrap(), "{\"op\":\"delete\"}");
    }

    #[test]
    fn missing_tool_call_is_protocol_violation() {
        let resp = response(r#"{"choices":[{"message":{"content":"I think we should..."}}]}"#);
        assert!(matches!(
            resp.tool_arguments("submit_patch").unwrap_err(),
            ReviewError::ProtocolViolation(_)
        ));
    }

    #[test]
    fn wrong_tool_name_is_protocol_violation() {
        let resp = response(
            r#"{"choices":[{"message":{"tool_calls":[
                {"function":{"name":"other_tool","arguments":"{}"}}
            ]}}]}"#,
        );
        assert!(matches!(
            resp.tool_arguments("submit_patch").unwrap_err(),
            ReviewError::ProtocolViolation(_)
        ));
    }

    #[test]
    fn empty_choices_is_transient() {
        let resp = response(r#"{"choices":[]}"#);
        assert!(matches!(
            resp.tool_arguments("submit_patch").unwrap_err(),
            ReviewError::TransportTransient(_)
        ));
    }
}
