pub mod api;
pub mod browser;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::cancel::CancelToken;
use crate::error::{Result, ReviewError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One conversation turn. `call` holds raw tool-call arguments when the
/// assistant answered through the structured channel.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub call: Option<String>,
}

/// Rolling conversation owned by the orchestrator. Transports receive the
/// system prompt, the windowed history, and the current user message: they
/// never retain turns themselves.
#[derive(Debug, Clone)]
pub struct Conversation {
    system: String,
    turns: Vec<Turn>,
    max_pairs: usize,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>, max_pairs: usize) -> Self {
        Self {
            system: system_prompt.into(),
            turns: Vec::new(),
            max_pairs: max_pairs.max(1),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn {
            role: Role::User,
            text: text.into(),
            call: None,
        });
        self.prune();
    }

    pub fn push_assistant(&mut self, text: impl Into<String>, call: Option<String>) {
        self.turns.push(Turn {
            role: Role::Assistant,
            text: text.into(),
            call,
        });
        self.prune();
    }

    /// Record a local apply outcome the model should see next turn.
    pub fn push_tool(&mut self, text: impl Into<String>) {
        self.turns.push(Turn {
            role: Role::Tool,
            text: text.into(),
            call: None,
        });
        self.prune();
    }

    /// Windowed history: never more than `max_pairs` user/assistant pairs.
    pub fn window(&self) -> &[Turn] {
        &self.turns
    }

    fn prune(&mut self) {
        let cap = self.max_pairs * 2;
        if self.turns.len() > cap {
            let cut = self.turns.len() - cap;
            self.turns.drain(..cut);
        }
    }
}

/// What shape of reply the caller expects for this exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Patch,
    Plan,
}

#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub kind: RequestKind,
    pub prompt: String,
}

impl ExchangeRequest {
    pub fn patch(prompt: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Patch,
            prompt: prompt.into(),
        }
    }

    pub fn plan(prompt: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Plan,
            prompt: prompt.into(),
        }
    }
}

/// Raw envelope text returned by a transport. Validation happens upstream;
/// transports only guarantee the reply came through the structured channel.
#[derive(Debug, Clone)]
pub enum Reply {
    Patch(String),
    Plan(String),
}

impl Reply {
    pub fn raw(&self) -> &str {
        match self {
            Reply::Patch(raw) | Reply::Plan(raw) => raw,
        }
    }
}

/// Single capability both realizations implement. The orchestrator holds a
/// `Box<dyn Transport>` and never inspects the concrete type. One request,
/// one reply; deadlines and retries live behind this seam; a fired cancel
/// token aborts within a bounded grace and leaves no background work.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(
        &self,
        conversation: &Conversation,
        request: &ExchangeRequest,
        cancel: &CancelToken,
    ) -> Result<Reply>;

    /// Release any held resources (sessions, locks). Idempotent.
    async fn cancel(&self) -> Result<()>;
}

/// Retry schedule for transient transport failures: exponential backoff with
/// jitter, bounded by attempt count and a wall-clock ceiling. The ceiling
/// dominates when individual calls are slow.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            ceiling: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry *attempt* (0-based): base << attempt, plus up to
    /// 25% jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let base = self.base_delay.saturating_mul(multiplier.min(u32::MAX as u64) as u32);
        let jitter_cap = base.as_millis() as u64 / 4;
        if jitter_cap == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
    }
}

/// Remove a ```json fence wrapper when present. Browser replies often carry
/// one; the strict validator upstream still rejects fenced input, so this
/// runs at the transport boundary only.
pub fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };
    let after_open = &trimmed[open + 3..];
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => trimmed,
    }
}

/// First balanced `{…}` substring, string-literal aware.
pub fn balanced_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract the single JSON object from a free-form assistant block.
pub fn extract_envelope(text: &str) -> Result<String> {
    balanced_json_object(strip_fence(text))
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ReviewError::ProtocolViolation("no JSON object found in assistant reply".into())
        })
}
