//! The patch acceptance cycle: one patch per assistant turn, validation and
//! apply failures fed back as structured retry prompts, resume state updated
//! after every commit.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Orchestrator, MAX_UNSAFE_STRIKES};
use crate::error::{Result, ReviewError};
use crate::patch::{self, ApplyOutcome, PatchAction, PatchStatus};
use crate::prompts;
use crate::scan::classify_path;
use crate::transport::{ExchangeRequest, Reply};

/// Whole-turn retries after the transport's own retry budget is exhausted.
const TURN_RETRIES: u32 = 2;

/// How one patch loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The model declared `status=completed`.
    Completed,
    /// The per-iteration patch cap was reached.
    PatchBudgetExhausted,
    /// A precondition failure repeated on the same file.
    Failed(String),
}

impl Orchestrator {
    /// One request/reply through the transport. The user turn and the
    /// assistant reply enter the conversation only after success, so a
    /// timed-out call leaves no half-recorded turn. Exhausted transient
    /// failures are retried once more here after a short pause.
    pub(crate) async fn exchange_with_retry(
        &mut self,
        mut request: ExchangeRequest,
    ) -> Result<Reply> {
        let budget = self.config.max_prompt_bytes;
        if request.prompt.len() > budget {
            let mut cut = budget;
            while !request.prompt.is_char_boundary(cut) {
                cut -= 1;
            }
            warn!(
                "prompt exceeds the {budget}-byte budget ({} bytes); truncating",
                request.prompt.len()
            );
            request.prompt.truncate(cut);
            request.prompt.push_str("\n…[prompt truncated]");
        }

        let mut attempt = 0u32;
        loop {
            self.cancel.check()?;
            match self
                .transport
                .exchange(&self.conversation, &request, &self.cancel)
                .await
            {
                Ok(reply) => {
                    self.conversation.push_user(request.prompt.clone());
                    self.conversation
                        .push_assistant(reply.raw().to_string(), Some(reply.raw().to_string()));
                    return Ok(reply);
                }
                Err(e @ (ReviewError::TransportTimeout(_) | ReviewError::TransportTransient(_)))
                    if attempt < TURN_RETRIES =>
                {
                    attempt += 1;
                    warn!("turn failed ({e}); pausing before retry {attempt}/{TURN_RETRIES}");
                    self.cancel.sleep(Duration::from_secs(2u64 << attempt)).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Solicit and apply patches until the model completes or a cap trips.
    /// *iteration* gates which file classifications may be written; pass 3
    /// to accept everything.
    pub(crate) async fn run_patch_loop(
        &mut self,
        kickoff: String,
        iteration: u32,
    ) -> Result<IterationOutcome> {
        let mut prompt = kickoff;
        let mut accepted = 0u32;
        let mut precondition_strikes: HashMap<String, u32> = HashMap::new();

        loop {
            self.cancel.check()?;
            if accepted >= self.config.max_patches_per_iteration {
                return Ok(IterationOutcome::PatchBudgetExhausted);
            }

            let reply = self.exchange_with_retry(ExchangeRequest::patch(prompt)).await?;

            // 1. Validate. Recoverable rejections go back to the model; the
            //    error turn stays in the history so it sees its mistake.
            let payload = match patch::validate(reply.raw()) {
                Ok(payload) => payload,
                Err(e) if e.is_retryable_with_model() => {
                    if matches!(e, ReviewError::UnsafePath(_)) {
                        self.unsafe_strikes += 1;
                        if self.unsafe_strikes >= MAX_UNSAFE_STRIKES {
                            return Err(e);
                        }
                    }
                    debug!("patch rejected: {e}");
                    prompt = prompts::retry_prompt(&e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            // 2. Iteration scoping: deferred files only land in iteration 3.
            if is_write(&payload.action) && !classify_path(payload.file()).allowed_in_iteration(iteration)
            {
                info!("deferring {} until the final iteration", payload.file());
                prompt = prompts::deferred_prompt(payload.file(), iteration);
                continue;
            }

            // 3. Apply. Precondition failures retry once per file; a repeat
            //    marks the iteration failed. Anything else is fatal.
            debug!("validated patch: {}", payload.to_json_string());
            let file = payload.file().to_string();
            match patch::apply(&self.repo, &payload) {
                Ok(outcome) => {
                    accepted += 1;
                    let ack = match &outcome {
                        ApplyOutcome::Committed { commit_id, .. } => {
                            let short = &commit_id[..commit_id.len().min(8)];
                            format!("applied {} {file} (commit {short})", payload.op_name())
                        }
                        ApplyOutcome::NoOp { reason } => format!("no-op: {reason}"),
                    };
                    self.conversation.push_tool(ack);
                    self.record_outcome(&payload, &outcome);

                    match payload.status {
                        PatchStatus::Completed => return Ok(IterationOutcome::Completed),
                        PatchStatus::InProgress => prompt = prompts::continue_prompt(),
                    }
                }
                Err(e @ ReviewError::Precondition(_)) => {
                    let strikes = precondition_strikes.entry(file.clone()).or_insert(0);
                    *strikes += 1;
                    if *strikes > 1 {
                        return Ok(IterationOutcome::Failed(format!(
                            "repeated precondition failure on {file}: {e}"
                        )));
                    }
                    warn!("apply precondition failed on {file}: {e}");
                    prompt = prompts::retry_prompt(&e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Ops that write file content (and are therefore iteration-scoped).
fn is_write(action: &PatchAction) -> bool {
    matches!(action, PatchAction::Create { .. } | PatchAction::Update { .. })
}
