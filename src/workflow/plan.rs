//! Plan-first step: before any edits the model must emit a plan envelope,
//! persisted as JSON with a regenerated markdown twin.

use tracing::{info, warn};

use super::{Orchestrator, MANIFEST_LINES};
use crate::error::{Result, ReviewError};
use crate::prompts;
use crate::scan::Manifest;
use crate::state::IterationPlan;
use crate::transport::ExchangeRequest;

impl Orchestrator {
    /// Request the initial plan. A reply that is not a usable plan envelope
    /// gets one structured retry before counting as a protocol violation.
    pub(crate) async fn plan_first(
        &mut self,
        manifest: &Manifest,
        blueprints_summary: &str,
    ) -> Result<IterationPlan> {
        let mut request = ExchangeRequest::plan(prompts::plan_prompt(
            &self.instructions,
            &manifest.render(MANIFEST_LINES),
            blueprints_summary,
        ));

        for attempt in 0..2 {
            self.cancel.check()?;
            let reply = self.exchange_with_retry(request.clone()).await?;

            match serde_json::from_str::<IterationPlan>(reply.raw()) {
                Ok(plan) => {
                    let plan = plan.clamped();
                    self.store.write_initial_plan(&plan)?;
                    info!(
                        "plan accepted: {} iteration(s) estimated, run command: {}",
                        plan.estimated_iterations,
                        plan.run_command.as_deref().unwrap_or("(none)")
                    );
                    self.conversation.push_user(prompts::plan_ack_prompt(&plan));
                    return Ok(plan);
                }
                Err(e) if attempt == 0 => {
                    warn!("plan reply unusable, asking again: {e}");
                    request = ExchangeRequest::plan(prompts::plan_retry_prompt(&e.to_string()));
                }
                Err(e) => {
                    return Err(ReviewError::ProtocolViolation(format!(
                        "plan reply is not a plan envelope: {e}"
                    )))
                }
            }
        }
        unreachable!("plan_first returns within two attempts")
    }

    /// Ask for the closing plan and persist the review artifacts. Falls back
    /// to re-publishing the initial plan so finalize always leaves a review
    /// plan on disk.
    pub(crate) async fn write_review_plan(&mut self, blueprints_summary: &str) {
        let manifest = match Manifest::scan(&self.repo, &[]) {
            Ok(m) => m,
            Err(e) => {
                warn!("manifest rescan failed during finalize: {e}");
                return;
            }
        };

        let request = ExchangeRequest::plan(prompts::plan_prompt(
            &self.instructions,
            &manifest.render(MANIFEST_LINES),
            blueprints_summary,
        ));

        let plan = match self.exchange_with_retry(request).await {
            Ok(reply) => match serde_json::from_str::<IterationPlan>(reply.raw()) {
                Ok(plan) => plan.clamped(),
                Err(e) => {
                    warn!("final plan reply unusable ({e}); reusing the initial plan");
                    match self.store.load_initial_plan() {
                        Some(plan) => plan,
                        None => return,
                    }
                }
            },
            Err(e) => {
                warn!("final plan exchange failed ({e}); reusing the initial plan");
                match self.store.load_initial_plan() {
                    Some(plan) => plan,
                    None => return,
                }
            }
        };

        if let Err(e) = self.store.write_review_plan(&plan) {
            warn!("failed to write review plan artifacts: {e}");
        }
    }
}
