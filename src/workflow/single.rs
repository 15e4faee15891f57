//! Single-pass driver behind the `api` subcommand: no blueprints, no plan,
//! no iteration branches: just the patch loop with the optional error-fix
//! cycle and crash-safe resume.

use tracing::{info, warn};

use super::{IterationOutcome, Orchestrator, Phase, MANIFEST_LINES};
use crate::error::{Result, ReviewError};
use crate::prompts;
use crate::scan::Manifest;

impl Orchestrator {
    pub async fn run_single_pass(&mut self) -> Result<()> {
        let result = self.run_single_pass_inner().await;
        self.set_phase(match result {
            Ok(()) => Phase::Done,
            Err(_) => Phase::Aborted,
        });
        if let Err(e) = self.transport.cancel().await {
            warn!("transport shutdown failed: {e}");
        }
        result
    }

    async fn run_single_pass_inner(&mut self) -> Result<()> {
        let resume = self.store.load_resume_for(self.repo_state.head.as_deref());

        let kickoff = match &resume {
            Some(record) => {
                info!(
                    "resuming after step {} (last file: {})",
                    record.step, record.last_file
                );
                prompts::continue_prompt()
            }
            None => {
                let manifest = Manifest::scan(&self.repo, &[])?;
                prompts::initial_prompt(
                    &self.instructions,
                    &manifest.render(MANIFEST_LINES),
                    &manifest.census(),
                    "(no foundation documents in this mode)",
                )
            }
        };

        self.set_phase(Phase::Iterating(1));
        // Single-pass mode accepts every file class.
        match self.run_patch_loop(kickoff, 3).await? {
            IterationOutcome::Completed => {}
            IterationOutcome::PatchBudgetExhausted => {
                return Err(ReviewError::BudgetExceeded(format!(
                    "patch budget ({}) reached before the model completed",
                    self.config.max_patches_per_iteration
                )));
            }
            IterationOutcome::Failed(reason) => {
                return Err(ReviewError::BudgetExceeded(reason));
            }
        }

        if let Some(cmd) = self.config.command.clone() {
            self.error_fix_loop(&cmd).await?;
        }

        // Clean completion: the resume record has served its purpose.
        self.store.clear_resume();
        info!("session completed after {} committed steps", self.step);
        Ok(())
    }
}
