//! Error-fix loop: run the verification command, feed the failing tail back
//! to the model in bounded chunks, apply its fixes, repeat until the command
//! passes or the round budget runs out.

use tracing::{info, warn};

use super::{IterationOutcome, Orchestrator, Phase};
use crate::command::{self, CommandResult};
use crate::error::{Result, ReviewError};
use crate::prompts;

/// Characters per error-log message chunk.
const LOG_CHUNK_BYTES: usize = 15_000;

impl Orchestrator {
    /// Returns once the command passes. When the error-round budget runs out
    /// the last failure surfaces as `CommandTimeout` or `CommandFailed`, both
    /// of which the caller records rather than crashes on.
    pub(crate) async fn error_fix_loop(&mut self, command: &str) -> Result<()> {
        let mut last_failure: Option<CommandResult> = None;

        for round in 1..=self.config.max_error_rounds {
            self.cancel.check()?;
            self.set_phase(Phase::RunningCommand);

            let result = self.run_command(command).await?;
            if result.ok() {
                info!("verification passed on round {round}");
                return Ok(());
            }

            warn!(
                "verification failed (round {round}/{}): exit={} timed_out={}",
                self.config.max_error_rounds, result.exit_code, result.timed_out
            );
            self.set_phase(Phase::FixingErrors);

            let kickoff = self.feed_error_log(command, &result);
            last_failure = Some(result);

            match self.run_patch_loop(kickoff, 3).await? {
                IterationOutcome::Completed => {}
                IterationOutcome::PatchBudgetExhausted => {
                    warn!("fix round {round} hit the patch budget");
                }
                IterationOutcome::Failed(reason) => {
                    warn!("fix round {round} failed: {reason}");
                }
            }
        }

        match last_failure {
            Some(result) if result.timed_out => {
                Err(ReviewError::CommandTimeout(self.config.command_timeout_secs))
            }
            Some(result) => Err(ReviewError::CommandFailed(format!(
                "`{command}` still exits {} after {} fix rounds",
                result.exit_code, self.config.max_error_rounds
            ))),
            None => Err(ReviewError::CommandFailed(format!(
                "`{command}` never ran within the round budget"
            ))),
        }
    }

    /// Record all but the last log chunk as plain context turns; the last
    /// chunk becomes the kickoff prompt that solicits the first fix.
    fn feed_error_log(&mut self, command: &str, result: &CommandResult) -> String {
        let chunks = prompts::chunk_log(&result.tail, LOG_CHUNK_BYTES);
        let total = chunks.len();

        for (i, chunk) in chunks.iter().enumerate().take(total - 1) {
            self.conversation
                .push_user(prompts::error_log_prompt(command, chunk, i + 1, total));
        }

        let last = prompts::error_log_prompt(command, &chunks[total - 1], total, total);
        if total > 1 {
            format!("{last}\n\n{}", prompts::error_log_final_prompt(command))
        } else {
            last
        }
    }

    /// Run the verification command off the control task; the orchestrator
    /// awaits the subprocess (or its timeout) before continuing.
    pub(crate) async fn run_command(&self, cmd: &str) -> Result<CommandResult> {
        let cmdline = cmd.to_string();
        let cwd = self.repo.clone();
        let timeout = self.config.command_timeout();
        let tail_budget = self.config.log_tail_bytes;

        let handle =
            tokio::task::spawn_blocking(move || command::run(&cmdline, &cwd, timeout, tail_budget));

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ReviewError::Cancelled),
            joined = handle => joined
                .map_err(|e| ReviewError::CommandFailed(format!("runner thread panicked: {e}")))?,
        }
    }
}
