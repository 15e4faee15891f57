mod errfix;
mod exchange;
mod plan;
mod single;
#[cfg(test)]
mod tests;

pub use exchange::IterationOutcome;

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use crate::blueprint::BlueprintSet;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Result, ReviewError};
use crate::git::{self, RepoState};
use crate::patch::{self, ApplyOutcome, PatchPayload};
use crate::prompts;
use crate::scan::Manifest;
use crate::state::{ResumeRecord, StateStore};
use crate::transport::{Conversation, ExchangeRequest, Transport};

/// Manifest lines included in prompts.
const MANIFEST_LINES: usize = 400;

/// Per-document byte budget for the blueprint summary.
const BLUEPRINT_SUMMARY_BYTES: usize = 1500;

/// Attempts at generating one missing blueprint document.
const BLUEPRINT_ATTEMPTS: u32 = 3;

/// Unsafe paths tolerated (each answered with a retry prompt) before the
/// run aborts with a safety violation.
const MAX_UNSAFE_STRIKES: u32 = 3;

/// Run lifecycle. Terminal states leave the repo fully committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Bootstrap,
    BlueprintPreflight,
    PlanFirst,
    Iterating(u32),
    RunningCommand,
    FixingErrors,
    Finalizing,
    Done,
    Aborted,
}

/// The control core: owns the conversation, the state store, and the working
/// tree for the duration of a run. Single-threaded in the control sense -
/// patches, git mutations, and command runs execute sequentially.
pub struct Orchestrator {
    pub(crate) config: Config,
    pub(crate) repo: PathBuf,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) conversation: Conversation,
    pub(crate) store: StateStore,
    pub(crate) cancel: CancelToken,
    pub(crate) instructions: String,
    pub(crate) repo_state: RepoState,
    pub(crate) phase: Phase,
    pub(crate) step: u64,
    pub(crate) unsafe_strikes: u32,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        repo: &Path,
        transport: Box<dyn Transport>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let instructions = std::fs::read_to_string(&config.instructions)?;
        let instructions = instructions.trim().to_string();
        if instructions.is_empty() {
            return Err(ReviewError::Config("instructions file is empty".into()));
        }

        let repo_state = RepoState::read(repo)?;
        let store = StateStore::new(repo, &config.state_dir);
        let step = store
            .load_resume_for(repo_state.head.as_deref())
            .map(|r| r.step)
            .unwrap_or(0);

        let conversation = Conversation::new(prompts::system_prompt(), config.ctx_turn_pairs);

        Ok(Self {
            repo: repo.to_path_buf(),
            transport,
            conversation,
            store,
            cancel,
            instructions,
            repo_state,
            phase: Phase::Bootstrap,
            step,
            unsafe_strikes: 0,
            config,
        })
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        info!("phase: {:?} -> {phase:?}", self.phase);
        self.phase = phase;
    }

    /// Full plan-first workflow: blueprints, plan, bounded iterations with
    /// the error-fix loop, finalize. Used by the `iterate` subcommand.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_inner().await;
        self.set_phase(match result {
            Ok(()) => Phase::Done,
            Err(_) => Phase::Aborted,
        });
        if let Err(e) = self.transport.cancel().await {
            warn!("transport shutdown failed: {e}");
        }
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        if self.repo_state.dirty {
            warn!("working tree has local changes; only clean paths will be patched");
        }
        info!(
            "starting on branch '{}' at {}",
            self.repo_state.branch,
            self.repo_state.head.as_deref().unwrap_or("<no-commits-yet>")
        );

        // ── blueprints ────────────────────────────────────────────────────
        self.set_phase(Phase::BlueprintPreflight);
        let manifest = Manifest::scan(&self.repo, &[])?;
        let blueprints_summary = self.ensure_blueprints(&manifest).await?;

        // ── plan-first ────────────────────────────────────────────────────
        self.set_phase(Phase::PlanFirst);
        let manifest = Manifest::scan(&self.repo, &[])?;
        let plan = self.plan_first(&manifest, &blueprints_summary).await?;

        let command = self.config.command.clone().or_else(|| plan.run_command.clone());
        let mut verification_error: Option<ReviewError> = None;

        // ── iterations ────────────────────────────────────────────────────
        for iteration in 1..=self.config.iterations {
            self.cancel.check()?;
            self.set_phase(Phase::Iterating(iteration));

            let branch = format!("{}{}", self.config.branch_prefix, iteration);
            git::checkout_branch(&self.repo, &branch)?;
            self.repo_state.refresh_head();

            let manifest = Manifest::scan(&self.repo, &[])?;
            info!(
                "iteration {iteration}: {} file(s) in scope",
                manifest.files_for_iteration(iteration).len()
            );
            let kickoff = if iteration == 1 {
                prompts::initial_prompt(
                    &self.instructions,
                    &manifest.render(MANIFEST_LINES),
                    &manifest.census(),
                    &blueprints_summary,
                )
            } else {
                prompts::iteration_prompt(
                    iteration,
                    self.config.iterations,
                    &manifest.render(MANIFEST_LINES),
                )
            };

            match self.run_patch_loop(kickoff, iteration).await? {
                IterationOutcome::Completed => {
                    info!("iteration {iteration} completed");
                    if let Some(cmd) = &command {
                        match self.error_fix_loop(cmd).await {
                            Ok(()) => {}
                            Err(
                                e @ (ReviewError::CommandFailed(_)
                                | ReviewError::CommandTimeout(_)),
                            ) => {
                                warn!("verification never passed within the round budget: {e}");
                                verification_error = Some(e);
                                self.push_iteration_branch(&branch);
                                break;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                IterationOutcome::PatchBudgetExhausted => {
                    warn!(
                        "iteration {iteration} hit the patch budget ({}), moving on",
                        self.config.max_patches_per_iteration
                    );
                }
                IterationOutcome::Failed(reason) => {
                    warn!("iteration {iteration} failed: {reason}; moving on");
                }
            }

            self.push_iteration_branch(&branch);
        }

        // ── finalize ──────────────────────────────────────────────────────
        self.set_phase(Phase::Finalizing);
        self.write_review_plan(&blueprints_summary).await;

        if self.config.create_pr {
            self.maybe_create_pull_request();
        }

        if let Some(e) = verification_error {
            return Err(e);
        }
        info!(
            "review run finished: {} committed step(s), {} file(s) written",
            self.step,
            self.repo_state.written_paths.len()
        );
        Ok(())
    }

    fn push_iteration_branch(&self, branch: &str) {
        if !self.config.push {
            return;
        }
        if let Err(e) = git::push_branch(&self.repo, &self.config.remote, branch) {
            warn!("push failed for {branch}: {e}");
        }
    }

    /// Generate any missing blueprint documents through the patch pipeline,
    /// one file per reply, and return the bounded summary for prompts.
    pub(crate) async fn ensure_blueprints(&mut self, manifest: &Manifest) -> Result<String> {
        let set = BlueprintSet::detect(&self.repo, &self.config.state_dir);
        if set.all_present() {
            let total: u64 = set.docs.iter().map(|d| d.size).sum();
            info!("all blueprint documents present ({total} bytes)");
            return Ok(set.summary(&self.repo, BLUEPRINT_SUMMARY_BYTES));
        }

        let manifest_text = manifest.render(MANIFEST_LINES);
        for doc in set.missing() {
            info!("generating missing blueprint: {}", doc.label);
            let mut prompt = prompts::blueprint_prompt(
                doc.label,
                &doc.rel_path,
                &self.instructions,
                &manifest_text,
            );

            let mut created = false;
            for _attempt in 0..BLUEPRINT_ATTEMPTS {
                self.cancel.check()?;
                let reply = self.exchange_with_retry(ExchangeRequest::patch(prompt.clone())).await?;

                let payload = match patch::validate(reply.raw()) {
                    Ok(p) => p,
                    Err(e) if e.is_retryable_with_model() => {
                        prompt = prompts::retry_prompt(&e);
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                if payload.file() != doc.rel_path {
                    prompt = format!(
                        "The patch must create `{}` (got `{}`). Send a create patch \
                         for exactly that path.",
                        doc.rel_path,
                        payload.file()
                    );
                    continue;
                }

                match patch::apply(&self.repo, &payload) {
                    Ok(outcome) => {
                        self.record_outcome(&payload, &outcome);
                        created = true;
                        break;
                    }
                    Err(e) if e.is_retryable_with_model() => {
                        prompt = prompts::retry_prompt(&e);
                    }
                    Err(e) => return Err(e),
                }
            }

            if !created {
                warn!("blueprint '{}' could not be generated; continuing without it", doc.label);
            }
        }

        let set = BlueprintSet::detect(&self.repo, &self.config.state_dir);
        Ok(set.summary(&self.repo, BLUEPRINT_SUMMARY_BYTES))
    }

    /// Advance the step counter and persist the resume record after a commit.
    pub(crate) fn record_outcome(&mut self, payload: &PatchPayload, outcome: &ApplyOutcome) {
        if let ApplyOutcome::Committed { commit_id, note } = outcome {
            self.step += 1;
            for path in payload.pathspecs() {
                self.repo_state.mark_written(path);
            }
            self.repo_state.refresh_head();
            tracing::debug!(
                "commit {commit_id} touches {:?}",
                git::commit_files(&self.repo, commit_id).unwrap_or_default()
            );
            let record = ResumeRecord {
                last_file: payload.file().to_string(),
                commit: commit_id.clone(),
                step: self.step,
                timestamp: Utc::now(),
                note: note.clone(),
            };
            if let Err(e) = self.store.save_resume(&record) {
                warn!("failed to persist resume record: {e}");
            }
        }
    }

    /// Open a PR for the final branch via the external `gh` CLI, best effort.
    fn maybe_create_pull_request(&self) {
        let branch = format!("{}{}", self.config.branch_prefix, self.config.iterations);
        let title = format!("autoreview: {branch}");
        let body = "Automated multi-iteration review. See .autoreview/REVIEW_PLAN.md.";

        let result = std::process::Command::new("gh")
            .args(["pr", "create", "--head", &branch, "--title", &title, "--body", body])
            .current_dir(&self.repo)
            .output();

        match result {
            Ok(output) if output.status.success() => info!("pull request created for {branch}"),
            Ok(output) => warn!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("gh CLI unavailable, skipping PR: {e}"),
        }
    }
}
