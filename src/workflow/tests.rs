//! End-to-end workflow tests against a scripted transport and real scratch
//! git repositories.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{IterationOutcome, Orchestrator, Phase};
use crate::cancel::CancelToken;
use crate::config::{Config, ConfigOverrides};
use crate::error::{Result, ReviewError};
use crate::git::testutil::init_repo;
use crate::transport::{Conversation, ExchangeRequest, Reply, Transport};

/// Transport that replays a fixed reply script and records every prompt it
/// was asked, so tests can assert on the model-facing conversation.
struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn exchange(
        &self,
        _conversation: &Conversation,
        request: &ExchangeRequest,
        _cancel: &CancelToken,
    ) -> Result<Reply> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ReviewError::ProtocolViolation("reply script exhausted".into()))
    }

    async fn cancel(&self) -> Result<()> {
        Ok(())
    }
}

fn patch(raw: &str) -> Reply {
    Reply::Patch(raw.to_string())
}

fn plan(raw: &str) -> Reply {
    Reply::Plan(raw.to_string())
}

fn test_config(dir: &Path, overrides: ConfigOverrides) -> Config {
    let instructions = dir.join("instructions.txt");
    std::fs::write(&instructions, "Bring the project into shape.\n").unwrap();
    let mut config = Config::build(instructions, ConfigOverrides {
        no_push: true,
        ..overrides
    })
    .unwrap();
    config.create_pr = false;
    config
}

fn orchestrator(
    repo: &Path,
    config: Config,
    replies: Vec<Reply>,
) -> (Orchestrator, std::sync::Arc<ScriptedTransport>) {
    let transport = std::sync::Arc::new(ScriptedTransport::new(replies));
    let orchestrator = Orchestrator::new(
        config,
        repo,
        Box::new(ArcTransport(transport.clone())),
        CancelToken::inert(),
    )
    .unwrap();
    (orchestrator, transport)
}

/// Box-able handle sharing one scripted transport with the test body.
struct ArcTransport(std::sync::Arc<ScriptedTransport>);

#[async_trait]
impl Transport for ArcTransport {
    async fn exchange(
        &self,
        conversation: &Conversation,
        request: &ExchangeRequest,
        cancel: &CancelToken,
    ) -> Result<Reply> {
        self.0.exchange(conversation, request, cancel).await
    }

    async fn cancel(&self) -> Result<()> {
        self.0.cancel().await
    }
}

#[tokio::test]
async fn single_pass_applies_patches_until_completed() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).unwrap();

    let replies = vec![
        patch(r#"{"op":"create","file":"src/lib.rs","body":"pub fn v() -> u32 { 1 }","status":"in_progress"}"#),
        patch(r#"{"op":"create","file":"src/util.rs","body":"pub fn u() {}","status":"completed"}"#),
    ];
    let config = test_config(dir.path(), Default::default());
    let (mut orch, _script) = orchestrator(dir.path(), config, replies);

    orch.run_single_pass().await.unwrap();

    assert_eq!(orch.phase, Phase::Done);
    assert_eq!(orch.step, 2);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(),
        "pub fn v() -> u32 { 1 }\n"
    );
    // Clean completion removes the resume record.
    assert!(orch.store.load_resume().is_none());
}

#[tokio::test]
async fn resume_record_tracks_last_commit() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).unwrap();

    let replies = vec![
        patch(r#"{"op":"create","file":"kept.txt","body":"kept","status":"in_progress"}"#),
    ];
    let config = test_config(dir.path(), Default::default());
    let (mut orch, _script) = orchestrator(dir.path(), config, replies);

    // Script runs dry after the first patch, aborting mid-session.
    let err = orch.run_single_pass().await.unwrap_err();
    assert!(matches!(err, ReviewError::ProtocolViolation(_)));

    let record = orch.store.load_resume().unwrap();
    assert_eq!(record.last_file, "kept.txt");
    assert_eq!(record.step, 1);
    assert_eq!(record.commit, crate::git::head_commit(dir.path()).unwrap());
}

#[tokio::test]
async fn invalid_patch_gets_structured_retry() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).unwrap();

    let replies = vec![
        patch("this is not an envelope"),
        patch(r#"{"op":"chmod","file":"x","mode":"700","status":"in_progress"}"#),
        patch(r#"{"op":"create","file":"ok.txt","body":"fine","status":"completed"}"#),
    ];
    let config = test_config(dir.path(), Default::default());
    let (mut orch, script) = orchestrator(dir.path(), config, replies);

    orch.run_single_pass().await.unwrap();

    let prompts = script.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[1].contains("rejected"), "retry prompt expected: {}", prompts[1]);
    assert!(prompts[2].contains("644"), "mode hint expected: {}", prompts[2]);
    assert!(dir.path().join("ok.txt").exists());
    // Only the accepted patch produced a commit.
    assert_eq!(orch.step, 1);
}

#[tokio::test]
async fn unsafe_paths_abort_after_strikes() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).unwrap();

    let unsafe_patch = r#"{"op":"update","file":"../secret","body":"x","status":"in_progress"}"#;
    let replies = vec![patch(unsafe_patch), patch(unsafe_patch), patch(unsafe_patch)];
    let config = test_config(dir.path(), Default::default());
    let (mut orch, _script) = orchestrator(dir.path(), config, replies);

    let err = orch.run_single_pass().await.unwrap_err();
    assert!(matches!(err, ReviewError::UnsafePath(_)));
    assert_eq!(err.exit_code(), 3);
    // No filesystem mutation, no commit.
    assert_eq!(orch.step, 0);
    assert!(orch.store.load_resume().is_none());
}

#[tokio::test]
async fn repeated_precondition_failure_fails_the_iteration() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).unwrap();

    // Updating a file that does not exist, twice.
    let missing = r#"{"op":"update","file":"ghost.rs","body":"x","status":"in_progress"}"#;
    let replies = vec![patch(missing), patch(missing)];
    let config = test_config(dir.path(), Default::default());
    let (mut orch, script) = orchestrator(dir.path(), config, replies);

    let outcome = orch.run_patch_loop("go".into(), 3).await.unwrap();
    assert!(matches!(outcome, IterationOutcome::Failed(_)));
    assert!(script.prompts()[1].contains("rejected"));
}

#[tokio::test]
async fn patch_budget_ends_iteration_without_crash() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).unwrap();

    let replies = (0..3)
        .map(|i| {
            patch(&format!(
                r#"{{"op":"create","file":"f{i}.txt","body":"x","status":"in_progress"}}"#
            ))
        })
        .collect();
    let mut config = test_config(dir.path(), Default::default());
    config.max_patches_per_iteration = 2;
    let (mut orch, _script) = orchestrator(dir.path(), config, replies);

    let outcome = orch.run_patch_loop("go".into(), 3).await.unwrap();
    assert_eq!(outcome, IterationOutcome::PatchBudgetExhausted);
    assert_eq!(orch.step, 2);
}

#[tokio::test]
async fn deferred_files_rejected_before_final_iteration() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).unwrap();

    let replies = vec![
        patch(r#"{"op":"create","file":"Dockerfile","body":"FROM scratch","status":"in_progress"}"#),
        patch(r#"{"op":"create","file":"src/core.rs","body":"pub fn core() {}","status":"completed"}"#),
    ];
    let config = test_config(dir.path(), Default::default());
    let (mut orch, script) = orchestrator(dir.path(), config, replies);

    let outcome = orch.run_patch_loop("go".into(), 1).await.unwrap();
    assert_eq!(outcome, IterationOutcome::Completed);

    assert!(!dir.path().join("Dockerfile").exists());
    assert!(dir.path().join("src/core.rs").exists());
    assert!(script.prompts()[1].contains("deferred"));
}

#[tokio::test]
async fn error_fix_loop_feeds_tail_and_advances_on_pass() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).unwrap();

    let replies = vec![
        // First completion triggers the verification command.
        patch(r#"{"op":"create","file":"src/app.rs","body":"pub fn app() {}","status":"completed"}"#),
        // The command fails until this fix creates the marker it checks for.
        patch(r#"{"op":"create","file":"fixed.marker","body":"ok","status":"completed"}"#),
    ];
    let mut config = test_config(dir.path(), Default::default());
    config.command = Some("test -f fixed.marker || { echo 'AssertionError' >&2; exit 1; }".into());
    let (mut orch, script) = orchestrator(dir.path(), config, replies);

    orch.run_single_pass().await.unwrap();

    let prompts = script.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(
        prompts[1].contains("AssertionError"),
        "failing tail must reach the model: {}",
        prompts[1]
    );
    assert!(dir.path().join("fixed.marker").exists());
}

#[tokio::test]
async fn error_round_budget_maps_to_exit_5() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).unwrap();

    let replies = vec![
        patch(r#"{"op":"create","file":"a.txt","body":"a","status":"completed"}"#),
        // Each round: one useless fix, still failing.
        patch(r#"{"op":"update","file":"a.txt","body":"b","status":"completed"}"#),
        patch(r#"{"op":"update","file":"a.txt","body":"c","status":"completed"}"#),
    ];
    let mut config = test_config(dir.path(), Default::default());
    config.command = Some("false".into());
    config.max_error_rounds = 2;
    let (mut orch, _script) = orchestrator(dir.path(), config, replies);

    let err = orch.run_single_pass().await.unwrap_err();
    assert!(matches!(err, ReviewError::CommandFailed(_)));
    assert_eq!(err.exit_code(), 5);
}

#[tokio::test]
async fn command_timeout_counts_as_failure() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).unwrap();

    let replies = vec![
        patch(r#"{"op":"create","file":"a.txt","body":"a","status":"completed"}"#),
        patch(r#"{"op":"update","file":"a.txt","body":"b","status":"completed"}"#),
    ];
    let mut config = test_config(dir.path(), Default::default());
    config.command = Some("sleep 30".into());
    config.command_timeout_secs = 1;
    config.max_error_rounds = 1;
    let (mut orch, _script) = orchestrator(dir.path(), config, replies);

    let err = orch.run_single_pass().await.unwrap_err();
    assert!(matches!(err, ReviewError::CommandTimeout(1)));
    assert_eq!(err.exit_code(), 5);
}

#[tokio::test]
async fn iterate_generates_blueprints_and_plans() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).unwrap();
    std::fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();
    crate::git::stage_paths(dir.path(), &["main.rs"]).unwrap();
    crate::git::commit(dir.path(), "seed main").unwrap();

    let bp = |name: &str| {
        patch(&format!(
            r##"{{"op":"create","file":".autoreview/blueprints/{name}","body":"# Doc\ncontent","status":"in_progress"}}"##
        ))
    };
    let replies = vec![
        bp("WHITEPAPER.md"),
        bp("BUILD_GUIDE.md"),
        bp("DESIGN.md"),
        bp("INSTRUCTIONS.md"),
        plan(r#"{"overview":"tighten everything","estimated_iterations":1}"#),
        patch(r#"{"op":"update","file":"main.rs","body":"fn main() { run() }\nfn run() {}","status":"completed"}"#),
        plan(r#"{"overview":"ship it","estimated_iterations":1}"#),
    ];
    let config = test_config(
        dir.path(),
        ConfigOverrides {
            iterations: Some(1),
            ..Default::default()
        },
    );
    let (mut orch, _script) = orchestrator(dir.path(), config, replies);

    orch.run().await.unwrap();

    assert_eq!(orch.phase, Phase::Done);
    for doc in ["WHITEPAPER.md", "BUILD_GUIDE.md", "DESIGN.md", "INSTRUCTIONS.md"] {
        assert!(
            dir.path().join(".autoreview/blueprints").join(doc).exists(),
            "missing blueprint {doc}"
        );
    }
    assert!(dir.path().join(".autoreview/initial_plan.json").exists());
    assert!(dir.path().join(".autoreview/INITIAL_PLAN.md").exists());
    assert!(dir.path().join(".autoreview/review_plan.json").exists());
    assert!(dir.path().join(".autoreview/REVIEW_PLAN.md").exists());

    // Iteration work landed on the iteration branch.
    let branch = crate::git::git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap();
    assert_eq!(branch.trim(), "iteration1");
    assert!(
        std::fs::read_to_string(dir.path().join("main.rs"))
            .unwrap()
            .contains("run()")
    );
}

#[tokio::test]
async fn update_noop_produces_no_commit_but_continues() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).unwrap();
    std::fs::write(dir.path().join("same.txt"), "a\n").unwrap();
    crate::git::stage_paths(dir.path(), &["same.txt"]).unwrap();
    crate::git::commit(dir.path(), "seed").unwrap();

    let replies = vec![
        patch(r#"{"op":"update","file":"same.txt","body":"a","status":"in_progress"}"#),
        patch(r#"{"op":"create","file":"new.txt","body":"n","status":"completed"}"#),
    ];
    let config = test_config(dir.path(), Default::default());
    let (mut orch, _script) = orchestrator(dir.path(), config, replies);

    let head_before = crate::git::head_commit(dir.path());
    let outcome = orch.run_patch_loop("go".into(), 3).await.unwrap();
    assert_eq!(outcome, IterationOutcome::Completed);

    // The no-op advanced the conversation but produced no commit or step.
    let record = orch.store.load_resume().unwrap();
    assert_eq!(record.last_file, "new.txt");
    assert_eq!(orch.step, 1);
    assert_ne!(crate::git::head_commit(dir.path()), head_before);
}
