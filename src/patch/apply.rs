use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, ReviewError};
use crate::git;
use crate::patch::payload::{FileContent, FileMode, PatchAction, PatchPayload};

/// Result of applying one validated patch. `NoOp` covers idempotent writes
/// (identical bytes, already-set mode) which produce no commit by contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Committed {
        commit_id: String,
        /// Set when the effect was degraded (e.g. executable bit recorded in
        /// the index only); surfaced in the log and the next resume record.
        note: Option<String>,
    },
    NoOp {
        reason: String,
    },
}

/// Normalize text bodies: LF line endings plus a trailing newline.
pub fn normalize_text(body: &str) -> String {
    let text = body.replace("\r\n", "\n").replace('\r', "\n");
    if text.ends_with('\n') {
        text
    } else {
        text + "\n"
    }
}

fn content_bytes(content: &FileContent) -> Vec<u8> {
    match content {
        FileContent::Text(body) => normalize_text(body).into_bytes(),
        FileContent::Binary(bytes) => bytes.clone(),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Refuse destructive ops on files that differ from HEAD. The check is
/// scoped to the given path; unrelated dirty files elsewhere do not block.
fn guard_clean(repo: &Path, rel_path: &str, op: &str) -> Result<()> {
    if git::has_local_changes(repo, rel_path)? {
        return Err(ReviewError::Precondition(format!(
            "refusing to {op} '{rel_path}': local modifications detected"
        )));
    }
    Ok(())
}

/// Stage exactly *paths* and commit. Skips the commit when the index shows
/// nothing staged; resets the staged subset if the commit itself fails so no
/// partial index survives an error.
fn stage_and_commit(repo: &Path, paths: &[&str], message: &str) -> Result<ApplyOutcome> {
    git::stage_paths(repo, paths)?;
    commit_staged(repo, paths, message)
}

/// Commit pathspecs that are already staged (git rm / git mv stage as a side
/// effect; re-adding their vanished sources would fail).
fn commit_staged(repo: &Path, paths: &[&str], message: &str) -> Result<ApplyOutcome> {
    if !git::index_has_changes(repo) {
        debug!("nothing staged for '{message}', skipping commit");
        return Ok(ApplyOutcome::NoOp {
            reason: "nothing to commit".into(),
        });
    }

    match git::commit(repo, message) {
        Ok(commit_id) => {
            info!("committed: {message}");
            Ok(ApplyOutcome::Committed {
                commit_id,
                note: None,
            })
        }
        Err(e) => {
            git::unstage_paths(repo, paths);
            Err(e)
        }
    }
}

fn abs_target(repo: &Path, rel_path: &str) -> PathBuf {
    repo.join(rel_path)
}

/// Apply one validated patch to the working tree and commit it with exact
/// pathspec scoping. Preconditions fail with typed errors and leave the
/// tree untouched. The applier never retries; that is the caller's concern.
pub fn apply(repo: &Path, patch: &PatchPayload) -> Result<ApplyOutcome> {
    if !repo.join(".git").exists() {
        return Err(ReviewError::Git(format!(
            "not a git repository: {}",
            repo.display()
        )));
    }

    let rel = patch.file();
    info!("applying {} -> {}", patch.op_name(), rel);

    match &patch.action {
        PatchAction::Create { file, content } => {
            let dest = abs_target(repo, file);
            if dest.exists() {
                return Err(ReviewError::Precondition(format!(
                    "create target already exists: {file}"
                )));
            }
            ensure_parent(&dest)?;
            std::fs::write(&dest, content_bytes(content))?;
            stage_and_commit(repo, &[file], &format!("autoreview create: {file}"))
        }

        PatchAction::Update { file, content } => {
            let dest = abs_target(repo, file);
            if !dest.exists() {
                return Err(ReviewError::Precondition(format!(
                    "update target missing: {file}"
                )));
            }
            guard_clean(repo, file, "update")?;

            let new_bytes = content_bytes(content);
            let current = std::fs::read(&dest)?;
            if current == new_bytes {
                info!("no content change for {file}, skipping update");
                return Ok(ApplyOutcome::NoOp {
                    reason: format!("identical contents: {file}"),
                });
            }

            std::fs::write(&dest, new_bytes)?;
            stage_and_commit(repo, &[file], &format!("autoreview update: {file}"))
        }

        PatchAction::Delete { file } => {
            let dest = abs_target(repo, file);
            if !dest.exists() {
                return Err(ReviewError::Precondition(format!(
                    "delete target missing: {file}"
                )));
            }
            if dest.is_dir() {
                return Err(ReviewError::Precondition(format!(
                    "delete target is a directory: {file}"
                )));
            }
            guard_clean(repo, file, "delete")?;

            if git::is_tracked(repo, file) {
                // git rm removes the file and stages the deletion in one step.
                git::git(repo, &["rm", "--force", "-q", "--", file])?;
                commit_staged(repo, &[file], &format!("autoreview delete: {file}"))
            } else {
                // Reachable only for gitignored files; plain untracked ones
                // already failed the scoped dirty check.
                std::fs::remove_file(&dest)?;
                Ok(ApplyOutcome::NoOp {
                    reason: format!("deleted untracked file: {file}"),
                })
            }
        }

        PatchAction::Rename { file, target } => {
            let src = abs_target(repo, file);
            let dst = abs_target(repo, target);
            if !src.exists() {
                return Err(ReviewError::Precondition(format!(
                    "rename source missing: {file}"
                )));
            }
            if dst.exists() {
                return Err(ReviewError::Precondition(format!(
                    "rename target already exists: {target}"
                )));
            }
            guard_clean(repo, file, "rename")?;
            ensure_parent(&dst)?;

            let message = format!("autoreview rename: {file} -> {target}");
            if git::is_tracked(repo, file) {
                // git mv stages both sides of the rename.
                git::git(repo, &["mv", file, target])?;
                commit_staged(repo, &[file, target], &message)
            } else {
                std::fs::rename(&src, &dst)?;
                stage_and_commit(repo, &[target], &message)
            }
        }

        PatchAction::Chmod { file, mode } => {
            let dest = abs_target(repo, file);
            if !dest.exists() {
                return Err(ReviewError::Precondition(format!(
                    "chmod target missing: {file}"
                )));
            }
            guard_clean(repo, file, "chmod")?;
            apply_chmod(repo, file, &dest, *mode)
        }
    }
}

#[cfg(unix)]
fn apply_chmod(repo: &Path, rel: &str, dest: &Path, mode: FileMode) -> Result<ApplyOutcome> {
    use std::os::unix::fs::PermissionsExt;

    let current = std::fs::metadata(dest)?.permissions().mode() & 0o777;
    if current == mode.unix_bits() {
        info!("mode for {rel} already {}, skipping chmod", mode.as_octal());
        return Ok(ApplyOutcome::NoOp {
            reason: format!("mode already {}: {rel}", mode.as_octal()),
        });
    }

    std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode.unix_bits()))?;
    stage_and_commit(
        repo,
        &[rel],
        &format!("autoreview chmod {}: {rel}", mode.as_octal()),
    )
}

#[cfg(not(unix))]
fn apply_chmod(repo: &Path, rel: &str, _dest: &Path, mode: FileMode) -> Result<ApplyOutcome> {
    // The filesystem cannot represent the bit; record it in the index where
    // git tracks the mode, and flag the degraded effect for observability.
    git::index_chmod(repo, rel, mode == FileMode::Executable)?;
    let outcome = commit_staged(
        repo,
        &[rel],
        &format!("autoreview chmod {}: {rel}", mode.as_octal()),
    )?;
    Ok(match outcome {
        ApplyOutcome::Committed { commit_id, .. } => {
            tracing::warn!("chmod {rel}: executable bit recorded in index only");
            ApplyOutcome::Committed {
                commit_id,
                note: Some("executable bit recorded in index only".into()),
            }
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testutil::init_repo;
    use crate::patch::payload::PatchStatus;

    fn create_patch(file: &str, body: &str) -> PatchPayload {
        PatchPayload {
            action: PatchAction::Create {
                file: file.into(),
                content: FileContent::Text(body.into()),
            },
            status: PatchStatus::InProgress,
        }
    }

    fn update_patch(file: &str, body: &str) -> PatchPayload {
        PatchPayload {
            action: PatchAction::Update {
                file: file.into(),
                content: FileContent::Text(body.into()),
            },
            status: PatchStatus::InProgress,
        }
    }

    #[test]
    fn create_normalizes_and_scopes_commit() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).unwrap();

        // Unrelated dirty file must not block and must not be swept in.
        std::fs::write(dir.path().join("unrelated.txt"), "dirty\n").unwrap();

        let outcome = apply(dir.path(), &create_patch("hello.txt", "hello")).unwrap();
        let commit_id = match outcome {
            ApplyOutcome::Committed { commit_id, .. } => commit_id,
            other => panic!("expected commit, got {other:?}"),
        };

        let on_disk = std::fs::read_to_string(dir.path().join("hello.txt")).unwrap();
        assert_eq!(on_disk, "hello\n");
        assert_eq!(
            crate::git::commit_files(dir.path(), &commit_id).unwrap(),
            vec!["hello.txt"]
        );
    }

    #[test]
    fn create_existing_fails_without_commit() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).unwrap();
        apply(dir.path(), &create_patch("a.txt", "a")).unwrap();
        let head = crate::git::head_commit(dir.path());

        let err = apply(dir.path(), &create_patch("a.txt", "other")).unwrap_err();
        assert!(matches!(err, ReviewError::Precondition(_)));
        assert_eq!(crate::git::head_commit(dir.path()), head);
        assert!(!crate::git::index_has_changes(dir.path()));
    }

    #[test]
    fn update_identical_bytes_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).unwrap();
        apply(dir.path(), &create_patch("a.txt", "a")).unwrap();
        let head = crate::git::head_commit(dir.path());

        // "a" normalizes to "a\n", which equals what create wrote.
        let outcome = apply(dir.path(), &update_patch("a.txt", "a")).unwrap();
        assert!(matches!(outcome, ApplyOutcome::NoOp { .. }));
        assert_eq!(crate::git::head_commit(dir.path()), head);
    }

    #[test]
    fn update_dirty_file_refused() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).unwrap();
        apply(dir.path(), &create_patch("a.txt", "a")).unwrap();

        std::fs::write(dir.path().join("a.txt"), "local edit\n").unwrap();
        let err = apply(dir.path(), &update_patch("a.txt", "model edit")).unwrap_err();
        assert!(matches!(err, ReviewError::Precondition(_)));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "local edit\n"
        );
    }

    #[test]
    fn update_crlf_normalized() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).unwrap();
        apply(dir.path(), &create_patch("a.txt", "one\ntwo")).unwrap();

        let outcome = apply(dir.path(), &update_patch("a.txt", "one\r\ntwo\r\nthree")).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Committed { .. }));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "one\ntwo\nthree\n"
        );
    }

    #[test]
    fn rename_commit_touches_exactly_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).unwrap();
        apply(dir.path(), &create_patch("src.txt", "content")).unwrap();

        let patch = PatchPayload {
            action: PatchAction::Rename {
                file: "src.txt".into(),
                target: "dst.txt".into(),
            },
            status: PatchStatus::InProgress,
        };
        let outcome = apply(dir.path(), &patch).unwrap();
        let commit_id = match outcome {
            ApplyOutcome::Committed { commit_id, .. } => commit_id,
            other => panic!("expected commit, got {other:?}"),
        };

        assert!(!dir.path().join("src.txt").exists());
        assert!(dir.path().join("dst.txt").exists());

        let mut files = crate::git::commit_files(dir.path(), &commit_id).unwrap();
        files.sort();
        assert_eq!(files, vec!["dst.txt", "src.txt"]);
    }

    #[test]
    fn delete_tracked_file() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).unwrap();
        apply(dir.path(), &create_patch("gone.txt", "bye")).unwrap();

        let patch = PatchPayload {
            action: PatchAction::Delete {
                file: "gone.txt".into(),
            },
            status: PatchStatus::InProgress,
        };
        let outcome = apply(dir.path(), &patch).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Committed { .. }));
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[test]
    fn delete_missing_is_precondition_failure() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).unwrap();

        let patch = PatchPayload {
            action: PatchAction::Delete {
                file: "absent.txt".into(),
            },
            status: PatchStatus::InProgress,
        };
        assert!(matches!(
            apply(dir.path(), &patch).unwrap_err(),
            ReviewError::Precondition(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn chmod_toggles_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).unwrap();
        apply(dir.path(), &create_patch("run.sh", "#!/bin/sh\nexit 0")).unwrap();

        let patch = PatchPayload {
            action: PatchAction::Chmod {
                file: "run.sh".into(),
                mode: FileMode::Executable,
            },
            status: PatchStatus::InProgress,
        };
        let outcome = apply(dir.path(), &patch).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Committed { .. }));

        let mode = std::fs::metadata(dir.path().join("run.sh"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o755);

        // Applying the same mode again is a no-op.
        let outcome = apply(dir.path(), &patch).unwrap();
        assert!(matches!(outcome, ApplyOutcome::NoOp { .. }));
    }

    #[test]
    fn binary_body_written_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).unwrap();

        let bytes = vec![0u8, 159, 146, 150];
        let patch = PatchPayload {
            action: PatchAction::Create {
                file: "blob.bin".into(),
                content: FileContent::Binary(bytes.clone()),
            },
            status: PatchStatus::InProgress,
        };
        apply(dir.path(), &patch).unwrap();
        assert_eq!(std::fs::read(dir.path().join("blob.bin")).unwrap(), bytes);
    }
}
