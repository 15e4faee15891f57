use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RESUME_FILE;
use crate::error::Result;

/// Written after every successful commit so a crashed run can pick up where
/// it left off. Honored only while its commit id still matches HEAD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub last_file: String,
    pub commit: String,
    pub step: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationHint {
    pub path: String,
    pub kind: String,
}

/// Structured output of the plan-first step. The JSON artifact is the source
/// of truth; the markdown twin is regenerated on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationPlan {
    pub overview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_command: Option<String>,
    #[serde(default)]
    pub classification_hints: Vec<ClassificationHint>,
    pub estimated_iterations: u32,
}

impl IterationPlan {
    /// Clamp the model's estimate into the supported 1..=3 range.
    pub fn clamped(mut self) -> Self {
        self.estimated_iterations = self.estimated_iterations.clamp(1, 3);
        self
    }

    pub fn to_markdown(&self, heading: &str) -> String {
        let run = self
            .run_command
            .as_deref()
            .map(|c| format!("- `{c}`\n"))
            .unwrap_or_else(|| "_none_\n".to_string());

        let hints = if self.classification_hints.is_empty() {
            "_none_\n".to_string()
        } else {
            self.classification_hints
                .iter()
                .map(|h| format!("- `{}` → {}\n", h.path, h.kind))
                .collect()
        };

        format!(
            "# {heading}\n\n{overview}\n\n## Run command\n{run}\n## Classification hints\n{hints}\n## Estimated iterations\n{n}\n",
            overview = self.overview.trim(),
            n = self.estimated_iterations,
        )
    }
}

/// Owns all on-disk run artifacts: the resume record at the repo root and
/// the plan pairs under the state directory. Every write is atomic
/// (temp file, fsync, rename); every read tolerates absence or corruption.
#[derive(Debug, Clone)]
pub struct StateStore {
    repo: PathBuf,
    state_dir: String,
}

impl StateStore {
    pub fn new(repo: &Path, state_dir: &str) -> Self {
        Self {
            repo: repo.to_path_buf(),
            state_dir: state_dir.to_string(),
        }
    }

    fn resume_path(&self) -> PathBuf {
        self.repo.join(RESUME_FILE)
    }

    fn dir(&self) -> PathBuf {
        self.repo.join(&self.state_dir)
    }

    fn initial_plan_path(&self) -> PathBuf {
        self.dir().join("initial_plan.json")
    }

    // ── resume record ─────────────────────────────────────────────────────

    pub fn save_resume(&self, record: &ResumeRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.resume_path(), &bytes)?;
        debug!(
            "resume record saved (step={}, commit={})",
            record.step, record.commit
        );
        Ok(())
    }

    /// Load the resume record, treating a missing or unparsable file as
    /// "no state".
    pub fn load_resume(&self) -> Option<ResumeRecord> {
        let raw = std::fs::read_to_string(self.resume_path()).ok()?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("resume record unreadable, ignoring: {e}");
                None
            }
        }
    }

    /// Resume only when the recorded commit matches HEAD; a kill between a
    /// commit and the record write shows up as a mismatch and degrades to a
    /// fresh start.
    pub fn load_resume_for(&self, head: Option<&str>) -> Option<ResumeRecord> {
        let record = self.load_resume()?;
        match head {
            Some(head) if head == record.commit => Some(record),
            _ => {
                info!("resume record does not match HEAD, starting fresh");
                None
            }
        }
    }

    pub fn clear_resume(&self) {
        let _ = std::fs::remove_file(self.resume_path());
    }

    // ── plan artifacts ────────────────────────────────────────────────────

    pub fn write_initial_plan(&self, plan: &IterationPlan) -> Result<()> {
        self.write_plan(plan, "initial_plan.json", "INITIAL_PLAN.md", "Initial Review Plan")
    }

    pub fn write_review_plan(&self, plan: &IterationPlan) -> Result<()> {
        self.write_plan(plan, "review_plan.json", "REVIEW_PLAN.md", "Review Plan")
    }

    fn write_plan(
        &self,
        plan: &IterationPlan,
        json_name: &str,
        md_name: &str,
        heading: &str,
    ) -> Result<()> {
        let dir = self.dir();
        std::fs::create_dir_all(&dir)?;

        let mut json = serde_json::to_vec_pretty(plan)?;
        json.push(b'\n');
        write_atomic(&dir.join(json_name), &json)?;
        write_atomic(&dir.join(md_name), plan.to_markdown(heading).as_bytes())?;
        info!("plan artifacts written: {json_name} + {md_name}");
        Ok(())
    }

    pub fn load_initial_plan(&self) -> Option<IterationPlan> {
        let raw = std::fs::read_to_string(self.initial_plan_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

/// Write *bytes* to *path* durably: sibling temp file, fsync, rename over.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
