use std::path::Path;

use tracing::debug;

/// The four canonical foundation documents, generated up front when missing
/// and summarized into every prompt.
pub const BLUEPRINTS: &[(&str, &str)] = &[
    ("Whitepaper", "WHITEPAPER.md"),
    ("Build Guide", "BUILD_GUIDE.md"),
    ("System Design", "DESIGN.md"),
    ("Project Instructions", "INSTRUCTIONS.md"),
];

#[derive(Debug, Clone)]
pub struct BlueprintDoc {
    pub label: &'static str,
    /// Repo-relative POSIX path, suitable for patch payloads.
    pub rel_path: String,
    pub present: bool,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct BlueprintSet {
    pub docs: Vec<BlueprintDoc>,
}

pub fn blueprint_dir(state_dir: &str) -> String {
    format!("{state_dir}/blueprints")
}

impl BlueprintSet {
    /// Inspect the repo for the four documents. Never mutates anything;
    /// missing documents are filled in through the patch pipeline.
    pub fn detect(repo: &Path, state_dir: &str) -> Self {
        let dir = blueprint_dir(state_dir);
        let docs = BLUEPRINTS
            .iter()
            .map(|(label, filename)| {
                let rel_path = format!("{dir}/{filename}");
                let size = std::fs::metadata(repo.join(&rel_path))
                    .map(|m| m.len())
                    .unwrap_or(0);
                BlueprintDoc {
                    label,
                    present: size > 0,
                    size,
                    rel_path,
                }
            })
            .collect();
        Self { docs }
    }

    pub fn missing(&self) -> Vec<&BlueprintDoc> {
        self.docs.iter().filter(|d| !d.present).collect()
    }

    pub fn all_present(&self) -> bool {
        self.docs.iter().all(|d| d.present)
    }

    /// Compact concatenated summary for prompts. Each section carries an H2
    /// header and either a trimmed body or `<missing>`; per-document bodies
    /// are capped by *byte_budget*.
    pub fn summary(&self, repo: &Path, byte_budget: usize) -> String {
        let mut parts = Vec::new();
        for doc in &self.docs {
            let body = std::fs::read_to_string(repo.join(&doc.rel_path))
                .unwrap_or_default()
                .replace("\r\n", "\n")
                .replace('\r', "\n");
            let body = body.trim();
            if body.is_empty() {
                parts.push(format!("## {}\n<missing>\n", doc.label));
                continue;
            }
            let trimmed = if body.len() > byte_budget {
                let mut cut = byte_budget;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                format!("{}\n…\n", &body[..cut])
            } else {
                format!("{body}\n")
            };
            parts.push(format!("## {}\n{trimmed}", doc.label));
        }
        let summary = parts.join("\n");
        debug!("blueprint summary prepared ({} bytes)", summary.len());
        summary
    }
}
