use std::collections::BTreeMap;
use std::path::Path;

use ignore::WalkBuilder;
use tracing::{debug, info};

use crate::error::Result;

/// Syntactic classification driving iteration ordering: code and docs are
/// reviewed from iteration 1, deferred files (setup, CI, examples) wait for
/// the final iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Code,
    Doc,
    Deferred,
}

impl FileKind {
    pub fn tag(&self) -> &'static str {
        match self {
            FileKind::Code => "code",
            FileKind::Doc => "doc",
            FileKind::Deferred => "deferred",
        }
    }

    /// Whether writes to this kind are accepted in the given iteration.
    pub fn allowed_in_iteration(&self, iteration: u32) -> bool {
        match self {
            FileKind::Code | FileKind::Doc => true,
            FileKind::Deferred => iteration >= 3,
        }
    }
}

const DOC_EXTS: &[&str] = &["md", "rst", "adoc", "txt"];

const DOC_BASENAMES: &[&str] = &[
    "README",
    "CHANGELOG",
    "CONTRIBUTING",
    "LICENSE",
    "SECURITY",
    "CODE_OF_CONDUCT",
];

const DEFERRED_BASENAMES: &[&str] = &[
    "Dockerfile",
    "Makefile",
    "docker-compose.yml",
    "docker-compose.yaml",
    "setup.py",
    "pyproject.toml",
    "requirements.txt",
    "install.sh",
    "update.sh",
];

const DEFERRED_DIRS: &[&str] = &["examples", "example", "samples", "sample", "ci", ".ci", ".github"];

const BINARY_EXTS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "avif", "pdf", "zip", "gz", "tgz", "xz",
    "tar", "7z", "rar", "bz2", "zst", "woff", "woff2", "ttf", "otf", "eot", "mp3", "aac", "flac",
    "wav", "mp4", "mov", "avi", "mkv", "webm", "bin", "exe", "dll", "dylib", "so", "class",
];

/// Classify a repo-relative POSIX path. Purely syntactic: extension and
/// top-level location only, never content.
pub fn classify_path(rel_path: &str) -> FileKind {
    let first_segment = rel_path.split('/').next().unwrap_or("");
    let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
    let stem = basename.split('.').next().unwrap_or(basename);
    let ext = basename.rsplit('.').next().filter(|e| *e != basename);

    if DEFERRED_DIRS.contains(&first_segment) || DEFERRED_BASENAMES.contains(&basename) {
        return FileKind::Deferred;
    }

    if first_segment == "docs"
        || DOC_BASENAMES.contains(&stem)
        || ext.is_some_and(|e| DOC_EXTS.contains(&e.to_lowercase().as_str()))
    {
        return FileKind::Doc;
    }

    FileKind::Code
}

fn sniff_binary(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if BINARY_EXTS.contains(&ext.to_lowercase().as_str()) {
            return true;
        }
    }
    match std::fs::read(path) {
        Ok(bytes) => bytes.iter().take(2048).any(|b| *b == 0),
        Err(_) => true,
    }
}

#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub path: String,
    pub kind: FileKind,
    pub binary: bool,
}

/// Deterministic inventory of the working tree. Never mutates the repo.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Walk *root* respecting gitignore rules plus *extra_ignores* (matched
    /// against any path component). `.git` is always excluded. Entries come
    /// back lexicographically sorted for reproducible prompts.
    pub fn scan(root: &Path, extra_ignores: &[String]) -> Result<Self> {
        let mut entries = Vec::new();

        let mut builder = WalkBuilder::new(root);
        builder
            .standard_filters(true)
            .git_ignore(true)
            .follow_links(false)
            .hidden(false);

        for entry in builder.build() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("walk error: {e}");
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let rel = match path.strip_prefix(root) {
                Ok(p) => p.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            let first = rel.split('/').next().unwrap_or("");
            if first == ".git" {
                continue;
            }
            if rel
                .split('/')
                .any(|seg| extra_ignores.iter().any(|ig| ig == seg))
            {
                continue;
            }

            entries.push(ManifestEntry {
                kind: classify_path(&rel),
                binary: sniff_binary(path),
                path: rel,
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let (code, doc, deferred) = count_kinds(&entries);
        info!(
            "scanned {} files: {code} code, {doc} doc, {deferred} deferred",
            entries.len()
        );

        Ok(Self { entries })
    }

    /// Text files to review in the given iteration, in manifest order.
    pub fn files_for_iteration(&self, iteration: u32) -> Vec<&ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| !e.binary && e.kind.allowed_in_iteration(iteration))
            .collect()
    }

    /// Bounded textual listing with classification tags; files beyond
    /// *max_lines* are elided from the middle so both ends stay visible.
    pub fn render(&self, max_lines: usize) -> String {
        let lines: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{} [{}]", e.path, e.kind.tag()))
            .collect();

        if lines.len() <= max_lines {
            return lines.join("\n");
        }

        let half = max_lines / 2;
        let head = lines[..half].join("\n");
        let tail = lines[lines.len() - half..].join("\n");
        format!("{head}\n… ({} more files)\n{tail}", lines.len() - 2 * half)
    }

    /// Compact `ext:count` tally for prompt context, most common first.
    pub fn census(&self) -> Vec<String> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for entry in &self.entries {
            let ext = entry
                .path
                .rsplit('/')
                .next()
                .and_then(|base| base.rsplit_once('.').map(|(_, e)| e))
                .unwrap_or("other");
            *counts.entry(ext.to_string()).or_default() += 1;
        }
        let mut pairs: Vec<(String, usize)> = counts.into_iter().collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        pairs.into_iter().map(|(k, v)| format!("{k}:{v}")).collect()
    }
}

fn count_kinds(entries: &[ManifestEntry]) -> (usize, usize, usize) {
    let mut counts = (0, 0, 0);
    for e in entries {
        match e.kind {
            FileKind::Code => counts.0 += 1,
            FileKind::Doc => counts.1 += 1,
            FileKind::Deferred => counts.2 += 1,
        }
    }
    counts
}
