use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;

/// Whether the model intends to keep patching after this payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStatus {
    InProgress,
    Completed,
}

impl PatchStatus {
    pub fn as_wire(&self) -> &'static str {
        match self {
            PatchStatus::InProgress => "in_progress",
            PatchStatus::Completed => "completed",
        }
    }
}

/// File content carried by Create/Update, decoded at validation time so the
/// applier only ever sees bytes it can write verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

/// Closed permission set for chmod. 3- and 4-digit octal spellings collapse
/// onto these two values at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Regular,
    Executable,
}

impl FileMode {
    pub fn from_octal(mode: &str) -> Option<Self> {
        let canonical = mode.strip_prefix('0').filter(|_| mode.len() == 4).unwrap_or(mode);
        match canonical {
            "644" => Some(FileMode::Regular),
            "755" => Some(FileMode::Executable),
            _ => None,
        }
    }

    pub fn as_octal(&self) -> &'static str {
        match self {
            FileMode::Regular => "644",
            FileMode::Executable => "755",
        }
    }

    #[cfg(unix)]
    pub fn unix_bits(&self) -> u32 {
        match self {
            FileMode::Regular => 0o644,
            FileMode::Executable => 0o755,
        }
    }
}

/// One variant per wire `op`; downstream code matches exhaustively, so a new
/// operation is a compile-time checked change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchAction {
    Create { file: String, content: FileContent },
    Update { file: String, content: FileContent },
    Delete { file: String },
    Rename { file: String, target: String },
    Chmod { file: String, mode: FileMode },
}

/// One validated, atomic change proposed by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPayload {
    pub action: PatchAction,
    pub status: PatchStatus,
}

impl PatchPayload {
    /// Primary repo-relative path this patch touches.
    pub fn file(&self) -> &str {
        match &self.action {
            PatchAction::Create { file, .. }
            | PatchAction::Update { file, .. }
            | PatchAction::Delete { file }
            | PatchAction::Rename { file, .. }
            | PatchAction::Chmod { file, .. } => file,
        }
    }

    pub fn op_name(&self) -> &'static str {
        match &self.action {
            PatchAction::Create { .. } => "create",
            PatchAction::Update { .. } => "update",
            PatchAction::Delete { .. } => "delete",
            PatchAction::Rename { .. } => "rename",
            PatchAction::Chmod { .. } => "chmod",
        }
    }

    /// Every pathspec this patch stages; the resulting commit must touch
    /// exactly these paths.
    pub fn pathspecs(&self) -> Vec<&str> {
        match &self.action {
            PatchAction::Rename { file, target } => vec![file, target],
            _ => vec![self.file()],
        }
    }

    /// Serialize back to the wire envelope. `parse(serialize(p)) == p`.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut obj = json!({
            "op": self.op_name(),
            "file": self.file(),
            "status": self.status.as_wire(),
        });
        let map = obj.as_object_mut().expect("literal object");

        match &self.action {
            PatchAction::Create { content, .. } | PatchAction::Update { content, .. } => {
                match content {
                    FileContent::Text(body) => {
                        map.insert("body".into(), json!(body));
                    }
                    FileContent::Binary(bytes) => {
                        map.insert("body_b64".into(), json!(BASE64.encode(bytes)));
                    }
                }
            }
            PatchAction::Rename { target, .. } => {
                map.insert("target".into(), json!(target));
            }
            PatchAction::Chmod { mode, .. } => {
                map.insert("mode".into(), json!(mode.as_octal()));
            }
            PatchAction::Delete { .. } => {}
        }

        obj
    }

    pub fn to_json_string(&self) -> String {
        self.to_wire().to_string()
    }
}
