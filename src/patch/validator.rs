use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::error::{Result, ReviewError};
use crate::patch::payload::{FileContent, FileMode, PatchAction, PatchPayload, PatchStatus};

const KNOWN_KEYS: &[&str] = &["op", "file", "body", "body_b64", "target", "mode", "status"];

/// The only place path acceptance is decided. A path is safe when it is
/// non-empty, relative, backslash-free, has no `..` segment, does not start
/// with `.git`, and normalizes to itself (no empty or `.` segments, no
/// trailing slash).
pub fn is_safe_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return false;
    }
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
        return false;
    }
    segments[0] != ".git"
}

fn require_safe(path: &str) -> Result<String> {
    if is_safe_path(path) {
        Ok(path.to_string())
    } else {
        Err(ReviewError::UnsafePath(path.to_string()))
    }
}

fn str_field(obj: &serde_json::Map<String, Value>, key: &str) -> Result<Option<String>> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ReviewError::SchemaViolation(format!(
            "field '{key}' must be a string, got {other}"
        ))),
    }
}

fn required_str(obj: &serde_json::Map<String, Value>, key: &str) -> Result<String> {
    str_field(obj, key)?
        .ok_or_else(|| ReviewError::SchemaViolation(format!("missing required field '{key}'")))
}

fn forbid(obj: &serde_json::Map<String, Value>, op: &str, keys: &[&str]) -> Result<()> {
    for key in keys {
        if obj.contains_key(*key) {
            return Err(ReviewError::SchemaViolation(format!(
                "field '{key}' is not allowed for op '{op}'"
            )));
        }
    }
    Ok(())
}

fn content_fields(obj: &serde_json::Map<String, Value>, file: &str) -> Result<FileContent> {
    let body = str_field(obj, "body")?;
    let body_b64 = str_field(obj, "body_b64")?;

    match (body, body_b64) {
        (Some(_), Some(_)) => Err(ReviewError::SchemaViolation(
            "'body' and 'body_b64' are mutually exclusive".into(),
        )),
        (Some(text), None) => Ok(FileContent::Text(text)),
        (None, Some(encoded)) => BASE64
            .decode(encoded.as_bytes())
            .map(FileContent::Binary)
            .map_err(|e| ReviewError::SchemaViolation(format!("invalid base64 in body_b64: {e}"))),
        (None, None) => Err(ReviewError::MissingContent(file.to_string())),
    }
}

/// Parse one raw assistant reply into a validated payload. The input must be
/// exactly one JSON object: prose, code fences, or trailing content fail
/// with `MalformedEnvelope`. Pure; performs no I/O.
pub fn validate(raw: &str) -> Result<PatchPayload> {
    let value: Value = serde_json::from_str(raw.trim())
        .map_err(|e| ReviewError::MalformedEnvelope(e.to_string()))?;

    let obj = value
        .as_object()
        .ok_or_else(|| ReviewError::MalformedEnvelope("payload is not a JSON object".into()))?;

    if let Some(unknown) = obj.keys().find(|k| !KNOWN_KEYS.contains(&k.as_str())) {
        return Err(ReviewError::SchemaViolation(format!(
            "unknown field '{unknown}'"
        )));
    }

    let status = match required_str(obj, "status")?.as_str() {
        "in_progress" => PatchStatus::InProgress,
        "completed" => PatchStatus::Completed,
        other => {
            return Err(ReviewError::SchemaViolation(format!(
                "invalid status '{other}'"
            )))
        }
    };

    let op = required_str(obj, "op")?;
    let file = require_safe(&required_str(obj, "file")?)?;

    let action = match op.as_str() {
        "create" => {
            forbid(obj, "create", &["target", "mode"])?;
            PatchAction::Create {
                content: content_fields(obj, &file)?,
                file,
            }
        }
        "update" => {
            forbid(obj, "update", &["target", "mode"])?;
            PatchAction::Update {
                content: content_fields(obj, &file)?,
                file,
            }
        }
        "delete" => {
            forbid(obj, "delete", &["body", "body_b64", "target", "mode"])?;
            PatchAction::Delete { file }
        }
        "rename" => {
            forbid(obj, "rename", &["body", "body_b64", "mode"])?;
            let target = require_safe(&required_str(obj, "target")?)?;
            PatchAction::Rename { file, target }
        }
        "chmod" => {
            forbid(obj, "chmod", &["body", "body_b64", "target"])?;
            let mode_str = required_str(obj, "mode")?;
            let mode = FileMode::from_octal(&mode_str)
                .ok_or(ReviewError::ForbiddenMode(mode_str))?;
            PatchAction::Chmod { file, mode }
        }
        other => {
            return Err(ReviewError::SchemaViolation(format!("unknown op '{other}'")))
        }
    };

    Ok(PatchPayload { action, status })
}

/// Canonical JSON Schema of the wire envelope, served by the `schema`
/// subcommand and mirrored by the HTTP transport's tool definition.
pub fn envelope_schema() -> Value {
    serde_json::json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "Patch envelope",
        "type": "object",
        "properties": {
            "op": { "type": "string", "enum": ["create", "update", "delete", "rename", "chmod"] },
            "file": { "type": "string", "minLength": 1 },
            "body": { "type": "string" },
            "body_b64": { "type": "string" },
            "target": { "type": "string", "minLength": 1 },
            "mode": { "type": "string", "enum": ["644", "755", "0644", "0755"] },
            "status": { "type": "string", "enum": ["in_progress", "completed"] }
        },
        "required": ["op", "file", "status"],
        "additionalProperties": false,
        "allOf": [
            {
                "if": { "properties": { "op": { "enum": ["create", "update"] } } },
                "then": { "oneOf": [ { "required": ["body"] }, { "required": ["body_b64"] } ] }
            },
            {
                "if": { "properties": { "op": { "const": "rename" } } },
                "then": { "required": ["target"] }
            },
            {
                "if": { "properties": { "op": { "const": "chmod" } } },
                "then": { "required": ["mode"] }
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_predicate() {
        assert!(is_safe_path("a.txt"));
        assert!(is_safe_path("src/deep/nested/mod.rs"));
        assert!(is_safe_path(".github/workflows/ci.yml"));
        assert!(is_safe_path(".gitignore"));

        assert!(!is_safe_path(""));
        assert!(!is_safe_path("/etc/passwd"));
        assert!(!is_safe_path("../secret"));
        assert!(!is_safe_path("a/../b"));
        assert!(!is_safe_path("a/./b"));
        assert!(!is_safe_path("a//b"));
        assert!(!is_safe_path("a/b/"));
        assert!(!is_safe_path("a\\b"));
        assert!(!is_safe_path(".git/config"));
        assert!(!is_safe_path(".git"));
    }

    #[test]
    fn unsafe_path_rejected() {
        let err = validate(r#"{"op":"update","file":"../secret","body":"x","status":"in_progress"}"#)
            .unwrap_err();
        assert!(matches!(err, ReviewError::UnsafePath(p) if p == "../secret"));
    }

    #[test]
    fn prose_and_fences_rejected() {
        let fenced = "```json\n{\"op\":\"delete\",\"file\":\"a\",\"status\":\"completed\"}\n```";
        assert!(matches!(
            validate(fenced).unwrap_err(),
            ReviewError::MalformedEnvelope(_)
        ));

        let prose = "Sure! Here is the patch: {\"op\":\"delete\",\"file\":\"a\",\"status\":\"completed\"}";
        assert!(matches!(
            validate(prose).unwrap_err(),
            ReviewError::MalformedEnvelope(_)
        ));

        let two = r#"{"op":"delete","file":"a","status":"completed"}{"op":"delete","file":"b","status":"completed"}"#;
        assert!(matches!(
            validate(two).unwrap_err(),
            ReviewError::MalformedEnvelope(_)
        ));

        assert!(matches!(
            validate("[1,2,3]").unwrap_err(),
            ReviewError::MalformedEnvelope(_)
        ));
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = validate(
            r#"{"op":"delete","file":"a","status":"completed","note":"extra"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ReviewError::SchemaViolation(msg) if msg.contains("note")));
    }

    #[test]
    fn content_exclusivity() {
        let both = r#"{"op":"create","file":"a","body":"x","body_b64":"eA==","status":"in_progress"}"#;
        assert!(matches!(
            validate(both).unwrap_err(),
            ReviewError::SchemaViolation(_)
        ));

        let none = r#"{"op":"update","file":"a","status":"in_progress"}"#;
        assert!(matches!(
            validate(none).unwrap_err(),
            ReviewError::MissingContent(f) if f == "a"
        ));
    }

    #[test]
    fn bad_base64_rejected() {
        let raw = r#"{"op":"create","file":"a.bin","body_b64":"not base64!!","status":"in_progress"}"#;
        assert!(matches!(
            validate(raw).unwrap_err(),
            ReviewError::SchemaViolation(_)
        ));
    }

    #[test]
    fn chmod_mode_allow_list() {
        let bad = r#"{"op":"chmod","file":"run.sh","mode":"700","status":"in_progress"}"#;
        assert!(matches!(
            validate(bad).unwrap_err(),
            ReviewError::ForbiddenMode(m) if m == "700"
        ));

        let ok = r#"{"op":"chmod","file":"run.sh","mode":"0755","status":"in_progress"}"#;
        let patch = validate(ok).unwrap();
        assert!(matches!(
            patch.action,
            PatchAction::Chmod { mode: FileMode::Executable, .. }
        ));
    }

    #[test]
    fn rename_requires_safe_target() {
        let raw = r#"{"op":"rename","file":"a.txt","target":".git/hooks/x","status":"in_progress"}"#;
        assert!(matches!(validate(raw).unwrap_err(), ReviewError::UnsafePath(_)));

        let missing = r#"{"op":"rename","file":"a.txt","status":"in_progress"}"#;
        assert!(matches!(
            validate(missing).unwrap_err(),
            ReviewError::SchemaViolation(_)
        ));
    }

    #[test]
    fn stray_fields_per_op_rejected() {
        let raw = r#"{"op":"delete","file":"a","body":"x","status":"completed"}"#;
        assert!(matches!(
            validate(raw).unwrap_err(),
            ReviewError::SchemaViolation(_)
        ));

        let raw = r#"{"op":"create","file":"a","body":"x","target":"b","status":"completed"}"#;
        assert!(matches!(
            validate(raw).unwrap_err(),
            ReviewError::SchemaViolation(_)
        ));
    }

    #[test]
    fn round_trip_all_ops() {
        let samples = [
            r#"{"op":"create","file":"src/lib.rs","body":"pub fn x() {}\n","status":"in_progress"}"#,
            r#"{"op":"update","file":"a.bin","body_b64":"iVBF","status":"in_progress"}"#,
            r#"{"op":"delete","file":"old.txt","status":"in_progress"}"#,
            r#"{"op":"rename","file":"a.txt","target":"b.txt","status":"in_progress"}"#,
            r#"{"op":"chmod","file":"run.sh","mode":"755","status":"completed"}"#,
        ];
        for raw in samples {
            let parsed = validate(raw).unwrap();
            let reparsed = validate(&parsed.to_json_string()).unwrap();
            assert_eq!(parsed, reparsed, "round-trip failed for {raw}");
        }
    }
}
