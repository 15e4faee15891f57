//! Prompt builders for every model-facing turn. All prompts instruct the
//! model to answer through the structured patch/plan channel only.

use crate::error::ReviewError;
use crate::state::IterationPlan;

pub fn system_prompt() -> String {
    "You are an automated code reviewer operating patch-by-patch. \
     For every request you MUST respond only through the provided function, \
     changing exactly one file per reply with a COMPLETE file body (never a diff). \
     Keep changes minimal and self-contained. \
     Use status='in_progress' while more patches remain and status='completed' \
     when you have no further changes."
        .to_string()
}

pub fn initial_prompt(
    instructions: &str,
    manifest: &str,
    census: &[String],
    blueprints_summary: &str,
) -> String {
    format!(
        r#"Project instructions:
{instructions}

Foundation documents (abridged):
{blueprints_summary}

Repository manifest (classification in brackets):
```
{manifest}
```

File census: {census}

Work one file at a time. Return exactly one patch per reply through the
function call, and set status='completed' once nothing is left to change."#,
        instructions = instructions.trim(),
        census = census.join(", "),
    )
}

pub fn iteration_prompt(iteration: u32, total: u32, manifest: &str) -> String {
    let scope = if iteration >= 3 {
        "All files are in scope, including setup, CI, and example files."
    } else {
        "Only code and documentation files are in scope; setup, CI, and \
         example files are deferred to the final iteration."
    };
    format!(
        r#"Starting review iteration {iteration} of {total}.

{scope}

Current repository manifest:
```
{manifest}
```

Propose your next patch, or set status='completed' if this iteration needs
no further changes."#,
    )
}

pub fn plan_prompt(instructions: &str, manifest: &str, blueprints_summary: &str) -> String {
    format!(
        r#"Before any edits, produce an execution plan for reviewing this repository.

Project instructions:
{instructions}

Foundation documents (abridged):
{blueprints_summary}

Repository manifest:
```
{manifest}
```

Call the planning function with an overview, the single shell command that
best verifies the software (omit it when none applies), per-file
classification hints, and how many review iterations (1-3) you estimate."#,
        instructions = instructions.trim(),
    )
}

pub fn blueprint_prompt(label: &str, rel_path: &str, instructions: &str, manifest: &str) -> String {
    format!(
        r#"The foundation document "{label}" is missing.

Write it now as a self-contained Markdown file tailored to this repository,
and return it as a single create patch for `{rel_path}` with
status='in_progress'.

Project instructions:
{instructions}

Repository manifest:
```
{manifest}
```"#,
        instructions = instructions.trim(),
    )
}

/// Structured retry message for a rejected payload; recorded in the
/// conversation so the model sees its own mistake.
pub fn retry_prompt(error: &ReviewError) -> String {
    let hint = match error {
        ReviewError::MalformedEnvelope(_) => {
            "Reply with exactly one JSON object through the function call: \
             no prose, no code fences, no second object."
        }
        ReviewError::SchemaViolation(_) => {
            "Use only the documented fields with the documented enums, and \
             exactly one of body/body_b64 for create/update."
        }
        ReviewError::UnsafePath(_) => {
            "Paths must be repo-relative POSIX: no leading '/', no '..', no \
             backslashes, and nothing under .git/."
        }
        ReviewError::ForbiddenMode(_) => "Only modes 644 and 755 are permitted.",
        ReviewError::MissingContent(_) => {
            "Create/update patches must carry the complete file in body or body_b64."
        }
        ReviewError::Precondition(_) => {
            "Check the current repository state: the file may already exist, \
             be missing, or carry local changes. Pick a consistent operation."
        }
        _ => "Correct the patch and resend it.",
    };
    format!("The previous patch was rejected: {error}\n\n{hint}\n\nSend a corrected patch.")
}

pub fn deferred_prompt(file: &str, iteration: u32) -> String {
    format!(
        "`{file}` is a setup/example/CI file and is deferred until the final \
         iteration; iteration {iteration} only accepts code and documentation \
         files. Continue with an in-scope file or set status='completed'."
    )
}

pub fn continue_prompt() -> String {
    "continue".to_string()
}

pub fn error_log_prompt(command: &str, chunk: &str, index: usize, total: usize) -> String {
    if total > 1 {
        format!(
            "The command `{command}` failed (log chunk {index}/{total}):\n```text\n{chunk}\n```"
        )
    } else {
        format!(
            r#"The command `{command}` failed. Here is the tail of its output:
```text
{chunk}
```

Fix the underlying problem one file at a time through the function call.
Set status='completed' once you believe the command will pass."#
        )
    }
}

pub fn error_log_final_prompt(command: &str) -> String {
    format!(
        "That is the full failing output of `{command}`. Fix the underlying \
         problem one file at a time through the function call, and set \
         status='completed' once you believe the command will pass."
    )
}

pub fn plan_retry_prompt(problem: &str) -> String {
    format!(
        "The plan reply could not be used: {problem}\n\nCall the planning \
         function again with an overview, an optional run_command, \
         classification_hints, and estimated_iterations between 1 and 3."
    )
}

/// Render the accepted plan back to the model as shared context.
pub fn plan_ack_prompt(plan: &IterationPlan) -> String {
    format!(
        "Plan accepted: {overview}\nVerification command: {cmd}\nEstimated iterations: {n}",
        overview = plan.overview.trim(),
        cmd = plan.run_command.as_deref().unwrap_or("(none)"),
        n = plan.estimated_iterations,
    )
}

/// Split a log tail into prompt-sized chunks, at least one.
pub fn chunk_log(tail: &str, chunk_bytes: usize) -> Vec<String> {
    if tail.len() <= chunk_bytes {
        return vec![tail.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = tail;
    while !rest.is_empty() {
        let mut cut = rest.len().min(chunk_bytes);
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, remainder) = rest.split_at(cut);
        chunks.push(head.to_string());
        rest = remainder;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_preserves_content() {
        let text = "x".repeat(10) + &"y".repeat(10) + &"z".repeat(5);
        let chunks = chunk_log(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.join(""), text);

        let single = chunk_log("short", 100);
        assert_eq!(single, vec!["short".to_string()]);
    }

    #[test]
    fn chunking_respects_utf8_boundaries() {
        let text = "héllo wörld ".repeat(20);
        let chunks = chunk_log(&text, 7);
        assert_eq!(chunks.join(""), text);
        for chunk in chunks {
            assert!(chunk.len() <= 7);
        }
    }

    #[test]
    fn retry_prompt_names_the_error() {
        let err = ReviewError::ForbiddenMode("700".into());
        let prompt = retry_prompt(&err);
        assert!(prompt.contains("700"));
        assert!(prompt.contains("644"));
    }
}
