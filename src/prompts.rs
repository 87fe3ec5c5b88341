//! Centralized prompt definitions for fix generation
//!
//! One system prompt shared by every request, plus a per-category user
//! prompt template. Templates use `{placeholder}` slots filled by
//! [`route`].

use crate::healing::HealingRequest;
use crate::storage::FailureType;

/// Character budget for log excerpts in a prompt.
pub const LOG_BUDGET_CHARS: usize = 3000;

const TRUNCATION_MARKER: &str = "\n\n[... logs truncated ...]\n\n";
const NO_LOGS: &str = "[no logs available]";
const NOT_PROVIDED: &str = "[not provided]";

/// System prompt for the healing agent.
pub const SYSTEM_PROMPT: &str = r#"You are a CI healing agent: a senior DevOps engineer fluent in
- JVM services and their Maven/Gradle builds
- JUnit 5 and TestNG
- Docker images and compose files
- GitHub Actions pipelines
- dependency management

STRICT RULES:
1. Reason step by step before proposing a fix
2. Never change business logic
3. Never remove, skip or weaken tests, never lower coverage
4. Propose the smallest change that fixes the failure
5. If your confidence is below 0.75, set fixType to ESCALATE
6. Explain the fix in plain English for the developer
7. Respond with JSON only: no prose, no markdown fences
8. If the logs do not contain enough information, say so explicitly

CONFIDENCE SCORING:
0.90 - 1.00 : exact known pattern, fix is certain
0.75 - 0.89 : strong signal, very likely to work
0.50 - 0.74 : plausible but uncertain, needs human review
0.00 - 0.49 : insufficient context, always ESCALATE"#;

/// JSON shape every response must follow.
pub const RESPONSE_SCHEMA: &str = r#"{
  "failureSummary": "one sentence",
  "rootCause": "technical explanation",
  "fixExplanation": "plain english for the developer",
  "fixType": "CODE_CHANGE | CONFIG_CHANGE | ESCALATE",
  "filesToModify": [{"filePath": "...", "changeType": "CREATE | MODIFY | DELETE", "oldContent": "...", "newContent": "...", "lineNumber": 0, "reason": "..."}],
  "commands": ["command that verifies the fix"],
  "confidenceScore": 0.85,
  "humanReadableReason": "shown on the dashboard",
  "preventionTips": ["tip"]
}"#;

const BUILD_COMPILE_TEMPLATE: &str = r#"PIPELINE FAILURE REPORT
=======================
Failure Type : BUILD_COMPILE
Build Tool   : {build_tool}
Language     : {language}

REPOSITORY STRUCTURE:
{repo_structure}

RECENT COMMITS:
{recent_commits}

FAILED BUILD LOGS:
{logs}

TASK:
Step 1 - DIAGNOSE: quote the exact compiler error.
Step 2 - LOCATE: name the file(s) and line(s) that must change.
Step 3 - FIX: write the minimal change; leave unrelated code alone.
Step 4 - VERIFY: state any risk the change introduces.
Step 5 - SCORE: confidence from 0.0 to 1.0.

Respond with this JSON:
{schema}"#;

const TEST_FAILURE_TEMPLATE: &str = r#"PIPELINE FAILURE REPORT
=======================
Failure Type : TEST_FAILURE
Language     : {language}

RECENT COMMITS:
{recent_commits}

FAILED TEST LOGS:
{logs}

Do not remove, skip or weaken tests. Change the test only when its assertion is
genuinely wrong; otherwise fix production code.

Step 1 - IDENTIFY: is this a code bug or a test bug?
Step 2 - LOCATE: the class and method that need to change.
Step 3 - FIX: minimal change, production code preferred.
Step 4 - VERIFY: which tests prove the fix.
Step 5 - SCORE: confidence from 0.0 to 1.0.

Respond with this JSON:
{schema}"#;

const DEPENDENCY_TEMPLATE: &str = r#"PIPELINE FAILURE REPORT
=======================
Failure Type : DEPENDENCY_CONFLICT
Build Tool   : {build_tool}

BUILD FILE CONTENT:
{build_file}

FAILED BUILD LOGS:
{logs}

Step 1 - IDENTIFY the conflicting dependencies and their versions.
Step 2 - LOCATE the declaration that pulls the wrong version.
Step 3 - FIX with an explicit version override (prefer BOM-managed versions).
Step 4 - VERIFY that no other dependency breaks.
Step 5 - SCORE: confidence from 0.0 to 1.0.

Respond with this JSON, fixType CONFIG_CHANGE:
{schema}"#;

const INFRASTRUCTURE_TEMPLATE: &str = r#"PIPELINE FAILURE REPORT
=======================
Failure Type : INFRASTRUCTURE
Environment  : {environment}

CI/CD WORKFLOW:
{workflow_file}

FAILED LOGS:
{logs}

Step 1 - CLASSIFY: OOM_HEAP | NETWORK_TIMEOUT | DISK_FULL | OTHER.
Step 2 - LOCATE: configuration problem or a real resource limit?
Step 3 - FIX: configuration change first, workflow change second, otherwise ESCALATE.
Step 4 - VERIFY: how the next run shows the fix worked.
Step 5 - SCORE: confidence from 0.0 to 1.0.

Respond with this JSON, fixType CONFIG_CHANGE or ESCALATE:
{schema}"#;

const DOCKER_TEMPLATE: &str = r#"PIPELINE FAILURE REPORT
=======================
Failure Type : DOCKER_FAILURE

DOCKERFILE:
{dockerfile}

DOCKER COMPOSE:
{compose}

FAILED LOGS:
{logs}

Step 1 - IDENTIFY: BUILD_FAILED | BASE_IMAGE_PULL_FAILED | RUN_CMD_FAILED | OTHER.
Step 2 - LOCATE the instruction that fails.
Step 3 - FIX the Dockerfile or compose file.
Step 4 - VERIFY: the build command that proves it.
Step 5 - SCORE: confidence from 0.0 to 1.0.

Respond with this JSON, fixType CONFIG_CHANGE:
{schema}"#;

const GENERIC_TEMPLATE: &str = r#"PIPELINE FAILURE REPORT
=======================
Failure Type : UNKNOWN
Language     : {language}
Build Tool   : {build_tool}

FAILED LOGS:
{logs}

Step 1 - DIAGNOSE the failure from the logs.
Step 2 - LOCATE the root cause.
Step 3 - FIX with the minimal change.
Step 4 - VERIFY the fix.
Step 5 - SCORE: if you cannot diagnose confidently, use fixType ESCALATE and a
confidenceScore below 0.5.

Respond with this JSON:
{schema}"#;

/// Template for a failure category.
pub fn template_for(failure_type: FailureType) -> &'static str {
    match failure_type {
        FailureType::BuildCompile => BUILD_COMPILE_TEMPLATE,
        FailureType::TestFailure => TEST_FAILURE_TEMPLATE,
        FailureType::DependencyConflict => DEPENDENCY_TEMPLATE,
        FailureType::Infrastructure => INFRASTRUCTURE_TEMPLATE,
        FailureType::DockerFailure => DOCKER_TEMPLATE,
        FailureType::Unknown => GENERIC_TEMPLATE,
    }
}

/// Build the user prompt for a request.
pub fn route(request: &HealingRequest) -> String {
    let optional = |value: &Option<String>| {
        value
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(NOT_PROVIDED)
            .to_string()
    };

    // Logs go last so their content is never treated as a slot
    template_for(request.failure_type)
        .replace("{schema}", RESPONSE_SCHEMA)
        .replace("{build_tool}", &request.build_tool)
        .replace("{language}", &request.repo_language)
        .replace("{environment}", &request.environment)
        .replace("{repo_structure}", &optional(&request.repo_structure))
        .replace("{recent_commits}", &optional(&request.recent_commits))
        .replace("{build_file}", &optional(&request.build_file_content))
        .replace("{workflow_file}", &optional(&request.workflow_file_content))
        .replace("{dockerfile}", &optional(&request.dockerfile_content))
        .replace("{compose}", &optional(&request.docker_compose_content))
        .replace("{logs}", &truncate_logs(request.failure_logs.as_deref(), LOG_BUDGET_CHARS))
}

/// Prompt for a second attempt after a developer rejected the first.
pub fn route_regenerate(request: &HealingRequest, previous_plan_json: &str, feedback: &str) -> String {
    let mut prompt = route(request);
    prompt.push_str("\n\nPREVIOUS FIX (rejected by the developer):\n");
    prompt.push_str(previous_plan_json);
    prompt.push_str("\n\nDEVELOPER FEEDBACK:\n");
    prompt.push_str(if feedback.trim().is_empty() {
        "[no feedback given]"
    } else {
        feedback
    });
    prompt.push_str(
        "\n\nPropose a different fix that addresses the feedback. Do not repeat the previous fix.",
    );
    prompt
}

/// Keep the head (20%) and tail (80%) of long logs.
pub fn truncate_logs(logs: Option<&str>, max_chars: usize) -> String {
    let Some(logs) = logs else {
        return NO_LOGS.to_string();
    };

    let total = logs.chars().count();
    if total <= max_chars {
        return logs.to_string();
    }

    let head_chars = max_chars / 5;
    let tail_chars = max_chars - head_chars;
    let head: String = logs.chars().take(head_chars).collect();
    let tail: String = logs.chars().skip(total - tail_chars).collect();

    format!("{}{}{}", head, TRUNCATION_MARKER, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(failure_type: FailureType, logs: &str) -> HealingRequest {
        HealingRequest::new(Some(logs.to_string()), failure_type)
    }

    #[test]
    fn test_system_prompt_rules() {
        assert!(SYSTEM_PROMPT.contains("STRICT RULES"));
        assert!(SYSTEM_PROMPT.contains("ESCALATE"));
        assert!(SYSTEM_PROMPT.contains("business logic"));
    }

    #[test]
    fn test_every_category_has_a_template_with_slots() {
        for failure_type in [
            FailureType::BuildCompile,
            FailureType::TestFailure,
            FailureType::DependencyConflict,
            FailureType::Infrastructure,
            FailureType::DockerFailure,
            FailureType::Unknown,
        ] {
            let template = template_for(failure_type);
            assert!(template.contains("{logs}"), "{}", failure_type);
            assert!(template.contains("{schema}"), "{}", failure_type);
            assert!(template.contains("Step 5"), "{}", failure_type);
        }
    }

    #[test]
    fn test_route_fills_all_slots() {
        let prompt = route(&request(FailureType::DockerFailure, "COPY failed"));
        assert!(prompt.contains("COPY failed"));
        assert!(prompt.contains("\"confidenceScore\""));
        assert!(prompt.contains(NOT_PROVIDED));
        assert!(!prompt.contains("{dockerfile}"));
        assert!(!prompt.contains("{logs}"));
    }

    #[test]
    fn test_logs_with_braces_are_left_alone() {
        let prompt = route(&request(FailureType::Unknown, "value was {language}"));
        assert!(prompt.contains("value was {language}"));
    }

    #[test]
    fn test_truncate_logs_short_and_missing() {
        assert_eq!(truncate_logs(None, 3000), "[no logs available]");
        assert_eq!(truncate_logs(Some("short"), 3000), "short");
    }

    #[test]
    fn test_truncate_logs_keeps_head_and_tail() {
        let logs = format!("{}{}{}", "H".repeat(1000), "M".repeat(5000), "T".repeat(3000));
        let out = truncate_logs(Some(&logs), 3000);

        let (head, tail) = out.split_once(TRUNCATION_MARKER).unwrap();
        assert_eq!(head, "H".repeat(600));
        assert_eq!(tail, "T".repeat(2400));
    }

    #[test]
    fn test_regenerate_prompt_carries_history() {
        let prompt = route_regenerate(
            &request(FailureType::TestFailure, "Tests run: 1, Failures: 1"),
            r#"{"fixType":"CODE_CHANGE"}"#,
            "do not touch the assertion",
        );
        assert!(prompt.contains("PREVIOUS FIX"));
        assert!(prompt.contains("do not touch the assertion"));
    }
}
