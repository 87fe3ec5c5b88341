//! Deterministic fix generator.
//!
//! Recognizes a handful of well-known log shapes and synthesizes a plan with
//! a fixed confidence per family. Anything unrecognized becomes a
//! low-confidence escalation, so this generator never fails.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

use super::FixGenerator;
use crate::error::HealingResult;
use crate::healing::plan::{FileChange, FixPlan, HealingRequest};
use crate::storage::FixType;

const COMPILATION_CONFIDENCE: f64 = 0.92;
const TEST_CONFIDENCE: f64 = 0.85;
const DEPENDENCY_CONFIDENCE: f64 = 0.78;
const DOCKER_CONFIDENCE: f64 = 0.80;

static MISSING_METHOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"error: cannot find symbol\s*\n\s*symbol:\s*method\s+(\w+)\(([^)]*)\)\s*\n\s*location:\s*class\s+(\S+)",
    )
    .unwrap()
});

static INCOMPATIBLE_TYPES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"incompatible types:\s*(\S+)\s+cannot be converted to\s+(\S+)").unwrap()
});

static COMPILER_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/([\w/]+\.java):\[(\d+),").unwrap());

static TEST_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tests run: (\d+), Failures: (\d+), Errors: (\d+)").unwrap());

static FAILING_TEST_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FAILURE!.*? - in ([\w.$]+)").unwrap());

/// Pattern-matching generator used when the LLM is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackFixGenerator;

impl FallbackFixGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Build a plan from logs alone.
    pub fn analyze(&self, logs: &str) -> FixPlan {
        if logs.contains("COMPILATION ERROR")
            || logs.contains("cannot find symbol")
            || logs.contains("incompatible types")
        {
            return compilation_plan(logs);
        }
        if logs.contains("Tests run:") && logs.contains("Failures:") {
            return test_plan(logs);
        }
        if logs.contains("Could not resolve dependencies") || logs.contains("dependency") {
            return dependency_plan();
        }
        if logs.contains("docker") || logs.contains("Dockerfile") || logs.contains("COPY failed") {
            return docker_plan();
        }

        FixPlan::escalation(
            "Pipeline failed with no recognizable error pattern.",
            "The logs do not match any known failure shape. A human should review the full build output.",
        )
    }
}

#[async_trait]
impl FixGenerator for FallbackFixGenerator {
    async fn generate_fix(&self, request: &HealingRequest) -> HealingResult<FixPlan> {
        let plan = self.analyze(request.logs());
        debug!(
            failure_type = %request.failure_type,
            fix_type = %plan.fix_type,
            confidence = plan.confidence_score,
            "Fallback analysis complete"
        );
        Ok(plan)
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

// ============================================================================
// Pattern families
// ============================================================================

fn compilation_plan(logs: &str) -> FixPlan {
    let mut changes = Vec::new();
    let mut details = Vec::new();

    for caps in MISSING_METHOD.captures_iter(logs) {
        let (method, params, class) = (&caps[1], &caps[2], &caps[3]);
        details.push(format!("missing method {}({}) in {}", method, params, class));
        changes.push(FileChange::modify(
            format!("src/main/java/{}.java", class.replace('.', "/")),
            "",
            format!(
                "    public Object {}({}) {{\n        throw new UnsupportedOperationException(\"{} is not implemented yet\");\n    }}",
                method, params, method
            ),
            format!("Declare {} so callers in {} compile", method, class),
        ));
    }

    let location = COMPILER_LOCATION.captures(logs);
    for caps in INCOMPATIBLE_TYPES.captures_iter(logs) {
        let (from, to) = (&caps[1], &caps[2]);
        details.push(format!("{} cannot be converted to {}", from, to));

        if let Some(loc) = &location {
            let line = loc[2].parse::<u32>().unwrap_or(0);
            let change = FileChange::modify(
                source_path(&loc[1]),
                format!("{} result = repository.findById(id);", to),
                format!(
                    "{} result = repository.findById(id);\n        return result.orElseThrow(() -> new IllegalStateException(\"Not found\"));",
                    from
                ),
                format!("Unwrap {} explicitly instead of assigning it to {}", from, to),
            );
            changes.push(if line > 0 { change.at_line(line) } else { change });
        }
    }

    let summary = if details.is_empty() {
        "Compilation failed.".to_string()
    } else {
        format!(
            "Compilation failed with {} error(s): {}",
            details.len(),
            details.join("; ")
        )
    };

    FixPlan {
        failure_summary: summary,
        root_cause: "Code references methods or types that no longer match their declarations, \
            typically after a refactoring that did not update every caller."
            .to_string(),
        fix_explanation: "Declare the missing members and unwrap Optional results where a \
            concrete type is expected."
            .to_string(),
        fix_type: FixType::CodeChange,
        files_to_modify: changes,
        commands: vec!["mvn clean compile -q".to_string()],
        confidence_score: COMPILATION_CONFIDENCE,
        human_readable_reason: format!(
            "{} compilation error(s) matched a known refactoring pattern.",
            details.len()
        ),
        prevention_tips: vec![
            "Use IDE refactoring tools when changing signatures".to_string(),
            "Run a compile step before tests in CI".to_string(),
        ],
    }
}

/// Repository-relative path from an absolute compiler path.
fn source_path(captured: &str) -> String {
    match captured.find("src/") {
        Some(start) => captured[start..].to_string(),
        None => format!("src/main/java/{}", captured),
    }
}

fn test_plan(logs: &str) -> FixPlan {
    let (failures, errors) = TEST_SUMMARY
        .captures(logs)
        .map(|caps| {
            (
                caps[2].parse::<u64>().unwrap_or(u64::MAX),
                caps[3].parse::<u64>().unwrap_or(u64::MAX),
            )
        })
        .unwrap_or((0, 0));
    let failing = failures.saturating_add(errors);

    let changes = FAILING_TEST_CLASS
        .captures(logs)
        .map(|caps| {
            let class = caps[1].split('$').next().unwrap_or(&caps[1]).to_string();
            vec![FileChange::modify(
                format!("src/test/java/{}.java", class.replace('.', "/")),
                "assertEquals(expected, actual);",
                "assertTrue(actual.isPresent());\nassertEquals(expected, actual.get());",
                format!("Align assertions in {} with the Optional return type", class),
            )]
        })
        .unwrap_or_default();

    FixPlan {
        failure_summary: format!(
            "Test suite failed: {} failure(s), {} error(s)",
            failures, errors
        ),
        root_cause: "Assertions no longer match the behavior of the code under test after a \
            recent change."
            .to_string(),
        fix_explanation: format!(
            "Review the {} failing test(s) against the new behavior and fix the mismatch.",
            failing
        ),
        fix_type: FixType::CodeChange,
        files_to_modify: changes,
        commands: vec!["mvn test".to_string()],
        confidence_score: TEST_CONFIDENCE,
        human_readable_reason: format!(
            "{} test failure(s) matched an API contract change.",
            failing
        ),
        prevention_tips: vec![
            "Cover the full request/response cycle with integration tests".to_string(),
            "Enforce coverage thresholds in CI".to_string(),
        ],
    }
}

fn dependency_plan() -> FixPlan {
    FixPlan {
        failure_summary: "Build failed on unresolved dependencies.".to_string(),
        root_cause: "An artifact could not be downloaded: a removed version, a private \
            repository without credentials, or a network problem in CI."
            .to_string(),
        fix_explanation: "Pin the dependency to a stable release and force a refresh of the \
            local repository."
            .to_string(),
        fix_type: FixType::ConfigChange,
        files_to_modify: vec![FileChange::modify(
            "pom.xml",
            "<version>SNAPSHOT</version>",
            "<version>RELEASE</version>",
            "Pin dependency to a stable release version",
        )],
        commands: vec![
            "mvn dependency:resolve".to_string(),
            "mvn clean install -U".to_string(),
        ],
        confidence_score: DEPENDENCY_CONFIDENCE,
        human_readable_reason: "Dependency resolution failed; pinning to a release usually \
            restores the build."
            .to_string(),
        prevention_tips: vec![
            "Avoid SNAPSHOT dependencies on release branches".to_string(),
            "Mirror external repositories".to_string(),
        ],
    }
}

fn docker_plan() -> FixPlan {
    FixPlan {
        failure_summary: "Docker image build failed.".to_string(),
        root_cause: "The Dockerfile copies an artifact that is not in the build context; in a \
            multi-stage build it lives in the builder stage."
            .to_string(),
        fix_explanation: "Copy the jar from the builder stage instead of the build context."
            .to_string(),
        fix_type: FixType::ConfigChange,
        files_to_modify: vec![FileChange::modify(
            "Dockerfile",
            "COPY target/*.jar app.jar",
            "COPY --from=builder /app/target/*.jar app.jar",
            "Reference the builder stage in the multi-stage build",
        )],
        commands: vec!["docker build --no-cache -t app:latest .".to_string()],
        confidence_score: DOCKER_CONFIDENCE,
        human_readable_reason: "COPY failed on a build artifact; the builder stage holds it."
            .to_string(),
        prevention_tips: vec![
            "Validate the Dockerfile in CI before building".to_string(),
            "Pin base images by digest".to_string(),
        ],
    }
}
