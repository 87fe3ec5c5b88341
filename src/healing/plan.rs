//! Fix plans and generation requests.

use serde::{Deserialize, Serialize};

use crate::error::HealingError;
use crate::storage::{FailureType, FixType};

/// How a file is touched by a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

/// One file edit in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub file_path: String,
    pub change_type: ChangeKind,
    #[serde(default)]
    pub old_content: Option<String>,
    #[serde(default)]
    pub new_content: Option<String>,
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl FileChange {
    pub fn modify(
        path: impl Into<String>,
        old: impl Into<String>,
        new: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            file_path: path.into(),
            change_type: ChangeKind::Modify,
            old_content: Some(old.into()),
            new_content: Some(new.into()),
            line_number: None,
            reason: Some(reason.into()),
        }
    }

    /// Set the line the change anchors to.
    pub fn at_line(mut self, line: u32) -> Self {
        self.line_number = Some(line);
        self
    }
}

/// A proposed remediation, as produced by a generator or the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixPlan {
    #[serde(default)]
    pub failure_summary: String,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub fix_explanation: String,
    pub fix_type: FixType,
    #[serde(default)]
    pub files_to_modify: Vec<FileChange>,
    #[serde(default)]
    pub commands: Vec<String>,
    pub confidence_score: f64,
    #[serde(default)]
    pub human_readable_reason: String,
    #[serde(default)]
    pub prevention_tips: Vec<String>,
}

impl FixPlan {
    /// A plan that hands the failure to a human.
    pub fn escalation(summary: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            failure_summary: summary.into(),
            root_cause: "Not enough signal in the logs to determine a root cause.".to_string(),
            fix_explanation: "No automated fix proposed.".to_string(),
            fix_type: FixType::Escalate,
            files_to_modify: Vec::new(),
            commands: Vec::new(),
            confidence_score: 0.3,
            human_readable_reason: reason,
            prevention_tips: Vec::new(),
        }
    }

    /// Parse a serialized plan.
    pub fn from_json(json: &str) -> Result<Self, HealingError> {
        let plan: FixPlan = serde_json::from_str(json).map_err(|e| HealingError::InvalidPlan {
            message: format!("Failed to parse fix plan: {}", e),
        })?;
        plan.validate()?;
        Ok(plan)
    }

    /// Serialize for storage.
    pub fn to_json(&self) -> Result<String, HealingError> {
        serde_json::to_string(self).map_err(|e| HealingError::InvalidPlan {
            message: format!("Failed to serialize fix plan: {}", e),
        })
    }

    /// Serialized file changes only.
    pub fn file_changes_json(&self) -> Result<String, HealingError> {
        serde_json::to_string(&self.files_to_modify).map_err(|e| HealingError::InvalidPlan {
            message: format!("Failed to serialize file changes: {}", e),
        })
    }

    /// Structural checks that every applied plan must pass.
    pub fn validate(&self) -> Result<(), HealingError> {
        if !self.confidence_score.is_finite() || !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(HealingError::InvalidPlan {
                message: format!("confidence {} outside [0, 1]", self.confidence_score),
            });
        }

        for change in &self.files_to_modify {
            if change.file_path.trim().is_empty() {
                return Err(HealingError::InvalidPlan {
                    message: "file change with empty path".to_string(),
                });
            }
            if change.change_type != ChangeKind::Delete && change.new_content.is_none() {
                return Err(HealingError::InvalidPlan {
                    message: format!("{} has no new content", change.file_path),
                });
            }
        }

        Ok(())
    }
}

/// Context handed to a fix generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingRequest {
    pub failure_logs: Option<String>,
    pub failure_type: FailureType,
    pub repo_language: String,
    pub build_tool: String,
    pub environment: String,
    pub repo_structure: Option<String>,
    pub recent_commits: Option<String>,
    pub build_file_content: Option<String>,
    pub workflow_file_content: Option<String>,
    pub dockerfile_content: Option<String>,
    pub docker_compose_content: Option<String>,
}

impl HealingRequest {
    /// Request for a JVM project built by Maven in CI.
    pub fn new(failure_logs: Option<String>, failure_type: FailureType) -> Self {
        Self {
            failure_logs,
            failure_type,
            repo_language: "Java".to_string(),
            build_tool: "Maven".to_string(),
            environment: "ci".to_string(),
            repo_structure: None,
            recent_commits: None,
            build_file_content: None,
            workflow_file_content: None,
            dockerfile_content: None,
            docker_compose_content: None,
        }
    }

    /// Logs or the empty string.
    pub fn logs(&self) -> &str {
        self.failure_logs.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_generator_json_with_missing_optionals() {
        let raw = json!({
            "failureSummary": "Build broke",
            "fixType": "CONFIG_CHANGE",
            "filesToModify": [{
                "filePath": "pom.xml",
                "changeType": "MODIFY",
                "newContent": "<version>1.2.3</version>"
            }],
            "confidenceScore": 0.8
        })
        .to_string();

        let plan = FixPlan::from_json(&raw).unwrap();
        assert_eq!(plan.fix_type, FixType::ConfigChange);
        assert_eq!(plan.files_to_modify[0].change_type, ChangeKind::Modify);
        assert!(plan.commands.is_empty());
    }

    #[test]
    fn test_missing_fix_type_is_rejected() {
        let raw = json!({"confidenceScore": 0.9}).to_string();
        assert!(FixPlan::from_json(&raw).is_err());
    }

    #[test]
    fn test_confidence_out_of_range_is_rejected() {
        let mut plan = FixPlan::escalation("x", "y");
        plan.confidence_score = 1.2;
        assert!(plan.validate().is_err());
        plan.confidence_score = f64::NAN;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_modify_without_content_is_rejected() {
        let mut plan = FixPlan::escalation("x", "y");
        plan.files_to_modify.push(FileChange {
            file_path: "src/App.java".to_string(),
            change_type: ChangeKind::Modify,
            old_content: None,
            new_content: None,
            line_number: None,
            reason: None,
        });
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_escalation_plan_is_low_confidence() {
        let plan = FixPlan::escalation("unknown failure", "needs a human");
        assert_eq!(plan.fix_type, FixType::Escalate);
        assert!(plan.confidence_score < 0.5);
        assert!(plan.validate().is_ok());
    }
}
