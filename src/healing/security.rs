//! Security signal scanner over raw pipeline logs.
//!
//! Two rule families run over the same text:
//! - code pattern rules, where every regex match yields a finding
//! - dependency fingerprints, where each known-vulnerable artifact fragment
//!   yields at most one finding
//!
//! Scans are keyed by `(repo, commit)`: a commit that already has findings is
//! not rescanned. Scanning is a side channel of healing and never returns an
//! error to the caller.

use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{EventPublisher, OutboundEvent, SecurityEvent};
use crate::storage::{FindingStatus, PipelineEvent, SecurityFinding, Severity, Storage};

/// Provider label stored on every finding.
pub const SCAN_PROVIDER: &str = "PIPELINE_HEALER";

const MAX_SNIPPET_CHARS: usize = 500;

struct CodeRule {
    pattern: Regex,
    severity: Severity,
    vulnerability_type: &'static str,
    title: &'static str,
    description: &'static str,
    remediation: &'static str,
}

struct DependencyRule {
    fragment: &'static str,
    severity: Severity,
    cve: &'static str,
    title: &'static str,
    description: &'static str,
    remediation: &'static str,
}

static CODE_RULES: LazyLock<Vec<CodeRule>> = LazyLock::new(|| {
    vec![
        CodeRule {
            pattern: Regex::new(r#"(?i)password\s*=\s*"[^"]{6,}""#).unwrap(),
            severity: Severity::Critical,
            vulnerability_type: "HARDCODED_CREDENTIAL",
            title: "Hardcoded Password Detected",
            description: "A literal password is assigned in source or printed in build output. \
                Anyone with read access to the repository or the logs can reuse it.",
            remediation: "Move the value into a secrets manager or CI secret and inject it at \
                runtime. Rotate the exposed credential.",
        },
        CodeRule {
            pattern: Regex::new(r"(?is)(SELECT\s+.+\s*\+|executeQuery\s*\(.*\+.*)").unwrap(),
            severity: Severity::High,
            vulnerability_type: "SQL_INJECTION",
            title: "Potential SQL Injection",
            description: "A SQL statement appears to be built by string concatenation. \
                Untrusted input reaching it can rewrite the query.",
            remediation: "Use bound parameters (prepared statements or a query builder) \
                instead of concatenating values into SQL.",
        },
        CodeRule {
            pattern: Regex::new(r#"(?i)api[_\-.]?key\s*=\s*"[a-zA-Z0-9]{20,}""#).unwrap(),
            severity: Severity::Critical,
            vulnerability_type: "HARDCODED_SECRET",
            title: "Hardcoded API Key",
            description: "A long token is assigned to an api key variable. Committed or \
                logged keys are exposed to everyone with repository access.",
            remediation: "Load the key from the environment or a secrets manager, rotate it, \
                and review its access logs.",
        },
        CodeRule {
            pattern: Regex::new(r"(?i)new\s+Random\s*\(\s*\)").unwrap(),
            severity: Severity::Medium,
            vulnerability_type: "INSECURE_RANDOM",
            title: "Insecure Random Number Generator",
            description: "A non-cryptographic PRNG is instantiated. Its output is predictable \
                and unsuitable for tokens, session ids or reset codes.",
            remediation: "Use a cryptographically secure generator such as SecureRandom.",
        },
        CodeRule {
            pattern: Regex::new(r"(?i)DocumentBuilderFactory").unwrap(),
            severity: Severity::High,
            vulnerability_type: "XXE_VULNERABILITY",
            title: "XXE Vulnerability Risk",
            description: "An XML parser factory is used. Unless external entities are \
                disabled, crafted XML can read local files or trigger SSRF.",
            remediation: "Disable DOCTYPE declarations and external entities on the factory \
                and enable secure processing.",
        },
        CodeRule {
            pattern: Regex::new(r"(?i)ObjectInputStream").unwrap(),
            severity: Severity::High,
            vulnerability_type: "UNSAFE_DESERIALIZATION",
            title: "Unsafe Deserialization",
            description: "Native object deserialization can instantiate arbitrary classes; \
                on untrusted input this leads to remote code execution via gadget chains.",
            remediation: "Avoid native serialization for untrusted data, or install a \
                deserialization filter. Prefer schema-validated formats such as JSON.",
        },
        CodeRule {
            pattern: Regex::new(r"(?is)new\s+File\s*\(.*request\.getParameter").unwrap(),
            severity: Severity::High,
            vulnerability_type: "PATH_TRAVERSAL",
            title: "Path Traversal Risk",
            description: "A file path is built from a request parameter, so sequences like \
                '../' can escape the intended directory.",
            remediation: "Canonicalise the path and verify it stays under the allowed base \
                directory before opening it.",
        },
        CodeRule {
            pattern: Regex::new(
                r"(?i)log\.(debug|info|warn|error)\s*\(.*\b(password|secret|token|key)\b.*=",
            )
            .unwrap(),
            severity: Severity::Medium,
            vulnerability_type: "SENSITIVE_DATA_LEAK",
            title: "Sensitive Data in Logs",
            description: "A log statement records a value next to a sensitive field name. \
                Log pipelines retain and widely expose such values.",
            remediation: "Drop the value from the log line or replace it with a redacted \
                placeholder.",
        },
        CodeRule {
            pattern: Regex::new(r"(?i)http://").unwrap(),
            severity: Severity::Low,
            vulnerability_type: "INSECURE_TRANSPORT",
            title: "Insecure HTTP Connection",
            description: "A plain HTTP URL is in use; traffic can be read or modified in \
                transit.",
            remediation: "Switch to https:// with a valid certificate.",
        },
        CodeRule {
            pattern: Regex::new(r"(?i)\b(MD5|SHA1|SHA-1)\b").unwrap(),
            severity: Severity::Medium,
            vulnerability_type: "WEAK_CRYPTO",
            title: "Weak Cryptographic Algorithm",
            description: "MD5 or SHA-1 is referenced. Both are broken for collision \
                resistance and unfit for signatures or password storage.",
            remediation: "Use SHA-256/SHA-3 for hashing and bcrypt, scrypt or Argon2 for \
                passwords.",
        },
    ]
});

static DEPENDENCY_RULES: &[DependencyRule] = &[
    DependencyRule {
        fragment: "log4j-core-2.14",
        severity: Severity::Critical,
        cve: "CVE-2021-44228",
        title: "Log4Shell - Remote Code Execution in Log4j",
        description: "Log4j 2 before 2.15.0 evaluates JNDI lookups in logged strings, \
            allowing remote code execution. CVSS 10.0.",
        remediation: "Upgrade log4j-core to 2.17.1 or later. Until then set \
            -Dlog4j2.formatMsgNoLookups=true or remove JndiLookup from the classpath.",
    },
    DependencyRule {
        fragment: "spring-webmvc-5.2",
        severity: Severity::High,
        cve: "CVE-2022-22965",
        title: "Spring4Shell - RCE in Spring Framework",
        description: "Spring MVC on JDK 9+ deployed to a servlet container allows remote \
            code execution through data binding. CVSS 9.8.",
        remediation: "Upgrade to Spring Framework 5.3.18+ or 5.2.20+.",
    },
    DependencyRule {
        fragment: "jackson-databind-2.9",
        severity: Severity::High,
        cve: "CVE-2019-14379",
        title: "Jackson Databind - Unsafe Deserialization",
        description: "jackson-databind 2.9.x before 2.9.9.3 can deserialize attacker \
            controlled types when default typing is enabled. CVSS 9.8.",
        remediation: "Upgrade jackson-databind to 2.9.9.3 or later and keep default typing \
            disabled.",
    },
];

/// A rule hit before it is bound to a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub severity: Severity,
    pub vulnerability_type: &'static str,
    pub vulnerability_id: Option<&'static str>,
    pub title: &'static str,
    pub description: &'static str,
    pub remediation: &'static str,
    pub snippet: String,
}

/// Run both rule families over `logs`.
pub fn scan_text(logs: &str) -> Vec<RuleMatch> {
    let mut matches = Vec::new();

    for rule in CODE_RULES.iter() {
        for m in rule.pattern.find_iter(logs) {
            let snippet = truncate(m.as_str(), MAX_SNIPPET_CHARS);
            debug!(
                severity = %rule.severity,
                title = rule.title,
                snippet = %truncate(&snippet, 80),
                "Code pattern matched"
            );
            matches.push(RuleMatch {
                severity: rule.severity,
                vulnerability_type: rule.vulnerability_type,
                vulnerability_id: None,
                title: rule.title,
                description: rule.description,
                remediation: rule.remediation,
                snippet,
            });
        }
    }

    for rule in DEPENDENCY_RULES {
        if logs.contains(rule.fragment) {
            warn!(
                severity = %rule.severity,
                cve = rule.cve,
                fragment = rule.fragment,
                "Vulnerable dependency fingerprint found in logs"
            );
            matches.push(RuleMatch {
                severity: rule.severity,
                vulnerability_type: "VULNERABLE_DEPENDENCY",
                vulnerability_id: Some(rule.cve),
                title: rule.title,
                description: rule.description,
                remediation: rule.remediation,
                snippet: format!("Detected dependency fragment in logs: {}", rule.fragment),
            });
        }
    }

    matches
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// What a scan call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Findings already existed for this commit.
    Skipped,
    /// Nothing matched.
    Clean,
    /// This many findings were persisted.
    Findings(usize),
    /// Internal failure, logged and swallowed.
    Failed,
}

/// Persisting scanner bound to storage and the security event stream.
pub struct SecurityScanner {
    storage: Arc<dyn Storage>,
    publisher: Arc<dyn EventPublisher>,
}

impl SecurityScanner {
    pub fn new(storage: Arc<dyn Storage>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { storage, publisher }
    }

    /// Scan the logs of a pipeline run. Never fails.
    pub async fn scan_pipeline_event(&self, event: &PipelineEvent) -> ScanOutcome {
        info!(
            repo = %event.repo_name,
            branch = %event.branch,
            commit = %event.commit_sha,
            event_id = %event.id,
            "Starting security scan"
        );

        match self.storage.count_findings_for_commit(&event.repo_name, &event.commit_sha).await {
            Ok(0) => {}
            Ok(existing) => {
                info!(
                    repo = %event.repo_name,
                    commit = %event.commit_sha,
                    existing,
                    "Commit already scanned, skipping"
                );
                return ScanOutcome::Skipped;
            }
            Err(e) => {
                error!(error = %e, "Security scan idempotency check failed");
                return ScanOutcome::Failed;
            }
        }

        let matches = scan_text(event.logs());
        if matches.is_empty() {
            info!(repo = %event.repo_name, commit = %event.commit_sha, "Security scan clean");
            return ScanOutcome::Clean;
        }

        let now = Utc::now();
        let findings: Vec<SecurityFinding> = matches
            .into_iter()
            .map(|m| SecurityFinding {
                id: Uuid::new_v4().to_string(),
                pipeline_event_id: Some(event.id.clone()),
                repo_name: event.repo_name.clone(),
                branch: event.branch.clone(),
                commit_sha: event.commit_sha.clone(),
                scan_provider: SCAN_PROVIDER.to_string(),
                severity: m.severity,
                vulnerability_type: m.vulnerability_type.to_string(),
                vulnerability_id: m.vulnerability_id.map(str::to_string),
                title: m.title.to_string(),
                description: m.description.to_string(),
                remediation: m.remediation.to_string(),
                file_path: None,
                line_number: None,
                status: FindingStatus::Open,
                raw_finding: m.snippet,
                created_at: now,
                updated_at: now,
            })
            .collect();

        if let Err(e) = self.storage.create_security_findings(&findings).await {
            error!(error = %e, repo = %event.repo_name, "Failed to persist security findings");
            return ScanOutcome::Failed;
        }

        let count = |severity: Severity| findings.iter().filter(|f| f.severity == severity).count();
        let summary = SecurityEvent {
            repo_name: event.repo_name.clone(),
            branch: event.branch.clone(),
            commit_sha: event.commit_sha.clone(),
            total_findings: findings.len(),
            critical: count(Severity::Critical),
            high: count(Severity::High),
            medium: count(Severity::Medium),
            low: count(Severity::Low),
            pipeline_event_id: event.id.clone(),
        };

        info!(
            repo = %event.repo_name,
            commit = %event.commit_sha,
            findings = summary.total_findings,
            "Security findings persisted"
        );
        if summary.critical > 0 || summary.high > 0 {
            warn!(
                repo = %event.repo_name,
                commit = %event.commit_sha,
                critical = summary.critical,
                high = summary.high,
                "Security alert"
            );
        }

        if let Err(e) = self.publisher.publish(OutboundEvent::Security(summary)).await {
            warn!(error = %e, "Failed to publish security event");
        }

        ScanOutcome::Findings(findings.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardcoded_password_is_critical() {
        let matches = scan_text(r#"config: password = "supersecret123""#);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].severity, Severity::Critical);
        assert_eq!(matches[0].vulnerability_type, "HARDCODED_CREDENTIAL");
    }

    #[test]
    fn test_short_password_is_ignored() {
        assert!(scan_text(r#"password = "abc""#).is_empty());
    }

    #[test]
    fn test_every_code_match_yields_a_finding() {
        let logs = "GET http://a.example\nGET http://b.example\nGET http://c.example";
        let matches = scan_text(logs);
        assert_eq!(matches.len(), 3);
        assert!(matches.iter().all(|m| m.vulnerability_type == "INSECURE_TRANSPORT"));
    }

    #[test]
    fn test_dependency_fragment_matches_once() {
        let logs = "Downloading log4j-core-2.14.1.jar\nResolved log4j-core-2.14.1";
        let matches = scan_text(logs);
        let cves: Vec<_> = matches.iter().filter_map(|m| m.vulnerability_id).collect();
        assert_eq!(cves, vec!["CVE-2021-44228"]);
        assert_eq!(matches[0].severity, Severity::Critical);
        assert_eq!(
            matches[0].snippet,
            "Detected dependency fragment in logs: log4j-core-2.14"
        );
    }

    #[test]
    fn test_weak_crypto_needs_word_boundary() {
        assert_eq!(scan_text("digest: MD5").len(), 1);
        assert!(scan_text("checksum MD5SUM").is_empty());
    }

    #[test]
    fn test_snippet_truncated() {
        let long = format!("SELECT * FROM t WHERE a = '{}' + x", "y".repeat(900));
        let matches = scan_text(&long);
        let sql = matches
            .iter()
            .find(|m| m.vulnerability_type == "SQL_INJECTION")
            .unwrap();
        assert_eq!(sql.snippet.chars().count(), MAX_SNIPPET_CHARS);
        assert!(sql.snippet.ends_with("..."));
    }

    #[test]
    fn test_clean_logs() {
        assert!(scan_text("BUILD SUCCESS in 42s").is_empty());
    }
}
