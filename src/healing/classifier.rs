//! Failure classification from raw CI logs.
//!
//! Every rule that matches anywhere in the log casts one vote for its
//! category. The category with the most votes wins; ties go to the category
//! whose first matching rule is declared earliest.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::debug;

use crate::storage::FailureType;

struct Rule {
    category: FailureType,
    pattern: Regex,
}

fn rule(category: FailureType, pattern: &str) -> Rule {
    Rule {
        category,
        pattern: Regex::new(&format!("(?i){}", pattern)).unwrap(),
    }
}

/// Rule table in declaration (tie-break) order.
static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(
            FailureType::BuildCompile,
            r"compilation failure|cannot find symbol|error:\s*\[ERROR\].*compil|javac.*error|COMPILATION ERROR",
        ),
        rule(
            FailureType::BuildCompile,
            r"error:.*expected|incompatible types|unreported exception|method does not override",
        ),
        rule(
            FailureType::TestFailure,
            r"tests? failed|assertion.*failed|expected.*but was|test.*error|surefire.*failure|failsafe.*failure",
        ),
        rule(
            FailureType::TestFailure,
            r"junit.*fail|testng.*fail|AssertionError|ComparisonFailure",
        ),
        rule(
            FailureType::DependencyConflict,
            r"could not resolve dependencies|dependency.*conflict|version.*conflict|artifact.*not found|non-resolvable parent",
        ),
        rule(
            FailureType::DependencyConflict,
            r"NoClassDefFoundError|ClassNotFoundException|missing artifact|dependency convergence",
        ),
        rule(
            FailureType::Infrastructure,
            r"OutOfMemoryError|heap space|GC overhead|oom-kill|killed.*signal 9|timeout.*exceeded",
        ),
        rule(
            FailureType::Infrastructure,
            r"connection refused|connection timed out|network.*unreachable|disk.*full|no space left",
        ),
        rule(
            FailureType::DockerFailure,
            r"docker.*error|dockerfile.*error|COPY failed|pull access denied|image.*not found|container.*exit",
        ),
        rule(
            FailureType::DockerFailure,
            r"build.*stage|multi-stage|layer.*cache|health.*check.*fail",
        ),
    ]
});

/// Per-category vote tally for one log.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub failure_type: FailureType,
    /// Votes for the winning category.
    pub score: u32,
    /// Indices of every rule that matched.
    pub matched_rules: Vec<usize>,
}

/// Regex vote classifier.
#[derive(Debug, Clone, Default)]
pub struct FailureClassifier;

impl FailureClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a log into a failure category.
    pub fn classify(&self, logs: &str) -> FailureType {
        self.classify_detailed(logs).failure_type
    }

    /// Classify and report the votes behind the decision.
    pub fn classify_detailed(&self, logs: &str) -> Classification {
        if logs.trim().is_empty() {
            return Classification {
                failure_type: FailureType::Unknown,
                score: 0,
                matched_rules: Vec::new(),
            };
        }

        // category -> (votes, index of first matching rule)
        let mut tally: HashMap<FailureType, (u32, usize)> = HashMap::new();
        let mut matched_rules = Vec::new();

        for (index, rule) in RULES.iter().enumerate() {
            if rule.pattern.is_match(logs) {
                matched_rules.push(index);
                tally
                    .entry(rule.category)
                    .and_modify(|(votes, _)| *votes += 1)
                    .or_insert((1, index));
            }
        }

        let winner = tally
            .into_iter()
            .max_by(|(_, (votes_a, first_a)), (_, (votes_b, first_b))| {
                votes_a.cmp(votes_b).then(first_b.cmp(first_a))
            });

        let classification = match winner {
            Some((failure_type, (score, _))) => Classification {
                failure_type,
                score,
                matched_rules,
            },
            None => Classification {
                failure_type: FailureType::Unknown,
                score: 0,
                matched_rules,
            },
        };

        debug!(
            failure_type = %classification.failure_type,
            score = classification.score,
            matched = ?classification.matched_rules,
            "Classified pipeline failure"
        );

        classification
    }
}
