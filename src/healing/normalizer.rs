//! Error signature normalization.
//!
//! Strips the volatile parts of a failure log (timestamps, absolute paths,
//! line numbers, memory addresses) so that two runs failing for the same
//! reason produce the same knowledge base key.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::storage::FailureType;

/// Characters of raw log that contribute to a signature.
pub const SIGNATURE_PREFIX_CHARS: usize = 500;

const MAX_PASSES: usize = 8;

/// Ordered rewrite rules: (pattern, replacement).
static RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // ISO-8601 timestamps
        (
            Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})?")
                .unwrap(),
            "",
        ),
        // Bracketed log timestamps
        (
            Regex::new(r"\[?\d{2,4}[/-]\d{2}[/-]\d{2,4}[T ]\d{2}:\d{2}:\d{2}\]?").unwrap(),
            "",
        ),
        // Unix absolute paths
        (Regex::new(r"/[\w./\-]+\.\w+").unwrap(), "<file>"),
        // Windows absolute paths
        (Regex::new(r"[A-Za-z]:[\\\w./\-]+\.\w+").unwrap(), "<file>"),
        // Stack frame suffixes: keep the file, drop the line
        (Regex::new(r"\(([\w$\-]+\.[A-Za-z]+):\d+\)").unwrap(), "($1)"),
        // Bare line references
        (Regex::new(r":\d{1,6}\b").unwrap(), ""),
        // Memory addresses
        (Regex::new(r"0x[0-9a-fA-F]+").unwrap(), "<addr>"),
        // Whitespace runs
        (Regex::new(r"\s{2,}").unwrap(), " "),
    ]
});

/// Normalize raw log text into a stable form.
///
/// Rules are applied in order and the whole pipeline is repeated until the
/// text stops changing, so `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(raw: &str) -> String {
    let mut current = apply_rules(raw);
    for _ in 1..MAX_PASSES {
        let next = apply_rules(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn apply_rules(input: &str) -> String {
    let mut text = input.to_string();
    for (pattern, replacement) in RULES.iter() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }
    text.trim().to_string()
}

/// Knowledge base key: hex SHA-256 of `category:normalize(first 500 chars)`.
pub fn error_signature(failure_type: FailureType, raw_logs: &str) -> String {
    let prefix: String = raw_logs.chars().take(SIGNATURE_PREFIX_CHARS).collect();
    let material = format!("{}:{}", failure_type.as_str(), normalize(&prefix));

    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_strips_iso_and_bracketed_timestamps() {
        let a = normalize("2024-03-01T10:15:30.123Z ERROR build failed");
        let b = normalize("[2025/11/30 23:59:01] ERROR build failed");
        assert_eq!(a, "ERROR build failed");
        assert_eq!(b, "ERROR build failed");
    }

    #[test]
    fn test_replaces_absolute_paths() {
        let unix = normalize("error at /home/runner/work/app/src/Main.java:[12,5]");
        assert!(unix.contains("<file>"), "{}", unix);
        assert!(!unix.contains("/home"));

        let windows = normalize(r"error at C:\build\agent\src\Main.java");
        assert_eq!(windows, "error at <file>");
    }

    #[test]
    fn test_stack_frames_keep_file_drop_line() {
        let out = normalize("at com.acme.Service.run(Service.java:142)");
        assert_eq!(out, "at com.acme.Service.run(Service.java)");
    }

    #[test]
    fn test_hex_addresses_and_whitespace() {
        let out = normalize("segfault at 0x7ffd5e8c    in   worker");
        assert_eq!(out, "segfault at <addr> in worker");
    }

    #[test]
    fn test_volatile_differences_normalize_identically() {
        let first = "2024-01-01 08:00:00 [ERROR] /tmp/run-1/src/App.java:10: cannot find symbol\n  at App.main(App.java:10)";
        let second = "2024-06-30 17:45:12 [ERROR] /var/ci/run-99/src/App.java:377: cannot find symbol\n  at App.main(App.java:377)";
        assert_eq!(normalize(first), normalize(second));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = [
            "",
            "   ",
            "/foo:12.txt then more",
            "2024-01-01T00:00:00Z something at /a/b.c:99 0xdeadbeef",
            "at x.Y.z(Y.java:1)   and   (Z.kt:22)",
            "C:\\a\\b.dll:7 :8 :9",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "input: {:?}", sample);
        }
    }

    #[test]
    fn test_signature_depends_on_category_and_is_stable() {
        let logs = "2024-01-01T00:00:00Z Tests run: 3, Failures: 1";
        let later = "2024-02-02T11:11:11Z Tests run: 3, Failures: 1";

        let a = error_signature(FailureType::TestFailure, logs);
        let b = error_signature(FailureType::TestFailure, later);
        let c = error_signature(FailureType::BuildCompile, logs);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_signature_only_reads_prefix() {
        let base = "x".repeat(SIGNATURE_PREFIX_CHARS);
        let a = error_signature(FailureType::Unknown, &format!("{}tail one", base));
        let b = error_signature(FailureType::Unknown, &format!("{}tail two", base));
        assert_eq!(a, b);
    }
}
