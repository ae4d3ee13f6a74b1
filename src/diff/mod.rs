//! Diff Validator: checks the actual change set before anything is committed.
//!
//! Three independent checks over what the [`DiffProvider`] reports:
//! unexpected files, total size, and disallowed content in added lines.
//! Validation is a pure function of its inputs, so the same diff and rules
//! always produce the same report.

pub mod git;

pub use git::GitDiffProvider;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One file in the working-tree change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub lines_added: u32,
    pub lines_removed: u32,
    /// (line number in the new file, text) for every added line.
    #[serde(default, skip_serializing)]
    pub added_lines: Vec<(u32, String)>,
}

impl ChangedFile {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            lines_added: 0,
            lines_removed: 0,
            added_lines: Vec::new(),
        }
    }

    pub fn lines_changed(&self) -> u32 {
        self.lines_added + self.lines_removed
    }
}

/// Version-control capability: what changed, and how to persist it.
pub trait DiffProvider: Send + Sync {
    fn changed_files(&self) -> Result<Vec<ChangedFile>>;
    /// Commit everything in the working tree; returns the new commit sha.
    fn commit(&self, message: &str) -> Result<String>;
    /// Create a branch at HEAD and switch to it, keeping working changes.
    fn create_branch(&self, name: &str) -> Result<()>;
    fn current_branch(&self) -> Result<Option<String>>;
    fn is_clean(&self) -> Result<bool>;
}

/// Compiled diff rules.
#[derive(Debug, Clone)]
pub struct DiffRules {
    pub allow_additional_files: bool,
    pub max_lines: u32,
    pub warn_lines: u32,
    pub disallowed_patterns: Vec<Regex>,
}

impl Default for DiffRules {
    fn default() -> Self {
        Self {
            allow_additional_files: false,
            max_lines: 500,
            warn_lines: 200,
            disallowed_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternViolation {
    pub file: String,
    pub line: u32,
    pub pattern: String,
    pub text: String,
}

impl std::fmt::Display for PatternViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} matches /{}/", self.file, self.line, self.pattern)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    pub valid: bool,
    pub files: Vec<String>,
    pub total_lines: u32,
    pub unexpected_files: Vec<String>,
    pub violations: Vec<PatternViolation>,
    pub warnings: Vec<String>,
    pub failures: Vec<String>,
    pub reason: String,
}

pub struct DiffValidator {
    rules: DiffRules,
}

impl DiffValidator {
    pub fn new(rules: DiffRules) -> Self {
        Self { rules }
    }

    /// Validate a change set.
    ///
    /// `expected_files` may hold exact paths or glob patterns; `None` skips the
    /// unexpected-file check. A non-empty `justification` turns unexpected
    /// files into a warning instead of a failure.
    pub fn validate(
        &self,
        changed: &[ChangedFile],
        expected_files: Option<&BTreeSet<String>>,
        justification: Option<&str>,
    ) -> DiffReport {
        let mut changed: Vec<&ChangedFile> = changed.iter().collect();
        changed.sort_by(|a, b| a.path.cmp(&b.path));

        let mut warnings = Vec::new();
        let mut failures = Vec::new();

        // (a) unexpected files
        let unexpected: Vec<String> = match expected_files {
            Some(expected) => {
                let patterns: Vec<glob::Pattern> =
                    expected.iter().filter_map(|p| glob::Pattern::new(p).ok()).collect();
                // `*` stays within one path segment; `**` crosses them.
                let options = glob::MatchOptions {
                    require_literal_separator: true,
                    ..Default::default()
                };
                changed
                    .iter()
                    .filter(|f| {
                        !expected.contains(&f.path) && !patterns.iter().any(|p| p.matches_with(&f.path, options))
                    })
                    .map(|f| f.path.clone())
                    .collect()
            }
            None => Vec::new(),
        };
        if !unexpected.is_empty() {
            let listed = unexpected.join(", ");
            let justification = justification.map(str::trim).filter(|j| !j.is_empty());
            if self.rules.allow_additional_files {
                warnings.push(format!("additional files changed: {}", listed));
            } else if let Some(why) = justification {
                warnings.push(format!("unexpected files changed ({}), justified: {}", listed, why));
            } else {
                failures.push(format!("unexpected files changed without justification: {}", listed));
            }
        }

        // (b) size
        let total_lines: u32 = changed.iter().map(|f| f.lines_changed()).sum();
        if total_lines > self.rules.max_lines {
            failures.push(format!(
                "{} lines changed exceeds limit of {}",
                total_lines, self.rules.max_lines
            ));
        } else if total_lines > self.rules.warn_lines {
            warnings.push(format!(
                "{} lines changed exceeds warning threshold of {}",
                total_lines, self.rules.warn_lines
            ));
        }

        // (c) disallowed content
        let mut violations = Vec::new();
        for file in &changed {
            for (line, text) in &file.added_lines {
                for pattern in &self.rules.disallowed_patterns {
                    if pattern.is_match(text) {
                        violations.push(PatternViolation {
                            file: file.path.clone(),
                            line: *line,
                            pattern: pattern.as_str().to_string(),
                            text: text.trim().to_string(),
                        });
                    }
                }
            }
        }
        if !violations.is_empty() {
            let at: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
            failures.push(format!("disallowed content: {}", at.join(", ")));
        }

        let valid = failures.is_empty();
        let reason = if valid {
            format!("{} file(s), {} line(s) changed", changed.len(), total_lines)
        } else {
            failures.join("; ")
        };

        DiffReport {
            valid,
            files: changed.iter().map(|f| f.path.clone()).collect(),
            total_lines,
            unexpected_files: unexpected,
            violations,
            warnings,
            failures,
            reason,
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// In-memory VCS: a fixed change set, recorded commits and branches.
    #[derive(Default)]
    pub struct FakeDiffProvider {
        pub files: Mutex<Vec<ChangedFile>>,
        pub commits: Mutex<Vec<String>>,
        pub branches: Mutex<Vec<String>>,
        /// Reject every commit, like a failing pre-commit hook.
        pub reject_commits: bool,
    }

    impl FakeDiffProvider {
        pub fn with_files(files: Vec<ChangedFile>) -> Self {
            Self {
                files: Mutex::new(files),
                ..Default::default()
            }
        }
    }

    impl DiffProvider for FakeDiffProvider {
        fn changed_files(&self) -> Result<Vec<ChangedFile>> {
            Ok(self.files.lock().unwrap().clone())
        }

        fn commit(&self, message: &str) -> Result<String> {
            if self.reject_commits {
                anyhow::bail!("pre-commit hook exited with status 1");
            }
            let mut commits = self.commits.lock().unwrap();
            commits.push(message.to_string());
            self.files.lock().unwrap().clear();
            Ok(format!("{:040x}", commits.len()))
        }

        fn create_branch(&self, name: &str) -> Result<()> {
            self.branches.lock().unwrap().push(name.to_string());
            Ok(())
        }

        fn current_branch(&self) -> Result<Option<String>> {
            Ok(self
                .branches
                .lock()
                .unwrap()
                .last()
                .cloned()
                .or_else(|| Some("main".to_string())))
        }

        fn is_clean(&self) -> Result<bool> {
            Ok(self.files.lock().unwrap().is_empty())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, added: &[&str], removed: u32) -> ChangedFile {
        ChangedFile {
            path: path.to_string(),
            lines_added: added.len() as u32,
            lines_removed: removed,
            added_lines: added
                .iter()
                .enumerate()
                .map(|(i, t)| (i as u32 + 1, t.to_string()))
                .collect(),
        }
    }

    fn expected(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_unexpected_file_without_justification_fails_and_is_named() {
        let v = DiffValidator::new(DiffRules::default());
        let changed = vec![file("app/models/user.rb", &["x"], 0), file("config/routes.rb", &["y"], 0)];
        let report = v.validate(&changed, Some(&expected(&["app/models/user.rb"])), None);
        assert!(!report.valid);
        assert_eq!(report.unexpected_files, vec!["config/routes.rb"]);
        assert!(report.reason.contains("config/routes.rb"));
    }

    #[test]
    fn test_justification_downgrades_unexpected_files_to_warning() {
        let v = DiffValidator::new(DiffRules::default());
        let changed = vec![file("config/routes.rb", &["y"], 0)];
        let report = v.validate(
            &changed,
            Some(&expected(&["app/models/user.rb"])),
            Some("route needed for the new endpoint"),
        );
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("route needed"));

        let blank = v.validate(&changed, Some(&expected(&["app/models/user.rb"])), Some("   "));
        assert!(!blank.valid);
    }

    #[test]
    fn test_allow_additional_files_and_globs() {
        let v = DiffValidator::new(DiffRules {
            allow_additional_files: true,
            ..Default::default()
        });
        let changed = vec![file("spec/models/user_spec.rb", &["a"], 0), file("Gemfile.lock", &["b"], 0)];
        let report = v.validate(&changed, Some(&expected(&["spec/**/*_spec.rb"])), None);
        assert!(report.valid);
        assert_eq!(report.unexpected_files, vec!["Gemfile.lock"]);

        let strict = DiffValidator::new(DiffRules::default());
        let only_specs = vec![file("spec/models/user_spec.rb", &["a"], 0)];
        assert!(strict.validate(&only_specs, Some(&expected(&["spec/**/*_spec.rb"])), None).valid);
    }

    #[test]
    fn test_single_star_does_not_cross_directories() {
        let v = DiffValidator::new(DiffRules::default());
        let changed = vec![file("app/models/user.rb", &["a"], 0), file("app/models/deep/secret.rb", &["b"], 0)];
        let report = v.validate(&changed, Some(&expected(&["app/models/*.rb"])), None);
        assert!(!report.valid);
        assert_eq!(report.unexpected_files, vec!["app/models/deep/secret.rb"]);

        let report = v.validate(&changed, Some(&expected(&["app/models/**/*.rb"])), None);
        assert!(report.valid);
    }

    #[test]
    fn test_missing_expected_files_skips_the_check() {
        let v = DiffValidator::new(DiffRules::default());
        let report = v.validate(&[file("anything.rb", &["a"], 0)], None, None);
        assert!(report.valid);
        assert!(report.unexpected_files.is_empty());
    }

    #[test]
    fn test_size_thresholds() {
        let v = DiffValidator::new(DiffRules {
            max_lines: 10,
            warn_lines: 4,
            ..Default::default()
        });
        let warn = v.validate(&[file("a.rb", &["1", "2", "3"], 2)], None, None);
        assert!(warn.valid);
        assert_eq!(warn.total_lines, 5);
        assert_eq!(warn.warnings.len(), 1);

        let fail = v.validate(&[file("a.rb", &["1"; 8], 3)], None, None);
        assert!(!fail.valid);
        assert!(fail.reason.contains("exceeds limit of 10"));
    }

    #[test]
    fn test_disallowed_pattern_names_file_and_line() {
        let v = DiffValidator::new(DiffRules {
            disallowed_patterns: vec![Regex::new(r"binding\.pry").unwrap(), Regex::new(r"console\.log\(").unwrap()],
            ..Default::default()
        });
        let changed = vec![file("app/controllers/x.rb", &["def show", "  binding.pry", "end"], 0)];
        let report = v.validate(&changed, None, None);
        assert!(!report.valid);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].file, "app/controllers/x.rb");
        assert_eq!(report.violations[0].line, 2);
        assert!(report.reason.contains("app/controllers/x.rb:2"));
    }

    #[test]
    fn test_validation_is_idempotent_and_order_independent() {
        let v = DiffValidator::new(DiffRules {
            disallowed_patterns: vec![Regex::new("TODO").unwrap()],
            ..Default::default()
        });
        let a = vec![file("b.rb", &["TODO"], 1), file("a.rb", &["x"], 0)];
        let b = vec![file("a.rb", &["x"], 0), file("b.rb", &["TODO"], 1)];
        let exp = expected(&["a.rb"]);
        let first = v.validate(&a, Some(&exp), None);
        let second = v.validate(&a, Some(&exp), None);
        let reordered = v.validate(&b, Some(&exp), None);
        assert_eq!(first, second);
        assert_eq!(first, reordered);
    }
}
