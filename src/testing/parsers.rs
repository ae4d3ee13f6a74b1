//! Test output parsers, one per framework.
//!
//! Each parser only understands its own framework's summary line. The
//! framework is chosen by configuration; output is never sniffed.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

// minitest:  "12 runs, 30 assertions, 0 failures, 0 errors, 2 skips"
// test-unit: "12 tests, 30 assertions, 0 failures, 0 errors, 3 pendings, 0 omissions, 0 notifications"
static XUNIT_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d+) (?:runs|tests), \d+ assertions, (\d+) failures, (\d+) errors(?:, (\d+) (?:skips|pendings))?(?:, (\d+) omissions)?",
    )
    .unwrap()
});

// "14 examples, 1 failure, 3 pending" and "0 examples, 0 failures, 1 error occurred outside of examples"
static RSPEC_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d+) examples?, (\d+) failures?(?:, (\d+) pending)?(?:, (\d+) errors? occurred outside of examples)?",
    )
    .unwrap()
});

// "test result: ok. 5 passed; 0 failed; 1 ignored; 0 measured; 0 filtered out"
static CARGO_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed; (\d+) ignored").unwrap()
});

// "==== 1 failed, 10 passed, 2 skipped, 1 error in 0.52s ===="
static PYTEST_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"=+ (.+?) in [\d.]+s(?: \([^)]*\))? =+").unwrap());

static PYTEST_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (passed|failed|errors?|skipped|xfailed|xpassed|deselected)").unwrap());

/// Counts extracted from a framework summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub pending: u32,
    pub skipped: u32,
}

/// Turns raw runner output into [`TestCounts`]. `None` means no summary was found.
pub trait TestOutputParser: Send + Sync {
    fn parse(&self, raw: &str) -> Option<TestCounts>;
}

/// Supported test frameworks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFramework {
    #[default]
    Minitest,
    Rspec,
    Cargo,
    Pytest,
}

impl TestFramework {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestFramework::Minitest => "minitest",
            TestFramework::Rspec => "rspec",
            TestFramework::Cargo => "cargo",
            TestFramework::Pytest => "pytest",
        }
    }

    pub fn parser(&self) -> &'static dyn TestOutputParser {
        match self {
            TestFramework::Minitest => &XUnitParser,
            TestFramework::Rspec => &RspecParser,
            TestFramework::Cargo => &CargoParser,
            TestFramework::Pytest => &PytestParser,
        }
    }
}

impl std::fmt::Display for TestFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TestFramework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minitest" | "test_unit" | "xunit" => Ok(TestFramework::Minitest),
            "rspec" => Ok(TestFramework::Rspec),
            "cargo" => Ok(TestFramework::Cargo),
            "pytest" => Ok(TestFramework::Pytest),
            other => Err(format!("unknown test framework '{}'", other)),
        }
    }
}

fn num(cap: &regex::Captures<'_>, i: usize) -> u32 {
    cap.get(i)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// xUnit-style summary (minitest, test-unit). Skips and pendings both count as pending.
pub struct XUnitParser;

impl TestOutputParser for XUnitParser {
    fn parse(&self, raw: &str) -> Option<TestCounts> {
        // Last summary wins: reruns and seeds print earlier partial lines.
        let cap = XUNIT_SUMMARY.captures_iter(raw).last()?;
        let total = num(&cap, 1);
        let failed = num(&cap, 2);
        let errors = num(&cap, 3);
        let pending = num(&cap, 4);
        let skipped = num(&cap, 5);
        Some(TestCounts {
            passed: total.saturating_sub(
                failed
                    .saturating_add(errors)
                    .saturating_add(pending)
                    .saturating_add(skipped),
            ),
            failed,
            errors,
            pending,
            skipped,
        })
    }
}

/// RSpec (BDD) summary.
pub struct RspecParser;

impl TestOutputParser for RspecParser {
    fn parse(&self, raw: &str) -> Option<TestCounts> {
        let cap = RSPEC_SUMMARY.captures_iter(raw).last()?;
        let total = num(&cap, 1);
        let failed = num(&cap, 2);
        let pending = num(&cap, 3);
        Some(TestCounts {
            passed: total.saturating_sub(failed.saturating_add(pending)),
            failed,
            errors: num(&cap, 4),
            pending,
            skipped: 0,
        })
    }
}

/// libtest summary; one line per test binary, summed.
pub struct CargoParser;

impl TestOutputParser for CargoParser {
    fn parse(&self, raw: &str) -> Option<TestCounts> {
        let mut counts: Option<TestCounts> = None;
        for cap in CARGO_SUMMARY.captures_iter(raw) {
            let c = counts.get_or_insert_with(TestCounts::default);
            c.passed = c.passed.saturating_add(num(&cap, 1));
            c.failed = c.failed.saturating_add(num(&cap, 2));
            c.skipped = c.skipped.saturating_add(num(&cap, 3));
        }
        counts
    }
}

pub struct PytestParser;

impl TestOutputParser for PytestParser {
    fn parse(&self, raw: &str) -> Option<TestCounts> {
        let summary = PYTEST_SUMMARY.captures_iter(raw).last()?;
        let body = summary.get(1)?.as_str();
        let mut counts = TestCounts::default();
        let mut found = false;
        for cap in PYTEST_COUNT.captures_iter(body) {
            found = true;
            let n = num(&cap, 1);
            match cap.get(2).map(|m| m.as_str()).unwrap_or_default() {
                "passed" | "xpassed" => counts.passed = counts.passed.saturating_add(n),
                "failed" => counts.failed = counts.failed.saturating_add(n),
                "error" | "errors" => counts.errors = counts.errors.saturating_add(n),
                "skipped" | "xfailed" => counts.skipped = counts.skipped.saturating_add(n),
                _ => {}
            }
        }
        // "no tests ran in 0.01s" is a summary with nothing in it.
        (found || body.contains("no tests ran")).then_some(counts)
    }
}
