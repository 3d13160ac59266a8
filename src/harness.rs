//! Run-all-and-report test driver
//!
//! Independent checks are all executed and their verdicts collected, so one
//! failing validator does not hide the state of the others. [`TestHarness::finish`]
//! prints a summary and fails if any check failed.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{error, info};

const MAX_ERROR_LEN: usize = 200;

/// Verdict of one check
#[derive(Clone, Debug)]
pub struct TestResult {
    /// Check name
    pub name: String,
    /// Whether it passed
    pub passed: bool,
    /// Wall time spent in the check
    pub duration: Duration,
    /// Failure message, if any
    pub error: Option<String>,
}

/// Collects verdicts for one suite
#[derive(Debug)]
pub struct TestHarness {
    suite: String,
    results: Mutex<Vec<TestResult>>,
}

impl TestHarness {
    /// Create an empty harness for `suite`
    pub fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Run one check and record its verdict; a panic counts as a failure
    pub async fn run<F, Fut, E>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        info!(suite = %self.suite, test = %name, "running");
        let start = Instant::now();
        let result = AssertUnwindSafe(f()).catch_unwind().await;
        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Some(format!("PANIC: {msg}"))
            }
        };
        let passed = error.is_none();
        if let Some(ref e) = error {
            error!(suite = %self.suite, test = %name, error = %e, "failed");
        }
        self.record(name, passed, start.elapsed(), error);
        passed
    }

    /// Record a verdict obtained outside [`TestHarness::run`]
    pub fn record(&self, name: &str, passed: bool, duration: Duration, error: Option<String>) {
        self.lock().push(TestResult {
            name: name.to_string(),
            passed,
            duration,
            error,
        });
    }

    /// Verdicts recorded so far
    pub fn results(&self) -> Vec<TestResult> {
        self.lock().clone()
    }

    /// Log a summary and fail if any check failed
    pub fn finish(&self) -> Result<(), String> {
        let results = self.lock();
        let total_duration: Duration = results.iter().map(|r| r.duration).sum();
        let failures: Vec<&str> = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.name.as_str())
            .collect();

        info!("========================================");
        info!("  {}", self.suite.to_uppercase());
        info!("========================================");
        for r in results.iter() {
            let tag = if r.passed { "PASS" } else { "FAIL" };
            info!("  {tag}  {:40} {:.1}s", r.name, r.duration.as_secs_f64());
            if let Some(ref e) = r.error {
                info!("        -> {}", truncate(e, MAX_ERROR_LEN));
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} failed ({:.1}s total)",
            results.len() - failures.len(),
            failures.len(),
            total_duration.as_secs_f64()
        );
        info!("========================================");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "{} test(s) failed in {}: {}",
                failures.len(),
                self.suite,
                failures.join(", ")
            ))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TestResult>> {
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Cut `s` to at most `max` bytes on a char boundary
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
