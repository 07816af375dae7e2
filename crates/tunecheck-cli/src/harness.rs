//! Run-all-and-report execution of suite cases.
//!
//! Every case runs even when earlier ones fail; [`TestHarness::finish`] logs
//! a summary and fails if any case failed.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::info;

use tunecheck_power::Outcome;

use crate::{Error, Result};

/// Longest error text shown per case in the summary
const MAX_ERROR_LEN: usize = 200;

/// How a case ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaseStatus {
    Passed,
    Skipped(String),
    Failed(String),
}

impl CaseStatus {
    fn tag(&self) -> &'static str {
        match self {
            CaseStatus::Passed => "PASS",
            CaseStatus::Skipped(_) => "SKIP",
            CaseStatus::Failed(_) => "FAIL",
        }
    }
}

pub struct CaseResult {
    pub name: String,
    pub status: CaseStatus,
    pub duration: Duration,
}

pub struct TestHarness {
    suite: String,
    results: Arc<Mutex<Vec<CaseResult>>>,
}

impl TestHarness {
    pub fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run one case, recording its status and duration. Panics count as
    /// failures.
    pub async fn run<F, Fut, E>(&self, name: &str, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Outcome, E>>,
        E: std::fmt::Display,
    {
        info!(case = %name, suite = %self.suite, "Running case");
        let start = Instant::now();
        let status = match AssertUnwindSafe(f()).catch_unwind().await {
            Ok(Ok(Outcome::Passed)) => CaseStatus::Passed,
            Ok(Ok(Outcome::Skipped { reason })) => CaseStatus::Skipped(reason),
            Ok(Err(e)) => CaseStatus::Failed(e.to_string()),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                CaseStatus::Failed(format!("PANIC: {msg}"))
            }
        };
        self.record(name, status, start.elapsed());
    }

    pub fn record(&self, name: &str, status: CaseStatus, duration: Duration) {
        self.lock().push(CaseResult {
            name: name.to_string(),
            status,
            duration,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CaseResult>> {
        self.results.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Names of the cases that failed so far
    pub fn failures(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|r| matches!(r.status, CaseStatus::Failed(_)))
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn finish(&self) -> Result<()> {
        let results = self.lock();
        let total_duration: Duration = results.iter().map(|r| r.duration).sum();
        let count = |tag: &str| results.iter().filter(|r| r.status.tag() == tag).count();

        info!("========================================");
        info!("  {}", self.suite.to_uppercase());
        info!("========================================");
        for r in results.iter() {
            info!(
                "  {}  {:40} {:.1}s",
                r.status.tag(),
                r.name,
                r.duration.as_secs_f64()
            );
            match &r.status {
                CaseStatus::Failed(e) => info!("        -> {}", truncate(e)),
                CaseStatus::Skipped(reason) => info!("        -> {reason}"),
                CaseStatus::Passed => {}
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} skipped, {} failed ({:.1}s total)",
            count("PASS"),
            count("SKIP"),
            count("FAIL"),
            total_duration.as_secs_f64()
        );
        info!("========================================");
        drop(results);

        let cases = self.failures();
        if cases.is_empty() {
            Ok(())
        } else {
            Err(Error::CasesFailed {
                suite: self.suite.clone(),
                cases,
            })
        }
    }
}

fn truncate(message: &str) -> &str {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_case_runs_and_failures_fail_the_suite() {
        let harness = TestHarness::new("power");

        harness
            .run("passes", || async { Ok::<_, String>(Outcome::Passed) })
            .await;
        harness
            .run("fails", || async { Err::<Outcome, _>("mismatch on cpu0") })
            .await;
        harness
            .run("skips", || async {
                Ok::<_, String>(Outcome::skipped("hints present"))
            })
            .await;

        assert_eq!(harness.failures(), vec!["fails".to_string()]);
        match harness.finish() {
            Err(Error::CasesFailed { suite, cases }) => {
                assert_eq!(suite, "power");
                assert_eq!(cases, vec!["fails".to_string()]);
            }
            other => panic!("Expected CasesFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn skipped_cases_do_not_fail_the_suite() {
        let harness = TestHarness::new("power");
        harness
            .run("skips", || async {
                Ok::<_, String>(Outcome::skipped("not applicable"))
            })
            .await;
        harness.finish().expect("nothing failed");
    }

    #[tokio::test]
    async fn panicking_case_is_recorded_as_failed() {
        let harness = TestHarness::new("metallb");
        harness
            .run("panics", || async {
                if true {
                    panic!("probe pod vanished");
                }
                Ok::<_, String>(Outcome::Passed)
            })
            .await;

        let results = harness.lock();
        assert_eq!(
            results[0].status,
            CaseStatus::Failed("PANIC: probe pod vanished".to_string())
        );
    }

    #[test]
    fn long_errors_are_truncated_on_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_LEN + 10);
        assert_eq!(truncate(&long).chars().count(), MAX_ERROR_LEN);
        assert_eq!(truncate("short"), "short");
    }
}
