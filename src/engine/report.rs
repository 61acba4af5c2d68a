use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::time::Duration;

use console::Style;

use crate::error::ExecError;

const GREEN: Style = Style::new().green();
const RED: Style = Style::new().red();
const YELLOW: Style = Style::new().yellow();
const BLUE: Style = Style::new().blue();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The command returned an error or panicked.
    User,
    Timeout,
    /// The executor or the cache failed around an otherwise fine command.
    Infrastructure,
    /// The trigger expression couldn't be evaluated.
    Trigger,
    /// A dynamic target couldn't be expanded.
    Expansion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Number of executions, including retries.
    pub attempts: u32,
}

impl Failure {
    pub(crate) fn new(kind: FailureKind, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts,
        }
    }

    pub(crate) fn exec(err: &ExecError, attempts: u32) -> Self {
        let kind = match err {
            ExecError::User(_) => FailureKind::User,
            ExecError::Timeout(_) => FailureKind::Timeout,
            ExecError::Infrastructure(_) => FailureKind::Infrastructure,
        };
        Self::new(kind, format!("{err:#}"), attempts)
    }
}

/// Outcome of a build.
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// Targets whose command ran successfully.
    pub built: BTreeSet<String>,
    /// Targets found current, nothing ran.
    pub up_to_date: BTreeSet<String>,
    pub failed: BTreeMap<String, Failure>,
    /// Targets never dispatched because of a failure or cancellation.
    pub skipped: BTreeSet<String>,
    /// Sub-target names of every expanded dynamic target.
    pub subtargets: BTreeMap<String, Vec<String>>,
    /// Execution time of every target that ran.
    pub durations: BTreeMap<String, Duration>,
    pub elapsed: Duration,
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Number of targets in any final state.
    pub fn len(&self) -> usize {
        self.built.len() + self.up_to_date.len() + self.failed.len() + self.skipped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} built, {} up to date, {} failed, {} skipped {}",
            GREEN.apply_to(self.built.len()),
            self.up_to_date.len(),
            RED.apply_to(self.failed.len()),
            YELLOW.apply_to(self.skipped.len()),
            BLUE.apply_to(format!("in {:.2?}", self.elapsed)),
        )?;

        let mut slowest: Vec<_> = self.durations.iter().collect();
        slowest.sort_by(|a, b| b.1.cmp(a.1));
        for (name, duration) in slowest.into_iter().take(5) {
            writeln!(f, "  {name} {}", BLUE.apply_to(format!("{duration:.2?}")))?;
        }

        for (name, failure) in &self.failed {
            let attempts = match failure.attempts {
                0 | 1 => String::new(),
                n => format!(" after {n} attempts"),
            };
            writeln!(
                f,
                "{} {name} ({:?}{attempts}): {}",
                RED.apply_to("failed"),
                failure.kind,
                failure.message
            )?;
        }

        if !self.skipped.is_empty() {
            let names: Vec<&str> = self.skipped.iter().map(String::as_str).collect();
            writeln!(f, "{} {}", YELLOW.apply_to("skipped"), names.join(", "))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_and_display() {
        let mut report = Report::default();
        report.built.insert("a".into());
        report.up_to_date.insert("b".into());
        assert!(report.is_success());
        assert_eq!(report.len(), 2);

        report.failed.insert("c".into(), Failure::exec(&ExecError::user("boom"), 3));
        report.skipped.insert("d".into());
        assert!(!report.is_success());

        // styling only wraps the counters and labels
        let text = report.to_string();
        assert!(text.contains(" up to date, "));
        assert!(text.contains(" c (User after 3 attempts): boom"));
        assert!(text.ends_with(" d\n"));
    }
}
