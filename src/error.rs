use std::fmt::{Display, Formatter};
use std::time::Duration;

use thiserror::Error;

pub use anyhow::Error as RuntimeError;

/// Fatal errors of a workflow run.
///
/// Anything in here stops the run before (or while) targets execute. Failures
/// of individual targets are not errors of the run, they are reported in the
/// [`Report`](crate::Report).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Couldn't analyse {} command(s):\n{}", .0.len(), join_lines(.0))]
    Specification(Vec<SpecificationError>),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("Invalid dependency graph.\n{0}")]
    Graph(#[from] GraphError),

    #[error("Cache failure, the stored state can't be trusted.\n{0}")]
    Cache(#[from] CacheError),

    #[error("Invalid options.\n{0}")]
    Options(#[from] OptionsError),

    #[error("Failed to build the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

fn join_lines<T: Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| format!("  - {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A command couldn't be parsed or analysed.
#[derive(Debug, Error)]
#[error("{owner} '{name}': {kind}")]
pub struct SpecificationError {
    pub owner: &'static str,
    pub name: String,
    pub kind: SpecificationErrorKind,
}

impl SpecificationError {
    pub(crate) fn target(name: impl Into<String>, kind: impl Into<SpecificationErrorKind>) -> Self {
        Self {
            owner: "Target",
            name: name.into(),
            kind: kind.into(),
        }
    }

    pub(crate) fn import(name: impl Into<String>, kind: impl Into<SpecificationErrorKind>) -> Self {
        Self {
            owner: "Import",
            name: name.into(),
            kind: kind.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SpecificationErrorKind {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("'{0}' only accepts string literals")]
    NonLiteralPath(&'static str),

    #[error("Couldn't read report '{0}'.\n{1}")]
    Report(String, std::io::Error),
}

/// Syntax error in command text.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Syntax error at offset {offset}: {message}")]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// The dependency graph contains a cycle. Names every member in edge order.
#[derive(Debug, Clone, Error, PartialEq)]
pub struct CycleError {
    pub cycle: Vec<String>,
}

impl Display for CycleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cycle detected: ")?;
        for name in &self.cycle {
            write!(f, "{name} -> ")?;
        }
        match self.cycle.first() {
            Some(first) => write!(f, "{first}"),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Target '{0}' is defined more than once")]
    DuplicateTarget(String),

    #[error("'{0}' is both a target and an import")]
    NameClash(String),

    #[error("File '{path}' is an output of both '{first}' and '{second}'")]
    DuplicateOutput {
        path: String,
        first: String,
        second: String,
    },

    #[error("Dynamic target '{target}' branches over '{name}', which is not a target")]
    UnknownDynamic { target: String, name: String },
}

/// Storage I/O failures.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode '{0}'.\n{1}")]
    Encode(String, String),

    #[error("Couldn't decode '{0}'.\n{1}")]
    Decode(String, String),

    #[error("No cached value for '{0}'")]
    Missing(String),

    #[error("Storage format '{0}' is not registered")]
    UnknownFormat(String),

    #[error("Format '{0}' failed.\n{1}")]
    Format(String, anyhow::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Failure of a single command execution, classified for retries and reports.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{0}")]
    User(anyhow::Error),

    #[error("Timed out after {0:.2?}")]
    Timeout(Duration),

    #[error("Infrastructure failure: {0}")]
    Infrastructure(anyhow::Error),
}

impl ExecError {
    pub fn user(message: impl Display) -> Self {
        Self::User(anyhow::anyhow!("{message}"))
    }
}

/// The condition or change expression of a trigger couldn't be evaluated.
#[derive(Debug, Error)]
pub enum TriggerEvaluationError {
    #[error("Couldn't evaluate trigger expression.\n{0}")]
    Eval(#[from] ExecError),

    #[error("Trigger condition must be a bool, got {0}")]
    NotBoolean(&'static str),

    #[error("Couldn't load '{0}' for the trigger.\n{1}")]
    Load(String, CacheError),
}

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("Couldn't compile target pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't parse options.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("The number of jobs must be at least 1")]
    Jobs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = CycleError {
            cycle: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(err.to_string(), "Cycle detected: a -> b -> c -> a");
    }

    #[test]
    fn test_specification_display() {
        let err = EngineError::Specification(vec![SpecificationError::target(
            "fit",
            SpecificationErrorKind::NonLiteralPath("file_in"),
        )]);
        assert!(err.to_string().contains("Target 'fit'"));
    }
}
