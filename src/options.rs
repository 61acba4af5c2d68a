//! Run configuration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::OptionsError;
use crate::scope::MemoryStrategy;

/// Stops a running build from dispatching more targets.
///
/// Targets already running finish, or run into their elapsed budget. Clones
/// share the flag, so a clone can be handed to another thread or a signal
/// handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options of a single `build` or `outdated` call.
///
/// Deserializes from JSON with every field optional:
///
/// ```rust
/// let options = nagare::Options::from_json(r#"{"jobs": 4, "keep_going": true}"#).unwrap();
/// assert_eq!(options.jobs, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Number of targets building at the same time. `1` builds on the calling
    /// thread.
    pub jobs: usize,
    /// Keep building independent targets after a failure.
    pub keep_going: bool,
    pub memory: MemoryStrategy,
    /// Seed from which the seeds of targets without an explicit one derive.
    pub seed: u64,
    /// Glob patterns selecting the targets to build. Upstream targets of a
    /// selected target are always included. Empty selects everything.
    pub targets: Vec<String>,
    /// Run-wide cap on the number of sub-targets of a dynamic target.
    pub max_expand: Option<usize>,
    /// Retries of targets that don't set their own.
    pub retries: u32,
    /// Draw a progress bar.
    pub progress: bool,
    #[serde(skip)]
    pub cancel: CancelToken,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            jobs: 1,
            keep_going: false,
            memory: MemoryStrategy::default(),
            seed: 0,
            targets: Vec::new(),
            max_expand: None,
            retries: 0,
            progress: true,
            cancel: CancelToken::default(),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self, OptionsError> {
        let options: Options = serde_json::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    pub fn memory(mut self, memory: MemoryStrategy) -> Self {
        self.memory = memory;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn select(mut self, pattern: impl Into<String>) -> Self {
        self.targets.push(pattern.into());
        self
    }

    pub fn max_expand(mut self, max: usize) -> Self {
        self.max_expand = Some(max);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.jobs == 0 {
            return Err(OptionsError::Jobs);
        }
        self.patterns()?;
        Ok(())
    }

    /// Compiled target selection.
    pub fn patterns(&self) -> Result<Vec<Pattern>, OptionsError> {
        self.targets
            .iter()
            .map(|pattern| Ok(Pattern::new(pattern)?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let options = Options::from_json("{}").unwrap();
        assert_eq!(options.jobs, 1);
        assert!(!options.keep_going);
        assert_eq!(options.memory, MemoryStrategy::Speed);
        assert!(options.progress);
    }

    #[test]
    fn test_json_fields() {
        let options = Options::from_json(
            r#"{"jobs": 3, "memory": "autoclean", "targets": ["fit_*"], "max_expand": 5, "retries": 2}"#,
        )
        .unwrap();
        assert_eq!(options.jobs, 3);
        assert_eq!(options.memory, MemoryStrategy::Autoclean);
        assert_eq!(options.max_expand, Some(5));
        assert!(options.patterns().unwrap()[0].matches("fit_lm"));
    }

    #[test]
    fn test_validate() {
        assert!(matches!(Options::new().jobs(0).validate(), Err(OptionsError::Jobs)));
        assert!(matches!(
            Options::new().select("[").validate(),
            Err(OptionsError::Pattern(_))
        ));
        assert!(Options::from_json(r#"{"jobs": 0}"#).is_err());
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let options = Options::new();
        let token = options.cancel.clone();
        assert!(!options.cancel.is_cancelled());
        token.cancel();
        assert!(options.cancel.is_cancelled());
    }
}
