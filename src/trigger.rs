//! The rebuild decision, one handler per trigger kind.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::core::{Blake3Hasher, Hash32};
use crate::error::TriggerEvaluationError;
use crate::meta::{FileStamp, Metadata};
use crate::plan::Trigger;
use crate::value::Value;

/// Why a target has to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Never built before.
    New,
    /// Built before, but the value is gone from the cache.
    Missing,
    /// Command, dependencies, seed or format changed.
    Fingerprint,
    /// A declared file changed.
    Files,
    Condition,
    Change,
    Always,
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Reason::New => "no previous build",
            Reason::Missing => "cached value missing",
            Reason::Fingerprint => "fingerprint changed",
            Reason::Files => "declared file changed",
            Reason::Condition => "condition is true",
            Reason::Change => "change value differs",
            Reason::Always => "always rebuilds",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Build(Reason),
    Skip,
}

impl Decision {
    pub fn is_build(self) -> bool {
        matches!(self, Decision::Build(_))
    }
}

/// Everything the decision looks at.
pub(crate) struct Staleness<'a> {
    pub previous: Option<&'a Metadata>,
    pub value_exists: bool,
    pub fingerprint: Hash32,
    /// Fresh stamps of every declared file.
    pub files: &'a BTreeMap<String, FileStamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub decision: Decision,
    /// Hash of the `change` expression value, persisted with the metadata.
    pub change: Option<Hash32>,
}

/// Part of the fingerprint contributed by the trigger itself.
pub(crate) fn trigger_hash(trigger: &Trigger, canonical: Option<&str>) -> Hash32 {
    let mut hasher = Blake3Hasher::new();
    hasher.field(trigger.name());
    if let Some(text) = canonical.or(trigger.expression()) {
        hasher.field(text);
    }
    hasher.finish()
}

/// Decides whether a target builds.
///
/// `evaluate` runs the trigger expression of `condition` and `change`
/// triggers; it is called at most once and only for those kinds.
pub(crate) fn decide(
    trigger: &Trigger,
    staleness: &Staleness<'_>,
    evaluate: impl FnOnce() -> Result<Value, TriggerEvaluationError>,
) -> Result<Outcome, TriggerEvaluationError> {
    let mut evaluate = Some(evaluate);

    // The change value is needed even on a first build, to be persisted.
    let change = if let Trigger::Change(_) = trigger
        && let Some(evaluate) = evaluate.take()
    {
        Some(evaluate()?.hash())
    } else {
        None
    };

    let outcome = |decision| Outcome { decision, change };

    let Some(previous) = staleness.previous else {
        return Ok(outcome(Decision::Build(Reason::New)));
    };
    if !staleness.value_exists {
        return Ok(outcome(Decision::Build(Reason::Missing)));
    }

    let decision = match trigger {
        Trigger::Always => Decision::Build(Reason::Always),
        Trigger::Never => Decision::Skip,
        Trigger::Command => {
            if previous.fingerprint != staleness.fingerprint {
                Decision::Build(Reason::Fingerprint)
            } else if files_changed(&previous.files, staleness.files, false) {
                Decision::Build(Reason::Files)
            } else {
                Decision::Skip
            }
        }
        Trigger::File => {
            if files_changed(&previous.files, staleness.files, true) {
                Decision::Build(Reason::Files)
            } else {
                Decision::Skip
            }
        }
        Trigger::Condition(_) => {
            let value = match evaluate.take() {
                Some(evaluate) => evaluate()?,
                None => Value::Null,
            };
            match value {
                Value::Bool(true) => Decision::Build(Reason::Condition),
                Value::Bool(false) => Decision::Skip,
                other => return Err(TriggerEvaluationError::NotBoolean(other.type_name())),
            }
        }
        Trigger::Change(_) => {
            if previous.change.is_none() || previous.change != change {
                Decision::Build(Reason::Change)
            } else {
                Decision::Skip
            }
        }
    };

    Ok(outcome(decision))
}

/// Compares stamps by content, and also by modification time when `mtime`.
fn files_changed(
    previous: &BTreeMap<String, FileStamp>,
    current: &BTreeMap<String, FileStamp>,
    mtime: bool,
) -> bool {
    if previous.len() != current.len() {
        return true;
    }

    current.iter().any(|(path, stamp)| match previous.get(path) {
        None => true,
        Some(old) => old.hash != stamp.hash || (mtime && old.mtime != stamp.mtime),
    })
}
