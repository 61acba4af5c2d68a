//! Expansion of dynamic targets into sub-targets.

use std::collections::{BTreeMap, HashMap};

use crate::core::{Blake3Hasher, Hash32};
use crate::plan::Dynamic;
use crate::scope::Layer;
use crate::value::Value;

/// One sub-target of a dynamic target.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Expansion {
    pub name: String,
    pub index: usize,
    /// Values bound for this sub-target, by target name.
    pub bindings: Vec<(String, Value)>,
}

impl Expansion {
    fn new(parent: &str, index: usize, bindings: Vec<(String, Value)>) -> Self {
        let mut hasher = Blake3Hasher::new();
        hasher.field(parent).u64(index as u64);
        for (name, value) in &bindings {
            hasher.field(name).hash(&value.hash());
        }

        Self {
            name: format!("{parent}_{}", hasher.finish().short()),
            index,
            bindings,
        }
    }

    /// Hashes of the bound values, used in place of the whole inputs.
    pub fn hashes(&self) -> impl Iterator<Item = (&str, Hash32)> {
        self.bindings.iter().map(|(name, value)| (name.as_str(), value.hash()))
    }
}

/// Layer the bindings of a dynamic kind live in.
pub(crate) fn layer(dynamic: &Dynamic) -> Layer {
    match dynamic {
        Dynamic::Aggregate { .. } => Layer::Aggregated,
        _ => Layer::Subtarget,
    }
}

/// Splits the inputs of `parent` into sub-targets.
///
/// `inputs` holds the value of every target in [`Dynamic::inputs`]. At most
/// `cap` sub-targets are produced, always the first ones, so a capped
/// expansion is reproducible.
pub(crate) fn expand(
    parent: &str,
    dynamic: &Dynamic,
    inputs: &BTreeMap<String, Value>,
    cap: Option<usize>,
) -> Result<Vec<Expansion>, String> {
    let elements = |name: &str| -> Result<Vec<Value>, String> {
        inputs
            .get(name)
            .map(Value::elements)
            .ok_or_else(|| format!("input '{name}' is not loaded"))
    };

    let mut bindings: Vec<Vec<(String, Value)>> = match dynamic {
        Dynamic::Map { over } => {
            let columns = over
                .iter()
                .map(|name| Ok((name, elements(name.as_str())?)))
                .collect::<Result<Vec<_>, String>>()?;

            let len = columns.first().map_or(0, |(_, column)| column.len());
            if let Some((name, column)) = columns.iter().find(|(_, column)| column.len() != len) {
                return Err(format!(
                    "can't map over inputs of different lengths: '{}' has {len}, '{name}' has {}",
                    columns[0].0,
                    column.len()
                ));
            }

            (0..len)
                .map(|i| {
                    columns
                        .iter()
                        .map(|(name, column)| (name.to_string(), column[i].clone()))
                        .collect()
                })
                .collect()
        }
        Dynamic::Cross { over } => {
            let mut rows: Vec<Vec<(String, Value)>> = vec![Vec::new()];
            for name in over {
                let column = elements(name.as_str())?;
                rows = rows
                    .into_iter()
                    .flat_map(|row| {
                        column.iter().map(move |value| {
                            let mut row = row.clone();
                            row.push((name.clone(), value.clone()));
                            row
                        })
                    })
                    .collect();
            }
            if over.is_empty() { Vec::new() } else { rows }
        }
        Dynamic::Group { over, by } => {
            let values = elements(over.as_str())?;
            let keys = elements(by.as_str())?;
            if values.len() != keys.len() {
                return Err(format!(
                    "can't group '{over}' ({} elements) by '{by}' ({} elements)",
                    values.len(),
                    keys.len()
                ));
            }

            let mut groups: BTreeMap<String, (Value, Vec<Value>)> = BTreeMap::new();
            for (key, value) in keys.into_iter().zip(values) {
                groups
                    .entry(key.to_string())
                    .or_insert_with(|| (key, Vec::new()))
                    .1
                    .push(value);
            }

            groups
                .into_values()
                .map(|(key, members)| vec![(over.clone(), Value::List(members)), (by.clone(), key)])
                .collect()
        }
        Dynamic::Aggregate { over } => {
            let row = over
                .iter()
                .map(|name| Ok((name.clone(), Value::List(elements(name.as_str())?))))
                .collect::<Result<Vec<_>, String>>()?;
            vec![row]
        }
    };

    if let Some(cap) = cap
        && bindings.len() > cap
    {
        tracing::info!(
            "Capping '{parent}' at {cap} of {} sub-targets",
            bindings.len()
        );
        bindings.truncate(cap);
    }

    let expansions: Vec<Expansion> = bindings
        .into_iter()
        .enumerate()
        .map(|(index, row)| Expansion::new(parent, index, row))
        .collect();

    let mut seen = HashMap::with_capacity(expansions.len());
    for sub in &expansions {
        if let Some(first) = seen.insert(sub.name.as_str(), sub.index) {
            return Err(format!(
                "sub-targets {first} and {} of '{parent}' share the name '{}'",
                sub.index, sub.name
            ));
        }
    }

    Ok(expansions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: impl IntoIterator<Item = i64>) -> Value {
        Value::List(items.into_iter().map(Value::Int).collect())
    }

    fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_map_zips() {
        let dynamic = Dynamic::Map {
            over: vec!["a".into(), "b".into()],
        };
        let subs = expand("fit", &dynamic, &inputs(&[("a", list([1, 2])), ("b", list([3, 4]))]), None).unwrap();

        assert_eq!(subs.len(), 2);
        assert_eq!(subs[1].bindings, [("a".to_string(), Value::Int(2)), ("b".to_string(), Value::Int(4))]);
        assert!(subs[0].name.starts_with("fit_"));
        assert_eq!(subs[0].name.len(), "fit_".len() + 8);

        let err = expand("fit", &dynamic, &inputs(&[("a", list([1])), ("b", list([3, 4]))]), None);
        assert!(err.is_err());
    }

    #[test]
    fn test_cross_product() {
        let dynamic = Dynamic::Cross {
            over: vec!["a".into(), "b".into()],
        };
        let subs = expand("c", &dynamic, &inputs(&[("a", list([1, 2])), ("b", list([3, 4, 5]))]), None).unwrap();
        assert_eq!(subs.len(), 6);
        assert_eq!(subs[3].bindings, [("a".to_string(), Value::Int(2)), ("b".to_string(), Value::Int(3))]);
    }

    #[test]
    fn test_group_sorted_by_key() {
        let dynamic = Dynamic::Group {
            over: "rows".into(),
            by: "keys".into(),
        };
        let keys = Value::List(vec!["b".into(), "a".into(), "b".into()]);
        let subs = expand("g", &dynamic, &inputs(&[("rows", list([1, 2, 3])), ("keys", keys)]), None).unwrap();

        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].bindings[0].1, list([2]));
        assert_eq!(subs[0].bindings[1].1, Value::Str("a".into()));
        assert_eq!(subs[1].bindings[0].1, list([1, 3]));
    }

    #[test]
    fn test_aggregate_binds_whole_collection() {
        let dynamic = Dynamic::Aggregate {
            over: vec!["a".into()],
        };
        let subs = expand("agg", &dynamic, &inputs(&[("a", list([1, 2, 3]))]), None).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].bindings[0].1, list([1, 2, 3]));
        assert_eq!(layer(&dynamic), Layer::Aggregated);
    }

    #[test]
    fn test_cap_is_deterministic() {
        let dynamic = Dynamic::Map {
            over: vec!["a".into()],
        };
        let input = inputs(&[("a", list(0..10))]);

        let first = expand("m", &dynamic, &input, Some(3)).unwrap();
        let second = expand("m", &dynamic, &input, Some(3)).unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert_eq!(first[2].bindings[0].1, Value::Int(2));
    }

    #[test]
    fn test_names_follow_content() {
        let dynamic = Dynamic::Map {
            over: vec!["a".into()],
        };
        let before = expand("m", &dynamic, &inputs(&[("a", list([1, 2]))]), None).unwrap();
        let after = expand("m", &dynamic, &inputs(&[("a", list([1, 9]))]), None).unwrap();
        assert_eq!(before[0].name, after[0].name);
        assert_ne!(before[1].name, after[1].name);
    }

    #[test]
    fn test_names_are_unique_in_large_expansions() {
        let dynamic = Dynamic::Map {
            over: vec!["a".into()],
        };
        let subs = expand("fit", &dynamic, &inputs(&[("a", list(0..200_000))]), None).unwrap();
        let names: std::collections::HashSet<&str> = subs.iter().map(|sub| sub.name.as_str()).collect();
        assert_eq!(names.len(), 200_000);
        assert_eq!(subs[0].name.len(), "fit_".len() + 32);
    }

    #[test]
    fn test_repeated_elements_get_distinct_names() {
        let dynamic = Dynamic::Cross {
            over: vec!["a".into(), "b".into()],
        };
        let input = inputs(&[("a", list([1, 1])), ("b", list([2, 2]))]);
        let subs = expand("c", &dynamic, &input, None).unwrap();
        let names: std::collections::HashSet<&str> = subs.iter().map(|sub| sub.name.as_str()).collect();
        assert_eq!(names.len(), 4);
    }
}
