//! Static analysis of commands: which targets, imports and files a command
//! depends on.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::core::{Blake3Hasher, Hash32};
use crate::error::SpecificationErrorKind;
use crate::expr::{Arg, Expr};

/// Builtins with meaning to the analyser. Their arguments are not ordinary
/// references.
const FILE_IN: &str = "file_in";
const FILE_OUT: &str = "file_out";
const REPORT_IN: &str = "report_in";
const IGNORE: &str = "ignore";
const READD: &str = "readd";
const LOADD: &str = "loadd";

pub(crate) const RESERVED: [&str; 6] = [FILE_IN, FILE_OUT, REPORT_IN, IGNORE, READD, LOADD];

/// Dependency facts of one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Specification {
    /// Targets the command reads.
    pub targets: BTreeSet<String>,
    /// Imports the command calls or reads, including the ones reached
    /// through expression functions.
    pub imports: BTreeSet<String>,
    pub files_in: BTreeSet<String>,
    pub files_out: BTreeSet<String>,
    /// Report sources; also listed in `files_in`.
    pub reports: BTreeSet<String>,
    /// Targets and imports read by the trigger expression.
    pub trigger: BTreeSet<String>,
}

impl Specification {
    /// Every declared file, inputs and outputs.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files_in.iter().chain(&self.files_out).map(String::as_str)
    }
}

/// The names a command may refer to.
pub struct Names {
    pub targets: BTreeSet<String>,
    pub imports: BTreeSet<String>,
    digest: Hash32,
}

impl Names {
    pub fn new(targets: BTreeSet<String>, imports: BTreeSet<String>) -> Self {
        let mut hasher = Blake3Hasher::new();
        hasher.u64(targets.len() as u64);
        for name in &targets {
            hasher.field(name);
        }
        for name in &imports {
            hasher.field(name);
        }

        Self {
            digest: hasher.finish(),
            targets,
            imports,
        }
    }
}

/// Collects references from an expression tree.
pub fn analyse(expr: &Expr, names: &Names) -> Result<Specification, SpecificationErrorKind> {
    analyse_body(expr, &[], names)
}

/// Analyses a function body; `params` shadow targets and imports.
pub(crate) fn analyse_body(
    expr: &Expr,
    params: &[String],
    names: &Names,
) -> Result<Specification, SpecificationErrorKind> {
    let mut walker = Walker {
        names,
        locals: params.to_vec(),
        spec: Specification::default(),
    };
    walker.walk(expr)?;
    Ok(walker.spec)
}

struct Walker<'a> {
    names: &'a Names,
    locals: Vec<String>,
    spec: Specification,
}

impl Walker<'_> {
    fn is_local(&self, name: &str) -> bool {
        self.locals.iter().any(|local| local == name)
    }

    fn reference(&mut self, name: &str) {
        if self.is_local(name) {
            return;
        }
        if self.names.targets.contains(name) {
            self.spec.targets.insert(name.to_string());
        } else if self.names.imports.contains(name) {
            self.spec.imports.insert(name.to_string());
        }
    }

    fn walk(&mut self, expr: &Expr) -> Result<(), SpecificationErrorKind> {
        match expr {
            Expr::Null | Expr::Bool(_) | Expr::Int(_) | Expr::Float(_) | Expr::Str(_) => {}
            Expr::Symbol(name) => self.reference(name),
            Expr::List(items) => {
                for item in items {
                    self.walk(item)?;
                }
            }
            Expr::Call { callee, args } => self.call(callee, args)?,
            Expr::Index { target, index } => {
                self.walk(target)?;
                self.walk(index)?;
            }
            Expr::Unary { expr, .. } => self.walk(expr)?,
            Expr::Binary { lhs, rhs, .. } => {
                self.walk(lhs)?;
                self.walk(rhs)?;
            }
            Expr::Block { bindings, body } => {
                let depth = self.locals.len();
                for (name, value) in bindings {
                    self.walk(value)?;
                    self.locals.push(name.clone());
                }
                self.walk(body)?;
                self.locals.truncate(depth);
            }
        }

        Ok(())
    }

    fn call(&mut self, callee: &str, args: &[Arg]) -> Result<(), SpecificationErrorKind> {
        match callee {
            IGNORE => Ok(()),
            FILE_IN | FILE_OUT | REPORT_IN => {
                let kind = match callee {
                    FILE_IN => FILE_IN,
                    FILE_OUT => FILE_OUT,
                    _ => REPORT_IN,
                };
                for arg in args {
                    let Some(path) = arg.value.as_str_literal() else {
                        return Err(SpecificationErrorKind::NonLiteralPath(kind));
                    };
                    match kind {
                        FILE_OUT => self.spec.files_out.insert(path.to_string()),
                        REPORT_IN => {
                            self.spec.files_in.insert(path.to_string());
                            self.spec.reports.insert(path.to_string())
                        }
                        _ => self.spec.files_in.insert(path.to_string()),
                    };
                }
                Ok(())
            }
            READD | LOADD => {
                for arg in args {
                    match &arg.value {
                        Expr::Str(name) => self.reference(name),
                        other => self.walk(other)?,
                    }
                }
                Ok(())
            }
            _ => {
                self.reference(callee);
                for arg in args {
                    self.walk(&arg.value)?;
                }
                Ok(())
            }
        }
    }
}

/// Targets referenced as `readd(name)` or `loadd(name)` anywhere in `text`.
pub(crate) fn scan_report(text: &str, names: &Names) -> BTreeSet<String> {
    let mut found = BTreeSet::new();

    for marker in [READD, LOADD] {
        for (start, _) in text.match_indices(marker) {
            let boundary = text[..start]
                .chars()
                .next_back()
                .is_none_or(|c| !(c.is_alphanumeric() || c == '_' || c == '.'));
            if !boundary {
                continue;
            }

            let rest = text[start + marker.len()..].trim_start();
            let Some(rest) = rest.strip_prefix('(') else {
                continue;
            };
            let rest = rest.trim_start().trim_start_matches(['"', '\'', '`']);
            let name: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '.')
                .collect();

            if names.targets.contains(&name) {
                found.insert(name);
            }
        }
    }

    found
}

/// Adds the targets referenced from the report files of `spec`.
pub(crate) fn scan_reports(spec: &mut Specification, names: &Names) -> Result<(), SpecificationErrorKind> {
    for path in spec.reports.clone() {
        match std::fs::read_to_string(&path) {
            Ok(text) => spec.targets.extend(scan_report(&text, names)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Report '{path}' does not exist yet, no dependencies scanned");
            }
            Err(err) => return Err(SpecificationErrorKind::Report(path, err)),
        }
    }
    Ok(())
}

/// Imports and targets reachable from `imports` through expression function
/// bodies.
pub(crate) fn reach(
    imports: &BTreeSet<String>,
    functions: &BTreeMap<String, Specification>,
) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut seen = imports.clone();
    let mut targets = BTreeSet::new();
    let mut queue: Vec<&String> = imports.iter().collect();

    while let Some(name) = queue.pop() {
        let Some(spec) = functions.get(name) else {
            continue;
        };
        targets.extend(spec.targets.iter().cloned());
        for next in &spec.imports {
            if seen.insert(next.clone()) {
                queue.push(next);
            }
        }
    }

    (seen, targets)
}

/// Memoized analysis, keyed by command text and the set of known names.
#[derive(Default)]
pub struct SpecCache {
    entries: HashMap<Hash32, (Arc<Expr>, Specification)>,
    hits: usize,
}

impl SpecCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and analyses `text`, or returns the memoized result.
    pub fn analyse(&mut self, text: &str, names: &Names) -> Result<(Arc<Expr>, Specification), SpecificationErrorKind> {
        let key = {
            let mut hasher = Blake3Hasher::new();
            hasher.field(text).hash(&names.digest);
            hasher.finish()
        };

        if let Some(found) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(found.clone());
        }

        let expr = Arc::new(Expr::parse(text)?);
        let spec = analyse(&expr, names)?;
        self.entries.insert(key, (expr.clone(), spec.clone()));
        Ok((expr, spec))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookups answered from memory.
    pub fn hits(&self) -> usize {
        self.hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(targets: &[&str], imports: &[&str]) -> Names {
        Names::new(
            targets.iter().map(|s| s.to_string()).collect(),
            imports.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn analysed(text: &str, names: &Names) -> Specification {
        analyse(&Expr::parse(text).unwrap(), names).unwrap()
    }

    #[test]
    fn test_references() {
        let names = names(&["raw", "clean", "unused"], &["fit", "stats::mean", "k"]);
        let spec = analysed(r#"fit(clean, raw[k], m = stats::mean(raw), other::f(1), x)"#, &names);

        assert_eq!(spec.targets, BTreeSet::from(["raw".into(), "clean".into()]));
        assert_eq!(
            spec.imports,
            BTreeSet::from(["fit".into(), "stats::mean".into(), "k".into()])
        );
    }

    #[test]
    fn test_locals_shadow() {
        let names = names(&["a", "b"], &[]);
        let spec = analysed("{ let a = b; f(a) }", &names);
        assert_eq!(spec.targets, BTreeSet::from(["b".into()]));

        // a binding is not visible in its own value
        let spec = analysed("{ let a = a; a }", &names);
        assert_eq!(spec.targets, BTreeSet::from(["a".into()]));
    }

    #[test]
    fn test_params_shadow() {
        let names = names(&["v", "w"], &[]);
        let expr = Expr::parse("v * w").unwrap();
        let spec = analyse_body(&expr, &["v".to_string()], &names).unwrap();
        assert_eq!(spec.targets, BTreeSet::from(["w".into()]));
    }

    #[test]
    fn test_files() {
        let names = names(&[], &[]);
        let spec = analysed(
            r#"f(file_in("a.csv", "b.csv"), file_out("out.png"), report_in("report.md"))"#,
            &names,
        );
        assert_eq!(
            spec.files_in,
            BTreeSet::from(["a.csv".into(), "b.csv".into(), "report.md".into()])
        );
        assert_eq!(spec.files_out, BTreeSet::from(["out.png".into()]));
        assert_eq!(spec.reports, BTreeSet::from(["report.md".into()]));
    }

    #[test]
    fn test_non_literal_path() {
        let names = names(&["p"], &[]);
        let err = analyse(&Expr::parse("file_in(p)").unwrap(), &names).unwrap_err();
        assert!(matches!(err, SpecificationErrorKind::NonLiteralPath("file_in")));
    }

    #[test]
    fn test_ignore_and_readd() {
        let names = names(&["a", "b", "c"], &[]);
        let spec = analysed(r#"f(ignore(a), readd("b"), loadd(c))"#, &names);
        assert_eq!(spec.targets, BTreeSet::from(["b".into(), "c".into()]));
    }

    #[test]
    fn test_scan_report() {
        let names = names(&["fit", "summary"], &[]);
        let text = r#"
            Results: `r readd(fit)` and loadd( "summary" ).
            Not a call: myreadd(fit2), readd(missing).
        "#;
        assert_eq!(
            scan_report(text, &names),
            BTreeSet::from(["fit".into(), "summary".into()])
        );
    }

    #[test]
    fn test_reach() {
        let names = names(&["raw"], &["f", "g", "h"]);
        let mut functions = BTreeMap::new();
        functions.insert("f".to_string(), analysed("g(1)", &names));
        functions.insert("g".to_string(), analysed("h(raw)", &names));
        functions.insert("h".to_string(), analysed("f(0)", &names));

        let (imports, targets) = reach(&BTreeSet::from(["f".into()]), &functions);
        assert_eq!(imports.len(), 3);
        assert_eq!(targets, BTreeSet::from(["raw".into()]));
    }

    #[test]
    fn test_spec_cache() {
        let names = names(&["a"], &[]);
        let mut cache = SpecCache::new();

        let (_, first) = cache.analyse("f(a)", &names).unwrap();
        let (_, second) = cache.analyse("f(a)", &names).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.hits(), 1);

        // a different name set is a different key
        let other = Names::new(BTreeSet::new(), BTreeSet::new());
        let (_, third) = cache.analyse("f(a)", &other).unwrap();
        assert!(third.targets.is_empty());
        assert_eq!(cache.len(), 2);

        assert!(cache.analyse("f(", &names).is_err());
    }
}
