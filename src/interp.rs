//! Reference evaluator of the command language.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use crate::error::ExecError;
use crate::executor::{ExecRequest, Executor};
use crate::expr::{Arg, BinaryOp, Expr, UnaryOp};
use crate::imports::{Args, Import};
use crate::scope::Frame;
use crate::value::Value;

const MAX_DEPTH: usize = 256;

/// Evaluates commands in-process.
///
/// Native imports are called with their evaluated arguments, expression
/// functions are evaluated with their parameters bound in a fresh local
/// layer. The CPU budget of a request is approximated by the time spent
/// evaluating, checked at every step.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for Interpreter {
    fn execute(&self, request: &ExecRequest) -> Result<Value, ExecError> {
        let mut eval = Eval::new(&request.frame, request.seed);
        if let Some(limit) = request.budget.cpu {
            eval.budget = Some((Instant::now(), limit));
        }
        eval.expr(&request.command)
    }

    fn evaluate(&self, expr: &Expr, frame: &Frame, seed: u64) -> Result<Value, ExecError> {
        Eval::new(frame, seed).expr(expr)
    }
}

struct Eval<'a> {
    frame: &'a Frame,
    seed: u64,
    locals: Vec<(String, Value)>,
    depth: usize,
    budget: Option<(Instant, Duration)>,
}

impl<'a> Eval<'a> {
    fn new(frame: &'a Frame, seed: u64) -> Self {
        Self {
            frame,
            seed,
            locals: Vec::new(),
            depth: 0,
            budget: None,
        }
    }

    fn expr(&mut self, expr: &Expr) -> Result<Value, ExecError> {
        if let Some((start, limit)) = self.budget
            && start.elapsed() > limit
        {
            return Err(ExecError::Timeout(limit));
        }

        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(x) => Ok(Value::Float(*x)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Symbol(name) => self.symbol(name),
            Expr::List(items) => {
                let items = items.iter().map(|item| self.expr(item)).collect::<Result<_, _>>()?;
                Ok(Value::List(items))
            }
            Expr::Index { target, index } => {
                let target = self.expr(target)?;
                let index = self.expr(index)?;
                self.index(target, index)
            }
            Expr::Unary { op, expr } => {
                let value = self.expr(expr)?;
                unary(*op, value)
            }
            Expr::Binary { op: BinaryOp::And, lhs, rhs } => match self.expr(lhs)? {
                Value::Bool(false) => Ok(Value::Bool(false)),
                Value::Bool(true) => self.boolean(rhs),
                other => Err(type_error("&&", &other)),
            },
            Expr::Binary { op: BinaryOp::Or, lhs, rhs } => match self.expr(lhs)? {
                Value::Bool(true) => Ok(Value::Bool(true)),
                Value::Bool(false) => self.boolean(rhs),
                other => Err(type_error("||", &other)),
            },
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.expr(lhs)?;
                let rhs = self.expr(rhs)?;
                binary(*op, lhs, rhs)
            }
            Expr::Block { bindings, body } => {
                let mark = self.locals.len();
                for (name, expr) in bindings {
                    match self.expr(expr) {
                        Ok(value) => self.locals.push((name.clone(), value)),
                        Err(err) => {
                            self.locals.truncate(mark);
                            return Err(err);
                        }
                    }
                }
                let result = self.expr(body);
                self.locals.truncate(mark);
                result
            }
            Expr::Call { callee, args } => self.call(callee, args),
        }
    }

    fn boolean(&mut self, expr: &Expr) -> Result<Value, ExecError> {
        match self.expr(expr)? {
            Value::Bool(b) => Ok(Value::Bool(b)),
            other => Err(ExecError::user(format!("expected a bool, got {}", other.type_name()))),
        }
    }

    fn symbol(&self, name: &str) -> Result<Value, ExecError> {
        if let Some((_, value)) = self.locals.iter().rev().find(|(local, _)| local == name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.frame.value(name) {
            return Ok(value.clone());
        }
        match self.frame.import(name) {
            Some(_) => Err(ExecError::user(format!("'{name}' is a function, call it"))),
            None => Err(ExecError::user(format!("'{name}' is not bound"))),
        }
    }

    fn index(&self, target: Value, index: Value) -> Result<Value, ExecError> {
        match (&target, &index) {
            (Value::List(items), Value::Int(i)) => usize::try_from(*i)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .ok_or_else(|| ExecError::user(format!("index {i} out of range for {} elements", items.len()))),
            (Value::Map(map), Value::Str(key)) => map
                .get(key)
                .cloned()
                .ok_or_else(|| ExecError::user(format!("no key '{key}'"))),
            _ => Err(ExecError::user(format!(
                "can't index {} with {}",
                target.type_name(),
                index.type_name()
            ))),
        }
    }

    fn call(&mut self, callee: &str, args: &[Arg]) -> Result<Value, ExecError> {
        let frame = self.frame;
        match callee {
            "file_in" | "file_out" | "report_in" => {
                let mut paths = self.positional(callee, args)?;
                match paths.len() {
                    1 => Ok(paths.remove(0)),
                    _ => Ok(Value::List(paths)),
                }
            }
            "ignore" => match args {
                [] => Ok(Value::Null),
                [arg, ..] => self.expr(&arg.value),
            },
            "readd" | "loadd" => {
                let name = match args.first().map(|arg| &arg.value) {
                    Some(Expr::Symbol(name) | Expr::Str(name)) => name,
                    _ => return Err(ExecError::user(format!("{callee}() expects a target name"))),
                };
                frame
                    .value(name)
                    .cloned()
                    .ok_or_else(|| ExecError::user(format!("'{name}' is not loaded")))
            }
            _ => match frame.import(callee) {
                Some(Import::Native { func, .. }) => {
                    let func = func.clone();
                    let args = self.args(args)?;
                    func(&args).map_err(ExecError::User)
                }
                Some(Import::Function { .. }) => self.function(callee, args),
                Some(Import::Constant(_)) => Err(ExecError::user(format!("'{callee}' is a constant, not a function"))),
                None => self.builtin(callee, args),
            },
        }
    }

    /// Builtins that imports may shadow.
    fn builtin(&mut self, callee: &str, args: &[Arg]) -> Result<Value, ExecError> {
        match callee {
            "len" => {
                let values = self.positional(callee, args)?;
                match values.as_slice() {
                    [value] => Ok(Value::Int(value.len() as i64)),
                    _ => Err(ExecError::user("len() takes exactly one argument")),
                }
            }
            "seed" => Ok(Value::Int(self.seed as i64)),
            _ => Err(ExecError::user(format!("unknown function '{callee}'"))),
        }
    }

    fn function(&mut self, name: &str, args: &[Arg]) -> Result<Value, ExecError> {
        let frame = self.frame;
        let (params, body) = frame
            .function(name)
            .ok_or_else(|| ExecError::Infrastructure(anyhow::anyhow!("body of '{name}' was not parsed")))?;

        let args = self.args(args)?;
        if args.positional.len() > params.len() {
            return Err(ExecError::user(format!(
                "{name}() takes {} argument(s), got {}",
                params.len(),
                args.positional.len()
            )));
        }
        if let Some(unknown) = args.named.keys().find(|key| !params.contains(key)) {
            return Err(ExecError::user(format!("{name}() has no parameter '{unknown}'")));
        }

        let mut locals = Vec::with_capacity(params.len());
        for (index, param) in params.iter().enumerate() {
            let value = args
                .named_or(param, index)
                .map_err(|_| ExecError::user(format!("{name}() is missing argument '{param}'")))?;
            locals.push((param.clone(), value.clone()));
        }

        if self.depth >= MAX_DEPTH {
            return Err(ExecError::user(format!("recursion limit reached in '{name}'")));
        }

        let outer = std::mem::replace(&mut self.locals, locals);
        self.depth += 1;
        let result = self.expr(body);
        self.depth -= 1;
        self.locals = outer;
        result
    }

    fn positional(&mut self, callee: &str, args: &[Arg]) -> Result<Vec<Value>, ExecError> {
        if args.iter().any(|arg| arg.name.is_some()) {
            return Err(ExecError::user(format!("{callee}() takes no named arguments")));
        }
        args.iter().map(|arg| self.expr(&arg.value)).collect()
    }

    fn args(&mut self, args: &[Arg]) -> Result<Args, ExecError> {
        let mut out = Args {
            seed: self.seed,
            ..Args::default()
        };
        for arg in args {
            let value = self.expr(&arg.value)?;
            match &arg.name {
                Some(name) => {
                    out.named.insert(name.clone(), value);
                }
                None => out.positional.push(value),
            }
        }
        Ok(out)
    }
}

fn type_error(op: &str, value: &Value) -> ExecError {
    ExecError::user(format!("'{op}' is not defined for {}", value.type_name()))
}

fn overflow(op: &str) -> ExecError {
    ExecError::user(format!("integer overflow in '{op}'"))
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, ExecError> {
    match (op, value) {
        (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or_else(|| overflow("-")),
        (UnaryOp::Neg, Value::Float(x)) => Ok(Value::Float(-x)),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, other) => Err(type_error("-", &other)),
        (UnaryOp::Not, other) => Err(type_error("!", &other)),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExecError> {
    use BinaryOp::*;

    match op {
        Add => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_add(b).map(Value::Int).ok_or_else(|| overflow("+")),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (a, b) => float(op, &a, &b, |x, y| x + y),
        },
        Sub => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_sub(b).map(Value::Int).ok_or_else(|| overflow("-")),
            (a, b) => float(op, &a, &b, |x, y| x - y),
        },
        Mul => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_mul(b).map(Value::Int).ok_or_else(|| overflow("*")),
            (a, b) => float(op, &a, &b, |x, y| x * y),
        },
        Div | Rem => match (lhs, rhs) {
            (Value::Int(_), Value::Int(0)) => Err(ExecError::user("division by zero")),
            (Value::Int(a), Value::Int(b)) => {
                let result = if op == Div { a.checked_div(b) } else { a.checked_rem(b) };
                result.map(Value::Int).ok_or_else(|| overflow(op_symbol(op)))
            }
            (a, b) if op == Div => float(op, &a, &b, |x, y| x / y),
            (a, b) => float(op, &a, &b, |x, y| x % y),
        },
        Eq => Ok(Value::Bool(equal(&lhs, &rhs))),
        Ne => Ok(Value::Bool(!equal(&lhs, &rhs))),
        Lt | Le | Gt | Ge => {
            let ordering = compare(&lhs, &rhs).ok_or_else(|| {
                ExecError::user(format!(
                    "can't compare {} with {}",
                    lhs.type_name(),
                    rhs.type_name()
                ))
            })?;
            let result = match op {
                Lt => ordering == Ordering::Less,
                Le => ordering != Ordering::Greater,
                Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        And | Or => unreachable!("logical operators short-circuit in Eval::expr"),
    }
}

fn op_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Div => "/",
        _ => "%",
    }
}

fn float(op: BinaryOp, lhs: &Value, rhs: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, ExecError> {
    match (lhs.as_float(), rhs.as_float()) {
        (Some(a), Some(b)) => Ok(Value::Float(f(a, b))),
        _ => Err(ExecError::user(format!(
            "{:?} is not defined for {} and {}",
            op,
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}

fn equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => lhs.as_float()?.partial_cmp(&rhs.as_float()?),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::imports::Imports;
    use crate::scope::{Base, Layer};

    fn frame() -> Frame {
        let imports = Imports::new()
            .native("sum", "1", |args: &Args| {
                let total = args
                    .get(0)?
                    .as_list()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(Value::as_int)
                    .sum::<i64>();
                Ok(Value::Int(total))
            })
            .native("fail", "1", |_: &Args| anyhow::bail!("user code failed"))
            .function("scale", ["v", "by"], "v * by")
            .function("down", ["n"], "down(n - 1)")
            .constant("offset", 10i64);

        let bodies = ["scale", "down"]
            .into_iter()
            .map(|name| match imports.get(name) {
                Some(Import::Function { body, .. }) => (name.to_string(), Arc::new(Expr::parse(body).unwrap())),
                _ => unreachable!(),
            })
            .collect::<HashMap<_, _>>();

        Frame::new(Arc::new(Base::new(Arc::new(imports), bodies)))
            .with(Layer::Static, "raw", Value::List(vec![1i64.into(), 2i64.into(), 3i64.into()]))
    }

    fn eval(text: &str) -> Result<Value, ExecError> {
        Interpreter.evaluate(&Expr::parse(text).unwrap(), &frame(), 7)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::Int(7));
        assert_eq!(eval("7 / 2").unwrap(), Value::Int(3));
        assert_eq!(eval("7.0 / 2").unwrap(), Value::Float(3.5));
        assert_eq!(eval(r#""a" + "b""#).unwrap(), Value::Str("ab".into()));
        assert!(eval("1 / 0").is_err());
        assert!(eval("9223372036854775807 + 1").is_err());
    }

    #[test]
    fn test_logic_short_circuits() {
        assert_eq!(eval("false && missing").unwrap(), Value::Bool(false));
        assert_eq!(eval("true || missing").unwrap(), Value::Bool(true));
        assert_eq!(eval("1 < 2 && 2 == 2.0").unwrap(), Value::Bool(true));
        assert!(eval("1 && true").is_err());
    }

    #[test]
    fn test_lookup_and_calls() {
        assert_eq!(eval("sum(raw) + offset").unwrap(), Value::Int(16));
        assert_eq!(eval("raw[1]").unwrap(), Value::Int(2));
        assert_eq!(eval("scale(by = 3, v = raw[0])").unwrap(), Value::Int(3));
        assert_eq!(eval("{ let x = 2; let y = x * x; scale(y, 2) }").unwrap(), Value::Int(8));
        assert_eq!(eval("len(raw)").unwrap(), Value::Int(3));
        assert_eq!(eval("seed()").unwrap(), Value::Int(7));
        assert_eq!(eval("readd(raw)").unwrap(), eval("raw").unwrap());
    }

    #[test]
    fn test_builtins_return_paths() {
        assert_eq!(eval(r#"file_in("a.csv")"#).unwrap(), Value::Str("a.csv".into()));
        assert_eq!(eval(r#"ignore(offset)"#).unwrap(), Value::Int(10));
    }

    #[test]
    fn test_function_locals_are_fresh() {
        // `x` of the caller is not visible inside `scale`
        let err = eval("{ let x = 1; scale(x) }").unwrap_err();
        assert!(err.to_string().contains("missing argument 'by'"));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(eval("fail()"), Err(ExecError::User(_))));
        assert!(eval("nope").unwrap_err().to_string().contains("not bound"));
        assert!(eval("nope()").unwrap_err().to_string().contains("unknown function"));
        assert!(eval("down(1)").unwrap_err().to_string().contains("recursion limit"));
    }
}
