//! The command language.
//!
//! Commands are call expressions over targets and imports, e.g.
//!
//! ```text
//! fit_model(clean(raw), formula = "y ~ x", data = file_in("data/extra.csv"))
//! ```
//!
//! The language is small: literals, lists, calls with positional
//! and named arguments, indexing, arithmetic, comparisons, and `let` blocks
//! (`{ let x = f(a); g(x) }`). It is parsed into an [`Expr`] tree, which is
//! both analysed statically for dependencies and evaluated by the reference
//! [`Interpreter`](crate::Interpreter).
//!
//! [`Expr`] implements `Display` as a canonical rendering. Fingerprints hash
//! the canonical form, so reformatting a command or editing its comments does
//! not invalidate a target.

mod lexer;
mod parser;

use std::fmt::{Display, Formatter};

use crate::error::ParseError;

pub use parser::parse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// A call argument, optionally named.
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A plain or namespaced (`pkg::name`) symbol.
    Symbol(String),
    List(Vec<Expr>),
    Call {
        callee: String,
        args: Vec<Arg>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Block {
        bindings: Vec<(String, Expr)>,
        body: Box<Expr>,
    },
}

impl Expr {
    /// Parses command text.
    pub fn parse(text: &str) -> Result<Expr, ParseError> {
        parse(text)
    }

    /// The string literal, if this expression is one.
    pub fn as_str_literal(&self) -> Option<&str> {
        match self {
            Expr::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Null => write!(f, "null"),
            Expr::Bool(b) => write!(f, "{b}"),
            Expr::Int(i) => write!(f, "{i}"),
            Expr::Float(x) => write!(f, "{x:?}"),
            Expr::Str(s) => write!(f, "{s:?}"),
            Expr::Symbol(name) => write!(f, "{name}"),
            Expr::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Expr::Call { callee, args } => {
                write!(f, "{callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if let Some(name) = &arg.name {
                        write!(f, "{name} = ")?;
                    }
                    write!(f, "{}", arg.value)?;
                }
                write!(f, ")")
            }
            Expr::Index { target, index } => write!(f, "{target}[{index}]"),
            Expr::Unary { op, expr } => match op {
                UnaryOp::Neg => write!(f, "-({expr})"),
                UnaryOp::Not => write!(f, "!({expr})"),
            },
            Expr::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Expr::Block { bindings, body } => {
                write!(f, "{{ ")?;
                for (name, value) in bindings {
                    write!(f, "let {name} = {value}; ")?;
                }
                write!(f, "{body} }}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_ignores_layout() {
        let a = parse("f( a,\n  b = 1 ) # comment").unwrap();
        let b = parse("f(a, b=1)").unwrap();
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_canonical_reparses() {
        let text = r#"{ let x = f(a, "s"); g(x[0], -y, !z) + 2 * 3.5 }"#;
        let expr = parse(text).unwrap();
        let again = parse(&expr.to_string()).unwrap();
        assert_eq!(expr, again);
    }
}
