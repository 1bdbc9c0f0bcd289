use core::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A typed parameter or intermediate value of an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    /// Guess the type of a raw textual value, e.g. a query string or a
    /// `key=value` CLI argument. `true`/`false` become booleans, finite
    /// numbers become numbers, everything else stays a string.
    pub fn infer(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("true") {
            return Value::Bool(true);
        }
        if raw.eq_ignore_ascii_case("false") {
            return Value::Bool(false);
        }
        match raw.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Value::Number(n),
            _ => Value::String(raw.to_string()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComparisonOp {
    Eq,
    More,
    Less,
    MoreEq,
    LessEq,
    NotEq,
}

impl ComparisonOp {
    pub fn from_str(expr: &str) -> Self {
        match expr {
            "==" | "=" => ComparisonOp::Eq,
            ">" => ComparisonOp::More,
            ">=" => ComparisonOp::MoreEq,
            "<" => ComparisonOp::Less,
            "<=" => ComparisonOp::LessEq,
            "!=" | "<>" => ComparisonOp::NotEq,
            _ => unreachable!(),
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonOp::Eq => write!(f, "=="),
            ComparisonOp::More => write!(f, ">"),
            ComparisonOp::Less => write!(f, "<"),
            ComparisonOp::MoreEq => write!(f, ">="),
            ComparisonOp::LessEq => write!(f, "<="),
            ComparisonOp::NotEq => write!(f, "!="),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogicOp {
    And,
    Or,
}

impl fmt::Display for LogicOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicOp::And => write!(f, "&&"),
            LogicOp::Or => write!(f, "||"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArithOp::Add => write!(f, "+"),
            ArithOp::Sub => write!(f, "-"),
            ArithOp::Mul => write!(f, "*"),
            ArithOp::Div => write!(f, "/"),
            ArithOp::Rem => write!(f, "%"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArrayOp {
    In,
    NotIn,
}

/// A regex compiled once at expression compile time.
#[derive(Debug, Clone)]
pub struct Pattern(pub Regex);

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AstNode {
    Constant(Value),
    Variable(String),
    Not(Box<AstNode>),
    Negate(Box<AstNode>),
    Compare(Box<AstNode>, ComparisonOp, Box<AstNode>),
    Arith(Box<AstNode>, ArithOp, Box<AstNode>),
    Array(Box<AstNode>, ArrayOp, Vec<AstNode>),
    Match {
        expr: Box<AstNode>,
        pattern: Box<AstNode>,
        negate: bool,
    },
    Regex(Pattern),
    Logic(Box<AstNode>, LogicOp, Box<AstNode>),
}

impl AstNode {
    /// Number of nodes on the longest path from this node to a leaf.
    pub fn depth(&self) -> usize {
        let below = match self {
            AstNode::Constant(_) | AstNode::Variable(_) | AstNode::Regex(_) => 0,
            AstNode::Not(n) | AstNode::Negate(n) => n.depth(),
            AstNode::Compare(l, _, r) | AstNode::Arith(l, _, r) | AstNode::Logic(l, _, r) => {
                l.depth().max(r.depth())
            }
            AstNode::Array(l, _, items) => items.iter().map(AstNode::depth).fold(l.depth(), usize::max),
            AstNode::Match { expr, pattern, .. } => expr.depth().max(pattern.depth()),
        };
        below + 1
    }
}
