use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use thiserror::Error;

use crate::ast::{ArithOp, ArrayOp, AstNode, ComparisonOp, LogicOp, Value};
use crate::parse::{compile, ParseError};

/// Caller-supplied values an expression is evaluated against.
pub type Parameters = HashMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("could not parse expression: {0}")]
    Compile(#[from] ParseError),
    #[error("no parameter '{0}' found")]
    MissingParameter(String),
    #[error("cannot apply {op} to {left} and {right}")]
    TypeMismatch {
        op: String,
        left: &'static str,
        right: &'static str,
    },
    #[error("{op} expects a {expected}, got {found}")]
    WrongOperand {
        op: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("invalid regex `{pattern}`: {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("expression `{expression}` did not return a bool: {value}")]
    NotBoolean { expression: String, value: Value },
}

/// A parsed expression, ready to be evaluated any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: AstNode,
}

impl Expression {
    pub fn compile(source: &str) -> Result<Self, ParseError> {
        Ok(Self {
            source: source.to_string(),
            root: compile(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, params: &Parameters) -> Result<Value, EvalError> {
        eval_node(&self.root, params)
    }

    /// Evaluates and insists on a boolean result.
    pub fn evaluate_bool(&self, params: &Parameters) -> Result<bool, EvalError> {
        match self.evaluate(params)? {
            Value::Bool(b) => Ok(b),
            value => Err(EvalError::NotBoolean {
                expression: self.source.clone(),
                value,
            }),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn expect_bool(op: &'static str, value: Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::WrongOperand {
            op,
            expected: "bool",
            found: other.type_name(),
        }),
    }
}

fn mismatch(op: impl fmt::Display, left: &Value, right: &Value) -> EvalError {
    EvalError::TypeMismatch {
        op: op.to_string(),
        left: left.type_name(),
        right: right.type_name(),
    }
}

fn compare(left: &Value, op: ComparisonOp, right: &Value) -> Result<bool, EvalError> {
    let ordering = match op {
        ComparisonOp::Eq => return Ok(left == right),
        ComparisonOp::NotEq => return Ok(left != right),
        _ => match (left, right) {
            (Value::Number(l), Value::Number(r)) => l.partial_cmp(r),
            (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
            _ => return Err(mismatch(op, left, right)),
        },
    };
    // NaN never orders
    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match op {
        ComparisonOp::More => ordering == Ordering::Greater,
        ComparisonOp::MoreEq => ordering != Ordering::Less,
        ComparisonOp::Less => ordering == Ordering::Less,
        ComparisonOp::LessEq => ordering != Ordering::Greater,
        ComparisonOp::Eq | ComparisonOp::NotEq => unreachable!(),
    })
}

fn arith(left: Value, op: ArithOp, right: Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::String(l), Value::String(r)) if op == ArithOp::Add => Ok(Value::String(l + &r)),
        (Value::Number(l), Value::Number(r)) => {
            let n = match op {
                ArithOp::Add => l + r,
                ArithOp::Sub => l - r,
                ArithOp::Mul => l * r,
                ArithOp::Div | ArithOp::Rem if r == 0.0 => return Err(EvalError::DivisionByZero),
                ArithOp::Div => l / r,
                ArithOp::Rem => l % r,
            };
            Ok(Value::Number(n))
        }
        (l, r) => Err(mismatch(op, &l, &r)),
    }
}

fn regex_match(haystack: Value, pattern: &AstNode, params: &Parameters) -> Result<bool, EvalError> {
    let Value::String(haystack) = haystack else {
        return Err(EvalError::WrongOperand {
            op: "=~",
            expected: "string",
            found: haystack.type_name(),
        });
    };
    if let AstNode::Regex(compiled) = pattern {
        return Ok(compiled.0.is_match(&haystack));
    }
    match eval_node(pattern, params)? {
        Value::String(p) => match Regex::new(&p) {
            Ok(re) => Ok(re.is_match(&haystack)),
            Err(e) => Err(EvalError::InvalidRegex {
                pattern: p,
                reason: e.to_string(),
            }),
        },
        other => Err(EvalError::WrongOperand {
            op: "=~",
            expected: "string pattern",
            found: other.type_name(),
        }),
    }
}

fn eval_node(node: &AstNode, params: &Parameters) -> Result<Value, EvalError> {
    let result = match node {
        AstNode::Constant(value) => value.clone(),
        AstNode::Variable(name) => params
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::MissingParameter(name.clone()))?,
        AstNode::Not(inner) => Value::Bool(!expect_bool("!", eval_node(inner, params)?)?),
        AstNode::Negate(inner) => match eval_node(inner, params)? {
            Value::Number(n) => Value::Number(-n),
            other => {
                return Err(EvalError::WrongOperand {
                    op: "-",
                    expected: "number",
                    found: other.type_name(),
                })
            }
        },
        // a && b, a || b: the right side is only evaluated when needed
        AstNode::Logic(lhs, op, rhs) => {
            let (name, short_circuit) = match op {
                LogicOp::And => ("&&", false),
                LogicOp::Or => ("||", true),
            };
            if expect_bool(name, eval_node(lhs, params)?)? == short_circuit {
                Value::Bool(short_circuit)
            } else {
                Value::Bool(expect_bool(name, eval_node(rhs, params)?)?)
            }
        }
        AstNode::Compare(lhs, op, rhs) => {
            let left = eval_node(lhs, params)?;
            let right = eval_node(rhs, params)?;
            Value::Bool(compare(&left, *op, &right)?)
        }
        AstNode::Arith(lhs, op, rhs) => arith(eval_node(lhs, params)?, *op, eval_node(rhs, params)?)?,
        AstNode::Array(lhs, op, items) => {
            let needle = eval_node(lhs, params)?;
            let mut found = false;
            for item in items {
                if eval_node(item, params)? == needle {
                    found = true;
                    break;
                }
            }
            Value::Bool(match op {
                ArrayOp::In => found,
                ArrayOp::NotIn => !found,
            })
        }
        AstNode::Match {
            expr,
            pattern,
            negate,
        } => {
            let matched = regex_match(eval_node(expr, params)?, pattern, params)?;
            Value::Bool(matched != *negate)
        }
        AstNode::Regex(pattern) => Value::String(pattern.0.as_str().to_string()),
    };
    Ok(result)
}
