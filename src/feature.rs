use std::fmt;
use std::str::FromStr;

use once_cell::sync::OnceCell;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{FeatureError, InvalidReason, Result};
use crate::eval::{EvalError, Expression, Parameters};
use crate::parse::ParseError;

/// How a flag decides whether it is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureType {
    Constant,
    PercentageBased,
    Expression,
    /// Anything we could not recognize. Never valid.
    #[default]
    #[serde(other)]
    Unknown,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::Constant => "CONSTANT",
            FeatureType::PercentageBased => "PERCENTAGE_BASED",
            FeatureType::Expression => "EXPRESSION",
            FeatureType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureType {
    type Err = FeatureError;

    /// Accepts the symbolic name in any case, with `-` or `_` separators.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "CONSTANT" => Ok(FeatureType::Constant),
            "PERCENTAGE_BASED" => Ok(FeatureType::PercentageBased),
            "EXPRESSION" => Ok(FeatureType::Expression),
            _ => Err(FeatureError::UnknownType {
                name: s.to_string(),
            }),
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

/// A named feature flag.
///
/// Only the parameters relevant to the flag's [`FeatureType`] are used:
/// `enabled` for constants, `percentage` for rollouts and `expression` for
/// expression flags. The compiled form of `expression` is computed on first
/// use and kept for the lifetime of this instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Flag {
    name: String,
    #[serde(rename = "type")]
    kind: FeatureType,
    #[serde(skip_serializing_if = "is_false")]
    enabled: bool,
    #[serde(skip_serializing_if = "is_zero")]
    percentage: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    expression: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(skip)]
    compiled: OnceCell<Expression>,
}

impl PartialEq for Flag {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.enabled == other.enabled
            && self.percentage == other.percentage
            && self.expression == other.expression
            && self.description == other.description
    }
}

impl Flag {
    pub fn new(name: impl Into<String>, kind: FeatureType) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Default::default()
        }
    }

    pub fn constant(name: impl Into<String>, enabled: bool) -> Self {
        Self::new(name, FeatureType::Constant).with_enabled(enabled)
    }

    pub fn percentage_based(name: impl Into<String>, percentage: i32) -> Self {
        Self::new(name, FeatureType::PercentageBased).with_percentage(percentage)
    }

    pub fn expression_based(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(name, FeatureType::Expression).with_expression(expression)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_percentage(mut self, percentage: i32) -> Self {
        self.percentage = percentage;
        self
    }

    /// Replaces the expression source and drops any compiled form.
    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = expression.into();
        self.compiled = OnceCell::new();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub(crate) fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FeatureType {
        self.kind
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn percentage(&self) -> i32 {
        self.percentage
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the compiled expression, parsing it on the first call only.
    /// A failed parse is not cached.
    pub fn compiled_expression(&self) -> std::result::Result<&Expression, ParseError> {
        self.compiled
            .get_or_try_init(|| Expression::compile(&self.expression))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(FeatureError::invalid(&self.name, InvalidReason::MissingName));
        }
        match self.kind {
            FeatureType::Constant => Ok(()),
            FeatureType::PercentageBased => {
                if (0..=100).contains(&self.percentage) {
                    Ok(())
                } else {
                    Err(FeatureError::invalid(
                        &self.name,
                        InvalidReason::PercentageOutOfRange(self.percentage),
                    ))
                }
            }
            FeatureType::Expression => {
                if self.expression.trim().is_empty() {
                    return Err(FeatureError::invalid(&self.name, InvalidReason::EmptyExpression));
                }
                self.compiled_expression()
                    .map(|_| ())
                    .map_err(|e| FeatureError::invalid(&self.name, InvalidReason::Uncompilable(e)))
            }
            FeatureType::Unknown => Err(FeatureError::UnknownType {
                name: self.name.clone(),
            }),
        }
    }

    /// Equivalent to `is_enabled_for` with no parameters.
    pub fn is_enabled(&self) -> Result<bool> {
        self.is_enabled_for(&Parameters::new())
    }

    pub fn is_enabled_for(&self, params: &Parameters) -> Result<bool> {
        self.is_enabled_with_rng(params, &mut rand::thread_rng())
    }

    /// Like [`Flag::is_enabled_for`], drawing percentage rollouts from `rng`.
    pub fn is_enabled_with_rng<R: Rng + ?Sized>(
        &self,
        params: &Parameters,
        rng: &mut R,
    ) -> Result<bool> {
        match self.kind {
            FeatureType::Constant => Ok(self.enabled),
            FeatureType::PercentageBased => Ok(rng.gen_range(0..100) < self.percentage),
            FeatureType::Expression => self
                .compiled_expression()
                .map_err(EvalError::from)
                .and_then(|expr| expr.evaluate_bool(params))
                .map_err(|source| FeatureError::Evaluation {
                    name: self.name.clone(),
                    source,
                }),
            FeatureType::Unknown => Err(FeatureError::UnknownType {
                name: self.name.clone(),
            }),
        }
    }
}
