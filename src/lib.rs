//! Runtime feature flags backed by a JSON file.
//!
//! A [`Registry`] holds named [`Flag`]s that are evaluated as constants,
//! percentage rollouts or boolean expressions over caller parameters. A
//! [`Watcher`] keeps the registry and its file in sync in both directions.
//!
//! ```
//! use flagwatch_lib::{Flag, Parameters, Registry, Value};
//!
//! let registry = Registry::new();
//! registry.set(Flag::constant("new-checkout", true)).unwrap();
//! registry
//!     .set(Flag::expression_based("beta-ui", "country in (\"NZ\", \"AU\") and age >= 18"))
//!     .unwrap();
//!
//! let params = Parameters::from([
//!     ("country".to_string(), Value::from("NZ")),
//!     ("age".to_string(), Value::from(30)),
//! ]);
//! assert!(registry.is_enabled("new-checkout", &params).unwrap());
//! assert!(registry.is_enabled("beta-ui", &params).unwrap());
//! ```

pub mod ast;
pub mod error;
pub mod eval;
pub mod feature;
pub mod jsonutil;
pub mod parse;
pub mod registry;
pub mod watch;

pub use ast::Value;
pub use error::{FeatureError, InvalidReason, Result};
pub use eval::{EvalError, Expression, Parameters};
pub use feature::{FeatureType, Flag};
pub use jsonutil::HtmlUnescaper;
pub use parse::{ParseError, MAX_DEPTH};
pub use registry::{FeatureList, Registry, SetOutcome};
pub use watch::{
    FsEvent, FsOp, Notifier, RecommendedNotifier, Subscription, WatchHandle, Watcher,
    DEFAULT_DEBOUNCE,
};
